// Copyright 2020 Tencent. All rights reserved.
// Copyright 2021 Guillaume Becquin
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::common::error::FastBertError;
use crate::fast_bert::uncertainty::{top_class_probability, uncertainty};
use ordered_float::OrderedFloat;
use std::collections::BTreeSet;

/// # Per-call cascade configuration
/// Immutable pair of early-exit threshold and ignored classifier heads. A new
/// value is passed on every `predict`/`score`/`export` call rather than being
/// mutated on the pipeline, so cached schedules can be keyed by its hash.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeConfig {
    speed: f64,
    ignore_heads: BTreeSet<usize>,
}

impl CascadeConfig {
    /// Create a configuration from an early-exit threshold and a list of
    /// classifier-head indices to skip.
    ///
    /// # Arguments
    ///
    /// * `speed` - Uncertainty threshold for leaving the model in advance, within `[0, 1]`.
    ///   Larger values let more examples exit at shallow heads.
    /// * `ignore_heads` - Indices of classifier heads to skip entirely. The more heads
    ///   ignored, the faster inference is.
    pub fn new(speed: f64, ignore_heads: &[usize]) -> Result<CascadeConfig, FastBertError> {
        if !(0.0..=1.0).contains(&speed) {
            return Err(FastBertError::InvalidConfigurationError(format!(
                "`speed` must be within [0, 1], got {}",
                speed
            )));
        }
        Ok(CascadeConfig {
            speed,
            ignore_heads: ignore_heads.iter().cloned().collect(),
        })
    }

    /// Create a configuration with the ignored heads given as a comma-separated
    /// string of integers, e.g. `"0,3,6"`. An empty string ignores no head.
    pub fn from_ignore_spec(speed: f64, ignore_spec: &str) -> Result<CascadeConfig, FastBertError> {
        let mut ignore_heads = Vec::new();
        for field in ignore_spec.split(',') {
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            let head = field.parse::<usize>().map_err(|_| {
                FastBertError::InvalidConfigurationError(format!(
                    "Invalid classifier head index `{}` in ignore specification `{}`",
                    field, ignore_spec
                ))
            })?;
            ignore_heads.push(head);
        }
        CascadeConfig::new(speed, &ignore_heads)
    }

    /// Early-exit uncertainty threshold.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Ignored classifier-head indices, sorted and deduplicated.
    pub fn ignore_heads(&self) -> &BTreeSet<usize> {
        &self.ignore_heads
    }

    /// Hashable key identifying this configuration, used to cache derived
    /// execution schedules.
    pub fn cache_key(&self) -> (OrderedFloat<f64>, Vec<usize>) {
        (
            OrderedFloat(self.speed),
            self.ignore_heads.iter().cloned().collect(),
        )
    }
}

/// # Classifier-cascade schedule
/// The ordered list of classifier heads visited by the adaptive cascade for a
/// given model depth and `CascadeConfig`, together with the resolution
/// predicate deciding when an example leaves the cascade.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeSchedule {
    keep_heads: Vec<usize>,
    speed: f64,
    label_size: usize,
}

impl CascadeSchedule {
    /// Derive the schedule for a model with `num_hidden_layers` encoder layers.
    /// The model carries one classifier head per encoder layer plus the output
    /// head, i.e. heads `0..=num_hidden_layers`, visited in order minus the
    /// ignored ones.
    pub fn new(
        num_hidden_layers: usize,
        label_size: usize,
        config: &CascadeConfig,
    ) -> Result<CascadeSchedule, FastBertError> {
        if label_size == 0 {
            return Err(FastBertError::MissingConfigurationError(
                "`label_size` must be set to a non-zero number of classes".into(),
            ));
        }
        let num_heads = num_hidden_layers + 1;
        if let Some(&out_of_range) = config
            .ignore_heads()
            .iter()
            .find(|&&head| head >= num_heads)
        {
            return Err(FastBertError::InvalidConfigurationError(format!(
                "Ignored classifier head {} out of range for a model with {} heads",
                out_of_range, num_heads
            )));
        }
        let keep_heads: Vec<usize> = (0..num_heads)
            .filter(|head| !config.ignore_heads().contains(head))
            .collect();
        if keep_heads.is_empty() {
            return Err(FastBertError::InvalidConfigurationError(format!(
                "All {} classifier heads are ignored, at least one head must remain",
                num_heads
            )));
        }
        Ok(CascadeSchedule {
            keep_heads,
            speed: config.speed(),
            label_size,
        })
    }

    /// Classifier heads visited by the cascade, in visiting order.
    pub fn keep_heads(&self) -> &[usize] {
        &self.keep_heads
    }

    /// Number of cascade iterations, equal to the number of kept heads.
    pub fn max_loop(&self) -> usize {
        self.keep_heads.len()
    }

    /// Number of classes.
    pub fn label_size(&self) -> usize {
        self.label_size
    }

    /// Early-exit uncertainty threshold.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Resolution predicate: an example leaves the cascade when its
    /// uncertainty falls below the threshold, and unconditionally on the last
    /// kept head. This is the only place the predicate is evaluated.
    pub fn resolves(&self, probs: &[f64], loop_index: usize) -> bool {
        loop_index == self.max_loop() - 1
            || uncertainty(top_class_probability(probs), self.label_size) < self.speed
    }
}

/// One consumed probability vector of the flattened cascade output stream,
/// with the routing decision made for it.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRecord {
    /// Original position of the example within the batch.
    pub example: usize,
    /// Classifier head that produced the probability vector.
    pub head: usize,
    /// True when the example left the cascade at this head.
    pub resolved: bool,
    /// Probability vector produced by the head for this example.
    pub probs: Vec<f64>,
}

/// Replay the cascade schedule over the flattened output stream of one batch
/// and emit an explicit decision log.
///
/// The execution engine emits one probability vector per
/// `(device, iteration, still-unfinished example)` triple, nested in exactly
/// that order. Each device shard starts with all its examples unfinished and
/// carries the undecided ones to the next kept head. Downstream assembly works
/// off the returned records and never re-evaluates the uncertainty predicate.
///
/// Fails with `InternalConsistencyError` when the stream length disagrees with
/// the schedule: every produced vector must be consumed exactly once.
pub fn route_cascade_outputs(
    schedule: &CascadeSchedule,
    batch_probs: &[Vec<f64>],
    batch_size: usize,
    num_devices: usize,
) -> Result<Vec<DecisionRecord>, FastBertError> {
    if num_devices == 0 {
        return Err(FastBertError::InvalidConfigurationError(
            "`num_devices` must be at least 1".into(),
        ));
    }
    if batch_size % num_devices != 0 {
        return Err(FastBertError::InvalidConfigurationError(format!(
            "Batch size {} is not divisible across {} devices",
            batch_size, num_devices
        )));
    }
    let shard_size = batch_size / num_devices;
    let mut records = Vec::with_capacity(batch_probs.len());
    let mut consumed = 0;

    for device in 0..num_devices {
        let mut unfinished: Vec<usize> =
            (device * shard_size..(device + 1) * shard_size).collect();

        for loop_index in 0..schedule.max_loop() {
            let head = schedule.keep_heads()[loop_index];
            let mut next_unfinished = Vec::new();

            for &example in &unfinished {
                let probs = batch_probs.get(consumed).ok_or_else(|| {
                    FastBertError::InternalConsistencyError(format!(
                        "Cascade output stream exhausted after {} vectors, \
                         expected one for example {} at head {}",
                        consumed, example, head
                    ))
                })?;
                if probs.len() != schedule.label_size() {
                    return Err(FastBertError::InternalConsistencyError(format!(
                        "Probability vector of width {} at stream position {}, \
                         expected label size {}",
                        probs.len(),
                        consumed,
                        schedule.label_size()
                    )));
                }
                let resolved = schedule.resolves(probs, loop_index);
                if !resolved {
                    next_unfinished.push(example);
                }
                records.push(DecisionRecord {
                    example,
                    head,
                    resolved,
                    probs: probs.clone(),
                });
                consumed += 1;
            }
            unfinished = next_unfinished;
            if unfinished.is_empty() {
                break;
            }
        }
    }
    if consumed != batch_probs.len() {
        return Err(FastBertError::InternalConsistencyError(format!(
            "Consumed {} cascade output vectors but the execution engine produced {}",
            consumed,
            batch_probs.len()
        )));
    }
    Ok(records)
}
