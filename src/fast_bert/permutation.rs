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

//! Reassembly of the flattened, layer-major cascade output stream into
//! per-example order. The execution engine only supports static-shape batches
//! per layer, so early-exited results arrive ordered by
//! `(device, iteration, unfinished position)` rather than by example; the
//! routines here restore the original batch order from the router's decision
//! log.

use crate::common::error::FastBertError;
use crate::fast_bert::cascade::{route_cascade_outputs, CascadeSchedule, DecisionRecord};

/// Final per-example results of one batch: probability vectors and the
/// classifier head that produced each of them, indexed by original batch
/// position.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResults {
    pub probs: Vec<Vec<f64>>,
    pub sources: Vec<usize>,
}

/// Scatter the resolved records of a decision log into per-example tables.
///
/// Every batch position must be written exactly once; a duplicate or a gap
/// means the router and the execution engine disagreed on the cascade
/// schedule and is surfaced as an `InternalConsistencyError`.
pub fn restore_example_order(
    records: &[DecisionRecord],
    batch_size: usize,
    label_size: usize,
) -> Result<BatchResults, FastBertError> {
    let mut probs = vec![vec![0f64; label_size]; batch_size];
    let mut sources = vec![0usize; batch_size];
    let mut written = vec![false; batch_size];

    for record in records.iter().filter(|record| record.resolved) {
        if record.example >= batch_size {
            return Err(FastBertError::InternalConsistencyError(format!(
                "Resolved example index {} out of range for batch size {}",
                record.example, batch_size
            )));
        }
        if written[record.example] {
            return Err(FastBertError::InternalConsistencyError(format!(
                "Example {} resolved twice, at head {} after an earlier head",
                record.example, record.head
            )));
        }
        probs[record.example] = record.probs.clone();
        sources[record.example] = record.head;
        written[record.example] = true;
    }
    if let Some(gap) = written.iter().position(|&done| !done) {
        return Err(FastBertError::InternalConsistencyError(format!(
            "Example {} was never resolved by the cascade",
            gap
        )));
    }
    Ok(BatchResults { probs, sources })
}

/// Invert one batch of the flattened execution-order stream back into
/// per-example order: route the stream into a decision log, then scatter the
/// resolved entries.
pub fn permute_cascade_outputs(
    schedule: &CascadeSchedule,
    batch_probs: &[Vec<f64>],
    batch_size: usize,
    num_devices: usize,
) -> Result<BatchResults, FastBertError> {
    let records = route_cascade_outputs(schedule, batch_probs, batch_size, num_devices)?;
    restore_example_order(&records, batch_size, schedule.label_size())
}

/// Concatenate per-batch result tables in batch order and truncate to the true
/// input count. The execution engine pads the last batch to a fixed size; the
/// first `n_inputs` rows are the real ones and the padding tail is dropped.
pub fn stack_truncate(
    batches: Vec<BatchResults>,
    n_inputs: usize,
) -> Result<BatchResults, FastBertError> {
    let mut probs = Vec::with_capacity(n_inputs);
    let mut sources = Vec::with_capacity(n_inputs);
    for batch in batches {
        probs.extend(batch.probs);
        sources.extend(batch.sources);
    }
    if probs.len() < n_inputs {
        return Err(FastBertError::InternalConsistencyError(format!(
            "Execution engine returned {} rows for {} inputs",
            probs.len(),
            n_inputs
        )));
    }
    probs.truncate(n_inputs);
    sources.truncate(n_inputs);
    Ok(BatchResults { probs, sources })
}
