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

//! # Adaptive classification pipeline
//! Single-label classifier on FastBERT, a distillation model with one
//! classifier head per encoder layer. Inference queries the heads in order
//! and each example leaves the cascade at the first head whose uncertainty
//! clears the `speed` threshold.
//!
//! ```no_run
//! use rust_fastbert::pipelines::adaptive_classification::{
//!     AdaptiveClassificationConfig, FastBertClassifier,
//! };
//! use rust_fastbert::CascadeConfig;
//! # use rust_fastbert::{CascadeExecutor, CascadeInput, CascadeSchedule, RenameMaps};
//! # use rust_fastbert::FastBertError;
//! # struct Engine;
//! # impl CascadeExecutor for Engine {
//! #     fn num_devices(&self) -> usize { 1 }
//! #     fn forward_cascade(
//! #         &self,
//! #         _input: &CascadeInput,
//! #         _schedule: &CascadeSchedule,
//! #     ) -> Result<Vec<Vec<f64>>, FastBertError> { Ok(vec![]) }
//! #     fn export(
//! #         &self,
//! #         _path: &std::path::Path,
//! #         _schedule: &CascadeSchedule,
//! #         _rename_maps: &RenameMaps,
//! #     ) -> Result<(), FastBertError> { Ok(()) }
//! # }
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = AdaptiveClassificationConfig::new("path/to/config.json", "path/to/vocab.txt", 2);
//! let mut classifier = FastBertClassifier::new(config, Engine)?;
//! let cascade = CascadeConfig::from_ignore_spec(0.1, "0")?;
//! let output = classifier.predict(&["This is a positive review."], 8, &cascade)?;
//! # Ok(())
//! # }
//! ```

use crate::common::error::FastBertError;
use crate::fast_bert::{
    permute_cascade_outputs, stack_truncate, BatchResults, CascadeConfig, CascadeExecutor,
    CascadeInput, CascadeSchedule, FastBertConfig, RenameMaps,
};
use crate::Config;
use ordered_float::OrderedFloat;
use rust_tokenizers::tokenizer::{BertTokenizer, MultiThreadedTokenizer, TruncationStrategy};
use rust_tokenizers::vocab::BertVocab;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tch::{no_grad, Device, Tensor};

/// # Configuration for the adaptive classification pipeline
/// Points to the model configuration and vocabulary on disk and fixes the
/// tokenization and output geometry.
pub struct AdaptiveClassificationConfig {
    /// Model configuration file (config.json)
    pub config_path: PathBuf,
    /// Vocabulary file (vocab.txt)
    pub vocab_path: PathBuf,
    /// Lower-case all input upon tokenization (assumes a lower-cased model)
    pub lower_case: bool,
    /// Strip accents during tokenization, defaults to `lower_case`
    pub strip_accents: Option<bool>,
    /// Maximum sequence length, longer inputs are truncated
    pub max_seq_length: usize,
    /// Number of classes, must be non-zero
    pub label_size: usize,
    /// Device the input tensors are placed on
    pub device: Device,
}

impl AdaptiveClassificationConfig {
    /// Create a pipeline configuration with default tokenization settings
    /// (lower-cased input, sequences truncated at 128 tokens).
    pub fn new<P: Into<PathBuf>>(
        config_path: P,
        vocab_path: P,
        label_size: usize,
    ) -> AdaptiveClassificationConfig {
        AdaptiveClassificationConfig {
            config_path: config_path.into(),
            vocab_path: vocab_path.into(),
            lower_case: true,
            strip_accents: None,
            max_seq_length: 128,
            label_size,
            device: Device::cuda_if_available(),
        }
    }
}

/// Model outputs of one inference call, indexed by original input position.
#[derive(Debug)]
pub struct ClassifierOutput {
    /// Predicted class id per input
    pub preds: Vec<i64>,
    /// Predicted label strings, when the model configuration carries an
    /// `id2label` mapping
    pub labels: Option<Vec<String>>,
    /// Probability vector per input
    pub probs: Vec<Vec<f64>>,
    /// Classifier head that produced each input's result
    pub sources: Vec<usize>,
}

/// Output metrics of one scoring call.
#[derive(Debug)]
pub struct ScoreOutput {
    /// Share of inputs whose predicted class matches the ground truth
    pub accuracy: f64,
    /// Mean sample-weighted cross-entropy of the ground-truth class
    pub loss: f64,
}

/// # Classifier facade over an adaptive cascade execution engine
/// Orchestrates tokenization, tensor conversion, the forward pass through a
/// [`CascadeExecutor`] and the permutation of the flattened cascade output
/// back into per-example order. Derived cascade schedules are cached keyed by
/// the per-call `CascadeConfig` hash.
pub struct FastBertClassifier<E: CascadeExecutor> {
    tokenizer: BertTokenizer,
    executor: E,
    model_config: FastBertConfig,
    label_size: usize,
    max_seq_length: usize,
    device: Device,
    pad_id: i64,
    schedule_cache: HashMap<(OrderedFloat<f64>, Vec<usize>), CascadeSchedule>,
}

impl<E: CascadeExecutor> FastBertClassifier<E> {
    /// Build a new `FastBertClassifier` from a pipeline configuration and an
    /// execution engine.
    ///
    /// Fails with `MissingConfigurationError` when `label_size` is zero and
    /// with a `TokenizerError` when the vocabulary cannot be loaded or lacks
    /// the `[CLS]`/`[SEP]`/`[PAD]` special tokens.
    pub fn new(
        config: AdaptiveClassificationConfig,
        executor: E,
    ) -> Result<FastBertClassifier<E>, FastBertError> {
        if config.label_size == 0 {
            return Err(FastBertError::MissingConfigurationError(
                "`label_size` must be set to a non-zero number of classes".into(),
            ));
        }
        let model_config = FastBertConfig::from_file(&config.config_path)?;
        let vocab_path = config.vocab_path.to_str().ok_or_else(|| {
            FastBertError::InvalidConfigurationError(format!(
                "Vocabulary path {:?} is not valid unicode",
                config.vocab_path
            ))
        })?;
        let tokenizer = BertTokenizer::from_file(
            vocab_path,
            config.lower_case,
            config.strip_accents.unwrap_or(config.lower_case),
        )?;
        let pad_id = special_token_id(&tokenizer, BertVocab::pad_value())?;
        special_token_id(&tokenizer, BertVocab::cls_value())?;
        special_token_id(&tokenizer, BertVocab::sep_value())?;
        Ok(FastBertClassifier {
            tokenizer,
            executor,
            model_config,
            label_size: config.label_size,
            max_seq_length: config.max_seq_length,
            device: config.device,
            pad_id,
            schedule_cache: HashMap::new(),
        })
    }

    /// Classify texts through the adaptive cascade.
    ///
    /// # Arguments
    ///
    /// * `inputs` - Texts to classify.
    /// * `batch_size` - Number of examples per forward pass, shrunk and
    ///   rounded to the device count when fewer inputs are given.
    /// * `cascade_config` - Early-exit threshold and ignored heads for this
    ///   call.
    ///
    /// # Returns
    /// * `ClassifierOutput` with predictions, probabilities and the head each
    ///   example exited at, in input order.
    pub fn predict(
        &mut self,
        inputs: &[&str],
        batch_size: usize,
        cascade_config: &CascadeConfig,
    ) -> Result<ClassifierOutput, FastBertError> {
        let results = self.infer(inputs, batch_size, cascade_config)?;
        let preds = argmax_rows(&results.probs);
        let labels = match &self.model_config.id2label {
            Some(mapping) => Some(
                preds
                    .iter()
                    .map(|pred| {
                        mapping.get(pred).cloned().ok_or_else(|| {
                            FastBertError::InvalidConfigurationError(format!(
                                "No label mapped to predicted class id {}",
                                pred
                            ))
                        })
                    })
                    .collect::<Result<Vec<String>, FastBertError>>()?,
            ),
            None => None,
        };
        Ok(ClassifierOutput {
            preds,
            labels,
            probs: results.probs,
            sources: results.sources,
        })
    }

    /// Classify texts and score the predictions against ground-truth labels.
    ///
    /// # Arguments
    ///
    /// * `inputs` - Texts to classify.
    /// * `labels` - Ground-truth class id per input.
    /// * `sample_weight` - Optional per-example loss weight, defaults to 1.
    /// * `batch_size` - Number of examples per forward pass.
    /// * `cascade_config` - Early-exit threshold and ignored heads for this
    ///   call.
    pub fn score(
        &mut self,
        inputs: &[&str],
        labels: &[i64],
        sample_weight: Option<&[f64]>,
        batch_size: usize,
        cascade_config: &CascadeConfig,
    ) -> Result<ScoreOutput, FastBertError> {
        if labels.len() != inputs.len() {
            return Err(FastBertError::InvalidConfigurationError(format!(
                "Got {} labels for {} inputs",
                labels.len(),
                inputs.len()
            )));
        }
        if let Some(weights) = sample_weight {
            if weights.len() != inputs.len() {
                return Err(FastBertError::InvalidConfigurationError(format!(
                    "Got {} sample weights for {} inputs",
                    weights.len(),
                    inputs.len()
                )));
            }
        }
        let results = self.infer(inputs, batch_size, cascade_config)?;
        let preds = argmax_rows(&results.probs);
        let mut correct = 0usize;
        let mut loss_sum = 0f64;
        for (position, (&label, probs)) in labels.iter().zip(results.probs.iter()).enumerate() {
            let target_prob = probs.get(label as usize).ok_or_else(|| {
                FastBertError::InvalidConfigurationError(format!(
                    "Label {} out of range for {} classes",
                    label, self.label_size
                ))
            })?;
            if preds[position] == label {
                correct += 1;
            }
            let weight = sample_weight.map_or(1.0, |weights| weights[position]);
            loss_sum += -target_prob.max(f64::MIN_POSITIVE).ln() * weight;
        }
        let count = inputs.len().max(1) as f64;
        Ok(ScoreOutput {
            accuracy: correct as f64 / count,
            loss: loss_sum / count,
        })
    }

    /// Export the inference graph for the given cascade configuration.
    pub fn export(
        &mut self,
        path: &Path,
        cascade_config: &CascadeConfig,
        rename_maps: &RenameMaps,
    ) -> Result<(), FastBertError> {
        let schedule = self.schedule(cascade_config)?;
        self.executor.export(path, &schedule, rename_maps)
    }

    fn infer(
        &mut self,
        inputs: &[&str],
        batch_size: usize,
        cascade_config: &CascadeConfig,
    ) -> Result<BatchResults, FastBertError> {
        let schedule = self.schedule(cascade_config)?;
        let num_devices = self.executor.num_devices().max(1);
        let batch_size = self.effective_batch_size(batch_size, inputs.len(), num_devices)?;
        let batches = self.prepare_batches(inputs, batch_size)?;
        let mut results = Vec::with_capacity(batches.len());
        for batch in &batches {
            let stream = no_grad(|| self.executor.forward_cascade(batch, &schedule))?;
            results.push(permute_cascade_outputs(
                &schedule,
                &stream,
                batch_size,
                num_devices,
            )?);
        }
        stack_truncate(results, inputs.len())
    }

    fn schedule(&mut self, cascade_config: &CascadeConfig) -> Result<CascadeSchedule, FastBertError> {
        let key = cascade_config.cache_key();
        if let Some(schedule) = self.schedule_cache.get(&key) {
            return Ok(schedule.clone());
        }
        log::debug!(
            "Schedule cache miss for speed {} with {} ignored heads",
            cascade_config.speed(),
            cascade_config.ignore_heads().len()
        );
        let schedule = CascadeSchedule::new(
            self.model_config.num_hidden_layers as usize,
            self.label_size,
            cascade_config,
        )?;
        self.schedule_cache.insert(key, schedule.clone());
        Ok(schedule)
    }

    fn effective_batch_size(
        &self,
        requested: usize,
        n_inputs: usize,
        num_devices: usize,
    ) -> Result<usize, FastBertError> {
        if requested == 0 {
            return Err(FastBertError::InvalidConfigurationError(
                "`batch_size` must be at least 1".into(),
            ));
        }
        let mut batch_size = requested.min(n_inputs.max(num_devices));
        let remainder = batch_size % num_devices;
        if remainder != 0 {
            batch_size += num_devices - remainder;
        }
        if batch_size != requested {
            log::info!(
                "Adjusted batch size from {} to {} for {} inputs on {} devices",
                requested,
                batch_size,
                n_inputs,
                num_devices
            );
        }
        Ok(batch_size)
    }

    fn prepare_batches(
        &self,
        inputs: &[&str],
        batch_size: usize,
    ) -> Result<Vec<CascadeInput>, FastBertError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let tokenized = MultiThreadedTokenizer::encode_list(
            &self.tokenizer,
            inputs,
            self.max_seq_length,
            &TruncationStrategy::LongestFirst,
            0,
        );
        let max_len = tokenized
            .iter()
            .map(|input| input.token_ids.len())
            .max()
            .unwrap_or(1)
            .max(1);

        let mut id_rows = Vec::with_capacity(inputs.len());
        let mut mask_rows = Vec::with_capacity(inputs.len());
        let mut segment_rows = Vec::with_capacity(inputs.len());
        for input in tokenized {
            let mut ids = input.token_ids;
            let mut mask = vec![1i64; ids.len()];
            let mut segments: Vec<i64> =
                input.segment_ids.iter().map(|&id| i64::from(id)).collect();
            ids.resize(max_len, self.pad_id);
            mask.resize(max_len, 0);
            segments.resize(max_len, 0);
            id_rows.push(ids);
            mask_rows.push(mask);
            segment_rows.push(segments);
        }
        // pad the trailing partial batch with empty rows, dropped again by
        // stack_truncate
        while id_rows.len() % batch_size != 0 {
            id_rows.push(vec![self.pad_id; max_len]);
            mask_rows.push(vec![0i64; max_len]);
            segment_rows.push(vec![0i64; max_len]);
        }

        let mut batches = Vec::with_capacity(id_rows.len() / batch_size);
        for batch_index in 0..id_rows.len() / batch_size {
            let range = batch_index * batch_size..(batch_index + 1) * batch_size;
            batches.push(CascadeInput {
                input_ids: stack_rows(&id_rows[range.clone()], self.device),
                input_mask: stack_rows(&mask_rows[range.clone()], self.device),
                segment_ids: stack_rows(&segment_rows[range], self.device),
            });
        }
        Ok(batches)
    }
}

fn stack_rows(rows: &[Vec<i64>], device: Device) -> Tensor {
    let tensors = rows
        .iter()
        .map(|row| Tensor::of_slice(row))
        .collect::<Vec<_>>();
    Tensor::stack(tensors.as_slice(), 0).to(device)
}

fn argmax_rows(probs: &[Vec<f64>]) -> Vec<i64> {
    probs
        .iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .max_by(|(_, left), (_, right)| {
                    left.partial_cmp(right).unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(index, _)| index as i64)
                .unwrap_or(0)
        })
        .collect()
}

fn special_token_id(tokenizer: &BertTokenizer, token: &str) -> Result<i64, FastBertError> {
    MultiThreadedTokenizer::vocab(tokenizer)
        .special_values
        .get(token)
        .cloned()
        .ok_or_else(|| {
            FastBertError::TokenizerError(format!("`{}` token not found in vocabulary", token))
        })
}
