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
use crate::fast_bert::cascade::CascadeSchedule;
use crate::Config;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tch::Tensor;

/// # FastBERT model configuration
/// Defines the model geometry the cascade schedule and the distillation losses
/// are derived from. Expected to have a structure following the BERT
/// configuration files of the [Transformers library](https://github.com/huggingface/transformers).
#[derive(Debug, Serialize, Deserialize)]
pub struct FastBertConfig {
    pub vocab_size: i64,
    pub hidden_size: i64,
    pub num_hidden_layers: i64,
    pub num_attention_heads: i64,
    pub intermediate_size: i64,
    pub max_position_embeddings: i64,
    pub type_vocab_size: i64,
    pub initializer_range: f64,
    pub hidden_dropout_prob: Option<f64>,
    pub attention_probs_dropout_prob: Option<f64>,
    pub id2label: Option<HashMap<i64, String>>,
    pub label2id: Option<HashMap<String, i64>>,
}

impl Config<FastBertConfig> for FastBertConfig {}

/// Input tensors of one forward pass, one row per example of the (padded)
/// batch.
pub struct CascadeInput {
    /// Token ids, shape `[batch_size, sequence_length]`
    pub input_ids: Tensor,
    /// Attention mask, 1 for real tokens and 0 for padding
    pub input_mask: Tensor,
    /// Segment ids (all zero for single-sentence classification)
    pub segment_ids: Tensor,
}

/// Name mappings applied when exporting the model graph.
#[derive(Debug, Clone, Default)]
pub struct RenameMaps {
    /// Mapping of original input names to target names
    pub inputs: HashMap<String, String>,
    /// Mapping of original output names to target names
    pub outputs: HashMap<String, String>,
    /// Names of outputs to leave out of the exported graph
    pub ignore_outputs: Vec<String>,
}

/// # Execution engine running the classifier cascade
/// The network forward pass itself (embeddings, encoder layers, classifier
/// heads) lives behind this seam. For each device shard and cascade iteration
/// the engine evaluates the scheduled head on the examples still unfinished on
/// that device and appends one probability vector per example to the output
/// stream, in `(device, iteration, unfinished position)` order, exactly as
/// `route_cascade_outputs` expects to consume it.
pub trait CascadeExecutor {
    /// Number of data-parallel device shards the batch is split across.
    fn num_devices(&self) -> usize;

    /// Run the cascade forward pass and return the flattened output stream.
    fn forward_cascade(
        &self,
        input: &CascadeInput,
        schedule: &CascadeSchedule,
    ) -> Result<Vec<Vec<f64>>, FastBertError>;

    /// Export the inference graph for the given schedule.
    fn export(
        &self,
        path: &Path,
        schedule: &CascadeSchedule,
        rename_maps: &RenameMaps,
    ) -> Result<(), FastBertError>;
}
