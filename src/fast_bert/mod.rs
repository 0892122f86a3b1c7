//! # FastBERT: a Self-distilling BERT with Adaptive Inference Time (Liu et al.)
//!
//! Adaptive-depth inference for a BERT classifier with one classifier head per
//! encoder layer plus the output head. At inference time the cascade of heads
//! is queried in order and each example leaves the model at the first head
//! whose normalized-entropy uncertainty falls below the `speed` threshold,
//! with a forced exit at the deepest kept head.
//!
//! The network forward pass is delegated to a [`CascadeExecutor`]
//! implementation; this module owns the cascade bookkeeping around it:
//! - `uncertainty`: the normalized-entropy confidence proxy
//! - `cascade`: the per-call configuration, head schedule and the router that
//!   replays the flattened execution stream into an explicit decision log
//! - `permutation`: reassembly of the layer-major output stream back into
//!   per-example order

mod cascade;
mod fast_bert_model;
mod permutation;
mod uncertainty;

pub use cascade::{route_cascade_outputs, CascadeConfig, CascadeSchedule, DecisionRecord};
pub use fast_bert_model::{CascadeExecutor, CascadeInput, FastBertConfig, RenameMaps};
pub use permutation::{
    permute_cascade_outputs, restore_example_order, stack_truncate, BatchResults,
};
pub use uncertainty::{top_class_probability, uncertainty};
