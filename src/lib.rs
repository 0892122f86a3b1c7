//! Adaptive-depth NLP classification built around two distillation models:
//! FastBERT's early-exit classifier cascade and TinyBERT's
//! knowledge-distillation loss composition. The neural network forward pass
//! itself stays behind the [`CascadeExecutor`] seam; this crate owns the
//! algorithmic bookkeeping around it: uncertainty scoring, cascade routing,
//! reordering of the flattened batch output stream and the classification
//! pipeline facade.

pub mod common;
pub mod fast_bert;
pub mod pipelines;
pub mod tiny_bert;

pub use common::config::Config;
pub use common::error::FastBertError;
pub use fast_bert::{
    CascadeConfig, CascadeExecutor, CascadeInput, CascadeSchedule, FastBertConfig, RenameMaps,
};
