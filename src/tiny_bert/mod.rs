//! # TinyBERT: Distilling BERT for Natural Language Understanding (Jiao et al.)
//!
//! Knowledge-distillation loss composition for a teacher/student pair of BERT
//! encoders: the student mimics the teacher's embedding output, attention
//! scores, hidden states and prediction distribution, each contributing one
//! term to the training loss. The encoders themselves live behind
//! [`EncoderFeatures`]; this module only composes the losses.

mod distillation;

pub use distillation::{
    attention_loss, distillation_loss, embedding_loss, hidden_loss, prediction_loss,
    ClassificationMode, DistillationLosses, EncoderFeatures,
};
