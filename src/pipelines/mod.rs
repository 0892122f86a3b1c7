//! # Ready-to-use adaptive classification pipeline
//!
//! End-to-end text classification with adaptive inference depth: inputs are
//! tokenized, converted to tensors and run through a classifier cascade where
//! each example leaves the model at the first head confident enough about it.
//! The pipeline decodes the reordered cascade output into per-example
//! predictions, probabilities and source heads, and offers a scoring entry
//! point computing accuracy and weighted cross-entropy against ground-truth
//! labels.

pub mod adaptive_classification;
