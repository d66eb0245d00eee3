//! Entity resolution over one or two delimited files.
//!
//! A run loads each file into a [`loader::Dataset`], folds exact matches
//! out with [`exact`], lets a [`classifier::PairwiseClassifier`] handle the
//! residual records through the [`orchestrator`], and writes results back
//! against the untouched source rows with [`writer`].

pub mod classifier;
pub mod cluster;
pub mod dto;
pub mod error;
pub mod exact;
pub mod labeling;
pub mod loader;
pub mod logging;
pub mod orchestrator;
pub mod record;
pub mod response;
pub mod training;
pub mod util;
pub mod writer;

pub use error::{LinkageError, Result};
pub use orchestrator::{LinkageResult, Linker, RunOptions, TrainingMode};
