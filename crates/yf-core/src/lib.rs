//! # yf-core
//!
//! Shared foundation for yieldfit: the error type, bin edges and variable
//! descriptors, peak-extraction and fit result types, and the collaborator
//! traits (event source, pileup reweighting, persistence) the extraction
//! pipeline is written against.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::{
    ArtifactKind, ArtifactMeta, EventSource, LabeledArrays, PileupReweight, ResultSink,
};
pub use types::{BinEdges, FitResult, PeakEstimate, Variable, clip_non_negative};

/// Crate version, reported by `yieldfit version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
