//! # yf-io
//!
//! Concrete collaborators for the yieldfit pipeline: Parquet and in-memory
//! event sources, pileup ratio tables and the JSON artifact writer.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod artifact;
pub mod memory;
pub mod parquet_source;
pub mod pileup;

pub use artifact::{Artifact, JsonArtifactWriter, confidence_path, read_artifact};
pub use memory::MemoryEventSource;
pub use parquet_source::{ParquetEventSource, write_batch, write_counters, write_tree};
pub use pileup::{Campaign, PileupProfile, PileupTable};
