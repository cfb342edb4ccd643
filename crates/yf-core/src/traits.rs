//! Collaborator traits for yieldfit
//!
//! The extraction pipeline never touches files, pileup tables or output
//! formats directly. It talks to these traits, and `yf-io` provides the
//! concrete implementations.

use serde::{Deserialize, Serialize};

use crate::Result;

/// Columnar event provider (one per sample file).
pub trait EventSource {
    /// Total number of entries in `tree`.
    fn n_entries(&self, tree: &str) -> Result<usize>;

    /// Names of the branches available in `tree`, in storage order.
    fn branch_names(&self, tree: &str) -> Result<Vec<String>>;

    /// Values of `branch` as `f64`, optionally truncated to the first `entry_stop` entries.
    fn branch(&self, tree: &str, branch: &str, entry_stop: Option<usize>) -> Result<Vec<f64>>;

    /// Named scalar counter stored alongside the trees (e.g. the sum of
    /// generated weights). `Ok(None)` when the source has no such counter.
    fn counter(&self, name: &str) -> Result<Option<f64>>;

    /// Short description used in log messages.
    fn describe(&self) -> String;
}

/// Per-event pileup correction factors.
pub trait PileupReweight {
    /// Factor for each entry of `true_interactions`.
    fn reweight(&self, true_interactions: &[f64]) -> Result<Vec<f64>>;
}

/// Which output artifact a batch of histograms belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Signal counts and their errors.
    Yield,
    /// Confidence widths and their errors.
    Confidence,
}

/// One sample's array pair, flattened row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledArrays {
    /// Sample label.
    pub label: String,
    /// `[n_x]` for 1D, `[n_x, n_y]` for 2D.
    pub shape: Vec<usize>,
    /// Central values.
    pub values: Vec<f64>,
    /// Symmetric errors.
    pub errors: Vec<f64>,
}

/// Run-level metadata stored next to every artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    /// Primary variable name.
    pub variable: String,
    /// Primary bin edges.
    pub bins: Vec<f64>,
    /// Secondary variable name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yvariable: Option<String>,
    /// Secondary bin edges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ybins: Option<Vec<f64>>,
    /// Normalization mode.
    pub normalization: String,
    /// Normalization range `[low, high]` (mode `range`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normrange: Option<[f64; 2]>,
    /// Normalization variable name (mode `range`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normvariable: Option<String>,
    /// Applied normalization scale.
    pub scale: f64,
    /// Total simulation luminosity.
    pub lumi: f64,
    /// Background mode.
    pub bkgmode: String,
    /// Candidate tree name.
    pub treename: String,
}

/// Persistence collaborator.
pub trait ResultSink {
    /// Store one artifact: every sample's arrays plus shared metadata.
    fn write(&mut self, kind: ArtifactKind, arrays: &[LabeledArrays], meta: &ArtifactMeta)
    -> Result<()>;
}
