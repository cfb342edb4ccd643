//! Common data types for yieldfit

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Strictly increasing, finite bin edges (at least two).
///
/// Bins are left-closed and right-open, except the last bin which also
/// contains the upper edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct BinEdges(Vec<f64>);

impl BinEdges {
    /// Validate and wrap an edge sequence.
    pub fn new(edges: Vec<f64>) -> Result<Self> {
        if edges.len() < 2 {
            return Err(Error::Config(format!(
                "binning needs at least 2 edges, got {}",
                edges.len()
            )));
        }
        if let Some(bad) = edges.iter().find(|e| !e.is_finite()) {
            return Err(Error::Config(format!("bin edge {bad} is not finite")));
        }
        if let Some(w) = edges.windows(2).find(|w| w[1] <= w[0]) {
            return Err(Error::Config(format!(
                "bin edges must be strictly increasing ({} followed by {})",
                w[0], w[1]
            )));
        }
        Ok(Self(edges))
    }

    /// `n_bins` equal-width bins over `[low, high]`.
    pub fn uniform(n_bins: usize, low: f64, high: f64) -> Result<Self> {
        if n_bins == 0 {
            return Err(Error::Config("uniform binning needs at least one bin".into()));
        }
        let step = (high - low) / n_bins as f64;
        let mut edges: Vec<f64> = (0..n_bins).map(|i| low + step * i as f64).collect();
        edges.push(high);
        Self::new(edges)
    }

    /// Edge values.
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    /// Number of bins (`len(edges) - 1`).
    pub fn n_bins(&self) -> usize {
        self.0.len() - 1
    }

    /// Lower edge of the first bin.
    pub fn low(&self) -> f64 {
        self.0[0]
    }

    /// Upper edge of the last bin.
    pub fn high(&self) -> f64 {
        self.0[self.0.len() - 1]
    }

    /// Full range covered by the binning.
    pub fn span(&self) -> f64 {
        self.high() - self.low()
    }

    /// Width of bin `i`.
    pub fn width(&self, i: usize) -> f64 {
        self.0[i + 1] - self.0[i]
    }

    /// Centre of bin `i`.
    pub fn center(&self, i: usize) -> f64 {
        0.5 * (self.0[i] + self.0[i + 1])
    }

    /// All bin centres.
    pub fn centers(&self) -> Vec<f64> {
        (0..self.n_bins()).map(|i| self.center(i)).collect()
    }

    /// Whether `x` lies in the closed range `[low, high]`.
    pub fn contains(&self, x: f64) -> bool {
        x >= self.low() && x <= self.high()
    }

    /// Bin index holding `x`, or `None` outside `[low, high]` (and for NaN).
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        if !self.contains(x) {
            return None;
        }
        // partition_point gives the number of edges <= x.
        let idx = self.0.partition_point(|&e| e <= x);
        Some(idx.saturating_sub(1).min(self.n_bins() - 1))
    }

    /// Single-bin binning spanning the same range (first and last edge only).
    pub fn collapsed(&self) -> Self {
        Self(vec![self.low(), self.high()])
    }
}

impl TryFrom<Vec<f64>> for BinEdges {
    type Error = Error;

    fn try_from(edges: Vec<f64>) -> Result<Self> {
        Self::new(edges)
    }
}

impl From<BinEdges> for Vec<f64> {
    fn from(edges: BinEdges) -> Self {
        edges.0
    }
}

/// Variable descriptor: which column to read and how to bin it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Human-readable identifier written to output metadata.
    #[serde(default)]
    pub name: String,
    /// Column (branch) holding the per-event values.
    #[serde(rename = "variable")]
    pub branch: String,
    /// Axis label.
    #[serde(default)]
    pub label: String,
    /// Bin edges.
    pub bins: BinEdges,
}

impl Variable {
    /// Create a descriptor whose display name equals the branch name.
    pub fn new(branch: impl Into<String>, bins: BinEdges) -> Self {
        let branch = branch.into();
        Self { name: branch.clone(), branch, label: String::new(), bins }
    }

    /// Set the axis label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Name used in output metadata (falls back to the branch name).
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.branch } else { &self.name }
    }
}

/// Outcome of a sideband peak extraction for one aggregation cell.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PeakEstimate {
    /// Background-subtracted signal count.
    pub signal: f64,
    /// Uncertainty on `signal`.
    pub signal_error: f64,
    /// Fitted single-Gaussian peak width.
    pub confidence: f64,
    /// Uncertainty on `confidence`.
    pub confidence_error: f64,
}

impl PeakEstimate {
    /// All-zero estimate (empty or degenerate cells).
    pub fn zero() -> Self {
        Self::default()
    }
}

/// `max(x, 0)`, mapping NaN to 0.
pub fn clip_non_negative(x: f64) -> f64 {
    if x > 0.0 { x } else { 0.0 }
}

/// Least-squares fit result containing parameter estimates and uncertainties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Best-fit parameter values
    pub parameters: Vec<f64>,

    /// Parameter uncertainties (sqrt of covariance diagonal)
    pub uncertainties: Vec<f64>,

    /// Covariance matrix (row-major, N×N). `None` if the normal matrix could not be inverted.
    pub covariance: Option<Vec<f64>>,

    /// Weighted sum of squared residuals at the minimum
    pub chi2: f64,

    /// Number of fitted points minus number of parameters
    pub ndf: i64,

    /// Convergence status
    pub converged: bool,

    /// Number of objective evaluations
    pub n_evaluations: usize,
}

impl FitResult {
    /// Create a new fit result
    pub fn new(
        parameters: Vec<f64>,
        uncertainties: Vec<f64>,
        chi2: f64,
        ndf: i64,
        converged: bool,
        n_evaluations: usize,
    ) -> Self {
        Self { parameters, uncertainties, covariance: None, chi2, ndf, converged, n_evaluations }
    }

    /// Attach a row-major covariance matrix
    pub fn with_covariance(mut self, covariance: Vec<f64>) -> Self {
        self.covariance = Some(covariance);
        self
    }

    /// Covariance element (i, j). Falls back to `uncertainties[i]^2` on the diagonal
    /// and 0 off-diagonal when the full matrix is unavailable.
    pub fn covariance_at(&self, i: usize, j: usize) -> f64 {
        let n = self.parameters.len();
        match &self.covariance {
            Some(cov) => cov[i * n + j],
            None if i == j => self.uncertainties[i] * self.uncertainties[i],
            None => 0.0,
        }
    }
}
