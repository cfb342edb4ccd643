//! Weighted histogram value types.
//!
//! Histograms are immutable once built: transformations such as zeroing a
//! range or scaling return a new value.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use yf_core::{BinEdges, Error, Result, clip_non_negative};

/// A 1D weighted histogram: per-bin sum of weights and `sqrt(sum of weights²)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram1D {
    edges: BinEdges,
    counts: Vec<f64>,
    errors: Vec<f64>,
}

impl Histogram1D {
    /// Build from explicit contents and errors.
    pub fn new(edges: BinEdges, counts: Vec<f64>, errors: Vec<f64>) -> Result<Self> {
        let n = edges.n_bins();
        if counts.len() != n || errors.len() != n {
            return Err(Error::Validation(format!(
                "histogram with {n} bins got {} counts and {} errors",
                counts.len(),
                errors.len()
            )));
        }
        Ok(Self { edges, counts, errors })
    }

    /// Empty histogram over `edges`.
    pub fn zeros(edges: BinEdges) -> Self {
        let n = edges.n_bins();
        Self { edges, counts: vec![0.0; n], errors: vec![0.0; n] }
    }

    /// Bin `values` with `weights`. Non-finite and out-of-range values are dropped.
    pub fn fill(edges: BinEdges, values: &[f64], weights: &[f64]) -> Result<Self> {
        if values.len() != weights.len() {
            return Err(Error::Validation(format!(
                "values ({}) and weights ({}) differ in length",
                values.len(),
                weights.len()
            )));
        }
        let n = edges.n_bins();
        let mut counts = vec![0.0; n];
        let mut sumw2 = vec![0.0; n];
        for (&v, &w) in values.iter().zip(weights) {
            if let Some(b) = edges.find_bin(v) {
                counts[b] += w;
                sumw2[b] += w * w;
            }
        }
        let errors = sumw2.into_iter().map(f64::sqrt).collect();
        Ok(Self { edges, counts, errors })
    }

    /// Bin edges.
    pub fn edges(&self) -> &BinEdges {
        &self.edges
    }

    /// Bin contents.
    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    /// Bin errors.
    pub fn errors(&self) -> &[f64] {
        &self.errors
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.counts.len()
    }

    /// Sum of bin contents.
    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }

    /// Sum of squared bin errors.
    pub fn sum_w2(&self) -> f64 {
        self.errors.iter().map(|e| e * e).sum()
    }

    /// Weighted-equivalent sample size `(Σw)² / Σw²`, 0 for an empty histogram.
    pub fn effective_entries(&self) -> f64 {
        let sw2 = self.sum_w2();
        if sw2 > 0.0 {
            let sw = self.total();
            sw * sw / sw2
        } else {
            0.0
        }
    }

    /// Largest bin content (0 for an empty histogram).
    pub fn max_content(&self) -> f64 {
        self.counts.iter().copied().fold(0.0_f64, f64::max)
    }

    /// True when there is nothing to fit: no bins or zero total weight.
    pub fn is_degenerate(&self) -> bool {
        self.n_bins() == 0 || self.total() == 0.0
    }

    /// Copy with contents and errors of `bins` set to zero.
    pub fn with_zeroed_bins(&self, bins: Range<usize>) -> Self {
        let mut out = self.clone();
        for i in bins.start.min(out.n_bins())..bins.end.min(out.n_bins()) {
            out.counts[i] = 0.0;
            out.errors[i] = 0.0;
        }
        out
    }
}

/// Row-major 2D array of `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    n_rows: usize,
    n_cols: usize,
    data: Vec<f64>,
}

impl Grid {
    /// Zero-filled grid.
    pub fn zeros(n_rows: usize, n_cols: usize) -> Self {
        Self { n_rows, n_cols, data: vec![0.0; n_rows * n_cols] }
    }

    /// Wrap row-major data.
    pub fn from_vec(n_rows: usize, n_cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != n_rows * n_cols {
            return Err(Error::Validation(format!(
                "grid {n_rows}x{n_cols} needs {} values, got {}",
                n_rows * n_cols,
                data.len()
            )));
        }
        Ok(Self { n_rows, n_cols, data })
    }

    /// `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.n_rows, self.n_cols)
    }

    /// Element `(i, j)`.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n_cols + j]
    }

    /// Set element `(i, j)`.
    pub fn set(&mut self, i: usize, j: usize, value: f64) {
        self.data[i * self.n_cols + j] = value;
    }

    /// Row-major values.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Sum of all elements.
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Multiply every element by `factor`.
    pub fn scale(&mut self, factor: f64) {
        self.data.iter_mut().for_each(|v| *v *= factor);
    }

    /// Floor every element at zero.
    pub fn clip_non_negative(&mut self) {
        self.data.iter_mut().for_each(|v| *v = clip_non_negative(*v));
    }
}

/// Counts and errors over a primary (and optional secondary) binning.
///
/// Without a secondary axis the grids have a single column and the
/// histogram reports a 1D shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinnedHistogram {
    /// Primary bin edges.
    pub x_edges: BinEdges,
    /// Secondary bin edges, if any.
    pub y_edges: Option<BinEdges>,
    /// Per-cell contents.
    pub counts: Grid,
    /// Per-cell errors.
    pub errors: Grid,
}

impl BinnedHistogram {
    /// Empty histogram.
    pub fn zeros(x_edges: BinEdges, y_edges: Option<BinEdges>) -> Self {
        let nx = x_edges.n_bins();
        let ny = y_edges.as_ref().map_or(1, BinEdges::n_bins);
        Self { x_edges, y_edges, counts: Grid::zeros(nx, ny), errors: Grid::zeros(nx, ny) }
    }

    /// `[nx]` or `[nx, ny]`.
    pub fn shape(&self) -> Vec<usize> {
        let (nx, ny) = self.counts.shape();
        if self.y_edges.is_some() { vec![nx, ny] } else { vec![nx] }
    }

    /// Whether a secondary axis is present.
    pub fn is_2d(&self) -> bool {
        self.y_edges.is_some()
    }

    /// Sum of all cell contents.
    pub fn total(&self) -> f64 {
        self.counts.sum()
    }
}
