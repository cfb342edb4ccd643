//! Per-cell background subtraction over the primary × secondary grid.
//!
//! Events are routed to cells with open intervals on both axes: an event
//! lying exactly on a bin edge belongs to no cell. Each cell's sideband values
//! are binned and handed to [`fit_peak`]. Cells are independent and run on
//! rayon; results are assembled by cell index, so the output does not depend
//! on the thread count.

use rayon::prelude::*;
use yf_core::{BinEdges, Error, PeakEstimate, Result};
use yf_fit::{PeakFit, PeakFitConfig, fit_peak};
use yf_hist::{Grid, Histogram1D, Secondary};

/// One fitted cell, as seen by a [`FitObserver`].
#[derive(Debug, Clone, Copy)]
pub struct CellFit<'a> {
    /// Primary bin index.
    pub i: usize,
    /// Secondary bin index (0 without a secondary axis).
    pub j: usize,
    /// Whether the grid has a secondary axis.
    pub two_dimensional: bool,
    /// Sideband histogram of the cell.
    pub histogram: &'a Histogram1D,
    /// Fit outcome.
    pub fit: &'a PeakFit,
}

/// Diagnostic side-channel receiving every non-empty cell.
pub trait FitObserver: Sync {
    /// Called once per fitted cell, possibly from several threads.
    fn observe(&self, cell: &CellFit<'_>);
}

impl<F> FitObserver for F
where
    F: Fn(&CellFit<'_>) + Sync,
{
    fn observe(&self, cell: &CellFit<'_>) {
        self(cell)
    }
}

/// Four parallel `(n_primary, n_secondary)` grids.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakGrid {
    /// Extracted signal.
    pub signal: Grid,
    /// Signal uncertainty.
    pub signal_error: Grid,
    /// Confidence width.
    pub confidence: Grid,
    /// Confidence width uncertainty.
    pub confidence_error: Grid,
}

impl PeakGrid {
    fn from_estimates(nx: usize, ny: usize, estimates: &[PeakEstimate]) -> Result<Self> {
        let column = |f: fn(&PeakEstimate) -> f64| Grid::from_vec(nx, ny, estimates.iter().map(f).collect());
        Ok(Self {
            signal: column(|e| e.signal)?,
            signal_error: column(|e| e.signal_error)?,
            confidence: column(|e| e.confidence)?,
            confidence_error: column(|e| e.confidence_error)?,
        })
    }

    /// `(n_primary, n_secondary)`.
    pub fn shape(&self) -> (usize, usize) {
        self.signal.shape()
    }
}

/// Cell `k` such that `edges[k] < x < edges[k + 1]`.
fn open_bin(edges: &[f64], x: f64) -> Option<usize> {
    if x.is_nan() {
        return None;
    }
    let k = edges.partition_point(|&e| e < x);
    (k >= 1 && k < edges.len() && x < edges[k]).then(|| k - 1)
}

/// Runs the per-cell peak fits.
#[derive(Clone, Copy, Default)]
pub struct BackgroundSubtractor<'o> {
    config: PeakFitConfig,
    threads: usize,
    observer: Option<&'o dyn FitObserver>,
}

impl<'o> BackgroundSubtractor<'o> {
    /// Subtractor using `config` for every cell, on the ambient rayon pool.
    pub fn new(config: PeakFitConfig) -> Self {
        Self { config, threads: 0, observer: None }
    }

    /// Run on a dedicated pool of `threads` threads (0 = ambient pool).
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Report every fitted cell to `observer`.
    pub fn with_observer(mut self, observer: &'o dyn FitObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Subtract the background in every `(primary, secondary)` cell.
    ///
    /// `primary`, `sideband`, `weights` and the secondary values are parallel
    /// per-event arrays. Without a secondary axis the grids have one column.
    pub fn run(
        &self,
        primary: &[f64],
        secondary: Option<Secondary<'_>>,
        sideband: &[f64],
        weights: &[f64],
        primary_bins: &BinEdges,
        sideband_bins: &BinEdges,
    ) -> Result<PeakGrid> {
        let n = primary.len();
        if sideband.len() != n || weights.len() != n || secondary.is_some_and(|s| s.values.len() != n) {
            return Err(Error::Validation(format!(
                "per-event arrays differ in length (primary {n}, sideband {}, weights {})",
                sideband.len(),
                weights.len()
            )));
        }

        let nx = primary_bins.n_bins();
        let ny = secondary.map_or(1, |s| s.bins.n_bins());
        let mut members: Vec<Vec<usize>> = vec![Vec::new(); nx * ny];
        for (event, &p) in primary.iter().enumerate() {
            let Some(i) = open_bin(primary_bins.as_slice(), p) else { continue };
            let j = match secondary {
                Some(s) => match open_bin(s.bins.as_slice(), s.values[event]) {
                    Some(j) => j,
                    None => continue,
                },
                None => 0,
            };
            members[i * ny + j].push(event);
        }

        let two_dimensional = secondary.is_some();
        let fit_cell = |(cell, events): (usize, &Vec<usize>)| -> Result<PeakEstimate> {
            if events.is_empty() {
                return Ok(PeakEstimate::zero());
            }
            let values: Vec<f64> = events.iter().map(|&e| sideband[e]).collect();
            let w: Vec<f64> = events.iter().map(|&e| weights[e]).collect();
            let histogram = Histogram1D::fill(sideband_bins.clone(), &values, &w)?;
            let fit = fit_peak(&histogram, self.config);
            if let Some(observer) = self.observer {
                let (i, j) = (cell / ny, cell % ny);
                observer.observe(&CellFit { i, j, two_dimensional, histogram: &histogram, fit: &fit });
            }
            Ok(fit.estimate)
        };
        let run_all = || -> Result<Vec<PeakEstimate>> { members.par_iter().enumerate().map(fit_cell).collect() };

        let estimates = if self.threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.threads)
                .build()
                .map_err(|e| Error::Computation(format!("failed to create thread pool: {e}")))?;
            pool.install(run_all)?
        } else {
            run_all()?
        };

        let fitted = members.iter().filter(|m| !m.is_empty()).count();
        log::debug!("background subtraction: {fitted} of {} cells fitted", nx * ny);
        PeakGrid::from_estimates(nx, ny, &estimates)
    }
}

/// [`BackgroundSubtractor::run`] with default settings and no observer.
pub fn subtract_background(
    primary: &[f64],
    secondary: Option<Secondary<'_>>,
    sideband: &[f64],
    weights: &[f64],
    primary_bins: &BinEdges,
    sideband_bins: &BinEdges,
    config: PeakFitConfig,
) -> Result<PeakGrid> {
    BackgroundSubtractor::new(config).run(primary, secondary, sideband, weights, primary_bins, sideband_bins)
}
