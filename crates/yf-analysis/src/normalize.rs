//! Scale factor reconciling simulation with data.

use yf_core::{Error, Result, Variable};

use crate::config::NormalizationMode;
use crate::processor::SampleHistograms;

/// Summed data and simulation yields entering the scale factor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct YieldSums {
    /// Σ over data samples.
    pub data: f64,
    /// Σ over simulation samples.
    pub simulation: f64,
}

impl YieldSums {
    /// `data / simulation`, rejecting a zero simulation sum and non-finite
    /// ratios.
    pub fn ratio(&self) -> Result<f64> {
        let scale = self.data / self.simulation;
        if self.simulation == 0.0 || !scale.is_finite() {
            return Err(Error::Config(format!(
                "cannot normalize: data sum {} over simulation sum {} gives scale {scale}",
                self.data, self.simulation
            )));
        }
        Ok(scale)
    }
}

/// Scale factor for `mode`.
///
/// `none` and `lumi` give 1. `yield` compares the totals of the already
/// filled histograms. `range` and `eventyield` need a second pass over the
/// samples, which `recount` performs.
pub fn normalize(
    simulation: &[SampleHistograms],
    data: &[SampleHistograms],
    mode: NormalizationMode,
    recount: impl FnOnce(NormalizationMode) -> Result<YieldSums>,
) -> Result<f64> {
    let sums = match mode {
        NormalizationMode::None | NormalizationMode::Lumi => return Ok(1.0),
        NormalizationMode::Yield => YieldSums {
            data: data.iter().map(SampleHistograms::total).sum(),
            simulation: simulation.iter().map(SampleHistograms::total).sum(),
        },
        NormalizationMode::Range | NormalizationMode::EventYield => recount(mode)?,
    };
    let scale = sums.ratio()?;
    log::info!("normalization ({mode}): data {} / simulation {} = {scale}", sums.data, sums.simulation);
    Ok(scale)
}

/// Scale every simulation sample by `scale` and clip.
pub fn apply_scale(simulation: &mut [SampleHistograms], scale: f64) {
    for s in simulation {
        s.scale(scale);
        s.clip();
    }
}

/// The normalization variable reduced to a single bin over its full range.
pub fn range_variable(variable: &Variable) -> Variable {
    if variable.bins.n_bins() <= 1 {
        return variable.clone();
    }
    log::warn!(
        "normalization variable {} has {} bin edges, only the first ({}) and last ({}) are used",
        variable.display_name(),
        variable.bins.n_bins() + 1,
        variable.bins.low(),
        variable.bins.high()
    );
    Variable { bins: variable.bins.collapsed(), ..variable.clone() }
}

/// The single count of a histogram filled with a [`range_variable`].
pub fn single_bin_count(histograms: &SampleHistograms) -> Result<f64> {
    match histograms.counts.as_slice() {
        [count] => Ok(*count),
        other => Err(Error::Config(format!(
            "normalization histogram of '{}' has {} bins, expected 1; check the binning of the normalization variable",
            histograms.label,
            other.len()
        ))),
    }
}
