//! Masked, weighted binning of per-event observables.

use yf_core::{BinEdges, Error, Result};

use crate::histogram::BinnedHistogram;

/// Optional secondary observable for 2D aggregation.
#[derive(Debug, Clone, Copy)]
pub struct Secondary<'a> {
    /// Per-event secondary values, parallel to the primary values.
    pub values: &'a [f64],
    /// Secondary bin edges.
    pub bins: &'a BinEdges,
}

/// Bin `values` (and optionally a secondary observable) with `weights`.
///
/// An event is dropped when its primary value is non-finite or outside
/// `[bins.low(), bins.high()]`, or when its secondary value is non-finite or
/// outside the secondary range. Each retained event adds its weight to the
/// count and its squared weight to the error² of its cell.
pub fn aggregate(
    values: &[f64],
    weights: &[f64],
    bins: &BinEdges,
    secondary: Option<Secondary<'_>>,
) -> Result<BinnedHistogram> {
    if values.len() != weights.len() {
        return Err(Error::Validation(format!(
            "values ({}) and weights ({}) differ in length",
            values.len(),
            weights.len()
        )));
    }
    if let Some(sec) = secondary
        && sec.values.len() != values.len()
    {
        return Err(Error::Validation(format!(
            "secondary values ({}) and primary values ({}) differ in length",
            sec.values.len(),
            values.len()
        )));
    }

    let mut hist = BinnedHistogram::zeros(bins.clone(), secondary.map(|s| s.bins.clone()));
    let (nx, ny) = hist.counts.shape();
    let mut sumw = vec![0.0; nx * ny];
    let mut sumw2 = vec![0.0; nx * ny];
    let mut masked = 0usize;

    for (entry, (&v, &w)) in values.iter().zip(weights).enumerate() {
        let Some(ix) = bins.find_bin(v) else {
            masked += 1;
            continue;
        };
        let iy = match secondary {
            Some(sec) => match sec.bins.find_bin(sec.values[entry]) {
                Some(iy) => iy,
                None => {
                    masked += 1;
                    continue;
                }
            },
            None => 0,
        };
        let cell = ix * ny + iy;
        sumw[cell] += w;
        sumw2[cell] += w * w;
    }

    if masked > 0 {
        log::debug!("aggregate: {masked} of {} entries masked (non-finite or out of range)", values.len());
    }

    for ix in 0..nx {
        for iy in 0..ny {
            let cell = ix * ny + iy;
            hist.counts.set(ix, iy, sumw[cell]);
            hist.errors.set(ix, iy, sumw2[cell].sqrt());
        }
    }
    Ok(hist)
}

/// Unbinned yield: `(Σw, sqrt(Σw²))`.
pub fn sum_weights(weights: &[f64]) -> (f64, f64) {
    let (sw, sw2) = weights.iter().fold((0.0, 0.0), |(sw, sw2), &w| (sw + w, sw2 + w * w));
    (sw, sw2.sqrt())
}
