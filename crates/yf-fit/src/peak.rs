//! Sideband peak extraction for a single invariant-mass histogram.
//!
//! A straight line is first fitted to the sidebands (the histogram with its
//! central half zeroed). Depending on [`ExtractionMode`] and the effective
//! entry count the signal is then either counted above that line or obtained
//! by integrating a Gaussian-plus-line fit. A double-Gaussian fit that fails
//! its checks is retried with a single Gaussian before falling back to
//! cut-and-count. A single-Gaussian fit is always run as well; its width is
//! reported as the confidence estimator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use yf_core::{Error, FitResult, PeakEstimate, Result};
use yf_hist::Histogram1D;

use crate::integrate::integrate;
use crate::lsq::{CurveFitter, FitData, fit_linear};
use crate::model::{
    Component, CurveModel, InitialGuess, LinearBackground, PeakCurve, PeakModel, content_scale, pivot_of,
};
use crate::optimizer::MinimizerConfig;

/// How the signal of a cell is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    /// Always cut-and-count above the sideband line.
    Subtract,
    /// Always integrate the fitted signal.
    Gfit,
    /// Integrate above the entry threshold, cut-and-count below.
    #[default]
    Hybrid,
}

impl FromStr for ExtractionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "subtract" => Ok(Self::Subtract),
            "gfit" => Ok(Self::Gfit),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(Error::Config(format!(
                "unknown peak extraction mode '{other}' (expected subtract, gfit or hybrid)"
            ))),
        }
    }
}

impl fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Subtract => "subtract",
            Self::Gfit => "gfit",
            Self::Hybrid => "hybrid",
        })
    }
}

/// Tuning of the per-cell peak fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakFitConfig {
    /// Signal extraction mode.
    pub mode: ExtractionMode,
    /// Above this many effective entries the double-Gaussian model is used.
    pub double_gaussian_above: f64,
    /// Above this many effective entries `hybrid` integrates the fit.
    pub integrate_above: f64,
    /// Minimizer settings for the shape fits.
    pub minimizer: MinimizerConfig,
}

impl Default for PeakFitConfig {
    fn default() -> Self {
        Self {
            mode: ExtractionMode::Hybrid,
            double_gaussian_above: 100.0,
            integrate_above: 20.0,
            minimizer: MinimizerConfig::default(),
        }
    }
}

/// Which estimator produced the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalMethod {
    /// Bin sum above the sideband line.
    CutAndCount,
    /// Integral of the fitted Gaussian component.
    SignalIntegral,
    /// Integral of the whole fitted function (fitted background dips below zero).
    FullIntegral,
    /// Nothing to fit.
    Empty,
}

/// Full outcome of one peak fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeakFit {
    /// Extracted signal and confidence width. Not clipped.
    pub estimate: PeakEstimate,
    /// `(Σw)² / Σw²` of the input histogram.
    pub effective_entries: f64,
    /// Model chosen from the effective entries.
    pub selected_model: PeakModel,
    /// Model behind `shape_fit`. Differs from `selected_model` when the
    /// double-Gaussian fit was rejected and a single Gaussian took over.
    pub fitted_model: Option<PeakModel>,
    /// Estimator behind `estimate.signal`.
    pub method: SignalMethod,
    /// Sideband line `(a0, a1)` of `a0 + a1·x`, if that fit succeeded.
    pub background: Option<(f64, f64)>,
    /// Whether the sideband line stays non-negative over the range.
    pub background_nonnegative: bool,
    /// Signal+background fit used for the integral, if one ran and succeeded.
    pub shape_fit: Option<FitResult>,
    /// Single-Gaussian fit behind the confidence width, if it succeeded.
    pub confidence_fit: Option<FitResult>,
}

impl PeakFit {
    fn empty(config: &PeakFitConfig) -> Self {
        Self {
            estimate: PeakEstimate::zero(),
            effective_entries: 0.0,
            selected_model: PeakModel::select(0.0, config.double_gaussian_above),
            fitted_model: None,
            method: SignalMethod::Empty,
            background: None,
            background_nonnegative: true,
            shape_fit: None,
            confidence_fit: None,
        }
    }
}

/// Extract `(signal, signal_error, confidence, confidence_error)` from `hist`.
///
/// Numerical failures of the shape fits are logged and absorbed: the signal
/// falls back to cut-and-count and the confidence to zero. A shape fit counts
/// as failed when it is no better than the sideband line alone, when a
/// Gaussian ends up pinned at a width bound, or when its integral error
/// exceeds ten times the statistical error of the whole histogram.
pub fn fit_peak(hist: &Histogram1D, config: PeakFitConfig) -> PeakFit {
    if hist.is_degenerate() {
        return PeakFit::empty(&config);
    }

    let edges = hist.edges();
    let (lo, hi) = (edges.low(), edges.high());
    let pivot = pivot_of(edges);
    let effective_entries = hist.effective_entries();
    let selected_model = PeakModel::select(effective_entries, config.double_gaussian_above);

    let line = LinearBackground::new(pivot);
    let sideband = sideband_only(hist);
    let background = match fit_linear(&line, &FitData::from_histogram(&sideband)) {
        Ok(fit) => Some([fit.parameters[0], fit.parameters[1]]),
        Err(e) => {
            log::warn!("sideband background fit failed: {e}");
            None
        }
    };
    let background_nonnegative = background.is_none_or(|b| line.min_over(lo, hi, &b) >= 0.0);

    let wants_fit = match config.mode {
        ExtractionMode::Subtract => false,
        ExtractionMode::Gfit => true,
        ExtractionMode::Hybrid => effective_entries > config.integrate_above,
    };

    let shapes = ShapeFitter {
        fitter: CurveFitter::new(config.minimizer),
        hist,
        data: FitData::from_histogram(hist),
        pivot,
        start: background.unwrap_or([0.0, 0.0]),
    };

    // Outer `None`: no single-Gaussian fit was attempted yet.
    let mut single_attempt: Option<Option<FitResult>> = None;
    let mut shape = None;
    if wants_fit {
        let chain: &[PeakModel] = match selected_model {
            PeakModel::DoubleGaussian => &[PeakModel::DoubleGaussian, PeakModel::SingleGaussian],
            PeakModel::SingleGaussian => &[PeakModel::SingleGaussian],
        };
        for &model in chain {
            let attempt = shapes.fit(model);
            if model == PeakModel::SingleGaussian {
                single_attempt = Some(attempt.as_ref().ok().cloned());
            }
            match attempt.and_then(|fit| shapes.extract(model, fit)) {
                Ok(found) => {
                    shape = Some(found);
                    break;
                }
                Err(e) => log::debug!("{model:?} peak fit rejected: {e}"),
            }
        }
        if shape.is_none() {
            log::warn!("no usable {selected_model:?} peak fit, falling back to cut-and-count");
        }
    }

    let (signal, signal_error, method) = match &shape {
        Some(found) => (found.signal, found.signal_error, found.method),
        None => {
            let subtract = background.filter(|_| background_nonnegative);
            let (value, error) = cut_and_count(hist, subtract.as_ref().map(|b| (&line, &b[..])));
            (value, error, SignalMethod::CutAndCount)
        }
    };
    let (fitted_model, shape_fit) = match shape {
        Some(found) => (Some(found.model), Some(found.fit)),
        None => (None, None),
    };

    let confidence_fit = match single_attempt {
        Some(attempt) => attempt,
        None => match shapes.fit(PeakModel::SingleGaussian) {
            Ok(fit) => Some(fit),
            Err(e) => {
                log::warn!("confidence fit failed, reporting zero width: {e}");
                None
            }
        },
    };
    let width = PeakModel::SingleGaussian.width_index();
    let (confidence, confidence_error) = confidence_fit
        .as_ref()
        .map_or((0.0, 0.0), |f| (f.parameters[width], f.uncertainties[width]));

    log::debug!(
        "peak fit: n_eff={effective_entries:.1} model={selected_model:?} method={method:?} \
         signal={signal:.3}±{signal_error:.3}"
    );

    PeakFit {
        estimate: PeakEstimate { signal, signal_error, confidence, confidence_error },
        effective_entries,
        selected_model,
        fitted_model,
        method,
        background: background.map(|b| line.standard(&b)),
        background_nonnegative,
        shape_fit,
        confidence_fit,
    }
}

/// A shape fit that passed every check, with its integrated signal.
struct ShapeFit {
    model: PeakModel,
    fit: FitResult,
    signal: f64,
    signal_error: f64,
    method: SignalMethod,
}

/// Signal-plus-background fits of one histogram.
struct ShapeFitter<'a> {
    fitter: CurveFitter,
    hist: &'a Histogram1D,
    data: FitData,
    pivot: f64,
    /// Sideband line the fits start from.
    start: [f64; 2],
}

impl ShapeFitter<'_> {
    /// Best fit of `model` over all starting points that passes [`Self::check`].
    fn fit(&self, model: PeakModel) -> Result<FitResult> {
        let curve = model.curve(self.pivot, Component::Full);
        let mut best: Option<FitResult> = None;
        let mut last_error = None;
        for guess in model.initial_guesses(self.hist, self.start) {
            match self.fitter.fit(&curve, &guess, &self.data).and_then(|fit| self.check(model, &curve, &guess, fit)) {
                Ok(fit) => {
                    if best.as_ref().is_none_or(|b| fit.chi2 < b.chi2) {
                        best = Some(fit);
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }
        best.ok_or_else(|| {
            last_error.unwrap_or_else(|| Error::Computation(format!("no starting point for the {model:?} fit")))
        })
    }

    fn check(&self, model: PeakModel, curve: &PeakCurve, guess: &InitialGuess, fit: FitResult) -> Result<FitResult> {
        if !fit.parameters.iter().chain(&fit.uncertainties).all(|v| v.is_finite()) {
            return Err(Error::Computation(format!("{model:?} fit produced non-finite values")));
        }

        // Same peak shape with the amplitudes switched off, on the sideband line.
        let mut line_only = fit.parameters.clone();
        for g in 0..model.n_gaussians() {
            line_only[1 + 2 * g] = 0.0;
        }
        let off = model.background_offset();
        line_only[off..off + 2].copy_from_slice(&self.start);
        let line_chi2 = self.data.chi2(curve, &line_only);
        if fit.chi2 > line_chi2 + 1e-6 * line_chi2.max(1.0) {
            return Err(Error::Computation(format!(
                "{model:?} fit (chi2 {:.4}) is worse than the sideband line (chi2 {line_chi2:.4})",
                fit.chi2
            )));
        }

        let span = self.hist.edges().span();
        let amp_floor = 1e-6 * content_scale(self.hist);
        for g in 0..model.n_gaussians() {
            let (amp, width) = (fit.parameters[1 + 2 * g], fit.parameters[2 + 2 * g]);
            let (min_width, max_width) = guess.bounds[2 + 2 * g];
            if amp > amp_floor && (width - min_width <= 1e-6 * span || max_width - width <= 1e-6 * span) {
                return Err(Error::Computation(format!(
                    "{model:?} width {width:.3e} pinned at its bound [{min_width:.3e}, {max_width:.3e}]"
                )));
            }
        }
        Ok(fit)
    }

    /// Integrate the signal of an accepted fit, in entries.
    ///
    /// Integrates the whole function instead when the fitted background dips
    /// below zero inside the range.
    fn extract(&self, model: PeakModel, fit: FitResult) -> Result<ShapeFit> {
        let edges = self.hist.edges();
        let (lo, hi) = (edges.low(), edges.high());
        let curve = model.curve(self.pivot, Component::Full);
        let (bkg, bkg_params) = curve.background(&fit.parameters);
        let (component, method) = if bkg.min_over(lo, hi, bkg_params) < 0.0 {
            (Component::Full, SignalMethod::FullIntegral)
        } else {
            (Component::Signal, SignalMethod::SignalIntegral)
        };
        let (value, error) = integrate(&curve.with_component(component), &fit, lo, hi);
        let bin_width = edges.width(0);
        let (signal, signal_error) = (value / bin_width, error / bin_width);

        let limit = 10.0 * self.hist.sum_w2().sqrt();
        if !(signal.is_finite() && signal_error.is_finite() && signal_error <= limit) {
            return Err(Error::Computation(format!(
                "{model:?} integral {signal:.3}±{signal_error:.3} is unusable (error limit {limit:.3})"
            )));
        }
        Ok(ShapeFit { model, fit, signal, signal_error, method })
    }
}

/// The histogram with bins from `find_bin(c - w/4)` up to, not including,
/// `find_bin(c + w/4)` zeroed, `c` and `w` being the range centre and width.
pub fn sideband_only(hist: &Histogram1D) -> Histogram1D {
    let edges = hist.edges();
    let center = pivot_of(edges);
    let half = edges.span() / 4.0;
    match (edges.find_bin(center - half), edges.find_bin(center + half)) {
        (Some(first), Some(last)) => hist.with_zeroed_bins(first..last),
        _ => hist.clone(),
    }
}

/// Sum of all bins minus the line evaluated at bin centres (when given);
/// errors in quadrature.
fn cut_and_count(hist: &Histogram1D, background: Option<(&LinearBackground, &[f64])>) -> (f64, f64) {
    let edges = hist.edges();
    let signal = hist
        .counts()
        .iter()
        .enumerate()
        .map(|(i, &c)| match background {
            Some((line, p)) => c - line.value(edges.center(i), p),
            None => c,
        })
        .sum();
    (signal, hist.sum_w2().sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use yf_core::BinEdges;

    fn flat(n: usize, level: f64) -> Histogram1D {
        let edges = BinEdges::uniform(n, 0.44, 0.56).unwrap();
        Histogram1D::new(edges, vec![level; n], vec![level.sqrt(); n]).unwrap()
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("gfit".parse::<ExtractionMode>().unwrap(), ExtractionMode::Gfit);
        assert_eq!(ExtractionMode::default(), ExtractionMode::Hybrid);
        assert!(matches!("fancy".parse::<ExtractionMode>(), Err(Error::Config(_))));
        assert_eq!(ExtractionMode::Subtract.to_string(), "subtract");
    }

    #[test]
    fn sideband_zeroes_central_half() {
        let edges = BinEdges::uniform(8, 0.0, 8.0).unwrap();
        let hist = Histogram1D::new(edges, vec![2.0; 8], vec![1.0; 8]).unwrap();
        let side = sideband_only(&hist);
        // centre 4, quarter range 2: bins from find_bin(2) up to find_bin(6)
        assert_eq!(side.counts(), &[2.0, 2.0, 0.0, 0.0, 0.0, 0.0, 2.0, 2.0]);
    }

    #[test]
    fn cut_and_count_subtracts_line_at_centres() {
        let hist = flat(4, 3.0);
        let line = LinearBackground::new(0.5);
        let (s, e) = cut_and_count(&hist, Some((&line, &[1.0, 0.0])));
        assert_relative_eq!(s, 8.0);
        assert_relative_eq!(e, 12f64.sqrt());
        let (s, _) = cut_and_count(&hist, None);
        assert_relative_eq!(s, 12.0);
    }

    #[test]
    fn subtract_mode_never_integrates() {
        let fit = fit_peak(
            &flat(30, 5.0),
            PeakFitConfig { mode: ExtractionMode::Subtract, ..Default::default() },
        );
        assert_eq!(fit.method, SignalMethod::CutAndCount);
        assert!(fit.shape_fit.is_none());
        assert_relative_eq!(fit.estimate.signal, 0.0, epsilon = 1e-9);
        assert!(fit.background_nonnegative);
        let (a0, a1) = fit.background.unwrap();
        assert_relative_eq!(a0, 5.0, epsilon = 1e-9);
        assert_relative_eq!(a1, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn isolated_spike_falls_back_to_cut_and_count() {
        // A single hot bin: any Gaussian through it collapses onto the minimum width.
        let edges = BinEdges::uniform(30, 0.44, 0.56).unwrap();
        let mut counts = vec![5.0; 30];
        counts[15] = 40.0;
        let errors = counts.iter().map(|c: &f64| c.sqrt()).collect();
        let hist = Histogram1D::new(edges, counts, errors).unwrap();
        let fit = fit_peak(&hist, PeakFitConfig { mode: ExtractionMode::Gfit, ..Default::default() });
        assert_eq!(fit.selected_model, PeakModel::DoubleGaussian);
        assert_eq!(fit.method, SignalMethod::CutAndCount);
        assert!(fit.shape_fit.is_none());
        assert!(fit.fitted_model.is_none());
        assert_relative_eq!(fit.estimate.signal, 35.0, epsilon = 1e-9);
        assert_relative_eq!(fit.estimate.signal_error, (29.0 * 5.0 + 40.0_f64).sqrt(), epsilon = 1e-9);
        assert_eq!(fit.estimate.confidence, 0.0);
        assert!(fit.confidence_fit.is_none());
    }

    #[test]
    fn degenerate_histogram_is_zero() {
        let hist = Histogram1D::zeros(BinEdges::uniform(10, 0.44, 0.56).unwrap());
        let fit = fit_peak(&hist, PeakFitConfig::default());
        assert_eq!(fit.estimate, PeakEstimate::zero());
        assert_eq!(fit.method, SignalMethod::Empty);
    }
}
