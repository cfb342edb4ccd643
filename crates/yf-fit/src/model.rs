//! Curve models for sideband fits.
//!
//! Every model shares one parameter vector convention: peak parameters first,
//! the linear background `b0 + b1·(x - pivot)` last. The pivot is the centre of
//! the fit range and keeps the two background parameters uncorrelated enough
//! for the minimizer; [`LinearBackground::standard`] converts back to
//! `a0 + a1·x`.

use serde::{Deserialize, Serialize};
use statrs::function::erf::erf;
use yf_core::BinEdges;
use yf_hist::Histogram1D;

/// A model `f(x; p)` with an analytic parameter gradient and integral.
pub trait CurveModel: Sync {
    /// Number of parameters.
    fn n_params(&self) -> usize;

    /// `f(x; params)`.
    fn value(&self, x: f64, params: &[f64]) -> f64;

    /// `∂f/∂p` at `x`, written into `out` (length `n_params`).
    fn gradient(&self, x: f64, params: &[f64], out: &mut [f64]);

    /// `∫ f(x; params) dx` over `[lo, hi]`.
    fn integral(&self, lo: f64, hi: f64, params: &[f64]) -> f64;
}

const SQRT_PI_OVER_2: f64 = 1.253_314_137_315_500_3;

fn gaussian(x: f64, mu: f64, amp: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma;
    amp * (-0.5 * z * z).exp()
}

/// `(∂/∂mu, ∂/∂amp, ∂/∂sigma)` of [`gaussian`].
fn gaussian_gradient(x: f64, mu: f64, amp: f64, sigma: f64) -> (f64, f64, f64) {
    let dx = x - mu;
    let e = (-0.5 * dx * dx / (sigma * sigma)).exp();
    (amp * e * dx / (sigma * sigma), e, amp * e * dx * dx / (sigma * sigma * sigma))
}

fn gaussian_integral(lo: f64, hi: f64, mu: f64, amp: f64, sigma: f64) -> f64 {
    let s = std::f64::consts::SQRT_2 * sigma;
    amp * sigma * SQRT_PI_OVER_2 * (erf((hi - mu) / s) - erf((lo - mu) / s))
}

/// Straight line `b0 + b1·(x - pivot)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearBackground {
    /// Reference abscissa of the parametrization.
    pub pivot: f64,
}

impl LinearBackground {
    /// Line centred on `pivot`.
    pub fn new(pivot: f64) -> Self {
        Self { pivot }
    }

    /// Convert `[b0, b1]` to the `(a0, a1)` of `a0 + a1·x`.
    pub fn standard(&self, params: &[f64]) -> (f64, f64) {
        (params[0] - params[1] * self.pivot, params[1])
    }

    /// Minimum of the line over `[lo, hi]`.
    pub fn min_over(&self, lo: f64, hi: f64, params: &[f64]) -> f64 {
        self.value(lo, params).min(self.value(hi, params))
    }
}

impl CurveModel for LinearBackground {
    fn n_params(&self) -> usize {
        2
    }

    fn value(&self, x: f64, params: &[f64]) -> f64 {
        params[0] + params[1] * (x - self.pivot)
    }

    fn gradient(&self, x: f64, _params: &[f64], out: &mut [f64]) {
        out[0] = 1.0;
        out[1] = x - self.pivot;
    }

    fn integral(&self, lo: f64, hi: f64, params: &[f64]) -> f64 {
        let (u, v) = (lo - self.pivot, hi - self.pivot);
        params[0] * (hi - lo) + 0.5 * params[1] * (v * v - u * u)
    }
}

/// Peak shape family, chosen from the effective entry count of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakModel {
    /// `[mu, amp, sigma, b0, b1]`
    SingleGaussian,
    /// `[mu, amp1, sigma1, amp2, sigma2, b0, b1]`, sharing the mean.
    DoubleGaussian,
}

/// Which part of a peak model a [`PeakCurve`] evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    /// Peak plus background.
    Full,
    /// Gaussian terms only.
    Signal,
    /// Linear background only.
    Background,
}

/// Starting point, box constraints and conditioning scales for a fit.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialGuess {
    /// Starting parameter values.
    pub values: Vec<f64>,
    /// Per-parameter `(lower, upper)` bounds.
    pub bounds: Vec<(f64, f64)>,
    /// Typical magnitude of each parameter.
    pub scales: Vec<f64>,
}

impl PeakModel {
    /// Single Gaussian up to `double_above` effective entries, double above.
    pub fn select(effective_entries: f64, double_above: f64) -> Self {
        if effective_entries <= double_above {
            Self::SingleGaussian
        } else {
            Self::DoubleGaussian
        }
    }

    /// Number of Gaussian terms.
    pub fn n_gaussians(self) -> usize {
        match self {
            Self::SingleGaussian => 1,
            Self::DoubleGaussian => 2,
        }
    }

    /// Total parameter count including the background.
    pub fn n_params(self) -> usize {
        1 + 2 * self.n_gaussians() + 2
    }

    /// Index of the first background parameter.
    pub fn background_offset(self) -> usize {
        1 + 2 * self.n_gaussians()
    }

    /// Index of the (first) Gaussian width.
    pub fn width_index(self) -> usize {
        2
    }

    /// Curve over the given component, background pivoted at `pivot`.
    pub fn curve(self, pivot: f64, component: Component) -> PeakCurve {
        PeakCurve { model: self, background: LinearBackground::new(pivot), component }
    }

    /// Starting points derived from the histogram and a background estimate.
    ///
    /// The mean starts at the range midpoint. Amplitude and width are read off
    /// the excess over the background in the central half of the range: the
    /// largest excess, and the net excess divided by that height. Further
    /// starts scale the widths by one half and by two, so a fit that stalls at
    /// one width can be retried at another.
    pub fn initial_guesses(self, hist: &Histogram1D, background: [f64; 2]) -> Vec<InitialGuess> {
        let edges = hist.edges();
        let (lo, hi, span) = (edges.low(), edges.high(), edges.span());
        let mid = pivot_of(edges);
        let seed = PeakSeed::from_histogram(hist, background);
        let content_scale = content_scale(hist);

        let narrowest_bin = (0..edges.n_bins()).map(|i| edges.width(i)).fold(f64::INFINITY, f64::min);
        let min_width = (span / 200.0).max(0.5 * narrowest_bin);
        let max_width = span;
        let width = |w: f64| w.clamp(min_width, max_width);
        let amp = seed.height.max(1e-3 * content_scale);

        let amp_bounds = (0.0, f64::INFINITY);
        let width_bounds = (min_width, max_width);
        let free = (f64::NEG_INFINITY, f64::INFINITY);

        [1.0, 0.5, 2.0]
            .into_iter()
            .map(|factor| {
                let sigma = factor * seed.sigma;
                let (mut values, mut bounds, mut scales) = match self {
                    Self::SingleGaussian => (
                        vec![mid, amp, width(sigma)],
                        vec![(lo, hi), amp_bounds, width_bounds],
                        vec![span, content_scale, span],
                    ),
                    Self::DoubleGaussian => (
                        vec![mid, 0.7 * amp, width(0.8 * sigma), 0.3 * amp, width(2.0 * sigma)],
                        vec![(lo, hi), amp_bounds, width_bounds, amp_bounds, width_bounds],
                        vec![span, content_scale, span, content_scale, span],
                    ),
                };
                values.extend_from_slice(&background);
                bounds.extend_from_slice(&[free, free]);
                scales.extend_from_slice(&[content_scale, content_scale / span]);
                InitialGuess { values, bounds, scales }
            })
            .collect()
    }
}

/// Peak height and width read off the excess over a background line.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PeakSeed {
    height: f64,
    sigma: f64,
}

impl PeakSeed {
    fn from_histogram(hist: &Histogram1D, background: [f64; 2]) -> Self {
        let edges = hist.edges();
        let (span, mid) = (edges.span(), pivot_of(edges));
        let line = LinearBackground::new(mid);

        let mut height = 0.0_f64;
        let mut net = 0.0;
        for (i, &y) in hist.counts().iter().enumerate() {
            let x = edges.center(i);
            if (x - mid).abs() > 0.25 * span {
                continue;
            }
            let excess = y - line.value(x, &background);
            net += excess * edges.width(i);
            height = height.max(excess);
        }
        let sigma = if height > 0.0 && net > 0.0 {
            net / (height * (2.0 * std::f64::consts::PI).sqrt())
        } else {
            span / 20.0
        };
        Self { height, sigma: sigma.clamp(span / 100.0, span / 4.0) }
    }
}

/// Magnitude used to rescale amplitude-like parameters.
pub(crate) fn content_scale(hist: &Histogram1D) -> f64 {
    let m = hist.max_content();
    if m > 0.0 && m.is_finite() { m } else { 1.0 }
}

/// Fit range centre, used as the background pivot.
pub(crate) fn pivot_of(edges: &BinEdges) -> f64 {
    0.5 * (edges.low() + edges.high())
}

/// A [`PeakModel`] bound to a background pivot and a component selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakCurve {
    model: PeakModel,
    background: LinearBackground,
    component: Component,
}

impl PeakCurve {
    /// Same parameters, different component.
    pub fn with_component(self, component: Component) -> Self {
        Self { component, ..self }
    }

    /// The background line and its two parameters.
    pub fn background<'p>(&self, params: &'p [f64]) -> (LinearBackground, &'p [f64]) {
        let off = self.model.background_offset();
        (self.background, &params[off..off + 2])
    }

    fn has_signal(&self) -> bool {
        self.component != Component::Background
    }

    fn has_background(&self) -> bool {
        self.component != Component::Signal
    }
}

impl CurveModel for PeakCurve {
    fn n_params(&self) -> usize {
        self.model.n_params()
    }

    fn value(&self, x: f64, params: &[f64]) -> f64 {
        let mut f = 0.0;
        if self.has_signal() {
            let mu = params[0];
            for g in 0..self.model.n_gaussians() {
                f += gaussian(x, mu, params[1 + 2 * g], params[2 + 2 * g]);
            }
        }
        if self.has_background() {
            let (bkg, bp) = self.background(params);
            f += bkg.value(x, bp);
        }
        f
    }

    fn gradient(&self, x: f64, params: &[f64], out: &mut [f64]) {
        out.iter_mut().for_each(|v| *v = 0.0);
        if self.has_signal() {
            let mu = params[0];
            for g in 0..self.model.n_gaussians() {
                let (d_mu, d_amp, d_sigma) =
                    gaussian_gradient(x, mu, params[1 + 2 * g], params[2 + 2 * g]);
                out[0] += d_mu;
                out[1 + 2 * g] = d_amp;
                out[2 + 2 * g] = d_sigma;
            }
        }
        if self.has_background() {
            let off = self.model.background_offset();
            out[off] = 1.0;
            out[off + 1] = x - self.background.pivot;
        }
    }

    fn integral(&self, lo: f64, hi: f64, params: &[f64]) -> f64 {
        let mut total = 0.0;
        if self.has_signal() {
            let mu = params[0];
            for g in 0..self.model.n_gaussians() {
                total += gaussian_integral(lo, hi, mu, params[1 + 2 * g], params[2 + 2 * g]);
            }
        }
        if self.has_background() {
            let (bkg, bp) = self.background(params);
            total += bkg.integral(lo, hi, bp);
        }
        total
    }
}
