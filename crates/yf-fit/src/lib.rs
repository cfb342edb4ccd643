//! # yf-fit
//!
//! Sideband peak fitting for yieldfit.
//!
//! This crate provides:
//! - Gaussian + linear background curve models with analytic gradients
//! - closed-form and nonlinear weighted least squares, solved by projected
//!   Levenberg–Marquardt or a bounded L-BFGS over argmin
//! - Gauss–Newton covariances through an eigenvalue pseudo-inverse
//! - integrals with covariance-propagated errors
//! - the per-histogram peak extraction ([`fit_peak`])

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Integrals of fitted curves.
pub mod integrate;
/// Weighted least squares on binned data.
pub mod lsq;
/// Curve models and peak model selection.
pub mod model;
/// Minimizer settings and the bounded L-BFGS solver.
pub mod optimizer;
/// Sideband peak extraction.
pub mod peak;

pub use integrate::integrate;
pub use lsq::{CurveFitter, FitData, fit_linear};
pub use model::{Component, CurveModel, InitialGuess, LinearBackground, PeakCurve, PeakModel};
pub use optimizer::{BoundedLbfgs, FitAlgorithm, MinimizerConfig, Minimum, Objective};
pub use peak::{ExtractionMode, PeakFit, PeakFitConfig, SignalMethod, fit_peak, sideband_only};
