//! Bounded minimization
//!
//! Thin wrapper around argmin's L-BFGS with box constraints applied by
//! clamping, plus the settings shared with the Levenberg–Marquardt solver in
//! [`crate::lsq`].

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use yf_core::{Error, Result};

/// Solver used for nonlinear chi-square fits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitAlgorithm {
    /// Damped Gauss–Newton steps on the residuals
    #[default]
    LevenbergMarquardt,
    /// argmin L-BFGS on the chi-square
    Lbfgs,
}

/// Configuration for the chi-square minimizers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimizerConfig {
    /// Solver
    pub algorithm: FitAlgorithm,
    /// Maximum number of iterations
    pub max_iter: u64,
    /// Convergence tolerance (projected gradient norm for L-BFGS, relative
    /// chi-square decrease for Levenberg–Marquardt)
    pub tol: f64,
    /// Number of stored correction pairs (L-BFGS)
    pub memory: usize,
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self { algorithm: FitAlgorithm::default(), max_iter: 500, tol: 1e-7, memory: 7 }
    }
}

/// Location and value of a minimum
#[derive(Debug, Clone)]
pub struct Minimum {
    /// Best parameters (inside bounds)
    pub parameters: Vec<f64>,
    /// Objective at `parameters`
    pub fval: f64,
    /// Number of iterations
    pub n_iter: u64,
    /// Number of objective evaluations
    pub n_fev: usize,
    /// Whether the solver reported convergence
    pub converged: bool,
    /// Termination message
    pub message: String,
}

impl fmt::Display for Minimum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Minimum(fval={:.6}, n_iter={}, n_fev={}, converged={})",
            self.fval, self.n_iter, self.n_fev, self.converged
        )
    }
}

/// Function to be minimized
pub trait Objective {
    /// Evaluate at `params`
    fn value(&self, params: &[f64]) -> Result<f64>;

    /// Gradient at `params` (central differences unless overridden)
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let mut grad = vec![0.0; params.len()];
        let mut shifted = params.to_vec();
        for i in 0..params.len() {
            let eps = 1e-7 * params[i].abs().max(1.0);
            shifted[i] = params[i] + eps;
            let f_plus = self.value(&shifted)?;
            shifted[i] = params[i] - eps;
            let f_minus = self.value(&shifted)?;
            shifted[i] = params[i];
            grad[i] = (f_plus - f_minus) / (2.0 * eps);
        }
        Ok(grad)
    }
}

fn clamp_params(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

/// Adapter exposing an [`Objective`] to argmin
struct Problem<'a> {
    objective: &'a dyn Objective,
    bounds: &'a [(f64, f64)],
    // Lives outside the problem, which argmin moves in and out of its line search.
    n_fev: &'a Cell<usize>,
}

impl CostFunction for Problem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        self.n_fev.set(self.n_fev.get() + 1);
        let clamped = clamp_params(params, self.bounds);
        self.objective.value(&clamped).map_err(|e| argmin::core::Error::msg(e.to_string()))
    }
}

impl Gradient for Problem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(
        &self,
        params: &Self::Param,
    ) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        let clamped = clamp_params(params, self.bounds);
        let mut g = self
            .objective
            .gradient(&clamped)
            .map_err(|e| argmin::core::Error::msg(e.to_string()))?;

        // Project: drop components pushing further through an active bound.
        const EPS: f64 = 1e-12;
        for (i, (&x, &(lo, hi))) in clamped.iter().zip(self.bounds).enumerate() {
            if (x <= lo + EPS && g[i] > 0.0) || (x >= hi - EPS && g[i] < 0.0) {
                g[i] = 0.0;
            }
        }
        Ok(g)
    }
}

/// L-BFGS with box constraints
#[derive(Debug, Clone, Default)]
pub struct BoundedLbfgs {
    config: MinimizerConfig,
}

impl BoundedLbfgs {
    /// Create a minimizer with the given configuration
    pub fn new(config: MinimizerConfig) -> Self {
        Self { config }
    }

    /// Minimize `objective` starting at `init`, keeping each parameter inside `bounds`.
    pub fn minimize(
        &self,
        objective: &dyn Objective,
        init: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<Minimum> {
        if init.len() != bounds.len() {
            return Err(Error::Validation(format!(
                "parameter and bounds length mismatch: {} != {}",
                init.len(),
                bounds.len()
            )));
        }
        let start = clamp_params(init, bounds);
        let n_fev = Cell::new(0);
        let problem = Problem { objective, bounds, n_fev: &n_fev };

        let tol_cost = if self.config.tol == 0.0 { 0.0 } else { (0.1 * self.config.tol).max(1e-14) };
        let solver = LBFGS::new(MoreThuenteLineSearch::new(), self.config.memory)
            .with_tolerance_grad(self.config.tol)
            .map_err(|e| Error::Config(format!("invalid minimizer tolerance: {e}")))?
            .with_tolerance_cost(tol_cost)
            .map_err(|e| Error::Config(format!("invalid minimizer cost tolerance: {e}")))?;

        let res = Executor::new(problem, solver)
            .configure(|state| state.param(start).max_iters(self.config.max_iter))
            .run()
            .map_err(|e| Error::Computation(format!("minimization failed: {e}")))?;

        let state = res.state();
        let best = state
            .get_best_param()
            .ok_or_else(|| Error::Computation("minimizer returned no parameters".into()))?;
        let parameters = clamp_params(best, bounds);
        let termination = state.get_termination_status();
        let converged = matches!(
            termination,
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
                | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
        );

        Ok(Minimum {
            parameters,
            fval: state.get_best_cost(),
            n_iter: state.get_iter(),
            n_fev: n_fev.get(),
            converged,
            message: termination.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // chi2 of a straight line through three exact points: minimum 0 at (1, 2).
    struct LineChi2;

    impl Objective for LineChi2 {
        fn value(&self, p: &[f64]) -> Result<f64> {
            Ok([(0.0, 1.0), (1.0, 3.0), (2.0, 5.0)]
                .iter()
                .map(|&(x, y)| (y - p[0] - p[1] * x).powi(2))
                .sum())
        }
    }

    #[test]
    fn test_minimize_line_chi2_numeric_gradient() {
        let m = BoundedLbfgs::default()
            .minimize(&LineChi2, &[0.0, 0.0], &[(-10.0, 10.0), (-10.0, 10.0)])
            .unwrap();
        assert!(m.converged, "{m}");
        assert!(m.n_fev > 0, "{m}");
        assert_relative_eq!(m.parameters[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(m.parameters[1], 2.0, epsilon = 1e-4);
        assert!(m.fval < 1e-8);
    }

    // (A - 3)^2 with A bounded below by 5: pinned at the bound.
    struct Amplitude;

    impl Objective for Amplitude {
        fn value(&self, p: &[f64]) -> Result<f64> {
            Ok((p[0] - 3.0).powi(2))
        }

        fn gradient(&self, p: &[f64]) -> Result<Vec<f64>> {
            Ok(vec![2.0 * (p[0] - 3.0)])
        }
    }

    #[test]
    fn test_minimize_stops_at_active_bound() {
        let m = BoundedLbfgs::default().minimize(&Amplitude, &[8.0], &[(5.0, 100.0)]).unwrap();
        assert_relative_eq!(m.parameters[0], 5.0, epsilon = 1e-10);
        assert_relative_eq!(m.fval, 4.0, epsilon = 1e-10);
        assert!(m.converged, "{}", m.message);
    }

    #[test]
    fn test_config_defaults_to_levenberg_marquardt() {
        let config: MinimizerConfig = serde_json::from_str(r#"{"max_iter": 50}"#).unwrap();
        assert_eq!(config.algorithm, FitAlgorithm::LevenbergMarquardt);
        assert_eq!(config.max_iter, 50);
        let lbfgs: MinimizerConfig = serde_json::from_str(r#"{"algorithm": "lbfgs"}"#).unwrap();
        assert_eq!(lbfgs.algorithm, FitAlgorithm::Lbfgs);
    }

    #[test]
    fn test_minimize_rejects_bounds_mismatch() {
        let err = BoundedLbfgs::default().minimize(&Amplitude, &[1.0, 2.0], &[(0.0, 1.0)]);
        assert!(matches!(err, Err(Error::Validation(_))));
    }
}
