//! Whole-trace fit of a saturating sigmoid edge.
//!
//! Model: `f(x) = d + (a - d) / (1 + (x / c)^b)` evaluated on 1-based sample
//! coordinates. The solver is a Levenberg-Marquardt trust-region iteration
//! with Marquardt diagonal scaling and an analytic Jacobian.

use nalgebra::{DMatrix, DVector, Matrix4, Vector4};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// The solver works on `x = index + X_OFFSET`.
pub const X_OFFSET: f64 = 1.0;

const XTOL: f64 = 1e-8;
const GTOL: f64 = 1e-8;
const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MAX: f64 = 1e16;
const MAX_LAMBDA_STEPS: usize = 40;

/// Parameters of [`EdgeFitter`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeFitParams {
    /// Initial guess `[a, b, c, d]`, with `c` in 0-based sample units.
    pub initial: [f64; 4],
    /// Maximum number of outer iterations.
    pub max_iterations: usize,
    /// If positive, sample `i` is weighted by `weights_scale * y[i]`.
    pub weights_scale: f64,
}

impl Default for EdgeFitParams {
    fn default() -> Self {
        Self {
            initial: [0.0, 2.0, 100.0, 0.05],
            max_iterations: 100,
            weights_scale: 0.0,
        }
    }
}

/// Converged edge fit.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeFit {
    /// Level on the left of the edge.
    pub amplitude: f64,
    /// Sharpness exponent.
    pub sharpness: f64,
    /// Edge position in 0-based sample units.
    pub position: f64,
    /// Level on the right of the edge.
    pub baseline: f64,
    /// Standard errors of `[a, b, c, d]`, scaled by `max(1, sqrt(chi2 / dof))`.
    pub errors: [f64; 4],
    /// Weighted chi-square per degree of freedom.
    pub chi2_per_dof: f64,
    pub iterations: usize,
}

impl EdgeFit {
    /// Model value at 0-based sample `index`.
    pub fn eval(&self, index: f64) -> f64 {
        sigmoid(
            index + X_OFFSET,
            self.amplitude,
            self.sharpness,
            self.position + X_OFFSET,
            self.baseline,
        )
    }
}

/// Why a fit did not produce a result.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EdgeFitError {
    #[error("trace has {got} samples, the fitter is configured for {expected}")]
    Length { expected: usize, got: usize },
    #[error("need more than 4 samples to fit 4 parameters (got {0})")]
    TooFewSamples(usize),
    #[error("did not converge within {0} iterations")]
    MaxIterations(usize),
    #[error("no further progress possible")]
    NoProgress,
    #[error("initial parameters give a non-finite model")]
    BadStart,
}

/// `d + (a - d) / (1 + (x / c)^b)`.
#[inline]
pub fn sigmoid(x: f64, a: f64, b: f64, c: f64, d: f64) -> f64 {
    d + (a - d) / (1.0 + (x / c).powf(b))
}

/// Iterative sigmoid fitter with preallocated workspace for a fixed length.
#[derive(Clone, Debug)]
pub struct EdgeFitter {
    params: EdgeFitParams,
    x: Vec<f64>,
    weights: Vec<f64>,
    residual: DVector<f64>,
    trial: DVector<f64>,
    jacobian: DMatrix<f64>,
}

impl EdgeFitter {
    pub fn new(len: usize, params: EdgeFitParams) -> Self {
        Self {
            params,
            x: (0..len).map(|i| i as f64 + X_OFFSET).collect(),
            weights: vec![1.0; len],
            residual: DVector::zeros(len),
            trial: DVector::zeros(len),
            jacobian: DMatrix::zeros(len, 4),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    #[inline]
    pub fn params(&self) -> &EdgeFitParams {
        &self.params
    }

    /// Fit the model to `y`.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, y), fields(n = y.len()))
    )]
    pub fn fit(&mut self, y: &[f64]) -> Result<EdgeFit, EdgeFitError> {
        let n = self.x.len();
        if y.len() != n {
            return Err(EdgeFitError::Length {
                expected: n,
                got: y.len(),
            });
        }
        if n <= 4 {
            return Err(EdgeFitError::TooFewSamples(n));
        }

        if self.params.weights_scale > 0.0 {
            for (w, &v) in self.weights.iter_mut().zip(y) {
                *w = (self.params.weights_scale * v).max(0.0);
            }
        } else {
            self.weights.fill(1.0);
        }

        let [a0, b0, c0, d0] = self.params.initial;
        let mut p = Vector4::new(a0, b0, c0 + X_OFFSET, d0);
        let mut cost = self.eval_residual(&p, y, false);
        if !cost.is_finite() {
            return Err(EdgeFitError::BadStart);
        }

        let mut lambda = LAMBDA_INIT;
        let mut converged = false;
        let mut iterations = 0;

        'outer: while iterations < self.params.max_iterations {
            iterations += 1;
            self.eval_jacobian(&p);
            let (jtj, grad) = self.normal_equations();

            let gnorm = grad
                .iter()
                .zip(p.iter())
                .map(|(g, x)| (g * x.abs().max(1.0)).abs())
                .fold(0.0, f64::max);
            if gnorm <= GTOL * cost.max(f64::MIN_POSITIVE) || cost == 0.0 {
                converged = true;
                break;
            }

            for _ in 0..MAX_LAMBDA_STEPS {
                let mut damped = jtj;
                for k in 0..4 {
                    damped[(k, k)] += lambda * jtj[(k, k)].max(1e-12);
                }
                let Some(step) = damped.cholesky().map(|c| c.solve(&(-grad))) else {
                    lambda *= 10.0;
                    continue;
                };
                let candidate = p + step;
                let small_step = step
                    .iter()
                    .zip(candidate.iter())
                    .all(|(s, x)| s.abs() <= XTOL * (x.abs() + XTOL));
                let trial_cost = self.eval_residual(&candidate, y, true);
                if trial_cost.is_finite() && trial_cost <= cost {
                    p = candidate;
                    std::mem::swap(&mut self.residual, &mut self.trial);
                    cost = trial_cost;
                    lambda = (lambda / 3.0).max(1e-12);
                    if small_step {
                        converged = true;
                        break 'outer;
                    }
                    continue 'outer;
                }
                // Rejected steps shrink with growing damping; once they
                // drop below tolerance the current point is the minimum.
                if small_step {
                    converged = true;
                    break 'outer;
                }
                lambda *= 2.0;
                if lambda > LAMBDA_MAX {
                    break;
                }
            }
            return Err(EdgeFitError::NoProgress);
        }

        if !converged {
            return Err(EdgeFitError::MaxIterations(self.params.max_iterations));
        }

        self.eval_jacobian(&p);
        let (jtj, _) = self.normal_equations();
        let dof = (n - 4) as f64;
        let chi2_per_dof = cost / dof;
        let scale = (chi2_per_dof.sqrt()).max(1.0);
        let mut errors = [f64::NAN; 4];
        if let Some(cov) = jtj.try_inverse() {
            for (k, e) in errors.iter_mut().enumerate() {
                *e = scale * cov[(k, k)].max(0.0).sqrt();
            }
        }

        Ok(EdgeFit {
            amplitude: p[0],
            sharpness: p[1],
            position: p[2] - X_OFFSET,
            baseline: p[3],
            errors,
            chi2_per_dof,
            iterations,
        })
    }

    /// Weighted sum of squared residuals; writes residuals to `trial` or `residual`.
    fn eval_residual(&mut self, p: &Vector4<f64>, y: &[f64], trial: bool) -> f64 {
        let (a, b, c, d) = (p[0], p[1], p[2], p[3]);
        if c <= 0.0 {
            return f64::INFINITY;
        }
        let out = if trial {
            &mut self.trial
        } else {
            &mut self.residual
        };
        let mut cost = 0.0;
        for i in 0..self.x.len() {
            let r = sigmoid(self.x[i], a, b, c, d) - y[i];
            out[i] = r;
            cost += self.weights[i] * r * r;
        }
        cost
    }

    fn eval_jacobian(&mut self, p: &Vector4<f64>) {
        let (a, b, c, d) = (p[0], p[1], p[2], p[3]);
        for (i, &x) in self.x.iter().enumerate() {
            let e = x / c;
            let f = e.powf(b);
            let g = (f + 1.0) * (f + 1.0);
            self.jacobian[(i, 0)] = 1.0 / (1.0 + f);
            self.jacobian[(i, 1)] = (d - a) * f * e.ln() / g;
            self.jacobian[(i, 2)] = b * (a - d) * f / (g * c);
            self.jacobian[(i, 3)] = 1.0 - 1.0 / (1.0 + f);
        }
    }

    /// `(J^T W J, J^T W r)` for the current Jacobian and residual.
    fn normal_equations(&self) -> (Matrix4<f64>, Vector4<f64>) {
        let mut jtj = Matrix4::zeros();
        let mut grad = Vector4::zeros();
        for i in 0..self.x.len() {
            let w = self.weights[i];
            if w == 0.0 {
                continue;
            }
            let row = Vector4::new(
                self.jacobian[(i, 0)],
                self.jacobian[(i, 1)],
                self.jacobian[(i, 2)],
                self.jacobian[(i, 3)],
            );
            jtj += w * row * row.transpose();
            grad += w * self.residual[i] * row;
        }
        (jtj, grad)
    }
}
