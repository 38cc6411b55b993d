//! Incremental smoothing over the keyframe chain.
//!
//! Minimizes the weighted factor residuals
//!
//! ```text
//! F(x) = Σ r(x)ᵀ · Ω · r(x)
//! ```
//!
//! with Gauss-Newton. Every factor touches at most two consecutive
//! keyframes, so the normal matrix is block tridiagonal with 15×15 blocks
//! and one update pass costs O(n) block operations: assemble, eliminate
//! forward with per-block Cholesky factors, substitute backward, retract
//! the states on the manifold. Passes repeat until the largest tangent
//! step drops below the relinearization threshold.
//!
//! Factors cannot be removed; bounded graph size comes from the caller
//! rebuilding the smoother with Gaussian marginal priors.

use nalgebra::{Cholesky, Const, Matrix3, Matrix6};
use serde::Deserialize;

use super::factors::{Factor, KeyframeState, Matrix15, Vector15};
use crate::error::{FusionError, Result};

/// Smoother iteration parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmootherConfig {
    /// Stop iterating once the largest tangent step falls below this.
    pub relinearize_threshold: f64,
    /// Relinearize on every n-th update; off-cycle updates run one pass.
    pub relinearize_skip: usize,
    /// Iteration cap per relinearizing update.
    pub max_iterations: usize,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            relinearize_threshold: 0.1,
            relinearize_skip: 1,
            max_iterations: 10,
        }
    }
}

/// Result of one smoother update.
#[derive(Debug, Clone)]
pub struct UpdateReport {
    /// Number of Gauss-Newton passes performed.
    pub iterations: usize,
    /// Chi-squared error before the first pass.
    pub initial_error: f64,
    /// Chi-squared error after the last pass.
    pub final_error: f64,
    /// Whether the step-size criterion was met.
    pub converged: bool,
}

/// Incremental nonlinear least-squares smoother over keyframe states.
#[derive(Debug)]
pub struct IncrementalSmoother {
    config: SmootherConfig,
    factors: Vec<Factor>,
    states: Vec<KeyframeState>,
    update_count: usize,
}

impl IncrementalSmoother {
    /// Create an empty smoother.
    pub fn new(config: SmootherConfig) -> Self {
        Self {
            config,
            factors: Vec::new(),
            states: Vec::new(),
            update_count: 0,
        }
    }

    /// Number of keyframes in the chain.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Current estimate for a keyframe.
    pub fn estimate(&self, key: usize) -> Option<&KeyframeState> {
        self.states.get(key)
    }

    /// Incorporate new factors and initial values, then refine.
    ///
    /// New values must extend the chain contiguously; calling with empty
    /// arguments runs additional refinement passes over the existing graph.
    pub fn update(
        &mut self,
        factors: Vec<Factor>,
        values: Vec<(usize, KeyframeState)>,
    ) -> Result<UpdateReport> {
        for (key, state) in values {
            if key != self.states.len() {
                return Err(FusionError::Config(format!(
                    "initial value for keyframe {key} does not extend the chain (length {})",
                    self.states.len()
                )));
            }
            self.states.push(state);
        }

        for factor in factors {
            let (from, to) = factor.keys();
            let valid = match to {
                None => from < self.states.len(),
                Some(to) => to == from + 1 && to < self.states.len(),
            };
            if !valid {
                return Err(FusionError::Config(format!(
                    "factor over keyframes ({from}, {to:?}) does not fit a chain of length {}",
                    self.states.len()
                )));
            }
            self.factors.push(factor);
        }

        self.update_count += 1;
        let relinearizing = self.config.relinearize_skip <= 1
            || self.update_count % self.config.relinearize_skip == 0;
        let max_passes = if relinearizing {
            self.config.max_iterations
        } else {
            1
        };
        self.optimize(max_passes)
    }

    fn optimize(&mut self, max_passes: usize) -> Result<UpdateReport> {
        if self.states.is_empty() || self.factors.is_empty() {
            return Ok(UpdateReport {
                iterations: 0,
                initial_error: 0.0,
                final_error: 0.0,
                converged: true,
            });
        }

        let mut initial_error = None;
        let mut iterations = 0;
        let mut converged = false;

        for _ in 0..max_passes {
            let (diag, off, grad, chi2) = self.assemble()?;
            initial_error.get_or_insert(chi2);

            let dx = solve_chain(diag, off, &grad)?;
            for (state, step) in self.states.iter_mut().zip(dx.iter()) {
                state.retract(step);
            }
            iterations += 1;

            let max_step = dx.iter().map(|v| v.amax()).fold(0.0_f64, f64::max);
            if max_step < self.config.relinearize_threshold {
                converged = true;
                break;
            }
        }

        let final_error = self.total_error()?;
        Ok(UpdateReport {
            iterations,
            initial_error: initial_error.unwrap_or(final_error),
            final_error,
            converged,
        })
    }

    /// Assemble the block-tridiagonal normal system at the current states.
    #[allow(clippy::type_complexity)]
    fn assemble(&self) -> Result<(Vec<Matrix15>, Vec<Matrix15>, Vec<Vector15>, f64)> {
        let n = self.states.len();
        let mut diag = vec![Matrix15::zeros(); n];
        let mut off = vec![Matrix15::zeros(); n.saturating_sub(1)];
        let mut grad = vec![Vector15::zeros(); n];
        let mut chi2 = 0.0;

        for factor in &self.factors {
            let blocks = factor.linearize(&self.states)?;
            let (i, j) = blocks.keys;
            diag[i] += blocks.h_ii;
            grad[i] += blocks.b_i;
            chi2 += blocks.chi2;
            if let Some(j) = j {
                diag[j] += blocks.h_jj;
                grad[j] += blocks.b_j;
                off[i] += blocks.h_ij;
            }
        }

        Ok((diag, off, grad, chi2))
    }

    /// Total chi-squared error at the current states.
    pub fn total_error(&self) -> Result<f64> {
        let mut chi2 = 0.0;
        for factor in &self.factors {
            chi2 += factor.linearize(&self.states)?.chi2;
        }
        Ok(chi2)
    }

    /// Gaussian marginal covariance of one keyframe's full state.
    ///
    /// Eliminates the chain from both ends onto the queried keyframe and
    /// inverts the resulting marginal information.
    pub fn marginal_covariance(&self, key: usize) -> Result<Matrix15> {
        if key >= self.states.len() {
            return Err(FusionError::Config(format!(
                "marginal requested for unknown keyframe {key}"
            )));
        }

        let (diag, off, _, _) = self.assemble()?;
        let n = diag.len();

        let mut marginal_info = diag[key];

        // Message from the left: A_k = D_k − U_{k-1}ᵀ A_{k-1}⁻¹ U_{k-1}
        if key > 0 {
            let mut a = diag[0];
            for k in 1..key {
                let chol = Cholesky::new(a).ok_or(FusionError::Singular { key: k - 1 })?;
                a = diag[k] - off[k - 1].transpose() * chol.solve(&off[k - 1]);
            }
            let chol = Cholesky::new(a).ok_or(FusionError::Singular { key: key - 1 })?;
            marginal_info -= off[key - 1].transpose() * chol.solve(&off[key - 1]);
        }

        // Message from the right: B_k = D_k − U_k B_{k+1}⁻¹ U_kᵀ
        if key + 1 < n {
            let mut b = diag[n - 1];
            for k in (key + 1..n - 1).rev() {
                let chol = Cholesky::new(b).ok_or(FusionError::Singular { key: k + 1 })?;
                b = diag[k] - off[k] * chol.solve(&off[k].transpose());
            }
            let chol = Cholesky::new(b).ok_or(FusionError::Singular { key: key + 1 })?;
            marginal_info -= off[key] * chol.solve(&off[key].transpose());
        }

        Cholesky::new(marginal_info)
            .map(|c| c.inverse())
            .ok_or(FusionError::Singular { key })
    }

    /// Marginal covariance of a keyframe pose (δθ, δp).
    pub fn pose_marginal(&self, key: usize) -> Result<Matrix6<f64>> {
        Ok(self
            .marginal_covariance(key)?
            .fixed_view::<6, 6>(0, 0)
            .into_owned())
    }

    /// Marginal covariance of a keyframe velocity.
    pub fn velocity_marginal(&self, key: usize) -> Result<Matrix3<f64>> {
        Ok(self
            .marginal_covariance(key)?
            .fixed_view::<3, 3>(6, 6)
            .into_owned())
    }

    /// Marginal covariance of a keyframe bias (δba, δbg).
    pub fn bias_marginal(&self, key: usize) -> Result<Matrix6<f64>> {
        Ok(self
            .marginal_covariance(key)?
            .fixed_view::<6, 6>(9, 9)
            .into_owned())
    }
}

/// Solve the block-tridiagonal system `H · x = −grad` with the block
/// Thomas algorithm (forward Schur elimination, backward substitution).
fn solve_chain(
    diag: Vec<Matrix15>,
    off: Vec<Matrix15>,
    grad: &[Vector15],
) -> Result<Vec<Vector15>> {
    let n = diag.len();
    let mut a = diag;
    let mut rhs: Vec<Vector15> = grad.iter().map(|g| -g).collect();

    let mut chols: Vec<Cholesky<f64, Const<15>>> = Vec::with_capacity(n);
    let mut ainv_u: Vec<Matrix15> = Vec::with_capacity(n.saturating_sub(1));

    for k in 0..n {
        let chol = Cholesky::new(a[k]).ok_or(FusionError::Singular { key: k })?;
        if k + 1 < n {
            let au = chol.solve(&off[k]);
            let ar = chol.solve(&rhs[k]);
            a[k + 1] -= off[k].transpose() * &au;
            rhs[k + 1] -= off[k].transpose() * ar;
            ainv_u.push(au);
        }
        chols.push(chol);
    }

    let mut x = vec![Vector15::zeros(); n];
    x[n - 1] = chols[n - 1].solve(&rhs[n - 1]);
    for k in (0..n - 1).rev() {
        x[k] = chols[k].solve(&rhs[k]) - &ainv_u[k] * x[k + 1];
    }

    Ok(x)
}
