//! Factors constraining keyframe states.
//!
//! A keyframe carries a 15-dimensional state: pose (rotation + position),
//! linear velocity, and IMU bias. Tangent-space perturbations are ordered
//!
//! ```text
//! [ δθ(0..3) | δp(3..6) | δv(6..9) | δba(9..12) | δbg(12..15) ]
//! ```
//!
//! with the rotation perturbed on the right (`R ← R · Exp(δθ)`) and all
//! other components perturbed additively. Each factor knows how to
//! linearize itself at the current states into weighted Gauss-Newton
//! blocks; the smoother assembles those blocks into the chain system.

use nalgebra::{Matrix3, Matrix6, SMatrix, SVector, Vector3, Vector6};

use crate::core::math::{exp_so3, log_so3, right_jacobian, right_jacobian_inv, skew};
use crate::core::types::{ImuBias, Pose3};
use crate::error::{FusionError, Result};
use crate::sensors::preintegration::Preintegration;

/// Tangent dimension of one keyframe state.
pub const STATE_DIM: usize = 15;

pub type Vector15 = SVector<f64, 15>;
pub type Matrix15 = SMatrix<f64, 15, 15>;

/// The variables tracked per keyframe.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyframeState {
    /// Body pose in the world frame.
    pub pose: Pose3,
    /// Linear velocity in the world frame.
    pub velocity: Vector3<f64>,
    /// IMU bias active since this keyframe.
    pub bias: ImuBias,
}

impl KeyframeState {
    /// Create a keyframe state.
    pub fn new(pose: Pose3, velocity: Vector3<f64>, bias: ImuBias) -> Self {
        Self {
            pose,
            velocity,
            bias,
        }
    }

    /// Apply a tangent-space update.
    pub fn retract(&mut self, dx: &Vector15) {
        let dtheta = Vector3::new(dx[0], dx[1], dx[2]);
        let mut rotation = self.pose.rotation * exp_so3(&dtheta);
        rotation.renormalize();
        self.pose.rotation = rotation;
        self.pose.translation += Vector3::new(dx[3], dx[4], dx[5]);
        self.velocity += Vector3::new(dx[6], dx[7], dx[8]);
        self.bias.acc += Vector3::new(dx[9], dx[10], dx[11]);
        self.bias.gyr += Vector3::new(dx[12], dx[13], dx[14]);
    }
}

/// A constraint on one or two consecutive keyframes.
#[derive(Debug, Clone)]
pub enum Factor {
    /// Gaussian prior on a keyframe pose; covariance ordered (δθ, δp).
    PosePrior {
        key: usize,
        pose: Pose3,
        covariance: Matrix6<f64>,
    },
    /// Gaussian prior on a keyframe velocity.
    VelocityPrior {
        key: usize,
        velocity: Vector3<f64>,
        covariance: Matrix3<f64>,
    },
    /// Gaussian prior on a keyframe bias; covariance ordered (δba, δbg).
    BiasPrior {
        key: usize,
        bias: ImuBias,
        covariance: Matrix6<f64>,
    },
    /// Preintegrated inertial constraint between consecutive keyframes.
    Imu {
        from: usize,
        to: usize,
        preint: Preintegration,
        gravity: Vector3<f64>,
    },
    /// Zero-mean random-walk constraint between consecutive biases, with
    /// per-axis standard deviations (δba, δbg).
    BiasBetween {
        from: usize,
        to: usize,
        sigmas: Vector6<f64>,
    },
}

impl Factor {
    /// Pose prior from per-axis standard deviations (δθ, δp).
    pub fn pose_prior(key: usize, pose: Pose3, sigmas: Vector6<f64>) -> Self {
        Factor::PosePrior {
            key,
            pose,
            covariance: Matrix6::from_diagonal(&sigmas.component_mul(&sigmas)),
        }
    }

    /// Pose prior with a full covariance, as captured from a marginal.
    pub fn pose_prior_with_covariance(key: usize, pose: Pose3, covariance: Matrix6<f64>) -> Self {
        Factor::PosePrior {
            key,
            pose,
            covariance,
        }
    }

    /// Isotropic velocity prior.
    pub fn velocity_prior(key: usize, velocity: Vector3<f64>, sigma: f64) -> Self {
        Factor::VelocityPrior {
            key,
            velocity,
            covariance: Matrix3::identity() * sigma * sigma,
        }
    }

    /// Velocity prior with a full covariance.
    pub fn velocity_prior_with_covariance(
        key: usize,
        velocity: Vector3<f64>,
        covariance: Matrix3<f64>,
    ) -> Self {
        Factor::VelocityPrior {
            key,
            velocity,
            covariance,
        }
    }

    /// Isotropic bias prior.
    pub fn bias_prior(key: usize, bias: ImuBias, sigma: f64) -> Self {
        Factor::BiasPrior {
            key,
            bias,
            covariance: Matrix6::identity() * sigma * sigma,
        }
    }

    /// Bias prior with a full covariance.
    pub fn bias_prior_with_covariance(key: usize, bias: ImuBias, covariance: Matrix6<f64>) -> Self {
        Factor::BiasPrior {
            key,
            bias,
            covariance,
        }
    }

    /// Inertial factor over an accumulated preintegration interval.
    pub fn imu(from: usize, to: usize, preint: Preintegration, gravity: Vector3<f64>) -> Self {
        Factor::Imu {
            from,
            to,
            preint,
            gravity,
        }
    }

    /// Bias random-walk factor.
    pub fn bias_between(from: usize, to: usize, sigmas: Vector6<f64>) -> Self {
        Factor::BiasBetween { from, to, sigmas }
    }

    /// The keyframes this factor touches.
    pub fn keys(&self) -> (usize, Option<usize>) {
        match self {
            Factor::PosePrior { key, .. }
            | Factor::VelocityPrior { key, .. }
            | Factor::BiasPrior { key, .. } => (*key, None),
            Factor::Imu { from, to, .. } | Factor::BiasBetween { from, to, .. } => {
                (*from, Some(*to))
            }
        }
    }

    /// Linearize at the current states into weighted Gauss-Newton blocks.
    pub(crate) fn linearize(&self, states: &[KeyframeState]) -> Result<FactorBlocks> {
        match self {
            Factor::PosePrior {
                key,
                pose,
                covariance,
            } => {
                let state = &states[*key];
                let rot_err = pose.rotation.inverse() * state.pose.rotation;
                let r_theta = log_so3(&rot_err);
                let r_pos = state.pose.translation - pose.translation;

                let mut residual = Vector6::zeros();
                residual.fixed_rows_mut::<3>(0).copy_from(&r_theta);
                residual.fixed_rows_mut::<3>(3).copy_from(&r_pos);

                let mut jac = SMatrix::<f64, 6, 15>::zeros();
                jac.fixed_view_mut::<3, 3>(0, 0)
                    .copy_from(&right_jacobian_inv(&r_theta));
                jac.fixed_view_mut::<3, 3>(3, 3)
                    .copy_from(&Matrix3::identity());

                let info = invert_covariance(covariance, *key)?;
                Ok(FactorBlocks::unary(*key, &jac, &info, &residual))
            }

            Factor::VelocityPrior {
                key,
                velocity,
                covariance,
            } => {
                let residual = states[*key].velocity - velocity;

                let mut jac = SMatrix::<f64, 3, 15>::zeros();
                jac.fixed_view_mut::<3, 3>(0, 6)
                    .copy_from(&Matrix3::identity());

                let info = invert_covariance(covariance, *key)?;
                Ok(FactorBlocks::unary(*key, &jac, &info, &residual))
            }

            Factor::BiasPrior {
                key,
                bias,
                covariance,
            } => {
                let state = &states[*key];
                let mut residual = Vector6::zeros();
                residual
                    .fixed_rows_mut::<3>(0)
                    .copy_from(&(state.bias.acc - bias.acc));
                residual
                    .fixed_rows_mut::<3>(3)
                    .copy_from(&(state.bias.gyr - bias.gyr));

                let mut jac = SMatrix::<f64, 6, 15>::zeros();
                jac.fixed_view_mut::<3, 3>(0, 9)
                    .copy_from(&Matrix3::identity());
                jac.fixed_view_mut::<3, 3>(3, 12)
                    .copy_from(&Matrix3::identity());

                let info = invert_covariance(covariance, *key)?;
                Ok(FactorBlocks::unary(*key, &jac, &info, &residual))
            }

            Factor::BiasBetween { from, to, sigmas } => {
                let bi = &states[*from].bias;
                let bj = &states[*to].bias;

                let mut residual = Vector6::zeros();
                residual.fixed_rows_mut::<3>(0).copy_from(&(bj.acc - bi.acc));
                residual.fixed_rows_mut::<3>(3).copy_from(&(bj.gyr - bi.gyr));

                let mut jac_i = SMatrix::<f64, 6, 15>::zeros();
                jac_i
                    .fixed_view_mut::<3, 3>(0, 9)
                    .copy_from(&(-Matrix3::identity()));
                jac_i
                    .fixed_view_mut::<3, 3>(3, 12)
                    .copy_from(&(-Matrix3::identity()));

                let mut jac_j = SMatrix::<f64, 6, 15>::zeros();
                jac_j
                    .fixed_view_mut::<3, 3>(0, 9)
                    .copy_from(&Matrix3::identity());
                jac_j
                    .fixed_view_mut::<3, 3>(3, 12)
                    .copy_from(&Matrix3::identity());

                let mut info = Matrix6::zeros();
                for i in 0..6 {
                    if sigmas[i] <= 0.0 {
                        return Err(FusionError::Config(
                            "bias random-walk sigmas must be positive".into(),
                        ));
                    }
                    info[(i, i)] = 1.0 / (sigmas[i] * sigmas[i]);
                }

                Ok(FactorBlocks::binary(
                    *from, *to, &jac_i, &jac_j, &info, &residual,
                ))
            }

            Factor::Imu {
                from,
                to,
                preint,
                gravity,
            } => {
                let si = &states[*from];
                let sj = &states[*to];
                let dt = preint.delta_time;

                let (delta_rot, delta_vel, delta_pos) = preint.corrected_deltas(&si.bias);
                let rot_i_t = si.pose.rotation.to_rotation_matrix().matrix().transpose();

                // Residuals, ordered like the preintegration covariance.
                let rot_err = delta_rot.inverse() * si.pose.rotation.inverse() * sj.pose.rotation;
                let r_theta = log_so3(&rot_err);
                let u_vel = sj.velocity - si.velocity - gravity * dt;
                let r_vel = rot_i_t * u_vel - delta_vel;
                let u_pos = sj.pose.translation
                    - si.pose.translation
                    - si.velocity * dt
                    - 0.5 * gravity * dt * dt;
                let r_pos = rot_i_t * u_pos - delta_pos;

                let mut residual = SVector::<f64, 9>::zeros();
                residual.fixed_rows_mut::<3>(0).copy_from(&r_theta);
                residual.fixed_rows_mut::<3>(3).copy_from(&r_vel);
                residual.fixed_rows_mut::<3>(6).copy_from(&r_pos);

                let jr_inv = right_jacobian_inv(&r_theta);
                let rot_ji = (sj.pose.rotation.inverse() * si.pose.rotation)
                    .to_rotation_matrix()
                    .into_inner();

                // Chain of the first-order bias correction through the
                // rotation residual.
                let dbg = si.bias.gyr - preint.bias.gyr;
                let jr_bias = right_jacobian(&(preint.d_rot_d_gyr_bias * dbg));
                let exp_r_t = exp_so3(&r_theta).to_rotation_matrix().matrix().transpose();
                let dr_dbg = -jr_inv * exp_r_t * jr_bias * preint.d_rot_d_gyr_bias;

                let mut jac_i = SMatrix::<f64, 9, 15>::zeros();
                jac_i
                    .fixed_view_mut::<3, 3>(0, 0)
                    .copy_from(&(-jr_inv * rot_ji));
                jac_i.fixed_view_mut::<3, 3>(0, 12).copy_from(&dr_dbg);
                jac_i
                    .fixed_view_mut::<3, 3>(3, 0)
                    .copy_from(&skew(&(rot_i_t * u_vel)));
                jac_i.fixed_view_mut::<3, 3>(3, 6).copy_from(&(-rot_i_t));
                jac_i
                    .fixed_view_mut::<3, 3>(3, 9)
                    .copy_from(&(-preint.d_vel_d_acc_bias));
                jac_i
                    .fixed_view_mut::<3, 3>(3, 12)
                    .copy_from(&(-preint.d_vel_d_gyr_bias));
                jac_i
                    .fixed_view_mut::<3, 3>(6, 0)
                    .copy_from(&skew(&(rot_i_t * u_pos)));
                jac_i.fixed_view_mut::<3, 3>(6, 3).copy_from(&(-rot_i_t));
                jac_i
                    .fixed_view_mut::<3, 3>(6, 6)
                    .copy_from(&(-rot_i_t * dt));
                jac_i
                    .fixed_view_mut::<3, 3>(6, 9)
                    .copy_from(&(-preint.d_pos_d_acc_bias));
                jac_i
                    .fixed_view_mut::<3, 3>(6, 12)
                    .copy_from(&(-preint.d_pos_d_gyr_bias));

                let mut jac_j = SMatrix::<f64, 9, 15>::zeros();
                jac_j.fixed_view_mut::<3, 3>(0, 0).copy_from(&jr_inv);
                jac_j.fixed_view_mut::<3, 3>(3, 6).copy_from(&rot_i_t);
                jac_j.fixed_view_mut::<3, 3>(6, 3).copy_from(&rot_i_t);

                let info = invert_covariance(&preint.covariance, *from)?;
                Ok(FactorBlocks::binary(
                    *from, *to, &jac_i, &jac_j, &info, &residual,
                ))
            }
        }
    }
}

/// Weighted Gauss-Newton contribution of a single factor.
#[derive(Debug, Clone)]
pub(crate) struct FactorBlocks {
    pub keys: (usize, Option<usize>),
    pub h_ii: Matrix15,
    pub h_jj: Matrix15,
    /// Coupling block between `keys.0` (rows) and `keys.1` (columns).
    pub h_ij: Matrix15,
    pub b_i: Vector15,
    pub b_j: Vector15,
    pub chi2: f64,
}

impl FactorBlocks {
    fn unary<const R: usize>(
        key: usize,
        jac: &SMatrix<f64, R, 15>,
        info: &SMatrix<f64, R, R>,
        residual: &SVector<f64, R>,
    ) -> Self {
        let weighted = info * jac;
        let weighted_residual = info * residual;
        Self {
            keys: (key, None),
            h_ii: jac.transpose() * weighted,
            h_jj: Matrix15::zeros(),
            h_ij: Matrix15::zeros(),
            b_i: jac.transpose() * weighted_residual,
            b_j: Vector15::zeros(),
            chi2: residual.dot(&weighted_residual),
        }
    }

    fn binary<const R: usize>(
        from: usize,
        to: usize,
        jac_i: &SMatrix<f64, R, 15>,
        jac_j: &SMatrix<f64, R, 15>,
        info: &SMatrix<f64, R, R>,
        residual: &SVector<f64, R>,
    ) -> Self {
        let weighted_i = info * jac_i;
        let weighted_j = info * jac_j;
        let weighted_residual = info * residual;
        Self {
            keys: (from, Some(to)),
            h_ii: jac_i.transpose() * weighted_i,
            h_jj: jac_j.transpose() * weighted_j,
            h_ij: jac_i.transpose() * weighted_j,
            b_i: jac_i.transpose() * weighted_residual,
            b_j: jac_j.transpose() * weighted_residual,
            chi2: residual.dot(&weighted_residual),
        }
    }
}

/// Invert a factor covariance into an information matrix.
fn invert_covariance<const R: usize>(
    covariance: &SMatrix<f64, R, R>,
    key: usize,
) -> Result<SMatrix<f64, R, R>> {
    nalgebra::Cholesky::new(*covariance)
        .map(|c| c.inverse())
        .ok_or(FusionError::Singular { key })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::NavState;
    use crate::sensors::preintegration::{PreintegrationParams, Preintegrator};
    use nalgebra::UnitQuaternion;

    fn sample_states() -> Vec<KeyframeState> {
        vec![
            KeyframeState::new(
                Pose3::new(
                    UnitQuaternion::from_euler_angles(0.05, -0.02, 0.1),
                    Vector3::new(0.1, -0.2, 0.05),
                ),
                Vector3::new(0.4, -0.1, 0.2),
                ImuBias::new(Vector3::new(0.02, -0.01, 0.015), Vector3::new(0.003, 0.001, -0.002)),
            ),
            KeyframeState::new(
                Pose3::new(
                    UnitQuaternion::from_euler_angles(0.07, 0.01, 0.13),
                    Vector3::new(0.18, -0.21, 0.02),
                ),
                Vector3::new(0.5, -0.05, 0.15),
                ImuBias::new(Vector3::new(0.025, -0.012, 0.01), Vector3::new(0.002, 0.0, -0.001)),
            ),
        ]
    }

    fn integrated_factor() -> Factor {
        let params = PreintegrationParams {
            gravity: 9.81,
            ..Default::default()
        };
        let mut preint = Preintegrator::new(params.clone(), ImuBias::zero());
        for i in 0..50 {
            let acc = Vector3::new(0.2, -0.1 + 0.001 * i as f64, 9.75);
            let gyr = Vector3::new(0.05, -0.02, 0.3);
            preint.integrate(&acc, &gyr, 0.002).unwrap();
        }
        Factor::imu(0, 1, preint.delta().clone(), params.gravity_vector())
    }

    /// Central-difference check of the assembled gradient: for chi2(x) =
    /// rᵀWr, the directional derivative along tangent axis k of keyframe i
    /// must equal 2 * b_i[k].
    fn check_gradient(factor: &Factor, states: &[KeyframeState]) {
        let blocks = factor.linearize(states).unwrap();
        let h = 1e-6;

        let keys = [Some(blocks.keys.0), blocks.keys.1];
        let grads = [&blocks.b_i, &blocks.b_j];

        for (key, grad) in keys.iter().zip(grads.iter()) {
            let Some(key) = key else { continue };
            for axis in 0..STATE_DIM {
                let mut dx = Vector15::zeros();
                dx[axis] = h;

                let mut plus = states.to_vec();
                plus[*key].retract(&dx);
                let chi_plus = factor.linearize(&plus).unwrap().chi2;

                dx[axis] = -h;
                let mut minus = states.to_vec();
                minus[*key].retract(&dx);
                let chi_minus = factor.linearize(&minus).unwrap().chi2;

                let numeric = (chi_plus - chi_minus) / (2.0 * h);
                let analytic = 2.0 * grad[axis];
                let scale = numeric.abs().max(analytic.abs()).max(1.0);
                assert!(
                    (numeric - analytic).abs() / scale < 1e-4,
                    "gradient mismatch: key {key} axis {axis}: numeric {numeric:.6e} vs analytic {analytic:.6e}"
                );
            }
        }
    }

    #[test]
    fn test_pose_prior_gradient() {
        let factor = Factor::pose_prior(
            0,
            Pose3::new(
                UnitQuaternion::from_euler_angles(0.0, 0.0, 0.05),
                Vector3::new(0.0, -0.1, 0.0),
            ),
            Vector6::repeat(0.1),
        );
        check_gradient(&factor, &sample_states());
    }

    #[test]
    fn test_velocity_prior_gradient() {
        let factor = Factor::velocity_prior(0, Vector3::new(0.1, 0.0, 0.0), 0.5);
        check_gradient(&factor, &sample_states());
    }

    #[test]
    fn test_bias_prior_gradient() {
        let factor = Factor::bias_prior(1, ImuBias::zero(), 1e-2);
        check_gradient(&factor, &sample_states());
    }

    #[test]
    fn test_bias_between_gradient() {
        let factor = Factor::bias_between(0, 1, Vector6::repeat(1e-3));
        check_gradient(&factor, &sample_states());
    }

    #[test]
    fn test_imu_factor_gradient() {
        check_gradient(&integrated_factor(), &sample_states());
    }

    #[test]
    fn test_imu_factor_zero_residual_on_predicted_state() {
        // A second keyframe produced by predict() must satisfy the factor.
        let params = PreintegrationParams {
            gravity: 9.81,
            ..Default::default()
        };
        let mut preint = Preintegrator::new(params.clone(), ImuBias::zero());
        for _ in 0..100 {
            preint
                .integrate(&Vector3::new(0.1, 0.0, 9.81), &Vector3::new(0.0, 0.0, 0.1), 0.002)
                .unwrap();
        }

        let start = NavState::identity();
        let predicted = preint.predict(&start, &ImuBias::zero());

        let states = vec![
            KeyframeState::new(start.pose, start.velocity, ImuBias::zero()),
            KeyframeState::new(predicted.pose, predicted.velocity, ImuBias::zero()),
        ];
        let factor = Factor::imu(0, 1, preint.delta().clone(), params.gravity_vector());
        let blocks = factor.linearize(&states).unwrap();
        assert!(
            blocks.chi2 < 1e-9,
            "chi2 should vanish on the predicted state: {}",
            blocks.chi2
        );
    }

    #[test]
    fn test_prior_zero_residual_at_mean() {
        let states = sample_states();
        let factor = Factor::pose_prior_with_covariance(
            0,
            states[0].pose,
            Matrix6::identity() * 1e-4,
        );
        let blocks = factor.linearize(&states).unwrap();
        assert!(blocks.chi2 < 1e-12);
    }

    #[test]
    fn test_keys() {
        assert_eq!(
            Factor::velocity_prior(3, Vector3::zeros(), 1.0).keys(),
            (3, None)
        );
        assert_eq!(
            Factor::bias_between(4, 5, Vector6::repeat(1.0)).keys(),
            (4, Some(5))
        );
    }
}
