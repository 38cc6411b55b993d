//! Inertial preintegration between keyframes.
//!
//! Accumulates high-rate inertial samples into a single relative motion
//! constraint (Δrotation, Δvelocity, Δposition) parameterized by a
//! reference bias, so the constraint does not need to be recomputed when
//! the bias estimate moves slightly during optimization.
//!
//! # Algorithm
//!
//! Iterative on-manifold integration:
//!
//! 1. The rotation increment from the bias-corrected gyroscope reading is
//!    composed on the right: `ΔR ← ΔR · Exp((ω - bg) dt)`.
//! 2. The bias-corrected specific force is rotated into the running frame
//!    (using the midpoint rotation) and integrated into Δvelocity and
//!    Δposition.
//! 3. First-order Jacobians of each increment with respect to small bias
//!    perturbations are updated recursively, and the 9×9 covariance
//!    (δθ, δv, δp) is propagated from the continuous-time noise densities.
//!
//! Gravity never enters the increments; it is applied by [`Preintegrator::predict`]
//! when mapping a start state across the accumulated interval.

use nalgebra::{Matrix3, SMatrix, UnitQuaternion, Vector3};

use crate::core::math::{exp_so3, right_jacobian, skew};
use crate::core::types::{ImuBias, NavState, Pose3};
use crate::error::{FusionError, Result};

/// 9×9 covariance over (δθ, δv, δp).
pub type Matrix9 = SMatrix<f64, 9, 9>;

/// Noise model and gravity for preintegration.
#[derive(Debug, Clone)]
pub struct PreintegrationParams {
    /// Gravity magnitude (m/s²); gravity points along -z of the world frame.
    pub gravity: f64,
    /// Accelerometer continuous-time white-noise density.
    pub acc_noise_density: f64,
    /// Gyroscope continuous-time white-noise density.
    pub gyr_noise_density: f64,
    /// Noise density of the velocity-to-position integration.
    pub integration_sigma: f64,
}

impl Default for PreintegrationParams {
    fn default() -> Self {
        Self {
            gravity: 9.80511,
            acc_noise_density: 3.9939570888238808e-3,
            gyr_noise_density: 1.5636343949698187e-3,
            integration_sigma: 1e-4,
        }
    }
}

impl PreintegrationParams {
    /// Gravity as a world-frame vector.
    #[inline]
    pub fn gravity_vector(&self) -> Vector3<f64> {
        Vector3::new(0.0, 0.0, -self.gravity)
    }
}

/// Accumulated relative motion between two keyframes.
#[derive(Debug, Clone)]
pub struct Preintegration {
    /// Reference bias the increments were integrated with.
    pub bias: ImuBias,
    /// Rotation increment.
    pub delta_rotation: UnitQuaternion<f64>,
    /// Velocity increment in the start body frame.
    pub delta_velocity: Vector3<f64>,
    /// Position increment in the start body frame.
    pub delta_position: Vector3<f64>,
    /// Integrated interval Δt_ij (s).
    pub delta_time: f64,
    /// Covariance of (δθ, δv, δp).
    pub covariance: Matrix9,
    /// d(Δrotation) / d(gyro bias)
    pub d_rot_d_gyr_bias: Matrix3<f64>,
    /// d(Δvelocity) / d(gyro bias)
    pub d_vel_d_gyr_bias: Matrix3<f64>,
    /// d(Δvelocity) / d(accel bias)
    pub d_vel_d_acc_bias: Matrix3<f64>,
    /// d(Δposition) / d(gyro bias)
    pub d_pos_d_gyr_bias: Matrix3<f64>,
    /// d(Δposition) / d(accel bias)
    pub d_pos_d_acc_bias: Matrix3<f64>,
}

impl Preintegration {
    fn new(bias: ImuBias) -> Self {
        Self {
            bias,
            delta_rotation: UnitQuaternion::identity(),
            delta_velocity: Vector3::zeros(),
            delta_position: Vector3::zeros(),
            delta_time: 0.0,
            covariance: Matrix9::zeros(),
            d_rot_d_gyr_bias: Matrix3::zeros(),
            d_vel_d_gyr_bias: Matrix3::zeros(),
            d_vel_d_acc_bias: Matrix3::zeros(),
            d_pos_d_gyr_bias: Matrix3::zeros(),
            d_pos_d_acc_bias: Matrix3::zeros(),
        }
    }

    /// Increments corrected to first order for a bias that deviates from
    /// the reference bias.
    pub fn corrected_deltas(
        &self,
        bias: &ImuBias,
    ) -> (UnitQuaternion<f64>, Vector3<f64>, Vector3<f64>) {
        let dbg = bias.gyr - self.bias.gyr;
        let dba = bias.acc - self.bias.acc;

        let rotation = self.delta_rotation * exp_so3(&(self.d_rot_d_gyr_bias * dbg));
        let velocity =
            self.delta_velocity + self.d_vel_d_gyr_bias * dbg + self.d_vel_d_acc_bias * dba;
        let position =
            self.delta_position + self.d_pos_d_gyr_bias * dbg + self.d_pos_d_acc_bias * dba;

        (rotation, velocity, position)
    }
}

/// Resettable accumulator over one inter-keyframe interval.
#[derive(Debug, Clone)]
pub struct Preintegrator {
    params: PreintegrationParams,
    delta: Preintegration,
}

impl Preintegrator {
    /// Create a preintegrator with the given noise model and reference bias.
    pub fn new(params: PreintegrationParams, bias: ImuBias) -> Self {
        Self {
            params,
            delta: Preintegration::new(bias),
        }
    }

    /// Discard the accumulated increments and adopt a new reference bias.
    pub fn reset(&mut self, bias: ImuBias) {
        self.delta = Preintegration::new(bias);
    }

    /// Integrate one sample over `dt` seconds.
    pub fn integrate(&mut self, acc: &Vector3<f64>, gyr: &Vector3<f64>, dt: f64) -> Result<()> {
        if dt <= 0.0 {
            return Err(FusionError::InvalidTimestep { dt });
        }

        let acc_unbiased = self.delta.bias.correct_acc(acc);
        let gyr_unbiased = self.delta.bias.correct_gyr(gyr);

        let dq_prev = self.delta.delta_rotation;
        let delta_angle = gyr_unbiased * dt;
        let dq_step = exp_so3(&delta_angle);

        // Rotate the specific force with the midpoint rotation over the step.
        let dq_mid = dq_prev * exp_so3(&(0.5 * delta_angle));
        let acc_rotated = dq_mid * acc_unbiased;

        self.delta.delta_position +=
            self.delta.delta_velocity * dt + 0.5 * acc_rotated * dt * dt;
        self.delta.delta_velocity += acc_rotated * dt;
        let mut rotation = dq_prev * dq_step;
        rotation.renormalize();
        self.delta.delta_rotation = rotation;

        self.update_bias_jacobians(&dq_prev, &dq_step, &gyr_unbiased, &acc_unbiased, dt);
        self.propagate_covariance(&dq_prev, &dq_step, &gyr_unbiased, &acc_unbiased, dt);

        self.delta.delta_time += dt;
        Ok(())
    }

    /// Map a start state across the accumulated interval under the given bias.
    pub fn predict(&self, state: &NavState, bias: &ImuBias) -> NavState {
        let (delta_rot, delta_vel, delta_pos) = self.delta.corrected_deltas(bias);
        let g = self.params.gravity_vector();
        let dt = self.delta.delta_time;
        let rot_i = state.pose.rotation;

        NavState {
            pose: Pose3 {
                rotation: rot_i * delta_rot,
                translation: state.pose.translation
                    + state.velocity * dt
                    + 0.5 * g * dt * dt
                    + rot_i * delta_pos,
            },
            velocity: state.velocity + g * dt + rot_i * delta_vel,
        }
    }

    /// Integrated interval Δt_ij.
    #[inline]
    pub fn delta_time(&self) -> f64 {
        self.delta.delta_time
    }

    /// The accumulated increment, covariance, and bias Jacobians.
    #[inline]
    pub fn delta(&self) -> &Preintegration {
        &self.delta
    }

    /// The noise model and gravity parameters.
    #[inline]
    pub fn params(&self) -> &PreintegrationParams {
        &self.params
    }

    /// Recursive first-order bias Jacobian updates.
    fn update_bias_jacobians(
        &mut self,
        dq_prev: &UnitQuaternion<f64>,
        dq_step: &UnitQuaternion<f64>,
        gyr_unbiased: &Vector3<f64>,
        acc_unbiased: &Vector3<f64>,
        dt: f64,
    ) {
        let jr = right_jacobian(&(gyr_unbiased * dt));

        let prev_dr_dbg = self.delta.d_rot_d_gyr_bias;
        let prev_dv_dbg = self.delta.d_vel_d_gyr_bias;
        let prev_dv_dba = self.delta.d_vel_d_acc_bias;

        let rot_prev = *dq_prev.to_rotation_matrix().matrix();
        let rot_step_t = dq_step.to_rotation_matrix().matrix().transpose();
        let rot_acc_skew = rot_prev * skew(acc_unbiased);

        self.delta.d_rot_d_gyr_bias = rot_step_t * prev_dr_dbg - jr * dt;
        self.delta.d_vel_d_gyr_bias -= rot_acc_skew * prev_dr_dbg * dt;
        self.delta.d_vel_d_acc_bias -= rot_prev * dt;
        self.delta.d_pos_d_gyr_bias +=
            prev_dv_dbg * dt - 0.5 * rot_acc_skew * prev_dr_dbg * dt * dt;
        self.delta.d_pos_d_acc_bias += prev_dv_dba * dt - 0.5 * rot_prev * dt * dt;
    }

    /// Propagate the (δθ, δv, δp) covariance across one step.
    fn propagate_covariance(
        &mut self,
        dq_prev: &UnitQuaternion<f64>,
        dq_step: &UnitQuaternion<f64>,
        gyr_unbiased: &Vector3<f64>,
        acc_unbiased: &Vector3<f64>,
        dt: f64,
    ) {
        let rot_prev = *dq_prev.to_rotation_matrix().matrix();
        let rot_step_t = dq_step.to_rotation_matrix().matrix().transpose();
        let rot_acc_skew = rot_prev * skew(acc_unbiased);

        // State transition over (δθ, δv, δp)
        let mut f = Matrix9::zeros();
        f.fixed_view_mut::<3, 3>(0, 0).copy_from(&rot_step_t);
        f.fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&(-rot_acc_skew * dt));
        f.fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&Matrix3::identity());
        f.fixed_view_mut::<3, 3>(6, 0)
            .copy_from(&(-0.5 * rot_acc_skew * dt * dt));
        f.fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(Matrix3::identity() * dt));
        f.fixed_view_mut::<3, 3>(6, 6)
            .copy_from(&Matrix3::identity());

        // Noise input over (gyro, accel) white noise
        let mut g = SMatrix::<f64, 9, 6>::zeros();
        g.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(right_jacobian(&(gyr_unbiased * dt)) * dt));
        g.fixed_view_mut::<3, 3>(3, 3).copy_from(&(rot_prev * dt));
        g.fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(rot_prev * (0.5 * dt * dt)));

        // Continuous densities discretized over the step
        let mut q = SMatrix::<f64, 6, 6>::zeros();
        let q_gyr = self.params.gyr_noise_density * self.params.gyr_noise_density / dt;
        let q_acc = self.params.acc_noise_density * self.params.acc_noise_density / dt;
        for i in 0..3 {
            q[(i, i)] = q_gyr;
            q[(i + 3, i + 3)] = q_acc;
        }

        let mut cov = f * self.delta.covariance * f.transpose() + g * q * g.transpose();

        // Integration noise on position
        let q_int = self.params.integration_sigma * self.params.integration_sigma * dt;
        for i in 6..9 {
            cov[(i, i)] += q_int;
        }

        self.delta.covariance = cov;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::math::log_so3;
    use approx::assert_relative_eq;

    fn params() -> PreintegrationParams {
        PreintegrationParams {
            gravity: 9.81,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_is_identity() {
        let preint = Preintegrator::new(params(), ImuBias::zero());
        let delta = preint.delta();
        assert!(delta.delta_rotation.angle() < 1e-15);
        assert_eq!(delta.delta_velocity, Vector3::zeros());
        assert_eq!(delta.delta_position, Vector3::zeros());
        assert_eq!(delta.delta_time, 0.0);
    }

    #[test]
    fn test_rejects_non_positive_dt() {
        let mut preint = Preintegrator::new(params(), ImuBias::zero());
        assert!(preint
            .integrate(&Vector3::zeros(), &Vector3::zeros(), 0.0)
            .is_err());
        assert!(preint
            .integrate(&Vector3::zeros(), &Vector3::zeros(), -0.01)
            .is_err());
        assert_eq!(preint.delta_time(), 0.0);
    }

    #[test]
    fn test_constant_acceleration_closed_form() {
        let mut preint = Preintegrator::new(params(), ImuBias::zero());

        let dt = 0.01;
        let steps = 100;
        for _ in 0..steps {
            preint
                .integrate(&Vector3::new(1.0, 0.0, 0.0), &Vector3::zeros(), dt)
                .unwrap();
        }

        let t = steps as f64 * dt;
        let delta = preint.delta();
        assert_relative_eq!(delta.delta_velocity.x, t, epsilon = 1e-9);
        assert_relative_eq!(delta.delta_position.x, 0.5 * t * t, epsilon = 1e-4);
        assert_relative_eq!(delta.delta_time, t, epsilon = 1e-12);
    }

    #[test]
    fn test_constant_rotation_rate() {
        let mut preint = Preintegrator::new(params(), ImuBias::zero());

        let rate = 0.5; // rad/s about z
        let dt = 0.002;
        let steps = 500;
        for _ in 0..steps {
            preint
                .integrate(&Vector3::zeros(), &Vector3::new(0.0, 0.0, rate), dt)
                .unwrap();
        }

        let angle = log_so3(&preint.delta().delta_rotation);
        assert_relative_eq!(angle.z, rate * dt * steps as f64, epsilon = 1e-9);
        assert!(angle.xy().norm() < 1e-9);
    }

    #[test]
    fn test_stationary_predict_cancels_gravity() {
        // Sensor at rest measures +g on z; prediction must stay put.
        let mut preint = Preintegrator::new(params(), ImuBias::zero());
        for _ in 0..200 {
            preint
                .integrate(&Vector3::new(0.0, 0.0, 9.81), &Vector3::zeros(), 0.002)
                .unwrap();
        }

        let predicted = preint.predict(&NavState::identity(), &ImuBias::zero());
        assert!(predicted.velocity.norm() < 1e-9);
        assert!(predicted.pose.translation.norm() < 1e-9);
        assert!(predicted.pose.rotation.angle() < 1e-12);
    }

    #[test]
    fn test_bias_correction_matches_reintegration() {
        // First-order correction should track an actual re-integration for
        // a small bias change.
        let true_bias = ImuBias::new(Vector3::new(0.02, -0.01, 0.03), Vector3::new(0.004, 0.002, -0.003));
        let acc = Vector3::new(0.3, -0.2, 9.81);
        let gyr = Vector3::new(0.05, -0.02, 0.1);
        let dt = 0.005;
        let steps = 200;

        let mut at_zero = Preintegrator::new(params(), ImuBias::zero());
        let mut at_true = Preintegrator::new(params(), true_bias);
        for _ in 0..steps {
            at_zero.integrate(&acc, &gyr, dt).unwrap();
            at_true.integrate(&acc, &gyr, dt).unwrap();
        }

        let (rot_corr, vel_corr, pos_corr) = at_zero.delta().corrected_deltas(&true_bias);
        let exact = at_true.delta();

        assert!(rot_corr.angle_to(&exact.delta_rotation) < 1e-3);
        assert!((vel_corr - exact.delta_velocity).norm() < 1e-2);
        assert!((pos_corr - exact.delta_position).norm() < 1e-2);
    }

    #[test]
    fn test_corrected_deltas_at_reference_bias_are_exact() {
        let bias = ImuBias::new(Vector3::new(0.1, 0.0, 0.0), Vector3::new(0.0, 0.01, 0.0));
        let mut preint = Preintegrator::new(params(), bias);
        for _ in 0..50 {
            preint
                .integrate(&Vector3::new(0.5, 0.0, 9.81), &Vector3::new(0.0, 0.0, 0.2), 0.01)
                .unwrap();
        }

        let delta = preint.delta();
        let (rot, vel, pos) = delta.corrected_deltas(&bias);
        assert!(rot.angle_to(&delta.delta_rotation) < 1e-12);
        assert_relative_eq!(vel, delta.delta_velocity, epsilon = 1e-12);
        assert_relative_eq!(pos, delta.delta_position, epsilon = 1e-12);
    }

    #[test]
    fn test_covariance_grows_and_stays_symmetric() {
        let mut preint = Preintegrator::new(params(), ImuBias::zero());
        for _ in 0..100 {
            preint
                .integrate(&Vector3::new(0.0, 0.0, 9.81), &Vector3::new(0.01, 0.0, 0.0), 0.002)
                .unwrap();
        }

        let cov = preint.delta().covariance;
        assert!((cov - cov.transpose()).norm() < 1e-12);
        for i in 0..9 {
            assert!(cov[(i, i)] > 0.0, "zero variance on axis {i}");
        }
    }

    #[test]
    fn test_reset_clears_state_and_adopts_bias() {
        let mut preint = Preintegrator::new(params(), ImuBias::zero());
        preint
            .integrate(&Vector3::new(1.0, 0.0, 0.0), &Vector3::zeros(), 0.01)
            .unwrap();
        assert!(preint.delta_time() > 0.0);

        let bias = ImuBias::new(Vector3::new(0.1, 0.0, 0.0), Vector3::zeros());
        preint.reset(bias);
        assert_eq!(preint.delta_time(), 0.0);
        assert_eq!(preint.delta().bias, bias);
        assert_eq!(preint.delta().covariance, Matrix9::zeros());
    }

    #[test]
    fn test_predict_free_fall() {
        // No specific force at all: the prediction must fall with gravity.
        let mut preint = Preintegrator::new(params(), ImuBias::zero());
        let dt = 0.002;
        let steps = 500;
        for _ in 0..steps {
            preint
                .integrate(&Vector3::zeros(), &Vector3::zeros(), dt)
                .unwrap();
        }

        let t = dt * steps as f64;
        let predicted = preint.predict(&NavState::identity(), &ImuBias::zero());
        assert_relative_eq!(predicted.velocity.z, -9.81 * t, epsilon = 1e-9);
        assert_relative_eq!(
            predicted.pose.translation.z,
            -0.5 * 9.81 * t * t,
            epsilon = 1e-9
        );
    }
}
