//! Fusion engine configuration.

use nalgebra::{Vector3, Vector6};
use serde::Deserialize;

use crate::core::types::Pose3;
use crate::engine::graph::SmootherConfig;
use crate::error::{FusionError, Result};
use crate::sensors::converter::ImuConverterConfig;
use crate::sensors::preintegration::PreintegrationParams;

/// Configuration for the inertial/lidar fusion engine.
///
/// Defaults reflect a 500 Hz MEMS IMU paired with a 10 Hz scan matcher.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Source stream identifier for inertial samples.
    pub imu_topic: String,
    /// Output stream identifier for the high-rate odometry.
    pub odom_topic: String,
    /// Fixed map frame name.
    pub map_frame: String,
    /// Odometry frame the emitted poses are expressed in.
    pub odometry_frame: String,
    /// Robot body frame name.
    pub baselink_frame: String,
    /// Lidar sensor frame name.
    pub lidar_frame: String,

    /// Gravity magnitude (m/s²).
    pub imu_gravity: f64,
    /// Accelerometer white-noise density.
    pub imu_acc_noise: f64,
    /// Gyroscope white-noise density.
    pub imu_gyr_noise: f64,
    /// Accelerometer bias random-walk density (per √s).
    pub imu_acc_bias_noise: f64,
    /// Gyroscope bias random-walk density (per √s).
    pub imu_gyr_bias_noise: f64,
    /// Velocity-to-position integration noise density.
    pub integration_sigma: f64,

    /// Sample converter extrinsics and sanity bounds.
    pub converter: ImuConverterConfig,
    /// Translation of the inertial sensor relative to the lidar (m).
    pub ext_trans: Vector3<f64>,

    /// Initial pose prior standard deviation (all six axes).
    pub prior_pose_sigma: f64,
    /// Initial velocity prior standard deviation (m/s).
    pub prior_velocity_sigma: f64,
    /// Initial bias prior standard deviation.
    pub prior_bias_sigma: f64,
    /// Pose correction sigmas (δθ, δp) for well-conditioned lidar poses.
    pub correction_sigmas: Vector6<f64>,
    /// Pose correction sigmas used when the lidar pose is degenerate.
    pub degenerate_correction_sigmas: Vector6<f64>,

    /// Smoother iteration parameters.
    pub smoother: SmootherConfig,
    /// Rebuild the graph after this many keyframes.
    pub reset_interval: usize,
    /// Integration step assumed before the first timestamp is known (s).
    pub bootstrap_dt: f64,

    /// Estimated speed above which the estimator resets (m/s).
    pub max_speed: f64,
    /// Estimated bias norm above which the estimator resets.
    pub max_bias: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            imu_topic: "imu_raw".into(),
            odom_topic: "odometry/imu".into(),
            map_frame: "map".into(),
            odometry_frame: "odom".into(),
            baselink_frame: "base_link".into(),
            lidar_frame: "base_link".into(),

            imu_gravity: 9.80511,
            imu_acc_noise: 3.9939570888238808e-3,
            imu_gyr_noise: 1.5636343949698187e-3,
            imu_acc_bias_noise: 6.4356659353532566e-5,
            imu_gyr_bias_noise: 3.5640318696367613e-5,
            integration_sigma: 1e-4,

            converter: ImuConverterConfig::default(),
            ext_trans: Vector3::zeros(),

            prior_pose_sigma: 1e-2,
            prior_velocity_sigma: 1e4,
            prior_bias_sigma: 1e-3,
            correction_sigmas: Vector6::new(0.05, 0.05, 0.05, 0.1, 0.1, 0.1),
            degenerate_correction_sigmas: Vector6::repeat(1.0),

            smoother: SmootherConfig::default(),
            reset_interval: 100,
            bootstrap_dt: 1.0 / 500.0,

            max_speed: 30.0,
            max_bias: 1.0,
        }
    }
}

impl FusionConfig {
    /// Noise model handed to both preintegrators.
    pub fn preintegration_params(&self) -> PreintegrationParams {
        PreintegrationParams {
            gravity: self.imu_gravity,
            acc_noise_density: self.imu_acc_noise,
            gyr_noise_density: self.imu_gyr_noise,
            integration_sigma: self.integration_sigma,
        }
    }

    /// Transform composing lidar-frame poses into the body frame.
    pub fn lidar_to_body(&self) -> Pose3 {
        Pose3::from_translation(self.ext_trans)
    }

    /// Transform composing body-frame poses into the lidar frame.
    pub fn body_to_lidar(&self) -> Pose3 {
        Pose3::from_translation(-self.ext_trans)
    }

    /// Per-axis bias random-walk sigmas scaled by √Δt.
    pub fn bias_walk_sigmas(&self, delta_t: f64) -> Vector6<f64> {
        let scale = delta_t.sqrt();
        Vector6::new(
            self.imu_acc_bias_noise,
            self.imu_acc_bias_noise,
            self.imu_acc_bias_noise,
            self.imu_gyr_bias_noise,
            self.imu_gyr_bias_noise,
            self.imu_gyr_bias_noise,
        ) * scale
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.imu_gravity <= 0.0 {
            return Err(FusionError::Config("gravity must be positive".into()));
        }
        if self.imu_acc_noise <= 0.0
            || self.imu_gyr_noise <= 0.0
            || self.imu_acc_bias_noise <= 0.0
            || self.imu_gyr_bias_noise <= 0.0
        {
            return Err(FusionError::Config(
                "inertial noise densities must be positive".into(),
            ));
        }
        if self.reset_interval < 2 {
            return Err(FusionError::Config(
                "reset interval must cover at least two keyframes".into(),
            ));
        }
        if self.bootstrap_dt <= 0.0 {
            return Err(FusionError::Config("bootstrap dt must be positive".into()));
        }
        if self.max_speed <= 0.0 || self.max_bias <= 0.0 {
            return Err(FusionError::Config(
                "failure thresholds must be positive".into(),
            ));
        }
        for (name, frame) in [
            ("odometry_frame", &self.odometry_frame),
            ("baselink_frame", &self.baselink_frame),
            ("lidar_frame", &self.lidar_frame),
        ] {
            if frame.is_empty() {
                return Err(FusionError::Config(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }
}
