//! Inertial sample routing and frame conversion.
//!
//! Raw samples arrive in the sensor's native frame. The converter rotates
//! acceleration and angular velocity into the body frame used by the
//! estimator with a fixed extrinsic rotation, and rotates the reported
//! orientation (when present) with a separate extrinsic quaternion. Samples
//! that violate the configured magnitude bounds, or that report a
//! degenerate orientation quaternion, are rejected and never reach the
//! queues.

use nalgebra::{Matrix3, UnitQuaternion};
use serde::Deserialize;

use crate::core::types::ImuSample;
use crate::error::{FusionError, Result};

/// Configuration for the sample converter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImuConverterConfig {
    /// Extrinsic rotation applied to acceleration and angular velocity.
    pub ext_rot: Matrix3<f64>,
    /// Extrinsic quaternion applied to the reported orientation.
    pub ext_rpy: UnitQuaternion<f64>,
    /// Maximum plausible acceleration magnitude (m/s²).
    pub max_acc: f64,
    /// Maximum plausible angular rate magnitude (rad/s).
    pub max_gyr: f64,
}

impl Default for ImuConverterConfig {
    fn default() -> Self {
        Self {
            ext_rot: Matrix3::identity(),
            ext_rpy: UnitQuaternion::identity(),
            max_acc: 160.0,
            max_gyr: 35.0,
        }
    }
}

/// Orientation quaternions with a norm below this are degenerate.
///
/// Six-axis units without an attitude filter publish all-zero
/// orientations; deserialized samples bypass the unit-norm guarantee, so
/// the check happens here rather than in the type.
const MIN_ORIENTATION_NORM: f64 = 0.1;

/// Rotates raw inertial samples into the estimator body frame.
#[derive(Debug, Clone)]
pub struct ImuConverter {
    config: ImuConverterConfig,
}

impl ImuConverter {
    /// Create a converter, validating the extrinsic rotation.
    pub fn new(config: ImuConverterConfig) -> Result<Self> {
        let r = &config.ext_rot;
        let orthonormality = (r * r.transpose() - Matrix3::identity()).norm();
        if orthonormality > 1e-6 || (r.determinant() - 1.0).abs() > 1e-6 {
            return Err(FusionError::Config(format!(
                "extrinsic rotation is not a proper rotation matrix (orthonormality error {orthonormality:.2e})"
            )));
        }
        if config.max_acc <= 0.0 || config.max_gyr <= 0.0 {
            return Err(FusionError::Config(
                "sample magnitude bounds must be positive".into(),
            ));
        }
        Ok(Self { config })
    }

    /// Convert a raw sample into the body frame.
    ///
    /// Returns `None` when the sample fails the sanity bounds.
    pub fn convert(&self, raw: &ImuSample) -> Option<ImuSample> {
        if raw.acc.norm() > self.config.max_acc || raw.gyr.norm() > self.config.max_gyr {
            log::warn!(
                "rejecting implausible IMU sample at t={:.3}: |acc|={:.1}, |gyr|={:.1}",
                raw.timestamp,
                raw.acc.norm(),
                raw.gyr.norm()
            );
            return None;
        }

        if let Some(q) = &raw.orientation {
            let norm = q.as_ref().norm();
            if !norm.is_finite() || norm < MIN_ORIENTATION_NORM {
                log::warn!(
                    "rejecting IMU sample at t={:.3} with degenerate orientation (|q|={:.3})",
                    raw.timestamp,
                    norm
                );
                return None;
            }
        }

        Some(ImuSample {
            timestamp: raw.timestamp,
            acc: self.config.ext_rot * raw.acc,
            gyr: self.config.ext_rot * raw.gyr,
            orientation: raw.orientation.map(|q| q * self.config.ext_rpy),
        })
    }

    /// The converter configuration.
    pub fn config(&self) -> &ImuConverterConfig {
        &self.config
    }
}
