//! Inertial measurement types.

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// A single inertial measurement.
///
/// Immutable once enqueued; timestamps are seconds on a monotonic clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    /// Timestamp in seconds.
    pub timestamp: f64,
    /// Linear acceleration in the sensor frame (m/s²), gravity included.
    pub acc: Vector3<f64>,
    /// Angular velocity in the sensor frame (rad/s).
    pub gyr: Vector3<f64>,
    /// Orientation reported by the sensor, if any.
    pub orientation: Option<UnitQuaternion<f64>>,
}

impl ImuSample {
    /// Create a sample without an orientation estimate.
    pub fn new(timestamp: f64, acc: Vector3<f64>, gyr: Vector3<f64>) -> Self {
        Self {
            timestamp,
            acc,
            gyr,
            orientation: None,
        }
    }

    /// Attach an orientation estimate.
    pub fn with_orientation(mut self, orientation: UnitQuaternion<f64>) -> Self {
        self.orientation = Some(orientation);
        self
    }
}

/// Constant accelerometer and gyroscope bias.
///
/// Treated as piecewise constant between keyframes; the smoother estimates
/// one bias per keyframe linked by a random-walk constraint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuBias {
    /// Accelerometer bias (m/s²).
    pub acc: Vector3<f64>,
    /// Gyroscope bias (rad/s).
    pub gyr: Vector3<f64>,
}

impl ImuBias {
    /// Create a bias from its accelerometer and gyroscope parts.
    pub fn new(acc: Vector3<f64>, gyr: Vector3<f64>) -> Self {
        Self { acc, gyr }
    }

    /// The zero bias.
    pub fn zero() -> Self {
        Self {
            acc: Vector3::zeros(),
            gyr: Vector3::zeros(),
        }
    }

    /// Remove the accelerometer bias from a raw measurement.
    #[inline]
    pub fn correct_acc(&self, acc: &Vector3<f64>) -> Vector3<f64> {
        acc - self.acc
    }

    /// Remove the gyroscope bias from a raw measurement.
    #[inline]
    pub fn correct_gyr(&self, gyr: &Vector3<f64>) -> Vector3<f64> {
        gyr - self.gyr
    }
}

impl Default for ImuBias {
    fn default() -> Self {
        Self::zero()
    }
}
