//! High-rate odometry output messages.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::Pose3;

/// A pose estimate emitted at inertial-sample rate.
///
/// Poses are expressed in the lidar frame so downstream consumers see the
/// same frame as the scan matcher's odometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdometryEstimate {
    /// Timestamp of the inertial sample that produced this estimate.
    pub timestamp: f64,
    /// Coordinate frame the pose is expressed in.
    pub frame_id: String,
    /// Estimated pose.
    pub pose: Pose3,
    /// Linear velocity in the world frame (m/s).
    pub velocity: Vector3<f64>,
    /// Reported angular velocity (rad/s).
    pub angular_velocity: Vector3<f64>,
}
