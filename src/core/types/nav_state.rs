//! Navigation state: pose plus linear velocity.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::Pose3;

/// Combined pose and linear velocity in the world frame at an instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NavState {
    /// Body pose in the world frame.
    pub pose: Pose3,
    /// Linear velocity in the world frame (m/s).
    pub velocity: Vector3<f64>,
}

impl NavState {
    /// Create a state from pose and velocity.
    pub fn new(pose: Pose3, velocity: Vector3<f64>) -> Self {
        Self { pose, velocity }
    }

    /// State at the origin with zero velocity.
    pub fn identity() -> Self {
        Self {
            pose: Pose3::identity(),
            velocity: Vector3::zeros(),
        }
    }
}

impl Default for NavState {
    fn default() -> Self {
        Self::identity()
    }
}
