//! Lidar-derived pose messages.

use serde::{Deserialize, Serialize};

use super::Pose3;

/// A 6-DoF pose produced by the upstream scan matcher.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LidarPose {
    /// Timestamp in seconds.
    pub timestamp: f64,
    /// Pose in the world frame, expressed in the lidar frame.
    pub pose: Pose3,
    /// Whether the scan matcher reported an ill-conditioned solution.
    pub degenerate: bool,
}

impl LidarPose {
    /// Create a lidar pose message.
    pub fn new(timestamp: f64, pose: Pose3, degenerate: bool) -> Self {
        Self {
            timestamp,
            pose,
            degenerate,
        }
    }

    /// Build from a pose whose covariance channel carries the degeneracy
    /// flag in its first element (`== 1` means degenerate).
    pub fn from_covariance_flag(timestamp: f64, pose: Pose3, covariance_first: f64) -> Self {
        Self {
            timestamp,
            pose,
            degenerate: covariance_first as i64 == 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covariance_flag_mapping() {
        let pose = Pose3::identity();
        assert!(LidarPose::from_covariance_flag(0.0, pose, 1.0).degenerate);
        assert!(!LidarPose::from_covariance_flag(0.0, pose, 0.0).degenerate);
        assert!(!LidarPose::from_covariance_flag(0.0, pose, 0.9).degenerate);
    }
}
