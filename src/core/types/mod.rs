//! Value types shared across the estimator.

mod imu;
mod lidar;
mod nav_state;
mod odometry;
mod pose;

pub use imu::{ImuBias, ImuSample};
pub use lidar::LidarPose;
pub use nav_state::NavState;
pub use odometry::OdometryEstimate;
pub use pose::Pose3;
