//! Rigid-body pose in 3D.

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// A rigid transform in SE(3): rotation followed by translation.
///
/// Composition follows the usual convention: `a.compose(&b)` applies `b`
/// in the frame of `a`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose3 {
    /// Orientation as a unit quaternion.
    pub rotation: UnitQuaternion<f64>,
    /// Position in meters.
    pub translation: Vector3<f64>,
}

impl Pose3 {
    /// Create a pose from rotation and translation.
    #[inline]
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Identity pose at the origin.
    #[inline]
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Pure translation with identity rotation.
    #[inline]
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    /// Compose two poses: `self ∘ other`.
    ///
    /// ```text
    /// C = A ∘ B:
    ///   C.R = A.R * B.R
    ///   C.t = A.t + A.R * B.t
    /// ```
    #[inline]
    pub fn compose(&self, other: &Pose3) -> Pose3 {
        Pose3 {
            rotation: self.rotation * other.rotation,
            translation: self.translation + self.rotation * other.translation,
        }
    }

    /// Inverse of this pose.
    #[inline]
    pub fn inverse(&self) -> Pose3 {
        let inv_rot = self.rotation.inverse();
        Pose3 {
            rotation: inv_rot,
            translation: -(inv_rot * self.translation),
        }
    }

    /// Transform a point from the local frame to the parent frame.
    #[inline]
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.translation + self.rotation * point
    }
}

impl Default for Pose3 {
    fn default() -> Self {
        Self::identity()
    }
}
