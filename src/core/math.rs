//! SO(3) primitives for preintegration and factor linearization.
//!
//! Rotations are represented as unit quaternions; tangent vectors are
//! rotation vectors (axis * angle). The right Jacobian and its inverse
//! relate tangent-space perturbations across the exponential map:
//!
//! ```text
//! Exp(phi + dphi) ≈ Exp(phi) * Exp(Jr(phi) * dphi)
//! Log(Exp(phi) * Exp(dphi)) ≈ phi + Jr⁻¹(phi) * dphi
//! ```

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Skew-symmetric (cross-product) matrix of a 3-vector.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// SO(3) exponential map: rotation vector to unit quaternion.
#[inline]
pub fn exp_so3(phi: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*phi)
}

/// SO(3) logarithm map: unit quaternion to rotation vector.
#[inline]
pub fn log_so3(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.scaled_axis()
}

/// Right Jacobian of SO(3).
pub fn right_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta2 = phi.norm_squared();
    let theta = theta2.sqrt();
    let k = skew(phi);
    let k2 = k * k;

    let (a, b) = if theta < 1e-4 {
        // Taylor expansion avoids subtractive cancellation near zero:
        // a = (1 - cos θ) / θ² , b = (θ - sin θ) / θ³
        let theta4 = theta2 * theta2;
        (
            0.5 - theta2 / 24.0 + theta4 / 720.0,
            1.0 / 6.0 - theta2 / 120.0 + theta4 / 5040.0,
        )
    } else {
        // 1 - cos θ = 2 sin²(θ/2) is stable for small θ
        let sin_half = (0.5 * theta).sin();
        (
            (2.0 * sin_half * sin_half) / theta2,
            (theta - theta.sin()) / (theta2 * theta),
        )
    };

    Matrix3::identity() - a * k + b * k2
}

/// Inverse of the right Jacobian of SO(3).
pub fn right_jacobian_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta2 = phi.norm_squared();
    let theta = theta2.sqrt();
    let k = skew(phi);
    let k2 = k * k;

    let c = if theta < 1e-4 {
        // 1/θ² - (1 + cos θ) / (2 θ sin θ) = 1/12 + θ²/720 + ...
        1.0 / 12.0 + theta2 / 720.0
    } else {
        1.0 / theta2 - (1.0 + theta.cos()) / (2.0 * theta * theta.sin())
    };

    Matrix3::identity() + 0.5 * k + c * k2
}
