//! Quaternion and rotation matrix algebra.
//!
//! Quaternions are carried as plain 4-vectors in (w, i, j, k) order so that
//! the complementary filter can mix them componentwise. Conversions to and
//! from nalgebra's `UnitQuaternion` are provided for cross-checking and for
//! the few places where its conventions are convenient.

use nalgebra::{ArrayStorage, Const, Matrix, Matrix3, Quaternion, UnitQuaternion, Vector3};
use serde::{Serialize, Serializer};

/// Type alias for a 4x1 column vector with a generic scalar type `T`, used to
/// represent a quaternion. Quaternion elements are ordered as (w, i, j, k).
///
/// Note: Using this rather than nalgebra's built-in Vector4 alias because
/// nalgebra's alias uses labels (x,y,z,w) which follow a different ordering
/// scheme than ours, so this avoids confusion.
pub type Vec4<T> = Matrix<T, Const<4>, Const<1>, ArrayStorage<T, 4, 1>>;

/// Norm below which a quaternion cannot be normalized.
pub const NORM_EPSILON: f64 = 1e-9;

/// Smallest `r = 0.5 * sqrt(1 + trace)` the trace method accepts.
pub const TRACE_EPSILON: f64 = 1e-6;

/// Half-angle sine below which `slerp` returns its first endpoint.
pub const SLERP_SIN_THRESHOLD: f64 = 0.01;

/// The identity rotation [1, 0, 0, 0].
pub fn identity() -> Vec4<f64> {
    Vec4::new(1.0, 0.0, 0.0, 0.0)
}

/// Scales `q` to unit length. Returns `None` for zero-length or non-finite input.
pub fn normalize(q: &Vec4<f64>) -> Option<Vec4<f64>> {
    let norm = q.norm();
    (norm.is_finite() && norm > NORM_EPSILON).then(|| q / norm)
}

pub fn conjugate(q: &Vec4<f64>) -> Vec4<f64> {
    Vec4::new(q[0], -q[1], -q[2], -q[3])
}

/// Hamilton product `q0 * q1`.
pub fn multiply(q0: &Vec4<f64>, q1: &Vec4<f64>) -> Vec4<f64> {
    let (w0, x0, y0, z0) = (q0[0], q0[1], q0[2], q0[3]);
    let (w1, x1, y1, z1) = (q1[0], q1[1], q1[2], q1[3]);
    Vec4::new(
        w0 * w1 - x0 * x1 - y0 * y1 - z0 * z1,
        w0 * x1 + x0 * w1 + y0 * z1 - z0 * y1,
        w0 * y1 - x0 * z1 + y0 * w1 + z0 * x1,
        w0 * z1 + x0 * y1 - y0 * x1 + z0 * w1,
    )
}

/// Rotation angle (radians) taking unit quaternion `q0` to `q1`, on the short arc.
pub fn angle_between(q0: &Vec4<f64>, q1: &Vec4<f64>) -> f64 {
    2.0 * q0.dot(q1).abs().min(1.0).acos()
}

/// Spherical linear interpolation from `q0` (t = 0) to `q1` (t = 1).
///
/// `q1` is negated when needed so the short arc is taken. `q0` is returned
/// unchanged when the two are identical or opposite, and when the half-angle
/// sine drops below [`SLERP_SIN_THRESHOLD`]. If either weight would exceed 1,
/// the corresponding endpoint is returned instead.
pub fn slerp(q0: &Vec4<f64>, q1: &Vec4<f64>, t: f64) -> Vec4<f64> {
    let mut q1 = *q1;
    let mut cos_half = q0.dot(&q1);
    if cos_half < 0.0 {
        q1 = -q1;
        cos_half = -cos_half;
    }
    if cos_half.abs() >= 1.0 {
        return *q0;
    }

    let half_theta = cos_half.acos();
    let sin_half = (1.0 - cos_half * cos_half).sqrt();
    if sin_half.abs() < SLERP_SIN_THRESHOLD {
        return *q0;
    }

    let mut ratio_a = ((1.0 - t) * half_theta).sin() / sin_half;
    let mut ratio_b = (t * half_theta).sin() / sin_half;
    if ratio_a > 1.0 {
        (ratio_a, ratio_b) = (1.0, 0.0);
    } else if ratio_b > 1.0 {
        (ratio_a, ratio_b) = (0.0, 1.0);
    }
    q0 * ratio_a + q1 * ratio_b
}

/// Orthonormal 3x3 rotation matrix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RotationMatrix(Matrix3<f64>);

impl RotationMatrix {
    pub fn identity() -> Self {
        Self(Matrix3::identity())
    }

    /// Builds the matrix whose columns are the given frame axes.
    pub fn from_columns(x: &Vector3<f64>, y: &Vector3<f64>, z: &Vector3<f64>) -> Self {
        Self(Matrix3::from_columns(&[*x, *y, *z]))
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.0
    }

    pub fn rows(&self) -> [[f64; 3]; 3] {
        let m = &self.0;
        [
            [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
            [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
            [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
        ]
    }

    /// True when the columns are unit length and mutually orthogonal within `eps`.
    pub fn is_orthonormal(&self, eps: f64) -> bool {
        (self.0.transpose() * self.0 - Matrix3::identity())
            .iter()
            .all(|e| e.abs() <= eps)
    }
}

impl Serialize for RotationMatrix {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.rows().serialize(serializer)
    }
}

/// Converts a unit quaternion to its rotation matrix.
pub fn quaternion_to_matrix(q: &Vec4<f64>) -> RotationMatrix {
    let (w, x, y, z) = (q[0], q[1], q[2], q[3]);
    RotationMatrix(Matrix3::new(
        1.0 - 2.0 * (y * y + z * z),
        2.0 * (x * y - w * z),
        2.0 * (x * z + w * y),
        2.0 * (x * y + w * z),
        1.0 - 2.0 * (x * x + z * z),
        2.0 * (y * z - w * x),
        2.0 * (x * z - w * y),
        2.0 * (y * z + w * x),
        1.0 - 2.0 * (x * x + y * y),
    ))
}

/// Symmetric trace method. Returns `None` when the trace is at or near -1,
/// i.e. for rotations of about 180 degrees, where `r` vanishes.
pub fn matrix_to_quaternion(rot: &RotationMatrix) -> Option<Vec4<f64>> {
    let m = &rot.0;
    let trace = m.trace();
    if !(trace > -1.0) {
        return None;
    }
    let r = 0.5 * (1.0 + trace).sqrt();
    if r < TRACE_EPSILON {
        return None;
    }
    let s = 4.0 * r;
    Some(Vec4::new(
        r,
        (m[(2, 1)] - m[(1, 2)]) / s,
        (m[(0, 2)] - m[(2, 0)]) / s,
        (m[(1, 0)] - m[(0, 1)]) / s,
    ))
}

/// Trace method with a largest-diagonal fallback for the 180 degree case.
pub fn matrix_to_quaternion_robust(rot: &RotationMatrix) -> Vec4<f64> {
    if let Some(q) = matrix_to_quaternion(rot) {
        return q;
    }

    let m = &rot.0;
    let (m00, m11, m22) = (m[(0, 0)], m[(1, 1)], m[(2, 2)]);
    if m00 >= m11 && m00 >= m22 {
        // s = 4x
        let s = 2.0 * (1.0 + m00 - m11 - m22).max(0.0).sqrt();
        Vec4::new(
            (m[(2, 1)] - m[(1, 2)]) / s,
            0.25 * s,
            (m[(0, 1)] + m[(1, 0)]) / s,
            (m[(0, 2)] + m[(2, 0)]) / s,
        )
    } else if m11 >= m22 {
        // s = 4y
        let s = 2.0 * (1.0 + m11 - m00 - m22).max(0.0).sqrt();
        Vec4::new(
            (m[(0, 2)] - m[(2, 0)]) / s,
            (m[(0, 1)] + m[(1, 0)]) / s,
            0.25 * s,
            (m[(1, 2)] + m[(2, 1)]) / s,
        )
    } else {
        // s = 4z
        let s = 2.0 * (1.0 + m22 - m00 - m11).max(0.0).sqrt();
        Vec4::new(
            (m[(1, 0)] - m[(0, 1)]) / s,
            (m[(0, 2)] + m[(2, 0)]) / s,
            (m[(1, 2)] + m[(2, 1)]) / s,
            0.25 * s,
        )
    }
}

/// Expresses `v` in the frame described by `rot`.
pub fn rotate(rot: &RotationMatrix, v: &Vector3<f64>) -> Vector3<f64> {
    rot.0 * v
}

/// Converts a `UnitQuaternion<T>` to a `Vec4<T>` in (w, i, j, k) ordering.
pub fn quat_to_vec4<T: nalgebra::RealField + Copy>(q: &UnitQuaternion<T>) -> Vec4<T> {
    Vec4::new(q.w, q.i, q.j, q.k)
}

/// Converts a `Vec4<T>` in (w, i, j, k) ordering back to a `UnitQuaternion<T>`,
/// normalizing on the way.
pub fn vec4_to_quat<T: nalgebra::RealField + Copy>(v: &Vec4<T>) -> UnitQuaternion<T> {
    UnitQuaternion::from_quaternion(Quaternion::new(v[0], v[1], v[2], v[3]))
}
