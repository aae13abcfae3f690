//! Quaternion complementary filter.
//!
//! Integrating the gyro gives a smooth attitude that drifts without bound,
//! while accelerometer + magnetometer give an absolute attitude that is noisy
//! and upset by any non-gravitational acceleration. Every update integrates
//! the gyro from the previous estimate, builds the absolute attitude from
//! gravity and the magnetic field, and mixes the two with a fixed weight.

use crate::config::{check_alpha, ConfigError};
use crate::rotation::{
    identity, matrix_to_quaternion_robust, multiply, normalize, quaternion_to_matrix, slerp,
    RotationMatrix, Vec4,
};
use crate::ImuSample;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Magnitude below which a sensor vector has no usable direction.
const MIN_VECTOR_NORM: f64 = 1e-9;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FusionError {
    #[error("accelerometer vector has near-zero magnitude")]
    DegenerateAccel,
    #[error("magnetometer vector has near-zero magnitude")]
    DegenerateMag,
    #[error("accelerometer and magnetometer vectors are parallel")]
    ParallelReference,
    #[error("fused attitude is not finite")]
    NonFinite,
}

/// How the gyro and reference quaternions are mixed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    /// Weighted componentwise sum, then renormalized. Only a small-angle
    /// approximation, but cheap and the historical behavior.
    #[default]
    Linear,
    /// Spherical interpolation from the gyro estimate toward the reference.
    Spherical,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum FilterState {
    Uninitialized,
    Running {
        quaternion: Vec4<f64>,
        timestamp: Duration,
    },
}

#[derive(Clone, Debug)]
pub struct ComplementaryFilter {
    /// Filter gain, between [0, 1]. 0 uses only the gyro, and 1 uses only accel / mag measurements.
    alpha: f64,

    /// Subtracted from every magnetometer reading before use.
    mag_offset: Vector3<f64>,

    blend: BlendMode,

    state: FilterState,
}

impl ComplementaryFilter {
    pub fn new(alpha: f64, mag_offset: Vector3<f64>) -> Result<Self, ConfigError> {
        check_alpha(alpha)?;
        Ok(Self {
            alpha,
            mag_offset,
            blend: BlendMode::default(),
            state: FilterState::Uninitialized,
        })
    }

    pub fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, FilterState::Running { .. })
    }

    /// Current attitude estimate; identity until the first update.
    pub fn estimate(&self) -> Vec4<f64> {
        match self.state {
            FilterState::Uninitialized => identity(),
            FilterState::Running { quaternion, .. } => quaternion,
        }
    }

    pub fn rotation(&self) -> RotationMatrix {
        quaternion_to_matrix(&self.estimate())
    }

    /// Drop the estimate; the next update bootstraps again.
    pub fn reset(&mut self) {
        self.state = FilterState::Uninitialized;
    }

    /// Feed one filtered sample received at `timestamp`.
    ///
    /// The first call only anchors the filter at identity. Afterwards the gyro
    /// is integrated over the time since the previous accepted sample. A
    /// sample whose accel or mag vector has no direction is rejected and the
    /// previous estimate is kept.
    pub fn update(
        &mut self,
        sample: &ImuSample,
        timestamp: Duration,
    ) -> Result<RotationMatrix, FusionError> {
        let (previous, last_time) = match self.state {
            FilterState::Uninitialized => return Ok(self.bootstrap(timestamp)),
            FilterState::Running {
                quaternion,
                timestamp,
            } => (quaternion, timestamp),
        };

        let q_ref =
            reference_orientation(&sample.accel(), &sample.adjusted_mag(&self.mag_offset))?;

        let dt = timestamp.saturating_sub(last_time).as_secs_f64();
        let q_gyro = integrate_gyro(&previous, &sample.gyro_rad(), dt)?;

        let fused = self.fuse(&q_gyro, &q_ref)?;
        self.state = FilterState::Running {
            quaternion: fused,
            timestamp,
        };
        Ok(quaternion_to_matrix(&fused))
    }

    fn bootstrap(&mut self, timestamp: Duration) -> RotationMatrix {
        self.state = FilterState::Running {
            quaternion: identity(),
            timestamp,
        };
        RotationMatrix::identity()
    }

    fn fuse(&self, q_gyro: &Vec4<f64>, q_ref: &Vec4<f64>) -> Result<Vec4<f64>, FusionError> {
        // q and -q are the same attitude, mix on the gyro estimate's side.
        let q_ref = if q_gyro.dot(q_ref) < 0.0 {
            -q_ref
        } else {
            *q_ref
        };
        let blended = match self.blend {
            BlendMode::Linear => q_gyro * (1.0 - self.alpha) + q_ref * self.alpha,
            BlendMode::Spherical => slerp(q_gyro, &q_ref, self.alpha),
        };
        normalize(&blended).ok_or(FusionError::NonFinite)
    }
}

/// First-order integration of body rates `omega` (rad/s) over `dt` seconds.
fn integrate_gyro(
    q: &Vec4<f64>,
    omega: &Vector3<f64>,
    dt: f64,
) -> Result<Vec4<f64>, FusionError> {
    let rate = Vec4::new(0.0, omega.x, omega.y, omega.z);
    let q_dot = 0.5 * multiply(q, &rate);
    normalize(&(q + q_dot * dt)).ok_or(FusionError::NonFinite)
}

/// Absolute attitude from gravity and the magnetic field alone.
///
/// Axis convention: down is the negated accelerometer direction,
/// `east = down x mag`, `north = east x down`. The frame matrix has columns
/// `[north, west, up]` with `west = -east` and `up` the accelerometer
/// direction, which is right-handed. A device lying flat (accel +z) with the
/// field along +x gives identity; the same field along +y gives a positive
/// quarter turn about z.
pub fn reference_orientation(
    accel: &Vector3<f64>,
    mag: &Vector3<f64>,
) -> Result<Vec4<f64>, FusionError> {
    let up = unit(accel).ok_or(FusionError::DegenerateAccel)?;
    let mag = unit(mag).ok_or(FusionError::DegenerateMag)?;
    let down = -up;

    // Down x Mag = East
    // East x Down = North
    let east = unit(&down.cross(&mag)).ok_or(FusionError::ParallelReference)?;
    let north = unit(&east.cross(&down)).ok_or(FusionError::ParallelReference)?;

    let rot = RotationMatrix::from_columns(&north, &-east, &up);
    normalize(&matrix_to_quaternion_robust(&rot)).ok_or(FusionError::NonFinite)
}

fn unit(v: &Vector3<f64>) -> Option<Vector3<f64>> {
    let norm = v.norm();
    (norm.is_finite() && norm > MIN_VECTOR_NORM).then(|| v / norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::{angle_between, rotate};
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;
    use std::f64::consts::FRAC_1_SQRT_2;

    fn secs(t: f64) -> Duration {
        Duration::from_secs_f64(t)
    }

    fn level_sample(gyro: Vector3<f64>) -> ImuSample {
        ImuSample::new(Vector3::new(0.0, 0.0, 1.0), gyro, Vector3::new(1.0, 0.0, 0.0))
    }

    #[test]
    fn first_update_returns_identity() {
        for sample in [
            ImuSample::from_array([3.0, -1.0, 7.0, 400.0, 0.0, -20.0, 5.0, 5.0, 5.0]),
            ImuSample::default(),
        ] {
            let mut filter = ComplementaryFilter::new(0.3, Vector3::zeros()).unwrap();
            assert!(!filter.is_running());
            let rot = filter.update(&sample, secs(12.5)).unwrap();
            assert_eq!(rot, RotationMatrix::identity());
            assert_eq!(filter.estimate(), identity());
            assert!(filter.is_running());
        }
    }

    #[test]
    fn alpha_outside_unit_interval_is_rejected() {
        assert!(ComplementaryFilter::new(-0.1, Vector3::zeros()).is_err());
        assert!(ComplementaryFilter::new(1.01, Vector3::zeros()).is_err());
        assert!(ComplementaryFilter::new(f64::NAN, Vector3::zeros()).is_err());
        assert!(ComplementaryFilter::new(0.0, Vector3::zeros()).is_ok());
        assert!(ComplementaryFilter::new(1.0, Vector3::zeros()).is_ok());
    }

    #[test]
    fn reference_triad_handedness() {
        let level = reference_orientation(&Vector3::new(0.0, 0.0, 1.0), &Vector3::new(1.0, 0.0, 0.0))
            .unwrap();
        assert_relative_eq!(level, identity(), epsilon = 1e-12);

        // Field swung onto +y: positive quarter turn about z
        let turned = reference_orientation(&Vector3::new(0.0, 0.0, 1.0), &Vector3::new(0.0, 1.0, 0.0))
            .unwrap();
        assert_relative_eq!(
            turned,
            Vec4::new(FRAC_1_SQRT_2, 0.0, 0.0, FRAC_1_SQRT_2),
            epsilon = 1e-12
        );
        let rot = quaternion_to_matrix(&turned);
        assert_relative_eq!(rotate(&rot, &Vector3::x()), Vector3::y(), epsilon = 1e-12);
    }

    #[test]
    fn reference_ignores_field_dip_and_magnitudes() {
        // Dip the field toward down and scale both vectors; heading is unchanged
        let q = reference_orientation(&Vector3::new(0.0, 0.0, 981.0), &Vector3::new(20.0, 0.0, -45.0))
            .unwrap();
        assert_relative_eq!(q, identity(), epsilon = 1e-12);
    }

    #[test]
    fn reference_at_trace_singularity() {
        let q = reference_orientation(&Vector3::new(1.0, 0.0, 0.0), &Vector3::new(0.0, 0.0, 1.0))
            .unwrap();
        let expected = Matrix3::new(0.0, 0.0, 1.0, 0.0, -1.0, 0.0, 1.0, 0.0, 0.0);
        assert_relative_eq!(*quaternion_to_matrix(&q).matrix(), expected, epsilon = 1e-12);
        assert_relative_eq!(q.norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn degenerate_samples_keep_previous_estimate() {
        let mut filter = ComplementaryFilter::new(0.5, Vector3::zeros()).unwrap();
        filter.update(&level_sample(Vector3::zeros()), secs(0.0)).unwrap();
        filter
            .update(&level_sample(Vector3::new(0.0, 0.0, 90.0)), secs(0.01))
            .unwrap();
        let before = filter.estimate();

        let zero_accel = ImuSample::new(Vector3::zeros(), Vector3::zeros(), Vector3::x());
        assert_eq!(
            filter.update(&zero_accel, secs(0.02)),
            Err(FusionError::DegenerateAccel)
        );

        let zero_mag = ImuSample::new(Vector3::z(), Vector3::zeros(), Vector3::zeros());
        assert_eq!(
            filter.update(&zero_mag, secs(0.03)),
            Err(FusionError::DegenerateMag)
        );

        let parallel = ImuSample::new(Vector3::z(), Vector3::zeros(), Vector3::z() * 3.0);
        assert_eq!(
            filter.update(&parallel, secs(0.04)),
            Err(FusionError::ParallelReference)
        );

        let nan_gyro = ImuSample::new(Vector3::z(), Vector3::new(f64::NAN, 0.0, 0.0), Vector3::x());
        assert_eq!(
            filter.update(&nan_gyro, secs(0.05)),
            Err(FusionError::NonFinite)
        );

        assert_eq!(filter.estimate(), before);
        assert!(filter.estimate().iter().all(|c| c.is_finite()));
    }

    #[test]
    fn mag_offset_is_removed_before_use() {
        let offset = Vector3::new(11.8, -11.1, 46.8);
        let mut filter = ComplementaryFilter::new(1.0, offset).unwrap();
        let sample = ImuSample::new(Vector3::z(), Vector3::zeros(), Vector3::y() + offset);
        filter.update(&sample, secs(0.0)).unwrap();
        filter.update(&sample, secs(0.01)).unwrap();
        // alpha = 1 trusts the reference fully: quarter turn about z
        assert_relative_eq!(
            filter.estimate(),
            Vec4::new(FRAC_1_SQRT_2, 0.0, 0.0, FRAC_1_SQRT_2),
            epsilon = 1e-12
        );
    }

    #[test]
    fn pure_gyro_integration_follows_rate() {
        // alpha = 0 ignores the reference entirely
        let mut filter = ComplementaryFilter::new(0.0, Vector3::zeros()).unwrap();
        let sample = level_sample(Vector3::new(0.0, 0.0, 90.0));
        filter.update(&sample, secs(0.0)).unwrap();
        for i in 1..=100 {
            filter.update(&sample, secs(i as f64 * 0.01)).unwrap();
        }
        // 90 deg/s for one second, first-order integration stays close
        let yaw = angle_between(&filter.estimate(), &identity());
        assert_relative_eq!(yaw, std::f64::consts::FRAC_PI_2, epsilon = 1e-2);
        assert!(filter.estimate()[3] > 0.0);
        assert_relative_eq!(filter.estimate().norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn elapsed_time_drives_integration() {
        let sample = level_sample(Vector3::new(0.0, 0.0, 90.0));

        let mut fast = ComplementaryFilter::new(0.0, Vector3::zeros()).unwrap();
        fast.update(&sample, secs(1.0)).unwrap();
        fast.update(&sample, secs(1.01)).unwrap();

        let mut slow = ComplementaryFilter::new(0.0, Vector3::zeros()).unwrap();
        slow.update(&sample, secs(1.0)).unwrap();
        slow.update(&sample, secs(1.02)).unwrap();

        let a = angle_between(&fast.estimate(), &identity());
        let b = angle_between(&slow.estimate(), &identity());
        assert_relative_eq!(b, 2.0 * a, epsilon = 1e-4);

        // A timestamp going backwards integrates nothing
        let mut stalled = ComplementaryFilter::new(0.0, Vector3::zeros()).unwrap();
        stalled.update(&sample, secs(1.0)).unwrap();
        stalled.update(&sample, secs(0.5)).unwrap();
        assert_relative_eq!(stalled.estimate(), identity(), epsilon = 1e-12);
    }

    #[test]
    fn small_alpha_keeps_steps_small() {
        let mut filter = ComplementaryFilter::new(0.02, Vector3::zeros()).unwrap();
        let sample = level_sample(Vector3::new(3.0, -2.0, 10.0));
        filter.update(&sample, secs(0.0)).unwrap();

        let mut previous = filter.estimate();
        for i in 1..500 {
            filter.update(&sample, secs(i as f64 * 0.01)).unwrap();
            let current = filter.estimate();
            assert!(angle_between(&previous, &current) < 0.01);
            assert_relative_eq!(current.norm(), 1.0, epsilon = 1e-12);
            previous = current;
        }
    }

    #[test]
    fn spherical_blend_converges_to_reference() {
        let mut filter = ComplementaryFilter::new(0.2, Vector3::zeros())
            .unwrap()
            .with_blend(BlendMode::Spherical);
        let sample = ImuSample::new(Vector3::z(), Vector3::zeros(), Vector3::y());
        let target = reference_orientation(&sample.accel(), &sample.mag()).unwrap();

        filter.update(&sample, secs(0.0)).unwrap();
        for i in 1..200 {
            filter.update(&sample, secs(i as f64 * 0.01)).unwrap();
        }
        // Slerp stops short once within its 0.01 half-angle sine threshold
        assert!(angle_between(&filter.estimate(), &target) < 0.03);
    }

    #[test]
    fn reset_returns_to_bootstrap() {
        let mut filter = ComplementaryFilter::new(0.5, Vector3::zeros()).unwrap();
        let sample = ImuSample::new(Vector3::z(), Vector3::zeros(), Vector3::y());
        filter.update(&sample, secs(0.0)).unwrap();
        filter.update(&sample, secs(0.01)).unwrap();
        assert_ne!(filter.estimate(), identity());

        filter.reset();
        assert!(!filter.is_running());
        assert_eq!(filter.update(&sample, secs(0.02)).unwrap(), RotationMatrix::identity());
    }
}
