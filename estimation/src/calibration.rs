//! Magnetometer hard-iron offset calibration.
//!
//! While the device is turned through as many orientations as possible, the
//! filtered field readings trace a sphere around the sensor's own bias. The
//! mean of those readings is the offset that `AppConfig::mag_offset` removes.

use nalgebra::Vector3;

/// Running mean of magnetometer readings.
#[derive(Clone, Debug, Default)]
pub struct MagCalibration {
    sum: Vector3<f64>,
    count: usize,
}

impl MagCalibration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mag: &Vector3<f64>) {
        self.sum += mag;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Mean of everything added so far, `None` before the first reading.
    pub fn offset(&self) -> Option<Vector3<f64>> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}
