//! First-order RC lowpass filter.
//!
//! Based on the transfer function of an RC circuit, `H(s) = 1 / (1 + RCs)`,
//! discretized with backward Euler: `Vin = Vout + RC * dVout/dt`. The cutoff
//! sits at `1 / (2 pi RC)` Hz. The whole sample vector shares one RC pair.

use crate::config::ConfigError;
use crate::{ImuSample, SAMPLE_LEN};
use nalgebra::SVector;
use std::f64::consts::PI;

/// Capacitance of the modelled circuit. Only the RC product matters, the
/// resistance is derived from it.
const CAPACITANCE: f64 = 0.1;

#[derive(Clone, Debug)]
pub struct LowpassFilter<const N: usize> {
    sample_period: f64,
    rc: f64,
    /// Last output, zero until the first call.
    last: Option<SVector<f64, N>>,
}

/// Filter over a full 9-axis frame.
pub type SampleFilter = LowpassFilter<SAMPLE_LEN>;

impl<const N: usize> LowpassFilter<N> {
    /// Fails when the cutoff is not below the Nyquist frequency of the sample period.
    pub fn new(cutoff_hz: f64, sample_period: f64) -> Result<Self, ConfigError> {
        if !(cutoff_hz.is_finite() && cutoff_hz > 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "lowpass_cutoff_hz",
                value: cutoff_hz,
            });
        }
        if !(sample_period.is_finite() && sample_period > 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "sample_period",
                value: sample_period,
            });
        }
        if cutoff_hz * 2.0 > 1.0 / sample_period {
            return Err(ConfigError::NyquistViolation {
                cutoff_hz,
                sample_rate_hz: 1.0 / sample_period,
            });
        }

        let resistance = 1.0 / (2.0 * PI * cutoff_hz * CAPACITANCE);
        Ok(Self {
            sample_period,
            rc: resistance * CAPACITANCE,
            last: None,
        })
    }

    /// The RC time constant in seconds.
    pub fn time_constant(&self) -> f64 {
        self.rc
    }

    pub fn filter(&mut self, input: &SVector<f64, N>) -> SVector<f64, N> {
        let last = self.last.unwrap_or_else(SVector::<f64, N>::zeros);
        let denom = self.sample_period + self.rc;
        let output = input * (self.sample_period / denom) + last * (self.rc / denom);
        self.last = Some(output);
        output
    }

    /// Forget the filter history; the next output blends toward zero again.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

impl LowpassFilter<SAMPLE_LEN> {
    pub fn filter_sample(&mut self, sample: &ImuSample) -> ImuSample {
        ImuSample::from_vector(&self.filter(&sample.to_vector()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn rejects_cutoff_above_nyquist() {
        assert!(matches!(
            SampleFilter::new(60.0, 0.01),
            Err(ConfigError::NyquistViolation { .. })
        ));
        // Exactly at Nyquist is still accepted
        assert!(SampleFilter::new(50.0, 0.01).is_ok());
    }

    #[test]
    fn rejects_non_positive_parameters() {
        assert!(SampleFilter::new(0.0, 0.01).is_err());
        assert!(SampleFilter::new(10.0, 0.0).is_err());
        assert!(SampleFilter::new(f64::NAN, 0.01).is_err());
    }

    #[test]
    fn time_constant_matches_cutoff() {
        let filter = SampleFilter::new(10.0, 0.01).unwrap();
        assert_relative_eq!(filter.time_constant(), 1.0 / (2.0 * PI * 10.0), epsilon = 1e-12);
    }

    #[test]
    fn first_output_blends_toward_zero() {
        let mut filter = LowpassFilter::<3>::new(10.0, 0.01).unwrap();
        let rc = filter.time_constant();
        let gain = 0.01 / (0.01 + rc);

        let input = Vector3::new(1.0, -2.0, 4.0);
        let out = filter.filter(&input);
        assert_relative_eq!(out, input * gain, epsilon = 1e-12);

        filter.reset();
        assert_relative_eq!(filter.filter(&input), input * gain, epsilon = 1e-12);
    }

    #[test]
    fn constant_input_converges_monotonically() {
        let mut filter = SampleFilter::new(10.0, 0.01).unwrap();
        let sample =
            ImuSample::from_array([1000.0, -50.0, 3.0, 0.0, 12.0, -7.0, 40.0, -20.0, 0.5]);
        let target = sample.to_vector();

        let mut previous = SVector::<f64, SAMPLE_LEN>::zeros();
        for _ in 0..200 {
            let out = filter.filter_sample(&sample).to_vector();
            for i in 0..SAMPLE_LEN {
                // Never overshoots and never moves away from the input
                assert!(out[i].abs() <= target[i].abs() + 1e-9);
                assert!((target[i] - out[i]).abs() <= (target[i] - previous[i]).abs() + 1e-9);
                assert!(out[i] * target[i] >= 0.0);
            }
            previous = out;
        }
        assert_relative_eq!(previous, target, epsilon = 1e-6);
    }
}
