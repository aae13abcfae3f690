//! Line-to-estimate processing chain: parse, lowpass, fuse.

use crate::complementary::{ComplementaryFilter, FusionError};
use crate::config::{AppConfig, ConfigError};
use crate::lowpass::SampleFilter;
use crate::parser::FrameParser;
use crate::sink::Estimate;
use crate::ImuSample;
use std::time::Duration;
use tracing::trace;

pub struct Pipeline<P> {
    parser: P,
    filter: SampleFilter,
    estimator: ComplementaryFilter,
}

impl<P: FrameParser> Pipeline<P> {
    pub fn new(parser: P, filter: SampleFilter, estimator: ComplementaryFilter) -> Self {
        Self {
            parser,
            filter,
            estimator,
        }
    }

    /// Builds the filter and estimator described by `config`.
    pub fn from_config(parser: P, config: &AppConfig) -> Result<Self, ConfigError> {
        let model = &config.model;
        let filter = SampleFilter::new(model.lowpass_cutoff_hz, model.sample_period)?;
        let estimator =
            ComplementaryFilter::new(model.alpha, config.mag_offset())?.with_blend(model.blend);
        Ok(Self::new(parser, filter, estimator))
    }

    /// Runs one raw line through the chain. Lines that are not frames give
    /// `Ok(None)` and leave all state untouched.
    pub fn process_line(
        &mut self,
        line: &str,
        timestamp: Duration,
    ) -> Result<Option<Estimate>, FusionError> {
        let Some(sample) = self.parser.parse(line) else {
            trace!(line, "Skipping unparseable line");
            return Ok(None);
        };
        self.process_sample(&sample, timestamp).map(Some)
    }

    pub fn process_sample(
        &mut self,
        sample: &ImuSample,
        timestamp: Duration,
    ) -> Result<Estimate, FusionError> {
        let filtered = self.filter.filter_sample(sample);
        let rotation = self.estimator.update(&filtered, timestamp)?;
        Ok(Estimate::new(
            timestamp,
            &self.estimator.estimate(),
            rotation,
            &filtered,
        ))
    }

    pub fn estimator(&self) -> &ComplementaryFilter {
        &self.estimator
    }
}
