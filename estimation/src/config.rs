//! Application configuration, loaded from a TOML file.

use crate::complementary::BlendMode;
use crate::lowpass::SampleFilter;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("lowpass cutoff of {cutoff_hz} Hz is above the Nyquist limit for a {sample_rate_hz} Hz sample rate")]
    NyquistViolation { cutoff_hz: f64, sample_rate_hz: f64 },
    #[error("invalid value {value} for {name}")]
    InvalidParameter { name: &'static str, value: f64 },
    #[error("failed to read config file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write config file {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Offset subtracted from raw magnetometer readings, as reported by the
    /// magnetometer calibration run.
    pub mag_offset: [f64; 3],
    /// Address the WebSocket server listens on for visualizers.
    pub server_addr: String,
    pub device: DeviceConfig,
    pub model: ModelConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mag_offset: [11.82052489, -11.0642615, 46.75668695],
            server_addr: "localhost:8089".into(),
            device: DeviceConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn mag_offset(&self) -> Vector3<f64> {
        Vector3::from(self.mag_offset)
    }

    /// Runs every check that would otherwise fail at pipeline construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        SampleFilter::new(self.model.lowpass_cutoff_hz, self.model.sample_period)?;
        check_alpha(self.model.alpha)?;
        if let Some(&value) = self.mag_offset.iter().find(|v| !v.is_finite()) {
            return Err(ConfigError::InvalidParameter {
                name: "mag_offset",
                value,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device model name, for logging.
    pub name: String,
    pub port: String,
    pub baud: u32,
    /// First character of every valid frame.
    pub sentinel: char,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "ICM20948".into(),
            port: "/dev/ttyACM0".into(),
            baud: 115200,
            sentinel: '&',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Loop period in seconds.
    pub sample_period: f64,
    /// Lowpass cutoff frequency in Hz. Must stay below half the sample rate.
    pub lowpass_cutoff_hz: f64,
    /// Trust placed in the accel/mag reference over gyro integration, in [0, 1].
    pub alpha: f64,
    pub blend: BlendMode,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            sample_period: 0.01,
            lowpass_cutoff_hz: 10.0,
            alpha: 0.1,
            blend: BlendMode::Linear,
        }
    }
}

pub(crate) fn check_alpha(alpha: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&alpha) {
        Ok(())
    } else {
        Err(ConfigError::InvalidParameter {
            name: "alpha",
            value: alpha,
        })
    }
}

/// Load config from disk, or return default if not found.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        info!(?path, "No config found, using defaults");
        return Ok(AppConfig::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    let config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })?;
    info!(?path, "Loaded config");
    Ok(config)
}

/// Write config to disk, replacing the whole file.
pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents).map_err(|source| ConfigError::Write {
        path: path.to_owned(),
        source,
    })?;
    info!(?path, "Saved config");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.device.sentinel, '&');
        assert_eq!(config.model.blend, BlendMode::Linear);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            server_addr = "0.0.0.0:9000"

            [model]
            alpha = 0.25
            blend = "spherical"

            [device]
            sentinel = "$"
            "#,
        )
        .unwrap();

        assert_eq!(config.server_addr, "0.0.0.0:9000");
        assert_eq!(config.model.alpha, 0.25);
        assert_eq!(config.model.blend, BlendMode::Spherical);
        assert_eq!(config.model.sample_period, 0.01);
        assert_eq!(config.device.sentinel, '$');
        assert_eq!(config.device.baud, 115200);
        assert_eq!(config.mag_offset, AppConfig::default().mag_offset);
    }

    #[test]
    fn toml_round_trip() {
        let config = AppConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn validate_rejects_bad_model() {
        let mut config = AppConfig::default();
        config.model.lowpass_cutoff_hz = 60.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NyquistViolation { .. })
        ));

        let mut config = AppConfig::default();
        config.model.alpha = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidParameter { name: "alpha", .. })
        ));

        let mut config = AppConfig::default();
        config.mag_offset[1] = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn saved_config_loads_back() {
        let path = Path::new("test_save_config.toml");
        let mut config = AppConfig::default();
        config.mag_offset = [1.5, -2.25, 40.0];
        save_config(path, &config).unwrap();

        let loaded = load_config(path).unwrap();
        std::fs::remove_file(path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = load_config(Path::new("does-not-exist.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }
}
