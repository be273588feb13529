//! Application settings loaded through the `config` crate.
//!
//! Layering, lowest priority first: built-in defaults, `config/default.toml`
//! (optional), an explicitly supplied file, then `DAQ_*` environment
//! variables (e.g. `DAQ_SPECTROMETER__DEVICE=tg_cooled`).

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Top-level settings for both plugins.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub spectrometer: SpectrometerSettings,
    #[serde(default)]
    pub camera: CameraSettings,
}

/// Settings for the mini-spectrometer plugin.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpectrometerSettings {
    /// Device family selector (see `hardware::minispectro::DeviceFamily`).
    pub device: String,
    /// Integration time applied at initialization, in microseconds.
    pub integration_time_us: u32,
}

impl Default for SpectrometerSettings {
    fn default() -> Self {
        Self {
            device: "tm_ccd".to_string(),
            // Minimum for the C10083CA; model-specific minima differ.
            integration_time_us: 10_000,
        }
    }
}

/// Settings for the camera plugin.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Camera index on the bus.
    pub index: usize,
    /// Exposure time applied at initialization, in milliseconds.
    pub exposure_ms: f64,
    /// Readout speed code written at initialization.
    pub readout_speed: f64,
    /// Whether to enable the camera's defect-correction mode.
    pub defect_correct: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            index: 0,
            exposure_ms: 100.0,
            readout_speed: 1.0,
            defect_correct: true,
        }
    }
}

impl Settings {
    /// Load settings, optionally from an explicit file path.
    pub fn new(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder =
            Config::builder().add_source(File::with_name("config/default").required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }

        builder
            .add_source(Environment::with_prefix("DAQ").separator("__"))
            .build()?
            .try_deserialize()
    }
}
