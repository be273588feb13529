//! Core traits and data types shared by both viewer plugins.
//!
//! The host framework consumes every plugin through the same lifecycle
//! contract:
//!
//! ```text
//! initialize(shared?) -> (status message, success flag)
//! commit_setting(name, value)
//! grab(average count)  --[DataExport]--> broadcast::channel --> host viewer
//! stop()
//! close()
//! ```
//!
//! Data flows out as [`DataExport`] packages: a dimension tag, axis
//! descriptors with physical units, and a sample array kept in its native
//! format ([`SampleBuffer`]) to avoid converting u16 sensor buffers to f64
//! unless averaging demands it.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::Settings;

// =============================================================================
// Setting values and descriptors
// =============================================================================

/// Strongly-typed setting value exchanged with the host framework.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl SettingValue {
    /// Extract value as f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Float(f) => Some(*f),
            SettingValue::Int(i) => Some(*i as f64),
            SettingValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Extract value as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SettingValue::Int(i) => Some(*i),
            SettingValue::Float(f) => Some(*f as i64),
            SettingValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Extract value as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            SettingValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Extract value as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Bool(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        SettingValue::Int(value)
    }
}

impl From<u32> for SettingValue {
    fn from(value: u32) -> Self {
        SettingValue::Int(value as i64)
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        SettingValue::Float(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Str(value.to_string())
    }
}

/// One exposed control, as declared to the host framework.
///
/// Controls backed by a device feature the hardware reports as unavailable
/// (the 0xFF sentinel) are published with `enabled = false` and their
/// default displayed value; they are never an error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SettingDescriptor {
    /// Machine name used in `commit_setting` calls.
    pub name: String,
    /// Human-readable title for the host UI.
    pub title: String,
    /// Current (or forced default) value.
    pub value: SettingValue,
    /// Whether the control is operable on this device.
    pub enabled: bool,
    /// Declared lower bound; range enforcement is the host's job.
    pub min: Option<f64>,
    /// Declared upper bound; range enforcement is the host's job.
    pub max: Option<f64>,
}

impl SettingDescriptor {
    pub fn new(name: &str, title: &str, value: impl Into<SettingValue>) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            value: value.into(),
            enabled: true,
            min: None,
            max: None,
        }
    }

    /// Mark the control disabled, keeping its forced default value.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Declare the value range the host should enforce.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }
}

// =============================================================================
// Exported data
// =============================================================================

/// Dimensionality tag of an exported data package.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataDim {
    Data1D,
    Data2D,
}

impl DataDim {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataDim::Data1D => "Data1D",
            DataDim::Data2D => "Data2D",
        }
    }
}

/// Axis descriptor attached to an exported data package.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    /// Axis label (e.g. "Pixels", "Wavelength").
    pub label: String,
    /// Physical units (e.g. "nm"); empty for dimensionless axes.
    pub units: String,
    /// Dimension index this axis describes.
    pub index: usize,
    /// Axis values, one per sample along the dimension.
    pub data: Vec<f64>,
}

impl Axis {
    pub fn new(label: &str, units: &str, index: usize, data: Vec<f64>) -> Self {
        Self {
            label: label.to_string(),
            units: units.to_string(),
            index,
            data,
        }
    }
}

/// Sample storage in its native format.
///
/// Sensor buffers arrive as unsigned 16-bit counts; keeping them that way
/// halves the memory of a full frame versus f64 and skips a conversion on
/// the hot path. Averaged acquisitions are stored as `F64`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SampleBuffer {
    /// Raw 16-bit sensor counts.
    U16(Vec<u16>),
    /// Floating-point samples (e.g. after averaging).
    F64(Vec<f64>),
}

impl SampleBuffer {
    /// Number of samples in the buffer.
    pub fn len(&self) -> usize {
        match self {
            SampleBuffer::U16(data) => data.len(),
            SampleBuffer::F64(data) => data.len(),
        }
    }

    /// Returns true if the buffer contains no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples as f64, borrowing when no conversion is needed.
    pub fn as_f64(&self) -> std::borrow::Cow<'_, [f64]> {
        use std::borrow::Cow;
        match self {
            SampleBuffer::U16(data) => Cow::Owned(data.iter().map(|&v| v as f64).collect()),
            SampleBuffer::F64(data) => Cow::Borrowed(data.as_slice()),
        }
    }
}

/// One labeled data package emitted towards the host viewer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataExport {
    /// Source name (e.g. "Mini-spectrometer", "Camera Image").
    pub name: String,
    /// Dimensionality tag.
    pub dim: DataDim,
    /// Channel labels.
    pub labels: Vec<String>,
    /// Axis descriptors, one per dimension.
    pub axes: Vec<Axis>,
    /// Sample array. For `Data2D` the samples are row-major with the
    /// shape given by the axes.
    pub samples: SampleBuffer,
    /// UTC timestamp of the acquisition.
    pub timestamp: DateTime<Utc>,
    /// Optional source-specific metadata (frame number, fps, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

// =============================================================================
// Plugin lifecycle
// =============================================================================

/// Result of plugin initialization, reported back to the host.
#[derive(Clone, Debug)]
pub struct InitResult {
    /// Status message for the host log.
    pub info: String,
    /// False if initialization failed.
    pub initialized: bool,
}

/// Lifecycle contract every viewer plugin implements.
///
/// A plugin is *master* when it creates its own device adapter and *slave*
/// when `initialize` receives one shared by another plugin instance.
#[async_trait]
pub trait ViewerPlugin: Send + Sync {
    /// Shared-controller type handed to slave instances.
    type Controller: Send;

    /// Plugin display name.
    fn name(&self) -> &str;

    /// Detector communication initialization.
    async fn initialize(
        &mut self,
        settings: &Arc<Settings>,
        shared: Option<Self::Controller>,
    ) -> Result<InitResult>;

    /// Controls currently exposed to the host, with unavailable device
    /// features already disabled.
    fn setting_descriptors(&self) -> Vec<SettingDescriptor>;

    /// Apply the consequences of a changed setting value.
    async fn commit_setting(&mut self, name: &str, value: SettingValue) -> Result<()>;

    /// Start a grab, averaging `naverage` acquisitions where supported.
    /// Data is emitted on the broadcast channel, not returned.
    async fn grab(&mut self, naverage: usize) -> Result<()>;

    /// Best-effort halt of the current grab. Always succeeds.
    async fn stop(&mut self) -> Result<()>;

    /// Release the device. Tolerant of being called when already closed.
    async fn close(&mut self) -> Result<()>;

    /// Subscribe to exported data packages.
    fn data_channel(&self) -> Result<broadcast::Receiver<DataExport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_buffer_as_f64() {
        let raw = SampleBuffer::U16(vec![1, 2, 3]);
        assert_eq!(raw.as_f64().as_ref(), &[1.0, 2.0, 3.0]);
        assert_eq!(raw.len(), 3);

        let avg = SampleBuffer::F64(vec![0.5]);
        // F64 path borrows without allocating.
        assert!(matches!(avg.as_f64(), std::borrow::Cow::Borrowed(_)));
    }

    #[test]
    fn test_setting_value_conversions() {
        assert_eq!(SettingValue::from(10_000u32).as_i64(), Some(10_000));
        assert_eq!(SettingValue::Str("2.5".into()).as_f64(), Some(2.5));
        assert_eq!(SettingValue::Bool(true).as_f64(), None);
    }

    #[test]
    fn test_disabled_descriptor_keeps_value() {
        let d = SettingDescriptor::new("gain", "Gain", "low").disabled();
        assert!(!d.enabled);
        assert_eq!(d.value.as_str(), Some("low"));
    }
}
