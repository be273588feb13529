//! 1D viewer plugin for Hamamatsu USB mini-spectrometers.
//!
//! Bridges the host framework's viewer lifecycle to the [`MiniSpectro`]
//! adapter. The plugin runs as master (it opens the device itself) or as
//! slave (it receives an adapter shared by another plugin instance).
//!
//! Acquisition is synchronous: `grab` blocks on the driver call, averages
//! the requested number of buffers and emits one labeled 1D package with
//! pixel-index and wavelength axes.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::config::Settings;
use crate::core::{
    Axis, DataDim, DataExport, InitResult, SampleBuffer, SettingDescriptor, SettingValue,
    ViewerPlugin,
};
use crate::hardware::minispectro::{
    Gain, MiniSpectro, ParameterPatch, TriggerEdge, TriggerMode, UnitParameter,
    INTEGRATION_TIME_MAX_US, INTEGRATION_TIME_MIN_US,
};

/// Adapter handle shared between a master plugin and its slaves.
pub type SharedSpectro = Arc<Mutex<MiniSpectro>>;

const DATA_CHANNEL_CAPACITY: usize = 32;

/// Mini-spectrometer viewer plugin.
pub struct MiniSpectroViewer {
    controller: Option<SharedSpectro>,
    is_master: bool,
    sender: Option<broadcast::Sender<DataExport>>,
    pixel_axis: Vec<f64>,
    wavelength_axis: Vec<f64>,
    descriptors: Vec<SettingDescriptor>,
}

impl MiniSpectroViewer {
    pub fn new() -> Self {
        Self {
            controller: None,
            is_master: false,
            sender: None,
            pixel_axis: Vec::new(),
            wavelength_axis: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    /// Shared handle onto the adapter, for wiring up slave instances.
    pub fn controller(&self) -> Option<SharedSpectro> {
        self.controller.clone()
    }

    /// Build the exposed controls from a device parameter block.
    ///
    /// Fields the device reports as unavailable (0xFF) come back disabled
    /// and forced to their default displayed value.
    fn descriptors_from(param: &UnitParameter) -> Vec<SettingDescriptor> {
        let mut descriptors = vec![SettingDescriptor::new(
            "integration_time_us",
            "Integration time (us)",
            param.integration_time_us,
        )
        .with_range(INTEGRATION_TIME_MIN_US as f64, INTEGRATION_TIME_MAX_US as f64)];

        let gain = match param.gain() {
            Gain::Unavailable => {
                SettingDescriptor::new("gain", "Gain", Gain::Low.as_str()).disabled()
            }
            gain => SettingDescriptor::new("gain", "Gain", gain.as_str()),
        };
        descriptors.push(gain);

        let edge = match param.trigger_edge() {
            TriggerEdge::Unavailable => {
                SettingDescriptor::new("trigger_edge", "Trigger edge", TriggerEdge::Rising.as_str())
                    .disabled()
            }
            edge => SettingDescriptor::new("trigger_edge", "Trigger edge", edge.as_str()),
        };
        descriptors.push(edge);

        let mode = match param.trigger_mode() {
            TriggerMode::Unavailable => SettingDescriptor::new(
                "trigger_mode",
                "Trigger mode",
                TriggerMode::Internal.as_str(),
            )
            .disabled(),
            mode => SettingDescriptor::new("trigger_mode", "Trigger mode", mode.as_str()),
        };
        descriptors.push(mode);

        descriptors
    }

    fn require_controller(&self) -> Result<&SharedSpectro> {
        self.controller
            .as_ref()
            .ok_or_else(|| anyhow!("Mini-spectrometer plugin is not initialized"))
    }

    fn emit(&self, export: DataExport) {
        if let Some(sender) = &self.sender {
            // No receivers yet is not an error; the host may subscribe later.
            let _ = sender.send(export);
        }
    }

    fn parse_patch(name: &str, value: &SettingValue) -> Result<ParameterPatch> {
        let patch = ParameterPatch::default();
        match name {
            "integration_time_us" => {
                let us = value
                    .as_i64()
                    .ok_or_else(|| anyhow!("Invalid integration time value: {:?}", value))?;
                Ok(patch.integration_time_us(us as u32))
            }
            "gain" => {
                let gain = match value.as_str() {
                    Some("low") => Gain::Low,
                    Some("high") => Gain::High,
                    other => return Err(anyhow!("Invalid gain value: {:?}", other)),
                };
                Ok(patch.gain(gain))
            }
            "trigger_edge" => {
                let edge = match value.as_str() {
                    Some("rising") => TriggerEdge::Rising,
                    Some("falling") => TriggerEdge::Falling,
                    other => return Err(anyhow!("Invalid trigger edge value: {:?}", other)),
                };
                Ok(patch.trigger_edge(edge))
            }
            "trigger_mode" => {
                let mode = match value.as_str() {
                    Some("internal") => TriggerMode::Internal,
                    Some("external_edge") => TriggerMode::ExternalEdge,
                    Some("external_gate") => TriggerMode::ExternalGate,
                    other => return Err(anyhow!("Invalid trigger mode value: {:?}", other)),
                };
                Ok(patch.trigger_mode(mode))
            }
            _ => Err(anyhow!("Unknown spectrometer setting '{}'", name)),
        }
    }
}

impl Default for MiniSpectroViewer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ViewerPlugin for MiniSpectroViewer {
    type Controller = SharedSpectro;

    fn name(&self) -> &str {
        "Mini-spectrometer"
    }

    async fn initialize(
        &mut self,
        settings: &Arc<Settings>,
        shared: Option<SharedSpectro>,
    ) -> Result<InitResult> {
        let controller = match shared {
            Some(controller) => {
                self.is_master = false;
                controller
            }
            None => {
                self.is_master = true;
                let spectro = MiniSpectro::open(&settings.spectrometer.device)?;
                Arc::new(Mutex::new(spectro))
            }
        };

        let info = {
            let mut spectro = controller.lock().await;
            if self.is_master {
                spectro.patch_parameters(
                    ParameterPatch::default()
                        .integration_time_us(settings.spectrometer.integration_time_us),
                )?;
            }
            let param = spectro.get_parameters()?;
            self.descriptors = Self::descriptors_from(&param);
            self.pixel_axis = crate::calibration::pixel_axis(spectro.sensor_size());
            self.wavelength_axis = spectro.wavelength_axis();

            let unit = spectro.unit_information();
            format!(
                "{} (sensor {}, serial {}), {} elements",
                unit.unit_id.trim(),
                unit.sensor_name.trim(),
                unit.serial_number.trim(),
                spectro.sensor_size()
            )
        };

        let (sender, _) = broadcast::channel(DATA_CHANNEL_CAPACITY);
        self.sender = Some(sender);
        self.controller = Some(controller);

        // Prime the host viewer with a zeroed package of the final shape.
        self.emit(DataExport {
            name: "MiniSpectro".to_string(),
            dim: DataDim::Data1D,
            labels: vec!["Spectrometer".to_string()],
            axes: vec![
                Axis::new("Pixels", "", 0, self.pixel_axis.clone()),
                Axis::new("Wavelength", "nm", 0, self.wavelength_axis.clone()),
            ],
            samples: SampleBuffer::U16(vec![0; self.pixel_axis.len()]),
            timestamp: chrono::Utc::now(),
            metadata: None,
        });

        info!("Mini-spectrometer initialized: {}", info);
        Ok(InitResult {
            info,
            initialized: true,
        })
    }

    fn setting_descriptors(&self) -> Vec<SettingDescriptor> {
        self.descriptors.clone()
    }

    async fn commit_setting(&mut self, name: &str, value: SettingValue) -> Result<()> {
        let patch = match Self::parse_patch(name, &value) {
            Ok(patch) => patch,
            Err(err) => {
                warn!("{}", err);
                return Ok(());
            }
        };

        let controller = self.require_controller()?.clone();
        let param = controller.lock().await.patch_parameters(patch)?;
        self.descriptors = Self::descriptors_from(&param);
        Ok(())
    }

    async fn grab(&mut self, naverage: usize) -> Result<()> {
        let controller = self.require_controller()?.clone();
        let naverage = naverage.max(1);

        let mut spectro = controller.lock().await;
        let first = spectro.acquire()?;

        let samples = if naverage == 1 {
            SampleBuffer::U16(first.counts)
        } else {
            let mut sums: Vec<f64> = first.counts.iter().map(|&c| c as f64).collect();
            for _ in 1..naverage {
                let next = spectro.acquire()?;
                for (sum, &count) in sums.iter_mut().zip(next.counts.iter()) {
                    *sum += count as f64;
                }
            }
            for sum in &mut sums {
                *sum /= naverage as f64;
            }
            SampleBuffer::F64(sums)
        };
        drop(spectro);

        self.emit(DataExport {
            name: "MiniSpectro".to_string(),
            dim: DataDim::Data1D,
            labels: vec!["Spectrometer".to_string()],
            axes: vec![
                Axis::new("Pixels", "", 0, self.pixel_axis.clone()),
                Axis::new("Wavelength", "nm", 0, self.wavelength_axis.clone()),
            ],
            samples,
            timestamp: chrono::Utc::now(),
            metadata: Some(serde_json::json!({ "average_count": naverage })),
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        // The spectrometer path is synchronous; a grab in flight finishes on
        // its own and nothing else needs halting.
        info!("Mini-spectrometer grab stopped");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(controller) = self.controller.take() {
            if self.is_master {
                controller.lock().await.close()?;
            }
        }
        Ok(())
    }

    fn data_channel(&self) -> Result<broadcast::Receiver<DataExport>> {
        self.sender
            .as_ref()
            .map(|s| s.subscribe())
            .ok_or_else(|| anyhow!("Mini-spectrometer plugin is not initialized"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_disables_controls_with_defaults() {
        let param = UnitParameter {
            integration_time_us: 10_000,
            gain: 0xFF,
            trigger_edge: 0xFF,
            trigger_mode: 0x00,
            reserved: 0,
        };
        let descriptors = MiniSpectroViewer::descriptors_from(&param);

        let gain = descriptors.iter().find(|d| d.name == "gain").unwrap();
        assert!(!gain.enabled);
        assert_eq!(gain.value.as_str(), Some("low"));

        let edge = descriptors.iter().find(|d| d.name == "trigger_edge").unwrap();
        assert!(!edge.enabled);
        assert_eq!(edge.value.as_str(), Some("rising"));

        let mode = descriptors.iter().find(|d| d.name == "trigger_mode").unwrap();
        assert!(mode.enabled);
        assert_eq!(mode.value.as_str(), Some("internal"));
    }

    #[test]
    fn test_supported_fields_stay_enabled() {
        let param = UnitParameter {
            integration_time_us: 50_000,
            gain: 0x01,
            trigger_edge: 0x01,
            trigger_mode: 0x01,
            reserved: 0,
        };
        let descriptors = MiniSpectroViewer::descriptors_from(&param);
        let gain = descriptors.iter().find(|d| d.name == "gain").unwrap();
        assert!(gain.enabled);
        assert_eq!(gain.value.as_str(), Some("high"));
    }

    #[test]
    fn test_parse_patch_rejects_unknown_setting() {
        let result =
            MiniSpectroViewer::parse_patch("exposure", &SettingValue::Int(1));
        assert!(result.is_err());
    }
}
