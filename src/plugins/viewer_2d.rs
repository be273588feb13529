//! 2D viewer plugin for Hamamatsu DCAM cameras.
//!
//! Bridges the host framework's viewer lifecycle to the [`DcamCamera`]
//! adapter. Two acquisition modes are exposed:
//!
//! - *single shot*: `grab` starts a snap, blocks for the frame, stops, and
//!   emits one 2D package;
//! - *continuous*: `grab` starts a sequence and a worker that blocks on the
//!   frame wait, emitting one package per completion until `stop`. A wait
//!   cancelled by `stop` is treated as "no frame, do nothing".
//!
//! ROI and binning changes are staged by `commit_setting` and applied to
//! the device only on the explicit `commit_roi` setting; the committed
//! geometry is always read back from the device.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};

use crate::config::Settings;
use crate::core::{
    Axis, DataDim, DataExport, InitResult, SampleBuffer, SettingDescriptor, SettingValue,
    ViewerPlugin,
};
use crate::hardware::dcam::{
    CaptureMode, DcamCamera, FpsEstimator, Frame, FrameWait, PropertyId, RoiRequest, RoiState,
    TRIGGER_SOURCE_INTERNAL,
};

/// Adapter handle shared between a master plugin and its slaves.
pub type SharedCamera = Arc<Mutex<DcamCamera>>;

const DATA_CHANNEL_CAPACITY: usize = 32;

/// Margin added to the exposure time when waiting for a single frame.
const SNAP_TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

/// Plugin-level acquisition mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquisitionMode {
    SingleShot,
    Continuous,
}

impl AcquisitionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleShot => "single",
            Self::Continuous => "continuous",
        }
    }
}

/// DCAM camera viewer plugin.
pub struct DcamViewer {
    controller: Option<SharedCamera>,
    is_master: bool,
    sender: Option<broadcast::Sender<DataExport>>,
    mode: AcquisitionMode,
    model: String,
    detector: (u32, u32),
    exposure_ms: f64,
    /// ROI request staged from setting changes, applied on `commit_roi`.
    staged: RoiRequest,
    committed: RoiState,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl DcamViewer {
    pub fn new() -> Self {
        Self {
            controller: None,
            is_master: false,
            sender: None,
            mode: AcquisitionMode::SingleShot,
            model: String::new(),
            detector: (0, 0),
            exposure_ms: 0.0,
            staged: RoiRequest {
                x0: 0,
                y0: 0,
                width: 0,
                height: 0,
                xbin: 1,
                ybin: 1,
            },
            committed: RoiState::full_sensor(0, 0),
            worker: None,
        }
    }

    /// Shared handle onto the adapter, for wiring up slave instances.
    pub fn controller(&self) -> Option<SharedCamera> {
        self.controller.clone()
    }

    /// Currently staged (not yet committed) ROI request.
    pub fn staged_roi(&self) -> RoiRequest {
        self.staged
    }

    /// Committed ROI as last read back from the device.
    pub fn committed_roi(&self) -> RoiState {
        self.committed
    }

    fn require_controller(&self) -> Result<&SharedCamera> {
        self.controller
            .as_ref()
            .ok_or_else(|| anyhow!("Camera plugin is not initialized"))
    }

    /// Reset the staged request to the full committed view.
    fn restage_from_committed(&mut self) {
        self.staged = RoiRequest {
            x0: 0,
            y0: 0,
            width: self.committed.binned_width(),
            height: self.committed.binned_height(),
            xbin: self.committed.hbin,
            ybin: self.committed.vbin,
        };
    }

    fn export_from_frame(frame: &Frame, fps: Option<f64>) -> DataExport {
        DataExport {
            name: "Camera Image".to_string(),
            dim: DataDim::Data2D,
            labels: vec!["camera_image".to_string()],
            axes: vec![
                Axis::new("Pixels", "", 0, (0..frame.height).map(f64::from).collect()),
                Axis::new("Pixels", "", 1, (0..frame.width).map(f64::from).collect()),
            ],
            samples: SampleBuffer::U16(frame.data.clone()),
            timestamp: chrono::Utc::now(),
            metadata: Some(serde_json::json!({
                "frame": frame.frame_number,
                "fps": fps,
            })),
        }
    }

    /// Worker loop: block on the frame wait, read and emit each completion.
    ///
    /// Single producer, single consumer, no queueing: an unconsumed export
    /// is simply superseded by the next one downstream.
    fn run_frame_worker(
        camera: SharedCamera,
        mut waiter: crate::hardware::dcam::FrameWaiter,
        sender: broadcast::Sender<DataExport>,
    ) {
        let mut fps = FpsEstimator::new();
        let mut last_tag = 0u64;
        loop {
            match waiter.wait_since(last_tag, Duration::from_secs(10)) {
                Ok(FrameWait::Ready { tag }) => {
                    last_tag = tag;
                    let estimate = fps.tick(Instant::now());
                    let frame = camera.blocking_lock().read_newest_frame();
                    match frame {
                        Ok(frame) => {
                            debug!("Frame {} ready (tag {})", frame.frame_number, tag);
                            // No receivers yet is fine; keep streaming.
                            let _ = sender.send(Self::export_from_frame(&frame, estimate));
                        }
                        Err(err) => {
                            warn!("Frame readout failed: {}", err);
                            break;
                        }
                    }
                }
                Ok(FrameWait::TimedOut) => {
                    warn!("Frame wait timed out; still waiting");
                }
                Ok(FrameWait::Cancelled) => break,
                Err(err) => {
                    warn!("Frame wait failed: {}", err);
                    break;
                }
            }
        }
        debug!("Frame worker exited");
    }

    async fn grab_single(&mut self, controller: SharedCamera) -> Result<()> {
        let (mut waiter, timeout) = {
            let mut camera = controller.lock().await;
            camera.start_acquisition(CaptureMode::Snap)?;
            let timeout =
                Duration::from_secs_f64(self.exposure_ms / 1000.0) + SNAP_TIMEOUT_MARGIN;
            (camera.frame_waiter()?, timeout)
        };

        // Block for the frame off the async executor.
        let outcome = tokio::task::spawn_blocking(move || waiter.wait_since(0, timeout)).await??;

        let mut camera = controller.lock().await;
        match outcome {
            FrameWait::Ready { .. } => {
                let frame = camera.read_newest_frame()?;
                camera.stop_acquisition()?;
                drop(camera);
                if let Some(sender) = &self.sender {
                    let _ = sender.send(Self::export_from_frame(&frame, None));
                }
                Ok(())
            }
            FrameWait::Cancelled => {
                // Stop raced the wait; nothing to emit.
                camera.stop_acquisition()?;
                Ok(())
            }
            FrameWait::TimedOut => {
                camera.stop_acquisition()?;
                Err(anyhow!("Timed out waiting for a camera frame"))
            }
        }
    }

    async fn grab_continuous(&mut self, controller: SharedCamera) -> Result<()> {
        if self.worker.as_ref().is_some_and(|w| !w.is_finished()) {
            // Already streaming; frames keep arriving on the data channel.
            return Ok(());
        }

        let waiter = {
            let mut camera = controller.lock().await;
            camera.start_acquisition(CaptureMode::Sequence)?;
            camera.frame_waiter()?
        };
        let sender = self
            .sender
            .clone()
            .ok_or_else(|| anyhow!("Camera plugin is not initialized"))?;

        self.worker = Some(std::thread::spawn(move || {
            Self::run_frame_worker(controller, waiter, sender);
        }));
        Ok(())
    }
}

impl Default for DcamViewer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ViewerPlugin for DcamViewer {
    type Controller = SharedCamera;

    fn name(&self) -> &str {
        "DCAM camera"
    }

    async fn initialize(
        &mut self,
        settings: &Arc<Settings>,
        shared: Option<SharedCamera>,
    ) -> Result<InitResult> {
        let controller = match shared {
            Some(controller) => {
                self.is_master = false;
                controller
            }
            None => {
                self.is_master = true;
                let camera = DcamCamera::open(settings.camera.index)?;
                Arc::new(Mutex::new(camera))
            }
        };

        {
            let mut camera = controller.lock().await;
            if self.is_master {
                camera.set_property(PropertyId::ReadoutSpeed, settings.camera.readout_speed)?;
                camera.set_property(
                    PropertyId::DefectCorrectMode,
                    if settings.camera.defect_correct { 1.0 } else { 0.0 },
                )?;
                camera.set_property(PropertyId::ExposureTime, settings.camera.exposure_ms / 1000.0)?;
            }
            self.model = camera.model().to_string();
            self.detector = camera.detector_size();
            // Populate control values from the device, not the request.
            self.exposure_ms = camera.get_property(PropertyId::ExposureTime)? * 1000.0;
            self.committed = camera.read_back_roi()?;
        }
        self.restage_from_committed();
        self.mode = AcquisitionMode::SingleShot;

        let (sender, _) = broadcast::channel(DATA_CHANNEL_CAPACITY);
        self.sender = Some(sender);
        self.controller = Some(controller);

        let info = format!(
            "{}: {}x{} px, exposure {:.1} ms",
            self.model,
            self.committed.hsize,
            self.committed.vsize,
            self.exposure_ms
        );
        info!("Camera initialized: {}", info);
        Ok(InitResult {
            info,
            initialized: true,
        })
    }

    fn setting_descriptors(&self) -> Vec<SettingDescriptor> {
        let (det_w, det_h) = self.detector;
        vec![
            SettingDescriptor::new("camera_model", "Camera Model", self.model.as_str()).disabled(),
            SettingDescriptor::new("exposure_ms", "Exposure time (ms)", self.exposure_ms)
                .with_range(0.1, 10_000.0),
            SettingDescriptor::new("hsize", "Horizontal Size (px)", self.staged.width)
                .with_range(2.0, det_w as f64),
            SettingDescriptor::new("vsize", "Vertical Size (px)", self.staged.height)
                .with_range(2.0, det_h as f64),
            SettingDescriptor::new("hpos", "Horizontal Position (px)", self.staged.x0)
                .with_range(0.0, det_w.saturating_sub(2) as f64),
            SettingDescriptor::new("vpos", "Vertical Position (px)", self.staged.y0)
                .with_range(0.0, det_h.saturating_sub(2) as f64),
            SettingDescriptor::new("binning", "Binning", self.staged.xbin).with_range(1.0, 4.0),
            SettingDescriptor::new("commit_roi", "Apply ROI", false),
            SettingDescriptor::new("acq_mode", "Acquisition Mode", self.mode.as_str()),
        ]
    }

    async fn commit_setting(&mut self, name: &str, value: SettingValue) -> Result<()> {
        match name {
            "exposure_ms" => {
                let ms = value
                    .as_f64()
                    .ok_or_else(|| anyhow!("Invalid exposure value: {:?}", value))?;
                let controller = self.require_controller()?.clone();
                let applied = controller
                    .lock()
                    .await
                    .set_property(PropertyId::ExposureTime, ms / 1000.0)?;
                self.exposure_ms = applied * 1000.0;
            }
            "hsize" => {
                self.staged.width = value.as_i64().unwrap_or(self.staged.width as i64) as u32;
            }
            "vsize" => {
                self.staged.height = value.as_i64().unwrap_or(self.staged.height as i64) as u32;
            }
            "hpos" => {
                self.staged.x0 = value.as_i64().unwrap_or(self.staged.x0 as i64) as u32;
            }
            "vpos" => {
                self.staged.y0 = value.as_i64().unwrap_or(self.staged.y0 as i64) as u32;
            }
            "binning" => {
                let bin = value.as_i64().unwrap_or(1).max(1) as u32;
                self.staged.xbin = bin;
                self.staged.ybin = bin;
            }
            "commit_roi" => {
                if value.as_bool().unwrap_or(false) {
                    let staged = self.staged;
                    let controller = self.require_controller()?.clone();
                    self.committed = controller.lock().await.commit_roi(&staged)?;
                    self.restage_from_committed();
                }
            }
            "acq_mode" => {
                let mode = match value.as_str() {
                    Some("continuous") => AcquisitionMode::Continuous,
                    Some("single") => AcquisitionMode::SingleShot,
                    other => return Err(anyhow!("Invalid acquisition mode: {:?}", other)),
                };
                if mode != self.mode {
                    // Leaving continuous mode halts the stream first; a mode
                    // change always re-arms the internal trigger.
                    self.stop().await?;
                    let controller = self.require_controller()?.clone();
                    controller
                        .lock()
                        .await
                        .set_property(PropertyId::TriggerSource, TRIGGER_SOURCE_INTERNAL)?;
                    self.mode = mode;
                }
            }
            _ => {
                warn!("Unknown camera setting '{}'", name);
            }
        }
        Ok(())
    }

    async fn grab(&mut self, naverage: usize) -> Result<()> {
        if naverage > 1 {
            debug!("Hardware averaging not supported by the camera path; emitting single frames");
        }
        let controller = self.require_controller()?.clone();
        match self.mode {
            AcquisitionMode::SingleShot => self.grab_single(controller).await,
            AcquisitionMode::Continuous => self.grab_continuous(controller).await,
        }
    }

    async fn stop(&mut self) -> Result<()> {
        // Best-effort: log failures, never propagate them.
        if let Some(controller) = &self.controller {
            if let Err(err) = controller.lock().await.stop_acquisition() {
                warn!("Stop acquisition failed: {}", err);
            }
        }
        if let Some(worker) = self.worker.take() {
            // The cancelled wait ends the worker promptly.
            let _ = tokio::task::spawn_blocking(move || worker.join()).await;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stop().await?;
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
            .ok_or_else(|| anyhow!("Camera plugin is not initialized"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquisition_mode_labels() {
        assert_eq!(AcquisitionMode::SingleShot.as_str(), "single");
        assert_eq!(AcquisitionMode::Continuous.as_str(), "continuous");
    }

    #[test]
    fn test_export_shape_matches_frame() {
        let frame = Frame {
            width: 4,
            height: 3,
            frame_number: 7,
            data: vec![0; 12],
        };
        let export = DcamViewer::export_from_frame(&frame, Some(9.5));
        assert_eq!(export.dim, DataDim::Data2D);
        assert_eq!(export.axes[0].data.len(), 3);
        assert_eq!(export.axes[1].data.len(), 4);
        assert_eq!(export.samples.len(), 12);
        let metadata = export.metadata.unwrap();
        assert_eq!(metadata["frame"], 7);
        assert_eq!(metadata["fps"], 9.5);
    }
}
