//! Hamamatsu DCAM camera driver.
//!
//! Wraps the DCAM-API camera SDK: enumerate/open by index, named property
//! access with read-back, capture control (snap / sequence), newest-frame
//! reads and a blocking frame wait. On top of the raw SDK the adapter adds
//! the ROI/binning commit (requested regions in display pixels rescaled to
//! the absolute hardware tuple) and the smoothed frames-per-second
//! estimate used by the 2D viewer.
//!
//! Without the `dcam_hardware` feature the adapter drives a simulated
//! camera producing deterministic gradient frames.

use crate::error::{PluginError, PluginResult};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(not(feature = "dcam_hardware"))]
use rand::{rngs::StdRng, Rng, SeedableRng};

// =============================================================================
// Properties
// =============================================================================

/// Named camera properties exposed by the adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PropertyId {
    /// Exposure time in seconds.
    ExposureTime,
    SubarrayHpos,
    SubarrayHsize,
    SubarrayVpos,
    SubarrayVsize,
    /// Symmetric binning factor.
    Binning,
    ReadoutSpeed,
    DefectCorrectMode,
    /// Trigger source (1 = internal).
    TriggerSource,
}

/// Trigger-source value for free-running internal triggering.
pub const TRIGGER_SOURCE_INTERNAL: f64 = 1.0;

impl PropertyId {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExposureTime => "exposure_time",
            Self::SubarrayHpos => "subarray_hpos",
            Self::SubarrayHsize => "subarray_hsize",
            Self::SubarrayVpos => "subarray_vpos",
            Self::SubarrayVsize => "subarray_vsize",
            Self::Binning => "binning",
            Self::ReadoutSpeed => "readout_speed",
            Self::DefectCorrectMode => "defect_correct_mode",
            Self::TriggerSource => "trigger_source",
        }
    }

    #[cfg(feature = "dcam_hardware")]
    fn dcam_id(&self) -> i32 {
        match self {
            Self::ExposureTime => dcamusb_sys::DCAM_IDPROP_EXPOSURETIME as i32,
            Self::SubarrayHpos => dcamusb_sys::DCAM_IDPROP_SUBARRAYHPOS as i32,
            Self::SubarrayHsize => dcamusb_sys::DCAM_IDPROP_SUBARRAYHSIZE as i32,
            Self::SubarrayVpos => dcamusb_sys::DCAM_IDPROP_SUBARRAYVPOS as i32,
            Self::SubarrayVsize => dcamusb_sys::DCAM_IDPROP_SUBARRAYVSIZE as i32,
            Self::Binning => dcamusb_sys::DCAM_IDPROP_BINNING as i32,
            Self::ReadoutSpeed => dcamusb_sys::DCAM_IDPROP_READOUTSPEED as i32,
            Self::DefectCorrectMode => dcamusb_sys::DCAM_IDPROP_DEFECTCORRECT_MODE as i32,
            Self::TriggerSource => dcamusb_sys::DCAM_IDPROP_TRIGGERSOURCE as i32,
        }
    }
}

// =============================================================================
// ROI / binning
// =============================================================================

/// Committed ROI and binning state, always read back from the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoiState {
    /// Horizontal offset in hardware pixels.
    pub hpos: u32,
    /// Width in hardware pixels.
    pub hsize: u32,
    /// Vertical offset in hardware pixels.
    pub vpos: u32,
    /// Height in hardware pixels.
    pub vsize: u32,
    pub hbin: u32,
    pub vbin: u32,
}

impl RoiState {
    pub fn full_sensor(width: u32, height: u32) -> Self {
        Self {
            hpos: 0,
            hsize: width,
            vpos: 0,
            vsize: height,
            hbin: 1,
            vbin: 1,
        }
    }

    /// Frame width after binning.
    pub fn binned_width(&self) -> u32 {
        self.hsize / self.hbin.max(1)
    }

    /// Frame height after binning.
    pub fn binned_height(&self) -> u32 {
        self.vsize / self.vbin.max(1)
    }
}

/// Requested sub-region, expressed in the current ROI's binned pixel units
/// and relative to the current offset (i.e. what the operator selects on
/// the displayed image).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoiRequest {
    pub x0: u32,
    pub y0: u32,
    pub width: u32,
    pub height: u32,
    /// Binning factors applied after the commit.
    pub xbin: u32,
    pub ybin: u32,
}

/// Absolute hardware-pixel ROI tuple as consumed by the SDK:
/// (hbegin, hend, hbin, vbegin, vend, vbin), end exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HardwareRegion {
    pub hbegin: u32,
    pub hend: u32,
    pub hbin: u32,
    pub vbegin: u32,
    pub vend: u32,
    pub vbin: u32,
}

/// Rescale a requested sub-region against the committed ROI into the
/// absolute hardware tuple. Offsets and sizes of the request are in the
/// *current* binned units; the new binning only takes effect afterwards.
pub fn rescale_roi(current: &RoiState, request: &RoiRequest) -> HardwareRegion {
    let hbegin = current.hpos + request.x0 * current.hbin;
    let hend = hbegin + request.width * current.hbin;
    let vbegin = current.vpos + request.y0 * current.vbin;
    let vend = vbegin + request.height * current.vbin;
    HardwareRegion {
        hbegin,
        hend,
        hbin: request.xbin,
        vbegin,
        vend,
        vbin: request.ybin,
    }
}

// =============================================================================
// FPS smoothing
// =============================================================================

/// Exponentially smoothed frame-rate estimate.
///
/// `fps = 0.9 * fps_prev + 0.1 / dt`; the very first tick only records the
/// reference instant (no interval exists yet), and the first measured
/// interval initializes the estimate directly.
#[derive(Debug)]
pub struct FpsEstimator {
    fps: f64,
    last: Option<Instant>,
}

impl FpsEstimator {
    pub fn new() -> Self {
        Self { fps: 0.0, last: None }
    }

    /// Feed a frame-arrival instant; returns the updated estimate once one
    /// full interval has been observed.
    pub fn tick(&mut self, now: Instant) -> Option<f64> {
        let estimate = match self.last {
            None => None,
            Some(prev) => {
                let dt = now.saturating_duration_since(prev).as_secs_f64();
                if dt <= 0.0 {
                    // Two completions in the same instant; keep the estimate.
                    Some(self.fps)
                } else {
                    let instantaneous = 1.0 / dt;
                    self.fps = if self.fps == 0.0 {
                        instantaneous
                    } else {
                        0.9 * self.fps + 0.1 * instantaneous
                    };
                    Some(self.fps)
                }
            }
        };
        self.last = Some(now);
        estimate
    }

    /// Last computed estimate (0.0 before the second frame).
    pub fn fps(&self) -> f64 {
        self.fps
    }
}

impl Default for FpsEstimator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Frames and capture control
// =============================================================================

/// Capture mode mapped onto the SDK's snap/sequence modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureMode {
    /// One frame per start.
    Snap,
    /// Free-running sequence until stopped.
    Sequence,
}

/// Outcome of a blocking frame wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameWait {
    /// A new frame is ready; `tag` identifies it for wait-since calls.
    Ready { tag: u64 },
    /// No frame arrived within the timeout.
    TimedOut,
    /// The wait was aborted because acquisition stopped. Not an error:
    /// treated as "no frame, do nothing".
    Cancelled,
}

/// One frame read back from the SDK's internal buffer.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Width after binning.
    pub width: u32,
    /// Height after binning.
    pub height: u32,
    pub frame_number: u64,
    /// Row-major samples, length `width * height`.
    pub data: Vec<u16>,
}

/// Blocking-wait handle usable from a worker thread while the camera
/// object stays with the control flow. At most one wait is outstanding at
/// a time; a stop during a pending wait resolves it as [`FrameWait::Cancelled`].
pub struct FrameWaiter {
    acquiring: Arc<AtomicBool>,
    #[cfg(not(feature = "dcam_hardware"))]
    counter: Arc<AtomicU64>,
    #[cfg(not(feature = "dcam_hardware"))]
    frame_period: Duration,
    #[cfg(feature = "dcam_hardware")]
    hdcam: usize,
}

impl FrameWaiter {
    /// Block until a frame newer than `last_tag` completes, a timeout, or
    /// cancellation.
    pub fn wait_since(&mut self, last_tag: u64, timeout: Duration) -> PluginResult<FrameWait> {
        #[cfg(feature = "dcam_hardware")]
        {
            let mut event = dcamusb_sys::DCAM_EVENT_FRAMEEND as i32;
            let status = unsafe {
                dcamusb_sys::dcam_wait(
                    self.hdcam as *mut _,
                    &mut event,
                    timeout.as_millis() as u32,
                    std::ptr::null_mut(),
                )
            };
            if status == 0 {
                // Distinguish abort/timeout from hard failures.
                let err = unsafe { dcamusb_sys::dcam_getlasterror(self.hdcam as *mut _, std::ptr::null_mut(), 0) };
                if err == dcamusb_sys::DCAMERR_ABORT as i32 {
                    return Ok(FrameWait::Cancelled);
                }
                if err == dcamusb_sys::DCAMERR_TIMEOUT as i32 {
                    return Ok(FrameWait::TimedOut);
                }
                return Err(PluginError::Sdk {
                    call: "dcam_wait",
                    status: err,
                });
            }
            if !self.acquiring.load(Ordering::SeqCst) {
                return Ok(FrameWait::Cancelled);
            }
            let mut count: i32 = 0;
            let mut newest: i32 = 0;
            unsafe {
                dcamusb_sys::dcam_gettransferinfo(self.hdcam as *mut _, &mut newest, &mut count);
            }
            let tag = count as u64;
            if tag <= last_tag {
                return Ok(FrameWait::TimedOut);
            }
            Ok(FrameWait::Ready { tag })
        }
        #[cfg(not(feature = "dcam_hardware"))]
        {
            let deadline = Instant::now() + timeout;
            let frame_at = Instant::now() + self.frame_period;
            loop {
                if !self.acquiring.load(Ordering::SeqCst) {
                    return Ok(FrameWait::Cancelled);
                }
                let now = Instant::now();
                if now >= frame_at {
                    let tag = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if tag > last_tag {
                        return Ok(FrameWait::Ready { tag });
                    }
                }
                if now >= deadline {
                    return Ok(FrameWait::TimedOut);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

// =============================================================================
// Mock device
// =============================================================================

/// Simulated camera used when the DCAM SDK is not linked in.
#[cfg(not(feature = "dcam_hardware"))]
struct MockDcamDevice {
    exposure_sec: f64,
    readout_speed: f64,
    defect_correct_mode: f64,
    trigger_source: f64,
    rng: StdRng,
}

#[cfg(not(feature = "dcam_hardware"))]
impl MockDcamDevice {
    fn new() -> Self {
        Self {
            exposure_sec: 0.1,
            readout_speed: 1.0,
            defect_correct_mode: 1.0,
            trigger_source: TRIGGER_SOURCE_INTERNAL,
            rng: StdRng::seed_from_u64(0xDCA4),
        }
    }

    fn fill_frame(&mut self, width: u32, height: u32, frame_number: u64, data: &mut Vec<u16>) {
        data.clear();
        data.reserve((width * height) as usize);
        // Diagonal gradient with a moving bright band so consecutive frames
        // differ, plus a little read noise.
        let shift = (frame_number % 64) as u32;
        for y in 0..height {
            for x in 0..width {
                let base = ((x + y + shift) % 256) * 200;
                let noise: i32 = self.rng.gen_range(-50..50);
                data.push((base as i32 + noise).clamp(0, u16::MAX as i32) as u16);
            }
        }
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// Hamamatsu DCAM camera adapter.
pub struct DcamCamera {
    index: usize,
    model: String,
    detector_width: u32,
    detector_height: u32,
    roi: RoiState,
    acquiring: Arc<AtomicBool>,
    frame_counter: Arc<AtomicU64>,
    open: bool,
    #[cfg(not(feature = "dcam_hardware"))]
    mock: MockDcamDevice,
    #[cfg(feature = "dcam_hardware")]
    hdcam: usize,
}

impl DcamCamera {
    /// Number of cameras on the bus.
    pub fn enumerate() -> PluginResult<usize> {
        #[cfg(feature = "dcam_hardware")]
        {
            let mut count: i32 = 0;
            let status = unsafe { dcamusb_sys::dcam_init(std::ptr::null_mut(), &mut count, std::ptr::null()) };
            if status == 0 {
                return Err(PluginError::Sdk {
                    call: "dcam_init",
                    status,
                });
            }
            Ok(count as usize)
        }
        #[cfg(not(feature = "dcam_hardware"))]
        {
            Ok(1)
        }
    }

    /// Open the camera at `index` and read its model and detector size.
    pub fn open(index: usize) -> PluginResult<Self> {
        let count = Self::enumerate()?;
        if index >= count {
            return Err(PluginError::CameraNotFound(index));
        }

        #[cfg(feature = "dcam_hardware")]
        {
            let mut hdcam: *mut std::ffi::c_void = std::ptr::null_mut();
            let status = unsafe { dcamusb_sys::dcam_open(&mut hdcam, index as i32, std::ptr::null()) };
            if status == 0 || hdcam.is_null() {
                return Err(PluginError::Sdk {
                    call: "dcam_open",
                    status,
                });
            }
            let mut camera = Self {
                index,
                model: String::new(),
                detector_width: 0,
                detector_height: 0,
                roi: RoiState::full_sensor(0, 0),
                acquiring: Arc::new(AtomicBool::new(false)),
                frame_counter: Arc::new(AtomicU64::new(0)),
                open: true,
                hdcam: hdcam as usize,
            };
            camera.model = camera.read_model_info()?;
            let (w, h) = camera.read_detector_size()?;
            camera.detector_width = w;
            camera.detector_height = h;
            camera.roi = camera.read_back_roi()?;
            info!("Opened DCAM camera {} ({})", index, camera.model);
            Ok(camera)
        }
        #[cfg(not(feature = "dcam_hardware"))]
        {
            let camera = Self {
                index,
                model: "C11440-36U (simulated)".to_string(),
                detector_width: 1920,
                detector_height: 1200,
                roi: RoiState::full_sensor(1920, 1200),
                acquiring: Arc::new(AtomicBool::new(false)),
                frame_counter: Arc::new(AtomicU64::new(0)),
                open: true,
                mock: MockDcamDevice::new(),
            };
            info!("Opened DCAM camera {} ({})", index, camera.model);
            Ok(camera)
        }
    }

    /// Camera model string.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Bus index this camera was opened at.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Full detector size in hardware pixels.
    pub fn detector_size(&self) -> (u32, u32) {
        (self.detector_width, self.detector_height)
    }

    /// Committed ROI state (as last read back from the device).
    pub fn roi(&self) -> RoiState {
        self.roi
    }

    /// Whether an acquisition is currently running.
    pub fn is_acquiring(&self) -> bool {
        self.acquiring.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> PluginResult<()> {
        if !self.open {
            return Err(PluginError::NotConnected(self.model.clone()));
        }
        Ok(())
    }

    /// Read a named property value.
    pub fn get_property(&mut self, id: PropertyId) -> PluginResult<f64> {
        self.ensure_open()?;
        #[cfg(feature = "dcam_hardware")]
        {
            let mut value: f64 = 0.0;
            let status = unsafe {
                dcamusb_sys::dcam_getpropertyvalue(self.hdcam as *mut _, id.dcam_id(), &mut value)
            };
            if status == 0 {
                return Err(PluginError::Sdk {
                    call: "dcam_getpropertyvalue",
                    status,
                });
            }
            Ok(value)
        }
        #[cfg(not(feature = "dcam_hardware"))]
        {
            Ok(match id {
                PropertyId::ExposureTime => self.mock.exposure_sec,
                PropertyId::SubarrayHpos => self.roi.hpos as f64,
                PropertyId::SubarrayHsize => self.roi.hsize as f64,
                PropertyId::SubarrayVpos => self.roi.vpos as f64,
                PropertyId::SubarrayVsize => self.roi.vsize as f64,
                PropertyId::Binning => self.roi.hbin as f64,
                PropertyId::ReadoutSpeed => self.mock.readout_speed,
                PropertyId::DefectCorrectMode => self.mock.defect_correct_mode,
                PropertyId::TriggerSource => self.mock.trigger_source,
            })
        }
    }

    /// Write a named property value and return the value read back from
    /// the device (the hardware may round).
    pub fn set_property(&mut self, id: PropertyId, value: f64) -> PluginResult<f64> {
        self.ensure_open()?;
        debug!("Set {} = {}", id.name(), value);
        #[cfg(feature = "dcam_hardware")]
        {
            let mut applied = value;
            let status = unsafe {
                dcamusb_sys::dcam_setgetpropertyvalue(
                    self.hdcam as *mut _,
                    id.dcam_id(),
                    &mut applied,
                    0,
                )
            };
            if status == 0 {
                return Err(PluginError::Sdk {
                    call: "dcam_setgetpropertyvalue",
                    status,
                });
            }
            Ok(applied)
        }
        #[cfg(not(feature = "dcam_hardware"))]
        {
            match id {
                PropertyId::ExposureTime => self.mock.exposure_sec = value.max(0.0),
                PropertyId::SubarrayHpos => self.roi.hpos = value as u32,
                PropertyId::SubarrayHsize => self.roi.hsize = value as u32,
                PropertyId::SubarrayVpos => self.roi.vpos = value as u32,
                PropertyId::SubarrayVsize => self.roi.vsize = value as u32,
                PropertyId::Binning => {
                    self.roi.hbin = (value as u32).max(1);
                    self.roi.vbin = (value as u32).max(1);
                }
                PropertyId::ReadoutSpeed => self.mock.readout_speed = value,
                PropertyId::DefectCorrectMode => self.mock.defect_correct_mode = value,
                PropertyId::TriggerSource => self.mock.trigger_source = value,
            }
            self.get_property(id)
        }
    }

    /// Read the subarray/binning state back from the device.
    pub fn read_back_roi(&mut self) -> PluginResult<RoiState> {
        let hpos = self.get_property(PropertyId::SubarrayHpos)? as u32;
        let hsize = self.get_property(PropertyId::SubarrayHsize)? as u32;
        let vpos = self.get_property(PropertyId::SubarrayVpos)? as u32;
        let vsize = self.get_property(PropertyId::SubarrayVsize)? as u32;
        let bin = (self.get_property(PropertyId::Binning)? as u32).max(1);
        let roi = RoiState {
            hpos,
            hsize,
            vpos,
            vsize,
            hbin: bin,
            vbin: bin,
        };
        self.roi = roi;
        Ok(roi)
    }

    /// Apply a requested sub-region against the committed ROI: rescale to
    /// the absolute hardware tuple, write the subarray properties, then
    /// read the resulting geometry back from the device.
    pub fn commit_roi(&mut self, request: &RoiRequest) -> PluginResult<RoiState> {
        self.ensure_open()?;
        let region = rescale_roi(&self.roi, request);
        debug!(
            "Commit ROI ({},{},{},{},{},{})",
            region.hbegin, region.hend, region.hbin, region.vbegin, region.vend, region.vbin
        );
        self.set_property(PropertyId::Binning, region.hbin as f64)?;
        self.set_property(PropertyId::SubarrayHpos, region.hbegin as f64)?;
        self.set_property(PropertyId::SubarrayHsize, (region.hend - region.hbegin) as f64)?;
        self.set_property(PropertyId::SubarrayVpos, region.vbegin as f64)?;
        self.set_property(PropertyId::SubarrayVsize, (region.vend - region.vbegin) as f64)?;
        self.read_back_roi()
    }

    /// Arm and start an acquisition in the given capture mode.
    pub fn start_acquisition(&mut self, mode: CaptureMode) -> PluginResult<()> {
        self.ensure_open()?;
        if self.acquiring.swap(true, Ordering::SeqCst) {
            warn!("Acquisition already running on {}", self.model);
            return Ok(());
        }
        #[cfg(feature = "dcam_hardware")]
        {
            let capture_mode = match mode {
                CaptureMode::Snap => dcamusb_sys::DCAM_CAPTUREMODE_SNAP as i32,
                CaptureMode::Sequence => dcamusb_sys::DCAM_CAPTUREMODE_SEQUENCE as i32,
            };
            let status = unsafe { dcamusb_sys::dcam_precapture(self.hdcam as *mut _, capture_mode) };
            if status == 0 {
                self.acquiring.store(false, Ordering::SeqCst);
                return Err(PluginError::Sdk {
                    call: "dcam_precapture",
                    status,
                });
            }
            let status = unsafe { dcamusb_sys::dcam_capture(self.hdcam as *mut _) };
            if status == 0 {
                self.acquiring.store(false, Ordering::SeqCst);
                return Err(PluginError::Sdk {
                    call: "dcam_capture",
                    status,
                });
            }
        }
        debug!("Started {:?} acquisition on {}", mode, self.model);
        Ok(())
    }

    /// Stop the running acquisition and clear the transfer state. A wait
    /// pending on a [`FrameWaiter`] resolves as `Cancelled`. Safe to call
    /// when nothing is running.
    pub fn stop_acquisition(&mut self) -> PluginResult<()> {
        if !self.acquiring.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        #[cfg(feature = "dcam_hardware")]
        {
            let status = unsafe { dcamusb_sys::dcam_idle(self.hdcam as *mut _) };
            if status == 0 {
                return Err(PluginError::Sdk {
                    call: "dcam_idle",
                    status,
                });
            }
            unsafe {
                dcamusb_sys::dcam_freeframe(self.hdcam as *mut _);
            }
        }
        debug!("Stopped acquisition on {}", self.model);
        Ok(())
    }

    /// Read the newest completed frame from the SDK's buffer.
    pub fn read_newest_frame(&mut self) -> PluginResult<Frame> {
        self.ensure_open()?;
        let width = self.roi.binned_width();
        let height = self.roi.binned_height();
        #[cfg(feature = "dcam_hardware")]
        {
            let mut top: *mut std::ffi::c_void = std::ptr::null_mut();
            let mut rowbytes: i32 = 0;
            // -1 selects the newest frame.
            let status = unsafe {
                dcamusb_sys::dcam_lockdata(self.hdcam as *mut _, &mut top, &mut rowbytes, -1)
            };
            if status == 0 {
                return Err(PluginError::Sdk {
                    call: "dcam_lockdata",
                    status,
                });
            }
            let samples = (width * height) as usize;
            let mut data = vec![0u16; samples];
            unsafe {
                std::ptr::copy_nonoverlapping(top as *const u16, data.as_mut_ptr(), samples);
                dcamusb_sys::dcam_unlockdata(self.hdcam as *mut _);
            }
            let frame_number = self.frame_counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Frame {
                width,
                height,
                frame_number,
                data,
            })
        }
        #[cfg(not(feature = "dcam_hardware"))]
        {
            let frame_number = self.frame_counter.load(Ordering::SeqCst).max(1);
            let mut data = Vec::new();
            self.mock.fill_frame(width, height, frame_number, &mut data);
            Ok(Frame {
                width,
                height,
                frame_number,
                data,
            })
        }
    }

    /// Create a blocking-wait handle for a worker thread.
    pub fn frame_waiter(&mut self) -> PluginResult<FrameWaiter> {
        self.ensure_open()?;
        #[cfg(feature = "dcam_hardware")]
        {
            Ok(FrameWaiter {
                acquiring: Arc::clone(&self.acquiring),
                hdcam: self.hdcam,
            })
        }
        #[cfg(not(feature = "dcam_hardware"))]
        {
            Ok(FrameWaiter {
                acquiring: Arc::clone(&self.acquiring),
                counter: Arc::clone(&self.frame_counter),
                frame_period: Duration::from_secs_f64(self.mock.exposure_sec.max(0.001)),
            })
        }
    }

    /// Release the camera. Safe to call repeatedly.
    pub fn close(&mut self) -> PluginResult<()> {
        if !self.open {
            return Ok(());
        }
        self.stop_acquisition()?;
        #[cfg(feature = "dcam_hardware")]
        {
            let status = unsafe { dcamusb_sys::dcam_close(self.hdcam as *mut _) };
            if status == 0 {
                return Err(PluginError::Sdk {
                    call: "dcam_close",
                    status,
                });
            }
        }
        self.open = false;
        info!("Closed DCAM camera {}", self.index);
        Ok(())
    }

    #[cfg(feature = "dcam_hardware")]
    fn read_model_info(&mut self) -> PluginResult<String> {
        let mut buf = [0i8; 64];
        let status = unsafe {
            dcamusb_sys::dcam_getmodelinfo(
                self.index as i32,
                dcamusb_sys::DCAM_IDSTR_MODEL as i32,
                buf.as_mut_ptr(),
                buf.len() as i32,
            )
        };
        if status == 0 {
            return Err(PluginError::Sdk {
                call: "dcam_getmodelinfo",
                status,
            });
        }
        let cstr = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
        Ok(cstr.to_string_lossy().into_owned())
    }

    #[cfg(feature = "dcam_hardware")]
    fn read_detector_size(&mut self) -> PluginResult<(u32, u32)> {
        let mut width: i32 = 0;
        let mut height: i32 = 0;
        let status = unsafe {
            dcamusb_sys::dcam_getdatasize(self.hdcam as *mut _, &mut width, &mut height)
        };
        if status == 0 {
            return Err(PluginError::Sdk {
                call: "dcam_getdatasize",
                status,
            });
        }
        Ok((width as u32, height as u32))
    }
}

impl Drop for DcamCamera {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale_roi_reference_case() {
        let current = RoiState {
            hpos: 0,
            hsize: 100,
            vpos: 0,
            vsize: 100,
            hbin: 1,
            vbin: 1,
        };
        let request = RoiRequest {
            x0: 10,
            y0: 10,
            width: 20,
            height: 20,
            xbin: 1,
            ybin: 1,
        };
        let region = rescale_roi(&current, &request);
        assert_eq!(
            region,
            HardwareRegion {
                hbegin: 10,
                hend: 30,
                hbin: 1,
                vbegin: 10,
                vend: 30,
                vbin: 1,
            }
        );
    }

    #[test]
    fn test_rescale_roi_respects_existing_offset_and_binning() {
        let current = RoiState {
            hpos: 100,
            hsize: 400,
            vpos: 50,
            vsize: 200,
            hbin: 2,
            vbin: 2,
        };
        let request = RoiRequest {
            x0: 10,
            y0: 5,
            width: 50,
            height: 25,
            xbin: 4,
            ybin: 4,
        };
        let region = rescale_roi(&current, &request);
        // Offsets scale by the current binning; the new factor applies after.
        assert_eq!(region.hbegin, 120);
        assert_eq!(region.hend, 220);
        assert_eq!(region.hbin, 4);
        assert_eq!(region.vbegin, 60);
        assert_eq!(region.vend, 110);
        assert_eq!(region.vbin, 4);
    }

    #[test]
    fn test_fps_smoothing_sequence() {
        let mut fps = FpsEstimator::new();
        let t0 = Instant::now();

        // First frame: no interval yet.
        assert_eq!(fps.tick(t0), None);
        // Second frame after 0.1 s initializes the estimate.
        let estimate = fps.tick(t0 + Duration::from_millis(100)).unwrap();
        assert!((estimate - 10.0).abs() < 1e-9);
        // Third frame after a further 0.2 s: 0.9*10 + 0.1*5 = 9.5.
        let estimate = fps.tick(t0 + Duration::from_millis(300)).unwrap();
        assert!((estimate - 9.5).abs() < 1e-9);
        assert!((fps.fps() - 9.5).abs() < 1e-9);
    }

    #[cfg(not(feature = "dcam_hardware"))]
    mod mock_device {
        use super::*;

        #[test]
        fn test_open_and_detector_size() {
            let camera = DcamCamera::open(0).expect("open mock camera");
            assert_eq!(camera.detector_size(), (1920, 1200));
            assert_eq!(camera.roi(), RoiState::full_sensor(1920, 1200));
        }

        #[test]
        fn test_open_out_of_range_index() {
            assert!(matches!(
                DcamCamera::open(3),
                Err(PluginError::CameraNotFound(3))
            ));
        }

        #[test]
        fn test_set_property_reads_back() {
            let mut camera = DcamCamera::open(0).expect("open mock camera");
            let applied = camera
                .set_property(PropertyId::ExposureTime, 0.02)
                .expect("set exposure");
            assert!((applied - 0.02).abs() < 1e-12);
        }

        #[test]
        fn test_commit_roi_reads_back_from_device() {
            let mut camera = DcamCamera::open(0).expect("open mock camera");
            let committed = camera
                .commit_roi(&RoiRequest {
                    x0: 100,
                    y0: 40,
                    width: 640,
                    height: 480,
                    xbin: 2,
                    ybin: 2,
                })
                .expect("commit roi");
            assert_eq!(committed.hpos, 100);
            assert_eq!(committed.hsize, 640);
            assert_eq!(committed.vpos, 40);
            assert_eq!(committed.vsize, 480);
            assert_eq!(committed.hbin, 2);
            assert_eq!(committed.binned_width(), 320);
            assert_eq!(committed.binned_height(), 240);
        }

        #[test]
        fn test_snap_frame_has_roi_shape() {
            let mut camera = DcamCamera::open(0).expect("open mock camera");
            camera
                .commit_roi(&RoiRequest {
                    x0: 0,
                    y0: 0,
                    width: 64,
                    height: 32,
                    xbin: 1,
                    ybin: 1,
                })
                .expect("commit roi");
            camera
                .start_acquisition(CaptureMode::Snap)
                .expect("start acquisition");
            let frame = camera.read_newest_frame().expect("read frame");
            camera.stop_acquisition().expect("stop");
            assert_eq!(frame.width, 64);
            assert_eq!(frame.height, 32);
            assert_eq!(frame.data.len(), 64 * 32);
        }

        #[test]
        fn test_stop_cancels_pending_wait() {
            let mut camera = DcamCamera::open(0).expect("open mock camera");
            // Long exposure so the wait is still pending when stop lands.
            camera
                .set_property(PropertyId::ExposureTime, 5.0)
                .expect("set exposure");
            camera
                .start_acquisition(CaptureMode::Sequence)
                .expect("start acquisition");
            let mut waiter = camera.frame_waiter().expect("waiter");

            let worker = std::thread::spawn(move || waiter.wait_since(0, Duration::from_secs(10)));
            std::thread::sleep(Duration::from_millis(50));
            camera.stop_acquisition().expect("stop");

            let outcome = worker.join().expect("join worker").expect("wait result");
            assert_eq!(outcome, FrameWait::Cancelled);
        }

        #[test]
        fn test_wait_returns_ready_tag() {
            let mut camera = DcamCamera::open(0).expect("open mock camera");
            camera
                .set_property(PropertyId::ExposureTime, 0.005)
                .expect("set exposure");
            camera
                .start_acquisition(CaptureMode::Sequence)
                .expect("start acquisition");
            let mut waiter = camera.frame_waiter().expect("waiter");
            let outcome = waiter.wait_since(0, Duration::from_secs(1)).expect("wait");
            assert!(matches!(outcome, FrameWait::Ready { tag } if tag >= 1));
            camera.stop_acquisition().expect("stop");
        }

        #[test]
        fn test_close_twice_is_safe() {
            let mut camera = DcamCamera::open(0).expect("open mock camera");
            camera.close().expect("first close");
            camera.close().expect("second close");
            assert!(matches!(
                camera.read_newest_frame(),
                Err(PluginError::NotConnected(_))
            ));
        }
    }
}
