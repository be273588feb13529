//! Hamamatsu mini-spectrometer driver (specu1b / TokuSpec).
//!
//! This module wraps the `specu1b` USB driver behind an owned
//! [`TokuspecSession`]: every adapter instance carries its own session and
//! parameter/information blocks, so nothing is shared between instances
//! when several devices are controlled concurrently.
//!
//! The call sequence against the SDK is linear: open device by product ID,
//! check it, open the USB pipe, read the unit information and calibration
//! once, then `acquire()` in a loop and `close()`. Every SDK status code is
//! checked; failures surface as [`PluginError::Sdk`] with no retry.
//!
//! Without the `tokuspec_hardware` feature the session drives a simulated
//! device producing a deterministic synthetic spectrum.

use crate::calibration::{
    linear_wavelength_axis, pixel_axis, sensor_size_from_unit_id, WavelengthCalibration,
    FACTORY_COEFFICIENTS,
};
use crate::error::{PluginError, PluginResult};
use log::{debug, info};

#[cfg(not(feature = "tokuspec_hardware"))]
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Hamamatsu USB vendor ID.
pub const HAMAMATSU_VENDOR_ID: u16 = 0x0661;

/// Integration time lower bound common to the family, in microseconds.
/// The per-model minimum can be higher (10 ms for the C10083CA).
pub const INTEGRATION_TIME_MIN_US: u32 = 5_000;

/// Integration time upper bound, in microseconds (10 s).
pub const INTEGRATION_TIME_MAX_US: u32 = 10_000_000;

/// EEPROM writes are honored only with this flag value.
pub const WRITE_ENABLE_FLAG: u8 = 0xAA;

/// Sentinel byte reported by the device for unsupported functions.
pub const UNAVAILABLE: u8 = 0xFF;

// =============================================================================
// Device families
// =============================================================================

/// Spectrometer families, selected by name and resolved to a USB product ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceFamily {
    /// Old TG series prototypes.
    Proto,
    /// C9404MC, C9405MC, C9406GC.
    Tg,
    /// C9913GC, C9914GB (TG-cooled NIR).
    TgCooled,
    /// C10082MD, C10083MD.
    Tm,
    /// C9404CA, C9404CAH, C9405CB, C9405CA.
    TgCcd,
    /// C10082CA, C10083CA, C10082CAH, C10083CAH.
    TmCcd,
    /// C11713CA.
    TgRaman1,
    /// C11714CA, C11714CB.
    TgRaman2,
}

impl DeviceFamily {
    /// Resolve a configuration selector to a family.
    pub fn from_selector(selector: &str) -> Option<Self> {
        match selector {
            "proto" => Some(Self::Proto),
            "tg" => Some(Self::Tg),
            "tg_cooled" => Some(Self::TgCooled),
            "tm" => Some(Self::Tm),
            "tg_ccd" => Some(Self::TgCcd),
            "tm_ccd" => Some(Self::TmCcd),
            "tg_raman1" => Some(Self::TgRaman1),
            "tg_raman2" => Some(Self::TgRaman2),
            _ => None,
        }
    }

    /// USB product ID for this family.
    pub fn product_id(&self) -> u16 {
        match self {
            Self::Proto => 0x2900,
            Self::Tg => 0x2905,
            Self::TgCooled => 0x2907,
            Self::Tm => 0x2908,
            Self::TgCcd => 0x290D,
            Self::TmCcd => 0x2909,
            Self::TgRaman1 => 0x2909,
            Self::TgRaman2 => 0x290D,
        }
    }
}

// =============================================================================
// Parameter and information blocks
// =============================================================================

/// Typed view of the gain byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gain {
    Low,
    High,
    /// Gain switching function is unavailable on this device (0xFF).
    Unavailable,
}

impl Gain {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Self::Low,
            0x01 => Self::High,
            _ => Self::Unavailable,
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            Self::Low => 0x00,
            Self::High => 0x01,
            Self::Unavailable => UNAVAILABLE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Typed view of the trigger-edge byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerEdge {
    Rising,
    Falling,
    /// External trigger function is unavailable on this device (0xFF).
    Unavailable,
}

impl TriggerEdge {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Self::Rising,
            0x01 => Self::Falling,
            _ => Self::Unavailable,
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            Self::Rising => 0x00,
            Self::Falling => 0x01,
            Self::Unavailable => UNAVAILABLE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rising => "rising",
            Self::Falling => "falling",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Typed view of the trigger-mode byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerMode {
    Internal,
    ExternalEdge,
    ExternalGate,
    /// External trigger function is unavailable on this device (0xFF).
    Unavailable,
}

impl TriggerMode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Self::Internal,
            0x01 => Self::ExternalEdge,
            0x02 => Self::ExternalGate,
            _ => Self::Unavailable,
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            Self::Internal => 0x00,
            Self::ExternalEdge => 0x01,
            Self::ExternalGate => 0x02,
            Self::Unavailable => UNAVAILABLE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::ExternalEdge => "external_edge",
            Self::ExternalGate => "external_gate",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Raw device parameter block, as exchanged with the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnitParameter {
    /// Integration time in microseconds.
    pub integration_time_us: u32,
    pub gain: u8,
    pub trigger_edge: u8,
    pub trigger_mode: u8,
    /// Reserved byte, carried through writes unchanged.
    pub reserved: u8,
}

impl UnitParameter {
    pub fn gain(&self) -> Gain {
        Gain::from_raw(self.gain)
    }

    pub fn trigger_edge(&self) -> TriggerEdge {
        TriggerEdge::from_raw(self.trigger_edge)
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        TriggerMode::from_raw(self.trigger_mode)
    }
}

/// Sparse parameter update, applied as one read-modify-write.
///
/// Every supplied field is applied. The historical driver wrapper applied
/// only the first supplied field and silently dropped the rest; that
/// behavior was judged a bug and is not preserved (see DESIGN.md).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParameterPatch {
    pub integration_time_us: Option<u32>,
    pub gain: Option<Gain>,
    pub trigger_edge: Option<TriggerEdge>,
    pub trigger_mode: Option<TriggerMode>,
}

impl ParameterPatch {
    pub fn integration_time_us(mut self, us: u32) -> Self {
        self.integration_time_us = Some(us);
        self
    }

    pub fn gain(mut self, gain: Gain) -> Self {
        self.gain = Some(gain);
        self
    }

    pub fn trigger_edge(mut self, edge: TriggerEdge) -> Self {
        self.trigger_edge = Some(edge);
        self
    }

    pub fn trigger_mode(mut self, mode: TriggerMode) -> Self {
        self.trigger_mode = Some(mode);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.integration_time_us.is_none()
            && self.gain.is_none()
            && self.trigger_edge.is_none()
            && self.trigger_mode.is_none()
    }

    /// Apply all supplied fields onto a parameter block.
    pub fn apply_to(&self, param: &mut UnitParameter) {
        if let Some(us) = self.integration_time_us {
            param.integration_time_us = us;
        }
        if let Some(gain) = self.gain {
            param.gain = gain.to_raw();
        }
        if let Some(edge) = self.trigger_edge {
            param.trigger_edge = edge.to_raw();
        }
        if let Some(mode) = self.trigger_mode {
            param.trigger_mode = mode.to_raw();
        }
    }
}

/// Unit information block: fixed-width ASCII identity fields plus the
/// reported spectral response bounds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitInformation {
    pub unit_id: String,
    pub sensor_name: String,
    pub serial_number: String,
    pub reserved: Vec<u8>,
    /// Lower spectral response bound, nm.
    pub wavelength_lower_nm: u16,
    /// Upper spectral response bound, nm.
    pub wavelength_upper_nm: u16,
}

/// Decode a fixed-width ASCII field, dropping NUL padding and trailing blanks.
fn decode_ascii_field(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// One acquisition: pixel axis, wavelength axis and raw counts, computed
/// fresh each call.
#[derive(Clone, Debug)]
pub struct Spectrum {
    pub pixels: Vec<f64>,
    pub wavelengths: Vec<f64>,
    pub counts: Vec<u16>,
}

// =============================================================================
// Session (owned driver state)
// =============================================================================

type RawHandle = i32;

/// Owned handle onto the specu1b driver.
///
/// Historically the DLL object and its reusable parameter/info structs were
/// module-level singletons; here each adapter owns its session so two
/// devices never share hidden state.
pub struct TokuspecSession {
    #[cfg(not(feature = "tokuspec_hardware"))]
    mock: MockSpectroDevice,
}

impl TokuspecSession {
    pub fn new() -> Self {
        Self {
            #[cfg(not(feature = "tokuspec_hardware"))]
            mock: MockSpectroDevice::new(),
        }
    }

    fn open_device(&mut self, family: DeviceFamily, selector: &str) -> PluginResult<RawHandle> {
        #[cfg(feature = "tokuspec_hardware")]
        {
            let handle = unsafe { specu1b_sys::USB_OpenDevice(family.product_id() as i32) };
            if handle < 0 {
                return Err(PluginError::DeviceNotFound {
                    selector: selector.to_string(),
                    vendor_id: HAMAMATSU_VENDOR_ID,
                    product_id: family.product_id(),
                });
            }
            Ok(handle)
        }
        #[cfg(not(feature = "tokuspec_hardware"))]
        {
            let _ = (family, selector);
            self.mock.open = true;
            Ok(1)
        }
    }

    fn check_device(&mut self, handle: RawHandle) -> PluginResult<()> {
        #[cfg(feature = "tokuspec_hardware")]
        {
            let status = unsafe { specu1b_sys::USB_CheckDevice(handle) };
            if status != 0 {
                return Err(PluginError::Sdk {
                    call: "USB_CheckDevice",
                    status,
                });
            }
            Ok(())
        }
        #[cfg(not(feature = "tokuspec_hardware"))]
        {
            let _ = handle;
            Ok(())
        }
    }

    fn open_pipe(&mut self, handle: RawHandle) -> PluginResult<RawHandle> {
        #[cfg(feature = "tokuspec_hardware")]
        {
            let pipe = unsafe { specu1b_sys::USB_OpenPipe(handle) };
            if pipe < 0 {
                return Err(PluginError::Sdk {
                    call: "USB_OpenPipe",
                    status: pipe,
                });
            }
            Ok(pipe)
        }
        #[cfg(not(feature = "tokuspec_hardware"))]
        {
            let _ = handle;
            self.mock.pipe_open = true;
            Ok(1)
        }
    }

    fn get_parameter(&mut self, handle: RawHandle) -> PluginResult<UnitParameter> {
        #[cfg(feature = "tokuspec_hardware")]
        {
            let mut raw = specu1b_sys::UNIT_PARAMETER::default();
            let status = unsafe { specu1b_sys::USB_GetParameter(handle, &mut raw) };
            if status != 0 {
                return Err(PluginError::Sdk {
                    call: "USB_GetParameter",
                    status,
                });
            }
            Ok(UnitParameter {
                integration_time_us: raw.unIntegrationTime,
                gain: raw.byGain,
                trigger_edge: raw.byTriggerEdge,
                trigger_mode: raw.byTriggerMode,
                reserved: raw.byReserved,
            })
        }
        #[cfg(not(feature = "tokuspec_hardware"))]
        {
            let _ = handle;
            if !self.mock.open {
                return Err(PluginError::Sdk {
                    call: "USB_GetParameter",
                    status: -1,
                });
            }
            Ok(self.mock.param)
        }
    }

    fn set_parameter(&mut self, handle: RawHandle, param: &UnitParameter) -> PluginResult<()> {
        #[cfg(feature = "tokuspec_hardware")]
        {
            let mut raw = specu1b_sys::UNIT_PARAMETER {
                unIntegrationTime: param.integration_time_us,
                byGain: param.gain,
                byTriggerEdge: param.trigger_edge,
                byTriggerMode: param.trigger_mode,
                byReserved: param.reserved,
            };
            let status = unsafe { specu1b_sys::USB_SetParameter(handle, &mut raw) };
            if status != 0 {
                return Err(PluginError::Sdk {
                    call: "USB_SetParameter",
                    status,
                });
            }
            Ok(())
        }
        #[cfg(not(feature = "tokuspec_hardware"))]
        {
            let _ = handle;
            self.mock.param = *param;
            Ok(())
        }
    }

    fn set_eeprom_defaults(&mut self, handle: RawHandle) -> PluginResult<()> {
        #[cfg(feature = "tokuspec_hardware")]
        {
            let status = unsafe { specu1b_sys::USB_SetEepromDefaultParameter(handle, 0) };
            if status != 0 {
                return Err(PluginError::Sdk {
                    call: "USB_SetEepromDefaultParameter",
                    status,
                });
            }
            Ok(())
        }
        #[cfg(not(feature = "tokuspec_hardware"))]
        {
            let _ = handle;
            self.mock.param = MockSpectroDevice::default_param();
            Ok(())
        }
    }

    fn read_unit_information(&mut self, handle: RawHandle) -> PluginResult<UnitInformation> {
        #[cfg(feature = "tokuspec_hardware")]
        {
            let mut raw = specu1b_sys::UNIT_INFORMATION::default();
            let status = unsafe { specu1b_sys::USB_ReadUnitInformation(handle, &mut raw) };
            if status != 0 {
                return Err(PluginError::Sdk {
                    call: "USB_ReadUnitInformation",
                    status,
                });
            }
            Ok(UnitInformation {
                unit_id: decode_ascii_field(&raw.arybyUnitID),
                sensor_name: decode_ascii_field(&raw.arybySensorName),
                serial_number: decode_ascii_field(&raw.arybySerialNumber),
                reserved: raw.arybyReserved.to_vec(),
                wavelength_lower_nm: raw.usWaveLengthLower,
                wavelength_upper_nm: raw.usWaveLengthUpper,
            })
        }
        #[cfg(not(feature = "tokuspec_hardware"))]
        {
            let _ = handle;
            Ok(self.mock.info.clone())
        }
    }

    fn write_unit_information(
        &mut self,
        handle: RawHandle,
        info: &UnitInformation,
        flag: u8,
    ) -> PluginResult<()> {
        if flag != WRITE_ENABLE_FLAG {
            return Err(PluginError::WriteProtected(flag));
        }
        #[cfg(feature = "tokuspec_hardware")]
        {
            let mut raw = specu1b_sys::UNIT_INFORMATION::default();
            copy_ascii_field(&mut raw.arybyUnitID, &info.unit_id);
            copy_ascii_field(&mut raw.arybySensorName, &info.sensor_name);
            copy_ascii_field(&mut raw.arybySerialNumber, &info.serial_number);
            raw.usWaveLengthLower = info.wavelength_lower_nm;
            raw.usWaveLengthUpper = info.wavelength_upper_nm;
            let status =
                unsafe { specu1b_sys::USB_WriteUnitInformation(handle, &mut raw, flag as i32) };
            if status != 0 {
                return Err(PluginError::Sdk {
                    call: "USB_WriteUnitInformation",
                    status,
                });
            }
            Ok(())
        }
        #[cfg(not(feature = "tokuspec_hardware"))]
        {
            let _ = handle;
            self.mock.info = info.clone();
            Ok(())
        }
    }

    fn read_calibration(&mut self, handle: RawHandle) -> PluginResult<[f64; 6]> {
        #[cfg(feature = "tokuspec_hardware")]
        {
            let mut coefficients = [0.0f64; 6];
            let status = unsafe {
                specu1b_sys::USB_ReadCalibrationValue(handle, coefficients.as_mut_ptr())
            };
            if status != 0 {
                return Err(PluginError::Sdk {
                    call: "USB_ReadCalibrationValue",
                    status,
                });
            }
            Ok(coefficients)
        }
        #[cfg(not(feature = "tokuspec_hardware"))]
        {
            let _ = handle;
            Ok(self.mock.calibration)
        }
    }

    fn write_calibration(
        &mut self,
        handle: RawHandle,
        coefficients: &[f64; 6],
        flag: u8,
    ) -> PluginResult<()> {
        if flag != WRITE_ENABLE_FLAG {
            return Err(PluginError::WriteProtected(flag));
        }
        #[cfg(feature = "tokuspec_hardware")]
        {
            let mut values = *coefficients;
            let status = unsafe {
                specu1b_sys::USB_WriteCalibrationValue(handle, values.as_mut_ptr(), flag as i32)
            };
            if status != 0 {
                return Err(PluginError::Sdk {
                    call: "USB_WriteCalibrationValue",
                    status,
                });
            }
            Ok(())
        }
        #[cfg(not(feature = "tokuspec_hardware"))]
        {
            let _ = handle;
            self.mock.calibration = *coefficients;
            Ok(())
        }
    }

    /// Blocking read of one sensor buffer into `buffer`.
    fn get_sensor_data(
        &mut self,
        handle: RawHandle,
        pipe: RawHandle,
        buffer: &mut [u16],
    ) -> PluginResult<()> {
        #[cfg(feature = "tokuspec_hardware")]
        {
            let status = unsafe {
                specu1b_sys::USB_GetSensorData(
                    handle,
                    pipe,
                    buffer.len() as i32,
                    buffer.as_mut_ptr(),
                )
            };
            if status != 0 {
                return Err(PluginError::Sdk {
                    call: "USB_GetSensorData",
                    status,
                });
            }
            Ok(())
        }
        #[cfg(not(feature = "tokuspec_hardware"))]
        {
            let _ = (handle, pipe);
            if !self.mock.pipe_open {
                return Err(PluginError::Sdk {
                    call: "USB_GetSensorData",
                    status: -1,
                });
            }
            self.mock.fill_sensor_data(buffer);
            Ok(())
        }
    }

    fn close_pipe(&mut self, handle: RawHandle) -> PluginResult<()> {
        #[cfg(feature = "tokuspec_hardware")]
        {
            let status = unsafe { specu1b_sys::USB_ClosePipe(handle) };
            if status != 0 {
                return Err(PluginError::Sdk {
                    call: "USB_ClosePipe",
                    status,
                });
            }
            Ok(())
        }
        #[cfg(not(feature = "tokuspec_hardware"))]
        {
            let _ = handle;
            self.mock.pipe_open = false;
            Ok(())
        }
    }

    fn close_device(&mut self, handle: RawHandle) -> PluginResult<()> {
        #[cfg(feature = "tokuspec_hardware")]
        {
            let status = unsafe { specu1b_sys::USB_CloseDevice(handle) };
            if status != 0 {
                return Err(PluginError::Sdk {
                    call: "USB_CloseDevice",
                    status,
                });
            }
            Ok(())
        }
        #[cfg(not(feature = "tokuspec_hardware"))]
        {
            let _ = handle;
            self.mock.open = false;
            Ok(())
        }
    }
}

impl Default for TokuspecSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "tokuspec_hardware")]
fn copy_ascii_field(dst: &mut [u8], src: &str) {
    for (d, s) in dst.iter_mut().zip(src.bytes()) {
        *d = s;
    }
}

// =============================================================================
// Mock device
// =============================================================================

/// Simulated spectrometer used when the driver SDK is not linked in.
///
/// Produces a Gaussian emission line on a thermal baseline; the amplitude
/// scales with integration time so exposure changes are visible downstream.
#[cfg(not(feature = "tokuspec_hardware"))]
struct MockSpectroDevice {
    open: bool,
    pipe_open: bool,
    param: UnitParameter,
    info: UnitInformation,
    calibration: [f64; 6],
    rng: StdRng,
}

#[cfg(not(feature = "tokuspec_hardware"))]
impl MockSpectroDevice {
    fn new() -> Self {
        Self {
            open: false,
            pipe_open: false,
            param: Self::default_param(),
            info: UnitInformation {
                unit_id: "C10084CA".to_string(),
                sensor_name: "S10420-1106".to_string(),
                serial_number: "SIM00001".to_string(),
                reserved: vec![0; 8],
                wavelength_lower_nm: 200,
                wavelength_upper_nm: 1100,
            },
            calibration: FACTORY_COEFFICIENTS,
            rng: StdRng::seed_from_u64(0x5BEC),
        }
    }

    fn default_param() -> UnitParameter {
        UnitParameter {
            integration_time_us: 10_000,
            // Gain switching and external trigger edge unavailable on this
            // simulated model; internal trigger supported.
            gain: UNAVAILABLE,
            trigger_edge: UNAVAILABLE,
            trigger_mode: 0x00,
            reserved: 0,
        }
    }

    fn fill_sensor_data(&mut self, buffer: &mut [u16]) {
        let len = buffer.len().max(1) as f64;
        let center = len / 2.0;
        let sigma = len / 40.0;
        // Counts scale with integration time, clipped to the 16-bit range.
        let amplitude =
            (self.param.integration_time_us as f64 / 10_000.0 * 20_000.0).min(60_000.0);
        for (i, sample) in buffer.iter_mut().enumerate() {
            let x = i as f64 - center;
            let peak = amplitude * (-x * x / (2.0 * sigma * sigma)).exp();
            let baseline = 400.0;
            let noise: f64 = self.rng.gen_range(-20.0..20.0);
            *sample = (baseline + peak + noise).clamp(0.0, u16::MAX as f64) as u16;
        }
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// Hamamatsu mini-spectrometer adapter.
pub struct MiniSpectro {
    session: TokuspecSession,
    family: DeviceFamily,
    handle: Option<RawHandle>,
    pipe: Option<RawHandle>,
    info: UnitInformation,
    /// Calibration read at open; `None` when the driver version does not
    /// expose the coefficients (linear axis fallback applies).
    calibration: Option<WavelengthCalibration>,
    sensor_size: usize,
    /// Reusable frame buffer, overwritten in place on each acquisition.
    buffer: Vec<u16>,
}

impl MiniSpectro {
    /// Open the first device of the selected family and read its identity,
    /// parameters and calibration.
    pub fn open(selector: &str) -> PluginResult<Self> {
        let family = DeviceFamily::from_selector(selector)
            .ok_or_else(|| PluginError::UnknownSelector(selector.to_string()))?;

        let mut session = TokuspecSession::new();
        let handle = session.open_device(family, selector)?;
        session.check_device(handle)?;
        let pipe = session.open_pipe(handle)?;

        let info = session.read_unit_information(handle)?;
        let sensor_size = sensor_size_from_unit_id(&info.unit_id);
        // Older driver versions fail here; fall back to the linear axis.
        let calibration = match session.read_calibration(handle) {
            Ok(coefficients) => Some(WavelengthCalibration::new(coefficients)),
            Err(err) => {
                debug!("Calibration readout unsupported ({err}); using linear wavelength axis");
                None
            }
        };

        info!(
            "Opened {} (sensor {}, serial {}, {} elements)",
            info.unit_id.trim(),
            info.sensor_name.trim(),
            info.serial_number.trim(),
            sensor_size
        );

        Ok(Self {
            session,
            family,
            handle: Some(handle),
            pipe: Some(pipe),
            info,
            calibration,
            sensor_size,
            buffer: vec![0; sensor_size],
        })
    }

    /// Device family this adapter was opened for.
    pub fn family(&self) -> DeviceFamily {
        self.family
    }

    /// Identity block read at open.
    pub fn unit_information(&self) -> &UnitInformation {
        &self.info
    }

    /// Number of sensor elements.
    pub fn sensor_size(&self) -> usize {
        self.sensor_size
    }

    /// Calibration read at open, if the driver exposes it.
    pub fn calibration(&self) -> Option<&WavelengthCalibration> {
        self.calibration.as_ref()
    }

    fn require_handle(&self) -> PluginResult<RawHandle> {
        self.handle
            .ok_or_else(|| PluginError::NotConnected(self.info.unit_id.trim().to_string()))
    }

    fn require_pipe(&self) -> PluginResult<RawHandle> {
        self.pipe
            .ok_or_else(|| PluginError::NotConnected(self.info.unit_id.trim().to_string()))
    }

    /// Read the current parameter block.
    pub fn get_parameters(&mut self) -> PluginResult<UnitParameter> {
        let handle = self.require_handle()?;
        self.session.get_parameter(handle)
    }

    /// Apply a sparse parameter update as one read-modify-write and return
    /// the block as written.
    pub fn patch_parameters(&mut self, patch: ParameterPatch) -> PluginResult<UnitParameter> {
        let handle = self.require_handle()?;
        let mut param = self.session.get_parameter(handle)?;
        patch.apply_to(&mut param);
        self.session.set_parameter(handle, &param)?;
        debug!(
            "Patched parameters: integration {} us, gain {}, edge {}, mode {}",
            param.integration_time_us,
            param.gain().as_str(),
            param.trigger_edge().as_str(),
            param.trigger_mode().as_str()
        );
        Ok(param)
    }

    /// Restore the EEPROM default parameters.
    pub fn set_defaults(&mut self) -> PluginResult<()> {
        let handle = self.require_handle()?;
        self.session.set_eeprom_defaults(handle)
    }

    /// Re-read the unit information block from the device.
    pub fn read_unit_information(&mut self) -> PluginResult<UnitInformation> {
        let handle = self.require_handle()?;
        let info = self.session.read_unit_information(handle)?;
        self.info = info.clone();
        Ok(info)
    }

    /// Write the unit information block. `flag` must be 0xAA.
    pub fn write_unit_information(
        &mut self,
        info: &UnitInformation,
        flag: u8,
    ) -> PluginResult<()> {
        let handle = self.require_handle()?;
        self.session.write_unit_information(handle, info, flag)?;
        self.info = info.clone();
        Ok(())
    }

    /// Read the six calibration coefficients from the EEPROM.
    pub fn read_calibration(&mut self) -> PluginResult<[f64; 6]> {
        let handle = self.require_handle()?;
        let coefficients = self.session.read_calibration(handle)?;
        self.calibration = Some(WavelengthCalibration::new(coefficients));
        Ok(coefficients)
    }

    /// Write calibration coefficients to the EEPROM. `flag` must be 0xAA.
    pub fn write_calibration(&mut self, coefficients: &[f64; 6], flag: u8) -> PluginResult<()> {
        let handle = self.require_handle()?;
        self.session.write_calibration(handle, coefficients, flag)?;
        self.calibration = Some(WavelengthCalibration::new(*coefficients));
        Ok(())
    }

    /// Restore the factory calibration coefficients. `flag` must be 0xAA.
    pub fn write_factory_calibration(&mut self, flag: u8) -> PluginResult<()> {
        self.write_calibration(&FACTORY_COEFFICIENTS, flag)
    }

    /// Wavelength axis for the current sensor: polynomial when calibration
    /// is available, linear between the reported bounds otherwise.
    pub fn wavelength_axis(&self) -> Vec<f64> {
        match &self.calibration {
            Some(cal) => cal.axis(self.sensor_size),
            None => linear_wavelength_axis(
                self.info.wavelength_lower_nm,
                self.info.wavelength_upper_nm,
                self.sensor_size,
            ),
        }
    }

    /// Acquire one spectrum, blocking until the driver call returns.
    ///
    /// The internal buffer is overwritten in place; the returned arrays are
    /// computed fresh on every call.
    pub fn acquire(&mut self) -> PluginResult<Spectrum> {
        let handle = self.require_handle()?;
        let pipe = self.require_pipe()?;
        self.session
            .get_sensor_data(handle, pipe, &mut self.buffer)?;
        Ok(Spectrum {
            pixels: pixel_axis(self.sensor_size),
            wavelengths: self.wavelength_axis(),
            counts: self.buffer.clone(),
        })
    }

    /// Release the USB pipe and device handle. Safe to call repeatedly;
    /// only the first call touches the driver.
    pub fn close(&mut self) -> PluginResult<()> {
        if let Some(handle) = self.handle.take() {
            if self.pipe.take().is_some() {
                self.session.close_pipe(handle)?;
            }
            self.session.close_device(handle)?;
            info!("Closed {}", self.info.unit_id.trim());
        }
        Ok(())
    }
}

impl Drop for MiniSpectro {
    fn drop(&mut self) {
        // Best-effort release; errors are already surfaced by explicit close.
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_product_ids() {
        assert_eq!(DeviceFamily::from_selector("tm_ccd"), Some(DeviceFamily::TmCcd));
        assert_eq!(DeviceFamily::TmCcd.product_id(), 0x2909);
        assert_eq!(DeviceFamily::Proto.product_id(), 0x2900);
        assert_eq!(DeviceFamily::TgRaman2.product_id(), 0x290D);
        assert_eq!(DeviceFamily::from_selector("nonsense"), None);
    }

    #[test]
    fn test_sentinel_byte_maps_to_unavailable() {
        assert_eq!(Gain::from_raw(0xFF), Gain::Unavailable);
        assert_eq!(TriggerEdge::from_raw(0xFF), TriggerEdge::Unavailable);
        assert_eq!(TriggerMode::from_raw(0xFF), TriggerMode::Unavailable);
        assert_eq!(Gain::from_raw(0x01), Gain::High);
        assert_eq!(TriggerMode::from_raw(0x02), TriggerMode::ExternalGate);
    }

    #[test]
    fn test_patch_applies_all_supplied_fields() {
        let mut param = UnitParameter {
            integration_time_us: 10_000,
            gain: 0x00,
            trigger_edge: 0x00,
            trigger_mode: 0x00,
            reserved: 7,
        };
        let patch = ParameterPatch::default()
            .integration_time_us(50_000)
            .gain(Gain::High)
            .trigger_mode(TriggerMode::ExternalEdge);
        patch.apply_to(&mut param);

        assert_eq!(param.integration_time_us, 50_000);
        assert_eq!(param.gain(), Gain::High);
        // Unsupplied field untouched.
        assert_eq!(param.trigger_edge(), TriggerEdge::Rising);
        assert_eq!(param.trigger_mode(), TriggerMode::ExternalEdge);
        // Reserved byte carried through.
        assert_eq!(param.reserved, 7);
    }

    #[test]
    fn test_decode_ascii_field() {
        assert_eq!(decode_ascii_field(b"C10083CA\0\0\0"), "C10083CA");
        assert_eq!(decode_ascii_field(b"S10420  "), "S10420");
    }

    #[cfg(not(feature = "tokuspec_hardware"))]
    mod mock_device {
        use super::*;

        #[test]
        fn test_open_reads_identity_and_calibration() {
            let spectro = MiniSpectro::open("tm_ccd").expect("open mock device");
            assert_eq!(spectro.sensor_size(), 2048);
            assert_eq!(spectro.unit_information().unit_id, "C10084CA");
            assert!(spectro.calibration().is_some());
        }

        #[test]
        fn test_unknown_selector_rejected() {
            assert!(matches!(
                MiniSpectro::open("tm_cdd"),
                Err(PluginError::UnknownSelector(_))
            ));
        }

        #[test]
        fn test_acquire_shapes_and_axes() {
            let mut spectro = MiniSpectro::open("tm_ccd").expect("open mock device");
            let spectrum = spectro.acquire().expect("acquire");
            assert_eq!(spectrum.counts.len(), 2048);
            assert_eq!(spectrum.pixels.len(), 2048);
            assert_eq!(spectrum.wavelengths.len(), 2048);
            assert!((spectrum.wavelengths[0] - 206.69).abs() < 0.01);
        }

        #[test]
        fn test_patch_round_trips_through_device() {
            let mut spectro = MiniSpectro::open("tm_ccd").expect("open mock device");
            let patch = ParameterPatch::default()
                .integration_time_us(250_000)
                .trigger_mode(TriggerMode::ExternalGate);
            spectro.patch_parameters(patch).expect("patch");

            let param = spectro.get_parameters().expect("get parameters");
            assert_eq!(param.integration_time_us, 250_000);
            assert_eq!(param.trigger_mode(), TriggerMode::ExternalGate);
            // Field this device reports unsupported is untouched.
            assert_eq!(param.gain(), Gain::Unavailable);
        }

        #[test]
        fn test_eeprom_writes_require_flag() {
            let mut spectro = MiniSpectro::open("tm_ccd").expect("open mock device");
            assert!(matches!(
                spectro.write_factory_calibration(0x00),
                Err(PluginError::WriteProtected(0x00))
            ));
            spectro
                .write_factory_calibration(WRITE_ENABLE_FLAG)
                .expect("write with flag");
        }

        #[test]
        fn test_set_defaults_restores_parameters() {
            let mut spectro = MiniSpectro::open("tm_ccd").expect("open mock device");
            spectro
                .patch_parameters(ParameterPatch::default().integration_time_us(1_000_000))
                .expect("patch");
            spectro.set_defaults().expect("set defaults");
            let param = spectro.get_parameters().expect("get parameters");
            assert_eq!(param.integration_time_us, 10_000);
        }

        #[test]
        fn test_close_twice_is_safe() {
            let mut spectro = MiniSpectro::open("tm_ccd").expect("open mock device");
            spectro.close().expect("first close");
            spectro.close().expect("second close");
            // Operations after close surface NotConnected.
            assert!(matches!(
                spectro.acquire(),
                Err(PluginError::NotConnected(_))
            ));
        }
    }
}
