//! Wavelength calibration and sensor geometry.
//!
//! Each spectrometer stores six calibration coefficients (A, B1..B5) in its
//! EEPROM, defining wavelength as a degree-5 polynomial of pixel index:
//!
//! ```text
//! wl(p) = A + B1*p + B2*p^2 + B3*p^3 + B4*p^4 + B5*p^5   [nm]
//! ```
//!
//! Older driver versions do not expose the coefficients; for those the
//! wavelength axis is interpolated linearly between the lower/upper bounds
//! reported in the unit information block.

use log::warn;

/// Factory-default calibration coefficients (TokuSpec values at first boot).
pub const FACTORY_COEFFICIENTS: [f64; 6] = [
    206.6901787,
    0.3771377233,
    3.669128424e-5,
    -1.287399061e-8,
    5.788371505e-12,
    -1.2738255e-15,
];

/// Position of the sensor-family digit inside the unit ID.
///
/// The model-number digit at this byte distinguishes the 256/512/1024/2048
/// element families.
pub const SENSOR_CODE_INDEX: usize = 5;

/// Fallback element count when the unit ID carries an unknown code; matches
/// the largest supported sensor (and the driver's fixed transfer buffer).
pub const DEFAULT_SENSOR_SIZE: usize = 2048;

/// Degree-5 pixel-to-wavelength calibration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WavelengthCalibration {
    coefficients: [f64; 6],
}

impl Default for WavelengthCalibration {
    fn default() -> Self {
        Self {
            coefficients: FACTORY_COEFFICIENTS,
        }
    }
}

impl WavelengthCalibration {
    pub fn new(coefficients: [f64; 6]) -> Self {
        Self { coefficients }
    }

    pub fn coefficients(&self) -> &[f64; 6] {
        &self.coefficients
    }

    /// Wavelength in nanometers at the given pixel index.
    pub fn wavelength_at(&self, pixel: usize) -> f64 {
        let p = pixel as f64;
        // Horner evaluation, highest order first.
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, &c| acc * p + c)
    }

    /// Full wavelength axis over `len` pixels.
    pub fn axis(&self, len: usize) -> Vec<f64> {
        (0..len).map(|p| self.wavelength_at(p)).collect()
    }
}

/// Wavelength axis interpolated linearly between the reported spectral
/// response bounds, for driver versions without calibration readout.
pub fn linear_wavelength_axis(lower_nm: u16, upper_nm: u16, len: usize) -> Vec<f64> {
    let lower = lower_nm as f64;
    let upper = upper_nm as f64;
    if len < 2 {
        return vec![lower; len];
    }
    let step = (upper - lower) / (len - 1) as f64;
    (0..len).map(|p| lower + step * p as f64).collect()
}

/// Pixel-index axis (0..len-1) as floats, for display.
pub fn pixel_axis(len: usize) -> Vec<f64> {
    (0..len).map(|p| p as f64).collect()
}

/// Derive the sensor element count from the unit ID.
///
/// The digit at [`SENSOR_CODE_INDEX`] selects the family: '1' -> 256,
/// '2' -> 512, '3' -> 1024, '4' -> 2048.
pub fn sensor_size_from_unit_id(unit_id: &str) -> usize {
    match unit_id.as_bytes().get(SENSOR_CODE_INDEX) {
        Some(b'1') => 256,
        Some(b'2') => 512,
        Some(b'3') => 1024,
        Some(b'4') => 2048,
        other => {
            warn!(
                "Unit ID '{}' carries unknown sensor code {:?}; assuming {} elements",
                unit_id.trim_end(),
                other.map(|b| *b as char),
                DEFAULT_SENSOR_SIZE
            );
            DEFAULT_SENSOR_SIZE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_polynomial_at_pixel_zero() {
        let cal = WavelengthCalibration::default();
        assert!((cal.wavelength_at(0) - 206.69).abs() < 0.01);
    }

    #[test]
    fn test_factory_polynomial_monotonic_over_sensor() {
        let cal = WavelengthCalibration::default();
        let axis = cal.axis(2048);
        for pair in axis.windows(2) {
            assert!(
                pair[1] > pair[0],
                "wavelength axis must increase: {} !> {}",
                pair[1],
                pair[0]
            );
        }
    }

    #[test]
    fn test_sensor_size_codes() {
        assert_eq!(sensor_size_from_unit_id("C10081CA"), 256);
        assert_eq!(sensor_size_from_unit_id("C10082CA"), 512);
        assert_eq!(sensor_size_from_unit_id("C10083CA"), 1024);
        assert_eq!(sensor_size_from_unit_id("C10084CA"), 2048);
    }

    #[test]
    fn test_sensor_size_unknown_code_falls_back() {
        assert_eq!(sensor_size_from_unit_id("C9914GB"), DEFAULT_SENSOR_SIZE);
        assert_eq!(sensor_size_from_unit_id(""), DEFAULT_SENSOR_SIZE);
    }

    #[test]
    fn test_linear_axis_endpoints() {
        let axis = linear_wavelength_axis(200, 800, 512);
        assert_eq!(axis.len(), 512);
        assert!((axis[0] - 200.0).abs() < f64::EPSILON);
        assert!((axis[511] - 800.0).abs() < 1e-9);
    }

    #[test]
    fn test_pixel_axis() {
        let axis = pixel_axis(4);
        assert_eq!(axis, vec![0.0, 1.0, 2.0, 3.0]);
    }
}
