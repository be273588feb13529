//! Custom error types for the plugin crate.
//!
//! `PluginError` consolidates the failure modes of the vendor-SDK boundary:
//!
//! - **`DeviceNotFound`**: no device matching the selected product ID was
//!   enumerated on the bus.
//! - **`Sdk`**: a vendor-SDK call returned a non-success status. Every SDK
//!   return code is checked uniformly; there is no retry or translation,
//!   the status surfaces as-is for the host framework to log.
//! - **`NotConnected`**: an operation was attempted on an adapter whose
//!   device handle has already been released.
//! - **`WriteProtected`**: an EEPROM write was attempted without the
//!   0xAA write-enable flag.
//!
//! Unsupported device features (the 0xFF sentinel on gain/trigger fields)
//! are deliberately NOT an error: they disable the corresponding control
//! instead of raising.

use thiserror::Error;

/// Convenience alias for results using the plugin error type.
pub type PluginResult<T> = std::result::Result<T, PluginError>;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("No device found for '{selector}' (vendor 0x{vendor_id:04X}, product 0x{product_id:04X})")]
    DeviceNotFound {
        selector: String,
        vendor_id: u16,
        product_id: u16,
    },

    #[error("Unknown device selector '{0}'")]
    UnknownSelector(String),

    #[error("SDK call {call} failed with status {status}")]
    Sdk { call: &'static str, status: i32 },

    #[error("Device '{0}' is not connected")]
    NotConnected(String),

    #[error("EEPROM write rejected: flag 0x{0:02X} is not the write-enable value 0xAA")]
    WriteProtected(u8),

    #[error("No camera at index {0}")]
    CameraNotFound(usize),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PluginError::Sdk {
            call: "USB_OpenPipe",
            status: -1,
        };
        assert_eq!(err.to_string(), "SDK call USB_OpenPipe failed with status -1");
    }

    #[test]
    fn test_device_not_found_display() {
        let err = PluginError::DeviceNotFound {
            selector: "tm_ccd".to_string(),
            vendor_id: 0x0661,
            product_id: 0x2909,
        };
        assert!(err.to_string().contains("0x0661"));
        assert!(err.to_string().contains("0x2909"));
    }
}
