//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for USB communication,
//! allowing different implementations (nusb, mock, etc.).

use std::fmt;
use thiserror::Error;

/// Bulk endpoint direction, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device -> Host
    In,
    /// Host -> Device
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "IN"),
            Direction::Out => write!(f, "OUT"),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} (no PICOBOOT interface)")]
    DeviceNotFound { vid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Transfer stalled on {direction} endpoint")]
    Stall { direction: Direction },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Control request 0x{request:02X} failed: {message}")]
    ControlFailed { request: u8, message: String },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl TransportError {
    pub fn is_stall(&self) -> bool {
        matches!(self, TransportError::Stall { .. })
    }

    /// Platform-specific advice for a failed interface claim.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            TransportError::ClaimInterfaceFailed { .. } => Some(if cfg!(windows) {
                "Install the WinUSB driver for the RP2 Boot interface (e.g. with Zadig)"
            } else if cfg!(target_os = "linux") {
                "Add a udev rule granting access to 2e8a:0003/000f, or run as root"
            } else {
                "Close any other program that is using the device"
            }),
            _ => None,
        }
    }
}

/// Abstract USB transport interface.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait UsbTransport: Send + Sync {
    /// Write raw bytes to the bulk OUT endpoint. An empty slice sends a
    /// zero-length packet.
    fn bulk_out(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `len` bytes from the bulk IN endpoint.
    fn bulk_in(&self, len: usize) -> Result<Vec<u8>, TransportError>;

    /// Vendor OUT request with no data stage, addressed to the interface.
    fn control_out(&self, request: u8) -> Result<(), TransportError>;

    /// Vendor IN request, addressed to the interface.
    fn control_in(&self, request: u8, len: usize) -> Result<Vec<u8>, TransportError>;

    /// Clear a halt condition on one of the bulk endpoints.
    fn clear_halt(&self, direction: Direction) -> Result<(), TransportError>;

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}
