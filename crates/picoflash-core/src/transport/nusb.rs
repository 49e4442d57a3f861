//! nusb-based USB transport implementation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nusb::descriptors::TransferType;
use nusb::transfer::{
    Buffer, Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient, TransferError,
};
use nusb::{Device, DeviceInfo, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, trace};

use super::traits::{Direction, TransportError, UsbTransport};
use crate::protocol::constants::{PICOBOOT_INTERFACE_CLASS, RPI_VENDOR_ID, SUPPORTED_PIDS};

/// Default per-transfer timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// nusb-based USB transport bound to the PICOBOOT interface.
pub struct NusbTransport {
    interface: Interface,
    interface_number: u8,
    in_endpoint: u8,
    out_endpoint: u8,
    vid: u16,
    pid: u16,
    timeout: Duration,
    connected: AtomicBool,
}

/// Interface and endpoints of the PICOBOOT function within one configuration.
struct PicobootInterface {
    configuration: u8,
    interface_number: u8,
    in_endpoint: u8,
    out_endpoint: u8,
}

impl NusbTransport {
    /// Open the first device in BOOTSEL mode.
    #[instrument(level = "info")]
    pub fn open() -> Result<Self, TransportError> {
        Self::open_with_timeout(DEFAULT_TIMEOUT_MS)
    }

    /// Open the first device in BOOTSEL mode using a custom transfer timeout.
    pub fn open_with_timeout(timeout_ms: u64) -> Result<Self, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        for device_info in devices {
            if device_info.vendor_id() == RPI_VENDOR_ID
                && SUPPORTED_PIDS.contains(&device_info.product_id())
            {
                return Self::open_device_info(device_info, timeout_ms);
            }
        }

        Err(TransportError::DeviceNotFound { vid: RPI_VENDOR_ID })
    }

    fn open_device_info(device_info: DeviceInfo, timeout_ms: u64) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let found = find_picoboot_interface(&device)
            .ok_or(TransportError::DeviceNotFound { vid })?;

        let active = device
            .active_configuration()
            .map(|c| c.configuration_value())
            .ok();
        if active != Some(found.configuration) {
            debug!(
                configuration = found.configuration,
                "Selecting configuration"
            );
            device
                .set_configuration(found.configuration)
                .wait()
                .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        }

        let interface = device
            .claim_interface(found.interface_number)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: found.interface_number,
                message: e.to_string(),
            })?;

        info!(
            interface = found.interface_number,
            in_ep = %format!("0x{:02X}", found.in_endpoint),
            out_ep = %format!("0x{:02X}", found.out_endpoint),
            "Device opened successfully"
        );

        Ok(Self {
            interface,
            interface_number: found.interface_number,
            in_endpoint: found.in_endpoint,
            out_endpoint: found.out_endpoint,
            vid,
            pid,
            timeout: Duration::from_millis(timeout_ms),
            connected: AtomicBool::new(true),
        })
    }

    fn map_transfer_error(&self, err: TransferError, direction: Direction) -> TransportError {
        match err {
            TransferError::Stall => TransportError::Stall { direction },
            TransferError::Disconnected => {
                self.connected.store(false, Ordering::SeqCst);
                TransportError::Disconnected
            }
            TransferError::Cancelled => TransportError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            },
            other => match direction {
                Direction::In => TransportError::ReadFailed(other.to_string()),
                Direction::Out => TransportError::WriteFailed(other.to_string()),
            },
        }
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }
}

/// Locate the vendor-class interface that carries exactly two bulk endpoints.
///
/// Subclass and protocol are ignored; bootrom revisions do not agree on them.
fn find_picoboot_interface(device: &Device) -> Option<PicobootInterface> {
    for config in device.configurations() {
        for alt in config.interface_alt_settings() {
            if alt.class() != PICOBOOT_INTERFACE_CLASS {
                continue;
            }

            let bulk: Vec<_> = alt
                .endpoints()
                .filter(|ep| ep.transfer_type() == TransferType::Bulk)
                .collect();
            if bulk.len() != 2 {
                continue;
            }

            let in_ep = bulk
                .iter()
                .find(|ep| ep.direction() == nusb::transfer::Direction::In);
            let out_ep = bulk
                .iter()
                .find(|ep| ep.direction() == nusb::transfer::Direction::Out);

            if let (Some(in_ep), Some(out_ep)) = (in_ep, out_ep) {
                return Some(PicobootInterface {
                    configuration: config.configuration_value(),
                    interface_number: alt.interface_number(),
                    in_endpoint: in_ep.address(),
                    out_endpoint: out_ep.address(),
                });
            }
        }
    }
    None
}

impl UsbTransport for NusbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn bulk_out(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.ensure_connected()?;
        let mut ep = self
            .interface
            .endpoint::<Bulk, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut buf = Buffer::new(data.len());
        buf.extend_from_slice(data);

        ep.transfer_blocking(buf, self.timeout)
            .into_result()
            .map_err(|e| self.map_transfer_error(e, Direction::Out))?;

        trace!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self))]
    fn bulk_in(&self, len: usize) -> Result<Vec<u8>, TransportError> {
        self.ensure_connected()?;
        let mut ep = self
            .interface
            .endpoint::<Bulk, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        // Request length must be a non-zero multiple of max packet size
        let max_packet_size = ep.max_packet_size();
        let request_len = len.max(1).div_ceil(max_packet_size) * max_packet_size;
        let mut buf = Buffer::new(request_len);
        buf.set_requested_len(request_len);

        let data = ep
            .transfer_blocking(buf, self.timeout)
            .into_result()
            .map_err(|e| self.map_transfer_error(e, Direction::In))?;

        let n = data.len().min(len);
        trace!(bytes_read = n, "Read complete");
        Ok(data[..n].to_vec())
    }

    fn control_out(&self, request: u8) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Interface,
                    request,
                    value: 0,
                    index: self.interface_number as u16,
                    data: &[],
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| match e {
                TransferError::Disconnected => {
                    self.connected.store(false, Ordering::SeqCst);
                    TransportError::Disconnected
                }
                other => TransportError::ControlFailed {
                    request,
                    message: other.to_string(),
                },
            })
    }

    fn control_in(&self, request: u8, len: usize) -> Result<Vec<u8>, TransportError> {
        self.ensure_connected()?;
        self.interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Interface,
                    request,
                    value: 0,
                    index: self.interface_number as u16,
                    length: len as u16,
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| match e {
                TransferError::Disconnected => {
                    self.connected.store(false, Ordering::SeqCst);
                    TransportError::Disconnected
                }
                other => TransportError::ControlFailed {
                    request,
                    message: other.to_string(),
                },
            })
    }

    fn clear_halt(&self, direction: Direction) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let result = match direction {
            Direction::In => self
                .interface
                .endpoint::<Bulk, In>(self.in_endpoint)
                .and_then(|mut ep| ep.clear_halt().wait()),
            Direction::Out => self
                .interface
                .endpoint::<Bulk, Out>(self.out_endpoint)
                .and_then(|mut ep| ep.clear_halt().wait()),
        };
        debug!(%direction, ok = result.is_ok(), "Clear halt");
        result.map_err(|e| TransportError::ControlFailed {
            request: 0x01, // CLEAR_FEATURE
            message: e.to_string(),
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
