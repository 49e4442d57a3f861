//! PICOBOOT command channel.
//!
//! Runs the three-phase exchange for every device verb:
//!
//! 1. a 32-byte command frame, host to device;
//! 2. an optional data phase in the command's direction;
//! 3. a zero-length acknowledgment in the opposite direction. Commands
//!    without data acknowledge as host-to-device, i.e. the ack is read.
//!
//! A stalled endpoint is recovered by clearing both halts and resetting the
//! interface, then the frame is resent with a fresh token. Timeouts and
//! disconnects are never retried.

use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use crate::protocol::constants::*;
use crate::protocol::{Command, CommandFrame, CommandStatus, ExclusiveMode, FrameError};
use crate::transport::{Direction, TransportError, UsbTransport};

/// Attempts per exchange, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("{command} exchange failed after {attempts} attempts: {last}")]
    ExchangeFailed {
        command: &'static str,
        attempts: u32,
        #[source]
        last: TransportError,
    },

    #[error("Device disconnected")]
    Disconnected,

    #[error("{command}: {source}")]
    Transport {
        command: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("Write of {len} bytes exceeds the {PAGE_SIZE}-byte page")]
    PayloadTooLarge { len: usize },

    #[error("Short read at 0x{addr:08X}: expected {expected}, got {actual}")]
    ShortRead {
        addr: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid status response: {0}")]
    Status(#[from] FrameError),
}

impl ChannelError {
    /// True when the device is gone and the channel can no longer be used.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ChannelError::Disconnected)
    }
}

/// Protocol client for one connection.
///
/// Owns the transport for the lifetime of the connection; each exchange
/// borrows it exclusively through `&mut self`, so exchanges cannot overlap.
pub struct PicobootClient<T: UsbTransport> {
    transport: T,
    next_token: u32,
    max_attempts: u32,
    disconnected: bool,
}

impl<T: UsbTransport> PicobootClient<T> {
    pub fn new(transport: T) -> Self {
        Self::with_max_attempts(transport, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(transport: T, max_attempts: u32) -> Self {
        Self {
            transport,
            next_token: 1,
            max_attempts: max_attempts.max(1),
            disconnected: false,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        !self.disconnected && self.transport.is_connected()
    }

    /// Read the status of the last command.
    pub fn command_status(&mut self) -> Result<CommandStatus, ChannelError> {
        self.check_connected()?;
        let raw = self
            .transport
            .control_in(PICOBOOT_IF_CMD_STATUS, CMD_STATUS_SIZE)
            .map_err(|e| self.transport_error("IF_CMD_STATUS", e))?;
        Ok(CommandStatus::from_bytes(&raw)?)
    }

    pub fn exclusive_access(&mut self, mode: ExclusiveMode) -> Result<(), ChannelError> {
        debug!(?mode, "Exclusive access");
        self.exchange(Command::exclusive_access(mode), &[])
            .map(|_| ())
    }

    pub fn exit_xip(&mut self) -> Result<(), ChannelError> {
        self.exchange(Command::exit_xip(), &[]).map(|_| ())
    }

    #[instrument(skip(self), fields(addr = %format!("0x{:08X}", addr)))]
    pub fn flash_erase(&mut self, addr: u32, size: u32) -> Result<(), ChannelError> {
        self.exchange(Command::flash_erase(addr, size), &[])
            .map(|_| ())
    }

    #[instrument(skip(self, data), fields(addr = %format!("0x{:08X}", addr), len = data.len()))]
    pub fn flash_write(&mut self, addr: u32, data: &[u8]) -> Result<(), ChannelError> {
        if data.len() > PAGE_SIZE as usize {
            return Err(ChannelError::PayloadTooLarge { len: data.len() });
        }
        self.exchange(Command::write(addr, data.len() as u32), data)
            .map(|_| ())
    }

    #[instrument(skip(self), fields(addr = %format!("0x{:08X}", addr)))]
    pub fn flash_read(&mut self, addr: u32, size: u32) -> Result<Vec<u8>, ChannelError> {
        let data = self.exchange(Command::read(addr, size), &[])?;
        if data.len() < size as usize {
            return Err(ChannelError::ShortRead {
                addr,
                expected: size as usize,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    /// Reboot the device.
    ///
    /// An RP2350 gets REBOOT2 with a normal boot, which ignores `pc` and
    /// `sp`. The device leaves the bus while acknowledging, so errors from
    /// this exchange are logged and dropped.
    pub fn reboot(&mut self, pc: u32, sp: u32, delay_ms: u32) {
        let command = if self.transport.product_id() == RP2350_BOOT_PID {
            Command::reboot2_normal(delay_ms)
        } else {
            Command::reboot(pc, sp, delay_ms)
        };
        match self.exchange(command, &[]) {
            Ok(_) => debug!(cmd = %command, delay_ms, "Reboot acknowledged"),
            Err(e) => debug!(cmd = %command, error = %e, "Reboot exchange ended early"),
        }
    }

    fn check_connected(&mut self) -> Result<(), ChannelError> {
        if !self.disconnected && !self.transport.is_connected() {
            self.disconnected = true;
        }
        if self.disconnected {
            Err(ChannelError::Disconnected)
        } else {
            Ok(())
        }
    }

    fn transport_error(&mut self, command: &'static str, e: TransportError) -> ChannelError {
        if matches!(e, TransportError::Disconnected) {
            self.disconnected = true;
            ChannelError::Disconnected
        } else {
            ChannelError::Transport { command, source: e }
        }
    }

    fn take_token(&mut self) -> u32 {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        token
    }

    /// Run one exchange with stall recovery.
    fn exchange(&mut self, command: Command, data_out: &[u8]) -> Result<Vec<u8>, ChannelError> {
        self.check_connected()?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let frame = CommandFrame::new(self.take_token(), command);
            trace!(cmd = %command, token = frame.token, attempt, "Sending command");

            let err = match self.try_exchange(&frame, data_out) {
                Ok(data) => return Ok(data),
                Err(e) => e,
            };

            if !err.is_stall() {
                return Err(self.transport_error(command.name(), err));
            }

            warn!(cmd = %command, token = frame.token, attempt, "Endpoint stalled");
            self.recover_from_stall()?;

            if attempt >= self.max_attempts {
                return Err(ChannelError::ExchangeFailed {
                    command: command.name(),
                    attempts: attempt,
                    last: err,
                });
            }
        }
    }

    fn try_exchange(
        &self,
        frame: &CommandFrame,
        data_out: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let command = &frame.command;
        self.transport.bulk_out(&frame.to_bytes())?;

        let has_data = command.transfer_length > 0;
        let mut received = Vec::new();
        if has_data {
            if command.is_device_to_host() {
                received = self.transport.bulk_in(command.transfer_length as usize)?;
            } else {
                self.transport.bulk_out(data_out)?;
            }
        }

        // Ack travels opposite to the data phase
        if has_data && command.is_device_to_host() {
            self.transport.bulk_out(&[])?;
        } else {
            self.transport.bulk_in(1)?;
        }

        Ok(received)
    }

    fn recover_from_stall(&mut self) -> Result<(), ChannelError> {
        for direction in [Direction::In, Direction::Out] {
            if let Err(e) = self.transport.clear_halt(direction) {
                if matches!(e, TransportError::Disconnected) {
                    self.disconnected = true;
                    return Err(ChannelError::Disconnected);
                }
                warn!(%direction, error = %e, "Clear halt failed");
            }
        }
        match self.transport.control_out(PICOBOOT_IF_RESET) {
            Ok(()) => Ok(()),
            Err(TransportError::Disconnected) => {
                self.disconnected = true;
                Err(ChannelError::Disconnected)
            }
            Err(e) => {
                warn!(error = %e, "Interface reset failed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn test_write_then_read() {
        let mut client = PicobootClient::new(MockTransport::new());
        client.flash_write(0x1000_0000, &[0xAA; 256]).unwrap();
        let data = client.flash_read(0x1000_0000, 256).unwrap();
        assert_eq!(data, vec![0xAA; 256]);

        let frames = client.transport().frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].command.id, CMD_WRITE);
        assert_eq!(frames[1].command.id, CMD_READ);
    }

    #[test]
    fn test_tokens_increase() {
        let mut client = PicobootClient::new(MockTransport::new());
        client.exclusive_access(ExclusiveMode::Exclusive).unwrap();
        client.exit_xip().unwrap();
        client.flash_erase(0x1000_0000, SECTOR_SIZE).unwrap();

        let tokens: Vec<u32> = client.transport().frames().iter().map(|f| f.token).collect();
        assert!(tokens.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_ack_directions() {
        let mut client = PicobootClient::new(MockTransport::new());
        client.flash_read(0x1000_0000, 4).unwrap();
        // frame, then the zero-length OUT ack
        let writes = client.transport().get_writes();
        assert_eq!(writes.len(), 2);
        assert!(writes[1].is_empty());

        client.exit_xip().unwrap();
        // no-data command: only the frame goes out, ack is read
        assert_eq!(client.transport().get_writes().len(), 3);
    }

    #[test]
    fn test_single_stall_recovers() {
        let mock = MockTransport::new();
        mock.stall_on_frames(&[1]);
        let mut client = PicobootClient::new(mock);

        client.exit_xip().unwrap();
        client.flash_erase(0x1000_0000, SECTOR_SIZE).unwrap();

        let mock = client.transport();
        assert_eq!(mock.frame_attempts(), 3);
        assert_eq!(mock.control_requests(), vec![PICOBOOT_IF_RESET]);
        assert_eq!(mock.halt_clears(), vec![Direction::In, Direction::Out]);

        let frames = mock.frames();
        assert_eq!(frames.len(), 2);
        // token 2 was burned by the stalled attempt
        assert_eq!(frames[0].token, 1);
        assert_eq!(frames[1].token, 3);
        assert_eq!(frames[1].command.id, CMD_FLASH_ERASE);
    }

    #[test]
    fn test_stall_budget_exhausted() {
        let mock = MockTransport::new();
        mock.stall_on_frames(&[0, 1, 2]);
        let mut client = PicobootClient::new(mock);

        let err = client.flash_erase(0x1000_0000, SECTOR_SIZE).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::ExchangeFailed { attempts: 3, .. }
        ));
        assert_eq!(client.transport().frame_attempts(), 3);
        assert!(client.transport().frames().is_empty());
    }

    #[test]
    fn test_timeout_not_retried() {
        let mock = MockTransport::new();
        mock.timeout_on_frames(&[0]);
        let mut client = PicobootClient::new(mock);

        let err = client.exit_xip().unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Transport {
                source: TransportError::Timeout { .. },
                ..
            }
        ));
        assert_eq!(client.transport().frame_attempts(), 1);
        assert!(client.transport().control_requests().is_empty());
    }

    #[test]
    fn test_disconnect_fails_fast() {
        let mock = MockTransport::new();
        let mut client = PicobootClient::new(mock.clone());
        mock.disconnect();

        assert!(client.exit_xip().unwrap_err().is_disconnect());
        mock.reconnect();
        // Once lost, the channel stays invalid
        assert!(client.exit_xip().unwrap_err().is_disconnect());
        assert_eq!(mock.frame_attempts(), 0);
    }

    #[test]
    fn test_reboot_swallows_disconnect() {
        let mock = MockTransport::new();
        mock.disconnect_on_command(CMD_REBOOT);
        let mut client = PicobootClient::new(mock);

        client.reboot(0, RP2040_STACK_POINTER, 500);
        let frames = client.transport().frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command.id, CMD_REBOOT);
    }

    #[test]
    fn test_rp2350_reboots_with_reboot2() {
        let mock = MockTransport::new().with_product_id(RP2350_BOOT_PID);
        let mut client = PicobootClient::new(mock);

        client.reboot(0, RP2040_STACK_POINTER, 250);
        let frames = client.transport().frames();
        assert_eq!(frames.len(), 1);
        let cmd = frames[0].command;
        assert_eq!(cmd.id, CMD_REBOOT2);
        assert_eq!(cmd.arg_u32(0), REBOOT2_TYPE_NORMAL);
        assert_eq!(cmd.arg_u32(1), 250);
    }

    #[test]
    fn test_write_rejects_oversized_payload() {
        let mut client = PicobootClient::new(MockTransport::new());
        let err = client.flash_write(0x1000_0000, &[0u8; 257]).unwrap_err();
        assert!(matches!(err, ChannelError::PayloadTooLarge { len: 257 }));
        assert_eq!(client.transport().frame_attempts(), 0);
    }

    #[test]
    fn test_command_status() {
        let mock = MockTransport::new();
        let mut raw = [0u8; 16];
        raw[0..4].copy_from_slice(&5u32.to_le_bytes());
        mock.queue_status(&raw);
        let mut client = PicobootClient::new(mock);

        let status = client.command_status().unwrap();
        assert!(status.is_ok());
        assert_eq!(status.token, 5);
    }
}
