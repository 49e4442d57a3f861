//! PICOBOOT command frame.
//!
//! Wire layout (32 bytes, little-endian):
//!
//! | offset | size | field             |
//! |--------|------|-------------------|
//! | 0      | 4    | magic             |
//! | 4      | 4    | token             |
//! | 8      | 1    | command id        |
//! | 9      | 1    | argument length   |
//! | 10     | 2    | reserved          |
//! | 12     | 4    | transfer length   |
//! | 16     | 16   | arguments         |

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Invalid magic: expected 0x{expected:08X}, got 0x{actual:08X}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("Argument length {0} exceeds {MAX_ARGS_SIZE} bytes")]
    ArgsTooLong(u8),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exclusive access mode for [`Command::exclusive_access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusiveMode {
    /// Release exclusivity, the mass storage drive is usable again.
    Release,
    /// Lock out the mass storage interface.
    Exclusive,
    /// Lock out and eject the mass storage drive.
    ExclusiveAndEject,
}

impl ExclusiveMode {
    fn as_byte(self) -> u8 {
        match self {
            ExclusiveMode::Release => EXCLUSIVE_NOT,
            ExclusiveMode::Exclusive => EXCLUSIVE,
            ExclusiveMode::ExclusiveAndEject => EXCLUSIVE_AND_EJECT,
        }
    }
}

/// One device verb, independent of the token it is sent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub id: u8,
    pub arg_len: u8,
    pub transfer_length: u32,
    pub args: [u8; MAX_ARGS_SIZE],
}

impl Command {
    fn with_args(id: u8, transfer_length: u32, words: &[u32]) -> Self {
        let mut args = [0u8; MAX_ARGS_SIZE];
        for (slot, word) in args.chunks_exact_mut(4).zip(words) {
            slot.copy_from_slice(&word.to_le_bytes());
        }
        Self {
            id,
            arg_len: (words.len() * 4) as u8,
            transfer_length,
            args,
        }
    }

    pub fn exclusive_access(mode: ExclusiveMode) -> Self {
        let mut args = [0u8; MAX_ARGS_SIZE];
        args[0] = mode.as_byte();
        Self {
            id: CMD_EXCLUSIVE_ACCESS,
            arg_len: 1,
            transfer_length: 0,
            args,
        }
    }

    pub fn exit_xip() -> Self {
        Self::with_args(CMD_EXIT_XIP, 0, &[])
    }

    pub fn flash_erase(addr: u32, size: u32) -> Self {
        Self::with_args(CMD_FLASH_ERASE, 0, &[addr, size])
    }

    pub fn read(addr: u32, size: u32) -> Self {
        Self::with_args(CMD_READ, size, &[addr, size])
    }

    pub fn write(addr: u32, size: u32) -> Self {
        Self::with_args(CMD_WRITE, size, &[addr, size])
    }

    pub fn reboot(pc: u32, sp: u32, delay_ms: u32) -> Self {
        Self::with_args(CMD_REBOOT, 0, &[pc, sp, delay_ms])
    }

    /// RP2350 reboot into the image in flash.
    pub fn reboot2_normal(delay_ms: u32) -> Self {
        Self::with_args(CMD_REBOOT2, 0, &[REBOOT2_TYPE_NORMAL, delay_ms, 0, 0])
    }

    /// Whether the data phase (if any) flows device-to-host.
    pub fn is_device_to_host(&self) -> bool {
        self.id & CMD_DIR_IN != 0
    }

    /// Argument word `n`, for logging and test assertions.
    pub fn arg_u32(&self, n: usize) -> u32 {
        let start = n * 4;
        u32::from_le_bytes([
            self.args[start],
            self.args[start + 1],
            self.args[start + 2],
            self.args[start + 3],
        ])
    }

    pub fn name(&self) -> &'static str {
        match self.id {
            CMD_EXCLUSIVE_ACCESS => "EXCLUSIVE_ACCESS",
            CMD_REBOOT => "REBOOT",
            CMD_REBOOT2 => "REBOOT2",
            CMD_FLASH_ERASE => "FLASH_ERASE",
            CMD_READ => "READ",
            CMD_WRITE => "WRITE",
            CMD_EXIT_XIP => "EXIT_XIP",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.id)
    }
}

/// A command bound to a token, ready for the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    pub token: u32,
    pub command: Command,
}

impl CommandFrame {
    pub const SIZE: usize = COMMAND_SIZE;

    pub fn new(token: u32, command: Command) -> Self {
        Self { token, command }
    }

    pub fn to_bytes(&self) -> [u8; COMMAND_SIZE] {
        let mut buf = [0u8; COMMAND_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], PICOBOOT_MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], self.token);
        buf[8] = self.command.id;
        buf[9] = self.command.arg_len;
        LittleEndian::write_u32(&mut buf[12..16], self.command.transfer_length);
        buf[16..].copy_from_slice(&self.command.args);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < COMMAND_SIZE {
            return Err(FrameError::BufferTooSmall {
                expected: COMMAND_SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != PICOBOOT_MAGIC {
            return Err(FrameError::InvalidMagic {
                expected: PICOBOOT_MAGIC,
                actual: magic,
            });
        }
        let token = cursor.read_u32::<LittleEndian>()?;
        let id = cursor.read_u8()?;
        let arg_len = cursor.read_u8()?;
        let _reserved = cursor.read_u16::<LittleEndian>()?;
        let transfer_length = cursor.read_u32::<LittleEndian>()?;
        if arg_len as usize > MAX_ARGS_SIZE {
            return Err(FrameError::ArgsTooLong(arg_len));
        }
        let mut args = [0u8; MAX_ARGS_SIZE];
        args.copy_from_slice(&data[16..COMMAND_SIZE]);

        Ok(Self {
            token,
            command: Command {
                id,
                arg_len,
                transfer_length,
                args,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_erase_frame_layout() {
        let frame = CommandFrame::new(7, Command::flash_erase(0x1000_0000, 0x2000));
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[0..4], &PICOBOOT_MAGIC.to_le_bytes());
        assert_eq!(&bytes[4..8], &7u32.to_le_bytes());
        assert_eq!(bytes[8], CMD_FLASH_ERASE);
        assert_eq!(bytes[9], 8);
        assert_eq!(&bytes[10..12], &[0, 0]);
        assert_eq!(&bytes[12..16], &0u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &0x1000_0000u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &0x2000u32.to_le_bytes());
        assert!(bytes[24..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_is_device_to_host() {
        let read = Command::read(0x1000_0000, 256);
        assert!(read.is_device_to_host());
        assert_eq!(read.transfer_length, 256);
        assert!(!Command::write(0x1000_0000, 256).is_device_to_host());
        assert!(!Command::exit_xip().is_device_to_host());
    }

    #[test]
    fn test_exclusive_access_args() {
        let cmd = Command::exclusive_access(ExclusiveMode::ExclusiveAndEject);
        assert_eq!(cmd.arg_len, 1);
        assert_eq!(cmd.args[0], EXCLUSIVE_AND_EJECT);
    }

    #[test]
    fn test_reboot_args() {
        let cmd = Command::reboot(0, RP2040_STACK_POINTER, 500);
        assert_eq!(cmd.arg_len, 12);
        assert_eq!(cmd.arg_u32(0), 0);
        assert_eq!(cmd.arg_u32(1), RP2040_STACK_POINTER);
        assert_eq!(cmd.arg_u32(2), 500);
    }

    #[test]
    fn test_reboot2_args() {
        let cmd = Command::reboot2_normal(250);
        assert_eq!(cmd.id, CMD_REBOOT2);
        assert_eq!(cmd.arg_len, 16);
        assert_eq!(cmd.arg_u32(0), REBOOT2_TYPE_NORMAL);
        assert_eq!(cmd.arg_u32(1), 250);
        assert_eq!(cmd.name(), "REBOOT2");
        assert!(!cmd.is_device_to_host());
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut bytes = CommandFrame::new(1, Command::exit_xip()).to_bytes();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            CommandFrame::from_bytes(&bytes),
            Err(FrameError::InvalidMagic { .. })
        ));
        assert!(matches!(
            CommandFrame::from_bytes(&bytes[..10]),
            Err(FrameError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_decode_matches_encode() {
        let frame = CommandFrame::new(42, Command::write(0x1000_0100, 256));
        let decoded = CommandFrame::from_bytes(&frame.to_bytes()).unwrap();
        assert_eq!(decoded, frame);
    }
}
