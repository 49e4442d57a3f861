//! Last-command status as reported by the `PICOBOOT_IF_CMD_STATUS` request.

use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;

use super::command::FrameError;
use super::constants::CMD_STATUS_SIZE;

/// Bootrom status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    UnknownCommand,
    InvalidCommandLength,
    InvalidTransferLength,
    InvalidAddress,
    BadAlignment,
    InterleavedWrite,
    Rebooted,
    UnknownError,
    Other(u32),
}

impl From<u32> for StatusCode {
    fn from(code: u32) -> Self {
        match code {
            0 => StatusCode::Ok,
            1 => StatusCode::UnknownCommand,
            2 => StatusCode::InvalidCommandLength,
            3 => StatusCode::InvalidTransferLength,
            4 => StatusCode::InvalidAddress,
            5 => StatusCode::BadAlignment,
            6 => StatusCode::InterleavedWrite,
            7 => StatusCode::Rebooted,
            8 => StatusCode::UnknownError,
            other => StatusCode::Other(other),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Ok => write!(f, "OK"),
            StatusCode::UnknownCommand => write!(f, "Unknown command"),
            StatusCode::InvalidCommandLength => write!(f, "Invalid command length"),
            StatusCode::InvalidTransferLength => write!(f, "Invalid transfer length"),
            StatusCode::InvalidAddress => write!(f, "Invalid address"),
            StatusCode::BadAlignment => write!(f, "Bad alignment"),
            StatusCode::InterleavedWrite => write!(f, "Interleaved write"),
            StatusCode::Rebooted => write!(f, "Rebooted"),
            StatusCode::UnknownError => write!(f, "Unknown error"),
            StatusCode::Other(code) => write!(f, "Status {}", code),
        }
    }
}

/// Decoded 16-byte command status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    pub token: u32,
    pub code: StatusCode,
    pub command_id: u8,
    pub in_progress: bool,
}

impl CommandStatus {
    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < CMD_STATUS_SIZE {
            return Err(FrameError::BufferTooSmall {
                expected: CMD_STATUS_SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            token: cursor.read_u32::<LittleEndian>()?,
            code: StatusCode::from(cursor.read_u32::<LittleEndian>()?),
            command_id: cursor.read_u8()?,
            in_progress: cursor.read_u8()? != 0,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "token={} cmd=0x{:02X} status={}{}",
            self.token,
            self.command_id,
            self.code,
            if self.in_progress { " (in progress)" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_decode() {
        let mut raw = [0u8; 16];
        raw[0..4].copy_from_slice(&9u32.to_le_bytes());
        raw[4..8].copy_from_slice(&4u32.to_le_bytes());
        raw[8] = 0x03;
        raw[9] = 1;
        let status = CommandStatus::from_bytes(&raw).unwrap();
        assert_eq!(status.token, 9);
        assert_eq!(status.code, StatusCode::InvalidAddress);
        assert_eq!(status.command_id, 0x03);
        assert!(status.in_progress);
        assert!(!status.is_ok());
    }

    #[test]
    fn test_status_too_short() {
        assert!(CommandStatus::from_bytes(&[0u8; 8]).is_err());
    }
}
