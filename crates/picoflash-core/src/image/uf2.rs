//! UF2 container records.
//!
//! Each record is 512 bytes:
//!
//! | offset | field                          |
//! |--------|--------------------------------|
//! | 0      | magic start 0                  |
//! | 4      | magic start 1                  |
//! | 8      | flags                          |
//! | 12     | target address                 |
//! | 16     | payload size                   |
//! | 20     | block number                   |
//! | 24     | total blocks                   |
//! | 28     | family id (or file size)       |
//! | 32     | data (476 bytes)               |
//! | 508    | magic end                      |

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;
use thiserror::Error;

use crate::protocol::constants::*;

/// Which magic word failed to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagicField {
    Start0,
    Start1,
    End,
}

impl fmt::Display for MagicField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MagicField::Start0 => write!(f, "start magic 0"),
            MagicField::Start1 => write!(f, "start magic 1"),
            MagicField::End => write!(f, "end magic"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Invalid image: file is empty")]
    Empty,

    #[error("Invalid image: size {len} is not a multiple of {UF2_BLOCK_SIZE}")]
    BadSize { len: usize },

    #[error("Invalid image: record {record} has bad {field} 0x{found:08X}")]
    BadMagic {
        record: usize,
        field: MagicField,
        found: u32,
    },

    #[error("Invalid image: record {record} payload size {size} exceeds {UF2_DATA_SIZE}")]
    PayloadTooLarge { record: usize, size: u32 },

    #[error("Invalid image: record {record} at 0x{addr:08X} runs past the 32-bit address space")]
    AddressOverflow { record: usize, addr: u32, size: u32 },

    #[error(
        "Invalid image: record {record} family 0x{found:08X} differs from 0x{expected:08X}"
    )]
    InconsistentFamily {
        record: usize,
        expected: u32,
        found: u32,
    },

    #[error("Invalid image: record {record} has unsupported family 0x{family:08X}")]
    UnknownFamily { record: usize, family: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One decoded record, as authored in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uf2Record {
    /// Position of the record in the file.
    pub index: usize,
    pub flags: u32,
    pub target_addr: u32,
    pub payload_size: u32,
    pub block_no: u32,
    pub num_blocks: u32,
    /// Present only when the family flag is set.
    pub family_id: Option<u32>,
    pub data: Vec<u8>,
}

impl Uf2Record {
    /// Decode one 512-byte record.
    pub fn parse(index: usize, raw: &[u8]) -> Result<Self, ImageError> {
        let mut cursor = Cursor::new(raw);

        let magic0 = cursor.read_u32::<LittleEndian>()?;
        if magic0 != UF2_MAGIC_START0 {
            return Err(ImageError::BadMagic {
                record: index,
                field: MagicField::Start0,
                found: magic0,
            });
        }
        let magic1 = cursor.read_u32::<LittleEndian>()?;
        if magic1 != UF2_MAGIC_START1 {
            return Err(ImageError::BadMagic {
                record: index,
                field: MagicField::Start1,
                found: magic1,
            });
        }

        let flags = cursor.read_u32::<LittleEndian>()?;
        let target_addr = cursor.read_u32::<LittleEndian>()?;
        let payload_size = cursor.read_u32::<LittleEndian>()?;
        let block_no = cursor.read_u32::<LittleEndian>()?;
        let num_blocks = cursor.read_u32::<LittleEndian>()?;
        let family_or_size = cursor.read_u32::<LittleEndian>()?;

        cursor.set_position(UF2_MAGIC_END_OFFSET as u64);
        let magic_end = cursor.read_u32::<LittleEndian>()?;
        if magic_end != UF2_MAGIC_END {
            return Err(ImageError::BadMagic {
                record: index,
                field: MagicField::End,
                found: magic_end,
            });
        }

        if payload_size as usize > UF2_DATA_SIZE {
            return Err(ImageError::PayloadTooLarge {
                record: index,
                size: payload_size,
            });
        }

        if target_addr as u64 + payload_size as u64 > 1 << 32 {
            return Err(ImageError::AddressOverflow {
                record: index,
                addr: target_addr,
                size: payload_size,
            });
        }

        let data_start = UF2_HEADER_SIZE;
        let data = raw[data_start..data_start + payload_size as usize].to_vec();

        Ok(Self {
            index,
            flags,
            target_addr,
            payload_size,
            block_no,
            num_blocks,
            family_id: (flags & UF2_FLAG_FAMILY_ID_PRESENT != 0).then_some(family_or_size),
            data,
        })
    }

    /// Whether the record carries bytes destined for main flash.
    pub fn is_flash_data(&self) -> bool {
        self.flags & (UF2_FLAG_NOT_MAIN_FLASH | UF2_FLAG_FILE_CONTAINER) == 0
    }

    pub fn to_bytes(&self) -> [u8; UF2_BLOCK_SIZE] {
        let mut buf = [0u8; UF2_BLOCK_SIZE];
        let header = [
            UF2_MAGIC_START0,
            UF2_MAGIC_START1,
            self.flags,
            self.target_addr,
            self.data.len() as u32,
            self.block_no,
            self.num_blocks,
            self.family_id.unwrap_or(0),
        ];
        LittleEndian::write_u32_into(&header, &mut buf[..UF2_HEADER_SIZE]);

        let len = self.data.len().min(UF2_DATA_SIZE);
        buf[UF2_HEADER_SIZE..UF2_HEADER_SIZE + len].copy_from_slice(&self.data[..len]);
        buf[UF2_MAGIC_END_OFFSET..].copy_from_slice(&UF2_MAGIC_END.to_le_bytes());
        buf
    }
}

/// Human-readable name of a family id.
pub fn family_name(family_id: u32) -> &'static str {
    match family_id {
        RP2040_FAMILY_ID => "rp2040",
        ABSOLUTE_FAMILY_ID => "absolute",
        RP2350_ARM_S_FAMILY_ID => "rp2350-arm-s",
        RP2350_RISCV_FAMILY_ID => "rp2350-riscv",
        RP2350_ARM_NS_FAMILY_ID => "rp2350-arm-ns",
        _ => "unknown",
    }
}
