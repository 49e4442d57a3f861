//! Firmware image parsing.
//!
//! Validates a UF2 file and decodes it into address-tagged transfer blocks.
//! Any malformed record aborts the whole parse; a partially valid image is
//! never handed to the flash planner.

pub mod uf2;

use std::path::Path;

use tracing::{debug, info};

use crate::protocol::constants::*;
pub use uf2::{ImageError, MagicField, Uf2Record, family_name};

/// Payload destined for one target address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferBlock {
    pub address: u32,
    pub data: Vec<u8>,
    /// Sequence index as authored.
    pub block_no: u32,
    /// Total block count declared by the file.
    pub num_blocks: u32,
}

impl TransferBlock {
    /// One past the last byte covered by this block.
    pub fn end(&self) -> u64 {
        self.address as u64 + self.data.len() as u64
    }
}

/// Result of parsing a UF2 file.
#[derive(Debug, Clone)]
pub struct ParsedImage {
    /// Every record in file order, for inspection.
    pub records: Vec<Uf2Record>,
    /// Main-flash blocks, sorted by ascending address.
    pub blocks: Vec<TransferBlock>,
    /// Family id shared by all records that declare one.
    pub family_id: Option<u32>,
}

impl ParsedImage {
    /// Load and parse a UF2 file from disk.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let data = std::fs::read(path.as_ref())?;
        info!(path = %path.as_ref().display(), size = data.len(), "Loaded image");
        parse(&data)
    }

    /// Number of payload bytes headed for flash.
    pub fn payload_len(&self) -> usize {
        self.blocks.iter().map(|b| b.data.len()).sum()
    }

    pub fn family_name(&self) -> Option<&'static str> {
        self.family_id.map(family_name)
    }
}

/// Validate and decode a UF2 file.
pub fn parse(data: &[u8]) -> Result<ParsedImage, ImageError> {
    if data.is_empty() {
        return Err(ImageError::Empty);
    }
    if data.len() % UF2_BLOCK_SIZE != 0 {
        return Err(ImageError::BadSize { len: data.len() });
    }

    let mut records = Vec::with_capacity(data.len() / UF2_BLOCK_SIZE);
    let mut family_id: Option<u32> = None;

    for (index, raw) in data.chunks_exact(UF2_BLOCK_SIZE).enumerate() {
        let record = Uf2Record::parse(index, raw)?;

        if let Some(family) = record.family_id {
            match family_id {
                Some(expected) if expected != family => {
                    return Err(ImageError::InconsistentFamily {
                        record: index,
                        expected,
                        found: family,
                    });
                }
                Some(_) => {}
                None => {
                    if !KNOWN_FAMILY_IDS.contains(&family) {
                        return Err(ImageError::UnknownFamily {
                            record: index,
                            family,
                        });
                    }
                    family_id = Some(family);
                }
            }
        }

        records.push(record);
    }

    let mut blocks: Vec<TransferBlock> = records
        .iter()
        .filter(|r| r.is_flash_data())
        .map(|r| TransferBlock {
            address: r.target_addr,
            data: r.data.clone(),
            block_no: r.block_no,
            num_blocks: r.num_blocks,
        })
        .collect();
    blocks.sort_by_key(|b| b.address);

    debug!(
        records = records.len(),
        blocks = blocks.len(),
        family = ?family_id.map(family_name),
        "Parsed UF2 image"
    );

    Ok(ParsedImage {
        records,
        blocks,
        family_id,
    })
}

/// Encode blocks as UF2 records, numbering them in the given order.
pub fn encode_blocks(blocks: &[TransferBlock], family_id: Option<u32>) -> Vec<u8> {
    let num_blocks = blocks.len() as u32;
    let flags = if family_id.is_some() {
        UF2_FLAG_FAMILY_ID_PRESENT
    } else {
        0
    };

    let mut out = Vec::with_capacity(blocks.len() * UF2_BLOCK_SIZE);
    for (i, block) in blocks.iter().enumerate() {
        let record = Uf2Record {
            index: i,
            flags,
            target_addr: block.address,
            payload_size: block.data.len() as u32,
            block_no: i as u32,
            num_blocks,
            family_id,
            data: block.data.clone(),
        };
        out.extend_from_slice(&record.to_bytes());
    }
    out
}

/// Encode a flat binary starting at `base` in 256-byte blocks.
pub fn encode_binary(base: u32, data: &[u8], family_id: Option<u32>) -> Vec<u8> {
    let blocks: Vec<TransferBlock> = data
        .chunks(PAGE_SIZE as usize)
        .enumerate()
        .map(|(i, chunk)| TransferBlock {
            address: base + (i as u32) * PAGE_SIZE,
            data: chunk.to_vec(),
            block_no: i as u32,
            num_blocks: 0,
        })
        .collect();
    encode_blocks(&blocks, family_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn block(address: u32, fill: u8) -> TransferBlock {
        TransferBlock {
            address,
            data: vec![fill; 256],
            block_no: 0,
            num_blocks: 0,
        }
    }

    fn byte_map(blocks: &[TransferBlock]) -> BTreeMap<u32, u8> {
        blocks
            .iter()
            .flat_map(|b| {
                b.data
                    .iter()
                    .enumerate()
                    .map(move |(i, &v)| (b.address + i as u32, v))
            })
            .collect()
    }

    #[test]
    fn test_blocks_sorted_records_in_file_order() {
        let authored = vec![
            block(0x1000_0200, 3),
            block(0x1000_0000, 1),
            block(0x1000_0100, 2),
        ];
        let image = parse(&encode_blocks(&authored, Some(RP2040_FAMILY_ID))).unwrap();

        let addrs: Vec<u32> = image.blocks.iter().map(|b| b.address).collect();
        assert_eq!(addrs, vec![0x1000_0000, 0x1000_0100, 0x1000_0200]);

        let record_addrs: Vec<u32> = image.records.iter().map(|r| r.target_addr).collect();
        assert_eq!(record_addrs, vec![0x1000_0200, 0x1000_0000, 0x1000_0100]);
        assert_eq!(image.records[1].block_no, 1);
        assert_eq!(image.family_name(), Some("rp2040"));
    }

    #[test]
    fn test_reencode_preserves_content() {
        let mut authored: Vec<TransferBlock> = (0..6u32)
            .map(|i| block(0x1000_0000 + i * 0x100, i as u8))
            .collect();
        authored.swap(0, 4);
        authored[2].data.truncate(100);

        let first = parse(&encode_blocks(&authored, Some(RP2040_FAMILY_ID))).unwrap();
        let second = parse(&encode_blocks(&first.blocks, first.family_id)).unwrap();

        assert_eq!(byte_map(&first.blocks), byte_map(&authored));
        assert_eq!(byte_map(&second.blocks), byte_map(&first.blocks));
    }

    #[test]
    fn test_rejects_bad_size() {
        assert!(matches!(parse(&[]), Err(ImageError::Empty)));
        let mut data = encode_binary(0x1000_0000, &[0u8; 256], None);
        data.push(0);
        assert!(matches!(parse(&data), Err(ImageError::BadSize { len: 513 })));
    }

    #[test]
    fn test_bad_magic_names_record() {
        let mut data = encode_binary(0x1000_0000, &[0u8; 1024], Some(RP2040_FAMILY_ID));
        data[2 * UF2_BLOCK_SIZE + 4] ^= 0x01;
        match parse(&data) {
            Err(ImageError::BadMagic { record, field, .. }) => {
                assert_eq!(record, 2);
                assert_eq!(field, MagicField::Start1);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_inconsistent_family() {
        let mut data = encode_binary(0x1000_0000, &[0u8; 768], Some(RP2040_FAMILY_ID));
        let off = 2 * UF2_BLOCK_SIZE + 28;
        data[off..off + 4].copy_from_slice(&RP2350_ARM_S_FAMILY_ID.to_le_bytes());
        assert!(matches!(
            parse(&data),
            Err(ImageError::InconsistentFamily { record: 2, .. })
        ));
    }

    #[test]
    fn test_unknown_family() {
        let data = encode_binary(0x1000_0000, &[0u8; 256], Some(0xADA5_2840));
        assert!(matches!(
            parse(&data),
            Err(ImageError::UnknownFamily {
                record: 0,
                family: 0xADA5_2840
            })
        ));
    }

    #[test]
    fn test_non_flash_records_kept_for_inspection() {
        let mut data = encode_binary(0x1000_0000, &[0u8; 512], Some(RP2040_FAMILY_ID));
        let flags_off = UF2_BLOCK_SIZE + 8;
        let flags = UF2_FLAG_FAMILY_ID_PRESENT | UF2_FLAG_NOT_MAIN_FLASH;
        data[flags_off..flags_off + 4].copy_from_slice(&flags.to_le_bytes());

        let image = parse(&data).unwrap();
        assert_eq!(image.records.len(), 2);
        assert_eq!(image.blocks.len(), 1);
        assert_eq!(image.payload_len(), 256);
    }

    #[test]
    fn test_block_past_address_space_aborts_parse() {
        let authored = vec![
            block(0x1000_0000, 1),
            TransferBlock {
                address: 0xFFFF_FF00,
                data: vec![0; 476],
                block_no: 0,
                num_blocks: 0,
            },
        ];
        let data = encode_blocks(&authored, None);
        assert!(matches!(
            parse(&data),
            Err(ImageError::AddressOverflow { record: 1, .. })
        ));
    }
}
