//! Build identity recovery from the embedded binary-info table.
//!
//! Firmware built with the Pico SDK carries a small header near the start of
//! its image:
//!
//! ```text
//! 0x7188EBF2  bi_start  bi_end  remap_table  0xE71AA390
//! ```
//!
//! `bi_start..bi_end` is an array of pointers to typed entries. Only
//! id-and-string entries with the Raspberry Pi tag are decoded here; they
//! hold the program name, version, board and free-form feature strings.
//! Pointers may refer to RAM addresses, which the remap table translates back
//! to their flash source.
//!
//! Nothing in this module fails: a missing or malformed table simply yields
//! an [`Identity`] with empty fields.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace, warn};

use crate::image::TransferBlock;
use crate::memory::{MemoryMap, MemorySource};
use crate::protocol::constants::*;

/// Board-name fragments that identify firmware for this product family.
pub const DEFAULT_PRODUCT_TOKENS: &[&str] = &["pico", "rp2040", "rp2350"];

const FEATURE_BOARD_PREFIX: &str = "Board: ";
const FEATURE_VARIANT_PREFIX: &str = "Variant: ";
const FEATURE_GIT_PREFIX: &str = "Git: ";

/// One RAM window and the flash address it was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapEntry {
    pub source: u32,
    pub ram_start: u32,
    pub ram_end: u32,
}

impl RemapEntry {
    fn translate(&self, addr: u32) -> Option<u32> {
        (self.ram_start..self.ram_end)
            .contains(&addr)
            .then(|| self.source.wrapping_add(addr - self.ram_start))
    }
}

/// Location of the binary-info pointer array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryInfoHeader {
    /// Address of the start marker.
    pub marker_addr: u32,
    pub start: u32,
    pub end: u32,
    pub remap_table: u32,
}

impl BinaryInfoHeader {
    pub fn entry_count(&self) -> u32 {
        (self.end - self.start) / 4
    }
}

/// A decoded id-and-string entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryInfoString {
    pub id: u32,
    pub value: String,
}

/// Build identity recovered from an image or from device flash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub program_name: Option<String>,
    pub version: Option<String>,
    pub sdk_version: Option<String>,
    pub board: Option<String>,
    pub variant: Option<String>,
    pub source_revision: Option<String>,
    /// Every feature string, in table order.
    pub features: Vec<String>,
    pub recognized_as_target: bool,
}

impl Identity {
    /// Classify decoded entries. Among duplicates the first one wins.
    pub fn from_entries<S: AsRef<str>>(entries: &[BinaryInfoString], tokens: &[S]) -> Self {
        let mut identity = Identity::default();
        let mut board_id: Option<String> = None;
        let mut board_feature: Option<String> = None;

        for entry in entries {
            let value = entry.value.clone();
            match entry.id {
                BINARY_INFO_ID_PROGRAM_NAME => {
                    identity.program_name.get_or_insert(value);
                }
                BINARY_INFO_ID_PROGRAM_VERSION_STRING => {
                    identity.version.get_or_insert(value);
                }
                BINARY_INFO_ID_SDK_VERSION => {
                    identity.sdk_version.get_or_insert(value);
                }
                BINARY_INFO_ID_PICO_BOARD => {
                    board_id.get_or_insert(value);
                }
                BINARY_INFO_ID_PROGRAM_FEATURE => {
                    if let Some(rest) = value.strip_prefix(FEATURE_BOARD_PREFIX) {
                        board_feature.get_or_insert_with(|| rest.to_string());
                    } else if let Some(rest) = value.strip_prefix(FEATURE_VARIANT_PREFIX) {
                        identity.variant.get_or_insert_with(|| rest.to_string());
                    } else if let Some(rest) = value.strip_prefix(FEATURE_GIT_PREFIX) {
                        identity
                            .source_revision
                            .get_or_insert_with(|| rest.to_string());
                    }
                    identity.features.push(value);
                }
                other => trace!(id = %format!("0x{:08X}", other), "Ignoring binary-info id"),
            }
        }

        identity.board = board_feature.or(board_id);
        identity.recognized_as_target = identity
            .board
            .as_deref()
            .is_some_and(|board| matches_product(board, tokens));
        identity
    }

    /// True when no field was recovered.
    pub fn is_empty(&self) -> bool {
        self.program_name.is_none()
            && self.version.is_none()
            && self.sdk_version.is_none()
            && self.board.is_none()
            && self.features.is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
        writeln!(f, "Program:  {}", show(&self.program_name))?;
        writeln!(f, "Version:  {}", show(&self.version))?;
        writeln!(f, "SDK:      {}", show(&self.sdk_version))?;
        writeln!(f, "Board:    {}", show(&self.board))?;
        writeln!(f, "Variant:  {}", show(&self.variant))?;
        writeln!(f, "Revision: {}", show(&self.source_revision))?;
        write!(f, "Target:   {}", if self.recognized_as_target { "yes" } else { "no" })
    }
}

fn matches_product<S: AsRef<str>>(board: &str, tokens: &[S]) -> bool {
    let board = board.to_lowercase();
    tokens
        .iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .any(|t| !t.is_empty() && board.contains(&t))
}

/// Memory view that routes reads through the remap table.
struct Remapped<'a, M: MemorySource + ?Sized> {
    inner: &'a M,
    remaps: Vec<RemapEntry>,
}

impl<M: MemorySource + ?Sized> Remapped<'_, M> {
    fn translate(&self, addr: u32) -> u32 {
        self.remaps
            .iter()
            .find_map(|r| r.translate(addr))
            .unwrap_or(addr)
    }
}

impl<M: MemorySource + ?Sized> MemorySource for Remapped<'_, M> {
    fn base(&self) -> Option<u32> {
        self.inner.base()
    }

    fn read_at(&self, addr: u32, len: usize) -> Option<Vec<u8>> {
        self.inner.read_at(self.translate(addr), len)
    }
}

/// Locate the binary-info header in the first words of the image.
pub fn find_header<M: MemorySource + ?Sized>(mem: &M) -> Option<BinaryInfoHeader> {
    let mut base = mem.base()?;
    if base == FLASH_START {
        base += BOOT2_SIZE;
    }

    for i in 0..BINARY_INFO_SCAN_WORDS {
        let Some(addr) = base.checked_add(i * 4) else {
            break;
        };
        if mem.read_u32(addr) != Some(BINARY_INFO_MARKER_START) {
            continue;
        }
        let Some(raw) = mem.read_at(addr, 20) else {
            continue;
        };
        let word = |n: usize| LittleEndian::read_u32(&raw[n * 4..]);
        let (start, end, remap_table) = (word(1), word(2), word(3));

        if word(4) != BINARY_INFO_MARKER_END {
            debug!(addr = %format!("0x{:08X}", addr), "Start marker without end marker");
            continue;
        }
        if end <= start || start % 4 != 0 || end % 4 != 0 {
            debug!(
                start = %format!("0x{:08X}", start),
                end = %format!("0x{:08X}", end),
                "Binary-info bounds rejected"
            );
            continue;
        }

        return Some(BinaryInfoHeader {
            marker_addr: addr,
            start,
            end,
            remap_table,
        });
    }
    None
}

/// Read the remap triples, stopping at a zero source or the entry limit.
pub fn read_remap_table<M: MemorySource + ?Sized>(mem: &M, table: u32) -> Vec<RemapEntry> {
    let mut entries = Vec::new();
    if table == 0 {
        return entries;
    }
    for i in 0..MAX_REMAP_ENTRIES as u32 {
        let Some(addr) = table.checked_add(i * 12) else {
            break;
        };
        let Some(source) = mem.read_u32(addr) else { break };
        if source == 0 {
            break;
        }
        let word = |n: u32| addr.checked_add(n).and_then(|a| mem.read_u32(a));
        let (Some(ram_start), Some(ram_end)) = (word(4), word(8)) else {
            break;
        };
        entries.push(RemapEntry {
            source,
            ram_start,
            ram_end,
        });
    }
    entries
}

/// Read a NUL-terminated string, truncated at the length cap.
fn read_c_string<M: MemorySource + ?Sized>(mem: &M, addr: u32) -> Option<String> {
    let mut bytes = Vec::new();
    while bytes.len() < MAX_STRING_LEN {
        let b = mem.read_at(addr.checked_add(bytes.len() as u32)?, 1)?[0];
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Decode every id-and-string entry of the table.
///
/// Returns `None` when no table is present or its entry count is implausible.
/// `Some(vec![])` is a present but empty table.
pub fn read_strings<M: MemorySource + ?Sized>(mem: &M) -> Option<Vec<BinaryInfoString>> {
    let header = find_header(mem)?;
    let remaps = read_remap_table(mem, header.remap_table);
    debug!(
        marker = %format!("0x{:08X}", header.marker_addr),
        entries = header.entry_count(),
        remaps = remaps.len(),
        "Found binary-info header"
    );

    if header.entry_count() > MAX_BINARY_INFO_ENTRIES {
        warn!(entries = header.entry_count(), "Binary-info entry count out of range");
        return None;
    }

    let mem = Remapped { inner: mem, remaps };
    let mut strings = Vec::new();

    for i in 0..header.entry_count() {
        let Some(ptr) = mem.read_u32(header.start + i * 4) else {
            continue;
        };
        if ptr == 0 {
            continue;
        }
        let (Some(kind), Some(tag)) = (mem.read_u16(ptr), mem.read_u16(ptr.wrapping_add(2))) else {
            trace!(ptr = %format!("0x{:08X}", ptr), "Unresolvable entry");
            continue;
        };
        if kind != BINARY_INFO_TYPE_ID_AND_STRING || tag != BINARY_INFO_TAG_RASPBERRY_PI {
            continue;
        }
        let (Some(id), Some(value_ptr)) = (
            mem.read_u32(ptr.wrapping_add(4)),
            mem.read_u32(ptr.wrapping_add(8)),
        ) else {
            continue;
        };
        match read_c_string(&mem, value_ptr) {
            Some(value) => strings.push(BinaryInfoString { id, value }),
            None => trace!(ptr = %format!("0x{:08X}", value_ptr), "Unresolvable string"),
        }
    }

    Some(strings)
}

/// Recover build identity from any memory view.
pub fn identify<M, S>(mem: &M, tokens: &[S]) -> Identity
where
    M: MemorySource + ?Sized,
    S: AsRef<str>,
{
    match read_strings(mem) {
        Some(strings) => Identity::from_entries(&strings, tokens),
        None => Identity::default(),
    }
}

/// Recover build identity from decoded image blocks.
pub fn extract_identity(blocks: &[TransferBlock]) -> Identity {
    identify(&MemoryMap::from_blocks(blocks), DEFAULT_PRODUCT_TOKENS)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat image under construction, split into 256-byte blocks at the end.
    struct ImageBuilder {
        base: u32,
        bytes: Vec<u8>,
    }

    impl ImageBuilder {
        fn new(base: u32, len: usize) -> Self {
            Self {
                base,
                bytes: vec![0; len],
            }
        }

        fn put(&mut self, addr: u32, data: &[u8]) {
            let off = (addr - self.base) as usize;
            self.bytes[off..off + data.len()].copy_from_slice(data);
        }

        fn put_u32(&mut self, addr: u32, value: u32) {
            self.put(addr, &value.to_le_bytes());
        }

        fn put_str(&mut self, addr: u32, s: &str) {
            self.put(addr, s.as_bytes());
            self.put(addr + s.len() as u32, &[0]);
        }

        fn header(&mut self, at: u32, start: u32, end: u32, remap: u32) {
            self.put_u32(at, BINARY_INFO_MARKER_START);
            self.put_u32(at + 4, start);
            self.put_u32(at + 8, end);
            self.put_u32(at + 12, remap);
            self.put_u32(at + 16, BINARY_INFO_MARKER_END);
        }

        /// Write an id-and-string entry at `entry` pointing at `string`.
        fn id_string(&mut self, entry: u32, id: u32, string: u32) {
            self.put(entry, &BINARY_INFO_TYPE_ID_AND_STRING.to_le_bytes());
            self.put(entry + 2, &BINARY_INFO_TAG_RASPBERRY_PI.to_le_bytes());
            self.put_u32(entry + 4, id);
            self.put_u32(entry + 8, string);
        }

        fn blocks(&self) -> Vec<TransferBlock> {
            self.bytes
                .chunks(256)
                .enumerate()
                .map(|(i, chunk)| TransferBlock {
                    address: self.base + i as u32 * 256,
                    data: chunk.to_vec(),
                    block_no: i as u32,
                    num_blocks: 0,
                })
                .collect()
        }
    }

    const HEADER: u32 = FLASH_START + 0x110;
    const TABLE: u32 = FLASH_START + 0x400;
    const ENTRIES: u32 = FLASH_START + 0x500;
    const STRINGS: u32 = FLASH_START + 0x800;

    /// Image whose table holds the given (id, value) pairs.
    fn image_with(pairs: &[(u32, &str)]) -> ImageBuilder {
        let mut img = ImageBuilder::new(FLASH_START, 0x1000);
        let n = pairs.len() as u32;
        img.header(HEADER, TABLE, TABLE + n * 4, 0);
        for (i, (id, value)) in pairs.iter().enumerate() {
            let i = i as u32;
            let entry = ENTRIES + i * 12;
            let string = STRINGS + i * 0x40;
            img.put_u32(TABLE + i * 4, entry);
            img.id_string(entry, *id, string);
            img.put_str(string, value);
        }
        img
    }

    #[test]
    fn test_full_identity() {
        let img = image_with(&[
            (BINARY_INFO_ID_PROGRAM_NAME, "blink"),
            (BINARY_INFO_ID_PROGRAM_VERSION_STRING, "1.4.0"),
            (BINARY_INFO_ID_SDK_VERSION, "2.0.0"),
            (BINARY_INFO_ID_PICO_BOARD, "pico"),
            (BINARY_INFO_ID_PROGRAM_FEATURE, "Board: Pico_W"),
            (BINARY_INFO_ID_PROGRAM_FEATURE, "Variant: wifi"),
            (BINARY_INFO_ID_PROGRAM_FEATURE, "Git: 3f2a9c1"),
            (BINARY_INFO_ID_PROGRAM_FEATURE, "UART stdout"),
        ]);
        let id = extract_identity(&img.blocks());

        assert_eq!(id.program_name.as_deref(), Some("blink"));
        assert_eq!(id.version.as_deref(), Some("1.4.0"));
        assert_eq!(id.sdk_version.as_deref(), Some("2.0.0"));
        assert_eq!(id.board.as_deref(), Some("Pico_W"));
        assert_eq!(id.variant.as_deref(), Some("wifi"));
        assert_eq!(id.source_revision.as_deref(), Some("3f2a9c1"));
        assert_eq!(id.features.len(), 4);
        assert!(id.recognized_as_target);
    }

    #[test]
    fn test_board_id_used_without_board_feature() {
        let img = image_with(&[(BINARY_INFO_ID_PICO_BOARD, "adafruit_feather_rp2040")]);
        let id = extract_identity(&img.blocks());
        assert_eq!(id.board.as_deref(), Some("adafruit_feather_rp2040"));
        assert!(id.recognized_as_target);
    }

    #[test]
    fn test_first_prefix_wins() {
        let img = image_with(&[
            (BINARY_INFO_ID_PROGRAM_FEATURE, "Variant: first"),
            (BINARY_INFO_ID_PROGRAM_FEATURE, "Variant: second"),
            (BINARY_INFO_ID_PROGRAM_FEATURE, "Board: meshnode"),
        ]);
        let id = extract_identity(&img.blocks());
        assert_eq!(id.variant.as_deref(), Some("first"));
        assert_eq!(id.board.as_deref(), Some("meshnode"));
        assert!(!id.recognized_as_target);
    }

    #[test]
    fn test_custom_tokens() {
        let img = image_with(&[(BINARY_INFO_ID_PICO_BOARD, "MeshNode-v2")]);
        let mem = MemoryMap::from_blocks(&img.blocks());
        assert!(identify(&mem, &["meshnode"]).recognized_as_target);
        assert!(!identify(&mem, &[""]).recognized_as_target);
    }

    #[test]
    fn test_no_marker_is_empty() {
        let img = ImageBuilder::new(FLASH_START, 0x1000);
        let id = extract_identity(&img.blocks());
        assert_eq!(id, Identity::default());
        assert!(!id.recognized_as_target);
    }

    #[test]
    fn test_marker_in_boot2_is_ignored() {
        let mut img = image_with(&[(BINARY_INFO_ID_PROGRAM_NAME, "blink")]);
        img.put(HEADER, &[0; 20]);
        img.header(FLASH_START + 0x10, TABLE, TABLE + 4, 0);
        assert!(extract_identity(&img.blocks()).is_empty());
    }

    #[test]
    fn test_wrong_end_marker() {
        let mut img = image_with(&[(BINARY_INFO_ID_PROGRAM_NAME, "blink")]);
        img.put_u32(HEADER + 16, 0xDEAD_BEEF);
        assert!(extract_identity(&img.blocks()).is_empty());
    }

    #[test]
    fn test_misaligned_bounds_rejected() {
        let mut img = image_with(&[(BINARY_INFO_ID_PROGRAM_NAME, "blink")]);
        img.put_u32(HEADER + 4, TABLE + 2);
        assert!(extract_identity(&img.blocks()).is_empty());
    }

    #[test]
    fn test_empty_table_is_valid() {
        let mut img = ImageBuilder::new(FLASH_START, 0x1000);
        img.header(HEADER, TABLE, TABLE + 8, 0);
        let mem = MemoryMap::from_blocks(&img.blocks());
        assert_eq!(read_strings(&mem), Some(Vec::new()));
        assert!(identify(&mem, DEFAULT_PRODUCT_TOKENS).is_empty());
    }

    #[test]
    fn test_entry_count_bound() {
        let mut img = ImageBuilder::new(FLASH_START, 0x1000);
        img.header(HEADER, TABLE, TABLE + 1001 * 4, 0);
        let mem = MemoryMap::from_blocks(&img.blocks());
        assert_eq!(read_strings(&mem), None);
    }

    #[test]
    fn test_remapped_pointers() {
        let mut img = image_with(&[(BINARY_INFO_ID_PROGRAM_NAME, "blink")]);
        // Second entry lives in a RAM window loaded from flash 0x10000C00
        let remap = FLASH_START + 0x300;
        img.put_u32(remap, FLASH_START + 0xC00);
        img.put_u32(remap + 4, 0x2000_0000);
        img.put_u32(remap + 8, 0x2000_0100);
        img.put_u32(HEADER + 12, remap);
        img.put_u32(HEADER + 8, TABLE + 8);

        img.put_u32(TABLE + 4, 0x2000_0010);
        img.id_string(FLASH_START + 0xC10, BINARY_INFO_ID_PROGRAM_VERSION_STRING, 0x2000_0040);
        img.put_str(FLASH_START + 0xC40, "ram-1.0");

        let id = extract_identity(&img.blocks());
        assert_eq!(id.program_name.as_deref(), Some("blink"));
        assert_eq!(id.version.as_deref(), Some("ram-1.0"));
    }

    #[test]
    fn test_out_of_range_remap_window() {
        let mut img = image_with(&[(BINARY_INFO_ID_PROGRAM_NAME, "blink")]);
        let remap = FLASH_START + 0x300;
        img.put_u32(remap, 0x1080_0000);
        img.put_u32(remap + 4, 0x2000_0000);
        img.put_u32(remap + 8, 0x2000_1000);
        img.put_u32(HEADER + 12, remap);
        img.put_u32(HEADER + 8, TABLE + 8);
        img.put_u32(TABLE + 4, 0x2000_0010);

        let id = extract_identity(&img.blocks());
        assert_eq!(id.program_name.as_deref(), Some("blink"));
        assert_eq!(id.version, None);
    }

    #[test]
    fn test_remap_table_limit() {
        let mut img = ImageBuilder::new(FLASH_START, 0x1000);
        let remap = FLASH_START + 0x300;
        for i in 0..12u32 {
            img.put_u32(remap + i * 12, FLASH_START + 0x800);
            img.put_u32(remap + i * 12 + 4, 0x2000_0000 + i * 0x100);
            img.put_u32(remap + i * 12 + 8, 0x2000_0100 + i * 0x100);
        }
        let mem = MemoryMap::from_blocks(&img.blocks());
        assert_eq!(read_remap_table(&mem, remap).len(), MAX_REMAP_ENTRIES);
        assert!(read_remap_table(&mem, 0).is_empty());
    }

    #[test]
    fn test_string_length_cap() {
        let long = "x".repeat(600);
        let mut img = image_with(&[(BINARY_INFO_ID_PROGRAM_NAME, "blink")]);
        img.put(STRINGS, long.as_bytes());
        let id = extract_identity(&img.blocks());
        assert_eq!(id.program_name.map(|s| s.len()), Some(MAX_STRING_LEN));
    }

    #[test]
    fn test_ram_image_scanned_from_base() {
        let base = 0x2000_0000;
        let mut img = ImageBuilder::new(base, 0x400);
        img.header(base, base + 0x100, base + 0x104, 0);
        img.put_u32(base + 0x100, base + 0x200);
        img.id_string(base + 0x200, BINARY_INFO_ID_PROGRAM_NAME, base + 0x300);
        img.put_str(base + 0x300, "no_flash");

        let id = extract_identity(&img.blocks());
        assert_eq!(id.program_name.as_deref(), Some("no_flash"));
    }

    #[test]
    fn test_scan_window_edges() {
        let scan_start = FLASH_START + BOOT2_SIZE;
        let last = scan_start + (BINARY_INFO_SCAN_WORDS - 1) * 4;

        let mut img = image_with(&[(BINARY_INFO_ID_PROGRAM_NAME, "blink")]);
        img.put(HEADER, &[0; 20]);
        img.header(last, TABLE, TABLE + 4, 0);
        assert_eq!(
            extract_identity(&img.blocks()).program_name.as_deref(),
            Some("blink")
        );

        img.put(last, &[0; 20]);
        img.header(last + 4, TABLE, TABLE + 4, 0);
        assert!(extract_identity(&img.blocks()).is_empty());
    }

    #[test]
    fn test_scan_stops_at_top_of_address_space() {
        let mut img = ImageBuilder::new(0xFFFF_FFC0, 0x40);
        img.put_u32(0xFFFF_FFF0, BINARY_INFO_MARKER_START);
        let mem = MemoryMap::from_blocks(&img.blocks());
        assert_eq!(find_header(&mem), None);
        assert!(identify(&mem, DEFAULT_PRODUCT_TOKENS).is_empty());
    }

    #[test]
    fn test_remap_table_at_top_of_address_space() {
        let base = 0xFFFF_FF00;
        let mut img = ImageBuilder::new(base, 0x100);
        img.header(base, base + 0x40, base + 0x44, 0xFFFF_FFF8);
        img.put_u32(base + 0x40, base + 0x80);
        img.id_string(base + 0x80, BINARY_INFO_ID_PROGRAM_NAME, base + 0xC0);
        img.put_str(base + 0xC0, "top");
        img.put_u32(0xFFFF_FFF8, 0x1000_0000);
        img.put_u32(0xFFFF_FFFC, 0x2000_0000);

        let mem = MemoryMap::from_blocks(&img.blocks());
        assert!(read_remap_table(&mem, 0xFFFF_FFF8).is_empty());
        assert_eq!(
            extract_identity(&img.blocks()).program_name.as_deref(),
            Some("top")
        );
    }
}
