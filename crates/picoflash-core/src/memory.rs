//! Address-indexed views over firmware bytes.
//!
//! Every read is bounds-checked and fallible: a request that touches any
//! unmapped byte yields `None` instead of panicking.

use std::cell::RefCell;
use std::collections::HashMap;

use tracing::{debug, trace};

use crate::channel::PicobootClient;
use crate::image::TransferBlock;
use crate::protocol::constants::{FLASH_START, PAGE_SIZE};
use crate::transport::UsbTransport;

/// Something that can be read by absolute address.
pub trait MemorySource {
    /// Lowest mapped address, if anything is mapped.
    fn base(&self) -> Option<u32>;

    /// Read `len` bytes at `addr`, or `None` if any byte is unmapped.
    fn read_at(&self, addr: u32, len: usize) -> Option<Vec<u8>>;

    fn read_u32(&self, addr: u32) -> Option<u32> {
        let b = self.read_at(addr, 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u16(&self, addr: u32) -> Option<u16> {
        let b = self.read_at(addr, 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }
}

#[derive(Debug, Clone)]
struct Region {
    start: u32,
    data: Vec<u8>,
}

impl Region {
    fn end(&self) -> u64 {
        self.start as u64 + self.data.len() as u64
    }
}

/// Decoded image blocks, coalesced into contiguous regions.
///
/// Adjacent blocks merge, so reads may span block boundaries. Where blocks
/// overlap, the later one (by address order) wins.
#[derive(Debug, Clone, Default)]
pub struct MemoryMap {
    regions: Vec<Region>,
}

impl MemoryMap {
    pub fn from_blocks(blocks: &[TransferBlock]) -> Self {
        let mut sorted: Vec<&TransferBlock> =
            blocks.iter().filter(|b| !b.data.is_empty()).collect();
        sorted.sort_by_key(|b| b.address);

        let mut regions: Vec<Region> = Vec::new();
        for block in sorted {
            match regions.last_mut() {
                Some(last) if block.address as u64 <= last.end() => {
                    let offset = (block.address - last.start) as usize;
                    let end = offset + block.data.len();
                    if end > last.data.len() {
                        last.data.resize(end, 0);
                    }
                    last.data[offset..end].copy_from_slice(&block.data);
                }
                _ => regions.push(Region {
                    start: block.address,
                    data: block.data.clone(),
                }),
            }
        }

        debug!(regions = regions.len(), "Built memory map");
        Self { regions }
    }

    /// Number of contiguous regions.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}

impl MemorySource for MemoryMap {
    fn base(&self) -> Option<u32> {
        self.regions.first().map(|r| r.start)
    }

    fn read_at(&self, addr: u32, len: usize) -> Option<Vec<u8>> {
        // Last region starting at or below addr
        let idx = self.regions.partition_point(|r| r.start <= addr);
        let region = self.regions.get(idx.checked_sub(1)?)?;
        let offset = (addr - region.start) as usize;
        let end = offset.checked_add(len)?;
        region.data.get(offset..end).map(<[u8]>::to_vec)
    }
}

/// Live device flash, read page by page through the command channel.
///
/// Pages are cached, including failed reads, so a pointer walk never asks the
/// device for the same page twice.
pub struct DeviceMemory<'a, T: UsbTransport> {
    client: RefCell<&'a mut PicobootClient<T>>,
    start: u32,
    end: u64,
    pages: RefCell<HashMap<u32, Option<Vec<u8>>>>,
}

impl<'a, T: UsbTransport> DeviceMemory<'a, T> {
    /// View `size` bytes of flash from the flash origin.
    pub fn new(client: &'a mut PicobootClient<T>, size: u32) -> Self {
        Self {
            client: RefCell::new(client),
            start: FLASH_START,
            end: FLASH_START as u64 + size as u64,
            pages: RefCell::new(HashMap::new()),
        }
    }

    /// Pages fetched from the device so far.
    pub fn pages_read(&self) -> usize {
        self.pages.borrow().len()
    }

    fn page(&self, page_addr: u32) -> Option<Vec<u8>> {
        if let Some(cached) = self.pages.borrow().get(&page_addr) {
            return cached.clone();
        }
        let result = match self.client.borrow_mut().flash_read(page_addr, PAGE_SIZE) {
            Ok(data) => Some(data),
            Err(e) => {
                debug!(addr = %format!("0x{:08X}", page_addr), error = %e, "Device read failed");
                None
            }
        };
        trace!(addr = %format!("0x{:08X}", page_addr), ok = result.is_some(), "Fetched page");
        self.pages.borrow_mut().insert(page_addr, result.clone());
        result
    }
}

impl<T: UsbTransport> MemorySource for DeviceMemory<'_, T> {
    fn base(&self) -> Option<u32> {
        Some(self.start)
    }

    fn read_at(&self, addr: u32, len: usize) -> Option<Vec<u8>> {
        let end = addr as u64 + len as u64;
        if addr < self.start || end > self.end {
            return None;
        }

        let mut out = Vec::with_capacity(len);
        let mut cursor = addr as u64;
        while cursor < end {
            let page_addr = (cursor as u32) & !(PAGE_SIZE - 1);
            let page = self.page(page_addr)?;
            let from = (cursor - page_addr as u64) as usize;
            let to = ((end - page_addr as u64) as usize).min(page.len());
            out.extend_from_slice(page.get(from..to)?);
            cursor = page_addr as u64 + to as u64;
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn block(address: u32, data: &[u8]) -> TransferBlock {
        TransferBlock {
            address,
            data: data.to_vec(),
            block_no: 0,
            num_blocks: 0,
        }
    }

    #[test]
    fn test_read_spans_adjacent_blocks() {
        let map = MemoryMap::from_blocks(&[
            block(0x1000_0004, &[5, 6, 7, 8]),
            block(0x1000_0000, &[1, 2, 3, 4]),
        ]);
        assert_eq!(map.region_count(), 1);
        assert_eq!(map.base(), Some(0x1000_0000));
        assert_eq!(map.read_at(0x1000_0002, 4), Some(vec![3, 4, 5, 6]));
        assert_eq!(map.read_u32(0x1000_0004), Some(0x0807_0605));
    }

    #[test]
    fn test_gap_is_unmapped() {
        let map = MemoryMap::from_blocks(&[
            block(0x1000_0000, &[1, 2, 3, 4]),
            block(0x1000_0008, &[9, 9, 9, 9]),
        ]);
        assert_eq!(map.region_count(), 2);
        assert_eq!(map.read_at(0x1000_0002, 4), None);
        assert_eq!(map.read_at(0x0FFF_FFFF, 1), None);
        assert_eq!(map.read_at(0x1000_0008, 4), Some(vec![9; 4]));
        assert_eq!(map.read_at(0x1000_000A, 4), None);
    }

    #[test]
    fn test_empty_map() {
        let map = MemoryMap::from_blocks(&[]);
        assert_eq!(map.base(), None);
        assert_eq!(map.read_at(0, 1), None);
    }

    #[test]
    fn test_device_memory_caches_pages() {
        let mock = MockTransport::new();
        mock.load_memory(FLASH_START + 0xFE, &[0xAB, 0xCD, 0xEF, 0x01]);
        let mut client = PicobootClient::new(mock.clone());
        let mem = DeviceMemory::new(&mut client, 0x1000);

        // Crosses the first page boundary
        assert_eq!(
            mem.read_at(FLASH_START + 0xFE, 4),
            Some(vec![0xAB, 0xCD, 0xEF, 0x01])
        );
        assert_eq!(mem.read_u16(FLASH_START + 0xFE), Some(0xCDAB));
        assert_eq!(mem.pages_read(), 2);
        assert_eq!(mock.frames().len(), 2);

        assert_eq!(mem.read_at(FLASH_START + 0x1000, 1), None);
    }
}
