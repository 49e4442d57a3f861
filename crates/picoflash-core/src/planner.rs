//! Erase and write planning.
//!
//! Flash is erased in 4 KiB sectors and programmed in 256-byte pages. The
//! planner turns decoded blocks into the smallest set of erase ranges and a
//! page-bounded sequence of writes.

use std::collections::BTreeSet;
use std::fmt;

use tracing::debug;

use crate::image::TransferBlock;
use crate::protocol::constants::{PAGE_SIZE, SECTOR_SIZE};

/// A contiguous, sector-aligned span to erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseRange {
    pub start: u32,
    pub len: u32,
}

impl EraseRange {
    pub fn end(&self) -> u64 {
        self.start as u64 + self.len as u64
    }

    pub fn sectors(&self) -> u32 {
        self.len / SECTOR_SIZE
    }
}

impl fmt::Display for EraseRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:08X}..0x{:08X} ({} sectors)",
            self.start,
            self.end(),
            self.sectors()
        )
    }
}

/// Bytes for one program operation, never crossing a page boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteChunk {
    pub address: u32,
    pub data: Vec<u8>,
}

impl WriteChunk {
    /// Start of the page this chunk falls in.
    pub fn page_address(&self) -> u32 {
        self.address & !(PAGE_SIZE - 1)
    }

    /// Whether the chunk already covers exactly one page.
    pub fn is_full_page(&self) -> bool {
        self.address == self.page_address() && self.data.len() == PAGE_SIZE as usize
    }

    /// The whole page, with bytes outside the chunk left erased (0xFF).
    ///
    /// Programming 0xFF leaves NOR flash unchanged, so a partial chunk can be
    /// written as a full page.
    pub fn padded_page(&self) -> (u32, Vec<u8>) {
        let page = self.page_address();
        let mut buf = vec![0xFF; PAGE_SIZE as usize];
        let offset = (self.address - page) as usize;
        buf[offset..offset + self.data.len()].copy_from_slice(&self.data);
        (page, buf)
    }
}

/// Merge every touched sector into maximal contiguous erase ranges.
pub fn plan_erase(blocks: &[TransferBlock]) -> Vec<EraseRange> {
    let sectors: BTreeSet<u32> = blocks
        .iter()
        .filter(|b| !b.data.is_empty())
        .flat_map(|b| {
            let first = b.address / SECTOR_SIZE;
            let last = (b.address as u64 + b.data.len() as u64 - 1) / SECTOR_SIZE as u64;
            first..=last as u32
        })
        .collect();

    let mut ranges: Vec<EraseRange> = Vec::new();
    for sector in sectors {
        let start = sector * SECTOR_SIZE;
        match ranges.last_mut() {
            Some(last) if last.end() == start as u64 => last.len += SECTOR_SIZE,
            _ => ranges.push(EraseRange {
                start,
                len: SECTOR_SIZE,
            }),
        }
    }

    debug!(ranges = ranges.len(), "Planned erase");
    ranges
}

/// Split block payloads at page boundaries, keeping block and offset order.
pub fn plan_write(blocks: &[TransferBlock]) -> Vec<WriteChunk> {
    let mut chunks = Vec::new();
    for block in blocks {
        let mut addr = block.address;
        let mut rest = block.data.as_slice();
        while !rest.is_empty() {
            let room = (PAGE_SIZE - addr % PAGE_SIZE) as usize;
            let (head, tail) = rest.split_at(room.min(rest.len()));
            chunks.push(WriteChunk {
                address: addr,
                data: head.to_vec(),
            });
            addr = addr.wrapping_add(head.len() as u32);
            rest = tail;
        }
    }
    debug!(chunks = chunks.len(), "Planned writes");
    chunks
}

/// Total bytes covered by an erase plan.
pub fn erase_len(ranges: &[EraseRange]) -> u64 {
    ranges.iter().map(|r| r.len as u64).sum()
}
