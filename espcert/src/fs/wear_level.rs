//! ESP-IDF wear-leveling layer (version 2).
//!
//! A wear-leveled partition ends with two copies of the WL state followed by
//! one configuration sector:
//!
//! ```text
//! +---------------------------+-------+----------+----------+--------+
//! | FAT sectors (rotating)    | dummy | state #1 | state #2 | config |
//! +---------------------------+-------+----------+----------+--------+
//! ```
//!
//! The state starts with a 64-byte header (`pos`, `max_pos`, `move_count`,
//! `access_count`, `max_count`, `block_size`, `version`, `device_id`,
//! reserved words, `crc`) followed by one 16-byte record per sector move.
//! Erased records read as all 0xFF.

use byteorder::{ByteOrder, LittleEndian};

/// WL sector size; also the only supported FAT sector size.
pub const WL_SECTOR_SIZE: usize = 4096;

/// Size of the WL state header.
pub const WL_STATE_HEADER_LEN: usize = 64;

/// Size of one WL update record.
pub const WL_RECORD_LEN: usize = 16;

/// Supported WL state version.
pub const WL_VERSION: u32 = 2;

const MOVE_COUNT_OFFSET: usize = 8;
const BLOCK_SIZE_OFFSET: usize = 20;
const VERSION_OFFSET: usize = 24;

/// Wear-leveling state of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WearLevel {
    /// Total partition sectors.
    pub total_sectors: u32,
    /// Sectors taken by one state copy.
    pub state_sectors: u32,
    /// Logical sectors visible to the filesystem.
    pub fat_sectors: u32,
    /// Completed rotations of the dummy sector.
    pub move_count: u32,
    /// Written update records in the state.
    pub total_records: u32,
}

/// Size in bytes of one state copy for a partition of `partition_len` bytes.
pub fn state_size(partition_len: usize) -> usize {
    let needed = WL_STATE_HEADER_LEN + (partition_len / WL_SECTOR_SIZE) * WL_RECORD_LEN;
    needed.div_ceil(WL_SECTOR_SIZE).max(1) * WL_SECTOR_SIZE
}

impl WearLevel {
    /// Parse the WL state at the end of `partition`.
    ///
    /// Returns `None` when the partition is too small to hold the WL
    /// metadata or the state header does not carry the expected block size
    /// and version; the caller then treats the partition as plain FAT.
    pub fn parse(partition: &[u8]) -> Option<Self> {
        let len = partition.len();
        let state_len = state_size(len);
        let reserved = 2 * state_len + WL_SECTOR_SIZE;
        // At least one FAT sector plus the dummy sector
        if len < reserved + 2 * WL_SECTOR_SIZE {
            return None;
        }

        let state_offset = len - reserved;
        let state = partition.get(state_offset..state_offset + state_len)?;
        let header = &state[..WL_STATE_HEADER_LEN];

        let block_size = LittleEndian::read_u32(&header[BLOCK_SIZE_OFFSET..]);
        let version = LittleEndian::read_u32(&header[VERSION_OFFSET..]);
        if block_size as usize != WL_SECTOR_SIZE || version != WL_VERSION {
            return None;
        }

        let total_records = state[WL_STATE_HEADER_LEN..]
            .chunks_exact(WL_RECORD_LEN)
            .take_while(|record| record.iter().any(|&b| b != 0xFF))
            .count() as u32;

        Some(Self {
            total_sectors: (len / WL_SECTOR_SIZE) as u32,
            state_sectors: (state_len / WL_SECTOR_SIZE) as u32,
            fat_sectors: ((len - reserved) / WL_SECTOR_SIZE) as u32 - 1,
            move_count: LittleEndian::read_u32(&header[MOVE_COUNT_OFFSET..]),
            total_records,
        })
    }

    /// Map a logical FAT sector to its physical sector in the partition.
    ///
    /// Sectors at or past the dummy position shift up by one to step over it.
    pub fn translate(&self, logical: u32) -> u32 {
        let rotated = (u64::from(logical) + u64::from(self.move_count))
            % u64::from(self.fat_sectors.max(1));
        let mut physical = rotated as u32;
        if physical >= self.total_records {
            physical += 1;
        }
        physical
    }
}
