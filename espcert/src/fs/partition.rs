//! ESP-IDF partition table.
//!
//! ## Entry Format (32 bytes)
//!
//! ```text
//! +--------+------+---------+--------+------+------------+-------+
//! | magic  | type | subtype | offset | size |   label    | flags |
//! +--------+------+---------+--------+------+------------+-------+
//! |   2    |  1   |    1    |   4    |  4   |     16     |   4   |
//! +--------+------+---------+--------+------+------------+-------+
//! ```
//!
//! All integers are little-endian. The label is NUL-padded ASCII.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};

use super::RecognitionFailure;
use crate::diag::DiagnosticSink;

/// Default flash offset of the partition table.
pub const PARTITION_TABLE_OFFSET: usize = 0x9000;

/// Largest table the bootloader accepts.
pub const PARTITION_TABLE_MAX_LEN: usize = 0xC00;

/// Size of one entry.
pub const ENTRY_LEN: usize = 32;

/// Magic marking a partition entry.
pub const ENTRY_MAGIC: u16 = 0x50AA;

/// Magic marking the optional MD5 entry that closes the table.
pub const MD5_MAGIC: u16 = 0xEBEB;

/// Partition type `data`.
pub const TYPE_DATA: u8 = 0x01;

/// Data subtype `fat`.
pub const SUBTYPE_FAT: u8 = 0x81;

const LABEL_LEN: usize = 16;

/// One partition table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    /// Partition type (0 app, 1 data).
    pub kind: u8,
    /// Partition subtype.
    pub subtype: u8,
    /// Absolute flash offset.
    pub offset: u32,
    /// Size in bytes.
    pub size: u32,
    /// Label.
    pub label: String,
    /// Flags (bit 0: encrypted).
    pub flags: u32,
}

impl PartitionEntry {
    /// Parse an entry; `None` if the magic is wrong.
    pub fn parse(raw: &[u8; ENTRY_LEN]) -> Option<Self> {
        Self::read_from(&mut &raw[..]).ok().flatten()
    }

    fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Option<Self>> {
        let magic = reader.read_u16::<LittleEndian>()?;
        if magic != ENTRY_MAGIC {
            return Ok(None);
        }
        let kind = reader.read_u8()?;
        let subtype = reader.read_u8()?;
        let offset = reader.read_u32::<LittleEndian>()?;
        let size = reader.read_u32::<LittleEndian>()?;

        let mut label_bytes = [0u8; LABEL_LEN];
        reader.read_exact(&mut label_bytes)?;
        let label_end = label_bytes
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(LABEL_LEN);
        let label = String::from_utf8_lossy(&label_bytes[..label_end]).to_string();

        let flags = reader.read_u32::<LittleEndian>()?;

        Ok(Some(Self {
            kind,
            subtype,
            offset,
            size,
            label,
            flags,
        }))
    }

    /// One past the last byte of the partition.
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.size)
    }

    /// Whether this is a FAT data partition.
    pub fn is_fat(&self) -> bool {
        self.kind == TYPE_DATA && self.subtype == SUBTYPE_FAT
    }

    /// Whether the encrypted flag is set.
    pub fn is_encrypted(&self) -> bool {
        self.flags & 1 != 0
    }
}

/// Read the partition table at `offset` in `flash`.
///
/// Scanning stops at the first erased entry, at the MD5 entry, at any other
/// entry without the magic, or after [`PARTITION_TABLE_MAX_LEN`] bytes.
pub fn read_table(
    flash: &[u8],
    offset: usize,
    sink: &dyn DiagnosticSink,
) -> Result<Vec<PartitionEntry>, RecognitionFailure> {
    if offset.saturating_add(ENTRY_LEN) > flash.len() {
        return Err(RecognitionFailure::TableOutOfRange {
            offset,
            len: flash.len(),
        });
    }

    let end = (offset + PARTITION_TABLE_MAX_LEN).min(flash.len());
    let mut entries = Vec::new();

    for raw in flash[offset..end].chunks_exact(ENTRY_LEN) {
        if raw.iter().all(|&b| b == 0xFF) {
            break;
        }
        let magic = u16::from_le_bytes([raw[0], raw[1]]);
        if magic == MD5_MAGIC {
            sink.debug("Partition table closed by MD5 entry");
            break;
        }

        let mut entry_bytes = [0u8; ENTRY_LEN];
        entry_bytes.copy_from_slice(raw);
        match PartitionEntry::parse(&entry_bytes) {
            Some(entry) => entries.push(entry),
            None => {
                sink.debug(&format!(
                    "Partition table ends at invalid entry with magic 0x{magic:04X}"
                ));
                break;
            },
        }
    }

    sink.debug(&format!(
        "Found {} partitions at 0x{offset:X}",
        entries.len()
    ));
    Ok(entries)
}
