//! Read-only FAT12 access over a (possibly wear-leveled) partition.
//!
//! Only what the certificate check needs: the boot sector, FAT12 cluster
//! chains and 8.3 directory entries.

use byteorder::{ByteOrder, LittleEndian};

use super::RecognitionFailure;
use super::wear_level::{WL_SECTOR_SIZE, WearLevel};

/// Supported bytes per sector.
pub const SECTOR_SIZE: u16 = WL_SECTOR_SIZE as u16;

/// FAT12 volumes have fewer clusters than this.
pub const FAT12_MAX_CLUSTERS: u32 = 4085;

/// FAT12 entries at or above this value end a chain.
pub const FAT12_EOC: u16 = 0xFF8;

const DIR_ENTRY_LEN: usize = 32;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = 0x0F;
const ENTRY_FREE: u8 = 0xE5;
const ENTRY_END: u8 = 0x00;

/// BIOS parameter block fields used by the walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bpb {
    /// Bytes per sector.
    pub bytes_per_sector: u16,
    /// Sectors per cluster.
    pub sectors_per_cluster: u8,
    /// Reserved sectors before the first FAT.
    pub reserved_sectors: u16,
    /// Number of FAT copies.
    pub fat_count: u8,
    /// Root directory entry slots.
    pub root_entries: u16,
    /// Total sectors in the volume.
    pub total_sectors: u32,
    /// Sectors per FAT.
    pub fat_size: u16,
}

impl Bpb {
    /// Parse and validate a FAT12 boot sector with 4096-byte sectors.
    pub fn parse(boot: &[u8]) -> Result<Self, RecognitionFailure> {
        let unsupported = |reason: String| Err(RecognitionFailure::UnsupportedFilesystem(reason));

        if boot.len() < 512 {
            return unsupported("boot sector is truncated".into());
        }
        if boot[510] != 0x55 || boot[511] != 0xAA {
            return unsupported("missing boot sector signature".into());
        }
        if !matches!(boot[0], 0xEB | 0xE9) {
            return unsupported(format!("boot sector starts with 0x{:02X}", boot[0]));
        }

        let bytes_per_sector = LittleEndian::read_u16(&boot[11..]);
        if bytes_per_sector != SECTOR_SIZE {
            return unsupported(format!("{bytes_per_sector}-byte sectors"));
        }

        let sectors_per_cluster = boot[13];
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return unsupported(format!("{sectors_per_cluster} sectors per cluster"));
        }

        let fat_size = LittleEndian::read_u16(&boot[22..]);
        let root_entries = LittleEndian::read_u16(&boot[17..]);
        if fat_size == 0 || root_entries == 0 {
            return unsupported("FAT32 layout".into());
        }

        let fat_count = boot[16];
        if fat_count == 0 {
            return unsupported("no FAT copies".into());
        }

        let total16 = LittleEndian::read_u16(&boot[19..]);
        let total_sectors = if total16 != 0 {
            u32::from(total16)
        } else {
            LittleEndian::read_u32(&boot[32..])
        };

        let bpb = Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors: LittleEndian::read_u16(&boot[14..]),
            fat_count,
            root_entries,
            total_sectors,
            fat_size,
        };

        if bpb.data_start() >= total_sectors {
            return unsupported("data region lies past the end of the volume".into());
        }
        let clusters = bpb.cluster_count();
        if clusters >= FAT12_MAX_CLUSTERS {
            return unsupported(format!("{clusters} clusters is not FAT12"));
        }
        Ok(bpb)
    }

    /// First sector of the root directory.
    pub fn root_start(&self) -> u32 {
        u32::from(self.reserved_sectors) + u32::from(self.fat_count) * u32::from(self.fat_size)
    }

    /// Sectors occupied by the root directory.
    pub fn root_sectors(&self) -> u32 {
        (u32::from(self.root_entries) * DIR_ENTRY_LEN as u32)
            .div_ceil(u32::from(self.bytes_per_sector))
    }

    /// First sector of the data region (cluster 2).
    pub fn data_start(&self) -> u32 {
        self.root_start() + self.root_sectors()
    }

    /// Number of data clusters.
    pub fn cluster_count(&self) -> u32 {
        self.total_sectors.saturating_sub(self.data_start()) / u32::from(self.sectors_per_cluster)
    }
}

/// A short-name directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// `NAME.EXT` with padding removed.
    pub name: String,
    /// Attribute byte.
    pub attributes: u8,
    /// First cluster of the contents.
    pub first_cluster: u16,
    /// File size in bytes.
    pub size: u32,
}

impl DirEntry {
    /// Whether this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    /// Case-insensitive name comparison.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    fn parse(raw: &[u8]) -> Self {
        let mut base = raw[..8].to_vec();
        if base[0] == 0x05 {
            base[0] = ENTRY_FREE;
        }
        let base = String::from_utf8_lossy(&base).trim_end().to_string();
        let ext = String::from_utf8_lossy(&raw[8..11]).trim_end().to_string();
        let name = if ext.is_empty() {
            base
        } else {
            format!("{base}.{ext}")
        };

        Self {
            name,
            attributes: raw[11],
            first_cluster: LittleEndian::read_u16(&raw[26..]),
            size: LittleEndian::read_u32(&raw[28..]),
        }
    }
}

/// A FAT12 volume inside a partition.
#[derive(Debug)]
pub struct Volume<'a> {
    partition: &'a [u8],
    wear_level: Option<WearLevel>,
    bpb: Bpb,
}

impl<'a> Volume<'a> {
    /// Open the volume, translating sectors through `wear_level` if given.
    pub fn open(partition: &'a [u8], wear_level: Option<WearLevel>) -> Result<Self, RecognitionFailure> {
        let boot = sector(partition, wear_level.as_ref(), 0)?;
        let bpb = Bpb::parse(boot)?;
        Ok(Self {
            partition,
            wear_level,
            bpb,
        })
    }

    /// Boot sector parameters.
    pub fn bpb(&self) -> &Bpb {
        &self.bpb
    }

    fn sector(&self, logical: u32) -> Result<&'a [u8], RecognitionFailure> {
        sector(self.partition, self.wear_level.as_ref(), logical)
    }

    /// FAT12 entry for `cluster`.
    pub fn fat_entry(&self, cluster: u16) -> Result<u16, RecognitionFailure> {
        let offset = usize::from(cluster) + usize::from(cluster) / 2;
        let lo = self.fat_byte(offset)?;
        let hi = self.fat_byte(offset + 1)?;
        let pair = u16::from_le_bytes([lo, hi]);
        Ok(if cluster & 1 == 1 {
            pair >> 4
        } else {
            pair & 0x0FFF
        })
    }

    fn fat_byte(&self, offset: usize) -> Result<u8, RecognitionFailure> {
        let bps = usize::from(self.bpb.bytes_per_sector);
        if offset >= usize::from(self.bpb.fat_size) * bps {
            return Err(corrupt(format!("FAT offset {offset} past the table")));
        }
        let sector = self.sector(u32::from(self.bpb.reserved_sectors) + (offset / bps) as u32)?;
        Ok(sector[offset % bps])
    }

    /// Clusters of the chain starting at `first`.
    pub fn chain(&self, first: u16) -> Result<Vec<u16>, RecognitionFailure> {
        let limit = self.bpb.cluster_count() + 2;
        let mut clusters = Vec::new();
        let mut cluster = first;

        loop {
            if cluster < 2 || u32::from(cluster) >= limit {
                return Err(corrupt(format!("cluster {cluster} out of range")));
            }
            if clusters.len() as u32 >= limit {
                return Err(corrupt(format!("cluster chain from {first} loops")));
            }
            clusters.push(cluster);

            let next = self.fat_entry(cluster)?;
            if next >= FAT12_EOC {
                return Ok(clusters);
            }
            cluster = next;
        }
    }

    /// Entries of the root directory.
    pub fn root_dir(&self) -> Result<Vec<DirEntry>, RecognitionFailure> {
        let start = self.bpb.root_start();
        let sectors: Vec<u32> = (start..start + self.bpb.root_sectors()).collect();
        self.read_dir(&sectors)
    }

    /// Entries of the subdirectory described by `dir`.
    pub fn sub_dir(&self, dir: &DirEntry) -> Result<Vec<DirEntry>, RecognitionFailure> {
        let spc = u32::from(self.bpb.sectors_per_cluster);
        let data_start = self.bpb.data_start();
        let sectors: Vec<u32> = self
            .chain(dir.first_cluster)?
            .into_iter()
            .flat_map(|c| {
                let first = data_start + (u32::from(c) - 2) * spc;
                first..first + spc
            })
            .collect();
        self.read_dir(&sectors)
    }

    fn read_dir(&self, sectors: &[u32]) -> Result<Vec<DirEntry>, RecognitionFailure> {
        let mut entries = Vec::new();
        for &logical in sectors {
            for raw in self.sector(logical)?.chunks_exact(DIR_ENTRY_LEN) {
                match raw[0] {
                    ENTRY_END => return Ok(entries),
                    ENTRY_FREE => continue,
                    _ => {},
                }
                let attributes = raw[11];
                if attributes == ATTR_LONG_NAME || attributes & ATTR_VOLUME_ID != 0 {
                    continue;
                }
                entries.push(DirEntry::parse(raw));
            }
        }
        Ok(entries)
    }
}

fn sector<'a>(
    partition: &'a [u8],
    wear_level: Option<&WearLevel>,
    logical: u32,
) -> Result<&'a [u8], RecognitionFailure> {
    let physical = wear_level.map_or(logical, |wl| wl.translate(logical));
    let start = physical as usize * WL_SECTOR_SIZE;
    partition
        .get(start..start + WL_SECTOR_SIZE)
        .ok_or_else(|| corrupt(format!("sector {logical} (physical {physical}) past the partition")))
}

fn corrupt(reason: String) -> RecognitionFailure {
    RecognitionFailure::CorruptFilesystem(reason)
}
