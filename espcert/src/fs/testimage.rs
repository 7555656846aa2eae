//! Synthetic flash images for detector tests.

use super::wear_level::{WL_SECTOR_SIZE, WL_VERSION, WearLevel};

const SECTOR: usize = WL_SECTOR_SIZE;

/// Flash offset of the synthetic assets partition.
pub const ASSETS_OFFSET: usize = 0x10000;

/// Encode a partition table entry.
pub fn partition_entry(kind: u8, subtype: u8, offset: u32, size: u32, label: &str) -> [u8; 32] {
    let mut raw = [0u8; 32];
    raw[0..2].copy_from_slice(&0x50AAu16.to_le_bytes());
    raw[2] = kind;
    raw[3] = subtype;
    raw[4..8].copy_from_slice(&offset.to_le_bytes());
    raw[8..12].copy_from_slice(&size.to_le_bytes());
    let label = label.as_bytes();
    raw[12..12 + label.len()].copy_from_slice(label);
    raw
}

/// One WL state sector with `records` written update records.
pub fn wl_state_sector(move_count: u32, records: usize, block_size: u32, version: u32) -> Vec<u8> {
    let mut sector = vec![0xFFu8; SECTOR];
    let header = [
        records as u32, // pos
        1000,           // max_pos
        move_count,
        0, // access_count
        16, // max_count
        block_size,
        version,
        0x1234_5678, // device_id
    ];
    for (i, word) in header.iter().enumerate() {
        sector[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    // reserved words and crc
    sector[32..64].fill(0);
    for record in 0..records {
        let start = 64 + record * 16;
        sector[start..start + 16].fill(0);
    }
    sector
}

/// FAT12 boot sector: 4096-byte sectors, 1 sector per cluster, 1 reserved
/// sector, 2 FATs of 1 sector, 128 root entries.
pub fn boot_sector(total_sectors: u16) -> Vec<u8> {
    let mut boot = vec![0u8; SECTOR];
    boot[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
    boot[3..11].copy_from_slice(b"MSDOS5.0");
    boot[11..13].copy_from_slice(&4096u16.to_le_bytes());
    boot[13] = 1;
    boot[14..16].copy_from_slice(&1u16.to_le_bytes());
    boot[16] = 2;
    boot[17..19].copy_from_slice(&128u16.to_le_bytes());
    boot[19..21].copy_from_slice(&total_sectors.to_le_bytes());
    boot[21] = 0xF8;
    boot[22..24].copy_from_slice(&1u16.to_le_bytes());
    boot[54..62].copy_from_slice(b"FAT12   ");
    boot[510] = 0x55;
    boot[511] = 0xAA;
    boot
}

fn short_name(name: &str) -> [u8; 11] {
    let mut raw = [b' '; 11];
    if name == "." || name == ".." {
        raw[..name.len()].copy_from_slice(name.as_bytes());
        return raw;
    }
    let (base, ext) = name.split_once('.').unwrap_or((name, ""));
    raw[..base.len()].copy_from_slice(base.as_bytes());
    raw[8..8 + ext.len()].copy_from_slice(ext.as_bytes());
    raw
}

/// Builds a small FAT12 volume sector by sector.
pub struct FatBuilder {
    sectors: Vec<Vec<u8>>,
    fat: Vec<u8>,
    next_cluster: u16,
    root_used: usize,
}

const ROOT_SECTOR: usize = 3;
const DATA_START: usize = 4;

impl FatBuilder {
    pub fn new(total_sectors: u16) -> Self {
        let mut sectors = vec![vec![0u8; SECTOR]; usize::from(total_sectors)];
        sectors[0] = boot_sector(total_sectors);
        let mut builder = Self {
            sectors,
            fat: vec![0u8; SECTOR],
            next_cluster: 2,
            root_used: 0,
        };
        builder.set_fat(0, 0xFF8);
        builder.set_fat(1, 0xFFF);
        builder
    }

    pub fn set_fat(&mut self, cluster: u16, value: u16) {
        let offset = usize::from(cluster) + usize::from(cluster) / 2;
        let mut pair = u16::from_le_bytes([self.fat[offset], self.fat[offset + 1]]);
        if cluster & 1 == 1 {
            pair = (pair & 0x000F) | (value << 4);
        } else {
            pair = (pair & 0xF000) | (value & 0x0FFF);
        }
        self.fat[offset..offset + 2].copy_from_slice(&pair.to_le_bytes());
    }

    fn alloc(&mut self) -> u16 {
        let cluster = self.next_cluster;
        self.next_cluster += 1;
        self.set_fat(cluster, 0xFFF);
        cluster
    }

    fn cluster_sector(cluster: u16) -> usize {
        DATA_START + usize::from(cluster) - 2
    }

    fn write_entry(sector: &mut [u8], index: usize, name: &str, attr: u8, cluster: u16, size: u32) {
        let raw = &mut sector[index * 32..index * 32 + 32];
        raw[..11].copy_from_slice(&short_name(name));
        raw[11] = attr;
        raw[26..28].copy_from_slice(&cluster.to_le_bytes());
        raw[28..32].copy_from_slice(&size.to_le_bytes());
    }

    fn add_root_entry(&mut self, name: &str, attr: u8, cluster: u16, size: u32) {
        let index = self.root_used;
        self.root_used += 1;
        Self::write_entry(&mut self.sectors[ROOT_SECTOR], index, name, attr, cluster, size);
    }

    /// Add a volume label and a `CERT` directory holding `files`.
    pub fn add_cert_dir(&mut self, files: &[&str]) {
        self.add_root_entry("ESPCERT", 0x08, 0, 0);
        // A long-name fragment before the real entry
        let index = self.root_used;
        self.root_used += 1;
        let lfn = &mut self.sectors[ROOT_SECTOR][index * 32..index * 32 + 32];
        lfn[0] = 0x41;
        lfn[11] = 0x0F;
        self.add_named_dir("CERT", files);
    }

    /// Add a directory named `name` holding `files`.
    pub fn add_named_dir(&mut self, name: &str, files: &[&str]) {
        let dir_cluster = self.alloc();
        self.add_root_entry(name, 0x10, dir_cluster, 0);

        let mut entries = vec![(".".to_string(), 0x10u8, dir_cluster, 0u32)];
        entries.push(("..".to_string(), 0x10, 0, 0));
        // A deleted entry the walker must skip
        entries.push(("OLD.DER".to_string(), 0x20, 0, 0));
        let deleted_index = entries.len() - 1;

        for file in files {
            let cluster = self.alloc();
            let contents = format!("contents of {file}");
            let sector = Self::cluster_sector(cluster);
            self.sectors[sector][..contents.len()].copy_from_slice(contents.as_bytes());
            entries.push(((*file).to_string(), 0x20, cluster, contents.len() as u32));
        }

        let sector = &mut self.sectors[Self::cluster_sector(dir_cluster)];
        for (index, (name, attr, cluster, size)) in entries.iter().enumerate() {
            Self::write_entry(sector, index, name, *attr, *cluster, *size);
        }
        sector[deleted_index * 32] = 0xE5;
    }

    /// Add a plain file to the root directory.
    pub fn add_root_file(&mut self, name: &str) {
        let cluster = self.alloc();
        self.add_root_entry(name, 0x20, cluster, 1);
    }

    /// Logical sectors of the volume.
    fn logical_sectors(&self) -> Vec<Vec<u8>> {
        let mut sectors = self.sectors.clone();
        sectors[1].clone_from(&self.fat);
        sectors[2].clone_from(&self.fat);
        sectors
    }

    /// The volume as a plain (not wear-leveled) partition.
    pub fn build(&self) -> Vec<u8> {
        self.logical_sectors().concat()
    }

    /// The volume wrapped in a WL layer with the given state.
    pub fn build_wear_leveled(&self, move_count: u32, records: usize) -> Vec<u8> {
        let logical = self.logical_sectors();
        let fat_sectors = logical.len() as u32;
        let wl = WearLevel {
            total_sectors: fat_sectors + 4,
            state_sectors: 1,
            fat_sectors,
            move_count,
            total_records: records as u32,
        };

        let mut partition = vec![0xFFu8; (logical.len() + 4) * SECTOR];
        for (index, sector) in logical.iter().enumerate() {
            let physical = wl.translate(index as u32) as usize * SECTOR;
            partition[physical..physical + SECTOR].copy_from_slice(sector);
        }

        let state = wl_state_sector(move_count, records, SECTOR as u32, WL_VERSION);
        let state_start = (logical.len() + 1) * SECTOR;
        partition[state_start..state_start + SECTOR].copy_from_slice(&state);
        partition[state_start + SECTOR..state_start + 2 * SECTOR].copy_from_slice(&state);
        partition
    }
}

/// A flash image with a partition table at 0x9000 and `partition` as the
/// data partition labelled `label`.
pub fn flash_image(partition: &[u8], label: &str) -> Vec<u8> {
    let mut flash = vec![0xFFu8; ASSETS_OFFSET + partition.len()];
    let entries = [
        partition_entry(1, 0x02, 0xA000, 0x5000, "nvs"),
        partition_entry(1, 0x01, 0xF000, 0x1000, "phy_init"),
        partition_entry(1, 0x81, ASSETS_OFFSET as u32, partition.len() as u32, label),
    ];
    for (i, entry) in entries.iter().enumerate() {
        let start = 0x9000 + i * 32;
        flash[start..start + 32].copy_from_slice(entry);
    }
    flash[ASSETS_OFFSET..].copy_from_slice(partition);
    flash
}
