//! Certificate detector for raw flash dumps.
//!
//! [`detect`] walks the partition table, finds the assets partition, undoes
//! wear leveling if present and checks that the FAT12 volume inside holds
//! `CERT/CA.DER`, `CERT/CLIENT.DER` and `CERT/PRIVATE.DER`.
//!
//! Dumps come from users, so nothing here panics on malformed input: every
//! problem is reported as a [`RecognitionFailure`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use espcert::diag::LogSink;
//! use espcert::fs::{DetectOptions, detect};
//!
//! let dump = std::fs::read("flash.bin")?;
//! match detect(&dump, &DetectOptions::default(), &LogSink) {
//!     Ok(report) if report.ok => println!("certificates present"),
//!     Ok(report) => println!("missing: {:?}", report.missing()),
//!     Err(reason) => println!("not recognized: {reason}"),
//! }
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod fat;
pub mod partition;
pub mod wear_level;

#[cfg(test)]
pub(crate) mod testimage;

use thiserror::Error;

use crate::diag::DiagnosticSink;
use fat::Volume;
use partition::{PARTITION_TABLE_OFFSET, PartitionEntry};
use wear_level::WearLevel;

/// Directory holding the certificates.
pub const CERTIFICATE_DIR: &str = "CERT";

/// Files that must be present in [`CERTIFICATE_DIR`].
pub const CERTIFICATE_FILES: [&str; 3] = ["CA.DER", "CLIENT.DER", "PRIVATE.DER"];

/// Default label of the assets partition.
pub const DEFAULT_ASSETS_LABEL: &str = "assets";

/// Why a dump could not be checked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecognitionFailure {
    /// The dump ends before the partition table.
    #[error("dump is {len} bytes; no partition table fits at 0x{offset:X}")]
    TableOutOfRange {
        /// Table offset searched.
        offset: usize,
        /// Dump length.
        len: usize,
    },

    /// No partition has the requested label.
    #[error("no partition labelled '{label}' among {count} partitions")]
    PartitionNotFound {
        /// Label searched for.
        label: String,
        /// Partitions found in the table.
        count: usize,
    },

    /// The partition extends past the end of the dump.
    #[error("partition '{label}' spans 0x{offset:X}..0x{end:X} but the dump is 0x{len:X} bytes")]
    PartitionOutOfRange {
        /// Partition label.
        label: String,
        /// Partition offset.
        offset: u32,
        /// End of the partition.
        end: u64,
        /// Dump length.
        len: usize,
    },

    /// The partition does not hold a supported filesystem.
    #[error("filesystem not recognized: {0}")]
    UnsupportedFilesystem(String),

    /// The filesystem structures are inconsistent.
    #[error("corrupt filesystem: {0}")]
    CorruptFilesystem(String),
}

/// Detector options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectOptions {
    /// Flash offset of the partition table.
    pub table_offset: usize,
    /// Label of the partition holding the certificates.
    pub label: String,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            table_offset: PARTITION_TABLE_OFFSET,
            label: DEFAULT_ASSETS_LABEL.to_string(),
        }
    }
}

/// Presence of one certificate file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateFile {
    /// File name.
    pub name: &'static str,
    /// Whether the file exists.
    pub present: bool,
    /// File size, if present.
    pub size: Option<u32>,
}

/// Outcome of a successful walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateReport {
    /// The partition that was examined.
    pub partition: PartitionEntry,
    /// Whether a wear-leveling layer was found.
    pub wear_leveled: bool,
    /// Whether the `CERT` directory exists.
    pub cert_directory: bool,
    /// One entry per expected file, in [`CERTIFICATE_FILES`] order.
    pub files: Vec<CertificateFile>,
    /// True only if the directory and all files are present.
    pub ok: bool,
}

impl CertificateReport {
    /// Names of the files that are absent.
    pub fn missing(&self) -> Vec<&'static str> {
        self.files
            .iter()
            .filter(|f| !f.present)
            .map(|f| f.name)
            .collect()
    }
}

/// Check a raw flash dump for the certificate files.
pub fn detect(
    flash: &[u8],
    options: &DetectOptions,
    sink: &dyn DiagnosticSink,
) -> Result<CertificateReport, RecognitionFailure> {
    let result = detect_inner(flash, options, sink);
    match &result {
        Ok(report) if report.ok => sink.debug("All certificate files present"),
        Ok(report) => sink.error(&format!(
            "Certificate check failed; missing: {}",
            report.missing().join(", ")
        )),
        Err(reason) => sink.error(&format!("Flash dump not recognized: {reason}")),
    }
    result
}

fn detect_inner(
    flash: &[u8],
    options: &DetectOptions,
    sink: &dyn DiagnosticSink,
) -> Result<CertificateReport, RecognitionFailure> {
    let table = partition::read_table(flash, options.table_offset, sink)?;
    let entry = table
        .iter()
        .find(|e| e.label == options.label)
        .cloned()
        .ok_or_else(|| RecognitionFailure::PartitionNotFound {
            label: options.label.clone(),
            count: table.len(),
        })?;

    if entry.end() > flash.len() as u64 {
        return Err(RecognitionFailure::PartitionOutOfRange {
            label: entry.label.clone(),
            offset: entry.offset,
            end: entry.end(),
            len: flash.len(),
        });
    }
    if entry.is_encrypted() {
        return Err(RecognitionFailure::UnsupportedFilesystem(
            "partition is encrypted".into(),
        ));
    }

    let data = &flash[entry.offset as usize..entry.end() as usize];
    let wear_level = WearLevel::parse(data);
    match &wear_level {
        Some(wl) => sink.debug(&format!(
            "Wear leveling: {} FAT sectors, move count {}, {} records",
            wl.fat_sectors, wl.move_count, wl.total_records
        )),
        None => sink.debug("No wear-leveling state; reading partition as plain FAT"),
    }

    let volume = Volume::open(data, wear_level)?;
    let root = volume.root_dir()?;

    let Some(cert_dir) = root
        .iter()
        .find(|e| e.is_dir() && e.is_named(CERTIFICATE_DIR))
    else {
        sink.debug(&format!(
            "No {CERTIFICATE_DIR} directory among {} root entries",
            root.len()
        ));
        return Ok(CertificateReport {
            partition: entry,
            wear_leveled: wear_level.is_some(),
            cert_directory: false,
            files: CERTIFICATE_FILES
                .iter()
                .map(|&name| CertificateFile {
                    name,
                    present: false,
                    size: None,
                })
                .collect(),
            ok: false,
        });
    };

    let entries = volume.sub_dir(cert_dir)?;
    let files: Vec<CertificateFile> = CERTIFICATE_FILES
        .iter()
        .map(|&name| {
            let found = entries.iter().find(|e| !e.is_dir() && e.is_named(name));
            CertificateFile {
                name,
                present: found.is_some(),
                size: found.map(|e| e.size),
            }
        })
        .collect();
    let ok = files.iter().all(|f| f.present);

    Ok(CertificateReport {
        partition: entry,
        wear_leveled: wear_level.is_some(),
        cert_directory: true,
        files,
        ok,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::{Level, MemorySink};
    use testimage::{FatBuilder, flash_image};

    fn run(flash: &[u8]) -> Result<CertificateReport, RecognitionFailure> {
        detect(flash, &DetectOptions::default(), &MemorySink::new())
    }

    fn volume_with(files: &[&str]) -> FatBuilder {
        let mut builder = FatBuilder::new(28);
        builder.add_cert_dir(files);
        builder
    }

    #[test]
    fn test_all_certificates_present_wear_leveled() {
        let partition = volume_with(&CERTIFICATE_FILES).build_wear_leveled(0, 0);
        let report = run(&flash_image(&partition, "assets")).unwrap();

        assert!(report.ok);
        assert!(report.wear_leveled);
        assert!(report.cert_directory);
        assert!(report.missing().is_empty());
        assert!(report.files.iter().all(|f| f.size.is_some()));
    }

    #[test]
    fn test_rotated_wear_leveling() {
        for (move_count, records) in [(3, 5), (27, 2), (13, 27)] {
            let partition = volume_with(&CERTIFICATE_FILES).build_wear_leveled(move_count, records);
            let report = run(&flash_image(&partition, "assets")).unwrap();
            assert!(report.ok, "move_count {move_count}, records {records}");
        }
    }

    #[test]
    fn test_plain_fat_partition() {
        let partition = volume_with(&CERTIFICATE_FILES).build();
        let report = run(&flash_image(&partition, "assets")).unwrap();
        assert!(report.ok);
        assert!(!report.wear_leveled);
    }

    #[test]
    fn test_each_missing_file_is_reported() {
        for missing in CERTIFICATE_FILES {
            let present: Vec<&str> = CERTIFICATE_FILES
                .iter()
                .copied()
                .filter(|&f| f != missing)
                .collect();
            let partition = volume_with(&present).build_wear_leveled(0, 0);
            let report = run(&flash_image(&partition, "assets")).unwrap();

            assert!(!report.ok);
            assert_eq!(report.missing(), vec![missing]);
        }
    }

    #[test]
    fn test_names_match_case_insensitively() {
        let partition = volume_with(&["ca.der", "Client.der", "PRIVATE.der"]).build();
        assert!(run(&flash_image(&partition, "assets")).unwrap().ok);
    }

    #[test]
    fn test_missing_cert_directory() {
        let mut builder = FatBuilder::new(28);
        builder.add_named_dir("KEYS", &CERTIFICATE_FILES);
        // A file called CERT is not the directory
        builder.add_root_file("CERT");
        let report = run(&flash_image(&builder.build(), "assets")).unwrap();

        assert!(!report.ok);
        assert!(!report.cert_directory);
        assert_eq!(report.missing().len(), 3);
    }

    #[test]
    fn test_partition_not_found() {
        let partition = volume_with(&CERTIFICATE_FILES).build();
        let sink = MemorySink::new();
        let result = detect(
            &flash_image(&partition, "storage"),
            &DetectOptions::default(),
            &sink,
        );

        assert_eq!(
            result.unwrap_err(),
            RecognitionFailure::PartitionNotFound {
                label: "assets".into(),
                count: 3,
            }
        );
        assert_eq!(sink.messages(Level::Error).len(), 1);
    }

    #[test]
    fn test_custom_label() {
        let partition = volume_with(&CERTIFICATE_FILES).build();
        let options = DetectOptions {
            label: "storage".into(),
            ..DetectOptions::default()
        };
        let report = detect(
            &flash_image(&partition, "storage"),
            &options,
            &MemorySink::new(),
        )
        .unwrap();
        assert!(report.ok);
    }

    #[test]
    fn test_truncated_dump() {
        let partition = volume_with(&CERTIFICATE_FILES).build();
        let mut flash = flash_image(&partition, "assets");
        flash.truncate(flash.len() - 4096);

        assert!(matches!(
            run(&flash),
            Err(RecognitionFailure::PartitionOutOfRange { .. })
        ));
    }

    #[test]
    fn test_unformatted_partition() {
        let partition = vec![0xFFu8; 32 * 4096];
        assert!(matches!(
            run(&flash_image(&partition, "assets")),
            Err(RecognitionFailure::UnsupportedFilesystem(_))
        ));
    }

    #[test]
    fn test_garbage_never_panics() {
        assert!(run(&[]).is_err());
        assert!(run(&[0u8; 0x9000]).is_err());

        let mut seed = 0x1234_5678u32;
        let mut noise = vec![0u8; 0x20000];
        for byte in &mut noise {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            *byte = (seed >> 16) as u8;
        }
        let _ = run(&noise);

        // Valid table pointing at noise
        let mut flash = flash_image(&noise[..0x10000], "assets");
        flash[0x10000..].copy_from_slice(&noise[0x10000..0x20000]);
        let _ = run(&flash);
    }
}
