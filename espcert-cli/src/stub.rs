//! Stub manifests.
//!
//! A stub lives in a directory as `<chip>.toml` plus the binaries it names:
//!
//! ```toml
//! entry = 0x4037_8D18
//!
//! [text]
//! address = 0x4037_8000
//! file = "esp32s3-text.bin"
//!
//! [data]
//! address = 0x3FCB_4000
//! file = "esp32s3-data.bin"
//! ```
//!
//! Relative file paths resolve against the manifest's directory. A manifest
//! found this way overrides the stub compiled into the library.

use anyhow::{Context, Result};
use espcert::{ChipKind, EmbeddedStub, Segment, StubImage};
use log::debug;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// One segment entry of a manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct SegmentSpec {
    /// Load address.
    pub address: u32,
    /// Binary file with the segment contents.
    pub file: PathBuf,
}

/// Parsed `<chip>.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct StubManifest {
    /// Entry point.
    pub entry: u32,
    /// Code segment.
    pub text: SegmentSpec,
    /// Data segment, if the stub has one.
    pub data: Option<SegmentSpec>,
}

impl StubManifest {
    /// Parse a manifest file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read stub manifest {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid stub manifest {}", path.display()))
    }

    /// Read the segment binaries and build the image.
    pub fn into_image(self, base: &Path) -> Result<StubImage> {
        let text = read_segment(base, &self.text)?;
        let data = match &self.data {
            Some(spec) => read_segment(base, spec)?,
            None => Segment::new(0, Vec::new()),
        };
        Ok(StubImage::new(text, data, self.entry)?)
    }
}

fn read_segment(base: &Path, spec: &SegmentSpec) -> Result<Segment> {
    let path = base.join(&spec.file);
    let bytes = fs::read(&path)
        .with_context(|| format!("Failed to read stub segment {}", path.display()))?;
    debug!(
        "Stub segment {} ({} bytes) at 0x{:08X}",
        path.display(),
        bytes.len(),
        spec.address
    );
    Ok(Segment::new(spec.address, bytes))
}

/// Path of the manifest for `chip` in `dir`.
pub fn manifest_path(dir: &Path, chip: ChipKind) -> PathBuf {
    dir.join(format!("{}.toml", chip.name()))
}

/// Load the stub for `chip` from `dir`.
pub fn load_stub(dir: &Path, chip: ChipKind) -> Result<StubImage> {
    let path = manifest_path(dir, chip);
    if !path.exists() {
        anyhow::bail!(
            "No stub for {chip}: {} does not exist (set [stub] dir in espcert.toml)",
            path.display()
        );
    }
    let base = path.parent().unwrap_or(dir).to_path_buf();
    StubManifest::from_file(&path)?.into_image(&base)
}

/// Pick the stub for `chip`: a manifest in `dir` wins over the embedded one.
pub fn select_stub(
    dir: Option<&Path>,
    chip: ChipKind,
    embedded: Option<&EmbeddedStub>,
) -> Result<StubImage> {
    if let Some(dir) = dir.filter(|dir| manifest_path(dir, chip).exists()) {
        debug!("Using stub override from {}", dir.display());
        return load_stub(dir, chip);
    }
    match embedded {
        Some(stub) => Ok(stub.image()),
        None => anyhow::bail!(
            "No stub for {chip}: none is built in and no {}.toml override was found \
             (set [stub] dir in espcert.toml)",
            chip.name()
        ),
    }
}

/// Stub for `chip`, from the override directory or the built-in table.
pub fn resolve_stub(dir: Option<&Path>, chip: ChipKind) -> Result<StubImage> {
    select_stub(dir, chip, chip.profile().stub.as_ref())
}
