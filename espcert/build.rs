//! Build script for espcert: embeds the flasher stubs found in `stubs/`.
//!
//! `stubs/<chip>.toml` uses the same manifest format as a runtime stub
//! directory. The generated `stubs.rs` holds one `Option<EmbeddedStub>` per
//! chip, `None` when no manifest is present.

use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

const CHIPS: [&str; 4] = ["esp32", "esp32s2", "esp32s3", "esp32c3"];

#[derive(Deserialize)]
struct SegmentSpec {
    address: u32,
    file: PathBuf,
}

#[derive(Deserialize)]
struct Manifest {
    entry: u32,
    text: SegmentSpec,
    data: Option<SegmentSpec>,
}

/// Load address and an `include_bytes!` expression for one segment.
fn segment(dir: &Path, spec: &SegmentSpec) -> (u32, String) {
    let path = dir.join(&spec.file);
    let path = path
        .canonicalize()
        .unwrap_or_else(|e| panic!("stub segment {}: {e}", path.display()));
    let len = fs::metadata(&path).map_or(0, |meta| meta.len());
    assert!(len > 0, "stub segment {} is empty", path.display());
    println!("cargo:rerun-if-changed={}", path.display());
    (
        spec.address,
        format!("include_bytes!({:?})", path.display().to_string()),
    )
}

fn embed(dir: &Path, chip: &str, manifest_path: &Path) -> String {
    let content = fs::read_to_string(manifest_path)
        .unwrap_or_else(|e| panic!("{}: {e}", manifest_path.display()));
    let manifest: Manifest = toml::from_str(&content)
        .unwrap_or_else(|e| panic!("{}: {e}", manifest_path.display()));
    assert!(manifest.entry != 0, "{chip} stub entry point is zero");

    let (text_address, text) = segment(dir, &manifest.text);
    let (data_address, data) = match &manifest.data {
        Some(spec) => segment(dir, spec),
        None => (0, "&[]".to_string()),
    };
    format!(
        "Some(EmbeddedStub {{ entry: {:#010x}, text_address: {text_address:#010x}, text: {text}, \
         data_address: {data_address:#010x}, data: {data} }})",
        manifest.entry
    )
}

fn main() {
    let manifest_dir = env::var_os("CARGO_MANIFEST_DIR").expect("cargo sets CARGO_MANIFEST_DIR");
    let dir = PathBuf::from(manifest_dir).join("stubs");
    println!("cargo:rerun-if-changed={}", dir.display());

    let mut generated = String::new();
    for chip in CHIPS {
        let manifest_path = dir.join(format!("{chip}.toml"));
        let value = if manifest_path.is_file() {
            println!("cargo:rerun-if-changed={}", manifest_path.display());
            embed(&dir, chip, &manifest_path)
        } else {
            "None".to_string()
        };
        writeln!(
            generated,
            "pub(crate) const {}: Option<EmbeddedStub> = {value};",
            chip.to_uppercase()
        )
        .expect("writing to a String cannot fail");
    }

    let out_dir = env::var_os("OUT_DIR").expect("cargo sets OUT_DIR");
    let out = PathBuf::from(out_dir).join("stubs.rs");
    fs::write(&out, generated).unwrap_or_else(|e| panic!("{}: {e}", out.display()));
}
