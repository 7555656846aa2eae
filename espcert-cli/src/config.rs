//! Configuration file support for espcert.
//!
//! Sources, highest priority first:
//! 1. Command-line arguments
//! 2. Environment variables (`ESPCERT_*`, handled by clap)
//! 3. Local config file (`./espcert.toml`)
//! 4. Global config file (e.g. `~/.config/espcert/config.toml`)
//!
//! `--config PATH` replaces 3 and 4.

use directories::ProjectDirs;
use espcert::{ChipKind, FlashSize};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the per-directory config file.
pub const LOCAL_CONFIG_FILE: &str = "espcert.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
    /// Skip the DTR/RTS bootloader reset.
    #[serde(default)]
    pub no_reset: bool,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Expected chip.
    pub chip: Option<ChipKind>,
    /// Flash size class, e.g. "4MB".
    pub size: Option<FlashSize>,
}

/// Stub configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StubConfig {
    /// Directory holding `<chip>.toml` stub manifests that override the
    /// built-in stubs.
    pub dir: Option<PathBuf>,
}

/// Certificate detector configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectConfig {
    /// Label of the assets partition.
    pub label: Option<String>,
    /// Offset of the partition table.
    pub table_offset: Option<usize>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flash settings.
    #[serde(default)]
    pub flash: FlashConfig,
    /// Stub settings.
    #[serde(default)]
    pub stub: StubConfig,
    /// Detector settings.
    #[serde(default)]
    pub detect: DetectConfig,
}

impl Config {
    /// Load the global config, then the local one on top.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global);
            }
        }

        if let Some(local) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local);
        }

        config
    }

    /// Load configuration from a specific file path (`--config`).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {e}", path.display());
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {e}", path.display());
                None
            },
        }
    }

    /// Global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "espcert").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Stub override directory: configured, else `stubs/` in the global
    /// config directory.
    pub fn stub_dir(&self) -> Option<PathBuf> {
        self.stub
            .dir
            .clone()
            .or_else(|| Self::global_config_dir().map(|dir| dir.join("stubs")))
    }

    /// Overlay the fields `other` sets.
    fn merge(&mut self, other: Self) {
        if other.connection.serial.is_some() {
            self.connection.serial = other.connection.serial;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        if other.connection.no_reset {
            self.connection.no_reset = true;
        }

        if other.flash.chip.is_some() {
            self.flash.chip = other.flash.chip;
        }
        if other.flash.size.is_some() {
            self.flash.size = other.flash.size;
        }

        if other.stub.dir.is_some() {
            self.stub.dir = other.stub.dir;
        }

        if other.detect.label.is_some() {
            self.detect.label = other.detect.label;
        }
        if other.detect.table_offset.is_some() {
            self.detect.table_offset = other.detect.table_offset;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.serial.is_none());
        assert!(config.connection.baud.is_none());
        assert!(!config.connection.no_reset);
        assert!(config.flash.chip.is_none());
        assert!(config.flash.size.is_none());
        assert!(config.stub.dir.is_none());
        assert!(config.detect.label.is_none());
    }

    #[test]
    fn test_config_merge_overrides_set_fields() {
        let mut base = Config::default();
        base.connection.baud = Some(115_200);
        base.detect.label = Some("assets".to_string());

        let mut other = Config::default();
        other.connection.serial = Some("/dev/ttyUSB0".to_string());
        other.connection.baud = Some(460_800);
        other.flash.chip = Some(ChipKind::Esp32s3);

        base.merge(other);

        assert_eq!(base.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.connection.baud, Some(460_800));
        assert_eq!(base.flash.chip, Some(ChipKind::Esp32s3));
        assert_eq!(base.detect.label.as_deref(), Some("assets"));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.connection.serial = Some("COM3".to_string());
        base.flash.size = Some(FlashSize::Flash8Mb);
        base.stub.dir = Some(PathBuf::from("/opt/stubs"));

        base.merge(Config::default());

        assert_eq!(base.connection.serial.as_deref(), Some("COM3"));
        assert_eq!(base.flash.size, Some(FlashSize::Flash8Mb));
        assert_eq!(base.stub.dir, Some(PathBuf::from("/opt/stubs")));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[connection]
serial = "/dev/ttyACM0"
baud = 460800
no_reset = true

[flash]
chip = "esp32s3"
size = "8MB"

[stub]
dir = "stubs"

[detect]
label = "certs"
table_offset = 0x8000
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.connection.baud, Some(460_800));
        assert!(config.connection.no_reset);
        assert_eq!(config.flash.chip, Some(ChipKind::Esp32s3));
        assert_eq!(config.flash.size, Some(FlashSize::Flash8Mb));
        assert_eq!(config.stub.dir, Some(PathBuf::from("stubs")));
        assert_eq!(config.detect.label.as_deref(), Some("certs"));
        assert_eq!(config.detect.table_offset, Some(0x8000));
    }

    #[test]
    fn test_config_from_partial_toml() {
        let config: Config = toml::from_str("[flash]\nchip = \"esp32c3\"\n").unwrap();
        assert!(config.connection.serial.is_none());
        assert_eq!(config.flash.chip, Some(ChipKind::Esp32c3));
    }

    #[test]
    fn test_config_rejects_unknown_chip() {
        assert!(toml::from_str::<Config>("[flash]\nchip = \"esp8266\"\n").is_err());
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("espcert.toml");
        fs::write(&path, "[connection]\nserial = \"/dev/ttyUSB1\"\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyUSB1"));
    }

    #[test]
    fn test_load_from_path_invalid_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[connection\nserial = ").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.connection.serial.is_none());

        let missing = Config::load_from_path(&dir.path().join("missing.toml"));
        assert!(missing.connection.serial.is_none());
    }

    #[test]
    fn test_stub_dir_prefers_configured() {
        let mut config = Config::default();
        config.stub.dir = Some(PathBuf::from("/opt/espcert/stubs"));
        assert_eq!(config.stub_dir(), Some(PathBuf::from("/opt/espcert/stubs")));
    }

    #[test]
    fn test_global_config_path_shape() {
        if let Some(path) = Config::global_config_path() {
            let text = path.to_string_lossy();
            assert!(text.contains("espcert"));
            assert!(text.ends_with("config.toml"));
        }
    }
}
