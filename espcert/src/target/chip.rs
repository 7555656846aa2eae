//! Chip profiles for the supported ESP32 variants.
//!
//! A connected device is identified by reading [`CHIP_DETECT_MAGIC_REG`] and
//! matching the value against every profile in table order.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::target::stub::{EmbeddedStub, StubImage};

mod embedded {
    use crate::target::stub::EmbeddedStub;

    include!(concat!(env!("OUT_DIR"), "/stubs.rs"));
}

/// Register whose value identifies the chip variant.
pub const CHIP_DETECT_MAGIC_REG: u32 = 0x4000_1000;

/// Supported chip variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ChipKind {
    /// ESP32 (Xtensa dual core).
    Esp32,
    /// ESP32-S2.
    Esp32s2,
    /// ESP32-S3.
    Esp32s3,
    /// ESP32-C3 (RISC-V).
    Esp32c3,
}

impl ChipKind {
    /// All variants, in identification order.
    pub const ALL: [Self; 4] = [Self::Esp32, Self::Esp32s2, Self::Esp32s3, Self::Esp32c3];

    /// Static profile for this variant.
    pub fn profile(self) -> &'static ChipProfile {
        match self {
            Self::Esp32 => &PROFILES[0],
            Self::Esp32s2 => &PROFILES[1],
            Self::Esp32s3 => &PROFILES[2],
            Self::Esp32c3 => &PROFILES[3],
        }
    }

    /// Short lowercase name, also used for stub manifest file names.
    pub fn name(self) -> &'static str {
        match self {
            Self::Esp32 => "esp32",
            Self::Esp32s2 => "esp32s2",
            Self::Esp32s3 => "esp32s3",
            Self::Esp32c3 => "esp32c3",
        }
    }

    /// Get the chip kind from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().replace(['-', '_'], "").as_str() {
            "esp32" => Some(Self::Esp32),
            "esp32s2" => Some(Self::Esp32s2),
            "esp32s3" => Some(Self::Esp32s3),
            "esp32c3" => Some(Self::Esp32c3),
            _ => None,
        }
    }

    /// Identify a chip from the value of the magic register.
    ///
    /// The first profile whose magic set contains `value` wins.
    pub fn from_magic(value: u32) -> Option<Self> {
        PROFILES
            .iter()
            .find(|profile| profile.magic_values.contains(&value))
            .map(|profile| profile.kind)
    }
}

impl fmt::Display for ChipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Esp32 => write!(f, "ESP32"),
            Self::Esp32s2 => write!(f, "ESP32-S2"),
            Self::Esp32s3 => write!(f, "ESP32-S3"),
            Self::Esp32c3 => write!(f, "ESP32-C3"),
        }
    }
}

impl FromStr for ChipKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| Error::Unsupported(format!("unknown chip '{s}'")))
    }
}

/// Identification data for one chip variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipProfile {
    /// Variant described by this profile.
    pub kind: ChipKind,
    /// Accepted values of the magic register.
    pub magic_values: &'static [u32],
    /// Address of the low MAC eFuse word; the high word follows it.
    pub mac_register: u32,
    /// Flasher stub compiled into this build, if one was provided.
    pub stub: Option<EmbeddedStub>,
}

impl ChipProfile {
    /// Uploadable copy of the embedded stub.
    pub fn stub_image(&self) -> Option<StubImage> {
        self.stub.as_ref().map(EmbeddedStub::image)
    }
}

/// Profile table in identification order.
pub static PROFILES: [ChipProfile; 4] = [
    ChipProfile {
        kind: ChipKind::Esp32,
        magic_values: &[0x00F0_1D83],
        mac_register: 0x3FF5_A004,
        stub: embedded::ESP32,
    },
    ChipProfile {
        kind: ChipKind::Esp32s2,
        magic_values: &[0x0000_07C6],
        mac_register: 0x3F41_A044,
        stub: embedded::ESP32S2,
    },
    ChipProfile {
        kind: ChipKind::Esp32s3,
        magic_values: &[0x9],
        mac_register: 0x6000_7044,
        stub: embedded::ESP32S3,
    },
    ChipProfile {
        kind: ChipKind::Esp32c3,
        magic_values: &[0x6921_506F, 0x1B31_506F, 0x4881_606F, 0x4361_606F],
        mac_register: 0x6000_8844,
        stub: embedded::ESP32C3,
    },
];

/// Format the MAC address held in two eFuse words.
///
/// The low 16 bits of `high` are the first two bytes; `low` supplies the
/// remaining four, most significant first. Returns `None` if either word is
/// zero (unprogrammed eFuse or failed read).
pub fn format_mac(low: u32, high: u32) -> Option<String> {
    if low == 0 || high == 0 {
        return None;
    }
    let value = (u64::from(high & 0xFFFF) << 32) | u64::from(low);
    let bytes = value.to_be_bytes();
    Some(
        bytes[2..]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

/// SPI flash size classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FlashSize {
    /// 1 MiB.
    #[cfg_attr(feature = "serde", serde(rename = "1MB"))]
    Flash1Mb,
    /// 2 MiB.
    #[cfg_attr(feature = "serde", serde(rename = "2MB"))]
    Flash2Mb,
    /// 4 MiB.
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "4MB"))]
    Flash4Mb,
    /// 8 MiB.
    #[cfg_attr(feature = "serde", serde(rename = "8MB"))]
    Flash8Mb,
    /// 16 MiB.
    #[cfg_attr(feature = "serde", serde(rename = "16MB"))]
    Flash16Mb,
}

impl FlashSize {
    /// Size in bytes.
    pub fn bytes(self) -> u32 {
        const MB: u32 = 1024 * 1024;
        match self {
            Self::Flash1Mb => MB,
            Self::Flash2Mb => 2 * MB,
            Self::Flash4Mb => 4 * MB,
            Self::Flash8Mb => 8 * MB,
            Self::Flash16Mb => 16 * MB,
        }
    }

    /// Parse names like `4MB`, `4M` or `4`.
    pub fn from_name(name: &str) -> Option<Self> {
        let digits = name
            .trim()
            .trim_end_matches(['b', 'B'])
            .trim_end_matches(['m', 'M']);
        match digits {
            "1" => Some(Self::Flash1Mb),
            "2" => Some(Self::Flash2Mb),
            "4" => Some(Self::Flash4Mb),
            "8" => Some(Self::Flash8Mb),
            "16" => Some(Self::Flash16Mb),
            _ => None,
        }
    }
}

impl fmt::Display for FlashSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}MB", self.bytes() / (1024 * 1024))
    }
}

impl FromStr for FlashSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| Error::Config(format!("invalid flash size '{s}'")))
    }
}
