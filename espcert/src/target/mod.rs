//! Target chip descriptions.

pub mod chip;
pub mod stub;

pub use {
    chip::{CHIP_DETECT_MAGIC_REG, ChipKind, ChipProfile, FlashSize, PROFILES, format_mac},
    stub::{EmbeddedStub, Segment, StubImage},
};
