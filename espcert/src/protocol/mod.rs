//! Wire protocol of the ESP serial bootloader.

pub mod digest;
pub mod packet;
pub mod slip;

// Re-export common types
pub use {
    digest::Md5Digest,
    packet::{Command, Opcode, Packet, SpiParams},
    slip::SlipDecoder,
};
