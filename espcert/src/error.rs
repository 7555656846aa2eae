//! Error types for espcert.

use std::io;
use thiserror::Error;

use crate::protocol::packet::Opcode;
use crate::session::Phase;
use crate::target::ChipKind;

/// Result type for espcert operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for bootloader session operations.
///
/// Filesystem recognition problems are not represented here; the
/// certificate detector reports them as [`crate::fs::RecognitionFailure`].
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The port could not be opened, was closed underneath the session, or
    /// a write to it failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The synchronization handshake never got an answer.
    #[error("Failed to synchronize with the bootloader after {attempts} attempts")]
    SyncFailed {
        /// Number of SYNC attempts made.
        attempts: usize,
    },

    /// The connected chip is not the one the caller expected.
    #[error("Chip mismatch: expected {expected}, detected {}", detected.map_or_else(|| "unknown chip".to_string(), |c| c.to_string()))]
    ChipMismatch {
        /// Chip the caller asked for.
        expected: ChipKind,
        /// Chip reported by the device, if it matched any profile.
        detected: Option<ChipKind>,
    },

    /// The uploaded stub did not answer with its greeting.
    #[error("Stub execution failed: {0}")]
    StubExecution(String),

    /// Local and device-computed digests disagree.
    #[error(
        "Verification failed for {length} bytes at {address:#010x}: local digest {local}, device digest {device}"
    )]
    Verification {
        /// Flash address of the region.
        address: u32,
        /// Length of the region in bytes.
        length: u32,
        /// Digest computed on the host.
        local: String,
        /// Digest reported by the device.
        device: String,
    },

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A frame whose declared size disagrees with its length.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// The device answered a command with a failure status.
    #[error("{command:?} failed on device: status {status:#04x}, error {code:#04x}")]
    DeviceStatus {
        /// Command that failed.
        command: Opcode,
        /// Status byte.
        status: u8,
        /// Error code byte.
        code: u8,
    },

    /// The operation is not valid in the current session phase.
    #[error("Cannot {operation} while session is {phase:?}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// Phase the session was in.
        phase: Phase,
    },

    /// `update` called on a digest that was already finalized.
    #[error("Digest already finalized")]
    DigestFinalized,

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unsupported chip or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No serial port found.
    #[error("No serial port found")]
    DeviceNotFound,
}
