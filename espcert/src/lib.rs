//! # espcert
//!
//! A library for backing up, verifying and reflashing the external flash of
//! ESP32-family chips over their serial bootloader, and for checking that a
//! flash dump carries the device certificates.
//!
//! This crate provides:
//!
//! - SLIP framing and the ROM/stub command protocol
//! - A session that synchronizes, identifies the chip, uploads the RAM stub
//!   and performs MD5-verified flash reads and writes
//! - A read-only partition table, wear-leveling and FAT12 walker that checks
//!   for `CERT/CA.DER`, `CERT/CLIENT.DER` and `CERT/PRIVATE.DER`
//!
//! ## Supported Chips
//!
//! - ESP32, ESP32-S2, ESP32-S3, ESP32-C3
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via `serialport`
//! - `serde`: Serialization support for chip and flash size types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use espcert::{LogSink, NativePort, Session, SessionConfig, StubImage};
//!
//! # async fn run(stub: StubImage) -> espcert::Result<()> {
//! let port = NativePort::open_simple("/dev/ttyUSB0", 115_200)?;
//! let session = Session::open(port, SessionConfig::default(), Arc::new(LogSink))?;
//!
//! let chip = session.sync().await?;
//! println!("Connected to {chip:?}");
//!
//! session.download_stub(&stub).await?;
//! let data = session.read_flash(0, 0x10000, |done, total| {
//!     println!("{done}/{total}");
//! }).await?;
//! println!("Read {} verified bytes", data.len());
//!
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod diag;
pub mod error;
pub mod fs;
pub mod port;
pub mod protocol;
pub mod session;
pub mod target;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_ports},
    diag::{DiagnosticSink, LogSink, MemorySink, SharedSink},
    error::{Error, Result},
    fs::{CertificateReport, DetectOptions, RecognitionFailure, detect},
    port::SerialConfig,
    session::{Phase, Session, SessionConfig, SessionState, WriteOutcome},
    target::{ChipKind, EmbeddedStub, FlashSize, Segment, StubImage},
};
