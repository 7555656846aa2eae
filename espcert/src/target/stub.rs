//! RAM stub images.
//!
//! The stub is a small program uploaded into device RAM that extends the ROM
//! loader (verified streaming reads, flash MD5 over large regions). The
//! binaries themselves are opaque; this module only describes where they go.
//!
//! Stubs present in the crate's `stubs/` directory at build time are
//! compiled into the chip profile table as [`EmbeddedStub`]s.

use crate::error::{Error, Result};

/// A loadable memory segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Load address in device RAM.
    pub address: u32,
    /// Segment contents.
    pub data: Vec<u8>,
}

impl Segment {
    /// Create a segment.
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        Self { address, data }
    }

    /// Segment length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the segment carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A stub program: text and data segments plus the entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubImage {
    /// Code segment.
    pub text: Segment,
    /// Initialized data segment (may be empty).
    pub data: Segment,
    /// Entry point address.
    pub entry: u32,
}

impl StubImage {
    /// Build a stub image, rejecting an empty text segment or a zero entry.
    pub fn new(text: Segment, data: Segment, entry: u32) -> Result<Self> {
        if text.is_empty() {
            return Err(Error::Config("stub text segment is empty".into()));
        }
        if entry == 0 {
            return Err(Error::Config("stub entry point is zero".into()));
        }
        Ok(Self { text, data, entry })
    }

    /// Segments in upload order: data first, then text. Empty segments are
    /// skipped.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        [&self.data, &self.text]
            .into_iter()
            .filter(|segment| !segment.is_empty())
    }

    /// Total bytes to upload.
    pub fn total_len(&self) -> usize {
        self.segments().map(Segment::len).sum()
    }
}

/// A stub compiled into the profile table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedStub {
    /// Entry point address.
    pub entry: u32,
    /// Load address of the code segment.
    pub text_address: u32,
    /// Code segment contents.
    pub text: &'static [u8],
    /// Load address of the data segment.
    pub data_address: u32,
    /// Data segment contents (may be empty).
    pub data: &'static [u8],
}

impl EmbeddedStub {
    /// Uploadable copy of this stub.
    pub fn image(&self) -> StubImage {
        StubImage {
            text: Segment::new(self.text_address, self.text.to_vec()),
            data: Segment::new(self.data_address, self.data.to_vec()),
            entry: self.entry,
        }
    }
}
