//! SLIP byte stuffing.
//!
//! ## Frame Format
//!
//! ```text
//! +------+----------------------------+------+
//! | 0xC0 |  payload (escaped)         | 0xC0 |
//! +------+----------------------------+------+
//!
//! 0xC0 in payload -> 0xDB 0xDC
//! 0xDB in payload -> 0xDB 0xDD
//! ```
//!
//! The decoder is stateful: chunks read from the serial port may end in the
//! middle of a frame or between an escape byte and its successor.

use log::trace;

/// Frame delimiter.
pub const END: u8 = 0xC0;

/// Escape byte.
pub const ESC: u8 = 0xDB;

/// Escaped delimiter (follows [`ESC`]).
pub const ESC_END: u8 = 0xDC;

/// Escaped escape byte (follows [`ESC`]).
pub const ESC_ESC: u8 = 0xDD;

/// Wrap `payload` in delimiters, escaping any special bytes.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + payload.len() / 16 + 2);
    frame.push(END);
    for &byte in payload {
        match byte {
            END => frame.extend_from_slice(&[ESC, ESC_END]),
            ESC => frame.extend_from_slice(&[ESC, ESC_ESC]),
            b => frame.push(b),
        }
    }
    frame.push(END);
    frame
}

/// Incremental SLIP decoder.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    buffer: Vec<u8>,
    in_frame: bool,
    escaping: bool,
}

impl SlipDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of raw bytes and return every frame it completes.
    ///
    /// Bytes outside a frame (line noise, boot messages) are dropped.
    ///
    /// `decode(encode(p))` yields `[p]` for every non-empty `p`. An empty
    /// payload is the exception: its two delimiters read as a frame
    /// boundary and nothing is returned. No protocol frame is empty (packets
    /// carry an 8-byte header, acknowledgements 4 bytes).
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for &byte in chunk {
            if !self.in_frame {
                if byte == END {
                    self.in_frame = true;
                    self.buffer.clear();
                    self.escaping = false;
                } else {
                    trace!("Dropping byte outside frame: 0x{byte:02X}");
                }
                continue;
            }

            if self.escaping {
                self.escaping = false;
                match byte {
                    ESC_END => self.buffer.push(END),
                    ESC_ESC => self.buffer.push(ESC),
                    other => {
                        // Invalid escape; keep both bytes rather than guess.
                        trace!("Invalid escape sequence 0xDB 0x{other:02X}");
                        self.buffer.push(ESC);
                        self.buffer.push(other);
                    },
                }
                continue;
            }

            match byte {
                END if self.buffer.is_empty() => {
                    // Back-to-back delimiters: the second one opens the frame.
                },
                END => {
                    frames.push(std::mem::take(&mut self.buffer));
                    self.in_frame = false;
                },
                ESC => self.escaping = true,
                b => self.buffer.push(b),
            }
        }

        frames
    }

    /// Whether a partial frame is buffered.
    pub fn is_mid_frame(&self) -> bool {
        self.in_frame && (!self.buffer.is_empty() || self.escaping)
    }

    /// Discard any partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_frame = false;
        self.escaping = false;
    }
}
