//! Serial ports.
//!
//! The session talks to any `tokio` byte stream. On native platforms the
//! blocking `serialport` handle is bridged into one by [`NativePort`]:
//!
//! ```text
//! +------------------+
//! |     Session      |
//! +--------+---------+
//!          | AsyncRead / AsyncWrite
//! +--------+---------+     +-----------------+
//! |    NativePort    |<----|  reader thread  |
//! +--------+---------+     +--------+--------+
//!          | write                  | read
//! +--------+------------------------+--------+
//! |          serialport::SerialPort          |
//! +------------------------------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::time::Duration;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Poll interval of the reader thread and write timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115_200,
            timeout: Duration::from_millis(100),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(feature = "native")]
pub use native::NativePort;
