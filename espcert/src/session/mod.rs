//! Bootloader protocol client.
//!
//! A [`Session`] exclusively owns one full-duplex byte stream to the device.
//! A background task decodes incoming SLIP frames and hands them to the
//! [`Registry`]; commands register a handler, transmit, and await the
//! matching response.
//!
//! The ROM loader and the stub are not re-entrant. Every command runs while
//! holding a single-permit async lock, so command N+1 is only written after
//! command N has settled, whichever task issued it. Multi-step operations
//! (stub upload, block reads) hold the lock for their whole duration.
//!
//! ```text
//! Closed -> Opening -> Syncing -> Identified -> StubLoaded -> Ready
//!    ^                                                          |
//!    +----------------------- disconnect / port closed ---------+
//! ```

pub mod flash;
pub mod loader;
pub mod registry;
pub mod state;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::diag::{DiagnosticSink, SharedSink};
use crate::error::{Error, Result};
use crate::protocol::packet::{Command, Opcode, Packet};
use crate::protocol::slip::{self, SlipDecoder};
use crate::target::{CHIP_DETECT_MAGIC_REG, ChipKind, FlashSize, format_mac};

pub use flash::WriteOutcome;
pub use registry::{Incoming, Registry, ResponseKey, Routed};
pub use state::{Phase, SessionState};

use state::StateCell;

/// Status trailer length while the ROM loader answers.
const ROM_STATUS_LEN: usize = 4;

/// Status trailer length once the stub answers.
const STUB_STATUS_LEN: usize = 2;

/// Proof that the caller holds the command lock.
pub(crate) type CommandGuard<'a> = tokio::sync::MutexGuard<'a, ()>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Session timing and flash parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Nominal baud rate of the port (informational for streams).
    pub baud_rate: u32,
    /// SYNC attempts before giving up.
    pub sync_attempts: usize,
    /// Timeout of a single SYNC attempt.
    pub sync_timeout: Duration,
    /// Pause between SYNC attempts.
    pub sync_delay: Duration,
    /// Default timeout for a command response.
    pub command_timeout: Duration,
    /// How long after a command timed out its late reply is still expected
    /// and discarded.
    pub late_reply_grace: Duration,
    /// Longest silence tolerated while a flash read is streaming.
    pub read_idle_timeout: Duration,
    /// Wall-clock length of the reliability test.
    pub reliability_duration: Duration,
    /// Sectors requested per `READ_FLASH` block.
    pub read_block_sectors: u32,
    /// Flash size class reported to the stub.
    pub flash_size: FlashSize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            sync_attempts: 10,
            sync_timeout: Duration::from_millis(250),
            sync_delay: Duration::from_millis(100),
            command_timeout: Duration::from_secs(3),
            late_reply_grace: Duration::from_secs(1),
            read_idle_timeout: Duration::from_secs(3),
            reliability_duration: Duration::from_millis(1000),
            read_block_sectors: 64,
            flash_size: FlashSize::default(),
        }
    }
}

/// Decoded response to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Value field of the response header.
    pub value: u32,
    /// Payload with the status trailer removed.
    pub data: Vec<u8>,
}

/// Protocol client bound to one open port.
pub struct Session {
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    registry: Arc<Registry>,
    state: Arc<StateCell>,
    command_lock: tokio::sync::Mutex<()>,
    reader: Mutex<Option<JoinHandle<()>>>,
    config: SessionConfig,
    sink: SharedSink,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state.snapshot())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Take ownership of `stream` and start the receive loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<S>(stream: S, config: SessionConfig, sink: SharedSink) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Connection(format!("no async runtime: {e}")))?;

        let state = Arc::new(StateCell::default());
        state.set_phase(Phase::Opening);

        let (reader, writer) = tokio::io::split(stream);
        let registry = Arc::new(Registry::new());
        let task = runtime.spawn(receive_loop(
            reader,
            Arc::clone(&registry),
            Arc::clone(&state),
            Arc::clone(&sink),
        ));

        sink.debug(&format!("Session opened at {} baud", config.baud_rate));

        Ok(Self {
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            registry,
            state,
            command_lock: tokio::sync::Mutex::new(()),
            reader: Mutex::new(Some(task)),
            config,
            sink,
        })
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Snapshot of the session state.
    pub fn state(&self) -> SessionState {
        self.state.snapshot()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Identified chip, if any.
    pub fn chip(&self) -> Option<ChipKind> {
        self.state.snapshot().chip
    }

    /// Synchronize with the ROM loader and identify the chip.
    ///
    /// Returns the identified chip, or `None` if the magic value matches no
    /// known profile.
    pub async fn sync(&self) -> Result<Option<ChipKind>> {
        self.require(
            "synchronize",
            &[Phase::Opening, Phase::Syncing, Phase::Identified],
        )?;
        self.state.set_phase(Phase::Syncing);

        let guard = self.command_lock.lock().await;
        let attempts = self.config.sync_attempts;

        for attempt in 1..=attempts {
            match self
                .command_locked(&guard, Command::Sync, self.config.sync_timeout)
                .await
            {
                Ok(_) => {
                    self.sink
                        .debug(&format!("Synchronized on attempt {attempt}/{attempts}"));
                    return self.identify_locked(&guard).await;
                },
                Err(Error::Timeout(_) | Error::DeviceStatus { .. }) => {
                    self.sink
                        .debug(&format!("No SYNC response (attempt {attempt}/{attempts})"));
                },
                Err(e) => return Err(e),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.sync_delay).await;
            }
        }

        self.sink
            .error(&format!("Bootloader did not answer {attempts} SYNC attempts"));
        Err(Error::SyncFailed { attempts })
    }

    /// Read the magic register and match it against the profile table.
    ///
    /// An unknown magic value is not an error; the chip is recorded as
    /// unknown and the caller decides whether to continue.
    pub async fn identify(&self) -> Result<Option<ChipKind>> {
        self.require(
            "identify the chip",
            &[Phase::Syncing, Phase::Identified, Phase::StubLoaded, Phase::Ready],
        )?;
        let guard = self.command_lock.lock().await;
        self.identify_locked(&guard).await
    }

    async fn identify_locked(&self, guard: &CommandGuard<'_>) -> Result<Option<ChipKind>> {
        let magic = self.read_reg_locked(guard, CHIP_DETECT_MAGIC_REG).await?;
        let chip = ChipKind::from_magic(magic);
        match chip {
            Some(kind) => self
                .sink
                .debug(&format!("Detected {kind} (magic 0x{magic:08X})")),
            None => self
                .sink
                .error(&format!("Unknown chip magic value 0x{magic:08X}")),
        }
        self.state.update(|state| {
            state.chip = chip;
            if state.phase == Phase::Syncing {
                state.phase = Phase::Identified;
            }
        });
        Ok(chip)
    }

    /// Fail with [`Error::ChipMismatch`] unless the identified chip is `expected`.
    pub fn expect_chip(&self, expected: ChipKind) -> Result<()> {
        let detected = self.chip();
        if detected == Some(expected) {
            Ok(())
        } else {
            Err(Error::ChipMismatch { expected, detected })
        }
    }

    /// Read a 32-bit register.
    pub async fn read_reg(&self, address: u32) -> Result<u32> {
        self.require_connected("read a register")?;
        let guard = self.command_lock.lock().await;
        self.read_reg_locked(&guard, address).await
    }

    async fn read_reg_locked(&self, guard: &CommandGuard<'_>, address: u32) -> Result<u32> {
        let response = self
            .command_locked(
                guard,
                Command::ReadReg { address },
                self.config.command_timeout,
            )
            .await?;
        trace!("READ_REG 0x{address:08X} = 0x{:08X}", response.value);
        Ok(response.value)
    }

    /// Read the factory MAC address of the identified chip.
    ///
    /// Returns `None` if either eFuse word reads as zero.
    pub async fn read_mac(&self) -> Result<Option<String>> {
        let chip = self
            .chip()
            .ok_or_else(|| Error::Unsupported("cannot read MAC of an unidentified chip".into()))?;
        let base = chip.profile().mac_register;

        let guard = self.command_lock.lock().await;
        let low = self.read_reg_locked(&guard, base).await?;
        let high = self.read_reg_locked(&guard, base + 4).await?;
        drop(guard);

        let mac = format_mac(low, high);
        if mac.is_none() {
            self.sink
                .debug(&format!("MAC registers read zero (0x{low:08X}, 0x{high:08X})"));
        }
        Ok(mac)
    }

    /// Repeatedly read the magic register for the configured duration and
    /// fail on the first value that differs from a reference read.
    ///
    /// `progress` receives the elapsed fraction of the duration.
    pub async fn test_reliability(&self, mut progress: impl FnMut(f32) + Send) -> Result<usize> {
        self.require_connected("test link reliability")?;
        let duration = self.config.reliability_duration;
        let reference = self.read_reg(CHIP_DETECT_MAGIC_REG).await?;

        let start = Instant::now();
        let mut reads = 0usize;
        while start.elapsed() < duration {
            let value = self.read_reg(CHIP_DETECT_MAGIC_REG).await?;
            reads += 1;
            if value != reference {
                self.sink.error(&format!(
                    "Reliability test failed after {reads} reads: got 0x{value:08X}, expected 0x{reference:08X}"
                ));
                return Err(Error::Protocol(format!(
                    "register read returned 0x{value:08X}, expected 0x{reference:08X}"
                )));
            }
            let fraction = start.elapsed().as_secs_f32() / duration.as_secs_f32();
            progress(fraction.min(1.0));
        }

        progress(1.0);
        self.sink
            .debug(&format!("Reliability test passed ({reads} reads)"));
        Ok(reads)
    }

    /// Close the port and stop the receive loop. Calling it again is a no-op.
    pub async fn disconnect(&self) {
        let task = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let writer = self.writer.lock().await.take();

        if task.is_none() && writer.is_none() {
            return;
        }

        if let Some(task) = task {
            task.abort();
        }
        self.registry.close();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        self.state.close();
        self.sink.debug("Session disconnected");
    }

    /// Run one command under the held lock and return its checked response.
    ///
    /// Responses are matched by opcode only, so a reply that arrives after
    /// its command timed out would answer the next command with that opcode.
    /// The timed-out key is marked as owing a reply for
    /// [`SessionConfig::late_reply_grace`], and the next command for it waits
    /// that reply out before transmitting. SYNC is exempt: the ROM answers it
    /// several times over and the replies carry nothing.
    pub(crate) async fn command_locked(
        &self,
        _guard: &CommandGuard<'_>,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<Response> {
        let opcode = command.opcode();
        let key = ResponseKey::Command(opcode);
        if self.registry.is_owed(key) {
            self.sink
                .debug(&format!("Waiting for a late {opcode:?} reply before sending"));
        }
        self.registry.settle(key).await;
        let mut rx = self.registry.register(key)?;

        let result = async {
            self.send_packet(&command.to_packet()).await?;
            let packet = self.recv_packet(&mut rx, opcode, timeout).await?;
            self.check_status(opcode, packet)
        }
        .await;

        self.registry.unregister(key);
        if matches!(result, Err(Error::Timeout(_))) && opcode != Opcode::Sync {
            self.registry
                .mark_owed(key, Instant::now() + self.config.late_reply_grace);
        }
        result
    }

    /// Frame and write a request packet.
    pub(crate) async fn send_packet(&self, packet: &Packet) -> Result<()> {
        trace!(
            "TX command 0x{:02X}, {} payload bytes",
            packet.command,
            packet.payload.len()
        );
        self.write_frame(&packet.to_bytes()).await
    }

    /// Frame and write raw bytes that are not a command.
    pub(crate) async fn write_frame(&self, payload: &[u8]) -> Result<()> {
        let frame = slip::encode(payload);
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(Error::Connection("port is closed".into()));
        };

        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            self.sink.error(&format!("Serial write failed: {e}"));
            self.registry.close();
            self.state.close();
            return Err(Error::Connection(format!("write failed: {e}")));
        }
        Ok(())
    }

    pub(crate) async fn recv_packet(
        &self,
        rx: &mut UnboundedReceiver<Incoming>,
        opcode: Opcode,
        timeout: Duration,
    ) -> Result<Packet> {
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => Err(Error::Timeout(format!(
                "no {opcode:?} response within {timeout:?}"
            ))),
            Ok(None) => Err(Error::Connection(format!(
                "port closed while waiting for {opcode:?} response"
            ))),
            Ok(Some(Incoming::Packet(packet))) => Ok(packet),
            Ok(Some(Incoming::Raw(frame))) => Err(Error::Protocol(format!(
                "unexpected raw frame ({} bytes) for {opcode:?}",
                frame.len()
            ))),
        }
    }

    pub(crate) async fn recv_raw(
        &self,
        rx: &mut UnboundedReceiver<Incoming>,
        timeout: Duration,
        waiting_for: &str,
    ) -> Result<Vec<u8>> {
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => Err(Error::Timeout(format!(
                "no {waiting_for} within {timeout:?}"
            ))),
            Ok(None) => Err(Error::Connection(format!(
                "port closed while waiting for {waiting_for}"
            ))),
            Ok(Some(Incoming::Raw(frame))) => Ok(frame),
            Ok(Some(Incoming::Packet(packet))) => Ok(packet.to_bytes()),
        }
    }

    /// Strip and check the status trailer of a response.
    pub(crate) fn check_status(&self, opcode: Opcode, packet: Packet) -> Result<Response> {
        let status_len = if self.state.snapshot().stub_loaded {
            STUB_STATUS_LEN
        } else {
            ROM_STATUS_LEN
        };

        let Packet {
            value, mut payload, ..
        } = packet;

        if payload.len() < status_len {
            self.sink.error(&format!(
                "{opcode:?} response has {} payload bytes, shorter than the {status_len}-byte status",
                payload.len()
            ));
            return Err(Error::MalformedPacket(format!(
                "{opcode:?} response without a {status_len}-byte status trailer"
            )));
        }

        let split = payload.len() - status_len;
        let (status, code) = (payload[split], payload[split + 1]);
        if status != 0 {
            self.sink.error(&format!(
                "{opcode:?} failed: status 0x{status:02X}, error 0x{code:02X}"
            ));
            return Err(Error::DeviceStatus {
                command: opcode,
                status,
                code,
            });
        }
        payload.truncate(split);

        Ok(Response {
            value,
            data: payload,
        })
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn sink(&self) -> &dyn DiagnosticSink {
        &*self.sink
    }

    pub(crate) fn state_cell(&self) -> &StateCell {
        &self.state
    }

    pub(crate) fn command_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.command_lock
    }

    pub(crate) fn require(&self, operation: &'static str, allowed: &[Phase]) -> Result<()> {
        let phase = self.phase();
        if allowed.contains(&phase) {
            Ok(())
        } else {
            Err(Error::InvalidState { operation, phase })
        }
    }

    fn require_connected(&self, operation: &'static str) -> Result<()> {
        self.require(
            operation,
            &[
                Phase::Syncing,
                Phase::Identified,
                Phase::StubLoaded,
                Phase::Ready,
            ],
        )
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// Read bytes until EOF or error, dispatching every decoded frame.
async fn receive_loop<R>(
    mut reader: R,
    registry: Arc<Registry>,
    state: Arc<StateCell>,
    sink: SharedSink,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = SlipDecoder::new();
    let mut buf = vec![0u8; 4096];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                sink.debug("Serial port closed");
                break;
            },
            Ok(n) => {
                trace!("RX {n} bytes");
                for frame in decoder.decode(&buf[..n]) {
                    registry.dispatch(frame, &*sink);
                }
            },
            Err(e) => {
                sink.error(&format!("Serial read failed: {e}"));
                break;
            },
        }
    }

    registry.close();
    state.close();
}
