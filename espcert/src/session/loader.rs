//! Stub upload and SPI flash configuration.

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::protocol::packet::{Command, MEM_WRITE_SIZE, Opcode, Packet, SpiParams};
use crate::session::registry::{Incoming, ResponseKey};
use crate::session::{CommandGuard, Phase, Session};
use crate::target::{Segment, StubImage};

/// Greeting the stub sends once it runs.
pub const STUB_GREETING: &[u8] = b"OHAI";

impl Session {
    /// Upload `stub` into RAM, start it, and configure the SPI flash.
    ///
    /// On success the session is [`Phase::Ready`] and responses carry the
    /// stub's two-byte status trailer.
    pub async fn download_stub(&self, stub: &StubImage) -> Result<()> {
        self.require("upload the stub", &[Phase::Identified])?;
        let guard = self.command_lock().lock().await;

        for segment in stub.segments() {
            self.upload_segment(&guard, segment).await?;
        }
        self.start_stub(&guard, stub.entry).await?;

        self.state_cell().update(|state| {
            state.stub_loaded = true;
            state.phase = Phase::StubLoaded;
        });
        self.sink().debug("Stub running");

        self.configure_flash(&guard).await?;
        self.state_cell().set_phase(Phase::Ready);
        Ok(())
    }

    async fn upload_segment(&self, guard: &CommandGuard<'_>, segment: &Segment) -> Result<()> {
        let size = segment.len() as u32;
        let blocks = segment.len().div_ceil(MEM_WRITE_SIZE) as u32;
        self.sink().debug(&format!(
            "Uploading {size} bytes to 0x{:08X} in {blocks} blocks",
            segment.address
        ));

        self.command_locked(
            guard,
            Command::MemBegin {
                size,
                blocks,
                block_size: MEM_WRITE_SIZE as u32,
                offset: segment.address,
            },
            self.config().command_timeout,
        )
        .await?;

        for (sequence, data) in segment.data.chunks(MEM_WRITE_SIZE).enumerate() {
            self.command_locked(
                guard,
                Command::MemData {
                    data,
                    sequence: sequence as u32,
                },
                self.config().command_timeout,
            )
            .await?;
        }
        Ok(())
    }

    /// Send `MEM_END` and wait for the greeting.
    async fn start_stub(&self, _guard: &CommandGuard<'_>, entry: u32) -> Result<()> {
        let command_key = ResponseKey::Command(Opcode::MemEnd);
        let mut raw = self.registry().register(ResponseKey::Raw)?;
        let mut ack = self.registry().register(command_key)?;

        let result = async {
            self.send_packet(&Command::MemEnd { entry }.to_packet())
                .await?;
            self.await_greeting(&mut raw).await?;

            // The ROM acknowledges MEM_END before jumping; its status still counts.
            if let Ok(Incoming::Packet(packet)) = ack.try_recv() {
                self.check_status(Opcode::MemEnd, packet)?;
            }
            Ok(())
        }
        .await;

        self.registry().unregister(ResponseKey::Raw);
        self.registry().unregister(command_key);

        if let Err(e) = &result {
            self.sink().error(&format!("Stub did not start: {e}"));
        }
        result
    }

    /// Wait for the greeting, skipping late responses to earlier commands.
    async fn await_greeting(&self, raw: &mut UnboundedReceiver<Incoming>) -> Result<()> {
        let deadline = Instant::now() + self.config().command_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = match self.recv_raw(raw, remaining, "stub greeting").await {
                Ok(frame) => frame,
                Err(Error::Timeout(msg)) => return Err(Error::StubExecution(msg)),
                Err(e) => return Err(e),
            };

            if frame == STUB_GREETING {
                return Ok(());
            }
            match Packet::parse(&frame) {
                Ok(packet) if packet.is_response() => {
                    self.sink().debug(&format!(
                        "Skipping stray response 0x{:02X} while waiting for stub",
                        packet.command
                    ));
                },
                _ => {
                    return Err(Error::StubExecution(format!(
                        "expected greeting \"OHAI\", got {:02X?}",
                        frame
                    )));
                },
            }
        }
    }

    async fn configure_flash(&self, guard: &CommandGuard<'_>) -> Result<()> {
        let timeout = self.config().command_timeout;
        self.command_locked(guard, Command::SpiAttach, timeout)
            .await?;

        let params = SpiParams::for_size(self.config().flash_size.bytes());
        self.command_locked(guard, Command::SpiSetParams { params }, timeout)
            .await?;
        self.sink()
            .debug(&format!("SPI flash configured for {}", self.config().flash_size));
        Ok(())
    }
}
