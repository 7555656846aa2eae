//! Flash read and write.
//!
//! The plain operations move bytes; the verified ones additionally ask the
//! device for an MD5 of the region and compare it with a local digest.

use std::time::Duration;

use log::debug;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::{Error, Result};
use crate::protocol::digest::{self, DIGEST_LEN, Md5Digest};
use crate::protocol::packet::{Command, FLASH_WRITE_SIZE};
use crate::session::registry::{Incoming, ResponseKey};
use crate::session::{CommandGuard, Phase, Session};

/// Flash sector size.
pub const SECTOR_SIZE: u32 = 0x1000;

/// Packets the stub may stream before waiting for an acknowledgement.
pub const READ_MAX_IN_FLIGHT: u32 = 64;

const ERASE_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const MD5_TIMEOUT_PER_MB: Duration = Duration::from_secs(8);

/// Scale a per-megabyte timeout to `size` bytes, never below `floor`.
fn timeout_for_size(per_mb: Duration, size: u32, floor: Duration) -> Duration {
    per_mb
        .mul_f64(f64::from(size) / 1_000_000.0)
        .max(floor)
}

/// Fail unless `length` bytes starting at `address` fit the 32-bit address
/// space.
fn check_region(address: u32, length: u32) -> Result<()> {
    if u64::from(address) + u64::from(length) > 1 << 32 {
        return Err(Error::Unsupported(format!(
            "{length} bytes at 0x{address:08X} run past the end of the address space"
        )));
    }
    Ok(())
}

/// Result of a verified write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Flash address written.
    pub address: u32,
    /// Bytes written.
    pub length: u32,
    /// MD5 of the region, lowercase hex, as confirmed by the device.
    pub digest: String,
}

impl Session {
    /// Write `data` at `address` without verification.
    ///
    /// `progress` receives `(bytes_written, total)` after each block.
    pub async fn write_flash_plain(
        &self,
        address: u32,
        data: &[u8],
        mut progress: impl FnMut(usize, usize) + Send,
    ) -> Result<()> {
        self.require("write flash", &[Phase::Ready])?;
        let guard = self.command_lock().lock().await;
        self.write_flash_locked(&guard, address, data, &mut progress)
            .await
    }

    async fn write_flash_locked(
        &self,
        guard: &CommandGuard<'_>,
        address: u32,
        data: &[u8],
        progress: &mut (impl FnMut(usize, usize) + Send),
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let size = u32::try_from(data.len())
            .map_err(|_| Error::Unsupported(format!("{} bytes exceed the flash", data.len())))?;
        check_region(address, size)?;
        let blocks = data.len().div_ceil(FLASH_WRITE_SIZE) as u32;

        self.sink().debug(&format!(
            "Writing {size} bytes at 0x{address:08X} in {blocks} blocks"
        ));

        self.command_locked(
            guard,
            Command::FlashBegin {
                size,
                blocks,
                block_size: FLASH_WRITE_SIZE as u32,
                offset: address,
            },
            timeout_for_size(ERASE_TIMEOUT_PER_MB, size, self.config().command_timeout),
        )
        .await?;

        let mut written = 0;
        for (sequence, block) in data.chunks(FLASH_WRITE_SIZE).enumerate() {
            self.command_locked(
                guard,
                Command::FlashData {
                    data: block,
                    sequence: sequence as u32,
                },
                self.config().command_timeout,
            )
            .await?;
            written += block.len();
            progress(written, data.len());
        }
        Ok(())
    }

    /// Finish a flash write, optionally rebooting into the application.
    pub async fn flash_finish(&self, reboot: bool) -> Result<()> {
        self.require("finish flashing", &[Phase::Ready])?;
        let guard = self.command_lock().lock().await;
        self.command_locked(
            &guard,
            Command::FlashEnd { reboot },
            self.config().command_timeout,
        )
        .await?;
        Ok(())
    }

    /// Read `length` bytes at `address`, checking the digest the stub sends
    /// after each block.
    ///
    /// `progress` receives `(bytes_read, total)` after each streamed packet.
    pub async fn read_flash_plain(
        &self,
        address: u32,
        length: u32,
        mut progress: impl FnMut(usize, usize) + Send,
    ) -> Result<Vec<u8>> {
        self.require("read flash", &[Phase::Ready])?;
        let guard = self.command_lock().lock().await;
        self.read_flash_locked(&guard, address, length, &mut progress)
            .await
    }

    async fn read_flash_locked(
        &self,
        guard: &CommandGuard<'_>,
        address: u32,
        length: u32,
        progress: &mut (impl FnMut(usize, usize) + Send),
    ) -> Result<Vec<u8>> {
        check_region(address, length)?;
        let block_size = self.config().read_block_sectors.max(1) * SECTOR_SIZE;
        let total = length as usize;
        let mut data = Vec::with_capacity(total);

        while data.len() < total {
            let offset = data.len() as u32;
            let chunk = block_size.min(length - offset);
            let done = data.len();
            let block_address = address.checked_add(offset).ok_or_else(|| {
                Error::Unsupported(format!("read offset 0x{offset:X} overflows 0x{address:08X}"))
            })?;
            let block = self
                .read_block(guard, block_address, chunk, &mut |n| {
                    progress(done + n, total);
                })
                .await?;
            data.extend_from_slice(&block);
        }
        Ok(data)
    }

    async fn read_block(
        &self,
        guard: &CommandGuard<'_>,
        address: u32,
        length: u32,
        on_bytes: &mut (dyn FnMut(usize) + Send),
    ) -> Result<Vec<u8>> {
        let mut raw = self.registry().register(ResponseKey::Raw)?;
        let result = self
            .stream_block(guard, &mut raw, address, length, on_bytes)
            .await;
        self.registry().unregister(ResponseKey::Raw);

        if let Err(e) = &result {
            self.sink().error(&format!(
                "Read of {length} bytes at 0x{address:08X} failed: {e}"
            ));
        }
        result
    }

    async fn stream_block(
        &self,
        guard: &CommandGuard<'_>,
        raw: &mut UnboundedReceiver<Incoming>,
        address: u32,
        length: u32,
        on_bytes: &mut (dyn FnMut(usize) + Send),
    ) -> Result<Vec<u8>> {
        self.command_locked(
            guard,
            Command::ReadFlash {
                offset: address,
                size: length,
                sector_size: SECTOR_SIZE,
                max_in_flight: READ_MAX_IN_FLIGHT,
            },
            self.config().command_timeout,
        )
        .await?;

        let idle = self.config().read_idle_timeout;
        let expected = length as usize;
        let mut data = Vec::with_capacity(expected);
        let mut digest = Md5Digest::new();

        while data.len() < expected {
            let packet = self.recv_raw(raw, idle, "flash data").await?;
            if data.len() + packet.len() > expected {
                return Err(Error::Protocol(format!(
                    "device sent {} bytes past the requested {expected}",
                    data.len() + packet.len() - expected
                )));
            }
            digest.update(&packet)?;
            data.extend_from_slice(&packet);

            // Acknowledge with the running total.
            self.write_frame(&(data.len() as u32).to_le_bytes())
                .await?;
            on_bytes(data.len());
        }

        let trailer = self.recv_raw(raw, idle, "flash read digest").await?;
        if trailer.len() != DIGEST_LEN {
            return Err(Error::Protocol(format!(
                "expected {DIGEST_LEN}-byte digest after flash data, got {} bytes",
                trailer.len()
            )));
        }

        let local = digest.digest();
        if trailer != local {
            return Err(Error::Verification {
                address,
                length,
                local: hex::encode(local),
                device: hex::encode(&trailer),
            });
        }
        debug!("Read {length} bytes at 0x{address:08X}, digest {}", hex::encode(local));
        Ok(data)
    }

    /// Ask the device for the MD5 of a flash region, as lowercase hex.
    pub async fn flash_md5(&self, address: u32, length: u32) -> Result<String> {
        self.require("compute a flash digest", &[Phase::StubLoaded, Phase::Ready])?;
        let guard = self.command_lock().lock().await;
        self.flash_md5_locked(&guard, address, length).await
    }

    async fn flash_md5_locked(
        &self,
        guard: &CommandGuard<'_>,
        address: u32,
        length: u32,
    ) -> Result<String> {
        let response = self
            .command_locked(
                guard,
                Command::FlashMd5 {
                    offset: address,
                    size: length,
                },
                timeout_for_size(MD5_TIMEOUT_PER_MB, length, self.config().command_timeout),
            )
            .await?;
        parse_device_digest(&response.data)
    }

    /// Read `length` bytes at `address` and confirm them against the
    /// device-computed MD5 of the region.
    pub async fn read_flash(
        &self,
        address: u32,
        length: u32,
        mut progress: impl FnMut(usize, usize) + Send,
    ) -> Result<Vec<u8>> {
        self.require("read flash", &[Phase::Ready])?;
        let guard = self.command_lock().lock().await;

        let data = self
            .read_flash_locked(&guard, address, length, &mut progress)
            .await?;
        let device = self.flash_md5_locked(&guard, address, length).await?;
        self.verify(address, length, &data, &device)?;
        Ok(data)
    }

    /// Write `data` at `address` and confirm the region against the
    /// device-computed MD5.
    pub async fn write_flash(
        &self,
        address: u32,
        data: &[u8],
        mut progress: impl FnMut(usize, usize) + Send,
    ) -> Result<WriteOutcome> {
        self.require("write flash", &[Phase::Ready])?;
        let length = u32::try_from(data.len())
            .map_err(|_| Error::Unsupported(format!("{} bytes exceed the flash", data.len())))?;
        let guard = self.command_lock().lock().await;

        self.write_flash_locked(&guard, address, data, &mut progress)
            .await?;
        let device = self.flash_md5_locked(&guard, address, length).await?;
        let digest = self.verify(address, length, data, &device)?;

        Ok(WriteOutcome {
            address,
            length,
            digest,
        })
    }

    fn verify(&self, address: u32, length: u32, data: &[u8], device: &str) -> Result<String> {
        let local = digest::md5_hex(data);
        if digest::hex_eq(&local, device) {
            self.sink().debug(&format!(
                "Verified {length} bytes at 0x{address:08X} (md5 {local})"
            ));
            Ok(local)
        } else {
            self.sink().error(&format!(
                "Digest mismatch at 0x{address:08X}: local {local}, device {device}"
            ));
            Err(Error::Verification {
                address,
                length,
                local,
                device: device.to_string(),
            })
        }
    }
}

/// Decode an MD5 reply: 16 raw bytes from the stub or 32 hex characters
/// from the ROM.
fn parse_device_digest(data: &[u8]) -> Result<String> {
    match data.len() {
        DIGEST_LEN => Ok(hex::encode(data)),
        len if len == DIGEST_LEN * 2 => {
            let text = std::str::from_utf8(data)
                .map_err(|_| Error::Protocol("digest reply is not ASCII".into()))?;
            hex::decode(text)
                .map_err(|e| Error::Protocol(format!("digest reply is not hex: {e}")))?;
            Ok(text.to_ascii_lowercase())
        },
        len => Err(Error::Protocol(format!(
            "digest reply has {len} bytes, expected {DIGEST_LEN} or {}",
            DIGEST_LEN * 2
        ))),
    }
}
