//! ESP serial bootloader packets.
//!
//! ## Packet Format
//!
//! ```text
//! +-----------+---------+----------+-------------------+-----------+
//! | Direction | Command |   Size   | Value / Checksum  |  Payload  |
//! +-----------+---------+----------+-------------------+-----------+
//! |     1     |    1    | 2 (LE)   |       4 (LE)      |   Size    |
//! +-----------+---------+----------+-------------------+-----------+
//! ```
//!
//! Requests carry a checksum in the 32-bit field; responses carry a value
//! (for example the register contents answering `READ_REG`).

use {
    crate::error::{Error, Result},
    byteorder::{LittleEndian, WriteBytesExt},
    num_enum::{IntoPrimitive, TryFromPrimitive},
};

/// Length of the fixed packet header.
pub const HEADER_LEN: usize = 8;

/// Seed for the data checksum.
pub const CHECKSUM_SEED: u8 = 0xEF;

/// Largest direction byte accepted by [`Packet::parse`].
pub const MAX_DIRECTION: u8 = 2;

/// Block size used for `FLASH_DATA` packets.
pub const FLASH_WRITE_SIZE: usize = 0x1000;

/// Block size used for `MEM_DATA` packets.
pub const MEM_WRITE_SIZE: usize = 0x1800;

/// SYNC payload: `07 07 12 20` followed by 32 bytes of `0x55`.
pub const SYNC_PAYLOAD: [u8; 36] = {
    let mut payload = [0x55u8; 36];
    payload[0] = 0x07;
    payload[1] = 0x07;
    payload[2] = 0x12;
    payload[3] = 0x20;
    payload
};

/// Packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Direction {
    /// Host to device.
    Request = 0x00,
    /// Device to host.
    Response = 0x01,
}

/// Bootloader command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Begin a flash write.
    FlashBegin = 0x02,
    /// Flash write data block.
    FlashData = 0x03,
    /// Finish a flash write.
    FlashEnd = 0x04,
    /// Begin a RAM upload.
    MemBegin = 0x05,
    /// Finish a RAM upload and optionally jump to an entry point.
    MemEnd = 0x06,
    /// RAM upload data block.
    MemData = 0x07,
    /// Synchronization handshake.
    Sync = 0x08,
    /// Write a 32-bit register.
    WriteReg = 0x09,
    /// Read a 32-bit register.
    ReadReg = 0x0A,
    /// Configure SPI flash geometry.
    SpiSetParams = 0x0B,
    /// Attach the SPI flash.
    SpiAttach = 0x0D,
    /// Change the UART baud rate.
    ChangeBaudrate = 0x0F,
    /// Begin a compressed flash write.
    FlashDeflBegin = 0x10,
    /// Compressed flash write data block.
    FlashDeflData = 0x11,
    /// Finish a compressed flash write.
    FlashDeflEnd = 0x12,
    /// Compute the MD5 of a flash region.
    SpiFlashMd5 = 0x13,
    /// Read security information.
    GetSecurityInfo = 0x14,
    /// Erase the whole flash (stub only).
    EraseFlash = 0xD0,
    /// Erase a flash region (stub only).
    EraseRegion = 0xD1,
    /// Stream a flash region to the host (stub only).
    ReadFlash = 0xD2,
    /// Exit the loader and run user code (stub only).
    RunUserCode = 0xD3,
}

/// A decoded (unframed) bootloader packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Direction byte.
    pub direction: u8,
    /// Raw command byte.
    pub command: u8,
    /// Value (responses) or checksum (requests).
    pub value: u32,
    /// Packet payload; its length equals the declared size.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a request packet, computing the checksum over the payload.
    pub fn request(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            direction: Direction::Request.into(),
            command: opcode.into(),
            value: checksum(&payload),
            payload,
        }
    }

    /// Build a response packet.
    pub fn response(opcode: Opcode, value: u32, payload: Vec<u8>) -> Self {
        Self {
            direction: Direction::Response.into(),
            command: opcode.into(),
            value,
            payload,
        }
    }

    /// Parse a packet from a decoded frame.
    ///
    /// The frame must be exactly `HEADER_LEN + size` bytes long.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_LEN {
            return Err(Error::MalformedPacket(format!(
                "frame too short: {} bytes",
                frame.len()
            )));
        }

        let direction = frame[0];
        if direction > MAX_DIRECTION {
            return Err(Error::MalformedPacket(format!(
                "invalid direction 0x{direction:02X}"
            )));
        }

        let size = usize::from(u16::from_le_bytes([frame[2], frame[3]]));
        if size + HEADER_LEN != frame.len() {
            return Err(Error::MalformedPacket(format!(
                "declared size {size} but frame carries {} payload bytes",
                frame.len() - HEADER_LEN
            )));
        }

        Ok(Self {
            direction,
            command: frame[1],
            value: u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]),
            payload: frame[HEADER_LEN..].to_vec(),
        })
    }

    /// Serialize to unframed bytes.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.direction);
        buf.push(self.command);
        // Safe cast: payloads are bounded by the block sizes above
        buf.write_u16::<LittleEndian>(self.payload.len() as u16)
            .unwrap();
        buf.write_u32::<LittleEndian>(self.value).unwrap();
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Declared payload size.
    pub fn size(&self) -> u16 {
        self.payload.len() as u16
    }

    /// Typed opcode, if the command byte is known.
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::try_from(self.command).ok()
    }

    /// Whether this packet travels device to host.
    pub fn is_response(&self) -> bool {
        self.direction == u8::from(Direction::Response)
    }
}

/// Checksum placed in the value field of a request.
///
/// Only payloads longer than 32 bytes are checksummed: the seed is XORed
/// with every byte from offset 16 on (the data following a data-command
/// header).
pub fn checksum(payload: &[u8]) -> u32 {
    if payload.len() <= 32 {
        return 0;
    }
    u32::from(
        payload[16..]
            .iter()
            .fold(CHECKSUM_SEED, |acc, &b| acc ^ b),
    )
}

/// Flash geometry sent with `SPI_SET_PARAMS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiParams {
    /// Total flash size in bytes.
    pub total_size: u32,
    /// Erase block size.
    pub block_size: u32,
    /// Sector size.
    pub sector_size: u32,
    /// Page size.
    pub page_size: u32,
    /// Status register mask.
    pub status_mask: u32,
}

impl SpiParams {
    /// Fixed geometry for a flash of `total_size` bytes.
    pub fn for_size(total_size: u32) -> Self {
        Self {
            total_size,
            block_size: 64 * 1024,
            sector_size: 4 * 1024,
            page_size: 256,
            status_mask: 0xFFFF,
        }
    }
}

/// Commands issued by the host.
#[derive(Debug, Clone, Copy)]
pub enum Command<'a> {
    /// Begin a flash write of `size` bytes at `offset`.
    FlashBegin {
        /// Total bytes to write.
        size: u32,
        /// Number of data packets.
        blocks: u32,
        /// Bytes per data packet.
        block_size: u32,
        /// Flash offset.
        offset: u32,
    },
    /// One flash data packet.
    FlashData {
        /// Block contents (padded to [`FLASH_WRITE_SIZE`] with 0xFF).
        data: &'a [u8],
        /// Sequence number.
        sequence: u32,
    },
    /// Finish the flash write.
    FlashEnd {
        /// Reboot into the application afterwards.
        reboot: bool,
    },
    /// Begin a RAM upload.
    MemBegin {
        /// Segment size.
        size: u32,
        /// Number of data packets.
        blocks: u32,
        /// Bytes per data packet.
        block_size: u32,
        /// Load address.
        offset: u32,
    },
    /// One RAM data packet.
    MemData {
        /// Block contents.
        data: &'a [u8],
        /// Sequence number.
        sequence: u32,
    },
    /// Finish the RAM upload and jump to `entry`.
    MemEnd {
        /// Entry point address.
        entry: u32,
    },
    /// Synchronization handshake.
    Sync,
    /// Read a 32-bit register.
    ReadReg {
        /// Register address.
        address: u32,
    },
    /// Configure flash geometry.
    SpiSetParams {
        /// Geometry to configure.
        params: SpiParams,
    },
    /// Attach the default SPI flash pins.
    SpiAttach,
    /// Compute the MD5 of a flash region on the device.
    FlashMd5 {
        /// Flash offset.
        offset: u32,
        /// Region length.
        size: u32,
    },
    /// Stream a flash region to the host.
    ReadFlash {
        /// Flash offset.
        offset: u32,
        /// Region length.
        size: u32,
        /// Bytes per streamed packet.
        sector_size: u32,
        /// Packets the device may send before waiting for an acknowledgement.
        max_in_flight: u32,
    },
}

impl Command<'_> {
    /// Opcode of this command.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::FlashBegin { .. } => Opcode::FlashBegin,
            Self::FlashData { .. } => Opcode::FlashData,
            Self::FlashEnd { .. } => Opcode::FlashEnd,
            Self::MemBegin { .. } => Opcode::MemBegin,
            Self::MemData { .. } => Opcode::MemData,
            Self::MemEnd { .. } => Opcode::MemEnd,
            Self::Sync => Opcode::Sync,
            Self::ReadReg { .. } => Opcode::ReadReg,
            Self::SpiSetParams { .. } => Opcode::SpiSetParams,
            Self::SpiAttach => Opcode::SpiAttach,
            Self::FlashMd5 { .. } => Opcode::SpiFlashMd5,
            Self::ReadFlash { .. } => Opcode::ReadFlash,
        }
    }

    /// Encode the command payload.
    pub fn payload(&self) -> Vec<u8> {
        match *self {
            Self::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
            }
            | Self::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => words(&[size, blocks, block_size, offset]),
            Self::FlashData { data, sequence } => {
                let mut payload = data_header(FLASH_WRITE_SIZE, sequence);
                payload.extend_from_slice(data);
                payload.resize(16 + FLASH_WRITE_SIZE, 0xFF);
                payload
            },
            Self::MemData { data, sequence } => {
                let mut payload = data_header(data.len(), sequence);
                payload.extend_from_slice(data);
                payload
            },
            // 0 means reboot, 1 means stay in the loader
            Self::FlashEnd { reboot } => words(&[u32::from(!reboot)]),
            Self::MemEnd { entry } => words(&[u32::from(entry == 0), entry]),
            Self::Sync => SYNC_PAYLOAD.to_vec(),
            Self::ReadReg { address } => words(&[address]),
            Self::SpiSetParams { params } => words(&[
                0, // flash id
                params.total_size,
                params.block_size,
                params.sector_size,
                params.page_size,
                params.status_mask,
            ]),
            Self::SpiAttach => words(&[0, 0]),
            Self::FlashMd5 { offset, size } => words(&[offset, size, 0, 0]),
            Self::ReadFlash {
                offset,
                size,
                sector_size,
                max_in_flight,
            } => words(&[offset, size, sector_size, max_in_flight]),
        }
    }

    /// Build the request packet.
    pub fn to_packet(&self) -> Packet {
        Packet::request(self.opcode(), self.payload())
    }
}

fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn data_header(len: usize, sequence: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(16 + len);
    header.extend(words(&[len as u32, sequence, 0, 0]));
    header
}
