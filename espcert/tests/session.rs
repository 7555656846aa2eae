//! Session tests against a simulated bootloader on an in-memory pipe.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use espcert::protocol::packet::{Opcode, Packet, checksum};
use espcert::protocol::{digest, slip};
use espcert::{
    ChipKind, Error, MemorySink, Phase, Segment, Session, SessionConfig, StubImage,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::Instant;

const MAGIC_REG: u32 = 0x4000_1000;
const ESP32S3_MAGIC: u32 = 0x9;
const FLASH_LEN: usize = 0x80000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Received(Opcode, u32),
    Responded(Opcode, u32),
}

#[derive(Debug, Clone)]
struct Behavior {
    sync_on_attempt: usize,
    magic: u32,
    mac: (u32, u32),
    greeting: Vec<u8>,
    flash: Vec<u8>,
    corrupt_read_trailer: bool,
    corrupt_flash_md5: bool,
    slow_register: Option<(u32, Duration)>,
    silent_register: Option<u32>,
    bare_register: Option<u32>,
    hang_up_on_register: Option<u32>,
    magic_changes_after: Option<usize>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            sync_on_attempt: 1,
            magic: ESP32S3_MAGIC,
            mac: (0x5566_7788, 0x0000_3344),
            greeting: b"OHAI".to_vec(),
            flash: (0..FLASH_LEN).map(|i| (i * 7 % 256) as u8).collect(),
            corrupt_read_trailer: false,
            corrupt_flash_md5: false,
            slow_register: None,
            silent_register: None,
            bare_register: None,
            hang_up_on_register: None,
            magic_changes_after: None,
        }
    }
}

#[derive(Debug, Default)]
struct Observed {
    events: Vec<Event>,
    sync_attempts: usize,
    read_flash_commands: usize,
    uploaded: usize,
    spi_total_size: Option<u32>,
    flash: Vec<u8>,
    errors: Vec<String>,
}

struct Device {
    io: DuplexStream,
    decoder: slip::SlipDecoder,
    queue: VecDeque<Vec<u8>>,
    behavior: Behavior,
    observed: Arc<Mutex<Observed>>,
    stub: bool,
    magic_reads: usize,
    flash_begin: u32,
}

fn word(payload: &[u8], index: usize) -> u32 {
    payload
        .get(index * 4..index * 4 + 4)
        .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

impl Device {
    fn absorb(&mut self, bytes: &[u8]) {
        for frame in self.decoder.decode(bytes) {
            if let Ok(packet) = Packet::parse(&frame) {
                if let Some(op) = packet.opcode() {
                    self.observed
                        .lock()
                        .unwrap()
                        .events
                        .push(Event::Received(op, word(&packet.payload, 0)));
                }
            }
            self.queue.push_back(frame);
        }
    }

    async fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            if let Some(frame) = self.queue.pop_front() {
                return Some(frame);
            }
            let mut buf = [0u8; 8192];
            let n = self.io.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            self.absorb(&buf[..n]);
        }
    }

    /// Keep reading (and logging) incoming frames for `duration`.
    async fn pause(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut buf = [0u8; 8192];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match tokio::time::timeout(remaining, self.io.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => self.absorb(&buf[..n]),
                Ok(_) => return,
                Err(_) => {},
            }
        }
    }

    async fn send(&mut self, payload: &[u8]) {
        let _ = self.io.write_all(&slip::encode(payload)).await;
    }

    async fn respond(&mut self, op: Opcode, value: u32, data: &[u8], arg: u32) {
        let mut payload = data.to_vec();
        payload.extend(std::iter::repeat_n(0u8, if self.stub { 2 } else { 4 }));
        self.send(&Packet::response(op, value, payload).to_bytes())
            .await;
        self.observed
            .lock()
            .unwrap()
            .events
            .push(Event::Responded(op, arg));
    }

    async fn run(mut self) {
        while let Some(frame) = self.next_frame().await {
            let Ok(packet) = Packet::parse(&frame) else {
                continue;
            };
            let Some(op) = packet.opcode() else {
                continue;
            };
            if !self.handle(op, &packet).await {
                break;
            }
        }
    }

    async fn handle(&mut self, op: Opcode, packet: &Packet) -> bool {
        let payload = &packet.payload;
        match op {
            Opcode::Sync => {
                let attempt = {
                    let mut observed = self.observed.lock().unwrap();
                    observed.sync_attempts += 1;
                    observed.sync_attempts
                };
                if attempt >= self.behavior.sync_on_attempt {
                    // The ROM answers SYNC more than once
                    self.respond(op, 0, &[], 0).await;
                    self.respond(op, 0, &[], 0).await;
                }
            },
            Opcode::ReadReg => {
                let address = word(payload, 0);
                if self.behavior.hang_up_on_register == Some(address) {
                    return false;
                }
                if self.behavior.silent_register == Some(address) {
                    return true;
                }
                if self.behavior.bare_register == Some(address) {
                    // No status trailer at all
                    self.send(&Packet::response(op, 0x5A5A, Vec::new()).to_bytes())
                        .await;
                    return true;
                }
                if let Some((slow, delay)) = self.behavior.slow_register {
                    if slow == address {
                        self.pause(delay).await;
                    }
                }
                let mac_base = ChipKind::Esp32s3.profile().mac_register;
                let value = if address == MAGIC_REG {
                    self.magic_reads += 1;
                    match self.behavior.magic_changes_after {
                        Some(n) if self.magic_reads > n => self.behavior.magic ^ 1,
                        _ => self.behavior.magic,
                    }
                } else if address == mac_base {
                    self.behavior.mac.0
                } else if address == mac_base + 4 {
                    self.behavior.mac.1
                } else {
                    0x1234
                };
                self.respond(op, value, &[], address).await;
            },
            Opcode::MemBegin => self.respond(op, 0, &[], 0).await,
            Opcode::MemData => {
                self.observed.lock().unwrap().uploaded += word(payload, 0) as usize;
                if packet.value != checksum(payload) {
                    self.observed
                        .lock()
                        .unwrap()
                        .errors
                        .push("bad MEM_DATA checksum".into());
                }
                self.respond(op, 0, &[], 0).await;
            },
            Opcode::MemEnd => {
                self.respond(op, 0, &[], 0).await;
                let greeting = self.behavior.greeting.clone();
                self.send(&greeting).await;
                self.stub = true;
            },
            Opcode::SpiAttach => self.respond(op, 0, &[], 0).await,
            Opcode::SpiSetParams => {
                self.observed.lock().unwrap().spi_total_size = Some(word(payload, 1));
                self.respond(op, 0, &[], 0).await;
            },
            Opcode::FlashBegin => {
                self.flash_begin = word(payload, 3);
                self.respond(op, 0, &[], 0).await;
            },
            Opcode::FlashData => {
                let len = word(payload, 0) as usize;
                let sequence = word(payload, 1) as usize;
                let start = self.flash_begin as usize + sequence * 4096;
                let end = (start + len).min(self.behavior.flash.len());
                if start < end {
                    self.behavior.flash[start..end].copy_from_slice(&payload[16..16 + end - start]);
                }
                if packet.value != checksum(payload) {
                    self.observed
                        .lock()
                        .unwrap()
                        .errors
                        .push("bad FLASH_DATA checksum".into());
                }
                self.observed.lock().unwrap().flash = self.behavior.flash.clone();
                self.respond(op, 0, &[], 0).await;
            },
            Opcode::FlashEnd => self.respond(op, 0, &[], 0).await,
            Opcode::SpiFlashMd5 => {
                let address = word(payload, 0) as usize;
                let size = word(payload, 1) as usize;
                let mut md5 = digest::md5(&self.behavior.flash[address..address + size]);
                if self.behavior.corrupt_flash_md5 {
                    md5[0] ^= 0xFF;
                }
                self.respond(op, 0, &md5, 0).await;
            },
            Opcode::ReadFlash => {
                self.observed.lock().unwrap().read_flash_commands += 1;
                let address = word(payload, 0) as usize;
                let size = word(payload, 1) as usize;
                let sector = word(payload, 2) as usize;
                self.respond(op, 0, &[], 0).await;

                let data = self.behavior.flash[address..address + size].to_vec();
                let mut sent = 0;
                for chunk in data.chunks(sector) {
                    self.send(chunk).await;
                    sent += chunk.len();
                    let Some(ack) = self.next_frame().await else {
                        return false;
                    };
                    if ack != (sent as u32).to_le_bytes() {
                        self.observed
                            .lock()
                            .unwrap()
                            .errors
                            .push(format!("bad ack {ack:02X?} after {sent} bytes"));
                    }
                }
                let mut md5 = digest::md5(&data);
                if self.behavior.corrupt_read_trailer {
                    md5[0] ^= 0xFF;
                }
                self.send(&md5).await;
            },
            _ => self.respond(op, 0, &[], 0).await,
        }
        true
    }
}

fn test_config() -> SessionConfig {
    SessionConfig {
        sync_timeout: Duration::from_millis(50),
        sync_delay: Duration::from_millis(10),
        command_timeout: Duration::from_millis(500),
        late_reply_grace: Duration::from_millis(300),
        read_idle_timeout: Duration::from_millis(500),
        reliability_duration: Duration::from_millis(200),
        ..SessionConfig::default()
    }
}

fn test_stub() -> StubImage {
    StubImage::new(
        Segment::new(0x4037_8000, vec![0xAA; 0x2000]),
        Segment::new(0x3FC9_0000, vec![0x55; 100]),
        0x4037_8100,
    )
    .unwrap()
}

fn open_with(behavior: Behavior, config: SessionConfig) -> (Session, Arc<Mutex<Observed>>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let (host, device_io) = tokio::io::duplex(1 << 16);
    let observed = Arc::new(Mutex::new(Observed::default()));
    let device = Device {
        io: device_io,
        decoder: slip::SlipDecoder::new(),
        queue: VecDeque::new(),
        behavior,
        observed: Arc::clone(&observed),
        stub: false,
        magic_reads: 0,
        flash_begin: 0,
    };
    tokio::spawn(device.run());

    let session = Session::open(host, config, Arc::new(MemorySink::new())).unwrap();
    (session, observed)
}

fn open(behavior: Behavior) -> (Session, Arc<Mutex<Observed>>) {
    open_with(behavior, test_config())
}

async fn ready(behavior: Behavior) -> (Session, Arc<Mutex<Observed>>) {
    let (session, observed) = open(behavior);
    session.sync().await.unwrap();
    session.download_stub(&test_stub()).await.unwrap();
    (session, observed)
}

#[tokio::test]
async fn test_sync_on_third_attempt_identifies_s3() {
    let (session, observed) = open(Behavior {
        sync_on_attempt: 3,
        ..Behavior::default()
    });
    assert_eq!(session.phase(), Phase::Opening);

    let chip = session.sync().await.unwrap();

    assert_eq!(chip, Some(ChipKind::Esp32s3));
    assert_eq!(session.phase(), Phase::Identified);
    assert_eq!(observed.lock().unwrap().sync_attempts, 3);
    session.expect_chip(ChipKind::Esp32s3).unwrap();
}

#[tokio::test]
async fn test_sync_gives_up() {
    let (session, observed) = open_with(
        Behavior {
            sync_on_attempt: usize::MAX,
            ..Behavior::default()
        },
        SessionConfig {
            sync_attempts: 4,
            ..test_config()
        },
    );

    let err = session.sync().await.unwrap_err();
    assert!(matches!(err, Error::SyncFailed { attempts: 4 }));
    assert_eq!(observed.lock().unwrap().sync_attempts, 4);
}

#[tokio::test]
async fn test_unknown_chip_is_not_fatal() {
    let (session, _) = open(Behavior {
        magic: 0x0BAD_C0DE,
        ..Behavior::default()
    });

    assert_eq!(session.sync().await.unwrap(), None);
    assert_eq!(session.phase(), Phase::Identified);
    assert!(matches!(
        session.expect_chip(ChipKind::Esp32),
        Err(Error::ChipMismatch {
            expected: ChipKind::Esp32,
            detected: None
        })
    ));
    // The session stays usable
    assert_eq!(session.read_reg(MAGIC_REG).await.unwrap(), 0x0BAD_C0DE);
}

#[tokio::test]
async fn test_read_mac() {
    let (session, _) = open(Behavior::default());
    session.sync().await.unwrap();
    assert_eq!(
        session.read_mac().await.unwrap().as_deref(),
        Some("33:44:55:66:77:88")
    );
}

#[tokio::test]
async fn test_read_mac_unprogrammed() {
    let (session, _) = open(Behavior {
        mac: (0, 0x3344),
        ..Behavior::default()
    });
    session.sync().await.unwrap();
    assert_eq!(session.read_mac().await.unwrap(), None);
}

#[tokio::test]
async fn test_stub_download() {
    let (session, observed) = ready(Behavior::default()).await;

    let state = session.state();
    assert_eq!(state.phase, Phase::Ready);
    assert!(state.stub_loaded);

    let observed = observed.lock().unwrap();
    assert_eq!(observed.uploaded, 0x2000 + 100);
    assert_eq!(observed.spi_total_size, Some(4 * 1024 * 1024));
    assert!(observed.errors.is_empty(), "{:?}", observed.errors);
}

#[tokio::test]
async fn test_stub_wrong_greeting() {
    let (session, _) = open(Behavior {
        greeting: b"HELLO".to_vec(),
        ..Behavior::default()
    });
    session.sync().await.unwrap();

    let err = session.download_stub(&test_stub()).await.unwrap_err();
    assert!(matches!(err, Error::StubExecution(_)), "{err}");
    assert_ne!(session.phase(), Phase::Ready);
}

#[tokio::test]
async fn test_flash_operations_require_ready() {
    let (session, _) = open(Behavior::default());
    session.sync().await.unwrap();

    assert!(matches!(
        session.read_flash(0, 16, |_, _| {}).await,
        Err(Error::InvalidState {
            phase: Phase::Identified,
            ..
        })
    ));
}

#[tokio::test]
async fn test_verified_read_spans_blocks() {
    let behavior = Behavior::default();
    let expected = behavior.flash[0x1000..0x1000 + 300_000].to_vec();
    let (session, observed) = ready(behavior).await;

    let mut last = (0, 0);
    let data = session
        .read_flash(0x1000, 300_000, |done, total| last = (done, total))
        .await
        .unwrap();

    assert_eq!(data, expected);
    assert_eq!(last, (300_000, 300_000));

    let observed = observed.lock().unwrap();
    // 64 sectors per block: 262144 + 37856
    assert_eq!(observed.read_flash_commands, 2);
    assert!(observed.errors.is_empty(), "{:?}", observed.errors);
}

#[tokio::test]
async fn test_corrupted_read_trailer_is_rejected() {
    let (session, _) = ready(Behavior {
        corrupt_read_trailer: true,
        ..Behavior::default()
    })
    .await;

    let err = session
        .read_flash_plain(0, 8192, |_, _| {})
        .await
        .unwrap_err();
    match err {
        Error::Verification { local, device, .. } => assert_ne!(local, device),
        other => panic!("expected verification error, got {other}"),
    }
}

#[tokio::test]
async fn test_device_md5_mismatch_on_read() {
    let (session, _) = ready(Behavior {
        corrupt_flash_md5: true,
        ..Behavior::default()
    })
    .await;

    assert!(matches!(
        session.read_flash(0, 4096, |_, _| {}).await,
        Err(Error::Verification { address: 0, length: 4096, .. })
    ));
}

#[tokio::test]
async fn test_read_past_address_space_is_rejected() {
    let (session, observed) = ready(Behavior::default()).await;

    assert!(matches!(
        session.read_flash_plain(0xFFFF_F000, 0x2000, |_, _| {}).await,
        Err(Error::Unsupported(_))
    ));
    assert!(matches!(
        session.write_flash_plain(0xFFFF_FF00, &[0u8; 0x200], |_, _| {}).await,
        Err(Error::Unsupported(_))
    ));
    assert_eq!(observed.lock().unwrap().read_flash_commands, 0);
}

#[tokio::test]
async fn test_verified_write() {
    let (session, observed) = ready(Behavior::default()).await;
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

    let mut calls = 0;
    let outcome = session
        .write_flash(0x2000, &data, |_, _| calls += 1)
        .await
        .unwrap();

    assert_eq!(outcome.address, 0x2000);
    assert_eq!(outcome.length, 10_000);
    assert_eq!(outcome.digest, digest::md5_hex(&data));
    assert_eq!(calls, 3);

    session.flash_finish(false).await.unwrap();

    let observed = observed.lock().unwrap();
    assert_eq!(&observed.flash[0x2000..0x2000 + data.len()], data.as_slice());
    assert!(observed.errors.is_empty(), "{:?}", observed.errors);
}

#[tokio::test]
async fn test_write_digest_mismatch() {
    let (session, _) = ready(Behavior {
        corrupt_flash_md5: true,
        ..Behavior::default()
    })
    .await;

    let err = session
        .write_flash(0, &[0x42; 100], |_, _| {})
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Verification { length: 100, .. }));
}

#[tokio::test]
async fn test_commands_are_serialized() {
    const SLOW: u32 = 0x6000_0000;
    let (session, observed) = open(Behavior {
        slow_register: Some((SLOW, Duration::from_millis(150))),
        ..Behavior::default()
    });
    session.sync().await.unwrap();
    let session = Arc::new(session);

    let first = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.read_reg(SLOW).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.read_reg(MAGIC_REG).await })
    };

    assert_eq!(first.await.unwrap().unwrap(), 0x1234);
    assert_eq!(second.await.unwrap().unwrap(), ESP32S3_MAGIC);

    let events = observed.lock().unwrap().events.clone();
    let position = |event| events.iter().rposition(|e| *e == event).unwrap();
    assert!(
        position(Event::Responded(Opcode::ReadReg, SLOW))
            < position(Event::Received(Opcode::ReadReg, MAGIC_REG)),
        "{events:?}"
    );
}

#[tokio::test]
async fn test_timeout_does_not_poison_later_commands() {
    const SILENT: u32 = 0x6000_1000;
    let (session, _) = open_with(
        Behavior {
            silent_register: Some(SILENT),
            ..Behavior::default()
        },
        SessionConfig {
            command_timeout: Duration::from_millis(100),
            ..test_config()
        },
    );
    session.sync().await.unwrap();

    assert!(matches!(
        session.read_reg(SILENT).await,
        Err(Error::Timeout(_))
    ));
    assert_eq!(session.read_reg(MAGIC_REG).await.unwrap(), ESP32S3_MAGIC);
}

#[tokio::test]
async fn test_late_reply_is_not_taken_for_the_next_answer() {
    const SLOW: u32 = 0x6000_3000;
    let (session, observed) = open_with(
        Behavior {
            slow_register: Some((SLOW, Duration::from_millis(150))),
            ..Behavior::default()
        },
        SessionConfig {
            command_timeout: Duration::from_millis(100),
            ..test_config()
        },
    );
    session.sync().await.unwrap();

    assert!(matches!(
        session.read_reg(SLOW).await,
        Err(Error::Timeout(_))
    ));
    // The slow register answers 0x1234 after the timeout; that reply must
    // not be mistaken for the magic value.
    assert_eq!(session.read_reg(MAGIC_REG).await.unwrap(), ESP32S3_MAGIC);
    assert_eq!(session.read_reg(MAGIC_REG).await.unwrap(), ESP32S3_MAGIC);

    let events = observed.lock().unwrap().events.clone();
    let find = |event, from| {
        events
            .iter()
            .skip(from)
            .position(|e| *e == event)
            .map(|i| i + from)
            .unwrap()
    };
    let slow_sent = find(Event::Received(Opcode::ReadReg, SLOW), 0);
    let responded = find(Event::Responded(Opcode::ReadReg, SLOW), slow_sent);
    let next_sent = find(Event::Received(Opcode::ReadReg, MAGIC_REG), slow_sent);
    assert!(responded < next_sent, "{events:?}");
}

#[tokio::test]
async fn test_response_without_status_is_malformed() {
    const BARE: u32 = 0x6000_4000;
    let (session, _) = open(Behavior {
        bare_register: Some(BARE),
        ..Behavior::default()
    });
    session.sync().await.unwrap();

    assert!(matches!(
        session.read_reg(BARE).await,
        Err(Error::MalformedPacket(_))
    ));
    assert_eq!(session.read_reg(MAGIC_REG).await.unwrap(), ESP32S3_MAGIC);
}

#[tokio::test]
async fn test_reliability() {
    let (session, _) = open(Behavior::default());
    session.sync().await.unwrap();

    let mut fractions = Vec::new();
    let reads = session
        .test_reliability(|f| fractions.push(f))
        .await
        .unwrap();

    assert!(reads > 0);
    assert_eq!(fractions.last().copied(), Some(1.0));
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_reliability_detects_mismatch() {
    let (session, _) = open(Behavior {
        // sync reads the magic once, the reference read is the second
        magic_changes_after: Some(4),
        ..Behavior::default()
    });
    session.sync().await.unwrap();

    assert!(matches!(
        session.test_reliability(|_| {}).await,
        Err(Error::Protocol(_))
    ));
}

#[tokio::test]
async fn test_device_hang_up_fails_pending_command() {
    const HANG_UP: u32 = 0x6000_2000;
    let (session, _) = open_with(
        Behavior {
            hang_up_on_register: Some(HANG_UP),
            ..Behavior::default()
        },
        SessionConfig {
            command_timeout: Duration::from_secs(5),
            ..test_config()
        },
    );
    session.sync().await.unwrap();

    let started = Instant::now();
    assert!(matches!(
        session.read_reg(HANG_UP).await,
        Err(Error::Connection(_))
    ));
    assert!(started.elapsed() < Duration::from_secs(5));

    // The receive loop marks the session closed once the stream ends
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.phase(), Phase::Closed);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let (session, _) = open(Behavior::default());
    session.sync().await.unwrap();

    session.disconnect().await;
    assert_eq!(session.phase(), Phase::Closed);
    session.disconnect().await;
    assert_eq!(session.phase(), Phase::Closed);

    assert!(matches!(
        session.read_reg(MAGIC_REG).await,
        Err(Error::InvalidState { .. })
    ));
}
