//! Response handler registry.
//!
//! The receive loop never waits on a caller: each decoded frame is routed to
//! whichever channel is registered for it, or logged and dropped.
//!
//! Routing order:
//!
//! 1. A valid response packet whose opcode has a handler goes to that handler.
//! 2. Anything else goes to the raw handler, if one is registered.
//! 3. Otherwise valid packets are logged as unsolicited and invalid frames
//!    as malformed.
//!
//! A command that timed out may still be answered. Its key is marked as
//! owing a reply until a deadline: the first matching response before the
//! deadline is discarded, whoever is registered, and
//! [`settle`](Registry::settle) lets the next command for that key wait it
//! out before transmitting.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use log::trace;
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::diag::DiagnosticSink;
use crate::error::{Error, Result};
use crate::protocol::packet::{Opcode, Packet};

/// What a handler is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKey {
    /// Response packets carrying this opcode.
    Command(Opcode),
    /// Frames that are not routed to a command handler.
    Raw,
}

/// A frame delivered to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A parsed response packet.
    Packet(Packet),
    /// An unparsed frame.
    Raw(Vec<u8>),
}

/// Where a frame ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Delivered to the handler for this opcode.
    Command(Opcode),
    /// Delivered to the raw handler.
    Raw,
    /// Late answer to a command that already timed out; discarded.
    Late(Opcode),
    /// Valid packet with no interested handler.
    Unsolicited,
    /// Invalid frame with no raw handler.
    Malformed,
}

#[derive(Debug, Default)]
struct Inner {
    handlers: HashMap<ResponseKey, UnboundedSender<Incoming>>,
    owed: HashMap<ResponseKey, Instant>,
    closed: bool,
}

/// Typed map from opcode-or-raw to a response channel.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Inner>,
    settled: Notify,
}

impl Registry {
    /// Create an open registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler for `key`, replacing any previous one.
    ///
    /// Fails once the registry is closed.
    pub fn register(&self, key: ResponseKey) -> Result<UnboundedReceiver<Incoming>> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::Connection("port is closed".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.handlers.insert(key, tx);
        Ok(rx)
    }

    /// Remove the handler for `key`.
    pub fn unregister(&self, key: ResponseKey) {
        self.lock().handlers.remove(&key);
    }

    /// Whether a handler for `key` is registered.
    pub fn is_registered(&self, key: ResponseKey) -> bool {
        self.lock().handlers.contains_key(&key)
    }

    /// Record that the device may still answer a timed-out command for
    /// `key` until `deadline`.
    pub fn mark_owed(&self, key: ResponseKey, deadline: Instant) {
        self.lock().owed.insert(key, deadline);
    }

    /// Whether a late reply for `key` is still expected.
    pub fn is_owed(&self, key: ResponseKey) -> bool {
        self.lock()
            .owed
            .get(&key)
            .is_some_and(|&deadline| deadline > Instant::now())
    }

    /// Wait until the reply owed for `key` has arrived or its deadline has
    /// passed. Returns at once if nothing is owed.
    pub async fn settle(&self, key: ResponseKey) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut inner = self.lock();
                match inner.owed.get(&key).copied() {
                    None => return,
                    Some(deadline) if deadline <= Instant::now() => {
                        inner.owed.remove(&key);
                        return;
                    },
                    Some(deadline) => deadline,
                }
            };

            let deadline = tokio::time::Instant::from_std(deadline);
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                trace!("Gave up waiting for late {key:?} reply");
                self.lock().owed.remove(&key);
                return;
            }
        }
    }

    /// Drop every handler and refuse new ones. Pending receivers observe a
    /// closed channel.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.handlers.clear();
        inner.owed.clear();
        drop(inner);
        self.settled.notify_waiters();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Route one decoded frame.
    pub fn dispatch(&self, frame: Vec<u8>, sink: &dyn DiagnosticSink) -> Routed {
        let parsed = Packet::parse(&frame);
        let mut inner = self.lock();

        let routable = parsed
            .as_ref()
            .ok()
            .filter(|packet| packet.is_response())
            .and_then(|packet| packet.opcode().map(|opcode| (packet, opcode)));

        if let Some((packet, opcode)) = routable {
            let key = ResponseKey::Command(opcode);
            if let Some(deadline) = inner.owed.remove(&key) {
                if deadline > Instant::now() {
                    drop(inner);
                    self.settled.notify_waiters();
                    sink.debug(&format!(
                        "Discarding late {opcode:?} response to a timed-out command"
                    ));
                    return Routed::Late(opcode);
                }
            }
            if let Some(tx) = inner.handlers.get(&key) {
                if tx.send(Incoming::Packet(packet.clone())).is_ok() {
                    trace!("Routed {opcode:?} response ({} bytes)", packet.payload.len());
                    return Routed::Command(opcode);
                }
                // Receiver gave up (timed out); forget it.
                inner.handlers.remove(&key);
            }
        }

        if let Some(tx) = inner.handlers.get(&ResponseKey::Raw) {
            let len = frame.len();
            if tx.send(Incoming::Raw(frame)).is_ok() {
                trace!("Routed raw frame ({len} bytes)");
                return Routed::Raw;
            }
            inner.handlers.remove(&ResponseKey::Raw);
        }
        drop(inner);

        match parsed {
            Ok(packet) => {
                sink.debug(&format!(
                    "Ignoring unsolicited packet: command 0x{:02X}, {} payload bytes",
                    packet.command,
                    packet.payload.len()
                ));
                Routed::Unsolicited
            },
            Err(e) => {
                sink.debug(&format!("Dropping frame: {e}"));
                Routed::Malformed
            },
        }
    }
}
