//! Versioned session state.
//!
//! All mutation goes through [`StateCell::update`], which bumps the version
//! so observers can tell whether anything changed between two snapshots.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use crate::target::ChipKind;

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// No port attached, or the port was closed.
    #[default]
    Closed,
    /// Port attached and receive loop running; not yet synchronized.
    Opening,
    /// Synchronization handshake in progress.
    Syncing,
    /// Synchronized and the chip magic has been read.
    Identified,
    /// The stub answered its greeting.
    StubLoaded,
    /// SPI flash attached and configured; flash operations allowed.
    Ready,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Syncing => "syncing",
            Self::Identified => "identified",
            Self::StubLoaded => "stub loaded",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Snapshot of the session state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionState {
    /// Current phase.
    pub phase: Phase,
    /// Identified chip, `None` if not identified or unknown.
    pub chip: Option<ChipKind>,
    /// Whether the stub is running.
    pub stub_loaded: bool,
    /// Incremented on every update.
    pub version: u64,
}

/// Interior-mutable holder for [`SessionState`].
#[derive(Debug, Default)]
pub(crate) struct StateCell {
    inner: Mutex<SessionState>,
}

impl StateCell {
    pub(crate) fn snapshot(&self) -> SessionState {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn phase(&self) -> Phase {
        self.snapshot().phase
    }

    /// Apply `f` and bump the version.
    pub(crate) fn update(&self, f: impl FnOnce(&mut SessionState)) {
        let mut state = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
        state.version += 1;
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.update(|state| state.phase = phase);
    }

    /// Mark the session closed. The identified chip is kept for reporting.
    pub(crate) fn close(&self) {
        self.update(|state| {
            state.phase = Phase::Closed;
            state.stub_loaded = false;
        });
    }
}
