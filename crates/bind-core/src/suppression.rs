//! Feedback-loop suppression between the remote and local directions.
//!
//! Two devices:
//! - `SyncPhase` per entity. While an entity is `ApplyingRemote`, local change
//!   handlers must not write back to the remote. Phases are entered through a
//!   `PhaseGuard`, which restores the previous phase when dropped, so the
//!   phase can never outlive the remote handler that set it.
//! - `SilentEchoes` per collection. A silent add/remove arms a token for the
//!   child id; the matching remote echo consumes it and is applied without a
//!   local signal.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use tracing::warn;

/// What an entity is currently doing with respect to synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    /// Mutated as a direct result of a remote event. Do not re-propagate.
    ApplyingRemote,
    /// An outbound write for a local change is being issued.
    EmittingLocal,
}

impl SyncPhase {
    pub fn suppresses_outbound(self) -> bool {
        self == SyncPhase::ApplyingRemote
    }
}

/// RAII guard for a `SyncPhase` transition.
#[must_use = "the phase is restored as soon as the guard drops"]
pub struct PhaseGuard<'a> {
    cell: &'a Cell<SyncPhase>,
    previous: SyncPhase,
}

impl<'a> PhaseGuard<'a> {
    pub(crate) fn enter(cell: &'a Cell<SyncPhase>, phase: SyncPhase) -> Self {
        let previous = cell.replace(phase);
        if previous == SyncPhase::ApplyingRemote && phase == SyncPhase::ApplyingRemote {
            warn!("nested remote apply on the same entity");
        }
        Self { cell, previous }
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.cell.set(self.previous);
    }
}

/// Kind of remote echo a silent local edit expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EchoKind {
    Added,
    Removed,
}

/// Pending silent echoes, keyed by child id.
#[derive(Debug, Default)]
pub struct SilentEchoes {
    pending: RefCell<HashSet<(EchoKind, String)>>,
}

impl SilentEchoes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, kind: EchoKind, id: &str) {
        self.pending.borrow_mut().insert((kind, id.to_string()));
    }

    /// Consume the token for this echo. Returns true if it was armed.
    pub fn consume(&self, kind: EchoKind, id: &str) -> bool {
        self.pending.borrow_mut().remove(&(kind, id.to_string()))
    }

    /// Drop a token whose echo will never arrive (failed write).
    pub fn disarm(&self, kind: EchoKind, id: &str) {
        self.consume(kind, id);
    }

    pub fn is_armed(&self, kind: EchoKind, id: &str) -> bool {
        self.pending.borrow().contains(&(kind, id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }
}
