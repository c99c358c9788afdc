//! Worker readiness state, as tracked by the parent

use core::fmt;

/// Parent-side view of one pooled worker process.
///
/// ```text
///  spawn ──► UnknownReadiness ──marker──► Ready ──handoff──► Busy
///                   │                       ▲                  │
///                   │                       └─────marker───────┘
///                   └────── channel error (any state) ──► Dead ──► reaped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Just spawned, no ready marker seen yet
    UnknownReadiness = 0,

    /// Ready marker consumed, a connection may be handed over
    Ready = 1,

    /// Holding a connection; must re-signal before the next handoff
    Busy = 2,

    /// Control channel failed; waiting to be reaped
    Dead = 3,
}

impl WorkerState {
    /// Whether the worker's channel belongs in the poll wait-set.
    #[inline]
    pub const fn is_pollable(&self) -> bool {
        !matches!(self, WorkerState::Dead)
    }

    /// Whether a descriptor may be sent right now.
    ///
    /// Only a worker whose marker was just consumed qualifies, which is
    /// what keeps handoffs to one outstanding connection per worker.
    #[inline]
    pub const fn accepts_handoff(&self) -> bool {
        matches!(self, WorkerState::Ready)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::UnknownReadiness => "unknown",
            WorkerState::Ready => "ready",
            WorkerState::Busy => "busy",
            WorkerState::Dead => "dead",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pollable() {
        assert!(WorkerState::UnknownReadiness.is_pollable());
        assert!(WorkerState::Busy.is_pollable());
        assert!(!WorkerState::Dead.is_pollable());
    }

    #[test]
    fn test_only_ready_accepts_handoff() {
        assert!(WorkerState::Ready.accepts_handoff());
        assert!(!WorkerState::Busy.accepts_handoff());
        assert!(!WorkerState::UnknownReadiness.accepts_handoff());
        assert!(!WorkerState::Dead.accepts_handoff());
    }

    #[test]
    fn test_display() {
        assert_eq!(WorkerState::Busy.to_string(), "busy");
    }
}
