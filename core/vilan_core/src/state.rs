//! Control session state
//!
//! ```text
//! UnInit ──► InitError
//!    │
//!    └─────► InitOk ──► UnConn ⇄ ConnOk ──► UnAck ──► AuthFail
//!                                                 └─► Ok
//! ```
//!
//! States are ordered; callers compare against `ConnOk` to decide whether a
//! transport-level connection to the server exists.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Registration state of the local peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PeerState {
    UnInit = 0,
    InitError = 1,
    InitOk = 2,
    UnConn = 3,
    ConnOk = 4,
    UnAck = 5,
    AuthFail = 6,
    Ok = 7,
}

impl PeerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => PeerState::InitError,
            2 => PeerState::InitOk,
            3 => PeerState::UnConn,
            4 => PeerState::ConnOk,
            5 => PeerState::UnAck,
            6 => PeerState::AuthFail,
            7 => PeerState::Ok,
            _ => PeerState::UnInit,
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::UnInit => "uninitialized",
            PeerState::InitError => "init error",
            PeerState::InitOk => "initialized",
            PeerState::UnConn => "disconnected",
            PeerState::ConnOk => "connected",
            PeerState::UnAck => "awaiting auth",
            PeerState::AuthFail => "auth failed",
            PeerState::Ok => "online",
        };
        f.write_str(name)
    }
}

/// Shared, lock-free holder of the current [`PeerState`]
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: PeerState) -> Self {
        StateCell(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> PeerState {
        PeerState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store a new state, returning the previous one
    pub fn set(&self, state: PeerState) -> PeerState {
        let prev = PeerState::from_u8(self.0.swap(state as u8, Ordering::AcqRel));
        if prev != state {
            log::info!("peer state: {} -> {}", prev, state);
        }
        prev
    }
}

impl Default for StateCell {
    fn default() -> Self {
        StateCell::new(PeerState::UnInit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(PeerState::UnConn < PeerState::ConnOk);
        assert!(PeerState::UnAck >= PeerState::ConnOk);
        assert!(PeerState::AuthFail >= PeerState::ConnOk);
        assert!(PeerState::Ok > PeerState::AuthFail);
    }

    #[test]
    fn test_state_cell_swap() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), PeerState::UnInit);
        assert_eq!(cell.set(PeerState::InitOk), PeerState::UnInit);
        assert_eq!(cell.set(PeerState::Ok), PeerState::InitOk);
        assert_eq!(cell.get(), PeerState::Ok);
    }

    #[test]
    fn test_state_roundtrip_raw() {
        for state in [
            PeerState::UnInit,
            PeerState::InitError,
            PeerState::InitOk,
            PeerState::UnConn,
            PeerState::ConnOk,
            PeerState::UnAck,
            PeerState::AuthFail,
            PeerState::Ok,
        ] {
            assert_eq!(PeerState::from_u8(state as u8), state);
        }
    }
}
