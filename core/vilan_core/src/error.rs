//! Error types shared by the control session and the NAT traversal engine

use std::fmt;
use std::io;

use crate::codec::EncodeError;
use crate::state::PeerState;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Registration Failures
// ============================================================================

/// Negative registration result codes returned by the rendezvous server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// Malformed registration request
    ParamError,
    /// Group credential rejected
    BadCredential,
    /// Group does not allow automatic hardware address assignment
    GroupNotAuto,
    /// Group does not allow automatic IP assignment
    IpNotAuto,
    /// Requested IP does not belong to the group network
    IpMismatch,
    /// Address pool exhausted
    IpPoolFull,
    /// Identity already registered
    Duplicate,
    /// Server did not acknowledge the registration
    NoAck,
    /// Server assigned an unusable hardware address or IP
    InvalidAssignment,
    /// Code not known to this client
    Other(i32),
}

impl AuthFailure {
    /// Map a registration result code; non-negative codes are success
    pub fn from_code(code: i32) -> Option<Self> {
        let failure = match code {
            c if c >= 0 => return None,
            -1 => AuthFailure::ParamError,
            -2 => AuthFailure::BadCredential,
            -3 => AuthFailure::GroupNotAuto,
            -4 => AuthFailure::IpNotAuto,
            -5 => AuthFailure::IpMismatch,
            -6 => AuthFailure::IpPoolFull,
            -7 => AuthFailure::Duplicate,
            -100 => AuthFailure::NoAck,
            other => AuthFailure::Other(other),
        };
        Some(failure)
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthFailure::ParamError => write!(f, "invalid registration parameters"),
            AuthFailure::BadCredential => write!(f, "group credential rejected"),
            AuthFailure::GroupNotAuto => write!(f, "group does not assign hardware addresses"),
            AuthFailure::IpNotAuto => write!(f, "group does not assign IP addresses"),
            AuthFailure::IpMismatch => write!(f, "IP address does not match the group network"),
            AuthFailure::IpPoolFull => write!(f, "group address pool exhausted"),
            AuthFailure::Duplicate => write!(f, "peer already registered"),
            AuthFailure::NoAck => write!(f, "registration not acknowledged"),
            AuthFailure::InvalidAssignment => write!(f, "server assigned an unusable identity"),
            AuthFailure::Other(code) => write!(f, "registration failed with code {}", code),
        }
    }
}

// ============================================================================
// Traversal Failures
// ============================================================================

/// Reasons a direct link could not be negotiated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraversalError {
    /// Server reports the NAT pairing cannot be traversed
    Incompatible,
    /// Punch socket outlived its window without completing
    PunchExpired,
    /// No punch socket is open for the peer
    NoPunchSocket,
    /// Probe budget used up without a reply
    TriesExhausted,
    /// Broadcast and group addresses never get direct links
    NotUnicast,
    /// No pending link to probe
    NoPendingLink,
    /// Socket could not be opened or connected
    Socket(String),
}

impl fmt::Display for TraversalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraversalError::Incompatible => write!(f, "NAT combination cannot be traversed"),
            TraversalError::PunchExpired => write!(f, "punch socket expired"),
            TraversalError::NoPunchSocket => write!(f, "no punch socket"),
            TraversalError::TriesExhausted => write!(f, "direct probe attempts exhausted"),
            TraversalError::NotUnicast => write!(f, "destination is not unicast"),
            TraversalError::NoPendingLink => write!(f, "no pending link"),
            TraversalError::Socket(e) => write!(f, "socket error: {}", e),
        }
    }
}

impl std::error::Error for TraversalError {}

// ============================================================================
// Crate Error
// ============================================================================

#[derive(Debug)]
pub enum Error {
    /// Transport connect failure or server unreachable
    Connectivity(String),
    /// Registration rejected by the server
    Authentication(AuthFailure),
    /// Direct link negotiation failed
    Traversal(TraversalError),
    /// Outbound frame could not be encoded
    Frame(EncodeError),
    /// Configuration rejected or unusable
    Configuration(String),
    /// Operation requires a later session state
    NotReady(PeerState),
    /// Bounded wait elapsed without a response
    Timeout(&'static str),
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connectivity(e) => write!(f, "connectivity error: {}", e),
            Error::Authentication(e) => write!(f, "authentication error: {}", e),
            Error::Traversal(e) => write!(f, "traversal error: {}", e),
            Error::Frame(e) => write!(f, "frame error: {}", e),
            Error::Configuration(e) => write!(f, "configuration error: {}", e),
            Error::NotReady(state) => write!(f, "session not ready (state: {})", state),
            Error::Timeout(what) => write!(f, "timed out waiting for {}", what),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Traversal(e) => Some(e),
            Error::Frame(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<TraversalError> for Error {
    fn from(e: TraversalError) -> Self {
        Error::Traversal(e)
    }
}

impl From<EncodeError> for Error {
    fn from(e: EncodeError) -> Self {
        Error::Frame(e)
    }
}

impl From<AuthFailure> for Error {
    fn from(e: AuthFailure) -> Self {
        Error::Authentication(e)
    }
}

// ============================================================================
// Structured Outcome
// ============================================================================

/// Result of a session-level request/response operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub ok: bool,
    pub tip: String,
}

impl Outcome {
    pub fn success(tip: impl Into<String>) -> Self {
        Outcome {
            ok: true,
            tip: tip.into(),
        }
    }

    pub fn failure(tip: impl Into<String>) -> Self {
        Outcome {
            ok: false,
            tip: tip.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_code_mapping() {
        assert_eq!(AuthFailure::from_code(0), None);
        assert_eq!(AuthFailure::from_code(3), None);
        assert_eq!(AuthFailure::from_code(-2), Some(AuthFailure::BadCredential));
        assert_eq!(AuthFailure::from_code(-6), Some(AuthFailure::IpPoolFull));
        assert_eq!(AuthFailure::from_code(-100), Some(AuthFailure::NoAck));
        assert_eq!(AuthFailure::from_code(-42), Some(AuthFailure::Other(-42)));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::Authentication(AuthFailure::Duplicate).to_string(),
            "authentication error: peer already registered"
        );
        assert_eq!(
            Error::NotReady(PeerState::UnAck).to_string(),
            "session not ready (state: awaiting auth)"
        );
        assert_eq!(
            Error::from(TraversalError::Incompatible).to_string(),
            "traversal error: NAT combination cannot be traversed"
        );
    }
}
