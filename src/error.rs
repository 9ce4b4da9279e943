//! Crate-wide error type
//!
//! Every fallible operation in the peering core returns `BusError`.
//! The variants mirror the statuses that cross the wire or reach the
//! completion callback; backends map their own failures into `Io`.

use thiserror::Error;

/// Error names sent on the wire in error replies.
pub const ERR_RESOURCES: &str = "org.thinbus.Error.Resources";
pub const ERR_REJECTED: &str = "org.thinbus.Error.Rejected";
pub const ERR_SECURITY_VIOLATION: &str = "org.thinbus.Error.SecurityViolation";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Handshake deadline exceeded or the peer vanished mid-handshake.
    #[error("handshake timeout")]
    Timeout,

    /// Cryptographic verification failure, unexpected state, unknown
    /// peer, or encryption required but absent.
    #[error("security violation")]
    Security,

    /// Allocation or table-full condition (reply contexts, concurrent
    /// handshake attempts).
    #[error("resources exhausted")]
    Resources,

    /// Malformed marshalled data. Policy/manifest unmarshal rolls the
    /// partial graph back and surfaces this.
    #[error("invalid data")]
    Invalid,

    /// The access control table denied the message.
    #[error("access denied")]
    Access,

    /// Lookup (message id, reply sender, credential slot) not found.
    #[error("no match")]
    NoMatch,

    /// Credential store backend failure.
    #[error("store error: {0}")]
    Io(String),
}

impl BusError {
    /// Wire error name for error replies.
    pub fn wire_name(&self) -> &'static str {
        match self {
            BusError::Resources => ERR_RESOURCES,
            _ => ERR_SECURITY_VIOLATION,
        }
    }

    /// Map a received wire error name back to a status.
    pub fn from_wire_name(name: &str) -> BusError {
        match name {
            ERR_RESOURCES => BusError::Resources,
            _ => BusError::Security,
        }
    }
}

impl From<sled::Error> for BusError {
    fn from(e: sled::Error) -> Self {
        BusError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
