// thinbus: Core Types and Protocol Constants

//! Core types and constants for the secure peering protocol.
//!
//! # Design Goals
//!
//! 1. **Bounded state**: the name map, access table and reply-context
//!    table are all fixed capacity; a peer cannot grow them.
//!
//! 2. **Single live handshake**: exactly one authentication context
//!    exists at a time; a second attempt while one is live fails with
//!    `Resources` unless the first has timed out.
//!
//! 3. **No secrets after clear**: the master secret and PSK buffers are
//!    zeroized when the auth context is cleared.

use crate::error::{BusError, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

// =============================================================================
// PROTOCOL VERSIONS
// =============================================================================

/// Minimum peer authentication version we interoperate with.
pub const MIN_AUTH_VERSION: u16 = 2;

/// Maximum (current) peer authentication version.
/// Version 4 hashes every whole handshake message into the conversation.
pub const MAX_AUTH_VERSION: u16 = 4;

/// Key generation algorithm version (only one defined).
pub const MAX_KEYGEN_VERSION: u16 = 0;

/// The version we require: auth version in the high 16 bits, keygen
/// version in the low 16 bits.
pub const REQUIRED_AUTH_VERSION: u32 = (MAX_AUTH_VERSION as u32) << 16;

// =============================================================================
// KEY MATERIAL SIZES
// =============================================================================

/// Master secret length, derived once per peering and cached.
pub const MASTER_SECRET_LEN: usize = 48;

/// Per-connection symmetric session key length.
pub const SESSION_KEY_LEN: usize = 16;

/// Verifier length; exchanged as 2x hex characters.
pub const VERIFIER_LEN: usize = 12;

/// Raw nonce length; rendered as 28 ASCII hex characters on the wire.
pub const NONCE_LEN: usize = 14;

/// GUID length.
pub const GUID_LEN: usize = 16;

// =============================================================================
// LIMITS
// =============================================================================

/// Maximum distinct peers tracked in the name map. Each access-table row
/// carries one access byte per slot, so this bounds table memory.
pub const NAME_MAP_SIZE: usize = 8;

/// Outstanding method calls tracked at once.
pub const NUM_REPLY_CONTEXTS: usize = 8;

/// Default handshake deadline. One monotonic deadline gates every
/// handshake re-entry; there is no per-step timer.
pub const MAX_HANDSHAKE_TIME: Duration = Duration::from_secs(30);

/// Default reply timeout for outgoing method calls.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(20);

// =============================================================================
// GUID
// =============================================================================

/// A 16-byte peer identity, remembered across reboots. Credentials are
/// keyed off it. The all-zero GUID is reserved to mean "absent".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guid(pub [u8; GUID_LEN]);

impl Guid {
    pub const ZERO: Guid = Guid([0u8; GUID_LEN]);

    pub fn random() -> Guid {
        let mut g = [0u8; GUID_LEN];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut g);
        Guid(g)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Render as 32 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from 32 hex characters.
    pub fn from_hex(s: &str) -> Result<Guid> {
        let bytes = hex::decode(s).map_err(|_| BusError::Security)?;
        let arr: [u8; GUID_LEN] = bytes.try_into().map_err(|_| BusError::Security)?;
        Ok(Guid(arr))
    }

    pub fn as_bytes(&self) -> &[u8; GUID_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Guid({})", &self.to_hex()[..8])
    }
}

// =============================================================================
// TIMER
// =============================================================================

/// Monotonic stopwatch for handshake and reply deadlines.
#[derive(Debug, Clone, Copy)]
pub struct Timer(Instant);

impl Timer {
    pub fn start() -> Timer {
        Timer(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }

    pub fn expired(&self, limit: Duration) -> bool {
        self.elapsed() >= limit
    }
}

/// Seconds since the unix epoch; credential expirations compare against
/// this. Timestamps are local only and never cross the wire.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
