//! Running SHA-256 hash of the handshake transcript.
//!
//! Both ends feed the same messages in the same order; the digest binds
//! verifiers and signatures to everything said so far. Versioning gates
//! what gets hashed: auth versions below 4 hash only a bounded set of
//! legacy fields (V1 updates), version 4 hashes every whole marshalled
//! or unmarshalled message (V4 updates). An update tagged for the other
//! conversation version is a no-op.

use crate::crypto::SHA256_DIGEST_LEN;
use crate::msg::Message;
use sha2::{Digest, Sha256};

pub const CONVERSATION_V1: u16 = 1;
pub const CONVERSATION_V4: u16 = 4;

/// Whether the bytes entered the transcript on marshal or unmarshal.
/// The content hashed is identical; call sites document the direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashDirection {
    Marshaled,
    Unmarshaled,
}

pub struct ConversationHash {
    hasher: Sha256,
    auth_version: u32,
}

impl ConversationHash {
    pub fn new() -> ConversationHash {
        ConversationHash {
            hasher: Sha256::new(),
            auth_version: crate::types::REQUIRED_AUTH_VERSION,
        }
    }

    /// Install the negotiated version; gates all subsequent updates.
    pub fn set_version(&mut self, version: u32) {
        self.auth_version = version;
    }

    fn conversation_version(&self) -> u16 {
        if ((self.auth_version >> 16) as u16) < CONVERSATION_V4 {
            CONVERSATION_V1
        } else {
            CONVERSATION_V4
        }
    }

    /// Hash raw bytes if the negotiated conversation version matches.
    pub fn update_bytes(&mut self, version: u16, data: &[u8]) {
        if self.conversation_version() != version {
            return;
        }
        self.hasher.update(data);
    }

    /// Hash a whole message (header tuple + body). V4 only in practice.
    pub fn update_message(&mut self, version: u16, msg: &Message, _direction: HashDirection) {
        if self.conversation_version() != version {
            return;
        }
        self.hasher.update(msg.hash_input());
    }

    /// Drop everything hashed so far. Used when the peer turns out to
    /// negotiate below V4 after the initiator provisionally hashed the
    /// opening message.
    pub fn reset(&mut self) {
        self.hasher = Sha256::new();
    }

    /// Digest of the transcript so far; the running state is kept.
    pub fn digest(&self) -> [u8; SHA256_DIGEST_LEN] {
        self.hasher.clone().finalize().into()
    }
}

impl Default for ConversationHash {
    fn default() -> Self {
        Self::new()
    }
}
