//! Credential store: master secrets, ECDSA contexts, policy, manifest,
//! and membership certificates in non-volatile storage.
//!
//! The backend layout is its own concern; the core only requires that
//! each blob round-trips identically and that records expire. Two
//! backends are provided: a sled tree for real deployments and a
//! BTreeMap for tests. Records are bincode blobs (local storage only,
//! never network data).

use crate::error::{BusError, Result};
use crate::types::{now_secs, Guid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Credential record types. Per-peer records are keyed by the peer
/// GUID; local records have no peer. Membership certificates live in
/// numbered slots and are iterated in ascending slot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CredType {
    /// 48-byte master secret from a completed handshake (per peer).
    MasterSecret,
    /// SHA-256 manifest digest from the peer's identity certificate.
    EcdsaManifest,
    /// Subject + issuer public keys from the peer's identity chain.
    EcdsaKeys,
    /// The installed authorization policy (local, marshalled bytes).
    Policy,
    /// The local manifest (marshalled rule list).
    Manifest,
    /// A membership certificate chain (slot-iterated, DER).
    MembershipCert,
}

impl CredType {
    fn tag(self) -> u8 {
        match self {
            CredType::MasterSecret => 1,
            CredType::EcdsaManifest => 2,
            CredType::EcdsaKeys => 3,
            CredType::Policy => 4,
            CredType::Manifest => 5,
            CredType::MembershipCert => 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Unix seconds; 0 means the record never expires.
    pub expiration: u64,
    pub data: Vec<u8>,
}

impl CredentialRecord {
    pub fn expired(&self) -> bool {
        self.expiration != 0 && self.expiration <= now_secs()
    }
}

/// Abstract store operations. Backends serialize access themselves; the
/// core reads then maybe writes, and treats NotFound (`Ok(None)`) as
/// acceptable during handshake preparation.
pub trait CredentialStore {
    fn get(&self, ctype: CredType, peer: Option<&Guid>) -> Result<Option<CredentialRecord>>;
    fn set(
        &mut self,
        ctype: CredType,
        peer: Option<&Guid>,
        expiration: u64,
        data: &[u8],
    ) -> Result<()>;
    fn delete(&mut self, ctype: CredType, peer: Option<&Guid>) -> Result<()>;
    /// Delete every per-peer record for a GUID (stale-credential path).
    fn delete_peer(&mut self, peer: &Guid) -> Result<()>;
    /// Store a slot-iterated record; returns the slot id.
    fn append_slot(&mut self, ctype: CredType, expiration: u64, data: &[u8]) -> Result<u16>;
    /// First record of `ctype` at slot >= `cursor`, with its slot id.
    fn next_slot(&self, ctype: CredType, cursor: u16) -> Result<Option<(u16, CredentialRecord)>>;
}

fn store_key(ctype: CredType, peer: Option<&Guid>, slot: u16) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 16 + 2);
    key.push(ctype.tag());
    if let Some(g) = peer {
        key.extend_from_slice(g.as_bytes());
    }
    key.extend_from_slice(&slot.to_be_bytes());
    key
}

// =============================================================================
// IN-MEMORY BACKEND
// =============================================================================

#[derive(Default)]
pub struct MemoryCredentialStore {
    records: BTreeMap<Vec<u8>, CredentialRecord>,
    next_slot: u16,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, ctype: CredType, peer: Option<&Guid>) -> Result<Option<CredentialRecord>> {
        Ok(self.records.get(&store_key(ctype, peer, 0)).cloned())
    }

    fn set(
        &mut self,
        ctype: CredType,
        peer: Option<&Guid>,
        expiration: u64,
        data: &[u8],
    ) -> Result<()> {
        self.records.insert(
            store_key(ctype, peer, 0),
            CredentialRecord { expiration, data: data.to_vec() },
        );
        Ok(())
    }

    fn delete(&mut self, ctype: CredType, peer: Option<&Guid>) -> Result<()> {
        self.records.remove(&store_key(ctype, peer, 0));
        Ok(())
    }

    fn delete_peer(&mut self, peer: &Guid) -> Result<()> {
        for ctype in [CredType::MasterSecret, CredType::EcdsaManifest, CredType::EcdsaKeys] {
            self.records.remove(&store_key(ctype, Some(peer), 0));
        }
        Ok(())
    }

    fn append_slot(&mut self, ctype: CredType, expiration: u64, data: &[u8]) -> Result<u16> {
        let slot = self.next_slot;
        self.next_slot = self.next_slot.checked_add(1).ok_or(BusError::Resources)?;
        self.records.insert(
            store_key(ctype, None, slot),
            CredentialRecord { expiration, data: data.to_vec() },
        );
        Ok(slot)
    }

    fn next_slot(&self, ctype: CredType, cursor: u16) -> Result<Option<(u16, CredentialRecord)>> {
        let lo = store_key(ctype, None, cursor);
        let hi = store_key(ctype, None, u16::MAX);
        for (key, record) in self.records.range(lo..=hi) {
            let slot = u16::from_be_bytes([key[key.len() - 2], key[key.len() - 1]]);
            return Ok(Some((slot, record.clone())));
        }
        Ok(None)
    }
}

// =============================================================================
// SLED BACKEND
// =============================================================================

pub struct SledCredentialStore {
    db: sled::Db,
}

impl SledCredentialStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { db: sled::open(path)? })
    }

    fn decode(value: &[u8]) -> Result<CredentialRecord> {
        bincode::deserialize(value).map_err(|e| BusError::Io(e.to_string()))
    }

    fn encode(record: &CredentialRecord) -> Result<Vec<u8>> {
        bincode::serialize(record).map_err(|e| BusError::Io(e.to_string()))
    }
}

impl CredentialStore for SledCredentialStore {
    fn get(&self, ctype: CredType, peer: Option<&Guid>) -> Result<Option<CredentialRecord>> {
        match self.db.get(store_key(ctype, peer, 0))? {
            Some(value) => Ok(Some(Self::decode(&value)?)),
            None => Ok(None),
        }
    }

    fn set(
        &mut self,
        ctype: CredType,
        peer: Option<&Guid>,
        expiration: u64,
        data: &[u8],
    ) -> Result<()> {
        let record = CredentialRecord { expiration, data: data.to_vec() };
        self.db.insert(store_key(ctype, peer, 0), Self::encode(&record)?)?;
        self.db.flush()?;
        Ok(())
    }

    fn delete(&mut self, ctype: CredType, peer: Option<&Guid>) -> Result<()> {
        self.db.remove(store_key(ctype, peer, 0))?;
        Ok(())
    }

    fn delete_peer(&mut self, peer: &Guid) -> Result<()> {
        for ctype in [CredType::MasterSecret, CredType::EcdsaManifest, CredType::EcdsaKeys] {
            self.db.remove(store_key(ctype, Some(peer), 0))?;
        }
        self.db.flush()?;
        Ok(())
    }

    fn append_slot(&mut self, ctype: CredType, expiration: u64, data: &[u8]) -> Result<u16> {
        // Scan for the first free slot; membership counts are small.
        let mut slot = 0u16;
        while self.db.get(store_key(ctype, None, slot))?.is_some() {
            slot = slot.checked_add(1).ok_or(BusError::Resources)?;
        }
        let record = CredentialRecord { expiration, data: data.to_vec() };
        self.db.insert(store_key(ctype, None, slot), Self::encode(&record)?)?;
        self.db.flush()?;
        Ok(slot)
    }

    fn next_slot(&self, ctype: CredType, cursor: u16) -> Result<Option<(u16, CredentialRecord)>> {
        let prefix = [ctype.tag()];
        for item in self.db.scan_prefix(prefix) {
            let (key, value) = item?;
            let slot = u16::from_be_bytes([key[key.len() - 2], key[key.len() - 1]]);
            if slot >= cursor {
                return Ok(Some((slot, Self::decode(&value)?)));
            }
        }
        Ok(None)
    }
}
