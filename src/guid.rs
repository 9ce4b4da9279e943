//! Name to GUID mapping for the connection's lifetime.
//!
//! The map is authoritative for identifying the authenticated
//! counterparty on a given reply: the peer index assigned here is the
//! index into every access-table row, and the session key produced by
//! the handshake is registered against the entry.
//!
//! Instead of pointer identity, each entry carries a connection epoch:
//! a global counter bumped on every mapping change. Handlers capture
//! the epoch at handshake start and abort when it no longer matches.

use crate::error::{BusError, Result};
use crate::types::{Guid, NAME_MAP_SIZE, SESSION_KEY_LEN};
use zeroize::Zeroize;

/// Session-key role: which side of the key agreement this endpoint was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone)]
struct NameEntry {
    guid: Guid,
    unique: String,
    well_known: Option<String>,
    epoch: u64,
    session_key: Option<[u8; SESSION_KEY_LEN]>,
    key_role: Option<KeyRole>,
    key_version: u32,
    group_key: Option<[u8; SESSION_KEY_LEN]>,
}

/// Fixed-capacity name map; the slot index is the peer index used by
/// the access control table.
pub struct NameMap {
    slots: Vec<Option<NameEntry>>,
    next_epoch: u64,
}

impl Default for NameMap {
    fn default() -> Self {
        Self::new()
    }
}

impl NameMap {
    pub fn new() -> NameMap {
        NameMap { slots: vec![None; NAME_MAP_SIZE], next_epoch: 1 }
    }

    fn bump(&mut self) -> u64 {
        let e = self.next_epoch;
        self.next_epoch += 1;
        e
    }

    /// Install or replace the mapping for a peer's unique name.
    /// Replacing an existing entry bumps the epoch, which invalidates
    /// any handshake that captured the old one.
    pub fn add_mapping(
        &mut self,
        guid: Guid,
        unique: &str,
        well_known: Option<&str>,
    ) -> Result<usize> {
        let epoch = self.bump();
        if let Some(idx) = self.index_of(unique) {
            let slot = &mut self.slots[idx];
            *slot = Some(NameEntry {
                guid,
                unique: unique.to_string(),
                well_known: well_known.map(str::to_string),
                epoch,
                session_key: None,
                key_role: None,
                key_version: 0,
                group_key: None,
            });
            return Ok(idx);
        }
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(NameEntry {
                    guid,
                    unique: unique.to_string(),
                    well_known: well_known.map(str::to_string),
                    epoch,
                    session_key: None,
                    key_role: None,
                    key_version: 0,
                    group_key: None,
                });
                return Ok(idx);
            }
        }
        Err(BusError::Resources)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| match s {
            Some(e) => e.unique == name || e.well_known.as_deref() == Some(name),
            None => false,
        })
    }

    /// Peer index for a unique or well-known name.
    pub fn peer_index(&self, name: &str) -> Result<usize> {
        self.index_of(name).ok_or(BusError::NoMatch)
    }

    /// GUID for a name. A zeroed GUID means the peer disconnected but
    /// the slot has not been reused yet.
    pub fn find_guid(&self, name: &str) -> Option<Guid> {
        self.index_of(name).and_then(|i| self.slots[i].as_ref()).map(|e| e.guid)
    }

    /// Epoch of the entry for a name, if any.
    pub fn epoch_of(&self, name: &str) -> Option<u64> {
        self.index_of(name).and_then(|i| self.slots[i].as_ref()).map(|e| e.epoch)
    }

    /// The unique name behind a unique or well-known name.
    pub fn unique_name_of(&self, name: &str) -> Option<&str> {
        self.index_of(name)
            .and_then(|i| self.slots[i].as_ref())
            .map(|e| e.unique.as_str())
    }

    /// Zero the GUID for a disconnected peer and bump the epoch. The
    /// slot itself survives so in-flight lookups see the zeroed GUID.
    pub fn delete_mapping(&mut self, name: &str) {
        let epoch = self.bump();
        if let Some(idx) = self.index_of(name) {
            if let Some(entry) = self.slots[idx].as_mut() {
                entry.guid = Guid::ZERO;
                entry.epoch = epoch;
                if let Some(key) = entry.session_key.as_mut() {
                    key.zeroize();
                }
                entry.session_key = None;
                entry.key_role = None;
                entry.group_key = None;
            }
        }
    }

    pub fn set_session_key(
        &mut self,
        name: &str,
        key: &[u8; SESSION_KEY_LEN],
        role: KeyRole,
        version: u32,
    ) -> Result<()> {
        let idx = self.peer_index(name)?;
        let entry = self.slots[idx].as_mut().ok_or(BusError::NoMatch)?;
        entry.session_key = Some(*key);
        entry.key_role = Some(role);
        entry.key_version = version;
        Ok(())
    }

    pub fn session_key(&self, name: &str) -> Option<&[u8; SESSION_KEY_LEN]> {
        let idx = self.index_of(name)?;
        self.slots[idx].as_ref()?.session_key.as_ref()
    }

    /// Role and auth version the session key was registered under.
    pub fn session_key_info(&self, name: &str) -> Option<(KeyRole, u32)> {
        let idx = self.index_of(name)?;
        let entry = self.slots[idx].as_ref()?;
        Some((entry.key_role?, entry.key_version))
    }

    pub fn set_group_key(&mut self, name: &str, key: &[u8; SESSION_KEY_LEN]) -> Result<()> {
        let idx = self.peer_index(name)?;
        let entry = self.slots[idx].as_mut().ok_or(BusError::NoMatch)?;
        entry.group_key = Some(*key);
        Ok(())
    }

    pub fn group_key(&self, name: &str) -> Option<&[u8; SESSION_KEY_LEN]> {
        let idx = self.index_of(name)?;
        self.slots[idx].as_ref()?.group_key.as_ref()
    }
}
