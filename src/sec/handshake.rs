//! The peer-to-peer authentication state machine.
//!
//! Seven request/reply steps drive two freshly-connected endpoints from
//! strangers to mutually-authorized peers:
//!
//! ```text
//!           Client                                      Server
//! ExchangeGuids  -> (localGuid, version)     -> install name<->GUID map
//!                <- (remoteGuid, version)    <- load cached master secret
//! (cached secret on both sides skips straight to GenSessionKey)
//! ExchangeSuites -> offered suites           -> intersect, reply common
//! KeyExchange    -> suite + ECDHE public     -> verify, reply material
//! KeyAuth        -> verifier over transcript -> check, reply verifier
//! GenSessionKey  -> (guids, nonceA)          -> derive key, reply (nonceB, verifier)
//! ExchangeGroupKeys (encrypted)              -> swap 16-byte group keys
//! SendManifest      (encrypted, ECDSA only)  -> digest check, apply
//! SendMemberships   (encrypted, repeating)   -> verify chains, apply
//! ```
//!
//! Exactly one handshake is live per attachment. Any failure collapses
//! to a security violation: the completion callback fires, the error
//! reply goes out, and the context is cleared with its secrets
//! zeroized. A single monotonic deadline gates every re-entry.

use crate::bus::{AuthCallback, BusAttachment};
use crate::creds::CredType;
use crate::error::{BusError, Result, ERR_REJECTED, ERR_RESOURCES};
use crate::introspect::{
    METHOD_EXCHANGE_GROUP_KEYS, METHOD_EXCHANGE_GUIDS, METHOD_EXCHANGE_SUITES,
    METHOD_GEN_SESSION_KEY, METHOD_KEY_AUTHENTICATION, METHOD_KEY_EXCHANGE, METHOD_SEND_MANIFEST,
    METHOD_SEND_MEMBERSHIPS,
};
use crate::guid::KeyRole;
use crate::msg::{Message, WireReader, WireWriter, FLAG_ENCRYPTED};
use crate::sec::access::PeerAuthInfo;
use crate::sec::cert::Certificate;
use crate::sec::conversation::{HashDirection, CONVERSATION_V1, CONVERSATION_V4};
use crate::sec::kex::{marshal_certificates, unmarshal_certificates, AuthCore, AuthRole};
use crate::sec::membership::{
    common_issuer, find_membership_authority, membership_apply, trust_anchors,
};
use crate::sec::policy::{EccPublicKey, Manifest};
use crate::sec::suites::{SUITE_ECDHE_ECDSA, SUITE_ECDHE_NULL, SUITE_ECDHE_PSK};
use crate::types::{
    now_secs, Guid, Timer, MASTER_SECRET_LEN, MAX_AUTH_VERSION, MAX_KEYGEN_VERSION,
    MIN_AUTH_VERSION, NONCE_LEN, REQUIRED_AUTH_VERSION, SESSION_KEY_LEN,
};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    None,
    Exchanged,
    Success,
}

/// Membership send-cursor code byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendCode {
    None = 0,
    More = 1,
    Last = 2,
}

pub(crate) struct Handshake {
    pub state: AuthState,
    pub callback: Option<AuthCallback>,
    /// Name we address the peer by; becomes the unique name once known.
    pub peer_name: String,
    pub peer_unique: Option<String>,
    pub peer_guid: Option<Guid>,
    /// Name-map epoch captured at handshake start; a bump means the
    /// peer vanished or was replaced.
    pub peer_epoch: Option<u64>,
    pub timer: Timer,
    /// Our GenSessionKey nonce, as ASCII hex.
    pub nonce: String,
    pub core: AuthCore,
    pub version: u32,
    /// Credentials were loaded from the store; skip re-saving them.
    pub resumed: bool,
    /// Membership-send cursor.
    pub slot: u16,
    pub code: SendCode,
}

impl Handshake {
    fn new(role: AuthRole, peer_name: &str, callback: Option<AuthCallback>) -> Handshake {
        Handshake {
            state: AuthState::None,
            callback,
            peer_name: peer_name.to_string(),
            peer_unique: None,
            peer_guid: None,
            peer_epoch: None,
            timer: Timer::start(),
            nonce: String::new(),
            core: AuthCore::new(role),
            version: REQUIRED_AUTH_VERSION,
            resumed: false,
            slot: 0,
            code: SendCode::None,
        }
    }
}

/// Version acceptance: auth version within [min, max], keygen version
/// not newer than ours. A proposal below our maximum is taken as-is;
/// otherwise we pin our required version.
fn acceptable_version(proposed: u32) -> Option<u32> {
    let auth = (proposed >> 16) as u16;
    let keygen = (proposed & 0xFFFF) as u16;
    if !(MIN_AUTH_VERSION..=MAX_AUTH_VERSION).contains(&auth) || keygen > MAX_KEYGEN_VERSION {
        return None;
    }
    if auth < MAX_AUTH_VERSION || keygen < MAX_KEYGEN_VERSION {
        Some(proposed)
    } else {
        Some(REQUIRED_AUTH_VERSION)
    }
}

impl BusAttachment {
    // =========================================================================
    // ENTRY POINTS
    // =========================================================================

    /// Start authenticating `peer_name` as the initiator. Fails with
    /// `Resources` while another handshake is live and not timed out.
    pub fn peer_authenticate(
        &mut self,
        peer_name: &str,
        callback: Option<AuthCallback>,
    ) -> Result<()> {
        if self.handshake.is_some() && self.handshake_timeout().is_ok() {
            debug!("handshake in progress");
            return Err(BusError::Resources);
        }
        self.clear_handshake();
        if self.pwd_callback.is_some() {
            self.suites.enable(SUITE_ECDHE_PSK);
        }

        let mut call = self.marshal_method_call(
            METHOD_EXCHANGE_GUIDS,
            peer_name,
            0,
            self.call_timeout(),
        )?;
        let mut w = WireWriter::new();
        w.write_string(&self.local_guid.to_hex());
        w.write_u32(REQUIRED_AUTH_VERSION);
        call.body = w.into_bytes();

        let mut hs = Handshake::new(AuthRole::Client, peer_name, callback);
        // We don't yet know whether the peer talks the v4 conversation.
        // Hash provisionally; the reply handler resets if it doesn't.
        hs.core
            .hash
            .update_message(CONVERSATION_V4, &call, HashDirection::Marshaled);
        self.handshake = Some(hs);
        self.deliver(call);
        Ok(())
    }

    /// Cooperative deadline check; consulted at every state entry and
    /// available to the event pump. Completes the handshake with
    /// `Timeout` when the deadline passed or the peer vanished.
    pub fn handshake_timeout(&mut self) -> Result<()> {
        let expired = match self.handshake.as_ref() {
            Some(hs) => {
                let vanished = match (&hs.peer_unique, hs.peer_epoch) {
                    (Some(name), Some(epoch)) => {
                        self.names.epoch_of(name) != Some(epoch)
                            || self.names.find_guid(name).map(|g| g.is_zero()).unwrap_or(true)
                    }
                    _ => false,
                };
                vanished || hs.timer.expired(self.max_handshake_time)
            }
            None => false,
        };
        if expired {
            warn!("handshake timed out");
            self.handshake_complete(Err(BusError::Timeout));
            return Err(BusError::Timeout);
        }
        Ok(())
    }

    pub fn authenticating(&self) -> bool {
        self.handshake.is_some()
    }

    // =========================================================================
    // COMPLETION / TEARDOWN
    // =========================================================================

    pub(crate) fn clear_handshake(&mut self) {
        if let Some(mut hs) = self.handshake.take() {
            hs.core.scrub();
        }
    }

    /// Finish the handshake: on an authentication failure of ECDSA or
    /// PSK, downgrade to NULL once if enabled; otherwise persist
    /// credentials on success, fire the callback, and clear.
    pub(crate) fn handshake_complete(&mut self, status: Result<()>) {
        let mut status = status;
        let downgrade = matches!(status, Err(BusError::Security))
            && self.handshake.as_ref().map_or(false, |hs| {
                hs.core.role == AuthRole::Client
                    && matches!(hs.core.suite, SUITE_ECDHE_PSK | SUITE_ECDHE_ECDSA)
                    && self
                        .suites
                        .is_enabled(SUITE_ECDHE_NULL, (hs.version >> 16) as u16)
            });
        if downgrade {
            info!("downgrading to ECDHE_NULL");
            if let Some(hs) = self.handshake.as_mut() {
                hs.core.suite = SUITE_ECDHE_NULL;
                hs.state = AuthState::None;
            }
            if self.key_exchange().is_ok() {
                return;
            }
            // Downgrade attempt failed too; fall through to teardown
        }

        let mut hs = match self.handshake.take() {
            Some(hs) => hs,
            None => return,
        };
        if status.is_ok() && !hs.resumed {
            let expiration = self
                .credential_ttl
                .map(|ttl| now_secs() + ttl.as_secs())
                .unwrap_or(0);
            if let Err(e) = self.save_credentials(&hs, expiration) {
                warn!(error = %e, "credential save failed");
                status = Err(e);
            }
        }
        if let Some(cb) = hs.callback.as_mut() {
            cb(status);
        }
        hs.core.scrub();
    }

    fn save_credentials(&mut self, hs: &Handshake, expiration: u64) -> Result<()> {
        let guid = hs.peer_guid.ok_or(BusError::Security)?;
        if hs.state != AuthState::Success {
            self.store.delete_peer(&guid)?;
            return Err(BusError::Security);
        }
        self.store.set(
            CredType::MasterSecret,
            Some(&guid),
            expiration,
            &hs.core.master_secret,
        )?;
        if hs.core.suite == SUITE_ECDHE_ECDSA {
            if let Some(digest) = &hs.core.ecdsa.manifest_digest {
                self.store
                    .set(CredType::EcdsaManifest, Some(&guid), expiration, digest)?;
                let mut keys: Vec<EccPublicKey> = Vec::new();
                if let Some(subject) = &hs.core.ecdsa.subject {
                    keys.push(subject.clone());
                }
                keys.extend(hs.core.ecdsa.issuers.iter().cloned());
                let blob = bincode::serialize(&keys).map_err(|e| BusError::Io(e.to_string()))?;
                self.store
                    .set(CredType::EcdsaKeys, Some(&guid), expiration, &blob)?;
            }
        }
        Ok(())
    }

    /// Load a cached master secret and ECDSA context for resumption.
    /// Any failure deletes the stale records and zeroizes the buffer.
    fn try_load_credentials(&mut self, guid: Guid) -> bool {
        match self.load_credentials(guid) {
            Ok(()) => true,
            Err(_) => {
                let _ = self.store.delete_peer(&guid);
                if let Some(hs) = self.handshake.as_mut() {
                    hs.core.master_secret.zeroize();
                    hs.core.have_master = false;
                }
                false
            }
        }
    }

    fn load_credentials(&mut self, guid: Guid) -> Result<()> {
        let record = self
            .store
            .get(CredType::MasterSecret, Some(&guid))?
            .ok_or(BusError::NoMatch)?;
        if record.expired() || record.data.len() != MASTER_SECRET_LEN {
            return Err(BusError::Security);
        }
        {
            let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
            hs.core.master_secret.copy_from_slice(&record.data);
            hs.core.have_master = true;
        }

        let manifest_record = self.store.get(CredType::EcdsaManifest, Some(&guid))?;
        let digest = match manifest_record {
            None => {
                // NULL/PSK peering; nothing else to restore
                let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
                hs.state = AuthState::Success;
                hs.resumed = true;
                return Ok(());
            }
            Some(rec) => {
                let digest: [u8; 32] = rec.data.try_into().map_err(|_| BusError::Invalid)?;
                digest
            }
        };
        // A stored manifest digest requires the stored key array
        let keys_record = self
            .store
            .get(CredType::EcdsaKeys, Some(&guid))?
            .ok_or(BusError::NoMatch)?;
        let keys: Vec<EccPublicKey> =
            bincode::deserialize(&keys_record.data).map_err(|_| BusError::Invalid)?;
        if keys.is_empty() {
            return Err(BusError::Invalid);
        }
        let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
        hs.core.ecdsa.manifest_digest = Some(digest);
        hs.core.ecdsa.subject = Some(keys[0].clone());
        hs.core.ecdsa.issuers = keys[1..].to_vec();
        hs.core.suite = SUITE_ECDHE_ECDSA;
        hs.state = AuthState::Success;
        hs.resumed = true;
        Ok(())
    }

    // =========================================================================
    // VALIDITY
    // =========================================================================

    /// A handshake message is only acceptable from the peer the live
    /// handshake belongs to, before the deadline.
    fn handshake_valid(&mut self, sender: &str) -> Result<()> {
        if self.handshake.as_ref().and_then(|h| h.peer_guid).is_none() {
            debug!("no handshake in flight");
            return Err(BusError::Security);
        }
        self.handshake_timeout()?;
        let hs = self.handshake.as_ref().ok_or(BusError::Timeout)?;
        let sender_guid = self.names.find_guid(sender);
        match (hs.peer_guid, sender_guid) {
            (Some(expected), Some(actual)) if expected == actual && !actual.is_zero() => Ok(()),
            _ => {
                warn!(sender, "handshake message from unexpected peer");
                Err(BusError::Resources)
            }
        }
    }

    fn fail_with_error_reply(&mut self, msg: &Message, status: BusError) -> Message {
        let wire = status.wire_name();
        self.handshake_complete(Err(status));
        let serial = self.next_serial();
        Message::error_reply(msg, serial, wire)
    }

    fn busy_reply(&mut self, msg: &Message) -> Message {
        let serial = self.next_serial();
        Message::error_reply(msg, serial, ERR_RESOURCES)
    }

    fn peer_info(&self) -> PeerAuthInfo {
        match self.handshake.as_ref() {
            Some(hs) => PeerAuthInfo {
                suite: hs.core.suite,
                subject: hs.core.ecdsa.subject.clone(),
                issuers: hs.core.ecdsa.issuers.clone(),
            },
            None => PeerAuthInfo::default(),
        }
    }

    // =========================================================================
    // EXCHANGE GUIDS
    // =========================================================================

    pub(crate) fn handle_exchange_guids(&mut self, msg: &Message) -> Message {
        if self.handshake.is_some() && self.handshake_timeout().is_ok() {
            debug!("handshake in progress, rejecting new peer");
            return self.busy_reply(msg);
        }
        self.clear_handshake();
        self.handshake = Some(Handshake::new(AuthRole::Server, &msg.sender, None));
        if self.pwd_callback.is_some() {
            self.suites.enable(SUITE_ECDHE_PSK);
        }
        match self.exchange_guids_inner(msg) {
            Ok(reply) => reply,
            Err(e) => self.fail_with_error_reply(msg, e),
        }
    }

    fn exchange_guids_inner(&mut self, msg: &Message) -> Result<Message> {
        let mut r = msg.reader();
        let guid_str = r.read_string()?;
        let proposed = r.read_u32()?;
        let remote_guid = Guid::from_hex(&guid_str)?;

        let index = self
            .names
            .add_mapping(remote_guid, &msg.sender, None)
            .map_err(|_| BusError::Resources)?;
        // Drop whatever access the previous holder of this slot had
        self.access.reset(index);
        let epoch = self.names.epoch_of(&msg.sender);
        {
            let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
            hs.peer_guid = Some(remote_guid);
            hs.peer_unique = Some(msg.sender.clone());
            hs.peer_epoch = epoch;
        }

        // Resume from a cached master secret when possible
        let resumed = self.try_load_credentials(remote_guid);
        if resumed {
            info!(peer = %msg.sender, "resuming from cached master secret");
        }

        let version = acceptable_version(proposed).unwrap_or(REQUIRED_AUTH_VERSION);
        debug!("exchange guids, version {:#x}", version);

        let serial = self.next_serial();
        let mut reply = Message::method_return(msg, serial);
        let mut w = WireWriter::new();
        w.write_string(&self.local_guid.to_hex());
        w.write_u32(version);
        reply.body = w.into_bytes();

        let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
        hs.version = version;
        hs.core.hash.set_version(version);
        hs.core
            .hash
            .update_message(CONVERSATION_V4, msg, HashDirection::Unmarshaled);
        hs.core
            .hash
            .update_message(CONVERSATION_V4, &reply, HashDirection::Marshaled);
        Ok(reply)
    }

    pub(crate) fn handle_exchange_guids_reply(&mut self, msg: &Message) -> Result<()> {
        if msg.is_error() {
            let status = msg.error_status();
            warn!(error = ?msg.error, "exchange guids rejected");
            if status == BusError::Resources {
                return Err(BusError::Resources);
            }
            self.handshake_complete(Err(BusError::Security));
            return Err(BusError::Security);
        }
        // A second reply while a handshake holds a peer is a stray
        if self
            .handshake
            .as_ref()
            .map(|h| h.peer_guid.is_some())
            .unwrap_or(false)
            && self.handshake_timeout().is_ok()
        {
            return Err(BusError::Resources);
        }
        match self.exchange_guids_reply_inner(msg) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.handshake_complete(Err(BusError::Security));
                Err(BusError::Security)
            }
        }
    }

    fn exchange_guids_reply_inner(&mut self, msg: &Message) -> Result<()> {
        let mut r = msg.reader();
        let guid_str = r.read_string()?;
        let version = acceptable_version(r.read_u32()?).ok_or(BusError::Security)?;
        let remote_guid = Guid::from_hex(&guid_str)?;

        // Two mappings: the well-known name used to start, and the
        // unique name the reply came from.
        let well_known = self
            .handshake
            .as_ref()
            .map(|h| h.peer_name.clone())
            .ok_or(BusError::Security)?;
        let index = self
            .names
            .add_mapping(remote_guid, &msg.sender, Some(&well_known))?;
        self.access.reset(index);
        let epoch = self.names.epoch_of(&msg.sender);

        {
            let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
            hs.peer_guid = Some(remote_guid);
            hs.peer_unique = Some(msg.sender.clone());
            hs.peer_name = msg.sender.clone();
            hs.peer_epoch = epoch;
            hs.version = version;
            hs.core.hash.set_version(version);
            if (version >> 16) < CONVERSATION_V4 as u32 {
                // The provisional ExchangeGuids hash assumed v4
                hs.core.hash.reset();
            } else {
                hs.core
                    .hash
                    .update_message(CONVERSATION_V4, msg, HashDirection::Unmarshaled);
            }
        }

        if self.try_load_credentials(remote_guid) {
            info!(peer = %msg.sender, "resuming from cached master secret");
            return self.gen_session_key();
        }
        self.exchange_suites()
    }

    // =========================================================================
    // EXCHANGE SUITES
    // =========================================================================

    fn exchange_suites(&mut self) -> Result<()> {
        let (peer, auth_version) = {
            let hs = self.handshake.as_ref().ok_or(BusError::Security)?;
            (hs.peer_name.clone(), (hs.version >> 16) as u16)
        };
        let offered = self.suites.offered(auth_version);
        if offered.is_empty() {
            warn!("no suites available");
            return Err(BusError::Security);
        }
        let mut call =
            self.marshal_method_call(METHOD_EXCHANGE_SUITES, &peer, 0, self.call_timeout())?;
        let mut w = WireWriter::new();
        w.open_array();
        for suite in &offered {
            w.write_u32(*suite);
        }
        w.close_array();
        call.body = w.into_bytes();

        let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
        hs.core
            .hash
            .update_message(CONVERSATION_V4, &call, HashDirection::Marshaled);
        self.deliver(call);
        Ok(())
    }

    pub(crate) fn handle_exchange_suites(&mut self, msg: &Message) -> Message {
        if self.handshake_valid(&msg.sender).is_err() {
            return self.busy_reply(msg);
        }
        match self.exchange_suites_handler_inner(msg) {
            Ok(reply) => reply,
            Err(e) => self.fail_with_error_reply(msg, e),
        }
    }

    fn exchange_suites_handler_inner(&mut self, msg: &Message) -> Result<Message> {
        let auth_version = {
            let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
            hs.core
                .hash
                .update_message(CONVERSATION_V4, msg, HashDirection::Unmarshaled);
            (hs.version >> 16) as u16
        };

        let mut r = msg.reader();
        let mut offered = Vec::new();
        r.open_array()?;
        while r.array_has_more() {
            offered.push(r.read_u32()?);
        }
        r.close_array()?;

        let serial = self.next_serial();
        let mut reply = Message::method_return(msg, serial);
        let mut w = WireWriter::new();
        w.open_array();
        for suite in &offered {
            if self.suites.is_enabled(*suite, auth_version) {
                w.write_u32(*suite);
            }
        }
        w.close_array();
        reply.body = w.into_bytes();

        let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
        hs.core
            .hash
            .update_message(CONVERSATION_V4, &reply, HashDirection::Marshaled);
        debug!("exchange suites complete");
        Ok(reply)
    }

    pub(crate) fn handle_exchange_suites_reply(&mut self, msg: &Message) -> Result<()> {
        self.handshake_valid(&msg.sender)?;
        {
            let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
            hs.core
                .hash
                .update_message(CONVERSATION_V4, msg, HashDirection::Unmarshaled);
        }
        let inner = (|| -> Result<()> {
            if msg.is_error() {
                return Err(BusError::Security);
            }
            let auth_version = {
                let hs = self.handshake.as_ref().ok_or(BusError::Security)?;
                (hs.version >> 16) as u16
            };
            let mut r = msg.reader();
            let mut common = Vec::new();
            r.open_array()?;
            while r.array_has_more() {
                common.push(r.read_u32()?);
            }
            r.close_array()?;

            // Double check the server didn't send something bogus
            let suite = self
                .suites
                .highest_common(&common, auth_version)
                .ok_or(BusError::Security)?;
            let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
            hs.core.suite = suite;
            debug!("exchange suites complete, suite {:#x}", suite);
            Ok(())
        })();
        match inner {
            Ok(()) => self.key_exchange().map_err(|e| {
                self.handshake_complete(Err(e));
                BusError::Security
            }),
            Err(_) => {
                self.handshake_complete(Err(BusError::Security));
                Err(BusError::Security)
            }
        }
    }

    // =========================================================================
    // KEY EXCHANGE
    // =========================================================================

    pub(crate) fn key_exchange(&mut self) -> Result<()> {
        let (peer, suite) = {
            let hs = self.handshake.as_ref().ok_or(BusError::Security)?;
            (hs.peer_name.clone(), hs.core.suite)
        };
        info!("authenticating using suite {:#x}", suite);
        let psk = self.resolve_psk(suite)?;
        let mut call =
            self.marshal_method_call(METHOD_KEY_EXCHANGE, &peer, 0, self.call_timeout())?;
        let mut w = WireWriter::new();
        w.write_u32(suite);

        let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
        // A fresh exchange replaces any loaded secret; re-save on success
        hs.resumed = false;
        if let Some(psk) = psk {
            hs.core.psk = Some(psk);
        }
        hs.core.hash.update_bytes(CONVERSATION_V1, &suite.to_be_bytes());
        hs.core.marshal_key_exchange(&mut w)?;
        call.body = w.into_bytes();
        if hs.core.role == AuthRole::Client {
            hs.core
                .hash
                .update_message(CONVERSATION_V4, &call, HashDirection::Marshaled);
        }
        self.deliver(call);
        Ok(())
    }

    fn resolve_psk(&self, suite: u32) -> Result<Option<Vec<u8>>> {
        if suite != SUITE_ECDHE_PSK {
            return Ok(None);
        }
        let cb = self.pwd_callback.as_ref().ok_or(BusError::Security)?;
        Ok(Some(cb()))
    }

    pub(crate) fn handle_key_exchange(&mut self, msg: &Message) -> Message {
        if self.handshake_valid(&msg.sender).is_err() {
            return self.busy_reply(msg);
        }
        match self.key_exchange_handler_inner(msg) {
            Ok(reply) => reply,
            Err(e) => self.fail_with_error_reply(msg, e),
        }
    }

    fn key_exchange_handler_inner(&mut self, msg: &Message) -> Result<Message> {
        let mut r = msg.reader();
        let suite = r.read_u32()?;
        let auth_version = {
            let hs = self.handshake.as_ref().ok_or(BusError::Security)?;
            (hs.version >> 16) as u16
        };
        if !self.suites.is_enabled(suite, auth_version) {
            return Err(BusError::Security);
        }
        let psk = self.resolve_psk(suite)?;

        {
            let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
            hs.core.suite = suite;
            hs.resumed = false;
            if let Some(psk) = psk {
                hs.core.psk = Some(psk);
            }
            hs.core.hash.update_bytes(CONVERSATION_V1, &suite.to_be_bytes());
            hs.core.unmarshal_key_exchange(&mut r)?;
            // Hash after unmarshal so the material is in the digest the
            // verifier is computed over, in wire order
            hs.core
                .hash
                .update_message(CONVERSATION_V4, msg, HashDirection::Unmarshaled);
        }

        let serial = self.next_serial();
        let mut reply = Message::method_return(msg, serial);
        let mut w = WireWriter::new();
        w.write_u32(suite);
        let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
        hs.core.hash.update_bytes(CONVERSATION_V1, &suite.to_be_bytes());
        hs.core.marshal_key_exchange(&mut w)?;
        reply.body = w.into_bytes();
        hs.core
            .hash
            .update_message(CONVERSATION_V4, &reply, HashDirection::Marshaled);
        hs.state = AuthState::Exchanged;
        debug!("key exchange complete");
        Ok(reply)
    }

    pub(crate) fn handle_key_exchange_reply(&mut self, msg: &Message) -> Result<()> {
        if msg.is_error() {
            let status = msg.error_status();
            warn!(error = ?msg.error, "key exchange rejected");
            if status == BusError::Resources {
                return Err(BusError::Resources);
            }
            self.handshake_complete(Err(BusError::Security));
            return Err(BusError::Security);
        }
        self.handshake_valid(&msg.sender)?;
        let inner = (|| -> Result<()> {
            let mut r = msg.reader();
            let suite = r.read_u32()?;
            let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
            if suite != hs.core.suite {
                warn!("suite mismatch in key exchange reply");
                return Err(BusError::Security);
            }
            hs.core.hash.update_bytes(CONVERSATION_V1, &suite.to_be_bytes());
            hs.core.unmarshal_key_exchange(&mut r)?;
            hs.core
                .hash
                .update_message(CONVERSATION_V4, msg, HashDirection::Unmarshaled);
            hs.state = AuthState::Exchanged;
            debug!("key exchange complete");
            Ok(())
        })();
        match inner {
            Ok(()) => match self.key_authentication() {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.handshake_complete(Err(e));
                    Err(BusError::Security)
                }
            },
            Err(e) => {
                self.handshake_complete(Err(e));
                Err(BusError::Security)
            }
        }
    }

    // =========================================================================
    // KEY AUTHENTICATION
    // =========================================================================

    fn key_authentication(&mut self) -> Result<()> {
        let peer = {
            let hs = self.handshake.as_ref().ok_or(BusError::Security)?;
            hs.peer_name.clone()
        };
        let mut call =
            self.marshal_method_call(METHOD_KEY_AUTHENTICATION, &peer, 0, self.call_timeout())?;
        let mut w = WireWriter::new();
        let identity = self.identity.as_ref();
        let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
        hs.core.marshal_key_authentication(&mut w, identity)?;
        call.body = w.into_bytes();
        // Hashed after marshal: the verifier must not cover itself
        hs.core
            .hash
            .update_message(CONVERSATION_V4, &call, HashDirection::Marshaled);
        self.deliver(call);
        Ok(())
    }

    pub(crate) fn handle_key_authentication(&mut self, msg: &Message) -> Message {
        if self.handshake_valid(&msg.sender).is_err() {
            return self.busy_reply(msg);
        }
        let state = self.handshake.as_ref().map(|h| h.state);
        if state != Some(AuthState::Exchanged) {
            if let Some(hs) = self.handshake.as_mut() {
                hs.core
                    .hash
                    .update_message(CONVERSATION_V4, msg, HashDirection::Unmarshaled);
            }
            return self.fail_with_error_reply(msg, BusError::Security);
        }
        match self.key_authentication_handler_inner(msg) {
            Ok(reply) => reply,
            Err(e) => self.fail_with_error_reply(msg, e),
        }
    }

    fn key_authentication_handler_inner(&mut self, msg: &Message) -> Result<Message> {
        let anchors = trust_anchors(&*self.store);
        {
            let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
            let mut r = msg.reader();
            hs.core.unmarshal_key_authentication(&mut r, &anchors)?;
            // Hash after unmarshal so the verifier it carries is not in
            // the transcript the verifier was computed over
            hs.core
                .hash
                .update_message(CONVERSATION_V4, msg, HashDirection::Unmarshaled);
        }

        let serial = self.next_serial();
        let mut reply = Message::method_return(msg, serial);
        let mut w = WireWriter::new();
        let identity = self.identity.as_ref();
        let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
        hs.core.marshal_key_authentication(&mut w, identity)?;
        reply.body = w.into_bytes();
        hs.core
            .hash
            .update_message(CONVERSATION_V4, &reply, HashDirection::Marshaled);
        hs.state = AuthState::Success;
        debug!("key authentication complete");
        Ok(reply)
    }

    pub(crate) fn handle_key_authentication_reply(&mut self, msg: &Message) -> Result<()> {
        self.handshake_valid(&msg.sender)?;
        if msg.is_error() {
            let status = msg.error_status();
            warn!(error = ?msg.error, "key authentication rejected");
            if status == BusError::Resources {
                return Err(BusError::Resources);
            }
            self.handshake_complete(Err(BusError::Security));
            return Err(BusError::Security);
        }
        let inner = (|| -> Result<()> {
            if self.handshake.as_ref().map(|h| h.state) != Some(AuthState::Exchanged) {
                return Err(BusError::Security);
            }
            let anchors = trust_anchors(&*self.store);
            let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
            let mut r = msg.reader();
            hs.core.unmarshal_key_authentication(&mut r, &anchors)?;
            hs.core
                .hash
                .update_message(CONVERSATION_V4, msg, HashDirection::Unmarshaled);
            hs.state = AuthState::Success;
            debug!("key authentication complete");
            Ok(())
        })();
        match inner {
            Ok(()) => match self.gen_session_key() {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.handshake_complete(Err(e));
                    Err(BusError::Security)
                }
            },
            Err(e) => {
                self.handshake_complete(Err(e));
                Err(BusError::Security)
            }
        }
    }

    // =========================================================================
    // GEN SESSION KEY
    // =========================================================================

    fn gen_session_key(&mut self) -> Result<()> {
        let (peer, peer_guid) = {
            let hs = self.handshake.as_ref().ok_or(BusError::Security)?;
            (hs.peer_name.clone(), hs.peer_guid.ok_or(BusError::Security)?)
        };
        let mut call =
            self.marshal_method_call(METHOD_GEN_SESSION_KEY, &peer, 0, self.call_timeout())?;
        let nonce = crate::crypto::rand_hex(NONCE_LEN);
        let mut w = WireWriter::new();
        w.write_string(&self.local_guid.to_hex());
        w.write_string(&peer_guid.to_hex());
        w.write_string(&nonce);
        call.body = w.into_bytes();

        let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
        hs.nonce = nonce;
        hs.core
            .hash
            .update_message(CONVERSATION_V4, &call, HashDirection::Marshaled);
        self.deliver(call);
        Ok(())
    }

    fn key_gen(&mut self, name: &str, role: KeyRole, nonce1: &str, nonce2: &str) -> Result<String> {
        let guid = self.names.find_guid(name).ok_or(BusError::Security)?;
        if guid.is_zero() {
            return Err(BusError::Security);
        }
        let (key, verifier, version) = {
            let hs = self.handshake.as_ref().ok_or(BusError::Security)?;
            if !hs.core.have_master {
                return Err(BusError::Security);
            }
            let (key, verifier) =
                crate::sec::kex::session_key_and_verifier(&hs.core.master_secret, nonce1, nonce2)?;
            (key, verifier, hs.version)
        };
        self.names.set_session_key(name, &key, role, version)?;
        debug!(verifier = %verifier, "session key registered");
        Ok(verifier)
    }

    pub(crate) fn handle_gen_session_key(&mut self, msg: &Message) -> Message {
        if self.handshake_valid(&msg.sender).is_err() {
            return self.busy_reply(msg);
        }
        if let Some(hs) = self.handshake.as_mut() {
            hs.core
                .hash
                .update_message(CONVERSATION_V4, msg, HashDirection::Unmarshaled);
        }
        if self.handshake.as_ref().map(|h| h.state) != Some(AuthState::Success) {
            // No saved master secret and none generated yet; the
            // initiator falls back to the full conversation
            debug!("gen session key before key material, rejecting");
            let serial = self.next_serial();
            let reply = Message::error_reply(msg, serial, ERR_REJECTED);
            if let Some(hs) = self.handshake.as_mut() {
                hs.core
                    .hash
                    .update_message(CONVERSATION_V4, &reply, HashDirection::Marshaled);
            }
            return reply;
        }
        match self.gen_session_key_handler_inner(msg) {
            Ok(reply) => reply,
            Err(e) => self.fail_with_error_reply(msg, e),
        }
    }

    fn gen_session_key_handler_inner(&mut self, msg: &Message) -> Result<Message> {
        let mut r = msg.reader();
        let _remote_guid_str = r.read_string()?;
        let local_guid_str = r.read_string()?;
        let peer_nonce = r.read_string()?;

        // The second argument must name us
        let claimed = Guid::from_hex(&local_guid_str)?;
        if claimed != self.local_guid {
            return Err(BusError::Security);
        }

        let nonce = crate::crypto::rand_hex(NONCE_LEN);
        let verifier = self.key_gen(&msg.sender, KeyRole::Responder, &peer_nonce, &nonce)?;
        if let Some(hs) = self.handshake.as_mut() {
            hs.nonce = nonce.clone();
        }

        let serial = self.next_serial();
        let mut reply = Message::method_return(msg, serial);
        let mut w = WireWriter::new();
        w.write_string(&nonce);
        w.write_string(&verifier);
        reply.body = w.into_bytes();
        let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
        hs.core
            .hash
            .update_message(CONVERSATION_V4, &reply, HashDirection::Marshaled);
        Ok(reply)
    }

    pub(crate) fn handle_gen_session_key_reply(&mut self, msg: &Message) -> Result<()> {
        self.handshake_valid(&msg.sender)?;
        if let Some(hs) = self.handshake.as_mut() {
            hs.core
                .hash
                .update_message(CONVERSATION_V4, msg, HashDirection::Unmarshaled);
        }
        if msg.is_error() {
            let status = msg.error_status();
            if status == BusError::Resources {
                return Err(BusError::Resources);
            }
            if msg.error.as_deref() == Some(ERR_REJECTED) {
                // Server has no cached secret for us; run the full
                // conversation instead
                info!("resumption rejected, falling back to exchange suites");
                return self.exchange_suites().map_err(|e| {
                    self.handshake_complete(Err(e));
                    BusError::Security
                });
            }
            self.handshake_complete(Err(BusError::Security));
            return Err(BusError::Security);
        }

        let inner = (|| -> Result<()> {
            let mut r = msg.reader();
            let peer_nonce = r.read_string()?;
            let remote_verifier = r.read_string()?;
            let own_nonce = self
                .handshake
                .as_ref()
                .map(|h| h.nonce.clone())
                .ok_or(BusError::Security)?;
            let verifier =
                self.key_gen(&msg.sender, KeyRole::Initiator, &own_nonce, &peer_nonce)?;
            if verifier != remote_verifier {
                warn!("session key verifier mismatch");
                return Err(BusError::Security);
            }
            Ok(())
        })();
        match inner {
            Ok(()) => self.exchange_group_keys(msg).map_err(|e| {
                self.handshake_complete(Err(e));
                BusError::Security
            }),
            Err(e) => {
                self.handshake_complete(Err(e));
                Err(BusError::Security)
            }
        }
    }

    // =========================================================================
    // EXCHANGE GROUP KEYS
    // =========================================================================

    fn exchange_group_keys(&mut self, msg: &Message) -> Result<()> {
        // Group keys travel encrypted; hashing stops with the verifier
        let mut call = self.marshal_method_call(
            METHOD_EXCHANGE_GROUP_KEYS,
            &msg.sender,
            FLAG_ENCRYPTED,
            self.call_timeout(),
        )?;
        let mut w = WireWriter::new();
        w.write_bytes(&self.group_key);
        call.body = w.into_bytes();
        self.deliver(call);
        Ok(())
    }

    pub(crate) fn handle_exchange_group_keys(&mut self, msg: &Message) -> Message {
        if self.handshake_valid(&msg.sender).is_err() {
            return self.busy_reply(msg);
        }
        match self.exchange_group_keys_handler_inner(msg) {
            Ok(reply) => reply,
            Err(e) => self.fail_with_error_reply(msg, e),
        }
    }

    fn exchange_group_keys_handler_inner(&mut self, msg: &Message) -> Result<Message> {
        let mut r = msg.reader();
        let key_bytes = r.read_bytes()?;
        let key: [u8; SESSION_KEY_LEN] =
            key_bytes.try_into().map_err(|_| BusError::Invalid)?;
        self.names.set_group_key(&msg.sender, &key)?;

        let serial = self.next_serial();
        let mut reply = Message::method_return(msg, serial);
        let mut w = WireWriter::new();
        w.write_bytes(&self.group_key);
        reply.body = w.into_bytes();

        let info = self.peer_info();
        let peer = self.names.peer_index(&msg.sender)?;
        self.access.policy_apply(&info, peer, &*self.store)?;

        let suite = self.handshake.as_ref().map(|h| h.core.suite).unwrap_or(0);
        if suite != SUITE_ECDHE_ECDSA {
            self.handshake_complete(Ok(()));
        }
        Ok(reply)
    }

    pub(crate) fn handle_exchange_group_keys_reply(&mut self, msg: &Message) -> Result<()> {
        if msg.is_error() {
            let status = msg.error_status();
            if status == BusError::Resources {
                return Err(BusError::Resources);
            }
            self.handshake_complete(Err(BusError::Security));
            return Err(BusError::Security);
        }
        self.handshake_valid(&msg.sender)?;
        let inner = (|| -> Result<()> {
            let mut r = msg.reader();
            let key_bytes = r.read_bytes()?;
            let key: [u8; SESSION_KEY_LEN] =
                key_bytes.try_into().map_err(|_| BusError::Invalid)?;
            self.names.set_group_key(&msg.sender, &key)?;

            let info = self.peer_info();
            let peer = self.names.peer_index(&msg.sender)?;
            self.access.policy_apply(&info, peer, &*self.store)?;
            Ok(())
        })();
        match inner {
            Ok(()) => {
                let suite = self.handshake.as_ref().map(|h| h.core.suite).unwrap_or(0);
                if suite == SUITE_ECDHE_ECDSA {
                    self.send_manifest(msg).map_err(|e| {
                        self.handshake_complete(Err(e));
                        BusError::Security
                    })
                } else {
                    self.handshake_complete(Ok(()));
                    Ok(())
                }
            }
            Err(e) => {
                self.handshake_complete(Err(e));
                Err(BusError::Security)
            }
        }
    }

    // =========================================================================
    // SEND MANIFEST
    // =========================================================================

    fn local_manifest(&self) -> Manifest {
        match self.store.get(CredType::Manifest, None) {
            Ok(Some(record)) if !record.expired() => {
                Manifest::from_bytes(&record.data).unwrap_or_else(|_| Manifest::empty())
            }
            _ => Manifest::empty(),
        }
    }

    /// Marshalled manifest template for the security surface, if set.
    pub fn marshal_manifest_template(&self) -> Option<Vec<u8>> {
        self.manifest_template.as_ref().map(|m| m.to_bytes())
    }

    fn send_manifest(&mut self, msg: &Message) -> Result<()> {
        let mut call = self.marshal_method_call(
            METHOD_SEND_MANIFEST,
            &msg.sender,
            FLAG_ENCRYPTED,
            self.call_timeout(),
        )?;
        call.body = self.local_manifest().to_bytes();
        self.deliver(call);
        Ok(())
    }

    /// Apply a received manifest when its digest matches the binding in
    /// the peer's identity certificate; a mismatch silently grants
    /// nothing.
    fn receive_manifest(&mut self, msg: &Message) -> Result<()> {
        let manifest = Manifest::from_bytes(&msg.body)?;
        let digest = Manifest::digest(&msg.body);
        let bound = self
            .handshake
            .as_ref()
            .map(|h| h.core.ecdsa.manifest_digest == Some(digest))
            .unwrap_or(false);
        if bound {
            let peer = self.names.peer_index(&msg.sender)?;
            self.access.manifest_apply(&manifest, peer);
            info!(peer = %msg.sender, "manifest applied");
        } else {
            debug!(peer = %msg.sender, "manifest digest mismatch, not applied");
        }
        Ok(())
    }

    /// Position the membership cursor at the first stored certificate.
    fn init_membership_cursor(&mut self) -> Result<()> {
        let have_certs = self.store.next_slot(CredType::MembershipCert, 0)?.is_some();
        let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
        hs.slot = 0;
        hs.code = if have_certs { SendCode::More } else { SendCode::None };
        Ok(())
    }

    pub(crate) fn handle_send_manifest(&mut self, msg: &Message) -> Message {
        if self.handshake_valid(&msg.sender).is_err() {
            return self.busy_reply(msg);
        }
        match self.send_manifest_handler_inner(msg) {
            Ok(reply) => reply,
            Err(e) => self.fail_with_error_reply(msg, e),
        }
    }

    fn send_manifest_handler_inner(&mut self, msg: &Message) -> Result<Message> {
        self.receive_manifest(msg)?;
        let serial = self.next_serial();
        let mut reply = Message::method_return(msg, serial);
        reply.body = self.local_manifest().to_bytes();
        self.init_membership_cursor()?;
        Ok(reply)
    }

    pub(crate) fn handle_send_manifest_reply(&mut self, msg: &Message) -> Result<()> {
        if msg.is_error() {
            warn!(error = ?msg.error, "send manifest rejected");
            self.handshake_complete(Err(BusError::Security));
            return Err(BusError::Security);
        }
        self.handshake_valid(&msg.sender)?;
        let inner = (|| -> Result<()> {
            self.receive_manifest(msg)?;
            self.init_membership_cursor()
        })();
        match inner {
            Ok(()) => self.send_memberships(msg).map_err(|e| {
                self.handshake_complete(Err(e));
                BusError::Security
            }),
            Err(e) => {
                self.handshake_complete(Err(e));
                Err(BusError::Security)
            }
        }
    }

    // =========================================================================
    // SEND MEMBERSHIPS
    // =========================================================================

    /// Marshal one membership certificate chain (or the none marker).
    /// Chains whose root issuer is unknown to the peer's identity
    /// hierarchy are skipped.
    fn marshal_membership(&mut self, w: &mut WireWriter) -> Result<()> {
        let (mut slot, mut code, peer_issuers) = {
            let hs = self.handshake.as_ref().ok_or(BusError::Security)?;
            (hs.slot, hs.code, hs.core.ecdsa.issuers.clone())
        };

        let mut chain: Option<Vec<Certificate>> = None;
        while code == SendCode::More {
            match self.store.next_slot(CredType::MembershipCert, slot)? {
                Some((found, record)) => {
                    slot = found.checked_add(1).ok_or(BusError::Resources)?;
                    match decode_membership_record(&record.data) {
                        Ok(candidate) if common_issuer(&candidate, &peer_issuers).is_ok() => {
                            chain = Some(candidate);
                            break;
                        }
                        _ => continue,
                    }
                }
                None => {
                    code = SendCode::None;
                }
            }
        }

        match chain {
            None => {
                debug!("no membership certificate to send");
                w.write_byte(SendCode::None as u8);
                w.open_array();
                w.close_array();
                code = SendCode::None;
            }
            Some(chain) => {
                // Peek whether anything follows to mark the last one
                code = if self.store.next_slot(CredType::MembershipCert, slot)?.is_some() {
                    SendCode::More
                } else {
                    SendCode::Last
                };
                debug!(code = code as u8, "sending membership certificate");
                w.write_byte(code as u8);
                marshal_certificates(&chain, w);
                if code == SendCode::Last {
                    code = SendCode::None;
                }
            }
        }

        let hs = self.handshake.as_mut().ok_or(BusError::Security)?;
        hs.slot = slot;
        hs.code = code;
        Ok(())
    }

    fn send_memberships(&mut self, msg: &Message) -> Result<()> {
        let mut call = self.marshal_method_call(
            METHOD_SEND_MEMBERSHIPS,
            &msg.sender,
            FLAG_ENCRYPTED,
            self.call_timeout(),
        )?;
        let mut w = WireWriter::new();
        self.marshal_membership(&mut w)?;
        call.body = w.into_bytes();
        self.deliver(call);
        Ok(())
    }

    /// Verify and apply one received membership chain. A bad chain is
    /// logged and ignored; it simply grants nothing.
    fn receive_membership(&mut self, msg: &Message, r: &mut WireReader) {
        if let Err(e) = self.receive_membership_inner(msg, r) {
            debug!(error = %e, "membership chain not applied");
        }
    }

    fn receive_membership_inner(&mut self, msg: &Message, r: &mut WireReader) -> Result<()> {
        let chain = unmarshal_certificates(r)?;
        let leaf = chain.first().ok_or(BusError::Security)?;
        // The leaf must belong to the identity we authenticated
        let subject = self
            .handshake
            .as_ref()
            .and_then(|h| h.core.ecdsa.subject.clone())
            .ok_or(BusError::Security)?;
        if leaf.subject != subject {
            warn!("membership subject does not match identity");
            return Err(BusError::Security);
        }
        crate::sec::cert::verify_chain_links(&chain)?;
        let group = leaf.group.clone().ok_or(BusError::Security)?;
        let authority = find_membership_authority(&chain, &*self.store, &group)?;
        let peer = self.names.peer_index(&msg.sender)?;
        membership_apply(&mut self.access, &*self.store, &group, &authority, peer)
    }

    pub(crate) fn handle_send_memberships(&mut self, msg: &Message) -> Message {
        if self.handshake_valid(&msg.sender).is_err() {
            return self.busy_reply(msg);
        }
        match self.send_memberships_handler_inner(msg) {
            Ok(reply) => reply,
            Err(e) => self.fail_with_error_reply(msg, e),
        }
    }

    fn send_memberships_handler_inner(&mut self, msg: &Message) -> Result<Message> {
        let mut r = msg.reader();
        let mut code = r.read_byte()?;
        if code != SendCode::None as u8 {
            self.receive_membership(msg, &mut r);
            if code == SendCode::Last as u8 {
                code = SendCode::None as u8;
            }
        }

        let serial = self.next_serial();
        let mut reply = Message::method_return(msg, serial);
        let mut w = WireWriter::new();
        self.marshal_membership(&mut w)?;
        reply.body = w.into_bytes();

        let own_done = self
            .handshake
            .as_ref()
            .map(|h| h.code == SendCode::None)
            .unwrap_or(true);
        if own_done && code == SendCode::None as u8 {
            // Nothing more to send or receive
            self.handshake_complete(Ok(()));
        }
        Ok(reply)
    }

    pub(crate) fn handle_send_memberships_reply(&mut self, msg: &Message) -> Result<()> {
        if msg.is_error() {
            warn!(error = ?msg.error, "send memberships rejected");
            self.handshake_complete(Err(BusError::Security));
            return Err(BusError::Security);
        }
        self.handshake_valid(&msg.sender)?;
        let inner = (|| -> Result<u8> {
            let mut r = msg.reader();
            let mut code = r.read_byte()?;
            if code != SendCode::None as u8 {
                self.receive_membership(msg, &mut r);
                if code == SendCode::Last as u8 {
                    code = SendCode::None as u8;
                }
            }
            Ok(code)
        })();
        match inner {
            Ok(code) => {
                let own_done = self
                    .handshake
                    .as_ref()
                    .map(|h| h.code == SendCode::None)
                    .unwrap_or(true);
                if own_done && code == SendCode::None as u8 {
                    self.handshake_complete(Ok(()));
                    Ok(())
                } else {
                    self.send_memberships(msg).map_err(|e| {
                        self.handshake_complete(Err(e));
                        BusError::Security
                    })
                }
            }
            Err(e) => {
                self.handshake_complete(Err(e));
                Err(BusError::Security)
            }
        }
    }
}

/// Membership records hold a full chain, leaf first, as DER blobs.
pub fn encode_membership_record(chain_der: &[Vec<u8>]) -> Result<Vec<u8>> {
    bincode::serialize(&chain_der.to_vec()).map_err(|e| BusError::Io(e.to_string()))
}

fn decode_membership_record(data: &[u8]) -> Result<Vec<Certificate>> {
    let ders: Vec<Vec<u8>> = bincode::deserialize(data).map_err(|_| BusError::Invalid)?;
    ders.iter().map(|der| Certificate::decode_der(der)).collect()
}
