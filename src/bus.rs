//! The bus attachment: one endpoint's entire peering state.
//!
//! Everything the C-style original kept in statics lives here as owned
//! values: the name map, suite registry, credential store, access
//! table, reply contexts and the (at most one) live handshake. The
//! event pump is external: incoming messages are fed to
//! [`BusAttachment::handle_message`], outgoing messages accumulate in
//! an outbox the transport drains. Single-threaded by construction.

use crate::creds::CredentialStore;
use crate::error::{BusError, Result};
use crate::guid::NameMap;
use crate::introspect::{
    reply_id, Object, ObjectLists, METHOD_EXCHANGE_GROUP_KEYS, METHOD_EXCHANGE_GUIDS,
    METHOD_EXCHANGE_SUITES, METHOD_GEN_SESSION_KEY, METHOD_KEY_AUTHENTICATION, METHOD_KEY_EXCHANGE,
    METHOD_SEND_MANIFEST, METHOD_SEND_MEMBERSHIPS, STANDARD_LIST,
};
use crate::msg::{Message, MsgType, FLAG_ENCRYPTED};
use crate::sec::access::{AccessControlTable, Direction};
use crate::sec::handshake::Handshake;
use crate::sec::kex::IdentityMaterial;
use crate::sec::policy::Manifest;
use crate::sec::reply::ReplyContextTable;
use crate::sec::suites::{SuiteRegistry, SUITE_ECDHE_PSK};
use crate::types::{Guid, DEFAULT_REPLY_TIMEOUT, MAX_HANDSHAKE_TIME, SESSION_KEY_LEN};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

/// Completion callback for a peer authentication.
pub type AuthCallback = Box<dyn FnMut(Result<()>)>;

/// Password callback; registering one auto-enables ECDHE_PSK.
pub type PasswordCallback = Box<dyn Fn() -> Vec<u8>>;

pub struct BusAttachment {
    pub(crate) local_guid: Guid,
    pub(crate) unique_name: String,
    pub(crate) names: NameMap,
    pub(crate) suites: SuiteRegistry,
    pub(crate) store: Box<dyn CredentialStore>,
    pub(crate) objects: ObjectLists,
    pub(crate) access: AccessControlTable,
    pub(crate) replies: ReplyContextTable,
    pub(crate) handshake: Option<Handshake>,
    pub(crate) outbox: VecDeque<Message>,
    pub(crate) serial: u32,
    pub(crate) group_key: [u8; SESSION_KEY_LEN],
    pub(crate) pwd_callback: Option<PasswordCallback>,
    pub(crate) identity: Option<IdentityMaterial>,
    pub(crate) manifest_template: Option<Manifest>,
    pub(crate) max_handshake_time: Duration,
    /// How long saved credentials stay valid; None means forever.
    pub(crate) credential_ttl: Option<Duration>,
}

impl BusAttachment {
    pub fn new(unique_name: &str, store: Box<dyn CredentialStore>) -> BusAttachment {
        let objects = ObjectLists::new();
        let access = AccessControlTable::init(&objects);
        let mut group_key = [0u8; SESSION_KEY_LEN];
        crate::crypto::rand_bytes(&mut group_key);
        BusAttachment {
            local_guid: Guid::random(),
            unique_name: unique_name.to_string(),
            names: NameMap::new(),
            suites: SuiteRegistry::new(),
            store,
            objects,
            access,
            replies: ReplyContextTable::new(),
            handshake: None,
            outbox: VecDeque::new(),
            serial: 0,
            group_key,
            pwd_callback: None,
            identity: None,
            manifest_template: None,
            max_handshake_time: MAX_HANDSHAKE_TIME,
            credential_ttl: None,
        }
    }

    pub fn local_guid(&self) -> Guid {
        self.local_guid
    }

    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// Register application and proxy objects; rebuilds the access
    /// control table from the secure members found.
    pub fn register_objects(&mut self, app: Vec<Object>, proxy: Vec<Object>) {
        self.objects.register(app, proxy);
        self.access = AccessControlTable::init(&self.objects);
    }

    pub fn enable_suite(&mut self, suite: u32) {
        self.suites.enable(suite);
    }

    pub fn disable_suite(&mut self, suite: u32) {
        self.suites.disable(suite);
    }

    pub fn set_password_callback(&mut self, cb: PasswordCallback) {
        self.pwd_callback = Some(cb);
        self.suites.enable(SUITE_ECDHE_PSK);
    }

    pub fn set_identity(&mut self, identity: IdentityMaterial) {
        self.identity = Some(identity);
    }

    pub fn set_manifest_template(&mut self, manifest: Manifest) {
        self.manifest_template = Some(manifest);
    }

    pub fn set_max_handshake_time(&mut self, limit: Duration) {
        self.max_handshake_time = limit;
    }

    pub fn set_credential_ttl(&mut self, ttl: Option<Duration>) {
        self.credential_ttl = ttl;
    }

    pub fn access_table(&self) -> &AccessControlTable {
        &self.access
    }

    /// Peer-map slot index for a unique or well-known name.
    pub fn peer_index(&self, name: &str) -> Result<usize> {
        self.names.peer_index(name)
    }

    pub fn credential_store(&mut self) -> &mut dyn CredentialStore {
        &mut *self.store
    }

    pub(crate) fn next_serial(&mut self) -> u32 {
        self.serial = self.serial.wrapping_add(1).max(1);
        self.serial
    }

    /// Whether the gate applies to this message id. Standard-list
    /// handshake traffic is dispatched before gating, except the two
    /// plumbing messages the whitelist exists for.
    fn gated(msg_id: u32) -> bool {
        let list = (msg_id >> 24) as usize & 0x7F;
        list != STANDARD_LIST
            || matches!(msg_id, METHOD_EXCHANGE_GROUP_KEYS | METHOD_SEND_MANIFEST)
    }

    /// Build an outgoing method call, reserving a reply context. For
    /// encrypted calls the outgoing access bits are consulted first.
    pub fn marshal_method_call(
        &mut self,
        msg_id: u32,
        destination: &str,
        flags: u8,
        timeout: Duration,
    ) -> Result<Message> {
        if flags & FLAG_ENCRYPTED != 0 && Self::gated(msg_id) {
            let peer = self.names.peer_index(destination).map_err(|_| BusError::Access)?;
            self.access.check(msg_id, peer, Direction::Outgoing)?;
        }
        let serial = self.next_serial();
        // Capture the peer's unique name now; the reply must come from
        // it when the call is encrypted. Lookup failure is fine for
        // unencrypted calls.
        let unique = self.names.unique_name_of(destination).unwrap_or("").to_string();
        self.replies.alloc(serial, msg_id, timeout, &unique)?;
        Ok(Message::method_call(msg_id, destination, flags, serial))
    }

    /// Hand a message to the transport (queued in the outbox).
    pub fn deliver(&mut self, msg: Message) {
        self.outbox.push_back(msg);
    }

    pub fn take_outgoing(&mut self) -> Option<Message> {
        self.outbox.pop_front()
    }

    /// Dispatch one inbound message. The transport must have stamped
    /// `msg.sender` with the sending endpoint's unique name.
    pub fn handle_message(&mut self, msg: &Message) -> Result<()> {
        match msg.msg_type {
            MsgType::MethodCall => self.handle_method_call(msg),
            MsgType::MethodReturn | MsgType::Error => self.handle_reply(msg),
            MsgType::Signal => self.gate_incoming(msg),
        }
    }

    fn handle_method_call(&mut self, msg: &Message) -> Result<()> {
        // A secure member must arrive encrypted
        if msg.flags & FLAG_ENCRYPTED == 0
            && Self::gated(msg.msg_id)
            && self.access.contains(msg.msg_id)
        {
            warn!("secure member {:#010x} called without encryption", msg.msg_id);
            return Err(BusError::Security);
        }
        self.gate_incoming(msg)?;
        let reply = match msg.msg_id {
            METHOD_EXCHANGE_GUIDS => self.handle_exchange_guids(msg),
            METHOD_EXCHANGE_SUITES => self.handle_exchange_suites(msg),
            METHOD_KEY_EXCHANGE => self.handle_key_exchange(msg),
            METHOD_KEY_AUTHENTICATION => self.handle_key_authentication(msg),
            METHOD_GEN_SESSION_KEY => self.handle_gen_session_key(msg),
            METHOD_EXCHANGE_GROUP_KEYS => self.handle_exchange_group_keys(msg),
            METHOD_SEND_MANIFEST => self.handle_send_manifest(msg),
            METHOD_SEND_MEMBERSHIPS => self.handle_send_memberships(msg),
            _ => {
                debug!("unhandled method call {:#010x}", msg.msg_id);
                return Err(BusError::NoMatch);
            }
        };
        self.deliver(reply);
        Ok(())
    }

    fn gate_incoming(&self, msg: &Message) -> Result<()> {
        if msg.flags & FLAG_ENCRYPTED == 0 || !Self::gated(msg.msg_id) {
            return Ok(());
        }
        let peer = self.names.peer_index(&msg.sender).map_err(|_| BusError::Access)?;
        self.access.check(msg.msg_id, peer, Direction::Incoming)
    }

    fn handle_reply(&mut self, msg: &Message) -> Result<()> {
        let ctx = self.replies.take(msg.reply_serial).ok_or(BusError::NoMatch)?;
        // An authenticated reply must come from the endpoint the call
        // went to; anything else is cross-talk.
        if msg.flags & FLAG_ENCRYPTED != 0
            && !ctx.unique_name.is_empty()
            && msg.sender != ctx.unique_name
        {
            warn!(sender = %msg.sender, expected = %ctx.unique_name, "reply sender mismatch");
            return Err(BusError::NoMatch);
        }
        match ctx.message_id {
            METHOD_EXCHANGE_GUIDS => self.handle_exchange_guids_reply(msg),
            METHOD_EXCHANGE_SUITES => self.handle_exchange_suites_reply(msg),
            METHOD_KEY_EXCHANGE => self.handle_key_exchange_reply(msg),
            METHOD_KEY_AUTHENTICATION => self.handle_key_authentication_reply(msg),
            METHOD_GEN_SESSION_KEY => self.handle_gen_session_key_reply(msg),
            METHOD_EXCHANGE_GROUP_KEYS => self.handle_exchange_group_keys_reply(msg),
            METHOD_SEND_MANIFEST => self.handle_send_manifest_reply(msg),
            METHOD_SEND_MEMBERSHIPS => self.handle_send_memberships_reply(msg),
            _ => Ok(()),
        }
    }

    /// Sweep one expired outgoing call, synthesizing the timeout error
    /// reply the application would otherwise have waited for.
    pub fn timed_out_method_call(&mut self) -> Option<Message> {
        let (serial, message_id) = self.replies.timed_out()?;
        Some(Message {
            msg_type: MsgType::Error,
            msg_id: reply_id(message_id),
            serial: 0,
            reply_serial: serial,
            flags: 0,
            sender: String::new(),
            destination: self.unique_name.clone(),
            error: Some("org.thinbus.Error.Timeout".to_string()),
            body: Vec::new(),
        })
    }

    /// Forget all in-flight calls, e.g. on disconnect.
    pub fn release_reply_contexts(&mut self) {
        self.replies.clear();
    }

    /// Default timeout for bus-internal method calls.
    pub(crate) fn call_timeout(&self) -> Duration {
        DEFAULT_REPLY_TIMEOUT
    }
}
