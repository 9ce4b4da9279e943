//! Authorization policy and manifest object model with deterministic
//! marshalling.
//!
//! Wire signatures are fixed and visible at the boundary:
//! - manifest: `a(ssa(syy))`
//! - policy:   `(qua(a(ya(yyayay)ay)a(ssa(syy))))`
//!
//! Unmarshalling is strict: any arity, container-close or type mismatch
//! drops the partial graph and surfaces `Invalid`. Marshal output is
//! byte-stable, so `unmarshal(marshal(p)) == p` and the manifest digest
//! is reproducible.

use crate::creds::{CredType, CredentialStore};
use crate::crypto::{sha256, SHA256_DIGEST_LEN};
use crate::error::{BusError, Result};
use crate::msg::{WireReader, WireWriter};
use crate::types::GUID_LEN;
use serde::{Deserialize, Serialize};

pub const POLICY_SPECIFICATION_VERSION: u16 = 1;

// Action bits; an empty action set is an explicit deny.
pub const ACTION_PROVIDE: u8 = 0x01;
pub const ACTION_OBSERVE: u8 = 0x02;
pub const ACTION_MODIFY: u8 = 0x04;

/// Elliptic-curve public key as it appears in the policy wire format:
/// algorithm and curve tags plus affine coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EccPublicKey {
    pub alg: u8,
    pub crv: u8,
    pub x: [u8; 32],
    pub y: [u8; 32],
}

/// ECDSA with SHA-256.
pub const KEY_ALG_ECDSA_SHA256: u8 = 0;
/// NIST P-256.
pub const KEY_CRV_NIST_P256: u8 = 0;

impl EccPublicKey {
    /// From a 65-byte SEC1 uncompressed point.
    pub fn from_sec1(bytes: &[u8]) -> Result<EccPublicKey> {
        if bytes.len() != 65 || bytes[0] != 0x04 {
            return Err(BusError::Invalid);
        }
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x.copy_from_slice(&bytes[1..33]);
        y.copy_from_slice(&bytes[33..65]);
        Ok(EccPublicKey { alg: KEY_ALG_ECDSA_SHA256, crv: KEY_CRV_NIST_P256, x, y })
    }

    pub fn to_sec1(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[0] = 0x04;
        out[1..33].copy_from_slice(&self.x);
        out[33..65].copy_from_slice(&self.y);
        out
    }

    pub fn to_verifying_key(&self) -> Result<p256::ecdsa::VerifyingKey> {
        p256::ecdsa::VerifyingKey::from_sec1_bytes(&self.to_sec1()).map_err(|_| BusError::Invalid)
    }
}

/// Member type selector inside a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberTypeSel {
    Any = 0,
    Signal = 1,
    Method = 2,
    Property = 3,
}

impl MemberTypeSel {
    fn from_wire(v: u8) -> Result<MemberTypeSel> {
        match v {
            0 => Ok(MemberTypeSel::Any),
            1 => Ok(MemberTypeSel::Signal),
            2 => Ok(MemberTypeSel::Method),
            3 => Ok(MemberTypeSel::Property),
            _ => Err(BusError::Invalid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerType {
    All = 0,
    AnyTrusted = 1,
    FromCa = 2,
    WithPublicKey = 3,
    WithMembership = 4,
}

impl PeerType {
    fn from_wire(v: u8) -> Result<PeerType> {
        match v {
            0 => Ok(PeerType::All),
            1 => Ok(PeerType::AnyTrusted),
            2 => Ok(PeerType::FromCa),
            3 => Ok(PeerType::WithPublicKey),
            4 => Ok(PeerType::WithMembership),
            _ => Err(BusError::Invalid),
        }
    }

    fn carries_key(self) -> bool {
        matches!(self, PeerType::FromCa | PeerType::WithPublicKey | PeerType::WithMembership)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PermissionMember {
    /// Member name pattern, optionally ending in `*`.
    pub name: String,
    pub member_type: MemberTypeSel,
    /// Union of ACTION_* bits; zero is an explicit deny.
    pub action: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRule {
    pub obj: String,
    pub ifn: String,
    pub members: Vec<PermissionMember>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PermissionPeer {
    pub peer_type: PeerType,
    pub public_key: Option<EccPublicKey>,
    /// Group GUID bytes for WithMembership peers.
    pub group: Option<[u8; GUID_LEN]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Acl {
    pub peers: Vec<PermissionPeer>,
    pub rules: Vec<PermissionRule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub specification: u16,
    pub version: u32,
    pub acls: Vec<Acl>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub rules: Vec<PermissionRule>,
}

// =============================================================================
// MARSHAL
// =============================================================================

// SIG = a(syy)
fn marshal_members(members: &[PermissionMember], w: &mut WireWriter) {
    w.open_array();
    for m in members {
        w.write_string(&m.name);
        w.write_byte(m.member_type as u8);
        w.write_byte(m.action);
    }
    w.close_array();
}

// SIG = a(ssa(syy))
fn marshal_rules(rules: &[PermissionRule], w: &mut WireWriter) {
    w.open_array();
    for rule in rules {
        w.write_string(&rule.obj);
        w.write_string(&rule.ifn);
        marshal_members(&rule.members, w);
    }
    w.close_array();
}

// SIG = a(ya(yyayay)ay)
fn marshal_peers(peers: &[PermissionPeer], w: &mut WireWriter) {
    w.open_array();
    for peer in peers {
        w.write_byte(peer.peer_type as u8);
        w.open_array();
        if let Some(key) = &peer.public_key {
            w.write_byte(key.alg);
            w.write_byte(key.crv);
            w.write_bytes(&key.x);
            w.write_bytes(&key.y);
        }
        w.close_array();
        match &peer.group {
            Some(g) => w.write_bytes(g),
            None => w.write_bytes(&[]),
        }
    }
    w.close_array();
}

impl Manifest {
    pub fn empty() -> Manifest {
        Manifest { rules: Vec::new() }
    }

    pub fn marshal(&self, w: &mut WireWriter) {
        marshal_rules(&self.rules, w);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        self.marshal(&mut w);
        w.into_bytes()
    }

    pub fn unmarshal(r: &mut WireReader) -> Result<Manifest> {
        Ok(Manifest { rules: unmarshal_rules(r)? })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Manifest> {
        let mut r = WireReader::new(bytes);
        let manifest = Manifest::unmarshal(&mut r)?;
        if r.remaining() != 0 {
            return Err(BusError::Invalid);
        }
        Ok(manifest)
    }

    /// Digest binding a manifest to an identity certificate: SHA-256
    /// over the marshalled rule list.
    pub fn digest(marshalled: &[u8]) -> [u8; SHA256_DIGEST_LEN] {
        sha256(marshalled)
    }
}

impl Policy {
    pub fn marshal(&self, w: &mut WireWriter) {
        w.write_u16(self.specification);
        w.write_u32(self.version);
        w.open_array();
        for acl in &self.acls {
            marshal_peers(&acl.peers, w);
            marshal_rules(&acl.rules, w);
        }
        w.close_array();
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        self.marshal(&mut w);
        w.into_bytes()
    }

    pub fn unmarshal(r: &mut WireReader) -> Result<Policy> {
        let specification = r.read_u16()?;
        let version = r.read_u32()?;
        let mut acls = Vec::new();
        r.open_array()?;
        while r.array_has_more() {
            let peers = unmarshal_peers(r)?;
            let rules = unmarshal_rules(r)?;
            acls.push(Acl { peers, rules });
        }
        r.close_array()?;
        Ok(Policy { specification, version, acls })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Policy> {
        let mut r = WireReader::new(bytes);
        let policy = Policy::unmarshal(&mut r)?;
        if r.remaining() != 0 {
            return Err(BusError::Invalid);
        }
        Ok(policy)
    }

    /// Load and unmarshal the stored policy, if one is installed.
    pub fn load(store: &dyn CredentialStore) -> Result<Option<Policy>> {
        match store.get(CredType::Policy, None)? {
            Some(record) if !record.expired() => Ok(Some(Policy::from_bytes(&record.data)?)),
            _ => Ok(None),
        }
    }

    /// Version of the stored policy without applying it.
    pub fn stored_version(store: &dyn CredentialStore) -> Result<u32> {
        match Policy::load(store)? {
            Some(policy) => Ok(policy.version),
            None => Err(BusError::Invalid),
        }
    }
}

// =============================================================================
// UNMARSHAL
// =============================================================================

fn unmarshal_members(r: &mut WireReader) -> Result<Vec<PermissionMember>> {
    let mut members = Vec::new();
    r.open_array()?;
    while r.array_has_more() {
        let name = r.read_string()?;
        let member_type = MemberTypeSel::from_wire(r.read_byte()?)?;
        let action = r.read_byte()?;
        members.push(PermissionMember { name, member_type, action });
    }
    r.close_array()?;
    Ok(members)
}

fn unmarshal_rules(r: &mut WireReader) -> Result<Vec<PermissionRule>> {
    let mut rules = Vec::new();
    r.open_array()?;
    while r.array_has_more() {
        let obj = r.read_string()?;
        let ifn = r.read_string()?;
        let members = unmarshal_members(r)?;
        rules.push(PermissionRule { obj, ifn, members });
    }
    r.close_array()?;
    Ok(rules)
}

fn unmarshal_peers(r: &mut WireReader) -> Result<Vec<PermissionPeer>> {
    let mut peers = Vec::new();
    r.open_array()?;
    while r.array_has_more() {
        let peer_type = PeerType::from_wire(r.read_byte()?)?;
        r.open_array()?;
        let public_key = if peer_type.carries_key() {
            let alg = r.read_byte()?;
            let crv = r.read_byte()?;
            let x_bytes = r.read_bytes()?;
            let y_bytes = r.read_bytes()?;
            let x: [u8; 32] = x_bytes.try_into().map_err(|_| BusError::Invalid)?;
            let y: [u8; 32] = y_bytes.try_into().map_err(|_| BusError::Invalid)?;
            Some(EccPublicKey { alg, crv, x, y })
        } else {
            None
        };
        r.close_array()?;
        let group_bytes = r.read_bytes()?;
        let group = if group_bytes.len() == GUID_LEN {
            let mut g = [0u8; GUID_LEN];
            g.copy_from_slice(&group_bytes);
            Some(g)
        } else {
            None
        };
        peers.push(PermissionPeer { peer_type, public_key, group });
    }
    r.close_array()?;
    Ok(peers)
}

// =============================================================================
// DEFAULT POLICY
// =============================================================================

/// The factory policy: the admin group gets everything; any trusted
/// peer may consume what we provide and observe our signals.
pub fn default_policy(admin_key: EccPublicKey, admin_group: [u8; GUID_LEN]) -> Policy {
    let all = PermissionMember {
        name: "*".to_string(),
        member_type: MemberTypeSel::Any,
        action: ACTION_PROVIDE | ACTION_OBSERVE | ACTION_MODIFY,
    };
    let provide = PermissionMember {
        name: "*".to_string(),
        member_type: MemberTypeSel::Any,
        action: ACTION_PROVIDE,
    };
    let observe_signals = PermissionMember {
        name: "*".to_string(),
        member_type: MemberTypeSel::Signal,
        action: ACTION_OBSERVE,
    };
    Policy {
        specification: POLICY_SPECIFICATION_VERSION,
        version: 1,
        acls: vec![
            Acl {
                peers: vec![PermissionPeer {
                    peer_type: PeerType::WithMembership,
                    public_key: Some(admin_key),
                    group: Some(admin_group),
                }],
                rules: vec![PermissionRule {
                    obj: "*".to_string(),
                    ifn: "*".to_string(),
                    members: vec![all],
                }],
            },
            Acl {
                peers: vec![PermissionPeer {
                    peer_type: PeerType::AnyTrusted,
                    public_key: None,
                    group: None,
                }],
                rules: vec![PermissionRule {
                    obj: "*".to_string(),
                    ifn: "*".to_string(),
                    members: vec![provide, observe_signals],
                }],
            },
        ],
    }
}
