//! Introspection-bound access control.
//!
//! One row per secure member of the registered object lists, built at
//! startup and destroyed only at shutdown. Each row carries one access
//! byte per peer-map slot with four bits: incoming/outgoing allow and
//! incoming/outgoing deny. Deny always wins. Policy application ORs
//! allow bits in; manifest application intersects them.

use crate::creds::CredentialStore;
use crate::error::{BusError, Result};
use crate::introspect::{
    member_body, member_kind, MemberKind, ObjectLists, METHOD_CLAIM, METHOD_EXCHANGE_GROUP_KEYS,
    METHOD_SECURITY_GET_PROP, METHOD_SEND_MANIFEST, OBJ_FLAG_SECURE, PROPERTY_SEC_ECC_PUBLICKEY,
    PROPERTY_SEC_MANIFEST_TEMPLATE,
};
use crate::sec::policy::{
    EccPublicKey, MemberTypeSel, PermissionPeer, PermissionRule, PeerType, Policy, ACTION_MODIFY,
    ACTION_OBSERVE, ACTION_PROVIDE,
};
use crate::sec::suites::SUITE_ECDHE_NULL;
use crate::types::NAME_MAP_SIZE;
use tracing::{debug, warn};

pub const ACCESS_INCOMING_DENY: u8 = 0x01;
pub const ACCESS_OUTGOING_DENY: u8 = 0x02;
pub const ACCESS_INCOMING_ALLOW: u8 = 0x04;
pub const ACCESS_OUTGOING_ALLOW: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Whether rules are being applied from the policy (grant) or from a
/// manifest (intersect).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyKind {
    Policy,
    Manifest,
}

// Effective action bit per message class, indexed by MemberKind
// (signal, method, property).
const ACCESS_INCOMING: [u8; 3] = [ACTION_PROVIDE, ACTION_MODIFY, ACTION_OBSERVE | ACTION_MODIFY];
const ACCESS_OUTGOING: [u8; 3] = [ACTION_OBSERVE, ACTION_PROVIDE, ACTION_PROVIDE];

/// What the applier needs to know about the authenticated peer when
/// matching ACL peer entries.
#[derive(Debug, Clone, Default)]
pub struct PeerAuthInfo {
    pub suite: u32,
    /// Subject public key from the peer's identity certificate.
    pub subject: Option<EccPublicKey>,
    /// Issuer public keys from the identity chain, root last.
    pub issuers: Vec<EccPublicKey>,
}

#[derive(Debug, Clone)]
struct AccessRow {
    id: u32,
    obj: String,
    ifn: String,
    /// Raw member encoding including type and marker characters.
    member: String,
    access: [u8; NAME_MAP_SIZE],
}

#[derive(Debug, Default)]
pub struct AccessControlTable {
    rows: Vec<AccessRow>,
}

impl AccessControlTable {
    /// Build the table from the registered object lists. A member is
    /// secure if its object carries the SECURE flag or its interface
    /// name starts with the secure sentinel.
    pub fn init(lists: &ObjectLists) -> AccessControlTable {
        let mut rows = Vec::new();
        lists.for_each_member(|id, obj, iface, member| {
            let secure = obj.flags & OBJ_FLAG_SECURE != 0 || iface.is_secure();
            if !secure {
                return;
            }
            debug!(
                "access row id={:#010x} obj={} ifn={} mbr={}",
                id, obj.path, iface.name, member
            );
            rows.push(AccessRow {
                id,
                obj: obj.path.clone(),
                ifn: iface.name.clone(),
                member: member.to_string(),
                access: [0u8; NAME_MAP_SIZE],
            });
        });
        AccessControlTable { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether a message id names a secure member. Secure members may
    /// only travel encrypted.
    pub fn contains(&self, id: u32) -> bool {
        self.rows.iter().any(|r| r.id == id)
    }

    /// Diagnostic view of one peer's access bytes, keyed by row id.
    pub fn snapshot(&self, peer: usize) -> Vec<(u32, u8)> {
        self.rows
            .iter()
            .map(|r| (r.id, r.access.get(peer).copied().unwrap_or(0)))
            .collect()
    }

    /// Clear all access previously granted to a peer index.
    pub fn reset(&mut self, peer: usize) {
        for row in &mut self.rows {
            if let Some(byte) = row.access.get_mut(peer) {
                *byte = 0;
            }
        }
    }

    /// Per-message check for the gate. Two plumbing messages may be
    /// sent encrypted on an interface that is not itself secure, so
    /// they are whitelisted when absent from the table; any other
    /// missing row is a deny.
    pub fn check(&self, id: u32, peer: usize, direction: Direction) -> Result<()> {
        let row = match self.rows.iter().find(|r| r.id == id) {
            Some(row) => row,
            None => {
                return match id {
                    METHOD_EXCHANGE_GROUP_KEYS | METHOD_SEND_MANIFEST => Ok(()),
                    _ => {
                        warn!("member {:#010x} not in access table", id);
                        Err(BusError::Access)
                    }
                };
            }
        };
        let access = *row.access.get(peer).ok_or(BusError::Access)?;
        let allowed = match direction {
            Direction::Incoming => {
                access & ACCESS_INCOMING_ALLOW != 0 && access & ACCESS_INCOMING_DENY == 0
            }
            Direction::Outgoing => {
                access & ACCESS_OUTGOING_ALLOW != 0 && access & ACCESS_OUTGOING_DENY == 0
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(BusError::Access)
        }
    }

    /// Walk the table against a rule list for one peer index. Policy
    /// rules OR allow bits in; manifest rules intersect: a row ends up
    /// with only the allow bits the manifest grants it, so members the
    /// manifest never mentions lose their policy grants. Explicit
    /// denies (empty action set) set both deny bits either way.
    pub fn apply_rules(&mut self, rules: &[PermissionRule], peer: usize, apply: ApplyKind) {
        for row in &mut self.rows {
            let row_ifn = {
                let bytes = row.ifn.as_bytes();
                if !bytes.is_empty()
                    && (bytes[0] == crate::introspect::SECURE_TRUE
                        || bytes[0] == crate::introspect::SECURE_OFF)
                {
                    &row.ifn[1..]
                } else {
                    &row.ifn
                }
            };
            let kind = match member_kind(&row.member) {
                Some(k) => k,
                None => continue,
            };
            let row_member = member_body(&row.member);

            let mut granted = 0u8;
            let mut denied = false;
            for rule in rules {
                if !common_path(&rule.obj, &row.obj) || !common_path(&rule.ifn, row_ifn) {
                    continue;
                }
                for member in &rule.members {
                    if !member_type_matches(member.member_type, kind)
                        || !common_path(&member.name, row_member)
                    {
                        continue;
                    }
                    if member.action == 0 {
                        denied = true;
                        continue;
                    }
                    if ACCESS_INCOMING[kind as usize] & member.action != 0 {
                        granted |= ACCESS_INCOMING_ALLOW;
                    }
                    if ACCESS_OUTGOING[kind as usize] & member.action != 0 {
                        granted |= ACCESS_OUTGOING_ALLOW;
                    }
                }
            }

            let access = match row.access.get_mut(peer) {
                Some(byte) => byte,
                None => continue,
            };
            if denied {
                *access |= ACCESS_INCOMING_DENY | ACCESS_OUTGOING_DENY;
            }
            match apply {
                ApplyKind::Policy => *access |= granted,
                ApplyKind::Manifest => {
                    let deny_bits = *access & (ACCESS_INCOMING_DENY | ACCESS_OUTGOING_DENY);
                    let allow_bits =
                        *access & (ACCESS_INCOMING_ALLOW | ACCESS_OUTGOING_ALLOW) & granted;
                    *access = deny_bits | allow_bits;
                }
            }
        }
    }

    /// Grant the minimal bootstrap set when no policy is stored: the
    /// security property surface and Claim, both directions.
    fn apply_bootstrap(&mut self, peer: usize) {
        for row in &mut self.rows {
            match row.id {
                METHOD_SECURITY_GET_PROP
                | PROPERTY_SEC_ECC_PUBLICKEY
                | PROPERTY_SEC_MANIFEST_TEMPLATE
                | METHOD_CLAIM => {
                    row.access[peer] |= ACCESS_INCOMING_ALLOW | ACCESS_OUTGOING_ALLOW;
                }
                _ => {}
            }
        }
    }

    /// Apply the stored policy for a peer: every ACL whose peer set
    /// matches the authenticated identity contributes its rules.
    pub fn policy_apply(
        &mut self,
        info: &PeerAuthInfo,
        peer: usize,
        store: &dyn CredentialStore,
    ) -> Result<()> {
        match Policy::load(store) {
            Ok(Some(policy)) => {
                for acl in &policy.acls {
                    if peer_set_matches(&acl.peers, info) {
                        self.apply_rules(&acl.rules, peer, ApplyKind::Policy);
                    }
                }
            }
            _ => {
                debug!(peer, "no stored policy, granting bootstrap rights");
                self.apply_bootstrap(peer);
            }
        }
        Ok(())
    }

    /// Intersect a received manifest into the peer's access bits.
    pub fn manifest_apply(&mut self, manifest: &crate::sec::policy::Manifest, peer: usize) {
        self.apply_rules(&manifest.rules, peer, ApplyKind::Manifest);
    }
}

fn member_type_matches(sel: MemberTypeSel, kind: MemberKind) -> bool {
    match sel {
        MemberTypeSel::Any => true,
        MemberTypeSel::Signal => kind == MemberKind::Signal,
        MemberTypeSel::Method => kind == MemberKind::Method,
        MemberTypeSel::Property => kind == MemberKind::Property,
    }
}

/// Whether any peer entry in an ACL admits the authenticated peer.
/// WithMembership is intentionally never matched here; membership
/// rights are granted only once a valid membership chain arrives.
fn peer_set_matches(peers: &[PermissionPeer], info: &PeerAuthInfo) -> bool {
    peers.iter().any(|peer| match peer.peer_type {
        PeerType::All => true,
        PeerType::AnyTrusted => info.suite != SUITE_ECDHE_NULL,
        PeerType::FromCa => match (&peer.public_key, info.issuers.first()) {
            (Some(key), Some(issuer)) => key == issuer,
            _ => false,
        },
        PeerType::WithPublicKey => match (&peer.public_key, &info.subject) {
            (Some(key), Some(subject)) => key == subject,
            _ => false,
        },
        PeerType::WithMembership => false,
    })
}

/// Pattern match for object paths, interface names and member names.
/// A trailing `*` matches any continuation; otherwise the description
/// must be fully consumed up to end of string or a space before
/// argument text. Property access markers are part of the description,
/// so a rule naming a property matches through a trailing `*` or by
/// spelling out the whole encoding.
pub fn common_path(name: &str, desc: &str) -> bool {
    let name = name.as_bytes();
    let desc = desc.as_bytes();
    let mut i = 0;
    while i < name.len() && i < desc.len() {
        if name[i] == b'*' {
            return true;
        }
        if name[i] != desc[i] {
            return false;
        }
        i += 1;
    }
    if i < name.len() {
        // Name has unmatched characters left; only a wildcard saves it
        return name[i] == b'*';
    }
    i >= desc.len() || desc[i] == b' '
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creds::MemoryCredentialStore;
    use crate::introspect::{Interface, Object, ObjectLists};
    use crate::sec::policy::PermissionMember;

    fn test_lists() -> ObjectLists {
        let mut lists = ObjectLists::new();
        lists.register(
            vec![Object::new(
                "/app/door",
                0,
                vec![Interface::new(
                    "$com.example.Door",
                    &["?Open", "?Close", "@State>", "!&StateChanged >u"],
                )],
            )],
            Vec::new(),
        );
        lists
    }

    fn rule(obj: &str, ifn: &str, name: &str, t: MemberTypeSel, action: u8) -> PermissionRule {
        PermissionRule {
            obj: obj.to_string(),
            ifn: ifn.to_string(),
            members: vec![PermissionMember {
                name: name.to_string(),
                member_type: t,
                action,
            }],
        }
    }

    #[test]
    fn wildcard_matching() {
        assert!(common_path("*", "anything"));
        assert!(common_path("foo/*", "foo/bar"));
        assert!(!common_path("foo", "foobar"));
        assert!(common_path("foo/bar", "foo/bar"));
        assert!(common_path("Open", "Open <s"));
        // The access marker is part of the description; a bare property
        // name stops short of it
        assert!(!common_path("State", "State>"));
        assert!(common_path("State*", "State>"));
        assert!(!common_path("Openx", "Open"));
    }

    #[test]
    fn rows_built_for_secure_members_only() {
        let mut lists = test_lists();
        lists.register(
            vec![
                Object::new("/plain", 0, vec![Interface::new("com.example.Plain", &["?Hi"])]),
                Object::new(
                    "/app/door",
                    0,
                    vec![Interface::new(
                        "$com.example.Door",
                        &["?Open", "?Close", "@State>", "!&StateChanged >u"],
                    )],
                ),
            ],
            Vec::new(),
        );
        let table = AccessControlTable::init(&lists);
        // 4 secure app members + 4 members of the standard security object
        assert_eq!(table.rows.len(), 8);
    }

    #[test]
    fn policy_or_then_check() {
        let lists = test_lists();
        let mut table = AccessControlTable::init(&lists);
        let open_id = table
            .rows
            .iter()
            .find(|r| r.member.starts_with("?Open"))
            .unwrap()
            .id;

        table.apply_rules(
            &[rule("/app/door", "com.example.Door", "Open", MemberTypeSel::Method, ACTION_MODIFY)],
            0,
            ApplyKind::Policy,
        );
        // method + MODIFY grants incoming only
        assert!(table.check(open_id, 0, Direction::Incoming).is_ok());
        assert!(table.check(open_id, 0, Direction::Outgoing).is_err());
        // other peers unaffected
        assert!(table.check(open_id, 1, Direction::Incoming).is_err());
    }

    #[test]
    fn property_rules_match_through_wildcard_not_bare_name() {
        let lists = test_lists();
        let mut table = AccessControlTable::init(&lists);
        let state_id = table
            .rows
            .iter()
            .find(|r| r.member.starts_with("@State"))
            .unwrap()
            .id;

        // The row encoding is "@State>"; a rule naming the property
        // without its access marker stops short and grants nothing
        table.apply_rules(
            &[rule("/app/door", "com.example.Door", "State", MemberTypeSel::Property, ACTION_OBSERVE)],
            0,
            ApplyKind::Policy,
        );
        assert!(table.check(state_id, 0, Direction::Incoming).is_err());

        // A trailing wildcard reaches the marker-suffixed row; property
        // OBSERVE grants incoming only
        table.apply_rules(
            &[rule("/app/door", "com.example.Door", "State*", MemberTypeSel::Property, ACTION_OBSERVE)],
            0,
            ApplyKind::Policy,
        );
        assert!(table.check(state_id, 0, Direction::Incoming).is_ok());
        assert!(table.check(state_id, 0, Direction::Outgoing).is_err());
    }

    #[test]
    fn deny_dominates_allow() {
        let lists = test_lists();
        let mut table = AccessControlTable::init(&lists);
        let open_id = table
            .rows
            .iter()
            .find(|r| r.member.starts_with("?Open"))
            .unwrap()
            .id;

        table.apply_rules(
            &[rule("*", "*", "*", MemberTypeSel::Any, ACTION_PROVIDE | ACTION_OBSERVE | ACTION_MODIFY)],
            0,
            ApplyKind::Policy,
        );
        assert!(table.check(open_id, 0, Direction::Incoming).is_ok());

        // Explicit deny: empty action set
        table.apply_rules(
            &[rule("/app/door", "com.example.Door", "Open", MemberTypeSel::Any, 0)],
            0,
            ApplyKind::Policy,
        );
        assert!(table.check(open_id, 0, Direction::Incoming).is_err());
        assert!(table.check(open_id, 0, Direction::Outgoing).is_err());
    }

    #[test]
    fn manifest_intersects() {
        let lists = test_lists();
        let mut table = AccessControlTable::init(&lists);
        let open_id = table
            .rows
            .iter()
            .find(|r| r.member.starts_with("?Open"))
            .unwrap()
            .id;
        let close_id = table
            .rows
            .iter()
            .find(|r| r.member.starts_with("?Close"))
            .unwrap()
            .id;

        // Policy grants both directions on everything
        table.apply_rules(
            &[rule("*", "*", "*", MemberTypeSel::Any, ACTION_PROVIDE | ACTION_OBSERVE | ACTION_MODIFY)],
            0,
            ApplyKind::Policy,
        );
        // Manifest only claims Open incoming
        let manifest_rules =
            [rule("/app/door", "com.example.Door", "Open", MemberTypeSel::Method, ACTION_MODIFY)];
        table.apply_rules(&manifest_rules, 0, ApplyKind::Manifest);

        assert!(table.check(open_id, 0, Direction::Incoming).is_ok());
        assert!(table.check(open_id, 0, Direction::Outgoing).is_err());
        // A member outside the manifest loses its policy grant
        assert!(table.check(close_id, 0, Direction::Incoming).is_err());
    }

    #[test]
    fn manifest_apply_is_idempotent() {
        let lists = test_lists();
        let mut table = AccessControlTable::init(&lists);
        table.apply_rules(
            &[rule("*", "*", "*", MemberTypeSel::Any, ACTION_PROVIDE | ACTION_OBSERVE | ACTION_MODIFY)],
            0,
            ApplyKind::Policy,
        );
        let manifest_rules =
            [rule("/app/door", "*", "*", MemberTypeSel::Any, ACTION_MODIFY)];
        table.apply_rules(&manifest_rules, 0, ApplyKind::Manifest);
        let once: Vec<u8> = table.rows.iter().map(|r| r.access[0]).collect();
        table.apply_rules(&manifest_rules, 0, ApplyKind::Manifest);
        let twice: Vec<u8> = table.rows.iter().map(|r| r.access[0]).collect();
        assert_eq!(once, twice);
    }

    #[test]
    fn missing_row_whitelist() {
        let table = AccessControlTable::init(&test_lists());
        assert!(table.check(METHOD_EXCHANGE_GROUP_KEYS, 0, Direction::Incoming).is_ok());
        assert!(table.check(METHOD_SEND_MANIFEST, 0, Direction::Outgoing).is_ok());
        assert_eq!(
            table.check(0x0101_0909, 0, Direction::Incoming).unwrap_err(),
            BusError::Access
        );
    }

    #[test]
    fn bootstrap_rights_without_policy() {
        let lists = test_lists();
        let mut table = AccessControlTable::init(&lists);
        let store = MemoryCredentialStore::new();
        let info = PeerAuthInfo { suite: SUITE_ECDHE_NULL, ..Default::default() };
        table.policy_apply(&info, 0, &store).unwrap();
        assert!(table.check(METHOD_CLAIM, 0, Direction::Incoming).is_ok());
        assert!(table.check(PROPERTY_SEC_ECC_PUBLICKEY, 0, Direction::Outgoing).is_ok());
        // App members get nothing
        let open_id = table
            .rows
            .iter()
            .find(|r| r.member.starts_with("?Open"))
            .unwrap()
            .id;
        assert!(table.check(open_id, 0, Direction::Incoming).is_err());
    }

    #[test]
    fn any_trusted_requires_authenticated_suite() {
        let trusted = [PermissionPeer {
            peer_type: PeerType::AnyTrusted,
            public_key: None,
            group: None,
        }];
        let null_info = PeerAuthInfo { suite: SUITE_ECDHE_NULL, ..Default::default() };
        let psk_info = PeerAuthInfo {
            suite: crate::sec::suites::SUITE_ECDHE_PSK,
            ..Default::default()
        };
        assert!(!peer_set_matches(&trusted, &null_info));
        assert!(peer_set_matches(&trusted, &psk_info));
    }

    #[test]
    fn reset_clears_one_peer() {
        let lists = test_lists();
        let mut table = AccessControlTable::init(&lists);
        table.apply_rules(
            &[rule("*", "*", "*", MemberTypeSel::Any, ACTION_MODIFY | ACTION_PROVIDE)],
            0,
            ApplyKind::Policy,
        );
        table.apply_rules(
            &[rule("*", "*", "*", MemberTypeSel::Any, ACTION_MODIFY | ACTION_PROVIDE)],
            1,
            ApplyKind::Policy,
        );
        table.reset(0);
        let open_id = table
            .rows
            .iter()
            .find(|r| r.member.starts_with("?Open"))
            .unwrap()
            .id;
        assert!(table.check(open_id, 0, Direction::Incoming).is_err());
        assert!(table.check(open_id, 1, Direction::Incoming).is_ok());
    }
}
