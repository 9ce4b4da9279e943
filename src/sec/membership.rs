//! Membership certificate verification and application.
//!
//! A received membership chain proves the peer belongs to a group. The
//! leaf's subject key must equal the already-authenticated identity
//! subject, the chain's internal links must verify, and the chain must
//! be anchored in a certificate authority the stored policy knows
//! about. On success the policy ACLs keyed to that group are applied.

use crate::creds::CredentialStore;
use crate::error::{BusError, Result};
use crate::sec::access::{AccessControlTable, ApplyKind};
use crate::sec::cert::Certificate;
use crate::sec::policy::{EccPublicKey, PeerType, Policy};
use crate::types::GUID_LEN;
use tracing::{debug, info, warn};

/// Certificate-authority keys the stored policy trusts (FromCA and
/// WithMembership entries). Used to anchor identity and membership
/// chains.
pub fn trust_anchors(store: &dyn CredentialStore) -> Vec<EccPublicKey> {
    let mut anchors = Vec::new();
    if let Ok(Some(policy)) = Policy::load(store) {
        for acl in &policy.acls {
            for peer in &acl.peers {
                if matches!(peer.peer_type, PeerType::FromCa | PeerType::WithMembership) {
                    if let Some(key) = &peer.public_key {
                        if !anchors.contains(key) {
                            anchors.push(key.clone());
                        }
                    }
                }
            }
        }
    }
    anchors
}

/// Find the authority that anchors a membership chain: either an
/// intermediate issuer the policy lists directly, or an authority key
/// that verifies the root certificate.
pub fn find_membership_authority(
    chain: &[Certificate],
    store: &dyn CredentialStore,
    group: &[u8],
) -> Result<EccPublicKey> {
    let policy = Policy::load(store)?.ok_or(BusError::Security)?;
    let mut candidates = Vec::new();
    for acl in &policy.acls {
        for peer in &acl.peers {
            if peer.peer_type != PeerType::WithMembership {
                continue;
            }
            match &peer.group {
                Some(g) if g.as_slice() == group => {}
                _ => continue,
            }
            if let Some(key) = &peer.public_key {
                candidates.push(key.clone());
            }
        }
    }

    // Intermediate issuers first
    for cert in chain.iter().skip(1) {
        if candidates.contains(&cert.subject) {
            return Ok(cert.subject.clone());
        }
    }
    // Otherwise the root must verify under a stored authority
    let root = chain.last().ok_or(BusError::Security)?;
    for key in &candidates {
        if root.subject == *key || root.verify(key).is_ok() {
            return Ok(key.clone());
        }
    }
    warn!("membership authority unknown");
    Err(BusError::Security)
}

/// The root issuer of a membership chain must be among the identity
/// certificate's issuers; memberships from unrelated authorities are
/// not sent.
pub fn common_issuer(chain: &[Certificate], identity_issuers: &[EccPublicKey]) -> Result<()> {
    let root = chain.last().ok_or(BusError::Security)?;
    if identity_issuers.contains(&root.subject) {
        return Ok(());
    }
    Err(BusError::NoMatch)
}

/// Apply the rules of every stored ACL keyed to this group and
/// authority, as a manifest-style intersection.
pub fn membership_apply(
    table: &mut AccessControlTable,
    store: &dyn CredentialStore,
    group: &[u8],
    authority: &EccPublicKey,
    peer: usize,
) -> Result<()> {
    if group.len() != GUID_LEN {
        return Err(BusError::Invalid);
    }
    let policy = Policy::load(store)?.ok_or(BusError::Security)?;
    let mut applied = 0;
    for acl in &policy.acls {
        let matched = acl.peers.iter().any(|p| {
            p.peer_type == PeerType::WithMembership
                && p.group.as_ref().map(|g| g.as_slice() == group).unwrap_or(false)
                && p.public_key.as_ref().map(|k| k == authority).unwrap_or(true)
        });
        if matched {
            table.apply_rules(&acl.rules, peer, ApplyKind::Manifest);
            applied += 1;
        }
    }
    if applied > 0 {
        info!(peer, acls = applied, "membership rules applied");
    } else {
        debug!(peer, "no acl keyed to membership group");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creds::{CredType, CredentialStore, MemoryCredentialStore};
    use crate::sec::cert::CertificateBuilder;
    use crate::sec::policy::{
        Acl, PermissionPeer, Policy, POLICY_SPECIFICATION_VERSION,
    };
    use p256::ecdsa::{SigningKey, VerifyingKey};
    use p256::elliptic_curve::sec1::ToEncodedPoint;

    fn keypair() -> (SigningKey, EccPublicKey) {
        let sk = SigningKey::random(&mut rand::rngs::OsRng);
        let pk = EccPublicKey::from_sec1(
            VerifyingKey::from(&sk).to_encoded_point(false).as_bytes(),
        )
        .unwrap();
        (sk, pk)
    }

    fn store_with_membership_acl(ca: EccPublicKey, group: [u8; GUID_LEN]) -> MemoryCredentialStore {
        let policy = Policy {
            specification: POLICY_SPECIFICATION_VERSION,
            version: 1,
            acls: vec![Acl {
                peers: vec![PermissionPeer {
                    peer_type: PeerType::WithMembership,
                    public_key: Some(ca),
                    group: Some(group),
                }],
                rules: Vec::new(),
            }],
        };
        let mut store = MemoryCredentialStore::new();
        store.set(CredType::Policy, None, 0, &policy.to_bytes()).unwrap();
        store
    }

    #[test]
    fn anchors_collected_from_policy() {
        let (_, ca_pk) = keypair();
        let store = store_with_membership_acl(ca_pk.clone(), [9u8; GUID_LEN]);
        assert_eq!(trust_anchors(&store), vec![ca_pk]);
    }

    #[test]
    fn membership_authority_found_for_direct_root() {
        let (ca_sk, ca_pk) = keypair();
        let (_, member_pk) = keypair();
        let group = [9u8; GUID_LEN];
        let store = store_with_membership_acl(ca_pk.clone(), group);

        let root_der = CertificateBuilder::new(b"r", ca_pk.clone()).sign(&ca_sk);
        let leaf_der = CertificateBuilder::new(b"m", member_pk)
            .group(&group)
            .sign(&ca_sk);
        let chain = vec![
            Certificate::decode_der(&leaf_der).unwrap(),
            Certificate::decode_der(&root_der).unwrap(),
        ];
        let authority = find_membership_authority(&chain, &store, &group).unwrap();
        assert_eq!(authority, ca_pk);
    }

    #[test]
    fn wrong_group_has_no_authority() {
        let (ca_sk, ca_pk) = keypair();
        let (_, member_pk) = keypair();
        let store = store_with_membership_acl(ca_pk.clone(), [9u8; GUID_LEN]);

        let root_der = CertificateBuilder::new(b"r", ca_pk).sign(&ca_sk);
        let leaf_der = CertificateBuilder::new(b"m", member_pk).sign(&ca_sk);
        let chain = vec![
            Certificate::decode_der(&leaf_der).unwrap(),
            Certificate::decode_der(&root_der).unwrap(),
        ];
        assert!(find_membership_authority(&chain, &store, &[1u8; GUID_LEN]).is_err());
    }

    #[test]
    fn common_issuer_requires_shared_root() {
        let (ca_sk, ca_pk) = keypair();
        let (_, member_pk) = keypair();
        let root_der = CertificateBuilder::new(b"r", ca_pk.clone()).sign(&ca_sk);
        let leaf_der = CertificateBuilder::new(b"m", member_pk).sign(&ca_sk);
        let chain = vec![
            Certificate::decode_der(&leaf_der).unwrap(),
            Certificate::decode_der(&root_der).unwrap(),
        ];
        assert!(common_issuer(&chain, &[ca_pk]).is_ok());
        let (_, other_pk) = keypair();
        assert_eq!(common_issuer(&chain, &[other_pk]).unwrap_err(), BusError::NoMatch);
    }
}
