//! End-to-end handshake tests: two bus attachments wired back to back
//! through an in-process pump standing in for the transport.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use thinbus::introspect::{
    encode_message_id, APP_LIST, METHOD_CLAIM, METHOD_EXCHANGE_SUITES, METHOD_KEY_AUTHENTICATION,
    OBJ_FLAG_SECURE,
};
use thinbus::sec::access::Direction;
use thinbus::{
    default_policy, encode_membership_record, BusAttachment, BusError, CertificateBuilder,
    CredType, EccPublicKey, IdentityMaterial, Interface, Manifest, MemberTypeSel,
    MemoryCredentialStore, Message, MsgType, Object, PermissionMember, PermissionRule,
    ACTION_MODIFY, ACTION_OBSERVE, ACTION_PROVIDE, FLAG_ENCRYPTED, SUITE_ECDHE_ECDSA,
    SUITE_ECDHE_NULL,
};

const A_NAME: &str = ":1.1";
const B_NAME: &str = ":1.2";

fn door_object() -> Object {
    Object::new(
        "/app/door",
        OBJ_FLAG_SECURE,
        vec![Interface::new(
            "$com.example.Door",
            &["?Open", "?Close", "@State>"],
        )],
    )
}

fn open_id() -> u32 {
    encode_message_id(APP_LIST, 0, 0, 0)
}

fn close_id() -> u32 {
    encode_message_id(APP_LIST, 0, 0, 1)
}

fn bus(name: &str) -> BusAttachment {
    let mut bus = BusAttachment::new(name, Box::new(MemoryCredentialStore::new()));
    bus.register_objects(vec![door_object()], Vec::new());
    bus
}

type Status = Rc<RefCell<Option<Result<(), BusError>>>>;

fn capture() -> (Status, thinbus::AuthCallback) {
    let status: Status = Rc::new(RefCell::new(None));
    let clone = status.clone();
    (status, Box::new(move |s| *clone.borrow_mut() = Some(s)))
}

/// Shuttle messages between both attachments until quiescent. `tamper`
/// may inspect and rewrite each message in flight; returns the method
/// call ids observed.
fn pump_with(
    a: &mut BusAttachment,
    b: &mut BusAttachment,
    mut tamper: impl FnMut(&mut Message),
) -> Vec<u32> {
    let mut seen = Vec::new();
    loop {
        let mut progressed = false;
        while let Some(mut msg) = a.take_outgoing() {
            msg.sender = A_NAME.to_string();
            if msg.msg_type == MsgType::MethodCall {
                seen.push(msg.msg_id);
            }
            tamper(&mut msg);
            let _ = b.handle_message(&msg);
            progressed = true;
        }
        while let Some(mut msg) = b.take_outgoing() {
            msg.sender = B_NAME.to_string();
            if msg.msg_type == MsgType::MethodCall {
                seen.push(msg.msg_id);
            }
            tamper(&mut msg);
            let _ = a.handle_message(&msg);
            progressed = true;
        }
        if !progressed {
            break;
        }
    }
    seen
}

fn pump(a: &mut BusAttachment, b: &mut BusAttachment) -> Vec<u32> {
    pump_with(a, b, |_| {})
}

fn keypair() -> (SigningKey, EccPublicKey) {
    let sk = SigningKey::random(&mut rand::rngs::OsRng);
    let pk =
        EccPublicKey::from_sec1(VerifyingKey::from(&sk).to_encoded_point(false).as_bytes())
            .unwrap();
    (sk, pk)
}

#[test]
fn null_handshake_grants_bootstrap_rights() {
    let mut a = bus(A_NAME);
    let mut b = bus(B_NAME);
    a.enable_suite(SUITE_ECDHE_NULL);
    b.enable_suite(SUITE_ECDHE_NULL);

    let (status, cb) = capture();
    a.peer_authenticate(B_NAME, Some(cb)).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(*status.borrow(), Some(Ok(())));
    assert!(!a.authenticating());
    assert!(!b.authenticating());

    // With no stored policy, only the bootstrap surface is reachable
    let idx = b.peer_index(A_NAME).unwrap();
    assert!(b.access_table().check(METHOD_CLAIM, idx, Direction::Incoming).is_ok());
    assert!(b.access_table().check(open_id(), idx, Direction::Incoming).is_err());

    // An encrypted call on a denied member fails at marshal time
    let err = a
        .marshal_method_call(open_id(), B_NAME, FLAG_ENCRYPTED, Duration::from_secs(1))
        .unwrap_err();
    assert_eq!(err, BusError::Access);

    // And an inbound encrypted call on a denied member is gated
    let mut call = Message::method_call(open_id(), A_NAME, FLAG_ENCRYPTED, 77);
    call.sender = B_NAME.to_string();
    assert_eq!(a.handle_message(&call).unwrap_err(), BusError::Access);
}

#[test]
fn psk_handshake_completes() {
    let mut a = bus(A_NAME);
    let mut b = bus(B_NAME);
    a.set_password_callback(Box::new(|| b"1234".to_vec()));
    b.set_password_callback(Box::new(|| b"1234".to_vec()));

    let (status, cb) = capture();
    a.peer_authenticate(B_NAME, Some(cb)).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(*status.borrow(), Some(Ok(())));
}

#[test]
fn tampered_key_authentication_fails_both_sides() {
    let mut a = bus(A_NAME);
    let mut b = bus(B_NAME);
    a.set_password_callback(Box::new(|| b"1234".to_vec()));
    b.set_password_callback(Box::new(|| b"1234".to_vec()));

    let (status, cb) = capture();
    a.peer_authenticate(B_NAME, Some(cb)).unwrap();
    pump_with(&mut a, &mut b, |msg| {
        if msg.msg_type == MsgType::MethodCall && msg.msg_id == METHOD_KEY_AUTHENTICATION {
            // Flip one bit of the client's verifier
            let last = msg.body.len() - 1;
            msg.body[last] ^= 0x01;
        }
    });

    assert_eq!(*status.borrow(), Some(Err(BusError::Security)));
    assert!(!a.authenticating());
    assert!(!b.authenticating());
}

#[test]
fn wrong_psk_fails() {
    let mut a = bus(A_NAME);
    let mut b = bus(B_NAME);
    a.set_password_callback(Box::new(|| b"1234".to_vec()));
    b.set_password_callback(Box::new(|| b"5678".to_vec()));

    let (status, cb) = capture();
    a.peer_authenticate(B_NAME, Some(cb)).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(*status.borrow(), Some(Err(BusError::Security)));
}

/// Provision ECDSA material: CA root, identity leaf bound to the local
/// manifest, and a policy trusting the CA.
fn provision_ecdsa(bus: &mut BusAttachment, ca_sk: &SigningKey, ca_pk: &EccPublicKey, manifest: &Manifest) {
    let (leaf_sk, leaf_pk) = keypair();
    let manifest_bytes = manifest.to_bytes();
    let digest = Manifest::digest(&manifest_bytes);
    let leaf_der = CertificateBuilder::new(b"id", leaf_pk)
        .manifest_digest(digest)
        .sign(ca_sk);
    let root_der = CertificateBuilder::new(b"ca", ca_pk.clone()).sign(ca_sk);
    bus.set_identity(IdentityMaterial {
        signing_key: leaf_sk,
        cert_chain_der: vec![leaf_der, root_der],
    });
    bus.credential_store()
        .set(CredType::Manifest, None, 0, &manifest_bytes)
        .unwrap();

    // Policy: trust the CA, grant any trusted peer everything on the
    // door; the peer's manifest narrows this down.
    let policy = thinbus::Policy {
        specification: thinbus::POLICY_SPECIFICATION_VERSION,
        version: 7,
        acls: vec![
            thinbus::Acl {
                peers: vec![thinbus::PermissionPeer {
                    peer_type: thinbus::PeerType::FromCa,
                    public_key: Some(ca_pk.clone()),
                    group: None,
                }],
                rules: vec![PermissionRule {
                    obj: "*".to_string(),
                    ifn: "*".to_string(),
                    members: vec![PermissionMember {
                        name: "*".to_string(),
                        member_type: MemberTypeSel::Any,
                        action: ACTION_PROVIDE | ACTION_OBSERVE | ACTION_MODIFY,
                    }],
                }],
            },
            thinbus::Acl {
                peers: vec![thinbus::PermissionPeer {
                    peer_type: thinbus::PeerType::AnyTrusted,
                    public_key: None,
                    group: None,
                }],
                rules: vec![PermissionRule {
                    obj: "*".to_string(),
                    ifn: "*".to_string(),
                    members: vec![PermissionMember {
                        name: "*".to_string(),
                        member_type: MemberTypeSel::Any,
                        action: ACTION_PROVIDE | ACTION_OBSERVE | ACTION_MODIFY,
                    }],
                }],
            },
        ],
    };
    let bytes = policy.to_bytes();
    bus.credential_store().set(CredType::Policy, None, 0, &bytes).unwrap();
}

fn door_manifest() -> Manifest {
    Manifest {
        rules: vec![PermissionRule {
            obj: "/app/door".to_string(),
            ifn: "com.example.Door".to_string(),
            members: vec![PermissionMember {
                name: "Open".to_string(),
                member_type: MemberTypeSel::Method,
                action: ACTION_PROVIDE | ACTION_OBSERVE | ACTION_MODIFY,
            }],
        }],
    }
}

#[test]
fn ecdsa_handshake_applies_manifest() {
    let (ca_sk, ca_pk) = keypair();
    let mut a = bus(A_NAME);
    let mut b = bus(B_NAME);
    a.enable_suite(SUITE_ECDHE_ECDSA);
    b.enable_suite(SUITE_ECDHE_ECDSA);
    // The client commits to opening doors only; the server claims the
    // same capabilities towards the client.
    provision_ecdsa(&mut a, &ca_sk, &ca_pk, &door_manifest());
    provision_ecdsa(&mut b, &ca_sk, &ca_pk, &door_manifest());

    let (status, cb) = capture();
    a.peer_authenticate(B_NAME, Some(cb)).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(*status.borrow(), Some(Ok(())));

    // The manifest granted Open but nothing else: Close is outside the
    // manifest and therefore denied despite the broad policy.
    let idx = b.peer_index(A_NAME).unwrap();
    assert!(b.access_table().check(open_id(), idx, Direction::Incoming).is_ok());
    assert!(b.access_table().check(close_id(), idx, Direction::Incoming).is_err());
}

#[test]
fn ecdsa_with_wrong_ca_fails() {
    let (ca_sk, ca_pk) = keypair();
    let (other_sk, other_pk) = keypair();
    let mut a = bus(A_NAME);
    let mut b = bus(B_NAME);
    a.enable_suite(SUITE_ECDHE_ECDSA);
    b.enable_suite(SUITE_ECDHE_ECDSA);
    // The client's chain comes from a CA the server does not trust
    provision_ecdsa(&mut a, &other_sk, &other_pk, &door_manifest());
    provision_ecdsa(&mut b, &ca_sk, &ca_pk, &door_manifest());

    let (status, cb) = capture();
    a.peer_authenticate(B_NAME, Some(cb)).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(*status.borrow(), Some(Err(BusError::Security)));
}

#[test]
fn ecdsa_falls_back_to_null_when_enabled() {
    let (ca_sk, ca_pk) = keypair();
    let mut a = bus(A_NAME);
    let mut b = bus(B_NAME);
    a.enable_suite(SUITE_ECDHE_ECDSA);
    a.enable_suite(SUITE_ECDHE_NULL);
    b.enable_suite(SUITE_ECDHE_ECDSA);
    b.enable_suite(SUITE_ECDHE_NULL);
    // Only the server is provisioned; the client cannot sign, so the
    // ECDSA attempt dies locally and NULL is driven instead.
    provision_ecdsa(&mut b, &ca_sk, &ca_pk, &Manifest::empty());

    let (status, cb) = capture();
    a.peer_authenticate(B_NAME, Some(cb)).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(*status.borrow(), Some(Ok(())));
}

#[test]
fn cached_master_secret_resumes_and_rejection_falls_back() {
    let mut a = bus(A_NAME);
    let mut b = bus(B_NAME);
    a.enable_suite(SUITE_ECDHE_NULL);
    b.enable_suite(SUITE_ECDHE_NULL);

    let (status, cb) = capture();
    a.peer_authenticate(B_NAME, Some(cb)).unwrap();
    let first = pump(&mut a, &mut b);
    assert_eq!(*status.borrow(), Some(Ok(())));
    assert!(first.contains(&METHOD_EXCHANGE_SUITES));

    // Second peering rides the cached master secret: no suite
    // negotiation, straight to GenSessionKey.
    let (status, cb) = capture();
    a.peer_authenticate(B_NAME, Some(cb)).unwrap();
    let second = pump(&mut a, &mut b);
    assert_eq!(*status.borrow(), Some(Ok(())));
    assert!(!second.contains(&METHOD_EXCHANGE_SUITES));

    // The server lost its record: it rejects GenSessionKey and the
    // initiator falls through to the full conversation.
    let a_guid = a.local_guid();
    b.credential_store()
        .delete(CredType::MasterSecret, Some(&a_guid))
        .unwrap();
    let (status, cb) = capture();
    a.peer_authenticate(B_NAME, Some(cb)).unwrap();
    let third = pump(&mut a, &mut b);
    assert_eq!(*status.borrow(), Some(Ok(())));
    assert!(third.contains(&METHOD_EXCHANGE_SUITES));
}

#[test]
fn handshake_timeout_fires_and_recovers() {
    let mut a = bus(A_NAME);
    let mut b = bus(B_NAME);
    a.enable_suite(SUITE_ECDHE_NULL);
    b.enable_suite(SUITE_ECDHE_NULL);
    a.set_max_handshake_time(Duration::from_millis(10));
    b.set_max_handshake_time(Duration::from_millis(10));

    let (status, cb) = capture();
    a.peer_authenticate(B_NAME, Some(cb)).unwrap();

    // Deliver only the ExchangeGuids round, then let the line go dead
    let mut call = a.take_outgoing().unwrap();
    call.sender = A_NAME.to_string();
    b.handle_message(&call).unwrap();
    let mut reply = b.take_outgoing().unwrap();
    reply.sender = B_NAME.to_string();
    a.handle_message(&reply).unwrap();
    // Drop whatever the client sent next
    while a.take_outgoing().is_some() {}

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(a.handshake_timeout().unwrap_err(), BusError::Timeout);
    assert_eq!(*status.borrow(), Some(Err(BusError::Timeout)));
    assert!(!a.authenticating());

    // The next attempt starts clean and completes
    let (status, cb) = capture();
    a.peer_authenticate(B_NAME, Some(cb)).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(*status.borrow(), Some(Ok(())));
}

#[test]
fn second_handshake_while_live_is_resources() {
    let mut a = bus(A_NAME);
    let mut b = bus(B_NAME);
    a.enable_suite(SUITE_ECDHE_NULL);
    b.enable_suite(SUITE_ECDHE_NULL);

    a.peer_authenticate(B_NAME, None).unwrap();
    assert_eq!(
        a.peer_authenticate(B_NAME, None).unwrap_err(),
        BusError::Resources
    );
}

#[test]
fn encrypted_reply_from_wrong_sender_is_rejected() {
    let mut a = bus(A_NAME);
    let mut b = bus(B_NAME);
    a.enable_suite(SUITE_ECDHE_NULL);
    b.enable_suite(SUITE_ECDHE_NULL);
    let (status, cb) = capture();
    a.peer_authenticate(B_NAME, Some(cb)).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(*status.borrow(), Some(Ok(())));

    // An encrypted call to b, answered by an imposter
    let call = a
        .marshal_method_call(
            thinbus::introspect::METHOD_EXCHANGE_GROUP_KEYS,
            B_NAME,
            FLAG_ENCRYPTED,
            Duration::from_secs(5),
        )
        .unwrap();
    let mut reply = Message::method_return(&call, 1);
    reply.sender = ":1.66".to_string();
    assert_eq!(a.handle_message(&reply).unwrap_err(), BusError::NoMatch);
}

#[test]
fn membership_certificates_are_exchanged() {
    let (ca_sk, ca_pk) = keypair();
    let group = [7u8; 16];
    let mut a = bus(A_NAME);
    let mut b = bus(B_NAME);
    a.enable_suite(SUITE_ECDHE_ECDSA);
    b.enable_suite(SUITE_ECDHE_ECDSA);
    provision_ecdsa(&mut a, &ca_sk, &ca_pk, &door_manifest());
    provision_ecdsa(&mut b, &ca_sk, &ca_pk, &door_manifest());

    // The admin-group ACL narrows members of `group` to Open only;
    // store a membership certificate on the client for it.
    for end in [&mut a, &mut b] {
        let mut policy = thinbus::Policy::load(&*end.credential_store()).unwrap().unwrap();
        policy.acls.push(thinbus::Acl {
            peers: vec![thinbus::PermissionPeer {
                peer_type: thinbus::PeerType::WithMembership,
                public_key: Some(ca_pk.clone()),
                group: Some(group),
            }],
            rules: door_manifest().rules,
        });
        let bytes = policy.to_bytes();
        end.credential_store().set(CredType::Policy, None, 0, &bytes).unwrap();
    }

    // Client membership leaf: same subject as its identity certificate
    let a_identity_subject = {
        // Rebuild identity with a known subject for the membership leaf
        let (leaf_sk, leaf_pk) = keypair();
        let manifest_bytes = door_manifest().to_bytes();
        let digest = Manifest::digest(&manifest_bytes);
        let leaf_der = CertificateBuilder::new(b"id", leaf_pk.clone())
            .manifest_digest(digest)
            .sign(&ca_sk);
        let root_der = CertificateBuilder::new(b"ca", ca_pk.clone()).sign(&ca_sk);
        a.set_identity(IdentityMaterial {
            signing_key: leaf_sk,
            cert_chain_der: vec![leaf_der, root_der],
        });
        leaf_pk
    };
    let mbr_der = CertificateBuilder::new(b"mbr", a_identity_subject)
        .group(&group)
        .sign(&ca_sk);
    let root_der = CertificateBuilder::new(b"ca", ca_pk.clone()).sign(&ca_sk);
    let record = encode_membership_record(&[mbr_der, root_der]).unwrap();
    a.credential_store().append_slot(CredType::MembershipCert, 0, &record).unwrap();

    let (status, cb) = capture();
    a.peer_authenticate(B_NAME, Some(cb)).unwrap();
    pump(&mut a, &mut b);
    assert_eq!(*status.borrow(), Some(Ok(())));
}

#[test]
fn default_policy_round_trips_through_store() {
    let (_, admin_pk) = keypair();
    let mut b = bus(B_NAME);
    let policy = default_policy(admin_pk, [3u8; 16]);
    let bytes = policy.to_bytes();
    b.credential_store().set(CredType::Policy, None, 0, &bytes).unwrap();
    assert_eq!(
        thinbus::Policy::stored_version(&*b.credential_store()).unwrap(),
        1
    );
}
