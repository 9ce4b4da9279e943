//! Secure peering: handshake, key derivation, policy and access control

pub mod access;
pub mod cert;
pub mod conversation;
pub mod handshake;
pub mod kex;
pub mod membership;
pub mod policy;
pub mod reply;
pub mod suites;

pub use access::{
    AccessControlTable, ApplyKind, Direction, PeerAuthInfo, ACCESS_INCOMING_ALLOW,
    ACCESS_INCOMING_DENY, ACCESS_OUTGOING_ALLOW, ACCESS_OUTGOING_DENY,
};
pub use cert::{Certificate, CertificateBuilder, CERT_FMT_X509_DER};
pub use conversation::{ConversationHash, HashDirection, CONVERSATION_V1, CONVERSATION_V4};
pub use handshake::{encode_membership_record, AuthState, SendCode};
pub use kex::{
    session_key_and_verifier, AuthCore, AuthRole, EcdsaAuthContext, IdentityMaterial,
};
pub use membership::{find_membership_authority, membership_apply, trust_anchors};
pub use policy::{
    default_policy, Acl, EccPublicKey, Manifest, MemberTypeSel, PeerType, PermissionMember,
    PermissionPeer, PermissionRule, Policy, ACTION_MODIFY, ACTION_OBSERVE, ACTION_PROVIDE,
    POLICY_SPECIFICATION_VERSION,
};
pub use reply::{ReplyContext, ReplyContextTable};
pub use suites::{
    SuiteRegistry, SUITE_ECDHE_ECDSA, SUITE_ECDHE_NULL, SUITE_ECDHE_PSK,
};
