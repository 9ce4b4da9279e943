//! Key exchange and key authentication for the three cipher suites.
//!
//! All three suites run an ephemeral P-256 ECDHE exchange; the shared
//! point is stretched into the 48-byte master secret by the PRF. The
//! suites differ in how possession is proven during key authentication:
//! nothing (NULL), a MAC over the transcript and pre-shared key (PSK),
//! or an ECDSA signature plus identity chain (ECDSA).

use crate::crypto::{prf_sha256, SHA256_DIGEST_LEN};
use crate::error::{BusError, Result};
use crate::msg::{WireReader, WireWriter};
use crate::sec::cert::{verify_chain_links, Certificate, CERT_FMT_X509_DER};
use crate::sec::conversation::{ConversationHash, CONVERSATION_V1, CONVERSATION_V4};
use crate::sec::policy::EccPublicKey;
use crate::sec::suites::{SUITE_ECDHE_ECDSA, SUITE_ECDHE_NULL, SUITE_ECDHE_PSK};
use crate::types::{MASTER_SECRET_LEN, SESSION_KEY_LEN, VERIFIER_LEN};
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use tracing::{debug, warn};
use zeroize::Zeroize;

const LABEL_MASTER_SECRET: &[u8] = b"master secret";
const LABEL_SESSION_KEY: &[u8] = b"session key";
const LABEL_CLIENT_FINISHED: &[u8] = b"client finished";
const LABEL_SERVER_FINISHED: &[u8] = b"server finished";

/// PSK hint sent when the application never set one.
const DEFAULT_PSK_HINT: &[u8] = b"<anonymous>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRole {
    Client,
    Server,
}

impl AuthRole {
    fn finished_label(self) -> &'static [u8] {
        match self {
            AuthRole::Client => LABEL_CLIENT_FINISHED,
            AuthRole::Server => LABEL_SERVER_FINISHED,
        }
    }

    fn remote(self) -> AuthRole {
        match self {
            AuthRole::Client => AuthRole::Server,
            AuthRole::Server => AuthRole::Client,
        }
    }
}

/// Local identity material for ECDHE_ECDSA: the signing key and the
/// identity certificate chain, leaf first, as DER.
pub struct IdentityMaterial {
    pub signing_key: SigningKey,
    pub cert_chain_der: Vec<Vec<u8>>,
}

/// What the peer's identity chain established, kept for ACL matching,
/// manifest digest binding and credential persistence.
#[derive(Debug, Clone, Default)]
pub struct EcdsaAuthContext {
    pub subject: Option<EccPublicKey>,
    /// Issuer keys, immediate issuer first.
    pub issuers: Vec<EccPublicKey>,
    pub manifest_digest: Option<[u8; 32]>,
}

/// Per-handshake crypto state.
pub struct AuthCore {
    pub role: AuthRole,
    pub suite: u32,
    pub hash: ConversationHash,
    pub master_secret: [u8; MASTER_SECRET_LEN],
    pub have_master: bool,
    pub ecdsa: EcdsaAuthContext,
    pub psk_hint: Option<Vec<u8>>,
    pub psk: Option<Vec<u8>>,
    ephemeral: Option<EphemeralSecret>,
    peer_public: Option<p256::PublicKey>,
}

impl AuthCore {
    pub fn new(role: AuthRole) -> AuthCore {
        AuthCore {
            role,
            suite: 0,
            hash: ConversationHash::new(),
            master_secret: [0u8; MASTER_SECRET_LEN],
            have_master: false,
            ecdsa: EcdsaAuthContext::default(),
            psk_hint: None,
            psk: None,
            ephemeral: None,
            peer_public: None,
        }
    }

    /// Zeroize key material; called on clear and on drop.
    pub fn scrub(&mut self) {
        self.master_secret.zeroize();
        self.have_master = false;
        if let Some(psk) = self.psk.as_mut() {
            psk.zeroize();
        }
        self.psk = None;
        self.ephemeral = None;
    }

    // =========================================================================
    // KEY EXCHANGE
    // =========================================================================

    /// Marshal our ephemeral public key (all suites share the encoding).
    pub fn marshal_key_exchange(&mut self, w: &mut WireWriter) -> Result<()> {
        let secret = EphemeralSecret::random(&mut rand::rngs::OsRng);
        let public = secret.public_key();
        let point = public.to_encoded_point(false);
        self.hash.update_bytes(CONVERSATION_V1, point.as_bytes());
        w.write_bytes(point.as_bytes());
        self.ephemeral = Some(secret);
        // The responder already holds the initiator's key at this point
        if self.role == AuthRole::Server {
            self.derive_master_secret()?;
        }
        Ok(())
    }

    /// Unmarshal the peer's ephemeral public key.
    pub fn unmarshal_key_exchange(&mut self, r: &mut WireReader) -> Result<()> {
        let point = r.read_bytes()?;
        self.hash.update_bytes(CONVERSATION_V1, &point);
        let public = p256::PublicKey::from_sec1_bytes(&point).map_err(|_| BusError::Security)?;
        self.peer_public = Some(public);
        // The initiator's reply path has both halves now
        if self.role == AuthRole::Client {
            self.derive_master_secret()?;
        }
        Ok(())
    }

    /// Stretch the ECDHE shared point into the master secret. For PSK
    /// the pre-shared key is folded in, so a wrong password diverges
    /// the secret and every later verifier.
    fn derive_master_secret(&mut self) -> Result<()> {
        let secret = self.ephemeral.take().ok_or(BusError::Security)?;
        let peer = self.peer_public.as_ref().ok_or(BusError::Security)?;
        let shared = secret.diffie_hellman(peer);
        let shared_bytes = shared.raw_secret_bytes();
        let mut inputs: Vec<&[u8]> = vec![shared_bytes.as_slice(), LABEL_MASTER_SECRET];
        if self.suite == SUITE_ECDHE_PSK {
            let psk = self.psk.as_deref().ok_or(BusError::Security)?;
            inputs.push(psk);
        }
        prf_sha256(&inputs, &mut self.master_secret)?;
        self.have_master = true;
        debug!("master secret derived for suite {:#x}", self.suite);
        Ok(())
    }

    // =========================================================================
    // KEY AUTHENTICATION
    // =========================================================================

    /// Verifier over the transcript: PRF(master, finished-label,
    /// conversation digest [, psk]).
    fn compute_verifier(&self, role: AuthRole) -> Result<[u8; SHA256_DIGEST_LEN]> {
        if !self.have_master {
            return Err(BusError::Security);
        }
        let digest = self.hash.digest();
        let mut inputs: Vec<&[u8]> =
            vec![&self.master_secret, role.finished_label(), &digest];
        if self.suite == SUITE_ECDHE_PSK {
            let psk = self.psk.as_deref().ok_or(BusError::Security)?;
            inputs.push(psk);
        }
        let mut out = [0u8; SHA256_DIGEST_LEN];
        prf_sha256(&inputs, &mut out)?;
        Ok(out)
    }

    pub fn marshal_key_authentication(
        &mut self,
        w: &mut WireWriter,
        identity: Option<&IdentityMaterial>,
    ) -> Result<()> {
        let verifier = self.compute_verifier(self.role)?;
        match self.suite {
            SUITE_ECDHE_NULL => {
                w.write_bytes(&verifier);
            }
            SUITE_ECDHE_PSK => {
                let hint = self.psk_hint.clone().unwrap_or_else(|| DEFAULT_PSK_HINT.to_vec());
                self.hash.update_bytes(CONVERSATION_V1, &hint);
                w.write_bytes(&hint);
                w.write_bytes(&verifier);
            }
            SUITE_ECDHE_ECDSA => {
                let identity = identity.ok_or(BusError::Security)?;
                if identity.cert_chain_der.is_empty() {
                    return Err(BusError::Security);
                }
                let signature: Signature = identity.signing_key.sign(&verifier);
                let sig_bytes = signature.to_bytes();
                w.write_bytes(sig_bytes.as_slice());
                w.open_array();
                for der in &identity.cert_chain_der {
                    w.write_byte(CERT_FMT_X509_DER);
                    w.write_bytes(der);
                }
                w.close_array();
            }
            _ => return Err(BusError::Security),
        }
        Ok(())
    }

    /// Verify the peer's key-authentication body. `anchors` holds the
    /// certificate-authority keys from the stored policy; when empty
    /// (unclaimed device) an internally valid chain is accepted.
    pub fn unmarshal_key_authentication(
        &mut self,
        r: &mut WireReader,
        anchors: &[EccPublicKey],
    ) -> Result<()> {
        let expected = self.compute_verifier(self.role.remote())?;
        match self.suite {
            SUITE_ECDHE_NULL => {
                let verifier = r.read_bytes()?;
                if verifier != expected {
                    warn!("verifier mismatch");
                    return Err(BusError::Security);
                }
            }
            SUITE_ECDHE_PSK => {
                let hint = r.read_bytes()?;
                let verifier = r.read_bytes()?;
                self.hash.update_bytes(CONVERSATION_V1, &hint);
                self.psk_hint = Some(hint);
                if verifier != expected {
                    warn!("psk verifier mismatch");
                    return Err(BusError::Security);
                }
            }
            SUITE_ECDHE_ECDSA => {
                let sig_bytes = r.read_bytes()?;
                let chain = unmarshal_certificates(r)?;
                let leaf = chain.first().ok_or(BusError::Security)?;

                let key: VerifyingKey = leaf.subject.to_verifying_key()?;
                let signature =
                    Signature::from_slice(&sig_bytes).map_err(|_| BusError::Security)?;
                key.verify(&expected, &signature).map_err(|_| BusError::Security)?;

                verify_chain_links(&chain)?;
                if !anchors.is_empty() && !chain_anchored(&chain, anchors) {
                    warn!("identity chain has no known authority");
                    return Err(BusError::Security);
                }

                self.ecdsa.subject = Some(leaf.subject.clone());
                self.ecdsa.manifest_digest = leaf.manifest_digest;
                self.ecdsa.issuers = if chain.len() > 1 {
                    chain[1..].iter().map(|c| c.subject.clone()).collect()
                } else {
                    vec![leaf.subject.clone()]
                };
            }
            _ => return Err(BusError::Security),
        }
        Ok(())
    }
}

impl Drop for AuthCore {
    fn drop(&mut self) {
        self.scrub();
    }
}

/// Chain trust against stored authorities: an intermediate issuer may
/// be the authority itself, or the root certificate must verify under
/// one of the authority keys.
fn chain_anchored(chain: &[Certificate], anchors: &[EccPublicKey]) -> bool {
    for cert in &chain[1..] {
        if anchors.contains(&cert.subject) {
            return true;
        }
    }
    let root = match chain.last() {
        Some(c) => c,
        None => return false,
    };
    anchors.contains(&root.subject) || anchors.iter().any(|a| root.verify(a).is_ok())
}

/// Read a certificate chain marshalled as `a(yay)`, leaf first.
pub fn unmarshal_certificates(r: &mut WireReader) -> Result<Vec<Certificate>> {
    let mut chain = Vec::new();
    r.open_array()?;
    while r.array_has_more() {
        let fmt = r.read_byte()?;
        let der = r.read_bytes()?;
        if fmt != CERT_FMT_X509_DER {
            return Err(BusError::Invalid);
        }
        chain.push(Certificate::decode_der(&der)?);
    }
    r.close_array()?;
    Ok(chain)
}

/// Marshal a certificate chain as `a(yay)`, leaf first.
pub fn marshal_certificates(chain: &[Certificate], w: &mut WireWriter) {
    w.open_array();
    for cert in chain {
        w.write_byte(CERT_FMT_X509_DER);
        w.write_bytes(&cert.der);
    }
    w.close_array();
}

/// Session key and hex verifier from the master secret and both nonces
/// (initiator's first). The same derivation on both ends must agree.
pub fn session_key_and_verifier(
    master: &[u8; MASTER_SECRET_LEN],
    nonce_initiator: &str,
    nonce_responder: &str,
) -> Result<([u8; SESSION_KEY_LEN], String)> {
    let mut out = [0u8; SESSION_KEY_LEN + VERIFIER_LEN];
    prf_sha256(
        &[
            master,
            LABEL_SESSION_KEY,
            nonce_initiator.as_bytes(),
            nonce_responder.as_bytes(),
        ],
        &mut out,
    )?;
    let mut key = [0u8; SESSION_KEY_LEN];
    key.copy_from_slice(&out[..SESSION_KEY_LEN]);
    let verifier = hex::encode(&out[SESSION_KEY_LEN..]);
    out.zeroize();
    Ok((key, verifier))
}
