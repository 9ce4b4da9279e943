//! DER certificate profile for identity and membership chains.
//!
//! Chain trust here is key-based: a certificate is validated by
//! checking its ECDSA P-256 signature with the next certificate's
//! subject key, so only the fields the authorization core consumes are
//! modeled. The profile is a strict DER subset:
//!
//! ```text
//! Certificate ::= SEQUENCE {
//!     tbs SEQUENCE {
//!         serial           OCTET STRING,
//!         subjectPublicKey OCTET STRING (65-byte SEC1 point),
//!         [0] manifestDigest OCTET STRING (32) OPTIONAL,
//!         [1] group          OCTET STRING OPTIONAL
//!     },
//!     signature OCTET STRING (64 bytes, raw r || s)
//! }
//! ```
//!
//! The manifest-digest extension binds an identity certificate to the
//! manifest its holder may later present; the group extension marks a
//! membership certificate's group.

use crate::error::{BusError, Result};
use crate::sec::policy::EccPublicKey;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey};

pub const CERT_FMT_X509_DER: u8 = 0;

const TAG_SEQUENCE: u8 = 0x30;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_CTX_MANIFEST: u8 = 0x80;
const TAG_CTX_GROUP: u8 = 0x81;

// Certificates are small; anything larger is malformed input.
const MAX_CERT_LEN: usize = 4096;

fn write_tlv(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xFF {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    }
    out.extend_from_slice(content);
}

struct DerReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> DerReader<'a> {
    fn new(buf: &'a [u8]) -> DerReader<'a> {
        DerReader { buf, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn peek_tag(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Read one TLV; returns the tag, its content, and the raw TLV bytes.
    fn read_tlv(&mut self) -> Result<(u8, &'a [u8], &'a [u8])> {
        let start = self.pos;
        let tag = *self.buf.get(self.pos).ok_or(BusError::Invalid)?;
        self.pos += 1;
        let first = *self.buf.get(self.pos).ok_or(BusError::Invalid)?;
        self.pos += 1;
        let len = if first < 0x80 {
            first as usize
        } else {
            let num = (first & 0x7F) as usize;
            if num == 0 || num > 2 {
                return Err(BusError::Invalid);
            }
            let mut len = 0usize;
            for _ in 0..num {
                let b = *self.buf.get(self.pos).ok_or(BusError::Invalid)?;
                self.pos += 1;
                len = (len << 8) | b as usize;
            }
            len
        };
        if len > MAX_CERT_LEN || self.pos + len > self.buf.len() {
            return Err(BusError::Invalid);
        }
        let content = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok((tag, content, &self.buf[start..self.pos]))
    }

    fn expect(&mut self, want: u8) -> Result<&'a [u8]> {
        let (tag, content, _) = self.read_tlv()?;
        if tag != want {
            return Err(BusError::Invalid);
        }
        Ok(content)
    }
}

#[derive(Debug, Clone)]
pub struct Certificate {
    /// Original DER bytes, kept for re-marshalling the chain.
    pub der: Vec<u8>,
    pub serial: Vec<u8>,
    pub subject: EccPublicKey,
    pub manifest_digest: Option<[u8; 32]>,
    pub group: Option<Vec<u8>>,
    tbs: Vec<u8>,
    signature: [u8; 64],
}

impl Certificate {
    pub fn decode_der(der: &[u8]) -> Result<Certificate> {
        if der.len() > MAX_CERT_LEN {
            return Err(BusError::Invalid);
        }
        let mut outer = DerReader::new(der);
        let cert_content = outer.expect(TAG_SEQUENCE)?;
        if !outer.at_end() {
            return Err(BusError::Invalid);
        }

        let mut cert = DerReader::new(cert_content);
        let (tag, tbs_content, tbs_raw) = cert.read_tlv()?;
        if tag != TAG_SEQUENCE {
            return Err(BusError::Invalid);
        }
        let sig_bytes = cert.expect(TAG_OCTET_STRING)?;
        if !cert.at_end() || sig_bytes.len() != 64 {
            return Err(BusError::Invalid);
        }
        let mut signature = [0u8; 64];
        signature.copy_from_slice(sig_bytes);

        let mut tbs = DerReader::new(tbs_content);
        let serial = tbs.expect(TAG_OCTET_STRING)?.to_vec();
        let subject = EccPublicKey::from_sec1(tbs.expect(TAG_OCTET_STRING)?)?;
        let mut manifest_digest = None;
        let mut group = None;
        if tbs.peek_tag() == Some(TAG_CTX_MANIFEST) {
            let content = tbs.expect(TAG_CTX_MANIFEST)?;
            let digest: [u8; 32] = content.try_into().map_err(|_| BusError::Invalid)?;
            manifest_digest = Some(digest);
        }
        if tbs.peek_tag() == Some(TAG_CTX_GROUP) {
            group = Some(tbs.expect(TAG_CTX_GROUP)?.to_vec());
        }
        if !tbs.at_end() {
            return Err(BusError::Invalid);
        }

        Ok(Certificate {
            der: der.to_vec(),
            serial,
            subject,
            manifest_digest,
            group,
            tbs: tbs_raw.to_vec(),
            signature,
        })
    }

    /// Check this certificate's signature with an issuer's subject key.
    pub fn verify(&self, issuer: &EccPublicKey) -> Result<()> {
        let key = issuer.to_verifying_key()?;
        let sig = Signature::from_slice(&self.signature).map_err(|_| BusError::Security)?;
        key.verify(&self.tbs, &sig).map_err(|_| BusError::Security)
    }
}

/// Verify the internal issuer links of a chain, leaf first: each
/// certificate must be signed by the next one's subject key. The root
/// is not judged here; trust in the root comes from a stored authority.
pub fn verify_chain_links(chain: &[Certificate]) -> Result<()> {
    if chain.is_empty() {
        return Err(BusError::Security);
    }
    for pair in chain.windows(2) {
        pair[0].verify(&pair[1].subject)?;
    }
    Ok(())
}

/// Certificate builder used by provisioning and tests.
pub struct CertificateBuilder {
    serial: Vec<u8>,
    subject: EccPublicKey,
    manifest_digest: Option<[u8; 32]>,
    group: Option<Vec<u8>>,
}

impl CertificateBuilder {
    pub fn new(serial: &[u8], subject: EccPublicKey) -> CertificateBuilder {
        CertificateBuilder { serial: serial.to_vec(), subject, manifest_digest: None, group: None }
    }

    pub fn manifest_digest(mut self, digest: [u8; 32]) -> CertificateBuilder {
        self.manifest_digest = Some(digest);
        self
    }

    pub fn group(mut self, group: &[u8]) -> CertificateBuilder {
        self.group = Some(group.to_vec());
        self
    }

    /// Sign the TBS with the issuer key and emit DER.
    pub fn sign(self, issuer: &SigningKey) -> Vec<u8> {
        let mut tbs_content = Vec::new();
        write_tlv(&mut tbs_content, TAG_OCTET_STRING, &self.serial);
        write_tlv(&mut tbs_content, TAG_OCTET_STRING, &self.subject.to_sec1());
        if let Some(digest) = &self.manifest_digest {
            write_tlv(&mut tbs_content, TAG_CTX_MANIFEST, digest);
        }
        if let Some(group) = &self.group {
            write_tlv(&mut tbs_content, TAG_CTX_GROUP, group);
        }
        let mut tbs = Vec::new();
        write_tlv(&mut tbs, TAG_SEQUENCE, &tbs_content);

        let signature: Signature = issuer.sign(&tbs);
        let sig_bytes = signature.to_bytes();

        let mut cert_content = tbs;
        write_tlv(&mut cert_content, TAG_OCTET_STRING, sig_bytes.as_slice());
        let mut der = Vec::new();
        write_tlv(&mut der, TAG_SEQUENCE, &cert_content);
        der
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (SigningKey, EccPublicKey) {
        let sk = SigningKey::random(&mut rand::rngs::OsRng);
        let pk = EccPublicKey::from_sec1(
            p256::ecdsa::VerifyingKey::from(&sk)
                .to_encoded_point(false)
                .as_bytes(),
        )
        .unwrap();
        (sk, pk)
    }

    #[test]
    fn encode_decode_round_trip() {
        let (issuer_sk, issuer_pk) = keypair();
        let (_, subject_pk) = keypair();
        let der = CertificateBuilder::new(b"\x01\x02", subject_pk.clone())
            .manifest_digest([7u8; 32])
            .group(b"group-id-bytes")
            .sign(&issuer_sk);
        let cert = Certificate::decode_der(&der).unwrap();
        assert_eq!(cert.subject, subject_pk);
        assert_eq!(cert.manifest_digest, Some([7u8; 32]));
        assert_eq!(cert.group.as_deref(), Some(&b"group-id-bytes"[..]));
        cert.verify(&issuer_pk).unwrap();
    }

    #[test]
    fn tampered_tbs_fails_verify() {
        let (issuer_sk, issuer_pk) = keypair();
        let (_, subject_pk) = keypair();
        let mut der = CertificateBuilder::new(b"\x09", subject_pk).sign(&issuer_sk);
        // Flip a byte inside the serial
        der[6] ^= 0x01;
        match Certificate::decode_der(&der) {
            Ok(cert) => assert!(cert.verify(&issuer_pk).is_err()),
            Err(e) => assert_eq!(e, BusError::Invalid),
        }
    }

    #[test]
    fn chain_links_verify() {
        let (root_sk, root_pk) = keypair();
        let (inter_sk, inter_pk) = keypair();
        let (_, leaf_pk) = keypair();

        let root_der = CertificateBuilder::new(b"r", root_pk.clone()).sign(&root_sk);
        let inter_der = CertificateBuilder::new(b"i", inter_pk.clone()).sign(&root_sk);
        let leaf_der = CertificateBuilder::new(b"l", leaf_pk).sign(&inter_sk);

        let chain = vec![
            Certificate::decode_der(&leaf_der).unwrap(),
            Certificate::decode_der(&inter_der).unwrap(),
            Certificate::decode_der(&root_der).unwrap(),
        ];
        verify_chain_links(&chain).unwrap();

        // Out-of-order chain fails
        let bad = vec![chain[1].clone(), chain[0].clone(), chain[2].clone()];
        assert!(verify_chain_links(&bad).is_err());
    }

    #[test]
    fn garbage_is_invalid() {
        assert_eq!(Certificate::decode_der(&[0x30, 0x05, 1, 2]).unwrap_err(), BusError::Invalid);
        assert_eq!(Certificate::decode_der(&[]).unwrap_err(), BusError::Invalid);
    }
}
