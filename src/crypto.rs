//! SHA-256 primitives, the session-key PRF, and randomness helpers.

use crate::error::{BusError, Result};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const SHA256_DIGEST_LEN: usize = 32;

pub fn sha256(data: &[u8]) -> [u8; SHA256_DIGEST_LEN] {
    Sha256::digest(data).into()
}

/// SHA-256 PRF over a secret and a list of seed inputs.
///
/// TLS-style expansion: `A(0) = seed`, `A(i) = HMAC(secret, A(i-1))`,
/// output blocks are `HMAC(secret, A(i) || seed)` until `out` is full.
/// The first input is the secret; the rest are concatenated into the
/// seed. Used for master-secret stretching, session keys and verifiers.
pub fn prf_sha256(inputs: &[&[u8]], out: &mut [u8]) -> Result<()> {
    if inputs.is_empty() {
        return Err(BusError::Invalid);
    }
    let secret = inputs[0];
    let mut seed = Vec::new();
    for input in &inputs[1..] {
        seed.extend_from_slice(input);
    }

    let mac = |key: &[u8], data: &[&[u8]]| -> [u8; SHA256_DIGEST_LEN] {
        let mut m = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
        for d in data {
            m.update(d);
        }
        m.finalize().into_bytes().into()
    };

    let mut a = mac(secret, &[&seed]);
    let mut filled = 0;
    while filled < out.len() {
        let block = mac(secret, &[&a, &seed]);
        let n = (out.len() - filled).min(SHA256_DIGEST_LEN);
        out[filled..filled + n].copy_from_slice(&block[..n]);
        filled += n;
        a = mac(secret, &[&a]);
    }
    Ok(())
}

pub fn rand_bytes(buf: &mut [u8]) {
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, buf);
}

/// A fresh nonce rendered as lowercase ASCII hex (`2 * len` characters).
pub fn rand_hex(len: usize) -> String {
    let mut raw = vec![0u8; len];
    rand_bytes(&mut raw);
    hex::encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prf_deterministic() {
        let mut a = [0u8; 28];
        let mut b = [0u8; 28];
        prf_sha256(&[b"secret", b"label", b"seed"], &mut a).unwrap();
        prf_sha256(&[b"secret", b"label", b"seed"], &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn prf_input_order_matters() {
        let mut a = [0u8; 28];
        let mut b = [0u8; 28];
        prf_sha256(&[b"secret", b"n1", b"n2"], &mut a).unwrap();
        prf_sha256(&[b"secret", b"n2", b"n1"], &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn prf_long_output() {
        // More than one HMAC block of output
        let mut out = [0u8; 100];
        prf_sha256(&[b"secret", b"seed"], &mut out).unwrap();
        assert!(out.iter().any(|b| *b != 0));
    }

    #[test]
    fn nonce_is_ascii_hex() {
        let n = rand_hex(14);
        assert_eq!(n.len(), 28);
        assert!(n.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
