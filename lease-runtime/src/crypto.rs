//! Sealing of sandbox login details to the renter's public key.
//!
//! Renter keys are hex-encoded SEC1 secp256k1 public keys (compressed or
//! uncompressed, optional `0x` prefix). A sealed blob is
//! `ephemeral_pubkey (33) || nonce (12) || ciphertext`, base64 encoded. The
//! symmetric key is HKDF-SHA256 over the ECDH shared secret.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use k256::PublicKey;
use k256::ecdh::EphemeralSecret;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::error::{LeaseError, Result};

const HKDF_SALT: &[u8] = b"lease-node-login-seal";
const HKDF_INFO: &[u8] = b"chacha20poly1305-key-v1";
const EPHEMERAL_LEN: usize = 33;
const NONCE_LEN: usize = 12;

/// Parse a renter key into a secp256k1 public key.
pub fn parse_renter_key(renter_key: &str) -> Result<PublicKey> {
    let trimmed = renter_key.trim();
    let hex_part = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(hex_part)
        .map_err(|err| LeaseError::Validation(format!("renter key is not hex: {err}")))?;
    PublicKey::from_sec1_bytes(&bytes)
        .map_err(|_| LeaseError::Validation("renter key is not a secp256k1 public key".into()))
}

fn derive_key(shared_secret: &[u8]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_secret);
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|err| LeaseError::Validation(format!("key derivation failed: {err}")))?;
    Ok(key)
}

/// Encrypt `plaintext` so only the holder of the renter's secret key can read it.
pub fn seal_for_renter(renter_key: &str, plaintext: &[u8]) -> Result<String> {
    let recipient = parse_renter_key(renter_key)?;
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let shared = ephemeral.diffie_hellman(&recipient);
    let key = derive_key(shared.raw_secret_bytes().as_slice())?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| LeaseError::Validation("encryption failed".into()))?;

    let ephemeral_pub = ephemeral.public_key().to_encoded_point(true);
    let mut blob = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(ephemeral_pub.as_bytes());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(blob))
}

/// Renter-side inverse of [`seal_for_renter`].
pub fn open_sealed(secret: &k256::SecretKey, sealed: &str) -> Result<Vec<u8>> {
    let blob = STANDARD
        .decode(sealed.trim())
        .map_err(|err| LeaseError::Validation(format!("sealed blob is not base64: {err}")))?;
    if blob.len() < EPHEMERAL_LEN + NONCE_LEN {
        return Err(LeaseError::Validation("sealed blob is truncated".into()));
    }
    let (ephemeral_bytes, rest) = blob.split_at(EPHEMERAL_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let ephemeral = PublicKey::from_sec1_bytes(ephemeral_bytes)
        .map_err(|_| LeaseError::Validation("invalid ephemeral key".into()))?;
    let shared = k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());
    let key = derive_key(shared.raw_secret_bytes().as_slice())?;

    ChaCha20Poly1305::new(Key::from_slice(&key))
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| LeaseError::AuthMismatch("sealed blob does not open with this key".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renter() -> (k256::SecretKey, String) {
        let secret = k256::SecretKey::random(&mut OsRng);
        let public = hex::encode(secret.public_key().to_encoded_point(true).as_bytes());
        (secret, public)
    }

    #[test]
    fn sealed_login_opens_with_renter_secret() {
        let (secret, public) = renter();
        let sealed = seal_for_renter(&public, br#"{"username":"root"}"#).unwrap();
        let opened = open_sealed(&secret, &sealed).unwrap();
        assert_eq!(opened, br#"{"username":"root"}"#);
    }

    #[test]
    fn other_key_cannot_open() {
        let (_, public) = renter();
        let (other, _) = renter();
        let sealed = seal_for_renter(&public, b"secret").unwrap();
        assert!(matches!(
            open_sealed(&other, &sealed).unwrap_err(),
            LeaseError::AuthMismatch(_)
        ));
    }

    #[test]
    fn accepts_prefixed_uncompressed_key() {
        let (secret, _) = renter();
        let uncompressed = format!(
            "0x{}",
            hex::encode(secret.public_key().to_encoded_point(false).as_bytes())
        );
        let sealed = seal_for_renter(&uncompressed, b"x").unwrap();
        assert_eq!(open_sealed(&secret, &sealed).unwrap(), b"x");
    }

    #[test]
    fn rejects_non_key_input() {
        assert!(matches!(
            parse_renter_key("not-hex").unwrap_err(),
            LeaseError::Validation(_)
        ));
        assert!(matches!(
            parse_renter_key("deadbeef").unwrap_err(),
            LeaseError::Validation(_)
        ));
    }
}
