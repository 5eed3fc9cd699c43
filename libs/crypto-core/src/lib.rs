//! At-rest encryption for channel session material.
//!
//! Every credential blob and sync key is sealed with AES-256-GCM before it
//! touches Postgres or the Redis cache. Keys are derived per channel from a
//! single master key via HKDF-SHA256, so rotating one channel's material
//! never requires touching another's.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;

pub const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption error")]
    Encryption,
    #[error("decryption error")]
    Decryption,
    #[error("ciphertext too short")]
    Truncated,
}

/// Derive a per-channel data key from the service master key.
///
/// The channel id bytes are the HKDF `info` input; the salt is fixed so the
/// derivation is deterministic across restarts and replicas.
pub fn derive_channel_key(master_key: &[u8; 32], channel_id: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(b"lagoon.channel.v1"), master_key);
    let mut key = [0u8; 32];
    hk.expand(channel_id, &mut key)
        .expect("HKDF expand must succeed for 32 byte output");
    key
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Seal `plaintext` under `key`. The random nonce is prepended to the
/// returned ciphertext so the blob is self-contained.
pub fn encrypt_at_rest(plaintext: &[u8], key: &[u8; 32], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Encryption)?;
    let nonce_bytes = generate_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a blob produced by [`encrypt_at_rest`].
pub fn decrypt_at_rest(blob: &[u8], key: &[u8; 32], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < NONCE_LEN {
        return Err(CryptoError::Truncated);
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Decryption)?;
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Decryption)
}
