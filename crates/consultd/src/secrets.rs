//! Credential encryption for provider API keys at rest.
//!
//! Keys are sealed with AES-256-GCM under a key derived from a host-stable
//! identifier, so the database stays opaque when copied off the machine but
//! needs no passphrase prompt on the machine itself. Layout of the stored
//! value: `base64(IV(16) || TAG(16) || CT)`.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{DaemonError, Result};

/// AES-256-GCM with the 16-byte nonce this format uses (not the 12-byte
/// default alias).
type Cipher = AesGcm<Aes256, U16>;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ROUNDS: u32 = 100_000;
/// Versioned so a future format change can re-derive without ambiguity.
const KEY_SALT: &[u8] = b"ai-consultation-mcp.credentials.v1";

/// First non-empty of USER / USERNAME / HOME. Stable per host account.
fn host_identifier() -> String {
    for var in ["USER", "USERNAME", "HOME"] {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                return value;
            }
        }
    }
    "ai-consultation-mcp".to_string()
}

fn derive_key(identifier: &str) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(identifier.as_bytes(), KEY_SALT, PBKDF2_ROUNDS, &mut key);
    key
}

fn cipher_for(identifier: &str) -> Cipher {
    let key = derive_key(identifier);
    Cipher::new(Key::<Cipher>::from_slice(&key))
}

/// Encrypt a plaintext credential for storage.
pub fn encrypt_credential(plaintext: &str) -> Result<String> {
    encrypt_with_identifier(plaintext, &host_identifier())
}

/// Decrypt a stored credential. Fails as a config error when the value is
/// malformed or was sealed on another host.
pub fn decrypt_credential(stored: &str) -> Result<String> {
    decrypt_with_identifier(stored, &host_identifier())
}

fn encrypt_with_identifier(plaintext: &str, identifier: &str) -> Result<String> {
    let cipher = cipher_for(identifier);

    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::<U16>::from_slice(&iv);

    // aes-gcm appends the tag to the ciphertext; the stored layout wants
    // IV || TAG || CT instead.
    let sealed = cipher
        .encrypt(nonce, Payload::from(plaintext.as_bytes()))
        .map_err(|_| DaemonError::internal("credential encryption failed"))?;
    let (ct, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut out = Vec::with_capacity(IV_LEN + TAG_LEN + ct.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(tag);
    out.extend_from_slice(ct);
    Ok(BASE64.encode(out))
}

fn decrypt_with_identifier(stored: &str, identifier: &str) -> Result<String> {
    let raw = BASE64
        .decode(stored)
        .map_err(|_| DaemonError::validation("apiKey", "stored credential is not valid base64"))?;
    if raw.len() < IV_LEN + TAG_LEN {
        return Err(DaemonError::validation(
            "apiKey",
            "stored credential is truncated",
        ));
    }

    let (iv, rest) = raw.split_at(IV_LEN);
    let (tag, ct) = rest.split_at(TAG_LEN);
    let nonce = Nonce::<U16>::from_slice(iv);

    let mut sealed = Vec::with_capacity(ct.len() + TAG_LEN);
    sealed.extend_from_slice(ct);
    sealed.extend_from_slice(tag);

    let cipher = cipher_for(identifier);
    let plain = cipher
        .decrypt(nonce, Payload::from(sealed.as_slice()))
        .map_err(|_| DaemonError::validation("apiKey", "stored credential failed to decrypt"))?;

    String::from_utf8(plain)
        .map_err(|_| DaemonError::validation("apiKey", "decrypted credential is not UTF-8"))
}

/// Masked rendering for config snapshots: eight bullets, plus the last four
/// characters when the key is long enough to keep that safe.
pub fn mask_key(key: &str) -> String {
    const BULLETS: &str = "\u{2022}\u{2022}\u{2022}\u{2022}\u{2022}\u{2022}\u{2022}\u{2022}";
    if key.chars().count() > 4 {
        let tail: String = key
            .chars()
            .skip(key.chars().count() - 4)
            .collect();
        format!("{BULLETS}{tail}")
    } else {
        BULLETS.to_string()
    }
}
