//! AES-256-GCM envelope encryption for secrets and host tokens.
//!
//! Key resolution: `SLIPWAY_MASTER_KEY` env (base64, 32 bytes decoded) →
//! `<data_dir>/master.key` file (raw 32 bytes) → auto-generate.
//! Encrypted values are stored as `enc:base64(nonce || ciphertext || tag)`
//! so reads can detect and decrypt transparently. A single active key per
//! deployment; rotation is out of scope.

use std::fs::{self, OpenOptions};
use std::io::Write as IoWrite;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use tracing::{info, warn};

const NONCE_LEN: usize = 12; // AES-256-GCM standard nonce size
const KEY_LEN: usize = 32; // 256 bits

/// Prefix for encrypted values at rest.
pub const ENC_PREFIX: &str = "enc:";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to initialize AES-256-GCM key")]
    KeyInit,
    #[error("failed to generate random bytes")]
    Random,
    #[error("AES-256-GCM seal operation failed")]
    Seal,
    #[error("ciphertext is corrupt or encrypted with a different key")]
    Open,
}

/// Process-wide master key. Loaded once at startup and shared.
#[derive(Clone)]
pub struct MasterKey {
    key: [u8; KEY_LEN],
}

impl MasterKey {
    /// Resolve the master key: env var first, then key file, generating
    /// and persisting one (0600) when neither exists.
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        if let Ok(env_val) = std::env::var("SLIPWAY_MASTER_KEY") {
            let trimmed = env_val.trim();
            if !trimmed.is_empty() {
                let decoded = BASE64.decode(trimmed)?;
                if decoded.len() != KEY_LEN {
                    anyhow::bail!(
                        "SLIPWAY_MASTER_KEY has wrong length: {} (expected {})",
                        decoded.len(),
                        KEY_LEN
                    );
                }
                let mut key = [0u8; KEY_LEN];
                key.copy_from_slice(&decoded);
                return Ok(Self { key });
            }
        }

        let key_path = data_dir.join("master.key");
        match fs::read(&key_path) {
            Ok(bytes) if bytes.len() == KEY_LEN => {
                let mut key = [0u8; KEY_LEN];
                key.copy_from_slice(&bytes);
                return Ok(Self { key });
            }
            Ok(bytes) => {
                anyhow::bail!(
                    "master key file {} has wrong length: {} (expected {})",
                    key_path.display(),
                    bytes.len(),
                    KEY_LEN
                );
            }
            Err(_) => {}
        }

        let rng = SystemRandom::new();
        let mut key = [0u8; KEY_LEN];
        rng.fill(&mut key)
            .map_err(|_| anyhow::anyhow!("failed to generate master key"))?;

        fs::create_dir_all(data_dir)?;
        let mut opts = OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        opts.mode(0o600);
        match opts.open(&key_path) {
            Ok(mut file) => {
                file.write_all(&key)?;
                info!(
                    component = "crypto",
                    event = "crypto.key_generated",
                    path = %key_path.display(),
                    "Generated master key"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Another process created it between our check and open
                let bytes = fs::read(&key_path)?;
                if bytes.len() != KEY_LEN {
                    anyhow::bail!("concurrently created master key has wrong length");
                }
                key.copy_from_slice(&bytes);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self { key })
    }

    #[cfg(test)]
    pub fn random_for_tests() -> Self {
        let rng = SystemRandom::new();
        let mut key = [0u8; KEY_LEN];
        rng.fill(&mut key).unwrap();
        Self { key }
    }

    /// Encrypt a plaintext string, returning `enc:base64(...)`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| CryptoError::KeyInit)?;
        let key = LessSafeKey::new(unbound);

        let rng = SystemRandom::new();
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill(&mut nonce_bytes).map_err(|_| CryptoError::Random)?;
        // Random 96-bit nonce — collision probability ~2^-96 at our volume
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Seal)?;

        // nonce || ciphertext || tag
        let mut result = Vec::with_capacity(NONCE_LEN + in_out.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&in_out);

        Ok(format!("{}{}", ENC_PREFIX, BASE64.encode(&result)))
    }

    /// Decrypt a value produced by [`encrypt`]. Values without the `enc:`
    /// prefix pass through unchanged (pre-encryption rows).
    pub fn decrypt(&self, value: &str) -> Result<String, CryptoError> {
        let encoded = match value.strip_prefix(ENC_PREFIX) {
            Some(e) => e,
            None => return Ok(value.to_string()),
        };

        let unbound = UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| CryptoError::KeyInit)?;
        let key = LessSafeKey::new(unbound);

        let mut data = BASE64.decode(encoded).map_err(|_| CryptoError::Open)?;
        if data.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(CryptoError::Open);
        }

        let nonce_bytes: [u8; NONCE_LEN] = data[..NONCE_LEN].try_into().map_err(|_| CryptoError::Open)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let ciphertext = &mut data[NONCE_LEN..];
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), ciphertext)
            .map_err(|_| {
                warn!(
                    component = "crypto",
                    event = "crypto.decrypt.failed",
                    "Failed to decrypt value"
                );
                CryptoError::Open
            })?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::Open)
    }
}

/// SHA-256 of the input, hex-encoded. Used for WebSocket token storage.
pub fn sha256_hex(input: &str) -> String {
    let d = digest::digest(&digest::SHA256, input.as_bytes());
    let mut out = String::with_capacity(64);
    for b in d.as_ref() {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// 256 bits of CSPRNG output, base64url without padding.
pub fn random_token() -> String {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes).expect("system rng");
    BASE64_URL.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_encrypt_decrypt() {
        let key = MasterKey::random_for_tests();
        let secret = "gho_test-1234567890abcdef";
        let encrypted = key.encrypt(secret).unwrap();

        assert!(encrypted.starts_with(ENC_PREFIX));
        assert_ne!(encrypted, secret);
        assert_eq!(key.decrypt(&encrypted).unwrap(), secret);
    }

    #[test]
    fn empty_string_roundtrip() {
        let key = MasterKey::random_for_tests();
        let encrypted = key.encrypt("").unwrap();
        assert!(encrypted.starts_with(ENC_PREFIX));
        assert_eq!(key.decrypt(&encrypted).unwrap(), "");
    }

    #[test]
    fn non_ascii_roundtrip() {
        let key = MasterKey::random_for_tests();
        let secret = "pässwörd-密码-🔐";
        let encrypted = key.encrypt(secret).unwrap();
        assert_eq!(key.decrypt(&encrypted).unwrap(), secret);
    }

    #[test]
    fn sixteen_kib_boundary_roundtrip() {
        let key = MasterKey::random_for_tests();
        let secret = "x".repeat(16 * 1024);
        let encrypted = key.encrypt(&secret).unwrap();
        assert_eq!(key.decrypt(&encrypted).unwrap(), secret);
    }

    #[test]
    fn plaintext_passthrough() {
        let key = MasterKey::random_for_tests();
        assert_eq!(key.decrypt("not-encrypted").unwrap(), "not-encrypted");
    }

    #[test]
    fn unique_nonces() {
        let key = MasterKey::random_for_tests();
        let a = key.encrypt("same-secret").unwrap();
        let b = key.encrypt("same-secret").unwrap();
        assert_ne!(a, b, "random nonces should produce different ciphertext");
        assert_eq!(key.decrypt(&a).unwrap(), "same-secret");
        assert_eq!(key.decrypt(&b).unwrap(), "same-secret");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = MasterKey::random_for_tests();
        let encrypted = key.encrypt("secret").unwrap();
        let encoded = encrypted.strip_prefix(ENC_PREFIX).unwrap();
        let mut data = BASE64.decode(encoded).unwrap();
        if let Some(byte) = data.last_mut() {
            *byte ^= 0xFF;
        }
        let tampered = format!("{}{}", ENC_PREFIX, BASE64.encode(&data));
        assert!(key.decrypt(&tampered).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let key_a = MasterKey::random_for_tests();
        let key_b = MasterKey::random_for_tests();
        let encrypted = key_a.encrypt("secret").unwrap();
        assert!(key_b.decrypt(&encrypted).is_err());
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn random_tokens_are_unique_and_long_enough() {
        let a = random_token();
        let b = random_token();
        assert_ne!(a, b);
        // 32 bytes base64url-unpadded = 43 chars
        assert_eq!(a.len(), 43);
    }
}
