//! Cipher Manager: key derivation and authenticated encryption.
//!
//! One PBKDF2-HMAC-SHA256 derivation at startup yields 64 bytes of key
//! material. The first half is the AES-256-GCM data key; the second half is
//! the audit checksum key, so audit MACs never share a key with encryption.
//!
//! Token format: base64url (no padding) of `nonce (12) || ciphertext || tag`.

use std::sync::Arc;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{CryptoSettings, MIN_KDF_ITERATIONS, MIN_SECRET_LEN, SALT_LEN};
use crate::error::{Result, SecurityError};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Zeroize, ZeroizeOnDrop)]
struct KeyMaterial {
    data_key: [u8; KEY_LEN],
    audit_key: [u8; KEY_LEN],
}

/// Keyed-checksum key for audit events. Distinct from the data key.
#[derive(Clone)]
pub struct AuditKey(Arc<KeyMaterial>);

impl AuditKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0.audit_key
    }
}

impl std::fmt::Debug for AuditKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuditKey(<redacted>)")
    }
}

/// Derived keys plus AES-256-GCM encrypt/decrypt. Cheap to clone.
#[derive(Clone)]
pub struct CipherManager {
    keys: Arc<KeyMaterial>,
}

impl CipherManager {
    /// Derive from a secret and a hex-encoded 32-byte salt at the minimum
    /// policy iteration count.
    pub fn derive(secret: &[u8], salt_hex: &str) -> Result<Self> {
        let salt = hex::decode(salt_hex.trim())
            .map_err(|e| SecurityError::config(format!("Invalid salt: {}", e)))?;
        Self::derive_raw(secret, &salt, MIN_KDF_ITERATIONS)
    }

    /// Derive from validated settings.
    pub fn from_settings(settings: &CryptoSettings) -> Result<Self> {
        Self::derive_raw(&settings.secret, &settings.salt, settings.kdf_iterations)
    }

    fn derive_raw(secret: &[u8], salt: &[u8], iterations: u32) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(SecurityError::config(format!(
                "secret must be >= {} characters",
                MIN_SECRET_LEN
            )));
        }
        if salt.len() != SALT_LEN {
            return Err(SecurityError::config(format!(
                "salt must be exactly {} bytes, got {}",
                SALT_LEN,
                salt.len()
            )));
        }
        if iterations < MIN_KDF_ITERATIONS {
            return Err(SecurityError::config(format!(
                "kdf iterations must be >= {}",
                MIN_KDF_ITERATIONS
            )));
        }

        let started = std::time::Instant::now();
        let mut okm = [0u8; KEY_LEN * 2];
        pbkdf2::pbkdf2_hmac::<Sha256>(secret, salt, iterations, &mut okm);

        let mut keys = KeyMaterial {
            data_key: [0u8; KEY_LEN],
            audit_key: [0u8; KEY_LEN],
        };
        keys.data_key.copy_from_slice(&okm[..KEY_LEN]);
        keys.audit_key.copy_from_slice(&okm[KEY_LEN..]);
        okm.zeroize();

        tracing::debug!(
            "Derived key material ({} iterations) in {:?}",
            iterations,
            started.elapsed()
        );

        Ok(Self {
            keys: Arc::new(keys),
        })
    }

    pub fn audit_key(&self) -> AuditKey {
        AuditKey(Arc::clone(&self.keys))
    }

    /// Encrypt bytes into an opaque token. A fresh random nonce per call.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let cipher = self.aead()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| SecurityError::encryption("AEAD encryption failed"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(blob))
    }

    /// Decrypt a token produced by [`encrypt`](Self::encrypt). Fails as a
    /// whole on any decoding or authentication problem.
    pub fn decrypt(&self, token: &str) -> Result<Vec<u8>> {
        let blob = URL_SAFE_NO_PAD
            .decode(token.trim().as_bytes())
            .map_err(|e| SecurityError::encryption(format!("token is not valid base64: {}", e)))?;

        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(SecurityError::encryption("token is truncated"));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = self.aead()?;
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SecurityError::encryption("authentication failed; token altered or wrong key"))
    }

    fn aead(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.keys.data_key)
            .map_err(|_| SecurityError::encryption("invalid data key length"))
    }
}

impl std::fmt::Debug for CipherManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherManager(<redacted>)")
    }
}
