//! Envelope Codec: versioned, metadata-bearing wrapper around plaintext.
//!
//! The whole envelope (version, timestamp, payload, metadata) is serialised
//! and then encrypted as one unit, so the version tag is authenticated and
//! metadata is never stored in the clear.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::cipher::CipherManager;
use crate::clock::Clock;
use crate::context::SecurityContext;
use crate::error::{Result, SecurityError};

/// Free-form metadata carried inside an envelope.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Capability set the application needs for field encryption.
pub trait Sealer: Send + Sync {
    fn seal(&self, plaintext: &str, metadata: Metadata) -> Result<String>;
    fn open(&self, token: &str) -> Result<Opened>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: String,
    created_at: DateTime<Utc>,
    /// Plaintext bytes, base64 encoded
    payload: String,
    #[serde(default)]
    metadata: Metadata,
}

/// Result of a successful [`EnvelopeCodec::open`].
#[derive(Debug, Clone, PartialEq)]
pub struct Opened {
    pub plaintext: Vec<u8>,
    pub metadata: Metadata,
    pub version: String,
    pub created_at: DateTime<Utc>,
}

impl Opened {
    /// Plaintext as UTF-8. Non-UTF-8 payloads are an `Encryption` error.
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.plaintext)
            .map_err(|_| SecurityError::encryption("payload is not valid UTF-8"))
    }
}

pub struct EnvelopeCodec {
    cipher: CipherManager,
    version: String,
    max_payload_bytes: usize,
    clock: Arc<dyn Clock>,
}

impl EnvelopeCodec {
    pub fn new(
        cipher: CipherManager,
        version: impl Into<String>,
        max_payload_bytes: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cipher,
            version: version.into(),
            max_payload_bytes,
            clock,
        }
    }

    pub fn from_context(ctx: &SecurityContext, cipher: CipherManager) -> Self {
        let crypto = &ctx.settings().crypto;
        Self::new(
            cipher,
            crypto.envelope_version.clone(),
            crypto.max_payload_bytes,
            Arc::clone(ctx.clock()),
        )
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Seal arbitrary bytes. Rejects empty input and input above the size cap.
    pub fn seal_bytes(&self, plaintext: &[u8], metadata: Metadata) -> Result<String> {
        if plaintext.is_empty() {
            return Err(SecurityError::validation("data cannot be empty"));
        }
        if plaintext.len() > self.max_payload_bytes {
            return Err(SecurityError::validation(format!(
                "data size {} exceeds maximum of {} bytes",
                plaintext.len(),
                self.max_payload_bytes
            )));
        }

        let envelope = Envelope {
            version: self.version.clone(),
            created_at: self.clock.utc(),
            payload: BASE64.encode(plaintext),
            metadata,
        };
        let serialized = Zeroizing::new(
            serde_json::to_vec(&envelope)
                .map_err(|e| SecurityError::encryption(format!("envelope serialization failed: {}", e)))?,
        );
        self.cipher.encrypt(&serialized)
    }

    pub fn open_bytes(&self, token: &str) -> Result<Opened> {
        if token.trim().is_empty() {
            return Err(SecurityError::validation("Invalid encrypted data: empty token"));
        }

        let serialized = Zeroizing::new(self.cipher.decrypt(token)?);
        let envelope: Envelope = serde_json::from_slice(&serialized)
            .map_err(|e| SecurityError::encryption(format!("malformed envelope: {}", e)))?;

        if envelope.version != self.version {
            return Err(SecurityError::encryption(format!(
                "envelope version {} does not match active version {}",
                envelope.version, self.version
            )));
        }

        let plaintext = BASE64
            .decode(envelope.payload.as_bytes())
            .map_err(|e| SecurityError::encryption(format!("malformed envelope payload: {}", e)))?;

        Ok(Opened {
            plaintext,
            metadata: envelope.metadata,
            version: envelope.version,
            created_at: envelope.created_at,
        })
    }
}

impl Sealer for EnvelopeCodec {
    /// Seal text. Whitespace-only text counts as empty.
    fn seal(&self, plaintext: &str, metadata: Metadata) -> Result<String> {
        if plaintext.trim().is_empty() {
            return Err(SecurityError::validation("data cannot be empty"));
        }
        self.seal_bytes(plaintext.as_bytes(), metadata)
    }

    fn open(&self, token: &str) -> Result<Opened> {
        self.open_bytes(token)
    }
}
