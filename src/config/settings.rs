//! Eager validation of the config file into the settings the core runs on.
//!
//! Everything is checked once, at startup. An invalid value is a
//! `SecurityError::Config` naming the key, never a runtime surprise.

use std::path::PathBuf;
use std::time::Duration;

use zeroize::Zeroizing;

use super::Config;
use crate::error::{Result, SecurityError};

/// Minimum PBKDF2 rounds accepted from configuration.
pub const MIN_KDF_ITERATIONS: u32 = 600_000;

/// Minimum length of the long-term secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Exact salt length, in raw bytes (64 hex characters).
pub const SALT_LEN: usize = 32;

/// Longest accepted audit retention (about a century).
pub const MAX_RETENTION_DAYS: u32 = 36_500;

#[derive(Clone)]
pub struct CryptoSettings {
    pub secret: Zeroizing<Vec<u8>>,
    pub salt: [u8; SALT_LEN],
    pub kdf_iterations: u32,
    pub envelope_version: String,
    pub max_payload_bytes: usize,
}

impl std::fmt::Debug for CryptoSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSettings")
            .field("secret", &"<redacted>")
            .field("salt", &"<redacted>")
            .field("kdf_iterations", &self.kdf_iterations)
            .field("envelope_version", &self.envelope_version)
            .field("max_payload_bytes", &self.max_payload_bytes)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub encryption: u32,
    pub decryption: u32,
    pub audit_write: u32,
    pub failed_auth: u32,
    pub certificate_issuance: u32,
    pub state_write: u32,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AnomalySettings {
    pub window_capacity: usize,
    pub threshold: usize,
    pub span: Duration,
}

#[derive(Debug, Clone)]
pub struct AuditSettings {
    pub log_dir: PathBuf,
    pub max_file_bytes: u64,
    pub backup_count: usize,
    pub database: Option<PathBuf>,
    pub retention: chrono::Duration,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub locks_dir: PathBuf,
    pub max_backups: usize,
}

/// Fully validated, immutable settings for one `SecurityCore`.
#[derive(Debug, Clone)]
pub struct SecuritySettings {
    pub crypto: CryptoSettings,
    pub rate_limits: RateLimitSettings,
    pub breaker: BreakerSettings,
    pub session_timeout: Duration,
    pub anomaly: AnomalySettings,
    pub audit: AuditSettings,
    pub storage: StorageSettings,
}

impl SecuritySettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let crypto = validate_crypto(config)?;

        let rl = &config.rate_limits;
        require_positive("rate_limits.window_secs", rl.window_secs)?;
        for (key, value) in [
            ("rate_limits.encryption", rl.encryption),
            ("rate_limits.decryption", rl.decryption),
            ("rate_limits.audit_write", rl.audit_write),
            ("rate_limits.failed_auth", rl.failed_auth),
            ("rate_limits.certificate_issuance", rl.certificate_issuance),
            ("rate_limits.state_write", rl.state_write),
        ] {
            require_positive(key, value as u64)?;
        }

        let cb = &config.circuit_breaker;
        require_positive("circuit_breaker.failure_threshold", cb.failure_threshold as u64)?;
        require_positive("circuit_breaker.recovery_timeout_secs", cb.recovery_timeout_secs)?;

        require_positive("session.timeout_minutes", config.session.timeout_minutes)?;
        let session_secs = config.session.timeout_minutes.checked_mul(60).ok_or_else(|| {
            SecurityError::config(format!(
                "session.timeout_minutes ({}) is too large",
                config.session.timeout_minutes
            ))
        })?;

        let an = &config.anomaly;
        require_positive("anomaly.window_capacity", an.window_capacity as u64)?;
        require_positive("anomaly.threshold", an.threshold as u64)?;
        require_positive("anomaly.span_secs", an.span_secs)?;
        if an.threshold >= an.window_capacity {
            return Err(SecurityError::config(format!(
                "anomaly.threshold ({}) must be below anomaly.window_capacity ({})",
                an.threshold, an.window_capacity
            )));
        }

        let au = &config.audit;
        require_positive("audit.max_file_bytes", au.max_file_bytes)?;
        require_positive("audit.retention_days", au.retention_days as u64)?;
        if au.retention_days > MAX_RETENTION_DAYS {
            return Err(SecurityError::config(format!(
                "audit.retention_days ({}) must be at most {}",
                au.retention_days, MAX_RETENTION_DAYS
            )));
        }

        require_positive("storage.max_backups", config.storage.max_backups as u64)?;

        let data_dir = config.store_dir();
        let backup_dir = config.backup_dir();
        if data_dir == backup_dir {
            return Err(SecurityError::config(
                "storage.backup_dir must differ from storage.data_dir",
            ));
        }

        Ok(Self {
            crypto,
            rate_limits: RateLimitSettings {
                window: Duration::from_secs(rl.window_secs),
                encryption: rl.encryption,
                decryption: rl.decryption,
                audit_write: rl.audit_write,
                failed_auth: rl.failed_auth,
                certificate_issuance: rl.certificate_issuance,
                state_write: rl.state_write,
            },
            breaker: BreakerSettings {
                failure_threshold: cb.failure_threshold,
                recovery_timeout: Duration::from_secs(cb.recovery_timeout_secs),
            },
            session_timeout: Duration::from_secs(session_secs),
            anomaly: AnomalySettings {
                window_capacity: an.window_capacity,
                threshold: an.threshold,
                span: Duration::from_secs(an.span_secs),
            },
            audit: AuditSettings {
                log_dir: config.audit_log_dir(),
                max_file_bytes: au.max_file_bytes,
                backup_count: au.backup_count,
                database: config.audit_database(),
                retention: chrono::Duration::days(au.retention_days as i64),
            },
            storage: StorageSettings {
                data_dir,
                backup_dir,
                locks_dir: config.paths.locks_dir(),
                max_backups: config.storage.max_backups,
            },
        })
    }
}

fn validate_crypto(config: &Config) -> Result<CryptoSettings> {
    let c = &config.crypto;

    let secret = c.secret.trim();
    if secret.is_empty() || is_unexpanded(secret) {
        return Err(SecurityError::config(
            "crypto.secret is not set (export PHIGUARD_SECRET)",
        ));
    }
    if secret.len() < MIN_SECRET_LEN {
        return Err(SecurityError::config(format!(
            "crypto.secret must be >= {} characters",
            MIN_SECRET_LEN
        )));
    }

    let salt_hex = c.salt.trim();
    if salt_hex.is_empty() || is_unexpanded(salt_hex) {
        return Err(SecurityError::config(
            "crypto.salt is not set (export PHIGUARD_SALT)",
        ));
    }
    let salt_bytes = Zeroizing::new(
        hex::decode(salt_hex)
            .map_err(|e| SecurityError::config(format!("Invalid crypto.salt: {}", e)))?,
    );
    if salt_bytes.len() != SALT_LEN {
        return Err(SecurityError::config(format!(
            "Invalid crypto.salt: expected {} bytes, got {}",
            SALT_LEN,
            salt_bytes.len()
        )));
    }
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&salt_bytes);

    if c.kdf_iterations < MIN_KDF_ITERATIONS {
        return Err(SecurityError::config(format!(
            "crypto.kdf_iterations must be >= {}",
            MIN_KDF_ITERATIONS
        )));
    }
    if c.envelope_version.trim().is_empty() {
        return Err(SecurityError::config("crypto.envelope_version is empty"));
    }
    require_positive("crypto.max_payload_bytes", c.max_payload_bytes as u64)?;

    Ok(CryptoSettings {
        secret: Zeroizing::new(secret.as_bytes().to_vec()),
        salt,
        kdf_iterations: c.kdf_iterations,
        envelope_version: c.envelope_version.trim().to_string(),
        max_payload_bytes: c.max_payload_bytes,
    })
}

/// A `${VAR}` placeholder survived expansion, i.e. the variable is unset.
fn is_unexpanded(value: &str) -> bool {
    value.starts_with("${") && value.ends_with('}')
}

fn require_positive(key: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(SecurityError::config(format!("{} must be greater than 0", key)));
    }
    Ok(())
}
