mod settings;

pub use settings::{
    AnomalySettings, AuditSettings, BreakerSettings, CryptoSettings, MIN_KDF_ITERATIONS,
    MIN_SECRET_LEN, RateLimitSettings, SALT_LEN, SecuritySettings, StorageSettings,
};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub crypto: CryptoConfig,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub anomaly: AnomalyConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Long-term secret (>= 32 bytes). Normally `${PHIGUARD_SECRET}`.
    #[serde(default = "default_secret")]
    pub secret: String,

    /// 32-byte salt, hex encoded (64 chars). Normally `${PHIGUARD_SALT}`.
    #[serde(default = "default_salt")]
    pub salt: String,

    /// PBKDF2-HMAC-SHA256 rounds. Values below 600000 are rejected.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    /// Version tag written into every envelope
    #[serde(default = "default_envelope_version")]
    pub envelope_version: String,

    /// Largest plaintext accepted by `seal`, in bytes
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sliding window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(default = "default_encryption_limit")]
    pub encryption: u32,

    #[serde(default = "default_decryption_limit")]
    pub decryption: u32,

    #[serde(default = "default_audit_write_limit")]
    pub audit_write: u32,

    /// Failed authentications per subject before lock-out
    #[serde(default = "default_failed_auth_limit")]
    pub failed_auth: u32,

    #[serde(default = "default_certificate_limit")]
    pub certificate_issuance: u32,

    #[serde(default = "default_state_write_limit")]
    pub state_write: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the breaker stays open before allowing a trial call
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_timeout")]
    pub timeout_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// Recent actions remembered per subject
    #[serde(default = "default_anomaly_capacity")]
    pub window_capacity: usize,

    /// Same-action count within `span_secs` that is considered abnormal
    #[serde(default = "default_anomaly_threshold")]
    pub threshold: usize,

    #[serde(default = "default_anomaly_span")]
    pub span_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Rotating JSONL directory (default: state_dir/audit)
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Rotate when the active file would grow past this many bytes
    #[serde(default = "default_audit_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Rotated files kept (audit.jsonl.1 .. audit.jsonl.N)
    #[serde(default = "default_audit_backup_count")]
    pub backup_count: usize,

    /// Write events to the SQLite backing store as well as the file
    #[serde(default = "default_true")]
    pub store_enabled: bool,

    /// SQLite database path (default: state_dir/audit.sqlite)
    #[serde(default)]
    pub database: Option<String>,

    /// Days backing-store rows are kept before retention purge
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Encrypted state directory (default: data_dir/state)
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Backup directory (default: data_dir/backups)
    #[serde(default)]
    pub backup_dir: Option<String>,

    /// Snapshots kept per logical file
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_secret() -> String {
    "${PHIGUARD_SECRET}".to_string()
}
fn default_salt() -> String {
    "${PHIGUARD_SALT}".to_string()
}
fn default_kdf_iterations() -> u32 {
    MIN_KDF_ITERATIONS
}
fn default_envelope_version() -> String {
    "v2".to_string()
}
fn default_max_payload_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_window_secs() -> u64 {
    60
}
fn default_encryption_limit() -> u32 {
    100
}
fn default_decryption_limit() -> u32 {
    100
}
fn default_audit_write_limit() -> u32 {
    1000
}
fn default_failed_auth_limit() -> u32 {
    5
}
fn default_certificate_limit() -> u32 {
    10
}
fn default_state_write_limit() -> u32 {
    60
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout() -> u64 {
    60
}
fn default_session_timeout() -> u64 {
    30
}
fn default_anomaly_capacity() -> usize {
    100
}
fn default_anomaly_threshold() -> usize {
    20
}
fn default_anomaly_span() -> u64 {
    10
}
fn default_audit_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_audit_backup_count() -> usize {
    5
}
fn default_retention_days() -> u32 {
    // Six years, the HIPAA documentation retention period
    2190
}
fn default_max_backups() -> usize {
    10
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            secret: default_secret(),
            salt: default_salt(),
            kdf_iterations: default_kdf_iterations(),
            envelope_version: default_envelope_version(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            encryption: default_encryption_limit(),
            decryption: default_decryption_limit(),
            audit_write: default_audit_write_limit(),
            failed_auth: default_failed_auth_limit(),
            certificate_issuance: default_certificate_limit(),
            state_write: default_state_write_limit(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_session_timeout(),
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_capacity: default_anomaly_capacity(),
            threshold: default_anomaly_threshold(),
            span_secs: default_anomaly_span(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            max_file_bytes: default_audit_max_file_bytes(),
            backup_count: default_audit_backup_count(),
            store_enabled: default_true(),
            database: None,
            retention_days: default_retention_days(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            backup_dir: None,
            max_backups: default_max_backups(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load from the default location, creating a template on first run.
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;
        let path = paths.config_file();

        if !path.exists() {
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config.with_env_expanded());
        }

        Self::load_from(&path, paths)
    }

    /// Load an explicit config file (`--config` / `PHIGUARD_CONFIG`).
    pub fn load_from(path: &Path, paths: Paths) -> Result<Self> {
        Ok(Self::load_unexpanded(path, paths)?.with_env_expanded())
    }

    /// Load without `${VAR}` expansion, so saving it back never writes
    /// secrets from the environment into the file.
    pub fn load_unexpanded(path: &Path, paths: Paths) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.paths = paths;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&self.paths.config_file())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    /// Copy safe to print: expanded secret and salt are masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for value in [&mut config.crypto.secret, &mut config.crypto.salt] {
            if !value.starts_with('$') && !value.is_empty() {
                *value = "<redacted>".to_string();
            }
        }
        config
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    fn with_env_expanded(mut self) -> Self {
        self.crypto.secret = expand_env(&self.crypto.secret);
        self.crypto.salt = expand_env(&self.crypto.salt);
        self
    }

    /// Rotating audit log directory, resolved against `paths`.
    pub fn audit_log_dir(&self) -> PathBuf {
        resolve_dir(self.audit.log_dir.as_deref(), || self.paths.audit_log_dir())
    }

    /// Backing audit database, or `None` when the store is disabled.
    pub fn audit_database(&self) -> Option<PathBuf> {
        if !self.audit.store_enabled {
            return None;
        }
        Some(resolve_dir(self.audit.database.as_deref(), || {
            self.paths.audit_database()
        }))
    }

    pub fn store_dir(&self) -> PathBuf {
        resolve_dir(self.storage.data_dir.as_deref(), || self.paths.store_dir())
    }

    pub fn backup_dir(&self) -> PathBuf {
        resolve_dir(self.storage.backup_dir.as_deref(), || {
            self.paths.backup_dir()
        })
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["crypto", "kdf_iterations"] => Ok(self.crypto.kdf_iterations.to_string()),
            ["crypto", "envelope_version"] => Ok(self.crypto.envelope_version.clone()),
            ["crypto", "max_payload_bytes"] => Ok(self.crypto.max_payload_bytes.to_string()),
            ["rate_limits", "window_secs"] => Ok(self.rate_limits.window_secs.to_string()),
            ["rate_limits", "encryption"] => Ok(self.rate_limits.encryption.to_string()),
            ["rate_limits", "decryption"] => Ok(self.rate_limits.decryption.to_string()),
            ["rate_limits", "audit_write"] => Ok(self.rate_limits.audit_write.to_string()),
            ["rate_limits", "failed_auth"] => Ok(self.rate_limits.failed_auth.to_string()),
            ["rate_limits", "certificate_issuance"] => {
                Ok(self.rate_limits.certificate_issuance.to_string())
            }
            ["rate_limits", "state_write"] => Ok(self.rate_limits.state_write.to_string()),
            ["circuit_breaker", "failure_threshold"] => {
                Ok(self.circuit_breaker.failure_threshold.to_string())
            }
            ["circuit_breaker", "recovery_timeout_secs"] => {
                Ok(self.circuit_breaker.recovery_timeout_secs.to_string())
            }
            ["session", "timeout_minutes"] => Ok(self.session.timeout_minutes.to_string()),
            ["anomaly", "threshold"] => Ok(self.anomaly.threshold.to_string()),
            ["anomaly", "span_secs"] => Ok(self.anomaly.span_secs.to_string()),
            ["audit", "max_file_bytes"] => Ok(self.audit.max_file_bytes.to_string()),
            ["audit", "backup_count"] => Ok(self.audit.backup_count.to_string()),
            ["audit", "retention_days"] => Ok(self.audit.retention_days.to_string()),
            ["audit", "store_enabled"] => Ok(self.audit.store_enabled.to_string()),
            ["storage", "max_backups"] => Ok(self.storage.max_backups.to_string()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            ["logging", "format"] => Ok(self.logging.format.clone()),
            // Secrets are never echoed back
            ["crypto", "secret"] | ["crypto", "salt"] => {
                anyhow::bail!("{} is write-only", key)
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["crypto", "kdf_iterations"] => self.crypto.kdf_iterations = value.parse()?,
            ["crypto", "envelope_version"] => self.crypto.envelope_version = value.to_string(),
            ["crypto", "max_payload_bytes"] => self.crypto.max_payload_bytes = value.parse()?,
            ["rate_limits", "window_secs"] => self.rate_limits.window_secs = value.parse()?,
            ["rate_limits", "encryption"] => self.rate_limits.encryption = value.parse()?,
            ["rate_limits", "decryption"] => self.rate_limits.decryption = value.parse()?,
            ["rate_limits", "audit_write"] => self.rate_limits.audit_write = value.parse()?,
            ["rate_limits", "failed_auth"] => self.rate_limits.failed_auth = value.parse()?,
            ["rate_limits", "certificate_issuance"] => {
                self.rate_limits.certificate_issuance = value.parse()?
            }
            ["rate_limits", "state_write"] => self.rate_limits.state_write = value.parse()?,
            ["circuit_breaker", "failure_threshold"] => {
                self.circuit_breaker.failure_threshold = value.parse()?
            }
            ["circuit_breaker", "recovery_timeout_secs"] => {
                self.circuit_breaker.recovery_timeout_secs = value.parse()?
            }
            ["session", "timeout_minutes"] => self.session.timeout_minutes = value.parse()?,
            ["anomaly", "threshold"] => self.anomaly.threshold = value.parse()?,
            ["anomaly", "span_secs"] => self.anomaly.span_secs = value.parse()?,
            ["audit", "max_file_bytes"] => self.audit.max_file_bytes = value.parse()?,
            ["audit", "backup_count"] => self.audit.backup_count = value.parse()?,
            ["audit", "retention_days"] => self.audit.retention_days = value.parse()?,
            ["audit", "store_enabled"] => self.audit.store_enabled = value.parse()?,
            ["storage", "max_backups"] => self.storage.max_backups = value.parse()?,
            ["logging", "level"] => self.logging.level = value.to_string(),
            ["logging", "format"] => self.logging.format = value.to_string(),
            ["crypto", "secret"] | ["crypto", "salt"] => {
                anyhow::bail!("{} must be set through the environment", key)
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}

fn resolve_dir(configured: Option<&str>, default: impl FnOnce() -> PathBuf) -> PathBuf {
    match configured.map(str::trim).filter(|s| !s.is_empty()) {
        Some(dir) => PathBuf::from(shellexpand::tilde(dir).to_string()),
        None => default(),
    }
}

fn expand_env(s: &str) -> String {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else if let Some(var_name) = s.strip_prefix('$') {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else {
        s.to_string()
    }
}

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# phiguard Configuration
# Auto-created on first run. Edit as needed.

[crypto]
# Never put the secret or salt in this file. Generate both with
# `phiguard keygen` and export them in the environment.
secret = "${PHIGUARD_SECRET}"
salt = "${PHIGUARD_SALT}"
kdf_iterations = 600000
envelope_version = "v2"
max_payload_bytes = 10485760

[rate_limits]
window_secs = 60
encryption = 100
decryption = 100
audit_write = 1000
failed_auth = 5
certificate_issuance = 10
state_write = 60

[circuit_breaker]
failure_threshold = 5
recovery_timeout_secs = 60

[session]
timeout_minutes = 30

[anomaly]
window_capacity = 100
threshold = 20
span_secs = 10

[audit]
# log_dir = "~/.local/state/phiguard/audit"
max_file_bytes = 10485760
backup_count = 5
store_enabled = true
# database = "~/.local/state/phiguard/audit.sqlite"
retention_days = 2190

[storage]
# data_dir = "~/.local/share/phiguard/state"
# backup_dir = "~/.local/share/phiguard/backups"
max_backups = 10

[logging]
level = "info"
format = "pretty"
"#;
