//! Audit event model and keyed checksums.
//!
//! # Line format
//!
//! One JSON object per line (JSONL):
//!
//! | Field | Description |
//! |-------|-------------|
//! | `timestamp` | RFC 3339 UTC timestamp |
//! | `severity` | `low`, `medium`, `high`, `critical` |
//! | `subject_id` | Who acted (sanitized) |
//! | `action` | What happened, snake_case |
//! | `session_id` | Session the action ran under, if any |
//! | `origin` | IP address or `0.0.0.0` |
//! | `checksum` | HMAC-SHA256 over subject, action, details and origin |
//! | `details` | Free text, HTML-escaped |
//! | `metadata` | Optional string map |
//!
//! The checksum key is the audit half of the derived key material, never the
//! data-encryption key.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;

use crate::crypto::AuditKey;
use crate::error::{Result, SecurityError};
use crate::validation::{
    MAX_METADATA_VALUE_LEN, MAX_SESSION_ID_LEN, MAX_SUBJECT_LEN, normalize_origin,
    sanitize_details, sanitize_field,
};

type HmacSha256 = Hmac<Sha256>;

/// Separator between checksummed fields. Control characters are stripped
/// from every field, so it cannot occur inside one.
const FIELD_SEPARATOR: char = '\u{1f}';

/// Subject recorded when the caller could not be identified.
pub const ANONYMOUS_SUBJECT: &str = "anonymous";

/// Subject used for events the core emits on its own behalf.
pub const SYSTEM_SUBJECT: &str = "system";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Login,
    Logout,
    LoginFailed,
    DataAccess,
    DataModify,
    Encryption,
    Decryption,
    StateSaved,
    StateLoaded,
    StateRecovered,
    SessionCreated,
    SessionValidated,
    SessionExpired,
    SessionEnded,
    RateLimited,
    CertificateIssued,
    AnomalyDetected,
    HealthCheck,
    RetentionPurge,
    AuditVerified,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Logout => "logout",
            Self::LoginFailed => "login_failed",
            Self::DataAccess => "data_access",
            Self::DataModify => "data_modify",
            Self::Encryption => "encryption",
            Self::Decryption => "decryption",
            Self::StateSaved => "state_saved",
            Self::StateLoaded => "state_loaded",
            Self::StateRecovered => "state_recovered",
            Self::SessionCreated => "session_created",
            Self::SessionValidated => "session_validated",
            Self::SessionExpired => "session_expired",
            Self::SessionEnded => "session_ended",
            Self::RateLimited => "rate_limited",
            Self::CertificateIssued => "certificate_issued",
            Self::AnomalyDetected => "anomaly_detected",
            Self::HealthCheck => "health_check",
            Self::RetentionPurge => "retention_purge",
            Self::AuditVerified => "audit_verified",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sealed, checksummed audit record. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub subject_id: String,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub origin: String,
    pub checksum: String,
    pub details: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl AuditEvent {
    /// Recompute the checksum and compare in constant time.
    pub fn verify(&self, key: &AuditKey) -> bool {
        let Ok(expected) = hex::decode(&self.checksum) else {
            return false;
        };
        let Ok(mut mac) = keyed_mac(key) else {
            return false;
        };
        feed(&mut mac, &self.subject_id, self.action, &self.details, &self.origin);
        mac.verify_slice(&expected).is_ok()
    }

    /// Whether the event records a refused or failed attempt.
    pub fn is_failure(&self) -> bool {
        self.metadata.get("success").is_some_and(|v| v == "false")
    }
}

/// An unsealed event as the caller describes it. Sanitized and checksummed
/// by [`AuditDraft::seal`].
#[derive(Debug, Clone)]
pub struct AuditDraft {
    subject_id: String,
    action: AuditAction,
    details: String,
    session_id: Option<String>,
    origin: Option<String>,
    severity: Severity,
    metadata: BTreeMap<String, String>,
}

impl AuditDraft {
    pub fn new(subject_id: impl Into<String>, action: AuditAction) -> Self {
        Self {
            subject_id: subject_id.into(),
            action,
            details: String::new(),
            session_id: None,
            origin: None,
            severity: Severity::Low,
            metadata: BTreeMap::new(),
        }
    }

    pub fn system(action: AuditAction) -> Self {
        Self::new(SYSTEM_SUBJECT, action)
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn session(mut self, session_id: Option<&str>) -> Self {
        self.session_id = session_id.map(str::to_string);
        self
    }

    pub fn origin(mut self, origin: Option<&str>) -> Self {
        self.origin = origin.map(str::to_string);
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    /// Mark the attempt as failed with the error that refused it.
    /// Raises severity to at least `medium`.
    pub fn failed(mut self, err: &SecurityError) -> Self {
        self.details = if self.details.is_empty() {
            format!("failed: {}", err)
        } else {
            format!("{} failed: {}", self.details, err)
        };
        self.severity = self.severity.max(Severity::Medium);
        self.metadata.insert("success".into(), "false".into());
        self.metadata.insert("error".into(), err.kind().into());
        self
    }

    pub fn action(&self) -> AuditAction {
        self.action
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// Sanitize every field and compute the checksum.
    pub fn seal(self, key: &AuditKey, timestamp: DateTime<Utc>) -> Result<AuditEvent> {
        let mut subject_id = sanitize_field(&self.subject_id, MAX_SUBJECT_LEN);
        if subject_id.is_empty() {
            subject_id = ANONYMOUS_SUBJECT.to_string();
        }
        let session_id = self
            .session_id
            .map(|s| sanitize_field(&s, MAX_SESSION_ID_LEN))
            .filter(|s| !s.is_empty());
        let origin = normalize_origin(self.origin.as_deref());
        let details = sanitize_details(&self.details);
        let metadata = self
            .metadata
            .into_iter()
            .map(|(k, v)| {
                (
                    sanitize_field(&k, MAX_SUBJECT_LEN),
                    sanitize_field(&v, MAX_METADATA_VALUE_LEN),
                )
            })
            .filter(|(k, _)| !k.is_empty())
            .collect();

        let checksum = compute_checksum(key, &subject_id, self.action, &details, &origin)?;

        Ok(AuditEvent {
            timestamp,
            severity: self.severity,
            subject_id,
            action: self.action,
            session_id,
            origin,
            checksum,
            details,
            metadata,
        })
    }
}

/// Hex-encoded HMAC-SHA256 over the integrity-bearing fields.
pub fn compute_checksum(
    key: &AuditKey,
    subject_id: &str,
    action: AuditAction,
    details: &str,
    origin: &str,
) -> Result<String> {
    let mut mac = keyed_mac(key)?;
    feed(&mut mac, subject_id, action, details, origin);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn keyed_mac(key: &AuditKey) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|_| SecurityError::Audit("audit key rejected by HMAC".into()))
}

fn feed(mac: &mut HmacSha256, subject_id: &str, action: AuditAction, details: &str, origin: &str) {
    let mut sep = [0u8; 4];
    let sep = FIELD_SEPARATOR.encode_utf8(&mut sep).as_bytes();
    mac.update(subject_id.as_bytes());
    mac.update(sep);
    mac.update(action.as_str().as_bytes());
    mac.update(sep);
    mac.update(details.as_bytes());
    mac.update(sep);
    mac.update(origin.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testing::cipher;

    fn sealed() -> AuditEvent {
        AuditDraft::new("user123", AuditAction::DataAccess)
            .details("Accessed patient record")
            .session(Some("session-abc"))
            .origin(Some("192.168.1.1"))
            .severity(Severity::Medium)
            .meta("record", "MRN-1")
            .seal(&cipher().audit_key(), Utc::now())
            .unwrap()
    }

    #[test]
    fn sealed_event_verifies() {
        let event = sealed();
        assert_eq!(event.checksum.len(), 64);
        assert!(event.verify(&cipher().audit_key()));
    }

    #[test]
    fn mutating_any_checksummed_field_is_detected() {
        let key = cipher().audit_key();
        let base = sealed();

        let mut e = base.clone();
        e.subject_id = "user124".into();
        assert!(!e.verify(&key));

        let mut e = base.clone();
        e.action = AuditAction::DataModify;
        assert!(!e.verify(&key));

        let mut e = base.clone();
        e.details.push('!');
        assert!(!e.verify(&key));

        let mut e = base.clone();
        e.origin = "10.0.0.1".into();
        assert!(!e.verify(&key));

        let mut e = base;
        e.checksum = "zz".into();
        assert!(!e.verify(&key));
    }

    #[test]
    fn fields_are_sanitized_before_checksumming() {
        let event = AuditDraft::new("  \u{7}evil\u{1f}user ", AuditAction::Login)
            .details("<script>alert(1)</script>")
            .origin(Some("not-an-ip"))
            .seal(&cipher().audit_key(), Utc::now())
            .unwrap();

        assert_eq!(event.subject_id, "eviluser");
        assert_eq!(event.origin, "0.0.0.0");
        assert!(event.details.contains("&lt;script&gt;"));
        assert!(event.verify(&cipher().audit_key()));
    }

    #[test]
    fn blank_subject_becomes_anonymous() {
        let event = AuditDraft::new("   ", AuditAction::LoginFailed)
            .seal(&cipher().audit_key(), Utc::now())
            .unwrap();
        assert_eq!(event.subject_id, ANONYMOUS_SUBJECT);
    }

    #[test]
    fn failed_attempts_are_marked() {
        let err = SecurityError::validation("bad input");
        let event = AuditDraft::new("user123", AuditAction::Encryption)
            .failed(&err)
            .seal(&cipher().audit_key(), Utc::now())
            .unwrap();

        assert!(event.is_failure());
        assert_eq!(event.severity, Severity::Medium);
        assert_eq!(event.metadata.get("error").map(String::as_str), Some("validation_error"));
        assert!(event.details.starts_with("failed:"));
    }

    #[test]
    fn line_format_uses_snake_case() {
        let json = serde_json::to_string(&sealed()).unwrap();
        assert!(json.contains("\"data_access\""));
        assert!(json.contains("\"severity\":\"medium\""));
        assert!(json.contains("\"session_id\":\"session-abc\""));

        let without_session = AuditDraft::system(AuditAction::HealthCheck)
            .seal(&cipher().audit_key(), Utc::now())
            .unwrap();
        let json = serde_json::to_string(&without_session).unwrap();
        assert!(!json.contains("session_id"));
        assert!(!json.contains("metadata"));
    }
}
