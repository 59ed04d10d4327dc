//! Security facade: the single entry point the application calls.
//!
//! Every operation follows the same path: validate the caller, take an
//! admission decision, do the work, audit the outcome (success or failure),
//! then let the anomaly detector observe it. Audit events never carry
//! plaintext, secrets or session tokens.

mod health;

pub use health::{HealthChecks, HealthReport, HealthStatus};

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{error, info};
use zeroize::Zeroizing;

use crate::audit::{
    ANONYMOUS_SUBJECT, AuditAction, AuditDraft, AuditEvent, AuditLogWriter, AuditReport,
    AuditSink, SYSTEM_SUBJECT, Severity, Verification,
};
use crate::config::Config;
use crate::context::SecurityContext;
use crate::crypto::{CipherManager, EnvelopeCodec, Metadata, Opened, Sealer};
use crate::error::{Result, SecurityError};
use crate::monitor::AnomalyDetector;
use crate::resilience::{Admission, BreakerState, Operation, RateLimiter};
use crate::session::{SessionRegistry, SessionStatus, session_ref};
use crate::storage::AtomicStore;
use crate::validation::{MAX_SUBJECT_LEN, validate_identifier, validate_logical_name};

/// Envelope metadata key binding a sealed state file to its logical name.
const STATE_FILE_KEY: &str = "file";

const HEALTH_PROBE: &[u8] = b"phiguard health probe";

/// Who is acting. The session is kept only as a reference, never the token.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    pub subject_id: String,
    pub session_ref: Option<String>,
    pub origin: Option<String>,
}

impl Caller {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            ..Self::default()
        }
    }

    pub fn system() -> Self {
        Self::new(SYSTEM_SUBJECT)
    }

    pub fn with_session(mut self, token: &str) -> Self {
        self.session_ref = Some(session_ref(token));
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

pub struct SecurityCore {
    ctx: SecurityContext,
    codec: EnvelopeCodec,
    audit: Arc<AuditLogWriter>,
    limiter: RateLimiter,
    sessions: SessionRegistry,
    anomaly: AnomalyDetector,
    store: AtomicStore,
}

impl SecurityCore {
    /// Derive the keys and open every component. Runs the KDF once.
    pub fn new(ctx: SecurityContext) -> Result<Self> {
        let cipher = CipherManager::from_settings(&ctx.settings().crypto)?;
        Self::with_cipher(ctx, cipher)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(SecurityContext::from_config(config)?)
    }

    /// Build on an already derived cipher.
    pub fn with_cipher(ctx: SecurityContext, cipher: CipherManager) -> Result<Self> {
        let settings = ctx.settings();
        let clock = Arc::clone(ctx.clock());

        let audit = Arc::new(AuditLogWriter::from_context(&ctx, cipher.audit_key())?);
        let sink: Arc<dyn AuditSink> = audit.clone();

        let store = AtomicStore::open(&settings.storage, Arc::clone(&clock), Arc::clone(&sink))?;
        let limiter = RateLimiter::new(settings.rate_limits.clone(), Arc::clone(&clock));
        let sessions = SessionRegistry::new(settings.session_timeout, Arc::clone(&clock));
        let anomaly = AnomalyDetector::new(settings.anomaly.clone(), clock, sink);
        let codec = EnvelopeCodec::from_context(&ctx, cipher);

        info!(
            "Security core ready (envelope {}, audit store {})",
            codec.version(),
            if audit.has_store() { "enabled" } else { "disabled" }
        );

        Ok(Self {
            ctx,
            codec,
            audit,
            limiter,
            sessions,
            anomaly,
            store,
        })
    }

    pub fn context(&self) -> &SecurityContext {
        &self.ctx
    }

    /// Direct admission decisions for work the core does not perform itself.
    /// Probes made here are not audited.
    pub fn admission(&self) -> &dyn Admission {
        &self.limiter
    }

    pub fn store(&self) -> &AtomicStore {
        &self.store
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.audit.breaker_state()
    }

    // ── Field encryption ──

    pub fn seal(&self, caller: &Caller, plaintext: &str, metadata: Metadata) -> Result<String> {
        self.run(caller, AuditAction::Encryption, Some(Operation::Encryption), |_| {
            let token = self.codec.seal(plaintext, metadata)?;
            Ok((token, format!("sealed {} bytes", plaintext.len())))
        })
    }

    pub fn open(&self, caller: &Caller, token: &str) -> Result<Opened> {
        self.run(caller, AuditAction::Decryption, Some(Operation::Decryption), |_| {
            let opened = self.codec.open(token)?;
            let details = format!(
                "opened {} bytes sealed under {}",
                opened.plaintext.len(),
                opened.version
            );
            Ok((opened, details))
        })
    }

    // ── Persisted state ──

    /// Serialize, seal and atomically write `value` as `name`.
    pub fn save_state<T: Serialize>(&self, caller: &Caller, name: &str, value: &T) -> Result<()> {
        self.run(caller, AuditAction::StateSaved, Some(Operation::StateWrite), |_| {
            validate_logical_name(name)?;
            let json = Zeroizing::new(serde_json::to_vec(value).map_err(|e| {
                SecurityError::Storage(format!("failed to serialize {}: {}", name, e))
            })?);

            let mut metadata = Metadata::new();
            metadata.insert(STATE_FILE_KEY.into(), name.into());
            let token = self.codec.seal_bytes(&json, metadata)?;

            self.store.write_bytes(name, token.as_bytes())?;
            Ok(((), format!("saved {}", name)))
        })
    }

    /// Read, open and decode `name`. A missing file yields `default`; a file
    /// that cannot be opened is preserved for review and `default` is
    /// returned.
    pub fn load_state<T: DeserializeOwned>(
        &self,
        caller: &Caller,
        name: &str,
        default: T,
    ) -> Result<T> {
        self.run(caller, AuditAction::StateLoaded, Some(Operation::Decryption), |_| {
            let value = self
                .store
                .read_with(name, default, |bytes| self.decode_state(name, bytes))?;
            Ok((value, format!("loaded {}", name)))
        })
    }

    fn decode_state<T: DeserializeOwned>(&self, name: &str, bytes: &[u8]) -> Result<T> {
        let corrupt = |reason: String| SecurityError::Corruption {
            path: self.store.data_dir().join(name),
            reason,
        };

        let token = std::str::from_utf8(bytes)
            .map_err(|_| corrupt("not a sealed envelope".to_string()))?;
        let opened = self.codec.open_bytes(token.trim())?;

        let owner = opened
            .metadata
            .get(STATE_FILE_KEY)
            .and_then(serde_json::Value::as_str);
        if owner != Some(name) {
            return Err(corrupt(format!(
                "envelope belongs to {}",
                owner.unwrap_or("an unnamed file")
            )));
        }

        serde_json::from_slice(&opened.plaintext).map_err(|e| corrupt(e.to_string()))
    }

    // ── Audit ──

    /// Record an application-level action on behalf of `caller`.
    pub fn log_action(
        &self,
        caller: &Caller,
        action: AuditAction,
        severity: Severity,
        details: &str,
    ) -> Result<AuditEvent> {
        let subject = self.admit(caller, action, Some(Operation::AuditWrite))?;
        let event = self.audit.append(
            self.draft(caller, &subject, action)
                .severity(severity)
                .details(details),
        )?;
        self.anomaly.observe(&subject, action);
        Ok(event)
    }

    /// Most recent events from the rotating file set, oldest first.
    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let result = self.audit.recent(limit);
        self.record_system(AuditAction::DataAccess, result, |events| {
            (Severity::Low, format!("read {} audit events", events.len()))
        })
    }

    pub fn verify_audit_log(&self) -> Result<Verification> {
        let result = self.audit.verify();
        self.record_system(AuditAction::AuditVerified, result, |v| {
            let severity = if v.is_intact() {
                Severity::Low
            } else {
                Severity::High
            };
            (
                severity,
                format!("{} lines checked, {} tampered", v.total, v.tampered.len()),
            )
        })
    }

    pub fn audit_report(&self) -> Result<AuditReport> {
        let result = self.audit.report();
        self.record_system(AuditAction::DataAccess, result, |r| {
            (
                Severity::Low,
                format!("audit report over {} events", r.total_events),
            )
        })
    }

    /// Delete backing-store events older than the retention window.
    pub fn purge_expired_audit(&self) -> Result<usize> {
        let retention = self.ctx.settings().audit.retention;
        let cutoff = self
            .ctx
            .clock()
            .utc()
            .checked_sub_signed(retention)
            .ok_or_else(|| {
                SecurityError::config(format!(
                    "audit retention of {} days reaches before the earliest timestamp",
                    retention.num_days()
                ))
            })?;
        let result = self.audit.purge_store_before(cutoff);
        self.record_system(AuditAction::RetentionPurge, result, |purged| {
            (
                Severity::Medium,
                format!("purged {} events older than {}", purged, cutoff.to_rfc3339()),
            )
        })
    }

    // ── Authentication ──

    /// Count a failed authentication. Refuses once the subject is locked out.
    pub fn record_failed_auth(&self, caller: &Caller) -> Result<()> {
        let subject = self.admit(caller, AuditAction::LoginFailed, None)?;

        let outcome = self.limiter.check(Operation::FailedAuth, &subject);
        let draft = self.draft(caller, &subject, AuditAction::LoginFailed);
        let draft = match outcome {
            Ok(()) => draft
                .severity(Severity::Medium)
                .details("authentication failed")
                .meta("success", false)
                .meta(
                    "attempts_remaining",
                    self.limiter.remaining(Operation::FailedAuth, &subject),
                ),
            Err(ref e) => draft
                .severity(Severity::High)
                .details("authentication locked out")
                .failed(e),
        };

        self.audit.append(draft)?;
        self.anomaly.observe(&subject, AuditAction::LoginFailed);
        outcome
    }

    /// Admission for issuing a completion certificate.
    pub fn authorize_certificate(&self, caller: &Caller, details: &str) -> Result<()> {
        self.run(
            caller,
            AuditAction::CertificateIssued,
            Some(Operation::CertificateIssuance),
            |_| Ok(((), details.to_string())),
        )
    }

    // ── Sessions ──

    pub fn create_session(&self, caller: &Caller) -> Result<String> {
        let subject = self.admit(caller, AuditAction::SessionCreated, None)?;
        let token = self.sessions.create(&subject);

        let draft = AuditDraft::new(subject.as_str(), AuditAction::SessionCreated)
            .session(Some(&session_ref(&token)))
            .origin(caller.origin.as_deref())
            .details(format!(
                "session created, expires after {}s",
                self.sessions.timeout().as_secs()
            ));
        if let Err(e) = self.audit.append(draft) {
            // An unattributable session must not be handed out
            self.sessions.end(&token);
            return Err(e);
        }

        self.anomaly.observe(&subject, AuditAction::SessionCreated);
        Ok(token)
    }

    /// Check a token, evicting it if it has expired.
    pub fn validate_session(&self, token: &str) -> Result<SessionStatus> {
        let status = self.sessions.status(token);
        let reference = session_ref(token);

        let draft = match status {
            SessionStatus::Valid { ref subject_id } => {
                AuditDraft::new(subject_id.as_str(), AuditAction::SessionValidated)
                    .details("session valid")
            }
            SessionStatus::Expired { ref subject_id } => {
                AuditDraft::new(subject_id.as_str(), AuditAction::SessionExpired)
                    .severity(Severity::Medium)
                    .details(format!(
                        "session expired after {}s",
                        self.sessions.timeout().as_secs()
                    ))
            }
            SessionStatus::Unknown => {
                AuditDraft::new(ANONYMOUS_SUBJECT, AuditAction::SessionValidated)
                    .details("session check")
                    .failed(&SecurityError::validation("unknown session"))
            }
        };
        let draft = draft.session(Some(&reference));
        let action = draft.action();

        self.audit.append(draft)?;
        if let SessionStatus::Valid { ref subject_id } | SessionStatus::Expired { ref subject_id } =
            status
        {
            self.anomaly.observe(subject_id, action);
        }
        Ok(status)
    }

    /// Explicit logout. Returns whether the token was live.
    pub fn end_session(&self, token: &str) -> Result<bool> {
        let reference = session_ref(token);
        let ended = self.sessions.end(token);

        let draft = match ended {
            Some(ref subject_id) => {
                AuditDraft::new(subject_id.as_str(), AuditAction::SessionEnded).details("logout")
            }
            None => AuditDraft::new(ANONYMOUS_SUBJECT, AuditAction::SessionEnded)
                .details("logout")
                .failed(&SecurityError::validation("unknown session")),
        };
        self.audit.append(draft.session(Some(&reference)))?;

        if let Some(ref subject_id) = ended {
            self.anomaly.observe(subject_id, AuditAction::SessionEnded);
        }
        Ok(ended.is_some())
    }

    // ── Health ──

    /// Probe every dependency. Never fails on a sick dependency; that is
    /// what the report is for.
    pub fn health_check(&self) -> HealthReport {
        let encryption = self
            .codec
            .seal_bytes(HEALTH_PROBE, Metadata::new())
            .and_then(|token| self.codec.open_bytes(&token))
            .is_ok_and(|opened| opened.plaintext == HEALTH_PROBE);

        let checks = HealthChecks {
            encryption,
            database: self.audit.store_healthy(),
            audit_file: self.audit.file_writable(),
            circuit_breaker: self.audit.breaker_state(),
        };
        let report = HealthReport::new(self.ctx.clock().utc(), checks);

        let severity = match report.overall_status {
            HealthStatus::Healthy => Severity::Low,
            HealthStatus::Degraded => Severity::Medium,
            HealthStatus::Unhealthy => Severity::High,
        };
        let draft = AuditDraft::system(AuditAction::HealthCheck)
            .severity(severity)
            .details(format!("overall {}", report.overall_status))
            .meta("status", report.overall_status);
        if let Err(e) = self.audit.append(draft) {
            error!("Health check could not be audited: {}", e);
        }

        report
    }

    // ── Internals ──

    fn draft(&self, caller: &Caller, subject: &str, action: AuditAction) -> AuditDraft {
        AuditDraft::new(subject, action)
            .session(caller.session_ref.as_deref())
            .origin(caller.origin.as_deref())
    }

    /// Validate the caller and, if `limit` is set, take an admission
    /// decision. Refusals are audited before they are returned.
    fn admit(
        &self,
        caller: &Caller,
        action: AuditAction,
        limit: Option<Operation>,
    ) -> Result<String> {
        let subject = match validate_identifier(&caller.subject_id, "subject_id", MAX_SUBJECT_LEN)
        {
            Ok(subject) => subject,
            Err(e) => {
                let draft = self
                    .draft(caller, &caller.subject_id, action)
                    .details(action.as_str());
                return Err(self.record_failure(draft, e));
            }
        };

        if let Some(operation) = limit
            && let Err(e) = self.limiter.check(operation, &subject)
        {
            let draft = self
                .draft(caller, &subject, AuditAction::RateLimited)
                .details(action.as_str())
                .meta("operation", operation);
            let err = self.record_failure(draft, e);
            self.anomaly.observe(&subject, AuditAction::RateLimited);
            return Err(err);
        }

        Ok(subject)
    }

    /// Admit, run `op`, and audit the outcome under `action`. `op` returns
    /// the value and the details recorded on success.
    fn run<T>(
        &self,
        caller: &Caller,
        action: AuditAction,
        limit: Option<Operation>,
        op: impl FnOnce(&str) -> Result<(T, String)>,
    ) -> Result<T> {
        let subject = self.admit(caller, action, limit)?;

        match op(&subject) {
            Ok((value, details)) => {
                let appended = self
                    .audit
                    .append(self.draft(caller, &subject, action).details(details));
                self.anomaly.observe(&subject, action);
                appended?;
                Ok(value)
            }
            Err(e) => {
                let draft = self.draft(caller, &subject, action).details(action.as_str());
                let err = self.record_failure(draft, e);
                self.anomaly.observe(&subject, action);
                Err(err)
            }
        }
    }

    /// Audit a failed attempt and hand back the error that caused it.
    fn record_failure(&self, draft: AuditDraft, err: SecurityError) -> SecurityError {
        let action = draft.action();
        if let Err(audit_err) = self.audit.append(draft.failed(&err)) {
            error!("Failed {} could not be audited: {}", action, audit_err);
        }
        err
    }

    fn record_system<T>(
        &self,
        action: AuditAction,
        result: Result<T>,
        describe: impl FnOnce(&T) -> (Severity, String),
    ) -> Result<T> {
        match result {
            Ok(value) => {
                let (severity, details) = describe(&value);
                self.audit.append(
                    AuditDraft::system(action)
                        .severity(severity)
                        .details(details),
                )?;
                Ok(value)
            }
            Err(e) => {
                let draft = AuditDraft::system(action).details(action.as_str());
                Err(self.record_failure(draft, e))
            }
        }
    }
}

impl std::fmt::Debug for SecurityCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityCore")
            .field("envelope_version", &self.codec.version())
            .field("audit", &self.audit)
            .field("store", &self.store)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AUDIT_FILENAME;
    use crate::clock::{Clock, ManualClock, SystemClock};
    use crate::config::SecuritySettings;
    use crate::crypto::testing::{TEST_SALT_HEX, TEST_SECRET, cipher};
    use crate::paths::Paths;
    use serde::Deserialize;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    fn settings(dir: &Path) -> SecuritySettings {
        let mut config = Config {
            paths: Paths {
                config_dir: dir.join("config"),
                data_dir: dir.join("data"),
                state_dir: dir.join("state"),
                runtime_dir: None,
            },
            ..Config::default()
        };
        config.crypto.secret = String::from_utf8(TEST_SECRET.to_vec()).unwrap();
        config.crypto.salt = TEST_SALT_HEX.to_string();
        SecuritySettings::from_config(&config).unwrap()
    }

    fn core_with(
        dir: &Path,
        clock: Arc<dyn Clock>,
        tweak: impl FnOnce(&mut SecuritySettings),
    ) -> SecurityCore {
        let mut s = settings(dir);
        tweak(&mut s);
        SecurityCore::with_cipher(SecurityContext::with_clock(s, clock), cipher()).unwrap()
    }

    fn core(dir: &Path) -> SecurityCore {
        core_with(dir, Arc::new(SystemClock), |_| {})
    }

    fn events(core: &SecurityCore) -> Vec<AuditEvent> {
        core.audit.recent(usize::MAX).unwrap()
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Progress {
        completed: Vec<String>,
        score: u32,
    }

    #[test]
    fn seal_and_open_are_audited_without_plaintext() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core(tmp.path());
        let caller = Caller::new("user123").with_origin("192.168.1.10");

        let token = core
            .seal(&caller, "patient: J. Doe, DOB 1980-01-01", Metadata::new())
            .unwrap();
        let opened = core.open(&caller, &token).unwrap();
        assert_eq!(opened.text().unwrap(), "patient: J. Doe, DOB 1980-01-01");

        let events = events(&core);
        let actions: Vec<AuditAction> = events.iter().map(|e| e.action).collect();
        assert_eq!(actions, [AuditAction::Encryption, AuditAction::Decryption]);
        for event in &events {
            assert_eq!(event.subject_id, "user123");
            assert_eq!(event.origin, "192.168.1.10");
            assert!(!event.details.contains("J. Doe"));
        }
        assert!(core.verify_audit_log().unwrap().is_intact());
    }

    #[test]
    fn invalid_subject_is_refused_and_still_audited() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core(tmp.path());

        let err = core
            .seal(&Caller::new("bad subject!"), "data", Metadata::new())
            .unwrap_err();
        assert!(matches!(err, SecurityError::Validation(_)));

        let events = events(&core);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, AuditAction::Encryption);
        assert!(events[0].is_failure());
        assert_eq!(events[0].metadata["error"], "validation_error");
    }

    #[test]
    fn failed_operation_is_audited_as_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core(tmp.path());

        let err = core
            .open(&Caller::new("user123"), "invalid-encrypted-data")
            .unwrap_err();
        assert!(matches!(err, SecurityError::Encryption(_)));

        let last = events(&core).pop().unwrap();
        assert_eq!(last.action, AuditAction::Decryption);
        assert!(last.is_failure());
        assert_eq!(last.severity, Severity::Medium);
    }

    #[test]
    fn rate_limit_refusal_is_audited() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core_with(tmp.path(), Arc::new(ManualClock::new()), |s| {
            s.rate_limits.encryption = 2;
        });
        let caller = Caller::new("user123");

        core.seal(&caller, "a", Metadata::new()).unwrap();
        core.seal(&caller, "b", Metadata::new()).unwrap();
        let err = core.seal(&caller, "c", Metadata::new()).unwrap_err();
        assert!(matches!(err, SecurityError::RateLimitExceeded { .. }));

        let last = events(&core).pop().unwrap();
        assert_eq!(last.action, AuditAction::RateLimited);
        assert_eq!(last.metadata["operation"], "encryption");
        assert!(last.is_failure());
    }

    #[test]
    fn failed_auth_locks_out_after_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new());
        let core = core_with(tmp.path(), clock.clone(), |_| {});
        let caller = Caller::new("user123");

        for _ in 0..5 {
            core.record_failed_auth(&caller).unwrap();
        }
        let err = core.record_failed_auth(&caller).unwrap_err();
        assert!(matches!(err, SecurityError::RateLimitExceeded { .. }));

        let events = events(&core);
        assert_eq!(events.len(), 6);
        assert!(events.iter().all(|e| e.action == AuditAction::LoginFailed));
        assert!(events.iter().all(|e| e.is_failure()));
        assert_eq!(events[4].metadata["attempts_remaining"], "0");
        assert_eq!(events[5].severity, Severity::High);

        clock.advance(Duration::from_secs(61));
        core.record_failed_auth(&caller).unwrap();
    }

    #[test]
    fn state_roundtrip_is_encrypted_at_rest() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core(tmp.path());
        let caller = Caller::new("user123");
        let progress = Progress {
            completed: vec!["privacy-rule".into()],
            score: 90,
        };

        core.save_state(&caller, "progress.json", &progress).unwrap();
        let on_disk = fs::read_to_string(core.store().path_for("progress.json").unwrap()).unwrap();
        assert!(!on_disk.contains("privacy-rule"));

        let loaded: Progress = core
            .load_state(&caller, "progress.json", Progress::default())
            .unwrap();
        assert_eq!(loaded, progress);

        let missing: Progress = core
            .load_state(&caller, "checklist.json", Progress::default())
            .unwrap();
        assert_eq!(missing, Progress::default());
    }

    #[test]
    fn corrupt_state_recovers_to_default() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core(tmp.path());
        let caller = Caller::new("user123");

        fs::write(core.store().path_for("progress.json").unwrap(), "{not sealed").unwrap();
        let loaded: Progress = core
            .load_state(&caller, "progress.json", Progress::default())
            .unwrap();
        assert_eq!(loaded, Progress::default());

        let preserved: Vec<_> = fs::read_dir(core.store().backup_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.ends_with(".corrupt"))
            .collect();
        assert_eq!(preserved.len(), 1);

        let actions: Vec<AuditAction> = events(&core).iter().map(|e| e.action).collect();
        assert_eq!(actions, [AuditAction::StateRecovered, AuditAction::StateLoaded]);
    }

    #[test]
    fn state_sealed_for_another_file_is_not_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core(tmp.path());
        let caller = Caller::new("user123");
        let progress = Progress {
            completed: vec![],
            score: 100,
        };

        core.save_state(&caller, "a.json", &progress).unwrap();
        fs::copy(
            core.store().path_for("a.json").unwrap(),
            core.store().path_for("b.json").unwrap(),
        )
        .unwrap();

        let loaded: Progress = core
            .load_state(&caller, "b.json", Progress::default())
            .unwrap();
        assert_eq!(loaded, Progress::default());
    }

    #[test]
    fn session_lifecycle_is_audited() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new());
        let core = core_with(tmp.path(), clock.clone(), |_| {});

        let token = core.create_session(&Caller::new("user123")).unwrap();
        assert!(core.validate_session(&token).unwrap().is_valid());

        clock.advance(Duration::from_secs(30 * 60 + 1));
        assert_eq!(
            core.validate_session(&token).unwrap(),
            SessionStatus::Expired {
                subject_id: "user123".into()
            }
        );
        assert!(!core.end_session(&token).unwrap());

        let events = events(&core);
        let actions: Vec<AuditAction> = events.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            [
                AuditAction::SessionCreated,
                AuditAction::SessionValidated,
                AuditAction::SessionExpired,
                AuditAction::SessionEnded,
            ]
        );
        let reference = session_ref(&token);
        for event in &events {
            assert_eq!(event.session_id.as_deref(), Some(reference.as_str()));
        }
        let log =
            fs::read_to_string(core.ctx.settings().audit.log_dir.join(AUDIT_FILENAME)).unwrap();
        assert!(!log.contains(&token));
    }

    #[test]
    fn explicit_logout_ends_the_session() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core(tmp.path());

        let token = core.create_session(&Caller::new("user123")).unwrap();
        assert!(core.end_session(&token).unwrap());
        assert_eq!(core.validate_session(&token).unwrap(), SessionStatus::Unknown);

        let last = events(&core).pop().unwrap();
        assert_eq!(last.subject_id, ANONYMOUS_SUBJECT);
        assert!(last.is_failure());
    }

    #[test]
    fn certificate_issuance_is_rate_limited() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core_with(tmp.path(), Arc::new(ManualClock::new()), |s| {
            s.rate_limits.certificate_issuance = 1;
        });
        let caller = Caller::new("user123");

        core.authorize_certificate(&caller, "HIPAA basics").unwrap();
        assert!(matches!(
            core.authorize_certificate(&caller, "HIPAA basics"),
            Err(SecurityError::RateLimitExceeded { .. })
        ));
        assert_eq!(events(&core)[0].action, AuditAction::CertificateIssued);
    }

    #[test]
    fn repeated_actions_raise_an_anomaly() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core_with(tmp.path(), Arc::new(ManualClock::new()), |s| {
            s.anomaly.threshold = 3;
            s.anomaly.window_capacity = 10;
        });
        let caller = Caller::new("user123");

        for _ in 0..4 {
            core.log_action(&caller, AuditAction::DataAccess, Severity::Low, "viewed record")
                .unwrap();
        }

        let anomalies: Vec<AuditEvent> = events(&core)
            .into_iter()
            .filter(|e| e.action == AuditAction::AnomalyDetected)
            .collect();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].severity, Severity::Critical);
        assert_eq!(anomalies[0].metadata["observed_action"], "data_access");
    }

    #[test]
    fn anomaly_is_logged_after_the_action_that_triggered_it() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core_with(tmp.path(), Arc::new(ManualClock::new()), |s| {
            s.anomaly.threshold = 2;
            s.anomaly.window_capacity = 10;
        });
        let caller = Caller::new("user123");

        for _ in 0..3 {
            core.seal(&caller, "note", Metadata::new()).unwrap();
        }

        let actions: Vec<AuditAction> = events(&core).into_iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::Encryption,
                AuditAction::Encryption,
                AuditAction::Encryption,
                AuditAction::AnomalyDetected,
            ]
        );
    }

    #[test]
    fn retention_beyond_the_calendar_is_an_error_not_a_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core_with(tmp.path(), Arc::new(SystemClock), |s| {
            s.audit.retention = chrono::Duration::days(100_000_000);
        });
        assert!(matches!(
            core.purge_expired_audit(),
            Err(SecurityError::Config(_))
        ));
    }

    #[test]
    fn health_check_reports_each_dependency() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core(tmp.path());

        let report = core.health_check();
        assert!(report.checks.encryption);
        assert_eq!(report.checks.database, Some(true));
        assert!(report.checks.audit_file);
        assert_eq!(report.checks.circuit_breaker, BreakerState::Closed);
        assert_eq!(report.overall_status, HealthStatus::Healthy);
        assert_eq!(events(&core).pop().unwrap().action, AuditAction::HealthCheck);
    }

    #[test]
    fn file_only_deployment_is_healthy_without_a_store() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core_with(tmp.path(), Arc::new(SystemClock), |s| {
            s.audit.database = None;
        });

        let report = core.health_check();
        assert_eq!(report.checks.database, None);
        assert_eq!(report.overall_status, HealthStatus::Healthy);
        assert_eq!(core.purge_expired_audit().unwrap(), 0);
    }

    #[test]
    fn purge_removes_events_past_retention() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new());
        let core = core_with(tmp.path(), clock.clone(), |s| {
            s.audit.retention = chrono::Duration::days(1);
        });
        let caller = Caller::new("user123");

        core.log_action(&caller, AuditAction::Login, Severity::Low, "signed in")
            .unwrap();
        core.log_action(&caller, AuditAction::Logout, Severity::Low, "signed out")
            .unwrap();

        assert_eq!(core.purge_expired_audit().unwrap(), 0);
        clock.advance(Duration::from_secs(2 * 24 * 60 * 60));
        // The two actions plus the first purge's own event
        assert_eq!(core.purge_expired_audit().unwrap(), 3);

        let last = events(&core).pop().unwrap();
        assert_eq!(last.action, AuditAction::RetentionPurge);
        assert!(last.details.contains("purged 3"));
    }

    #[test]
    fn tampered_audit_line_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core(tmp.path());
        let caller = Caller::new("user123");
        core.log_action(&caller, AuditAction::DataAccess, Severity::Low, "viewed record")
            .unwrap();
        core.log_action(&caller, AuditAction::DataModify, Severity::Low, "edited record")
            .unwrap();

        let path = core.ctx.settings().audit.log_dir.join(AUDIT_FILENAME);
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replacen("edited record", "deleted record", 1)).unwrap();

        let verification = core.verify_audit_log().unwrap();
        assert_eq!(verification.total, 2);
        assert_eq!(verification.tampered, vec![1]);

        let last = events(&core).pop().unwrap();
        assert_eq!(last.action, AuditAction::AuditVerified);
        assert_eq!(last.severity, Severity::High);

        let report = core.audit_report().unwrap();
        assert_eq!(report.tampered, vec![1]);
    }
}
