//! Audit Log Writer: the single entry point for recording audit events.
//!
//! Every event is sanitized and checksummed, sent to the backing store
//! through the circuit breaker, and independently appended to the rotating
//! file. Either path succeeding is enough; only when both fail does the
//! caller see `SecurityError::Audit`.

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::event::{AuditDraft, AuditEvent, Severity};
use super::file_log::{RotatingFileLog, Verification};
use super::report::AuditReport;
use super::store::{AuditStore, SqliteAuditStore};
use crate::clock::Clock;
use crate::context::SecurityContext;
use crate::crypto::AuditKey;
use crate::error::{Result, SecurityError};
use crate::resilience::{BreakerState, CircuitBreaker, Protected};

/// Anything that can record an audit event.
#[cfg_attr(test, mockall::automock)]
pub trait AuditSink: Send + Sync {
    fn record(&self, draft: AuditDraft) -> Result<AuditEvent>;
}

pub struct AuditLogWriter {
    key: AuditKey,
    file: RotatingFileLog,
    store: Option<Arc<dyn AuditStore>>,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
}

impl AuditLogWriter {
    pub fn new(
        key: AuditKey,
        file: RotatingFileLog,
        store: Option<Arc<dyn AuditStore>>,
        breaker: CircuitBreaker,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key,
            file,
            store,
            breaker,
            clock,
        }
    }

    /// Open the rotating file and, if configured, the SQLite store.
    pub fn from_context(ctx: &SecurityContext, key: AuditKey) -> Result<Self> {
        let settings = ctx.settings();
        let audit = &settings.audit;
        let file = RotatingFileLog::open(&audit.log_dir, audit.max_file_bytes, audit.backup_count)?;

        let store: Option<Arc<dyn AuditStore>> = match audit.database {
            Some(ref db) => match SqliteAuditStore::open(db) {
                Ok(store) => Some(Arc::new(store)),
                // Start degraded; the rotating file keeps the trail
                Err(e) => {
                    error!("Audit store {} unavailable: {}", db.display(), e);
                    None
                }
            },
            None => None,
        };

        let breaker = CircuitBreaker::new("audit_store", &settings.breaker, Arc::clone(ctx.clock()));
        Ok(Self::new(key, file, store, breaker, Arc::clone(ctx.clock())))
    }

    pub fn append(&self, draft: AuditDraft) -> Result<AuditEvent> {
        let event = draft.seal(&self.key, self.clock.utc())?;

        let stored = match self.store {
            Some(ref store) => match self.breaker.call(|| store.insert(&event)) {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!("Audit store write failed ({}): {}", event.action, e);
                    Err(e)
                }
            },
            None => Err(SecurityError::Audit("no backing store configured".into())),
        };

        // Best effort, independent of the store outcome
        let filed = self.file.append(&event).inspect_err(|e| {
            error!("Audit file append failed ({}): {}", event.action, e);
        });

        match (stored, filed) {
            (Err(store_err), Err(file_err)) => {
                error!("Audit event lost: {} by {}", event.action, event.subject_id);
                Err(SecurityError::Audit(format!(
                    "store: {}; file: {}",
                    store_err, file_err
                )))
            }
            _ => {
                if event.severity >= Severity::High {
                    warn!(
                        "Audit [{}] {} by {}: {}",
                        event.severity, event.action, event.subject_id, event.details
                    );
                } else {
                    debug!("Audit {} by {}", event.action, event.subject_id);
                }
                Ok(event)
            }
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Round trip to the backing store, outside the breaker.
    /// `None` when no store is configured.
    pub fn store_healthy(&self) -> Option<bool> {
        self.store.as_ref().map(|store| store.ping().is_ok())
    }

    pub fn file_writable(&self) -> bool {
        self.file.is_writable()
    }

    /// Delete backing-store rows older than `cutoff`, through the breaker.
    pub fn purge_store_before(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<usize> {
        match self.store {
            Some(ref store) => self.breaker.call(|| store.purge_before(cutoff)),
            None => Ok(0),
        }
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let mut events = self.file.read_events()?;
        let skip = events.len().saturating_sub(limit);
        Ok(events.split_off(skip))
    }

    pub fn verify(&self) -> Result<Verification> {
        self.file.verify(&self.key)
    }

    pub fn report(&self) -> Result<AuditReport> {
        let lines = self.file.read_lines()?;
        Ok(AuditReport::build(&lines, &self.key, self.clock.utc()))
    }
}

impl AuditSink for AuditLogWriter {
    fn record(&self, draft: AuditDraft) -> Result<AuditEvent> {
        self.append(draft)
    }
}

impl std::fmt::Debug for AuditLogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogWriter")
            .field("file", &self.file.path())
            .field("store", &self.store.is_some())
            .field("breaker", &self.breaker)
            .finish()
    }
}
