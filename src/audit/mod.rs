//! Tamper-evident audit trail.
//!
//! Events are HMAC-checksummed with the audit key, written to a durable store
//! behind a circuit breaker, and appended to a size-rotated JSONL file that
//! keeps working when the store is down.

mod event;
mod file_log;
mod report;
mod store;
mod writer;

pub use event::{
    ANONYMOUS_SUBJECT, AuditAction, AuditDraft, AuditEvent, SYSTEM_SUBJECT, Severity,
    compute_checksum,
};
pub use file_log::{AUDIT_FILENAME, AuditLine, RotatingFileLog, Verification};
pub use report::AuditReport;
pub use store::{AuditStore, SqliteAuditStore};
pub use writer::{AuditLogWriter, AuditSink};

#[cfg(test)]
pub(crate) use writer::MockAuditSink;
