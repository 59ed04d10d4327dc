//! Durable backing store for audit events.
//!
//! The core only needs transactional `INSERT`, a liveness probe, and a
//! retention purge. [`SqliteAuditStore`] is the bundled implementation; any
//! other engine can sit behind [`AuditStore`].

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params};

use super::event::AuditEvent;
use crate::error::{Result, SecurityError};

#[cfg_attr(test, mockall::automock)]
pub trait AuditStore: Send + Sync {
    fn insert(&self, event: &AuditEvent) -> Result<()>;

    /// Cheap round trip used by health checks.
    fn ping(&self) -> Result<()>;

    /// Delete rows older than `cutoff`. Returns the number removed.
    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn count(&self) -> Result<usize>;
}

#[derive(Clone)]
pub struct SqliteAuditStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            crate::paths::create_dir_with_mode(parent)?;
        }
        Self::init(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject_id TEXT NOT NULL,
                action TEXT NOT NULL,
                details TEXT NOT NULL,
                session_id TEXT,
                origin TEXT NOT NULL,
                severity TEXT NOT NULL,
                checksum TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_subject ON audit_log(subject_id);
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SecurityError::Storage(format!("Lock poisoned: {}", e)))
    }
}

impl AuditStore for SqliteAuditStore {
    fn insert(&self, event: &AuditEvent) -> Result<()> {
        let metadata = serde_json::to_string(&event.metadata)
            .map_err(|e| SecurityError::Storage(format!("failed to encode metadata: {}", e)))?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO audit_log
                (subject_id, action, details, session_id, origin, severity, checksum, metadata, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &event.subject_id,
                event.action.as_str(),
                &event.details,
                &event.session_id,
                &event.origin,
                event.severity.as_str(),
                &event.checksum,
                &metadata,
                sortable(&event.timestamp),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM audit_log WHERE timestamp < ?1",
            params![sortable(&cutoff)],
        )?;
        Ok(removed)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Fixed-width UTC timestamps so text comparison matches time order.
fn sortable(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
