//! Size-rotated, append-only JSONL audit file.
//!
//! Stored at `<log_dir>/audit.jsonl`. When the next line would push the file
//! past `max_file_bytes`, the file is shifted to `audit.jsonl.1` (older
//! backups move up by one) and a fresh file is started. At most
//! `backup_count` rotated files are kept.
//!
//! A single mutex guards append and rotation so lines from concurrent
//! writers never interleave.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::crypto::AuditKey;
use crate::error::{Result, SecurityError};
use crate::paths::create_dir_with_mode;

use super::event::AuditEvent;

pub const AUDIT_FILENAME: &str = "audit.jsonl";

/// One line of the audit file set, as read back for inspection.
#[derive(Debug, Clone)]
pub enum AuditLine {
    Event(AuditEvent),
    Corrupt(String),
}

/// Result of checking every line of the audit file set.
#[derive(Debug, Clone, Default)]
pub struct Verification {
    pub total: usize,
    /// Zero-based positions (oldest file first) of lines that failed
    /// checksum verification or could not be parsed.
    pub tampered: Vec<usize>,
}

impl Verification {
    pub fn is_intact(&self) -> bool {
        self.tampered.is_empty()
    }
}

#[derive(Debug)]
pub struct RotatingFileLog {
    path: PathBuf,
    max_bytes: u64,
    backup_count: usize,
    guard: Mutex<()>,
}

impl RotatingFileLog {
    pub fn open(log_dir: &Path, max_bytes: u64, backup_count: usize) -> Result<Self> {
        create_dir_with_mode(log_dir)?;
        Ok(Self {
            path: log_dir.join(AUDIT_FILENAME),
            max_bytes,
            backup_count,
            guard: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event as a JSON line, rotating first if needed.
    pub fn append(&self, event: &AuditEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)
            .map_err(|e| SecurityError::Audit(format!("failed to serialize event: {}", e)))?;
        line.push('\n');

        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());

        let current = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current > 0 && current + line.len() as u64 > self.max_bytes {
            self.rotate()?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Check that the file can be opened for append.
    pub fn is_writable(&self) -> bool {
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .is_ok()
    }

    fn rotate(&self) -> Result<()> {
        if self.backup_count == 0 {
            fs::remove_file(&self.path)?;
            return Ok(());
        }

        let oldest = self.backup_path(self.backup_count);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.backup_count).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                fs::rename(&from, self.backup_path(n + 1))?;
            }
        }
        fs::rename(&self.path, self.backup_path(1))?;
        tracing::debug!("Rotated audit log {}", self.path.display());
        Ok(())
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    /// Existing files, oldest first.
    pub fn files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = (1..=self.backup_count)
            .rev()
            .map(|n| self.backup_path(n))
            .filter(|p| p.exists())
            .collect();
        if self.path.exists() {
            files.push(self.path.clone());
        }
        files
    }

    /// Read every line of every file, oldest first. Blank lines are skipped.
    pub fn read_lines(&self) -> Result<Vec<AuditLine>> {
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        let mut lines = Vec::new();
        for file in self.files() {
            let content = fs::read_to_string(&file)?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                lines.push(match serde_json::from_str::<AuditEvent>(line) {
                    Ok(event) => AuditLine::Event(event),
                    Err(_) => AuditLine::Corrupt(line.to_string()),
                });
            }
        }
        Ok(lines)
    }

    /// Parsed events, oldest first. Corrupt lines are skipped.
    pub fn read_events(&self) -> Result<Vec<AuditEvent>> {
        Ok(self
            .read_lines()?
            .into_iter()
            .filter_map(|line| match line {
                AuditLine::Event(event) => Some(event),
                AuditLine::Corrupt(_) => None,
            })
            .collect())
    }

    /// Verify the checksum of every line.
    pub fn verify(&self, key: &AuditKey) -> Result<Verification> {
        let lines = self.read_lines()?;
        let tampered = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| match line {
                AuditLine::Event(event) => !event.verify(key),
                AuditLine::Corrupt(_) => true,
            })
            .map(|(i, _)| i)
            .collect();
        Ok(Verification {
            total: lines.len(),
            tampered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{AuditAction, AuditDraft};
    use crate::crypto::testing::cipher;
    use chrono::Utc;

    fn event(i: usize) -> AuditEvent {
        AuditDraft::new(format!("user{}", i), AuditAction::DataAccess)
            .details(format!("read record {}", i))
            .seal(&cipher().audit_key(), Utc::now())
            .unwrap()
    }

    #[test]
    fn appended_events_verify() {
        let tmp = tempfile::tempdir().unwrap();
        let log = RotatingFileLog::open(tmp.path(), 1024 * 1024, 3).unwrap();

        for i in 0..5 {
            log.append(&event(i)).unwrap();
        }

        let events = log.read_events().unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].subject_id, "user0");

        let report = log.verify(&cipher().audit_key()).unwrap();
        assert_eq!(report.total, 5);
        assert!(report.is_intact(), "{:?}", report.tampered);
    }

    #[test]
    fn tampered_line_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let log = RotatingFileLog::open(tmp.path(), 1024 * 1024, 3).unwrap();
        for i in 0..3 {
            log.append(&event(i)).unwrap();
        }

        let content = fs::read_to_string(log.path()).unwrap();
        let tampered = content.replace("read record 1", "read record 9");
        fs::write(log.path(), tampered).unwrap();

        let report = log.verify(&cipher().audit_key()).unwrap();
        assert_eq!(report.tampered, vec![1]);
    }

    #[test]
    fn corrupt_line_is_reported_and_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let log = RotatingFileLog::open(tmp.path(), 1024 * 1024, 3).unwrap();
        log.append(&event(0)).unwrap();

        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        writeln!(file, "{{not json").unwrap();
        drop(file);
        log.append(&event(1)).unwrap();

        assert_eq!(log.read_events().unwrap().len(), 2);
        assert_eq!(log.verify(&cipher().audit_key()).unwrap().tampered, vec![1]);
    }

    #[test]
    fn rotation_keeps_bounded_backups_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let line_len = serde_json::to_string(&event(0)).unwrap().len() as u64 + 1;
        // Room for two lines per file
        let log = RotatingFileLog::open(tmp.path(), line_len * 2 + 4, 2).unwrap();

        for i in 0..10 {
            log.append(&event(i)).unwrap();
        }

        let files = log.files();
        assert_eq!(files.len(), 3);
        assert!(!tmp.path().join("audit.jsonl.3").exists());

        let events = log.read_events().unwrap();
        assert!(events.len() <= 6);
        let last = events.last().unwrap();
        assert_eq!(last.subject_id, "user9");
        // Oldest-first ordering survives rotation
        let ids: Vec<usize> = events
            .iter()
            .map(|e| e.subject_id.trim_start_matches("user").parse().unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "{:?}", ids);
    }

    #[test]
    fn empty_log_reads_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let log = RotatingFileLog::open(&tmp.path().join("audit"), 1024, 2).unwrap();
        assert!(log.read_events().unwrap().is_empty());
        assert!(log.verify(&cipher().audit_key()).unwrap().is_intact());
        assert!(log.is_writable());
    }
}
