//! Atomic Store: crash-safe persistence of named documents.
//!
//! A write goes to a temp file in the destination's own directory, is synced,
//! and then renamed over the destination, so a reader sees either the old
//! file or the new one and never a partial write. Before each commit the
//! current file is snapshotted into the backup directory; at most
//! `max_backups` snapshots are kept per name.
//!
//! Writers to the same name are serialized in-process by a name lock and
//! across processes by an fs2 lock file. Different names never contend.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::lock::{FileLock, FileLockGuard};
use crate::audit::{AuditAction, AuditDraft, AuditSink, SYSTEM_SUBJECT, Severity};
use crate::clock::Clock;
use crate::config::StorageSettings;
use crate::error::{Result, SecurityError};
use crate::paths::create_dir_with_mode;
use crate::validation::validate_logical_name;

const TEMP_SUFFIX: &str = ".tmp";
const BACKUP_SUFFIX: &str = ".bak";
const CORRUPT_SUFFIX: &str = ".corrupt";
const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.9fZ";

/// In-process lock table keyed by logical name.
#[derive(Default)]
struct NameLocks {
    busy: Mutex<HashSet<String>>,
    freed: Condvar,
}

struct NameGuard<'a> {
    locks: &'a NameLocks,
    name: String,
}

impl NameLocks {
    fn acquire(&self, name: &str) -> NameGuard<'_> {
        let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        while busy.contains(name) {
            busy = self.freed.wait(busy).unwrap_or_else(|e| e.into_inner());
        }
        busy.insert(name.to_string());
        NameGuard {
            locks: self,
            name: name.to_string(),
        }
    }
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        let mut busy = self.locks.busy.lock().unwrap_or_else(|e| e.into_inner());
        busy.remove(&self.name);
        self.locks.freed.notify_all();
    }
}

/// A write that has been fully staged but not yet made visible.
///
/// [`commit`](StagedWrite::commit) snapshots the current file and renames
/// the temp file into place. Dropping it instead discards the temp file and
/// leaves the destination untouched.
pub struct StagedWrite<'a> {
    store: &'a AtomicStore,
    name: String,
    dest: PathBuf,
    temp: NamedTempFile,
    _file_lock: FileLockGuard,
    _name_lock: NameGuard<'a>,
}

impl StagedWrite<'_> {
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    pub fn commit(self) -> Result<()> {
        if self.dest.exists() {
            self.store.snapshot(&self.name, &self.dest)?;
        }

        self.temp
            .persist(&self.dest)
            .map_err(|e| SecurityError::Io(e.error))?;
        sync_dir(&self.store.data_dir);

        debug!("Committed {}", self.dest.display());
        Ok(())
    }
}

pub struct AtomicStore {
    data_dir: PathBuf,
    backup_dir: PathBuf,
    locks_dir: PathBuf,
    max_backups: usize,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn AuditSink>,
    names: NameLocks,
}

impl AtomicStore {
    /// Create the directories and remove temp files a crashed writer left
    /// behind.
    pub fn open(
        settings: &StorageSettings,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        for dir in [&settings.data_dir, &settings.backup_dir, &settings.locks_dir] {
            create_dir_with_mode(dir)?;
        }

        let store = Self {
            data_dir: settings.data_dir.clone(),
            backup_dir: settings.backup_dir.clone(),
            locks_dir: settings.locks_dir.clone(),
            max_backups: settings.max_backups,
            clock,
            sink,
            names: NameLocks::default(),
        };

        let swept = store.sweep_stale_temps()?;
        if swept > 0 {
            info!("Removed {} stale temp file(s) from {}", swept, store.data_dir.display());
        }
        Ok(store)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        Ok(self.data_dir.join(validate_logical_name(name)?))
    }

    /// Stage `bytes` for `name`: take the locks, write and sync a temp file
    /// next to the destination.
    pub fn stage(&self, name: &str, bytes: &[u8]) -> Result<StagedWrite<'_>> {
        let dest = self.path_for(name)?;
        let name_lock = self.names.acquire(name);
        let file_lock = FileLock::for_name(&self.locks_dir, name).acquire()?;

        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", name))
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.data_dir)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;

        Ok(StagedWrite {
            store: self,
            name: name.to_string(),
            dest,
            temp,
            _file_lock: file_lock,
            _name_lock: name_lock,
        })
    }

    pub fn write_bytes(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.stage(name, bytes)?.commit()
    }

    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| SecurityError::Storage(format!("failed to serialize {}: {}", name, e)))?;
        self.write_bytes(name, &bytes)
    }

    /// Raw bytes, or `None` if the file does not exist.
    pub fn read_bytes(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read and decode `name`. A missing file yields `default`. A file that
    /// fails to decode is moved aside for review, a recovery event is
    /// audited, and `default` is returned.
    ///
    /// `decode` may run a second time: recovery re-reads the file under the
    /// write locks and only quarantines bytes that still fail to decode.
    pub fn read_with<T>(
        &self,
        name: &str,
        default: T,
        decode: impl Fn(&[u8]) -> Result<T>,
    ) -> Result<T> {
        let Some(bytes) = self.read_bytes(name)? else {
            return Ok(default);
        };
        match decode(&bytes) {
            Ok(value) => Ok(value),
            Err(e) => self.recover(name, &bytes, e, default, &decode),
        }
    }

    pub fn read_json<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T> {
        self.read_with(name, default, |bytes| {
            serde_json::from_slice(bytes).map_err(|e| SecurityError::Corruption {
                path: PathBuf::from(name),
                reason: e.to_string(),
            })
        })
    }

    /// Snapshots for `name`, oldest first.
    pub fn backups(&self, name: &str) -> Result<Vec<PathBuf>> {
        validate_logical_name(name)?;
        let mut found: Vec<(DateTime<Utc>, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.backup_dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(stamp) = backup_stamp(file_name, name, BACKUP_SUFFIX) {
                found.push((stamp, path));
            }
        }
        found.sort();
        Ok(found.into_iter().map(|(_, p)| p).collect())
    }

    /// Remove temp files whose writer is gone. A temp file is stale when
    /// the lock for its logical name can be taken.
    pub fn sweep_stale_temps(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(name) = temp_owner(file_name) else {
                continue;
            };
            let Some(_guard) = FileLock::for_name(&self.locks_dir, name).try_acquire()? else {
                continue;
            };
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    fn snapshot(&self, name: &str, current: &Path) -> Result<()> {
        let backup = self.unique_stamped(name, BACKUP_SUFFIX);
        fs::copy(current, &backup)?;
        debug!("Backed up {} to {}", name, backup.display());

        let backups = self.backups(name)?;
        let excess = backups.len().saturating_sub(self.max_backups);
        for old in &backups[..excess] {
            fs::remove_file(old)?;
            debug!("Rotated out backup {}", old.display());
        }
        Ok(())
    }

    fn recover<T>(
        &self,
        name: &str,
        failed: &[u8],
        cause: SecurityError,
        default: T,
        decode: &impl Fn(&[u8]) -> Result<T>,
    ) -> Result<T> {
        let path = self.path_for(name)?;
        let _name_lock = self.names.acquire(name);
        let _file_lock = FileLock::for_name(&self.locks_dir, name).acquire()?;

        // A writer may have committed between our read and taking the locks
        let current = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(default),
            Err(e) => return Err(e.into()),
        };
        let cause = if current == failed {
            cause
        } else {
            match decode(&current) {
                Ok(value) => {
                    debug!("{} was replaced while being read; using the new contents", name);
                    return Ok(value);
                }
                Err(e) => e,
            }
        };

        self.quarantine(name, &path, &cause)?;
        Ok(default)
    }

    /// Move the file at `path` into the backup directory and audit it.
    /// Callers hold the write locks for `name`.
    fn quarantine(&self, name: &str, path: &Path, cause: &SecurityError) -> Result<()> {
        let quarantine = self.unique_stamped(name, CORRUPT_SUFFIX);

        let moved = fs::copy(path, &quarantine).and_then(|_| fs::remove_file(path));
        if let Err(e) = moved {
            return Err(SecurityError::Corruption {
                path: path.to_path_buf(),
                reason: format!("{}; preserving corrupt copy failed: {}", cause, e),
            });
        }

        warn!(
            "Recovered corrupt {}: moved to {} ({})",
            name,
            quarantine.display(),
            cause
        );

        self.sink.record(
            AuditDraft::new(SYSTEM_SUBJECT, AuditAction::StateRecovered)
                .severity(Severity::High)
                .details(format!("{} failed to decode; restored default", name))
                .meta("file", name)
                .meta("preserved_as", quarantine.display())
                .meta("error", cause.kind()),
        )?;
        Ok(())
    }

    fn unique_stamped(&self, name: &str, suffix: &str) -> PathBuf {
        let mut stamp = self.clock.utc();
        loop {
            let candidate = self.backup_dir.join(format!(
                "{}.{}{}",
                name,
                stamp.format(STAMP_FORMAT),
                suffix
            ));
            if !candidate.exists() {
                return candidate;
            }
            stamp += chrono::Duration::nanoseconds(1);
        }
    }
}

impl std::fmt::Debug for AtomicStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicStore")
            .field("data_dir", &self.data_dir)
            .field("backup_dir", &self.backup_dir)
            .field("max_backups", &self.max_backups)
            .finish_non_exhaustive()
    }
}

/// Timestamp of `<name>.<stamp><suffix>`, if `file_name` is one.
fn backup_stamp(file_name: &str, name: &str, suffix: &str) -> Option<DateTime<Utc>> {
    let stamp = file_name
        .strip_prefix(name)?
        .strip_prefix('.')?
        .strip_suffix(suffix)?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Logical name owning a temp file `.<name>.<random>.tmp`.
fn temp_owner(file_name: &str) -> Option<&str> {
    let inner = file_name.strip_prefix('.')?.strip_suffix(TEMP_SUFFIX)?;
    let (name, _random) = inner.rsplit_once('.')?;
    validate_logical_name(name).ok()
}

/// Persist the rename itself. Directories cannot be opened for sync on
/// every platform.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
            warn!("Failed to sync directory {}: {}", dir.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}
