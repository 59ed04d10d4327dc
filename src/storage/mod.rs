//! Crash-safe local persistence.

mod atomic;
mod lock;

pub use atomic::{AtomicStore, StagedWrite};
pub use lock::{FileLock, FileLockGuard};
