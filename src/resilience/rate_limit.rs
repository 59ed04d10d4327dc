//! Sliding-window rate limiting per (operation, identifier).
//!
//! Each key owns a deque of admission instants. Every check evicts instants
//! older than the window from the front, refuses if the remaining count is
//! already at the ceiling, and otherwise records the new admission. Keys are
//! spread over independently locked shards so unrelated callers do not
//! contend on a single mutex.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::config::RateLimitSettings;
use crate::error::{Result, SecurityError};

const SHARDS: usize = 16;

/// Shard size past which idle keys are swept on the next check.
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Encryption,
    Decryption,
    AuditWrite,
    FailedAuth,
    CertificateIssuance,
    StateWrite,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Encryption => "encryption",
            Self::Decryption => "decryption",
            Self::AuditWrite => "audit_write",
            Self::FailedAuth => "failed_auth",
            Self::CertificateIssuance => "certificate_issuance",
            Self::StateWrite => "state_write",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission check for a named operation on behalf of an identifier.
pub trait Admission: Send + Sync {
    fn check(&self, op: Operation, identifier: &str) -> Result<()>;

    /// Admissions left in the current window without consuming one.
    fn remaining(&self, op: Operation, identifier: &str) -> u32;
}

type Key = (Operation, String);

pub struct RateLimiter {
    limits: RateLimitSettings,
    clock: Arc<dyn Clock>,
    shards: Vec<Mutex<HashMap<Key, VecDeque<Instant>>>>,
}

impl RateLimiter {
    pub fn new(limits: RateLimitSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            limits,
            clock,
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn limit_for(&self, op: Operation) -> u32 {
        match op {
            Operation::Encryption => self.limits.encryption,
            Operation::Decryption => self.limits.decryption,
            Operation::AuditWrite => self.limits.audit_write,
            Operation::FailedAuth => self.limits.failed_auth,
            Operation::CertificateIssuance => self.limits.certificate_issuance,
            Operation::StateWrite => self.limits.state_write,
        }
    }

    pub fn window(&self) -> Duration {
        self.limits.window
    }

    fn shard(&self, key: &Key) -> std::sync::MutexGuard<'_, HashMap<Key, VecDeque<Instant>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        self.shards[idx].lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Admission for RateLimiter {
    /// Admit or refuse one call. Admission is recorded; refusals are not.
    fn check(&self, op: Operation, identifier: &str) -> Result<()> {
        let limit = self.limit_for(op) as usize;
        let now = self.clock.now();
        let key = (op, identifier.to_string());

        let mut shard = self.shard(&key);
        if shard.len() > SWEEP_THRESHOLD {
            let window = self.limits.window;
            shard.retain(|_, hits| {
                evict(hits, now, window);
                !hits.is_empty()
            });
        }

        let hits = shard.entry(key).or_default();
        evict(hits, now, self.limits.window);

        if hits.len() >= limit {
            tracing::warn!("Rate limit hit: {} for {}", op, identifier);
            return Err(SecurityError::RateLimitExceeded {
                operation: op.as_str().to_string(),
                identifier: identifier.to_string(),
                limit: limit as u32,
                window: self.limits.window,
            });
        }

        hits.push_back(now);
        Ok(())
    }

    fn remaining(&self, op: Operation, identifier: &str) -> u32 {
        let limit = self.limit_for(op);
        let now = self.clock.now();
        let key = (op, identifier.to_string());

        let mut shard = self.shard(&key);
        let used = match shard.get_mut(&key) {
            Some(hits) => {
                evict(hits, now, self.limits.window);
                hits.len() as u32
            }
            None => 0,
        };
        limit.saturating_sub(used)
    }
}

fn evict(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = hits.front() {
        if now.saturating_duration_since(front) >= window {
            hits.pop_front();
        } else {
            break;
        }
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limits() -> RateLimitSettings {
        RateLimitSettings {
            window: Duration::from_secs(60),
            encryption: 100,
            decryption: 100,
            audit_write: 1000,
            failed_auth: 5,
            certificate_issuance: 10,
            state_write: 60,
        }
    }

    #[test]
    fn admits_exactly_the_limit_then_refuses() {
        let rl = RateLimiter::new(limits(), Arc::new(ManualClock::new()));
        for _ in 0..5 {
            rl.check(Operation::FailedAuth, "user123").unwrap();
        }
        let err = rl.check(Operation::FailedAuth, "user123").unwrap_err();
        assert!(err.to_string().contains("Rate limit exceeded"));
        assert_eq!(rl.remaining(Operation::FailedAuth, "user123"), 0);
    }

    #[test]
    fn identifiers_and_operations_are_independent() {
        let rl = RateLimiter::new(limits(), Arc::new(ManualClock::new()));
        for _ in 0..5 {
            rl.check(Operation::FailedAuth, "noisy").unwrap();
        }
        assert!(rl.check(Operation::FailedAuth, "noisy").is_err());
        rl.check(Operation::FailedAuth, "quiet").unwrap();
        rl.check(Operation::Encryption, "noisy").unwrap();
    }

    #[test]
    fn window_slides() {
        let clock = Arc::new(ManualClock::new());
        let rl = RateLimiter::new(limits(), clock.clone());
        for _ in 0..5 {
            rl.check(Operation::FailedAuth, "user123").unwrap();
        }
        clock.advance(Duration::from_secs(59));
        assert!(rl.check(Operation::FailedAuth, "user123").is_err());

        clock.advance(Duration::from_secs(1));
        rl.check(Operation::FailedAuth, "user123").unwrap();
        assert_eq!(rl.remaining(Operation::FailedAuth, "user123"), 4);
    }

    #[test]
    fn refusals_do_not_extend_the_window() {
        let clock = Arc::new(ManualClock::new());
        let rl = RateLimiter::new(limits(), clock.clone());
        for _ in 0..5 {
            rl.check(Operation::FailedAuth, "u").unwrap();
        }
        for _ in 0..10 {
            clock.advance(Duration::from_secs(5));
            let _ = rl.check(Operation::FailedAuth, "u");
        }
        clock.advance(Duration::from_secs(10));
        rl.check(Operation::FailedAuth, "u").unwrap();
    }

    #[test]
    fn concurrent_checks_never_exceed_the_limit() {
        let rl = Arc::new(RateLimiter::new(limits(), Arc::new(ManualClock::new())));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rl = Arc::clone(&rl);
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| rl.check(Operation::Encryption, "shared").is_ok())
                        .count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }
}
