//! In-memory session registry with lazy expiry.
//!
//! Tokens carry 256 bits from the OS CSPRNG. Expiry is checked only when a
//! token is presented; an expired entry is evicted on that first check.
//! Tokens that are never presented again are dropped by a sweep that runs
//! when a new session is created and the registry has grown large.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::clock::Clock;

const TOKEN_BYTES: usize = 32;

/// Registry size at which expired entries are swept on the next `create`.
const SWEEP_THRESHOLD: usize = 1024;

/// Short, non-reversible reference to a token, safe to write to audit logs.
pub fn session_ref(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..8])
}

#[derive(Debug, Clone)]
struct SessionEntry {
    subject_id: String,
    issued_at: Instant,
}

/// Outcome of presenting a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Valid { subject_id: String },
    /// The token existed but outlived the timeout; it has been evicted.
    Expired { subject_id: String },
    Unknown,
}

impl SessionStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

pub struct SessionRegistry {
    timeout: Duration,
    clock: Arc<dyn Clock>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            timeout,
            clock,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Issue a new token for `subject_id`.
    pub fn create(&self, subject_id: &str) -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rng().fill(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);
        bytes.zeroize();

        let now = self.clock.now();
        let mut sessions = self.lock();
        if sessions.len() >= SWEEP_THRESHOLD {
            sessions.retain(|_, e| now.saturating_duration_since(e.issued_at) <= self.timeout);
        }
        sessions.insert(
            token.clone(),
            SessionEntry {
                subject_id: subject_id.to_string(),
                issued_at: now,
            },
        );
        token
    }

    pub fn validate(&self, token: &str) -> bool {
        self.status(token).is_valid()
    }

    /// Look up a token, evicting it if it has expired.
    pub fn status(&self, token: &str) -> SessionStatus {
        let now = self.clock.now();
        let mut sessions = self.lock();

        let Some(entry) = sessions.get(token) else {
            return SessionStatus::Unknown;
        };
        if now.saturating_duration_since(entry.issued_at) > self.timeout {
            let subject_id = entry.subject_id.clone();
            sessions.remove(token);
            return SessionStatus::Expired { subject_id };
        }
        SessionStatus::Valid {
            subject_id: entry.subject_id.clone(),
        }
    }

    /// Remove a token. Returns the subject it belonged to, if any.
    pub fn end(&self, token: &str) -> Option<String> {
        self.lock().remove(token).map(|entry| entry.subject_id)
    }

    /// Entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("timeout", &self.timeout)
            .field("sessions", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::HashSet;

    fn registry(clock: Arc<ManualClock>) -> SessionRegistry {
        SessionRegistry::new(Duration::from_secs(30 * 60), clock)
    }

    #[test]
    fn abandoned_sessions_are_swept_once_the_registry_is_large() {
        let clock = Arc::new(ManualClock::new());
        let reg = registry(clock.clone());
        for _ in 0..SWEEP_THRESHOLD {
            reg.create("user123");
        }
        assert_eq!(reg.len(), SWEEP_THRESHOLD);

        clock.advance(Duration::from_secs(31 * 60));
        let fresh = reg.create("user456");
        assert_eq!(reg.len(), 1);
        assert!(reg.validate(&fresh));
    }

    #[test]
    fn sweep_keeps_live_sessions() {
        let clock = Arc::new(ManualClock::new());
        let reg = registry(clock.clone());
        let live: Vec<String> = (0..SWEEP_THRESHOLD).map(|_| reg.create("user123")).collect();

        clock.advance(Duration::from_secs(60));
        reg.create("user456");
        assert_eq!(reg.len(), SWEEP_THRESHOLD + 1);
        assert!(live.iter().all(|t| reg.validate(t)));
    }

    #[test]
    fn tokens_are_long_and_unique() {
        let reg = registry(Arc::new(ManualClock::new()));
        let tokens: HashSet<String> = (0..100).map(|_| reg.create("user123")).collect();
        assert_eq!(tokens.len(), 100);
        for t in &tokens {
            assert_eq!(URL_SAFE_NO_PAD.decode(t).unwrap().len(), TOKEN_BYTES);
        }
    }

    #[test]
    fn valid_until_timeout_then_evicted() {
        let clock = Arc::new(ManualClock::new());
        let reg = registry(clock.clone());
        let token = reg.create("user123");

        clock.advance(Duration::from_secs(30 * 60));
        assert!(reg.validate(&token));

        clock.advance(Duration::from_secs(1));
        assert_eq!(
            reg.status(&token),
            SessionStatus::Expired {
                subject_id: "user123".into()
            }
        );
        assert!(reg.is_empty());
        assert_eq!(reg.status(&token), SessionStatus::Unknown);
    }

    #[test]
    fn end_removes_the_session() {
        let reg = registry(Arc::new(ManualClock::new()));
        let token = reg.create("user123");
        assert_eq!(reg.end(&token).as_deref(), Some("user123"));
        assert!(!reg.validate(&token));
        assert_eq!(reg.end(&token), None);
    }

    #[test]
    fn session_ref_is_stable_and_does_not_leak_the_token() {
        let reg = registry(Arc::new(ManualClock::new()));
        let token = reg.create("user123");
        let r = session_ref(&token);
        assert_eq!(r, session_ref(&token));
        assert_eq!(r.len(), 16);
        assert!(!token.contains(&r));
    }

    #[test]
    fn unknown_tokens_are_invalid() {
        let reg = registry(Arc::new(ManualClock::new()));
        assert!(!reg.validate("not-a-token"));
        assert!(!reg.validate(""));
    }
}
