//! Behavioral anomaly flagging.
//!
//! Keeps a bounded ring of recent actions per subject. When more than
//! `threshold` occurrences of the same action fall within `span`, a CRITICAL
//! `anomaly_detected` event is recorded. The same (subject, action) pair is
//! not flagged again until `span` has passed. Observation never fails and
//! never blocks the caller's operation.
//!
//! Windows are spread over independently locked shards keyed by subject, so
//! observations for different subjects rarely contend.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::audit::{AuditAction, AuditDraft, AuditSink, Severity};
use crate::clock::Clock;
use crate::config::AnomalySettings;

const SHARDS: usize = 16;

/// Shard size past which idle windows are dropped on the next observation.
const SWEEP_THRESHOLD: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anomaly {
    pub subject_id: String,
    pub action: AuditAction,
    pub count: usize,
    pub span: Duration,
}

#[derive(Debug, Default)]
struct SubjectWindow {
    recent: VecDeque<(AuditAction, Instant)>,
    flagged: HashMap<AuditAction, Instant>,
}

impl SubjectWindow {
    fn last_seen(&self) -> Option<Instant> {
        self.recent.back().map(|(_, at)| *at)
    }
}

pub struct AnomalyDetector {
    settings: AnomalySettings,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn AuditSink>,
    shards: Vec<Mutex<HashMap<String, SubjectWindow>>>,
}

impl AnomalyDetector {
    pub fn new(settings: AnomalySettings, clock: Arc<dyn Clock>, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            settings,
            clock,
            sink,
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, subject_id: &str) -> MutexGuard<'_, HashMap<String, SubjectWindow>> {
        let mut hasher = DefaultHasher::new();
        subject_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        self.shards[idx].lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one action. Returns the anomaly if this observation raised one.
    pub fn observe(&self, subject_id: &str, action: AuditAction) -> Option<Anomaly> {
        if action == AuditAction::AnomalyDetected {
            return None;
        }

        let anomaly = self.track(subject_id, action)?;

        let draft = AuditDraft::new(subject_id, AuditAction::AnomalyDetected)
            .severity(Severity::Critical)
            .details(format!(
                "{} '{}' actions within {}s",
                anomaly.count,
                anomaly.action,
                anomaly.span.as_secs()
            ))
            .meta("observed_action", anomaly.action)
            .meta("count", anomaly.count);
        if let Err(e) = self.sink.record(draft) {
            tracing::error!("Failed to record anomaly for {}: {}", subject_id, e);
        }

        Some(anomaly)
    }

    fn track(&self, subject_id: &str, action: AuditAction) -> Option<Anomaly> {
        let now = self.clock.now();
        let span = self.settings.span;
        let mut windows = self.shard(subject_id);

        if windows.len() > SWEEP_THRESHOLD {
            windows.retain(|_, w| {
                w.last_seen()
                    .is_some_and(|at| now.saturating_duration_since(at) < span)
            });
        }

        let window = windows.entry(subject_id.to_string()).or_default();
        if window.recent.len() >= self.settings.window_capacity {
            window.recent.pop_front();
        }
        window.recent.push_back((action, now));

        let count = window
            .recent
            .iter()
            .filter(|(a, at)| *a == action && now.saturating_duration_since(*at) < span)
            .count();
        if count <= self.settings.threshold {
            return None;
        }

        if let Some(&flagged_at) = window.flagged.get(&action)
            && now.saturating_duration_since(flagged_at) < span
        {
            return None;
        }
        window.flagged.insert(action, now);

        Some(Anomaly {
            subject_id: subject_id.to_string(),
            action,
            count,
            span,
        })
    }
}

impl std::fmt::Debug for AnomalyDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyDetector")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MockAuditSink;
    use crate::audit::testing::CollectingSink;
    use crate::clock::ManualClock;
    use crate::error::SecurityError;

    fn settings() -> AnomalySettings {
        AnomalySettings {
            window_capacity: 100,
            threshold: 20,
            span: Duration::from_secs(10),
        }
    }

    #[test]
    fn burst_of_same_action_is_flagged_once() {
        let sink = Arc::new(CollectingSink::default());
        let clock = Arc::new(ManualClock::new());
        let detector = AnomalyDetector::new(settings(), clock.clone(), sink.clone());

        let mut flagged = 0;
        for _ in 0..25 {
            if detector.observe("user123", AuditAction::DataAccess).is_some() {
                flagged += 1;
            }
            clock.advance(Duration::from_millis(100));
        }

        assert_eq!(flagged, 1);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, AuditAction::AnomalyDetected);
        assert_eq!(events[0].severity, Severity::Critical);
        assert_eq!(events[0].subject_id, "user123");
    }

    #[test]
    fn threshold_is_exclusive() {
        let sink = Arc::new(CollectingSink::default());
        let detector = AnomalyDetector::new(settings(), Arc::new(ManualClock::new()), sink.clone());
        for _ in 0..20 {
            assert!(detector.observe("user123", AuditAction::Login).is_none());
        }
        assert!(detector.observe("user123", AuditAction::Login).is_some());
    }

    #[test]
    fn mixed_actions_and_slow_rates_are_not_flagged() {
        let sink = Arc::new(CollectingSink::default());
        let clock = Arc::new(ManualClock::new());
        let detector = AnomalyDetector::new(settings(), clock.clone(), sink.clone());

        for i in 0..40 {
            let action = if i % 2 == 0 {
                AuditAction::DataAccess
            } else {
                AuditAction::DataModify
            };
            detector.observe("user123", action);
        }
        for _ in 0..40 {
            clock.advance(Duration::from_secs(1));
            detector.observe("user456", AuditAction::DataAccess);
        }

        assert!(sink.events().is_empty());
    }

    #[test]
    fn flagging_resumes_after_the_span() {
        let sink = Arc::new(CollectingSink::default());
        let clock = Arc::new(ManualClock::new());
        let detector = AnomalyDetector::new(settings(), clock.clone(), sink.clone());

        for _ in 0..21 {
            detector.observe("user123", AuditAction::Decryption);
        }
        clock.advance(Duration::from_secs(11));
        for _ in 0..21 {
            detector.observe("user123", AuditAction::Decryption);
        }

        assert_eq!(sink.events().len(), 2);
    }

    #[test]
    fn sink_failure_never_reaches_the_caller() {
        let mut sink = MockAuditSink::new();
        sink.expect_record()
            .times(1)
            .returning(|_| Err(SecurityError::Audit("both paths down".into())));
        let detector = AnomalyDetector::new(settings(), Arc::new(ManualClock::new()), Arc::new(sink));

        let flagged = (0..21)
            .filter_map(|_| detector.observe("user123", AuditAction::DataAccess))
            .count();
        assert_eq!(flagged, 1);
    }

    #[test]
    fn subjects_keep_separate_windows_across_shards() {
        let sink = Arc::new(CollectingSink::default());
        let detector = AnomalyDetector::new(settings(), Arc::new(ManualClock::new()), sink.clone());

        // Enough subjects to land in every shard; none crosses the threshold
        for round in 0..20 {
            for user in 0..64 {
                assert!(
                    detector
                        .observe(&format!("user{}", user), AuditAction::DataAccess)
                        .is_none(),
                    "user{} flagged in round {}",
                    user,
                    round
                );
            }
        }
        let flagged = detector.observe("user7", AuditAction::DataAccess).unwrap();
        assert_eq!(flagged.subject_id, "user7");
        assert_eq!(flagged.count, 21);
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn concurrent_observers_flag_exactly_once() {
        let sink = Arc::new(CollectingSink::default());
        let detector = Arc::new(AnomalyDetector::new(
            settings(),
            Arc::new(ManualClock::new()),
            sink.clone(),
        ));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let detector = Arc::clone(&detector);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        detector.observe("shared", AuditAction::DataAccess);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(sink.events().len(), 1);
    }
}
