//! Summary of the rotating audit file set for compliance review.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::file_log::AuditLine;
use crate::crypto::AuditKey;

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub generated_at: DateTime<Utc>,
    pub total_events: usize,
    pub events_by_action: BTreeMap<String, usize>,
    pub events_by_severity: BTreeMap<String, usize>,
    pub failed_attempts: usize,
    /// Positions of lines that failed verification or did not parse.
    pub tampered: Vec<usize>,
    pub first_event: Option<DateTime<Utc>>,
    pub last_event: Option<DateTime<Utc>>,
}

impl AuditReport {
    pub fn build(lines: &[AuditLine], key: &AuditKey, generated_at: DateTime<Utc>) -> Self {
        let mut report = AuditReport {
            generated_at,
            total_events: 0,
            events_by_action: BTreeMap::new(),
            events_by_severity: BTreeMap::new(),
            failed_attempts: 0,
            tampered: Vec::new(),
            first_event: None,
            last_event: None,
        };

        for (i, line) in lines.iter().enumerate() {
            let AuditLine::Event(event) = line else {
                report.tampered.push(i);
                continue;
            };
            if !event.verify(key) {
                report.tampered.push(i);
            }

            report.total_events += 1;
            *report
                .events_by_action
                .entry(event.action.as_str().to_string())
                .or_default() += 1;
            *report
                .events_by_severity
                .entry(event.severity.as_str().to_string())
                .or_default() += 1;
            if event.is_failure() {
                report.failed_attempts += 1;
            }

            report.first_event = Some(match report.first_event {
                Some(first) => first.min(event.timestamp),
                None => event.timestamp,
            });
            report.last_event = Some(match report.last_event {
                Some(last) => last.max(event.timestamp),
                None => event.timestamp,
            });
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{AuditAction, AuditDraft, Severity};
    use crate::crypto::testing::cipher;
    use crate::error::SecurityError;

    #[test]
    fn counts_by_action_and_severity() {
        let key = cipher().audit_key();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(5);

        let login = AuditDraft::new("u1", AuditAction::Login)
            .seal(&key, t0)
            .unwrap();
        let failed = AuditDraft::new("u1", AuditAction::LoginFailed)
            .failed(&SecurityError::validation("bad password"))
            .seal(&key, t1)
            .unwrap();
        let mut forged = AuditDraft::new("u2", AuditAction::DataAccess)
            .severity(Severity::High)
            .seal(&key, t0)
            .unwrap();
        forged.subject_id = "u3".into();

        let lines = vec![
            AuditLine::Event(login),
            AuditLine::Event(failed),
            AuditLine::Corrupt("{oops".into()),
            AuditLine::Event(forged),
        ];
        let report = AuditReport::build(&lines, &key, t1);

        assert_eq!(report.total_events, 3);
        assert_eq!(report.events_by_action.get("login"), Some(&1));
        assert_eq!(report.events_by_action.get("login_failed"), Some(&1));
        assert_eq!(report.events_by_severity.get("high"), Some(&1));
        assert_eq!(report.failed_attempts, 1);
        assert_eq!(report.tampered, vec![2, 3]);
        assert_eq!(report.first_event, Some(t0));
        assert_eq!(report.last_event, Some(t1));
    }
}
