use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::resilience::BreakerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthChecks {
    /// Live seal/open round trip with the active key
    pub encryption: bool,
    /// Backing store ping; `None` when no store is configured
    pub database: Option<bool>,
    pub audit_file: bool,
    pub circuit_breaker: BreakerState,
}

impl HealthChecks {
    /// Unhealthy when nothing can be encrypted or no audit path is left.
    /// Degraded when one audit path is down or the breaker is not closed.
    pub fn overall(&self) -> HealthStatus {
        let store_up = self.database == Some(true);
        if !self.encryption || (!self.audit_file && !store_up) {
            return HealthStatus::Unhealthy;
        }
        if !self.audit_file
            || self.database == Some(false)
            || self.circuit_breaker != BreakerState::Closed
        {
            return HealthStatus::Degraded;
        }
        HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub checks: HealthChecks,
    pub overall_status: HealthStatus,
}

impl HealthReport {
    pub fn new(timestamp: DateTime<Utc>, checks: HealthChecks) -> Self {
        let overall_status = checks.overall();
        Self {
            timestamp,
            checks,
            overall_status,
        }
    }
}
