//! The immutable context every component is built from.
//!
//! Constructed once at startup from validated settings and shared by
//! `Arc`. There is no process-wide mutable state anywhere in the core.

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, SecuritySettings};
use crate::error::Result;

#[derive(Clone)]
pub struct SecurityContext {
    settings: SecuritySettings,
    clock: Arc<dyn Clock>,
}

impl SecurityContext {
    pub fn new(settings: SecuritySettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: SecuritySettings, clock: Arc<dyn Clock>) -> Self {
        Self { settings, clock }
    }

    /// Validate a loaded config file and build a context on the system clock.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(SecuritySettings::from_config(config)?))
    }

    pub fn settings(&self) -> &SecuritySettings {
        &self.settings
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
