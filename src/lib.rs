//! phiguard - local, crash-safe, tamper-evident security substrate for PHI
//!
//! This crate provides:
//! - Versioned envelope encryption over AES-256-GCM with PBKDF2-derived keys
//! - Atomic persistence with backup rotation and corrupt-file recovery
//! - A checksummed audit trail on a rotating file and a SQLite store
//! - Sliding-window rate limiting, a circuit breaker and anomaly flagging
//! - Session tokens with lazy expiry
//!
//! [`SecurityCore`] composes all of it into the single entry point an
//! application calls.

pub mod audit;
pub mod cli;
pub mod clock;
pub mod config;
pub mod context;
pub mod core;
pub mod crypto;
pub mod error;
pub mod monitor;
pub mod paths;
pub mod resilience;
pub mod session;
pub mod storage;
pub mod validation;

pub use config::Config;
pub use context::SecurityContext;
pub use crate::core::{Caller, HealthReport, HealthStatus, SecurityCore};
pub use error::{Result, SecurityError};
