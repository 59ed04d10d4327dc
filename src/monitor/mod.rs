//! Observational monitoring. Nothing here can refuse a request.

mod anomaly;

pub use anomaly::{Anomaly, AnomalyDetector};
