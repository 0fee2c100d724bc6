//! # dsr-rs
//!
//! Data Subject Rights request engine for GDPR/CCPA workflows.
//!
//! Subjects file export, deletion, rectification, restriction and consent
//! withdrawal requests; each request is verified with a single-use token
//! before it is dispatched. Deletions are scheduled and executed later as
//! idempotent per-subject anonymization, and every state transition lands
//! in an append-only audit trail.

pub mod compliance;
pub mod config;
pub mod error;
pub mod logging;

pub use compliance::ComplianceEngine;
pub use config::EngineConfig;
pub use error::{Error, Result};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::Validation("test".to_string());
        assert!(err.to_string().contains("test"));
    }
}
