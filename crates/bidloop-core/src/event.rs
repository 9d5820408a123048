//! Structured system events
//!
//! Cycle transitions, consistency violations, hold changes and transfer
//! failures are recorded as [`SystemEvent`]s in the store. Diagnostics query
//! them instead of scraping logs.

use crate::types::EventId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event severity, ordered from least to most severe
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// What happened
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CycleCreated,
    CycleOpened,
    CycleClosed,
    CycleReopened,
    PurchaseCommitted,
    PipelineStageFailed,
    ConsistencyViolation,
    HoldApplied,
    HoldReleased,
    RankAdvanced,
    TransferFailed,
    TransferRequeued,
    TransferArchived,
    DepositRecorded,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: EventId,
    pub at: DateTime<Utc>,
    pub severity: Severity,
    pub kind: EventKind,
    /// Cycle id, purchase id or transfer id the event concerns
    pub correlation_id: Option<String>,
    pub message: String,
}

impl SystemEvent {
    pub fn new(
        at: DateTime<Utc>,
        severity: Severity,
        kind: EventKind,
        correlation_id: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: EventId::new(),
            at,
            severity,
            kind,
            correlation_id,
            message: message.into(),
        }
    }

    pub fn info(at: DateTime<Utc>, kind: EventKind, correlation: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::new(at, Severity::Info, kind, Some(correlation.to_string()), message)
    }

    pub fn warning(at: DateTime<Utc>, kind: EventKind, correlation: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::new(at, Severity::Warning, kind, Some(correlation.to_string()), message)
    }

    pub fn error(at: DateTime<Utc>, kind: EventKind, correlation: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::new(at, Severity::Error, kind, Some(correlation.to_string()), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_event_constructors() {
        let ev = SystemEvent::warning(Utc::now(), EventKind::TransferFailed, "t-1", "gateway timeout");
        assert_eq!(ev.severity, Severity::Warning);
        assert_eq!(ev.correlation_id.as_deref(), Some("t-1"));
        assert_eq!(format!("{}", ev.severity), "WARNING");
    }
}
