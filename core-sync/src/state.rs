//! # Sync State Machine
//!
//! The engine owns exactly one [`SyncState`]. Status changes go through
//! [`SyncState::transition`], which rejects anything outside this graph:
//!
//! ```text
//! Idle → Checking → Syncing → Succeeded → Idle
//!           │          │  ↑
//!           │          ↓  │ (one re-attempt after a repair)
//!           └──────→ Failed ──────────→ Idle
//! ```

use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    /// Probing connectivity and resolving a source
    Checking,
    /// Fetching the catalog and writing the cache
    Syncing,
    Succeeded,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Checking => "checking",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Succeeded => "succeeded",
            SyncStatus::Failed => "failed",
        }
    }

    /// A pass is between its gate and its final bookkeeping.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncStatus::Checking | SyncStatus::Syncing)
    }

    fn can_transition_to(&self, to: SyncStatus) -> bool {
        matches!(
            (self, to),
            (SyncStatus::Idle, SyncStatus::Checking)
                | (SyncStatus::Checking, SyncStatus::Syncing)
                | (SyncStatus::Checking, SyncStatus::Failed)
                | (SyncStatus::Syncing, SyncStatus::Succeeded)
                | (SyncStatus::Syncing, SyncStatus::Failed)
                | (SyncStatus::Failed, SyncStatus::Syncing)
                | (SyncStatus::Succeeded, SyncStatus::Idle)
                | (SyncStatus::Failed, SyncStatus::Idle)
        )
    }
}

impl FromStr for SyncStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(SyncStatus::Idle),
            "checking" => Ok(SyncStatus::Checking),
            "syncing" => Ok(SyncStatus::Syncing),
            "succeeded" => Ok(SyncStatus::Succeeded),
            "failed" => Ok(SyncStatus::Failed),
            _ => Err(SyncError::InvalidStateTransition {
                from: s.to_string(),
                to: s.to_string(),
                reason: format!("unknown status {s}"),
            }),
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Error records
// ============================================================================

/// Classified failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Connection,
    Authentication,
    Timeout,
    DuplicateKey,
    ConstraintViolation,
    Network,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "Connection",
            ErrorKind::Authentication => "Authentication",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::DuplicateKey => "DuplicateKey",
            ErrorKind::ConstraintViolation => "ConstraintViolation",
            ErrorKind::Network => "Network",
            ErrorKind::Unknown => "Unknown",
        }
    }

    /// Whether an automatic retry can be expected to help.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::Authentication | ErrorKind::ConstraintViolation
        )
    }

    /// Kinds that surface a notice on the first failure.
    pub fn surfaces_immediately(&self) -> bool {
        !self.is_recoverable()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The last failure and how many passes in a row failed with the same kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub recoverable: bool,
    pub consecutive_count: u32,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            message: message.into(),
            occurred_at,
            recoverable: kind.is_recoverable(),
            consecutive_count: 1,
        }
    }

    /// Build the record for a new failure given the previous one. The count
    /// continues when the kind repeats and restarts at 1 otherwise.
    pub fn advance(
        previous: Option<&ErrorRecord>,
        kind: ErrorKind,
        message: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let mut record = Self::new(kind, message, occurred_at);
        if let Some(previous) = previous.filter(|p| p.kind == kind) {
            record.consecutive_count = previous.consecutive_count.saturating_add(1);
        }
        record
    }

    /// Replace the failure details within the same pass without counting a
    /// new failure, unless the kind changed.
    pub fn supersede(
        &self,
        kind: ErrorKind,
        message: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let mut record = Self::new(kind, message, occurred_at);
        if kind == self.kind {
            record.consecutive_count = self.consecutive_count;
        }
        record
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (x{}): {}",
            self.kind, self.consecutive_count, self.message
        )
    }
}

// ============================================================================
// Engine state
// ============================================================================

/// The single mutable sync state of an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    pub status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorRecord>,
    /// Single-flight lock: a pass holds it from its gate to its final bookkeeping.
    pub in_flight: bool,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            status: SyncStatus::Idle,
            last_sync_at: None,
            last_error: None,
            in_flight: false,
        }
    }

    /// Move to `to`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` for edges outside the state graph.
    pub fn transition(&mut self, to: SyncStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(SyncError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
                reason: format!(
                    "Cannot transition from {} to {}",
                    self.status.as_str(),
                    to.as_str()
                ),
            });
        }

        self.status = to;
        Ok(())
    }

    /// Release a pass that was dropped before its final bookkeeping ran.
    /// Returns to `Idle` from any status.
    pub fn abandon(&mut self) {
        self.status = SyncStatus::Idle;
        self.in_flight = false;
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut state = SyncState::new();
        state.transition(SyncStatus::Checking).unwrap();
        state.transition(SyncStatus::Syncing).unwrap();
        state.transition(SyncStatus::Succeeded).unwrap();
        state.transition(SyncStatus::Idle).unwrap();
        assert_eq!(state.status, SyncStatus::Idle);
    }

    #[test]
    fn test_failed_can_reattempt_syncing() {
        let mut state = SyncState::new();
        state.transition(SyncStatus::Checking).unwrap();
        state.transition(SyncStatus::Syncing).unwrap();
        state.transition(SyncStatus::Failed).unwrap();
        state.transition(SyncStatus::Syncing).unwrap();
        state.transition(SyncStatus::Succeeded).unwrap();
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut state = SyncState::new();
        let err = state.transition(SyncStatus::Syncing).unwrap_err();
        assert!(matches!(err, SyncError::InvalidStateTransition { .. }));
        assert_eq!(state.status, SyncStatus::Idle);

        state.transition(SyncStatus::Checking).unwrap();
        assert!(state.transition(SyncStatus::Succeeded).is_err());
        assert!(state.transition(SyncStatus::Idle).is_err());
    }

    #[test]
    fn test_abandon_returns_to_idle_from_any_status() {
        let mut state = SyncState::new();
        state.transition(SyncStatus::Checking).unwrap();
        state.transition(SyncStatus::Syncing).unwrap();
        state.in_flight = true;

        state.abandon();
        assert_eq!(state.status, SyncStatus::Idle);
        assert!(!state.in_flight);
        state.transition(SyncStatus::Checking).unwrap();
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            SyncStatus::Idle,
            SyncStatus::Checking,
            SyncStatus::Syncing,
            SyncStatus::Succeeded,
            SyncStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!("paused".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(ErrorKind::Connection.is_recoverable());
        assert!(ErrorKind::Network.is_recoverable());
        assert!(ErrorKind::Timeout.is_recoverable());
        assert!(ErrorKind::DuplicateKey.is_recoverable());
        assert!(ErrorKind::Unknown.is_recoverable());
        assert!(!ErrorKind::Authentication.is_recoverable());
        assert!(!ErrorKind::ConstraintViolation.is_recoverable());
    }

    #[test]
    fn test_advance_counts_same_kind_and_resets_on_change() {
        let first = ErrorRecord::advance(None, ErrorKind::Network, "down", at(1));
        assert_eq!(first.consecutive_count, 1);

        let second = ErrorRecord::advance(Some(&first), ErrorKind::Network, "down", at(2));
        assert_eq!(second.consecutive_count, 2);

        let third = ErrorRecord::advance(Some(&second), ErrorKind::Timeout, "slow", at(3));
        assert_eq!(third.consecutive_count, 1);
        assert_eq!(third.kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_supersede_keeps_count_for_same_kind() {
        let mut record = ErrorRecord::new(ErrorKind::Connection, "refused", at(1));
        record.consecutive_count = 4;

        let same = record.supersede(ErrorKind::Connection, "reset", at(2));
        assert_eq!(same.consecutive_count, 4);
        assert_eq!(same.message, "reset");

        let other = record.supersede(ErrorKind::Unknown, "?", at(2));
        assert_eq!(other.consecutive_count, 1);
    }

    #[test]
    fn test_record_json_round_trip() {
        let record = ErrorRecord::new(ErrorKind::Authentication, "JWT expired", at(10));
        let json = record.to_json().unwrap();
        assert!(json.contains("\"Authentication\""));
        assert_eq!(ErrorRecord::from_json(&json).unwrap(), record);
    }
}
