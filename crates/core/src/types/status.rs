//! Status enums for resource sets, queries and conversation sessions.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a provisioned resource set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// No backend object of the set exists.
    #[default]
    Absent,
    /// A provisioning run is in flight.
    Provisioning,
    /// Every object exists.
    Ready,
    /// A provisioning run stopped part way, or only some objects exist.
    Failed,
    /// A teardown run is in flight.
    TearingDown,
}

impl ResourceStatus {
    /// Whether a provisioning or teardown run currently owns the set.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Provisioning | Self::TearingDown)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Absent => "absent",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::TearingDown => "tearing down",
        };
        f.write_str(label)
    }
}

/// Status of a natural-language query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    #[default]
    Pending,
    Succeeded,
    Failed,
}

impl QueryStatus {
    /// Whether the query has reached a terminal status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// State of one conversation's session.
///
/// ```text
/// Idle -> Provisioning -> Ready <-> Querying
///   ^                      |
///   +----- TearingDown <---+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Provisioning,
    Ready,
    Querying,
    TearingDown,
}

impl SessionState {
    /// Whether an operation is in flight for the conversation.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Provisioning | Self::Querying | Self::TearingDown)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Querying => "querying",
            Self::TearingDown => "tearing down",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_status_in_flight() {
        assert!(ResourceStatus::Provisioning.is_in_flight());
        assert!(ResourceStatus::TearingDown.is_in_flight());
        assert!(!ResourceStatus::Ready.is_in_flight());
        assert!(!ResourceStatus::Failed.is_in_flight());
        assert!(!ResourceStatus::Absent.is_in_flight());
    }

    #[test]
    fn test_session_state_busy() {
        assert!(!SessionState::Idle.is_busy());
        assert!(!SessionState::Ready.is_busy());
        assert!(SessionState::Provisioning.is_busy());
        assert!(SessionState::Querying.is_busy());
        assert!(SessionState::TearingDown.is_busy());
    }

    #[test]
    fn test_query_status_terminal() {
        assert!(!QueryStatus::Pending.is_terminal());
        assert!(QueryStatus::Succeeded.is_terminal());
        assert!(QueryStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&ResourceStatus::TearingDown).expect("serialize");
        assert_eq!(json, "\"tearing_down\"");
    }
}
