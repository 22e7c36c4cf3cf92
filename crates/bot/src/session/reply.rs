//! Outcomes of dispatched commands.

use chrono::{DateTime, Utc};
use demo_mate_core::{ConversationKey, ResourceSetId, SessionState};
use serde::Serialize;

use crate::analyst::QueryResult;
use crate::credential::Fingerprint;
use crate::error::BotError;

/// What a command produced, ready to be rendered.
#[derive(Debug)]
pub enum Reply {
    /// The resource set is provisioned and the key registered.
    SetupComplete {
        /// Resource set now ready.
        resource_set: ResourceSetId,
        /// Fingerprint of the registered key.
        fingerprint: Fingerprint,
    },

    /// A question was answered.
    Answer {
        /// The question as asked.
        question: String,
        /// Successful result.
        result: QueryResult,
    },

    /// The resource set and key registration are gone.
    CleanupComplete {
        /// Resource set removed.
        resource_set: ResourceSetId,
        /// Whether a running query was cancelled.
        cancelled_query: bool,
    },

    /// The command failed.
    Failed {
        /// Conversation the command came from.
        conversation: ConversationKey,
        /// Command name.
        operation: &'static str,
        /// What went wrong.
        error: BotError,
    },
}

impl Reply {
    /// Whether the command failed.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Read-only view of one conversation's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Conversation.
    pub conversation: ConversationKey,
    /// Current state.
    pub state: SessionState,
    /// Resource set the session queries, if any.
    pub resource_set: Option<ResourceSetId>,
    /// Whether a query is running.
    pub query_in_flight: bool,
    /// Last time a command touched the session.
    pub last_activity: DateTime<Utc>,
}
