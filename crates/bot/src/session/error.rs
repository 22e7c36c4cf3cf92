//! Session state errors.

use demo_mate_core::SessionState;
use thiserror::Error;

/// A command arrived in a state that cannot accept it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Another operation is running for the conversation.
    #[error("this conversation is busy ({state}); wait for it to finish")]
    Busy {
        /// What is running.
        state: SessionState,
    },

    /// A query arrived before setup completed.
    #[error("no resource set is ready here; run /setup first")]
    NotReady,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_names_state() {
        let err = SessionError::Busy {
            state: SessionState::Provisioning,
        };
        assert_eq!(
            err.to_string(),
            "this conversation is busy (provisioning); wait for it to finish"
        );
    }
}
