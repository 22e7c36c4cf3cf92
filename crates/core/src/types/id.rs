//! Identifiers for conversations, query requests and backend principals.
//!
//! Use the `define_uuid_id!` macro to create type-safe ID wrappers that
//! prevent accidentally mixing IDs from different entity types.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Macro to define a type-safe UUID wrapper.
///
/// Creates a newtype wrapper around `Uuid` with:
/// - `Serialize`/`Deserialize` with `#[serde(transparent)]`
/// - `Debug`, `Clone`, `Copy`, `PartialEq`, `Eq`, `Hash`
/// - Conversion methods: `new()` (random v4), `as_uuid()`
/// - `From<Uuid>` and `Into<Uuid>` implementations
///
/// # Example
///
/// ```rust
/// # use demo_mate_core::define_uuid_id;
/// define_uuid_id!(RequestId);
///
/// let a = RequestId::new();
/// let b = RequestId::new();
/// assert_ne!(a, b);
/// ```
#[macro_export]
macro_rules! define_uuid_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            ::serde::Serialize,
            ::serde::Deserialize
        )]
        #[serde(transparent)]
        pub struct $name(::uuid::Uuid);

        impl $name {
            /// Create a new random ID.
            #[must_use]
            pub fn new() -> Self {
                Self(::uuid::Uuid::new_v4())
            }

            /// Get the underlying UUID value.
            #[must_use]
            pub const fn as_uuid(&self) -> ::uuid::Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl ::core::fmt::Display for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<::uuid::Uuid> for $name {
            fn from(id: ::uuid::Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for ::uuid::Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_uuid_id!(CorrelationId);

/// Identifies one chat conversation: a channel, optionally narrowed to a thread.
///
/// All commands carrying the same key share one session state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    /// Chat channel ID (e.g. `C0123456789`).
    pub channel: String,
    /// Thread timestamp, when the command was issued inside a thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

impl ConversationKey {
    /// Create a key for a whole channel.
    #[must_use]
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            thread: None,
        }
    }

    /// Create a key for a thread inside a channel.
    #[must_use]
    pub fn thread(channel: impl Into<String>, thread: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            thread: Some(thread.into()),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.thread {
            Some(thread) => write!(f, "{}/{thread}", self.channel),
            None => write!(f, "{}", self.channel),
        }
    }
}

/// The backend identity the bot authenticates as, in `ACCOUNT.USER` form.
///
/// The account part drops any region/cloud suffix (`xy12345.us-east-1` becomes
/// `XY12345`) and both parts are upper-cased, which is the form the warehouse
/// expects in key-pair token claims.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    /// Build the principal for an account and user.
    #[must_use]
    pub fn new(account: &str, user: &str) -> Self {
        let account = account.split('.').next().unwrap_or(account);
        Self(format!(
            "{}.{}",
            account.to_uppercase(),
            user.to_uppercase()
        ))
    }

    /// Returns the principal as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the user part of the principal.
    #[must_use]
    pub fn user(&self) -> &str {
        self.0.split_once('.').map_or("", |(_, user)| user)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Principal {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_ids_are_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn test_conversation_key_display() {
        assert_eq!(ConversationKey::channel("C123").to_string(), "C123");
        assert_eq!(
            ConversationKey::thread("C123", "1700000000.000100").to_string(),
            "C123/1700000000.000100"
        );
    }

    #[test]
    fn test_conversation_keys_differ_by_thread() {
        assert_ne!(
            ConversationKey::channel("C123"),
            ConversationKey::thread("C123", "1.2")
        );
    }

    #[test]
    fn test_principal_strips_region_and_uppercases() {
        let principal = Principal::new("xy12345.us-east-1", "demo_bot");
        assert_eq!(principal.as_str(), "XY12345.DEMO_BOT");
        assert_eq!(principal.user(), "DEMO_BOT");
    }

    #[test]
    fn test_principal_org_account() {
        let principal = Principal::new("myorg-myaccount", "analyst");
        assert_eq!(principal.as_str(), "MYORG-MYACCOUNT.ANALYST");
    }
}
