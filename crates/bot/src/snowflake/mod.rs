//! Snowflake implementations of the backend seams.
//!
//! Everything goes through the REST APIs: the SQL API for DDL, key
//! registration and generated queries, and the Cortex Analyst message
//! endpoint for questions.

mod analyst;
mod client;
mod identity;
mod provisioning;
mod types;

pub use analyst::CortexAnalystBackend;
pub use client::{Auth, ResultSet, SnowflakeClient, StatementOutcome};
pub use identity::SnowflakeIdentityStore;
pub use provisioning::SnowflakeProvisioningBackend;

/// Quote an identifier, doubling any embedded quotes.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("DEMO_BOT"), "\"DEMO_BOT\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }
}
