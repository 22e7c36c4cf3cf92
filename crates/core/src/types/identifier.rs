//! SQL identifier and resource-set types.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Errors that can occur when parsing a [`SqlIdentifier`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    /// The input string is empty.
    #[error("identifier cannot be empty")]
    Empty,
    /// The input string is too long.
    #[error("identifier must be at most {max} characters")]
    TooLong {
        /// Maximum allowed length.
        max: usize,
    },
    /// The first character is not a letter or underscore.
    #[error("identifier must start with a letter or underscore: {0}")]
    InvalidStart(String),
    /// The input contains a character outside `[A-Za-z0-9_$]`.
    #[error("identifier contains invalid character '{character}': {value}")]
    InvalidCharacter {
        /// Offending character.
        character: char,
        /// Full input.
        value: String,
    },
}

/// An unquoted SQL identifier (database, schema or stage name).
///
/// ## Constraints
///
/// - Length: 1-255 characters
/// - First character: ASCII letter or underscore
/// - Remaining characters: ASCII letters, digits, underscore or `$`
///
/// Only identifiers passing these rules are ever interpolated into
/// statements, so no quoting is required.
///
/// ## Examples
///
/// ```
/// use demo_mate_core::SqlIdentifier;
///
/// assert!(SqlIdentifier::parse("demo_db").is_ok());
/// assert!(SqlIdentifier::parse("").is_err());
/// assert!(SqlIdentifier::parse("1abc").is_err());
/// assert!(SqlIdentifier::parse("db; DROP").is_err());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct SqlIdentifier(String);

impl SqlIdentifier {
    /// Maximum length of an identifier.
    pub const MAX_LENGTH: usize = 255;

    /// Parse an identifier from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is empty, too long, or contains
    /// characters outside the unquoted identifier alphabet.
    pub fn parse(s: &str) -> Result<Self, IdentifierError> {
        let mut chars = s.chars();
        let first = chars.next().ok_or(IdentifierError::Empty)?;

        if s.len() > Self::MAX_LENGTH {
            return Err(IdentifierError::TooLong {
                max: Self::MAX_LENGTH,
            });
        }

        if !(first.is_ascii_alphabetic() || first == '_') {
            return Err(IdentifierError::InvalidStart(s.to_owned()));
        }

        if let Some(character) =
            chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '$'))
        {
            return Err(IdentifierError::InvalidCharacter {
                character,
                value: s.to_owned(),
            });
        }

        Ok(Self(s.to_owned()))
    }

    /// Returns the identifier as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the identifier as the warehouse stores it (upper-cased).
    #[must_use]
    pub fn normalized(&self) -> String {
        self.0.to_uppercase()
    }
}

impl fmt::Display for SqlIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SqlIdentifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SqlIdentifier {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SqlIdentifier> for String {
    fn from(id: SqlIdentifier) -> Self {
        id.0
    }
}

impl AsRef<str> for SqlIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifies the resource set (database + schema) a conversation queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceSetId {
    /// Database holding the schema.
    pub database: SqlIdentifier,
    /// Schema holding the stage and semantic model.
    pub schema: SqlIdentifier,
}

impl ResourceSetId {
    /// Default database name used when `/setup` carries no arguments.
    pub const DEFAULT_DATABASE: &'static str = "demo_db";
    /// Default schema name used when `/setup` carries no arguments.
    pub const DEFAULT_SCHEMA: &'static str = "data";

    /// Parse a resource-set id from database and schema names.
    ///
    /// # Errors
    ///
    /// Returns an error if either name is not a valid identifier.
    pub fn parse(database: &str, schema: &str) -> Result<Self, IdentifierError> {
        Ok(Self {
            database: SqlIdentifier::parse(database)?,
            schema: SqlIdentifier::parse(schema)?,
        })
    }

    /// Fully qualified `DATABASE.SCHEMA` name.
    #[must_use]
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.database, self.schema)
    }
}

impl Default for ResourceSetId {
    fn default() -> Self {
        Self {
            database: SqlIdentifier(Self::DEFAULT_DATABASE.to_owned()),
            schema: SqlIdentifier(Self::DEFAULT_SCHEMA.to_owned()),
        }
    }
}

impl fmt::Display for ResourceSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.schema)
    }
}
