//! Bearer tokens minted from the active keypair.

use core::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use demo_mate_core::Principal;
use jsonwebtoken::{Algorithm, Header, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::CredentialError;
use super::keypair::{Fingerprint, Keypair};

/// Claim set carried by every minted token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer (the principal).
    pub iss: String,
    /// Subject (the principal).
    pub sub: String,
    /// Audience (the API host).
    pub aud: String,
    /// Issued at (Unix seconds).
    pub iat: i64,
    /// Expiry (Unix seconds).
    pub exp: i64,
}

/// A signed RS256 token for `Authorization: Bearer`.
pub struct BearerToken {
    value: SecretString,
    audience: String,
    fingerprint: Fingerprint,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("value", &"[REDACTED]")
            .field("audience", &self.audience)
            .field("fingerprint", &self.fingerprint)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl BearerToken {
    /// The encoded token.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    /// Audience the token was minted for.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Fingerprint of the key that signed the token.
    #[must_use]
    pub const fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// When the token was issued.
    #[must_use]
    pub const fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// When the token expires.
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Total validity period.
    #[must_use]
    pub fn lifetime(&self) -> Duration {
        (self.expires_at - self.issued_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Check if the token will expire within the given duration.
    #[must_use]
    pub fn expires_within(&self, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::MAX);
        Utc::now() >= self.expires_at - margin
    }
}

/// Sign a fresh token for `audience` with `keypair`.
pub(super) fn sign(
    keypair: &Keypair,
    principal: &Principal,
    audience: &str,
    lifetime: Duration,
) -> Result<BearerToken, CredentialError> {
    let issued_at = Utc::now();
    let expires_at = issued_at
        + chrono::Duration::from_std(lifetime)
            .map_err(|e| CredentialError::Signing(format!("invalid token lifetime: {e}")))?;

    let claims = Claims {
        iss: principal.to_string(),
        sub: principal.to_string(),
        aud: audience.to_owned(),
        iat: issued_at.timestamp(),
        exp: expires_at.timestamp(),
    };

    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(keypair.fingerprint().to_string());

    let value = encode(&header, &claims, keypair.encoding_key())
        .map_err(|e| CredentialError::Signing(e.to_string()))?;

    Ok(BearerToken {
        value: SecretString::from(value),
        audience: audience.to_owned(),
        fingerprint: keypair.fingerprint().clone(),
        issued_at,
        expires_at,
    })
}
