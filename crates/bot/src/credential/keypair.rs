//! RSA keypairs and public-key fingerprints.

use core::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::rand_core::OsRng;
use rsa::{RsaPrivateKey, RsaPublicKey};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::CredentialError;

/// SHA-256 fingerprint of a DER-encoded `SubjectPublicKeyInfo`, in the
/// `SHA256:<base64>` form the warehouse reports for registered keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a DER-encoded public key.
    #[must_use]
    pub fn of_der(der: &[u8]) -> Self {
        Self(format!("SHA256:{}", STANDARD.encode(Sha256::digest(der))))
    }

    /// Returns the fingerprint as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of new private keys.
///
/// Generation is CPU-bound; callers run it on the blocking pool.
pub trait KeyGenerator: Send + Sync {
    /// Generate a private key, returned as PKCS#8 PEM.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::GenerationFailed`] if no key could be produced.
    fn generate(&self) -> Result<SecretString, CredentialError>;
}

/// Generates RSA keys from the operating system's random source.
#[derive(Debug, Clone, Copy)]
pub struct RsaKeyGenerator {
    bits: usize,
}

impl RsaKeyGenerator {
    /// Modulus size used unless configured otherwise.
    pub const DEFAULT_BITS: usize = 2048;

    /// Create a generator for keys of `bits` modulus size.
    #[must_use]
    pub const fn new(bits: usize) -> Self {
        Self { bits }
    }
}

impl Default for RsaKeyGenerator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BITS)
    }
}

impl KeyGenerator for RsaKeyGenerator {
    fn generate(&self) -> Result<SecretString, CredentialError> {
        let private = RsaPrivateKey::new(&mut OsRng, self.bits)
            .map_err(|e| CredentialError::GenerationFailed(e.to_string()))?;
        let pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CredentialError::GenerationFailed(e.to_string()))?;
        Ok(SecretString::from(pem.as_str()))
    }
}

/// A loaded RSA keypair.
///
/// The private half is only reachable inside the credential module.
pub struct Keypair {
    private_pem: SecretString,
    encoding_key: EncodingKey,
    public_key: RsaPublicKey,
    public_key_body: String,
    fingerprint: Fingerprint,
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("fingerprint", &self.fingerprint)
            .field("private_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl Keypair {
    /// Load a keypair from a PKCS#8 PEM private key.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Storage`] if the PEM is not an RSA key.
    pub fn from_pkcs8_pem(pem: SecretString) -> Result<Self, CredentialError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem.expose_secret())
            .map_err(|e| CredentialError::Storage(format!("invalid private key: {e}")))?;
        let pkcs1 = private
            .to_pkcs1_der()
            .map_err(|e| CredentialError::Storage(format!("invalid private key: {e}")))?;
        let encoding_key = EncodingKey::from_rsa_der(pkcs1.as_bytes());

        let public_key = RsaPublicKey::from(&private);
        let spki = public_key
            .to_public_key_der()
            .map_err(|e| CredentialError::Storage(format!("invalid public key: {e}")))?;

        Ok(Self {
            private_pem: pem,
            encoding_key,
            public_key_body: STANDARD.encode(spki.as_bytes()),
            fingerprint: Fingerprint::of_der(spki.as_bytes()),
            public_key,
        })
    }

    /// Fingerprint of the public half.
    #[must_use]
    pub const fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Base64 DER of the public key, without PEM armour, as the identity
    /// store expects it.
    #[must_use]
    pub fn public_key_body(&self) -> &str {
        &self.public_key_body
    }

    /// Key for verifying tokens signed by this keypair.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Signing`] if the public key cannot be encoded.
    pub fn decoding_key(&self) -> Result<DecodingKey, CredentialError> {
        let der = self
            .public_key
            .to_pkcs1_der()
            .map_err(|e| CredentialError::Signing(e.to_string()))?;
        Ok(DecodingKey::from_rsa_der(der.as_bytes()))
    }

    pub(super) const fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    pub(super) const fn private_pem(&self) -> &SecretString {
        &self.private_pem
    }
}
