//! Identity-store seam and local persistence of the credential.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use demo_mate_core::Principal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use super::CredentialError;
use super::keypair::{Fingerprint, Keypair};
use crate::backend::BackendError;

/// Backend that holds the public key registered for a principal.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Register `public_key` (base64 DER, no armour) for `principal`,
    /// replacing any previous registration.
    async fn set_public_key(
        &self,
        principal: &Principal,
        public_key: &str,
    ) -> Result<(), BackendError>;

    /// Remove the registered public key for `principal`.
    async fn clear_public_key(&self, principal: &Principal) -> Result<(), BackendError>;
}

/// Metadata written next to the private key so a restart can reuse it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialArtifact {
    /// Account identifier.
    pub account: String,
    /// User name.
    pub user: String,
    /// API host the key is registered against.
    pub host: String,
    /// Where the private key lives.
    pub private_key_path: PathBuf,
    /// Fingerprint of the registered public key.
    pub fingerprint: Fingerprint,
    /// When the key was generated.
    pub created_at: DateTime<Utc>,
}

/// Locations and identity used to persist a credential.
#[derive(Debug, Clone)]
pub struct CredentialFiles {
    /// PKCS#8 PEM private key file.
    pub private_key_path: PathBuf,
    /// JSON artifact file.
    pub artifact_path: PathBuf,
    /// Account identifier recorded in the artifact.
    pub account: String,
    /// User recorded in the artifact.
    pub user: String,
    /// Host recorded in the artifact.
    pub host: String,
}

impl CredentialFiles {
    /// Load a previously saved keypair.
    ///
    /// Returns `Ok(None)` when either file is missing or the artifact's
    /// fingerprint does not match the key on disk.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Storage`] if a file exists but cannot be read
    /// or parsed.
    #[instrument(skip(self), fields(path = %self.artifact_path.display()))]
    pub async fn load(&self) -> Result<Option<Keypair>, CredentialError> {
        let Some(artifact) = read_optional(&self.artifact_path).await? else {
            debug!("No credential artifact on disk");
            return Ok(None);
        };
        let artifact: CredentialArtifact = serde_json::from_str(&artifact)
            .map_err(|e| CredentialError::Storage(format!("invalid credential artifact: {e}")))?;

        let Some(pem) = read_optional(&artifact.private_key_path).await? else {
            debug!("Credential artifact points at a missing private key");
            return Ok(None);
        };
        let keypair = Keypair::from_pkcs8_pem(SecretString::from(pem))?;

        if keypair.fingerprint() != &artifact.fingerprint {
            debug!(
                expected = %artifact.fingerprint,
                actual = %keypair.fingerprint(),
                "Private key does not match artifact"
            );
            return Ok(None);
        }

        Ok(Some(keypair))
    }

    /// Write the private key (owner-only permissions) and the artifact.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Storage`] on any filesystem failure.
    #[instrument(skip(self, keypair), fields(fingerprint = %keypair.fingerprint()))]
    pub async fn save(&self, keypair: &Keypair) -> Result<(), CredentialError> {
        create_parent(&self.private_key_path).await?;
        create_parent(&self.artifact_path).await?;

        write_private(&self.private_key_path, keypair.private_pem()).await?;

        let artifact = CredentialArtifact {
            account: self.account.clone(),
            user: self.user.clone(),
            host: self.host.clone(),
            private_key_path: self.private_key_path.clone(),
            fingerprint: keypair.fingerprint().clone(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&artifact)
            .map_err(|e| CredentialError::Storage(e.to_string()))?;
        tokio::fs::write(&self.artifact_path, json).await?;

        debug!("Saved credential files");
        Ok(())
    }

    /// Delete both files. Missing files are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Storage`] if a file exists but cannot be removed.
    pub async fn remove(&self) -> Result<(), CredentialError> {
        remove_optional(&self.private_key_path).await?;
        remove_optional(&self.artifact_path).await
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, CredentialError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_optional(path: &Path) -> Result<(), CredentialError> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

async fn create_parent(path: &Path) -> Result<(), CredentialError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

async fn write_private(path: &Path, pem: &SecretString) -> Result<(), CredentialError> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(pem.expose_secret().as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const KEY_A: &str = include_str!("../../testdata/rsa_key_a.p8");
    const KEY_B: &str = include_str!("../../testdata/rsa_key_b.p8");

    fn files(dir: &Path) -> CredentialFiles {
        CredentialFiles {
            private_key_path: dir.join("keys").join("bot_rsa_key.p8"),
            artifact_path: dir.join("bot.json"),
            account: "xy12345".to_string(),
            user: "demo_bot".to_string(),
            host: "xy12345.snowflakecomputing.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let files = files(dir.path());
        let keypair = Keypair::from_pkcs8_pem(SecretString::from(KEY_A)).unwrap();

        files.save(&keypair).await.unwrap();
        let loaded = files.load().await.unwrap().unwrap();
        assert_eq!(loaded.fingerprint(), keypair.fingerprint());

        let artifact: CredentialArtifact =
            serde_json::from_str(&std::fs::read_to_string(&files.artifact_path).unwrap()).unwrap();
        assert_eq!(artifact.user, "demo_bot");
        assert_eq!(artifact.private_key_path, files.private_key_path);
        assert_eq!(&artifact.fingerprint, keypair.fingerprint());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let files = files(dir.path());
        let keypair = Keypair::from_pkcs8_pem(SecretString::from(KEY_A)).unwrap();
        files.save(&keypair).await.unwrap();

        let mode = std::fs::metadata(&files.private_key_path)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(files(dir.path()).load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_rejects_mismatched_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let files = files(dir.path());
        let keypair = Keypair::from_pkcs8_pem(SecretString::from(KEY_A)).unwrap();
        files.save(&keypair).await.unwrap();

        // Swap the key behind the artifact's back
        std::fs::write(&files.private_key_path, KEY_B).unwrap();
        assert!(files.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let files = files(dir.path());
        let keypair = Keypair::from_pkcs8_pem(SecretString::from(KEY_A)).unwrap();
        files.save(&keypair).await.unwrap();

        files.remove().await.unwrap();
        files.remove().await.unwrap();
        assert!(!files.private_key_path.exists());
        assert!(!files.artifact_path.exists());
    }
}
