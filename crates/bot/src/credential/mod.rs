//! Keypair lifecycle and bearer-token minting.
//!
//! The [`CredentialManager`] owns the single active RSA keypair for the bot's
//! principal. It generates a key on demand, registers the public half with an
//! [`IdentityStore`], persists the private half locally, and mints short-lived
//! RS256 tokens from it.
//!
//! # Token cache
//!
//! Tokens are cached per audience in a `moka` cache. Each entry expires
//! `token_lifetime - token_refresh_margin` after it was minted, so callers
//! never receive a token that is about to lapse. `try_get_with` coalesces
//! concurrent misses into one mint.

mod error;
mod keypair;
mod store;
mod token;

pub use error::CredentialError;
pub use keypair::{Fingerprint, KeyGenerator, Keypair, RsaKeyGenerator};
pub use store::{CredentialArtifact, CredentialFiles, IdentityStore};
pub use token::{BearerToken, Claims};

use std::sync::Arc;
use std::time::Duration;

use demo_mate_core::Principal;
use moka::Expiry;
use moka::future::Cache;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::config::Tunables;

/// Timing knobs for the credential manager.
#[derive(Debug, Clone, Copy)]
pub struct CredentialSettings {
    /// Validity period of minted tokens.
    pub token_lifetime: Duration,
    /// How long before expiry a cached token is replaced.
    pub refresh_margin: Duration,
    /// Upper bound for a mint or a registration call.
    pub mint_timeout: Duration,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self::from(&Tunables::default())
    }
}

impl From<&Tunables> for CredentialSettings {
    fn from(tunables: &Tunables) -> Self {
        Self {
            token_lifetime: tunables.token_lifetime,
            refresh_margin: tunables.token_refresh_margin,
            mint_timeout: tunables.token_mint_timeout,
        }
    }
}

struct TokenExpiry {
    refresh_margin: Duration,
}

impl Expiry<String, Arc<BearerToken>> for TokenExpiry {
    fn expire_after_create(
        &self,
        _audience: &String,
        token: &Arc<BearerToken>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(token.lifetime().saturating_sub(self.refresh_margin))
    }
}

struct ActiveKey {
    keypair: Arc<Keypair>,
    registered: bool,
    valid: bool,
}

// =============================================================================
// CredentialManager
// =============================================================================

/// Owns the bot's keypair and mints bearer tokens from it.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<CredentialManagerInner>,
}

struct CredentialManagerInner {
    principal: Principal,
    identity: Arc<dyn IdentityStore>,
    generator: Arc<dyn KeyGenerator>,
    files: Option<CredentialFiles>,
    settings: CredentialSettings,
    active: RwLock<Option<ActiveKey>>,
    ensure_lock: Mutex<()>,
    tokens: Cache<String, Arc<BearerToken>>,
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("principal", &self.inner.principal)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl CredentialManager {
    /// Create a manager with no key loaded.
    ///
    /// `files` is where the key is persisted; `None` keeps it in memory only.
    #[must_use]
    pub fn new(
        principal: Principal,
        identity: Arc<dyn IdentityStore>,
        generator: Arc<dyn KeyGenerator>,
        files: Option<CredentialFiles>,
        settings: CredentialSettings,
    ) -> Self {
        let tokens = Cache::builder()
            .max_capacity(64)
            .expire_after(TokenExpiry {
                refresh_margin: settings.refresh_margin,
            })
            .build();

        Self {
            inner: Arc::new(CredentialManagerInner {
                principal,
                identity,
                generator,
                files,
                settings,
                active: RwLock::new(None),
                ensure_lock: Mutex::new(()),
                tokens,
            }),
        }
    }

    /// The principal tokens are minted for.
    #[must_use]
    pub fn principal(&self) -> &Principal {
        &self.inner.principal
    }

    /// Fingerprint of the active keypair, if one is loaded.
    pub async fn fingerprint(&self) -> Option<Fingerprint> {
        self.inner
            .active
            .read()
            .await
            .as_ref()
            .map(|active| active.keypair.fingerprint().clone())
    }

    /// Make sure a valid, registered keypair is active.
    ///
    /// Generates a new key only when none is loaded or the current one was
    /// invalidated. A key that was generated but whose registration failed is
    /// registered again rather than replaced. Concurrent callers are
    /// serialised, so the first call generates and registers once.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::GenerationFailed`],
    /// [`CredentialError::RegistrationFailed`] or [`CredentialError::Timeout`].
    #[instrument(skip(self), fields(principal = %self.inner.principal))]
    pub async fn ensure_keypair(&self) -> Result<Fingerprint, CredentialError> {
        let _guard = self.inner.ensure_lock.lock().await;

        let pending = {
            let active = self.inner.active.read().await;
            match active.as_ref() {
                Some(active) if active.valid && active.registered => {
                    return Ok(active.keypair.fingerprint().clone());
                }
                Some(active) if active.valid => Some(Arc::clone(&active.keypair)),
                _ => None,
            }
        };

        let (keypair, generated) = match pending {
            Some(keypair) => {
                debug!(fingerprint = %keypair.fingerprint(), "Retrying registration of existing key");
                (keypair, false)
            }
            None => {
                let keypair = Arc::new(self.generate().await?);
                info!(fingerprint = %keypair.fingerprint(), "Generated new keypair");
                *self.inner.active.write().await = Some(ActiveKey {
                    keypair: Arc::clone(&keypair),
                    registered: false,
                    valid: true,
                });
                self.inner.tokens.invalidate_all();
                (keypair, true)
            }
        };

        self.register(&keypair).await?;

        if let Some(active) = self.inner.active.write().await.as_mut()
            && Arc::ptr_eq(&active.keypair, &keypair)
        {
            active.registered = true;
        }

        if generated && let Some(files) = &self.inner.files {
            // The key is usable even if persisting it fails; a restart will
            // simply generate and register a new one.
            if let Err(e) = files.save(&keypair).await {
                warn!(error = %e, "Failed to persist credential");
            }
        }

        info!(fingerprint = %keypair.fingerprint(), "Public key registered");
        Ok(keypair.fingerprint().clone())
    }

    /// Reuse the key saved on disk, or fall back to [`Self::ensure_keypair`].
    ///
    /// The saved key is only read while no key is active, so repeated calls
    /// keep the cached tokens and never revive an invalidated key. A saved key
    /// is trusted to be registered already.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Self::ensure_keypair`].
    #[instrument(skip(self), fields(principal = %self.inner.principal))]
    pub async fn load_or_ensure(&self) -> Result<Fingerprint, CredentialError> {
        if let Some(files) = &self.inner.files {
            let _guard = self.inner.ensure_lock.lock().await;
            let mut active = self.inner.active.write().await;
            if active.is_none() {
                match files.load().await {
                    Ok(Some(keypair)) => {
                        let fingerprint = keypair.fingerprint().clone();
                        *active = Some(ActiveKey {
                            keypair: Arc::new(keypair),
                            registered: true,
                            valid: true,
                        });
                        drop(active);
                        self.inner.tokens.invalidate_all();
                        info!(fingerprint = %fingerprint, "Loaded saved keypair");
                        return Ok(fingerprint);
                    }
                    Ok(None) => debug!("No usable saved keypair"),
                    Err(e) => warn!(error = %e, "Ignoring unreadable saved keypair"),
                }
            }
        }
        self.ensure_keypair().await
    }

    /// Get a bearer token for `audience`, minting one if the cached token is
    /// missing or inside its refresh margin.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Timeout`] if minting exceeds
    /// `mint_timeout`, or the error of key generation, registration or signing.
    #[instrument(skip(self), fields(principal = %self.inner.principal))]
    pub async fn mint_token(&self, audience: &str) -> Result<Arc<BearerToken>, CredentialError> {
        let mint = self
            .inner
            .tokens
            .try_get_with(audience.to_owned(), self.mint_uncached(audience));

        match tokio::time::timeout(self.inner.settings.mint_timeout, mint).await {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(e)) => Err((*e).clone()),
            Err(_) => Err(CredentialError::Timeout {
                operation: "token mint",
                after: self.inner.settings.mint_timeout,
            }),
        }
    }

    /// Drop the cached token for `audience` and mint a new one.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Self::mint_token`].
    #[instrument(skip(self), fields(principal = %self.inner.principal))]
    pub async fn refresh(&self, audience: &str) -> Result<Arc<BearerToken>, CredentialError> {
        self.inner.tokens.invalidate(audience).await;
        self.mint_token(audience).await
    }

    /// Mark the active keypair invalid so the next use rotates it, and drop
    /// every cached token.
    #[instrument(skip(self), fields(principal = %self.inner.principal))]
    pub async fn invalidate(&self) {
        if let Some(active) = self.inner.active.write().await.as_mut() {
            active.valid = false;
        }
        self.inner.tokens.invalidate_all();
        info!("Keypair invalidated");
    }

    /// Remove the public key from the identity store and forget the local key.
    ///
    /// Local state is kept if the backend call fails, so the call can be
    /// repeated.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::RegistrationFailed`] or
    /// [`CredentialError::Timeout`] if the backend did not clear the key.
    #[instrument(skip(self), fields(principal = %self.inner.principal))]
    pub async fn clear(&self) -> Result<(), CredentialError> {
        let _guard = self.inner.ensure_lock.lock().await;
        let timeout = self.inner.settings.mint_timeout;

        tokio::time::timeout(
            timeout,
            self.inner.identity.clear_public_key(&self.inner.principal),
        )
        .await
        .map_err(|_| CredentialError::Timeout {
            operation: "public key removal",
            after: timeout,
        })?
        .map_err(|e| CredentialError::registration(&e))?;

        *self.inner.active.write().await = None;
        self.inner.tokens.invalidate_all();

        if let Some(files) = &self.inner.files
            && let Err(e) = files.remove().await
        {
            warn!(error = %e, "Failed to remove credential files");
        }

        info!("Public key cleared");
        Ok(())
    }

    async fn generate(&self) -> Result<Keypair, CredentialError> {
        let generator = Arc::clone(&self.inner.generator);
        tokio::task::spawn_blocking(move || Keypair::from_pkcs8_pem(generator.generate()?))
            .await
            .map_err(|e| CredentialError::GenerationFailed(e.to_string()))?
    }

    async fn register(&self, keypair: &Keypair) -> Result<(), CredentialError> {
        let timeout = self.inner.settings.mint_timeout;
        tokio::time::timeout(
            timeout,
            self.inner
                .identity
                .set_public_key(&self.inner.principal, keypair.public_key_body()),
        )
        .await
        .map_err(|_| CredentialError::Timeout {
            operation: "public key registration",
            after: timeout,
        })?
        .map_err(|e| CredentialError::registration(&e))
    }

    async fn current_keypair(&self) -> Result<Arc<Keypair>, CredentialError> {
        {
            let active = self.inner.active.read().await;
            if let Some(active) = active.as_ref()
                && active.valid
                && active.registered
            {
                return Ok(Arc::clone(&active.keypair));
            }
        }

        self.ensure_keypair().await?;

        self.inner
            .active
            .read()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.keypair))
            .ok_or_else(|| CredentialError::GenerationFailed("no active keypair".to_string()))
    }

    async fn mint_uncached(&self, audience: &str) -> Result<Arc<BearerToken>, CredentialError> {
        let keypair = self.current_keypair().await?;
        let token = token::sign(
            &keypair,
            &self.inner.principal,
            audience,
            self.inner.settings.token_lifetime,
        )?;
        debug!(audience, expires_at = %token.expires_at(), "Minted bearer token");
        Ok(Arc::new(token))
    }
}
