//! Per-conversation state machine routing commands to the components.
//!
//! ```text
//! Idle -> Provisioning -> Ready <-> Querying
//!   ^                      |
//!   +----- TearingDown <---+
//! ```
//!
//! Each conversation has its own session record behind its own lock. The
//! lock is only held while a state transition is made, never across a
//! backend call, so conversations never wait on each other. A command that
//! arrives while the conversation is busy is rejected, not queued.
//!
//! Cleanup may interrupt a running query. It bumps the session epoch, and a
//! query that finishes under an older epoch discards its result.

mod error;
mod reply;

pub use error::SessionError;
pub use reply::{Reply, SessionSnapshot};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use demo_mate_core::{
    Command, CommandKind, ConversationKey, CorrelationId, ResourceSetId, SessionState,
};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::analyst::{AnalystQueryExecutor, QueryError, QueryRequest, QueryResult, Submission};
use crate::config::Tunables;
use crate::credential::{BearerToken, CredentialManager};
use crate::error::BotError;
use crate::provision::{ResourceProvisioner, SemanticModelRef, StepProgress};

/// Router knobs.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Audience minted tokens are addressed to.
    pub audience: String,
    /// Upper bound for waiting on a pending query.
    pub query_timeout: Duration,
    /// Idle sessions older than this are evicted.
    pub idle_timeout: Duration,
}

impl RouterSettings {
    /// Settings for `audience` with timings from `tunables`.
    #[must_use]
    pub fn new(audience: impl Into<String>, tunables: &Tunables) -> Self {
        Self {
            audience: audience.into(),
            query_timeout: tunables.query_timeout,
            idle_timeout: tunables.session_idle_timeout,
        }
    }
}

#[derive(Debug)]
struct InFlightQuery {
    correlation_id: CorrelationId,
    handle: Option<String>,
    cancel: Option<CancellationToken>,
}

#[derive(Debug)]
struct ConversationSession {
    key: ConversationKey,
    state: SessionState,
    resource_set: Option<ResourceSetId>,
    epoch: u64,
    in_flight: Option<InFlightQuery>,
    last_activity: DateTime<Utc>,
}

impl ConversationSession {
    fn new(key: ConversationKey) -> Self {
        Self {
            key,
            state: SessionState::Idle,
            resource_set: None,
            epoch: 0,
            in_flight: None,
            last_activity: Utc::now(),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            conversation: self.key.clone(),
            state: self.state,
            resource_set: self.resource_set.clone(),
            query_in_flight: self.in_flight.is_some(),
            last_activity: self.last_activity,
        }
    }
}

type SessionHandle = Arc<Mutex<ConversationSession>>;

fn lock(session: &Mutex<ConversationSession>) -> MutexGuard<'_, ConversationSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// SessionRouter
// =============================================================================

/// Routes commands through the per-conversation state machine.
#[derive(Clone)]
pub struct SessionRouter {
    inner: Arc<SessionRouterInner>,
}

struct SessionRouterInner {
    credentials: CredentialManager,
    provisioner: ResourceProvisioner,
    executor: AnalystQueryExecutor,
    settings: RouterSettings,
    sessions: Mutex<HashMap<ConversationKey, SessionHandle>>,
}

impl std::fmt::Debug for SessionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRouter")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl SessionRouter {
    /// Create a router over the three components.
    #[must_use]
    pub fn new(
        credentials: CredentialManager,
        provisioner: ResourceProvisioner,
        executor: AnalystQueryExecutor,
        settings: RouterSettings,
    ) -> Self {
        Self {
            inner: Arc::new(SessionRouterInner {
                credentials,
                provisioner,
                executor,
                settings,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The credential manager commands authenticate with.
    #[must_use]
    pub fn credentials(&self) -> &CredentialManager {
        &self.inner.credentials
    }

    /// The provisioner commands use.
    #[must_use]
    pub fn provisioner(&self) -> &ResourceProvisioner {
        &self.inner.provisioner
    }

    /// Audience minted tokens are addressed to.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.inner.settings.audience
    }

    /// Run `command` and report its outcome.
    ///
    /// Never fails: errors come back as [`Reply::Failed`].
    pub async fn dispatch(&self, command: &Command) -> Reply {
        self.dispatch_reporting(command, None).await
    }

    /// [`Self::dispatch`], sending setup steps to `progress` as they finish.
    ///
    /// The sender is dropped when the command completes, which closes the
    /// channel.
    #[instrument(
        skip(self, command, progress),
        fields(conversation = %command.conversation, command = command.kind.name())
    )]
    pub async fn dispatch_reporting(
        &self,
        command: &Command,
        progress: Option<UnboundedSender<StepProgress>>,
    ) -> Reply {
        let key = &command.conversation;
        let result = match &command.kind {
            CommandKind::Setup { resource_set } => {
                self.setup(key, resource_set, progress.as_ref()).await
            }
            CommandKind::Query { question } => self.query(key, question).await,
            CommandKind::Cleanup { resource_set } => self.cleanup(key, resource_set.as_ref()).await,
        };

        result.unwrap_or_else(|error| {
            error.report(command.kind.name());
            Reply::Failed {
                conversation: key.clone(),
                operation: command.kind.name(),
                error,
            }
        })
    }

    /// Current view of a conversation, if it has a session.
    #[must_use]
    pub fn snapshot(&self, key: &ConversationKey) -> Option<SessionSnapshot> {
        let session = self.existing(key)?;
        let snapshot = lock(&session).snapshot();
        Some(snapshot)
    }

    /// Views of every session.
    #[must_use]
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<SessionHandle> = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        sessions.iter().map(|s| lock(s).snapshot()).collect()
    }

    /// Drop idle and ready sessions untouched since `idle_timeout` before
    /// `now`. Returns how many were dropped.
    ///
    /// Busy sessions, and sessions a command is currently holding, are kept.
    pub fn evict_stale(&self, now: DateTime<Utc>) -> usize {
        let idle_timeout =
            TimeDelta::from_std(self.inner.settings.idle_timeout).unwrap_or(TimeDelta::MAX);
        let mut sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();

        sessions.retain(|_, session| {
            if Arc::strong_count(session) > 1 {
                return true;
            }
            let session = lock(session);
            session.state.is_busy() || now - session.last_activity <= idle_timeout
        });

        let evicted = before - sessions.len();
        if evicted > 0 {
            info!(evicted, "Evicted stale sessions");
        }
        evicted
    }

    fn session(&self, key: &ConversationKey) -> SessionHandle {
        let mut sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            sessions
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(ConversationSession::new(key.clone())))),
        )
    }

    fn existing(&self, key: &ConversationKey) -> Option<SessionHandle> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    async fn token(&self) -> Result<Arc<BearerToken>, BotError> {
        Ok(self
            .inner
            .credentials
            .mint_token(&self.inner.settings.audience)
            .await?)
    }

    // =========================================================================
    // Setup
    // =========================================================================

    async fn setup(
        &self,
        key: &ConversationKey,
        id: &ResourceSetId,
        progress: Option<&UnboundedSender<StepProgress>>,
    ) -> Result<Reply, BotError> {
        let session = self.session(key);
        {
            let mut s = lock(&session);
            match s.state {
                SessionState::Idle | SessionState::Ready => {
                    s.state = SessionState::Provisioning;
                    // Recorded up front so a cleanup after a partial failure
                    // targets this set
                    s.resource_set = Some(id.clone());
                    s.last_activity = Utc::now();
                }
                state => return Err(SessionError::Busy { state }.into()),
            }
        }

        let outcome = self.run_setup(id, progress).await;

        let mut s = lock(&session);
        s.last_activity = Utc::now();
        s.state = if outcome.is_ok() {
            SessionState::Ready
        } else {
            SessionState::Idle
        };
        drop(s);
        outcome
    }

    async fn run_setup(
        &self,
        id: &ResourceSetId,
        progress: Option<&UnboundedSender<StepProgress>>,
    ) -> Result<Reply, BotError> {
        let fingerprint = self.inner.credentials.load_or_ensure().await?;
        let token = self.token().await?;
        let provisioned = self
            .inner
            .provisioner
            .provision_reporting(id, &token, progress)
            .await?;
        info!(resource_set = %provisioned.id, %fingerprint, "Setup complete");
        Ok(Reply::SetupComplete {
            resource_set: provisioned.id,
            fingerprint,
        })
    }

    // =========================================================================
    // Query
    // =========================================================================

    async fn query(&self, key: &ConversationKey, question: &str) -> Result<Reply, BotError> {
        let request = QueryRequest::new(question, key.clone());
        let session = self.session(key);
        let (epoch, model) = {
            let mut s = lock(&session);
            match (s.state, s.resource_set.clone()) {
                (SessionState::Ready, Some(id)) => {
                    s.state = SessionState::Querying;
                    s.in_flight = Some(InFlightQuery {
                        correlation_id: request.correlation_id,
                        handle: None,
                        cancel: None,
                    });
                    s.last_activity = Utc::now();
                    (s.epoch, self.inner.provisioner.semantic_model(&id))
                }
                (SessionState::Idle | SessionState::Ready, _) => {
                    return Err(SessionError::NotReady.into());
                }
                (state, _) => return Err(SessionError::Busy { state }.into()),
            }
        };

        let outcome = self.run_query(&session, epoch, &request, &model).await;

        let mut s = lock(&session);
        if s.epoch != epoch {
            debug!(correlation_id = %request.correlation_id, "Discarding result of interrupted query");
            return Err(QueryError::Cancelled.into());
        }
        s.state = SessionState::Ready;
        s.in_flight = None;
        s.last_activity = Utc::now();
        drop(s);

        let mut result = outcome?;
        if let Some(error) = result.error.take() {
            return Err(error.into());
        }
        Ok(Reply::Answer {
            question: request.question,
            result,
        })
    }

    /// Ask once, and once more with a fresh token if the first was rejected.
    async fn run_query(
        &self,
        session: &SessionHandle,
        epoch: u64,
        request: &QueryRequest,
        model: &SemanticModelRef,
    ) -> Result<QueryResult, BotError> {
        let token = self.token().await?;
        match self.ask(session, epoch, request, model, &token).await {
            Err(e) if e.is_auth_failure() => {
                warn!(error = %e, "Token rejected, refreshing and retrying once");
                let token = self
                    .inner
                    .credentials
                    .refresh(&self.inner.settings.audience)
                    .await?;
                Ok(self.ask(session, epoch, request, model, &token).await?)
            }
            other => Ok(other?),
        }
    }

    async fn ask(
        &self,
        session: &SessionHandle,
        epoch: u64,
        request: &QueryRequest,
        model: &SemanticModelRef,
        token: &BearerToken,
    ) -> Result<QueryResult, QueryError> {
        let executor = &self.inner.executor;
        let pending = match executor.submit(request.clone(), model, token).await? {
            Submission::Complete(result) => return Ok(result),
            Submission::Pending(pending) => pending,
        };

        let registered = {
            let mut s = lock(session);
            let current = s.epoch == epoch;
            match s.in_flight.as_mut() {
                Some(in_flight) if current => {
                    in_flight.handle = Some(pending.handle().to_owned());
                    in_flight.cancel = Some(pending.cancellation_token());
                    true
                }
                _ => false,
            }
        };
        if !registered {
            // Cleanup ran while the question was being submitted
            executor.cancel(&pending, token).await;
            return Err(QueryError::Cancelled);
        }

        executor
            .await_result(&pending, token, self.inner.settings.query_timeout)
            .await
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    async fn cleanup(
        &self,
        key: &ConversationKey,
        explicit: Option<&ResourceSetId>,
    ) -> Result<Reply, BotError> {
        let session = self.session(key);
        let (target, in_flight) = {
            let mut s = lock(&session);
            match s.state {
                SessionState::Idle | SessionState::Ready | SessionState::Querying => {
                    s.state = SessionState::TearingDown;
                    s.epoch += 1;
                    s.last_activity = Utc::now();
                    let target = explicit
                        .cloned()
                        .or_else(|| s.resource_set.clone())
                        .unwrap_or_default();
                    (target, s.in_flight.take())
                }
                state => return Err(SessionError::Busy { state }.into()),
            }
        };

        let cancelled_query = in_flight.is_some();
        let outcome = self.run_cleanup(&target, in_flight).await;

        let mut s = lock(&session);
        s.state = SessionState::Idle;
        s.last_activity = Utc::now();
        if outcome.is_ok() && s.resource_set.as_ref() == Some(&target) {
            s.resource_set = None;
        }
        drop(s);

        outcome?;
        Ok(Reply::CleanupComplete {
            resource_set: target,
            cancelled_query,
        })
    }

    async fn run_cleanup(
        &self,
        target: &ResourceSetId,
        in_flight: Option<InFlightQuery>,
    ) -> Result<(), BotError> {
        let token = self.token().await?;

        if let Some(query) = in_flight {
            info!(correlation_id = %query.correlation_id, "Cancelling running query");
            if let Some(cancel) = query.cancel {
                cancel.cancel();
            }
            if let Some(handle) = query.handle {
                self.inner.executor.abandon(&handle, &token).await;
            }
        }

        self.inner.provisioner.teardown(target, &token).await?;
        self.inner.credentials.clear().await?;
        info!(resource_set = %target, "Cleanup complete");
        Ok(())
    }
}
