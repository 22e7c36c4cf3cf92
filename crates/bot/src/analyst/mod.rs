//! Natural-language queries against a staged semantic model.
//!
//! [`AnalystQueryExecutor::submit`] sends the question; an answer that is
//! still running comes back as a [`PendingQuery`] which
//! [`AnalystQueryExecutor::await_result`] polls until it finishes, times
//! out, or is cancelled.

mod error;
mod types;

pub use error::QueryError;
pub use types::{
    BackendAnswer, QueryRequest, QueryResult, RawAnswer, RawTable, StructuredAnswer, TablePreview,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use demo_mate_core::CorrelationId;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::BackendError;
use crate::credential::BearerToken;
use crate::provision::SemanticModelRef;

/// Backend answering natural-language questions.
#[async_trait]
pub trait AnalystBackend: Send + Sync {
    /// Ask `question` against `semantic_model`.
    async fn submit(
        &self,
        question: &str,
        semantic_model: &SemanticModelRef,
        token: &BearerToken,
    ) -> Result<BackendAnswer, BackendError>;

    /// Check on a pending answer.
    async fn poll(&self, handle: &str, token: &BearerToken) -> Result<BackendAnswer, BackendError>;

    /// Ask the backend to abandon a pending answer.
    async fn cancel(&self, handle: &str, token: &BearerToken) -> Result<(), BackendError>;
}

/// A submitted query that has not finished yet.
#[derive(Debug)]
pub struct PendingQuery {
    request: QueryRequest,
    handle: String,
    draft: RawAnswer,
    cancel: CancellationToken,
}

impl PendingQuery {
    /// The request being answered.
    #[must_use]
    pub const fn request(&self) -> &QueryRequest {
        &self.request
    }

    /// Backend handle.
    #[must_use]
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Correlation ID of the request.
    #[must_use]
    pub const fn correlation_id(&self) -> CorrelationId {
        self.request.correlation_id
    }

    /// Token that cancels the wait when tripped.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Result of [`AnalystQueryExecutor::submit`].
#[derive(Debug)]
pub enum Submission {
    /// The backend answered immediately.
    Complete(QueryResult),
    /// The answer is still being computed.
    Pending(PendingQuery),
}

/// Timing and formatting knobs for the executor.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    /// Delay between polls.
    pub poll_interval: Duration,
    /// Maximum rows kept in a table preview.
    pub preview_row_cap: usize,
}

// =============================================================================
// AnalystQueryExecutor
// =============================================================================

/// Submits questions and waits for their answers.
#[derive(Clone)]
pub struct AnalystQueryExecutor {
    inner: Arc<AnalystQueryExecutorInner>,
}

struct AnalystQueryExecutorInner {
    backend: Arc<dyn AnalystBackend>,
    settings: ExecutorSettings,
}

impl std::fmt::Debug for AnalystQueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalystQueryExecutor")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl AnalystQueryExecutor {
    /// Create an executor over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn AnalystBackend>, settings: ExecutorSettings) -> Self {
        Self {
            inner: Arc::new(AnalystQueryExecutorInner { backend, settings }),
        }
    }

    /// Send a question.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::AuthFailed`] if the token was rejected, or
    /// [`QueryError::BackendFailed`] if the request could not be made.
    #[instrument(
        skip(self, request, semantic_model, token),
        fields(conversation = %request.conversation, correlation_id = %request.correlation_id)
    )]
    pub async fn submit(
        &self,
        request: QueryRequest,
        semantic_model: &SemanticModelRef,
        token: &BearerToken,
    ) -> Result<Submission, QueryError> {
        let answer = self
            .inner
            .backend
            .submit(&request.question, semantic_model, token)
            .await?;

        Ok(match answer {
            BackendAnswer::Succeeded(raw) => {
                info!("Answer returned immediately");
                Submission::Complete(QueryResult::succeeded(
                    request.correlation_id,
                    self.format(raw),
                ))
            }
            BackendAnswer::Failed { detail, request_id } => {
                info!(%detail, "Backend failed the query");
                Submission::Complete(QueryResult::failed(
                    request.correlation_id,
                    QueryError::BackendFailed { detail, request_id },
                ))
            }
            BackendAnswer::Pending { handle, draft } => {
                debug!(%handle, "Answer pending");
                Submission::Pending(PendingQuery {
                    request,
                    handle,
                    draft,
                    cancel: CancellationToken::new(),
                })
            }
        })
    }

    /// Poll `pending` until it finishes or `timeout` elapses.
    ///
    /// A timeout leaves the backend query running. A result that arrives
    /// after the query was cancelled is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Timeout`], [`QueryError::Cancelled`], or the
    /// error of a failed poll.
    #[instrument(
        skip(self, pending, token),
        fields(correlation_id = %pending.correlation_id(), handle = %pending.handle)
    )]
    pub async fn await_result(
        &self,
        pending: &PendingQuery,
        token: &BearerToken,
        timeout: Duration,
    ) -> Result<QueryResult, QueryError> {
        match tokio::time::timeout(timeout, self.poll_until_done(pending, token)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(after_secs = timeout.as_secs(), "Query timed out");
                Err(QueryError::Timeout { after: timeout })
            }
        }
    }

    /// Stop waiting on `pending` and ask the backend to abandon it.
    ///
    /// Backend failures are logged, not returned.
    #[instrument(skip(self, pending, token), fields(correlation_id = %pending.correlation_id()))]
    pub async fn cancel(&self, pending: &PendingQuery, token: &BearerToken) {
        pending.cancel.cancel();
        self.abandon(&pending.handle, token).await;
    }

    /// Ask the backend to abandon the query behind `handle`.
    ///
    /// Backend failures are logged, not returned.
    #[instrument(skip(self, token))]
    pub async fn abandon(&self, handle: &str, token: &BearerToken) {
        match self.inner.backend.cancel(handle, token).await {
            Ok(()) => info!("Backend query cancelled"),
            Err(e) => warn!(error = %e, "Failed to cancel backend query"),
        }
    }

    async fn poll_until_done(
        &self,
        pending: &PendingQuery,
        token: &BearerToken,
    ) -> Result<QueryResult, QueryError> {
        let mut interval = tokio::time::interval(self.inner.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                () = pending.cancel.cancelled() => return Err(QueryError::Cancelled),
                _ = interval.tick() => {}
            }

            let answer = tokio::select! {
                biased;
                () = pending.cancel.cancelled() => return Err(QueryError::Cancelled),
                answer = self.inner.backend.poll(&pending.handle, token) => answer?,
            };

            if pending.cancel.is_cancelled() {
                debug!("Discarding result of cancelled query");
                return Err(QueryError::Cancelled);
            }

            match answer {
                BackendAnswer::Pending { .. } => debug!("Still running"),
                BackendAnswer::Succeeded(polled) => {
                    let mut raw = pending.draft.clone();
                    raw.table = polled.table;
                    raw.request_id = raw.request_id.or(polled.request_id);
                    return Ok(QueryResult::succeeded(
                        pending.correlation_id(),
                        self.format(raw),
                    ));
                }
                BackendAnswer::Failed { detail, request_id } => {
                    return Ok(QueryResult::failed(
                        pending.correlation_id(),
                        QueryError::BackendFailed { detail, request_id },
                    ));
                }
            }
        }
    }

    fn format(&self, raw: RawAnswer) -> StructuredAnswer {
        StructuredAnswer::from_raw(raw, self.inner.settings.preview_row_cap)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use demo_mate_core::{ConversationKey, Principal, QueryStatus, ResourceSetId, SqlIdentifier};
    use secrecy::SecretString;

    use super::*;
    use crate::credential::{
        CredentialError, CredentialManager, CredentialSettings, IdentityStore, KeyGenerator,
    };

    const KEY_A: &str = include_str!("../../testdata/rsa_key_a.p8");

    struct FixedKey;

    impl KeyGenerator for FixedKey {
        fn generate(&self) -> Result<SecretString, CredentialError> {
            Ok(SecretString::from(KEY_A))
        }
    }

    struct NoopIdentity;

    #[async_trait]
    impl IdentityStore for NoopIdentity {
        async fn set_public_key(&self, _: &Principal, _: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn clear_public_key(&self, _: &Principal) -> Result<(), BackendError> {
            Ok(())
        }
    }

    async fn token() -> Arc<BearerToken> {
        CredentialManager::new(
            Principal::new("xy12345", "demo_bot"),
            Arc::new(NoopIdentity),
            Arc::new(FixedKey),
            None,
            CredentialSettings::default(),
        )
        .mint_token("xy12345.snowflakecomputing.com")
        .await
        .unwrap()
    }

    /// Replays scripted answers: one for submit, then one per poll.
    #[derive(Default)]
    struct ScriptedBackend {
        submit: Mutex<Option<Result<BackendAnswer, BackendError>>>,
        polls: Mutex<VecDeque<BackendAnswer>>,
        poll_calls: AtomicUsize,
        cancel_calls: AtomicUsize,
    }

    #[async_trait]
    impl AnalystBackend for ScriptedBackend {
        async fn submit(
            &self,
            _: &str,
            _: &SemanticModelRef,
            _: &BearerToken,
        ) -> Result<BackendAnswer, BackendError> {
            self.submit.lock().unwrap().take().unwrap()
        }

        async fn poll(&self, handle: &str, _: &BearerToken) -> Result<BackendAnswer, BackendError> {
            self.poll_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| BackendAnswer::Pending {
                    handle: handle.to_string(),
                    draft: RawAnswer::default(),
                }))
        }

        async fn cancel(&self, _: &str, _: &BearerToken) -> Result<(), BackendError> {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn executor(backend: &Arc<ScriptedBackend>) -> AnalystQueryExecutor {
        AnalystQueryExecutor::new(
            Arc::clone(backend) as Arc<dyn AnalystBackend>,
            ExecutorSettings {
                poll_interval: Duration::from_millis(10),
                preview_row_cap: 20,
            },
        )
    }

    fn model() -> SemanticModelRef {
        SemanticModelRef {
            resource_set: ResourceSetId::default(),
            stage: SqlIdentifier::parse("semantic_models").unwrap(),
            file: "support_tickets_semantic_model.yaml".to_string(),
        }
    }

    fn request() -> QueryRequest {
        QueryRequest::new("how many tickets per day?", ConversationKey::channel("C1"))
    }

    fn table(n: usize) -> RawTable {
        RawTable {
            columns: vec!["DAY".to_string(), "N".to_string()],
            rows: (0..n)
                .map(|i| vec![Some(format!("2024-01-{:02}", i + 1)), Some(i.to_string())])
                .collect(),
            total_rows: n,
        }
    }

    fn pending_answer() -> BackendAnswer {
        BackendAnswer::Pending {
            handle: "01b2".to_string(),
            draft: RawAnswer {
                narrative: Some("Tickets per day".to_string()),
                sql: Some("SELECT day, COUNT(*) FROM t GROUP BY day".to_string()),
                ..RawAnswer::default()
            },
        }
    }

    #[tokio::test]
    async fn test_immediate_answer() {
        let backend = Arc::new(ScriptedBackend::default());
        *backend.submit.lock().unwrap() = Some(Ok(BackendAnswer::Succeeded(RawAnswer {
            narrative: Some("Five days of tickets".to_string()),
            table: Some(table(5)),
            ..RawAnswer::default()
        })));

        let submission = executor(&backend)
            .submit(request(), &model(), &*token().await)
            .await
            .unwrap();
        let Submission::Complete(result) = submission else {
            panic!("expected complete");
        };
        assert_eq!(result.status, QueryStatus::Succeeded);
        let answer = result.into_answer().unwrap();
        let preview = answer.table.unwrap();
        assert_eq!(preview.rows.len(), 5);
        assert!(!preview.truncated);
        assert_eq!(answer.narrative.as_deref(), Some("Five days of tickets"));
    }

    #[tokio::test]
    async fn test_unauthorized_submit_is_auth_failure() {
        let backend = Arc::new(ScriptedBackend::default());
        *backend.submit.lock().unwrap() =
            Some(Err(BackendError::Unauthorized("JWT expired".to_string())));

        let err = executor(&backend)
            .submit(request(), &model(), &*token().await)
            .await
            .unwrap_err();
        assert!(err.is_auth_failure());
    }

    #[tokio::test]
    async fn test_pending_then_polled_to_completion() {
        let backend = Arc::new(ScriptedBackend::default());
        *backend.submit.lock().unwrap() = Some(Ok(pending_answer()));
        backend.polls.lock().unwrap().extend([
            pending_answer(),
            BackendAnswer::Succeeded(RawAnswer {
                table: Some(table(25)),
                ..RawAnswer::default()
            }),
        ]);
        let executor = executor(&backend);
        let token = token().await;

        let Submission::Pending(pending) =
            executor.submit(request(), &model(), &token).await.unwrap()
        else {
            panic!("expected pending");
        };
        let result = executor
            .await_result(&pending, &token, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result.correlation_id, pending.correlation_id());
        let answer = result.into_answer().unwrap();
        // Narrative and SQL from the draft survive polling
        assert_eq!(answer.narrative.as_deref(), Some("Tickets per day"));
        assert_eq!(
            answer.sql.as_deref(),
            Some("SELECT day, COUNT(*) FROM t GROUP BY day")
        );
        let preview = answer.table.unwrap();
        assert_eq!(preview.rows.len(), 20);
        assert_eq!(preview.total_rows, 25);
        assert!(preview.truncated);
        assert_eq!(backend.poll_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_leaves_backend_running() {
        let backend = Arc::new(ScriptedBackend::default());
        *backend.submit.lock().unwrap() = Some(Ok(pending_answer()));
        let executor = executor(&backend);
        let token = token().await;

        let Submission::Pending(pending) =
            executor.submit(request(), &model(), &token).await.unwrap()
        else {
            panic!("expected pending");
        };
        let err = executor
            .await_result(&pending, &token, Duration::from_millis(100))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            QueryError::Timeout {
                after: Duration::from_millis(100)
            }
        );
        assert_eq!(backend.cancel_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting_and_discards_result() {
        let backend = Arc::new(ScriptedBackend::default());
        *backend.submit.lock().unwrap() = Some(Ok(pending_answer()));
        let executor = executor(&backend);
        let token = token().await;

        let Submission::Pending(pending) =
            executor.submit(request(), &model(), &token).await.unwrap()
        else {
            panic!("expected pending");
        };

        let (result, ()) = tokio::join!(
            executor.await_result(&pending, &token, Duration::from_secs(5)),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                // A result becomes available, but only after cancellation
                executor.cancel(&pending, &token).await;
                backend
                    .polls
                    .lock()
                    .unwrap()
                    .push_back(BackendAnswer::Succeeded(RawAnswer::default()));
            }
        );

        assert_eq!(result, Err(QueryError::Cancelled));
        assert_eq!(backend.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_becomes_failed_result() {
        let backend = Arc::new(ScriptedBackend::default());
        *backend.submit.lock().unwrap() = Some(Ok(pending_answer()));
        backend.polls.lock().unwrap().push_back(BackendAnswer::Failed {
            detail: "SQL compilation error".to_string(),
            request_id: Some("01b2".to_string()),
        });
        let executor = executor(&backend);
        let token = token().await;

        let Submission::Pending(pending) =
            executor.submit(request(), &model(), &token).await.unwrap()
        else {
            panic!("expected pending");
        };
        let result = executor
            .await_result(&pending, &token, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result.status, QueryStatus::Failed);
        assert_eq!(
            result.error,
            Some(QueryError::BackendFailed {
                detail: "SQL compilation error".to_string(),
                request_id: Some("01b2".to_string()),
            })
        );
    }
}
