//! Snowflake REST client for the SQL API and the analyst endpoint.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument};

use super::types::{
    AnalystErrorBody, AnalystRequest, AnalystResponse, StatementRequest, StatementResponse,
};
use crate::backend::BackendError;
use crate::config::SnowflakeConfig;
use crate::credential::BearerToken;

/// Header naming the kind of bearer credential.
const TOKEN_TYPE_HEADER: &str = "X-Snowflake-Authorization-Token-Type";

/// Header carrying the backend request ID on analyst responses.
const REQUEST_ID_HEADER: &str = "X-Snowflake-Request-Id";

/// Server-side timeout requested for each statement, in seconds.
const STATEMENT_TIMEOUT_SECS: u64 = 60;

/// Credential presented on a request.
#[derive(Clone, Copy)]
pub enum Auth<'a> {
    /// A key-pair token minted by the credential manager.
    KeyPair(&'a BearerToken),
    /// The bootstrap programmatic access token.
    Programmatic(&'a SecretString),
}

impl Auth<'_> {
    const fn token_type(self) -> &'static str {
        match self {
            Self::KeyPair(_) => "KEYPAIR_JWT",
            Self::Programmatic(_) => "PROGRAMMATIC_ACCESS_TOKEN",
        }
    }
}

impl<'a> Auth<'a> {
    fn bearer(self) -> &'a str {
        match self {
            Self::KeyPair(token) => token.expose(),
            Self::Programmatic(token) => token.expose_secret(),
        }
    }
}

/// A finished statement's result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    /// Column names.
    pub columns: Vec<String>,
    /// Rows of the first partition.
    pub rows: Vec<Vec<Option<String>>>,
    /// Total rows across all partitions.
    pub total_rows: usize,
    /// Statement handle.
    pub statement_handle: Option<String>,
}

/// Outcome of submitting or polling a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementOutcome {
    /// The statement finished.
    Complete(ResultSet),
    /// The statement is still running.
    Running {
        /// Handle for polling or cancelling.
        handle: String,
    },
}

// =============================================================================
// SnowflakeClient
// =============================================================================

/// Client for the Snowflake REST endpoints.
#[derive(Clone)]
pub struct SnowflakeClient {
    inner: Arc<SnowflakeClientInner>,
}

struct SnowflakeClientInner {
    client: reqwest::Client,
    base_url: String,
    warehouse: Option<String>,
    role: Option<String>,
}

impl std::fmt::Debug for SnowflakeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowflakeClient")
            .field("base_url", &self.inner.base_url)
            .field("warehouse", &self.inner.warehouse)
            .field("role", &self.inner.role)
            .finish_non_exhaustive()
    }
}

impl SnowflakeClient {
    /// Create a client for the configured host.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Http`] if the HTTP client cannot be built.
    pub fn new(config: &SnowflakeConfig, http_timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .user_agent(concat!("demo-mate/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            inner: Arc::new(SnowflakeClientInner {
                client,
                base_url: config.base_url(),
                warehouse: config.warehouse.clone(),
                role: config.role.clone(),
            }),
        })
    }

    /// Base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str, auth: Auth<'_>) -> reqwest::RequestBuilder {
        self.inner
            .client
            .request(method, format!("{}{path}", self.inner.base_url))
            .bearer_auth(auth.bearer())
            .header(TOKEN_TYPE_HEADER, auth.token_type())
            .header(reqwest::header::ACCEPT, "application/json")
    }

    // =========================================================================
    // SQL API
    // =========================================================================

    /// Submit a statement.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] classified by response status.
    #[instrument(skip(self, statement, auth))]
    pub async fn execute(
        &self,
        statement: &str,
        auth: Auth<'_>,
    ) -> Result<StatementOutcome, BackendError> {
        let body = StatementRequest {
            statement,
            timeout: STATEMENT_TIMEOUT_SECS,
            warehouse: self.inner.warehouse.as_deref(),
            role: self.inner.role.as_deref(),
        };

        let response = self
            .request(reqwest::Method::POST, "/api/v2/statements", auth)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let request_id = header_request_id(response.headers());
        let text = response.text().await?;
        classify_statement(status, &text, request_id)
    }

    /// Poll a running statement.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] classified by response status.
    #[instrument(skip(self, auth))]
    pub async fn statement_status(
        &self,
        handle: &str,
        auth: Auth<'_>,
    ) -> Result<StatementOutcome, BackendError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v2/statements/{handle}"),
                auth,
            )
            .send()
            .await?;

        let status = response.status();
        let request_id = header_request_id(response.headers());
        let text = response.text().await?;
        classify_statement(status, &text, request_id)
    }

    /// Ask the backend to abandon a running statement.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the cancel request is rejected.
    #[instrument(skip(self, auth))]
    pub async fn cancel_statement(&self, handle: &str, auth: Auth<'_>) -> Result<(), BackendError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v2/statements/{handle}/cancel"),
                auth,
            )
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!("Statement cancelled");
            return Ok(());
        }
        let request_id = header_request_id(response.headers());
        let text = response.text().await?;
        Err(classify_failure(status, statement_message(&text), request_id))
    }

    /// Run a statement to completion, polling while it runs.
    ///
    /// Used for short DDL and metadata statements.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] from any of the calls.
    pub async fn execute_to_completion(
        &self,
        statement: &str,
        auth: Auth<'_>,
        poll_interval: Duration,
    ) -> Result<ResultSet, BackendError> {
        let mut outcome = self.execute(statement, auth).await?;
        loop {
            match outcome {
                StatementOutcome::Complete(result) => return Ok(result),
                StatementOutcome::Running { handle } => {
                    tokio::time::sleep(poll_interval).await;
                    outcome = self.statement_status(&handle, auth).await?;
                }
            }
        }
    }

    // =========================================================================
    // Analyst
    // =========================================================================

    /// Send one question to the analyst.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] classified by response status.
    #[instrument(skip(self, question, token))]
    pub async fn analyst_message(
        &self,
        question: &str,
        semantic_model_file: &str,
        token: &BearerToken,
    ) -> Result<AnalystResponse, BackendError> {
        let body = AnalystRequest::question(question, semantic_model_file);

        let response = self
            .request(
                reqwest::Method::POST,
                "/api/v2/cortex/analyst/message",
                Auth::KeyPair(token),
            )
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let request_id = header_request_id(response.headers());
        let text = response.text().await?;
        classify_analyst(status, &text, request_id)
    }
}

// =============================================================================
// Response classification
// =============================================================================

fn header_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn statement_message(body: &str) -> String {
    serde_json::from_str::<StatementResponse>(body)
        .ok()
        .and_then(|r| r.message)
        .unwrap_or_else(|| truncate(body))
}

fn truncate(body: &str) -> String {
    const LIMIT: usize = 200;
    let body = body.trim();
    if body.is_empty() {
        return "empty response body".to_string();
    }
    match body.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", body.get(..idx).unwrap_or(body)),
        None => body.to_string(),
    }
}

/// Map a non-success status into the backend error taxonomy.
pub(crate) fn classify_failure(
    status: StatusCode,
    message: String,
    request_id: Option<String>,
) -> BackendError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Unauthorized(message),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            BackendError::Transient(format!("{status}: {message}"))
        }
        s if s.is_server_error() => BackendError::Transient(format!("{status}: {message}")),
        _ => BackendError::Failed {
            message,
            request_id,
        },
    }
}

/// Decode a statement endpoint response.
pub(crate) fn classify_statement(
    status: StatusCode,
    body: &str,
    header_request_id: Option<String>,
) -> Result<StatementOutcome, BackendError> {
    match status {
        StatusCode::OK => {
            let response: StatementResponse = serde_json::from_str(body)
                .map_err(|e| BackendError::Decode(format!("statement result: {e}")))?;
            let (columns, total_rows) =
                response
                    .result_set_meta_data
                    .map_or((Vec::new(), response.data.len()), |meta| {
                        (
                            meta.row_type.into_iter().map(|c| c.name).collect(),
                            meta.num_rows,
                        )
                    });
            Ok(StatementOutcome::Complete(ResultSet {
                columns,
                total_rows: total_rows.max(response.data.len()),
                rows: response.data,
                statement_handle: response.statement_handle,
            }))
        }
        StatusCode::ACCEPTED => {
            let response: StatementResponse = serde_json::from_str(body)
                .map_err(|e| BackendError::Decode(format!("statement status: {e}")))?;
            response
                .statement_handle
                .map(|handle| StatementOutcome::Running { handle })
                .ok_or_else(|| BackendError::Decode("running statement without handle".to_string()))
        }
        _ => {
            let parsed = serde_json::from_str::<StatementResponse>(body).unwrap_or_default();
            let tags: Vec<String> = [
                parsed.code.map(|code| format!("code {code}")),
                parsed.sql_state.map(|state| format!("SQL state {state}")),
            ]
            .into_iter()
            .flatten()
            .collect();
            let message = match parsed.message {
                Some(message) if tags.is_empty() => message,
                Some(message) => format!("{message} ({})", tags.join(", ")),
                None => truncate(body),
            };
            debug!(%status, "Statement failed");
            Err(classify_failure(
                status,
                message,
                parsed.statement_handle.or(header_request_id),
            ))
        }
    }
}

/// Decode an analyst endpoint response.
pub(crate) fn classify_analyst(
    status: StatusCode,
    body: &str,
    header_request_id: Option<String>,
) -> Result<AnalystResponse, BackendError> {
    if status.is_success() {
        let mut response: AnalystResponse = serde_json::from_str(body)
            .map_err(|e| BackendError::Decode(format!("analyst response: {e}")))?;
        if response.request_id.is_none() {
            response.request_id = header_request_id;
        }
        return Ok(response);
    }

    let parsed = serde_json::from_str::<AnalystErrorBody>(body).unwrap_or_default();
    let message = match (parsed.message, parsed.error_code) {
        (Some(message), Some(code)) => format!("{message} (error code {code})"),
        (Some(message), None) => message,
        (None, _) => truncate(body),
    };
    Err(classify_failure(
        status,
        message,
        parsed.request_id.or(header_request_id),
    ))
}
