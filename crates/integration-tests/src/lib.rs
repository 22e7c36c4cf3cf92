//! Integration test support for Demo Mate.
//!
//! Provides in-memory stand-ins for the three backends the bot talks to
//! and a [`TestContext`] that wires them into a [`ChatOpsService`]:
//!
//! - [`MemoryIdentity`] - public-key registration
//! - [`MemoryWarehouse`] - databases, schemas, stages and staged files
//! - [`ScriptedAnalyst`] - Cortex Analyst answers, scripted per question
//! - [`RecordingSink`] - captures every posted chat message
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p demo-mate-integration-tests
//! ```

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use demo_mate_bot::analyst::{
    AnalystBackend, AnalystQueryExecutor, BackendAnswer, ExecutorSettings, RawAnswer, RawTable,
};
use demo_mate_bot::backend::BackendError;
use demo_mate_bot::credential::{
    BearerToken, CredentialError, CredentialFiles, CredentialManager, CredentialSettings,
    IdentityStore, KeyGenerator,
};
use demo_mate_bot::provision::{
    ProvisionStep, ProvisioningBackend, ResourceProvisioner, ResourceRef, SemanticModelRef,
};
use demo_mate_bot::services::ChatOpsService;
use demo_mate_bot::session::{RouterSettings, SessionRouter};
use demo_mate_bot::slack::{Block, ChatPayload, ChatSink, ContextElement, SlackError};
use demo_mate_core::{
    Command, CommandKind, ConversationKey, Principal, ResourceSetId, SessionState, SqlIdentifier,
};
use secrecy::SecretString;

/// Audience tokens are minted for.
pub const AUDIENCE: &str = "xy12345.snowflakecomputing.com";

/// Stage the semantic model is uploaded to.
pub const STAGE: &str = "semantic_models";

/// Semantic model file name.
pub const MODEL_FILE: &str = "support_tickets_semantic_model.yaml";

const FIXTURE_KEY_A: &str = include_str!("../../bot/testdata/rsa_key_a.p8");
const FIXTURE_KEY_B: &str = include_str!("../../bot/testdata/rsa_key_b.p8");

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Credentials
// =============================================================================

/// Hands out the two test keys in turn so no RSA generation runs in tests.
#[derive(Debug, Default)]
pub struct FixtureKeys {
    generated: AtomicUsize,
}

impl FixtureKeys {
    /// How many keys were handed out.
    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }
}

impl KeyGenerator for FixtureKeys {
    fn generate(&self) -> Result<SecretString, CredentialError> {
        let n = self.generated.fetch_add(1, Ordering::SeqCst);
        Ok(SecretString::from(if n % 2 == 0 {
            FIXTURE_KEY_A
        } else {
            FIXTURE_KEY_B
        }))
    }
}

/// Identity store keeping the registered public key in memory.
#[derive(Debug, Default)]
pub struct MemoryIdentity {
    registered: Mutex<Option<String>>,
    registrations: AtomicUsize,
    clears: AtomicUsize,
}

impl MemoryIdentity {
    /// The currently registered public key body.
    pub fn registered_key(&self) -> Option<String> {
        lock(&self.registered).clone()
    }

    /// Number of successful registrations.
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Number of times the key was cleared.
    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentity {
    async fn set_public_key(
        &self,
        _principal: &Principal,
        public_key: &str,
    ) -> Result<(), BackendError> {
        *lock(&self.registered) = Some(public_key.to_owned());
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_public_key(&self, _principal: &Principal) -> Result<(), BackendError> {
        *lock(&self.registered) = None;
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Warehouse
// =============================================================================

/// Provisioning backend holding objects in memory.
///
/// Individual steps can be made to fail to exercise partial failures.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    objects: Mutex<BTreeSet<String>>,
    artifacts: Mutex<HashMap<String, String>>,
    failing_creates: Mutex<HashMap<ProvisionStep, String>>,
    failing_deletes: Mutex<HashMap<ProvisionStep, String>>,
    creates: AtomicUsize,
}

impl MemoryWarehouse {
    /// Make creation at `step` fail with `detail`.
    pub fn fail_create(&self, step: ProvisionStep, detail: &str) {
        lock(&self.failing_creates).insert(step, detail.to_owned());
    }

    /// Make deletion of the resource created at `step` fail with `detail`.
    pub fn fail_delete(&self, step: ProvisionStep, detail: &str) {
        lock(&self.failing_deletes).insert(step, detail.to_owned());
    }

    /// Clear every injected failure.
    pub fn heal(&self) {
        lock(&self.failing_creates).clear();
        lock(&self.failing_deletes).clear();
    }

    /// Whether `resource` exists.
    pub fn contains(&self, resource: &ResourceRef) -> bool {
        lock(&self.objects).contains(&resource.to_string())
    }

    /// Number of existing objects.
    pub fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }

    /// Number of create calls that reached the backend.
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Contents uploaded for `model`.
    pub fn artifact(&self, model: &SemanticModelRef) -> Option<String> {
        lock(&self.artifacts).get(&model.to_string()).cloned()
    }

    fn create(&self, resource: &ResourceRef) -> Result<(), BackendError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if let Some(detail) = lock(&self.failing_creates).get(&resource.step()) {
            return Err(BackendError::failed(detail.clone()));
        }
        lock(&self.objects).insert(resource.to_string());
        Ok(())
    }
}

#[async_trait]
impl ProvisioningBackend for MemoryWarehouse {
    async fn exists(&self, resource: &ResourceRef, _: &BearerToken) -> Result<bool, BackendError> {
        Ok(self.contains(resource))
    }

    async fn create_namespace(
        &self,
        id: &ResourceSetId,
        _: &BearerToken,
    ) -> Result<(), BackendError> {
        self.create(&ResourceRef::Namespace(id.clone()))
    }

    async fn create_storage_location(
        &self,
        id: &ResourceSetId,
        stage: &SqlIdentifier,
        _: &BearerToken,
    ) -> Result<(), BackendError> {
        self.create(&ResourceRef::StorageLocation {
            resource_set: id.clone(),
            stage: stage.clone(),
        })
    }

    async fn upload_artifact(
        &self,
        model: &SemanticModelRef,
        contents: &str,
        _: &BearerToken,
    ) -> Result<(), BackendError> {
        self.create(&ResourceRef::SemanticArtifact(model.clone()))?;
        lock(&self.artifacts).insert(model.to_string(), contents.to_owned());
        Ok(())
    }

    async fn delete(&self, resource: &ResourceRef, _: &BearerToken) -> Result<(), BackendError> {
        if let Some(detail) = lock(&self.failing_deletes).get(&resource.step()) {
            return Err(BackendError::failed(detail.clone()));
        }
        let mut objects = lock(&self.objects);
        match resource {
            // Dropping the schema takes everything inside it along
            ResourceRef::Namespace(id) => {
                let prefixes = [
                    ResourceRef::Namespace(id.clone()).to_string(),
                    format!("stage {id}."),
                    format!("semantic model @{}.", id.qualified()),
                ];
                objects.retain(|o| !prefixes.iter().any(|p| o.starts_with(p.as_str())));
            }
            other => {
                objects.remove(&other.to_string());
            }
        }
        Ok(())
    }
}

// =============================================================================
// Analyst
// =============================================================================

/// What the analyst does with the next question.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Answer immediately.
    Answer(RawAnswer),
    /// Return a pending handle; polls finish with `table` once released.
    Hold {
        /// Narrative and SQL known at submission.
        draft: RawAnswer,
        /// Rows produced when the statement finishes.
        table: RawTable,
    },
    /// Reject the token.
    Unauthorized,
    /// Fail the question with a backend message.
    Fail(String),
}

/// Analyst backend answering from a script.
///
/// Questions beyond the script get [`ticket_answer`] with five rows.
#[derive(Debug, Default)]
pub struct ScriptedAnalyst {
    script: Mutex<VecDeque<Scripted>>,
    held: Mutex<HashMap<String, RawTable>>,
    released: AtomicBool,
    questions: Mutex<Vec<String>>,
    models: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
    submits: AtomicUsize,
    polls: AtomicUsize,
}

impl ScriptedAnalyst {
    /// Queue the behaviour for the next question.
    pub fn push(&self, step: Scripted) {
        lock(&self.script).push_back(step);
    }

    /// Let held statements finish on their next poll.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    /// Questions received, in order.
    pub fn questions(&self) -> Vec<String> {
        lock(&self.questions).clone()
    }

    /// Semantic model paths the questions were asked against.
    pub fn models(&self) -> Vec<String> {
        lock(&self.models).clone()
    }

    /// Handles the bot asked to cancel.
    pub fn cancelled(&self) -> Vec<String> {
        lock(&self.cancelled).clone()
    }

    /// Number of submissions, including rejected ones.
    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    /// Number of polls.
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalystBackend for ScriptedAnalyst {
    async fn submit(
        &self,
        question: &str,
        semantic_model: &SemanticModelRef,
        _: &BearerToken,
    ) -> Result<BackendAnswer, BackendError> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst);
        lock(&self.questions).push(question.to_owned());
        lock(&self.models).push(semantic_model.to_string());

        let step = lock(&self.script).pop_front();
        match step.unwrap_or_else(|| Scripted::Answer(ticket_answer(5))) {
            Scripted::Answer(raw) => Ok(BackendAnswer::Succeeded(raw)),
            Scripted::Hold { draft, table } => {
                let handle = format!("01b2-{n:04}");
                lock(&self.held).insert(handle.clone(), table);
                Ok(BackendAnswer::Pending { handle, draft })
            }
            Scripted::Unauthorized => Err(BackendError::Unauthorized(
                "JWT token is invalid".to_string(),
            )),
            Scripted::Fail(detail) => Ok(BackendAnswer::Failed {
                detail,
                request_id: Some(format!("req-{n}")),
            }),
        }
    }

    async fn poll(&self, handle: &str, _: &BearerToken) -> Result<BackendAnswer, BackendError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let Some(table) = lock(&self.held).get(handle).cloned() else {
            return Ok(BackendAnswer::Failed {
                detail: format!("Statement {handle} not found"),
                request_id: None,
            });
        };
        if !self.released.load(Ordering::SeqCst) {
            return Ok(BackendAnswer::Pending {
                handle: handle.to_owned(),
                draft: RawAnswer::default(),
            });
        }
        Ok(BackendAnswer::Succeeded(RawAnswer {
            table: Some(table),
            ..RawAnswer::default()
        }))
    }

    async fn cancel(&self, handle: &str, _: &BearerToken) -> Result<(), BackendError> {
        lock(&self.held).remove(handle);
        lock(&self.cancelled).push(handle.to_owned());
        Ok(())
    }
}

/// `rows` rows of ticket counts per service type.
pub fn ticket_counts(rows: usize) -> RawTable {
    RawTable {
        columns: vec!["SERVICE_TYPE".to_string(), "TICKETS".to_string()],
        rows: (0..rows)
            .map(|i| vec![Some(format!("service-{i}")), Some((100 - i).to_string())])
            .collect(),
        total_rows: rows,
    }
}

/// A complete answer with `rows` rows of ticket counts.
pub fn ticket_answer(rows: usize) -> RawAnswer {
    RawAnswer {
        narrative: Some("This is our interpretation of your question: ticket counts by service type.".to_string()),
        sql: Some(
            "SELECT service_type, COUNT(*) AS tickets FROM support_tickets GROUP BY service_type"
                .to_string(),
        ),
        table: Some(ticket_counts(rows)),
        suggestions: vec!["Which service type had the most tickets last month?".to_string()],
        warnings: vec![],
        request_id: Some("req-ticket-counts".to_string()),
    }
}

// =============================================================================
// Chat
// =============================================================================

/// Chat sink recording every posted message.
#[derive(Debug, Default)]
pub struct RecordingSink {
    posts: Mutex<Vec<(ConversationKey, ChatPayload)>>,
}

impl RecordingSink {
    /// Every posted message, in order.
    pub fn posts(&self) -> Vec<(ConversationKey, ChatPayload)> {
        lock(&self.posts).clone()
    }

    /// Fallback texts of the messages posted into `conversation`.
    pub fn texts(&self, conversation: &ConversationKey) -> Vec<String> {
        lock(&self.posts)
            .iter()
            .filter(|(key, _)| key == conversation)
            .map(|(_, payload)| payload.text.clone())
            .collect()
    }

    /// Full text (fallback plus every block) of the messages posted into
    /// `conversation`.
    pub fn bodies(&self, conversation: &ConversationKey) -> Vec<String> {
        lock(&self.posts)
            .iter()
            .filter(|(key, _)| key == conversation)
            .map(|(_, payload)| flatten(payload))
            .collect()
    }

    /// Forget recorded messages.
    pub fn clear(&self) {
        lock(&self.posts).clear();
    }
}

/// Fallback text followed by the text of every block, one per line.
pub fn flatten(payload: &ChatPayload) -> String {
    let mut lines = vec![payload.text.clone()];
    for block in &payload.blocks {
        match block {
            Block::Header { text } => lines.push(text.text.clone()),
            Block::Section { text } => lines.push(text.as_str().to_owned()),
            Block::Context { elements } => {
                lines.extend(elements.iter().map(|element| match element {
                    ContextElement::Mrkdwn { text } | ContextElement::PlainText { text, .. } => {
                        text.clone()
                    }
                }));
            }
            Block::Divider => {}
        }
    }
    lines.join("\n")
}

#[async_trait]
impl ChatSink for RecordingSink {
    async fn post(
        &self,
        conversation: &ConversationKey,
        payload: &ChatPayload,
    ) -> Result<(), SlackError> {
        lock(&self.posts).push((conversation.clone(), payload.clone()));
        Ok(())
    }
}

// =============================================================================
// Test Context
// =============================================================================

/// Knobs for a [`TestContext`].
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// How long a pending query is awaited.
    pub query_timeout: Duration,
    /// Rows kept in a table preview.
    pub preview_row_cap: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(5),
            preview_row_cap: 20,
        }
    }
}

/// A ChatOps service wired to in-memory backends.
pub struct TestContext {
    /// Service under test.
    pub service: ChatOpsService,
    /// Key generator.
    pub keys: Arc<FixtureKeys>,
    /// Identity store.
    pub identity: Arc<MemoryIdentity>,
    /// Provisioning backend.
    pub warehouse: Arc<MemoryWarehouse>,
    /// Analyst backend.
    pub analyst: Arc<ScriptedAnalyst>,
    /// Posted messages.
    pub sink: Arc<RecordingSink>,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    /// A context with default options and no credential files.
    pub fn new() -> Self {
        Self::build(&ContextOptions::default(), None, Arc::default())
    }

    /// A context with custom options.
    pub fn with_options(options: &ContextOptions) -> Self {
        Self::build(options, None, Arc::default())
    }

    /// A context persisting its key under `dir` and provisioning into
    /// `warehouse`, as a restarted bot would.
    pub fn persistent(dir: &Path, warehouse: Arc<MemoryWarehouse>) -> Self {
        let files = CredentialFiles {
            private_key_path: dir.join("rsa_key.p8"),
            artifact_path: dir.join("credential.json"),
            account: "xy12345".to_string(),
            user: "demo_bot".to_string(),
            host: AUDIENCE.to_string(),
        };
        Self::build(&ContextOptions::default(), Some(files), warehouse)
    }

    fn build(
        options: &ContextOptions,
        files: Option<CredentialFiles>,
        warehouse: Arc<MemoryWarehouse>,
    ) -> Self {
        let keys = Arc::new(FixtureKeys::default());
        let identity = Arc::new(MemoryIdentity::default());
        let analyst = Arc::new(ScriptedAnalyst::default());
        let sink = Arc::new(RecordingSink::default());

        let credentials = CredentialManager::new(
            Principal::new("xy12345", "demo_bot"),
            Arc::clone(&identity) as Arc<dyn IdentityStore>,
            Arc::clone(&keys) as Arc<dyn KeyGenerator>,
            files,
            CredentialSettings::default(),
        );
        let provisioner = ResourceProvisioner::new(
            Arc::clone(&warehouse) as Arc<dyn ProvisioningBackend>,
            stage(),
            MODEL_FILE,
            Duration::from_secs(5),
        );
        let executor = AnalystQueryExecutor::new(
            Arc::clone(&analyst) as Arc<dyn AnalystBackend>,
            ExecutorSettings {
                poll_interval: Duration::from_millis(10),
                preview_row_cap: options.preview_row_cap,
            },
        );
        let router = SessionRouter::new(
            credentials,
            provisioner,
            executor,
            RouterSettings {
                audience: AUDIENCE.to_string(),
                query_timeout: options.query_timeout,
                idle_timeout: Duration::from_secs(60),
            },
        );

        Self {
            service: ChatOpsService::new(router, Some(Arc::clone(&sink) as Arc<dyn ChatSink>)),
            keys,
            identity,
            warehouse,
            analyst,
            sink,
        }
    }

    /// The router behind the service.
    pub const fn router(&self) -> &SessionRouter {
        self.service.router()
    }

    /// Current state of `conversation`, if it has a session.
    pub fn state(&self, conversation: &ConversationKey) -> Option<SessionState> {
        self.router().snapshot(conversation).map(|s| s.state)
    }

    /// Wait until `conversation` has a query registered with the backend.
    ///
    /// # Panics
    ///
    /// Panics if that does not happen within five seconds.
    pub async fn wait_for_pending_query(&self, conversation: &ConversationKey) {
        let wait = async {
            loop {
                let pending = self.router().snapshot(conversation).is_some_and(|s| {
                    s.state == SessionState::Querying && s.query_in_flight
                }) && self.analyst.polls() > 0;
                if pending {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        assert!(
            tokio::time::timeout(Duration::from_secs(5), wait)
                .await
                .is_ok(),
            "query in {conversation} never became pending"
        );
    }
}

/// The stage name as an identifier.
///
/// # Panics
///
/// Never; [`STAGE`] is a valid identifier.
pub fn stage() -> SqlIdentifier {
    SqlIdentifier::parse(STAGE).unwrap_or_else(|e| panic!("invalid stage name: {e}"))
}

/// `/setup` for the default resource set.
pub fn setup(conversation: &ConversationKey) -> Command {
    Command::new(
        conversation.clone(),
        CommandKind::Setup {
            resource_set: ResourceSetId::default(),
        },
    )
}

/// `/setup <database> <schema>`.
///
/// # Panics
///
/// Panics if the names are not valid identifiers.
pub fn setup_named(conversation: &ConversationKey, database: &str, schema: &str) -> Command {
    Command::new(
        conversation.clone(),
        CommandKind::Setup {
            resource_set: ResourceSetId::parse(database, schema)
                .unwrap_or_else(|e| panic!("invalid resource set: {e}")),
        },
    )
}

/// `/cortalyst <question>`.
pub fn ask(conversation: &ConversationKey, question: &str) -> Command {
    Command::new(
        conversation.clone(),
        CommandKind::Query {
            question: question.to_owned(),
        },
    )
}

/// `/cleanup` for the conversation's own resource set.
pub fn cleanup(conversation: &ConversationKey) -> Command {
    Command::new(conversation.clone(), CommandKind::Cleanup { resource_set: None })
}
