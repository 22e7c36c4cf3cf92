//! Demo Mate CLI - run ChatOps commands and manage the bot's key pair.
//!
//! # Usage
//!
//! ```bash
//! # Provision the default resource set for a channel
//! demo-mate setup --channel C0123456789
//!
//! # Provision a named resource set inside a thread
//! demo-mate setup --channel C0123456789 --thread 1700000000.000100 --database sales --schema raw
//!
//! # Ask Cortex Analyst a question
//! demo-mate ask --channel C0123456789 "which service type has the most tickets?"
//!
//! # Remove the resource set and the key registration
//! demo-mate cleanup --channel C0123456789
//!
//! # Inspect a resource set
//! demo-mate status
//!
//! # Generate or rotate the bot's key pair
//! demo-mate keygen --rotate
//! ```
//!
//! # Commands
//!
//! - `setup` - Provision a resource set for a conversation
//! - `ask` - Ask a natural-language question
//! - `cleanup` - Tear down a resource set and clear the key registration
//! - `status` - Print the status of a resource set
//! - `keygen` - Load, generate or rotate the key pair

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use demo_mate_bot::config::BotConfig;
use demo_mate_bot::slack::ChatSink;
use demo_mate_bot::state::BotState;
use demo_mate_core::{Command, CommandKind, ConversationKey, ResourceSetId};
use sentry::integrations::tracing as sentry_tracing;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::CliError;
use commands::chat::StdoutSink;

#[derive(Parser)]
#[command(name = "demo-mate")]
#[command(author, version, about = "Demo Mate ChatOps CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a resource set for a conversation
    Setup {
        #[command(flatten)]
        conversation: ConversationArgs,

        #[command(flatten)]
        resource_set: ResourceSetArgs,
    },
    /// Ask Cortex Analyst a question
    Ask {
        #[command(flatten)]
        conversation: ConversationArgs,

        #[command(flatten)]
        resource_set: ResourceSetArgs,

        /// Question text
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,
    },
    /// Tear down a resource set and clear the key registration
    Cleanup {
        #[command(flatten)]
        conversation: ConversationArgs,

        #[command(flatten)]
        resource_set: ResourceSetArgs,
    },
    /// Print the status of a resource set
    Status {
        #[command(flatten)]
        resource_set: ResourceSetArgs,
    },
    /// Load the saved key pair, or generate and register one
    Keygen {
        /// Replace the current key with a new one
        #[arg(long)]
        rotate: bool,
    },
}

#[derive(Args)]
struct ConversationArgs {
    /// Slack channel ID
    #[arg(short, long)]
    channel: String,

    /// Thread timestamp to reply in
    #[arg(short, long)]
    thread: Option<String>,
}

impl ConversationArgs {
    fn key(self) -> ConversationKey {
        match self.thread {
            Some(thread) => ConversationKey::thread(self.channel, thread),
            None => ConversationKey::channel(self.channel),
        }
    }
}

#[derive(Args)]
struct ResourceSetArgs {
    /// Database name
    #[arg(short, long)]
    database: Option<String>,

    /// Schema name (requires --database)
    #[arg(short, long, requires = "database")]
    schema: Option<String>,
}

impl ResourceSetArgs {
    fn parse(&self) -> Result<Option<ResourceSetId>, CliError> {
        let Some(database) = &self.database else {
            return Ok(None);
        };
        let schema = self
            .schema
            .as_deref()
            .unwrap_or(ResourceSetId::DEFAULT_SCHEMA);
        let id = ResourceSetId::parse(database, schema)
            .map_err(demo_mate_core::CommandError::from)?;
        Ok(Some(id))
    }
}

/// Initialize Sentry error tracking and return guard that must be kept alive.
fn init_sentry(config: &BotConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_ref()?;

    let guard = sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: config
                .sentry_environment
                .clone()
                .map(std::borrow::Cow::Owned),
            sample_rate: config.sentry_sample_rate,
            attach_stacktrace: true,
            send_default_pii: false,
            ..Default::default()
        },
    ));

    tracing::info!("Sentry initialized");
    Some(guard)
}

/// Filter tracing events to Sentry event types.
fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN => sentry_tracing::EventFilter::Event,
        tracing::Level::INFO | tracing::Level::DEBUG => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    }
}

/// Logs go to stderr so printed replies stay readable on stdout.
fn init_tracing(json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "demo_mate_bot=info,demo_mate_cli=info".into());

    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match BotConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(false);
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    // Sentry must be initialized before the tracing subscriber
    let _sentry_guard = init_sentry(&config);
    init_tracing(config.log_json);

    if let Err(e) = run(cli, config).await {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: BotConfig) -> Result<(), CliError> {
    let stdout: Arc<dyn ChatSink> = Arc::new(StdoutSink);
    let state = BotState::from_config(config, Some(stdout))?;

    match cli.command {
        Commands::Setup {
            conversation,
            resource_set,
        } => {
            let kind = CommandKind::Setup {
                resource_set: resource_set.parse()?.unwrap_or_default(),
            };
            let command = Command::new(conversation.key(), kind);
            commands::chat::run(state.service(), &command, None).await
        }
        Commands::Ask {
            conversation,
            resource_set,
            question,
        } => {
            let kind = CommandKind::parse_query(&question.join(" "))?;
            let command = Command::new(conversation.key(), kind);
            commands::chat::run(state.service(), &command, resource_set.parse()?).await
        }
        Commands::Cleanup {
            conversation,
            resource_set,
        } => {
            let kind = CommandKind::Cleanup {
                resource_set: resource_set.parse()?,
            };
            let command = Command::new(conversation.key(), kind);
            commands::chat::run(state.service(), &command, None).await
        }
        Commands::Status { resource_set } => {
            let id = resource_set.parse()?.unwrap_or_default();
            commands::status::run(state.router(), &id).await
        }
        Commands::Keygen { rotate } => {
            commands::keygen::run(state.router().credentials(), rotate).await
        }
    }
}
