use anyhow::{bail, Context, Result};
use chatflow_config::{ChatflowConfig, LoggingSettings, StoreBackend};
use chatflow_conversation::{ConversationManager, ConversationStore, FileStore, MemoryStore};
use chatflow_core::{ChatId, UserId};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chatflow")]
#[command(about = "Resumable per-user bot conversations", long_about = None)]
struct Cli {
    /// Config file, defaults to chatflow.yaml in the chatflow home directory
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Scope {
    /// User the conversation belongs to
    #[arg(short, long, allow_negative_numbers = true)]
    user: UserId,

    /// Chat the conversation takes place in (group chats are negative)
    #[arg(long, allow_negative_numbers = true)]
    chat: ChatId,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle one incoming message: resume or start a conversation
    Handle {
        #[command(flatten)]
        scope: Scope,

        /// Command that owns the conversation
        #[arg(long = "command")]
        name: Option<String>,

        /// Note to record, as key=value (value parsed as JSON when possible)
        #[arg(short, long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },

    /// Show the active conversation without touching it
    Show {
        #[command(flatten)]
        scope: Scope,
    },

    /// Stop the active conversation
    Stop {
        #[command(flatten)]
        scope: Scope,
    },

    /// Cancel the active conversation
    Cancel {
        #[command(flatten)]
        scope: Scope,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(ChatflowConfig::default_config_path);
    let config = if config_path.exists() {
        ChatflowConfig::from_yaml(&config_path)?
    } else if cli.config.is_some() {
        bail!("Config file {:?} does not exist", config_path);
    } else {
        ChatflowConfig::default()
    };

    init_logging(cli.verbose, &config.logging);

    if config_path.exists() {
        info!("Loaded configuration from: {:?}", config_path);
    } else {
        info!("Using default configuration");
    }

    let store = open_store(&config);

    match cli.command {
        Commands::Handle { scope, name, set } => {
            handle_message(store.as_ref(), &scope, name.as_deref(), &set)?;
        }
        Commands::Show { scope } => {
            show_conversation(store.as_ref(), &scope)?;
        }
        Commands::Stop { scope } => {
            finish_conversation(store.as_ref(), &scope, Transition::Stop);
        }
        Commands::Cancel { scope } => {
            finish_conversation(store.as_ref(), &scope, Transition::Cancel);
        }
    }

    Ok(())
}

fn open_store(config: &ChatflowConfig) -> Box<dyn ConversationStore> {
    match config.store.backend {
        StoreBackend::File => {
            info!("Using conversation file {:?}", config.store_path());
            Box::new(FileStore::from_config(config))
        }
        StoreBackend::Memory => {
            warn!("Memory backend selected, conversations end with this process");
            Box::new(MemoryStore::new().with_single_active(config.store.enforce_single_active))
        }
    }
}

fn handle_message(
    store: &dyn ConversationStore,
    scope: &Scope,
    command: Option<&str>,
    assignments: &[String],
) -> Result<()> {
    let notes = assignments
        .iter()
        .map(String::as_str)
        .map(parse_assignment)
        .collect::<Result<Vec<_>>>()?;

    let mut manager = ConversationManager::new(store, scope.user, scope.chat, command);
    if !manager.exists() {
        match manager.command() {
            Some(command) => bail!("Could not start conversation '{command}'"),
            None => {
                println!("No active conversation for user {} in chat {}", scope.user, scope.chat);
                return Ok(());
            }
        }
    }

    if command.is_none() && !notes.is_empty() {
        warn!("Notes are only saved when --command is given");
    }
    for (key, value) in notes {
        manager.set_note(key, value);
    }

    if !manager.commit() {
        bail!("Failed to save conversation notes");
    }

    // Re-read so the output shows what the store now holds
    manager.load();
    print_conversation(&manager)
}

fn show_conversation(store: &dyn ConversationStore, scope: &Scope) -> Result<()> {
    let manager = ConversationManager::new(store, scope.user, scope.chat, None);
    if !manager.exists() {
        println!("No active conversation for user {} in chat {}", scope.user, scope.chat);
        return Ok(());
    }
    print_conversation(&manager)
}

enum Transition {
    Stop,
    Cancel,
}

fn finish_conversation(store: &dyn ConversationStore, scope: &Scope, transition: Transition) {
    let mut manager = ConversationManager::new(store, scope.user, scope.chat, None);
    if !manager.exists() {
        println!("No active conversation for user {} in chat {}", scope.user, scope.chat);
        return;
    }

    let (applied, verb) = match transition {
        Transition::Stop => (manager.stop(), "stopped"),
        Transition::Cancel => (manager.cancel(), "cancelled"),
    };

    let command = manager.command().unwrap_or_default();
    if applied {
        println!("Conversation '{command}' {verb}");
    } else {
        println!("Conversation '{command}' was not {verb}");
    }
}

fn print_conversation(manager: &ConversationManager<'_>) -> Result<()> {
    let Some(record) = manager.record() else {
        return Ok(());
    };

    println!("Conversation {}", record.id);
    println!("  Command: {}", record.command);
    println!("  Status: {}", record.status);
    println!("  Started: {}", record.created_at.to_rfc3339());
    println!("  Updated: {}", record.updated_at.to_rfc3339());
    println!(
        "  Notes: {}",
        serde_json::to_string_pretty(manager.notes()).context("Failed to render notes")?
    );
    Ok(())
}

fn parse_assignment(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("Expected KEY=VALUE, got '{raw}'");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("Note key cannot be empty in '{raw}'");
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn init_logging(verbose: bool, settings: &LoggingSettings) {
    let filter = if verbose {
        "debug"
    } else {
        settings.level.as_str()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            settings
                .json
                .then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
        )
        .with(
            (!settings.json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
        )
        .init();
}
