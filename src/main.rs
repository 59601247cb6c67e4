use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use switchboard_core::SessionId;
use switchboard_settings::{load_settings_from_path, settings_path, SwitchboardSettings};
use switchboard_store::{Database, SessionStore, SqliteStore};
use switchboard_telemetry::{init_telemetry, SqliteLogSink, TelemetryConfig};

#[derive(Parser)]
#[command(name = "switchboard", version, about = "Inspect stored sessions, messages and logs")]
struct Cli {
    /// Settings file. Defaults to $SWITCHBOARD_CONFIG, then ./switchboard.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective settings after file and env overrides.
    Config,
    /// List stored sessions.
    Sessions,
    /// Most recent messages of a session.
    Messages {
        session_id: String,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Chats recorded for a session.
    Chats { session_id: String },
    /// Persisted warnings and errors for a session.
    Trail {
        session_id: String,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let path = cli.config.clone().unwrap_or_else(settings_path);
    let settings = match load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
    {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    // Reading the log database must not append to it.
    let _telemetry = init_telemetry(TelemetryConfig {
        json: false,
        log_to_sqlite: false,
        ..TelemetryConfig::from_settings(&settings.logging)
    });

    match run(cli.command, &settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let error = format!("{e:#}");
            tracing::error!(error = %error, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, settings: &SwitchboardSettings) -> Result<()> {
    match command {
        Command::Config => print_json(&serde_json::to_value(settings)?),
        Command::Sessions => {
            let store = open_store(settings)?;
            let sessions = store.list_sessions().await.context("Failed to list sessions")?;
            print_json(&serde_json::to_value(sessions)?)
        }
        Command::Messages { session_id, limit } => {
            let store = open_store(settings)?;
            let messages = store
                .list_messages(&SessionId::from_raw(session_id.as_str()), limit)
                .await
                .with_context(|| format!("Failed to list messages for {session_id}"))?;
            print_json(&serde_json::to_value(messages)?)
        }
        Command::Chats { session_id } => {
            let store = open_store(settings)?;
            let chats = store
                .list_chats(&SessionId::from_raw(session_id.as_str()))
                .await
                .with_context(|| format!("Failed to list chats for {session_id}"))?;
            print_json(&serde_json::to_value(chats)?)
        }
        Command::Trail { session_id, limit } => {
            let path = Path::new(&settings.logging.log_db_path);
            let sink = SqliteLogSink::new(path)
                .with_context(|| format!("Failed to open log database {}", path.display()))?;
            let trail = sink
                .session_trail(&session_id, limit)
                .context("Failed to query log trail")?;
            print_json(&serde_json::to_value(trail)?)
        }
    }
}

fn open_store(settings: &SwitchboardSettings) -> Result<SqliteStore> {
    let path = Path::new(&settings.store.db_path);
    let db = Database::open(path)
        .with_context(|| format!("Failed to open store {}", path.display()))?;
    tracing::debug!(path = %db.path().display(), "store opened");
    Ok(SqliteStore::new(db))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
