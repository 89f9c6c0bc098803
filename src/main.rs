use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;

use ckit_core::errors::to_envelope;
use ckit_core::{ExecutionRequest, Outcome, SessionId};
use ckit_engine::{default_registry_with_retry, Orchestrator};
use ckit_llm::{Backoff, RetryPolicy};
use ckit_settings::{BackoffKind, RetrySettings, SessionSettings};
use ckit_store::{Database, SessionStore, SessionStoreConfig};
use ckit_telemetry::TelemetryConfig;

#[derive(Parser, Debug)]
#[command(name = "ckit", version, about = "Run schema-validated build and deploy tools")]
struct Cli {
    /// Settings file; defaults to ~/.ckit/settings.json.
    #[arg(long, value_name = "PATH", global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute one tool and print the result envelope.
    Run {
        tool: String,
        /// Tool parameters as a JSON object.
        #[arg(long, value_name = "JSON", default_value = "{}")]
        params: String,
        #[arg(long, value_name = "ID")]
        session: Option<String>,
        /// Create the session first (with `--session` as its id, if given).
        #[arg(long)]
        create_session: bool,
    },
    /// List registered tools with their parameter schemas.
    Tools,
    /// Check the session database and report orchestrator status.
    Health,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ckit: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let settings = match &cli.settings {
        Some(path) => ckit_settings::load_settings_from_path(path),
        None => ckit_settings::load_settings(),
    }
    .context("failed to load settings")?;

    let telemetry = TelemetryConfig::from_strings(
        &settings.logging.level,
        &settings.logging.modules,
        settings.logging.json,
    )?;
    ckit_telemetry::init_telemetry(&telemetry);

    let (store, db) = open_store(&settings.session)?;
    let registry = default_registry_with_retry(retry_policy(&settings.retry))?;
    let orchestrator = Orchestrator::builder(registry)
        .session_store(Arc::new(store))
        .build();

    let code = match cli.command {
        Command::Run {
            tool,
            params,
            session,
            create_session,
        } => {
            let params: Value =
                serde_json::from_str(&params).context("--params is not valid JSON")?;
            let mut request = ExecutionRequest::new(tool, params);
            if let Some(max_tokens) = settings.sampling.max_tokens {
                request = request.with_max_tokens(max_tokens);
            }
            let session_id = match (session, create_session) {
                (session, true) => Some(create(&orchestrator, session).await?),
                (Some(id), false) => Some(SessionId::from_raw(id)),
                (None, false) => None,
            };
            if let Some(id) = session_id {
                request = request.with_session(id);
            }
            let outcome = orchestrator.execute(request).await;
            print_outcome(&outcome)?
        }
        Command::Tools => {
            let defs = orchestrator.registry().definitions();
            println!("{}", serde_json::to_string_pretty(&defs)?);
            ExitCode::SUCCESS
        }
        Command::Health => {
            if let Some(db) = &db {
                db.ping().context("session database health check failed")?;
            }
            let request = ExecutionRequest::new("ops", serde_json::json!({"operation": "status"}));
            let outcome = orchestrator.execute(request).await;
            print_outcome(&outcome)?
        }
    };

    orchestrator.close();
    Ok(code)
}

async fn create(orchestrator: &Orchestrator, id: Option<String>) -> anyhow::Result<SessionId> {
    let Some(store) = orchestrator.session_store() else {
        bail!("session store is not configured");
    };
    let state = store.create(id.map(SessionId::from_raw)).await?;
    tracing::info!(session_id = %state.session_id, "session created");
    eprintln!("session: {}", state.session_id);
    Ok(state.session_id)
}

fn print_outcome(outcome: &Outcome<Value>) -> anyhow::Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(&to_envelope(outcome))?);
    Ok(if outcome.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn store_config(settings: &SessionSettings) -> SessionStoreConfig {
    SessionStoreConfig {
        ttl: settings.ttl(),
        max_sessions: settings.max_sessions,
        sweep_interval: settings.sweep_interval(),
    }
}

/// SQLite at the configured path, `~/.ckit/sessions.db` by default, or a
/// process-local store for `":memory:"`.
fn open_store(settings: &SessionSettings) -> anyhow::Result<(SessionStore, Option<Database>)> {
    let config = store_config(settings);
    let path = match settings.db_path.as_deref() {
        Some(":memory:") => return Ok((SessionStore::in_memory(config), None)),
        Some(path) => PathBuf::from(path),
        None => ckit_settings::settings_dir().join("sessions.db"),
    };
    let db = open_database(&path)?;
    Ok((SessionStore::sqlite(db.clone(), config), Some(db)))
}

fn open_database(path: &Path) -> anyhow::Result<Database> {
    Database::open(path).with_context(|| format!("failed to open {}", path.display()))
}

fn retry_policy(settings: &RetrySettings) -> RetryPolicy {
    let backoff = match settings.backoff {
        BackoffKind::Fixed => Backoff::Fixed,
        BackoffKind::Exponential => Backoff::Exponential {
            factor: settings.factor,
            max_delay: Duration::from_millis(settings.max_delay_ms),
        },
    };
    RetryPolicy {
        max_attempts: settings.max_attempts,
        delays: settings.delays(),
        backoff,
        jitter_factor: settings.jitter_factor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run() {
        let cli = Cli::parse_from([
            "ckit",
            "run",
            "ops",
            "--params",
            r#"{"operation":"ping"}"#,
            "--session",
            "s1",
            "--create-session",
        ]);
        match cli.command {
            Command::Run {
                tool,
                params,
                session,
                create_session,
            } => {
                assert_eq!(tool, "ops");
                assert_eq!(params, r#"{"operation":"ping"}"#);
                assert_eq!(session.as_deref(), Some("s1"));
                assert!(create_session);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn params_default_to_empty_object() {
        let cli = Cli::parse_from(["ckit", "run", "ops"]);
        let Command::Run { params, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(params, "{}");
    }

    #[test]
    fn store_config_from_settings() {
        let settings = SessionSettings {
            ttl_secs: 60,
            sweep_interval_secs: 5,
            max_sessions: 3,
            db_path: None,
        };
        let config = store_config(&settings);
        assert_eq!(config.ttl, Duration::from_secs(60));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.max_sessions, 3);
    }

    #[test]
    fn retry_policy_from_settings() {
        let policy = retry_policy(&RetrySettings::default());
        assert_eq!(policy, RetryPolicy::default());

        let settings = RetrySettings {
            backoff: BackoffKind::Exponential,
            factor: 3.0,
            max_delay_ms: 2_000,
            ..Default::default()
        };
        let policy = retry_policy(&settings);
        assert_eq!(
            policy.backoff,
            Backoff::Exponential {
                factor: 3.0,
                max_delay: Duration::from_secs(2)
            }
        );
    }

    #[tokio::test]
    async fn sqlite_store_created_at_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sessions.db");
        let settings = SessionSettings {
            db_path: Some(path.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let (store, db) = open_store(&settings).unwrap();
        assert!(db.is_some());
        assert!(path.exists());
        let state = store.create(None).await.unwrap();
        assert!(store.get(&state.session_id).await.unwrap().is_some());
    }

    #[test]
    fn memory_path_skips_database() {
        let settings = SessionSettings {
            db_path: Some(":memory:".into()),
            ..Default::default()
        };
        let (_, db) = open_store(&settings).unwrap();
        assert!(db.is_none());
    }
}
