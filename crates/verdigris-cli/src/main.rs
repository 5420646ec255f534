use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use verdigris_config::{find_config_path, load_config, state_dir, Config};
use verdigris_core::session::{FileSessionStore, SessionStore};
use verdigris_core::subagent::registry::{
    JsonSnapshotStore, RunRegistry, SubagentRun, VerificationState,
};

#[derive(Parser)]
#[command(name = "verdigris", about = "Subagent orchestration gateway", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show system status and configuration
    Status,
    /// Inspect the persisted run registry
    Runs {
        #[command(subcommand)]
        action: RunCommands,
    },
    /// Inspect stored sessions
    Sessions {
        #[command(subcommand)]
        action: SessionCommands,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List stored sessions, most recently updated first
    List,
}

#[derive(Subcommand)]
enum RunCommands {
    /// List recorded subagent runs
    List {
        /// Only runs spawned by this requester session key
        #[arg(short, long)]
        requester: Option<String>,
    },
    /// Show one run record as JSON
    Show {
        /// Run id
        run_id: String,
    },
    /// Drop runs that reached a terminal verification state
    Prune,
}

fn registry_path() -> PathBuf {
    state_dir().join("runs.json")
}

fn open_registry() -> RunRegistry {
    RunRegistry::new(Arc::new(JsonSnapshotStore::new(registry_path())))
}

fn format_age(created_at_ms: i64) -> String {
    let created = Utc
        .timestamp_millis_opt(created_at_ms)
        .single()
        .unwrap_or_else(Utc::now);
    let minutes = (Utc::now() - created).num_minutes();
    if minutes < 1 {
        "just now".into()
    } else if minutes < 60 {
        format!("{minutes}m ago")
    } else if minutes < 60 * 24 {
        format!("{}h ago", minutes / 60)
    } else {
        format!("{}d ago", minutes / (60 * 24))
    }
}

fn verification_display(run: &SubagentRun) -> &'static str {
    if run.verification.is_none() {
        return "-";
    }
    match run.verification_state {
        VerificationState::Pending => "pending",
        VerificationState::Passed => "passed",
        VerificationState::Failed => "failed",
    }
}

fn run_status(config: &Config) -> Result<()> {
    println!("verdigris status");
    println!();
    println!("Config:");
    println!(
        "  Agents configured: {}",
        if config.agents.list.is_empty() {
            "defaults only".to_string()
        } else {
            config
                .agents
                .list
                .iter()
                .map(|a| a.id.clone())
                .collect::<Vec<_>>()
                .join(", ")
        }
    );
    println!(
        "  Default max children per agent: {}",
        config.max_children_per_agent("main")
    );
    println!(
        "  Provider limits: {}",
        if config.agents.defaults.provider_limits.is_empty() {
            "built-in defaults".to_string()
        } else {
            let mut limits: Vec<_> = config
                .agents
                .defaults
                .provider_limits
                .iter()
                .map(|(provider, max)| format!("{provider}={max}"))
                .collect();
            limits.sort();
            limits.join(", ")
        }
    );
    println!(
        "  Orchestrator: max {} pending requests per child, {}s safety buffer",
        config.orchestrator.max_pending_per_child, config.orchestrator.safety_buffer_secs
    );
    println!();

    let registry = open_registry();
    let runs = registry.list_runs();
    println!("Run registry: {} ({} records)", registry_path().display(), runs.len());
    Ok(())
}

fn run_list(requester: Option<&str>) -> Result<()> {
    let registry = open_registry();
    let runs = match requester {
        Some(requester) => registry.list_runs_for_requester(requester),
        None => registry.list_runs(),
    };
    if runs.is_empty() {
        println!("No recorded runs.");
        return Ok(());
    }

    println!(
        "{:<12} {:<20} {:<28} {:<12} {:<10}",
        "RUN", "LABEL", "REQUESTER", "VERIFY", "AGE"
    );
    for run in runs {
        let short_id: String = run.run_id.chars().take(12).collect();
        println!(
            "{:<12} {:<20} {:<28} {:<12} {:<10}",
            short_id,
            run.label.as_deref().unwrap_or("-"),
            run.requester_display_key,
            verification_display(&run),
            format_age(run.created_at_ms),
        );
    }
    Ok(())
}

fn run_show(run_id: &str) -> Result<()> {
    let registry = open_registry();
    match registry.get_run(run_id) {
        Some(run) => {
            println!("{}", serde_json::to_string_pretty(&run)?);
            Ok(())
        }
        None => {
            anyhow::bail!("no run record for id '{run_id}'");
        }
    }
}

fn run_prune() -> Result<()> {
    let registry = open_registry();
    let terminal: Vec<_> = registry
        .list_runs()
        .into_iter()
        .filter(|run| run.verification_state != VerificationState::Pending)
        .collect();
    if terminal.is_empty() {
        println!("Nothing to prune.");
        return Ok(());
    }
    for run in &terminal {
        registry.remove_run(&run.run_id);
    }
    registry.flush();
    println!("Pruned {} run record(s).", terminal.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(find_config_path);
    let config = load_config(&config_path)?;

    match cli.command {
        Commands::Status => run_status(&config),
        Commands::Runs { action } => match action {
            RunCommands::List { requester } => run_list(requester.as_deref()),
            RunCommands::Show { run_id } => run_show(&run_id),
            RunCommands::Prune => run_prune(),
        },
        Commands::Sessions { action } => match action {
            SessionCommands::List => list_sessions().await,
        },
    }
}

async fn list_sessions() -> Result<()> {
    let store = FileSessionStore::new(state_dir().join("sessions"));
    let sessions = store.list_active_sessions().await?;
    if sessions.is_empty() {
        println!("No stored sessions.");
        return Ok(());
    }
    for session in sessions {
        println!("{:<48} {}", session.key, format_age(session.updated_at_ms));
    }
    Ok(())
}
