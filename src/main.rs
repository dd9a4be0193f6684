//! orchd CLI entry point

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info};

use orchd::broker::LlmPriority;
use orchd::cli::{Cli, Command};
use orchd::config::Config;
use orchd::daemon::DaemonManager;
use orchd::supervisor::Supervisor;

/// Initialize tracing; the detached daemon logs to a file, everything
/// else to stderr
fn setup_logging(cli_level: Option<&str>, to_file: bool) -> Result<()> {
    let level = match cli_level.map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            other => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    if to_file {
        let log_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("orchd")
            .join("logs");
        fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
        let log_file = fs::File::create(log_dir.join("orchd.log")).context("Failed to create log file")?;

        tracing_subscriber::fmt()
            .with_writer(log_file)
            .with_ansi(false)
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let to_file = matches!(cli.command, Some(Command::RunDaemon));
    setup_logging(cli.log_level.as_deref(), to_file).context("Failed to setup logging")?;

    // Inability to read an explicitly-given config file is the one fatal
    // boot condition
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Some(Command::Start { foreground }) => cmd_start(config, foreground, cli.config.as_ref()).await,
        Some(Command::Stop) => cmd_stop(),
        Some(Command::Status) | None => cmd_status(config),
        Some(Command::Think) => cmd_think(config).await,
        Some(Command::RunDaemon) => cmd_run_daemon(config).await,
    }
}

async fn cmd_start(config: Config, foreground: bool, config_path: Option<&PathBuf>) -> Result<()> {
    if foreground {
        info!("Starting supervisor in foreground");
        let supervisor = Supervisor::build(config, Vec::new())?;
        return supervisor.run().await;
    }

    let manager = DaemonManager::new();
    let pid = manager.start(config_path)?;
    println!("{} daemon started (pid {})", "orchd".green(), pid);
    Ok(())
}

fn cmd_stop() -> Result<()> {
    DaemonManager::new().stop()?;
    println!("{} daemon stopped", "orchd".green());
    Ok(())
}

fn cmd_status(config: Config) -> Result<()> {
    let manager = DaemonManager::new();
    match manager.running_pid() {
        Some(pid) => println!("daemon: {} (pid {})", "running".green(), pid),
        None => println!("daemon: {}", "stopped".red()),
    }

    let store = orchd::state::Store::load(config.storage.state_path())?;
    let level = store.autonomy_level(config.ai.autonomy_level);
    let ai = store.ai_enabled(config.ai.enabled);
    println!("autonomy: {}", level.to_string().cyan());
    println!("ai: {}", if ai { "on".green() } else { "off".yellow() });
    println!("state version: {}", store.version());

    store.read(|state| {
        if let Some(decision) = state.decisions.last() {
            println!("last decision: {} ({})", decision.summary, decision.ts.format("%Y-%m-%d %H:%M"));
        }
    });
    Ok(())
}

async fn cmd_think(config: Config) -> Result<()> {
    debug!("running one foreground think cycle");
    let supervisor = Supervisor::build(config, Vec::new())?;
    supervisor.think.tick(LlmPriority::Operator).await;

    supervisor.store.read(|state| {
        if let Some(decision) = state.decisions.last() {
            println!("summary: {}", decision.summary);
            for entry in &decision.evaluated {
                let rec = &entry.recommendation;
                let verdict = if entry.allowed { "allowed" } else { "blocked" };
                println!("- {} {} ({}): {}", rec.action, rec.project, rec.reason, verdict);
            }
        } else {
            println!("no decision recorded");
        }
    });
    Ok(())
}

async fn cmd_run_daemon(config: Config) -> Result<()> {
    DaemonManager::new().register_self()?;
    let supervisor = Supervisor::build(config, Vec::new())?;
    supervisor.run().await
}
