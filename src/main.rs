mod accounts;
mod actions;
mod calendar;
mod commands;
mod config;
mod export;
mod history;
mod ingest;
mod log_api;
mod logging;
mod scheduler;
mod storage;
mod sync;
#[cfg(test)]
mod test_support;
mod usage;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::config::ScheduleMode;
use crate::logging::{init_tracing, logs_dir};
use crate::scheduler::TokioAlarms;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(String),
    #[error("{0}")]
    Usage(String),
    #[error("sync error: {0}")]
    Sync(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CliResult<T> = std::result::Result<T, CliError>;

const DEFAULT_PORT: u16 = 3290;

#[derive(Parser, Debug)]
#[command(name = "usage-history")]
#[command(about = "Incremental usage-history sync for New-API style relay accounts")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler (alarm mode timers) and the loopback control API
    Serve {
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Run a manual (forced) sync now
    Sync {
        /// Restrict to these account ids; repeatable. Defaults to all enabled accounts.
        #[arg(long = "account")]
        accounts: Vec<String>,
    },
    /// Run the after-refresh trigger (honors schedule mode, cooldowns and interval)
    AfterRefresh,
    /// Prune stored history to the configured retention window
    Prune,
    /// Show per-account sync status
    Status {
        /// Print the raw JSON status report
        #[arg(long)]
        json: bool,
    },
    /// Export aggregates for a day range as JSON
    Export {
        /// First day, inclusive (YYYY-MM-DD)
        #[arg(long)]
        start: String,
        /// Last day, inclusive (YYYY-MM-DD)
        #[arg(long)]
        end: String,
        /// Restrict to these account ids; repeatable. Defaults to every stored account.
        #[arg(long = "account")]
        accounts: Vec<String>,
        /// Write to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Show or change usage-history settings
    Settings {
        #[command(subcommand)]
        cmd: SettingsCommand,
    },
    /// Manage tracked relay accounts
    Account {
        #[command(subcommand)]
        cmd: AccountCommand,
    },
    /// Inspect the sync-run journal
    Runs {
        #[command(subcommand)]
        cmd: RunsCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommand {
    /// Print current settings
    Show,
    /// Update settings; omitted flags keep their current value
    Set {
        #[arg(long)]
        enabled: Option<bool>,
        /// Days of history to keep (1..=365)
        #[arg(long)]
        retention_days: Option<f64>,
        /// alarm | afterRefresh | manual
        #[arg(long)]
        mode: Option<ScheduleMode>,
        /// Minimum minutes between unforced syncs, also the alarm period (1..=1440)
        #[arg(long)]
        interval_minutes: Option<f64>,
    },
}

#[derive(Subcommand, Debug)]
pub enum AccountCommand {
    /// List configured accounts
    List,
    /// Add or replace an account
    Add {
        id: String,
        #[arg(long)]
        base_url: String,
        #[arg(long)]
        name: Option<String>,
        /// Upstream numeric user id (sent as New-API-User)
        #[arg(long)]
        user_id: Option<i64>,
        #[arg(long)]
        access_token: Option<String>,
        /// Read the access token from this environment variable at sync time
        #[arg(long)]
        access_token_env: Option<String>,
        #[arg(long)]
        cookie: Option<String>,
    },
    /// Remove an account from config (stored history is kept)
    Remove { id: String },
    /// Include an account in batch syncs
    Enable { id: String },
    /// Exclude an account from batch syncs
    Disable { id: String },
}

#[derive(Subcommand, Debug)]
pub enum RunsCommand {
    /// Show the most recent sync attempts
    Tail {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Print raw JSON lines
        #[arg(long)]
        raw: bool,
    },
    /// Aggregate attempts per account
    Summary {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Status { json: false });

    // Only the daemon writes a rolling log file.
    let log_dir = matches!(command, Command::Serve { .. }).then(logs_dir);
    let _log_guard = init_tracing(log_dir.as_deref());

    let result = match command {
        Command::Serve { port } => return run_server(port).await,
        Command::Sync { accounts } => commands::history::handle_sync_cmd(accounts).await,
        Command::AfterRefresh => commands::history::handle_after_refresh_cmd().await,
        Command::Prune => commands::history::handle_prune_cmd().await,
        Command::Status { json } => commands::history::handle_status_cmd(json).await,
        Command::Export {
            start,
            end,
            accounts,
            output,
        } => commands::history::handle_export_cmd(start, end, accounts, output).await,
        Command::Settings { cmd } => commands::settings::handle_settings_cmd(cmd).await,
        Command::Account { cmd } => commands::account::handle_account_cmd(cmd).await,
        Command::Runs { cmd } => commands::runs::handle_runs_cmd(cmd).await,
    };
    result.map_err(anyhow::Error::from)
}

async fn run_server(port: u16) -> Result<()> {
    let scheduler = Arc::new(commands::build_scheduler(Arc::new(TokioAlarms::new())).await?);
    scheduler.initialize().await?;

    let app: Router = actions::router(scheduler.clone());
    let addr: SocketAddr = SocketAddr::from(([127, 0, 0, 1], port));
    let prefs = scheduler.preferences().await;
    tracing::info!(
        mode = prefs.schedule_mode.as_str(),
        enabled = prefs.enabled,
        "usage-history listening on http://{}",
        addr
    );

    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let (Ok(mut sigint), Ok(mut sigterm)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) else {
            tracing::warn!("failed to install signal handlers; falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = sigint.recv() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutting down");
}
