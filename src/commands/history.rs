use std::path::PathBuf;
use std::sync::Arc;

use owo_colors::OwoColorize;

use crate::actions::status_report;
use crate::commands::build_scheduler;
use crate::export::{ExportSelection, compute_export};
use crate::scheduler::{BatchSyncResult, NoAlarms};
use crate::sync::AccountSyncStatus;
use crate::{CliError, CliResult};

fn format_ms(ms: Option<u64>) -> String {
    ms.and_then(|ms| chrono::DateTime::from_timestamp_millis(ms as i64))
        .map(|dt| {
            dt.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| "-".to_string())
}

fn print_batch(result: Option<BatchSyncResult>) {
    let Some(result) = result else {
        println!("A sync is already running; nothing was done.");
        return;
    };
    if result.per_account.is_empty() {
        println!("No accounts were synced (disabled, gated by schedule mode, or none configured).");
        return;
    }

    println!(
        "{}",
        "account | status | ingested | pages | items | partial | error".bold()
    );
    for s in &result.per_account {
        let status = match s.status {
            AccountSyncStatus::Success => s.status.as_str().green().to_string(),
            AccountSyncStatus::Skipped => s.status.as_str().dimmed().to_string(),
            AccountSyncStatus::Error => s.status.as_str().red().to_string(),
            AccountSyncStatus::Unsupported => s.status.as_str().yellow().to_string(),
        };
        println!(
            "{} | {} | {} | {} | {} | {} | {}",
            s.account_id,
            status,
            s.ingested_count,
            s.pages_fetched,
            s.items_fetched,
            if s.partial { "yes" } else { "no" },
            s.error.as_deref().unwrap_or("-")
        );
    }
    let t = result.totals;
    println!(
        "totals: success={} skipped={} error={} unsupported={}",
        t.success, t.skipped, t.error, t.unsupported
    );
}

pub async fn handle_sync_cmd(accounts: Vec<String>) -> CliResult<()> {
    let scheduler = build_scheduler(Arc::new(NoAlarms::new())).await?;
    let ids = (!accounts.is_empty()).then_some(accounts);
    print_batch(scheduler.run_manual_sync(ids).await);
    Ok(())
}

pub async fn handle_after_refresh_cmd() -> CliResult<()> {
    let scheduler = build_scheduler(Arc::new(NoAlarms::new())).await?;
    print_batch(scheduler.run_after_refresh_sync().await);
    Ok(())
}

pub async fn handle_prune_cmd() -> CliResult<()> {
    let scheduler = build_scheduler(Arc::new(NoAlarms::new())).await?;
    scheduler.prune().await?;
    let prefs = scheduler.preferences().await;
    println!(
        "Pruned usage history to the last {} day(s).",
        prefs.retention_days
    );
    Ok(())
}

pub async fn handle_status_cmd(json: bool) -> CliResult<()> {
    let scheduler = build_scheduler(Arc::new(NoAlarms::new())).await?;
    let report = status_report(&scheduler).await;
    if json {
        let text = serde_json::to_string_pretty(&report).map_err(anyhow::Error::from)?;
        println!("{text}");
        return Ok(());
    }

    let p = report.preferences;
    println!(
        "{}",
        format!(
            "Usage history: {} | mode: {} | retention: {}d | interval: {}m",
            if p.enabled { "enabled" } else { "disabled" },
            p.schedule_mode.as_str(),
            p.retention_days,
            p.sync_interval_minutes
        )
        .bold()
    );
    if report.accounts.is_empty() {
        println!("No synced accounts yet.");
        return Ok(());
    }
    for a in &report.accounts {
        println!("- {} [{}]", a.account_id, a.status.state.as_str());
        println!(
            "  last sync: {} | last success: {} | cursor: {}",
            format_ms(a.status.last_sync_at),
            format_ms(a.status.last_success_at),
            a.cursor_created_at
        );
        if let Some(w) = &a.status.last_warning {
            println!("  warning: {}", w.yellow());
        }
        if let Some(e) = &a.status.last_error {
            println!("  error: {}", e.red());
        }
        if a.status.unsupported_until.is_some() {
            println!(
                "  unsupported until: {}",
                format_ms(a.status.unsupported_until)
            );
        }
    }
    Ok(())
}

pub async fn handle_export_cmd(
    start: String,
    end: String,
    accounts: Vec<String>,
    output: Option<PathBuf>,
) -> CliResult<()> {
    let scheduler = build_scheduler(Arc::new(NoAlarms::new())).await?;
    let store = scheduler.storage().get_store().await;
    let selection = ExportSelection {
        account_ids: accounts,
        start_day: start,
        end_day: end,
    };
    let export = compute_export(&store, &selection, scheduler.now_ms())
        .map_err(|e| CliError::Usage(e.to_string()))?;
    let text = serde_json::to_string_pretty(&export).map_err(anyhow::Error::from)?;

    match output {
        Some(path) => {
            tokio::fs::write(&path, text)
                .await
                .map_err(|e| CliError::Usage(format!("cannot write {:?}: {}", path, e)))?;
            println!(
                "Exported {} account(s) to {:?}",
                export.accounts.len(),
                path
            );
        }
        None => println!("{text}"),
    }
    Ok(())
}
