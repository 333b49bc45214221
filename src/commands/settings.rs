use std::sync::Arc;

use owo_colors::OwoColorize;

use crate::commands::build_scheduler;
use crate::config::PreferencesPatch;
use crate::scheduler::TokioAlarms;
use crate::{CliResult, SettingsCommand};

pub async fn handle_settings_cmd(cmd: SettingsCommand) -> CliResult<()> {
    // Timers are supported here so `alarm` mode persists; `serve` re-arms it on start.
    let scheduler = build_scheduler(Arc::new(TokioAlarms::new())).await?;

    match cmd {
        SettingsCommand::Show => {
            let p = scheduler.preferences().await;
            println!("enabled               = {}", p.enabled);
            println!("retention_days        = {}", p.retention_days);
            println!("schedule_mode         = {}", p.schedule_mode.as_str());
            println!("sync_interval_minutes = {}", p.sync_interval_minutes);
        }
        SettingsCommand::Set {
            enabled,
            retention_days,
            mode,
            interval_minutes,
        } => {
            let patch = PreferencesPatch {
                enabled,
                retention_days,
                schedule_mode: mode,
                sync_interval_minutes: interval_minutes,
            };
            let outcome = scheduler.update_settings(&patch).await?;
            if let Some(warning) = outcome.warning {
                println!("{}", warning.yellow());
            }
            let p = scheduler.preferences().await;
            println!(
                "Saved: enabled={} retention_days={} schedule_mode={} sync_interval_minutes={}",
                p.enabled,
                p.retention_days,
                p.schedule_mode.as_str(),
                p.sync_interval_minutes
            );
        }
    }
    Ok(())
}
