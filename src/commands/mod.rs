pub mod account;
pub mod history;
pub mod runs;
pub mod settings;

use std::sync::Arc;

use crate::accounts::ConfigAccountRegistry;
use crate::calendar::resolve_time_zone;
use crate::config::{ConfigFilePreferences, app_home_dir, load_config_from};
use crate::log_api::NewApiClient;
use crate::logging::{JournalOptions, SyncRunJournal, default_journal_path};
use crate::scheduler::{AlarmHost, Scheduler};
use crate::storage::{JsonFileKv, UsageHistoryStorage};
use crate::sync::SyncOrchestrator;
use crate::{CliError, CliResult};

/// Wire the file-backed collaborators under the app home into a scheduler.
pub async fn build_scheduler(alarms: Arc<dyn AlarmHost>) -> CliResult<Scheduler> {
    let home = app_home_dir();
    let cfg = load_config_from(&home)
        .await
        .map_err(|e| CliError::Config(format!("{e:#}")))?;
    let time_zone = resolve_time_zone(cfg.time_zone.as_deref());

    let storage = Arc::new(UsageHistoryStorage::new(Arc::new(JsonFileKv::new(
        home.join("data"),
    ))));
    let accounts = Arc::new(ConfigAccountRegistry::new(&home));
    let source = Arc::new(NewApiClient::new().map_err(|e| CliError::Sync(e.to_string()))?);
    let orchestrator = SyncOrchestrator::new(storage.clone(), accounts.clone(), source);

    Ok(Scheduler::new(
        orchestrator,
        accounts,
        Arc::new(ConfigFilePreferences::new(&home)),
        storage,
        alarms,
        time_zone,
    )
    .with_journal(SyncRunJournal::new(
        default_journal_path(),
        JournalOptions::from_env(),
    )))
}
