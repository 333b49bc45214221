use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::accounts::{Account, AccountRegistry};
use crate::config::{
    PreferencesPatch, PreferencesStore, ScheduleMode, UsageHistoryPreferences,
    clamp_sync_interval_minutes,
};
use crate::logging::{SyncRunJournal, SyncRunRecord, now_ms};
use crate::storage::UsageHistoryStorage;
use crate::sync::{
    AccountSyncStatus, AccountSyncSummary, SyncOrchestrator, SyncRequest, SyncTrigger,
    passes_global_gates,
};

/// Name of the recurring sync alarm.
pub const ALARM_NAME: &str = "usage-history-sync";

const ALARM_DELAY_MINUTES: u32 = 1;

pub const ALARMS_UNSUPPORTED_ON_UPDATE: &str =
    "Alarms API not supported; falling back to after-refresh scheduling.";
pub const ALARMS_UNAVAILABLE_ON_APPLY: &str =
    "Alarms API unavailable; falling back to after-refresh schedule";

/// Host timer facility. Fired alarm names are broadcast to subscribers.
#[async_trait]
pub trait AlarmHost: Send + Sync {
    fn is_supported(&self) -> bool;
    async fn create(&self, name: &str, period_minutes: u32, delay_minutes: u32);
    async fn clear(&self, name: &str);
    fn subscribe(&self) -> broadcast::Receiver<String>;
}

/// Alarms backed by tokio interval tasks.
pub struct TokioAlarms {
    tasks: std::sync::Mutex<HashMap<String, JoinHandle<()>>>,
    fired: broadcast::Sender<String>,
}

impl TokioAlarms {
    pub fn new() -> Self {
        let (fired, _) = broadcast::channel(16);
        Self {
            tasks: std::sync::Mutex::new(HashMap::new()),
            fired,
        }
    }

    fn with_tasks<R>(&self, f: impl FnOnce(&mut HashMap<String, JoinHandle<()>>) -> R) -> R {
        match self.tasks.lock() {
            Ok(mut g) => f(&mut g),
            Err(e) => f(&mut e.into_inner()),
        }
    }
}

impl Default for TokioAlarms {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlarmHost for TokioAlarms {
    fn is_supported(&self) -> bool {
        true
    }

    async fn create(&self, name: &str, period_minutes: u32, delay_minutes: u32) {
        let period = Duration::from_secs(u64::from(period_minutes.max(1)) * 60);
        let delay = Duration::from_secs(u64::from(delay_minutes) * 60);
        let fired = self.fired.clone();
        let alarm = name.to_string();
        let handle = tokio::spawn(async move {
            let mut tick = interval_at(tokio::time::Instant::now() + delay, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                // No subscribers is fine; the alarm keeps ticking.
                let _ = fired.send(alarm.clone());
            }
        });
        if let Some(previous) = self.with_tasks(|tasks| tasks.insert(name.to_string(), handle)) {
            previous.abort();
        }
        debug!(alarm = name, period_minutes, delay_minutes, "alarm scheduled");
    }

    async fn clear(&self, name: &str) {
        if let Some(handle) = self.with_tasks(|tasks| tasks.remove(name)) {
            handle.abort();
            debug!(alarm = name, "alarm cleared");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.fired.subscribe()
    }
}

/// Host without timers; alarm scheduling degrades to after-refresh.
pub struct NoAlarms {
    fired: broadcast::Sender<String>,
}

impl NoAlarms {
    pub fn new() -> Self {
        let (fired, _) = broadcast::channel(1);
        Self { fired }
    }
}

impl Default for NoAlarms {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlarmHost for NoAlarms {
    fn is_supported(&self) -> bool {
        false
    }

    async fn create(&self, _name: &str, _period_minutes: u32, _delay_minutes: u32) {}

    async fn clear(&self, _name: &str) {}

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.fired.subscribe()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncTotals {
    pub success: usize,
    pub skipped: usize,
    pub error: usize,
    pub unsupported: usize,
}

impl SyncTotals {
    fn record(&mut self, status: AccountSyncStatus) {
        match status {
            AccountSyncStatus::Success => self.success += 1,
            AccountSyncStatus::Skipped => self.skipped += 1,
            AccountSyncStatus::Error => self.error += 1,
            AccountSyncStatus::Unsupported => self.unsupported += 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchSyncResult {
    pub totals: SyncTotals,
    pub per_account: Vec<AccountSyncSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettingsOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Clears the single-flight flag when a batch ends, including on cancellation.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Batch coordinator: global gates, account selection, single-flight and alarm lifecycle.
pub struct Scheduler {
    orchestrator: SyncOrchestrator,
    accounts: Arc<dyn AccountRegistry>,
    preferences: Arc<dyn PreferencesStore>,
    storage: Arc<UsageHistoryStorage>,
    alarms: Arc<dyn AlarmHost>,
    time_zone: Option<Tz>,
    journal: Option<SyncRunJournal>,
    clock: Clock,
    running: AtomicBool,
    listening: AtomicBool,
    initialized: AtomicBool,
}

impl Scheduler {
    pub fn new(
        orchestrator: SyncOrchestrator,
        accounts: Arc<dyn AccountRegistry>,
        preferences: Arc<dyn PreferencesStore>,
        storage: Arc<UsageHistoryStorage>,
        alarms: Arc<dyn AlarmHost>,
        time_zone: Option<Tz>,
    ) -> Self {
        Self {
            orchestrator,
            accounts,
            preferences,
            storage,
            alarms,
            time_zone,
            journal: None,
            clock: Arc::new(now_ms),
            running: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn with_journal(mut self, journal: SyncRunJournal) -> Self {
        debug!(path = ?journal.path(), "sync-run journal enabled");
        self.journal = Some(journal);
        self
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn storage(&self) -> &Arc<UsageHistoryStorage> {
        &self.storage
    }

    pub fn now_ms(&self) -> u64 {
        (self.clock)()
    }

    pub async fn preferences(&self) -> UsageHistoryPreferences {
        self.preferences.get_preferences().await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Subscribe to alarm fires and apply the persisted schedule. Once the schedule has been
    /// applied, later calls are no-ops; a failed apply can be retried.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.listening.swap(true, Ordering::AcqRel) {
            self.spawn_alarm_listener();
        }

        let prefs = self.preferences.get_preferences().await;
        if let Some(warning) = self.apply_schedule(&prefs).await? {
            warn!("{}", warning);
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn spawn_alarm_listener(self: &Arc<Self>) {
        let mut fired = self.alarms.subscribe();
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match fired.recv().await {
                    Ok(name) if name == ALARM_NAME => {
                        scheduler.run_alarm_sync().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "alarm receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub async fn run_manual_sync(
        &self,
        account_ids: Option<Vec<String>>,
    ) -> Option<BatchSyncResult> {
        self.run_sync(SyncTrigger::Manual, account_ids, true).await
    }

    pub async fn run_after_refresh_sync(&self) -> Option<BatchSyncResult> {
        self.run_sync(SyncTrigger::AfterRefresh, None, false).await
    }

    pub async fn run_alarm_sync(&self) -> Option<BatchSyncResult> {
        self.run_sync(SyncTrigger::Alarm, None, false).await
    }

    /// Run one batch. `None` means another batch was already in flight.
    pub async fn run_sync(
        &self,
        trigger: SyncTrigger,
        account_ids: Option<Vec<String>>,
        force: bool,
    ) -> Option<BatchSyncResult> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(trigger = trigger.as_str(), "sync already running; dropping trigger");
            return None;
        }
        let _guard = RunningGuard(&self.running);

        let prefs = self.preferences.get_preferences().await;
        if !passes_global_gates(&prefs, trigger, force) {
            debug!(
                trigger = trigger.as_str(),
                enabled = prefs.enabled,
                mode = prefs.schedule_mode.as_str(),
                "sync batch gated off"
            );
            return Some(BatchSyncResult::default());
        }

        let accounts = self.select_accounts(account_ids).await;
        let mut result = BatchSyncResult::default();
        for account in accounts {
            let started = Instant::now();
            let now = self.now_ms();
            let summary = self
                .orchestrator
                .sync_account(SyncRequest {
                    account_id: &account.id,
                    trigger,
                    force,
                    preferences: &prefs,
                    time_zone: self.time_zone,
                    now_ms: now,
                })
                .await;
            if let Some(journal) = &self.journal
                && summary.status != AccountSyncStatus::Skipped
            {
                journal.append(&SyncRunRecord {
                    timestamp_ms: now,
                    trigger: trigger.as_str().to_string(),
                    account_id: summary.account_id.clone(),
                    status: summary.status.as_str().to_string(),
                    ingested_count: summary.ingested_count,
                    pages_fetched: summary.pages_fetched,
                    items_fetched: summary.items_fetched,
                    partial: summary.partial,
                    error: summary.error.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
            result.totals.record(summary.status);
            result.per_account.push(summary);
        }

        info!(
            trigger = trigger.as_str(),
            success = result.totals.success,
            skipped = result.totals.skipped,
            error = result.totals.error,
            unsupported = result.totals.unsupported,
            "sync batch finished"
        );
        Some(result)
    }

    /// Explicit ids are looked up individually (unknown and disabled ones dropped);
    /// otherwise every enabled account.
    async fn select_accounts(&self, account_ids: Option<Vec<String>>) -> Vec<Account> {
        match account_ids {
            Some(ids) if !ids.is_empty() => {
                let mut accounts = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.accounts.get_account_by_id(&id).await {
                        Some(account) if !account.disabled => accounts.push(account),
                        Some(_) => debug!(account_id = %id, "skipping disabled account"),
                        None => debug!(account_id = %id, "skipping unknown account"),
                    }
                }
                accounts
            }
            _ => self.accounts.get_enabled_accounts().await,
        }
    }

    /// Merge, clamp and persist settings, prune to the new retention and re-apply the schedule.
    pub async fn update_settings(&self, patch: &PreferencesPatch) -> Result<SettingsOutcome> {
        let current = self.preferences.get_preferences().await;
        let mut next = patch.apply(&current);

        let mut warning = None;
        if next.enabled
            && next.schedule_mode == ScheduleMode::Alarm
            && !self.alarms.is_supported()
        {
            next.schedule_mode = ScheduleMode::AfterRefresh;
            warning = Some(ALARMS_UNSUPPORTED_ON_UPDATE.to_string());
        }

        self.preferences.save_preferences(&next).await?;
        self.prune_with(&next).await?;
        if let Some(apply_warning) = self.apply_schedule(&next).await? {
            warning.get_or_insert(apply_warning);
        }

        info!(
            enabled = next.enabled,
            retention_days = next.retention_days,
            mode = next.schedule_mode.as_str(),
            interval_minutes = next.sync_interval_minutes,
            "usage history settings updated"
        );
        Ok(SettingsOutcome { warning })
    }

    /// Align the host alarm with `prefs`. Returns a warning when alarm mode had to degrade.
    pub async fn apply_schedule(&self, prefs: &UsageHistoryPreferences) -> Result<Option<String>> {
        if !prefs.enabled || prefs.schedule_mode != ScheduleMode::Alarm {
            self.alarms.clear(ALARM_NAME).await;
            return Ok(None);
        }

        if !self.alarms.is_supported() {
            self.alarms.clear(ALARM_NAME).await;
            let fallback = UsageHistoryPreferences {
                schedule_mode: ScheduleMode::AfterRefresh,
                ..*prefs
            };
            self.preferences.save_preferences(&fallback).await?;
            return Ok(Some(ALARMS_UNAVAILABLE_ON_APPLY.to_string()));
        }

        let period = clamp_sync_interval_minutes(f64::from(prefs.sync_interval_minutes));
        self.alarms
            .create(ALARM_NAME, period, ALARM_DELAY_MINUTES)
            .await;
        Ok(None)
    }

    /// Prune every account to the currently configured retention window.
    pub async fn prune(&self) -> Result<()> {
        let prefs = self.preferences.get_preferences().await;
        self.prune_with(&prefs).await
    }

    async fn prune_with(&self, prefs: &UsageHistoryPreferences) -> Result<()> {
        let now_unix_seconds = (self.now_ms() / 1000) as i64;
        self.storage
            .prune_all_accounts(prefs.retention_days, now_unix_seconds, self.time_zone)
            .await
    }
}
