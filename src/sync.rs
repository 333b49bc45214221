use std::sync::Arc;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::accounts::{Account, AccountRegistry};
use crate::calendar::retention_cutoff_day_key;
use crate::config::{ScheduleMode, UsageHistoryPreferences};
use crate::history::{AccountStore, SyncState, SyncStatus, prune_account_store};
use crate::ingest::ingest_consume_log_items;
use crate::log_api::{FetchError, LogPage, LogQuery, LogSource};
use crate::storage::UsageHistoryStorage;

pub const MAX_PAGES_PER_RUN: u32 = 20;
pub const MAX_ITEMS_PER_RUN: usize = 2000;
pub const UNSUPPORTED_COOLDOWN_MS: u64 = 24 * 60 * 60 * 1000;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SyncTrigger {
    Manual,
    AfterRefresh,
    Alarm,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Manual => "manual",
            SyncTrigger::AfterRefresh => "afterRefresh",
            SyncTrigger::Alarm => "alarm",
        }
    }

    /// Whether an unforced run from this trigger is allowed under `mode`.
    pub fn matches_mode(&self, mode: ScheduleMode) -> bool {
        match self {
            SyncTrigger::Manual => true,
            SyncTrigger::AfterRefresh => mode == ScheduleMode::AfterRefresh,
            SyncTrigger::Alarm => mode == ScheduleMode::Alarm,
        }
    }
}

/// Global gates applied before any per-account work.
pub fn passes_global_gates(
    prefs: &UsageHistoryPreferences,
    trigger: SyncTrigger,
    force: bool,
) -> bool {
    force || (prefs.enabled && trigger.matches_mode(prefs.schedule_mode))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccountSyncStatus {
    Success,
    Skipped,
    Error,
    Unsupported,
}

impl AccountSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountSyncStatus::Success => "success",
            AccountSyncStatus::Skipped => "skipped",
            AccountSyncStatus::Error => "error",
            AccountSyncStatus::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccountSyncSummary {
    pub account_id: String,
    pub status: AccountSyncStatus,
    pub ingested_count: usize,
    pub pages_fetched: u32,
    pub items_fetched: usize,
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AccountSyncSummary {
    fn empty(account_id: &str, status: AccountSyncStatus) -> Self {
        Self {
            account_id: account_id.to_string(),
            status,
            ingested_count: 0,
            pages_fetched: 0,
            items_fetched: 0,
            partial: false,
            error: None,
        }
    }

    fn skipped(account_id: &str) -> Self {
        Self::empty(account_id, AccountSyncStatus::Skipped)
    }

    fn failed(account_id: &str, status: AccountSyncStatus, message: String) -> Self {
        Self {
            error: Some(message),
            ..Self::empty(account_id, status)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncRequest<'a> {
    pub account_id: &'a str,
    pub trigger: SyncTrigger,
    /// Bypass schedule-mode gates, the unsupported cooldown and the interval check.
    pub force: bool,
    pub preferences: &'a UsageHistoryPreferences,
    pub time_zone: Option<Tz>,
    pub now_ms: u64,
}

#[derive(Debug, Default)]
struct RunCounters {
    pages_fetched: u32,
    items_fetched: usize,
    ingested_count: usize,
    partial: bool,
}

fn partial_warning() -> String {
    format!(
        "Reached safety limits (maxPages={MAX_PAGES_PER_RUN}, maxItems={MAX_ITEMS_PER_RUN}); history may be incomplete for this run."
    )
}

/// Per-account incremental sync: due checks, oldest-first paging under hard caps, ingestion,
/// pruning and status write-back.
pub struct SyncOrchestrator {
    storage: Arc<UsageHistoryStorage>,
    accounts: Arc<dyn AccountRegistry>,
    source: Arc<dyn LogSource>,
}

impl SyncOrchestrator {
    pub fn new(
        storage: Arc<UsageHistoryStorage>,
        accounts: Arc<dyn AccountRegistry>,
        source: Arc<dyn LogSource>,
    ) -> Self {
        Self {
            storage,
            accounts,
            source,
        }
    }

    pub async fn sync_account(&self, req: SyncRequest<'_>) -> AccountSyncSummary {
        let account_id = req.account_id;
        let prefs = req.preferences;

        if !passes_global_gates(prefs, req.trigger, req.force) {
            debug!(account_id, trigger = req.trigger.as_str(), "sync gated off");
            return AccountSyncSummary::skipped(account_id);
        }

        let Some(account) = self.accounts.get_account_by_id(account_id).await else {
            return AccountSyncSummary::failed(
                account_id,
                AccountSyncStatus::Error,
                format!("account not found: {account_id}"),
            );
        };

        let now_ms = req.now_ms;
        let now_unix_seconds = (now_ms / 1000) as i64;
        let retention_days = prefs.retention_days.max(1);
        let retention_start = now_unix_seconds
            .saturating_sub(i64::from(retention_days) * SECONDS_PER_DAY)
            .max(0);

        let mut store = self.storage.get_account_store(account_id).await;

        if !req.force {
            if let Some(until) = store.status.unsupported_until
                && until > now_ms
            {
                debug!(account_id, until, "account in unsupported cooldown");
                return AccountSyncSummary::skipped(account_id);
            }
            let interval_ms = u64::from(prefs.sync_interval_minutes.max(1)) * 60 * 1000;
            if let Some(last) = store.status.last_sync_at
                && now_ms.saturating_sub(last) < interval_ms
            {
                debug!(account_id, last_sync_at = last, "sync interval not elapsed");
                return AccountSyncSummary::skipped(account_id);
            }
        }

        let Some(cutoff) = retention_cutoff_day_key(retention_days, now_unix_seconds, req.time_zone)
        else {
            return self
                .record_failure(
                    account_id,
                    now_ms,
                    false,
                    format!("cannot derive retention cutoff for now={now_ms}"),
                )
                .await;
        };

        let query_base = LogQuery {
            page: 1,
            start_timestamp: store.cursor.last_seen_created_at.max(retention_start),
            end_timestamp: now_unix_seconds,
        };

        let counters = match self
            .walk_pages(&account, &mut store, query_base, req.time_zone)
            .await
        {
            Ok(counters) => counters,
            Err(err) => {
                return self
                    .record_failure(account_id, now_ms, err.is_unsupported(), err.to_string())
                    .await;
            }
        };

        prune_account_store(&mut store, &cutoff);
        store.status = SyncStatus {
            state: SyncState::Success,
            last_sync_at: Some(now_ms),
            last_success_at: Some(now_ms),
            last_warning: counters.partial.then(partial_warning),
            last_error: None,
            unsupported_until: None,
        };

        if let Err(err) = self
            .storage
            .update_account_store(account_id, move |current| *current = store)
            .await
        {
            return self
                .record_failure(account_id, now_ms, false, format!("{err:#}"))
                .await;
        }

        info!(
            account_id,
            trigger = req.trigger.as_str(),
            pages = counters.pages_fetched,
            items = counters.items_fetched,
            ingested = counters.ingested_count,
            partial = counters.partial,
            "usage history synced"
        );

        AccountSyncSummary {
            account_id: account_id.to_string(),
            status: AccountSyncStatus::Success,
            ingested_count: counters.ingested_count,
            pages_fetched: counters.pages_fetched,
            items_fetched: counters.items_fetched,
            partial: counters.partial,
            error: None,
        }
    }

    /// Walk pages from the last (oldest) to the first (newest), folding each into `store`.
    ///
    /// The cursor candidate is adopted into `store` only on success; on error `store` is
    /// discarded by the caller.
    async fn walk_pages(
        &self,
        account: &Account,
        store: &mut AccountStore,
        query_base: LogQuery,
        time_zone: Option<Tz>,
    ) -> Result<RunCounters, FetchError> {
        let mut first_page = self.source.fetch_consume_page(account, &query_base).await?;
        let total_pages = first_page.total_pages();
        debug!(
            account_id = %account.id,
            total_pages,
            total = first_page.total,
            "first log page fetched"
        );

        let start_cursor = store.cursor.clone();
        let mut cursor_candidate = start_cursor.clone();
        let mut counters = RunCounters::default();

        for page in (1..=total_pages).rev() {
            if counters.pages_fetched >= MAX_PAGES_PER_RUN {
                counters.partial = true;
                break;
            }

            let LogPage { mut items, .. } = if page == 1 {
                std::mem::take(&mut first_page)
            } else {
                self.source
                    .fetch_consume_page(account, &LogQuery { page, ..query_base })
                    .await?
            };
            counters.pages_fetched += 1;

            let remaining = MAX_ITEMS_PER_RUN.saturating_sub(counters.items_fetched);
            if remaining == 0 {
                counters.partial = true;
                break;
            }
            // Oldest first, so a cut inside the page only defers strictly newer items.
            items.sort_by_key(|item| item.created_at);
            if items.len() > remaining {
                items.truncate(remaining);
                counters.partial = true;
            }
            counters.items_fetched += items.len();

            let outcome =
                ingest_consume_log_items(store, &items, &start_cursor, cursor_candidate, time_zone);
            cursor_candidate = outcome.cursor_candidate;
            counters.ingested_count += outcome.ingested_count;

            if counters.partial {
                break;
            }
        }

        store.cursor = cursor_candidate;
        Ok(counters)
    }

    async fn record_failure(
        &self,
        account_id: &str,
        now_ms: u64,
        unsupported: bool,
        message: String,
    ) -> AccountSyncSummary {
        let (state, status) = if unsupported {
            (SyncState::Unsupported, AccountSyncStatus::Unsupported)
        } else {
            (SyncState::Error, AccountSyncStatus::Error)
        };
        warn!(account_id, state = state.as_str(), "usage history sync failed: {}", message);

        let error_text = message.clone();
        if let Err(err) = self
            .storage
            .update_account_store(account_id, move |current| {
                current.status = SyncStatus {
                    state,
                    last_sync_at: Some(now_ms),
                    last_success_at: current.status.last_success_at,
                    last_warning: None,
                    last_error: Some(error_text),
                    unsupported_until: if unsupported {
                        Some(now_ms + UNSUPPORTED_COOLDOWN_MS)
                    } else {
                        current.status.unsupported_until
                    },
                };
            })
            .await
        {
            warn!(account_id, "failed to persist sync status: {:#}", err);
        }

        AccountSyncSummary::failed(account_id, status, message)
    }
}
