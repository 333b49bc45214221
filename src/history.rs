use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::usage::{LatencyAggregate, UsageAggregate};

/// Persisted store schema version. A stored document with any other version is discarded.
pub const STORE_SCHEMA_VERSION: u32 = 1;

/// Cap on boundary fingerprints kept in a cursor; the most recent entries win.
pub const MAX_CURSOR_FINGERPRINTS: usize = 256;

/// Day key (`YYYY-MM-DD`) → value.
pub type ByDay<T> = BTreeMap<String, T>;
/// Day key → hour key (`00`..`23`) → value.
pub type ByDayByHour<T> = BTreeMap<String, BTreeMap<String, T>>;
/// Outer id (model name or token id) → day key → value.
pub type ByIdByDay<T> = BTreeMap<String, ByDay<T>>;

/// Incremental ingestion watermark.
///
/// Everything with `created_at < last_seen_created_at` has been ingested, plus the items at
/// exactly `last_seen_created_at` whose fingerprint is listed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    #[serde(default)]
    pub last_seen_created_at: i64,
    #[serde(default)]
    pub fingerprints_at_last_seen_created_at: Vec<String>,
}

impl Cursor {
    pub fn contains(&self, created_at: i64, fingerprint: &str) -> bool {
        created_at == self.last_seen_created_at
            && self
                .fingerprints_at_last_seen_created_at
                .iter()
                .any(|f| f == fingerprint)
    }

    pub fn truncate_fingerprints(&mut self) {
        let len = self.fingerprints_at_last_seen_created_at.len();
        if len > MAX_CURSOR_FINGERPRINTS {
            self.fingerprints_at_last_seen_created_at
                .drain(..len - MAX_CURSOR_FINGERPRINTS);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Never,
    Success,
    Error,
    Unsupported,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Never => "never",
            SyncState::Success => "success",
            SyncState::Error => "error",
            SyncState::Unsupported => "unsupported",
        }
    }
}

/// Outcome of the latest sync attempt for one account. Timestamps are unix milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    /// Last time an attempt finished, successful or not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<u64>,
    /// Non-fatal warning from the last attempt (e.g. safety caps reached).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// The account is skipped by non-forced runs until this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsupported_until: Option<u64>,
}

/// Per-account usage history: cursor, status, and every aggregate dimension.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountStore {
    pub cursor: Cursor,
    pub status: SyncStatus,
    pub daily: ByDay<UsageAggregate>,
    pub hourly: ByDayByHour<UsageAggregate>,
    pub daily_by_model: ByIdByDay<UsageAggregate>,
    /// Display labels for token ids. Cosmetic only; token secrets are never stored.
    pub token_names_by_id: BTreeMap<String, String>,
    pub daily_by_token: ByIdByDay<UsageAggregate>,
    /// Token id → day key → hour key.
    pub hourly_by_token: BTreeMap<String, ByDayByHour<UsageAggregate>>,
    /// Token id → model name → day key.
    pub daily_by_token_by_model: BTreeMap<String, ByIdByDay<UsageAggregate>>,
    pub latency_daily: ByDay<LatencyAggregate>,
    pub latency_daily_by_model: ByIdByDay<LatencyAggregate>,
    pub latency_daily_by_token: ByIdByDay<LatencyAggregate>,
    pub latency_daily_by_token_by_model: BTreeMap<String, ByIdByDay<LatencyAggregate>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Store {
    pub schema_version: u32,
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountStore>,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            schema_version: STORE_SCHEMA_VERSION,
            accounts: BTreeMap::new(),
        }
    }
}

fn prune_days<T>(map: &mut BTreeMap<String, T>, cutoff_day_key: &str) {
    *map = map.split_off(cutoff_day_key);
}

fn prune_by_id<T>(map: &mut BTreeMap<String, BTreeMap<String, T>>, cutoff_day_key: &str) {
    for per_id in map.values_mut() {
        prune_days(per_id, cutoff_day_key);
    }
    map.retain(|_, per_id| !per_id.is_empty());
}

fn prune_by_id_by_id<T>(
    map: &mut BTreeMap<String, BTreeMap<String, BTreeMap<String, T>>>,
    cutoff_day_key: &str,
) {
    for per_outer in map.values_mut() {
        prune_by_id(per_outer, cutoff_day_key);
    }
    map.retain(|_, per_outer| !per_outer.is_empty());
}

/// Drop every day-keyed row older than `cutoff_day_key`, then empty parents and orphaned
/// token labels.
pub fn prune_account_store(store: &mut AccountStore, cutoff_day_key: &str) {
    prune_days(&mut store.daily, cutoff_day_key);
    prune_days(&mut store.hourly, cutoff_day_key);
    prune_by_id(&mut store.daily_by_model, cutoff_day_key);
    prune_by_id(&mut store.daily_by_token, cutoff_day_key);
    prune_by_id(&mut store.hourly_by_token, cutoff_day_key);
    prune_by_id_by_id(&mut store.daily_by_token_by_model, cutoff_day_key);

    prune_days(&mut store.latency_daily, cutoff_day_key);
    prune_by_id(&mut store.latency_daily_by_model, cutoff_day_key);
    prune_by_id(&mut store.latency_daily_by_token, cutoff_day_key);
    prune_by_id_by_id(&mut store.latency_daily_by_token_by_model, cutoff_day_key);

    let retained: BTreeSet<&String> = store
        .daily_by_token
        .keys()
        .chain(store.hourly_by_token.keys())
        .chain(store.daily_by_token_by_model.keys())
        .chain(store.latency_daily_by_token.keys())
        .chain(store.latency_daily_by_token_by_model.keys())
        .collect();
    let orphaned: Vec<String> = store
        .token_names_by_id
        .keys()
        .filter(|id| !retained.contains(id))
        .cloned()
        .collect();
    for id in orphaned {
        store.token_names_by_id.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn agg(requests: u64) -> UsageAggregate {
        UsageAggregate {
            requests,
            ..UsageAggregate::default()
        }
    }

    #[test]
    fn prune_drops_old_days_and_empty_parents() {
        let mut store = AccountStore::default();
        store.daily.insert("2026-01-01".into(), agg(1));
        store.daily.insert("2026-01-02".into(), agg(2));
        store
            .hourly
            .entry("2026-01-01".into())
            .or_default()
            .insert("05".into(), agg(1));

        store
            .daily_by_model
            .entry("old-model".into())
            .or_default()
            .insert("2026-01-01".into(), agg(1));
        store
            .daily_by_model
            .entry("gpt-4".into())
            .or_default()
            .insert("2026-01-02".into(), agg(2));

        store
            .daily_by_token
            .entry("7".into())
            .or_default()
            .insert("2026-01-01".into(), agg(1));
        store.token_names_by_id.insert("7".into(), "old key".into());
        store
            .daily_by_token
            .entry("9".into())
            .or_default()
            .insert("2026-01-02".into(), agg(1));
        store.token_names_by_id.insert("9".into(), "fresh key".into());

        store
            .daily_by_token_by_model
            .entry("7".into())
            .or_default()
            .entry("old-model".into())
            .or_default()
            .insert("2026-01-01".into(), agg(1));
        store
            .latency_daily_by_token_by_model
            .entry("7".into())
            .or_default()
            .entry("old-model".into())
            .or_default()
            .insert("2026-01-01".into(), LatencyAggregate::default());
        store
            .latency_daily
            .insert("2026-01-01".into(), LatencyAggregate::default());

        prune_account_store(&mut store, "2026-01-02");

        assert_eq!(store.daily.keys().collect::<Vec<_>>(), vec!["2026-01-02"]);
        assert!(store.hourly.is_empty());
        assert_eq!(
            store.daily_by_model.keys().collect::<Vec<_>>(),
            vec!["gpt-4"]
        );
        assert_eq!(store.daily_by_token.keys().collect::<Vec<_>>(), vec!["9"]);
        assert!(store.daily_by_token_by_model.is_empty());
        assert!(store.latency_daily_by_token_by_model.is_empty());
        assert!(store.latency_daily.is_empty());
        assert_eq!(
            store.token_names_by_id.keys().collect::<Vec<_>>(),
            vec!["9"]
        );
    }

    #[test]
    fn prune_is_idempotent() {
        let mut store = AccountStore::default();
        store.daily.insert("2026-01-03".into(), agg(3));
        prune_account_store(&mut store, "2026-01-02");
        let once = store.clone();
        prune_account_store(&mut store, "2026-01-02");
        assert_eq!(store, once);
    }

    #[test]
    fn cursor_truncation_keeps_most_recent() {
        let mut cursor = Cursor {
            last_seen_created_at: 10,
            fingerprints_at_last_seen_created_at: (0..300).map(|i| format!("fp{i}")).collect(),
        };
        cursor.truncate_fingerprints();
        assert_eq!(
            cursor.fingerprints_at_last_seen_created_at.len(),
            MAX_CURSOR_FINGERPRINTS
        );
        assert_eq!(cursor.fingerprints_at_last_seen_created_at[0], "fp44");
        assert!(cursor.contains(10, "fp299"));
        assert!(!cursor.contains(11, "fp299"));
    }
}
