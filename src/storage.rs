use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono_tz::Tz;
use serde_json::Value;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::calendar::{is_day_key, is_hour_key, retention_cutoff_day_key};
use crate::history::{
    AccountStore, Cursor, STORE_SCHEMA_VERSION, Store, SyncState, SyncStatus,
    prune_account_store,
};
use crate::ingest::to_f64;
use crate::usage::{LATENCY_BUCKET_COUNT, LatencyAggregate, UsageAggregate};

/// Key under which the whole usage-history document is persisted.
pub const STORE_KEY: &str = "usage_history_store";

/// Minimal async key-value seam over JSON documents.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: &Value) -> Result<()>;
}

/// One pretty-printed JSON file per key inside `dir`, written via temp file + rename.
#[derive(Debug, Clone)]
pub struct JsonFileKv {
    dir: PathBuf,
}

impl JsonFileKv {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl KvStore for JsonFileKv {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("read {:?}", path))?;
        let value = serde_json::from_slice::<Value>(&bytes)
            .with_context(|| format!("parse {:?}", path))?;
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: &Value) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create {:?}", self.dir))?;
        let path = self.path_for(key);
        let tmp_path = self.dir.join(format!("{key}.json.tmp"));
        let data = serde_json::to_vec_pretty(value)?;
        fs::write(&tmp_path, &data)
            .await
            .with_context(|| format!("write {:?}", tmp_path))?;
        fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("rename {:?} -> {:?}", tmp_path, path))?;
        Ok(())
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<std::collections::HashMap<String, Value>>,
    failing_writes: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &Value) -> Result<()> {
        use std::sync::atomic::Ordering;
        if self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("disk full");
        }
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.clone());
        Ok(())
    }
}

// Sanitizers: rebuild a valid value from arbitrary persisted JSON. Invalid leaves become zero,
// invalid keys are dropped, and parents that end up empty are dropped.

fn non_negative_f64(value: Option<&Value>) -> f64 {
    value
        .and_then(to_f64)
        .filter(|f| *f > 0.0)
        .unwrap_or(0.0)
}

fn non_negative_u64(value: Option<&Value>) -> u64 {
    if let Some(n) = value.and_then(Value::as_u64) {
        return n;
    }
    non_negative_f64(value) as u64
}

fn sanitize_usage_aggregate(value: &Value) -> UsageAggregate {
    UsageAggregate {
        requests: non_negative_u64(value.get("requests")),
        prompt_tokens: non_negative_u64(value.get("promptTokens")),
        completion_tokens: non_negative_u64(value.get("completionTokens")),
        total_tokens: non_negative_u64(value.get("totalTokens")),
        quota_consumed: non_negative_u64(value.get("quotaConsumed")),
    }
}

fn sanitize_latency_aggregate(value: &Value) -> LatencyAggregate {
    let stored = value
        .get("buckets")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let len = stored.len().max(LATENCY_BUCKET_COUNT);
    let buckets = (0..len)
        .map(|i| non_negative_u64(stored.get(i)))
        .collect();

    LatencyAggregate {
        count: non_negative_u64(value.get("count")),
        sum: non_negative_f64(value.get("sum")),
        max: non_negative_f64(value.get("max")),
        slow_count: non_negative_u64(value.get("slowCount")),
        unknown_count: non_negative_u64(value.get("unknownCount")),
        buckets,
    }
}

fn sanitize_cursor(value: Option<&Value>) -> Cursor {
    let Some(value) = value else {
        return Cursor::default();
    };
    let last_seen_created_at = value
        .get("lastSeenCreatedAt")
        .and_then(Value::as_f64)
        .filter(|f| f.is_finite() && *f > 0.0)
        .map(|f| f as i64)
        .unwrap_or(0);
    let fingerprints_at_last_seen_created_at = value
        .get("fingerprintsAtLastSeenCreatedAt")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut cursor = Cursor {
        last_seen_created_at,
        fingerprints_at_last_seen_created_at,
    };
    cursor.truncate_fingerprints();
    cursor
}

fn timestamp_field(status: &Value, key: &str) -> Option<u64> {
    let v = status.get(key)?;
    v.as_u64().or_else(|| {
        v.as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0)
            .map(|f| f as u64)
    })
}

fn string_field(status: &Value, key: &str) -> Option<String> {
    status.get(key).and_then(Value::as_str).map(str::to_string)
}

fn sanitize_status(value: Option<&Value>) -> SyncStatus {
    let Some(status) = value.filter(|v| v.is_object()) else {
        return SyncStatus::default();
    };
    let state = match status.get("state").and_then(Value::as_str) {
        Some("success") => SyncState::Success,
        Some("error") => SyncState::Error,
        Some("unsupported") => SyncState::Unsupported,
        _ => SyncState::Never,
    };
    SyncStatus {
        state,
        last_sync_at: timestamp_field(status, "lastSyncAt"),
        last_success_at: timestamp_field(status, "lastSuccessAt"),
        last_warning: string_field(status, "lastWarning"),
        last_error: string_field(status, "lastError"),
        unsupported_until: timestamp_field(status, "unsupportedUntil"),
    }
}

fn sanitize_keyed<T>(
    value: Option<&Value>,
    accept_key: impl Fn(&str) -> bool,
    leaf: impl Fn(&Value) -> Option<T>,
) -> BTreeMap<String, T> {
    let Some(object) = value.and_then(Value::as_object) else {
        return BTreeMap::new();
    };
    object
        .iter()
        .filter(|(key, _)| accept_key(key.as_str()))
        .filter_map(|(key, v)| leaf(v).map(|t| (key.clone(), t)))
        .collect()
}

fn non_empty<K, V>(map: BTreeMap<K, V>) -> Option<BTreeMap<K, V>> {
    if map.is_empty() { None } else { Some(map) }
}

fn is_id_key(key: &str) -> bool {
    !key.is_empty()
}

fn usage_by_day(value: Option<&Value>) -> BTreeMap<String, UsageAggregate> {
    sanitize_keyed(value, is_day_key, |v| Some(sanitize_usage_aggregate(v)))
}

fn latency_by_day(value: Option<&Value>) -> BTreeMap<String, LatencyAggregate> {
    sanitize_keyed(value, is_day_key, |v| Some(sanitize_latency_aggregate(v)))
}

fn usage_by_day_by_hour(
    value: Option<&Value>,
) -> BTreeMap<String, BTreeMap<String, UsageAggregate>> {
    sanitize_keyed(value, is_day_key, |day| {
        non_empty(sanitize_keyed(Some(day), is_hour_key, |v| {
            Some(sanitize_usage_aggregate(v))
        }))
    })
}

fn by_id<T>(
    value: Option<&Value>,
    inner: impl Fn(Option<&Value>) -> BTreeMap<String, T>,
) -> BTreeMap<String, BTreeMap<String, T>> {
    sanitize_keyed(value, is_id_key, |v| non_empty(inner(Some(v))))
}

fn sanitize_token_names(value: Option<&Value>) -> BTreeMap<String, String> {
    sanitize_keyed(value, is_id_key, |v| {
        v.as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

pub fn sanitize_account_store(value: &Value) -> AccountStore {
    if !value.is_object() {
        return AccountStore::default();
    }
    AccountStore {
        cursor: sanitize_cursor(value.get("cursor")),
        status: sanitize_status(value.get("status")),
        daily: usage_by_day(value.get("daily")),
        hourly: usage_by_day_by_hour(value.get("hourly")),
        daily_by_model: by_id(value.get("dailyByModel"), usage_by_day),
        token_names_by_id: sanitize_token_names(value.get("tokenNamesById")),
        daily_by_token: by_id(value.get("dailyByToken"), usage_by_day),
        hourly_by_token: by_id(value.get("hourlyByToken"), usage_by_day_by_hour),
        daily_by_token_by_model: by_id(value.get("dailyByTokenByModel"), |v| {
            by_id(v, usage_by_day)
        }),
        latency_daily: latency_by_day(value.get("latencyDaily")),
        latency_daily_by_model: by_id(value.get("latencyDailyByModel"), latency_by_day),
        latency_daily_by_token: by_id(value.get("latencyDailyByToken"), latency_by_day),
        latency_daily_by_token_by_model: by_id(
            value.get("latencyDailyByTokenByModel"),
            |v| by_id(v, latency_by_day),
        ),
    }
}

/// Parse a persisted document. Anything with a different `schemaVersion` is discarded.
pub fn sanitize_store(value: &Value) -> Store {
    let version = value.get("schemaVersion").and_then(Value::as_u64);
    if version != Some(u64::from(STORE_SCHEMA_VERSION)) {
        if version.is_some() {
            warn!(
                stored = ?version,
                current = STORE_SCHEMA_VERSION,
                "usage history schema mismatch; starting from an empty store"
            );
        }
        return Store::default();
    }

    let accounts = value
        .get("accounts")
        .and_then(Value::as_object)
        .map(|accounts| {
            accounts
                .iter()
                .filter(|(id, _)| !id.is_empty())
                .map(|(id, v)| (id.clone(), sanitize_account_store(v)))
                .collect()
        })
        .unwrap_or_default();

    Store {
        schema_version: STORE_SCHEMA_VERSION,
        accounts,
    }
}

/// Persistence layer for the usage-history document.
///
/// All read-modify-write operations are serialized through one async lock so a write never
/// interleaves with another update of the same document.
pub struct UsageHistoryStorage {
    kv: Arc<dyn KvStore>,
    write_lock: Mutex<()>,
}

impl UsageHistoryStorage {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            write_lock: Mutex::new(()),
        }
    }

    /// Current store. Unreadable or corrupt data yields an empty store.
    pub async fn get_store(&self) -> Store {
        match self.kv.get(STORE_KEY).await {
            Ok(Some(value)) => sanitize_store(&value),
            Ok(None) => Store::default(),
            Err(err) => {
                warn!("failed to load usage history store: {:#}", err);
                Store::default()
            }
        }
    }

    async fn write(&self, store: &Store) -> Result<()> {
        let value = serde_json::to_value(store)?;
        self.kv
            .set(STORE_KEY, &value)
            .await
            .context("persist usage history store")
    }

    pub async fn update_store<F>(&self, updater: F) -> Result<Store>
    where
        F: FnOnce(&mut Store) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut store = self.get_store().await;
        updater(&mut store);
        self.write(&store).await?;
        Ok(store)
    }

    pub async fn get_account_store(&self, account_id: &str) -> AccountStore {
        self.get_store()
            .await
            .accounts
            .remove(account_id)
            .unwrap_or_default()
    }

    /// Atomic read-modify-write of one account's store, created lazily.
    pub async fn update_account_store<F>(
        &self,
        account_id: &str,
        updater: F,
    ) -> Result<AccountStore>
    where
        F: FnOnce(&mut AccountStore) + Send,
    {
        let mut store = self
            .update_store(|store| {
                let account = store.accounts.entry(account_id.to_string()).or_default();
                updater(account);
            })
            .await?;
        Ok(store.accounts.remove(account_id).unwrap_or_default())
    }

    /// Prune every account to the retention window ending at `now_unix_seconds`.
    pub async fn prune_all_accounts(
        &self,
        retention_days: u32,
        now_unix_seconds: i64,
        time_zone: Option<Tz>,
    ) -> Result<()> {
        let Some(cutoff) = retention_cutoff_day_key(retention_days, now_unix_seconds, time_zone)
        else {
            anyhow::bail!("cannot compute retention cutoff for now={now_unix_seconds}");
        };
        debug!(cutoff = %cutoff, retention_days, "pruning usage history");
        self.update_store(|store| {
            for account in store.accounts.values_mut() {
                prune_account_store(account, &cutoff);
            }
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::test_support::temp_dir;
    use serde_json::json;

    #[test]
    fn numeric_strings_in_persisted_aggregates_are_kept() {
        let aggregate = sanitize_usage_aggregate(&json!({
            "requests": "3",
            "totalTokens": " 7 ",
            "promptTokens": "-2",
            "quotaConsumed": "abc"
        }));
        assert_eq!(
            aggregate,
            UsageAggregate {
                requests: 3,
                total_tokens: 7,
                ..UsageAggregate::default()
            }
        );

        let latency =
            sanitize_latency_aggregate(&json!({ "count": "2", "sum": "1.5", "max": 1.0 }));
        assert_eq!(latency.count, 2);
        assert_eq!(latency.sum, 1.5);
    }

    #[test]
    fn sanitizer_rebuilds_valid_shapes_from_garbage() {
        let raw = json!({
            "schemaVersion": 1,
            "accounts": {
                "": { "daily": {} },
                "a1": {
                    "cursor": { "lastSeenCreatedAt": -5, "fingerprintsAtLastSeenCreatedAt": ["x", "", 3] },
                    "status": { "state": "bogus", "lastSyncAt": 10, "lastError": 42 },
                    "daily": {
                        "2024-01-01": { "requests": 2, "promptTokens": -3, "totalTokens": "7" },
                        "not-a-day": { "requests": 1 }
                    },
                    "hourly": { "2024-01-01": { "25": { "requests": 1 } } },
                    "dailyByModel": { "gpt-4": { "2024-01-01": { "requests": 1 } }, "empty": {} },
                    "tokenNamesById": { "1": "  main  ", "2": "", "3": 9 },
                    "latencyDaily": { "2024-01-01": { "count": 1, "buckets": [1] } }
                }
            }
        });

        let store = sanitize_store(&raw);
        assert_eq!(store.accounts.keys().collect::<Vec<_>>(), vec!["a1"]);
        let account = &store.accounts["a1"];

        assert_eq!(account.cursor.last_seen_created_at, 0);
        assert_eq!(account.cursor.fingerprints_at_last_seen_created_at, vec!["x"]);
        assert_eq!(account.status.state, SyncState::Never);
        assert_eq!(account.status.last_sync_at, Some(10));
        assert_eq!(account.status.last_error, None);

        assert_eq!(account.daily.len(), 1);
        assert_eq!(
            account.daily["2024-01-01"],
            UsageAggregate {
                requests: 2,
                total_tokens: 7,
                ..UsageAggregate::default()
            }
        );
        assert!(account.hourly.is_empty());
        assert_eq!(account.daily_by_model.keys().collect::<Vec<_>>(), vec!["gpt-4"]);
        assert_eq!(
            account.token_names_by_id,
            BTreeMap::from([("1".to_string(), "main".to_string())])
        );
        let latency = &account.latency_daily["2024-01-01"];
        assert_eq!(latency.buckets.len(), LATENCY_BUCKET_COUNT);
        assert_eq!(latency.buckets[0], 1);
    }

    #[test]
    fn schema_mismatch_resets_the_store() {
        let raw = json!({ "schemaVersion": 0, "accounts": { "a1": {} } });
        assert_eq!(sanitize_store(&raw), Store::default());
        assert_eq!(sanitize_store(&json!("nonsense")), Store::default());
    }

    #[tokio::test]
    async fn update_account_store_persists_through_file_backend() {
        let dir = temp_dir();
        let kv = Arc::new(JsonFileKv::new(&dir));
        let storage = UsageHistoryStorage::new(kv.clone());

        let updated = storage
            .update_account_store("a1", |account| {
                account
                    .daily
                    .insert("2024-01-01".into(), UsageAggregate::single(1, 2, 3));
            })
            .await
            .expect("update");
        assert_eq!(updated.daily["2024-01-01"].total_tokens, 3);

        let reopened = UsageHistoryStorage::new(Arc::new(JsonFileKv::new(&dir)));
        let account = reopened.get_account_store("a1").await;
        assert_eq!(account.daily["2024-01-01"].quota_consumed, 3);
        assert!(dir.join(format!("{STORE_KEY}.json")).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn corrupt_file_reads_as_empty() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join(format!("{STORE_KEY}.json")), b"{ not json").expect("write");

        let storage = UsageHistoryStorage::new(Arc::new(JsonFileKv::new(&dir)));
        assert_eq!(storage.get_store().await, Store::default());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn prune_all_accounts_applies_retention_cutoff() {
        let storage = UsageHistoryStorage::new(Arc::new(MemoryKv::new()));
        for id in ["a1", "a2"] {
            storage
                .update_account_store(id, |account| {
                    account
                        .daily
                        .insert("2023-12-01".into(), UsageAggregate::single(1, 1, 1));
                    account
                        .daily
                        .insert("2024-01-01".into(), UsageAggregate::single(1, 1, 1));
                })
                .await
                .expect("seed");
        }

        let utc = crate::calendar::resolve_time_zone(Some("UTC"));
        // 2024-01-01T23:30:00Z, 7-day window starts 2023-12-26.
        storage
            .prune_all_accounts(7, 1_704_151_800, utc)
            .await
            .expect("prune");

        let store = storage.get_store().await;
        for account in store.accounts.values() {
            assert_eq!(account.daily.keys().collect::<Vec<_>>(), vec!["2024-01-01"]);
        }
    }

    #[tokio::test]
    async fn concurrent_updates_do_not_lose_writes() {
        let storage = Arc::new(UsageHistoryStorage::new(Arc::new(MemoryKv::new())));
        let mut handles = Vec::new();
        for i in 0..16u64 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage
                    .update_account_store("a1", move |account| {
                        account
                            .daily
                            .entry("2024-01-01".into())
                            .or_default()
                            .merge(&UsageAggregate::single(i, 0, 0));
                    })
                    .await
                    .expect("update");
            }));
        }
        for h in handles {
            h.await.expect("join");
        }
        let account = storage.get_account_store("a1").await;
        assert_eq!(account.daily["2024-01-01"].requests, 16);
        assert_eq!(account.daily["2024-01-01"].prompt_tokens, (0..16).sum::<u64>());
    }
}
