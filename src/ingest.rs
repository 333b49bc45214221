use chrono_tz::Tz;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::calendar::{day_key_from_unix_seconds, hour_key_from_unix_seconds};
use crate::history::{AccountStore, Cursor};
use crate::usage::{LatencyAggregate, UsageAggregate};

/// Upstream log type code for billable API calls.
pub const LOG_TYPE_CONSUME: i64 = 2;

const UNKNOWN_KEY: &str = "unknown";

/// The subset of an upstream `/api/log/self` record this crate consumes.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct LogItem {
    pub created_at: i64,
    #[serde(rename = "type")]
    pub log_type: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    pub quota: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub channel_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_name: Option<String>,
    /// Seconds; absent or non-numeric upstream values stay `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_time: Option<f64>,
}

pub(crate) fn to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

fn to_i64(v: Option<&Value>) -> Option<i64> {
    let v = v?;
    if let Some(n) = v.as_i64() {
        return Some(n);
    }
    to_f64(v).map(|f| f as i64)
}

fn to_string(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl LogItem {
    /// Lenient extraction from an upstream JSON record. Items without a usable `created_at`
    /// are rejected.
    pub fn from_value(value: &Value) -> Option<Self> {
        let created_at = to_i64(value.get("created_at"))?;
        Some(Self {
            created_at,
            log_type: to_i64(value.get("type")).unwrap_or(0),
            model_name: to_string(value.get("model_name")),
            quota: to_i64(value.get("quota")).unwrap_or(0),
            prompt_tokens: to_i64(value.get("prompt_tokens")).unwrap_or(0),
            completion_tokens: to_i64(value.get("completion_tokens")).unwrap_or(0),
            channel_id: to_i64(value.get("channel_id")).unwrap_or(0),
            token_id: to_i64(value.get("token_id")),
            token_name: to_string(value.get("token_name")),
            use_time: value.get("use_time").and_then(to_f64),
        })
    }

    pub fn is_consume(&self) -> bool {
        self.log_type == LOG_TYPE_CONSUME
    }

    fn model_key(&self) -> String {
        self.model_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN_KEY)
            .to_string()
    }

    fn token_key(&self) -> String {
        self.token_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| UNKNOWN_KEY.to_string())
    }

    fn usage_delta(&self) -> UsageAggregate {
        UsageAggregate::single(
            self.prompt_tokens.max(0) as u64,
            self.completion_tokens.max(0) as u64,
            self.quota.max(0) as u64,
        )
    }

    /// Latency in seconds when it is a finite non-negative number.
    fn latency_seconds(&self) -> Option<f64> {
        self.use_time.filter(|s| s.is_finite() && *s >= 0.0)
    }
}

/// Privacy-safe composite key used to dedupe items at the cursor boundary.
///
/// Upstream masks log ids, so two items are treated as the same record iff every field
/// below matches.
pub fn fingerprint_log_item(item: &LogItem) -> String {
    let use_time = match item.use_time {
        Some(s) if s.is_finite() => s.to_string(),
        _ => UNKNOWN_KEY.to_string(),
    };
    format!(
        "v1|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        item.created_at,
        item.log_type,
        item.model_name.as_deref().unwrap_or(""),
        item.quota,
        item.prompt_tokens,
        item.completion_tokens,
        item.channel_id,
        item.token_id.unwrap_or(0),
        use_time,
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub cursor_candidate: Cursor,
    pub ingested_count: usize,
}

/// Fold Consume items into `account_store` and advance the cursor candidate.
///
/// Boundary dedupe is evaluated against `start_cursor` (the cursor as it stood before the
/// run), never against the running candidate.
pub fn ingest_consume_log_items(
    account_store: &mut AccountStore,
    items: &[LogItem],
    start_cursor: &Cursor,
    mut cursor_candidate: Cursor,
    time_zone: Option<Tz>,
) -> IngestOutcome {
    let mut ingested_count = 0usize;

    for item in items {
        if !item.is_consume() {
            continue;
        }

        let fingerprint = fingerprint_log_item(item);
        if start_cursor.contains(item.created_at, &fingerprint) {
            continue;
        }

        let (Some(day_key), Some(hour_key)) = (
            day_key_from_unix_seconds(item.created_at, time_zone),
            hour_key_from_unix_seconds(item.created_at, time_zone),
        ) else {
            debug!(
                created_at = item.created_at,
                "skipping log item with out-of-range timestamp"
            );
            continue;
        };

        fold_item(account_store, item, &day_key, &hour_key);
        ingested_count += 1;

        if item.created_at > cursor_candidate.last_seen_created_at {
            cursor_candidate = Cursor {
                last_seen_created_at: item.created_at,
                fingerprints_at_last_seen_created_at: vec![fingerprint],
            };
        } else if item.created_at == cursor_candidate.last_seen_created_at
            && !cursor_candidate
                .fingerprints_at_last_seen_created_at
                .contains(&fingerprint)
        {
            cursor_candidate
                .fingerprints_at_last_seen_created_at
                .push(fingerprint);
        }
    }

    cursor_candidate.truncate_fingerprints();

    IngestOutcome {
        cursor_candidate,
        ingested_count,
    }
}

fn fold_item(store: &mut AccountStore, item: &LogItem, day_key: &str, hour_key: &str) {
    let delta = item.usage_delta();
    let model = item.model_key();
    let token = item.token_key();

    store.daily.entry(day_key.to_string()).or_default().merge(&delta);
    store
        .hourly
        .entry(day_key.to_string())
        .or_default()
        .entry(hour_key.to_string())
        .or_default()
        .merge(&delta);
    store
        .daily_by_model
        .entry(model.clone())
        .or_default()
        .entry(day_key.to_string())
        .or_default()
        .merge(&delta);

    if let Some(name) = item
        .token_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        store.token_names_by_id.insert(token.clone(), name.to_string());
    }

    store
        .daily_by_token
        .entry(token.clone())
        .or_default()
        .entry(day_key.to_string())
        .or_default()
        .merge(&delta);
    store
        .hourly_by_token
        .entry(token.clone())
        .or_default()
        .entry(day_key.to_string())
        .or_default()
        .entry(hour_key.to_string())
        .or_default()
        .merge(&delta);
    store
        .daily_by_token_by_model
        .entry(token.clone())
        .or_default()
        .entry(model.clone())
        .or_default()
        .entry(day_key.to_string())
        .or_default()
        .merge(&delta);

    let latency = item.latency_seconds();
    let apply = |agg: &mut LatencyAggregate| match latency {
        Some(seconds) => agg.record(seconds),
        None => agg.record_unknown(),
    };

    apply(store.latency_daily.entry(day_key.to_string()).or_default());
    apply(
        store
            .latency_daily_by_model
            .entry(model.clone())
            .or_default()
            .entry(day_key.to_string())
            .or_default(),
    );
    apply(
        store
            .latency_daily_by_token
            .entry(token.clone())
            .or_default()
            .entry(day_key.to_string())
            .or_default(),
    );
    apply(
        store
            .latency_daily_by_token_by_model
            .entry(token)
            .or_default()
            .entry(model)
            .or_default()
            .entry(day_key.to_string())
            .or_default(),
    );
}
