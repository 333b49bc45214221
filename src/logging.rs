use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::app_home_dir;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn env_bool(key: &str) -> bool {
    let Ok(v) = std::env::var(key) else {
        return false;
    };
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

pub fn logs_dir() -> PathBuf {
    app_home_dir().join("logs")
}

/// Install the global subscriber. With `file_dir`, events are also written to a daily-rolling
/// `usage-history.log` there; keep the returned guard alive to flush it.
pub fn init_tracing(file_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(dir) = file_dir else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return None;
    };

    let _ = fs::create_dir_all(dir);
    let appender = tracing_appender::rolling::daily(dir, "usage-history.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
    Some(guard)
}

#[derive(Debug, Clone, Copy)]
pub struct HttpDebugOptions {
    pub enabled: bool,
    pub max_body_bytes: usize,
}

pub fn http_debug_options() -> HttpDebugOptions {
    static OPT: OnceLock<HttpDebugOptions> = OnceLock::new();
    *OPT.get_or_init(|| {
        let enabled = env_bool("USAGE_HISTORY_HTTP_DEBUG");
        let max_body_bytes = std::env::var("USAGE_HISTORY_HTTP_DEBUG_BODY_MAX")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(4 * 1024);
        HttpDebugOptions {
            enabled,
            max_body_bytes,
        }
    })
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct BodyPreview {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub encoding: String,
    pub data: String,
    pub truncated: bool,
    pub original_len: usize,
}

fn normalize_content_type(content_type: Option<&str>) -> Option<&str> {
    let ct = content_type?.trim();
    let (base, _) = ct.split_once(';').unwrap_or((ct, ""));
    let base = base.trim();
    if base.is_empty() { None } else { Some(base) }
}

fn is_textual_content_type(content_type: Option<&str>) -> bool {
    let Some(ct) = normalize_content_type(content_type) else {
        return false;
    };
    ct.starts_with("text/")
        || ct == "application/json"
        || ct.ends_with("+json")
        || ct == "application/xml"
        || ct.ends_with("+xml")
}

/// Bounded preview of a response body: utf8 for textual content types, base64 otherwise.
pub fn make_body_preview(bytes: &[u8], content_type: Option<&str>, max: usize) -> BodyPreview {
    let original_len = bytes.len();
    let take = original_len.min(max);
    let truncated = original_len > take;
    let slice = &bytes[..take];

    let (encoding, data) = if is_textual_content_type(content_type) {
        ("utf8", String::from_utf8_lossy(slice).into_owned())
    } else {
        (
            "base64",
            base64::engine::general_purpose::STANDARD.encode(slice),
        )
    };
    BodyPreview {
        content_type: normalize_content_type(content_type).map(|s| s.to_string()),
        encoding: encoding.to_string(),
        data,
        truncated,
        original_len,
    }
}

/// One journal line per account sync attempt. Only counters are recorded, never log items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncRunRecord {
    pub timestamp_ms: u64,
    pub trigger: String,
    pub account_id: String,
    pub status: String,
    pub ingested_count: usize,
    pub pages_fetched: u32,
    pub items_fetched: usize,
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct JournalOptions {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl JournalOptions {
    pub fn from_env() -> Self {
        static OPT: OnceLock<JournalOptions> = OnceLock::new();
        *OPT.get_or_init(|| {
            let max_bytes = std::env::var("USAGE_HISTORY_SYNC_LOG_MAX_BYTES")
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .filter(|&n| n > 0)
                .unwrap_or(10 * 1024 * 1024);
            let max_files = std::env::var("USAGE_HISTORY_SYNC_LOG_MAX_FILES")
                .ok()
                .and_then(|s| s.trim().parse::<usize>().ok())
                .filter(|&n| n > 0)
                .unwrap_or(5);
            JournalOptions {
                max_bytes,
                max_files,
            }
        })
    }
}

/// Append-only JSONL journal of sync attempts with size-based rotation.
#[derive(Debug, Clone)]
pub struct SyncRunJournal {
    path: PathBuf,
    options: JournalOptions,
}

fn journal_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

pub fn default_journal_path() -> PathBuf {
    logs_dir().join("sync_runs.jsonl")
}

impl SyncRunJournal {
    pub fn new(path: impl Into<PathBuf>, options: JournalOptions) -> Self {
        Self {
            path: path.into(),
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best effort: journal failures never affect a sync.
    pub fn append(&self, record: &SyncRunRecord) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _guard = match journal_lock().lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };

        rotate_and_prune_if_needed(&self.path, self.options);
        if let Ok(line) = serde_json::to_string(record)
            && let Ok(mut file) = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
        {
            let _ = writeln!(file, "{}", line);
        }
    }
}

fn rotate_and_prune_if_needed(path: &Path, opt: JournalOptions) {
    if opt.max_bytes == 0 {
        return;
    }
    let Ok(meta) = fs::metadata(path) else {
        return;
    };
    if meta.len() < opt.max_bytes {
        return;
    }

    let prefix = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("sync_runs");
    let rotated_path = path.with_file_name(format!("{prefix}.{}.jsonl", now_ms()));
    let _ = fs::rename(path, &rotated_path);

    let Some(dir) = path.parent() else {
        return;
    };
    let Ok(rd) = fs::read_dir(dir) else {
        return;
    };
    let rotated_prefix = format!("{prefix}.");
    let mut rotated: Vec<PathBuf> = rd
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|s| s.starts_with(&rotated_prefix) && s.ends_with(".jsonl"))
                .unwrap_or(false)
                && p.as_path() != path
        })
        .collect();
    if rotated.len() <= opt.max_files {
        return;
    }
    rotated.sort();
    let remove_count = rotated.len().saturating_sub(opt.max_files);
    for p in rotated.into_iter().take(remove_count) {
        let _ = fs::remove_file(p);
    }
}
