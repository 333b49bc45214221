use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

pub const DEFAULT_RETENTION_DAYS: u32 = 7;
pub const MAX_RETENTION_DAYS: u32 = 365;
pub const DEFAULT_SYNC_INTERVAL_MINUTES: u32 = 360;
pub const MAX_SYNC_INTERVAL_MINUTES: u32 = 24 * 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ScheduleMode {
    /// Recurring host timer.
    Alarm,
    /// Piggy-back on account refreshes.
    #[default]
    AfterRefresh,
    /// Only explicit manual syncs run.
    Manual,
}

impl ScheduleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleMode::Alarm => "alarm",
            ScheduleMode::AfterRefresh => "afterRefresh",
            ScheduleMode::Manual => "manual",
        }
    }
}

impl FromStr for ScheduleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "alarm" => Ok(ScheduleMode::Alarm),
            "afterRefresh" | "after-refresh" | "after_refresh" => Ok(ScheduleMode::AfterRefresh),
            "manual" => Ok(ScheduleMode::Manual),
            other => Err(format!(
                "unknown schedule mode {other:?} (expected alarm, afterRefresh or manual)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UsageHistoryPreferences {
    pub enabled: bool,
    pub retention_days: u32,
    pub schedule_mode: ScheduleMode,
    pub sync_interval_minutes: u32,
}

impl Default for UsageHistoryPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: DEFAULT_RETENTION_DAYS,
            schedule_mode: ScheduleMode::AfterRefresh,
            sync_interval_minutes: DEFAULT_SYNC_INTERVAL_MINUTES,
        }
    }
}

/// Clamp to `[1, 365]`, truncating fractions. Non-finite input yields the default.
pub fn clamp_retention_days(value: f64) -> u32 {
    if !value.is_finite() {
        return DEFAULT_RETENTION_DAYS;
    }
    value.trunc().clamp(1.0, f64::from(MAX_RETENTION_DAYS)) as u32
}

/// Clamp to `[1, 1440]`, truncating fractions. Non-finite input yields the default.
pub fn clamp_sync_interval_minutes(value: f64) -> u32 {
    if !value.is_finite() {
        return DEFAULT_SYNC_INTERVAL_MINUTES;
    }
    value
        .trunc()
        .clamp(1.0, f64::from(MAX_SYNC_INTERVAL_MINUTES)) as u32
}

/// Partial settings update. Numeric fields accept any JSON number and are clamped on merge.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, alias = "retention_days", skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<f64>,
    #[serde(default, alias = "schedule_mode", skip_serializing_if = "Option::is_none")]
    pub schedule_mode: Option<ScheduleMode>,
    #[serde(
        default,
        alias = "sync_interval_minutes",
        skip_serializing_if = "Option::is_none"
    )]
    pub sync_interval_minutes: Option<f64>,
}

impl PreferencesPatch {
    pub fn apply(&self, base: &UsageHistoryPreferences) -> UsageHistoryPreferences {
        UsageHistoryPreferences {
            enabled: self.enabled.unwrap_or(base.enabled),
            retention_days: clamp_retention_days(
                self.retention_days
                    .unwrap_or(f64::from(base.retention_days)),
            ),
            schedule_mode: self.schedule_mode.unwrap_or(base.schedule_mode),
            sync_interval_minutes: clamp_sync_interval_minutes(
                self.sync_interval_minutes
                    .unwrap_or(f64::from(base.sync_interval_minutes)),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AccountAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Environment variable holding the access token (preferred over storing secrets on disk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_env: Option<String>,
    /// Raw `Cookie` header value for session-cookie accounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
}

impl AccountAuth {
    pub fn resolve_access_token(&self) -> Option<String> {
        if let Some(token) = self.access_token.as_deref()
            && !token.trim().is_empty()
        {
            return Some(token.trim().to_string());
        }
        if let Some(env_name) = self.access_token_env.as_deref()
            && let Ok(v) = env::var(env_name)
            && !v.trim().is_empty()
        {
            return Some(v.trim().to_string());
        }
        None
    }

    pub fn resolve_cookie(&self) -> Option<String> {
        self.cookie
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountConfig {
    /// Display name; defaults to the map key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub base_url: String,
    /// Upstream numeric user id, sent as `New-API-User`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(flatten)]
    pub auth: AccountAuth,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub version: Option<u32>,
    /// IANA zone used for day/hour keys; host local time when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub usage_history: UsageHistoryPreferences,
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountConfig>,
}

const CONFIG_VERSION: u32 = 1;

fn ensure_config_version(cfg: &mut AppConfig) {
    if cfg.version.is_none() {
        cfg.version = Some(CONFIG_VERSION);
    }
}

const CONFIG_TOML_DOC_HEADER: &str = r#"# usage-history config.toml
#
# This file is optional. If present, usage-history will prefer it over config.json.
# - To keep secrets off disk, prefer `access_token_env` over `access_token`.
"#;

/// Home directory for config, store and logs. `USAGE_HISTORY_HOME` overrides `~/.usage-history`.
pub fn app_home_dir() -> PathBuf {
    if let Ok(dir) = env::var("USAGE_HISTORY_HOME")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".usage-history")
}

fn config_json_path(dir: &Path) -> PathBuf {
    dir.join("config.json")
}

fn config_toml_path(dir: &Path) -> PathBuf {
    dir.join("config.toml")
}

/// Return the config file that `load_config_from(dir)` reads.
pub fn config_file_path(dir: &Path) -> PathBuf {
    let toml_path = config_toml_path(dir);
    if toml_path.exists() {
        toml_path
    } else if config_json_path(dir).exists() {
        config_json_path(dir)
    } else {
        toml_path
    }
}

pub async fn load_config_from(dir: &Path) -> Result<AppConfig> {
    let toml_path = config_toml_path(dir);
    if toml_path.exists() {
        let text = fs::read_to_string(&toml_path)
            .await
            .with_context(|| format!("read {:?}", toml_path))?;
        let mut cfg = toml::from_str::<AppConfig>(&text)
            .with_context(|| format!("parse {:?}", toml_path))?;
        ensure_config_version(&mut cfg);
        return Ok(cfg);
    }

    let json_path = config_json_path(dir);
    if json_path.exists() {
        let bytes = fs::read(&json_path)
            .await
            .with_context(|| format!("read {:?}", json_path))?;
        let mut cfg = serde_json::from_slice::<AppConfig>(&bytes)
            .with_context(|| format!("parse {:?}", json_path))?;
        ensure_config_version(&mut cfg);
        return Ok(cfg);
    }

    let mut cfg = AppConfig::default();
    ensure_config_version(&mut cfg);
    Ok(cfg)
}

pub async fn save_config_to(dir: &Path, cfg: &AppConfig) -> Result<()> {
    let mut cfg = cfg.clone();
    ensure_config_version(&mut cfg);

    fs::create_dir_all(dir).await?;
    let toml_path = config_toml_path(dir);
    let json_path = config_json_path(dir);
    let (path, data) = if toml_path.exists() || !json_path.exists() {
        let body = toml::to_string_pretty(&cfg)?;
        let text = format!("{CONFIG_TOML_DOC_HEADER}\n{body}");
        (toml_path, text.into_bytes())
    } else {
        (json_path, serde_json::to_vec_pretty(&cfg)?)
    };

    let mut backup_name = path.as_os_str().to_owned();
    backup_name.push(".bak");
    let backup_path = PathBuf::from(backup_name);
    if path.exists()
        && let Err(err) = fs::copy(&path, &backup_path).await
    {
        warn!("failed to backup {:?} to {:?}: {}", path, backup_path, err);
    }

    let tmp_path = dir.join("config.tmp");
    fs::write(&tmp_path, &data).await?;
    fs::rename(&tmp_path, &path).await?;
    Ok(())
}

pub async fn load_config() -> Result<AppConfig> {
    load_config_from(&app_home_dir()).await
}

pub async fn save_config(cfg: &AppConfig) -> Result<()> {
    save_config_to(&app_home_dir(), cfg).await
}

/// Storage seam for the usage-history preferences block.
#[async_trait]
pub trait PreferencesStore: Send + Sync {
    async fn get_preferences(&self) -> UsageHistoryPreferences;
    async fn save_preferences(&self, prefs: &UsageHistoryPreferences) -> Result<()>;
}

/// Preferences persisted in the `[usage_history]` table of the config file.
#[derive(Debug, Clone)]
pub struct ConfigFilePreferences {
    dir: PathBuf,
}

impl ConfigFilePreferences {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PreferencesStore for ConfigFilePreferences {
    async fn get_preferences(&self) -> UsageHistoryPreferences {
        match load_config_from(&self.dir).await {
            Ok(cfg) => cfg.usage_history,
            Err(err) => {
                warn!("failed to load preferences, using defaults: {:#}", err);
                UsageHistoryPreferences::default()
            }
        }
    }

    async fn save_preferences(&self, prefs: &UsageHistoryPreferences) -> Result<()> {
        let mut cfg = load_config_from(&self.dir).await?;
        cfg.usage_history = *prefs;
        save_config_to(&self.dir, &cfg).await
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    inner: std::sync::Mutex<UsageHistoryPreferences>,
    fail_saves: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MemoryPreferences {
    pub fn new(prefs: UsageHistoryPreferences) -> Self {
        Self {
            inner: std::sync::Mutex::new(prefs),
            ..Self::default()
        }
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl PreferencesStore for MemoryPreferences {
    async fn get_preferences(&self) -> UsageHistoryPreferences {
        match self.inner.lock() {
            Ok(g) => *g,
            Err(e) => *e.into_inner(),
        }
    }

    async fn save_preferences(&self, prefs: &UsageHistoryPreferences) -> Result<()> {
        if self.fail_saves.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("preferences store is read-only");
        }
        match self.inner.lock() {
            Ok(mut g) => *g = *prefs,
            Err(e) => *e.into_inner() = *prefs,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::test_support::temp_dir;

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(path, content).expect("write test file");
    }

    #[test]
    fn clamps_settings_to_bounded_ranges() {
        assert_eq!(clamp_retention_days(0.0), 1);
        assert_eq!(clamp_retention_days(30.9), 30);
        assert_eq!(clamp_retention_days(10_000.0), 365);
        assert_eq!(clamp_retention_days(f64::NAN), DEFAULT_RETENTION_DAYS);

        assert_eq!(clamp_sync_interval_minutes(-5.0), 1);
        assert_eq!(clamp_sync_interval_minutes(90.5), 90);
        assert_eq!(clamp_sync_interval_minutes(1e9), 1440);
        assert_eq!(
            clamp_sync_interval_minutes(f64::INFINITY),
            DEFAULT_SYNC_INTERVAL_MINUTES
        );
    }

    #[test]
    fn patch_merges_and_clamps() {
        let patch: PreferencesPatch = serde_json::from_str(
            r#"{"retentionDays": 999.7, "sync_interval_minutes": 0, "scheduleMode": "manual"}"#,
        )
        .expect("patch");
        let merged = patch.apply(&UsageHistoryPreferences::default());
        assert_eq!(
            merged,
            UsageHistoryPreferences {
                enabled: true,
                retention_days: MAX_RETENTION_DAYS,
                schedule_mode: ScheduleMode::Manual,
                sync_interval_minutes: 1,
            }
        );
        assert_eq!(PreferencesPatch::default().apply(&merged), merged);
    }

    #[tokio::test]
    async fn load_config_prefers_toml_over_json() {
        let dir = temp_dir();
        write_file(
            &dir.join("config.json"),
            r#"{"version":1,"usage_history":{"enabled":false}}"#,
        );
        write_file(
            &dir.join("config.toml"),
            r#"
version = 1
time_zone = "Asia/Shanghai"

[usage_history]
enabled = true
schedule_mode = "alarm"

[accounts.main]
base_url = "https://relay.example"
user_id = 42
access_token_env = "RELAY_TOKEN"
"#,
        );

        let cfg = load_config_from(&dir).await.expect("load_config");
        assert!(cfg.usage_history.enabled);
        assert_eq!(cfg.usage_history.schedule_mode, ScheduleMode::Alarm);
        assert_eq!(cfg.usage_history.retention_days, DEFAULT_RETENTION_DAYS);
        assert_eq!(cfg.time_zone.as_deref(), Some("Asia/Shanghai"));
        let account = &cfg.accounts["main"];
        assert_eq!(account.user_id, Some(42));
        assert_eq!(account.auth.access_token_env.as_deref(), Some("RELAY_TOKEN"));
        assert!(!account.disabled);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn save_preferences_round_trips_through_toml() {
        let dir = temp_dir();
        let store = ConfigFilePreferences::new(&dir);
        assert_eq!(store.get_preferences().await, UsageHistoryPreferences::default());

        let prefs = UsageHistoryPreferences {
            enabled: false,
            retention_days: 30,
            schedule_mode: ScheduleMode::Manual,
            sync_interval_minutes: 60,
        };
        store.save_preferences(&prefs).await.expect("save");
        assert_eq!(store.get_preferences().await, prefs);

        let text = std::fs::read_to_string(dir.join("config.toml")).expect("read toml");
        assert!(text.starts_with("# usage-history config.toml"));
        assert!(text.contains("schedule_mode = \"manual\""));

        store.save_preferences(&prefs).await.expect("save again");
        assert!(dir.join("config.toml.bak").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn access_token_prefers_inline_value() {
        let auth = AccountAuth {
            access_token: Some("  inline  ".into()),
            access_token_env: Some("USAGE_HISTORY_TEST_UNSET_TOKEN".into()),
            cookie: Some("   ".into()),
        };
        assert_eq!(auth.resolve_access_token().as_deref(), Some("inline"));
        assert_eq!(auth.resolve_cookie(), None);
    }
}
