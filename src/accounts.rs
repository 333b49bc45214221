use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::config::{AccountAuth, AccountConfig, AppConfig, load_config_from};

/// A tracked relay account, resolved from config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip)]
    pub auth: AccountAuth,
    pub disabled: bool,
}

impl Account {
    pub fn from_config(id: &str, cfg: &AccountConfig) -> Self {
        Self {
            id: id.to_string(),
            name: cfg
                .name
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(id)
                .to_string(),
            base_url: cfg.base_url.trim().trim_end_matches('/').to_string(),
            user_id: cfg.user_id,
            auth: cfg.auth.clone(),
            disabled: cfg.disabled,
        }
    }
}

pub fn accounts_from_config(cfg: &AppConfig) -> Vec<Account> {
    cfg.accounts
        .iter()
        .map(|(id, account)| Account::from_config(id, account))
        .collect()
}

#[async_trait]
pub trait AccountRegistry: Send + Sync {
    async fn get_account_by_id(&self, id: &str) -> Option<Account>;
    async fn get_enabled_accounts(&self) -> Vec<Account>;
}

/// Registry backed by the `[accounts.*]` tables of the config file. Re-read on every call so
/// edits made by other commands are picked up by a running daemon.
#[derive(Debug, Clone)]
pub struct ConfigAccountRegistry {
    dir: PathBuf,
}

impl ConfigAccountRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn load(&self) -> Vec<Account> {
        match load_config_from(&self.dir).await {
            Ok(cfg) => accounts_from_config(&cfg),
            Err(err) => {
                warn!("failed to load accounts from config: {:#}", err);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl AccountRegistry for ConfigAccountRegistry {
    async fn get_account_by_id(&self, id: &str) -> Option<Account> {
        self.load().await.into_iter().find(|a| a.id == id)
    }

    async fn get_enabled_accounts(&self) -> Vec<Account> {
        self.load()
            .await
            .into_iter()
            .filter(|a| !a.disabled)
            .collect()
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct StaticAccounts(pub Vec<Account>);

#[cfg(test)]
#[async_trait]
impl AccountRegistry for StaticAccounts {
    async fn get_account_by_id(&self, id: &str) -> Option<Account> {
        self.0.iter().find(|a| a.id == id).cloned()
    }

    async fn get_enabled_accounts(&self) -> Vec<Account> {
        self.0.iter().filter(|a| !a.disabled).cloned().collect()
    }
}

#[cfg(test)]
pub fn test_account(id: &str, base_url: &str) -> Account {
    Account {
        id: id.to_string(),
        name: id.to_string(),
        base_url: base_url.to_string(),
        user_id: Some(1),
        auth: AccountAuth {
            access_token: Some("test-token".to_string()),
            ..AccountAuth::default()
        },
        disabled: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::config::save_config_to;
    use crate::test_support::temp_dir;

    #[tokio::test]
    async fn config_registry_filters_disabled_accounts() {
        let dir = temp_dir();
        let mut cfg = AppConfig::default();
        cfg.accounts.insert(
            "a1".into(),
            AccountConfig {
                name: None,
                base_url: "https://one.example/".into(),
                user_id: Some(7),
                auth: AccountAuth::default(),
                disabled: false,
            },
        );
        cfg.accounts.insert(
            "a2".into(),
            AccountConfig {
                name: Some("Second".into()),
                base_url: "https://two.example".into(),
                user_id: None,
                auth: AccountAuth::default(),
                disabled: true,
            },
        );
        save_config_to(&dir, &cfg).await.expect("save");

        let registry = ConfigAccountRegistry::new(&dir);
        let enabled = registry.get_enabled_accounts().await;
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "a1");
        assert_eq!(enabled[0].base_url, "https://one.example");

        let disabled = registry.get_account_by_id("a2").await.expect("a2");
        assert!(disabled.disabled);
        assert_eq!(disabled.name, "Second");
        assert!(registry.get_account_by_id("missing").await.is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
