use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{PreferencesPatch, UsageHistoryPreferences};
use crate::export::{ExportSelection, compute_export};
use crate::history::{Store, SyncStatus};
use crate::scheduler::Scheduler;

/// Message actions accepted from UI/background wiring, tagged by `action`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Action {
    UpdateSettings {
        #[serde(default)]
        settings: PreferencesPatch,
    },
    SyncNow {
        #[serde(default)]
        account_ids: Option<Vec<String>>,
    },
    Prune,
    AfterRefresh,
    Export(ExportSelection),
    Status,
}

const KNOWN_ACTIONS: [&str; 6] = [
    "updateSettings",
    "syncNow",
    "prune",
    "afterRefresh",
    "export",
    "status",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResponse {
    fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                error: None,
            },
            Err(err) => Self::failed(err.to_string()),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Parse a raw message. Unrecognized `action` tags map to "Unknown action".
pub fn parse_action(value: Value) -> Result<Action, String> {
    let tag = value.get("action").and_then(Value::as_str).unwrap_or_default();
    if !KNOWN_ACTIONS.contains(&tag) {
        return Err("Unknown action".to_string());
    }
    serde_json::from_value(value).map_err(|e| e.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatusView {
    pub account_id: String,
    #[serde(flatten)]
    pub status: SyncStatus,
    pub cursor_created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub preferences: UsageHistoryPreferences,
    pub running: bool,
    pub accounts: Vec<AccountStatusView>,
}

pub fn account_statuses(store: &Store) -> Vec<AccountStatusView> {
    store
        .accounts
        .iter()
        .map(|(id, account)| AccountStatusView {
            account_id: id.clone(),
            status: account.status.clone(),
            cursor_created_at: account.cursor.last_seen_created_at,
        })
        .collect()
}

pub async fn status_report(scheduler: &Scheduler) -> StatusReport {
    let store = scheduler.storage().get_store().await;
    StatusReport {
        preferences: scheduler.preferences().await,
        running: scheduler.is_running(),
        accounts: account_statuses(&store),
    }
}

pub async fn handle_action(scheduler: &Scheduler, action: Action) -> ActionResponse {
    debug!(?action, "handling usage history action");
    match action {
        Action::UpdateSettings { settings } => match scheduler.update_settings(&settings).await {
            Ok(outcome) => ActionResponse::ok(outcome),
            Err(err) => ActionResponse::failed(format!("{err:#}")),
        },
        Action::SyncNow { account_ids } => {
            ActionResponse::ok(scheduler.run_manual_sync(account_ids).await)
        }
        Action::AfterRefresh => ActionResponse::ok(scheduler.run_after_refresh_sync().await),
        Action::Prune => match scheduler.prune().await {
            Ok(()) => ActionResponse {
                success: true,
                ..ActionResponse::default()
            },
            Err(err) => ActionResponse::failed(format!("{err:#}")),
        },
        Action::Export(selection) => {
            let store = scheduler.storage().get_store().await;
            match compute_export(&store, &selection, scheduler.now_ms()) {
                Ok(export) => ActionResponse::ok(export),
                Err(err) => ActionResponse::failed(err.to_string()),
            }
        }
        Action::Status => ActionResponse::ok(status_report(scheduler).await),
    }
}

pub async fn handle_message(scheduler: &Scheduler, message: Value) -> ActionResponse {
    match parse_action(message) {
        Ok(action) => handle_action(scheduler, action).await,
        Err(message) => {
            warn!("rejected usage history action: {}", message);
            ActionResponse::failed(message)
        }
    }
}

/// Loopback control API.
pub fn router(scheduler: Arc<Scheduler>) -> Router {
    async fn post_action(
        scheduler: Arc<Scheduler>,
        Json(message): Json<Value>,
    ) -> Json<ActionResponse> {
        Json(handle_message(&scheduler, message).await)
    }

    async fn get_status(scheduler: Arc<Scheduler>) -> Json<StatusReport> {
        Json(status_report(&scheduler).await)
    }

    let s0 = scheduler.clone();
    let s1 = scheduler;

    Router::new()
        .route(
            "/__usage_history/action",
            post(move |payload| post_action(s0.clone(), payload)),
        )
        .route(
            "/__usage_history/status",
            get(move || get_status(s1.clone())),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::accounts::test_account;
    use crate::config::ScheduleMode;
    use crate::scheduler::tests::harness;
    use crate::scheduler::{ALARMS_UNSUPPORTED_ON_UPDATE, NoAlarms};
    use crate::sync::tests::prefs;
    use crate::test_support::spawn_axum_server;

    #[test]
    fn parses_tagged_actions() {
        assert_eq!(
            parse_action(json!({ "action": "syncNow", "accountIds": ["a1"] })),
            Ok(Action::SyncNow {
                account_ids: Some(vec!["a1".into()])
            })
        );
        assert_eq!(
            parse_action(json!({ "action": "syncNow" })),
            Ok(Action::SyncNow { account_ids: None })
        );
        assert_eq!(
            parse_action(json!({
                "action": "export",
                "startDay": "2024-01-01",
                "endDay": "2024-01-02"
            })),
            Ok(Action::Export(ExportSelection {
                account_ids: Vec::new(),
                start_day: "2024-01-01".into(),
                end_day: "2024-01-02".into(),
            }))
        );
        assert_eq!(
            parse_action(json!({ "action": "explode" })),
            Err("Unknown action".to_string())
        );
        assert_eq!(parse_action(json!({})), Err("Unknown action".to_string()));
    }

    #[tokio::test]
    async fn settings_sync_and_export_round_through_handler() {
        let h = harness(
            vec![test_account("a1", "http://relay")],
            prefs(),
            Arc::new(NoAlarms::new()),
        );

        let resp = handle_message(
            &h.scheduler,
            json!({ "action": "updateSettings", "settings": { "scheduleMode": "alarm" } }),
        )
        .await;
        assert!(resp.success);
        assert_eq!(
            resp.data,
            Some(json!({ "warning": ALARMS_UNSUPPORTED_ON_UPDATE }))
        );
        assert_eq!(
            h.scheduler.preferences().await.schedule_mode,
            ScheduleMode::AfterRefresh
        );

        let resp = handle_message(&h.scheduler, json!({ "action": "syncNow" })).await;
        assert!(resp.success);
        let data = resp.data.expect("data");
        assert_eq!(data["totals"]["success"], json!(1));
        assert_eq!(data["perAccount"][0]["ingestedCount"], json!(1));

        let resp = handle_message(
            &h.scheduler,
            json!({ "action": "export", "startDay": "2024-01-01", "endDay": "2024-01-01" }),
        )
        .await;
        assert!(resp.success);
        let data = resp.data.expect("data");
        assert_eq!(data["schemaVersion"], json!(1));
        assert_eq!(data["fused"]["daily"]["2024-01-01"]["requests"], json!(1));

        let resp = handle_message(
            &h.scheduler,
            json!({ "action": "export", "startDay": "2024-02-01", "endDay": "2024-01-01" }),
        )
        .await;
        assert!(!resp.success);

        let resp = handle_message(&h.scheduler, json!({ "action": "prune" })).await;
        assert_eq!(
            resp,
            ActionResponse {
                success: true,
                ..ActionResponse::default()
            }
        );
    }

    #[tokio::test]
    async fn http_api_serves_actions_and_status() {
        let h = harness(
            vec![test_account("a1", "http://relay")],
            prefs(),
            Arc::new(NoAlarms::new()),
        );
        let (addr, handle) = spawn_axum_server(router(h.scheduler.clone()));
        let client = reqwest::Client::new();

        let resp: ActionResponse = client
            .post(format!("http://{addr}/__usage_history/action"))
            .json(&json!({ "action": "nope" }))
            .send()
            .await
            .expect("send")
            .json()
            .await
            .expect("json");
        assert_eq!(resp.error.as_deref(), Some("Unknown action"));

        let resp: ActionResponse = client
            .post(format!("http://{addr}/__usage_history/action"))
            .json(&json!({ "action": "syncNow", "accountIds": ["a1"] }))
            .send()
            .await
            .expect("send")
            .json()
            .await
            .expect("json");
        assert!(resp.success);

        let status: StatusReport = client
            .get(format!("http://{addr}/__usage_history/status"))
            .send()
            .await
            .expect("send")
            .json()
            .await
            .expect("json");
        assert!(!status.running);
        assert_eq!(status.accounts.len(), 1);
        assert_eq!(status.accounts[0].account_id, "a1");
        assert_eq!(
            status.accounts[0].status.last_success_at,
            Some(crate::scheduler::tests::NOW_MS)
        );

        handle.abort();
    }
}
