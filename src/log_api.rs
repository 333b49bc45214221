use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::accounts::Account;
use crate::ingest::{LOG_TYPE_CONSUME, LogItem};
use crate::logging::{http_debug_options, make_body_preview};

/// Fixed page size for `/api/log/self` requests; total pages are derived from it.
pub const PAGE_SIZE: u32 = 100;

/// User-id headers understood by the New-API family of relays.
const USER_ID_HEADERS: [&str; 6] = [
    "New-API-User",
    "Veloera-User",
    "voapi-user",
    "User-id",
    "Rix-Api-User",
    "neo-api-user",
];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },
    #[error("API error: {message}")]
    Api { message: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("account {0} has neither an access token nor a cookie")]
    MissingCredentials(String),
}

impl FetchError {
    /// Failure signatures meaning the remote instance lacks the log endpoint.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, FetchError::Http { status, .. } if matches!(*status, 404 | 405 | 500))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogQuery {
    pub page: u32,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogPage {
    pub total: i64,
    pub items: Vec<LogItem>,
}

impl LogPage {
    /// `ceil(total / PAGE_SIZE)`; without a positive total, one page iff this page has items.
    pub fn total_pages(&self) -> u32 {
        if self.total <= 0 {
            return if self.items.is_empty() { 0 } else { 1 };
        }
        let pages = (self.total as u64).div_ceil(u64::from(PAGE_SIZE));
        u32::try_from(pages).unwrap_or(u32::MAX)
    }
}

/// Remote source of Consume log pages for one account.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn fetch_consume_page(
        &self,
        account: &Account,
        query: &LogQuery,
    ) -> Result<LogPage, FetchError>;
}

/// reqwest client for New-API compatible `/api/log/self`.
#[derive(Debug, Clone)]
pub struct NewApiClient {
    client: Client,
}

impl NewApiClient {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("usage-history/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

fn parse_envelope(body: &Value) -> Result<LogPage, FetchError> {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("request was not successful");
        return Err(FetchError::Api {
            message: message.to_string(),
        });
    }

    let data = body.get("data").filter(|d| d.is_object()).unwrap_or(body);
    let items = data
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::Decode("missing data.items".to_string()))?;
    let total = data
        .get("total")
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .unwrap_or(0);

    let parsed: Vec<LogItem> = items.iter().filter_map(LogItem::from_value).collect();
    if parsed.len() < items.len() {
        debug!(
            dropped = items.len() - parsed.len(),
            "dropped log items without created_at"
        );
    }
    Ok(LogPage {
        total,
        items: parsed,
    })
}

#[async_trait]
impl LogSource for NewApiClient {
    async fn fetch_consume_page(
        &self,
        account: &Account,
        query: &LogQuery,
    ) -> Result<LogPage, FetchError> {
        let token = account.auth.resolve_access_token();
        let cookie = account.auth.resolve_cookie();
        if token.is_none() && cookie.is_none() {
            return Err(FetchError::MissingCredentials(account.id.clone()));
        }

        let url = format!("{}/api/log/self", account.base_url);
        let mut request = self.client.get(&url).query(&[
            ("p", query.page.to_string()),
            ("page_size", PAGE_SIZE.to_string()),
            ("type", LOG_TYPE_CONSUME.to_string()),
            ("token_name", String::new()),
            ("model_name", String::new()),
            ("start_timestamp", query.start_timestamp.to_string()),
            ("end_timestamp", query.end_timestamp.to_string()),
            ("group", String::new()),
        ]);
        if let Some(token) = &token {
            request = request.bearer_auth(token);
        }
        if let Some(user_id) = account.user_id {
            for header in USER_ID_HEADERS {
                request = request.header(header, user_id.to_string());
            }
        }
        if let Some(cookie) = &cookie {
            request = request.header(reqwest::header::COOKIE, cookie);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let opt = http_debug_options();
            if opt.enabled {
                let content_type = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let bytes = resp.bytes().await.unwrap_or_default();
                let preview =
                    make_body_preview(&bytes, content_type.as_deref(), opt.max_body_bytes);
                warn!(
                    account_id = %account.id,
                    status = status.as_u16(),
                    body = ?preview,
                    "log endpoint returned non-success status"
                );
            }
            return Err(FetchError::Http {
                status: status.as_u16(),
                url,
            });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;
        parse_envelope(&body)
    }
}
