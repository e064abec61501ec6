use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::{Method, StatusCode, Url};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::ConnectionSettings;
use crate::error::StoreError;

pub const DEFAULT_USER_AGENT: &str = concat!("confdoc/", env!("CARGO_PKG_VERSION"));

const PAGE_EXPAND: &str = "body.storage,version";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemotePage {
    pub id: u64,
    pub title: String,
    pub version: u64,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPage {
    pub space_key: String,
    pub title: String,
    pub parent_id: u64,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageUpdate {
    pub page_id: u64,
    pub space_key: String,
    pub title: String,
    pub body: String,
    /// Version the body was merged against; the stored version becomes `expected_version + 1`.
    pub expected_version: u64,
    pub minor_edit: bool,
}

/// Persistence seam for pages. `ConfluenceClient` is the HTTP implementation.
pub trait PageStore {
    fn get_page_by_id(&mut self, page_id: u64) -> Result<Option<RemotePage>>;
    fn find_pages_by_title(&mut self, space_key: &str, title: &str) -> Result<Vec<RemotePage>>;
    fn search_pages(&mut self, space_key: &str, query: &str) -> Result<Vec<RemotePage>>;
    fn space_homepage_id(&mut self, space_key: &str) -> Result<u64>;
    fn create_page(&mut self, page: &NewPage) -> Result<RemotePage>;
    /// Fails with [`StoreError::VersionConflict`] when the page moved past `expected_version`.
    fn update_page(&mut self, update: &PageUpdate) -> Result<RemotePage>;
    fn add_labels(&mut self, page_id: u64, labels: &[String]) -> Result<()>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct ConfluenceClientConfig {
    pub server: String,
    pub username: String,
    pub password: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub max_retries: usize,
    /// Retry budget for PUT/POST; a retried write may already have been applied.
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl ConfluenceClientConfig {
    pub fn from_settings(settings: &ConnectionSettings) -> Result<Self> {
        let Some(server) = settings.server.as_deref() else {
            bail!("Confluence server is required (--server, CONFLUENCE_SERVER or \"server\" in config)");
        };
        let Some(username) = settings.username.as_deref() else {
            bail!("Confluence username is required (--username, CONFLUENCE_USERNAME or \"username\" in config)");
        };
        let Some(password) = settings.password.as_deref() else {
            bail!("Confluence password is required (--password, CONFLUENCE_PASSWORD or \"password\" in config)");
        };
        Ok(Self {
            server: server.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            user_agent: env_value("CONFDOC_USER_AGENT", DEFAULT_USER_AGENT),
            timeout_ms: env_value_u64("CONFDOC_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_ms: env_value_u64("CONFDOC_RATE_LIMIT_MS", 0),
            max_retries: env_value_usize("CONFDOC_HTTP_RETRIES", 2),
            max_write_retries: env_value_usize("CONFDOC_HTTP_WRITE_RETRIES", 1),
            retry_delay_ms: env_value_u64("CONFDOC_HTTP_RETRY_DELAY_MS", 500),
        })
    }
}

pub struct ConfluenceClient {
    client: Client,
    config: ConfluenceClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

enum ApiResponse {
    Success(Value),
    Failure { status: StatusCode, message: String },
}

impl ConfluenceClient {
    pub fn new(config: ConfluenceClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Confluence HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let raw = format!("{}/rest/api/{path}", self.config.server);
        Url::parse(&raw).with_context(|| format!("invalid Confluence server URL: {raw}"))
    }

    fn request_json(
        &mut self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<ApiResponse> {
        let url = self.endpoint(path)?;
        let is_write = method != Method::GET;
        let idempotent = method != Method::POST;
        let max_retries = if is_write {
            self.config.max_write_retries
        } else {
            self.config.max_retries
        };

        for attempt in 0..=max_retries {
            self.apply_rate_limit();
            debug!(method = %method, url = %url, attempt, "confluence request");
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .basic_auth(&self.config.username, Some(&self.config.password))
                .header("User-Agent", self.config.user_agent.clone())
                .header("Accept", "application/json")
                .query(query);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send() {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let payload: Value = response
                            .json()
                            .context("failed to decode Confluence API JSON response")?;
                        return Ok(ApiResponse::Success(payload));
                    }
                    if attempt < max_retries && is_retryable_status(status, idempotent) {
                        warn!(%status, attempt, "retrying Confluence request");
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    let message = response.text().unwrap_or_default();
                    return Ok(ApiResponse::Failure {
                        status,
                        message: error_message(&message),
                    });
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error, idempotent) {
                        warn!(%error, attempt, "retrying Confluence request");
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(error).context("failed to call Confluence API");
                }
            }
        }

        bail!("Confluence API request exhausted retry budget")
    }

    fn request_success(
        &mut self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        match self.request_json(method, path, query, body)? {
            ApiResponse::Success(payload) => Ok(payload),
            ApiResponse::Failure { status, message } => Err(StoreError::Http {
                status: status.as_u16(),
                message,
            }
            .into()),
        }
    }

    fn content_list(&mut self, path: &str, query: &[(&str, String)]) -> Result<Vec<RemotePage>> {
        let payload = self.request_success(Method::GET, path, query, None)?;
        let parsed: ContentList =
            serde_json::from_value(payload).context("failed to decode content list response")?;
        Ok(parsed.results.into_iter().map(RemotePage::from).collect())
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        sleep(Duration::from_millis(
            base.saturating_mul(multiplier).saturating_add(jitter),
        ));
    }
}

impl PageStore for ConfluenceClient {
    fn get_page_by_id(&mut self, page_id: u64) -> Result<Option<RemotePage>> {
        let path = format!("content/{page_id}");
        let query = [("expand", PAGE_EXPAND.to_string())];
        match self.request_json(Method::GET, &path, &query, None)? {
            ApiResponse::Success(payload) => {
                let item: ContentItem = serde_json::from_value(payload)
                    .with_context(|| format!("failed to decode page {page_id}"))?;
                Ok(Some(RemotePage::from(item)))
            }
            ApiResponse::Failure { status, .. } if status == StatusCode::NOT_FOUND => Ok(None),
            ApiResponse::Failure { status, message } => Err(StoreError::Http {
                status: status.as_u16(),
                message,
            }
            .into()),
        }
    }

    fn find_pages_by_title(&mut self, space_key: &str, title: &str) -> Result<Vec<RemotePage>> {
        self.content_list(
            "content",
            &[
                ("spaceKey", space_key.to_string()),
                ("title", title.to_string()),
                ("expand", PAGE_EXPAND.to_string()),
            ],
        )
    }

    fn search_pages(&mut self, space_key: &str, query: &str) -> Result<Vec<RemotePage>> {
        self.content_list(
            "content/search",
            &[
                ("cql", search_cql(space_key, query)),
                ("expand", PAGE_EXPAND.to_string()),
            ],
        )
    }

    fn space_homepage_id(&mut self, space_key: &str) -> Result<u64> {
        let payload = self.request_success(
            Method::GET,
            &format!("space/{space_key}"),
            &[("expand", "homepage".to_string())],
            None,
        )?;
        let parsed: SpaceInfo = serde_json::from_value(payload)
            .with_context(|| format!("failed to decode space {space_key}"))?;
        parsed
            .homepage
            .map(|homepage| homepage.id)
            .ok_or_else(|| StoreError::MissingSpaceHome(space_key.to_string()).into())
    }

    fn create_page(&mut self, page: &NewPage) -> Result<RemotePage> {
        let payload = json!({
            "type": "page",
            "title": page.title,
            "space": { "key": page.space_key },
            "ancestors": [{ "id": page.parent_id }],
            "body": { "storage": { "value": page.body, "representation": "storage" } },
        });
        let response = self
            .request_success(Method::POST, "content", &[], Some(&payload))
            .with_context(|| format!("failed to create page '{}'", page.title))?;
        let item: ContentItem =
            serde_json::from_value(response).context("failed to decode created page")?;
        Ok(RemotePage::from(item))
    }

    fn update_page(&mut self, update: &PageUpdate) -> Result<RemotePage> {
        let payload = json!({
            "id": update.page_id.to_string(),
            "type": "page",
            "title": update.title,
            "space": { "key": update.space_key },
            "body": { "storage": { "value": update.body, "representation": "storage" } },
            "version": { "number": update.expected_version + 1, "minorEdit": update.minor_edit },
        });
        let path = format!("content/{}", update.page_id);
        match self.request_json(Method::PUT, &path, &[], Some(&payload))? {
            ApiResponse::Success(response) => {
                let item: ContentItem =
                    serde_json::from_value(response).context("failed to decode updated page")?;
                Ok(RemotePage::from(item))
            }
            ApiResponse::Failure { status, .. } if status == StatusCode::CONFLICT => {
                Err(StoreError::VersionConflict {
                    page_id: update.page_id,
                    version: update.expected_version,
                }
                .into())
            }
            ApiResponse::Failure { status, message } => Err(StoreError::Http {
                status: status.as_u16(),
                message,
            })
            .with_context(|| format!("failed to update page {}", update.page_id)),
        }
    }

    fn add_labels(&mut self, page_id: u64, labels: &[String]) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let payload = Value::Array(
            labels
                .iter()
                .map(|label| json!({ "prefix": "global", "name": label }))
                .collect(),
        );
        self.request_success(
            Method::POST,
            &format!("content/{page_id}/label"),
            &[],
            Some(&payload),
        )
        .with_context(|| format!("failed to add labels to page {page_id}"))?;
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

pub fn search_cql(space_key: &str, query: &str) -> String {
    let space = escape_cql(space_key);
    let query = escape_cql(query);
    format!("space=\"{space}\" AND (text~\"{query}\" OR title~\"{query}\")")
}

fn escape_cql(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|payload| {
            payload
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().chars().take(300).collect())
}

fn env_value(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

/// Gateway failures can hide a committed POST, so those only retry idempotent methods.
fn is_retryable_status(status: StatusCode, idempotent: bool) -> bool {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => true,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            idempotent
        }
        _ => false,
    }
}

fn is_retryable_error(error: &reqwest::Error, idempotent: bool) -> bool {
    error.is_connect() || (idempotent && error.is_timeout())
}

#[derive(Debug, Deserialize)]
struct ContentList {
    #[serde(default)]
    results: Vec<ContentItem>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    #[serde(deserialize_with = "content_id")]
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    version: Option<VersionInfo>,
    #[serde(default)]
    body: Option<BodyInfo>,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct BodyInfo {
    #[serde(default)]
    storage: Option<StorageInfo>,
}

#[derive(Debug, Deserialize)]
struct StorageInfo {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct SpaceInfo {
    #[serde(default)]
    homepage: Option<HomepageRef>,
}

#[derive(Debug, Deserialize)]
struct HomepageRef {
    #[serde(deserialize_with = "content_id")]
    id: u64,
}

impl From<ContentItem> for RemotePage {
    fn from(item: ContentItem) -> Self {
        Self {
            id: item.id,
            title: item.title,
            version: item.version.map(|version| version.number).unwrap_or(1),
            body: item
                .body
                .and_then(|body| body.storage)
                .map(|storage| storage.value)
                .unwrap_or_default(),
        }
    }
}

fn content_id<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => text
            .trim()
            .parse::<u64>()
            .map_err(|_| de::Error::custom(format!("invalid content id '{text}'"))),
        Value::Number(number) => number
            .as_u64()
            .ok_or_else(|| de::Error::custom(format!("invalid content id {number}"))),
        other => Err(de::Error::custom(format!("invalid content id {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use reqwest::StatusCode;
    use serde_json::json;

    use super::{
        ConfluenceClient, ConfluenceClientConfig, ContentItem, ContentList, NewPage, PageStore,
        RemotePage, SpaceInfo, error_message, is_retryable_status, search_cql,
    };
    use crate::config::ConnectionSettings;

    #[test]
    fn content_item_maps_to_remote_page() {
        let item: ContentItem = serde_json::from_value(json!({
            "id": "65601",
            "type": "page",
            "title": "web-1:/etc/hosts",
            "version": { "number": 7, "minorEdit": false },
            "body": { "storage": { "value": "<p>x</p>", "representation": "storage" } }
        }))
        .expect("decode");
        assert_eq!(
            RemotePage::from(item),
            RemotePage {
                id: 65601,
                title: "web-1:/etc/hosts".to_string(),
                version: 7,
                body: "<p>x</p>".to_string(),
            }
        );
    }

    #[test]
    fn content_list_tolerates_missing_body_and_numeric_ids() {
        let list: ContentList = serde_json::from_value(json!({
            "results": [{ "id": 12, "title": "bare" }],
            "size": 1
        }))
        .expect("decode");
        let page = RemotePage::from(list.results.into_iter().next().expect("one result"));
        assert_eq!(page.id, 12);
        assert_eq!(page.body, "");
        assert_eq!(page.version, 1);
    }

    #[test]
    fn content_item_rejects_non_numeric_id() {
        let error = serde_json::from_value::<ContentItem>(json!({ "id": "abc" }))
            .expect_err("must fail");
        assert!(error.to_string().contains("invalid content id"));
    }

    #[test]
    fn space_homepage_is_optional() {
        let space: SpaceInfo =
            serde_json::from_value(json!({ "key": "OPS", "homepage": { "id": "99" } }))
                .expect("decode");
        assert_eq!(space.homepage.map(|homepage| homepage.id), Some(99));
        let bare: SpaceInfo = serde_json::from_value(json!({ "key": "OPS" })).expect("decode");
        assert!(bare.homepage.is_none());
    }

    #[test]
    fn search_cql_matches_text_or_title_and_escapes_quotes() {
        assert_eq!(
            search_cql("OPS", "deploy"),
            "space=\"OPS\" AND (text~\"deploy\" OR title~\"deploy\")"
        );
        assert_eq!(
            search_cql("OPS", "say \"hi\""),
            "space=\"OPS\" AND (text~\"say \\\"hi\\\"\" OR title~\"say \\\"hi\\\"\")"
        );
    }

    #[test]
    fn config_requires_credentials_and_strips_trailing_slash() {
        let error = ConfluenceClientConfig::from_settings(&ConnectionSettings::default())
            .expect_err("must fail");
        assert!(error.to_string().contains("server is required"));

        let config = ConfluenceClientConfig::from_settings(&ConnectionSettings {
            server: Some("https://wiki.example.com/".to_string()),
            username: Some("bot".to_string()),
            password: Some("secret".to_string()),
        })
        .expect("config");
        assert_eq!(config.server, "https://wiki.example.com");
    }

    #[test]
    fn error_message_prefers_json_message_field() {
        assert_eq!(
            error_message(r#"{"statusCode":400,"message":"Title already exists"}"#),
            "Title already exists"
        );
        assert_eq!(error_message("  plain failure \n"), "plain failure");
    }

    /// Accepts connections but never answers, so every request times out.
    fn silent_server() -> (TcpListener, ConfluenceClientConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("local addr");
        let config = ConfluenceClientConfig {
            server: format!("http://{address}"),
            username: "bot".to_string(),
            password: "secret".to_string(),
            user_agent: "confdoc-test".to_string(),
            timeout_ms: 100,
            rate_limit_ms: 0,
            max_retries: 2,
            max_write_retries: 3,
            retry_delay_ms: 0,
        };
        (listener, config)
    }

    #[test]
    fn timed_out_reads_are_retried() {
        let (_listener, config) = silent_server();
        let mut client = ConfluenceClient::new(config).expect("client");
        client.get_page_by_id(1).expect_err("must time out");
        assert_eq!(client.request_count(), 3);
    }

    #[test]
    fn timed_out_page_creation_is_not_retried() {
        let (_listener, config) = silent_server();
        let mut client = ConfluenceClient::new(config).expect("client");
        client
            .create_page(&NewPage {
                space_key: "OPS".to_string(),
                title: "notes".to_string(),
                parent_id: 1,
                body: String::new(),
            })
            .expect_err("must time out");
        assert_eq!(client.request_count(), 1);
    }

    #[test]
    fn gateway_failures_only_retry_idempotent_methods() {
        assert!(is_retryable_status(StatusCode::GATEWAY_TIMEOUT, true));
        assert!(!is_retryable_status(StatusCode::GATEWAY_TIMEOUT, false));
        assert!(!is_retryable_status(StatusCode::BAD_GATEWAY, false));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS, false));
        assert!(!is_retryable_status(StatusCode::CONFLICT, true));
    }
}
