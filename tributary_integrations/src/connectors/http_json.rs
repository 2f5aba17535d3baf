//! Generic paginated REST/JSON connector.
//!
//! Each configured resource is fetched with `GET {base_url}/{path}?limit=N`,
//! following the `next_cursor` field of every page via `&cursor=...`. Resources
//! that declare an `updated_at_field` support incremental sync: the checkpoint is
//! an object mapping entity type to the newest `updated_at` seen (RFC 3339), sent
//! back as `&updated_since=...`.
//!
//! HTTP failures are mapped onto the pipeline error taxonomy so the extraction
//! driver can decide what to retry.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::{stream, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tributary_core::{
    Checkpoint, Connection, ConnectorCapabilities, ConnectorFactory, Credentials, EntitySchema,
    Error, FieldSpec, RawRecord, RecordStream, Result, SourceConnector,
};

pub const CONNECTOR_TYPE: &str = "http_json";

fn default_page_size() -> u32 {
    100
}

fn default_request_timeout_ms() -> u64 {
    20_000
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_items_field() -> String {
    "items".to_string()
}

fn default_next_cursor_field() -> String {
    "next_cursor".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpJsonSettings {
    pub base_url: String,
    pub resources: Vec<HttpResource>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// One listable endpoint and the entity type its items become.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpResource {
    pub entity_type: String,
    pub path: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Array field holding the page's items. A bare JSON array response is accepted too.
    #[serde(default = "default_items_field")]
    pub items_field: String,
    #[serde(default = "default_next_cursor_field")]
    pub next_cursor_field: String,
    #[serde(default)]
    pub updated_at_field: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub hash_exclude: Vec<String>,
}

impl HttpJsonSettings {
    pub fn parse(settings: &serde_json::Value) -> Result<Self> {
        let parsed: Self = serde_json::from_value(settings.clone())
            .map_err(|e| Error::InvalidInput(format!("http_json settings: {e}")))?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| Error::InvalidInput(format!("http_json base_url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidInput(format!(
                "http_json base_url must be http(s), got '{}'",
                url.scheme()
            )));
        }
        if self.resources.is_empty() {
            return Err(Error::InvalidInput(
                "http_json needs at least one resource".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(Error::InvalidInput("http_json page_size must be > 0".to_string()));
        }
        let mut seen = HashSet::new();
        for r in &self.resources {
            if r.entity_type.trim().is_empty() || r.path.trim().is_empty() {
                return Err(Error::InvalidInput(
                    "http_json resource needs entity_type and path".to_string(),
                ));
            }
            if !seen.insert(r.entity_type.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "http_json resource '{}' declared twice",
                    r.entity_type
                )));
            }
        }
        Ok(())
    }

    fn supports_incremental(&self) -> bool {
        self.resources.iter().all(|r| r.updated_at_field.is_some())
    }
}

pub struct HttpJsonFactory;

#[async_trait]
impl ConnectorFactory for HttpJsonFactory {
    fn connector_type(&self) -> &'static str {
        CONNECTOR_TYPE
    }

    fn validate_settings(&self, settings: &serde_json::Value) -> Result<()> {
        HttpJsonSettings::parse(settings).map(|_| ())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(connection_id = %connection.id))]
    async fn build(
        &self,
        connection: &Connection,
        credentials: Credentials,
    ) -> Result<Arc<dyn SourceConnector>> {
        let settings = HttpJsonSettings::parse(&connection.settings)?;
        Ok(Arc::new(HttpJsonConnector::new(settings, credentials)?))
    }
}

#[derive(Clone)]
pub struct HttpJsonConnector {
    client: Client,
    settings: Arc<HttpJsonSettings>,
    token: Option<String>,
}

impl HttpJsonConnector {
    /// `credentials["token"]`, when present, is sent as a bearer token.
    pub fn new(settings: HttpJsonSettings, credentials: Credentials) -> Result<Self> {
        settings.validate()?;
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()
            .map_err(|e| Error::backend("build http client", e))?;
        Ok(Self {
            client,
            token: credentials.get("token").map(str::to_string),
            settings: Arc::new(settings),
        })
    }
}

/// One page of a resource listing.
#[derive(Debug, PartialEq)]
struct Page {
    items: Vec<serde_json::Value>,
    next_cursor: Option<String>,
}

impl Page {
    fn parse(body: serde_json::Value, resource: &HttpResource) -> Result<Self> {
        match body {
            serde_json::Value::Array(items) => Ok(Self {
                items,
                next_cursor: None,
            }),
            serde_json::Value::Object(mut obj) => {
                let items = match obj.remove(&resource.items_field) {
                    Some(serde_json::Value::Array(items)) => items,
                    _ => {
                        return Err(Error::PermanentSource(format!(
                            "{} response has no '{}' array",
                            resource.path, resource.items_field
                        )))
                    }
                };
                let next_cursor = obj
                    .get(&resource.next_cursor_field)
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                Ok(Self { items, next_cursor })
            }
            other => Err(Error::PermanentSource(format!(
                "{} response is not a JSON object: {other}",
                resource.path
            ))),
        }
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
fn status_error(status: StatusCode, retry_after: Option<Duration>, what: &str) -> Error {
    let message = format!("{what}: HTTP {status}");
    match status {
        StatusCode::UNAUTHORIZED => Error::AuthExpired(message),
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited {
            message,
            retry_after,
        },
        StatusCode::REQUEST_TIMEOUT => Error::TransientNetwork(message),
        s if s.is_server_error() => Error::TransientNetwork(message),
        _ => Error::PermanentSource(message),
    }
}

fn request_error(what: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() || e.is_body() {
        Error::TransientNetwork(format!("{what}: {e}"))
    } else if e.is_decode() {
        Error::PermanentSource(format!("{what}: {e}"))
    } else {
        Error::backend(what.to_string(), e)
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn item_id(item: &serde_json::Value, id_field: &str) -> Option<String> {
    match item.get(id_field)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn item_updated_at(item: &serde_json::Value, field: &str) -> Option<DateTime<Utc>> {
    let s = item.get(field)?.as_str()?;
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Walks every resource page by page; state threaded through `try_unfold`.
struct Pager {
    client: Client,
    settings: Arc<HttpJsonSettings>,
    token: Option<String>,
    incremental: bool,
    resource: usize,
    cursor: Option<String>,
    /// Per-resource high-water marks, seeded from `since`.
    marks: serde_json::Map<String, serde_json::Value>,
    newest: Option<DateTime<Utc>>,
    /// Last record of a page that was not the resource's final one. Held back
    /// so the checkpoint has a record to ride on if the final page is empty.
    held: Option<RawRecord>,
}

impl Pager {
    async fn fetch(&self, resource: &HttpResource) -> Result<Page> {
        let url = format!(
            "{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            resource.path.trim_start_matches('/')
        );
        let mut req = self
            .client
            .get(&url)
            .query(&[("limit", self.settings.page_size.to_string())]);
        if let Some(cursor) = &self.cursor {
            req = req.query(&[("cursor", cursor.as_str())]);
        }
        if let Some(since) = self.marks.get(&resource.entity_type).and_then(|v| v.as_str()) {
            req = req.query(&[("updated_since", since)]);
        }
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| request_error(&url, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, retry_after(resp.headers()), &url));
        }
        let body: serde_json::Value = resp.json().await.map_err(|e| request_error(&url, e))?;
        Page::parse(body, resource)
    }

    async fn next_page(mut self) -> Result<Option<(Vec<RawRecord>, Self)>> {
        loop {
            let settings = self.settings.clone();
            let Some(resource) = settings.resources.get(self.resource) else {
                return Ok(self.held.take().map(|last| (vec![last], self)));
            };
            let page = self.fetch(resource).await?;
            tracing::debug!(
                entity_type = %resource.entity_type,
                items = page.items.len(),
                has_more = page.next_cursor.is_some(),
                "http_json page"
            );

            let mut records = Vec::with_capacity(page.items.len() + 1);
            records.extend(self.held.take());
            for item in page.items {
                let Some(id) = item_id(&item, &resource.id_field) else {
                    tracing::warn!(
                        entity_type = %resource.entity_type,
                        id_field = %resource.id_field,
                        "item without usable id skipped"
                    );
                    continue;
                };
                if let Some(field) = &resource.updated_at_field {
                    if let Some(ts) = item_updated_at(&item, field) {
                        self.newest = Some(self.newest.map_or(ts, |n| n.max(ts)));
                    }
                }
                records.push(RawRecord::new(resource.entity_type.as_str(), id, item)?);
            }

            match page.next_cursor {
                Some(cursor) => {
                    self.cursor = Some(cursor);
                    if self.incremental {
                        self.held = records.pop();
                    }
                }
                None => {
                    // Resource exhausted: its mark may only advance now, since
                    // items within a listing are not ordered by update time.
                    if let Some(newest) = self.newest.take() {
                        self.marks.insert(
                            resource.entity_type.clone(),
                            serde_json::Value::String(
                                newest.to_rfc3339_opts(SecondsFormat::Micros, true),
                            ),
                        );
                    }
                    self.resource += 1;
                    self.cursor = None;
                    if self.incremental {
                        if let Some(last) = records.pop() {
                            let checkpoint =
                                Checkpoint::new(serde_json::Value::Object(self.marks.clone()));
                            records.push(last.with_checkpoint(checkpoint));
                        }
                    }
                }
            }
            if !records.is_empty() {
                return Ok(Some((records, self)));
            }
        }
    }
}

#[async_trait]
impl SourceConnector for HttpJsonConnector {
    fn connector_type(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            supports_incremental: self.settings.supports_incremental(),
            lists_unchanged: false,
        }
    }

    fn schemas(&self) -> Vec<EntitySchema> {
        self.settings
            .resources
            .iter()
            .map(|r| EntitySchema {
                entity_type: r.entity_type.clone(),
                fields: r.fields.clone(),
                hash_exclude: r.hash_exclude.clone(),
                updated_at_field: r.updated_at_field.clone(),
                keep_undeclared: true,
            })
            .collect()
    }

    #[tracing::instrument(level = "info", skip(self), fields(base_url = %self.settings.base_url))]
    async fn extract(&self, since: Option<Checkpoint>) -> Result<RecordStream> {
        let incremental = self.settings.supports_incremental();
        let marks = match since {
            Some(c) if incremental => match c.value {
                serde_json::Value::Object(m) => m,
                other => {
                    return Err(Error::InvalidInput(format!(
                        "http_json checkpoint must be an object, got {other}"
                    )))
                }
            },
            _ => serde_json::Map::new(),
        };
        let pager = Pager {
            client: self.client.clone(),
            settings: self.settings.clone(),
            token: self.token.clone(),
            incremental,
            resource: 0,
            cursor: None,
            marks,
            newest: None,
            held: None,
        };
        let pages = stream::try_unfold(pager, Pager::next_page);
        Ok(pages
            .map_ok(|records| stream::iter(records.into_iter().map(Ok::<_, Error>)))
            .try_flatten()
            .boxed())
    }
}
