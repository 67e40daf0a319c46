//! Remote post sources + normalization of the API's loosely-typed payloads.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use fmi_core::{PostId, PostType, RemotePostRecord};
use fmi_storage::{decode_body, is_empty_payload, FetchError, HttpFetcher, JsonFetch};
use reqwest::Url;
use scraper::Html;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "fmi-adapters";

pub const DEFAULT_API_BASE_URL: &str = "https://www.biostars.org/api/post/";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid api base url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Where post records come from. `Ok(None)` means the remote confirmed the id
/// does not exist.
#[async_trait]
pub trait PostSource: Send + Sync {
    fn source_name(&self) -> &str;

    async fn fetch_post(&self, id: PostId) -> Result<Option<RemotePostRecord>, AdapterError>;
}

/// `GET {base_url}/{id}` against the forum's JSON API.
#[derive(Debug)]
pub struct ApiPostSource {
    base_url: Url,
    http: HttpFetcher,
}

impl ApiPostSource {
    pub fn new(base_url: &str, http: HttpFetcher) -> Result<Self, AdapterError> {
        let with_slash = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&with_slash).map_err(|err| AdapterError::InvalidUrl {
            url: base_url.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self { base_url, http })
    }

    pub fn post_url(&self, id: PostId) -> Result<Url, AdapterError> {
        self.base_url
            .join(&id.to_string())
            .map_err(|err| AdapterError::InvalidUrl {
                url: self.base_url.to_string(),
                reason: err.to_string(),
            })
    }
}

#[async_trait]
impl PostSource for ApiPostSource {
    fn source_name(&self) -> &str {
        self.base_url.as_str()
    }

    async fn fetch_post(&self, id: PostId) -> Result<Option<RemotePostRecord>, AdapterError> {
        let url = self.post_url(id)?;
        match self.http.fetch_json(url.as_str()).await? {
            JsonFetch::Found(raw) => Ok(Some(normalize_post(&raw))),
            JsonFetch::NotFound => Ok(None),
        }
    }
}

/// Serves records from memory; the fixture-first counterpart of [`ApiPostSource`].
/// Every fetch is logged so callers can count remote hits.
#[derive(Debug, Default)]
pub struct StaticPostSource {
    records: BTreeMap<PostId, JsonValue>,
    fetch_log: std::sync::Mutex<Vec<PostId>>,
}

impl StaticPostSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(mut self, id: impl Into<PostId>, raw: JsonValue) -> Self {
        self.insert(id.into(), raw);
        self
    }

    pub fn insert(&mut self, id: PostId, raw: JsonValue) {
        self.records.insert(id, raw);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn highest_id(&self) -> Option<PostId> {
        self.records.keys().next_back().copied()
    }

    pub fn fetch_log(&self) -> Vec<PostId> {
        self.fetch_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Loads every `<id>.json` or `<id>.hjson` file in `dir`. Other files are ignored.
    pub fn from_fixture_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut source = Self::new();
        let entries = fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
        for entry in entries {
            let path = entry
                .with_context(|| format!("listing {}", dir.display()))?
                .path();
            if !matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("json" | "hjson")
            ) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<PostId>().ok())
            else {
                debug!(path = %path.display(), "skipping fixture without a numeric name");
                continue;
            };
            source.insert(id, read_json_file(&path)?);
        }
        Ok(source)
    }
}

#[async_trait]
impl PostSource for StaticPostSource {
    fn source_name(&self) -> &str {
        "static"
    }

    async fn fetch_post(&self, id: PostId) -> Result<Option<RemotePostRecord>, AdapterError> {
        if let Ok(mut log) = self.fetch_log.lock() {
            log.push(id);
        }
        Ok(self
            .records
            .get(&id)
            .filter(|raw| !is_empty_payload(raw))
            .map(normalize_post))
    }
}

fn read_json_file(path: &Path) -> Result<JsonValue> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    decode_body(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Maps a raw API payload into the fixed record shape. Absent or mistyped
/// fields fall back to defaults; this never fails.
pub fn normalize_post(raw: &JsonValue) -> RemotePostRecord {
    let html = json_string(raw, "xhtml");
    let post_type = match raw.get("type_id").or_else(|| raw.get("type")) {
        Some(JsonValue::Number(n)) => n.as_i64().map(PostType::from_type_id).unwrap_or_default(),
        Some(JsonValue::String(s)) => match s.trim().parse::<i64>() {
            Ok(type_id) => PostType::from_type_id(type_id),
            Err(_) => PostType::from_name(s).unwrap_or_default(),
        },
        _ => PostType::default(),
    };

    RemotePostRecord {
        id: json_post_id(raw, "id"),
        post_type,
        title: json_string(raw, "title"),
        content: strip_tags(&html),
        html,
        view_count: json_i64(raw, "view_count").unwrap_or(0),
        creation_date: json_timestamp(raw, "creation_date"),
        lastedit_date: json_timestamp(raw, "lastedit_date"),
        parent_id: json_post_id(raw, "parent_id"),
        root_id: json_post_id(raw, "root_id"),
        author_id: json_string(raw, "author_id"),
        status: json_i64(raw, "status_id").and_then(|v| i32::try_from(v).ok()),
        tag_val: json_string(raw, "tag_val"),
    }
}

/// Plain text of an HTML fragment, entities decoded.
pub fn strip_tags(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    let fragment = Html::parse_fragment(html);
    fragment
        .root_element()
        .text()
        .collect::<String>()
        .trim()
        .to_string()
}

/// Accepts RFC 3339 plus the naive `YYYY-MM-DD[T ]HH:MM:SS[.f]` forms the API
/// has emitted over the years; naive values are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn json_string(value: &JsonValue, key: &str) -> String {
    match value.get(key) {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(JsonValue::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn json_i64(value: &JsonValue, key: &str) -> Option<i64> {
    match value.get(key)? {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_post_id(value: &JsonValue, key: &str) -> Option<PostId> {
    json_i64(value, key)
        .and_then(|raw| u64::try_from(raw).ok())
        .filter(|raw| *raw > 0)
        .map(PostId)
}

fn json_timestamp(value: &JsonValue, key: &str) -> Option<DateTime<Utc>> {
    let text = value.get(key)?.as_str()?;
    let parsed = parse_timestamp(text);
    if parsed.is_none() {
        warn!(field = key, value = text, "unparseable timestamp, leaving it empty");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fmi_storage::{HttpClientConfig, NoopSleeper, RetryPolicy};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn full_payload() -> JsonValue {
        json!({
            "id": 501,
            "type_id": 1,
            "title": "Re: samtools sort",
            "xhtml": "<p>Use <code>samtools sort -o out.bam</code> &amp; index it.</p>",
            "view_count": 37,
            "creation_date": "2014-02-11T09:15:02.123000",
            "lastedit_date": "2014-02-12T10:00:00+00:00",
            "parent_id": 500,
            "root_id": 500,
            "author_id": "u1",
            "status_id": 1,
            "tag_val": "samtools,bam"
        })
    }

    #[test]
    fn normalizes_a_complete_payload() {
        let record = normalize_post(&full_payload());

        assert_eq!(record.id, Some(PostId(501)));
        assert_eq!(record.post_type, PostType::Answer);
        assert_eq!(record.content, "Use samtools sort -o out.bam & index it.");
        assert_eq!(record.view_count, 37);
        assert_eq!(record.parent_id, Some(PostId(500)));
        assert_eq!(record.root_id, Some(PostId(500)));
        assert_eq!(record.author_id, "u1");
        assert_eq!(record.status, Some(1));
        assert_eq!(record.tag_val, "samtools,bam");
        assert_eq!(
            record.lastedit_date,
            Utc.with_ymd_and_hms(2014, 2, 12, 10, 0, 0).single()
        );
        assert!(record.creation_date.is_some());
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let record = normalize_post(&json!({"title": null, "view_count": "n/a"}));
        assert_eq!(record, RemotePostRecord::default());
    }

    #[test]
    fn accepts_string_ids_and_type_names() {
        let record = normalize_post(&json!({
            "id": "77",
            "type": "Comment",
            "parent_id": "70",
            "root_id": 0,
            "author_id": 12
        }));
        assert_eq!(record.id, Some(PostId(77)));
        assert_eq!(record.post_type, PostType::Comment);
        assert_eq!(record.parent_id, Some(PostId(70)));
        assert_eq!(record.root_id, None);
        assert_eq!(record.author_id, "12");
    }

    #[test]
    fn timestamps_accept_space_separated_naive_values() {
        assert_eq!(
            parse_timestamp("2009-09-30 19:41:13"),
            Utc.with_ymd_and_hms(2009, 9, 30, 19, 41, 13).single()
        );
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn strip_tags_keeps_only_text() {
        assert_eq!(strip_tags("<div><b>Hi</b> there<br/>friend</div>"), "Hi therefriend");
        assert_eq!(strip_tags("   "), "");
    }

    #[tokio::test]
    async fn api_source_joins_base_url_and_normalizes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/post/501"))
            .respond_with(ResponseTemplate::new(200).set_body_json(full_payload()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/post/502"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let http = HttpFetcher::new(
            HttpClientConfig {
                timeout: Duration::from_secs(5),
                user_agent: None,
                retry: RetryPolicy {
                    max_attempts: Some(2),
                    delay: Duration::from_millis(1),
                },
            },
            Arc::new(NoopSleeper::default()),
        )
        .expect("http");
        let source = ApiPostSource::new(&format!("{}/api/post", server.uri()), http).expect("source");

        assert!(source
            .post_url(PostId(501))
            .expect("url")
            .as_str()
            .ends_with("/api/post/501"));
        let found = source.fetch_post(PostId(501)).await.expect("fetch");
        assert_eq!(found.map(|r| r.post_type), Some(PostType::Answer));
        assert!(source.fetch_post(PostId(502)).await.expect("fetch").is_none());
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let http = HttpFetcher::new(HttpClientConfig::default(), Arc::new(NoopSleeper::default()))
            .expect("http");
        assert!(matches!(
            ApiPostSource::new("not a url", http),
            Err(AdapterError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn fixture_dir_loads_numeric_json_files() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("500.json"), full_payload().to_string()).expect("write");
        std::fs::write(dir.path().join("501.json"), "{}").expect("write");
        std::fs::write(
            dir.path().join("503.hjson"),
            "{\n  id: 503\n  type_id: 1\n  parent_id: 500\n  author_id: \"u9\",\n}",
        )
        .expect("write");
        std::fs::write(dir.path().join("README.md"), "fixtures").expect("write");

        let source = StaticPostSource::from_fixture_dir(dir.path()).expect("load");
        assert_eq!(source.len(), 3);
        assert_eq!(source.highest_id(), Some(PostId(503)));
        let relaxed = source
            .fetch_post(PostId(503))
            .await
            .expect("fetch")
            .expect("hjson record");
        assert_eq!(relaxed.author_id, "u9");
        assert_eq!(relaxed.parent_id, Some(PostId(500)));
        assert_eq!(relaxed.post_type, PostType::Answer);
        assert!(source.fetch_post(PostId(500)).await.expect("fetch").is_some());
        assert!(source.fetch_post(PostId(501)).await.expect("fetch").is_none());
        assert!(source.fetch_post(PostId(9)).await.expect("fetch").is_none());
        assert_eq!(
            source.fetch_log(),
            vec![PostId(503), PostId(500), PostId(501), PostId(9)]
        );
    }
}
