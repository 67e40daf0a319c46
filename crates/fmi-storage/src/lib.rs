//! Local forum store + remote HTTP fetch utilities for the importer.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use fmi_core::{LocalPost, LocalUser, PostId, PostType, PostWrite, UpsertKind};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, Instrument};

pub const CRATE_NAME: &str = "fmi-storage";

/// Suspension point used for every throttle and retry delay, so tests can
/// swap in a clock that never blocks.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns immediately and remembers every requested delay.
#[derive(Debug, Default)]
pub struct NoopSleeper {
    recorded: std::sync::Mutex<Vec<Duration>>,
}

impl NoopSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.recorded
            .lock()
            .map(|delays| delays.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for NoopSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut delays) = self.recorded.lock() {
            delays.push(duration);
        }
    }
}

/// Fixed-delay retry. `max_attempts: None` keeps retrying until the remote answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn allows_retry_after(&self, attempts_made: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts_made < max,
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// A decoded remote object, or confirmation that it does not exist.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonFetch {
    Found(JsonValue),
    NotFound,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("giving up on {url} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {0}")]
    Status(u16),
    #[error("malformed body: {0}")]
    Decode(#[from] deser_hjson::Error),
    #[error("expected an object body, got {0}")]
    NotAnObject(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDisposition {
    Decode,
    NotFound,
    Retry,
}

pub fn classify_status(status: StatusCode) -> StatusDisposition {
    if status == StatusCode::NOT_FOUND {
        StatusDisposition::NotFound
    } else if status.is_success() {
        StatusDisposition::Decode
    } else {
        StatusDisposition::Retry
    }
}

/// Strict JSON first, then Hjson (unquoted keys and strings, trailing commas, comments).
pub fn decode_body(text: &str) -> Result<JsonValue, deser_hjson::Error> {
    serde_json::from_str(text).or_else(|_| deser_hjson::from_str(text))
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// `null`, `{}`, `[]` and blank bodies all mean the remote has nothing under that id.
pub fn is_empty_payload(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Object(map) => map.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::String(text) => text.trim().is_empty(),
        _ => false,
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig, sleeper: Arc<dyn Sleeper>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
            sleeper,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// GET `url` and decode it as JSON. Transport, status and decode failures are
    /// retried per the policy; a 404 or empty body is returned as `NotFound`
    /// without retrying.
    pub async fn fetch_json(&self, url: &str) -> Result<JsonFetch, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let mut attempts: u32 = 0;
            loop {
                attempts += 1;
                match self.attempt(url).await {
                    Ok(fetched) => {
                        info!(attempts, "hit remote site");
                        return Ok(fetched);
                    }
                    Err(err) if self.retry.allows_retry_after(attempts) => {
                        error!(
                            attempts,
                            error = %err,
                            "fetch failed, sleeping {}ms then retrying",
                            self.retry.delay.as_millis()
                        );
                        self.sleeper.sleep(self.retry.delay).await;
                    }
                    Err(err) => {
                        error!(attempts, error = %err, "fetch failed, retry budget spent");
                        return Err(FetchError::RetriesExhausted {
                            url: url.to_string(),
                            attempts,
                            last_error: err.to_string(),
                        });
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, url: &str) -> Result<JsonFetch, AttemptError> {
        let resp = self.client.get(url).send().await?;
        match classify_status(resp.status()) {
            StatusDisposition::NotFound => return Ok(JsonFetch::NotFound),
            StatusDisposition::Retry => return Err(AttemptError::Status(resp.status().as_u16())),
            StatusDisposition::Decode => {}
        }

        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(JsonFetch::NotFound);
        }
        let value = decode_body(&text)?;
        if is_empty_payload(&value) {
            return Ok(JsonFetch::NotFound);
        }
        if !value.is_object() {
            return Err(AttemptError::NotAnObject(json_kind(&value)));
        }
        Ok(JsonFetch::Found(value))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("post uid {0} does not fit the store's integer column")]
    UidOutOfRange(PostId),
    #[error("corrupt {what} row: {detail}")]
    Corrupt { what: &'static str, detail: String },
}

/// Point lookups plus create/update for posts and users. No deletes.
#[async_trait]
pub trait ForumStore: Send + Sync {
    async fn find_post(&self, uid: PostId) -> Result<Option<LocalPost>, StoreError>;

    async fn find_user(&self, uid: &str) -> Result<Option<LocalUser>, StoreError>;

    /// Inserts the user unless one with this uid already exists; returns the stored row.
    async fn insert_user(&self, uid: &str, name: &str) -> Result<LocalUser, StoreError>;

    /// Create-or-update keyed by `write.uid`, in a single transaction. The local
    /// key and uid of an existing row are preserved.
    async fn upsert_post(&self, write: &PostWrite) -> Result<(UpsertKind, LocalPost), StoreError>;

    async fn post_count(&self) -> Result<u64, StoreError>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    uid         TEXT NOT NULL UNIQUE,
    name        TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS posts (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    uid            INTEGER NOT NULL UNIQUE,
    post_type      TEXT NOT NULL,
    title          TEXT NOT NULL,
    content        TEXT NOT NULL,
    html           TEXT NOT NULL,
    view_count     INTEGER NOT NULL,
    creation_date  TEXT,
    lastedit_date  TEXT,
    status         INTEGER,
    tag_val        TEXT NOT NULL,
    author_uid     TEXT NOT NULL REFERENCES users(uid),
    parent_uid     INTEGER,
    root_uid       INTEGER
);
"#;

const POST_COLUMNS: &str = "id, uid, post_type, title, content, html, view_count, creation_date, \
     lastedit_date, status, tag_val, author_uid, parent_uid, root_uid";

fn uid_param(uid: PostId) -> Result<i64, StoreError> {
    i64::try_from(uid.get()).map_err(|_| StoreError::UidOutOfRange(uid))
}

fn opt_uid_param(uid: Option<PostId>) -> Result<Option<i64>, StoreError> {
    uid.map(uid_param).transpose()
}

fn uid_from_column(raw: i64) -> Result<PostId, StoreError> {
    u64::try_from(raw)
        .map(PostId)
        .map_err(|_| StoreError::Corrupt {
            what: "post",
            detail: format!("negative uid {raw}"),
        })
}

fn post_from_row(row: &SqliteRow) -> Result<LocalPost, StoreError> {
    let type_name: String = row.try_get("post_type")?;
    let post_type = PostType::from_name(&type_name).ok_or_else(|| StoreError::Corrupt {
        what: "post",
        detail: format!("unknown post_type {type_name:?}"),
    })?;
    let parent_uid: Option<i64> = row.try_get("parent_uid")?;
    let root_uid: Option<i64> = row.try_get("root_uid")?;

    Ok(LocalPost {
        key: row.try_get("id")?,
        uid: uid_from_column(row.try_get("uid")?)?,
        post_type,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        html: row.try_get("html")?,
        view_count: row.try_get("view_count")?,
        creation_date: row.try_get("creation_date")?,
        lastedit_date: row.try_get("lastedit_date")?,
        status: row.try_get("status")?,
        tag_val: row.try_get("tag_val")?,
        author_uid: row.try_get("author_uid")?,
        parent_uid: parent_uid.map(uid_from_column).transpose()?,
        root_uid: root_uid.map(uid_from_column).transpose()?,
    })
}

fn user_from_row(row: &SqliteRow) -> Result<LocalUser, StoreError> {
    Ok(LocalUser {
        key: row.try_get("id")?,
        uid: row.try_get("uid")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

/// SQLite-backed store. A single pooled connection keeps `sqlite::memory:`
/// databases alive for the lifetime of the store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("bootstrapping posts/users tables")?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl ForumStore for SqliteStore {
    async fn find_post(&self, uid: PostId) -> Result<Option<LocalPost>, StoreError> {
        let row = sqlx::query(&format!("SELECT {POST_COLUMNS} FROM posts WHERE uid = ?"))
            .bind(uid_param(uid)?)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(post_from_row).transpose()
    }

    async fn find_user(&self, uid: &str) -> Result<Option<LocalUser>, StoreError> {
        let row = sqlx::query("SELECT id, uid, name, created_at FROM users WHERE uid = ?")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn insert_user(&self, uid: &str, name: &str) -> Result<LocalUser, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO users (uid, name, created_at) VALUES (?, ?, ?)")
            .bind(uid)
            .bind(name)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query("SELECT id, uid, name, created_at FROM users WHERE uid = ?")
            .bind(uid)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        user_from_row(&row)
    }

    async fn upsert_post(&self, write: &PostWrite) -> Result<(UpsertKind, LocalPost), StoreError> {
        let uid = uid_param(write.uid)?;
        let parent_uid = opt_uid_param(write.parent_uid)?;
        let root_uid = opt_uid_param(write.root_uid)?;

        let mut tx = self.pool.begin().await?;
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM posts WHERE uid = ?")
            .bind(uid)
            .fetch_optional(&mut *tx)
            .await?;

        let kind = match existing {
            Some(key) => {
                sqlx::query(
                    r#"
                    UPDATE posts
                       SET post_type = ?, title = ?, content = ?, html = ?, view_count = ?,
                           creation_date = ?, lastedit_date = ?, status = ?, tag_val = ?,
                           author_uid = ?, parent_uid = ?, root_uid = ?
                     WHERE id = ?
                    "#,
                )
                .bind(write.post_type.as_str())
                .bind(&write.title)
                .bind(&write.content)
                .bind(&write.html)
                .bind(write.view_count)
                .bind(write.creation_date)
                .bind(write.lastedit_date)
                .bind(write.status)
                .bind(&write.tag_val)
                .bind(&write.author_uid)
                .bind(parent_uid)
                .bind(root_uid)
                .bind(key)
                .execute(&mut *tx)
                .await?;
                UpsertKind::Updated
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO posts (uid, post_type, title, content, html, view_count,
                                       creation_date, lastedit_date, status, tag_val,
                                       author_uid, parent_uid, root_uid)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(uid)
                .bind(write.post_type.as_str())
                .bind(&write.title)
                .bind(&write.content)
                .bind(&write.html)
                .bind(write.view_count)
                .bind(write.creation_date)
                .bind(write.lastedit_date)
                .bind(write.status)
                .bind(&write.tag_val)
                .bind(&write.author_uid)
                .bind(parent_uid)
                .bind(root_uid)
                .execute(&mut *tx)
                .await?;
                UpsertKind::Created
            }
        };

        let row = sqlx::query(&format!("SELECT {POST_COLUMNS} FROM posts WHERE uid = ?"))
            .bind(uid)
            .fetch_one(&mut *tx)
            .await?;
        let post = post_from_row(&row)?;
        tx.commit().await?;
        Ok((kind, post))
    }

    async fn post_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    posts: BTreeMap<PostId, LocalPost>,
    users: BTreeMap<String, LocalUser>,
    next_post_key: i64,
    next_user_key: i64,
    write_log: Vec<(UpsertKind, PostId)>,
}

/// In-process store for dry runs and tests. Keeps a log of post writes in order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn write_log(&self) -> Vec<(UpsertKind, PostId)> {
        self.state.lock().await.write_log.clone()
    }

    pub async fn posts(&self) -> Vec<LocalPost> {
        self.state.lock().await.posts.values().cloned().collect()
    }
}

#[async_trait]
impl ForumStore for MemoryStore {
    async fn find_post(&self, uid: PostId) -> Result<Option<LocalPost>, StoreError> {
        Ok(self.state.lock().await.posts.get(&uid).cloned())
    }

    async fn find_user(&self, uid: &str) -> Result<Option<LocalUser>, StoreError> {
        Ok(self.state.lock().await.users.get(uid).cloned())
    }

    async fn insert_user(&self, uid: &str, name: &str) -> Result<LocalUser, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.users.get(uid) {
            return Ok(existing.clone());
        }
        state.next_user_key += 1;
        let user = LocalUser {
            key: state.next_user_key,
            uid: uid.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        state.users.insert(uid.to_string(), user.clone());
        Ok(user)
    }

    async fn upsert_post(&self, write: &PostWrite) -> Result<(UpsertKind, LocalPost), StoreError> {
        let mut state = self.state.lock().await;
        let (kind, key) = match state.posts.get(&write.uid) {
            Some(existing) => (UpsertKind::Updated, existing.key),
            None => {
                state.next_post_key += 1;
                (UpsertKind::Created, state.next_post_key)
            }
        };
        let post = LocalPost {
            key,
            uid: write.uid,
            post_type: write.post_type,
            title: write.title.clone(),
            content: write.content.clone(),
            html: write.html.clone(),
            view_count: write.view_count,
            creation_date: write.creation_date,
            lastedit_date: write.lastedit_date,
            status: write.status,
            tag_val: write.tag_val.clone(),
            author_uid: write.author_uid.clone(),
            parent_uid: write.parent_uid,
            root_uid: write.root_uid,
        };
        state.posts.insert(write.uid, post.clone());
        state.write_log.push((kind, write.uid));
        Ok((kind, post))
    }

    async fn post_count(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.posts.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_fetcher(max_attempts: Option<u32>, sleeper: Arc<NoopSleeper>) -> HttpFetcher {
        HttpFetcher::new(
            HttpClientConfig {
                timeout: Duration::from_secs(5),
                user_agent: Some("fmi-test".into()),
                retry: RetryPolicy {
                    max_attempts,
                    delay: Duration::from_millis(5_000),
                },
            },
            sleeper,
        )
        .expect("fetcher")
    }

    fn sample_write(uid: u64, title: &str) -> PostWrite {
        PostWrite {
            uid: PostId(uid),
            post_type: PostType::Question,
            title: title.to_string(),
            content: "body".into(),
            html: "<p>body</p>".into(),
            view_count: 12,
            creation_date: Some(ts(2012, 3, 4)),
            lastedit_date: Some(ts(2013, 5, 6)),
            status: Some(1),
            tag_val: "rna-seq,bam".into(),
            author_uid: "u1".into(),
            parent_uid: Some(PostId(uid)),
            root_uid: Some(PostId(uid)),
        }
    }

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 10, 30, 0).single().expect("ts")
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/post/502"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let sleeper = Arc::new(NoopSleeper::default());
        let fetcher = fast_fetcher(None, sleeper.clone());
        let fetched = fetcher
            .fetch_json(&format!("{}/api/post/502", server.uri()))
            .await
            .expect("fetch");

        assert_eq!(fetched, JsonFetch::NotFound);
        assert!(sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn empty_object_body_counts_as_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/post/7"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = fast_fetcher(Some(3), Arc::new(NoopSleeper::default()));
        let fetched = fetcher
            .fetch_json(&format!("{}/api/post/7", server.uri()))
            .await
            .expect("fetch");
        assert_eq!(fetched, JsonFetch::NotFound);
    }

    #[tokio::test]
    async fn bounded_policy_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/post/9"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let sleeper = Arc::new(NoopSleeper::default());
        let fetcher = fast_fetcher(Some(3), sleeper.clone());
        let err = fetcher
            .fetch_json(&format!("{}/api/post/9", server.uri()))
            .await
            .expect_err("should exhaust retries");

        match err {
            FetchError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
        }
        assert_eq!(sleeper.recorded(), vec![Duration::from_secs(5); 2]);
    }

    #[tokio::test]
    async fn malformed_body_is_retried_until_it_decodes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/post/11"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>busy</html>"))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/post/11"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 11, "title": "ok"})),
            )
            .with_priority(2)
            .mount(&server)
            .await;

        let sleeper = Arc::new(NoopSleeper::default());
        let fetcher = fast_fetcher(None, sleeper.clone());
        let fetched = fetcher
            .fetch_json(&format!("{}/api/post/11", server.uri()))
            .await
            .expect("fetch");

        match fetched {
            JsonFetch::Found(value) => assert_eq!(value["title"], "ok"),
            JsonFetch::NotFound => panic!("expected a decoded post"),
        }
        assert_eq!(sleeper.recorded().len(), 1);
    }

    #[tokio::test]
    async fn hjson_body_is_decoded_without_retrying() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/post/11"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "{\n  # legacy renderer\n  id: 11\n  title: ok\n  author_id: \"u1\",\n}",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let sleeper = Arc::new(NoopSleeper::default());
        let fetcher = fast_fetcher(Some(3), sleeper.clone());
        let fetched = fetcher
            .fetch_json(&format!("{}/api/post/11", server.uri()))
            .await
            .expect("fetch");

        match fetched {
            JsonFetch::Found(value) => {
                assert_eq!(value["id"], 11);
                assert_eq!(value["title"], "ok");
                assert_eq!(value["author_id"], "u1");
            }
            JsonFetch::NotFound => panic!("expected a decoded post"),
        }
        assert!(sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn scalar_body_is_treated_as_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/post/12"))
            .respond_with(ResponseTemplate::new(200).set_body_string("42"))
            .expect(2)
            .mount(&server)
            .await;

        let fetcher = fast_fetcher(Some(2), Arc::new(NoopSleeper::default()));
        let err = fetcher
            .fetch_json(&format!("{}/api/post/12", server.uri()))
            .await
            .expect_err("a bare number is not a post");
        match err {
            FetchError::RetriesExhausted { last_error, .. } => {
                assert!(last_error.contains("number"), "{last_error}")
            }
        }
    }

    #[test]
    fn decode_body_prefers_strict_json() {
        let strict = decode_body(r#"{"id": 5, "tag_val": "a,b"}"#).expect("json");
        assert_eq!(strict["id"], 5);
        let relaxed = decode_body("{\n  id: 5\n  // trailing comma\n  tag_val: \"a,b\",\n}").expect("hjson");
        assert_eq!(relaxed["tag_val"], "a,b");
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::OK), StatusDisposition::Decode);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), StatusDisposition::NotFound);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            StatusDisposition::Retry
        );
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), StatusDisposition::Retry);
    }

    #[tokio::test]
    async fn sqlite_upsert_creates_then_updates_in_place() {
        let store = SqliteStore::connect("sqlite::memory:").await.expect("store");
        store.insert_user("u1", "user-u1").await.expect("user");

        let (first_kind, first) = store
            .upsert_post(&sample_write(500, "first title"))
            .await
            .expect("create");
        let (second_kind, second) = store
            .upsert_post(&sample_write(500, "edited title"))
            .await
            .expect("update");

        assert_eq!(first_kind, UpsertKind::Created);
        assert_eq!(second_kind, UpsertKind::Updated);
        assert_eq!(first.key, second.key);
        assert_eq!(second.title, "edited title");
        assert_eq!(second.parent_uid, Some(PostId(500)));
        assert_eq!(second.creation_date, Some(ts(2012, 3, 4)));
        assert_eq!(store.post_count().await.expect("count"), 1);
        assert_eq!(
            store.find_post(PostId(500)).await.expect("find"),
            Some(second)
        );
    }

    #[tokio::test]
    async fn sqlite_store_persists_to_disk_and_insert_user_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("forum.db").display());

        {
            let store = SqliteStore::connect(&url).await.expect("store");
            let first = store.insert_user("u9", "user-u9").await.expect("user");
            let again = store.insert_user("u9", "other").await.expect("user again");
            assert_eq!(first, again);
            store
                .upsert_post(&PostWrite {
                    author_uid: "u9".into(),
                    ..sample_write(42, "kept")
                })
                .await
                .expect("create");
        }

        let reopened = SqliteStore::connect(&url).await.expect("reopen");
        let post = reopened
            .find_post(PostId(42))
            .await
            .expect("find")
            .expect("post persisted");
        assert_eq!(post.title, "kept");
        assert!(reopened.find_user("missing").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn memory_store_logs_writes_in_order() {
        let store = MemoryStore::new();
        store.upsert_post(&sample_write(1, "a")).await.expect("a");
        store.upsert_post(&sample_write(2, "b")).await.expect("b");
        store.upsert_post(&sample_write(1, "a2")).await.expect("a2");

        assert_eq!(
            store.write_log().await,
            vec![
                (UpsertKind::Created, PostId(1)),
                (UpsertKind::Created, PostId(2)),
                (UpsertKind::Updated, PostId(1)),
            ]
        );
        assert_eq!(store.posts().await.len(), 2);
    }
}
