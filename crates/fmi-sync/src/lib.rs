//! Post synchronization pipeline: author resolution, ancestry-first upserts,
//! batch driving and max-id discovery.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fmi_adapters::{ApiPostSource, PostSource, StaticPostSource, DEFAULT_API_BASE_URL};
use fmi_core::{
    LocalPost, LocalUser, PostId, PostWrite, RemotePostRecord, SkipReason, SyncOutcome,
};
use fmi_storage::{
    ForumStore, HttpClientConfig, HttpFetcher, RetryPolicy, Sleeper, SqliteStore, TokioSleeper,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fmi-sync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportConfig {
    pub database_url: String,
    pub api_base_url: String,
    pub fixtures_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub retry_delay_ms: u64,
    /// `None` retries a failing fetch forever.
    pub max_fetch_attempts: Option<u32>,
    pub recursion_delay_ms: u64,
    pub batch_pause_every: u64,
    pub batch_pause_secs: u64,
    pub discovery_hint: u64,
    pub discovery_window: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://fmi.db".to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            fixtures_dir: None,
            user_agent: "fmi-importer/0.1".to_string(),
            http_timeout_secs: 300,
            retry_delay_ms: 5_000,
            max_fetch_attempts: None,
            recursion_delay_ms: 500,
            batch_pause_every: 50,
            batch_pause_secs: 5,
            discovery_hint: 1,
            discovery_window: 8,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl ImportConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("FMI_DATABASE_URL").unwrap_or(defaults.database_url),
            api_base_url: std::env::var("FMI_API_BASE_URL").unwrap_or(defaults.api_base_url),
            fixtures_dir: std::env::var("FMI_FIXTURES_DIR").ok().map(PathBuf::from),
            user_agent: std::env::var("FMI_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("FMI_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            retry_delay_ms: env_parse("FMI_RETRY_DELAY_MS").unwrap_or(defaults.retry_delay_ms),
            max_fetch_attempts: env_parse("FMI_MAX_FETCH_ATTEMPTS").filter(|n: &u32| *n > 0),
            recursion_delay_ms: env_parse("FMI_RECURSION_DELAY_MS")
                .unwrap_or(defaults.recursion_delay_ms),
            batch_pause_every: env_parse("FMI_BATCH_PAUSE_EVERY")
                .unwrap_or(defaults.batch_pause_every),
            batch_pause_secs: env_parse("FMI_BATCH_PAUSE_SECS")
                .unwrap_or(defaults.batch_pause_secs),
            discovery_hint: env_parse("FMI_DISCOVERY_HINT").unwrap_or(defaults.discovery_hint),
            discovery_window: env_parse("FMI_DISCOVERY_WINDOW")
                .unwrap_or(defaults.discovery_window),
        }
    }

    /// Applies the keys present in a YAML file on top of `self`.
    pub async fn with_overrides_file(mut self, path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let overrides: ConfigOverrides =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        if let Some(v) = overrides.database_url {
            self.database_url = v;
        }
        if let Some(v) = overrides.api_base_url {
            self.api_base_url = v;
        }
        if let Some(v) = overrides.fixtures_dir {
            self.fixtures_dir = Some(v);
        }
        if let Some(v) = overrides.user_agent {
            self.user_agent = v;
        }
        if let Some(v) = overrides.http_timeout_secs {
            self.http_timeout_secs = v;
        }
        if let Some(v) = overrides.retry_delay_ms {
            self.retry_delay_ms = v;
        }
        if let Some(v) = overrides.max_fetch_attempts {
            self.max_fetch_attempts = (v > 0).then_some(v);
        }
        if let Some(v) = overrides.recursion_delay_ms {
            self.recursion_delay_ms = v;
        }
        if let Some(v) = overrides.batch_pause_every {
            self.batch_pause_every = v;
        }
        if let Some(v) = overrides.batch_pause_secs {
            self.batch_pause_secs = v;
        }
        if let Some(v) = overrides.discovery_hint {
            self.discovery_hint = v;
        }
        if let Some(v) = overrides.discovery_window {
            self.discovery_window = v;
        }
        Ok(self)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_fetch_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            retry: self.retry_policy(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigOverrides {
    database_url: Option<String>,
    api_base_url: Option<String>,
    fixtures_dir: Option<PathBuf>,
    user_agent: Option<String>,
    http_timeout_secs: Option<u64>,
    retry_delay_ms: Option<u64>,
    max_fetch_attempts: Option<u32>,
    recursion_delay_ms: Option<u64>,
    batch_pause_every: Option<u64>,
    batch_pause_secs: Option<u64>,
    discovery_hint: Option<u64>,
    discovery_window: Option<u64>,
}

/// External collaborator that brings a user into existence. The importer only
/// learns that the user exists now or will shortly.
#[async_trait]
pub trait UserProvisioner: Send + Sync {
    async fn create_user(&self, author_uid: &str) -> Result<()>;
}

/// Inserts a placeholder account named `user-<uid>` into the local store.
pub struct PlaceholderUserProvisioner {
    store: Arc<dyn ForumStore>,
}

impl PlaceholderUserProvisioner {
    pub fn new(store: Arc<dyn ForumStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl UserProvisioner for PlaceholderUserProvisioner {
    async fn create_user(&self, author_uid: &str) -> Result<()> {
        let user = self
            .store
            .insert_user(author_uid, &format!("user-{author_uid}"))
            .await
            .with_context(|| format!("provisioning user {author_uid}"))?;
        info!(user = %user.uid, key = user.key, "provisioned placeholder user");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserResolution {
    Resolved(LocalUser),
    /// A user was just provisioned; posts by them wait for a later pass.
    NeedsRetry,
}

pub struct UserResolver {
    store: Arc<dyn ForumStore>,
    provisioner: Arc<dyn UserProvisioner>,
}

impl UserResolver {
    pub fn new(store: Arc<dyn ForumStore>, provisioner: Arc<dyn UserProvisioner>) -> Self {
        Self { store, provisioner }
    }

    pub async fn ensure_user(&self, author_uid: &str) -> Result<UserResolution> {
        if let Some(user) = self.store.find_user(author_uid).await? {
            return Ok(UserResolution::Resolved(user));
        }
        info!(author = author_uid, "creating user");
        self.provisioner.create_user(author_uid).await?;
        Ok(UserResolution::NeedsRetry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Resolve root, then parent, then upsert the post.
    FullResolve,
    /// Create the post from remote data, linking only ancestors already stored.
    StubResolve,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub outcome: SyncOutcome,
    pub post: Option<LocalPost>,
}

impl Resolution {
    fn without_post(outcome: SyncOutcome) -> Self {
        Self {
            outcome,
            post: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Fetch,
    Root,
    Parent,
    Write,
    WriteAfterStub,
}

#[derive(Debug)]
struct Pending {
    uid: PostId,
    record: RemotePostRecord,
    author: LocalUser,
}

#[derive(Debug)]
struct Frame {
    id: PostId,
    mode: ResolveMode,
    stage: Stage,
    pending: Option<Pending>,
}

impl Frame {
    fn new(id: PostId, mode: ResolveMode) -> Self {
        Self {
            id,
            mode,
            stage: Stage::Fetch,
            pending: None,
        }
    }

    fn pending(&self) -> Result<&Pending> {
        self.pending
            .as_ref()
            .with_context(|| format!("post {} reached {:?} without a fetched record", self.id, self.stage))
    }

    fn take_pending(&mut self) -> Result<Pending> {
        let (id, stage) = (self.id, self.stage);
        self.pending
            .take()
            .with_context(|| format!("post {id} reached {stage:?} without a fetched record"))
    }
}

enum Step {
    Continue,
    Push(PostId, ResolveMode),
    Done(Resolution),
}

/// Ensures a post's root and parent exist locally before upserting the post.
///
/// Ancestry is walked with an explicit stack of `(id, mode)` frames rather than
/// native recursion. An id already on the stack is never fully resolved again,
/// so remote cycles terminate; the child then falls back to a parent stub.
pub struct PostSynchronizer {
    source: Arc<dyn PostSource>,
    store: Arc<dyn ForumStore>,
    users: UserResolver,
    sleeper: Arc<dyn Sleeper>,
    recursion_delay: Duration,
}

impl PostSynchronizer {
    pub fn new(
        source: Arc<dyn PostSource>,
        store: Arc<dyn ForumStore>,
        users: UserResolver,
        sleeper: Arc<dyn Sleeper>,
        recursion_delay: Duration,
    ) -> Self {
        Self {
            source,
            store,
            users,
            sleeper,
            recursion_delay,
        }
    }

    pub async fn sync_post(&self, id: PostId) -> Result<SyncOutcome> {
        let existed = self.store.find_post(id).await?.is_some();
        let outcome = self.resolve(id, ResolveMode::FullResolve).await?.outcome;
        // A cycle stubs the post first and updates it later in the same call.
        Ok(match outcome {
            SyncOutcome::Updated if !existed => SyncOutcome::Created,
            other => other,
        })
    }

    /// Degraded path: build `parent_id` from remote data without walking its
    /// own ancestry. Returns the stored post, or `None` when it cannot be built yet.
    pub async fn reconstruct_parent(&self, parent_id: PostId) -> Result<Option<LocalPost>> {
        info!(parent = %parent_id, "creating parent");
        let resolution = self.resolve(parent_id, ResolveMode::StubResolve).await?;
        if resolution.post.is_none() {
            warn!(parent = %parent_id, outcome = %resolution.outcome, "parent could not be reconstructed");
        }
        Ok(resolution.post)
    }

    pub async fn resolve(&self, id: PostId, mode: ResolveMode) -> Result<Resolution> {
        let mut stack = vec![Frame::new(id, mode)];
        let mut known_missing: HashSet<PostId> = HashSet::new();

        loop {
            let Some(frame) = stack.last_mut() else {
                bail!("resolution of post {id} drained its stack without an outcome");
            };

            match self.step(frame).await? {
                Step::Continue => {}
                Step::Push(next, next_mode) => {
                    if known_missing.contains(&next) {
                        debug!(post = %next, "already known to be missing remotely");
                        continue;
                    }
                    if next_mode == ResolveMode::FullResolve && stack.iter().any(|f| f.id == next) {
                        warn!(
                            post = %next,
                            depth = stack.len(),
                            "ancestry cycle in remote data, leaving dependency unresolved"
                        );
                        continue;
                    }
                    self.sleeper.sleep(self.recursion_delay).await;
                    stack.push(Frame::new(next, next_mode));
                }
                Step::Done(resolution) => {
                    if let Some(done) = stack.pop() {
                        debug!(post = %done.id, mode = ?done.mode, outcome = %resolution.outcome, "frame resolved");
                        if resolution.outcome == SyncOutcome::Skipped(SkipReason::NotFound) {
                            known_missing.insert(done.id);
                        }
                    }
                    if stack.is_empty() {
                        return Ok(resolution);
                    }
                }
            }
        }
    }

    async fn step(&self, frame: &mut Frame) -> Result<Step> {
        match frame.stage {
            Stage::Fetch => self.fetch_stage(frame).await,
            Stage::Root => {
                frame.stage = Stage::Parent;
                let pending = frame.pending()?;
                self.dependency_step(pending.uid, pending.record.root_id, "root")
                    .await
            }
            Stage::Parent => {
                frame.stage = Stage::Write;
                let pending = frame.pending()?;
                self.dependency_step(pending.uid, pending.record.parent_id, "parent")
                    .await
            }
            Stage::Write => self.write_stage(frame).await,
            Stage::WriteAfterStub => {
                let pending = frame.take_pending()?;
                let parent = self.linked_post(pending.uid, pending.record.parent_id).await?;
                let root = self.linked_post(pending.uid, pending.record.root_id).await?;
                if parent.is_none() {
                    warn!(post = %pending.uid, "parent unavailable, creating post without a parent");
                }
                Ok(Step::Done(self.write(pending, parent, root).await?))
            }
        }
    }

    async fn fetch_stage(&self, frame: &mut Frame) -> Result<Step> {
        if frame.mode == ResolveMode::StubResolve {
            if let Some(existing) = self.store.find_post(frame.id).await? {
                return Ok(Step::Done(Resolution {
                    outcome: SyncOutcome::Skipped(SkipReason::AlreadyPresent),
                    post: Some(existing),
                }));
            }
        }

        let Some(record) = self
            .source
            .fetch_post(frame.id)
            .await
            .with_context(|| format!("fetching post {}", frame.id))?
        else {
            warn!(post = %frame.id, "post does not exist remotely");
            return Ok(Step::Done(Resolution::without_post(SyncOutcome::Skipped(
                SkipReason::NotFound,
            ))));
        };

        let uid = record.id.unwrap_or(frame.id);
        if uid != frame.id {
            warn!(requested = %frame.id, returned = %uid, "remote answered with a different id");
        }
        if record.author_id.trim().is_empty() {
            warn!(post = %uid, "record has no author id");
            return Ok(Step::Done(Resolution::without_post(SyncOutcome::Skipped(
                SkipReason::MissingAuthor,
            ))));
        }

        let author = match self.users.ensure_user(&record.author_id).await? {
            UserResolution::Resolved(user) => user,
            UserResolution::NeedsRetry => {
                info!(post = %uid, author = %record.author_id, "author not ready, deferring post");
                return Ok(Step::Done(Resolution::without_post(SyncOutcome::Deferred)));
            }
        };

        frame.pending = Some(Pending {
            uid,
            record,
            author,
        });
        frame.stage = match frame.mode {
            ResolveMode::FullResolve => Stage::Root,
            ResolveMode::StubResolve => Stage::Write,
        };
        Ok(Step::Continue)
    }

    async fn dependency_step(
        &self,
        uid: PostId,
        dependency: Option<PostId>,
        kind: &'static str,
    ) -> Result<Step> {
        let Some(dep_id) = dependency else {
            return Ok(Step::Continue);
        };
        if dep_id == uid || self.store.find_post(dep_id).await?.is_some() {
            return Ok(Step::Continue);
        }
        info!(post = %uid, dependency = %dep_id, kind, "recursively creating missing ancestor");
        Ok(Step::Push(dep_id, ResolveMode::FullResolve))
    }

    async fn write_stage(&self, frame: &mut Frame) -> Result<Step> {
        let pending = frame.pending()?;
        let parent = self.linked_post(pending.uid, pending.record.parent_id).await?;
        let root = self.linked_post(pending.uid, pending.record.root_id).await?;

        let orphaned_reply = frame.mode == ResolveMode::FullResolve
            && pending.record.post_type.is_reply()
            && parent.is_none()
            && root.is_none();
        if orphaned_reply && self.store.find_post(pending.uid).await?.is_none() {
            if let Some(parent_id) = pending.record.parent_id.filter(|p| *p != pending.uid) {
                warn!(post = %pending.uid, parent = %parent_id, "ancestry unresolved, reconstructing parent stub");
                frame.stage = Stage::WriteAfterStub;
                return Ok(Step::Push(parent_id, ResolveMode::StubResolve));
            }
        }

        let pending = frame.take_pending()?;
        Ok(Step::Done(self.write(pending, parent, root).await?))
    }

    /// Self-links resolve to the post's own id so repeated syncs store the same row.
    async fn linked_post(&self, uid: PostId, link: Option<PostId>) -> Result<Option<PostId>> {
        match link {
            None => Ok(None),
            Some(link) if link == uid => Ok(Some(uid)),
            Some(link) => Ok(self.store.find_post(link).await?.map(|post| post.uid)),
        }
    }

    async fn write(
        &self,
        pending: Pending,
        parent: Option<PostId>,
        root: Option<PostId>,
    ) -> Result<Resolution> {
        let write = PostWrite::from_record(pending.uid, &pending.record, &pending.author, parent, root);
        let (kind, post) = self
            .store
            .upsert_post(&write)
            .await
            .with_context(|| format!("writing post {}", pending.uid))?;
        let outcome = SyncOutcome::from(kind);
        info!(
            post = %post.uid,
            parent = ?post.parent_uid,
            root = ?post.root_uid,
            %outcome,
            "post written"
        );
        Ok(Resolution {
            outcome,
            post: Some(post),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub highest_id: PostId,
    pub lowest_id: PostId,
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub deferred: u64,
    pub failed: u64,
    pub pauses: u64,
}

impl BatchReport {
    fn new(highest_id: PostId, lowest_id: PostId) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            highest_id,
            lowest_id,
            processed: 0,
            created: 0,
            updated: 0,
            skipped: 0,
            deferred: 0,
            failed: 0,
            pauses: 0,
        }
    }

    fn record(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Created => self.created += 1,
            SyncOutcome::Updated => self.updated += 1,
            SyncOutcome::Skipped(_) => self.skipped += 1,
            SyncOutcome::Deferred => self.deferred += 1,
        }
    }
}

pub const FIRST_POST_ID: PostId = PostId(1);

/// Walks a descending id range. No checkpoint is kept; re-running relies on
/// the synchronizer's upsert idempotence.
pub struct BatchDriver {
    synchronizer: Arc<PostSynchronizer>,
    sleeper: Arc<dyn Sleeper>,
    pause_every: u64,
    pause: Duration,
}

impl BatchDriver {
    pub fn new(
        synchronizer: Arc<PostSynchronizer>,
        sleeper: Arc<dyn Sleeper>,
        pause_every: u64,
        pause: Duration,
    ) -> Self {
        Self {
            synchronizer,
            sleeper,
            pause_every,
            pause,
        }
    }

    pub async fn run_batch(&self, highest_id: PostId, lowest_id: PostId) -> BatchReport {
        if lowest_id < FIRST_POST_ID {
            warn!(lowest = %lowest_id, "post ids start at 1, raising the lower bound");
        }
        let lowest_id = lowest_id.max(FIRST_POST_ID);
        let mut report = BatchReport::new(highest_id, lowest_id);
        let span = info_span!("batch_run", run_id = %report.run_id, highest = %highest_id, lowest = %lowest_id);

        async {
            for raw_id in (lowest_id.get()..=highest_id.get()).rev() {
                let id = PostId(raw_id);
                info!(post = %id, "fetching post");
                match self.synchronizer.sync_post(id).await {
                    Ok(outcome) => report.record(outcome),
                    Err(err) => {
                        error!(post = %id, error = ?err, "post sync failed, moving on");
                        report.failed += 1;
                    }
                }
                report.processed += 1;

                if self.pause_every > 0 && report.processed % self.pause_every == 0 && id > lowest_id {
                    info!(pause_secs = self.pause.as_secs_f64(), "entering cooldown");
                    self.sleeper.sleep(self.pause).await;
                    report.pauses += 1;
                }
            }
        }
        .instrument(span)
        .await;

        report.finished_at = Utc::now();
        info!(
            run_id = %report.run_id,
            processed = report.processed,
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            deferred = report.deferred,
            failed = report.failed,
            "batch finished"
        );
        report
    }
}

async fn probe(source: &dyn PostSource, from: u64, window: u64) -> Result<Option<PostId>> {
    for offset in 0..window {
        let candidate = PostId(from.saturating_add(offset));
        if source
            .fetch_post(candidate)
            .await
            .with_context(|| format!("probing post {candidate}"))?
            .is_some()
        {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// Finds the current highest post id by galloping up from `start_hint` and then
/// bisecting. A probe at `n` counts as empty only when `window` consecutive ids
/// from `n` are all missing, so deleted posts narrower than the window are
/// stepped over; wider gaps can make the result too low.
pub async fn discover_highest_id(
    source: &dyn PostSource,
    start_hint: PostId,
    window: u64,
) -> Result<Option<PostId>> {
    let window = window.max(1);
    let hint = start_hint.get().max(1);

    let (mut lo, mut hi) = match probe(source, hint, window).await? {
        Some(found) => {
            let mut lo = found.get();
            let mut step = hint.max(window);
            loop {
                let next = lo.saturating_add(step);
                if next == lo {
                    return Ok(Some(PostId(lo)));
                }
                match probe(source, next, window).await? {
                    Some(found) => {
                        lo = found.get();
                        step = step.saturating_mul(2);
                    }
                    None => break (lo, next),
                }
            }
        }
        None if hint == 1 => return Ok(None),
        None => match probe(source, 1, window).await? {
            Some(found) => (found.get().min(hint - 1), hint),
            None => return Ok(None),
        },
    };

    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        match probe(source, mid, window).await? {
            Some(found) => lo = found.get().clamp(mid, hi - 1),
            None => hi = mid,
        }
    }

    info!(highest = lo, window, "discovered highest post id");
    Ok(Some(PostId(lo)))
}

/// Everything a run needs, wired from an [`ImportConfig`].
pub struct ImportPipeline {
    config: ImportConfig,
    store: Arc<dyn ForumStore>,
    source: Arc<dyn PostSource>,
    synchronizer: Arc<PostSynchronizer>,
    batch: BatchDriver,
}

impl ImportPipeline {
    pub async fn connect(config: ImportConfig) -> Result<Self> {
        let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);
        let store: Arc<dyn ForumStore> = Arc::new(SqliteStore::connect(&config.database_url).await?);
        let source: Arc<dyn PostSource> = match &config.fixtures_dir {
            Some(dir) => {
                let fixtures = StaticPostSource::from_fixture_dir(dir)?;
                info!(dir = %dir.display(), records = fixtures.len(), "serving posts from fixtures");
                Arc::new(fixtures)
            }
            None => {
                let http = HttpFetcher::new(config.http_client_config(), sleeper.clone())?;
                Arc::new(ApiPostSource::new(&config.api_base_url, http)?)
            }
        };
        Ok(Self::with_parts(config, store, source, sleeper))
    }

    pub fn with_parts(
        config: ImportConfig,
        store: Arc<dyn ForumStore>,
        source: Arc<dyn PostSource>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let provisioner = Arc::new(PlaceholderUserProvisioner::new(store.clone()));
        let users = UserResolver::new(store.clone(), provisioner);
        let synchronizer = Arc::new(PostSynchronizer::new(
            source.clone(),
            store.clone(),
            users,
            sleeper.clone(),
            Duration::from_millis(config.recursion_delay_ms),
        ));
        let batch = BatchDriver::new(
            synchronizer.clone(),
            sleeper,
            config.batch_pause_every,
            Duration::from_secs(config.batch_pause_secs),
        );
        Self {
            config,
            store,
            source,
            synchronizer,
            batch,
        }
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn synchronizer(&self) -> &PostSynchronizer {
        &self.synchronizer
    }

    pub async fn sync_post(&self, id: PostId) -> Result<SyncOutcome> {
        self.synchronizer.sync_post(id).await
    }

    pub async fn discover_highest_id(&self) -> Result<Option<PostId>> {
        discover_highest_id(
            self.source.as_ref(),
            PostId(self.config.discovery_hint),
            self.config.discovery_window,
        )
        .await
    }

    /// Runs `highest..=lowest`, discovering `highest` from the remote when absent.
    pub async fn run_batch(&self, highest_id: Option<PostId>, lowest_id: PostId) -> Result<BatchReport> {
        let highest_id = match highest_id {
            Some(id) => id,
            None => self
                .discover_highest_id()
                .await?
                .with_context(|| format!("no posts found on {}", self.source.source_name()))?,
        };
        Ok(self.batch.run_batch(highest_id, lowest_id).await)
    }

    pub async fn stored_posts(&self) -> Result<u64> {
        Ok(self.store.post_count().await?)
    }
}

pub async fn pipeline_from_env(config_file: Option<&Path>) -> Result<ImportPipeline> {
    let mut config = ImportConfig::from_env();
    if let Some(path) = config_file {
        config = config.with_overrides_file(path).await?;
    }
    ImportPipeline::connect(config).await
}
