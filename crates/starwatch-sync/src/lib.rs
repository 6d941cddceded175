//! Run orchestration: resolve → fetch → normalize → merge → detect → trend → notify → report.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use starwatch_adapters::{
    normalize, CmsProviderDataSource, FieldMapping, FixtureSnapshotSource, NormalizeError,
    SnapshotSource, CMS_PROVIDER_INFO_METADATA_URL,
};
use starwatch_core::{
    ChangeEvent, DeliveryStatus, EntityId, EntityIdError, MetricKey, NotificationOutcome,
    RejectedRow, TrendSummary,
};
use starwatch_notify::{build_channels, load_channel_configs, ConfiguredChannel, Dispatcher};
use starwatch_storage::{
    ArtifactStore, BackoffPolicy, Deadline, FetchError, HistoryStore, HttpClientConfig,
    HttpFetcher, MergeCounts, PersistenceError,
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub mod detect;
pub mod report;
pub mod trend;

pub use detect::{detect_changes, ChangeDetector};
pub use report::{render_brief, render_trend_table, report_runs_markdown, write_run_reports};
pub use trend::{summarize, summarize_all};

pub const CRATE_NAME: &str = "starwatch-sync";

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub history_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub metadata_url: String,
    /// When set, snapshots come from this local metadata file instead of CMS.
    pub fixture_metadata: Option<PathBuf>,
    pub mapping_path: Option<PathBuf>,
    pub channels_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_attempts: u32,
    pub run_deadline_secs: Option<u64>,
    pub max_workers: usize,
    pub trend_window_days: i64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            history_path: PathBuf::from("./data/rating_history.csv"),
            artifacts_dir: PathBuf::from("./artifacts"),
            reports_dir: PathBuf::from("./reports"),
            metadata_url: CMS_PROVIDER_INFO_METADATA_URL.to_string(),
            fixture_metadata: None,
            mapping_path: None,
            channels_path: PathBuf::from("./config/channels.yaml"),
            user_agent: format!("starwatch/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 60,
            max_attempts: 3,
            run_deadline_secs: None,
            max_workers: 8,
            trend_window_days: 180,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl WatchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            history_path: std::env::var("STARWATCH_HISTORY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.history_path),
            artifacts_dir: std::env::var("STARWATCH_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            reports_dir: std::env::var("STARWATCH_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            metadata_url: std::env::var("STARWATCH_METADATA_URL").unwrap_or(defaults.metadata_url),
            fixture_metadata: std::env::var("STARWATCH_FIXTURE_METADATA")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            mapping_path: std::env::var("STARWATCH_MAPPING_PATH")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            channels_path: std::env::var("STARWATCH_CHANNELS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.channels_path),
            user_agent: std::env::var("STARWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parsed("STARWATCH_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            max_attempts: env_parsed("STARWATCH_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            run_deadline_secs: env_parsed("STARWATCH_RUN_DEADLINE_SECS"),
            max_workers: env_parsed("STARWATCH_MAX_WORKERS").unwrap_or(defaults.max_workers),
            trend_window_days: env_parsed("STARWATCH_TREND_WINDOW_DAYS")
                .unwrap_or(defaults.trend_window_days),
        }
    }

    /// Every on-disk location under `root`; handy for tests and throwaway runs.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            history_path: root.join("data/rating_history.csv"),
            artifacts_dir: root.join("artifacts"),
            reports_dir: root.join("reports"),
            channels_path: root.join("config/channels.yaml"),
            ..Self::default()
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::default().with_max_attempts(self.max_attempts)
    }

    pub fn deadline(&self) -> Deadline {
        self.run_deadline_secs
            .map(|secs| Deadline::after(Duration::from_secs(secs)))
            .unwrap_or_default()
    }

    pub fn trend_window(&self) -> chrono::Duration {
        chrono::Duration::try_days(self.trend_window_days.max(0)).unwrap_or(chrono::Duration::MAX)
    }
}

#[derive(Debug, Error)]
pub enum WatchListError {
    #[error("line {line}: {source}")]
    InvalidId {
        line: usize,
        #[source]
        source: EntityIdError,
    },
}

/// Entities to monitor. An empty list watches every entity in the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchList {
    ids: BTreeSet<EntityId>,
}

impl WatchList {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn from_ids<S: AsRef<str>>(ids: impl IntoIterator<Item = S>) -> Result<Self, WatchListError> {
        let ids = ids
            .into_iter()
            .enumerate()
            .map(|(idx, raw)| {
                EntityId::parse(raw.as_ref())
                    .map_err(|source| WatchListError::InvalidId { line: idx + 1, source })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { ids })
    }

    /// One id per line; blank lines and `#` comments are ignored.
    pub fn parse(text: &str) -> Result<Self, WatchListError> {
        let mut ids = BTreeSet::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let id = EntityId::parse(line)
                .map_err(|source| WatchListError::InvalidId { line: idx + 1, source })?;
            ids.insert(id);
        }
        Ok(Self { ids })
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading watch list {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing watch list {}", path.display()))
    }

    pub fn merged(mut self, other: WatchList) -> Self {
        self.ids.extend(other.ids);
        self
    }

    pub fn is_all(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &BTreeSet<EntityId> {
        &self.ids
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.is_all() || self.ids.contains(id)
    }

    /// Filter for the normalizer; `None` means keep everything.
    pub fn filter(&self) -> Option<&BTreeSet<EntityId>> {
        (!self.is_all()).then_some(&self.ids)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Resolving,
    Fetching,
    Normalizing,
    Merging,
    Detecting,
    Trending,
    Notifying,
    Reporting,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Resolving => "resolving",
            Self::Fetching => "fetching",
            Self::Normalizing => "normalizing",
            Self::Merging => "merging",
            Self::Detecting => "detecting",
            Self::Trending => "trending",
            Self::Notifying => "notifying",
            Self::Reporting => "reporting",
            Self::Done => "done",
            Self::Failed => "failed",
        })
    }
}

/// Fatal run outcome; the message names the stage that failed.
#[derive(Debug, Error)]
pub enum RunFailure {
    #[error("opening history store failed: {0}")]
    History(#[source] PersistenceError),
    #[error("resolving snapshot location failed: {0}")]
    Resolve(#[source] FetchError),
    #[error("fetching snapshot failed: {0}")]
    Fetch(#[source] FetchError),
    #[error("normalizing snapshot failed: {0}")]
    Normalize(#[source] NormalizeError),
    #[error("merging into history failed: {0}")]
    Merge(#[source] PersistenceError),
    #[error("run deadline exceeded during {stage}")]
    DeadlineExceeded { stage: RunState },
}

impl RunFailure {
    pub fn stage(&self) -> RunState {
        match self {
            Self::History(_) => RunState::Idle,
            Self::Resolve(_) => RunState::Resolving,
            Self::Fetch(_) => RunState::Fetching,
            Self::Normalize(_) => RunState::Normalizing,
            Self::Merge(_) => RunState::Merging,
            Self::DeadlineExceeded { stage } => *stage,
        }
    }

    fn from_fetch(stage: RunState, err: FetchError) -> Self {
        match (stage, err) {
            (stage, FetchError::DeadlineExceeded { .. }) => Self::DeadlineExceeded { stage },
            (RunState::Resolving, err) => Self::Resolve(err),
            (_, err) => Self::Fetch(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub watch: WatchList,
    pub include_trends: bool,
    pub notify: bool,
    pub write_reports: bool,
    /// Detect and report against an in-memory copy of the history; nothing is persisted.
    pub dry_run: bool,
    pub trend_window: chrono::Duration,
    pub deadline: Deadline,
}

impl RunRequest {
    pub fn from_config(config: &WatchConfig, watch: WatchList) -> Self {
        Self {
            watch,
            include_trends: false,
            notify: false,
            write_reports: true,
            dry_run: false,
            trend_window: config.trend_window(),
            deadline: config.deadline(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub entities_processed: usize,
    pub rejected_rows: usize,
    pub unwatched_rows: usize,
    pub merge: MergeCounts,
    pub changes_detected: usize,
    pub notifications_delivered: usize,
    pub notifications_failed: usize,
    pub notifications_skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: RunState,
    pub source_id: String,
    pub snapshot_uri: String,
    pub as_of: NaiveDate,
    pub raw_artifact: Option<String>,
    pub counts: RunCounts,
    pub changes: Vec<ChangeEvent>,
    pub trends: Vec<TrendSummary>,
    pub rejected: Vec<RejectedRow>,
    pub notifications: Vec<NotificationOutcome>,
    pub warnings: Vec<String>,
    pub state_trail: Vec<RunState>,
    pub reports_dir: Option<String>,
}

impl RunReport {
    pub fn failed_channels(&self) -> impl Iterator<Item = &NotificationOutcome> {
        self.notifications
            .iter()
            .filter(|n| matches!(n.status, DeliveryStatus::Failed(_)))
    }
}

/// Ordered record of the stages a run passed through, enforcing the deadline at each
/// boundary.
struct StageTracker {
    trail: Vec<RunState>,
    deadline: Deadline,
}

impl StageTracker {
    fn new(deadline: Deadline) -> Self {
        Self {
            trail: vec![RunState::Idle],
            deadline,
        }
    }

    fn enter(&mut self, next: RunState) -> Result<(), RunFailure> {
        if self.deadline.expired() {
            warn!(stage = %next, "run deadline exceeded");
            return Err(RunFailure::DeadlineExceeded { stage: next });
        }
        info!(stage = %next, "entering run stage");
        self.trail.push(next);
        Ok(())
    }
}

pub struct Pipeline {
    config: WatchConfig,
    source: Arc<dyn SnapshotSource>,
    mapping: FieldMapping,
    channels: Vec<ConfiguredChannel>,
    artifacts: ArtifactStore,
    dispatcher: Dispatcher,
}

impl Pipeline {
    pub fn new(
        config: WatchConfig,
        source: Arc<dyn SnapshotSource>,
        mapping: FieldMapping,
        channels: Vec<ConfiguredChannel>,
    ) -> Self {
        let artifacts = ArtifactStore::new(config.artifacts_dir.clone());
        let dispatcher = Dispatcher::new(config.backoff(), config.max_workers);
        Self {
            config,
            source,
            mapping,
            channels,
            artifacts,
            dispatcher,
        }
    }

    /// Build the live pipeline: CMS (or fixture) source, mapping table, and channels
    /// with credentials read from the environment.
    pub fn from_config(config: WatchConfig) -> anyhow::Result<Self> {
        let mapping = match &config.mapping_path {
            Some(path) => FieldMapping::load(path)?,
            None => FieldMapping::provider_info()?,
        };

        let source: Arc<dyn SnapshotSource> = match &config.fixture_metadata {
            Some(path) => Arc::new(FixtureSnapshotSource::new(path.clone())),
            None => {
                let http = HttpFetcher::new(HttpClientConfig {
                    timeout: config.http_timeout(),
                    user_agent: Some(config.user_agent.clone()),
                    backoff: config.backoff(),
                    ..Default::default()
                })?;
                Arc::new(CmsProviderDataSource::new(
                    config.metadata_url.clone(),
                    Arc::new(http),
                ))
            }
        };

        let channel_configs = load_channel_configs(&config.channels_path)?;
        let env_lookup = |var: &str| std::env::var(var).ok();
        let channels = build_channels(&channel_configs, config.http_timeout(), &env_lookup);
        Ok(Self::new(config, source, mapping, channels))
    }

    pub fn with_notification_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.dispatcher = Dispatcher::new(backoff, self.config.max_workers);
        self
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    pub fn channels(&self) -> &[ConfiguredChannel] {
        &self.channels
    }

    /// Execute one run. Per-entity, per-channel, and report-writing problems degrade to
    /// warnings; only source, normalization, and persistence failures are fatal.
    pub async fn run_once(&self, request: &RunRequest) -> Result<RunReport, RunFailure> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut stages = StageTracker::new(request.deadline);
        let mut warnings = Vec::new();
        info!(%run_id, source = self.source.source_id(), "run started");

        let history_path = self.config.history_path.clone();
        let dry_run = request.dry_run;
        let opened = tokio::task::spawn_blocking(move || {
            if dry_run {
                HistoryStore::open_read_only(&history_path).map(HistoryStore::detached)
            } else {
                HistoryStore::open(&history_path)
            }
        })
        .await;
        let store = joined_history(&self.config.history_path, opened).map_err(RunFailure::History)?;
        if dry_run {
            warnings.push("dry run: history was not persisted".to_string());
        }
        if store.skipped_rows() > 0 {
            warnings.push(format!(
                "{} corrupt history row(s) left out while loading {}",
                store.skipped_rows(),
                self.config.history_path.display()
            ));
        }

        stages.enter(RunState::Resolving)?;
        let location = self
            .source
            .resolve_snapshot_location(request.deadline)
            .await
            .map_err(|err| RunFailure::from_fetch(RunState::Resolving, err))?;

        stages.enter(RunState::Fetching)?;
        let raw = self
            .source
            .fetch_snapshot(&location, request.deadline)
            .await
            .map_err(|err| RunFailure::from_fetch(RunState::Fetching, err))?;
        let raw_artifact = match self
            .artifacts
            .store_bytes(raw.published_on, &raw.source_id, "csv", &raw.body)
            .await
        {
            Ok(stored) => Some(stored.relative_path.display().to_string()),
            Err(err) => {
                warn!(error = %err, "failed to archive raw snapshot");
                warnings.push(format!("raw snapshot not archived: {err:#}"));
                None
            }
        };

        stages.enter(RunState::Normalizing)?;
        let batch =
            normalize(&raw, &self.mapping, request.watch.filter()).map_err(RunFailure::Normalize)?;
        for metric in &batch.missing_metrics {
            warnings.push(format!("snapshot has no column for metric {metric}"));
        }
        let in_snapshot: BTreeSet<&EntityId> = batch.records.iter().map(|r| &r.entity_id).collect();
        let rejected_ids: BTreeSet<String> = batch
            .rejected
            .iter()
            .filter_map(|r| r.raw_entity_id.as_deref())
            .filter_map(|raw| EntityId::parse(raw).ok())
            .map(String::from)
            .collect();
        for id in request.watch.ids() {
            if !in_snapshot.contains(id) && !rejected_ids.contains(id.as_str()) {
                warnings.push(format!("watched entity {id} is not in the snapshot"));
            }
        }
        let processed: Vec<EntityId> = batch.records.iter().map(|r| r.entity_id.clone()).collect();

        stages.enter(RunState::Merging)?;
        let records = batch.records;
        let merged = tokio::task::spawn_blocking(move || {
            let mut store = store;
            store.merge(records, Utc::now()).map(|merge| (store, merge))
        })
        .await;
        let (store, merge) =
            joined_history(&self.config.history_path, merged).map_err(RunFailure::Merge)?;
        let store = Arc::new(store);

        stages.enter(RunState::Detecting)?;
        let candidates: Vec<EntityId> = merge
            .touched
            .iter()
            .filter(|id| store.latest(id).is_some_and(|e| e.as_of() == raw.published_on))
            .cloned()
            .collect();
        let changes = ChangeDetector::new(self.config.max_workers)
            .detect_all(Arc::clone(&store), candidates)
            .await;
        info!(changes = changes.len(), "change detection complete");

        let trends = if request.include_trends {
            stages.enter(RunState::Trending)?;
            let metrics: Vec<MetricKey> = self.mapping.metric_keys();
            summarize_all(&store, &processed, &metrics, request.trend_window, raw.published_on)
        } else {
            Vec::new()
        };

        let notifications = if request.notify {
            stages.enter(RunState::Notifying)?;
            if self.channels.is_empty() {
                warnings.push("notifications requested but no channels are configured".to_string());
            }
            self.dispatcher
                .dispatch(&changes, &self.channels, request.deadline)
                .await
        } else {
            Vec::new()
        };
        for outcome in &notifications {
            if let DeliveryStatus::Failed(reason) = &outcome.status {
                warnings.push(format!("channel {} failed: {reason}", outcome.channel));
            }
        }

        stages.enter(RunState::Reporting)?;
        let counts = RunCounts {
            entities_processed: processed.len(),
            rejected_rows: batch.rejected.len(),
            unwatched_rows: batch.unwatched_rows,
            merge: merge.counts,
            changes_detected: changes.len(),
            notifications_delivered: count_status(&notifications, |s| *s == DeliveryStatus::Delivered),
            notifications_failed: count_status(&notifications, |s| matches!(s, DeliveryStatus::Failed(_))),
            notifications_skipped: count_status(&notifications, |s| matches!(s, DeliveryStatus::Skipped(_))),
        };
        let mut report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            state: RunState::Done,
            source_id: raw.source_id.clone(),
            snapshot_uri: raw.location.clone(),
            as_of: raw.published_on,
            raw_artifact,
            counts,
            changes,
            trends,
            rejected: batch.rejected,
            notifications,
            warnings,
            state_trail: Vec::new(),
            reports_dir: None,
        };
        stages.trail.push(RunState::Done);
        report.state_trail = stages.trail;

        if request.write_reports {
            match write_run_reports(&self.config.reports_dir, &report).await {
                Ok(dir) => report.reports_dir = Some(dir.display().to_string()),
                Err(err) => {
                    warn!(error = %err, "failed to write run reports");
                    report.warnings.push(format!("reports not written: {err:#}"));
                }
            }
        }

        info!(
            %run_id,
            as_of = %report.as_of,
            changes = report.counts.changes_detected,
            rejected = report.counts.rejected_rows,
            warnings = report.warnings.len(),
            "run done"
        );
        Ok(report)
    }
}

/// Flatten a blocking history task, reporting a panicked task as an I/O failure.
fn joined_history<T>(
    path: &Path,
    joined: Result<Result<T, PersistenceError>, tokio::task::JoinError>,
) -> Result<T, PersistenceError> {
    joined.map_err(|err| PersistenceError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::other(err),
    })?
}

fn count_status(outcomes: &[NotificationOutcome], pred: impl Fn(&DeliveryStatus) -> bool) -> usize {
    outcomes.iter().filter(|o| pred(&o.status)).count()
}

/// Trend summaries straight from persisted history, without fetching. `end` defaults to
/// the latest `as_of` on record.
pub fn trends_from_history(
    history_path: &Path,
    watch: &WatchList,
    metrics: &[MetricKey],
    window: chrono::Duration,
    end: Option<NaiveDate>,
) -> Result<Vec<TrendSummary>, PersistenceError> {
    let store = HistoryStore::open_read_only(history_path)?;
    let end = match end.or_else(|| store.entries().map(|e| e.as_of()).max()) {
        Some(end) => end,
        None => return Ok(Vec::new()),
    };
    let ids: Vec<&EntityId> = store.entity_ids().filter(|id| watch.contains(id)).collect();
    let metrics: Vec<MetricKey> = if metrics.is_empty() {
        store.metric_keys().into_iter().collect()
    } else {
        metrics.to_vec()
    };
    Ok(summarize_all(&store, ids, &metrics, window, end))
}
