use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use starwatch_adapters::{
    CmsProviderDataSource, FieldMapping, FixtureSnapshotSource, RawSnapshot, SnapshotLocation,
    SnapshotSource,
};
use starwatch_core::{ChangeEvent, DeliveryStatus, Direction, EntityId, MetricKey, RatingValue};
use starwatch_notify::{
    ChannelDeliveryError, ChannelKind, ConfiguredChannel, FileChannel, NotificationChannel, Payload,
};
use starwatch_storage::{
    BackoffPolicy, Deadline, FetchError, HistoryLock, HistoryStore, HttpClientConfig, HttpFetcher,
    PersistenceError,
};
use starwatch_sync::{
    report_runs_markdown, trends_from_history, Pipeline, RunFailure, RunRequest, RunState,
    WatchConfig, WatchList,
};
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const HEADER: &str = "CMS Certification Number (CCN),Provider Name,City/Town,State,Overall Rating,Health Inspection Rating,QM Rating,Staffing Rating";

fn date(month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, month, 1).unwrap()
}

fn quick_backoff() -> BackoffPolicy {
    BackoffPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: 0.0,
    }
}

/// In-memory source whose published snapshot can be swapped between runs.
struct ScriptedSource {
    published: Mutex<(NaiveDate, String)>,
}

impl ScriptedSource {
    fn new(as_of: NaiveDate, rows: &[&str]) -> Arc<Self> {
        let source = Arc::new(Self {
            published: Mutex::new((as_of, String::new())),
        });
        source.publish(as_of, rows);
        source
    }

    fn publish(&self, as_of: NaiveDate, rows: &[&str]) {
        let mut csv = format!("{HEADER}\n");
        for row in rows {
            csv.push_str(row);
            csv.push('\n');
        }
        *self.published.lock().unwrap() = (as_of, csv);
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    fn source_id(&self) -> &str {
        "scripted"
    }

    async fn resolve_snapshot_location(
        &self,
        _deadline: Deadline,
    ) -> Result<SnapshotLocation, FetchError> {
        let (as_of, _) = &*self.published.lock().unwrap();
        Ok(SnapshotLocation {
            uri: "memory://provider_info.csv".to_string(),
            published_on: *as_of,
            title: None,
        })
    }

    async fn fetch_snapshot(
        &self,
        location: &SnapshotLocation,
        _deadline: Deadline,
    ) -> Result<RawSnapshot, FetchError> {
        let (_, body) = &*self.published.lock().unwrap();
        Ok(RawSnapshot {
            source_id: self.source_id().to_string(),
            location: location.uri.clone(),
            published_on: location.published_on,
            fetched_at: Utc::now(),
            content_type: Some("text/csv".to_string()),
            body: body.clone().into_bytes(),
        })
    }
}

/// Channel that always fails with a transient error.
struct DownChannel {
    calls: AtomicUsize,
}

#[async_trait]
impl NotificationChannel for DownChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    fn format(&self, events: &[ChangeEvent]) -> Payload {
        Payload::Json(starwatch_notify::alert_json(events, Utc::now()))
    }

    async fn deliver(&self, _payload: &Payload) -> Result<(), ChannelDeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ChannelDeliveryError::Transient("http status 503".to_string()))
    }
}

fn channel(name: &str, transport: Arc<dyn NotificationChannel>) -> ConfiguredChannel {
    ConfiguredChannel {
        name: name.to_string(),
        kind: transport.kind(),
        enabled: true,
        transport: Ok(transport),
    }
}

fn pipeline(root: &Path, source: Arc<dyn SnapshotSource>, channels: Vec<ConfiguredChannel>) -> Pipeline {
    Pipeline::new(
        WatchConfig::rooted_at(root),
        source,
        FieldMapping::provider_info().unwrap(),
        channels,
    )
    .with_notification_backoff(quick_backoff())
}

fn request(root: &Path) -> RunRequest {
    let mut request = RunRequest::from_config(&WatchConfig::rooted_at(root), WatchList::all());
    request.write_reports = false;
    request
}

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/provider-info")
        .join(name)
        .join("metadata.json")
}

#[tokio::test]
async fn rating_increase_between_snapshots_emits_one_up_event() {
    let dir = tempdir().unwrap();
    let source = ScriptedSource::new(date(2), &["455682,SUNNY ACRES,AUSTIN,TX,3,,,"]);
    let pipeline = pipeline(dir.path(), source.clone(), Vec::new());

    let baseline = pipeline.run_once(&request(dir.path())).await.unwrap();
    assert_eq!(baseline.state, RunState::Done);
    assert!(baseline.changes.is_empty());
    assert_eq!(baseline.counts.merge.inserted, 1);

    source.publish(date(3), &["455682,SUNNY ACRES,AUSTIN,TX,4,,,"]);
    let report = pipeline.run_once(&request(dir.path())).await.unwrap();

    assert_eq!(report.changes.len(), 1);
    let change = &report.changes[0];
    assert_eq!(change.metric, MetricKey::new("overall"));
    assert_eq!((change.previous_value, change.current_value), (3, 4));
    assert_eq!(change.direction, Direction::Up);
    assert_eq!(
        report.state_trail,
        vec![
            RunState::Idle,
            RunState::Resolving,
            RunState::Fetching,
            RunState::Normalizing,
            RunState::Merging,
            RunState::Detecting,
            RunState::Reporting,
            RunState::Done,
        ]
    );

    drop(pipeline);
    let store = HistoryStore::open_read_only(dir.path().join("data/rating_history.csv")).unwrap();
    assert_eq!(store.len(), 2);
    let (newest, prior) = store.latest_two(&EntityId::parse("455682").unwrap());
    assert_eq!(newest.unwrap().as_of(), date(3));
    assert_eq!(prior.unwrap().as_of(), date(2));
}

#[tokio::test]
async fn rerunning_the_same_snapshot_is_idempotent() {
    let dir = tempdir().unwrap();
    let source = ScriptedSource::new(date(2), &["455682,SUNNY ACRES,AUSTIN,TX,3,2,4,Not Available"]);
    let pipeline = pipeline(dir.path(), source.clone(), Vec::new());
    pipeline.run_once(&request(dir.path())).await.unwrap();
    source.publish(date(3), &["455682,SUNNY ACRES,AUSTIN,TX,4,2,4,3"]);

    let first = pipeline.run_once(&request(dir.path())).await.unwrap();
    assert_eq!(first.changes.len(), 1);
    let history_path = dir.path().join("data/rating_history.csv");
    let bytes_after_first = std::fs::read(&history_path).unwrap();

    let second = pipeline.run_once(&request(dir.path())).await.unwrap();
    assert!(second.changes.is_empty());
    assert_eq!(second.counts.merge.unchanged, 1);
    assert_eq!(second.counts.merge.inserted + second.counts.merge.overwritten, 0);
    assert_eq!(std::fs::read(&history_path).unwrap(), bytes_after_first);
}

#[tokio::test]
async fn backfilling_an_older_snapshot_raises_no_alerts() {
    let dir = tempdir().unwrap();
    let source = ScriptedSource::new(date(3), &["455682,SUNNY ACRES,AUSTIN,TX,4,,,"]);
    let pipeline = pipeline(dir.path(), source.clone(), Vec::new());
    pipeline.run_once(&request(dir.path())).await.unwrap();

    source.publish(date(2), &["455682,SUNNY ACRES,AUSTIN,TX,3,,,"]);
    let backfill = pipeline.run_once(&request(dir.path())).await.unwrap();

    assert_eq!(backfill.counts.merge.inserted, 1);
    assert!(backfill.changes.is_empty());
    drop(pipeline);
    let store = HistoryStore::open_read_only(dir.path().join("data/rating_history.csv")).unwrap();
    let (newest, prior) = store.latest_two(&EntityId::parse("455682").unwrap());
    assert_eq!(newest.unwrap().as_of(), date(3));
    assert_eq!(prior.unwrap().as_of(), date(2));
}

#[tokio::test]
async fn corrected_republish_of_the_latest_date_alerts_again() {
    let dir = tempdir().unwrap();
    let source = ScriptedSource::new(date(2), &["455682,SUNNY ACRES,AUSTIN,TX,3,,,"]);
    let pipeline = pipeline(dir.path(), source.clone(), Vec::new());
    pipeline.run_once(&request(dir.path())).await.unwrap();
    source.publish(date(3), &["455682,SUNNY ACRES,AUSTIN,TX,4,,,"]);
    let first = pipeline.run_once(&request(dir.path())).await.unwrap();
    assert_eq!(first.changes[0].direction, Direction::Up);

    source.publish(date(3), &["455682,SUNNY ACRES,AUSTIN,TX,2,,,"]);
    let corrected = pipeline.run_once(&request(dir.path())).await.unwrap();

    assert_eq!(corrected.counts.merge.overwritten, 1);
    assert_eq!(corrected.counts.merge.inserted, 0);
    assert_eq!(corrected.changes.len(), 1);
    let change = &corrected.changes[0];
    assert_eq!((change.previous_value, change.current_value), (3, 2));
    assert_eq!(change.direction, Direction::Down);
}

#[tokio::test]
async fn dry_run_reports_changes_without_saving_history() {
    let dir = tempdir().unwrap();
    let source = ScriptedSource::new(date(2), &["455682,SUNNY ACRES,AUSTIN,TX,3,,,"]);
    let pipeline = pipeline(dir.path(), source.clone(), Vec::new());
    pipeline.run_once(&request(dir.path())).await.unwrap();
    let history_path = dir.path().join("data/rating_history.csv");
    let saved = std::fs::read(&history_path).unwrap();

    source.publish(date(3), &["455682,SUNNY ACRES,AUSTIN,TX,4,,,"]);
    let mut dry = request(dir.path());
    dry.dry_run = true;
    let preview = pipeline.run_once(&dry).await.unwrap();
    assert_eq!(preview.changes.len(), 1);
    assert!(preview.warnings.iter().any(|w| w.contains("dry run")));
    assert_eq!(std::fs::read(&history_path).unwrap(), saved);
    assert!(!HistoryLock::lock_path_for(&history_path).exists());

    let real = pipeline.run_once(&request(dir.path())).await.unwrap();
    assert_eq!(real.changes.len(), 1);
    assert_eq!(real.counts.merge.inserted, 1);
}

#[tokio::test]
async fn one_failed_channel_still_reaches_done() {
    let dir = tempdir().unwrap();
    let source = ScriptedSource::new(date(2), &["455682,SUNNY ACRES,AUSTIN,TX,3,,,"]);
    let down = Arc::new(DownChannel {
        calls: AtomicUsize::new(0),
    });
    let audit_path = dir.path().join("alerts.jsonl");
    let channels = vec![
        channel("team-webhook", down.clone()),
        channel("audit-log", Arc::new(FileChannel::new(&audit_path))),
    ];
    let pipeline = pipeline(dir.path(), source.clone(), channels);

    let mut req = request(dir.path());
    req.notify = true;
    let baseline = pipeline.run_once(&req).await.unwrap();
    assert!(baseline
        .notifications
        .iter()
        .all(|n| matches!(n.status, DeliveryStatus::Skipped(_))));

    source.publish(date(3), &["455682,SUNNY ACRES,AUSTIN,TX,2,,,"]);
    let report = pipeline.run_once(&req).await.unwrap();

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.notifications.len(), 2);
    assert!(matches!(report.notifications[0].status, DeliveryStatus::Failed(_)));
    assert_eq!(report.notifications[0].attempts, 3);
    assert_eq!(down.calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.notifications[1].status, DeliveryStatus::Delivered);
    assert_eq!(report.counts.notifications_failed, 1);
    assert_eq!(report.counts.notifications_delivered, 1);
    assert!(report.warnings.iter().any(|w| w.contains("team-webhook")));
    assert_eq!(report.failed_channels().count(), 1);

    let line = std::fs::read_to_string(&audit_path).unwrap();
    let payload: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(payload["change_count"], 1);
    assert_eq!(payload["changes"][0]["direction"], "down");
}

/// Answers every request with 503 and counts them.
async fn unavailable_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = socket
                    .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (format!("http://{addr}/metastore/items/4pq5-n9py"), hits)
}

#[tokio::test]
async fn exhausted_transient_fetch_fails_the_run() {
    let dir = tempdir().unwrap();
    let (url, hits) = unavailable_server().await;
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        backoff: quick_backoff(),
        ..Default::default()
    })
    .unwrap();
    let source = Arc::new(CmsProviderDataSource::new(url, Arc::new(http)));
    let pipeline = pipeline(dir.path(), source, Vec::new());

    let err = pipeline.run_once(&request(dir.path())).await.unwrap_err();
    match &err {
        RunFailure::Resolve(FetchError::Transient { attempts, .. }) => assert_eq!(*attempts, 3),
        other => panic!("expected transient resolve failure, got {other:?}"),
    }
    assert_eq!(err.stage(), RunState::Resolving);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert!(!dir.path().join("data/rating_history.csv").exists());
    assert!(!dir.path().join("reports").exists());
}

#[tokio::test]
async fn concurrent_runs_fail_fast_on_the_history_lock() {
    let dir = tempdir().unwrap();
    let history_path = dir.path().join("data/rating_history.csv");
    std::fs::create_dir_all(history_path.parent().unwrap()).unwrap();
    let _held = HistoryLock::acquire(&history_path).unwrap();

    let source = ScriptedSource::new(date(2), &["455682,SUNNY ACRES,AUSTIN,TX,3,,,"]);
    let err = pipeline(dir.path(), source, Vec::new())
        .run_once(&request(dir.path()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunFailure::History(PersistenceError::Contention { .. })
    ));
}

#[tokio::test]
async fn expired_deadline_stops_before_resolving() {
    let dir = tempdir().unwrap();
    let source = ScriptedSource::new(date(2), &["455682,SUNNY ACRES,AUSTIN,TX,3,,,"]);
    let mut req = request(dir.path());
    req.deadline = Deadline::after(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let err = pipeline(dir.path(), source, Vec::new())
        .run_once(&req)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunFailure::DeadlineExceeded {
            stage: RunState::Resolving
        }
    ));
    assert!(err.to_string().contains("deadline exceeded"));
}

#[tokio::test]
async fn fixture_runs_write_reports_and_trends() {
    let dir = tempdir().unwrap();
    let config = WatchConfig::rooted_at(dir.path());
    let watch = WatchList::from_ids(["455682", "015010", "145012", "999999"]).unwrap();

    let mut req = RunRequest::from_config(&config, watch.clone());
    req.include_trends = true;

    let first = pipeline(dir.path(), Arc::new(FixtureSnapshotSource::new(fixture("sample"))), Vec::new())
        .run_once(&req)
        .await
        .unwrap();
    assert_eq!(first.counts.entities_processed, 3);
    assert_eq!(first.counts.unwatched_rows, 2);
    assert!(first.raw_artifact.as_deref().is_some_and(|p| p.ends_with(".csv")));
    assert!(first
        .warnings
        .iter()
        .any(|w| w == "watched entity 999999 is not in the snapshot"));

    let second = pipeline(dir.path(), Arc::new(FixtureSnapshotSource::new(fixture("next"))), Vec::new())
        .run_once(&req)
        .await
        .unwrap();
    assert_eq!(second.as_of, date(3));
    assert_eq!(second.counts.rejected_rows, 1);
    assert_eq!(second.rejected[0].raw_entity_id.as_deref(), Some("145012"));

    let summary: Vec<_> = second
        .changes
        .iter()
        .map(|c| (c.entity_id.as_str(), c.metric.as_str(), c.direction))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("015010", "overall", Direction::Down),
            ("015010", "quality_measures", Direction::Down),
            ("455682", "overall", Direction::Up),
        ]
    );

    let staffing = second
        .trends
        .iter()
        .find(|t| t.entity_id.as_str() == "455682" && t.metric.as_str() == "staffing")
        .unwrap();
    assert_eq!(staffing.count, 2);
    assert_eq!(staffing.rated_count, 1);
    assert_eq!(staffing.current, RatingValue::Rated(3));

    let run_dir = PathBuf::from(second.reports_dir.as_deref().unwrap());
    assert!(run_dir.join("run_report.json").is_file());
    assert!(run_dir.join("run_brief.md").is_file());
    let manifest: serde_json::Value = serde_json::from_slice(
        &std::fs::read(run_dir.join("snapshots/manifest.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["files"].as_array().unwrap().len(), 2);
    assert_eq!(manifest["files"][0]["path"], "snapshots/changes.parquet");

    let brief = std::fs::read_to_string(run_dir.join("run_brief.md")).unwrap();
    assert!(brief.contains("SUNNY ACRES CARE CENTER (CCN 455682) - AUSTIN, TX: Overall: 3→4 ↑"));

    let listing = report_runs_markdown(&config.reports_dir, 5).unwrap();
    assert_eq!(listing.matches("## Run `").count(), 2);
    let newest = listing.find(&second.run_id.to_string()).unwrap();
    let oldest = listing.find(&first.run_id.to_string()).unwrap();
    assert!(newest < oldest);

    let trends = trends_from_history(
        &config.history_path,
        &WatchList::from_ids(["455682"]).unwrap(),
        &[MetricKey::new("overall")],
        chrono::Duration::days(90),
        None,
    )
    .unwrap();
    assert_eq!(trends.len(), 1);
    assert_eq!(trends[0].mean, Some(3.5));
    assert_eq!(trends[0].window.end, date(3));
}
