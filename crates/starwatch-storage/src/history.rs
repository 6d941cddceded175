//! Append-biased rating history persisted as one flat CSV file.
//!
//! Rows are keyed by `(entity_id, as_of)`; merging upserts on that key. Columns are
//! `entity_id, as_of, ingested_at`, the facility attributes, then one column per tracked
//! metric (sorted). An empty metric cell means the metric was not part of that snapshot;
//! `not_rated` is the explicit unrated marker.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use starwatch_core::{EntityAttributes, EntityId, HistoryEntry, MetricKey, RatingValue, Record};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const COL_ENTITY_ID: &str = "entity_id";
const COL_AS_OF: &str = "as_of";
const COL_INGESTED_AT: &str = "ingested_at";
const COL_NAME: &str = "name";
const COL_CITY: &str = "city";
const COL_STATE: &str = "state";
const COL_OWNERSHIP: &str = "ownership_type";
const COL_BEDS: &str = "bed_count";

pub const FIXED_COLUMNS: [&str; 8] = [
    COL_ENTITY_ID,
    COL_AS_OF,
    COL_INGESTED_AT,
    COL_NAME,
    COL_CITY,
    COL_STATE,
    COL_OWNERSHIP,
    COL_BEDS,
];

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("history I/O failed at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("history CSV error at {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("history file {} is unreadable: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error(
        "history store is locked by another run (lock file {}, holder: {holder}); \
         if that process is no longer running, delete the lock file and retry",
        .lock_path.display()
    )]
    Contention { lock_path: PathBuf, holder: String },
    #[error("history store at {} was opened read-only", .0.display())]
    ReadOnly(PathBuf),
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Exclusive write access to a history file, held through a `create_new` lock file
/// that is removed on drop.
#[derive(Debug)]
pub struct HistoryLock {
    path: PathBuf,
}

impl HistoryLock {
    pub fn lock_path_for(history_path: &Path) -> PathBuf {
        let mut name = OsString::from(history_path.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }

    pub fn acquire(history_path: &Path) -> Result<Self, PersistenceError> {
        let path = Self::lock_path_for(history_path);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(PersistenceError::Contention {
                    lock_path: path,
                    holder,
                });
            }
            Err(err) => return Err(PersistenceError::io(&path, err)),
        };
        writeln!(
            file,
            "pid={} acquired_at={}",
            std::process::id(),
            Utc::now().to_rfc3339()
        )
        .map_err(|err| PersistenceError::io(&path, err))?;
        debug!(lock = %path.display(), "history lock acquired");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HistoryLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %err, "failed to remove history lock");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MergeCounts {
    pub inserted: usize,
    pub overwritten: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub counts: MergeCounts,
    /// Entities whose stored entry was inserted or overwritten by this merge.
    pub touched: BTreeSet<EntityId>,
}

#[derive(Debug)]
struct Backing {
    path: PathBuf,
    lock: Option<HistoryLock>,
}

type EntityHistory = BTreeMap<NaiveDate, HistoryEntry>;

/// A stored row that did not parse. Its cells are written back verbatim on every
/// rewrite until a valid entry for the same key replaces it.
#[derive(Debug, Clone)]
struct PreservedRow {
    key: Option<(EntityId, NaiveDate)>,
    cells: BTreeMap<String, String>,
}

impl PreservedRow {
    fn superseded_by(&self, entries: &BTreeMap<EntityId, EntityHistory>) -> bool {
        self.key.as_ref().is_some_and(|(id, as_of)| {
            entries
                .get(id)
                .is_some_and(|by_date| by_date.contains_key(as_of))
        })
    }
}

#[derive(Debug, Default)]
struct LoadedHistory {
    entries: BTreeMap<EntityId, EntityHistory>,
    preserved: Vec<PreservedRow>,
    unreadable: usize,
}

#[derive(Debug, Default)]
pub struct HistoryStore {
    backing: Option<Backing>,
    entries: BTreeMap<EntityId, EntityHistory>,
    preserved: Vec<PreservedRow>,
    unreadable: usize,
}

impl HistoryStore {
    /// Store with no file behind it.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Lock the history file for writing, then load it. A missing file is an empty history.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| PersistenceError::io(parent, err))?;
        }
        let lock = HistoryLock::acquire(&path)?;
        let loaded = load_entries(&path)?;
        Ok(Self {
            backing: Some(Backing {
                path,
                lock: Some(lock),
            }),
            entries: loaded.entries,
            preserved: loaded.preserved,
            unreadable: loaded.unreadable,
        })
    }

    /// Load without taking the lock; `merge` is refused.
    pub fn open_read_only(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let loaded = load_entries(&path)?;
        Ok(Self {
            backing: Some(Backing { path, lock: None }),
            entries: loaded.entries,
            preserved: loaded.preserved,
            unreadable: loaded.unreadable,
        })
    }

    /// Keep the loaded entries but drop the file behind them; later merges stay in memory.
    pub fn detached(mut self) -> Self {
        self.backing = None;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.backing.as_ref().map(|b| b.path.as_path())
    }

    /// Rows left out of the loaded history because they could not be parsed.
    pub fn skipped_rows(&self) -> usize {
        self.preserved.len() + self.unreadable
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.entries.keys()
    }

    pub fn metric_keys(&self) -> BTreeSet<MetricKey> {
        self.entries()
            .flat_map(|entry| entry.record.metrics.keys().cloned())
            .collect()
    }

    /// Every entry, ordered by entity then `as_of`.
    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.values().flat_map(BTreeMap::values)
    }

    /// Upsert records keyed by `(entity_id, as_of)` and persist. A record equal to the
    /// stored one keeps its original provenance, so re-merging is a no-op on disk.
    /// Rows that failed to parse on load are written back unchanged; a file holding rows
    /// that are not even CSV records is refused rather than rewritten.
    pub fn merge(
        &mut self,
        records: impl IntoIterator<Item = Record>,
        ingested_at: DateTime<Utc>,
    ) -> Result<MergeReport, PersistenceError> {
        if let Some(backing) = &self.backing {
            if backing.lock.is_none() {
                return Err(PersistenceError::ReadOnly(backing.path.clone()));
            }
            if self.unreadable > 0 {
                return Err(PersistenceError::Corrupt {
                    path: backing.path.clone(),
                    reason: format!(
                        "{} row(s) are not valid CSV records; repair them before merging",
                        self.unreadable
                    ),
                });
            }
        }

        let mut next = self.entries.clone();
        let mut report = MergeReport::default();
        for record in records {
            let by_date = next.entry(record.entity_id.clone()).or_default();
            match by_date.get(&record.as_of) {
                Some(existing) if existing.record == record => {
                    report.counts.unchanged += 1;
                    continue;
                }
                Some(_) => report.counts.overwritten += 1,
                None => report.counts.inserted += 1,
            }
            report.touched.insert(record.entity_id.clone());
            by_date.insert(
                record.as_of,
                HistoryEntry {
                    record,
                    ingested_at,
                },
            );
        }

        if !report.touched.is_empty() {
            let preserved: Vec<PreservedRow> = self
                .preserved
                .iter()
                .filter(|row| !row.superseded_by(&next))
                .cloned()
                .collect();
            if preserved.len() < self.preserved.len() {
                info!(
                    replaced = self.preserved.len() - preserved.len(),
                    "merged entries replace unparseable history rows"
                );
            }
            if let Some(backing) = &self.backing {
                write_entries(&backing.path, &next, &preserved)?;
            }
            self.entries = next;
            self.preserved = preserved;
        }
        info!(
            inserted = report.counts.inserted,
            overwritten = report.counts.overwritten,
            unchanged = report.counts.unchanged,
            "history merge complete"
        );
        Ok(report)
    }

    /// The two most recent entries for an entity, newest first.
    pub fn latest_two(&self, id: &EntityId) -> (Option<&HistoryEntry>, Option<&HistoryEntry>) {
        let Some(by_date) = self.entries.get(id) else {
            return (None, None);
        };
        let mut newest_first = by_date.values().rev();
        (newest_first.next(), newest_first.next())
    }

    pub fn latest(&self, id: &EntityId) -> Option<&HistoryEntry> {
        self.latest_two(id).0
    }

    /// Entries in the trailing window ending today (UTC), ascending by `as_of`.
    pub fn windowed(&self, id: &EntityId, window: chrono::Duration) -> Vec<&HistoryEntry> {
        self.windowed_ending(id, window, Utc::now().date_naive())
    }

    /// Entries with `end - window <= as_of <= end`, ascending by `as_of`.
    pub fn windowed_ending(
        &self,
        id: &EntityId,
        window: chrono::Duration,
        end: NaiveDate,
    ) -> Vec<&HistoryEntry> {
        let Some(by_date) = self.entries.get(id) else {
            return Vec::new();
        };
        if window < chrono::Duration::zero() {
            return Vec::new();
        }
        let start = end.checked_sub_signed(window).unwrap_or(NaiveDate::MIN);
        by_date.range(start..=end).map(|(_, entry)| entry).collect()
    }
}

fn load_entries(path: &Path) -> Result<LoadedHistory, PersistenceError> {
    let mut loaded = LoadedHistory::default();
    if !path.exists() {
        info!(path = %path.display(), "no history file yet; starting empty");
        return Ok(loaded);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|err| PersistenceError::csv(path, err))?;
    let headers = reader
        .headers()
        .map_err(|err| PersistenceError::csv(path, err))?
        .clone();
    let columns = HistoryColumns::from_headers(&headers).ok_or_else(|| PersistenceError::Corrupt {
        path: path.to_path_buf(),
        reason: format!(
            "header must include {COL_ENTITY_ID}, {COL_AS_OF} and {COL_INGESTED_AT}"
        ),
    })?;

    for (index, row) in reader.records().enumerate() {
        let row_number = index + 1;
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                loaded.unreadable += 1;
                warn!(path = %path.display(), row = row_number, error = %err, "unreadable history row");
                continue;
            }
        };
        match columns.parse_row(&row) {
            Ok(entry) => {
                loaded
                    .entries
                    .entry(entry.record.entity_id.clone())
                    .or_default()
                    .insert(entry.record.as_of, entry);
            }
            Err(reason) => {
                warn!(path = %path.display(), row = row_number, %reason, "skipping corrupt history row");
                loaded.preserved.push(PreservedRow {
                    key: columns.row_key(&row),
                    cells: headers
                        .iter()
                        .map(str::trim)
                        .zip(row.iter())
                        .filter(|(header, _)| !header.is_empty())
                        .map(|(header, cell)| (column_name(header), cell.to_string()))
                        .collect(),
                });
            }
        }
    }

    info!(
        path = %path.display(),
        entities = loaded.entries.len(),
        skipped = loaded.preserved.len() + loaded.unreadable,
        "history loaded"
    );
    Ok(loaded)
}

/// Fixed columns keep their name; anything else is a metric column in key form.
fn column_name(header: &str) -> String {
    if FIXED_COLUMNS.contains(&header) {
        header.to_string()
    } else {
        MetricKey::new(header).as_str().to_string()
    }
}

struct HistoryColumns {
    positions: BTreeMap<&'static str, usize>,
    metrics: Vec<(MetricKey, usize)>,
}

impl HistoryColumns {
    fn from_headers(headers: &csv::StringRecord) -> Option<Self> {
        let mut positions = BTreeMap::new();
        let mut metrics = Vec::new();
        for (idx, header) in headers.iter().enumerate() {
            let header = header.trim();
            match FIXED_COLUMNS.iter().find(|c| **c == header) {
                Some(fixed) => {
                    positions.insert(*fixed, idx);
                }
                None if !header.is_empty() => metrics.push((MetricKey::new(header), idx)),
                None => {}
            }
        }
        let required = [COL_ENTITY_ID, COL_AS_OF, COL_INGESTED_AT];
        required
            .iter()
            .all(|c| positions.contains_key(c))
            .then_some(Self { positions, metrics })
    }

    fn cell<'r>(&self, row: &'r csv::StringRecord, column: &str) -> Option<&'r str> {
        self.positions
            .get(column)
            .and_then(|idx| row.get(*idx))
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn row_key(&self, row: &csv::StringRecord) -> Option<(EntityId, NaiveDate)> {
        let entity_id = EntityId::parse(self.cell(row, COL_ENTITY_ID)?).ok()?;
        let as_of = NaiveDate::parse_from_str(self.cell(row, COL_AS_OF)?, "%Y-%m-%d").ok()?;
        Some((entity_id, as_of))
    }

    fn parse_row(&self, row: &csv::StringRecord) -> Result<HistoryEntry, String> {
        let raw_id = self.cell(row, COL_ENTITY_ID).ok_or("missing entity_id")?;
        let entity_id = EntityId::parse(raw_id).map_err(|e| e.to_string())?;
        let as_of = self
            .cell(row, COL_AS_OF)
            .ok_or("missing as_of")
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| "invalid as_of"))?;
        let ingested_at = self
            .cell(row, COL_INGESTED_AT)
            .ok_or("missing ingested_at")
            .and_then(|s| DateTime::parse_from_rfc3339(s).map_err(|_| "invalid ingested_at"))?
            .with_timezone(&Utc);
        let bed_count = match self.cell(row, COL_BEDS) {
            Some(s) => Some(s.parse::<u32>().map_err(|_| format!("invalid bed_count {s:?}"))?),
            None => None,
        };

        let mut metrics = BTreeMap::new();
        for (key, idx) in &self.metrics {
            let Some(cell) = row.get(*idx).map(str::trim).filter(|s| !s.is_empty()) else {
                continue;
            };
            let value = cell
                .parse::<RatingValue>()
                .map_err(|e| format!("{key}: {e}"))?;
            metrics.insert(key.clone(), value);
        }

        let text = |column: &str| self.cell(row, column).map(ToString::to_string);
        Ok(HistoryEntry {
            record: Record {
                entity_id,
                as_of,
                attributes: EntityAttributes {
                    name: text(COL_NAME),
                    city: text(COL_CITY),
                    state: text(COL_STATE),
                    ownership_type: text(COL_OWNERSHIP),
                    bed_count,
                },
                metrics,
            },
            ingested_at,
        })
    }
}

/// Rewrite the whole history through a temp file and an atomic rename. Preserved rows
/// follow the parsed entries.
fn write_entries(
    path: &Path,
    entries: &BTreeMap<EntityId, EntityHistory>,
    preserved: &[PreservedRow],
) -> Result<(), PersistenceError> {
    let metric_columns: BTreeSet<MetricKey> = entries
        .values()
        .flat_map(BTreeMap::values)
        .flat_map(|e| e.record.metrics.keys().cloned())
        .chain(
            preserved
                .iter()
                .flat_map(|row| row.cells.keys())
                .filter(|header| !FIXED_COLUMNS.contains(&header.as_str()))
                .map(MetricKey::new),
        )
        .collect();

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".history.{}.partial", Uuid::new_v4()));

    let result = (|| -> Result<(), PersistenceError> {
        let mut writer =
            csv::Writer::from_path(&temp_path).map_err(|err| PersistenceError::csv(&temp_path, err))?;
        let header = FIXED_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(metric_columns.iter().map(|m| m.as_str().to_string()));
        writer
            .write_record(header)
            .map_err(|err| PersistenceError::csv(&temp_path, err))?;

        for entry in entries.values().flat_map(BTreeMap::values) {
            let record = &entry.record;
            let attrs = &record.attributes;
            let opt = |v: &Option<String>| v.clone().unwrap_or_default();
            let mut row = vec![
                record.entity_id.to_string(),
                record.as_of.format("%Y-%m-%d").to_string(),
                entry.ingested_at.to_rfc3339(),
                opt(&attrs.name),
                opt(&attrs.city),
                opt(&attrs.state),
                opt(&attrs.ownership_type),
                attrs.bed_count.map(|b| b.to_string()).unwrap_or_default(),
            ];
            row.extend(metric_columns.iter().map(|key| {
                record
                    .metrics
                    .get(key)
                    .map(ToString::to_string)
                    .unwrap_or_default()
            }));
            writer
                .write_record(&row)
                .map_err(|err| PersistenceError::csv(&temp_path, err))?;
        }
        for kept in preserved {
            let row = FIXED_COLUMNS
                .iter()
                .copied()
                .chain(metric_columns.iter().map(MetricKey::as_str))
                .map(|column| kept.cells.get(column).map(String::as_str).unwrap_or_default());
            writer
                .write_record(row)
                .map_err(|err| PersistenceError::csv(&temp_path, err))?;
        }
        writer
            .flush()
            .map_err(|err| PersistenceError::io(&temp_path, err))?;
        drop(writer);
        fs::rename(&temp_path, path).map_err(|err| PersistenceError::io(path, err))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}
