//! Field mapping table and the normalizer that turns a raw CSV snapshot into records.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Context;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use starwatch_core::{
    EntityAttributes, EntityId, MetricKey, RatingScale, RatingValue, Record, RejectedRow,
};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{info, warn};

use crate::RawSnapshot;

/// Mapping for the CMS provider-info dataset, compiled in as the default.
pub const PROVIDER_INFO_MAPPING_YAML: &str =
    include_str!("../../../config/mappings/provider_info.v1.yaml");

/// One header name, or several accepted aliases in preference order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnSpec {
    One(String),
    Any(Vec<String>),
}

impl ColumnSpec {
    pub fn candidates(&self) -> Vec<&str> {
        match self {
            Self::One(name) => vec![name.as_str()],
            Self::Any(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeColumns {
    pub name: Option<ColumnSpec>,
    pub city: Option<ColumnSpec>,
    pub state: Option<ColumnSpec>,
    pub ownership_type: Option<ColumnSpec>,
    pub bed_count: Option<ColumnSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricColumn {
    pub key: MetricKey,
    pub column: ColumnSpec,
}

/// Versioned description of how upstream headers map onto the record schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub version: u32,
    pub dataset: String,
    pub entity_id: ColumnSpec,
    #[serde(default)]
    pub attributes: AttributeColumns,
    pub metrics: Vec<MetricColumn>,
    #[serde(default)]
    pub rating_scale: RatingScale,
    #[serde(default = "default_not_rated_tokens")]
    pub not_rated_tokens: Vec<String>,
}

fn default_not_rated_tokens() -> Vec<String> {
    vec![String::new(), "Not Available".to_string()]
}

impl FieldMapping {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let mapping: Self = serde_yaml::from_str(text).context("parsing field mapping")?;
        anyhow::ensure!(
            !mapping.metrics.is_empty(),
            "field mapping {} v{} declares no metrics",
            mapping.dataset,
            mapping.version
        );
        Ok(mapping)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn provider_info() -> anyhow::Result<Self> {
        Self::from_yaml_str(PROVIDER_INFO_MAPPING_YAML)
    }

    pub fn metric_keys(&self) -> Vec<MetricKey> {
        self.metrics.iter().map(|m| m.key.clone()).collect()
    }

    fn is_not_rated(&self, raw: &str) -> bool {
        self.not_rated_tokens
            .iter()
            .any(|token| token.trim().eq_ignore_ascii_case(raw))
    }

    /// Parse a rating cell: an integer on the scale or a not-rated token.
    pub fn parse_rating(&self, raw: &str) -> Result<RatingValue, String> {
        let raw = raw.trim();
        if self.is_not_rated(raw) {
            return Ok(RatingValue::NotRated);
        }
        let whole = parse_whole_number(raw).ok_or_else(|| format!("unparseable rating {raw:?}"))?;
        self.rating_scale.rated(whole).map_err(|e| e.to_string())
    }
}

/// Integers, tolerating the `4.0` form spreadsheet exports produce.
fn parse_whole_number(raw: &str) -> Option<i64> {
    if let Ok(value) = raw.parse::<i64>() {
        return Some(value);
    }
    let value = raw.parse::<f64>().ok()?;
    (value.is_finite() && value.fract() == 0.0).then_some(value as i64)
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("snapshot has no header row")]
    NoHeader,
    #[error("snapshot header is unreadable: {0}")]
    UnreadableHeader(#[source] csv::Error),
    #[error(
        "snapshot has no entity id column (expected one of {expected:?}; closest header: {})",
        .closest.as_deref().unwrap_or("none")
    )]
    MissingEntityColumn {
        expected: Vec<String>,
        closest: Option<String>,
    },
}

/// Result of normalizing one raw snapshot.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub records: Vec<Record>,
    pub rejected: Vec<RejectedRow>,
    /// Valid rows for entities outside the watch list.
    pub unwatched_rows: usize,
    /// Mapped metrics with no matching header in this snapshot.
    pub missing_metrics: Vec<MetricKey>,
}

fn canonical_header(header: &str) -> String {
    header.trim_start_matches('\u{feff}').trim().to_ascii_lowercase()
}

struct ResolvedColumns {
    entity_id: usize,
    name: Option<usize>,
    city: Option<usize>,
    state: Option<usize>,
    ownership_type: Option<usize>,
    bed_count: Option<usize>,
    metrics: Vec<(MetricKey, usize)>,
}

fn find_column(headers: &[String], spec: &ColumnSpec) -> Option<usize> {
    spec.candidates().into_iter().find_map(|candidate| {
        let wanted = canonical_header(candidate);
        headers.iter().position(|h| *h == wanted)
    })
}

fn closest_header(headers: &[String], spec: &ColumnSpec) -> Option<String> {
    spec.candidates()
        .into_iter()
        .flat_map(|candidate| {
            let wanted = canonical_header(candidate);
            headers
                .iter()
                .map(move |h| (jaro_winkler(&wanted, h), h.clone()))
        })
        .filter(|(score, _)| *score >= 0.8)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, header)| header)
}

impl ResolvedColumns {
    fn resolve(
        headers: &[String],
        mapping: &FieldMapping,
        missing_metrics: &mut Vec<MetricKey>,
    ) -> Result<Self, NormalizeError> {
        let entity_id = find_column(headers, &mapping.entity_id).ok_or_else(|| {
            NormalizeError::MissingEntityColumn {
                expected: mapping
                    .entity_id
                    .candidates()
                    .into_iter()
                    .map(ToString::to_string)
                    .collect(),
                closest: closest_header(headers, &mapping.entity_id),
            }
        })?;

        let attr = |spec: &Option<ColumnSpec>| spec.as_ref().and_then(|s| find_column(headers, s));
        let mut metrics = Vec::with_capacity(mapping.metrics.len());
        for metric in &mapping.metrics {
            match find_column(headers, &metric.column) {
                Some(idx) => metrics.push((metric.key.clone(), idx)),
                None => {
                    warn!(
                        metric = %metric.key,
                        expected = ?metric.column.candidates(),
                        closest = ?closest_header(headers, &metric.column),
                        "mapped metric column not found in snapshot header"
                    );
                    missing_metrics.push(metric.key.clone());
                }
            }
        }

        Ok(Self {
            entity_id,
            name: attr(&mapping.attributes.name),
            city: attr(&mapping.attributes.city),
            state: attr(&mapping.attributes.state),
            ownership_type: attr(&mapping.attributes.ownership_type),
            bed_count: attr(&mapping.attributes.bed_count),
            metrics,
        })
    }
}

fn text_cell(row: &csv::StringRecord, idx: Option<usize>) -> Option<String> {
    idx.and_then(|i| row.get(i))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn parse_row(
    row: &csv::StringRecord,
    columns: &ResolvedColumns,
    mapping: &FieldMapping,
    as_of: NaiveDate,
) -> Result<Record, String> {
    let raw_id = row.get(columns.entity_id).unwrap_or_default();
    let entity_id = EntityId::parse(raw_id).map_err(|e| e.to_string())?;

    let bed_count = match text_cell(row, columns.bed_count) {
        Some(raw) => Some(
            parse_whole_number(&raw)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| format!("invalid bed count {raw:?}"))?,
        ),
        None => None,
    };

    let mut metrics = BTreeMap::new();
    for (key, idx) in &columns.metrics {
        let raw = row.get(*idx).unwrap_or_default();
        let value = mapping
            .parse_rating(raw)
            .map_err(|reason| format!("{key}: {reason}"))?;
        metrics.insert(key.clone(), value);
    }

    Ok(Record {
        entity_id,
        as_of,
        attributes: EntityAttributes {
            name: text_cell(row, columns.name),
            city: text_cell(row, columns.city),
            state: text_cell(row, columns.state),
            ownership_type: text_cell(row, columns.ownership_type),
            bed_count,
        },
        metrics,
    })
}

/// Normalize every data row of `raw`. Bad rows land in `rejected`; only an unreadable
/// table (no header, no entity id column) is an error. When `watch` is given, rows for
/// other entities are counted but not returned.
pub fn normalize(
    raw: &RawSnapshot,
    mapping: &FieldMapping,
    watch: Option<&BTreeSet<EntityId>>,
) -> Result<NormalizedBatch, NormalizeError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(raw.body.as_slice());
    let headers: Vec<String> = reader
        .headers()
        .map_err(NormalizeError::UnreadableHeader)?
        .iter()
        .map(canonical_header)
        .collect();
    if headers.iter().all(String::is_empty) {
        return Err(NormalizeError::NoHeader);
    }

    let mut batch = NormalizedBatch::default();
    let columns = ResolvedColumns::resolve(&headers, mapping, &mut batch.missing_metrics)?;
    let mut seen: BTreeSet<EntityId> = BTreeSet::new();

    for (index, row) in reader.records().enumerate() {
        let row_number = index + 1;
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                reject(&mut batch, row_number, None, format!("malformed row: {err}"));
                continue;
            }
        };
        let raw_id = text_cell(&row, Some(columns.entity_id));
        match parse_row(&row, &columns, mapping, raw.published_on) {
            Ok(record) => {
                if watch.is_some_and(|w| !w.contains(&record.entity_id)) {
                    batch.unwatched_rows += 1;
                    continue;
                }
                if !seen.insert(record.entity_id.clone()) {
                    reject(
                        &mut batch,
                        row_number,
                        raw_id,
                        "duplicate entity id in snapshot".to_string(),
                    );
                    continue;
                }
                batch.records.push(record);
            }
            Err(reason) => {
                let unwatched = raw_id
                    .as_deref()
                    .and_then(|id| EntityId::parse(id).ok())
                    .zip(watch)
                    .is_some_and(|(id, w)| !w.contains(&id));
                if unwatched {
                    batch.unwatched_rows += 1;
                    continue;
                }
                reject(&mut batch, row_number, raw_id, reason);
            }
        }
    }

    info!(
        source = %raw.source_id,
        as_of = %raw.published_on,
        records = batch.records.len(),
        rejected = batch.rejected.len(),
        unwatched = batch.unwatched_rows,
        "snapshot normalized"
    );
    Ok(batch)
}

fn reject(batch: &mut NormalizedBatch, row_number: usize, raw_id: Option<String>, reason: String) {
    warn!(row = row_number, entity_id = ?raw_id, %reason, "rejecting snapshot row");
    batch.rejected.push(RejectedRow {
        row_number,
        raw_entity_id: raw_id,
        reason,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const HEADER: &str = "CMS Certification Number (CCN),Provider Name,City/Town,State,Ownership Type,Number of Certified Beds,Overall Rating,Health Inspection Rating,QM Rating,Staffing Rating";

    fn snapshot(body: String) -> RawSnapshot {
        RawSnapshot {
            source_id: "test".to_string(),
            location: "memory://test.csv".to_string(),
            published_on: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            fetched_at: Utc::now(),
            content_type: Some("text/csv".to_string()),
            body: body.into_bytes(),
        }
    }

    fn mapping() -> FieldMapping {
        FieldMapping::provider_info().expect("builtin mapping parses")
    }

    #[test]
    fn builtin_mapping_tracks_four_star_ratings() {
        let keys = mapping().metric_keys();
        assert_eq!(
            keys,
            vec![
                MetricKey::new("overall"),
                MetricKey::new("health_inspection"),
                MetricKey::new("quality_measures"),
                MetricKey::new("staffing"),
            ]
        );
    }

    #[test]
    fn one_malformed_row_does_not_sink_the_batch() {
        let mut body = format!("{HEADER}\n");
        for i in 0..99 {
            body.push_str(&format!("{:06},Home {i},Austin,TX,Non profit,100,4,3,5,2\n", 100000 + i));
        }
        body.push_str("999999,Broken Home,Austin,TX,Non profit,100,seven,3,5,2\n");

        let batch = normalize(&snapshot(body), &mapping(), None).unwrap();
        assert_eq!(batch.records.len(), 99);
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].row_number, 100);
        assert_eq!(batch.rejected[0].raw_entity_id.as_deref(), Some("999999"));
        assert!(batch.rejected[0].reason.contains("overall"));
    }

    #[test]
    fn ratings_parse_to_bounded_values_or_not_rated() {
        let body = format!(
            "{HEADER}\n\
             455682,Sunny Acres,Austin,TX,For profit,120,4.0,Not Available,,1\n\
             675791,Out Of Range,Dallas,TX,For profit,80,6,3,3,3\n"
        );
        let batch = normalize(&snapshot(body), &mapping(), None).unwrap();

        assert_eq!(batch.records.len(), 1);
        let record = &batch.records[0];
        assert_eq!(record.entity_id.as_str(), "455682");
        assert_eq!(record.as_of, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(record.attributes.bed_count, Some(120));
        assert_eq!(record.metrics[&MetricKey::new("overall")], RatingValue::Rated(4));
        assert_eq!(
            record.metrics[&MetricKey::new("health_inspection")],
            RatingValue::NotRated
        );
        assert_eq!(
            record.metrics[&MetricKey::new("quality_measures")],
            RatingValue::NotRated
        );
        assert_eq!(batch.rejected.len(), 1);
        assert!(batch.rejected[0].reason.contains("outside"));
    }

    #[test]
    fn rows_without_entity_id_are_rejected() {
        let body = format!("{HEADER}\n,Nameless,Austin,TX,For profit,10,3,3,3,3\n");
        let batch = normalize(&snapshot(body), &mapping(), None).unwrap();
        assert!(batch.records.is_empty());
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].raw_entity_id, None);
    }

    #[test]
    fn watch_list_filters_without_rejecting() {
        let body = format!(
            "{HEADER}\n\
             455682,Sunny Acres,Austin,TX,For profit,120,4,3,3,3\n\
             675791,Other,Dallas,TX,For profit,80,bad,3,3,3\n\
             676336,Third,Waco,TX,For profit,80,2,3,3,3\n"
        );
        let watch = BTreeSet::from([EntityId::parse("455682").unwrap()]);
        let batch = normalize(&snapshot(body), &mapping(), Some(&watch)).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert!(batch.rejected.is_empty());
        assert_eq!(batch.unwatched_rows, 2);
    }

    #[test]
    fn duplicate_entities_keep_the_first_row() {
        let body = format!(
            "{HEADER}\n\
             455682,Sunny Acres,Austin,TX,For profit,120,4,3,3,3\n\
             455682.0,Sunny Acres Dup,Austin,TX,For profit,120,1,3,3,3\n"
        );
        let batch = normalize(&snapshot(body), &mapping(), None).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].metrics[&MetricKey::new("overall")], RatingValue::Rated(4));
        assert_eq!(batch.rejected.len(), 1);
    }

    #[test]
    fn header_aliases_and_missing_metrics_are_tolerated() {
        let body = "\u{feff}Federal Provider Number,provider_name,overall_rating\n55682,Sunny,3\n"
            .to_string();
        let batch = normalize(&snapshot(body), &mapping(), None).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].entity_id.as_str(), "055682");
        assert_eq!(batch.records[0].metrics.len(), 1);
        assert_eq!(batch.missing_metrics.len(), 3);
    }

    #[test]
    fn table_without_entity_column_is_fatal() {
        let body = "CMS Certification Num,Overall Rating\n455682,4\n".to_string();
        match normalize(&snapshot(body), &mapping(), None) {
            Err(NormalizeError::MissingEntityColumn { closest, .. }) => {
                assert_eq!(closest.as_deref(), Some("cms certification num"));
            }
            other => panic!("expected missing entity column, got {other:?}"),
        }
    }

    #[test]
    fn empty_body_is_fatal() {
        assert!(matches!(
            normalize(&snapshot(String::new()), &mapping(), None),
            Err(NormalizeError::NoHeader)
        ));
    }
}
