//! Core domain model for starwatch: entity identity, rating values, snapshot records,
//! change events, trend summaries, and notification outcomes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "starwatch-core";

/// Width of a CMS Certification Number once zero-padded.
pub const ENTITY_ID_WIDTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityIdError {
    #[error("entity id is empty")]
    Empty,
    #[error("entity id {0:?} contains characters other than ASCII letters and digits")]
    InvalidCharacters(String),
    #[error("entity id {0:?} is longer than 6 characters")]
    TooLong(String),
}

/// Stable facility identifier (CCN), normalized so the same facility always maps to the same id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    /// Normalize a raw identifier: trims whitespace and quotes, drops a trailing `.0`
    /// left behind by spreadsheet exports, uppercases, and left-pads with zeros.
    pub fn parse(raw: &str) -> Result<Self, EntityIdError> {
        let mut value = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        if let Some(stripped) = value.strip_suffix(".0") {
            if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
                value = stripped;
            }
        }
        if value.is_empty() {
            return Err(EntityIdError::Empty);
        }
        if !value.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(EntityIdError::InvalidCharacters(value.to_string()));
        }
        if value.len() > ENTITY_ID_WIDTH {
            return Err(EntityIdError::TooLong(value.to_string()));
        }
        Ok(Self(format!(
            "{:0>width$}",
            value.to_ascii_uppercase(),
            width = ENTITY_ID_WIDTH
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EntityId {
    type Error = EntityIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EntityId> for String {
    fn from(value: EntityId) -> Self {
        value.0
    }
}

/// Name of a tracked rating dimension, e.g. `overall` or `staffing`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricKey(String);

impl MetricKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Human label derived from the key: `quality_measures` -> `Quality Measures`.
    pub fn label(&self) -> String {
        self.0
            .split('_')
            .filter(|part| !part.is_empty())
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inclusive bounds a numeric rating must fall within.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingScale {
    pub min: u8,
    pub max: u8,
}

impl Default for RatingScale {
    fn default() -> Self {
        Self { min: 1, max: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RatingError {
    #[error("rating {value} is outside the {min}..={max} scale")]
    OutOfRange { value: i64, min: u8, max: u8 },
    #[error("rating {0:?} is not an integer or a not-rated marker")]
    Unparseable(String),
}

impl RatingScale {
    pub fn rated(&self, value: i64) -> Result<RatingValue, RatingError> {
        if value < i64::from(self.min) || value > i64::from(self.max) {
            return Err(RatingError::OutOfRange {
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(RatingValue::Rated(value as u8))
    }
}

/// A bounded star rating or the explicit "not rated" marker; never silently absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingValue {
    Rated(u8),
    NotRated,
}

impl RatingValue {
    pub const NOT_RATED_TOKEN: &'static str = "not_rated";

    pub fn as_rated(&self) -> Option<u8> {
        match self {
            Self::Rated(v) => Some(*v),
            Self::NotRated => None,
        }
    }

    pub fn is_rated(&self) -> bool {
        matches!(self, Self::Rated(_))
    }
}

impl fmt::Display for RatingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rated(v) => write!(f, "{v}"),
            Self::NotRated => f.write_str(Self::NOT_RATED_TOKEN),
        }
    }
}

impl FromStr for RatingValue {
    type Err = RatingError;

    /// Parses the persisted form written by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == Self::NOT_RATED_TOKEN {
            return Ok(Self::NotRated);
        }
        s.parse::<u8>()
            .map(Self::Rated)
            .map_err(|_| RatingError::Unparseable(s.to_string()))
    }
}

/// Descriptive facility attributes carried alongside the metrics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityAttributes {
    pub name: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub ownership_type: Option<String>,
    pub bed_count: Option<u32>,
}

impl EntityAttributes {
    pub fn location(&self) -> Option<String> {
        match (self.city.as_deref(), self.state.as_deref()) {
            (Some(city), Some(state)) => Some(format!("{city}, {state}")),
            (Some(city), None) => Some(city.to_string()),
            (None, Some(state)) => Some(state.to_string()),
            (None, None) => None,
        }
    }
}

/// One entity's normalized row from a single snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub entity_id: EntityId,
    pub as_of: NaiveDate,
    pub attributes: EntityAttributes,
    pub metrics: BTreeMap<MetricKey, RatingValue>,
}

impl Record {
    /// Display label such as `SUNNY ACRES (CCN 455682) - Austin, TX`.
    pub fn label(&self) -> String {
        let name = self.attributes.name.as_deref().unwrap_or("Facility");
        match self.attributes.location() {
            Some(location) => format!("{name} (CCN {}) - {location}", self.entity_id),
            None => format!("{name} (CCN {})", self.entity_id),
        }
    }
}

/// A persisted record plus ingestion provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub record: Record,
    pub ingested_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn entity_id(&self) -> &EntityId {
        &self.record.entity_id
    }

    pub fn as_of(&self) -> NaiveDate {
        self.record.as_of
    }

    pub fn metric(&self, key: &MetricKey) -> Option<RatingValue> {
        self.record.metrics.get(key).copied()
    }
}

/// Row the normalizer could not turn into a `Record`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    /// 1-based data row number (header excluded).
    pub row_number: usize,
    pub raw_entity_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn between(previous: u8, current: u8) -> Option<Self> {
        match current.cmp(&previous) {
            std::cmp::Ordering::Greater => Some(Self::Up),
            std::cmp::Ordering::Less => Some(Self::Down),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn arrow(&self) -> &'static str {
        match self {
            Self::Up => "↑",
            Self::Down => "↓",
        }
    }
}

/// A single metric moving between two known ratings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub entity_id: EntityId,
    pub entity_label: String,
    pub metric: MetricKey,
    pub previous_value: u8,
    pub current_value: u8,
    pub direction: Direction,
    pub previous_as_of: NaiveDate,
    pub current_as_of: NaiveDate,
}

impl ChangeEvent {
    /// Deterministic id: the same entity, metric, and snapshot pair always yield the same id.
    pub fn deterministic_id(
        entity_id: &EntityId,
        metric: &MetricKey,
        previous_as_of: NaiveDate,
        current_as_of: NaiveDate,
    ) -> Uuid {
        let name = format!("starwatch:{entity_id}:{metric}:{previous_as_of}:{current_as_of}");
        Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
    }

    /// Short text like `Overall: 3→4 ↑`.
    pub fn summary(&self) -> String {
        format!(
            "{}: {}→{} {}",
            self.metric.label(),
            self.previous_value,
            self.current_value,
            self.direction.arrow()
        )
    }
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// `[end - length, end]`, clamped to the earliest representable date when the
    /// length reaches past it.
    pub fn trailing(end: NaiveDate, length: chrono::Duration) -> Self {
        Self {
            start: end.checked_sub_signed(length).unwrap_or(NaiveDate::MIN),
            end,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

/// Rolling statistics for one entity/metric. Unrated points count toward `count`
/// but are excluded from `min`, `max`, and `mean`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub entity_id: EntityId,
    pub metric: MetricKey,
    pub window: DateRange,
    pub count: usize,
    pub rated_count: usize,
    pub min: Option<u8>,
    pub max: Option<u8>,
    pub mean: Option<f64>,
    pub current: RatingValue,
    pub current_as_of: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Failed(String),
    Skipped(String),
}

impl DeliveryStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Failed(_) => "failed",
            Self::Skipped(_) => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationOutcome {
    pub channel: String,
    pub change_event_ids: Vec<Uuid>,
    pub status: DeliveryStatus,
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_ids_normalize_to_one_identity() {
        let expected = EntityId::parse("055682").unwrap();
        for raw in ["55682", " 055682 ", "\"55682\"", "55682.0", "055682"] {
            assert_eq!(EntityId::parse(raw).unwrap(), expected, "raw={raw:?}");
        }
        assert_eq!(EntityId::parse("45a12b").unwrap().as_str(), "45A12B");
    }

    #[test]
    fn entity_id_rejects_garbage() {
        assert_eq!(EntityId::parse("   "), Err(EntityIdError::Empty));
        assert!(matches!(
            EntityId::parse("45-5682"),
            Err(EntityIdError::InvalidCharacters(_))
        ));
        assert!(matches!(
            EntityId::parse("1234567"),
            Err(EntityIdError::TooLong(_))
        ));
    }

    #[test]
    fn rating_scale_bounds_values() {
        let scale = RatingScale::default();
        assert_eq!(scale.rated(4), Ok(RatingValue::Rated(4)));
        assert!(matches!(scale.rated(0), Err(RatingError::OutOfRange { .. })));
        assert!(matches!(scale.rated(6), Err(RatingError::OutOfRange { .. })));
    }

    #[test]
    fn rating_value_persisted_form_parses_back() {
        assert_eq!("3".parse::<RatingValue>(), Ok(RatingValue::Rated(3)));
        assert_eq!("not_rated".parse::<RatingValue>(), Ok(RatingValue::NotRated));
        assert!("three".parse::<RatingValue>().is_err());
        assert_eq!(RatingValue::NotRated.to_string(), "not_rated");
    }

    #[test]
    fn metric_labels_are_title_cased() {
        assert_eq!(MetricKey::new("quality_measures").label(), "Quality Measures");
        assert_eq!(MetricKey::new("Overall").as_str(), "overall");
    }

    #[test]
    fn change_event_ids_are_stable() {
        let id = EntityId::parse("455682").unwrap();
        let metric = MetricKey::new("overall");
        let prev = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let cur = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(
            ChangeEvent::deterministic_id(&id, &metric, prev, cur),
            ChangeEvent::deterministic_id(&id, &metric, prev, cur)
        );
        assert_ne!(
            ChangeEvent::deterministic_id(&id, &metric, prev, cur),
            ChangeEvent::deterministic_id(&id, &MetricKey::new("staffing"), prev, cur)
        );
    }

    #[test]
    fn entity_id_deserializes_with_normalization() {
        let id: EntityId = serde_json::from_str("\"55682\"").unwrap();
        assert_eq!(id.as_str(), "055682");
        assert!(serde_json::from_str::<EntityId>("\"\"").is_err());
    }

    #[test]
    fn direction_compares_numeric_ratings() {
        assert_eq!(Direction::between(3, 4), Some(Direction::Up));
        assert_eq!(Direction::between(4, 2), Some(Direction::Down));
        assert_eq!(Direction::between(3, 3), None);
    }

    #[test]
    fn trailing_range_clamps_instead_of_overflowing() {
        let end = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let range = DateRange::trailing(end, chrono::Duration::days(90));
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2023, 12, 3).unwrap());

        let huge = DateRange::trailing(end, chrono::Duration::days(i64::from(u32::MAX)));
        assert_eq!(huge.start, NaiveDate::MIN);
        assert!(huge.contains(NaiveDate::from_ymd_opt(1900, 1, 1).unwrap()));
    }
}
