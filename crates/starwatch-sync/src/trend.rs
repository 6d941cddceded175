//! Rolling per-metric summaries over a trailing window of history.

use chrono::{Duration, NaiveDate};
use starwatch_core::{DateRange, EntityId, MetricKey, TrendSummary};
use starwatch_storage::HistoryStore;

/// `None` when no entry in the window carries the metric; all-unrated windows still
/// produce a summary with empty statistics.
pub fn summarize(
    store: &HistoryStore,
    id: &EntityId,
    metric: &MetricKey,
    window: Duration,
    end: NaiveDate,
) -> Option<TrendSummary> {
    let points: Vec<_> = store
        .windowed_ending(id, window, end)
        .into_iter()
        .filter_map(|entry| entry.metric(metric).map(|value| (entry.as_of(), value)))
        .collect();
    let (current_as_of, current) = *points.last()?;

    let rated: Vec<u8> = points.iter().filter_map(|(_, v)| v.as_rated()).collect();
    let mean = (!rated.is_empty())
        .then(|| rated.iter().map(|v| f64::from(*v)).sum::<f64>() / rated.len() as f64);

    Some(TrendSummary {
        entity_id: id.clone(),
        metric: metric.clone(),
        window: DateRange::trailing(end, window),
        count: points.len(),
        rated_count: rated.len(),
        min: rated.iter().copied().min(),
        max: rated.iter().copied().max(),
        mean,
        current,
        current_as_of,
    })
}

/// Summaries for every entity/metric pair that has data, ordered by entity then metric.
pub fn summarize_all<'a>(
    store: &HistoryStore,
    ids: impl IntoIterator<Item = &'a EntityId>,
    metrics: &[MetricKey],
    window: Duration,
    end: NaiveDate,
) -> Vec<TrendSummary> {
    ids.into_iter()
        .flat_map(|id| {
            metrics
                .iter()
                .filter_map(move |metric| summarize(store, id, metric, window, end))
        })
        .collect()
}
