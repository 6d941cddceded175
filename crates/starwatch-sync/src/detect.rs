//! Change detection between an entity's two most recent snapshots.

use std::sync::Arc;

use starwatch_core::{ChangeEvent, Direction, EntityId};
use starwatch_storage::HistoryStore;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Events for every metric rated in both of the entity's latest two entries whose value
/// moved. Fewer than two entries is the first-run baseline and yields nothing.
pub fn detect_changes(store: &HistoryStore, id: &EntityId) -> Vec<ChangeEvent> {
    let (Some(current), Some(previous)) = store.latest_two(id) else {
        debug!(entity_id = %id, "no prior snapshot; baseline only");
        return Vec::new();
    };

    let label = current.record.label();
    current
        .record
        .metrics
        .iter()
        .filter_map(|(metric, value)| {
            let current_value = value.as_rated()?;
            let previous_value = previous.metric(metric)?.as_rated()?;
            let direction = Direction::between(previous_value, current_value)?;
            Some(ChangeEvent {
                id: ChangeEvent::deterministic_id(id, metric, previous.as_of(), current.as_of()),
                entity_id: id.clone(),
                entity_label: label.clone(),
                metric: metric.clone(),
                previous_value,
                current_value,
                direction,
                previous_as_of: previous.as_of(),
                current_as_of: current.as_of(),
            })
        })
        .collect()
}

/// Runs `detect_changes` across entities on a bounded set of tasks.
#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector {
    max_workers: usize,
}

impl ChangeDetector {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }

    /// Output is ordered by entity then metric regardless of task completion order.
    pub async fn detect_all(
        &self,
        store: Arc<HistoryStore>,
        ids: impl IntoIterator<Item = EntityId>,
    ) -> Vec<ChangeEvent> {
        let limit = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();
        for id in ids {
            let store = Arc::clone(&store);
            let limit = Arc::clone(&limit);
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await;
                detect_changes(&store, &id)
            });
        }

        let mut events = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(found) => events.extend(found),
                Err(err) => warn!(error = %err, "change detection task failed"),
            }
        }
        events.sort_by(|a, b| {
            (&a.entity_id, &a.metric).cmp(&(&b.entity_id, &b.metric))
        });
        events
    }
}
