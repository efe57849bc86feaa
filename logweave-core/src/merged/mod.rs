//! Timestamp-ordered merge of several sources.
//!
//! ```text
//! ┌──────────┐
//! │ source 0 │ ──┐
//! └──────────┘   │   process()   ┌─────────────┐   rows   ┌─────────────────┐
//!                ├─────────────> │ MergedIndex │ ───────> │ MergedLogSource │
//! ┌──────────┐   │               └─────────────┘          └─────────────────┘
//! │ source 1 │ ──┘
//! └──────────┘
//! ```
//!
//! Only entries with a timestamp take part; everything else is left out of
//! the merged view.

mod index;

pub use index::{MergedIndex, MergedRecord, PendingModification};

use crate::{
    desc::DEFAULT_MAX_BATCH_SIZE,
    listeners::{ListenerCollection, Subscription, lock},
    scheduler::{CancellationToken, PeriodicTask, TaskId, TaskScheduler},
    source::{ColumnId, LogEntry, LogSource, Rows, SourceProperties},
};
use itertools::Itertools;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

/// columns answered by the source a merged row points to
const SOURCE_COLUMNS: &[ColumnId] = &[
    ColumnId::LineNumber,
    ColumnId::RawContent,
    ColumnId::Level,
    ColumnId::Timestamp,
];

struct Shared {
    sources: Vec<Arc<dyn LogSource>>,
    subscriptions: Vec<Subscription>,
    index: MergedIndex,
    listeners: ListenerCollection,
    properties: Mutex<SourceProperties>,
    max_wait: Duration,
}

pub struct MergedLogSource {
    shared: Arc<Shared>,
    scheduler: Arc<dyn TaskScheduler>,
    task: TaskId,
}

impl MergedLogSource {
    /// Merge `sources`; a row's [`ColumnId::SourceId`] is the position of its
    /// source in this list.
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        sources: Vec<Arc<dyn LogSource>>,
        max_wait: Duration,
    ) -> Self {
        let subscriptions = sources
            .iter()
            .map(|source| source.subscribe(max_wait, DEFAULT_MAX_BATCH_SIZE))
            .collect();
        let shared = Arc::new(Shared {
            index: MergedIndex::new(sources.clone()),
            sources,
            subscriptions,
            listeners: ListenerCollection::new(),
            properties: Mutex::new(SourceProperties::default()),
            max_wait,
        });
        let task = scheduler.start_periodic(shared.clone());

        Self {
            shared,
            scheduler,
            task,
        }
    }

    pub fn sources(&self) -> &[Arc<dyn LogSource>] {
        &self.shared.sources
    }
}

impl Drop for MergedLogSource {
    fn drop(&mut self) {
        self.scheduler.stop_periodic(self.task);
        for (source, subscription) in self.shared.sources.iter().zip(&self.shared.subscriptions) {
            source.unsubscribe(subscription);
        }
    }
}

impl Shared {
    fn tick(&self, token: &CancellationToken) -> Duration {
        let mut modifications = Vec::new();
        for (source_id, subscription) in self.subscriptions.iter().enumerate() {
            if token.is_cancelled() {
                break;
            }
            modifications.extend(
                subscription
                    .drain()
                    .into_iter()
                    .map(|change| PendingModification::new(source_id, change)),
            );
        }

        // a cancelled tick drops nothing: what was drained is still merged
        for change in self.index.process(&modifications) {
            self.listeners.notify(change);
        }
        self.listeners.flush();

        // rows may still sit in a subscription waiting for the idle flush
        let caught_up = self
            .subscriptions
            .iter()
            .all(|subscription| subscription.is_caught_up())
            && self.index.is_caught_up();
        let mut properties = aggregate(&self.sources);
        properties.end_of_source_reached &= modifications.is_empty() && caught_up;
        *lock(&self.properties) = properties;

        if modifications.is_empty() {
            self.max_wait
        } else {
            Duration::ZERO
        }
    }
}

impl PeriodicTask for Shared {
    fn run_once(&self, token: &CancellationToken) -> Duration {
        self.tick(token)
    }

    fn name(&self) -> &str {
        "merge"
    }
}

fn aggregate(sources: &[Arc<dyn LogSource>]) -> SourceProperties {
    let all: Vec<SourceProperties> = sources.iter().map(|source| source.properties()).collect();

    SourceProperties {
        end_of_source_reached: all.iter().all(|properties| properties.end_of_source_reached),
        // only an error when nothing at all can be shown
        error: if !all.is_empty() && all.iter().all(|properties| properties.error.is_some()) {
            all.iter().find_map(|properties| properties.error)
        } else {
            None
        },
        size: all.iter().map(|properties| properties.size).sum(),
        last_modified: all.iter().filter_map(|properties| properties.last_modified).max(),
        created: all.iter().filter_map(|properties| properties.created).min(),
        start_timestamp: all.iter().filter_map(|properties| properties.start_timestamp).min(),
        end_timestamp: all.iter().filter_map(|properties| properties.end_timestamp).max(),
        max_characters_per_line: all
            .iter()
            .map(|properties| properties.max_characters_per_line)
            .max()
            .unwrap_or(0),
    }
}

impl LogSource for MergedLogSource {
    fn count(&self) -> usize {
        self.shared.index.count()
    }

    fn subscribe(&self, max_wait: Duration, max_batch: usize) -> Subscription {
        self.shared.listeners.subscribe(max_wait, max_batch)
    }

    fn unsubscribe(&self, subscription: &Subscription) {
        self.shared.listeners.unsubscribe(subscription);
    }

    fn get_entries(&self, rows: Rows<'_>, columns: &[ColumnId], dest: &mut [LogEntry]) {
        let records = self.shared.index.get(rows);

        let source_columns: Vec<ColumnId> = columns
            .iter()
            .copied()
            .filter(|column| SOURCE_COLUMNS.contains(column))
            .collect();
        if !source_columns.is_empty() {
            let by_source = records
                .iter()
                .enumerate()
                .filter_map(|(position, record)| record.map(|record| (position, record)))
                .into_group_map_by(|(_, record)| record.source_id);

            for (source_id, group) in by_source {
                let Some(source) = self.shared.sources.get(source_id) else {
                    continue;
                };
                let lines: Vec<usize> = group.iter().map(|(_, record)| record.source_line).collect();
                let mut fetched = vec![LogEntry::default(); lines.len()];
                source.get_entries(Rows::Indices(&lines), &source_columns, &mut fetched);
                for ((position, _), entry) in group.iter().zip(&fetched) {
                    if let Some(slot) = dest.get_mut(*position) {
                        slot.copy_columns(entry, &source_columns);
                    }
                }
            }
        }

        let merged_columns: Vec<ColumnId> = columns
            .iter()
            .copied()
            .filter(|column| !SOURCE_COLUMNS.contains(column))
            .collect();
        for ((row, record), slot) in rows.iter().zip(&records).zip(dest.iter_mut()) {
            match record {
                Some(record) => {
                    let merged = LogEntry {
                        index: Some(row),
                        original_index: Some(record.source_line),
                        entry_index: Some(record.merged_entry_index),
                        source_id: Some(record.source_id),
                        ..Default::default()
                    };
                    slot.copy_columns(&merged, &merged_columns);
                }
                None => slot.clear_columns(columns),
            }
        }
    }

    fn properties(&self) -> SourceProperties {
        lock(&self.shared.properties).clone()
    }
}
