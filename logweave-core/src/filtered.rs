//! A view of another source reduced to the entries that pass a filter.
//!
//! Entries are judged as a whole: an entry filter sees every row sharing an
//! entry index, and a row is shown when its entry passes and the row itself
//! passes the line filter. Rows are judged once, in upstream order; an
//! upstream invalidation rewinds to the start of the entry it hits.
//!
//! ```text
//! ┌──────────┐  changes  ┌───────────────────┐  rows  ┌────────────┐
//! │ upstream │ ────────> │ FilteredLogSource │ ─────> │ subscriber │
//! └──────────┘           └───────────────────┘        └────────────┘
//! ```

use crate::{
    change::{Change, Section},
    desc::DEFAULT_MAX_BATCH_SIZE,
    filter::LogEntryFilter,
    listeners::{ListenerCollection, Subscription, lock},
    scheduler::{CancellationToken, PeriodicTask, TaskId, TaskScheduler},
    source::{ColumnId, LogEntry, LogSource, Rows, SourceProperties},
};
use rayon::prelude::*;
use std::{
    sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

const PARALLEL_THRESHOLD: usize = 1000;

/// columns the view answers itself, everything else comes from upstream
const OWN_COLUMNS: &[ColumnId] = &[ColumnId::Index, ColumnId::EntryIndex];

/// what the filters get to see
const FILTER_COLUMNS: &[ColumnId] = &[
    ColumnId::Index,
    ColumnId::EntryIndex,
    ColumnId::RawContent,
    ColumnId::Level,
    ColumnId::Timestamp,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FilteredRow {
    source_row: usize,
    /// entry index within the filtered view
    entry_index: usize,
}

#[derive(Default)]
struct TickState {
    /// upstream rows announced to us
    known: usize,
    /// upstream rows judged so far, always an entry boundary
    scanned: usize,
    /// first upstream row of every judged entry
    entry_starts: Vec<usize>,
}

struct Shared {
    source: Arc<dyn LogSource>,
    subscription: Subscription,
    line_filter: Option<Arc<dyn LogEntryFilter>>,
    entry_filter: Option<Arc<dyn LogEntryFilter>>,
    listeners: ListenerCollection,
    rows: RwLock<Vec<FilteredRow>>,
    state: Mutex<TickState>,
    properties: Mutex<SourceProperties>,
    max_wait: Duration,
    max_batch: usize,
}

pub struct FilteredLogSource {
    shared: Arc<Shared>,
    scheduler: Arc<dyn TaskScheduler>,
    task: TaskId,
}

impl FilteredLogSource {
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        source: Arc<dyn LogSource>,
        line_filter: Option<Arc<dyn LogEntryFilter>>,
        entry_filter: Option<Arc<dyn LogEntryFilter>>,
        max_wait: Duration,
    ) -> Self {
        Self::with_batch_size(
            scheduler,
            source,
            line_filter,
            entry_filter,
            max_wait,
            DEFAULT_MAX_BATCH_SIZE,
        )
    }

    /// `max_batch` bounds the number of upstream rows judged per tick
    pub fn with_batch_size(
        scheduler: Arc<dyn TaskScheduler>,
        source: Arc<dyn LogSource>,
        line_filter: Option<Arc<dyn LogEntryFilter>>,
        entry_filter: Option<Arc<dyn LogEntryFilter>>,
        max_wait: Duration,
        max_batch: usize,
    ) -> Self {
        let max_batch = max_batch.max(1);
        let subscription = source.subscribe(max_wait, max_batch);
        let shared = Arc::new(Shared {
            source,
            subscription,
            line_filter,
            entry_filter,
            listeners: ListenerCollection::new(),
            rows: RwLock::new(Vec::new()),
            state: Mutex::new(TickState::default()),
            properties: Mutex::new(SourceProperties::default()),
            max_wait,
            max_batch,
        });
        let task = scheduler.start_periodic(shared.clone());

        Self {
            shared,
            scheduler,
            task,
        }
    }
}

impl Drop for FilteredLogSource {
    fn drop(&mut self) {
        self.scheduler.stop_periodic(self.task);
        self.shared.source.unsubscribe(&self.shared.subscription);
    }
}

impl Shared {
    fn read_rows(&self) -> RwLockReadGuard<'_, Vec<FilteredRow>> {
        self.rows.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_rows(&self) -> RwLockWriteGuard<'_, Vec<FilteredRow>> {
        self.rows.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn clear(&self, state: &mut TickState) {
        *state = TickState::default();
        self.write_rows().clear();
        log::debug!("Filtered view cleared");
        self.listeners.reset();
    }

    fn invalidate(&self, state: &mut TickState, start: usize) {
        state.known = state.known.min(start);
        if start >= state.scanned {
            return;
        }

        // the entry containing `start` is judged again from its first row
        let keep = state
            .entry_starts
            .partition_point(|first| *first <= start)
            .saturating_sub(1);
        let rewind = state.entry_starts.get(keep).copied().unwrap_or(0);
        state.entry_starts.truncate(keep);
        state.scanned = rewind;

        let (previous, kept) = {
            let mut rows = self.write_rows();
            let previous = rows.len();
            let kept = rows.partition_point(|row| row.source_row < rewind);
            rows.truncate(kept);
            (previous, kept)
        };
        if previous > kept {
            log::debug!("Filtered view rewound from {} to {} rows", previous, kept);
            self.listeners.invalidate(kept, previous - kept);
        }
    }

    /// rows of `group` (starting at upstream row `first`) that are shown
    fn judge(&self, first: usize, group: &[LogEntry]) -> Vec<usize> {
        let entry_passes = self
            .entry_filter
            .as_ref()
            .is_none_or(|filter| filter.passes_entry(group));
        if !entry_passes {
            return Vec::new();
        }
        group
            .iter()
            .enumerate()
            .filter(|(_, line)| {
                self.line_filter
                    .as_ref()
                    .is_none_or(|filter| filter.passes_line(line))
            })
            .map(|(offset, _)| first + offset)
            .collect()
    }

    /// judge up to one batch of upstream rows, returns how many were consumed
    fn filter_rows(&self, state: &mut TickState) -> usize {
        let start = state.scanned;
        if start >= state.known {
            return 0;
        }

        let count = (state.known - start).min(self.max_batch);
        let mut lines = vec![LogEntry::default(); count];
        self.source
            .get_entries(Rows::Range(Section::new(start, count)), FILTER_COLUMNS, &mut lines);
        // vanished rows are followed by an invalidation
        let valid = lines
            .iter()
            .position(|line| !line.is_valid())
            .unwrap_or(lines.len());
        lines.truncate(valid);

        let mut groups: Vec<(usize, &[LogEntry])> = Vec::new();
        let mut first = start;
        for group in lines.chunk_by(|a, b| a.entry_index.is_some() && a.entry_index == b.entry_index) {
            groups.push((first, group));
            first += group.len();
        }
        // the last entry may go on in rows not read yet
        if start + lines.len() < state.known && groups.len() > 1 {
            groups.pop();
        }

        let shown: Vec<Vec<usize>> = if groups.len() > PARALLEL_THRESHOLD {
            groups
                .par_iter()
                .map(|(first, group)| self.judge(*first, group))
                .collect()
        } else {
            groups
                .iter()
                .map(|(first, group)| self.judge(*first, group))
                .collect()
        };

        let consumed: usize = groups.iter().map(|(_, group)| group.len()).sum();
        {
            let mut rows = self.write_rows();
            let mut next_entry = rows.last().map_or(0, |row| row.entry_index + 1);
            for ((first, _), shown) in groups.iter().zip(shown) {
                state.entry_starts.push(*first);
                if shown.is_empty() {
                    continue;
                }
                rows.extend(shown.into_iter().map(|source_row| FilteredRow {
                    source_row,
                    entry_index: next_entry,
                }));
                next_entry += 1;
            }
        }
        state.scanned += consumed;
        consumed
    }

    fn tick(&self, token: &CancellationToken) -> Duration {
        let mut state = lock(&self.state);
        let mut performed_work = false;

        while !token.is_cancelled() {
            let Some(change) = self.subscription.try_next() else {
                break;
            };
            match change {
                Change::Reset => self.clear(&mut state),
                Change::Invalidate(section) => self.invalidate(&mut state, section.start),
                Change::Append(section) => state.known = state.known.max(section.end()),
            }
            performed_work = true;
        }

        if !token.is_cancelled() {
            let consumed = self.filter_rows(&mut state);
            if consumed > 0 {
                log::debug!("Filtered view judged {} rows", consumed);
                performed_work = true;
            }
        }

        let count = self.read_rows().len();
        let upstream = self.source.properties();
        let caught_up = state.scanned == state.known
            && state.known >= self.source.count()
            && self.subscription.is_caught_up();
        *lock(&self.properties) = SourceProperties {
            end_of_source_reached: upstream.end_of_source_reached && caught_up,
            ..upstream
        };

        self.listeners.on_read(count);

        if performed_work || state.scanned < state.known {
            Duration::ZERO
        } else {
            self.max_wait
        }
    }
}

impl PeriodicTask for Shared {
    fn run_once(&self, token: &CancellationToken) -> Duration {
        self.tick(token)
    }

    fn name(&self) -> &str {
        "filter"
    }
}

impl LogSource for FilteredLogSource {
    fn count(&self) -> usize {
        self.shared.read_rows().len()
    }

    fn subscribe(&self, max_wait: Duration, max_batch: usize) -> Subscription {
        self.shared.listeners.subscribe(max_wait, max_batch)
    }

    fn unsubscribe(&self, subscription: &Subscription) {
        self.shared.listeners.unsubscribe(subscription);
    }

    fn get_entries(&self, rows: Rows<'_>, columns: &[ColumnId], dest: &mut [LogEntry]) {
        let mapped: Vec<Option<FilteredRow>> = {
            let filtered = self.shared.read_rows();
            rows.iter().map(|row| filtered.get(row).copied()).collect()
        };

        let source_columns: Vec<ColumnId> = columns
            .iter()
            .copied()
            .filter(|column| !OWN_COLUMNS.contains(column))
            .collect();
        if !source_columns.is_empty() {
            let source_rows: Vec<usize> = mapped.iter().flatten().map(|row| row.source_row).collect();
            let mut fetched = vec![LogEntry::default(); source_rows.len()];
            self.shared
                .source
                .get_entries(Rows::Indices(&source_rows), &source_columns, &mut fetched);

            let mut fetched = fetched.iter();
            for (slot, row) in dest.iter_mut().zip(&mapped) {
                if row.is_some()
                    && let Some(entry) = fetched.next()
                {
                    slot.copy_columns(entry, &source_columns);
                }
            }
        }

        let own_columns: Vec<ColumnId> = columns
            .iter()
            .copied()
            .filter(|column| OWN_COLUMNS.contains(column))
            .collect();
        for ((row, mapped), slot) in rows.iter().zip(&mapped).zip(dest.iter_mut()) {
            match mapped {
                Some(filtered) => {
                    let own = LogEntry {
                        index: Some(row),
                        entry_index: Some(filtered.entry_index),
                        ..Default::default()
                    };
                    slot.copy_columns(&own, &own_columns);
                }
                None => slot.clear_columns(columns),
            }
        }
    }

    fn properties(&self) -> SourceProperties {
        lock(&self.shared.properties).clone()
    }
}
