//! Groups consecutive raw lines into multi-line entries.
//!
//! A line that carries a level starts a new entry. A level-less line joins
//! the entry in progress, unless that entry is level-less too. Entry
//! boundaries are therefore only a guess until the next leveled line shows
//! up: when a line joins an entry that was already delivered downstream,
//! the entry is invalidated and re-appended with its new extent.

use crate::{
    change::Change,
    desc::DEFAULT_MAX_BATCH_SIZE,
    listeners::{ListenerCollection, Subscription, lock},
    scheduler::{CancellationToken, PeriodicTask, TaskId, TaskScheduler},
    source::{ColumnId, Level, LogEntry, LogSource, LogSourceExt, Rows, SourceProperties},
};
use std::{
    sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntryInfo {
    entry_index: usize,
    first_line: usize,
}

#[derive(Default)]
struct Index {
    /// one descriptor per consumed line
    entries: Vec<EntryInfo>,
    /// upstream lines consumed so far
    count: usize,
}

#[derive(Default)]
struct TickState {
    /// entry the next level-less line would join
    current: Option<EntryInfo>,
    current_level: Level,
    /// upstream lines announced to us, `[0, known)`
    known: usize,
}

struct Shared {
    source: Arc<dyn LogSource>,
    subscription: Subscription,
    listeners: ListenerCollection,
    index: RwLock<Index>,
    state: Mutex<TickState>,
    properties: Mutex<SourceProperties>,
    max_wait: Duration,
    max_batch: usize,
}

pub struct MultiLineLogSource {
    shared: Arc<Shared>,
    scheduler: Arc<dyn TaskScheduler>,
    task: TaskId,
}

impl MultiLineLogSource {
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        source: Arc<dyn LogSource>,
        max_wait: Duration,
    ) -> Self {
        Self::with_batch_size(scheduler, source, max_wait, DEFAULT_MAX_BATCH_SIZE)
    }

    /// `max_batch` bounds the number of upstream lines consumed per tick
    pub fn with_batch_size(
        scheduler: Arc<dyn TaskScheduler>,
        source: Arc<dyn LogSource>,
        max_wait: Duration,
        max_batch: usize,
    ) -> Self {
        let max_batch = max_batch.max(1);
        let subscription = source.subscribe(max_wait, max_batch);
        let shared = Arc::new(Shared {
            source,
            subscription,
            listeners: ListenerCollection::new(),
            index: RwLock::new(Index::default()),
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

impl Drop for MultiLineLogSource {
    fn drop(&mut self) {
        self.scheduler.stop_periodic(self.task);
        self.shared.source.unsubscribe(&self.shared.subscription);
    }
}

impl Shared {
    fn read_index(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn clear(&self, state: &mut TickState) {
        *state = TickState::default();
        {
            let mut index = self.write_index();
            index.entries.clear();
            index.count = 0;
        }
        log::debug!("Multi-line index cleared");
        self.listeners.reset();
    }

    fn invalidate(&self, state: &mut TickState, start: usize) {
        let first_invalid = start.min(state.known);
        state.known = first_invalid;

        let (previous, restored) = {
            let mut index = self.write_index();
            let previous = index.count;
            index.count = index.count.min(first_invalid);
            let count = index.count;
            index.entries.truncate(count);
            (previous, index.entries.last().copied())
        };

        // the entry spanning the invalidation point is still in progress
        state.current = restored;
        state.current_level = match restored {
            Some(info) => self.source.entry(info.first_line).level,
            None => Level::None,
        };

        if previous > first_invalid {
            log::debug!(
                "Multi-line index rewound from {} to {}",
                previous,
                first_invalid
            );
            self.listeners.invalidate(first_invalid, previous - first_invalid);
        }
    }

    /// consume up to one batch of upstream lines, returns how many were read
    fn read_lines(&self, state: &mut TickState, token: &CancellationToken) -> usize {
        let start = self.read_index().count;
        if start >= state.known {
            return 0;
        }

        let remaining = (state.known - start).min(self.max_batch);
        let mut lines = vec![LogEntry::default(); remaining];
        self.source.get_column(
            Rows::Range(crate::change::Section::new(start, remaining)),
            ColumnId::Level,
            &mut lines,
        );

        let mut reset_index = None;
        let mut infos = Vec::with_capacity(remaining);
        for (offset, line) in lines.iter().enumerate() {
            if token.is_cancelled() {
                break;
            }
            let line_index = start + offset;
            let current = match state.current {
                Some(current) if line.level.is_none() && !state.current_level.is_none() => {
                    if current.first_line < start && reset_index.is_none() {
                        reset_index = Some(current.first_line);
                    }
                    current
                }
                current => {
                    let next = EntryInfo {
                        entry_index: current.map_or(0, |info| info.entry_index + 1),
                        first_line: line_index,
                    };
                    state.current = Some(next);
                    state.current_level = line.level;
                    next
                }
            };
            infos.push(current);
        }

        // lines after a cancellation point are left for the next tick
        let consumed = infos.len();
        {
            let mut index = self.write_index();
            index.entries.extend(infos);
            index.count += consumed;
        }

        if let Some(reset_index) = reset_index {
            // an entry delivered earlier just grew
            self.listeners.invalidate(reset_index, start - reset_index);
        }

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

        let read = self.read_lines(&mut state, token);
        if read > 0 {
            log::debug!("Multi-line index consumed {} lines", read);
            performed_work = true;
        }

        let (count, descriptors) = {
            let index = self.read_index();
            (index.count, index.entries.len())
        };
        if descriptors != count {
            log::warn!(
                "Inconsistency detected: {} entry descriptors for {} lines",
                descriptors,
                count
            );
        }

        let upstream = self.source.properties();
        let caught_up = count == state.known
            && count >= self.source.count()
            && self.subscription.is_caught_up();
        *lock(&self.properties) = SourceProperties {
            end_of_source_reached: upstream.end_of_source_reached && caught_up,
            ..upstream
        };

        self.listeners.on_read(count);

        if performed_work || count < state.known {
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
        "multi-line"
    }
}

impl LogSource for MultiLineLogSource {
    fn count(&self) -> usize {
        self.shared.read_index().count
    }

    fn subscribe(&self, max_wait: Duration, max_batch: usize) -> Subscription {
        self.shared.listeners.subscribe(max_wait, max_batch)
    }

    fn unsubscribe(&self, subscription: &Subscription) {
        self.shared.listeners.unsubscribe(subscription);
    }

    fn get_entries(&self, rows: Rows<'_>, columns: &[ColumnId], dest: &mut [LogEntry]) {
        let (line_columns, entry_columns): (Vec<ColumnId>, Vec<ColumnId>) = columns
            .iter()
            .filter(|column| **column != ColumnId::EntryIndex)
            .partition(|column| !matches!(column, ColumnId::Level | ColumnId::Timestamp));
        let wants_entry_index = columns.contains(&ColumnId::EntryIndex);

        let index = self.shared.read_index();
        if !line_columns.is_empty() {
            self.shared.source.get_entries(rows, &line_columns, dest);
        }

        // level and timestamp belong to the entry, i.e. its first line
        let mut first_lines = Vec::with_capacity(rows.len());
        for (row, slot) in rows.iter().zip(dest.iter_mut()) {
            match index.entries.get(row).filter(|_| row < index.count) {
                Some(info) => {
                    if wants_entry_index {
                        slot.entry_index = Some(info.entry_index);
                    }
                    first_lines.push(Some(info.first_line));
                }
                None => {
                    slot.clear_columns(columns);
                    first_lines.push(None);
                }
            }
        }

        if entry_columns.is_empty() {
            return;
        }
        let valid: Vec<usize> = first_lines.iter().flatten().copied().collect();
        let mut firsts = vec![LogEntry::default(); valid.len()];
        self.shared
            .source
            .get_entries(Rows::Indices(&valid), &entry_columns, &mut firsts);

        let mut firsts = firsts.iter();
        for (slot, first_line) in dest.iter_mut().zip(&first_lines) {
            if first_line.is_some()
                && let Some(first) = firsts.next()
            {
                slot.copy_columns(first, &entry_columns);
            }
        }
    }

    fn properties(&self) -> SourceProperties {
        lock(&self.shared.properties).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{change::Section, in_memory::InMemoryLogSource, scheduler::ManualTaskScheduler};
    use chrono::NaiveDate;

    fn setup(
        max_batch: usize,
    ) -> (
        Arc<ManualTaskScheduler>,
        Arc<InMemoryLogSource>,
        MultiLineLogSource,
        Subscription,
    ) {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(InMemoryLogSource::new());
        let assembler = MultiLineLogSource::with_batch_size(
            scheduler.clone(),
            source.clone(),
            Duration::ZERO,
            max_batch,
        );
        let sub = assembler.subscribe(Duration::ZERO, max_batch);
        (scheduler, source, assembler, sub)
    }

    fn entry_indices(assembler: &MultiLineLogSource) -> Vec<Option<usize>> {
        let mut dest = vec![LogEntry::default(); assembler.count()];
        assembler.get_column(
            Rows::Range(Section::new(0, assembler.count())),
            ColumnId::EntryIndex,
            &mut dest,
        );
        dest.into_iter().map(|entry| entry.entry_index).collect()
    }

    fn assert_consistent(assembler: &MultiLineLogSource) {
        let index = assembler.shared.read_index();
        assert_eq!(index.entries.len(), index.count);
    }

    #[test]
    fn test_single_line_entry() {
        let (scheduler, source, assembler, sub) = setup(DEFAULT_MAX_BATCH_SIZE);
        source.add_entry("INFO: hello", Level::Info, None);
        scheduler.run_once();

        assert_eq!(assembler.count(), 1);
        assert_eq!(sub.drain(), vec![Change::Reset, Change::append(0, 1)]);
        assert_eq!(assembler.entry(0).entry_index, Some(0));
        assert_consistent(&assembler);
    }

    #[test]
    fn test_delivered_entry_grows() {
        let (scheduler, source, assembler, sub) = setup(DEFAULT_MAX_BATCH_SIZE);
        let timestamp = NaiveDate::from_ymd_opt(2017, 3, 24)
            .and_then(|date| date.and_hms_opt(14, 26, 0));

        source.add_entry("INFO: hello", Level::Info, timestamp);
        scheduler.run_once();
        sub.drain();

        source.add_entry("world!", Level::None, None);
        scheduler.run_once();

        assert_eq!(sub.drain(), vec![Change::invalidate(0, 1), Change::append(0, 2)]);
        assert_eq!(entry_indices(&assembler), vec![Some(0), Some(0)]);

        let second = assembler.entry(1);
        assert_eq!(second.level, Level::Info);
        assert_eq!(second.timestamp, timestamp);
        assert_eq!(second.raw_content, "world!");
        assert_consistent(&assembler);
    }

    #[test]
    fn test_level_less_lines_after_level_less_entry_stay_separate() {
        let (scheduler, source, assembler, _sub) = setup(DEFAULT_MAX_BATCH_SIZE);
        source.add_entry("plain", Level::None, None);
        source.add_entry("still plain", Level::None, None);
        source.add_entry("WARN careful", Level::Warning, None);
        source.add_entry("  detail", Level::None, None);
        scheduler.run_once();

        assert_eq!(
            entry_indices(&assembler),
            vec![Some(0), Some(1), Some(2), Some(2)]
        );
        assert_eq!(assembler.entry(3).level, Level::Warning);
    }

    #[test]
    fn test_second_entry_grows() {
        let (scheduler, source, _assembler, sub) = setup(DEFAULT_MAX_BATCH_SIZE);
        source.add_entry("INFO first", Level::Info, None);
        scheduler.run_once();
        source.add_entry("INFO second", Level::Info, None);
        scheduler.run_once();
        assert_eq!(
            sub.drain(),
            vec![Change::Reset, Change::append(0, 1), Change::append(1, 1)]
        );

        source.add_entry("continued", Level::None, None);
        scheduler.run_once();
        assert_eq!(sub.drain(), vec![Change::invalidate(1, 1), Change::append(1, 2)]);
    }

    #[test]
    fn test_reset_is_forwarded_once() {
        let (scheduler, source, assembler, sub) = setup(DEFAULT_MAX_BATCH_SIZE);
        source.add_entry("INFO a", Level::Info, None);
        scheduler.run_once();

        source.clear();
        scheduler.run_once();

        assert_eq!(assembler.count(), 0);
        assert_eq!(
            sub.drain(),
            vec![Change::Reset, Change::append(0, 1), Change::Reset]
        );
        assert_consistent(&assembler);
    }

    #[test]
    fn test_batches_are_bounded() {
        let (scheduler, source, assembler, sub) = setup(3);
        for i in 0..4 {
            source.add_entry(format!("INFO {}", i), Level::Info, None);
        }
        sub.drain();

        scheduler.run_once();
        assert_eq!(assembler.count(), 3);
        assert!(!assembler.end_of_source_reached());
        assert_eq!(sub.drain(), vec![Change::append(0, 3)]);

        scheduler.run_once();
        assert_eq!(assembler.count(), 4);
        assert!(assembler.end_of_source_reached());
        assert_consistent(&assembler);
    }

    #[test]
    fn test_cancelled_tick_keeps_cursor() {
        let (_scheduler, source, assembler, sub) = setup(3);
        for i in 0..5 {
            source.add_entry(format!("INFO {}", i), Level::Info, None);
        }
        let token = CancellationToken::new();
        assembler.shared.run_once(&token);
        assert_eq!(assembler.count(), 3);
        sub.drain();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assembler.shared.run_once(&cancelled);
        assert_eq!(assembler.count(), 3);
        assert!(!assembler.end_of_source_reached());
        let rows = assembler.entries(Rows::Range(Section::new(0, assembler.count())));
        assert_eq!(rows.len(), assembler.count());
        assert!(sub.drain().is_empty());
        assert_consistent(&assembler);

        assembler.shared.run_once(&token);
        assert_eq!(assembler.count(), 5);
        assert_eq!(sub.drain(), vec![Change::append(3, 2)]);
        assert_eq!(entry_indices(&assembler), (0..5).map(Some).collect::<Vec<_>>());
        assert!(assembler.end_of_source_reached());
    }

    #[test]
    fn test_large_append_needs_two_ticks() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(InMemoryLogSource::new());
        for i in 0..DEFAULT_MAX_BATCH_SIZE + 1 {
            source.add_entry(format!("line {}", i), Level::None, None);
        }
        let assembler = MultiLineLogSource::new(scheduler.clone(), source, Duration::ZERO);
        assert!(!assembler.end_of_source_reached());

        scheduler.run_once();
        assert_eq!(assembler.count(), DEFAULT_MAX_BATCH_SIZE);
        assert!(!assembler.end_of_source_reached());

        scheduler.run_once();
        assert_eq!(assembler.count(), DEFAULT_MAX_BATCH_SIZE + 1);
        assert!(assembler.end_of_source_reached());
    }

    #[test]
    fn test_upstream_invalidate_rewinds() {
        let (scheduler, source, assembler, sub) = setup(DEFAULT_MAX_BATCH_SIZE);
        source.add_entry("ERROR boom", Level::Error, None);
        source.add_entry("  at a", Level::None, None);
        source.add_entry("INFO next", Level::Info, None);
        scheduler.run_once();
        sub.drain();

        source.remove_from(2);
        source.add_entry("  at b", Level::None, None);
        scheduler.run_once();

        // the replacement line widens entry 0, which was already delivered
        assert_eq!(
            sub.drain(),
            vec![
                Change::invalidate(2, 1),
                Change::invalidate(0, 2),
                Change::append(0, 3)
            ]
        );
        assert_eq!(entry_indices(&assembler), vec![Some(0), Some(0), Some(0)]);
        assert_eq!(assembler.entry(2).level, Level::Error);
        assert_consistent(&assembler);
    }

    #[test]
    fn test_out_of_range_rows_are_defaults() {
        let (scheduler, source, assembler, _sub) = setup(DEFAULT_MAX_BATCH_SIZE);
        source.add_entry("INFO a", Level::Info, None);
        // upstream has the row, but it has not been consumed yet
        assert_eq!(assembler.entry(0), LogEntry::default());

        scheduler.run_once();
        assert_eq!(assembler.entry(0).raw_content, "INFO a");
        assert_eq!(assembler.entry(1), LogEntry::default());
    }

    #[test]
    fn test_properties_copied_from_upstream() {
        let (scheduler, source, assembler, _sub) = setup(DEFAULT_MAX_BATCH_SIZE);
        source.set_error(Some(crate::source::SourceError::DoesNotExist));
        source.add_entry("INFO abc", Level::Info, None);
        scheduler.run_once();

        let properties = assembler.properties();
        assert_eq!(properties.error, Some(crate::source::SourceError::DoesNotExist));
        assert_eq!(properties.max_characters_per_line, 8);
        assert!(properties.end_of_source_reached);
    }

    #[test]
    fn test_drop_stops_task() {
        let (scheduler, _source, assembler, _sub) = setup(DEFAULT_MAX_BATCH_SIZE);
        assert_eq!(scheduler.periodic_task_count(), 1);
        drop(assembler);
        assert_eq!(scheduler.periodic_task_count(), 0);
    }
}
