use crate::{
    listeners::{ListenerCollection, Subscription},
    source::{ColumnId, Level, LogEntry, LogSource, Rows, SourceError, SourceProperties},
};
use chrono::NaiveDateTime;
use std::{
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

#[derive(Default)]
struct Buffer {
    entries: Vec<LogEntry>,
    next_entry_index: usize,
    error: Option<SourceError>,
}

/// A source whose rows are pushed by the caller.
///
/// Always reports end-of-source. Used for stdin and in tests.
#[derive(Default)]
pub struct InMemoryLogSource {
    buffer: RwLock<Buffer>,
    listeners: ListenerCollection,
}

impl InMemoryLogSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Buffer> {
        self.buffer.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Buffer> {
        self.buffer.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// append one single-line entry
    pub fn add_entry(&self, raw: impl Into<String>, level: Level, timestamp: Option<NaiveDateTime>) {
        let count = {
            let mut buffer = self.write();
            let entry_index = buffer.next_entry_index;
            buffer.next_entry_index += 1;
            push_line(&mut buffer.entries, raw.into(), level, timestamp, entry_index);
            buffer.entries.len()
        };
        self.listeners.on_read(count);
    }

    /// append one entry spanning several lines, all sharing level and timestamp
    pub fn add_multiline_entry<I, S>(&self, lines: I, level: Level, timestamp: Option<NaiveDateTime>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let count = {
            let mut buffer = self.write();
            let entry_index = buffer.next_entry_index;
            let before = buffer.entries.len();
            for line in lines {
                push_line(&mut buffer.entries, line.into(), level, timestamp, entry_index);
            }
            if buffer.entries.len() > before {
                buffer.next_entry_index += 1;
            }
            buffer.entries.len()
        };
        self.listeners.on_read(count);
    }

    /// drop every row at or after `index`
    pub fn remove_from(&self, index: usize) {
        let removed = {
            let mut buffer = self.write();
            let len = buffer.entries.len();
            if index >= len {
                return;
            }
            buffer.entries.truncate(index);
            buffer.next_entry_index = buffer
                .entries
                .last()
                .and_then(|entry| entry.entry_index)
                .map_or(0, |entry_index| entry_index + 1);
            len - index
        };
        self.listeners.invalidate(index, removed);
    }

    pub fn clear(&self) {
        {
            let mut buffer = self.write();
            buffer.entries.clear();
            buffer.next_entry_index = 0;
        }
        self.listeners.reset();
    }

    pub fn set_error(&self, error: Option<SourceError>) {
        self.write().error = error;
    }
}

fn push_line(
    entries: &mut Vec<LogEntry>,
    raw_content: String,
    level: Level,
    timestamp: Option<NaiveDateTime>,
    entry_index: usize,
) {
    let index = entries.len();
    entries.push(LogEntry {
        index: Some(index),
        original_index: Some(index),
        entry_index: Some(entry_index),
        line_number: index + 1,
        source_id: None,
        raw_content,
        level,
        timestamp,
    });
}

impl LogSource for InMemoryLogSource {
    fn count(&self) -> usize {
        self.read().entries.len()
    }

    fn subscribe(&self, max_wait: Duration, max_batch: usize) -> Subscription {
        self.listeners.subscribe(max_wait, max_batch)
    }

    fn unsubscribe(&self, subscription: &Subscription) {
        self.listeners.unsubscribe(subscription);
    }

    fn get_entries(&self, rows: Rows<'_>, columns: &[ColumnId], dest: &mut [LogEntry]) {
        let buffer = self.read();
        for (row, slot) in rows.iter().zip(dest.iter_mut()) {
            match buffer.entries.get(row) {
                Some(entry) => slot.copy_columns(entry, columns),
                None => slot.clear_columns(columns),
            }
        }
    }

    fn properties(&self) -> SourceProperties {
        let buffer = self.read();
        let timestamps = buffer.entries.iter().filter_map(|entry| entry.timestamp);
        SourceProperties {
            end_of_source_reached: true,
            error: buffer.error,
            size: buffer
                .entries
                .iter()
                .map(|entry| entry.raw_content.len() as u64 + 1)
                .sum(),
            start_timestamp: timestamps.clone().min(),
            end_timestamp: timestamps.max(),
            max_characters_per_line: buffer
                .entries
                .iter()
                .map(|entry| entry.raw_content.chars().count())
                .max()
                .unwrap_or(0),
            ..Default::default()
        }
    }
}
