use crate::{
    change::{Change, Section},
    listeners::lock,
    source::{ColumnId, LogEntry, LogSource, Rows, SourceId},
};
use chrono::NaiveDateTime;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One timestamped entry row of a source, placed in the merged order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedRecord {
    pub source_id: SourceId,
    /// row index within the source
    pub source_line: usize,
    pub source_entry_index: usize,
    /// entry index within the merged view
    pub merged_entry_index: usize,
    pub timestamp: NaiveDateTime,
}

impl MergedRecord {
    fn same_entry(&self, other: &MergedRecord) -> bool {
        self.source_id == other.source_id && self.source_entry_index == other.source_entry_index
    }
}

/// A change of one source, waiting to be merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingModification {
    pub source_id: SourceId,
    pub change: Change,
}

impl PendingModification {
    pub fn new(source_id: SourceId, change: Change) -> Self {
        Self { source_id, change }
    }
}

enum Step {
    Insert(Vec<MergedRecord>),
    /// drop every record of the source from this row on
    Remove { source_id: SourceId, from: usize },
}

const MERGE_COLUMNS: &[ColumnId] = &[ColumnId::Index, ColumnId::EntryIndex, ColumnId::Timestamp];

/// Timestamp-ordered list of references into several sources.
///
/// Records are sorted ascending by timestamp; records with equal timestamps
/// keep the order in which they were discovered.
pub struct MergedIndex {
    sources: Vec<Arc<dyn LogSource>>,
    records: RwLock<Vec<MergedRecord>>,
    /// rows of each source merged so far
    applied: Mutex<Vec<usize>>,
}

impl MergedIndex {
    pub fn new(sources: Vec<Arc<dyn LogSource>>) -> Self {
        let applied = vec![0; sources.len()];
        Self {
            sources,
            records: RwLock::new(Vec::new()),
            applied: Mutex::new(applied),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<MergedRecord>> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<MergedRecord>> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    /// records at the given rows, `None` where out of range
    pub fn get(&self, rows: Rows<'_>) -> Vec<Option<MergedRecord>> {
        let records = self.read();
        rows.iter().map(|row| records.get(row).copied()).collect()
    }

    /// every row the sources currently hold has been merged
    pub fn is_caught_up(&self) -> bool {
        let applied = lock(&self.applied);
        self.sources
            .iter()
            .zip(applied.iter())
            .all(|(source, applied)| *applied >= source.count())
    }

    pub fn snapshot(&self) -> Vec<MergedRecord> {
        self.read().clone()
    }

    /// Merge a batch of source changes and return the changes of the
    /// merged view, in emission order.
    ///
    /// At most one invalidation is produced per call, and an empty batch
    /// produces nothing.
    pub fn process(&self, modifications: &[PendingModification]) -> Vec<Change> {
        if modifications.is_empty() {
            return Vec::new();
        }

        // source reads happen before the index is locked
        let steps = self.fetch(modifications);

        let mut records = self.write();
        let original_len = records.len();

        let mut staged: Vec<MergedRecord> = Vec::new();
        let mut lowest_removal: Option<usize> = None;
        for step in steps {
            match step {
                Step::Insert(new) => staged.extend(new),
                Step::Remove { source_id, from } => {
                    staged.retain(|record| {
                        record.source_id != source_id || record.source_line < from
                    });
                    if let Some(position) = records.iter().position(|record| {
                        record.source_id == source_id && record.source_line >= from
                    }) {
                        records.retain(|record| {
                            record.source_id != source_id || record.source_line < from
                        });
                        lowest_removal =
                            Some(lowest_removal.map_or(position, |lowest| lowest.min(position)));
                    }
                }
            }
        }

        // stable, so equal timestamps keep discovery order
        staged.sort_by_key(|record| record.timestamp);

        let mut appended_before_invalidation = 0;
        let mut lowest_insertion: Option<usize> = None;
        for record in staged {
            let position = insertion_position(&records, &record);
            if position < records.len() && lowest_insertion.is_none() {
                lowest_insertion = Some(position);
                if lowest_removal.is_none() {
                    appended_before_invalidation = records.len() - original_len;
                }
            }
            records.insert(position, record);
        }

        let invalidation = match (lowest_removal, lowest_insertion) {
            (Some(removal), Some(insertion)) => Some(removal.min(insertion)),
            (removal, insertion) => removal.or(insertion),
        };

        let final_len = records.len();
        let mut changes = Vec::with_capacity(3);
        match invalidation {
            None => {
                if final_len > original_len {
                    changes.push(Change::append(original_len, final_len - original_len));
                }
                renumber(&mut records, original_len);
            }
            Some(position) => {
                if appended_before_invalidation > 0 {
                    changes.push(Change::append(original_len, appended_before_invalidation));
                }
                let delivered = original_len + appended_before_invalidation;
                if delivered > position {
                    changes.push(Change::invalidate(position, delivered - position));
                }
                if final_len > position {
                    changes.push(Change::append(position, final_len - position));
                }
                renumber(&mut records, position);
            }
        }

        log::debug!(
            "Merged {} modifications: {} -> {} records",
            modifications.len(),
            original_len,
            final_len
        );
        changes
    }

    fn fetch(&self, modifications: &[PendingModification]) -> Vec<Step> {
        let mut applied = lock(&self.applied);
        let mut steps = Vec::with_capacity(modifications.len());

        for modification in modifications {
            let source_id = modification.source_id;
            let (Some(source), Some(applied)) =
                (self.sources.get(source_id), applied.get_mut(source_id))
            else {
                log::warn!("Modification for unknown source {}", source_id);
                continue;
            };

            match modification.change {
                Change::Reset => {
                    *applied = 0;
                    steps.push(Step::Remove { source_id, from: 0 });
                }
                Change::Invalidate(section) => {
                    *applied = (*applied).min(section.start);
                    steps.push(Step::Remove {
                        source_id,
                        from: section.start,
                    });
                }
                Change::Append(section) => {
                    // rows already merged are not merged twice
                    let start = section.start.max(*applied);
                    if start >= section.end() {
                        continue;
                    }
                    let section = Section::new(start, section.end() - start);
                    *applied = section.end();

                    let mut entries = vec![LogEntry::default(); section.count];
                    source.get_entries(Rows::Range(section), MERGE_COLUMNS, &mut entries);
                    steps.push(Step::Insert(create_records(source_id, &entries)));
                }
            }
        }

        steps
    }
}

/// Entries lacking an index, entry index or timestamp are left out; the
/// first two happen when the source was invalidated after announcing rows.
fn create_records(source_id: SourceId, entries: &[LogEntry]) -> Vec<MergedRecord> {
    entries
        .iter()
        .filter_map(|entry| {
            Some(MergedRecord {
                source_id,
                source_line: entry.index?,
                source_entry_index: entry.entry_index?,
                merged_entry_index: 0,
                timestamp: entry.timestamp?,
            })
        })
        .collect()
}

/// position after the last record not newer than `record`, scanning from the tail
fn insertion_position(records: &[MergedRecord], record: &MergedRecord) -> usize {
    records
        .iter()
        .rposition(|held| record.timestamp >= held.timestamp)
        .map_or(0, |position| position + 1)
}

/// re-derive merged entry indices from `start` onwards
fn renumber(records: &mut [MergedRecord], start: usize) {
    let mut previous = start
        .checked_sub(1)
        .and_then(|index| records.get(index))
        .copied();
    for record in records.iter_mut().skip(start) {
        record.merged_entry_index = match previous {
            Some(previous) if previous.same_entry(record) => previous.merged_entry_index,
            Some(previous) => previous.merged_entry_index + 1,
            None => 0,
        };
        previous = Some(*record);
    }
}
