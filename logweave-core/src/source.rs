//! The indexed-source contract shared by every component.
//!
//! A [`LogSource`] is a growing, row-indexed table. Rows are read in bulk
//! through [`LogSource::get_entries`], which fills only the requested
//! [`ColumnId`]s of a caller-provided buffer. Rows that do not exist (yet)
//! come back with the column defaults of [`LogEntry::default`].

use crate::listeners::Subscription;
use crate::change::Section;
use chrono::{DateTime, Local, NaiveDateTime};
use itertools::Either;
use std::{fmt, str::FromStr, time::Duration};
use thiserror::Error;

/// position of a source within a merged source set
pub type SourceId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Level {
    /// no recognizable level marker
    #[default]
    None,
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl Level {
    pub fn is_none(&self) -> bool {
        matches!(self, Level::None)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::None => "",
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARN",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown level {0:?}")]
pub struct ParseLevelError(String);

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warning),
            "error" => Ok(Level::Error),
            "fatal" => Ok(Level::Fatal),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

/// sticky failure state of a source, reported as a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum SourceError {
    #[error("source does not exist")]
    DoesNotExist,
    #[error("source cannot be accessed")]
    CannotBeAccessed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnId {
    /// row index within the source answering the query
    Index,
    /// row index within the source the row originally came from
    OriginalIndex,
    /// logical (possibly multi-line) entry the row belongs to
    EntryIndex,
    /// one-based physical line number
    LineNumber,
    SourceId,
    RawContent,
    Level,
    Timestamp,
}

impl ColumnId {
    pub const ALL: &'static [ColumnId] = &[
        ColumnId::Index,
        ColumnId::OriginalIndex,
        ColumnId::EntryIndex,
        ColumnId::LineNumber,
        ColumnId::SourceId,
        ColumnId::RawContent,
        ColumnId::Level,
        ColumnId::Timestamp,
    ];
}

/// One row of a source. `Default` is the invalid row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogEntry {
    pub index: Option<usize>,
    pub original_index: Option<usize>,
    pub entry_index: Option<usize>,
    pub line_number: usize,
    pub source_id: Option<SourceId>,
    pub raw_content: String,
    pub level: Level,
    pub timestamp: Option<NaiveDateTime>,
}

impl LogEntry {
    pub fn is_valid(&self) -> bool {
        self.index.is_some()
    }

    /// copy the given columns from `other`, leaving the rest untouched
    pub fn copy_columns(&mut self, other: &LogEntry, columns: &[ColumnId]) {
        for column in columns {
            match column {
                ColumnId::Index => self.index = other.index,
                ColumnId::OriginalIndex => self.original_index = other.original_index,
                ColumnId::EntryIndex => self.entry_index = other.entry_index,
                ColumnId::LineNumber => self.line_number = other.line_number,
                ColumnId::SourceId => self.source_id = other.source_id,
                ColumnId::RawContent => self.raw_content.clone_from(&other.raw_content),
                ColumnId::Level => self.level = other.level,
                ColumnId::Timestamp => self.timestamp = other.timestamp,
            }
        }
    }

    /// set the given columns back to their defaults
    pub fn clear_columns(&mut self, columns: &[ColumnId]) {
        self.copy_columns(&LogEntry::default(), columns);
    }
}

/// Rows requested from a source: a contiguous section or explicit indices.
#[derive(Debug, Clone, Copy)]
pub enum Rows<'a> {
    Range(Section),
    Indices(&'a [usize]),
}

impl Rows<'_> {
    pub fn len(&self) -> usize {
        match self {
            Rows::Range(section) => section.count,
            Rows::Indices(indices) => indices.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        match self {
            Rows::Range(section) => Either::Left(section.indices()),
            Rows::Indices(indices) => Either::Right(indices.iter().copied()),
        }
    }
}

impl From<Section> for Rows<'_> {
    fn from(section: Section) -> Self {
        Rows::Range(section)
    }
}

impl<'a> From<&'a [usize]> for Rows<'a> {
    fn from(indices: &'a [usize]) -> Self {
        Rows::Indices(indices)
    }
}

/// Scalar properties of a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceProperties {
    pub end_of_source_reached: bool,
    pub error: Option<SourceError>,
    /// bytes
    pub size: u64,
    pub last_modified: Option<DateTime<Local>>,
    pub created: Option<DateTime<Local>>,
    pub start_timestamp: Option<NaiveDateTime>,
    pub end_timestamp: Option<NaiveDateTime>,
    pub max_characters_per_line: usize,
}

/// Capability every component implements; components compose by wrapping
/// `Arc<dyn LogSource>`.
pub trait LogSource: Send + Sync {
    fn count(&self) -> usize;

    /// Start receiving changes of this source.
    ///
    /// The returned subscription first yields a reset, followed by appends
    /// covering the rows that already exist.
    fn subscribe(&self, max_wait: Duration, max_batch: usize) -> Subscription;

    fn unsubscribe(&self, subscription: &Subscription);

    /// Fill `columns` of `dest[i]` with row `rows[i]`.
    ///
    /// `dest` must hold at least `rows.len()` entries; to write at an offset
    /// pass a sub-slice. Rows out of range get the column defaults.
    fn get_entries(&self, rows: Rows<'_>, columns: &[ColumnId], dest: &mut [LogEntry]);

    fn properties(&self) -> SourceProperties;

    fn end_of_source_reached(&self) -> bool {
        self.properties().end_of_source_reached
    }
}

/// Convenience readers on top of [`LogSource::get_entries`].
pub trait LogSourceExt: LogSource {
    fn get_column(&self, rows: Rows<'_>, column: ColumnId, dest: &mut [LogEntry]) {
        self.get_entries(rows, &[column], dest);
    }

    fn entries(&self, rows: Rows<'_>) -> Vec<LogEntry> {
        let mut dest = vec![LogEntry::default(); rows.len()];
        self.get_entries(rows, ColumnId::ALL, &mut dest);
        dest
    }

    fn entry(&self, index: usize) -> LogEntry {
        let mut dest = [LogEntry::default()];
        self.get_entries(Rows::Range(Section::new(index, 1)), ColumnId::ALL, &mut dest);
        let [entry] = dest;
        entry
    }

    fn raw_lines(&self, section: Section) -> Vec<String> {
        let mut dest = vec![LogEntry::default(); section.count];
        self.get_entries(Rows::Range(section), &[ColumnId::RawContent], &mut dest);
        dest.into_iter().map(|entry| entry.raw_content).collect()
    }
}

impl<T: LogSource + ?Sized> LogSourceExt for T {}
