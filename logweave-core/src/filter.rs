//! Row and entry predicates used by [`crate::FilteredLogSource`].
//!
//! A filter is asked twice: once per logical entry (all rows sharing an
//! entry index) and once per row of an entry that passed. The default entry
//! check accepts an entry as soon as one of its rows passes.

use crate::{
    desc::PipelineDesc,
    source::{Level, LogEntry},
};
use regex::{Regex, RegexBuilder};

pub trait LogEntryFilter: Send + Sync {
    fn passes_line(&self, line: &LogEntry) -> bool;

    fn passes_entry(&self, lines: &[LogEntry]) -> bool {
        lines.iter().any(|line| self.passes_line(line))
    }
}

/// Keeps rows whose level is one of a fixed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelFilter {
    levels: Vec<Level>,
}

impl LevelFilter {
    pub fn new(levels: impl IntoIterator<Item = Level>) -> Self {
        Self {
            levels: levels.into_iter().collect(),
        }
    }

    /// `level` and everything more severe; rows without a level never pass
    pub fn at_least(level: Level) -> Self {
        Self::new(
            [
                Level::Trace,
                Level::Debug,
                Level::Info,
                Level::Warning,
                Level::Error,
                Level::Fatal,
            ]
            .into_iter()
            .filter(|candidate| *candidate >= level),
        )
    }
}

impl LogEntryFilter for LevelFilter {
    fn passes_line(&self, line: &LogEntry) -> bool {
        self.levels.contains(&line.level)
    }
}

/// Plain text containment.
#[derive(Debug, Clone)]
pub struct SubstringFilter {
    term: String,
    ignore_case: bool,
}

impl SubstringFilter {
    pub fn new(term: impl Into<String>, ignore_case: bool) -> Self {
        let term = term.into();
        Self {
            term: if ignore_case { term.to_lowercase() } else { term },
            ignore_case,
        }
    }
}

impl LogEntryFilter for SubstringFilter {
    fn passes_line(&self, line: &LogEntry) -> bool {
        if self.ignore_case {
            line.raw_content.to_lowercase().contains(&self.term)
        } else {
            line.raw_content.contains(&self.term)
        }
    }
}

/// A row passes when the expression matches anywhere in it.
#[derive(Debug, Clone)]
pub struct RegexFilter {
    regex: Regex,
}

impl RegexFilter {
    pub fn new(pattern: &str, ignore_case: bool) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(ignore_case)
            .build()?;
        Ok(Self { regex })
    }
}

impl LogEntryFilter for RegexFilter {
    fn passes_line(&self, line: &LogEntry) -> bool {
        self.regex.is_match(&line.raw_content)
    }
}

/// Hides rows made of whitespace only.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyLogLineFilter;

impl LogEntryFilter for EmptyLogLineFilter {
    fn passes_line(&self, line: &LogEntry) -> bool {
        !line.raw_content.trim().is_empty()
    }
}

pub struct InvertFilter {
    inner: Box<dyn LogEntryFilter>,
}

impl InvertFilter {
    pub fn new(inner: Box<dyn LogEntryFilter>) -> Self {
        Self { inner }
    }
}

impl LogEntryFilter for InvertFilter {
    fn passes_line(&self, line: &LogEntry) -> bool {
        !self.inner.passes_line(line)
    }

    fn passes_entry(&self, lines: &[LogEntry]) -> bool {
        !self.inner.passes_entry(lines)
    }
}

/// Every filter of the chain has to pass. An empty chain passes everything.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn LogEntryFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Box<dyn LogEntryFilter>) {
        self.filters.push(filter);
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Build the entry filter configured by `desc`; `None` when nothing
    /// would be filtered.
    pub fn from_desc(desc: &PipelineDesc) -> Result<Option<Self>, regex::Error> {
        let mut chain = Self::new();
        if let Some(level) = desc.min_level {
            chain.push(Box::new(LevelFilter::at_least(level)));
        }
        if let Some(pattern) = desc.filter.as_deref().filter(|pattern| !pattern.is_empty()) {
            let filter: Box<dyn LogEntryFilter> = if desc.filter_is_regex {
                Box::new(RegexFilter::new(pattern, true)?)
            } else {
                Box::new(SubstringFilter::new(pattern, true))
            };
            chain.push(if desc.invert_filter {
                Box::new(InvertFilter::new(filter))
            } else {
                filter
            });
        }
        Ok((!chain.is_empty()).then_some(chain))
    }
}

impl LogEntryFilter for FilterChain {
    fn passes_line(&self, line: &LogEntry) -> bool {
        self.filters.iter().all(|filter| filter.passes_line(line))
    }

    fn passes_entry(&self, lines: &[LogEntry]) -> bool {
        self.filters.iter().all(|filter| filter.passes_entry(lines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(raw: &str, level: Level) -> LogEntry {
        LogEntry {
            index: Some(0),
            raw_content: raw.to_string(),
            level,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_line_filter() {
        let filter = EmptyLogLineFilter;
        assert!(!filter.passes_line(&LogEntry::default()));
        assert!(!filter.passes_line(&line("", Level::Info)));
        assert!(!filter.passes_line(&line(" ", Level::Info)));
        assert!(!filter.passes_line(&line(" \t \r\n", Level::Info)));
        assert!(filter.passes_line(&line(" s    \t", Level::Info)));
    }

    #[test]
    fn test_level_filter_at_least() {
        let filter = LevelFilter::at_least(Level::Warning);
        assert!(filter.passes_line(&line("", Level::Warning)));
        assert!(filter.passes_line(&line("", Level::Fatal)));
        assert!(!filter.passes_line(&line("", Level::Info)));
        assert!(!filter.passes_line(&line("", Level::None)));

        let everything = LevelFilter::at_least(Level::None);
        assert!(everything.passes_line(&line("", Level::Trace)));
        assert!(!everything.passes_line(&line("", Level::None)));
    }

    #[test]
    fn test_substring_filter_case() {
        let sensitive = SubstringFilter::new("Foo", false);
        assert!(sensitive.passes_line(&line("a Foo b", Level::None)));
        assert!(!sensitive.passes_line(&line("a foo b", Level::None)));

        let insensitive = SubstringFilter::new("Foo", true);
        assert!(insensitive.passes_line(&line("a fOO b", Level::None)));
    }

    #[test]
    fn test_regex_filter() {
        let filter = RegexFilter::new(r"id=\d+", false).unwrap();
        assert!(filter.passes_line(&line("request id=42 done", Level::None)));
        assert!(!filter.passes_line(&line("request id=x", Level::None)));
        assert!(RegexFilter::new("(", false).is_err());
    }

    #[test]
    fn test_entry_passes_when_any_line_does() {
        let filter = SubstringFilter::new("timeout", false);
        let entry = [
            line("ERROR request failed", Level::Error),
            line("  caused by: timeout", Level::Error),
        ];
        assert!(filter.passes_entry(&entry));
        assert!(!filter.passes_entry(&entry[..1]));
    }

    #[test]
    fn test_invert_filter_inverts_whole_entries() {
        let filter = InvertFilter::new(Box::new(SubstringFilter::new("timeout", false)));
        let entry = [
            line("ERROR request failed", Level::Error),
            line("  caused by: timeout", Level::Error),
        ];
        assert!(!filter.passes_entry(&entry));
        assert!(filter.passes_line(&entry[0]));
        assert!(!filter.passes_line(&entry[1]));
    }

    #[test]
    fn test_chain_from_desc() {
        assert!(FilterChain::from_desc(&PipelineDesc::default()).unwrap().is_none());

        let desc = PipelineDesc {
            min_level: Some(Level::Error),
            filter: Some("disk".to_string()),
            invert_filter: true,
            ..Default::default()
        };
        let chain = FilterChain::from_desc(&desc).unwrap().unwrap();
        assert!(chain.passes_line(&line("ERROR network down", Level::Error)));
        assert!(!chain.passes_line(&line("ERROR Disk full", Level::Error)));
        assert!(!chain.passes_line(&line("INFO network down", Level::Info)));

        let broken = PipelineDesc {
            filter: Some("[".to_string()),
            filter_is_regex: true,
            ..Default::default()
        };
        assert!(FilterChain::from_desc(&broken).is_err());
    }
}
