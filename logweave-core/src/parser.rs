use crate::source::Level;
use chrono::NaiveDateTime;

/// What a parser recognized in one raw line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParsedLine {
    pub level: Level,
    pub timestamp: Option<NaiveDateTime>,
}

/// Extracts per-line attributes from raw text.
///
/// Runs on the tailing thread of a raw source, so it must be cheap and
/// thread-safe.
pub trait LineParser: Send + Sync {
    fn parse(&self, raw: &str) -> ParsedLine;
}

/// treats every line as level-less and untimestamped
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLevelParser;

impl LineParser for NoLevelParser {
    fn parse(&self, _raw: &str) -> ParsedLine {
        ParsedLine::default()
    }
}
