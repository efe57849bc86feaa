use crate::source::Level;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_MAX_WAIT_MS: u64 = 100;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10_000;

/// Tuning knobs of a processing pipeline.
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    /// idle delay between ticks of a component with nothing to do
    pub poll_interval: Duration,
    /// longest a subscriber waits for a partial batch of appends
    pub max_wait: Duration,
    /// upper bound on rows handled per tick and rows per append
    pub max_batch_size: usize,
    pub multi_line: bool,
    pub search_term: Option<String>,
    /// hide rows less severe than this
    pub min_level: Option<Level>,
    /// hide entries not containing this text
    pub filter: Option<String>,
    pub filter_is_regex: bool,
    /// hide the entries matching `filter` instead
    pub invert_filter: bool,
}

impl Default for PipelineDesc {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_wait: Duration::from_millis(DEFAULT_MAX_WAIT_MS),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            multi_line: true,
            search_term: None,
            min_level: None,
            filter: None,
            filter_is_regex: false,
            invert_filter: false,
        }
    }
}

impl PipelineDesc {
    pub fn new() -> Self {
        Self::default()
    }
}
