//! Incremental substring search over a source.
//!
//! Only newly appended rows are scanned; invalidated rows drop their
//! matches. Subscribers receive the complete match list over a channel
//! whenever it changes.

use crate::{
    change::{Change, Section},
    desc::DEFAULT_MAX_BATCH_SIZE,
    listeners::{Subscription, lock},
    scheduler::{CancellationToken, PeriodicTask, TaskId, TaskScheduler},
    source::{LogSource, LogSourceExt},
};
use rayon::prelude::*;
use regex::{Regex, RegexBuilder};
use std::{
    sync::{
        Arc, Mutex,
        mpsc::{self, Receiver, Sender},
    },
    time::Duration,
};

/// rows scanned per tick
const SEARCH_BATCH_SIZE: usize = 10_000;
/// batches larger than this are scanned in parallel
const PARALLEL_THRESHOLD: usize = 1000;

/// One occurrence of the search term. `offset` and `length` are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogMatch {
    pub line_index: usize,
    pub offset: usize,
    pub length: usize,
}

impl LogMatch {
    pub fn new(line_index: usize, offset: usize, length: usize) -> Self {
        Self {
            line_index,
            offset,
            length,
        }
    }
}

#[derive(Default)]
struct SearchState {
    matcher: Option<Regex>,
    /// rows `[0, scanned)` have been searched
    scanned: usize,
    /// rows announced by the source
    known: usize,
    term_changed: bool,
}

struct Shared {
    source: Arc<dyn LogSource>,
    subscription: Subscription,
    term: Mutex<String>,
    state: Mutex<SearchState>,
    matches: Mutex<Vec<LogMatch>>,
    listeners: Mutex<Vec<Sender<Vec<LogMatch>>>>,
    max_wait: Duration,
}

pub struct LogSourceSearch {
    shared: Arc<Shared>,
    scheduler: Arc<dyn TaskScheduler>,
    task: TaskId,
}

/// case-insensitive literal matcher, `None` for an empty term
fn build_matcher(term: &str) -> Option<Regex> {
    if term.is_empty() {
        return None;
    }
    RegexBuilder::new(&regex::escape(term))
        .case_insensitive(true)
        .build()
        .inspect_err(|e| log::error!("Failed to build matcher for {:?}: {}", term, e))
        .ok()
}

impl LogSourceSearch {
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        source: Arc<dyn LogSource>,
        term: impl Into<String>,
        max_wait: Duration,
    ) -> Self {
        let term = term.into();
        let subscription = source.subscribe(max_wait, DEFAULT_MAX_BATCH_SIZE);
        let shared = Arc::new(Shared {
            source,
            subscription,
            state: Mutex::new(SearchState {
                matcher: build_matcher(&term),
                ..Default::default()
            }),
            term: Mutex::new(term),
            matches: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            max_wait,
        });
        let task = scheduler.start_periodic(shared.clone());

        Self {
            shared,
            scheduler,
            task,
        }
    }

    pub fn search_term(&self) -> String {
        lock(&self.shared.term).clone()
    }

    /// Replace the search term; every row is searched again on the next tick.
    pub fn set_search_term(&self, term: impl Into<String>) {
        let term = term.into();
        let mut current = lock(&self.shared.term);
        if *current == term {
            return;
        }

        let mut state = lock(&self.shared.state);
        state.matcher = build_matcher(&term);
        state.term_changed = true;
        log::debug!("Search term changed from {:?} to {:?}", *current, term);
        *current = term;
    }

    pub fn matches(&self) -> Vec<LogMatch> {
        lock(&self.shared.matches).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.shared.matches).len()
    }

    /// Every row announced by the source so far has been searched.
    pub fn is_caught_up(&self) -> bool {
        let state = lock(&self.shared.state);
        !state.term_changed
            && state.scanned >= state.known
            && state.known >= self.shared.source.count()
            && self.shared.subscription.is_caught_up()
    }

    /// Receive the full match list each time it changes, starting with the
    /// current one.
    pub fn subscribe(&self) -> Receiver<Vec<LogMatch>> {
        let (sender, receiver) = mpsc::channel();
        // a fresh receiver is always connected
        let _ = sender.send(self.matches());
        lock(&self.shared.listeners).push(sender);
        receiver
    }
}

impl Drop for LogSourceSearch {
    fn drop(&mut self) {
        self.scheduler.stop_periodic(self.task);
        self.shared.source.unsubscribe(&self.shared.subscription);
        lock(&self.shared.matches).clear();
    }
}

impl Shared {
    fn tick(&self, token: &CancellationToken) -> Duration {
        let mut state = lock(&self.state);
        let mut matches = lock(&self.matches).clone();
        let before = matches.len();
        let mut modified = false;
        let mut performed_work = false;

        if state.term_changed {
            state.term_changed = false;
            state.scanned = 0;
            matches.clear();
            modified = true;
        }

        while !token.is_cancelled() {
            let Some(change) = self.subscription.try_next() else {
                break;
            };
            match change {
                Change::Reset => {
                    state.known = 0;
                    state.scanned = 0;
                    matches.clear();
                    modified = true;
                }
                Change::Invalidate(section) => {
                    state.known = state.known.min(section.start);
                    state.scanned = state.scanned.min(section.start);
                    let kept = matches.len();
                    matches.retain(|m| m.line_index < section.start);
                    modified |= matches.len() != kept;
                }
                Change::Append(section) => state.known = state.known.max(section.end()),
            }
            performed_work = true;
        }

        if state.scanned < state.known && !token.is_cancelled() {
            let count = (state.known - state.scanned).min(SEARCH_BATCH_SIZE);
            if let Some(matcher) = &state.matcher {
                let lines = self.source.raw_lines(Section::new(state.scanned, count));
                let found = if lines.len() > PARALLEL_THRESHOLD {
                    scan_parallel(matcher, state.scanned, &lines)
                } else {
                    scan_sequential(matcher, state.scanned, &lines)
                };
                modified |= !found.is_empty();
                matches.extend(found);
            }
            state.scanned += count;
            performed_work = true;
        }

        if modified {
            log::debug!("Search matches changed: {} -> {}", before, matches.len());
            *lock(&self.matches) = matches.clone();
            lock(&self.listeners).retain(|listener| listener.send(matches.clone()).is_ok());
        }

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
        "search"
    }
}

fn find_in_line(matcher: &Regex, line_index: usize, line: &str) -> Vec<LogMatch> {
    matcher
        .find_iter(line)
        .map(|m| LogMatch::new(line_index, m.start(), m.len()))
        .collect()
}

fn scan_sequential(matcher: &Regex, first_line: usize, lines: &[String]) -> Vec<LogMatch> {
    lines
        .iter()
        .enumerate()
        .flat_map(|(offset, line)| find_in_line(matcher, first_line + offset, line))
        .collect()
}

fn scan_parallel(matcher: &Regex, first_line: usize, lines: &[String]) -> Vec<LogMatch> {
    // indexed parallel iterators keep the row order when collecting
    lines
        .par_iter()
        .enumerate()
        .flat_map_iter(|(offset, line)| find_in_line(matcher, first_line + offset, line))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{in_memory::InMemoryLogSource, scheduler::ManualTaskScheduler, source::Level};

    fn setup(term: &str) -> (Arc<ManualTaskScheduler>, Arc<InMemoryLogSource>, LogSourceSearch) {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = Arc::new(InMemoryLogSource::new());
        let search = LogSourceSearch::new(scheduler.clone(), source.clone(), term, Duration::ZERO);
        (scheduler, source, search)
    }

    #[test]
    fn test_empty_source_has_no_matches() {
        let (scheduler, _source, search) = setup("foobar");
        scheduler.run_once();
        assert!(search.matches().is_empty());
    }

    #[test]
    fn test_matches_in_single_line() {
        let (scheduler, source, search) = setup("l");
        source.add_entry("Hello World!", Level::None, None);
        scheduler.run_once();

        assert_eq!(search.count(), 3);
        assert_eq!(
            search.matches(),
            vec![
                LogMatch::new(0, 2, 1),
                LogMatch::new(0, 3, 1),
                LogMatch::new(0, 9, 1)
            ]
        );
    }

    #[test]
    fn test_case_insensitive_literal() {
        let (scheduler, source, search) = setup("a.B");
        source.add_entry("xA.bx", Level::None, None);
        source.add_entry("aXb", Level::None, None);
        scheduler.run_once();
        assert_eq!(search.matches(), vec![LogMatch::new(0, 1, 3)]);
    }

    #[test]
    fn test_only_new_rows_are_scanned() {
        let (scheduler, source, search) = setup("foo");
        source.add_entry("foo", Level::None, None);
        scheduler.run_once();
        source.add_entry("bar", Level::None, None);
        source.add_entry("a foo", Level::None, None);
        scheduler.run_once();

        assert_eq!(
            search.matches(),
            vec![LogMatch::new(0, 0, 3), LogMatch::new(2, 2, 3)]
        );
    }

    #[test]
    fn test_invalidated_rows_drop_matches() {
        let (scheduler, source, search) = setup("foo");
        source.add_entry("foo", Level::None, None);
        source.add_entry("foo foo", Level::None, None);
        scheduler.run_once();
        assert_eq!(search.count(), 3);

        source.remove_from(1);
        scheduler.run_once();
        assert_eq!(search.matches(), vec![LogMatch::new(0, 0, 3)]);

        source.clear();
        scheduler.run_once();
        assert!(search.matches().is_empty());
    }

    #[test]
    fn test_term_change_rescans() {
        let (scheduler, source, search) = setup("foo");
        source.add_entry("foo bar", Level::None, None);
        scheduler.run_once();
        assert_eq!(search.count(), 1);

        search.set_search_term("bar");
        scheduler.run_once();
        assert_eq!(search.matches(), vec![LogMatch::new(0, 4, 3)]);

        search.set_search_term("");
        scheduler.run_once();
        assert!(search.matches().is_empty());
    }

    #[test]
    fn test_subscriber_receives_updates() {
        let (scheduler, source, search) = setup("l");
        let receiver = search.subscribe();
        assert_eq!(receiver.try_recv().ok(), Some(vec![]));

        source.add_entry("Hello World!", Level::None, None);
        scheduler.run_once();
        assert_eq!(receiver.try_recv().ok().map(|matches| matches.len()), Some(3));

        // nothing changed, nothing sent
        scheduler.run_once();
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_large_batch_keeps_row_order() {
        let (scheduler, source, search) = setup("x");
        for i in 0..2500 {
            let line = if i % 2 == 0 { "x" } else { "y" };
            source.add_entry(line, Level::None, None);
        }
        scheduler.run_once();

        let matches = search.matches();
        assert_eq!(matches.len(), 1250);
        assert!(matches.windows(2).all(|pair| pair[0].line_index < pair[1].line_index));
    }

    #[test]
    fn test_caught_up() {
        let (scheduler, source, search) = setup("x");
        scheduler.run_once();
        assert!(search.is_caught_up());

        source.add_entry("x", Level::None, None);
        assert!(!search.is_caught_up());
        scheduler.run_once();
        assert!(search.is_caught_up());

        search.set_search_term("y");
        assert!(!search.is_caught_up());
        scheduler.run_once();
        assert!(search.is_caught_up());
    }

    #[test]
    fn test_cancelled_tick_resumes_from_cursor() {
        let (scheduler, source, search) = setup("foo");
        source.add_entry("foo", Level::None, None);
        scheduler.run_once();
        source.add_entry("a foo", Level::None, None);

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        search.shared.run_once(&cancelled);
        assert_eq!(search.matches(), vec![LogMatch::new(0, 0, 3)]);
        assert!(!search.is_caught_up());

        scheduler.run_once();
        assert_eq!(
            search.matches(),
            vec![LogMatch::new(0, 0, 3), LogMatch::new(1, 2, 3)]
        );
        assert!(search.is_caught_up());
    }

    #[test]
    fn test_drop_stops_task() {
        let (scheduler, _source, search) = setup("x");
        assert_eq!(scheduler.periodic_task_count(), 1);
        drop(search);
        assert_eq!(scheduler.periodic_task_count(), 0);
    }
}
