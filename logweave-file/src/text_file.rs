use crate::metadata::{self, MetaSnap};
use anyhow::Result;
use chrono::{DateTime, Local, NaiveDateTime};
use logweave_core::{
    CancellationToken, ColumnId, LineParser, ListenerCollection, LogEntry, LogSource,
    PeriodicTask, PipelineDesc, Rows, SourceError, SourceProperties, Subscription, TaskId,
    TaskScheduler,
};
use memmap2::MmapOptions;
use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

/// upper bound on bytes consumed per tick
const MAX_READ_BYTES: u64 = 4 * 1024 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct ReadState {
    /// bytes up to and including the last newline read
    offset: u64,
    /// bytes after `offset` held by an unterminated last line
    partial_len: u64,
    prev_meta: Option<MetaSnap>,
    error: Option<SourceError>,
}

impl ReadState {
    fn consumed(&self) -> u64 {
        self.offset + self.partial_len
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LineStats {
    start_timestamp: Option<NaiveDateTime>,
    end_timestamp: Option<NaiveDateTime>,
    max_characters_per_line: usize,
}

impl LineStats {
    fn widen(&mut self, entry: &LogEntry) {
        self.max_characters_per_line = self
            .max_characters_per_line
            .max(entry.raw_content.chars().count());
        if let Some(timestamp) = entry.timestamp {
            self.start_timestamp = Some(self.start_timestamp.map_or(timestamp, |t| t.min(timestamp)));
            self.end_timestamp = Some(self.end_timestamp.map_or(timestamp, |t| t.max(timestamp)));
        }
    }
}

#[derive(Default)]
struct Lines {
    entries: Vec<LogEntry>,
    /// covers terminated lines only, an unterminated last line may still change
    complete: LineStats,
    partial: bool,
}

impl Lines {
    fn stats(&self) -> LineStats {
        let mut stats = self.complete;
        if self.partial
            && let Some(last) = self.entries.last()
        {
            stats.widen(last);
        }
        stats
    }
}

struct Shared {
    path: PathBuf,
    parser: Arc<dyn LineParser>,
    listeners: ListenerCollection,
    lines: RwLock<Lines>,
    state: Mutex<ReadState>,
    properties: Mutex<SourceProperties>,
    poll_interval: Duration,
}

/// Tails a text file, one row per line.
///
/// Growth is read incrementally. A truncated or replaced file is read again
/// from the start after a reset. An unterminated last line is shown as is and
/// replaced once the rest of it arrives.
pub struct TextLogSource {
    shared: Arc<Shared>,
    scheduler: Arc<dyn TaskScheduler>,
    task: TaskId,
}

impl TextLogSource {
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        path: impl Into<PathBuf>,
        parser: Arc<dyn LineParser>,
        desc: &PipelineDesc,
    ) -> Self {
        let shared = Arc::new(Shared {
            path: path.into(),
            parser,
            listeners: ListenerCollection::new(),
            lines: RwLock::new(Lines::default()),
            state: Mutex::new(ReadState::default()),
            properties: Mutex::new(SourceProperties::default()),
            poll_interval: desc.poll_interval,
        });
        log::debug!("TextLogSource: Tailing {}", shared.path.display());
        let task = scheduler.start_periodic(shared.clone());

        Self {
            shared,
            scheduler,
            task,
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }
}

impl Drop for TextLogSource {
    fn drop(&mut self) {
        self.scheduler.stop_periodic(self.task);
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\r')
        .to_string()
}

impl Shared {
    fn read_lines(&self) -> RwLockReadGuard<'_, Lines> {
        self.lines.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_lines(&self) -> RwLockWriteGuard<'_, Lines> {
        self.lines.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn clear(&self, state: &mut ReadState) {
        let had_content = state.consumed() > 0;
        state.offset = 0;
        state.partial_len = 0;
        *self.write_lines() = Lines::default();
        if had_content {
            self.listeners.reset();
        }
    }

    fn fail(&self, state: &mut ReadState, err: &io::Error) {
        let error = match err.kind() {
            io::ErrorKind::NotFound => SourceError::DoesNotExist,
            _ => SourceError::CannotBeAccessed,
        };
        if state.error != Some(error) {
            log::debug!("TextLogSource: {}: {}", self.path.display(), err);
        }
        state.error = Some(error);
        state.prev_meta = None;
        self.clear(state);

        *lock(&self.properties) = SourceProperties {
            end_of_source_reached: true,
            error: Some(error),
            ..Default::default()
        };
    }

    /// read new bytes up to `len`, returns the number of lines added or replaced
    fn read_delta(&self, state: &mut ReadState, len: u64) -> Result<usize> {
        let start = state.offset;
        if len.min(start + MAX_READ_BYTES) <= start {
            return Ok(0);
        }

        let file = File::open(&self.path)?;
        // the file may have shrunk since `len` was taken, mapping past its end faults
        let end = len
            .min(file.metadata()?.len())
            .min(start + MAX_READ_BYTES);
        if end <= start {
            return Ok(0);
        }
        let capped = end == start + MAX_READ_BYTES && end < len;

        let mmap = unsafe { MmapOptions::new().len(end as usize).map(&file)? };
        let end = (end as usize).min(mmap.len());
        let start = (start as usize).min(end);
        let bytes = &mmap[start..end];

        let complete_len = match bytes.iter().rposition(|b| *b == b'\n') {
            Some(position) => position + 1,
            // a line longer than one read is split
            None if capped => bytes.len(),
            None => 0,
        };
        let (complete, partial) = bytes.split_at(complete_len);

        let mut texts: Vec<String> = Vec::new();
        if !complete.is_empty() {
            let complete = complete.strip_suffix(b"\n").unwrap_or(complete);
            texts.extend(complete.split(|b| *b == b'\n').map(decode));
        }

        let had_partial = state.partial_len > 0;
        let (first_new, count) = {
            let mut guard = self.write_lines();
            let lines = &mut *guard;
            if had_partial {
                // never counted into the stats, nothing to take back
                lines.entries.pop();
            }
            let first_new = lines.entries.len();
            for text in texts {
                self.push_line(lines, text);
                if let Some(last) = lines.entries.last() {
                    lines.complete.widen(last);
                }
            }
            lines.partial = !partial.is_empty();
            if lines.partial {
                self.push_line(lines, decode(partial));
            }
            (first_new, lines.entries.len())
        };

        if had_partial {
            self.listeners.invalidate(first_new, 1);
        }
        self.listeners.on_read(count);

        state.offset = (start + complete_len) as u64;
        state.partial_len = partial.len() as u64;
        Ok(count - first_new)
    }

    fn push_line(&self, lines: &mut Lines, raw_content: String) {
        let index = lines.entries.len();
        let parsed = self.parser.parse(&raw_content);

        lines.entries.push(LogEntry {
            index: Some(index),
            original_index: Some(index),
            entry_index: Some(index),
            line_number: index + 1,
            source_id: None,
            raw_content,
            level: parsed.level,
            timestamp: parsed.timestamp,
        });
    }

    fn tick(&self, token: &CancellationToken) -> Duration {
        let mut state = lock(&self.state);

        let meta = match metadata::stat_path(&self.path) {
            Ok(meta) => meta,
            Err(e) => {
                self.fail(&mut state, &e);
                return self.poll_interval;
            }
        };
        if !metadata::has_changed(&state.prev_meta, &meta) && state.consumed() >= meta.len {
            return self.poll_interval;
        }
        if state.error.take().is_some() {
            log::debug!("TextLogSource: {} is available", self.path.display());
        }

        if metadata::is_replaced(&state.prev_meta, &meta, state.consumed()) {
            log::debug!(
                "TextLogSource: {} was truncated or replaced, reading from start",
                self.path.display()
            );
            self.clear(&mut state);
        }

        let mut read = 0;
        if state.consumed() < meta.len && !token.is_cancelled() {
            match self.read_delta(&mut state, meta.len) {
                Ok(n) => read = n,
                Err(e) => {
                    log::debug!("TextLogSource: Error reading delta: {}", e);
                    state.error = Some(SourceError::CannotBeAccessed);
                }
            }
        }
        state.prev_meta = Some(meta);
        self.listeners.flush();

        let caught_up = state.consumed() >= meta.len;
        {
            let stats = self.read_lines().stats();
            *lock(&self.properties) = SourceProperties {
                end_of_source_reached: caught_up,
                error: state.error,
                size: meta.len,
                last_modified: meta.modified.map(DateTime::<Local>::from),
                created: meta.created.map(DateTime::<Local>::from),
                start_timestamp: stats.start_timestamp,
                end_timestamp: stats.end_timestamp,
                max_characters_per_line: stats.max_characters_per_line,
            };
        }

        if read > 0 || !caught_up {
            Duration::ZERO
        } else {
            self.poll_interval
        }
    }
}

impl PeriodicTask for Shared {
    fn run_once(&self, token: &CancellationToken) -> Duration {
        self.tick(token)
    }

    fn name(&self) -> &str {
        "text-file"
    }
}

impl LogSource for TextLogSource {
    fn count(&self) -> usize {
        self.shared.read_lines().entries.len()
    }

    fn subscribe(&self, max_wait: Duration, max_batch: usize) -> Subscription {
        self.shared.listeners.subscribe(max_wait, max_batch)
    }

    fn unsubscribe(&self, subscription: &Subscription) {
        self.shared.listeners.unsubscribe(subscription);
    }

    fn get_entries(&self, rows: Rows<'_>, columns: &[ColumnId], dest: &mut [LogEntry]) {
        let lines = self.shared.read_lines();
        for (row, slot) in rows.iter().zip(dest.iter_mut()) {
            match lines.entries.get(row) {
                Some(entry) => slot.copy_columns(entry, columns),
                None => slot.clear_columns(columns),
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
    use logweave_core::{
        Change, Level, LogSourceExt, ManualTaskScheduler, NoLevelParser, ParsedLine, Section,
    };
    use std::{fs, io::Write};

    struct KeywordParser;

    impl LineParser for KeywordParser {
        fn parse(&self, raw: &str) -> ParsedLine {
            ParsedLine {
                level: if raw.starts_with("INFO") {
                    Level::Info
                } else {
                    Level::None
                },
                timestamp: None,
            }
        }
    }

    fn setup(path: &Path) -> (Arc<ManualTaskScheduler>, TextLogSource, Subscription) {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = TextLogSource::new(
            scheduler.clone(),
            path,
            Arc::new(KeywordParser),
            &PipelineDesc::default(),
        );
        let sub = source.subscribe(Duration::ZERO, 1000);
        (scheduler, source, sub)
    }

    fn contents(source: &TextLogSource) -> Vec<String> {
        source.raw_lines(Section::new(0, source.count()))
    }

    #[test]
    fn test_reads_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "INFO started\r\n  detail\n").unwrap();

        let (scheduler, source, sub) = setup(&path);
        scheduler.run_once();

        assert_eq!(contents(&source), vec!["INFO started", "  detail"]);
        assert_eq!(sub.drain(), vec![Change::Reset, Change::append(0, 2)]);

        let first = source.entry(0);
        assert_eq!(first.level, Level::Info);
        assert_eq!(first.line_number, 1);
        assert_eq!(first.entry_index, Some(0));

        let properties = source.properties();
        assert!(properties.end_of_source_reached);
        assert_eq!(properties.size, 23);
        assert_eq!(properties.max_characters_per_line, 12);
        assert_eq!(properties.error, None);
    }

    #[test]
    fn test_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "a\n").unwrap();
        let (scheduler, source, sub) = setup(&path);
        scheduler.run_once();
        sub.drain();

        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"b\nc\n").unwrap();
        scheduler.run_once();

        assert_eq!(contents(&source), vec!["a", "b", "c"]);
        assert_eq!(sub.drain(), vec![Change::append(1, 2)]);
    }

    #[test]
    fn test_partial_last_line_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "INFO a\nINFO b").unwrap();
        let (scheduler, source, sub) = setup(&path);
        scheduler.run_once();
        assert_eq!(contents(&source), vec!["INFO a", "INFO b"]);
        sub.drain();

        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b" more\nc\n").unwrap();
        scheduler.run_once();

        assert_eq!(contents(&source), vec!["INFO a", "INFO b more", "c"]);
        assert_eq!(sub.drain(), vec![Change::invalidate(1, 1), Change::append(1, 2)]);
    }

    struct SecondsParser;

    impl LineParser for SecondsParser {
        fn parse(&self, raw: &str) -> ParsedLine {
            let timestamp = raw
                .split_whitespace()
                .next()
                .and_then(|token| token.parse::<u32>().ok())
                .and_then(second);
            ParsedLine {
                level: Level::None,
                timestamp,
            }
        }
    }

    fn second(seconds: u32) -> Option<NaiveDateTime> {
        chrono::NaiveDate::from_ymd_opt(2024, 1, 1).and_then(|date| date.and_hms_opt(0, 0, seconds))
    }

    #[test]
    fn test_replaced_partial_line_leaves_no_stats_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "30 first\n5").unwrap();
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = TextLogSource::new(
            scheduler.clone(),
            &path,
            Arc::new(SecondsParser),
            &PipelineDesc::default(),
        );
        scheduler.run_once();
        let properties = source.properties();
        assert_eq!(properties.start_timestamp, second(5));
        assert_eq!(properties.end_timestamp, second(30));

        // "5" turns out to be the start of "59"
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"9 done\n").unwrap();
        scheduler.run_once();

        assert_eq!(contents(&source), vec!["30 first", "59 done"]);
        let properties = source.properties();
        assert_eq!(properties.start_timestamp, second(30));
        assert_eq!(properties.end_timestamp, second(59));
        assert_eq!(properties.max_characters_per_line, 8);
    }

    #[test]
    fn test_read_stops_at_actual_file_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "a\nb\n").unwrap();
        let (_scheduler, source, _sub) = setup(&path);

        // a stale length larger than the file, as after a truncation
        let mut state = ReadState::default();
        let read = source.shared.read_delta(&mut state, 100).unwrap();

        assert_eq!(read, 2);
        assert_eq!(state.offset, 4);
        assert_eq!(state.partial_len, 0);
        assert_eq!(contents(&source), vec!["a", "b"]);
    }

    #[test]
    fn test_truncation_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "first\nsecond\n").unwrap();
        let (scheduler, source, sub) = setup(&path);
        scheduler.run_once();
        sub.drain();

        fs::write(&path, "new\n").unwrap();
        scheduler.run_once();

        assert_eq!(contents(&source), vec!["new"]);
        assert_eq!(sub.drain(), vec![Change::Reset, Change::append(0, 1)]);
    }

    #[cfg(unix)]
    #[test]
    fn test_rotation_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "old\n").unwrap();
        let (scheduler, source, sub) = setup(&path);
        scheduler.run_once();
        sub.drain();

        let rotated = dir.path().join("app.log.new");
        fs::write(&rotated, "x\ny\nz\n").unwrap();
        fs::rename(&rotated, &path).unwrap();
        scheduler.run_once();

        assert_eq!(contents(&source), vec!["x", "y", "z"]);
        assert_eq!(sub.drain(), vec![Change::Reset, Change::append(0, 3)]);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.log");
        let (scheduler, source, _sub) = setup(&path);
        scheduler.run_once();

        let properties = source.properties();
        assert_eq!(properties.error, Some(SourceError::DoesNotExist));
        assert!(properties.end_of_source_reached);
        assert_eq!(source.count(), 0);

        fs::write(&path, "hello\n").unwrap();
        scheduler.run_once();
        assert_eq!(source.properties().error, None);
        assert_eq!(contents(&source), vec!["hello"]);
    }

    #[test]
    fn test_deleted_file_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "hello\n").unwrap();
        let (scheduler, source, sub) = setup(&path);
        scheduler.run_once();
        sub.drain();

        fs::remove_file(&path).unwrap();
        scheduler.run_once();
        assert_eq!(source.count(), 0);
        assert_eq!(sub.drain(), vec![Change::Reset]);
        assert_eq!(source.properties().error, Some(SourceError::DoesNotExist));
    }

    #[test]
    fn test_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.log");
        fs::write(&path, "").unwrap();
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let source = TextLogSource::new(
            scheduler.clone(),
            &path,
            Arc::new(NoLevelParser),
            &PipelineDesc::default(),
        );
        scheduler.run_once();
        assert_eq!(source.count(), 0);
        assert!(source.end_of_source_reached());
    }
}
