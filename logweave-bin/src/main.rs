use anyhow::{Context, Result, bail};
use clap::Parser;
use logweave_core::{
    Change, FilterChain, FilteredLogSource, InMemoryLogSource, Level, LineParser, LogEntry,
    LogSource, LogSourceExt, LogSourceSearch, MergedLogSource, MultiLineLogSource, PipelineDesc,
    Rows, Section, TaskScheduler, ThreadTaskScheduler,
};
use logweave_file::TextLogSource;
use logweave_parser::TextLineParser;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode, WriteLogger};
use std::{
    fs::File,
    io::{self, BufRead, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

/// how often the front end looks at the pipeline
const REFRESH_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Parser)]
#[command(version, about = "Tail, assemble, merge and search plain-text logs")]
struct Args {
    /// Log files to read, `-` reads standard input
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Case-insensitive text to search for
    #[arg(long, value_name = "TERM")]
    search: Option<String>,

    /// Hide entries less severe than this (trace, debug, info, warn, error, fatal)
    #[arg(long, value_name = "LEVEL")]
    level: Option<Level>,

    /// Only show entries containing this text (case-insensitive)
    #[arg(long, value_name = "TEXT")]
    filter: Option<String>,

    /// Interpret --filter as a regular expression
    #[arg(long, requires = "filter")]
    regex: bool,

    /// Hide the entries matching --filter instead
    #[arg(long, requires = "filter")]
    invert: bool,

    /// Treat every line as its own entry
    #[arg(long)]
    single_line: bool,

    /// Keep running and print rows as they arrive
    #[arg(long, short)]
    follow: bool,

    /// Write debug logs to this file
    #[arg(long, value_name = "PATH")]
    debug_log: Option<PathBuf>,

    /// Idle delay between file polls, in milliseconds
    #[arg(long, default_value_t = 100)]
    poll_interval_ms: u64,
}

impl Args {
    fn desc(&self) -> PipelineDesc {
        PipelineDesc {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            multi_line: !self.single_line,
            search_term: self.search.clone(),
            min_level: self.level,
            filter: self.filter.clone(),
            filter_is_regex: self.regex,
            invert_filter: self.invert,
            ..PipelineDesc::default()
        }
    }
}

fn setup_logger(debug_log: Option<&Path>) -> Result<()> {
    match debug_log {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot create debug log {}", path.display()))?;
            WriteLogger::init(LevelFilter::Debug, Config::default(), file)?;
        }
        None => TermLogger::init(
            LevelFilter::Warn,
            Config::default(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        )?,
    }
    Ok(())
}

/// A chain of sources ending in the view that gets printed.
struct Pipeline {
    inputs: Vec<(String, Arc<dyn LogSource>)>,
    view: Arc<dyn LogSource>,
    search: Option<LogSourceSearch>,
    multi_source: bool,
}

fn read_stdin(parser: &dyn LineParser) -> Result<Arc<InMemoryLogSource>> {
    let source = Arc::new(InMemoryLogSource::new());
    for line in io::stdin().lock().lines() {
        let line = line.context("cannot read standard input")?;
        let parsed = parser.parse(&line);
        source.add_entry(line, parsed.level, parsed.timestamp);
    }
    Ok(source)
}

fn build_pipeline(
    scheduler: Arc<dyn TaskScheduler>,
    files: &[PathBuf],
    desc: &PipelineDesc,
) -> Result<Pipeline> {
    let parser = Arc::new(TextLineParser::new());

    let mut inputs = Vec::with_capacity(files.len());
    for path in files {
        let source: Arc<dyn LogSource> = if path.as_os_str() == "-" {
            read_stdin(parser.as_ref())?
        } else {
            Arc::new(TextLogSource::new(
                scheduler.clone(),
                path,
                parser.clone(),
                desc,
            ))
        };
        inputs.push((path.display().to_string(), source));
    }

    let mut stages: Vec<Arc<dyn LogSource>> = inputs
        .iter()
        .map(|(_, source)| {
            if desc.multi_line {
                Arc::new(MultiLineLogSource::with_batch_size(
                    scheduler.clone(),
                    source.clone(),
                    desc.max_wait,
                    desc.max_batch_size,
                )) as Arc<dyn LogSource>
            } else {
                source.clone()
            }
        })
        .collect();

    let multi_source = stages.len() > 1;
    let mut view: Arc<dyn LogSource> = match stages.len() {
        0 => bail!("no input files"),
        1 => stages.remove(0),
        _ => Arc::new(MergedLogSource::new(scheduler.clone(), stages, desc.max_wait)),
    };

    let filter = FilterChain::from_desc(desc).context("invalid --filter expression")?;
    let filtered = filter.is_some();
    if let Some(filter) = filter {
        view = Arc::new(FilteredLogSource::with_batch_size(
            scheduler.clone(),
            view,
            None,
            Some(Arc::new(filter)),
            desc.max_wait,
            desc.max_batch_size,
        ));
    }

    let search = desc
        .search_term
        .as_ref()
        .map(|term| LogSourceSearch::new(scheduler.clone(), view.clone(), term.clone(), desc.max_wait));

    log::debug!(
        "Pipeline: {} input(s), multi-line: {}, filtered: {}, search: {:?}",
        inputs.len(),
        desc.multi_line,
        filtered,
        desc.search_term
    );

    Ok(Pipeline {
        inputs,
        view,
        search,
        multi_source,
    })
}

fn format_row(entry: &LogEntry, multi_source: bool, marker: char) -> String {
    let mut row = String::new();
    row.push(marker);
    if multi_source {
        if let Some(source_id) = entry.source_id {
            row.push_str(&format!("[{}] ", source_id));
        }
    }
    row.push_str(&entry.raw_content);
    row
}

impl Pipeline {
    fn is_complete(&self) -> bool {
        self.view.end_of_source_reached()
            && self
                .search
                .as_ref()
                .is_none_or(|search| search.is_caught_up())
    }

    fn report_errors(&self) {
        for (name, source) in &self.inputs {
            if let Some(error) = source.properties().error {
                eprintln!("{}: {}", name, error);
            }
        }
    }

    /// print the finished view, or only the matching rows when searching
    fn print_all(&self, out: &mut impl Write) -> Result<()> {
        let count = self.view.count();
        match &self.search {
            Some(search) => {
                let matches = search.matches();
                let mut rows: Vec<usize> = matches.iter().map(|m| m.line_index).collect();
                rows.dedup();
                for entry in self.view.entries(Rows::Indices(&rows)) {
                    writeln!(out, "{}", format_row(&entry, self.multi_source, ' '))?;
                }
                eprintln!("{} match(es) in {} row(s)", matches.len(), rows.len());
            }
            None => {
                for entry in self.view.entries(Rows::Range(Section::new(0, count))) {
                    writeln!(out, "{}", format_row(&entry, self.multi_source, ' '))?;
                }
            }
        }
        out.flush()?;
        Ok(())
    }

    fn follow(&self, desc: &PipelineDesc, out: &mut impl Write) -> Result<()> {
        let subscription = self.view.subscribe(desc.max_wait, desc.max_batch_size);
        let matches = self.search.as_ref().map(|search| search.subscribe());
        // rows below this were printed before, printing them again replaces them
        let mut printed = 0;

        loop {
            for change in subscription.drain() {
                match change {
                    Change::Reset if printed > 0 => eprintln!("-- reset --"),
                    Change::Append(section) => {
                        let entries = self.view.entries(Rows::Range(section));
                        for (row, entry) in section.indices().zip(&entries) {
                            let marker = if row < printed { '~' } else { ' ' };
                            writeln!(out, "{}", format_row(entry, self.multi_source, marker))?;
                        }
                        printed = printed.max(section.end());
                    }
                    _ => {}
                }
            }
            out.flush()?;

            if let Some(receiver) = &matches {
                if let Some(latest) = receiver.try_iter().last() {
                    eprintln!("-- {} match(es) --", latest.len());
                }
            }
            thread::sleep(REFRESH_INTERVAL);
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logger(args.debug_log.as_deref())?;

    let desc = args.desc();
    let scheduler: Arc<dyn TaskScheduler> = Arc::new(ThreadTaskScheduler::new());
    let pipeline = build_pipeline(scheduler, &args.files, &desc)?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    if args.follow {
        return pipeline.follow(&desc, &mut out);
    }

    while !pipeline.is_complete() {
        thread::sleep(REFRESH_INTERVAL);
    }
    pipeline.report_errors();
    pipeline.print_all(&mut out)
}
