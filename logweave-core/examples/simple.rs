//! Simple example: an in-memory source fed by a producer thread.
//!
//! This demonstrates the smallest useful pipeline:
//! - Append raw lines to an `InMemoryLogSource`
//! - Assemble them into entries with `MultiLineLogSource`
//! - Search the entries with `LogSourceSearch`
//!
//! Run with: cargo run --example simple

use logweave_core::{
    InMemoryLogSource, Level, LogSource, LogSourceExt, LogSourceSearch, MultiLineLogSource,
    PipelineDesc, Rows, Section, ThreadTaskScheduler,
};
use std::{sync::Arc, thread, time::Duration};

fn main() {
    let desc = PipelineDesc::default();
    let scheduler = Arc::new(ThreadTaskScheduler::new());
    let raw = Arc::new(InMemoryLogSource::new());
    let entries = Arc::new(MultiLineLogSource::new(
        scheduler.clone(),
        raw.clone(),
        desc.max_wait,
    ));
    let search = LogSourceSearch::new(scheduler.clone(), entries.clone(), "timeout", desc.max_wait);

    // generate a request log with an occasional stack of detail lines
    let producer = {
        let raw = raw.clone();
        thread::spawn(move || {
            for counter in 1..=20 {
                if counter % 5 == 0 {
                    raw.add_entry(format!("request #{} failed", counter), Level::Error, None);
                    raw.add_entry("  caused by: timeout", Level::None, None);
                } else {
                    raw.add_entry(format!("request #{} ok", counter), Level::Info, None);
                }
                thread::sleep(Duration::from_millis(10));
            }
        })
    };
    let _ = producer.join();

    while !entries.end_of_source_reached() || !search.is_caught_up() {
        thread::sleep(Duration::from_millis(10));
    }

    for entry in entries.entries(Rows::Range(Section::new(0, entries.count()))) {
        println!(
            "{:>3} {:<5} {}",
            entry.entry_index.unwrap_or_default(),
            entry.level,
            entry.raw_content
        );
    }
    println!("{} line(s) mention a timeout", search.count());
}
