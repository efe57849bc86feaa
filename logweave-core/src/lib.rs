//! # logweave-core
//!
//! An incremental indexing engine for growing, line-oriented log sources.
//!
//! ## Overview
//!
//! Every component implements the [`LogSource`] trait: a row-indexed table
//! that grows over time and announces its changes to subscribers as
//! [`Change`]s. Components wrap each other through `Arc<dyn LogSource>`, so a
//! processing pipeline is just a chain of sources:
//!
//! ```text
//! ┌────────────┐   ┌────────────────────┐   ┌─────────────────┐   ┌─────────────────┐
//! │ raw source │ ─>│ MultiLineLogSource │ ─>│ MergedLogSource │ ─>│ LogSourceSearch │
//! └────────────┘   └────────────────────┘   └─────────────────┘   └─────────────────┘
//! ```
//!
//! A [`FilteredLogSource`] can be placed anywhere in the chain to hide
//! entries by level or content.
//!
//! ## Change protocol
//!
//! - [`Change::Append`]: new rows exist
//! - [`Change::Invalidate`]: rows from an index onwards are void until
//!   appended again
//! - [`Change::Reset`]: all rows are void
//!
//! Consumers apply changes in emission order. A row whose interpretation
//! changes (a line turns out to continue the previous entry) is invalidated
//! and appended again; there is no in-place update.
//!
//! ## Scheduling
//!
//! Each component owns one [`PeriodicTask`] registered with an injected
//! [`TaskScheduler`]. [`ThreadTaskScheduler`] runs tasks on background
//! threads, [`ManualTaskScheduler`] runs them only when asked, which keeps
//! tests deterministic:
//!
//! ```rust
//! use logweave_core::{
//!     InMemoryLogSource, Level, LogSource, LogSourceExt, ManualTaskScheduler, MultiLineLogSource,
//! };
//! use std::{sync::Arc, time::Duration};
//!
//! let scheduler = Arc::new(ManualTaskScheduler::new());
//! let raw = Arc::new(InMemoryLogSource::new());
//! let entries = MultiLineLogSource::new(scheduler.clone(), raw.clone(), Duration::ZERO);
//!
//! raw.add_entry("ERROR request failed", Level::Error, None);
//! raw.add_entry("  caused by: timeout", Level::None, None);
//! scheduler.run_once();
//!
//! assert_eq!(entries.count(), 2);
//! assert_eq!(entries.entry(1).level, Level::Error);
//! assert_eq!(entries.entry(1).entry_index, Some(0));
//! ```

pub mod change;
pub mod desc;
pub mod filter;
pub mod filtered;
pub mod in_memory;
pub mod listeners;
pub mod merged;
pub mod multi_line;
pub mod parser;
pub mod scheduler;
pub mod search;
pub mod source;

// re-export commonly used types
pub use change::{Change, Section};
pub use desc::{DEFAULT_MAX_BATCH_SIZE, PipelineDesc};
pub use filter::{
    EmptyLogLineFilter, FilterChain, InvertFilter, LevelFilter, LogEntryFilter, RegexFilter,
    SubstringFilter,
};
pub use filtered::FilteredLogSource;
pub use in_memory::InMemoryLogSource;
pub use listeners::{ListenerCollection, Subscription};
pub use merged::{MergedIndex, MergedLogSource, MergedRecord, PendingModification};
pub use multi_line::MultiLineLogSource;
pub use parser::{LineParser, NoLevelParser, ParsedLine};
pub use scheduler::{
    CancellationToken, ManualTaskScheduler, PeriodicTask, TaskId, TaskScheduler,
    ThreadTaskScheduler,
};
pub use search::{LogMatch, LogSourceSearch};
pub use source::{
    ColumnId, Level, LogEntry, LogSource, LogSourceExt, ParseLevelError, Rows, SourceError,
    SourceId, SourceProperties,
};
