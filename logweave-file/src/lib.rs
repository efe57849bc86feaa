// logweave-file - text file log source for logweave
//
// This crate tails a file on disk and exposes its lines as a LogSource.

mod metadata;
mod text_file;

pub use text_file::TextLogSource;
