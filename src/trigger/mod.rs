//! Scheduling triggers.
//!
//! - Scheduler: runs the pipeline on a fixed interval
//! - DataFileWatcher: reports when the raw data file changes

pub mod scheduler;
pub mod watcher;

pub use scheduler::{Scheduler, TickOutcome};
pub use watcher::{detect_change, DataChanged, DataFileWatcher, WatchHandle, WatcherConfig, WatcherError};
