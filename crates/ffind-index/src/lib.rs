//! Filesystem indexing, watching, querying, and persistence for ffind.
//!
//! This crate is the core of the ffind daemon:
//! - In-memory entry store with a directory-bucket index for query pruning
//! - Raw inotify watcher with cookie-based directory-rename reconciliation
//! - Single-threaded event loop that is the sole mutator of the watch map
//! - Optional SQLite snapshot store, reconciled against the live
//!   filesystem on restart
//! - Binary request protocol, filter pipeline, and parallel content scan
//!
//! ## Architecture
//!
//! One **event thread** owns the [`Watcher`] and applies every kernel
//! notification to the shared [`EntryStore`]. Query threads take the same
//! store lock only while enumerating candidates; content scanning runs on
//! the rayon pool after the lock is released. The durable store is a
//! snapshot cache and is never authoritative.

pub mod error;
pub mod events;
pub mod indexer;
pub mod moves;
pub mod persist;
pub mod query;
pub mod roots;
pub mod scan;
pub mod store;
pub mod watch;

pub use error::{Error, Result};
pub use events::EventLoop;
pub use persist::PersistentStore;
pub use query::{read_request, run_query, QueryRequest, RequestError};
pub use roots::RootSet;
pub use store::{EntryStore, FileEntry};
pub use watch::{WatchEvent, Watcher};
