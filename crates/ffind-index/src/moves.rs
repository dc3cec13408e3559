//! Pending directory-move tracking.
//!
//! A directory rename inside the watched tree arrives as a
//! `MOVED_FROM`/`MOVED_TO` pair sharing a kernel cookie. The from-side
//! is parked here until its partner shows up; an entry that outlives
//! the stale window must have been moved out of the tree and is demoted
//! to a recursive delete by the event loop's sweep.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How long an unmatched move-from may wait for its move-to pair.
pub const STALE_MOVE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct PendingMoves {
    inner: HashMap<u32, (String, Instant)>,
}

impl PendingMoves {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, cookie: u32, old_path: String) {
        self.inner.insert(cookie, (old_path, Instant::now()));
    }

    /// Consumes the entry for `cookie`, turning the pair into a rename.
    pub fn take(&mut self, cookie: u32) -> Option<String> {
        self.inner.remove(&cookie).map(|(path, _)| path)
    }

    /// Removes entries older than the stale window, returning their
    /// paths for demotion to recursive deletes.
    pub fn drain_stale(&mut self, now: Instant) -> Vec<String> {
        let mut stale = Vec::new();
        self.inner.retain(|_, (path, recorded_at)| {
            if now.duration_since(*recorded_at) > STALE_MOVE_WINDOW {
                stale.push(std::mem::take(path));
                false
            } else {
                true
            }
        });
        stale
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
