//! The inotify event loop.
//!
//! A single thread owns the [`Watcher`] and is the sole mutator of the
//! watch map. Each tick sweeps the pending-move table, gives
//! persistence a chance to flush, polls the kernel with a bounded
//! timeout so shutdown is observed promptly, and classifies every
//! drained event.
//!
//! Directory renames inside the tree arrive as a MOVED_FROM/MOVED_TO
//! pair sharing a cookie; matching them rewrites paths in place and
//! keeps the existing watches, because kernel watches follow the
//! inode. A MOVED_FROM that never finds its partner within the stale
//! window was a move out of the tree and is resolved as a recursive
//! delete.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::indexer;
use crate::moves::PendingMoves;
use crate::persist::PersistentStore;
use crate::roots::RootSet;
use crate::store::EntryStore;
use crate::watch::{WatchEvent, Watcher};

/// Poll timeout; bounds shutdown latency.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Interval between stale-move sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub struct EventLoop {
    store: Arc<Mutex<EntryStore>>,
    roots: Arc<RootSet>,
    watcher: Watcher,
    moves: Mutex<PendingMoves>,
    persist: Option<Arc<PersistentStore>>,
    shutdown: Arc<AtomicBool>,
}

impl EventLoop {
    pub fn new(
        store: Arc<Mutex<EntryStore>>,
        roots: Arc<RootSet>,
        watcher: Watcher,
        persist: Option<Arc<PersistentStore>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            roots,
            watcher,
            moves: Mutex::new(PendingMoves::new()),
            persist,
            shutdown,
        }
    }

    /// Runs until the shutdown flag is set. Dropping the loop closes
    /// the notification descriptor.
    pub fn run(mut self) {
        let mut last_sweep = Instant::now();
        while !self.shutdown.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now.duration_since(last_sweep) >= SWEEP_INTERVAL {
                self.sweep_stale_moves(now);
                last_sweep = now;
            }
            if let Some(persist) = &self.persist {
                persist.maybe_flush(&self.store);
            }
            if let Err(err) = self.poll_once(POLL_TIMEOUT) {
                tracing::error!("event loop stopping: {err}");
                break;
            }
        }
    }

    /// Drains and applies one batch of events. Exposed separately so
    /// tests can drive the loop deterministically.
    pub fn poll_once(&mut self, timeout: Duration) -> std::io::Result<usize> {
        let events = self.watcher.next_events(timeout)?;
        let count = events.len();
        for event in events {
            self.apply(event);
        }
        Ok(count)
    }

    /// Demotes unmatched move-from entries older than the stale window
    /// to recursive deletes, watches included.
    pub fn sweep_stale_moves(&mut self, now: Instant) {
        let stale = match self.moves.lock() {
            Ok(mut moves) => moves.drain_stale(now),
            Err(_) => return,
        };
        for path in stale {
            self.watcher.unwatch_subtree(&path);
            let removed = self.with_store(|store| store.remove(&path, true));
            self.note_changes(removed);
            tracing::info!("directory moved out of tree: {path} ({removed} entries removed)");
        }
    }

    /// Classifies and applies one parsed event.
    pub fn apply(&mut self, event: WatchEvent) {
        if event.queue_overflowed() {
            tracing::warn!("inotify queue overflow; resynchronizing all roots");
            self.resync();
            return;
        }
        if event.has(libc::IN_IGNORED) {
            self.watcher.forget(event.wd);
            return;
        }
        let Some(dir) = self.watcher.directory(event.wd).map(str::to_string) else {
            return;
        };
        if event.has(libc::IN_DELETE_SELF) {
            self.watcher.forget(event.wd);
            let removed = self.with_store(|store| store.remove(&dir, true));
            self.note_changes(removed);
            tracing::info!("watched directory deleted: {dir} ({removed} entries removed)");
            return;
        }
        if event.has(libc::IN_MOVE_SELF) {
            // Handled through the parent's MOVED_FROM/MOVED_TO pair.
            return;
        }
        if event.name.is_empty() {
            return;
        }
        let full = if dir == "/" {
            format!("/{}", event.name)
        } else {
            format!("{dir}/{}", event.name)
        };
        if event.is_dir() {
            self.apply_dir_event(&event, full);
        } else {
            self.apply_file_event(&event, full);
        }
    }

    fn apply_dir_event(&mut self, event: &WatchEvent, full: String) {
        if event.has(libc::IN_CREATE) {
            if let Some(root_index) = self.attribute_root(&full) {
                let added = self.add_subtree(&full, root_index);
                self.note_changes(added);
                tracing::info!("directory created: {full} (watch added)");
            }
        }
        if event.has(libc::IN_MOVED_FROM) {
            if let Ok(mut moves) = self.moves.lock() {
                moves.record(event.cookie, full.clone());
            }
        }
        if event.has(libc::IN_MOVED_TO) {
            let matched = self
                .moves
                .lock()
                .ok()
                .and_then(|mut moves| moves.take(event.cookie));
            match matched {
                Some(old_path) => {
                    let renamed =
                        self.with_store(|store| store.rename_subtree(&old_path, &full));
                    self.watcher.rename_prefix(&old_path, &full);
                    self.note_changes(renamed);
                    tracing::info!(
                        "directory renamed: {old_path} -> {full} ({renamed} entries updated)"
                    );
                }
                None => {
                    if let Some(root_index) = self.attribute_root(&full) {
                        let added = self.add_subtree(&full, root_index);
                        self.note_changes(added);
                        tracing::info!("directory moved in: {full} (watch added)");
                    }
                }
            }
        }
        if event.has(libc::IN_DELETE) {
            let removed = self.with_store(|store| store.remove(&full, true));
            self.note_changes(removed);
            tracing::info!("directory deleted: {full} ({removed} entries removed)");
        }
    }

    fn apply_file_event(&mut self, event: &WatchEvent, full: String) {
        if event.has(
            libc::IN_CREATE | libc::IN_MOVED_TO | libc::IN_MODIFY | libc::IN_CLOSE_WRITE,
        ) {
            if let Some(root_index) = self.attribute_root(&full) {
                if let Some(entry) = indexer::stat_entry(&full, root_index) {
                    self.with_store(|store| store.upsert(entry));
                    self.note_changes(1);
                }
            }
        }
        if event.has(libc::IN_DELETE | libc::IN_MOVED_FROM) {
            let removed = self.with_store(|store| store.remove(&full, false));
            self.note_changes(removed);
        }
    }

    fn add_subtree(&mut self, path: &str, root_index: usize) -> usize {
        let Ok(mut store) = self.store.lock() else {
            return 0;
        };
        indexer::add_subtree(&mut store, &mut self.watcher, path, root_index)
    }

    fn resync(&mut self) {
        let stats = {
            let Ok(mut store) = self.store.lock() else {
                return;
            };
            indexer::reconcile(&mut store, Some(&mut self.watcher), &self.roots)
        };
        self.note_changes(stats.total());
        tracing::info!(
            "resynchronized: {} added, {} removed, {} updated",
            stats.added,
            stats.removed,
            stats.updated,
        );
    }

    /// Every event path lies under some watched root by construction;
    /// an unattributable path is a bug, logged and skipped.
    fn attribute_root(&self, path: &str) -> Option<usize> {
        let index = self.roots.root_index_of(path);
        debug_assert!(index.is_some(), "event path outside every root: {path}");
        if index.is_none() {
            tracing::error!("event path outside every watched root: {path}");
        }
        index
    }

    fn with_store<T: Default>(&self, apply: impl FnOnce(&mut EntryStore) -> T) -> T {
        match self.store.lock() {
            Ok(mut store) => apply(&mut store),
            Err(_) => {
                tracing::error!("store lock poisoned");
                T::default()
            }
        }
    }

    fn note_changes(&self, count: usize) {
        if count > 0 {
            if let Some(persist) = &self.persist {
                persist.note_changes(count);
            }
        }
    }

    #[cfg(test)]
    pub fn watcher(&self) -> &Watcher {
        &self.watcher
    }
}
