//! SQLite-backed durable snapshot of the index.
//!
//! The database is a cache, never authoritative: every restart either
//! verifies the stored root list and reconciles, or discards the
//! snapshot and re-indexes. Failures after open are logged and the
//! daemon carries on from memory.
//!
//! Flush accounting: mutators bump an atomic pending-change counter; a
//! flush captures the counter at transaction start and subtracts that
//! amount on commit, so changes racing with the flush stay pending for
//! the next one.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::{Error, Result};
use crate::roots::RootSet;
use crate::store::{EntryStore, FileEntry};

/// Flush once this many changes have accumulated...
pub const FLUSH_THRESHOLD: usize = 100;
/// ...or once this much time has passed since the last flush.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT
);

CREATE TABLE IF NOT EXISTS entries (
    id INTEGER PRIMARY KEY,
    path TEXT UNIQUE NOT NULL,
    size INTEGER NOT NULL,
    mtime INTEGER NOT NULL,
    is_dir INTEGER NOT NULL,
    root_index INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_path ON entries(path);

CREATE TABLE IF NOT EXISTS sync_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_full_sync INTEGER,
    dirty INTEGER DEFAULT 0
);

INSERT OR IGNORE INTO sync_state (id, last_full_sync, dirty) VALUES (1, 0, 0);
";

pub struct PersistentStore {
    conn: Mutex<Connection>,
    pending_changes: AtomicUsize,
    dirty: AtomicBool,
    last_flush: Mutex<Instant>,
}

impl PersistentStore {
    /// Opens (or creates) the database, switching it to WAL so commits
    /// are crash-consistent.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            tracing::warn!("could not enable WAL mode: {err}");
        }
        if let Err(err) = conn.pragma_update(None, "synchronous", "NORMAL") {
            tracing::warn!("could not set synchronous mode: {err}");
        }
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            pending_changes: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
            last_flush: Mutex::new(Instant::now()),
        })
    }

    pub fn note_changes(&self, count: usize) {
        if count > 0 {
            self.pending_changes.fetch_add(count, Ordering::SeqCst);
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    pub fn pending(&self) -> usize {
        self.pending_changes.load(Ordering::SeqCst)
    }

    /// The root list saved by a previous run; empty when none.
    pub fn load_roots(&self) -> Vec<String> {
        let Ok(conn) = self.conn.lock() else {
            return Vec::new();
        };
        let json: Option<String> = match conn
            .query_row("SELECT value FROM meta WHERE key = 'root_paths'", [], |row| {
                row.get(0)
            })
            .optional()
        {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!("could not read prior roots: {err}");
                return Vec::new();
            }
        };
        match json {
            Some(json) => serde_json::from_str(&json).unwrap_or_else(|err| {
                tracing::warn!("stored root list is unreadable: {err}");
                Vec::new()
            }),
            None => Vec::new(),
        }
    }

    pub fn save_roots(&self, roots: &RootSet) {
        let json = match serde_json::to_string(roots.as_slice()) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!("could not serialize root list: {err}");
                return;
            }
        };
        let Ok(conn) = self.conn.lock() else {
            return;
        };
        if let Err(err) = conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('root_paths', ?1)",
            params![json],
        ) {
            tracing::warn!("could not save root list: {err}");
        }
    }

    /// Loads the snapshot into `store`, returning how many entries it
    /// carried.
    pub fn load_entries(&self, store: &mut EntryStore) -> usize {
        let Ok(conn) = self.conn.lock() else {
            return 0;
        };
        let mut stmt = match conn
            .prepare("SELECT path, size, mtime, is_dir, root_index FROM entries")
        {
            Ok(stmt) => stmt,
            Err(err) => {
                tracing::warn!("could not read snapshot entries: {err}");
                return 0;
            }
        };
        let rows = stmt.query_map([], |row| {
            Ok(FileEntry {
                path: row.get(0)?,
                size: row.get(1)?,
                mtime: row.get(2)?,
                is_dir: row.get::<_, i64>(3)? != 0,
                root_index: row.get::<_, i64>(4)? as usize,
            })
        });
        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!("could not read snapshot entries: {err}");
                return 0;
            }
        };
        let mut loaded = 0;
        for row in rows {
            match row {
                Ok(entry) => {
                    store.upsert(entry);
                    loaded += 1;
                }
                Err(err) => tracing::warn!("skipping unreadable snapshot row: {err}"),
            }
        }
        loaded
    }

    /// Flushes when the pending-change threshold or the flush interval
    /// has been reached.
    pub fn maybe_flush(&self, store: &Mutex<EntryStore>) {
        let elapsed = self
            .last_flush
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or(FLUSH_INTERVAL);
        if self.pending() >= FLUSH_THRESHOLD || elapsed >= FLUSH_INTERVAL {
            self.flush(store);
        }
    }

    /// One transaction replacing the whole entries table with the
    /// current store contents. Changes that accumulate while the flush
    /// runs remain pending.
    pub fn flush(&self, store: &Mutex<EntryStore>) {
        let captured = self.pending();
        let Ok(mut conn) = self.conn.lock() else {
            return;
        };
        match Self::flush_snapshot(&mut conn, store) {
            Ok(count) => {
                let current = self.pending();
                self.pending_changes
                    .fetch_sub(captured.min(current), Ordering::SeqCst);
                self.dirty.store(self.pending() > 0, Ordering::SeqCst);
                if let Ok(mut at) = self.last_flush.lock() {
                    *at = Instant::now();
                }
                tracing::info!("flushed {count} entries to database");
            }
            Err(err) => tracing::warn!("database flush failed: {err}"),
        }
    }

    fn flush_snapshot(conn: &mut Connection, store: &Mutex<EntryStore>) -> Result<usize> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM entries", [])?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO entries (path, size, mtime, is_dir, root_index)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let store = store
                .lock()
                .map_err(|_| Error::Internal("store lock poisoned".to_string()))?;
            for (_, entry) in store.iter() {
                stmt.execute(params![
                    entry.path,
                    entry.size,
                    entry.mtime,
                    i64::from(entry.is_dir),
                    entry.root_index as i64,
                ])?;
                count += 1;
            }
        }
        tx.execute(
            "UPDATE sync_state SET last_full_sync = strftime('%s','now'), dirty = 0 WHERE id = 1",
            [],
        )?;
        tx.commit()?;
        Ok(count)
    }
}
