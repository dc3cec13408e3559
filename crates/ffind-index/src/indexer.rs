//! Filesystem walks: initial indexing, recursive additions for new
//! directories, and reconciliation against the live tree.
//!
//! Symbolic links are never followed and never indexed. Unreadable
//! subtrees are skipped. Directory children are visited in sorted order
//! for deterministic results.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::Instant;

use crate::roots::RootSet;
use crate::store::{EntryStore, FileEntry};
use crate::watch::Watcher;

/// Entries between progress reports during the initial walk.
const PROGRESS_EVERY: usize = 10_000;

#[derive(Debug, Default, Clone, Copy)]
pub struct WalkStats {
    pub files: usize,
    pub dirs: usize,
}

impl WalkStats {
    pub fn total(&self) -> usize {
        self.files + self.dirs
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileStats {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

impl ReconcileStats {
    pub fn total(&self) -> usize {
        self.added + self.updated + self.removed
    }
}

/// Builds an entry from a fresh stat of `path`. Symlinks and
/// unreadable nodes yield `None`.
pub fn stat_entry(path: &str, root_index: usize) -> Option<FileEntry> {
    let meta = fs::symlink_metadata(path).ok()?;
    if meta.file_type().is_symlink() {
        return None;
    }
    let is_dir = meta.is_dir();
    Some(FileEntry {
        path: path.to_string(),
        size: if is_dir { 0 } else { meta.len() as i64 },
        mtime: meta.mtime(),
        is_dir,
        root_index,
    })
}

/// Strips the trailing slash a configured root carries; the watch map
/// and entry paths use the slashless form.
fn trimmed_root(root: &str) -> &str {
    if root.len() > 1 {
        root.trim_end_matches('/')
    } else {
        root
    }
}

/// Walks every root in order, filling the store and registering a
/// watch per directory.
pub fn walk_roots(
    store: &mut EntryStore,
    mut watcher: Option<&mut Watcher>,
    roots: &RootSet,
    report_progress: bool,
) -> WalkStats {
    let started = Instant::now();
    let mut walk = Walk {
        store,
        watcher: watcher.as_deref_mut(),
        report_progress,
        visited: 0,
        stats: WalkStats::default(),
    };
    for (root_index, root) in roots.iter().enumerate() {
        if report_progress {
            tracing::info!("indexing {root} ...");
        }
        let top = trimmed_root(root);
        if let Some(w) = walk.watcher.as_deref_mut() {
            w.watch(top);
        }
        walk.visit_dir(Path::new(top), root_index);
    }
    let stats = walk.stats;
    if report_progress {
        tracing::info!(
            "indexing complete: {} files, {} directories ({:.1}s)",
            stats.files,
            stats.dirs,
            started.elapsed().as_secs_f64(),
        );
    }
    stats
}

struct Walk<'a> {
    store: &'a mut EntryStore,
    watcher: Option<&'a mut Watcher>,
    report_progress: bool,
    visited: usize,
    stats: WalkStats,
}

impl Walk<'_> {
    fn visit_dir(&mut self, dir: &Path, root_index: usize) {
        let children = match fs::read_dir(dir) {
            Ok(children) => children,
            Err(err) => {
                tracing::debug!("skipping {}: {err}", dir.display());
                return;
            }
        };
        let mut paths: Vec<_> = children.filter_map(|c| c.ok()).map(|c| c.path()).collect();
        paths.sort();

        for child in paths {
            let Some(path) = child.to_str() else {
                tracing::warn!("skipping non-UTF-8 path under {}", dir.display());
                continue;
            };
            let Some(entry) = stat_entry(path, root_index) else {
                continue;
            };
            let is_dir = entry.is_dir;
            self.store.upsert(entry);
            self.tally(is_dir);
            if is_dir {
                if let Some(w) = self.watcher.as_deref_mut() {
                    w.watch(path);
                }
                self.visit_dir(&child, root_index);
            }
        }
    }

    fn tally(&mut self, is_dir: bool) {
        if is_dir {
            self.stats.dirs += 1;
        } else {
            self.stats.files += 1;
        }
        self.visited += 1;
        if self.report_progress && self.visited % PROGRESS_EVERY == 0 {
            tracing::info!("indexed {} entries...", self.visited);
        }
    }
}

/// Indexes a directory that just appeared (created or moved in),
/// registering watches as it descends. Returns the number of entries
/// added or refreshed.
pub fn add_subtree(
    store: &mut EntryStore,
    watcher: &mut Watcher,
    path: &str,
    root_index: usize,
) -> usize {
    let Some(entry) = stat_entry(path, root_index) else {
        return 0;
    };
    let is_dir = entry.is_dir;
    store.upsert(entry);
    let mut count = 1;
    if !is_dir {
        return count;
    }
    watcher.watch(path);

    let Ok(children) = fs::read_dir(path) else {
        return count;
    };
    let mut paths: Vec<_> = children.filter_map(|c| c.ok()).map(|c| c.path()).collect();
    paths.sort();
    for child in paths {
        if let Some(child_path) = child.to_str() {
            count += add_subtree(store, watcher, child_path, root_index);
        }
    }
    count
}

/// Walks the live filesystem and brings the store into agreement:
/// unknown paths are added, entries whose size or mtime changed are
/// refreshed, and store entries never visited are deleted. When a
/// watcher is supplied every visited directory is (re-)registered,
/// which picks up directories created while events were lost.
pub fn reconcile(
    store: &mut EntryStore,
    mut watcher: Option<&mut Watcher>,
    roots: &RootSet,
) -> ReconcileStats {
    let mut stats = ReconcileStats::default();
    let mut seen: Vec<FileEntry> = Vec::new();
    for (root_index, root) in roots.iter().enumerate() {
        if let Some(w) = watcher.as_deref_mut() {
            w.watch(trimmed_root(root));
        }
        collect_tree(Path::new(trimmed_root(root)), root_index, &mut seen);
    }

    for entry in &seen {
        if entry.is_dir {
            if let Some(w) = watcher.as_deref_mut() {
                w.watch(&entry.path);
            }
        }
        match store.get_by_path(&entry.path) {
            None => {
                store.upsert(entry.clone());
                stats.added += 1;
            }
            Some(existing) => {
                if existing.size != entry.size
                    || existing.mtime != entry.mtime
                    || existing.is_dir != entry.is_dir
                {
                    store.upsert(entry.clone());
                    stats.updated += 1;
                }
            }
        }
    }

    let visited: std::collections::HashSet<&str> =
        seen.iter().map(|e| e.path.as_str()).collect();
    let vanished: Vec<String> = store
        .iter()
        .map(|(_, e)| e.path.clone())
        .filter(|path| !visited.contains(path.as_str()))
        .collect();
    for path in &vanished {
        store.remove(path, false);
    }
    stats.removed = vanished.len();
    stats
}

fn collect_tree(dir: &Path, root_index: usize, out: &mut Vec<FileEntry>) {
    let Ok(children) = fs::read_dir(dir) else {
        return;
    };
    let mut paths: Vec<_> = children.filter_map(|c| c.ok()).map(|c| c.path()).collect();
    paths.sort();
    for child in paths {
        let Some(path) = child.to_str() else {
            continue;
        };
        let Some(entry) = stat_entry(path, root_index) else {
            continue;
        };
        let is_dir = entry.is_dir;
        out.push(entry);
        if is_dir {
            collect_tree(&child, root_index, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roots::RootSet;
    use std::fs::File;
    use std::io::Write;

    fn fixture() -> (tempfile::TempDir, RootSet) {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        let mut f = File::create(tmp.path().join("hello.txt")).unwrap();
        f.write_all(b"hello world\n").unwrap();
        File::create(tmp.path().join("sub/x.txt")).unwrap();
        let roots = RootSet::resolve(&[tmp.path().to_path_buf()]).unwrap();
        (tmp, roots)
    }

    #[test]
    fn walk_indexes_files_and_directories() {
        let (_tmp, roots) = fixture();
        let mut store = EntryStore::new();
        let stats = walk_roots(&mut store, None, &roots, false);
        assert_eq!(stats.files, 2);
        assert_eq!(stats.dirs, 1);
        assert_eq!(store.len(), 3);

        let root = &roots.as_slice()[0];
        let hello = format!("{root}hello.txt");
        let entry = store.get_by_path(&hello).expect("hello.txt indexed");
        assert_eq!(entry.size, 12);
        assert!(!entry.is_dir);
        assert_eq!(entry.root_index, 0);
    }

    #[test]
    fn walk_skips_symlinks() {
        let (tmp, roots) = fixture();
        std::os::unix::fs::symlink(tmp.path().join("hello.txt"), tmp.path().join("link.txt"))
            .unwrap();
        let mut store = EntryStore::new();
        walk_roots(&mut store, None, &roots, false);
        let root = &roots.as_slice()[0];
        assert!(!store.contains(&format!("{root}link.txt")));
    }

    #[test]
    fn walk_registers_watches_for_directories() {
        let (_tmp, roots) = fixture();
        let mut store = EntryStore::new();
        let mut watcher = Watcher::new().expect("inotify available");
        walk_roots(&mut store, Some(&mut watcher), &roots, false);
        // The root plus one subdirectory.
        assert_eq!(watcher.watch_count(), 2);
    }

    #[test]
    fn reconcile_applies_all_three_kinds_of_drift() {
        let (tmp, roots) = fixture();
        let mut store = EntryStore::new();
        walk_roots(&mut store, None, &roots, false);

        // Added, removed, updated while "the daemon was down".
        File::create(tmp.path().join("new.txt")).unwrap();
        std::fs::remove_file(tmp.path().join("sub/x.txt")).unwrap();
        let mut f = File::create(tmp.path().join("hello.txt")).unwrap();
        f.write_all(b"changed contents here\n").unwrap();

        let stats = reconcile(&mut store, None, &roots);
        assert_eq!(stats.added, 1);
        assert_eq!(stats.removed, 1);
        assert!(stats.updated >= 1);

        let root = &roots.as_slice()[0];
        assert!(store.contains(&format!("{root}new.txt")));
        assert!(!store.contains(&format!("{root}sub/x.txt")));
    }

    #[test]
    fn reconcile_is_a_noop_on_an_unchanged_tree() {
        let (_tmp, roots) = fixture();
        let mut store = EntryStore::new();
        walk_roots(&mut store, None, &roots, false);
        let stats = reconcile(&mut store, None, &roots);
        assert_eq!(stats.total(), 0);
    }

    #[test]
    fn add_subtree_counts_every_node() {
        let (tmp, roots) = fixture();
        let late = tmp.path().join("late");
        std::fs::create_dir(&late).unwrap();
        File::create(late.join("a.txt")).unwrap();
        File::create(late.join("b.txt")).unwrap();

        let mut store = EntryStore::new();
        let mut watcher = Watcher::new().expect("inotify available");
        let added = add_subtree(
            &mut store,
            &mut watcher,
            late.to_str().unwrap(),
            0,
        );
        assert_eq!(added, 3);
        assert_eq!(watcher.watch_count(), 1);
        let _ = roots;
    }
}
