//! Query execution.
//!
//! Candidates are enumerated under the store lock — narrowed through
//! the directory buckets when the path pattern has a usable static
//! prefix — and pass the filter pipeline. Path-only requests stream
//! immediately; content requests release the lock and fan the
//! surviving files out across the rayon pool, collecting the per-file
//! chunks in submission order.

use std::io::Write;
use std::sync::Mutex;

use rayon::prelude::*;

use super::filters::FilterSet;
use super::request::QueryRequest;
use super::stream::ResponseWriter;
use crate::roots::RootSet;
use crate::scan::{self, ContentMatcher};
use crate::store::EntryStore;

/// Runs one request against the index, streaming results to `out`.
pub fn run_query<W: Write>(
    request: &QueryRequest,
    store: &Mutex<EntryStore>,
    roots: &RootSet,
    out: W,
) {
    let mut writer = ResponseWriter::new(out);

    let matcher = if request.has_content() {
        match ContentMatcher::compile(request) {
            Ok(matcher) => Some(matcher),
            Err(err) => {
                if let Some(line) = err.client_line() {
                    writer.push_line(line);
                }
                writer.finish();
                return;
            }
        }
    } else {
        None
    };

    let filters = FilterSet::compile(request);
    let candidates = collect_candidates(request, &filters, store, roots, &mut writer);

    if let Some(matcher) = matcher {
        let chunks: Vec<Vec<u8>> = candidates
            .par_iter()
            .map(|path| scan::scan_file(path, &matcher, request.before_ctx, request.after_ctx))
            .collect();
        for chunk in chunks {
            writer.push(chunk);
        }
    }
    writer.finish();
}

/// Enumerates entries under the store lock. Path-only matches are
/// emitted on the spot; content requests return the surviving paths
/// for scanning after the lock is dropped.
fn collect_candidates<W: Write>(
    request: &QueryRequest,
    filters: &FilterSet,
    store: &Mutex<EntryStore>,
    roots: &RootSet,
    writer: &mut ResponseWriter<W>,
) -> Vec<String> {
    let Ok(store) = store.lock() else {
        tracing::error!("store lock poisoned; returning no results");
        return Vec::new();
    };
    let wants_content = request.has_content();
    let mut candidates = Vec::new();

    let mut consider = |key: usize| {
        let Some(entry) = store.get(key) else {
            return;
        };
        let relative = roots.relative(&entry.path, entry.root_index);
        if !filters.matches(entry, relative) {
            return;
        }
        if wants_content {
            candidates.push(entry.path.clone());
        } else {
            writer.push_line(&entry.path);
        }
    };

    match static_dir_prefix(&request.path_pat) {
        Some(prefix) => {
            for (dir, keys) in store.buckets() {
                if bucket_selected(dir, &prefix, roots) {
                    for &key in keys {
                        consider(key);
                    }
                }
            }
        }
        None => {
            for (key, _) in store.iter() {
                consider(key);
            }
        }
    }
    candidates
}

/// The static directory portion of a path pattern: everything before
/// the last `/` preceding the first glob metacharacter. `None` means
/// the pattern gives the scan nothing to prune with.
fn static_dir_prefix(pattern: &str) -> Option<String> {
    if pattern.is_empty() {
        return None;
    }
    let meta = pattern.find(['*', '?', '[']).unwrap_or(pattern.len());
    let stem = &pattern[..meta];
    let slash = stem.rfind('/')?;
    if slash == 0 {
        return None;
    }
    Some(stem[..slash].to_string())
}

/// Whether a directory bucket can hold entries the full pattern might
/// match: its root-relative form equals the prefix, lies below it, or
/// contains it. This only prunes; the full pattern still runs against
/// every surviving entry.
fn bucket_selected(dir: &str, prefix: &str, roots: &RootSet) -> bool {
    let Some(root_index) = roots.root_index_of(dir) else {
        return false;
    };
    let root = &roots.as_slice()[root_index];
    let relative = if dir.len() < root.len() {
        ""
    } else {
        &dir[root.len()..]
    };
    relative.is_empty()
        || relative == prefix
        || relative
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
        || prefix
            .strip_prefix(relative)
            .is_some_and(|rest| rest.starts_with('/'))
}
