//! Root tree configuration.
//!
//! Roots are ordered, canonical, absolute directory paths, each stored
//! with a trailing `/`. They are fixed at startup; when persistence is
//! enabled the list round-trips through the durable store as a JSON
//! array.

use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RootSet {
    roots: Vec<String>,
}

impl RootSet {
    /// Validates, canonicalizes, and deduplicates the requested root
    /// paths. Overlapping roots are warned about but accepted; the
    /// longest-prefix rule in [`RootSet::root_index_of`] keeps
    /// attribution unambiguous.
    pub fn resolve(paths: &[PathBuf]) -> Result<Self> {
        let mut roots: Vec<String> = Vec::new();
        for raw in paths {
            let meta = fs::metadata(raw).map_err(|_| Error::RootMissing(raw.clone()))?;
            if !meta.is_dir() {
                return Err(Error::RootNotDirectory(raw.clone()));
            }
            let canonical = fs::canonicalize(raw).map_err(|err| Error::RootInvalid {
                path: raw.clone(),
                reason: err.to_string(),
            })?;
            let Some(canonical) = canonical.to_str() else {
                return Err(Error::RootInvalid {
                    path: raw.clone(),
                    reason: "path is not valid UTF-8".to_string(),
                });
            };
            let mut root = canonical.to_string();
            if !root.ends_with('/') {
                root.push('/');
            }
            if roots.contains(&root) {
                tracing::warn!("duplicate path ignored: {root}");
                continue;
            }
            roots.push(root);
        }
        if roots.is_empty() {
            return Err(Error::NoRoots);
        }
        warn_overlaps(&roots);
        Ok(Self { roots })
    }

    /// Wraps an already-canonical list, e.g. one loaded from the
    /// durable store.
    pub fn from_list(roots: Vec<String>) -> Self {
        Self { roots }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.roots.iter().map(String::as_str)
    }

    pub fn matches(&self, other: &[String]) -> bool {
        self.roots == other
    }

    /// Finds the root a path belongs to. With overlapping roots the
    /// longest matching prefix wins. The root directory itself (with or
    /// without its trailing slash) belongs to its own root.
    pub fn root_index_of(&self, path: &str) -> Option<usize> {
        let mut best: Option<usize> = None;
        let mut best_len = 0;
        for (index, root) in self.roots.iter().enumerate() {
            let hit = path.starts_with(root.as_str()) || path == &root[..root.len() - 1];
            if hit && root.len() > best_len {
                best = Some(index);
                best_len = root.len();
            }
        }
        best
    }

    /// The root-relative form of an entry path. Falls back to the full
    /// path when the recorded root index does not line up.
    pub fn relative<'a>(&self, path: &'a str, root_index: usize) -> &'a str {
        match self.roots.get(root_index) {
            Some(root) if path.starts_with(root.as_str()) => &path[root.len()..],
            _ => path,
        }
    }
}

/// Warns about every overlapping pair. Returns whether any overlap
/// exists.
pub fn warn_overlaps(roots: &[String]) -> bool {
    let mut overlapping = false;
    for i in 0..roots.len() {
        for j in i + 1..roots.len() {
            if roots[i].starts_with(&roots[j]) || roots[j].starts_with(&roots[i]) {
                tracing::warn!("overlapping roots: {} and {}", roots[i], roots[j]);
                overlapping = true;
            }
        }
    }
    overlapping
}
