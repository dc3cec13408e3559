//! The metadata filter pipeline.
//!
//! Filters are compiled once per request and applied to every
//! candidate in a fixed order, short-circuiting on the first miss:
//! type, content-requires-file, size, mtime age, basename glob,
//! root-relative path glob.

use std::time::{SystemTime, UNIX_EPOCH};

use globset::{GlobBuilder, GlobMatcher};

use super::request::{CompareOp, QueryRequest, TypeFilter};
use crate::store::{base_name, FileEntry};

const SECONDS_PER_DAY: i64 = 86_400;

pub struct FilterSet {
    type_filter: TypeFilter,
    has_content: bool,
    size: Option<(CompareOp, i64)>,
    mtime: Option<(CompareOp, i32)>,
    now: i64,
    name_glob: Option<GlobMatcher>,
    path_glob: Option<GlobMatcher>,
}

impl FilterSet {
    pub fn compile(request: &QueryRequest) -> Self {
        let name_glob = (!request.name_pat.is_empty())
            .then(|| compile_glob(&request.name_pat, request.case_insensitive));
        let path_glob = (!request.path_pat.is_empty())
            .then(|| compile_glob(&request.path_pat, request.case_insensitive));
        Self {
            type_filter: request.type_filter,
            has_content: request.has_content(),
            size: request.size,
            mtime: request.mtime,
            now: unix_now(),
            name_glob,
            path_glob,
        }
    }

    /// Runs the pipeline against one entry. `relative` is the entry
    /// path with its owning root stripped.
    pub fn matches(&self, entry: &FileEntry, relative: &str) -> bool {
        match self.type_filter {
            TypeFilter::Files if entry.is_dir => return false,
            TypeFilter::Directories if !entry.is_dir => return false,
            _ => {}
        }
        if self.has_content && entry.is_dir {
            return false;
        }
        if let Some((op, value)) = self.size {
            if !op.compare(entry.size, value) {
                return false;
            }
        }
        if let Some((op, days)) = self.mtime {
            let age_days = (self.now - entry.mtime) / SECONDS_PER_DAY;
            if !op.compare(age_days, i64::from(days)) {
                return false;
            }
        }
        if let Some(glob) = &self.name_glob {
            if !glob.is_match(base_name(&entry.path)) {
                return false;
            }
        }
        if let Some(glob) = &self.path_glob {
            if !glob.is_match(relative) {
                return false;
            }
        }
        true
    }

    #[cfg(test)]
    fn with_now(mut self, now: i64) -> Self {
        self.now = now;
        self
    }
}

/// Compiles an fnmatch-style glob: `*` and `?` cross `/` boundaries.
/// A pattern globset rejects degrades to its escaped literal form
/// rather than failing the request.
pub fn compile_glob(pattern: &str, case_insensitive: bool) -> GlobMatcher {
    build_glob(pattern, case_insensitive).unwrap_or_else(|_| {
        let literal = globset::escape(pattern);
        build_glob(&literal, case_insensitive).expect("escaped glob is always valid")
    })
}

fn build_glob(
    pattern: &str,
    case_insensitive: bool,
) -> Result<GlobMatcher, globset::Error> {
    Ok(GlobBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .literal_separator(false)
        .build()?
        .compile_matcher())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn entry(path: &str, size: i64, is_dir: bool, age_days: i64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            size,
            mtime: NOW - age_days * SECONDS_PER_DAY,
            is_dir,
            root_index: 0,
        }
    }

    fn filters(request: &QueryRequest) -> FilterSet {
        FilterSet::compile(request).with_now(NOW)
    }

    #[test]
    fn type_filter_splits_files_and_directories() {
        let file = entry("/r/a.txt", 1, false, 0);
        let dir = entry("/r/sub", 0, true, 0);

        let req = QueryRequest {
            type_filter: TypeFilter::Files,
            ..QueryRequest::default()
        };
        let set = filters(&req);
        assert!(set.matches(&file, "a.txt"));
        assert!(!set.matches(&dir, "sub"));

        let req = QueryRequest {
            type_filter: TypeFilter::Directories,
            ..QueryRequest::default()
        };
        let set = filters(&req);
        assert!(!set.matches(&file, "a.txt"));
        assert!(set.matches(&dir, "sub"));
    }

    #[test]
    fn content_requests_skip_directories() {
        let req = QueryRequest {
            content_pat: "needle".to_string(),
            ..QueryRequest::default()
        };
        let set = filters(&req);
        assert!(!set.matches(&entry("/r/sub", 0, true, 0), "sub"));
        assert!(set.matches(&entry("/r/a.txt", 1, false, 0), "a.txt"));
    }

    #[test]
    fn size_comparisons() {
        let req = QueryRequest {
            size: Some((CompareOp::Greater, 100)),
            ..QueryRequest::default()
        };
        let set = filters(&req);
        assert!(set.matches(&entry("/r/big", 101, false, 0), "big"));
        assert!(!set.matches(&entry("/r/small", 100, false, 0), "small"));
    }

    #[test]
    fn mtime_age_is_integer_days() {
        let req = QueryRequest {
            mtime: Some((CompareOp::Less, 7)),
            ..QueryRequest::default()
        };
        let set = filters(&req);
        assert!(set.matches(&entry("/r/recent", 1, false, 6), "recent"));
        assert!(!set.matches(&entry("/r/old", 1, false, 8), "old"));
        // 6.9 days old truncates to 6.
        let almost = FileEntry {
            mtime: NOW - (7 * SECONDS_PER_DAY - 1),
            ..entry("/r/almost", 1, false, 0)
        };
        assert!(set.matches(&almost, "almost"));
    }

    #[test]
    fn name_glob_matches_the_basename_only() {
        let req = QueryRequest {
            name_pat: "hello.*".to_string(),
            ..QueryRequest::default()
        };
        let set = filters(&req);
        assert!(set.matches(&entry("/r/sub/hello.txt", 1, false, 0), "sub/hello.txt"));
        assert!(!set.matches(&entry("/r/sub/other.txt", 1, false, 0), "sub/other.txt"));
    }

    #[test]
    fn empty_patterns_match_everything() {
        let set = filters(&QueryRequest::default());
        assert!(set.matches(&entry("/r/anything", 1, false, 0), "anything"));
    }

    #[test]
    fn path_glob_is_root_relative_and_crosses_separators() {
        let req = QueryRequest {
            path_pat: "sub2/*".to_string(),
            ..QueryRequest::default()
        };
        let set = filters(&req);
        assert!(set.matches(&entry("/r/sub2/x.txt", 1, false, 0), "sub2/x.txt"));
        assert!(set.matches(&entry("/r/sub2/a/b.txt", 1, false, 0), "sub2/a/b.txt"));
        assert!(!set.matches(&entry("/r/sub/x.txt", 1, false, 0), "sub/x.txt"));
    }

    #[test]
    fn case_insensitive_globs() {
        let req = QueryRequest {
            name_pat: "*.TXT".to_string(),
            case_insensitive: true,
            ..QueryRequest::default()
        };
        let set = filters(&req);
        assert!(set.matches(&entry("/r/a.txt", 1, false, 0), "a.txt"));
    }

    #[test]
    fn unparseable_glob_degrades_to_a_literal() {
        let matcher = compile_glob("bad[range", false);
        assert!(matcher.is_match("bad[range"));
        assert!(!matcher.is_match("badr"));
    }
}
