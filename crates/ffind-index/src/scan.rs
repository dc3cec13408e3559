//! Per-file content matching over read-only memory maps.
//!
//! One task per candidate file, executed on the rayon pool. A file is
//! mapped privately, sniffed for binary content, and scanned line by
//! line with the match method selected once per request. All failures
//! are per-file: an unreadable file contributes nothing and never
//! aborts the request.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use globset::GlobMatcher;
use memchr::{memchr, memmem};
use memmap2::{Advice, Mmap};

use crate::query::filters::compile_glob;
use crate::query::request::{QueryRequest, RequestError};

/// Leading bytes inspected for binary detection.
const BINARY_SNIFF_BYTES: usize = 1024;

#[derive(Debug)]
pub enum ContentMatcher {
    /// Whole-line glob match.
    Glob(GlobMatcher),
    /// Unanchored regular expression over raw bytes.
    Regex(regex::bytes::Regex),
    /// Byte-wise substring search.
    Fixed(Vec<u8>),
    /// ASCII case-folded substring search.
    FixedFold(Vec<u8>),
}

impl ContentMatcher {
    /// Selects and compiles the match method for a request. Glob and
    /// regex are mutually exclusive; glob takes precedence when a
    /// client manages to set both bits.
    pub fn compile(request: &QueryRequest) -> Result<Self, RequestError> {
        if request.content_glob {
            Ok(Self::Glob(compile_glob(
                &request.content_pat,
                request.case_insensitive,
            )))
        } else if request.content_regex {
            regex::bytes::RegexBuilder::new(&request.content_pat)
                .case_insensitive(request.case_insensitive)
                .build()
                .map(Self::Regex)
                .map_err(|_| RequestError::InvalidRegex)
        } else if request.case_insensitive {
            Ok(Self::FixedFold(
                request.content_pat.to_ascii_lowercase().into_bytes(),
            ))
        } else {
            Ok(Self::Fixed(request.content_pat.clone().into_bytes()))
        }
    }

    pub fn matches(&self, line: &[u8]) -> bool {
        match self {
            Self::Glob(glob) => glob.is_match(Path::new(OsStr::from_bytes(line))),
            Self::Regex(re) => re.is_match(line),
            Self::Fixed(needle) => memmem::find(line, needle).is_some(),
            Self::FixedFold(needle) => {
                let folded = line.to_ascii_lowercase();
                memmem::find(&folded, needle).is_some()
            }
        }
    }
}

/// Scans one candidate file and returns its formatted response chunk.
/// Empty files are valid and yield nothing; unmappable and binary
/// files are skipped.
pub fn scan_file(path: &str, matcher: &ContentMatcher, before_ctx: u8, after_ctx: u8) -> Vec<u8> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            tracing::debug!("content scan skipped for {path}: {err}");
            return Vec::new();
        }
    };
    let map = match unsafe { Mmap::map(&file) } {
        Ok(map) => map,
        Err(err) => {
            tracing::debug!("content scan skipped for {path}: mmap failed: {err}");
            return Vec::new();
        }
    };
    let _ = map.advise(Advice::Sequential);

    let data: &[u8] = &map;
    if data.is_empty() {
        return Vec::new();
    }
    let sniff = &data[..data.len().min(BINARY_SNIFF_BYTES)];
    if memchr(0, sniff).is_some() {
        return Vec::new();
    }

    let lines = split_lines(data);
    if before_ctx == 0 && after_ctx == 0 {
        let mut out = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            if matcher.matches(line) {
                push_result_line(&mut out, path, index + 1, b':', line);
            }
        }
        out
    } else {
        render_with_context(
            path,
            &lines,
            matcher,
            usize::from(before_ctx),
            usize::from(after_ctx),
        )
    }
}

/// Splits on newline bytes. A trailing newline does not create a
/// phantom empty line.
fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    let mut lines: Vec<&[u8]> = data.split(|&b| b == b'\n').collect();
    if data.ends_with(b"\n") {
        lines.pop();
    }
    lines
}

/// `path ":" lineno sep line "\n"` — `sep` is `:` for match lines and
/// `-` for context-only lines.
fn push_result_line(out: &mut Vec<u8>, path: &str, lineno: usize, sep: u8, line: &[u8]) {
    out.extend_from_slice(path.as_bytes());
    out.push(b':');
    out.extend_from_slice(lineno.to_string().as_bytes());
    out.push(sep);
    out.extend_from_slice(line);
    out.push(b'\n');
}

/// Materializes matching line indices, widens each to an inclusive
/// range, merges overlapping or adjacent ranges (gap <= 1), and emits
/// the survivors separated by `--` lines.
fn render_with_context(
    path: &str,
    lines: &[&[u8]],
    matcher: &ContentMatcher,
    before: usize,
    after: usize,
) -> Vec<u8> {
    let last = lines.len().saturating_sub(1);
    let mut match_set: HashSet<usize> = HashSet::new();
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for (index, line) in lines.iter().enumerate() {
        if !matcher.matches(line) {
            continue;
        }
        match_set.insert(index);
        let start = index.saturating_sub(before);
        let end = (index + after).min(last);
        match ranges.last_mut() {
            Some(previous) if start <= previous.1 + 1 => previous.1 = previous.1.max(end),
            _ => ranges.push((start, end)),
        }
    }

    let mut out = Vec::new();
    for (range_index, &(start, end)) in ranges.iter().enumerate() {
        if range_index > 0 {
            out.extend_from_slice(b"--\n");
        }
        for index in start..=end {
            let sep = if match_set.contains(&index) { b':' } else { b'-' };
            push_result_line(&mut out, path, index + 1, sep, lines[index]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn fixed(pattern: &str) -> ContentMatcher {
        ContentMatcher::Fixed(pattern.as_bytes().to_vec())
    }

    fn temp_file(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    fn scan_str(file: &NamedTempFile, matcher: &ContentMatcher, before: u8, after: u8) -> String {
        let path = file.path().to_str().unwrap();
        String::from_utf8(scan_file(path, matcher, before, after)).unwrap()
    }

    #[test]
    fn basic_match_lines() {
        let file = temp_file(b"hello world\nnothing\nhello again\n");
        let out = scan_str(&file, &fixed("hello"), 0, 0);
        let path = file.path().display();
        assert_eq!(out, format!("{path}:1:hello world\n{path}:3:hello again\n"));
    }

    #[test]
    fn empty_file_is_valid_with_no_matches() {
        let file = temp_file(b"");
        assert!(scan_str(&file, &fixed("x"), 0, 0).is_empty());
    }

    #[test]
    fn nul_in_first_kilobyte_skips_the_file() {
        let file = temp_file(b"match me\x00binary tail\n");
        assert!(scan_str(&file, &fixed("match"), 0, 0).is_empty());
    }

    #[test]
    fn nul_after_the_sniff_window_is_not_binary() {
        let mut content = vec![b'a'; 1024];
        content.extend_from_slice(b"\nneedle\n\x00");
        let file = temp_file(&content);
        let out = scan_str(&file, &fixed("needle"), 0, 0);
        assert!(out.contains(":2:needle"));
    }

    #[test]
    fn missing_file_contributes_nothing() {
        assert!(scan_file("/no/such/file", &fixed("x"), 0, 0).is_empty());
    }

    #[test]
    fn case_insensitive_fixed_search() {
        let file = temp_file(b"Hello World\n");
        let matcher = ContentMatcher::FixedFold(b"hello".to_vec());
        assert!(scan_str(&file, &matcher, 0, 0).contains(":1:Hello World"));
    }

    #[test]
    fn regex_is_a_partial_match() {
        let file = temp_file(b"prefix needle42 suffix\nno digits here\n");
        let req = QueryRequest {
            content_pat: r"needle\d+".to_string(),
            content_regex: true,
            ..QueryRequest::default()
        };
        let matcher = ContentMatcher::compile(&req).unwrap();
        let out = scan_str(&file, &matcher, 0, 0);
        assert!(out.contains(":1:prefix needle42 suffix"));
        assert!(!out.contains("no digits"));
    }

    #[test]
    fn invalid_regex_reports_the_protocol_error() {
        let req = QueryRequest {
            content_pat: "(unclosed".to_string(),
            content_regex: true,
            ..QueryRequest::default()
        };
        let err = ContentMatcher::compile(&req).unwrap_err();
        assert_eq!(err.client_line(), Some("Invalid regex pattern"));
    }

    #[test]
    fn glob_matches_whole_lines() {
        let file = temp_file(b"TODO: fix this\nnot a todo line\n");
        let req = QueryRequest {
            content_pat: "TODO*".to_string(),
            content_glob: true,
            ..QueryRequest::default()
        };
        let matcher = ContentMatcher::compile(&req).unwrap();
        let out = scan_str(&file, &matcher, 0, 0);
        assert!(out.contains(":1:TODO: fix this"));
        assert!(!out.contains("not a todo"));
    }

    #[test]
    fn context_truncates_at_file_edges() {
        let file = temp_file(b"match\nb\nc\nd\nmatch\n");
        let out = scan_str(&file, &fixed("match"), 2, 2);
        let path = file.path().display();
        // One merged range: [0..2] and [2..4] overlap.
        let expected = format!(
            "{path}:1:match\n{path}:2-b\n{path}:3-c\n{path}:4-d\n{path}:5:match\n"
        );
        assert_eq!(out, expected);
    }

    #[test]
    fn distinct_ranges_are_separated_by_dashes() {
        let file = temp_file(b"match one\na\nb\nc\nd\ne\nmatch two\n");
        let out = scan_str(&file, &fixed("match"), 1, 1);
        let path = file.path().display();
        let expected = format!(
            "{path}:1:match one\n{path}:2-a\n--\n{path}:6-e\n{path}:7:match two\n"
        );
        assert_eq!(out, expected);
    }

    #[test]
    fn adjacent_ranges_merge_without_separator() {
        // Ranges [0,1] and [2,3]: gap of one line boundary, merged.
        let file = temp_file(b"match\nx\nmatch\ny\n");
        let out = scan_str(&file, &fixed("match"), 0, 1);
        assert!(!out.contains("--"));
        let path = file.path().display();
        assert_eq!(
            out,
            format!("{path}:1:match\n{path}:2-x\n{path}:3:match\n{path}:4-y\n")
        );
    }

    #[test]
    fn before_context_saturates_at_line_one() {
        let file = temp_file(b"match\ntail\n");
        let out = scan_str(&file, &fixed("match"), 5, 0);
        let path = file.path().display();
        assert_eq!(out, format!("{path}:1:match\n"));
    }

    #[test]
    fn after_context_saturates_at_last_line() {
        let file = temp_file(b"head\nmatch\n");
        let out = scan_str(&file, &fixed("match"), 0, 5);
        let path = file.path().display();
        assert_eq!(out, format!("{path}:2:match\n"));
    }
}
