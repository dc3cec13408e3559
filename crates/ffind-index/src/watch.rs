//! Raw inotify interface.
//!
//! Owns the notification descriptor and the watch-descriptor to
//! directory map. Directories are watched non-recursively; the event
//! loop adds and drops watches as the tree changes. Watch registration
//! failures are logged and skipped so an unwatchable directory is still
//! indexed, just without live updates.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use crate::error::{Error, Result};

/// Size of the kernel event read buffer.
const EVENT_BUF_BYTES: usize = 8192;
/// Fixed event header: wd, mask, cookie, name length.
const EVENT_HEADER_BYTES: usize = 16;

/// Everything a watched directory subscribes to.
pub const WATCH_MASK: u32 = libc::IN_CREATE
    | libc::IN_DELETE
    | libc::IN_MODIFY
    | libc::IN_CLOSE_WRITE
    | libc::IN_MOVED_FROM
    | libc::IN_MOVED_TO
    | libc::IN_DELETE_SELF
    | libc::IN_MOVE_SELF;

/// One parsed kernel notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub wd: i32,
    pub mask: u32,
    pub cookie: u32,
    pub name: String,
}

impl WatchEvent {
    pub fn is_dir(&self) -> bool {
        self.mask & libc::IN_ISDIR != 0
    }

    pub fn has(&self, bits: u32) -> bool {
        self.mask & bits != 0
    }

    pub fn queue_overflowed(&self) -> bool {
        self.mask & libc::IN_Q_OVERFLOW != 0
    }
}

#[repr(align(8))]
struct AlignedBuf([u8; EVENT_BUF_BYTES]);

pub struct Watcher {
    fd: OwnedFd,
    wd_to_dir: HashMap<i32, String>,
    buf: Box<AlignedBuf>,
}

impl Watcher {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if fd < 0 {
            return Err(Error::WatchInit(io::Error::last_os_error().to_string()));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            wd_to_dir: HashMap::new(),
            buf: Box::new(AlignedBuf([0; EVENT_BUF_BYTES])),
        })
    }

    /// Registers a directory. Failure leaves it indexed but without
    /// live updates.
    pub fn watch(&mut self, dir: &str) {
        let Ok(cpath) = CString::new(dir) else {
            tracing::warn!("cannot watch {dir}: embedded NUL");
            return;
        };
        let wd = unsafe {
            libc::inotify_add_watch(self.fd.as_raw_fd(), cpath.as_ptr(), WATCH_MASK)
        };
        if wd < 0 {
            tracing::warn!("failed to watch {dir}: {}", io::Error::last_os_error());
            return;
        }
        self.wd_to_dir.insert(wd, dir.to_string());
    }

    /// Drops the bookkeeping for a descriptor the kernel already
    /// released (`IN_IGNORED`, `IN_DELETE_SELF`).
    pub fn forget(&mut self, wd: i32) -> Option<String> {
        self.wd_to_dir.remove(&wd)
    }

    pub fn directory(&self, wd: i32) -> Option<&str> {
        self.wd_to_dir.get(&wd).map(String::as_str)
    }

    pub fn watch_count(&self) -> usize {
        self.wd_to_dir.len()
    }

    pub fn watched_dirs(&self) -> impl Iterator<Item = &str> {
        self.wd_to_dir.values().map(String::as_str)
    }

    /// Tears down the watches for `path` and everything below it.
    pub fn unwatch_subtree(&mut self, path: &str) -> usize {
        let child_prefix = format!("{path}/");
        let doomed: Vec<i32> = self
            .wd_to_dir
            .iter()
            .filter(|(_, dir)| dir.as_str() == path || dir.starts_with(&child_prefix))
            .map(|(&wd, _)| wd)
            .collect();
        for wd in &doomed {
            unsafe {
                libc::inotify_rm_watch(self.fd.as_raw_fd(), *wd);
            }
            self.wd_to_dir.remove(wd);
        }
        doomed.len()
    }

    /// Rewrites mapped directories under a renamed prefix. Descriptors
    /// are untouched: kernel watches follow the inode.
    pub fn rename_prefix(&mut self, old: &str, new: &str) {
        let child_prefix = format!("{old}/");
        for dir in self.wd_to_dir.values_mut() {
            if dir == old {
                *dir = new.to_string();
            } else if dir.starts_with(&child_prefix) {
                *dir = format!("{new}{}", &dir[old.len()..]);
            }
        }
    }

    /// Drains ready notifications, waiting at most `timeout`. Returns
    /// an empty vector on timeout or signal interruption.
    pub fn next_events(&mut self, timeout: Duration) -> io::Result<Vec<WatchEvent>> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        if ready == 0 || pfd.revents & libc::POLLIN == 0 {
            return Ok(Vec::new());
        }
        let len = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                self.buf.0.as_mut_ptr().cast(),
                EVENT_BUF_BYTES,
            )
        };
        if len < 0 {
            let err = io::Error::last_os_error();
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        Ok(parse_event_buffer(&self.buf.0[..len as usize]))
    }
}

/// Parses inotify events out of a read buffer. Every event must lie
/// entirely within the buffer; a malformed or truncated tail is
/// discarded.
pub fn parse_event_buffer(buf: &[u8]) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    let mut offset = 0usize;
    while buf.len().saturating_sub(offset) >= EVENT_HEADER_BYTES {
        let header = &buf[offset..offset + EVENT_HEADER_BYTES];
        let wd = i32::from_ne_bytes(header[0..4].try_into().expect("sized slice"));
        let mask = u32::from_ne_bytes(header[4..8].try_into().expect("sized slice"));
        let cookie = u32::from_ne_bytes(header[8..12].try_into().expect("sized slice"));
        let name_len = u32::from_ne_bytes(header[12..16].try_into().expect("sized slice")) as usize;

        let Some(end) = offset
            .checked_add(EVENT_HEADER_BYTES)
            .and_then(|start| start.checked_add(name_len))
        else {
            break;
        };
        if end > buf.len() {
            // Truncated trailing event.
            break;
        }
        let raw_name = &buf[offset + EVENT_HEADER_BYTES..end];
        let trimmed = match raw_name.iter().position(|&b| b == 0) {
            Some(nul) => &raw_name[..nul],
            None => raw_name,
        };
        events.push(WatchEvent {
            wd,
            mask,
            cookie,
            name: String::from_utf8_lossy(trimmed).into_owned(),
        });
        offset = end;
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_event(buf: &mut Vec<u8>, wd: i32, mask: u32, cookie: u32, name: &str, pad_to: usize) {
        let mut name_bytes = name.as_bytes().to_vec();
        while name_bytes.len() < pad_to {
            name_bytes.push(0);
        }
        buf.extend_from_slice(&wd.to_ne_bytes());
        buf.extend_from_slice(&mask.to_ne_bytes());
        buf.extend_from_slice(&cookie.to_ne_bytes());
        buf.extend_from_slice(&(name_bytes.len() as u32).to_ne_bytes());
        buf.extend_from_slice(&name_bytes);
    }

    #[test]
    fn parses_consecutive_events() {
        let mut buf = Vec::new();
        push_event(&mut buf, 1, libc::IN_CREATE, 0, "a.txt", 8);
        push_event(&mut buf, 2, libc::IN_MOVED_FROM | libc::IN_ISDIR, 77, "sub", 16);

        let events = parse_event_buffer(&buf);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "a.txt");
        assert!(events[0].has(libc::IN_CREATE));
        assert!(!events[0].is_dir());
        assert_eq!(events[1].cookie, 77);
        assert!(events[1].is_dir());
        assert_eq!(events[1].name, "sub");
    }

    #[test]
    fn name_padding_is_trimmed_at_first_nul() {
        let mut buf = Vec::new();
        push_event(&mut buf, 1, libc::IN_DELETE, 0, "x", 16);
        let events = parse_event_buffer(&buf);
        assert_eq!(events[0].name, "x");
    }

    #[test]
    fn truncated_tail_is_discarded() {
        let mut buf = Vec::new();
        push_event(&mut buf, 1, libc::IN_CREATE, 0, "ok.txt", 8);
        // A header that promises more name bytes than the buffer holds.
        push_event(&mut buf, 2, libc::IN_CREATE, 0, "lost", 8);
        let valid_len = buf.len() - 4;
        buf.truncate(valid_len);

        let events = parse_event_buffer(&buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "ok.txt");
    }

    #[test]
    fn short_header_yields_nothing() {
        assert!(parse_event_buffer(&[0u8; 15]).is_empty());
        assert!(parse_event_buffer(&[]).is_empty());
    }

    #[test]
    fn nameless_event_parses() {
        let mut buf = Vec::new();
        push_event(&mut buf, 3, libc::IN_DELETE_SELF, 0, "", 0);
        let events = parse_event_buffer(&buf);
        assert_eq!(events.len(), 1);
        assert!(events[0].name.is_empty());
    }

    #[test]
    fn rename_prefix_rewrites_in_place() {
        let mut watcher = Watcher::new().expect("inotify available");
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("sub");
        let deep = sub.join("deep");
        std::fs::create_dir_all(&deep).unwrap();
        let sub = sub.to_str().unwrap().to_string();
        let deep = deep.to_str().unwrap().to_string();
        watcher.watch(&sub);
        watcher.watch(&deep);
        assert_eq!(watcher.watch_count(), 2);

        let renamed = format!("{sub}2");
        watcher.rename_prefix(&sub, &renamed);
        let dirs: Vec<&str> = watcher.watched_dirs().collect();
        assert!(dirs.iter().all(|d| d.contains("sub2")));
    }

    #[test]
    fn unwatch_subtree_drops_descendants_only() {
        let mut watcher = Watcher::new().expect("inotify available");
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("sub");
        let other = tmp.path().join("other");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::create_dir_all(&other).unwrap();
        watcher.watch(sub.to_str().unwrap());
        watcher.watch(other.to_str().unwrap());

        assert_eq!(watcher.unwatch_subtree(sub.to_str().unwrap()), 1);
        assert_eq!(watcher.watch_count(), 1);
    }
}
