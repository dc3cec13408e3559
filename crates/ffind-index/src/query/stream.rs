//! Gathered-write response streaming.
//!
//! Result lines are queued and pushed to the socket with vectored
//! writes, at most [`MAX_BATCH_BUFFERS`] buffers per syscall. Partial
//! writes resume mid-buffer, `EINTR` retries, and a client that hangs
//! up simply ends the stream; nothing is logged for disconnects.

use std::io::{self, IoSlice, Write};

/// Buffers handed to a single vectored write.
pub const MAX_BATCH_BUFFERS: usize = 1024;

pub struct ResponseWriter<W: Write> {
    inner: W,
    pending: Vec<Vec<u8>>,
    disconnected: bool,
}

impl<W: Write> ResponseWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            disconnected: false,
        }
    }

    /// Queues one chunk (a line, or a pre-assembled group of lines).
    pub fn push(&mut self, chunk: Vec<u8>) {
        if self.disconnected || chunk.is_empty() {
            return;
        }
        self.pending.push(chunk);
        if self.pending.len() >= MAX_BATCH_BUFFERS {
            self.flush_batch();
        }
    }

    pub fn push_line(&mut self, line: &str) {
        let mut chunk = Vec::with_capacity(line.len() + 1);
        chunk.extend_from_slice(line.as_bytes());
        chunk.push(b'\n');
        self.push(chunk);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Writes out whatever is still queued.
    pub fn finish(mut self) {
        self.flush_batch();
        let _ = self.inner.flush();
    }

    fn flush_batch(&mut self) {
        if self.disconnected {
            self.pending.clear();
            return;
        }
        let mut buf_index = 0usize;
        let mut offset = 0usize;
        while buf_index < self.pending.len() {
            let mut slices: Vec<IoSlice<'_>> = Vec::new();
            for (i, buf) in self
                .pending
                .iter()
                .enumerate()
                .skip(buf_index)
                .take(MAX_BATCH_BUFFERS)
            {
                if i == buf_index {
                    slices.push(IoSlice::new(&buf[offset..]));
                } else {
                    slices.push(IoSlice::new(buf));
                }
            }
            match self.inner.write_vectored(&slices) {
                Ok(0) => {
                    self.disconnected = true;
                    break;
                }
                Ok(mut written) => {
                    while buf_index < self.pending.len() && written > 0 {
                        let remaining = self.pending[buf_index].len() - offset;
                        if written >= remaining {
                            written -= remaining;
                            buf_index += 1;
                            offset = 0;
                        } else {
                            offset += written;
                            written = 0;
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    // Client went away mid-stream; terminate quietly.
                    self.disconnected = true;
                    break;
                }
            }
        }
        self.pending.clear();
    }
}
