//! Bounded capture of the gateway's diagnostic output.
//!
//! `TailBuffer` keeps the most recent characters written by the child on
//! stderr so a failed launch can show what went wrong without keeping the
//! whole stream in memory. The full output lives in the log files.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use strip_ansi_escapes::strip;

/// Default number of characters retained from the child's stderr.
pub const DEFAULT_TAIL_CAPACITY: usize = 24_000;

/// Indicates the source stream of child output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }

    /// Name of the append-only log file for this stream.
    pub fn log_file_name(self) -> String {
        format!("gateway.{}.log", self.as_str())
    }
}

/// A fixed-capacity FIFO of characters, shared between the stream reader
/// that fills it and the supervisor that reads it on failure.
///
/// Cloning yields another handle to the same buffer.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    inner: Arc<Mutex<TailInner>>,
}

#[derive(Debug)]
struct TailInner {
    capacity: usize,
    chars: VecDeque<char>,
    // Trailing bytes of an incomplete UTF-8 sequence from the last read.
    pending: Vec<u8>,
}

impl TailBuffer {
    /// Creates an empty buffer holding at most `capacity` characters.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TailInner {
                capacity,
                chars: VecDeque::with_capacity(capacity.min(4096)),
                pending: Vec::new(),
            })),
        }
    }

    /// Appends text, dropping the oldest characters once over capacity.
    ///
    /// Returns `true` if anything was evicted.
    pub fn push(&self, chunk: &str) -> bool {
        let mut inner = self.lock();
        inner.append(chunk)
    }

    /// Appends raw bytes read from a pipe.
    ///
    /// A multi-byte character split across two reads is held back until the
    /// rest of it arrives; invalid sequences become U+FFFD.
    pub fn push_bytes(&self, bytes: &[u8]) -> bool {
        let mut inner = self.lock();
        let mut buf = std::mem::take(&mut inner.pending);
        buf.extend_from_slice(bytes);

        let mut decoded = String::with_capacity(buf.len());
        let mut rest: &[u8] = &buf;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    decoded.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        inner.pending = rest.to_vec();
        inner.append(&decoded)
    }

    /// Returns the retained text, oldest first.
    pub fn read(&self) -> String {
        self.lock().chars.iter().collect()
    }

    /// Number of characters currently held.
    pub fn len(&self) -> usize {
        self.lock().chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().chars.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    fn lock(&self) -> MutexGuard<'_, TailInner> {
        // A panicking reader cannot leave the deque half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for TailBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_CAPACITY)
    }
}

impl TailInner {
    fn append(&mut self, chunk: &str) -> bool {
        self.chars.extend(chunk.chars());
        let excess = self.chars.len().saturating_sub(self.capacity);
        if excess > 0 {
            self.chars.drain(..excess);
        }
        excess > 0
    }
}

/// Strips ANSI escape codes so diagnostics render as plain text.
///
/// Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}
