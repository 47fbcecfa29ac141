//! Carry-over storage for message transports.
//!
//! A datagram is always received in full. Whatever part of it the caller did not ask for stays in
//! the [`PendingBuffer`] and is delivered, in order, by the next read.

use std::io;

use crate::reader::Received;

/// The receive window a new pending buffer starts with.
pub const DEFAULT_PENDING_CAPACITY: usize = 1024;

/// Receive windows grow in multiples of this size.
pub const PENDING_BUCKET: usize = 1024;

/// Bytes received from a message transport but not yet delivered to a caller.
///
/// Bytes before the cursor have been delivered and are dropped on the next compaction. The
/// receive window (the room offered to a single datagram) only ever grows.
#[derive(Debug, Clone)]
pub struct PendingBuffer {
    data: Vec<u8>,
    cursor: usize,
    window: usize,
}

impl Default for PendingBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_PENDING_CAPACITY)
    }
}

impl PendingBuffer {
    /// Create an empty buffer with the default receive window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer whose receive window fits at least `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        PendingBuffer {
            data: Vec::new(),
            cursor: 0,
            window: round_up(capacity),
        }
    }

    /// The largest datagram that can currently be received without growing.
    pub fn capacity(&self) -> usize {
        self.window
    }

    /// Number of bytes waiting to be delivered.
    pub fn available(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Whether no bytes are waiting.
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Copy waiting bytes into `dest` without consuming them.
    ///
    /// Copying starts `skip` bytes after the cursor. Returns the number of bytes copied.
    pub fn peek_into(&self, skip: usize, dest: &mut [u8]) -> usize {
        let start = (self.cursor + skip).min(self.data.len());
        let n = dest.len().min(self.data.len() - start);
        dest[..n].copy_from_slice(&self.data[start..start + n]);
        n
    }

    /// Mark `n` waiting bytes as delivered.
    pub fn consume(&mut self, n: usize) {
        self.cursor += n.min(self.available());
        if self.cursor == self.data.len() {
            self.data.clear();
            self.cursor = 0;
        } else if self.cursor >= self.window {
            self.data.drain(..self.cursor);
            self.cursor = 0;
        }
    }

    /// Drop all waiting bytes. The receive window keeps its size.
    pub fn clear(&mut self) {
        self.data.clear();
        self.cursor = 0;
    }

    /// Grow the receive window so a datagram of `len` bytes fits.
    ///
    /// The new window is rounded up to the next [`PENDING_BUCKET`] multiple. It never shrinks.
    pub fn reserve(&mut self, len: usize) {
        if len > self.window {
            self.window = round_up(len);
        }
    }

    /// Receive one datagram directly behind the waiting bytes.
    ///
    /// The window is first grown to fit `hint` bytes. `receive` gets the whole window; only the
    /// bytes it reports with [`Received::Data`] are kept, anything else leaves the buffer as it
    /// was.
    pub fn receive_with<F>(&mut self, hint: usize, receive: F) -> io::Result<Received>
    where
        F: FnOnce(&mut [u8]) -> io::Result<Received>,
    {
        self.reserve(hint);
        let start = self.data.len();
        self.data.resize(start + self.window, 0);
        let result = receive(&mut self.data[start..]);
        let kept = match result {
            Ok(Received::Data(n)) => n.min(self.window),
            _ => 0,
        };
        self.data.truncate(start + kept);
        result
    }
}

/// Round `len` up to the next bucket multiple, at least one bucket.
fn round_up(len: usize) -> usize {
    len.max(1).div_ceil(PENDING_BUCKET) * PENDING_BUCKET
}
