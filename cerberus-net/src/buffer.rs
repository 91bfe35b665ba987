use slice_deque::SliceDeque;
use std::io::{self, IoSlice};

type ByteDeque = SliceDeque<u8>;

/// Buffers grow in increments of this size once their current capacity is exhausted.
const GROWTH_INCREMENT: usize = 16 * 1024;

/// A dynamically growing, double ended byte queue. Data is appended at the tail and consumed
/// from the head. Unlike a fixed-size ring buffer, a `Buffer` never refuses an `ingress()` call
/// for want of capacity: it grows instead, since a proxied connection has no a priori bound on
/// the size of a pipelined request or a bulk reply.
pub struct Buffer {
    data: ByteDeque,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer::with_capacity(GROWTH_INCREMENT)
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Buffer {
        let mut data = ByteDeque::new();
        data.reserve(capacity);
        Buffer { data }
    }

    /// The number of bytes currently held in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total backing capacity, grown or not — used by callers that aggregate memory usage
    /// across every connection's buffers for reporting.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Remaining free capacity before the next write forces a growth.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    #[inline]
    pub fn move_head(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        unsafe { self.data.move_tail(count as isize) }
    }

    /// Slice of the bytes currently held in the buffer, oldest first.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        self.move_head(len);
    }

    /// Drops the first `count` bytes of the buffer, shifting the remainder toward the head.
    /// Used once a complete request or reply has been consumed out of a pipelined stream.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len(), "cannot consume past the tail");
        self.move_head(count);
    }

    /// Appends a byte slice at the tail, growing the backing store if necessary.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        while self.free_capacity() < bytes.len() {
            self.grow();
        }
        self.data.extend_from_slice(bytes);
    }

    fn grow(&mut self) {
        self.data.reserve(GROWTH_INCREMENT);
    }

    /// Reads from `reader` into the buffer until it reports `WouldBlock` or EOF.
    ///
    /// Returns `Ok(n)` with the number of bytes ingested this call; `n == 0` means the peer
    /// closed the connection (a true `read() == 0`). A `WouldBlock` error is propagated as-is
    /// once the source has no more data ready — callers distinguish it from a fatal I/O error
    /// by inspecting `io::Error::kind()`, same as any other non-blocking read.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let orig_capacity = self.free_capacity();

        loop {
            if self.free_capacity() == 0 {
                self.grow();
            }

            let read_count = reader.read(unsafe { self.data.tail_head_slice() })?;

            if read_count == 0 {
                return Ok(orig_capacity - self.free_capacity());
            }

            self.move_tail(read_count);
        }
    }

    /// Writes the contents of the buffer to `writer`, advancing the head as bytes are
    /// acknowledged. Returns the number of bytes actually flushed; a `WouldBlock` error is
    /// propagated once the destination refuses further writes.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.data.len();

        while self.data.len() > 0 {
            let write_count = writer.write(&self.data)?;

            if write_count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.move_head(write_count);
        }

        Ok(orig_len - self.data.len())
    }

    /// Writes this buffer's backlog together with `extra` additional slices in one gather-write
    /// (`writev` on platforms whose `Write` impl overrides `write_vectored`), instead of copying
    /// `extra` in first. Whatever `extra` isn't covered by this call is appended to the backlog
    /// so a later plain `egress()` call picks it up in order — callers don't need to track which
    /// slices got flushed.
    pub fn egress_vectored<W: io::Write>(&mut self, mut writer: W, extra: &[&[u8]]) -> io::Result<usize> {
        if self.data.is_empty() && extra.iter().all(|s| s.is_empty()) {
            return Ok(0);
        }

        let mut slices: Vec<IoSlice> = Vec::with_capacity(1 + extra.len());
        if !self.data.is_empty() {
            slices.push(IoSlice::new(&self.data));
        }
        for s in extra {
            if !s.is_empty() {
                slices.push(IoSlice::new(s));
            }
        }

        let written = writer.write_vectored(&slices)?;
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }

        let mut remaining = written;

        let from_backlog = remaining.min(self.data.len());
        if from_backlog > 0 {
            self.move_head(from_backlog);
        }
        remaining -= from_backlog;

        for s in extra {
            if s.is_empty() {
                continue;
            }
            if remaining >= s.len() {
                remaining -= s.len();
            } else {
                self.extend(&s[remaining..]);
                remaining = 0;
            }
        }

        Ok(written)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}
