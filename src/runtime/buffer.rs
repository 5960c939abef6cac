//! Per-connection echo buffering.
//!
//! Bytes read from a connection are appended here and drained to the
//! socket as it becomes writable. A single contiguous queue per connection
//! keeps echo order identical to read order, even across partial writes.

use bytes::{Buf, BytesMut};
use std::io::{self, Write};

/// Outcome of draining the queue into a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Everything queued has been written.
    Done,
    /// The writer would block; the rest stays queued.
    Blocked,
}

/// FIFO of bytes waiting to be echoed back.
#[derive(Debug, Default)]
pub struct EchoQueue {
    pending: BytesMut,
}

impl EchoQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one received chunk, preceded by `prefix` (may be empty).
    pub fn push(&mut self, prefix: &[u8], chunk: &[u8]) {
        self.pending.reserve(prefix.len() + chunk.len());
        self.pending.extend_from_slice(prefix);
        self.pending.extend_from_slice(chunk);
    }

    /// Bytes still waiting to be written.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Write as much as possible to `writer`.
    ///
    /// Returns the number of bytes written alongside whether the queue was
    /// fully drained. `WouldBlock` stops the drain without error.
    pub fn drain_into<W: Write>(&mut self, writer: &mut W) -> io::Result<(usize, Flush)> {
        let mut written = 0;

        while !self.pending.is_empty() {
            match writer.write(&self.pending) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    self.pending.advance(n);
                    written += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok((written, Flush::Blocked));
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok((written, Flush::Done))
    }

    /// Drop everything still queued.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer that accepts at most `limit` bytes per call and blocks after
    /// `budget` bytes in total.
    struct ThrottledWriter {
        out: Vec<u8>,
        limit: usize,
        budget: usize,
    }

    impl Write for ThrottledWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.limit).min(self.budget);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_push_keeps_order() {
        let mut queue = EchoQueue::new();
        queue.push(b"", b"first ");
        queue.push(b"", b"second");
        assert_eq!(queue.len(), 12);

        let mut out = Vec::new();
        let (n, flush) = queue.drain_into(&mut out).unwrap();
        assert_eq!(n, 12);
        assert_eq!(flush, Flush::Done);
        assert_eq!(out, b"first second");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_with_prefix() {
        let mut queue = EchoQueue::new();
        queue.push(b"Echo from server: ", b"Hello, server!");

        let mut out = Vec::new();
        queue.drain_into(&mut out).unwrap();
        assert_eq!(out, b"Echo from server: Hello, server!");
    }

    #[test]
    fn test_partial_writes_resume() {
        let mut queue = EchoQueue::new();
        queue.push(b"", b"abcdefghij");

        let mut writer = ThrottledWriter {
            out: Vec::new(),
            limit: 3,
            budget: 7,
        };
        let (n, flush) = queue.drain_into(&mut writer).unwrap();
        assert_eq!(n, 7);
        assert_eq!(flush, Flush::Blocked);
        assert_eq!(queue.len(), 3);

        // New data arriving while blocked goes behind the leftover bytes.
        queue.push(b"", b"XYZ");
        writer.budget = usize::MAX;
        let (n, flush) = queue.drain_into(&mut writer).unwrap();
        assert_eq!(n, 6);
        assert_eq!(flush, Flush::Done);
        assert_eq!(writer.out, b"abcdefghijXYZ");
    }

    #[test]
    fn test_write_zero_is_error() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut queue = EchoQueue::new();
        queue.push(b"", b"data");
        let err = queue.drain_into(&mut Closed).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert_eq!(queue.len(), 4);
    }
}
