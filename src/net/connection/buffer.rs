use crate::{Error, Result};

/// The receive side buffer of a connection. The reader fills it through a two step protocol:
/// [InputBuffer::request_space] exposes free space, and [InputBuffer::acknowledge] commits
/// however many bytes the transport actually wrote into it. Nothing written into requested space
/// is visible to consumers until it has been acknowledged.
///
/// Consumed bytes are reclaimed lazily, the unread tail is only moved to the front when a request
/// would not otherwise fit.
#[derive(Debug)]
pub struct InputBuffer {
    buf: Vec<u8>,
    read: usize,
    write: usize,
    requested: usize,
    max_buffered: usize,
}

impl InputBuffer {
    pub fn new(max_buffered: usize) -> InputBuffer {
        InputBuffer {
            buf: Vec::new(),
            read: 0,
            write: 0,
            requested: 0,
            max_buffered,
        }
    }

    /// Expose at least `min` bytes of writable space, growing the buffer if needed. The region
    /// is only empty when `min` is zero, and `None` is returned when the consumer has fallen
    /// behind by `max_buffered` bytes or more.
    ///
    /// A new request replaces any outstanding one.
    pub fn request_space(&mut self, min: usize) -> Option<&mut [u8]> {
        self.requested = 0;
        if min == 0 {
            return Some(&mut self.buf[self.write..self.write]);
        }
        if self.len() >= self.max_buffered {
            return None;
        }

        if self.buf.len() - self.write < min {
            self.compact();
        }
        if self.buf.len() - self.write < min {
            self.buf.resize(self.write + min, 0);
        }

        self.requested = self.buf.len() - self.write;
        Some(&mut self.buf[self.write..])
    }

    /// Commit the first `n` bytes of the outstanding request. Acknowledging more than was
    /// requested fails and leaves the buffer untouched.
    pub fn acknowledge(&mut self, n: usize) -> Result<()> {
        if n > self.requested {
            return Err(Error::AckOverflow {
                acknowledged: n,
                requested: self.requested,
            });
        }
        self.write += n;
        self.requested = 0;
        Ok(())
    }

    /// The number of committed, unread bytes.
    pub fn len(&self) -> usize {
        self.write - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The committed, unread bytes.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read..self.write]
    }

    /// Drop up to `n` unread bytes, returning how many were dropped.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        self.read += n;
        if self.read == self.write && self.requested == 0 {
            self.read = 0;
            self.write = 0;
        }
        n
    }

    /// Copy unread bytes into `dst` and consume them.
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len());
        dst[..n].copy_from_slice(&self.buf[self.read..self.read + n]);
        self.consume(n)
    }

    fn compact(&mut self) {
        if self.read == 0 {
            return;
        }
        self.buf.copy_within(self.read..self.write, 0);
        self.write -= self.read;
        self.read = 0;
    }
}
