//! Bounded peek buffer in front of a stream.
//!
//! The PROXY protocol header is variable length, so it is not possible to read
//! a fixed number of bytes from the stream, and reading it byte by byte is
//! inefficient. [`PeekReader`] reads ahead into a buffer of bounded capacity
//! to look for a header, then replays whatever was read past the header before
//! reading from the stream again. No payload byte is lost or duplicated.
//!
//! ```
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::io::{Cursor, Read};
//! use proxied_listener::io::PeekReader;
//!
//! let mut stream = PeekReader::new(Cursor::new(b"GET / HTTP/1.1\r\n".to_vec()));
//! assert_eq!(stream.peek(3)?, b"GET");
//!
//! let mut buf = String::new();
//! stream.read_to_string(&mut buf)?;
//! assert_eq!(buf, "GET / HTTP/1.1\r\n");
//! # Ok(())
//! # }
//! ```
use std::io::{self, Read};

use crate::v2::{self, AddressBlock, Scan};
use crate::{Error, DEFAULT_MAX_HEADER_LEN};

/// Reader that can look ahead up to a fixed number of bytes.
///
/// See [module level documentation](`crate::io`)
#[derive(Debug)]
pub struct PeekReader<R> {
    inner: R,
    remaining: Vec<u8>,
    capacity: usize,
    eof: bool,
}

impl<R> PeekReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(DEFAULT_MAX_HEADER_LEN, inner)
    }

    pub fn with_capacity(capacity: usize, inner: R) -> Self {
        Self {
            inner,
            remaining: Vec::new(),
            capacity,
            eof: false,
        }
    }

    /// Bytes read ahead and not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.remaining
    }

    /// Drops up to `amt` buffered bytes and returns how many were dropped.
    pub fn discard(&mut self, amt: usize) -> usize {
        let len = std::cmp::min(self.remaining.len(), amt);
        self.remaining.drain(..len);
        len
    }

    /// Gets a reference to the underlying stream.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Consumes this wrapper, returning the underlying stream.
    ///
    /// Buffered bytes are lost.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R> PeekReader<R>
where
    R: Read,
{
    /// Reads once more from the stream into the buffer.
    ///
    /// Returns the number of bytes added, 0 at the end of the stream or when
    /// the buffer is full.
    fn fill_more(&mut self) -> io::Result<usize> {
        let len = self.remaining.len();
        let room = self.capacity.saturating_sub(len);
        if room == 0 || self.eof {
            return Ok(0);
        }

        self.remaining.resize(len + room, 0);
        let res = loop {
            match self.inner.read(&mut self.remaining[len..]) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                res => break res,
            }
        };

        let read = *res.as_ref().unwrap_or(&0);
        self.remaining.truncate(len + read);
        if read == 0 && res.is_ok() {
            self.eof = true;
        }
        res
    }

    /// Returns the first `n` bytes of the stream without consuming them.
    ///
    /// Blocks until `n` bytes are available. Fewer bytes are returned if the
    /// stream ends first or if `n` exceeds the capacity of the buffer.
    pub fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.remaining.len() < n && self.fill_more()? > 0 {}

        let len = std::cmp::min(n, self.remaining.len());
        Ok(&self.remaining[..len])
    }

    /// Looks for a version 2 header at the start of the stream and consumes it.
    ///
    /// Returns `Ok(None)` and leaves the stream untouched if it does not start
    /// with the protocol signature.
    pub fn read_header(&mut self) -> Result<Option<AddressBlock>, Error> {
        loop {
            match v2::scan(&self.remaining, self.capacity, self.eof) {
                Scan::NeedMore => {
                    if self.fill_more()? == 0 {
                        // full buffer, scan again as if the stream ended
                        self.eof = true;
                    }
                }
                Scan::Passthrough => return Ok(None),
                Scan::Header(block, consumed) => {
                    self.discard(consumed);
                    return Ok(Some(block));
                }
                Scan::Failed(e) => return Err(e),
            }
        }
    }
}

impl<R> Read for PeekReader<R>
where
    R: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.remaining.is_empty() {
            let len = std::cmp::min(self.remaining.len(), buf.len());

            buf[..len].copy_from_slice(&self.remaining[..len]);
            self.remaining.drain(..len);

            return Ok(len);
        }

        self.inner.read(buf)
    }
}
