//! Fixed-capacity ring buffer staging one direction of task I/O.
//!
//! The buffer tracks bookkeeping only: callers copy into [`write_slice`] or
//! out of [`read_slice`] themselves and then commit the byte count with
//! [`write_update`] / [`read_update`]. Cursors wrap modulo capacity and the
//! buffer never grows.
//!
//! [`write_slice`]: CircularBuffer::write_slice
//! [`read_slice`]: CircularBuffer::read_slice
//! [`write_update`]: CircularBuffer::write_update
//! [`read_update`]: CircularBuffer::read_update

use nagent_proto::transport::{read_stream, write_stream};
use std::io::{self, Read, Write};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CircularBufferError {
    #[error("circular buffer capacity must be non-zero")]
    ZeroCapacity,

    #[error("write of {requested} bytes exceeds {writable} writable")]
    Overflow { requested: usize, writable: usize },

    #[error("read of {requested} bytes exceeds {readable} readable")]
    Underflow { requested: usize, readable: usize },
}

#[derive(Debug)]
pub struct CircularBuffer {
    storage: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    readable: usize,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Result<Self, CircularBufferError> {
        if capacity == 0 {
            return Err(CircularBufferError::ZeroCapacity);
        }
        Ok(Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            readable: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn readable_bytes(&self) -> usize {
        self.readable
    }

    pub fn writable_bytes(&self) -> usize {
        self.capacity() - self.readable
    }

    pub fn is_empty(&self) -> bool {
        self.readable == 0
    }

    pub fn is_full(&self) -> bool {
        self.readable == self.capacity()
    }

    /// Contiguous free region starting at the write cursor.
    pub fn write_slice(&mut self) -> &mut [u8] {
        let len = self.writable_bytes().min(self.capacity() - self.write_pos);
        &mut self.storage[self.write_pos..self.write_pos + len]
    }

    /// Contiguous unread region starting at the read cursor.
    pub fn read_slice(&self) -> &[u8] {
        let len = self.readable.min(self.capacity() - self.read_pos);
        &self.storage[self.read_pos..self.read_pos + len]
    }

    /// Commit `n` bytes placed by the producer.
    pub fn write_update(&mut self, n: usize) -> Result<(), CircularBufferError> {
        let writable = self.writable_bytes();
        if n > writable {
            return Err(CircularBufferError::Overflow {
                requested: n,
                writable,
            });
        }
        self.write_pos = (self.write_pos + n) % self.capacity();
        self.readable += n;
        Ok(())
    }

    /// Commit `n` bytes taken by the consumer.
    pub fn read_update(&mut self, n: usize) -> Result<(), CircularBufferError> {
        if n > self.readable {
            return Err(CircularBufferError::Underflow {
                requested: n,
                readable: self.readable,
            });
        }
        self.read_pos = (self.read_pos + n) % self.capacity();
        self.readable -= n;
        Ok(())
    }

    /// One read from `source` into free space. Returns 0 at end of input or
    /// when the buffer is full.
    pub fn fill_from<R: Read>(&mut self, source: &mut R) -> io::Result<usize> {
        let slice = self.write_slice();
        if slice.is_empty() {
            return Ok(0);
        }
        let n = read_stream(source, slice)?;
        self.write_update(n).map_err(io::Error::other)?;
        Ok(n)
    }

    /// One write of buffered bytes into `sink`. May be a short count.
    pub fn drain_to<W: Write>(&mut self, sink: &mut W) -> io::Result<usize> {
        let slice = self.read_slice();
        if slice.is_empty() {
            return Ok(0);
        }
        let n = write_stream(sink, slice)?;
        self.read_update(n).map_err(io::Error::other)?;
        Ok(n)
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.readable = 0;
    }
}
