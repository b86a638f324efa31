//! Fixed-size read buffer.

use std::io::{self, Read};

use super::Reset;

/// A fixed-capacity byte buffer filled by a single read.
#[derive(Debug)]
pub struct ReadBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl ReadBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Perform one read from `source`, replacing the previous contents.
    pub fn read_from<R: Read>(&mut self, source: &mut R) -> io::Result<usize> {
        self.len = 0;
        let n = source.read(&mut self.data)?;
        self.len = n;
        Ok(n)
    }

    /// Bytes produced by the last read.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The last read used the whole buffer, so more data may be waiting.
    pub fn is_full(&self) -> bool {
        self.len == self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Reset for ReadBuffer {
    fn reset(&mut self) {
        self.len = 0;
    }
}
