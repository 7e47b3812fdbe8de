//! Byte source on the origin.
//!
//! Wraps the packing collaborator's output and hands out chunks that are
//! as full as the stream allows.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Sequential reader that fills whole chunks
pub struct ByteSource<R> {
    reader: R,
    bytes_read: u64,
    exhausted: bool,
}

impl<R: AsyncRead + Unpin> ByteSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            bytes_read: 0,
            exhausted: false,
        }
    }

    /// Fill `buf` until it is full or the stream ends.
    ///
    /// Returns the number of bytes placed; 0 only once the stream is at
    /// end-of-data. Short reads from the underlying stream are retried, so a
    /// return value below `buf.len()` always means the stream is exhausted.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.exhausted {
            return Ok(0);
        }

        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]).await {
                Ok(0) => {
                    self.exhausted = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.bytes_read += filled as u64;
        Ok(filled)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}
