//! Byte sink on every writing participant.
//!
//! Wraps the unpacking collaborator's input.

use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Sequential writer that never drops bytes silently
pub struct ByteSink<W> {
    writer: W,
    bytes_written: u64,
}

impl<W: AsyncWrite + Unpin> ByteSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            bytes_written: 0,
        }
    }

    /// Write all of `bytes`, retrying short writes.
    ///
    /// A write call that accepts nothing is a `WriteZero` fault.
    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < bytes.len() {
            match self.writer.write(&bytes[written..]).await {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!(
                            "sink accepted no bytes with {} of {} pending",
                            bytes.len() - written,
                            bytes.len()
                        ),
                    ))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.bytes_written += written as u64;
        Ok(())
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
