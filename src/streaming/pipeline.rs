//! Transfer loop: the chunked broadcast-and-materialize state machine.
//!
//! Every participant runs the same loop in lock step:
//!
//! 1. origin fills the chunk buffer from its source
//! 2. chunk size is broadcast (0 ends the loop everywhere)
//! 3. chunk bytes are broadcast into every participant's buffer
//! 4. writers hand the chunk to their sink
//!
//! Any fault aborts the whole group before it is returned.

use crate::collective::Collective;
use crate::error::{BcastError, CollectiveError, ConfigError, Result};
use crate::streaming::channel::TransferStats;
use crate::streaming::sink::ByteSink;
use crate::streaming::source::ByteSource;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, trace};

/// Loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Done,
}

/// Per-process transfer state: one reusable chunk buffer and its counters.
pub struct TransferSession {
    buffer: Vec<u8>,
    state: LoopState,
    stats: TransferStats,
}

impl TransferSession {
    /// Allocate the chunk buffer. `capacity` bounds every chunk.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ConfigError::InvalidChunkSize {
                value: 0,
                max: crate::streaming::channel::MAX_CHUNK_CAPACITY,
            }
            .into());
        }
        Ok(Self {
            buffer: vec![0u8; capacity],
            state: LoopState::Running,
            stats: TransferStats::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run the loop to completion.
    ///
    /// The origin must pass a source; every participant that materializes
    /// locally passes a sink. `on_chunk` sees each non-terminal chunk size
    /// after it has been consumed. The session (and its buffer) is gone once
    /// this returns.
    pub async fn run<C, R, W, F>(
        mut self,
        channel: &mut C,
        source: Option<&mut ByteSource<R>>,
        sink: Option<&mut ByteSink<W>>,
        on_chunk: F,
    ) -> Result<TransferStats>
    where
        C: Collective + ?Sized,
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        F: FnMut(u64),
    {
        let rank = channel.rank();
        match self.drive(channel, source, sink, on_chunk).await {
            Ok(()) => {
                debug!(
                    rank,
                    chunks = self.stats.chunks,
                    total_bytes = self.stats.total_bytes,
                    "transfer loop done"
                );
                Ok(self.stats)
            }
            Err(err) => {
                error!(rank, error = %err, "transfer failed, aborting group");
                channel.abort(&err.to_string()).await;
                Err(err)
            }
        }
    }

    async fn drive<C, R, W, F>(
        &mut self,
        channel: &mut C,
        mut source: Option<&mut ByteSource<R>>,
        mut sink: Option<&mut ByteSink<W>>,
        mut on_chunk: F,
    ) -> Result<()>
    where
        C: Collective + ?Sized,
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        F: FnMut(u64),
    {
        let rank = channel.rank();
        let is_origin = channel.is_origin();
        if is_origin && source.is_none() {
            return Err(ConfigError::MissingSource.into());
        }

        while self.state == LoopState::Running {
            // Produce
            let produced = match source.as_deref_mut() {
                Some(src) if is_origin => src
                    .read_chunk(&mut self.buffer)
                    .await
                    .map_err(|source| BcastError::SourceRead { source })?,
                _ => 0,
            };

            // Announce size
            let chunk_size = channel.broadcast_scalar(produced as u64).await?;
            let writes = sink.is_some();
            self.stats.record(chunk_size, writes);

            if chunk_size == 0 {
                self.state = LoopState::Done;
                break;
            }

            let len = usize::try_from(chunk_size)
                .ok()
                .filter(|len| *len <= self.buffer.len())
                .ok_or_else(|| {
                    CollectiveError::Protocol(format!(
                        "announced chunk of {} bytes exceeds buffer capacity {}",
                        chunk_size,
                        self.buffer.len()
                    ))
                })?;
            trace!(rank, chunk_size, "chunk announced");

            // Transfer payload
            channel.broadcast_bytes(&mut self.buffer[..len]).await?;

            // Consume
            if let Some(sink) = sink.as_deref_mut() {
                sink.write_all(&self.buffer[..len])
                    .await
                    .map_err(|source| BcastError::SinkWrite { rank, source })?;
            }

            on_chunk(chunk_size);
        }

        if let Some(sink) = sink.as_deref_mut() {
            sink.flush()
                .await
                .map_err(|source| BcastError::SinkWrite { rank, source })?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::local_group;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_single_member_group_copies_stream() {
        let mut group = local_group(1);
        let mut origin = group.remove(0);

        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut source = ByteSource::new(Cursor::new(data.clone()));
        let mut sink = ByteSink::new(Vec::new());

        let mut seen = Vec::new();
        let stats = TransferSession::new(300)
            .unwrap()
            .run(&mut origin, Some(&mut source), Some(&mut sink), |n| {
                seen.push(n)
            })
            .await
            .unwrap();

        assert_eq!(stats.chunk_sizes, vec![300, 300, 300, 100, 0]);
        assert_eq!(seen, vec![300, 300, 300, 100]);
        assert_eq!(stats.total_bytes, 1000);
        assert_eq!(sink.into_inner(), data);
    }

    #[tokio::test]
    async fn test_exact_multiple_of_capacity() {
        let mut group = local_group(1);
        let mut origin = group.remove(0);
        let mut source = ByteSource::new(Cursor::new(vec![7u8; 64]));

        let stats = TransferSession::new(32)
            .unwrap()
            .run(
                &mut origin,
                Some(&mut source),
                None::<&mut ByteSink<Vec<u8>>>,
                |_| {},
            )
            .await
            .unwrap();

        assert_eq!(stats.chunk_sizes, vec![32, 32, 0]);
        assert_eq!(stats.bytes_written, 0);
        assert_eq!(stats.total_bytes, 64);
    }

    #[tokio::test]
    async fn test_origin_without_source_is_rejected() {
        let mut group = local_group(1);
        let mut origin = group.remove(0);

        let err = TransferSession::new(16)
            .unwrap()
            .run(
                &mut origin,
                None::<&mut ByteSource<Cursor<Vec<u8>>>>,
                None::<&mut ByteSink<Vec<u8>>>,
                |_| {},
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BcastError::Config(ConfigError::MissingSource)));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(TransferSession::new(0).is_err());
        let session = TransferSession::new(8).unwrap();
        assert_eq!(session.capacity(), 8);
        assert_eq!(session.state(), LoopState::Running);
    }
}
