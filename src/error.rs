//! Error types for bcast
//!
//! Every fault here is fatal for the whole group: a participant that hits
//! one aborts the group instead of retrying, because a skipped chunk would
//! desynchronize the byte streams of the other participants.

use crate::collective::Rank;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for a broadcast participant
#[derive(Error, Debug)]
pub enum BcastError {
    /// The origin's byte stream reported a fault distinct from end-of-data
    #[error("origin read error: {source}")]
    SourceRead {
        #[source]
        source: io::Error,
    },

    /// A participant's sink refused bytes or made no progress
    #[error("rank {rank}: write error (disk full?): {source}")]
    SinkWrite {
        rank: Rank,
        #[source]
        source: io::Error,
    },

    /// The group transport failed or another participant aborted
    #[error(transparent)]
    Collective(#[from] CollectiveError),

    /// A packing or unpacking child process failed
    #[error("archive {op} failed: {reason}")]
    Archive { op: &'static str, reason: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Local I/O outside the transfer loop (spawning, directories)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Interrupted by signal
    #[error("Operation interrupted by signal")]
    Interrupted,
}

/// Collective channel failures
#[derive(Error, Debug)]
pub enum CollectiveError {
    /// Some participant called abort; the group is torn down
    #[error("group aborted by rank {rank}: {reason}")]
    Aborted { rank: Rank, reason: String },

    /// A participant's link closed before the collective completed
    #[error("rank {rank} disconnected")]
    Disconnected { rank: Rank },

    /// Transport-level I/O failure on the link to a participant
    #[error("transport error with rank {rank}: {source}")]
    Transport {
        rank: Rank,
        #[source]
        source: io::Error,
    },

    /// A participant sent something the collective call pattern does not allow
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The group could not be formed
    #[error("rendezvous failed: {0}")]
    Rendezvous(String),
}

impl CollectiveError {
    /// Map an I/O error on the link to `rank`; EOF means the peer went away.
    pub fn link(rank: Rank, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => Self::Disconnected { rank },
            _ => Self::Transport { rank, source: err },
        }
    }
}

/// Configuration validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Chunk size must be between 1 and {max} bytes, got {value}")]
    InvalidChunkSize { value: u64, max: usize },

    #[error("Cannot parse size '{0}' (expected e.g. 1048576, 512K, 64M, 1G)")]
    UnparsableSize(String),

    #[error("Group size must be at least 1")]
    EmptyGroup,

    #[error("Rank {rank} is out of range for a group of {size}")]
    RankOutOfRange { rank: Rank, size: usize },

    #[error("Rank {rank} needs the origin address (--origin or BCAST_ORIGIN)")]
    MissingOrigin { rank: Rank },

    #[error("Invalid address '{value}': {reason}")]
    InvalidAddress { value: String, reason: String },

    #[error("Failed to load config file '{path}': {reason}")]
    ConfigFile { path: PathBuf, reason: String },

    #[error("Source path does not exist: {0}")]
    SourceMissing(PathBuf),

    #[error("Source path has no final component to archive: {0}")]
    InvalidSourcePath(PathBuf),

    #[error("The origin needs a byte source")]
    MissingSource,
}

/// Result type alias using BcastError
pub type Result<T> = std::result::Result<T, BcastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_the_failing_side() {
        let read = BcastError::SourceRead {
            source: io::Error::new(io::ErrorKind::Other, "bad sector"),
        };
        assert!(read.to_string().starts_with("origin read error"));

        let write = BcastError::SinkWrite {
            rank: 3,
            source: io::Error::new(io::ErrorKind::WriteZero, "no space"),
        };
        assert!(write.to_string().contains("rank 3: write error"));
    }

    #[test]
    fn test_link_error_maps_eof_to_disconnect() {
        let err = CollectiveError::link(2, io::ErrorKind::UnexpectedEof.into());
        assert!(matches!(err, CollectiveError::Disconnected { rank: 2 }));

        let err = CollectiveError::link(2, io::ErrorKind::PermissionDenied.into());
        assert!(matches!(err, CollectiveError::Transport { rank: 2, .. }));
    }

    #[test]
    fn test_collective_error_is_transparent() {
        let err: BcastError = CollectiveError::Aborted {
            rank: 1,
            reason: "disk full".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "group aborted by rank 1: disk full");
    }
}
