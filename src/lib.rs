//! bcast - broadcast a directory tree from one node to every node of a group
//!
//! The origin (rank 0) packs the source with tar and streams the archive
//! through a collective channel in fixed-size chunks; every participant
//! unpacks what it receives under the destination directory.
//!
//! ```text
//! bcast [OPTIONS] <SOURCE> [DEST]
//! ```

pub mod archive;
pub mod broadcast;
pub mod collective;
pub mod config;
pub mod error;
pub mod progress;
pub mod streaming;

pub use collective::{local_group, Collective, LocalMember, Rank, TcpOrigin, TcpPeer, ORIGIN};
pub use config::{BroadcastConfig, CliArgs, GroupConfig};
pub use error::{BcastError, CollectiveError, ConfigError, Result};
pub use streaming::{ByteSink, ByteSource, SessionClock, Throughput, TransferSession, TransferStats};
