//! Collective channel for a fixed group of participants.
//!
//! Every participant must issue the same collective calls in the same
//! order. Rank 0 is the origin: it supplies the values that are broadcast
//! and receives the result of reductions.
//!
//! # Transports
//!
//! ```text
//!               +-----------+
//!               |  origin   |  rank 0
//!               +-----------+
//!              /      |      \
//!     +--------+ +--------+ +--------+
//!     | rank 1 | | rank 2 | | rank 3 |
//!     +--------+ +--------+ +--------+
//! ```
//!
//! - [`local`]: in-process group of tasks joined by bounded channels.
//! - [`tcp`]: one process per node, star rendezvous on the origin.

pub mod local;
pub mod protocol;
pub mod tcp;

use crate::error::CollectiveError;
use async_trait::async_trait;

pub use local::{local_group, LocalMember};
pub use tcp::{TcpOrigin, TcpPeer};

/// Position of a participant in the group
pub type Rank = usize;

/// The participant that owns the byte source
pub const ORIGIN: Rank = 0;

/// Broadcast and reduction primitives the transfer loop depends on.
#[async_trait]
pub trait Collective: Send {
    fn rank(&self) -> Rank;

    fn size(&self) -> usize;

    fn is_origin(&self) -> bool {
        self.rank() == ORIGIN
    }

    /// Origin supplies `value`; every participant gets the origin's value back.
    async fn broadcast_scalar(&mut self, value: u64) -> Result<u64, CollectiveError>;

    /// Origin supplies `buf`; every other participant's `buf` (same length)
    /// is overwritten with an identical copy. Never called with an empty buffer.
    async fn broadcast_bytes(&mut self, buf: &mut [u8]) -> Result<(), CollectiveError>;

    /// Maximum of every participant's `value`, delivered to the origin only.
    async fn reduce_max(&mut self, value: f64) -> Result<Option<f64>, CollectiveError>;

    /// Tear the whole group down. Best effort and idempotent.
    async fn abort(&mut self, reason: &str);
}
