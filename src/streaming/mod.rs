//! Chunked broadcast of one byte stream to every participant.
//!
//! # Architecture
//!
//! ```text
//!  origin                                   every participant
//! +------------+   read_chunk   +---------+  broadcast   +----------+
//! | ByteSource | -------------> | session | -----------> | ByteSink |
//! | (tar -c)   |                | buffer  |  size, bytes | (tar -x) |
//! +------------+                +---------+              +----------+
//! ```
//!
//! Each iteration announces the chunk size first, so every participant
//! knows how much payload follows and a size of 0 ends the loop on every
//! participant at once. The chunk buffer is allocated once and reused, which
//! bounds memory by the chunk capacity regardless of stream length.

pub mod channel;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod timing;

pub use channel::{TransferStats, DEFAULT_CHUNK_CAPACITY, GIB, MAX_CHUNK_CAPACITY};
pub use pipeline::{LoopState, TransferSession};
pub use sink::ByteSink;
pub use source::ByteSource;
pub use timing::{reduce_elapsed, SessionClock, Throughput};
