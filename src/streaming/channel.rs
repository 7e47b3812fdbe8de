//! Shared constants and counters for the transfer loop.

/// Default chunk buffer capacity (1GB)
pub const DEFAULT_CHUNK_CAPACITY: usize = 1 << 30;

/// Largest chunk a single broadcast may carry (2GB, fits a u32 frame length)
pub const MAX_CHUNK_CAPACITY: usize = 1 << 31;

/// Bytes per GiB, used for reporting
pub const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

// =============================================================================
// Transfer statistics
// =============================================================================

/// Statistics for one participant's run of the transfer loop
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferStats {
    /// Non-terminal iterations (chunks that carried payload)
    pub chunks: u64,

    /// Bytes moved through the loop, whether or not they were written locally
    pub total_bytes: u64,

    /// Bytes handed to the local sink
    pub bytes_written: u64,

    /// Every announced chunk size in order, including the terminal 0
    pub chunk_sizes: Vec<u64>,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, chunk_size: u64, written: bool) {
        self.chunk_sizes.push(chunk_size);
        if chunk_size == 0 {
            return;
        }
        self.chunks += 1;
        self.total_bytes += chunk_size;
        if written {
            self.bytes_written += chunk_size;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
