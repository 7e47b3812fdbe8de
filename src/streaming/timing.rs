//! Group-wide timing: each participant measures its own wall time and the
//! origin reports throughput against the slowest one.

use crate::collective::Collective;
use crate::error::CollectiveError;
use crate::streaming::channel::GIB;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Wall-clock start of a participant's session
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    started: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Reduce every participant's elapsed time to the group maximum.
///
/// Collective: all participants must call it. Only the origin gets `Some`.
/// A failed reduction aborts the group before returning.
pub async fn reduce_elapsed<C>(
    channel: &mut C,
    elapsed: Duration,
) -> Result<Option<f64>, CollectiveError>
where
    C: Collective + ?Sized,
{
    let secs = elapsed.as_secs_f64();
    match channel.reduce_max(secs).await {
        Ok(max) => {
            debug!(rank = channel.rank(), elapsed_secs = secs, max_elapsed_secs = ?max, "timing reduced");
            Ok(max)
        }
        Err(err) => {
            error!(rank = channel.rank(), error = %err, "timing reduction failed, aborting group");
            channel.abort(&err.to_string()).await;
            Err(err)
        }
    }
}

/// Effective group throughput, computed on the origin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub total_bytes: u64,
    pub max_elapsed_secs: f64,
}

impl Throughput {
    pub fn new(total_bytes: u64, max_elapsed_secs: f64) -> Self {
        Self {
            total_bytes,
            max_elapsed_secs,
        }
    }

    /// `total_bytes / max_elapsed`, or `None` when no positive time was measured.
    pub fn bytes_per_sec(&self) -> Option<f64> {
        if self.max_elapsed_secs > 0.0 && self.max_elapsed_secs.is_finite() {
            Some(self.total_bytes as f64 / self.max_elapsed_secs)
        } else {
            None
        }
    }

    pub fn gib(&self) -> f64 {
        self.total_bytes as f64 / GIB
    }

    pub fn gib_per_sec(&self) -> Option<f64> {
        self.bytes_per_sec().map(|rate| rate / GIB)
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transferred {:.2} GiB in {:.2} seconds",
            self.gib(),
            self.max_elapsed_secs
        )?;
        match self.gib_per_sec() {
            Some(rate) => write!(f, " ({:.2} GiB/s)", rate),
            None => write!(f, " (rate unavailable)"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::local_group;

    #[test]
    fn test_throughput_math() {
        let t = Throughput::new(4 * 1024 * 1024 * 1024, 2.0);
        assert_eq!(t.bytes_per_sec(), Some(2.0 * GIB));
        assert_eq!(t.gib_per_sec(), Some(2.0));
        assert_eq!(
            t.to_string(),
            "Transferred 4.00 GiB in 2.00 seconds (2.00 GiB/s)"
        );
    }

    #[test]
    fn test_throughput_without_elapsed_time() {
        let t = Throughput::new(1024, 0.0);
        assert_eq!(t.bytes_per_sec(), None);
        assert!(t.to_string().ends_with("(rate unavailable)"));
    }

    #[test]
    fn test_zero_bytes_is_zero_rate() {
        let t = Throughput::new(0, 1.5);
        assert_eq!(t.bytes_per_sec(), Some(0.0));
    }

    #[tokio::test]
    async fn test_reduce_elapsed_reports_slowest_to_origin() {
        let members = local_group(3);
        let handles: Vec<_> = members
            .into_iter()
            .enumerate()
            .map(|(i, mut member)| {
                tokio::spawn(async move {
                    let elapsed = Duration::from_millis(100 * (i as u64 + 1));
                    reduce_elapsed(&mut member, elapsed).await
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(results[0], Some(0.3));
        assert_eq!(results[1], None);
        assert_eq!(results[2], None);
    }

    #[test]
    fn test_clock_moves_forward() {
        let clock = SessionClock::start();
        std::thread::sleep(Duration::from_millis(5));
        assert!(clock.elapsed() >= Duration::from_millis(5));
    }
}
