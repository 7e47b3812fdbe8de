//! Process orchestration: join the group, open the archive endpoints, run
//! the transfer loop, close the endpoints, and reduce the timing.
//!
//! Every participant runs [`run`]; the origin is the only one that gets a
//! [`Throughput`] back.

use crate::archive::{Packer, Unpacker};
use crate::collective::{local_group, Collective, TcpOrigin, TcpPeer};
use crate::config::{BroadcastConfig, GroupConfig};
use crate::error::{BcastError, CollectiveError, ConfigError, Result};
use crate::progress::TransferProgress;
use crate::streaming::{
    reduce_elapsed, ByteSink, ByteSource, SessionClock, Throughput, TransferSession, TransferStats,
};
use tokio::process::{ChildStdin, ChildStdout};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Join the group described by `group`.
///
/// A group of one never touches the network.
pub async fn connect(group: &GroupConfig) -> Result<Box<dyn Collective>> {
    if group.size == 1 {
        let member = local_group(1)
            .into_iter()
            .next()
            .ok_or_else(|| CollectiveError::Rendezvous("empty local group".to_string()))?;
        return Ok(Box::new(member));
    }

    if group.is_origin() {
        let origin = TcpOrigin::listen(group.bind, group.size, group.connect_timeout).await?;
        Ok(Box::new(origin))
    } else {
        let addr = group
            .origin
            .as_deref()
            .ok_or(ConfigError::MissingOrigin { rank: group.rank })?;
        let peer = TcpPeer::connect(addr, group.rank, group.size, group.connect_timeout).await?;
        Ok(Box::new(peer))
    }
}

/// Run one participant end to end.
pub async fn run(config: &BroadcastConfig) -> Result<Option<Throughput>> {
    let rank = config.group.rank;
    async move {
        let clock = SessionClock::start();
        let mut channel = connect(&config.group).await?;
        info!(size = channel.size(), "joined group");

        let outcome = tokio::select! {
            res = run_with(config, &mut *channel, clock) => Some(res),
            Ok(()) = tokio::signal::ctrl_c() => None,
        };

        match outcome {
            Some(res) => res,
            None => {
                warn!("interrupted, aborting group");
                channel.abort("interrupted by signal").await;
                Err(BcastError::Interrupted)
            }
        }
    }
    .instrument(info_span!("bcast", rank))
    .await
}

/// Run one participant over an already formed group.
///
/// `clock` marks the start of this participant's session. Any fault aborts
/// the group before it is returned.
pub async fn run_with<C>(
    config: &BroadcastConfig,
    channel: &mut C,
    clock: SessionClock,
) -> Result<Option<Throughput>>
where
    C: Collective + ?Sized,
{
    let stats = match transfer(config, channel).await {
        Ok(stats) => stats,
        Err(err) => {
            error!(error = %err, "broadcast failed, aborting group");
            channel.abort(&err.to_string()).await;
            return Err(err);
        }
    };

    let max_elapsed = reduce_elapsed(channel, clock.elapsed()).await?;
    Ok(max_elapsed.map(|secs| Throughput::new(stats.total_bytes, secs)))
}

async fn transfer<C>(config: &BroadcastConfig, channel: &mut C) -> Result<TransferStats>
where
    C: Collective + ?Sized,
{
    let is_origin = channel.is_origin();

    let mut packer = None;
    let mut source: Option<ByteSource<ChildStdout>> = None;
    if is_origin {
        println!(
            "bcast: Broadcasting {} to {}...",
            config.source.display(),
            config.dest.display()
        );
        let (child, stream) = Packer::spawn(&config.tar_program, &config.source)?;
        packer = Some(child);
        source = Some(stream);
    }

    let mut unpacker = None;
    let mut sink: Option<ByteSink<ChildStdin>> = None;
    if !is_origin || config.origin_writes_locally {
        let (child, stream) = Unpacker::spawn(&config.tar_program, &config.dest).await?;
        unpacker = Some(child);
        sink = Some(stream);
    } else {
        debug!("origin skips local write");
    }

    let progress = TransferProgress::new(is_origin && config.show_progress);
    let session = TransferSession::new(config.chunk_capacity)?;
    let result = session
        .run(channel, source.as_mut(), sink.as_mut(), |n| progress.inc(n))
        .await;
    progress.finish();

    // Close both pipes so the children see end-of-stream.
    drop(source);
    drop(sink);
    let stats = result?;

    if let Some(packer) = packer {
        packer.wait().await?;
    }
    if let Some(unpacker) = unpacker {
        unpacker.wait().await?;
    }

    info!(
        chunks = stats.chunks,
        total_bytes = stats.total_bytes,
        bytes_written = stats.bytes_written,
        "transfer complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn group_of_one() -> GroupConfig {
        GroupConfig {
            rank: 0,
            size: 1,
            origin: None,
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            connect_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_group_of_one_stays_local() {
        let channel = connect(&group_of_one()).await.unwrap();
        assert_eq!(channel.rank(), 0);
        assert_eq!(channel.size(), 1);
        assert!(channel.is_origin());
    }

    #[tokio::test]
    async fn test_peer_without_origin_is_rejected() {
        let group = GroupConfig {
            rank: 1,
            size: 2,
            ..group_of_one()
        };
        let err = match connect(&group).await {
            Err(err) => err,
            Ok(_) => panic!("peer without an origin address must not connect"),
        };
        assert!(matches!(
            err,
            BcastError::Config(ConfigError::MissingOrigin { rank: 1 })
        ));
    }

    #[tokio::test]
    async fn test_missing_source_fails_before_transfer() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = BroadcastConfig {
            source: tmp.path().join("absent"),
            dest: tmp.path().join("out"),
            chunk_capacity: 1024,
            origin_writes_locally: true,
            tar_program: "tar".to_string(),
            show_progress: false,
            group: group_of_one(),
        };

        let err = run(&config).await.unwrap_err();
        assert!(matches!(
            err,
            BcastError::Config(ConfigError::SourceMissing(_))
        ));
    }
}
