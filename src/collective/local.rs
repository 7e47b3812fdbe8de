//! In-process group: every participant is a task in the same runtime.
//!
//! The origin fans each message out over one bounded channel per peer.
//! Channels hold a single message, so a peer can never fall more than one
//! message behind the origin. Abort is a shared watch signal that every
//! blocking call races against.

use super::{Collective, Rank, ORIGIN};
use crate::error::CollectiveError;
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Depth of each origin -> peer link
const LINK_DEPTH: usize = 1;

#[derive(Debug, Clone)]
enum Envelope {
    ChunkSize(u64),
    Payload(Bytes),
    Timing(f64),
    Release,
}

impl Envelope {
    fn kind(&self) -> &'static str {
        match self {
            Envelope::ChunkSize(_) => "chunk size",
            Envelope::Payload(_) => "payload",
            Envelope::Timing(_) => "timing sample",
            Envelope::Release => "release",
        }
    }
}

#[derive(Debug, Clone)]
struct AbortNotice {
    rank: Rank,
    reason: String,
}

impl From<AbortNotice> for CollectiveError {
    fn from(notice: AbortNotice) -> Self {
        CollectiveError::Aborted {
            rank: notice.rank,
            reason: notice.reason,
        }
    }
}

enum Role {
    Origin {
        downlinks: Vec<(Rank, mpsc::Sender<Envelope>)>,
        uplink: mpsc::Receiver<(Rank, Envelope)>,
    },
    Peer {
        downlink: mpsc::Receiver<Envelope>,
        uplink: mpsc::Sender<(Rank, Envelope)>,
    },
}

/// One participant of an in-process group
pub struct LocalMember {
    rank: Rank,
    size: usize,
    role: Role,
    abort_rx: watch::Receiver<Option<AbortNotice>>,
    abort_tx: Arc<watch::Sender<Option<AbortNotice>>>,
}

/// Build a group of `size` members; index `i` of the result has rank `i`.
pub fn local_group(size: usize) -> Vec<LocalMember> {
    if size == 0 {
        return Vec::new();
    }

    let (abort_tx, abort_rx) = watch::channel(None);
    let abort_tx = Arc::new(abort_tx);
    let (uplink_tx, uplink_rx) = mpsc::channel(size);

    let mut downlinks = Vec::with_capacity(size - 1);
    let mut peers = Vec::with_capacity(size - 1);
    for rank in 1..size {
        let (tx, rx) = mpsc::channel(LINK_DEPTH);
        downlinks.push((rank, tx));
        peers.push(LocalMember {
            rank,
            size,
            role: Role::Peer {
                downlink: rx,
                uplink: uplink_tx.clone(),
            },
            abort_rx: abort_rx.clone(),
            abort_tx: Arc::clone(&abort_tx),
        });
    }

    let origin = LocalMember {
        rank: ORIGIN,
        size,
        role: Role::Origin {
            downlinks,
            uplink: uplink_rx,
        },
        abort_rx,
        abort_tx,
    };

    std::iter::once(origin).chain(peers).collect()
}

/// Run `op` unless the group is, or becomes, aborted first.
async fn guarded<T, F>(
    abort: &mut watch::Receiver<Option<AbortNotice>>,
    op: F,
) -> Result<T, CollectiveError>
where
    F: Future<Output = Result<T, CollectiveError>>,
{
    let pending = abort.borrow_and_update().clone();
    if let Some(notice) = pending {
        return Err(notice.into());
    }

    tokio::select! {
        res = op => res,
        Ok(()) = abort.changed() => {
            let notice = abort.borrow_and_update().clone();
            Err(notice.map(Into::into).unwrap_or_else(|| {
                CollectiveError::Protocol("abort signalled without a notice".to_string())
            }))
        }
    }
}

async fn fan_out(
    downlinks: &[(Rank, mpsc::Sender<Envelope>)],
    envelope: Envelope,
) -> Result<(), CollectiveError> {
    for (rank, tx) in downlinks {
        tx.send(envelope.clone())
            .await
            .map_err(|_| CollectiveError::Disconnected { rank: *rank })?;
    }
    Ok(())
}

fn unexpected(wanted: &str, got: &Envelope) -> CollectiveError {
    CollectiveError::Protocol(format!("expected {}, got {}", wanted, got.kind()))
}

#[async_trait]
impl Collective for LocalMember {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn broadcast_scalar(&mut self, value: u64) -> Result<u64, CollectiveError> {
        let abort = &mut self.abort_rx;
        match &mut self.role {
            Role::Origin { downlinks, .. } => {
                guarded(abort, fan_out(downlinks, Envelope::ChunkSize(value))).await?;
                Ok(value)
            }
            Role::Peer { downlink, .. } => {
                guarded(abort, async move {
                    match downlink.recv().await {
                        Some(Envelope::ChunkSize(v)) => Ok(v),
                        Some(other) => Err(unexpected("chunk size", &other)),
                        None => Err(CollectiveError::Disconnected { rank: ORIGIN }),
                    }
                })
                .await
            }
        }
    }

    async fn broadcast_bytes(&mut self, buf: &mut [u8]) -> Result<(), CollectiveError> {
        let abort = &mut self.abort_rx;
        match &mut self.role {
            Role::Origin { downlinks, .. } => {
                let payload = Bytes::copy_from_slice(buf);
                guarded(abort, fan_out(downlinks, Envelope::Payload(payload))).await
            }
            Role::Peer { downlink, .. } => {
                guarded(abort, async move {
                    match downlink.recv().await {
                        Some(Envelope::Payload(payload)) if payload.len() == buf.len() => {
                            buf.copy_from_slice(&payload);
                            Ok(())
                        }
                        Some(Envelope::Payload(payload)) => Err(CollectiveError::Protocol(
                            format!("payload of {} bytes, expected {}", payload.len(), buf.len()),
                        )),
                        Some(other) => Err(unexpected("payload", &other)),
                        None => Err(CollectiveError::Disconnected { rank: ORIGIN }),
                    }
                })
                .await
            }
        }
    }

    async fn reduce_max(&mut self, value: f64) -> Result<Option<f64>, CollectiveError> {
        let abort = &mut self.abort_rx;
        let peers = self.size - 1;
        match &mut self.role {
            Role::Origin { downlinks, uplink } => {
                let max = guarded(abort, async move {
                    let mut max = value;
                    for _ in 0..peers {
                        match uplink.recv().await {
                            Some((_, Envelope::Timing(sample))) => max = max.max(sample),
                            Some((rank, other)) => {
                                return Err(CollectiveError::Protocol(format!(
                                    "rank {} sent {} during reduction",
                                    rank,
                                    other.kind()
                                )))
                            }
                            None => {
                                return Err(CollectiveError::Protocol(
                                    "every peer link closed".to_string(),
                                ))
                            }
                        }
                    }
                    Ok(max)
                })
                .await?;
                guarded(abort, fan_out(downlinks, Envelope::Release)).await?;
                Ok(Some(max))
            }
            Role::Peer { downlink, uplink } => {
                let rank = self.rank;
                guarded(abort, async move {
                    uplink
                        .send((rank, Envelope::Timing(value)))
                        .await
                        .map_err(|_| CollectiveError::Disconnected { rank: ORIGIN })?;
                    match downlink.recv().await {
                        Some(Envelope::Release) => Ok(None),
                        Some(other) => Err(unexpected("release", &other)),
                        None => Err(CollectiveError::Disconnected { rank: ORIGIN }),
                    }
                })
                .await
            }
        }
    }

    async fn abort(&mut self, reason: &str) {
        let rank = self.rank;
        self.abort_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(AbortNotice {
                rank,
                reason: reason.to_string(),
            });
            true
        });
    }
}
