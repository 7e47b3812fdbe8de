//! TCP group transport - one process per node, star rendezvous.
//!
//! The origin listens and accepts exactly `size - 1` peers. Every peer
//! connects to the origin, retrying until the deadline because launchers
//! start ranks in no particular order. Once the group is formed there are
//! no timeouts: a dead link surfaces as a disconnect and aborts the group.

use super::protocol::{self, Abort, ChunkSize, Hello, MessageType, Release, Timing};
use super::{Collective, Rank, ORIGIN};
use crate::error::CollectiveError;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Delay between connection attempts while the origin is not up yet
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Upper bound on delivering an abort notice to one participant
const ABORT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// How long an accepted connection gets to say hello
const HELLO_TIMEOUT: Duration = Duration::from_secs(2);

fn rendezvous(msg: impl Into<String>) -> CollectiveError {
    CollectiveError::Rendezvous(msg.into())
}

fn wire_rank(rank: Rank) -> u32 {
    u32::try_from(rank).unwrap_or(u32::MAX)
}

// =============================================================================
// Origin side
// =============================================================================

/// What a peer's reader task saw on its link
#[derive(Debug)]
enum PeerEvent {
    Timing(f64),
    Abort { rank: Rank, reason: String },
    Closed,
    Failed(String),
}

#[derive(Debug)]
struct Inbound {
    rank: Rank,
    event: PeerEvent,
}

struct PeerWriter {
    rank: Rank,
    writer: OwnedWriteHalf,
    /// Set while a frame is partly written; a failed write leaves it set.
    mid_frame: bool,
}

/// The origin's end of a TCP group
pub struct TcpOrigin {
    size: usize,
    peers: Vec<PeerWriter>,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    readers: Vec<JoinHandle<()>>,
    aborted: bool,
}

impl TcpOrigin {
    /// Bind `addr` and wait for the rest of the group.
    pub async fn listen(
        addr: std::net::SocketAddr,
        size: usize,
        timeout: Duration,
    ) -> Result<Self, CollectiveError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| rendezvous(format!("cannot listen on {}: {}", addr, e)))?;
        info!(%addr, peers = size.saturating_sub(1), "waiting for group");
        Self::accept(listener, size, timeout).await
    }

    /// Accept `size - 1` peers on an already bound listener.
    pub async fn accept(
        listener: TcpListener,
        size: usize,
        timeout: Duration,
    ) -> Result<Self, CollectiveError> {
        if size == 0 {
            return Err(rendezvous("group size must be at least 1"));
        }

        let deadline = Instant::now() + timeout;
        let mut slots: Vec<Option<TcpStream>> = (1..size).map(|_| None).collect();
        let mut joined = 0usize;

        while joined < size - 1 {
            let accepted = tokio::time::timeout_at(deadline, listener.accept())
                .await
                .map_err(|_| {
                    rendezvous(format!(
                        "timed out with {} of {} peers joined",
                        joined,
                        size - 1
                    ))
                })?;
            let (mut stream, addr) =
                accepted.map_err(|e| rendezvous(format!("accept failed: {}", e)))?;
            stream.set_nodelay(true).ok();

            let hello_deadline = deadline.min(Instant::now() + HELLO_TIMEOUT);
            let hello = match tokio::time::timeout_at(hello_deadline, read_hello(&mut stream)).await
            {
                Ok(Ok(hello)) => hello,
                Ok(Err(e)) => {
                    warn!(%addr, error = %e, "dropping connection without a valid hello");
                    continue;
                }
                Err(_) => {
                    warn!(%addr, "dropping connection that never said hello");
                    continue;
                }
            };

            let rank = hello.rank as Rank;
            let rejection = if hello.version != protocol::PROTOCOL_VERSION {
                Some(format!(
                    "protocol version {} not supported (expected {})",
                    hello.version,
                    protocol::PROTOCOL_VERSION
                ))
            } else if hello.size as usize != size {
                Some(format!(
                    "rank {} thinks the group has {} members, origin has {}",
                    rank, hello.size, size
                ))
            } else if rank == ORIGIN || rank >= size {
                Some(format!("rank {} is not a valid peer rank", rank))
            } else if slots[rank - 1].is_some() {
                Some(format!("rank {} joined twice", rank))
            } else {
                None
            };

            if let Some(reason) = rejection {
                let notice = Abort {
                    rank: wire_rank(ORIGIN),
                    reason: reason.clone(),
                };
                let _ = protocol::write_frame(&mut stream, &notice.encode()).await;
                return Err(rendezvous(reason));
            }

            protocol::write_frame(&mut stream, &Hello::new(0, wire_rank(size)).encode())
                .await
                .map_err(|e| CollectiveError::link(rank, e))?;

            debug!(rank, %addr, "peer joined");
            slots[rank - 1] = Some(stream);
            joined += 1;
        }

        let (tx, inbox) = mpsc::unbounded_channel();
        let mut peers = Vec::with_capacity(size - 1);
        let mut readers = Vec::with_capacity(size - 1);
        for (index, slot) in slots.into_iter().enumerate() {
            let rank = index + 1;
            let stream = slot.ok_or_else(|| rendezvous(format!("rank {} never joined", rank)))?;
            let (reader, writer) = stream.into_split();
            readers.push(tokio::spawn(pump(rank, reader, tx.clone())));
            peers.push(PeerWriter {
                rank,
                writer,
                mid_frame: false,
            });
        }

        info!(size, "group formed");
        Ok(Self {
            size,
            peers,
            inbox,
            readers,
            aborted: false,
        })
    }

    /// Fail fast if any peer already reported trouble.
    fn poll_inbox(&mut self) -> Result<(), CollectiveError> {
        match self.inbox.try_recv() {
            Ok(Inbound { rank, event }) => Err(unexpected_event(rank, event)),
            Err(_) => Ok(()),
        }
    }

    /// Write one frame to every peer.
    ///
    /// Every write runs to completion or failure before the first error is
    /// returned, so peers whose links are healthy stay frame-aligned and can
    /// still receive an abort notice.
    async fn send_all(&mut self, frame: &[u8], body: &[u8]) -> Result<(), CollectiveError> {
        let writes = self.peers.iter_mut().map(|peer| async move {
            peer.mid_frame = true;
            let res: io::Result<()> = async {
                peer.writer.write_all(frame).await?;
                if !body.is_empty() {
                    peer.writer.write_all(body).await?;
                }
                peer.writer.flush().await
            }
            .await;
            if res.is_ok() {
                peer.mid_frame = false;
            }
            res.map_err(|e| CollectiveError::link(peer.rank, e))
        });
        join_all(writes).await.into_iter().collect()
    }
}

fn unexpected_event(rank: Rank, event: PeerEvent) -> CollectiveError {
    match event {
        PeerEvent::Abort { rank, reason } => CollectiveError::Aborted { rank, reason },
        PeerEvent::Closed => CollectiveError::Disconnected { rank },
        PeerEvent::Failed(msg) => CollectiveError::Protocol(format!("rank {}: {}", rank, msg)),
        PeerEvent::Timing(_) => {
            CollectiveError::Protocol(format!("rank {} sent a timing sample mid-transfer", rank))
        }
    }
}

/// Forward everything a peer says to the origin's inbox.
async fn pump(rank: Rank, mut reader: OwnedReadHalf, tx: mpsc::UnboundedSender<Inbound>) {
    loop {
        let event = match protocol::read_frame(&mut reader).await {
            Ok((MessageType::Timing, payload)) => match Timing::decode(payload) {
                Ok(timing) => PeerEvent::Timing(timing.elapsed_secs),
                Err(e) => PeerEvent::Failed(e.to_string()),
            },
            Ok((MessageType::Abort, payload)) => match Abort::decode(payload) {
                Ok(abort) => PeerEvent::Abort {
                    rank: abort.rank as Rank,
                    reason: abort.reason,
                },
                Err(e) => PeerEvent::Failed(e.to_string()),
            },
            Ok((other, _)) => PeerEvent::Failed(format!("unexpected {:?} frame", other)),
            Err(e) => match CollectiveError::link(rank, e) {
                CollectiveError::Disconnected { .. } => PeerEvent::Closed,
                err => PeerEvent::Failed(err.to_string()),
            },
        };

        let keep_reading = matches!(event, PeerEvent::Timing(_));
        if tx.send(Inbound { rank, event }).is_err() || !keep_reading {
            break;
        }
    }
}

async fn read_hello(stream: &mut TcpStream) -> io::Result<Hello> {
    let (msg_type, payload) = protocol::read_frame(stream).await?;
    if msg_type != MessageType::Hello {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected Hello, got {:?}", msg_type),
        ));
    }
    Hello::decode(payload)
}

impl Drop for TcpOrigin {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

#[async_trait]
impl Collective for TcpOrigin {
    fn rank(&self) -> Rank {
        ORIGIN
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn broadcast_scalar(&mut self, value: u64) -> Result<u64, CollectiveError> {
        self.poll_inbox()?;
        let frame = ChunkSize { size: value }.encode();
        self.send_all(&frame, &[]).await?;
        Ok(value)
    }

    async fn broadcast_bytes(&mut self, buf: &mut [u8]) -> Result<(), CollectiveError> {
        self.poll_inbox()?;
        let len = u32::try_from(buf.len()).map_err(|_| {
            CollectiveError::Protocol(format!("chunk of {} bytes does not fit a frame", buf.len()))
        })?;
        let header = protocol::payload_header(len);
        self.send_all(&header, buf).await
    }

    async fn reduce_max(&mut self, value: f64) -> Result<Option<f64>, CollectiveError> {
        let mut pending: BTreeSet<Rank> = (1..self.size).collect();
        let mut max = value;

        while !pending.is_empty() {
            let Some(Inbound { rank, event }) = self.inbox.recv().await else {
                return Err(CollectiveError::Protocol(
                    "every peer reader stopped".to_string(),
                ));
            };
            match event {
                PeerEvent::Timing(sample) if pending.remove(&rank) => max = max.max(sample),
                PeerEvent::Timing(_) => {
                    return Err(CollectiveError::Protocol(format!(
                        "rank {} sent two timing samples",
                        rank
                    )))
                }
                other => return Err(unexpected_event(rank, other)),
            }
        }

        let frame = Release {
            max_elapsed_secs: max,
        }
        .encode();
        self.send_all(&frame, &[]).await?;
        Ok(Some(max))
    }

    async fn abort(&mut self, reason: &str) {
        if self.aborted {
            return;
        }
        self.aborted = true;

        let frame = Abort {
            rank: wire_rank(ORIGIN),
            reason: reason.to_string(),
        }
        .encode();
        let notices = self.peers.iter_mut().map(|peer| {
            let frame = &frame;
            async move {
                // A notice appended to a half-written frame would be read as payload.
                if peer.mid_frame {
                    debug!(rank = peer.rank, "link is mid-frame, closing it instead");
                    let _ = tokio::time::timeout(ABORT_SEND_TIMEOUT, peer.writer.shutdown()).await;
                    return;
                }
                let sent =
                    tokio::time::timeout(ABORT_SEND_TIMEOUT, peer.writer.write_all(frame)).await;
                if !matches!(sent, Ok(Ok(()))) {
                    debug!(rank = peer.rank, "could not deliver abort notice");
                }
            }
        });
        join_all(notices).await;
    }
}

// =============================================================================
// Peer side
// =============================================================================

/// A non-origin participant's end of a TCP group
pub struct TcpPeer {
    rank: Rank,
    size: usize,
    stream: TcpStream,
    aborted: bool,
}

impl TcpPeer {
    /// Connect to the origin at `origin` (host:port) and join as `rank`.
    pub async fn connect(
        origin: &str,
        rank: Rank,
        size: usize,
        timeout: Duration,
    ) -> Result<Self, CollectiveError> {
        if rank == ORIGIN || rank >= size {
            return Err(rendezvous(format!(
                "rank {} cannot join a group of {} as a peer",
                rank, size
            )));
        }

        let deadline = Instant::now() + timeout;
        let mut stream = loop {
            let attempt = tokio::time::timeout_at(deadline, TcpStream::connect(origin))
                .await
                .map_err(|_| {
                    rendezvous(format!(
                        "cannot reach origin {} within {:?}",
                        origin, timeout
                    ))
                })?;
            match attempt {
                Ok(stream) => break stream,
                Err(e) if Instant::now() + CONNECT_RETRY_INTERVAL < deadline => {
                    debug!(origin, error = %e, "origin not reachable yet, retrying");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(rendezvous(format!("cannot reach origin {}: {}", origin, e)))
                }
            }
        };
        stream.set_nodelay(true).ok();

        protocol::write_frame(&mut stream, &Hello::new(wire_rank(rank), wire_rank(size)).encode())
            .await
            .map_err(|e| CollectiveError::link(ORIGIN, e))?;

        let reply = tokio::time::timeout_at(deadline, protocol::read_frame(&mut stream))
            .await
            .map_err(|_| rendezvous("origin never answered hello"))?
            .map_err(|e| CollectiveError::link(ORIGIN, e))?;

        match reply {
            (MessageType::Hello, payload) => {
                let hello = Hello::decode(payload).map_err(|e| CollectiveError::link(ORIGIN, e))?;
                if hello.size as usize != size {
                    return Err(rendezvous(format!(
                        "origin runs a group of {}, expected {}",
                        hello.size, size
                    )));
                }
            }
            (MessageType::Abort, payload) => {
                let abort = Abort::decode(payload).map_err(|e| CollectiveError::link(ORIGIN, e))?;
                return Err(rendezvous(format!("origin refused: {}", abort.reason)));
            }
            (other, _) => {
                return Err(rendezvous(format!("expected Hello from origin, got {:?}", other)))
            }
        }

        debug!(rank, origin, "joined group");
        Ok(Self {
            rank,
            size,
            stream,
            aborted: false,
        })
    }

    async fn next_control(&mut self, wanted: MessageType) -> Result<bytes::Bytes, CollectiveError> {
        let (msg_type, payload) = protocol::read_frame(&mut self.stream)
            .await
            .map_err(|e| CollectiveError::link(ORIGIN, e))?;
        if msg_type == wanted {
            return Ok(payload);
        }
        Err(self.decode_unexpected(msg_type, payload))
    }

    fn decode_unexpected(&self, msg_type: MessageType, payload: bytes::Bytes) -> CollectiveError {
        match msg_type {
            MessageType::Abort => match Abort::decode(payload) {
                Ok(abort) => CollectiveError::Aborted {
                    rank: abort.rank as Rank,
                    reason: abort.reason,
                },
                Err(e) => CollectiveError::link(ORIGIN, e),
            },
            other => CollectiveError::Protocol(format!("unexpected {:?} frame from origin", other)),
        }
    }
}

#[async_trait]
impl Collective for TcpPeer {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn broadcast_scalar(&mut self, _value: u64) -> Result<u64, CollectiveError> {
        let payload = self.next_control(MessageType::ChunkSize).await?;
        let chunk = ChunkSize::decode(payload).map_err(|e| CollectiveError::link(ORIGIN, e))?;
        Ok(chunk.size)
    }

    async fn broadcast_bytes(&mut self, buf: &mut [u8]) -> Result<(), CollectiveError> {
        let (msg_type, len) = protocol::read_header(&mut self.stream)
            .await
            .map_err(|e| CollectiveError::link(ORIGIN, e))?;

        if msg_type != MessageType::Payload {
            let payload = protocol::read_body(&mut self.stream, len)
                .await
                .map_err(|e| CollectiveError::link(ORIGIN, e))?;
            return Err(self.decode_unexpected(msg_type, payload));
        }
        if len as usize != buf.len() {
            return Err(CollectiveError::Protocol(format!(
                "payload of {} bytes, expected {}",
                len,
                buf.len()
            )));
        }

        self.stream
            .read_exact(buf)
            .await
            .map_err(|e| CollectiveError::link(ORIGIN, e))?;
        Ok(())
    }

    async fn reduce_max(&mut self, value: f64) -> Result<Option<f64>, CollectiveError> {
        protocol::write_frame(&mut self.stream, &Timing { elapsed_secs: value }.encode())
            .await
            .map_err(|e| CollectiveError::link(ORIGIN, e))?;
        let payload = self.next_control(MessageType::Release).await?;
        Release::decode(payload).map_err(|e| CollectiveError::link(ORIGIN, e))?;
        Ok(None)
    }

    async fn abort(&mut self, reason: &str) {
        if self.aborted {
            return;
        }
        self.aborted = true;

        let frame = Abort {
            rank: wire_rank(self.rank),
            reason: reason.to_string(),
        }
        .encode();
        let sent = tokio::time::timeout(
            ABORT_SEND_TIMEOUT,
            protocol::write_frame(&mut self.stream, &frame),
        )
        .await;
        if !matches!(sent, Ok(Ok(()))) {
            debug!(rank = self.rank, "could not deliver abort notice to origin");
        }
        let _ = self.stream.shutdown().await;
    }
}
