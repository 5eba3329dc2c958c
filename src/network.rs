//! P2P networking over plain TCP.
//!
//! Every connection runs in its own task owning the socket and its
//! [`PeerSession`]. Tasks talk to the coordinator only through
//! [`NetworkEvent`]s; the coordinator owns the [`PeerSet`] and decides
//! what is written where.

pub mod discovery;
pub mod framing;
pub mod session;

pub use framing::{Message, MessageKind, NodeAddress};
pub use session::{BanReason, PeerSession, SessionState};

use crate::config::PeerConfig;
use crate::error::{ChainError, Result};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type PeerId = u64;

const READ_CHUNK: usize = 64 * 1024;
const OUTBOUND_QUEUE: usize = 256;
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum NetworkEvent {
    /// Accepted by the listener; not yet admitted.
    Incoming(TcpStream, String),
    Dialed(String, std::io::Result<TcpStream>),
    Message(PeerId, Message),
    Disconnected(PeerId, Option<BanReason>),
}

/// Coordinator-side view of a live connection.
#[derive(Debug)]
pub struct PeerHandle {
    pub addr: String,
    pub outbound: bool,
    frames: mpsc::Sender<Vec<u8>>,
}

impl PeerHandle {
    /// Queue a frame; dropped when the peer is not keeping up.
    pub fn send_frame(&self, frame: Vec<u8>) -> bool {
        self.frames.try_send(frame).is_ok()
    }
}

#[derive(Debug, Default)]
pub struct PeerSet {
    peers: HashMap<PeerId, PeerHandle>,
    next_id: PeerId,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn outbound_count(&self) -> usize {
        self.peers.values().filter(|p| p.outbound).count()
    }

    pub fn addrs(&self) -> HashSet<String> {
        self.peers.values().map(|p| p.addr.clone()).collect()
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerHandle> {
        self.peers.get(&id)
    }

    pub fn remove(&mut self, id: PeerId) -> Option<PeerHandle> {
        self.peers.remove(&id)
    }

    /// Start the connection task for `stream` and track it.
    pub fn spawn(
        &mut self,
        stream: TcpStream,
        addr: String,
        outbound: bool,
        config: &PeerConfig,
        events: mpsc::Sender<NetworkEvent>,
    ) -> PeerId {
        let id = self.next_id;
        self.next_id += 1;
        let (frames_tx, frames_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let session = PeerSession::new(addr.clone(), outbound, config, Instant::now());
        tokio::spawn(run_connection(id, stream, session, frames_rx, events, config.prune_interval_secs));
        self.peers.insert(id, PeerHandle { addr, outbound, frames: frames_tx });
        id
    }

    pub fn send(&self, id: PeerId, message: &Message) -> Result<bool> {
        let frame = message.encode()?;
        Ok(self.peers.get(&id).map_or(false, |p| p.send_frame(frame)))
    }

    /// Send to every peer except `except`. Each session drops frames its peer
    /// has already seen.
    pub fn broadcast(&self, message: &Message, except: Option<PeerId>) -> Result<usize> {
        let frame = message.encode()?;
        let mut sent = 0;
        for (id, peer) in &self.peers {
            if Some(*id) == except {
                continue;
            }
            if peer.send_frame(frame.clone()) {
                sent += 1;
            }
        }
        Ok(sent)
    }
}

/// Accept loop. Admission (ban checks) is the coordinator's call.
pub async fn listen(listener: TcpListener, events: mpsc::Sender<NetworkEvent>) -> Result<()> {
    let local = listener.local_addr()?;
    info!("P2P listener on {}", local);
    loop {
        let (stream, remote) = listener.accept().await?;
        if events.send(NetworkEvent::Incoming(stream, remote.to_string())).await.is_err() {
            return Err(ChainError::Shutdown);
        }
    }
}

pub async fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| ChainError::NetworkError(format!("P2P port {} unavailable: {}", port, e)))
}

pub fn spawn_dial(addr: String, events: mpsc::Sender<NetworkEvent>) {
    tokio::spawn(async move {
        let result = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out")),
        };
        let _ = events.send(NetworkEvent::Dialed(addr, result)).await;
    });
}

async fn run_connection(
    id: PeerId,
    mut stream: TcpStream,
    mut session: PeerSession,
    mut frames: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<NetworkEvent>,
    prune_interval_secs: u64,
) {
    session.activate();
    debug!(peer = %session.addr, outbound = session.outbound, "Session active");

    let mut second = tokio::time::interval(Duration::from_secs(1));
    let mut prune = tokio::time::interval(Duration::from_secs(prune_interval_secs.max(1)));
    let mut buf = vec![0u8; READ_CHUNK];

    let ban = 'session: loop {
        tokio::select! {
            read = stream.read(&mut buf) => {
                match read {
                    Ok(0) => break None,
                    Ok(n) => match session.on_bytes(&buf[..n], Instant::now()) {
                        Ok(messages) => {
                            for message in messages {
                                if events.send(NetworkEvent::Message(id, message)).await.is_err() {
                                    break 'session None;
                                }
                            }
                        }
                        Err(reason) => break Some(reason),
                    },
                    Err(e) => {
                        debug!(peer = %session.addr, "Read failed: {}", e);
                        break None;
                    }
                }
            }
            frame = frames.recv() => {
                let Some(frame) = frame else { break None };
                if session.prepare_outbound(&frame, Instant::now()) {
                    if let Err(e) = stream.write_all(&frame).await {
                        debug!(peer = %session.addr, "Write failed: {}", e);
                        break None;
                    }
                }
            }
            _ = second.tick() => {
                session.reset_counters();
                if let Some(reason) = session.check_idle(Instant::now()) {
                    break Some(reason);
                }
            }
            _ = prune.tick() => session.prune_seen(Instant::now()),
        }
    };

    match ban {
        Some(reason) => warn!(peer = %session.addr, code = reason.code(), "Banning peer"),
        None => session.close(),
    }
    let _ = stream.shutdown().await;
    let _ = events.send(NetworkEvent::Disconnected(id, ban)).await;
}
