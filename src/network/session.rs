//! Per-connection session state: buffering, replay suppression, rate limits
//! and the resource bounds that get a peer banned. No I/O happens here; the
//! connection task feeds bytes in and asks before writing.

use super::framing::{frame_hash, FrameBuffer, FrameError, Message, MessageKind};
use crate::blockchain::Sha256Hash;
use crate::config::{PeerConfig, RateLimits};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanReason {
    Handler = 1,
    Idle = 2,
    BufferOverflow = 3,
    ReadFlood = 4,
}

impl BanReason {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for BanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
    Banned(BanReason),
}

/// Recently seen frame hashes, bounded in size and pruned by age.
#[derive(Debug)]
pub struct SeenHashes {
    order: VecDeque<(Sha256Hash, Instant)>,
    set: HashSet<Sha256Hash>,
    ttl: Duration,
    capacity: usize,
}

impl SeenHashes {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Records `hash`; false if it was already present.
    pub fn insert(&mut self, hash: Sha256Hash, now: Instant) -> bool {
        if !self.set.insert(hash) {
            return false;
        }
        self.order.push_back((hash, now));
        while self.order.len() > self.capacity {
            if let Some((old, _)) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, hash: &Sha256Hash) -> bool {
        self.set.contains(hash)
    }

    pub fn prune(&mut self, now: Instant) {
        while let Some((hash, at)) = self.order.front().copied() {
            if now.duration_since(at) < self.ttl {
                break;
            }
            self.order.pop_front();
            self.set.remove(&hash);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Unknown tags count as gossip; the decoder rejects them anyway.
fn is_gossip_tag(tag: u8) -> bool {
    MessageKind::from_tag(tag).map_or(true, MessageKind::is_gossip)
}

fn limit_for(limits: &RateLimits, kind: MessageKind) -> u32 {
    match kind {
        MessageKind::Block => limits.block,
        MessageKind::Transaction => limits.transaction,
        MessageKind::Node => limits.node,
        MessageKind::Sync => limits.sync,
        MessageKind::Blocks => limits.blocks,
        MessageKind::Meta => limits.meta,
    }
}

#[derive(Debug)]
pub struct PeerSession {
    pub addr: String,
    pub outbound: bool,
    state: SessionState,
    buffer: FrameBuffer,
    counters: [u32; MessageKind::ALL.len()],
    seen: SeenHashes,
    bytes_read: usize,
    bytes_written: usize,
    last_activity: Instant,
    config: PeerConfig,
}

impl PeerSession {
    pub fn new(addr: String, outbound: bool, config: &PeerConfig, now: Instant) -> Self {
        Self {
            addr,
            outbound,
            state: SessionState::Connecting,
            buffer: FrameBuffer::new(),
            counters: [0; MessageKind::ALL.len()],
            seen: SeenHashes::new(Duration::from_secs(config.seen_ttl_secs), config.seen_capacity),
            bytes_read: 0,
            bytes_written: 0,
            last_activity: now,
            config: config.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn activate(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Active;
        }
    }

    pub fn close(&mut self) {
        if !matches!(self.state, SessionState::Banned(_)) {
            self.state = SessionState::Closed;
        }
    }

    pub fn ban(&mut self, reason: BanReason) -> BanReason {
        self.state = SessionState::Banned(reason);
        reason
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn counter(&self, kind: MessageKind) -> u32 {
        self.counters[kind.index()]
    }

    pub fn has_seen(&self, hash: &Sha256Hash) -> bool {
        self.seen.contains(hash)
    }

    /// Feed inbound bytes. Returns the messages to dispatch, or the reason
    /// the peer must be banned.
    pub fn on_bytes(&mut self, bytes: &[u8], now: Instant) -> Result<Vec<Message>, BanReason> {
        self.last_activity = now;
        self.bytes_read += bytes.len();
        if self.bytes_read > self.config.max_read_per_second {
            return Err(self.ban(BanReason::ReadFlood));
        }

        self.buffer.push(bytes);
        let mut messages = Vec::new();
        while let Some(frame) = self.buffer.next_frame() {
            if is_gossip_tag(frame.tag) && !self.seen.insert(frame.hash, now) {
                continue;
            }
            let message = match Message::decode(&frame) {
                Ok(message) => message,
                Err(FrameError::UnknownKind(tag)) => {
                    debug!(peer = %self.addr, tag, "Unknown message kind");
                    return Err(self.ban(BanReason::Handler));
                }
                Err(FrameError::Malformed(reason)) => {
                    debug!(peer = %self.addr, %reason, "Dropping malformed message");
                    continue;
                }
            };

            let kind = message.kind();
            let count = &mut self.counters[kind.index()];
            *count += 1;
            if *count > limit_for(&self.config.rate_limits, kind) {
                debug!(peer = %self.addr, %kind, "Rate limit exceeded, dropping");
                continue;
            }
            messages.push(message);
        }

        if self.buffer.len() > self.config.max_bytes_in_memory {
            return Err(self.ban(BanReason::BufferOverflow));
        }
        Ok(messages)
    }

    /// Decide whether `frame` goes out. Frames this peer already sent or
    /// received are skipped, as is anything over the write ceiling.
    pub fn prepare_outbound(&mut self, frame: &[u8], now: Instant) -> bool {
        let gossip = frame.first().map_or(true, |tag| is_gossip_tag(*tag));
        let hash = frame_hash(frame);
        if gossip && self.seen.contains(&hash) {
            return false;
        }
        if self.bytes_written + frame.len() > self.config.max_write_per_second {
            debug!(peer = %self.addr, bytes = frame.len(), "Write ceiling reached, dropping frame");
            return false;
        }
        if gossip {
            self.seen.insert(hash, now);
        }
        self.bytes_written += frame.len();
        true
    }

    /// Once per second.
    pub fn reset_counters(&mut self) {
        self.counters = [0; MessageKind::ALL.len()];
        self.bytes_read = 0;
        self.bytes_written = 0;
    }

    pub fn prune_seen(&mut self, now: Instant) {
        self.seen.prune(now);
    }

    pub fn check_idle(&mut self, now: Instant) -> Option<BanReason> {
        let idle = Duration::from_secs(self.config.idle_timeout_secs);
        if now.duration_since(self.last_activity) >= idle {
            Some(self.ban(BanReason::Idle))
        } else {
            None
        }
    }
}
