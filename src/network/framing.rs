//! Wire framing: `[1-byte kind][JSON payload][64-byte sentinel]`

use crate::blockchain::Sha256Hash;
use crate::codec::{MinifiedBlock, MinifiedTransaction};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub const SENTINEL_LEN: usize = 64;

/// 32 zero bytes followed by 32 `0xFF` bytes. JSON text never contains a
/// raw NUL, so the sentinel cannot occur inside a payload.
pub const SENTINEL: [u8; SENTINEL_LEN] = sentinel();

const fn sentinel() -> [u8; SENTINEL_LEN] {
    let mut s = [0u8; SENTINEL_LEN];
    let mut i = SENTINEL_LEN / 2;
    while i < SENTINEL_LEN {
        s[i] = 0xFF;
        i += 1;
    }
    s
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Block = 0,
    Transaction = 1,
    Node = 2,
    Sync = 3,
    Blocks = 4,
    Meta = 5,
}

impl MessageKind {
    pub const ALL: [MessageKind; 6] = [
        MessageKind::Block,
        MessageKind::Transaction,
        MessageKind::Node,
        MessageKind::Sync,
        MessageKind::Blocks,
        MessageKind::Meta,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Gossip kinds go through the per-session seen list. `sync` and
    /// `blocks` are request and response, and must be repeatable.
    pub fn is_gossip(self) -> bool {
        !matches!(self, MessageKind::Sync | MessageKind::Blocks)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Block => "block",
            MessageKind::Transaction => "transaction",
            MessageKind::Node => "node",
            MessageKind::Sync => "sync",
            MessageKind::Blocks => "blocks",
            MessageKind::Meta => "meta",
        };
        f.write_str(name)
    }
}

/// Peer address advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Block(MinifiedBlock),
    Transaction(MinifiedTransaction),
    Node(NodeAddress),
    /// First height the requester is missing.
    Sync(u64),
    Blocks(Vec<MinifiedBlock>),
    Meta(serde_json::Value),
}

/// Why a complete frame could not be turned into a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    UnknownKind(u8),
    Malformed(String),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Block(_) => MessageKind::Block,
            Message::Transaction(_) => MessageKind::Transaction,
            Message::Node(_) => MessageKind::Node,
            Message::Sync(_) => MessageKind::Sync,
            Message::Blocks(_) => MessageKind::Blocks,
            Message::Meta(_) => MessageKind::Meta,
        }
    }

    pub fn payload(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Message::Block(b) => serde_json::to_vec(b)?,
            Message::Transaction(t) => serde_json::to_vec(t)?,
            Message::Node(n) => serde_json::to_vec(n)?,
            Message::Sync(h) => serde_json::to_vec(h)?,
            Message::Blocks(b) => serde_json::to_vec(b)?,
            Message::Meta(v) => serde_json::to_vec(v)?,
        };
        Ok(bytes)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(encode(self.kind(), &self.payload()?))
    }

    pub fn decode(frame: &Frame) -> std::result::Result<Self, FrameError> {
        let kind = MessageKind::from_tag(frame.tag).ok_or(FrameError::UnknownKind(frame.tag))?;
        let payload = frame.payload.as_slice();
        let malformed = |e: serde_json::Error| FrameError::Malformed(format!("{} payload: {}", kind, e));
        let message = match kind {
            MessageKind::Block => Message::Block(serde_json::from_slice(payload).map_err(malformed)?),
            MessageKind::Transaction => Message::Transaction(serde_json::from_slice(payload).map_err(malformed)?),
            MessageKind::Node => Message::Node(serde_json::from_slice(payload).map_err(malformed)?),
            MessageKind::Sync => Message::Sync(serde_json::from_slice(payload).map_err(malformed)?),
            MessageKind::Blocks => Message::Blocks(serde_json::from_slice(payload).map_err(malformed)?),
            MessageKind::Meta => Message::Meta(serde_json::from_slice(payload).map_err(malformed)?),
        };
        Ok(message)
    }
}

pub fn encode(kind: MessageKind, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len() + SENTINEL_LEN);
    out.push(kind.tag());
    out.extend_from_slice(payload);
    out.extend_from_slice(&SENTINEL);
    out
}

/// Replay-suppression key: sha256 over the whole frame, sentinel included.
pub fn frame_hash(frame: &[u8]) -> Sha256Hash {
    Sha256::digest(frame).into()
}

/// A complete frame cut out of the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Vec<u8>,
    pub hash: Sha256Hash,
}

/// Accumulates inbound bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    /// Bytes before this offset are known not to start a sentinel.
    scanned: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Unconsumed bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn next_frame(&mut self) -> Option<Frame> {
        // The tag byte is never part of the sentinel.
        let start = self.scanned.max(1);
        if self.buf.len() < start + SENTINEL_LEN {
            return None;
        }
        let found = self.buf[start..]
            .windows(SENTINEL_LEN)
            .position(|w| w == SENTINEL)
            .map(|p| p + start);

        match found {
            Some(at) => {
                let end = at + SENTINEL_LEN;
                let frame: Vec<u8> = self.buf.drain(..end).collect();
                self.scanned = 0;
                Some(Frame {
                    tag: frame[0],
                    payload: frame[1..at].to_vec(),
                    hash: frame_hash(&frame),
                })
            }
            None => {
                self.scanned = self.buf.len() + 1 - SENTINEL_LEN;
                None
            }
        }
    }

    pub fn drain_frames(&mut self) -> Vec<Frame> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend(Message::Sync(42).encode().unwrap());
        stream.extend(
            Message::Node(NodeAddress { host: "10.0.0.9".to_string(), port: 7420 })
                .encode()
                .unwrap(),
        );
        stream.extend(encode(MessageKind::Block, b""));
        stream.extend(Message::Meta(serde_json::json!({"v": [1, 2, 3]})).encode().unwrap());
        stream
    }

    #[test]
    fn test_sentinel_layout() {
        assert!(SENTINEL[..32].iter().all(|b| *b == 0));
        assert!(SENTINEL[32..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn test_frames_decode_in_order() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&sample_stream());
        let frames = buffer.drain_frames();
        assert_eq!(frames.len(), 4);
        assert!(buffer.is_empty());

        assert_eq!(Message::decode(&frames[0]), Ok(Message::Sync(42)));
        assert_eq!(frames[2].tag, MessageKind::Block.tag());
        assert!(frames[2].payload.is_empty());
        assert!(matches!(Message::decode(&frames[2]), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_partial_frame_waits() {
        let frame = Message::Sync(7).encode().unwrap();
        let mut buffer = FrameBuffer::new();
        buffer.push(&frame[..frame.len() - 1]);
        assert!(buffer.next_frame().is_none());
        assert_eq!(buffer.len(), frame.len() - 1);
        buffer.push(&frame[frame.len() - 1..]);
        let got = buffer.next_frame().unwrap();
        assert_eq!(got.hash, frame_hash(&frame));
    }

    #[test]
    fn test_unknown_kind() {
        let mut buffer = FrameBuffer::new();
        let mut frame = encode(MessageKind::Meta, b"{}");
        frame[0] = 9;
        buffer.push(&frame);
        let got = buffer.next_frame().unwrap();
        assert_eq!(Message::decode(&got), Err(FrameError::UnknownKind(9)));
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_frames(cuts in proptest::collection::vec(0usize..400, 0..12)) {
            let stream = sample_stream();
            let mut whole = FrameBuffer::new();
            whole.push(&stream);
            let expected = whole.drain_frames();

            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c % (stream.len() + 1)).collect();
            cuts.sort_unstable();
            let mut chunked = FrameBuffer::new();
            let mut got = Vec::new();
            let mut last = 0;
            for cut in cuts.into_iter().chain(std::iter::once(stream.len())) {
                chunked.push(&stream[last..cut]);
                got.extend(chunked.drain_frames());
                last = cut;
            }
            prop_assert_eq!(got, expected);
            prop_assert!(chunked.is_empty());
        }
    }
}
