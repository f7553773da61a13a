use std::fmt;
use std::mem::size_of;

use serde::{Deserialize, Serialize};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::error::{FrameError, InvokeError};

pub const FRAME_MAGIC: [u8; 2] = [b'%', b'C'];
pub const FRAME_VER: u8 = 1;

/// Frames larger than this are treated as stream corruption.
pub const MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

/// Fixed len of FrameHead = 16B
/// | 2B   |1B | 1B  | 8B  |   4B    |
/// | magic|ver| kind| seq | body_len|
///
/// followed by `body_len` bytes of payload.
#[derive(AsBytes, FromBytes, FromZeroes, Unaligned, PartialEq, Clone, Copy)]
#[repr(packed)]
pub struct FrameHead {
    pub magic: [u8; 2],
    pub ver: u8,
    pub kind: u8,
    /// Process-unique id matching a response to its pending invocation.
    pub seq: u64,
    pub body_len: u32,
}

pub const FRAME_HEAD_LEN: usize = size_of::<FrameHead>();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Ping = 0,
    Pong = 1,
    Request = 2,
    Response = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, FrameError> {
        match v {
            0 => Ok(Self::Ping),
            1 => Ok(Self::Pong),
            2 => Ok(Self::Request),
            3 => Ok(Self::Response),
            other => Err(FrameError::BadKind(other)),
        }
    }
}

impl FrameHead {
    #[inline(always)]
    pub fn decode(head_buf: &[u8]) -> Result<&Self, FrameError> {
        let head = FrameHead::ref_from_prefix(head_buf).ok_or(FrameError::BadMagic)?;
        if head.magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic);
        }
        if head.ver != FRAME_VER {
            return Err(FrameError::BadVersion(head.ver));
        }
        let body_len = head.body_len;
        if body_len > MAX_BODY_LEN {
            return Err(FrameError::TooLarge(body_len));
        }
        Ok(head)
    }
}

impl fmt::Display for FrameHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // copy out of the packed struct before formatting
        let kind = self.kind;
        let seq = self.seq;
        let body_len = self.body_len;
        write!(f, "[kind:{}, seq:{}, body:{}]", kind, seq, body_len)
    }
}

impl fmt::Debug for FrameHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One wire message: head plus owned payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub seq: u64,
    pub body: Vec<u8>,
}

impl Frame {
    #[inline]
    pub fn request(seq: u64, body: Vec<u8>) -> Self {
        Self { kind: FrameKind::Request, seq, body }
    }

    #[inline]
    pub fn response(seq: u64, body: Vec<u8>) -> Self {
        Self { kind: FrameKind::Response, seq, body }
    }

    #[inline]
    pub fn ping(seq: u64) -> Self {
        Self { kind: FrameKind::Ping, seq, body: Vec::new() }
    }

    #[inline]
    pub fn pong(seq: u64) -> Self {
        Self { kind: FrameKind::Pong, seq, body: Vec::new() }
    }

    #[inline]
    pub fn head(&self) -> FrameHead {
        FrameHead {
            magic: FRAME_MAGIC,
            ver: FRAME_VER,
            kind: self.kind as u8,
            seq: self.seq,
            body_len: self.body.len() as u32,
        }
    }

    /// Bytes this frame occupies on the wire; what the write watermark
    /// accounting charges.
    #[inline]
    pub fn wire_len(&self) -> usize {
        FRAME_HEAD_LEN + self.body.len()
    }

    /// Head plus body as one buffer.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());
        buf.extend_from_slice(self.head().as_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?} seq:{} body:{}]", self.kind, self.seq, self.body.len())
    }
}

/// Typed wrapper the response payload deserializes into on a dispatcher
/// worker: either the encoded method result or a remote error message.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ResultWrapper {
    pub error: Option<String>,
    pub value: Vec<u8>,
}

/// What the decoder hands to the response handler, and what the registry
/// finally delivers. `bytes` is dropped as soon as `result` is populated.
#[derive(Debug, Default)]
pub struct ResponseEnvelope {
    pub seq: u64,
    pub bytes: Option<Vec<u8>>,
    pub result: Option<ResultWrapper>,
    pub error: Option<InvokeError>,
}

impl ResponseEnvelope {
    #[inline]
    pub fn new(seq: u64, bytes: Vec<u8>) -> Self {
        Self { seq, bytes: Some(bytes), result: None, error: None }
    }

    #[inline]
    pub fn failed(seq: u64, error: InvokeError) -> Self {
        Self { seq, bytes: None, result: None, error: Some(error) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_len() {
        assert_eq!(FRAME_HEAD_LEN, 16);
    }

    #[test]
    fn test_head_decode() {
        let frame = Frame::request(7, b"hello".to_vec());
        let head = frame.head();
        let decoded = FrameHead::decode(head.as_bytes()).expect("decode");
        assert_eq!(*decoded, head);
        let seq = decoded.seq;
        assert_eq!(seq, 7);

        let mut bad = head;
        bad.magic = [0, 0];
        assert!(FrameHead::decode(bad.as_bytes()).is_err());
        let mut bad = head;
        bad.ver = 9;
        assert!(matches!(FrameHead::decode(bad.as_bytes()), Err(FrameError::BadVersion(9))));
    }
}
