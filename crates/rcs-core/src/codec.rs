//! Frame codec.
//!
//! ```text
//! ┌──────┬───────────────────────────┬──────┬──────────────────────┐
//! │ 0x5A │ JSON-encoded message      │ 0xA5 │ MD5 of JSON (16 B)   │
//! └──────┴───────────────────────────┴──────┴──────────────────────┘
//! ```
//!
//! There is no length prefix. The decoder searches the receive buffer for a
//! start marker, then for an end marker, and accepts the candidate only when
//! the digest that follows matches. Because the markers may also occur inside
//! payload bytes, end markers are tried in buffer order, each against the
//! start markers before it, nearest first. Bytes before an accepted frame are
//! consumed along with it.
//!
//! The codec indexes marker positions as bytes arrive and never re-tests an
//! end marker whose digest was already complete, so a buffer that grows in
//! small reads costs time proportional to the bytes received.

use bytes::{Buf, BufMut, BytesMut};
use md5::{Digest, Md5};
use std::ops::Range;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::Message;

/// Start-of-frame marker.
pub const FRAME_START: u8 = 0x5A;

/// End-of-payload marker, followed by the digest.
pub const FRAME_END: u8 = 0xA5;

/// Length of the payload digest.
pub const DIGEST_LEN: usize = 16;

/// Receive buffer cap (16 MB).
pub const DEFAULT_MAX_BUFFER: usize = 16 * 1024 * 1024;

/// Codec for [`Message`] frames, usable with `FramedRead`/`FramedWrite`.
///
/// A decoding codec keeps scan state about the buffer it is fed, so one
/// codec must stay paired with one receive buffer.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_buffer: usize,
    scan: Scan,
}

/// Marker positions seen so far in the receive buffer.
#[derive(Debug, Clone, Default)]
struct Scan {
    /// Bytes already indexed.
    indexed: usize,
    starts: Vec<usize>,
    ends: Vec<usize>,
    /// `ends[..tested]` failed against every start before them.
    tested: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER)
    }
}

impl FrameCodec {
    /// Create a codec that gives up on a receive buffer larger than
    /// `max_buffer` bytes that still holds no valid frame.
    pub fn new(max_buffer: usize) -> Self {
        Self {
            max_buffer,
            scan: Scan::default(),
        }
    }
}

/// Location of a verified frame inside a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FrameSpan {
    payload: Range<usize>,
    /// One past the last digest byte.
    end: usize,
}

impl Scan {
    /// Find the next marker pair whose digest verifies.
    fn find_frame(&mut self, buf: &[u8]) -> Option<FrameSpan> {
        if self.indexed > buf.len() {
            // The buffer was drained behind our back.
            *self = Scan::default();
        }
        for (offset, byte) in buf[self.indexed..].iter().enumerate() {
            match *byte {
                FRAME_START => self.starts.push(self.indexed + offset),
                FRAME_END => self.ends.push(self.indexed + offset),
                _ => {}
            }
        }
        self.indexed = buf.len();

        // End markers whose digest has fully arrived.
        let ready = self
            .ends
            .partition_point(|&end| end + 1 + DIGEST_LEN <= buf.len());
        while self.tested < ready {
            let end = self.ends[self.tested];
            let digest = &buf[end + 1..end + 1 + DIGEST_LEN];
            let before = self.starts.partition_point(|&start| start < end);
            for &start in self.starts[..before].iter().rev() {
                let payload = start + 1..end;
                if Md5::digest(&buf[payload.clone()]).as_slice() == digest {
                    return Some(FrameSpan {
                        payload,
                        end: end + 1 + DIGEST_LEN,
                    });
                }
            }
            trace!(end, candidates = before, "end marker rejected: no digest match");
            self.tested += 1;
        }
        None
    }

    /// Shift positions after `n` bytes were removed from the buffer front.
    fn consume(&mut self, n: usize) {
        fn shift(positions: &mut Vec<usize>, n: usize) {
            positions.retain(|&p| p >= n);
            positions.iter_mut().for_each(|p| *p -= n);
        }
        shift(&mut self.starts, n);
        shift(&mut self.ends, n);
        self.indexed = self.indexed.saturating_sub(n);
        // Every tested end lay before the consumed frame.
        self.tested = 0;
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(span) = self.scan.find_frame(&src[..]) else {
                if src.len() > self.max_buffer {
                    warn!(
                        "discarding {} buffered bytes without a valid frame (cap {})",
                        src.len(),
                        self.max_buffer
                    );
                    src.clear();
                    self.scan = Scan::default();
                }
                return Ok(None);
            };

            let decoded = serde_json::from_slice::<Message>(&src[span.payload.clone()]);
            src.advance(span.end);
            self.scan.consume(span.end);

            match decoded {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => {
                    warn!("dropping frame with undecodable message: {}", e);
                }
            }
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item).map_err(FrameError::Encode)?;
        dst.reserve(payload.len() + 2 + DIGEST_LEN);
        dst.put_u8(FRAME_START);
        dst.put_slice(&payload);
        dst.put_u8(FRAME_END);
        dst.put_slice(&Md5::digest(&payload));
        Ok(())
    }
}

/// Encode one message into a standalone frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameError> {
    let mut buf = BytesMut::new();
    FrameCodec::default().encode(msg.clone(), &mut buf)?;
    Ok(buf.to_vec())
}

/// Decode every complete frame in `buf`, leaving any trailing partial frame
/// in place.
pub fn decode_frames(buf: &mut BytesMut) -> Vec<Message> {
    let mut codec = FrameCodec::default();
    let mut out = Vec::new();
    while let Ok(Some(msg)) = codec.decode(buf) {
        out.push(msg);
    }
    out
}

/// Frame codec errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),
}
