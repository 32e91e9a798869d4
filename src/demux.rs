//! Demultiplexer for the container engine's multiplexed log stream
//!
//! A log stream is a sequence of frames, each an 8-byte header followed by a
//! payload:
//!
//! ```text
//! +----------+-----------+------------------------+------------------+
//! | selector | reserved  | length (u32 big-endian)| payload          |
//! | 1 byte   | 3 bytes   | 4 bytes                | `length` bytes   |
//! +----------+-----------+------------------------+------------------+
//! ```
//!
//! Chunks arriving from the transport are not aligned to frame boundaries.
//! The demultiplexer keeps the undecoded tail of the stream in a leftover
//! buffer and decodes eagerly, so the buffer never holds a complete frame
//! between calls.

use bytes::{Buf, Bytes, BytesMut};
use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::trace;

/// Size of a frame header in bytes
pub const HEADER_SIZE: usize = 8;

/// Output stream a frame was written to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    Stdout,
    Stderr,
}

impl Selector {
    /// Map a header selector byte. Only `2` means stderr.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            2 => Selector::Stderr,
            _ => Selector::Stdout,
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub selector: Selector,
    pub payload: Bytes,
}

impl Frame {
    /// Decode the payload as UTF-8, replacing invalid sequences
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Incremental decoder holding the leftover bytes of one log stream
#[derive(Debug, Default)]
pub struct FrameDemuxer {
    leftover: BytesMut,
}

impl FrameDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.leftover.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(frame) = self.decode_one() {
            frames.push(frame);
        }
        frames
    }

    fn decode_one(&mut self) -> Option<Frame> {
        if self.leftover.len() < HEADER_SIZE {
            return None;
        }

        let selector = Selector::from_byte(self.leftover[0]);
        let length = u32::from_be_bytes([
            self.leftover[4],
            self.leftover[5],
            self.leftover[6],
            self.leftover[7],
        ]) as usize;

        if self.leftover.len() < HEADER_SIZE + length {
            return None; // Need more data
        }

        self.leftover.advance(HEADER_SIZE);
        let payload = self.leftover.split_to(length).freeze();
        Some(Frame { selector, payload })
    }

    /// Bytes received but not yet resolved into a frame
    pub fn leftover_len(&self) -> usize {
        self.leftover.len()
    }

    /// End of stream: drop any partial frame and return how many bytes were dropped.
    pub fn finish(self) -> usize {
        let dropped = self.leftover.len();
        if dropped > 0 {
            trace!(dropped, "Discarding partial frame at end of log stream");
        }
        dropped
    }
}

/// Lazy stream of decoded payloads over an upstream of raw chunks
///
/// Upstream errors are passed through. When the upstream ends, any partial
/// frame left in the buffer is discarded and the stream ends.
pub struct DemuxStream<S> {
    upstream: S,
    demuxer: Option<FrameDemuxer>,
    ready: VecDeque<String>,
}

impl<S> DemuxStream<S> {
    pub fn new(upstream: S) -> Self {
        Self {
            upstream,
            demuxer: Some(FrameDemuxer::new()),
            ready: VecDeque::new(),
        }
    }
}

impl<S, B, E> Stream for DemuxStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    type Item = Result<String, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(text) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(text)));
            }

            let Some(demuxer) = this.demuxer.as_mut() else {
                return Poll::Ready(None);
            };

            match Pin::new(&mut this.upstream).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.ready
                        .extend(demuxer.push(chunk.as_ref()).iter().map(Frame::text));
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    if let Some(demuxer) = this.demuxer.take() {
                        demuxer.finish();
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Encode a frame header, used by tests and fixtures
pub fn encode_header(selector: u8, length: u32) -> [u8; HEADER_SIZE] {
    let len = length.to_be_bytes();
    [selector, 0, 0, 0, len[0], len[1], len[2], len[3]]
}
