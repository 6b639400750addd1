//! Demultiplexer for the Docker attach/exec stream format.
//!
//! When a container runs without a TTY, the Engine API multiplexes stdout and
//! stderr onto one byte stream. Every frame carries an 8-byte header:
//!
//! ```text
//! ┌────────┬────────────┬──────────────────────┐
//! │ byte 0 │ bytes 1..4 │ bytes 4..8           │
//! │ stream │ (unused)   │ payload length (BE)  │
//! └────────┴────────────┴──────────────────────┘
//! ```
//!
//! followed by exactly `length` payload bytes. Frames may be split at any
//! byte across the chunks delivered by the transport, so the parser buffers
//! unconsumed bytes and only yields a payload once its frame is complete.

use crate::error::RuntimeError;
use crate::exec::{OutputChunk, StreamKind};
use bytes::{Buf, Bytes, BytesMut};
use futures::stream::{BoxStream, Stream, StreamExt};

/// Size of a frame header in bytes.
pub const HEADER_LEN: usize = 8;

const STREAM_STDIN: u8 = 0;
const STREAM_STDOUT: u8 = 1;
const STREAM_STDERR: u8 = 2;

/// Incremental frame parser.
///
/// Consumed frames are split off the front of an internal [`BytesMut`], so
/// the buffer's allocation is reused across frames instead of growing with
/// the total length of the stream.
#[derive(Debug, Default)]
pub struct FrameDemuxer {
    buf: BytesMut,
}

impl FrameDemuxer {
    /// Create an empty demuxer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// Returns `None` when fewer bytes than a full frame are buffered. Frames
    /// with an unknown stream type are skipped.
    pub fn next_chunk(&mut self) -> Option<OutputChunk> {
        loop {
            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let stream = self.buf[0];
            let header = [self.buf[4], self.buf[5], self.buf[6], self.buf[7]];
            let len = u32::from_be_bytes(header) as usize;
            let frame_len = HEADER_LEN + len;

            if self.buf.len() < frame_len {
                self.buf.reserve(frame_len - self.buf.len());
                return None;
            }

            self.buf.advance(HEADER_LEN);
            let data = self.buf.split_to(len).freeze();

            let kind = match stream {
                // stdin is only echoed back when the exec attached it
                STREAM_STDIN | STREAM_STDOUT => StreamKind::Stdout,
                STREAM_STDERR => StreamKind::Stderr,
                other => {
                    tracing::trace!(stream = other, len, "Skipping unknown stream type");
                    continue;
                }
            };

            return Some(OutputChunk { kind, data });
        }
    }

    /// Push a chunk and drain every frame it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<OutputChunk> {
        self.push(chunk);
        std::iter::from_fn(|| self.next_chunk()).collect()
    }

    /// Number of buffered bytes not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Adapt a raw multiplexed byte stream into a stream of output chunks.
///
/// The returned stream ends when the raw stream ends. A transport error is
/// yielded once and terminates the stream. Trailing bytes of an incomplete
/// frame are dropped with a warning.
pub fn demux_stream<S, E>(raw: S) -> BoxStream<'static, Result<OutputChunk, RuntimeError>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<RuntimeError> + 'static,
{
    let raw = raw.map(|item| item.map_err(Into::into)).boxed();

    futures::stream::unfold(
        (raw, FrameDemuxer::new(), false),
        |(mut raw, mut demuxer, mut done)| async move {
            loop {
                if let Some(chunk) = demuxer.next_chunk() {
                    return Some((Ok(chunk), (raw, demuxer, done)));
                }
                if done {
                    return None;
                }
                match raw.next().await {
                    Some(Ok(bytes)) => demuxer.push(&bytes),
                    Some(Err(e)) => {
                        return Some((Err(e), (raw, demuxer, true)));
                    }
                    None => {
                        if demuxer.buffered() > 0 {
                            tracing::warn!(
                                trailing_bytes = demuxer.buffered(),
                                "Exec stream ended inside a frame"
                            );
                        }
                        done = true;
                    }
                }
            }
        },
    )
    .boxed()
}
