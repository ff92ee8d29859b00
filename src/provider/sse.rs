//! Server-sent-event framing with a per-read inactivity bound.

use std::time::Duration;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use crate::error::StewardError;

/// One decoded SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// Payload of a `data:` line.
    Data(String),
    /// The `[DONE]` sentinel.
    Done,
}

pub type FrameStream = BoxStream<'static, Result<SseFrame, StewardError>>;

/// Split a byte stream into SSE data frames.
///
/// Every individual read is bounded by `inactivity`. A body that closes before
/// producing a single frame is reported as [`StewardError::MissingBody`].
pub fn sse_frames<S, B, E>(bytes: S, inactivity: Duration) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<StewardError> + Send,
{
    let stream = async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        let mut frames_seen = 0usize;
        futures::pin_mut!(bytes);

        loop {
            let chunk = match tokio::time::timeout(inactivity, bytes.next()).await {
                Err(_) => {
                    yield Err(StewardError::Timeout(inactivity.as_millis() as u64));
                    return;
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    yield Err(err.into());
                    return;
                }
                Ok(Some(Ok(chunk))) => chunk,
            };
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line_bytes: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line_bytes);
                if let Some(frame) = parse_line(line.trim()) {
                    frames_seen += 1;
                    yield Ok(frame);
                }
            }
        }

        let tail = String::from_utf8_lossy(&buffer).trim().to_string();
        if let Some(frame) = parse_line(&tail) {
            frames_seen += 1;
            yield Ok(frame);
        }
        if frames_seen == 0 {
            yield Err(StewardError::MissingBody);
        }
    };
    Box::pin(stream)
}

/// Parse one SSE line. Comments, `event:` and `id:` lines yield nothing.
fn parse_line(line: &str) -> Option<SseFrame> {
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseFrame::Done);
    }
    if data.is_empty() {
        return None;
    }
    Some(SseFrame::Data(data.to_string()))
}

/// Build a frame stream from in-memory frames (used by tests and replays).
pub fn frames_from_iter<I>(frames: I) -> FrameStream
where
    I: IntoIterator<Item = SseFrame>,
    I::IntoIter: Send + 'static,
{
    Box::pin(futures::stream::iter(frames.into_iter().map(Ok)))
}
