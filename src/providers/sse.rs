//! Server-sent event plumbing shared by the streaming adapters.
//!
//! Each adapter supplies an [`SseDecoder`] that turns one `data:` payload
//! into zero or more [`StreamChunk`]s. [`spawn_sse`] drives a response body
//! through a line buffer and the decoder on a background task.

use futures::StreamExt;
use reqwest::Response;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ProviderError;

use super::StreamChunk;

/// Channel capacity for decoded chunks.
const CHUNK_BUFFER: usize = 64;

/// Provider-specific decoding of SSE `data:` payloads.
pub trait SseDecoder: Send + 'static {
    /// Decode one payload. Returning [`StreamChunk::Done`] ends the stream.
    fn decode(&mut self, data: &str) -> Vec<StreamChunk>;

    /// Called when the body ends without an explicit terminal event.
    fn finish(&mut self) -> Vec<StreamChunk> {
        vec![StreamChunk::Done]
    }
}

/// Accumulates raw bytes and yields complete `data:` payloads.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every complete data payload now available.
    /// Comment lines, `event:` lines and blank keep-alives are skipped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                out.push(data.trim_start().to_string());
            }
        }
        out
    }
}

/// Stream `response` through `decoder` on a spawned task.
///
/// The task stops at the first `Done` or `Error` chunk, when the body ends,
/// or when the receiver is dropped (which is how cancellation reaches it).
pub fn spawn_sse<D: SseDecoder>(response: Response, mut decoder: D) -> mpsc::Receiver<StreamChunk> {
    let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
    let byte_stream = response.bytes_stream();

    tokio::spawn(async move {
        let mut lines = SseLineBuffer::new();
        tokio::pin!(byte_stream);

        while let Some(item) = byte_stream.next().await {
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = tx
                        .send(StreamChunk::Error(ProviderError::Timeout(format!(
                            "Stream read error: {}",
                            e
                        ))))
                        .await;
                    return;
                }
            };

            for data in lines.push(&bytes) {
                for chunk in decoder.decode(&data) {
                    let terminal = matches!(chunk, StreamChunk::Done | StreamChunk::Error(_));
                    if tx.send(chunk).await.is_err() {
                        debug!("Stream receiver dropped, abandoning response body");
                        return;
                    }
                    if terminal {
                        return;
                    }
                }
            }
        }

        for chunk in decoder.finish() {
            if tx.send(chunk).await.is_err() {
                return;
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_handles_split_lines() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(b"event: message_start\ndata: {\"a\":").is_empty());
        let out = buf.push(b"1}\n\n: keep-alive\ndata:[DONE]\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn test_line_buffer_handles_crlf() {
        let mut buf = SseLineBuffer::new();
        let out = buf.push(b"data: x\r\n\r\n");
        assert_eq!(out, vec!["x".to_string()]);
    }
}
