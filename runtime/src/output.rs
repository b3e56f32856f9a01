//! Where operation output goes.
//!
//! Both execution paths report through an [`OutputSink`]: engine status
//! lines via [`OutputSink::progress`] and the raw tool output via
//! [`OutputSink::output`]. Sinks decide how to frame it.

use std::sync::OnceLock;

use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::{FerryError, Frame, Result};
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::mpsc;

/// Receiver of operation output.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// A status line from ferry itself.
    async fn progress(&self, text: &str) -> Result<()>;

    /// Bytes produced by the operation's tools.
    async fn output(&self, data: &[u8]) -> Result<()>;
}

/// Streams every message as a Docker JSON frame over a channel.
///
/// A send fails once the receiving side (the HTTP response) is gone, which
/// surfaces as [`FerryError::Cancelled`].
#[derive(Debug, Clone)]
pub struct FramedSink {
    tx: mpsc::Sender<Bytes>,
}

impl FramedSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    /// Send one frame.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame.encode())
            .await
            .map_err(|_| FerryError::Cancelled("client disconnected".to_string()))
    }

    /// Resolves once the receiver is dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

#[async_trait]
impl OutputSink for FramedSink {
    async fn progress(&self, text: &str) -> Result<()> {
        self.send(Frame::stream(text)).await
    }

    async fn output(&self, data: &[u8]) -> Result<()> {
        self.send(Frame::stream(String::from_utf8_lossy(data))).await
    }
}

/// Buffers output in memory.
///
/// In framed mode every message is stored as a stream frame; in raw mode
/// only tool output is kept, unframed, and status lines are dropped.
#[derive(Debug, Default)]
pub struct CaptureSink {
    raw: bool,
    buffer: Mutex<Vec<u8>>,
}

impl CaptureSink {
    /// Keep frames for replay as a complete response body.
    pub fn framed() -> Self {
        Self::default()
    }

    /// Keep only the tools' raw output.
    pub fn raw() -> Self {
        Self {
            raw: true,
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn push_frame(&self, frame: Frame) {
        self.buffer.lock().extend_from_slice(&frame.encode());
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buffer.into_inner())
    }

    /// Drain what has been captured so far.
    pub fn take_bytes(&self) -> Bytes {
        Bytes::from(std::mem::take(&mut *self.buffer.lock()))
    }
}

#[async_trait]
impl OutputSink for CaptureSink {
    async fn progress(&self, text: &str) -> Result<()> {
        if self.raw {
            tracing::debug!(message = %text.trim_end(), "Operation progress");
        } else {
            self.push_frame(Frame::stream(text));
        }
        Ok(())
    }

    async fn output(&self, data: &[u8]) -> Result<()> {
        if self.raw {
            self.buffer.lock().extend_from_slice(data);
        } else {
            self.push_frame(Frame::stream(String::from_utf8_lossy(data)));
        }
        Ok(())
    }
}

fn manifest_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"exporting manifest (sha256:[0-9a-f]+)").expect("static pattern")
    })
}

/// Find the image digest buildkit reports while exporting.
pub fn find_manifest_digest(text: &str) -> Option<String> {
    manifest_pattern()
        .captures_iter(text)
        .last()
        .map(|c| c[1].to_string())
}

/// Passes output through while watching it for the exported image digest.
///
/// Output arrives in arbitrary pieces, so the trailing partial line is kept
/// until its end is seen.
pub struct DigestCapture<S> {
    inner: S,
    state: Mutex<DigestState>,
}

#[derive(Default)]
struct DigestState {
    partial: String,
    digest: Option<String>,
}

impl<S: OutputSink> DigestCapture<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: Mutex::new(DigestState::default()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// The last digest seen, including one on an unterminated final line.
    /// Only meaningful once the output is complete.
    pub fn digest(&self) -> Option<String> {
        let state = self.state.lock();
        find_manifest_digest(&state.partial).or_else(|| state.digest.clone())
    }

    fn scan(&self, data: &[u8]) {
        let mut state = self.state.lock();
        state.partial.push_str(&String::from_utf8_lossy(data));
        if let Some(end) = state.partial.rfind('\n') {
            let complete: String = state.partial.drain(..=end).collect();
            if let Some(digest) = find_manifest_digest(&complete) {
                state.digest = Some(digest);
            }
        }
    }
}

#[async_trait]
impl<S: OutputSink> OutputSink for DigestCapture<S> {
    async fn progress(&self, text: &str) -> Result<()> {
        self.inner.progress(text).await
    }

    async fn output(&self, data: &[u8]) -> Result<()> {
        self.scan(data);
        self.inner.output(data).await
    }
}
