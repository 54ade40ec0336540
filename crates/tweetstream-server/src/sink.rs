//! Client-facing transports.
//!
//! A [`ClientSink`] is the write half of one client connection plus a way
//! to learn that the client went away. Every write runs under the write
//! deadline so a stuck client can only stall its own session.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::response::sse::Event;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::wire::ClientFrame;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("client disconnected")]
    Disconnected,
    #[error("write did not complete within {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Sse,
    WebSocket,
    Recording,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sse => "sse",
            Self::WebSocket => "websocket",
            Self::Recording => "recording",
        }
    }
}

#[async_trait]
pub trait ClientSink: Send + Sync {
    fn transport(&self) -> Transport;

    /// Write one frame and flush it.
    async fn send(&mut self, frame: ClientFrame) -> Result<(), SinkError>;

    /// Resolves once the client has gone away.
    async fn closed(&self);

    /// Release the client connection.
    async fn close(&mut self);
}

// --- Server-sent events ---

pub type SseItem = Result<Event, Infallible>;

/// SSE transport. Frames go through a rendezvous-sized channel into the
/// response body stream; when the client disconnects the body is dropped
/// and the channel closes.
pub struct SseSink {
    tx: Option<mpsc::Sender<SseItem>>,
    write_timeout: Duration,
}

impl SseSink {
    /// Returns the sink and the receiver to wrap in `Sse::new`.
    pub fn channel(write_timeout: Duration) -> (Self, mpsc::Receiver<SseItem>) {
        let (tx, rx) = mpsc::channel(1);
        (
            Self {
                tx: Some(tx),
                write_timeout,
            },
            rx,
        )
    }

    fn event(frame: ClientFrame) -> Event {
        match frame {
            // Comment lines keep the connection warm without firing onmessage.
            ClientFrame::Heartbeat => Event::default().comment("ping"),
            ClientFrame::Content(payload) => Event::default().data(payload),
        }
    }
}

#[async_trait]
impl ClientSink for SseSink {
    fn transport(&self) -> Transport {
        Transport::Sse
    }

    async fn send(&mut self, frame: ClientFrame) -> Result<(), SinkError> {
        let tx = self.tx.as_ref().ok_or(SinkError::Disconnected)?;
        match tokio::time::timeout(self.write_timeout, tx.send(Ok(Self::event(frame)))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SinkError::Disconnected),
            Err(_) => Err(SinkError::Timeout(self.write_timeout)),
        }
    }

    async fn closed(&self) {
        match &self.tx {
            Some(tx) => tx.closed().await,
            None => {}
        }
    }

    async fn close(&mut self) {
        // Dropping the sender ends the response body.
        self.tx = None;
    }
}

// --- WebSocket ---

/// WebSocket transport. A small reader task watches inbound frames and
/// flags the connection closed on a close frame or read error.
pub struct WsSink {
    tx: SplitSink<WebSocket, WsMessage>,
    closed: CancellationToken,
    reader: JoinHandle<()>,
    write_timeout: Duration,
}

impl WsSink {
    pub fn new(socket: WebSocket, write_timeout: Duration) -> Self {
        let (tx, mut rx) = socket.split();
        let closed = CancellationToken::new();

        let token = closed.clone();
        let reader = tokio::spawn(async move {
            // Pongs and client chatter are ignored; axum answers pings itself.
            while let Some(Ok(msg)) = rx.next().await {
                if matches!(msg, WsMessage::Close(_)) {
                    break;
                }
            }
            token.cancel();
        });

        Self {
            tx,
            closed,
            reader,
            write_timeout,
        }
    }

    async fn write(&mut self, msg: WsMessage) -> Result<(), SinkError> {
        if self.closed.is_cancelled() {
            return Err(SinkError::Disconnected);
        }
        match tokio::time::timeout(self.write_timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SinkError::Transport(e.to_string())),
            Err(_) => Err(SinkError::Timeout(self.write_timeout)),
        }
    }
}

#[async_trait]
impl ClientSink for WsSink {
    fn transport(&self) -> Transport {
        Transport::WebSocket
    }

    async fn send(&mut self, frame: ClientFrame) -> Result<(), SinkError> {
        let msg = match frame {
            ClientFrame::Heartbeat => WsMessage::Ping(Vec::new().into()),
            ClientFrame::Content(payload) => WsMessage::Text(payload.into()),
        };
        self.write(msg).await
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn close(&mut self) {
        if !self.closed.is_cancelled() {
            let _ = self.write(WsMessage::Close(None)).await;
        }
        let _ = tokio::time::timeout(self.write_timeout, self.tx.close()).await;
        self.closed.cancel();
        self.reader.abort();
    }
}

impl Drop for WsSink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// --- Test double ---

#[derive(Default)]
struct Recorded {
    frames: Vec<(tokio::time::Instant, ClientFrame)>,
    closed: bool,
}

/// In-memory sink that records every frame with the time it was written.
/// Clones share state, so a test can keep one handle while a session owns
/// the other.
#[derive(Clone)]
pub struct RecordingSink {
    recorded: Arc<Mutex<Recorded>>,
    gone: CancellationToken,
    failing: Arc<Mutex<Option<SinkError>>>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            recorded: Arc::new(Mutex::new(Recorded::default())),
            gone: CancellationToken::new(),
            failing: Arc::new(Mutex::new(None)),
        }
    }

    /// Simulate the client going away.
    pub fn disconnect(&self) {
        self.gone.cancel();
    }

    /// Make every later write fail with `error`.
    pub fn fail_writes(&self, error: SinkError) {
        *self.failing.lock() = Some(error);
    }

    pub fn frames(&self) -> Vec<ClientFrame> {
        self.recorded
            .lock()
            .frames
            .iter()
            .map(|(_, f)| f.clone())
            .collect()
    }

    pub fn timeline(&self) -> Vec<(tokio::time::Instant, ClientFrame)> {
        self.recorded.lock().frames.clone()
    }

    pub fn contents(&self) -> Vec<String> {
        self.recorded
            .lock()
            .frames
            .iter()
            .filter_map(|(_, f)| match f {
                ClientFrame::Content(p) => Some(p.clone()),
                ClientFrame::Heartbeat => None,
            })
            .collect()
    }

    pub fn heartbeats(&self) -> usize {
        self.recorded
            .lock()
            .frames
            .iter()
            .filter(|(_, f)| *f == ClientFrame::Heartbeat)
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.recorded.lock().closed
    }
}

#[async_trait]
impl ClientSink for RecordingSink {
    fn transport(&self) -> Transport {
        Transport::Recording
    }

    async fn send(&mut self, frame: ClientFrame) -> Result<(), SinkError> {
        if self.gone.is_cancelled() {
            return Err(SinkError::Disconnected);
        }
        if let Some(error) = self.failing.lock().clone() {
            return Err(error);
        }
        self.recorded
            .lock()
            .frames
            .push((tokio::time::Instant::now(), frame));
        Ok(())
    }

    async fn closed(&self) {
        self.gone.cancelled().await;
    }

    async fn close(&mut self) {
        self.recorded.lock().closed = true;
    }
}
