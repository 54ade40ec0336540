use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use tweetstream_core::{
    ByteStream, Credential, FilterParams, StreamSource, UpstreamError, UpstreamStream,
};

/// Pre-programmed outcome of one `open` call.
pub enum ScriptedResponse {
    /// Yield these chunks, then end the body.
    Chunks(Vec<Bytes>),
    /// Yield these chunks, then keep the connection open without data.
    Hold(Vec<Bytes>),
    /// Body fed by a channel the test controls. Dropping the sender ends it.
    Channel(mpsc::Receiver<Result<Bytes, UpstreamError>>),
    /// Fail the open call itself.
    Error(UpstreamError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<ScriptedResponse>),
}

impl ScriptedResponse {
    /// One CRLF-terminated chunk per line, then end of body.
    pub fn lines(lines: &[&str]) -> Self {
        Self::Chunks(crlf_chunks(lines))
    }

    /// Like [`ScriptedResponse::lines`] but the connection stays open.
    pub fn held_lines(lines: &[&str]) -> Self {
        Self::Hold(crlf_chunks(lines))
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Sender<Result<Bytes, UpstreamError>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::Channel(rx), tx)
    }

    pub fn delayed(delay: Duration, inner: ScriptedResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

fn crlf_chunks(lines: &[&str]) -> Vec<Bytes> {
    lines
        .iter()
        .map(|line| Bytes::from(format!("{line}\r\n")))
        .collect()
}

/// Source that replays scripted responses in order, for tests without a
/// network. Tracks how many connections were opened and released.
pub struct ScriptedSource {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    last_filter: Mutex<Option<FilterParams>>,
}

impl ScriptedSource {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            last_filter: Mutex::new(None),
        }
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Connections released so far, whether closed explicitly or dropped.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn last_filter(&self) -> Option<FilterParams> {
        self.last_filter.lock().clone()
    }
}

#[async_trait]
impl StreamSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(
        &self,
        _credential: &Credential,
        filter: &FilterParams,
    ) -> Result<UpstreamStream, UpstreamError> {
        let idx = self.opens.fetch_add(1, Ordering::SeqCst);
        *self.last_filter.lock() = Some(filter.clone());

        let mut current = self.responses.lock().pop_front().ok_or_else(|| {
            UpstreamError::Network(format!("no scripted response for open #{idx}"))
        })?;

        let body: ByteStream = loop {
            match current {
                ScriptedResponse::Chunks(chunks) => {
                    break stream::iter(chunks.into_iter().map(Ok)).boxed();
                }
                ScriptedResponse::Hold(chunks) => {
                    break stream::iter(chunks.into_iter().map(Ok))
                        .chain(stream::pending())
                        .boxed();
                }
                ScriptedResponse::Channel(rx) => break ReceiverStream::new(rx).boxed(),
                ScriptedResponse::Error(e) => return Err(e),
                ScriptedResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        };

        let closes = Arc::clone(&self.closes);
        Ok(UpstreamStream::new(body).on_close(move || {
            closes.fetch_add(1, Ordering::SeqCst);
        }))
    }
}
