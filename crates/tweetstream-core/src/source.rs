use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::credential::Credential;
use crate::errors::UpstreamError;

/// Raw body chunks as they arrive from the upstream connection.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

/// Filter criteria sent when opening the upstream stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterParams {
    /// Phrases to track. Each entry may hold several space-separated terms.
    pub track: Vec<String>,
    /// Ask the upstream to send stall warnings when the client falls behind.
    pub stall_warnings: bool,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            track: Vec::new(),
            stall_warnings: true,
        }
    }
}

impl FilterParams {
    pub fn track(terms: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            track: terms.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Comma-joined `track` parameter value.
    pub fn track_param(&self) -> String {
        self.track.join(",")
    }
}

/// Handle to one open upstream connection.
///
/// Yields body chunks until the connection ends. The connection is released
/// exactly once: either through [`UpstreamStream::close`] or on drop.
pub struct UpstreamStream {
    body: ByteStream,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl UpstreamStream {
    pub fn new(body: impl Stream<Item = Result<Bytes, UpstreamError>> + Send + 'static) -> Self {
        Self {
            body: Box::pin(body),
            on_close: None,
        }
    }

    /// Register a callback that runs when the connection is released.
    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    /// Release the connection.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(hook) = self.on_close.take() {
            self.body = Box::pin(futures::stream::empty());
            hook();
        }
    }
}

impl Drop for UpstreamStream {
    fn drop(&mut self) {
        self.release();
    }
}

impl Stream for UpstreamStream {
    type Item = Result<Bytes, UpstreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.body.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for UpstreamStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamStream")
            .field("released", &self.on_close.is_none())
            .finish_non_exhaustive()
    }
}

/// Something that can open an authenticated upstream status stream.
#[async_trait]
pub trait StreamSource: Send + Sync {
    fn name(&self) -> &str;

    async fn open(
        &self,
        credential: &Credential,
        filter: &FilterParams,
    ) -> Result<UpstreamStream, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_stream(chunks: Vec<&'static str>) -> (UpstreamStream, Arc<AtomicUsize>) {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let body = futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))));
        let stream = UpstreamStream::new(body).on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (stream, closed)
    }

    #[test]
    fn filter_defaults_request_stall_warnings() {
        let filter = FilterParams::default();
        assert!(filter.stall_warnings);
        assert!(filter.track.is_empty());
    }

    #[test]
    fn track_param_is_comma_joined() {
        let filter = FilterParams::track(["rust", "tokio async"]);
        assert_eq!(filter.track_param(), "rust,tokio async");
    }

    #[tokio::test]
    async fn yields_body_chunks() {
        let (mut stream, _) = counting_stream(vec!["a", "b"]);
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from("a"));
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from("b"));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn close_runs_hook_once() {
        let (stream, closed) = counting_stream(vec!["a"]);
        stream.close();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_runs_hook_once() {
        let (stream, closed) = counting_stream(vec!["a"]);
        drop(stream);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
