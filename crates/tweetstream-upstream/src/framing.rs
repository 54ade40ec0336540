use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Future, Stream, StreamExt};
use tracing::{debug, warn};

use tweetstream_core::{RawFrame, UpstreamError};
use tweetstream_telemetry::{names, MetricsRecorder};

pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Debug)]
pub struct FrameConfig {
    /// Lines longer than this are discarded up to the next newline.
    pub max_line_bytes: usize,
    /// The upstream sends keep-alive newlines, so silence this long means
    /// the connection is dead.
    pub idle_timeout: Duration,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Splits a byte stream into newline-terminated lines.
///
/// A trailing `\r` is stripped and blank lines are skipped. A line that
/// outgrows `max_line_bytes` is dropped as a whole.
#[derive(Debug)]
struct LineAssembler {
    buf: Vec<u8>,
    max_line_bytes: usize,
    discarding: bool,
    oversized: u64,
}

impl LineAssembler {
    fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line_bytes,
            discarding: false,
            oversized: 0,
        }
    }

    fn push(&mut self, mut chunk: &[u8], frames: &mut VecDeque<RawFrame>) {
        while !chunk.is_empty() {
            match chunk.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    self.append(&chunk[..pos]);
                    chunk = &chunk[pos + 1..];
                    self.complete_line(frames);
                }
                None => {
                    self.append(chunk);
                    break;
                }
            }
        }
    }

    /// Flush an unterminated final line once the body has ended.
    fn finish(&mut self, frames: &mut VecDeque<RawFrame>) {
        self.complete_line(frames);
    }

    fn append(&mut self, bytes: &[u8]) {
        if self.discarding {
            return;
        }
        if self.buf.len() + bytes.len() > self.max_line_bytes {
            self.discarding = true;
            self.oversized += 1;
            self.buf = Vec::new();
            return;
        }
        self.buf.extend_from_slice(bytes);
    }

    fn complete_line(&mut self, frames: &mut VecDeque<RawFrame>) {
        if self.discarding {
            self.discarding = false;
            return;
        }
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if !line.is_empty() {
            frames.push_back(RawFrame::new(line));
        }
    }
}

/// Reads [`RawFrame`]s off an upstream body.
///
/// Ends after the first transport error, after the idle timeout fires, or
/// when the body ends. Each of those is yielded once as the last item
/// (errors) or as `None` (clean end).
pub struct FrameReader<S> {
    inner: S,
    assembler: LineAssembler,
    pending: VecDeque<RawFrame>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl<S> FrameReader<S>
where
    S: Stream<Item = Result<Bytes, UpstreamError>> + Unpin,
{
    pub fn new(inner: S, config: &FrameConfig) -> Self {
        Self {
            inner,
            assembler: LineAssembler::new(config.max_line_bytes),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(config.idle_timeout)),
            idle_duration: config.idle_timeout,
            finished: false,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Lines dropped for exceeding the size cap so far.
    pub fn oversized_lines(&self) -> u64 {
        self.assembler.oversized
    }

    /// Give back the underlying body, e.g. to close it explicitly.
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn ingest(&mut self, bytes: &[u8]) {
        let before = self.assembler.oversized;
        self.assembler.push(bytes, &mut self.pending);
        let dropped = self.assembler.oversized - before;
        if dropped > 0 {
            warn!(
                dropped,
                max_line_bytes = self.assembler.max_line_bytes,
                "discarding oversized upstream line"
            );
            if let Some(metrics) = &self.metrics {
                metrics.counter_inc(names::FRAMES_OVERSIZED, &[], dropped);
            }
        }
    }

    fn emit(&mut self, frame: RawFrame) -> Poll<Option<Result<RawFrame, UpstreamError>>> {
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(names::FRAMES_RECEIVED, &[], 1);
        }
        Poll::Ready(Some(Ok(frame)))
    }
}

impl<S> Stream for FrameReader<S>
where
    S: Stream<Item = Result<Bytes, UpstreamError>> + Unpin,
{
    type Item = Result<RawFrame, UpstreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if let Some(frame) = this.pending.pop_front() {
                return this.emit(frame);
            }
            if this.finished {
                return Poll::Ready(None);
            }

            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let next = tokio::time::Instant::now() + this.idle_duration;
                    this.idle_deadline.as_mut().reset(next);
                    this.ingest(&bytes);
                }
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    debug!("upstream body ended");
                    this.finished = true;
                    this.assembler.finish(&mut this.pending);
                }
                Poll::Pending => {
                    if this.idle_deadline.as_mut().poll(cx).is_ready() {
                        this.finished = true;
                        return Poll::Ready(Some(Err(UpstreamError::Stalled(this.idle_duration))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
