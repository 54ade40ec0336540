//! One client connection relayed from one upstream stream.
//!
//! A session moves through `Authorizing → StreamOpening → Streaming →
//! Closing → Closed`. While streaming, a spawned read task turns upstream
//! frames into queued payloads and the calling task writes them to the
//! client, interleaved with heartbeats. Whichever side stops first ends
//! both; the upstream connection is released before the client is.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Instrument};

use tweetstream_core::{
    Credential, FilterParams, LifecycleEvent, SessionId, StreamSource, UpstreamError,
    UpstreamStream,
};
use tweetstream_telemetry::{names, MetricsRecorder};
use tweetstream_upstream::{Decoder, Demux, FrameConfig, FrameReader, DEFAULT_OPEN_TIMEOUT};

use crate::auth::{AuthError, CredentialResolver};
use crate::queue::{outbound_queue, QueueConsumer, QueueProducer, DEFAULT_QUEUE_CAPACITY};
use crate::sink::{ClientSink, SinkError, Transport, DEFAULT_WRITE_TIMEOUT};
use crate::wire::{self, ClientFrame};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// A heartbeat goes out on each tick that saw no other write.
    pub heartbeat_interval: Duration,
    /// Deadline for a single client write.
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    /// Bound on the whole upstream open, retries included. `None` leaves
    /// it to a source that already bounds each attempt.
    pub open_timeout: Option<Duration>,
    pub frame: FrameConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            open_timeout: Some(DEFAULT_OPEN_TIMEOUT),
            frame: FrameConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Authorizing,
    StreamOpening,
    Streaming,
    Closing,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    #[error("upstream open failed: {0}")]
    Upstream(UpstreamError),
    #[error("upstream did not respond within {0:?}")]
    OpenTimeout(Duration),
    #[error("operation not valid in state {0:?}")]
    InvalidState(SessionState),
}

impl SessionError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) | Self::Upstream(UpstreamError::Unauthorized(_)) => {
                StatusCode::UNAUTHORIZED
            }
            Self::OpenTimeout(_) | Self::Upstream(UpstreamError::OpenTimeout(_)) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidState(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Upstream(e) => e.error_kind(),
            Self::OpenTimeout(_) => "open_timeout",
            Self::InvalidState(_) => "invalid_state",
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.to_string(),
            "kind": self.error_kind(),
        });
        (self.status(), Json(body)).into_response()
    }
}

/// Why a streaming session ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    ClientDisconnected,
    UpstreamEnded,
    UpstreamFailed(String),
    WriteFailed(String),
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientDisconnected => "client_disconnected",
            Self::UpstreamEnded => "upstream_ended",
            Self::UpstreamFailed(_) => "upstream_failed",
            Self::WriteFailed(_) => "write_failed",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub transport: Transport,
    pub reason: CloseReason,
    pub frames: u64,
    pub delivered: u64,
    /// Dropped because the outbound queue was full.
    pub dropped: u64,
    /// Still queued when the client went away.
    pub undelivered: u64,
    pub decode_errors: u64,
    pub heartbeats: u64,
    pub duration_ms: u64,
}

pub struct ConnectionSession {
    id: SessionId,
    state: SessionState,
    config: SessionConfig,
    credential: Option<Credential>,
    metrics: Arc<MetricsRecorder>,
}

impl ConnectionSession {
    pub fn new(config: SessionConfig, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            id: SessionId::new(),
            state: SessionState::Authorizing,
            config,
            credential: None,
            metrics,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState(self.state))
        }
    }

    fn fail(&mut self, outcome: &str) {
        self.state = SessionState::Closed;
        self.credential = None;
        self.metrics
            .counter_inc(names::SESSIONS_TOTAL, &[("outcome", outcome)], 1);
    }

    /// Resolve the caller's credential.
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn authorize(
        &mut self,
        resolver: &dyn CredentialResolver,
        headers: &HeaderMap,
    ) -> Result<(), SessionError> {
        self.expect_state(SessionState::Authorizing)?;
        match resolver.resolve(headers).await {
            Ok(credential) => {
                debug!(user_id = credential.user_id(), "credential resolved");
                self.credential = Some(credential);
                self.state = SessionState::StreamOpening;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "rejecting unauthorized client");
                self.fail("unauthorized");
                Err(e.into())
            }
        }
    }

    /// Open the upstream stream with the resolved credential.
    #[instrument(skip_all, fields(session_id = %self.id, source = source.name()))]
    pub async fn open_upstream(
        &mut self,
        source: &dyn StreamSource,
        filter: &FilterParams,
    ) -> Result<UpstreamStream, SessionError> {
        self.expect_state(SessionState::StreamOpening)?;
        let credential = self
            .credential
            .as_ref()
            .ok_or(SessionError::InvalidState(self.state))?;

        let opening = source.open(credential, filter);
        let opened = match self.config.open_timeout {
            Some(limit) => tokio::time::timeout(limit, opening)
                .await
                .map_err(|_| SessionError::OpenTimeout(limit)),
            None => Ok(opening.await),
        };
        let error = match opened {
            Ok(Ok(upstream)) => {
                info!("upstream stream opened");
                self.state = SessionState::Streaming;
                return Ok(upstream);
            }
            Ok(Err(e)) => SessionError::Upstream(e),
            Err(timed_out) => timed_out,
        };

        warn!(error = %error, kind = error.error_kind(), "failed to open upstream");
        self.metrics.counter_inc(
            names::UPSTREAM_OPEN_FAILURES,
            &[("kind", error.error_kind())],
            1,
        );
        self.fail("open_failed");
        Err(error)
    }

    /// Relay `upstream` to `sink` until either side stops.
    pub async fn stream<S: ClientSink>(self, upstream: UpstreamStream, sink: S) -> SessionSummary {
        let span = tracing::info_span!(
            "session",
            session_id = %self.id,
            transport = sink.transport().as_str()
        );
        self.run(upstream, sink).instrument(span).await
    }

    async fn run<S: ClientSink>(mut self, upstream: UpstreamStream, mut sink: S) -> SessionSummary {
        self.state = SessionState::Streaming;
        let started = Instant::now();
        self.metrics.gauge_inc(names::SESSIONS_ACTIVE, &[], 1.0);
        info!("session streaming");

        let (producer, mut queue) =
            outbound_queue(self.config.queue_capacity, Arc::clone(&self.metrics));
        let cancel = CancellationToken::new();
        let frames = FrameReader::new(upstream, &self.config.frame)
            .with_metrics(Arc::clone(&self.metrics));
        let decoder = Decoder::new(Arc::clone(&self.metrics));
        let reader = tokio::spawn(
            read_path(frames, producer, decoder, cancel.clone()).in_current_span(),
        );

        let written = self.write_path(&mut queue, &mut sink).await;

        // Stop reading, release the upstream, then the queue, then the client.
        self.state = SessionState::Closing;
        cancel.cancel();
        let read = match reader.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                // The upstream was dropped, and so released, with the task.
                warn!(error = %e, "read task failed");
                None
            }
        };
        let (read_end, frames, decode_errors) = match read {
            Some(outcome) => {
                outcome.upstream.close();
                (Some(outcome.end), outcome.frames, outcome.decode_errors)
            }
            None => (None, 0, 0),
        };
        queue.close();
        let undelivered = queue.drain() as u64;
        sink.close().await;
        self.state = SessionState::Closed;
        self.credential = None;

        let reason = close_reason(written.end, read_end);
        let summary = SessionSummary {
            id: self.id.clone(),
            transport: sink.transport(),
            reason,
            frames,
            delivered: written.delivered,
            dropped: queue.dropped(),
            undelivered,
            decode_errors,
            heartbeats: written.heartbeats,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        self.metrics.gauge_inc(names::SESSIONS_ACTIVE, &[], -1.0);
        self.metrics.counter_inc(
            names::SESSIONS_TOTAL,
            &[("outcome", summary.reason.as_str())],
            1,
        );
        info!(
            reason = summary.reason.as_str(),
            delivered = summary.delivered,
            dropped = summary.dropped,
            undelivered = summary.undelivered,
            decode_errors = summary.decode_errors,
            heartbeats = summary.heartbeats,
            duration_ms = summary.duration_ms,
            "session closed"
        );
        summary
    }

    async fn write_path<S: ClientSink>(
        &self,
        queue: &mut QueueConsumer,
        sink: &mut S,
    ) -> WriteOutcome {
        // interval() panics on a zero period
        let period = self.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await; // consume first immediate tick

        let mut wrote_since_tick = false;
        let mut delivered = 0;
        let mut heartbeats = 0;

        let end = loop {
            tokio::select! {
                biased;
                _ = sink.closed() => break WriteEnd::ClientGone,
                payload = queue.dequeue() => {
                    let Some(payload) = payload else {
                        break WriteEnd::QueueClosed;
                    };
                    if let Err(e) = self.write(sink, ClientFrame::Content(payload)).await {
                        break WriteEnd::Failed(e);
                    }
                    delivered += 1;
                    wrote_since_tick = true;
                }
                _ = heartbeat.tick() => {
                    if !wrote_since_tick {
                        if let Err(e) = self.write(sink, ClientFrame::Heartbeat).await {
                            break WriteEnd::Failed(e);
                        }
                        heartbeats += 1;
                    }
                    wrote_since_tick = false;
                }
            }
        };

        WriteOutcome {
            end,
            delivered,
            heartbeats,
        }
    }

    async fn write<S: ClientSink>(&self, sink: &mut S, frame: ClientFrame) -> Result<(), SinkError> {
        let counter = match frame {
            ClientFrame::Heartbeat => names::HEARTBEATS_SENT,
            ClientFrame::Content(_) => names::MESSAGES_DELIVERED,
        };
        let started = Instant::now();
        let result = sink.send(frame).await;
        self.metrics.histogram_observe(
            names::WRITE_DURATION_MS,
            &[],
            started.elapsed().as_secs_f64() * 1000.0,
        );
        match &result {
            Ok(()) => self.metrics.counter_inc(counter, &[], 1),
            Err(e) => debug!(error = %e, "client write failed"),
        }
        result
    }
}

enum WriteEnd {
    QueueClosed,
    ClientGone,
    Failed(SinkError),
}

struct WriteOutcome {
    end: WriteEnd,
    delivered: u64,
    heartbeats: u64,
}

enum ReadEnd {
    Ended,
    Failed(UpstreamError),
    Cancelled,
}

struct ReadOutcome {
    upstream: UpstreamStream,
    end: ReadEnd,
    frames: u64,
    decode_errors: u64,
}

fn close_reason(write: WriteEnd, read: Option<ReadEnd>) -> CloseReason {
    match write {
        WriteEnd::ClientGone | WriteEnd::Failed(SinkError::Disconnected) => {
            CloseReason::ClientDisconnected
        }
        WriteEnd::Failed(e) => CloseReason::WriteFailed(e.to_string()),
        WriteEnd::QueueClosed => match read {
            Some(ReadEnd::Ended) => CloseReason::UpstreamEnded,
            Some(ReadEnd::Failed(e)) => CloseReason::UpstreamFailed(e.to_string()),
            Some(ReadEnd::Cancelled) => CloseReason::ClientDisconnected,
            None => CloseReason::UpstreamFailed("read task failed".into()),
        },
    }
}

/// Upstream frames → decoded messages → queued client payloads.
///
/// Only content items reach the queue. Dropping the demux at the end drops
/// the producer, which closes the queue behind the last payload.
async fn read_path(
    mut frames: FrameReader<UpstreamStream>,
    producer: QueueProducer,
    decoder: Decoder,
    cancel: CancellationToken,
) -> ReadOutcome {
    let mut demux = Demux::new()
        .on_content(move |item| match wire::encode_content(&item) {
            Ok(payload) => {
                producer.enqueue(payload);
            }
            Err(e) => warn!(error = %e, "failed to encode content item"),
        })
        .on_direct(|dm| {
            debug!(sender_id = dm.sender_id.as_deref(), "direct notification not relayed")
        })
        .on_lifecycle(log_lifecycle)
        .on_warning(|w| {
            warn!(
                code = %w.code,
                percent_full = w.percent_full,
                message = %w.message,
                "upstream stall warning"
            )
        });

    let mut frame_count = 0;
    let mut decode_errors = 0;
    let end = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break ReadEnd::Cancelled,
            item = frames.next() => match item {
                Some(Ok(frame)) => {
                    frame_count += 1;
                    match decoder.decode(&frame) {
                        Some(message) => demux.handle(message),
                        None => decode_errors += 1,
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, kind = e.error_kind(), "upstream stream failed");
                    break ReadEnd::Failed(e);
                }
                None => {
                    info!("upstream stream ended");
                    break ReadEnd::Ended;
                }
            },
        }
    };
    drop(demux);

    ReadOutcome {
        upstream: frames.into_inner(),
        end,
        frames: frame_count,
        decode_errors,
    }
}

fn log_lifecycle(event: LifecycleEvent) {
    match &event {
        LifecycleEvent::Disconnect {
            code,
            stream_name,
            reason,
        } => info!(
            code = *code,
            stream_name = stream_name.as_deref(),
            reason = %reason,
            "upstream announced disconnect"
        ),
        LifecycleEvent::Limit { undelivered } => {
            debug!(undelivered = *undelivered, "upstream rate limit notice")
        }
        other => debug!(event = other.name(), "lifecycle notice"),
    }
}
