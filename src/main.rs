use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tracing::Level;

use tweetstream_core::{ConsumerKeys, FilterParams};
use tweetstream_server::{ServerConfig, SessionConfig, SignedCookieResolver};
use tweetstream_telemetry::TelemetryConfig;
use tweetstream_upstream::{FrameConfig, RetryConfig, RetryingSource, TwitterConfig, TwitterSource};

/// Relay a filtered Twitter stream to browsers over SSE and WebSocket.
#[derive(Debug, Parser)]
#[command(name = "tweetstream", version)]
struct Args {
    #[arg(long, env = "TWEET_STREAM_SERVER_PORT", default_value_t = 8080)]
    port: u16,

    /// Comma-separated terms to track.
    #[arg(long, env = "TWEET_STREAM_TRACK", value_delimiter = ',', default_value = "")]
    track: Vec<String>,

    #[arg(long, env = "TWITTER_CONSUMER_KEY", hide_env_values = true)]
    consumer_key: String,

    #[arg(long, env = "TWITTER_CONSUMER_SECRET", hide_env_values = true)]
    consumer_secret: String,

    /// Key for verifying session cookies.
    #[arg(long, env = "TWEET_STREAM_SESSION_SECRET", hide_env_values = true)]
    session_secret: String,

    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat_secs: u64,

    #[arg(long, default_value_t = 10)]
    write_timeout_secs: u64,

    #[arg(long, default_value_t = 100)]
    queue_capacity: usize,

    /// Per-attempt bound on connecting and receiving response headers.
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    open_timeout_secs: u64,

    #[arg(long, default_value_t = 1024 * 1024)]
    max_line_bytes: usize,

    /// Reconnect attempts for a failed upstream open.
    #[arg(long, default_value_t = 0)]
    upstream_retries: u32,

    #[arg(long)]
    log_json: bool,

    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let telemetry = tweetstream_telemetry::init_telemetry(TelemetryConfig {
        log_level: args.log_level,
        json: args.log_json,
        ..Default::default()
    });

    let twitter = TwitterSource::new(
        ConsumerKeys::new(args.consumer_key, args.consumer_secret),
        TwitterConfig {
            open_timeout: Duration::from_secs(args.open_timeout_secs),
            ..Default::default()
        },
    )
    .context("building upstream client")?;
    let source = RetryingSource::new(
        twitter,
        RetryConfig {
            max_retries: args.upstream_retries,
            ..Default::default()
        },
    );
    let resolver = SignedCookieResolver::new(SecretString::from(args.session_secret));

    let track: Vec<String> = args
        .track
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if track.is_empty() {
        tracing::warn!("no track terms configured");
    }

    let config = ServerConfig {
        port: args.port,
        filter: FilterParams::track(track),
        session: SessionConfig {
            heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
            write_timeout: Duration::from_secs(args.write_timeout_secs),
            queue_capacity: args.queue_capacity,
            // The Twitter client bounds each attempt itself
            open_timeout: None,
            frame: FrameConfig {
                max_line_bytes: args.max_line_bytes,
                ..Default::default()
            },
        },
    };

    let handle = tweetstream_server::start(
        config,
        Arc::new(source),
        Arc::new(resolver),
        telemetry.metrics(),
    )
    .await
    .context("starting relay server")?;

    tracing::info!(port = handle.port, "tweetstream ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    tracing::info!(
        active_sessions = handle.registry.count(),
        "shutting down"
    );
    Ok(())
}
