use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tracing::{debug, info, instrument};

use tweetstream_core::{
    ConsumerKeys, Credential, FilterParams, StreamSource, UpstreamError, UpstreamStream,
};

use crate::oauth1::{self, OAuthNonce, Signer};

pub const FILTER_ENDPOINT: &str = "https://stream.twitter.com/1.1/statuses/filter.json";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct TwitterConfig {
    pub endpoint: String,
    /// Bound on connect plus response headers for one attempt. The body
    /// itself is unbounded.
    pub open_timeout: Duration,
}

impl Default for TwitterConfig {
    fn default() -> Self {
        Self {
            endpoint: FILTER_ENDPOINT.to_string(),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }
}

/// Opens filtered status streams against the public streaming endpoint.
pub struct TwitterSource {
    client: Client,
    consumer: ConsumerKeys,
    config: TwitterConfig,
}

impl TwitterSource {
    pub fn new(consumer: ConsumerKeys, config: TwitterConfig) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| UpstreamError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            consumer,
            config,
        })
    }

    fn build_request(
        &self,
        credential: &Credential,
        filter: &FilterParams,
    ) -> reqwest::RequestBuilder {
        let track = filter.track_param();
        let mut params: Vec<(&str, &str)> = Vec::new();
        if !track.is_empty() {
            params.push(("track", track.as_str()));
        }
        if filter.stall_warnings {
            params.push(("stall_warnings", "true"));
        }

        let authorization = Signer::new(&self.consumer, credential).authorization_header(
            "POST",
            &self.config.endpoint,
            &params,
            &OAuthNonce::generate(),
        );

        self.client
            .post(&self.config.endpoint)
            .header("authorization", authorization)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(oauth1::form_body(&params))
    }
}

#[async_trait]
impl StreamSource for TwitterSource {
    fn name(&self) -> &str {
        "twitter"
    }

    #[instrument(skip_all, fields(endpoint = %self.config.endpoint, track = %filter.track_param()))]
    async fn open(
        &self,
        credential: &Credential,
        filter: &FilterParams,
    ) -> Result<UpstreamStream, UpstreamError> {
        let req = self.build_request(credential, filter);

        let resp = tokio::time::timeout(self.config.open_timeout, req.send())
            .await
            .map_err(|_| UpstreamError::OpenTimeout(self.config.open_timeout))?
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let hint = retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status, body).with_retry_after(hint));
        }
        info!(status = resp.status().as_u16(), "upstream stream opened");

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| UpstreamError::Interrupted(e.to_string())));

        // Dropping the response body aborts the underlying connection.
        Ok(UpstreamStream::new(body).on_close(|| debug!("upstream connection released")))
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(endpoint: &str) -> TwitterSource {
        TwitterSource::new(
            ConsumerKeys::new("ck", "cs"),
            TwitterConfig {
                endpoint: endpoint.to_string(),
                open_timeout: Duration::from_millis(500),
            },
        )
        .unwrap()
    }

    #[test]
    fn request_is_signed_form_post() {
        let src = source("https://stream.example.test/filter.json");
        let credential = Credential::new("tok", "sec").unwrap();
        let req = src
            .build_request(&credential, &FilterParams::track(["rust lang", "tokio"]))
            .build()
            .unwrap();

        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(req.url().as_str(), "https://stream.example.test/filter.json");
        let auth = req.headers()["authorization"].to_str().unwrap();
        assert!(auth.starts_with("OAuth "));
        assert!(auth.contains("oauth_token=\"tok\""));
        assert!(auth.contains("oauth_signature_method=\"HMAC-SHA1\""));
        let body = req.body().and_then(|b| b.as_bytes()).unwrap();
        assert_eq!(body, b"track=rust%20lang%2Ctokio&stall_warnings=true");
    }

    #[test]
    fn stall_warnings_omitted_when_disabled() {
        let src = source("https://stream.example.test/filter.json");
        let credential = Credential::new("tok", "sec").unwrap();
        let filter = FilterParams {
            track: vec!["x".into()],
            stall_warnings: false,
        };
        let req = src.build_request(&credential, &filter).build().unwrap();
        let body = req.body().and_then(|b| b.as_bytes()).unwrap();
        assert_eq!(body, b"track=x");
    }

    #[tokio::test]
    async fn rejected_status_is_classified() {
        let app = status_server(401, "bad token").await;
        let src = source(&format!("http://{app}/filter.json"));
        let credential = Credential::new("tok", "sec").unwrap();
        let err = src
            .open(&credential, &FilterParams::track(["x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Unauthorized(ref body) if body == "bad token"));
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let addr = raw_http_server(
            "HTTP/1.1 429 Too Many Requests\r\nretry-after: 90\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let src = source(&format!("http://{addr}/filter.json"));
        let credential = Credential::new("tok", "sec").unwrap();
        let err = src
            .open(&credential, &FilterParams::track(["x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::RateLimited { .. }));
        assert_eq!(err.suggested_delay(), Some(Duration::from_secs(90)));
    }

    #[tokio::test]
    async fn enhance_your_calm_backs_off_a_minute() {
        let app = status_server(420, "Enhance Your Calm").await;
        let src = source(&format!("http://{app}/filter.json"));
        let credential = Credential::new("tok", "sec").unwrap();
        let err = src
            .open(&credential, &FilterParams::track(["x"]))
            .await
            .unwrap_err();
        assert_eq!(err.suggested_delay(), Some(tweetstream_core::RATE_LIMIT_BACKOFF));
    }

    #[test]
    fn retry_after_parses_delta_seconds() {
        use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static(" 15 "));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(15)));
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_network_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let src = source(&format!("http://{addr}/filter.json"));
        let credential = Credential::new("tok", "sec").unwrap();
        let err = src.open(&credential, &FilterParams::default()).await.unwrap_err();
        assert!(
            matches!(err, UpstreamError::Network(_) | UpstreamError::OpenTimeout(_)),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn silent_endpoint_times_out() {
        // Accepts the connection but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let src = source(&format!("http://{addr}/filter.json"));
        let credential = Credential::new("tok", "sec").unwrap();
        let err = src.open(&credential, &FilterParams::default()).await.unwrap_err();
        assert!(matches!(err, UpstreamError::OpenTimeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn streams_body_chunks() {
        let addr = raw_http_server(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\nconnection: close\r\n\r\n{\"text\":\"a\"}\r\n",
        )
        .await;
        let src = source(&format!("http://{addr}/filter.json"));
        let credential = Credential::new("tok", "sec").unwrap();
        let mut stream = src.open(&credential, &FilterParams::default()).await.unwrap();

        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"{\"text\":\"a\"}\r\n");
        stream.close();
    }

    /// Answers every connection with a fixed status line and body.
    async fn status_server(status: u16, body: &'static str) -> std::net::SocketAddr {
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 {status} Status\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            )
            .into_boxed_str(),
        );
        raw_http_server(response).await
    }

    async fn raw_http_server(response: &'static str) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        addr
    }
}
