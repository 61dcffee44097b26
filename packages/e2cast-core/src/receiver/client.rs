//! HTTP client for the receiver with classified errors and bounded backoff.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::types::{BouquetsResponse, EpgResponse, ServicesResponse};
use super::{Bouquet, EpgEvent, ServiceEntry};
use crate::protocol_constants::{POST_TUNE_SETTLE_MS, RECEIVER_BACKOFF_BASE_MS};

/// Classified receiver failure.
#[derive(Debug, Error)]
pub enum ReceiverError {
    /// Request deadline elapsed.
    #[error("receiver request timed out")]
    Timeout,

    /// TCP/TLS level failure (receiver down, network partition).
    #[error("receiver connection error: {0}")]
    Connection(String),

    /// Receiver answered 4xx; the request itself is wrong, never retried.
    #[error("receiver rejected request: HTTP {0}")]
    Http4xx(u16),

    /// Receiver answered 5xx; transient, retried.
    #[error("receiver error: HTTP {0}")]
    Http5xx(u16),

    /// Response body failed to parse; never retried.
    #[error("receiver response decode error: {0}")]
    Decode(String),

    /// The session context was cancelled mid-call.
    #[error("receiver call cancelled")]
    Cancelled,

    /// The stream playlist came back without a stream URL.
    #[error("receiver returned an empty stream playlist for {0}")]
    EmptyPlaylist(String),
}

impl ReceiverError {
    /// Whether a retry can plausibly help.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Connection(_) | Self::Http5xx(_)
        )
    }
}

impl From<reqwest::Error> for ReceiverError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connection(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Connection(err.to_string())
        }
    }
}

/// Result alias for receiver operations.
pub type ReceiverResult<T> = Result<T, ReceiverError>;

/// Seam between the orchestrator and the receiver.
///
/// The worker only ever needs "service reference in, connectable URL
/// out"; tests substitute a resolver that never touches the network.
#[async_trait::async_trait]
pub trait StreamResolver: Send + Sync {
    /// Resolves a service reference to a stream URL the encoder can
    /// connect to, with the post-tune settle already applied.
    async fn resolve(
        &self,
        service_ref: &str,
        cancel: &CancellationToken,
    ) -> ReceiverResult<String>;
}

#[async_trait::async_trait]
impl StreamResolver for ReceiverClient {
    async fn resolve(
        &self,
        service_ref: &str,
        cancel: &CancellationToken,
    ) -> ReceiverResult<String> {
        self.resolve_stream_url_settled(service_ref, cancel).await
    }
}

/// Client for the receiver's OpenWebif-style Web API.
pub struct ReceiverClient {
    http: reqwest::Client,
    base_url: String,
    retries: u32,
    max_backoff: Duration,
}

impl ReceiverClient {
    /// Creates a client against `base_url` (scheme + host + optional port).
    pub fn new(
        base_url: &str,
        request_timeout: Duration,
        retries: u32,
        max_backoff: Duration,
    ) -> ReceiverResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ReceiverError::Connection(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retries,
            max_backoff,
        })
    }

    /// Resolves the live stream URL for a service reference.
    ///
    /// Calls `/web/stream.m3u` and takes the first non-comment line
    /// verbatim - host, port and path come from the receiver, which
    /// allocates the streaming port per channel.
    pub async fn resolve_stream_url(
        &self,
        service_ref: &str,
        cancel: &CancellationToken,
    ) -> ReceiverResult<String> {
        let url = format!("{}/web/stream.m3u", self.base_url);
        let body = self
            .with_backoff(cancel, || async {
                let response = self
                    .http
                    .get(url.as_str())
                    .query(&[("ref", service_ref)])
                    .send()
                    .await?;
                Self::check_status(response.status())?;
                Ok(response.text().await?)
            })
            .await?;

        body.lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .ok_or_else(|| ReceiverError::EmptyPlaylist(service_ref.to_string()))
    }

    /// Resolves the live stream URL, then waits out the post-tune settle
    /// period before returning.
    ///
    /// The receiver's WebAPI answers before the per-channel data port
    /// accepts connections; connecting the encoder immediately produces a
    /// black screen on relay-routed channels.
    pub async fn resolve_stream_url_settled(
        &self,
        service_ref: &str,
        cancel: &CancellationToken,
    ) -> ReceiverResult<String> {
        let url = self.resolve_stream_url(service_ref, cancel).await?;
        log::debug!(
            "[Receiver] Resolved {} -> {}, settling {}ms",
            service_ref,
            url,
            POST_TUNE_SETTLE_MS
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(ReceiverError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(POST_TUNE_SETTLE_MS)) => {}
        }
        Ok(url)
    }

    /// Lists bouquets.
    pub async fn list_bouquets(&self, cancel: &CancellationToken) -> ReceiverResult<Vec<Bouquet>> {
        let url = format!("{}/api/bouquets", self.base_url);
        let parsed: BouquetsResponse = self
            .with_backoff(cancel, || async {
                let response = self.http.get(url.as_str()).send().await?;
                Self::check_status(response.status())?;
                response
                    .json()
                    .await
                    .map_err(|e| ReceiverError::Decode(e.to_string()))
            })
            .await?;
        Ok(parsed
            .bouquets
            .into_iter()
            .map(|(service_ref, name)| Bouquet { service_ref, name })
            .collect())
    }

    /// Lists the services of one bouquet.
    pub async fn list_services(
        &self,
        bouquet_ref: &str,
        cancel: &CancellationToken,
    ) -> ReceiverResult<Vec<ServiceEntry>> {
        let url = format!("{}/api/getservices", self.base_url);
        let parsed: ServicesResponse = self
            .with_backoff(cancel, || async {
                let response = self
                    .http
                    .get(url.as_str())
                    .query(&[("sRef", bouquet_ref)])
                    .send()
                    .await?;
                Self::check_status(response.status())?;
                response
                    .json()
                    .await
                    .map_err(|e| ReceiverError::Decode(e.to_string()))
            })
            .await?;
        Ok(parsed.services)
    }

    /// Fetches the EPG for one service.
    pub async fn epg_for_service(
        &self,
        service_ref: &str,
        cancel: &CancellationToken,
    ) -> ReceiverResult<Vec<EpgEvent>> {
        let url = format!("{}/api/epgservice", self.base_url);
        let parsed: EpgResponse = self
            .with_backoff(cancel, || async {
                let response = self
                    .http
                    .get(url.as_str())
                    .query(&[("sRef", service_ref)])
                    .send()
                    .await?;
                Self::check_status(response.status())?;
                response
                    .json()
                    .await
                    .map_err(|e| ReceiverError::Decode(e.to_string()))
            })
            .await?;
        Ok(parsed.events)
    }

    fn check_status(status: reqwest::StatusCode) -> ReceiverResult<()> {
        if status.is_client_error() {
            Err(ReceiverError::Http4xx(status.as_u16()))
        } else if status.is_server_error() {
            Err(ReceiverError::Http5xx(status.as_u16()))
        } else {
            Ok(())
        }
    }

    /// Executes `operation` with exponential backoff on transient errors.
    ///
    /// Delays run 500ms, 1s, 2s, ... capped at `max_backoff`, for at most
    /// `retries` retries. Cancellation is honored between and during
    /// attempts.
    async fn with_backoff<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> ReceiverResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ReceiverResult<T>>,
    {
        let mut last_error = None;
        for attempt in 0..=self.retries {
            if attempt > 0 {
                let backoff = Duration::from_millis(
                    RECEIVER_BACKOFF_BASE_MS.saturating_mul(1 << (attempt - 1).min(16)),
                )
                .min(self.max_backoff);
                log::info!(
                    "[Receiver] Retrying (attempt {}/{}) after {:?}",
                    attempt + 1,
                    self.retries + 1,
                    backoff
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ReceiverError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ReceiverError::Cancelled),
                result = operation() => result,
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    log::warn!("[Receiver] Transient error: {}", e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.expect("retry loop sets last_error before exhausting attempts"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ReceiverError::Timeout.is_transient());
        assert!(ReceiverError::Http5xx(502).is_transient());
        assert!(ReceiverError::Connection("refused".into()).is_transient());
        assert!(!ReceiverError::Http4xx(404).is_transient());
        assert!(!ReceiverError::Decode("bad json".into()).is_transient());
        assert!(!ReceiverError::Cancelled.is_transient());
    }

    #[test]
    fn stream_playlist_parsing_takes_first_url_line() {
        let body = "#EXTM3U\n#EXTVLCOPT--http-reconnect=true\nhttp://box:8001/1:0:19:1:1:1:1:0:0:0:\n";
        let url = body
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'));
        assert_eq!(url, Some("http://box:8001/1:0:19:1:1:1:1:0:0:0:"));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_any_attempt() {
        let client = ReceiverClient::new(
            "http://127.0.0.1:1",
            Duration::from_millis(100),
            2,
            Duration::from_millis(200),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = client.resolve_stream_url("1:0:19::", &cancel).await;
        assert!(matches!(result, Err(ReceiverError::Cancelled)));
    }
}
