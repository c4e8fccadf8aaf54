//! HTTP GET with bounded retries for live captures.

use std::time::Duration;

use anyhow::Context;
use reqwest::{header, Client, StatusCode};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

/// Exponential delay between attempts, capped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub retries: usize,
    pub initial_delay: Duration,
    pub delay_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_delay: Duration::from_millis(500),
            delay_cap: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based), or `None` when exhausted.
    pub fn delay_before(&self, retry: usize) -> Option<Duration> {
        if retry >= self.retries {
            return None;
        }
        let doubled = u32::try_from(retry)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        Some(self.initial_delay.saturating_mul(doubled).min(self.delay_cap))
    }
}

/// 5xx and 429 are worth another attempt; other statuses are final.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    /// URL after redirects.
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        if let Some(agent) = config.user_agent {
            builder = builder.user_agent(agent);
        }
        Ok(Self {
            client: builder.build().context("building http client")?,
            retry: config.retry,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.get(url)
            .instrument(info_span!("http_fetch", %run_id, source_id, url))
            .await
    }

    async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0;
        loop {
            let failure = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return read_body(url, resp).await,
                Ok(resp) => {
                    let status = resp.status();
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (is_transient_status(status), err)
                }
                Err(source) => (
                    is_transient_error(&source),
                    FetchError::Request {
                        url: url.to_string(),
                        source,
                    },
                ),
            };

            let (transient, err) = failure;
            match self.retry.delay_before(retry).filter(|_| transient) {
                Some(delay) => {
                    debug!(error = %err, retry, ?delay, "retrying");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                None => return Err(err),
            }
        }
    }
}

async fn read_body(url: &str, resp: reqwest::Response) -> Result<FetchedResponse, FetchError> {
    let status = resp.status();
    let final_url = resp.url().to_string();
    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = resp.bytes().await.map_err(|source| FetchError::Request {
        url: url.to_string(),
        source,
    })?;
    Ok(FetchedResponse {
        status,
        final_url,
        content_type,
        body: body.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap_then_stop() {
        let policy = RetryPolicy {
            retries: 4,
            initial_delay: Duration::from_millis(100),
            delay_cap: Duration::from_millis(350),
        };
        let delays: Vec<_> = (0..5).map(|n| policy.delay_before(n)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_millis(100)),
                Some(Duration::from_millis(200)),
                Some(Duration::from_millis(350)),
                Some(Duration::from_millis(350)),
                None,
            ]
        );
    }

    #[test]
    fn zero_retries_never_waits() {
        let policy = RetryPolicy {
            retries: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_before(0), None);
    }

    #[test]
    fn server_errors_and_throttling_are_transient() {
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
    }
}
