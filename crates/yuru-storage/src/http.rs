//! Shared HTTP client used by vendor producers and the REST lake backend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: Some(concat!("yuru-health/", env!("CARGO_PKG_VERSION")).to_string()),
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json(&self) -> Result<JsonValue, FetchError> {
        serde_json::from_slice(&self.body).map_err(|err| FetchError::Decode {
            url: self.final_url.clone(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid json: {message}")]
    Decode { url: String, message: String },
    #[error("http client is shut down")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// Sends the request produced by `build`, rebuilding it for every retry.
    /// Non-2xx statuses are errors; 429 and 5xx are retried with backoff.
    pub async fn send<F>(&self, label: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_request", label);
        self.send_with_retries(build).instrument(span).await
    }

    async fn send_with_retries<F>(&self, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let (disposition, err) = match build(&self.client).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => (
                    classify_status(resp.status()),
                    FetchError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: resp.url().to_string(),
                    },
                ),
                Err(err) => (classify_reqwest_error(&err), FetchError::Request(err)),
            };

            if disposition == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                return Err(err);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(error = %err, attempt, ?delay, "retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    pub async fn get_json(
        &self,
        label: &str,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<JsonValue, FetchError> {
        let response = self
            .send(label, |client| {
                let request = client.get(url);
                match bearer {
                    Some(token) => request.bearer_auth(token),
                    None => request,
                }
            })
            .await?;
        response.json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn only_throttling_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn decode_errors_name_the_url() {
        let response = FetchedResponse {
            status: StatusCode::OK,
            final_url: "https://api.example.test/v1".into(),
            body: b"<html>".to_vec(),
        };
        let err = response.json().unwrap_err();
        assert!(err.to_string().contains("https://api.example.test/v1"));
    }
}
