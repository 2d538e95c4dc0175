//! Job record persistence and the HTTP client posting sources fetch through.

use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, debug_span, Instrument};

pub mod records;

pub use records::{MemoryRecordStore, RecordStore, SqliteRecordStore, StoreError, StoreStats};

pub const CRATE_NAME: &str = "fwatch-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "fwatch-bot/0.1".to_string(),
        }
    }
}

/// A successful response body and the URL it was served from after redirects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Plain GET client. Callers pace their own requests; non-2xx is an error.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get(&self, url: &str) -> Result<FetchedPage, FetchError> {
        async {
            let response = self.client.get(url).send().await?;
            let status = response.status();
            let final_url = response.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = response.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedPage { final_url, body })
        }
        .instrument(debug_span!("http_get", url))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetcher_builds_from_default_config() {
        let config = HttpClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(20));
        assert!(HttpFetcher::new(config).is_ok());
    }

    #[test]
    fn page_text_tolerates_invalid_utf8() {
        let page = FetchedPage {
            final_url: "https://careers.example.com/jobs".to_string(),
            body: b"Cook \xff Jail".to_vec(),
        };
        assert_eq!(page.text(), "Cook \u{fffd} Jail");
    }

    #[test]
    fn status_error_names_the_url() {
        let err = FetchError::HttpStatus {
            status: 503,
            url: "https://careers.example.com/jobs".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "http status 503 for https://careers.example.com/jobs"
        );
    }
}
