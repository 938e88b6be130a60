use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15";

pub fn build_client() -> Client {
    let timeout = std::env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(15);
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .user_agent(BROWSER_USER_AGENT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("unreadable body: {0}")]
    Body(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else {
            FetchError::Request(err.to_string())
        }
    }
}

/// Outbound web access used by scraping and validation.
#[async_trait]
pub trait WebClient: Send + Sync {
    async fn fetch_page(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<String, FetchError>;

    /// Returns the response status; transport failures and timeouts are errors.
    async fn head_check(&self, url: &str, timeout: Duration) -> Result<u16, FetchError>;
}

pub fn is_reachable(status: &Result<u16, FetchError>) -> bool {
    matches!(status, Ok(code) if (200..400).contains(code))
}

#[derive(Debug, Clone)]
pub struct HttpWebClient {
    http: Client,
}

impl HttpWebClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    pub fn from_env() -> Self {
        Self::new(build_client())
    }
}

#[async_trait]
impl WebClient for HttpWebClient {
    async fn fetch_page(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<String, FetchError> {
        let mut request = self.http.get(url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }
        response
            .text()
            .await
            .map_err(|err| FetchError::Body(err.to_string()))
    }

    async fn head_check(&self, url: &str, timeout: Duration) -> Result<u16, FetchError> {
        let response = self.http.head(url).timeout(timeout).send().await?;
        Ok(response.status().as_u16())
    }
}
