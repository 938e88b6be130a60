use crate::http::build_client;
use crate::models::AppRecord;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("no catalog entry for {0}")]
    NotFound(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

/// Primary metadata source for app records.
#[async_trait]
pub trait AppSource: Send + Sync {
    async fn fetch_app_record(&self, subject_id: &str, country: &str)
    -> Result<AppRecord, CatalogError>;
}

#[derive(Debug, Clone)]
pub struct CatalogClient {
    lookup_url: String,
    http: Client,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    results: Vec<LookupEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupEntry {
    track_id: Option<u64>,
    track_name: Option<String>,
    screenshot_urls: Option<Vec<String>>,
    ipad_screenshot_urls: Option<Vec<String>>,
    appletv_screenshot_urls: Option<Vec<String>>,
}

impl From<LookupEntry> for AppRecord {
    fn from(entry: LookupEntry) -> Self {
        AppRecord {
            id: entry.track_id.map(|id| id.to_string()),
            title: entry.track_name,
            screenshots: entry.screenshot_urls,
            ipad_screenshots: entry.ipad_screenshot_urls,
            appletv_screenshots: entry.appletv_screenshot_urls,
        }
    }
}

impl CatalogClient {
    pub fn new(lookup_url: impl Into<String>, http: Client) -> Self {
        Self {
            lookup_url: lookup_url.into().trim_end_matches('/').to_string(),
            http,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn from_env(lookup_url: &str) -> Self {
        Self::new(lookup_url, build_client())
    }

    fn request_url(&self, subject_id: &str, country: &str) -> String {
        format!(
            "{}?id={}&country={}&entity=software",
            self.lookup_url,
            urlencoding::encode(subject_id),
            urlencoding::encode(&country.to_lowercase())
        )
    }
}

#[async_trait]
impl AppSource for CatalogClient {
    async fn fetch_app_record(
        &self,
        subject_id: &str,
        country: &str,
    ) -> Result<AppRecord, CatalogError> {
        let response = self
            .http
            .get(self.request_url(subject_id, country))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(CatalogError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;
        parse_lookup(&body, subject_id)
    }
}

pub fn parse_lookup(body: &str, subject_id: &str) -> Result<AppRecord, CatalogError> {
    let mut payload: LookupResponse =
        serde_json::from_str(body).map_err(|err| CatalogError::Deserialize(err.to_string()))?;
    if payload.results.is_empty() {
        return Err(CatalogError::NotFound(subject_id.to_string()));
    }
    Ok(payload.results.swap_remove(0).into())
}
