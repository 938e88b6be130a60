//! In-memory collaborators for tests.

use crate::catalog::{AppSource, CatalogError};
use crate::http::{FetchError, WebClient};
use crate::models::AppRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::validator::Clock;

#[derive(Default)]
pub struct FakeWeb {
    pages: Mutex<HashMap<String, Vec<Result<String, FetchError>>>>,
    statuses: Mutex<HashMap<String, u16>>,
    default_status: Option<u16>,
    pub page_calls: AtomicUsize,
    pub head_calls: AtomicUsize,
}

impl FakeWeb {
    /// Every HEAD request answers 200 unless overridden.
    pub fn reachable() -> Self {
        Self {
            default_status: Some(200),
            ..Self::default()
        }
    }

    /// Every HEAD request fails at the transport level unless overridden.
    pub fn unreachable() -> Self {
        Self::default()
    }

    /// Queue page responses; the last one repeats once the queue drains.
    pub fn with_pages(self, url: &str, responses: Vec<Result<String, FetchError>>) -> Self {
        self.pages
            .lock()
            .expect("pages lock")
            .insert(url.to_string(), responses);
        self
    }

    pub fn with_status(self, url: &str, status: u16) -> Self {
        self.statuses
            .lock()
            .expect("status lock")
            .insert(url.to_string(), status);
        self
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn head_calls(&self) -> usize {
        self.head_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebClient for FakeWeb {
    async fn fetch_page(
        &self,
        url: &str,
        _headers: &[(&str, &str)],
        _timeout: Duration,
    ) -> Result<String, FetchError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let mut pages = self.pages.lock().expect("pages lock");
        match pages.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) => queue
                .first()
                .cloned()
                .unwrap_or_else(|| Err(FetchError::Status(404))),
            None => Err(FetchError::Status(404)),
        }
    }

    async fn head_check(&self, url: &str, _timeout: Duration) -> Result<u16, FetchError> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        let statuses = self.statuses.lock().expect("status lock");
        match statuses.get(url).copied().or(self.default_status) {
            Some(status) => Ok(status),
            None => Err(FetchError::Request("connection refused".into())),
        }
    }
}

pub struct FakeSource {
    pub record: Result<AppRecord, CatalogError>,
}

#[async_trait]
impl AppSource for FakeSource {
    async fn fetch_app_record(
        &self,
        _subject_id: &str,
        _country: &str,
    ) -> Result<AppRecord, CatalogError> {
        self.record.clone()
    }
}

pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().expect("clock lock") += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().expect("clock lock")
    }
}

pub fn urls(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
