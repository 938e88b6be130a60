//! Freshness and correctness checks for a resolved screenshot set.
//!
//! Confidence starts at 1.0 and every recorded issue multiplies it by the
//! weight in [`ValidationIssue::multiplier`]. A missing product page zeroes it
//! and stops the remaining checks. Results are cached per
//! `(subject_id, country)` for the configured TTL.

use crate::config::{ValidatorConfig, page_url};
use crate::http::{WebClient, is_reachable};
use crate::models::{Platform, PlatformCollections};
use crate::screenshots::image_ref::visual_identifier;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

static STALE_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:[_/-](?:old|archived|legacy)(?:[._/-]|$))|/(?:19|20)\d{2}/(?:0[1-9]|1[0-2])/")
        .expect("stale marker regex")
});

const VALID_CONFIDENCE: f64 = 0.7;
const FORCE_REFRESH_BELOW: f64 = 0.3;
const DUPLICATE_RATIO_LIMIT: f64 = 0.4;
const REACHABLE_FAIL_BELOW: f64 = 0.5;
const REACHABLE_WARN_BELOW: f64 = 0.8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ValidationIssue {
    AppNotFound,
    StaleScreenshots,
    KnownMismatch,
    ExcessiveDuplicates,
    InaccessibleScreenshots,
    PartiallyInaccessibleScreenshots,
}

impl ValidationIssue {
    pub fn multiplier(&self) -> f64 {
        match self {
            ValidationIssue::AppNotFound => 0.0,
            ValidationIssue::StaleScreenshots => 0.5,
            ValidationIssue::KnownMismatch => 0.2,
            ValidationIssue::ExcessiveDuplicates => 0.6,
            ValidationIssue::InaccessibleScreenshots => 0.3,
            ValidationIssue::PartiallyInaccessibleScreenshots => 0.7,
        }
    }

    /// Remedy for issues that have a dedicated one; the rest need a human.
    fn remedy(&self) -> Option<ValidationRecommendation> {
        match self {
            ValidationIssue::ExcessiveDuplicates => Some(ValidationRecommendation::RerunDeduplication),
            ValidationIssue::KnownMismatch => Some(ValidationRecommendation::ForceWebScraping),
            ValidationIssue::InaccessibleScreenshots
            | ValidationIssue::PartiallyInaccessibleScreenshots => {
                Some(ValidationRecommendation::RefreshScreenshotUrls)
            }
            ValidationIssue::AppNotFound | ValidationIssue::StaleScreenshots => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRecommendation {
    ForceRefresh,
    ClearCache,
    RerunDeduplication,
    ForceWebScraping,
    RefreshScreenshotUrls,
    ManualReview,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub confidence: f64,
    pub issues: BTreeSet<ValidationIssue>,
    pub recommendations: BTreeSet<ValidationRecommendation>,
}

impl ValidationResult {
    fn from_issues(issues: BTreeSet<ValidationIssue>) -> Self {
        let confidence = issues
            .iter()
            .fold(1.0, |acc, issue| acc * issue.multiplier());
        let recommendations = recommend(confidence, &issues);
        Self {
            is_valid: confidence > VALID_CONFIDENCE && issues.is_empty(),
            confidence,
            issues,
            recommendations,
        }
    }
}

fn recommend(
    confidence: f64,
    issues: &BTreeSet<ValidationIssue>,
) -> BTreeSet<ValidationRecommendation> {
    let mut out = BTreeSet::new();
    if confidence < FORCE_REFRESH_BELOW {
        out.insert(ValidationRecommendation::ForceRefresh);
    } else if confidence <= VALID_CONFIDENCE {
        out.insert(ValidationRecommendation::ClearCache);
    }
    let mut unclassified = false;
    for issue in issues {
        match issue.remedy() {
            Some(remedy) => {
                out.insert(remedy);
            }
            None => unclassified = true,
        }
    }
    if unclassified {
        out.insert(ValidationRecommendation::ManualReview);
    }
    out
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

type CacheKey = (String, String);

pub struct ValidationCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<CacheKey, (Instant, ValidationResult)>>,
}

impl ValidationCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn key(subject_id: &str, country: &str) -> CacheKey {
        (subject_id.to_string(), country.to_lowercase())
    }

    fn fresh(&self, stored_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(stored_at) < self.ttl
    }

    pub async fn get(&self, subject_id: &str, country: &str) -> Option<ValidationResult> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        entries
            .get(&Self::key(subject_id, country))
            .filter(|(stored_at, _)| self.fresh(*stored_at, now))
            .map(|(_, result)| result.clone())
    }

    /// Last write wins for racing refreshes of one key.
    pub async fn insert(&self, subject_id: &str, country: &str, result: ValidationResult) {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, (stored_at, _)| self.fresh(*stored_at, now));
        entries.insert(Self::key(subject_id, country), (now, result));
    }

    pub async fn remove(&self, subject_id: &str, country: &str) -> bool {
        self.entries
            .write()
            .await
            .remove(&Self::key(subject_id, country))
            .is_some()
    }

    /// Drops every entry and returns how many were live.
    pub async fn clear(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let live = entries
            .values()
            .filter(|(stored_at, _)| self.fresh(*stored_at, now))
            .count();
        entries.clear();
        live
    }

    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .read()
            .await
            .values()
            .filter(|(stored_at, _)| self.fresh(*stored_at, now))
            .count()
    }
}

pub struct ScreenshotValidator {
    web: Arc<dyn WebClient>,
    cache: ValidationCache,
    config: ValidatorConfig,
}

impl ScreenshotValidator {
    pub fn new(web: Arc<dyn WebClient>, config: ValidatorConfig) -> Self {
        Self::with_clock(web, config, Arc::new(SystemClock))
    }

    pub fn with_clock(web: Arc<dyn WebClient>, config: ValidatorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            web,
            cache: ValidationCache::new(config.ttl, clock),
            config,
        }
    }

    pub fn cache(&self) -> &ValidationCache {
        &self.cache
    }

    pub async fn validate(
        &self,
        collections: &PlatformCollections,
        subject_id: &str,
        country: &str,
    ) -> ValidationResult {
        if let Some(cached) = self.cache.get(subject_id, country).await {
            crate::metrics::cache_lookup(true);
            return cached;
        }
        crate::metrics::cache_lookup(false);

        let result = self.run_checks(collections, subject_id, country).await;
        info!(
            target = "argus.validator",
            subject_id = %subject_id,
            country = %country,
            confidence = result.confidence,
            issues = ?result.issues,
            "screenshots_validated"
        );
        self.cache.insert(subject_id, country, result.clone()).await;
        result
    }

    async fn run_checks(
        &self,
        collections: &PlatformCollections,
        subject_id: &str,
        country: &str,
    ) -> ValidationResult {
        let mut issues = BTreeSet::new();

        let page = page_url(&self.config.page_url_template, subject_id, country);
        let exists = self.web.head_check(&page, self.config.head_timeout).await;
        if !is_reachable(&exists) {
            debug!(target = "argus.validator", page = %page, result = ?exists, "product_page_unreachable");
            issues.insert(ValidationIssue::AppNotFound);
            return ValidationResult::from_issues(issues);
        }

        let all: Vec<&String> = collections.iter().flat_map(|(_, urls)| urls).collect();

        if all.iter().any(|url| STALE_MARKER.is_match(url)) {
            issues.insert(ValidationIssue::StaleScreenshots);
        }

        let forbidden = self.config.known_mismatches.forbidden_for(subject_id);
        if has_forbidden(&all, forbidden) {
            issues.insert(ValidationIssue::KnownMismatch);
        }

        if collections
            .iter()
            .any(|(_, urls)| duplicate_ratio(urls) > DUPLICATE_RATIO_LIMIT)
        {
            issues.insert(ValidationIssue::ExcessiveDuplicates);
        }

        let samples = sample_urls(collections, self.config.sample_size);
        if !samples.is_empty() {
            let checks = samples
                .iter()
                .map(|url| self.web.head_check(url, self.config.head_timeout));
            let results = join_all(checks).await;
            let reachable = results.iter().filter(|r| is_reachable(r)).count();
            let ratio = reachable as f64 / samples.len() as f64;
            if ratio < REACHABLE_FAIL_BELOW {
                issues.insert(ValidationIssue::InaccessibleScreenshots);
            } else if ratio < REACHABLE_WARN_BELOW {
                issues.insert(ValidationIssue::PartiallyInaccessibleScreenshots);
            }
        }

        ValidationResult::from_issues(issues)
    }
}

fn has_forbidden(urls: &[&String], forbidden: &[String]) -> bool {
    if forbidden.is_empty() {
        return false;
    }
    urls.iter().any(|url| {
        let lower = url.to_lowercase();
        forbidden
            .iter()
            .any(|needle| lower.contains(&needle.to_lowercase()))
    })
}

pub fn duplicate_ratio(urls: &[String]) -> f64 {
    if urls.len() < 2 {
        return 0.0;
    }
    let distinct: HashSet<String> = urls.iter().map(|u| visual_identifier(u)).collect();
    1.0 - distinct.len() as f64 / urls.len() as f64
}

/// Round-robin across platforms so each device class gets sampled.
fn sample_urls(collections: &PlatformCollections, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let longest = Platform::ALL
        .iter()
        .map(|p| collections.get(*p).len())
        .max()
        .unwrap_or(0);
    'outer: for i in 0..longest {
        for platform in Platform::ALL {
            if out.len() >= limit {
                break 'outer;
            }
            if let Some(url) = collections.get(platform).get(i) {
                out.push(url.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KnownMismatchTable;
    use crate::screenshots::testing::{FakeWeb, ManualClock, urls};

    const PAGE: &str = "https://apps.apple.com/us/app/id42";

    fn phone(items: &[&str]) -> PlatformCollections {
        PlatformCollections {
            phone: urls(items),
            ..Default::default()
        }
    }

    fn validator(web: Arc<FakeWeb>, config: ValidatorConfig) -> ScreenshotValidator {
        ScreenshotValidator::new(web, config)
    }

    #[tokio::test]
    async fn clean_collection_is_valid() {
        let web = Arc::new(FakeWeb::reachable());
        let v = validator(web.clone(), ValidatorConfig::default());
        let result = v
            .validate(&phone(&["https://c/a.png", "https://c/b.png"]), "42", "us")
            .await;
        assert!(result.is_valid);
        assert!((result.confidence - 1.0).abs() < f64::EPSILON);
        assert!(result.issues.is_empty());
        assert!(result.recommendations.is_empty());
        // page + 2 samples
        assert_eq!(web.head_calls(), 3);
    }

    #[tokio::test]
    async fn missing_page_zeroes_confidence_and_stops() {
        let web = Arc::new(FakeWeb::reachable().with_status(PAGE, 404));
        let v = validator(web.clone(), ValidatorConfig::default());
        let result = v.validate(&phone(&["https://c/a.png"]), "42", "us").await;
        assert_eq!(result.confidence, 0.0);
        assert!(!result.is_valid);
        assert!(result.issues.contains(&ValidationIssue::AppNotFound));
        assert!(result.recommendations.contains(&ValidationRecommendation::ForceRefresh));
        assert!(result.recommendations.contains(&ValidationRecommendation::ManualReview));
        assert_eq!(web.head_calls(), 1);
    }

    #[tokio::test]
    async fn stale_markers_halve_confidence() {
        let web = Arc::new(FakeWeb::reachable());
        let v = validator(web, ValidatorConfig::default());
        let result = v
            .validate(&phone(&["https://c/2019/04/a.png", "https://c/b.png"]), "42", "us")
            .await;
        assert!(result.issues.contains(&ValidationIssue::StaleScreenshots));
        assert!((result.confidence - 0.5).abs() < 1e-9);
        assert!(result.recommendations.contains(&ValidationRecommendation::ClearCache));
        assert!(result.recommendations.contains(&ValidationRecommendation::ManualReview));
    }

    #[tokio::test]
    async fn known_mismatch_is_flagged_from_config() {
        let web = Arc::new(FakeWeb::reachable());
        let config = ValidatorConfig {
            known_mismatches: KnownMismatchTable::new(HashMap::from([(
                "42".to_string(),
                vec!["OtherGame".to_string()],
            )])),
            ..ValidatorConfig::default()
        };
        let v = validator(web, config);
        let result = v
            .validate(&phone(&["https://c/othergame_1.png", "https://c/b.png"]), "42", "us")
            .await;
        assert!(result.issues.contains(&ValidationIssue::KnownMismatch));
        assert!((result.confidence - 0.2).abs() < 1e-9);
        assert!(result.recommendations.contains(&ValidationRecommendation::ForceRefresh));
        assert!(result.recommendations.contains(&ValidationRecommendation::ForceWebScraping));
    }

    #[tokio::test]
    async fn duplicates_and_unreachable_samples_compound() {
        let web = Arc::new(FakeWeb::unreachable().with_status(PAGE, 200));
        let v = validator(web, ValidatorConfig::default());
        let result = v
            .validate(
                &phone(&[
                    "https://c/Home_640x1136.png",
                    "https://c/Home_1242x2688.png",
                    "https://c/Home_300x0w.png",
                ]),
                "42",
                "us",
            )
            .await;
        assert!(result.issues.contains(&ValidationIssue::ExcessiveDuplicates));
        assert!(result.issues.contains(&ValidationIssue::InaccessibleScreenshots));
        assert!((result.confidence - 0.6 * 0.3).abs() < 1e-9);
        assert!(result.recommendations.contains(&ValidationRecommendation::RerunDeduplication));
        assert!(result.recommendations.contains(&ValidationRecommendation::RefreshScreenshotUrls));
        assert!(!result.recommendations.contains(&ValidationRecommendation::ManualReview));
    }

    #[tokio::test]
    async fn partial_reachability_costs_less() {
        let web = Arc::new(
            FakeWeb::reachable()
                .with_status("https://c/b.png", 404),
        );
        let v = validator(web, ValidatorConfig::default());
        let result = v
            .validate(&phone(&["https://c/a.png", "https://c/b.png", "https://c/c.png"]), "42", "us")
            .await;
        assert_eq!(
            result.issues,
            BTreeSet::from([ValidationIssue::PartiallyInaccessibleScreenshots])
        );
        assert!((result.confidence - 0.7).abs() < 1e-9);
        assert!(!result.is_valid);
    }

    #[tokio::test]
    async fn cached_result_skips_reachability_checks() {
        let web = Arc::new(FakeWeb::reachable());
        let v = validator(web.clone(), ValidatorConfig::default());
        let collections = phone(&["https://c/a.png", "https://c/b.png"]);
        let first = v.validate(&collections, "42", "us").await;
        let calls = web.head_calls();
        let second = v.validate(&collections, "42", "US").await;
        assert_eq!(first, second);
        assert_eq!(web.head_calls(), calls);
    }

    #[tokio::test]
    async fn cache_entries_expire_after_ttl() {
        let web = Arc::new(FakeWeb::reachable());
        let clock = Arc::new(ManualClock::new());
        let v = ScreenshotValidator::with_clock(web.clone(), ValidatorConfig::default(), clock.clone());
        let collections = phone(&["https://c/a.png"]);

        v.validate(&collections, "42", "us").await;
        clock.advance(Duration::from_secs(59));
        assert!(v.cache().get("42", "us").await.is_some());
        clock.advance(Duration::from_secs(1));
        assert!(v.cache().get("42", "us").await.is_none());

        let calls = web.head_calls();
        v.validate(&collections, "42", "us").await;
        assert!(web.head_calls() > calls);
    }

    #[tokio::test]
    async fn cache_can_be_cleared() {
        let web = Arc::new(FakeWeb::reachable());
        let v = validator(web, ValidatorConfig::default());
        v.validate(&phone(&["https://c/a.png"]), "42", "us").await;
        v.validate(&phone(&["https://c/a.png"]), "43", "us").await;
        assert_eq!(v.cache().len().await, 2);
        assert!(v.cache().remove("43", "us").await);
        assert_eq!(v.cache().clear().await, 1);
        assert_eq!(v.cache().len().await, 0);
    }

    #[test]
    fn samples_rotate_across_platforms() {
        let collections = PlatformCollections {
            phone: urls(&["p1", "p2", "p3"]),
            tablet: urls(&["t1"]),
            tv: urls(&["v1"]),
        };
        assert_eq!(sample_urls(&collections, 3), urls(&["p1", "t1", "v1"]));
        assert_eq!(sample_urls(&collections, 5), urls(&["p1", "t1", "v1", "p2", "p3"]));
    }
}
