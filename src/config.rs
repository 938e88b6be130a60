use crate::models::Platform;
use serde::Deserialize;
use std::{collections::HashMap, env, path::Path, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_PAGE_URL_TEMPLATE: &str = "https://apps.apple.com/{country}/app/id{id}";
pub const DEFAULT_LOOKUP_URL: &str = "https://itunes.apple.com/lookup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformLimits {
    /// Collections larger than this get reduced by `platform_optimize`.
    pub reasonable: usize,
    /// Target size for `platform_optimize`.
    pub optimal: usize,
    /// Groups kept per device when harvesting a scraped page.
    pub scrape_cap: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformLimitTable {
    pub phone: PlatformLimits,
    pub tablet: PlatformLimits,
    pub tv: PlatformLimits,
}

impl PlatformLimitTable {
    pub fn get(&self, platform: Platform) -> &PlatformLimits {
        match platform {
            Platform::Phone => &self.phone,
            Platform::Tablet => &self.tablet,
            Platform::Tv => &self.tv,
        }
    }
}

impl Default for PlatformLimitTable {
    fn default() -> Self {
        Self {
            phone: PlatformLimits {
                reasonable: 8,
                optimal: 6,
                scrape_cap: 8,
            },
            tablet: PlatformLimits {
                reasonable: 10,
                optimal: 8,
                scrape_cap: 8,
            },
            tv: PlatformLimits {
                reasonable: 6,
                optimal: 4,
                scrape_cap: 6,
            },
        }
    }
}

/// Thresholds for discarding a scraped tablet set as contaminated. Empirically
/// tuned against observed store pages.
#[derive(Debug, Clone, PartialEq)]
pub struct TabletGuard {
    pub max_base_patterns: usize,
    pub min_pass_ratio: f64,
    pub scoring_min_candidates: usize,
    pub min_indicator_score: u32,
    pub contaminated_keywords: Vec<String>,
    pub contaminated_identifiers: Vec<String>,
}

impl Default for TabletGuard {
    fn default() -> Self {
        Self {
            max_base_patterns: 6,
            min_pass_ratio: 0.7,
            scoring_min_candidates: 8,
            min_indicator_score: 2,
            contaminated_keywords: ["android", "galaxy", "pixel", "samsung", "nexus", "playstore"]
                .into_iter()
                .map(String::from)
                .collect(),
            contaminated_identifiers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub page_url_template: String,
    pub page_timeout: Duration,
    pub image_hosts: Vec<String>,
    pub tablet_guard: TabletGuard,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            page_url_template: DEFAULT_PAGE_URL_TEMPLATE.to_string(),
            page_timeout: Duration::from_secs(10),
            image_hosts: vec!["mzstatic.com".to_string()],
            tablet_guard: TabletGuard::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },
    #[error("invalid known-mismatch table: {0}")]
    Parse(String),
}

/// Subject id -> URL substrings that must never appear in its screenshots.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct KnownMismatchTable {
    entries: HashMap<String, Vec<String>>,
}

impl KnownMismatchTable {
    #[cfg(test)]
    pub fn new(entries: HashMap<String, Vec<String>>) -> Self {
        Self { entries }
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn forbidden_for(&self, subject_id: &str) -> &[String] {
        self.entries
            .get(subject_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub ttl: Duration,
    pub sample_size: usize,
    pub head_timeout: Duration,
    pub page_url_template: String,
    pub known_mismatches: KnownMismatchTable,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            sample_size: 3,
            head_timeout: Duration::from_secs(4),
            page_url_template: DEFAULT_PAGE_URL_TEMPLATE.to_string(),
            known_mismatches: KnownMismatchTable::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub default_max_retries: u32,
    pub backoff_base: Duration,
    pub min_confidence: f64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            backoff_base: Duration::from_millis(1000),
            min_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub limits: PlatformLimitTable,
    pub chain: ChainConfig,
    pub validator: ValidatorConfig,
    pub extraction: ExtractionConfig,
    pub lookup_url: String,
    pub max_input_urls: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            limits: PlatformLimitTable::default(),
            chain: ChainConfig::default(),
            validator: ValidatorConfig::default(),
            extraction: ExtractionConfig::default(),
            lookup_url: DEFAULT_LOOKUP_URL.to_string(),
            max_input_urls: 200,
        }
    }
}

impl ResolverConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let page_url_template = env::var("APP_PAGE_URL_TEMPLATE")
            .ok()
            .filter(|v| v.contains("{id}"))
            .unwrap_or_else(|| DEFAULT_PAGE_URL_TEMPLATE.to_string());

        let mut tablet_guard = TabletGuard {
            max_base_patterns: env_parse(
                "TABLET_MAX_BASE_PATTERNS",
                defaults.extraction.tablet_guard.max_base_patterns,
            ),
            min_pass_ratio: env_parse(
                "TABLET_MIN_PASS_RATIO",
                defaults.extraction.tablet_guard.min_pass_ratio,
            ),
            scoring_min_candidates: env_parse(
                "TABLET_SCORING_MIN_CANDIDATES",
                defaults.extraction.tablet_guard.scoring_min_candidates,
            ),
            ..TabletGuard::default()
        };
        if let Some(keywords) = env_list("TABLET_CONTAMINATED_KEYWORDS") {
            tablet_guard.contaminated_keywords = keywords;
        }
        if let Some(ids) = env_list("TABLET_CONTAMINATED_IDENTIFIERS") {
            tablet_guard.contaminated_identifiers = ids;
        }

        let known_mismatches = match env::var("KNOWN_MISMATCH_PATH") {
            Ok(path) => match KnownMismatchTable::from_path(&path) {
                Ok(table) if table.is_empty() => {
                    warn!(target = "argus.config", path = %path, "known_mismatch_table_empty");
                    table
                }
                Ok(table) => {
                    info!(target = "argus.config", path = %path, subjects = table.len(), "known_mismatch_table_loaded");
                    table
                }
                Err(err) => {
                    warn!(target = "argus.config", path = %path, error = %err, "known_mismatch_table_unreadable");
                    KnownMismatchTable::default()
                }
            },
            Err(_) => KnownMismatchTable::default(),
        };

        Self {
            limits: defaults.limits,
            chain: ChainConfig {
                default_max_retries: env_parse("SCREENSHOT_MAX_RETRIES", 3u32).min(10),
                backoff_base: Duration::from_millis(env_parse("SCREENSHOT_BACKOFF_BASE_MS", 1000u64)),
                min_confidence: env_parse("SCREENSHOT_MIN_CONFIDENCE", 0.5f64).clamp(0.0, 1.0),
            },
            validator: ValidatorConfig {
                ttl: Duration::from_secs(env_parse("VALIDATION_TTL_SECS", 60u64)),
                sample_size: env_parse("VALIDATION_SAMPLE_SIZE", 3usize),
                head_timeout: Duration::from_secs(env_parse("VALIDATION_HEAD_TIMEOUT_SECS", 4u64)),
                page_url_template: page_url_template.clone(),
                known_mismatches,
            },
            extraction: ExtractionConfig {
                page_url_template,
                page_timeout: Duration::from_secs(env_parse("SCRAPE_TIMEOUT_SECS", 10u64)),
                image_hosts: env_list("SCREENSHOT_IMAGE_HOSTS")
                    .unwrap_or(defaults.extraction.image_hosts),
                tablet_guard,
            },
            lookup_url: env::var("APP_LOOKUP_URL").unwrap_or(defaults.lookup_url),
            max_input_urls: env_parse("MAX_INPUT_URLS", defaults.max_input_urls).max(1),
        }
    }
}

/// Public product page for `id` in `country`.
pub fn page_url(template: &str, subject_id: &str, country: &str) -> String {
    template
        .replace("{country}", &urlencoding::encode(&country.to_lowercase()))
        .replace("{id}", &urlencoding::encode(subject_id))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env::var(key)
        .ok()
        .map(|v| {
            v.split([',', ' ', '\n', '\t'])
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
}
