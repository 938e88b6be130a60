use crate::screenshots::validator::ValidationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Device class a screenshot collection belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[default]
    Phone,
    Tablet,
    Tv,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Phone, Platform::Tablet, Platform::Tv];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Phone => "phone",
            Platform::Tablet => "tablet",
            Platform::Tv => "tv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown platform: {0}")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "phone" | "iphone" => Ok(Platform::Phone),
            "tablet" | "ipad" => Ok(Platform::Tablet),
            "tv" | "appletv" | "apple_tv" => Ok(Platform::Tv),
            _ => Err(UnknownPlatform(input.to_string())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// App record as delivered by the primary metadata source. A `None` platform
/// list means the source did not supply that platform at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "screenshotUrls")]
    pub screenshots: Option<Vec<String>>,
    #[serde(default, alias = "ipadScreenshotUrls")]
    pub ipad_screenshots: Option<Vec<String>>,
    #[serde(default, alias = "appletvScreenshotUrls")]
    pub appletv_screenshots: Option<Vec<String>>,
}

impl AppRecord {
    pub fn platform(&self, platform: Platform) -> Option<&[String]> {
        match platform {
            Platform::Phone => self.screenshots.as_deref(),
            Platform::Tablet => self.ipad_screenshots.as_deref(),
            Platform::Tv => self.appletv_screenshots.as_deref(),
        }
    }

    pub fn set_platform(&mut self, platform: Platform, urls: Vec<String>) {
        match platform {
            Platform::Phone => self.screenshots = Some(urls),
            Platform::Tablet => self.ipad_screenshots = Some(urls),
            Platform::Tv => self.appletv_screenshots = Some(urls),
        }
    }

    /// A platform counts as supplied only when the source returned a nonempty list.
    pub fn has_platform(&self, platform: Platform) -> bool {
        self.platform(platform).is_some_and(|urls| !urls.is_empty())
    }

    pub fn collections(&self) -> PlatformCollections {
        let mut out = PlatformCollections::default();
        for platform in Platform::ALL {
            if let Some(urls) = self.platform(platform) {
                out.set(platform, urls.to_vec());
            }
        }
        out
    }
}

/// One ordered URL list per device class.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlatformCollections {
    #[serde(default)]
    pub phone: Vec<String>,
    #[serde(default)]
    pub tablet: Vec<String>,
    #[serde(default)]
    pub tv: Vec<String>,
}

impl PlatformCollections {
    pub fn get(&self, platform: Platform) -> &[String] {
        match platform {
            Platform::Phone => &self.phone,
            Platform::Tablet => &self.tablet,
            Platform::Tv => &self.tv,
        }
    }

    pub fn set(&mut self, platform: Platform, urls: Vec<String>) {
        match platform {
            Platform::Phone => self.phone = urls,
            Platform::Tablet => self.tablet = urls,
            Platform::Tv => self.tv = urls,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Platform, &[String])> {
        Platform::ALL.into_iter().map(move |p| (p, self.get(p)))
    }

    pub fn total(&self) -> usize {
        self.phone.len() + self.tablet.len() + self.tv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveOptions {
    pub force_refresh: bool,
    pub skip_validation: bool,
    pub max_retries: u32,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            force_refresh: false,
            skip_validation: false,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Primary,
    Scrape,
    Fallback,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub resolution_id: String,
    pub screenshots: Vec<String>,
    pub tablet_screenshots: Vec<String>,
    pub tv_screenshots: Vec<String>,
    pub source: ResultSource,
    pub validation: Option<ValidationResult>,
    pub warning: Option<String>,
    pub error: Option<String>,
    pub attempts: Vec<AttemptReport>,
}

impl ExtractionResult {
    pub fn new(
        resolution_id: impl Into<String>,
        collections: PlatformCollections,
        source: ResultSource,
    ) -> Self {
        Self {
            resolution_id: resolution_id.into(),
            screenshots: collections.phone,
            tablet_screenshots: collections.tablet,
            tv_screenshots: collections.tv,
            source,
            validation: None,
            warning: None,
            error: None,
            attempts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Accepted,
    Skipped,
    NoCandidates,
    Rejected,
    Failed,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AttemptReport {
    pub state: String,
    pub attempt: u32,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub candidates: usize,
    pub confidence: Option<f64>,
    pub error: Option<String>,
}

impl AttemptReport {
    pub fn new(state: &str, attempt: u32, elapsed_ms: u128, outcome: AttemptOutcome) -> Self {
        Self {
            state: state.to_string(),
            attempt,
            elapsed_ms,
            timestamp: Utc::now(),
            outcome,
            candidates: 0,
            confidence: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMode {
    #[default]
    Chain,
    FillMissing,
}

/// Response of the app endpoint; the shape depends on the requested mode.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AppResolution {
    Chain(ExtractionResult),
    FillMissing { record: AppRecord },
}

#[derive(Debug, Deserialize)]
pub struct UrlsRequest {
    pub urls: Vec<String>,
    #[serde(default = "default_platform")]
    pub platform: String,
}

fn default_platform() -> String {
    Platform::Phone.as_str().to_string()
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub subject_id: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default)]
    pub record: AppRecord,
    /// Server defaults apply when omitted.
    #[serde(default)]
    pub options: Option<ResolveOptions>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub subject_id: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(flatten)]
    pub collections: PlatformCollections,
}

pub fn default_country() -> String {
    "us".to_string()
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_record_accepts_lookup_field_names() {
        let record: AppRecord = serde_json::from_value(serde_json::json!({
            "screenshotUrls": ["https://a/1.png"],
            "ipadScreenshotUrls": [],
        }))
        .expect("record");
        assert!(record.has_platform(Platform::Phone));
        assert!(!record.has_platform(Platform::Tablet));
        assert!(record.platform(Platform::Tv).is_none());
    }

    #[test]
    fn app_resolution_is_tagged_by_mode() {
        let value = serde_json::to_value(AppResolution::FillMissing {
            record: AppRecord::default(),
        })
        .expect("json");
        assert_eq!(value["mode"], "fill_missing");
        assert!(value["record"].is_object());
    }

    #[test]
    fn platform_parsing_accepts_device_aliases() {
        assert_eq!(" iPad ".parse::<Platform>(), Ok(Platform::Tablet));
        assert_eq!("appletv".parse::<Platform>(), Ok(Platform::Tv));
        assert_eq!(
            "watch".parse::<Platform>(),
            Err(UnknownPlatform("watch".to_string()))
        );
    }
}
