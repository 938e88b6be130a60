//! Turns a scraped product page into per-device screenshot candidates.
//!
//! Harvesting is synchronous: `scraper::Html` is not `Send`, so callers fetch
//! the markup first and hand the text over once it is complete.

use crate::config::{ExtractionConfig, PlatformLimitTable, TabletGuard};
use crate::models::{Platform, PlatformCollections};
use crate::screenshots::image_ref::{ImageRef, strip_query, strip_version_suffixes};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::info;

static EMBEDDED_IMAGE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)https?://[^\s"'<>\\),]+?\.(?:png|jpe?g|webp)(?:/[^\s"'<>\\),]*?\.(?:png|jpe?g|webp))?"#)
        .expect("embedded url regex")
});

/// `(selector, attribute, is_srcset)`
const HARVEST_SELECTORS: &[(&str, &str, bool)] = &[
    ("img[src]", "src", false),
    ("img[srcset]", "srcset", true),
    ("source[srcset]", "srcset", true),
    ("meta[content]", "content", false),
];

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];
const EXCLUDED_MARKERS: &[&str] = &["icon", "artwork", "logo", "avatar", "badge"];
const SCREENSHOT_TOKENS: &[&str] = &["screenshot", "screen", "shot", "_of_", "slice", "preview"];

pub struct DeviceRule {
    pub platform: Platform,
    pub marker: &'static str,
    pub weight: f64,
}

/// Substring hints per device class. Size markers are the renditions the
/// store serves for each device family.
pub const DEVICE_RULES: &[DeviceRule] = &[
    DeviceRule { platform: Platform::Phone, marker: "iphone", weight: 3.0 },
    DeviceRule { platform: Platform::Phone, marker: "1242x2688", weight: 1.5 },
    DeviceRule { platform: Platform::Phone, marker: "1290x2796", weight: 1.5 },
    DeviceRule { platform: Platform::Phone, marker: "1284x2778", weight: 1.5 },
    DeviceRule { platform: Platform::Phone, marker: "1242x2208", weight: 1.5 },
    DeviceRule { platform: Platform::Phone, marker: "750x1334", weight: 1.5 },
    DeviceRule { platform: Platform::Phone, marker: "392x696", weight: 1.0 },
    DeviceRule { platform: Platform::Tablet, marker: "ipad", weight: 3.0 },
    DeviceRule { platform: Platform::Tablet, marker: "tablet", weight: 2.0 },
    DeviceRule { platform: Platform::Tablet, marker: "2048x2732", weight: 2.0 },
    DeviceRule { platform: Platform::Tablet, marker: "2732x2048", weight: 2.0 },
    DeviceRule { platform: Platform::Tablet, marker: "1668x2388", weight: 1.5 },
    DeviceRule { platform: Platform::Tablet, marker: "2048x1536", weight: 1.5 },
    DeviceRule { platform: Platform::Tablet, marker: "1536x2048", weight: 1.5 },
    DeviceRule { platform: Platform::Tablet, marker: "576x768", weight: 1.0 },
    DeviceRule { platform: Platform::Tv, marker: "appletv", weight: 3.0 },
    DeviceRule { platform: Platform::Tv, marker: "apple_tv", weight: 3.0 },
    DeviceRule { platform: Platform::Tv, marker: "tvos", weight: 3.0 },
    DeviceRule { platform: Platform::Tv, marker: "3840x2160", weight: 1.5 },
    DeviceRule { platform: Platform::Tv, marker: "1920x1080", weight: 1.5 },
    DeviceRule { platform: Platform::Tv, marker: "800x500", weight: 1.0 },
];

const SEQUENTIAL_BONUS: f64 = 1.0;
const OFFICIAL_BONUS: f64 = 0.5;
const SINGLETON_PENALTY: f64 = -1.0;

/// Tablet-specific hits used by the guard's positive-indicator rule.
const TABLET_INDICATORS: &[(&str, u32)] = &[
    ("ipad", 2),
    ("tablet", 1),
    ("2048x2732", 1),
    ("2732x2048", 1),
    ("1668x2388", 1),
    ("2388x1668", 1),
    ("2048x1536", 1),
    ("1536x2048", 1),
    ("576x768", 1),
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TabletRejection {
    #[error("tablet set spans {0} distinct name patterns")]
    TooManyPatterns(usize),
    #[error("tablet set contains contaminated marker `{0}`")]
    Contaminated(String),
    #[error("only {passed} of {total} tablet candidates carry tablet indicators")]
    WeakIndicators { passed: usize, total: usize },
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub collections: PlatformCollections,
    /// URLs that survived harvesting and candidate filtering.
    pub harvested: usize,
    pub tablet_rejection: Option<TabletRejection>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

struct CandidateGroup<'a> {
    first_seen: usize,
    members: Vec<ImageRef<'a>>,
}

struct Classified<'a> {
    platform: Platform,
    confidence: f64,
    first_seen: usize,
    best: ImageRef<'a>,
}

#[derive(Debug, Clone, Default)]
pub struct PageExtractor {
    config: ExtractionConfig,
    limits: PlatformLimitTable,
}

impl PageExtractor {
    pub fn new(config: ExtractionConfig, limits: PlatformLimitTable) -> Self {
        Self { config, limits }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    pub fn extract(&self, markup: &str) -> Extraction {
        let harvested: Vec<String> = harvest_urls(markup)
            .into_iter()
            .filter(|url| self.is_candidate(url))
            .collect();

        let mut groups: Vec<CandidateGroup<'_>> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();
        for (position, url) in harvested.iter().enumerate() {
            let image = ImageRef::parse(url);
            let key = group_key(&image);
            match by_key.get(&key) {
                Some(&slot) => groups[slot].members.push(image),
                None => {
                    by_key.insert(key, groups.len());
                    groups.push(CandidateGroup {
                        first_seen: position,
                        members: vec![image],
                    });
                }
            }
        }

        let mut per_device: HashMap<Platform, Vec<Classified<'_>>> = HashMap::new();
        for group in groups {
            let Some(classified) = classify(group) else {
                continue;
            };
            per_device.entry(classified.platform).or_default().push(classified);
        }

        let mut extraction = Extraction {
            harvested: harvested.len(),
            ..Extraction::default()
        };

        let rejection = per_device
            .get(&Platform::Tablet)
            .and_then(|tablets| check_tablet_set(tablets, &self.config.tablet_guard));
        if let Some(reason) = rejection {
            let dropped = per_device.remove(&Platform::Tablet).map_or(0, |t| t.len());
            info!(target = "argus.extract", reason = %reason, candidates = dropped, "tablet_set_rejected");
            extraction.tablet_rejection = Some(reason);
        }

        for platform in Platform::ALL {
            let Some(mut candidates) = per_device.remove(&platform) else {
                continue;
            };
            candidates.sort_by(|a, b| {
                b.confidence
                    .total_cmp(&a.confidence)
                    .then_with(|| a.first_seen.cmp(&b.first_seen))
            });
            candidates.truncate(self.limits.get(platform).scrape_cap);
            candidates.sort_by_key(|c| c.first_seen);

            let mut seen = HashSet::new();
            let urls: Vec<String> = candidates
                .iter()
                .filter(|c| seen.insert(strip_version_suffixes(c.best.url)))
                .map(|c| c.best.url.to_string())
                .collect();
            extraction.collections.set(platform, urls);
        }

        extraction
    }

    fn is_candidate(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        if !self
            .config
            .image_hosts
            .iter()
            .any(|allowed| host == allowed || host.ends_with(&format!(".{allowed}")))
        {
            return false;
        }
        let image = ImageRef::parse(url);
        if !image
            .extension
            .as_deref()
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext))
        {
            return false;
        }
        let path = parsed.path().to_ascii_lowercase();
        if EXCLUDED_MARKERS.iter().any(|m| path.contains(m)) {
            return false;
        }
        image.dimensions.is_some() || SCREENSHOT_TOKENS.iter().any(|t| path.contains(t))
    }
}

/// Every image-looking URL in the page, in first-seen order, without duplicates.
pub fn harvest_urls(markup: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |raw: &str| {
        let url = raw.trim().replace("&amp;", "&");
        if url.starts_with("http") && seen.insert(url.clone()) {
            out.push(url);
        }
    };

    let document = Html::parse_document(markup);
    for (selector, attribute, is_srcset) in HARVEST_SELECTORS {
        let Ok(selector) = Selector::parse(selector) else {
            continue;
        };
        for element in document.select(&selector) {
            let Some(value) = element.value().attr(attribute) else {
                continue;
            };
            if *is_srcset {
                for entry in value.split(',') {
                    if let Some(url) = entry.split_whitespace().next() {
                        push(url);
                    }
                }
            } else {
                push(value);
            }
        }
    }

    let unescaped = markup
        .replace("\\/", "/")
        .replace("\\u002F", "/")
        .replace("&amp;", "&");
    for found in EMBEDDED_IMAGE_URL.find_iter(&unescaped) {
        push(found.as_str());
    }
    out
}

fn group_key(image: &ImageRef<'_>) -> String {
    match image.hash_id() {
        Some(hash) => format!("hash:{hash}"),
        None => format!("base:{}", image.base),
    }
}

fn device_scores(url: &str) -> [f64; 3] {
    let lower = strip_query(url).to_ascii_lowercase();
    let mut scores = [0.0; 3];
    for rule in DEVICE_RULES {
        if lower.contains(rule.marker) {
            scores[platform_slot(rule.platform)] += rule.weight;
        }
    }
    scores
}

fn platform_slot(platform: Platform) -> usize {
    match platform {
        Platform::Phone => 0,
        Platform::Tablet => 1,
        Platform::Tv => 2,
    }
}

/// Shape-based guess for groups that carry no device marker at all.
fn platform_by_shape(image: &ImageRef<'_>) -> Platform {
    match image.aspect_ratio() {
        Some(ratio) if ratio > 1.5 => Platform::Tv,
        Some(ratio) if (0.7..=0.8).contains(&ratio) || (1.25..=1.45).contains(&ratio) => {
            Platform::Tablet
        }
        _ => Platform::Phone,
    }
}

fn classify(group: CandidateGroup<'_>) -> Option<Classified<'_>> {
    let mut scores = [0.0f64; 3];
    for member in &group.members {
        for (slot, score) in device_scores(member.url).into_iter().enumerate() {
            scores[slot] = scores[slot].max(score);
        }
    }

    let best = group
        .members
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| {
            a.quality_score()
                .total_cmp(&b.quality_score())
                .then_with(|| ib.cmp(ia))
        })
        .map(|(_, image)| image.clone())?;

    let (platform, marker_score) = Platform::ALL
        .into_iter()
        .map(|p| (p, scores[platform_slot(p)]))
        .fold((None, 0.0), |acc: (Option<Platform>, f64), (p, s)| {
            if s > acc.1 { (Some(p), s) } else { acc }
        });
    let platform = platform.unwrap_or_else(|| platform_by_shape(&best));

    let mut confidence = marker_score;
    if group.members.iter().any(|m| m.sequence.is_some()) {
        confidence += SEQUENTIAL_BONUS;
    }
    if group
        .members
        .iter()
        .any(|m| m.url.to_ascii_lowercase().contains("official"))
    {
        confidence += OFFICIAL_BONUS;
    }
    if group.members.len() == 1 {
        confidence += SINGLETON_PENALTY;
    }

    Some(Classified {
        platform,
        confidence,
        first_seen: group.first_seen,
        best,
    })
}

fn tablet_indicator_score(url: &str) -> u32 {
    let lower = url.to_ascii_lowercase();
    TABLET_INDICATORS
        .iter()
        .filter(|(marker, _)| lower.contains(marker))
        .map(|(_, weight)| weight)
        .sum()
}

fn check_tablet_set(candidates: &[Classified<'_>], guard: &TabletGuard) -> Option<TabletRejection> {
    let patterns: HashSet<String> = candidates.iter().map(|c| c.best.base_pattern()).collect();
    if patterns.len() > guard.max_base_patterns {
        return Some(TabletRejection::TooManyPatterns(patterns.len()));
    }

    for candidate in candidates {
        let lower = candidate.best.url.to_ascii_lowercase();
        if let Some(marker) = guard
            .contaminated_keywords
            .iter()
            .chain(guard.contaminated_identifiers.iter())
            .find(|m| lower.contains(&m.to_ascii_lowercase()))
        {
            return Some(TabletRejection::Contaminated(marker.clone()));
        }
    }

    if candidates.len() > guard.scoring_min_candidates {
        let passed = candidates
            .iter()
            .filter(|c| tablet_indicator_score(c.best.url) >= guard.min_indicator_score)
            .count();
        if (passed as f64) < guard.min_pass_ratio * candidates.len() as f64 {
            return Some(TabletRejection::WeakIndicators {
                passed,
                total: candidates.len(),
            });
        }
    }
    None
}

#[cfg(test)]
pub(crate) mod fixtures {
    pub const CDN: &str = "https://is1-ssl.mzstatic.com/image/thumb/Purple126/v4/aa/bb";

    pub fn shot(name: &str, rendition: &str) -> String {
        format!("{CDN}/{name}.png/{rendition}.png")
    }

    /// A store page carrying two phone shots (two renditions each) and one
    /// tablet shot, plus an icon that must be ignored.
    pub fn store_page() -> String {
        format!(
            r#"<html><head>
<meta property="og:image" content="{icon}">
</head><body>
<picture>
  <source srcset="{p1small} 1x, {p1large} 2x">
  <img src="{p1small}">
</picture>
<img src="{p2small}" srcset="{p2large} 2x">
<img src="{t1}">
<script type="application/json">{{"ipad":"{t1large}"}}</script>
</body></html>"#,
            icon = format!("{CDN}/AppIcon-0-1x_U007emarketing.png/1200x630wa.png"),
            p1small = shot("iphone_1", "392x696bb"),
            p1large = shot("iphone_1", "1242x2688bb"),
            p2small = shot("iphone_2", "392x696bb"),
            p2large = shot("iphone_2", "1242x2688bb"),
            t1 = shot("ipad_1", "576x768bb"),
            t1large = shot("ipad_1", "2048x2732bb").replace('/', "\\/"),
        )
    }
}
