//! Attributes derived from a single screenshot URL.
//!
//! Everything here is string-pattern based: dimensions come from `WxH` tokens,
//! content identity from sequence/slice/suffix/hash naming. mzstatic-style URLs
//! whose last segment is a rendition (`.../Shot_1.png/392x696bb.png`) are named
//! by the segment before the rendition.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::trace;

static SIZE_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^0-9])(\d{2,5})x(\d{1,5})[a-z]{0,3}").expect("size token regex")
});
static RENDITION_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{2,5}x\d{1,5}[a-z]{0,3}$").expect("rendition regex"));
static VERSION_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[_-](new|orig|retry|thumb|old)(?:[._/-]|$)").expect("version regex")
});
static SEQUENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[^0-9])(\d{1,3})_of_(\d{1,3})(?:[^0-9]|$)").expect("sequence regex")
});
static SLICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)slice[_-]?(\d{1,3})").expect("slice regex"));
static NUMERIC_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^0-9])(\d{1,3})$").expect("suffix regex"));
static UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
        .expect("uuid regex")
});
static HEX_RUN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[^0-9a-z])([0-9a-f]{16,64})(?:[^0-9a-z]|$)").expect("hex regex")
});
static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("digits regex"));

/// Rendition sizes the CDN only ever serves as thumbnails.
pub const THUMBNAIL_SIZE_MARKERS: &[&str] = &["300x0w", "230x0w", "200x0w", "150x150", "100x100"];

const HASH_PREFIX_LEN: usize = 12;
const HIGH_QUALITY_AREA: u64 = 500_000;
const LOW_QUALITY_AREA: u64 = 100_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum VersionMarker {
    New,
    Orig,
    Retry,
    Thumb,
    Old,
}

impl VersionMarker {
    pub const ALL: [VersionMarker; 5] = [
        VersionMarker::New,
        VersionMarker::Orig,
        VersionMarker::Retry,
        VersionMarker::Thumb,
        VersionMarker::Old,
    ];

    fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "new" => Some(Self::New),
            "orig" => Some(Self::Orig),
            "retry" => Some(Self::Retry),
            "thumb" => Some(Self::Thumb),
            "old" => Some(Self::Old),
            _ => None,
        }
    }

    /// Ordering used when two variants of one image compete; higher wins.
    pub fn preference(marker: Option<Self>) -> u8 {
        match marker {
            Some(Self::New) => 4,
            None => 3,
            Some(Self::Orig) | Some(Self::Retry) => 2,
            Some(Self::Old) => 1,
            Some(Self::Thumb) => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum QualityBucket {
    High,
    Low,
    Neither,
}

#[derive(Debug, Clone)]
pub struct ImageRef<'a> {
    pub url: &'a str,
    /// Lowercased file stem of the segment naming the content.
    pub name: String,
    pub extension: Option<String>,
    pub dimensions: Option<(u32, u32)>,
    pub size_token: Option<String>,
    pub version: Option<VersionMarker>,
    pub sequence: Option<(u32, u32)>,
    pub slice: Option<u32>,
    /// Name with size tokens and version markers stripped.
    pub base: String,
}

impl<'a> ImageRef<'a> {
    pub fn parse(url: &'a str) -> Self {
        let path = strip_query(url);
        let segment = content_segment(path);
        let (stem, extension) = split_extension(segment);
        let name = stem.to_lowercase();

        let size = SIZE_TOKEN
            .captures_iter(path)
            .last()
            .and_then(|caps| {
                let w = caps.get(1)?.as_str();
                let h = caps.get(2)?.as_str();
                let dims = (w.parse::<u32>().ok()?, h.parse::<u32>().ok()?);
                Some((dims, format!("{w}x{h}")))
            });
        let (dimensions, size_token) = match size {
            Some((dims, token)) => (Some(dims), Some(token)),
            None => (None, None),
        };

        let version = VERSION_MARKER
            .captures_iter(path)
            .last()
            .and_then(|caps| VersionMarker::from_token(caps.get(1)?.as_str()));

        let sequence = SEQUENCE.captures(stem).and_then(|caps| {
            let k = caps.get(1)?.as_str().parse::<u32>().ok()?;
            let n = caps.get(2)?.as_str().parse::<u32>().ok()?;
            Some((k, n))
        });
        let slice = SLICE
            .captures(stem)
            .and_then(|caps| caps.get(1)?.as_str().parse().ok());

        let base = strip_variant_tokens(&name);

        Self {
            url,
            name,
            extension,
            dimensions,
            size_token,
            version,
            sequence,
            slice,
            base,
        }
    }

    pub fn pixel_area(&self) -> u64 {
        self.dimensions
            .map(|(w, h)| u64::from(w) * u64::from(h))
            .unwrap_or(0)
    }

    pub fn aspect_ratio(&self) -> Option<f64> {
        match self.dimensions {
            Some((w, h)) if w > 0 && h > 0 => Some(f64::from(w) / f64::from(h)),
            _ => None,
        }
    }

    pub fn quality_bucket(&self) -> QualityBucket {
        match self.dimensions {
            None => QualityBucket::Neither,
            Some(_) => {
                let area = self.pixel_area();
                if area > HIGH_QUALITY_AREA {
                    QualityBucket::High
                } else if area < LOW_QUALITY_AREA {
                    QualityBucket::Low
                } else {
                    QualityBucket::Neither
                }
            }
        }
    }

    /// `/image/thumb/` is part of every mzstatic path, so only the content
    /// name is checked for the word.
    pub fn has_thumbnail_marker(&self) -> bool {
        self.version == Some(VersionMarker::Thumb)
            || self.name.contains("thumb")
            || self.has_thumbnail_size()
    }

    pub fn has_thumbnail_size(&self) -> bool {
        let lower = self.url.to_ascii_lowercase();
        THUMBNAIL_SIZE_MARKERS.iter().any(|m| lower.contains(m))
    }

    pub fn numeric_suffix(&self) -> Option<u32> {
        NUMERIC_SUFFIX
            .captures(&self.base)
            .and_then(|caps| caps.get(1)?.as_str().parse().ok())
    }

    pub fn hash_id(&self) -> Option<String> {
        let path = strip_query(self.url);
        let found = UUID
            .find(path)
            .map(|m| m.as_str())
            .or_else(|| HEX_RUN.captures(path).and_then(|c| c.get(1)).map(|m| m.as_str()))?;
        Some(
            found
                .chars()
                .filter(|c| *c != '-')
                .take(HASH_PREFIX_LEN)
                .collect::<String>()
                .to_lowercase(),
        )
    }

    /// Content key under the sequential scheme: the base with its `k` masked,
    /// plus `k`. Two bases sharing an index stay apart.
    pub fn sequence_key(&self) -> Option<String> {
        masked_index(&SEQUENCE, &self.base).map(|(stem, k)| format!("{stem}:{k}"))
    }

    pub fn slice_key(&self) -> Option<String> {
        masked_index(&SLICE, &self.base).map(|(stem, k)| format!("{stem}:{k}"))
    }

    pub fn suffix_key(&self) -> Option<String> {
        masked_index(&NUMERIC_SUFFIX, &self.base).map(|(stem, k)| format!("{stem}:{k}"))
    }

    /// Sequence index, else slice index, else trailing numeric suffix.
    pub fn index(&self) -> Option<u32> {
        self.sequence
            .map(|(k, _)| k)
            .or(self.slice)
            .or_else(|| self.numeric_suffix())
    }

    /// Stripped base with every digit run collapsed, so `ipad_1` and `ipad_2`
    /// share a pattern.
    pub fn base_pattern(&self) -> String {
        DIGITS.replace_all(&self.base, "#").into_owned()
    }

    pub fn is_jpeg(&self) -> bool {
        matches!(self.extension.as_deref(), Some("jpg" | "jpeg"))
    }

    pub fn is_png(&self) -> bool {
        self.extension.as_deref() == Some("png")
    }

    pub fn quality_score(&self) -> f64 {
        let base = (self.pixel_area() as f64 / 100_000.0).min(10.0);
        QUALITY_RULES
            .iter()
            .filter(|rule| (rule.applies)(self))
            .fold(base, |score, rule| {
                trace!(target = "argus.quality", url = self.url, rule = rule.name, weight = rule.weight, "score_rule_applied");
                score + rule.weight
            })
    }
}

/// A named, weighted adjustment applied to the area-based quality score.
pub struct ScoreRule {
    pub name: &'static str,
    pub weight: f64,
    pub applies: fn(&ImageRef<'_>) -> bool,
}

/// Weights reflect observed CDN naming conventions (`_new` re-encodes are the
/// freshest, `_orig`/`_retry` are upload leftovers), not general image quality.
pub const QUALITY_RULES: &[ScoreRule] = &[
    ScoreRule {
        name: "new_variant",
        weight: 5.0,
        applies: |r| r.version == Some(VersionMarker::New),
    },
    ScoreRule {
        name: "orig_or_retry_variant",
        weight: -3.0,
        applies: |r| matches!(r.version, Some(VersionMarker::Orig | VersionMarker::Retry)),
    },
    ScoreRule {
        name: "thumb_variant",
        weight: -5.0,
        applies: |r| r.version == Some(VersionMarker::Thumb),
    },
    ScoreRule {
        name: "jpeg",
        weight: 1.0,
        applies: |r| r.is_jpeg(),
    },
    ScoreRule {
        name: "small_png",
        weight: 2.0,
        applies: |r| r.is_png() && r.pixel_area() < 200_000,
    },
    ScoreRule {
        name: "thumbnail_size",
        weight: -3.0,
        applies: |r| r.has_thumbnail_size(),
    },
];

pub fn strip_query(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

/// Replaces the first capture group of `pattern` in `base` with `#` and
/// returns the masked text with the parsed index.
fn masked_index(pattern: &Regex, base: &str) -> Option<(String, u32)> {
    let digits = pattern.captures(base)?.get(1)?;
    let index = digits.as_str().parse().ok()?;
    let masked = format!("{}#{}", &base[..digits.start()], &base[digits.end()..]);
    Some((masked, index))
}

fn content_segment(path: &str) -> &str {
    let mut segments = path.rsplit('/').filter(|s| !s.is_empty());
    let last = segments.next().unwrap_or(path);
    let (stem, _) = split_extension(last);
    if RENDITION_SEGMENT.is_match(stem)
        && let Some(previous) = segments.next()
        && !previous.contains(':')
    {
        return previous;
    }
    last
}

fn split_extension(segment: &str) -> (&str, Option<String>) {
    match segment.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            (stem, Some(ext.to_ascii_lowercase()))
        }
        _ => (segment, None),
    }
}

fn strip_variant_tokens(name: &str) -> String {
    let kept: Vec<&str> = name
        .split(['_', '-', ' ', '.'])
        .filter(|token| !token.is_empty())
        .filter(|token| VersionMarker::from_token(token).is_none())
        .filter(|token| !matches!(*token, "thumbnail" | "original"))
        .filter(|token| !RENDITION_SEGMENT.is_match(token))
        .collect();
    if kept.is_empty() {
        name.to_string()
    } else {
        kept.join("_")
    }
}

/// Same image name regardless of which size or version variant the URL serves.
pub fn visual_identifier(url: &str) -> String {
    ImageRef::parse(url).base
}

/// Removes `_new`/`_orig`/... markers and a trailing rendition segment so two
/// variants of one upload compare equal.
pub fn strip_version_suffixes(url: &str) -> String {
    let path = strip_query(url);
    let without_rendition = match path.rsplit_once('/') {
        Some((head, last)) if RENDITION_SEGMENT.is_match(split_extension(last).0) => head,
        _ => path,
    };
    VERSION_MARKER
        .replace_all(without_rendition, |caps: &regex::Captures<'_>| {
            let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            whole
                .chars()
                .last()
                .filter(|c| matches!(c, '.' | '_' | '/' | '-'))
                .map(String::from)
                .unwrap_or_default()
        })
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sequence_and_version() {
        let r = ImageRef::parse("https://cdn.example.com/a/2_of_5_new.jpg");
        assert_eq!(r.sequence, Some((2, 5)));
        assert_eq!(r.version, Some(VersionMarker::New));
        assert_eq!(r.base, "2_of_5");
        assert!(r.is_jpeg());
    }

    #[test]
    fn rendition_segment_names_by_parent() {
        let r = ImageRef::parse(
            "https://is1-ssl.mzstatic.com/image/thumb/Purple116/v4/aa/bb/HomeScreen_orig.png/392x696bb.png",
        );
        assert_eq!(r.name, "homescreen_orig");
        assert_eq!(r.base, "homescreen");
        assert_eq!(r.dimensions, Some((392, 696)));
        assert_eq!(r.version, Some(VersionMarker::Orig));
    }

    #[test]
    fn strips_size_and_thumb_tokens_from_base() {
        let a = visual_identifier("https://cdn.example.com/HomeScreen_thumb_300x0w.jpg");
        let b = visual_identifier("https://cdn.example.com/HomeScreen_1242x2688.jpg");
        assert_eq!(a, "homescreen");
        assert_eq!(a, b);
    }

    #[test]
    fn slice_and_suffix_indices() {
        assert_eq!(ImageRef::parse("https://c/x/Slice_3.png").slice, Some(3));
        assert_eq!(ImageRef::parse("https://c/x/screen_07.png").numeric_suffix(), Some(7));
        assert_eq!(ImageRef::parse("https://c/x/screen.png").index(), None);
    }

    #[test]
    fn index_keys_mask_only_the_index() {
        let home = ImageRef::parse("https://c/x/Home_1_640x1136.jpg");
        let map = ImageRef::parse("https://c/x/Map_1_1242x2688.jpg");
        assert_eq!(home.suffix_key().as_deref(), Some("home_#:1"));
        assert_ne!(home.suffix_key(), map.suffix_key());
        let seq = ImageRef::parse("https://c/a/shot_2_of_5_new.jpg");
        assert_eq!(seq.sequence_key().as_deref(), Some("shot_#_of_5:2"));
        let slice = ImageRef::parse("https://c/x/ipad_Slice_3.png");
        assert_eq!(slice.slice_key().as_deref(), Some("ipad_slice_#:3"));
    }

    #[test]
    fn hash_id_prefers_uuid() {
        let r = ImageRef::parse(
            "https://c/image/6f1c2d3e-1111-2222-3333-444455556666/shot.png/600x1200bb.png",
        );
        assert_eq!(r.hash_id().as_deref(), Some("6f1c2d3e1111"));
    }

    #[test]
    fn quality_score_rules() {
        let score = |url: &str| ImageRef::parse(url).quality_score();
        let new = score("https://c/a_1242x2688_new.jpg");
        let orig = score("https://c/a_1242x2688_orig.jpg");
        let thumb = score("https://c/a_300x0w.jpg");
        // 1242*2688/100000 caps at 10, +5 new, +1 jpeg
        assert!((new - 16.0).abs() < 1e-9);
        assert!((orig - 8.0).abs() < 1e-9);
        assert!(thumb < 0.0);
    }

    #[test]
    fn quality_buckets() {
        assert_eq!(ImageRef::parse("https://c/a_1242x2688.png").quality_bucket(), QualityBucket::High);
        assert_eq!(ImageRef::parse("https://c/a_200x300.png").quality_bucket(), QualityBucket::Low);
        assert_eq!(ImageRef::parse("https://c/a.png").quality_bucket(), QualityBucket::Neither);
    }

    #[test]
    fn strip_version_suffixes_collapses_variants() {
        assert_eq!(
            strip_version_suffixes("https://c/x/Shot_new.png/392x696bb.png"),
            strip_version_suffixes("https://c/x/Shot_orig.png/600x1200bb.png"),
        );
    }
}
