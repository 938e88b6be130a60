//! Structural analysis of a screenshot URL collection.
//!
//! Five detectors summarize how a collection is named (sequence indices, slice
//! indices, resolution tiers, literal size tokens, version markers). The
//! resulting [`PatternAnalysis`] is run through [`DECISION_RULES`], first match
//! wins, to recommend how the smart filter should reduce the collection.

use crate::config::PlatformLimitTable;
use crate::models::Platform;
use crate::screenshots::image_ref::{ImageRef, QualityBucket, VersionMarker};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

const SEQUENCE_COMPLETE_RATIO: f64 = 0.8;
const REDUNDANCY_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    pub found: bool,
    pub coverage: f64,
    pub strength: f64,
}

impl Detection {
    fn weight(&self) -> f64 {
        if self.found {
            self.strength * self.coverage
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SequentialPattern {
    #[serde(flatten)]
    pub detection: Detection,
    pub expected_count: Option<u32>,
    pub distinct_found: usize,
    pub completeness: f64,
    pub complete: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SlicePattern {
    #[serde(flatten)]
    pub detection: Detection,
    pub expected_count: Option<u32>,
    pub distinct_found: usize,
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionTier {
    Thumbnail,
    Standard,
    High,
    Ultra,
}

impl ResolutionTier {
    fn of(area: u64) -> Self {
        match area {
            0..100_000 => Self::Thumbnail,
            100_000..500_000 => Self::Standard,
            500_000..2_000_000 => Self::High,
            _ => Self::Ultra,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QualityTierPattern {
    #[serde(flatten)]
    pub detection: Detection,
    pub tiers: BTreeMap<ResolutionTier, usize>,
    pub redundancy: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SizeVariationPattern {
    #[serde(flatten)]
    pub detection: Detection,
    pub sizes: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VersionVariationPattern {
    #[serde(flatten)]
    pub detection: Detection,
    pub markers: BTreeMap<VersionMarker, usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Sequential,
    Slice,
    QualityTier,
    SizeVariation,
    VersionVariation,
    None,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverallQuality {
    High,
    Low,
    Mixed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityAssessment {
    pub high: usize,
    pub low: usize,
    pub neither: usize,
    pub overall: OverallQuality,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedundancyAssessment {
    pub unique_base_names: usize,
    pub ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternAnalysis {
    pub platform: Platform,
    pub total_count: usize,
    pub sequential: SequentialPattern,
    pub slice: SlicePattern,
    pub quality_tiers: QualityTierPattern,
    pub size_variation: SizeVariationPattern,
    pub version_variation: VersionVariationPattern,
    pub dominant_pattern: PatternKind,
    pub quality: QualityAssessment,
    pub redundancy: RedundancyAssessment,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FilterStrategy {
    RespectSequence,
    RespectSlices,
    DeduplicateAggressive,
    QualityFilter,
    PlatformOptimize,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub action: FilterStrategy,
    pub max_count: usize,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterDecision {
    pub strategy: FilterStrategy,
    pub confidence: f64,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternReport {
    pub analysis: PatternAnalysis,
    pub decision: FilterDecision,
}

/// One row of the strategy decision table. `max_count` returns `None` when
/// the rule does not apply to the analysis.
pub struct DecisionRule {
    pub strategy: FilterStrategy,
    pub confidence: f64,
    pub max_count: fn(&PatternAnalysis, &PlatformLimitTable) -> Option<usize>,
    pub rationale: &'static str,
}

pub const DECISION_RULES: &[DecisionRule] = &[
    DecisionRule {
        strategy: FilterStrategy::RespectSequence,
        confidence: 0.9,
        max_count: |a, _| {
            a.sequential
                .complete
                .then_some(a.sequential.expected_count)
                .flatten()
                .map(|n| n as usize)
        },
        rationale: "complete k_of_N sequence detected",
    },
    DecisionRule {
        strategy: FilterStrategy::RespectSlices,
        confidence: 0.9,
        max_count: |a, _| {
            a.slice
                .complete
                .then_some(a.slice.expected_count)
                .flatten()
                .map(|n| n as usize)
        },
        rationale: "complete slice set detected",
    },
    DecisionRule {
        strategy: FilterStrategy::DeduplicateAggressive,
        confidence: 0.8,
        max_count: |a, _| {
            (a.redundancy.ratio > REDUNDANCY_THRESHOLD).then(|| {
                let scaled = (a.redundancy.unique_base_names as f64 * 0.8).ceil() as usize;
                scaled.max(3)
            })
        },
        rationale: "many URLs share a base name",
    },
    DecisionRule {
        strategy: FilterStrategy::QualityFilter,
        confidence: 0.7,
        max_count: |a, _| {
            (a.quality_tiers.detection.found && a.quality.overall == OverallQuality::Mixed).then(
                || {
                    let kept = a.total_count as f64 * (1.0 - a.quality_tiers.redundancy);
                    (kept.ceil() as usize).max(4)
                },
            )
        },
        rationale: "mixed resolution tiers",
    },
    DecisionRule {
        strategy: FilterStrategy::PlatformOptimize,
        confidence: 0.6,
        max_count: |a, limits| {
            let platform = limits.get(a.platform);
            let mut reasonable = platform.reasonable;
            if a.sequential.complete
                && let Some(n) = a.sequential.expected_count
                && (n as usize) <= reasonable
            {
                reasonable = n as usize;
            }
            (a.total_count > reasonable).then_some(platform.optimal)
        },
        rationale: "more screenshots than the platform comfortably shows",
    },
];

#[derive(Debug, Clone, Default)]
pub struct PatternAnalyzer {
    limits: PlatformLimitTable,
}

impl PatternAnalyzer {
    pub fn new(limits: PlatformLimitTable) -> Self {
        Self { limits }
    }

    pub fn analyze(&self, urls: &[String], platform: Platform) -> PatternReport {
        let analysis = analyze_collection(urls, platform);
        let decision = self.decide(&analysis);
        PatternReport { analysis, decision }
    }

    pub fn decide(&self, analysis: &PatternAnalysis) -> FilterDecision {
        let total = analysis.total_count;
        for rule in DECISION_RULES {
            if let Some(max_count) = (rule.max_count)(analysis, &self.limits) {
                return FilterDecision {
                    strategy: rule.strategy,
                    confidence: rule.confidence,
                    recommendation: Recommendation {
                        action: rule.strategy,
                        max_count: max_count.min(total),
                        rationale: rule.rationale.to_string(),
                    },
                };
            }
        }
        FilterDecision {
            strategy: FilterStrategy::None,
            confidence: 1.0,
            recommendation: Recommendation {
                action: FilterStrategy::None,
                max_count: total,
                rationale: "no reduction needed".to_string(),
            },
        }
    }
}

pub fn analyze_collection(urls: &[String], platform: Platform) -> PatternAnalysis {
    let refs: Vec<ImageRef<'_>> = urls.iter().map(|u| ImageRef::parse(u)).collect();
    let total = refs.len();

    let sequential = detect_sequential(&refs);
    let slice = detect_slices(&refs);
    let quality_tiers = detect_quality_tiers(&refs);
    let size_variation = detect_size_variation(&refs);
    let version_variation = detect_version_variation(&refs);

    let candidates = [
        (PatternKind::Sequential, sequential.detection),
        (PatternKind::Slice, slice.detection),
        (PatternKind::QualityTier, quality_tiers.detection),
        (PatternKind::SizeVariation, size_variation.detection),
        (PatternKind::VersionVariation, version_variation.detection),
    ];
    let dominant_pattern = candidates
        .iter()
        .filter(|(_, d)| d.weight() > 0.0)
        .fold(None::<(PatternKind, f64)>, |best, (kind, d)| match best {
            Some((_, w)) if w >= d.weight() => best,
            _ => Some((*kind, d.weight())),
        })
        .map(|(kind, _)| kind)
        .unwrap_or(PatternKind::None);

    PatternAnalysis {
        platform,
        total_count: total,
        sequential,
        slice,
        quality_tiers,
        size_variation,
        version_variation,
        dominant_pattern,
        quality: assess_quality(&refs),
        redundancy: assess_redundancy(&refs),
    }
}

fn coverage(hits: usize, total: usize) -> f64 {
    if total == 0 { 0.0 } else { hits as f64 / total as f64 }
}

fn detect_sequential(refs: &[ImageRef<'_>]) -> SequentialPattern {
    let hits: Vec<(u32, u32)> = refs.iter().filter_map(|r| r.sequence).collect();
    if hits.is_empty() {
        return SequentialPattern::default();
    }

    // most frequent N; ties go to the larger N
    let mut n_counts: HashMap<u32, usize> = HashMap::new();
    for (_, n) in &hits {
        *n_counts.entry(*n).or_insert(0) += 1;
    }
    let expected = n_counts
        .iter()
        .max_by_key(|(n, count)| (**count, **n))
        .map(|(n, _)| *n)
        .unwrap_or(0);

    let distinct: HashSet<u32> = hits
        .iter()
        .map(|(k, _)| *k)
        .filter(|k| *k >= 1 && *k <= expected)
        .collect();
    let completeness = if expected == 0 {
        0.0
    } else {
        distinct.len() as f64 / expected as f64
    };

    SequentialPattern {
        detection: Detection {
            found: true,
            coverage: coverage(hits.len(), refs.len()),
            strength: completeness,
        },
        expected_count: Some(expected),
        distinct_found: distinct.len(),
        completeness,
        complete: completeness > SEQUENCE_COMPLETE_RATIO,
    }
}

fn detect_slices(refs: &[ImageRef<'_>]) -> SlicePattern {
    let hits: Vec<u32> = refs.iter().filter_map(|r| r.slice).collect();
    let Some(max) = hits.iter().max().copied() else {
        return SlicePattern::default();
    };
    let expected = max + 1;
    let distinct: BTreeSet<u32> = hits.iter().copied().collect();
    SlicePattern {
        detection: Detection {
            found: true,
            coverage: coverage(hits.len(), refs.len()),
            strength: distinct.len() as f64 / expected as f64,
        },
        expected_count: Some(expected),
        distinct_found: distinct.len(),
        complete: distinct.len() == expected as usize,
    }
}

fn detect_quality_tiers(refs: &[ImageRef<'_>]) -> QualityTierPattern {
    let mut tiers: BTreeMap<ResolutionTier, usize> = BTreeMap::new();
    for r in refs.iter().filter(|r| r.dimensions.is_some()) {
        *tiers.entry(ResolutionTier::of(r.pixel_area())).or_insert(0) += 1;
    }
    let sized: usize = tiers.values().sum();
    let largest = tiers.values().max().copied().unwrap_or(0);
    let redundancy = if refs.is_empty() {
        0.0
    } else {
        (refs.len() - largest) as f64 / refs.len() as f64
    };
    let found = tiers.len() > 1;
    QualityTierPattern {
        detection: Detection {
            found,
            coverage: coverage(sized, refs.len()),
            strength: if found { redundancy } else { 0.0 },
        },
        tiers,
        redundancy,
    }
}

fn detect_size_variation(refs: &[ImageRef<'_>]) -> SizeVariationPattern {
    let mut sizes: BTreeMap<String, usize> = BTreeMap::new();
    for token in refs.iter().filter_map(|r| r.size_token.clone()) {
        *sizes.entry(token).or_insert(0) += 1;
    }
    let sized: usize = sizes.values().sum();
    let found = sizes.len() > 1;
    SizeVariationPattern {
        detection: Detection {
            found,
            coverage: coverage(sized, refs.len()),
            strength: if found { 1.0 - 1.0 / sizes.len() as f64 } else { 0.0 },
        },
        sizes,
    }
}

fn detect_version_variation(refs: &[ImageRef<'_>]) -> VersionVariationPattern {
    let mut markers: BTreeMap<VersionMarker, usize> = BTreeMap::new();
    for marker in refs.iter().filter_map(|r| r.version) {
        *markers.entry(marker).or_insert(0) += 1;
    }
    let marked: usize = markers.values().sum();
    VersionVariationPattern {
        detection: Detection {
            found: !markers.is_empty(),
            coverage: coverage(marked, refs.len()),
            strength: markers.len() as f64 / VersionMarker::ALL.len() as f64,
        },
        markers,
    }
}

fn assess_quality(refs: &[ImageRef<'_>]) -> QualityAssessment {
    let (mut high, mut low, mut neither) = (0, 0, 0);
    for r in refs {
        match r.quality_bucket() {
            QualityBucket::High => high += 1,
            QualityBucket::Low => low += 1,
            QualityBucket::Neither => neither += 1,
        }
    }
    let half = refs.len() / 2;
    let overall = if high > half {
        OverallQuality::High
    } else if low > half {
        OverallQuality::Low
    } else {
        OverallQuality::Mixed
    };
    QualityAssessment {
        high,
        low,
        neither,
        overall,
    }
}

fn assess_redundancy(refs: &[ImageRef<'_>]) -> RedundancyAssessment {
    let unique: HashSet<&str> = refs.iter().map(|r| r.base.as_str()).collect();
    let ratio = if refs.is_empty() {
        0.0
    } else {
        1.0 - unique.len() as f64 / refs.len() as f64
    };
    RedundancyAssessment {
        unique_base_names: unique.len(),
        ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn analyzer() -> PatternAnalyzer {
        PatternAnalyzer::default()
    }

    #[test]
    fn complete_sequence_respects_sequence() {
        let input = urls(&[
            "a/1_of_3_new.jpg",
            "a/2_of_3_new.jpg",
            "a/3_of_3_new.jpg",
            "a/1_of_3_orig.jpg",
        ]);
        let report = analyzer().analyze(&input, Platform::Phone);
        assert!(report.analysis.sequential.detection.found);
        assert_eq!(report.analysis.sequential.expected_count, Some(3));
        assert!(report.analysis.sequential.complete);
        assert_eq!(report.decision.strategy, FilterStrategy::RespectSequence);
        assert_eq!(report.decision.recommendation.max_count, 3);
        assert!((report.decision.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn gapped_sequence_is_not_complete() {
        let input = urls(&["a/1_of_5.png", "a/2_of_5.png", "a/5_of_5.png"]);
        let report = analyzer().analyze(&input, Platform::Phone);
        assert!(!report.analysis.sequential.complete);
        assert!((report.analysis.sequential.completeness - 0.6).abs() < 1e-9);
        assert_ne!(report.decision.strategy, FilterStrategy::RespectSequence);
    }

    #[test]
    fn complete_slices_respect_slices() {
        let input = urls(&["x/Slice_0.png", "x/Slice_1.png", "x/Slice_2.png"]);
        let report = analyzer().analyze(&input, Platform::Tablet);
        assert!(report.analysis.slice.complete);
        assert_eq!(report.analysis.slice.expected_count, Some(3));
        assert_eq!(report.decision.strategy, FilterStrategy::RespectSlices);
        assert_eq!(report.decision.recommendation.max_count, 3);
    }

    #[test]
    fn shared_base_names_trigger_aggressive_dedup() {
        let input = urls(&[
            "c/Home_1242x2688.jpg",
            "c/Home_640x1136.jpg",
            "c/Home_300x0w.jpg",
            "c/Map_1242x2688.jpg",
            "c/Map_640x1136.jpg",
        ]);
        let report = analyzer().analyze(&input, Platform::Phone);
        assert_eq!(report.analysis.redundancy.unique_base_names, 2);
        assert_eq!(report.decision.strategy, FilterStrategy::DeduplicateAggressive);
        // max(3, ceil(2 * 0.8)) = 3
        assert_eq!(report.decision.recommendation.max_count, 3);
    }

    #[test]
    fn mixed_tiers_trigger_quality_filter() {
        let input = urls(&[
            "c/a_1242x2688.jpg",
            "c/b_1242x2688.jpg",
            "c/c_200x300.jpg",
            "c/d_200x300.jpg",
            "c/e_400x600.jpg",
            "c/f_400x600.jpg",
        ]);
        let report = analyzer().analyze(&input, Platform::Phone);
        assert!(report.analysis.quality_tiers.detection.found);
        assert_eq!(report.analysis.quality.overall, OverallQuality::Mixed);
        assert_eq!(report.decision.strategy, FilterStrategy::QualityFilter);
        assert_eq!(report.decision.recommendation.max_count, 4);
    }

    #[test]
    fn oversized_collection_is_platform_optimized() {
        let input: Vec<String> = (b'a'..=b'j')
            .map(|c| format!("c/{}.png", c as char))
            .collect();
        let report = analyzer().analyze(&input, Platform::Phone);
        assert_eq!(report.decision.strategy, FilterStrategy::PlatformOptimize);
        assert_eq!(report.decision.recommendation.max_count, 6);

        let tv = analyzer().analyze(&input, Platform::Tv);
        assert_eq!(tv.decision.recommendation.max_count, 4);
    }

    #[test]
    fn partial_sequence_does_not_lower_platform_threshold() {
        let input = urls(&[
            "a/1_of_5.png",
            "a/2_of_5.png",
            "c/x.png",
            "c/y.png",
            "c/z.png",
            "c/w.png",
            "c/v.png",
        ]);
        let report = analyzer().analyze(&input, Platform::Phone);
        assert!(report.analysis.sequential.detection.found);
        assert!(!report.analysis.sequential.complete);
        assert_eq!(report.decision.strategy, FilterStrategy::None);
        assert_eq!(report.decision.recommendation.max_count, 7);
    }

    #[test]
    fn platform_threshold_applies_to_partial_sequences() {
        let mut input: Vec<String> = (1..=2).map(|k| format!("a/{k}_of_5.png")).collect();
        input.extend((0..7).map(|i| format!("c/extra{i}.png")));
        let report = analyzer().analyze(&input, Platform::Phone);
        assert!(!report.analysis.sequential.complete);
        assert_eq!(report.decision.strategy, FilterStrategy::PlatformOptimize);
        assert_eq!(report.decision.recommendation.max_count, 6);
    }

    #[test]
    fn small_clean_collection_needs_nothing() {
        let input = urls(&["c/a.png", "c/b.png", "c/c.png"]);
        let report = analyzer().analyze(&input, Platform::Phone);
        assert_eq!(report.decision.strategy, FilterStrategy::None);
        assert_eq!(report.decision.recommendation.max_count, 3);
        assert_eq!(report.analysis.dominant_pattern, PatternKind::None);
    }

    #[test]
    fn max_count_never_exceeds_total() {
        let input = urls(&["c/Home_640x1136.jpg", "c/Home_300x0w.jpg"]);
        let report = analyzer().analyze(&input, Platform::Phone);
        assert_eq!(report.decision.strategy, FilterStrategy::DeduplicateAggressive);
        assert!(report.decision.recommendation.max_count <= report.analysis.total_count);
    }

    #[test]
    fn version_variation_strength_counts_distinct_markers() {
        let input = urls(&["c/a_new.png", "c/b_orig.png", "c/c.png"]);
        let analysis = analyze_collection(&input, Platform::Phone);
        let v = &analysis.version_variation;
        assert!(v.detection.found);
        assert!((v.detection.strength - 0.4).abs() < 1e-9);
        assert_eq!(analysis.dominant_pattern, PatternKind::VersionVariation);
    }
}
