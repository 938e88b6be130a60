//! Executes the strategy recommended by the pattern analyzer.

use crate::models::Platform;
use crate::screenshots::image_ref::ImageRef;
use crate::screenshots::patterns::{FilterDecision, FilterStrategy, PatternAnalyzer, PatternReport};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
pub struct FilterOutcome {
    pub urls: Vec<String>,
    pub report: PatternReport,
}

impl FilterOutcome {
    pub fn decision(&self) -> &FilterDecision {
        &self.report.decision
    }
}

#[derive(Debug, Clone, Default)]
pub struct SmartFilter {
    analyzer: PatternAnalyzer,
}

impl SmartFilter {
    pub fn new(analyzer: PatternAnalyzer) -> Self {
        Self { analyzer }
    }

    pub fn filter(&self, urls: &[String], platform: Platform) -> Vec<String> {
        self.filter_with_report(urls, platform).urls
    }

    pub fn filter_with_report(&self, urls: &[String], platform: Platform) -> FilterOutcome {
        let report = self.analyzer.analyze(urls, platform);
        let max = report.decision.recommendation.max_count;
        let images: Vec<Scored<'_>> = urls
            .iter()
            .enumerate()
            .map(|(position, url)| Scored::new(position, url))
            .collect();

        let urls = match report.decision.strategy {
            FilterStrategy::None => urls.to_vec(),
            FilterStrategy::RespectSequence => {
                let expected = report.analysis.sequential.expected_count.unwrap_or(0);
                rebuild_by_index(&images, 1..=expected, max, |image| {
                    image
                        .image
                        .sequence
                        .filter(|(_, n)| *n == expected)
                        .map(|(k, _)| k)
                })
            }
            FilterStrategy::RespectSlices => {
                let expected = report.analysis.slice.expected_count.unwrap_or(0);
                rebuild_by_index(&images, 0..=expected.saturating_sub(1), max, |image| {
                    image.image.slice
                })
            }
            FilterStrategy::DeduplicateAggressive => dedupe_by_base(&images, max),
            FilterStrategy::QualityFilter => top_by_score(&images, max),
            FilterStrategy::PlatformOptimize => optimize_for_platform(&images, max),
        };

        FilterOutcome { urls, report }
    }
}

struct Scored<'a> {
    position: usize,
    image: ImageRef<'a>,
    score: f64,
}

impl<'a> Scored<'a> {
    fn new(position: usize, url: &'a str) -> Self {
        let image = ImageRef::parse(url);
        let score = image.quality_score();
        Self {
            position,
            image,
            score,
        }
    }
}

/// Highest score wins; earlier position breaks ties.
fn better<'s, 'a>(current: Option<&'s Scored<'a>>, candidate: &'s Scored<'a>) -> &'s Scored<'a> {
    match current {
        Some(existing) if existing.score >= candidate.score => existing,
        _ => candidate,
    }
}

fn in_input_order(mut picked: Vec<&Scored<'_>>) -> Vec<String> {
    picked.sort_by_key(|s| s.position);
    picked.into_iter().map(|s| s.image.url.to_string()).collect()
}

fn rebuild_by_index<F>(
    images: &[Scored<'_>],
    range: std::ops::RangeInclusive<u32>,
    max: usize,
    index_of: F,
) -> Vec<String>
where
    F: Fn(&Scored<'_>) -> Option<u32>,
{
    let mut slots: BTreeMap<u32, &Scored<'_>> = BTreeMap::new();
    for image in images {
        let Some(index) = index_of(image) else {
            continue;
        };
        if !range.contains(&index) {
            continue;
        }
        let chosen = better(slots.get(&index).copied(), image);
        slots.insert(index, chosen);
    }
    slots
        .into_values()
        .take(max)
        .map(|s| s.image.url.to_string())
        .collect()
}

fn dedupe_by_base(images: &[Scored<'_>], max: usize) -> Vec<String> {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, Vec<&Scored<'_>>> = HashMap::new();
    for image in images {
        let members = groups.entry(image.image.base.as_str()).or_default();
        if members.is_empty() {
            order.push(image.image.base.as_str());
        }
        members.push(image);
    }

    let mut ranked: Vec<(f64, &Scored<'_>)> = order
        .iter()
        .filter_map(|base| {
            let members = groups.get(base)?;
            let mean = members.iter().map(|m| m.score).sum::<f64>() / members.len() as f64;
            let best = members
                .iter()
                .copied()
                .fold(None, |acc, m| Some(better(acc, m)))?;
            Some((mean, best))
        })
        .collect();
    // stable: groups with equal means keep first-appearance order
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

    in_input_order(ranked.into_iter().take(max).map(|(_, best)| best).collect())
}

fn top_by_score(images: &[Scored<'_>], max: usize) -> Vec<String> {
    let mut ranked: Vec<&Scored<'_>> = images.iter().collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked.truncate(max);
    in_input_order(ranked)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SimilarityKey {
    /// Aspect ratio in tenths; `None` when no dimensions are present.
    aspect: Option<u32>,
    sequential: bool,
    sliced: bool,
}

impl SimilarityKey {
    fn of(image: &ImageRef<'_>) -> Self {
        Self {
            aspect: image.aspect_ratio().map(|r| (r * 10.0).round() as u32),
            sequential: image.sequence.is_some(),
            sliced: image.slice.is_some(),
        }
    }
}

fn optimize_for_platform(images: &[Scored<'_>], max: usize) -> Vec<String> {
    let mut order: Vec<SimilarityKey> = Vec::new();
    let mut buckets: HashMap<SimilarityKey, Vec<&Scored<'_>>> = HashMap::new();
    for image in images {
        let key = SimilarityKey::of(&image.image);
        let members = buckets.entry(key.clone()).or_default();
        if members.is_empty() {
            order.push(key);
        }
        members.push(image);
    }

    let sizes: Vec<usize> = order.iter().map(|k| buckets[k].len()).collect();
    let quotas = allocate(&sizes, max);

    let mut picked = Vec::new();
    for (key, quota) in order.iter().zip(quotas) {
        let mut members = buckets[key].clone();
        members.sort_by(|a, b| b.score.total_cmp(&a.score));
        picked.extend(members.into_iter().take(quota));
    }
    in_input_order(picked)
}

/// Splits `budget` across buckets proportionally to their sizes, guaranteeing
/// one slot per nonempty bucket when the budget covers every bucket. Leftover
/// slots go to the largest fractional remainders, earlier buckets first.
pub(crate) fn allocate(sizes: &[usize], budget: usize) -> Vec<usize> {
    let total: usize = sizes.iter().sum();
    if total == 0 || budget == 0 {
        return vec![0; sizes.len()];
    }
    let budget = budget.min(total);
    let guarantee = sizes.iter().filter(|s| **s > 0).count() <= budget;

    let mut quotas: Vec<usize> = sizes
        .iter()
        .map(|size| {
            let share = size * budget / total;
            if guarantee && *size > 0 { share.max(1) } else { share }
        })
        .collect();

    // the minimum-one guarantee can overshoot; trim from the largest quotas
    while quotas.iter().sum::<usize>() > budget {
        let Some((i, _)) = quotas
            .iter()
            .enumerate()
            .filter(|(_, q)| **q > 1 || !guarantee)
            .filter(|(_, q)| **q > 0)
            .max_by_key(|(i, q)| (**q, std::cmp::Reverse(*i)))
        else {
            break;
        };
        quotas[i] -= 1;
    }

    let mut remainders: Vec<(usize, usize)> = sizes
        .iter()
        .enumerate()
        .map(|(i, size)| (i, (size * budget) % total))
        .collect();
    remainders.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut assigned: usize = quotas.iter().sum();
    while assigned < budget {
        let mut progressed = false;
        for (i, _) in &remainders {
            if assigned >= budget {
                break;
            }
            if quotas[*i] < sizes[*i] {
                quotas[*i] += 1;
                assigned += 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    quotas
}
