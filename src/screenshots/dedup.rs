//! Groups screenshot URLs by the real image they depict and keeps one
//! representative per group.

use crate::models::Platform;
use crate::screenshots::image_ref::{ImageRef, VersionMarker};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NamingScheme {
    Sequential,
    Slice,
    NumericSuffix,
    Hash,
    None,
}

impl NamingScheme {
    /// Detection order doubles as the tie-break order.
    const DETECTABLE: [NamingScheme; 4] = [
        NamingScheme::Sequential,
        NamingScheme::Slice,
        NamingScheme::NumericSuffix,
        NamingScheme::Hash,
    ];

    fn matches(&self, image: &ImageRef<'_>) -> bool {
        match self {
            NamingScheme::Sequential => image.sequence.is_some(),
            NamingScheme::Slice => image.slice.is_some(),
            NamingScheme::NumericSuffix => image.numeric_suffix().is_some(),
            NamingScheme::Hash => image.hash_id().is_some(),
            NamingScheme::None => false,
        }
    }

    fn content_id(&self, image: &ImageRef<'_>) -> String {
        let derived = match self {
            NamingScheme::Sequential => image.sequence_key().map(|key| format!("seq:{key}")),
            NamingScheme::Slice => image.slice_key().map(|key| format!("slice:{key}")),
            NamingScheme::NumericSuffix => image.suffix_key().map(|key| format!("num:{key}")),
            NamingScheme::Hash => image.hash_id().map(|h| format!("hash:{h}")),
            NamingScheme::None => None,
        };
        derived.unwrap_or_else(|| format!("name:{}", image.base))
    }
}

/// A set of URLs believed to show identical content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageGroup {
    pub content_id: String,
    pub members: Vec<String>,
    pub representative: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DedupReport {
    pub scheme: NamingScheme,
    pub groups: Vec<ImageGroup>,
    pub urls: Vec<String>,
}

pub fn detect_scheme(images: &[ImageRef<'_>]) -> NamingScheme {
    let mut best = (NamingScheme::None, 0usize);
    for scheme in NamingScheme::DETECTABLE {
        let hits = images.iter().filter(|image| scheme.matches(image)).count();
        if hits > best.1 {
            best = (scheme, hits);
        }
    }
    best.0
}

pub fn deduplicate(urls: &[String], platform: Platform) -> Vec<String> {
    deduplicate_with_report(urls, platform).urls
}

pub fn deduplicate_with_report(urls: &[String], platform: Platform) -> DedupReport {
    let images: Vec<ImageRef<'_>> = urls.iter().map(|u| ImageRef::parse(u)).collect();
    let scheme = detect_scheme(&images);

    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<&ImageRef<'_>>> = HashMap::new();
    for image in &images {
        let id = scheme.content_id(image);
        let members = grouped.entry(id.clone()).or_default();
        if members.iter().any(|m| m.url == image.url) {
            continue;
        }
        if members.is_empty() {
            order.push(id);
        }
        members.push(image);
    }

    let mut groups: Vec<(Option<u32>, ImageGroup)> = order
        .into_iter()
        .filter_map(|id| {
            let members = grouped.remove(&id)?;
            let best = members
                .iter()
                .copied()
                .max_by(|a, b| compare_representatives(a, b, platform))?;
            let group = ImageGroup {
                content_id: id,
                members: members.iter().map(|m| m.url.to_string()).collect(),
                representative: best.url.to_string(),
            };
            Some((best.index(), group))
        })
        .collect();

    groups.sort_by(|(ia, a), (ib, b)| match (ia, ib) {
        (Some(x), Some(y)) => x.cmp(y).then_with(|| a.representative.cmp(&b.representative)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.representative.cmp(&b.representative),
    });

    let groups: Vec<ImageGroup> = groups.into_iter().map(|(_, g)| g).collect();
    DedupReport {
        scheme,
        urls: groups.iter().map(|g| g.representative.clone()).collect(),
        groups,
    }
}

/// `Greater` means `a` is the better representative. Criteria in priority
/// order: version marker, pixel area, thumbnail markers, (tablet) fewer name
/// tokens, shorter URL, then lexical order so the result is deterministic.
fn compare_representatives(a: &ImageRef<'_>, b: &ImageRef<'_>, platform: Platform) -> Ordering {
    let tokens = |r: &ImageRef<'_>| r.name.split('_').filter(|t| !t.is_empty()).count();
    VersionMarker::preference(a.version)
        .cmp(&VersionMarker::preference(b.version))
        .then_with(|| a.pixel_area().cmp(&b.pixel_area()))
        .then_with(|| b.has_thumbnail_marker().cmp(&a.has_thumbnail_marker()))
        .then_with(|| {
            if platform == Platform::Tablet {
                Reverse(tokens(a)).cmp(&Reverse(tokens(b)))
            } else {
                Ordering::Equal
            }
        })
        .then_with(|| b.url.len().cmp(&a.url.len()))
        .then_with(|| b.url.cmp(a.url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn urls(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn prefers_new_over_orig_and_retry() {
        let input = urls(&[
            "a/2_of_3_orig.jpg",
            "a/1_of_3_retry.jpg",
            "a/1_of_3_new.jpg",
            "a/2_of_3_new.jpg",
            "a/3_of_3_orig.jpg",
        ]);
        let out = deduplicate(&input, Platform::Phone);
        assert_eq!(
            out,
            urls(&["a/1_of_3_new.jpg", "a/2_of_3_new.jpg", "a/3_of_3_orig.jpg"])
        );
    }

    #[test]
    fn thumbnail_variants_collapse_to_largest_full_image() {
        let input = urls(&[
            "https://cdn.example.com/HomeScreen_thumb.jpg",
            "https://cdn.example.com/HomeScreen_300x0w.jpg",
            "https://cdn.example.com/HomeScreen_thumb_300x0w.jpg",
            "https://cdn.example.com/HomeScreen_640x1136.jpg",
            "https://cdn.example.com/HomeScreen_750x1334.jpg",
            "https://cdn.example.com/HomeScreen_1242x2208.jpg",
            "https://cdn.example.com/HomeScreen_1242x2688.jpg",
            "https://cdn.example.com/HomeScreen_230x0w.jpg",
            "https://cdn.example.com/HomeScreen_thumb_640x1136.jpg",
            "https://cdn.example.com/HomeScreen_828x1792.jpg",
        ]);
        let out = deduplicate(&input, Platform::Phone);
        assert_eq!(out, urls(&["https://cdn.example.com/HomeScreen_1242x2688.jpg"]));
    }

    #[test]
    fn one_representative_per_base_name() {
        let input = urls(&[
            "c/Map_640x1136.jpg",
            "c/Home_1242x2688.jpg",
            "c/Home_640x1136.jpg",
            "c/Map_1242x2688.jpg",
            "c/Chat_640x1136.jpg",
        ]);
        let report = deduplicate_with_report(&input, Platform::Phone);
        assert_eq!(report.scheme, NamingScheme::None);
        assert_eq!(
            report.urls,
            urls(&["c/Chat_640x1136.jpg", "c/Home_1242x2688.jpg", "c/Map_1242x2688.jpg"])
        );
        assert_eq!(report.groups.len(), 3);
    }

    #[test]
    fn hash_scheme_groups_renditions_of_one_upload() {
        let input = urls(&[
            "https://is1.mzstatic.com/image/thumb/Purple/v4/0a1b2c3d-aaaa-bbbb-cccc-000000000001/shot.png/392x696bb.png",
            "https://is1.mzstatic.com/image/thumb/Purple/v4/0a1b2c3d-aaaa-bbbb-cccc-000000000001/shot.png/1242x2688bb.png",
            "https://is1.mzstatic.com/image/thumb/Purple/v4/9f8e7d6c-aaaa-bbbb-cccc-000000000002/shot.png/392x696bb.png",
        ]);
        let report = deduplicate_with_report(&input, Platform::Phone);
        assert_eq!(report.scheme, NamingScheme::Hash);
        assert_eq!(report.urls.len(), 2);
        assert!(report.urls.iter().any(|u| u.contains("1242x2688")));
    }

    #[test]
    fn tablet_prefers_fewer_name_tokens() {
        let input = urls(&[
            "https://c/0a1b2c3d-aaaa-bbbb-cccc-000000000001/ipad_pro_shot.png",
            "https://c/0a1b2c3d-aaaa-bbbb-cccc-000000000001/ipadprolargeshot.png",
        ]);
        let tablet = deduplicate_with_report(&input, Platform::Tablet);
        assert_eq!(tablet.scheme, NamingScheme::Hash);
        assert_eq!(tablet.urls, urls(&[input[1].as_str()]));
        // phones fall through to the shorter URL
        assert_eq!(deduplicate(&input, Platform::Phone), urls(&[input[0].as_str()]));
    }

    #[test]
    fn shared_numeric_suffix_keeps_bases_apart() {
        let input = urls(&[
            "c/Home_1_640x1136.jpg",
            "c/Home_1_1242x2688.jpg",
            "c/Map_1_640x1136.jpg",
            "c/Map_1_1242x2688.jpg",
        ]);
        let report = deduplicate_with_report(&input, Platform::Phone);
        assert_eq!(report.scheme, NamingScheme::NumericSuffix);
        assert_eq!(
            report.urls,
            urls(&["c/Home_1_1242x2688.jpg", "c/Map_1_1242x2688.jpg"])
        );
    }

    #[test]
    fn shared_index_keeps_bases_apart_under_positional_schemes() {
        let sequential = urls(&[
            "a/shot_1_of_2_640x1136.jpg",
            "a/shot_1_of_2_1242x2688.jpg",
            "a/promo_1_of_2_640x1136.jpg",
            "a/promo_1_of_2_1242x2688.jpg",
            "a/shot_2_of_2_1242x2688.jpg",
        ]);
        let report = deduplicate_with_report(&sequential, Platform::Phone);
        assert_eq!(report.scheme, NamingScheme::Sequential);
        assert_eq!(
            report.urls,
            urls(&[
                "a/promo_1_of_2_1242x2688.jpg",
                "a/shot_1_of_2_1242x2688.jpg",
                "a/shot_2_of_2_1242x2688.jpg",
            ])
        );

        let slices = urls(&[
            "x/home_slice_0_640x1136.png",
            "x/home_slice_0_1242x2688.png",
            "x/chat_slice_0_1242x2688.png",
            "x/home_slice_1.png",
        ]);
        let report = deduplicate_with_report(&slices, Platform::Tablet);
        assert_eq!(report.scheme, NamingScheme::Slice);
        assert_eq!(
            report.urls,
            urls(&[
                "x/chat_slice_0_1242x2688.png",
                "x/home_slice_0_1242x2688.png",
                "x/home_slice_1.png",
            ])
        );
    }

    #[test]
    fn one_representative_per_stripped_base_under_every_scheme() {
        let cases: [(NamingScheme, Vec<String>); 4] = [
            (
                NamingScheme::Sequential,
                urls(&["s/a_1_of_2_new.jpg", "s/a_1_of_2_orig.jpg", "s/b_1_of_2.jpg", "s/a_2_of_2.jpg"]),
            ),
            (
                NamingScheme::Slice,
                urls(&["s/x_slice_1.png", "s/y_slice_1.png", "s/x_slice_1_thumb.png"]),
            ),
            (
                NamingScheme::NumericSuffix,
                urls(&["s/home_2_300x0w.jpg", "s/home_2_1242x2688.jpg", "s/chat_2.jpg", "s/map_2.jpg"]),
            ),
            (
                NamingScheme::None,
                urls(&["s/Home_640x1136.jpg", "s/Home_1242x2688.jpg", "s/Map_thumb.jpg"]),
            ),
        ];
        for (scheme, input) in cases {
            let report = deduplicate_with_report(&input, Platform::Phone);
            let bases: HashSet<String> = input.iter().map(|u| ImageRef::parse(u).base).collect();
            assert_eq!(report.scheme, scheme, "{input:?}");
            assert_eq!(report.urls.len(), bases.len(), "{input:?}");
            let kept: HashSet<String> = report.urls.iter().map(|u| ImageRef::parse(u).base).collect();
            assert_eq!(kept, bases, "{input:?}");
        }
    }

    #[test]
    fn output_is_pure_function_of_input() {
        let input = urls(&["c/b.png", "c/a.png", "c/c_2.png", "c/c_1.png"]);
        let first = deduplicate(&input, Platform::Phone);
        let second = deduplicate(&input, Platform::Phone);
        assert_eq!(first, second);
        assert_eq!(first, urls(&["c/c_1.png", "c/c_2.png", "c/a.png", "c/b.png"]));
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert!(deduplicate(&[], Platform::Tv).is_empty());
    }
}
