//! Aggregation of tag occurrences across a submission and its comments.
//!
//! The aggregator always recomputes from the source texts; it never patches a
//! previous result. Texts are visited in a fixed order (submission body
//! first, then comments in creation order, then any propagated sources), and
//! for every tag the distinct contributor values are collected.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::catalog::TagCatalog;
use crate::config::ContributorMatching;
use crate::extraction::extract;
use crate::models::{AggregatedTag, TagDetail, TagSummary};

static ANGLE_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<([^<>]*)>").expect("address pattern is valid"));

/// Aggregated tags for one submission, keyed by tag name.
///
/// Only tags with at least one contributor are present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Aggregation {
    tags: BTreeMap<String, AggregatedTag>,
}

impl Aggregation {
    pub fn get(&self, tag_name: &str) -> Option<&AggregatedTag> {
        self.tags.get(tag_name)
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Number of tags present.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Aggregated tags in tag-name order.
    pub fn iter(&self) -> impl Iterator<Item = &AggregatedTag> {
        self.tags.values()
    }

    /// Distinct value count per tag.
    pub fn summary(&self) -> TagSummary {
        self.tags
            .iter()
            .map(|(name, t)| (name.clone(), t.count()))
            .collect()
    }

    /// Distinct value set per tag.
    pub fn detail(&self) -> TagDetail {
        self.tags
            .iter()
            .map(|(name, t)| (name.clone(), t.values.clone()))
            .collect()
    }

    pub fn into_tags(self) -> Vec<AggregatedTag> {
        self.tags.into_values().collect()
    }
}

impl FromIterator<AggregatedTag> for Aggregation {
    fn from_iter<I: IntoIterator<Item = AggregatedTag>>(iter: I) -> Self {
        Self {
            tags: iter
                .into_iter()
                .filter(|t| !t.values.is_empty())
                .map(|t| (t.tag_name.clone(), t))
                .collect(),
        }
    }
}

/// Combines extraction results from many texts into one [`Aggregation`].
#[derive(Debug, Clone, Copy)]
pub struct TagAggregator<'a> {
    catalog: &'a TagCatalog,
    matching: ContributorMatching,
}

impl<'a> TagAggregator<'a> {
    pub fn new(catalog: &'a TagCatalog, matching: ContributorMatching) -> Self {
        Self { catalog, matching }
    }

    /// Aggregate a submission body and its comment bodies (creation order).
    ///
    /// # Examples
    ///
    /// ```
    /// use patchtag_core::{ContributorMatching, Tag, TagAggregator, TagCatalog};
    ///
    /// let catalog = TagCatalog::compile(vec![Tag::named(1, 1, "Acked-by")]).unwrap();
    /// let aggregator = TagAggregator::new(&catalog, ContributorMatching::Exact);
    /// let result = aggregator.aggregate(
    ///     Some(""),
    ///     &[Some("Acked-by: A <a@example.com>"), Some("Acked-by: A <a@example.com>")],
    /// );
    /// assert_eq!(result.get("Acked-by").unwrap().count(), 1);
    /// ```
    pub fn aggregate(
        &self,
        submission_text: Option<&str>,
        comment_texts: &[Option<&str>],
    ) -> Aggregation {
        self.aggregate_texts(std::iter::once(submission_text).chain(comment_texts.iter().copied()))
    }

    /// Aggregate an ordered sequence of texts.
    pub fn aggregate_texts<'t, I>(&self, texts: I) -> Aggregation
    where
        I: IntoIterator<Item = Option<&'t str>>,
    {
        let mut seen: HashMap<String, HashSet<String>> = HashMap::new();
        let mut values: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for text in texts {
            let found = extract(text, self.catalog);
            for (tag_name, occurrences) in found.iter() {
                let keys = seen.entry(tag_name.to_string()).or_default();
                let set = values.entry(tag_name.to_string()).or_default();
                for value in occurrences {
                    if keys.insert(self.dedup_key(value)) {
                        set.insert(value.clone());
                    }
                }
            }
        }

        self.catalog
            .tags()
            .filter_map(|tag| {
                values.remove(&tag.name).map(|values| AggregatedTag {
                    tag_id: tag.id,
                    tag_name: tag.name.clone(),
                    values,
                })
            })
            .collect()
    }

    fn dedup_key(&self, value: &str) -> String {
        match self.matching {
            ContributorMatching::Exact => value.to_string(),
            ContributorMatching::NormalizeEmail => normalize_contributor(value),
        }
    }
}

/// Comparison key for [`ContributorMatching::NormalizeEmail`].
///
/// Collapses whitespace runs and lower-cases the `<address>` part. A bare
/// address (no angle brackets) is lower-cased entirely.
pub fn normalize_contributor(value: &str) -> String {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if ANGLE_ADDRESS.is_match(&collapsed) {
        ANGLE_ADDRESS
            .replace_all(&collapsed, |caps: &regex::Captures<'_>| {
                format!("<{}>", caps[1].to_lowercase())
            })
            .into_owned()
    } else if collapsed.contains('@') && !collapsed.contains(' ') {
        collapsed.to_lowercase()
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tag;

    fn catalog() -> TagCatalog {
        TagCatalog::compile(vec![
            Tag::named(1, 1, "Acked-by"),
            Tag::named(2, 1, "Reviewed-by"),
            Tag::named(3, 1, "Tested-by"),
        ])
        .unwrap()
    }

    #[test]
    fn test_end_to_end_scenario() {
        let catalog = catalog();
        let aggregator = TagAggregator::new(&catalog, ContributorMatching::Exact);
        let result = aggregator.aggregate(
            Some(""),
            &[
                Some("Acked-by: A <a@example.com>\nReviewed-by: B <b@example.com>"),
                Some("Acked-by: A <a@example.com>"),
            ],
        );

        let acked = result.get("Acked-by").unwrap();
        assert_eq!(acked.count(), 1);
        assert_eq!(acked.tag_id, 1);
        assert!(acked.values.contains("A <a@example.com>"));

        let reviewed = result.get("Reviewed-by").unwrap();
        assert_eq!(reviewed.count(), 1);
        assert!(reviewed.values.contains("B <b@example.com>"));

        assert!(result.get("Tested-by").is_none());
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_distinct_contributors_counted_separately() {
        let catalog = catalog();
        let aggregator = TagAggregator::new(&catalog, ContributorMatching::Exact);
        let result = aggregator.aggregate(
            None,
            &[Some("Acked-by: A <a@x>"), Some("Acked-by: B <b@x>")],
        );
        assert_eq!(result.summary().get("Acked-by"), Some(&2));
    }

    #[test]
    fn test_submission_body_counts() {
        let catalog = catalog();
        let aggregator = TagAggregator::new(&catalog, ContributorMatching::Exact);
        let result = aggregator.aggregate(Some("Tested-by: T <t@x>"), &[]);
        assert_eq!(result.summary().get("Tested-by"), Some(&1));
    }

    #[test]
    fn test_no_matches_is_empty_not_zero() {
        let catalog = catalog();
        let aggregator = TagAggregator::new(&catalog, ContributorMatching::Exact);
        let result = aggregator.aggregate(Some("just a patch"), &[Some("thanks"), None]);
        assert!(result.is_empty());
        assert!(result.summary().is_empty());
    }

    #[test]
    fn test_exact_matching_is_case_sensitive() {
        let catalog = catalog();
        let aggregator = TagAggregator::new(&catalog, ContributorMatching::Exact);
        let result = aggregator.aggregate(
            None,
            &[Some("Acked-by: A <A@X.ORG>"), Some("Acked-by: A <a@x.org>")],
        );
        assert_eq!(result.get("Acked-by").unwrap().count(), 2);
    }

    #[test]
    fn test_normalized_matching_collapses_address_case() {
        let catalog = catalog();
        let aggregator = TagAggregator::new(&catalog, ContributorMatching::NormalizeEmail);
        let result = aggregator.aggregate(
            None,
            &[Some("Acked-by: A <A@X.ORG>"), Some("Acked-by: A   <a@x.org>")],
        );
        let acked = result.get("Acked-by").unwrap();
        assert_eq!(acked.count(), 1);
        assert!(acked.values.contains("A <A@X.ORG>"), "first spelling is kept");
    }

    #[test]
    fn test_idempotent() {
        let catalog = catalog();
        let aggregator = TagAggregator::new(&catalog, ContributorMatching::Exact);
        let comments = [
            Some("Acked-by: A <a@x>\nTested-by: C <c@x>"),
            Some("Reviewed-by: B <b@x>"),
        ];
        let first = aggregator.aggregate(Some("body"), &comments);
        let second = aggregator.aggregate(Some("body"), &comments);
        assert_eq!(first, second);
    }

    #[test]
    fn test_detail_matches_summary() {
        let catalog = catalog();
        let aggregator = TagAggregator::new(&catalog, ContributorMatching::Exact);
        let result = aggregator.aggregate(
            None,
            &[Some("Acked-by: A <a@x>\nAcked-by: B <b@x>\nReviewed-by: B <b@x>")],
        );
        let detail = result.detail();
        let summary = result.summary();
        for (name, values) in &detail {
            assert_eq!(summary[name], values.len());
        }
    }

    #[test]
    fn test_normalize_contributor() {
        assert_eq!(normalize_contributor("A  B <X@Y.Org>"), "A B <x@y.org>");
        assert_eq!(normalize_contributor("X@Y.Org"), "x@y.org");
        assert_eq!(normalize_contributor("Some Name"), "Some Name");
    }

    #[test]
    fn test_from_iter_drops_empty() {
        let agg: Aggregation = vec![AggregatedTag {
            tag_id: 1,
            tag_name: "Acked-by".into(),
            values: BTreeSet::new(),
        }]
        .into_iter()
        .collect();
        assert!(agg.is_empty());
    }
}
