//! Reviewer tag extraction from message bodies.
//!
//! Extraction is a pure function of a text and a [`TagCatalog`]: it scans
//! every line that starts (at column zero) with a tag pattern followed by
//! `:` and captures the rest of the line as the contributor value.
//!
//! # Rules
//!
//! 1. Tag matching is case-insensitive (`ACKED-BY:` matches `Acked-by`)
//! 2. Lines are matched at column zero only, so quoted (`> Acked-by: ...`)
//!    and indented lines never match
//! 3. Values are trimmed; empty values are dropped
//! 4. Values longer than [`MAX_TAG_VALUE_LEN`] characters are truncated
//! 5. Every occurrence is reported in text order; deduplication is the
//!    aggregator's job
//! 6. Tags with no occurrence are omitted from the result

use std::collections::BTreeMap;

use crate::catalog::TagCatalog;
use crate::defaults::MAX_TAG_VALUE_LEN;

/// Occurrences found in one text, keyed by tag name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMatches {
    by_tag: BTreeMap<String, Vec<String>>,
}

impl TagMatches {
    /// Values found for a tag, in text order. Empty if the tag did not match.
    pub fn get(&self, tag_name: &str) -> &[String] {
        self.by_tag
            .get(tag_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// True when no tag matched at all.
    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    /// Number of tags with at least one occurrence.
    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    /// Total number of occurrences across all tags.
    pub fn occurrences(&self) -> usize {
        self.by_tag.values().map(Vec::len).sum()
    }

    /// Iterate `(tag name, values)` in tag-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.by_tag.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// Extract tag occurrences from a text.
///
/// A missing or empty text yields an empty result.
///
/// # Examples
///
/// ```
/// use patchtag_core::{extract, Tag, TagCatalog};
///
/// let catalog = TagCatalog::compile(vec![Tag::named(1, 1, "Acked-by")]).unwrap();
/// let found = extract(Some("Looks good.\nacked-by: A <a@example.com>\n"), &catalog);
/// assert_eq!(found.get("Acked-by"), ["A <a@example.com>"]);
///
/// let quoted = extract(Some("> Acked-by: A <a@example.com>"), &catalog);
/// assert!(quoted.is_empty());
/// ```
pub fn extract(text: Option<&str>, catalog: &TagCatalog) -> TagMatches {
    let mut matches = TagMatches::default();
    let text = match text {
        Some(t) if !t.is_empty() => t,
        _ => return matches,
    };

    for compiled in catalog.compiled() {
        let values: Vec<String> = compiled
            .matcher()
            .captures_iter(text)
            .filter_map(|caps| caps.name("value"))
            .filter_map(|m| clean_value(m.as_str()))
            .collect();

        if !values.is_empty() {
            matches.by_tag.insert(compiled.tag.name.clone(), values);
        }
    }

    matches
}

/// Collect the full tag lines of a text, in text order.
///
/// Used to carry review responses from comments into an mbox export of the
/// patch. A line matching several tags is reported once.
pub fn extract_lines(text: Option<&str>, catalog: &TagCatalog) -> Vec<String> {
    let text = match text {
        Some(t) if !t.is_empty() => t,
        _ => return Vec::new(),
    };

    let mut found: BTreeMap<usize, String> = BTreeMap::new();
    for compiled in catalog.compiled() {
        for caps in compiled.matcher().captures_iter(text) {
            let has_value = caps
                .name("value")
                .map(|v| !v.as_str().trim().is_empty())
                .unwrap_or(false);
            if let (Some(line), true) = (caps.get(0), has_value) {
                found
                    .entry(line.start())
                    .or_insert_with(|| line.as_str().trim_end().to_string());
            }
        }
    }

    found.into_values().collect()
}

/// Trim a captured value, drop it if empty, and cap its length.
fn clean_value(raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    match value.char_indices().nth(MAX_TAG_VALUE_LEN) {
        Some((cut, _)) => Some(value[..cut].trim_end().to_string()),
        None => Some(value.to_string()),
    }
}
