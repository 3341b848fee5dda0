//! Tag filters for finding submissions by aggregated tag.
//!
//! A filter matches a persisted `(tag name, value)` row. The tag name is
//! compared case-insensitively and exactly; the value is a case-insensitive
//! substring match.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Filter on aggregated tag rows. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilter {
    pub name: Option<String>,
    pub value: Option<String>,
}

impl TagFilter {
    /// Match rows of one tag, any value.
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            value: None,
        }
    }

    /// Match rows whose value contains `value`, any tag.
    pub fn by_value(value: impl Into<String>) -> Self {
        Self {
            name: None,
            value: Some(value.into()),
        }
    }

    /// Parse a `name,value` query (the part after `tag=`).
    ///
    /// Either side may be empty but the comma is mandatory.
    ///
    /// ```
    /// use patchtag_core::TagFilter;
    ///
    /// let f = TagFilter::parse_query("Acked-by,example.com").unwrap();
    /// assert_eq!(f.name.as_deref(), Some("Acked-by"));
    /// assert_eq!(f.value.as_deref(), Some("example.com"));
    /// assert!(TagFilter::parse_query("Acked-by").is_err());
    /// ```
    pub fn parse_query(query: &str) -> Result<Self> {
        let (name, value) = query.split_once(',').ok_or_else(|| {
            Error::InvalidInput("Query in format `tag=name,value` expected".to_string())
        })?;
        Ok(Self {
            name: non_empty(name),
            value: non_empty(value),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.value.is_none()
    }

    /// Whether a persisted row matches.
    pub fn matches(&self, tag_name: &str, value: &str) -> bool {
        let name_ok = self
            .name
            .as_deref()
            .map_or(true, |n| n.to_lowercase() == tag_name.to_lowercase());
        let value_ok = self
            .value
            .as_deref()
            .map_or(true, |v| value.to_lowercase().contains(&v.to_lowercase()));
        name_ok && value_ok
    }

    /// `LIKE` pattern for the value, with wildcards in the input escaped.
    pub fn value_like_pattern(&self) -> Option<String> {
        self.value.as_deref().map(|v| {
            let escaped = v
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            format!("%{}%", escaped)
        })
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_both() {
        let f = TagFilter::parse_query("Reviewed-by, Alice").unwrap();
        assert_eq!(f.name.as_deref(), Some("Reviewed-by"));
        assert_eq!(f.value.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_parse_query_one_side() {
        assert_eq!(
            TagFilter::parse_query("Acked-by,").unwrap(),
            TagFilter::by_name("Acked-by")
        );
        assert_eq!(
            TagFilter::parse_query(",bob").unwrap(),
            TagFilter::by_value("bob")
        );
        assert!(TagFilter::parse_query(",").unwrap().is_empty());
    }

    #[test]
    fn test_parse_query_malformed() {
        let err = TagFilter::parse_query("Acked-by").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(err.to_string().contains("tag=name,value"));
    }

    #[test]
    fn test_name_is_exact_case_insensitive() {
        let f = TagFilter::by_name("acked-by");
        assert!(f.matches("Acked-by", "x"));
        assert!(!f.matches("Acked-by-too", "x"));
    }

    #[test]
    fn test_value_is_substring_case_insensitive() {
        let f = TagFilter::by_value("EXAMPLE.com");
        assert!(f.matches("Acked-by", "A <a@example.com>"));
        assert!(!f.matches("Acked-by", "A <a@example.org>"));
    }

    #[test]
    fn test_empty_filter_matches_all() {
        assert!(TagFilter::default().matches("Anything", "anything"));
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        let f = TagFilter::by_value("50%_off");
        assert_eq!(f.value_like_pattern().as_deref(), Some("%50\\%\\_off%"));
        assert!(TagFilter::by_name("x").value_like_pattern().is_none());
    }
}
