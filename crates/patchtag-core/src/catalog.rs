//! Compiled, project-scoped tag definitions.
//!
//! A [`TagCatalog`] is built once per request from the project's active tags
//! and is immutable afterwards. Each tag pattern is compiled into a
//! case-insensitive, multi-line matcher anchored at column zero:
//!
//! ```text
//! ^(?:<pattern>):<one or more horizontal whitespace>(?P<value>.*)$
//! ```
//!
//! Anchoring at column zero is what keeps quoted reply lines (`> Acked-by: ...`)
//! and indented lines from matching.

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use tracing::trace;

use crate::defaults::MAX_TAG_NAME_LEN;
use crate::error::{Error, Result};
use crate::models::{Project, Tag, TagId};

/// A tag together with its compiled line matcher.
#[derive(Debug, Clone)]
pub struct CompiledTag {
    pub tag: Tag,
    matcher: Regex,
}

impl CompiledTag {
    /// The compiled line matcher. The `value` group is the raw value.
    pub fn matcher(&self) -> &Regex {
        &self.matcher
    }
}

/// The active tag set of one project, compiled.
#[derive(Debug, Clone, Default)]
pub struct TagCatalog {
    tags: Vec<CompiledTag>,
}

impl TagCatalog {
    /// A catalog with no tags. Everything extracted against it is empty.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile a catalog from tag definitions, preserving their order.
    ///
    /// Fails with [`Error::InvalidInput`] on an empty or overlong name, a
    /// duplicate name (compared case-insensitively), or a pattern that does
    /// not compile. No partial catalog is ever returned.
    pub fn compile(tags: impl IntoIterator<Item = Tag>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::new();

        for tag in tags {
            validate_tag_name(&tag.name).map_err(Error::InvalidInput)?;
            if !seen.insert(tag.name.to_lowercase()) {
                return Err(Error::InvalidInput(format!(
                    "Duplicate tag name in catalog: {}",
                    tag.name
                )));
            }
            let matcher = build_matcher(&tag.pattern).map_err(|e| {
                Error::InvalidInput(format!("Invalid pattern for tag '{}': {}", tag.name, e))
            })?;
            compiled.push(CompiledTag { tag, matcher });
        }

        trace!(
            subsystem = "tags",
            component = "catalog",
            tag_count = compiled.len(),
            "Compiled tag catalog"
        );
        Ok(Self { tags: compiled })
    }

    /// Compile the active catalog of a project.
    ///
    /// A project with tagging disabled has an empty catalog. Tags belonging to
    /// other projects are ignored.
    pub fn for_project(project: &Project, tags: Vec<Tag>) -> Result<Self> {
        if !project.use_tags {
            return Ok(Self::empty());
        }
        Self::compile(tags.into_iter().filter(|t| t.project_id == project.id))
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Tags in catalog order.
    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.tags.iter().map(|c| &c.tag)
    }

    /// Compiled tags in catalog order.
    pub fn compiled(&self) -> &[CompiledTag] {
        &self.tags
    }

    /// Look up a tag by exact name.
    pub fn get(&self, name: &str) -> Option<&Tag> {
        self.tags().find(|t| t.name == name)
    }

    /// Whether the tag id is part of the active set.
    pub fn contains_id(&self, id: TagId) -> bool {
        self.tags().any(|t| t.id == id)
    }
}

/// Validate a tag name.
///
/// Rules:
/// - Length between 1 and [`MAX_TAG_NAME_LEN`] characters
/// - No whitespace, no `:` (the separator between tag and value)
pub fn validate_tag_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("Tag name cannot be empty".to_string());
    }
    if name.chars().count() > MAX_TAG_NAME_LEN {
        return Err(format!(
            "Tag name must be {} characters or less",
            MAX_TAG_NAME_LEN
        ));
    }
    if name.chars().any(|c| c.is_whitespace() || c == ':') {
        return Err(format!(
            "Tag name '{}' must not contain whitespace or ':'",
            name
        ));
    }
    Ok(())
}

/// Build the line matcher for a tag pattern.
///
/// The pattern may carry a leading `^` and a trailing `:`; both are implied.
fn build_matcher(pattern: &str) -> std::result::Result<Regex, String> {
    let core = pattern.trim();
    let core = core.strip_prefix('^').unwrap_or(core);
    let core = core.strip_suffix(':').unwrap_or(core);
    if core.is_empty() {
        return Err("pattern is empty".to_string());
    }

    // [^\S\n] is horizontal whitespace: the value never spans lines.
    RegexBuilder::new(&format!(r"^(?:{}):[^\S\n]+(?P<value>.*)$", core))
        .case_insensitive(true)
        .multi_line(true)
        .build()
        .map_err(|e| e.to_string())
}
