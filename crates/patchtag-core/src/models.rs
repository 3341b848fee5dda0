//! Domain models for patchtag.
//!
//! Submissions (patches and cover letters), their comments, series, tag
//! definitions, and the aggregated tag state persisted per submission.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Project identifier.
pub type ProjectId = i64;
/// Submission (patch or cover letter) identifier.
pub type SubmissionId = i64;
/// Comment identifier.
pub type CommentId = i64;
/// Series identifier.
pub type SeriesId = i64;
/// Tag definition identifier.
pub type TagId = i64;

/// Per-tag distinct value counts for one submission, keyed by tag name.
pub type TagSummary = BTreeMap<String, usize>;

/// Per-tag distinct value sets for one submission, keyed by tag name.
pub type TagDetail = BTreeMap<String, BTreeSet<String>>;

// =============================================================================
// PROJECTS AND TAGS
// =============================================================================

/// A project: the scope of tags, submissions and series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// When false the project has no active tags and nothing is aggregated.
    pub use_tags: bool,
}

/// A reviewer tag definition, e.g. `Acked-by`.
///
/// `pattern` is a regular expression fragment matched case-insensitively at
/// column zero of a line. A leading `^` and a trailing `:` are optional.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub project_id: ProjectId,
    pub name: String,
    pub pattern: String,
}

impl Tag {
    /// Tag whose pattern is its own name, the common case.
    pub fn named(id: TagId, project_id: ProjectId, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id,
            project_id,
            pattern: regex::escape(&name),
            name,
        }
    }
}

// =============================================================================
// SUBMISSIONS AND COMMENTS
// =============================================================================

/// What kind of submission a message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionKind {
    Patch,
    CoverLetter,
}

impl std::fmt::Display for SubmissionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Patch => write!(f, "patch"),
            Self::CoverLetter => write!(f, "cover_letter"),
        }
    }
}

impl std::str::FromStr for SubmissionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "patch" => Ok(Self::Patch),
            "cover_letter" | "coverletter" | "cover" => Ok(Self::CoverLetter),
            _ => Err(format!("Invalid submission kind: {}", s)),
        }
    }
}

/// A patch or cover letter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub project_id: ProjectId,
    pub kind: SubmissionKind,
    pub msgid: String,
    /// Message body. `None` when the body is missing or could not be decoded.
    pub content: Option<String>,
    /// Value of the `In-Reply-To` header.
    pub in_reply_to: Option<String>,
    /// Message-ids from the `References` header, oldest first.
    pub references: Vec<String>,
    /// Series this submission is linked to, when ingestion already knows it.
    pub series_id: Option<SeriesId>,
    /// Position of a patch within its series (1-based).
    pub number: Option<i32>,
    pub date: DateTime<Utc>,
}

impl Submission {
    pub fn is_patch(&self) -> bool {
        self.kind == SubmissionKind::Patch
    }

    pub fn is_cover_letter(&self) -> bool {
        self.kind == SubmissionKind::CoverLetter
    }

    /// Message-ids this submission points at: `In-Reply-To` first, then
    /// `References` from the most recent ancestor backwards.
    pub fn referenced_msgids(&self) -> impl Iterator<Item = &str> {
        self.in_reply_to
            .as_deref()
            .into_iter()
            .chain(self.references.iter().rev().map(String::as_str))
    }
}

/// A reply attached to exactly one submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub submission_id: SubmissionId,
    pub msgid: String,
    pub content: Option<String>,
    pub date: DateTime<Utc>,
}

/// Split a raw `References`/`In-Reply-To` header value into message-ids.
///
/// ```
/// use patchtag_core::split_msgids;
///
/// let ids = split_msgids("<a@example.com>\n <b@example.com>");
/// assert_eq!(ids, vec!["<a@example.com>", "<b@example.com>"]);
/// ```
pub fn split_msgids(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// SERIES
// =============================================================================

/// An ordered set of patches, optionally preceded by a cover letter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    pub id: SeriesId,
    pub project_id: ProjectId,
    /// Number of patches announced for the series (the N in `[PATCH x/N]`).
    pub total: i32,
    pub cover_letter_id: Option<SubmissionId>,
    /// Set when the patches announced a cover letter that has not arrived.
    pub cover_expected: bool,
    /// Positions of the patches received so far.
    pub patch_numbers: Vec<i32>,
}

impl Series {
    /// Positions in `1..=total` with no patch received yet.
    pub fn missing_numbers(&self) -> Vec<i32> {
        let present: BTreeSet<i32> = self.patch_numbers.iter().copied().collect();
        (1..=self.total).filter(|n| !present.contains(n)).collect()
    }

    /// True once every position `1..=total` is present.
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.missing_numbers().is_empty()
    }
}

// =============================================================================
// ANNOTATABLE ENTITIES AND CHANGES
// =============================================================================

/// Kind of entity whose text can carry tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Submission,
    Comment,
}

/// Stable reference to an entity whose text can carry tags.
///
/// A comment reference carries its owning submission so that changes to a
/// comment that no longer exists (deletions) can still be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityRef {
    Submission {
        id: SubmissionId,
    },
    Comment {
        id: CommentId,
        submission_id: SubmissionId,
    },
}

impl EntityRef {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Submission { .. } => EntityKind::Submission,
            Self::Comment { .. } => EntityKind::Comment,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Self::Submission { id } | Self::Comment { id, .. } => *id,
        }
    }

    /// The submission whose aggregated tags own this entity's text.
    pub fn submission_id(&self) -> SubmissionId {
        match self {
            Self::Submission { id } => *id,
            Self::Comment { submission_id, .. } => *submission_id,
        }
    }
}

/// What happened to an entity's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    /// Creations and deletions change which messages belong to a series.
    pub fn changes_membership(&self) -> bool {
        matches!(self, Self::Created | Self::Deleted)
    }
}

/// A text change reported by the storage layer.
///
/// A `Deleted` change means the entity's text is gone, whether it is reported
/// before or after the row is removed. When it is reported after the
/// submission row is removed, `series_id` carries the series it belonged to
/// so that the rest of the series can still be brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChange {
    pub entity: EntityRef,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_id: Option<SeriesId>,
}

impl TextChange {
    pub fn submission(id: SubmissionId, kind: ChangeKind) -> Self {
        Self {
            entity: EntityRef::Submission { id },
            kind,
            series_id: None,
        }
    }

    pub fn comment(id: CommentId, submission_id: SubmissionId, kind: ChangeKind) -> Self {
        Self {
            entity: EntityRef::Comment { id, submission_id },
            kind,
            series_id: None,
        }
    }

    /// Record the series the owning submission belonged to.
    pub fn in_series(mut self, series_id: Option<SeriesId>) -> Self {
        self.series_id = series_id;
        self
    }

    /// The entity whose text must be left out of recomputes for this change.
    pub fn removed_entity(&self) -> Option<EntityRef> {
        (self.kind == ChangeKind::Deleted).then_some(self.entity)
    }
}

// =============================================================================
// AGGREGATED TAG STATE
// =============================================================================

/// The persisted per-(submission, tag) aggregation result.
///
/// Never constructed empty by the aggregator: a tag without matches has no
/// `AggregatedTag` at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedTag {
    pub tag_id: TagId,
    pub tag_name: String,
    /// Distinct contributor values.
    pub values: BTreeSet<String>,
}

impl AggregatedTag {
    /// Number of distinct contributors.
    pub fn count(&self) -> usize {
        self.values.len()
    }
}

/// Outcome of replacing one submission's persisted tag state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDelta {
    /// Tags written because they were new or their value set changed.
    pub upserted: usize,
    /// Tags removed because they no longer match.
    pub deleted: usize,
    /// Tags whose persisted value set was already correct.
    pub unchanged: usize,
}

impl StoreDelta {
    /// True when nothing was written.
    pub fn is_noop(&self) -> bool {
        self.upserted == 0 && self.deleted == 0
    }
}

impl std::ops::AddAssign for StoreDelta {
    fn add_assign(&mut self, other: Self) {
        self.upserted += other.upserted;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(total: i32, numbers: &[i32]) -> Series {
        Series {
            id: 1,
            project_id: 1,
            total,
            cover_letter_id: None,
            cover_expected: false,
            patch_numbers: numbers.to_vec(),
        }
    }

    #[test]
    fn test_series_complete() {
        assert!(series(3, &[1, 2, 3]).is_complete());
        assert!(series(3, &[3, 1, 2]).is_complete());
    }

    #[test]
    fn test_series_incomplete_reports_missing() {
        let s = series(4, &[1, 3]);
        assert!(!s.is_complete());
        assert_eq!(s.missing_numbers(), vec![2, 4]);
    }

    #[test]
    fn test_empty_series_is_not_complete() {
        assert!(!series(0, &[]).is_complete());
    }

    #[test]
    fn test_submission_kind_round_trip() {
        for kind in [SubmissionKind::Patch, SubmissionKind::CoverLetter] {
            assert_eq!(kind.to_string().parse::<SubmissionKind>().unwrap(), kind);
        }
        assert!("letter".parse::<SubmissionKind>().is_err());
    }

    #[test]
    fn test_entity_ref_routes_to_submission() {
        let comment = EntityRef::Comment {
            id: 9,
            submission_id: 3,
        };
        assert_eq!(comment.kind(), EntityKind::Comment);
        assert_eq!(comment.id(), 9);
        assert_eq!(comment.submission_id(), 3);

        let submission = EntityRef::Submission { id: 3 };
        assert_eq!(submission.submission_id(), 3);
    }

    #[test]
    fn test_membership_changes() {
        assert!(ChangeKind::Created.changes_membership());
        assert!(ChangeKind::Deleted.changes_membership());
        assert!(!ChangeKind::Updated.changes_membership());
    }

    #[test]
    fn test_deleted_change_names_removed_entity() {
        let deleted = TextChange::submission(4, ChangeKind::Deleted).in_series(Some(2));
        assert_eq!(deleted.removed_entity(), Some(EntityRef::Submission { id: 4 }));
        assert_eq!(deleted.series_id, Some(2));
        assert_eq!(
            TextChange::comment(7, 4, ChangeKind::Updated).removed_entity(),
            None
        );
    }

    #[test]
    fn test_text_change_series_hint_is_optional_in_json() {
        let change: TextChange = serde_json::from_str(
            r#"{"entity":{"kind":"comment","id":7,"submission_id":4},"kind":"created"}"#,
        )
        .unwrap();
        assert_eq!(change, TextChange::comment(7, 4, ChangeKind::Created));
        assert!(!serde_json::to_string(&change).unwrap().contains("series_id"));
    }

    #[test]
    fn test_referenced_msgids_order() {
        let sub = Submission {
            id: 1,
            project_id: 1,
            kind: SubmissionKind::Patch,
            msgid: "<p2@x>".into(),
            content: None,
            in_reply_to: Some("<p1@x>".into()),
            references: vec!["<cover@x>".into(), "<p1@x>".into()],
            series_id: None,
            number: Some(2),
            date: Utc::now(),
        };
        let refs: Vec<&str> = sub.referenced_msgids().collect();
        assert_eq!(refs, vec!["<p1@x>", "<p1@x>", "<cover@x>"]);
    }

    #[test]
    fn test_store_delta_accumulates() {
        let mut total = StoreDelta::default();
        total += StoreDelta {
            upserted: 1,
            deleted: 0,
            unchanged: 2,
        };
        total += StoreDelta {
            upserted: 0,
            deleted: 3,
            unchanged: 0,
        };
        assert_eq!(total.upserted, 1);
        assert_eq!(total.deleted, 3);
        assert_eq!(total.unchanged, 2);
        assert!(!total.is_noop());
        assert!(StoreDelta::default().is_noop());
    }

    #[test]
    fn test_tag_named_escapes_pattern() {
        let tag = Tag::named(1, 1, "Fixes (v2)");
        let re = regex::Regex::new(&format!("^{}$", tag.pattern)).unwrap();
        assert!(re.is_match("Fixes (v2)"));
        assert!(!re.is_match("Fixes v2"));
    }
}
