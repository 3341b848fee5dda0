//! Core traits for patchtag backends.
//!
//! The engine only talks to storage through these traits so that the
//! Postgres repositories and the in-process [`crate::memory::MemoryBackend`]
//! are interchangeable.

use async_trait::async_trait;

use crate::error::Result;
use crate::filter::TagFilter;
use crate::models::*;

// =============================================================================
// SOURCE TEXT
// =============================================================================

/// Read access to projects, tag definitions, submissions, comments and series.
#[async_trait]
pub trait SubmissionSource: Send + Sync {
    /// Fetch a project.
    async fn project(&self, id: ProjectId) -> Result<Option<Project>>;

    /// Tag definitions of a project, in catalog order.
    async fn tags_for_project(&self, project_id: ProjectId) -> Result<Vec<Tag>>;

    /// Fetch a submission.
    async fn submission(&self, id: SubmissionId) -> Result<Option<Submission>>;

    /// Comments of a submission in creation order.
    async fn comments(&self, submission_id: SubmissionId) -> Result<Vec<Comment>>;

    /// Fetch a single comment.
    async fn comment(&self, id: CommentId) -> Result<Option<Comment>>;

    /// Fetch a series.
    async fn series(&self, id: SeriesId) -> Result<Option<Series>>;

    /// Patches of a series, ordered by patch number.
    async fn series_patches(&self, series_id: SeriesId) -> Result<Vec<Submission>>;

    /// Series that a message-id is recorded as a reference of.
    async fn series_by_reference(
        &self,
        project_id: ProjectId,
        msgid: &str,
    ) -> Result<Option<SeriesId>>;

    /// Message-ids recorded as references of a series.
    async fn series_reference_msgids(&self, series_id: SeriesId) -> Result<Vec<String>>;

    /// Submission with the given message-id in a project.
    async fn submission_by_msgid(
        &self,
        project_id: ProjectId,
        msgid: &str,
    ) -> Result<Option<Submission>>;

    /// Submissions of a project whose `In-Reply-To` or `References` name
    /// `msgid`, ascending by id.
    async fn submissions_referencing(
        &self,
        project_id: ProjectId,
        msgid: &str,
    ) -> Result<Vec<Submission>>;

    /// All submission ids, optionally restricted to one project, ascending.
    async fn list_submission_ids(
        &self,
        project_id: Option<ProjectId>,
    ) -> Result<Vec<SubmissionId>>;
}

// =============================================================================
// AGGREGATED TAG STATE
// =============================================================================

/// Persistence of aggregated tag state per submission.
#[async_trait]
pub trait TagStore: Send + Sync {
    /// Replace the persisted value set of one (submission, tag) pair.
    async fn upsert(&self, submission_id: SubmissionId, tag: &AggregatedTag) -> Result<()>;

    /// Remove the persisted value set of one (submission, tag) pair.
    async fn delete(&self, submission_id: SubmissionId, tag_id: TagId) -> Result<()>;

    /// Atomically make the persisted state of a submission equal to `tags`.
    ///
    /// Pairs absent from `tags` are deleted. Only pairs whose value set
    /// differs are written.
    async fn replace_all(
        &self,
        submission_id: SubmissionId,
        tags: &[AggregatedTag],
    ) -> Result<StoreDelta>;

    /// Persisted aggregated tags of a submission, ordered by tag name.
    async fn get(&self, submission_id: SubmissionId) -> Result<Vec<AggregatedTag>>;

    /// Distinct value count per tag.
    async fn summary(&self, submission_id: SubmissionId) -> Result<TagSummary> {
        Ok(self
            .get(submission_id)
            .await?
            .into_iter()
            .map(|t| {
                let count = t.count();
                (t.tag_name, count)
            })
            .collect())
    }

    /// Distinct value set per tag.
    async fn detail(&self, submission_id: SubmissionId) -> Result<TagDetail> {
        Ok(self
            .get(submission_id)
            .await?
            .into_iter()
            .map(|t| (t.tag_name, t.values))
            .collect())
    }

    /// Submissions with at least one persisted row matching the filter,
    /// ascending and deduplicated.
    async fn find_submissions(
        &self,
        project_id: Option<ProjectId>,
        filter: &TagFilter,
    ) -> Result<Vec<SubmissionId>>;
}
