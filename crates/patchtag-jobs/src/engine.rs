//! The tag engine: recompute-on-change and tag queries.
//!
//! Every recompute rebuilds a submission's aggregate from its source texts
//! and hands the full result to the store, which writes only what changed.
//! Recomputes of one submission are serialized by a per-submission lock.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, field::Empty, instrument, Span};

use patchtag_core::logging;
use patchtag_core::{
    extract_lines, Aggregation, ChangeKind, CommentId, EntityRef, Error, ProjectId, Result,
    StoreDelta, Submission, SubmissionId, SubmissionSource, TagAggregator, TagCatalog, TagDetail,
    TagFilter, TagPolicy, TagStore, TagSummary, TextChange,
};
use patchtag_db::Database;

use crate::locks::SubmissionLocks;
use crate::propagation::PropagationResolver;

/// Outcome of handling one text change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeReport {
    /// Submissions recomputed, owning submission first.
    pub recomputed: Vec<SubmissionId>,
    /// Combined store delta over all recomputed submissions.
    pub delta: StoreDelta,
}

/// Recomputes and serves aggregated tags.
#[derive(Clone)]
pub struct TagEngine {
    source: Arc<dyn SubmissionSource>,
    store: Arc<dyn TagStore>,
    policy: TagPolicy,
    resolver: PropagationResolver,
    locks: Arc<SubmissionLocks>,
}

impl TagEngine {
    pub fn new(
        source: Arc<dyn SubmissionSource>,
        store: Arc<dyn TagStore>,
        policy: TagPolicy,
    ) -> Self {
        let resolver = PropagationResolver::new(source.clone(), policy.propagation);
        Self {
            source,
            store,
            policy,
            resolver,
            locks: Arc::new(SubmissionLocks::new()),
        }
    }

    /// Engine over the Postgres repositories.
    pub fn from_database(db: &Database, policy: TagPolicy) -> Self {
        Self::new(
            Arc::new(db.submissions.clone()),
            Arc::new(db.tags.clone()),
            policy,
        )
    }

    pub fn policy(&self) -> TagPolicy {
        self.policy
    }

    pub fn resolver(&self) -> &PropagationResolver {
        &self.resolver
    }

    async fn require_submission(&self, id: SubmissionId) -> Result<Submission> {
        self.source
            .submission(id)
            .await?
            .ok_or(Error::SubmissionNotFound(id))
    }

    /// The active tag catalog of a project.
    pub async fn catalog(&self, project_id: ProjectId) -> Result<TagCatalog> {
        let project = self
            .source
            .project(project_id)
            .await?
            .ok_or(Error::ProjectNotFound(project_id))?;
        let tags = self.source.tags_for_project(project_id).await?;
        TagCatalog::for_project(&project, tags)
    }

    /// Compute a submission's aggregate without persisting it.
    pub async fn compute(&self, submission: &Submission) -> Result<Aggregation> {
        self.compute_excluding(submission, None).await
    }

    /// Compute an aggregate, leaving out the texts of `excluded` if it is
    /// one of the sources.
    async fn compute_excluding(
        &self,
        submission: &Submission,
        excluded: Option<EntityRef>,
    ) -> Result<Aggregation> {
        let catalog = self.catalog(submission.project_id).await?;
        if catalog.is_empty() {
            return Ok(Aggregation::default());
        }

        let mut texts: Vec<Option<String>> = Vec::new();
        for source in self.resolver.sources_for(submission).await? {
            if excluded == Some(EntityRef::Submission { id: source.id }) {
                continue;
            }
            let comments = self.source.comments(source.id).await?;
            texts.push(source.content);
            texts.extend(comments.into_iter().filter_map(|c| {
                let entity = EntityRef::Comment {
                    id: c.id,
                    submission_id: c.submission_id,
                };
                (excluded != Some(entity)).then_some(c.content)
            }));
        }

        let aggregator = TagAggregator::new(&catalog, self.policy.contributor_matching);
        Ok(aggregator.aggregate_texts(texts.iter().map(Option::as_deref)))
    }

    /// Recompute and persist one submission's aggregate.
    ///
    /// Fails with [`Error::SubmissionNotFound`] if the submission does not
    /// exist.
    pub async fn recompute(&self, submission_id: SubmissionId) -> Result<StoreDelta> {
        self.refresh(submission_id, None).await
    }

    #[instrument(
        skip(self),
        fields(
            subsystem = "jobs",
            component = "engine",
            op = "recompute",
            upserted = Empty,
            deleted = Empty
        )
    )]
    async fn refresh(
        &self,
        submission_id: SubmissionId,
        excluded: Option<EntityRef>,
    ) -> Result<StoreDelta> {
        let _guard = self.locks.lock(submission_id).await;
        let submission = self.require_submission(submission_id).await?;
        self.persist(&submission, excluded).await
    }

    async fn persist(
        &self,
        submission: &Submission,
        excluded: Option<EntityRef>,
    ) -> Result<StoreDelta> {
        let aggregation = self.compute_excluding(submission, excluded).await?;
        let tags = aggregation.into_tags();
        let delta = self.store.replace_all(submission.id, &tags).await?;

        let span = Span::current();
        span.record(logging::UPSERTED, delta.upserted);
        span.record(logging::DELETED, delta.deleted);
        debug!(
            submission_id = submission.id,
            tags = tags.len(),
            unchanged = delta.unchanged,
            "Submission recomputed"
        );
        Ok(delta)
    }

    /// Recompute the owner of a deleted entity. A deleted submission has its
    /// rows cleared whether or not it is still readable.
    #[instrument(
        skip(self),
        fields(
            subsystem = "jobs",
            component = "engine",
            op = "clear",
            upserted = Empty,
            deleted = Empty
        )
    )]
    async fn clear(&self, submission_id: SubmissionId, removed: EntityRef) -> Result<StoreDelta> {
        let _guard = self.locks.lock(submission_id).await;
        if removed != (EntityRef::Submission { id: submission_id }) {
            if let Some(submission) = self.source.submission(submission_id).await? {
                return self.persist(&submission, Some(removed)).await;
            }
        }
        let delta = self.store.replace_all(submission_id, &[]).await?;
        Span::current().record(logging::DELETED, delta.deleted);
        Ok(delta)
    }

    /// Handle a text change: recompute the owning submission and every
    /// submission the propagation policy makes stale.
    ///
    /// For a deletion the removed entity's text is left out of every
    /// recompute, so the change may be reported before or after the row is
    /// gone. A submission deleted before the report reaches series members
    /// only through [`TextChange::series_id`].
    ///
    /// Returns once every write has completed. The first failure is returned
    /// to the caller.
    #[instrument(
        skip(self),
        fields(
            subsystem = "jobs",
            component = "engine",
            op = "on_change",
            recomputed = Empty,
            duration_ms = Empty
        )
    )]
    pub async fn on_change(&self, change: TextChange) -> Result<ChangeReport> {
        let start = Instant::now();
        let owner = change.entity.submission_id();
        let removed = change.removed_entity();
        let targets = self.resolver.targets(&change).await?;

        let mut report = ChangeReport::default();
        for target in targets {
            let result = match removed {
                Some(entity) if target == owner => self.clear(target, entity).await,
                _ => self.refresh(target, removed).await,
            };
            match result {
                Ok(delta) => {
                    report.delta += delta;
                    report.recomputed.push(target);
                }
                Err(e) => {
                    error!(
                        submission_id = target,
                        owner,
                        error = %e,
                        "Recompute failed"
                    );
                    return Err(e);
                }
            }
        }

        let span = Span::current();
        span.record(logging::RECOMPUTED, report.recomputed.len());
        span.record(logging::DURATION_MS, start.elapsed().as_millis() as u64);
        Ok(report)
    }

    /// Recompute after a submission's text was edited.
    pub async fn on_text_changed(&self, submission_id: SubmissionId) -> Result<ChangeReport> {
        self.on_change(TextChange::submission(submission_id, ChangeKind::Updated))
            .await
    }

    /// Distinct contributor count per tag.
    pub async fn get_tag_summary(&self, submission_id: SubmissionId) -> Result<TagSummary> {
        self.require_submission(submission_id).await?;
        self.store.summary(submission_id).await
    }

    /// Distinct contributor values per tag.
    pub async fn get_tag_detail(&self, submission_id: SubmissionId) -> Result<TagDetail> {
        self.require_submission(submission_id).await?;
        self.store.detail(submission_id).await
    }

    /// Tags found in a single comment, computed on the fly.
    pub async fn comment_tags(&self, comment_id: CommentId) -> Result<TagDetail> {
        let comment = self
            .source
            .comment(comment_id)
            .await?
            .ok_or(Error::CommentNotFound(comment_id))?;
        let submission = self.require_submission(comment.submission_id).await?;
        let catalog = self.catalog(submission.project_id).await?;
        let aggregator = TagAggregator::new(&catalog, self.policy.contributor_matching);
        Ok(aggregator
            .aggregate_texts(std::iter::once(comment.content.as_deref()))
            .detail())
    }

    /// Tag lines from a submission's comments in comment order, for appending
    /// to an mbox export of the submission.
    pub async fn patch_responses(&self, submission_id: SubmissionId) -> Result<Vec<String>> {
        let submission = self.require_submission(submission_id).await?;
        let catalog = self.catalog(submission.project_id).await?;
        Ok(self
            .source
            .comments(submission_id)
            .await?
            .iter()
            .flat_map(|c| extract_lines(c.content.as_deref(), &catalog))
            .collect())
    }

    /// All submission ids, optionally restricted to one project, ascending.
    pub async fn list_submission_ids(
        &self,
        project_id: Option<ProjectId>,
    ) -> Result<Vec<SubmissionId>> {
        let mut ids = self.source.list_submission_ids(project_id).await?;
        ids.sort_unstable();
        Ok(ids)
    }

    /// Submissions with a persisted tag row matching the filter.
    pub async fn find_submissions(
        &self,
        project_id: Option<ProjectId>,
        filter: &TagFilter,
    ) -> Result<Vec<SubmissionId>> {
        self.store.find_submissions(project_id, filter).await
    }
}
