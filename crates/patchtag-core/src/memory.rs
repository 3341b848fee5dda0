//! In-process backend implementing [`SubmissionSource`] and [`TagStore`].
//!
//! Used by tests and by embedders that keep their submissions in memory.
//! All state lives behind one `tokio::sync::RwLock`, so every
//! `replace_all` is atomic with respect to readers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::filter::TagFilter;
use crate::models::*;
use crate::traits::{SubmissionSource, TagStore};

#[derive(Debug, Default)]
struct State {
    projects: BTreeMap<ProjectId, Project>,
    tags: BTreeMap<TagId, Tag>,
    submissions: BTreeMap<SubmissionId, Submission>,
    comments: BTreeMap<CommentId, Comment>,
    series: BTreeMap<SeriesId, Series>,
    series_refs: HashMap<(ProjectId, String), SeriesId>,
    /// Persisted aggregated tags, keyed by submission then tag.
    aggregated: BTreeMap<SubmissionId, BTreeMap<TagId, AggregatedTag>>,
}

impl State {
    fn series_view(&self, series: &Series) -> Series {
        let mut view = series.clone();
        let members = self
            .submissions
            .values()
            .filter(|s| s.series_id == Some(series.id));
        let mut numbers = Vec::new();
        for s in members {
            match s.kind {
                SubmissionKind::Patch => numbers.extend(s.number),
                SubmissionKind::CoverLetter => {
                    if view.cover_letter_id.is_none() {
                        view.cover_letter_id = Some(s.id);
                    }
                }
            }
        }
        numbers.sort_unstable();
        numbers.dedup();
        view.patch_numbers = numbers;
        view
    }
}

/// Shared in-memory storage.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<State>,
    writes: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of row-level writes (upserts and deletes) performed so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Mutation of source data
    // -------------------------------------------------------------------------

    pub async fn insert_project(&self, project: Project) {
        self.state.write().await.projects.insert(project.id, project);
    }

    /// Enable or disable tagging for a project.
    pub async fn set_use_tags(&self, project_id: ProjectId, use_tags: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let project = state
            .projects
            .get_mut(&project_id)
            .ok_or(Error::ProjectNotFound(project_id))?;
        project.use_tags = use_tags;
        Ok(())
    }

    pub async fn insert_tag(&self, tag: Tag) {
        self.state.write().await.tags.insert(tag.id, tag);
    }

    /// Remove a tag definition. Persisted rows stay until the next recompute.
    pub async fn remove_tag(&self, id: TagId) -> Option<Tag> {
        self.state.write().await.tags.remove(&id)
    }

    pub async fn insert_submission(&self, submission: Submission) {
        self.state
            .write()
            .await
            .submissions
            .insert(submission.id, submission);
    }

    pub async fn update_submission_content(
        &self,
        id: SubmissionId,
        content: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let submission = state
            .submissions
            .get_mut(&id)
            .ok_or(Error::SubmissionNotFound(id))?;
        submission.content = content;
        Ok(())
    }

    /// Remove a submission together with its comments and aggregated rows.
    pub async fn remove_submission(&self, id: SubmissionId) -> Option<Submission> {
        let mut state = self.state.write().await;
        state.comments.retain(|_, c| c.submission_id != id);
        if let Some(rows) = state.aggregated.remove(&id) {
            self.writes.fetch_add(rows.len() as u64, Ordering::SeqCst);
        }
        state.submissions.remove(&id)
    }

    pub async fn insert_comment(&self, comment: Comment) {
        self.state.write().await.comments.insert(comment.id, comment);
    }

    pub async fn update_comment_content(
        &self,
        id: CommentId,
        content: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let comment = state
            .comments
            .get_mut(&id)
            .ok_or(Error::CommentNotFound(id))?;
        comment.content = content;
        Ok(())
    }

    pub async fn remove_comment(&self, id: CommentId) -> Option<Comment> {
        self.state.write().await.comments.remove(&id)
    }

    /// Insert a series. `cover_letter_id` and `patch_numbers` are derived
    /// from member submissions when read back.
    pub async fn insert_series(&self, series: Series) {
        self.state.write().await.series.insert(series.id, series);
    }

    /// Record that a message-id belongs to a series.
    pub async fn add_series_reference(
        &self,
        project_id: ProjectId,
        msgid: impl Into<String>,
        series_id: SeriesId,
    ) {
        self.state
            .write()
            .await
            .series_refs
            .insert((project_id, msgid.into()), series_id);
    }

    /// Link a submission to a series.
    pub async fn set_series(
        &self,
        submission_id: SubmissionId,
        series_id: Option<SeriesId>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let submission = state
            .submissions
            .get_mut(&submission_id)
            .ok_or(Error::SubmissionNotFound(submission_id))?;
        submission.series_id = series_id;
        Ok(())
    }
}

#[async_trait]
impl SubmissionSource for MemoryBackend {
    async fn project(&self, id: ProjectId) -> Result<Option<Project>> {
        Ok(self.state.read().await.projects.get(&id).cloned())
    }

    async fn tags_for_project(&self, project_id: ProjectId) -> Result<Vec<Tag>> {
        Ok(self
            .state
            .read()
            .await
            .tags
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn submission(&self, id: SubmissionId) -> Result<Option<Submission>> {
        Ok(self.state.read().await.submissions.get(&id).cloned())
    }

    async fn comments(&self, submission_id: SubmissionId) -> Result<Vec<Comment>> {
        let state = self.state.read().await;
        let mut comments: Vec<Comment> = state
            .comments
            .values()
            .filter(|c| c.submission_id == submission_id)
            .cloned()
            .collect();
        comments.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
        Ok(comments)
    }

    async fn comment(&self, id: CommentId) -> Result<Option<Comment>> {
        Ok(self.state.read().await.comments.get(&id).cloned())
    }

    async fn series(&self, id: SeriesId) -> Result<Option<Series>> {
        let state = self.state.read().await;
        Ok(state.series.get(&id).map(|s| state.series_view(s)))
    }

    async fn series_patches(&self, series_id: SeriesId) -> Result<Vec<Submission>> {
        let state = self.state.read().await;
        let mut patches: Vec<Submission> = state
            .submissions
            .values()
            .filter(|s| s.is_patch() && s.series_id == Some(series_id))
            .cloned()
            .collect();
        patches.sort_by_key(|s| (s.number.unwrap_or(i32::MAX), s.id));
        Ok(patches)
    }

    async fn series_by_reference(
        &self,
        project_id: ProjectId,
        msgid: &str,
    ) -> Result<Option<SeriesId>> {
        Ok(self
            .state
            .read()
            .await
            .series_refs
            .get(&(project_id, msgid.to_string()))
            .copied())
    }

    async fn series_reference_msgids(&self, series_id: SeriesId) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let mut msgids: Vec<String> = state
            .series_refs
            .iter()
            .filter(|(_, id)| **id == series_id)
            .map(|((_, msgid), _)| msgid.clone())
            .collect();
        msgids.sort();
        Ok(msgids)
    }

    async fn submission_by_msgid(
        &self,
        project_id: ProjectId,
        msgid: &str,
    ) -> Result<Option<Submission>> {
        Ok(self
            .state
            .read()
            .await
            .submissions
            .values()
            .find(|s| s.project_id == project_id && s.msgid == msgid)
            .cloned())
    }

    async fn submissions_referencing(
        &self,
        project_id: ProjectId,
        msgid: &str,
    ) -> Result<Vec<Submission>> {
        Ok(self
            .state
            .read()
            .await
            .submissions
            .values()
            .filter(|s| {
                s.project_id == project_id && s.referenced_msgids().any(|m| m == msgid)
            })
            .cloned()
            .collect())
    }

    async fn list_submission_ids(
        &self,
        project_id: Option<ProjectId>,
    ) -> Result<Vec<SubmissionId>> {
        Ok(self
            .state
            .read()
            .await
            .submissions
            .values()
            .filter(|s| project_id.map_or(true, |p| s.project_id == p))
            .map(|s| s.id)
            .collect())
    }
}

#[async_trait]
impl TagStore for MemoryBackend {
    async fn upsert(&self, submission_id: SubmissionId, tag: &AggregatedTag) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .aggregated
            .entry(submission_id)
            .or_default()
            .insert(tag.tag_id, tag.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, submission_id: SubmissionId, tag_id: TagId) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(rows) = state.aggregated.get_mut(&submission_id) {
            if rows.remove(&tag_id).is_some() {
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
            if rows.is_empty() {
                state.aggregated.remove(&submission_id);
            }
        }
        Ok(())
    }

    async fn replace_all(
        &self,
        submission_id: SubmissionId,
        tags: &[AggregatedTag],
    ) -> Result<StoreDelta> {
        let mut state = self.state.write().await;
        let rows = state.aggregated.entry(submission_id).or_default();
        let mut delta = StoreDelta::default();

        let wanted: BTreeSet<TagId> = tags.iter().map(|t| t.tag_id).collect();
        let stale: Vec<TagId> = rows
            .keys()
            .filter(|id| !wanted.contains(id))
            .copied()
            .collect();
        for id in stale {
            rows.remove(&id);
            delta.deleted += 1;
        }

        for tag in tags {
            match rows.get(&tag.tag_id) {
                Some(existing) if existing == tag => delta.unchanged += 1,
                _ => {
                    rows.insert(tag.tag_id, tag.clone());
                    delta.upserted += 1;
                }
            }
        }

        if rows.is_empty() {
            state.aggregated.remove(&submission_id);
        }
        self.writes
            .fetch_add((delta.upserted + delta.deleted) as u64, Ordering::SeqCst);
        Ok(delta)
    }

    async fn get(&self, submission_id: SubmissionId) -> Result<Vec<AggregatedTag>> {
        let state = self.state.read().await;
        let mut tags: Vec<AggregatedTag> = state
            .aggregated
            .get(&submission_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        tags.sort_by(|a, b| a.tag_name.cmp(&b.tag_name));
        Ok(tags)
    }

    async fn find_submissions(
        &self,
        project_id: Option<ProjectId>,
        filter: &TagFilter,
    ) -> Result<Vec<SubmissionId>> {
        let state = self.state.read().await;
        Ok(state
            .aggregated
            .iter()
            .filter(|(id, _)| {
                project_id.map_or(true, |p| {
                    state
                        .submissions
                        .get(*id)
                        .map_or(false, |s| s.project_id == p)
                })
            })
            .filter(|(_, rows)| {
                rows.values()
                    .any(|t| t.values.iter().any(|v| filter.matches(&t.tag_name, v)))
            })
            .map(|(id, _)| *id)
            .collect())
    }
}
