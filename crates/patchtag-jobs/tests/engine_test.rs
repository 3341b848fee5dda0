//! Engine tests over the in-memory backend: recompute on change, cover
//! letter propagation, convergence after deletions, and bulk runs.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};

use patchtag_jobs::{
    AggregatedTag, BulkConfig, BulkRecompute, ChangeKind, Comment, CommentId, Error,
    MemoryBackend, Project, PropagationPolicy, Result, Series, SeriesId, StoreDelta, Submission,
    SubmissionId, SubmissionKind, Tag, TagEngine, TagFilter, TagId, TagPolicy, TagStore,
    TextChange,
};

const PROJECT: i64 = 1;
const ACKED_BY: TagId = 1;
const REVIEWED_BY: TagId = 2;
const TESTED_BY: TagId = 3;

fn submission(
    id: SubmissionId,
    kind: SubmissionKind,
    content: Option<&str>,
    series_id: Option<SeriesId>,
    number: Option<i32>,
) -> Submission {
    Submission {
        id,
        project_id: PROJECT,
        kind,
        msgid: format!("<{}@example.com>", id),
        content: content.map(str::to_string),
        in_reply_to: None,
        references: Vec::new(),
        series_id,
        number,
        date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(id),
    }
}

fn comment(id: CommentId, submission_id: SubmissionId, content: &str) -> Comment {
    Comment {
        id,
        submission_id,
        msgid: format!("<c{}@example.com>", id),
        content: Some(content.to_string()),
        date: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap() + Duration::minutes(id),
    }
}

fn values(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|v| v.to_string()).collect()
}

async fn backend() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    backend
        .insert_project(Project {
            id: PROJECT,
            name: "linux-kernel".to_string(),
            use_tags: true,
        })
        .await;
    backend.insert_tag(Tag::named(ACKED_BY, PROJECT, "Acked-by")).await;
    backend.insert_tag(Tag::named(REVIEWED_BY, PROJECT, "Reviewed-by")).await;
    backend.insert_tag(Tag::named(TESTED_BY, PROJECT, "Tested-by")).await;
    backend
}

fn engine(backend: &Arc<MemoryBackend>, policy: TagPolicy) -> TagEngine {
    TagEngine::new(backend.clone(), backend.clone(), policy)
}

/// Series 1: cover letter 100, patches 101 and 102.
async fn series_with_cover(backend: &MemoryBackend) {
    backend
        .insert_series(Series {
            id: 1,
            project_id: PROJECT,
            total: 2,
            cover_letter_id: None,
            cover_expected: true,
            patch_numbers: Vec::new(),
        })
        .await;
    backend
        .insert_submission(submission(
            100,
            SubmissionKind::CoverLetter,
            Some("Cover"),
            Some(1),
            None,
        ))
        .await;
    backend
        .insert_submission(submission(
            101,
            SubmissionKind::Patch,
            Some("Patch one"),
            Some(1),
            Some(1),
        ))
        .await;
    backend
        .insert_submission(submission(
            102,
            SubmissionKind::Patch,
            Some("Patch two"),
            Some(1),
            Some(2),
        ))
        .await;
}

#[tokio::test]
async fn test_review_comment_is_aggregated() {
    let backend = backend().await;
    let engine = engine(&backend, TagPolicy::default());
    backend
        .insert_submission(submission(10, SubmissionKind::Patch, Some("Fix foo"), None, None))
        .await;
    backend
        .insert_comment(comment(1, 10, "Looks good.\n\nReviewed-by: Ann <ann@example.com>\n"))
        .await;
    backend
        .insert_comment(comment(
            2,
            10,
            "Reviewed-by: Ann <ann@example.com>\nTested-by: Bob <bob@example.com>",
        ))
        .await;

    let report = engine
        .on_change(TextChange::comment(2, 10, ChangeKind::Created))
        .await
        .unwrap();
    assert_eq!(report.recomputed, vec![10]);
    assert_eq!(report.delta.upserted, 2);

    let summary = engine.get_tag_summary(10).await.unwrap();
    assert_eq!(summary.get("Reviewed-by"), Some(&1));
    assert_eq!(summary.get("Tested-by"), Some(&1));
    assert_eq!(summary.get("Acked-by"), None);
}

#[tokio::test]
async fn test_empty_body_with_repeated_ack() {
    let backend = backend().await;
    let engine = engine(&backend, TagPolicy::default());
    backend
        .insert_submission(submission(10, SubmissionKind::Patch, Some(""), None, None))
        .await;
    backend
        .insert_comment(comment(
            1,
            10,
            "Acked-by: A <a@example.com>\nReviewed-by: B <b@example.com>",
        ))
        .await;
    backend
        .insert_comment(comment(2, 10, "Acked-by: A <a@example.com>"))
        .await;

    engine.on_text_changed(10).await.unwrap();

    let detail = engine.get_tag_detail(10).await.unwrap();
    assert_eq!(detail.len(), 2);
    assert_eq!(detail["Acked-by"], values(&["A <a@example.com>"]));
    assert_eq!(detail["Reviewed-by"], values(&["B <b@example.com>"]));
    assert!(!detail.contains_key("Tested-by"));
}

#[tokio::test]
async fn test_cover_ack_reaches_patches() {
    let backend = backend().await;
    let engine = engine(&backend, TagPolicy::default());
    series_with_cover(&backend).await;
    backend
        .insert_comment(comment(1, 100, "Acked-by: Maintainer <m@example.com>"))
        .await;

    let report = engine
        .on_change(TextChange::comment(1, 100, ChangeKind::Created))
        .await
        .unwrap();
    assert_eq!(report.recomputed, vec![100, 101, 102]);

    for patch in [101, 102] {
        let detail = engine.get_tag_detail(patch).await.unwrap();
        assert_eq!(detail["Acked-by"], values(&["Maintainer <m@example.com>"]));
    }
}

#[tokio::test]
async fn test_cover_ack_stays_local_without_propagation() {
    let backend = backend().await;
    let policy = TagPolicy::default().with_propagation(PropagationPolicy::None);
    let engine = engine(&backend, policy);
    series_with_cover(&backend).await;
    backend
        .insert_comment(comment(1, 100, "Acked-by: Maintainer <m@example.com>"))
        .await;

    let report = engine
        .on_change(TextChange::comment(1, 100, ChangeKind::Created))
        .await
        .unwrap();
    assert_eq!(report.recomputed, vec![100]);
    assert_eq!(engine.get_tag_summary(100).await.unwrap().get("Acked-by"), Some(&1));
    assert!(engine.get_tag_summary(101).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_bidirectional_patch_reply_reaches_cover() {
    let backend = backend().await;
    let policy = TagPolicy::default().with_propagation(PropagationPolicy::Bidirectional);
    let engine = engine(&backend, policy);
    series_with_cover(&backend).await;
    backend
        .insert_comment(comment(1, 101, "Tested-by: Bot <ci@example.com>"))
        .await;

    let report = engine
        .on_change(TextChange::comment(1, 101, ChangeKind::Created))
        .await
        .unwrap();
    assert_eq!(report.recomputed, vec![101, 100]);
    assert_eq!(engine.get_tag_summary(100).await.unwrap().get("Tested-by"), Some(&1));

    // Edits of an existing patch body do not touch the cover.
    let report = engine.on_text_changed(102).await.unwrap();
    assert_eq!(report.recomputed, vec![102]);
}

#[tokio::test]
async fn test_deleting_only_matching_comment_removes_row() {
    let backend = backend().await;
    let engine = engine(&backend, TagPolicy::default());
    backend
        .insert_submission(submission(10, SubmissionKind::Patch, None, None, None))
        .await;
    backend
        .insert_comment(comment(1, 10, "Acked-by: Ann <ann@example.com>"))
        .await;
    engine.recompute(10).await.unwrap();
    assert_eq!(engine.get_tag_summary(10).await.unwrap().len(), 1);

    backend.remove_comment(1).await;
    let report = engine
        .on_change(TextChange::comment(1, 10, ChangeKind::Deleted))
        .await
        .unwrap();
    assert_eq!(report.delta.deleted, 1);
    assert!(engine.get_tag_summary(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deleted_submission_rows_are_cleared() {
    let backend = backend().await;
    let engine = engine(&backend, TagPolicy::default());
    backend
        .insert_submission(submission(
            10,
            SubmissionKind::Patch,
            Some("Acked-by: Ann <a@x>"),
            None,
            None,
        ))
        .await;
    engine.recompute(10).await.unwrap();

    // Rows left behind by a storage layer without cascades.
    backend.remove_submission(10).await;
    backend
        .replace_all(
            10,
            &[AggregatedTag {
                tag_id: ACKED_BY,
                tag_name: "Acked-by".to_string(),
                values: values(&["Ann <a@x>"]),
            }],
        )
        .await
        .unwrap();

    let report = engine
        .on_change(TextChange::submission(10, ChangeKind::Deleted))
        .await
        .unwrap();
    assert_eq!(report.recomputed, vec![10]);
    assert_eq!(report.delta.deleted, 1);
    assert!(backend.get(10).await.unwrap().is_empty());
}

/// Cover letter 200 linked to series 1 and patch 201 replying to it without
/// a series link, as stored when the patch arrived first.
async fn patch_before_cover(backend: &MemoryBackend, cover_body: &str) {
    let mut patch = submission(201, SubmissionKind::Patch, Some("Patch"), None, Some(1));
    patch.in_reply_to = Some("<200@example.com>".to_string());
    patch.references = vec!["<200@example.com>".to_string()];
    backend.insert_submission(patch).await;

    backend
        .insert_series(Series {
            id: 1,
            project_id: PROJECT,
            total: 1,
            cover_letter_id: None,
            cover_expected: false,
            patch_numbers: Vec::new(),
        })
        .await;
    backend.add_series_reference(PROJECT, "<200@example.com>", 1).await;
    backend
        .insert_submission(submission(
            200,
            SubmissionKind::CoverLetter,
            Some(cover_body),
            Some(1),
            None,
        ))
        .await;
}

#[tokio::test]
async fn test_patch_arriving_before_cover_gets_cover_tags() {
    let backend = backend().await;
    let engine = engine(&backend, TagPolicy::default());
    patch_before_cover(&backend, "Series intro\n\nAcked-by: Maintainer <m@example.com>").await;

    let report = engine
        .on_change(TextChange::submission(200, ChangeKind::Created))
        .await
        .unwrap();
    assert_eq!(report.recomputed, vec![200, 201]);
    let detail = engine.get_tag_detail(201).await.unwrap();
    assert_eq!(detail["Acked-by"], values(&["Maintainer <m@example.com>"]));
}

#[tokio::test]
async fn test_bidirectional_cover_reads_unlinked_patch() {
    let backend = backend().await;
    let policy = TagPolicy::default().with_propagation(PropagationPolicy::Bidirectional);
    let engine = engine(&backend, policy);
    patch_before_cover(&backend, "Series intro").await;
    backend
        .insert_comment(comment(1, 201, "Tested-by: Bot <ci@example.com>"))
        .await;

    let report = engine
        .on_change(TextChange::comment(1, 201, ChangeKind::Created))
        .await
        .unwrap();
    assert_eq!(report.recomputed, vec![201, 200]);
    assert_eq!(engine.get_tag_summary(200).await.unwrap().get("Tested-by"), Some(&1));

    // Recomputing the cover on its own reaches the same patch.
    let delta = engine.recompute(200).await.unwrap();
    assert!(delta.is_noop());
}

#[tokio::test]
async fn test_cover_removed_before_notification_clears_patch_tags() {
    let backend = backend().await;
    let engine = engine(&backend, TagPolicy::default());
    series_with_cover(&backend).await;
    backend
        .insert_comment(comment(1, 100, "Acked-by: Maintainer <m@example.com>"))
        .await;
    engine
        .on_change(TextChange::comment(1, 100, ChangeKind::Created))
        .await
        .unwrap();
    assert_eq!(engine.get_tag_summary(101).await.unwrap().get("Acked-by"), Some(&1));

    backend.remove_submission(100).await;
    let report = engine
        .on_change(TextChange::submission(100, ChangeKind::Deleted).in_series(Some(1)))
        .await
        .unwrap();
    assert_eq!(report.recomputed, vec![100, 101, 102]);
    assert_eq!(report.delta.deleted, 2);
    for patch in [101, 102] {
        assert!(engine.get_tag_summary(patch).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_cover_deletion_reported_before_removal_clears_tags() {
    let backend = backend().await;
    let engine = engine(&backend, TagPolicy::default());
    series_with_cover(&backend).await;
    backend
        .insert_comment(comment(1, 100, "Acked-by: Maintainer <m@example.com>"))
        .await;
    engine
        .on_change(TextChange::comment(1, 100, ChangeKind::Created))
        .await
        .unwrap();

    let report = engine
        .on_change(TextChange::submission(100, ChangeKind::Deleted))
        .await
        .unwrap();
    assert_eq!(report.recomputed, vec![100, 101, 102]);
    assert_eq!(report.delta.deleted, 3);
    for id in [100, 101, 102] {
        assert!(backend.get(id).await.unwrap().is_empty(), "submission {}", id);
    }
}

#[tokio::test]
async fn test_bidirectional_removed_patch_leaves_cover() {
    let backend = backend().await;
    let policy = TagPolicy::default().with_propagation(PropagationPolicy::Bidirectional);
    let engine = engine(&backend, policy);
    series_with_cover(&backend).await;
    backend
        .insert_comment(comment(1, 102, "Tested-by: Bot <ci@example.com>"))
        .await;
    engine
        .on_change(TextChange::comment(1, 102, ChangeKind::Created))
        .await
        .unwrap();
    assert_eq!(engine.get_tag_summary(100).await.unwrap().get("Tested-by"), Some(&1));

    backend.remove_submission(102).await;
    let report = engine
        .on_change(TextChange::submission(102, ChangeKind::Deleted).in_series(Some(1)))
        .await
        .unwrap();
    assert_eq!(report.recomputed, vec![102, 100]);
    assert!(engine.get_tag_summary(100).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_recompute_is_idempotent() {
    let backend = backend().await;
    let engine = engine(&backend, TagPolicy::default());
    backend
        .insert_submission(submission(
            10,
            SubmissionKind::Patch,
            Some("Reviewed-by: Ann <a@x>\nAcked-by: Bob <b@x>"),
            None,
            None,
        ))
        .await;

    let first = engine.on_text_changed(10).await.unwrap();
    assert_eq!(first.delta.upserted, 2);
    let writes = backend.writes();

    let second = engine.on_text_changed(10).await.unwrap();
    assert!(second.delta.is_noop());
    assert_eq!(second.delta.unchanged, 2);
    assert_eq!(backend.writes(), writes);
}

#[tokio::test]
async fn test_concurrent_changes_converge() {
    let backend = backend().await;
    let engine = engine(&backend, TagPolicy::default());
    backend
        .insert_submission(submission(10, SubmissionKind::Patch, None, None, None))
        .await;
    for i in 1..=8 {
        backend
            .insert_comment(comment(i, 10, &format!("Tested-by: Bot{} <bot{}@x>", i, i)))
            .await;
    }

    let changes = (1..=8).map(|i| {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .on_change(TextChange::comment(i, 10, ChangeKind::Created))
                .await
        })
    });
    for handle in changes.collect::<Vec<_>>() {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(engine.get_tag_summary(10).await.unwrap().get("Tested-by"), Some(&8));
}

#[tokio::test]
async fn test_disabled_project_and_removed_tag_converge_to_empty() {
    let backend = backend().await;
    let engine = engine(&backend, TagPolicy::default());
    backend
        .insert_submission(submission(
            10,
            SubmissionKind::Patch,
            Some("Acked-by: Ann <a@x>\nReviewed-by: Bob <b@x>"),
            None,
            None,
        ))
        .await;
    engine.recompute(10).await.unwrap();

    backend.remove_tag(ACKED_BY).await;
    engine.recompute(10).await.unwrap();
    let summary = engine.get_tag_summary(10).await.unwrap();
    assert_eq!(summary.get("Acked-by"), None);
    assert_eq!(summary.get("Reviewed-by"), Some(&1));

    backend.set_use_tags(PROJECT, false).await.unwrap();
    let delta = engine.recompute(10).await.unwrap();
    assert_eq!(delta.deleted, 1);
    assert!(engine.get_tag_summary(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let backend = backend().await;
    let engine = engine(&backend, TagPolicy::default());

    assert!(matches!(
        engine.recompute(999).await,
        Err(Error::SubmissionNotFound(999))
    ));
    assert!(matches!(
        engine.get_tag_summary(999).await,
        Err(Error::SubmissionNotFound(999))
    ));
    assert!(matches!(
        engine.comment_tags(5).await,
        Err(Error::CommentNotFound(5))
    ));
}

#[tokio::test]
async fn test_comment_tags_and_patch_responses() {
    let backend = backend().await;
    let engine = engine(&backend, TagPolicy::default());
    backend
        .insert_submission(submission(
            10,
            SubmissionKind::Patch,
            Some("Acked-by: Self <s@x>"),
            None,
            None,
        ))
        .await;
    backend
        .insert_comment(comment(
            1,
            10,
            "> Acked-by: Self <s@x>\nReviewed-by: Ann <a@x>\nTested-by: Ann <a@x>",
        ))
        .await;
    backend
        .insert_comment(comment(2, 10, "Acked-by: Bob <b@x>"))
        .await;

    let tags = engine.comment_tags(1).await.unwrap();
    assert_eq!(tags.len(), 2);
    assert_eq!(tags["Reviewed-by"], values(&["Ann <a@x>"]));

    let lines = engine.patch_responses(10).await.unwrap();
    assert_eq!(
        lines,
        vec![
            "Reviewed-by: Ann <a@x>".to_string(),
            "Tested-by: Ann <a@x>".to_string(),
            "Acked-by: Bob <b@x>".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_find_submissions_after_recompute() {
    let backend = backend().await;
    let engine = engine(&backend, TagPolicy::default());
    backend
        .insert_submission(submission(
            10,
            SubmissionKind::Patch,
            Some("Acked-by: Ann <ann@corp.com>"),
            None,
            None,
        ))
        .await;
    backend
        .insert_submission(submission(
            11,
            SubmissionKind::Patch,
            Some("Reviewed-by: Bob <bob@x>"),
            None,
            None,
        ))
        .await;
    engine.recompute_all(Some(PROJECT), None).await.unwrap();

    let filter = TagFilter::parse_query("acked-by,CORP").unwrap();
    assert_eq!(engine.find_submissions(Some(PROJECT), &filter).await.unwrap(), vec![10]);
    assert_eq!(
        engine
            .find_submissions(None, &TagFilter::by_name("Reviewed-by"))
            .await
            .unwrap(),
        vec![11]
    );
}

/// Store that fails writes for one submission.
struct FailingStore {
    inner: Arc<MemoryBackend>,
    fail_for: SubmissionId,
}

#[async_trait]
impl TagStore for FailingStore {
    async fn upsert(&self, submission_id: SubmissionId, tag: &AggregatedTag) -> Result<()> {
        self.inner.upsert(submission_id, tag).await
    }

    async fn delete(&self, submission_id: SubmissionId, tag_id: TagId) -> Result<()> {
        self.inner.delete(submission_id, tag_id).await
    }

    async fn replace_all(
        &self,
        submission_id: SubmissionId,
        tags: &[AggregatedTag],
    ) -> Result<StoreDelta> {
        if submission_id == self.fail_for {
            return Err(Error::Storage("disk full".to_string()));
        }
        self.inner.replace_all(submission_id, tags).await
    }

    async fn get(&self, submission_id: SubmissionId) -> Result<Vec<AggregatedTag>> {
        self.inner.get(submission_id).await
    }

    async fn find_submissions(
        &self,
        project_id: Option<i64>,
        filter: &TagFilter,
    ) -> Result<Vec<SubmissionId>> {
        self.inner.find_submissions(project_id, filter).await
    }
}

async fn five_acked_patches(backend: &MemoryBackend) {
    for id in 10..15 {
        backend
            .insert_submission(submission(
                id,
                SubmissionKind::Patch,
                Some(&format!("Acked-by: Dev{} <dev{}@x>", id, id)),
                None,
                None,
            ))
            .await;
    }
}

#[tokio::test]
async fn test_bulk_run_continues_past_failures() {
    let backend = backend().await;
    five_acked_patches(&backend).await;
    let store = Arc::new(FailingStore {
        inner: backend.clone(),
        fail_for: 12,
    });
    let engine = TagEngine::new(backend.clone(), store, TagPolicy::default());

    let bulk = BulkRecompute::new(engine, BulkConfig::default().with_concurrency(4));
    let report = bulk.run(None, None).await.unwrap();

    assert_eq!(report.total, 5);
    assert_eq!(report.succeeded, 4);
    assert_eq!(report.failed_ids(), vec![12]);
    assert!(report.failed[0].error.contains("disk full"));
    assert!(!report.cancelled);

    for id in [10, 11, 13, 14] {
        assert_eq!(backend.get(id).await.unwrap().len(), 1);
    }
    assert!(backend.get(12).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_bulk_run_with_explicit_ids_and_progress() {
    let backend = backend().await;
    five_acked_patches(&backend).await;
    let engine = engine(&backend, TagPolicy::default());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let bulk = BulkRecompute::new(engine, BulkConfig::default().with_progress_every(2))
        .with_progress(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    let report = bulk.run(None, Some(vec![14, 10, 14, 11])).await.unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.changed, 3);
    // Once at two processed, once at the end.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(backend.get(12).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_bulk_run_cancellation_reports_pending() {
    let backend = backend().await;
    five_acked_patches(&backend).await;
    let engine = engine(&backend, TagPolicy::default());

    let bulk = BulkRecompute::new(engine, BulkConfig::default().with_progress_every(1));
    let handle = bulk.cancel_handle();
    let bulk = bulk.with_progress(move |_| handle.cancel());
    let report = bulk.run(Some(PROJECT), None).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.pending, vec![11, 12, 13, 14]);
    assert_eq!(report.resume_ids(), vec![11, 12, 13, 14]);
    assert!(backend.get(11).await.unwrap().is_empty());
}
