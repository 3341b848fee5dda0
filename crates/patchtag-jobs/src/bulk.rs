//! Bulk recomputation of aggregated tags.
//!
//! A bulk run recomputes each submission on its own, exactly as a single
//! edit would. Items are independent: a failing submission is logged and
//! recorded in the report, and the run continues. A run can be cancelled
//! between items; the report lists what was not processed so that a later
//! run can resume from it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{field::Empty, info, instrument, warn, Span};
use uuid::Uuid;

use patchtag_core::defaults::{BULK_CONCURRENCY, BULK_CONCURRENCY_MAX, BULK_PROGRESS_EVERY};
use patchtag_core::logging;
use patchtag_core::{Error, ProjectId, Result, SubmissionId};

use crate::engine::TagEngine;

/// Configuration for bulk runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkConfig {
    /// Submissions recomputed concurrently.
    pub concurrency: usize,
    /// Report progress every N processed submissions.
    pub progress_every: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            concurrency: BULK_CONCURRENCY,
            progress_every: BULK_PROGRESS_EVERY,
        }
    }
}

impl BulkConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `PATCHTAG_BULK_CONCURRENCY` | `1` | Concurrent recomputes (max 32) |
    /// | `PATCHTAG_PROGRESS_EVERY` | `10` | Progress report interval |
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("PATCHTAG_BULK_CONCURRENCY") {
            let n = v
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::Config(format!("Invalid PATCHTAG_BULK_CONCURRENCY: {}", v)))?;
            config = config.with_concurrency(n);
        }
        if let Ok(v) = std::env::var("PATCHTAG_PROGRESS_EVERY") {
            let n = v
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::Config(format!("Invalid PATCHTAG_PROGRESS_EVERY: {}", v)))?;
            config = config.with_progress_every(n);
        }

        Ok(config)
    }

    /// Set concurrency, clamped to `1..=32`.
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.clamp(1, BULK_CONCURRENCY_MAX);
        self
    }

    /// Set the progress interval (at least 1).
    pub fn with_progress_every(mut self, n: usize) -> Self {
        self.progress_every = n.max(1);
        self
    }
}

/// Progress snapshot passed to the progress callback.
#[derive(Debug, Clone, Serialize)]
pub struct BulkProgress {
    pub run_id: Uuid,
    pub processed: usize,
    pub total: usize,
    pub failed: usize,
}

impl BulkProgress {
    pub fn percent(&self) -> u32 {
        if self.total == 0 {
            return 100;
        }
        (self.processed * 100 / self.total) as u32
    }
}

/// A submission that failed to recompute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkFailure {
    pub submission_id: SubmissionId,
    pub error: String,
}

/// Outcome of a bulk run.
#[derive(Debug, Clone, Serialize)]
pub struct BulkReport {
    pub run_id: Uuid,
    pub total: usize,
    pub succeeded: usize,
    /// Rows written or removed across the run.
    pub changed: usize,
    pub failed: Vec<BulkFailure>,
    /// Submissions not processed because the run was cancelled, ascending.
    pub pending: Vec<SubmissionId>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl BulkReport {
    pub fn failed_ids(&self) -> Vec<SubmissionId> {
        self.failed.iter().map(|f| f.submission_id).collect()
    }

    /// IDs to pass to a follow-up run: failures and unprocessed submissions.
    pub fn resume_ids(&self) -> Vec<SubmissionId> {
        let mut ids = self.failed_ids();
        ids.extend(&self.pending);
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Cancels a running bulk job between items.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type ProgressFn = Arc<dyn Fn(&BulkProgress) + Send + Sync>;

enum Outcome {
    Done(usize),
    Failed(Error),
    Skipped,
}

/// Bulk recompute runner.
#[derive(Clone)]
pub struct BulkRecompute {
    engine: TagEngine,
    config: BulkConfig,
    cancel: CancelHandle,
    progress: Option<ProgressFn>,
}

impl BulkRecompute {
    pub fn new(engine: TagEngine, config: BulkConfig) -> Self {
        Self {
            engine,
            config,
            cancel: CancelHandle::default(),
            progress: None,
        }
    }

    /// Register a progress callback, called every `progress_every` items and
    /// once at the end.
    pub fn with_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&BulkProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Submissions a run would process.
    async fn select(
        &self,
        project_id: Option<ProjectId>,
        submission_ids: Option<Vec<SubmissionId>>,
    ) -> Result<Vec<SubmissionId>> {
        let mut ids = match (submission_ids, project_id) {
            (Some(ids), None) => ids,
            (Some(ids), Some(project_id)) => {
                let in_project = self
                    .engine
                    .list_submission_ids(Some(project_id))
                    .await?;
                ids.into_iter()
                    .filter(|id| in_project.binary_search(id).is_ok())
                    .collect()
            }
            (None, project_id) => self.engine.list_submission_ids(project_id).await?,
        };
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Recompute every selected submission.
    ///
    /// With neither argument every submission is recomputed. Failures of
    /// individual submissions do not fail the run; only failing to list the
    /// submissions does.
    #[instrument(
        skip(self, submission_ids),
        fields(
            subsystem = "jobs",
            component = "bulk",
            run_id = Empty,
            recomputed = Empty,
            failed = Empty
        )
    )]
    pub async fn run(
        &self,
        project_id: Option<ProjectId>,
        submission_ids: Option<Vec<SubmissionId>>,
    ) -> Result<BulkReport> {
        let start = Instant::now();
        let run_id = Uuid::now_v7();
        Span::current().record(logging::RUN_ID, tracing::field::display(run_id));

        let ids = self.select(project_id, submission_ids).await?;
        let total = ids.len();
        info!(
            total,
            concurrency = self.config.concurrency,
            "Bulk recompute started"
        );

        let mut report = BulkReport {
            run_id,
            total,
            succeeded: 0,
            changed: 0,
            failed: Vec::new(),
            pending: Vec::new(),
            cancelled: false,
            duration_ms: 0,
        };

        let mut outcomes = stream::iter(ids)
            .map(|id| {
                let engine = &self.engine;
                let cancel = &self.cancel;
                async move {
                    if cancel.is_cancelled() {
                        return (id, Outcome::Skipped);
                    }
                    match engine.recompute(id).await {
                        Ok(delta) => (id, Outcome::Done(delta.upserted + delta.deleted)),
                        Err(e) => (id, Outcome::Failed(e)),
                    }
                }
            })
            .buffer_unordered(self.config.concurrency);

        let mut processed = 0;
        while let Some((id, outcome)) = outcomes.next().await {
            match outcome {
                Outcome::Done(changed) => {
                    report.succeeded += 1;
                    report.changed += changed;
                }
                Outcome::Failed(e) => {
                    warn!(submission_id = id, error = %e, "Bulk recompute item failed");
                    report.failed.push(BulkFailure {
                        submission_id: id,
                        error: e.to_string(),
                    });
                }
                Outcome::Skipped => {
                    report.pending.push(id);
                    continue;
                }
            }

            processed += 1;
            if processed % self.config.progress_every == 0 {
                self.report_progress(run_id, processed, total, report.failed.len());
            }
        }

        report.pending.sort_unstable();
        report.failed.sort_by_key(|f| f.submission_id);
        report.cancelled = !report.pending.is_empty();
        report.duration_ms = start.elapsed().as_millis() as u64;
        if processed % self.config.progress_every != 0 {
            self.report_progress(run_id, processed, total, report.failed.len());
        }

        let span = Span::current();
        span.record(logging::RECOMPUTED, report.succeeded);
        span.record(logging::FAILED, report.failed.len());
        info!(
            succeeded = report.succeeded,
            failed = report.failed.len(),
            pending = report.pending.len(),
            changed = report.changed,
            duration_ms = report.duration_ms,
            "Bulk recompute finished"
        );
        Ok(report)
    }

    fn report_progress(&self, run_id: Uuid, processed: usize, total: usize, failed: usize) {
        let progress = BulkProgress {
            run_id,
            processed,
            total,
            failed,
        };
        info!(
            processed,
            total,
            failed,
            percent = progress.percent(),
            "Bulk recompute progress"
        );
        if let Some(f) = &self.progress {
            f(&progress);
        }
    }
}

impl TagEngine {
    /// Recompute every submission, or those of one project, or an explicit
    /// list, with the default [`BulkConfig`].
    pub async fn recompute_all(
        &self,
        project_id: Option<ProjectId>,
        submission_ids: Option<Vec<SubmissionId>>,
    ) -> Result<BulkReport> {
        BulkRecompute::new(self.clone(), BulkConfig::default())
            .run(project_id, submission_ids)
            .await
    }
}
