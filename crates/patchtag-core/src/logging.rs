//! Structured logging schema and field name constants for patchtag.
//!
//! All crates use these names for structured logging fields so that log
//! aggregation can query tag recomputation events the same way across the
//! core, the database layer and the processing crate. Spans declare the
//! fields as `tracing::field::Empty` and fill them through
//! [`tracing::Span::record`] with these constants.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | A recompute failed and the caller received the error |
//! | WARN  | Recoverable issue (bulk item failed, reference cycle cut short) |
//! | INFO  | Bulk run start/finish, pool lifecycle |
//! | DEBUG | Propagation decisions, store deltas |
//! | TRACE | Per-tag, per-value iteration |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Correlation ID of a bulk recompute run.
/// Format: UUIDv7 (time-ordered).
pub const RUN_ID: &str = "run_id";

/// Subsystem originating the log event.
/// Values: "db", "tags", "jobs"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "tag_store", "engine", "bulk", "propagation"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "recompute", "replace_all", "resolve_series"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Submission (patch or cover letter) being operated on.
pub const SUBMISSION_ID: &str = "submission_id";

/// Comment being operated on.
pub const COMMENT_ID: &str = "comment_id";

/// Project owning the submission.
pub const PROJECT_ID: &str = "project_id";

/// Series resolved for a submission.
pub const SERIES_ID: &str = "series_id";

/// Tag name being matched or persisted.
pub const TAG_NAME: &str = "tag";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of submissions recomputed by one change or run.
pub const RECOMPUTED: &str = "recomputed";

/// Number of submissions that failed in a bulk run.
pub const FAILED: &str = "failed";

/// Number of persisted tag rows written (upserted) by a replace.
pub const UPSERTED: &str = "upserted";

/// Number of persisted tag rows removed by a replace.
pub const DELETED: &str = "deleted";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
