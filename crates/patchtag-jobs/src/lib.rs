//! # patchtag-jobs
//!
//! Tag recomputation for patchtag.
//!
//! This crate provides:
//! - The [`TagEngine`], which recomputes aggregated tags when a submission or
//!   comment changes and serves tag queries
//! - Cover letter and series propagation ([`PropagationResolver`])
//! - Per-submission serialization of recomputes ([`SubmissionLocks`])
//! - Bulk retagging with progress and cancellation ([`BulkRecompute`])
//!
//! ## Example
//!
//! ```ignore
//! use patchtag_db::Database;
//! use patchtag_jobs::{ChangeKind, TagEngine, TagPolicy, TextChange};
//!
//! let db = Database::connect("postgres://...").await?;
//! let engine = TagEngine::from_database(&db, TagPolicy::from_env()?);
//!
//! // A reviewer replied on patch 42
//! let report = engine
//!     .on_change(TextChange::comment(comment_id, 42, ChangeKind::Created))
//!     .await?;
//!
//! let summary = engine.get_tag_summary(42).await?;
//! ```

pub mod bulk;
pub mod engine;
pub mod locks;
pub mod propagation;

// Re-export core types
pub use patchtag_core::*;

pub use bulk::{BulkConfig, BulkFailure, BulkProgress, BulkRecompute, BulkReport, CancelHandle};
pub use engine::{ChangeReport, TagEngine};
pub use locks::{SubmissionGuard, SubmissionLocks};
pub use propagation::{PropagationResolver, SeriesMembers};
