//! Centralized default constants for patchtag.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic
//! numbers.

// =============================================================================
// EXTRACTION
// =============================================================================

/// Maximum stored length of a contributor value, in characters.
///
/// Matches the width of the persisted `value` column; longer captures are
/// truncated on a character boundary.
pub const MAX_TAG_VALUE_LEN: usize = 255;

/// Maximum length of a tag name.
pub const MAX_TAG_NAME_LEN: usize = 255;

// =============================================================================
// PROPAGATION
// =============================================================================

/// Maximum number of message-ids visited while walking reference headers
/// to find the series a submission belongs to.
pub const MAX_REFERENCE_WALK: usize = 256;

// =============================================================================
// BULK RECOMPUTE
// =============================================================================

/// Number of submissions recomputed concurrently during a bulk run.
pub const BULK_CONCURRENCY: usize = 1;

/// Upper bound accepted for bulk concurrency from configuration.
pub const BULK_CONCURRENCY_MAX: usize = 32;

/// Emit a progress report every N processed submissions.
pub const BULK_PROGRESS_EVERY: usize = 10;
