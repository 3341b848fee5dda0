//! # patchtag-core
//!
//! Core types, traits, and the pure tag pipeline for patchtag.
//!
//! This crate provides reviewer tag extraction (`Acked-by:`, `Reviewed-by:`,
//! ...) from message bodies, aggregation of those tags across a submission
//! and its comments, and the storage traits that the database and job
//! crates implement and drive.

pub mod aggregation;
pub mod catalog;
pub mod config;
pub mod defaults;
pub mod error;
pub mod extraction;
pub mod filter;
pub mod logging;
pub mod memory;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use aggregation::{normalize_contributor, Aggregation, TagAggregator};
pub use catalog::{validate_tag_name, CompiledTag, TagCatalog};
pub use config::{ContributorMatching, PropagationPolicy, TagPolicy};
pub use error::{Error, Result};
pub use extraction::{extract, extract_lines, TagMatches};
pub use filter::TagFilter;
pub use memory::MemoryBackend;
pub use models::*;
pub use traits::*;
