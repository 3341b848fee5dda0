//! # patchtag-db
//!
//! PostgreSQL storage for patchtag.
//!
//! This crate provides:
//! - Connection pool management
//! - [`PgSubmissionRepository`]: projects, tag definitions, series,
//!   submissions and comments ([`SubmissionSource`])
//! - [`PgTagStore`]: aggregated tag state per submission ([`TagStore`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use patchtag_db::{Database, TagStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/patchtag").await?;
//!     db.migrate().await?;
//!
//!     let summary = db.tags.summary(42).await?;
//!     println!("{:?}", summary);
//!     Ok(())
//! }
//! ```
pub mod pool;
pub mod submissions;
pub mod tags;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use patchtag_core::*;

pub use pool::{create_pool_with_config, PoolConfig};
pub use submissions::{CreateSubmissionRequest, PgSubmissionRepository};
pub use tags::PgTagStore;

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Source tables: projects, tags, series, submissions, comments.
    pub submissions: PgSubmissionRepository,
    /// Aggregated tag state.
    pub tags: PgTagStore,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            submissions: PgSubmissionRepository::new(pool.clone()),
            tags: PgTagStore::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool_with_config(url, PoolConfig::default()).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
