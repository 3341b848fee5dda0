//! Aggregated tag store implementation.
//!
//! Each distinct contributor value of an aggregated tag is one
//! `submission_tag` row. Writes for a submission run in one transaction
//! holding a transaction-scoped advisory lock keyed by the submission id, so
//! concurrent recomputes of the same submission are serialized and readers
//! never observe a half-replaced set.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::{debug, trace};

use patchtag_core::{
    AggregatedTag, Error, ProjectId, Result, StoreDelta, SubmissionId, TagFilter, TagId, TagStore,
};

/// PostgreSQL implementation of [`TagStore`].
#[derive(Clone)]
pub struct PgTagStore {
    pool: Pool<Postgres>,
}

impl PgTagStore {
    /// Create a new PgTagStore with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn begin_locked(
        &self,
        submission_id: SubmissionId,
    ) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(submission_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        Ok(tx)
    }
}

/// Current persisted values of a submission, per tag id.
async fn load_values(
    tx: &mut Transaction<'_, Postgres>,
    submission_id: SubmissionId,
) -> Result<BTreeMap<TagId, BTreeSet<String>>> {
    let rows = sqlx::query("SELECT tag_id, value FROM submission_tag WHERE submission_id = $1")
        .bind(submission_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(Error::Database)?;

    let mut current: BTreeMap<TagId, BTreeSet<String>> = BTreeMap::new();
    for row in rows {
        current
            .entry(row.get("tag_id"))
            .or_default()
            .insert(row.get("value"));
    }
    Ok(current)
}

/// Make the stored values of one pair equal to `wanted`, touching only the
/// rows that differ.
async fn write_pair(
    tx: &mut Transaction<'_, Postgres>,
    submission_id: SubmissionId,
    tag_id: TagId,
    existing: &BTreeSet<String>,
    wanted: &BTreeSet<String>,
) -> Result<()> {
    let removed: Vec<String> = existing.difference(wanted).cloned().collect();
    let added: Vec<String> = wanted.difference(existing).cloned().collect();

    if !removed.is_empty() {
        sqlx::query(
            "DELETE FROM submission_tag
             WHERE submission_id = $1 AND tag_id = $2 AND value = ANY($3)",
        )
        .bind(submission_id)
        .bind(tag_id)
        .bind(&removed)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
    }

    if !added.is_empty() {
        sqlx::query(
            "INSERT INTO submission_tag (submission_id, tag_id, value)
             SELECT $1, $2, UNNEST($3::TEXT[])
             ON CONFLICT DO NOTHING",
        )
        .bind(submission_id)
        .bind(tag_id)
        .bind(&added)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
    }

    trace!(
        subsystem = "db",
        component = "tag_store",
        submission_id,
        tag_id,
        removed = removed.len(),
        added = added.len(),
        "Pair rewritten"
    );
    Ok(())
}

#[async_trait]
impl TagStore for PgTagStore {
    async fn upsert(&self, submission_id: SubmissionId, tag: &AggregatedTag) -> Result<()> {
        let mut tx = self.begin_locked(submission_id).await?;
        let current = load_values(&mut tx, submission_id).await?;
        let existing = current.get(&tag.tag_id).cloned().unwrap_or_default();
        write_pair(&mut tx, submission_id, tag.tag_id, &existing, &tag.values).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn delete(&self, submission_id: SubmissionId, tag_id: TagId) -> Result<()> {
        sqlx::query("DELETE FROM submission_tag WHERE submission_id = $1 AND tag_id = $2")
            .bind(submission_id)
            .bind(tag_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn replace_all(
        &self,
        submission_id: SubmissionId,
        tags: &[AggregatedTag],
    ) -> Result<StoreDelta> {
        let start = Instant::now();
        let mut tx = self.begin_locked(submission_id).await?;
        let current = load_values(&mut tx, submission_id).await?;
        let mut delta = StoreDelta::default();

        let wanted_ids: BTreeSet<TagId> = tags.iter().map(|t| t.tag_id).collect();
        let stale: Vec<TagId> = current
            .keys()
            .filter(|id| !wanted_ids.contains(id))
            .copied()
            .collect();
        if !stale.is_empty() {
            sqlx::query("DELETE FROM submission_tag WHERE submission_id = $1 AND tag_id = ANY($2)")
                .bind(submission_id)
                .bind(&stale)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
            delta.deleted = stale.len();
        }

        let empty = BTreeSet::new();
        for tag in tags {
            let existing = current.get(&tag.tag_id).unwrap_or(&empty);
            if existing == &tag.values {
                delta.unchanged += 1;
                continue;
            }
            write_pair(&mut tx, submission_id, tag.tag_id, existing, &tag.values).await?;
            delta.upserted += 1;
        }

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "tag_store",
            op = "replace_all",
            submission_id,
            upserted = delta.upserted,
            deleted = delta.deleted,
            unchanged = delta.unchanged,
            duration_ms = start.elapsed().as_millis() as u64,
            "Aggregated tags replaced"
        );
        Ok(delta)
    }

    async fn get(&self, submission_id: SubmissionId) -> Result<Vec<AggregatedTag>> {
        let rows = sqlx::query(
            r#"
            SELECT st.tag_id, t.name, st.value
            FROM submission_tag st
            JOIN tag t ON t.id = st.tag_id
            WHERE st.submission_id = $1
            ORDER BY t.name, st.tag_id, st.value
            "#,
        )
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut tags: Vec<AggregatedTag> = Vec::new();
        for row in rows {
            let tag_id: TagId = row.get("tag_id");
            let value: String = row.get("value");
            match tags.last_mut() {
                Some(last) if last.tag_id == tag_id => {
                    last.values.insert(value);
                }
                _ => tags.push(AggregatedTag {
                    tag_id,
                    tag_name: row.get("name"),
                    values: BTreeSet::from([value]),
                }),
            }
        }
        Ok(tags)
    }

    async fn find_submissions(
        &self,
        project_id: Option<ProjectId>,
        filter: &TagFilter,
    ) -> Result<Vec<SubmissionId>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT st.submission_id
            FROM submission_tag st
            JOIN tag t ON t.id = st.tag_id
            JOIN submission s ON s.id = st.submission_id
            WHERE ($1::BIGINT IS NULL OR s.project_id = $1)
              AND ($2::TEXT IS NULL OR LOWER(t.name) = LOWER($2))
              AND ($3::TEXT IS NULL OR st.value ILIKE $3 ESCAPE '\')
            ORDER BY st.submission_id
            "#,
        )
        .bind(project_id)
        .bind(filter.name.as_deref())
        .bind(filter.value_like_pattern())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(|row| row.get("submission_id")).collect())
    }
}
