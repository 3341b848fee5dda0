//! Submission, comment, series and tag-definition repository.
//!
//! Implements [`SubmissionSource`] for the engine, plus the write operations
//! that ingestion and tests use to populate the source tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};

use patchtag_core::{
    validate_tag_name, Comment, CommentId, Error, Project, ProjectId, Result, Series, SeriesId,
    Submission, SubmissionId, SubmissionKind, SubmissionSource, Tag, TagId,
};

const SUBMISSION_COLUMNS: &str =
    "id, project_id, kind, msgid, content, in_reply_to, refs, series_id, number, date";

/// Request for creating a submission.
#[derive(Debug, Clone)]
pub struct CreateSubmissionRequest {
    pub project_id: ProjectId,
    pub kind: SubmissionKind,
    pub msgid: String,
    pub content: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub series_id: Option<SeriesId>,
    pub number: Option<i32>,
    pub date: DateTime<Utc>,
}

/// PostgreSQL implementation of [`SubmissionSource`].
#[derive(Clone)]
pub struct PgSubmissionRepository {
    pool: Pool<Postgres>,
}

impl PgSubmissionRepository {
    /// Create a new PgSubmissionRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    // -------------------------------------------------------------------------
    // Projects and tag definitions
    // -------------------------------------------------------------------------

    pub async fn create_project(&self, name: &str, use_tags: bool) -> Result<ProjectId> {
        let row = sqlx::query("INSERT INTO project (name, use_tags) VALUES ($1, $2) RETURNING id")
            .bind(name)
            .bind(use_tags)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.get("id"))
    }

    pub async fn set_use_tags(&self, project_id: ProjectId, use_tags: bool) -> Result<()> {
        let result = sqlx::query("UPDATE project SET use_tags = $2 WHERE id = $1")
            .bind(project_id)
            .bind(use_tags)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::ProjectNotFound(project_id));
        }
        Ok(())
    }

    pub async fn delete_project(&self, project_id: ProjectId) -> Result<()> {
        sqlx::query("DELETE FROM project WHERE id = $1")
            .bind(project_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    /// Define a tag. Without an explicit pattern the tag matches its own name.
    pub async fn create_tag(
        &self,
        project_id: ProjectId,
        name: &str,
        pattern: Option<&str>,
    ) -> Result<TagId> {
        validate_tag_name(name).map_err(Error::InvalidInput)?;
        let pattern = match pattern {
            Some(p) => p.to_string(),
            None => Tag::named(0, project_id, name).pattern,
        };

        let row = sqlx::query(
            "INSERT INTO tag (project_id, name, pattern) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(project_id)
        .bind(name)
        .bind(pattern)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.get("id"))
    }

    /// Remove a tag definition and every aggregated row of it.
    pub async fn delete_tag(&self, tag_id: TagId) -> Result<()> {
        sqlx::query("DELETE FROM tag WHERE id = $1")
            .bind(tag_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Series
    // -------------------------------------------------------------------------

    pub async fn create_series(
        &self,
        project_id: ProjectId,
        total: i32,
        cover_expected: bool,
    ) -> Result<SeriesId> {
        let row = sqlx::query(
            "INSERT INTO series (project_id, total, cover_expected) VALUES ($1, $2, $3)
             RETURNING id",
        )
        .bind(project_id)
        .bind(total)
        .bind(cover_expected)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.get("id"))
    }

    /// Record that a message-id belongs to a series.
    pub async fn add_series_reference(
        &self,
        project_id: ProjectId,
        series_id: SeriesId,
        msgid: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO series_reference (project_id, series_id, msgid) VALUES ($1, $2, $3)
             ON CONFLICT (project_id, msgid) DO NOTHING",
        )
        .bind(project_id)
        .bind(series_id)
        .bind(msgid)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Submissions and comments
    // -------------------------------------------------------------------------

    pub async fn insert_submission(&self, req: CreateSubmissionRequest) -> Result<SubmissionId> {
        let row = sqlx::query(
            r#"
            INSERT INTO submission
                (project_id, kind, msgid, content, in_reply_to, refs, series_id, number, date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(req.project_id)
        .bind(req.kind.to_string())
        .bind(&req.msgid)
        .bind(&req.content)
        .bind(&req.in_reply_to)
        .bind(&req.references)
        .bind(req.series_id)
        .bind(req.number)
        .bind(req.date)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.get("id"))
    }

    pub async fn update_submission_content(
        &self,
        id: SubmissionId,
        content: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE submission SET content = $2 WHERE id = $1")
            .bind(id)
            .bind(content)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::SubmissionNotFound(id));
        }
        Ok(())
    }

    /// Delete a submission. Comments and aggregated rows cascade.
    pub async fn delete_submission(&self, id: SubmissionId) -> Result<()> {
        sqlx::query("DELETE FROM submission WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    pub async fn insert_comment(
        &self,
        submission_id: SubmissionId,
        msgid: &str,
        content: Option<&str>,
        date: DateTime<Utc>,
    ) -> Result<CommentId> {
        let row = sqlx::query(
            "INSERT INTO comment (submission_id, msgid, content, date) VALUES ($1, $2, $3, $4)
             RETURNING id",
        )
        .bind(submission_id)
        .bind(msgid)
        .bind(content)
        .bind(date)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.get("id"))
    }

    pub async fn update_comment_content(&self, id: CommentId, content: Option<&str>) -> Result<()> {
        let result = sqlx::query("UPDATE comment SET content = $2 WHERE id = $1")
            .bind(id)
            .bind(content)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::CommentNotFound(id));
        }
        Ok(())
    }

    pub async fn delete_comment(&self, id: CommentId) -> Result<()> {
        sqlx::query("DELETE FROM comment WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }
}

fn submission_from_row(row: &PgRow) -> Result<Submission> {
    let kind: String = row.get("kind");
    Ok(Submission {
        id: row.get("id"),
        project_id: row.get("project_id"),
        kind: kind.parse().map_err(Error::Internal)?,
        msgid: row.get("msgid"),
        content: row.get("content"),
        in_reply_to: row.get("in_reply_to"),
        references: row.get("refs"),
        series_id: row.get("series_id"),
        number: row.get("number"),
        date: row.get("date"),
    })
}

fn comment_from_row(row: &PgRow) -> Comment {
    Comment {
        id: row.get("id"),
        submission_id: row.get("submission_id"),
        msgid: row.get("msgid"),
        content: row.get("content"),
        date: row.get("date"),
    }
}

#[async_trait]
impl SubmissionSource for PgSubmissionRepository {
    async fn project(&self, id: ProjectId) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT id, name, use_tags FROM project WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(row.map(|row| Project {
            id: row.get("id"),
            name: row.get("name"),
            use_tags: row.get("use_tags"),
        }))
    }

    async fn tags_for_project(&self, project_id: ProjectId) -> Result<Vec<Tag>> {
        let rows = sqlx::query(
            "SELECT id, project_id, name, pattern FROM tag WHERE project_id = $1 ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| Tag {
                id: row.get("id"),
                project_id: row.get("project_id"),
                name: row.get("name"),
                pattern: row.get("pattern"),
            })
            .collect())
    }

    async fn submission(&self, id: SubmissionId) -> Result<Option<Submission>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM submission WHERE id = $1",
            SUBMISSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(submission_from_row).transpose()
    }

    async fn comments(&self, submission_id: SubmissionId) -> Result<Vec<Comment>> {
        let rows = sqlx::query(
            "SELECT id, submission_id, msgid, content, date FROM comment
             WHERE submission_id = $1 ORDER BY date, id",
        )
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(comment_from_row).collect())
    }

    async fn comment(&self, id: CommentId) -> Result<Option<Comment>> {
        let row = sqlx::query(
            "SELECT id, submission_id, msgid, content, date FROM comment WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.as_ref().map(comment_from_row))
    }

    async fn series(&self, id: SeriesId) -> Result<Option<Series>> {
        let row = sqlx::query(
            r#"
            SELECT
                s.id,
                s.project_id,
                s.total,
                s.cover_expected,
                (SELECT c.id FROM submission c
                 WHERE c.series_id = s.id AND c.kind = 'cover_letter'
                 ORDER BY c.id LIMIT 1) AS cover_letter_id,
                COALESCE(
                    (SELECT ARRAY_AGG(DISTINCT p.number ORDER BY p.number) FROM submission p
                     WHERE p.series_id = s.id AND p.kind = 'patch' AND p.number IS NOT NULL),
                    '{}'::INTEGER[]
                ) AS patch_numbers
            FROM series s
            WHERE s.id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|row| Series {
            id: row.get("id"),
            project_id: row.get("project_id"),
            total: row.get("total"),
            cover_letter_id: row.get("cover_letter_id"),
            cover_expected: row.get("cover_expected"),
            patch_numbers: row.get("patch_numbers"),
        }))
    }

    async fn series_patches(&self, series_id: SeriesId) -> Result<Vec<Submission>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM submission WHERE series_id = $1 AND kind = 'patch'
             ORDER BY number NULLS LAST, id",
            SUBMISSION_COLUMNS
        ))
        .bind(series_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(submission_from_row).collect()
    }

    async fn series_by_reference(
        &self,
        project_id: ProjectId,
        msgid: &str,
    ) -> Result<Option<SeriesId>> {
        let row = sqlx::query(
            "SELECT series_id FROM series_reference WHERE project_id = $1 AND msgid = $2",
        )
        .bind(project_id)
        .bind(msgid)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|row| row.get("series_id")))
    }

    async fn series_reference_msgids(&self, series_id: SeriesId) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT msgid FROM series_reference WHERE series_id = $1 ORDER BY msgid",
        )
        .bind(series_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(|row| row.get("msgid")).collect())
    }

    async fn submission_by_msgid(
        &self,
        project_id: ProjectId,
        msgid: &str,
    ) -> Result<Option<Submission>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM submission WHERE project_id = $1 AND msgid = $2",
            SUBMISSION_COLUMNS
        ))
        .bind(project_id)
        .bind(msgid)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(submission_from_row).transpose()
    }

    async fn submissions_referencing(
        &self,
        project_id: ProjectId,
        msgid: &str,
    ) -> Result<Vec<Submission>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM submission
             WHERE project_id = $1 AND (in_reply_to = $2 OR $2 = ANY(refs))
             ORDER BY id",
            SUBMISSION_COLUMNS
        ))
        .bind(project_id)
        .bind(msgid)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(submission_from_row).collect()
    }

    async fn list_submission_ids(
        &self,
        project_id: Option<ProjectId>,
    ) -> Result<Vec<SubmissionId>> {
        let rows = sqlx::query(
            "SELECT id FROM submission WHERE ($1::BIGINT IS NULL OR project_id = $1) ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }
}
