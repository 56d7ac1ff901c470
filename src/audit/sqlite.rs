use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{migrate::MigrateDatabase, Row, SqlitePool};
use tracing::info;

use super::outbox::{BatchStatus, Outbox, OutboxBatch, OutboxError};
use crate::domain::{UnitTag, VersionToken};

impl From<sqlx::Error> for OutboxError {
    fn from(err: sqlx::Error) -> Self {
        OutboxError::Database(err.to_string())
    }
}

/// Outbox kept in a SQLite database, for deployments that already run one.
pub struct SqliteOutbox {
    pool: SqlitePool,
}

impl SqliteOutbox {
    /// Open (creating if needed) the database and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self, OutboxError> {
        if !sqlx::Sqlite::database_exists(database_url).await? {
            info!("Creating outbox database at {}", database_url);
            sqlx::Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePool::connect(database_url).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| OutboxError::Database(err.to_string()))?;
        info!("Outbox database migrations completed");

        Ok(Self { pool })
    }

    pub async fn shutdown(&self) {
        self.pool.close().await;
    }

    async fn with_status(&self, status: BatchStatus) -> Result<Vec<OutboxBatch>, OutboxError> {
        let rows = sqlx::query(
            r#"
            SELECT batch_id, unit_tag, version, staged_at, staged_by, events, flushed
            FROM audit_outbox
            WHERE status = ?1
            ORDER BY seq ASC
            "#,
        )
        .bind(status_name(status))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<OutboxBatch, OutboxError> {
                let staged_at: String = row.get("staged_at");
                let events: String = row.get("events");
                Ok(OutboxBatch {
                    id: row.get("batch_id"),
                    unit_tag: UnitTag::new(row.get::<String, _>("unit_tag")),
                    version: VersionToken(row.get("version")),
                    status,
                    staged_at: DateTime::parse_from_rfc3339(&staged_at)
                        .map_err(|err| OutboxError::Corrupt(err.to_string()))?
                        .with_timezone(&Utc),
                    staged_by: row.get("staged_by"),
                    events: serde_json::from_str(&events)?,
                    flushed: row.get::<i64, _>("flushed").max(0) as usize,
                })
            })
            .collect()
    }

    async fn delete(&self, batch_id: &str) -> Result<(), OutboxError> {
        let deleted = sqlx::query("DELETE FROM audit_outbox WHERE batch_id = ?1")
            .bind(batch_id)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(OutboxError::NotFound(batch_id.to_string()));
        }
        Ok(())
    }
}

fn status_name(status: BatchStatus) -> &'static str {
    match status {
        BatchStatus::Staged => "staged",
        BatchStatus::Committed => "committed",
    }
}

#[async_trait]
impl Outbox for SqliteOutbox {
    async fn stage(&self, batch: OutboxBatch) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            INSERT INTO audit_outbox (batch_id, unit_tag, version, status, staged_at, staged_by, events)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&batch.id)
        .bind(batch.unit_tag.as_str())
        .bind(batch.version.as_str())
        .bind(status_name(batch.status))
        .bind(batch.staged_at.to_rfc3339())
        .bind(&batch.staged_by)
        .bind(serde_json::to_string(&batch.events)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_committed(&self, batch_id: &str) -> Result<(), OutboxError> {
        let updated = sqlx::query("UPDATE audit_outbox SET status = 'committed' WHERE batch_id = ?1")
            .bind(batch_id)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(OutboxError::NotFound(batch_id.to_string()));
        }
        Ok(())
    }

    async fn mark_aborted(&self, batch_id: &str) -> Result<(), OutboxError> {
        self.delete(batch_id).await
    }

    async fn mark_progress(&self, batch_id: &str, flushed: usize) -> Result<(), OutboxError> {
        let updated = sqlx::query("UPDATE audit_outbox SET flushed = ?2 WHERE batch_id = ?1")
            .bind(batch_id)
            .bind(flushed as i64)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(OutboxError::NotFound(batch_id.to_string()));
        }
        Ok(())
    }

    async fn mark_flushed(&self, batch_id: &str) -> Result<(), OutboxError> {
        self.delete(batch_id).await
    }

    async fn staged(&self) -> Result<Vec<OutboxBatch>, OutboxError> {
        self.with_status(BatchStatus::Staged).await
    }

    async fn committed(&self) -> Result<Vec<OutboxBatch>, OutboxError> {
        self.with_status(BatchStatus::Committed).await
    }
}
