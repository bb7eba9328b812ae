use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};

use super::format_timestamp;
use crate::error::StoreError;

/// Durable record of server notifications that have already been applied.
#[derive(Clone)]
pub struct NotificationLog {
    pool: SqlitePool,
}

impl NotificationLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn is_processed(&self, request_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::is_processed_in(&mut conn, request_id).await
    }

    pub(crate) async fn is_processed_in(
        conn: &mut SqliteConnection,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM processed_notifications WHERE request_id = ?)",
        )
        .bind(request_id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(exists)
    }

    /// Records a request id; returns false if it was already present.
    pub(crate) async fn record_in(
        conn: &mut SqliteConnection,
        request_id: &str,
        entity_name: &str,
        kind: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO processed_notifications (request_id, entity_name, kind, processed_at) VALUES (?, ?, ?, ?)",
        )
        .bind(request_id)
        .bind(entity_name)
        .bind(kind)
        .bind(format_timestamp(Utc::now()))
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn record(
        &self,
        request_id: &str,
        entity_name: &str,
        kind: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::record_in(&mut conn, request_id, entity_name, kind).await
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM processed_notifications")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
