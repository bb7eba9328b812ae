mod entity_repo;
mod notification_repo;
mod outbox_repo;

pub use entity_repo::EntityStore;
pub(crate) use entity_repo::upsert_server_record;
pub use notification_repo::NotificationLog;
pub use outbox_repo::{ClaimedBatch, NewOutboxEntry, OutboxCounts, OutboxRepository};
pub(crate) use outbox_repo::{append_entry, has_unpushed_for_record, mark_batch_pushed};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::StoreError;

/// Initialize the database connection pool and run migrations.
///
/// The pool holds a single connection: every mutation, including its outbox
/// append, is serialized through it.
pub async fn init_db(path: &Path) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
    }

    let db_url = format!("sqlite:{}?mode=rwc", path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .foreign_keys(true)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Returns the stable device identifier, generating one on first use.
pub async fn load_or_create_device_id(pool: &SqlitePool) -> Result<String, StoreError> {
    let existing: Option<(String,)> =
        sqlx::query_as("SELECT device_id FROM device_identity WHERE id = 1")
            .fetch_optional(pool)
            .await?;

    if let Some((device_id,)) = existing {
        return Ok(device_id);
    }

    let device_id = Uuid::new_v4().to_string();
    sqlx::query("INSERT OR IGNORE INTO device_identity (id, device_id, created_at) VALUES (1, ?, ?)")
        .bind(&device_id)
        .bind(format_timestamp(Utc::now()))
        .execute(pool)
        .await?;

    // Another writer may have won the insert.
    let (device_id,): (String,) =
        sqlx::query_as("SELECT device_id FROM device_identity WHERE id = 1")
            .fetch_one(pool)
            .await?;
    Ok(device_id)
}

/// Fixed-width RFC 3339 so stored timestamps compare lexicographically.
pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(table: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table: table.to_string(),
            reason: format!("bad timestamp '{}': {}", raw, e),
        })
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_init_db_creates_tables() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("test.db");

        let pool = init_db(&db_path).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(table_names.contains(&"outbox"));
        assert!(table_names.contains(&"processed_notifications"));
        for table in crate::models::Table::ENTITY_TABLES {
            assert!(table_names.contains(&table.name()), "missing {}", table);
        }
    }

    #[tokio::test]
    async fn test_device_id_is_stable() {
        let db = test_support::setup_db().await;
        let first = load_or_create_device_id(&db.pool).await.unwrap();
        let second = load_or_create_device_id(&db.pool).await.unwrap();
        assert_eq!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let dt = DateTime::parse_from_rfc3339("2025-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(dt), "2025-03-01T10:00:00.000Z");
        assert_eq!(parse_timestamp("t", "2025-03-01T10:00:00.000Z").unwrap(), dt);
        assert!(parse_timestamp("t", "yesterday").is_err());
    }
}
