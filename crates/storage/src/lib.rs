use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ChatId, MessageId, ReadPosition};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to `sqlite::memory:` opens its own database.
        let max_connections = if is_memory_url(database_url) { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Upserts the marker only when it moves forward in `(time, id)` order.
    /// Returns whether the stored row changed.
    pub async fn save_read_position(&self, position: &ReadPosition) -> Result<bool> {
        let affected = sqlx::query(
            "INSERT INTO read_positions (chat_id, last_read_message_id, last_read_time_ms, updated_at)
             VALUES (?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(chat_id) DO UPDATE SET
                last_read_message_id = excluded.last_read_message_id,
                last_read_time_ms = excluded.last_read_time_ms,
                updated_at = CURRENT_TIMESTAMP
             WHERE excluded.last_read_time_ms > read_positions.last_read_time_ms
                OR (excluded.last_read_time_ms = read_positions.last_read_time_ms
                    AND excluded.last_read_message_id > read_positions.last_read_message_id)",
        )
        .bind(position.chat_id.as_str())
        .bind(position.last_read_message_id.as_str())
        .bind(position.last_read_time.timestamp_millis())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save read position for chat {}", position.chat_id))?
        .rows_affected();
        Ok(affected > 0)
    }

    pub async fn load_read_position(&self, chat_id: &ChatId) -> Result<Option<ReadPosition>> {
        let row = sqlx::query(
            "SELECT chat_id, last_read_message_id, last_read_time_ms
             FROM read_positions
             WHERE chat_id = ?",
        )
        .bind(chat_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| read_position_from_row(&r)).transpose()
    }

    pub async fn list_read_positions(&self) -> Result<Vec<ReadPosition>> {
        let rows = sqlx::query(
            "SELECT chat_id, last_read_message_id, last_read_time_ms
             FROM read_positions
             ORDER BY chat_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(read_position_from_row).collect()
    }

    pub async fn clear_read_position(&self, chat_id: &ChatId) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM read_positions WHERE chat_id = ?")
            .bind(chat_id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }
}

fn read_position_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ReadPosition> {
    let millis = row.get::<i64, _>(2);
    let last_read_time = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| anyhow!("read position timestamp out of range: {millis}"))?;
    Ok(ReadPosition {
        chat_id: ChatId(row.get::<String, _>(0)),
        last_read_message_id: MessageId(row.get::<String, _>(1)),
        last_read_time,
    })
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
