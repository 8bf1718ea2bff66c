use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{str::FromStr, sync::Arc};
use tokio::sync::Mutex;
use tracing::debug;

use shared::domain::{MessageId, SessionKey};

/// Credential store shared by every session.
///
/// Reads go straight to the pool; writes serialize behind one process-wide lock.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    write_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub session_key: SessionKey,
    pub username: String,
    pub token: String,
    pub cursor: MessageId,
    pub roster_initialized: bool,
    pub updated_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // One connection keeps an in-memory database coherent.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Creates the record or replaces username and token, keeping cursor and roster flag.
    pub async fn upsert_credentials(
        &self,
        session_key: &SessionKey,
        username: &str,
        token: &str,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO credentials (session_key, username, token, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(session_key) DO UPDATE SET
                username=excluded.username,
                token=excluded.token,
                updated_at=excluded.updated_at",
        )
        .bind(session_key.as_str())
        .bind(username)
        .bind(token)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert credentials for {session_key}"))?;
        debug!(session = %session_key, "credentials stored");
        Ok(())
    }

    pub async fn load_credentials(&self, session_key: &SessionKey) -> Result<Option<CredentialRecord>> {
        let row = sqlx::query(
            "SELECT session_key, username, token, cursor, roster_initialized, updated_at
             FROM credentials WHERE session_key = ?",
        )
        .bind(session_key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| record_from_row(&row)).transpose()
    }

    pub async fn list_credentials(&self) -> Result<Vec<CredentialRecord>> {
        let rows = sqlx::query(
            "SELECT session_key, username, token, cursor, roster_initialized, updated_at
             FROM credentials ORDER BY session_key",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn update_token(&self, session_key: &SessionKey, token: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("UPDATE credentials SET token = ?, updated_at = ? WHERE session_key = ?")
            .bind(token)
            .bind(Utc::now())
            .bind(session_key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Advances the stored cursor; a smaller value never overwrites a larger one.
    pub async fn update_cursor(&self, session_key: &SessionKey, cursor: MessageId) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE credentials SET cursor = MAX(cursor, ?), updated_at = ? WHERE session_key = ?",
        )
        .bind(cursor.0)
        .bind(Utc::now())
        .bind(session_key.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Operator override; unlike `update_cursor` this may move the cursor backwards.
    pub async fn reset_cursor(&self, session_key: &SessionKey) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("UPDATE credentials SET cursor = 0, updated_at = ? WHERE session_key = ?")
            .bind(Utc::now())
            .bind(session_key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_roster_initialized(&self, session_key: &SessionKey, initialized: bool) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE credentials SET roster_initialized = ?, updated_at = ? WHERE session_key = ?",
        )
        .bind(initialized)
        .bind(Utc::now())
        .bind(session_key.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_credentials(&self, session_key: &SessionKey) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM credentials WHERE session_key = ?")
            .bind(session_key.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete credentials for {session_key}"))?;
        Ok(result.rows_affected() > 0)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<CredentialRecord> {
    Ok(CredentialRecord {
        session_key: SessionKey(row.try_get("session_key")?),
        username: row.try_get("username")?,
        token: row.try_get("token")?,
        cursor: MessageId(row.try_get("cursor")?),
        roster_initialized: row.try_get("roster_initialized")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
