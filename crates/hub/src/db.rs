//! Embedded relational store (spec §6.3): `auth`, `sessions`, `audit`.
//!
//! Grounded in `other_examples`'s sqlx-over-sqlite session-store pattern:
//! a `SqlitePool` opened with WAL journaling, row structs derived via
//! `sqlx::FromRow`, plain `query`/`query_as` (no compile-time `query!` macro,
//! since there is no live database at build time for an env-driven tool).

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;

#[derive(Debug, Clone, FromRow)]
pub struct AuthRecord {
    pub hash: String,
    pub iterations: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub id: String,
    pub worker_name: String,
    pub worker_key: String,
    pub display_name: String,
    pub created_at: i64,
    pub last_active_at: i64,
    pub output: String,
}

/// Durable store backing the Session and Principal entities (spec §3).
///
/// Output-tail writes are coalesced in memory by [`crate::room::Hub`] and
/// only reach this store on the ~2s debounce or on graceful shutdown; this
/// type itself always writes synchronously within a single transaction, so
/// callers never observe a half-persisted session.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .with_context(|| format!("invalid database path {path}"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await
            .context("failed to open sqlite database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS auth (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                hash TEXT NOT NULL,
                iterations INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                worker_name TEXT NOT NULL,
                worker_key TEXT NOT NULL,
                display_name TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_active_at INTEGER NOT NULL,
                output TEXT NOT NULL DEFAULT ''
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                event TEXT NOT NULL,
                data TEXT NOT NULL,
                user_id TEXT,
                worker_id TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // -- auth (C1) ---------------------------------------------------

    pub async fn load_auth(&self) -> Result<Option<AuthRecord>> {
        let row = sqlx::query_as::<_, AuthRecord>(
            "SELECT hash, iterations, updated_at FROM auth WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn save_auth(&self, hash: &str, iterations: u32) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO auth (id, hash, iterations, updated_at) VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET hash = excluded.hash, iterations = excluded.iterations,
                updated_at = excluded.updated_at",
        )
        .bind(hash)
        .bind(iterations as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- sessions (C2) ------------------------------------------------

    /// Atomically create a session row. `id` must be unique; callers check
    /// uniqueness against the in-memory registry before calling this so a
    /// session is never half-persisted.
    pub async fn create_session(
        &self,
        id: &str,
        worker_name: &str,
        worker_key: &str,
        display_name: &str,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO sessions (id, worker_name, worker_key, display_name, created_at,
                last_active_at, output) VALUES (?1, ?2, ?3, ?4, ?5, ?5, '')",
        )
        .bind(id)
        .bind(worker_name)
        .bind(worker_key)
        .bind(display_name)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn rename_session(&self, id: &str, display_name: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET display_name = ?1 WHERE id = ?2")
            .bind(display_name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_last_active(&self, id: &str, ts: i64) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_active_at = ?1 WHERE id = ?2")
            .bind(ts)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Overwrite the stored output tail. Called from the coalesced flusher,
    /// never on every `append_output` (spec §4.2).
    pub async fn write_output(&self, id: &str, tail: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET output = ?1 WHERE id = ?2")
            .bind(tail)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_all_sessions(&self) -> Result<Vec<SessionRow>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT id, worker_name, worker_key, display_name, created_at, last_active_at, output
             FROM sessions",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_output(&self, id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT output FROM sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(o,)| o))
    }

    // -- audit ----------------------------------------------------------

    pub async fn append_audit(
        &self,
        event: &str,
        data: &serde_json::Value,
        user_id: Option<&str>,
        worker_id: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO audit (ts, event, data, user_id, worker_id) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(now)
        .bind(event)
        .bind(data.to_string())
        .bind(user_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> Store {
        Store::open(":memory:").await.expect("open in-memory store")
    }

    #[tokio::test]
    async fn fresh_store_has_no_auth_record() {
        let store = memory_store().await;
        assert!(store.load_auth().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_and_load_auth_roundtrips() {
        let store = memory_store().await;
        store.save_auth("hashvalue", 150_000).await.unwrap();
        let record = store.load_auth().await.unwrap().unwrap();
        assert_eq!(record.hash, "hashvalue");
        assert_eq!(record.iterations, 150_000);
    }

    #[tokio::test]
    async fn save_auth_is_idempotent_upsert() {
        let store = memory_store().await;
        store.save_auth("first", 150_000).await.unwrap();
        store.save_auth("second", 200_000).await.unwrap();
        let record = store.load_auth().await.unwrap().unwrap();
        assert_eq!(record.hash, "second");
        assert_eq!(record.iterations, 200_000);
    }

    #[tokio::test]
    async fn create_and_load_session() {
        let store = memory_store().await;
        store
            .create_session("s-1", "worker1", "worker1", "tty")
            .await
            .unwrap();
        let all = store.load_all_sessions().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "s-1");
        assert_eq!(all[0].display_name, "tty");
    }

    #[tokio::test]
    async fn rename_session_updates_display_name() {
        let store = memory_store().await;
        store
            .create_session("s-1", "worker1", "worker1", "tty")
            .await
            .unwrap();
        store.rename_session("s-1", "renamed").await.unwrap();
        let all = store.load_all_sessions().await.unwrap();
        assert_eq!(all[0].display_name, "renamed");
    }

    #[tokio::test]
    async fn delete_session_removes_it() {
        let store = memory_store().await;
        store
            .create_session("s-1", "worker1", "worker1", "tty")
            .await
            .unwrap();
        store.delete_session("s-1").await.unwrap();
        assert!(store.load_all_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_and_get_output() {
        let store = memory_store().await;
        store
            .create_session("s-1", "worker1", "worker1", "tty")
            .await
            .unwrap();
        store.write_output("s-1", "hello\n").await.unwrap();
        assert_eq!(store.get_output("s-1").await.unwrap().unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn audit_entries_are_append_only_inserts() {
        let store = memory_store().await;
        store
            .append_audit(
                "login_success",
                &serde_json::json!({"user": "admin"}),
                Some("admin"),
                None,
            )
            .await
            .unwrap();
        // No update/delete API exists for audit rows by design; presence of
        // this insert succeeding is the observable contract.
    }
}
