//! Durable ticket -> transfer-row map backing crash recovery.
//!
//! The store is a flat key-value map keyed by ticket with secondary lookups
//! by owner (prefix match), by state, and by interface. It exposes no
//! transactions: every operation is a single point write or point/secondary
//! read, matching spec.md §4.1. Any store exposing the operations below is
//! conformant; this is a `sqlx`-backed SQLite implementation chosen for a
//! single-writer, single-device background service (the teacher's own
//! `snow-owl-db` targets Postgres for a multi-client deployment server; a
//! local durable map has no use for a network database here).

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};
use transit_core::{InterfaceId, Ticket, TransferState};

/// Schema sentinel compared at open; a mismatch (or a missing sentinel on a
/// non-empty table) triggers a drop-and-recreate of the history table.
/// History is recoverable state, never authoritative business data.
const SCHEMA_VERSION: &str = "transit-1";

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("history store integrity check failed: {0}")]
    Integrity(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One durable row: `(ticket, owner, interface_name, state, record_blob)`.
#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub ticket: Ticket,
    pub owner: String,
    pub interface: String,
    pub state: TransferState,
    pub record_blob: String,
}

#[derive(sqlx::FromRow)]
struct RawRow {
    ticket: i64,
    owner: String,
    interface: String,
    state: String,
    record_blob: String,
}

impl TryFrom<RawRow> for HistoryRow {
    type Error = Error;

    fn try_from(r: RawRow) -> Result<Self> {
        let state = TransferState::from_str(&r.state)
            .map_err(|e| Error::Integrity(format!("row {}: {e}", r.ticket)))?;
        Ok(HistoryRow {
            ticket: r.ticket as u64,
            owner: r.owner,
            interface: r.interface,
            state,
            record_blob: r.record_blob,
        })
    }
}

pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    /// Open (creating if necessary) the history store at `path`. Verifies
    /// the schema sentinel and runs an integrity check; on failure the
    /// table is dropped and recreated, losing all history. This is
    /// intentional (spec.md §4.1): resume-across-restart is lost, but the
    /// orchestrator can still operate without history.
    pub async fn open(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }

        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1) // single-writer, as spec.md §4.1 requires
            .connect(&url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// In-memory store, for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn create_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfer_history (
                ticket INTEGER PRIMARY KEY,
                owner TEXT NOT NULL,
                interface TEXT NOT NULL,
                state TEXT NOT NULL,
                record_blob TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn drop_and_recreate(&self) -> Result<()> {
        warn!("history store failed its integrity check; dropping and recreating");
        sqlx::query("DROP TABLE IF EXISTS transfer_history")
            .execute(&self.pool)
            .await?;
        self.create_table().await?;
        sqlx::query(
            "INSERT INTO transfer_history (ticket, owner, interface, state, record_blob) VALUES (0, '', '', 'init', ?)",
        )
        .bind(SCHEMA_VERSION)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.create_table().await?;

        let sentinel: Option<(String,)> =
            sqlx::query_as("SELECT record_blob FROM transfer_history WHERE ticket = 0")
                .fetch_optional(&self.pool)
                .await?;

        let needs_recreate = match sentinel {
            None => {
                sqlx::query(
                    "INSERT INTO transfer_history (ticket, owner, interface, state, record_blob) VALUES (0, '', '', 'init', ?)",
                )
                .bind(SCHEMA_VERSION)
                .execute(&self.pool)
                .await?;
                false
            }
            Some((version,)) => version != SCHEMA_VERSION,
        };

        if needs_recreate {
            self.drop_and_recreate().await?;
        }

        let integrity: (String,) = sqlx::query_as("PRAGMA integrity_check")
            .fetch_one(&self.pool)
            .await?;
        if integrity.0 != "ok" {
            self.drop_and_recreate().await.map_err(|e| {
                Error::Integrity(format!("recreate after failed integrity check also failed: {e}"))
            })?;
        }

        info!("history store opened, schema version {}", SCHEMA_VERSION);
        Ok(())
    }

    /// Replace-by-primary-key write. Concurrent upserts for the same
    /// ticket serialize through the pool's single connection.
    pub async fn upsert(&self, row: &HistoryRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transfer_history (ticket, owner, interface, state, record_blob)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(ticket) DO UPDATE SET
                owner = excluded.owner,
                interface = excluded.interface,
                state = excluded.state,
                record_blob = excluded.record_blob
            "#,
        )
        .bind(row.ticket as i64)
        .bind(&row.owner)
        .bind(&row.interface)
        .bind(row.state.as_str())
        .bind(&row.record_blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, ticket: Ticket) -> Result<Option<HistoryRow>> {
        let row: Option<RawRow> =
            sqlx::query_as("SELECT ticket, owner, interface, state, record_blob FROM transfer_history WHERE ticket = ?")
                .bind(ticket as i64)
                .fetch_optional(&self.pool)
                .await?;
        row.map(HistoryRow::try_from).transpose()
    }

    /// Secondary scan by owner prefix. Returns a snapshot: callers must not
    /// assume it stays current by the time they act on it.
    pub async fn by_owner_prefix(&self, prefix: &str) -> Result<Vec<HistoryRow>> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows: Vec<RawRow> = sqlx::query_as(
            "SELECT ticket, owner, interface, state, record_blob FROM transfer_history WHERE ticket != 0 AND owner LIKE ? ESCAPE '\\'",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(HistoryRow::try_from).collect()
    }

    pub async fn by_state(&self, state: TransferState) -> Result<Vec<HistoryRow>> {
        let rows: Vec<RawRow> = sqlx::query_as(
            "SELECT ticket, owner, interface, state, record_blob FROM transfer_history WHERE ticket != 0 AND state = ?",
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(HistoryRow::try_from).collect()
    }

    pub async fn by_interface(&self, interface: &InterfaceId) -> Result<Vec<HistoryRow>> {
        let rows: Vec<RawRow> = sqlx::query_as(
            "SELECT ticket, owner, interface, state, record_blob FROM transfer_history WHERE ticket != 0 AND interface = ?",
        )
        .bind(interface.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(HistoryRow::try_from).collect()
    }

    pub async fn by_state_and_interface(
        &self,
        state: TransferState,
        interface: &InterfaceId,
    ) -> Result<Vec<HistoryRow>> {
        let rows: Vec<RawRow> = sqlx::query_as(
            "SELECT ticket, owner, interface, state, record_blob FROM transfer_history WHERE ticket != 0 AND state = ? AND interface = ?",
        )
        .bind(state.as_str())
        .bind(interface.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(HistoryRow::try_from).collect()
    }

    /// Bulk rewrite, used at startup to cancel every `running`, `queued`,
    /// or `interrupted` row before new admission begins (spec.md §3, §8).
    pub async fn rewrite_state(&self, old: TransferState, new: TransferState) -> Result<u64> {
        let result = sqlx::query("UPDATE transfer_history SET state = ? WHERE ticket != 0 AND state = ?")
            .bind(new.as_str())
            .bind(old.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_by_ticket(&self, ticket: Ticket) -> Result<()> {
        sqlx::query("DELETE FROM transfer_history WHERE ticket = ?")
            .bind(ticket as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_by_owner(&self, owner: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM transfer_history WHERE ticket != 0 AND owner = ?")
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_by_owner_prefix(&self, prefix: &str) -> Result<u64> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let result = sqlx::query(
            "DELETE FROM transfer_history WHERE ticket != 0 AND owner LIKE ? ESCAPE '\\'",
        )
        .bind(pattern)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Restart recovery (spec.md §3, §8, §9): rewrite every `running`,
    /// `queued`, or `interrupted` row to `cancelled` before any new
    /// admission is allowed. A conservative choice that trades resumable
    /// work for a known starting state; returns the number of rows
    /// rewritten.
    pub async fn cancel_unfinished_on_startup(&self) -> Result<u64> {
        let mut total = 0;
        for state in [TransferState::Running, TransferState::Queued, TransferState::Interrupted] {
            total += self.rewrite_state(state, TransferState::Cancelled).await?;
        }
        Ok(total)
    }

    /// `max(existing_ticket)`, used to seed the ticket generator at
    /// `max_ticket() + 1` on process start.
    pub async fn max_ticket(&self) -> Result<Ticket> {
        let row = sqlx::query("SELECT COALESCE(MAX(ticket), 0) AS m FROM transfer_history WHERE ticket != 0")
            .fetch_one(&self.pool)
            .await?;
        let m: i64 = row.try_get("m")?;
        Ok(m as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ticket: Ticket, owner: &str, state: TransferState) -> HistoryRow {
        HistoryRow {
            ticket,
            owner: owner.to_string(),
            interface: "wifi".to_string(),
            state,
            record_blob: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_and_get_round_trip() {
        let store = HistoryStore::open_in_memory().await.unwrap();
        store.upsert(&row(1, "app.a", TransferState::Running)).await.unwrap();
        let got = store.get(1).await.unwrap().unwrap();
        assert_eq!(got.owner, "app.a");
        assert_eq!(got.state, TransferState::Running);
    }

    #[tokio::test]
    async fn upsert_replaces_by_primary_key() {
        let store = HistoryStore::open_in_memory().await.unwrap();
        store.upsert(&row(1, "app.a", TransferState::Queued)).await.unwrap();
        store.upsert(&row(1, "app.a", TransferState::Running)).await.unwrap();
        let rows = store.by_state(TransferState::Queued).await.unwrap();
        assert!(rows.is_empty());
        let rows = store.by_state(TransferState::Running).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn max_ticket_ignores_sentinel() {
        let store = HistoryStore::open_in_memory().await.unwrap();
        assert_eq!(store.max_ticket().await.unwrap(), 0);
        store.upsert(&row(7, "app.a", TransferState::Completed)).await.unwrap();
        assert_eq!(store.max_ticket().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn rewrite_state_is_bulk_and_scoped() {
        let store = HistoryStore::open_in_memory().await.unwrap();
        store.upsert(&row(1, "app.a", TransferState::Running)).await.unwrap();
        store.upsert(&row(2, "app.a", TransferState::Queued)).await.unwrap();
        store.upsert(&row(3, "app.a", TransferState::Completed)).await.unwrap();

        let n = store
            .rewrite_state(TransferState::Running, TransferState::Cancelled)
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.get(1).await.unwrap().unwrap().state, TransferState::Cancelled);
        assert_eq!(store.get(3).await.unwrap().unwrap().state, TransferState::Completed);
    }

    #[tokio::test]
    async fn owner_prefix_scan() {
        let store = HistoryStore::open_in_memory().await.unwrap();
        store.upsert(&row(1, "com.app.one", TransferState::Running)).await.unwrap();
        store.upsert(&row(2, "com.app.two", TransferState::Running)).await.unwrap();
        store.upsert(&row(3, "com.other", TransferState::Running)).await.unwrap();

        let rows = store.by_owner_prefix("com.app").await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn startup_recovery_cancels_running_queued_and_interrupted_only() {
        let store = HistoryStore::open_in_memory().await.unwrap();
        store.upsert(&row(1, "app.a", TransferState::Running)).await.unwrap();
        store.upsert(&row(2, "app.a", TransferState::Queued)).await.unwrap();
        store.upsert(&row(3, "app.a", TransferState::Interrupted)).await.unwrap();
        store.upsert(&row(4, "app.a", TransferState::Completed)).await.unwrap();
        store.upsert(&row(5, "app.a", TransferState::Cancelled)).await.unwrap();

        let n = store.cancel_unfinished_on_startup().await.unwrap();
        assert_eq!(n, 3);
        for ticket in [1, 2, 3, 5] {
            assert_eq!(store.get(ticket).await.unwrap().unwrap().state, TransferState::Cancelled);
        }
        assert_eq!(store.get(4).await.unwrap().unwrap().state, TransferState::Completed);
    }

    #[tokio::test]
    async fn delete_by_ticket_removes_row() {
        let store = HistoryStore::open_in_memory().await.unwrap();
        store.upsert(&row(5, "app.a", TransferState::Cancelled)).await.unwrap();
        store.delete_by_ticket(5).await.unwrap();
        assert!(store.get(5).await.unwrap().is_none());
    }
}
