//! The transaction journal (SPEC_FULL.md §4.2): a durable, single-writer
//! store for transactions, steps, and snapshots, backed by SQLite through
//! `sea_orm`. The journal issues parameterized SQL directly against a
//! `DatabaseConnection` rather than through entity/`ActiveModel` derives —
//! no entity-derive usage exists anywhere in the example pack to imitate
//! faithfully, so the lower-level `Statement` API is the grounded choice
//! (see DESIGN.md).

pub mod model;

use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbBackend, QueryResult, Statement};

use crate::errors::InstallerError;

pub use model::{SnapshotRecord, StepRecord, StepStatus, TransactionRecord, TransactionStatus, TransactionSummary};

const SCHEMA_TRANSACTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    package_name TEXT NOT NULL,
    metadata_hash TEXT NOT NULL,
    metadata TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)"#;

const SCHEMA_STEPS: &str = r#"
CREATE TABLE IF NOT EXISTS steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    transaction_id INTEGER NOT NULL REFERENCES transactions(id),
    step_order INTEGER NOT NULL,
    step_type TEXT NOT NULL,
    step_data TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    UNIQUE(transaction_id, step_order)
)"#;

const SCHEMA_SNAPSHOTS: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    transaction_id INTEGER NOT NULL REFERENCES transactions(id),
    step_order INTEGER NOT NULL,
    snapshot_data TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    UNIQUE(transaction_id, step_order)
)"#;

/// Durable, single-writer record of transactions, steps, and snapshots.
/// The journal is the ground truth consulted on recovery (SPEC_FULL.md
/// §4.5).
pub struct Journal {
    conn: DatabaseConnection,
}

impl Journal {
    /// Connect to (and lazily create) the SQLite journal at `url`, e.g.
    /// `sqlite://path/to/transactions.db?mode=rwc` or
    /// `sqlite::memory:` for tests.
    pub async fn connect(url: &str) -> Result<Self, InstallerError> {
        let conn = Database::connect(url)
            .await
            .map_err(|e| InstallerError::JournalError(e.to_string()))?;
        let journal = Journal { conn };
        journal.init_schema().await?;
        Ok(journal)
    }

    async fn init_schema(&self) -> Result<(), InstallerError> {
        for ddl in [SCHEMA_TRANSACTIONS, SCHEMA_STEPS, SCHEMA_SNAPSHOTS] {
            self.conn
                .execute_unprepared(ddl)
                .await
                .map_err(|e| InstallerError::JournalError(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn create_transaction(
        &self,
        package_name: &str,
        metadata_hash: &str,
        metadata: &serde_json::Value,
    ) -> Result<i64, InstallerError> {
        let metadata_text = serde_json::to_string(metadata)?;
        let stmt = Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "INSERT INTO transactions (package_name, metadata_hash, metadata, status) VALUES (?, ?, ?, 'pending')",
            [package_name.into(), metadata_hash.into(), metadata_text.into()],
        );
        let result = self
            .conn
            .execute(stmt)
            .await
            .map_err(|e| InstallerError::JournalError(e.to_string()))?;
        Ok(result.last_insert_id() as i64)
    }

    pub async fn record_step(
        &self,
        transaction_id: i64,
        step_order: i32,
        step_type: &str,
        step_data: &serde_json::Value,
        status: StepStatus,
    ) -> Result<(), InstallerError> {
        let step_data_text = serde_json::to_string(step_data)?;
        let stmt = Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "INSERT INTO steps (transaction_id, step_order, step_type, step_data, status) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(transaction_id, step_order) DO NOTHING",
            [
                transaction_id.into(),
                step_order.into(),
                step_type.into(),
                step_data_text.into(),
                status.as_str().into(),
            ],
        );
        self.conn
            .execute(stmt)
            .await
            .map_err(|e| InstallerError::JournalError(e.to_string()))?;
        Ok(())
    }

    pub async fn update_step_status(
        &self,
        transaction_id: i64,
        step_order: i32,
        status: StepStatus,
    ) -> Result<(), InstallerError> {
        let current = self.get_step(transaction_id, step_order).await?;
        if let Some(current) = &current {
            if !current.status.can_transition_to(status) {
                return Err(InstallerError::InvalidStateTransition {
                    transaction_id,
                    from: current.status.to_string(),
                    to: status.to_string(),
                });
            }
        }
        let stmt = Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "UPDATE steps SET status = ? WHERE transaction_id = ? AND step_order = ?",
            [status.as_str().into(), transaction_id.into(), step_order.into()],
        );
        self.conn
            .execute(stmt)
            .await
            .map_err(|e| InstallerError::JournalError(e.to_string()))?;
        Ok(())
    }

    pub async fn save_snapshot(
        &self,
        transaction_id: i64,
        step_order: i32,
        snapshot: &serde_json::Value,
    ) -> Result<(), InstallerError> {
        let snapshot_text = serde_json::to_string(snapshot)?;
        let stmt = Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "INSERT INTO snapshots (transaction_id, step_order, snapshot_data) VALUES (?, ?, ?) \
             ON CONFLICT(transaction_id, step_order) DO UPDATE SET snapshot_data = excluded.snapshot_data",
            [transaction_id.into(), step_order.into(), snapshot_text.into()],
        );
        self.conn
            .execute(stmt)
            .await
            .map_err(|e| InstallerError::JournalError(e.to_string()))?;
        Ok(())
    }

    pub async fn update_transaction_status(
        &self,
        transaction_id: i64,
        status: TransactionStatus,
    ) -> Result<(), InstallerError> {
        let current = self.get_transaction(transaction_id).await?;
        let current = current.ok_or_else(|| {
            InstallerError::NotFound(format!("transaction {transaction_id}"))
        })?;
        if current.status.is_terminal() {
            return Err(InstallerError::InvalidStateTransition {
                transaction_id,
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }
        let stmt = Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "UPDATE transactions SET status = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ?",
            [status.as_str().into(), transaction_id.into()],
        );
        self.conn
            .execute(stmt)
            .await
            .map_err(|e| InstallerError::JournalError(e.to_string()))?;
        Ok(())
    }

    pub async fn get_transaction(
        &self,
        transaction_id: i64,
    ) -> Result<Option<TransactionRecord>, InstallerError> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT id, package_name, metadata_hash, metadata, status, created_at, updated_at \
             FROM transactions WHERE id = ?",
            [transaction_id.into()],
        );
        let row = self
            .conn
            .query_one(stmt)
            .await
            .map_err(|e| InstallerError::JournalError(e.to_string()))?;
        row.map(transaction_from_row).transpose()
    }

    async fn get_step(
        &self,
        transaction_id: i64,
        step_order: i32,
    ) -> Result<Option<StepRecord>, InstallerError> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT id, transaction_id, step_order, step_type, step_data, status, created_at \
             FROM steps WHERE transaction_id = ? AND step_order = ?",
            [transaction_id.into(), step_order.into()],
        );
        let row = self
            .conn
            .query_one(stmt)
            .await
            .map_err(|e| InstallerError::JournalError(e.to_string()))?;
        row.map(step_from_row).transpose()
    }

    pub async fn get_transaction_steps(
        &self,
        transaction_id: i64,
    ) -> Result<Vec<StepRecord>, InstallerError> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT id, transaction_id, step_order, step_type, step_data, status, created_at \
             FROM steps WHERE transaction_id = ? ORDER BY step_order ASC",
            [transaction_id.into()],
        );
        let rows = self
            .conn
            .query_all(stmt)
            .await
            .map_err(|e| InstallerError::JournalError(e.to_string()))?;
        rows.into_iter().map(step_from_row).collect()
    }

    pub async fn get_transaction_snapshots(
        &self,
        transaction_id: i64,
    ) -> Result<Vec<SnapshotRecord>, InstallerError> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT id, transaction_id, step_order, snapshot_data, created_at \
             FROM snapshots WHERE transaction_id = ? ORDER BY step_order ASC",
            [transaction_id.into()],
        );
        let rows = self
            .conn
            .query_all(stmt)
            .await
            .map_err(|e| InstallerError::JournalError(e.to_string()))?;
        rows.into_iter().map(snapshot_from_row).collect()
    }

    pub async fn list_transactions(
        &self,
        limit: u64,
    ) -> Result<Vec<TransactionSummary>, InstallerError> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT id, package_name, status, created_at, updated_at \
             FROM transactions ORDER BY created_at DESC LIMIT ?",
            [(limit as i64).into()],
        );
        let rows = self
            .conn
            .query_all(stmt)
            .await
            .map_err(|e| InstallerError::JournalError(e.to_string()))?;
        rows.into_iter().map(summary_from_row).collect()
    }

    /// Purge terminal transactions (and their step/snapshot children)
    /// older than `days`. `pending` transactions are never purged
    /// (SPEC_FULL.md §4.2, §8 property test). Returns the purged ids so
    /// the caller can release any physical snapshot artifacts that
    /// reference them before the rows disappear.
    pub async fn cleanup_old_transactions(&self, days: i64) -> Result<Vec<i64>, InstallerError> {
        let threshold = Utc::now() - chrono::Duration::days(days);
        let threshold_text = threshold.to_rfc3339();

        let select = Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT id FROM transactions \
             WHERE status != 'pending' AND created_at < ?",
            [threshold_text.clone().into()],
        );
        let rows = self
            .conn
            .query_all(select)
            .await
            .map_err(|e| InstallerError::JournalError(e.to_string()))?;
        let ids: Vec<i64> = rows
            .iter()
            .map(|r| r.try_get::<i64>("", "id"))
            .collect::<Result<_, _>>()
            .map_err(|e| InstallerError::JournalError(e.to_string()))?;

        for id in &ids {
            for table in ["snapshots", "steps"] {
                let stmt = Statement::from_sql_and_values(
                    DbBackend::Sqlite,
                    format!("DELETE FROM {table} WHERE transaction_id = ?"),
                    [(*id).into()],
                );
                self.conn
                    .execute(stmt)
                    .await
                    .map_err(|e| InstallerError::JournalError(e.to_string()))?;
            }
        }

        let delete_tx = Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "DELETE FROM transactions WHERE status != 'pending' AND created_at < ?",
            [threshold_text.into()],
        );
        self.conn
            .execute(delete_tx)
            .await
            .map_err(|e| InstallerError::JournalError(e.to_string()))?;
        Ok(ids)
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, InstallerError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.fZ")
                .map(|naive| naive.and_utc())
        })
        .map_err(|e| InstallerError::JournalError(format!("bad timestamp `{s}`: {e}")))
}

fn transaction_from_row(row: QueryResult) -> Result<TransactionRecord, InstallerError> {
    let status_text: String = row
        .try_get("", "status")
        .map_err(|e| InstallerError::JournalError(e.to_string()))?;
    let metadata_text: String = row
        .try_get("", "metadata")
        .map_err(|e| InstallerError::JournalError(e.to_string()))?;
    let created_at: String = row
        .try_get("", "created_at")
        .map_err(|e| InstallerError::JournalError(e.to_string()))?;
    let updated_at: String = row
        .try_get("", "updated_at")
        .map_err(|e| InstallerError::JournalError(e.to_string()))?;
    Ok(TransactionRecord {
        id: row
            .try_get("", "id")
            .map_err(|e| InstallerError::JournalError(e.to_string()))?,
        package_name: row
            .try_get("", "package_name")
            .map_err(|e| InstallerError::JournalError(e.to_string()))?,
        metadata_hash: row
            .try_get("", "metadata_hash")
            .map_err(|e| InstallerError::JournalError(e.to_string()))?,
        metadata: serde_json::from_str(&metadata_text)?,
        status: TransactionStatus::parse(&status_text).ok_or_else(|| {
            InstallerError::JournalError(format!("unknown transaction status `{status_text}`"))
        })?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn step_from_row(row: QueryResult) -> Result<StepRecord, InstallerError> {
    let status_text: String = row
        .try_get("", "status")
        .map_err(|e| InstallerError::JournalError(e.to_string()))?;
    let step_data_text: String = row
        .try_get("", "step_data")
        .map_err(|e| InstallerError::JournalError(e.to_string()))?;
    let created_at: String = row
        .try_get("", "created_at")
        .map_err(|e| InstallerError::JournalError(e.to_string()))?;
    Ok(StepRecord {
        id: row
            .try_get("", "id")
            .map_err(|e| InstallerError::JournalError(e.to_string()))?,
        transaction_id: row
            .try_get("", "transaction_id")
            .map_err(|e| InstallerError::JournalError(e.to_string()))?,
        step_order: row
            .try_get("", "step_order")
            .map_err(|e| InstallerError::JournalError(e.to_string()))?,
        step_type: row
            .try_get("", "step_type")
            .map_err(|e| InstallerError::JournalError(e.to_string()))?,
        step_data: serde_json::from_str(&step_data_text)?,
        status: StepStatus::parse(&status_text).ok_or_else(|| {
            InstallerError::JournalError(format!("unknown step status `{status_text}`"))
        })?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn snapshot_from_row(row: QueryResult) -> Result<SnapshotRecord, InstallerError> {
    let snapshot_text: String = row
        .try_get("", "snapshot_data")
        .map_err(|e| InstallerError::JournalError(e.to_string()))?;
    let created_at: String = row
        .try_get("", "created_at")
        .map_err(|e| InstallerError::JournalError(e.to_string()))?;
    Ok(SnapshotRecord {
        id: row
            .try_get("", "id")
            .map_err(|e| InstallerError::JournalError(e.to_string()))?,
        transaction_id: row
            .try_get("", "transaction_id")
            .map_err(|e| InstallerError::JournalError(e.to_string()))?,
        step_order: row
            .try_get("", "step_order")
            .map_err(|e| InstallerError::JournalError(e.to_string()))?,
        snapshot_data: serde_json::from_str(&snapshot_text)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn summary_from_row(row: QueryResult) -> Result<TransactionSummary, InstallerError> {
    let status_text: String = row
        .try_get("", "status")
        .map_err(|e| InstallerError::JournalError(e.to_string()))?;
    let created_at: String = row
        .try_get("", "created_at")
        .map_err(|e| InstallerError::JournalError(e.to_string()))?;
    let updated_at: String = row
        .try_get("", "updated_at")
        .map_err(|e| InstallerError::JournalError(e.to_string()))?;
    Ok(TransactionSummary {
        id: row
            .try_get("", "id")
            .map_err(|e| InstallerError::JournalError(e.to_string()))?,
        package_name: row
            .try_get("", "package_name")
            .map_err(|e| InstallerError::JournalError(e.to_string()))?,
        status: TransactionStatus::parse(&status_text).ok_or_else(|| {
            InstallerError::JournalError(format!("unknown transaction status `{status_text}`"))
        })?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_journal() -> Journal {
        Journal::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_and_fetch_transaction_round_trips() {
        let journal = memory_journal().await;
        let metadata = serde_json::json!({"package": {"name": "demo"}});
        let id = journal
            .create_transaction("demo", "abc123", &metadata)
            .await
            .unwrap();
        let tx = journal.get_transaction(id).await.unwrap().unwrap();
        assert_eq!(tx.package_name, "demo");
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.metadata, metadata);
    }

    #[tokio::test]
    async fn step_status_transition_pending_to_completed_is_allowed() {
        let journal = memory_journal().await;
        let id = journal
            .create_transaction("demo", "h", &serde_json::json!({}))
            .await
            .unwrap();
        journal
            .record_step(id, 1, "apt_package", &serde_json::json!({}), StepStatus::Pending)
            .await
            .unwrap();
        journal
            .update_step_status(id, 1, StepStatus::Completed)
            .await
            .unwrap();
        let steps = journal.get_transaction_steps(id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn step_status_transition_completed_to_completed_is_rejected() {
        let journal = memory_journal().await;
        let id = journal
            .create_transaction("demo", "h", &serde_json::json!({}))
            .await
            .unwrap();
        journal
            .record_step(id, 1, "apt_package", &serde_json::json!({}), StepStatus::Pending)
            .await
            .unwrap();
        journal
            .update_step_status(id, 1, StepStatus::Completed)
            .await
            .unwrap();
        let err = journal
            .update_step_status(id, 1, StepStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallerError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn list_transactions_orders_newest_first() {
        let journal = memory_journal().await;
        let first = journal
            .create_transaction("a", "h1", &serde_json::json!({}))
            .await
            .unwrap();
        let second = journal
            .create_transaction("b", "h2", &serde_json::json!({}))
            .await
            .unwrap();
        let list = journal.list_transactions(10).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, second);
        assert_eq!(list[1].id, first);
    }

    #[tokio::test]
    async fn pending_transactions_survive_cleanup() {
        let journal = memory_journal().await;
        let id = journal
            .create_transaction("demo", "h", &serde_json::json!({}))
            .await
            .unwrap();
        let deleted = journal.cleanup_old_transactions(0).await.unwrap();
        assert!(deleted.is_empty());
        assert!(journal.get_transaction(id).await.unwrap().is_some());
    }
}
