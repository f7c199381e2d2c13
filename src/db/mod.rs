//! SQLite-backed campaign store: organizations, projects, contacts, call history
//! and the dispatch queue.
//!
//! The database lives at `~/.intellidial/intellidial.db` unless `databasePath`
//! overrides it. It is the system of record for local calling state; the voice
//! provider is the system of record for call outcomes, merged in by the reconciler.

use std::path::PathBuf;

use rusqlite::Connection;

pub mod contacts;
pub mod projects;
pub mod queue;
pub mod types;
pub mod usage;

pub use contacts::ClaimOutcome;
pub use types::*;

pub struct CampaignDb {
    conn: Connection,
}

impl CampaignDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at `~/.intellidial/intellidial.db`.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::default_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path and apply the schema.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL lets the poller read while a dispatch batch holds the write lock.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.intellidial/intellidial.db`.
    pub fn default_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".intellidial").join("intellidial.db"))
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_open_creates_tables() {
        let db = test_db();
        for table in [
            "organizations",
            "projects",
            "contacts",
            "call_history",
            "queue_entries",
        ] {
            let count: i64 = db
                .conn_ref()
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })
                .expect(table);
            assert_eq!(count, 0);
        }
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|tx| {
            tx.upsert_organization("org-x", "Rollback Ltd", None, None)?;
            Err(DbError::Corrupt("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(db.get_org_usage("org-x").unwrap().is_none());
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let db = test_db();
        db.with_transaction(|tx| tx.upsert_organization("org-y", "Commit Ltd", None, None))
            .unwrap();
        assert!(db.get_org_usage("org-y").unwrap().is_some());
    }

    #[test]
    fn test_claim_outcome_at_store_root() {
        let db = test_db();
        test_utils::seed_campaign(&db, 1);
        let first = db
            .claim_for_dispatch("p1", "c1", "2026-03-01T09:00:00.000Z")
            .unwrap();
        let second = db
            .claim_for_dispatch("p1", "c1", "2026-03-01T09:00:01.000Z")
            .unwrap();
        assert!(matches!(first, ClaimOutcome::Claimed));
        assert!(matches!(second, ClaimOutcome::AlreadyCalling));
    }
}
