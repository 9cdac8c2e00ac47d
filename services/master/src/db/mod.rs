//! Persistence for the master.
//!
//! This module provides:
//! - The historical agent inventory (static feasibility survives restarts)
//! - Current allocation records (non-terminal rows drive reattachment)
//! - Per-allocation transition history
//! - Appended task log records
//!
//! The store uses SQLite through rusqlite. Statements are short and run on
//! the caller's thread under a mutex.

mod agents;
mod allocations;
mod error;
mod logs;

pub use agents::InventoryRow;
pub use error::DbError;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use tracing::{debug, info};

/// Path that selects an in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// Handle to the SQLite store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open or create a store at the given path (`:memory:` allowed).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let path = path.as_ref();
        if path.as_os_str() == IN_MEMORY {
            return Self::open_in_memory();
        }

        let conn = Connection::open(path).map_err(|source| DbError::Open {
            path: path.display().to_string(),
            source,
        })?;

        // WAL keeps readers off the writer's back.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "Store opened");
        Ok(store)
    }

    /// Open an in-memory store (for testing and dev mode).
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), DbError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                agent_id TEXT PRIMARY KEY,
                pool TEXT NOT NULL,
                slots_json TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_agents_pool ON agents(pool);

            CREATE TABLE IF NOT EXISTS allocations (
                allocation_id TEXT PRIMARY KEY,
                pool TEXT NOT NULL,
                record_json TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_allocations_state ON allocations(state);

            CREATE TABLE IF NOT EXISTS allocation_events (
                allocation_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                event_json TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                PRIMARY KEY (allocation_id, seq)
            );

            CREATE TABLE IF NOT EXISTS task_logs (
                allocation_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                ts TEXT NOT NULL,
                record_json TEXT NOT NULL,
                PRIMARY KEY (allocation_id, seq)
            );
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }

    /// Check that the database answers.
    pub fn health_check(&self) -> Result<(), DbError> {
        self.conn().query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn corrupt(table: &'static str, message: impl std::fmt::Display) -> DbError {
    DbError::Corrupt {
        table,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_and_health() {
        let store = Store::open(IN_MEMORY).unwrap();
        store.health_check().unwrap();
    }

    #[test]
    fn test_schema_is_reentrant() {
        let store = Store::open_in_memory().unwrap();
        store.init_schema().unwrap();
        store.health_check().unwrap();
    }
}
