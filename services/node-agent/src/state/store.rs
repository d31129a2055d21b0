//! SQLite-based instance store for the node agent.
//!
//! This provides durable storage for the instances owned by this node,
//! so provisioned identities, ports, and secrets survive agent restarts.

use std::path::Path;

use cachefleet_agent_api::Instance;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use thiserror::Error;
use tracing::debug;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Instance already stored: {0}")]
    Duplicate(String),

    #[error("Instance not stored: {0}")]
    NotFound(String),

    #[error("Memory reservation of {max_memory_mb} MB for {id} does not fit the store")]
    ReservationOutOfRange { id: String, max_memory_mb: u64 },
}

/// An instance row plus bookkeeping.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub instance: Instance,
    /// Created timestamp (Unix seconds).
    pub created_at: i64,
}

/// SQLite instance store.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self { conn };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                password TEXT NOT NULL,
                max_memory_mb INTEGER NOT NULL,
                max_clients INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Get an instance record.
    pub fn get_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT instance_id, host, port, password, max_memory_mb, max_clients, created_at
             FROM instances WHERE instance_id = ?1",
        )?;

        stmt.query_row(params![instance_id], record_from_row)
            .optional()
            .map_err(Into::into)
    }

    /// Insert a new instance record. Fails if the ID is already stored.
    pub fn insert_instance(&self, record: &InstanceRecord) -> Result<(), StateStoreError> {
        let instance = &record.instance;
        let max_memory_mb = i64::try_from(instance.max_memory_mb).map_err(|_| {
            StateStoreError::ReservationOutOfRange {
                id: instance.id.clone(),
                max_memory_mb: instance.max_memory_mb,
            }
        })?;
        let result = self.conn.execute(
            r#"
            INSERT INTO instances (instance_id, host, port, password, max_memory_mb, max_clients, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                instance.id,
                instance.host,
                instance.port,
                instance.password,
                max_memory_mb,
                instance.max_clients,
                record.created_at,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(StateStoreError::Duplicate(instance.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete an instance record.
    pub fn delete_instance(&self, instance_id: &str) -> Result<(), StateStoreError> {
        let deleted = self.conn.execute(
            "DELETE FROM instances WHERE instance_id = ?1",
            params![instance_id],
        )?;
        if deleted == 0 {
            return Err(StateStoreError::NotFound(instance_id.to_string()));
        }
        Ok(())
    }

    /// List all instances.
    pub fn list_instances(&self) -> Result<Vec<InstanceRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT instance_id, host, port, password, max_memory_mb, max_clients, created_at
             FROM instances ORDER BY created_at, instance_id",
        )?;

        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceRecord> {
    let max_memory_mb: i64 = row.get(4)?;
    Ok(InstanceRecord {
        instance: Instance {
            id: row.get(0)?,
            host: row.get(1)?,
            port: row.get(2)?,
            password: row.get(3)?,
            max_memory_mb: u64::try_from(max_memory_mb)
                .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(4, max_memory_mb))?,
            max_clients: row.get(5)?,
        },
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, created_at: i64) -> InstanceRecord {
        InstanceRecord {
            instance: Instance {
                id: id.to_string(),
                host: "10.0.0.5".to_string(),
                port: 6400,
                password: "pw".to_string(),
                max_memory_mb: 256,
                max_clients: 20,
            },
            created_at,
        }
    }

    #[test]
    fn test_state_store_instances() {
        let store = StateStore::open_in_memory().unwrap();

        store.insert_instance(&record("inst-b", 2)).unwrap();
        store.insert_instance(&record("inst-a", 1)).unwrap();

        let fetched = store.get_instance("inst-a").unwrap().unwrap();
        assert_eq!(fetched.instance.port, 6400);
        assert_eq!(fetched.instance.max_memory_mb, 256);

        let listed = store.list_instances().unwrap();
        let ids: Vec<_> = listed.iter().map(|r| r.instance.id.as_str()).collect();
        assert_eq!(ids, vec!["inst-a", "inst-b"]);

        store.delete_instance("inst-a").unwrap();
        assert!(store.get_instance("inst-a").unwrap().is_none());
        assert_eq!(store.list_instances().unwrap().len(), 1);
    }

    #[test]
    fn test_largest_reservation_is_stored_losslessly() {
        let store = StateStore::open_in_memory().unwrap();
        let mut largest = record("inst-max", 1);
        largest.instance.max_memory_mb = i64::MAX as u64;
        store.insert_instance(&largest).unwrap();

        let fetched = store.get_instance("inst-max").unwrap().unwrap();
        assert_eq!(fetched.instance.max_memory_mb, i64::MAX as u64);
    }

    #[test]
    fn test_oversized_reservation_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let mut oversized = record("inst-huge", 1);
        oversized.instance.max_memory_mb = u64::MAX;

        let err = store.insert_instance(&oversized).unwrap_err();
        assert!(matches!(
            err,
            StateStoreError::ReservationOutOfRange { max_memory_mb: u64::MAX, .. }
        ));
        assert!(store.get_instance("inst-huge").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_instance(&record("inst-a", 1)).unwrap();

        let err = store.insert_instance(&record("inst-a", 2)).unwrap_err();
        assert!(matches!(err, StateStoreError::Duplicate(id) if id == "inst-a"));
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.delete_instance("ghost").unwrap_err();
        assert!(matches!(err, StateStoreError::NotFound(_)));
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let store = StateStore::open(&path).unwrap();
            store.insert_instance(&record("inst-a", 1)).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert!(store.get_instance("inst-a").unwrap().is_some());
    }
}
