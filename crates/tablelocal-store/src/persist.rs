//! Optional on-disk persistence backed by redb.
//!
//! The in-memory maps stay authoritative for reads. Every write is handed
//! to the backend as one transaction before it is applied to memory, and
//! [`Persistence::load`] rebuilds the maps at startup.

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tablelocal_common::{Entity, EntityKey};
use tracing::error;

/// Key: lowercase table name, Value: bincode `StoredTable`
const TABLES: TableDefinition<&str, &[u8]> = TableDefinition::new("tables");
/// Key: "table\0partition\0row", Value: bincode `Entity`
const ENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entities");

/// File name of the database inside the data directory
pub const DB_FILE_NAME: &str = "tablelocal.redb";

/// Error type for persistence operations
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for PersistError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<PersistError> for tablelocal_common::Error {
    fn from(e: PersistError) -> Self {
        Self::Persistence(e.to_string())
    }
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Table metadata as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTable {
    /// Name with its original casing
    pub name: String,
    pub created: DateTime<Utc>,
}

/// One row-level change inside a table
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put(Entity),
    Delete(EntityKey),
}

impl WriteOp {
    #[must_use]
    pub const fn key(&self) -> &EntityKey {
        match self {
            Self::Put(entity) => &entity.key,
            Self::Delete(key) => key,
        }
    }
}

/// A table together with all of its entities, as loaded at startup
#[derive(Debug, Clone)]
pub struct LoadedTable {
    pub table: StoredTable,
    pub entities: Vec<Entity>,
}

/// Storage backend for catalog and entity state
pub trait Persistence: Send + Sync {
    fn put_table(&self, key: &str, table: &StoredTable) -> PersistResult<()>;

    /// Remove a table and every entity it holds
    fn delete_table(&self, key: &str) -> PersistResult<()>;

    /// Apply a group of entity writes to one table atomically
    fn apply(&self, table_key: &str, writes: &[WriteOp]) -> PersistResult<()>;

    fn load(&self) -> PersistResult<Vec<LoadedTable>>;
}

/// redb-backed [`Persistence`]
pub struct RedbPersistence {
    db: Database,
}

impl RedbPersistence {
    /// Open (or create) the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(TABLES)?;
            let _t = write_txn.open_table(ENTITIES)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Open the database file inside a data directory
    pub fn open_dir(dir: impl AsRef<Path>) -> PersistResult<Self> {
        Self::open(dir.as_ref().join(DB_FILE_NAME))
    }
}

fn entity_row_key(table_key: &str, key: &EntityKey) -> String {
    // keys cannot contain control characters, so NUL is a safe separator
    format!("{table_key}\0{}\0{}", key.partition_key, key.row_key)
}

/// Row key bounds `[start, end)` covering every entity of one table
fn table_row_range(table_key: &str) -> (String, String) {
    (format!("{table_key}\0"), format!("{table_key}\u{1}"))
}

impl Persistence for RedbPersistence {
    fn put_table(&self, key: &str, table: &StoredTable) -> PersistResult<()> {
        let bytes = bincode::serialize(table)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut t = write_txn.open_table(TABLES)?;
            t.insert(key, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete_table(&self, key: &str) -> PersistResult<()> {
        let (start, end) = table_row_range(key);
        let write_txn = self.db.begin_write()?;
        {
            let mut t = write_txn.open_table(TABLES)?;
            t.remove(key)?;

            let mut rows = write_txn.open_table(ENTITIES)?;
            let doomed: Vec<String> = {
                let mut keys = Vec::new();
                for entry in rows.range(start.as_str()..end.as_str())? {
                    keys.push(entry?.0.value().to_string());
                }
                keys
            };
            for k in &doomed {
                rows.remove(k.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn apply(&self, table_key: &str, writes: &[WriteOp]) -> PersistResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut rows = write_txn.open_table(ENTITIES)?;
            for write in writes {
                let row_key = entity_row_key(table_key, write.key());
                match write {
                    WriteOp::Put(entity) => {
                        let bytes = bincode::serialize(entity)?;
                        rows.insert(row_key.as_str(), bytes.as_slice())?;
                    }
                    WriteOp::Delete(_) => {
                        rows.remove(row_key.as_str())?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load(&self) -> PersistResult<Vec<LoadedTable>> {
        let read_txn = self.db.begin_read()?;
        let tables = read_txn.open_table(TABLES)?;
        let rows = read_txn.open_table(ENTITIES)?;

        let mut result = Vec::new();
        for entry in tables.iter()? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            let table: StoredTable = match bincode::deserialize(entry.1.value()) {
                Ok(table) => table,
                Err(e) => {
                    error!("Failed to decode table '{}': {}", key, e);
                    continue;
                }
            };

            let (start, end) = table_row_range(&key);
            let mut entities = Vec::new();
            for row in rows.range(start.as_str()..end.as_str())? {
                let row = row?;
                let row_key = row.0.value();
                match bincode::deserialize::<Entity>(row.1.value()) {
                    Ok(entity) => entities.push(entity),
                    Err(e) => error!("Failed to decode entity '{}': {}", row_key, e),
                }
            }
            result.push(LoadedTable { table, entities });
        }
        Ok(result)
    }
}
