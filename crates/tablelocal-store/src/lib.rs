//! tablelocal Store - Table catalog and entity storage
//!
//! The [`Catalog`] owns the set of tables; each table is an [`EntityStore`]
//! holding its entities in key order. State lives in memory and can
//! optionally be mirrored to a redb database.

pub mod batch;
pub mod catalog;
pub mod clock;
pub mod continuation;
pub mod persist;
pub mod table;

pub use batch::{BatchFailure, BatchOperation, MAX_BATCH_OPERATIONS, OperationOutcome};
pub use catalog::{Catalog, CreateOutcome, ListTablesRequest, TableInfo, TablePage};
pub use continuation::ContinuationToken;
pub use persist::{Persistence, PersistError, RedbPersistence};
pub use table::{EntityStore, PartitionRange, ScanPage, ScanRequest, Scanner};
