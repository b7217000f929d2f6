//! Table catalog: the set of tables and their entity stores.

use crate::clock::Clock;
use crate::continuation::{decode_segment, encode_segment};
use crate::persist::{Persistence, RedbPersistence, StoredTable};
use crate::table::EntityStore;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tablelocal_common::config::StorageConfig;
use tablelocal_common::{Entity, EntityKey, Error, Properties, PropertyValue, Result, TableName};
use tablelocal_query::Filter;
use tracing::{error, info};

/// Result of [`Catalog::create_table_if_not_exists`]
#[derive(Clone)]
pub enum CreateOutcome {
    Created(Arc<EntityStore>),
    AlreadyExists(Arc<EntityStore>),
}

impl CreateOutcome {
    #[must_use]
    pub const fn created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    #[must_use]
    pub fn table(&self) -> &Arc<EntityStore> {
        match self {
            Self::Created(t) | Self::AlreadyExists(t) => t,
        }
    }
}

/// Listing entry for one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: TableName,
    pub created: DateTime<Utc>,
}

/// Parameters of one table listing page
#[derive(Debug, Clone, Default)]
pub struct ListTablesRequest {
    /// Only names starting with this prefix (case-insensitive)
    pub prefix: Option<String>,
    /// Evaluated against an entity whose only property is `TableName`
    pub filter: Option<Filter>,
    pub top: Option<usize>,
    /// Continuation from a previous page
    pub next_table_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePage {
    pub tables: Vec<TableInfo>,
    /// Opaque continuation; `None` on the last page
    pub next_table_name: Option<String>,
}

/// The set of tables of one account
pub struct Catalog {
    /// Keyed by lowercase name, which also gives the listing order
    tables: RwLock<BTreeMap<String, Arc<EntityStore>>>,
    clock: Arc<Clock>,
    persistence: Option<Arc<dyn Persistence>>,
    max_page_size: usize,
}

impl Catalog {
    /// An empty, memory-only catalog
    #[must_use]
    pub fn in_memory(max_page_size: usize) -> Self {
        Self {
            tables: RwLock::new(BTreeMap::new()),
            clock: Arc::new(Clock::new()),
            persistence: None,
            max_page_size: max_page_size.max(1),
        }
    }

    /// Build a catalog from storage configuration.
    ///
    /// With a data directory configured, tables and entities are reloaded
    /// from disk and every later write is persisted there.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        match &config.data_dir {
            None => Ok(Self::in_memory(config.max_page_size)),
            Some(dir) => {
                let persistence = RedbPersistence::open_dir(dir)?;
                Self::with_persistence(Arc::new(persistence), config.max_page_size)
            }
        }
    }

    /// Build a catalog over an existing persistence backend, loading its state
    pub fn with_persistence(
        persistence: Arc<dyn Persistence>,
        max_page_size: usize,
    ) -> Result<Self> {
        let clock = Arc::new(Clock::new());
        let loaded = persistence.load()?;

        let mut tables = BTreeMap::new();
        let mut entity_count = 0;
        for table in loaded {
            let name = TableName::new(table.table.name.as_str())?;
            clock.observe(table.table.created);
            for entity in &table.entities {
                clock.observe(entity.timestamp);
            }
            entity_count += table.entities.len();
            let store = EntityStore::new(
                name.clone(),
                table.table.created,
                table.entities,
                Arc::clone(&clock),
                Some(Arc::clone(&persistence)),
                max_page_size,
            );
            tables.insert(name.key(), Arc::new(store));
        }
        info!(
            "Loaded {} tables with {} entities from disk",
            tables.len(),
            entity_count
        );

        Ok(Self {
            tables: RwLock::new(tables),
            clock,
            persistence: Some(persistence),
            max_page_size: max_page_size.max(1),
        })
    }

    /// Create a table unless one with the same (case-insensitive) name exists
    pub fn create_table_if_not_exists(&self, name: &TableName) -> Result<CreateOutcome> {
        let key = name.key();
        let mut tables = self.tables.write();
        if let Some(existing) = tables.get(&key) {
            return Ok(CreateOutcome::AlreadyExists(Arc::clone(existing)));
        }

        let created = self.clock.tick();
        if let Some(persistence) = &self.persistence {
            persistence
                .put_table(
                    &key,
                    &StoredTable {
                        name: name.to_string(),
                        created,
                    },
                )
                .map_err(|e| {
                    error!("Failed to persist table '{}': {}", name, e);
                    Error::from(e)
                })?;
        }

        let store = Arc::new(EntityStore::new(
            name.clone(),
            created,
            Vec::new(),
            Arc::clone(&self.clock),
            self.persistence.clone(),
            self.max_page_size,
        ));
        tables.insert(key, Arc::clone(&store));
        info!("Created table '{}'", name);
        Ok(CreateOutcome::Created(store))
    }

    /// Delete a table and all of its entities
    pub fn delete_table(&self, name: &TableName) -> Result<()> {
        let key = name.key();
        let mut tables = self.tables.write();
        let Some(store) = tables.get(&key).map(Arc::clone) else {
            return Err(Error::TableNotFound(name.to_string()));
        };

        store.drop_with(|| match &self.persistence {
            Some(persistence) => persistence.delete_table(&key).map_err(|e| {
                error!("Failed to delete table '{}' from disk: {}", name, e);
                Error::from(e)
            }),
            None => Ok(()),
        })?;
        tables.remove(&key);
        info!("Deleted table '{}'", name);
        Ok(())
    }

    pub fn get_table(&self, name: &TableName) -> Result<Arc<EntityStore>> {
        self.tables
            .read()
            .get(&name.key())
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.read().len()
    }

    /// One page of tables in case-insensitive name order
    pub fn list_tables(&self, request: &ListTablesRequest) -> Result<TablePage> {
        let page_size = request
            .top
            .unwrap_or(self.max_page_size)
            .clamp(1, self.max_page_size);
        let resume = request
            .next_table_name
            .as_deref()
            .map(decode_segment)
            .transpose()?
            .map(|name| name.to_ascii_lowercase());
        let prefix = request.prefix.as_deref().map(str::to_ascii_lowercase);

        let tables = self.tables.read();
        let mut page = Vec::new();
        let mut next_table_name = None;
        for (key, store) in tables.iter() {
            if resume.as_ref().is_some_and(|resume| key < resume) {
                continue;
            }
            if prefix.as_ref().is_some_and(|p| !key.starts_with(p.as_str())) {
                continue;
            }
            if let Some(filter) = &request.filter
                && !filter.matches(&table_entity(store))
            {
                continue;
            }
            if page.len() == page_size {
                next_table_name = Some(encode_segment(store.name().as_str()));
                break;
            }
            page.push(TableInfo {
                name: store.name().clone(),
                created: store.created(),
            });
        }

        Ok(TablePage {
            tables: page,
            next_table_name,
        })
    }
}

/// Synthetic entity a table filter runs against
fn table_entity(store: &EntityStore) -> Entity {
    let mut properties = Properties::new();
    properties.insert(
        "TableName".to_string(),
        PropertyValue::String(store.name().to_string()),
    );
    Entity {
        key: EntityKey {
            partition_key: String::new(),
            row_key: store.name().key(),
        },
        properties,
        timestamp: store.created(),
        etag: crate::clock::etag_for(&store.created()),
    }
}
