//! Entity store: the entities of one table.
//!
//! Reads take the table's read lock and run concurrently. Writes, including
//! whole batches, take the write lock and go through three steps: plan every
//! change against the current state, persist the planned rows, then apply
//! them to memory. A failure in either of the first two steps leaves the
//! table exactly as it was.

use crate::batch::{self, BatchFailure, BatchOperation, OperationOutcome};
use crate::clock::{Clock, etag_for};
use crate::continuation::ContinuationToken;
use crate::persist::{Persistence, WriteOp};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tablelocal_common::entity::{MAX_PROPERTIES, MAX_PROPERTY_NAME_LEN, SYSTEM_PROPERTIES};
use tablelocal_common::{
    Entity, EntityData, EntityKey, Error, IfMatch, Properties, PropertyValue, Result, TableName,
};
use tablelocal_query::Filter;
use tracing::{debug, error};

/// Largest String or Binary property value in bytes
pub const MAX_PROPERTY_VALUE_BYTES: usize = 64 * 1024;

/// Inclusive range of partition keys a scan is restricted to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl PartitionRange {
    /// Every partition
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Exactly one partition
    #[must_use]
    pub fn single(partition_key: impl Into<String>) -> Self {
        let pk = partition_key.into();
        Self {
            start: Some(pk.clone()),
            end: Some(pk),
        }
    }

    fn below_end(&self, partition_key: &str) -> bool {
        self.end.as_deref().is_none_or(|end| partition_key <= end)
    }
}

/// Parameters of one scan page
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub partitions: PartitionRange,
    pub filter: Option<Filter>,
    /// Requested page size, capped by the store's maximum
    pub top: Option<usize>,
    pub continuation: Option<ContinuationToken>,
}

impl ScanRequest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the filter. A filter pinned to one PartitionKey also narrows the
    /// partition range so only that partition is walked.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        if let Some(pk) = filter.partition_key() {
            self.partitions = PartitionRange::single(pk);
        }
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn with_partitions(mut self, partitions: PartitionRange) -> Self {
        self.partitions = partitions;
        self
    }

    #[must_use]
    pub fn with_top(mut self, top: usize) -> Self {
        self.top = Some(top);
        self
    }

    #[must_use]
    pub fn with_continuation(mut self, token: ContinuationToken) -> Self {
        self.continuation = Some(token);
        self
    }
}

/// One page of scan results in (PartitionKey, RowKey) order
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPage {
    pub entities: Vec<Entity>,
    /// Where the next page starts; `None` on the last page
    pub continuation: Option<ContinuationToken>,
}

struct TableState {
    entities: BTreeMap<EntityKey, Entity>,
    /// Set once the table is deleted from the catalog
    dropped: bool,
}

/// The entities of one table
pub struct EntityStore {
    name: TableName,
    key: String,
    created: DateTime<Utc>,
    state: RwLock<TableState>,
    clock: Arc<Clock>,
    persistence: Option<Arc<dyn Persistence>>,
    max_page_size: usize,
}

impl EntityStore {
    pub(crate) fn new(
        name: TableName,
        created: DateTime<Utc>,
        entities: Vec<Entity>,
        clock: Arc<Clock>,
        persistence: Option<Arc<dyn Persistence>>,
        max_page_size: usize,
    ) -> Self {
        let key = name.key();
        Self {
            name,
            key,
            created,
            state: RwLock::new(TableState {
                entities: entities.into_iter().map(|e| (e.key.clone(), e)).collect(),
                dropped: false,
            }),
            clock,
            persistence,
            max_page_size: max_page_size.max(1),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &TableName {
        &self.name
    }

    #[must_use]
    pub const fn created(&self) -> DateTime<Utc> {
        self.created
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the table: run `remove` with writers locked out, then reject
    /// everything from now on. Called by the catalog on delete.
    ///
    /// A commit either finishes before `remove` runs or sees the table as
    /// dropped, so no write can land on disk after the table's rows are gone.
    pub(crate) fn drop_with<F>(&self, remove: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut state = self.state.write();
        if state.dropped {
            return Err(self.not_found());
        }
        remove()?;
        state.dropped = true;
        state.entities.clear();
        Ok(())
    }

    fn not_found(&self) -> Error {
        Error::TableNotFound(self.name.to_string())
    }

    /// Insert a new entity; fails if the key is taken
    pub fn insert(&self, data: EntityData) -> Result<Entity> {
        self.write_one(BatchOperation::Insert(data))
    }

    pub fn retrieve(&self, key: &EntityKey) -> Result<Entity> {
        let state = self.state.read();
        if state.dropped {
            return Err(self.not_found());
        }
        state
            .entities
            .get(key)
            .cloned()
            .ok_or_else(|| Error::entity_not_found(self.name.as_str(), key))
    }

    /// Replace the whole property set of an existing entity
    pub fn replace(&self, data: EntityData, if_match: &IfMatch) -> Result<Entity> {
        self.write_one(BatchOperation::Replace(data, if_match.clone()))
    }

    /// Update the supplied properties of an existing entity, keeping the rest
    pub fn merge(&self, data: EntityData, if_match: &IfMatch) -> Result<Entity> {
        self.write_one(BatchOperation::Merge(data, if_match.clone()))
    }

    pub fn insert_or_replace(&self, data: EntityData) -> Result<Entity> {
        self.write_one(BatchOperation::InsertOrReplace(data))
    }

    pub fn insert_or_merge(&self, data: EntityData) -> Result<Entity> {
        self.write_one(BatchOperation::InsertOrMerge(data))
    }

    pub fn delete(&self, key: &EntityKey, if_match: &IfMatch) -> Result<()> {
        self.commit(&[BatchOperation::Delete(key.clone(), if_match.clone())])
            .map(|_| ())
            .map_err(Error::from)
    }

    /// Run a batch atomically: every operation applies, or none does.
    pub fn execute_batch(
        &self,
        operations: &[BatchOperation],
    ) -> std::result::Result<Vec<OperationOutcome>, BatchFailure> {
        batch::validate(operations)?;
        self.commit(operations)
    }

    /// Read one page of entities
    pub fn scan(&self, request: &ScanRequest) -> Result<ScanPage> {
        let state = self.state.read();
        if state.dropped {
            return Err(self.not_found());
        }
        let page_size = request
            .top
            .unwrap_or(self.max_page_size)
            .clamp(1, self.max_page_size);

        let from_partition = request
            .partitions
            .start
            .as_ref()
            .map(|pk| EntityKey {
                partition_key: pk.clone(),
                row_key: String::new(),
            });
        let from_token = request.continuation.as_ref().map(|t| t.next.clone());
        let start = from_partition
            .max(from_token)
            .map_or(Bound::Unbounded, Bound::Included);

        let mut entities = Vec::new();
        let mut continuation = None;
        for (key, entity) in state.entities.range((start, Bound::Unbounded)) {
            if !request.partitions.below_end(&key.partition_key) {
                break;
            }
            if request.filter.as_ref().is_some_and(|f| !f.matches(entity)) {
                continue;
            }
            if entities.len() == page_size {
                continuation = Some(ContinuationToken::new(key.clone()));
                break;
            }
            entities.push(entity.clone());
        }

        debug!(
            table = %self.name,
            returned = entities.len(),
            more = continuation.is_some(),
            "scan"
        );
        Ok(ScanPage {
            entities,
            continuation,
        })
    }

    /// Iterate over all pages of a scan, starting at the request's continuation
    #[must_use]
    pub fn scanner(&self, request: ScanRequest) -> Scanner<'_> {
        Scanner {
            store: self,
            request,
            done: false,
        }
    }

    fn write_one(&self, op: BatchOperation) -> Result<Entity> {
        let outcomes = self.commit(std::slice::from_ref(&op))?;
        match outcomes.into_iter().next() {
            Some(OperationOutcome::Written(entity)) => Ok(entity),
            _ => Err(Error::internal(format!("{} produced no entity", op.name()))),
        }
    }

    fn commit(
        &self,
        operations: &[BatchOperation],
    ) -> std::result::Result<Vec<OperationOutcome>, BatchFailure> {
        let mut state = self.state.write();
        if state.dropped {
            return Err(BatchFailure::whole(self.not_found()));
        }

        let mut writes = Vec::with_capacity(operations.len());
        let mut outcomes = Vec::with_capacity(operations.len());
        for (index, op) in operations.iter().enumerate() {
            let (write, outcome) = self
                .plan(&state.entities, op)
                .map_err(|e| BatchFailure::at(index, e))?;
            writes.extend(write);
            outcomes.push(outcome);
        }

        if !writes.is_empty()
            && let Some(persistence) = &self.persistence
        {
            persistence.apply(&self.key, &writes).map_err(|e| {
                error!("Failed to persist writes to table '{}': {}", self.name, e);
                BatchFailure::whole(e.into())
            })?;
        }

        for write in writes {
            match write {
                WriteOp::Put(entity) => {
                    state.entities.insert(entity.key.clone(), entity);
                }
                WriteOp::Delete(key) => {
                    state.entities.remove(&key);
                }
            }
        }
        debug!(table = %self.name, operations = operations.len(), "committed");
        Ok(outcomes)
    }

    /// Work out the row change an operation makes, without touching state
    fn plan(
        &self,
        entities: &BTreeMap<EntityKey, Entity>,
        op: &BatchOperation,
    ) -> Result<(Option<WriteOp>, OperationOutcome)> {
        let table = self.name.as_str();
        let existing = entities.get(op.key());
        let checked = |if_match: &IfMatch| check_condition(table, op.key(), existing, if_match);

        let (key, properties) = match op {
            BatchOperation::Retrieve(key) => {
                let entity = existing.ok_or_else(|| Error::entity_not_found(table, key))?;
                return Ok((None, OperationOutcome::Retrieved(entity.clone())));
            }
            BatchOperation::Delete(key, if_match) => {
                checked(if_match)?;
                return Ok((
                    Some(WriteOp::Delete(key.clone())),
                    OperationOutcome::Deleted(key.clone()),
                ));
            }
            BatchOperation::Insert(data) => {
                if existing.is_some() {
                    return Err(Error::entity_exists(table, &data.key));
                }
                (&data.key, data.properties.clone())
            }
            BatchOperation::Replace(data, if_match) => {
                checked(if_match)?;
                (&data.key, data.properties.clone())
            }
            BatchOperation::Merge(data, if_match) => {
                let current = checked(if_match)?;
                (&data.key, merged(&current.properties, &data.properties))
            }
            BatchOperation::InsertOrReplace(data) => (&data.key, data.properties.clone()),
            BatchOperation::InsertOrMerge(data) => match existing {
                Some(current) => (&data.key, merged(&current.properties, &data.properties)),
                None => (&data.key, data.properties.clone()),
            },
        };
        validate_properties(&properties)?;

        let timestamp = self.clock.tick();
        let entity = Entity {
            key: key.clone(),
            properties,
            timestamp,
            etag: etag_for(&timestamp),
        };
        Ok((
            Some(WriteOp::Put(entity.clone())),
            OperationOutcome::Written(entity),
        ))
    }
}

/// The current entity, if it exists and satisfies the `If-Match` condition
fn check_condition<'e>(
    table: &str,
    key: &EntityKey,
    existing: Option<&'e Entity>,
    if_match: &IfMatch,
) -> Result<&'e Entity> {
    let current = existing.ok_or_else(|| Error::entity_not_found(table, key))?;
    if if_match.matches(&current.etag) {
        Ok(current)
    } else {
        Err(Error::UpdateConditionNotSatisfied)
    }
}

fn merged(current: &Properties, update: &Properties) -> Properties {
    let mut out = current.clone();
    out.extend(update.iter().map(|(k, v)| (k.clone(), v.clone())));
    out
}

/// Enforce the limits on user properties
pub fn validate_properties(properties: &Properties) -> Result<()> {
    if properties.len() > MAX_PROPERTIES {
        return Err(Error::invalid_input(format!(
            "entity has {} properties, the limit is {MAX_PROPERTIES}",
            properties.len()
        )));
    }
    for (name, value) in properties {
        if name.is_empty() || name.chars().count() > MAX_PROPERTY_NAME_LEN {
            return Err(Error::invalid_input(format!(
                "property name must be 1-{MAX_PROPERTY_NAME_LEN} characters: {name}"
            )));
        }
        if SYSTEM_PROPERTIES.contains(&name.as_str()) || name.starts_with("odata.") {
            return Err(Error::invalid_input(format!(
                "{name} is not a user property"
            )));
        }
        let size = match value {
            PropertyValue::String(s) => s.len(),
            PropertyValue::Binary(b) => b.len(),
            _ => 0,
        };
        if size > MAX_PROPERTY_VALUE_BYTES {
            return Err(Error::PropertyValueInvalid(format!(
                "{name} exceeds {MAX_PROPERTY_VALUE_BYTES} bytes"
            )));
        }
    }
    Ok(())
}

/// Lazily yields every page of a scan until the last one
pub struct Scanner<'a> {
    store: &'a EntityStore,
    request: ScanRequest,
    done: bool,
}

impl Iterator for Scanner<'_> {
    type Item = Result<ScanPage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let page = self.store.scan(&self.request);
        match &page {
            Ok(page) => {
                self.request.continuation.clone_from(&page.continuation);
                self.done = page.continuation.is_none();
            }
            Err(_) => self.done = true,
        }
        Some(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{LoadedTable, PersistError, PersistResult, StoredTable};
    use tablelocal_common::ETag;

    fn store() -> EntityStore {
        EntityStore::new(
            TableName::new("test").unwrap(),
            Utc::now(),
            Vec::new(),
            Arc::new(Clock::new()),
            None,
            1000,
        )
    }

    fn data(pk: &str, rk: &str) -> EntityData {
        EntityData::new(EntityKey::new(pk, rk).unwrap(), Properties::new())
    }

    fn key(pk: &str, rk: &str) -> EntityKey {
        EntityKey::new(pk, rk).unwrap()
    }

    #[test]
    fn test_insert_then_retrieve() {
        let store = store();
        let written = store
            .insert(data("PK", "RK").with("Message", "Hello, World!"))
            .unwrap();
        let read = store.retrieve(&key("PK", "RK")).unwrap();
        assert_eq!(read, written);
        assert_eq!(read.properties["Message"], "Hello, World!".into());
    }

    #[test]
    fn test_duplicate_insert_conflicts() {
        let store = store();
        let first = store.insert(data("PK", "RK").with("v", 1)).unwrap();
        let err = store.insert(data("PK", "RK").with("v", 2)).unwrap_err();
        assert!(matches!(err, Error::EntityAlreadyExists { .. }));
        assert_eq!(store.retrieve(&key("PK", "RK")).unwrap(), first);
    }

    #[test]
    fn test_retrieve_missing() {
        let err = store().retrieve(&key("PK", "RK")).unwrap_err();
        assert_eq!(err.error_code(), "ResourceNotFound");
    }

    #[test]
    fn test_every_write_changes_etag() {
        let store = store();
        let a = store.insert(data("PK", "RK")).unwrap();
        let b = store.insert_or_replace(data("PK", "RK")).unwrap();
        let c = store.merge(data("PK", "RK"), &IfMatch::Any).unwrap();
        assert_ne!(a.etag, b.etag);
        assert_ne!(b.etag, c.etag);
        assert!(c.timestamp > b.timestamp);
    }

    #[test]
    fn test_stale_etag_is_rejected() {
        let store = store();
        let original = store.insert(data("PK", "RK").with("v", 1)).unwrap();
        let stale = IfMatch::ETag(ETag::from_raw("W/\"datetime'stale'\""));

        let err = store
            .replace(data("PK", "RK").with("v", 2), &stale)
            .unwrap_err();
        assert!(matches!(err, Error::UpdateConditionNotSatisfied));
        let err = store.delete(&key("PK", "RK"), &stale).unwrap_err();
        assert_eq!(err.http_status_code(), 412);

        assert_eq!(store.retrieve(&key("PK", "RK")).unwrap(), original);
    }

    #[test]
    fn test_matching_etag_and_wildcard() {
        let store = store();
        let original = store.insert(data("PK", "RK").with("v", 1)).unwrap();
        let replaced = store
            .replace(
                data("PK", "RK").with("v", 2),
                &IfMatch::ETag(original.etag.clone()),
            )
            .unwrap();
        assert_eq!(replaced.properties["v"], 2.into());

        // the old etag no longer matches, the wildcard always does
        assert!(
            store
                .replace(data("PK", "RK"), &IfMatch::ETag(original.etag))
                .is_err()
        );
        store.replace(data("PK", "RK").with("v", 3), &IfMatch::Any).unwrap();
        store.delete(&key("PK", "RK"), &IfMatch::Any).unwrap();
        assert!(store.retrieve(&key("PK", "RK")).is_err());
    }

    #[test]
    fn test_update_missing_entity() {
        let store = store();
        assert!(matches!(
            store.replace(data("PK", "RK"), &IfMatch::Any),
            Err(Error::EntityNotFound { .. })
        ));
        assert!(matches!(
            store.merge(data("PK", "RK"), &IfMatch::Any),
            Err(Error::EntityNotFound { .. })
        ));
        assert!(matches!(
            store.delete(&key("PK", "RK"), &IfMatch::Any),
            Err(Error::EntityNotFound { .. })
        ));
    }

    #[test]
    fn test_merge_keeps_other_properties() {
        let store = store();
        store
            .insert(data("PK", "RK").with("a", 1).with("b", "x"))
            .unwrap();
        let merged = store
            .merge(data("PK", "RK").with("b", "y").with("c", true), &IfMatch::Any)
            .unwrap();
        assert_eq!(merged.properties.len(), 3);
        assert_eq!(merged.properties["a"], 1.into());
        assert_eq!(merged.properties["b"], "y".into());

        let replaced = store
            .replace(data("PK", "RK").with("c", false), &IfMatch::Any)
            .unwrap();
        assert_eq!(replaced.properties.len(), 1);
    }

    #[test]
    fn test_upserts() {
        let store = store();
        store.insert_or_merge(data("PK", "RK").with("a", 1)).unwrap();
        let e = store.insert_or_merge(data("PK", "RK").with("b", 2)).unwrap();
        assert_eq!(e.properties.len(), 2);
        let e = store.insert_or_replace(data("PK", "RK").with("c", 3)).unwrap();
        assert_eq!(e.properties.len(), 1);
    }

    #[test]
    fn test_property_validation() {
        let store = store();
        assert!(store.insert(data("PK", "1").with("RowKey", "x")).is_err());
        assert!(store.insert(data("PK", "2").with("odata.etag", "x")).is_err());
        assert!(store.insert(data("PK", "3").with("", "x")).is_err());
        let mut too_many = data("PK", "4");
        for i in 0..=MAX_PROPERTIES {
            too_many = too_many.with(format!("p{i}"), 1);
        }
        assert!(store.insert(too_many).is_err());
        let big = "x".repeat(MAX_PROPERTY_VALUE_BYTES + 1);
        assert!(matches!(
            store.insert(data("PK", "5").with("big", big)),
            Err(Error::PropertyValueInvalid(_))
        ));
        assert!(store.is_empty());
    }

    fn seeded() -> EntityStore {
        let store = store();
        for pk in ["B", "A", "C"] {
            for rk in ["3", "1", "2"] {
                store
                    .insert(data(pk, rk).with("n", rk.parse::<i32>().unwrap()))
                    .unwrap();
            }
        }
        store
    }

    fn keys(page: &ScanPage) -> Vec<(String, String)> {
        page.entities
            .iter()
            .map(|e| (e.key.partition_key.clone(), e.key.row_key.clone()))
            .collect()
    }

    #[test]
    fn test_partition_scan_is_ordered_and_stable() {
        let store = seeded();
        let request =
            ScanRequest::new().with_filter(Filter::parse("PartitionKey eq 'A'").unwrap());
        assert_eq!(request.partitions, PartitionRange::single("A"));

        let first = store.scan(&request).unwrap();
        assert_eq!(
            keys(&first),
            vec![
                ("A".to_string(), "1".to_string()),
                ("A".to_string(), "2".to_string()),
                ("A".to_string(), "3".to_string()),
            ]
        );
        assert!(first.continuation.is_none());
        assert_eq!(store.scan(&request).unwrap(), first);
    }

    #[test]
    fn test_filtered_scan_across_partitions() {
        let store = seeded();
        let request = ScanRequest::new().with_filter(Filter::parse("n ge 2").unwrap());
        let page = store.scan(&request).unwrap();
        assert_eq!(page.entities.len(), 6);
        assert_eq!(page.entities[0].key, key("A", "2"));
        assert_eq!(page.entities[5].key, key("C", "3"));
    }

    #[test]
    fn test_paging_with_continuation() {
        let store = seeded();
        let first = store.scan(&ScanRequest::new().with_top(4)).unwrap();
        assert_eq!(first.entities.len(), 4);
        let token = first.continuation.clone().unwrap();
        assert_eq!(token.next, key("B", "2"));

        let second = store
            .scan(&ScanRequest::new().with_top(4).with_continuation(token))
            .unwrap();
        assert_eq!(second.entities[0].key, key("B", "2"));

        let pages: Vec<_> = store
            .scanner(ScanRequest::new().with_top(4))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[2].entities.len(), 1);
        assert!(pages[2].continuation.is_none());
        let total: usize = pages.iter().map(|p| p.entities.len()).sum();
        assert_eq!(total, 9);
    }

    #[test]
    fn test_partition_range() {
        let store = seeded();
        let request = ScanRequest::new().with_partitions(PartitionRange {
            start: Some("B".into()),
            end: None,
        });
        assert_eq!(store.scan(&request).unwrap().entities.len(), 6);
    }

    #[test]
    fn test_page_size_is_capped() {
        let store = EntityStore::new(
            TableName::new("test").unwrap(),
            Utc::now(),
            Vec::new(),
            Arc::new(Clock::new()),
            None,
            2,
        );
        for rk in ["1", "2", "3"] {
            store.insert(data("A", rk)).unwrap();
        }
        let page = store.scan(&ScanRequest::new().with_top(100)).unwrap();
        assert_eq!(page.entities.len(), 2);
        assert!(page.continuation.is_some());
    }

    #[test]
    fn test_batch_applies_atomically() {
        let store = store();
        store.insert(data("A", "0").with("v", 0)).unwrap();

        let outcomes = store
            .execute_batch(&[
                BatchOperation::Insert(data("A", "1")),
                BatchOperation::InsertOrMerge(data("A", "2").with("v", 2)),
                BatchOperation::Delete(key("A", "0"), IfMatch::Any),
            ])
            .unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[2], OperationOutcome::Deleted(_)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_batch_failure_applies_nothing() {
        let store = store();
        store.insert(data("A", "1")).unwrap();

        let failure = store
            .execute_batch(&[
                BatchOperation::Insert(data("A", "2")),
                BatchOperation::Insert(data("A", "1")),
            ])
            .unwrap_err();
        assert_eq!(failure.index, Some(1));
        assert!(matches!(failure.error, Error::EntityAlreadyExists { .. }));
        assert!(store.retrieve(&key("A", "2")).is_err());

        let failure = store
            .execute_batch(&[
                BatchOperation::Insert(data("A", "3")),
                BatchOperation::Insert(data("B", "3")),
            ])
            .unwrap_err();
        assert!(matches!(failure.error, Error::BatchPartitionMismatch));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_dropped_table_rejects_operations() {
        let store = store();
        store.insert(data("A", "1")).unwrap();
        store.drop_with(|| Ok(())).unwrap();
        assert!(matches!(store.drop_with(|| Ok(())), Err(Error::TableNotFound(_))));
        assert!(matches!(
            store.insert(data("A", "2")),
            Err(Error::TableNotFound(_))
        ));
        assert!(matches!(
            store.retrieve(&key("A", "1")),
            Err(Error::TableNotFound(_))
        ));
        assert!(store.scan(&ScanRequest::new()).is_err());
    }

    #[test]
    fn test_failed_drop_keeps_table() {
        let store = store();
        store.insert(data("A", "1")).unwrap();
        let result = store.drop_with(|| Err(Error::Persistence("disk full".into())));
        assert!(matches!(result, Err(Error::Persistence(_))));
        assert_eq!(store.len(), 1);
        store.insert(data("A", "2")).unwrap();
    }

    struct FailingPersistence;

    impl Persistence for FailingPersistence {
        fn put_table(&self, _: &str, _: &StoredTable) -> PersistResult<()> {
            Ok(())
        }

        fn delete_table(&self, _: &str) -> PersistResult<()> {
            Ok(())
        }

        fn apply(&self, _: &str, _: &[WriteOp]) -> PersistResult<()> {
            Err(PersistError::Io(std::io::Error::other("disk full")))
        }

        fn load(&self) -> PersistResult<Vec<LoadedTable>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_failed_persist_leaves_no_state() {
        let store = EntityStore::new(
            TableName::new("test").unwrap(),
            Utc::now(),
            Vec::new(),
            Arc::new(Clock::new()),
            Some(Arc::new(FailingPersistence)),
            1000,
        );
        let err = store.insert(data("A", "1")).unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        assert!(store.is_empty());
    }
}
