//! Batch (entity group transaction) operations and validation.

use std::collections::HashSet;
use std::fmt;
use tablelocal_common::{Entity, EntityData, EntityKey, Error, IfMatch};

/// Most operations one batch may carry
pub const MAX_BATCH_OPERATIONS: usize = 100;

/// One operation inside a batch. Single-entity writes use the same type.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    Insert(EntityData),
    Replace(EntityData, IfMatch),
    Merge(EntityData, IfMatch),
    InsertOrReplace(EntityData),
    InsertOrMerge(EntityData),
    Delete(EntityKey, IfMatch),
    /// Point read; only valid as the sole operation of a batch
    Retrieve(EntityKey),
}

impl BatchOperation {
    #[must_use]
    pub const fn key(&self) -> &EntityKey {
        match self {
            Self::Insert(data)
            | Self::Replace(data, _)
            | Self::Merge(data, _)
            | Self::InsertOrReplace(data)
            | Self::InsertOrMerge(data) => &data.key,
            Self::Delete(key, _) | Self::Retrieve(key) => key,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Insert(_) => "Insert",
            Self::Replace(..) => "Replace",
            Self::Merge(..) => "Merge",
            Self::InsertOrReplace(_) => "InsertOrReplace",
            Self::InsertOrMerge(_) => "InsertOrMerge",
            Self::Delete(..) => "Delete",
            Self::Retrieve(_) => "Retrieve",
        }
    }
}

/// Result of one successfully executed operation
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// The entity as stored after the write
    Written(Entity),
    Deleted(EntityKey),
    Retrieved(Entity),
}

/// Why a batch was rejected. Nothing in the batch was applied.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    /// Zero-based index of the failing operation, when one operation is to blame
    pub index: Option<usize>,
    pub error: Error,
}

impl BatchFailure {
    #[must_use]
    pub const fn at(index: usize, error: Error) -> Self {
        Self {
            index: Some(index),
            error,
        }
    }

    #[must_use]
    pub const fn whole(error: Error) -> Self {
        Self { index: None, error }
    }
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{index}:{}", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for BatchFailure {}

impl From<BatchFailure> for Error {
    fn from(failure: BatchFailure) -> Self {
        failure.error
    }
}

/// Check the structural rules of a batch before anything executes.
pub fn validate(operations: &[BatchOperation]) -> Result<(), BatchFailure> {
    let Some(first) = operations.first() else {
        return Err(BatchFailure::whole(Error::invalid_input(
            "batch contains no operations",
        )));
    };
    if operations.len() > MAX_BATCH_OPERATIONS {
        return Err(BatchFailure::whole(Error::invalid_input(format!(
            "batch contains {} operations, the limit is {MAX_BATCH_OPERATIONS}",
            operations.len()
        ))));
    }

    let partition = &first.key().partition_key;
    let mut seen = HashSet::with_capacity(operations.len());
    for (index, op) in operations.iter().enumerate() {
        if matches!(op, BatchOperation::Retrieve(_)) && operations.len() > 1 {
            return Err(BatchFailure::at(
                index,
                Error::invalid_input("a retrieve must be the only operation in a batch"),
            ));
        }
        if &op.key().partition_key != partition {
            return Err(BatchFailure::at(index, Error::BatchPartitionMismatch));
        }
        if !seen.insert(op.key()) {
            return Err(BatchFailure::at(index, Error::BatchDuplicateRow));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(pk: &str, rk: &str) -> BatchOperation {
        BatchOperation::Insert(EntityData::new(
            EntityKey::new(pk, rk).unwrap(),
            Default::default(),
        ))
    }

    #[test]
    fn test_valid_batch() {
        let ops = vec![
            insert("A", "1"),
            insert("A", "2"),
            BatchOperation::Delete(EntityKey::new("A", "3").unwrap(), IfMatch::Any),
        ];
        assert!(validate(&ops).is_ok());
    }

    #[test]
    fn test_partition_mismatch_reports_index() {
        let ops = vec![insert("A", "1"), insert("A", "2"), insert("B", "1")];
        let failure = validate(&ops).unwrap_err();
        assert_eq!(failure.index, Some(2));
        assert!(matches!(failure.error, Error::BatchPartitionMismatch));
        assert_eq!(failure.to_string().split(':').next(), Some("2"));
    }

    #[test]
    fn test_duplicate_row() {
        let ops = vec![
            insert("A", "1"),
            BatchOperation::Delete(EntityKey::new("A", "1").unwrap(), IfMatch::Any),
        ];
        let failure = validate(&ops).unwrap_err();
        assert_eq!(failure.index, Some(1));
        assert!(matches!(failure.error, Error::BatchDuplicateRow));
    }

    #[test]
    fn test_size_limits() {
        assert!(validate(&[]).is_err());
        let ops: Vec<_> = (0..=MAX_BATCH_OPERATIONS)
            .map(|i| insert("A", &i.to_string()))
            .collect();
        let failure = validate(&ops).unwrap_err();
        assert_eq!(failure.index, None);
        assert!(validate(&ops[..MAX_BATCH_OPERATIONS]).is_ok());
    }

    #[test]
    fn test_retrieve_must_be_alone() {
        let key = EntityKey::new("A", "1").unwrap();
        assert!(validate(&[BatchOperation::Retrieve(key.clone())]).is_ok());
        let failure =
            validate(&[insert("A", "2"), BatchOperation::Retrieve(key)]).unwrap_err();
        assert_eq!(failure.index, Some(1));
    }
}
