//! Storage layer for docflow
//!
//! docflow does not persist anything itself. It drives a document store
//! through the [`DocumentStore`] trait, which asks for:
//!
//! - keyed document reads
//! - collection queries (filters, ordering, cursors)
//! - atomic multi-document batches with field transforms
//! - optimistic multi-document transactions
//!
//! [`memory::MemoryStore`] implements the contract in-process.

pub mod document;
pub mod memory;
pub mod query;

use async_trait::async_trait;

use crate::error::Result;
use document::{Document, Fields, Value};
use query::Query;

/// Field-level transform applied atomically by the store
#[derive(Debug, Clone, PartialEq)]
pub enum FieldTransform {
    /// Add to a numeric field (missing fields count as zero)
    Increment(i64),
    /// Add an element to an array if absent
    ArrayUnion(Value),
    /// Remove all occurrences of an element from an array
    ArrayRemove(Value),
    /// Remove the field
    Delete,
}

/// A physical write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert-or-update. With `merge` the fields are deep-merged into the
    /// existing document (dotted keys address nested fields); without it the
    /// document is replaced. Transforms run after the field write.
    Set {
        path: String,
        fields: Fields,
        merge: bool,
        transforms: Vec<(String, FieldTransform)>,
    },
    Delete {
        path: String,
    },
}

impl WriteOp {
    pub fn path(&self) -> &str {
        match self {
            WriteOp::Set { path, .. } | WriteOp::Delete { path } => path,
        }
    }
}

/// Backing document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read one document
    async fn get(&self, path: &str) -> Result<Option<Document>>;

    /// Query the direct children of a collection
    async fn query(&self, query: &Query) -> Result<Vec<Document>>;

    /// Apply writes atomically
    async fn commit(&self, ops: Vec<WriteOp>) -> Result<()>;

    /// Begin a transaction
    async fn transaction(&self) -> Result<Box<dyn Transaction>>;

    /// IDs of the documents in a collection matching `query`
    async fn list_ids(&self, query: &Query) -> Result<Vec<String>> {
        Ok(self.query(query).await?.into_iter().map(|d| d.id).collect())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.get(path).await?.is_some())
    }
}

/// A multi-document transaction. Reads are tracked; `commit` fails with
/// [`crate::Error::TransactionConflict`] if any document read has changed since.
#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, path: &str) -> Result<Option<Document>>;

    /// Buffer a write until commit
    fn write(&mut self, op: WriteOp);

    async fn commit(self: Box<Self>) -> Result<()>;
}
