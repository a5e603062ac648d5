//! In-memory document store.
//!
//! [`MemoryStore`] implements [`DocumentStore`] over a sorted map guarded by a
//! single lock. It is the reference backend for tests and the CLI dry runs.
//!
//! ## Limitations
//!
//! - **No persistence**: all state is lost when the process exits
//! - **Single-process only**: transactions are optimistic within this process

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use super::document::{Document, DocumentMeta, Fields, Value};
use super::query::Query;
use super::{DocumentStore, FieldTransform, Transaction, WriteOp};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct StoreState {
    docs: BTreeMap<String, Fields>,
    /// Last revision that touched each path, deletes included
    revisions: HashMap<String, u64>,
    revision: u64,
    /// Size of every committed batch, in commit order
    batches: Vec<usize>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::LockPoisoned { what: "memory store" }
}

/// In-memory document store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the document at `path`
    pub async fn put(&self, path: &str, fields: Fields) -> Result<()> {
        self.commit(vec![WriteOp::Set {
            path: path.to_string(),
            fields,
            merge: false,
            transforms: Vec::new(),
        }])
        .await
    }

    /// All document paths, sorted
    pub fn paths(&self) -> Result<Vec<String>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.docs.keys().cloned().collect())
    }

    /// Sizes of the batches committed so far
    pub fn batch_sizes(&self) -> Result<Vec<usize>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.batches.clone())
    }

    fn read_doc(state: &StoreState, path: &str) -> Option<Document> {
        state.docs.get(path).map(|fields| {
            let mut doc = Document::new(path);
            doc.fields = fields.clone();
            doc.meta = DocumentMeta {
                revision: state.revisions.get(path).copied().unwrap_or(0),
            };
            doc
        })
    }

    fn apply(state: &mut StoreState, ops: Vec<WriteOp>) {
        state.revision += 1;
        let revision = state.revision;
        state.batches.push(ops.len());

        for op in ops {
            state.revisions.insert(op.path().to_string(), revision);
            match op {
                WriteOp::Set {
                    path,
                    fields,
                    merge,
                    transforms,
                } => {
                    let mut target = if merge {
                        state.docs.remove(&path).unwrap_or_default()
                    } else {
                        Fields::new()
                    };
                    for (key, value) in fields {
                        set_dotted(&mut target, &key, value);
                    }
                    for (field, transform) in transforms {
                        apply_transform(&mut target, &field, transform);
                    }
                    state.docs.insert(path, target);
                }
                WriteOp::Delete { path } => {
                    state.docs.remove(&path);
                }
            }
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Document>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(Self::read_doc(&state, path))
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        let state = self.state.read().map_err(poison_err)?;
        let prefix = format!("{}/", query.collection);
        let children: Vec<Document> = state
            .docs
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter(|(path, _)| !path[prefix.len()..].contains('/'))
            .filter_map(|(path, _)| Self::read_doc(&state, path))
            .collect();
        drop(state);
        Ok(query.apply(children))
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().map_err(poison_err)?;
        Self::apply(&mut state, ops);
        Ok(())
    }

    async fn transaction(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            reads: HashMap::new(),
            writes: Vec::new(),
        }))
    }
}

/// Optimistic transaction over a [`MemoryStore`]
struct MemoryTransaction {
    state: Arc<RwLock<StoreState>>,
    /// Revision observed for each path read
    reads: HashMap<String, u64>,
    writes: Vec<WriteOp>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, path: &str) -> Result<Option<Document>> {
        let state = self.state.read().map_err(poison_err)?;
        let revision = state.revisions.get(path).copied().unwrap_or(0);
        self.reads.entry(path.to_string()).or_insert(revision);
        Ok(MemoryStore::read_doc(&state, path))
    }

    fn write(&mut self, op: WriteOp) {
        self.writes.push(op);
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { state, reads, writes } = *self;
        let mut state = state.write().map_err(poison_err)?;
        for (path, seen) in &reads {
            let current = state.revisions.get(path).copied().unwrap_or(0);
            if current != *seen {
                return Err(Error::TransactionConflict { path: path.clone() });
            }
        }
        if !writes.is_empty() {
            MemoryStore::apply(&mut state, writes);
        }
        Ok(())
    }
}

// =============================================================================
// Field helpers
// =============================================================================

/// Write `value` at a dotted path, deep-merging objects
fn set_dotted(fields: &mut Fields, dotted: &str, value: Value) {
    let (head, rest) = match dotted.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (dotted, None),
    };

    match rest {
        None => {
            if let Value::Object(incoming) = value {
                if let Some(Value::Object(existing)) = fields.get_mut(head) {
                    for (k, v) in incoming {
                        set_dotted(existing, &k, v);
                    }
                    return;
                }
                fields.insert(head.to_string(), Value::Object(incoming));
            } else {
                fields.insert(head.to_string(), value);
            }
        }
        Some(rest) => {
            let child = fields
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Fields::new()));
            if !matches!(child, Value::Object(_)) {
                *child = Value::Object(Fields::new());
            }
            if let Value::Object(inner) = child {
                set_dotted(inner, rest, value);
            }
        }
    }
}

fn apply_transform(fields: &mut Fields, dotted: &str, transform: FieldTransform) {
    let current = crate::storage::document::get_dotted(fields, dotted).cloned();
    let updated = match transform {
        FieldTransform::Delete => {
            remove_dotted(fields, dotted);
            return;
        }
        FieldTransform::Increment(delta) => match current {
            Some(Value::Float(f)) => Value::Float(f + delta as f64),
            Some(Value::Int(i)) => Value::Int(i + delta),
            _ => Value::Int(delta),
        },
        FieldTransform::ArrayUnion(item) => {
            let mut items = current.and_then(|v| v.as_array().cloned()).unwrap_or_default();
            if !items.contains(&item) {
                items.push(item);
            }
            Value::Array(items)
        }
        FieldTransform::ArrayRemove(item) => {
            let mut items = current.and_then(|v| v.as_array().cloned()).unwrap_or_default();
            items.retain(|v| v != &item);
            Value::Array(items)
        }
    };
    set_dotted(fields, dotted, updated);
}

fn remove_dotted(fields: &mut Fields, dotted: &str) {
    match dotted.split_once('.') {
        None => {
            fields.remove(dotted);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(inner)) = fields.get_mut(head) {
                remove_dotted(inner, rest);
            }
        }
    }
}
