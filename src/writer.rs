//! Batched writer
//!
//! One writer is shared by every concurrent caller of an [`crate::Engine`].
//! Writes accumulate in a single pending batch; when it reaches the
//! threshold the batch is taken out under the lock and committed after the
//! lock is released, so two callers never fill two half-empty batches and
//! no batch ever exceeds the threshold.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{Error, Result};
use crate::intent::{IntentAction, WriteIntent};
use crate::storage::{DocumentStore, WriteOp};

/// Largest batch the backing store accepts, minus one
pub const DEFAULT_BATCH_THRESHOLD: usize = 499;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::LockPoisoned { what: "batched writer" }
}

/// Physical write for a consolidated intent. Forms and unexpanded
/// recursive intents have none.
pub fn to_write_op(intent: &WriteIntent) -> Option<WriteOp> {
    let merge = match intent.action {
        IntentAction::Create => false,
        IntentAction::Merge | IntentAction::Copy => true,
        IntentAction::Delete => {
            return Some(WriteOp::Delete {
                path: intent.dst_path.clone(),
            })
        }
        _ => return None,
    };

    Some(WriteOp::Set {
        path: intent.dst_path.clone(),
        fields: intent.doc.clone().unwrap_or_default(),
        merge,
        transforms: intent
            .instructions
            .iter()
            .map(|(field, instruction)| (field.clone(), instruction.to_transform()))
            .collect(),
    })
}

pub struct BatchedWriter {
    store: Arc<dyn DocumentStore>,
    threshold: usize,
    pending: Mutex<Vec<WriteOp>>,
}

impl BatchedWriter {
    pub fn new(store: Arc<dyn DocumentStore>, threshold: usize) -> Self {
        Self {
            store,
            threshold: threshold.max(1),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue a write, committing the batch if it is now full
    pub async fn write(&self, op: WriteOp) -> Result<()> {
        let full = {
            let mut pending = self.pending.lock().map_err(poison_err)?;
            pending.push(op);
            if pending.len() >= self.threshold {
                Some(std::mem::take(&mut *pending))
            } else {
                None
            }
        };

        if let Some(batch) = full {
            tracing::debug!("Batch full, committing {} writes", batch.len());
            self.store.commit(batch).await?;
        }
        Ok(())
    }

    /// Enqueue the physical write for an intent
    pub async fn apply(&self, intent: &WriteIntent) -> Result<()> {
        match to_write_op(intent) {
            Some(op) => self.write(op).await,
            None => {
                tracing::debug!("No physical write for {} on '{}'", intent.action, intent.dst_path);
                Ok(())
            }
        }
    }

    /// Commit whatever is pending
    pub async fn flush(&self) -> Result<()> {
        let batch = std::mem::take(&mut *self.pending.lock().map_err(poison_err)?);
        if batch.is_empty() {
            return Ok(());
        }
        tracing::debug!("Flushing {} writes", batch.len());
        self.store.commit(batch).await
    }

    pub fn pending(&self) -> Result<usize> {
        Ok(self.pending.lock().map_err(poison_err)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Instruction;
    use crate::storage::document::{Fields, Value};
    use crate::storage::memory::MemoryStore;
    use crate::storage::FieldTransform;

    fn set(path: String) -> WriteOp {
        WriteOp::Set {
            path,
            fields: Fields::new(),
            merge: false,
            transforms: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_commits_at_threshold() {
        let store = MemoryStore::new();
        let writer = BatchedWriter::new(Arc::new(store.clone()), 3);

        for i in 0..7 {
            writer.write(set(format!("items/{}", i))).await.unwrap();
        }
        assert_eq!(store.batch_sizes().unwrap(), vec![3, 3]);
        assert_eq!(writer.pending().unwrap(), 1);

        writer.flush().await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(store.batch_sizes().unwrap(), vec![3, 3, 1]);
        assert_eq!(store.paths().unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_concurrent_writers_share_one_batch() {
        let store = MemoryStore::new();
        let writer = Arc::new(BatchedWriter::new(Arc::new(store.clone()), DEFAULT_BATCH_THRESHOLD));

        let mut handles = Vec::new();
        for task in 0..10 {
            let writer = Arc::clone(&writer);
            handles.push(tokio::spawn(async move {
                for i in 0..100 {
                    writer.write(set(format!("items/{}-{}", task, i))).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        writer.flush().await.unwrap();

        let sizes = store.batch_sizes().unwrap();
        assert_eq!(sizes, vec![499, 499, 2]);
        assert_eq!(store.paths().unwrap().len(), 1000);
    }

    #[test]
    fn test_merge_intent_layers_instructions() {
        let intent = WriteIntent::merge("users/u1", Fields::new())
            .field("name", "Ada")
            .instruction("friendCount", Instruction::Increment(1));

        match to_write_op(&intent) {
            Some(WriteOp::Set {
                fields,
                merge,
                transforms,
                ..
            }) => {
                assert!(merge);
                assert_eq!(fields["name"], Value::from("Ada"));
                assert_eq!(transforms, vec![("friendCount".to_string(), FieldTransform::Increment(1))]);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(to_write_op(&WriteIntent::submit_form("forms/f1", Fields::new())).is_none());
    }
}
