//! Write consolidation
//!
//! Reduces the intents produced by one processing cycle to at most one per
//! destination path.
//!
//! 1. **Expansion**: `recursive-delete` and `recursive-copy` become one
//!    `delete` / `copy` per descendant path; `copy` is resolved by reading
//!    its source.
//! 2. **Reduction**: intents for the same path meet in input order and are
//!    resolved by [`precedence`].
//!
//! Forms are never reduced; they are passed through in order.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::intent::{IntentAction, LogicResult, WriteIntent};
use crate::paths::PathHydrator;
use crate::schema::SchemaRegistry;
use crate::storage::DocumentStore;

/// Precedence class of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteClass {
    /// `merge` / `create`
    Write,
    /// A resolved `copy` (recreate)
    Copy,
    Delete,
}

impl WriteClass {
    fn of(action: IntentAction) -> Option<Self> {
        match action {
            IntentAction::Create | IntentAction::Merge => Some(WriteClass::Write),
            IntentAction::Copy => Some(WriteClass::Copy),
            IntentAction::Delete => Some(WriteClass::Delete),
            _ => None,
        }
    }
}

/// What happens when an incoming intent meets the current survivor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Field-wise union, later keys win
    Combine,
    /// The incoming intent becomes the survivor
    Replace,
    /// The incoming intent is discarded
    Drop,
    /// Identical effect; nothing to do
    Keep,
}

/// The precedence table, `existing × incoming`
pub fn precedence(existing: WriteClass, incoming: WriteClass) -> Resolution {
    use Resolution::*;
    use WriteClass::*;

    match (existing, incoming) {
        (Write, Write) | (Write, Copy) | (Copy, Write) | (Copy, Copy) => Combine,
        (Write, Delete) => Replace,
        (Copy, Delete) => Drop,
        (Delete, Write) => Drop,
        (Delete, Copy) => Replace,
        (Delete, Delete) => Keep,
    }
}

/// A conflict found during reduction. Always logged; never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Conflict {
    OverwrittenField { path: String, field: String },
    OverwrittenInstruction { path: String, field: String },
    Replaced { path: String, existing: IntentAction, incoming: IntentAction },
    Dropped { path: String, existing: IntentAction, incoming: IntentAction },
}

/// Result of consolidation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsolidatedWrites {
    /// Survivor per destination path
    pub writes: BTreeMap<String, WriteIntent>,
    /// Form submissions, in input order
    pub forms: Vec<WriteIntent>,
    pub conflicts: Vec<Conflict>,
}

impl ConsolidatedWrites {
    /// Survivors in application order: priority, then path
    pub fn ordered(&self) -> Vec<&WriteIntent> {
        let mut ordered: Vec<&WriteIntent> = self.writes.values().collect();
        ordered.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.dst_path.cmp(&b.dst_path)));
        ordered
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.forms.is_empty()
    }

    /// Every survivor and form, for re-consolidation with later intents
    pub fn into_intents(self) -> Vec<WriteIntent> {
        self.writes.into_values().chain(self.forms).collect()
    }
}

/// Runs both consolidation phases against a live store
pub struct Consolidator<'a> {
    schema: &'a SchemaRegistry,
    store: &'a dyn DocumentStore,
}

impl<'a> Consolidator<'a> {
    pub fn new(schema: &'a SchemaRegistry, store: &'a dyn DocumentStore) -> Self {
        Self { schema, store }
    }

    /// Consolidate every document of every result, in order
    pub async fn consolidate(&self, results: &[LogicResult]) -> Result<ConsolidatedWrites> {
        let intents = results.iter().flat_map(|r| r.documents.iter().cloned()).collect();
        self.consolidate_intents(intents).await
    }

    pub async fn consolidate_intents(&self, intents: Vec<WriteIntent>) -> Result<ConsolidatedWrites> {
        let expanded = self.expand(intents).await?;
        Ok(reduce(expanded))
    }

    async fn expand(&self, intents: Vec<WriteIntent>) -> Result<Vec<WriteIntent>> {
        let hydrator = PathHydrator::new(self.schema, self.store);
        let mut out = Vec::with_capacity(intents.len());

        for intent in intents {
            match intent.action {
                IntentAction::RecursiveDelete => {
                    for path in self.descendants(&hydrator, &intent.dst_path, &intent).await? {
                        let mut delete = WriteIntent::delete(path).priority(intent.priority);
                        delete.skip_run_view_logics = intent.skip_run_view_logics;
                        out.push(delete);
                    }
                }
                IntentAction::RecursiveCopy => {
                    let src_root = intent.source_path()?.to_string();
                    for src in self.descendants(&hydrator, &src_root, &intent).await? {
                        let dst = format!("{}{}", intent.dst_path, &src[src_root.len()..]);
                        let mut copy = WriteIntent::copy(src, dst).priority(intent.priority);
                        copy.skip_run_view_logics = intent.skip_run_view_logics;
                        if let Some(resolved) = self.resolve_copy(copy).await? {
                            out.push(resolved);
                        }
                    }
                }
                IntentAction::Copy => {
                    if let Some(resolved) = self.resolve_copy(intent).await? {
                        out.push(resolved);
                    }
                }
                _ => out.push(intent),
            }
        }

        Ok(out)
    }

    /// All paths under `root` honoring the intent's skip list. Falls back to
    /// `root` alone when the path is not in the schema.
    async fn descendants(&self, hydrator: &PathHydrator<'_>, root: &str, intent: &WriteIntent) -> Result<Vec<String>> {
        match hydrator.expand(root, &intent.skip_entity_during_recursion).await {
            Ok(grouped) => {
                let mut paths: Vec<String> = grouped.into_values().flatten().collect();
                paths.sort();
                Ok(paths)
            }
            Err(Error::UnknownPath { path }) => {
                tracing::warn!("No entity for '{}', {} applies to it alone", path, intent.action);
                Ok(vec![root.to_string()])
            }
            Err(e) => Err(e),
        }
    }

    /// Fill a copy with its source's current data. The intent's own fields
    /// are layered on top.
    async fn resolve_copy(&self, mut intent: WriteIntent) -> Result<Option<WriteIntent>> {
        let src = intent.source_path()?;
        let Some(source) = self.store.get(src).await? else {
            tracing::warn!("Copy source '{}' does not exist, dropping copy to '{}'", src, intent.dst_path);
            return Ok(None);
        };

        let mut fields = source.fields;
        if let Some(overrides) = intent.doc.take() {
            fields.extend(overrides);
        }
        intent.doc = Some(fields);
        Ok(Some(intent))
    }
}

/// Reduction phase over already-expanded intents
pub fn reduce(intents: Vec<WriteIntent>) -> ConsolidatedWrites {
    let mut out = ConsolidatedWrites::default();

    for incoming in intents {
        if incoming.action.is_form() {
            out.forms.push(incoming);
            continue;
        }
        let Some(incoming_class) = WriteClass::of(incoming.action) else {
            tracing::warn!(
                "Unexpanded {} intent for '{}' dropped",
                incoming.action,
                incoming.dst_path
            );
            continue;
        };

        let path = incoming.dst_path.clone();
        let Some(existing) = out.writes.get_mut(&path) else {
            out.writes.insert(path, incoming);
            continue;
        };
        let Some(existing_class) = WriteClass::of(existing.action) else {
            continue;
        };

        match precedence(existing_class, incoming_class) {
            Resolution::Combine => combine(existing, incoming, &mut out.conflicts),
            Resolution::Replace => {
                let conflict = Conflict::Replaced {
                    path: path.clone(),
                    existing: existing.action,
                    incoming: incoming.action,
                };
                tracing::warn!("{} on '{}' replaces pending {}", incoming.action, path, existing.action);
                out.conflicts.push(conflict);
                *existing = incoming;
            }
            Resolution::Drop => {
                tracing::warn!("{} on '{}' dropped, pending {} wins", incoming.action, path, existing.action);
                out.conflicts.push(Conflict::Dropped {
                    path,
                    existing: existing.action,
                    incoming: incoming.action,
                });
            }
            Resolution::Keep => {
                tracing::debug!("Duplicate {} on '{}'", incoming.action, path);
            }
        }
    }

    // Resolved copies are plain merges from here on
    for write in out.writes.values_mut() {
        if write.action == IntentAction::Copy {
            write.action = IntentAction::Merge;
        }
    }

    out
}

fn combine(existing: &mut WriteIntent, incoming: WriteIntent, conflicts: &mut Vec<Conflict>) {
    let path = existing.dst_path.clone();

    if let Some(doc) = incoming.doc {
        let target = existing.doc.get_or_insert_with(Default::default);
        for (field, value) in doc {
            if target.contains_key(&field) {
                tracing::warn!("Field '{}' on '{}' overwritten by a later intent", field, path);
                conflicts.push(Conflict::OverwrittenField {
                    path: path.clone(),
                    field: field.clone(),
                });
            }
            target.insert(field, value);
        }
    }

    for (field, instruction) in incoming.instructions {
        if existing.instructions.contains_key(&field) {
            tracing::warn!("Instruction on '{}' field '{}' overwritten by a later intent", path, field);
            conflicts.push(Conflict::OverwrittenInstruction {
                path: path.clone(),
                field: field.clone(),
            });
        }
        existing.instructions.insert(field, instruction);
    }

    existing.action = match (existing.action, incoming.action) {
        (IntentAction::Copy, _) | (_, IntentAction::Copy) => IntentAction::Copy,
        (_, IntentAction::Create) => IntentAction::Create,
        (current, _) => current,
    };
    if existing.src_path.is_none() {
        existing.src_path = incoming.src_path;
    }
    existing.priority = existing.priority.min(incoming.priority);
    existing.skip_run_view_logics &= incoming.skip_run_view_logics;
}
