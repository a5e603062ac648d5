//! View materialization
//!
//! Every [`ViewDefinition`] yields two logics and every
//! [`PeerSyncDefinition`] one:
//!
//! - **forward** (`view:user->friend`): runs when a source document changes;
//!   pushes the changed source fields to every destination recorded in the
//!   source's `@views` back-links, or removes the copies when the source goes
//!   away. Pages through `@views`.
//! - **reverse** (`view:friend<-user`): runs when a destination appears or
//!   disappears; maintains the back-link at the source and the syncCreate
//!   registration of the parent pair.
//! - **peer sync** (`peer:chat`): runs when a copy of a peer-synced entity
//!   changes; pushes the same fields to the copies held under other parents.
//!
//! A logic only runs when its version is at or below the target version, and
//! of several versions of one logic only the highest eligible runs.

mod forward;
mod peer;
mod reverse;

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::intent::{IntentAction, Instruction, LogicResult, WriteIntent};
use crate::paths::{self, DATE_CREATED_FIELD, DATE_GENERATED_FIELD};
use crate::schema::{DestProp, PeerSyncDefinition, SchemaRegistry, ViewDefinition};
use crate::storage::document::{Document, Fields, Value};
use crate::storage::DocumentStore;
use crate::version::Version;

/// Where a paged forward logic stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewCursor {
    /// Name of the logic to resume
    pub logic: String,
    /// Last `@views` document ID already processed
    pub last_processed_id: String,
    /// Its `@dateCreated`, so paging resumes even if that link was removed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_created: Option<String>,
}

impl ViewCursor {
    pub fn to_value(&self) -> Value {
        let mut fields = Fields::new();
        fields.insert("logic".into(), self.logic.clone().into());
        fields.insert("lastProcessedId".into(), self.last_processed_id.clone().into());
        if let Some(ref created) = self.last_created {
            fields.insert("lastCreated".into(), created.clone().into());
        }
        Value::Object(fields)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let fields = value.as_object()?;
        Some(Self {
            logic: fields.get("logic")?.as_str()?.to_string(),
            last_processed_id: fields.get("lastProcessedId")?.as_str()?.to_string(),
            last_created: fields.get("lastCreated").and_then(Value::as_str).map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewLogic {
    Forward(ViewDefinition),
    Reverse(ViewDefinition),
    PeerSync(PeerSyncDefinition),
}

impl ViewLogic {
    pub fn name(&self) -> String {
        match self {
            ViewLogic::Forward(def) => def.forward_name(),
            ViewLogic::Reverse(def) => def.reverse_name(),
            ViewLogic::PeerSync(def) => def.name(),
        }
    }

    pub fn version(&self) -> Version {
        match self {
            ViewLogic::Forward(def) | ViewLogic::Reverse(def) => def.version,
            ViewLogic::PeerSync(def) => def.version,
        }
    }

    /// Whether this logic reacts to `intent` on a document of `entity`
    pub fn matches(&self, entity: &str, intent: &WriteIntent) -> bool {
        let touches = |props: &[String]| {
            let modified = intent.modified_fields();
            props.iter().any(|p| modified.contains(p))
        };

        match self {
            ViewLogic::Forward(def) => {
                entity == def.src_entity
                    && match intent.action {
                        IntentAction::Create => def.options.sync_create,
                        IntentAction::Merge => touches(&def.src_props),
                        IntentAction::Delete => true,
                        _ => false,
                    }
            }
            ViewLogic::Reverse(def) => {
                entity == def.dest_entity
                    && match (&def.dest_prop, intent.action) {
                        (None, IntentAction::Create | IntentAction::Delete) => true,
                        (Some(prop), IntentAction::Create | IntentAction::Merge) => {
                            let mut watched = vec![prop.name.clone()];
                            watched.extend(prop.membership_field());
                            touches(&watched)
                        }
                        _ => false,
                    }
            }
            ViewLogic::PeerSync(def) => {
                entity == def.entity && intent.action == IntentAction::Merge && touches(&def.props)
            }
        }
    }
}

/// All view logics of a schema
#[derive(Debug, Clone, Default)]
pub struct ViewRegistry {
    logics: Vec<ViewLogic>,
}

impl ViewRegistry {
    pub fn from_schema(schema: &SchemaRegistry) -> Self {
        let mut logics = Vec::new();
        for def in schema.view_definitions() {
            logics.push(ViewLogic::Forward(def.clone()));
            logics.push(ViewLogic::Reverse(def.clone()));
        }
        for def in schema.peer_sync_definitions() {
            logics.push(ViewLogic::PeerSync(def.clone()));
        }
        Self { logics }
    }

    pub fn logics(&self) -> &[ViewLogic] {
        &self.logics
    }

    /// Matching logics at or below `target`, highest version per name
    pub fn eligible(&self, entity: &str, intent: &WriteIntent, target: Version) -> Vec<&ViewLogic> {
        let mut best: BTreeMap<String, &ViewLogic> = BTreeMap::new();
        for logic in &self.logics {
            if logic.version() > target || !logic.matches(entity, intent) {
                continue;
            }
            best.entry(logic.name())
                .and_modify(|current| {
                    if logic.version() > current.version() {
                        *current = logic;
                    }
                })
                .or_insert(logic);
        }
        best.into_values().collect()
    }
}

/// What view logics need from the engine
pub struct ViewContext<'a> {
    pub schema: &'a SchemaRegistry,
    pub store: &'a dyn DocumentStore,
    pub page_size: usize,
}

/// Run every view logic triggered by an applied intent.
///
/// With a cursor, only the logic it names runs, resuming after the cursor.
/// A failing logic becomes an `error` result and does not stop the others.
pub async fn run_view_logic(
    ctx: &ViewContext<'_>,
    registry: &ViewRegistry,
    intent: &WriteIntent,
    target: Version,
    cursor: Option<&ViewCursor>,
) -> Vec<LogicResult> {
    if intent.skip_run_view_logics || paths::is_bookkeeping(&intent.dst_path) {
        return Vec::new();
    }
    let Some(entity) = ctx.schema.entity_of(&intent.dst_path) else {
        tracing::debug!("No entity for '{}', no view logic", intent.dst_path);
        return Vec::new();
    };

    let mut results = Vec::new();
    for logic in registry.eligible(entity, intent, target) {
        let name = logic.name();
        if cursor.is_some_and(|c| c.logic != name) {
            continue;
        }

        let started = Instant::now();
        let outcome = match logic {
            ViewLogic::Forward(def) => {
                forward::propagate(ctx, def, intent, cursor).await
            }
            ViewLogic::Reverse(def) => reverse::register(ctx, def, intent).await,
            ViewLogic::PeerSync(def) => peer::sync_peers(ctx, def, intent).await,
        };

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("View logic {} failed on '{}': {}", name, intent.dst_path, e);
                LogicResult::error(name, e.to_string())
            }
        };
        result.exec_time = started.elapsed();
        results.push(result);
    }
    results
}

// =============================================================================
// Shared helpers
// =============================================================================

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Fields and instructions of `intent` whose top-level key is in `props`
fn changed_values(intent: &WriteIntent, props: &[String]) -> (Fields, BTreeMap<String, Instruction>) {
    let selected = |key: &str| props.iter().any(|p| p == key.split('.').next().unwrap_or(key));

    let fields = intent
        .doc
        .iter()
        .flatten()
        .filter(|(key, _)| selected(key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let instructions = intent
        .instructions
        .iter()
        .filter(|(key, _)| selected(key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    (fields, instructions)
}

/// `props` as currently stored on `doc`
fn stored_values(doc: &Document, props: &[String]) -> Fields {
    props
        .iter()
        .filter_map(|p| doc.get(p).map(|v| (p.clone(), v.clone())))
        .collect()
}

fn with_generated(mut fields: Fields) -> Fields {
    fields.insert(DATE_GENERATED_FIELD.to_string(), timestamp().into());
    fields
}

/// Prefix every key with `prop.srcId.`
fn nest<V>(prop: &DestProp, src_id: &str, entries: impl IntoIterator<Item = (String, V)>) -> BTreeMap<String, V> {
    entries
        .into_iter()
        .map(|(key, value)| (format!("{}.{}.{}", prop.name, src_id, key), value))
        .collect()
}

/// Back-link document stored at `{src}/@views/{linkId}`
fn back_link(dest_path: &str, def: &ViewDefinition) -> Fields {
    let mut fields = Fields::new();
    fields.insert("path".into(), dest_path.into());
    fields.insert("srcProps".into(), def.src_props.clone().into());
    fields.insert("destEntity".into(), def.dest_entity.clone().into());
    if let Some(prop) = def.dest_prop_name() {
        fields.insert("destProp".into(), prop.into());
    }
    fields.insert(DATE_CREATED_FIELD.into(), timestamp().into());
    fields
}

/// Merge writing one map entry of a property-scoped view
fn entry_merge(dest_path: &str, prop: &DestProp, src_id: &str, fields: Fields) -> WriteIntent {
    let mut merge = WriteIntent::merge(dest_path, nest(prop, src_id, with_generated(fields)));
    if let Some(member) = prop.membership_field() {
        merge = merge.instruction(member, Instruction::ArrayUnion(src_id.to_string()));
    }
    merge
}

/// Merge removing one map entry of a property-scoped view
fn entry_removal(dest_path: &str, prop: &DestProp, src_id: &str) -> WriteIntent {
    let mut merge = WriteIntent::merge(dest_path, Fields::new())
        .instruction(format!("{}.{}", prop.name, src_id), Instruction::Delete);
    if let Some(member) = prop.membership_field() {
        merge = merge.instruction(member, Instruction::ArrayRemove(src_id.to_string()));
    }
    merge
}
