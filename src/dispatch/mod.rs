//! Logic dispatch
//!
//! Business logic is registered as [`LogicConfig`]s: a name, three selectors
//! (action types, modified fields, entities) and a [`Logic`] implementation.
//! An incoming [`Action`] runs every matching logic, newest registration
//! first, page after page:
//!
//! ```text
//! page 1: [c, b, a] ──► results ──► consolidate ──► write ──► views
//!            │  │  └─ finished: done
//!            │  └──── partial-result: runs again with its next_page marker
//!            └─────── cancel-then-retry: abort the pass
//! page 2: [b]
//! ...
//! ```
//!
//! `simulate-submit-form` intents found in a page re-enter dispatch as new
//! actions. When such a synthetic action asks to be retried it is parked in
//! the [`retry::RetryQueue`].

mod delay;
pub mod patch;
pub mod retry;

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::intent::{LogicResult, LogicStatus, WriteIntent};
use crate::storage::document::{Fields, Value};
use crate::validation::validate_doc_path;
use crate::Engine;

/// Field on a simulated form that selects the synthetic action type
pub const ACTION_TYPE_FIELD: &str = "@actionType";

/// Field on the runtime config document overriding the page cap
pub const MAX_PAGES_FIELD: &str = "maxLogicResultPages";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

impl std::str::FromStr for ActionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(ActionType::Create),
            "update" => Ok(ActionType::Update),
            "delete" => Ok(ActionType::Delete),
            other => Err(Error::Other(format!("Unknown action type '{}'", other))),
        }
    }
}

/// An inbound mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub event_id: String,
    pub action_type: ActionType,
    pub entity: String,
    pub path: String,
    #[serde(default)]
    pub document: Fields,
    #[serde(default)]
    pub modified_fields: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl Action {
    pub fn new(
        event_id: impl Into<String>,
        action_type: ActionType,
        entity: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            action_type,
            entity: entity.into(),
            path: path.into(),
            document: Fields::new(),
            modified_fields: BTreeSet::new(),
            user: None,
        }
    }

    /// Set the document; its keys become the modified fields
    pub fn document(mut self, document: Fields) -> Self {
        self.modified_fields = document.keys().cloned().collect();
        self.document = document;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// `all`, or an explicit list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Selector<T> {
    #[default]
    All,
    Only(Vec<T>),
}

impl<T: PartialEq> Selector<T> {
    pub fn allows(&self, value: &T) -> bool {
        match self {
            Selector::All => true,
            Selector::Only(values) => values.contains(value),
        }
    }

    /// True if any of `values` is selected
    pub fn allows_any<'v>(&self, mut values: impl Iterator<Item = &'v T>) -> bool
    where
        T: 'v,
    {
        match self {
            Selector::All => true,
            Selector::Only(_) => values.any(|v| self.allows(v)),
        }
    }
}

/// Scratch state shared by every logic of one dispatch, across pages
pub type SharedState = Fields;

/// A business logic function
#[async_trait]
pub trait Logic: Send + Sync {
    /// Run one page. `page` is the marker from this logic's previous
    /// `partial-result`, if any.
    async fn run(&self, action: &Action, state: &mut SharedState, page: Option<&Value>) -> anyhow::Result<LogicResult>;
}

struct FnLogic<F>(F);

#[async_trait]
impl<F> Logic for FnLogic<F>
where
    F: Fn(&Action, &mut SharedState, Option<&Value>) -> anyhow::Result<LogicResult> + Send + Sync,
{
    async fn run(&self, action: &Action, state: &mut SharedState, page: Option<&Value>) -> anyhow::Result<LogicResult> {
        (self.0)(action, state, page)
    }
}

/// Wrap a synchronous closure as a [`Logic`]
pub fn logic_fn<F>(f: F) -> Arc<dyn Logic>
where
    F: Fn(&Action, &mut SharedState, Option<&Value>) -> anyhow::Result<LogicResult> + Send + Sync + 'static,
{
    Arc::new(FnLogic(f))
}

#[derive(Clone)]
pub struct LogicConfig {
    pub name: String,
    pub action_types: Selector<ActionType>,
    pub modified_fields: Selector<String>,
    pub entities: Selector<String>,
    pub logic: Arc<dyn Logic>,
}

impl std::fmt::Debug for LogicConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicConfig")
            .field("name", &self.name)
            .field("action_types", &self.action_types)
            .field("modified_fields", &self.modified_fields)
            .field("entities", &self.entities)
            .finish_non_exhaustive()
    }
}

impl LogicConfig {
    /// A logic matching every action
    pub fn new(name: impl Into<String>, logic: Arc<dyn Logic>) -> Self {
        Self {
            name: name.into(),
            action_types: Selector::All,
            modified_fields: Selector::All,
            entities: Selector::All,
            logic,
        }
    }

    pub fn action_types(mut self, types: impl IntoIterator<Item = ActionType>) -> Self {
        self.action_types = Selector::Only(types.into_iter().collect());
        self
    }

    pub fn modified_fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.modified_fields = Selector::Only(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn entities<S: Into<String>>(mut self, entities: impl IntoIterator<Item = S>) -> Self {
        self.entities = Selector::Only(entities.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches(&self, action: &Action) -> bool {
        self.action_types.allows(&action.action_type)
            && self.entities.allows(&action.entity)
            && self.modified_fields.allows_any(action.modified_fields.iter())
    }
}

/// Registered business logic, in registration order
#[derive(Debug, Clone, Default)]
pub struct LogicRegistry {
    configs: Vec<LogicConfig>,
}

impl LogicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, config: LogicConfig) {
        self.configs.push(config);
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Matching logics, most recently registered first
    pub fn matching(&self, action: &Action) -> Vec<&LogicConfig> {
        self.configs.iter().rev().filter(|c| c.matches(action)).collect()
    }
}

/// Message-queue side of `submit-form` intents
#[async_trait]
pub trait FormSubmitter: Send + Sync {
    async fn submit(&self, form: &WriteIntent) -> anyhow::Result<()>;
}

pub type DispatchFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<LogicResult>>> + Send + 'a>>;

impl Engine {
    /// Run every logic matching `action` until none is left active or the
    /// page cap is reached. Each page is distributed before the next starts.
    ///
    /// A `cancel-then-retry` result aborts the pass with
    /// [`Error::RetryRequested`]; pages already distributed stay written.
    pub fn dispatch_business_logic<'a>(&'a self, action: &'a Action) -> DispatchFuture<'a> {
        Box::pin(async move {
            let mut active: Vec<(&LogicConfig, Option<Value>)> =
                self.logics.matching(action).into_iter().map(|c| (c, None)).collect();
            if active.is_empty() {
                tracing::debug!("No logic matches {} on '{}'", action.event_id, action.path);
                return Ok(Vec::new());
            }

            let max_pages = self.max_logic_pages().await?;
            let mut state = SharedState::new();
            let mut all = Vec::new();
            let mut page = 0;

            while !active.is_empty() {
                if page >= max_pages {
                    tracing::warn!(
                        "{}: page cap {} reached with {} logics still active",
                        action.event_id,
                        max_pages,
                        active.len()
                    );
                    break;
                }
                page += 1;

                let mut results = Vec::with_capacity(active.len());
                let mut still_active = Vec::new();
                for (config, marker) in active {
                    let started = Instant::now();
                    let mut result = match config.logic.run(action, &mut state, marker.as_ref()).await {
                        Ok(result) => result,
                        Err(e) => LogicResult::error(config.name.clone(), e.to_string()),
                    };
                    result.name = config.name.clone();
                    result.exec_time = started.elapsed();

                    match result.status {
                        LogicStatus::Finished => {}
                        LogicStatus::Error => {
                            tracing::error!(
                                "Logic {} failed on {}: {}",
                                config.name,
                                action.event_id,
                                result.message.as_deref().unwrap_or("no message")
                            );
                        }
                        LogicStatus::PartialResult => match result.next_page.clone() {
                            Some(marker) => still_active.push((config, Some(marker))),
                            None => tracing::warn!("Logic {} returned a partial result without a marker", config.name),
                        },
                        LogicStatus::CancelThenRetry => {
                            tracing::warn!("Logic {} cancelled {} for retry", config.name, action.event_id);
                            return Err(Error::RetryRequested {
                                logic: config.name.clone(),
                            });
                        }
                    }
                    results.push(result);
                }
                active = still_active;

                let report = self.distribute(&results).await?;
                for form in report.simulated_forms {
                    self.dispatch_simulated(action, form).await?;
                }
                all.extend(results);
            }

            tracing::info!("{}: {} logic results over {} pages", action.event_id, all.len(), page);
            Ok(all)
        })
    }

    /// Dispatch a `simulate-submit-form` intent as a synthetic action.
    /// If it asks to be retried it is queued with backoff.
    pub async fn dispatch_simulated(&self, parent: &Action, form: WriteIntent) -> Result<()> {
        let Some(action) = self.simulated_action(parent, form) else {
            return Ok(());
        };

        match self.dispatch_business_logic(&action).await {
            Ok(_) => Ok(()),
            Err(Error::RetryRequested { logic }) => {
                tracing::info!("{} queued for retry after {} asked for it", action.event_id, logic);
                self.retries.schedule(action, 1, Instant::now())?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn simulated_action(&self, parent: &Action, form: WriteIntent) -> Option<Action> {
        if let Err(e) = validate_doc_path(&form.dst_path) {
            tracing::warn!("Simulated form has an invalid path: {}", e);
            return None;
        }
        let Some(entity) = self.schema.entity_of(&form.dst_path) else {
            tracing::warn!("Simulated form targets unknown path '{}', dropping it", form.dst_path);
            return None;
        };

        let mut document = form.doc.unwrap_or_default();
        let action_type = match document.remove(ACTION_TYPE_FIELD) {
            Some(value) => match value.as_str().map(str::parse::<ActionType>) {
                Some(Ok(action_type)) => action_type,
                _ => {
                    tracing::warn!("Invalid {} on simulated form for '{}', using create", ACTION_TYPE_FIELD, form.dst_path);
                    ActionType::Create
                }
            },
            None => ActionType::Create,
        };

        let event_id = format!("{}-{}", parent.event_id, ulid::Ulid::new());
        let mut action = Action::new(event_id, action_type, entity, form.dst_path).document(document);
        action.user = parent.user.clone();
        Some(action)
    }

    /// Page cap from the runtime config document, or the configured default
    async fn max_logic_pages(&self) -> Result<usize> {
        let runtime = self.store.get(&self.config.runtime_config_path).await?;
        let cap = runtime
            .as_ref()
            .and_then(|doc| doc.get(MAX_PAGES_FIELD))
            .and_then(Value::as_i64)
            .filter(|n| *n > 0)
            .map(|n| n as usize);
        Ok(cap.unwrap_or(self.config.max_logic_pages))
    }
}
