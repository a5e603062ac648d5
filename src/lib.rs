//! docflow - write orchestration with materialized views
//!
//! A reactive engine in front of a hierarchical document store. Business
//! logic turns an inbound action into write intents; docflow consolidates
//! them into one write per document, applies them, and keeps the
//! denormalized view copies declared in the schema in sync.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         docflow Engine                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  viewmark   │  │   Schema    │  │   Logic Dispatch        │  │
//! │  │  (markers)  │─►│  Registry   │  │   (paging, patches,     │  │
//! │  └─────────────┘  └──────┬──────┘  │    retry queue)         │  │
//! │                          │         └───────────┬─────────────┘  │
//! │                          ▼                     │ LogicResults   │
//! │  ┌─────────────────────────────────────────────▼───────────────┐│
//! │  │                   Write Consolidator                        ││
//! │  │  (expand recursive intents, one survivor per path)          ││
//! │  └──────────────────────────┬──────────────────────────────────┘│
//! │                             ▼                                   │
//! │  ┌─────────────────────────────────────────────────────────────┐│
//! │  │            Batched Writer / Transactions                    ││
//! │  └──────────────────────────┬──────────────────────────────────┘│
//! │                             ▼ applied intents                   │
//! │  ┌─────────────────────────────────────────────────────────────┐│
//! │  │                 View Materialization                        ││
//! │  │  (forward, reverse, peer sync; output re-enters above)      ││
//! │  └──────────────────────────┬──────────────────────────────────┘│
//! │                             ▼                                   │
//! │  ┌─────────────────────────────────────────────────────────────┐│
//! │  │                 DocumentStore (trait)                       ││
//! │  │  users/{userId}/friends/{friendId}   .../@views/{linkId}    ││
//! │  └─────────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod consolidate;
pub mod dispatch;
pub mod error;
pub mod intent;
pub mod paths;
pub mod schema;
pub mod storage;
pub mod validation;
pub mod version;
pub mod views;
pub mod writer;

pub use config::EngineConfig;
pub use consolidate::{ConsolidatedWrites, Conflict};
pub use dispatch::{Action, ActionType, FormSubmitter, Logic, LogicConfig};
pub use error::{Error, Result};
pub use intent::{IntentAction, Instruction, LogicResult, LogicStatus, WriteIntent};
pub use schema::SchemaRegistry;
pub use storage::document::Document;
pub use storage::DocumentStore;
pub use version::Version;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use consolidate::Consolidator;
use dispatch::patch::{PatchConfig, PatchRegistry};
use dispatch::retry::RetryQueue;
use dispatch::LogicRegistry;
use paths::PathHydrator;
use storage::query::Filter;
use views::{ViewContext, ViewCursor, ViewRegistry};
use writer::{to_write_op, BatchedWriter};

/// The engine handle. Shared by every concurrent caller; the batched writer
/// and the retry queue are its only mutable parts.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) schema: Arc<SchemaRegistry>,
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) writer: BatchedWriter,
    pub(crate) views: ViewRegistry,
    pub(crate) logics: LogicRegistry,
    pub(crate) patches: PatchRegistry,
    pub(crate) retries: RetryQueue,
    pub(crate) forms: Option<Arc<dyn FormSubmitter>>,
    pub(crate) app_version: Version,
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    config: EngineConfig,
    schema: Arc<SchemaRegistry>,
    store: Arc<dyn DocumentStore>,
    logics: LogicRegistry,
    patches: PatchRegistry,
    forms: Option<Arc<dyn FormSubmitter>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn logic(mut self, config: LogicConfig) -> Self {
        self.logics.register(config);
        self
    }

    pub fn patch(mut self, config: PatchConfig) -> Self {
        self.patches.register(config);
        self
    }

    pub fn form_submitter(mut self, submitter: Arc<dyn FormSubmitter>) -> Self {
        self.forms = Some(submitter);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let app_version = self.config.app_version.parse()?;
        for diagnostic in self.schema.diagnostics() {
            tracing::debug!("Schema diagnostic: {}", diagnostic);
        }

        Ok(Engine {
            writer: BatchedWriter::new(self.store.clone(), self.config.batch_threshold),
            views: ViewRegistry::from_schema(&self.schema),
            retries: RetryQueue::new(&self.config.retry),
            config: self.config,
            schema: self.schema,
            store: self.store,
            logics: self.logics,
            patches: self.patches,
            forms: self.forms,
            app_version,
        })
    }
}

/// What one [`Engine::distribute`] call did
#[derive(Debug, Default)]
pub struct DistributionReport {
    /// Consolidated writes applied, in application order
    pub applied: Vec<WriteIntent>,
    /// Results of the view logic those writes triggered, all rounds
    pub view_results: Vec<LogicResult>,
    pub conflicts: Vec<Conflict>,
    /// `submit-form` intents handed to the form submitter
    pub submitted_forms: usize,
    /// `simulate-submit-form` intents for the caller to dispatch
    pub simulated_forms: Vec<WriteIntent>,
}

impl Engine {
    pub fn builder(schema: impl Into<Arc<SchemaRegistry>>, store: Arc<dyn DocumentStore>) -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            schema: schema.into(),
            store,
            logics: LogicRegistry::new(),
            patches: PatchRegistry::new(),
            forms: None,
        }
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Target version of view logic
    pub fn app_version(&self) -> Version {
        self.app_version
    }

    pub(crate) fn consolidator(&self) -> Consolidator<'_> {
        Consolidator::new(&self.schema, self.store.as_ref())
    }

    fn view_context(&self) -> ViewContext<'_> {
        ViewContext {
            schema: &self.schema,
            store: self.store.as_ref(),
            page_size: self.config.view_page_size,
        }
    }

    /// Concrete paths matching a template, placeholders constrained by
    /// `conditions` keyed by entity
    pub async fn hydrate(&self, template: &str, conditions: &HashMap<String, Filter>) -> Result<Vec<String>> {
        PathHydrator::new(&self.schema, self.store.as_ref())
            .hydrate(template, conditions)
            .await
    }

    /// `path` and every existing descendant document, grouped by entity
    pub async fn expand(&self, path: &str, exclude: &[String]) -> Result<BTreeMap<String, Vec<String>>> {
        PathHydrator::new(&self.schema, self.store.as_ref())
            .expand(path, exclude)
            .await
    }

    pub async fn consolidate(&self, results: &[LogicResult]) -> Result<ConsolidatedWrites> {
        self.consolidator().consolidate(results).await
    }

    /// Apply consolidated writes through the batched writer, then flush
    pub async fn apply_writes(&self, writes: &ConsolidatedWrites) -> Result<()> {
        for intent in writes.ordered() {
            self.writer.apply(intent).await?;
        }
        self.writer.flush().await
    }

    /// Run the view logic triggered by one applied intent
    pub async fn run_view_logic(
        &self,
        intent: &WriteIntent,
        target: Version,
        cursor: Option<&ViewCursor>,
    ) -> Vec<LogicResult> {
        views::run_view_logic(&self.view_context(), &self.views, intent, target, cursor).await
    }

    /// Consolidate, write and propagate the output of one page of logic.
    ///
    /// Transactional results commit together in one store transaction; the
    /// rest go through the batched writer. View logic then runs over every
    /// applied write, round after round, until it stops producing writes.
    pub async fn distribute(&self, results: &[LogicResult]) -> Result<DistributionReport> {
        let (transactional, batched): (Vec<LogicResult>, Vec<LogicResult>) =
            results.iter().cloned().partition(|r| r.transactional);
        let mut report = DistributionReport::default();

        if !transactional.is_empty() {
            let writes = self.consolidate(&transactional).await?;
            let mut tx = self.store.transaction().await?;
            for intent in writes.ordered() {
                if let Some(op) = to_write_op(intent) {
                    tx.write(op);
                }
            }
            tx.commit().await?;
            self.absorb(&mut report, writes).await?;
        }

        let writes = self.consolidate(&batched).await?;
        self.apply_writes(&writes).await?;
        self.absorb(&mut report, writes).await?;

        report.view_results = self.propagate_views(report.applied.clone()).await?;
        tracing::info!(
            "Distributed {} writes, {} view results, {} conflicts",
            report.applied.len(),
            report.view_results.len(),
            report.conflicts.len()
        );
        Ok(report)
    }

    async fn absorb(&self, report: &mut DistributionReport, writes: ConsolidatedWrites) -> Result<()> {
        report.applied.extend(writes.ordered().into_iter().cloned());
        report.conflicts.extend(writes.conflicts);

        for form in writes.forms {
            match form.action {
                IntentAction::SimulateSubmitForm => report.simulated_forms.push(form),
                _ => match &self.forms {
                    Some(submitter) => {
                        submitter
                            .submit(&form)
                            .await
                            .map_err(|e| Error::Other(format!("Form submission to '{}' failed: {}", form.dst_path, e)))?;
                        report.submitted_forms += 1;
                    }
                    None => tracing::warn!("No form submitter, dropping form for '{}'", form.dst_path),
                },
            }
        }
        Ok(())
    }

    /// View logic over `applied`, feeding each round's output back in.
    ///
    /// Writes produced by view logic are one level deeper than the intent
    /// that produced them; past `max_view_depth` they are applied but not
    /// propagated further. Paged forward logics resume from their cursor in
    /// the next round at their own depth, so a long `@views` list is always
    /// walked to the end.
    pub(crate) async fn propagate_views(&self, applied: Vec<WriteIntent>) -> Result<Vec<LogicResult>> {
        let ctx = self.view_context();
        let mut work: Vec<(WriteIntent, Option<ViewCursor>, usize)> =
            applied.into_iter().map(|i| (i, None, 0)).collect();
        let mut all = Vec::new();

        while !work.is_empty() {
            let mut by_depth: BTreeMap<usize, Vec<LogicResult>> = BTreeMap::new();
            let mut continuations = Vec::new();
            let mut too_deep = 0;

            for (intent, cursor, depth) in work {
                if depth >= self.config.max_view_depth {
                    too_deep += 1;
                    continue;
                }
                let results = views::run_view_logic(&ctx, &self.views, &intent, self.app_version, cursor.as_ref()).await;
                for result in &results {
                    if result.status == LogicStatus::PartialResult {
                        if let Some(next) = result.next_page.as_ref().and_then(ViewCursor::from_value) {
                            continuations.push((intent.clone(), Some(next), depth));
                        }
                    }
                }
                by_depth.entry(depth).or_default().extend(results);
            }
            if too_deep > 0 {
                tracing::warn!(
                    "View depth {} reached, {} writes not propagated further",
                    self.config.max_view_depth,
                    too_deep
                );
            }

            let mut next = Vec::new();
            for (depth, results) in by_depth {
                let writes = self.consolidate(&results).await?;
                self.apply_writes(&writes).await?;
                next.extend(writes.ordered().into_iter().cloned().map(|i| (i, None, depth + 1)));
                all.extend(results);
            }
            next.extend(continuations);
            work = next;
        }

        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::document::{Fields, Value};
    use crate::storage::memory::MemoryStore;
    use std::sync::Mutex;

    const FRIENDS: &str = r#"
entities: [user, friend]
structure:
  users:
    user:
      friends:
        friend: ["View:user:name,email"]
"#;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), Value::from(*v))).collect()
    }

    fn engine(store: &MemoryStore) -> Engine {
        let schema = SchemaRegistry::from_yaml_str(FRIENDS).unwrap();
        Engine::builder(schema, Arc::new(store.clone())).build().unwrap()
    }

    #[derive(Default)]
    struct Outbox(Mutex<Vec<String>>);

    #[async_trait::async_trait]
    impl FormSubmitter for Outbox {
        async fn submit(&self, form: &WriteIntent) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(form.dst_path.clone());
            Ok(())
        }
    }

    #[test]
    fn test_builder_rejects_bad_version() {
        let schema = SchemaRegistry::from_yaml_str(FRIENDS).unwrap();
        let config = EngineConfig {
            app_version: "one".into(),
            ..EngineConfig::default()
        };
        let result = Engine::builder(schema, Arc::new(MemoryStore::new())).config(config).build();
        assert!(matches!(result, Err(Error::InvalidVersion { .. })));
    }

    #[tokio::test]
    async fn test_distribute_materializes_views() {
        let store = MemoryStore::new();
        let engine = engine(&store);

        let create = vec![LogicResult::finished(
            "seed",
            vec![
                WriteIntent::create("users/u1", fields(&[("name", "Ada"), ("email", "ada@x")])),
                WriteIntent::create("users/u2/friends/u1", Fields::new()),
            ],
        )];
        let report = engine.distribute(&create).await.unwrap();
        assert_eq!(report.applied.len(), 2);

        let friend = store.get("users/u2/friends/u1").await.unwrap().unwrap();
        assert_eq!(friend.get("name"), Some(&Value::from("Ada")));
        assert!(store.exists("users/u1/@views/users+u2+friends+u1").await.unwrap());

        let rename = vec![LogicResult::finished(
            "rename",
            vec![WriteIntent::merge("users/u1", fields(&[("name", "Grace")]))],
        )];
        engine.distribute(&rename).await.unwrap();
        let friend = store.get("users/u2/friends/u1").await.unwrap().unwrap();
        assert_eq!(friend.get("name"), Some(&Value::from("Grace")));
        assert_eq!(friend.get("email"), Some(&Value::from("ada@x")));
    }

    #[tokio::test]
    async fn test_transactional_results_and_forms() {
        let store = MemoryStore::new();
        let outbox = Arc::new(Outbox::default());
        let schema = SchemaRegistry::from_yaml_str(FRIENDS).unwrap();
        let engine = Engine::builder(schema, Arc::new(store.clone()))
            .form_submitter(outbox.clone())
            .build()
            .unwrap();

        let results = vec![
            LogicResult::finished("tx", vec![WriteIntent::create("users/u1", fields(&[("name", "Ada")]))]).transactional(),
            LogicResult::finished(
                "forms",
                vec![
                    WriteIntent::submit_form("users/u9", Fields::new()),
                    WriteIntent::simulate_submit_form("users/u8", Fields::new()),
                ],
            ),
        ];
        let report = engine.distribute(&results).await.unwrap();

        assert!(store.exists("users/u1").await.unwrap());
        assert_eq!(report.submitted_forms, 1);
        assert_eq!(*outbox.0.lock().unwrap(), vec!["users/u9"]);
        assert_eq!(report.simulated_forms.len(), 1);
        assert!(!store.exists("users/u8").await.unwrap());
        assert!(!store.exists("users/u9").await.unwrap());
    }
}
