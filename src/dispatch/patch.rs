//! Versioned patch logic
//!
//! A patch migrates one document of an entity to a data version. The
//! document records the version it is at in `@dataVersion`; dispatching to a
//! target version runs every patch in `(recorded, target]`, one transaction
//! per version, lowest first.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::Selector;
use crate::error::{Error, Result};
use crate::intent::{LogicResult, LogicStatus, WriteIntent};
use crate::paths::DATA_VERSION_FIELD;
use crate::storage::document::{Document, Fields};
use crate::validation::validate_doc_path;
use crate::version::Version;
use crate::writer::to_write_op;
use crate::Engine;

#[async_trait]
pub trait PatchLogic: Send + Sync {
    async fn run(&self, path: &str, doc: &Document) -> anyhow::Result<LogicResult>;
}

struct FnPatch<F>(F);

#[async_trait]
impl<F> PatchLogic for FnPatch<F>
where
    F: Fn(&str, &Document) -> anyhow::Result<LogicResult> + Send + Sync,
{
    async fn run(&self, path: &str, doc: &Document) -> anyhow::Result<LogicResult> {
        (self.0)(path, doc)
    }
}

/// Wrap a synchronous closure as a [`PatchLogic`]
pub fn patch_fn<F>(f: F) -> Arc<dyn PatchLogic>
where
    F: Fn(&str, &Document) -> anyhow::Result<LogicResult> + Send + Sync + 'static,
{
    Arc::new(FnPatch(f))
}

#[derive(Clone)]
pub struct PatchConfig {
    pub name: String,
    pub entities: Selector<String>,
    pub version: Version,
    pub logic: Arc<dyn PatchLogic>,
}

impl std::fmt::Debug for PatchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchConfig")
            .field("name", &self.name)
            .field("entities", &self.entities)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl PatchConfig {
    pub fn new(name: impl Into<String>, version: Version, logic: Arc<dyn PatchLogic>) -> Self {
        Self {
            name: name.into(),
            entities: Selector::All,
            version,
            logic,
        }
    }

    pub fn entities<S: Into<String>>(mut self, entities: impl IntoIterator<Item = S>) -> Self {
        self.entities = Selector::Only(entities.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatchRegistry {
    configs: Vec<PatchConfig>,
}

impl PatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, config: PatchConfig) {
        self.configs.push(config);
    }

    /// Patches for `entity` with `after < version <= upto`, grouped by
    /// version in ascending order
    pub fn pending(&self, entity: &str, after: Version, upto: Version) -> BTreeMap<Version, Vec<&PatchConfig>> {
        let entity = entity.to_string();
        let mut groups: BTreeMap<Version, Vec<&PatchConfig>> = BTreeMap::new();
        for config in &self.configs {
            if config.entities.allows(&entity) && config.version > after && config.version <= upto {
                groups.entry(config.version).or_default().push(config);
            }
        }
        groups
    }
}

/// `@dataVersion` of a document; missing or unreadable counts as zero
fn recorded_version(doc: &Document) -> Version {
    match doc.get(DATA_VERSION_FIELD).and_then(|v| v.as_str()) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Unreadable {} '{}' on '{}'", DATA_VERSION_FIELD, raw, doc.path);
            Version::ZERO
        }),
        None => Version::ZERO,
    }
}

impl Engine {
    /// Bring the document at `path` up to `target` by running its pending
    /// patches. Returns the patch results followed by the view results of
    /// the writes they caused.
    ///
    /// A version group commits only if every patch in it succeeded; a failed
    /// patch stops the remaining groups. A group the document has already
    /// reached, through a concurrent dispatch, is skipped.
    pub async fn dispatch_patch_logic(&self, target: Version, path: &str) -> Result<Vec<LogicResult>> {
        validate_doc_path(path)?;
        let entity = self.schema.entity_of(path).ok_or_else(|| Error::UnknownPath {
            path: path.to_string(),
        })?;
        let Some(doc) = self.store.get(path).await? else {
            tracing::debug!("Nothing to patch at '{}'", path);
            return Ok(Vec::new());
        };

        let groups = self.patches.pending(entity, recorded_version(&doc), target);
        let mut all = Vec::new();
        let mut applied = Vec::new();
        let mut retry = None;

        for (version, configs) in groups {
            let mut tx = self.store.transaction().await?;
            let Some(doc) = tx.get(path).await? else {
                tracing::debug!("'{}' disappeared before patch {}", path, version);
                break;
            };
            if recorded_version(&doc) >= version {
                tracing::debug!("'{}' already at {}, skipping", path, version);
                continue;
            }

            let mut results = Vec::with_capacity(configs.len());
            for config in configs {
                let started = Instant::now();
                let mut result = match config.logic.run(path, &doc).await {
                    Ok(result) => result,
                    Err(e) => LogicResult::error(config.name.clone(), e.to_string()),
                };
                if result.status == LogicStatus::PartialResult {
                    result = LogicResult::error(config.name.clone(), "patches cannot return partial results");
                }
                result.name = config.name.clone();
                result.exec_time = started.elapsed();
                results.push(result);
            }

            if let Some(cancelled) = results.iter().find(|r| r.status == LogicStatus::CancelThenRetry) {
                tracing::warn!("Patch {} cancelled '{}' at {} for retry", cancelled.name, path, version);
                retry = Some(cancelled.name.clone());
                break;
            }

            if let Some(failed) = results.iter().find(|r| r.status == LogicStatus::Error) {
                tracing::error!(
                    "Patch {} failed on '{}': {}",
                    failed.name,
                    path,
                    failed.message.as_deref().unwrap_or("no message")
                );
                all.extend(results);
                break;
            }

            let mut stamp = Fields::new();
            stamp.insert(DATA_VERSION_FIELD.to_string(), version.to_string().into());
            let mut intents: Vec<WriteIntent> = results.iter().flat_map(|r| r.documents.iter().cloned()).collect();
            intents.push(WriteIntent::merge(path, stamp));

            let writes = self.consolidator().consolidate_intents(intents).await?;
            for intent in writes.ordered() {
                if let Some(op) = to_write_op(intent) {
                    tx.write(op);
                }
            }

            match tx.commit().await {
                Ok(()) => {
                    tracing::info!("Patched '{}' to {}", path, version);
                    applied.extend(writes.ordered().into_iter().cloned());
                    all.extend(results);
                }
                Err(Error::TransactionConflict { .. }) => {
                    let reached = self.store.get(path).await?.map(|d| recorded_version(&d));
                    if reached.is_some_and(|v| v >= version) {
                        tracing::debug!("'{}' reached {} concurrently, skipping", path, version);
                        continue;
                    }
                    return Err(Error::TransactionConflict { path: path.to_string() });
                }
                Err(e) => return Err(e),
            }
        }

        all.extend(self.propagate_views(applied).await?);
        match retry {
            Some(logic) => Err(Error::RetryRequested { logic }),
            None => Ok(all),
        }
    }
}
