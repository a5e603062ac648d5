//! Peer sync: copies of one entity held under different parents

use std::collections::{BTreeMap, HashMap};

use super::{changed_values, ViewContext};
use crate::error::Result;
use crate::intent::{LogicResult, WriteIntent};
use crate::paths::{self, PathHydrator};
use crate::schema::PeerSyncDefinition;

/// Push the synced fields of `intent` to every other existing copy with the
/// same document ID. The pushed merges do not trigger view logic again.
pub(super) async fn sync_peers(
    ctx: &ViewContext<'_>,
    def: &PeerSyncDefinition,
    intent: &WriteIntent,
) -> Result<LogicResult> {
    let name = def.name();
    let (fields, instructions) = changed_values(intent, &def.props);
    let Some(template) = ctx.schema.doc_path(&def.entity) else {
        return Ok(LogicResult::finished(name, Vec::new()));
    };
    if fields.is_empty() && instructions.is_empty() {
        return Ok(LogicResult::finished(name, Vec::new()));
    }

    let acting = intent.dst_path.as_str();
    let mut own_id = BTreeMap::new();
    own_id.insert(def.entity.clone(), paths::doc_id(acting).to_string());
    let peers_template = paths::fill_template(template, &own_id);

    let candidates = PathHydrator::new(ctx.schema, ctx.store)
        .hydrate(&peers_template, &HashMap::new())
        .await?;

    let mut out = Vec::new();
    for peer in candidates.iter().filter(|p| p.as_str() != acting) {
        if !ctx.store.exists(peer).await? {
            continue;
        }
        let mut merge = WriteIntent::merge(peer.as_str(), fields.clone()).skip_view_logics();
        merge.instructions = instructions.clone();
        out.push(merge);
    }

    tracing::debug!("{}: '{}' synced to {} peers", name, acting, out.len());
    Ok(LogicResult::finished(name, out))
}
