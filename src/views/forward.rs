//! Source-side view logic

use super::{
    back_link, changed_values, entry_merge, entry_removal, nest, with_generated, ViewContext, ViewCursor,
};
use crate::error::Result;
use crate::intent::{IntentAction, LogicResult, WriteIntent};
use crate::paths::{self, DATE_CREATED_FIELD};
use crate::schema::ViewDefinition;
use crate::storage::document::{Document, Fields, Value};
use crate::storage::query::{Filter, OrderDirection, Query};

pub(super) async fn propagate(
    ctx: &ViewContext<'_>,
    def: &ViewDefinition,
    intent: &WriteIntent,
    cursor: Option<&ViewCursor>,
) -> Result<LogicResult> {
    if intent.action == IntentAction::Create {
        let documents = sync_create(ctx, def, intent).await?;
        return Ok(LogicResult::finished(def.forward_name(), documents));
    }
    propagate_page(ctx, def, intent, cursor).await
}

/// Provision a view under every destination parent registered for the new
/// source's parent
async fn sync_create(ctx: &ViewContext<'_>, def: &ViewDefinition, intent: &WriteIntent) -> Result<Vec<WriteIntent>> {
    let src_path = intent.dst_path.as_str();
    let src_id = paths::doc_id(src_path);
    let src_parent = paths::parent_doc(src_path).unwrap_or_default();

    let query = Query::collection(paths::sync_create_collection(src_parent))
        .filter(Filter::eq("destEntity", def.dest_entity.as_str()));
    let registrations = ctx.store.query(&query).await?;

    let (fields, instructions) = changed_values(intent, &def.src_props);
    let mut out = Vec::new();

    for registration in registrations.iter().filter(|r| same_dest_prop(r, def)) {
        let Some(dst_parent) = registration.get("dstPath").and_then(Value::as_str) else {
            tracing::warn!("Registration '{}' has no dstPath", registration.path);
            continue;
        };

        match &def.dest_prop {
            None => {
                let Some(collection) = ctx.schema.col_path(&def.dest_entity) else {
                    continue;
                };
                let dest_path = paths::join(&[dst_parent, paths::doc_id(collection), src_id]);
                let mut create = WriteIntent::create(dest_path.as_str(), with_generated(fields.clone()));
                create.instructions = instructions.clone();
                out.push(create);
                out.push(WriteIntent::create(
                    paths::view_link_path(src_path, &dest_path, None),
                    back_link(&dest_path, def),
                ));
            }
            Some(prop) => {
                let mut merge = entry_merge(dst_parent, prop, src_id, fields.clone());
                merge.instructions.extend(nest(prop, src_id, instructions.clone()));
                out.push(merge);
                out.push(WriteIntent::create(
                    paths::view_link_path(src_path, dst_parent, Some(&prop.name)),
                    back_link(dst_parent, def),
                ));
            }
        }
    }

    if !out.is_empty() {
        tracing::info!("{}: provisioned {} views for '{}'", def.forward_name(), out.len() / 2, src_path);
    }
    Ok(out)
}

/// Push changes (or removal) of the source to one page of its views
async fn propagate_page(
    ctx: &ViewContext<'_>,
    def: &ViewDefinition,
    intent: &WriteIntent,
    cursor: Option<&ViewCursor>,
) -> Result<LogicResult> {
    let name = def.forward_name();
    let src_path = intent.dst_path.as_str();
    let src_id = paths::doc_id(src_path);
    let page_size = ctx.page_size.max(1);

    let mut query = Query::collection(paths::views_collection(src_path))
        .filter(Filter::eq("destEntity", def.dest_entity.as_str()))
        .order_by(DATE_CREATED_FIELD, OrderDirection::Asc)
        .limit(page_size);
    if let Some(cursor) = cursor {
        query = match cursor.last_created {
            Some(ref created) => query.start_after_key(created.as_str(), cursor.last_processed_id.as_str()),
            None => query.start_after(cursor.last_processed_id.as_str()),
        };
    }
    let links = ctx.store.query(&query).await?;
    let last = if links.len() == page_size { links.last() } else { None };
    let next = last.map(|link| ViewCursor {
        logic: name.clone(),
        last_processed_id: link.id.clone(),
        last_created: link.get(DATE_CREATED_FIELD).and_then(Value::as_str).map(str::to_string),
    });

    let source_deleted = intent.action == IntentAction::Delete;
    let (fields, instructions) = changed_values(intent, &def.src_props);
    let mut out = Vec::new();

    for link in links.iter().filter(|l| same_dest_prop(l, def)) {
        let Some(dest_path) = link.get("path").and_then(Value::as_str) else {
            tracing::warn!("Back-link '{}' has no path, removing it", link.path);
            out.push(WriteIntent::delete(link.path.as_str()));
            continue;
        };

        let dest = ctx.store.get(dest_path).await?;
        let target_missing = match (&dest, &def.dest_prop) {
            (None, _) => true,
            (Some(doc), Some(prop)) => doc.get_field(&format!("{}.{}", prop.name, src_id)).is_none(),
            (Some(_), None) => false,
        };
        if target_missing {
            tracing::debug!("View target of '{}' is gone, removing back-link", link.path);
            out.push(WriteIntent::delete(link.path.as_str()));
            continue;
        }

        if source_deleted {
            out.push(match &def.dest_prop {
                None => WriteIntent::delete(dest_path),
                Some(prop) => entry_removal(dest_path, prop, src_id),
            });
            out.push(WriteIntent::delete(link.path.as_str()));
            continue;
        }

        if !fields.is_empty() || !instructions.is_empty() {
            let update = match &def.dest_prop {
                None => {
                    let mut merge = WriteIntent::merge(dest_path, with_generated(fields.clone()));
                    merge.instructions = instructions.clone();
                    merge
                }
                Some(prop) => {
                    let mut merge = WriteIntent::merge(dest_path, nest(prop, src_id, with_generated(fields.clone())));
                    merge.instructions = nest(prop, src_id, instructions.clone());
                    merge
                }
            };
            out.push(update);
        }

        if let Some(heal) = heal_back_link(link, def) {
            out.push(heal);
        }
    }

    Ok(match next {
        Some(cursor) => {
            tracing::debug!(
                "{}: page of {} views full, continuing after {}",
                name,
                page_size,
                cursor.last_processed_id
            );
            LogicResult::partial(name, out, cursor.to_value())
        }
        None => LogicResult::finished(name, out),
    })
}

/// Merge correcting the recorded `srcProps` when the declaration changed
fn heal_back_link(link: &Document, def: &ViewDefinition) -> Option<WriteIntent> {
    let recorded = link.get("srcProps").map(Value::string_items).unwrap_or_default();
    if recorded == def.src_props {
        return None;
    }
    tracing::info!("Repairing srcProps on '{}'", link.path);
    let mut fields = Fields::new();
    fields.insert("srcProps".into(), def.src_props.clone().into());
    Some(WriteIntent::merge(link.path.as_str(), fields))
}

fn same_dest_prop(doc: &Document, def: &ViewDefinition) -> bool {
    doc.get("destProp").and_then(Value::as_str) == def.dest_prop_name()
}
