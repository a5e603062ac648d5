//! Destination-side view logic
//!
//! Keeps the source's `@views` back-links in step with the destinations that
//! exist. Back-links are checked before they are written, so a destination
//! provisioned by the forward logic (which writes its own back-link) causes
//! no further work here.

use std::collections::{BTreeMap, BTreeSet};

use super::{back_link, entry_merge, entry_removal, stored_values, with_generated, ViewContext};
use crate::error::Result;
use crate::intent::{IntentAction, Instruction, LogicResult, WriteIntent};
use crate::paths;
use crate::schema::{DestProp, ViewDefinition};
use crate::storage::document::{Fields, Value};

pub(super) async fn register(ctx: &ViewContext<'_>, def: &ViewDefinition, intent: &WriteIntent) -> Result<LogicResult> {
    let documents = match def.dest_prop {
        None => document_view(ctx, def, intent).await?,
        Some(ref prop) => property_view(ctx, def, prop, intent).await?,
    };
    Ok(LogicResult::finished(def.reverse_name(), documents))
}

/// Source path of the view at `dest_path` whose source ID is `src_id`.
///
/// Placeholders of the source template are filled from the destination's own
/// matched values, with the source entity's placeholder set to `src_id`.
fn source_path(ctx: &ViewContext<'_>, def: &ViewDefinition, dest_path: &str, src_id: &str) -> Option<String> {
    let src_template = ctx.schema.doc_path(&def.src_entity)?;
    let dest_template = ctx.schema.doc_path(&def.dest_entity)?;
    let mut values: BTreeMap<String, String> = paths::match_placeholders(dest_template, dest_path)?;
    values.insert(def.src_entity.clone(), src_id.to_string());

    let path = paths::fill_template(src_template, &values);
    if paths::has_placeholder(&path) {
        tracing::warn!("Cannot resolve source of '{}' from '{}'", dest_path, src_template);
        return None;
    }
    Some(path)
}

async fn document_view(ctx: &ViewContext<'_>, def: &ViewDefinition, intent: &WriteIntent) -> Result<Vec<WriteIntent>> {
    let dest_path = intent.dst_path.as_str();
    let Some(src_path) = source_path(ctx, def, dest_path, paths::doc_id(dest_path)) else {
        return Ok(Vec::new());
    };
    let link_path = paths::view_link_path(&src_path, dest_path, None);
    let link_exists = ctx.store.exists(&link_path).await?;

    if intent.action == IntentAction::Delete {
        return Ok(if link_exists {
            vec![WriteIntent::delete(link_path)]
        } else {
            Vec::new()
        });
    }

    if link_exists {
        tracing::debug!("Back-link '{}' already present", link_path);
        return Ok(Vec::new());
    }

    let Some(source) = ctx.store.get(&src_path).await? else {
        tracing::warn!("View '{}' has no source at '{}', removing it", dest_path, src_path);
        return Ok(vec![WriteIntent::delete(dest_path)]);
    };

    let mut out = vec![
        WriteIntent::create(link_path, back_link(dest_path, def)),
        WriteIntent::merge(dest_path, with_generated(stored_values(&source, &def.src_props))),
    ];
    if def.options.sync_create {
        let dest_parent = paths::parent_doc(dest_path).unwrap_or_default();
        out.extend(register_sync_create(ctx, def, &src_path, dest_parent, None).await?);
    }
    Ok(out)
}

async fn property_view(
    ctx: &ViewContext<'_>,
    def: &ViewDefinition,
    prop: &DestProp,
    intent: &WriteIntent,
) -> Result<Vec<WriteIntent>> {
    let dest_path = intent.dst_path.as_str();
    let (added, removed) = entry_changes(intent, prop);
    let mut out = Vec::new();

    for src_id in &removed {
        let Some(src_path) = source_path(ctx, def, dest_path, src_id) else {
            continue;
        };
        let link_path = paths::view_link_path(&src_path, dest_path, Some(&prop.name));
        if ctx.store.exists(&link_path).await? {
            out.push(WriteIntent::delete(link_path));
        }
    }

    for src_id in added.difference(&removed) {
        let Some(src_path) = source_path(ctx, def, dest_path, src_id) else {
            continue;
        };
        let link_path = paths::view_link_path(&src_path, dest_path, Some(&prop.name));
        if ctx.store.exists(&link_path).await? {
            continue;
        }

        let Some(source) = ctx.store.get(&src_path).await? else {
            tracing::warn!("Entry '{}' of '{}' has no source, removing it", src_id, dest_path);
            out.push(entry_removal(dest_path, prop, src_id));
            continue;
        };

        out.push(WriteIntent::create(link_path, back_link(dest_path, def)));
        out.push(entry_merge(dest_path, prop, src_id, stored_values(&source, &def.src_props)));
        if def.options.sync_create {
            out.extend(register_sync_create(ctx, def, &src_path, dest_path, Some(&prop.name)).await?);
        }
    }

    Ok(out)
}

/// Source IDs whose map entries the intent adds and removes
fn entry_changes(intent: &WriteIntent, prop: &DestProp) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut added = BTreeSet::new();
    let mut removed = BTreeSet::new();
    let prefix = format!("{}.", prop.name);
    let membership = prop.membership_field();

    for (key, value) in intent.doc.iter().flatten() {
        if *key == prop.name {
            if let Value::Object(entries) = value {
                added.extend(entries.keys().cloned());
            }
        } else if let Some(rest) = key.strip_prefix(&prefix) {
            added.extend(rest.split('.').next().map(str::to_string));
        }
    }

    for (key, instruction) in &intent.instructions {
        if Some(key) == membership.as_ref() {
            match instruction {
                Instruction::ArrayUnion(id) => {
                    added.insert(id.clone());
                }
                Instruction::ArrayRemove(id) => {
                    removed.insert(id.clone());
                }
                _ => {}
            }
        } else if let Some(rest) = key.strip_prefix(&prefix) {
            match (rest.split_once('.'), instruction) {
                (None, Instruction::Delete) => {
                    removed.insert(rest.to_string());
                }
                (Some((id, _)), _) => {
                    added.insert(id.to_string());
                }
                _ => {}
            }
        }
    }

    (added, removed)
}

/// Registration letting future children of the source's parent provision
/// views under `dest_parent`; nothing if one already exists
async fn register_sync_create(
    ctx: &ViewContext<'_>,
    def: &ViewDefinition,
    src_path: &str,
    dest_parent: &str,
    dest_prop: Option<&str>,
) -> Result<Vec<WriteIntent>> {
    let src_parent = paths::parent_doc(src_path).unwrap_or_default();
    let registration = paths::sync_create_path(src_parent, dest_parent, dest_prop);
    if ctx.store.exists(&registration).await? {
        return Ok(Vec::new());
    }

    let mut fields = Fields::new();
    fields.insert("destEntity".into(), def.dest_entity.clone().into());
    fields.insert("dstPath".into(), dest_parent.into());
    fields.insert("srcPath".into(), src_parent.into());
    if let Some(prop) = dest_prop {
        fields.insert("destProp".into(), prop.into());
    }
    tracing::info!("Registering syncCreate {} -> {}", src_parent, dest_parent);
    Ok(vec![WriteIntent::create(registration, fields)])
}

#[cfg(test)]
mod tests {
    use super::super::tests::{apply, doc, SOCIAL};
    use super::*;
    use crate::schema::SchemaRegistry;
    use crate::storage::memory::MemoryStore;
    use crate::storage::DocumentStore;

    fn friend_view(schema: &SchemaRegistry) -> ViewDefinition {
        schema
            .view_definitions()
            .iter()
            .find(|d| d.dest_entity == "friend")
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn test_new_view_links_and_materializes() {
        let schema = SchemaRegistry::from_yaml_str(SOCIAL).unwrap();
        let store = MemoryStore::new();
        store
            .put("users/u1", doc(&[("name", "Ada"), ("email", "ada@x"), ("bio", "b")]))
            .await
            .unwrap();
        store.put("users/u2/friends/u1", Fields::new()).await.unwrap();
        let ctx = ViewContext {
            schema: &schema,
            store: &store,
            page_size: 10,
        };
        let def = friend_view(&schema);
        let intent = WriteIntent::create("users/u2/friends/u1", Fields::new());

        let first = register(&ctx, &def, &intent).await.unwrap();
        assert_eq!(first.documents.len(), 2);
        apply(&store, std::slice::from_ref(&first)).await;

        let link = store.get("users/u1/@views/users+u2+friends+u1").await.unwrap().unwrap();
        assert_eq!(link.get("path"), Some(&Value::from("users/u2/friends/u1")));
        let view = store.get("users/u2/friends/u1").await.unwrap().unwrap();
        assert_eq!(view.get("email"), Some(&Value::from("ada@x")));
        assert!(view.get("bio").is_none());

        // Running again is a no-op
        let second = register(&ctx, &def, &intent).await.unwrap();
        assert!(second.documents.is_empty());
    }

    #[tokio::test]
    async fn test_view_without_source_is_removed() {
        let schema = SchemaRegistry::from_yaml_str(SOCIAL).unwrap();
        let store = MemoryStore::new();
        let ctx = ViewContext {
            schema: &schema,
            store: &store,
            page_size: 10,
        };
        let intent = WriteIntent::create("users/u2/friends/ghost", Fields::new());

        let result = register(&ctx, &friend_view(&schema), &intent).await.unwrap();
        assert_eq!(result.documents, vec![WriteIntent::delete("users/u2/friends/ghost")]);
    }

    #[tokio::test]
    async fn test_member_registers_sync_create_once() {
        let schema = SchemaRegistry::from_yaml_str(SOCIAL).unwrap();
        let store = MemoryStore::new();
        store.put("users/u1", doc(&[("name", "Ada")])).await.unwrap();
        store.put("users/u2", doc(&[("name", "Bo")])).await.unwrap();
        let ctx = ViewContext {
            schema: &schema,
            store: &store,
            page_size: 10,
        };
        let def = schema
            .view_definitions()
            .iter()
            .find(|d| d.dest_entity == "member")
            .unwrap()
            .clone();

        let first = register(&ctx, &def, &WriteIntent::create("servers/s1/members/u1", Fields::new()))
            .await
            .unwrap();
        assert_eq!(first.documents.len(), 3);
        apply(&store, std::slice::from_ref(&first)).await;

        let registration = store.get("@syncCreateViews/servers+s1").await.unwrap().unwrap();
        assert_eq!(registration.get("dstPath"), Some(&Value::from("servers/s1")));
        assert_eq!(registration.get("destEntity"), Some(&Value::from("member")));

        let second = register(&ctx, &def, &WriteIntent::create("servers/s1/members/u2", Fields::new()))
            .await
            .unwrap();
        assert_eq!(second.documents.len(), 2);
    }

    #[tokio::test]
    async fn test_property_entries_added_and_removed() {
        let schema = SchemaRegistry::from_yaml_str(SOCIAL).unwrap();
        let store = MemoryStore::new();
        store.put("users/u1", doc(&[("name", "Ada")])).await.unwrap();
        store.put("users/u2", Fields::new()).await.unwrap();
        let ctx = ViewContext {
            schema: &schema,
            store: &store,
            page_size: 10,
        };
        let def = schema
            .view_definitions()
            .iter()
            .find(|d| d.dest_prop.is_some())
            .unwrap()
            .clone();

        let follow = WriteIntent::merge("users/u2", Fields::new())
            .instruction("@followers", Instruction::ArrayUnion("u1".into()));
        let result = register(&ctx, &def, &follow).await.unwrap();
        apply(&store, std::slice::from_ref(&result)).await;

        let user = store.get("users/u2").await.unwrap().unwrap();
        assert_eq!(user.get_field("followers.u1.name"), Some(&Value::from("Ada")));
        assert!(store
            .exists("users/u1/@views/users+u2#followers")
            .await
            .unwrap());

        let unfollow = WriteIntent::merge("users/u2", Fields::new())
            .instruction("followers.u1", Instruction::Delete)
            .instruction("@followers", Instruction::ArrayRemove("u1".into()));
        let result = register(&ctx, &def, &unfollow).await.unwrap();
        assert_eq!(
            result.documents,
            vec![WriteIntent::delete("users/u1/@views/users+u2#followers")]
        );
    }
}
