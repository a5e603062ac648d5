//! Template hydration and descendant expansion

use std::collections::{BTreeMap, HashMap, VecDeque};

use super::placeholder_entity;
use crate::error::{Error, Result};
use crate::schema::SchemaRegistry;
use crate::storage::query::{Filter, Query};
use crate::storage::DocumentStore;

/// Resolves templates into concrete paths by reading live data
pub struct PathHydrator<'a> {
    schema: &'a SchemaRegistry,
    store: &'a dyn DocumentStore,
}

impl<'a> PathHydrator<'a> {
    pub fn new(schema: &'a SchemaRegistry, store: &'a dyn DocumentStore) -> Self {
        Self { schema, store }
    }

    /// Every concrete path matching `template`.
    ///
    /// Placeholders are resolved left to right by listing the IDs of the
    /// collection before them, filtered by the entity's condition if one is
    /// given. Output is sorted.
    pub async fn hydrate(&self, template: &str, conditions: &HashMap<String, Filter>) -> Result<Vec<String>> {
        let mut ids_cache = HashMap::new();
        let mut out = self.resolve(template, conditions, &mut ids_cache).await?;
        out.sort();
        Ok(out)
    }

    /// Descendants of `path` (itself included), grouped by entity.
    ///
    /// `exclude` names entities to skip; their descendants are skipped too.
    pub async fn expand(&self, path: &str, exclude: &[String]) -> Result<BTreeMap<String, Vec<String>>> {
        let entity = self.schema.entity_of(path).ok_or_else(|| Error::UnknownPath {
            path: path.to_string(),
        })?;
        let root_template = self.schema.doc_path_or_err(entity)?;

        let excluded_templates: Vec<&str> = exclude.iter().filter_map(|e| self.schema.doc_path(e)).collect();
        let is_excluded = |template: &str| excluded_templates.iter().any(|x| is_same_or_descendant(template, x));

        let none = HashMap::new();
        let mut ids_cache = HashMap::new();
        let mut grouped = BTreeMap::new();

        for (descendant, template) in self.schema.doc_paths() {
            if !is_same_or_descendant(template, root_template) || is_excluded(template) {
                continue;
            }

            let partial = format!("{}{}", path, &template[root_template.len()..]);
            let mut resolved = self.resolve(&partial, &none, &mut ids_cache).await?;
            if resolved.is_empty() {
                continue;
            }
            resolved.sort();
            grouped.insert(descendant.clone(), resolved);
        }

        tracing::debug!(
            "Expanded {} into {} paths",
            path,
            grouped.values().map(Vec::len).sum::<usize>()
        );
        Ok(grouped)
    }

    /// Breadth-first placeholder resolution. `ids_cache` maps a concrete
    /// collection path to its unfiltered child IDs so shared ancestors are
    /// queried once.
    async fn resolve(
        &self,
        template: &str,
        conditions: &HashMap<String, Filter>,
        ids_cache: &mut HashMap<String, Vec<String>>,
    ) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([template.to_string()]);

        while let Some(partial) = queue.pop_front() {
            let segments: Vec<&str> = partial.split('/').collect();
            let Some(index) = segments.iter().position(|s| placeholder_entity(s).is_some()) else {
                out.push(partial);
                continue;
            };

            let entity = placeholder_entity(segments[index]).unwrap_or_default();
            let collection = segments[..index].join("/");
            let condition = conditions.get(entity);

            let ids = match ids_cache.get(&collection) {
                Some(ids) if condition.is_none() => ids.clone(),
                _ => {
                    let mut query = Query::collection(collection.as_str());
                    if let Some(filter) = condition {
                        query = query.filter(filter.clone());
                    }
                    let ids = self.store.list_ids(&query).await?;
                    if condition.is_none() {
                        ids_cache.insert(collection.clone(), ids.clone());
                    }
                    ids
                }
            };

            let tail = segments[index + 1..].join("/");
            for id in ids {
                let next = if tail.is_empty() {
                    format!("{}/{}", collection, id)
                } else {
                    format!("{}/{}/{}", collection, id, tail)
                };
                queue.push_back(next);
            }
        }

        Ok(out)
    }
}

fn is_same_or_descendant(template: &str, ancestor: &str) -> bool {
    template == ancestor || (template.starts_with(ancestor) && template[ancestor.len()..].starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::document::Fields;
    use crate::storage::memory::MemoryStore;
    use crate::storage::query::FilterOp;

    const SCHEMA: &str = r#"
entities: [user, post, comment, like]
structure:
  users:
    user:
      posts:
        post:
          comments:
            comment:
          likes:
            like:
"#;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        for path in [
            "users/u1",
            "users/u2",
            "users/u1/posts/p1",
            "users/u1/posts/p2",
            "users/u1/posts/p1/comments/c1",
            "users/u1/posts/p1/comments/c2",
            "users/u1/posts/p2/likes/l1",
            "users/u2/posts/p9",
        ] {
            let mut fields = Fields::new();
            if path == "users/u2" {
                fields.insert("active".into(), true.into());
            }
            store.put(path, fields).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_hydrate_all_and_filtered() {
        let schema = SchemaRegistry::from_yaml_str(SCHEMA).unwrap();
        let store = seeded().await;
        let hydrator = PathHydrator::new(&schema, &store);

        let posts = hydrator
            .hydrate("users/{userId}/posts/{postId}", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(posts, vec!["users/u1/posts/p1", "users/u1/posts/p2", "users/u2/posts/p9"]);

        let mut conditions = HashMap::new();
        conditions.insert("user".to_string(), Filter::new("active", FilterOp::Eq, true));
        let active = hydrator
            .hydrate("users/{userId}/posts/{postId}", &conditions)
            .await
            .unwrap();
        assert_eq!(active, vec!["users/u2/posts/p9"]);
    }

    #[tokio::test]
    async fn test_expand_groups_by_entity() {
        let schema = SchemaRegistry::from_yaml_str(SCHEMA).unwrap();
        let store = seeded().await;
        let hydrator = PathHydrator::new(&schema, &store);

        let expanded = hydrator.expand("users/u1", &[]).await.unwrap();
        assert_eq!(expanded["user"], vec!["users/u1"]);
        assert_eq!(expanded["post"], vec!["users/u1/posts/p1", "users/u1/posts/p2"]);
        assert_eq!(
            expanded["comment"],
            vec!["users/u1/posts/p1/comments/c1", "users/u1/posts/p1/comments/c2"]
        );
        assert_eq!(expanded["like"], vec!["users/u1/posts/p2/likes/l1"]);
    }

    #[tokio::test]
    async fn test_expand_excludes_subtrees() {
        let schema = SchemaRegistry::from_yaml_str(SCHEMA).unwrap();
        let store = seeded().await;
        let hydrator = PathHydrator::new(&schema, &store);

        let expanded = hydrator.expand("users/u1", &["post".to_string()]).await.unwrap();
        assert_eq!(expanded.keys().collect::<Vec<_>>(), vec!["user"]);
    }

    #[tokio::test]
    async fn test_expand_unknown_path() {
        let schema = SchemaRegistry::from_yaml_str(SCHEMA).unwrap();
        let store = MemoryStore::new();
        let hydrator = PathHydrator::new(&schema, &store);

        let err = hydrator.expand("things/t1", &[]).await.unwrap_err();
        assert!(matches!(err, Error::UnknownPath { .. }));
    }
}
