//! Breadth-first schema compilation
//!
//! The declaration tree is walked level by level. Every structural node is
//! recorded as a traversal path; array-valued nodes are view declaration
//! points and are recorded without descending:
//!
//! ```text
//! users/user/friends/friend=View:user:name,email     document-level view
//! users/user#followers=ViewMap:user:name             property-scoped view
//! ```

use std::collections::{BTreeMap, VecDeque};

use regex::Regex;
use viewmark::{Marker, MarkerKind};

use super::view_def::{PeerSyncDefinition, ViewDefinition};
use super::{Node, VIEWS_KEY};
use crate::paths;

/// One path produced by the traversal
#[derive(Debug, Clone)]
pub(crate) struct TraversalPath {
    /// Encoded form, e.g. `users/user#followers=ViewMap:user:name`
    pub encoded: String,
    pub view: Option<ViewPoint>,
}

/// A marker together with where it was declared
#[derive(Debug, Clone)]
pub(crate) struct ViewPoint {
    pub marker: Marker,
    pub dest_entity: String,
    pub dest_prop: Option<String>,
}

impl TraversalPath {
    fn plain(path: String) -> Self {
        Self { encoded: path, view: None }
    }

    /// Path with any `#prop=` or `=marker` suffix removed
    pub fn structural(&self) -> &str {
        let end = self.encoded.find(['#', '=']).unwrap_or(self.encoded.len());
        &self.encoded[..end]
    }
}

pub(crate) fn traverse(root: &Node) -> Vec<TraversalPath> {
    let mut out = Vec::new();
    let mut queue: VecDeque<(&Node, String)> = VecDeque::new();
    queue.push_back((root, String::new()));

    while let Some((node, path)) = queue.pop_front() {
        let Node::Branch(children) = node else {
            continue;
        };

        for (key, child) in children {
            if key == VIEWS_KEY {
                // Document-level markers attached to this node's own entity
                if let (Node::Views(markers), Some(entity)) = (child, path.rsplit('/').next()) {
                    if !path.is_empty() {
                        for marker in markers {
                            out.push(view_path(&path, entity, None, marker));
                        }
                    }
                }
                continue;
            }

            let child_path = paths::join(&[&path, key]);
            match child {
                Node::Branch(_) => {
                    out.push(TraversalPath::plain(child_path.clone()));
                    queue.push_back((child, child_path));
                }
                Node::Views(markers) => {
                    if markers.is_empty() {
                        out.push(TraversalPath::plain(child_path));
                        continue;
                    }
                    for marker in markers {
                        if marker.kind.is_property_scoped() {
                            let parent_entity = path.rsplit('/').next().unwrap_or_default();
                            out.push(view_path(&path, parent_entity, Some(key), marker));
                        } else {
                            out.push(view_path(&child_path, key, None, marker));
                        }
                    }
                }
            }
        }
    }

    out
}

fn view_path(base: &str, dest_entity: &str, dest_prop: Option<&str>, marker: &Marker) -> TraversalPath {
    let encoded = match dest_prop {
        Some(prop) => format!("{}#{}={}", base, prop, marker),
        None => format!("{}={}", base, marker),
    };
    TraversalPath {
        encoded,
        view: Some(ViewPoint {
            marker: marker.clone(),
            dest_entity: dest_entity.to_string(),
            dest_prop: dest_prop.map(str::to_string),
        }),
    }
}

/// Canonical templates: for each entity, the first traversal path whose last
/// structural segment is the entity, with entity segments turned into
/// placeholders.
pub(crate) fn derive_templates(entities: &[String], traversal: &[TraversalPath]) -> BTreeMap<String, String> {
    let mut templates = BTreeMap::new();
    for entity in entities {
        let found = traversal
            .iter()
            .map(TraversalPath::structural)
            .find(|path| path.rsplit('/').next() == Some(entity.as_str()));

        if let Some(path) = found {
            let template = path
                .split('/')
                .map(|segment| {
                    if entities.iter().any(|e| e == segment) {
                        paths::placeholder(segment)
                    } else {
                        segment.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join("/");
            templates.insert(entity.clone(), template);
        }
    }
    templates
}

/// Anchored pattern capturing each ID segment of a template
pub(crate) fn matching_pattern(template: &str) -> Result<Regex, regex::Error> {
    let body = template
        .split('/')
        .map(|segment| {
            if paths::placeholder_entity(segment).is_some() {
                "([^/]+)".to_string()
            } else {
                regex::escape(segment)
            }
        })
        .collect::<Vec<_>>()
        .join("/");
    Regex::new(&format!("^{}$", body))
}

/// Definitions found at the traversal's view points
pub(crate) fn collect_definitions(
    entities: &[String],
    traversal: &[TraversalPath],
    diagnostics: &mut Vec<String>,
) -> (Vec<ViewDefinition>, Vec<PeerSyncDefinition>) {
    let known = |e: &str| entities.iter().any(|k| k == e);
    let mut views = Vec::new();
    let mut peers = Vec::new();

    for point in traversal.iter().filter_map(|t| t.view.as_ref()) {
        if !known(&point.dest_entity) {
            let message = format!(
                "View marker '{}' sits under '{}', which is not an entity",
                point.marker, point.dest_entity
            );
            tracing::warn!("{}", message);
            diagnostics.push(message);
            continue;
        }

        if point.marker.kind == MarkerKind::PeerSync {
            if let Some(def) = PeerSyncDefinition::from_marker(&point.marker, &point.dest_entity, diagnostics) {
                peers.push(def);
            }
            continue;
        }

        let Some(def) = ViewDefinition::from_marker(
            &point.marker,
            &point.dest_entity,
            point.dest_prop.as_deref(),
            diagnostics,
        ) else {
            continue;
        };

        if !known(&def.src_entity) {
            let message = format!("View marker '{}' names unknown source entity '{}'", point.marker, def.src_entity);
            tracing::warn!("{}", message);
            diagnostics.push(message);
            continue;
        }

        views.push(def);
    }

    (views, peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entities(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_traversal_is_breadth_first() {
        let root = Node::branch([
            ("users", Node::branch([("user", Node::branch([("posts", Node::branch([("post", Node::leaf())]))]))])),
            ("posts", Node::branch([("post", Node::leaf())])),
        ]);

        let encoded: Vec<String> = traverse(&root).into_iter().map(|t| t.encoded).collect();
        assert_eq!(
            encoded,
            vec![
                "users",
                "posts",
                "users/user",
                "posts/post",
                "users/user/posts",
                "users/user/posts/post",
            ]
        );

        // Shallowest occurrence wins
        let templates = derive_templates(&entities(&["user", "post"]), &traverse(&root));
        assert_eq!(templates["post"], "posts/{postId}");
    }

    #[test]
    fn test_view_points_are_encoded() {
        let root = Node::branch([(
            "users",
            Node::branch([(
                "user",
                Node::branch([
                    ("followers", Node::views([Marker::view_map("user", ["name"])])),
                    ("friends", Node::branch([("friend", Node::views([Marker::view("user", ["name"])]))])),
                ]),
            )]),
        )]);

        let encoded: Vec<String> = traverse(&root).into_iter().map(|t| t.encoded).collect();
        assert!(encoded.contains(&"users/user#followers=ViewMap:user:name".to_string()));
        assert!(encoded.contains(&"users/user/friends/friend=View:user:name".to_string()));
    }

    #[test]
    fn test_pattern_escapes_literals() {
        let pattern = matching_pattern("a.b/{xId}").unwrap();
        assert!(pattern.is_match("a.b/x1"));
        assert!(!pattern.is_match("aXb/x1"));
        assert!(!pattern.is_match("a.b/x1/c"));
    }
}
