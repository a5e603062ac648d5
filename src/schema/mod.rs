//! Schema declarations and the compiled registry
//!
//! A declaration is a tree of collection and entity names. Array-valued nodes
//! hold view markers instead of children:
//!
//! ```yaml
//! entities: [user, friend, server]
//! structure:
//!   users:
//!     user:
//!       followers: ["ViewArrayMap:user:name"]
//!       friends:
//!         friend: ["View:user:name,email"]
//!   servers:
//!     server:
//!       "@views": ["PeerSync:name"]
//! ```
//!
//! The reserved `@views` key attaches document-level markers to a node that
//! also owns sub-collections.
//!
//! [`SchemaRegistry::compile`] turns a declaration into path templates,
//! matching patterns and view definitions. The registry is immutable and
//! passed by reference to every component.

mod compile;
pub mod view_def;

pub use view_def::{DestProp, DestPropKind, PeerSyncDefinition, ViewDefinition, ViewOptions};

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use viewmark::Marker;

use crate::error::{Error, Result};
use crate::paths;
use crate::validation::validate_entity_name;

/// Key for document-level markers on a mapping node
pub const VIEWS_KEY: &str = "@views";

/// A node of the declaration tree. Children keep declaration order, which
/// decides which occurrence of an entity is canonical.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Branch(Vec<(String, Node)>),
    Views(Vec<Marker>),
}

impl Node {
    pub fn branch<I, K>(children: I) -> Self
    where
        I: IntoIterator<Item = (K, Node)>,
        K: Into<String>,
    {
        Node::Branch(children.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn views(markers: impl IntoIterator<Item = Marker>) -> Self {
        Node::Views(markers.into_iter().collect())
    }

    /// An entity with no sub-collections
    pub fn leaf() -> Self {
        Node::Branch(Vec::new())
    }
}

/// Entity names plus the structure tree
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDeclaration {
    pub entities: Vec<String>,
    pub structure: Node,
    /// Problems found while reading the declaration (unparseable markers)
    pub diagnostics: Vec<String>,
}

impl SchemaDeclaration {
    pub fn new<I, S>(entities: I, structure: Node) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entities: entities.into_iter().map(Into::into).collect(),
            structure,
            diagnostics: Vec::new(),
        }
    }

    /// Parse the YAML form shown in the module docs
    pub fn from_yaml_str(input: &str) -> Result<Self> {
        let root: serde_yaml::Value = serde_yaml::from_str(input)?;
        let entities = root
            .get("entities")
            .and_then(serde_yaml::Value::as_sequence)
            .ok_or_else(|| Error::InvalidDeclaration {
                message: "missing 'entities' list".to_string(),
            })?
            .iter()
            .map(|e| {
                e.as_str().map(str::to_string).ok_or_else(|| Error::InvalidDeclaration {
                    message: "entity names must be strings".to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let structure = root.get("structure").ok_or_else(|| Error::InvalidDeclaration {
            message: "missing 'structure' mapping".to_string(),
        })?;

        let mut diagnostics = Vec::new();
        let structure = node_from_yaml(structure, "", &mut diagnostics)?;
        Ok(Self {
            entities,
            structure,
            diagnostics,
        })
    }
}

fn node_from_yaml(value: &serde_yaml::Value, at: &str, diagnostics: &mut Vec<String>) -> Result<Node> {
    use serde_yaml::Value as Yaml;

    match value {
        Yaml::Null => Ok(Node::leaf()),
        Yaml::Mapping(map) => {
            let mut children = Vec::with_capacity(map.len());
            for (key, child) in map {
                let key = key.as_str().ok_or_else(|| Error::InvalidDeclaration {
                    message: format!("non-string key under '{}'", at),
                })?;
                let child_at = paths::join(&[at, key]);
                children.push((key.to_string(), node_from_yaml(child, &child_at, diagnostics)?));
            }
            Ok(Node::Branch(children))
        }
        Yaml::Sequence(items) => {
            let mut markers = Vec::with_capacity(items.len());
            for item in items {
                let raw = item.as_str().ok_or_else(|| Error::InvalidDeclaration {
                    message: format!("view markers under '{}' must be strings", at),
                })?;
                match viewmark::parse(raw) {
                    Ok(marker) => markers.push(marker),
                    Err(e) => {
                        let message = format!("Dropping marker '{}' under '{}': {}", raw, at, e);
                        tracing::warn!("{}", message);
                        diagnostics.push(message);
                    }
                }
            }
            Ok(Node::Views(markers))
        }
        _ => Err(Error::InvalidDeclaration {
            message: format!("'{}' must be a mapping or a list of view markers", at),
        }),
    }
}

/// Compiled schema: templates, patterns and view definitions
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    entities: Vec<String>,
    doc_paths: BTreeMap<String, String>,
    col_paths: BTreeMap<String, String>,
    patterns: Vec<(String, Regex)>,
    views: Vec<ViewDefinition>,
    peers: Vec<PeerSyncDefinition>,
    diagnostics: Vec<String>,
}

impl SchemaRegistry {
    /// Compile a declaration. Problems are non-fatal: they are logged and
    /// kept in [`SchemaRegistry::diagnostics`].
    pub fn compile(declaration: &SchemaDeclaration) -> Self {
        let mut diagnostics = declaration.diagnostics.clone();

        let mut entities = Vec::with_capacity(declaration.entities.len());
        for entity in &declaration.entities {
            match validate_entity_name(entity) {
                Ok(()) if !entities.contains(entity) => entities.push(entity.clone()),
                Ok(()) => {}
                Err(e) => {
                    let message = format!("Ignoring entity '{}': {}", entity, e);
                    tracing::warn!("{}", message);
                    diagnostics.push(message);
                }
            }
        }

        let traversal = compile::traverse(&declaration.structure);
        let doc_paths = compile::derive_templates(&entities, &traversal);

        let mut col_paths = BTreeMap::new();
        let mut patterns = Vec::with_capacity(doc_paths.len());
        for (entity, template) in &doc_paths {
            col_paths.insert(entity.clone(), paths::parent_collection(template).to_string());
            match compile::matching_pattern(template) {
                Ok(pattern) => patterns.push((entity.clone(), pattern)),
                Err(e) => {
                    let message = format!("No matching pattern for '{}': {}", template, e);
                    tracing::warn!("{}", message);
                    diagnostics.push(message);
                }
            }
        }

        for entity in entities.iter().filter(|e| !doc_paths.contains_key(*e)) {
            let message = format!("Entity '{}' does not appear in the structure", entity);
            tracing::debug!("{}", message);
            diagnostics.push(message);
        }

        let (views, peers) = compile::collect_definitions(&entities, &traversal, &mut diagnostics);

        tracing::info!(
            "Compiled schema: {} entities, {} views, {} peer syncs",
            doc_paths.len(),
            views.len(),
            peers.len()
        );

        Self {
            entities,
            doc_paths,
            col_paths,
            patterns,
            views,
            peers,
            diagnostics,
        }
    }

    /// Read and compile a YAML declaration file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let declaration = SchemaDeclaration::from_yaml_str(&content)?;
        Ok(Self::compile(&declaration))
    }

    pub fn from_yaml_str(input: &str) -> Result<Self> {
        Ok(Self::compile(&SchemaDeclaration::from_yaml_str(input)?))
    }

    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    /// DocPath template, e.g. `users/{userId}/friends/{friendId}`
    pub fn doc_path(&self, entity: &str) -> Option<&str> {
        self.doc_paths.get(entity).map(String::as_str)
    }

    /// ColPath template, e.g. `users/{userId}/friends`
    pub fn col_path(&self, entity: &str) -> Option<&str> {
        self.col_paths.get(entity).map(String::as_str)
    }

    pub fn doc_paths(&self) -> &BTreeMap<String, String> {
        &self.doc_paths
    }

    pub fn doc_path_or_err(&self, entity: &str) -> Result<&str> {
        self.doc_path(entity).ok_or_else(|| Error::EntityNotFound {
            entity: entity.to_string(),
        })
    }

    /// Classify a concrete document path
    pub fn entity_of(&self, path: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|(_, pattern)| pattern.is_match(path))
            .map(|(entity, _)| entity.as_str())
    }

    /// Matching pattern of an entity
    pub fn pattern(&self, entity: &str) -> Option<&Regex> {
        self.patterns.iter().find(|(e, _)| e == entity).map(|(_, p)| p)
    }

    pub fn view_definitions(&self) -> &[ViewDefinition] {
        &self.views
    }

    pub fn peer_sync_definitions(&self) -> &[PeerSyncDefinition] {
        &self.peers
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }
}
