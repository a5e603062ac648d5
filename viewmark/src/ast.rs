//! Abstract Syntax Tree for view markers

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of marker, i.e. the leading keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarkerKind {
    /// `View` - the whole destination document is a view of the source
    View,
    /// `ViewMap` - a map-typed property of the destination holds one entry per source
    ViewMap,
    /// `ViewArrayMap` - like `ViewMap`, plus an array of source IDs for membership queries
    ViewArrayMap,
    /// `PeerSync` - sibling copies of the same entity are kept consistent
    PeerSync,
}

impl MarkerKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            MarkerKind::View => "View",
            MarkerKind::ViewMap => "ViewMap",
            MarkerKind::ViewArrayMap => "ViewArrayMap",
            MarkerKind::PeerSync => "PeerSync",
        }
    }

    /// True for markers that target a property of the destination document
    pub fn is_property_scoped(&self) -> bool {
        matches!(self, MarkerKind::ViewMap | MarkerKind::ViewArrayMap)
    }
}

/// A raw `name=value` option. Interpretation is left to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerOption {
    pub name: String,
    pub value: String,
}

/// A parsed marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub kind: MarkerKind,
    /// Dotted version as written, `None` when omitted
    pub version: Option<String>,
    /// Source entity; always `None` for `PeerSync`
    pub src_entity: Option<String>,
    /// Properties copied from the source
    pub props: Vec<String>,
    pub options: Vec<MarkerOption>,
}

impl Marker {
    /// Document-level view of `src_entity`
    pub fn view<I, S>(src_entity: impl Into<String>, props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_kind(MarkerKind::View, Some(src_entity.into()), props)
    }

    /// Map-property view of `src_entity`
    pub fn view_map<I, S>(src_entity: impl Into<String>, props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_kind(MarkerKind::ViewMap, Some(src_entity.into()), props)
    }

    /// Array-map-property view of `src_entity`
    pub fn view_array_map<I, S>(src_entity: impl Into<String>, props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_kind(MarkerKind::ViewArrayMap, Some(src_entity.into()), props)
    }

    /// Peer synchronisation of `props` across sibling copies
    pub fn peer_sync<I, S>(props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_kind(MarkerKind::PeerSync, None, props)
    }

    fn with_kind<I, S>(kind: MarkerKind, src_entity: Option<String>, props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            version: None,
            src_entity,
            props: props.into_iter().map(Into::into).collect(),
            options: Vec::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push(MarkerOption {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn sync_create(self, enabled: bool) -> Self {
        self.option("syncCreate", enabled.to_string())
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.keyword())?;
        if let Some(ref version) = self.version {
            write!(f, "@{}", version)?;
        }
        if let Some(ref entity) = self.src_entity {
            write!(f, ":{}", entity)?;
        }
        write!(f, ":{}", self.props.join(","))?;
        if !self.options.is_empty() {
            let options: Vec<String> = self
                .options
                .iter()
                .map(|o| format!("{}={}", o.name, o.value))
                .collect();
            write!(f, ":{}", options.join(","))?;
        }
        Ok(())
    }
}
