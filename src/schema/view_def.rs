//! View and peer-sync definitions

use serde::{Deserialize, Serialize};
use viewmark::{Marker, MarkerKind};

use crate::version::Version;

/// How a property-scoped view stores its entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DestPropKind {
    /// `prop.{srcId}` holds the copied fields
    Map,
    /// Like `Map`, plus `@prop` holds the array of source IDs
    ArrayMap,
}

/// Destination property of a property-scoped view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestProp {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DestPropKind,
}

impl DestProp {
    /// Field holding source IDs for array-map views
    pub fn membership_field(&self) -> Option<String> {
        match self.kind {
            DestPropKind::ArrayMap => Some(format!("@{}", self.name)),
            DestPropKind::Map => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewOptions {
    /// New children of a registered source parent auto-provision views
    #[serde(default)]
    pub sync_create: bool,
}

/// A materialized view: `src_props` of every `src_entity` document are
/// copied into `dest_entity` documents (or into `dest_prop` of them).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewDefinition {
    pub src_entity: String,
    pub src_props: Vec<String>,
    pub dest_entity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_prop: Option<DestProp>,
    #[serde(default)]
    pub options: ViewOptions,
    pub version: Version,
}

impl ViewDefinition {
    /// Document-level view with no options at version `0.0.0`
    pub fn new<I, S>(src_entity: impl Into<String>, src_props: I, dest_entity: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            src_entity: src_entity.into(),
            src_props: src_props.into_iter().map(Into::into).collect(),
            dest_entity: dest_entity.into(),
            dest_prop: None,
            options: ViewOptions::default(),
            version: Version::ZERO,
        }
    }

    pub fn dest_prop(mut self, name: impl Into<String>, kind: DestPropKind) -> Self {
        self.dest_prop = Some(DestProp { name: name.into(), kind });
        self
    }

    pub fn sync_create(mut self, enabled: bool) -> Self {
        self.options.sync_create = enabled;
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn dest_prop_name(&self) -> Option<&str> {
        self.dest_prop.as_ref().map(|p| p.name.as_str())
    }

    /// Stable name shared by every version of this view's source-side logic
    pub fn forward_name(&self) -> String {
        match self.dest_prop_name() {
            Some(prop) => format!("view:{}->{}#{}", self.src_entity, self.dest_entity, prop),
            None => format!("view:{}->{}", self.src_entity, self.dest_entity),
        }
    }

    /// Stable name shared by every version of this view's destination-side logic
    pub fn reverse_name(&self) -> String {
        match self.dest_prop_name() {
            Some(prop) => format!("view:{}#{}<-{}", self.dest_entity, prop, self.src_entity),
            None => format!("view:{}<-{}", self.dest_entity, self.src_entity),
        }
    }

    /// Build from a parsed marker found at a declaration point.
    ///
    /// Unknown options and non-boolean flag values are dropped and reported
    /// through `diagnostics`. Returns `None` for peer-sync markers or an
    /// unusable version.
    pub fn from_marker(
        marker: &Marker,
        dest_entity: &str,
        dest_prop: Option<&str>,
        diagnostics: &mut Vec<String>,
    ) -> Option<Self> {
        let src_entity = marker.src_entity.clone()?;
        let version = parse_marker_version(marker, diagnostics)?;

        let dest_prop = match (marker.kind, dest_prop) {
            (MarkerKind::ViewMap, Some(name)) => Some(DestProp {
                name: name.to_string(),
                kind: DestPropKind::Map,
            }),
            (MarkerKind::ViewArrayMap, Some(name)) => Some(DestProp {
                name: name.to_string(),
                kind: DestPropKind::ArrayMap,
            }),
            (MarkerKind::View, None) => None,
            _ => {
                report(diagnostics, format!("Marker '{}' is misplaced for entity '{}'", marker, dest_entity));
                return None;
            }
        };

        let mut options = ViewOptions::default();
        for option in &marker.options {
            match option.name.as_str() {
                "syncCreate" => match option.value.as_str() {
                    "true" => options.sync_create = true,
                    "false" => options.sync_create = false,
                    other => report(
                        diagnostics,
                        format!("Option syncCreate in '{}' must be true or false, got '{}'", marker, other),
                    ),
                },
                unknown => report(
                    diagnostics,
                    format!("Unknown option '{}' in '{}' dropped", unknown, marker),
                ),
            }
        }

        Some(Self {
            src_entity,
            src_props: marker.props.clone(),
            dest_entity: dest_entity.to_string(),
            dest_prop,
            options,
            version,
        })
    }
}

/// Copies of one entity held under different parents, kept field-consistent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSyncDefinition {
    pub entity: String,
    pub props: Vec<String>,
    pub version: Version,
}

impl PeerSyncDefinition {
    pub fn name(&self) -> String {
        format!("peer:{}", self.entity)
    }

    pub fn from_marker(marker: &Marker, entity: &str, diagnostics: &mut Vec<String>) -> Option<Self> {
        if marker.kind != MarkerKind::PeerSync {
            return None;
        }
        for option in &marker.options {
            report(
                diagnostics,
                format!("Unknown option '{}' in '{}' dropped", option.name, marker),
            );
        }
        Some(Self {
            entity: entity.to_string(),
            props: marker.props.clone(),
            version: parse_marker_version(marker, diagnostics)?,
        })
    }
}

fn parse_marker_version(marker: &Marker, diagnostics: &mut Vec<String>) -> Option<Version> {
    match marker.version {
        None => Some(Version::ZERO),
        Some(ref raw) => match raw.parse() {
            Ok(version) => Some(version),
            Err(_) => {
                report(diagnostics, format!("Marker '{}' has an invalid version", marker));
                None
            }
        },
    }
}

fn report(diagnostics: &mut Vec<String>, message: String) {
    tracing::warn!("{}", message);
    diagnostics.push(message);
}
