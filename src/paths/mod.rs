//! Path algebra
//!
//! Concrete paths alternate collection names and document IDs:
//! `users/u1/friends/u2`. Templates replace ID segments with `{entityId}`
//! placeholders: `users/{userId}/friends/{friendId}`.
//!
//! Bookkeeping lives in `@`-prefixed sub-collections of a document:
//!
//! ```text
//! users/u2/@views/{linkId}              one per view of users/u2
//! servers/s1/@syncCreateViews/{linkId}  one per auto-provisioning registration
//! ```

mod hydrate;

pub use hydrate::PathHydrator;

use std::collections::BTreeMap;

/// Sub-collection holding a source document's view back-links
pub const VIEWS_COLLECTION: &str = "@views";
/// Sub-collection holding syncCreate registrations
pub const SYNC_CREATE_COLLECTION: &str = "@syncCreateViews";
/// Field recording the data version a document was last patched to
pub const DATA_VERSION_FIELD: &str = "@dataVersion";
/// Field stamped on view copies whenever they are (re)generated
pub const DATE_GENERATED_FIELD: &str = "@dateGenerated";
/// Creation timestamp on bookkeeping documents; `@views` pages are ordered by it
pub const DATE_CREATED_FIELD: &str = "@dateCreated";

/// `{userId}` for entity `user`
pub fn placeholder(entity: &str) -> String {
    format!("{{{}Id}}", entity)
}

/// Entity named by a placeholder segment, if `segment` is one
pub fn placeholder_entity(segment: &str) -> Option<&str> {
    segment.strip_prefix('{')?.strip_suffix("Id}")
}

pub fn has_placeholder(path: &str) -> bool {
    path.split('/').any(|s| placeholder_entity(s).is_some())
}

/// Last segment of a path
pub fn doc_id(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Collection containing the document at `path`
pub fn parent_collection(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

/// Document owning the collection that contains `path`, if any
pub fn parent_doc(path: &str) -> Option<&str> {
    parent_collection(path).rsplit_once('/').map(|(parent, _)| parent)
}

/// Join path pieces, skipping empty ones
pub fn join(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

/// Values bound to each placeholder when `template` is laid over `concrete`.
/// Returns `None` if the literal segments or segment counts disagree.
pub fn match_placeholders(template: &str, concrete: &str) -> Option<BTreeMap<String, String>> {
    let t: Vec<&str> = template.split('/').collect();
    let c: Vec<&str> = concrete.split('/').collect();
    if t.len() != c.len() {
        return None;
    }

    let mut bound = BTreeMap::new();
    for (ts, cs) in t.iter().zip(c.iter()) {
        match placeholder_entity(ts) {
            Some(entity) => {
                bound.insert(entity.to_string(), cs.to_string());
            }
            None if ts == cs => {}
            None => return None,
        }
    }
    Some(bound)
}

/// Replace every bound placeholder; unbound ones are left in place
pub fn fill_template(template: &str, values: &BTreeMap<String, String>) -> String {
    template
        .split('/')
        .map(|segment| match placeholder_entity(segment).and_then(|e| values.get(e)) {
            Some(value) => value.as_str(),
            None => segment,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Document ID of the bookkeeping entry that links to `dest_path`
/// (and `dest_prop`, for property-scoped views)
pub fn link_id(dest_path: &str, dest_prop: Option<&str>) -> String {
    let base = dest_path.replace('/', "+");
    match dest_prop {
        Some(prop) => format!("{}#{}", base, prop),
        None => base,
    }
}

/// `{src}/@views/{linkId}`
pub fn view_link_path(src_path: &str, dest_path: &str, dest_prop: Option<&str>) -> String {
    join(&[src_path, VIEWS_COLLECTION, &link_id(dest_path, dest_prop)])
}

/// `{srcParent}/@syncCreateViews/{linkId}`; `src_parent` may be empty for
/// top-level source collections
pub fn sync_create_path(src_parent: &str, dest_parent: &str, dest_prop: Option<&str>) -> String {
    join(&[src_parent, SYNC_CREATE_COLLECTION, &link_id(dest_parent, dest_prop)])
}

/// Collection holding the syncCreate registrations of `src_parent`
pub fn sync_create_collection(src_parent: &str) -> String {
    join(&[src_parent, SYNC_CREATE_COLLECTION])
}

/// Collection holding the view back-links of `src_path`
pub fn views_collection(src_path: &str) -> String {
    join(&[src_path, VIEWS_COLLECTION])
}

/// True for paths inside an `@`-prefixed bookkeeping collection
pub fn is_bookkeeping(path: &str) -> bool {
    path.split('/').step_by(2).any(|collection| collection.starts_with('@'))
}
