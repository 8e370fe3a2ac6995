//! The storage layer: collections and items on disk.
//!
//! Backends implement the `Storage` trait; the factory picks one from
//! the configured `[storage] type`. The only built-in backend is
//! `multifilesystem` (one file per item, see `multifs.rs`).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::Config;
use crate::ical::{ComponentKind, Item};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    Exists,
    #[error("parent missing or not a collection")]
    Conflict,
    #[error("access denied")]
    Forbidden,
    #[error("invalid name")]
    InvalidName,
    #[error("sync token invalid or expired")]
    BadSyncToken,
    #[error("storage failure")]
    GeneralFailure,
}

pub type FsResult<T> = std::result::Result<T, FsError>;

/// Tag of a leaf collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionTag {
    Calendar,
    Addressbook,
}

impl CollectionTag {
    pub fn as_str(self) -> &'static str {
        match self {
            CollectionTag::Calendar => "VCALENDAR",
            CollectionTag::Addressbook => "VADDRESSBOOK",
        }
    }

    pub fn from_str(s: &str) -> Option<CollectionTag> {
        match s {
            "VCALENDAR" => Some(CollectionTag::Calendar),
            "VADDRESSBOOK" => Some(CollectionTag::Addressbook),
            _ => None,
        }
    }

    pub fn accepts(self, kind: ComponentKind) -> bool {
        match self {
            CollectionTag::Calendar => kind.is_calendar(),
            CollectionTag::Addressbook => kind == ComponentKind::Card,
        }
    }
}

/// Collection properties: qualified XML name to string value. The set
/// is open; unknown properties round-trip through PROPPATCH/PROPFIND.
pub type PropMap = BTreeMap<String, String>;

/// A node in the collection tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    /// Storage path: segments joined with `/`, "" for the root.
    pub path: String,
    pub tag: Option<CollectionTag>,
    pub props: PropMap,
}

impl Collection {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }

    /// First path segment, the owning principal.
    pub fn owner(&self) -> Option<&str> {
        self.path.split('/').next().filter(|s| !s.is_empty())
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// A principal collection is a direct, untagged child of the root.
    pub fn is_principal(&self) -> bool {
        self.tag.is_none() && !self.path.is_empty() && !self.path.contains('/')
    }
}

/// Result of a sync-collection diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncChanges {
    pub token: String,
    /// Names created or modified since the old token.
    pub changed: Vec<String>,
    /// Names deleted since the old token.
    pub removed: Vec<String>,
}

pub trait Storage: Send + Sync {
    /// Look up a collection node. `Ok(None)` when nothing is there.
    fn collection(&self, path: &str) -> FsResult<Option<Collection>>;

    /// Child collections of an untagged collection.
    fn subcollections(&self, path: &str) -> FsResult<Vec<Collection>>;

    /// `(name, etag)` of every item in a leaf collection.
    fn list(&self, col: &Collection) -> FsResult<Vec<(String, String)>>;

    fn get(&self, col: &Collection, name: &str) -> FsResult<Option<Item>>;

    fn get_all(&self, col: &Collection) -> FsResult<Vec<(String, Item)>>;

    /// Name of the item carrying `uid`, if any (UIDs are unique per
    /// collection).
    fn find_uid(&self, col: &Collection, uid: &str) -> FsResult<Option<String>>;

    /// Create or replace one item.
    fn upload(&self, col: &Collection, name: &str, item: &Item) -> FsResult<()>;

    fn delete_item(&self, col: &Collection, name: &str) -> FsResult<()>;

    fn create_collection(
        &self,
        path: &str,
        tag: Option<CollectionTag>,
        props: PropMap,
    ) -> FsResult<Collection>;

    /// Atomically replace a whole collection (the whole-collection
    /// upload path of PUT).
    fn replace_collection(
        &self,
        path: &str,
        tag: CollectionTag,
        items: &[(String, Item)],
        props: PropMap,
    ) -> FsResult<Collection>;

    fn delete_collection(&self, col: &Collection) -> FsResult<()>;

    fn move_item(
        &self,
        src: &Collection,
        name: &str,
        dst: &Collection,
        dst_name: &str,
        overwrite: bool,
    ) -> FsResult<()>;

    fn move_collection(&self, from: &str, to: &str, overwrite: bool) -> FsResult<()>;

    /// Replace the property document of a collection.
    fn set_props(&self, col: &Collection, props: PropMap) -> FsResult<()>;

    fn last_modified(&self, col: &Collection) -> FsResult<SystemTime>;

    /// Diff against the snapshot identified by `since` and issue a new
    /// token. `since: None` reports the full listing.
    fn sync(&self, col: &Collection, since: Option<&str>) -> FsResult<SyncChanges>;

    /// Walk the whole tree checking invariants; returns descriptions of
    /// the problems found.
    fn verify(&self) -> FsResult<Vec<String>>;

    /// Dump every collection below `path` into a directory tree.
    fn export(&self, destination: &std::path::Path) -> FsResult<()>;
}

/// Strong collection etag, derived from the ordered `(name, etag)`
/// pairs of the items plus the property document. The item etags cover
/// the UIDs, so this changes exactly when the membership or content of
/// the collection changes. Stable across restarts.
pub fn collection_etag(col: &Collection, items: &[(String, String)]) -> String {
    let mut hasher = Sha256::new();
    if let Some(tag) = col.tag {
        hasher.update(tag.as_str().as_bytes());
    }
    for (key, value) in &col.props {
        hasher.update(key.as_bytes());
        hasher.update([0]);
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    let mut sorted: Vec<&(String, String)> = items.iter().collect();
    sorted.sort();
    for (name, etag) in sorted {
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(etag.as_bytes());
        hasher.update([0]);
    }
    format!("\"{:x}\"", hasher.finalize())
}

/// Instantiate the configured storage backend.
pub fn create(config: &Config) -> std::io::Result<Arc<dyn Storage>> {
    match config.storage.r#type.as_str() {
        "multifilesystem" => Ok(Arc::new(crate::multifs::MultiFs::new(config)?)),
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unknown storage type {other:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(tag: Option<CollectionTag>) -> Collection {
        Collection {
            path: "alice/cal".to_string(),
            tag,
            props: PropMap::new(),
        }
    }

    #[test]
    fn test_collection_etag_changes_with_items() {
        let c = col(Some(CollectionTag::Calendar));
        let empty = collection_etag(&c, &[]);
        let one = collection_etag(&c, &[("a.ics".to_string(), "\"x\"".to_string())]);
        assert_ne!(empty, one);
        // order independent.
        let ab = collection_etag(
            &c,
            &[
                ("a.ics".to_string(), "\"x\"".to_string()),
                ("b.ics".to_string(), "\"y\"".to_string()),
            ],
        );
        let ba = collection_etag(
            &c,
            &[
                ("b.ics".to_string(), "\"y\"".to_string()),
                ("a.ics".to_string(), "\"x\"".to_string()),
            ],
        );
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_collection_etag_changes_with_props() {
        let mut c = col(Some(CollectionTag::Calendar));
        let before = collection_etag(&c, &[]);
        c.props.insert("D:displayname".to_string(), "X".to_string());
        assert_ne!(before, collection_etag(&c, &[]));
    }

    #[test]
    fn test_tag_accepts() {
        assert!(CollectionTag::Calendar.accepts(ComponentKind::Event));
        assert!(CollectionTag::Calendar.accepts(ComponentKind::Todo));
        assert!(!CollectionTag::Calendar.accepts(ComponentKind::Card));
        assert!(CollectionTag::Addressbook.accepts(ComponentKind::Card));
        assert!(!CollectionTag::Addressbook.accepts(ComponentKind::Journal));
    }

    #[test]
    fn test_principal() {
        let c = Collection {
            path: "alice".to_string(),
            tag: None,
            props: PropMap::new(),
        };
        assert!(c.is_principal());
        assert_eq!(c.owner(), Some("alice"));
        assert_eq!(c.name(), "alice");
    }
}
