//! Storage capability interface.
//!
//! The dispatcher talks to the backing hierarchy exclusively through
//! [`ResourceStore`]. Two implementations ship with the crate:
//!
//! - [`LocalStore`] - a directory on the local file system
//! - [`MemoryStore`] - an in-memory tree (tests, scratch servers)
//!
//! # Atomicity
//!
//! Every mutating operation is atomic with respect to a single resource:
//! readers observe either the previous content or the new content, never a
//! partially written file. `LocalStore` achieves this with
//! write-to-temporary-then-rename, `MemoryStore` by swapping immutable
//! buffers under its map lock.

mod local;
mod memory;

pub use local::LocalStore;
pub use memory::MemoryStore;

use crate::error::{DavError, DavResult};
use crate::path::CanonicalPath;
use std::fmt;
use std::io::{Read, Seek};
use std::time::SystemTime;

/// Kind of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Collection,
    Leaf,
}

/// Strong entity tag, kept in its quoted wire form (`"abc"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityTag(String);

impl EntityTag {
    /// Build a tag from an opaque value (quotes are added).
    pub fn new(opaque: &str) -> Self {
        EntityTag(format!("\"{opaque}\""))
    }

    /// The quoted wire form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare against a tag as it appeared in a request header.
    ///
    /// Weak prefixes are ignored: the comparison is on the opaque value.
    pub fn matches(&self, candidate: &str) -> bool {
        let candidate = candidate.trim();
        let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
        candidate == self.0
    }
}

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attributes of a resource as reported by a store.
#[derive(Debug, Clone)]
pub struct ResourceMeta {
    pub path: CanonicalPath,
    pub kind: ResourceKind,
    pub len: u64,
    pub modified: SystemTime,
    pub created: Option<SystemTime>,
    pub etag: EntityTag,
    pub read_only: bool,
    pub hidden: bool,
}

impl ResourceMeta {
    /// Metadata for a collection. Hidden is derived from the name.
    pub fn collection(path: CanonicalPath, modified: SystemTime, etag: EntityTag) -> Self {
        let hidden = is_hidden_name(&path);
        Self {
            path,
            kind: ResourceKind::Collection,
            len: 0,
            modified,
            created: None,
            etag,
            read_only: false,
            hidden,
        }
    }

    /// Metadata for a leaf resource. Hidden is derived from the name.
    pub fn leaf(path: CanonicalPath, len: u64, modified: SystemTime, etag: EntityTag) -> Self {
        let hidden = is_hidden_name(&path);
        Self {
            path,
            kind: ResourceKind::Leaf,
            len,
            modified,
            created: None,
            etag,
            read_only: false,
            hidden,
        }
    }

    #[must_use]
    pub fn with_created(mut self, created: Option<SystemTime>) -> Self {
        self.created = created;
        self
    }

    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn is_collection(&self) -> bool {
        self.kind == ResourceKind::Collection
    }
}

fn is_hidden_name(path: &CanonicalPath) -> bool {
    path.name().is_some_and(|name| name.starts_with('.'))
}

/// How far a collection operation recurses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Depth {
    /// Parse a `Depth` header value.
    pub fn parse(value: &str) -> DavResult<Self> {
        match value.trim() {
            "0" => Ok(Depth::Zero),
            "1" => Ok(Depth::One),
            v if v.eq_ignore_ascii_case("infinity") => Ok(Depth::Infinity),
            other => Err(DavError::BadRequest(format!("invalid Depth: {other}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "infinity",
        }
    }
}

/// How `write` treats existing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the content.
    Truncate,
    /// Keep the content and add to its end.
    Append,
}

/// Readable, seekable snapshot of a leaf's content.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Per-entry failures of a batch operation (recursive delete or copy).
pub type BatchFailures = Vec<(CanonicalPath, DavError)>;

/// Capability interface over a hierarchical backing store.
pub trait ResourceStore: Send + Sync {
    /// Metadata of a single resource.
    fn stat(&self, path: &CanonicalPath) -> DavResult<ResourceMeta>;

    /// The resource followed by its descendants down to `depth`, sorted by path.
    fn list(&self, path: &CanonicalPath, depth: Depth) -> DavResult<Vec<ResourceMeta>>;

    /// Open a consistent snapshot of a leaf's content.
    fn open_read(&self, path: &CanonicalPath) -> DavResult<Box<dyn ReadSeek>>;

    /// Write a leaf from `content`, creating it if needed.
    ///
    /// The parent collection must exist (`Conflict` otherwise). Nothing is
    /// visible to readers until the whole body has been consumed.
    fn write(
        &self,
        path: &CanonicalPath,
        mode: WriteMode,
        content: &mut dyn Read,
    ) -> DavResult<ResourceMeta>;

    /// Create an empty collection.
    fn create_collection(&self, path: &CanonicalPath) -> DavResult<ResourceMeta>;

    /// Delete a resource. Returns per-entry failures of a recursive delete.
    fn delete(&self, path: &CanonicalPath, recursive: bool) -> DavResult<BatchFailures>;

    /// Move `src` to `dest`, replacing `dest` only when `overwrite` is set.
    fn move_resource(
        &self,
        src: &CanonicalPath,
        dest: &CanonicalPath,
        overwrite: bool,
    ) -> DavResult<()>;

    /// Copy `src` to `dest`. `Depth::Zero` copies a collection without members.
    fn copy(
        &self,
        src: &CanonicalPath,
        dest: &CanonicalPath,
        overwrite: bool,
        depth: Depth,
    ) -> DavResult<BatchFailures>;

    /// Existence check built on `stat`.
    fn exists(&self, path: &CanonicalPath) -> DavResult<bool> {
        match self.stat(path) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Shared precondition for `move_resource`/`copy` when the target exists.
fn occupied_destination(dest: &CanonicalPath, dest_is_nonempty_collection: bool) -> DavError {
    if dest_is_nonempty_collection {
        DavError::Conflict(format!("{dest} is a non-empty collection"))
    } else {
        DavError::AlreadyExists(dest.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_parse() {
        assert_eq!(Depth::parse("0").unwrap(), Depth::Zero);
        assert_eq!(Depth::parse("1").unwrap(), Depth::One);
        assert_eq!(Depth::parse("Infinity").unwrap(), Depth::Infinity);
        assert!(Depth::parse("2").is_err());
    }

    #[test]
    fn test_etag_matching() {
        let tag = EntityTag::new("abc");
        assert_eq!(tag.as_str(), "\"abc\"");
        assert!(tag.matches("\"abc\""));
        assert!(tag.matches(" W/\"abc\" "));
        assert!(!tag.matches("\"abd\""));
    }

    #[test]
    fn test_hidden_from_name() {
        let path: CanonicalPath = "/dir/.secret".parse().unwrap();
        let meta = ResourceMeta::leaf(path, 1, SystemTime::now(), EntityTag::new("x"));
        assert!(meta.hidden);
        let path: CanonicalPath = "/dir/visible".parse().unwrap();
        let meta = ResourceMeta::collection(path, SystemTime::now(), EntityTag::new("x"));
        assert!(!meta.hidden);
        assert!(meta.is_collection());
    }
}
