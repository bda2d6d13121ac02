//! In-memory resource store.

use super::{
    occupied_destination, BatchFailures, Depth, EntityTag, ReadSeek, ResourceKind, ResourceMeta,
    ResourceStore, WriteMode,
};
use crate::error::{DavError, DavResult};
use crate::path::CanonicalPath;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::trace;

#[derive(Debug, Clone)]
struct Node {
    kind: ResourceKind,
    data: Bytes,
    modified: SystemTime,
    created: SystemTime,
    generation: u64,
    read_only: bool,
}

/// Resource tree held entirely in memory.
///
/// Content buffers are immutable [`Bytes`]; a write builds the new buffer
/// outside the map lock and swaps it in, so readers holding a snapshot keep
/// seeing the old content.
#[derive(Debug)]
pub struct MemoryStore {
    nodes: RwLock<BTreeMap<CanonicalPath, Node>>,
    generation: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store containing only the root collection.
    pub fn new() -> Self {
        let store = Self {
            nodes: RwLock::new(BTreeMap::new()),
            generation: AtomicU64::new(1),
        };
        let root = store.node(ResourceKind::Collection, Bytes::new());
        store.nodes.write().insert(CanonicalPath::root(), root);
        store
    }

    /// Mark a resource read-only (writes and deletes fail with `Forbidden`).
    pub fn set_read_only(&self, path: &CanonicalPath, read_only: bool) -> DavResult<()> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| DavError::NotFound(path.to_string()))?;
        node.read_only = read_only;
        Ok(())
    }

    fn node(&self, kind: ResourceKind, data: Bytes) -> Node {
        let now = SystemTime::now();
        Node {
            kind,
            data,
            modified: now,
            created: now,
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
            read_only: false,
        }
    }

    fn meta(path: &CanonicalPath, node: &Node) -> ResourceMeta {
        let etag = EntityTag::new(&format!("m{:x}", node.generation));
        let meta = match node.kind {
            ResourceKind::Collection => ResourceMeta::collection(path.clone(), node.modified, etag),
            ResourceKind::Leaf => {
                ResourceMeta::leaf(path.clone(), node.data.len() as u64, node.modified, etag)
            }
        };
        meta.with_created(Some(node.created))
            .with_read_only(node.read_only)
    }

    /// Keys of `path` and everything below it, in order.
    fn subtree(nodes: &BTreeMap<CanonicalPath, Node>, path: &CanonicalPath) -> Vec<CanonicalPath> {
        nodes
            .range(path.clone()..)
            .take_while(|(key, _)| path.contains(key))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn require_parent_collection(
        nodes: &BTreeMap<CanonicalPath, Node>,
        path: &CanonicalPath,
    ) -> DavResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| DavError::Conflict("root has no parent".to_string()))?;
        match nodes.get(&parent) {
            Some(node) if node.kind == ResourceKind::Collection => Ok(()),
            _ => Err(DavError::Conflict(format!("parent of {path} is not a collection"))),
        }
    }

    /// Prepare `dest` for a move/copy: check the parent and clear or refuse
    /// an existing target.
    fn claim_destination(
        nodes: &mut BTreeMap<CanonicalPath, Node>,
        dest: &CanonicalPath,
        overwrite: bool,
    ) -> DavResult<()> {
        Self::require_parent_collection(nodes, dest)?;
        if nodes.contains_key(dest) {
            let existing = Self::subtree(nodes, dest);
            if !overwrite {
                return Err(occupied_destination(dest, existing.len() > 1));
            }
            for key in existing {
                nodes.remove(&key);
            }
        }
        Ok(())
    }
}

impl ResourceStore for MemoryStore {
    fn stat(&self, path: &CanonicalPath) -> DavResult<ResourceMeta> {
        let nodes = self.nodes.read();
        let node = nodes
            .get(path)
            .ok_or_else(|| DavError::NotFound(path.to_string()))?;
        Ok(Self::meta(path, node))
    }

    fn list(&self, path: &CanonicalPath, depth: Depth) -> DavResult<Vec<ResourceMeta>> {
        let nodes = self.nodes.read();
        let node = nodes
            .get(path)
            .ok_or_else(|| DavError::NotFound(path.to_string()))?;
        let mut entries = vec![Self::meta(path, node)];
        if node.kind == ResourceKind::Leaf || depth == Depth::Zero {
            return Ok(entries);
        }
        let max_depth = match depth {
            Depth::One => path.depth() + 1,
            _ => usize::MAX,
        };
        entries.extend(
            nodes
                .range(path.clone()..)
                .skip(1)
                .take_while(|(key, _)| path.contains(key))
                .filter(|(key, _)| key.depth() <= max_depth)
                .map(|(key, node)| Self::meta(key, node)),
        );
        Ok(entries)
    }

    fn open_read(&self, path: &CanonicalPath) -> DavResult<Box<dyn ReadSeek>> {
        let nodes = self.nodes.read();
        let node = nodes
            .get(path)
            .ok_or_else(|| DavError::NotFound(path.to_string()))?;
        if node.kind == ResourceKind::Collection {
            return Err(DavError::Conflict(format!("{path} is a collection")));
        }
        Ok(Box::new(Cursor::new(node.data.clone())))
    }

    fn write(
        &self,
        path: &CanonicalPath,
        mode: WriteMode,
        content: &mut dyn Read,
    ) -> DavResult<ResourceMeta> {
        // Consume the body before touching the tree; a failed read commits nothing.
        let mut incoming = Vec::new();
        content
            .read_to_end(&mut incoming)
            .map_err(|e| DavError::io(path, e))?;

        let mut nodes = self.nodes.write();
        Self::require_parent_collection(&nodes, path)?;
        let created = match nodes.get(path) {
            Some(node) if node.kind == ResourceKind::Collection => {
                return Err(DavError::Conflict(format!("{path} is a collection")));
            }
            Some(node) if node.read_only => {
                return Err(DavError::Forbidden(format!("{path} is read-only")));
            }
            Some(node) => Some(node.created),
            None => None,
        };

        let data = match (mode, nodes.get(path)) {
            (WriteMode::Append, Some(existing)) => {
                let mut combined = existing.data.to_vec();
                combined.extend_from_slice(&incoming);
                Bytes::from(combined)
            }
            _ => Bytes::from(incoming),
        };
        let mut node = self.node(ResourceKind::Leaf, data);
        if let Some(created) = created {
            node.created = created;
        }
        let meta = Self::meta(path, &node);
        nodes.insert(path.clone(), node);
        trace!(path = %path, len = meta.len, "memory write committed");
        Ok(meta)
    }

    fn create_collection(&self, path: &CanonicalPath) -> DavResult<ResourceMeta> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(path) {
            return Err(DavError::AlreadyExists(path.to_string()));
        }
        Self::require_parent_collection(&nodes, path)?;
        let node = self.node(ResourceKind::Collection, Bytes::new());
        let meta = Self::meta(path, &node);
        nodes.insert(path.clone(), node);
        Ok(meta)
    }

    fn delete(&self, path: &CanonicalPath, recursive: bool) -> DavResult<BatchFailures> {
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(path) {
            return Err(DavError::NotFound(path.to_string()));
        }
        let keys = Self::subtree(&nodes, path);
        if keys.len() > 1 && !recursive {
            return Err(DavError::Conflict(format!("{path} is not empty")));
        }

        let blocked: Vec<CanonicalPath> = keys
            .iter()
            .filter(|key| nodes.get(*key).is_some_and(|node| node.read_only))
            .cloned()
            .collect();
        for key in keys.iter().rev() {
            // Read-only entries and their ancestors stay in place.
            if blocked.iter().any(|b| key.contains(b)) {
                continue;
            }
            nodes.remove(key);
        }
        Ok(blocked
            .into_iter()
            .map(|key| {
                let err = DavError::Forbidden(format!("{key} is read-only"));
                (key, err)
            })
            .collect())
    }

    fn move_resource(
        &self,
        src: &CanonicalPath,
        dest: &CanonicalPath,
        overwrite: bool,
    ) -> DavResult<()> {
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(src) {
            return Err(DavError::NotFound(src.to_string()));
        }
        if src.contains(dest) || dest.contains(src) {
            return Err(DavError::Conflict(format!("{src} and {dest} overlap")));
        }
        Self::claim_destination(&mut nodes, dest, overwrite)?;
        for key in Self::subtree(&nodes, src) {
            if let (Some(node), Some(target)) = (nodes.remove(&key), key.rebase(src, dest)) {
                nodes.insert(target, node);
            }
        }
        Ok(())
    }

    fn copy(
        &self,
        src: &CanonicalPath,
        dest: &CanonicalPath,
        overwrite: bool,
        depth: Depth,
    ) -> DavResult<BatchFailures> {
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(src) {
            return Err(DavError::NotFound(src.to_string()));
        }
        if src.contains(dest) || dest.contains(src) {
            return Err(DavError::Conflict(format!("{src} and {dest} overlap")));
        }
        Self::claim_destination(&mut nodes, dest, overwrite)?;
        let keys = if depth == Depth::Zero {
            vec![src.clone()]
        } else {
            Self::subtree(&nodes, src)
        };
        for key in keys {
            let Some(source) = nodes.get(&key) else {
                continue;
            };
            let copy = self.node(source.kind, source.data.clone());
            if let Some(target) = key.rebase(src, dest) {
                nodes.insert(target, copy);
            }
        }
        Ok(Vec::new())
    }
}
