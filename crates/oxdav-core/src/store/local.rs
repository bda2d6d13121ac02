//! Resource store backed by a directory on the local file system.

use super::{
    occupied_destination, BatchFailures, Depth, EntityTag, ReadSeek, ResourceMeta, ResourceStore,
    WriteMode,
};
use crate::error::{ConfigError, DavError, DavResult};
use crate::path::CanonicalPath;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::{Builder, NamedTempFile};
use tracing::{debug, instrument, trace, warn};
use walkdir::{DirEntry, WalkDir};

/// Name prefix of in-flight temporary files. Never listed.
const TEMP_PREFIX: &str = ".oxdav-";
const TEMP_SUFFIX: &str = ".part";

/// Store rooted at a local directory.
///
/// Writes land in a hidden temporary file next to the target and are renamed
/// into place once the whole body has been received and synced.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open a store rooted at `root`.
    ///
    /// The root must exist, be a directory and be readable. Failures here are
    /// fatal configuration errors.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let root = root.as_ref();
        let unreadable = |source| ConfigError::UnreadableRoot {
            path: root.to_path_buf(),
            source,
        };
        let canonical = fs::canonicalize(root).map_err(unreadable)?;
        if !fs::metadata(&canonical).map_err(unreadable)?.is_dir() {
            return Err(ConfigError::RootNotDirectory(root.to_path_buf()));
        }
        fs::read_dir(&canonical).map_err(unreadable)?;
        debug!(root = %canonical.display(), "opened local store");
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Physical location of `path`, refusing symlinks that lead outside the root.
    fn physical(&self, path: &CanonicalPath) -> DavResult<PathBuf> {
        let full = path.to_fs_path(&self.root);
        let mut cursor = Some(full.as_path());
        while let Some(candidate) = cursor {
            match fs::canonicalize(candidate) {
                Ok(resolved) => {
                    if !resolved.starts_with(&self.root) {
                        warn!(path = %path, resolved = %resolved.display(), "path escapes root");
                        return Err(DavError::InvalidPath(format!("{path} escapes the root")));
                    }
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => cursor = candidate.parent(),
                Err(e) => return Err(DavError::from_io(path, e)),
            }
        }
        Ok(full)
    }

    fn require_parent_dir(path: &CanonicalPath, full: &Path) -> DavResult<()> {
        let parent = full
            .parent()
            .filter(|_| !path.is_root())
            .ok_or_else(|| DavError::Conflict("root has no parent".to_string()))?;
        match fs::metadata(parent) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(DavError::Conflict(format!("parent of {path} is not a collection"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(DavError::Conflict(format!("parent of {path} does not exist")))
            }
            Err(e) => Err(DavError::io(path, e)),
        }
    }

    /// Clear or refuse an existing move/copy target. A file replacing a file
    /// is left in place for the rename to swap atomically.
    fn claim_destination(
        dest: &CanonicalPath,
        to: &Path,
        overwrite: bool,
        source_is_dir: bool,
    ) -> DavResult<()> {
        Self::require_parent_dir(dest, to)?;
        let Ok(existing) = fs::symlink_metadata(to) else {
            return Ok(());
        };
        if !overwrite {
            let non_empty = existing.is_dir()
                && fs::read_dir(to)
                    .map(|mut entries| entries.next().is_some())
                    .unwrap_or(false);
            return Err(occupied_destination(dest, non_empty));
        }
        if !source_is_dir && !existing.is_dir() {
            return Ok(());
        }
        let removed = if existing.is_dir() {
            fs::remove_dir_all(to)
        } else {
            fs::remove_file(to)
        };
        removed.map_err(|e| DavError::from_io(dest, e))
    }

    fn temp_in(dir: &Path, path: &CanonicalPath) -> DavResult<NamedTempFile> {
        Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(dir)
            .map_err(|e| DavError::io(path, e))
    }

    /// Rename a finished temporary file into place, retrying once on a race.
    fn commit(tmp: NamedTempFile, target: &Path, path: &CanonicalPath) -> DavResult<()> {
        match tmp.persist(target) {
            Ok(_) => Ok(()),
            Err(first) => {
                debug!(path = %path, error = %first.error, "rename failed, retrying once");
                first
                    .file
                    .persist(target)
                    .map(|_| ())
                    .map_err(|e| DavError::io(path, e.error))
            }
        }
    }

    /// Atomically copy one file.
    fn copy_file(from: &Path, to: &Path, path: &CanonicalPath) -> DavResult<()> {
        let dir = to
            .parent()
            .ok_or_else(|| DavError::Conflict(path.to_string()))?;
        let mut tmp = Self::temp_in(dir, path)?;
        let mut source = File::open(from).map_err(|e| DavError::from_io(path, e))?;
        io::copy(&mut source, tmp.as_file_mut()).map_err(|e| DavError::io(path, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| DavError::io(path, e))?;
        Self::commit(tmp, to, path)
    }
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
}

/// Entries worth descending into: valid UTF-8 names, no temporary files.
fn listable(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    match entry.file_name().to_str() {
        Some(name) => !is_temp_name(name) && CanonicalPath::root().join(name).is_ok(),
        None => false,
    }
}

/// Canonical path of `rel` below `base`.
fn child_path(base: &CanonicalPath, rel: &Path) -> Option<CanonicalPath> {
    let mut path = base.clone();
    for component in rel.components() {
        let Component::Normal(name) = component else {
            return None;
        };
        path = path.join(name.to_str()?).ok()?;
    }
    Some(path)
}

#[cfg(unix)]
fn etag_for(meta: &fs::Metadata, modified: SystemTime) -> EntityTag {
    use std::os::unix::fs::MetadataExt;
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    EntityTag::new(&format!("{:x}-{:x}-{:x}", meta.ino(), meta.len(), nanos))
}

#[cfg(not(unix))]
fn etag_for(meta: &fs::Metadata, modified: SystemTime) -> EntityTag {
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    EntityTag::new(&format!("{:x}-{:x}", meta.len(), nanos))
}

fn describe(path: &CanonicalPath, meta: &fs::Metadata) -> ResourceMeta {
    let modified = meta.modified().unwrap_or(UNIX_EPOCH);
    let etag = etag_for(meta, modified);
    let described = if meta.is_dir() {
        ResourceMeta::collection(path.clone(), modified, etag)
    } else {
        ResourceMeta::leaf(path.clone(), meta.len(), modified, etag)
    };
    described
        .with_created(meta.created().ok())
        .with_read_only(meta.permissions().readonly())
}

impl ResourceStore for LocalStore {
    fn stat(&self, path: &CanonicalPath) -> DavResult<ResourceMeta> {
        let full = self.physical(path)?;
        let meta = fs::metadata(&full).map_err(|e| DavError::from_io(path, e))?;
        Ok(describe(path, &meta))
    }

    #[instrument(level = "trace", skip(self))]
    fn list(&self, path: &CanonicalPath, depth: Depth) -> DavResult<Vec<ResourceMeta>> {
        let full = self.physical(path)?;
        let meta = fs::metadata(&full).map_err(|e| DavError::from_io(path, e))?;
        let mut entries = vec![describe(path, &meta)];
        if !meta.is_dir() || depth == Depth::Zero {
            return Ok(entries);
        }

        let max_depth = if depth == Depth::One { 1 } else { usize::MAX };
        let walker = WalkDir::new(&full)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(listable);
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(path = %path, error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let Some(child) = entry
                .path()
                .strip_prefix(&full)
                .ok()
                .and_then(|rel| child_path(path, rel))
            else {
                continue;
            };
            if entry.path_is_symlink() && self.physical(&child).is_err() {
                continue;
            }
            match fs::metadata(entry.path()) {
                Ok(child_meta) => entries.push(describe(&child, &child_meta)),
                Err(e) => warn!(path = %child, error = %e, "skipping entry without metadata"),
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn open_read(&self, path: &CanonicalPath) -> DavResult<Box<dyn ReadSeek>> {
        let full = self.physical(path)?;
        let file = File::open(&full).map_err(|e| DavError::from_io(path, e))?;
        let meta = file.metadata().map_err(|e| DavError::io(path, e))?;
        if meta.is_dir() {
            return Err(DavError::Conflict(format!("{path} is a collection")));
        }
        Ok(Box::new(file))
    }

    #[instrument(level = "debug", skip(self, content))]
    fn write(
        &self,
        path: &CanonicalPath,
        mode: WriteMode,
        content: &mut dyn Read,
    ) -> DavResult<ResourceMeta> {
        let full = self.physical(path)?;
        Self::require_parent_dir(path, &full)?;
        let existing = fs::metadata(&full).ok();
        if let Some(existing) = &existing {
            if existing.is_dir() {
                return Err(DavError::Conflict(format!("{path} is a collection")));
            }
            if existing.permissions().readonly() {
                return Err(DavError::Forbidden(format!("{path} is read-only")));
            }
        }

        let dir = full
            .parent()
            .ok_or_else(|| DavError::Conflict(path.to_string()))?;
        let mut tmp = Self::temp_in(dir, path)?;
        if mode == WriteMode::Append && existing.is_some() {
            let mut current = File::open(&full).map_err(|e| DavError::from_io(path, e))?;
            io::copy(&mut current, tmp.as_file_mut()).map_err(|e| DavError::io(path, e))?;
        }
        // A body read error (including cancellation) drops the temp file here.
        let written = io::copy(content, tmp.as_file_mut()).map_err(|e| DavError::io(path, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| DavError::io(path, e))?;

        if let Some(existing) = &existing {
            tmp.as_file()
                .set_permissions(existing.permissions())
                .map_err(|e| DavError::io(path, e))?;
        } else {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tmp.as_file()
                    .set_permissions(fs::Permissions::from_mode(0o644))
                    .map_err(|e| DavError::io(path, e))?;
            }
        }

        Self::commit(tmp, &full, path)?;
        trace!(path = %path, written, "local write committed");
        self.stat(path)
    }

    fn create_collection(&self, path: &CanonicalPath) -> DavResult<ResourceMeta> {
        let full = self.physical(path)?;
        if fs::symlink_metadata(&full).is_ok() {
            return Err(DavError::AlreadyExists(path.to_string()));
        }
        Self::require_parent_dir(path, &full)?;
        fs::create_dir(&full).map_err(|e| DavError::from_io(path, e))?;
        self.stat(path)
    }

    #[instrument(level = "debug", skip(self))]
    fn delete(&self, path: &CanonicalPath, recursive: bool) -> DavResult<BatchFailures> {
        let full = self.physical(path)?;
        let meta = fs::symlink_metadata(&full).map_err(|e| DavError::from_io(path, e))?;
        if !meta.is_dir() {
            fs::remove_file(&full).map_err(|e| DavError::from_io(path, e))?;
            return Ok(Vec::new());
        }
        if !recursive {
            let non_empty = fs::read_dir(&full)
                .map_err(|e| DavError::from_io(path, e))?
                .next()
                .is_some();
            if non_empty {
                return Err(DavError::Conflict(format!("{path} is not empty")));
            }
            fs::remove_dir(&full).map_err(|e| DavError::from_io(path, e))?;
            return Ok(Vec::new());
        }

        let mut failures = Vec::new();
        // Directories that must stay because something below them failed.
        let mut pinned: HashSet<PathBuf> = HashSet::new();
        for entry in WalkDir::new(&full).contents_first(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let failed = e.path().map(Path::to_path_buf).unwrap_or_else(|| full.clone());
                    let io_err = e
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::other("walk failed"));
                    failures.push((path.clone(), DavError::io(path, io_err)));
                    pin_ancestors(&mut pinned, &failed, &full);
                    continue;
                }
            };
            if entry.file_type().is_dir() && pinned.contains(entry.path()) {
                continue;
            }
            let removed = if entry.file_type().is_dir() {
                fs::remove_dir(entry.path())
            } else {
                fs::remove_file(entry.path())
            };
            if let Err(e) = removed {
                let failed = entry
                    .path()
                    .strip_prefix(&full)
                    .ok()
                    .and_then(|rel| child_path(path, rel))
                    .unwrap_or_else(|| path.clone());
                warn!(path = %failed, error = %e, "recursive delete entry failed");
                failures.push((failed.clone(), DavError::from_io(&failed, e)));
                pin_ancestors(&mut pinned, entry.path(), &full);
            }
        }
        Ok(failures)
    }

    fn move_resource(
        &self,
        src: &CanonicalPath,
        dest: &CanonicalPath,
        overwrite: bool,
    ) -> DavResult<()> {
        let from = self.physical(src)?;
        let to = self.physical(dest)?;
        let meta = fs::symlink_metadata(&from).map_err(|e| DavError::from_io(src, e))?;
        if src.contains(dest) || dest.contains(src) {
            return Err(DavError::Conflict(format!("{src} and {dest} overlap")));
        }
        Self::claim_destination(dest, &to, overwrite, meta.is_dir())?;
        fs::rename(&from, &to)
            .or_else(|first| {
                debug!(src = %src, dest = %dest, error = %first, "rename failed, retrying once");
                fs::rename(&from, &to)
            })
            .map_err(|e| DavError::from_io(src, e))
    }

    fn copy(
        &self,
        src: &CanonicalPath,
        dest: &CanonicalPath,
        overwrite: bool,
        depth: Depth,
    ) -> DavResult<BatchFailures> {
        let from = self.physical(src)?;
        let to = self.physical(dest)?;
        let meta = fs::metadata(&from).map_err(|e| DavError::from_io(src, e))?;
        if src.contains(dest) || dest.contains(src) {
            return Err(DavError::Conflict(format!("{src} and {dest} overlap")));
        }
        Self::claim_destination(dest, &to, overwrite, meta.is_dir())?;

        if !meta.is_dir() {
            Self::copy_file(&from, &to, dest)?;
            return Ok(Vec::new());
        }
        fs::create_dir(&to).map_err(|e| DavError::from_io(dest, e))?;
        if depth == Depth::Zero {
            return Ok(Vec::new());
        }

        let mut failures = Vec::new();
        let walker = WalkDir::new(&from)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(listable);
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let io_err = e
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::other("walk failed"));
                    failures.push((src.clone(), DavError::io(src, io_err)));
                    continue;
                }
            };
            let Ok(rel) = entry.path().strip_prefix(&from) else {
                continue;
            };
            let Some(target_path) = child_path(dest, rel) else {
                continue;
            };
            let target = to.join(rel);
            let result = if entry.file_type().is_dir() {
                fs::create_dir(&target).map_err(|e| DavError::from_io(&target_path, e))
            } else {
                Self::copy_file(entry.path(), &target, &target_path)
            };
            if let Err(e) = result {
                warn!(path = %target_path, error = %e, "copy entry failed");
                failures.push((target_path, e));
            }
        }
        Ok(failures)
    }
}

fn pin_ancestors(pinned: &mut HashSet<PathBuf>, failed: &Path, top: &Path) {
    let mut current = failed.parent();
    while let Some(dir) = current {
        if !dir.starts_with(top) {
            break;
        }
        pinned.insert(dir.to_path_buf());
        current = dir.parent();
    }
}
