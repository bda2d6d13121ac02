//! Dead property storage.
//!
//! Kept in memory and, when a file is configured, mirrored to a JSON
//! document after every change. The document is replaced atomically
//! (temporary file plus rename), so a crash leaves either the old or the new
//! table on disk.

use super::PropName;
use crate::error::{ConfigError, DavError, DavResult};
use crate::path::CanonicalPath;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

type Props = BTreeMap<PropName, String>;
type Table = BTreeMap<CanonicalPath, Props>;

/// On-disk form of one property.
#[derive(Debug, Serialize, Deserialize)]
struct StoredProp {
    namespace: String,
    name: String,
    value: String,
}

#[derive(Debug, Default)]
pub struct PropertyDb {
    table: RwLock<Table>,
    file: Option<PathBuf>,
}

impl PropertyDb {
    /// Database that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the database mirrored at `file`. A missing file is an empty table.
    pub fn load(file: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let file = file.into();
        let invalid = |reason: String| ConfigError::PropertyDb {
            path: file.clone(),
            reason,
        };
        let table = match fs::read(&file) {
            Ok(bytes) => {
                let stored: BTreeMap<String, Vec<StoredProp>> =
                    serde_json::from_slice(&bytes).map_err(|e| invalid(e.to_string()))?;
                let mut table = Table::new();
                for (path, props) in stored {
                    let path: CanonicalPath = path.parse().map_err(|e: DavError| invalid(e.to_string()))?;
                    let entry = table.entry(path).or_default();
                    for prop in props {
                        let name = PropName::new(prop.namespace, prop.name)
                            .map_err(|e| invalid(e.to_string()))?;
                        entry.insert(name, prop.value);
                    }
                }
                table
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Table::new(),
            Err(e) => return Err(invalid(e.to_string())),
        };
        debug!(file = %file.display(), resources = table.len(), "loaded property database");
        Ok(Self {
            table: RwLock::new(table),
            file: Some(file),
        })
    }

    /// Dead properties of one resource.
    pub fn get(&self, path: &CanonicalPath) -> Props {
        self.table.read().get(path).cloned().unwrap_or_default()
    }

    /// Change the properties of `path` as one unit. If the change cannot be
    /// persisted the in-memory table is left untouched.
    pub fn update<F>(&self, path: &CanonicalPath, change: F) -> DavResult<()>
    where
        F: FnOnce(&mut Props),
    {
        let mut table = self.table.write();
        let mut props = table.get(path).cloned().unwrap_or_default();
        change(&mut props);

        let previous = if props.is_empty() {
            table.remove(path)
        } else {
            table.insert(path.clone(), props)
        };
        if let Err(e) = self.persist(&table) {
            match previous {
                Some(old) => table.insert(path.clone(), old),
                None => table.remove(path),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Drop the properties of `path` and its descendants.
    pub fn remove_tree(&self, path: &CanonicalPath) -> DavResult<()> {
        self.change_subtrees(&[path], |table| !take_subtree(table, path).is_empty())
    }

    /// Re-key the properties of the `from` subtree under `to`, replacing
    /// whatever `to` had.
    pub fn move_tree(&self, from: &CanonicalPath, to: &CanonicalPath) -> DavResult<()> {
        self.change_subtrees(&[from, to], |table| {
            let replaced = take_subtree(table, to);
            let moved = take_subtree(table, from);
            if replaced.is_empty() && moved.is_empty() {
                return false;
            }
            for (path, props) in moved {
                if let Some(target) = path.rebase(from, to) {
                    table.insert(target, props);
                }
            }
            true
        })
    }

    /// Duplicate the properties of `from` (and with `deep` its descendants)
    /// under `to`, replacing whatever `to` had.
    pub fn copy_tree(&self, from: &CanonicalPath, to: &CanonicalPath, deep: bool) -> DavResult<()> {
        self.change_subtrees(&[to], |table| {
            let replaced = take_subtree(table, to);
            let copies: Vec<(CanonicalPath, Props)> = subtree(table, from)
                .filter(|(path, _)| deep || *path == from)
                .filter_map(|(path, props)| Some((path.rebase(from, to)?, props.clone())))
                .collect();
            if replaced.is_empty() && copies.is_empty() {
                return false;
            }
            table.extend(copies);
            true
        })
    }

    /// Apply `change`, which only touches entries under `roots` and reports
    /// whether it changed anything, then persist. If persisting fails those
    /// subtrees are restored to their previous content.
    fn change_subtrees<F>(&self, roots: &[&CanonicalPath], change: F) -> DavResult<()>
    where
        F: FnOnce(&mut Table) -> bool,
    {
        let mut table = self.table.write();
        let current: &Table = &table;
        let snapshot: Vec<(CanonicalPath, Props)> = roots
            .iter()
            .flat_map(|root| subtree(current, root))
            .map(|(path, props)| (path.clone(), props.clone()))
            .collect();
        if !change(&mut *table) {
            return Ok(());
        }
        if let Err(e) = self.persist(&table) {
            for root in roots {
                take_subtree(&mut *table, root);
            }
            table.extend(snapshot);
            return Err(e);
        }
        Ok(())
    }

    fn persist(&self, table: &Table) -> DavResult<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let stored: BTreeMap<String, Vec<StoredProp>> = table
            .iter()
            .map(|(path, props)| {
                let props = props
                    .iter()
                    .map(|(name, value)| StoredProp {
                        namespace: name.namespace().to_string(),
                        name: name.local().to_string(),
                        value: value.clone(),
                    })
                    .collect();
                (path.to_string(), props)
            })
            .collect();
        let bytes = serde_json::to_vec_pretty(&stored)
            .map_err(|e| DavError::io(file.display(), io::Error::other(e)))?;
        write_atomic(file, &bytes).map_err(|e| DavError::io(file.display(), e))?;
        trace!(file = %file.display(), resources = stored.len(), "property database saved");
        Ok(())
    }
}

/// Entries of `root` and its descendants, in path order.
fn subtree<'a>(
    table: &'a Table,
    root: &'a CanonicalPath,
) -> impl Iterator<Item = (&'a CanonicalPath, &'a Props)> + 'a {
    table
        .range(root.clone()..)
        .take_while(move |(path, _)| root.contains(path))
}

fn take_subtree(table: &mut Table, root: &CanonicalPath) -> Vec<(CanonicalPath, Props)> {
    let keys: Vec<CanonicalPath> = subtree(table, root)
        .map(|(path, _)| path.clone())
        .collect();
    keys.into_iter()
        .filter_map(|key| table.remove_entry(&key))
        .collect()
}

fn write_atomic(file: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".props-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(file).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn p(s: &str) -> CanonicalPath {
        s.parse().unwrap()
    }

    fn name(local: &str) -> PropName {
        PropName::new("urn:test", local).unwrap()
    }

    fn set(db: &PropertyDb, path: &str, local: &str, value: &str) -> DavResult<()> {
        db.update(&p(path), |props| {
            props.insert(name(local), value.to_string());
        })
    }

    #[test]
    fn test_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("props.json");
        let db = PropertyDb::load(&file).unwrap();
        set(&db, "/a", "color", "<x xmlns=\"urn:c\">red</x>").unwrap();

        let reloaded = PropertyDb::load(&file).unwrap();
        assert_eq!(
            reloaded.get(&p("/a")).get(&name("color")).map(String::as_str),
            Some("<x xmlns=\"urn:c\">red</x>")
        );
    }

    #[test]
    fn test_corrupt_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("props.json");
        fs::write(&file, b"{not json").unwrap();
        assert!(matches!(
            PropertyDb::load(&file),
            Err(ConfigError::PropertyDb { .. })
        ));
    }

    #[test]
    fn test_failed_persist_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("state");
        fs::create_dir(&sub).unwrap();
        let db = PropertyDb::load(sub.join("props.json")).unwrap();
        set(&db, "/a", "kept", "1").unwrap();

        fs::remove_dir_all(&sub).unwrap();
        assert!(set(&db, "/a", "lost", "2").is_err());
        let props = db.get(&p("/a"));
        assert_eq!(props.len(), 1);
        assert!(props.contains_key(&name("kept")));
    }

    #[test]
    fn test_failed_persist_restores_subtrees() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("state");
        fs::create_dir(&sub).unwrap();
        let db = PropertyDb::load(sub.join("props.json")).unwrap();
        set(&db, "/src", "k", "root").unwrap();
        set(&db, "/src/child", "k", "child").unwrap();
        set(&db, "/dst", "k", "old").unwrap();

        fs::remove_dir_all(&sub).unwrap();
        assert!(db.remove_tree(&p("/src")).is_err());
        assert!(db.move_tree(&p("/src"), &p("/dst")).is_err());
        assert!(db.copy_tree(&p("/src"), &p("/dst"), true).is_err());

        let value = |path: &str| db.get(&p(path)).get(&name("k")).cloned();
        assert_eq!(value("/src").as_deref(), Some("root"));
        assert_eq!(value("/src/child").as_deref(), Some("child"));
        assert_eq!(value("/dst").as_deref(), Some("old"));
        assert_eq!(value("/dst/child"), None);
    }

    #[test]
    fn test_subtree_operations() {
        let db = PropertyDb::in_memory();
        set(&db, "/src", "k", "root").unwrap();
        set(&db, "/src/child", "k", "child").unwrap();
        set(&db, "/srcx", "k", "sibling").unwrap();
        set(&db, "/dst/old", "k", "stale").unwrap();

        db.copy_tree(&p("/src"), &p("/shallow"), false).unwrap();
        assert_eq!(db.get(&p("/shallow")).len(), 1);
        assert!(db.get(&p("/shallow/child")).is_empty());

        db.move_tree(&p("/src"), &p("/dst")).unwrap();
        assert!(db.get(&p("/src")).is_empty());
        assert!(db.get(&p("/dst/old")).is_empty());
        assert_eq!(db.get(&p("/dst/child")).get(&name("k")).map(String::as_str), Some("child"));
        assert_eq!(db.get(&p("/srcx")).len(), 1);

        db.remove_tree(&p("/dst")).unwrap();
        assert!(db.get(&p("/dst")).is_empty());
        assert!(db.get(&p("/dst/child")).is_empty());
    }
}
