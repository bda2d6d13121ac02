//! Property engine.
//!
//! Properties are keyed by [`PropName`] (namespace URI plus local name).
//! *Live* properties are derived from resource metadata and the lock table on
//! every read and cannot be written. *Dead* properties are opaque XML
//! fragments set by clients and kept in a [`PropertyDb`] that follows the
//! resource through MOVE, COPY and DELETE.

mod db;
mod live;

pub use db::PropertyDb;
pub use live::{content_type, is_live, LIVE_PROPERTIES};

use crate::error::{DavError, DavResult};
use crate::lock::ActiveLock;
use crate::path::CanonicalPath;
use crate::store::ResourceMeta;
use http::StatusCode;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// The `DAV:` namespace URI.
pub const DAV_NS: &str = "DAV:";

/// Qualified property name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropName {
    namespace: String,
    local: String,
}

impl PropName {
    /// Build a name, rejecting local names that are not XML names and
    /// namespaces containing control characters.
    pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> DavResult<Self> {
        let namespace = namespace.into();
        let local = local.into();
        if !is_xml_name(&local) {
            return Err(DavError::BadRequest(format!("invalid property name {local:?}")));
        }
        if namespace.chars().any(char::is_control) {
            return Err(DavError::BadRequest(format!("invalid namespace {namespace:?}")));
        }
        Ok(Self { namespace, local })
    }

    /// Name in the `DAV:` namespace. `local` must be a literal XML name.
    pub(crate) fn dav(local: &str) -> Self {
        Self {
            namespace: DAV_NS.to_string(),
            local: local.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn is_dav(&self) -> bool {
        self.namespace == DAV_NS
    }
}

impl fmt::Display for PropName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.namespace, self.local)
    }
}

fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_alphabetic() || first == '_')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Property value as rendered into a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
    /// Empty element (names-only listings, failed properties).
    Empty,
    /// Character data, escaped on output.
    Text(String),
    /// Self-contained XML fragment, written verbatim.
    Xml(String),
    /// `<D:collection/>` when true, empty otherwise.
    ResourceType { collection: bool },
    LockDiscovery(Vec<ActiveLock>),
    SupportedLock,
}

/// One property in a PROPFIND result: its value or why there is none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropStatus {
    pub name: PropName,
    pub outcome: Result<PropValue, StatusCode>,
}

/// What a PROPFIND asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropRequest {
    /// Every property, plus the listed ones.
    AllProp { include: Vec<PropName> },
    /// Names only.
    PropName,
    Named(Vec<PropName>),
}

/// One PROPPATCH instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropPatch {
    /// Set a dead property to an XML fragment.
    Set(PropName, String),
    Remove(PropName),
}

impl PropPatch {
    pub fn name(&self) -> &PropName {
        match self {
            PropPatch::Set(name, _) | PropPatch::Remove(name) => name,
        }
    }
}

/// Computes property listings and applies property updates.
#[derive(Debug)]
pub struct PropertyEngine {
    db: PropertyDb,
}

impl PropertyEngine {
    pub fn new(db: PropertyDb) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &PropertyDb {
        &self.db
    }

    /// Properties of one resource, in a stable order: live properties in
    /// declaration order, then dead properties by name, then any extra
    /// `include` names.
    pub fn get_properties(
        &self,
        meta: &ResourceMeta,
        locks: &[ActiveLock],
        request: &PropRequest,
    ) -> Vec<PropStatus> {
        let dead = self.db.get(&meta.path);
        match request {
            PropRequest::PropName => live::present(meta)
                .chain(dead.into_keys())
                .map(|name| PropStatus {
                    name,
                    outcome: Ok(PropValue::Empty),
                })
                .collect(),
            PropRequest::AllProp { include } => {
                let mut out: Vec<PropStatus> = live::present(meta)
                    .map(|name| {
                        let outcome = live::value(&name, meta, locks)
                            .ok_or(StatusCode::NOT_FOUND);
                        PropStatus { name, outcome }
                    })
                    .collect();
                for (name, value) in &dead {
                    out.push(PropStatus {
                        name: name.clone(),
                        outcome: Ok(PropValue::Xml(value.clone())),
                    });
                }
                for name in include {
                    if !out.iter().any(|p| &p.name == name) {
                        out.push(Self::named(name, meta, locks, &dead));
                    }
                }
                out
            }
            PropRequest::Named(names) => names
                .iter()
                .map(|name| Self::named(name, meta, locks, &dead))
                .collect(),
        }
    }

    fn named(
        name: &PropName,
        meta: &ResourceMeta,
        locks: &[ActiveLock],
        dead: &BTreeMap<PropName, String>,
    ) -> PropStatus {
        let value = if is_live(name) {
            live::value(name, meta, locks)
        } else {
            dead.get(name).cloned().map(PropValue::Xml)
        };
        PropStatus {
            name: name.clone(),
            outcome: value.ok_or(StatusCode::NOT_FOUND),
        }
    }

    /// Apply PROPPATCH instructions to `path`, returning one status per
    /// instruction in request order.
    ///
    /// Instructions naming live properties are refused individually with
    /// 403. The remaining instructions are applied in order as one unit:
    /// either all are persisted (200) or none are (500).
    pub fn set_properties(
        &self,
        path: &CanonicalPath,
        instructions: &[PropPatch],
    ) -> Vec<(PropName, StatusCode)> {
        let dead: Vec<&PropPatch> = instructions
            .iter()
            .filter(|patch| !is_live(patch.name()))
            .collect();

        let dead_status = if dead.is_empty() {
            StatusCode::OK
        } else {
            let applied = self.db.update(path, |props| {
                for patch in &dead {
                    match patch {
                        PropPatch::Set(name, value) => {
                            props.insert(name.clone(), value.clone());
                        }
                        PropPatch::Remove(name) => {
                            props.remove(name);
                        }
                    }
                }
            });
            match applied {
                Ok(()) => {
                    debug!(path = %path, count = dead.len(), "dead properties updated");
                    StatusCode::OK
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "property update not persisted");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
        };

        instructions
            .iter()
            .map(|patch| {
                let status = if is_live(patch.name()) {
                    StatusCode::FORBIDDEN
                } else {
                    dead_status
                };
                (patch.name().clone(), status)
            })
            .collect()
    }

    /// Forget the dead properties of `path` and everything below it.
    pub fn on_delete(&self, path: &CanonicalPath) -> DavResult<()> {
        self.db.remove_tree(path).inspect_err(|e| {
            warn!(path = %path, error = %e, "failed to drop properties");
        })
    }

    pub fn on_move(&self, from: &CanonicalPath, to: &CanonicalPath) -> DavResult<()> {
        self.db.move_tree(from, to).inspect_err(|e| {
            warn!(from = %from, to = %to, error = %e, "failed to move properties");
        })
    }

    pub fn on_copy(&self, from: &CanonicalPath, to: &CanonicalPath, deep: bool) -> DavResult<()> {
        self.db.copy_tree(from, to, deep).inspect_err(|e| {
            warn!(from = %from, to = %to, error = %e, "failed to copy properties");
        })
    }
}
