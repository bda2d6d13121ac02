//! Live properties, computed from metadata on every read.

use super::{PropName, PropValue};
use crate::lock::ActiveLock;
use crate::store::ResourceMeta;
use chrono::{DateTime, SecondsFormat, Utc};

/// Live properties in the `DAV:` namespace, in listing order.
pub const LIVE_PROPERTIES: &[&str] = &[
    "creationdate",
    "displayname",
    "getcontentlength",
    "getcontenttype",
    "getetag",
    "getlastmodified",
    "resourcetype",
    "lockdiscovery",
    "supportedlock",
    "ishidden",
    "isreadonly",
];

/// Leaf-only properties.
const LEAF_ONLY: &[&str] = &["getcontentlength", "getcontenttype"];

pub fn is_live(name: &PropName) -> bool {
    name.is_dav() && LIVE_PROPERTIES.contains(&name.local())
}

/// Live properties that apply to `meta`.
pub(super) fn present(meta: &ResourceMeta) -> impl Iterator<Item = PropName> + '_ {
    LIVE_PROPERTIES
        .iter()
        .filter(|local| !meta.is_collection() || !LEAF_ONLY.contains(*local))
        .map(|local| PropName::dav(local))
}

pub(super) fn value(name: &PropName, meta: &ResourceMeta, locks: &[ActiveLock]) -> Option<PropValue> {
    if !name.is_dav() {
        return None;
    }
    let leaf = !meta.is_collection();
    let flag = |on: bool| PropValue::Text(if on { "1" } else { "0" }.to_string());
    let value = match name.local() {
        "creationdate" => {
            let created: DateTime<Utc> = meta.created.unwrap_or(meta.modified).into();
            PropValue::Text(created.to_rfc3339_opts(SecondsFormat::Secs, true))
        }
        "displayname" => PropValue::Text(meta.path.name().unwrap_or_default().to_string()),
        "getcontentlength" if leaf => PropValue::Text(meta.len.to_string()),
        "getcontenttype" if leaf => PropValue::Text(content_type(meta)),
        "getetag" => PropValue::Text(meta.etag.to_string()),
        "getlastmodified" => PropValue::Text(httpdate::fmt_http_date(meta.modified)),
        "resourcetype" => PropValue::ResourceType {
            collection: meta.is_collection(),
        },
        "lockdiscovery" => PropValue::LockDiscovery(locks.to_vec()),
        "supportedlock" => PropValue::SupportedLock,
        "ishidden" => flag(meta.hidden),
        "isreadonly" => flag(meta.read_only),
        _ => return None,
    };
    Some(value)
}

/// Content type guessed from the resource name.
pub fn content_type(meta: &ResourceMeta) -> String {
    let name = meta.path.name().unwrap_or_default();
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
