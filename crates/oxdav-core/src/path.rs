//! Request URI to resource identity mapping.
//!
//! [`PathResolver`] turns the raw, percent-encoded request path into a
//! [`CanonicalPath`]: an ordered list of decoded segments with no `.`/`..`
//! and no empty segments. Anything that would climb above the mount prefix
//! is rejected with [`DavError::InvalidPath`].

use crate::error::{ConfigError, DavError, DavResult};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Characters escaped when rendering a path segment into a URI.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Canonical identity of a resource below the served root.
///
/// Ordering is segment-wise lexicographic, so a parent sorts before its
/// descendants and siblings sort by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalPath {
    segments: Vec<String>,
}

impl CanonicalPath {
    /// The root collection.
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a path from already-decoded segments, validating each one.
    pub fn from_segments<I, S>(segments: I) -> DavResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut path = Self::root();
        for segment in segments {
            let segment = segment.into();
            validate_segment(&segment)?;
            path.segments.push(segment);
        }
        Ok(path)
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments (0 for the root).
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Last segment, `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Parent collection, `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Child path with one more segment.
    pub fn join(&self, name: &str) -> DavResult<Self> {
        validate_segment(name)?;
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self { segments })
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &CanonicalPath) -> bool {
        self.segments.len() < other.segments.len() && other.segments.starts_with(&self.segments)
    }

    /// True if `other` is `self` or lies below it.
    pub fn contains(&self, other: &CanonicalPath) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// Strict ancestors, nearest first, ending with the root.
    pub fn ancestors(&self) -> impl Iterator<Item = CanonicalPath> + '_ {
        (0..self.segments.len()).rev().map(|len| CanonicalPath {
            segments: self.segments[..len].to_vec(),
        })
    }

    /// Re-root `self` from `from` onto `to` (`/a/x` from `/a` to `/b` is `/b/x`).
    pub fn rebase(&self, from: &CanonicalPath, to: &CanonicalPath) -> Option<CanonicalPath> {
        if !from.contains(self) {
            return None;
        }
        let mut segments = to.segments.clone();
        segments.extend_from_slice(&self.segments[from.segments.len()..]);
        Some(CanonicalPath { segments })
    }

    /// Physical location below a directory root.
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for segment in &self.segments {
            path.push(segment);
        }
        path
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

/// Parses the display form (`/a/b`), decoded and strictly canonical.
impl FromStr for CanonicalPath {
    type Err = DavError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "/" {
            return Ok(Self::root());
        }
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| DavError::InvalidPath(s.to_string()))?;
        Self::from_segments(rest.split('/'))
    }
}

fn validate_segment(segment: &str) -> DavResult<()> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '\0'])
    {
        return Err(DavError::InvalidPath(segment.to_string()));
    }
    Ok(())
}

/// Maps request URIs to canonical paths below a mount prefix.
#[derive(Debug, Clone, Default)]
pub struct PathResolver {
    prefix: CanonicalPath,
}

impl PathResolver {
    /// Resolver serving the whole URI space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver serving only URIs below `prefix` (e.g. `/webdav`).
    pub fn with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPrefix {
            prefix: prefix.to_string(),
            reason: reason.to_string(),
        };
        if !prefix.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }
        let prefix = normalize(prefix).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self { prefix })
    }

    pub fn prefix(&self) -> &CanonicalPath {
        &self.prefix
    }

    /// Resolve a raw request path.
    pub fn resolve(&self, raw: &str) -> DavResult<CanonicalPath> {
        if raw.is_empty() {
            return Err(DavError::InvalidPath("empty path".to_string()));
        }
        let path = raw.split(['?', '#']).next().unwrap_or_default();
        if !path.starts_with('/') {
            return Err(DavError::InvalidPath(raw.to_string()));
        }
        let full = normalize(path)?;
        full.rebase(&self.prefix, &CanonicalPath::root())
            .ok_or_else(|| DavError::InvalidPath(format!("{raw} is outside {}", self.prefix)))
    }

    /// Resolve a `Destination` (or tagged `If`) URI.
    ///
    /// Absolute URIs must name the same authority as `host`.
    pub fn resolve_destination(&self, raw: &str, host: Option<&str>) -> DavResult<CanonicalPath> {
        let raw = raw.trim();
        let Some((_, rest)) = raw.split_once("://") else {
            return self.resolve(raw);
        };
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if let Some(host) = host
            && !authority.eq_ignore_ascii_case(host)
        {
            return Err(DavError::BadGateway(raw.to_string()));
        }
        self.resolve(path)
    }

    /// Percent-encoded URI for a path, with a trailing slash for collections.
    pub fn href(&self, path: &CanonicalPath, collection: bool) -> String {
        let mut out = String::new();
        for segment in self.prefix.segments().iter().chain(path.segments()) {
            out.push('/');
            out.extend(utf8_percent_encode(segment, SEGMENT));
        }
        if out.is_empty() {
            out.push('/');
        } else if collection {
            out.push('/');
        }
        out
    }
}

/// Decode and normalize an absolute path, refusing to climb above `/`.
fn normalize(path: &str) -> DavResult<CanonicalPath> {
    let mut segments: Vec<String> = Vec::new();
    for raw in path.split('/') {
        let decoded = percent_decode_str(raw)
            .decode_utf8()
            .map_err(|_| DavError::InvalidPath(format!("bad encoding in {path}")))?;
        match decoded.as_ref() {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(DavError::InvalidPath(format!("{path} escapes the root")));
                }
            }
            segment => {
                validate_segment(segment)?;
                segments.push(segment.to_string());
            }
        }
    }
    Ok(CanonicalPath { segments })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> CanonicalPath {
        s.parse().unwrap()
    }

    #[test]
    fn test_resolve_basic() {
        let r = PathResolver::new();
        assert_eq!(r.resolve("/").unwrap(), CanonicalPath::root());
        assert_eq!(r.resolve("/a/b").unwrap(), p("/a/b"));
        assert_eq!(r.resolve("/a/b/").unwrap(), p("/a/b"));
        assert_eq!(r.resolve("//a///b").unwrap(), p("/a/b"));
        assert_eq!(r.resolve("/a/./b").unwrap(), p("/a/b"));
        assert_eq!(r.resolve("/a/c/../b").unwrap(), p("/a/b"));
        assert_eq!(r.resolve("/a/b?x=1#frag").unwrap(), p("/a/b"));
    }

    #[test]
    fn test_resolve_decodes_percent_escapes() {
        let r = PathResolver::new();
        let path = r.resolve("/my%20docs/caf%C3%A9.txt").unwrap();
        assert_eq!(path.segments(), ["my docs", "café.txt"]);
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let r = PathResolver::new();
        assert!(matches!(r.resolve("/../../etc"), Err(DavError::InvalidPath(_))));
        assert!(matches!(r.resolve("/a/../../etc"), Err(DavError::InvalidPath(_))));
        assert!(matches!(r.resolve("/%2e%2e/etc"), Err(DavError::InvalidPath(_))));
    }

    #[test]
    fn test_resolve_rejects_malformed() {
        let r = PathResolver::new();
        assert!(r.resolve("").is_err());
        assert!(r.resolve("relative/path").is_err());
        assert!(r.resolve("/a%2Fb").is_err());
        assert!(r.resolve("/a%00b").is_err());
        assert!(r.resolve("/%ff").is_err());
    }

    #[test]
    fn test_prefix_is_stripped() {
        let r = PathResolver::with_prefix("/webdav").unwrap();
        assert_eq!(r.resolve("/webdav").unwrap(), CanonicalPath::root());
        assert_eq!(r.resolve("/webdav/x").unwrap(), p("/x"));
        assert!(r.resolve("/other/x").is_err());
        assert!(r.resolve("/webdav/../x").is_err());
        assert_eq!(r.href(&p("/x"), false), "/webdav/x");
        assert_eq!(r.href(&CanonicalPath::root(), true), "/webdav/");
    }

    #[test]
    fn test_destination_authority() {
        let r = PathResolver::new();
        assert_eq!(
            r.resolve_destination("http://localhost:8080/a/b", Some("localhost:8080"))
                .unwrap(),
            p("/a/b")
        );
        assert!(matches!(
            r.resolve_destination("http://elsewhere/a", Some("localhost:8080")),
            Err(DavError::BadGateway(_))
        ));
        assert_eq!(r.resolve_destination("/a/b", None).unwrap(), p("/a/b"));
    }

    #[test]
    fn test_path_relations() {
        let a = p("/a");
        let ab = p("/a/b");
        assert!(a.is_ancestor_of(&ab));
        assert!(!ab.is_ancestor_of(&a));
        assert!(!a.is_ancestor_of(&a));
        assert!(a.contains(&a));
        assert!(!p("/ab").contains(&ab));
        assert_eq!(ab.parent(), Some(a.clone()));
        assert_eq!(ab.ancestors().collect::<Vec<_>>(), vec![a.clone(), CanonicalPath::root()]);
        assert_eq!(p("/a/x/y").rebase(&a, &p("/b")), Some(p("/b/x/y")));
        assert_eq!(p("/c").rebase(&a, &p("/b")), None);
    }

    #[test]
    fn test_ordering_is_parent_first() {
        let mut paths = vec![p("/a0"), p("/a/b"), p("/a"), CanonicalPath::root()];
        paths.sort();
        assert_eq!(paths, vec![CanonicalPath::root(), p("/a"), p("/a/b"), p("/a0")]);
    }
}

#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    fn segment() -> impl Strategy<Value = String> {
        "[^/\\\\\u{0}]{1,12}".prop_filter("dot segments", |s| s != "." && s != "..")
    }

    proptest! {
        /// Rendering a canonical path and resolving it again is the identity.
        #[test]
        fn href_then_resolve_is_identity(
            segments in prop::collection::vec(segment(), 0..6),
            collection in any::<bool>(),
        ) {
            let resolver = PathResolver::with_prefix("/dav").unwrap();
            let path = CanonicalPath::from_segments(segments).unwrap();
            let href = resolver.href(&path, collection);
            prop_assert_eq!(resolver.resolve(&href).unwrap(), path);
        }

        /// Climbing above the root is always rejected.
        #[test]
        fn escaping_root_is_rejected(
            segments in prop::collection::vec("[a-z]{1,5}", 0..4),
        ) {
            let resolver = PathResolver::new();
            let mut raw = String::new();
            for s in &segments {
                raw.push('/');
                raw.push_str(s);
            }
            for _ in 0..=segments.len() {
                raw.push_str("/..");
            }
            raw.push_str("/etc");
            prop_assert!(matches!(resolver.resolve(&raw), Err(DavError::InvalidPath(_))));
        }
    }
}
