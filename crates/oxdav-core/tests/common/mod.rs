//! Shared harness for dispatcher integration tests.
//!
//! `TestDav` wraps a [`Dispatcher`] over a fresh store and a manual clock,
//! with one-line helpers for the common requests.

#![allow(dead_code)]

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use oxdav_core::{
    CancelFlag, DavConfig, DavRequest, Dispatcher, LocalStore, LockManager, ManualClock,
    MemoryStore, RequestBody, ResourceStore,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub const LOCKINFO_EXCLUSIVE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:lockinfo xmlns:D="DAV:">
  <D:lockscope><D:exclusive/></D:lockscope>
  <D:locktype><D:write/></D:locktype>
  <D:owner><D:href>mailto:tester@example.com</D:href></D:owner>
</D:lockinfo>"#;

pub const LOCKINFO_SHARED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:lockinfo xmlns:D="DAV:">
  <D:lockscope><D:shared/></D:lockscope>
  <D:locktype><D:write/></D:locktype>
</D:lockinfo>"#;

/// A response with its body drained.
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Reply {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Lock token from the `Lock-Token` header, without angle brackets.
    pub fn lock_token(&self) -> String {
        let raw = self
            .header("lock-token")
            .unwrap_or_else(|| panic!("no Lock-Token header, status {}", self.status));
        raw.trim_matches(|c| c == '<' || c == '>').to_string()
    }

    #[track_caller]
    pub fn assert_status(&self, expected: StatusCode) -> &Self {
        assert_eq!(
            self.status,
            expected,
            "unexpected status, body: {}",
            self.text()
        );
        self
    }
}

pub struct TestDav {
    pub dav: Dispatcher,
    pub clock: Arc<ManualClock>,
    root: Option<TempDir>,
}

impl TestDav {
    /// Dispatcher over an empty in-memory store.
    pub fn memory() -> Self {
        Self::memory_with(DavConfig::default())
    }

    pub fn memory_with(config: DavConfig) -> Self {
        Self::build(Arc::new(MemoryStore::new()), config, None)
    }

    /// Dispatcher over an empty temporary directory.
    pub fn local() -> Self {
        Self::local_with(DavConfig::default())
    }

    pub fn local_with(config: DavConfig) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let store = LocalStore::open(dir.path()).expect("open local store");
        Self::build(Arc::new(store), config, Some(dir))
    }

    fn build(store: Arc<dyn ResourceStore>, config: DavConfig, root: Option<TempDir>) -> Self {
        let clock = Arc::new(ManualClock::new());
        let locks = Arc::new(LockManager::with_clock(clock.clone()));
        let dav = Dispatcher::new(store, config)
            .expect("valid config")
            .with_lock_manager(locks);
        Self {
            dav,
            clock,
            root,
        }
    }

    /// Directory backing a local store.
    pub fn root_dir(&self) -> &Path {
        self.root.as_ref().expect("local store").path()
    }

    pub fn request(&self, method: &str, path: &str) -> DavRequest {
        let method = Method::from_bytes(method.as_bytes()).expect("method");
        DavRequest::new(method, path)
    }

    pub fn send(&self, request: DavRequest) -> Reply {
        let response = self.dav.handle(request);
        Reply {
            status: response.status,
            headers: response.headers,
            body: response.body.into_bytes().expect("response body"),
        }
    }

    pub fn put(&self, path: &str, content: impl Into<Bytes>) -> Reply {
        self.send(self.request("PUT", path).body(content))
    }

    #[track_caller]
    pub fn put_ok(&self, path: &str, content: impl Into<Bytes>) {
        let reply = self.put(path, content);
        assert!(
            reply.status.is_success(),
            "PUT {path} failed with {}",
            reply.status
        );
    }

    pub fn get(&self, path: &str) -> Reply {
        self.send(self.request("GET", path))
    }

    #[track_caller]
    pub fn get_body(&self, path: &str) -> Bytes {
        let reply = self.get(path);
        reply.assert_status(StatusCode::OK);
        reply.body
    }

    pub fn mkcol(&self, path: &str) -> Reply {
        self.send(self.request("MKCOL", path))
    }

    #[track_caller]
    pub fn mkcol_ok(&self, path: &str) {
        self.mkcol(path).assert_status(StatusCode::CREATED);
    }

    pub fn delete(&self, path: &str) -> Reply {
        self.send(self.request("DELETE", path))
    }

    pub fn propfind(&self, path: &str, depth: &str, body: &str) -> Reply {
        self.send(
            self.request("PROPFIND", path)
                .header("depth", depth)
                .body(body.to_string()),
        )
    }

    pub fn proppatch(&self, path: &str, body: &str) -> Reply {
        self.send(self.request("PROPPATCH", path).body(body.to_string()))
    }

    pub fn lock_with(&self, path: &str, body: &str, depth: &str) -> Reply {
        self.send(
            self.request("LOCK", path)
                .header("depth", depth)
                .header("timeout", "Second-60")
                .body(body.to_string()),
        )
    }

    /// Exclusive depth-infinity lock.
    pub fn lock(&self, path: &str) -> Reply {
        self.lock_with(path, LOCKINFO_EXCLUSIVE, "infinity")
    }

    #[track_caller]
    pub fn lock_token(&self, path: &str) -> String {
        let reply = self.lock(path);
        assert!(
            reply.status.is_success(),
            "LOCK {path} failed with {}: {}",
            reply.status,
            reply.text()
        );
        reply.lock_token()
    }

    pub fn unlock(&self, path: &str, token: &str) -> Reply {
        self.send(
            self.request("UNLOCK", path)
                .header("lock-token", format!("<{token}>")),
        )
    }

    pub fn transfer(&self, method: &str, from: &str, to: &str) -> Reply {
        self.send(self.request(method, from).header("destination", to))
    }
}

/// `If` header submitting `token` for the request target.
pub fn if_token(token: &str) -> String {
    format!("(<{token}>)")
}

/// A body reader whose request is already cancelled.
pub fn cancelled_body(content: &'static [u8]) -> (RequestBody, CancelFlag) {
    let cancel = CancelFlag::new();
    cancel.cancel();
    (RequestBody::Reader(Box::new(content)), cancel)
}

/// PROPPATCH body setting one property in `urn:example:props`.
pub fn set_prop_body(local: &str, value: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example:props">
  <D:set><D:prop><Z:{local}>{value}</Z:{local}></D:prop></D:set>
</D:propertyupdate>"#
    )
}

/// Hrefs of a multistatus body, in document order.
pub fn hrefs(body: &str) -> Vec<String> {
    body.split("<D:response><D:href>")
        .skip(1)
        .filter_map(|chunk| chunk.split("</D:href>").next())
        .map(str::to_string)
        .collect()
}
