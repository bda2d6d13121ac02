//! Test server harness for HTTP integration tests.
//!
//! Provides a `TestServer` that runs a dispatcher over a temporary
//! directory, along with HTTP convenience methods.

#![allow(dead_code)]

use oxdav_core::{Authorizer, DavConfig, Dispatcher, LocalStore};
use oxdav_server::{ServerConfig, WebDavServer};
use reqwest::{Client, Method, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const LOCKINFO: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:lockinfo xmlns:D="DAV:">
  <D:lockscope><D:exclusive/></D:lockscope>
  <D:locktype><D:write/></D:locktype>
  <D:owner><D:href>mailto:tester@example.com</D:href></D:owner>
</D:lockinfo>"#;

/// Options for [`TestServer::start`].
#[derive(Default)]
pub struct Setup {
    pub dav: DavConfig,
    pub server: ServerConfig,
    pub authorizer: Option<Arc<dyn Authorizer>>,
}

/// Test server with HTTP client and automatic cleanup.
pub struct TestServer {
    server: WebDavServer,
    client: Client,
    pub dav: Arc<Dispatcher>,
    pub base_url: String,
    /// Store root (cleaned up on drop).
    root: TempDir,
}

impl TestServer {
    /// Start a server over a fresh temporary directory.
    pub async fn with_temp_root() -> Self {
        Self::start(Setup::default()).await
    }

    pub async fn start(setup: Setup) -> Self {
        let root = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(LocalStore::open(root.path()).expect("Failed to open store"));
        let mut dav = Dispatcher::new(store, setup.dav).expect("Failed to build dispatcher");
        if let Some(authorizer) = setup.authorizer {
            dav = dav.with_authorizer(authorizer);
        }
        let dav = Arc::new(dav);

        let server = WebDavServer::start(dav.clone(), setup.server)
            .await
            .expect("Failed to start WebDAV server");
        let base_url = server.url();

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            server,
            client,
            dav,
            base_url,
            root,
        }
    }

    /// Build a full URL from a path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn root(&self) -> &std::path::Path {
        self.root.path()
    }

    pub fn request(&self, method: &str, path: &str) -> reqwest::RequestBuilder {
        self.client.request(
            Method::from_bytes(method.as_bytes()).expect("valid method"),
            self.url(path),
        )
    }

    // ========== HTTP Convenience Methods ==========

    pub async fn get(&self, path: &str) -> Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("GET request failed")
    }

    /// GET and return the body, asserting success.
    pub async fn get_bytes(&self, path: &str) -> Vec<u8> {
        let resp = self.get(path).await;
        assert_eq!(resp.status(), StatusCode::OK, "GET {path}");
        resp.bytes().await.expect("Failed to read body").to_vec()
    }

    pub async fn put(&self, path: &str, body: impl Into<reqwest::Body>) -> Response {
        self.client
            .put(self.url(path))
            .body(body)
            .send()
            .await
            .expect("PUT request failed")
    }

    /// PUT file contents and assert success.
    pub async fn put_ok(&self, path: &str, body: impl Into<reqwest::Body>) {
        let resp = self.put(path, body).await;
        let status = resp.status();
        assert!(
            status == StatusCode::CREATED || status == StatusCode::NO_CONTENT,
            "PUT {} failed with status {}: {}",
            path,
            status,
            resp.text().await.unwrap_or_default()
        );
    }

    pub async fn delete(&self, path: &str) -> Response {
        self.client
            .delete(self.url(path))
            .send()
            .await
            .expect("DELETE request failed")
    }

    pub async fn mkcol(&self, path: &str) -> Response {
        self.request("MKCOL", path)
            .send()
            .await
            .expect("MKCOL request failed")
    }

    /// MKCOL and assert success.
    pub async fn mkcol_ok(&self, path: &str) {
        let resp = self.mkcol(path).await;
        assert_eq!(
            resp.status(),
            StatusCode::CREATED,
            "MKCOL {} failed: {}",
            path,
            resp.text().await.unwrap_or_default()
        );
    }

    /// PROPFIND with an empty body (allprop), returning status and body.
    pub async fn propfind(&self, path: &str, depth: &str) -> (StatusCode, String) {
        let resp = self
            .request("PROPFIND", path)
            .header("Depth", depth)
            .send()
            .await
            .expect("PROPFIND request failed");
        let status = resp.status();
        (status, resp.text().await.unwrap_or_default())
    }

    /// MOVE or COPY with an absolute Destination URL.
    pub async fn transfer(&self, method: &str, from: &str, to: &str) -> Response {
        self.request(method, from)
            .header("Destination", self.url(to))
            .send()
            .await
            .expect("transfer request failed")
    }

    pub async fn lock(&self, path: &str) -> Response {
        self.request("LOCK", path)
            .header("Timeout", "Second-60")
            .header("Content-Type", "application/xml")
            .body(LOCKINFO)
            .send()
            .await
            .expect("LOCK request failed")
    }

    /// LOCK and return the token from the `Lock-Token` header.
    pub async fn lock_token(&self, path: &str) -> String {
        let resp = self.lock(path).await;
        assert!(resp.status().is_success(), "LOCK {path}: {}", resp.status());
        lock_token(&resp)
    }

    pub async fn unlock(&self, path: &str, token: &str) -> Response {
        self.request("UNLOCK", path)
            .header("Lock-Token", format!("<{token}>"))
            .send()
            .await
            .expect("UNLOCK request failed")
    }

    /// Stop the server explicitly (otherwise happens on drop).
    pub async fn stop(self) {
        self.server.stop().await;
    }
}

/// Token from a LOCK response, without the angle brackets.
pub fn lock_token(resp: &Response) -> String {
    resp.headers()
        .get("lock-token")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches(|c| c == '<' || c == '>').to_string())
        .expect("LOCK response without Lock-Token header")
}

pub fn if_token(token: &str) -> String {
    format!("(<{token}>)")
}
