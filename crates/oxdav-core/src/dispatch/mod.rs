//! Method dispatcher.
//!
//! [`Dispatcher::handle`] turns one [`DavRequest`] into one [`DavResponse`].
//! Every request goes through the same ordered checks:
//!
//! 1. the method must be in the dispatch table (405 otherwise; read-only
//!    servers leave mutating methods out of the table)
//! 2. the request path is resolved (400 on traversal or bad encoding)
//! 3. the authorizer is consulted for the target and, for COPY/MOVE, the
//!    destination (403)
//! 4. conditional headers are evaluated against the current resource (412)
//! 5. lock-sensitive methods verify a token was submitted for every covering
//!    lock (423)
//! 6. the handler runs while holding per-resource guards
//!
//! Steps 4 to 6 happen inside the handlers, under the guards, so the state
//! a precondition was checked against cannot change before the handler acts
//! on it.

mod lock;
mod read;
mod write;

use crate::auth::{Access, AllowAll, Authorizer};
use crate::conditions::{self, IfHeader, ResourceState};
use crate::config::DavConfig;
use crate::error::{ConfigError, DavError, DavResult};
use crate::guard::ResourceGuards;
use crate::lock::LockManager;
use crate::path::{CanonicalPath, PathResolver};
use crate::props::{PropertyDb, PropertyEngine};
use crate::store::{Depth, ResourceMeta, ResourceStore};
use crate::xml;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, ALLOW, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

/// Largest XML request body accepted (PROPFIND, PROPPATCH, LOCK).
pub const MAX_XML_BODY: usize = 1024 * 1024;

pub(crate) const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";

/// Methods understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DavMethod {
    Options,
    Get,
    Head,
    Put,
    Patch,
    Delete,
    Mkcol,
    Copy,
    Move,
    Propfind,
    Proppatch,
    Lock,
    Unlock,
}

impl DavMethod {
    pub const ALL: [DavMethod; 13] = [
        DavMethod::Options,
        DavMethod::Get,
        DavMethod::Head,
        DavMethod::Put,
        DavMethod::Patch,
        DavMethod::Delete,
        DavMethod::Mkcol,
        DavMethod::Copy,
        DavMethod::Move,
        DavMethod::Propfind,
        DavMethod::Proppatch,
        DavMethod::Lock,
        DavMethod::Unlock,
    ];

    pub fn from_http(method: &Method) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == method.as_str())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DavMethod::Options => "OPTIONS",
            DavMethod::Get => "GET",
            DavMethod::Head => "HEAD",
            DavMethod::Put => "PUT",
            DavMethod::Patch => "PATCH",
            DavMethod::Delete => "DELETE",
            DavMethod::Mkcol => "MKCOL",
            DavMethod::Copy => "COPY",
            DavMethod::Move => "MOVE",
            DavMethod::Propfind => "PROPFIND",
            DavMethod::Proppatch => "PROPPATCH",
            DavMethod::Lock => "LOCK",
            DavMethod::Unlock => "UNLOCK",
        }
    }

    /// Methods that change the store, the properties or the lock table.
    pub fn is_mutating(self) -> bool {
        !matches!(
            self,
            DavMethod::Options | DavMethod::Get | DavMethod::Head | DavMethod::Propfind
        )
    }
}

impl fmt::Display for DavMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set when the client goes away. Long-running handlers poll it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Reader that fails once its request is cancelled, so a store write in
/// progress is abandoned instead of committed.
pub struct CancellableReader<R> {
    inner: R,
    cancel: CancelFlag,
}

impl<R: Read> CancellableReader<R> {
    pub fn new(inner: R, cancel: CancelFlag) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "request cancelled",
            ));
        }
        self.inner.read(buf)
    }
}

/// Request body as handed over by the transport.
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    /// Streamed body, read on the calling thread.
    Reader(Box<dyn Read + Send>),
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(b) => write!(f, "Bytes({})", b.len()),
            RequestBody::Reader(_) => f.write_str("Reader"),
        }
    }
}

impl RequestBody {
    pub fn into_reader(self) -> Box<dyn Read + Send> {
        match self {
            RequestBody::Empty => Box::new(io::empty()),
            RequestBody::Bytes(bytes) => Box::new(io::Cursor::new(bytes)),
            RequestBody::Reader(reader) => reader,
        }
    }

    /// Read the whole body, refusing more than `limit` bytes.
    pub fn read_all(self, limit: usize) -> DavResult<Bytes> {
        match self {
            RequestBody::Empty => Ok(Bytes::new()),
            RequestBody::Bytes(bytes) if bytes.len() <= limit => Ok(bytes),
            RequestBody::Bytes(_) => Err(DavError::BadRequest("request body too large".into())),
            RequestBody::Reader(reader) => {
                let mut buf = Vec::new();
                reader
                    .take(limit as u64 + 1)
                    .read_to_end(&mut buf)
                    .map_err(|e| DavError::io("request body", e))?;
                if buf.len() > limit {
                    return Err(DavError::BadRequest("request body too large".into()));
                }
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// A request as seen by the core.
#[derive(Debug)]
pub struct DavRequest {
    pub method: Method,
    /// Request target (path plus optional query), still percent-encoded.
    pub uri: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
    /// Authenticated principal, if the transport knows one.
    pub principal: Option<String>,
    pub cancel: CancelFlag,
}

impl DavRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            principal: None,
            cancel: CancelFlag::new(),
        }
    }

    /// Add a header (`name` must be lowercase). Invalid values are dropped.
    #[must_use]
    pub fn header(mut self, name: &'static str, value: impl AsRef<str>) -> Self {
        if let Ok(value) = HeaderValue::from_str(value.as_ref()) {
            self.headers
                .insert(HeaderName::from_static(name), value);
        }
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = RequestBody::Bytes(body.into());
        self
    }

    #[must_use]
    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }
}

/// Response body produced by a handler.
pub enum ResponseBody {
    Empty,
    Bytes(Bytes),
    /// Leaf content, `len` bytes long.
    Reader {
        reader: Box<dyn Read + Send>,
        len: u64,
    },
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Bytes(b) => write!(f, "Bytes({})", b.len()),
            ResponseBody::Reader { len, .. } => write!(f, "Reader({len})"),
        }
    }
}

impl ResponseBody {
    pub fn len(&self) -> u64 {
        match self {
            ResponseBody::Empty => 0,
            ResponseBody::Bytes(bytes) => bytes.len() as u64,
            ResponseBody::Reader { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the body into memory.
    pub fn into_bytes(self) -> io::Result<Bytes> {
        match self {
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Bytes(bytes) => Ok(bytes),
            ResponseBody::Reader { mut reader, len } => {
                let mut buf = Vec::with_capacity(usize::try_from(len).unwrap_or_default());
                reader.read_to_end(&mut buf)?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

#[derive(Debug)]
pub struct DavResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl DavResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        }
    }

    /// Response carrying an XML document.
    pub fn xml(status: StatusCode, body: String) -> Self {
        let mut response = Self::new(status);
        response.set_header(CONTENT_TYPE, XML_CONTENT_TYPE);
        response.body = ResponseBody::Bytes(Bytes::from(body));
        response
    }

    /// Set a header, dropping values that are not valid header text.
    pub fn set_header(&mut self, name: HeaderName, value: impl AsRef<str>) {
        match HeaderValue::from_str(value.as_ref()) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(_) => warn!(header = %name, "dropping invalid response header value"),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: impl AsRef<str>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Convert into an `http::Response`, filling in `Content-Length`.
    pub fn into_http(self) -> http::Response<ResponseBody> {
        let mut response = http::Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        if !response.headers().contains_key(CONTENT_LENGTH) {
            let len = response.body().len();
            response
                .headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from(len));
        }
        response
    }
}

/// Parsed, per-request view of the headers the handlers care about.
#[derive(Debug)]
pub struct RequestContext {
    pub method: DavMethod,
    pub path: CanonicalPath,
    pub depth: Option<Depth>,
    pub if_header: Option<IfHeader>,
    /// Lock tokens from the `If` and `Lock-Token` headers.
    pub tokens: Vec<String>,
    pub overwrite: bool,
    pub destination: Option<CanonicalPath>,
    pub principal: Option<String>,
    pub host: Option<String>,
    pub headers: HeaderMap,
    pub cancel: CancelFlag,
}

impl RequestContext {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Result of evaluating conditional headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Precondition {
    Proceed,
    /// `If-None-Match` matched on a GET or HEAD.
    NotModified,
}

type Handler = fn(&Dispatcher, &RequestContext, RequestBody) -> DavResult<DavResponse>;

/// Routes requests to method handlers over shared components.
pub struct Dispatcher {
    store: Arc<dyn ResourceStore>,
    locks: Arc<LockManager>,
    props: Arc<PropertyEngine>,
    guards: ResourceGuards,
    resolver: PathResolver,
    authorizer: Arc<dyn Authorizer>,
    config: DavConfig,
    handlers: HashMap<DavMethod, Handler>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("prefix", self.resolver.prefix())
            .field("read_only", &self.config.read_only)
            .field("methods", &self.allowed_methods())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Build a dispatcher over `store`.
    ///
    /// Fails if the configuration is inconsistent or the property database
    /// cannot be loaded.
    pub fn new(store: Arc<dyn ResourceStore>, config: DavConfig) -> Result<Self, ConfigError> {
        let resolver = config.validate()?;
        let db = match &config.property_db {
            Some(file) => PropertyDb::load(file)?,
            None => PropertyDb::in_memory(),
        };

        let mut handlers: HashMap<DavMethod, Handler> = HashMap::new();
        handlers.insert(DavMethod::Options, read::options);
        handlers.insert(DavMethod::Get, read::get);
        handlers.insert(DavMethod::Head, read::get);
        handlers.insert(DavMethod::Propfind, read::propfind);
        if !config.read_only {
            handlers.insert(DavMethod::Put, write::put);
            handlers.insert(DavMethod::Patch, write::patch);
            handlers.insert(DavMethod::Delete, write::delete);
            handlers.insert(DavMethod::Mkcol, write::mkcol);
            handlers.insert(DavMethod::Copy, write::copy);
            handlers.insert(DavMethod::Move, write::move_);
            handlers.insert(DavMethod::Proppatch, write::proppatch);
            handlers.insert(DavMethod::Lock, lock::lock);
            handlers.insert(DavMethod::Unlock, lock::unlock);
        }

        Ok(Self {
            store,
            locks: Arc::new(LockManager::new()),
            props: Arc::new(PropertyEngine::new(db)),
            guards: ResourceGuards::new(),
            resolver,
            authorizer: Arc::new(AllowAll),
            config,
            handlers,
        })
    }

    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Share a lock table (e.g. one driven by a test clock).
    #[must_use]
    pub fn with_lock_manager(mut self, locks: Arc<LockManager>) -> Self {
        self.locks = locks;
        self
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn props(&self) -> &Arc<PropertyEngine> {
        &self.props
    }

    pub fn guards(&self) -> &ResourceGuards {
        &self.guards
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn config(&self) -> &DavConfig {
        &self.config
    }

    /// Methods in the dispatch table, in a fixed order.
    pub fn allowed_methods(&self) -> Vec<DavMethod> {
        DavMethod::ALL
            .into_iter()
            .filter(|m| self.handlers.contains_key(m))
            .collect()
    }

    fn allow_header(&self) -> String {
        self.allowed_methods()
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Handle one request. Never fails: errors become error responses.
    #[instrument(level = "info", skip_all, fields(method = %request.method, uri = %request.uri))]
    pub fn handle(&self, request: DavRequest) -> DavResponse {
        let response = match self.try_handle(request) {
            Ok(response) => response,
            Err(e) => self.error_response(e),
        };
        debug!(status = response.status.as_u16(), "request complete");
        response
    }

    fn try_handle(&self, request: DavRequest) -> DavResult<DavResponse> {
        let method = DavMethod::from_http(&request.method)
            .ok_or_else(|| DavError::MethodNotAllowed(request.method.to_string()))?;
        let handler = *self
            .handlers
            .get(&method)
            .ok_or_else(|| DavError::MethodNotAllowed(method.to_string()))?;

        let DavRequest {
            uri,
            headers,
            body,
            principal,
            cancel,
            ..
        } = request;
        let ctx = self.context(method, &uri, headers, principal, cancel)?;
        self.authorize(&ctx)?;
        handler(self, &ctx, body)
    }

    fn context(
        &self,
        method: DavMethod,
        uri: &str,
        headers: HeaderMap,
        principal: Option<String>,
        cancel: CancelFlag,
    ) -> DavResult<RequestContext> {
        let path = self.resolver.resolve(uri)?;
        let text = |name: &str| -> DavResult<Option<&str>> {
            headers
                .get(name)
                .map(|v| {
                    v.to_str()
                        .map_err(|_| DavError::BadRequest(format!("non-ASCII {name} header")))
                })
                .transpose()
        };

        let depth = text("depth")?.map(Depth::parse).transpose()?;
        let if_header = text("if")?.map(IfHeader::parse).transpose()?;
        let mut tokens = if_header
            .as_ref()
            .map(IfHeader::submitted_tokens)
            .unwrap_or_default();
        if let Some(token) = text("lock-token")? {
            tokens.push(strip_coded_url(token)?.to_string());
        }
        let overwrite = match text("overwrite")?.map(str::trim) {
            None => true,
            Some(v) if v.eq_ignore_ascii_case("t") => true,
            Some(v) if v.eq_ignore_ascii_case("f") => false,
            Some(v) => return Err(DavError::BadRequest(format!("invalid Overwrite: {v}"))),
        };
        let host = text("host")?.map(str::to_string);
        let destination = text("destination")?
            .map(|raw| self.resolver.resolve_destination(raw, host.as_deref()))
            .transpose()?;

        Ok(RequestContext {
            method,
            path,
            depth,
            if_header,
            tokens,
            overwrite,
            destination,
            principal,
            host,
            headers,
            cancel,
        })
    }

    fn authorize(&self, ctx: &RequestContext) -> DavResult<()> {
        let principal = ctx.principal.as_deref();
        for path in std::iter::once(&ctx.path).chain(&ctx.destination) {
            if self.authorizer.authorize(principal, path, ctx.method) == Access::Deny {
                debug!(path = %path, principal, "authorization denied");
                return Err(DavError::Forbidden(path.to_string()));
            }
        }
        Ok(())
    }

    /// Optional metadata: `None` when the resource does not exist.
    pub(crate) fn stat_opt(&self, path: &CanonicalPath) -> DavResult<Option<ResourceMeta>> {
        match self.store.stat(path) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Evaluate `If`, `If-Match` and `If-None-Match` against `meta`.
    pub(crate) fn check_conditions(
        &self,
        ctx: &RequestContext,
        meta: Option<&ResourceMeta>,
    ) -> DavResult<Precondition> {
        if let Some(if_header) = &ctx.if_header {
            let holds = if_header.evaluate(|tag| {
                let (path, etag) = match tag {
                    None => (ctx.path.clone(), meta.map(|m| m.etag.clone())),
                    Some(uri) => {
                        let path = self.resolver.resolve_destination(uri, ctx.host.as_deref())?;
                        let etag = self.stat_opt(&path)?.map(|m| m.etag);
                        (path, etag)
                    }
                };
                let lock_tokens = self
                    .locks
                    .discover(&path)
                    .into_iter()
                    .map(|l| l.token)
                    .collect();
                Ok(ResourceState { etag, lock_tokens })
            })?;
            if !holds {
                return Err(DavError::PreconditionFailed("If header".to_string()));
            }
        }

        let etag = meta.map(|m| &m.etag);
        if let Some(header) = ctx.header("if-match")
            && !conditions::if_match(header, etag)
        {
            return Err(DavError::PreconditionFailed("If-Match".to_string()));
        }
        if let Some(header) = ctx.header("if-none-match")
            && !conditions::if_none_match(header, etag)
        {
            if matches!(ctx.method, DavMethod::Get | DavMethod::Head) {
                return Ok(Precondition::NotModified);
            }
            return Err(DavError::PreconditionFailed("If-None-Match".to_string()));
        }
        Ok(Precondition::Proceed)
    }

    /// Verify tokens for locks on `path` (and below it when `deep`).
    pub(crate) fn check_locks(
        &self,
        ctx: &RequestContext,
        path: &CanonicalPath,
        deep: bool,
    ) -> DavResult<()> {
        self.locks.check(path, deep, &ctx.tokens)
    }

    /// Verify tokens for adding or removing `path` as a member of its parent.
    pub(crate) fn check_membership(
        &self,
        ctx: &RequestContext,
        path: &CanonicalPath,
    ) -> DavResult<()> {
        match path.parent() {
            Some(parent) => self.locks.check(&parent, false, &ctx.tokens),
            None => Ok(()),
        }
    }

    fn error_response(&self, err: DavError) -> DavResponse {
        let status = err.status();
        match &err {
            DavError::IoFailure { .. } => error!(error = %err, "store failure"),
            _ if status.is_server_error() => error!(error = %err, "request failed"),
            _ => debug!(error = %err, status = status.as_u16(), "request refused"),
        }

        match err {
            DavError::Locked(root) => {
                let hrefs: Vec<String> = root
                    .parse::<CanonicalPath>()
                    .map(|p| vec![self.resolver.href(&p, false)])
                    .unwrap_or_default();
                DavResponse::xml(status, xml::render_error("lock-token-submitted", &hrefs))
            }
            DavError::MethodNotAllowed(_) => {
                DavResponse::new(status).with_header(ALLOW, self.allow_header())
            }
            DavError::RangeNotSatisfiable(len) => DavResponse::new(status)
                .with_header(http::header::CONTENT_RANGE, format!("bytes */{len}")),
            _ => DavResponse::new(status),
        }
    }
}

/// Strip the angle brackets of a Coded-URL (`<opaquelocktoken:...>`).
fn strip_coded_url(raw: &str) -> DavResult<&str> {
    raw.trim()
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DavError::BadRequest(format!("malformed lock token {raw}")))
}

/// Status for one failed entry of a batch operation.
pub(crate) fn batch_status(err: &DavError) -> StatusCode {
    match err {
        DavError::Conflict(_) => StatusCode::CONFLICT,
        DavError::Locked(_) => StatusCode::LOCKED,
        other => other.status(),
    }
}
