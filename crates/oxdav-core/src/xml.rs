//! WebDAV XML bodies.
//!
//! Requests are parsed with a namespace-aware reader into a small element
//! tree ([`Element`]); responses are written directly as text. Dead property
//! values and lock owners are stored as self-contained fragments: every
//! top-level element carries its own `xmlns` declaration, so a fragment can
//! be dropped into any response verbatim.

use crate::error::{DavError, DavResult};
use crate::lock::{ActiveLock, LockDepth, LockScope};
use crate::multistatus::{MultiStatus, ResponseOutcome};
use crate::path::PathResolver;
use crate::props::{PropName, PropPatch, PropRequest, PropValue, DAV_NS};
use http::StatusCode;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;
use std::fmt::Write as _;

const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n";
const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Deepest element nesting accepted in a request body.
pub const MAX_DEPTH: usize = 256;

/// Parsed XML element with resolved namespaces.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub namespace: String,
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub namespace: String,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }

    /// Child elements, skipping text.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    pub fn child(&self, namespace: &str, name: &str) -> Option<&Element> {
        self.elements().find(|el| el.is(namespace, name))
    }

    /// Concatenated character data of direct children, trimmed.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(text) = node {
                out.push_str(text);
            }
        }
        out.trim().to_string()
    }
}

fn malformed(reason: impl std::fmt::Display) -> DavError {
    DavError::BadRequest(format!("malformed XML body: {reason}"))
}

fn utf8(bytes: &[u8]) -> DavResult<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(malformed)
}

fn namespace_uri(resolved: ResolveResult<'_>) -> DavResult<String> {
    match resolved {
        ResolveResult::Bound(Namespace(uri)) => utf8(uri),
        ResolveResult::Unbound => Ok(String::new()),
        ResolveResult::Unknown(prefix) => Err(malformed(format!(
            "undeclared prefix {}",
            String::from_utf8_lossy(&prefix)
        ))),
    }
}

fn open_element(
    reader: &NsReader<&[u8]>,
    namespace: String,
    start: &BytesStart<'_>,
) -> DavResult<Element> {
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(malformed)?;
        if attr.key.as_namespace_binding().is_some() {
            continue;
        }
        let (resolved, local) = reader.resolve_attribute(attr.key);
        let namespace = match resolved {
            ResolveResult::Bound(Namespace(uri)) => utf8(uri)?,
            _ => String::new(),
        };
        attributes.push(Attribute {
            namespace,
            name: utf8(local.as_ref())?,
            value: attr.unescape_value().map_err(malformed)?.into_owned(),
        });
    }
    Ok(Element {
        namespace,
        name: utf8(start.local_name().as_ref())?,
        attributes,
        children: Vec::new(),
    })
}

/// Attach a finished element to its parent, or return it if it is the root.
fn close(stack: &mut [Element], element: Element) -> Option<Element> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Element(element));
            None
        }
        None => Some(element),
    }
}

/// Parse a whole document into its root element. Elements nested more than
/// [`MAX_DEPTH`] deep are rejected.
pub fn parse_document(body: &[u8]) -> DavResult<Element> {
    let mut reader = NsReader::from_reader(body);
    let mut stack: Vec<Element> = Vec::new();
    loop {
        let (resolved, event) = reader.read_resolved_event().map_err(malformed)?;
        let namespace = namespace_uri(resolved)?;
        if matches!(event, Event::Start(_) | Event::Empty(_)) && stack.len() >= MAX_DEPTH {
            return Err(DavError::BadRequest(format!(
                "XML body nested deeper than {MAX_DEPTH} elements"
            )));
        }
        match event {
            Event::Start(start) => stack.push(open_element(&reader, namespace, &start)?),
            Event::Empty(start) => {
                let element = open_element(&reader, namespace, &start)?;
                if let Some(root) = close(&mut stack, element) {
                    return Ok(root);
                }
            }
            Event::End(_) => {
                let element = stack.pop().ok_or_else(|| malformed("unbalanced end tag"))?;
                if let Some(root) = close(&mut stack, element) {
                    return Ok(root);
                }
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(malformed)?;
                match stack.last_mut() {
                    Some(top) => top.children.push(Node::Text(text.into_owned())),
                    None if text.trim().is_empty() => {}
                    None => return Err(malformed("text outside the root element")),
                }
            }
            Event::CData(data) => {
                let text = utf8(&data.into_inner())?;
                if let Some(top) = stack.last_mut() {
                    top.children.push(Node::Text(text));
                }
            }
            Event::Eof => return Err(malformed("unexpected end of document")),
            _ => {}
        }
    }
}

/// Serialize the content of `element` (not the element itself) as a
/// self-contained fragment.
pub fn serialize_content(element: &Element) -> String {
    let mut out = String::new();
    for node in &element.children {
        write_node(&mut out, node, None);
    }
    out
}

fn write_node(out: &mut String, node: &Node, inherited: Option<&str>) {
    match node {
        Node::Text(text) => out.push_str(&escape(text.as_str())),
        Node::Element(el) => {
            out.push('<');
            out.push_str(&el.name);
            if inherited != Some(el.namespace.as_str()) {
                let _ = write!(out, " xmlns=\"{}\"", escape(el.namespace.as_str()));
            }
            for (i, attr) in el.attributes.iter().enumerate() {
                let value = escape(attr.value.as_str());
                if attr.namespace.is_empty() {
                    let _ = write!(out, " {}=\"{value}\"", attr.name);
                } else if attr.namespace == XML_NS {
                    let _ = write!(out, " xml:{}=\"{value}\"", attr.name);
                } else {
                    let _ = write!(
                        out,
                        " xmlns:a{i}=\"{}\" a{i}:{}=\"{value}\"",
                        escape(attr.namespace.as_str()),
                        attr.name
                    );
                }
            }
            if el.children.is_empty() {
                out.push_str("/>");
            } else {
                out.push('>');
                for child in &el.children {
                    write_node(out, child, Some(&el.namespace));
                }
                let _ = write!(out, "</{}>", el.name);
            }
        }
    }
}

fn is_blank(body: &[u8]) -> bool {
    body.iter().all(u8::is_ascii_whitespace)
}

fn prop_names(prop: &Element) -> DavResult<Vec<PropName>> {
    prop.elements()
        .map(|el| PropName::new(el.namespace.clone(), el.name.clone()))
        .collect()
}

/// Parse a PROPFIND body. An empty body means `allprop`.
pub fn parse_propfind(body: &[u8]) -> DavResult<PropRequest> {
    if is_blank(body) {
        return Ok(PropRequest::AllProp {
            include: Vec::new(),
        });
    }
    let root = parse_document(body)?;
    if !root.is(DAV_NS, "propfind") {
        return Err(DavError::BadRequest(format!(
            "expected DAV:propfind, got {}",
            root.name
        )));
    }

    let mut request = None;
    let mut include = Vec::new();
    for child in root.elements().filter(|el| el.namespace == DAV_NS) {
        match child.name.as_str() {
            "allprop" => {
                request = Some(PropRequest::AllProp {
                    include: Vec::new(),
                });
            }
            "propname" => request = Some(PropRequest::PropName),
            "prop" => request = Some(PropRequest::Named(prop_names(child)?)),
            "include" => include = prop_names(child)?,
            _ => {}
        }
    }
    match request {
        Some(PropRequest::AllProp { .. }) => Ok(PropRequest::AllProp { include }),
        Some(request) => Ok(request),
        None => Err(DavError::BadRequest(
            "propfind names neither allprop, propname nor prop".to_string(),
        )),
    }
}

/// Parse a PROPPATCH body into instructions, in document order.
pub fn parse_propertyupdate(body: &[u8]) -> DavResult<Vec<PropPatch>> {
    let root = parse_document(body)?;
    if !root.is(DAV_NS, "propertyupdate") {
        return Err(DavError::BadRequest(format!(
            "expected DAV:propertyupdate, got {}",
            root.name
        )));
    }
    let mut patches = Vec::new();
    for action in root.elements() {
        let set = if action.is(DAV_NS, "set") {
            true
        } else if action.is(DAV_NS, "remove") {
            false
        } else {
            continue;
        };
        for prop in action.elements().filter(|el| el.is(DAV_NS, "prop")) {
            for el in prop.elements() {
                let name = PropName::new(el.namespace.clone(), el.name.clone())?;
                patches.push(if set {
                    PropPatch::Set(name, serialize_content(el))
                } else {
                    PropPatch::Remove(name)
                });
            }
        }
    }
    if patches.is_empty() {
        return Err(DavError::BadRequest("empty propertyupdate".to_string()));
    }
    Ok(patches)
}

/// Body of a LOCK request that creates a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub scope: LockScope,
    /// Owner fragment, echoed back verbatim.
    pub owner: Option<String>,
}

/// Parse a LOCK body. An empty body is a refresh (`None`).
pub fn parse_lockinfo(body: &[u8]) -> DavResult<Option<LockInfo>> {
    if is_blank(body) {
        return Ok(None);
    }
    let root = parse_document(body)?;
    if !root.is(DAV_NS, "lockinfo") {
        return Err(DavError::BadRequest(format!(
            "expected DAV:lockinfo, got {}",
            root.name
        )));
    }
    let scope = root
        .child(DAV_NS, "lockscope")
        .and_then(|scope| scope.elements().next())
        .and_then(|el| match (el.namespace.as_str(), el.name.as_str()) {
            (DAV_NS, "exclusive") => Some(LockScope::Exclusive),
            (DAV_NS, "shared") => Some(LockScope::Shared),
            _ => None,
        })
        .ok_or_else(|| DavError::BadRequest("lockinfo without a valid lockscope".to_string()))?;
    let write_lock = root
        .child(DAV_NS, "locktype")
        .is_some_and(|locktype| locktype.child(DAV_NS, "write").is_some());
    if !write_lock {
        return Err(DavError::BadRequest("only write locks are supported".to_string()));
    }
    let owner = root
        .child(DAV_NS, "owner")
        .map(serialize_content)
        .filter(|owner| !owner.trim().is_empty());
    Ok(Some(LockInfo { scope, owner }))
}

fn status_line(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    )
}

/// Render a `207 Multi-Status` body.
pub fn render_multistatus(ms: &MultiStatus, resolver: &PathResolver) -> String {
    let mut out = String::from(XML_DECL);
    out.push_str("<D:multistatus xmlns:D=\"DAV:\">\n");
    for response in &ms.responses {
        let href = resolver.href(&response.path, response.collection);
        let _ = write!(out, "<D:response><D:href>{}</D:href>", escape(href.as_str()));
        match &response.outcome {
            ResponseOutcome::Status(status) => {
                let _ = write!(out, "<D:status>{}</D:status>", status_line(*status));
            }
            ResponseOutcome::PropStats(stats) => {
                for stat in stats {
                    out.push_str("<D:propstat><D:prop>");
                    for (name, value) in &stat.props {
                        write_prop(&mut out, name, value, resolver);
                    }
                    let _ = write!(
                        out,
                        "</D:prop><D:status>{}</D:status></D:propstat>",
                        status_line(stat.status)
                    );
                }
            }
        }
        out.push_str("</D:response>\n");
    }
    out.push_str("</D:multistatus>\n");
    out
}

fn write_prop(out: &mut String, name: &PropName, value: &PropValue, resolver: &PathResolver) {
    let tag = if name.is_dav() {
        format!("D:{}", name.local())
    } else {
        name.local().to_string()
    };
    out.push('<');
    out.push_str(&tag);
    if !name.is_dav() {
        let _ = write!(out, " xmlns=\"{}\"", escape(name.namespace()));
    }
    match value {
        PropValue::Empty | PropValue::ResourceType { collection: false } => {
            out.push_str("/>");
            return;
        }
        PropValue::Text(text) => {
            out.push('>');
            out.push_str(&escape(text.as_str()));
        }
        PropValue::Xml(fragment) => {
            out.push('>');
            out.push_str(fragment);
        }
        PropValue::ResourceType { collection: true } => out.push_str("><D:collection/>"),
        PropValue::LockDiscovery(locks) => {
            out.push('>');
            for lock in locks {
                write_activelock(out, lock, resolver);
            }
        }
        PropValue::SupportedLock => {
            out.push('>');
            for scope in ["exclusive", "shared"] {
                let _ = write!(
                    out,
                    "<D:lockentry><D:lockscope><D:{scope}/></D:lockscope>\
                     <D:locktype><D:write/></D:locktype></D:lockentry>"
                );
            }
        }
    }
    let _ = write!(out, "</{tag}>");
}

fn write_activelock(out: &mut String, lock: &ActiveLock, resolver: &PathResolver) {
    let scope = match lock.scope {
        LockScope::Exclusive => "exclusive",
        LockScope::Shared => "shared",
    };
    let depth = match lock.depth {
        LockDepth::Zero => "0",
        LockDepth::Infinity => "infinity",
    };
    let _ = write!(
        out,
        "<D:activelock><D:locktype><D:write/></D:locktype>\
         <D:lockscope><D:{scope}/></D:lockscope><D:depth>{depth}</D:depth>"
    );
    if let Some(owner) = &lock.owner {
        let _ = write!(out, "<D:owner>{owner}</D:owner>");
    }
    let _ = write!(
        out,
        "<D:timeout>Second-{}</D:timeout>\
         <D:locktoken><D:href>{}</D:href></D:locktoken>\
         <D:lockroot><D:href>{}</D:href></D:lockroot></D:activelock>",
        lock.timeout.as_secs(),
        escape(lock.token.as_str()),
        escape(resolver.href(&lock.root, false).as_str())
    );
}

/// Body of a successful LOCK: the lock discovery of the granted lock.
pub fn render_lock_response(lock: &ActiveLock, resolver: &PathResolver) -> String {
    let mut out = String::from(XML_DECL);
    out.push_str("<D:prop xmlns:D=\"DAV:\"><D:lockdiscovery>");
    write_activelock(&mut out, lock, resolver);
    out.push_str("</D:lockdiscovery></D:prop>\n");
    out
}

/// `<D:error>` body naming a failed precondition, e.g. `lock-token-submitted`.
pub fn render_error(condition: &str, hrefs: &[String]) -> String {
    let mut out = String::from(XML_DECL);
    let _ = write!(out, "<D:error xmlns:D=\"DAV:\"><D:{condition}>");
    for href in hrefs {
        let _ = write!(out, "<D:href>{}</D:href>", escape(href.as_str()));
    }
    let _ = writeln!(out, "</D:{condition}></D:error>");
    out
}
