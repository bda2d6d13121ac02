//! OPTIONS, GET, HEAD and PROPFIND.

use super::{
    Dispatcher, DavMethod, DavResponse, MAX_XML_BODY, Precondition, RequestBody, RequestContext,
    ResponseBody,
};
use crate::error::{DavError, DavResult};
use crate::multistatus::MultiStatus;
use crate::path::CanonicalPath;
use crate::props::content_type;
use crate::store::{Depth, ResourceMeta};
use crate::xml;
use bytes::Bytes;
use http::header::{
    HeaderName, ACCEPT_RANGES, ALLOW, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG,
    LAST_MODIFIED,
};
use http::StatusCode;
use quick_xml::escape::escape;
use std::fmt::Write as _;
use std::io::{Read, Seek, SeekFrom};
use tracing::debug;

pub(super) fn options(
    dav: &Dispatcher,
    _ctx: &RequestContext,
    _body: RequestBody,
) -> DavResult<DavResponse> {
    Ok(DavResponse::new(StatusCode::OK)
        .with_header(HeaderName::from_static("dav"), "1, 2")
        .with_header(ALLOW, dav.allow_header())
        .with_header(HeaderName::from_static("ms-author-via"), "DAV")
        .with_header(ACCEPT_RANGES, "bytes"))
}

/// GET and HEAD.
pub(super) fn get(
    dav: &Dispatcher,
    ctx: &RequestContext,
    _body: RequestBody,
) -> DavResult<DavResponse> {
    let _guard = dav.guards.read(&ctx.path);
    let meta = dav.store.stat(&ctx.path)?;
    let precondition = dav.check_conditions(ctx, Some(&meta))?;

    let mut response = DavResponse::new(StatusCode::OK);
    response.set_header(ETAG, meta.etag.as_str());
    response.set_header(LAST_MODIFIED, httpdate::fmt_http_date(meta.modified));
    if precondition == Precondition::NotModified {
        response.status = StatusCode::NOT_MODIFIED;
        return Ok(response);
    }

    let head = ctx.method == DavMethod::Head;
    if meta.is_collection() {
        let listing = render_listing(dav, &meta)?;
        response.set_header(CONTENT_TYPE, "text/html; charset=utf-8");
        response.set_header(CONTENT_LENGTH, listing.len().to_string());
        if !head {
            response.body = ResponseBody::Bytes(Bytes::from(listing));
        }
        return Ok(response);
    }

    response.set_header(CONTENT_TYPE, content_type(&meta));
    response.set_header(ACCEPT_RANGES, "bytes");
    let range = ctx
        .header("range")
        .map(|value| parse_range(value, meta.len))
        .transpose()?
        .flatten();
    let (start, len) = match range {
        Some((start, end)) => {
            response.status = StatusCode::PARTIAL_CONTENT;
            response.set_header(CONTENT_RANGE, format!("bytes {start}-{end}/{}", meta.len));
            (start, end - start + 1)
        }
        None => (0, meta.len),
    };
    response.set_header(CONTENT_LENGTH, len.to_string());
    if head {
        return Ok(response);
    }

    let mut reader = dav.store.open_read(&ctx.path)?;
    if start > 0 {
        reader
            .seek(SeekFrom::Start(start))
            .map_err(|e| DavError::io(&ctx.path, e))?;
    }
    debug!(path = %ctx.path, start, len, "serving content");
    response.body = ResponseBody::Reader {
        reader: Box::new(reader.take(len)),
        len,
    };
    Ok(response)
}

/// Parse a `Range` header against a resource of `len` bytes.
///
/// Only a single `bytes=` range is honored. Other units and multi-range
/// requests are ignored (`None`) and the full content is served.
fn parse_range(value: &str, len: u64) -> DavResult<Option<(u64, u64)>> {
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Ok(None);
    }
    let Some((start, end)) = spec.split_once('-') else {
        return Ok(None);
    };
    let (start, end) = (start.trim(), end.trim());

    let (start, end) = if start.is_empty() {
        let Ok(suffix) = end.parse::<u64>() else {
            return Ok(None);
        };
        if suffix == 0 || len == 0 {
            return Err(DavError::RangeNotSatisfiable(len));
        }
        (len.saturating_sub(suffix), len - 1)
    } else {
        let Ok(start) = start.parse::<u64>() else {
            return Ok(None);
        };
        let end = if end.is_empty() {
            len.saturating_sub(1)
        } else {
            match end.parse::<u64>() {
                Ok(end) => end.min(len.saturating_sub(1)),
                Err(_) => return Ok(None),
            }
        };
        (start, end)
    };

    if start >= len || start > end {
        return Err(DavError::RangeNotSatisfiable(len));
    }
    Ok(Some((start, end)))
}

/// Whether `meta` appears in a listing rooted at `target`.
fn listed(dav: &Dispatcher, target: &CanonicalPath, meta: &ResourceMeta) -> bool {
    dav.config.show_hidden
        || meta.path == *target
        || !meta.path.segments()[target.depth()..]
            .iter()
            .any(|segment| segment.starts_with('.'))
}

fn render_listing(dav: &Dispatcher, meta: &ResourceMeta) -> DavResult<String> {
    let href = dav.resolver.href(&meta.path, true);
    let title = escape(href.as_str());
    let mut out = String::new();
    let _ = write!(
        out,
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Index of {title}</title></head>\n\
         <body><h1>Index of {title}</h1>\n<ul>\n"
    );
    if let Some(parent) = meta.path.parent() {
        let href = dav.resolver.href(&parent, true);
        let _ = writeln!(out, "<li><a href=\"{}\">../</a></li>", escape(href.as_str()));
    }
    for child in dav.store.list(&meta.path, Depth::One)? {
        if child.path == meta.path || !listed(dav, &meta.path, &child) {
            continue;
        }
        let name = child.path.name().unwrap_or_default();
        let suffix = if child.is_collection() { "/" } else { "" };
        let href = dav.resolver.href(&child.path, child.is_collection());
        let _ = writeln!(
            out,
            "<li><a href=\"{}\">{}{suffix}</a></li>",
            escape(href.as_str()),
            escape(name)
        );
    }
    out.push_str("</ul></body></html>\n");
    Ok(out)
}

pub(super) fn propfind(
    dav: &Dispatcher,
    ctx: &RequestContext,
    body: RequestBody,
) -> DavResult<DavResponse> {
    let depth = ctx.depth.unwrap_or(Depth::Infinity);
    if depth == Depth::Infinity && !dav.config.allow_infinite_depth {
        return Err(DavError::Forbidden(format!(
            "{}: Depth: infinity PROPFIND is disabled",
            ctx.path
        )));
    }
    let request = xml::parse_propfind(&body.read_all(MAX_XML_BODY)?)?;

    let _guard = dav.guards.read(&ctx.path);
    let meta = dav.store.stat(&ctx.path)?;
    dav.check_conditions(ctx, Some(&meta))?;

    let mut ms = MultiStatus::new();
    for entry in dav.store.list(&ctx.path, depth)? {
        if !listed(dav, &ctx.path, &entry) {
            continue;
        }
        let locks = dav.locks.discover(&entry.path);
        let props = dav.props.get_properties(&entry, &locks, &request);
        ms.push_props(entry.path.clone(), entry.is_collection(), props);
    }
    debug!(path = %ctx.path, depth = depth.as_str(), responses = ms.responses.len(), "propfind");
    Ok(DavResponse::xml(
        StatusCode::MULTI_STATUS,
        xml::render_multistatus(&ms, &dav.resolver),
    ))
}
