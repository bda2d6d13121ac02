//! Handlers that change the tree or its properties.

use super::{
    batch_status, CancellableReader, DavMethod, DavResponse, Dispatcher, RequestBody,
    RequestContext, MAX_XML_BODY,
};
use crate::error::{DavError, DavResult};
use crate::guard::GuardMode;
use crate::multistatus::MultiStatus;
use crate::store::{BatchFailures, Depth, WriteMode};
use crate::xml;
use http::header::ETAG;
use http::StatusCode;
use tracing::{debug, info, warn};

fn created_or_replaced(created: bool) -> StatusCode {
    if created {
        StatusCode::CREATED
    } else {
        StatusCode::NO_CONTENT
    }
}

/// 207 listing the entries a batch operation could not handle.
fn batch_response(dav: &Dispatcher, failures: &BatchFailures) -> DavResponse {
    let mut ms = MultiStatus::new();
    for (path, err) in failures {
        warn!(path = %path, error = %err, "batch entry failed");
        ms.push_status(path.clone(), false, batch_status(err));
    }
    DavResponse::xml(
        StatusCode::MULTI_STATUS,
        xml::render_multistatus(&ms, &dav.resolver),
    )
}

fn store_content(
    dav: &Dispatcher,
    ctx: &RequestContext,
    body: RequestBody,
    mode: WriteMode,
) -> DavResult<DavResponse> {
    let _guard = dav.guards.write(&ctx.path);
    let existing = dav.stat_opt(&ctx.path)?;
    if existing.as_ref().is_some_and(|m| m.is_collection()) {
        return Err(DavError::MethodNotAllowed(format!(
            "{} on collection {}",
            ctx.method, ctx.path
        )));
    }
    dav.check_conditions(ctx, existing.as_ref())?;
    dav.check_locks(ctx, &ctx.path, false)?;
    if existing.is_none() {
        dav.check_membership(ctx, &ctx.path)?;
    }

    let mut reader = CancellableReader::new(body.into_reader(), ctx.cancel.clone());
    let meta = dav.store.write(&ctx.path, mode, &mut reader)?;
    debug!(path = %ctx.path, len = meta.len, ?mode, "content stored");

    Ok(DavResponse::new(created_or_replaced(existing.is_none()))
        .with_header(ETAG, meta.etag.as_str()))
}

pub(super) fn put(
    dav: &Dispatcher,
    ctx: &RequestContext,
    body: RequestBody,
) -> DavResult<DavResponse> {
    if ctx.header("content-range").is_some() {
        return Err(DavError::BadRequest(
            "Content-Range on PUT is not supported".to_string(),
        ));
    }
    store_content(dav, ctx, body, WriteMode::Truncate)
}

/// Append the body to a leaf (`X-Update-Range: append`).
pub(super) fn patch(
    dav: &Dispatcher,
    ctx: &RequestContext,
    body: RequestBody,
) -> DavResult<DavResponse> {
    match ctx.header("x-update-range") {
        Some(value) if value.trim().eq_ignore_ascii_case("append") => {
            store_content(dav, ctx, body, WriteMode::Append)
        }
        _ => Err(DavError::BadRequest(
            "PATCH requires X-Update-Range: append".to_string(),
        )),
    }
}

pub(super) fn delete(
    dav: &Dispatcher,
    ctx: &RequestContext,
    _body: RequestBody,
) -> DavResult<DavResponse> {
    if !matches!(ctx.depth, None | Some(Depth::Infinity)) {
        return Err(DavError::BadRequest(
            "DELETE requires Depth: infinity".to_string(),
        ));
    }
    if ctx.path.is_root() {
        return Err(DavError::Forbidden("cannot delete the root".to_string()));
    }

    let _guard = dav.guards.write(&ctx.path);
    let meta = dav.store.stat(&ctx.path)?;
    dav.check_conditions(ctx, Some(&meta))?;
    dav.check_locks(ctx, &ctx.path, true)?;
    dav.check_membership(ctx, &ctx.path)?;

    let failures = dav.store.delete(&ctx.path, true)?;
    if !failures.is_empty() {
        return Ok(batch_response(dav, &failures));
    }
    dav.locks.remove_tree(&ctx.path);
    dav.props.on_delete(&ctx.path)?;
    info!(path = %ctx.path, collection = meta.is_collection(), "deleted");
    Ok(DavResponse::new(StatusCode::NO_CONTENT))
}

pub(super) fn mkcol(
    dav: &Dispatcher,
    ctx: &RequestContext,
    body: RequestBody,
) -> DavResult<DavResponse> {
    if !body.read_all(MAX_XML_BODY)?.is_empty() {
        return Err(DavError::UnsupportedMediaType);
    }

    let _guard = dav.guards.write(&ctx.path);
    if dav.store.exists(&ctx.path)? {
        return Err(DavError::AlreadyExists(ctx.path.to_string()));
    }
    dav.check_conditions(ctx, None)?;
    dav.check_locks(ctx, &ctx.path, false)?;
    dav.check_membership(ctx, &ctx.path)?;

    dav.store.create_collection(&ctx.path)?;
    debug!(path = %ctx.path, "collection created");
    Ok(DavResponse::new(StatusCode::CREATED))
}

pub(super) fn copy(
    dav: &Dispatcher,
    ctx: &RequestContext,
    _body: RequestBody,
) -> DavResult<DavResponse> {
    transfer(dav, ctx)
}

pub(super) fn move_(
    dav: &Dispatcher,
    ctx: &RequestContext,
    _body: RequestBody,
) -> DavResult<DavResponse> {
    transfer(dav, ctx)
}

/// COPY and MOVE.
fn transfer(dav: &Dispatcher, ctx: &RequestContext) -> DavResult<DavResponse> {
    let moving = ctx.method == DavMethod::Move;
    let src = &ctx.path;
    let dest = ctx
        .destination
        .as_ref()
        .ok_or_else(|| DavError::BadRequest(format!("{} without Destination", ctx.method)))?;
    let depth = match (ctx.depth, moving) {
        (None | Some(Depth::Infinity), _) => Depth::Infinity,
        (Some(Depth::Zero), false) => Depth::Zero,
        (Some(depth), _) => {
            return Err(DavError::BadRequest(format!(
                "Depth: {} not allowed on {}",
                depth.as_str(),
                ctx.method
            )));
        }
    };
    if src == dest {
        return Err(DavError::Forbidden(format!(
            "source and destination are both {src}"
        )));
    }
    if src.contains(dest) || dest.contains(src) {
        return Err(DavError::Conflict(format!("{src} and {dest} overlap")));
    }

    let src_mode = if moving {
        GuardMode::Write
    } else {
        GuardMode::Read
    };
    let _guard = dav
        .guards
        .acquire(vec![(src.clone(), src_mode), (dest.clone(), GuardMode::Write)]);

    let src_meta = dav.store.stat(src)?;
    dav.check_conditions(ctx, Some(&src_meta))?;
    let replaced = dav.store.exists(dest)?;
    if replaced && !ctx.overwrite {
        return Err(DavError::PreconditionFailed(format!(
            "{dest} exists and Overwrite is F"
        )));
    }
    if moving {
        dav.check_locks(ctx, src, true)?;
        dav.check_membership(ctx, src)?;
    }
    dav.check_locks(ctx, dest, true)?;
    dav.check_membership(ctx, dest)?;

    let occupied = |e: DavError| match e {
        DavError::AlreadyExists(path) => DavError::PreconditionFailed(path),
        other => other,
    };
    let status = created_or_replaced(!replaced);
    if moving {
        dav.store
            .move_resource(src, dest, ctx.overwrite)
            .map_err(occupied)?;
        dav.locks.remove_tree(src);
        dav.props.on_move(src, dest)?;
        info!(from = %src, to = %dest, "moved");
        return Ok(DavResponse::new(status));
    }

    let failures = dav
        .store
        .copy(src, dest, ctx.overwrite, depth)
        .map_err(occupied)?;
    dav.props.on_copy(src, dest, depth == Depth::Infinity)?;
    if !failures.is_empty() {
        return Ok(batch_response(dav, &failures));
    }
    info!(from = %src, to = %dest, depth = depth.as_str(), "copied");
    Ok(DavResponse::new(status))
}

pub(super) fn proppatch(
    dav: &Dispatcher,
    ctx: &RequestContext,
    body: RequestBody,
) -> DavResult<DavResponse> {
    let patches = xml::parse_propertyupdate(&body.read_all(MAX_XML_BODY)?)?;

    let _guard = dav.guards.write(&ctx.path);
    let meta = dav.store.stat(&ctx.path)?;
    dav.check_conditions(ctx, Some(&meta))?;
    dav.check_locks(ctx, &ctx.path, false)?;

    let results = dav.props.set_properties(&ctx.path, &patches);
    let mut ms = MultiStatus::new();
    ms.push_patch_results(ctx.path.clone(), meta.is_collection(), results);
    Ok(DavResponse::xml(
        StatusCode::MULTI_STATUS,
        xml::render_multistatus(&ms, &dav.resolver),
    ))
}
