//! LOCK and UNLOCK.

use super::{strip_coded_url, DavResponse, Dispatcher, RequestBody, RequestContext, MAX_XML_BODY};
use crate::error::{DavError, DavResult};
use crate::lock::{parse_timeout, LockDepth, LockRequest};
use crate::store::{Depth, WriteMode};
use crate::xml;
use http::header::HeaderName;
use http::StatusCode;
use std::io;
use std::time::Duration;
use tracing::{debug, info, warn};

const LOCK_TOKEN: HeaderName = HeaderName::from_static("lock-token");

pub(super) fn lock(
    dav: &Dispatcher,
    ctx: &RequestContext,
    body: RequestBody,
) -> DavResult<DavResponse> {
    let info = xml::parse_lockinfo(&body.read_all(MAX_XML_BODY)?)?;
    let timeout = parse_timeout(
        ctx.header("timeout"),
        dav.config.default_lock_timeout,
        dav.config.max_lock_timeout,
    );

    let Some(info) = info else {
        return refresh(dav, ctx, timeout);
    };

    let depth = match ctx.depth {
        None | Some(Depth::Infinity) => LockDepth::Infinity,
        Some(Depth::Zero) => LockDepth::Zero,
        Some(Depth::One) => {
            return Err(DavError::BadRequest("LOCK with Depth: 1".to_string()));
        }
    };

    let _guard = dav.guards.write(&ctx.path);
    let existing = dav.stat_opt(&ctx.path)?;
    dav.check_conditions(ctx, existing.as_ref())?;
    if existing.is_none() {
        dav.check_membership(ctx, &ctx.path)?;
    }

    let lock = dav.locks.acquire(LockRequest {
        root: ctx.path.clone(),
        scope: info.scope,
        depth,
        owner: info.owner,
        timeout,
    })?;

    // A lock on an unmapped URL creates an empty resource.
    if existing.is_none()
        && let Err(e) = dav
            .store
            .write(&ctx.path, WriteMode::Truncate, &mut io::empty())
    {
        warn!(path = %ctx.path, error = %e, "could not create locked resource");
        if let Err(release) = dav.locks.release(&lock.token) {
            warn!(token = %lock.token, error = %release, "could not roll back lock");
        }
        return Err(e);
    }
    info!(path = %ctx.path, token = %lock.token, scope = ?lock.scope, "locked");

    let status = if existing.is_some() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok(
        DavResponse::xml(status, xml::render_lock_response(&lock, &dav.resolver))
            .with_header(LOCK_TOKEN, format!("<{}>", lock.token)),
    )
}

/// LOCK without a body: extend a lock named in the `If` header.
fn refresh(
    dav: &Dispatcher,
    ctx: &RequestContext,
    timeout: Duration,
) -> DavResult<DavResponse> {
    let _guard = dav.guards.write(&ctx.path);
    let meta = dav.store.stat(&ctx.path)?;
    dav.check_conditions(ctx, Some(&meta))?;

    let token = ctx
        .tokens
        .iter()
        .find(|token| {
            dav.locks
                .lookup(token)
                .is_some_and(|lock| lock.covers(&ctx.path))
        })
        .ok_or_else(|| {
            DavError::PreconditionFailed(format!("no lock on {} named in If header", ctx.path))
        })?;
    let lock = dav.locks.refresh(token, timeout)?;
    debug!(path = %ctx.path, token = %lock.token, ?timeout, "lock refreshed");
    Ok(DavResponse::xml(
        StatusCode::OK,
        xml::render_lock_response(&lock, &dav.resolver),
    ))
}

pub(super) fn unlock(
    dav: &Dispatcher,
    ctx: &RequestContext,
    _body: RequestBody,
) -> DavResult<DavResponse> {
    let raw = ctx
        .header("lock-token")
        .ok_or_else(|| DavError::BadRequest("UNLOCK without Lock-Token".to_string()))?;
    let token = strip_coded_url(raw)?;

    let _guard = dav.guards.write(&ctx.path);
    let lock = dav
        .locks
        .lookup(token)
        .ok_or_else(|| DavError::InvalidToken(token.to_string()))?;
    if !lock.covers(&ctx.path) {
        return Err(DavError::InvalidToken(format!(
            "{token} does not cover {}",
            ctx.path
        )));
    }
    dav.locks.release(token)?;
    info!(path = %ctx.path, token, "unlocked");
    Ok(DavResponse::new(StatusCode::NO_CONTENT))
}
