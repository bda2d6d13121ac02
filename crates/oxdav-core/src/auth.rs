//! Authorization collaborator.
//!
//! The core never authenticates anyone. The transport hands it an optional
//! principal and an [`Authorizer`] decides, per resource and method, whether
//! the request may proceed. Denials become `403 Forbidden`.

use crate::dispatch::DavMethod;
use crate::path::CanonicalPath;

/// Outcome of an authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny,
}

/// Decides whether `principal` may apply `method` to `path`.
///
/// Closures with the matching signature implement this trait.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, principal: Option<&str>, path: &CanonicalPath, method: DavMethod)
    -> Access;
}

/// Allows every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _: Option<&str>, _: &CanonicalPath, _: DavMethod) -> Access {
        Access::Allow
    }
}

impl<F> Authorizer for F
where
    F: Fn(Option<&str>, &CanonicalPath, DavMethod) -> Access + Send + Sync,
{
    fn authorize(
        &self,
        principal: Option<&str>,
        path: &CanonicalPath,
        method: DavMethod,
    ) -> Access {
        self(principal, path, method)
    }
}
