//! Request dispatch and shared handler helpers.
//!
//! The session hands a complete request plus the resolved virtual
//! server to `handle_request`. The common prelude applies the policy
//! bits every method shares (redirects, allowed methods); after that a
//! single `match` on the method picks the handler. Handlers only touch
//! the filesystem with non-blocking-safe calls (`stat`, buffered reads
//! of regular files) and never panic on client input.

mod get;
mod post;

use crate::http::request::Request;
use crate::http::response::{builtin_error_page, Response};
use crate::http::Method;
use crate::router::{self, Policy};
use crate::vhost::VirtualServer;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Hard ceiling for bodies served from the filesystem.
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Produce the response for a parsed request.
pub fn handle_request(request: &mut Request, server: &VirtualServer) -> Response {
    let policy = router::resolve(server, &request.path);

    if let Some(redirect) = policy.redirect {
        let mut response = Response::new(redirect.status);
        response.set_header("Location", redirect.target.clone());
        response.set_empty_body();
        return response;
    }

    if !policy.allows(request.method) {
        let mut response = error_response(405, server);
        response.set_header("Allow", policy.allow_header());
        return response;
    }

    match request.method {
        Method::Get | Method::Head => get::handle(request, &policy, server),
        Method::Post => post::handle(request, &policy, server),
        Method::Delete => {
            debug!(path = %request.path, "DELETE not implemented");
            error_response(501, server)
        }
    }
}

/// Build an error response, preferring the server's configured status
/// page over the built-in one.
pub fn error_response(status: u16, server: &VirtualServer) -> Response {
    let mut response = Response::new(status);
    let body = server
        .status_pages
        .get(&status)
        .and_then(|path| std::fs::read(path).ok())
        .unwrap_or_else(|| builtin_error_page(status).into_bytes());
    response.set_body(body, "text/html");
    response
}

/// Map the request path onto the filesystem under the effective root.
///
/// The matched location prefix is removed first, so a location
/// `/api` with root `/srv/api` maps `/api/v1/x` to `/srv/api/v1/x`.
/// Paths that climb out of the root via `..` are refused.
pub fn resolve_fs_path(policy: &Policy<'_>, request_path: &str) -> Option<PathBuf> {
    let remainder = request_path
        .strip_prefix(policy.prefix)
        .unwrap_or(request_path)
        .trim_start_matches('/');

    let relative = Path::new(remainder);
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return None;
    }
    Some(policy.root.join(relative))
}
