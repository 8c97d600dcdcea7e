//! Location rules and effective request policy.
//!
//! A location is a path-prefix-scoped bundle of overrides inside a
//! virtual server. Every field is optional; `None` means "not set
//! here", so merging with the enclosing server is unambiguous. The
//! resolver picks the longest matching prefix (earliest declaration
//! wins ties) and folds the two layers into one `Policy` the method
//! handlers consume.

use crate::http::Method;
use crate::vhost::VirtualServer;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Configured redirect: answer `status` with `Location: target`.
#[derive(Debug, Clone)]
pub struct Redirect {
    pub status: u16,
    pub target: String,
}

/// One `location` block of a virtual server.
#[derive(Debug, Clone, Default)]
pub struct Location {
    pub path_prefix: String,
    pub root: Option<PathBuf>,
    pub allowed_methods: Option<BTreeSet<Method>>,
    pub redirect: Option<Redirect>,
    pub autoindex: Option<bool>,
    pub indexes: Option<Vec<String>>,
    pub upload_path: Option<PathBuf>,
    pub cgi_path: Option<PathBuf>,
}

impl Location {
    pub fn new(path_prefix: impl Into<String>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            ..Default::default()
        }
    }
}

/// The merged per-request view of server defaults and the matched
/// location's overrides.
#[derive(Debug)]
pub struct Policy<'a> {
    /// Matched location prefix; empty when no location matched.
    pub prefix: &'a str,
    pub root: &'a Path,
    pub allowed_methods: BTreeSet<Method>,
    pub redirect: Option<&'a Redirect>,
    pub autoindex: bool,
    pub indexes: &'a [String],
    pub upload_path: Option<&'a Path>,
    pub cgi_path: Option<&'a Path>,
}

impl<'a> Policy<'a> {
    pub fn allows(&self, method: Method) -> bool {
        self.allowed_methods.contains(&method)
    }

    /// `Allow:` header value listing the permitted methods.
    pub fn allow_header(&self) -> String {
        let names: Vec<&str> = self.allowed_methods.iter().map(Method::as_str).collect();
        names.join(", ")
    }
}

/// Methods permitted when a location sets none.
fn default_methods() -> BTreeSet<Method> {
    BTreeSet::from([Method::Get, Method::Head])
}

/// Longest-prefix match of `path` against the server's locations.
///
/// Ties are broken by declaration order; when nothing matches the
/// server's own defaults apply.
pub fn resolve<'a>(server: &'a VirtualServer, path: &str) -> Policy<'a> {
    let mut best: Option<&Location> = None;
    for location in &server.locations {
        if !path.starts_with(&location.path_prefix) {
            continue;
        }
        match best {
            Some(current) if location.path_prefix.len() <= current.path_prefix.len() => {}
            _ => best = Some(location),
        }
    }

    match best {
        Some(location) => Policy {
            prefix: &location.path_prefix,
            root: location.root.as_deref().unwrap_or(&server.root),
            allowed_methods: location
                .allowed_methods
                .clone()
                .unwrap_or_else(default_methods),
            redirect: location.redirect.as_ref(),
            autoindex: location.autoindex.unwrap_or(server.autoindex),
            indexes: location
                .indexes
                .as_deref()
                .unwrap_or(&server.indexes),
            upload_path: location.upload_path.as_deref(),
            cgi_path: location.cgi_path.as_deref(),
        },
        None => Policy {
            prefix: "",
            root: &server.root,
            allowed_methods: default_methods(),
            redirect: None,
            autoindex: server.autoindex,
            indexes: &server.indexes,
            upload_path: None,
            cgi_path: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vhost::VirtualServer;

    fn server_with(locations: Vec<Location>) -> VirtualServer {
        let mut server = VirtualServer::example();
        server.locations = locations;
        server
    }

    #[test]
    fn test_longest_prefix_wins() {
        let server = server_with(vec![
            Location::new("/"),
            Location::new("/api"),
            Location::new("/api/v1"),
        ]);

        assert_eq!(resolve(&server, "/api/v1/x").prefix, "/api/v1");
        assert_eq!(resolve(&server, "/api/x").prefix, "/api");
        assert_eq!(resolve(&server, "/other").prefix, "/");
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let mut first = Location::new("/a");
        first.autoindex = Some(true);
        let mut second = Location::new("/a");
        second.autoindex = Some(false);

        let server = server_with(vec![first, second]);
        assert!(resolve(&server, "/a/x").autoindex);
    }

    #[test]
    fn test_no_match_uses_server_defaults() {
        let mut server = server_with(vec![Location::new("/api")]);
        server.autoindex = true;

        let policy = resolve(&server, "/elsewhere");
        assert_eq!(policy.prefix, "");
        assert!(policy.autoindex);
        assert_eq!(policy.root, server.root.as_path());
        assert_eq!(policy.allowed_methods, BTreeSet::from([Method::Get, Method::Head]));
    }

    #[test]
    fn test_unset_methods_default_to_get_head() {
        let server = server_with(vec![Location::new("/")]);
        let policy = resolve(&server, "/x");
        assert!(policy.allows(Method::Get));
        assert!(policy.allows(Method::Head));
        assert!(!policy.allows(Method::Post));
        assert!(!policy.allows(Method::Delete));
    }

    #[test]
    fn test_location_overrides_win() {
        let mut location = Location::new("/files");
        location.autoindex = Some(true);
        location.root = Some(PathBuf::from("/srv/files"));
        location.allowed_methods = Some(BTreeSet::from([Method::Post]));
        location.indexes = Some(vec!["main.html".to_string()]);

        let mut server = server_with(vec![location]);
        server.autoindex = false;

        let policy = resolve(&server, "/files/a");
        assert!(policy.autoindex);
        assert_eq!(policy.root, Path::new("/srv/files"));
        assert!(policy.allows(Method::Post));
        assert!(!policy.allows(Method::Get));
        assert_eq!(policy.indexes, ["main.html".to_string()]);
    }

    #[test]
    fn test_allow_header_lists_methods() {
        let mut location = Location::new("/");
        location.allowed_methods = Some(BTreeSet::from([Method::Get, Method::Post]));
        let server = server_with(vec![location]);

        let policy = resolve(&server, "/");
        assert_eq!(policy.allow_header(), "GET, POST");
    }
}
