//! Virtual servers and the endpoint → servers map.
//!
//! Each virtual server may bind several endpoints, and several servers
//! may share one endpoint. The map groups servers by endpoint at
//! startup (one listening socket per distinct endpoint) and resolves
//! `(endpoint, Host)` to exactly one server per request: first
//! exact case-insensitive server-name match wins, `_` matches any
//! host, and the first server bound to the endpoint is the default.

use crate::net::Endpoint;
use crate::router::Location;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One configured virtual server.
#[derive(Debug, Clone)]
pub struct VirtualServer {
    /// Hostnames this server answers for; `_` is the wildcard name.
    pub server_names: Vec<String>,
    pub endpoints: Vec<Endpoint>,
    pub root: PathBuf,
    pub indexes: Vec<String>,
    pub autoindex: bool,
    pub client_max_body_size: u64,
    pub keep_alive: bool,
    /// Status code → error-page file.
    pub status_pages: BTreeMap<u16, PathBuf>,
    /// Location rules in declaration order.
    pub locations: Vec<Location>,
}

impl VirtualServer {
    /// Whether `host` (already stripped of its port) names this server.
    fn matches_host(&self, host: &str) -> bool {
        self.server_names
            .iter()
            .any(|name| name == "_" || name.eq_ignore_ascii_case(host))
    }

    #[cfg(test)]
    pub(crate) fn example() -> Self {
        Self {
            server_names: vec!["localhost".to_string()],
            endpoints: vec!["127.0.0.1:8080".parse().unwrap()],
            root: PathBuf::from("./www"),
            indexes: vec!["index.html".to_string()],
            autoindex: false,
            client_max_body_size: 1024 * 1024,
            keep_alive: true,
            status_pages: BTreeMap::new(),
            locations: Vec::new(),
        }
    }
}

/// Endpoint → virtual servers, in declaration order per endpoint.
#[derive(Debug)]
pub struct ServerMap {
    servers: Vec<VirtualServer>,
    by_endpoint: BTreeMap<Endpoint, Vec<usize>>,
}

impl ServerMap {
    pub fn new(servers: Vec<VirtualServer>) -> Self {
        let mut by_endpoint: BTreeMap<Endpoint, Vec<usize>> = BTreeMap::new();
        for (idx, server) in servers.iter().enumerate() {
            for &endpoint in &server.endpoints {
                by_endpoint.entry(endpoint).or_default().push(idx);
            }
        }
        Self {
            servers,
            by_endpoint,
        }
    }

    /// The distinct endpoints that need a listening socket.
    pub fn endpoints(&self) -> impl Iterator<Item = Endpoint> + '_ {
        self.by_endpoint.keys().copied()
    }

    /// The default (first-declared) server for an endpoint.
    pub fn default_server(&self, endpoint: Endpoint) -> Option<&VirtualServer> {
        self.by_endpoint
            .get(&endpoint)
            .and_then(|idxs| idxs.first())
            .map(|&idx| &self.servers[idx])
    }

    /// Select the server for a request accepted on `endpoint`.
    ///
    /// `host` is the raw `Host` header value; a trailing `:port` is
    /// stripped before comparison. Falls back to the endpoint's
    /// default server when nothing matches.
    pub fn resolve(&self, endpoint: Endpoint, host: Option<&str>) -> Option<&VirtualServer> {
        let candidates = self.by_endpoint.get(&endpoint)?;
        if let Some(host) = host {
            let stripped = strip_port(host);
            for &idx in candidates {
                if self.servers[idx].matches_host(stripped) {
                    return Some(&self.servers[idx]);
                }
            }
        }
        candidates.first().map(|&idx| &self.servers[idx])
    }
}

/// Drop a trailing `:port` from a `Host` header value, leaving
/// bracketed IPv6 literals intact.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        }
    } else {
        match host.rfind(':') {
            Some(colon) => &host[..colon],
            None => host,
        }
    }
}
