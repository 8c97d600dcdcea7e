//! Configuration loading for the server.
//!
//! The CLI takes a single positional argument, the path to a TOML
//! configuration file. The file is deserialized with serde and then
//! validated into the in-memory virtual-server structures the rest of
//! the server consumes; nothing downstream ever re-parses strings.

use crate::http::Method;
use crate::net::Endpoint;
use crate::router::{Location, Redirect};
use crate::vhost::VirtualServer;
use clap::Parser;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "hearth")]
#[command(version = "0.1.0")]
#[command(about = "A multi-virtual-host HTTP/1.1 origin server", long_about = None)]
pub struct CliArgs {
    /// Path to the TOML configuration file
    pub config: PathBuf,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: Option<String>,
    #[serde(default, rename = "server")]
    pub servers: Vec<TomlServer>,
}

#[derive(Debug, Deserialize)]
pub struct TomlServer {
    pub server_names: Option<Vec<String>>,
    /// Endpoints to bind, as `address:port` literals.
    pub listen: Vec<String>,
    pub root: Option<PathBuf>,
    pub index: Option<Vec<String>>,
    pub autoindex: Option<bool>,
    pub client_max_body_size: Option<u64>,
    pub keep_alive: Option<bool>,
    /// Status code → error page file. TOML table keys are strings.
    #[serde(default)]
    pub status_pages: BTreeMap<String, PathBuf>,
    #[serde(default, rename = "location")]
    pub locations: Vec<TomlLocation>,
}

#[derive(Debug, Deserialize)]
pub struct TomlLocation {
    /// Path prefix this location applies to.
    pub path: String,
    pub root: Option<PathBuf>,
    pub methods: Option<Vec<String>>,
    pub redirect: Option<TomlRedirect>,
    pub autoindex: Option<bool>,
    pub index: Option<Vec<String>>,
    pub upload_path: Option<PathBuf>,
    pub cgi_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct TomlRedirect {
    pub status: u16,
    pub target: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final validated configuration.
#[derive(Debug)]
pub struct Config {
    pub log_level: String,
    pub servers: Vec<VirtualServer>,
}

impl Config {
    /// Read, parse, and validate the configuration file.
    pub fn load(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
        let toml_config: TomlConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::TomlParse(path.clone(), e))?;
        Self::validate(toml_config)
    }

    fn validate(toml_config: TomlConfig) -> Result<Self, ConfigError> {
        if toml_config.servers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[server]] block is required".to_string(),
            ));
        }

        let mut servers = Vec::with_capacity(toml_config.servers.len());
        for raw in toml_config.servers {
            servers.push(validate_server(raw)?);
        }

        Ok(Config {
            log_level: toml_config.log_level.unwrap_or_else(default_log_level),
            servers,
        })
    }
}

fn validate_server(raw: TomlServer) -> Result<VirtualServer, ConfigError> {
    if raw.listen.is_empty() {
        return Err(ConfigError::Invalid(
            "server has no listen endpoints".to_string(),
        ));
    }

    let mut endpoints = Vec::with_capacity(raw.listen.len());
    for spec in &raw.listen {
        let endpoint: Endpoint = spec
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("{e}")))?;
        endpoints.push(endpoint);
    }

    let mut status_pages = BTreeMap::new();
    for (code, page) in raw.status_pages {
        let code: u16 = code
            .parse()
            .ok()
            .filter(|c| (100..=599).contains(c))
            .ok_or_else(|| {
                ConfigError::Invalid(format!("invalid status code '{code}' in status_pages"))
            })?;
        status_pages.insert(code, page);
    }

    let mut locations = Vec::with_capacity(raw.locations.len());
    for location in raw.locations {
        locations.push(validate_location(location)?);
    }

    Ok(VirtualServer {
        server_names: raw
            .server_names
            .unwrap_or_else(|| vec!["_".to_string()]),
        endpoints,
        root: raw.root.unwrap_or_else(|| PathBuf::from("./www")),
        indexes: raw
            .index
            .unwrap_or_else(|| vec!["index.html".to_string()]),
        autoindex: raw.autoindex.unwrap_or(false),
        client_max_body_size: raw.client_max_body_size.unwrap_or(1024 * 1024),
        keep_alive: raw.keep_alive.unwrap_or(true),
        status_pages,
        locations,
    })
}

fn validate_location(raw: TomlLocation) -> Result<Location, ConfigError> {
    if !raw.path.starts_with('/') {
        return Err(ConfigError::Invalid(format!(
            "location path '{}' must start with '/'",
            raw.path
        )));
    }

    let allowed_methods = match raw.methods {
        Some(names) => {
            let mut set = BTreeSet::new();
            for name in names {
                let method = Method::from_bytes(name.to_ascii_uppercase().as_bytes())
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!("unknown method '{name}' in location"))
                    })?;
                set.insert(method);
            }
            Some(set)
        }
        None => None,
    };

    let redirect = match raw.redirect {
        Some(r) => {
            if !(300..=399).contains(&r.status) {
                return Err(ConfigError::Invalid(format!(
                    "redirect status {} is not a 3xx code",
                    r.status
                )));
            }
            Some(Redirect {
                status: r.status,
                target: r.target,
            })
        }
        None => None,
    };

    Ok(Location {
        path_prefix: raw.path,
        root: raw.root,
        allowed_methods,
        redirect,
        autoindex: raw.autoindex,
        indexes: raw.index,
        upload_path: raw.upload_path,
        cgi_path: raw.cgi_path,
    })
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
