use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ServerError, ServerResult};

pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_index() -> String {
    "index.html".to_string()
}

fn default_max_body_size() -> usize {
    DEFAULT_MAX_BODY_SIZE
}

/// A redirect rule attached to a route: `(code in 300..=399, target URL)`.
#[derive(Debug, Clone, Deserialize)]
pub struct Redirect {
    pub code: u16,
    pub target: String,
}

/// A location rule within a virtual server.
///
/// After `load()` returns, inheritance from the owning server has been
/// applied: `root`, `index` and `max_body_size` are never empty/zero, and
/// `upload_path` defaults to `<root>/uploads`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub index: String,
    #[serde(default)]
    pub autoindex: bool,
    #[serde(default)]
    pub upload_path: String,
    #[serde(default)]
    pub cgi_extensions: Vec<String>,
    #[serde(default)]
    pub redirect: Option<Redirect>,
    /// 0 means "inherit from the server" until `load()` resolves it.
    #[serde(default)]
    pub max_body_size: usize,
}

impl RouteConfig {
    pub fn allows(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

/// One virtual server, selected by the port its connection was accepted on.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    pub root: String,
    #[serde(default = "default_index")]
    pub index: String,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default)]
    pub autoindex: bool,
    #[serde(default)]
    pub error_pages: HashMap<u16, String>,
    #[serde(default)]
    pub routes: HashMap<String, RouteConfig>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    servers: Vec<ServerConfig>,
}

/// Load and validate the configuration file. Errors here are fatal to the
/// process, before any socket is bound.
pub fn load(path: &Path) -> ServerResult<Vec<ServerConfig>> {
    let raw = fs::read_to_string(path).map_err(|e| {
        ServerError::Config(format!("cannot read {}: {}", path.display(), e))
    })?;
    let file: ConfigFile = serde_json::from_str(&raw)
        .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))?;

    let mut servers = file.servers;
    if servers.is_empty() {
        return Err(ServerError::Config("no servers configured".to_string()));
    }

    let mut seen_ports = HashSet::new();
    for server in &mut servers {
        if server.port == 0 {
            return Err(ServerError::Config("port 0 is not listenable".to_string()));
        }
        if !seen_ports.insert(server.port) {
            return Err(ServerError::Config(format!(
                "duplicate listening port {}",
                server.port
            )));
        }
        if server.root.is_empty() {
            return Err(ServerError::Config(format!(
                "server on port {} has no document root",
                server.port
            )));
        }
        resolve_routes(server)?;
    }

    Ok(servers)
}

/// Apply server → route inheritance once, so that no route field is empty
/// afterwards except the optional ones.
fn resolve_routes(server: &mut ServerConfig) -> ServerResult<()> {
    let (root, index, max_body) = (
        server.root.clone(),
        server.index.clone(),
        server.max_body_size,
    );
    for (prefix, route) in &mut server.routes {
        if !prefix.starts_with('/') {
            return Err(ServerError::Config(format!(
                "route prefix {:?} must start with '/'",
                prefix
            )));
        }
        if route.root.is_empty() {
            route.root = root.clone();
        }
        if route.index.is_empty() {
            route.index = index.clone();
        }
        if route.max_body_size == 0 {
            route.max_body_size = max_body;
        }
        if route.methods.is_empty() {
            route.methods = vec![
                "GET".to_string(),
                "HEAD".to_string(),
                "OPTIONS".to_string(),
            ];
        }
        if route.upload_path.is_empty() {
            route.upload_path = format!("{}/uploads", route.root);
        }
        if let Some(redirect) = &route.redirect {
            if !(300..=399).contains(&redirect.code) {
                return Err(ServerError::Config(format!(
                    "route {:?}: redirect code {} outside 300..=399",
                    prefix, redirect.code
                )));
            }
        }
        for ext in &route.cgi_extensions {
            if !ext.starts_with('.') {
                return Err(ServerError::Config(format!(
                    "route {:?}: CGI extension {:?} must start with '.'",
                    prefix, ext
                )));
            }
        }
    }
    Ok(())
}
