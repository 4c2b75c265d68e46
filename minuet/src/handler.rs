// src/handler.rs
//
// Filesystem-backed request handlers: static GET/HEAD serving, PUT, DELETE
// and OPTIONS. Upload (POST) lives in multipart.rs, CGI in cgi.rs.
use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::config::RouteConfig;
use crate::parser::Request;
use crate::response::Response;

/// Map a request target onto the route's filesystem root.
/// Traversal sequences were already rejected by the parser.
pub fn resolve_path(route: &RouteConfig, uri: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", route.root, uri))
}

/// GET: directory → listing if enabled, else the configured index file;
/// plain file → its contents; nothing → 404.
pub fn handle_get(route: &RouteConfig, uri: &str) -> Response {
    let path = resolve_path(route, uri);
    match fs::metadata(&path) {
        Ok(meta) if meta.is_dir() => {
            if route.autoindex {
                Response::directory_listing_response(&path, uri)
            } else {
                Response::file_response(&path.join(&route.index))
            }
        }
        Ok(_) => Response::file_response(&path),
        Err(_) => Response::error_response(404, "File not found"),
    }
}

/// PUT: create or replace the resource at the target path.
/// 201 with a Location header when created, 200 when replaced,
/// 409 when the target exists as a directory.
pub fn handle_put(route: &RouteConfig, request: &Request) -> Response {
    let path = resolve_path(route, &request.uri);
    if path.is_dir() {
        return Response::error_response(409, "Cannot replace a directory");
    }
    let existed = path.exists();
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(path = %path.display(), error = %e, "PUT: cannot create parent");
                return Response::error_response(500, "Failed to write file");
            }
        }
    }
    if let Err(e) = fs::write(&path, &request.body) {
        warn!(path = %path.display(), error = %e, "PUT: write failed");
        return Response::error_response(500, "Failed to write file");
    }
    debug!(path = %path.display(), bytes = request.body.len(), existed, "PUT complete");
    if existed {
        Response::message_response(200, "Resource updated successfully")
    } else {
        let mut response = Response::message_response(201, "Resource created successfully");
        response.set_header("Location", request.uri.clone());
        response
    }
}

/// DELETE: 200 on success, 404 when the target is absent (or a directory,
/// which this server refuses to remove).
pub fn handle_delete(route: &RouteConfig, uri: &str) -> Response {
    let path = resolve_path(route, uri);
    match fs::metadata(&path) {
        Err(_) => Response::error_response(404, "File not found"),
        Ok(meta) if meta.is_dir() => Response::error_response(404, "File not found"),
        Ok(_) => match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "DELETE complete");
                Response::message_response(200, "File deleted")
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "DELETE failed");
                Response::error_response(500, "Failed to delete file")
            }
        },
    }
}

/// OPTIONS: advertise the route's allowed methods. OPTIONS itself is always
/// included.
pub fn handle_options(route: &RouteConfig) -> Response {
    let mut methods = route.methods.clone();
    if !methods.iter().any(|m| m == "OPTIONS") {
        methods.push("OPTIONS".to_string());
    }
    Response::options_response(&methods)
}
