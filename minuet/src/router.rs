// src/router.rs
//
// Virtual-server selection, longest-prefix location matching, method
// authorization, and the handler dispatch chain.
use std::fs;

use tracing::debug;

use crate::cgi;
use crate::config::{RouteConfig, ServerConfig};
use crate::handler;
use crate::http::Method;
use crate::multipart;
use crate::parser::Request;
use crate::response::Response;

pub struct Router {
    servers: Vec<ServerConfig>,
}

impl Router {
    pub fn new(servers: Vec<ServerConfig>) -> Self {
        Self { servers }
    }

    /// The virtual server owning the port a connection was accepted on.
    pub fn server_for_port(&self, port: u16) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.port == port)
    }

    /// Longest-prefix location match: strip the last path segment until a
    /// configured prefix hits, ending at "/".
    pub fn find_route<'a>(
        config: &'a ServerConfig,
        uri: &str,
    ) -> Option<(&'a String, &'a RouteConfig)> {
        let mut prefix = uri;
        loop {
            if let Some(found) = config.routes.get_key_value(prefix) {
                return Some(found);
            }
            if prefix == "/" {
                return None;
            }
            prefix = match prefix.rfind('/') {
                Some(0) | None => "/",
                Some(i) => &prefix[..i],
            };
        }
    }

    /// Body cap for a target: the matched route's, else the server's.
    pub fn effective_max_body(config: &ServerConfig, uri: &str) -> usize {
        Self::find_route(config, uri)
            .map(|(_, route)| route.max_body_size)
            .unwrap_or(config.max_body_size)
    }

    /// Produce the response for a parsed (or failed) request.
    pub fn dispatch(&self, port: u16, request: &Request) -> Response {
        let Some(config) = self.server_for_port(port) else {
            // The accept path only hands out configured ports.
            return Response::error_response(500, "No virtual server for port");
        };

        let fallback;
        let route = match Self::find_route(config, &request.uri) {
            Some((prefix, route)) => {
                debug!(uri = %request.uri, prefix = %prefix, "route matched");
                route
            }
            None => {
                fallback = builtin_route(config);
                &fallback
            }
        };

        // Declared length for identity bodies; actual buffered length covers
        // chunked bodies that arrived before the route was known.
        let body_len = request.content_length.unwrap_or(0).max(request.body.len());
        if body_len > route.max_body_size {
            return finish(
                config,
                Response::error_response(413, "Request body exceeds limit"),
            );
        }
        if request.status != 0 {
            return finish(config, Response::error_response(request.status, ""));
        }
        if let Some(redirect) = &route.redirect {
            return Response::redirect_response(&redirect.target, redirect.code);
        }
        let method_name = request.method.as_str();
        if !route.allows(method_name) {
            return finish(config, Response::error_response(405, "Method not allowed"));
        }
        if request.method == Method::Options {
            return handler::handle_options(route);
        }
        if cgi::is_cgi_request(&request.uri, route) {
            // CGI responses surface whatever the script produced, error
            // pages included.
            return cgi::execute(config, route, request, port);
        }
        let response = match request.method {
            Method::Post => multipart::handle_upload(route, request),
            Method::Put => handler::handle_put(route, request),
            Method::Delete => handler::handle_delete(route, &request.uri),
            Method::Head => {
                let mut response = handler::handle_get(route, &request.uri);
                response.remove_body();
                response
            }
            Method::Get => handler::handle_get(route, &request.uri),
            _ => Response::error_response(405, "Method not allowed"),
        };
        finish(config, response)
    }
}

/// Built-in default when the server has no rule covering "/": safe methods
/// only, server-level root/index/autoindex.
fn builtin_route(config: &ServerConfig) -> RouteConfig {
    RouteConfig {
        methods: vec!["GET".to_string(), "HEAD".to_string(), "OPTIONS".to_string()],
        root: config.root.clone(),
        index: config.index.clone(),
        autoindex: config.autoindex,
        upload_path: format!("{}/uploads", config.root),
        cgi_extensions: Vec::new(),
        redirect: None,
        max_body_size: config.max_body_size,
    }
}

/// Swap in the server's configured error page, when one exists for the
/// status and is readable.
fn finish(config: &ServerConfig, mut response: Response) -> Response {
    let status = response.status();
    if status >= 400 {
        if let Some(page) = config.error_pages.get(&status) {
            if let Ok(contents) = fs::read(page) {
                response.set_header("Content-Type", "text/html");
                response.set_body(contents);
            }
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ParseOutcome;
    use std::collections::HashMap;

    fn route(methods: &[&str]) -> RouteConfig {
        RouteConfig {
            methods: methods.iter().map(|m| m.to_string()).collect(),
            root: "/srv".to_string(),
            index: "index.html".to_string(),
            autoindex: false,
            upload_path: "/srv/uploads".to_string(),
            cgi_extensions: Vec::new(),
            redirect: None,
            max_body_size: 1024,
        }
    }

    fn config_with_routes(routes: Vec<(&str, RouteConfig)>) -> ServerConfig {
        ServerConfig {
            port: 8080,
            server_name: "localhost".to_string(),
            root: "/srv".to_string(),
            index: "index.html".to_string(),
            max_body_size: 4096,
            autoindex: false,
            error_pages: HashMap::new(),
            routes: routes
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    fn parsed(raw: &[u8]) -> Request {
        let mut request = Request::new();
        let outcome = request.parse(raw);
        assert!(matches!(
            outcome,
            ParseOutcome::Complete | ParseOutcome::Error(_)
        ));
        request
    }

    #[test]
    fn longest_prefix_wins() {
        let config = config_with_routes(vec![
            ("/", route(&["GET"])),
            ("/a", route(&["GET"])),
            ("/a/b", route(&["GET", "POST"])),
        ]);
        let (prefix, _) = Router::find_route(&config, "/a/b/c.html").unwrap();
        assert_eq!(prefix, "/a/b");
        let (prefix, _) = Router::find_route(&config, "/a/x").unwrap();
        assert_eq!(prefix, "/a");
        let (prefix, _) = Router::find_route(&config, "/other").unwrap();
        assert_eq!(prefix, "/");
    }

    #[test]
    fn unmatched_uri_has_no_route() {
        let config = config_with_routes(vec![("/api", route(&["GET"]))]);
        assert!(Router::find_route(&config, "/elsewhere").is_none());
    }

    #[test]
    fn effective_max_body_prefers_route() {
        let mut tight = route(&["POST"]);
        tight.max_body_size = 3;
        let config = config_with_routes(vec![("/upload", tight)]);
        assert_eq!(Router::effective_max_body(&config, "/upload/file"), 3);
        assert_eq!(Router::effective_max_body(&config, "/other"), 4096);
    }

    #[test]
    fn oversized_declared_body_is_413() {
        let mut tight = route(&["POST"]);
        tight.max_body_size = 3;
        let router = Router::new(vec![config_with_routes(vec![("/upload", tight)])]);
        let mut request = Request::new();
        // Headers alone are enough to decide; don't feed the body.
        let outcome =
            request.parse(b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::NeedMore);
        let response = router.dispatch(8080, &request);
        assert_eq!(response.status(), 413);
    }

    #[test]
    fn oversized_chunked_body_is_413() {
        let mut tight = route(&["POST"]);
        tight.max_body_size = 3;
        let router = Router::new(vec![config_with_routes(vec![("/upload", tight)])]);
        // The whole request arrived in one read, so the parser ran under the
        // server-level cap; dispatch still enforces the route's.
        let request = parsed(
            b"POST /upload HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        );
        assert_eq!(router.dispatch(8080, &request).status(), 413);
    }

    #[test]
    fn parser_status_is_served() {
        let router = Router::new(vec![config_with_routes(vec![])]);
        let request = parsed(b"GET /a/../b HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(router.dispatch(8080, &request).status(), 400);
    }

    #[test]
    fn redirect_takes_priority_over_method_check() {
        let mut redirecting = route(&["GET"]);
        redirecting.redirect = Some(crate::config::Redirect {
            code: 301,
            target: "https://example.com/new".to_string(),
        });
        let router = Router::new(vec![config_with_routes(vec![("/old", redirecting)])]);
        // DELETE is not allowed on the route, but the redirect wins.
        let request = parsed(b"DELETE /old HTTP/1.1\r\nHost: x\r\n\r\n");
        let response = router.dispatch(8080, &request);
        assert_eq!(response.status(), 301);
        assert_eq!(response.header("Location"), Some("https://example.com/new"));
    }

    #[test]
    fn method_not_allowed_is_405() {
        let router = Router::new(vec![config_with_routes(vec![("/ro", route(&["GET"]))])]);
        let request = parsed(b"DELETE /ro/x HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(router.dispatch(8080, &request).status(), 405);
    }

    #[test]
    fn default_route_permits_safe_methods_only() {
        let router = Router::new(vec![config_with_routes(vec![])]);
        let request = parsed(b"DELETE /x HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(router.dispatch(8080, &request).status(), 405);
        let request = parsed(b"OPTIONS /x HTTP/1.1\r\nHost: x\r\n\r\n");
        let response = router.dispatch(8080, &request);
        assert_eq!(response.status(), 204);
        assert_eq!(response.header("Allow"), Some("GET, HEAD, OPTIONS"));
    }

    #[test]
    fn options_advertises_route_methods() {
        let router = Router::new(vec![config_with_routes(vec![(
            "/api",
            route(&["GET", "POST", "DELETE"]),
        )])]);
        let request = parsed(b"OPTIONS /api HTTP/1.1\r\nHost: x\r\n\r\n");
        let response = router.dispatch(8080, &request);
        assert_eq!(response.header("Allow"), Some("GET, POST, DELETE, OPTIONS"));
    }

    #[test]
    fn unknown_port_is_500() {
        let router = Router::new(vec![config_with_routes(vec![])]);
        let request = parsed(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(router.dispatch(9999, &request).status(), 500);
    }

    #[test]
    fn head_response_has_headers_but_no_body() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page.html"), b"<p>content</p>").unwrap();
        let mut r = route(&["GET", "HEAD"]);
        r.root = dir.path().to_str().unwrap().to_string();
        let mut config = config_with_routes(vec![("/", r)]);
        config.root = dir.path().to_str().unwrap().to_string();
        let router = Router::new(vec![config]);

        let get = parsed(b"GET /page.html HTTP/1.1\r\nHost: x\r\n\r\n");
        let head = parsed(b"HEAD /page.html HTTP/1.1\r\nHost: x\r\n\r\n");
        let get_response = router.dispatch(8080, &get);
        let head_response = router.dispatch(8080, &head);

        assert_eq!(get_response.status(), head_response.status());
        assert_eq!(
            get_response.header("Content-Length"),
            head_response.header("Content-Length")
        );
        assert_eq!(get_response.body(), b"<p>content</p>");
        assert!(head_response.body().is_empty());
    }

    #[test]
    fn error_page_override_replaces_body() {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("404.html");
        std::fs::write(&page, b"<h1>custom not found</h1>").unwrap();
        let mut config = config_with_routes(vec![]);
        config.root = dir.path().to_str().unwrap().to_string();
        config
            .error_pages
            .insert(404, page.to_str().unwrap().to_string());
        let router = Router::new(vec![config]);

        let request = parsed(b"GET /absent.html HTTP/1.1\r\nHost: x\r\n\r\n");
        let response = router.dispatch(8080, &request);
        assert_eq!(response.status(), 404);
        assert_eq!(response.body(), b"<h1>custom not found</h1>");
    }
}
