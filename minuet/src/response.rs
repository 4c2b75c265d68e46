// src/response.rs
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use crate::http::reason_phrase;
use crate::templates;

pub const SERVER_SOFTWARE: &str = "minuet/0.1";

/// One HTTP response: status, header map, body, and a lazily built wire form.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
    wire: Option<Vec<u8>>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Server".to_string(), SERVER_SOFTWARE.to_string());
        headers.insert(
            "Date".to_string(),
            httpdate::fmt_http_date(SystemTime::now()),
        );
        Self {
            status: 200,
            headers,
            body: Vec::new(),
            wire: None,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, code: u16) {
        self.status = code;
        self.wire = None;
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_string(), value.into());
        self.wire = None;
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replace the body and keep `Content-Length` in sync.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
        let len = self.body.len();
        self.set_header("Content-Length", len.to_string());
    }

    pub fn append_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
        let len = self.body.len();
        self.set_header("Content-Length", len.to_string());
    }

    /// Drop the body for a HEAD response; headers (including
    /// `Content-Length`) stay untouched.
    pub fn remove_body(&mut self) {
        self.body.clear();
        self.wire = None;
    }

    /// Serialized wire form, built on first use and cached.
    pub fn wire(&mut self) -> &[u8] {
        if self.wire.is_none() {
            let mut out = Vec::with_capacity(128 + self.body.len());
            out.extend_from_slice(
                format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status)).as_bytes(),
            );
            for (name, value) in &self.headers {
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&self.body);
            self.wire = Some(out);
        }
        self.wire.as_deref().unwrap_or(&[])
    }

    // ---- static constructors ----

    pub fn error_response(code: u16, message: &str) -> Response {
        let mut response = Response::new();
        response.set_status(code);
        response.set_header("Content-Type", "text/html");
        response.set_body(templates::error_page(code, reason_phrase(code), message));
        response
    }

    /// Confirmation page with a status, used by PUT/DELETE/upload.
    pub fn message_response(code: u16, message: &str) -> Response {
        let mut response = Response::new();
        response.set_status(code);
        response.set_header("Content-Type", "text/html");
        response.set_body(templates::message_page(reason_phrase(code), message));
        response
    }

    /// 200 with the file contents, MIME-typed by extension; 404 when the
    /// file is missing or unreadable.
    pub fn file_response(path: &Path) -> Response {
        match fs::read(path) {
            Ok(contents) => {
                let mime = mime_guess::from_path(path).first_or_octet_stream();
                let mut response = Response::new();
                response.set_header("Content-Type", mime.essence_str().to_string());
                response.set_body(contents);
                response
            }
            Err(_) => Response::error_response(404, "File not found"),
        }
    }

    /// Alphabetical HTML listing with a parent link when `uri` != "/".
    pub fn directory_listing_response(path: &Path, uri: &str) -> Response {
        let Ok(read) = fs::read_dir(path) else {
            return Response::error_response(404, "No such directory");
        };
        let mut entries: Vec<(String, bool)> = read
            .filter_map(|e| e.ok())
            .map(|e| {
                let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
                (e.file_name().to_string_lossy().into_owned(), is_dir)
            })
            .collect();
        entries.sort();
        let mut response = Response::new();
        response.set_header("Content-Type", "text/html");
        response.set_body(templates::directory_listing(uri, &entries));
        response
    }

    /// Redirect with `code` in 300..=399 and an empty body.
    pub fn redirect_response(location: &str, code: u16) -> Response {
        let mut response = Response::new();
        response.set_status(code);
        response.set_header("Location", location);
        response.set_body(Vec::new());
        response
    }

    /// Advertise the allowed methods for a target.
    pub fn options_response(methods: &[String]) -> Response {
        let mut response = Response::new();
        response.set_status(204);
        response.set_header("Allow", methods.join(", "));
        response.set_body(Vec::new());
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn set_body_tracks_content_length() {
        let mut r = Response::new();
        r.set_body(b"hello".to_vec());
        assert_eq!(r.header("Content-Length"), Some("5"));
        r.append_body(b" world");
        assert_eq!(r.header("Content-Length"), Some("11"));
    }

    #[test]
    fn remove_body_keeps_headers() {
        let mut r = Response::new();
        r.set_header("Content-Type", "text/plain");
        r.set_body(b"payload".to_vec());
        r.remove_body();
        assert_eq!(r.header("Content-Length"), Some("7"));
        assert_eq!(r.header("Content-Type"), Some("text/plain"));
        assert!(r.body().is_empty());
        let wire = r.wire().to_vec();
        assert!(wire.ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn wire_form_has_status_line_and_default_headers() {
        let mut r = Response::new();
        r.set_status(404);
        r.set_body(b"x".to_vec());
        let wire = String::from_utf8(r.wire().to_vec()).unwrap();
        assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(wire.contains("Server: minuet/0.1\r\n"));
        assert!(wire.contains("Date: "));
        assert!(wire.ends_with("\r\n\r\nx"));
    }

    #[test]
    fn wire_cache_invalidated_by_mutation() {
        let mut r = Response::new();
        r.set_body(b"a".to_vec());
        let first = r.wire().to_vec();
        r.set_body(b"bb".to_vec());
        let second = r.wire().to_vec();
        assert_ne!(first, second);
        assert!(String::from_utf8(second).unwrap().contains("Content-Length: 2"));
    }

    #[test]
    fn file_response_serves_mime_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.html");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(b"<h1>hi</h1>").unwrap();
        let mut r = Response::file_response(&path);
        assert_eq!(r.status(), 200);
        assert_eq!(r.header("Content-Type"), Some("text/html"));
        assert_eq!(r.header("Content-Length"), Some("11"));
        assert!(r.wire().ends_with(b"<h1>hi</h1>"));
    }

    #[test]
    fn missing_file_is_404() {
        let r = Response::file_response(Path::new("/nonexistent/file.txt"));
        assert_eq!(r.status(), 404);
    }

    #[test]
    fn redirect_has_location_and_empty_body() {
        let mut r = Response::redirect_response("/new", 301);
        assert_eq!(r.status(), 301);
        assert_eq!(r.header("Location"), Some("/new"));
        assert_eq!(r.header("Content-Length"), Some("0"));
        assert!(r.wire().ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn options_lists_methods() {
        let methods = vec!["GET".to_string(), "POST".to_string()];
        let r = Response::options_response(&methods);
        assert_eq!(r.status(), 204);
        assert_eq!(r.header("Allow"), Some("GET, POST"));
    }

    #[test]
    fn directory_listing_sorted_with_parent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let r = Response::directory_listing_response(dir.path(), "/files");
        let body = String::from_utf8(r.body().to_vec()).unwrap();
        let a = body.find("a.txt").unwrap();
        let b = body.find("b.txt").unwrap();
        assert!(a < b);
        assert!(body.contains("sub/"));
        assert!(body.contains("../"));
    }
}
