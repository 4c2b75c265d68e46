// src/multipart.rs
//
// multipart/form-data parsing and the POST upload handler. The parser is a
// cursor over the already-buffered request body; parts borrow from it, no
// copies until the payload is written out.
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::config::RouteConfig;
use crate::parser::Request;
use crate::response::Response;

/// File types accepted by the upload handler. Script and executable
/// extensions stay out.
const ALLOWED_UPLOAD_EXTENSIONS: &[&str] = &[
    "txt", "md", "csv", "json", "xml", "html", "htm", "css", "js", "jpg", "jpeg", "png", "gif",
    "ico", "svg", "webp", "pdf", "zip", "mp3", "mp4",
];

#[derive(Debug)]
pub struct Part<'a> {
    pub name: Option<&'a str>,
    pub filename: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub data: &'a [u8],
}

#[derive(Debug, PartialEq, Eq)]
pub enum MultipartError {
    /// The closing boundary never shows up.
    Truncated,
}

/// Iterator over the parts of a multipart body.
pub struct Multipart<'a> {
    body: &'a [u8],
    marker: Vec<u8>,
}

impl<'a> Multipart<'a> {
    pub fn new(body: &'a [u8], boundary: &str) -> Self {
        let mut marker = Vec::with_capacity(boundary.len() + 2);
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(boundary.as_bytes());
        Self { body, marker }
    }

    fn find(data: &[u8], needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        data.windows(needle.len()).position(|w| w == needle)
    }
}

impl<'a> Iterator for Multipart<'a> {
    type Item = Result<Part<'a>, MultipartError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.body.is_empty() {
            return None;
        }

        let mut start = Self::find(self.body, &self.marker)?;
        start += self.marker.len();

        // "--" after the marker closes the stream.
        if self.body.len() >= start + 2 && &self.body[start..start + 2] == b"--" {
            self.body = &[];
            return None;
        }
        if self.body.len() >= start + 2 && &self.body[start..start + 2] == b"\r\n" {
            start += 2;
        }

        let header_end = match Self::find(&self.body[start..], b"\r\n\r\n") {
            Some(i) => i,
            None => return Some(Err(MultipartError::Truncated)),
        };
        let header_slice = &self.body[start..start + header_end];
        let data_start = start + header_end + 4;

        let data_end = match Self::find(&self.body[data_start..], &self.marker) {
            Some(pos) => data_start + pos,
            None => return Some(Err(MultipartError::Truncated)),
        };
        // The part data ends with \r\n before the next boundary line.
        let trimmed_end = if data_end >= data_start + 2
            && &self.body[data_end - 2..data_end] == b"\r\n"
        {
            data_end - 2
        } else {
            data_end
        };
        let data = &self.body[data_start..trimmed_end];
        self.body = &self.body[data_end..];

        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        if let Ok(headers) = std::str::from_utf8(header_slice) {
            for line in headers.split("\r\n") {
                let lower = line.to_ascii_lowercase();
                if lower.starts_with("content-disposition:") {
                    name = quoted_attr(line, "name=\"");
                    filename = quoted_attr(line, "filename=\"");
                } else if lower.starts_with("content-type:") {
                    content_type = Some(line["content-type:".len()..].trim());
                }
            }
        }

        Some(Ok(Part {
            name,
            filename,
            content_type,
            data,
        }))
    }
}

fn quoted_attr<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let lower = line.to_ascii_lowercase();
    let idx = lower.find(key)?;
    let rest = &line[idx + key.len()..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// Pull the boundary token out of a Content-Type header value.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let lower = content_type.to_ascii_lowercase();
    let idx = lower.find("boundary=")?;
    let raw = &content_type[idx + "boundary=".len()..];
    let raw = raw.split(';').next().unwrap_or("").trim();
    let token = raw.trim_matches('"');
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Strip any path components and suspect characters from a client-supplied
/// filename. An empty result means the caller should generate a name.
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

fn extension_allowed(filename: &str) -> bool {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            let ext = ext.to_ascii_lowercase();
            ALLOWED_UPLOAD_EXTENSIONS.contains(&ext.as_str())
        }
        _ => false,
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// POST upload: write the first file part of a multipart body into the
/// route's upload directory.
pub fn handle_upload(route: &RouteConfig, request: &Request) -> Response {
    let Some(content_type) = request.header("content-type") else {
        return Response::error_response(400, "Expected multipart/form-data");
    };
    let Some(boundary) = boundary_from_content_type(content_type) else {
        return Response::error_response(400, "Missing multipart boundary");
    };

    let mut parts = Multipart::new(&request.body, &boundary);
    let part = loop {
        match parts.next() {
            Some(Ok(part)) => {
                if part.filename.is_some() {
                    break part;
                }
            }
            Some(Err(_)) => return Response::error_response(400, "Malformed multipart body"),
            None => return Response::error_response(400, "No file data"),
        }
    };

    let supplied = part.filename.unwrap_or("");
    let mut filename = sanitize_filename(supplied);
    if filename.is_empty() {
        filename = format!("upload-{}", epoch_secs());
    } else if !extension_allowed(&filename) {
        return Response::error_response(403, "File type not allowed");
    }

    if part.data.is_empty() {
        return Response::error_response(400, "No file data");
    }

    let upload_dir = Path::new(&route.upload_path);
    if let Err(e) = fs::create_dir_all(upload_dir) {
        warn!(dir = %upload_dir.display(), error = %e, "upload: cannot create directory");
        return Response::error_response(500, "Failed to save file");
    }
    let mut target = upload_dir.join(&filename);
    if target.exists() {
        target = upload_dir.join(format!("{}_copy_{}", filename, epoch_secs()));
    }

    if let Err(e) = fs::write(&target, part.data) {
        warn!(path = %target.display(), error = %e, "upload: write failed");
        let _ = fs::remove_file(&target);
        return Response::error_response(500, "Failed to save file");
    }

    debug!(path = %target.display(), bytes = part.data.len(), "upload complete");
    Response::message_response(201, "File uploaded successfully!")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ParseOutcome;

    fn multipart_body(boundary: &str, filename: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
                filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: text/plain\r\n\r\n");
        body.extend_from_slice(payload);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
        body
    }

    fn upload_request(boundary: &str, body: &[u8]) -> Request {
        let mut raw = format!(
            "POST /upload HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary={}\r\nContent-Length: {}\r\n\r\n",
            boundary,
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);
        let mut request = Request::new();
        assert_eq!(request.parse(&raw), ParseOutcome::Complete);
        request
    }

    fn upload_route(dir: &Path) -> RouteConfig {
        RouteConfig {
            methods: vec!["POST".into()],
            root: dir.to_str().unwrap().to_string(),
            index: "index.html".into(),
            autoindex: false,
            upload_path: dir.join("uploads").to_str().unwrap().to_string(),
            cgi_extensions: Vec::new(),
            redirect: None,
            max_body_size: 1 << 20,
        }
    }

    #[test]
    fn iterates_parts() {
        let body = multipart_body("XYZ", "notes.txt", b"hello upload");
        let mut mp = Multipart::new(&body, "XYZ");
        let part = mp.next().unwrap().unwrap();
        assert_eq!(part.name, Some("file"));
        assert_eq!(part.filename, Some("notes.txt"));
        assert_eq!(part.content_type, Some("text/plain"));
        assert_eq!(part.data, b"hello upload");
        assert!(mp.next().is_none());
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut body = multipart_body("XYZ", "notes.txt", b"hello");
        body.truncate(body.len() - 10);
        let mut mp = Multipart::new(&body, "XYZ");
        assert_eq!(mp.next().unwrap().unwrap_err(), MultipartError::Truncated);
    }

    #[test]
    fn boundary_extraction() {
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=XYZ"),
            Some("XYZ".to_string())
        );
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=\"a b\"; charset=utf-8"),
            Some("a b".to_string())
        );
        assert_eq!(boundary_from_content_type("text/plain"), None);
    }

    #[test]
    fn filename_sanitization() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\temp\\evil.txt"), "evil.txt");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename("sp ace$.txt"), "space.txt");
        assert_eq!(sanitize_filename("///"), "");
    }

    #[test]
    fn upload_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let route = upload_route(dir.path());
        let body = multipart_body("B1", "data.txt", b"payload bytes");
        let request = upload_request("B1", &body);

        let response = handle_upload(&route, &request);
        assert_eq!(response.status(), 201);
        let written = fs::read(dir.path().join("uploads/data.txt")).unwrap();
        assert_eq!(written, b"payload bytes");
    }

    #[test]
    fn upload_stops_at_closing_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let route = upload_route(dir.path());
        let mut body = multipart_body("B1", "data.txt", b"real");
        body.extend_from_slice(b"trailing garbage after close");
        let request = upload_request("B1", &body);

        let response = handle_upload(&route, &request);
        assert_eq!(response.status(), 201);
        let written = fs::read(dir.path().join("uploads/data.txt")).unwrap();
        assert_eq!(written, b"real");
    }

    #[test]
    fn empty_payload_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let route = upload_route(dir.path());
        let body = multipart_body("B1", "data.txt", b"");
        let request = upload_request("B1", &body);
        assert_eq!(handle_upload(&route, &request).status(), 400);
    }

    #[test]
    fn disallowed_extension_is_403() {
        let dir = tempfile::tempdir().unwrap();
        let route = upload_route(dir.path());
        let body = multipart_body("B1", "shell.sh", b"#!/bin/sh");
        let request = upload_request("B1", &body);
        assert_eq!(handle_upload(&route, &request).status(), 403);
    }

    #[test]
    fn missing_boundary_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let route = upload_route(dir.path());
        let raw = b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\nblob";
        let mut request = Request::new();
        assert_eq!(request.parse(raw), ParseOutcome::Complete);
        assert_eq!(handle_upload(&route, &request).status(), 400);
    }

    #[test]
    fn existing_target_gets_suffixed() {
        let dir = tempfile::tempdir().unwrap();
        let route = upload_route(dir.path());
        fs::create_dir_all(dir.path().join("uploads")).unwrap();
        fs::write(dir.path().join("uploads/data.txt"), b"old").unwrap();

        let body = multipart_body("B1", "data.txt", b"new");
        let request = upload_request("B1", &body);
        assert_eq!(handle_upload(&route, &request).status(), 201);

        // Original untouched, copy written alongside.
        assert_eq!(fs::read(dir.path().join("uploads/data.txt")).unwrap(), b"old");
        let copies: Vec<_> = fs::read_dir(dir.path().join("uploads"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("_copy_"))
            .collect();
        assert_eq!(copies.len(), 1);
    }
}
