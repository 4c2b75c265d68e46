// src/parser.rs
//
// Incremental HTTP/1.1 request parser. `Request::parse` is called with the
// connection's cumulative input buffer and may be invoked any number of times
// as bytes arrive; the request tracks its own consumption offset, so feeding
// a stream chopped at arbitrary positions yields the same result as feeding
// it whole.
use std::collections::HashMap;

use percent_encoding::percent_decode_str;

use crate::config::DEFAULT_MAX_BODY_SIZE;
use crate::http::{HeaderMap, Method};

/// Cumulative cap on request-line + header bytes.
pub const MAX_HEADER_BYTES: usize = 16 * 1024;
/// Cap on any single field line.
pub const MAX_FIELD_BYTES: usize = 4 * 1024;
/// Cap on the request target.
pub const MAX_URI: usize = 2 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The buffer ends mid-request; call again once more bytes arrive.
    NeedMore,
    /// A full request (headers and body) has been consumed.
    Complete,
    /// The request is invalid; the code is the response status to send.
    Error(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    RequestLine,
    Headers,
    FixedBody,
    ChunkSize,
    ChunkData,
    ChunkDataEnd,
    ChunkLast,
    Done,
}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub version: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub query_string: String,
    pub query_params: HashMap<String, String>,
    pub headers_complete: bool,
    pub body_complete: bool,
    pub content_length: Option<usize>,
    pub chunked: bool,
    /// First error recorded while parsing; 0 means none.
    pub status: u16,

    max_body: usize,
    pos: usize,
    phase: Phase,
    header_bytes: usize,
    chunk_remaining: usize,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Self {
            method: Method::Unknown,
            uri: String::new(),
            version: String::new(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            query_string: String::new(),
            query_params: HashMap::new(),
            headers_complete: false,
            body_complete: false,
            content_length: None,
            chunked: false,
            status: 0,
            max_body: DEFAULT_MAX_BODY_SIZE,
            pos: 0,
            phase: Phase::RequestLine,
            header_bytes: 0,
            chunk_remaining: 0,
        }
    }

    /// Number of input-buffer bytes this request has consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// Set the effective body cap. The connection refreshes this from the
    /// matched route once the target is known.
    pub fn set_max_body(&mut self, limit: usize) {
        self.max_body = limit;
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    fn fail(&mut self, code: u16) -> ParseOutcome {
        self.status = code;
        ParseOutcome::Error(code)
    }

    /// Drive the parser over `buf` (the connection's whole input buffer).
    pub fn parse(&mut self, buf: &[u8]) -> ParseOutcome {
        if self.status != 0 {
            return ParseOutcome::Error(self.status);
        }
        loop {
            match self.phase {
                Phase::RequestLine => match self.parse_request_line(buf) {
                    Step::Advance => {}
                    Step::Outcome(o) => return o,
                },
                Phase::Headers => match self.parse_header_line(buf) {
                    Step::Advance => {}
                    Step::Outcome(o) => return o,
                },
                Phase::FixedBody => match self.parse_fixed_body(buf) {
                    Step::Advance => {}
                    Step::Outcome(o) => return o,
                },
                Phase::ChunkSize => match self.parse_chunk_size(buf) {
                    Step::Advance => {}
                    Step::Outcome(o) => return o,
                },
                Phase::ChunkData => match self.parse_chunk_data(buf) {
                    Step::Advance => {}
                    Step::Outcome(o) => return o,
                },
                Phase::ChunkDataEnd => match self.expect_crlf(buf, Phase::ChunkSize, 400) {
                    Step::Advance => {}
                    Step::Outcome(o) => return o,
                },
                Phase::ChunkLast => match self.expect_crlf(buf, Phase::Done, 400) {
                    Step::Advance => {
                        self.body_complete = true;
                    }
                    Step::Outcome(o) => return o,
                },
                Phase::Done => return ParseOutcome::Complete,
            }
        }
    }

    // ---- request line ----

    fn parse_request_line(&mut self, buf: &[u8]) -> Step {
        let Some(end) = find_crlf(buf, self.pos) else {
            // A request line this long can only mean an oversized target.
            if buf.len() - self.pos > MAX_URI + 20 {
                return Step::Outcome(self.fail(414));
            }
            return Step::Outcome(ParseOutcome::NeedMore);
        };
        let line = &buf[self.pos..end];
        if line.len() > MAX_URI + 20 {
            return Step::Outcome(self.fail(414));
        }
        let Ok(line) = std::str::from_utf8(line) else {
            return Step::Outcome(self.fail(400));
        };
        // Exactly two single-space delimiters.
        if line.bytes().filter(|&b| b == b' ').count() != 2 {
            return Step::Outcome(self.fail(400));
        }
        let mut parts = line.splitn(3, ' ');
        let (method, target, version) = (
            parts.next().unwrap_or(""),
            parts.next().unwrap_or(""),
            parts.next().unwrap_or(""),
        );
        if method.is_empty() || target.is_empty() || version.is_empty() {
            return Step::Outcome(self.fail(400));
        }
        if !is_valid_http_version(version) {
            return Step::Outcome(self.fail(505));
        }
        self.version = version.to_string();
        if target.len() > MAX_URI {
            return Step::Outcome(self.fail(414));
        }
        self.method = Method::from_bytes(method.as_bytes());
        if self.method == Method::Unknown {
            return Step::Outcome(self.fail(405));
        }
        if let Some(code) = self.parse_target(target) {
            return Step::Outcome(self.fail(code));
        }

        self.header_bytes += line.len() + 2;
        self.pos = end + 2;
        self.phase = Phase::Headers;
        Step::Advance
    }

    /// Split the target into path, query and (discarded) fragment.
    /// Returns an error status on malformed targets.
    fn parse_target(&mut self, target: &str) -> Option<u16> {
        if target.contains("../") || target.contains("..\\") {
            return Some(400);
        }
        let without_fragment = match target.find('#') {
            Some(i) => &target[..i],
            None => target,
        };
        let (path, query) = match without_fragment.find('?') {
            Some(i) => (&without_fragment[..i], &without_fragment[i + 1..]),
            None => (without_fragment, ""),
        };
        if path.is_empty() || !path.starts_with('/') {
            return Some(400);
        }
        self.uri = path.to_string();
        self.query_string = query.to_string();
        for pair in query.split('&') {
            if let Some(eq) = pair.find('=') {
                let key = url_decode(&pair[..eq]);
                let value = url_decode(&pair[eq + 1..]);
                self.query_params.insert(key, value);
            }
        }
        None
    }

    // ---- header lines ----

    fn parse_header_line(&mut self, buf: &[u8]) -> Step {
        let Some(end) = find_crlf(buf, self.pos) else {
            let pending = buf.len() - self.pos;
            if pending > MAX_FIELD_BYTES {
                return Step::Outcome(self.fail(400));
            }
            if self.header_bytes + pending > MAX_HEADER_BYTES {
                return Step::Outcome(self.fail(431));
            }
            return Step::Outcome(ParseOutcome::NeedMore);
        };
        let raw = &buf[self.pos..end];
        if raw.len() > MAX_FIELD_BYTES {
            return Step::Outcome(self.fail(400));
        }
        self.header_bytes += raw.len() + 2;
        if self.header_bytes > MAX_HEADER_BYTES {
            return Step::Outcome(self.fail(431));
        }
        self.pos = end + 2;

        if raw.is_empty() {
            self.headers_complete = true;
            return self.finish_headers();
        }

        let Ok(line) = std::str::from_utf8(raw) else {
            return Step::Outcome(self.fail(400));
        };
        // A stray CR inside the line is header injection; LF cannot occur
        // because lines are CRLF-delimited.
        if line.contains('\r') {
            return Step::Outcome(self.fail(400));
        }
        let Some(colon) = line.find(':') else {
            return Step::Outcome(self.fail(400));
        };
        let name = line[..colon].trim_matches(|c: char| c.is_ascii_whitespace());
        let value = line[colon + 1..].trim_matches(|c: char| c.is_ascii_whitespace());
        if name.is_empty() {
            return Step::Outcome(self.fail(400));
        }
        let lower = name.to_ascii_lowercase();

        if matches!(lower.as_str(), "content-length" | "transfer-encoding" | "host")
            && self.headers.contains(&lower)
        {
            return Step::Outcome(self.fail(400));
        }

        match lower.as_str() {
            "content-length" => {
                if self.headers.contains("transfer-encoding") {
                    return Step::Outcome(self.fail(400));
                }
                if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                    return Step::Outcome(self.fail(400));
                }
                let Ok(n) = value.parse::<usize>() else {
                    return Step::Outcome(self.fail(400));
                };
                self.content_length = Some(n);
            }
            "transfer-encoding" => {
                if self.headers.contains("content-length") {
                    return Step::Outcome(self.fail(400));
                }
                if !value.eq_ignore_ascii_case("chunked") {
                    return Step::Outcome(self.fail(400));
                }
                self.chunked = true;
            }
            "expect" => {
                if !value.eq_ignore_ascii_case("100-continue") {
                    return Step::Outcome(self.fail(417));
                }
            }
            _ => {}
        }
        self.headers.insert(&lower, value.to_string());
        Step::Advance
    }

    fn finish_headers(&mut self) -> Step {
        if self.version == "HTTP/1.1" {
            match self.headers.get("host") {
                Some(host) if !host.is_empty() => {}
                _ => return Step::Outcome(self.fail(400)),
            }
        }
        if self.chunked {
            self.phase = Phase::ChunkSize;
        } else if matches!(self.content_length, Some(n) if n > 0) {
            self.phase = Phase::FixedBody;
        } else {
            self.body_complete = true;
            self.phase = Phase::Done;
        }
        Step::Advance
    }

    // ---- body ----

    fn parse_fixed_body(&mut self, buf: &[u8]) -> Step {
        let declared = self.content_length.unwrap_or(0);
        if declared > self.max_body {
            return Step::Outcome(self.fail(413));
        }
        let need = declared - self.body.len();
        let avail = buf.len() - self.pos;
        let take = need.min(avail);
        self.body.extend_from_slice(&buf[self.pos..self.pos + take]);
        self.pos += take;
        if self.body.len() == declared {
            self.body_complete = true;
            self.phase = Phase::Done;
            Step::Advance
        } else {
            Step::Outcome(ParseOutcome::NeedMore)
        }
    }

    fn parse_chunk_size(&mut self, buf: &[u8]) -> Step {
        let Some(end) = find_crlf(buf, self.pos) else {
            if buf.len() - self.pos > MAX_FIELD_BYTES {
                return Step::Outcome(self.fail(400));
            }
            return Step::Outcome(ParseOutcome::NeedMore);
        };
        let Ok(line) = std::str::from_utf8(&buf[self.pos..end]) else {
            return Step::Outcome(self.fail(400));
        };
        let line = line.trim();
        let mut size: usize = 0;
        let mut digits = 0;
        for b in line.bytes() {
            let Some(v) = hex_value(b) else { break };
            size = match size.checked_mul(16).and_then(|s| s.checked_add(v as usize)) {
                Some(s) => s,
                None => return Step::Outcome(self.fail(400)),
            };
            digits += 1;
        }
        if digits == 0 {
            return Step::Outcome(self.fail(400));
        }
        self.pos = end + 2;
        if size == 0 {
            self.phase = Phase::ChunkLast;
        } else {
            if self.body.len() + size > self.max_body {
                return Step::Outcome(self.fail(413));
            }
            self.chunk_remaining = size;
            self.phase = Phase::ChunkData;
        }
        Step::Advance
    }

    fn parse_chunk_data(&mut self, buf: &[u8]) -> Step {
        let avail = buf.len() - self.pos;
        let take = self.chunk_remaining.min(avail);
        self.body.extend_from_slice(&buf[self.pos..self.pos + take]);
        self.pos += take;
        self.chunk_remaining -= take;
        if self.chunk_remaining == 0 {
            self.phase = Phase::ChunkDataEnd;
            Step::Advance
        } else {
            Step::Outcome(ParseOutcome::NeedMore)
        }
    }

    /// Require an exact CRLF at the cursor. After chunk data this is where a
    /// declared-size/measured-size mismatch surfaces; after the zero chunk it
    /// rejects trailers.
    fn expect_crlf(&mut self, buf: &[u8], next: Phase, err: u16) -> Step {
        if buf.len() - self.pos < 2 {
            return Step::Outcome(ParseOutcome::NeedMore);
        }
        if &buf[self.pos..self.pos + 2] != b"\r\n" {
            return Step::Outcome(self.fail(err));
        }
        self.pos += 2;
        self.phase = next;
        Step::Advance
    }
}

enum Step {
    Advance,
    Outcome(ParseOutcome),
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn is_valid_http_version(v: &str) -> bool {
    let b = v.as_bytes();
    b.len() == 8
        && &b[..5] == b"HTTP/"
        && b[5].is_ascii_digit()
        && b[6] == b'.'
        && b[7].is_ascii_digit()
}

/// Percent- and plus-decode one query component.
pub fn url_decode(s: &str) -> String {
    let plus_decoded = s.replace('+', " ");
    percent_decode_str(&plus_decoded)
        .decode_utf8_lossy()
        .into_owned()
}
