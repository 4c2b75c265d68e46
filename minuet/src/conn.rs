// src/conn.rs
//
// Per-client connection record and its state machine data. One record per
// descriptor holds everything: buffers, parser, response, offsets, timers.
use crate::parser::Request;
use crate::response::Response;

pub const CLIENT_TIMEOUT_SECS: u64 = 30;
pub const KEEPALIVE_TIMEOUT_SECS: u64 = 60;
pub const MAX_CONNECTION_TIME_SECS: u64 = 300;
pub const MAX_REQUESTS_PER_CONNECTION: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    ReadingHeaders,
    ReadingBody,
    Processing,
    WritingResponse,
    Done,
    Error,
}

pub struct Connection {
    pub fd: i32,
    /// Port of the listener that accepted this client; selects the virtual
    /// server.
    pub port: u16,
    pub state: ClientState,
    pub last_active: u64,
    pub started_at: u64,
    pub requests_handled: u32,
    pub input: Vec<u8>,
    pub request: Request,
    pub response: Response,
    pub write_buf: Vec<u8>,
    pub write_pos: usize,
    pub keep_alive: bool,
}

impl Connection {
    pub fn new(fd: i32, port: u16, now: u64) -> Self {
        Self {
            fd,
            port,
            state: ClientState::ReadingHeaders,
            last_active: now,
            started_at: now,
            requests_handled: 0,
            input: Vec::new(),
            request: Request::new(),
            response: Response::new(),
            write_buf: Vec::new(),
            write_pos: 0,
            keep_alive: false,
        }
    }

    pub fn touch(&mut self, now: u64) {
        self.last_active = now;
    }

    /// Keep-alive per the request: HTTP/1.1 unless `Connection: close`,
    /// HTTP/1.0 only with `Connection: keep-alive`.
    pub fn decide_keep_alive(&self) -> bool {
        let connection = self.request.header("connection").unwrap_or("");
        match self.request.version.as_str() {
            "HTTP/1.1" => !connection.eq_ignore_ascii_case("close"),
            "HTTP/1.0" => connection.eq_ignore_ascii_case("keep-alive"),
            _ => false,
        }
    }

    /// Whether another request may be served once the current response has
    /// drained.
    pub fn may_serve_another(&self, now: u64) -> bool {
        self.requests_handled < MAX_REQUESTS_PER_CONNECTION
            && now.saturating_sub(self.started_at) <= MAX_CONNECTION_TIME_SECS
    }

    /// Idle budget for the sweep: a connection parked between requests gets
    /// the keep-alive timeout, anything mid-cycle the client timeout.
    pub fn idle_limit(&self) -> u64 {
        if self.requests_handled > 0 && self.state == ClientState::ReadingHeaders {
            KEEPALIVE_TIMEOUT_SECS
        } else {
            CLIENT_TIMEOUT_SECS
        }
    }

    /// Prepare for the next request on a persistent connection. Bytes the
    /// previous request consumed leave the buffer; anything already received
    /// for the next request stays.
    pub fn reset_for_next_request(&mut self) {
        let consumed = self.request.consumed();
        self.input.drain(..consumed.min(self.input.len()));
        self.request = Request::new();
        self.response = Response::new();
        self.write_buf.clear();
        self.write_pos = 0;
        self.state = ClientState::ReadingHeaders;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ParseOutcome;

    fn conn_with(raw: &[u8]) -> Connection {
        let mut conn = Connection::new(5, 8080, 1000);
        conn.input.extend_from_slice(raw);
        let outcome = conn.request.parse(&conn.input);
        assert!(matches!(
            outcome,
            ParseOutcome::Complete | ParseOutcome::Error(_)
        ));
        conn
    }

    #[test]
    fn keep_alive_rules() {
        let conn = conn_with(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(conn.decide_keep_alive());

        let conn = conn_with(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
        assert!(!conn.decide_keep_alive());

        let conn = conn_with(b"GET / HTTP/1.0\r\n\r\n");
        assert!(!conn.decide_keep_alive());

        let conn = conn_with(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert!(conn.decide_keep_alive());

        let conn = conn_with(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: Close\r\n\r\n");
        assert!(!conn.decide_keep_alive());
    }

    #[test]
    fn reset_keeps_unconsumed_bytes() {
        let mut conn = conn_with(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nGET /second HTTP/1.1\r\n");
        conn.reset_for_next_request();
        assert_eq!(conn.input, b"GET /second HTTP/1.1\r\n");
        assert_eq!(conn.state, ClientState::ReadingHeaders);
        assert_eq!(conn.request.consumed(), 0);
        assert!(conn.write_buf.is_empty());
    }

    #[test]
    fn request_budget_enforced() {
        let mut conn = Connection::new(5, 8080, 1000);
        assert!(conn.may_serve_another(1000));
        conn.requests_handled = MAX_REQUESTS_PER_CONNECTION;
        assert!(!conn.may_serve_another(1000));

        conn.requests_handled = 1;
        assert!(conn.may_serve_another(1000 + MAX_CONNECTION_TIME_SECS));
        assert!(!conn.may_serve_another(1001 + MAX_CONNECTION_TIME_SECS));
    }

    #[test]
    fn idle_limits_by_phase() {
        let mut conn = Connection::new(5, 8080, 1000);
        assert_eq!(conn.idle_limit(), CLIENT_TIMEOUT_SECS);
        conn.requests_handled = 1;
        assert_eq!(conn.idle_limit(), KEEPALIVE_TIMEOUT_SECS);
        conn.state = ClientState::WritingResponse;
        assert_eq!(conn.idle_limit(), CLIENT_TIMEOUT_SECS);
    }
}
