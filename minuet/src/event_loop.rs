// src/event_loop.rs
//
// The single-threaded readiness loop: accept, read, parse, process, write,
// close. Responses for one connection fully drain before the next request on
// it is parsed; between connections there is no ordering. A periodic sweep
// enforces every timeout.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::conn::{
    ClientState, Connection, MAX_CONNECTION_TIME_SECS, MAX_REQUESTS_PER_CONNECTION,
};
use crate::error::ServerResult;
use crate::parser::ParseOutcome;
use crate::router::Router;
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, Epoll, ReadOutcome, WriteOutcome, epoll_event,
};

pub const SWEEP_INTERVAL_SECS: u64 = 5;
const MAX_EVENTS: usize = 1024;
const READ_CHUNK: usize = 8192;

pub struct Listener {
    pub fd: i32,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Keep,
    Close,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct EventLoop {
    epoll: Epoll,
    listeners: Vec<Listener>,
    conns: HashMap<i32, Connection>,
    router: Router,
    running: Arc<AtomicBool>,
}

impl EventLoop {
    pub fn new(
        listeners: Vec<Listener>,
        router: Router,
        running: Arc<AtomicBool>,
    ) -> ServerResult<Self> {
        let epoll = Epoll::new()?;
        for listener in &listeners {
            epoll.add(listener.fd, listener.fd as u64, EPOLLIN)?;
        }
        Ok(Self {
            epoll,
            listeners,
            conns: HashMap::new(),
            router,
            running,
        })
    }

    pub fn run(&mut self) -> ServerResult<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let mut last_sweep = unix_now();
        while self.running.load(Ordering::Acquire) {
            let n = self.epoll.wait(&mut events, 1000)?;
            let now = unix_now();
            for i in 0..n {
                let fd = events[i].u64 as i32;
                let flags = events[i].events;
                if let Some(port) = self.listener_port(fd) {
                    self.accept_all(fd, port, now);
                    continue;
                }
                if flags & (EPOLLHUP | EPOLLERR) as u32 != 0 {
                    self.close(fd);
                    continue;
                }
                let readable = flags & EPOLLIN as u32 != 0;
                let writable = flags & EPOLLOUT as u32 != 0;
                self.handle_client_event(fd, readable, writable, now);
            }
            if now.saturating_sub(last_sweep) >= SWEEP_INTERVAL_SECS {
                self.sweep(now);
                last_sweep = now;
            }
        }
        self.shutdown();
        Ok(())
    }

    fn listener_port(&self, fd: i32) -> Option<u16> {
        self.listeners
            .iter()
            .find(|l| l.fd == fd)
            .map(|l| l.port)
    }

    /// Drain the accept queue (edge-triggered: one event may cover several
    /// pending connections).
    fn accept_all(&mut self, listen_fd: i32, port: u16, now: u64) {
        loop {
            match syscalls::accept_connection(listen_fd) {
                Ok(Some(fd)) => {
                    if self.epoll.add(fd, fd as u64, EPOLLIN).is_err() {
                        syscalls::close_fd(fd);
                        continue;
                    }
                    self.conns.insert(fd, Connection::new(fd, port, now));
                    debug!(fd, port, "accepted connection");
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(port, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn handle_client_event(&mut self, fd: i32, readable: bool, writable: bool, now: u64) {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return;
        };
        conn.touch(now);
        let mut action = Action::Keep;
        if readable
            && matches!(
                conn.state,
                ClientState::ReadingHeaders | ClientState::ReadingBody
            )
        {
            action = read_and_parse(&self.router, &self.epoll, conn, now);
        }
        if action == Action::Keep && writable && conn.state == ClientState::WritingResponse {
            action = write_response(&self.router, &self.epoll, conn, now);
        }
        if action == Action::Close {
            self.close(fd);
        }
    }

    /// Unregister, close and forget a connection. Every exit path funnels
    /// through here.
    fn close(&mut self, fd: i32) {
        let _ = self.epoll.delete(fd);
        syscalls::close_fd(fd);
        if self.conns.remove(&fd).is_some() {
            debug!(fd, "closed connection");
        }
    }

    /// Walk all connections and enforce idle, keep-alive and lifetime
    /// budgets.
    fn sweep(&mut self, now: u64) {
        let mut stale = Vec::new();
        for (fd, conn) in &self.conns {
            let idle = now.saturating_sub(conn.last_active);
            let lifetime = now.saturating_sub(conn.started_at);
            if idle > conn.idle_limit() {
                debug!(fd, idle, "sweep: idle timeout");
                stale.push(*fd);
            } else if conn.state != ClientState::WritingResponse
                && lifetime > MAX_CONNECTION_TIME_SECS
            {
                debug!(fd, lifetime, "sweep: connection lifetime exceeded");
                stale.push(*fd);
            }
        }
        for fd in stale {
            self.close(fd);
        }
    }

    fn shutdown(&mut self) {
        info!(connections = self.conns.len(), "event loop stopping");
        let fds: Vec<i32> = self.conns.keys().copied().collect();
        for fd in fds {
            self.close(fd);
        }
        for listener in &self.listeners {
            let _ = self.epoll.delete(listener.fd);
            syscalls::close_fd(listener.fd);
        }
        self.listeners.clear();
    }
}

fn read_and_parse(router: &Router, epoll: &Epoll, conn: &mut Connection, now: u64) -> Action {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match syscalls::read_nonblocking(conn.fd, &mut buf) {
            Ok(ReadOutcome::Data(n)) => conn.input.extend_from_slice(&buf[..n]),
            Ok(ReadOutcome::WouldBlock) => break,
            Ok(ReadOutcome::Closed) => {
                // EOF mid-request: close silently, no response.
                debug!(fd = conn.fd, "peer closed");
                return Action::Close;
            }
            Err(e) => {
                debug!(fd = conn.fd, error = %e, "read failed");
                return Action::Close;
            }
        }
    }
    match drive_parser(router, conn) {
        ParseOutcome::NeedMore => {
            conn.state = if conn.request.headers_complete {
                ClientState::ReadingBody
            } else {
                ClientState::ReadingHeaders
            };
            Action::Keep
        }
        ParseOutcome::Complete | ParseOutcome::Error(_) => process(router, epoll, conn, now),
    }
}

/// Run the parser over the connection's buffer. Once the target is known the
/// body cap is refreshed from the matched route before body bytes are
/// consumed.
fn drive_parser(router: &Router, conn: &mut Connection) -> ParseOutcome {
    if !conn.request.headers_complete {
        if let Some(config) = router.server_for_port(conn.port) {
            conn.request.set_max_body(config.max_body_size);
        }
    }
    let mut outcome = conn.request.parse(&conn.input);
    if conn.request.headers_complete
        && !conn.request.body_complete
        && !matches!(outcome, ParseOutcome::Error(_))
    {
        if let Some(config) = router.server_for_port(conn.port) {
            conn.request
                .set_max_body(Router::effective_max_body(config, &conn.request.uri));
        }
        outcome = conn.request.parse(&conn.input);
    }
    outcome
}

/// Route the request, serialize the response, flip to write interest and
/// push what the socket will take right away.
fn process(router: &Router, epoll: &Epoll, conn: &mut Connection, now: u64) -> Action {
    conn.state = ClientState::Processing;
    let parser_error = conn.request.status != 0;
    let mut response = router.dispatch(conn.port, &conn.request);
    // A connection that saw a malformed request is never reused.
    let can_keep = !parser_error
        && conn.decide_keep_alive()
        && conn.requests_handled + 1 < MAX_REQUESTS_PER_CONNECTION
        && now.saturating_sub(conn.started_at) <= MAX_CONNECTION_TIME_SECS;
    response.set_header("Connection", if can_keep { "keep-alive" } else { "close" });
    conn.keep_alive = can_keep;
    conn.write_buf = response.wire().to_vec();
    conn.write_pos = 0;
    debug!(
        fd = conn.fd,
        status = response.status(),
        bytes = conn.write_buf.len(),
        "response ready"
    );
    conn.response = response;
    conn.state = ClientState::WritingResponse;
    if epoll.modify(conn.fd, conn.fd as u64, EPOLLOUT).is_err() {
        conn.state = ClientState::Error;
        return Action::Close;
    }
    write_response(router, epoll, conn, now)
}

fn write_response(router: &Router, epoll: &Epoll, conn: &mut Connection, now: u64) -> Action {
    while conn.write_pos < conn.write_buf.len() {
        match syscalls::write_nonblocking(conn.fd, &conn.write_buf[conn.write_pos..]) {
            Ok(WriteOutcome::Wrote(n)) => conn.write_pos += n,
            Ok(WriteOutcome::WouldBlock) => return Action::Keep,
            Err(e) => {
                // Mid-response network failure: close silently.
                debug!(fd = conn.fd, error = %e, "write failed");
                return Action::Close;
            }
        }
    }
    finish_response(router, epoll, conn, now)
}

/// The response has fully drained: either reset for the next request on a
/// persistent connection or close.
fn finish_response(router: &Router, epoll: &Epoll, conn: &mut Connection, now: u64) -> Action {
    conn.state = ClientState::Done;
    conn.requests_handled += 1;
    if !conn.keep_alive || !conn.may_serve_another(now) {
        return Action::Close;
    }
    conn.reset_for_next_request();
    if epoll.modify(conn.fd, conn.fd as u64, EPOLLIN).is_err() {
        return Action::Close;
    }
    if conn.input.is_empty() {
        return Action::Keep;
    }
    // Bytes of the next request arrived while this one was in flight.
    match drive_parser(router, conn) {
        ParseOutcome::NeedMore => {
            conn.state = if conn.request.headers_complete {
                ClientState::ReadingBody
            } else {
                ClientState::ReadingHeaders
            };
            Action::Keep
        }
        ParseOutcome::Complete | ParseOutcome::Error(_) => process(router, epoll, conn, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::CLIENT_TIMEOUT_SECS;

    fn empty_loop() -> EventLoop {
        EventLoop::new(
            Vec::new(),
            Router::new(Vec::new()),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    #[test]
    fn run_exits_when_not_running() {
        let mut event_loop = empty_loop();
        event_loop.run().unwrap();
    }

    #[test]
    fn sweep_closes_idle_connections() {
        let mut event_loop = empty_loop();
        let (r, w) = syscalls::create_pipe().unwrap();
        let now = unix_now();
        event_loop.epoll.add(r, r as u64, EPOLLIN).unwrap();
        let mut conn = Connection::new(r, 8080, now);
        conn.last_active = now.saturating_sub(CLIENT_TIMEOUT_SECS + 1);
        event_loop.conns.insert(r, conn);

        event_loop.sweep(now);
        assert!(event_loop.conns.is_empty());
        syscalls::close_fd(w);
    }

    #[test]
    fn sweep_keeps_fresh_connections() {
        let mut event_loop = empty_loop();
        let (r, w) = syscalls::create_pipe().unwrap();
        let now = unix_now();
        event_loop.conns.insert(r, Connection::new(r, 8080, now));

        event_loop.sweep(now);
        assert_eq!(event_loop.conns.len(), 1);
        event_loop.close(r);
        syscalls::close_fd(w);
    }
}
