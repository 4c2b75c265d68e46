// src/cgi.rs
//
// CGI subprocess execution: environment assembly, fork/pipe/exec, a bounded
// read of the child's stdout, and parsing of its header block. The child is
// the only parallelism in the server; it always gets reaped, on success and
// on timeout alike.
use std::ffi::CString;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use libc::c_void;
use tracing::{debug, warn};

use crate::config::{RouteConfig, ServerConfig};
use crate::parser::Request;
use crate::response::{Response, SERVER_SOFTWARE};
use crate::syscalls::{self, ReadOutcome};

/// Wall-clock budget for one CGI child.
pub const CGI_TIMEOUT: Duration = Duration::from_secs(30);

/// Interpreter fallback table, probed in order.
const INTERPRETERS: &[(&str, &[&str])] = &[
    (
        ".php",
        &[
            "/usr/bin/php-cgi",
            "/usr/bin/php",
            "/usr/local/bin/php-cgi",
            "/usr/local/bin/php",
        ],
    ),
    (
        ".py",
        &["/usr/bin/python3", "/usr/bin/python", "/usr/local/bin/python3"],
    ),
    (".pl", &["/usr/bin/perl", "/usr/local/bin/perl"]),
    (".rb", &["/usr/bin/ruby", "/usr/local/bin/ruby"]),
    (".sh", &["/bin/bash", "/usr/bin/bash"]),
];

/// Extension of the final path segment, with its leading dot.
pub fn uri_extension(uri: &str) -> Option<&str> {
    let last = uri.rsplit('/').next().unwrap_or("");
    match last.rfind('.') {
        Some(i) if i + 1 < last.len() => Some(&last[i..]),
        _ => None,
    }
}

pub fn is_cgi_request(uri: &str, route: &RouteConfig) -> bool {
    match uri_extension(uri) {
        Some(ext) => route.cgi_extensions.iter().any(|e| e == ext),
        None => false,
    }
}

pub fn find_interpreter(extension: &str) -> Option<&'static str> {
    let (_, candidates) = INTERPRETERS.iter().find(|(ext, _)| *ext == extension)?;
    candidates
        .iter()
        .copied()
        .find(|path| Path::new(path).exists())
}

/// Strip anything a shell could get creative with. Keeps
/// `[A-Za-z0-9 _\-./:=,]`.
pub fn sanitize_env(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, ' ' | '_' | '-' | '.' | '/' | ':' | '=' | ',')
        })
        .collect()
}

/// The CGI/1.1 environment. Only these variables reach the child; its
/// environment is otherwise empty.
fn build_env(
    config: &ServerConfig,
    route: &RouteConfig,
    request: &Request,
    port: u16,
    script_path: &str,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = vec![
        ("REQUEST_METHOD".into(), request.method.as_str().into()),
        ("REQUEST_URI".into(), sanitize_env(&request.uri)),
        ("QUERY_STRING".into(), sanitize_env(&request.query_string)),
        ("SERVER_NAME".into(), sanitize_env(&config.server_name)),
        ("SERVER_PORT".into(), port.to_string()),
        ("SERVER_PROTOCOL".into(), "HTTP/1.1".into()),
        ("SERVER_SOFTWARE".into(), SERVER_SOFTWARE.into()),
        ("GATEWAY_INTERFACE".into(), "CGI/1.1".into()),
        ("SCRIPT_NAME".into(), sanitize_env(&request.uri)),
        ("SCRIPT_FILENAME".into(), script_path.into()),
        ("PATH_INFO".into(), String::new()),
        ("PATH_TRANSLATED".into(), String::new()),
        ("DOCUMENT_ROOT".into(), route.root.clone()),
        // Required by php-cgi.
        ("REDIRECT_STATUS".into(), "200".into()),
    ];

    let content_type = request.header("content-type").unwrap_or("");
    if !content_type.is_empty() {
        env.push(("CONTENT_TYPE".into(), sanitize_env(content_type)));
    }
    let content_length = match request.header("content-length") {
        Some(v) => sanitize_env(v),
        None => request.body.len().to_string(),
    };
    env.push(("CONTENT_LENGTH".into(), content_length));

    // Request header X-Y becomes HTTP_X_Y.
    for (name, value) in request.headers.iter() {
        let mut env_name = String::with_capacity(5 + name.len());
        env_name.push_str("HTTP_");
        for c in name.chars() {
            env_name.push(match c {
                '-' => '_',
                other => other.to_ascii_uppercase(),
            });
        }
        env.push((env_name, sanitize_env(value)));
    }
    env
}

/// Run the script for `request` and turn its stdout into a response.
pub fn execute(
    config: &ServerConfig,
    route: &RouteConfig,
    request: &Request,
    port: u16,
) -> Response {
    execute_with_timeout(config, route, request, port, CGI_TIMEOUT)
}

fn execute_with_timeout(
    config: &ServerConfig,
    route: &RouteConfig,
    request: &Request,
    port: u16,
    timeout: Duration,
) -> Response {
    let script_path = format!("{}{}", route.root, request.uri);
    if fs::File::open(&script_path).is_err() {
        return Response::error_response(404, "Script not found");
    }
    let Some(extension) = uri_extension(&request.uri) else {
        return Response::error_response(501, "No CGI interpreter");
    };
    let Some(interpreter) = find_interpreter(extension) else {
        return Response::error_response(501, "No CGI interpreter");
    };

    // Everything the child needs is prepared before fork; no allocation
    // happens between fork and exec.
    let env_pairs = build_env(config, route, request, port, &script_path);
    let Ok(interp_c) = CString::new(interpreter) else {
        return Response::error_response(500, "CGI setup failed");
    };
    let Ok(script_c) = CString::new(script_path.as_str()) else {
        return Response::error_response(500, "CGI setup failed");
    };
    let env_c: Vec<CString> = env_pairs
        .iter()
        .filter_map(|(k, v)| CString::new(format!("{}={}", k, v)).ok())
        .collect();
    let mut envp: Vec<*const libc::c_char> = env_c.iter().map(|s| s.as_ptr()).collect();
    envp.push(std::ptr::null());
    let argv = [interp_c.as_ptr(), script_c.as_ptr(), std::ptr::null()];

    let (stdin_r, stdin_w) = match syscalls::create_pipe() {
        Ok(p) => p,
        Err(_) => return Response::error_response(500, "CGI setup failed"),
    };
    let (stdout_r, stdout_w) = match syscalls::create_pipe() {
        Ok(p) => p,
        Err(_) => {
            syscalls::close_fd(stdin_r);
            syscalls::close_fd(stdin_w);
            return Response::error_response(500, "CGI setup failed");
        }
    };

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        for fd in [stdin_r, stdin_w, stdout_r, stdout_w] {
            syscalls::close_fd(fd);
        }
        return Response::error_response(500, "CGI fork failed");
    }

    if pid == 0 {
        // Child: wire the pipes to stdin/stdout and exec.
        unsafe {
            libc::dup2(stdin_r, libc::STDIN_FILENO);
            libc::dup2(stdout_w, libc::STDOUT_FILENO);
            for fd in [stdin_r, stdin_w, stdout_r, stdout_w] {
                libc::close(fd);
            }
            libc::execve(interp_c.as_ptr(), argv.as_ptr(), envp.as_ptr());
            libc::_exit(1);
        }
    }

    // Parent: unused pipe ends go first, or the child never sees EOF.
    syscalls::close_fd(stdin_r);
    syscalls::close_fd(stdout_w);

    write_body_to_child(stdin_w, &request.body);
    syscalls::close_fd(stdin_w);

    let output = read_child_output(stdout_r, pid, timeout);
    syscalls::close_fd(stdout_r);
    reap(pid);

    match output {
        Some(bytes) if !bytes.is_empty() => parse_cgi_output(&bytes),
        _ => Response::error_response(500, "CGI produced no output"),
    }
}

fn write_body_to_child(fd: i32, body: &[u8]) {
    let mut written = 0;
    while written < body.len() {
        let res = unsafe {
            libc::write(
                fd,
                body[written..].as_ptr() as *const c_void,
                body.len() - written,
            )
        };
        if res < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            // EPIPE here means the script never reads stdin.
            debug!(error = %err, "CGI stdin write stopped");
            break;
        }
        written += res as usize;
    }
}

/// Read the child's stdout with a readiness wait per iteration, bounded by
/// the wall-clock timeout. On timeout the child gets SIGTERM; whatever was
/// collected is still returned.
fn read_child_output(fd: i32, pid: libc::pid_t, timeout: Duration) -> Option<Vec<u8>> {
    if syscalls::set_nonblocking(fd).is_err() {
        unsafe { libc::kill(pid, libc::SIGTERM) };
        return None;
    }
    let deadline = Instant::now() + timeout;
    let mut output = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let now = Instant::now();
        if now >= deadline {
            warn!("CGI timeout: terminating child (timeouts collapse to 500 when no output)");
            unsafe { libc::kill(pid, libc::SIGTERM) };
            return Some(output);
        }
        let remaining_ms = (deadline - now).as_millis().min(i32::MAX as u128) as i32;
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, remaining_ms.max(1)) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            unsafe { libc::kill(pid, libc::SIGTERM) };
            return Some(output);
        }
        if ready == 0 {
            continue; // deadline check at the top of the loop fires next
        }
        match syscalls::read_nonblocking(fd, &mut buf) {
            Ok(ReadOutcome::Data(n)) => output.extend_from_slice(&buf[..n]),
            Ok(ReadOutcome::WouldBlock) => continue,
            Ok(ReadOutcome::Closed) => return Some(output),
            Err(e) => {
                debug!(error = %e, "CGI stdout read failed");
                return Some(output);
            }
        }
    }
}

fn reap(pid: libc::pid_t) {
    let mut status = 0;
    unsafe {
        libc::waitpid(pid, &mut status, 0);
    }
}

/// Split the script output into header block and body. `Status:` overrides
/// the response status; everything else becomes a header. No header block at
/// all means the whole output is an HTML body.
pub fn parse_cgi_output(output: &[u8]) -> Response {
    let (header_block, body) = match find(output, b"\r\n\r\n") {
        Some(i) => (&output[..i], &output[i + 4..]),
        None => match find(output, b"\n\n") {
            Some(i) => (&output[..i], &output[i + 2..]),
            None => {
                let mut response = Response::new();
                response.set_header("Content-Type", "text/html");
                response.set_body(output.to_vec());
                return response;
            }
        },
    };

    let mut response = Response::new();
    if let Ok(headers) = std::str::from_utf8(header_block) {
        for line in headers.split('\n') {
            let line = line.trim_end_matches('\r').trim();
            if line.is_empty() {
                continue;
            }
            let Some(colon) = line.find(':') else { continue };
            let name = line[..colon].trim();
            let value = line[colon + 1..].trim();
            if name.eq_ignore_ascii_case("status") {
                let code: u16 = value
                    .split_whitespace()
                    .next()
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(200);
                response.set_status(code);
            } else {
                response.set_header(name, value);
            }
        }
    }
    response.set_body(body.to_vec());
    response
}

fn find(data: &[u8], needle: &[u8]) -> Option<usize> {
    data.windows(needle.len()).position(|w| w == needle)
}
