// src/syscalls.rs
//
// Thin wrappers over the raw socket, pipe and epoll syscalls. Everything
// network-facing runs non-blocking; helpers report would-block and peer-close
// conditions instead of failing, and never abort the process.
use crate::error::{ServerError, ServerResult};
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::ptr;

// ---- Socket operations ----

/// Create a non-blocking IPv4 listener on `0.0.0.0:port` with SO_REUSEADDR.
pub fn create_listen_socket(port: u16) -> ServerResult<c_int> {
    unsafe {
        let fd = libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
            0,
        );
        if fd < 0 {
            return Err(bind_error(port));
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = bind_error(port);
            libc::close(fd);
            return Err(err);
        }

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = bind_error(port);
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = bind_error(port);
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

fn bind_error(port: u16) -> ServerError {
    ServerError::Bind {
        port,
        source: io::Error::last_os_error(),
    }
}

/// Accept one pending connection, already in non-blocking mode.
/// `Ok(None)` means the accept queue is drained.
pub fn accept_connection(listen_fd: c_int) -> io::Result<Option<c_int>> {
    unsafe {
        let fd = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(err),
            }
        } else {
            Ok(Some(fd))
        }
    }
}

/// Put an arbitrary descriptor into non-blocking mode.
pub fn set_nonblocking(fd: c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Non-blocking read/write helpers ----

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were placed into the buffer.
    Data(usize),
    /// Nothing available right now; wait for readiness.
    WouldBlock,
    /// The peer closed its end.
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Wrote(usize),
    WouldBlock,
}

/// Read into `buf`. Fatal errors come back as `Err`; would-block and
/// peer-close are ordinary outcomes.
pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
                    Ok(ReadOutcome::WouldBlock)
                }
                _ => Err(err),
            }
        } else if res == 0 {
            Ok(ReadOutcome::Closed)
        } else {
            Ok(ReadOutcome::Data(res as usize))
        }
    }
}

/// Write from `buf`. With SIGPIPE ignored, a half-closed peer surfaces as a
/// recoverable `Err(EPIPE)` rather than process death.
pub fn write_nonblocking(fd: c_int, buf: &[u8]) -> io::Result<WriteOutcome> {
    unsafe {
        let res = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
                    Ok(WriteOutcome::WouldBlock)
                }
                _ => Err(err),
            }
        } else {
            Ok(WriteOutcome::Wrote(res as usize))
        }
    }
}

// ---- Pipes (CGI stdin/stdout) ----

/// Create a Unix pipe. Returns (read_fd, write_fd). Both ends start
/// blocking; the CGI executor flips only the end it polls.
pub fn create_pipe() -> io::Result<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok((fds[0], fds[1]))
}

// ---- Epoll ----

pub use libc::epoll_event;
pub const EPOLLIN: i32 = libc::EPOLLIN;
pub const EPOLLOUT: i32 = libc::EPOLLOUT;
pub const EPOLLERR: i32 = libc::EPOLLERR;
pub const EPOLLHUP: i32 = libc::EPOLLHUP;

/// Edge-triggered epoll instance. All registrations carry EPOLLET; readers
/// and writers must drain until would-block.
pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { fd })
        }
    }

    pub fn add(&self, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
    }

    pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
    }

    fn ctl(&self, op: c_int, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
        let mut event = epoll_event {
            events: (interests | libc::EPOLLET) as u32,
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err);
            }
            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        close_fd(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_read_end_reports_wouldblock_when_empty() {
        let (r, w) = create_pipe().unwrap();
        set_nonblocking(r).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(read_nonblocking(r, &mut buf).unwrap(), ReadOutcome::WouldBlock);
        assert_eq!(
            write_nonblocking(w, b"ping").unwrap(),
            WriteOutcome::Wrote(4)
        );
        assert_eq!(read_nonblocking(r, &mut buf).unwrap(), ReadOutcome::Data(4));
        assert_eq!(&buf[..4], b"ping");
        close_fd(w);
        assert_eq!(read_nonblocking(r, &mut buf).unwrap(), ReadOutcome::Closed);
        close_fd(r);
    }

    #[test]
    fn epoll_reports_pipe_readability() {
        let epoll = Epoll::new().unwrap();
        let (r, w) = create_pipe().unwrap();
        epoll.add(r, 7, EPOLLIN).unwrap();

        let mut events = vec![epoll_event { events: 0, u64: 0 }; 8];
        assert_eq!(epoll.wait(&mut events, 0).unwrap(), 0);

        assert_eq!(
            write_nonblocking(w, b"x").unwrap(),
            WriteOutcome::Wrote(1)
        );
        let n = epoll.wait(&mut events, 100).unwrap();
        assert_eq!(n, 1);
        // Copy out of the packed struct before asserting.
        let token = events[0].u64;
        let flags = events[0].events;
        assert_eq!(token, 7);
        assert_ne!(flags & EPOLLIN as u32, 0);

        epoll.delete(r).unwrap();
        close_fd(r);
        close_fd(w);
    }
}
