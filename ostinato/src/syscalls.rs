// src/syscalls.rs
//
// Thin wrappers over the libc calls the toolkit needs: nonblocking TCP
// sockets, epoll in edge-triggered one-shot mode, eventfd wakeups and
// timerfd timers. Everything here is Linux-specific; all fds are created
// nonblocking and close-on-exec.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::ptr;
use std::time::Duration;

use libc::{c_int, c_void, socklen_t};

pub type RawFd = c_int;

// ---- Socket operations ----

/// Create a nonblocking TCP listener bound to `host:port`.
///
/// TCP_NODELAY is set on the listener so accepted sockets inherit it,
/// saving a per-accept setsockopt.
pub fn create_listen_socket(host: &str, port: u16) -> io::Result<RawFd> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{e}")))?;

    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
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
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        if let Err(err) = bind_addr(fd, &addr) {
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

/// Port the kernel actually bound (needed when binding port 0).
pub fn local_port(fd: RawFd) -> io::Result<u16> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin: &libc::sockaddr_in = &*(&storage as *const _ as *const libc::sockaddr_in);
                Ok(u16::from_be(sin.sin_port))
            }
            libc::AF_INET6 => {
                let sin6: &libc::sockaddr_in6 =
                    &*(&storage as *const _ as *const libc::sockaddr_in6);
                Ok(u16::from_be(sin6.sin6_port))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unknown address family",
            )),
        }
    }
}

fn bind_addr(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let len = socket_addr_to_sockaddr(addr, &mut storage);
        if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Fill a sockaddr_storage from a SocketAddr; returns the address length.
pub fn socket_addr_to_sockaddr(addr: &SocketAddr, storage: &mut libc::sockaddr_storage) -> socklen_t {
    match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                ptr::copy_nonoverlapping(
                    &sin as *const _ as *const u8,
                    storage as *mut _ as *mut u8,
                    mem::size_of::<libc::sockaddr_in>(),
                );
            }
            mem::size_of::<libc::sockaddr_in>() as socklen_t
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                ptr::copy_nonoverlapping(
                    &sin6 as *const _ as *const u8,
                    storage as *mut _ as *mut u8,
                    mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            mem::size_of::<libc::sockaddr_in6>() as socklen_t
        }
    }
}

/// Accept one connection. Returns `None` on EAGAIN (queue drained).
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<RawFd>> {
    unsafe {
        let fd = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            Ok(Some(fd))
        }
    }
}

/// Create an unconnected nonblocking TCP socket for the given address family.
pub fn create_tcp_socket(ipv6: bool) -> io::Result<RawFd> {
    let domain = if ipv6 { libc::AF_INET6 } else { libc::AF_INET };
    unsafe {
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(fd)
        }
    }
}

pub fn set_no_delay(fd: RawFd, enabled: bool) -> io::Result<()> {
    let flag: c_int = if enabled { 1 } else { 0 };
    unsafe {
        if libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &flag as *const _ as *const c_void,
            mem::size_of_val(&flag) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Outcome of a nonblocking connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    Connected,
    InProgress,
}

pub fn connect_nonblocking(fd: RawFd, addr: &SocketAddr) -> io::Result<ConnectProgress> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let len = socket_addr_to_sockaddr(addr, &mut storage);
        let res = libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len);
        if res == 0 {
            Ok(ConnectProgress::Connected)
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINPROGRESS) {
                Ok(ConnectProgress::InProgress)
            } else {
                Err(err)
            }
        }
    }
}

/// SO_ERROR after a writable event on a connecting socket. 0 means the
/// connect succeeded.
pub fn socket_error(fd: RawFd) -> io::Result<i32> {
    unsafe {
        let mut result: c_int = 0;
        let mut len = mem::size_of::<c_int>() as socklen_t;
        if libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut result as *mut _ as *mut c_void,
            &mut len,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(result)
    }
}

/// Outcome of a nonblocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Eof,
}

pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(ReadOutcome::WouldBlock)
            } else {
                Err(err)
            }
        } else if res == 0 {
            Ok(ReadOutcome::Eof)
        } else {
            Ok(ReadOutcome::Data(res as usize))
        }
    }
}

/// Outcome of a nonblocking write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Wrote(usize),
    WouldBlock,
}

/// MSG_NOSIGNAL keeps a dead peer from killing the process; the EPIPE comes
/// back through errno instead.
pub fn write_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<WriteOutcome> {
    unsafe {
        let res = libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        );
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(WriteOutcome::WouldBlock)
            } else {
                Err(err)
            }
        } else {
            Ok(WriteOutcome::Wrote(res as usize))
        }
    }
}

pub fn shutdown_socket(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Epoll (edge-triggered, one-shot) ----

pub use libc::epoll_event;

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;

pub struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { fd })
        }
    }

    fn event_mask(readable: bool, writable: bool) -> u32 {
        let mut events = (libc::EPOLLET | libc::EPOLLONESHOT) as u32;
        if readable {
            events |= EPOLLIN;
        }
        if writable {
            events |= EPOLLOUT;
        }
        events
    }

    pub fn add(&self, fd: RawFd, token: u64, readable: bool, writable: bool) -> io::Result<()> {
        let mut event = epoll_event {
            events: Self::event_mask(readable, writable),
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Re-arm a one-shot registration for its next event.
    pub fn modify(&self, fd: RawFd, token: u64, readable: bool, writable: bool) -> io::Result<()> {
        let mut event = epoll_event {
            events: Self::event_mask(readable, writable),
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
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

    /// Wait for events. EINTR is reported as zero events.
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
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Eventfd wakeups ----

pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        unsafe {
            let fd = libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { fd })
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Post one wakeup. Callable from any thread.
    pub fn signal(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.fd, &val as *const u64 as *const c_void, 8);
        }
    }

    /// Consume all pending wakeups.
    pub fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(self.fd, &mut val as *mut u64 as *mut c_void, 8);
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Timerfd timers ----

pub struct TimerFd {
    fd: RawFd,
}

impl TimerFd {
    pub fn new() -> io::Result<Self> {
        unsafe {
            let fd = libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            );
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { fd })
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    fn duration_to_timespec(d: Duration) -> libc::timespec {
        libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        }
    }

    /// Arm the timer to fire every `interval`, starting one interval from now.
    pub fn set_interval(&self, interval: Duration) -> io::Result<()> {
        let ts = Self::duration_to_timespec(interval);
        let spec = libc::itimerspec {
            it_interval: ts,
            it_value: ts,
        };
        self.settime(&spec)
    }

    /// Arm the timer to fire once, `delay` from now.
    pub fn set_oneshot(&self, delay: Duration) -> io::Result<()> {
        // A zero it_value disarms; clamp to one nanosecond.
        let delay = if delay.is_zero() {
            Duration::from_nanos(1)
        } else {
            delay
        };
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: Self::duration_to_timespec(delay),
        };
        self.settime(&spec)
    }

    fn settime(&self, spec: &libc::itimerspec) -> io::Result<()> {
        unsafe {
            if libc::timerfd_settime(self.fd, 0, spec, ptr::null_mut()) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Number of expirations since the last read. Zero when none are pending.
    pub fn read_ticks(&self) -> io::Result<u64> {
        let mut ticks: u64 = 0;
        unsafe {
            let res = libc::read(self.fd, &mut ticks as *mut u64 as *mut c_void, 8);
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Ok(0);
                }
                return Err(err);
            }
        }
        Ok(ticks)
    }
}

impl Drop for TimerFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eventfd_signal_drain() {
        let efd = EventFd::new().unwrap();
        efd.signal();
        efd.signal();
        efd.drain();
        // A second drain on an empty eventfd must not block.
        efd.drain();
    }

    #[test]
    fn timerfd_ticks_accumulate() {
        let tfd = TimerFd::new().unwrap();
        tfd.set_interval(Duration::from_millis(5)).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        let ticks = tfd.read_ticks().unwrap();
        assert!(ticks >= 2, "expected several expirations, got {}", ticks);
    }

    #[test]
    fn listen_socket_reports_port() {
        let fd = create_listen_socket("127.0.0.1", 0).unwrap();
        let port = local_port(fd).unwrap();
        assert!(port > 0);
        close_fd(fd);
    }
}
