// src/socket.rs
//
// Nonblocking client TCP socket. Producers on any thread enqueue messages
// into a bounded queue and poke the socket's wakeup fd; the reactor thread
// owns the fd and drains the queue through a flush loop.

use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::error::SocketError;
use crate::reactor::{
    EventOwner, FdKind, Interest, Reactor, Readiness, RegistrationHandle,
};
use crate::syscalls::{self, ConnectProgress, EventFd, RawFd, ReadOutcome, WriteOutcome};

/// Outcome of a connection attempt, delivered through the
/// connection-result callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionResult {
    Success,
    HostUnknown,
    CouldNotConnect,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Callback set handed to the socket at construction. All callbacks run on
/// reactor worker threads; they must not call [`TcpClientSocket::close`]
/// (use [`TcpClientSocket::request_close`] instead).
#[derive(Default)]
pub struct SocketCallbacks {
    /// Connection attempt settled. The second argument carries messages
    /// that were queued but will never be sent.
    pub on_connection_result: Option<Box<dyn Fn(ConnectionResult, Vec<Vec<u8>>) + Send + Sync>>,
    /// The connection went down; `true` means the peer initiated it.
    pub on_disconnected: Option<Box<dyn Fn(bool) + Send + Sync>>,
    /// One queued message was fully sent (`Ok(len)`) or failed.
    pub on_write_result: Option<Box<dyn Fn(io::Result<usize>) + Send + Sync>>,
    pub on_received_data: Option<Box<dyn Fn(&[u8]) + Send + Sync>>,
}

/// Mutex/condvar cell backing `state()` / `wait_state()`.
struct StateCell {
    state: Mutex<SocketState>,
    cond: Condvar,
}

impl StateCell {
    fn new() -> Self {
        StateCell {
            state: Mutex::new(SocketState::Disconnected),
            cond: Condvar::new(),
        }
    }

    fn get(&self) -> SocketState {
        *self.state.lock().unwrap()
    }

    fn set(&self, next: SocketState) {
        *self.state.lock().unwrap() = next;
        self.cond.notify_all();
    }

    fn wait(&self, target: SocketState) {
        let mut guard = self.state.lock().unwrap();
        while *guard != target {
            guard = self.cond.wait(guard).unwrap();
        }
    }
}

struct SocketIo {
    host: String,
    port: u16,
    fd: RawFd,
    sock_handle: Option<RegistrationHandle>,
    wake_handle: Option<RegistrationHandle>,
    current: Vec<u8>,
    current_sent: usize,
    write_ready: bool,
    no_delay: bool,
    recv_buf: Vec<u8>,
}

struct SocketInner {
    reactor: Reactor,
    callbacks: SocketCallbacks,
    wakeup: EventFd,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    queued: AtomicUsize,
    bytes_sent: AtomicUsize,
    state: StateCell,
    io: Mutex<SocketIo>,
}

const DEFAULT_RECV_BUF: usize = 16 * 1024;

/// Client TCP socket with a bounded outbound message queue.
#[derive(Clone)]
pub struct TcpClientSocket {
    inner: Arc<SocketInner>,
}

impl TcpClientSocket {
    pub fn new(
        reactor: &Reactor,
        callbacks: SocketCallbacks,
        queue_capacity: usize,
    ) -> Result<Self, SocketError> {
        let (tx, rx) = bounded(queue_capacity.max(1));
        let inner = Arc::new(SocketInner {
            reactor: reactor.clone(),
            callbacks,
            wakeup: EventFd::new()?,
            tx,
            rx,
            queued: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            state: StateCell::new(),
            io: Mutex::new(SocketIo {
                host: String::new(),
                port: 0,
                fd: -1,
                sock_handle: None,
                wake_handle: None,
                current: Vec::new(),
                current_sent: 0,
                write_ready: false,
                no_delay: true,
                recv_buf: vec![0u8; DEFAULT_RECV_BUF],
            }),
        });

        let wake_handle = reactor.register(
            inner.wakeup.fd(),
            FdKind::Wakeup,
            Interest::READABLE,
            inner.clone() as Arc<dyn EventOwner>,
        )?;
        inner.io.lock().unwrap().wake_handle = Some(wake_handle);

        Ok(TcpClientSocket { inner })
    }

    /// Set the connection target. Legal only while disconnected.
    pub fn open(&self, host: &str, port: u16) -> Result<(), SocketError> {
        match self.state() {
            SocketState::Connecting | SocketState::Connected => {
                return Err(SocketError::InvalidState(
                    "connection already pending or established",
                ));
            }
            _ => {}
        }
        if host.is_empty() {
            return Err(SocketError::InvalidAddress("empty host".to_string()));
        }
        if port == 0 {
            return Err(SocketError::InvalidAddress("port 0".to_string()));
        }
        let mut io = self.inner.io.lock().unwrap();
        io.host = host.to_string();
        io.port = port;
        Ok(())
    }

    pub fn set_no_delay(&self, enabled: bool) {
        self.inner.io.lock().unwrap().no_delay = enabled;
    }

    /// Initiate (or restart) the connection. Resolution and connect errors
    /// after argument validation arrive via the connection-result callback.
    pub fn connect(&self) -> Result<(), SocketError> {
        let mut io = self.inner.io.lock().unwrap();
        if io.host.is_empty() {
            return Err(SocketError::InvalidState("no address set"));
        }
        if io.fd != -1 || self.state() != SocketState::Disconnected {
            return Err(SocketError::InvalidState("socket is not closed"));
        }

        self.inner.state.set(SocketState::Connecting);

        // Numeric literal first, name lookup second.
        let addr = match io.host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, io.port),
            Err(_) => {
                let resolved = (io.host.as_str(), io.port)
                    .to_socket_addrs()
                    .ok()
                    .and_then(|mut addrs| addrs.next());
                match resolved {
                    Some(addr) => addr,
                    None => {
                        self.inner.state.set(SocketState::Disconnected);
                        self.inner.notify_connection_result(ConnectionResult::HostUnknown, vec![]);
                        return Ok(());
                    }
                }
            }
        };

        let fd = match syscalls::create_tcp_socket(addr.is_ipv6()) {
            Ok(fd) => fd,
            Err(e) => {
                self.inner.state.set(SocketState::Disconnected);
                return Err(SocketError::Io(e));
            }
        };
        if io.no_delay {
            let _ = syscalls::set_no_delay(fd, true);
        }

        match syscalls::connect_nonblocking(fd, &addr) {
            Ok(ConnectProgress::Connected) => {
                io.fd = fd;
                self.inner.state.set(SocketState::Connected);
                self.inner.notify_connection_result(ConnectionResult::Success, vec![]);
            }
            Ok(ConnectProgress::InProgress) => {
                io.fd = fd;
            }
            Err(e) => {
                syscalls::close_fd(fd);
                self.inner.state.set(SocketState::Disconnected);
                tracing::debug!("connect to {} failed: {}", addr, e);
                self.inner.notify_connection_result(ConnectionResult::CouldNotConnect, vec![]);
                return Ok(());
            }
        }

        let connected = self.state() == SocketState::Connected;
        match self.inner.reactor.register(
            fd,
            FdKind::Socket,
            Interest {
                readable: connected,
                writable: true,
            },
            self.inner.clone() as Arc<dyn EventOwner>,
        ) {
            Ok(handle) => {
                io.sock_handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                syscalls::close_fd(fd);
                io.fd = -1;
                self.inner.state.set(SocketState::Disconnected);
                Err(e.into())
            }
        }
    }

    /// We are ready to accept messages for sending.
    pub fn can_send_messages(&self) -> bool {
        matches!(
            self.state(),
            SocketState::Connecting | SocketState::Connected
        )
    }

    /// Enqueue one message. Returns `Ok(false)` when the queue is full; the
    /// caller may retry after the queue drains. Callable from any thread.
    pub fn write(&self, data: Vec<u8>) -> Result<bool, SocketError> {
        if !self.can_send_messages() {
            return Err(SocketError::InvalidState("cannot write while not connected"));
        }
        match self.inner.tx.try_send(data) {
            Ok(()) => {
                self.inner.queued.fetch_add(1, Ordering::AcqRel);
                self.inner.wakeup.signal();
                Ok(true)
            }
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => {
                Err(SocketError::InvalidState("queue disconnected"))
            }
        }
    }

    /// Close once the queue and the partial-send buffer have drained.
    pub fn request_close(&self) {
        if self.can_send_messages() {
            self.inner.state.set(SocketState::Disconnecting);
            self.inner.wakeup.signal();
        } else {
            tracing::debug!("request_close on already disconnected socket");
        }
    }

    /// Synchronous teardown of the socket fd and its registration. The
    /// socket can be reconnected afterwards with `connect()`.
    pub fn close(&self) {
        let mut io = self.inner.io.lock().unwrap();
        if io.fd != -1 {
            self.inner.do_close(&mut io, false);
        }
    }

    /// Full teardown: the socket fd and the wakeup registration. The socket
    /// cannot be used afterwards.
    pub fn dispose(&self) {
        let mut io = self.inner.io.lock().unwrap();
        if io.fd != -1 {
            self.inner.do_close(&mut io, false);
        }
        if let Some(handle) = io.wake_handle.take() {
            let _ = self.inner.reactor.unregister(handle);
        }
    }

    pub fn state(&self) -> SocketState {
        self.inner.state.get()
    }

    /// Block until the socket reaches the given state.
    pub fn wait_state(&self, state: SocketState) {
        self.inner.state.wait(state);
    }

    pub fn bytes_sent(&self) -> usize {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn queued_messages(&self) -> usize {
        self.inner.queued.load(Ordering::Acquire)
    }
}

impl SocketInner {
    fn notify_connection_result(&self, result: ConnectionResult, lost: Vec<Vec<u8>>) {
        if let Some(cb) = &self.callbacks.on_connection_result {
            cb(result, lost);
        }
    }

    fn notify_disconnected(&self, from_peer: bool) {
        if let Some(cb) = &self.callbacks.on_disconnected {
            cb(from_peer);
        }
    }

    fn notify_write_result(&self, result: io::Result<usize>) {
        if let Some(cb) = &self.callbacks.on_write_result {
            cb(result);
        }
    }

    fn handle_wakeup(&self, io: &mut SocketIo) {
        self.wakeup.drain();

        if io.write_ready {
            self.flush(io);
        }

        if self.state.get() == SocketState::Disconnecting {
            if self.queued.load(Ordering::Acquire) > 0 || !io.current.is_empty() {
                // Still draining; check again on the next wakeup.
                self.wakeup.signal();
            } else if io.fd != -1 {
                self.do_close(io, false);
            } else {
                self.state.set(SocketState::Disconnected);
            }
        }
    }

    fn handle_socket_event(&self, io: &mut SocketIo, readiness: Readiness) -> Option<Interest> {
        if readiness.writable {
            if self.state.get() == SocketState::Connecting {
                self.handle_connection_result(io);
            }
            if self.state.get() != SocketState::Disconnected {
                io.write_ready = true;
                self.flush(io);
            }
        }
        if readiness.readable && io.fd != -1 {
            self.handle_read_ready(io);
        }
        if readiness.hangup && io.fd != -1 {
            self.handle_disconnection(io, true);
        }

        if self.state.get() == SocketState::Disconnected || io.fd == -1 {
            return None;
        }
        Some(Interest {
            readable: self.state.get() == SocketState::Connected,
            writable: !io.write_ready,
        })
    }

    fn handle_connection_result(&self, io: &mut SocketIo) {
        let code = match syscalls::socket_error(io.fd) {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("getsockopt SO_ERROR failed: {}", e);
                libc::ECONNREFUSED
            }
        };

        if code == 0 {
            self.state.set(SocketState::Connected);
            self.notify_connection_result(ConnectionResult::Success, vec![]);
            return;
        }

        let result = match code {
            libc::ENETUNREACH => ConnectionResult::HostUnknown,
            libc::ECONNREFUSED | libc::EHOSTDOWN | libc::EHOSTUNREACH => {
                ConnectionResult::CouldNotConnect
            }
            other => {
                tracing::warn!("unclassified connect error: {}", other);
                ConnectionResult::CouldNotConnect
            }
        };

        if let Some(handle) = io.sock_handle.take() {
            let _ = self.reactor.unregister(handle);
        }
        syscalls::close_fd(io.fd);
        io.fd = -1;
        io.write_ready = false;

        let mut lost = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            lost.push(msg);
        }
        self.queued.store(0, Ordering::Release);

        self.state.set(SocketState::Disconnected);
        self.notify_connection_result(result, lost);
    }

    fn handle_read_ready(&self, io: &mut SocketIo) {
        loop {
            let fd = io.fd;
            if fd == -1 {
                return;
            }
            match syscalls::read_nonblocking(fd, &mut io.recv_buf) {
                Ok(ReadOutcome::Data(n)) => {
                    if let Some(cb) = &self.callbacks.on_received_data {
                        cb(&io.recv_buf[..n]);
                    }
                }
                Ok(ReadOutcome::WouldBlock) => return,
                Ok(ReadOutcome::Eof) => {
                    self.handle_disconnection(io, true);
                    return;
                }
                Err(e) => {
                    tracing::debug!("read error: {}", e);
                    self.handle_disconnection(io, true);
                    return;
                }
            }
        }
    }

    /// Drain the queue into the kernel for as long as it accepts bytes.
    fn flush(&self, io: &mut SocketIo) {
        if !io.write_ready {
            return;
        }
        loop {
            if io.current.is_empty() {
                match self.rx.try_recv() {
                    Ok(msg) => {
                        self.queued.fetch_sub(1, Ordering::AcqRel);
                        io.current = msg;
                        io.current_sent = 0;
                    }
                    Err(_) => return,
                }
            }

            match syscalls::write_nonblocking(io.fd, &io.current[io.current_sent..]) {
                Ok(WriteOutcome::Wrote(n)) => {
                    io.current_sent += n;
                    self.bytes_sent.fetch_add(n, Ordering::Relaxed);
                    if io.current_sent == io.current.len() {
                        let len = io.current.len();
                        io.current.clear();
                        io.current_sent = 0;
                        self.notify_write_result(Ok(len));
                    }
                }
                Ok(WriteOutcome::WouldBlock) => {
                    io.write_ready = false;
                    return;
                }
                Err(e) => {
                    io.current.clear();
                    io.current_sent = 0;
                    io.write_ready = false;
                    tracing::debug!("write error: {}", e);
                    self.notify_write_result(Err(e));
                    self.handle_disconnection(io, true);
                    return;
                }
            }
        }
    }

    fn handle_disconnection(&self, io: &mut SocketIo, from_peer: bool) {
        if self.state.get() != SocketState::Disconnected {
            self.do_close(io, from_peer);
        }
    }

    fn do_close(&self, io: &mut SocketIo, from_peer: bool) {
        if let Some(handle) = io.sock_handle.take() {
            let _ = self.reactor.unregister(handle);
        }
        if io.fd != -1 {
            if !from_peer {
                syscalls::shutdown_socket(io.fd);
            }
            syscalls::close_fd(io.fd);
            io.fd = -1;
        }
        io.write_ready = false;
        io.current.clear();
        io.current_sent = 0;
        self.state.set(SocketState::Disconnected);
        self.notify_disconnected(from_peer);
    }
}

impl EventOwner for SocketInner {
    fn on_event(
        &self,
        _reactor: &Reactor,
        handle: RegistrationHandle,
        readiness: Readiness,
    ) -> Option<Interest> {
        let mut io = self.io.lock().unwrap();
        if io.wake_handle == Some(handle) {
            self.handle_wakeup(&mut io);
            return Some(Interest::READABLE);
        }
        if io.sock_handle == Some(handle) {
            return self.handle_socket_event(&mut io, readiness);
        }
        None
    }

    fn on_panic(&self, handle: RegistrationHandle, message: String) {
        tracing::error!("socket handler panic on {:?}: {}", handle, message);
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        let io = self.io.get_mut().unwrap();
        if io.fd != -1 {
            syscalls::close_fd(io.fd);
            io.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::ReactorConfig;
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Duration;

    fn reactor() -> Reactor {
        Reactor::new(ReactorConfig::default().threads(1)).unwrap()
    }

    #[test]
    fn connect_write_and_drain() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let (done_tx, done_rx) = mpsc::channel();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                }
            }
            done_tx.send(received).unwrap();
        });

        let reactor = reactor();
        let (write_tx, write_rx) = mpsc::channel();
        let callbacks = SocketCallbacks {
            on_write_result: Some(Box::new(move |result| {
                write_tx.send(result.map_err(|e| e.kind())).unwrap();
            })),
            ..Default::default()
        };

        let socket = TcpClientSocket::new(&reactor, callbacks, 8).unwrap();
        socket.open("127.0.0.1", port).unwrap();
        socket.connect().unwrap();
        socket.wait_state(SocketState::Connected);

        assert!(socket.write(b"hello ".to_vec()).unwrap());
        assert!(socket.write(b"world".to_vec()).unwrap());

        // Write results arrive in submission order with exact byte counts.
        assert_eq!(
            write_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Ok(6)
        );
        assert_eq!(
            write_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Ok(5)
        );
        assert_eq!(socket.bytes_sent(), 11);

        socket.request_close();
        socket.wait_state(SocketState::Disconnected);

        let received = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received, b"hello world");

        server.join().unwrap();
        socket.dispose();
        reactor.shutdown();
    }

    #[test]
    fn connect_refused_reports_result() {
        let reactor = reactor();
        // Bind then drop to get a port nothing listens on.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let (tx, rx) = mpsc::channel();
        let callbacks = SocketCallbacks {
            on_connection_result: Some(Box::new(move |result, _| {
                tx.send(result).unwrap();
            })),
            ..Default::default()
        };

        let socket = TcpClientSocket::new(&reactor, callbacks, 4).unwrap();
        socket.open("127.0.0.1", port).unwrap();
        socket.connect().unwrap();

        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, ConnectionResult::CouldNotConnect);
        assert_eq!(socket.state(), SocketState::Disconnected);

        socket.dispose();
        reactor.shutdown();
    }

    #[test]
    fn write_requires_connection() {
        let reactor = reactor();
        let socket = TcpClientSocket::new(&reactor, SocketCallbacks::default(), 4).unwrap();
        assert!(matches!(
            socket.write(b"x".to_vec()),
            Err(SocketError::InvalidState(_))
        ));
        socket.dispose();
        reactor.shutdown();
    }

    #[test]
    fn queue_backpressure_returns_false() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let reactor = reactor();
        let socket = TcpClientSocket::new(&reactor, SocketCallbacks::default(), 2).unwrap();
        socket.open("127.0.0.1", port).unwrap();
        socket.connect().unwrap();

        // The peer never reads, so the kernel send buffer fills, the flush
        // loop stalls, and the bounded queue must start reporting false
        // instead of dropping silently.
        let mut accepted = 0;
        for _ in 0..64 {
            if socket.write(vec![0u8; 256 * 1024]).unwrap() {
                accepted += 1;
            }
        }
        assert!(accepted >= 2);
        assert!(accepted < 64);

        socket.dispose();
        reactor.shutdown();
        drop(listener);
    }
}
