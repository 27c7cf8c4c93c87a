// src/server.rs
//
// REST service endpoint: owns the listener and the server-side transports,
// assembles requests with the streaming parser, dispatches them through the
// router, and frames responses back onto the socket.
//
// The endpoint owns its transports. Handlers and detached response writers
// refer to a transport only by (slot, id); closing one is a request to the
// endpoint, never a direct call into another component.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use crate::error::{EndpointError, ResponseError};
use crate::http::{RestParams, status_text};
use crate::metrics::ServiceMetrics;
use crate::parser::{HttpEvents, HttpParser};
use crate::reactor::{
    EventOwner, FdKind, Interest, Reactor, Readiness, RegistrationHandle,
};
use crate::rest::{ContentLen, ResponseState, RestConnection, RestRequest};
use crate::router::Router;
use crate::syscalls::{self, RawFd, ReadOutcome, WriteOutcome};

/// Hard cap on requests served per keep-alive connection.
const KEEP_ALIVE_LIMIT: u32 = 10_000;

const READ_BUF_SIZE: usize = 16 * 1024;

/* REQUEST ASSEMBLY */

/// Collects parser events into complete RestRequests.
#[derive(Default)]
struct RequestAssembler {
    current: Option<RestRequest>,
    completed: VecDeque<RestRequest>,
}

impl HttpEvents for RequestAssembler {
    fn on_request_start(&mut self, method: &str, target: &str, _version: &str) {
        self.current = Some(RestRequest::from_target(method, target));
    }

    fn on_header(&mut self, line: &[u8]) {
        if let Some(request) = &mut self.current
            && let Some(colon) = line.iter().position(|&b| b == b':')
        {
            let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
            let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();
            request.headers.push(name, value);
        }
    }

    fn on_data(&mut self, data: &[u8]) {
        if let Some(request) = &mut self.current {
            request.payload.extend_from_slice(data);
        }
    }

    fn on_done(&mut self, success: bool) {
        if success && let Some(request) = self.current.take() {
            self.completed.push_back(request);
        }
    }
}

/* TRANSPORT */

struct Transport {
    fd: RawFd,
    handle: RegistrationHandle,
    parser: HttpParser,
    assembler: RequestAssembler,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    write_pos: usize,
    /// A dispatched request has not produced its terminal response yet.
    outstanding: bool,
    /// Requests parsed while an earlier response is still outstanding.
    queued: VecDeque<RestRequest>,
    close_after_flush: bool,
    peer_closed: bool,
    closed: bool,
    requests_served: u32,
}

impl Transport {
    fn pending_write(&self) -> bool {
        self.write_pos < self.write_buf.len()
    }
}

struct TransportSlot {
    id: u64,
    handle: RegistrationHandle,
    transport: Arc<Mutex<Transport>>,
}

#[derive(Default)]
struct TransportTable {
    slots: Vec<Option<TransportSlot>>,
    free: Vec<usize>,
    by_handle: HashMap<RegistrationHandle, usize>,
    next_id: u64,
}

struct Listener {
    fd: RawFd,
    handle: RegistrationHandle,
}

struct EndpointInner {
    reactor: Reactor,
    router: Arc<Router>,
    metrics: Arc<ServiceMetrics>,
    listen: Mutex<Option<Listener>>,
    transports: Mutex<TransportTable>,
    active: Mutex<usize>,
    drained: Condvar,
    shutdown: AtomicBool,
}

/// Accepts connections, parses requests, and answers them through the
/// router.
#[derive(Clone)]
pub struct RestServiceEndpoint {
    inner: Arc<EndpointInner>,
}

/// The EventOwner registered with the reactor; holds the endpoint weakly so
/// dropping the endpoint is enough to let it die.
struct EndpointOwner(Weak<EndpointInner>);

impl RestServiceEndpoint {
    pub fn new(reactor: &Reactor, router: Router) -> Self {
        RestServiceEndpoint {
            inner: Arc::new(EndpointInner {
                reactor: reactor.clone(),
                router: Arc::new(router),
                metrics: Arc::new(ServiceMetrics::new()),
                listen: Mutex::new(None),
                transports: Mutex::new(TransportTable::default()),
                active: Mutex::new(0),
                drained: Condvar::new(),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Bind and start accepting. Returns the actual port (useful with
    /// port 0).
    pub fn bind(&self, host: &str, port: u16) -> Result<u16, EndpointError> {
        let mut listen = self.inner.listen.lock().unwrap();
        if listen.is_some() {
            return Err(EndpointError::AlreadyBound);
        }
        let fd = syscalls::create_listen_socket(host, port)?;
        let actual = syscalls::local_port(fd)?;
        let owner: Arc<dyn EventOwner> = Arc::new(EndpointOwner(Arc::downgrade(&self.inner)));
        match self
            .inner
            .reactor
            .register(fd, FdKind::Socket, Interest::READABLE, owner)
        {
            Ok(handle) => {
                *listen = Some(Listener { fd, handle });
                tracing::info!("listening on {}:{}", host, actual);
                Ok(actual)
            }
            Err(e) => {
                syscalls::close_fd(fd);
                Err(e.into())
            }
        }
    }

    pub fn metrics(&self) -> Arc<ServiceMetrics> {
        self.inner.metrics.clone()
    }

    pub fn active_connections(&self) -> usize {
        *self.inner.active.lock().unwrap()
    }

    /// Stop accepting, force-close all transports, and wait until the
    /// transport set is empty.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(listener) = self.inner.listen.lock().unwrap().take() {
            let _ = self.inner.reactor.unregister(listener.handle);
            syscalls::close_fd(listener.fd);
        }

        // Force-close everything, then wait for the transport set to empty.
        // The sweep repeats: an accept racing the shutdown flag can slip a
        // transport in behind the first pass.
        loop {
            let open: Vec<(usize, u64)> = {
                let table = self.inner.transports.lock().unwrap();
                table
                    .slots
                    .iter()
                    .enumerate()
                    .filter_map(|(slot, entry)| entry.as_ref().map(|e| (slot, e.id)))
                    .collect()
            };
            for (slot, id) in open {
                close_transport(&self.inner, slot, id);
            }

            let active = self.inner.active.lock().unwrap();
            if *active == 0 {
                break;
            }
            let _ = self
                .inner
                .drained
                .wait_timeout(active, Duration::from_millis(50))
                .unwrap();
        }
        tracing::info!("endpoint shut down");
    }

    /// Convenience: report metrics periodically and block until SIGINT,
    /// then shut down the endpoint and the reactor.
    pub fn serve_forever(&self) {
        let stop = Arc::new(AtomicBool::new(false));
        {
            let stop = stop.clone();
            if let Err(e) = ctrlc::set_handler(move || {
                stop.store(true, Ordering::SeqCst);
            }) {
                tracing::warn!("could not install SIGINT handler: {}", e);
            }
        }

        let metrics = self.inner.metrics.clone();
        let _ = self.inner.reactor.add_periodic(Duration::from_secs(5), move |_| {
            let snap = metrics.snapshot();
            tracing::info!(
                "active connections: {} | requests: {} | bytes out: {}",
                snap.active_connections,
                snap.requests_received,
                snap.bytes_written
            );
        });

        while !stop.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
        tracing::info!("SIGINT received; shutting down");
        self.shutdown();
        self.inner.reactor.shutdown();
    }
}

impl EventOwner for EndpointOwner {
    fn on_event(
        &self,
        _reactor: &Reactor,
        handle: RegistrationHandle,
        readiness: Readiness,
    ) -> Option<Interest> {
        let inner = self.0.upgrade()?;

        let is_listener = {
            let listen = inner.listen.lock().unwrap();
            listen.as_ref().map(|l| l.handle) == Some(handle)
        };
        if is_listener {
            accept_loop(&inner);
            return Some(Interest::READABLE);
        }
        transport_event(&inner, handle, readiness)
    }

    fn on_panic(&self, handle: RegistrationHandle, message: String) {
        tracing::error!("endpoint handler panic on {:?}: {}", handle, message);
    }
}

fn accept_loop(inner: &Arc<EndpointInner>) {
    let listen_fd = {
        let listen = inner.listen.lock().unwrap();
        match listen.as_ref() {
            Some(l) => l.fd,
            None => return,
        }
    };

    loop {
        match syscalls::accept_connection(listen_fd) {
            Ok(Some(fd)) => {
                if inner.shutdown.load(Ordering::Acquire) {
                    syscalls::close_fd(fd);
                    continue;
                }
                let _ = syscalls::set_no_delay(fd, true);
                add_transport(inner, fd);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!("accept error: {}", e);
                break;
            }
        }
    }
}

fn add_transport(inner: &Arc<EndpointInner>, fd: RawFd) {
    // The table lock is held across registration so the first readiness
    // event cannot race ahead of the slot becoming visible.
    let mut table = inner.transports.lock().unwrap();

    let owner: Arc<dyn EventOwner> = Arc::new(EndpointOwner(Arc::downgrade(inner)));
    let handle = match inner
        .reactor
        .register(fd, FdKind::Socket, Interest::READABLE, owner)
    {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!("could not register transport: {}", e);
            syscalls::close_fd(fd);
            return;
        }
    };

    let transport = Arc::new(Mutex::new(Transport {
        fd,
        handle,
        parser: HttpParser::request(),
        assembler: RequestAssembler::default(),
        read_buf: vec![0u8; READ_BUF_SIZE],
        write_buf: Vec::new(),
        write_pos: 0,
        outstanding: false,
        queued: VecDeque::new(),
        close_after_flush: false,
        peer_closed: false,
        closed: false,
        requests_served: 0,
    }));

    let slot = match table.free.pop() {
        Some(slot) => slot,
        None => {
            table.slots.push(None);
            table.slots.len() - 1
        }
    };
    let id = table.next_id;
    table.next_id += 1;
    table.slots[slot] = Some(TransportSlot {
        id,
        handle,
        transport,
    });
    table.by_handle.insert(handle, slot);
    drop(table);

    inner.metrics.inc_conn();
    *inner.active.lock().unwrap() += 1;
}

fn lookup_by_handle(
    inner: &EndpointInner,
    handle: RegistrationHandle,
) -> Option<(usize, u64, Arc<Mutex<Transport>>)> {
    let table = inner.transports.lock().unwrap();
    let slot = *table.by_handle.get(&handle)?;
    let entry = table.slots.get(slot)?.as_ref()?;
    Some((slot, entry.id, entry.transport.clone()))
}

fn lookup_by_slot(
    inner: &EndpointInner,
    slot: usize,
    id: u64,
) -> Option<Arc<Mutex<Transport>>> {
    let table = inner.transports.lock().unwrap();
    let entry = table.slots.get(slot)?.as_ref()?;
    if entry.id != id {
        return None;
    }
    Some(entry.transport.clone())
}

fn transport_event(
    inner: &Arc<EndpointInner>,
    handle: RegistrationHandle,
    readiness: Readiness,
) -> Option<Interest> {
    let (slot, id, transport) = lookup_by_handle(inner, handle)?;

    let mut ready = Vec::new();
    {
        let mut t = transport.lock().unwrap();
        if t.closed {
            return None;
        }

        if readiness.writable {
            flush_transport(inner, &mut t);
        }
        if readiness.readable {
            read_transport(inner, &mut t);
        }
        if readiness.hangup {
            t.peer_closed = true;
        }

        while let Some(request) = t.assembler.completed.pop_front() {
            t.queued.push_back(request);
        }
        // Dispatch at most one here; the terminal write of each response
        // picks up the next queued request, so pipelined requests chain
        // without reordering.
        if !t.outstanding && let Some(request) = t.queued.pop_front() {
            t.outstanding = true;
            ready.push(request);
        }
    }

    for request in ready {
        dispatch_request(inner, slot, id, request);
    }

    // Decide what happens to the transport now that handlers have run.
    let decision = {
        let mut t = transport.lock().unwrap();
        if t.closed {
            return None;
        }
        let pending = t.pending_write();
        if (t.close_after_flush || t.peer_closed) && !pending && !t.outstanding {
            t.closed = true;
            None
        } else {
            Some(Interest {
                readable: !t.peer_closed && !t.close_after_flush,
                writable: pending,
            })
        }
    };

    match decision {
        Some(interest) => Some(interest),
        None => {
            close_transport(inner, slot, id);
            None
        }
    }
}

/// Edge-triggered read: drain the socket, feeding the request parser.
fn read_transport(inner: &Arc<EndpointInner>, t: &mut Transport) {
    loop {
        if t.fd == -1 || t.peer_closed || t.parser.has_failed() {
            return;
        }
        let outcome = {
            let Transport { fd, read_buf, .. } = &mut *t;
            syscalls::read_nonblocking(*fd, read_buf)
        };
        match outcome {
            Ok(ReadOutcome::Data(n)) => {
                inner.metrics.add_bytes_read(n);
                let Transport {
                    parser,
                    assembler,
                    read_buf,
                    ..
                } = &mut *t;
                if let Err(e) = parser.feed(&read_buf[..n], assembler) {
                    tracing::debug!("bad request: {}", e);
                    respond_bad_request(inner, t);
                    return;
                }
            }
            Ok(ReadOutcome::WouldBlock) => return,
            Ok(ReadOutcome::Eof) => {
                t.peer_closed = true;
                return;
            }
            Err(e) => {
                tracing::debug!("transport read error: {}", e);
                t.peer_closed = true;
                return;
            }
        }
    }
}

/// Protocol errors get a 400 and close the transport.
fn respond_bad_request(inner: &Arc<EndpointInner>, t: &mut Transport) {
    let body = b"malformed request";
    let head = compose_head(
        400,
        "text/plain",
        &RestParams::new(),
        ResponseFraming::Length(body.len() as u64),
        false,
    );
    t.write_buf.extend_from_slice(&head);
    t.write_buf.extend_from_slice(body);
    t.close_after_flush = true;
    // The transport is dying; anything parsed behind the bad bytes is moot.
    t.assembler.completed.clear();
    t.queued.clear();
    inner.metrics.inc_resp();
    tracing::debug!("response 400 {}", status_text(400));
    flush_transport(inner, t);
}

fn flush_transport(inner: &Arc<EndpointInner>, t: &mut Transport) {
    while t.pending_write() {
        if t.fd == -1 {
            return;
        }
        match syscalls::write_nonblocking(t.fd, &t.write_buf[t.write_pos..]) {
            Ok(WriteOutcome::Wrote(n)) => {
                t.write_pos += n;
                inner.metrics.add_bytes_written(n);
            }
            Ok(WriteOutcome::WouldBlock) => return,
            Err(e) => {
                tracing::debug!("transport write error: {}", e);
                t.peer_closed = true;
                // Nothing more will be written; drop the backlog so the
                // close condition can fire.
                t.write_buf.clear();
                t.write_pos = 0;
                return;
            }
        }
    }
    t.write_buf.clear();
    t.write_pos = 0;
}

fn dispatch_request(inner: &Arc<EndpointInner>, slot: usize, id: u64, request: RestRequest) {
    inner.metrics.inc_req();
    tracing::debug!("request {} {}", request.verb, request.resource);

    let keep_alive = {
        let connection_close = request
            .headers
            .get("Connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);
        let served = lookup_by_slot(inner, slot, id)
            .map(|t| t.lock().unwrap().requests_served)
            .unwrap_or(0);
        !connection_close && served < KEEP_ALIVE_LIMIT
    };

    let mut writer = EndpointConnection::new(Arc::downgrade(inner), slot, id, keep_alive);
    inner.router.handle_request(&mut writer, &request);
    // An Async handler holds a captured writer and responds later; nothing
    // more to do here either way.
}

/// Called by a response writer when bytes are ready for a transport.
/// `terminal` carries the status code of a completed response.
fn write_to_transport(
    inner: &Arc<EndpointInner>,
    slot: usize,
    id: u64,
    bytes: &[u8],
    terminal: Option<u16>,
    close_after: bool,
) -> Result<(), ResponseError> {
    let transport = lookup_by_slot(inner, slot, id).ok_or(ResponseError::Disconnected)?;

    let (need_close, next) = {
        let mut t = transport.lock().unwrap();
        if t.closed {
            return Err(ResponseError::Disconnected);
        }
        t.write_buf.extend_from_slice(bytes);
        if let Some(status) = terminal {
            t.outstanding = false;
            t.requests_served += 1;
            t.close_after_flush |= close_after;
            inner.metrics.inc_resp();
            tracing::debug!("response {} {}", status, status_text(status));
        }
        flush_transport(inner, &mut t);

        let pending = t.pending_write();
        let need_close =
            (t.close_after_flush || t.peer_closed) && !pending && !t.outstanding;
        let next = if terminal.is_some() && !need_close && !t.outstanding {
            match t.queued.pop_front() {
                Some(request) => {
                    t.outstanding = true;
                    Some(request)
                }
                None => None,
            }
        } else {
            None
        };
        if need_close {
            t.closed = true;
        } else if pending {
            // Resume on writability; harmless when an event is in flight.
            let _ = inner
                .reactor
                .rearm(t.handle, Interest { readable: true, writable: true });
        }
        (need_close, next)
    };

    if need_close {
        close_transport(inner, slot, id);
    } else if let Some(request) = next {
        dispatch_request(inner, slot, id, request);
    }
    Ok(())
}

/// Remove a transport: unregister, close, free the slot, and wake anyone
/// draining the endpoint.
fn close_transport(inner: &Arc<EndpointInner>, slot: usize, id: u64) {
    let entry = {
        let mut table = inner.transports.lock().unwrap();
        let current = table
            .slots
            .get(slot)
            .and_then(|s| s.as_ref())
            .map(|e| e.id);
        if current != Some(id) {
            return;
        }
        let entry = table.slots[slot].take().unwrap();
        table.by_handle.remove(&entry.handle);
        table.free.push(slot);
        entry
    };

    {
        let mut t = entry.transport.lock().unwrap();
        t.closed = true;
        let _ = inner.reactor.unregister(entry.handle);
        if t.fd != -1 {
            syscalls::close_fd(t.fd);
            t.fd = -1;
        }
    }

    inner.metrics.dec_conn();
    let mut active = inner.active.lock().unwrap();
    *active = active.saturating_sub(1);
    inner.drained.notify_all();
}

/* RESPONSE WRITER */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseFraming {
    Length(u64),
    Chunked,
    UntilClose,
}

struct WriterCore {
    state: ResponseState,
    framing: ResponseFraming,
    keep_alive: bool,
    /// Status code from the response header, for the completion log.
    status: u16,
}

/// RestConnection bound to one endpoint transport. Cloning (via `capture`)
/// shares the response state, so `response_sent` stays authoritative
/// across detached handles.
pub struct EndpointConnection {
    endpoint: Weak<EndpointInner>,
    slot: usize,
    id: u64,
    core: Arc<Mutex<WriterCore>>,
}

impl EndpointConnection {
    fn new(endpoint: Weak<EndpointInner>, slot: usize, id: u64, keep_alive: bool) -> Self {
        EndpointConnection {
            endpoint,
            slot,
            id,
            core: Arc::new(Mutex::new(WriterCore {
                state: ResponseState::Open,
                framing: ResponseFraming::Length(0),
                keep_alive,
                status: 0,
            })),
        }
    }

    fn clone_handle(&self) -> EndpointConnection {
        EndpointConnection {
            endpoint: self.endpoint.clone(),
            slot: self.slot,
            id: self.id,
            core: self.core.clone(),
        }
    }

    fn write(
        &self,
        bytes: &[u8],
        terminal: Option<u16>,
        close_after: bool,
    ) -> Result<(), ResponseError> {
        let inner = self.endpoint.upgrade().ok_or(ResponseError::Disconnected)?;
        write_to_transport(&inner, self.slot, self.id, bytes, terminal, close_after)
    }
}

fn compose_head(
    code: u16,
    content_type: &str,
    headers: &RestParams,
    framing: ResponseFraming,
    keep_alive: bool,
) -> Vec<u8> {
    let mut head = Vec::with_capacity(192);
    head.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", code, status_text(code)).as_bytes());
    if !content_type.is_empty() {
        head.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
    }
    match framing {
        ResponseFraming::Length(n) => {
            head.extend_from_slice(format!("Content-Length: {}\r\n", n).as_bytes());
        }
        ResponseFraming::Chunked => {
            head.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
        ResponseFraming::UntilClose => {}
    }
    if keep_alive && framing != ResponseFraming::UntilClose {
        head.extend_from_slice(b"Connection: keep-alive\r\n");
    } else {
        head.extend_from_slice(b"Connection: close\r\n");
    }
    for (name, value) in headers.iter() {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

impl RestConnection for EndpointConnection {
    fn send_response(
        &mut self,
        code: u16,
        body: &[u8],
        content_type: &str,
    ) -> Result<(), ResponseError> {
        self.send_http_response(code, body, content_type, &RestParams::new())
    }

    fn send_http_response(
        &mut self,
        code: u16,
        body: &[u8],
        content_type: &str,
        headers: &RestParams,
    ) -> Result<(), ResponseError> {
        let keep_alive = {
            let mut core = self.core.lock().unwrap();
            if core.state != ResponseState::Open {
                return Err(ResponseError::AlreadySent);
            }
            core.state = ResponseState::Closed;
            core.keep_alive
        };

        let mut bytes = compose_head(
            code,
            content_type,
            headers,
            ResponseFraming::Length(body.len() as u64),
            keep_alive,
        );
        bytes.extend_from_slice(body);
        let result = self.write(&bytes, Some(code), !keep_alive);
        if result.is_err() {
            // The transport is gone; the response state stays Closed so the
            // router will not retry.
            tracing::debug!("response dropped: transport closed");
        }
        result
    }

    fn send_http_response_header(
        &mut self,
        code: u16,
        content_type: &str,
        content_length: ContentLen,
        headers: &RestParams,
    ) -> Result<(), ResponseError> {
        let (framing, keep_alive) = {
            let mut core = self.core.lock().unwrap();
            if core.state != ResponseState::Open {
                return Err(ResponseError::AlreadySent);
            }
            core.framing = match content_length {
                ContentLen::Known(n) => ResponseFraming::Length(n),
                ContentLen::Chunked => ResponseFraming::Chunked,
                ContentLen::Unknown => {
                    core.keep_alive = false;
                    ResponseFraming::UntilClose
                }
            };
            core.state = ResponseState::Headered;
            core.status = code;
            (core.framing, core.keep_alive)
        };

        let head = compose_head(code, content_type, headers, framing, keep_alive);
        self.write(&head, None, false)
    }

    fn send_payload(&mut self, data: &[u8]) -> Result<(), ResponseError> {
        let framing = {
            let mut core = self.core.lock().unwrap();
            match core.state {
                ResponseState::Headered | ResponseState::Streaming => {
                    core.state = ResponseState::Streaming;
                    core.framing
                }
                ResponseState::Open => return Err(ResponseError::HeaderNotSent),
                ResponseState::Closed => return Err(ResponseError::AlreadySent),
            }
        };

        match framing {
            ResponseFraming::Chunked => {
                let mut framed = format!("{:X}\r\n", data.len()).into_bytes();
                framed.extend_from_slice(data);
                framed.extend_from_slice(b"\r\n");
                self.write(&framed, None, false)
            }
            _ => self.write(data, None, false),
        }
    }

    fn finish_response(&mut self) -> Result<(), ResponseError> {
        let (framing, keep_alive, status) = {
            let mut core = self.core.lock().unwrap();
            match core.state {
                ResponseState::Headered | ResponseState::Streaming => {
                    core.state = ResponseState::Closed;
                    (core.framing, core.keep_alive, core.status)
                }
                ResponseState::Open => return Err(ResponseError::HeaderNotSent),
                ResponseState::Closed => return Err(ResponseError::AlreadySent),
            }
        };

        let close_after = !keep_alive || framing == ResponseFraming::UntilClose;
        match framing {
            ResponseFraming::Chunked => self.write(b"0\r\n\r\n", Some(status), close_after),
            _ => self.write(b"", Some(status), close_after),
        }
    }

    fn response_sent(&self) -> bool {
        self.core.lock().unwrap().state == ResponseState::Closed
    }

    fn capture(&mut self) -> Option<Box<dyn RestConnection + Send>> {
        Some(Box::new(self.clone_handle()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_head_with_length() {
        let head = compose_head(200, "text/plain", &RestParams::new(),
                                ResponseFraming::Length(5), true);
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn compose_head_chunked_close() {
        let mut headers = RestParams::new();
        headers.push("X-Custom", "1");
        let head = compose_head(404, "application/json", &headers,
                                ResponseFraming::Chunked, false);
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("X-Custom: 1\r\n"));
    }

    #[test]
    fn assembler_collects_requests() {
        let mut parser = HttpParser::request();
        let mut assembler = RequestAssembler::default();
        parser
            .feed(
                b"POST /v1/x?k=v HTTP/1.1\r\nHost: h\r\nContent-Length: 2\r\n\r\nhi",
                &mut assembler,
            )
            .unwrap();

        let request = assembler.completed.pop_front().unwrap();
        assert_eq!(request.verb, "POST");
        assert_eq!(request.resource, "/v1/x");
        assert_eq!(request.params.get("k"), Some("v"));
        assert_eq!(request.headers.get("host"), Some("h"));
        assert_eq!(request.payload, b"hi");
    }
}
