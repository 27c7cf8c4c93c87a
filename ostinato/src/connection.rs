// src/connection.rs
//
// One HTTP request/response at a time over one client TCP socket. Bridges
// the streaming response parser to the user's callback set, arms the
// per-request deadline, and reports completion to its owner (the pool).
//
// Locking rules: socket callbacks run inside the socket's I/O lock, so this
// module only calls lock-free socket operations (`write`, `request_close`,
// `state`) from callback context. Reconnects happen from `kick`, which runs
// from the pool's dispatch path or a reactor timer, never from a socket
// callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::{HttpClientEvents, HttpRequest};
use crate::error::{HttpClientError, SocketError};
use crate::http::Method;
use crate::parser::{HttpEvents, HttpParser};
use crate::reactor::{Reactor, RegistrationHandle};
use crate::socket::{ConnectionResult, SocketCallbacks, SocketState, TcpClientSocket};

/// Progress of the outbound half of the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Idle,
    Headers,
    Body,
}

struct ActiveRequest {
    callbacks: Arc<dyn HttpClientEvents>,
    head: Vec<u8>,
    body: Vec<u8>,
    timeout: Option<Duration>,
    sent: bool,
}

struct ConnState {
    parser: HttpParser,
    request: Option<ActiveRequest>,
    send_state: SendState,
    timeout_handle: Option<RegistrationHandle>,
    messages_unacked: usize,
}

struct ConnShared {
    reactor: Reactor,
    host: String,
    port: u16,
    state: Mutex<ConnState>,
    socket: std::sync::OnceLock<TcpClientSocket>,
    /// Sequence number of the current request, to ignore stale deadline
    /// timers.
    seq: AtomicU64,
    /// Invoked once per completed request, with no locks held by this
    /// module other than the socket's I/O lock (callback context).
    on_idle: Box<dyn Fn() + Send + Sync>,
}

/// A persistent client connection to one host, carrying at most one
/// outstanding request. Pipelining is unsupported by design.
#[derive(Clone)]
pub struct HttpConnection {
    shared: Arc<ConnShared>,
}

/// Forwards parser events to the user callbacks and records the terminal
/// event for the connection to act on after the feed.
struct ResponseBridge<'a> {
    callbacks: Option<Arc<dyn HttpClientEvents>>,
    done: &'a mut Option<bool>,
}

impl HttpEvents for ResponseBridge<'_> {
    fn on_response_start(&mut self, version: &str, code: u16) {
        if let Some(cb) = &self.callbacks {
            cb.on_response_start(version, code);
        }
    }

    fn on_header(&mut self, line: &[u8]) {
        if let Some(cb) = &self.callbacks {
            cb.on_header(line);
        }
    }

    fn on_data(&mut self, data: &[u8]) {
        if let Some(cb) = &self.callbacks {
            cb.on_data(data);
        }
    }

    fn on_done(&mut self, success: bool) {
        *self.done = Some(success);
    }
}

impl HttpConnection {
    pub fn new(
        reactor: &Reactor,
        host: &str,
        port: u16,
        on_idle: Box<dyn Fn() + Send + Sync>,
    ) -> Result<Self, SocketError> {
        let shared = Arc::new(ConnShared {
            reactor: reactor.clone(),
            host: host.to_string(),
            port,
            state: Mutex::new(ConnState {
                parser: HttpParser::response(),
                request: None,
                send_state: SendState::Idle,
                timeout_handle: None,
                messages_unacked: 0,
            }),
            socket: std::sync::OnceLock::new(),
            seq: AtomicU64::new(0),
            on_idle,
        });

        let callbacks = SocketCallbacks {
            on_connection_result: Some(Box::new({
                let weak = Arc::downgrade(&shared);
                move |result, _lost| {
                    if let Some(shared) = weak.upgrade() {
                        shared.handle_connection_result(result);
                    }
                }
            })),
            on_received_data: Some(Box::new({
                let weak = Arc::downgrade(&shared);
                move |data| {
                    if let Some(shared) = weak.upgrade() {
                        shared.handle_received_data(data);
                    }
                }
            })),
            on_disconnected: Some(Box::new({
                let weak = Arc::downgrade(&shared);
                move |from_peer| {
                    if let Some(shared) = weak.upgrade() {
                        shared.handle_disconnected(from_peer);
                    }
                }
            })),
            on_write_result: Some(Box::new({
                let weak = Arc::downgrade(&shared);
                move |result| {
                    if let Some(shared) = weak.upgrade() {
                        shared.handle_write_result(result);
                    }
                }
            })),
        };

        let socket = TcpClientSocket::new(reactor, callbacks, 8)?;
        let _ = shared.socket.set(socket);

        Ok(HttpConnection { shared })
    }

    /// Accept a request. Legal only when idle; anything else is a caller
    /// bug, reported through the request's own callback.
    pub fn perform(&self, request: HttpRequest) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.request.is_some() {
                tracing::error!("perform() on a busy connection; aborting it");
                drop(state);
                self.shared.socket().request_close();
                request.callbacks.on_done(Err(HttpClientError::Busy));
                return;
            }

            let head = serialize_head(&self.shared.host, self.shared.port, &request);
            let body = request
                .content
                .as_ref()
                .map(|c| c.body.clone())
                .unwrap_or_default();

            state.parser = HttpParser::response();
            state.parser.set_expect_body(request.method != Method::Head);
            state.send_state = SendState::Idle;
            state.messages_unacked = 0;
            state.request = Some(ActiveRequest {
                callbacks: request.callbacks.clone(),
                head,
                body,
                timeout: request.timeout,
                sent: false,
            });
        }

        self.shared.seq.fetch_add(1, Ordering::AcqRel);
        ConnShared::arm_deadline(&self.shared);
        self.shared.clone().kick();
    }

    /// Tear the connection down for good.
    pub fn dispose(&self) {
        self.shared.socket().dispose();
    }

    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.request.is_none() && state.send_state == SendState::Idle
    }
}

impl ConnShared {
    fn socket(&self) -> &TcpClientSocket {
        self.socket.get().expect("socket is set at construction")
    }

    /// Drive the stored request toward the wire, reconnecting if needed.
    /// Never called from socket callback context.
    fn kick(self: Arc<Self>) {
        match self.socket().state() {
            SocketState::Connected | SocketState::Connecting => self.send_if_needed(),
            SocketState::Disconnected => self.start_connect(),
            SocketState::Disconnecting => {
                // The previous transport is still draining; try again once
                // it has gone down.
                let weak = Arc::downgrade(&self);
                let result = self.reactor.add_timeout(Duration::from_millis(1), move |_| {
                    if let Some(shared) = weak.upgrade() {
                        shared.kick();
                    }
                });
                if let Err(e) = result {
                    tracing::error!("could not arm reconnect timer: {}", e);
                    self.fail_request(HttpClientError::Shutdown);
                }
            }
        }
    }

    fn start_connect(&self) {
        let result = self
            .socket()
            .open(&self.host, self.port)
            .and_then(|_| self.socket().connect());
        if let Err(e) = result {
            tracing::debug!("connect failed synchronously: {}", e);
            self.fail_request(HttpClientError::CouldNotConnect);
        }
    }

    /// Queue the serialized request head and body once.
    fn send_if_needed(&self) {
        let (head, body) = {
            let mut state = self.state.lock().unwrap();
            let Some(request) = state.request.as_mut() else {
                return;
            };
            if request.sent {
                return;
            }
            request.sent = true;
            let head = std::mem::take(&mut request.head);
            let body = std::mem::take(&mut request.body);
            state.send_state = SendState::Headers;
            state.messages_unacked = 1 + usize::from(!body.is_empty());
            (head, body)
        };

        if !self.queue_message(head) {
            return;
        }
        if !body.is_empty() {
            self.queue_message(body);
        }
    }

    fn queue_message(&self, data: Vec<u8>) -> bool {
        match self.socket().write(data) {
            Ok(true) => true,
            Ok(false) => {
                self.fail_request(HttpClientError::Send("socket queue full".to_string()));
                false
            }
            Err(e) => {
                self.fail_request(HttpClientError::Send(e.to_string()));
                false
            }
        }
    }

    fn arm_deadline(this: &Arc<Self>) {
        let timeout = {
            let state = this.state.lock().unwrap();
            state.request.as_ref().and_then(|r| r.timeout)
        };
        let Some(timeout) = timeout else { return };

        let seq = this.seq.load(Ordering::Acquire);
        let weak = Arc::downgrade(this);
        let handle = this.reactor.add_timeout(timeout, move |_| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_deadline(seq);
            }
        });
        match handle {
            Ok(handle) => {
                this.state.lock().unwrap().timeout_handle = Some(handle);
            }
            Err(e) => tracing::error!("could not arm request deadline: {}", e),
        }
    }

    /// Deadline expired before completion: fail the request and close the
    /// transport. Runs from a reactor timer, so closing is legal here.
    fn handle_deadline(&self, seq: u64) {
        if self.seq.load(Ordering::Acquire) != seq {
            return; // a newer request owns the connection
        }
        let request = {
            let mut state = self.state.lock().unwrap();
            state.timeout_handle = None;
            state.request.take()
        };
        let Some(request) = request else { return };

        tracing::debug!("request deadline expired");
        self.socket().close();
        request.callbacks.on_done(Err(HttpClientError::Timeout));
        (self.on_idle)();
    }

    fn cancel_deadline(&self) {
        let handle = self.state.lock().unwrap().timeout_handle.take();
        if let Some(handle) = handle {
            // The timer may have fired already; stale handles are fine.
            let _ = self.reactor.unregister(handle);
        }
    }

    fn handle_connection_result(&self, result: ConnectionResult) {
        match result {
            ConnectionResult::Success => self.send_if_needed(),
            ConnectionResult::HostUnknown => self.fail_request(HttpClientError::HostUnknown),
            ConnectionResult::CouldNotConnect => {
                self.fail_request(HttpClientError::CouldNotConnect)
            }
            ConnectionResult::Timeout => self.fail_request(HttpClientError::Timeout),
        }
    }

    fn handle_received_data(&self, data: &[u8]) {
        let mut done: Option<bool> = None;
        let feed_result = {
            let mut state = self.state.lock().unwrap();
            let state = &mut *state;
            let mut bridge = ResponseBridge {
                callbacks: state.request.as_ref().map(|r| r.callbacks.clone()),
                done: &mut done,
            };
            state.parser.feed(data, &mut bridge)
        };

        match feed_result {
            Ok(()) => {
                if done == Some(true) {
                    self.finish_request(Ok(()));
                }
            }
            Err(e) => {
                tracing::debug!("response parse error: {}", e);
                // Protocol errors additionally close the transport.
                self.socket().request_close();
                self.finish_request(Err(HttpClientError::Protocol(e)));
            }
        }
    }

    fn handle_write_result(&self, result: std::io::Result<usize>) {
        match result {
            Ok(_) => {
                let mut state = self.state.lock().unwrap();
                if state.messages_unacked > 0 {
                    state.messages_unacked -= 1;
                    state.send_state = if state.messages_unacked == 0 {
                        SendState::Idle
                    } else {
                        SendState::Body
                    };
                }
            }
            Err(e) => {
                self.finish_request(Err(HttpClientError::Io(e)));
            }
        }
    }

    fn handle_disconnected(&self, _from_peer: bool) {
        let has_request = self.state.lock().unwrap().request.is_some();
        if !has_request {
            return;
        }

        // The body may legitimately end at EOF (until-close framing).
        let mut done: Option<bool> = None;
        let close_result = {
            let mut state = self.state.lock().unwrap();
            let state = &mut *state;
            let mut bridge = ResponseBridge {
                callbacks: state.request.as_ref().map(|r| r.callbacks.clone()),
                done: &mut done,
            };
            state.parser.finish_on_close(&mut bridge)
        };

        match close_result {
            Ok(()) if done == Some(true) => self.finish_request(Ok(())),
            Ok(()) => self.finish_request(Err(HttpClientError::ConnectionClosed)),
            Err(_) => self.finish_request(Err(HttpClientError::ConnectionClosed)),
        }
    }

    /// Successful or failed, the request is over: notify the user and the
    /// owner, and close the transport when the response demanded it.
    fn finish_request(&self, result: Result<(), HttpClientError>) {
        self.cancel_deadline();

        let (request, require_close) = {
            let mut state = self.state.lock().unwrap();
            let require_close = state.parser.require_close() || state.parser.has_failed();
            state.send_state = SendState::Idle;
            (state.request.take(), require_close)
        };
        let Some(request) = request else { return };

        if require_close && self.socket().can_send_messages() {
            self.socket().request_close();
        }

        request.callbacks.on_done(result);
        (self.on_idle)();
    }

    fn fail_request(&self, error: HttpClientError) {
        self.finish_request(Err(error));
    }
}

fn serialize_head(host: &str, port: u16, request: &HttpRequest) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(request.method.as_str().as_bytes());
    head.push(b' ');
    let resource = if request.resource.is_empty() {
        "/"
    } else {
        &request.resource
    };
    head.extend_from_slice(resource.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");

    if !request.headers.contains("Host") {
        head.extend_from_slice(format!("Host: {}:{}\r\n", host, port).as_bytes());
    }
    for (name, value) in request.headers.iter() {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    if let Some(content) = &request.content {
        if !content.content_type.is_empty() {
            head.extend_from_slice(b"Content-Type: ");
            head.extend_from_slice(content.content_type.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(format!("Content-Length: {}\r\n", content.body.len()).as_bytes());
    }
    head.extend_from_slice(b"\r\n");
    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HttpContent;
    use crate::http::RestParams;

    fn dummy_request(method: Method, content: Option<HttpContent>) -> HttpRequest {
        struct Nop;
        impl HttpClientEvents for Nop {
            fn on_done(&self, _result: Result<(), HttpClientError>) {}
        }
        HttpRequest {
            method,
            resource: "/v1/things".to_string(),
            headers: RestParams::new(),
            content,
            timeout: None,
            callbacks: Arc::new(Nop),
        }
    }

    #[test]
    fn head_serialization_includes_host_and_length() {
        let request = dummy_request(
            Method::Post,
            Some(HttpContent {
                body: b"{}".to_vec(),
                content_type: "application/json".to_string(),
            }),
        );
        let head = serialize_head("example.org", 8080, &request);
        let text = String::from_utf8(head).unwrap();

        assert!(text.starts_with("POST /v1/things HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.org:8080\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn explicit_host_header_is_not_duplicated() {
        let mut request = dummy_request(Method::Get, None);
        request.headers.push("host", "override.example");
        let head = serialize_head("example.org", 80, &request);
        let text = String::from_utf8(head).unwrap();

        assert!(text.contains("host: override.example\r\n"));
        assert!(!text.contains("example.org"));
    }

    #[test]
    fn empty_resource_becomes_root() {
        let mut request = dummy_request(Method::Get, None);
        request.resource = String::new();
        let head = serialize_head("h", 80, &request);
        assert!(head.starts_with(b"GET / HTTP/1.1\r\n"));
    }
}
