// src/client.rs
//
// Pooled HTTP client: a bounded request queue multiplexed over a fixed set
// of persistent connections to one host. Requests are admitted from any
// thread; dispatch runs on the reactor via the client's queue eventfd.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender, bounded};

use crate::connection::HttpConnection;
use crate::error::{HttpClientError, ReactorError};
use crate::http::{HttpResponse, Method, RestParams};
use crate::reactor::{
    EventOwner, FdKind, Interest, Reactor, Readiness, RegistrationHandle,
};
use crate::syscalls::EventFd;

/// Request body plus its media type.
#[derive(Debug, Clone)]
pub struct HttpContent {
    pub body: Vec<u8>,
    pub content_type: String,
}

/// Callbacks for one outbound request. Streaming consumers implement the
/// incremental methods; one-shot consumers use [`ResponseCollector`].
pub trait HttpClientEvents: Send + Sync {
    fn on_response_start(&self, _version: &str, _code: u16) {}
    /// One whole response header line, CRLF stripped.
    fn on_header(&self, _line: &[u8]) {}
    fn on_data(&self, _data: &[u8]) {}
    /// Terminal event: the request succeeded or failed with a classified
    /// error. Exactly one call per admitted request.
    fn on_done(&self, result: Result<(), HttpClientError>);
}

/// One outbound request. Immutable once handed to the client.
pub struct HttpRequest {
    pub method: Method,
    /// Path plus optional query string.
    pub resource: String,
    pub headers: RestParams,
    pub content: Option<HttpContent>,
    pub timeout: Option<Duration>,
    pub callbacks: Arc<dyn HttpClientEvents>,
}

struct PoolState {
    connections: Vec<HttpConnection>,
    /// Indices of idle connections.
    avail: Vec<usize>,
    /// Admitted requests waiting for a connection.
    overflow: VecDeque<HttpRequest>,
    shutting_down: bool,
}

struct ClientInner {
    reactor: Reactor,
    queue_tx: Sender<HttpRequest>,
    queue_rx: Receiver<HttpRequest>,
    queue_wakeup: EventFd,
    wake_handle: Mutex<Option<RegistrationHandle>>,
    /// Requests admitted but not yet handed to a connection. Admission is
    /// bounded by `queue_capacity` over this count.
    pending: AtomicUsize,
    queue_capacity: usize,
    /// Connections that have gone idle and may pick up overflow work.
    idle_events: Mutex<VecDeque<usize>>,
    pool: Mutex<PoolState>,
}

/// HTTP client with `num_parallel` persistent connections and a request
/// queue of `queue_size` entries.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl HttpClient {
    pub fn new(
        reactor: &Reactor,
        host: &str,
        port: u16,
        num_parallel: usize,
        queue_size: usize,
    ) -> Result<Self, HttpClientError> {
        let num_parallel = num_parallel.max(1);
        let queue_size = queue_size.max(1);
        let (queue_tx, queue_rx) = bounded(queue_size);

        let inner = Arc::new(ClientInner {
            reactor: reactor.clone(),
            queue_tx,
            queue_rx,
            queue_wakeup: EventFd::new().map_err(HttpClientError::Io)?,
            wake_handle: Mutex::new(None),
            pending: AtomicUsize::new(0),
            queue_capacity: queue_size,
            idle_events: Mutex::new(VecDeque::new()),
            pool: Mutex::new(PoolState {
                connections: Vec::with_capacity(num_parallel),
                avail: (0..num_parallel).rev().collect(),
                overflow: VecDeque::new(),
                shutting_down: false,
            }),
        });

        for index in 0..num_parallel {
            let weak = Arc::downgrade(&inner);
            let on_idle = Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.idle_events.lock().unwrap().push_back(index);
                    inner.queue_wakeup.signal();
                }
            });
            let conn = HttpConnection::new(reactor, host, port, on_idle)
                .map_err(|e| HttpClientError::Send(e.to_string()))?;
            inner.pool.lock().unwrap().connections.push(conn);
        }

        let handle = reactor
            .register(
                inner.queue_wakeup.fd(),
                FdKind::Wakeup,
                Interest::READABLE,
                inner.clone() as Arc<dyn EventOwner>,
            )
            .map_err(|e: ReactorError| HttpClientError::Send(e.to_string()))?;
        *inner.wake_handle.lock().unwrap() = Some(handle);

        Ok(HttpClient { inner })
    }

    /// Admit one request. Returns false when the queue is at capacity; a
    /// request counts against capacity until a connection picks it up.
    pub fn enqueue_request(&self, request: HttpRequest) -> bool {
        let mut current = self.inner.pending.load(Ordering::Acquire);
        loop {
            if current >= self.inner.queue_capacity {
                return false;
            }
            match self.inner.pending.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        if self.inner.queue_tx.try_send(request).is_err() {
            self.inner.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        self.inner.queue_wakeup.signal();
        true
    }

    pub fn get(
        &self,
        resource: &str,
        callbacks: Arc<dyn HttpClientEvents>,
        timeout: Option<Duration>,
    ) -> bool {
        self.request(Method::Get, resource, None, callbacks, timeout)
    }

    pub fn post(
        &self,
        resource: &str,
        content: HttpContent,
        callbacks: Arc<dyn HttpClientEvents>,
        timeout: Option<Duration>,
    ) -> bool {
        self.request(Method::Post, resource, Some(content), callbacks, timeout)
    }

    pub fn put(
        &self,
        resource: &str,
        content: HttpContent,
        callbacks: Arc<dyn HttpClientEvents>,
        timeout: Option<Duration>,
    ) -> bool {
        self.request(Method::Put, resource, Some(content), callbacks, timeout)
    }

    pub fn del(
        &self,
        resource: &str,
        callbacks: Arc<dyn HttpClientEvents>,
        timeout: Option<Duration>,
    ) -> bool {
        self.request(Method::Delete, resource, None, callbacks, timeout)
    }

    fn request(
        &self,
        method: Method,
        resource: &str,
        content: Option<HttpContent>,
        callbacks: Arc<dyn HttpClientEvents>,
        timeout: Option<Duration>,
    ) -> bool {
        self.enqueue_request(HttpRequest {
            method,
            resource: resource.to_string(),
            headers: RestParams::new(),
            content,
            timeout,
            callbacks,
        })
    }

    /// Requests admitted and not yet assigned to a connection.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Fail everything still waiting and tear down the connections.
    /// In-flight requests complete or fail through their own paths.
    pub fn shutdown(&self) {
        let dropped = {
            let mut pool = self.inner.pool.lock().unwrap();
            pool.shutting_down = true;
            let mut dropped: Vec<HttpRequest> = pool.overflow.drain(..).collect();
            while let Ok(request) = self.inner.queue_rx.try_recv() {
                dropped.push(request);
            }
            dropped
        };
        for request in dropped {
            self.inner.pending.fetch_sub(1, Ordering::AcqRel);
            request.callbacks.on_done(Err(HttpClientError::Shutdown));
        }

        let connections = {
            let pool = self.inner.pool.lock().unwrap();
            pool.connections.clone()
        };
        for conn in connections {
            conn.dispose();
        }

        let handle = self.inner.wake_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = self.inner.reactor.unregister(handle);
        }
    }
}

impl ClientInner {
    /// Runs on the reactor when the queue eventfd fires: first give idle
    /// connections overflow work, then drain the public queue.
    fn dispatch(&self) {
        loop {
            let index = {
                let mut events = self.idle_events.lock().unwrap();
                match events.pop_front() {
                    Some(index) => index,
                    None => break,
                }
            };
            self.connection_went_idle(index);
        }

        loop {
            let request = match self.queue_rx.try_recv() {
                Ok(request) => request,
                Err(_) => break,
            };
            let assigned = {
                let mut pool = self.pool.lock().unwrap();
                if pool.shutting_down {
                    None
                } else if let Some(index) = pool.avail.pop() {
                    Some(pool.connections[index].clone())
                } else {
                    pool.overflow.push_back(request);
                    continue;
                }
            };
            match assigned {
                Some(conn) => {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    conn.perform(request);
                }
                None => {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    request.callbacks.on_done(Err(HttpClientError::Shutdown));
                }
            }
        }
    }

    /// Overflow work is reused on the same connection without a round trip
    /// through the idle stack.
    fn connection_went_idle(&self, index: usize) {
        let next = {
            let mut pool = self.pool.lock().unwrap();
            if pool.shutting_down {
                return;
            }
            match pool.overflow.pop_front() {
                Some(request) => Some((pool.connections[index].clone(), request)),
                None => {
                    pool.avail.push(index);
                    None
                }
            }
        };
        if let Some((conn, request)) = next {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            conn.perform(request);
        }
    }
}

impl EventOwner for ClientInner {
    fn on_event(
        &self,
        _reactor: &Reactor,
        _handle: RegistrationHandle,
        _readiness: Readiness,
    ) -> Option<Interest> {
        self.queue_wakeup.drain();
        self.dispatch();
        Some(Interest::READABLE)
    }
}

/* RESPONSE COLLECTOR */

struct CollectorState {
    status: u16,
    headers: RestParams,
    body: BytesMut,
    result: Option<Result<HttpResponse, HttpClientError>>,
}

/// Accumulates a whole response and hands it out as one structured value.
pub struct ResponseCollector {
    state: Mutex<CollectorState>,
    cond: Condvar,
}

impl ResponseCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(ResponseCollector {
            state: Mutex::new(CollectorState {
                status: 0,
                headers: RestParams::new(),
                body: BytesMut::new(),
                result: None,
            }),
            cond: Condvar::new(),
        })
    }

    /// Block until the request settles. Consumes the stored outcome.
    pub fn wait(&self) -> Result<HttpResponse, HttpClientError> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(result) = state.result.take() {
                return result;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<HttpResponse, HttpClientError>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(result) = state.result.take() {
                return Some(result);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }
}

impl HttpClientEvents for ResponseCollector {
    fn on_response_start(&self, _version: &str, code: u16) {
        self.state.lock().unwrap().status = code;
    }

    fn on_header(&self, line: &[u8]) {
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
            let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();
            self.state.lock().unwrap().headers.push(name, value);
        }
    }

    fn on_data(&self, data: &[u8]) {
        self.state.lock().unwrap().body.extend_from_slice(data);
    }

    fn on_done(&self, result: Result<(), HttpClientError>) {
        let mut state = self.state.lock().unwrap();
        let outcome = match result {
            Ok(()) => Ok(HttpResponse {
                status: state.status,
                headers: std::mem::take(&mut state.headers),
                body: std::mem::take(&mut state.body).freeze(),
            }),
            Err(e) => Err(e),
        };
        state.result = Some(outcome);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_assembles_response() {
        let collector = ResponseCollector::new();
        collector.on_response_start("HTTP/1.1", 200);
        collector.on_header(b"Content-Type: text/plain");
        collector.on_data(b"hel");
        collector.on_data(b"lo");
        collector.on_done(Ok(()));

        let response = collector.wait().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("content-type"), Some("text/plain"));
        assert_eq!(&response.body[..], b"hello");
    }

    #[test]
    fn collector_propagates_failure() {
        let collector = ResponseCollector::new();
        collector.on_done(Err(HttpClientError::Timeout));
        assert!(matches!(
            collector.wait(),
            Err(HttpClientError::Timeout)
        ));
    }

    #[test]
    fn collector_wait_timeout_expires() {
        let collector = ResponseCollector::new();
        assert!(collector
            .wait_timeout(Duration::from_millis(20))
            .is_none());
    }
}
