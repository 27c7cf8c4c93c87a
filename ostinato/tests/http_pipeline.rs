// End-to-end coverage: endpoint + router on one side, pooled client or a
// plain blocking socket on the other, over real loopback connections.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use ostinato::{
    ContentLen, HttpClient, HttpClientError, HttpContent, MatchResult, Reactor, ReactorConfig,
    ResponseCollector, RestConnection, RestParams, RestServiceEndpoint, Router, on, rx,
};

fn reactor(threads: usize) -> Reactor {
    Reactor::new(ReactorConfig::default().threads(threads).name("test")).unwrap()
}

fn demo_router() -> Router {
    let mut router = Router::new();
    let v1 = router.add_sub_router("/v1", "version 1 API");
    v1.add_route(
        "/hello",
        "GET",
        "say hello",
        on(|conn, _req, _ctx| {
            conn.send_response(200, b"hello, world", "text/plain").unwrap();
            MatchResult::Matched
        }),
    );
    v1.add_route(
        "/echo",
        "POST",
        "echo the payload",
        on(|conn, req, _ctx| {
            conn.send_response(200, &req.payload, "application/octet-stream")
                .unwrap();
            MatchResult::Matched
        }),
    );
    v1.add_route(
        rx("/items/([0-9]+)", "/items/<id>"),
        "GET",
        "fetch one item",
        on(|conn, _req, ctx| {
            let id = ctx.resources.last().unwrap().clone();
            conn.send_response(200, format!("item {}", id).as_bytes(), "text/plain")
                .unwrap();
            MatchResult::Matched
        }),
    );
    v1.add_route(
        "/stream",
        "GET",
        "streamed body",
        on(|conn, _req, _ctx| {
            conn.send_http_response_header(200, "text/plain", ContentLen::Chunked, &RestParams::new())
                .unwrap();
            conn.send_payload(b"hello").unwrap();
            conn.send_payload(b" world").unwrap();
            conn.finish_response().unwrap();
            MatchResult::Matched
        }),
    );
    router
}

fn start_service() -> (Reactor, RestServiceEndpoint, u16) {
    let reactor = reactor(2);
    let endpoint = RestServiceEndpoint::new(&reactor, demo_router());
    let port = endpoint.bind("127.0.0.1", 0).unwrap();
    (reactor, endpoint, port)
}

#[test]
fn get_over_the_pooled_client() {
    let (reactor, endpoint, port) = start_service();
    let client = HttpClient::new(&reactor, "127.0.0.1", port, 2, 8).unwrap();

    let collector = ResponseCollector::new();
    assert!(client.get("/v1/hello", collector.clone(), Some(Duration::from_secs(5))));

    let response = collector
        .wait_timeout(Duration::from_secs(10))
        .expect("request did not settle")
        .expect("request failed");
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"hello, world");
    assert_eq!(response.headers.get("content-type"), Some("text/plain"));

    client.shutdown();
    endpoint.shutdown();
    reactor.shutdown();
}

#[test]
fn post_echoes_payload() {
    let (reactor, endpoint, port) = start_service();
    let client = HttpClient::new(&reactor, "127.0.0.1", port, 1, 4).unwrap();

    let collector = ResponseCollector::new();
    assert!(client.post(
        "/v1/echo",
        HttpContent {
            body: b"the payload".to_vec(),
            content_type: "application/octet-stream".to_string(),
        },
        collector.clone(),
        Some(Duration::from_secs(5)),
    ));

    let response = collector
        .wait_timeout(Duration::from_secs(10))
        .expect("request did not settle")
        .expect("request failed");
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"the payload");

    client.shutdown();
    endpoint.shutdown();
    reactor.shutdown();
}

#[test]
fn regex_route_and_keep_alive_reuse() {
    let (reactor, endpoint, port) = start_service();
    // One connection: the second request must reuse it.
    let client = HttpClient::new(&reactor, "127.0.0.1", port, 1, 4).unwrap();

    for id in ["42", "7"] {
        let collector = ResponseCollector::new();
        assert!(client.get(
            &format!("/v1/items/{}", id),
            collector.clone(),
            Some(Duration::from_secs(5)),
        ));
        let response = collector
            .wait_timeout(Duration::from_secs(10))
            .expect("request did not settle")
            .expect("request failed");
        assert_eq!(response.status, 200);
        assert_eq!(response.body_str(), format!("item {}", id));
    }

    client.shutdown();
    endpoint.shutdown();
    reactor.shutdown();
}

#[test]
fn chunked_response_reassembles_at_the_client() {
    let (reactor, endpoint, port) = start_service();
    let client = HttpClient::new(&reactor, "127.0.0.1", port, 1, 4).unwrap();

    let collector = ResponseCollector::new();
    assert!(client.get("/v1/stream", collector.clone(), Some(Duration::from_secs(5))));

    let response = collector
        .wait_timeout(Duration::from_secs(10))
        .expect("request did not settle")
        .expect("request failed");
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"hello world");

    client.shutdown();
    endpoint.shutdown();
    reactor.shutdown();
}

#[test]
fn unknown_route_is_404() {
    let (reactor, endpoint, port) = start_service();
    let client = HttpClient::new(&reactor, "127.0.0.1", port, 1, 4).unwrap();

    let collector = ResponseCollector::new();
    assert!(client.get("/v1/nonexistent", collector.clone(), Some(Duration::from_secs(5))));

    let response = collector
        .wait_timeout(Duration::from_secs(10))
        .expect("request did not settle")
        .expect("request failed");
    assert_eq!(response.status, 404);

    client.shutdown();
    endpoint.shutdown();
    reactor.shutdown();
}

#[test]
fn options_lists_allowed_verbs() {
    let (reactor, endpoint, port) = start_service();

    // Raw blocking client; OPTIONS is synthesized by the router.
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .write_all(b"OPTIONS /v1/hello HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("Allow: GET"), "got: {}", response);

    endpoint.shutdown();
    reactor.shutdown();
}

#[test]
fn raw_request_split_across_writes() {
    let (reactor, endpoint, port) = start_service();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let wire = b"GET /v1/hello HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n";
    // Dribble the request to exercise the carry-over path.
    for chunk in wire.chunks(7) {
        stream.write_all(chunk).unwrap();
        stream.flush().unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.ends_with("hello, world"), "got: {}", response);

    endpoint.shutdown();
    reactor.shutdown();
}

#[test]
fn malformed_request_gets_400_and_close() {
    let (reactor, endpoint, port) = start_service();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .write_all(b"GET /v1/hello HTTP/1.1\r\nBroken header line\r\n\r\n")
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    assert!(response.starts_with("HTTP/1.1 400"), "got: {}", response);

    endpoint.shutdown();
    reactor.shutdown();
}

struct SilentServer {
    port: u16,
    stop: std::sync::mpsc::Sender<()>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl SilentServer {
    /// Accepts connections and reads from them, but never responds.
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        listener.set_nonblocking(true).unwrap();
        let (stop, stop_rx) = std::sync::mpsc::channel::<()>();

        let handle = std::thread::spawn(move || {
            let mut streams: Vec<TcpStream> = Vec::new();
            loop {
                if stop_rx.try_recv().is_ok() {
                    return;
                }
                match listener.accept() {
                    Ok((stream, _)) => {
                        stream.set_nonblocking(true).unwrap();
                        streams.push(stream);
                    }
                    Err(_) => std::thread::sleep(Duration::from_millis(5)),
                }
                for stream in &mut streams {
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf);
                }
            }
        });

        SilentServer {
            port,
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for SilentServer {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[test]
fn pool_admission_is_bounded() {
    let server = SilentServer::start();
    let reactor = reactor(2);
    // Two connections, queue capacity four.
    let client = HttpClient::new(&reactor, "127.0.0.1", server.port, 2, 4).unwrap();

    // Occupy both connections.
    for _ in 0..2 {
        let collector = ResponseCollector::new();
        assert!(client.get("/slow", collector, None));
    }
    // Wait until both are assigned (admitted count drops to zero).
    let deadline = Instant::now() + Duration::from_secs(5);
    while client.pending_requests() > 0 {
        assert!(Instant::now() < deadline, "requests were never assigned");
        std::thread::sleep(Duration::from_millis(10));
    }

    // Four more fill the queue; they stay admitted-but-unassigned.
    for i in 0..4 {
        let collector = ResponseCollector::new();
        assert!(client.get("/slow", collector, None), "submission {} failed", i);
    }
    assert_eq!(client.pending_requests(), 4);

    // Beyond the busy set plus the queue, admission fails.
    for _ in 0..3 {
        let collector = ResponseCollector::new();
        assert!(!client.get("/slow", collector, None));
    }

    client.shutdown();
    reactor.shutdown();
}

#[test]
fn request_deadline_expires() {
    let server = SilentServer::start();
    let reactor = reactor(1);
    let client = HttpClient::new(&reactor, "127.0.0.1", server.port, 1, 4).unwrap();

    let collector = ResponseCollector::new();
    assert!(client.get("/never", collector.clone(), Some(Duration::from_millis(200))));

    let result = collector
        .wait_timeout(Duration::from_secs(10))
        .expect("deadline never fired");
    match result {
        Err(HttpClientError::Timeout) => {}
        Err(other) => panic!("expected Timeout, got {:?}", other),
        Ok(response) => panic!("expected Timeout, got status {}", response.status),
    }

    client.shutdown();
    reactor.shutdown();
}

#[test]
fn shutdown_fails_waiting_requests() {
    let server = SilentServer::start();
    let reactor = reactor(1);
    let client = HttpClient::new(&reactor, "127.0.0.1", server.port, 1, 8).unwrap();

    // One in flight, several waiting.
    let in_flight = ResponseCollector::new();
    assert!(client.get("/slow", in_flight, None));
    let waiting: Vec<_> = (0..3)
        .map(|_| {
            let collector = ResponseCollector::new();
            assert!(client.get("/slow", collector.clone(), None));
            collector
        })
        .collect();

    std::thread::sleep(Duration::from_millis(100));
    client.shutdown();

    for collector in waiting {
        let result = collector
            .wait_timeout(Duration::from_secs(5))
            .expect("waiting request was never failed");
        assert!(matches!(
            result,
            Err(HttpClientError::Shutdown) | Err(HttpClientError::ConnectionClosed)
        ));
    }

    reactor.shutdown();
}
