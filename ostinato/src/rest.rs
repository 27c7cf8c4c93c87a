// src/rest.rs
//
// The request/response surface handlers see: a RestRequest describing what
// arrived, and a RestConnection capability for emitting exactly one
// response, either one-shot or streamed.

use crate::error::ResponseError;
use crate::http::RestParams;

/// One parsed request, detached from its transport.
#[derive(Debug, Clone, Default)]
pub struct RestRequest {
    /// Uppercase HTTP method.
    pub verb: String,
    /// Path without the query string.
    pub resource: String,
    /// Decoded query parameters, in order of appearance.
    pub params: RestParams,
    pub headers: RestParams,
    pub payload: Vec<u8>,
}

impl RestRequest {
    pub fn new(verb: &str, resource: &str) -> Self {
        RestRequest {
            verb: verb.to_string(),
            resource: resource.to_string(),
            ..Default::default()
        }
    }

    /// Build from a request target, splitting off the query string.
    pub fn from_target(verb: &str, target: &str) -> Self {
        let (resource, params) = match target.split_once('?') {
            Some((path, query)) => (path, RestParams::from_query_string(query)),
            None => (target, RestParams::new()),
        };
        RestRequest {
            verb: verb.to_string(),
            resource: resource.to_string(),
            params,
            headers: RestParams::new(),
            payload: Vec::new(),
        }
    }

    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl std::fmt::Display for RestRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.verb, self.resource)
    }
}

/// Content length declaration for a streaming response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentLen {
    /// Emit a Content-Length header.
    Known(u64),
    /// No length known ahead of time; the connection closes at the end.
    Unknown,
    /// Transfer-Encoding: chunked.
    Chunked,
}

/// Progress of the single response a connection may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    Open,
    Headered,
    Streaming,
    Closed,
}

/// Capability object a handler uses to emit its response exactly once.
///
/// One-shot path: `send_response` (or one of its wrappers). Streaming path:
/// `send_http_response_header`, zero or more `send_payload`, then
/// `finish_response`. After the terminal emission every further call fails
/// with [`ResponseError::AlreadySent`].
pub trait RestConnection {
    fn send_response(
        &mut self,
        code: u16,
        body: &[u8],
        content_type: &str,
    ) -> Result<(), ResponseError>;

    fn send_http_response(
        &mut self,
        code: u16,
        body: &[u8],
        content_type: &str,
        headers: &RestParams,
    ) -> Result<(), ResponseError>;

    fn send_http_response_header(
        &mut self,
        code: u16,
        content_type: &str,
        content_length: ContentLen,
        headers: &RestParams,
    ) -> Result<(), ResponseError>;

    fn send_payload(&mut self, data: &[u8]) -> Result<(), ResponseError>;

    fn finish_response(&mut self) -> Result<(), ResponseError>;

    fn send_error_response(&mut self, code: u16, message: &str) -> Result<(), ResponseError> {
        self.send_response(code, message.as_bytes(), "text/plain")
    }

    fn send_redirect(&mut self, code: u16, location: &str) -> Result<(), ResponseError> {
        let mut headers = RestParams::new();
        headers.push("Location", location);
        self.send_http_response(code, b"", "", &headers)
    }

    /// Authoritative check used by the router to skip further dispatch.
    fn response_sent(&self) -> bool;

    /// Detach a handle for responding asynchronously, where the transport
    /// supports it.
    fn capture(&mut self) -> Option<Box<dyn RestConnection + Send>> {
        None
    }
}

/// RestConnection that captures the response in memory. Used by tests and
/// by anything embedding the router without a transport.
#[derive(Debug)]
pub struct InProcessRestConnection {
    state: ResponseState,
    pub status: u16,
    pub content_type: String,
    pub headers: RestParams,
    pub body: Vec<u8>,
}

impl InProcessRestConnection {
    pub fn new() -> Self {
        InProcessRestConnection {
            state: ResponseState::Open,
            status: 0,
            content_type: String::new(),
            headers: RestParams::new(),
            body: Vec::new(),
        }
    }

    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    fn ensure_open(&self) -> Result<(), ResponseError> {
        match self.state {
            ResponseState::Open => Ok(()),
            _ => Err(ResponseError::AlreadySent),
        }
    }
}

impl Default for InProcessRestConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl RestConnection for InProcessRestConnection {
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
        self.ensure_open()?;
        self.status = code;
        self.content_type = content_type.to_string();
        self.headers = headers.clone();
        self.body = body.to_vec();
        self.state = ResponseState::Closed;
        Ok(())
    }

    fn send_http_response_header(
        &mut self,
        code: u16,
        content_type: &str,
        _content_length: ContentLen,
        headers: &RestParams,
    ) -> Result<(), ResponseError> {
        self.ensure_open()?;
        self.status = code;
        self.content_type = content_type.to_string();
        self.headers = headers.clone();
        self.state = ResponseState::Headered;
        Ok(())
    }

    fn send_payload(&mut self, data: &[u8]) -> Result<(), ResponseError> {
        match self.state {
            ResponseState::Headered | ResponseState::Streaming => {
                self.state = ResponseState::Streaming;
                self.body.extend_from_slice(data);
                Ok(())
            }
            ResponseState::Open => Err(ResponseError::HeaderNotSent),
            ResponseState::Closed => Err(ResponseError::AlreadySent),
        }
    }

    fn finish_response(&mut self) -> Result<(), ResponseError> {
        match self.state {
            ResponseState::Headered | ResponseState::Streaming => {
                self.state = ResponseState::Closed;
                Ok(())
            }
            ResponseState::Open => Err(ResponseError::HeaderNotSent),
            ResponseState::Closed => Err(ResponseError::AlreadySent),
        }
    }

    fn response_sent(&self) -> bool {
        self.state == ResponseState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_response_closes() {
        let mut conn = InProcessRestConnection::new();
        assert!(!conn.response_sent());

        conn.send_response(200, b"ok", "text/plain").unwrap();
        assert!(conn.response_sent());
        assert_eq!(conn.status, 200);
        assert_eq!(conn.body_str(), "ok");

        // Second terminal emission fails explicitly.
        assert!(matches!(
            conn.send_response(500, b"again", "text/plain"),
            Err(ResponseError::AlreadySent)
        ));
    }

    #[test]
    fn streaming_response_accumulates() {
        let mut conn = InProcessRestConnection::new();
        conn.send_http_response_header(200, "text/plain", ContentLen::Chunked, &RestParams::new())
            .unwrap();
        assert!(!conn.response_sent());

        conn.send_payload(b"hello ").unwrap();
        conn.send_payload(b"world").unwrap();
        conn.finish_response().unwrap();

        assert!(conn.response_sent());
        assert_eq!(conn.body_str(), "hello world");
        assert!(matches!(
            conn.send_payload(b"late"),
            Err(ResponseError::AlreadySent)
        ));
    }

    #[test]
    fn payload_before_header_is_rejected() {
        let mut conn = InProcessRestConnection::new();
        assert!(matches!(
            conn.send_payload(b"x"),
            Err(ResponseError::HeaderNotSent)
        ));
    }

    #[test]
    fn redirect_sets_location() {
        let mut conn = InProcessRestConnection::new();
        conn.send_redirect(302, "/elsewhere").unwrap();
        assert_eq!(conn.status, 302);
        assert_eq!(conn.headers.get("Location"), Some("/elsewhere"));
    }

    #[test]
    fn request_target_splits_query() {
        let req = RestRequest::from_target("GET", "/v1/items?limit=5&full");
        assert_eq!(req.resource, "/v1/items");
        assert_eq!(req.params.get("limit"), Some("5"));
        assert_eq!(req.params.get("full"), Some(""));
    }
}
