use std::io;

use thiserror::Error;

/// Errors surfaced by the reactor. All of these are fatal to the affected
/// registration or to the reactor itself; recoverable conditions (a full
/// queue, a parse failure) have their own channels.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// epoll/eventfd/timerfd syscall failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A second registration was attempted for an fd already in the table.
    #[error("fd {0} is already registered")]
    FdAlreadyRegistered(i32),
    /// The handle refers to a registration that was unregistered.
    #[error("stale registration handle")]
    StaleHandle,
    /// The reactor is shutting down and refuses new work.
    #[error("reactor is shutting down")]
    ShuttingDown,
}

/// Errors from the client TCP socket.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Reactor(#[from] ReactorError),
    /// Operation not legal in the current connection state.
    #[error("invalid socket state: {0}")]
    InvalidState(&'static str),
    /// Bad host or port passed to `open`.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Syntactic failures from the streaming HTTP parsers. Any of these is
/// terminal for the message being parsed; the owning connection must close
/// the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpParseError {
    #[error("status line does not start with HTTP/")]
    BadVersion,
    #[error("invalid status code")]
    BadStatusCode,
    #[error("malformed request line")]
    BadRequestLine,
    #[error("malformed header line")]
    BadHeader,
    #[error("invalid chunk size")]
    BadChunkSize,
    #[error("missing CRLF after chunk data")]
    BadChunkTerminator,
    #[error("message carries both Content-Length and chunked encoding")]
    ConflictingFraming,
    #[error("header line too long")]
    LineTooLong,
    #[error("peer closed mid-message")]
    TruncatedMessage,
    #[error("parser already failed")]
    AlreadyFailed,
}

/// Classified failure of one HTTP client request, per the transport /
/// protocol / resource taxonomy.
#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("host name could not be resolved")]
    HostUnknown,
    #[error("could not connect to host")]
    CouldNotConnect,
    #[error("request deadline expired")]
    Timeout,
    #[error("connection closed before the response completed")]
    ConnectionClosed,
    #[error("protocol error: {0}")]
    Protocol(#[from] HttpParseError),
    #[error("a request is already in flight on this connection")]
    Busy,
    #[error("client is shutting down")]
    Shutdown,
    #[error("send error: {0}")]
    Send(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from the response-writing side of a REST connection.
#[derive(Debug, Error)]
pub enum ResponseError {
    /// A terminal response was already emitted on this connection.
    #[error("response already sent")]
    AlreadySent,
    /// `send_payload`/`finish_response` before `send_http_response_header`.
    #[error("response header not sent yet")]
    HeaderNotSent,
    /// The underlying transport is gone.
    #[error("connection is closed")]
    Disconnected,
}

/// Errors from the REST service endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Reactor(#[from] ReactorError),
    #[error("endpoint is not bound")]
    NotBound,
    #[error("endpoint is already bound")]
    AlreadyBound,
}
