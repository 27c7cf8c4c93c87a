// src/lib.rs
pub mod client;
pub mod connection;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod reactor;
pub mod rest;
pub mod router;
pub mod server;
pub mod socket;
pub mod syscalls;

// Re-exports for users
pub use client::{HttpClient, HttpClientEvents, HttpContent, HttpRequest, ResponseCollector};
pub use connection::HttpConnection;
pub use error::{
    EndpointError, HttpClientError, HttpParseError, ReactorError, ResponseError, SocketError,
};
pub use http::{HttpResponse, Method, RestParams};
pub use parser::{HttpEvents, HttpParser};
pub use reactor::{
    EventOwner, FdKind, Interest, Reactor, ReactorConfig, Readiness, RegistrationHandle,
};
pub use rest::{ContentLen, InProcessRestConnection, RestConnection, RestRequest};
pub use router::{
    ExtractObject, MatchResult, OnProcessRequest, ParsingContext, PathSpec, RequestFilter,
    RouteEntry, Router, RouterDescription, on, render_help, rx,
};
pub use server::RestServiceEndpoint;
pub use socket::{ConnectionResult, SocketCallbacks, SocketState, TcpClientSocket};
