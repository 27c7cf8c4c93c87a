use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Options,
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Connect,
    Patch,
    Unknown,
}

/// Wire names in RFC 7231 §4 order, with PATCH (RFC 5789) appended. One
/// table drives both directions of the conversion.
const METHOD_NAMES: [(Method, &str); 9] = [
    (Method::Options, "OPTIONS"),
    (Method::Get, "GET"),
    (Method::Head, "HEAD"),
    (Method::Post, "POST"),
    (Method::Put, "PUT"),
    (Method::Delete, "DELETE"),
    (Method::Trace, "TRACE"),
    (Method::Connect, "CONNECT"),
    (Method::Patch, "PATCH"),
];

impl Method {
    /// Method names are case-sensitive on the wire; anything unlisted maps
    /// to `Unknown` rather than failing the parse.
    pub fn from_bytes(token: &[u8]) -> Self {
        METHOD_NAMES
            .iter()
            .find(|(_, name)| name.as_bytes() == token)
            .map(|(method, _)| *method)
            .unwrap_or(Method::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        METHOD_NAMES
            .iter()
            .find(|(method, _)| method == self)
            .map(|(_, name)| *name)
            .unwrap_or("UNKNOWN")
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered name/value list with case-insensitive lookup, used for both
/// headers and query parameters. Duplicates are preserved in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestParams(pub Vec<(String, String)>);

impl RestParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value whose name matches, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse `a=1&b=2` into ordered pairs. Keys without `=` get an empty
    /// value. No percent-decoding is applied.
    pub fn from_query_string(query: &str) -> Self {
        let mut params = RestParams::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some((k, v)) => params.push(k, v),
                None => params.push(pair, ""),
            }
        }
        params
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for RestParams {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        RestParams(
            iter.into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }
}

/// Reason phrase for a status code. Unlisted codes get a generic phrase;
/// the code itself is what matters on the wire.
pub fn status_text(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Response",
    }
}

/// A fully collected HTTP response, as delivered by the client convenience
/// callbacks.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: RestParams,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_round_trip() {
        assert_eq!(Method::from_bytes(b"GET"), Method::Get);
        assert_eq!(Method::from_bytes(b"BREW"), Method::Unknown);
        assert_eq!(Method::Delete.as_str(), "DELETE");
    }

    #[test]
    fn params_case_insensitive_lookup() {
        let mut p = RestParams::new();
        p.push("Content-Type", "text/plain");
        p.push("X-Thing", "a");
        p.push("x-thing", "b");

        assert_eq!(p.get("content-type"), Some("text/plain"));
        // First match wins; order is preserved.
        assert_eq!(p.get("X-THING"), Some("a"));
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn query_string_parsing() {
        let p = RestParams::from_query_string("a=1&b=&flag&c=x%20y");
        assert_eq!(p.get("a"), Some("1"));
        assert_eq!(p.get("b"), Some(""));
        assert_eq!(p.get("flag"), Some(""));
        assert_eq!(p.get("c"), Some("x%20y"));
    }
}
