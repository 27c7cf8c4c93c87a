// src/parser.rs
//
// Incremental HTTP/1.1 parsers with a callback interface. The parser never
// buffers a whole message: complete tokens are handed out as they arrive and
// only a partial token at the end of a feed is carried over to the next one.

use crate::error::HttpParseError;

/// Callbacks emitted while parsing. Body bytes arrive in as many `on_data`
/// calls as the feed granularity dictates; their concatenation is the exact
/// body. `on_done` is the final event per message; `success == false` means
/// the message (and the transport) is unusable.
pub trait HttpEvents {
    fn on_request_start(&mut self, _method: &str, _target: &str, _version: &str) {}
    fn on_response_start(&mut self, _version: &str, _code: u16) {}
    /// One whole header line, key and value included, CRLF stripped.
    fn on_header(&mut self, _line: &[u8]) {}
    fn on_data(&mut self, _data: &[u8]) {}
    fn on_done(&mut self, _success: bool) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    FirstLine,
    Headers,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Sized,
    Chunked,
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkStage {
    Size,
    Data,
    DataCrlf,
    Trailers,
}

/// Header lines longer than this fail the message instead of growing the
/// carry-over buffer without bound.
const MAX_LINE: usize = 64 * 1024;

pub struct HttpParser {
    kind: Kind,
    stage: Stage,
    carry: Vec<u8>,
    framing: Framing,
    remaining_body: u64,
    remaining_chunk: u64,
    chunk_stage: ChunkStage,
    content_length: Option<u64>,
    chunked: bool,
    require_close: bool,
    expect_body: bool,
    status_code: u16,
    failed: bool,
}

impl HttpParser {
    pub fn request() -> Self {
        Self::new(Kind::Request)
    }

    pub fn response() -> Self {
        Self::new(Kind::Response)
    }

    fn new(kind: Kind) -> Self {
        HttpParser {
            kind,
            stage: Stage::FirstLine,
            carry: Vec::new(),
            framing: Framing::Sized,
            remaining_body: 0,
            remaining_chunk: 0,
            chunk_stage: ChunkStage::Size,
            content_length: None,
            chunked: false,
            require_close: false,
            expect_body: true,
            status_code: 0,
            failed: false,
        }
    }

    /// Hint for the next response: HEAD responses carry headers but no body.
    pub fn set_expect_body(&mut self, expect: bool) {
        self.expect_body = expect;
    }

    /// Framing of the last completed (or current) message demanded
    /// connection close.
    pub fn require_close(&self) -> bool {
        self.require_close
    }

    pub fn remaining_body(&self) -> u64 {
        self.remaining_body
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// True between messages: nothing buffered, nothing in progress.
    pub fn is_idle(&self) -> bool {
        self.stage == Stage::FirstLine && self.carry.is_empty() && !self.failed
    }

    /// Consume a chunk of the byte stream, emitting callbacks. Chunk
    /// boundaries are arbitrary; feeding byte by byte produces the same
    /// events (with body data split accordingly).
    pub fn feed(
        &mut self,
        data: &[u8],
        events: &mut dyn HttpEvents,
    ) -> Result<(), HttpParseError> {
        if self.failed {
            return Err(HttpParseError::AlreadyFailed);
        }

        let mut owned: Vec<u8>;
        let buf: &[u8] = if self.carry.is_empty() {
            data
        } else {
            owned = std::mem::take(&mut self.carry);
            owned.extend_from_slice(data);
            &owned
        };

        let mut pos = 0;
        let result = self.run(buf, &mut pos, events);

        match result {
            Ok(()) => {
                if pos < buf.len() {
                    self.carry = buf[pos..].to_vec();
                }
                Ok(())
            }
            Err(e) => self.fail(events, e),
        }
    }

    /// The peer closed the connection. Terminates an until-close body
    /// cleanly; anything else mid-message is a truncation error.
    pub fn finish_on_close(
        &mut self,
        events: &mut dyn HttpEvents,
    ) -> Result<(), HttpParseError> {
        if self.failed {
            return Ok(());
        }
        if self.stage == Stage::Body && self.framing == Framing::UntilClose {
            self.finalize(events);
            return Ok(());
        }
        if self.is_idle() {
            return Ok(());
        }
        self.fail(events, HttpParseError::TruncatedMessage)
    }

    fn fail(
        &mut self,
        events: &mut dyn HttpEvents,
        err: HttpParseError,
    ) -> Result<(), HttpParseError> {
        self.failed = true;
        self.carry.clear();
        events.on_done(false);
        Err(err)
    }

    fn run(
        &mut self,
        buf: &[u8],
        pos: &mut usize,
        events: &mut dyn HttpEvents,
    ) -> Result<(), HttpParseError> {
        loop {
            match self.stage {
                Stage::FirstLine => {
                    let Some(line) = take_line(buf, pos)? else {
                        return Ok(());
                    };
                    self.parse_first_line(line, events)?;
                    self.stage = Stage::Headers;
                }
                Stage::Headers => {
                    let Some(line) = take_line(buf, pos)? else {
                        return Ok(());
                    };
                    if line.is_empty() {
                        if !self.begin_body(events) {
                            self.finalize(events);
                        }
                    } else {
                        self.handle_header(line)?;
                        events.on_header(line);
                    }
                }
                Stage::Body => {
                    let progressed = match self.framing {
                        Framing::Sized => self.run_sized(buf, pos, events),
                        Framing::Chunked => self.run_chunked(buf, pos, events)?,
                        Framing::UntilClose => {
                            if *pos < buf.len() {
                                events.on_data(&buf[*pos..]);
                                *pos = buf.len();
                            }
                            return Ok(());
                        }
                    };
                    if !progressed {
                        return Ok(());
                    }
                }
            }
            if *pos >= buf.len() {
                return Ok(());
            }
        }
    }

    fn parse_first_line(
        &mut self,
        line: &[u8],
        events: &mut dyn HttpEvents,
    ) -> Result<(), HttpParseError> {
        self.require_close = false;
        match self.kind {
            Kind::Response => {
                if !line.starts_with(b"HTTP/") {
                    return Err(HttpParseError::BadVersion);
                }
                let text =
                    std::str::from_utf8(line).map_err(|_| HttpParseError::BadVersion)?;
                let (version, rest) = text
                    .split_once(' ')
                    .ok_or(HttpParseError::BadStatusCode)?;
                let code_str = rest.split(' ').next().unwrap_or("");
                let code: u16 = code_str
                    .parse()
                    .map_err(|_| HttpParseError::BadStatusCode)?;
                self.status_code = code;
                events.on_response_start(version, code);
            }
            Kind::Request => {
                let text =
                    std::str::from_utf8(line).map_err(|_| HttpParseError::BadRequestLine)?;
                let mut parts = text.splitn(3, ' ');
                let method = parts.next().ok_or(HttpParseError::BadRequestLine)?;
                let target = parts.next().ok_or(HttpParseError::BadRequestLine)?;
                let version = parts.next().ok_or(HttpParseError::BadRequestLine)?;
                if method.is_empty() || target.is_empty() || !version.starts_with("HTTP/") {
                    return Err(HttpParseError::BadRequestLine);
                }
                events.on_request_start(method, target, version);
            }
        }
        Ok(())
    }

    fn handle_header(&mut self, line: &[u8]) -> Result<(), HttpParseError> {
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(HttpParseError::BadHeader)?;
        let name = &line[..colon];
        let value = trim_ows(&line[colon + 1..]);

        if name.eq_ignore_ascii_case(b"Content-Length") {
            if self.chunked {
                return Err(HttpParseError::ConflictingFraming);
            }
            let text = std::str::from_utf8(value).map_err(|_| HttpParseError::BadHeader)?;
            let n: u64 = text.parse().map_err(|_| HttpParseError::BadHeader)?;
            self.content_length = Some(n);
        } else if name.eq_ignore_ascii_case(b"Transfer-Encoding") {
            if contains_token(value, b"chunked") {
                if self.content_length.is_some() {
                    return Err(HttpParseError::ConflictingFraming);
                }
                self.chunked = true;
            }
        } else if name.eq_ignore_ascii_case(b"Connection")
            && value.eq_ignore_ascii_case(b"close")
        {
            self.require_close = true;
        }
        Ok(())
    }

    /// Returns false when the message has no body.
    fn begin_body(&mut self, _events: &mut dyn HttpEvents) -> bool {
        if self.kind == Kind::Response {
            let code = self.status_code;
            let code_forbids_body = (100..200).contains(&code) || code == 204 || code == 304;
            if !self.expect_body || code_forbids_body {
                return false;
            }
        }
        if self.chunked {
            self.framing = Framing::Chunked;
            self.chunk_stage = ChunkStage::Size;
            self.stage = Stage::Body;
            return true;
        }
        if let Some(n) = self.content_length {
            if n == 0 {
                return false;
            }
            self.framing = Framing::Sized;
            self.remaining_body = n;
            self.stage = Stage::Body;
            return true;
        }
        if self.kind == Kind::Response && self.require_close {
            self.framing = Framing::UntilClose;
            self.stage = Stage::Body;
            return true;
        }
        false
    }

    fn run_sized(&mut self, buf: &[u8], pos: &mut usize, events: &mut dyn HttpEvents) -> bool {
        let avail = buf.len() - *pos;
        let take = (self.remaining_body).min(avail as u64) as usize;
        if take > 0 {
            events.on_data(&buf[*pos..*pos + take]);
            *pos += take;
            self.remaining_body -= take as u64;
        }
        if self.remaining_body == 0 {
            self.finalize(events);
            true
        } else {
            false
        }
    }

    fn run_chunked(
        &mut self,
        buf: &[u8],
        pos: &mut usize,
        events: &mut dyn HttpEvents,
    ) -> Result<bool, HttpParseError> {
        loop {
            match self.chunk_stage {
                ChunkStage::Size => {
                    let Some(line) = take_line(buf, pos)? else {
                        return Ok(false);
                    };
                    let size = parse_chunk_size(line)?;
                    if size == 0 {
                        self.chunk_stage = ChunkStage::Trailers;
                    } else {
                        self.remaining_chunk = size;
                        self.chunk_stage = ChunkStage::Data;
                    }
                }
                ChunkStage::Data => {
                    let avail = buf.len() - *pos;
                    let take = (self.remaining_chunk).min(avail as u64) as usize;
                    if take > 0 {
                        events.on_data(&buf[*pos..*pos + take]);
                        *pos += take;
                        self.remaining_chunk -= take as u64;
                    }
                    if self.remaining_chunk == 0 {
                        self.chunk_stage = ChunkStage::DataCrlf;
                    } else {
                        return Ok(false);
                    }
                }
                ChunkStage::DataCrlf => {
                    if buf.len() - *pos < 2 {
                        return Ok(false);
                    }
                    if &buf[*pos..*pos + 2] != b"\r\n" {
                        return Err(HttpParseError::BadChunkTerminator);
                    }
                    *pos += 2;
                    self.chunk_stage = ChunkStage::Size;
                }
                ChunkStage::Trailers => {
                    let Some(line) = take_line(buf, pos)? else {
                        return Ok(false);
                    };
                    if line.is_empty() {
                        self.finalize(events);
                        return Ok(true);
                    }
                    // Trailing headers are ignored.
                }
            }
        }
    }

    fn finalize(&mut self, events: &mut dyn HttpEvents) {
        events.on_done(true);
        // Ready for the next message on the same transport. require_close
        // stays readable until the next first line resets it.
        self.stage = Stage::FirstLine;
        self.framing = Framing::Sized;
        self.remaining_body = 0;
        self.remaining_chunk = 0;
        self.chunk_stage = ChunkStage::Size;
        self.content_length = None;
        self.chunked = false;
        self.status_code = 0;
    }
}

/// Extract the next CRLF-terminated line starting at `pos`. Returns the line
/// without its CRLF and advances `pos` past it, or `None` when incomplete.
fn take_line<'a>(buf: &'a [u8], pos: &mut usize) -> Result<Option<&'a [u8]>, HttpParseError> {
    let rest = &buf[*pos..];
    match rest.iter().position(|&b| b == b'\n') {
        Some(nl) => {
            if nl == 0 || rest[nl - 1] != b'\r' {
                return Err(HttpParseError::BadHeader);
            }
            let line = &rest[..nl - 1];
            *pos += nl + 1;
            Ok(Some(line))
        }
        None => {
            if rest.len() > MAX_LINE {
                return Err(HttpParseError::LineTooLong);
            }
            Ok(None)
        }
    }
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let Some((b' ' | b'\t', rest)) = value.split_first() {
        value = rest;
    }
    while let Some((b' ' | b'\t', rest)) = value.split_last() {
        value = rest;
    }
    value
}

/// Case-insensitive token search in a comma-separated header value.
fn contains_token(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|part| trim_ows(part).eq_ignore_ascii_case(token))
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpParseError> {
    // Chunk extensions (";key=value") are stripped.
    let size_part = line
        .split(|&b| b == b';')
        .next()
        .unwrap_or(&[]);
    let text = std::str::from_utf8(trim_ows(size_part))
        .map_err(|_| HttpParseError::BadChunkSize)?;
    if text.is_empty() {
        return Err(HttpParseError::BadChunkSize);
    }
    u64::from_str_radix(text, 16).map_err(|_| HttpParseError::BadChunkSize)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Recorder that coalesces adjacent data events so chunking granularity
    /// does not affect comparisons.
    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        body: Vec<u8>,
    }

    impl Recorder {
        fn flush_body(&mut self) {
            if !self.body.is_empty() {
                let body = std::mem::take(&mut self.body);
                self.events
                    .push(format!("data:{}", String::from_utf8_lossy(&body)));
            }
        }
    }

    impl HttpEvents for Recorder {
        fn on_request_start(&mut self, method: &str, target: &str, version: &str) {
            self.flush_body();
            self.events
                .push(format!("request:{} {} {}", method, target, version));
        }

        fn on_response_start(&mut self, version: &str, code: u16) {
            self.flush_body();
            self.events.push(format!("response:{} {}", version, code));
        }

        fn on_header(&mut self, line: &[u8]) {
            self.flush_body();
            self.events
                .push(format!("header:{}", String::from_utf8_lossy(line)));
        }

        fn on_data(&mut self, data: &[u8]) {
            self.body.extend_from_slice(data);
        }

        fn on_done(&mut self, success: bool) {
            self.flush_body();
            self.events.push(format!("done:{}", success));
        }
    }

    fn feed_all(parser: &mut HttpParser, data: &[u8]) -> Recorder {
        let mut rec = Recorder::default();
        parser.feed(data, &mut rec).unwrap();
        rec
    }

    fn feed_bytewise(parser: &mut HttpParser, data: &[u8]) -> Recorder {
        let mut rec = Recorder::default();
        for b in data {
            parser.feed(std::slice::from_ref(b), &mut rec).unwrap();
        }
        rec
    }

    const SIZED: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

    #[test]
    fn sized_response_one_shot() {
        let mut parser = HttpParser::response();
        let rec = feed_all(&mut parser, SIZED);
        assert_eq!(
            rec.events,
            vec![
                "response:HTTP/1.1 200",
                "header:Content-Length: 5",
                "data:hello",
                "done:true",
            ]
        );
        assert!(parser.is_idle());
    }

    #[test]
    fn sized_response_byte_at_a_time_matches() {
        let mut p1 = HttpParser::response();
        let one_shot = feed_all(&mut p1, SIZED);

        let mut p2 = HttpParser::response();
        let bytewise = feed_bytewise(&mut p2, SIZED);

        assert_eq!(one_shot.events, bytewise.events);
    }

    #[test]
    fn chunked_response_reassembles() {
        let wire =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut parser = HttpParser::response();
        let rec = feed_all(&mut parser, wire);
        assert_eq!(
            rec.events,
            vec![
                "response:HTTP/1.1 200",
                "header:Transfer-Encoding: chunked",
                "data:hello world",
                "done:true",
            ]
        );

        let mut p2 = HttpParser::response();
        let bytewise = feed_bytewise(&mut p2, wire);
        assert_eq!(rec.events, bytewise.events);
    }

    #[test]
    fn chunk_extensions_are_stripped() {
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n0\r\n\r\n";
        let mut parser = HttpParser::response();
        let rec = feed_all(&mut parser, wire);
        assert!(rec.events.contains(&"data:hello".to_string()));
        assert!(rec.events.contains(&"done:true".to_string()));
    }

    #[test]
    fn no_body_status_codes_skip_body() {
        for code in [204u16, 304, 100] {
            let wire = format!("HTTP/1.1 {} X\r\nContent-Length: 5\r\n\r\n", code);
            let mut parser = HttpParser::response();
            let mut rec = Recorder::default();
            parser.feed(wire.as_bytes(), &mut rec).unwrap();
            assert_eq!(
                rec.events.last().unwrap(),
                "done:true",
                "code {} should have no body",
                code
            );
        }
    }

    #[test]
    fn head_hint_skips_body() {
        let mut parser = HttpParser::response();
        parser.set_expect_body(false);
        let rec = feed_all(&mut parser, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(rec.events.last().unwrap(), "done:true");
        assert!(parser.is_idle());
    }

    #[test]
    fn connection_close_body_runs_until_eof() {
        let mut parser = HttpParser::response();
        let mut rec = Recorder::default();
        parser
            .feed(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\npartial", &mut rec)
            .unwrap();
        parser.feed(b" body", &mut rec).unwrap();
        assert!(parser.require_close());
        parser.finish_on_close(&mut rec).unwrap();
        assert_eq!(
            rec.events,
            vec![
                "response:HTTP/1.1 200",
                "header:Connection: close",
                "data:partial body",
                "done:true",
            ]
        );
    }

    #[test]
    fn close_mid_message_is_truncation() {
        let mut parser = HttpParser::response();
        let mut rec = Recorder::default();
        parser
            .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc", &mut rec)
            .unwrap();
        let err = parser.finish_on_close(&mut rec).unwrap_err();
        assert_eq!(err, HttpParseError::TruncatedMessage);
        assert_eq!(rec.events.last().unwrap(), "done:false");
    }

    #[test]
    fn conflicting_framing_is_rejected() {
        let mut parser = HttpParser::response();
        let mut rec = Recorder::default();
        let err = parser
            .feed(
                b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n",
                &mut rec,
            )
            .unwrap_err();
        assert_eq!(err, HttpParseError::ConflictingFraming);
        assert_eq!(rec.events.last().unwrap(), "done:false");
        // The parser stays failed.
        assert!(matches!(
            parser.feed(b"x", &mut rec),
            Err(HttpParseError::AlreadyFailed)
        ));
    }

    #[test]
    fn bad_status_line_fails() {
        let mut parser = HttpParser::response();
        let mut rec = Recorder::default();
        let err = parser.feed(b"FTP/1.1 200 OK\r\n", &mut rec).unwrap_err();
        assert_eq!(err, HttpParseError::BadVersion);
    }

    #[test]
    fn request_line_and_body() {
        let wire = b"POST /v1/items?x=1 HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4\r\n\r\nbody";
        let mut parser = HttpParser::request();
        let rec = feed_all(&mut parser, wire);
        assert_eq!(
            rec.events,
            vec![
                "request:POST /v1/items?x=1 HTTP/1.1",
                "header:Host: localhost",
                "header:Content-Length: 4",
                "data:body",
                "done:true",
            ]
        );
    }

    #[test]
    fn request_without_framing_has_no_body() {
        let mut parser = HttpParser::request();
        let rec = feed_all(&mut parser, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(rec.events.last().unwrap(), "done:true");
        assert!(parser.is_idle());
    }

    #[test]
    fn pipelined_messages_in_one_feed() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\naHTTP/1.1 201 Created\r\nContent-Length: 1\r\n\r\nb";
        let mut parser = HttpParser::response();
        let rec = feed_all(&mut parser, wire);
        assert_eq!(
            rec.events,
            vec![
                "response:HTTP/1.1 200",
                "header:Content-Length: 1",
                "data:a",
                "done:true",
                "response:HTTP/1.1 201",
                "header:Content-Length: 1",
                "data:b",
                "done:true",
            ]
        );
    }

    #[test]
    fn split_across_arbitrary_boundary() {
        let wire: &[u8] =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        for split in 1..wire.len() {
            let mut parser = HttpParser::response();
            let mut rec = Recorder::default();
            parser.feed(&wire[..split], &mut rec).unwrap();
            parser.feed(&wire[split..], &mut rec).unwrap();
            assert_eq!(
                rec.events.last().unwrap(),
                "done:true",
                "failed at split {}",
                split
            );
            assert!(
                rec.events.contains(&"data:hello".to_string()),
                "body lost at split {}",
                split
            );
        }
    }
}
