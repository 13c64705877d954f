//! Incremental request parser.
//!
//! Bytes are fed in whatever chunks the connection delivers; events come out
//! once enough of them are buffered. The parser never touches a socket, so
//! any split of the same bytes produces the same events.
//!
//! ```text
//!   RequestLine ──line──► Headers ──blank line──► Body (held) ──release──► Body
//!        ▲                   │ no body                                      │
//!        └───────────────────┴──────────────────────────────────────────────┘
//! ```

use std::fmt;

use crate::buffer::{ByteBuffer, LineScan};
use crate::http::header::Header;
use crate::http::request::{ContentKind, FormValues, Request};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The request line did not have exactly three tokens.
    InvalidRequestLine(String),
    /// `Content-Length` was present but not a number.
    InvalidContentLength(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::InvalidRequestLine(line) => write!(f, "invalid request line {line:?}"),
            ParseError::InvalidContentLength(value) => {
                write!(f, "invalid Content-Length {value:?}")
            }
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug)]
pub enum ParseEvent {
    /// Request line and headers are complete. When the request has a body the
    /// parser holds it back until [`RequestParser::release_body`].
    Head(Request),
    /// The body has been read. Form values for url-encoded bodies, `None`
    /// for every other kind.
    Body(Option<FormValues>),
}

#[derive(Debug)]
enum State {
    RequestLine,
    Headers,
    Body {
        kind: ContentKind,
        remaining: usize,
        released: bool,
        values: FormValues,
    },
}

#[derive(Debug)]
pub struct RequestParser {
    buf: ByteBuffer,
    state: State,
    /// The request whose headers are being read.
    current: Option<Request>,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            buf: ByteBuffer::new(),
            state: State::RequestLine,
            current: None,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.append(data);
    }

    /// Bytes received but not parsed yet.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// True while a body is waiting for [`release_body`](Self::release_body).
    pub fn is_holding_body(&self) -> bool {
        matches!(self.state, State::Body { released: false, .. })
    }

    /// Lets the parser consume the body of the last request head.
    pub fn release_body(&mut self) {
        if let State::Body { released, .. } = &mut self.state {
            *released = true;
        }
    }

    /// Parses as far as the buffered bytes allow.
    ///
    /// `Ok(None)` means more bytes are needed, or a body is being held.
    pub fn next_event(&mut self) -> Result<Option<ParseEvent>, ParseError> {
        loop {
            match self.state {
                State::RequestLine => {
                    let Some(line) = self.take_line() else {
                        return Ok(None);
                    };
                    // stray line ends between pipelined requests
                    if line.is_empty() {
                        continue;
                    }

                    let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
                    let [method, target, version] = tokens[..] else {
                        return Err(ParseError::InvalidRequestLine(line.clone()));
                    };

                    self.current = Some(Request::new(method, target, version));
                    self.state = State::Headers;
                }

                State::Headers => {
                    let Some(line) = self.take_line() else {
                        return Ok(None);
                    };

                    if !line.is_empty() {
                        if let Some(request) = self.current.as_mut() {
                            request.headers.insert(Header::parse(&line));
                        }
                        continue;
                    }

                    self.state = State::RequestLine;
                    if let Some(request) = self.current.take() {
                        return self.finish_head(request).map(Some);
                    }
                }

                State::Body { released: false, .. } => return Ok(None),

                State::Body {
                    kind,
                    ref mut remaining,
                    ref mut values,
                    ..
                } => {
                    let done = match kind {
                        ContentKind::UrlForm => read_form(&mut self.buf, remaining, values),
                        _ => skip_body(&mut self.buf, remaining),
                    };
                    if !done {
                        return Ok(None);
                    }

                    let values = std::mem::take(values);
                    self.state = State::RequestLine;

                    let values = (kind == ContentKind::UrlForm).then_some(values);
                    return Ok(Some(ParseEvent::Body(values)));
                }
            }
        }
    }

    fn finish_head(&mut self, request: Request) -> Result<ParseEvent, ParseError> {
        let length = match request.headers.value("Content-Length") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidContentLength(value.to_string()))?,
            None => 0,
        };

        if length > 0 {
            self.state = State::Body {
                kind: request.content_kind(),
                remaining: length,
                released: false,
                values: FormValues::new(),
            };
        }

        Ok(ParseEvent::Head(request))
    }

    fn take_line(&mut self) -> Option<String> {
        match self.buf.scan_line(0) {
            LineScan::Line { content, next } => {
                let line = String::from_utf8_lossy(self.buf.slice(content)).into_owned();
                self.buf.consume(next);
                Some(line)
            }
            LineScan::Incomplete => None,
        }
    }
}

/// Decodes `&`-separated pairs until `remaining` body bytes are used up. A
/// pair is only decoded once its `&` has arrived or the body is complete.
fn read_form(buf: &mut ByteBuffer, remaining: &mut usize, values: &mut FormValues) -> bool {
    while *remaining > 0 {
        let available = buf.len().min(*remaining);

        let (pair_len, consumed) = match buf.find_byte(0, b'&') {
            Some(at) if at < available => (at, at + 1),
            _ if available == *remaining => (available, available),
            _ => return false,
        };

        decode_pair(buf.slice(0..pair_len), values);
        buf.consume(consumed);
        *remaining -= consumed;
    }

    true
}

fn decode_pair(pair: &[u8], values: &mut FormValues) {
    if pair.is_empty() {
        return;
    }
    for (name, value) in url::form_urlencoded::parse(pair) {
        values.insert(name.into_owned(), value.into_owned());
    }
}

fn skip_body(buf: &mut ByteBuffer, remaining: &mut usize) -> bool {
    let n = buf.len().min(*remaining);
    buf.consume(n);
    *remaining -= n;
    *remaining == 0
}
