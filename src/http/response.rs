use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::http::connection::HttpConnection;
use crate::http::header::HeaderMap;
use crate::http::request::Request;
use crate::http::writer::serialize_head;
use crate::net::WriteCompletion;

/// HTTP status codes supported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200 OK
    Ok,
    /// 415 Unsupported Media Type
    UnsupportedMediaType,
}

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// ```
    /// # use swerve::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::UnsupportedMediaType.as_u16(), 415);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::UnsupportedMediaType => 415,
        }
    }

    /// Returns the standard HTTP reason phrase for this status code.
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::UnsupportedMediaType => "Unsupported Media Type",
        }
    }
}

/// The answer to one request, written straight to its connection.
///
/// The status line and headers go out with the first [`write`](Self::write);
/// headers added after that are ignored. Every response ends in exactly one
/// of [`finish`](Self::finish) or [`close`](Self::close). A response dropped
/// without either closes the connection.
pub struct Response {
    pub headers: HeaderMap,
    status: StatusCode,
    head_written: bool,
    keep_alive: bool,
    seq: u64,
    conn: Arc<HttpConnection>,
    done: bool,
}

impl Response {
    pub(crate) fn new(conn: Arc<HttpConnection>, request: &Request) -> Self {
        Self {
            headers: HeaderMap::new(),
            status: StatusCode::Ok,
            head_written: false,
            keep_alive: request.keep_alive(),
            seq: request.seq,
            conn,
            done: false,
        }
    }

    pub fn set_status(&mut self, status: StatusCode) {
        if self.head_written {
            debug!(peer = %self.conn.id(), "status set after the head was sent");
        }
        self.status = status;
    }

    /// Adds a value to header `name`; repeated names keep every value.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Display) {
        self.headers.add(name, value.to_string());
    }

    /// Queues `body` behind the head. Completes once the bytes reached the
    /// socket. An empty write still sends the head.
    pub fn write(&mut self, body: impl Into<Bytes>) -> WriteCompletion {
        let body = body.into();

        let head = if self.head_written {
            None
        } else {
            self.head_written = true;
            let head = serialize_head(self.status, &self.headers);
            Some(self.conn.write(Bytes::from(head)))
        };

        if !body.is_empty() {
            return self.conn.write(body);
        }

        match head {
            Some(done) => done,
            None => WriteCompletion::ready(!self.conn.is_closed()),
        }
    }

    pub fn write_str(&mut self, body: &str) -> WriteCompletion {
        self.write(Bytes::copy_from_slice(body.as_bytes()))
    }

    /// Ends the exchange. A request that asked for `Connection: keep-alive`
    /// leaves the connection open for the next one; anything else closes it.
    pub fn finish(mut self) {
        self.done = true;

        if self.keep_alive {
            self.conn.request_finished(self.seq);
            self.conn.release_body(self.seq);
        } else {
            self.conn.close();
            self.conn.request_finished(self.seq);
        }
    }

    /// Ends the exchange and closes the connection regardless of keep-alive.
    pub fn close(mut self) {
        self.done = true;
        self.conn.close();
        self.conn.request_finished(self.seq);
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        if !self.done {
            debug!(peer = %self.conn.id(), "response dropped unfinished, closing connection");
            self.conn.close();
            self.conn.request_finished(self.seq);
        }
    }
}
