use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::http::connection::HttpConnection;
use crate::http::header::{Header, HeaderMap};

/// HTTP request methods.
///
/// Anything other than GET, POST and PUT parses as [`Method::None`]; such
/// requests can still be routed to handlers registered for `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    None,
}

impl Method {
    /// Parses the method token of a request line. Case-sensitive.
    ///
    /// ```
    /// # use swerve::http::request::Method;
    /// assert_eq!(Method::parse("GET"), Method::Get);
    /// assert_eq!(Method::parse("get"), Method::None);
    /// ```
    pub fn parse(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            _ => Method::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::None => "NONE",
        }
    }
}

/// How a request body is encoded, judged by `Content-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// `application/x-www-form-urlencoded`, the only kind that gets decoded.
    UrlForm,
    /// `multipart/form-data`
    Multipart,
    /// Any other declared type.
    Raw,
    /// No `Content-Type` at all.
    None,
}

impl ContentKind {
    /// Parameters after `;` are ignored.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let Some(value) = content_type else {
            return ContentKind::None;
        };

        let essence = value.split(';').next().unwrap_or_default().trim();
        if essence.eq_ignore_ascii_case("application/x-www-form-urlencoded") {
            ContentKind::UrlForm
        } else if essence.eq_ignore_ascii_case("multipart/form-data") {
            ContentKind::Multipart
        } else {
            ContentKind::Raw
        }
    }
}

/// Decoded `name=value` pairs of a url-encoded body.
pub type FormValues = HashMap<String, String>;

/// A parsed HTTP request.
///
/// Holds only a weak reference to the connection it arrived on; the
/// connection never owns the requests it produced.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Path without the query string.
    pub path: String,
    /// Query string including its leading `?`, empty when absent.
    pub query: String,
    pub version: String,
    pub headers: HeaderMap,
    /// Form values, once a url-encoded body has been read.
    pub values: Option<FormValues>,
    pub(crate) seq: u64,
    pub(crate) conn: Weak<HttpConnection>,
}

impl Request {
    /// Builds a request from the three request-line tokens.
    pub fn new(method: &str, target: &str, version: &str) -> Self {
        let (path, query) = match target.find('?') {
            Some(at) => (&target[..at], &target[at..]),
            None => (target, ""),
        };

        Self {
            method: Method::parse(method),
            path: path.to_string(),
            query: query.to_string(),
            version: version.to_string(),
            headers: HeaderMap::new(),
            values: None,
            seq: 0,
            conn: Weak::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&Header> {
        self.headers.get(name)
    }

    /// First value of header `name`.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.value(name)
    }

    pub fn content_length(&self) -> Option<usize> {
        self.headers.content_length()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.content_type()
    }

    pub fn content_kind(&self) -> ContentKind {
        ContentKind::from_content_type(self.content_type())
    }

    pub fn has_body(&self) -> bool {
        self.content_length().is_some_and(|len| len > 0)
    }

    /// Whether the connection stays open after the response. Only an explicit
    /// `Connection: keep-alive` keeps it.
    pub fn keep_alive(&self) -> bool {
        self.header_str("Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
    }

    /// A decoded form value.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.as_ref()?.get(name).map(String::as_str)
    }

    pub(crate) fn connection(&self) -> Option<Arc<HttpConnection>> {
        self.conn.upgrade()
    }

    /// Lets the body flow and calls `on_body` with this request once it has
    /// been read. Only url-encoded bodies are decoded; for those `values` is
    /// set by the time `on_body` runs.
    ///
    /// Does nothing if the connection is already gone.
    pub fn read_body(self, on_body: impl FnOnce(Request) + Send + 'static) {
        if let Some(conn) = self.connection() {
            conn.await_body(self, Box::new(on_body));
        }
    }
}
