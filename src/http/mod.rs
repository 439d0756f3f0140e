//! HTTP/1.x messages.
//!
//! Plain data types for requests and responses with `Display` impls that
//! emit wire format; the codec lives in [`parser`], the serve loop in
//! [`server`].

use std::fmt;

pub mod parser;
pub mod server;

pub use parser::{parse_request, parse_response};
pub use server::{HttpServer, HttpSession};

/// HTTP request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Trace,
    Connect,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }
}

impl std::str::FromStr for Method {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            "PATCH" => Ok(Method::Patch),
            "TRACE" => Ok(Method::Trace),
            "CONNECT" => Ok(Method::Connect),
            _ => Err(ParseError::InvalidMethod(s.to_owned())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Continue = 100,
    Ok = 200,
    Created = 201,
    Accepted = 202,
    NoContent = 204,
    MovedPermanently = 301,
    Found = 302,
    NotModified = 304,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    RequestTimeout = 408,
    LengthRequired = 411,
    PayloadTooLarge = 413,
    InternalServerError = 500,
    NotImplemented = 501,
    BadGateway = 502,
    ServiceUnavailable = 503,
    GatewayTimeout = 504,
}

impl Status {
    #[inline(always)]
    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Status::Continue => "Continue",
            Status::Ok => "OK",
            Status::Created => "Created",
            Status::Accepted => "Accepted",
            Status::NoContent => "No Content",
            Status::MovedPermanently => "Moved Permanently",
            Status::Found => "Found",
            Status::NotModified => "Not Modified",
            Status::BadRequest => "Bad Request",
            Status::Unauthorized => "Unauthorized",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::RequestTimeout => "Request Timeout",
            Status::LengthRequired => "Length Required",
            Status::PayloadTooLarge => "Payload Too Large",
            Status::InternalServerError => "Internal Server Error",
            Status::NotImplemented => "Not Implemented",
            Status::BadGateway => "Bad Gateway",
            Status::ServiceUnavailable => "Service Unavailable",
            Status::GatewayTimeout => "Gateway Timeout",
        }
    }

    pub fn from_code(code: u16) -> Option<Status> {
        let status = match code {
            100 => Status::Continue,
            200 => Status::Ok,
            201 => Status::Created,
            202 => Status::Accepted,
            204 => Status::NoContent,
            301 => Status::MovedPermanently,
            302 => Status::Found,
            304 => Status::NotModified,
            400 => Status::BadRequest,
            401 => Status::Unauthorized,
            403 => Status::Forbidden,
            404 => Status::NotFound,
            405 => Status::MethodNotAllowed,
            408 => Status::RequestTimeout,
            411 => Status::LengthRequired,
            413 => Status::PayloadTooLarge,
            500 => Status::InternalServerError,
            501 => Status::NotImplemented,
            502 => Status::BadGateway,
            503 => Status::ServiceUnavailable,
            504 => Status::GatewayTimeout,
            _ => return None,
        };
        Some(status)
    }
}

/// Protocol version as `major << 4 | minor`, so HTTP/1.1 is `0x11`.
pub type Version = u8;

fn fmt_version(f: &mut fmt::Formatter<'_>, v: Version) -> fmt::Result {
    write!(f, "HTTP/{}.{}", v >> 4, v & 0x0f)
}

/// An HTTP/1.x request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub fragment: String,
    pub version: Version,
    /// `Connection: close` (or HTTP/1.0 without keep-alive).
    pub close: bool,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Default for Request {
    fn default() -> Self {
        Request::new()
    }
}

impl Request {
    pub fn new() -> Request {
        Request {
            method: Method::Get,
            path: "/".to_owned(),
            query: String::new(),
            fragment: String::new(),
            version: 0x11,
            close: true,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Header lookup, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    /// Append a header (duplicates allowed, as on the wire).
    pub fn set_header(&mut self, name: &str, value: &str) {
        header_set(&mut self.headers, name, value);
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)?;
        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }
        if !self.fragment.is_empty() {
            write!(f, "#{}", self.fragment)?;
        }
        f.write_str(" ")?;
        fmt_version(f, self.version)?;
        f.write_str("\r\n")?;

        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            write!(f, "{}: {}\r\n", name, value)?;
        }
        write!(
            f,
            "connection: {}\r\n",
            if self.close { "close" } else { "keep-alive" }
        )?;
        if !self.body.is_empty() {
            write!(f, "content-length: {}\r\n\r\n", self.body.len())?;
            f.write_str(&String::from_utf8_lossy(&self.body))?;
        } else {
            f.write_str("\r\n")?;
        }
        Ok(())
    }
}

/// An HTTP/1.x response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: Status,
    /// Custom reason phrase; the status default is used when empty.
    pub reason: String,
    pub version: Version,
    pub close: bool,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Default for Response {
    fn default() -> Self {
        Response::new()
    }
}

impl Response {
    pub fn new() -> Response {
        Response {
            status: Status::Ok,
            reason: String::new(),
            version: 0x11,
            close: true,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_status(status: Status) -> Response {
        Response {
            status,
            ..Response::new()
        }
    }

    /// Header lookup, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        header_set(&mut self.headers, name, value);
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_version(f, self.version)?;
        write!(
            f,
            " {} {}\r\n",
            self.status.code(),
            if self.reason.is_empty() {
                self.status.reason()
            } else {
                &self.reason
            }
        )?;

        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            write!(f, "{}: {}\r\n", name, value)?;
        }
        write!(
            f,
            "connection: {}\r\n",
            if self.close { "close" } else { "keep-alive" }
        )?;
        write!(f, "content-length: {}\r\n\r\n", self.body.len())?;
        f.write_str(&String::from_utf8_lossy(&self.body))?;
        Ok(())
    }
}

fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn header_set(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    for (k, v) in headers.iter_mut() {
        if k.eq_ignore_ascii_case(name) {
            *v = value.to_owned();
            return;
        }
    }
    headers.push((name.to_owned(), value.to_owned()));
}

/// Parse errors of the HTTP codec.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid request line")]
    InvalidRequestLine,

    #[error("invalid status line")]
    InvalidStatusLine,

    #[error("unknown method `{0}`")]
    InvalidMethod(String),

    #[error("invalid http version `{0}`")]
    InvalidVersion(String),

    #[error("invalid header line")]
    InvalidHeader,

    #[error("invalid content-length")]
    InvalidContentLength,

    #[error("unknown status code {0}")]
    InvalidStatus(u16),

    #[error("message head exceeds the configured buffer size")]
    HeadTooLarge,

    #[error("message body exceeds the configured limit")]
    BodyTooLarge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_format() {
        let mut req = Request::new();
        req.method = Method::Post;
        req.path = "/submit".into();
        req.query = "a=1".into();
        req.close = false;
        req.set_header("host", "example.org");
        req.body = b"payload".to_vec();

        let text = req.to_string();
        assert!(text.starts_with("POST /submit?a=1 HTTP/1.1\r\n"));
        assert!(text.contains("host: example.org\r\n"));
        assert!(text.contains("connection: keep-alive\r\n"));
        assert!(text.contains("content-length: 7\r\n\r\npayload"));
    }

    #[test]
    fn response_wire_format() {
        let mut rsp = Response::with_status(Status::NotFound);
        rsp.body = b"gone".to_vec();
        let text = rsp.to_string();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.ends_with("content-length: 4\r\n\r\ngone"));
    }

    #[test]
    fn headers_are_case_insensitive() {
        let mut req = Request::new();
        req.set_header("Content-Type", "text/plain");
        assert_eq!(req.header("content-type"), Some("text/plain"));
        req.set_header("CONTENT-TYPE", "text/html");
        assert_eq!(req.header("content-type"), Some("text/html"));
        assert_eq!(req.headers().count(), 1);
    }
}
