//! HTTP serve loop on top of [`TcpServer`].
//!
//! An [`HttpSession`] reads requests off one connection with the configured
//! buffer size and writes responses back; an [`HttpServer`] runs a session
//! per client and dispatches every request to a handler callback, honoring
//! keep-alive.

use std::io::Read;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::coio::CoStream;
use crate::config::{self, ConfigVar};
use crate::error::Error;
use crate::http::{parser, ParseError, Request, Response, Status};
use crate::io::IoManager;
use crate::server::TcpServer;

static BUFFER_SIZE: Lazy<ConfigVar<u64>> = Lazy::new(|| {
    config::lookup(
        "http.request.buffer_size",
        4 * 1024,
        "http request head buffer size",
    )
    .expect("http.request.buffer_size registration cannot fail")
});

static MAX_BODY: Lazy<ConfigVar<u64>> = Lazy::new(|| {
    config::lookup(
        "http.request.max_body",
        64 * 1024 * 1024,
        "http request max body size",
    )
    .expect("http.request.max_body registration cannot fail")
});

/// One HTTP/1.x connection.
pub struct HttpSession {
    stream: CoStream,
    buffer: Vec<u8>,
}

impl HttpSession {
    pub fn new(stream: CoStream) -> HttpSession {
        HttpSession {
            stream,
            buffer: Vec::new(),
        }
    }

    /// Read one request (head + `Content-Length` body).
    ///
    /// Returns `Ok(None)` on a clean end of stream between requests.
    pub fn recv_request(&mut self) -> crate::Result<Option<Request>> {
        let buffer_size = BUFFER_SIZE.value() as usize;
        let max_body = MAX_BODY.value() as usize;

        // Accumulate until the head is complete.
        let (mut request, head_len) = loop {
            if let Some(parsed) = parser::parse_request(&self.buffer).map_err(Error::HttpParse)? {
                break parsed;
            }
            if self.buffer.len() >= buffer_size {
                return Err(Error::HttpParse(ParseError::HeadTooLarge));
            }
            if self.fill(buffer_size)? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Error::HttpParse(ParseError::InvalidRequestLine));
            }
        };

        let body_len = parser::content_length(request.header("content-length"))
            .map_err(Error::HttpParse)?;
        if body_len > max_body {
            return Err(Error::HttpParse(ParseError::BodyTooLarge));
        }

        self.buffer.drain(..head_len);
        while self.buffer.len() < body_len {
            if self.fill(body_len - self.buffer.len())? == 0 {
                return Err(Error::HttpParse(ParseError::InvalidContentLength));
            }
        }
        request.body = self.buffer.drain(..body_len).collect();
        Ok(Some(request))
    }

    /// Serialize and send a response.
    pub fn send_response(&mut self, response: &Response) -> crate::Result<()> {
        let text = response.to_string();
        self.stream.write_all(text.as_bytes())?;
        Ok(())
    }

    fn fill(&mut self, chunk: usize) -> crate::Result<usize> {
        let old_len = self.buffer.len();
        self.buffer.resize(old_len + chunk, 0);
        let n = match self.stream.read(&mut self.buffer[old_len..]) {
            Ok(n) => n,
            Err(e) => {
                self.buffer.truncate(old_len);
                return Err(e.into());
            }
        };
        self.buffer.truncate(old_len + n);
        Ok(n)
    }
}

/// Request handler of an [`HttpServer`].
pub type HttpHandler = dyn Fn(&Request) -> Response + Send + Sync;

/// HTTP/1.x server shell: a [`TcpServer`] whose clients speak
/// request/response through [`HttpSession`].
pub struct HttpServer {
    tcp: Arc<TcpServer>,
}

impl HttpServer {
    /// Build a server dispatching requests to `handler`.
    pub fn new<F>(io: &Arc<IoManager>, handler: F) -> HttpServer
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        let handler: Arc<HttpHandler> = Arc::new(handler);
        let tcp = TcpServer::with_name(
            io,
            move |client: CoStream| serve_client(&handler, client),
            "http",
        );
        HttpServer { tcp }
    }

    /// Build a server answering every request with a 404 echo.
    pub fn with_default_handler(io: &Arc<IoManager>) -> HttpServer {
        Self::new(io, default_handler)
    }

    pub fn bind<A: ToSocketAddrs>(&self, addr: A) -> std::io::Result<SocketAddr> {
        self.tcp.bind(addr)
    }

    pub fn start(&self) {
        self.tcp.start();
    }

    pub fn stop(&self) {
        self.tcp.stop();
    }
}

fn serve_client(handler: &Arc<HttpHandler>, client: CoStream) {
    let mut session = HttpSession::new(client);
    loop {
        let request = match session.recv_request() {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                log::debug!("http session ended: {}", e);
                // Parse errors still deserve an answer.
                if let Error::HttpParse(_) = e {
                    let mut response = Response::with_status(Status::BadRequest);
                    response.close = true;
                    let _ = session.send_response(&response);
                }
                break;
            }
        };

        let close = request.close;
        let mut response = handler(&request);
        response.close = close;
        if session.send_response(&response).is_err() {
            break;
        }
        if close {
            break;
        }
    }
}

fn default_handler(request: &Request) -> Response {
    let mut response = Response::with_status(Status::NotFound);
    response.set_header("content-type", "text/plain");
    response.body = format!("no handler for {} {}\r\n", request.method, request.path).into_bytes();
    response
}
