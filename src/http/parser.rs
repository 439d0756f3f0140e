//! HTTP/1.x codec.
//!
//! Head parsing over a growing buffer: [`parse_request`] / [`parse_response`]
//! return `Ok(None)` while the head is still incomplete and
//! `Ok(Some((message, consumed)))` once the empty line was seen; `consumed`
//! covers the head only, bodies are read separately against
//! `Content-Length` (see [`super::server::HttpSession`]).

use super::{Method, ParseError, Request, Response, Status, Version};

const CRLF_CRLF: &[u8] = b"\r\n\r\n";

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(CRLF_CRLF.len())
        .position(|w| w == CRLF_CRLF)
        .map(|pos| pos + CRLF_CRLF.len())
}

fn parse_version(s: &str) -> Result<Version, ParseError> {
    match s {
        "HTTP/1.1" => Ok(0x11),
        "HTTP/1.0" => Ok(0x10),
        _ => Err(ParseError::InvalidVersion(s.to_owned())),
    }
}

fn split_head(head: &str) -> (Option<&str>, impl Iterator<Item = &str>) {
    let mut lines = head.split("\r\n");
    (lines.next(), lines)
}

/// Parse a request head out of `buf`.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>, ParseError> {
    let head_len = match find_head_end(buf) {
        Some(len) => len,
        None => return Ok(None),
    };
    let head = std::str::from_utf8(&buf[..head_len - CRLF_CRLF.len()])
        .map_err(|_| ParseError::InvalidHeader)?;
    let (request_line, header_lines) = split_head(head);
    let request_line = request_line.ok_or(ParseError::InvalidRequestLine)?;

    let mut parts = request_line.split(' ');
    let method: Method = parts
        .next()
        .ok_or(ParseError::InvalidRequestLine)?
        .parse()?;
    let target = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let version = parse_version(parts.next().ok_or(ParseError::InvalidRequestLine)?)?;
    if parts.next().is_some() {
        return Err(ParseError::InvalidRequestLine);
    }

    // Split the target into path / query / fragment.
    let (rest, fragment) = match target.split_once('#') {
        Some((rest, fragment)) => (rest, fragment),
        None => (target, ""),
    };
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, query),
        None => (rest, ""),
    };
    if path.is_empty() {
        return Err(ParseError::InvalidRequestLine);
    }

    let mut request = Request::new();
    request.method = method;
    request.version = version;
    request.path = path.to_owned();
    request.query = query.to_owned();
    request.fragment = fragment.to_owned();

    for line in header_lines {
        let (name, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        if name.is_empty() {
            return Err(ParseError::InvalidHeader);
        }
        request.set_header(name.trim(), value.trim());
    }

    request.close = connection_closes(request.header("connection"), version);
    Ok(Some((request, head_len)))
}

/// Parse a response head out of `buf`.
pub fn parse_response(buf: &[u8]) -> Result<Option<(Response, usize)>, ParseError> {
    let head_len = match find_head_end(buf) {
        Some(len) => len,
        None => return Ok(None),
    };
    let head = std::str::from_utf8(&buf[..head_len - CRLF_CRLF.len()])
        .map_err(|_| ParseError::InvalidHeader)?;
    let (status_line, header_lines) = split_head(head);
    let status_line = status_line.ok_or(ParseError::InvalidStatusLine)?;

    let mut parts = status_line.splitn(3, ' ');
    let version = parse_version(parts.next().ok_or(ParseError::InvalidStatusLine)?)?;
    let code: u16 = parts
        .next()
        .ok_or(ParseError::InvalidStatusLine)?
        .parse()
        .map_err(|_| ParseError::InvalidStatusLine)?;
    let reason = parts.next().unwrap_or("");

    let mut response = Response::new();
    response.version = version;
    response.status = Status::from_code(code).ok_or(ParseError::InvalidStatus(code))?;
    response.reason = reason.to_owned();

    for line in header_lines {
        let (name, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        if name.is_empty() {
            return Err(ParseError::InvalidHeader);
        }
        response.set_header(name.trim(), value.trim());
    }

    response.close = connection_closes(response.header("connection"), version);
    Ok(Some((response, head_len)))
}

/// Declared body length of a parsed head.
pub fn content_length(header: Option<&str>) -> Result<usize, ParseError> {
    match header {
        None => Ok(0),
        Some(v) => v.trim().parse().map_err(|_| ParseError::InvalidContentLength),
    }
}

fn connection_closes(header: Option<&str>, version: Version) -> bool {
    match header {
        Some(v) if v.eq_ignore_ascii_case("close") => true,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => false,
        // HTTP/1.0 defaults to close, 1.1 to keep-alive.
        _ => version < 0x11,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let wire = b"GET /search?q=fiber#top HTTP/1.1\r\nHost: example.org\r\nConnection: keep-alive\r\n\r\n";
        let (req, consumed) = parse_request(wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/search");
        assert_eq!(req.query, "q=fiber");
        assert_eq!(req.fragment, "top");
        assert_eq!(req.version, 0x11);
        assert_eq!(req.header("host"), Some("example.org"));
        assert!(!req.close);
    }

    #[test]
    fn incomplete_head_needs_more_data() {
        assert!(parse_request(b"GET / HTTP/1.1\r\nHost: a").unwrap().is_none());
        assert!(parse_request(b"").unwrap().is_none());
    }

    #[test]
    fn bad_method_is_rejected() {
        let wire = b"GRAB / HTTP/1.1\r\n\r\n";
        assert!(matches!(
            parse_request(wire),
            Err(ParseError::InvalidMethod(_))
        ));
    }

    #[test]
    fn bad_version_is_rejected() {
        let wire = b"GET / HTTP/2.0\r\n\r\n";
        assert!(matches!(
            parse_request(wire),
            Err(ParseError::InvalidVersion(_))
        ));
    }

    #[test]
    fn http10_defaults_to_close() {
        let wire = b"GET / HTTP/1.0\r\n\r\n";
        let (req, _) = parse_request(wire).unwrap().unwrap();
        assert!(req.close);
    }

    #[test]
    fn response_roundtrip() {
        let mut rsp = Response::with_status(Status::Ok);
        rsp.set_header("content-type", "text/plain");
        rsp.close = false;
        rsp.body = b"hello".to_vec();

        let wire = rsp.to_string();
        let (parsed, consumed) = parse_response(wire.as_bytes()).unwrap().unwrap();
        assert_eq!(parsed.status, Status::Ok);
        assert!(!parsed.close);
        assert_eq!(parsed.header("content-type"), Some("text/plain"));
        assert_eq!(
            content_length(parsed.header("content-length")).unwrap(),
            5
        );
        assert_eq!(&wire.as_bytes()[consumed..], b"hello");
    }

    #[test]
    fn content_length_parsing() {
        assert_eq!(content_length(None).unwrap(), 0);
        assert_eq!(content_length(Some("42")).unwrap(), 42);
        assert!(content_length(Some("nope")).is_err());
    }
}
