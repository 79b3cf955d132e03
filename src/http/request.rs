//! Request framing and the request-line/header parser. Per the framing
//! contract, this module only ever looks as far as the blank line that
//! ends the headers; the body (if any) is read and attached by the
//! dispatcher once it knows `Content-Length`.

use std::fmt;
use std::str::FromStr;

/// The methods a request line can carry. `Other` holds any token this
/// server doesn't dispatch on (`DELETE` and friends); parsing never fails
/// on an unrecognized method, since it's the dispatcher's job, not the
/// parser's, to reject it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Other(tok) => tok.as_str(),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            other => Method::Other(other.to_string()),
        })
    }
}

/// Failures while framing or parsing a request, each carrying enough
/// context for `http::response::status_for` to pick a status code.
/// Version and method acceptability aren't framing concerns, so they
/// aren't represented here; the dispatcher raises those.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// No CRLFCRLF boundary found yet; caller should keep reading.
    Incomplete,
    MalformedRequestLine,
    MalformedHeader(String),
    UriTooLong,
    HeadersTooLarge,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Incomplete => write!(f, "incomplete request"),
            ParseError::MalformedRequestLine => write!(f, "malformed request line"),
            ParseError::MalformedHeader(h) => write!(f, "malformed header: {h}"),
            ParseError::UriTooLong => write!(f, "request URI too long"),
            ParseError::HeadersTooLarge => write!(f, "request header block too large"),
        }
    }
}

impl std::error::Error for ParseError {}

const MAX_URI_LEN: usize = 8 * 1024;
const MAX_HEADER_BLOCK: usize = 64 * 1024;

/// An ordered, first-occurrence-wins header list. RFC 7230 §3.2.2 treats
/// a duplicate `Content-Length` as invalid; this server instead keeps the
/// first value seen and ignores later ones, per the documented choice for
/// this server's behavior.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    fn insert_first_wins(&mut self, name: String, value: String) {
        let lower = name.to_ascii_lowercase();
        if self.0.iter().any(|(k, _)| k.eq_ignore_ascii_case(&lower)) {
            return;
        }
        self.0.push((lower, value));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A fully-framed request line and header block. The body is attached
/// separately by the dispatcher.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub url: String,
    pub version: String,
    pub headers: Headers,
}

impl RequestHead {
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get("host")
    }

    pub fn keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version == "HTTP/1.1",
        }
    }
}

/// Scan for the end of a header block (the byte offset just past the
/// blank line's terminating CRLF), walking a four-state machine over raw
/// bytes rather than searching for the literal `"\r\n\r\n"` substring, so
/// it behaves correctly when the boundary straddles two `read()` calls.
pub fn find_headers_end(buf: &[u8]) -> Option<usize> {
    #[derive(Clone, Copy, PartialEq)]
    enum St {
        Start,
        Cr,
        CrLf,
        CrLfCr,
    }

    let mut state = St::Start;
    for (i, &b) in buf.iter().enumerate() {
        state = match (state, b) {
            (St::Start, b'\r') => St::Cr,
            (St::Cr, b'\n') => St::CrLf,
            (St::CrLf, b'\r') => St::CrLfCr,
            (St::CrLfCr, b'\n') => return Some(i + 1),
            (_, b'\r') => St::Cr,
            _ => St::Start,
        };
    }
    None
}

/// Parse a request line + header block (not including the trailing blank
/// line) out of `buf[..head_end]`.
pub fn parse_head(buf: &[u8]) -> Result<RequestHead, ParseError> {
    let head_end = match find_headers_end(buf) {
        Some(end) => end,
        None if buf.len() > MAX_HEADER_BLOCK => return Err(ParseError::HeadersTooLarge),
        None => return Err(ParseError::Incomplete),
    };

    let text = std::str::from_utf8(&buf[..head_end]).map_err(|_| ParseError::MalformedRequestLine)?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or(ParseError::MalformedRequestLine)?;

    let mut parts = request_line.split(' ');
    let method_tok = parts.next().ok_or(ParseError::MalformedRequestLine)?;
    let url = parts.next().ok_or(ParseError::MalformedRequestLine)?.to_string();
    let version = parts.next().ok_or(ParseError::MalformedRequestLine)?.to_string();
    if parts.next().is_some() {
        return Err(ParseError::MalformedRequestLine);
    }

    if url.len() > MAX_URI_LEN {
        return Err(ParseError::UriTooLong);
    }
    // Version and method acceptability are dispatch-level concerns, not
    // framing ones; an unsupported version or method still parses fine
    // here and is rejected later with the request's headers in hand.
    let method = Method::from_str(method_tok).unwrap();

    let mut headers = Headers::default();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::MalformedHeader(line.to_string()))?;
        headers.insert_first_wins(name.trim().to_string(), value.trim().to_string());
    }

    Ok(RequestHead {
        method,
        url,
        version,
        headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_header_boundary_split_across_reads() {
        let whole = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(find_headers_end(whole), Some(whole.len()));
        assert_eq!(find_headers_end(&whole[..whole.len() - 1]), None);
    }

    #[test]
    fn parses_simple_get() {
        let req = parse_head(b"GET /index.html HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.url, "/index.html");
        assert_eq!(req.host(), Some("a"));
    }

    #[test]
    fn duplicate_headers_first_occurrence_wins() {
        let req = parse_head(b"GET / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 9\r\n\r\n").unwrap();
        assert_eq!(req.content_length(), Some(5));
    }

    #[test]
    fn bad_version_and_unsupported_method_parse_fine() {
        // Acceptability is for the dispatcher to decide; framing alone
        // never rejects either.
        let req = parse_head(b"GET / HTTP/2.0\r\n\r\n").unwrap();
        assert_eq!(req.version, "HTTP/2.0");
        let req = parse_head(b"DELETE / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.method, Method::Other("DELETE".to_string()));
    }

    #[test]
    fn incomplete_without_terminator() {
        let err = parse_head(b"GET / HTTP/1.1\r\nHost: a\r\n").unwrap_err();
        assert_eq!(err, ParseError::Incomplete);
    }

    #[test]
    fn pipelined_requests_each_frame_independently() {
        let buf = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let end1 = find_headers_end(buf).unwrap();
        let first = parse_head(&buf[..end1]).unwrap();
        assert_eq!(first.url, "/a");
        let end2 = find_headers_end(&buf[end1..]).unwrap();
        let second = parse_head(&buf[end1..end1 + end2]).unwrap();
        assert_eq!(second.url, "/b");
    }
}
