//! Response builder: an order-preserving header list and a byte
//! serializer, plus the MIME table and the error-kind to status mapping.

use crate::error::LisoError;

/// Status/reason pairs this server ever emits.
const STATUS_OK: (u16, &str) = (200, "OK");
const STATUS_BAD_REQUEST: (u16, &str) = (400, "Bad Request");
const STATUS_NOT_FOUND: (u16, &str) = (404, "Not Found");
const STATUS_REQUEST_TIMEOUT: (u16, &str) = (408, "Request Timeout");
const STATUS_INTERNAL_ERROR: (u16, &str) = (500, "Internal Server Error");
const STATUS_NOT_IMPLEMENTED: (u16, &str) = (501, "Not Implemented");
const STATUS_GATEWAY_TIMEOUT: (u16, &str) = (504, "Gateway Timeout");
const STATUS_VERSION_NOT_SUPPORTED: (u16, &str) = (505, "HTTP Version Not Supported");

/// Map an internal error into the (status, reason) pair the response
/// builder should emit for it.
pub fn status_for(err: &LisoError) -> (u16, &'static str) {
    match err {
        LisoError::LoadFailed(_) => STATUS_NOT_FOUND,
        LisoError::Timeout => STATUS_REQUEST_TIMEOUT,
        LisoError::UnsupportedMethod(_) => STATUS_NOT_IMPLEMENTED,
        LisoError::BadVersion(_) => STATUS_VERSION_NOT_SUPPORTED,
        LisoError::FatalSocket(_) | LisoError::CgiSpawnFailed(_) => STATUS_INTERNAL_ERROR,
        LisoError::MemFail(_) => STATUS_BAD_REQUEST,
        LisoError::Malformed(_) | LisoError::BadRequest(_) => STATUS_BAD_REQUEST,
        LisoError::PeerClosed | LisoError::Io(_) => STATUS_INTERNAL_ERROR,
    }
}

/// A CGI gateway timeout, reported separately from `status_for` since it
/// has no corresponding `LisoError` variant by the time it's detected (the
/// CGI orchestrator reports it directly as a status code).
pub fn gateway_timeout() -> (u16, &'static str) {
    STATUS_GATEWAY_TIMEOUT
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(version: &str, status: u16, reason: &str) -> Self {
        HttpResponse {
            version: version.to_string(),
            status,
            reason: reason.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok(version: &str) -> Self {
        Self::new(version, STATUS_OK.0, STATUS_OK.1)
    }

    /// Error responses carry an empty body and `Content-Type: text/html`,
    /// with `Content-Length: 0` set explicitly rather than left for the
    /// caller to add.
    pub fn error(version: &str, status: u16, reason: &str) -> Self {
        let mut resp = Self::new(version, status, reason);
        resp.set_header("Content-Type", "text/html");
        resp.set_header("Content-Length", "0");
        resp
    }

    /// Insert a header, preserving first-set-wins ordering: if the header
    /// is already present its value is replaced in place rather than
    /// appending a duplicate, keeping serialization order stable.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(existing) = self.headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            existing.1 = value;
        } else {
            self.headers.push((name.to_string(), value));
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Stamp the `Date` header with the current time in IMF-fixdate form.
    pub fn with_date(mut self) -> Self {
        self.set_header("Date", httpdate::fmt_http_date(std::time::SystemTime::now()));
        self
    }

    pub fn with_server_header(mut self) -> Self {
        self.set_header("Server", "liso/1.0");
        self
    }

    /// Set the `Connection` header as the caller decides it (default
    /// `keep-alive`), per the response contract every response must
    /// carry one.
    pub fn set_connection(&mut self, keep_alive: bool) {
        self.set_header("Connection", if keep_alive { "keep-alive" } else { "close" });
    }

    /// Serialize the status line, headers, and body into the bytes
    /// written to the wire, in insertion order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 256);
        out.extend_from_slice(format!("{} {} {}\r\n", self.version, self.status, self.reason).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// Same as `to_bytes` but drops the body, for `HEAD` responses.
    pub fn to_bytes_headers_only(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(format!("{} {} {}\r\n", self.version, self.status, self.reason).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Extension-based MIME lookup for static file serving.
pub fn mime_type_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()) {
        Some(ext) => match ext.as_str() {
            "html" | "htm" => "text/html",
            "css" => "text/css",
            "js" => "application/javascript",
            "json" => "application/json",
            "txt" => "text/plain",
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "gif" => "image/gif",
            _ => "application/octet-stream",
        },
        None => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_order_is_preserved_on_serialization() {
        let mut resp = HttpResponse::ok("HTTP/1.1");
        resp.set_header("Content-Type", "text/html");
        resp.set_header("Content-Length", "0");
        resp.set_header("X-Custom", "1");
        let bytes = resp.to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        let ct = text.find("Content-Type").unwrap();
        let cl = text.find("Content-Length").unwrap();
        let xc = text.find("X-Custom").unwrap();
        assert!(ct < cl && cl < xc);
    }

    #[test]
    fn head_serialization_drops_body() {
        let mut resp = HttpResponse::ok("HTTP/1.1");
        resp.body = b"hello".to_vec();
        let bytes = resp.to_bytes_headers_only();
        assert!(!bytes.ends_with(b"hello"));
    }

    #[test]
    fn mime_table_matches_known_extensions() {
        assert_eq!(mime_type_for(std::path::Path::new("a.html")), "text/html");
        assert_eq!(mime_type_for(std::path::Path::new("a.png")), "image/png");
        assert_eq!(mime_type_for(std::path::Path::new("a.unknown")), "application/octet-stream");
    }

    #[test]
    fn status_for_maps_error_kinds() {
        assert_eq!(status_for(&LisoError::LoadFailed("x".into())).0, 404);
        assert_eq!(status_for(&LisoError::Timeout).0, 408);
        assert_eq!(status_for(&LisoError::UnsupportedMethod("DELETE".into())).0, 501);
        assert_eq!(status_for(&LisoError::BadVersion("HTTP/2.0".into())).0, 505);
    }

    #[test]
    fn error_response_has_empty_html_body_and_zero_length() {
        let resp = HttpResponse::error("HTTP/1.1", 404, "Not Found");
        assert!(resp.body.is_empty());
        assert_eq!(resp.header("Content-Type"), Some("text/html"));
        assert_eq!(resp.header("Content-Length"), Some("0"));
    }

    #[test]
    fn set_connection_writes_keep_alive_or_close() {
        let mut resp = HttpResponse::ok("HTTP/1.1");
        resp.set_connection(true);
        assert_eq!(resp.header("Connection"), Some("keep-alive"));
        resp.set_connection(false);
        assert_eq!(resp.header("Connection"), Some("close"));
    }
}
