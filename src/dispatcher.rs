//! Request dispatcher: decides, from a framed request head, what kind of
//! work a connection needs to do next (serve a static file, hand off to
//! CGI, or echo the request back), and builds the non-streaming parts of
//! the response.
//!
//! Grounded on `setup_action` in
//! `examples/kill-ux-01-server/src/http/request.rs` for the overall
//! classification shape (Host resolution, extension-based CGI routing,
//! method dispatch), simplified to this server's single document root
//! and single CGI script.

use crate::config::Config;
use crate::error::LisoError;
use crate::http::request::{Method, RequestHead};
use crate::http::response::HttpResponse;
use crate::resource;

/// What a connection should do to answer a request once its head (and,
/// for POST, body) is in hand.
pub enum Action {
    /// Headers and any remaining body are ready; nothing further to do.
    Immediate(HttpResponse),
    /// Stream a file's contents as the body of `response` (status/headers
    /// already set; Content-Length already matches the file's length).
    ServeFile {
        response: HttpResponse,
        path: std::path::PathBuf,
        head_only: bool,
    },
    /// Hand off to the CGI orchestrator.
    Cgi { script_name: String },
}

/// Does `url` route to the configured CGI script? Mirrors the teacher's
/// extension-keyed dispatch by instead keying on the `/cgi` path prefix
/// spec.md names as the CGI route.
fn is_cgi_route(url: &str) -> bool {
    let path = url.split('?').next().unwrap_or(url);
    path == "/cgi" || path.starts_with("/cgi/")
}

const SUPPORTED_VERSIONS: [&str; 2] = ["HTTP/1.0", "HTTP/1.1"];

/// Classify a request and build everything about the response that
/// doesn't require streaming a body. `body` is `Some` only once the
/// dispatcher has the full request body in hand (POST); GET/HEAD never
/// carry one. `keep_alive` is the connection-persistence decision the
/// caller already made from the request's `Connection` header; every
/// response built here carries it as its own `Connection` header.
pub fn dispatch(req: &RequestHead, body: &[u8], cfg: &Config, keep_alive: bool) -> Action {
    if !SUPPORTED_VERSIONS.contains(&req.version.as_str()) {
        // The client's own version line can't be echoed back as the
        // status line's version; answer in the highest version this
        // server speaks instead.
        return Action::Immediate(error_response("HTTP/1.1", &LisoError::BadVersion(req.version.clone()), keep_alive));
    }

    if is_cgi_route(&req.url) {
        return Action::Cgi {
            script_name: req.url.split('?').next().unwrap_or(&req.url).to_string(),
        };
    }

    match &req.method {
        Method::Get | Method::Head => match resource::resolve(&cfg.www_folder, &req.url) {
            Ok(path) => match resource::open(&path) {
                Ok(found) => {
                    let mut response = HttpResponse::ok(&req.version).with_date().with_server_header();
                    response.set_header("Content-Type", found.mime);
                    response.set_header("Content-Length", found.len.to_string());
                    response.set_header(
                        "Last-Modified",
                        httpdate::fmt_http_date(found.modified),
                    );
                    response.set_connection(keep_alive);
                    Action::ServeFile {
                        response,
                        path,
                        head_only: req.method == Method::Head,
                    }
                }
                Err(err) => Action::Immediate(error_response(&req.version, &err, keep_alive)),
            },
            Err(err) => Action::Immediate(error_response(&req.version, &err, keep_alive)),
        },
        Method::Post => {
            // Open Question #1: preserve the original's observable
            // behavior for POST against a non-CGI URI by echoing the raw
            // request back rather than returning an error.
            let mut raw = format!("{} {} {}\r\n", req.method, req.url, req.version).into_bytes();
            for (name, value) in req.headers.iter() {
                raw.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
            }
            raw.extend_from_slice(b"\r\n");
            raw.extend_from_slice(body);

            let mut response = HttpResponse::ok(&req.version).with_date().with_server_header();
            response.set_header("Content-Type", "application/octet-stream");
            response.set_header("Content-Length", raw.len().to_string());
            response.body = raw;
            response.set_connection(keep_alive);
            Action::Immediate(response)
        }
        Method::Other(tok) => Action::Immediate(error_response(
            &req.version,
            &LisoError::UnsupportedMethod(tok.clone()),
            keep_alive,
        )),
    }
}

pub fn error_response(version: &str, err: &LisoError, keep_alive: bool) -> HttpResponse {
    let (status, reason) = crate::http::status_for(err);
    let mut response = HttpResponse::error(version, status, reason).with_date().with_server_header();
    response.set_connection(keep_alive);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::parse_head;
    use std::path::PathBuf;

    fn test_config() -> Config {
        Config {
            http_port: 0,
            log_file: PathBuf::from("/dev/null"),
            lock_file: PathBuf::from("/dev/null"),
            www_folder: std::env::temp_dir(),
            cgi_script_path: PathBuf::from("/bin/true"),
            foreground: true,
        }
    }

    #[test]
    fn routes_cgi_prefix() {
        let req = parse_head(b"GET /cgi/foo.cgi HTTP/1.1\r\n\r\n").unwrap();
        match dispatch(&req, &[], &test_config(), true) {
            Action::Cgi { script_name } => assert_eq!(script_name, "/cgi/foo.cgi"),
            _ => panic!("expected CGI dispatch"),
        }
    }

    #[test]
    fn post_to_non_cgi_echoes_request() {
        let req = parse_head(b"POST /anything HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        match dispatch(&req, b"body", &test_config(), true) {
            Action::Immediate(resp) => {
                assert_eq!(resp.status, 200);
                assert!(resp.body.ends_with(b"body"));
                assert_eq!(resp.header("Connection"), Some("keep-alive"));
            }
            _ => panic!("expected immediate echo response"),
        }
    }

    #[test]
    fn missing_file_maps_to_404() {
        let req = parse_head(b"GET /does-not-exist.html HTTP/1.1\r\n\r\n").unwrap();
        match dispatch(&req, &[], &test_config(), true) {
            Action::Immediate(resp) => {
                assert_eq!(resp.status, 404);
                assert_eq!(resp.header("Content-Type"), Some("text/html"));
                assert_eq!(resp.header("Content-Length"), Some("0"));
            }
            _ => panic!("expected 404 response"),
        }
    }

    #[test]
    fn unsupported_version_maps_to_505() {
        let req = parse_head(b"GET / HTTP/2.0\r\n\r\n").unwrap();
        match dispatch(&req, &[], &test_config(), false) {
            Action::Immediate(resp) => {
                assert_eq!(resp.status, 505);
                assert_eq!(resp.version, "HTTP/1.1");
                assert_eq!(resp.header("Connection"), Some("close"));
            }
            _ => panic!("expected 505 response"),
        }
    }

    #[test]
    fn unsupported_method_maps_to_501() {
        let req = parse_head(b"DELETE / HTTP/1.1\r\n\r\n").unwrap();
        match dispatch(&req, &[], &test_config(), true) {
            Action::Immediate(resp) => assert_eq!(resp.status, 501),
            _ => panic!("expected 501 response"),
        }
    }
}
