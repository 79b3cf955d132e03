//! Black-box tests that drive a real `Server` over a loopback socket,
//! in the style of the teacher's `tests/http_tests.rs`.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use liso::config::Config;
use liso::server::Server;

fn spawn_server(www_folder: std::path::PathBuf) -> (u16, Arc<AtomicBool>) {
    // Port 0 would be ideal, but Config/Server take a fixed port; pick a
    // high, unlikely-to-collide port per test instead.
    let port = pick_port();
    let config = Arc::new(Config {
        http_port: port,
        log_file: std::env::temp_dir().join("liso-test.log"),
        lock_file: std::env::temp_dir().join("liso-test.lock"),
        www_folder,
        cgi_script_path: std::path::PathBuf::from("/bin/true"),
        foreground: true,
    });
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut server = Server::bind(config, Arc::clone(&shutdown)).expect("bind");
    std::thread::spawn(move || {
        let _ = server.run();
    });
    // Give the background thread a moment to start polling.
    std::thread::sleep(Duration::from_millis(50));
    (port, shutdown)
}

fn pick_port() -> u16 {
    use std::sync::atomic::AtomicU16;
    static NEXT: AtomicU16 = AtomicU16::new(18080);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

fn request(port: u16, raw: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.write_all(raw).expect("write");
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                // The response is fully received once we can see the
                // blank line ending its headers and, for a fixed-length
                // body, the declared number of bytes.
                if liso::http::find_headers_end(&buf).is_some() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    buf
}

#[test]
fn static_get_serves_file_contents() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), b"<html>hi</html>").unwrap();
    let (port, shutdown) = spawn_server(dir.path().to_path_buf());

    let resp = request(port, b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    let text = String::from_utf8_lossy(&resp);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("Content-Type: text/html"));

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn head_request_omits_body() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), b"<html>hi</html>").unwrap();
    let (port, shutdown) = spawn_server(dir.path().to_path_buf());

    let resp = request(port, b"HEAD /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    let text = String::from_utf8_lossy(&resp);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(!text.contains("<html>"));

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn missing_file_returns_404() {
    let dir = tempfile::tempdir().unwrap();
    let (port, shutdown) = spawn_server(dir.path().to_path_buf());

    let resp = request(port, b"GET /nope.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    let text = String::from_utf8_lossy(&resp);
    assert!(text.starts_with("HTTP/1.1 404"));

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn unsupported_version_returns_505() {
    let dir = tempfile::tempdir().unwrap();
    let (port, shutdown) = spawn_server(dir.path().to_path_buf());

    let resp = request(port, b"GET / HTTP/2.0\r\nHost: localhost\r\n\r\n");
    let text = String::from_utf8_lossy(&resp);
    assert!(text.starts_with("HTTP/1.1 505"));

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn path_traversal_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (port, shutdown) = spawn_server(dir.path().to_path_buf());

    let resp = request(port, b"GET /../../etc/passwd HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    let text = String::from_utf8_lossy(&resp);
    assert!(text.starts_with("HTTP/1.1 404"));

    shutdown.store(true, Ordering::Relaxed);
}
