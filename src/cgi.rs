//! CGI/1.1 orchestrator: spawns the configured script over a pair of
//! pipes and builds its environment. The script's stdout is forwarded to
//! the client byte-exact, so this module has nothing to say about its
//! contents beyond reading them.
//!
//! Grounded on `examples/kill-ux-01-server/src/cgi.rs` for the pipe
//! plumbing shape and on `examples/original_source/src/cgi.c` /
//! `src/http.c` for the pipe/fork/exec sequence and the exact
//! environment-variable set and ordering (`get_http_env`, `ENV_NUM 23`).

use std::io::Write as _;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Instant;

use mio::net::UnixStream as MioUnixStream;

use crate::error::LisoError;
use crate::http::request::RequestHead;

/// A live CGI child process plus the two non-blocking pipe ends used to
/// talk to it.
pub struct CgiProcess {
    pub child: Child,
    pub stdin: Option<MioUnixStream>,
    pub stdout: MioUnixStream,
    pub started_at: Instant,
    pending_stdin: Vec<u8>,
}

/// Build the CGI/1.1 environment for `req`, in the same order as the
/// original `get_http_env`: CONTENT_LENGTH, CONTENT_TYPE,
/// GATEWAY_INTERFACE, PATH_INFO, SCRIPT_NAME, SERVER_* fields,
/// REMOTE_ADDR/PORT, then one `HTTP_<UPPER_SNAKE>` per request header.
pub fn build_cgi_env(
    req: &RequestHead,
    script_name: &str,
    remote_addr: &str,
    remote_port: u16,
    server_port: u16,
    body_len: usize,
) -> Vec<(String, String)> {
    let mut env = Vec::with_capacity(8 + req.headers.iter().count());

    env.push(("CONTENT_LENGTH".to_string(), body_len.to_string()));
    env.push((
        "CONTENT_TYPE".to_string(),
        req.headers.get("content-type").unwrap_or("").to_string(),
    ));
    env.push(("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()));

    // PATH_INFO: strip the literal 4-character "/cgi" route prefix and any
    // trailing "?query" component, matching the original's strchr/strncpy
    // logic in get_http_env.
    let path_only = req.url.split('?').next().unwrap_or(&req.url);
    let path_info = path_only.strip_prefix("/cgi").unwrap_or(path_only);
    env.push(("PATH_INFO".to_string(), path_info.to_string()));
    env.push(("SCRIPT_NAME".to_string(), script_name.to_string()));
    env.push(("SERVER_NAME".to_string(), "liso".to_string()));
    env.push(("SERVER_PORT".to_string(), server_port.to_string()));
    env.push(("SERVER_PROTOCOL".to_string(), req.version.clone()));
    env.push(("SERVER_SOFTWARE".to_string(), "liso/1.0".to_string()));
    env.push(("REQUEST_METHOD".to_string(), req.method.as_str().to_string()));
    env.push(("REMOTE_ADDR".to_string(), remote_addr.to_string()));
    env.push(("REMOTE_PORT".to_string(), remote_port.to_string()));

    for (name, value) in req.headers.iter() {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("content-type") {
            continue;
        }
        let var = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        env.push((var, value.to_string()));
    }

    env
}

/// Spawn the configured CGI script, wiring up two non-blocking pipe
/// pairs (stdin to the child, stdout from it) the way the original forks
/// and `dup2`s its own pipe ends, but using owned-fd conversions instead
/// of raw `dup2`/`fork`.
pub fn spawn(
    cgi_script_path: &Path,
    env: &[(String, String)],
    body: Vec<u8>,
) -> Result<CgiProcess, LisoError> {
    let (child_stdin, server_stdin) =
        StdUnixStream::pair().map_err(|e| LisoError::CgiSpawnFailed(e.to_string()))?;
    let (server_stdout, child_stdout) =
        StdUnixStream::pair().map_err(|e| LisoError::CgiSpawnFailed(e.to_string()))?;

    server_stdin.set_nonblocking(true).map_err(LisoError::Io)?;
    server_stdout.set_nonblocking(true).map_err(LisoError::Io)?;

    let parent_pid = std::process::id() as i32;
    let mut command = Command::new(cgi_script_path);
    command
        .stdin(Stdio::from(OwnedFd::from(child_stdin)))
        .stdout(Stdio::from(OwnedFd::from(child_stdout)))
        .stderr(Stdio::inherit())
        .env_clear();
    for (k, v) in env {
        command.env(k, v);
    }

    // SAFETY: pre_exec runs in the forked child before exec; setpgid here
    // only touches the child's own process group, matching
    // `setpgid(getpid(), ppid)` in the original `start_process_cgi`.
    unsafe {
        command.pre_exec(move || {
            libc::setpgid(0, parent_pid);
            Ok(())
        });
    }

    let child = command.spawn().map_err(|e| {
        LisoError::CgiSpawnFailed(format!("{} ({})", e, describe_spawn_error(&e)))
    })?;

    Ok(CgiProcess {
        child,
        stdin: Some(MioUnixStream::from_std(server_stdin)),
        stdout: MioUnixStream::from_std(server_stdout),
        started_at: Instant::now(),
        pending_stdin: body,
    })
}

/// Classify a spawn failure the way `execve_error_handler` classifies
/// `errno` after a failed `execve`, for a diagnostic log line instead of
/// a bare "spawn failed".
fn describe_spawn_error(err: &std::io::Error) -> &'static str {
    match err.kind() {
        std::io::ErrorKind::NotFound => "script does not exist",
        std::io::ErrorKind::PermissionDenied => "execute permission denied",
        _ => "unknown error occurred while spawning CGI process",
    }
}

impl CgiProcess {
    /// Drain as much of the buffered request body into the child's stdin
    /// as the pipe will currently accept; returns `true` once everything
    /// has been written and the pipe end has been closed.
    pub fn drive_stdin(&mut self) -> std::io::Result<bool> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(true);
        };
        while !self.pending_stdin.is_empty() {
            match stdin.write(&self.pending_stdin) {
                Ok(0) => break,
                Ok(n) => {
                    self.pending_stdin.drain(..n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        if self.pending_stdin.is_empty() {
            self.stdin = None; // drop closes the write end, signalling EOF
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Whether the body still has bytes queued to write (or the pipe is
    /// still open waiting to be closed). Used to decide whether to
    /// register the stdin pipe for writable readiness at all.
    pub fn stdin_pending(&self) -> bool {
        self.stdin.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::parse_head;
    use std::io::Read;

    #[test]
    fn env_includes_required_vars_in_order() {
        let req = parse_head(b"GET /cgi/foo.cgi?x=1 HTTP/1.1\r\nHost: a\r\nX-Thing: yo\r\n\r\n").unwrap();
        let env = build_cgi_env(&req, "/cgi/foo.cgi", "127.0.0.1", 4242, 8080, 0);
        let names: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names[0], "CONTENT_LENGTH");
        assert_eq!(names[1], "CONTENT_TYPE");
        assert_eq!(names[2], "GATEWAY_INTERFACE");
        assert_eq!(names[3], "PATH_INFO");
        assert!(names.contains(&"HTTP_X_THING"));
    }

    #[test]
    fn path_info_strips_cgi_prefix_and_query() {
        let req = parse_head(b"GET /cgi/foo.cgi?x=1 HTTP/1.1\r\n\r\n").unwrap();
        let env = build_cgi_env(&req, "/cgi/foo.cgi", "127.0.0.1", 1, 1, 0);
        let path_info = env.iter().find(|(k, _)| k == "PATH_INFO").unwrap();
        assert_eq!(path_info.1, "/foo.cgi");
    }

    #[test]
    fn drive_stdin_writes_body_and_closes_pipe() {
        let (mut server_end, child_end) = StdUnixStream::pair().unwrap();
        child_end.set_nonblocking(true).unwrap();
        let mut process = CgiProcess {
            child: Command::new("true").spawn().unwrap(),
            stdin: Some(MioUnixStream::from_std(child_end)),
            stdout: MioUnixStream::from_std(StdUnixStream::pair().unwrap().0),
            started_at: Instant::now(),
            pending_stdin: b"hello".to_vec(),
        };

        assert!(process.drive_stdin().unwrap());
        assert!(process.stdin.is_none());
        assert!(!process.stdin_pending());

        let mut buf = [0u8; 16];
        let n = server_end.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        // The write end was dropped, so the read side now sees EOF.
        let n = server_end.read(&mut buf).unwrap();
        assert_eq!(n, 0);

        process.child.wait().unwrap();
    }
}
