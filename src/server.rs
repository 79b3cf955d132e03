//! The event loop: a single `mio::Poll` driving accept, read, write, and
//! CGI-pipe readiness, plus a per-tick sweep of the connection arena for
//! idle timeouts.
//!
//! Grounded on `examples/kill-ux-01-server/src/http/http_connection.rs`
//! (`handle_read_phase`/`handle_write_phase`/`handle_post_write_update`,
//! including the pipelining re-entry at the end of a write) and
//! `src/timeouts.rs` (the per-tick reaper sweep), retargeted at the
//! arena in `crate::arena` instead of a flat `HashMap` plus `retain`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Socket, Type};

use crate::arena::{Arena, Handle};
use crate::cgi::{self, CgiProcess};
use crate::config::Config;
use crate::dispatcher::{self, Action};
use crate::error::LisoError;
use crate::http::request::{self, RequestHead};
use crate::http::response::HttpResponse;
use crate::resource;

/// Connections are reaped once idle for this long, per the idle-timeout
/// contract.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
/// A CGI child that hasn't produced output in this long is force-killed
/// and answered with a gateway timeout.
pub const CGI_TIMEOUT: Duration = Duration::from_secs(10);

const LISTENER_TOKEN: Token = Token(0);
const READ_CHUNK: usize = 4096;

enum ConnState {
    ReadingHead,
    ReadingBody {
        head: RequestHead,
        body: Vec<u8>,
        remaining: usize,
    },
    RunningCgi {
        process: CgiProcess,
        stdout_token: Token,
        stdin_token: Option<Token>,
        keep_alive: bool,
    },
    Writing {
        keep_alive: bool,
    },
}

/// Which half of a CGI child's pipes a `cgi_tokens` entry refers to.
#[derive(Clone, Copy, PartialEq, Eq)]
enum CgiChannel {
    Stdin,
    Stdout,
}

struct Connection {
    stream: TcpStream,
    token: Token,
    peer_addr: SocketAddr,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    write_pos: usize,
    state: ConnState,
    pending_file: Option<(std::fs::File, u64)>,
}

impl Connection {
    fn interest_for(&self) -> Interest {
        match self.state {
            ConnState::Writing { .. } => Interest::WRITABLE,
            ConnState::RunningCgi { .. } => Interest::READABLE,
            _ => {
                if self.write_pos < self.write_buf.len() {
                    Interest::READABLE | Interest::WRITABLE
                } else {
                    Interest::READABLE
                }
            }
        }
    }
}

pub struct Server {
    poll: Poll,
    listener: TcpListener,
    arena: Arena<Connection>,
    tokens: HashMap<Token, Handle>,
    cgi_tokens: HashMap<Token, (Handle, CgiChannel)>,
    next_token: usize,
    config: Arc<Config>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn bind(config: Arc<Config>, shutdown: Arc<AtomicBool>) -> Result<Self, LisoError> {
        let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port)
            .parse()
            .map_err(|e| LisoError::FatalSocket(std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}"))))?;

        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).map_err(LisoError::Io)?;
        socket.set_reuse_address(true).map_err(LisoError::Io)?;
        socket.set_nodelay(true).map_err(LisoError::Io)?;
        socket.bind(&addr.into()).map_err(LisoError::Io)?;
        socket.listen(1000).map_err(LisoError::Io)?;
        socket.set_nonblocking(true).map_err(LisoError::Io)?;

        let mut listener = TcpListener::from_std(socket.into());
        let poll = Poll::new().map_err(LisoError::Io)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(LisoError::Io)?;

        Ok(Server {
            poll,
            listener,
            arena: Arena::new(),
            tokens: HashMap::new(),
            cgi_tokens: HashMap::new(),
            next_token: 1,
            config,
            shutdown,
        })
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn run(&mut self) -> Result<(), LisoError> {
        let mut events = Events::with_capacity(1024);
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                self.teardown_all_cgi();
                return Ok(());
            }

            match self.poll.poll(&mut events, Some(Duration::from_secs(1))) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(LisoError::FatalSocket(e)),
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_all()?;
                    continue;
                }
                if let Some(&(handle, channel)) = self.cgi_tokens.get(&event.token()) {
                    self.handle_cgi_event(handle, event.token(), channel);
                    continue;
                }
                if let Some(&handle) = self.tokens.get(&event.token()) {
                    self.handle_conn_event(handle, event.is_readable(), event.is_writable());
                }
            }

            self.reap_idle();
            self.enforce_cgi_timeouts();
        }
    }

    /// A CGI child that has been running longer than `CGI_TIMEOUT` without
    /// finishing is killed and answered with a gateway timeout, matching
    /// `force_cgi_timeout` in the teacher's CGI module.
    fn enforce_cgi_timeouts(&mut self) {
        let now = Instant::now();
        let stale: Vec<Handle> = self
            .arena
            .iter()
            .filter_map(|(handle, conn)| match &conn.state {
                ConnState::RunningCgi { process, .. } if now.duration_since(process.started_at) > CGI_TIMEOUT => {
                    Some(handle)
                }
                _ => None,
            })
            .collect();

        for handle in stale {
            let Some(conn) = self.arena.get_mut(handle) else { continue };
            let placeholder = ConnState::Writing { keep_alive: false };
            if let ConnState::RunningCgi { mut process, stdout_token, stdin_token, .. } =
                std::mem::replace(&mut conn.state, placeholder)
            {
                let _ = self.poll.registry().deregister(&mut process.stdout);
                if let Some(stdin) = process.stdin.as_mut() {
                    let _ = self.poll.registry().deregister(stdin);
                }
                self.remove_cgi_tokens(stdout_token, stdin_token);
                kill_cgi(&mut process);
            }
            let (status, reason) = crate::http::gateway_timeout();
            let mut resp = HttpResponse::error("HTTP/1.1", status, reason)
                .with_date()
                .with_server_header();
            resp.set_connection(false);
            self.queue_response(handle, resp, false, false);
            self.write_phase(handle);
            self.reregister(handle);
        }
    }

    fn accept_all(&mut self) -> Result<(), LisoError> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    let token = self.alloc_token();
                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                        .map_err(LisoError::Io)?;
                    let conn = Connection {
                        stream,
                        token,
                        peer_addr,
                        read_buf: Vec::new(),
                        write_buf: Vec::new(),
                        write_pos: 0,
                        state: ConnState::ReadingHead,
                        pending_file: None,
                    };
                    let handle = self.arena.add(conn, Instant::now());
                    self.tokens.insert(token, handle);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    return Ok(());
                }
            }
        }
    }

    /// A connection idle past `IDLE_TIMEOUT` is answered with a
    /// best-effort `408 Request Timeout` before its socket is torn down,
    /// rather than silently dropped.
    fn reap_idle(&mut self) {
        while let Some((_, mut conn)) = self.arena.reap(Instant::now(), IDLE_TIMEOUT) {
            self.tokens.remove(&conn.token);
            let old_state = std::mem::replace(&mut conn.state, ConnState::Writing { keep_alive: false });
            if let ConnState::RunningCgi { mut process, stdout_token, stdin_token, .. } = old_state {
                self.remove_cgi_tokens(stdout_token, stdin_token);
                kill_cgi(&mut process);
            }

            let mut resp = HttpResponse::error("HTTP/1.1", 408, "Request Timeout")
                .with_date()
                .with_server_header();
            resp.set_connection(false);
            let bytes = resp.to_bytes();
            let _ = conn.stream.write_all(&bytes);

            let _ = self.poll.registry().deregister(&mut conn.stream);
            let _ = conn.stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn teardown_all_cgi(&mut self) {
        let handles: Vec<Handle> = self.arena.iter().map(|(h, _)| h).collect();
        for handle in handles {
            if let Some(conn) = self.arena.get_mut(handle) {
                if let ConnState::RunningCgi { process, .. } = &mut conn.state {
                    kill_cgi(process);
                }
            }
        }
    }

    fn remove_cgi_tokens(&mut self, stdout_token: Token, stdin_token: Option<Token>) {
        self.cgi_tokens.remove(&stdout_token);
        if let Some(stdin_token) = stdin_token {
            self.cgi_tokens.remove(&stdin_token);
        }
    }

    fn handle_conn_event(&mut self, handle: Handle, readable: bool, writable: bool) {
        self.arena.touch(handle, Instant::now());

        if readable {
            if !self.read_phase(handle) {
                return;
            }
        }
        if writable {
            self.write_phase(handle);
        }
        self.reregister(handle);
    }

    fn reregister(&mut self, handle: Handle) {
        let Some(conn) = self.arena.get_mut(handle) else { return };
        let interest = conn.interest_for();
        let _ = self.poll.registry().reregister(&mut conn.stream, conn.token, interest);
    }

    /// Returns `false` if the connection was torn down during this call.
    fn read_phase(&mut self, handle: Handle) -> bool {
        loop {
            let Some(conn) = self.arena.get_mut(handle) else { return false };
            let mut chunk = [0u8; READ_CHUNK];
            match conn.stream.read(&mut chunk) {
                Ok(0) => {
                    self.close_connection(handle);
                    return false;
                }
                Ok(n) => {
                    conn.read_buf.extend_from_slice(&chunk[..n]);
                    if !self.advance_parsing(handle) {
                        return false;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return true,
                Err(_) => {
                    self.close_connection(handle);
                    return false;
                }
            }
        }
    }

    /// Drive the per-connection parsing/dispatch state machine as far as
    /// the currently-buffered bytes allow. Returns `false` if the
    /// connection was torn down.
    fn advance_parsing(&mut self, handle: Handle) -> bool {
        loop {
            let Some(conn) = self.arena.get_mut(handle) else { return false };
            match &conn.state {
                ConnState::ReadingHead => {
                    let Some(end) = request::find_headers_end(&conn.read_buf) else {
                        return true; // need more bytes
                    };
                    let head_bytes = conn.read_buf[..end].to_vec();
                    match request::parse_head(&head_bytes) {
                        Ok(head) => {
                            conn.read_buf.drain(..end);
                            let remaining = head.content_length().unwrap_or(0);
                            conn.state = ConnState::ReadingBody {
                                head,
                                body: Vec::new(),
                                remaining,
                            };
                        }
                        Err(e) => {
                            // Framing failed before a full head (with its
                            // headers) exists, so there's no reliable
                            // `Connection` to honor; close after this one.
                            let version = "HTTP/1.1";
                            let (status, reason) = parse_error_status(&e);
                            let mut resp = HttpResponse::error(version, status, reason)
                                .with_date()
                                .with_server_header();
                            resp.set_connection(false);
                            self.queue_response(handle, resp, false, false);
                            return true;
                        }
                    }
                }
                ConnState::ReadingBody { remaining, .. } => {
                    let remaining = *remaining;
                    if remaining > 0 {
                        let available = conn.read_buf.len().min(remaining);
                        if available == 0 {
                            return true; // wait for more bytes
                        }
                        let chunk: Vec<u8> = conn.read_buf.drain(..available).collect();
                        let ConnState::ReadingBody { body, remaining, .. } = &mut conn.state else {
                            unreachable!()
                        };
                        body.extend_from_slice(&chunk);
                        *remaining -= available;
                        if *remaining > 0 {
                            return true;
                        }
                    }
                    let ConnState::ReadingBody { head, body, .. } =
                        std::mem::replace(&mut conn.state, ConnState::ReadingHead)
                    else {
                        unreachable!()
                    };
                    self.dispatch_request(handle, head, body);
                    if self.arena.get(handle).is_none() {
                        return false;
                    }
                }
                ConnState::RunningCgi { .. } | ConnState::Writing { .. } => return true,
            }
        }
    }

    fn dispatch_request(&mut self, handle: Handle, head: RequestHead, body: Vec<u8>) {
        let keep_alive = head.keep_alive();
        let action = dispatcher::dispatch(&head, &body, &self.config, keep_alive);
        match action {
            Action::Immediate(resp) => {
                self.queue_response(handle, resp, false, keep_alive);
            }
            Action::ServeFile { response, path, head_only } => {
                self.start_file_response(handle, response, path, head_only, keep_alive);
            }
            Action::Cgi { script_name } => {
                self.start_cgi(handle, &head, &body, &script_name, keep_alive);
            }
        }
    }

    fn start_file_response(
        &mut self,
        handle: Handle,
        response: HttpResponse,
        path: PathBuf,
        head_only: bool,
        keep_alive: bool,
    ) {
        let file = if head_only { None } else {
            match resource::open(&path) {
                Ok(res) => Some((res.file, res.len)),
                Err(_) => None,
            }
        };
        let Some(conn) = self.arena.get_mut(handle) else { return };
        conn.write_buf = response.to_bytes_headers_only();
        conn.write_pos = 0;
        conn.pending_file = file;
        conn.state = ConnState::Writing { keep_alive };
    }

    fn start_cgi(&mut self, handle: Handle, head: &RequestHead, body: &[u8], script_name: &str, keep_alive: bool) {
        let peer_addr = self.arena.get(handle).map(|c| c.peer_addr);
        let Some(peer_addr) = peer_addr else { return };
        let env = cgi::build_cgi_env(
            head,
            script_name,
            &peer_addr.ip().to_string(),
            peer_addr.port(),
            self.config.http_port,
            body.len(),
        );
        match cgi::spawn(&self.config.cgi_script_path, &env, body.to_vec()) {
            Ok(mut process) => {
                let stdout_token = self.alloc_token();
                if self
                    .poll
                    .registry()
                    .register(&mut process.stdout, stdout_token, Interest::READABLE)
                    .is_err()
                {
                    kill_cgi(&mut process);
                    self.fail_cgi(handle, keep_alive);
                    return;
                }
                self.cgi_tokens.insert(stdout_token, (handle, CgiChannel::Stdout));

                // Write as much of the request body as the pipe accepts
                // right away; only register for writable readiness if the
                // child's stdin buffer is full and there's more to send.
                let stdin_token = match process.drive_stdin() {
                    Ok(true) => None,
                    Ok(false) => {
                        let token = self.alloc_token();
                        let registered = process
                            .stdin
                            .as_mut()
                            .map(|s| self.poll.registry().register(s, token, Interest::WRITABLE))
                            .transpose();
                        match registered {
                            Ok(_) => {
                                self.cgi_tokens.insert(token, (handle, CgiChannel::Stdin));
                                Some(token)
                            }
                            Err(_) => None,
                        }
                    }
                    Err(_) => None,
                };

                if let Some(conn) = self.arena.get_mut(handle) {
                    conn.state = ConnState::RunningCgi {
                        process,
                        stdout_token,
                        stdin_token,
                        keep_alive,
                    };
                }
            }
            Err(_) => self.fail_cgi(handle, keep_alive),
        }
    }

    fn fail_cgi(&mut self, handle: Handle, keep_alive: bool) {
        let mut resp = HttpResponse::error("HTTP/1.1", 500, "Internal Server Error")
            .with_date()
            .with_server_header();
        resp.set_connection(keep_alive);
        self.queue_response(handle, resp, false, keep_alive);
    }

    fn handle_cgi_event(&mut self, handle: Handle, token: Token, channel: CgiChannel) {
        self.arena.touch(handle, Instant::now());

        match channel {
            CgiChannel::Stdin => self.handle_cgi_stdin_event(handle, token),
            CgiChannel::Stdout => self.handle_cgi_stdout_event(handle, token),
        }

        self.write_phase(handle);
        self.reregister(handle);
    }

    /// Drive queued request-body bytes into the CGI child's stdin pipe.
    /// Once fully written (and the pipe closed) the token is retired.
    fn handle_cgi_stdin_event(&mut self, handle: Handle, token: Token) {
        let Some(conn) = self.arena.get_mut(handle) else { return };
        let ConnState::RunningCgi { process, stdin_token, .. } = &mut conn.state else { return };
        match process.drive_stdin() {
            Ok(true) | Err(_) => {
                if let Some(stdin) = process.stdin.as_mut() {
                    let _ = self.poll.registry().deregister(stdin);
                }
                *stdin_token = None;
                self.cgi_tokens.remove(&token);
            }
            Ok(false) => {}
        }
    }

    /// Forward CGI stdout bytes straight into the connection's write
    /// buffer, unmodified: the script's own status line and headers are
    /// the response, byte for byte.
    fn handle_cgi_stdout_event(&mut self, handle: Handle, token: Token) {
        let mut done = false;

        if let Some(conn) = self.arena.get_mut(handle) {
            if let ConnState::RunningCgi { process, .. } = &mut conn.state {
                let mut buf = [0u8; READ_CHUNK];
                match process.stdout.read(&mut buf) {
                    Ok(0) => done = true,
                    Ok(n) => conn.write_buf.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(_) => done = true,
                }
            }
        }

        if done {
            self.cgi_tokens.remove(&token);
            if let Some(conn) = self.arena.get_mut(handle) {
                let placeholder = ConnState::Writing { keep_alive: false };
                if let ConnState::RunningCgi { mut process, stdin_token, keep_alive, .. } =
                    std::mem::replace(&mut conn.state, placeholder)
                {
                    let _ = self.poll.registry().deregister(&mut process.stdout);
                    if let Some(stdin_token) = stdin_token {
                        self.cgi_tokens.remove(&stdin_token);
                        if let Some(stdin) = process.stdin.as_mut() {
                            let _ = self.poll.registry().deregister(stdin);
                        }
                    }
                    let _ = process.child.try_wait();
                    conn.state = ConnState::Writing { keep_alive };
                }
            }
        }
    }

    fn write_phase(&mut self, handle: Handle) {
        loop {
            let Some(conn) = self.arena.get_mut(handle) else { return };

            if conn.write_pos < conn.write_buf.len() {
                match conn.stream.write(&conn.write_buf[conn.write_pos..]) {
                    Ok(0) => return,
                    Ok(n) => conn.write_pos += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                    Err(_) => {
                        self.close_connection(handle);
                        return;
                    }
                }
                continue;
            }

            if let Some((mut file, remaining)) = conn.pending_file.take() {
                if remaining == 0 {
                    continue;
                }
                let mut chunk = vec![0u8; resource::DEFAULT_CHUNK.min(remaining as usize)];
                match file.read(&mut chunk) {
                    Ok(0) => continue,
                    Ok(n) => {
                        conn.write_buf.clear();
                        conn.write_buf.extend_from_slice(&chunk[..n]);
                        conn.write_pos = 0;
                        conn.pending_file = Some((file, remaining - n as u64));
                        continue;
                    }
                    Err(_) => {
                        self.close_connection(handle);
                        return;
                    }
                }
            }

            // Response fully flushed.
            let keep_alive = matches!(conn.state, ConnState::Writing { keep_alive: true });
            if !keep_alive {
                self.close_connection(handle);
                return;
            }
            conn.write_buf.clear();
            conn.write_pos = 0;
            conn.state = ConnState::ReadingHead;

            // Pipelining: if another full request is already buffered,
            // process it immediately rather than waiting for another
            // readiness notification.
            if !conn.read_buf.is_empty() {
                if !self.advance_parsing(handle) {
                    return;
                }
                continue;
            }
            return;
        }
    }

    fn queue_response(&mut self, handle: Handle, response: HttpResponse, head_only: bool, keep_alive: bool) {
        let Some(conn) = self.arena.get_mut(handle) else { return };
        conn.write_buf = if head_only {
            response.to_bytes_headers_only()
        } else {
            response.to_bytes()
        };
        conn.write_pos = 0;
        conn.state = ConnState::Writing { keep_alive };
    }

    fn close_connection(&mut self, handle: Handle) {
        self.tokens.retain(|_, h| *h != handle);
        if let Some(mut conn) = self.arena.remove(handle) {
            if let ConnState::RunningCgi { mut process, stdout_token, stdin_token, .. } = conn.state {
                self.remove_cgi_tokens(stdout_token, stdin_token);
                kill_cgi(&mut process);
            }
            let _ = self.poll.registry().deregister(&mut conn.stream);
            let _ = conn.stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

fn kill_cgi(process: &mut CgiProcess) {
    unsafe {
        libc::killpg(process.child.id() as i32, libc::SIGKILL);
    }
    let _ = process.child.wait();
}

fn parse_error_status(err: &request::ParseError) -> (u16, &'static str) {
    match err {
        request::ParseError::UriTooLong => (414, "URI Too Long"),
        request::ParseError::HeadersTooLarge => (431, "Request Header Fields Too Large"),
        _ => (400, "Bad Request"),
    }
}
