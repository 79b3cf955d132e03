use thiserror::Error;

/// Errors that can surface while parsing a request, dispatching it, or
/// driving a CGI child. Each variant that carries HTTP meaning maps to a
/// status code in `http::response::status_for`.
#[derive(Debug, Error)]
pub enum LisoError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("unsupported HTTP version: {0}")]
    BadVersion(String),

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("failed to load resource: {0}")]
    LoadFailed(String),

    #[error("connection timed out")]
    Timeout,

    #[error("out of memory: {0}")]
    MemFail(String),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("fatal socket error: {0}")]
    FatalSocket(#[source] std::io::Error),

    #[error("failed to spawn CGI process: {0}")]
    CgiSpawnFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LisoError>;
