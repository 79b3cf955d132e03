//! Central re-export hub, mirroring the teacher's `prelude.rs`: one
//! place for the handful of types and constants every module reaches
//! for.

pub use crate::config::{Cli, Config};
pub use crate::error::{LisoError, Result};
pub use crate::http::{Method, ParseError, RequestHead};

pub use mio::{event::Event, Events, Interest, Poll, Token};

pub const HTTP_OK: u16 = 200;
pub const HTTP_BAD_REQUEST: u16 = 400;
pub const HTTP_NOT_FOUND: u16 = 404;
pub const HTTP_REQUEST_TIMEOUT: u16 = 408;
pub const HTTP_INTERNAL_SERVER_ERROR: u16 = 500;
pub const HTTP_NOT_IMPLEMENTED: u16 = 501;
pub const HTTP_GATEWAY_TIMEOUT: u16 = 504;
pub const HTTP_VERSION_NOT_SUPPORTED: u16 = 505;
