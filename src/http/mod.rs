pub mod request;
pub mod response;

pub use request::{find_headers_end, parse_head, Method, ParseError, RequestHead};
pub use response::{gateway_timeout, mime_type_for, status_for, HttpResponse};
