//! HTTP/1.1 message handling
//!
//! Request and response heads are parsed with `httparse`; bodies are framed
//! by [`BodyKind`] and relayed through [`HttpStream`]. Header names are kept
//! as received and title-cased on the way out.

mod body;
mod headers;
mod request;
mod response;

pub use body::{request_body_kind, response_body_kind, BodyKind, BodyOutcome, HttpStream, MAX_HEAD_SIZE};
pub use headers::{is_skipped, quote_disposition, split_set_cookie, title_case, Headers, SKIP_HEADERS};
pub use request::{
    netloc_host_port, parse_request_head, path_and_query, split_host_port, split_url, unquote_plus, Request,
    RequestHead, Scheme,
};
pub use response::{parse_response_head, reason_phrase, write_response_head, ResponseHead};
