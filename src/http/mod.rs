//! HTTP/1.x message machinery (RFC 2616 semantics): header parse/compose,
//! full request/reply encoding, and the streaming message parser.

pub mod consts;
pub mod header;
pub mod message;

pub use consts::{HttpMethod, HttpVersion, StatusCode};
pub use header::{FirstLineType, Header, ParseError};
pub use message::{read_state, ParseState, Request, RequestParser, RequestStats};
