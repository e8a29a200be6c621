//! HTTP/1.x for wharf.
//!
//! Incremental request and response parsing, request and response builders, server and client
//! connections with pipelining and keep-alive, and switching connections to other protocols.

pub mod client;
mod config;
mod cookie;
mod headers;
mod message;
pub mod mime;
pub mod parser;
mod request;
mod response;
pub mod server;
mod status;
pub mod upgrade;

pub use self::{
    config::{Compliance, HttpConfig},
    cookie::{format_set_cookie, parse_cookie_header, parse_set_cookie_header, Cookie},
    headers::{ci_contains, Headers},
    message::{closes_after, ConnectionState, Method, Version},
    parser::ParseError,
    request::{ClientRequest, Request},
    response::{http_date, ClientResponse, Response, SendFileError},
    status::{reason_or_unknown, reason_phrase},
};
