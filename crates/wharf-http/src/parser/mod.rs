//! Incremental HTTP/1.x message parsing.
//!
//! The parser consumes bytes as they arrive, in deliveries of any size, and resumes exactly
//! where it left off on the next call. Request and response parsing share the same state
//! machine, and only differ in their `MessageKind`.

mod chunked;
mod request;
mod response;

use std::mem;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tracing::{event, Level};

use crate::{
    headers::{ci_contains, Headers},
    HttpConfig,
};

use self::chunked::ChunkedDecoder;
pub use self::{request::RequestKind, response::ResponseKind};

pub type RequestParser = Parser<RequestKind>;
pub type ResponseParser = Parser<ResponseKind>;

/// Malformed message, reported as an HTTP status code and reason.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code} {reason}")]
pub struct ParseError {
    pub code: u16,
    pub reason: String,
}

impl ParseError {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub(crate) fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(400, reason)
    }
}

/// The side specific part of parsing, requests on servers and responses on clients.
pub trait MessageKind {
    type Message;

    /// Validate a start line, creating the message it begins.
    fn start_line(line: &str) -> Result<Self::Message, ParseError>;

    fn headers_mut(message: &mut Self::Message) -> &mut Headers;

    /// Derive structured state from the complete header block.
    fn analyze_header(message: &mut Self::Message);

    /// Body framing when neither `Content-Length` nor chunked encoding is present.
    fn unframed_body(message: &Self::Message) -> UnframedBody;

    fn set_body(message: &mut Self::Message, body: Bytes);
}

/// Body framing of a message without explicit length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnframedBody {
    Empty,
    /// The body ends when the peer closes the connection.
    UntilClose,
}

/// Hooks the owner of a parser implements.
pub trait ParserHandler<M> {
    /// A new message begins.
    fn on_begin(&mut self) {}

    /// The header block of the current message is complete.
    #[allow(unused_variables)]
    fn on_header(&mut self, message: &M) {}

    /// Decoded body bytes of the current message arrived.
    #[allow(unused_variables)]
    fn on_body_chunk(&mut self, chunk: &[u8]) {}

    /// The current message is complete.
    fn on_message(&mut self, message: M);

    /// The current message is malformed, the parser stops until it's reset.
    fn on_error(&mut self, error: ParseError);
}

/// Result of a `Parser::parse` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// All data was consumed without completing a message.
    Incomplete,
    /// A message completed, remaining data is left in the buffer.
    Complete,
    /// The parser failed, and won't consume any more data.
    Error,
}

enum State {
    Begin,
    FirstLine,
    Header,
    Body(Body),
    Error,
}

enum Body {
    Length(usize),
    Chunked(ChunkedDecoder),
    UntilClose,
}

pub struct Parser<K: MessageKind> {
    config: HttpConfig,
    state: State,
    line: Vec<u8>,
    message: Option<K::Message>,
    headers: Headers,
    last_field: Option<String>,
    body: BytesMut,
}

impl<K: MessageKind> Parser<K> {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            state: State::Begin,
            line: Vec::new(),
            message: None,
            headers: Headers::new(),
            last_field: None,
            body: BytesMut::new(),
        }
    }

    /// Discard all partial message state, and start waiting for a new message.
    pub fn reset(&mut self) {
        self.state = State::Begin;
        self.clear_scratch();
    }

    /// Returns true if no message is partially parsed.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Begin)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.state, State::Error)
    }

    /// Consume bytes from `data`.
    ///
    /// Returns after completing a single message, leaving the remaining bytes in `data`, or when
    /// `data` has been fully consumed.
    pub fn parse<H>(&mut self, data: &mut Bytes, handler: &mut H) -> Status
    where
        H: ParserHandler<K::Message>,
    {
        let result = self.parse_inner(data, handler);

        match result {
            Ok(status) => status,
            Err(error) => {
                event!(Level::DEBUG, code = error.code, reason = %error.reason, "parse error");

                self.state = State::Error;
                self.clear_scratch();
                handler.on_error(error);

                Status::Error
            }
        }
    }

    /// The peer closed the connection, completing a body that's framed by closing.
    pub fn finish<H>(&mut self, handler: &mut H) -> Status
    where
        H: ParserHandler<K::Message>,
    {
        match self.state {
            State::Body(Body::UntilClose) => self.complete(handler),
            State::Error => Status::Error,
            _ => Status::Incomplete,
        }
    }

    fn parse_inner<H>(&mut self, data: &mut Bytes, handler: &mut H) -> Result<Status, ParseError>
    where
        H: ParserHandler<K::Message>,
    {
        loop {
            match &mut self.state {
                State::Begin => {
                    if data.is_empty() {
                        return Ok(Status::Incomplete);
                    }

                    handler.on_begin();
                    self.state = State::FirstLine;
                }
                State::FirstLine => {
                    let Some(line) = read_line(&mut self.line, data, self.config.max_line_length)? else {
                        return Ok(Status::Incomplete);
                    };

                    let message = K::start_line(&line)?;
                    self.message = Some(message);
                    self.state = State::Header;
                }
                State::Header => {
                    let Some(line) = read_line(&mut self.line, data, self.config.max_line_length)? else {
                        return Ok(Status::Incomplete);
                    };

                    if line.is_empty() {
                        if let Some(status) = self.end_header(handler)? {
                            return Ok(status);
                        }
                    } else {
                        self.header_line(&line)?;
                    }
                }
                State::Body(Body::Length(remaining)) => {
                    if data.is_empty() {
                        return Ok(Status::Incomplete);
                    }

                    let count = (*remaining).min(data.len());
                    *remaining -= count;
                    let done = *remaining == 0;

                    let chunk = data.split_to(count);
                    handler.on_body_chunk(&chunk);
                    self.body.extend_from_slice(&chunk);

                    if done {
                        return Ok(self.complete(handler));
                    }
                }
                State::Body(Body::Chunked(decoder)) => {
                    let start = self.body.len();
                    let done = decoder.decode(
                        data,
                        &mut self.body,
                        &mut self.headers,
                        &self.config,
                    )?;

                    if self.body.len() > start {
                        handler.on_body_chunk(&self.body[start..]);
                    }

                    if !done {
                        return Ok(Status::Incomplete);
                    }

                    // Trailer fields join the regular headers
                    let trailer = mem::take(&mut self.headers);
                    if let Some(message) = self.message.as_mut() {
                        let headers = K::headers_mut(message);
                        for (field, value) in trailer.iter() {
                            headers.insert_merged(field, value);
                        }
                    }

                    return Ok(self.complete(handler));
                }
                State::Body(Body::UntilClose) => {
                    if data.is_empty() {
                        return Ok(Status::Incomplete);
                    }

                    handler.on_body_chunk(&data[..]);
                    self.body.extend_from_slice(&data[..]);
                    data.clear();
                }
                State::Error => return Ok(Status::Error),
            }
        }
    }

    fn header_line(&mut self, line: &str) -> Result<(), ParseError> {
        // Obsolete line folding, continuing the previous field
        if line.starts_with([' ', '\t']) {
            if self.config.compliance.contains(crate::Compliance::RFC7230) {
                return Err(ParseError::bad_request("Header Folding"));
            }

            let folded = self
                .last_field
                .as_deref()
                .map(|field| self.headers.extend_value(field, trim(line)))
                .unwrap_or(false);
            if !folded {
                return Err(ParseError::bad_request("Header Folding"));
            }

            return Ok(());
        }

        let (field, value) = line.split_once(':').unwrap_or((line, ""));

        if field.is_empty() {
            return Err(ParseError::bad_request("Header-field empty"));
        }
        if trim(field).len() != field.len() {
            return Err(ParseError::bad_request(
                "White space before or after header-field",
            ));
        }

        let value = trim(value);
        if value.is_empty() {
            return Err(ParseError::bad_request(format!(
                "Header-value of field \"{}\" empty",
                field
            )));
        }

        let field = field.to_ascii_lowercase();
        if field == "set-cookie" {
            self.headers.append_raw(&field, value);
        } else {
            self.headers.insert_merged(&field, value);
        }
        self.last_field = Some(field);

        Ok(())
    }

    /// Finish the header block, returning a status if parsing should suspend.
    fn end_header<H>(&mut self, handler: &mut H) -> Result<Option<Status>, ParseError>
    where
        H: ParserHandler<K::Message>,
    {
        let Some(mut message) = self.message.take() else {
            return Err(ParseError::new(500, "Header without message"));
        };

        *K::headers_mut(&mut message) = mem::take(&mut self.headers);
        self.last_field = None;
        K::analyze_header(&mut message);

        let headers = K::headers_mut(&mut message);
        let chunked = ci_contains(headers.get("transfer-encoding"), "chunked");
        let content_length = headers.find("content-length").map(str::to_string);

        let body = if chunked {
            Some(Body::Chunked(ChunkedDecoder::default()))
        } else if let Some(value) = content_length {
            let length = value
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::bad_request("Malformed Content-Length"))?;

            if length > self.config.max_content_length {
                return Err(ParseError::new(413, "Content too large"));
            }

            (length != 0).then_some(Body::Length(length))
        } else {
            match K::unframed_body(&message) {
                UnframedBody::Empty => None,
                UnframedBody::UntilClose => Some(Body::UntilClose),
            }
        };

        handler.on_header(&message);
        self.message = Some(message);

        match body {
            Some(body) => {
                self.state = State::Body(body);
                Ok(None)
            }
            None => Ok(Some(self.complete(handler))),
        }
    }

    fn complete<H>(&mut self, handler: &mut H) -> Status
    where
        H: ParserHandler<K::Message>,
    {
        let message = self.message.take();
        let body = mem::take(&mut self.body).freeze();

        self.state = State::Begin;
        self.clear_scratch();

        if let Some(mut message) = message {
            K::set_body(&mut message, body);
            handler.on_message(message);
        }

        Status::Complete
    }

    fn clear_scratch(&mut self) {
        self.line.clear();
        self.message = None;
        self.headers.clear();
        self.last_field = None;
        self.body.clear();
    }
}

/// Read a line terminated by `\n` into `buffer`, ignoring `\r`.
///
/// Returns `None` if `data` ran out before the end of the line, the partial line stays in
/// `buffer` for the next call.
pub(crate) fn read_line(
    buffer: &mut Vec<u8>,
    data: &mut Bytes,
    max_length: usize,
) -> Result<Option<String>, ParseError> {
    let end = data.iter().position(|byte| *byte == b'\n');
    let available = end.unwrap_or(data.len());

    buffer.extend(data[..available].iter().filter(|byte| **byte != b'\r'));
    data.advance(end.map(|end| end + 1).unwrap_or(available));

    if buffer.len() > max_length {
        return Err(ParseError::new(431, "Line too long"));
    }

    if end.is_none() {
        return Ok(None);
    }

    let line = String::from_utf8(mem::take(buffer))
        .map_err(|_| ParseError::bad_request("Invalid characters in line"))?;

    Ok(Some(line))
}

/// Trim horizontal whitespace only.
pub(crate) fn trim(value: &str) -> &str {
    value.trim_matches(|c| c == ' ' || c == '\t')
}
