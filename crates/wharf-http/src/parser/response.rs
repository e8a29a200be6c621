use bytes::Bytes;

use crate::{
    cookie::parse_set_cookie_header,
    headers::Headers,
    message::{ConnectionState, Version},
    parser::{MessageKind, ParseError, UnframedBody},
    status::reason_phrase,
    ClientResponse,
};

/// Client side parsing of responses.
pub struct ResponseKind;

impl MessageKind for ResponseKind {
    type Message = ClientResponse;

    fn start_line(line: &str) -> Result<ClientResponse, ParseError> {
        if line.is_empty() {
            return Err(ParseError::bad_request("Response line empty"));
        }

        let (version, remaining) = line.split_once(' ').unwrap_or((line, ""));
        let version = Version::parse(version)
            .ok_or_else(|| ParseError::bad_request("Wrong protocol version"))?;

        let (status, reason) = remaining.split_once(' ').unwrap_or((remaining, ""));
        let status = status
            .parse::<u16>()
            .ok()
            .filter(|status| reason_phrase(*status).is_some())
            .ok_or_else(|| ParseError::bad_request("Unknown status code"))?;

        if reason.is_empty() {
            return Err(ParseError::bad_request("No reason phrase"));
        }

        let response = ClientResponse {
            version,
            status,
            reason: reason.to_string(),
            ..ClientResponse::default()
        };
        Ok(response)
    }

    fn headers_mut(message: &mut ClientResponse) -> &mut Headers {
        &mut message.headers
    }

    fn analyze_header(message: &mut ClientResponse) {
        for value in message.headers.remove("set-cookie") {
            parse_set_cookie_header(&value, &mut message.cookies);
        }

        message.connection = ConnectionState::from_headers(&message.headers);
    }

    fn unframed_body(message: &ClientResponse) -> UnframedBody {
        // Informational, no content and not modified responses never have a body
        if (100..200).contains(&message.status) || message.status == 204 || message.status == 304
        {
            return UnframedBody::Empty;
        }

        if message.version < Version::HTTP_1_1 {
            UnframedBody::UntilClose
        } else {
            UnframedBody::Empty
        }
    }

    fn set_body(message: &mut ClientResponse, body: Bytes) {
        message.body = body;
    }
}
