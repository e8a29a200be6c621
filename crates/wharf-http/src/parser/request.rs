use std::collections::BTreeMap;

use bytes::Bytes;

use crate::{
    cookie::parse_cookie_header,
    headers::Headers,
    message::{ConnectionState, Method, Version},
    parser::{MessageKind, ParseError, UnframedBody},
    Request,
};

/// Server side parsing of requests.
pub struct RequestKind;

impl MessageKind for RequestKind {
    type Message = Request;

    fn start_line(line: &str) -> Result<Request, ParseError> {
        if line.is_empty() {
            return Err(ParseError::bad_request("Request-line empty"));
        }

        let (method, remaining) = line.split_once(' ').unwrap_or((line, ""));
        let (url, version) = remaining.split_once(' ').unwrap_or((remaining, ""));

        let method =
            Method::parse(method).ok_or_else(|| ParseError::bad_request("Bad request method"))?;

        if !url.starts_with('/') {
            return Err(ParseError::bad_request("Malformed request"));
        }

        let version = Version::parse(version)
            .ok_or_else(|| ParseError::bad_request("Wrong protocol-version"))?;

        let (path, query) = url.split_once('?').unwrap_or((url, ""));

        let request = Request {
            method,
            url: url.to_string(),
            path: path.to_string(),
            query: parse_query(query),
            version,
            ..Request::default()
        };
        Ok(request)
    }

    fn headers_mut(message: &mut Request) -> &mut Headers {
        &mut message.headers
    }

    fn analyze_header(message: &mut Request) {
        for value in message.headers.remove("cookie") {
            parse_cookie_header(&value, &mut message.cookies);
        }

        message.connection = ConnectionState::from_headers(&message.headers);
    }

    fn unframed_body(_message: &Request) -> UnframedBody {
        // A request can't be terminated by closing, the response still has to be sent back
        UnframedBody::Empty
    }

    fn set_body(message: &mut Request, body: Bytes) {
        message.body = body;
    }
}

/// Split a query string on `&` and then `=`, the first occurrence of a key wins.
fn parse_query(query: &str) -> BTreeMap<String, String> {
    let mut queries = BTreeMap::new();

    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        queries
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
    }

    queries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_keys_without_value_are_kept() {
        let query = parse_query("a=1&flag&b=2&a=3");

        assert_eq!(query.len(), 3);
        assert_eq!(query["a"], "1");
        assert_eq!(query["flag"], "");
        assert_eq!(query["b"], "2");
    }

    #[test]
    fn start_line_errors() {
        let reason = |line| RequestKind::start_line(line).err().map(|error| error.reason);

        assert_eq!(reason("").as_deref(), Some("Request-line empty"));
        assert_eq!(reason("FETCH / HTTP/1.1").as_deref(), Some("Bad request method"));
        assert_eq!(reason("GET index HTTP/1.1").as_deref(), Some("Malformed request"));
        assert_eq!(reason("GET / HTTP/11").as_deref(), Some("Wrong protocol-version"));
    }

    #[test]
    fn start_line_splits_target() {
        let request = RequestKind::start_line("GET /search?q=rust HTTP/1.0").unwrap();

        assert_eq!(request.method, Method::Get);
        assert_eq!(request.url, "/search?q=rust");
        assert_eq!(request.path, "/search");
        assert_eq!(request.query["q"], "rust");
        assert_eq!(request.version, Version::HTTP_1_0);
    }
}
