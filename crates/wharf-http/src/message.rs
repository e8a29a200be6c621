use std::fmt::{self, Display};

use crate::headers::{ci_contains, Headers};

/// Request methods the parser accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    pub fn parse(value: &str) -> Option<Self> {
        let method = match value {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "CONNECT" => Method::Connect,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "PATCH" => Method::Patch,
            _ => return None,
        };

        Some(method)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol version of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_0_9: Self = Self::new(0, 9);
    pub const HTTP_1_0: Self = Self::new(1, 0);
    pub const HTTP_1_1: Self = Self::new(1, 1);

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Parse `HTTP/<digit>.<digit>`.
    pub fn parse(value: &str) -> Option<Self> {
        let digits = value.strip_prefix("HTTP/")?.as_bytes();

        match digits {
            [major, b'.', minor] if major.is_ascii_digit() && minor.is_ascii_digit() => {
                Some(Self::new(major - b'0', minor - b'0'))
            }
            _ => None,
        }
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::HTTP_1_1
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// Persistence requested by a `Connection` header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No explicit request, the protocol version decides.
    #[default]
    Default,
    Keep,
    Close,
}

impl ConnectionState {
    pub fn from_headers(headers: &Headers) -> Self {
        let value = headers.get("connection");

        if ci_contains(value, "keep-alive") {
            ConnectionState::Keep
        } else if ci_contains(value, "close") {
            ConnectionState::Close
        } else {
            ConnectionState::Default
        }
    }
}

/// Decide if the connection must close after the current response.
///
/// The request decides by its version and `Connection` header. A response can add a close, but
/// never keep open a connection the request closes.
pub fn closes_after(
    version: Version,
    request: ConnectionState,
    response: ConnectionState,
) -> bool {
    let request_closes = match request {
        ConnectionState::Close => true,
        // HTTP/0.9 has no persistent connections at all
        ConnectionState::Keep => version < Version::HTTP_1_0,
        ConnectionState::Default => version < Version::HTTP_1_1,
    };

    request_closes || response == ConnectionState::Close
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parsing() {
        assert_eq!(Version::parse("HTTP/1.1"), Some(Version::HTTP_1_1));
        assert_eq!(Version::parse("HTTP/0.9"), Some(Version::HTTP_0_9));
        assert_eq!(Version::parse("HTTP/1.10"), None);
        assert_eq!(Version::parse("HTTP/x.1"), None);
        assert_eq!(Version::parse("http/1.1"), None);
    }

    #[test]
    fn persistence_table() {
        use ConnectionState::*;

        assert!(closes_after(Version::HTTP_1_0, Default, Default));
        assert!(!closes_after(Version::HTTP_1_1, Default, Default));
        assert!(closes_after(Version::HTTP_1_1, Close, Default));
        assert!(!closes_after(Version::HTTP_1_0, Keep, Default));
        assert!(closes_after(Version::HTTP_0_9, Default, Default));
        assert!(closes_after(Version::HTTP_1_1, Keep, Close));
        assert!(closes_after(Version::HTTP_0_9, Keep, Default));
    }

    #[test]
    fn response_never_cancels_close() {
        use ConnectionState::*;

        assert!(closes_after(Version::HTTP_1_1, Close, Keep));
        assert!(closes_after(Version::HTTP_1_0, Default, Keep));
        assert!(!closes_after(Version::HTTP_1_0, Keep, Keep));
        assert!(!closes_after(Version::HTTP_1_1, Default, Keep));
    }

    #[test]
    fn connection_header_states() {
        let mut headers = Headers::new();
        assert_eq!(ConnectionState::from_headers(&headers), ConnectionState::Default);

        headers.insert_merged("Connection", "Keep-Alive");
        assert_eq!(ConnectionState::from_headers(&headers), ConnectionState::Keep);

        headers.replace("Connection", "CLOSE");
        assert_eq!(ConnectionState::from_headers(&headers), ConnectionState::Close);
    }
}
