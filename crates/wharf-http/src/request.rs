use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    headers::{ci_contains, Headers},
    message::{ConnectionState, Method, Version},
    upgrade::{upgrade_candidates, ClientUpgradeFactory, FactoryHandle, FactoryRegistry, UpgradeError},
};

/// A request parsed from a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    /// The full request target, including the query string.
    pub url: String,
    /// The request target without the query string.
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub version: Version,
    /// Header fields, excluding `Cookie`.
    pub headers: Headers,
    pub cookies: BTreeMap<String, String>,
    pub body: Bytes,
    pub connection: ConnectionState,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::Get,
            url: String::new(),
            path: String::new(),
            query: BTreeMap::new(),
            version: Version::default(),
            headers: Headers::new(),
            cookies: BTreeMap::new(),
            body: Bytes::new(),
            connection: ConnectionState::Default,
        }
    }
}

impl Request {
    /// Get a header value, or an empty string if it's missing.
    pub fn header(&self, field: &str) -> &str {
        self.headers.get(field)
    }

    /// Get a cookie value, or an empty string if it's missing.
    pub fn cookie(&self, name: &str) -> &str {
        self.cookies.get(name).map(String::as_str).unwrap_or("")
    }

    /// Get a query value, or an empty string if it's missing.
    pub fn query(&self, key: &str) -> &str {
        self.query.get(key).map(String::as_str).unwrap_or("")
    }

    /// Returns true if the request asks to switch protocols.
    pub fn is_upgrade(&self) -> bool {
        ci_contains(self.headers.get("connection"), "upgrade") && self.headers.contains("upgrade")
    }
}

/// Builder of a request sent by a client.
pub struct ClientRequest {
    pub method: Method,
    pub url: String,
    pub version: Version,
    pub headers: Headers,
    pub cookies: BTreeMap<String, String>,
    pub body: Bytes,
    pub(crate) upgrade: Option<FactoryHandle<dyn ClientUpgradeFactory>>,
}

impl ClientRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            version: Version::HTTP_1_1,
            headers: Headers::new(),
            cookies: BTreeMap::new(),
            body: Bytes::new(),
            upgrade: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let mut request = Self::new(Method::Post, url);
        request.body = body.into();
        request
    }

    /// Set a header, replacing any previous value.
    ///
    /// An empty value removes the field.
    pub fn set(&mut self, field: &str, value: &str) -> &mut Self {
        if value.is_empty() {
            self.headers.remove(field);
        } else {
            self.headers.replace(field, value);
        }

        self
    }

    /// Append a value to a header, joining with `,`.
    pub fn append(&mut self, field: &str, value: &str) -> &mut Self {
        self.headers.insert_merged(field, value);
        self
    }

    pub fn cookie(&mut self, name: &str, value: &str) -> &mut Self {
        self.cookies.insert(name.to_string(), value.to_string());
        self
    }

    /// Request switching to `protocol` once this request is answered.
    ///
    /// The factory for the protocol is resolved from `factories`, and gets to prepare the request
    /// headers.
    pub fn upgrade(
        &mut self,
        factories: &FactoryRegistry<dyn ClientUpgradeFactory>,
        protocol: &str,
    ) -> Result<(), UpgradeError> {
        let handle = upgrade_candidates(protocol)
            .iter()
            .find_map(|name| factories.resolve(name))
            .ok_or_else(|| UpgradeError::UnknownProtocol(protocol.to_string()))?;

        self.set("Connection", "Upgrade");
        self.set("Upgrade", handle.name());
        handle.prepare(self);

        self.upgrade = Some(handle);
        Ok(())
    }

    /// The name of the protocol this request asks to upgrade to, if any.
    pub fn upgrade_protocol(&self) -> Option<&str> {
        self.upgrade.as_ref().map(|handle| handle.name())
    }

    /// Serialize the request line, headers, and body.
    pub fn to_bytes(&self) -> Bytes {
        let mut data = BytesMut::new();

        data.put(format!("{} {} {}\r\n", self.method, self.url, self.version).as_bytes());

        for (field, value) in self.headers.iter() {
            if field.eq_ignore_ascii_case("content-length") {
                continue;
            }
            data.put(format!("{}: {}\r\n", field, value).as_bytes());
        }

        if !self.cookies.is_empty() {
            let cookies = self
                .cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; ");
            data.put(format!("Cookie: {}\r\n", cookies).as_bytes());
        }

        // Requests without a length are read as having no body
        if !self.body.is_empty() || matches!(self.method, Method::Post | Method::Put) {
            data.put(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }

        data.put(&b"\r\n"[..]);
        data.put(self.body.clone());

        data.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_request() {
        let mut request = ClientRequest::post("/submit", "hello");
        request.set("Host", "localhost").cookie("session", "abc");

        let data = request.to_bytes();
        assert_eq!(
            &data[..],
            &b"POST /submit HTTP/1.1\r\nHost: localhost\r\nCookie: session=abc\r\n\
               Content-Length: 5\r\n\r\nhello"[..]
        );
    }

    #[test]
    fn missing_values_are_empty() {
        let request = Request::default();

        assert_eq!(request.header("host"), "");
        assert_eq!(request.cookie("session"), "");
        assert_eq!(request.query("page"), "");
        assert!(!request.is_upgrade());
    }
}
