use std::{collections::BTreeMap, fs, io::ErrorKind, path::Path, rc::Rc, time::SystemTime};

use anyhow::{bail, Error};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{event, Level};
use wharf::message::Sender;

use crate::{
    cookie::{format_set_cookie, Cookie},
    headers::{ci_contains, Headers},
    message::{closes_after, ConnectionState, Version},
    mime,
    status::reason_or_unknown,
    upgrade::{ServerUpgradeRegistry, UpgradeError, Upgraded},
    Request,
};

/// Format a time as an HTTP-date, like `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Output of a `Response` to its connection.
pub(crate) enum ResponseAction {
    Data(Bytes),
    /// The response has been fully sent.
    Completed { connection: ConnectionState },
    /// The response can't be completed, the connection has to be dropped.
    Terminate,
    Upgrade(Upgraded),
}

#[derive(Error, Debug)]
pub enum SendFileError {
    #[error("file not found")]
    NotFound,
    #[error("not a regular readable file")]
    Forbidden,
    #[error("failed to send file")]
    Send(#[from] Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Body delimited by `Content-Length`, or by closing the connection if unknown.
    Identity(Option<usize>),
    Chunked,
}

/// Builder of the response to a single request.
///
/// The header block is written once, on the first body data or completion. After that, sent
/// data is counted against `Content-Length`, completing the response when it's reached.
/// A response that's dropped before completing terminates its connection.
pub struct Response {
    actions: Sender<ResponseAction>,
    upgrades: Option<Rc<ServerUpgradeRegistry>>,
    version: Version,
    head_only: bool,

    status: u16,
    headers: Headers,
    cookies: BTreeMap<String, Cookie>,
    connection: ConnectionState,
    framing: Framing,

    header_sent: bool,
    content_sent: usize,
    completed: bool,
}

impl Response {
    pub(crate) fn new(
        actions: Sender<ResponseAction>,
        upgrades: Option<Rc<ServerUpgradeRegistry>>,
        request: &Request,
    ) -> Self {
        let mut response = Self {
            actions,
            upgrades,
            version: request.version.max(Version::HTTP_1_0),
            head_only: request.method == crate::Method::Head,

            status: 200,
            headers: Headers::new(),
            cookies: BTreeMap::new(),
            connection: ConnectionState::Default,
            framing: Framing::Identity(None),

            header_sent: false,
            content_sent: 0,
            completed: false,
        };

        // Tell the peer up front what happens to the connection after this response
        let closes = closes_after(request.version, request.connection, ConnectionState::Default);
        let connection = if closes { "close" } else { "keep-alive" };
        response.set("Connection", connection, true);

        response
    }

    pub fn status(&mut self, status: u16) -> &mut Self {
        self.status = status;
        self
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn header(&self, field: &str) -> &str {
        self.headers.get(field)
    }

    /// Set a header, if `overwrite` is false an existing value is kept.
    ///
    /// An empty value removes the field.
    pub fn set(&mut self, field: &str, value: &str, overwrite: bool) -> &mut Self {
        if value.is_empty() {
            self.headers.remove(field);
            return self;
        }

        if overwrite {
            self.headers.replace(field, value);
        } else if !self.headers.contains(field) {
            self.headers.append_raw(field, value);
        }

        let value = self.headers.get(field).to_string();
        if field.eq_ignore_ascii_case("connection") {
            if ci_contains(&value, "keep-alive") {
                self.connection = ConnectionState::Keep;
            } else if ci_contains(&value, "close") {
                self.connection = ConnectionState::Close;
            } else {
                self.connection = ConnectionState::Default;
            }
        } else if field.eq_ignore_ascii_case("content-length") {
            self.framing = Framing::Identity(value.trim().parse().ok());
            self.headers.remove("transfer-encoding");
        } else if field.eq_ignore_ascii_case("transfer-encoding") && ci_contains(&value, "chunked")
        {
            self.framing = Framing::Chunked;
            self.headers.remove("content-length");
        }

        self
    }

    /// Set all fields of `headers`.
    pub fn set_all(&mut self, headers: &Headers, overwrite: bool) -> &mut Self {
        for (field, value) in headers.iter() {
            self.set(field, value, overwrite);
        }
        self
    }

    /// Append a value to a field, joined with `, `.
    pub fn append(&mut self, field: &str, value: &str) -> &mut Self {
        let joined = match self.headers.find(field) {
            Some(existing) => format!("{}, {}", existing, value),
            None => value.to_string(),
        };

        self.set(field, &joined, true)
    }

    pub fn content_type(&mut self, mime: &str) -> &mut Self {
        self.set("Content-Type", mime, true)
    }

    pub fn location(&mut self, location: &str) -> &mut Self {
        self.set("Location", location, true)
    }

    /// Mark the body as a download, optionally with a file name.
    pub fn attachment(&mut self, file_name: Option<&str>) -> &mut Self {
        let value = match file_name {
            Some(name) => format!("attachment; filename=\"{}\"", name),
            None => "attachment".to_string(),
        };

        self.set("Content-Disposition", &value, true)
    }

    pub fn cookie(
        &mut self,
        name: &str,
        value: &str,
        options: BTreeMap<String, String>,
    ) -> &mut Self {
        let cookie = Cookie {
            value: value.to_string(),
            options,
        };
        self.cookies.insert(name.to_string(), cookie);
        self
    }

    /// Tell the peer to remove a cookie, by expiring it.
    pub fn clear_cookie(&mut self, name: &str, mut options: BTreeMap<String, String>) -> &mut Self {
        options.remove("Max-Age");
        options.insert(
            "Expires".to_string(),
            http_date(DateTime::<Utc>::from(SystemTime::UNIX_EPOCH)),
        );

        self.cookie(name, "", options)
    }

    /// Returns true once the full response has been handed to the connection.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Send a complete binary body.
    pub fn send(&mut self, body: impl Into<Bytes>) -> Result<(), Error> {
        let body = body.into();

        if !body.is_empty() {
            self.set("Content-Type", "application/octet-stream", false);
        }

        self.send_complete(body)
    }

    /// Send a complete text body.
    pub fn send_text(&mut self, body: &str) -> Result<(), Error> {
        if !body.is_empty() {
            self.set("Content-Type", "text/html; charset=utf-8", false);
        }

        self.send_complete(Bytes::copy_from_slice(body.as_bytes()))
    }

    /// Send the response without a body.
    pub fn end(&mut self) -> Result<(), Error> {
        self.send_complete(Bytes::new())
    }

    /// Send a status, with its reason phrase as body.
    pub fn send_status(&mut self, status: u16) -> Result<(), Error> {
        self.status(status);
        let body = format!("{}\r\n", reason_or_unknown(status));
        self.send_text(&body)
    }

    pub fn redirect(&mut self, status: u16, location: &str) -> Result<(), Error> {
        self.location(location);
        self.send_status(status)
    }

    /// Send a file as body, answering `404` or `403` if it can't be sent.
    pub fn send_file(&mut self, path: impl AsRef<Path>) -> Result<(), SendFileError> {
        let path = path.as_ref();

        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                self.send_status(404)?;
                return Err(SendFileError::NotFound);
            }
            Err(_) => {
                self.send_status(403)?;
                return Err(SendFileError::Forbidden);
            }
        };

        if !metadata.is_file() {
            self.send_status(403)?;
            return Err(SendFileError::Forbidden);
        }

        let data = match fs::read(path) {
            Ok(data) => data,
            Err(error) => {
                event!(Level::DEBUG, ?error, "failed to read file");
                self.send_status(403)?;
                return Err(SendFileError::Forbidden);
            }
        };

        self.set("Content-Type", mime::content_type(path), false);
        if let Ok(modified) = metadata.modified() {
            self.set("Last-Modified", &http_date(modified.into()), false);
        }

        self.send_complete(Bytes::from(data))?;
        Ok(())
    }

    /// Send part of a streamed body.
    ///
    /// Without a `Content-Length`, HTTP/1.1 peers get a chunked body, and older peers get a body
    /// that ends when the connection closes.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.completed {
            bail!("response already completed");
        }

        if !self.header_sent {
            if self.framing == Framing::Identity(None) {
                if self.version >= Version::HTTP_1_1 {
                    self.set("Transfer-Encoding", "chunked", true);
                } else {
                    self.set("Connection", "close", true);
                }
            }

            self.send_header()?;
        }

        if data.is_empty() {
            return Ok(());
        }

        match self.framing {
            Framing::Chunked => {
                let mut chunk = BytesMut::with_capacity(data.len() + 16);
                chunk.put(format!("{:x}\r\n", data.len()).as_bytes());
                chunk.put(data);
                chunk.put(&b"\r\n"[..]);
                self.dispatch(ResponseAction::Data(chunk.freeze()))?;
                self.content_sent += data.len();
            }
            Framing::Identity(_) => self.enqueue(Bytes::copy_from_slice(data))?,
        }

        Ok(())
    }

    /// Complete a streamed body.
    pub fn finish(&mut self) -> Result<(), Error> {
        if self.completed {
            return Ok(());
        }

        if !self.header_sent {
            return self.end();
        }

        match self.framing {
            Framing::Chunked => {
                self.dispatch(ResponseAction::Data(Bytes::from_static(b"0\r\n\r\n")))?;
                self.complete()
            }
            Framing::Identity(None) => self.complete(),
            Framing::Identity(Some(length)) if self.content_sent == length => self.complete(),
            Framing::Identity(Some(length)) => {
                self.terminate();
                bail!(
                    "response ended after {} of {} bytes",
                    self.content_sent,
                    length
                );
            }
        }
    }

    /// Switch the connection to the protocol requested by `request`.
    ///
    /// On failure the request is answered with an error status, and the connection closes.
    pub fn upgrade(&mut self, request: &Request) -> Result<(), UpgradeError> {
        let result = self.create_upgrade(request);

        match result {
            Ok(upgraded) => {
                event!(Level::DEBUG, protocol = %upgraded.protocol, "upgrading connection");

                let sent = self
                    .send_header()
                    .and_then(|_| self.dispatch(ResponseAction::Upgrade(upgraded)));
                if let Err(error) = sent {
                    event!(Level::DEBUG, ?error, "connection gone during upgrade");
                }
                self.completed = true;

                Ok(())
            }
            Err(error) => {
                event!(Level::DEBUG, %error, "upgrade failed");

                self.set("Connection", "close", true);
                if let Err(error) = self.send_status(error.status()) {
                    event!(Level::DEBUG, ?error, "failed to send upgrade failure");
                }

                Err(error)
            }
        }
    }

    fn create_upgrade(&mut self, request: &Request) -> Result<Upgraded, UpgradeError> {
        if !request.is_upgrade() {
            return Err(UpgradeError::NotRequested);
        }

        let upgrade = request.header("upgrade");
        let factory = self
            .upgrades
            .as_ref()
            .and_then(|upgrades| upgrades.select(upgrade))
            .ok_or_else(|| UpgradeError::UnknownProtocol(upgrade.to_string()))?;

        let context = factory.create(request, self)?;

        let upgraded = Upgraded {
            protocol: factory.name().to_string(),
            context,
            _user: factory.into_user(),
        };
        Ok(upgraded)
    }

    fn send_complete(&mut self, body: Bytes) -> Result<(), Error> {
        if self.completed || self.header_sent {
            bail!("response already started");
        }

        self.set("Content-Length", &body.len().to_string(), true);
        self.send_header()?;

        if self.head_only || body.is_empty() {
            return self.complete();
        }

        self.enqueue(body)
    }

    fn send_header(&mut self) -> Result<(), Error> {
        if self.header_sent {
            return Ok(());
        }
        self.header_sent = true;

        self.set("Cache-Control", "public, max-age=0", false);
        self.set("Accept-Ranges", "bytes", false);
        self.set("X-Powered-By", "wharf", false);

        let mut head = BytesMut::new();
        let line = format!(
            "{} {} {}\r\n",
            self.version,
            self.status,
            reason_or_unknown(self.status)
        );
        head.put(line.as_bytes());
        head.put(format!("Date: {}\r\n", http_date(Utc::now())).as_bytes());

        for (field, value) in self.headers.iter() {
            head.put(format!("{}: {}\r\n", field, value).as_bytes());
        }

        for (name, cookie) in &self.cookies {
            head.put(format!("Set-Cookie: {}\r\n", format_set_cookie(name, cookie)).as_bytes());
        }

        head.put(&b"\r\n"[..]);

        self.dispatch(ResponseAction::Data(head.freeze()))
    }

    /// Send body data, counting it against the declared length.
    fn enqueue(&mut self, data: Bytes) -> Result<(), Error> {
        self.content_sent += data.len();

        let Framing::Identity(Some(length)) = self.framing else {
            return self.dispatch(ResponseAction::Data(data));
        };

        if self.content_sent > length {
            self.terminate();
            bail!(
                "response body of {} bytes exceeds Content-Length {}",
                self.content_sent,
                length
            );
        }

        self.dispatch(ResponseAction::Data(data))?;

        if self.content_sent == length {
            self.complete()?;
        }

        Ok(())
    }

    fn complete(&mut self) -> Result<(), Error> {
        self.completed = true;

        self.dispatch(ResponseAction::Completed {
            connection: self.connection,
        })
    }

    fn terminate(&mut self) {
        self.completed = true;
        let _ = self.actions.send(ResponseAction::Terminate);
    }

    fn dispatch(&self, action: ResponseAction) -> Result<(), Error> {
        self.actions.send(action)?;
        Ok(())
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        event!(Level::WARN, status = self.status, "response dropped before completing");
        self.terminate();
    }
}

/// A response received by a client.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ClientResponse {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    /// Header fields, excluding `Set-Cookie`.
    pub headers: Headers,
    pub cookies: BTreeMap<String, Cookie>,
    pub body: Bytes,
    pub connection: ConnectionState,
}

impl ClientResponse {
    /// Get a header value, or an empty string if it's missing.
    pub fn header(&self, field: &str) -> &str {
        self.headers.get(field)
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.get(name)
    }
}
