//! A single HTTP request.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::HeaderMap;
use http::Uri;

use crate::form;
use crate::headers;
use crate::server::Connection;

/// One file received in a `multipart/form-data` upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    /// The client-supplied file name.
    pub filename: String,
    /// The part's Content-Type header. Client-supplied and easily forged,
    /// so not to be trusted outright.
    pub content_type: String,
    /// The raw file contents.
    pub body: Bytes,
}

/// Construction arguments for a [`Request`].
///
/// All fields have usable defaults except `method` and `uri`; populate the
/// rest as needed and hand the whole thing to [`Request::new`].
pub struct RequestInit {
    /// HTTP request method, e.g. "GET" or "POST".
    pub method: String,
    /// The requested URI.
    pub uri: String,
    /// HTTP version from the request line, e.g. "HTTP/1.1".
    pub version: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body, if any.
    pub body: Bytes,
    /// IP address the request arrived from.
    pub remote_ip: String,
    /// Explicit protocol override; when `None` it is derived from the
    /// connection ("https" for TLS streams, "http" otherwise).
    pub protocol: Option<String>,
    /// Explicit host override; when `None` the Host header is consulted,
    /// falling back to "127.0.0.1".
    pub host: Option<String>,
    /// Uploaded files.
    pub files: HashMap<String, Vec<UploadedFile>>,
    /// The connection carrying this request.
    pub connection: Option<Connection>,
}

impl Default for RequestInit {
    fn default() -> RequestInit {
        RequestInit {
            method: String::new(),
            uri: String::new(),
            version: "HTTP/1.0".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_ip: String::new(),
            protocol: None,
            host: None,
            files: HashMap::new(),
            connection: None,
        }
    }
}

impl fmt::Debug for RequestInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestInit")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("version", &self.version)
            .finish()
    }
}

/// A single HTTP request.
///
/// Handlers receive the request by value once its head (and body, if any)
/// has been parsed; from that point it is read-only. Responses are produced
/// by calling [`write`](Request::write) with raw HTTP bytes and then
/// [`finish`](Request::finish).
pub struct Request {
    /// HTTP request method, e.g. "GET" or "POST".
    pub method: String,
    /// The requested URI.
    pub uri: String,
    /// HTTP version from the request line, e.g. "HTTP/1.1".
    pub version: String,
    /// Request headers: a case-insensitive multimap.
    pub headers: HeaderMap,
    /// Request body (empty when the request carried none).
    pub body: Bytes,
    /// Client IP address. With `xheaders` enabled on the server this is the
    /// address reported by `X-Real-Ip`/`X-Forwarded-For` when present.
    pub remote_ip: String,
    /// "http" or "https". With `xheaders` enabled, `X-Scheme`/
    /// `X-Forwarded-Proto` are honored (normalized to "http" when invalid).
    pub protocol: String,
    /// The requested hostname, usually from the Host header.
    pub host: String,
    /// The path portion of `uri`.
    pub path: String,
    /// The query portion of `uri`.
    pub query: String,
    /// Query and form arguments: name to one or more non-empty values.
    pub arguments: HashMap<String, Vec<String>>,
    /// Files uploaded via `multipart/form-data`, by field name.
    pub files: HashMap<String, Vec<UploadedFile>>,
    /// The connection this request arrived on. Requests on a keep-alive
    /// connection share it sequentially.
    pub connection: Option<Connection>,
    start_time: Instant,
    finish_time: Option<Instant>,
}

impl Request {
    /// Builds a request, deriving `remote_ip`, `protocol`, `host`, `path`,
    /// `query`, and the query arguments.
    pub fn new(init: RequestInit) -> Request {
        let RequestInit {
            method,
            uri,
            version,
            headers,
            body,
            remote_ip,
            protocol,
            host,
            files,
            connection,
        } = init;

        let xheaders = connection.as_ref().map_or(false, Connection::xheaders);
        let (remote_ip, protocol) = if xheaders {
            // Squid uses X-Forwarded-For, others use X-Real-Ip.
            let remote_ip = headers::value_string(&headers, "x-real-ip")
                .or_else(|| headers::value_string(&headers, "x-forwarded-for"))
                .unwrap_or(remote_ip);
            // AWS uses X-Forwarded-Proto.
            let protocol = headers::value_string(&headers, "x-scheme")
                .or_else(|| headers::value_string(&headers, "x-forwarded-proto"))
                .or(protocol);
            let protocol = match protocol.as_deref() {
                Some("http") => "http".to_string(),
                Some("https") => "https".to_string(),
                _ => "http".to_string(),
            };
            (remote_ip, protocol)
        } else {
            let protocol = match protocol {
                Some(protocol) => protocol,
                None if connection.as_ref().map_or(false, Connection::is_tls) => {
                    "https".to_string()
                }
                None => "http".to_string(),
            };
            (remote_ip, protocol)
        };

        let host = host
            .or_else(|| headers::value_string(&headers, "host"))
            .unwrap_or_else(|| "127.0.0.1".to_string());

        let (path, query) = split_uri(&uri);
        let arguments = form::parse_qs(query.as_bytes());

        Request {
            method,
            uri,
            version,
            headers,
            body,
            remote_ip,
            protocol,
            host,
            path,
            query,
            arguments,
            files,
            connection,
            start_time: Instant::now(),
            finish_time: None,
        }
    }

    /// Returns true if this request supports HTTP/1.1 semantics.
    pub fn supports_http_1_1(&self) -> bool {
        self.version == "HTTP/1.1"
    }

    /// Writes a chunk of response bytes to the connection.
    pub fn write(&self, chunk: impl Into<Bytes>) {
        let connection = self
            .connection
            .as_ref()
            .expect("request is not attached to a connection");
        connection.write(chunk.into());
    }

    /// Finishes this request on the open connection.
    pub fn finish(&mut self) {
        let connection = self
            .connection
            .as_ref()
            .expect("request is not attached to a connection");
        connection.finish();
        self.finish_time = Some(Instant::now());
    }

    /// Reconstructs the full URL for this request.
    pub fn full_url(&self) -> String {
        format!("{}://{}{}", self.protocol, self.host, self.uri)
    }

    /// How long this request has been (or was) executing: a running value
    /// until [`finish`](Request::finish), fixed afterwards.
    pub fn request_time(&self) -> Duration {
        match self.finish_time {
            None => self.start_time.elapsed(),
            Some(finish_time) => finish_time - self.start_time,
        }
    }

    /// The client's DER-encoded TLS certificate, if any.
    ///
    /// Client certificates only arrive when the server's TLS options
    /// request them; on plain connections, or when the handshake produced
    /// no certificate, this is `None`.
    pub fn get_ssl_certificate(&self) -> Option<Bytes> {
        self.connection
            .as_ref()
            .and_then(Connection::peer_certificate)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("version", &self.version)
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("remote_ip", &self.remote_ip)
            .field("body", &self.body)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Splits a request URI into path and query, dropping any fragment.
fn split_uri(uri: &str) -> (String, String) {
    match uri.parse::<Uri>() {
        Ok(parsed) => (
            parsed.path().to_string(),
            parsed.query().unwrap_or("").to_string(),
        ),
        Err(_) => {
            // Not an RFC 3986 URI; degrade to a raw split so the handler
            // still sees something sensible.
            let uri = form::split_once(uri, '#').map_or(uri, |(rest, _)| rest);
            match form::split_once(uri, '?') {
                Some((path, query)) => (path.to_string(), query.to_string()),
                None => (uri.to_string(), String::new()),
            }
        }
    }
}
