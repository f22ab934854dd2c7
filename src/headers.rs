//! Request-line and header-block parsing glue.
//!
//! Header bytes are treated as opaque Latin-1: every byte value maps to the
//! `char` with the same code point, and nothing here validates UTF-8.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::Parse;

/// More headers than this is treated as a malformed request.
pub(crate) const MAX_HEADERS: usize = 100;

/// A parsed request line plus its header block.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: String,
    pub(crate) uri: String,
    pub(crate) version: String,
    pub(crate) headers: HeaderMap,
}

/// Parses the bytes of a complete request head (request line through the
/// blank line, delimiters included).
///
/// The request line must split on single ASCII spaces into exactly three
/// tokens, and the version token must begin with `HTTP/`.
pub(crate) fn parse_request_head(data: &Bytes) -> crate::Result<RequestHead> {
    let eol = memchr::memmem::find(data, b"\r\n").ok_or(Parse::RequestLine)?;
    let start_line = latin1(&data[..eol]);

    let tokens: Vec<&str> = start_line.split(' ').collect();
    if tokens.len() != 3 {
        return Err(Parse::RequestLine.into());
    }
    let (method, uri, version) = (tokens[0], tokens[1], tokens[2]);
    if !version.starts_with("HTTP/") {
        return Err(Parse::Version.into());
    }

    let headers = parse_header_block(&data[eol + 2..])?;
    Ok(RequestHead {
        method: method.to_string(),
        uri: uri.to_string(),
        version: version.to_string(),
        headers,
    })
}

/// Parses a header block (terminated by a blank line) into a
/// case-insensitive multimap. Repeated names accumulate.
pub(crate) fn parse_header_block(data: &[u8]) -> crate::Result<HeaderMap> {
    let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let raw = match httparse::parse_headers(data, &mut parsed) {
        Ok(httparse::Status::Complete((_, raw))) => raw,
        Ok(httparse::Status::Partial) => return Err(Parse::Header.into()),
        Err(err) => return Err(Parse::from(err).into()),
    };

    let mut headers = HeaderMap::with_capacity(raw.len());
    for header in raw {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(Parse::from)?;
        let value = HeaderValue::from_bytes(header.value).map_err(Parse::from)?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Decodes bytes as Latin-1, byte-for-byte.
pub(crate) fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Returns the first value of `name` decoded as Latin-1.
pub(crate) fn value_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).map(|value| latin1(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &[u8]) -> crate::Result<RequestHead> {
        parse_request_head(&Bytes::copy_from_slice(raw))
    }

    #[test]
    fn parses_simple_head() {
        let head = head(b"GET /index HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.uri, "/index");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(value_string(&head.headers, "host").unwrap(), "example.com");
        // names are case-insensitive
        assert_eq!(value_string(&head.headers, "HOST").unwrap(), "example.com");
    }

    #[test]
    fn parses_head_without_headers() {
        let head = head(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(head.version, "HTTP/1.0");
        assert!(head.headers.is_empty());
    }

    #[test]
    fn keeps_repeated_headers() {
        let head = head(b"GET / HTTP/1.1\r\nX-Tag: a\r\nX-Tag: b\r\n\r\n").unwrap();
        let values: Vec<_> = head
            .headers
            .get_all("x-tag")
            .iter()
            .map(|v| latin1(v.as_bytes()))
            .collect();
        assert_eq!(values, ["a", "b"]);
    }

    #[test]
    fn rejects_short_request_line() {
        let err = head(b"GET /index\r\n\r\n").unwrap_err();
        assert!(err.is_parse());
        assert_eq!(err.to_string(), "malformed HTTP request line");
    }

    #[test]
    fn rejects_long_request_line() {
        let err = head(b"GET /index HTTP/1.1 extra\r\n\r\n").unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn doubled_space_is_malformed() {
        // splitting on single spaces yields an empty token
        assert!(head(b"GET  /index HTTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn rejects_bad_version_prefix() {
        let err = head(b"GET /index SPDY/3\r\n\r\n").unwrap_err();
        assert_eq!(err.to_string(), "malformed HTTP version in request line");
    }

    #[test]
    fn latin1_preserves_high_bytes() {
        let head = head(b"GET / HTTP/1.1\r\nX-Name: caf\xe9\r\n\r\n").unwrap();
        assert_eq!(value_string(&head.headers, "x-name").unwrap(), "caf\u{e9}");
    }
}
