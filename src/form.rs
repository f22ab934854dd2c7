//! Form-argument decoding: query strings, urlencoded bodies, and
//! `multipart/form-data`.

use std::collections::HashMap;

use bytes::Bytes;
use memchr::memmem;
use tracing::warn;

use crate::headers;
use crate::request::UploadedFile;

/// Decodes a form-encoded query string into an argument map.
///
/// Values decode with `+` as space and percent-escapes resolved. Pairs with
/// an empty value are dropped, and names never map to an empty list.
pub fn parse_qs(query: &[u8]) -> HashMap<String, Vec<String>> {
    let mut arguments = HashMap::new();
    add_form_arguments(query, &mut arguments);
    arguments
}

/// Decodes `form` as urlencoded pairs and merges them into `arguments`,
/// extending existing entries and dropping empty values.
pub fn add_form_arguments(form: &[u8], arguments: &mut HashMap<String, Vec<String>>) {
    for (name, value) in url::form_urlencoded::parse(form) {
        if value.is_empty() {
            continue;
        }
        arguments
            .entry(name.into_owned())
            .or_insert_with(Vec::new)
            .push(value.into_owned());
    }
}

/// Decodes a `multipart/form-data` body, filling `arguments` with plain
/// fields and `files` with uploads.
///
/// `boundary` is the value of the Content-Type `boundary` parameter (quotes
/// allowed). Parts that cannot be decoded are skipped with a warning; the
/// remainder of the body is still processed.
pub fn parse_multipart_form_data(
    boundary: &[u8],
    data: &[u8],
    arguments: &mut HashMap<String, Vec<String>>,
    files: &mut HashMap<String, Vec<UploadedFile>>,
) {
    // The boundary may be quoted per RFC 2046 5.1.1.
    let boundary = if boundary.len() >= 2 && boundary.starts_with(b"\"") && boundary.ends_with(b"\"")
    {
        &boundary[1..boundary.len() - 1]
    } else {
        boundary
    };

    // The final boundary is "--boundary--", possibly with a trailing CRLF.
    let footer_length = if data.ends_with(b"\r\n") {
        boundary.len() + 6
    } else {
        boundary.len() + 4
    };
    if data.len() < footer_length {
        warn!("multipart/form-data missing final boundary");
        return;
    }
    let data = &data[..data.len() - footer_length];

    let separator = [&b"--"[..], boundary, &b"\r\n"[..]].concat();
    for part in split_on(data, &separator) {
        if part.is_empty() {
            continue;
        }
        let eoh = match memmem::find(part, b"\r\n\r\n") {
            Some(eoh) => eoh,
            None => {
                warn!("multipart/form-data missing headers");
                continue;
            }
        };
        let part_headers = match headers::parse_header_block(&part[..eoh + 4]) {
            Ok(part_headers) => part_headers,
            Err(_) => {
                warn!("invalid multipart/form-data part headers");
                continue;
            }
        };
        let disposition_header =
            headers::value_string(&part_headers, "content-disposition").unwrap_or_default();
        let (disposition, params) = parse_header_value(&disposition_header);
        if disposition != "form-data" || !part.ends_with(b"\r\n") {
            warn!("invalid multipart/form-data");
            continue;
        }
        let value = &part[eoh + 4..part.len() - 2];
        let name = match params.get("name") {
            Some(name) if !name.is_empty() => name.clone(),
            _ => {
                warn!("multipart/form-data value missing name");
                continue;
            }
        };
        match params.get("filename") {
            Some(filename) if !filename.is_empty() => {
                let content_type = headers::value_string(&part_headers, "content-type")
                    .unwrap_or_else(|| "application/unknown".to_string());
                files.entry(name).or_insert_with(Vec::new).push(UploadedFile {
                    filename: filename.clone(),
                    content_type,
                    body: Bytes::copy_from_slice(value),
                });
            }
            _ => {
                arguments
                    .entry(name)
                    .or_insert_with(Vec::new)
                    .push(String::from_utf8_lossy(value).into_owned());
            }
        }
    }
}

/// Splits a header value of the shape `token; key=value; key="value"` into
/// the leading token and its parameters.
fn parse_header_value(line: &str) -> (String, HashMap<String, String>) {
    let mut fields = line.split(';');
    let token = fields.next().unwrap_or("").trim().to_string();
    let mut params = HashMap::new();
    for field in fields {
        if let Some((key, value)) = split_once(field.trim(), '=') {
            let value = value.trim_matches('"');
            params.insert(key.to_string(), value.to_string());
        }
    }
    (token, params)
}

/// Splits `text` at the first `sep`, if any.
pub(crate) fn split_once(text: &str, sep: char) -> Option<(&str, &str)> {
    let index = text.find(sep)?;
    Some((&text[..index], &text[index + sep.len_utf8()..]))
}

/// Splits `data` on every occurrence of `separator`. The segment before the
/// first separator is included (it may be empty).
fn split_on<'d>(data: &'d [u8], separator: &[u8]) -> Vec<&'d [u8]> {
    let mut parts = Vec::new();
    let mut start = 0;
    for pos in memmem::find_iter(data, separator) {
        parts.push(&data[start..pos]);
        start = pos + separator.len();
    }
    parts.push(&data[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_qs_drops_empty_values() {
        let arguments = parse_qs(b"a=1&a=2&b=&c=3");
        assert_eq!(arguments.len(), 2);
        assert_eq!(arguments["a"], ["1", "2"]);
        assert_eq!(arguments["c"], ["3"]);
        assert!(!arguments.contains_key("b"));
    }

    #[test]
    fn parse_qs_decodes_escapes() {
        let arguments = parse_qs(b"q=a+b&r=%26");
        assert_eq!(arguments["q"], ["a b"]);
        assert_eq!(arguments["r"], ["&"]);
    }

    #[test]
    fn add_form_arguments_extends_existing() {
        let mut arguments = parse_qs(b"a=1");
        add_form_arguments(b"a=2&b=3&c=", &mut arguments);
        assert_eq!(arguments["a"], ["1", "2"]);
        assert_eq!(arguments["b"], ["3"]);
        assert!(!arguments.contains_key("c"));
    }

    fn multipart(boundary: &[u8], body: &[u8]) -> (
        HashMap<String, Vec<String>>,
        HashMap<String, Vec<UploadedFile>>,
    ) {
        let mut arguments = HashMap::new();
        let mut files = HashMap::new();
        parse_multipart_form_data(boundary, body, &mut arguments, &mut files);
        (arguments, files)
    }

    #[test]
    fn multipart_plain_field() {
        let body = b"--b123\r\n\
            Content-Disposition: form-data; name=\"title\"\r\n\
            \r\n\
            hello\r\n\
            --b123--\r\n";
        let (arguments, files) = multipart(b"b123", body);
        assert_eq!(arguments["title"], ["hello"]);
        assert!(files.is_empty());
    }

    #[test]
    fn multipart_file_field() {
        let body = b"--b123\r\n\
            Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            file bytes\r\n\
            --b123--\r\n";
        let (arguments, files) = multipart(b"b123", body);
        assert!(arguments.is_empty());
        let upload = &files["upload"][0];
        assert_eq!(upload.filename, "a.txt");
        assert_eq!(upload.content_type, "text/plain");
        assert_eq!(&upload.body[..], b"file bytes");
    }

    #[test]
    fn multipart_file_defaults_content_type() {
        let body = b"--b123\r\n\
            Content-Disposition: form-data; name=\"upload\"; filename=\"a.bin\"\r\n\
            \r\n\
            x\r\n\
            --b123--\r\n";
        let (_, files) = multipart(b"b123", body);
        assert_eq!(files["upload"][0].content_type, "application/unknown");
    }

    #[test]
    fn multipart_quoted_boundary() {
        let body = b"--b123\r\n\
            Content-Disposition: form-data; name=\"t\"\r\n\
            \r\n\
            v\r\n\
            --b123--\r\n";
        let (arguments, _) = multipart(b"\"b123\"", body);
        assert_eq!(arguments["t"], ["v"]);
    }

    #[test]
    fn multipart_without_trailing_newline() {
        let body = b"--b123\r\n\
            Content-Disposition: form-data; name=\"t\"\r\n\
            \r\n\
            v\r\n\
            --b123--";
        let (arguments, _) = multipart(b"b123", body);
        assert_eq!(arguments["t"], ["v"]);
    }

    #[test]
    fn multipart_skips_part_without_disposition() {
        let body = b"--b123\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            ignored\r\n\
            --b123\r\n\
            Content-Disposition: form-data; name=\"kept\"\r\n\
            \r\n\
            yes\r\n\
            --b123--\r\n";
        let (arguments, _) = multipart(b"b123", body);
        assert_eq!(arguments.len(), 1);
        assert_eq!(arguments["kept"], ["yes"]);
    }

    #[test]
    fn multipart_garbage_is_ignored() {
        let (arguments, files) = multipart(b"b123", b"bogus");
        assert!(arguments.is_empty());
        assert!(files.is_empty());
    }
}
