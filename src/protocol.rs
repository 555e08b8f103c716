//! Wire Protocol
//!
//! Header names, argument encodings per call kind, and the form and query
//! codecs used by `get`/`loader` and `post`/`action` calls.

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::form_urlencoded;

use crate::api::ProtocolKind;
use crate::body::Body;
use crate::error::DecodeError;

pub const REQUEST_TYPE_HEADER: &str = "x-thaler-request-type";
pub const INSTANCE_HEADER: &str = "x-thaler-instance";
pub const FUNCTION_ID_HEADER: &str = "x-thaler-id";

pub const CHUNKED_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
pub const URLENCODED_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

// ═══════════════════════════════════════════════════════════════════════════════
// HEADERS
// ═══════════════════════════════════════════════════════════════════════════════

/// The identity headers carried by a request or response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolHeaders {
    /// Raw header value; may name an unknown kind.
    pub request_type: Option<String>,
    pub instance: Option<String>,
    pub function_id: Option<String>,
}

impl ProtocolHeaders {
    pub fn new(kind: ProtocolKind, instance: Option<String>, function_id: &str) -> Self {
        ProtocolHeaders {
            request_type: Some(kind.as_str().to_string()),
            instance,
            function_id: Some(function_id.to_string()),
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        ProtocolHeaders {
            request_type: read(REQUEST_TYPE_HEADER),
            instance: read(INSTANCE_HEADER),
            function_id: read(FUNCTION_ID_HEADER),
        }
    }

    pub fn kind(&self) -> Option<ProtocolKind> {
        self.request_type.as_deref().and_then(ProtocolKind::parse)
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        let fields = [
            (REQUEST_TYPE_HEADER, &self.request_type),
            (INSTANCE_HEADER, &self.instance),
            (FUNCTION_ID_HEADER, &self.function_id),
        ];
        for (name, value) in fields {
            if let Some(value) = value.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
                headers.insert(name, value);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECORDS
// ═══════════════════════════════════════════════════════════════════════════════

/// A field that appeared once or several times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn push(self, value: T) -> Self {
        match self {
            OneOrMany::One(first) => OneOrMany::Many(vec![first, value]),
            OneOrMany::Many(mut values) => {
                values.push(value);
                OneOrMany::Many(values)
            }
        }
    }

    pub fn first(&self) -> Option<&T> {
        match self {
            OneOrMany::One(value) => Some(value),
            OneOrMany::Many(values) => values.first(),
        }
    }

    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(value) => std::slice::from_ref(value),
            OneOrMany::Many(values) => values,
        }
    }
}

impl<T> From<T> for OneOrMany<T> {
    fn from(value: T) -> Self {
        OneOrMany::One(value)
    }
}

fn append<T>(record: &mut BTreeMap<String, OneOrMany<T>>, key: String, value: T) {
    let field = match record.remove(&key) {
        Some(existing) => existing.push(value),
        None => OneOrMany::One(value),
    };
    record.insert(key, field);
}

/// Query record for `get`/`loader` calls. Keys are kept sorted.
pub type QueryParams = BTreeMap<String, OneOrMany<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue {
    Text(String),
    File {
        name: Option<String>,
        content_type: Option<String>,
        bytes: Bytes,
    },
}

impl FormValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FormValue::Text(text) => Some(text),
            FormValue::File { .. } => None,
        }
    }
}

impl From<&str> for FormValue {
    fn from(text: &str) -> Self {
        FormValue::Text(text.to_string())
    }
}

/// Form record for `post`/`action` calls.
pub type FormData = BTreeMap<String, OneOrMany<FormValue>>;

// ═══════════════════════════════════════════════════════════════════════════════
// QUERY STRINGS
// ═══════════════════════════════════════════════════════════════════════════════

pub fn encode_query(params: &QueryParams) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, values) in params {
        for value in values.as_slice() {
            serializer.append_pair(key, value);
        }
    }
    serializer.finish()
}

pub fn decode_query(query: &str) -> QueryParams {
    let mut params = QueryParams::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        append(&mut params, key.into_owned(), value.into_owned());
    }
    params
}

// ═══════════════════════════════════════════════════════════════════════════════
// MULTIPART FORMS
// ═══════════════════════════════════════════════════════════════════════════════

fn quote(value: &str) -> String {
    value.replace('"', "%22").replace('\r', "%0D").replace('\n', "%0A")
}

fn unquote(value: &str) -> String {
    value.replace("%22", "\"").replace("%0D", "\r").replace("%0A", "\n")
}

fn write_part(out: &mut BytesMut, boundary: &str, key: &str, value: &FormValue) {
    out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    match value {
        FormValue::Text(text) => {
            out.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", quote(key)).as_bytes(),
            );
            out.extend_from_slice(text.as_bytes());
        }
        FormValue::File {
            name,
            content_type,
            bytes,
        } => {
            out.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    quote(key),
                    quote(name.as_deref().unwrap_or("blob"))
                )
                .as_bytes(),
            );
            out.extend_from_slice(
                format!(
                    "Content-Type: {}\r\n\r\n",
                    content_type.as_deref().unwrap_or("application/octet-stream")
                )
                .as_bytes(),
            );
            out.extend_from_slice(bytes);
        }
    }
    out.extend_from_slice(b"\r\n");
}

/// Encodes `form` as `multipart/form-data`. Returns the content type (with
/// its boundary) and the body. The boundary is derived from the content so
/// it cannot occur inside it.
pub fn encode_multipart(form: &FormData) -> (String, Bytes) {
    let mut hasher = Sha256::new();
    for (key, values) in form {
        hasher.update(key.as_bytes());
        for value in values.as_slice() {
            match value {
                FormValue::Text(text) => hasher.update(text.as_bytes()),
                FormValue::File { bytes, .. } => hasher.update(bytes),
            }
        }
    }
    let digest = hasher.finalize();
    let boundary = format!(
        "----thaler{}",
        digest[..12].iter().map(|b| format!("{:02x}", b)).collect::<String>()
    );

    let mut out = BytesMut::new();
    for (key, values) in form {
        for value in values.as_slice() {
            write_part(&mut out, &boundary, key, value);
        }
    }
    out.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    (
        format!("multipart/form-data; boundary={}", boundary),
        out.freeze(),
    )
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|i| i + from)
}

fn boundary_of(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.trim().split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

/// Value of a `name="..."` parameter in a Content-Disposition header.
fn disposition_param(disposition: &str, param: &str) -> Option<String> {
    disposition.split(';').skip(1).find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        (name.trim() == param).then(|| unquote(value.trim().trim_matches('"')))
    })
}

pub fn decode_multipart(content_type: &str, body: &[u8]) -> Result<FormData, DecodeError> {
    let boundary =
        boundary_of(content_type).ok_or_else(|| DecodeError::Form("missing boundary".to_string()))?;
    let delimiter = format!("--{}", boundary).into_bytes();
    let separator = format!("\r\n--{}", boundary).into_bytes();

    let mut form = FormData::new();
    let mut position = find(body, &delimiter, 0)
        .ok_or_else(|| DecodeError::Form("missing opening boundary".to_string()))?
        + delimiter.len();

    loop {
        if body[position..].starts_with(b"--") {
            return Ok(form);
        }
        if !body[position..].starts_with(b"\r\n") {
            return Err(DecodeError::Form("malformed boundary line".to_string()));
        }
        let part_start = position + 2;
        let part_end = find(body, &separator, part_start)
            .ok_or_else(|| DecodeError::Form("unterminated part".to_string()))?;
        let part = &body[part_start..part_end];
        position = part_end + separator.len();

        let header_end = find(part, b"\r\n\r\n", 0)
            .ok_or_else(|| DecodeError::Form("part without headers".to_string()))?;
        let headers = std::str::from_utf8(&part[..header_end])
            .map_err(|e| DecodeError::Form(e.to_string()))?;
        let content = &part[header_end + 4..];

        let mut disposition = None;
        let mut part_type = None;
        for line in headers.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case("content-disposition") {
                disposition = Some(value.trim().to_string());
            } else if name.trim().eq_ignore_ascii_case("content-type") {
                part_type = Some(value.trim().to_string());
            }
        }
        let disposition =
            disposition.ok_or_else(|| DecodeError::Form("part without disposition".to_string()))?;
        let name = disposition_param(&disposition, "name")
            .ok_or_else(|| DecodeError::Form("part without a name".to_string()))?;

        let value = match disposition_param(&disposition, "filename") {
            Some(file_name) => FormValue::File {
                name: Some(file_name),
                content_type: part_type,
                bytes: Bytes::copy_from_slice(content),
            },
            None => FormValue::Text(String::from_utf8_lossy(content).into_owned()),
        };
        append(&mut form, name, value);
    }
}

/// Reads a `post`/`action` body, multipart or url-encoded.
pub async fn decode_form(headers: &HeaderMap, body: Body) -> Result<FormData, DecodeError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(URLENCODED_CONTENT_TYPE)
        .to_string();
    let bytes = body
        .collect()
        .await
        .map_err(|e| DecodeError::Stream(e.to_string()))?;

    if content_type.starts_with("multipart/form-data") {
        return decode_multipart(&content_type, &bytes);
    }
    let mut form = FormData::new();
    for (key, value) in form_urlencoded::parse(&bytes) {
        append(&mut form, key.into_owned(), FormValue::Text(value.into_owned()));
    }
    Ok(form)
}
