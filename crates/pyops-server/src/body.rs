//! Request body decoding.
//!
//! The browser extension posts JSON, the web UI posts urlencoded or multipart
//! forms. All three are turned into one JSON object so handlers can
//! deserialize a single typed request struct regardless of the encoding.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::io::Read;
use thiserror::Error;
use tracing::debug;

/// Form field that carries an uploaded requirements file.
const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request body exceeds {0} bytes")]
    TooLarge(usize),
    #[error("unsupported content type: {0}")]
    Unsupported(String),
    #[error("malformed request body: {0}")]
    Malformed(String),
    #[error("failed to read request body: {0}")]
    Io(#[from] std::io::Error),
}

/// An uploaded file part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub filename: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct Payload {
    pub fields: Map<String, Value>,
    pub file: Option<Upload>,
}

impl Payload {
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<(T, Option<Upload>), BodyError> {
        let typed = serde_json::from_value(Value::Object(self.fields))
            .map_err(|e| BodyError::Malformed(e.to_string()))?;
        Ok((typed, self.file))
    }

    fn push_field(&mut self, key: &str, value: String) {
        match self.fields.get_mut(key) {
            None => {
                self.fields.insert(key.to_owned(), Value::String(value));
            }
            Some(Value::Array(items)) => items.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
        }
    }
}

/// A list given either as a JSON array or as one whitespace-separated string.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum WordList {
    Words(Vec<String>),
    Line(String),
}

impl Default for WordList {
    fn default() -> Self {
        Self::Words(Vec::new())
    }
}

impl WordList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::Words(words) => words
                .into_iter()
                .map(|w| w.trim().to_owned())
                .filter(|w| !w.is_empty())
                .collect(),
            Self::Line(line) => line.split_whitespace().map(String::from).collect(),
        }
    }
}

pub fn read_payload(req: &mut tiny_http::Request, limit: usize) -> Result<Payload, BodyError> {
    if req.body_length().is_some_and(|len| len > limit) {
        return Err(BodyError::TooLarge(limit));
    }
    let content_type = req
        .headers()
        .iter()
        .find(|h| h.field.equiv("Content-Type"))
        .map(|h| h.value.as_str().to_owned());

    let mut body = Vec::new();
    req.as_reader()
        .take(u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1))
        .read_to_end(&mut body)?;
    if body.len() > limit {
        return Err(BodyError::TooLarge(limit));
    }
    decode(content_type.as_deref(), &body)
}

pub fn decode(content_type: Option<&str>, body: &[u8]) -> Result<Payload, BodyError> {
    let media = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|m| m.trim().to_ascii_lowercase())
        .unwrap_or_default();

    match media.as_str() {
        "application/json" => decode_json(body),
        "application/x-www-form-urlencoded" => Ok(decode_urlencoded(body)),
        "multipart/form-data" => {
            let boundary = content_type
                .and_then(|ct| header_param(ct, "boundary"))
                .ok_or_else(|| BodyError::Malformed("multipart boundary missing".to_owned()))?;
            decode_multipart(&boundary, body)
        }
        _ if body.iter().all(u8::is_ascii_whitespace) => Ok(Payload::default()),
        // Extensions sometimes omit the header on JSON bodies.
        "" | "text/plain" if body.first() == Some(&b'{') => decode_json(body),
        other => Err(BodyError::Unsupported(other.to_owned())),
    }
}

fn decode_json(body: &[u8]) -> Result<Payload, BodyError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Payload::default());
    }
    match serde_json::from_slice(body) {
        Ok(Value::Object(fields)) => Ok(Payload { fields, file: None }),
        Ok(_) => Err(BodyError::Malformed("expected a JSON object".to_owned())),
        Err(e) => Err(BodyError::Malformed(e.to_string())),
    }
}

fn decode_urlencoded(body: &[u8]) -> Payload {
    let mut payload = Payload::default();
    for (key, value) in form_urlencoded::parse(body) {
        payload.push_field(&key, value.into_owned());
    }
    payload
}

fn decode_multipart(boundary: &str, body: &[u8]) -> Result<Payload, BodyError> {
    let malformed = |what: &str| BodyError::Malformed(format!("multipart: {what}"));
    let opening = format!("--{boundary}");
    let separator = format!("\r\n--{boundary}");

    let start = find(body, opening.as_bytes()).ok_or_else(|| malformed("no opening boundary"))?;
    let mut rest = &body[start + opening.len()..];
    let mut payload = Payload::default();

    loop {
        if rest.starts_with(b"--") {
            break;
        }
        rest = rest
            .strip_prefix(b"\r\n")
            .ok_or_else(|| malformed("boundary not followed by CRLF"))?;
        let header_end = find(rest, b"\r\n\r\n").ok_or_else(|| malformed("unterminated part headers"))?;
        let headers = std::str::from_utf8(&rest[..header_end])
            .map_err(|_| malformed("part headers are not UTF-8"))?;
        let after = &rest[header_end + 4..];
        let end = find(after, separator.as_bytes()).ok_or_else(|| malformed("unterminated part"))?;
        let content = &after[..end];
        rest = &after[end + separator.len()..];

        let disposition = headers
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("content-disposition")
                    .then(|| value.trim())
            })
            .ok_or_else(|| malformed("part without Content-Disposition"))?;
        let Some(name) = header_param(disposition, "name") else {
            continue;
        };

        match header_param(disposition, "filename") {
            // Browsers send an empty, nameless file part when nothing was chosen.
            Some(filename) if filename.is_empty() && content.is_empty() => {}
            Some(filename) if name != UPLOAD_FIELD => {
                debug!("ignoring file part {name:?} ({filename:?})");
            }
            Some(filename) => {
                if payload.file.is_none() {
                    payload.file = Some(Upload {
                        filename,
                        data: content.to_vec(),
                    });
                }
            }
            None => {
                payload.push_field(&name, String::from_utf8_lossy(content).into_owned());
            }
        }
    }
    Ok(payload)
}

/// Value of `key=value` / `key="value"` inside a `;`-separated header value.
fn header_param(header: &str, key: &str) -> Option<String> {
    header.split(';').skip(1).find_map(|part| {
        let (k, v) = part.split_once('=')?;
        if !k.trim().eq_ignore_ascii_case(key) {
            return None;
        }
        let v = v.trim();
        let v = v
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(v);
        Some(v.to_owned())
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
