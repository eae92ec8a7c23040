//! Wiki record codec.
//!
//! ```text
//! recordset := COUNT '#' record ('#' record)*
//! record    := objectId ':' attr (';' attr)* [';']
//! attr      := NAME '=' VALUE
//! ```
//!
//! Separators inside inline XML (`<...>`) are not split on, so a value
//! may carry `;`, `:` or `#` when wrapped in angle brackets.

use serde::Serialize;
use tracing::debug;

use crate::error::{WikiError, WikiResult};

/// One decoded wire record.
///
/// Attributes keep first-seen order; setting an existing name replaces its
/// value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WikiMessage {
    pub object_id: String,
    attrs: Vec<(String, String)>,
}

impl WikiMessage {
    pub fn new(object_id: &str) -> Self {
        Self {
            object_id: object_id.to_string(),
            attrs: Vec::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// The reported `STATE`, if present.
    pub fn status(&self) -> Option<&str> {
        self.get("STATE")
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

/// Split `input` on `sep`, ignoring separators inside `<...>`.
pub(crate) fn split_outside_xml(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            c if c == sep && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

/// Decode one `id:NAME=VALUE;...` record.
pub fn decode_record(record: &str) -> WikiResult<WikiMessage> {
    let record = record.trim();
    let (id, attrs) = record
        .split_once(':')
        .ok_or_else(|| WikiError::malformed(format!("record without object id: '{record}'")))?;
    let id = id.trim();
    if id.is_empty() {
        return Err(WikiError::malformed(format!("empty object id in '{record}'")));
    }

    let mut msg = WikiMessage::new(id);
    for token in split_outside_xml(attrs, ';') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.split_once('=') {
            Some((name, value)) => msg.set(name.trim(), value),
            None => debug!(object = %id, token, "skipping attribute without value"),
        }
    }
    Ok(msg)
}

/// Decode a `COUNT#record#record...` record set. The count prefix is
/// optional.
pub fn decode(buf: &str) -> WikiResult<Vec<WikiMessage>> {
    let buf = buf.trim();
    if buf.is_empty() {
        return Ok(Vec::new());
    }

    let mut pieces = split_outside_xml(buf, '#').into_iter();
    let mut expected = None;
    let mut first = pieces.next();
    if let Some(head) = first {
        if let Ok(count) = head.trim().parse::<usize>() {
            expected = Some(count);
            first = None;
        }
    }

    let mut messages = Vec::new();
    for piece in first.into_iter().chain(pieces) {
        if piece.trim().is_empty() {
            continue;
        }
        messages.push(decode_record(piece)?);
    }

    if let Some(count) = expected {
        if count != messages.len() {
            debug!(expected = count, decoded = messages.len(), "record count mismatch");
        }
    }
    Ok(messages)
}

pub fn encode_record(msg: &WikiMessage) -> String {
    let mut out = format!("{}:", msg.object_id);
    for (name, value) in msg.attrs() {
        out.push_str(name);
        out.push('=');
        out.push_str(value);
        out.push(';');
    }
    out
}

/// Encode a record set with its count prefix.
pub fn encode(msgs: &[WikiMessage]) -> String {
    let records: Vec<String> = msgs.iter().map(encode_record).collect();
    format!("{}#{}", msgs.len(), records.join("#"))
}
