use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};
use thiserror::Error;

/// Keys that are owned by the event envelope or stamped by the log server and
/// therefore never carried in [`WireEvent::fields`].
pub const RESERVED_KEYS: &[&str] = &["id", "seq", "action", "t", "e", "_id"];

/// Largest datagram the log server accepts.
pub const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

/// Longest `id`, `seq` or `action` value, in characters.
pub const MAX_ENVELOPE_CHARS: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    Spamcheck,
    Queued,
    Deferred,
    Accepted,
    Rejected,
    Deleted,
    Drop,
    Noqueue,
    Other(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Spamcheck => "SPAMCHECK",
            Self::Queued => "QUEUED",
            Self::Deferred => "DEFERRED",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
            Self::Deleted => "DELETED",
            Self::Drop => "DROP",
            Self::Noqueue => "NOQUEUE",
            Self::Other(raw) => raw,
        }
    }

    /// Actions that mark the point where a message-id becomes known for a
    /// queue id and should be written to the message-id index.
    pub fn indexes_message_id(&self) -> bool {
        matches!(self, Self::Drop | Self::Queued | Self::Noqueue)
    }

    /// Bootstrap-style contextual label used by the admin views.
    pub fn label(&self) -> Option<&'static str> {
        match self {
            Self::Spamcheck => Some("default"),
            Self::Queued => Some("primary"),
            Self::Deferred => Some("warning"),
            Self::Accepted => Some("success"),
            Self::Rejected | Self::Deleted | Self::Drop => Some("danger"),
            Self::Noqueue | Self::Other(_) => None,
        }
    }
}

impl FromStr for Action {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "SPAMCHECK" => Self::Spamcheck,
            "QUEUED" => Self::Queued,
            "DEFERRED" => Self::Deferred,
            "ACCEPTED" => Self::Accepted,
            "REJECTED" => Self::Rejected,
            "DELETED" => Self::Deleted,
            "DROP" => Self::Drop,
            "NOQUEUE" => Self::Noqueue,
            other => Self::Other(other.to_string()),
        })
    }
}

impl fmt::Display for Action {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery event as it travels on the wire.
///
/// The envelope carries the queue id, an optional sequence member and the
/// action; every other key is kept opaque in `fields`.
#[derive(Debug, Clone, PartialEq)]
pub struct WireEvent {
    pub id: String,
    pub seq: Option<String>,
    pub action: Option<Action>,
    pub fields: Map<String, Value>,
}

impl WireEvent {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), seq: None, action: None, fields: Map::new() }
    }

    pub fn with_action(
        mut self,
        action: Action
    ) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_seq(
        mut self,
        seq: impl Into<String>
    ) -> Self {
        self.seq = Some(seq.into());
        self
    }

    pub fn with_field(
        mut self,
        key: impl Into<String>,
        value: impl Into<Value>
    ) -> Self {
        let key = key.into();
        if !RESERVED_KEYS.contains(&key.as_str()) {
            self.fields.insert(key, value.into());
        }
        self
    }

    /// Reads an opaque field as text, accepting strings and numbers.
    pub fn field_text(
        &self,
        key: &str
    ) -> Option<String> {
        self.fields.get(key).and_then(scalar_text)
    }
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("msgpack decode error: {0}")]
    Decode(String),
    #[error("msgpack encode error: {0}")]
    Encode(String),
    #[error("datagram is not a map")]
    NotAMap,
    #[error("event has no id: {message}")]
    MissingId { message: String },
    #[error("datagram too large: {0} bytes")]
    TooLarge(usize),
    #[error("`{field}` too long: {chars} characters")]
    FieldTooLong { field: &'static str, chars: usize },
}

/// Decodes one datagram into a [`WireEvent`].
///
/// Fails with [`ProtoError::MissingId`] when the payload decodes fine but has
/// no usable `id`; the error carries the decoded map rendered as JSON so it can
/// be logged.
pub fn decode_event(payload: &[u8]) -> Result<WireEvent, ProtoError> {
    if payload.len() > MAX_DATAGRAM_BYTES {
        return Err(ProtoError::TooLarge(payload.len()));
    }

    let value: Value = rmp_serde::from_slice(payload)
        .map_err(|err| ProtoError::Decode(err.to_string()))?;

    let Value::Object(mut map) = value else {
        return Err(ProtoError::NotAMap);
    };

    let id = map.get("id").and_then(scalar_text).filter(|id| !id.is_empty());
    let Some(id) = id else {
        return Err(ProtoError::MissingId {
            message: Value::Object(map).to_string(),
        });
    };

    let seq = map.get("seq").and_then(scalar_text).filter(|seq| !seq.is_empty());
    let action = map.get("action").and_then(Value::as_str).map(str::trim);

    check_length("id", Some(id.as_str()))?;
    check_length("seq", seq.as_deref())?;
    check_length("action", action)?;

    let action = action.map(Action::from_str).and_then(Result::ok);

    for key in RESERVED_KEYS {
        map.remove(*key);
    }

    Ok(WireEvent { id, seq, action, fields: map })
}

fn check_length(
    field: &'static str,
    value: Option<&str>
) -> Result<(), ProtoError> {
    match value.map(|value| value.chars().count()) {
        Some(chars) if chars > MAX_ENVELOPE_CHARS => {
            Err(ProtoError::FieldTooLong { field, chars })
        }
        _ => Ok(()),
    }
}

pub fn encode_event(event: &WireEvent) -> Result<Vec<u8>, ProtoError> {
    let mut map = Map::with_capacity(event.fields.len() + 3);
    map.insert("id".to_string(), Value::String(event.id.clone()));
    if let Some(seq) = &event.seq {
        map.insert("seq".to_string(), Value::String(seq.clone()));
    }
    if let Some(action) = &event.action {
        map.insert("action".to_string(), Value::String(action.to_string()));
    }
    for (key, value) in &event.fields {
        if !RESERVED_KEYS.contains(&key.as_str()) {
            map.insert(key.clone(), value.clone());
        }
    }

    let payload = rmp_serde::to_vec(&Value::Object(map))
        .map_err(|err| ProtoError::Encode(err.to_string()))?;
    if payload.len() > MAX_DATAGRAM_BYTES {
        return Err(ProtoError::TooLarge(payload.len()));
    }
    Ok(payload)
}

/// Renders strings, numbers and booleans as text; everything else is `None`.
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}
