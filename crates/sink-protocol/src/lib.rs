//! Decoder for the newline-delimited message protocol produced by the upstream
//! extractor: `SCHEMA`, `RECORD`, `STATE`, and `ACTIVATE_VERSION` lines.
//!
//! This crate is intentionally narrow: it only turns one line of text into one
//! [`Message`]. It knows nothing about warehouses, schema translation, or the
//! ingestion state machine — those live in `sink-schema` and `sink-engine`.

use std::fmt;

use serde::Deserialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A `SCHEMA` message: declares (or redeclares) the shape of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaMessage {
    pub stream: String,
    pub schema: Value,
    pub key_properties: Vec<String>,
    pub bookmark_properties: Vec<String>,
}

/// A `RECORD` message: one row belonging to a previously-declared stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordMessage {
    pub stream: String,
    pub record: Value,
    pub version: Option<i64>,
    pub time_extracted: Option<String>,
}

/// A `STATE` message: an opaque checkpoint value the upstream wants echoed
/// back once every record preceding it has been durably accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMessage {
    pub value: Value,
}

/// One decoded line of the input protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Schema(SchemaMessage),
    Record(RecordMessage),
    State(StateMessage),
    /// `ACTIVATE_VERSION` carries no information the engine acts on.
    ActivateVersion,
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// A line that could not be turned into a [`Message`].
///
/// Both variants are non-fatal from the decoder's point of view: the caller
/// is expected to file the line away (`failed_lines` in the engine) and keep
/// reading. The decoder never decides what "non-fatal" means for the run as
/// a whole.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The line was not valid JSON, or was JSON but not a recognized
    /// message shape (missing `type`, or a `type` value that isn't a string).
    Malformed(String),
    /// The line parsed as JSON with a `type` field, but the value wasn't one
    /// of `SCHEMA` / `RECORD` / `STATE` / `ACTIVATE_VERSION`.
    UnknownType(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Malformed(line) => write!(f, "unable to parse line: {line}"),
            DecodeError::UnknownType(ty) => write!(f, "unrecognized message type: {ty}"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Deserialize)]
struct RawSchema {
    stream: String,
    schema: Value,
    #[serde(default)]
    key_properties: Vec<String>,
    #[serde(default)]
    bookmark_properties: Vec<String>,
}

#[derive(Deserialize)]
struct RawRecord {
    stream: String,
    record: Value,
    #[serde(default)]
    version: Option<i64>,
    #[serde(default)]
    time_extracted: Option<String>,
}

#[derive(Deserialize)]
struct RawState {
    value: Value,
}

/// Decode one non-empty input line.
///
/// The line is first parsed as a generic JSON object to read its `type`
/// discriminator, then re-deserialized into the shape that discriminator
/// implies. A blank `type` or anything that isn't an object is reported as
/// [`DecodeError::Malformed`] rather than [`DecodeError::UnknownType`], since
/// there's no tag to even check.
pub fn decode_line(line: &str) -> Result<Message, DecodeError> {
    let envelope: Value =
        serde_json::from_str(line).map_err(|_| DecodeError::Malformed(line.to_string()))?;

    let ty = envelope
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Malformed(line.to_string()))?;

    match ty {
        "SCHEMA" => {
            let raw: RawSchema =
                serde_json::from_value(envelope).map_err(|_| DecodeError::Malformed(line.to_string()))?;
            Ok(Message::Schema(SchemaMessage {
                stream: raw.stream,
                schema: raw.schema,
                key_properties: raw.key_properties,
                bookmark_properties: raw.bookmark_properties,
            }))
        }
        "RECORD" => {
            let raw: RawRecord =
                serde_json::from_value(envelope).map_err(|_| DecodeError::Malformed(line.to_string()))?;
            Ok(Message::Record(RecordMessage {
                stream: raw.stream,
                record: raw.record,
                version: raw.version,
                time_extracted: raw.time_extracted,
            }))
        }
        "STATE" => {
            let raw: RawState =
                serde_json::from_value(envelope).map_err(|_| DecodeError::Malformed(line.to_string()))?;
            Ok(Message::State(StateMessage { value: raw.value }))
        }
        "ACTIVATE_VERSION" => Ok(Message::ActivateVersion),
        other => Err(DecodeError::UnknownType(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// STATE message helpers
// ---------------------------------------------------------------------------

/// Extracts `value.currently_syncing` verbatim (e.g. `"db-schema-fruitimals"`),
/// if present and a string.
pub fn currently_syncing(state_value: &Value) -> Option<&str> {
    state_value.get("currently_syncing").and_then(Value::as_str)
}

/// The stream name embedded in a `currently_syncing` value: the substring
/// after the last `-`. Empty string in, empty string out.
pub fn currently_syncing_stream(full: &str) -> &str {
    match full.rfind('-') {
        Some(idx) => &full[idx + 1..],
        None => full,
    }
}

/// `value.bookmarks[full_stream].replication_key_value`, if present.
pub fn replication_key_value<'a>(state_value: &'a Value, full_stream: &str) -> Option<&'a Value> {
    state_value
        .get("bookmarks")?
        .get(full_stream)?
        .get("replication_key_value")
}
