use std::fmt;

use sink_warehouse::WarehouseError;

/// A fatal condition that aborts the run. Everything else — undecodable
/// lines, rows that exhaust their retry budget — is quarantined into
/// [`crate::FailedLine`] instead of reaching this type.
#[derive(Debug)]
pub enum EngineError {
    /// A `RECORD` failed validation against its stream's declared schema
    /// and `validate_records` is enabled. Matches the "strict-when-asked"
    /// contract: validation failures are never collected as failed lines.
    Validation { stream: String, message: String },
    /// A `SCHEMA` message declared an empty `key_properties` list while the
    /// hybrid engine is selected. An empty list would silently disable
    /// row-id deduplication, so hybrid rejects it outright.
    EmptyKeyProperties { stream: String },
    /// A warehouse call failed with an error this engine has no
    /// classification for (not retryable, not oversize, not a schema
    /// mismatch). Re-raised rather than quarantined.
    Unclassified { stream: String, source: WarehouseError },
    /// Reading from stdin or writing a checkpoint to stdout failed.
    Io(std::io::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Validation { stream, message } => {
                write!(f, "record for stream '{stream}' failed schema validation: {message}")
            }
            EngineError::EmptyKeyProperties { stream } => {
                write!(
                    f,
                    "stream '{stream}' declared an empty key_properties list; \
                     the hybrid engine requires at least one key property for deduplication"
                )
            }
            EngineError::Unclassified { stream, source } => {
                write!(f, "unclassified warehouse error for stream '{stream}': {source}")
            }
            EngineError::Io(err) => write!(f, "i/o error: {err}"),
        }
    }
}

impl std::error::Error for EngineError {}
