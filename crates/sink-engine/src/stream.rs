//! Per-stream runtime state.
//!
//! A naive layout keeps five parallel `HashMap`s (`schemas`,
//! `key_properties`, `tables`, `rows`, `errors`) all keyed by stream name and
//! mutated in lockstep. Here every field one stream owns lives on a single
//! [`Stream`] value instead, and the engine keeps one `stream_name -> Stream`
//! map rather than five.

use serde_json::Value;

/// Everything the engine tracks for one upstream stream, for the lifetime of
/// the run.
#[derive(Debug, Clone)]
pub struct Stream {
    /// The last `SCHEMA` message's fragment, used to re-translate columns
    /// whenever a `STATE` message asks whether the warehouse table has
    /// drifted. Drift is checked against the warehouse's actual stored
    /// schema (via `get_table`), not a locally cached column list — a cache
    /// updated every time this field changes would never show drift against
    /// itself.
    pub schema: Value,
    /// Ordered primary-key field names. Non-empty: the hybrid driver
    /// refuses a schema whose `key_properties` is empty rather than
    /// silently disabling deduplication.
    pub key_properties: Vec<String>,
    /// Rows accepted since the last successful flush, in arrival order.
    pub row_buffer: Vec<Value>,
    /// Set after a table-schema update or recreate; extends the next
    /// flush's retry horizon from 30s to 300s because the warehouse's
    /// streaming-insert frontends lag its metadata store after a schema
    /// change. Cleared once that flush succeeds.
    pub updated_recently: bool,
}

impl Stream {
    pub fn new(schema: Value, key_properties: Vec<String>) -> Self {
        Stream {
            schema,
            key_properties,
            row_buffer: Vec::new(),
            updated_recently: false,
        }
    }
}
