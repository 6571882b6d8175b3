//! The bulk-load driver: buffers each stream to a scratch file and
//! hands it to the warehouse as a single load job per table at end of
//! input. Selected whenever `replication_method` isn't `HYBRID`; truncates
//! the destination table for `"FULL_TABLE"`, otherwise appends with
//! field-addition allowed.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use serde_json::Value;
use sink_protocol::{decode_line, Message};
use sink_schema::build_schema;
use sink_warehouse::{LoadDisposition, WarehouseClient};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

use crate::error::EngineError;

struct BulkStream {
    schema: Value,
    /// RAII-scoped scratch file: released (deleted) when this value drops,
    /// on every exit path — success, load-job error, or an aborting error
    /// earlier in the run.
    file: NamedTempFile,
    row_count: usize,
}

/// Buffer-then-load driver. One scratch file per stream, one load job per
/// stream at end of input.
pub struct BulkLoadDriver {
    warehouse: Arc<dyn WarehouseClient>,
    dataset: String,
    location: Option<String>,
    truncate: bool,
    streams: HashMap<String, BulkStream>,
    last_state: Option<Value>,
}

impl BulkLoadDriver {
    /// `truncate` is `true` when `replication_method == "FULL_TABLE"`
    /// (`WRITE_TRUNCATE`); otherwise every load job appends with
    /// `ALLOW_FIELD_ADDITION`.
    pub fn new(warehouse: Arc<dyn WarehouseClient>, dataset: impl Into<String>, location: Option<String>, truncate: bool) -> Self {
        BulkLoadDriver {
            warehouse,
            dataset: dataset.into(),
            location,
            truncate,
            streams: HashMap::new(),
            last_state: None,
        }
    }

    pub async fn ensure_dataset(&self) -> Result<(), EngineError> {
        self.warehouse
            .ensure_dataset(&self.dataset, self.location.as_deref())
            .await
            .map_err(|source| EngineError::Unclassified {
                stream: self.dataset.clone(),
                source,
            })
    }

    /// Drive the run to completion. Returns the final checkpoint value, or
    /// `None` if any stream's load job failed (state emission is
    /// short-circuited for the whole run, not just the failing stream).
    pub async fn run(&mut self, input: impl AsyncBufRead + Unpin) -> Result<Option<Value>, EngineError> {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await.map_err(EngineError::Io)? {
            if line.trim().is_empty() {
                continue;
            }
            match decode_line(&line) {
                Ok(Message::Schema(msg)) => {
                    let file = NamedTempFile::new().map_err(EngineError::Io)?;
                    self.streams.insert(
                        msg.stream,
                        BulkStream {
                            schema: msg.schema,
                            file,
                            row_count: 0,
                        },
                    );
                }
                Ok(Message::Record(msg)) => {
                    if let Some(stream) = self.streams.get_mut(&msg.stream) {
                        let mut encoded = serde_json::to_vec(&msg.record).expect("Value always serializes");
                        encoded.push(b'\n');
                        stream.file.write_all(&encoded).map_err(EngineError::Io)?;
                        stream.row_count += 1;
                    } else {
                        warn!(stream = %msg.stream, "record received before its schema; dropped");
                    }
                }
                Ok(Message::State(msg)) => {
                    self.last_state = Some(msg.value);
                }
                Ok(Message::ActivateVersion) => {}
                Err(err) => warn!(error = %err, "unable to decode line"),
            }
        }

        let mut any_failed = false;
        for (name, stream) in self.streams.iter_mut() {
            if stream.row_count == 0 {
                continue;
            }
            stream.file.flush().map_err(EngineError::Io)?;

            let fields = match build_schema(&stream.schema, true) {
                Ok(fields) => fields,
                Err(err) => {
                    warn!(stream = %name, error = %err, "error building schema for load job");
                    any_failed = true;
                    continue;
                }
            };

            let disposition = if self.truncate {
                LoadDisposition::Truncate
            } else {
                LoadDisposition::AppendAllowFieldAddition
            };

            match self
                .warehouse
                .load_rows(&self.dataset, name, stream.file.path(), &fields, disposition)
                .await
            {
                Ok(()) => info!(stream = %name, rows = stream.row_count, "loaded row(s) via load job"),
                Err(err) => {
                    warn!(stream = %name, error = %err, "error on load job");
                    any_failed = true;
                }
            }
        }

        if any_failed {
            Ok(None)
        } else {
            Ok(self.last_state.clone())
        }
    }
}
