//! The hybrid (streaming-insert) ingestion engine: the state machine that
//! consumes the protocol stream, keeps table schemas in step, buffers and
//! flushes rows, and emits checkpoints only when every record preceding
//! them has been durably accepted.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use sink_protocol::{self, decode_line, Message, RecordMessage, SchemaMessage, StateMessage};
use sink_schema::build_schema;
use sink_warehouse::WarehouseClient;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::insert::{self, FlushOutcome};
use crate::reconcile::{self, ReconcileOutcome};
use crate::stream::Stream;
use crate::{checkpoint, validate};

/// One line this engine could not durably accept.
///
/// A simpler design would keep an untyped bag holding either a raw protocol
/// line or a previously-buffered row object, and only ever check whether the
/// bag is empty. Keeping the distinction typed costs nothing and makes the
/// end-of-run diagnostic log precise about which failure kind dominated.
#[derive(Debug, Clone)]
pub enum FailedLine {
    /// A line that didn't decode, or a `RECORD` for a stream with no prior
    /// `SCHEMA`. The raw input line, preserved for diagnostics / replay.
    Protocol(String),
    /// A row that was buffered for `stream` but exhausted its insert retry
    /// budget.
    RowInsertFailure {
        stream: String,
        row: Value,
        error: String,
    },
}

/// The hybrid engine: one of the three driver modes, and the subject of
/// this specification. Generic over nothing — it owns an `Arc<dyn
/// WarehouseClient>` so the same engine value can be driven against either
/// the production BigQuery adapter or the in-memory test double.
pub struct HybridEngine {
    warehouse: Arc<dyn WarehouseClient>,
    dataset: String,
    location: Option<String>,
    validate_records: bool,
    can_delete_table: bool,
    streams: HashMap<String, Stream>,
    failed_lines: Vec<FailedLine>,
    last_state: Option<Value>,
}

impl HybridEngine {
    pub fn new(
        warehouse: Arc<dyn WarehouseClient>,
        dataset: impl Into<String>,
        location: Option<String>,
        validate_records: bool,
        can_delete_table: bool,
    ) -> Self {
        HybridEngine {
            warehouse,
            dataset: dataset.into(),
            location,
            validate_records,
            can_delete_table,
            streams: HashMap::new(),
            failed_lines: Vec::new(),
            last_state: None,
        }
    }

    pub fn failed_lines(&self) -> &[FailedLine] {
        &self.failed_lines
    }

    pub fn last_state(&self) -> Option<&Value> {
        self.last_state.as_ref()
    }

    /// Idempotently create the dataset this run writes into. Called once
    /// before any input is read.
    pub async fn ensure_dataset(&self) -> Result<(), EngineError> {
        self.warehouse
            .ensure_dataset(&self.dataset, self.location.as_deref())
            .await
            .map_err(|source| EngineError::Unclassified {
                stream: self.dataset.clone(),
                source,
            })
    }

    /// Drive the engine to completion over `input`, writing emitted
    /// checkpoints to `output`. Returns `Ok(())` on normal completion —
    /// including the "rows failed, checkpoint suppressed" outcome, which is
    /// not an error — and `Err` only when a fatal condition (record
    /// validation failure, or an unclassified warehouse error) aborted the
    /// run partway through.
    pub async fn run(
        &mut self,
        input: impl AsyncBufRead + Unpin,
        mut output: impl AsyncWrite + Unpin,
    ) -> Result<(), EngineError> {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await.map_err(EngineError::Io)? {
            if line.trim().is_empty() {
                continue;
            }
            self.process_line(&line, &mut output).await?;
        }

        let all_streams: Vec<String> = self.streams.keys().cloned().collect();
        self.flush(&all_streams, false, &mut output).await?;

        if self.failed_lines.is_empty() {
            if let Some(state) = self.last_state.clone() {
                checkpoint::emit(&mut output, &state)
                    .await
                    .map_err(EngineError::Io)?;
            }
        } else {
            warn!(
                count = self.failed_lines.len(),
                "run completed with failed lines; final checkpoint suppressed"
            );
        }
        Ok(())
    }

    async fn process_line(
        &mut self,
        line: &str,
        output: &mut (impl AsyncWrite + Unpin),
    ) -> Result<(), EngineError> {
        match decode_line(line) {
            Ok(Message::Schema(msg)) => self.handle_schema(msg).await,
            Ok(Message::Record(msg)) => self.handle_record(msg, line),
            Ok(Message::State(msg)) => self.handle_state(msg, output).await,
            Ok(Message::ActivateVersion) => Ok(()),
            Err(err) => {
                warn!(error = %err, "unable to decode line; filing as a protocol error");
                self.failed_lines.push(FailedLine::Protocol(line.to_string()));
                Ok(())
            }
        }
    }

    async fn handle_schema(&mut self, msg: SchemaMessage) -> Result<(), EngineError> {
        if msg.key_properties.is_empty() {
            return Err(EngineError::EmptyKeyProperties { stream: msg.stream });
        }

        let fields = build_schema(&msg.schema, true).map_err(|source| EngineError::Unclassified {
            stream: msg.stream.clone(),
            source: sink_warehouse::WarehouseError::new(source.to_string()),
        })?;

        reconcile::reconcile_create(&*self.warehouse, &self.dataset, &msg.stream, &fields)
            .await
            .map_err(|source| EngineError::Unclassified {
                stream: msg.stream.clone(),
                source,
            })?;

        self.streams
            .insert(msg.stream.clone(), Stream::new(msg.schema, msg.key_properties));
        Ok(())
    }

    fn handle_record(&mut self, msg: RecordMessage, raw_line: &str) -> Result<(), EngineError> {
        let Some(stream) = self.streams.get_mut(&msg.stream) else {
            warn!(stream = %msg.stream, "record received before its schema");
            self.failed_lines.push(FailedLine::Protocol(raw_line.to_string()));
            return Ok(());
        };

        if self.validate_records {
            if let Err(message) = validate::validate_record(&stream.schema, &msg.record) {
                return Err(EngineError::Validation {
                    stream: msg.stream,
                    message,
                });
            }
        }

        stream.row_buffer.push(msg.record);
        self.last_state = None;
        Ok(())
    }

    async fn handle_state(
        &mut self,
        msg: StateMessage,
        output: &mut (impl AsyncWrite + Unpin),
    ) -> Result<(), EngineError> {
        let full_stream = sink_protocol::currently_syncing(&msg.value).unwrap_or("");
        let stream_name = sink_protocol::currently_syncing_stream(full_stream);
        debug!(stream = stream_name, "setting state");

        // Store the incoming value before flushing so that, if the flush
        // below emits a checkpoint, it emits *this* state rather than
        // whatever state (if any) preceded it.
        self.last_state = Some(msg.value.clone());

        if !stream_name.is_empty() {
            let has_pending = self
                .streams
                .get(stream_name)
                .map(|s| !s.row_buffer.is_empty())
                .unwrap_or(false);
            if has_pending {
                self.flush(&[stream_name.to_string()], true, output).await?;
            }
        }

        if !stream_name.is_empty() {
            let replication_key_set =
                sink_protocol::replication_key_value(&msg.value, full_stream).is_some();

            if !replication_key_set {
                // Compare against the warehouse's actual stored schema, not
                // our local `stream.fields` — the latter is kept in sync
                // with whatever schema we last successfully applied, so it
                // would never show drift against itself. A `SCHEMA` message
                // updates `stream.schema` immediately but the table is only
                // patched here, once a `State` message confirms it's safe to
                // reconcile.
                let retranslated = match self.streams.get(stream_name) {
                    Some(stream) => build_schema(&stream.schema, true).ok(),
                    None => None,
                };

                let drift = match retranslated {
                    Some(retranslated) => {
                        let live_fields = self
                            .warehouse
                            .get_table(&self.dataset, stream_name)
                            .await
                            .map_err(|source| EngineError::Unclassified {
                                stream: stream_name.to_string(),
                                source,
                            })?
                            .map(|table| table.fields)
                            .unwrap_or_default();
                        if retranslated != live_fields {
                            Some(retranslated)
                        } else {
                            None
                        }
                    }
                    None => None,
                };

                if let Some(retranslated) = drift {
                    let outcome = reconcile::reconcile_update(
                        &*self.warehouse,
                        &self.dataset,
                        stream_name,
                        &retranslated,
                        self.can_delete_table,
                    )
                    .await;

                    if outcome == ReconcileOutcome::Updated {
                        if let Some(stream) = self.streams.get_mut(stream_name) {
                            stream.updated_recently = true;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn flush(
        &mut self,
        names: &[String],
        emit_state_after: bool,
        output: &mut (impl AsyncWrite + Unpin),
    ) -> Result<(), EngineError> {
        for name in names {
            let Some(stream) = self.streams.get(name) else { continue };
            if stream.row_buffer.is_empty() {
                continue;
            }

            let outcome = insert::flush_stream(&*self.warehouse, &self.dataset, name, stream)
                .await
                .map_err(|source| EngineError::Unclassified {
                    stream: name.clone(),
                    source,
                })?;

            match outcome {
                FlushOutcome::Success => {
                    if let Some(stream) = self.streams.get_mut(name) {
                        stream.row_buffer.clear();
                        stream.updated_recently = false;
                    }
                    if emit_state_after {
                        if let Some(state) = self.last_state.clone() {
                            checkpoint::emit(output, &state).await.map_err(EngineError::Io)?;
                        }
                    }
                }
                FlushOutcome::Exhausted { rows, detail } => {
                    warn!(stream = %name, error = %detail, "error loading row(s) into table; moving to failed lines");
                    for row in rows {
                        self.failed_lines.push(FailedLine::RowInsertFailure {
                            stream: name.clone(),
                            row,
                            error: detail.clone(),
                        });
                    }
                    if let Some(stream) = self.streams.get_mut(name) {
                        stream.row_buffer.clear();
                        stream.updated_recently = false;
                    }
                }
            }
        }
        Ok(())
    }
}
