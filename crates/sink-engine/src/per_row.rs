//! The per-row driver: the simplest of the three modes. No
//! deduplication, no retry, no schema reconciliation beyond create-on-first-
//! schema. Each record is inserted the moment it arrives.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use sink_protocol::{decode_line, Message};
use sink_schema::build_schema;
use sink_warehouse::{InsertRow, WarehouseClient};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::reconcile;

#[derive(Debug, Default, Clone, Copy)]
struct StreamTally {
    written: usize,
    errored: usize,
}

/// Insert-as-you-go driver selected for `replication_method` values other
/// than `HYBRID` when bulk loading isn't in play. Owns no row buffers: a
/// `RECORD` is inserted and forgotten.
pub struct PerRowDriver {
    warehouse: Arc<dyn WarehouseClient>,
    dataset: String,
    location: Option<String>,
    known_streams: HashSet<String>,
    tallies: HashMap<String, StreamTally>,
    last_state: Option<Value>,
}

impl PerRowDriver {
    pub fn new(warehouse: Arc<dyn WarehouseClient>, dataset: impl Into<String>, location: Option<String>) -> Self {
        PerRowDriver {
            warehouse,
            dataset: dataset.into(),
            location,
            known_streams: HashSet::new(),
            tallies: HashMap::new(),
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

    /// Drive the run to completion. Always returns the last-seen `State`
    /// value, regardless of how many rows errored along the way — this
    /// mode has no failed-lines gate.
    pub async fn run(&mut self, input: impl AsyncBufRead + Unpin) -> Result<Option<Value>, EngineError> {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await.map_err(EngineError::Io)? {
            if line.trim().is_empty() {
                continue;
            }
            match decode_line(&line) {
                Ok(Message::Schema(msg)) => {
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
                    self.known_streams.insert(msg.stream.clone());
                    self.tallies.entry(msg.stream).or_default();
                }
                Ok(Message::Record(msg)) => {
                    if !self.known_streams.contains(&msg.stream) {
                        warn!(stream = %msg.stream, "record received before its schema; dropped");
                        continue;
                    }

                    let row = InsertRow {
                        insert_id: None,
                        row: msg.record,
                    };
                    let tally = self.tallies.entry(msg.stream.clone()).or_default();
                    match self.warehouse.insert_rows(&self.dataset, &msg.stream, &[row]).await {
                        Ok(rejections) if rejections.is_empty() => tally.written += 1,
                        Ok(rejections) => {
                            warn!(stream = %msg.stream, count = rejections.len(), "row rejected on insert");
                            tally.errored += 1;
                        }
                        Err(err) => {
                            warn!(stream = %msg.stream, error = %err, "error inserting row");
                            tally.errored += 1;
                        }
                    }
                }
                Ok(Message::State(msg)) => {
                    self.last_state = Some(msg.value);
                }
                Ok(Message::ActivateVersion) => {}
                Err(err) => warn!(error = %err, "unable to decode line"),
            }
        }

        for (stream, tally) in &self.tallies {
            info!(stream = %stream, written = tally.written, errored = tally.errored, "per-row stream summary");
        }

        Ok(self.last_state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sink_testkit::MemoryWarehouseClient;
    use std::io::Cursor;

    fn lines(text: &str) -> Cursor<Vec<u8>> {
        Cursor::new(text.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn inserts_rows_immediately_and_returns_final_state() {
        let client = Arc::new(MemoryWarehouseClient::new());
        let mut driver = PerRowDriver::new(client.clone(), "d", None);
        driver.ensure_dataset().await.unwrap();

        let input = format!(
            "{}\n{}\n{}\n{}\n",
            json!({"type": "SCHEMA", "stream": "t", "schema": {"type": "object", "properties": {"id": {"type": "integer"}}}, "key_properties": ["id"]}),
            json!({"type": "RECORD", "stream": "t", "record": {"id": 1}}),
            json!({"type": "RECORD", "stream": "t", "record": {"id": 2}}),
            json!({"type": "STATE", "value": {"progress": 2}}),
        );

        let state = driver.run(lines(&input)).await.unwrap();
        assert_eq!(state, Some(json!({"progress": 2})));
        assert_eq!(client.row_count("d", "t").await, 2);
    }

    #[tokio::test]
    async fn record_before_schema_is_dropped_not_fatal() {
        let client = Arc::new(MemoryWarehouseClient::new());
        let mut driver = PerRowDriver::new(client.clone(), "d", None);
        driver.ensure_dataset().await.unwrap();

        let input = format!("{}\n", json!({"type": "RECORD", "stream": "t", "record": {"id": 1}}));
        let state = driver.run(lines(&input)).await.unwrap();
        assert_eq!(state, None);
        assert_eq!(client.row_count("d", "t").await, 0);
    }

    #[tokio::test]
    async fn row_rejection_returns_state_anyway() {
        use sink_testkit::InsertFault;

        let client = Arc::new(MemoryWarehouseClient::new());
        let mut driver = PerRowDriver::new(client.clone(), "d", None);
        driver.ensure_dataset().await.unwrap();

        let schema = json!({"type": "SCHEMA", "stream": "t", "schema": {"type": "object", "properties": {"id": {"type": "integer"}}}, "key_properties": ["id"]});
        let input = format!("{schema}\n");
        driver.run(lines(&input)).await.unwrap();

        client.queue_insert_fault("d", "t", InsertFault::Unclassified("boom".to_string())).await;

        let input = format!(
            "{}\n{}\n",
            json!({"type": "RECORD", "stream": "t", "record": {"id": 1}}),
            json!({"type": "STATE", "value": {"progress": 1}}),
        );
        let state = driver.run(lines(&input)).await.unwrap();
        assert_eq!(state, Some(json!({"progress": 1})));
    }
}
