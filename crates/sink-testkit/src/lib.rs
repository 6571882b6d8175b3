//! An in-memory [`WarehouseClient`] double, used by `sink-engine`'s own
//! tests to exercise retry, schema-drift, and oversize-handling behavior
//! without a live BigQuery project.
//!
//! Fault injection is queue-based: `queue_insert_fault` pushes one
//! [`InsertFault`] per call onto a per-table queue, consumed in order by the
//! next matching `insert_rows`/`update_table_schema` call. Once a table's
//! queue is empty, calls behave as the happy path.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use sink_schema::Column;
use sink_warehouse::{InsertRow, LoadDisposition, RowInsertError, TableMetadata, WarehouseClient, WarehouseError};
use tokio::sync::Mutex;

type TableKey = (String, String);

/// A scripted failure for the next `insert_rows` call against a table.
#[derive(Debug, Clone)]
pub enum InsertFault {
    /// The whole request fails with a retryable backend error.
    Retryable,
    /// The whole request fails as oversize (too many rows / bytes).
    Oversize,
    /// The whole request fails with an error carrying no structured reason —
    /// the "give up, this run is dead" case.
    Unclassified(String),
    /// The request succeeds, but the row at `row_index` is rejected.
    RowRejected { row_index: usize, message: String },
}

/// A scripted failure for the next `update_table_schema` call against a
/// table.
#[derive(Debug, Clone)]
pub enum SchemaUpdateFault {
    Retryable,
    /// The PATCH is rejected as structurally incompatible (requires drop +
    /// recreate to resolve).
    Incompatible,
    Unclassified(String),
}

#[derive(Debug, Clone, Default)]
struct TableState {
    fields: Vec<Column>,
    /// insert_id -> row body. A `HashMap` models BigQuery's best-effort
    /// dedup-by-insert-id semantics: re-inserting the same id overwrites
    /// rather than duplicates.
    rows: HashMap<String, Value>,
}

#[derive(Default)]
struct Inner {
    datasets: HashSet<String>,
    tables: HashMap<TableKey, TableState>,
    insert_faults: HashMap<TableKey, VecDeque<InsertFault>>,
    schema_update_faults: HashMap<TableKey, VecDeque<SchemaUpdateFault>>,
    /// Source of unique keys for rows inserted without a dedup id (the
    /// per-row-stream driver never supplies one).
    no_dedup_seq: u64,
}

fn storage_key(inner: &mut Inner, insert_id: &Option<String>) -> String {
    match insert_id {
        Some(id) => id.clone(),
        None => {
            inner.no_dedup_seq += 1;
            format!("__no_dedup__{}", inner.no_dedup_seq)
        }
    }
}

/// In-memory stand-in for a BigQuery-like warehouse.
#[derive(Default)]
pub struct MemoryWarehouseClient {
    inner: Mutex<Inner>,
}

impl MemoryWarehouseClient {
    pub fn new() -> Self {
        MemoryWarehouseClient::default()
    }

    pub async fn queue_insert_fault(&self, dataset: &str, table: &str, fault: InsertFault) {
        let mut inner = self.inner.lock().await;
        inner
            .insert_faults
            .entry((dataset.to_string(), table.to_string()))
            .or_default()
            .push_back(fault);
    }

    pub async fn queue_schema_update_fault(&self, dataset: &str, table: &str, fault: SchemaUpdateFault) {
        let mut inner = self.inner.lock().await;
        inner
            .schema_update_faults
            .entry((dataset.to_string(), table.to_string()))
            .or_default()
            .push_back(fault);
    }

    /// Snapshot of every row currently accepted for a table, for test
    /// assertions. Empty if the table doesn't exist.
    pub async fn rows(&self, dataset: &str, table: &str) -> Vec<Value> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(&(dataset.to_string(), table.to_string()))
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn row_count(&self, dataset: &str, table: &str) -> usize {
        self.rows(dataset, table).await.len()
    }

    pub async fn fields(&self, dataset: &str, table: &str) -> Option<Vec<Column>> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(&(dataset.to_string(), table.to_string()))
            .map(|t| t.fields.clone())
    }
}

#[async_trait]
impl WarehouseClient for MemoryWarehouseClient {
    async fn ensure_dataset(&self, dataset: &str, _location: Option<&str>) -> Result<(), WarehouseError> {
        let mut inner = self.inner.lock().await;
        inner.datasets.insert(dataset.to_string());
        Ok(())
    }

    async fn get_table(&self, dataset: &str, table: &str) -> Result<Option<TableMetadata>, WarehouseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tables
            .get(&(dataset.to_string(), table.to_string()))
            .map(|t| TableMetadata {
                fields: t.fields.clone(),
            }))
    }

    async fn create_table(&self, dataset: &str, table: &str, fields: &[Column]) -> Result<(), WarehouseError> {
        let mut inner = self.inner.lock().await;
        inner.tables.insert(
            (dataset.to_string(), table.to_string()),
            TableState {
                fields: fields.to_vec(),
                rows: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn update_table_schema(
        &self,
        dataset: &str,
        table: &str,
        fields: &[Column],
    ) -> Result<(), WarehouseError> {
        let key = (dataset.to_string(), table.to_string());
        let mut inner = self.inner.lock().await;

        if let Some(fault) = inner
            .schema_update_faults
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Err(match fault {
                SchemaUpdateFault::Retryable => {
                    WarehouseError::with_reason("backendError", "transient backend error")
                }
                SchemaUpdateFault::Incompatible => {
                    WarehouseError::new(format!("Provided Schema does not match Table {dataset}.{table}"))
                }
                SchemaUpdateFault::Unclassified(message) => WarehouseError::new(message),
            });
        }

        let state = inner
            .tables
            .entry(key)
            .or_insert_with(TableState::default);
        state.fields = fields.to_vec();
        Ok(())
    }

    async fn delete_table(&self, dataset: &str, table: &str) -> Result<(), WarehouseError> {
        let mut inner = self.inner.lock().await;
        inner.tables.remove(&(dataset.to_string(), table.to_string()));
        Ok(())
    }

    async fn insert_rows(
        &self,
        dataset: &str,
        table: &str,
        rows: &[InsertRow],
    ) -> Result<Vec<RowInsertError>, WarehouseError> {
        let key = (dataset.to_string(), table.to_string());
        let mut inner = self.inner.lock().await;

        if let Some(fault) = inner.insert_faults.get_mut(&key).and_then(VecDeque::pop_front) {
            match fault {
                InsertFault::Retryable => {
                    return Err(WarehouseError::with_reason("backendError", "transient backend error"))
                }
                InsertFault::Oversize => {
                    return Err(WarehouseError::new("Request payload size exceeds the limit"))
                }
                InsertFault::Unclassified(message) => return Err(WarehouseError::new(message)),
                InsertFault::RowRejected { row_index, message } => {
                    for (idx, row) in rows.iter().enumerate() {
                        if idx != row_index {
                            let storage_id = storage_key(&mut inner, &row.insert_id);
                            inner
                                .tables
                                .entry(key.clone())
                                .or_insert_with(TableState::default)
                                .rows
                                .insert(storage_id, row.row.clone());
                        }
                    }
                    return Ok(vec![RowInsertError {
                        row_index,
                        messages: vec![message],
                    }]);
                }
            }
        }

        for row in rows {
            let storage_id = storage_key(&mut inner, &row.insert_id);
            inner
                .tables
                .entry(key.clone())
                .or_insert_with(TableState::default)
                .rows
                .insert(storage_id, row.row.clone());
        }
        Ok(Vec::new())
    }

    async fn load_rows(
        &self,
        dataset: &str,
        table: &str,
        path: &Path,
        fields: &[Column],
        disposition: LoadDisposition,
    ) -> Result<(), WarehouseError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| WarehouseError::new(format!("reading load file: {err}")))?;

        let mut loaded = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line)
                .map_err(|err| WarehouseError::new(format!("invalid ndjson row: {err}")))?;
            loaded.push(value);
        }

        let key = (dataset.to_string(), table.to_string());
        let mut inner = self.inner.lock().await;
        let state = inner.tables.entry(key).or_insert_with(TableState::default);
        state.fields = fields.to_vec();
        if matches!(disposition, LoadDisposition::Truncate) {
            state.rows.clear();
        }
        for (i, row) in loaded.into_iter().enumerate() {
            state.rows.insert(format!("load-{i}"), row);
        }
        Ok(())
    }
}
