//! The batched streaming-insert pipeline: row-id computation, decimal
//! coercion, adaptive halving on oversize, and bounded retry on classified
//! transient errors.

use std::time::{Duration, Instant};

use serde_json::Value;
use sink_warehouse::{InsertRow, RowInsertError, WarehouseClient, WarehouseError, MAX_INSERT_PAYLOAD_BYTES};
use tracing::{info, warn};

use crate::stream::Stream;

const FLUSH_HORIZON_NORMAL: Duration = Duration::from_secs(30);
const FLUSH_HORIZON_UPDATED: Duration = Duration::from_secs(300);
const RETRY_BACKOFF_NORMAL: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_UPDATED: Duration = Duration::from_secs(5);

/// What happened to one stream's buffered rows after a flush attempt.
pub enum FlushOutcome {
    /// Every row landed (or the buffer was empty to begin with).
    Success,
    /// The retry horizon elapsed, or the last attempt still returned
    /// per-row rejections. `rows` is everything that must move to
    /// `failed_lines`; `detail` is a human-readable summary for logging.
    Exhausted { rows: Vec<Value>, detail: String },
}

/// Flush one stream's row buffer to the warehouse. Does not touch
/// `stream.row_buffer` or `stream.updated_recently` — the caller commits
/// those based on the returned [`FlushOutcome`], matching the driver's
/// responsibility for deciding when a checkpoint may follow.
pub async fn flush_stream(
    warehouse: &dyn WarehouseClient,
    dataset: &str,
    name: &str,
    stream: &Stream,
) -> Result<FlushOutcome, WarehouseError> {
    if stream.row_buffer.is_empty() {
        return Ok(FlushOutcome::Success);
    }

    let row_ids: Vec<String> = stream
        .row_buffer
        .iter()
        .map(|row| row_id(row, &stream.key_properties))
        .collect();
    let fixed_rows: Vec<Value> = stream.row_buffer.iter().map(coerce_decimals).collect();

    let horizon = if stream.updated_recently {
        FLUSH_HORIZON_UPDATED
    } else {
        FLUSH_HORIZON_NORMAL
    };
    let backoff = if stream.updated_recently {
        RETRY_BACKOFF_UPDATED
    } else {
        RETRY_BACKOFF_NORMAL
    };
    let deadline = Instant::now() + horizon;

    let mut rows = fixed_rows;
    let mut ids = row_ids;

    loop {
        let batch = to_insert_rows(&rows, &ids);
        match warehouse.insert_rows(dataset, name, &batch).await {
            Ok(row_errors) if row_errors.is_empty() => {
                info!(stream = name, rows = rows.len(), "loaded row(s) into table");
                return Ok(FlushOutcome::Success);
            }
            Ok(row_errors) => {
                if Instant::now() >= deadline {
                    return Ok(timeout_outcome(rows, row_errors));
                }
                warn!(stream = name, rejected = row_errors.len(), "per-row insert rejection, retrying");
                tokio::time::sleep(backoff).await;
                continue;
            }
            Err(err) => {
                let payload_len = serde_json::to_vec(&rows).map(|v| v.len()).unwrap_or(usize::MAX);
                if err.is_oversize() || payload_len > MAX_INSERT_PAYLOAD_BYTES {
                    warn!(stream = name, error = %err, "splitting oversize batch in half");
                    return Ok(split_and_insert(warehouse, dataset, name, rows, ids).await);
                }
                if err.is_retryable() {
                    if Instant::now() >= deadline {
                        return Ok(FlushOutcome::Exhausted {
                            rows,
                            detail: format!("retry horizon elapsed: {err}"),
                        });
                    }
                    warn!(stream = name, error = %err, "retryable error on insert_rows");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                return Err(err);
            }
        }
    }
}

fn timeout_outcome(rows: Vec<Value>, row_errors: Vec<RowInsertError>) -> FlushOutcome {
    let detail = row_errors
        .iter()
        .map(|e| format!("row {}: {}", e.row_index, e.messages.join("; ")))
        .collect::<Vec<_>>()
        .join(", ");
    FlushOutcome::Exhausted { rows, detail }
}

/// Split `rows`/`ids` at the midpoint and issue two sequential inserts, as
/// the oversize-recovery path does. Each half is attempted exactly once —
/// no further retry or re-splitting, matching the reference behavior of
/// exiting the retry loop right after the split.
async fn split_and_insert(
    warehouse: &dyn WarehouseClient,
    dataset: &str,
    name: &str,
    rows: Vec<Value>,
    ids: Vec<String>,
) -> FlushOutcome {
    let mid = rows.len() / 2;
    let (first_rows, second_rows) = rows.split_at(mid);
    let (first_ids, second_ids) = ids.split_at(mid);

    let mut failed_rows = Vec::new();
    let mut details = Vec::new();

    match warehouse
        .insert_rows(dataset, name, &to_insert_rows(first_rows, first_ids))
        .await
    {
        Ok(errs) if errs.is_empty() => {}
        Ok(errs) => {
            failed_rows.extend(first_rows.iter().cloned());
            details.push(format!("first half: {} row(s) rejected", errs.len()));
        }
        Err(err) => {
            failed_rows.extend(first_rows.iter().cloned());
            details.push(format!("first half: {err}"));
        }
    }

    match warehouse
        .insert_rows(dataset, name, &to_insert_rows(second_rows, second_ids))
        .await
    {
        Ok(errs) if errs.is_empty() => {}
        Ok(errs) => {
            failed_rows.extend(second_rows.iter().cloned());
            details.push(format!("second half: {} row(s) rejected", errs.len()));
        }
        Err(err) => {
            failed_rows.extend(second_rows.iter().cloned());
            details.push(format!("second half: {err}"));
        }
    }

    if failed_rows.is_empty() {
        FlushOutcome::Success
    } else {
        FlushOutcome::Exhausted {
            rows: failed_rows,
            detail: details.join("; "),
        }
    }
}

fn to_insert_rows(rows: &[Value], ids: &[String]) -> Vec<InsertRow> {
    rows.iter()
        .zip(ids.iter())
        .map(|(row, id)| InsertRow {
            insert_id: Some(id.clone()),
            row: row.clone(),
        })
        .collect()
}

/// `"-".join(str(row[k]) for k in key_properties)`, the dedup token the
/// warehouse's row id is built from.
fn row_id(row: &Value, key_properties: &[String]) -> String {
    key_properties
        .iter()
        .map(|key| stringify(row.get(key).unwrap_or(&Value::Null)))
        .collect::<Vec<_>>()
        .join("-")
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Coerce every decimal-typed value in `row` to double-precision float. The
/// upstream protocol's arbitrary-precision decimals can't cross the
/// warehouse's JSON transport as-is; this walks the row (including nested
/// objects/arrays, since the upstream's nested RECORD columns can carry
/// decimals too) replacing any number that can't be represented exactly as
/// an i64/u64 with its nearest f64.
fn coerce_decimals(row: &Value) -> Value {
    match row {
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                row.clone()
            } else {
                match n.as_f64() {
                    Some(f) => serde_json::Number::from_f64(f)
                        .map(Value::Number)
                        .unwrap_or(Value::Null),
                    None => row.clone(),
                }
            }
        }
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), coerce_decimals(v))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(coerce_decimals).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sink_testkit::{InsertFault, MemoryWarehouseClient};

    fn stream_with_rows(rows: Vec<Value>) -> Stream {
        let mut stream = Stream::new(json!({}), vec!["id".to_string()]);
        stream.row_buffer = rows;
        stream
    }

    #[test]
    fn row_id_joins_key_properties_with_dash() {
        let row = json!({"a": 1, "b": "x"});
        assert_eq!(row_id(&row, &["a".to_string(), "b".to_string()]), "1-x");
    }

    #[test]
    fn decimal_like_float_is_preserved_as_float() {
        let row = json!({"price": 19.99, "id": 4});
        let fixed = coerce_decimals(&row);
        assert_eq!(fixed["price"], json!(19.99));
        assert_eq!(fixed["id"], json!(4));
    }

    #[test]
    fn nested_object_decimals_are_coerced_too() {
        let row = json!({"meta": {"amount": 3.5}});
        let fixed = coerce_decimals(&row);
        assert_eq!(fixed["meta"]["amount"], json!(3.5));
    }

    #[tokio::test]
    async fn empty_buffer_is_a_no_op_success() {
        let client = MemoryWarehouseClient::new();
        let stream = stream_with_rows(vec![]);
        let outcome = flush_stream(&client, "d", "t", &stream).await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Success));
    }

    #[tokio::test]
    async fn happy_path_flush_inserts_all_rows() {
        let client = MemoryWarehouseClient::new();
        client.create_table("d", "t", &[]).await.unwrap();
        let stream = stream_with_rows(vec![json!({"id": 1}), json!({"id": 2})]);
        let outcome = flush_stream(&client, "d", "t", &stream).await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Success));
        assert_eq!(client.row_count("d", "t").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_fault_is_retried_then_succeeds() {
        let client = MemoryWarehouseClient::new();
        client.create_table("d", "t", &[]).await.unwrap();
        client.queue_insert_fault("d", "t", InsertFault::Retryable).await;

        let stream = stream_with_rows(vec![json!({"id": 1})]);
        let outcome = flush_stream(&client, "d", "t", &stream).await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Success));
        assert_eq!(client.row_count("d", "t").await, 1);
    }

    #[tokio::test]
    async fn oversize_fault_splits_the_batch_in_half() {
        let client = MemoryWarehouseClient::new();
        client.create_table("d", "t", &[]).await.unwrap();
        client.queue_insert_fault("d", "t", InsertFault::Oversize).await;

        let rows: Vec<Value> = (0..10).map(|i| json!({"id": i})).collect();
        let stream = stream_with_rows(rows);
        let outcome = flush_stream(&client, "d", "t", &stream).await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Success));
        assert_eq!(client.row_count("d", "t").await, 10);
    }

    #[tokio::test]
    async fn unclassified_error_is_propagated() {
        let client = MemoryWarehouseClient::new();
        client.create_table("d", "t", &[]).await.unwrap();
        client
            .queue_insert_fault("d", "t", InsertFault::Unclassified("boom".to_string()))
            .await;

        let stream = stream_with_rows(vec![json!({"id": 1})]);
        let err = flush_stream(&client, "d", "t", &stream).await.unwrap_err();
        assert_eq!(err.message, "boom");
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_row_rejection_exhausts_into_failed_rows() {
        let client = MemoryWarehouseClient::new();
        client.create_table("d", "t", &[]).await.unwrap();
        for _ in 0..40 {
            client
                .queue_insert_fault(
                    "d",
                    "t",
                    InsertFault::RowRejected {
                        row_index: 0,
                        message: "bad row".to_string(),
                    },
                )
                .await;
        }

        let stream = stream_with_rows(vec![json!({"id": 1})]);
        let outcome = flush_stream(&client, "d", "t", &stream).await.unwrap();
        match outcome {
            FlushOutcome::Exhausted { rows, .. } => assert_eq!(rows.len(), 1),
            FlushOutcome::Success => panic!("expected exhaustion"),
        }
    }
}
