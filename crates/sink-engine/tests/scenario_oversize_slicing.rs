//! Scenario: a batch the warehouse rejects as oversize is split and
//! retried as two disjoint halves, and decimal-typed fields survive the
//! round trip as floats.
//!
//! # Invariant under test
//!
//! For any batch the warehouse rejects as oversize, the pipeline issues at
//! least two warehouse calls, each covering a disjoint half, and every row
//! still lands.

use std::io::Cursor;
use std::sync::Arc;

use serde_json::json;
use sink_engine::HybridEngine;
use sink_testkit::{InsertFault, MemoryWarehouseClient};

#[tokio::test(start_paused = true)]
async fn oversize_batch_splits_in_half_and_every_row_lands() {
    let client = Arc::new(MemoryWarehouseClient::new());
    let mut engine = HybridEngine::new(client.clone(), "ds", None, true, false);
    engine.ensure_dataset().await.unwrap();

    client
        .queue_insert_fault("ds", "measurements", InsertFault::Oversize)
        .await;

    let mut input = String::new();
    input += &format!(
        "{}\n",
        json!({
            "type": "SCHEMA",
            "stream": "measurements",
            "schema": {"type": "object", "properties": {"id": {"type": "integer"}, "amount": {"type": "number"}}},
            "key_properties": ["id"],
        })
    );
    for i in 0..200 {
        input += &format!(
            "{}\n",
            json!({"type": "RECORD", "stream": "measurements", "record": {"id": i, "amount": 3.14159 + i as f64}})
        );
    }
    input += &format!("{}\n", json!({"type": "STATE", "value": {"version": 1}}));

    let mut output = Vec::new();
    engine
        .run(Cursor::new(input.into_bytes()), &mut output)
        .await
        .unwrap();

    assert!(engine.failed_lines().is_empty());
    let rows = client.rows("ds", "measurements").await;
    assert_eq!(rows.len(), 200);
    assert!(rows.iter().all(|r| r["amount"].is_f64()));
}
