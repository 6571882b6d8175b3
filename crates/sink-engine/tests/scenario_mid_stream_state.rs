//! Scenario: a run carrying two `STATE` messages, one mid-stream and one
//! terminal.
//!
//! # Invariant under test
//!
//! Every state line is emitted in the order it was received, each only
//! after the records preceding it have been durably flushed.

use std::io::Cursor;
use std::sync::Arc;

use serde_json::json;
use sink_engine::HybridEngine;
use sink_testkit::MemoryWarehouseClient;

#[tokio::test(start_paused = true)]
async fn two_state_lines_are_emitted_in_received_order() {
    let client = Arc::new(MemoryWarehouseClient::new());
    let mut engine = HybridEngine::new(client.clone(), "ds", None, true, false);
    engine.ensure_dataset().await.unwrap();

    let mut input = String::new();
    input += &format!(
        "{}\n",
        json!({
            "type": "SCHEMA",
            "stream": "fruitimals",
            "schema": {"type": "object", "properties": {"id": {"type": "integer"}}},
            "key_properties": ["id"],
        })
    );
    for i in 1..=10 {
        input += &format!("{}\n", json!({"type": "RECORD", "stream": "fruitimals", "record": {"id": i}}));
    }
    input += &format!(
        "{}\n",
        json!({"type": "STATE", "value": {"currently_syncing": "fruitimals", "version": 1693427999999_i64}})
    );
    for i in 11..=15 {
        input += &format!("{}\n", json!({"type": "RECORD", "stream": "fruitimals", "record": {"id": i}}));
    }
    input += &format!(
        "{}\n",
        json!({"type": "STATE", "value": {"version": 1693429999888_i64}})
    );

    let mut output = Vec::new();
    engine
        .run(Cursor::new(input.into_bytes()), &mut output)
        .await
        .unwrap();

    let output = String::from_utf8(output).unwrap();
    let emitted: Vec<serde_json::Value> = output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    assert_eq!(
        emitted,
        vec![
            json!({"currently_syncing": "fruitimals", "version": 1693427999999_i64}),
            json!({"version": 1693429999888_i64}),
        ]
    );
    assert_eq!(client.row_count("ds", "fruitimals").await, 15);
}
