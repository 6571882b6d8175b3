//! Scenario: a schema redeclares an existing column with an incompatible
//! type. The table's schema patch is abandoned (no delete permission), and
//! the record that no longer fits its old column exhausts its insert retry
//! budget instead of landing.
//!
//! # Invariant under test
//!
//! No new checkpoint is emitted, and the row count is unchanged from before
//! the run.

use std::io::Cursor;
use std::sync::Arc;

use serde_json::json;
use sink_engine::HybridEngine;
use sink_testkit::{InsertFault, MemoryWarehouseClient, SchemaUpdateFault};
use sink_warehouse::WarehouseClient;

#[tokio::test(start_paused = true)]
async fn incompatible_type_change_suppresses_checkpoint_and_leaves_row_count_unchanged() {
    let client = Arc::new(MemoryWarehouseClient::new());
    client
        .create_table(
            "ds",
            "fruitimals",
            &[sink_schema::Column {
                name: "id".to_string(),
                column_type: sink_schema::ColumnType::Integer,
                mode: sink_schema::ColumnMode::Nullable,
                description: None,
                fields: vec![],
            }],
        )
        .await
        .unwrap();
    client
        .insert_rows(
            "ds",
            "fruitimals",
            &[sink_warehouse::InsertRow {
                insert_id: Some("1".to_string()),
                row: json!({"id": 1}),
            }],
        )
        .await
        .unwrap();

    client
        .queue_schema_update_fault("ds", "fruitimals", SchemaUpdateFault::Incompatible)
        .await;
    for _ in 0..40 {
        client
            .queue_insert_fault(
                "ds",
                "fruitimals",
                InsertFault::RowRejected {
                    row_index: 0,
                    message: "Cannot convert value to integer".to_string(),
                },
            )
            .await;
    }

    let mut engine = HybridEngine::new(client.clone(), "ds", None, true, false);
    engine.ensure_dataset().await.unwrap();

    let mut input = String::new();
    input += &format!(
        "{}\n",
        json!({
            "type": "SCHEMA",
            "stream": "fruitimals",
            "schema": {"type": "object", "properties": {"id": {"type": "string"}}},
            "key_properties": ["id"],
        })
    );
    input += &format!(
        "{}\n",
        json!({"type": "STATE", "value": {"currently_syncing": "fruitimals", "version": 1}})
    );
    input += &format!("{}\n", json!({"type": "RECORD", "stream": "fruitimals", "record": {"id": "not-an-int"}}));
    input += &format!("{}\n", json!({"type": "STATE", "value": {"version": 2}}));

    let mut output = Vec::new();
    engine
        .run(Cursor::new(input.into_bytes()), &mut output)
        .await
        .unwrap();

    assert_eq!(engine.failed_lines().len(), 1);
    assert!(output.is_empty(), "checkpoint suppressed while a line is in failed_lines");
    assert_eq!(client.row_count("ds", "fruitimals").await, 1);
    assert_eq!(client.fields("ds", "fruitimals").await.unwrap().len(), 1);
}
