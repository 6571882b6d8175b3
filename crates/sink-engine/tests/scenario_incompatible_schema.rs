//! Scenario: schema changes that the warehouse refuses to patch in place.
//!
//! # Invariants under test
//!
//! - *Incompatible, `can_delete_table = false`*: the update attempt is made
//!   and abandoned; existing rows and columns are untouched; the run still
//!   completes and emits state (the column mismatch isn't itself an
//!   insert-time error).
//! - *Incompatible, `can_delete_table = true`*: the table is dropped and
//!   recreated with the new schema.

use std::io::Cursor;
use std::sync::Arc;

use serde_json::json;
use sink_engine::HybridEngine;
use sink_testkit::{MemoryWarehouseClient, SchemaUpdateFault};
use sink_warehouse::WarehouseClient;

fn base_input() -> String {
    let mut input = String::new();
    input += &format!(
        "{}\n",
        json!({
            "type": "SCHEMA",
            "stream": "fruitimals",
            "schema": {"type": "object", "properties": {"id": {"type": "integer"}, "name": {"type": "string"}}},
            "key_properties": ["id"],
        })
    );
    input += &format!(
        "{}\n",
        json!({"type": "STATE", "value": {"currently_syncing": "fruitimals", "version": 1}})
    );
    input
}

#[tokio::test(start_paused = true)]
async fn incompatible_schema_without_delete_permission_leaves_table_untouched() {
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

    let mut engine = HybridEngine::new(client.clone(), "ds", None, true, false);
    engine.ensure_dataset().await.unwrap();

    let mut output = Vec::new();
    engine
        .run(Cursor::new(base_input().into_bytes()), &mut output)
        .await
        .unwrap();

    // No insert happened this run (no RECORD lines), so the run completes
    // and emits state even though the schema update was abandoned.
    assert!(engine.failed_lines().is_empty());
    assert!(!output.is_empty());

    let fields = client.fields("ds", "fruitimals").await.unwrap();
    assert_eq!(fields.len(), 1, "table keeps its old (narrower) column set");
    assert_eq!(client.row_count("ds", "fruitimals").await, 1);
}

#[tokio::test(start_paused = true)]
async fn incompatible_schema_with_delete_permission_recreates_table() {
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
        .queue_schema_update_fault("ds", "fruitimals", SchemaUpdateFault::Incompatible)
        .await;

    let mut engine = HybridEngine::new(client.clone(), "ds", None, true, true);
    engine.ensure_dataset().await.unwrap();

    let mut output = Vec::new();
    engine
        .run(Cursor::new(base_input().into_bytes()), &mut output)
        .await
        .unwrap();

    assert!(engine.failed_lines().is_empty());
    let fields = client.fields("ds", "fruitimals").await.unwrap();
    assert_eq!(fields.len(), 2, "table was recreated with the new (wider) schema");
}
