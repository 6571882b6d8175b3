//! Loads the target's single JSON configuration file.
//!
//! Unlike a layered/merged config, this is just one file: `project_id` and
//! `dataset_id` are required, everything else has a documented default and
//! unrecognized keys are ignored rather than rejected, so operators can keep
//! extra fields (tap-specific settings, forward-compatible knobs) in the
//! same file without this crate choking on them.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// How records should be written to the warehouse. Mirrors the
/// `replication_method` / `stream_data` knobs in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMethod {
    /// Row-by-row streaming inserts with retry, schema reconciliation, and
    /// checkpointing. The only mode with at-least-once delivery guarantees.
    Hybrid,
    /// Row-by-row streaming inserts with none of the above: no retry, no
    /// dedup, no checkpoint emission. A thin, low-latency path for
    /// best-effort sinks.
    Stream,
    /// Buffer each stream to a scratch file and hand it to a bulk load job
    /// once input ends.
    BulkLoad { truncate: bool },
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    project_id: String,
    dataset_id: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    service_account_key_path: Option<String>,
    #[serde(default)]
    validate_records: Option<bool>,
    #[serde(default)]
    disable_collection: Option<bool>,
    #[serde(default, rename = "delete_table_on_incompatible_schema")]
    can_delete_table: Option<bool>,
    #[serde(default)]
    replication_method: Option<String>,
    #[serde(default)]
    stream_data: Option<bool>,
}

/// A loaded, validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_id: String,
    pub dataset_id: String,
    pub location: Option<String>,
    pub service_account_key_path: Option<String>,
    validate_records: Option<bool>,
    disable_collection: Option<bool>,
    can_delete_table: Option<bool>,
    replication_method: Option<String>,
    stream_data: Option<bool>,
}

impl Config {
    /// Whether every record should be validated against its stream's
    /// declared schema before being buffered. Defaults to `true`.
    pub fn validate_records(&self) -> bool {
        self.validate_records.unwrap_or(true)
    }

    /// Whether the one-time anonymous telemetry beacon is suppressed.
    /// Defaults to `false` (the beacon fires).
    pub fn disable_collection(&self) -> bool {
        self.disable_collection.unwrap_or(false)
    }

    /// Whether an incompatible schema change may be resolved by dropping and
    /// recreating the table, losing its data. Reads the `delete_table_on_incompatible_schema`
    /// config key. Defaults to `false`.
    pub fn can_delete_table(&self) -> bool {
        self.can_delete_table.unwrap_or(false)
    }

    /// The effective write strategy, reconstructed from
    /// `replication_method` / `stream_data` the same way the CLI entry
    /// point's dispatch logic reads them.
    pub fn replication_method(&self) -> ReplicationMethod {
        match self.replication_method.as_deref() {
            Some("HYBRID") => ReplicationMethod::Hybrid,
            other => {
                if self.stream_data.unwrap_or(true) {
                    ReplicationMethod::Stream
                } else {
                    ReplicationMethod::BulkLoad {
                        truncate: other == Some("FULL_TABLE"),
                    }
                }
            }
        }
    }
}

/// Read and validate the configuration file at `path`.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let raw: RawConfig = serde_json::from_str(&contents)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if raw.project_id.trim().is_empty() {
        anyhow::bail!("config field 'project_id' must not be empty");
    }
    if raw.dataset_id.trim().is_empty() {
        anyhow::bail!("config field 'dataset_id' must not be empty");
    }

    Ok(Config {
        project_id: raw.project_id,
        dataset_id: raw.dataset_id,
        location: raw.location,
        service_account_key_path: raw.service_account_key_path,
        validate_records: raw.validate_records,
        disable_collection: raw.disable_collection,
        can_delete_table: raw.can_delete_table,
        replication_method: raw.replication_method,
        stream_data: raw.stream_data,
    })
}
