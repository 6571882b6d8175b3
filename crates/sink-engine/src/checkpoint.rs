//! Checkpoint emission: writing the most recently accepted `STATE` value
//! back to the upstream extractor.
//!
//! The gate that makes this at-least-once rather than at-most-once lives
//! entirely in the caller (the driver modules): this module only knows how
//! to serialize and flush. It never decides *whether* a checkpoint is safe
//! to emit.

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Write `<JSON(value)>\n` to `out` and flush it immediately. Each call is
/// one line of the output protocol.
pub async fn emit(out: &mut (impl AsyncWrite + Unpin), value: &Value) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(value).expect("Value always serializes");
    line.push(b'\n');
    out.write_all(&line).await?;
    out.flush().await
}
