//! The ingestion engine: three mutually-exclusive driver modes over the
//! same newline-delimited protocol stream.
//!
//! [`HybridEngine`] (module [`engine`]) is the hard part and the subject of
//! this crate — streaming inserts with schema evolution, adaptive batch
//! slicing, and checkpoint emission gated on zero failed lines.
//! [`bulk_load::BulkLoadDriver`] and [`per_row::PerRowDriver`] are the two
//! minor variants selected when `replication_method` isn't `HYBRID`.

mod checkpoint;
mod error;
mod insert;
mod reconcile;
mod stream;
mod validate;

pub mod bulk_load;
pub mod engine;
pub mod per_row;

pub use checkpoint::emit as emit_checkpoint;
pub use engine::{FailedLine, HybridEngine};
pub use error::EngineError;
pub use reconcile::TABLE_CREATION_PAUSE;
