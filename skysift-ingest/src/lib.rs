//! skysift-ingest: TCP source aggregation and the decode/track pipeline.
//!
//! Owns the async side of skysift: per-source reader tasks with bounded
//! reconnect backoff, a deduplicating aggregator cycle, and the pipeline
//! that feeds decoded messages into the aircraft store. The bit-level
//! decode capability is injected via [`skysift_core::codec::ModesCodec`];
//! the daemon/CLI, watchlist engine, and HTTP surface live downstream of
//! [`pipeline::TrackerHandle`].

use thiserror::Error;

pub mod aggregator;
pub mod pipeline;
pub mod source;

// Re-export commonly used types at crate root
pub use aggregator::{AggregatorConfig, AggregatorStats, Batch, BatchQueue, SourceAggregator};
pub use pipeline::{Pipeline, PipelineConfig, StatsSnapshot, TrackerHandle};
pub use source::{ReconnectConfig, SourceConfig, SourceConnection, SourceHealth, SourceState};

/// Errors produced by the ingestion edge. Connection-level failures are not
/// here: they are handled inside the source tasks (backoff, park, retry) and
/// surface only as health state and counters.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("source registry full: capacity {0}")]
    RegistryFull(usize),
    #[error("aggregator already started")]
    AlreadyStarted,
    #[error("shutdown timed out")]
    ShutdownTimeout,
}
