//! skysift-core: Pure framing + classification + tracking library.
//!
//! No async, no I/O — just algorithms. This crate is the shared core used by
//! `skysift-ingest` (TCP source aggregation) and downstream watchlist/API
//! collaborators. Bit-level Mode S decoding is consumed through the
//! [`codec::ModesCodec`] trait, never implemented here.

pub mod classify;
pub mod codec;
pub mod cpr;
pub mod store;
pub mod types;
pub mod wire;

// Re-export commonly used types at crate root
pub use classify::{Classifier, FrameCheck};
pub use codec::ModesCodec;
pub use cpr::{CprConfig, CprResolver, ResolvedPosition};
pub use store::{AircraftState, AircraftStore, Conflict, StoreConfig};
pub use types::*;
pub use wire::{Framer, WireFormat, WireFrame};
