//! Chain-state core: segment forest, header store, UTXO set, assembler.

pub mod assembler;
pub mod cache;
pub mod context;
pub mod error;
pub mod headers;
pub mod lock;
pub mod params;
pub mod pending;
pub mod segment;
pub mod utxo;

pub use error::ChainStateError;
pub use lock::{ChainLock, WriteToken};

/// Storage-assigned identifier for a stored header.
pub type HeaderId = u64;

/// Storage-assigned identifier for a blockchain segment.
pub type SegmentId = u64;
