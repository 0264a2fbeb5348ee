//! # isoch_core
//!
//! Foundational mechanisms shared throughout the isoch audio engine
//! workspace: the error taxonomy, cache-line padding, and the generic
//! lock-free SPSC ring used for intra-process handoff.

pub mod cache;
pub mod error;
pub mod mlock;
pub mod spsc;

pub use cache::CachePadded;
pub use error::{Result, TransportError};
pub use mlock::lock_memory;
pub use spsc::{Consumer, Producer, SpscRing};
