//! # isoch_stream
//!
//! The outward `Stream` object (`spec.md §4.8`): combines buffer
//! allocation, the transport engine, plug connect/disconnect, and the
//! role-specific background threads (shared-memory reader for a talker,
//! processing worker for a listener) behind one handle.
//!
//! Grounded on `AudioDeviceStream.cpp`.

pub mod message;
pub mod payload_source;
pub mod plug;
pub mod segment_sink;
pub mod stream;

pub use message::{MessageCallback, MessageCode};
pub use payload_source::{relay_channel, RelayPayloadSource, RELAY_CAPACITY};
pub use plug::{LoopbackPlugConnector, PlugConnector};
pub use segment_sink::HandoffSegmentSink;
pub use stream::Stream;
