//! # isoch_transport
//!
//! The isochronous transport engine (`spec.md §4.3`-`§4.5`): a ring of
//! preallocated per-cycle packet descriptors programmed in advance,
//! driven by completion callbacks, with segment-granular re-arming and
//! jump-target stitching; the port/channel negotiation state machine
//! that owns the local/remote endpoint handles; and the engine that
//! binds the two together.
//!
//! Grounded on `IsochPortChannelManager.{hpp,cpp}`, `AmdtpTransmitter.cpp`,
//! `TransmitterComponents.cpp`, and `AudioDeviceStream.cpp`. The
//! `BusConnector`, `SegmentCompletionSink`, and `Clock` trait seams
//! follow `spec.md §9`'s redesign guidance, replacing the original's
//! owner back-pointers and C-style `refCon` callbacks.

pub mod bus;
pub mod clock;
pub mod descriptor;
pub mod engine;
pub mod port_channel;

pub use bus::{BusConnector, ChannelRequest, LoopbackBusConnector, Role, Speed, CHANNEL_MASK_ANY};
pub use clock::{Clock, ManualClock, SystemClock};
pub use descriptor::{Descriptor, DescriptorProgram, PacketRange, SegmentCompletionSink, MAX_NOTIFY_BATCH};
pub use engine::{EngineBuffers, EngineMessage, PacketPayloadSource, TransportEngine, CYCLES_PER_WRAP};
pub use port_channel::{PortChannelManager, PortChannelState};
