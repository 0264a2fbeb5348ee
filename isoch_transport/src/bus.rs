//! Bus connector seam (`spec.md §9`: "Plug-connection via platform
//! bus-library handles: abstract behind a `BusConnector` trait; real and
//! mock implementations interchangeable.").
//!
//! Grounded on `IsochPortChannelManager`'s split between the operations
//! it performs on the bus library (`initialize`, `setupLocalPortAndChannel`,
//! `createRemotePort`, `reset`, ...) and the peer callbacks it answers.
//! `PortChannelManager` (`port_channel.rs`) drives a `BusConnector`; it
//! never talks to a platform API directly.

use isoch_alloc::VirtualRange;
use isoch_core::{Result, TransportError};

use crate::descriptor::DescriptorProgram;

/// Talker (produces packets) or Listener (consumes packets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Talker,
    Listener,
}

/// Bus speed. Only the ordering matters to this crate; the concrete
/// mapping to wire-level speed codes is a `BusConnector` implementation
/// detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Speed {
    S100,
    S200,
    S400,
    S800,
}

/// A channel request: a specific channel number, or "any available".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRequest {
    Any,
    Specific(u32),
}

/// Sentinel channel mask bit pattern for "any channel but 0" (`spec.md
/// §4.4`'s `~1ULL`), mirrored here for `BusConnector` implementations
/// that need to answer `get_supported`.
pub const CHANNEL_MASK_ANY: u64 = !1u64;

/// Operations `PortChannelManager` needs from the platform bus library.
///
/// Implementors own the real port/channel/dispatcher handles; this trait
/// is the capability interface passed in at construction per `spec.md
/// §9`'s redesign note, removing the owner back-pointer the original
/// `IOFireWireLib` wrapper needed.
pub trait BusConnector: Send {
    /// Attach the bus library's runloop dispatchers. Idempotent.
    fn attach_dispatchers(&mut self) -> Result<()>;
    /// Detach the dispatchers. Called last during `reset()`.
    fn detach_dispatchers(&mut self);

    /// Create the remote (peer) port proxy for `role`.
    fn create_remote_port(&mut self, role: Role) -> Result<()>;
    fn release_remote_port(&mut self);

    /// Create the local port bound to `program`'s descriptor ring and
    /// `buffer_range`, attached as talker or listener per `role`.
    fn create_local_port(&mut self, program: &DescriptorProgram, buffer_range: VirtualRange, role: Role) -> Result<()>;
    fn release_local_port(&mut self);

    fn create_isoch_channel(&mut self, role: Role) -> Result<()>;
    fn release_isoch_channel(&mut self);

    /// `(node_id, bus_generation)`.
    fn local_node_id(&self) -> Result<(u16, u32)>;

    /// Current FireWire cycle-time register value, opaque-encoded per
    /// `spec.md §4.2`'s `initialize(fireWireCycleTime)`.
    fn current_cycle_time(&self) -> u32;

    fn request_channel_start(&mut self) -> Result<()>;
    fn request_channel_stop(&mut self) -> Result<()>;

    /// Notify the bus library that descriptors at `indices` were
    /// refilled. Callers batch this in groups of at most 10 per
    /// `spec.md §4.3`.
    fn notify_descriptors_filled(&mut self, indices: &[u32]);
    /// Notify the bus library that `terminator_index`'s jump target changed.
    fn notify_jump_retargeted(&mut self, terminator_index: u32);
}

/// Outcome of an in-process `LoopbackBusConnector` peer simulation: the
/// peer acks every request synchronously rather than via an async
/// callback, which is adequate for exercising `PortChannelManager`'s
/// state machine without a real device.
pub struct LoopbackBusConnector {
    node_id: u16,
    generation: u32,
    cycle_time: u32,
    dispatchers_attached: bool,
    remote_port: bool,
    local_port: bool,
    isoch_channel: bool,
    notified_descriptor_batches: Vec<Vec<u32>>,
    notified_jumps: Vec<u32>,
}

impl LoopbackBusConnector {
    pub fn new(node_id: u16, generation: u32) -> Self {
        Self {
            node_id,
            generation,
            cycle_time: 0,
            dispatchers_attached: false,
            remote_port: false,
            local_port: false,
            isoch_channel: false,
            notified_descriptor_batches: Vec::new(),
            notified_jumps: Vec::new(),
        }
    }

    pub fn set_cycle_time(&mut self, cycle_time: u32) {
        self.cycle_time = cycle_time;
    }

    pub fn bump_generation(&mut self) {
        self.generation += 1;
    }

    pub fn notified_descriptor_batches(&self) -> &[Vec<u32>] {
        &self.notified_descriptor_batches
    }

    pub fn notified_jumps(&self) -> &[u32] {
        &self.notified_jumps
    }
}

impl BusConnector for LoopbackBusConnector {
    fn attach_dispatchers(&mut self) -> Result<()> {
        self.dispatchers_attached = true;
        Ok(())
    }

    fn detach_dispatchers(&mut self) {
        self.dispatchers_attached = false;
    }

    fn create_remote_port(&mut self, _role: Role) -> Result<()> {
        self.remote_port = true;
        Ok(())
    }

    fn release_remote_port(&mut self) {
        self.remote_port = false;
    }

    fn create_local_port(&mut self, _program: &DescriptorProgram, _buffer_range: VirtualRange, _role: Role) -> Result<()> {
        self.local_port = true;
        Ok(())
    }

    fn release_local_port(&mut self) {
        self.local_port = false;
    }

    fn create_isoch_channel(&mut self, _role: Role) -> Result<()> {
        if !self.remote_port || !self.local_port {
            return Err(TransportError::NotReady);
        }
        self.isoch_channel = true;
        Ok(())
    }

    fn release_isoch_channel(&mut self) {
        self.isoch_channel = false;
    }

    fn local_node_id(&self) -> Result<(u16, u32)> {
        Ok((self.node_id, self.generation))
    }

    fn current_cycle_time(&self) -> u32 {
        self.cycle_time
    }

    fn request_channel_start(&mut self) -> Result<()> {
        if !self.isoch_channel {
            return Err(TransportError::NotReady);
        }
        Ok(())
    }

    fn request_channel_stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn notify_descriptors_filled(&mut self, indices: &[u32]) {
        debug_assert!(indices.len() <= 10, "descriptor notification batches must be <= 10");
        self.notified_descriptor_batches.push(indices.to_vec());
    }

    fn notify_jump_retargeted(&mut self, terminator_index: u32) {
        self.notified_jumps.push(terminator_index);
    }
}
