//! `PortChannelManager` (`spec.md §4.4`): negotiates bus channel/speed
//! with the peer and owns the local/remote endpoint handles.
//!
//! Grounded on `IsochPortChannelManager.{hpp,cpp}`'s state machine and
//! its five peer callbacks (`get-supported`, `allocate`, `release`,
//! `start`, `stop`) plus a finalize callback. The `stateMutex_` the
//! original uses to serialize external callers is represented here by
//! requiring `&mut self` for every transition — callers provide their
//! own `Mutex<PortChannelManager>` exactly as `spec.md §4.4` describes
//! ("external callers serialize with an internal mutex").

use isoch_alloc::VirtualRange;
use isoch_core::{Result, TransportError};

use crate::bus::{BusConnector, ChannelRequest, Role, Speed, CHANNEL_MASK_ANY};
use crate::descriptor::DescriptorProgram;

/// `spec.md §4.4`'s state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortChannelState {
    Uninit,
    Initialized,
    Configured,
    PortOpen,
    ChannelOpen,
    Running,
    Stopping,
    Stopped,
    Finalized,
}

/// Single-threaded state machine over a `BusConnector`. Reachable from
/// one worker; external callers are expected to serialize access (e.g.
/// behind a `Mutex`), matching `spec.md §4.4`'s `stateMutex_`.
pub struct PortChannelManager<C: BusConnector> {
    connector: C,
    role: Role,
    state: PortChannelState,
    configured_speed: Speed,
    configured_channel: ChannelRequest,
    active_channel: Option<u32>,
    quarantined: bool,
}

impl<C: BusConnector> PortChannelManager<C> {
    pub fn new(connector: C, role: Role) -> Self {
        Self {
            connector,
            role,
            state: PortChannelState::Uninit,
            configured_speed: Speed::S400,
            configured_channel: ChannelRequest::Any,
            active_channel: None,
            quarantined: false,
        }
    }

    pub fn state(&self) -> PortChannelState {
        self.state
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined
    }

    /// `Uninit -> Initialized`: attach dispatchers and create the
    /// remote port proxy.
    pub fn initialize(&mut self) -> Result<()> {
        if self.state != PortChannelState::Uninit {
            return Err(TransportError::NotReady);
        }

        if let Err(e) = self.connector.attach_dispatchers() {
            return Err(e);
        }
        if let Err(e) = self.connector.create_remote_port(self.role) {
            self.connector.detach_dispatchers();
            return Err(e);
        }

        self.state = PortChannelState::Initialized;
        Ok(())
    }

    /// `Initialized -> Configured`: record desired speed/channel.
    /// `channel = ChannelRequest::Any` is permitted.
    pub fn configure(&mut self, speed: Speed, channel: ChannelRequest) -> Result<()> {
        if self.state != PortChannelState::Initialized {
            return Err(TransportError::NotReady);
        }
        self.configured_speed = speed;
        self.configured_channel = channel;
        self.state = PortChannelState::Configured;
        Ok(())
    }

    /// `Configured -> PortOpen -> ChannelOpen`: create the local port
    /// bound to `program`/`buffer_range`, then the isoch channel.
    pub fn setup_local_port_and_channel(&mut self, program: &DescriptorProgram, buffer_range: VirtualRange) -> Result<()> {
        if self.state != PortChannelState::Configured {
            return Err(TransportError::NotReady);
        }

        if let Err(e) = self.connector.create_local_port(program, buffer_range, self.role) {
            self.fail_to_stopped();
            return Err(e);
        }
        self.state = PortChannelState::PortOpen;

        if let Err(e) = self.connector.create_isoch_channel(self.role) {
            self.connector.release_local_port();
            self.fail_to_stopped();
            return Err(e);
        }
        self.state = PortChannelState::ChannelOpen;
        Ok(())
    }

    /// Answers the peer's `get-supported` callback: `max_speed` is
    /// always the configured speed; `channel_mask` has only the
    /// configured bit set, or `CHANNEL_MASK_ANY` if any channel is
    /// acceptable (`spec.md §4.4`).
    pub fn handle_peer_get_supported(&self) -> (Speed, u64) {
        let mask = match self.configured_channel {
            ChannelRequest::Any => CHANNEL_MASK_ANY,
            ChannelRequest::Specific(ch) => 1u64 << ch,
        };
        (self.configured_speed, mask)
    }

    /// The peer allocated the channel: record the negotiated channel
    /// number.
    pub fn handle_peer_allocate(&mut self, _speed: Speed, channel: u32) -> Result<()> {
        if self.state != PortChannelState::ChannelOpen && self.state != PortChannelState::Running {
            return Err(TransportError::NotReady);
        }
        self.active_channel = Some(channel);
        Ok(())
    }

    /// The peer signaled start: mark `Running`.
    pub fn handle_peer_start(&mut self) {
        self.state = PortChannelState::Running;
    }

    /// The peer signaled stop: mark `Stopping`.
    pub fn handle_peer_stop(&mut self) {
        self.state = PortChannelState::Stopping;
    }

    /// The finalize callback fired: mark `Finalized`.
    pub fn handle_finalize(&mut self) {
        self.state = PortChannelState::Finalized;
    }

    pub fn active_channel(&self) -> Option<u32> {
        self.active_channel
    }

    /// `(node_id, generation)`, retried by the caller on generation
    /// mismatch per `spec.md §4.5`/`§7`.
    pub fn local_node_id(&self) -> Result<(u16, u32)> {
        self.connector.local_node_id()
    }

    pub fn current_cycle_time(&self) -> u32 {
        self.connector.current_cycle_time()
    }

    pub fn request_start(&mut self) -> Result<()> {
        if self.state != PortChannelState::ChannelOpen {
            return Err(TransportError::NotReady);
        }
        self.connector.request_channel_start()
    }

    pub fn request_stop(&mut self) -> Result<()> {
        self.connector.request_channel_stop()
    }

    pub fn connector_mut(&mut self) -> &mut C {
        &mut self.connector
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    fn fail_to_stopped(&mut self) {
        self.connector.release_isoch_channel();
        self.connector.release_local_port();
        self.state = PortChannelState::Stopped;
    }

    /// Idempotent cleanup: release all handles in reverse creation
    /// order, dispatchers removed last (`spec.md §4.4`/§9` "reverse
    /// creation order", concretely: isoch channel, local port, remote
    /// port, dispatchers).
    pub fn reset(&mut self) {
        if self.state == PortChannelState::Uninit {
            return;
        }
        self.connector.release_isoch_channel();
        self.connector.release_local_port();
        self.connector.release_remote_port();
        self.connector.detach_dispatchers();
        self.active_channel = None;
        self.state = PortChannelState::Stopped;
    }

    /// Mark this manager quarantined (unrestartable) after a stop
    /// timeout (`spec.md §7`/`§8` S6).
    pub fn quarantine(&mut self) {
        self.quarantined = true;
        self.state = PortChannelState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackBusConnector;

    fn manager() -> PortChannelManager<LoopbackBusConnector> {
        PortChannelManager::new(LoopbackBusConnector::new(5, 0), Role::Talker)
    }

    #[test]
    fn happy_path_reaches_channel_open() {
        let mut mgr = manager();
        mgr.initialize().unwrap();
        mgr.configure(Speed::S400, ChannelRequest::Any).unwrap();

        let program = DescriptorProgram::build(8, 4).unwrap();
        let range = VirtualRange { address: 0x1000, length: 4096 };
        mgr.setup_local_port_and_channel(&program, range).unwrap();

        assert_eq!(mgr.state(), PortChannelState::ChannelOpen);
    }

    #[test]
    fn get_supported_any_channel_uses_wildcard_mask() {
        let mut mgr = manager();
        mgr.initialize().unwrap();
        mgr.configure(Speed::S800, ChannelRequest::Any).unwrap();

        let (speed, mask) = mgr.handle_peer_get_supported();
        assert_eq!(speed, Speed::S800);
        assert_eq!(mask, CHANNEL_MASK_ANY);
    }

    #[test]
    fn get_supported_specific_channel_masks_single_bit() {
        let mut mgr = manager();
        mgr.initialize().unwrap();
        mgr.configure(Speed::S400, ChannelRequest::Specific(7)).unwrap();

        let (_, mask) = mgr.handle_peer_get_supported();
        assert_eq!(mask, 1u64 << 7);
    }

    #[test]
    fn transitions_out_of_order_are_rejected() {
        let mut mgr = manager();
        assert_eq!(mgr.configure(Speed::S400, ChannelRequest::Any).unwrap_err(), TransportError::NotReady);

        let program = DescriptorProgram::build(8, 4).unwrap();
        let range = VirtualRange { address: 0, length: 0 };
        assert_eq!(mgr.setup_local_port_and_channel(&program, range).unwrap_err(), TransportError::NotReady);
    }

    #[test]
    fn peer_start_and_stop_update_state() {
        let mut mgr = manager();
        mgr.initialize().unwrap();
        mgr.configure(Speed::S400, ChannelRequest::Any).unwrap();
        let program = DescriptorProgram::build(8, 4).unwrap();
        mgr.setup_local_port_and_channel(&program, VirtualRange { address: 0x1000, length: 4096 }).unwrap();

        mgr.handle_peer_start();
        assert_eq!(mgr.state(), PortChannelState::Running);

        mgr.handle_peer_stop();
        assert_eq!(mgr.state(), PortChannelState::Stopping);

        mgr.handle_finalize();
        assert_eq!(mgr.state(), PortChannelState::Finalized);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut mgr = manager();
        mgr.initialize().unwrap();
        mgr.reset();
        assert_eq!(mgr.state(), PortChannelState::Stopped);
        mgr.reset();
        assert_eq!(mgr.state(), PortChannelState::Stopped);
    }

    #[test]
    fn reset_on_uninit_is_a_no_op() {
        let mut mgr = manager();
        mgr.reset();
        assert_eq!(mgr.state(), PortChannelState::Uninit);
    }

    #[test]
    fn quarantine_blocks_implicitly_via_flag() {
        let mut mgr = manager();
        mgr.quarantine();
        assert!(mgr.is_quarantined());
        assert_eq!(mgr.state(), PortChannelState::Stopped);
    }

    #[test]
    fn setup_failure_releases_partial_resources_and_lands_in_stopped() {
        struct FailingChannelConnector(LoopbackBusConnector);

        impl BusConnector for FailingChannelConnector {
            fn attach_dispatchers(&mut self) -> Result<()> {
                self.0.attach_dispatchers()
            }
            fn detach_dispatchers(&mut self) {
                self.0.detach_dispatchers()
            }
            fn create_remote_port(&mut self, role: Role) -> Result<()> {
                self.0.create_remote_port(role)
            }
            fn release_remote_port(&mut self) {
                self.0.release_remote_port()
            }
            fn create_local_port(&mut self, program: &DescriptorProgram, range: VirtualRange, role: Role) -> Result<()> {
                self.0.create_local_port(program, range, role)
            }
            fn release_local_port(&mut self) {
                self.0.release_local_port()
            }
            fn create_isoch_channel(&mut self, _role: Role) -> Result<()> {
                Err(TransportError::BusIO)
            }
            fn release_isoch_channel(&mut self) {
                self.0.release_isoch_channel()
            }
            fn local_node_id(&self) -> Result<(u16, u32)> {
                self.0.local_node_id()
            }
            fn current_cycle_time(&self) -> u32 {
                self.0.current_cycle_time()
            }
            fn request_channel_start(&mut self) -> Result<()> {
                self.0.request_channel_start()
            }
            fn request_channel_stop(&mut self) -> Result<()> {
                self.0.request_channel_stop()
            }
            fn notify_descriptors_filled(&mut self, indices: &[u32]) {
                self.0.notify_descriptors_filled(indices)
            }
            fn notify_jump_retargeted(&mut self, terminator_index: u32) {
                self.0.notify_jump_retargeted(terminator_index)
            }
        }

        let mut mgr = PortChannelManager::new(FailingChannelConnector(LoopbackBusConnector::new(1, 0)), Role::Listener);
        mgr.initialize().unwrap();
        mgr.configure(Speed::S400, ChannelRequest::Any).unwrap();

        let program = DescriptorProgram::build(8, 4).unwrap();
        let err = mgr.setup_local_port_and_channel(&program, VirtualRange { address: 0x1000, length: 4096 }).unwrap_err();
        assert_eq!(err, TransportError::BusIO);
        assert_eq!(mgr.state(), PortChannelState::Stopped);
    }
}
