//! C vtable adapters: `FfiBusConnector` and `FfiPlugConnector` turn a
//! host-supplied table of `extern "C"` function pointers into
//! `isoch_transport::BusConnector` / `isoch_stream::PlugConnector`
//! implementations, so the platform driver side of the bus library
//! never has to be linked into this crate.
//!
//! Grounded on `IsochPortChannelManager`'s split between operations it
//! performs on the bus library and the peer callbacks it answers
//! (`isoch_transport::bus`'s module doc); here the "bus library" is
//! reached through function pointers instead of a linked-in C++ object.

use std::ffi::c_void;

use isoch_alloc::VirtualRange;
use isoch_core::Result;
use isoch_transport::{BusConnector, DescriptorProgram, Role};

use crate::error::code_to_result;

fn role_to_u8(role: Role) -> u8 {
    match role {
        Role::Talker => 0,
        Role::Listener => 1,
    }
}

/// Table of callbacks a host implementation of the platform bus library
/// supplies at stream-creation time. Every function receives `ctx` as
/// its first argument; ownership of `ctx` stays with the caller, who
/// must keep it alive for the handle's lifetime.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IsochBusVTable {
    pub attach_dispatchers: extern "C" fn(ctx: *mut c_void) -> i32,
    pub detach_dispatchers: extern "C" fn(ctx: *mut c_void),
    pub create_remote_port: extern "C" fn(ctx: *mut c_void, role: u8) -> i32,
    pub release_remote_port: extern "C" fn(ctx: *mut c_void),
    pub create_local_port:
        extern "C" fn(ctx: *mut c_void, cycles_per_segment: u32, num_segments: u32, buffer_address: usize, buffer_length: usize, role: u8) -> i32,
    pub release_local_port: extern "C" fn(ctx: *mut c_void),
    pub create_isoch_channel: extern "C" fn(ctx: *mut c_void, role: u8) -> i32,
    pub release_isoch_channel: extern "C" fn(ctx: *mut c_void),
    /// Writes `(node_id, generation)` through the out-pointers; returns
    /// a status code.
    pub local_node_id: extern "C" fn(ctx: *mut c_void, out_node_id: *mut u16, out_generation: *mut u32) -> i32,
    pub current_cycle_time: extern "C" fn(ctx: *mut c_void) -> u32,
    pub request_channel_start: extern "C" fn(ctx: *mut c_void) -> i32,
    pub request_channel_stop: extern "C" fn(ctx: *mut c_void) -> i32,
    pub notify_descriptors_filled: extern "C" fn(ctx: *mut c_void, indices: *const u32, count: u32),
    pub notify_jump_retargeted: extern "C" fn(ctx: *mut c_void, terminator_index: u32),
}

/// Owns the host's opaque `ctx` pointer alongside its vtable.
///
/// # Safety
/// The host guarantees `ctx` is valid for as long as the `Stream` built
/// on top of this connector is alive, and that every vtable function is
/// safe to call from the runloop/client threads `isoch_transport`
/// drives it from.
pub struct FfiBusConnector {
    vtable: IsochBusVTable,
    ctx: *mut c_void,
}

// SAFETY: the host's contract (see struct doc) requires `ctx` to be
// usable from whichever thread invokes these callbacks.
unsafe impl Send for FfiBusConnector {}

impl FfiBusConnector {
    pub fn new(vtable: IsochBusVTable, ctx: *mut c_void) -> Self {
        Self { vtable, ctx }
    }
}

impl BusConnector for FfiBusConnector {
    fn attach_dispatchers(&mut self) -> Result<()> {
        code_to_result((self.vtable.attach_dispatchers)(self.ctx))
    }

    fn detach_dispatchers(&mut self) {
        (self.vtable.detach_dispatchers)(self.ctx)
    }

    fn create_remote_port(&mut self, role: Role) -> Result<()> {
        code_to_result((self.vtable.create_remote_port)(self.ctx, role_to_u8(role)))
    }

    fn release_remote_port(&mut self) {
        (self.vtable.release_remote_port)(self.ctx)
    }

    fn create_local_port(&mut self, program: &DescriptorProgram, buffer_range: VirtualRange, role: Role) -> Result<()> {
        code_to_result((self.vtable.create_local_port)(
            self.ctx,
            program.cycles_per_segment(),
            program.num_segments(),
            buffer_range.address,
            buffer_range.length,
            role_to_u8(role),
        ))
    }

    fn release_local_port(&mut self) {
        (self.vtable.release_local_port)(self.ctx)
    }

    fn create_isoch_channel(&mut self, role: Role) -> Result<()> {
        code_to_result((self.vtable.create_isoch_channel)(self.ctx, role_to_u8(role)))
    }

    fn release_isoch_channel(&mut self) {
        (self.vtable.release_isoch_channel)(self.ctx)
    }

    fn local_node_id(&self) -> Result<(u16, u32)> {
        let mut node_id: u16 = 0;
        let mut generation: u32 = 0;
        code_to_result((self.vtable.local_node_id)(self.ctx, &mut node_id, &mut generation))?;
        Ok((node_id, generation))
    }

    fn current_cycle_time(&self) -> u32 {
        (self.vtable.current_cycle_time)(self.ctx)
    }

    fn request_channel_start(&mut self) -> Result<()> {
        code_to_result((self.vtable.request_channel_start)(self.ctx))
    }

    fn request_channel_stop(&mut self) -> Result<()> {
        code_to_result((self.vtable.request_channel_stop)(self.ctx))
    }

    fn notify_descriptors_filled(&mut self, indices: &[u32]) {
        (self.vtable.notify_descriptors_filled)(self.ctx, indices.as_ptr(), indices.len() as u32)
    }

    fn notify_jump_retargeted(&mut self, terminator_index: u32) {
        (self.vtable.notify_jump_retargeted)(self.ctx, terminator_index)
    }
}

/// Host-supplied plug connect/disconnect callbacks (`isoch_stream::plug::PlugConnector`).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IsochPlugVTable {
    pub connect_input_plug: extern "C" fn(ctx: *mut c_void) -> i32,
    pub connect_output_plug: extern "C" fn(ctx: *mut c_void) -> i32,
    pub disconnect_input_plug: extern "C" fn(ctx: *mut c_void) -> i32,
    pub disconnect_output_plug: extern "C" fn(ctx: *mut c_void) -> i32,
}

pub struct FfiPlugConnector {
    vtable: IsochPlugVTable,
    ctx: *mut c_void,
}

// SAFETY: see `FfiBusConnector`'s equivalent impl.
unsafe impl Send for FfiPlugConnector {}

impl FfiPlugConnector {
    pub fn new(vtable: IsochPlugVTable, ctx: *mut c_void) -> Self {
        Self { vtable, ctx }
    }
}

impl isoch_stream::PlugConnector for FfiPlugConnector {
    fn connect_input_plug(&mut self) -> Result<()> {
        code_to_result((self.vtable.connect_input_plug)(self.ctx))
    }

    fn connect_output_plug(&mut self) -> Result<()> {
        code_to_result((self.vtable.connect_output_plug)(self.ctx))
    }

    fn disconnect_input_plug(&mut self) -> Result<()> {
        code_to_result((self.vtable.disconnect_input_plug)(self.ctx))
    }

    fn disconnect_output_plug(&mut self) -> Result<()> {
        code_to_result((self.vtable.disconnect_output_plug)(self.ctx))
    }
}
