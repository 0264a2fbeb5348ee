//! `DescriptorProgram` (`spec.md §4.3`): a ring of `cyclesPerSegment *
//! numSegments` packet descriptors plus one overrun-sentinel descriptor.
//!
//! Grounded on `TransmitterComponents.cpp`/`AmdtpTransmitter.cpp`'s NuDCL
//! program: a closed ring where descriptor *i* jumps to *i+1*, segment
//! terminators carry the per-segment completion callback, and the
//! overrun sentinel is reached only when hardware outruns the program.

use isoch_core::{Result, TransportError};

use crate::bus::BusConnector;

/// Maximum descriptors notified to the bus library in one batch
/// (`spec.md §4.3`).
pub const MAX_NOTIFY_BATCH: usize = 10;

/// One of a descriptor's pointer ranges: `{cipHeaderAddr, 8}` or
/// `{payloadAddr, payloadLen}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRange {
    pub address: usize,
    pub length: usize,
}

/// A single per-cycle packet descriptor.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// Either `[cipHeader]` (no-data) or `[cipHeader, payload]` (data).
    ranges: Vec<PacketRange>,
    /// Index of the descriptor this one jumps to after hardware fetch.
    jump_target: u32,
    /// Whether this descriptor is the last of its segment and therefore
    /// carries the per-segment completion callback.
    is_segment_terminator: bool,
}

impl Descriptor {
    fn empty(jump_target: u32, is_segment_terminator: bool) -> Self {
        Self { ranges: Vec::with_capacity(2), jump_target, is_segment_terminator }
    }

    /// Exactly 1 (no-data) or 2 (data) once filled; 0 before the first fill.
    pub fn num_ranges(&self) -> usize {
        self.ranges.len()
    }

    pub fn ranges(&self) -> &[PacketRange] {
        &self.ranges
    }

    pub fn jump_target(&self) -> u32 {
        self.jump_target
    }

    pub fn is_segment_terminator(&self) -> bool {
        self.is_segment_terminator
    }
}

/// `DescriptorProgram`'s owner is notified of segment completion and of
/// hardware overrun (`spec.md §9`: trait replacing the C-style callback
/// with `void* refCon`).
pub trait SegmentCompletionSink: Send {
    /// The segment whose descriptors the hardware just finished
    /// fetching; fires from the runloop thread, never re-entrantly.
    fn on_segment_complete(&mut self, segment: u32);
    /// The hardware reached the overrun sentinel.
    fn on_overrun(&mut self);
}

/// A ring of `cycles_per_segment * num_segments` send/receive
/// descriptors, plus one overrun sentinel.
pub struct DescriptorProgram {
    descriptors: Vec<Descriptor>,
    cycles_per_segment: u32,
    num_segments: u32,
    /// Index of the overrun sentinel, `descriptors.len() - 1`.
    overrun_sentinel: u32,
}

impl DescriptorProgram {
    /// Build the ring. Every descriptor starts with an empty range list;
    /// descriptor *i* jumps to *i+1*, wrapping the last descriptor of the
    /// last segment back to descriptor 0. The overrun sentinel is
    /// reachable only via the hardware's own fault path, never via a
    /// normal jump target.
    pub fn build(cycles_per_segment: u32, num_segments: u32) -> Result<Self> {
        if cycles_per_segment == 0 || num_segments == 0 {
            return Err(TransportError::BadArgument);
        }

        let total_cycles = cycles_per_segment * num_segments;
        let mut descriptors = Vec::with_capacity(total_cycles as usize + 1);

        for i in 0..total_cycles {
            let is_terminator = (i + 1) % cycles_per_segment == 0;
            let jump_target = if i + 1 == total_cycles { 0 } else { i + 1 };
            descriptors.push(Descriptor::empty(jump_target, is_terminator));
        }

        // Overrun sentinel: branch-reached only when hardware outruns
        // the program; its own jump target loops back to itself so a
        // program dump never shows it pointing at live data descriptors.
        let overrun_sentinel = total_cycles;
        descriptors.push(Descriptor::empty(overrun_sentinel, false));

        Ok(Self { descriptors, cycles_per_segment, num_segments, overrun_sentinel })
    }

    pub fn cycles_per_segment(&self) -> u32 {
        self.cycles_per_segment
    }

    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    pub fn total_cycles(&self) -> u32 {
        self.cycles_per_segment * self.num_segments
    }

    pub fn descriptor(&self, index: u32) -> &Descriptor {
        &self.descriptors[index as usize]
    }

    /// First descriptor index of `segment`.
    pub fn segment_start(&self, segment: u32) -> u32 {
        segment * self.cycles_per_segment
    }

    /// Terminator (last) descriptor index of `segment`.
    pub fn segment_terminator(&self, segment: u32) -> u32 {
        self.segment_start(segment) + self.cycles_per_segment - 1
    }

    /// Set descriptor `index`'s range list to a no-data packet
    /// (`[{cip_header_addr, 8}]`) or a data packet
    /// (`[{cip_header_addr, 8}, {payload_addr, payload_len}]`).
    pub fn fill_cycle(&mut self, index: u32, cip_header_addr: usize, payload: Option<(usize, usize)>) -> Result<()> {
        let descriptor = self.descriptors.get_mut(index as usize).ok_or(TransportError::BadArgument)?;
        descriptor.ranges.clear();
        descriptor.ranges.push(PacketRange { address: cip_header_addr, length: 8 });
        if let Some((payload_addr, payload_len)) = payload {
            descriptor.ranges.push(PacketRange { address: payload_addr, length: payload_len });
        }
        Ok(())
    }

    /// Re-target `just_completed_seg`'s predecessor segment's terminator
    /// to jump into the first descriptor of `just_completed_seg`, now
    /// that it has been refilled. Must be called after refilling.
    /// Notifies `connector` in batches of at most `MAX_NOTIFY_BATCH`,
    /// followed by a single jump notification on the retargeted
    /// terminator.
    pub fn stitch_segment_jump(&mut self, just_completed_seg: u32, connector: &mut dyn BusConnector) {
        let predecessor = if just_completed_seg == 0 { self.num_segments - 1 } else { just_completed_seg - 1 };
        let predecessor_terminator = self.segment_terminator(predecessor);
        let new_target = self.segment_start(just_completed_seg);

        self.descriptors[predecessor_terminator as usize].jump_target = new_target;

        let start = self.segment_start(just_completed_seg);
        let end = start + self.cycles_per_segment;
        let indices: Vec<u32> = (start..end).collect();
        for batch in indices.chunks(MAX_NOTIFY_BATCH) {
            connector.notify_descriptors_filled(batch);
        }
        connector.notify_jump_retargeted(predecessor_terminator);
    }

    /// The hardware outran the program: surface `Overrun` to `sink`.
    pub fn handle_overrun(&self, sink: &mut dyn SegmentCompletionSink) {
        sink.on_overrun();
    }

    pub fn overrun_sentinel(&self) -> u32 {
        self.overrun_sentinel
    }
}
