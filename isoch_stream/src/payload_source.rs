//! Talker payload plumbing: the shared-memory reader thread slices
//! client-pushed audio into fixed per-cycle packets and relays them,
//! intra-process, to the runloop thread's `PacketPayloadSource`.
//!
//! Grounded on `AudioDeviceStream.cpp`'s transmit path, which drains a
//! ring of client-provided chunks into the CIP payload region one cycle
//! at a time; `isoch_core::SpscRing` replaces the original's direct
//! pointer hand-off with the redesigned intra-process channel named in
//! `spec.md §9`.

use isoch_core::spsc::{Consumer, Producer, SpscRing};
use isoch_transport::PacketPayloadSource;

/// Capacity (in packets) of the intra-process relay between the
/// shared-memory reader thread and the runloop thread.
pub const RELAY_CAPACITY: usize = 64;

/// Builds the `(Producer, Consumer)` pair feeding one talker `Stream`.
pub fn relay_channel() -> (Producer<Box<[u8]>>, Consumer<Box<[u8]>>) {
    SpscRing::new(RELAY_CAPACITY)
}

/// The runloop-thread side: `TransportEngine::new_talker`'s
/// `PacketPayloadSource`. Never blocks; an empty relay produces a
/// no-data cycle, matching `spec.md §7`'s "reader thread retries
/// indefinitely on a false return" (the *reader* side retries pushing
/// into the relay, not this side).
pub struct RelayPayloadSource {
    consumer: Consumer<Box<[u8]>>,
}

impl RelayPayloadSource {
    pub fn new(consumer: Consumer<Box<[u8]>>) -> Self {
        Self { consumer }
    }
}

impl PacketPayloadSource for RelayPayloadSource {
    fn next_payload(&mut self, buf: &mut [u8]) -> bool {
        match self.consumer.try_pop() {
            Some(packet) if packet.len() == buf.len() => {
                buf.copy_from_slice(&packet);
                true
            }
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_relay_reports_no_data() {
        let (_producer, consumer) = relay_channel();
        let mut source = RelayPayloadSource::new(consumer);
        let mut buf = [0u8; 8];
        assert!(!source.next_payload(&mut buf));
    }

    #[test]
    fn relayed_packet_is_copied_into_buf() {
        let (mut producer, consumer) = relay_channel();
        producer.try_push(vec![1, 2, 3, 4].into_boxed_slice()).unwrap();

        let mut source = RelayPayloadSource::new(consumer);
        let mut buf = [0u8; 4];
        assert!(source.next_payload(&mut buf));
        assert_eq!(buf, [1, 2, 3, 4]);
    }
}
