//! `Stream`, the front object of `spec.md §4.8`: one direction, one bus
//! plug number, combining `BufferAllocator`, `DescriptorProgram` (via
//! `TransportEngine`), `PortChannelManager`, plug connect/disconnect,
//! and — depending on role — the shared-memory reader thread (talker)
//! or the double-buffer processing worker (listener).
//!
//! Grounded on `AudioDeviceStream.cpp`, which plays the same combining
//! role over the original's equivalent pieces, and on `bbx_player`'s
//! `Backend`/`PlayHandle` pattern for the owning-handle-over-a-
//! background-thread shape.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use isoch_alloc::BufferAllocator;
use isoch_cip::SampleRate;
use isoch_core::{Result, TransportError};
use isoch_shm::{ShmConsumer, ShmProducer, ShmRing, ShmTimeStamp, DEFAULT_RING_CAPACITY};
use isoch_transport::{
    BusConnector, ChannelRequest, EngineBuffers, EngineMessage, PacketPayloadSource, PortChannelState,
    SegmentCompletionSink, Speed, TransportEngine,
};
use isoch_worker::{DoubleBufferHandoff, NotifyHandle, PacketSink, ProcessingWorker};

use crate::message::{MessageCallback, MessageCode};
use crate::payload_source::{relay_channel, RelayPayloadSource};
use crate::plug::PlugConnector;
use crate::segment_sink::HandoffSegmentSink;

/// One FireWire cycle's nominal duration.
const CYCLE_DURATION: Duration = Duration::from_micros(125);

/// Bytes per audio channel quadlet (AM824 framing), matching
/// `isoch_alloc::BYTES_PER_CHANNEL_QUADLET`.
const BYTES_PER_CHANNEL_QUADLET: usize = 4;

struct NullSink {
    overruns: Arc<AtomicU32>,
}

impl SegmentCompletionSink for NullSink {
    fn on_segment_complete(&mut self, _segment: u32) {}
    fn on_overrun(&mut self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }
}

struct TalkerState {
    shm_producer: ShmProducer,
    shm_consumer: Option<ShmConsumer>,
    relay_producer: Option<isoch_core::spsc::Producer<Box<[u8]>>>,
    reader_running: Arc<AtomicBool>,
    reader_handle: Option<JoinHandle<()>>,
    bytes_per_frame: usize,
    push_seed: u32,
}

struct ListenerState {
    handoff: Arc<DoubleBufferHandoff>,
    packet_callback: Option<Box<dyn PacketSink>>,
    worker: Option<ProcessingWorker>,
}

enum RoleState {
    Talker(TalkerState),
    Listener(ListenerState),
}

/// Combines the transport stack for one direction and one bus plug
/// number (`spec.md §4.8`).
pub struct Stream<C: BusConnector, P: PlugConnector> {
    engine: Arc<Mutex<TransportEngine<C>>>,
    plug: P,
    plug_connected: bool,
    _allocator: BufferAllocator,
    cycles_per_segment: u32,
    num_segments: u32,
    payload_base: usize,
    timestamps_base: usize,
    payload_stride: usize,
    message_callback: Arc<Mutex<Option<MessageCallback>>>,
    overruns: Arc<AtomicU32>,
    runloop: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
    role_state: RoleState,
    memory_lock_warning: bool,
}

impl<C: BusConnector + 'static, P: PlugConnector> Stream<C, P> {
    /// Builds a talker `Stream`: pushes audio pulled from `plug`'s peer
    /// out onto the bus. `dbs_quadlets` is the CIP `DBS` field
    /// (quadlets per data block, typically the channel count).
    #[allow(clippy::too_many_arguments)]
    pub fn new_talker(
        connector: C,
        plug: P,
        clock: Arc<dyn isoch_transport::Clock>,
        cycles_per_segment: u32,
        num_segments: u32,
        channels: usize,
        sample_rate: SampleRate,
        blocks_per_packet: u8,
        dbs_quadlets: u8,
    ) -> Result<Self> {
        let total_cycles = (cycles_per_segment as usize) * (num_segments as usize);
        let allocator = BufferAllocator::new(total_cycles, channels, None)?;
        let payload_stride = channels * BYTES_PER_CHANNEL_QUADLET;

        let program = isoch_transport::DescriptorProgram::build(cycles_per_segment, num_segments)?;
        let port_channel = isoch_transport::PortChannelManager::new(connector, isoch_transport::Role::Talker);

        let payload_base = allocator.client_ptr() as usize;
        let timestamps_base = allocator.timestamps_ptr() as usize;
        let buffers = EngineBuffers {
            cip_headers_base: allocator.cip_headers_ptr() as usize,
            timestamps_base,
            payload_base,
            payload_stride,
        };

        let (relay_producer, relay_consumer) = relay_channel();
        let source: Box<dyn PacketPayloadSource> = Box::new(RelayPayloadSource::new(relay_consumer));

        let mut engine =
            TransportEngine::new_talker(program, port_channel, clock, buffers, sample_rate, blocks_per_packet, dbs_quadlets, source);
        engine.initialize()?;

        let (shm_producer, shm_consumer) = ShmRing::create(DEFAULT_RING_CAPACITY)?;

        Ok(Self {
            engine: Arc::new(Mutex::new(engine)),
            plug,
            plug_connected: false,
            payload_base,
            timestamps_base,
            payload_stride,
            cycles_per_segment,
            num_segments,
            _allocator: allocator,
            message_callback: Arc::new(Mutex::new(None)),
            overruns: Arc::new(AtomicU32::new(0)),
            runloop: None,
            memory_lock_warning: false,
            role_state: RoleState::Talker(TalkerState {
                shm_producer,
                shm_consumer: Some(shm_consumer),
                relay_producer: Some(relay_producer),
                reader_running: Arc::new(AtomicBool::new(false)),
                reader_handle: None,
                bytes_per_frame: payload_stride,
                push_seed: 0,
            }),
        })
    }

    /// Builds a listener `Stream`: pulls audio in from the bus and hands
    /// it to the client's packet callback via a background processing
    /// worker.
    pub fn new_listener(
        connector: C,
        plug: P,
        clock: Arc<dyn isoch_transport::Clock>,
        cycles_per_segment: u32,
        num_segments: u32,
        channels: usize,
    ) -> Result<Self> {
        let total_cycles = (cycles_per_segment as usize) * (num_segments as usize);
        let allocator = BufferAllocator::new(total_cycles, channels, None)?;
        let payload_stride = channels * BYTES_PER_CHANNEL_QUADLET;

        let program = isoch_transport::DescriptorProgram::build(cycles_per_segment, num_segments)?;
        let port_channel = isoch_transport::PortChannelManager::new(connector, isoch_transport::Role::Listener);

        let payload_base = allocator.client_ptr() as usize;
        let timestamps_base = allocator.timestamps_ptr() as usize;
        let buffers = EngineBuffers {
            cip_headers_base: allocator.cip_headers_ptr() as usize,
            timestamps_base,
            payload_base,
            payload_stride,
        };

        let mut engine = TransportEngine::new_listener(program, port_channel, clock, buffers);
        engine.initialize()?;

        let segment_size = cycles_per_segment as usize * payload_stride;
        let handoff = Arc::new(DoubleBufferHandoff::new(num_segments, segment_size));

        Ok(Self {
            engine: Arc::new(Mutex::new(engine)),
            plug,
            plug_connected: false,
            payload_base,
            timestamps_base,
            payload_stride,
            cycles_per_segment,
            num_segments,
            _allocator: allocator,
            message_callback: Arc::new(Mutex::new(None)),
            overruns: Arc::new(AtomicU32::new(0)),
            runloop: None,
            memory_lock_warning: false,
            role_state: RoleState::Listener(ListenerState { handoff, packet_callback: None, worker: None }),
        })
    }

    pub fn role(&self) -> isoch_transport::Role {
        self.engine.lock().unwrap().role()
    }

    pub fn is_running(&self) -> bool {
        self.runloop.is_some()
    }

    pub fn overrun_count(&self) -> u32 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// `true` if the best-effort page lock taken at `start()` failed for
    /// any region. Never fatal (`spec.md §5`/`§9`); callers may surface
    /// this however they see fit.
    pub fn memory_lock_warning(&self) -> bool {
        self.memory_lock_warning
    }

    pub fn set_message_callback(&mut self, callback: MessageCallback) {
        *self.message_callback.lock().unwrap() = Some(callback);
    }

    /// Only meaningful for a listener `Stream`; ignored for a talker.
    pub fn set_packet_callback(&mut self, callback: Box<dyn PacketSink>) {
        if let RoleState::Listener(listener) = &mut self.role_state {
            listener.packet_callback = Some(callback);
        }
    }

    /// `Initialized -> Configured`.
    pub fn configure(&mut self, speed: Speed, channel: ChannelRequest) -> Result<()> {
        self.engine.lock().unwrap().configure(speed, channel)
    }

    /// Idempotent (`spec.md §8` property 7): the second call succeeds
    /// without re-invoking the peer-side helper.
    pub fn connect_plug(&mut self) -> Result<()> {
        if self.plug_connected {
            return Ok(());
        }
        let result = match self.role() {
            isoch_transport::Role::Talker => self.plug.connect_input_plug(),
            isoch_transport::Role::Listener => self.plug.connect_output_plug(),
        };
        if result.is_ok() {
            self.plug_connected = true;
        }
        result
    }

    pub fn disconnect_plug(&mut self) -> Result<()> {
        if !self.plug_connected {
            return Ok(());
        }
        let result = match self.role() {
            isoch_transport::Role::Talker => self.plug.disconnect_input_plug(),
            isoch_transport::Role::Listener => self.plug.disconnect_output_plug(),
        };
        if result.is_ok() {
            self.plug_connected = false;
        }
        result
    }

    fn dispatch(&self, code: MessageCode, param1: u32, param2: u32) {
        if let Some(cb) = self.message_callback.lock().unwrap().as_mut() {
            cb(code, param1, param2);
        }
    }

    /// `Configured -> ... -> Running`: opens the local port/channel,
    /// requests the channel start, and spins up the reader/worker and
    /// runloop-driver threads.
    pub fn start(&mut self) -> Result<()> {
        {
            let mut engine = self.engine.lock().unwrap();
            let range = self._allocator.dma_range();
            engine.setup(range)?;
            engine.start()?;
        }

        // Best-effort, after every allocation is in place (`spec.md §5`/
        // `§9`); a failure is only ever a warning.
        let mut locked = self._allocator.lock_in_memory();
        if let RoleState::Talker(talker) = &self.role_state {
            locked &= talker.shm_producer.lock_in_memory();
        }
        self.memory_lock_warning = !locked;
        if self.memory_lock_warning {
            eprintln!("isoch_stream: failed to lock transport buffers into physical memory");
        }

        self.dispatch(MessageCode::AllocateIsochPort, 0, 0);

        match &mut self.role_state {
            RoleState::Talker(talker) => {
                let consumer = talker.shm_consumer.take().expect("reader already started");
                let producer = talker.relay_producer.take().expect("reader already started");
                let running = Arc::clone(&talker.reader_running);
                running.store(true, Ordering::Relaxed);
                let mut consumer = consumer;
                let mut producer = producer;
                let handle = thread::spawn(move || {
                    consumer.run_reader_loop(&running, move |slice: &[u8]| producer.try_push(slice.to_vec().into_boxed_slice()).is_ok());
                });
                talker.reader_handle = Some(handle);
            }
            RoleState::Listener(listener) => {
                let sink: Box<dyn PacketSink> = listener.packet_callback.take().unwrap_or_else(|| Box::new(|_: u32, _: &[u8], _: u32| {}));
                listener.worker = Some(ProcessingWorker::start(Arc::clone(&listener.handoff), sink));
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        let engine_handle = Arc::clone(&self.engine);
        let message_callback = Arc::clone(&self.message_callback);
        let overruns = Arc::clone(&self.overruns);
        let num_segments = self.num_segments;
        let cycles_per_segment = self.cycles_per_segment;
        let segment_duration = CYCLE_DURATION * cycles_per_segment;

        let mut sink: Box<dyn SegmentCompletionSink> = match &self.role_state {
            RoleState::Talker(_) => Box::new(NullSink { overruns: Arc::clone(&overruns) }),
            RoleState::Listener(listener) => Box::new(HandoffSegmentSink::new(
                Arc::clone(&listener.handoff),
                listener.worker.as_ref().expect("worker started above").notify_handle(),
                self.payload_base,
                self.timestamps_base,
                cycles_per_segment,
                self.payload_stride,
            )),
        };

        let running_thread = Arc::clone(&running);
        let handle = thread::spawn(move || {
            let mut segment = 0u32;
            while running_thread.load(Ordering::Relaxed) {
                thread::sleep(segment_duration);
                if !running_thread.load(Ordering::Relaxed) {
                    break;
                }
                let messages = engine_handle.lock().unwrap().on_segment_complete(segment, sink.as_mut());
                for message in messages {
                    let code = match message {
                        EngineMessage::TimeStampAdjust { .. } => MessageCode::TimeStampAdjust,
                        EngineMessage::DclOverrunAutoRestartFailed => MessageCode::DclOverrunAutoRestartFailed,
                        EngineMessage::DataPull => MessageCode::DataPull,
                    };
                    if let Some(cb) = message_callback.lock().unwrap().as_mut() {
                        cb(code, segment, 0);
                    }
                }
                segment = (segment + 1) % num_segments;
            }
        });

        self.runloop = Some((running, handle));
        self.dispatch(MessageCode::Started, 0, 0);
        Ok(())
    }

    /// Requests channel stop, joins the runloop/reader/worker threads,
    /// and releases the isoch channel. Mirrors `spec.md §5`'s shutdown
    /// ordering: flags flipped first, then deterministic joins.
    pub fn stop(&mut self, deadline: Duration) -> Result<()> {
        if let Some((running, handle)) = self.runloop.take() {
            running.store(false, Ordering::Relaxed);
            let _ = handle.join();
        }

        match &mut self.role_state {
            RoleState::Talker(talker) => {
                talker.reader_running.store(false, Ordering::Relaxed);
                if let Some(handle) = talker.reader_handle.take() {
                    let _ = handle.join();
                }
            }
            RoleState::Listener(listener) => {
                if let Some(worker) = listener.worker.take() {
                    worker.stop();
                }
            }
        }

        let result = self.engine.lock().unwrap().stop(deadline);
        match &result {
            Ok(()) => self.dispatch(MessageCode::Stopped, 0, 0),
            Err(_) => self.dispatch(MessageCode::Error, 0, 0),
        }
        self.dispatch(MessageCode::ReleaseIsochPort, 0, 0);
        result
    }

    pub fn state(&self) -> PortChannelState {
        self.engine.lock().unwrap().port_channel().state()
    }

    pub fn is_quarantined(&self) -> bool {
        self.engine.lock().unwrap().port_channel().is_quarantined()
    }

    /// Calls `handle_finalize()` on the underlying state machine,
    /// simulating the peer's finalize callback arriving. A real
    /// `BusConnector` invokes this from its own dispatcher thread;
    /// exposed here so a test harness can drive it without one.
    pub fn simulate_finalize(&self) {
        self.engine.lock().unwrap().port_channel_mut().handle_finalize();
    }

    /// Non-blocking client push (`spec.md §6`: `pushAudioData(ptr, len)
    /// -> bool`). Returns `false` if this is a listener `Stream` or the
    /// shared-memory ring is full.
    pub fn push_audio_data(&mut self, data: &[u8]) -> bool {
        let RoleState::Talker(talker) = &mut self.role_state else { return false };
        let frame_count = (data.len() / talker.bytes_per_frame) as u32;
        let seed = talker.push_seed;
        talker.push_seed = talker.push_seed.wrapping_add(1);
        talker.shm_producer.push(ShmTimeStamp { host_time_ns: 0, sample_time: 0, seed }, frame_count, data)
    }
}
