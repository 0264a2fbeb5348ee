//! # isoch_worker
//!
//! Double-buffered hand-off from the bus-callback context to a soft
//! real-time processing thread (`spec.md §4.6`), and the thread itself.
//!
//! Grounded on `IsochDoubleBufferManager.{hpp,cpp}` and
//! `AudioProcessingThread.{hpp,cpp}`.

pub mod double_buffer;
pub mod worker;

pub use double_buffer::DoubleBufferHandoff;
pub use worker::{NotifyHandle, PacketSink, ProcessingWorker};
