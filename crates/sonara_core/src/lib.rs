//! Sonara Core - Audio Server Engine
//!
//! This crate provides the server side of Sonara: it accepts client
//! connections over a Unix seqpacket socket, negotiates per-stream
//! shared-memory audio rings, and drives open devices from a dedicated
//! realtime audio thread.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         Main Thread                            │
//! │  Server loop ── RClient dispatch ── IoDevList / StreamList     │
//! │        │                │                  │                   │
//! │        │          SystemState shm     Observer bus             │
//! └────────┼────────────────────────────────────┼──────────────────┘
//!          │ crossbeam-channel + eventfd (both directions)
//! ┌────────▼────────────────────────────────────▼──────────────────┐
//! │                        Audio Thread                            │
//! │  poll(cmd fd, stream fds) ── mix/demix ── Device::put_buffer   │
//! │        │                                                       │
//! │   ShmRing per stream (shared with client process)              │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Control messages mutate state on the main thread; the audio thread only
//! learns about membership changes (open devices, attached streams) through
//! its command channel and picks them up between mix iterations.

pub mod audio_thread;
mod buffer_share;
pub mod device;
mod dev_stream;
mod error;
pub mod iodev_list;
mod mix;
mod node;
mod observer;
mod ramp;
mod rate_estimator;
pub mod rclient;
pub mod server;
mod shm;
mod softvol;
pub mod stream;
mod stream_list;
pub mod system_state;
mod timers;
mod unix;

pub use buffer_share::BufferShare;
pub use dev_stream::DevStream;
pub use error::{CoreError, CoreResult};
pub use mix::{mix_add, mute_buffer, scale_buffer, scale_buffer_increment, RemixConverter};
pub use node::Node;
pub use observer::{Observer, ObserverEvent, ObserverRegistry};
pub use ramp::{Ramp, RampAction, RampCompletion, RampRequest};
pub use rate_estimator::RateEstimator;
pub use server::{Server, ServerConfig};
pub use shm::ShmRing;
pub use stream::{Stream, StreamConfig};
pub use stream_list::StreamList;
pub use timers::TimerManager;
