//! Real hardware devices through cpal
//!
//! Bridges the engine's pull model (get_buffer/put_buffer at the audio
//! thread's pace) to cpal's push-model callbacks with an SPSC byte ring.
//! cpal streams are not `Send`, so each open device runs a small dedicated
//! thread that owns the `cpal::Stream`; the engine side only ever touches
//! its ring endpoints and a few shared atomics.
//!
//! ```text
//! playback: engine put_buffer ──rtrb──▶ cpal output callback ──▶ speakers
//! capture:  microphone ──cpal input callback ──rtrb──▶ engine get_buffer
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, error, warn};

use sonara_proto::{Direction, NodeType, SampleFormat};

use super::{DevCommon, Device, DeviceInfo};
use crate::error::{CoreError, CoreResult};
use crate::mix;
use crate::node::Node;
use crate::ramp::Ramp;

/// Consecutive starved output callbacks counted as one severe underrun.
const STARVED_CALLBACKS_SEVERE: u32 = 8;

enum Ctl {
    Start,
    Stop,
}

struct StreamThread {
    ctl: Sender<Ctl>,
    handle: JoinHandle<()>,
}

pub struct CpalDevice {
    common: DevCommon,
    /// cpal device name; None picks the host default for the direction.
    target_name: Option<String>,

    thread: Option<StreamThread>,
    /// Engine-side ring endpoint: producer for playback, consumer for
    /// capture.
    out_producer: Option<Producer<u8>>,
    in_consumer: Option<Consumer<u8>>,
    transfer: Vec<u8>,
    ring_capacity_bytes: usize,

    underruns: Arc<AtomicU32>,
    severe_underruns: Arc<AtomicU32>,
}

impl CpalDevice {
    pub fn new(idx: u32, direction: Direction, target_name: Option<String>) -> Self {
        let name = target_name
            .clone()
            .unwrap_or_else(|| format!("cpal default {direction:?}").to_lowercase());
        let mut common = DevCommon::new(
            DeviceInfo {
                idx,
                name: name.clone(),
                stable_id: crate::node::stable_id_for(&name, 0),
            },
            direction,
        );
        common.supported_rates = vec![48000, 44100];
        common.supported_channel_counts = vec![2, 1];
        common.supported_formats = vec![SampleFormat::S16LE];
        common.buffer_size = 4096;

        let node_type = if direction == Direction::Output {
            NodeType::InternalSpeaker
        } else {
            NodeType::Mic
        };
        let mut node = Node::new(0, &name, node_type);
        node.plugged = true;
        common.nodes.push(node);
        common.active_node = Some(0);
        // Hardware mixers are out of reach through cpal.
        common.software_volume_needed = true;
        if direction == Direction::Output {
            common.ramp = Some(Ramp::new());
        }

        Self {
            common,
            target_name,
            thread: None,
            out_producer: None,
            in_consumer: None,
            transfer: Vec::new(),
            ring_capacity_bytes: 0,
            underruns: Arc::new(AtomicU32::new(0)),
            severe_underruns: Arc::new(AtomicU32::new(0)),
        }
    }

    fn find_device(&self) -> CoreResult<cpal::Device> {
        let host = cpal::default_host();
        let found = match (&self.target_name, self.common.direction) {
            (None, Direction::Output) => host.default_output_device(),
            (None, _) => host.default_input_device(),
            (Some(name), dir) => {
                let devices = if dir == Direction::Output {
                    host.output_devices()
                } else {
                    host.input_devices()
                };
                devices
                    .map_err(|e| {
                        warn!("device enumeration failed: {e}");
                        CoreError::DeviceUnavailable {
                            dev: self.common.info.idx,
                            source: Box::new(CoreError::Transient),
                        }
                    })?
                    .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
            }
        };
        found.ok_or(CoreError::DeviceUnavailable {
            dev: self.common.info.idx,
            source: Box::new(CoreError::NoSuchDevice(self.common.info.idx)),
        })
    }
}

fn spawn_stream_thread(
    dev: cpal::Device,
    config: cpal::StreamConfig,
    direction: Direction,
    fmt: sonara_proto::Format,
    ring_out: Option<Consumer<u8>>,
    ring_in: Option<Producer<u8>>,
    underruns: Arc<AtomicU32>,
    severe_underruns: Arc<AtomicU32>,
) -> CoreResult<StreamThread> {
    let (ctl_tx, ctl_rx) = bounded::<Ctl>(4);
    let (ready_tx, ready_rx) = bounded::<CoreResult<()>>(1);

    let handle = std::thread::Builder::new()
        .name("sonara-cpal".into())
        .spawn(move || {
            stream_thread_main(
                dev,
                config,
                direction,
                fmt,
                ring_out,
                ring_in,
                underruns,
                severe_underruns,
                ctl_rx,
                ready_tx,
            );
        })
        .map_err(|_| CoreError::ResourceExhausted("cpal thread spawn"))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(StreamThread {
            ctl: ctl_tx,
            handle,
        }),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => {
            let _ = handle.join();
            Err(CoreError::Fatal("cpal thread died during open"))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn stream_thread_main(
    dev: cpal::Device,
    config: cpal::StreamConfig,
    direction: Direction,
    fmt: sonara_proto::Format,
    ring_out: Option<Consumer<u8>>,
    ring_in: Option<Producer<u8>>,
    underruns: Arc<AtomicU32>,
    severe_underruns: Arc<AtomicU32>,
    ctl: Receiver<Ctl>,
    ready: Sender<CoreResult<()>>,
) {
    let sample_bytes = fmt.sample_format.sample_bytes();
    let build_result = if direction == Direction::Output {
        let mut consumer = ring_out.expect("output ring");
        let mut starved = 0u32;
        dev.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                // Realtime callback: no allocation, drain the ring or emit
                // silence on underrun.
                let mut filled = 0usize;
                let mut sample = [0u8; 4];
                while filled < data.len() {
                    let mut got = 0;
                    for i in 0..sample_bytes {
                        match consumer.pop() {
                            Ok(b) => {
                                sample[i] = b;
                                got += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    if got < sample_bytes {
                        break;
                    }
                    data[filled] =
                        mix::sample_to_f32(fmt.sample_format, &sample[..sample_bytes]);
                    filled += 1;
                }
                if filled < data.len() {
                    data[filled..].fill(0.0);
                    underruns.fetch_add(1, Ordering::Relaxed);
                    starved += 1;
                    if starved >= STARVED_CALLBACKS_SEVERE {
                        severe_underruns.fetch_add(1, Ordering::Relaxed);
                        starved = 0;
                    }
                } else {
                    starved = 0;
                }
            },
            move |err| {
                error!("cpal output stream error: {err}");
            },
            None,
        )
    } else {
        let mut producer = ring_in.expect("input ring");
        dev.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mut sample = [0u8; 4];
                for v in data {
                    mix::f32_to_sample(fmt.sample_format, *v, &mut sample[..sample_bytes]);
                    for b in &sample[..sample_bytes] {
                        // Overrun drops the newest samples.
                        if producer.push(*b).is_err() {
                            return;
                        }
                    }
                }
            },
            move |err| {
                error!("cpal input stream error: {err}");
            },
            None,
        )
    };

    let stream = match build_result {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(CoreError::DeviceUnavailable {
                dev: 0,
                source: Box::new(CoreError::Fatal("cpal stream build failed")),
            }));
            debug!("cpal build failed: {e}");
            return;
        }
    };

    // Input runs as soon as it is open; output waits for Start.
    if direction == Direction::Input {
        if let Err(e) = stream.play() {
            let _ = ready.send(Err(CoreError::Fatal("cpal stream play failed")));
            debug!("cpal play failed: {e}");
            return;
        }
    }
    let _ = ready.send(Ok(()));

    while let Ok(msg) = ctl.recv() {
        match msg {
            Ctl::Start => {
                if let Err(e) = stream.play() {
                    error!("cpal start failed: {e}");
                }
            }
            Ctl::Stop => break,
        }
    }
    drop(stream);
}

impl Device for CpalDevice {
    fn common(&self) -> &DevCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut DevCommon {
        &mut self.common
    }

    fn open_dev(&mut self) -> CoreResult<()> {
        let fmt = self
            .common
            .format
            .ok_or(CoreError::InvalidArgument("open without format"))?;
        let cpal_dev = self.find_device()?;
        let config = cpal::StreamConfig {
            channels: fmt.num_channels as u16,
            sample_rate: cpal::SampleRate(fmt.frame_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let frame_bytes = fmt.frame_bytes();
        self.ring_capacity_bytes = self.common.buffer_size as usize * frame_bytes;
        let (producer, consumer) = RingBuffer::<u8>::new(self.ring_capacity_bytes);

        self.underruns.store(0, Ordering::Relaxed);
        self.severe_underruns.store(0, Ordering::Relaxed);

        let (ring_out, ring_in) = if self.common.direction == Direction::Output {
            self.out_producer = Some(producer);
            (Some(consumer), None)
        } else {
            self.in_consumer = Some(consumer);
            (None, Some(producer))
        };

        self.thread = Some(spawn_stream_thread(
            cpal_dev,
            config,
            self.common.direction,
            fmt,
            ring_out,
            ring_in,
            Arc::clone(&self.underruns),
            Arc::clone(&self.severe_underruns),
        )?);
        self.transfer = vec![0u8; self.ring_capacity_bytes];
        Ok(())
    }

    fn close_dev(&mut self) -> CoreResult<()> {
        if let Some(thread) = self.thread.take() {
            let _ = thread.ctl.send(Ctl::Stop);
            let _ = thread.handle.join();
        }
        self.out_producer = None;
        self.in_consumer = None;
        self.transfer = Vec::new();
        Ok(())
    }

    fn frames_queued(&mut self) -> CoreResult<(usize, Instant)> {
        let fb = self.common.frame_bytes();
        let level = if self.common.direction == Direction::Output {
            match &self.out_producer {
                Some(p) => (self.ring_capacity_bytes - p.slots()) / fb,
                None => 0,
            }
        } else {
            match &self.in_consumer {
                Some(c) => c.slots() / fb,
                None => 0,
            }
        };
        Ok((level, Instant::now()))
    }

    fn delay_frames(&self) -> CoreResult<usize> {
        // The ring is the visible part of the path; the hardware period
        // below it is not reported by cpal.
        let fb = self.common.frame_bytes();
        let level = match self.common.direction {
            Direction::Output => self
                .out_producer
                .as_ref()
                .map(|p| (self.ring_capacity_bytes - p.slots()) / fb)
                .unwrap_or(0),
            _ => self.in_consumer.as_ref().map(|c| c.slots() / fb).unwrap_or(0),
        };
        Ok(level)
    }

    fn get_buffer(&mut self, frames: usize) -> CoreResult<(&mut [u8], usize)> {
        let fb = self.common.frame_bytes();
        if self.common.direction == Direction::Output {
            let free = self
                .out_producer
                .as_ref()
                .map(|p| p.slots())
                .unwrap_or(0);
            let n = frames.min(free / fb).min(self.transfer.len() / fb);
            Ok((&mut self.transfer[..n * fb], n))
        } else {
            let Self {
                in_consumer,
                transfer,
                ..
            } = self;
            let consumer = in_consumer
                .as_mut()
                .ok_or(CoreError::InvalidArgument("capture on closed device"))?;
            let avail = consumer.slots() / fb;
            let n = frames.min(avail).min(transfer.len() / fb);
            for slot in transfer[..n * fb].iter_mut() {
                match consumer.pop() {
                    Ok(b) => *slot = b,
                    Err(_) => break,
                }
            }
            Ok((&mut transfer[..n * fb], n))
        }
    }

    fn put_buffer(&mut self, frames: usize) -> CoreResult<()> {
        if self.common.direction != Direction::Output {
            // Input frames were consumed out of the ring in get_buffer.
            return Ok(());
        }
        let fb = self.common.frame_bytes();
        let Self {
            out_producer,
            transfer,
            ..
        } = self;
        let producer = out_producer
            .as_mut()
            .ok_or(CoreError::InvalidArgument("put on closed device"))?;
        for b in &transfer[..frames * fb] {
            if producer.push(*b).is_err() {
                return Err(CoreError::Transient);
            }
        }
        Ok(())
    }

    fn supports_start(&self) -> bool {
        self.common.direction == Direction::Output
    }

    fn start(&mut self) -> CoreResult<()> {
        match &self.thread {
            Some(t) => {
                t.ctl.send(Ctl::Start).map_err(|_| CoreError::ThreadDown)?;
                Ok(())
            }
            None => Err(CoreError::InvalidArgument("start on closed device")),
        }
    }

    fn no_stream(&mut self, enable: bool) -> CoreResult<()> {
        super::default_no_stream_playback(self, enable)
    }

    fn get_num_underruns(&self) -> u32 {
        self.underruns.load(Ordering::Relaxed)
    }

    fn get_num_severe_underruns(&self) -> u32 {
        self.severe_underruns.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_device_shape() {
        let dev = CpalDevice::new(8, Direction::Output, None);
        assert_eq!(dev.common().direction, Direction::Output);
        assert!(dev.common().software_volume_needed);
        assert!(dev.common().ramp.is_some());
        assert!(dev.supports_start());

        let input = CpalDevice::new(9, Direction::Input, None);
        assert!(input.common().ramp.is_none());
        assert!(!input.supports_start());
    }

    #[test]
    fn test_closed_device_reports_empty() {
        let mut dev = CpalDevice::new(8, Direction::Output, None);
        let (level, _) = dev.frames_queued().unwrap();
        assert_eq!(level, 0);
        assert_eq!(dev.get_num_underruns(), 0);
    }

    // Opening requires audio hardware.
    #[test]
    #[ignore = "requires audio hardware"]
    fn test_open_close_real_device() {
        let mut dev = CpalDevice::new(8, Direction::Output, None);
        crate::device::set_format(
            &mut dev,
            &sonara_proto::Format::new(SampleFormat::S16LE, 48000, 2),
        )
        .unwrap();
        crate::device::open(&mut dev, 480).unwrap();
        assert!(crate::device::is_open(&dev));
        crate::device::close(&mut dev).unwrap();
    }
}
