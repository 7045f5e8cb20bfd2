//! Loopback capture devices
//!
//! Virtual inputs that capture what the primary output path is playing:
//! one taps post-mix/pre-DSP samples, the other post-DSP. The tap is a byte
//! ring fed from inside `put_output_buffer` on whichever output device is
//! first-enabled; the loopback device drains it like hardware capture.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use sonara_proto::{Direction, Format, NodeType, SampleFormat};

use crate::error::{CoreError, CoreResult};
use crate::node::Node;
use crate::unix::duration_to_frames;

use super::{DevCommon, Device, DeviceInfo};

const LOOPBACK_BUFFER_FRAMES: usize = 8192;

/// Reserved device indices for the two loopback devices.
pub const LOOPBACK_POST_MIX_IDX: u32 = 3;
pub const LOOPBACK_POST_DSP_IDX: u32 = 4;

/// Which point of the output path a loopback captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackPoint {
    PostMixPreDsp,
    PostDsp,
}

/// The ring a loopback device reads and an output device's pipeline feeds.
pub struct LoopbackTap {
    buf: VecDeque<u8>,
    capacity_bytes: usize,
    frame_bytes: usize,
    last_filled: Instant,
    /// Set by the device list while an output device is feeding the tap;
    /// cleared taps synthesize silence instead.
    pub hook_attached: bool,
}

impl LoopbackTap {
    fn new() -> Self {
        Self {
            buf: VecDeque::new(),
            capacity_bytes: 0,
            frame_bytes: 4,
            last_filled: Instant::now(),
            hook_attached: false,
        }
    }

    fn configure(&mut self, frame_bytes: usize) {
        self.frame_bytes = frame_bytes;
        self.capacity_bytes = LOOPBACK_BUFFER_FRAMES * frame_bytes;
        self.buf.clear();
        self.last_filled = Instant::now();
    }

    /// Called from the output pipeline with samples being played.
    pub fn feed(&mut self, data: &[u8], frames: usize, fmt: &Format) {
        let frame_bytes = fmt.frame_bytes();
        if frame_bytes != self.frame_bytes || self.capacity_bytes == 0 {
            return;
        }
        let writable = (self.capacity_bytes - self.buf.len()) / frame_bytes;
        let n = frames.min(writable);
        self.buf.extend(&data[..n * frame_bytes]);
        self.last_filled = Instant::now();
    }

    fn queued_frames(&self) -> usize {
        self.buf.len() / self.frame_bytes
    }

    /// Tops the ring up with silence when no output device is feeding it,
    /// simulating capture at the nominal rate.
    fn fill_silence_to_now(&mut self, frame_rate: u32) {
        let frames_since =
            duration_to_frames(self.last_filled.elapsed(), frame_rate) as usize;
        let writable = (self.capacity_bytes - self.buf.len()) / self.frame_bytes;
        let n = frames_since.min(writable);
        if n > 0 {
            self.buf.extend(std::iter::repeat(0u8).take(n * self.frame_bytes));
            self.last_filled = Instant::now();
        }
    }
}

pub struct LoopbackDevice {
    common: DevCommon,
    point: LoopbackPoint,
    tap: Arc<Mutex<LoopbackTap>>,
    read_scratch: Vec<u8>,
    pending_read: usize,
}

impl LoopbackDevice {
    pub fn new(point: LoopbackPoint) -> Self {
        let (idx, name, node_type) = match point {
            LoopbackPoint::PostMixPreDsp => (
                LOOPBACK_POST_MIX_IDX,
                "Post Mix Pre DSP Loopback",
                NodeType::PostMixPreDsp,
            ),
            LoopbackPoint::PostDsp => {
                (LOOPBACK_POST_DSP_IDX, "Post DSP Loopback", NodeType::PostDsp)
            }
        };
        let mut common = DevCommon::new(
            DeviceInfo {
                idx,
                name: name.to_string(),
                stable_id: crate::node::stable_id_for(name, 0),
            },
            Direction::Input,
        );
        common.supported_rates = vec![48000];
        common.supported_channel_counts = vec![2];
        common.supported_formats = vec![SampleFormat::S16LE];
        common.buffer_size = LOOPBACK_BUFFER_FRAMES as u32;

        let mut node = Node::new(0, name, node_type);
        node.plugged = true;
        node.stable_id = common.info.stable_id;
        common.nodes.push(node);
        common.active_node = Some(0);

        Self {
            common,
            point,
            tap: Arc::new(Mutex::new(LoopbackTap::new())),
            read_scratch: Vec::new(),
            pending_read: 0,
        }
    }

    pub fn point(&self) -> LoopbackPoint {
        self.point
    }

    /// Handle for the device list to install as a pre/post DSP hook on the
    /// feeding output device.
    pub fn tap(&self) -> Arc<Mutex<LoopbackTap>> {
        Arc::clone(&self.tap)
    }
}

impl Device for LoopbackDevice {
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
        self.tap.lock().unwrap().configure(fmt.frame_bytes());
        self.read_scratch = vec![0u8; LOOPBACK_BUFFER_FRAMES * fmt.frame_bytes()];
        Ok(())
    }

    fn close_dev(&mut self) -> CoreResult<()> {
        self.read_scratch = Vec::new();
        let mut tap = self.tap.lock().unwrap();
        tap.buf.clear();
        tap.capacity_bytes = 0;
        Ok(())
    }

    fn frames_queued(&mut self) -> CoreResult<(usize, Instant)> {
        let mut tap = self.tap.lock().unwrap();
        if !tap.hook_attached {
            // No output feeding the tap; produce silence at the nominal
            // rate so capture clients keep flowing.
            tap.fill_silence_to_now(self.common.frame_rate());
        }
        Ok((tap.queued_frames(), tap.last_filled))
    }

    fn delay_frames(&self) -> CoreResult<usize> {
        Ok(self.tap.lock().unwrap().queued_frames())
    }

    fn get_buffer(&mut self, frames: usize) -> CoreResult<(&mut [u8], usize)> {
        let fb = self.common.frame_bytes();
        let tap_arc = Arc::clone(&self.tap);
        let tap = tap_arc.lock().unwrap();
        let n = frames.min(tap.queued_frames());
        for (i, b) in tap.buf.iter().take(n * fb).enumerate() {
            self.read_scratch[i] = *b;
        }
        drop(tap);
        self.pending_read = n;
        Ok((&mut self.read_scratch[..n * fb], n))
    }

    fn put_buffer(&mut self, frames: usize) -> CoreResult<()> {
        let fb = self.common.frame_bytes();
        self.pending_read = 0;
        let mut tap = self.tap.lock().unwrap();
        let drain = (frames * fb).min(tap.buf.len());
        tap.buf.drain(..drain);
        Ok(())
    }

    fn flush_buffer(&mut self) -> CoreResult<usize> {
        let mut tap = self.tap.lock().unwrap();
        let frames = tap.queued_frames();
        tap.buf.clear();
        Ok(frames)
    }

    fn no_stream(&mut self, _enable: bool) -> CoreResult<()> {
        Err(CoreError::InvalidArgument("no_stream on input device"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device;

    fn open_loopback() -> LoopbackDevice {
        let mut dev = LoopbackDevice::new(LoopbackPoint::PostMixPreDsp);
        device::set_format(&mut dev, &Format::new(SampleFormat::S16LE, 48000, 2)).unwrap();
        device::open(&mut dev, 480).unwrap();
        dev
    }

    #[test]
    fn test_loopback_identities() {
        let pre = LoopbackDevice::new(LoopbackPoint::PostMixPreDsp);
        assert_eq!(pre.common().info.idx, LOOPBACK_POST_MIX_IDX);
        assert_eq!(pre.common().direction, Direction::Input);

        let post = LoopbackDevice::new(LoopbackPoint::PostDsp);
        assert_eq!(post.common().info.idx, LOOPBACK_POST_DSP_IDX);
        assert_eq!(post.common().nodes[0].node_type, NodeType::PostDsp);
    }

    #[test]
    fn test_tap_feed_and_drain() {
        let mut dev = open_loopback();
        dev.tap().lock().unwrap().hook_attached = true;
        let fmt = Format::new(SampleFormat::S16LE, 48000, 2);

        let data = vec![0x5au8; 16 * 4];
        dev.tap().lock().unwrap().feed(&data, 16, &fmt);

        let (level, _) = dev.frames_queued().unwrap();
        assert_eq!(level, 16);

        let (buf, n) = dev.get_buffer(16).unwrap();
        assert_eq!(n, 16);
        assert!(buf.iter().all(|b| *b == 0x5a));
        dev.put_buffer(16).unwrap();
        let (level, _) = dev.frames_queued().unwrap();
        assert_eq!(level, 0);
    }

    #[test]
    fn test_unattached_tap_produces_silence() {
        let mut dev = open_loopback();
        assert!(!dev.tap().lock().unwrap().hook_attached);
        std::thread::sleep(std::time::Duration::from_millis(3));
        let (level, _) = dev.frames_queued().unwrap();
        assert!(level > 0, "silence generated at the nominal rate");
        let (buf, n) = dev.get_buffer(level).unwrap();
        assert!(n > 0);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_feed_wrong_frame_size_ignored() {
        let dev = open_loopback();
        let mono = Format::new(SampleFormat::S16LE, 48000, 1);
        dev.tap().lock().unwrap().feed(&[0u8; 32], 16, &mono);
        assert_eq!(dev.tap().lock().unwrap().queued_frames(), 0);
    }

    #[test]
    fn test_tap_bounded_by_capacity() {
        let dev = open_loopback();
        let fmt = Format::new(SampleFormat::S16LE, 48000, 2);
        let chunk = vec![1u8; 4096 * 4];
        for _ in 0..4 {
            dev.tap().lock().unwrap().feed(&chunk, 4096, &fmt);
        }
        assert_eq!(
            dev.tap().lock().unwrap().queued_frames(),
            LOOPBACK_BUFFER_FRAMES
        );
    }

    #[test]
    fn test_flush_empties_tap() {
        let mut dev = open_loopback();
        let fmt = Format::new(SampleFormat::S16LE, 48000, 2);
        dev.tap().lock().unwrap().feed(&[1u8; 64], 16, &fmt);
        assert_eq!(dev.flush_buffer().unwrap(), 16);
        assert_eq!(dev.tap().lock().unwrap().queued_frames(), 0);
    }
}
