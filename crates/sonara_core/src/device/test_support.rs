//! In-memory device used by unit tests across the crate.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use sonara_proto::{Direction, NodeType};

use super::{DevCommon, Device, DeviceInfo};
use crate::error::{CoreError, CoreResult};
use crate::node::Node;

/// Shared handles into a FakeDevice, usable after it is boxed as a
/// `dyn Device` and handed to the device list.
#[derive(Clone, Default)]
pub struct FakeProbe {
    pub fail_open: Arc<AtomicBool>,
    pub open_calls: Arc<AtomicU32>,
    pub close_calls: Arc<AtomicU32>,
    pub start_calls: Arc<AtomicU32>,
    pub mute_state: Arc<Mutex<Option<bool>>>,
    pub volume_set: Arc<Mutex<Option<u32>>>,
    pub active_node_updates: Arc<Mutex<Vec<(u32, bool)>>>,
    /// Bytes of the most recent committed output buffer.
    pub written: Arc<Mutex<Vec<u8>>>,
}

impl FakeProbe {
    pub fn opens(&self) -> u32 {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }
}

/// A device that records every interaction and simulates a hardware buffer
/// that only drains when the test says so.
pub struct FakeDevice {
    pub common: DevCommon,
    pub hw_level: usize,
    pub frames_put: usize,
    /// Bytes of the most recent put, as committed to "hardware".
    pub written: Vec<u8>,
    transfer: Vec<u8>,
    pending: usize,
    pub start_calls: u32,
    pub open_calls: u32,
    pub close_calls: u32,
    pub no_start: bool,
    pub fail_open: bool,
    pub severe_underruns: u32,
    pub mute_state: Option<bool>,
    pub volume_set: Option<u32>,
    pub active_node_updates: Vec<(u32, bool)>,
    /// Frames handed out on input get_buffer calls.
    pub capture_data: Vec<u8>,
    pub probe: FakeProbe,
}

impl FakeDevice {
    pub fn new(idx: u32, direction: Direction) -> Self {
        let mut common = DevCommon::new(
            DeviceInfo {
                idx,
                name: format!("fake-{idx}"),
                stable_id: idx,
            },
            direction,
        );
        common.buffer_size = 4096;
        let mut node = Node::new(0, "(default)", NodeType::Unknown);
        node.plugged = true;
        common.nodes.push(node);
        common.active_node = Some(0);
        Self {
            common,
            hw_level: 0,
            frames_put: 0,
            written: Vec::new(),
            transfer: vec![0u8; 4096 * 8],
            pending: 0,
            start_calls: 0,
            open_calls: 0,
            close_calls: 0,
            no_start: false,
            fail_open: false,
            severe_underruns: 0,
            mute_state: None,
            volume_set: None,
            active_node_updates: Vec::new(),
            capture_data: Vec::new(),
            probe: FakeProbe::default(),
        }
    }

    pub fn new_output(idx: u32) -> Self {
        Self::new(idx, Direction::Output)
    }

    pub fn new_input(idx: u32) -> Self {
        Self::new(idx, Direction::Input)
    }

    /// A device plus the probe observing it from outside the box.
    pub fn with_probe(idx: u32, direction: Direction) -> (Self, FakeProbe) {
        let dev = Self::new(idx, direction);
        let probe = dev.probe.clone();
        (dev, probe)
    }
}

impl Device for FakeDevice {
    fn common(&self) -> &DevCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut DevCommon {
        &mut self.common
    }

    fn open_dev(&mut self) -> CoreResult<()> {
        self.open_calls += 1;
        self.probe.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_open || self.probe.fail_open.load(Ordering::SeqCst) {
            return Err(CoreError::DeviceUnavailable {
                dev: self.common.info.idx,
                source: Box::new(CoreError::Sys(nix::Error::EIO)),
            });
        }
        self.hw_level = 0;
        self.frames_put = 0;
        Ok(())
    }

    fn close_dev(&mut self) -> CoreResult<()> {
        self.close_calls += 1;
        self.probe.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn frames_queued(&mut self) -> CoreResult<(usize, Instant)> {
        if self.severe_underruns > 0 {
            return Err(CoreError::SevereUnderrun);
        }
        Ok((self.hw_level, Instant::now()))
    }

    fn delay_frames(&self) -> CoreResult<usize> {
        Ok(0)
    }

    fn get_buffer(&mut self, frames: usize) -> CoreResult<(&mut [u8], usize)> {
        let fb = self.common.frame_bytes();
        if self.common.direction == Direction::Input {
            let avail = self.capture_data.len() / fb;
            let n = frames.min(avail);
            self.pending = n;
            return Ok((&mut self.capture_data[..n * fb], n));
        }
        let cap = self.transfer.len() / fb;
        let n = frames.min(cap);
        self.pending = n;
        Ok((&mut self.transfer[..n * fb], n))
    }

    fn put_buffer(&mut self, frames: usize) -> CoreResult<()> {
        let fb = self.common.frame_bytes();
        if self.common.direction == Direction::Input {
            self.capture_data.drain(..(frames * fb).min(self.capture_data.len()));
            self.hw_level = self.hw_level.saturating_sub(frames);
        } else {
            self.written = self.transfer[..frames * fb].to_vec();
            *self.probe.written.lock().unwrap() = self.written.clone();
            self.frames_put += frames;
            self.hw_level += frames;
        }
        self.pending = 0;
        Ok(())
    }

    fn supports_start(&self) -> bool {
        !self.no_start
    }

    fn start(&mut self) -> CoreResult<()> {
        self.start_calls += 1;
        self.probe.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn no_stream(&mut self, enable: bool) -> CoreResult<()> {
        super::default_no_stream_playback(self, enable)
    }

    fn update_active_node(&mut self, node_idx: u32, dev_enabled: bool) {
        self.active_node_updates.push((node_idx, dev_enabled));
        self.probe
            .active_node_updates
            .lock()
            .unwrap()
            .push((node_idx, dev_enabled));
        self.common.active_node = Some(node_idx);
    }

    fn has_hw_volume(&self) -> bool {
        true
    }

    fn set_volume(&mut self, adjusted_volume: u32) {
        self.volume_set = Some(adjusted_volume);
        *self.probe.volume_set.lock().unwrap() = Some(adjusted_volume);
    }

    fn set_mute(&mut self, mute: bool) {
        self.mute_state = Some(mute);
        *self.probe.mute_state.lock().unwrap() = Some(mute);
    }

    fn get_num_severe_underruns(&self) -> u32 {
        self.severe_underruns
    }
}
