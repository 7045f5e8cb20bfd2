//! The empty (fallback) device
//!
//! One per direction, always registered and enabled whenever no real device
//! of that direction is. It consumes playback and produces silence at a
//! simulated hardware cadence so clients never block on a missing device.

use std::time::Instant;

use sonara_proto::{Direction, NodeType, SampleFormat};

use super::{DevCommon, Device, DeviceInfo};
use crate::error::{CoreError, CoreResult};
use crate::node::Node;
use crate::unix::duration_to_frames;

const EMPTY_BUFFER_FRAMES: usize = 4096;

/// Reserved device indices for the two fallback devices.
pub const SILENT_PLAYBACK_DEVICE_IDX: u32 = 1;
pub const SILENT_RECORD_DEVICE_IDX: u32 = 2;

pub struct EmptyDevice {
    common: DevCommon,
    open: bool,
    audio_buffer: Vec<u8>,
    buffer_level: usize,
    last_buffer_access: Instant,
}

impl EmptyDevice {
    pub fn new(direction: Direction) -> Self {
        let (idx, name) = match direction {
            Direction::Input => (SILENT_RECORD_DEVICE_IDX, "Silent record device"),
            _ => (SILENT_PLAYBACK_DEVICE_IDX, "Silent playback device"),
        };
        let mut common = DevCommon::new(
            DeviceInfo {
                idx,
                name: name.to_string(),
                stable_id: crate::node::stable_id_for(name, 0),
            },
            direction.hw_direction(),
        );
        common.supported_rates = vec![44100, 48000];
        common.supported_channel_counts = vec![1, 2];
        common.supported_formats = vec![
            SampleFormat::S16LE,
            SampleFormat::S24LE,
            SampleFormat::S32LE,
            SampleFormat::S24LE3,
        ];
        common.buffer_size = EMPTY_BUFFER_FRAMES as u32;

        let mut node = Node::new(0, "(default)", NodeType::Unknown);
        node.plugged = true;
        common.nodes.push(node);
        common.active_node = Some(0);

        Self {
            common,
            open: false,
            audio_buffer: Vec::new(),
            buffer_level: 0,
            last_buffer_access: Instant::now(),
        }
    }

    /// Level made up from what was read/written and the time since: the
    /// simulated hardware runs at the nominal rate.
    fn current_level(&self) -> usize {
        let rate = self.common.frame_rate();
        let elapsed =
            duration_to_frames(self.last_buffer_access.elapsed(), rate) as usize;
        if self.common.direction == Direction::Input {
            return (self.buffer_level + elapsed) % EMPTY_BUFFER_FRAMES;
        }
        self.buffer_level.saturating_sub(elapsed)
    }
}

impl Device for EmptyDevice {
    fn common(&self) -> &DevCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut DevCommon {
        &mut self.common
    }

    fn open_dev(&mut self) -> CoreResult<()> {
        if self.common.format.is_none() {
            return Err(CoreError::InvalidArgument("open without format"));
        }
        self.open = true;
        self.audio_buffer = vec![0u8; EMPTY_BUFFER_FRAMES * self.common.frame_bytes()];
        self.buffer_level = 0;
        self.last_buffer_access = Instant::now();
        Ok(())
    }

    fn close_dev(&mut self) -> CoreResult<()> {
        self.open = false;
        self.audio_buffer = Vec::new();
        Ok(())
    }

    fn frames_queued(&mut self) -> CoreResult<(usize, Instant)> {
        Ok((self.current_level(), Instant::now()))
    }

    fn delay_frames(&self) -> CoreResult<usize> {
        Ok(0)
    }

    fn get_buffer(&mut self, frames: usize) -> CoreResult<(&mut [u8], usize)> {
        let level = self.current_level();
        let avail = if self.common.direction == Direction::Output {
            EMPTY_BUFFER_FRAMES - level
        } else {
            level
        };
        let n = frames.min(avail);
        let fb = self.common.frame_bytes();
        Ok((&mut self.audio_buffer[..n * fb], n))
    }

    fn put_buffer(&mut self, frames: usize) -> CoreResult<()> {
        self.buffer_level = self.current_level();
        self.last_buffer_access = Instant::now();
        if self.common.direction == Direction::Output {
            self.buffer_level = (self.buffer_level + frames) % EMPTY_BUFFER_FRAMES;
        } else {
            self.buffer_level = self.buffer_level.saturating_sub(frames);
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> CoreResult<usize> {
        let level = self.current_level();
        if self.common.direction == Direction::Input {
            self.buffer_level = 0;
            self.last_buffer_access = Instant::now();
            return Ok(level);
        }
        Ok(0)
    }

    fn no_stream(&mut self, enable: bool) -> CoreResult<()> {
        super::default_no_stream_playback(self, enable)
    }
}
