//! Client-controllable test device
//!
//! Added at runtime with `ADD_TEST_DEV` and driven by `TEST_DEV_COMMAND`:
//! a hotword-style input whose "hardware" buffer is filled either by fed
//! sample bytes or by a hotword trigger burst. Lets integration tooling
//! exercise the capture path without hardware.

use std::collections::VecDeque;
use std::time::Instant;

use sonara_proto::{Direction, NodeType, SampleFormat, TestDevCommand};
use tracing::debug;

use super::{DevCommon, Device, DeviceInfo};
use crate::error::{CoreError, CoreResult};
use crate::node::Node;

const TEST_BUFFER_FRAMES: usize = 16384;

pub struct TestDevice {
    common: DevCommon,
    sample_buffer: VecDeque<u8>,
    read_scratch: Vec<u8>,
    hotword_triggered: bool,
}

impl TestDevice {
    pub fn new_hotword(idx: u32) -> Self {
        let name = format!("Test hotword device {idx}");
        let mut common = DevCommon::new(
            DeviceInfo {
                idx,
                name: name.clone(),
                stable_id: crate::node::stable_id_for(&name, idx),
            },
            Direction::Input,
        );
        common.supported_rates = vec![16000, 48000];
        common.supported_channel_counts = vec![1, 2];
        common.supported_formats = vec![SampleFormat::S16LE];
        common.buffer_size = TEST_BUFFER_FRAMES as u32;

        let mut node = Node::new(0, "Hotword", NodeType::Hotword);
        node.plugged = true;
        node.active_hotword_model = "default".to_string();
        common.nodes.push(node);
        common.active_node = Some(0);

        Self {
            common,
            sample_buffer: VecDeque::new(),
            read_scratch: Vec::new(),
            hotword_triggered: false,
        }
    }

    /// Dispatches a TEST_DEV_COMMAND payload.
    pub fn command(&mut self, command: TestDevCommand, data: &[u8]) {
        match command {
            TestDevCommand::HotwordTrigger => self.hotword_trigger(),
            TestDevCommand::FeedSamples => self.feed_samples(data),
        }
    }

    /// Queues raw sample bytes as if captured by hardware.
    pub fn feed_samples(&mut self, data: &[u8]) {
        let cap = TEST_BUFFER_FRAMES * self.common.frame_bytes();
        let room = cap.saturating_sub(self.sample_buffer.len());
        self.sample_buffer.extend(&data[..data.len().min(room)]);
    }

    /// Simulates a recognized wake word: one callback burst of silence so
    /// the attached hotword stream fires.
    pub fn hotword_trigger(&mut self) {
        self.hotword_triggered = true;
        let frames = self.common.min_cb_level.max(1) as usize;
        let bytes = frames * self.common.frame_bytes();
        debug!(dev = %self.common.info.name, frames, "hotword triggered");
        self.sample_buffer.extend(std::iter::repeat(0u8).take(bytes));
    }

    pub fn was_triggered(&self) -> bool {
        self.hotword_triggered
    }
}

impl Device for TestDevice {
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
        self.read_scratch = vec![0u8; TEST_BUFFER_FRAMES * self.common.frame_bytes()];
        self.sample_buffer.clear();
        self.hotword_triggered = false;
        Ok(())
    }

    fn close_dev(&mut self) -> CoreResult<()> {
        self.read_scratch = Vec::new();
        self.sample_buffer.clear();
        Ok(())
    }

    fn frames_queued(&mut self) -> CoreResult<(usize, Instant)> {
        Ok((
            self.sample_buffer.len() / self.common.frame_bytes(),
            Instant::now(),
        ))
    }

    fn delay_frames(&self) -> CoreResult<usize> {
        Ok(0)
    }

    fn get_buffer(&mut self, frames: usize) -> CoreResult<(&mut [u8], usize)> {
        let fb = self.common.frame_bytes();
        let n = frames.min(self.sample_buffer.len() / fb);
        for (i, b) in self.sample_buffer.iter().take(n * fb).enumerate() {
            self.read_scratch[i] = *b;
        }
        Ok((&mut self.read_scratch[..n * fb], n))
    }

    fn put_buffer(&mut self, frames: usize) -> CoreResult<()> {
        let bytes = (frames * self.common.frame_bytes()).min(self.sample_buffer.len());
        self.sample_buffer.drain(..bytes);
        Ok(())
    }

    fn flush_buffer(&mut self) -> CoreResult<usize> {
        let frames = self.sample_buffer.len() / self.common.frame_bytes();
        self.sample_buffer.clear();
        Ok(frames)
    }

    fn no_stream(&mut self, _enable: bool) -> CoreResult<()> {
        Err(CoreError::InvalidArgument("no_stream on input device"))
    }

    fn get_hotword_models(&self) -> Option<String> {
        Some("default,alt_lang".to_string())
    }

    fn test_command(&mut self, command: TestDevCommand, data: &[u8]) -> CoreResult<()> {
        self.command(command, data);
        Ok(())
    }

    fn set_hotword_model(&mut self, model: &str) -> CoreResult<()> {
        let known = self
            .get_hotword_models()
            .map(|m| m.split(',').any(|name| name == model))
            .unwrap_or(false);
        if !known {
            return Err(CoreError::InvalidArgument("unknown hotword model"));
        }
        if let Some(node) = self.common.active_node_mut() {
            node.active_hotword_model = model.to_string();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device;
    use sonara_proto::Format;

    fn open_test_dev() -> TestDevice {
        let mut dev = TestDevice::new_hotword(16);
        device::set_format(&mut dev, &Format::new(SampleFormat::S16LE, 16000, 1)).unwrap();
        device::open(&mut dev, 160).unwrap();
        dev
    }

    #[test]
    fn test_feed_then_capture() {
        let mut dev = open_test_dev();
        dev.feed_samples(&[0x42u8; 64]);
        let (level, _) = dev.frames_queued().unwrap();
        assert_eq!(level, 32, "64 bytes of mono S16 is 32 frames");

        let (buf, n) = dev.get_buffer(32).unwrap();
        assert_eq!(n, 32);
        assert!(buf.iter().all(|b| *b == 0x42));
        dev.put_buffer(32).unwrap();
        assert_eq!(dev.frames_queued().unwrap().0, 0);
    }

    #[test]
    fn test_hotword_trigger_produces_burst() {
        let mut dev = open_test_dev();
        assert!(!dev.was_triggered());
        dev.command(TestDevCommand::HotwordTrigger, &[]);
        assert!(dev.was_triggered());
        let (level, _) = dev.frames_queued().unwrap();
        assert_eq!(level, dev.common().min_cb_level as usize);
    }

    #[test]
    fn test_hotword_model_selection() {
        let mut dev = open_test_dev();
        assert!(dev.set_hotword_model("alt_lang").is_ok());
        assert_eq!(
            dev.common().active_node().unwrap().active_hotword_model,
            "alt_lang"
        );
        assert!(dev.set_hotword_model("nope").is_err());
    }

    #[test]
    fn test_feed_bounded() {
        let mut dev = open_test_dev();
        let huge = vec![0u8; TEST_BUFFER_FRAMES * 2 * 2];
        dev.feed_samples(&huge);
        assert_eq!(dev.frames_queued().unwrap().0, TEST_BUFFER_FRAMES);
    }
}
