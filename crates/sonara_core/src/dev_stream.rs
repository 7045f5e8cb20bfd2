//! Per-(device, stream) attachment
//!
//! A `DevStream` is the cursor of one stream inside one device's mix or
//! capture cycle. When the stream and device formats differ it also owns
//! the converter: sample-format and channel-count mapping, plus
//! nearest-frame rate matching so a stream can ride a device with a
//! slightly different clock.

use std::sync::{Arc, Mutex};

use sonara_proto::{Format, StreamId};

use crate::mix::{self, f32_to_sample, sample_to_f32};
use crate::stream::Stream;

/// Fixed-point shift for the rate-matching accumulator.
const RATE_SHIFT: u32 = 32;

/// One stream as seen by one device.
pub struct DevStream {
    pub stream: Arc<Mutex<Stream>>,
    pub stream_id: StreamId,
    pub cb_threshold: u32,
    stream_fmt: Format,
    dev_fmt: Format,
    /// Scratch buffer in device format; sized at attach, reused per cycle.
    conv_buf: Vec<u8>,
    /// Source position advance per produced frame, Q32.
    rate_step: u64,
    rate_acc: u64,
}

impl DevStream {
    pub fn new(stream: &Arc<Mutex<Stream>>, dev_fmt: Format) -> Self {
        let (stream_id, cb_threshold, stream_fmt, buffer_frames) = {
            let s = stream.lock().unwrap();
            (s.id, s.cb_threshold, s.format, s.buffer_frames)
        };
        let rate_step = if stream_fmt.frame_rate == dev_fmt.frame_rate {
            1u64 << RATE_SHIFT
        } else {
            ((stream_fmt.frame_rate as u64) << RATE_SHIFT) / dev_fmt.frame_rate as u64
        };
        let conv_buf = if stream_fmt == dev_fmt {
            Vec::new()
        } else {
            vec![0u8; buffer_frames as usize * dev_fmt.frame_bytes()]
        };
        Self {
            stream: Arc::clone(stream),
            stream_id,
            cb_threshold,
            stream_fmt,
            dev_fmt,
            conv_buf,
            rate_step,
            rate_acc: 0,
        }
    }

    pub fn needs_conversion(&self) -> bool {
        !self.conv_buf.is_empty()
    }

    /// Converts `src` (stream format) into `dst` (device format), returning
    /// (source frames consumed, destination frames produced).
    fn convert(&mut self, src: &[u8], dst: &mut [u8], max_dst_frames: usize) -> (usize, usize) {
        let src_fb = self.stream_fmt.frame_bytes();
        let dst_fb = self.dev_fmt.frame_bytes();
        let src_frames = src.len() / src_fb;
        let dst_cap = (dst.len() / dst_fb).min(max_dst_frames);

        let s_ch = self.stream_fmt.num_channels as usize;
        let d_ch = self.dev_fmt.num_channels as usize;
        let s_bytes = self.stream_fmt.sample_format.sample_bytes();
        let d_bytes = self.dev_fmt.sample_format.sample_bytes();

        let mut produced = 0usize;
        while produced < dst_cap {
            let src_idx = (self.rate_acc >> RATE_SHIFT) as usize;
            if src_idx >= src_frames {
                break;
            }
            let src_frame = &src[src_idx * src_fb..(src_idx + 1) * src_fb];
            let dst_frame = &mut dst[produced * dst_fb..(produced + 1) * dst_fb];

            for c in 0..d_ch {
                let value = if s_ch == 1 {
                    // Upmix: the one source channel feeds every output.
                    sample_to_f32(self.stream_fmt.sample_format, src_frame)
                } else if d_ch == 1 {
                    // Downmix: average all source channels.
                    let sum: f32 = (0..s_ch)
                        .map(|sc| {
                            sample_to_f32(self.stream_fmt.sample_format, &src_frame[sc * s_bytes..])
                        })
                        .sum();
                    sum / s_ch as f32
                } else if c < s_ch {
                    sample_to_f32(self.stream_fmt.sample_format, &src_frame[c * s_bytes..])
                } else {
                    0.0
                };
                f32_to_sample(
                    self.dev_fmt.sample_format,
                    value,
                    &mut dst_frame[c * d_bytes..(c + 1) * d_bytes],
                );
            }
            self.rate_acc += self.rate_step;
            produced += 1;
        }

        let consumed = ((self.rate_acc >> RATE_SHIFT) as usize).min(src_frames);
        self.rate_acc -= (consumed as u64) << RATE_SHIFT;
        (consumed, produced)
    }

    /// Mixes up to `max_frames` from the stream into the device buffer
    /// starting at `dst_offset_frames`. Returns device frames mixed; the
    /// stream's per-device cursor advances by the source frames consumed.
    ///
    /// `stream` is the locked object behind `self.stream`; the caller holds
    /// the lock for the whole device cycle.
    pub fn mix_into(
        &mut self,
        dev_idx: u32,
        stream: &mut Stream,
        dst: &mut [u8],
        dst_offset_frames: usize,
        max_frames: usize,
    ) -> usize {
        let dst_fb = self.dev_fmt.frame_bytes();
        let mut mixed = 0usize;

        while mixed < max_frames {
            let (src, src_frames) = {
                let (buf, frames) = stream.readable_for_dev(dev_idx);
                // The shm mapping outlives this cycle and the region cannot
                // be reused until the cursor we are about to advance passes
                // it, so detach the borrow from `stream`.
                let slice =
                    unsafe { std::slice::from_raw_parts(buf.as_ptr(), buf.len()) };
                (slice, frames)
            };
            if src_frames == 0 {
                break;
            }

            let want = max_frames - mixed;
            let dst_start = (dst_offset_frames + mixed) * dst_fb;

            let (consumed, produced) = if self.needs_conversion() {
                let mut conv = std::mem::take(&mut self.conv_buf);
                let (consumed, produced) = self.convert(src, &mut conv, want);
                mix::mix_add(
                    self.dev_fmt.sample_format,
                    &mut dst[dst_start..dst_start + produced * dst_fb],
                    &conv[..produced * dst_fb],
                );
                self.conv_buf = conv;
                (consumed, produced)
            } else {
                let n = want.min(src_frames);
                mix::mix_add(
                    self.dev_fmt.sample_format,
                    &mut dst[dst_start..dst_start + n * dst_fb],
                    &src[..n * dst_fb],
                );
                (n, n)
            };

            if consumed == 0 && produced == 0 {
                break;
            }
            stream.dev_offset_update(dev_idx, consumed as u32);
            mixed += produced;
        }
        mixed
    }

    /// Writes captured device samples into the stream's shm, converting as
    /// needed. Returns stream frames written.
    pub fn capture_from(
        &mut self,
        dev_idx: u32,
        stream: &mut Stream,
        src: &[u8],
        src_frames: usize,
    ) -> usize {
        let src_fb = self.dev_fmt.frame_bytes();
        debug_assert!(src.len() >= src_frames * src_fb);

        if !self.needs_conversion() {
            let (dst, usable) = stream.capture_write_buf(dev_idx, src_frames);
            let n = usable.min(src_frames);
            dst[..n * src_fb].copy_from_slice(&src[..n * src_fb]);
            stream.dev_offset_update(dev_idx, n as u32);
            return n;
        }

        // Capture conversion runs device->stream, so swap the roles the
        // converter was built with.
        let mut swapped = DevStream {
            stream: Arc::clone(&self.stream),
            stream_id: self.stream_id,
            cb_threshold: self.cb_threshold,
            stream_fmt: self.dev_fmt,
            dev_fmt: self.stream_fmt,
            conv_buf: std::mem::take(&mut self.conv_buf),
            rate_step: if self.dev_fmt.frame_rate == self.stream_fmt.frame_rate {
                1u64 << RATE_SHIFT
            } else {
                ((self.dev_fmt.frame_rate as u64) << RATE_SHIFT)
                    / self.stream_fmt.frame_rate as u64
            },
            rate_acc: self.rate_acc,
        };

        let stream_fb = self.stream_fmt.frame_bytes();
        let max_out = swapped.conv_buf.len() / stream_fb;
        let mut conv = std::mem::take(&mut swapped.conv_buf);
        let (_, produced) = swapped.convert(&src[..src_frames * src_fb], &mut conv, max_out);
        self.rate_acc = swapped.rate_acc;

        let (dst, usable) = stream.capture_write_buf(dev_idx, produced);
        let n = usable.min(produced);
        dst[..n * stream_fb].copy_from_slice(&conv[..n * stream_fb]);
        self.conv_buf = conv;
        stream.dev_offset_update(dev_idx, n as u32);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::test_support::make_stream;
    use sonara_proto::{Direction, SampleFormat};

    fn commit_s16(stream: &mut Stream, samples: &[i16]) {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let frames = bytes.len() / stream.format.frame_bytes();
        let (buf, usable) = stream.shm_mut().producer_get_write_buf(frames);
        assert!(usable >= frames);
        buf[..bytes.len()].copy_from_slice(&bytes);
        stream.shm_mut().producer_commit(frames);
        stream.update_queued_frames();
    }

    #[test]
    fn test_mix_same_format_is_bit_exact() {
        let (mut stream, client) = make_stream(Direction::Output, 1);
        stream.dev_attach(7);
        let arc = Arc::new(Mutex::new(make_stream(Direction::Output, 2).0));
        let mut ds = DevStream::new(&arc, Format::new(SampleFormat::S16LE, 48000, 2));
        assert!(!ds.needs_conversion());

        commit_s16(&mut stream, &[0x1234; 8]); // 4 stereo frames
        let mut dev_buf = vec![0u8; 16 * 4];
        let mixed = ds.mix_into(7, &mut stream, &mut dev_buf, 0, 16);
        assert_eq!(mixed, 4);
        for chunk in dev_buf[..16].chunks_exact(2) {
            assert_eq!(i16::from_le_bytes([chunk[0], chunk[1]]), 0x1234);
        }
        assert!(dev_buf[16..].iter().all(|b| *b == 0));
        assert_eq!(stream.dev_offset(7), 4);
        let _ = nix::unistd::close(client);
    }

    #[test]
    fn test_mix_sums_onto_existing_samples() {
        let (mut stream, client) = make_stream(Direction::Output, 1);
        stream.dev_attach(7);
        let arc = Arc::new(Mutex::new(make_stream(Direction::Output, 2).0));
        let mut ds = DevStream::new(&arc, Format::new(SampleFormat::S16LE, 48000, 2));

        commit_s16(&mut stream, &[100, 100]);
        let mut dev_buf: Vec<u8> = [50i16, -50]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let mixed = ds.mix_into(7, &mut stream, &mut dev_buf, 0, 1);
        assert_eq!(mixed, 1);
        let out: Vec<i16> = dev_buf
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(out, vec![150, 50]);
        let _ = nix::unistd::close(client);
    }

    #[test]
    fn test_mix_limited_by_available_frames() {
        let (mut stream, client) = make_stream(Direction::Output, 1);
        stream.dev_attach(7);
        let arc = Arc::new(Mutex::new(make_stream(Direction::Output, 2).0));
        let mut ds = DevStream::new(&arc, Format::new(SampleFormat::S16LE, 48000, 2));

        commit_s16(&mut stream, &[1; 4]); // 2 frames
        let mut dev_buf = vec![0u8; 64];
        let mixed = ds.mix_into(7, &mut stream, &mut dev_buf, 0, 16);
        assert_eq!(mixed, 2);
        let _ = nix::unistd::close(client);
    }

    #[test]
    fn test_channel_upmix_mono_to_stereo() {
        // Mono S16 stream attached to a stereo device.
        let (server_fd, client_fd) = crate::unix::audio_socketpair().unwrap();
        let config = crate::stream::StreamConfig {
            stream_id: 9,
            stream_type: sonara_proto::StreamType::Default,
            direction: Direction::Output,
            dev_idx: sonara_proto::NO_DEVICE,
            flags: 0,
            format: Format::new(SampleFormat::S16LE, 48000, 1),
            buffer_frames: 960,
            cb_threshold: 480,
            audio_fd: server_fd,
        };
        let arc = Arc::new(Mutex::new(Stream::new(config).unwrap()));
        let mut ds = DevStream::new(&arc, Format::new(SampleFormat::S16LE, 48000, 2));
        assert!(ds.needs_conversion());

        let mut stream = arc.lock().unwrap();
        stream.dev_attach(7);
        commit_s16(&mut stream, &[8000, -8000]); // 2 mono frames
        let mut dev_buf = vec![0u8; 8 * 4];
        let mixed = ds.mix_into(7, &mut stream, &mut dev_buf, 0, 8);
        assert_eq!(mixed, 2);
        let out: Vec<i16> = dev_buf[..8]
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        // Each mono sample lands on both channels (within f32 rounding).
        assert!((out[0] - 8000).abs() <= 1, "got {}", out[0]);
        assert!((out[1] - 8000).abs() <= 1);
        assert!((out[2] + 8000).abs() <= 1);
        assert!((out[3] + 8000).abs() <= 1);
        drop(stream);
        let _ = nix::unistd::close(client_fd);
    }

    #[test]
    fn test_capture_writes_into_stream_shm() {
        let (mut stream, client) = make_stream(Direction::Input, 1);
        stream.dev_attach(4);
        let arc = Arc::new(Mutex::new(make_stream(Direction::Input, 2).0));
        let mut ds = DevStream::new(&arc, Format::new(SampleFormat::S16LE, 48000, 2));

        let src: Vec<u8> = [0x2222i16; 8].iter().flat_map(|s| s.to_le_bytes()).collect();
        let written = ds.capture_from(4, &mut stream, &src, 4);
        assert_eq!(written, 4);

        stream.update_input_write_pointer();
        assert_eq!(stream.shm().curr_read_frames(), 4);
        let (buf, frames) = stream.shm().consumer_get_read_buf();
        assert_eq!(frames, 4);
        for chunk in buf.chunks_exact(2) {
            assert_eq!(i16::from_le_bytes([chunk[0], chunk[1]]), 0x2222);
        }
        let _ = nix::unistd::close(client);
    }
}
