//! Server-side client streams
//!
//! A `Stream` is one client's audio endpoint: the shared-memory ring, the
//! audio-message socket used for fetch/ready signaling, callback timing
//! state, and the per-device read/write offsets that let one stream feed
//! several devices at once.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use sonara_proto::{
    AudioMessage, AudioMsgId, Direction, Format, SampleFormat, StreamFlags, StreamId, StreamType,
    NO_DEVICE,
};
use tracing::debug;

use crate::buffer_share::BufferShare;
use crate::error::{CoreError, CoreResult};
use crate::shm::ShmRing;
use crate::unix;

/// Streams shorter than this (buffer or callback threshold) cannot be
/// scheduled reliably and are rejected at create.
pub const MIN_BUFFER_TIME_US: u64 = 1000;

/// Parameters for creating a stream, decoded from `ConnectStream`.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub stream_id: StreamId,
    pub stream_type: StreamType,
    pub direction: Direction,
    /// Device index to pin to; `NO_DEVICE` for normal routing.
    pub dev_idx: u32,
    pub flags: u32,
    pub format: Format,
    pub buffer_frames: u32,
    pub cb_threshold: u32,
    /// Server side of the audio socketpair; the stream takes ownership.
    pub audio_fd: RawFd,
}

fn meets_min_buffer_time(frames: u32, rate: u32) -> bool {
    frames as u64 * 1_000_000 > MIN_BUFFER_TIME_US * rate as u64
}

fn verify_config(config: &StreamConfig) -> CoreResult<()> {
    let rate = config.format.frame_rate;
    if rate == 0 {
        return Err(CoreError::InvalidArgument("zero frame rate"));
    }
    if !meets_min_buffer_time(config.buffer_frames, rate) {
        return Err(CoreError::InvalidArgument("buffer_frames below 1 ms"));
    }
    if !meets_min_buffer_time(config.cb_threshold, rate) {
        return Err(CoreError::InvalidArgument("cb_threshold below 1 ms"));
    }
    if config.cb_threshold > config.buffer_frames / 2 {
        return Err(CoreError::InvalidArgument(
            "cb_threshold above half the buffer",
        ));
    }
    match config.format.sample_format {
        SampleFormat::S16LE | SampleFormat::S24LE | SampleFormat::S32LE | SampleFormat::U8 => {}
        SampleFormat::S24LE3 => {
            return Err(CoreError::InvalidArgument("packed 24-bit not accepted"))
        }
    }
    if config.format.num_channels == 0 || config.format.num_channels > 8 {
        return Err(CoreError::InvalidArgument("bad channel count"));
    }
    match config.direction {
        Direction::Output | Direction::Input => Ok(()),
        _ => Err(CoreError::InvalidArgument("bad stream direction")),
    }
}

/// One client audio stream on the server side.
pub struct Stream {
    pub id: StreamId,
    pub stream_type: StreamType,
    pub direction: Direction,
    pub flags: StreamFlags,
    pub format: Format,
    pub buffer_frames: u32,
    pub cb_threshold: u32,

    pub is_draining: bool,
    pub is_pinned: bool,
    pub pinned_dev_idx: u32,

    /// The device whose cadence drives this stream's callbacks.
    pub master_dev: Option<u32>,
    pub num_attached_devs: u32,

    /// Cached shm level, refreshed once per mix cycle.
    pub queued_frames: usize,

    pub next_cb_ts: Option<Instant>,
    pub sleep_interval: Duration,
    last_fetch: Option<Instant>,
    pub longest_fetch_interval: Duration,
    longest_reported: Duration,
    pub num_overruns: u32,

    fd: RawFd,
    shm: ShmRing,
    /// Per-device offsets into this stream's shm.
    buf_state: BufferShare,
}

impl Stream {
    /// Takes ownership of `config.audio_fd` in every case: on error the fd
    /// is closed here so callers never see a half-owned descriptor.
    pub fn new(config: StreamConfig) -> CoreResult<Self> {
        if let Err(e) = verify_config(&config) {
            if config.audio_fd >= 0 {
                let _ = nix::unistd::close(config.audio_fd);
            }
            return Err(e);
        }

        let frame_bytes = config.format.frame_bytes();
        let shm_name = format!("sonara-stream-{:08x}", config.stream_id);
        let shm = match ShmRing::create(&shm_name, config.buffer_frames as usize, frame_bytes) {
            Ok(shm) => shm,
            Err(e) => {
                if config.audio_fd >= 0 {
                    let _ = nix::unistd::close(config.audio_fd);
                }
                return Err(e);
            }
        };

        let sleep_interval = unix::frames_to_duration(
            config.cb_threshold as u64,
            config.format.frame_rate,
        );

        debug!(
            stream = format_args!("{:#x}", config.stream_id),
            buffer_frames = config.buffer_frames,
            cb_threshold = config.cb_threshold,
            "stream created"
        );

        Ok(Self {
            id: config.stream_id,
            stream_type: config.stream_type,
            direction: config.direction,
            flags: StreamFlags(config.flags),
            format: config.format,
            buffer_frames: config.buffer_frames,
            cb_threshold: config.cb_threshold,
            is_draining: false,
            is_pinned: config.dev_idx != NO_DEVICE,
            pinned_dev_idx: config.dev_idx,
            master_dev: None,
            num_attached_devs: 0,
            queued_frames: 0,
            next_cb_ts: None,
            sleep_interval,
            last_fetch: None,
            longest_fetch_interval: Duration::ZERO,
            longest_reported: Duration::ZERO,
            num_overruns: 0,
            fd: config.audio_fd,
            shm,
            buf_state: BufferShare::new(config.buffer_frames),
        })
    }

    pub fn audio_fd(&self) -> RawFd {
        self.fd
    }

    pub fn shm(&self) -> &ShmRing {
        &self.shm
    }

    pub fn shm_mut(&mut self) -> &mut ShmRing {
        &mut self.shm
    }

    /// Largest fetch the client accepts in one request.
    pub fn max_write_frames(&self) -> u32 {
        if self.flags.contains(StreamFlags::BULK_AUDIO_OK) {
            self.buffer_frames
        } else {
            self.cb_threshold
        }
    }

    // ---- device attachment ----

    pub fn dev_attach(&mut self, dev_idx: u32) {
        if self.buf_state.add_id(dev_idx as u64) {
            self.num_attached_devs += 1;
        }
        if self.master_dev.is_none() {
            self.master_dev = Some(dev_idx);
        }
    }

    /// Detaches a device; if it was the master, the first still-attached
    /// device (in attach order) takes over.
    pub fn dev_detach(&mut self, dev_idx: u32) {
        if self.buf_state.rm_id(dev_idx as u64) {
            self.num_attached_devs = self.num_attached_devs.saturating_sub(1);
        }
        if self.master_dev == Some(dev_idx) {
            self.master_dev = self.buf_state.ids().next().map(|id| id as u32);
        }
    }

    pub fn is_attached(&self, dev_idx: u32) -> bool {
        self.buf_state.ids().any(|id| id == dev_idx as u64)
    }

    pub fn dev_offset(&self, dev_idx: u32) -> u32 {
        self.buf_state.id_offset(dev_idx as u64)
    }

    pub fn dev_offset_update(&mut self, dev_idx: u32, frames: u32) {
        self.buf_state.offset_update(dev_idx as u64, frames);
    }

    // ---- playback path ----

    /// Refreshes the cached count of frames the client has committed.
    pub fn update_queued_frames(&mut self) {
        self.queued_frames = self
            .shm
            .curr_read_frames()
            .min(self.buffer_frames as usize);
    }

    /// Frames this device can still mix from the stream.
    pub fn playable_frames(&self, dev_idx: u32) -> usize {
        self.queued_frames
            .saturating_sub(self.dev_offset(dev_idx) as usize)
    }

    /// Readable samples for a device, past what it has already mixed.
    pub fn readable_for_dev(&self, dev_idx: u32) -> (&[u8], usize) {
        self.shm.get_readable_frames(self.dev_offset(dev_idx) as usize)
    }

    /// Advances the shm read pointer past frames every attached device has
    /// mixed.
    pub fn update_output_read_pointer(&mut self) {
        let consumed = self.buf_state.new_write_point();
        if consumed > 0 {
            self.shm.consumer_release(consumed as usize);
        }
    }

    /// Asks the client for `cb_threshold` more frames. At most one request
    /// is in flight; a pending one suppresses the next until answered.
    pub fn request_audio(&mut self, now: Instant) -> CoreResult<()> {
        if self.direction != Direction::Output {
            return Ok(());
        }
        if self.shm.callback_pending() {
            return Ok(());
        }
        self.record_fetch_interval(now);
        self.last_fetch = Some(now);
        self.shm.set_callback_pending(true);
        self.send_audio_message(AudioMessage::request_data(self.cb_threshold))
    }

    /// Handles the client's DATA_READY reply.
    pub fn data_ready(&mut self, frames: u32) {
        let _ = frames;
        self.shm.set_callback_pending(false);
    }

    // ---- capture path ----

    /// True when enough captured frames are queued to wake the client.
    pub fn input_level_met(&self) -> bool {
        self.shm.curr_read_frames() >= self.cb_threshold as usize
    }

    /// Space left for capture, and whether writing `frames` would overrun.
    pub fn check_write_overrun(&mut self, frames: usize) -> bool {
        if self.shm.writable_frames() < frames {
            self.num_overruns += 1;
            debug!(
                stream = format_args!("{:#x}", self.id),
                overruns = self.num_overruns,
                "capture overrun, dropping buffer"
            );
            return true;
        }
        false
    }

    /// Writable shm region for one capture device, past what it already
    /// wrote this cycle.
    pub fn capture_write_buf(&mut self, dev_idx: u32, max_frames: usize) -> (&mut [u8], usize) {
        let offset = self.dev_offset(dev_idx) as usize;
        self.shm.producer_get_write_buf_at(offset, max_frames)
    }

    /// Commits frames every attached device has captured into shm.
    pub fn update_input_write_pointer(&mut self) {
        let written = self.buf_state.new_write_point();
        if written > 0 {
            self.shm.producer_commit(written as usize);
        }
    }

    /// Tells a capture client that frames are ready.
    pub fn audio_ready(&mut self, frames: u32) -> CoreResult<()> {
        self.send_audio_message(AudioMessage::data_ready(frames))
    }

    // ---- timing ----

    fn record_fetch_interval(&mut self, now: Instant) {
        if let Some(last) = self.last_fetch {
            let interval = now.duration_since(last);
            if interval > self.longest_fetch_interval {
                self.longest_fetch_interval = interval;
            }
        }
    }

    /// A grown longest-fetch-interval worth reporting as a metric, at most
    /// once per doubling past the floor.
    pub fn take_fetch_report(&mut self) -> Option<Duration> {
        const REPORT_FLOOR: Duration = Duration::from_millis(100);
        let longest = self.longest_fetch_interval;
        if longest >= REPORT_FLOOR && longest >= self.longest_reported * 2 {
            self.longest_reported = longest;
            return Some(longest);
        }
        None
    }

    fn send_audio_message(&self, msg: AudioMessage) -> CoreResult<()> {
        let bytes = msg.encode();
        match nix::unistd::write(self.fd, &bytes) {
            Ok(n) if n == bytes.len() => Ok(()),
            Ok(_) => Err(CoreError::Transient),
            Err(nix::Error::EAGAIN) => Err(CoreError::Transient),
            Err(nix::Error::EPIPE) => Err(CoreError::PeerGone),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads one message from the audio socket, if any.
    pub fn read_audio_message(&self) -> CoreResult<Option<AudioMessage>> {
        let mut buf = [0u8; AudioMessage::SIZE];
        match nix::unistd::read(self.fd, &mut buf) {
            Ok(0) => Err(CoreError::PeerGone),
            Ok(n) if n >= AudioMessage::SIZE => Ok(Some(AudioMessage::decode(&buf)?)),
            Ok(_) => Ok(None),
            Err(nix::Error::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.fd);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A stream wired to a local socketpair; returns the client end so
    /// tests can play the client role.
    pub fn make_stream(direction: Direction, id: StreamId) -> (Stream, RawFd) {
        let (server_fd, client_fd) = unix::audio_socketpair().unwrap();
        let config = StreamConfig {
            stream_id: id,
            stream_type: StreamType::Default,
            direction,
            dev_idx: NO_DEVICE,
            flags: 0,
            format: Format::new(SampleFormat::S16LE, 48000, 2),
            buffer_frames: 960,
            cb_threshold: 480,
            audio_fd: server_fd,
        };
        (Stream::new(config).unwrap(), client_fd)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::make_stream;
    use super::*;

    fn base_config(audio_fd: RawFd) -> StreamConfig {
        StreamConfig {
            stream_id: 1,
            stream_type: StreamType::Default,
            direction: Direction::Output,
            dev_idx: NO_DEVICE,
            flags: 0,
            format: Format::new(SampleFormat::S16LE, 48000, 2),
            buffer_frames: 960,
            cb_threshold: 480,
            audio_fd,
        }
    }

    fn socketpair() -> (RawFd, RawFd) {
        unix::audio_socketpair().unwrap()
    }

    #[test]
    fn test_create_valid_stream() {
        let (fd, client) = socketpair();
        let stream = Stream::new(base_config(fd)).unwrap();
        assert_eq!(stream.buffer_frames, 960);
        assert!(!stream.is_pinned);
        assert_eq!(stream.shm().buffer_frames(), 960);
        let _ = nix::unistd::close(client);
    }

    #[test]
    fn test_cb_threshold_boundary() {
        // Exactly half the buffer is accepted; one frame more is not.
        let (fd, client) = socketpair();
        let mut config = base_config(fd);
        config.cb_threshold = 480;
        assert!(Stream::new(config).is_ok());
        let _ = nix::unistd::close(client);

        let (fd, client) = socketpair();
        let mut config = base_config(fd);
        config.cb_threshold = 481;
        assert!(matches!(
            Stream::new(config),
            Err(CoreError::InvalidArgument(_))
        ));
        let _ = nix::unistd::close(client);
    }

    #[test]
    fn test_tiny_buffers_rejected() {
        let (fd, client) = socketpair();
        let mut config = base_config(fd);
        config.buffer_frames = 48; // exactly 1 ms at 48 kHz: too small
        config.cb_threshold = 24;
        assert!(Stream::new(config).is_err());
        let _ = nix::unistd::close(client);
    }

    #[test]
    fn test_s24_3le_rejected() {
        let (fd, client) = socketpair();
        let mut config = base_config(fd);
        config.format = Format::new(SampleFormat::S24LE3, 48000, 2);
        assert!(Stream::new(config).is_err());
        let _ = nix::unistd::close(client);
    }

    #[test]
    fn test_loopback_direction_rejected() {
        let (fd, client) = socketpair();
        let mut config = base_config(fd);
        config.direction = Direction::PostDsp;
        assert!(Stream::new(config).is_err());
        let _ = nix::unistd::close(client);
    }

    #[test]
    fn test_pinned_flag_from_dev_idx() {
        let (fd, client) = socketpair();
        let mut config = base_config(fd);
        config.dev_idx = 5;
        let stream = Stream::new(config).unwrap();
        assert!(stream.is_pinned);
        assert_eq!(stream.pinned_dev_idx, 5);
        let _ = nix::unistd::close(client);
    }

    #[test]
    fn test_master_device_nomination() {
        let (mut stream, client) = make_stream(Direction::Output, 1);
        assert_eq!(stream.master_dev, None);

        stream.dev_attach(3);
        stream.dev_attach(4);
        assert_eq!(stream.master_dev, Some(3));
        assert_eq!(stream.num_attached_devs, 2);

        // Detaching a non-master leaves the master alone.
        stream.dev_detach(4);
        assert_eq!(stream.master_dev, Some(3));

        stream.dev_attach(4);
        stream.dev_detach(3);
        assert_eq!(stream.master_dev, Some(4), "next attached takes over");

        stream.dev_detach(4);
        assert_eq!(stream.master_dev, None, "orphaned stream has no master");
        assert_eq!(stream.num_attached_devs, 0);
        let _ = nix::unistd::close(client);
    }

    #[test]
    fn test_request_audio_sets_pending_and_sends() {
        let (mut stream, client) = make_stream(Direction::Output, 1);
        stream.request_audio(Instant::now()).unwrap();
        assert!(stream.shm().callback_pending());

        let mut buf = [0u8; AudioMessage::SIZE];
        let n = nix::unistd::read(client, &mut buf).unwrap();
        assert_eq!(n, AudioMessage::SIZE);
        let msg = AudioMessage::decode(&buf).unwrap();
        assert_eq!(msg.id, AudioMsgId::RequestData);
        assert_eq!(msg.frames, 480);
        let _ = nix::unistd::close(client);
    }

    #[test]
    fn test_second_request_suppressed_while_pending() {
        let (mut stream, client) = make_stream(Direction::Output, 1);
        stream.request_audio(Instant::now()).unwrap();
        stream.request_audio(Instant::now()).unwrap();

        let mut buf = [0u8; AudioMessage::SIZE * 2];
        let n = nix::unistd::read(client, &mut buf).unwrap();
        assert_eq!(n, AudioMessage::SIZE, "only one request on the wire");

        stream.data_ready(480);
        stream.request_audio(Instant::now()).unwrap();
        let n = nix::unistd::read(client, &mut buf).unwrap();
        assert_eq!(n, AudioMessage::SIZE);
        let _ = nix::unistd::close(client);
    }

    #[test]
    fn test_playable_frames_tracks_dev_offset() {
        let (mut stream, client) = make_stream(Direction::Output, 1);
        stream.dev_attach(3);

        // Client commits 480 frames.
        let (buf, usable) = stream.shm_mut().producer_get_write_buf(480);
        assert!(usable >= 480);
        buf.fill(0x11);
        stream.shm_mut().producer_commit(480);

        stream.update_queued_frames();
        assert_eq!(stream.playable_frames(3), 480);

        stream.dev_offset_update(3, 100);
        assert_eq!(stream.playable_frames(3), 380);

        stream.update_output_read_pointer();
        assert_eq!(stream.shm().curr_read_frames(), 380);
        let _ = nix::unistd::close(client);
    }

    #[test]
    fn test_bulk_audio_max_write() {
        let (fd, client) = socketpair();
        let mut config = base_config(fd);
        config.flags = StreamFlags::BULK_AUDIO_OK;
        let stream = Stream::new(config).unwrap();
        assert_eq!(stream.max_write_frames(), 960);
        let _ = nix::unistd::close(client);
    }
}
