//! The realtime audio thread
//!
//! One thread services every open device at hardware cadence: it polls a
//! command eventfd plus each attached output stream's audio socket, runs
//! the per-device state machine, mixes client shm data into output buffers
//! (and demixes capture the other way), and keeps per-device wake deadlines
//! so `poll()` sleeps exactly until the next device needs refilling.
//!
//! Cross-thread mutations arrive only through the command channel and are
//! applied between service iterations, never mid-mix. Replies to the main
//! thread go back over a second channel with its own eventfd.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, error, info, warn};

use sonara_proto::{Direction, StreamFlags, StreamId};

use crate::dev_stream::DevStream;
use crate::device::{self, Device, DeviceHandle, DeviceState, OutputCtx, InputCtx, RampStartEffect};
use crate::error::{CoreError, CoreResult};
use crate::mix::RemixConverter;
use crate::ramp::{RampCompletion, RampRequest};
use crate::stream::Stream;
use crate::system_state::SystemShared;
use crate::unix::{frames_to_duration, EventFd};

/// Floor for computed sleep intervals, so an empty device cannot spin the
/// thread.
const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Commands from the main thread. Variants carrying a reply sender are
/// serviced synchronously: the caller blocks until the audio thread answers
/// between iterations.
pub enum AudioMsg {
    AddOpenDev {
        dev: DeviceHandle,
        reply: Sender<CoreResult<()>>,
    },
    RmOpenDev {
        dev_idx: u32,
        reply: Sender<CoreResult<()>>,
    },
    AddStream {
        stream: Arc<Mutex<Stream>>,
        devs: Vec<DeviceHandle>,
        reply: Sender<CoreResult<()>>,
    },
    DisconnectStream {
        stream: Arc<Mutex<Stream>>,
        dev_idx: Option<u32>,
        reply: Sender<CoreResult<()>>,
    },
    StartRamp {
        dev_idx: u32,
        request: RampRequest,
    },
    ConfigGlobalRemix {
        num_channels: u32,
        coefficients: Vec<f32>,
    },
    DumpDebugInfo {
        reply: Sender<String>,
    },
    Stop,
}

/// Messages from the audio thread to the main loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MainMsg {
    /// Device hit an unrecoverable state; disable and re-enable it.
    ResetDevice { dev_idx: u32 },
    /// A ramp finished (or an unmute ramp started); apply hardware mute.
    SetDeviceMuteState { dev_idx: u32 },
    /// The client side of a stream's audio socket is gone.
    StreamError { stream_id: StreamId },
    /// A stream's fetch interval grew past the reporting floor.
    LongestFetchDelay { stream_id: StreamId, millis: u64 },
}

struct OpenDev {
    handle: DeviceHandle,
    dev_idx: u32,
    direction: Direction,
    wake_ts: Instant,
}

/// Main-thread handle to the audio thread.
pub struct AudioThread {
    tx: Sender<AudioMsg>,
    wake: Arc<EventFd>,
    main_rx: Receiver<MainMsg>,
    main_wake: Arc<EventFd>,
    handle: Option<JoinHandle<()>>,
}

impl AudioThread {
    pub fn start(system: Arc<SystemShared>) -> CoreResult<Self> {
        let (tx, rx) = unbounded::<AudioMsg>();
        let (main_tx, main_rx) = unbounded::<MainMsg>();
        let wake = Arc::new(EventFd::new()?);
        let main_wake = Arc::new(EventFd::new()?);

        let thread_wake = Arc::clone(&wake);
        let thread_main_wake = Arc::clone(&main_wake);
        let handle = std::thread::Builder::new()
            .name("sonara-audio".into())
            .spawn(move || {
                let mut thread = Thread {
                    rx,
                    wake: thread_wake,
                    main_tx,
                    main_wake: thread_main_wake,
                    system,
                    open_devs: Vec::new(),
                    remix: None,
                };
                thread.run();
            })
            .map_err(|_| CoreError::ResourceExhausted("audio thread spawn"))?;

        Ok(Self {
            tx,
            wake,
            main_rx,
            main_wake,
            handle: Some(handle),
        })
    }

    /// Fd the server loop polls for [`MainMsg`] arrivals.
    pub fn main_msg_fd(&self) -> RawFd {
        self.main_wake.as_raw_fd()
    }

    /// Drains queued audio->main messages after a wakeup.
    pub fn drain_main_msgs(&self) -> Vec<MainMsg> {
        self.main_wake.drain();
        let mut msgs = Vec::new();
        while let Ok(msg) = self.main_rx.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    fn send(&self, msg: AudioMsg) -> CoreResult<()> {
        self.tx.send(msg).map_err(|_| CoreError::ThreadDown)?;
        self.wake.notify();
        Ok(())
    }

    fn send_sync<T>(&self, make: impl FnOnce(Sender<T>) -> AudioMsg) -> CoreResult<T> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(make(reply_tx))?;
        reply_rx.recv().map_err(|_| CoreError::ThreadDown)
    }

    pub fn add_open_dev(&self, dev: DeviceHandle) -> CoreResult<()> {
        self.send_sync(|reply| AudioMsg::AddOpenDev { dev, reply })?
    }

    pub fn rm_open_dev(&self, dev_idx: u32) -> CoreResult<()> {
        self.send_sync(|reply| AudioMsg::RmOpenDev { dev_idx, reply })?
    }

    pub fn add_stream(
        &self,
        stream: Arc<Mutex<Stream>>,
        devs: Vec<DeviceHandle>,
    ) -> CoreResult<()> {
        self.send_sync(|reply| AudioMsg::AddStream {
            stream,
            devs,
            reply,
        })?
    }

    /// Detaches a stream from one device, or from all when `dev_idx` is
    /// None. Any pending fetch for the stream is cancelled.
    pub fn disconnect_stream(
        &self,
        stream: Arc<Mutex<Stream>>,
        dev_idx: Option<u32>,
    ) -> CoreResult<()> {
        self.send_sync(|reply| AudioMsg::DisconnectStream {
            stream,
            dev_idx,
            reply,
        })?
    }

    pub fn dev_start_ramp(&self, dev_idx: u32, request: RampRequest) -> CoreResult<()> {
        self.send(AudioMsg::StartRamp { dev_idx, request })
    }

    pub fn config_global_remix(&self, num_channels: u32, coefficients: Vec<f32>) -> CoreResult<()> {
        self.send(AudioMsg::ConfigGlobalRemix {
            num_channels,
            coefficients,
        })
    }

    pub fn dump_debug_info(&self) -> CoreResult<String> {
        self.send_sync(|reply| AudioMsg::DumpDebugInfo { reply })
    }

    /// Asks the thread to exit; the join happens on drop. Lets shutdown
    /// stop audio before tearing down sockets.
    pub fn stop(&self) {
        let _ = self.send(AudioMsg::Stop);
    }
}

impl Drop for AudioThread {
    fn drop(&mut self) {
        let _ = self.send(AudioMsg::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Thread {
    rx: Receiver<AudioMsg>,
    wake: Arc<EventFd>,
    main_tx: Sender<MainMsg>,
    main_wake: Arc<EventFd>,
    system: Arc<SystemShared>,
    open_devs: Vec<OpenDev>,
    remix: Option<RemixConverter>,
}

/// Best-effort promotion to SCHED_FIFO; unprivileged processes fall back to
/// normal scheduling.
fn try_set_realtime_priority() {
    unsafe {
        let param = libc::sched_param { sched_priority: 10 };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            info!("running without SCHED_FIFO (no permission)");
        } else {
            info!("audio thread scheduled SCHED_FIFO");
        }
    }
}

impl Thread {
    fn run(&mut self) {
        info!("audio thread started");
        try_set_realtime_priority();

        loop {
            let stream_fds = self.collect_stream_fds();
            let timeout = self.poll_timeout();

            let mut fds = Vec::with_capacity(1 + stream_fds.len());
            fds.push(PollFd::new(self.wake.as_raw_fd(), PollFlags::POLLIN));
            for (fd, _) in &stream_fds {
                fds.push(PollFd::new(*fd, PollFlags::POLLIN));
            }

            match poll(&mut fds, timeout) {
                Ok(_) => {}
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    error!("poll failed: {e}");
                    break;
                }
            }

            let mut ready_fds = Vec::new();
            if let Some(revents) = fds[0].revents() {
                if revents.contains(PollFlags::POLLIN) {
                    self.wake.drain();
                    if self.handle_commands() {
                        break;
                    }
                }
            }
            for (i, (fd, stream)) in stream_fds.iter().enumerate() {
                if let Some(revents) = fds[i + 1].revents() {
                    if !revents.is_empty() {
                        ready_fds.push((*fd, Arc::clone(stream)));
                    }
                }
            }
            for (_, stream) in ready_fds {
                self.handle_stream_message(&stream);
            }

            self.service_devices();
        }

        info!("audio thread shutting down");
    }

    fn send_main(&self, msg: MainMsg) {
        if self.main_tx.send(msg).is_ok() {
            self.main_wake.notify();
        }
    }

    /// Audio sockets of every stream attached to an open output device,
    /// deduplicated.
    fn collect_stream_fds(&self) -> Vec<(RawFd, Arc<Mutex<Stream>>)> {
        let mut seen: HashMap<StreamId, ()> = HashMap::new();
        let mut out = Vec::new();
        for od in &self.open_devs {
            if od.direction != Direction::Output {
                continue;
            }
            let dev = od.handle.lock().unwrap();
            for ds in &dev.common().streams {
                if seen.insert(ds.stream_id, ()).is_none() {
                    let fd = ds.stream.lock().unwrap().audio_fd();
                    out.push((fd, Arc::clone(&ds.stream)));
                }
            }
        }
        out
    }

    fn poll_timeout(&self) -> i32 {
        let now = Instant::now();
        let next = self.open_devs.iter().map(|od| od.wake_ts).min();
        match next {
            Some(ts) => {
                let ms = ts.saturating_duration_since(now).as_millis() as i32;
                ms.max(0)
            }
            None => -1,
        }
    }

    /// Returns true when a Stop command was received.
    fn handle_commands(&mut self) -> bool {
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                AudioMsg::AddOpenDev { dev, reply } => {
                    let (dev_idx, direction) = {
                        let guard = dev.lock().unwrap();
                        (guard.common().info.idx, guard.common().direction)
                    };
                    if self.open_devs.iter().any(|od| od.dev_idx == dev_idx) {
                        let _ = reply.send(Err(CoreError::DeviceBusy(dev_idx)));
                        continue;
                    }
                    debug!(dev_idx, "audio thread adopted open device");
                    self.open_devs.push(OpenDev {
                        handle: dev,
                        dev_idx,
                        direction,
                        wake_ts: Instant::now(),
                    });
                    let _ = reply.send(Ok(()));
                }
                AudioMsg::RmOpenDev { dev_idx, reply } => {
                    let _ = reply.send(self.rm_open_dev(dev_idx));
                }
                AudioMsg::AddStream {
                    stream,
                    devs,
                    reply,
                } => {
                    let _ = reply.send(self.add_stream(stream, devs));
                }
                AudioMsg::DisconnectStream {
                    stream,
                    dev_idx,
                    reply,
                } => {
                    let _ = reply.send(self.disconnect_stream(stream, dev_idx));
                }
                AudioMsg::StartRamp { dev_idx, request } => {
                    self.start_ramp(dev_idx, request);
                }
                AudioMsg::ConfigGlobalRemix {
                    num_channels,
                    coefficients,
                } => {
                    self.remix = RemixConverter::new(num_channels as usize, coefficients);
                    if self.remix.is_none() {
                        warn!("rejected malformed global remix config");
                    }
                }
                AudioMsg::DumpDebugInfo { reply } => {
                    let _ = reply.send(self.dump_debug_info());
                }
                AudioMsg::Stop => return true,
            }
        }
        false
    }

    fn rm_open_dev(&mut self, dev_idx: u32) -> CoreResult<()> {
        let pos = self
            .open_devs
            .iter()
            .position(|od| od.dev_idx == dev_idx)
            .ok_or(CoreError::NoSuchDevice(dev_idx))?;
        let od = self.open_devs.remove(pos);

        // Detach whatever is still riding this device.
        let mut dev = od.handle.lock().unwrap();
        let ids: Vec<StreamId> = dev.common().streams.iter().map(|s| s.stream_id).collect();
        for id in ids {
            if let Some(ds) = device::rm_stream(dev.as_mut(), id) {
                let mut stream = ds.stream.lock().unwrap();
                stream.dev_detach(dev_idx);
                stream.shm().set_callback_pending(false);
            }
        }
        Ok(())
    }

    fn add_stream(
        &mut self,
        stream: Arc<Mutex<Stream>>,
        devs: Vec<DeviceHandle>,
    ) -> CoreResult<()> {
        let (stream_id, direction, flags) = {
            let s = stream.lock().unwrap();
            (s.id, s.direction, s.flags)
        };
        let mut attached = 0;
        for handle in devs {
            let mut dev = handle.lock().unwrap();
            let dev_idx = dev.common().info.idx;
            if !device::is_open(dev.as_ref()) {
                warn!(dev_idx, "skipping closed device on stream attach");
                continue;
            }
            let Some(fmt) = dev.common().format else {
                continue;
            };
            if dev.common().streams.iter().any(|ds| ds.stream_id == stream_id) {
                continue;
            }
            device::add_stream(dev.as_mut(), DevStream::new(&stream, fmt));
            stream.lock().unwrap().dev_attach(dev_idx);
            attached += 1;
        }
        if attached == 0 {
            return Err(CoreError::NoSuchDevice(0));
        }

        // First fetch primes the pipeline for output streams.
        if direction == Direction::Output && !flags.contains(StreamFlags::TRIGGER_ONLY) {
            let mut s = stream.lock().unwrap();
            if let Err(e) = s.request_audio(Instant::now()) {
                if matches!(e, CoreError::PeerGone) {
                    self.send_main(MainMsg::StreamError { stream_id: s.id });
                }
            }
        }
        // Pick up new stream state promptly.
        for od in &mut self.open_devs {
            od.wake_ts = Instant::now();
        }
        Ok(())
    }

    fn disconnect_stream(
        &mut self,
        stream: Arc<Mutex<Stream>>,
        dev_idx: Option<u32>,
    ) -> CoreResult<()> {
        let stream_id = stream.lock().unwrap().id;
        for od in &self.open_devs {
            if let Some(only) = dev_idx {
                if od.dev_idx != only {
                    continue;
                }
            }
            let mut dev = od.handle.lock().unwrap();
            if let Some(ds) = device::rm_stream(dev.as_mut(), stream_id) {
                let mut s = ds.stream.lock().unwrap();
                s.dev_detach(od.dev_idx);
                s.shm().set_callback_pending(false);
            }
        }
        Ok(())
    }

    fn start_ramp(&mut self, dev_idx: u32, request: RampRequest) {
        let Some(od) = self.open_devs.iter().find(|od| od.dev_idx == dev_idx) else {
            return;
        };
        let mut dev = od.handle.lock().unwrap();
        if device::start_ramp(dev.as_mut(), request) == RampStartEffect::SetMuteStateNow {
            self.send_main(MainMsg::SetDeviceMuteState { dev_idx });
        }
    }

    fn handle_stream_message(&mut self, stream: &Arc<Mutex<Stream>>) {
        let mut s = stream.lock().unwrap();
        loop {
            match s.read_audio_message() {
                Ok(Some(msg)) => {
                    if msg.id == sonara_proto::AudioMsgId::DataReady {
                        s.data_ready(msg.frames);
                    }
                }
                Ok(None) => break,
                Err(CoreError::PeerGone) => {
                    let id = s.id;
                    drop(s);
                    self.send_main(MainMsg::StreamError { stream_id: id });
                    return;
                }
                Err(e) => {
                    debug!("audio socket read error: {e}");
                    break;
                }
            }
        }
    }

    fn service_devices(&mut self) {
        let now = Instant::now();
        let out_ctx = OutputCtx {
            system_muted: self.system.muted(),
            system_volume: self.system.volume(),
        };
        let in_ctx = InputCtx {
            capture_muted: self.system.capture_muted(),
            capture_gain_centi_db: self.system.capture_gain(),
        };

        for i in 0..self.open_devs.len() {
            if self.open_devs[i].wake_ts > now {
                continue;
            }
            let handle = Arc::clone(&self.open_devs[i].handle);
            let direction = self.open_devs[i].direction;
            let dev_idx = self.open_devs[i].dev_idx;

            let wake_in = {
                let mut guard = handle.lock().unwrap();
                let dev = guard.as_mut();
                if direction == Direction::Output {
                    self.service_output(dev, dev_idx, &out_ctx)
                } else {
                    self.service_input(dev, dev_idx, &in_ctx)
                }
            };
            self.open_devs[i].wake_ts = now + wake_in.max(MIN_SLEEP);
        }
    }

    /// One output service cycle. Returns the time until the next wake.
    fn service_output(&mut self, dev: &mut dyn Device, dev_idx: u32, ctx: &OutputCtx) -> Duration {
        if !device::odev_should_wake(dev) && dev.common().state != DeviceState::Open {
            return Duration::from_millis(10);
        }

        let (hw_level, hw_tstamp) = match device::frames_queued(dev) {
            Ok(v) => v,
            Err(CoreError::SevereUnderrun) => {
                if device::reset_request(dev) {
                    warn!(dev_idx, "severe underrun, requesting device reset");
                    self.send_main(MainMsg::ResetDevice { dev_idx });
                }
                return Duration::from_millis(10);
            }
            Err(e) => {
                warn!(dev_idx, "frames_queued failed: {e}");
                return Duration::from_millis(10);
            }
        };
        device::update_rate(dev, hw_level, hw_tstamp);

        // Recoverable underrun: the buffer ran dry while running normally.
        if dev.common().state == DeviceState::NormalRun && hw_level == 0 {
            let _ = device::output_underrun(dev, ctx);
            if dev.get_num_severe_underruns() >= device::SEVERE_UNDERRUNS_BEFORE_RESET
                && device::reset_request(dev)
            {
                self.send_main(MainMsg::ResetDevice { dev_idx });
            }
        }

        let min_playable = self.min_playable_frames(dev, dev_idx);
        let have_frames = matches!(min_playable, Some(n) if n > 0);
        if let Err(e) = device::prepare_output_before_write_samples(dev, have_frames, ctx) {
            warn!(dev_idx, "prepare output failed: {e}");
        }

        if dev.common().state == DeviceState::NormalRun {
            if let Some(min_playable) = min_playable {
                self.mix_output(dev, dev_idx, hw_level, min_playable, ctx);
            }
            self.fetch_streams(dev, dev_idx);
        }

        let (sleep_frames, _, _) = device::frames_to_play_in_sleep(dev);
        let rate = dev
            .common()
            .rate_est
            .as_ref()
            .map(|e| e.get_rate())
            .unwrap_or(dev.common().frame_rate() as f64) as u32;
        frames_to_duration(sleep_frames as u64, rate.max(1))
    }

    /// Minimum playable frames across attached streams; None when the
    /// device has no streams.
    fn min_playable_frames(&self, dev: &mut dyn Device, dev_idx: u32) -> Option<usize> {
        if dev.common().streams.is_empty() {
            return None;
        }
        let mut min: Option<usize> = None;
        for ds in &dev.common().streams {
            let mut stream = ds.stream.lock().unwrap();
            stream.update_queued_frames();
            let playable = stream.playable_frames(dev_idx);
            if playable == 0 {
                if stream.is_draining {
                    continue;
                }
                // A live stream with nothing ready blocks the commit;
                // mixing would skip it audibly.
                return Some(0);
            }
            min = Some(min.map_or(playable, |m| m.min(playable)));
        }
        min.or(Some(0))
    }

    fn mix_output(
        &mut self,
        dev: &mut dyn Device,
        dev_idx: u32,
        hw_level: usize,
        min_playable: usize,
        ctx: &OutputCtx,
    ) {
        let Some(fmt) = dev.common().format else {
            return;
        };
        let frame_bytes = fmt.frame_bytes();
        let limit = device::buffer_avail(dev, hw_level).min(min_playable);
        if limit == 0 {
            return;
        }

        let old_max = device::max_stream_offset(dev) as usize;
        let mut scratch = std::mem::take(&mut dev.common_mut().mix_scratch);
        let cap_frames = scratch.len() / frame_bytes;
        let window = limit.min(cap_frames);

        // Fresh territory beyond what earlier cycles pre-mixed.
        if window > old_max {
            crate::mix::mute_buffer(
                fmt.sample_format,
                &mut scratch[old_max * frame_bytes..window * frame_bytes],
            );
        }

        for i in 0..dev.common().streams.len() {
            let stream_arc = Arc::clone(&dev.common().streams[i].stream);
            let mut stream = stream_arc.lock().unwrap();
            let stream_id = dev.common().streams[i].stream_id;
            let offset = device::stream_offset(dev, stream_id) as usize;
            if offset >= window {
                continue;
            }
            let max_frames = window - offset;
            let ds = &mut dev.common_mut().streams[i];
            let mixed = ds.mix_into(dev_idx, &mut stream, &mut scratch, offset, max_frames);
            drop(stream);
            device::stream_written(dev, stream_id, mixed as u32);
        }

        let committed = device::all_streams_written(dev) as usize;
        if committed > 0 {
            match device::put_output_buffer(dev, &mut scratch, committed, ctx, self.remix.as_mut())
            {
                Ok(Some(RampCompletion::FinalizeMute)) => {
                    self.send_main(MainMsg::SetDeviceMuteState { dev_idx });
                }
                Ok(None) => {}
                Err(e) => warn!(dev_idx, "put output failed: {e}"),
            }
            // Shift the uncommitted residue to the window start.
            let residue = device::max_stream_offset(dev) as usize;
            if residue > 0 {
                scratch.copy_within(
                    committed * frame_bytes..(committed + residue) * frame_bytes,
                    0,
                );
            }
        }
        dev.common_mut().mix_scratch = scratch;

        // Streams release shm frames every attached device has consumed.
        for ds in &dev.common().streams {
            ds.stream.lock().unwrap().update_output_read_pointer();
        }
    }

    /// Requests more data from output streams running low.
    fn fetch_streams(&self, dev: &mut dyn Device, dev_idx: u32) {
        let now = Instant::now();
        for ds in &dev.common().streams {
            let mut stream = ds.stream.lock().unwrap();
            if stream.direction != Direction::Output || stream.is_draining {
                continue;
            }
            if stream.flags.contains(StreamFlags::TRIGGER_ONLY) {
                continue;
            }
            if stream.playable_frames(dev_idx) >= stream.cb_threshold as usize {
                continue;
            }
            match stream.request_audio(now) {
                Ok(()) => {
                    if let Some(longest) = stream.take_fetch_report() {
                        let id = stream.id;
                        self.send_main(MainMsg::LongestFetchDelay {
                            stream_id: id,
                            millis: longest.as_millis() as u64,
                        });
                    }
                }
                Err(CoreError::PeerGone) => {
                    let id = stream.id;
                    drop(stream);
                    self.send_main(MainMsg::StreamError { stream_id: id });
                }
                Err(e) => debug!("fetch failed: {e}"),
            }
        }
    }

    /// One input service cycle. Returns the time until the next wake.
    fn service_input(&self, dev: &mut dyn Device, dev_idx: u32, ctx: &InputCtx) -> Duration {
        let rate = dev.common().frame_rate();
        let min_cb = dev.common().min_cb_level.max(1) as usize;

        let (hw_level, hw_tstamp) = match device::frames_queued(dev) {
            Ok(v) => v,
            Err(_) => return frames_to_duration(min_cb as u64, rate),
        };
        device::update_rate(dev, hw_level, hw_tstamp);
        if hw_level == 0 || dev.common().streams.is_empty() {
            return frames_to_duration(min_cb as u64, rate);
        }

        let got = match device::get_input_buffer(dev, hw_level, ctx) {
            Ok(got) => got,
            Err(e) => {
                warn!(dev_idx, "capture failed: {e}");
                return frames_to_duration(min_cb as u64, rate);
            }
        };
        if got == 0 {
            return frames_to_duration(min_cb as u64, rate);
        }

        let scratch = std::mem::take(&mut dev.common_mut().mix_scratch);
        for i in 0..dev.common().streams.len() {
            let stream_arc = Arc::clone(&dev.common().streams[i].stream);
            let mut stream = stream_arc.lock().unwrap();
            if stream.flags.contains(StreamFlags::TRIGGER_ONLY) {
                // Wake the client without samples; it only wants the event.
                if let Err(e) = stream.audio_ready(0) {
                    debug!("trigger notify failed: {e}");
                }
                continue;
            }
            if stream.check_write_overrun(got) {
                // Dropping the whole buffer beats handing the client a torn
                // read.
                continue;
            }
            let ds = &mut dev.common_mut().streams[i];
            ds.capture_from(dev_idx, &mut stream, &scratch, got);
            stream.update_input_write_pointer();
            if stream.input_level_met() {
                let level = stream.shm().curr_read_frames() as u32;
                match stream.audio_ready(level) {
                    Ok(()) => {}
                    Err(CoreError::PeerGone) => {
                        let id = stream.id;
                        drop(stream);
                        self.send_main(MainMsg::StreamError { stream_id: id });
                        continue;
                    }
                    Err(e) => debug!("audio_ready failed: {e}"),
                }
            }
        }
        dev.common_mut().mix_scratch = scratch;

        if let Err(e) = device::put_input_buffer(dev, got) {
            warn!(dev_idx, "put input failed: {e}");
        }
        frames_to_duration(min_cb as u64, rate)
    }

    fn dump_debug_info(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        let _ = writeln!(out, "open devices: {}", self.open_devs.len());
        for od in &self.open_devs {
            let dev = od.handle.lock().unwrap();
            let common = dev.common();
            let delay = device::delay_frames(dev.as_ref()).unwrap_or(0);
            let _ = writeln!(
                out,
                "dev {} [{}] dir={:?} state={:?} min_cb={} max_cb={} delay={} underruns={}",
                common.info.idx,
                common.info.name,
                common.direction,
                common.state,
                common.min_cb_level,
                common.max_cb_level,
                delay,
                dev.get_num_underruns(),
            );
            for ds in &common.streams {
                let s = ds.stream.lock().unwrap();
                let _ = writeln!(
                    out,
                    "  stream {:#x} dir={:?} buf={} cb={} queued={} pinned={} master={:?}",
                    s.id,
                    s.direction,
                    s.buffer_frames,
                    s.cb_threshold,
                    s.queued_frames,
                    s.is_pinned,
                    s.master_dev,
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::FakeDevice;
    use crate::stream::test_support::make_stream;
    use sonara_proto::{AudioMessage, AudioMsgId, Format, SampleFormat};

    fn spawn_thread() -> AudioThread {
        let shared = Arc::new(crate::system_state::SystemShared::default());
        AudioThread::start(shared).unwrap()
    }

    fn open_fake_output(idx: u32) -> DeviceHandle {
        let mut dev = FakeDevice::new_output(idx);
        device::set_format(&mut dev, &Format::new(SampleFormat::S16LE, 48000, 2)).unwrap();
        device::open(&mut dev, 480).unwrap();
        Arc::new(Mutex::new(Box::new(dev) as Box<dyn Device>))
    }

    #[test]
    fn test_start_stop() {
        let thread = spawn_thread();
        drop(thread); // joins cleanly
    }

    #[test]
    fn test_add_rm_open_dev() {
        let thread = spawn_thread();
        let dev = open_fake_output(10);
        thread.add_open_dev(Arc::clone(&dev)).unwrap();
        assert!(matches!(
            thread.add_open_dev(Arc::clone(&dev)),
            Err(CoreError::DeviceBusy(10))
        ));
        thread.rm_open_dev(10).unwrap();
        assert!(matches!(
            thread.rm_open_dev(10),
            Err(CoreError::NoSuchDevice(10))
        ));
    }

    #[test]
    fn test_add_stream_sends_initial_fetch() {
        let thread = spawn_thread();
        let dev = open_fake_output(11);
        thread.add_open_dev(Arc::clone(&dev)).unwrap();

        let (stream, client_fd) = make_stream(Direction::Output, sonara_proto::stream_id(1, 1));
        let stream = Arc::new(Mutex::new(stream));
        thread
            .add_stream(Arc::clone(&stream), vec![Arc::clone(&dev)])
            .unwrap();

        // The initial REQUEST_DATA arrives on the client side.
        let mut buf = [0u8; AudioMessage::SIZE];
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match nix::unistd::read(client_fd, &mut buf) {
                Ok(n) if n == AudioMessage::SIZE => break,
                _ if Instant::now() > deadline => panic!("no initial fetch"),
                _ => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        let msg = AudioMessage::decode(&buf).unwrap();
        assert_eq!(msg.id, AudioMsgId::RequestData);
        assert_eq!(msg.frames, 480);

        assert_eq!(stream.lock().unwrap().master_dev, Some(11));
        let _ = nix::unistd::close(client_fd);
    }

    #[test]
    fn test_data_ready_drives_device_into_normal_run() {
        let thread = spawn_thread();
        let dev = open_fake_output(12);
        thread.add_open_dev(Arc::clone(&dev)).unwrap();

        let (stream, client_fd) = make_stream(Direction::Output, sonara_proto::stream_id(1, 2));
        let stream = Arc::new(Mutex::new(stream));
        thread
            .add_stream(Arc::clone(&stream), vec![Arc::clone(&dev)])
            .unwrap();

        // Play the client: fill 480 frames of a known sample and reply.
        {
            let mut s = stream.lock().unwrap();
            let shm = s.shm_mut();
            let (buf, usable) = shm.producer_get_write_buf(480);
            assert!(usable >= 480);
            for chunk in buf[..480 * 4].chunks_exact_mut(2) {
                chunk.copy_from_slice(&0x1234i16.to_le_bytes());
            }
            shm.producer_commit(480);
        }
        nix::unistd::write(client_fd, &AudioMessage::data_ready(480).encode()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            {
                let guard = dev.lock().unwrap();
                if guard.common().state == DeviceState::NormalRun {
                    break;
                }
            }
            if Instant::now() > deadline {
                panic!("device never reached NormalRun");
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let _ = nix::unistd::close(client_fd);
    }

    #[test]
    fn test_disconnect_cancels_pending_fetch() {
        let thread = spawn_thread();
        let dev = open_fake_output(13);
        thread.add_open_dev(Arc::clone(&dev)).unwrap();

        let (stream, client_fd) = make_stream(Direction::Output, sonara_proto::stream_id(1, 3));
        let stream = Arc::new(Mutex::new(stream));
        thread
            .add_stream(Arc::clone(&stream), vec![Arc::clone(&dev)])
            .unwrap();

        thread
            .disconnect_stream(Arc::clone(&stream), None)
            .unwrap();
        let s = stream.lock().unwrap();
        assert!(!s.shm().callback_pending(), "pending fetch cancelled");
        assert_eq!(s.num_attached_devs, 0);
        assert_eq!(s.master_dev, None);
        drop(s);

        let guard = dev.lock().unwrap();
        assert!(guard.common().streams.is_empty());
        drop(guard);
        let _ = nix::unistd::close(client_fd);
    }

    #[test]
    fn test_single_stream_mix_is_bit_exact_and_refetches() {
        // One playback stream on one device: the client's 480 frames land
        // in the device buffer unchanged, then the engine asks for more.
        let thread = spawn_thread();
        let (mut fake, probe) = FakeDevice::with_probe(20, Direction::Output);
        device::set_format(&mut fake, &Format::new(SampleFormat::S16LE, 48000, 2)).unwrap();
        device::open(&mut fake, 480).unwrap();
        let dev: DeviceHandle = Arc::new(Mutex::new(Box::new(fake)));
        thread.add_open_dev(Arc::clone(&dev)).unwrap();

        let (stream, client_fd) = make_stream(Direction::Output, sonara_proto::stream_id(2, 1));
        let stream = Arc::new(Mutex::new(stream));
        thread
            .add_stream(Arc::clone(&stream), vec![Arc::clone(&dev)])
            .unwrap();

        // Drain the initial REQUEST_DATA.
        let mut buf = [0u8; AudioMessage::SIZE];
        let deadline = Instant::now() + Duration::from_secs(2);
        while nix::unistd::read(client_fd, &mut buf).is_err() {
            assert!(Instant::now() < deadline, "no initial fetch");
            std::thread::sleep(Duration::from_millis(5));
        }

        {
            let mut s = stream.lock().unwrap();
            let shm = s.shm_mut();
            let (wbuf, usable) = shm.producer_get_write_buf(480);
            assert!(usable >= 480);
            for chunk in wbuf[..480 * 4].chunks_exact_mut(2) {
                chunk.copy_from_slice(&0x1234i16.to_le_bytes());
            }
            shm.producer_commit(480);
        }
        nix::unistd::write(client_fd, &AudioMessage::data_ready(480).encode()).unwrap();

        // Wait for the follow-up REQUEST_DATA that proves the mix cycle
        // ran and wants the next callback's worth.
        let deadline = Instant::now() + Duration::from_secs(2);
        let msg = loop {
            match nix::unistd::read(client_fd, &mut buf) {
                Ok(n) if n == AudioMessage::SIZE => break AudioMessage::decode(&buf).unwrap(),
                _ => {
                    assert!(Instant::now() < deadline, "no follow-up fetch");
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        };
        assert_eq!(msg.id, AudioMsgId::RequestData);
        assert_eq!(msg.frames, 480);

        // The committed hardware buffer holds the client samples verbatim:
        // no DSP, hardware volume, no ramp.
        assert_eq!(dev.lock().unwrap().common().state, DeviceState::NormalRun);
        let written = probe.written.lock().unwrap().clone();
        assert_eq!(written.len(), 480 * 4);
        assert!(
            written
                .chunks_exact(2)
                .all(|c| i16::from_le_bytes([c[0], c[1]]) == 0x1234),
            "mixed output must equal client input"
        );

        // Stream shm fully consumed.
        assert_eq!(stream.lock().unwrap().shm().curr_read_frames(), 0);
        let _ = nix::unistd::close(client_fd);
    }

    #[test]
    fn test_severe_underrun_requests_reset_once() {
        let thread = spawn_thread();
        let mut fake = FakeDevice::new_output(21);
        fake.severe_underruns = 1; // frames_queued reports severe underrun
        device::set_format(&mut fake, &Format::new(SampleFormat::S16LE, 48000, 2)).unwrap();
        device::open(&mut fake, 480).unwrap();
        // Run states are the only ones serviced.
        fake.common_mut().state = DeviceState::NormalRun;
        let dev: DeviceHandle = Arc::new(Mutex::new(Box::new(fake)));
        thread.add_open_dev(dev).unwrap();

        // Let several service cycles pass; the pending flag must collapse
        // them into a single reset request.
        std::thread::sleep(Duration::from_millis(100));
        let msgs = thread.drain_main_msgs();
        let resets = msgs
            .iter()
            .filter(|m| matches!(m, MainMsg::ResetDevice { dev_idx: 21 }))
            .count();
        assert_eq!(resets, 1, "got {msgs:?}");
    }

    #[test]
    fn test_capture_reaches_stream_and_signals_client() {
        let thread = spawn_thread();
        let mut fake = FakeDevice::new_input(22);
        device::set_format(&mut fake, &Format::new(SampleFormat::S16LE, 48000, 2)).unwrap();
        device::open(&mut fake, 480).unwrap();
        // Preload "hardware" capture with a callback's worth of samples.
        fake.capture_data = (0..480 * 2)
            .flat_map(|_| 0x2b2bi16.to_le_bytes())
            .collect();
        fake.hw_level = 480;
        let dev: DeviceHandle = Arc::new(Mutex::new(Box::new(fake)));
        thread.add_open_dev(Arc::clone(&dev)).unwrap();

        let (stream, client_fd) = make_stream(Direction::Input, sonara_proto::stream_id(2, 2));
        let stream = Arc::new(Mutex::new(stream));
        thread
            .add_stream(Arc::clone(&stream), vec![Arc::clone(&dev)])
            .unwrap();

        // DATA_READY arrives once cb_threshold frames are captured.
        let mut buf = [0u8; AudioMessage::SIZE];
        let deadline = Instant::now() + Duration::from_secs(2);
        let msg = loop {
            match nix::unistd::read(client_fd, &mut buf) {
                Ok(n) if n == AudioMessage::SIZE => break AudioMessage::decode(&buf).unwrap(),
                _ => {
                    assert!(Instant::now() < deadline, "no DATA_READY");
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        };
        assert_eq!(msg.id, AudioMsgId::DataReady);
        assert!(msg.frames >= 480);

        // The captured samples are in the stream's shm, bit exact.
        let s = stream.lock().unwrap();
        let (data, frames) = s.shm().consumer_get_read_buf();
        assert!(frames >= 480);
        assert!(data[..480 * 4]
            .chunks_exact(2)
            .all(|c| i16::from_le_bytes([c[0], c[1]]) == 0x2b2b));
        drop(s);
        let _ = nix::unistd::close(client_fd);
    }

    #[test]
    fn test_dump_debug_info_lists_devices() {
        let thread = spawn_thread();
        let dev = open_fake_output(14);
        thread.add_open_dev(dev).unwrap();
        let dump = thread.dump_debug_info().unwrap();
        assert!(dump.contains("open devices: 1"));
        assert!(dump.contains("fake-14"));
    }
}
