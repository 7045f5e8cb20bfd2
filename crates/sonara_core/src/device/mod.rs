//! Devices and the per-device output state machine
//!
//! Every concrete device (real hardware through cpal, the empty fallback,
//! loopback taps, test devices) implements the [`Device`] trait and embeds
//! a [`DevCommon`] carrying the state the engine manages for it: negotiated
//! format, attached streams, callback levels, rate estimator, ramp, DSP
//! pipeline and the open/normal/no-stream state machine.
//!
//! Output state machine:
//!
//! ```text
//!  Close ──open──▶ Open ──sample-ready──▶ NormalRun
//!                    ▲                    │    ▲
//!                    │                    │    │ sample-ready
//!                    │ close              ▼    │
//!                    └─────── NoStreamRun ─────┘
//! ```
//!
//! Devices without a `start` op skip `Open` and land in `NoStreamRun`
//! straight from `open`. Input devices run in `NormalRun` whenever open.

mod cpal_backend;
mod empty;
mod loopback;
mod test_dev;

pub use cpal_backend::CpalDevice;
pub use empty::{EmptyDevice, SILENT_PLAYBACK_DEVICE_IDX, SILENT_RECORD_DEVICE_IDX};
pub use loopback::{
    LoopbackDevice, LoopbackPoint, LoopbackTap, LOOPBACK_POST_DSP_IDX, LOOPBACK_POST_MIX_IDX,
};
pub use test_dev::TestDevice;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use sonara_proto::{Direction, Format, SampleFormat, StreamId};
use tracing::{debug, error, warn};

use crate::buffer_share::BufferShare;
use crate::dev_stream::DevStream;
use crate::error::{CoreError, CoreResult};
use crate::mix;
use crate::node::Node;
use crate::ramp::{Ramp, RampAction, RampCompletion, RampRequest};
use crate::rate_estimator::RateEstimator;
use crate::softvol;

/// Shared handle to a device, used by both the main and audio threads. The
/// audio thread locks one device at a time inside a service cycle; the main
/// thread locks only for configuration changes.
pub type DeviceHandle = Arc<Mutex<Box<dyn Device>>>;

/// Consecutive severe underruns before the engine asks for a device reset.
pub const SEVERE_UNDERRUNS_BEFORE_RESET: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Close,
    Open,
    NormalRun,
    NoStreamRun,
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub idx: u32,
    pub name: String,
    pub stable_id: u32,
}

/// DSP pipeline attached to an open device, with its f32 scratch.
pub struct DspContext {
    pipeline: sonara_dsp::Pipeline,
    scratch: Vec<f32>,
}

impl DspContext {
    pub fn new(pipeline: sonara_dsp::Pipeline, max_frames: usize, channels: usize) -> Self {
        Self {
            pipeline,
            scratch: vec![0.0; max_frames * channels],
        }
    }

    pub fn delay_frames(&self) -> usize {
        self.pipeline.delay_frames()
    }

    pub fn describe(&self) -> Vec<&'static str> {
        self.pipeline.describe()
    }

    fn apply(&mut self, fmt: &Format, buf: &mut [u8], frames: usize) {
        let channels = fmt.num_channels as usize;
        let sample_bytes = fmt.sample_format.sample_bytes();
        let samples = frames * channels;
        if samples > self.scratch.len() {
            // Should not happen: scratch is sized to the device buffer.
            return;
        }
        for (i, chunk) in buf
            .chunks_exact(sample_bytes)
            .take(samples)
            .enumerate()
        {
            self.scratch[i] = mix::sample_to_f32(fmt.sample_format, chunk);
        }
        self.pipeline.process(&mut self.scratch[..samples]);
        for (i, chunk) in buf
            .chunks_exact_mut(sample_bytes)
            .take(samples)
            .enumerate()
        {
            mix::f32_to_sample(fmt.sample_format, self.scratch[i], chunk);
        }
    }
}

/// State the engine keeps for every device regardless of its backend.
pub struct DevCommon {
    pub info: DeviceInfo,
    pub direction: Direction,
    pub supported_rates: Vec<u32>,
    pub supported_channel_counts: Vec<u32>,
    pub supported_formats: Vec<SampleFormat>,
    /// Hardware buffer size in frames.
    pub buffer_size: u32,
    /// Frames to keep queued beyond what is requested.
    pub min_buffer_level: u32,

    pub format: Option<Format>,
    /// Format visible to the rest of the system; may differ from `format`
    /// if the DSP changes the channel count.
    pub ext_format: Option<Format>,
    pub state: DeviceState,

    pub nodes: Vec<Node>,
    pub active_node: Option<u32>,
    /// Guards duplicate `update_active_node(enabled=true)` calls while a
    /// select-node transition and an open retry overlap.
    pub active_node_enabled: bool,

    pub streams: Vec<DevStream>,
    pub min_cb_level: u32,
    pub max_cb_level: u32,
    pub buf_state: Option<BufferShare>,

    pub rate_est: Option<RateEstimator>,
    pub ramp: Option<Ramp>,
    pub dsp: Option<DspContext>,
    pub pre_dsp_hook: Option<Arc<Mutex<LoopbackTap>>>,
    pub post_dsp_hook: Option<Arc<Mutex<LoopbackTap>>>,

    pub is_enabled: bool,
    pub software_volume_needed: bool,
    pub idle_timeout: Option<Instant>,
    pub reset_request_pending: bool,
    pub num_underruns: u32,

    /// Mix/processing scratch in device format, sized on open.
    pub mix_scratch: Vec<u8>,
}

impl DevCommon {
    pub fn new(info: DeviceInfo, direction: Direction) -> Self {
        Self {
            info,
            direction,
            supported_rates: vec![48000, 44100],
            supported_channel_counts: vec![2, 1],
            supported_formats: vec![SampleFormat::S16LE],
            buffer_size: 0,
            min_buffer_level: 0,
            format: None,
            ext_format: None,
            state: DeviceState::Close,
            nodes: Vec::new(),
            active_node: None,
            active_node_enabled: false,
            streams: Vec::new(),
            min_cb_level: 0,
            max_cb_level: 0,
            buf_state: None,
            rate_est: None,
            ramp: None,
            dsp: None,
            pre_dsp_hook: None,
            post_dsp_hook: None,
            is_enabled: false,
            software_volume_needed: false,
            idle_timeout: None,
            reset_request_pending: false,
            num_underruns: 0,
            mix_scratch: Vec::new(),
        }
    }

    pub fn active_node(&self) -> Option<&Node> {
        let idx = self.active_node?;
        self.nodes.iter().find(|n| n.idx == idx)
    }

    pub fn active_node_mut(&mut self) -> Option<&mut Node> {
        let idx = self.active_node?;
        self.nodes.iter_mut().find(|n| n.idx == idx)
    }

    pub fn frame_bytes(&self) -> usize {
        self.format.map(|f| f.frame_bytes()).unwrap_or(4)
    }

    pub fn frame_rate(&self) -> u32 {
        self.format.map(|f| f.frame_rate).unwrap_or(48000)
    }
}

/// The operation set every concrete device implements. Engine-level logic
/// lives in the free functions of this module and only goes through this
/// trait for backend specifics.
pub trait Device: Send {
    fn common(&self) -> &DevCommon;
    fn common_mut(&mut self) -> &mut DevCommon;

    fn open_dev(&mut self) -> CoreResult<()>;
    fn close_dev(&mut self) -> CoreResult<()>;

    /// Refresh supported rates/channels/formats before negotiation.
    fn update_supported_formats(&mut self) -> CoreResult<()> {
        Ok(())
    }

    /// Frames currently queued in the hardware buffer with the timestamp of
    /// the measurement. `Err(SevereUnderrun)` reports an unrecoverable gap.
    fn frames_queued(&mut self) -> CoreResult<(usize, Instant)>;

    /// Path delay in frames, excluding DSP.
    fn delay_frames(&self) -> CoreResult<usize>;

    /// The device's transfer region for up to `frames` frames. Valid until
    /// the matching `put_buffer`.
    fn get_buffer(&mut self, frames: usize) -> CoreResult<(&mut [u8], usize)>;

    /// Commits frames written to (output) or consumed from (input) the
    /// region returned by `get_buffer`.
    fn put_buffer(&mut self, frames: usize) -> CoreResult<()>;

    /// Drops queued input frames, returning how many were flushed.
    fn flush_buffer(&mut self) -> CoreResult<usize> {
        Ok(0)
    }

    /// Whether the device requires an explicit `start` call.
    fn supports_start(&self) -> bool {
        false
    }

    fn start(&mut self) -> CoreResult<()> {
        Err(CoreError::InvalidArgument("device has no start op"))
    }

    /// Enter/leave no-stream state. Most devices delegate to
    /// [`default_no_stream_playback`].
    fn no_stream(&mut self, enable: bool) -> CoreResult<()>;

    /// Overrides the default should-wake condition when present.
    fn output_should_wake(&self) -> Option<bool> {
        None
    }

    fn has_output_underrun_handler(&self) -> bool {
        false
    }

    fn output_underrun(&mut self) -> CoreResult<()> {
        Ok(())
    }

    fn update_active_node(&mut self, _node_idx: u32, _dev_enabled: bool) {}

    fn update_channel_layout(&mut self) -> CoreResult<()> {
        Ok(())
    }

    fn has_hw_volume(&self) -> bool {
        false
    }

    fn set_volume(&mut self, _adjusted_volume: u32) {}

    fn set_mute(&mut self, _mute: bool) {}

    fn set_capture_gain(&mut self, _gain_centi_db: i32) {}

    fn set_capture_mute(&mut self, _mute: bool) {}

    fn get_num_underruns(&self) -> u32 {
        self.common().num_underruns
    }

    fn get_num_severe_underruns(&self) -> u32 {
        0
    }

    fn get_hotword_models(&self) -> Option<String> {
        None
    }

    fn set_hotword_model(&mut self, _model: &str) -> CoreResult<()> {
        Err(CoreError::InvalidArgument("device has no hotword models"))
    }

    /// TEST_DEV_COMMAND dispatch; only test devices accept these.
    fn test_command(
        &mut self,
        _command: sonara_proto::TestDevCommand,
        _data: &[u8],
    ) -> CoreResult<()> {
        Err(CoreError::InvalidArgument("not a test device"))
    }
}

pub fn is_open(dev: &dyn Device) -> bool {
    dev.common().state != DeviceState::Close
}

// ---- format negotiation ----

/// Best supported rate for a requested one: exact match first, then an
/// integer multiple/divisor, then the device's first rate.
fn best_rate(supported: &[u32], requested: u32) -> u32 {
    let mut fallback = 0;
    for &rate in supported {
        if rate == requested && rate >= 44100 {
            return rate;
        }
        if fallback == 0 && rate != 0 && (requested % rate == 0 || rate % requested == 0) {
            fallback = rate;
        }
    }
    if fallback != 0 {
        return fallback;
    }
    supported.first().copied().unwrap_or(0)
}

fn best_channel_count(supported: &[u32], requested: u32) -> u32 {
    if supported.contains(&requested) {
        return requested;
    }
    // Stereo is the preferred conversion target.
    if supported.contains(&2) {
        return 2;
    }
    supported.first().copied().unwrap_or(0)
}

fn best_sample_format(supported: &[SampleFormat], requested: SampleFormat) -> Option<SampleFormat> {
    if supported.contains(&requested) {
        return Some(requested);
    }
    supported.first().copied()
}

/// Negotiates the device format against a requested stream format. No-op if
/// the device already has one.
pub fn set_format(dev: &mut dyn Device, requested: &Format) -> CoreResult<()> {
    if dev.common().format.is_some() {
        return Ok(());
    }
    dev.update_supported_formats()?;

    let common = dev.common();
    let rate = best_rate(&common.supported_rates, requested.frame_rate);
    let channels = best_channel_count(&common.supported_channel_counts, requested.num_channels);
    let sample_format = best_sample_format(&common.supported_formats, requested.sample_format);

    let (rate, channels, sample_format) = match (rate, channels, sample_format) {
        (r, c, Some(f)) if r != 0 && c != 0 => (r, c, f),
        _ => return Err(CoreError::InvalidArgument("no compatible device format")),
    };

    let fmt = Format::new(sample_format, rate, channels);
    let common = dev.common_mut();
    common.format = Some(fmt);
    common.ext_format = Some(fmt);
    match common.rate_est.as_mut() {
        Some(est) => est.reset_rate(rate),
        None => common.rate_est = Some(RateEstimator::with_defaults(rate)),
    }
    dev.update_channel_layout()?;
    Ok(())
}

/// Builds the DSP context for an open device from the loaded config.
pub fn attach_dsp(dev: &mut dyn Device, config: &sonara_dsp::DspConfig) {
    let common = dev.common_mut();
    let Some(fmt) = common.format else {
        return;
    };
    let playback = common.direction == Direction::Output;
    let Some(stage) = config.stage(playback) else {
        common.dsp = None;
        return;
    };
    match sonara_dsp::Pipeline::from_stage(stage, fmt.frame_rate as f32, fmt.num_channels as usize)
    {
        Ok(pipeline) if !pipeline.is_empty() => {
            common.dsp = Some(DspContext::new(
                pipeline,
                common.buffer_size as usize,
                fmt.num_channels as usize,
            ));
        }
        Ok(_) => common.dsp = None,
        Err(e) => {
            warn!(dev = %common.info.name, "failed to build DSP pipeline: {e}");
            common.dsp = None;
        }
    }
}

// ---- open / close ----

/// Opens a device and seeds the state machine. `cb_level` is the callback
/// threshold of the first stream attaching.
pub fn open(dev: &mut dyn Device, cb_level: u32) -> CoreResult<()> {
    dev.open_dev()?;

    let supports_start = dev.supports_start();
    let common = dev.common_mut();
    common.min_cb_level = cb_level.min(common.buffer_size / 2);
    common.max_cb_level = 0;
    common.reset_request_pending = false;
    common.num_underruns = 0;
    common.idle_timeout = None;
    let frame_bytes = common.frame_bytes();
    common.mix_scratch = vec![0u8; common.buffer_size as usize * frame_bytes];

    common.state = if common.direction == Direction::Output {
        if supports_start {
            DeviceState::Open
        } else {
            DeviceState::NoStreamRun
        }
    } else {
        DeviceState::NormalRun
    };
    debug!(dev = %common.info.name, state = ?common.state, "device opened");
    Ok(())
}

/// Closes an open device and clears its negotiated format.
pub fn close(dev: &mut dyn Device) -> CoreResult<()> {
    if !is_open(dev) {
        return Ok(());
    }
    dev.close_dev()?;
    let common = dev.common_mut();
    common.state = DeviceState::Close;
    common.format = None;
    common.ext_format = None;
    common.dsp = None;
    common.mix_scratch = Vec::new();
    if let Some(ramp) = common.ramp.as_mut() {
        ramp.reset();
    }
    debug!(dev = %common.info.name, "device closed");
    Ok(())
}

// ---- levels ----

/// Frames queued above `min_buffer_level`, with the hw timestamp.
pub fn frames_queued(dev: &mut dyn Device) -> CoreResult<(usize, Instant)> {
    let (level, ts) = dev.frames_queued()?;
    if dev.common().direction == Direction::Input {
        return Ok((level, ts));
    }
    let min = dev.common().min_buffer_level as usize;
    Ok((level.saturating_sub(min), ts))
}

/// Frames that can be written without exceeding the hw buffer.
pub fn buffer_avail(dev: &dyn Device, hw_level: usize) -> usize {
    let common = dev.common();
    if common.direction == Direction::Input {
        return hw_level;
    }
    (common.buffer_size as usize)
        .saturating_sub(common.min_buffer_level as usize)
        .saturating_sub(hw_level)
}

/// Total path delay including DSP.
pub fn delay_frames(dev: &dyn Device) -> CoreResult<usize> {
    let dsp = dev.common().dsp.as_ref().map(|d| d.delay_frames()).unwrap_or(0);
    Ok(dev.delay_frames()? + dsp)
}

// ---- volume ----

/// True when the device's effective volume is zero, considering the active
/// node's adjustment.
pub fn is_zero_volume(dev: &dyn Device, system_volume: u32) -> bool {
    match dev.common().active_node() {
        Some(node) => node.adjust_volume(system_volume) == 0,
        None => system_volume == 0,
    }
}

pub fn software_volume_needed(dev: &dyn Device) -> bool {
    let common = dev.common();
    common.software_volume_needed
        || common
            .active_node()
            .map(|n| n.software_volume_needed)
            .unwrap_or(false)
}

pub fn software_volume_scaler(dev: &dyn Device, system_volume: u32) -> f32 {
    match dev.common().active_node() {
        Some(node) => node.softvol_scaler(node.adjust_volume(system_volume)),
        None => softvol::get_scaler(system_volume),
    }
}

/// Software gain scaler for capture, from system gain plus node gain.
pub fn software_gain_scaler(dev: &dyn Device, system_gain_centi_db: i32) -> f32 {
    if !software_volume_needed(dev) {
        return 1.0;
    }
    let node_gain = dev
        .common()
        .active_node()
        .map(|n| n.capture_gain)
        .unwrap_or(0);
    softvol::scaler_from_centi_db(system_gain_centi_db + node_gain)
}

// ---- stream attachment ----

pub fn add_stream(dev: &mut dyn Device, dev_stream: DevStream) {
    let common = dev.common_mut();
    let cb = dev_stream.cb_threshold;
    if common.buf_state.is_none() {
        common.buf_state = Some(BufferShare::new(common.buffer_size));
    }
    if let Some(bs) = common.buf_state.as_mut() {
        bs.add_id(dev_stream.stream_id);
    }
    common.min_cb_level = common.min_cb_level.min(cb);
    common.max_cb_level = common.max_cb_level.max(cb);
    common.streams.push(dev_stream);
}

/// Removes a stream from the device, recomputing callback levels. When the
/// last stream leaves an output device in `NormalRun`, the device drops to
/// `NoStreamRun`.
pub fn rm_stream(dev: &mut dyn Device, stream_id: StreamId) -> Option<DevStream> {
    let common = dev.common_mut();
    let old_min_cb_level = common.min_cb_level;
    let pos = common.streams.iter().position(|s| s.stream_id == stream_id);

    let removed = pos.map(|i| common.streams.remove(i));
    if removed.is_some() {
        if let Some(bs) = common.buf_state.as_mut() {
            bs.rm_id(stream_id);
        }
    }

    common.min_cb_level = common.buffer_size / 2;
    common.max_cb_level = 0;
    for s in &common.streams {
        common.min_cb_level = common.min_cb_level.min(s.cb_threshold);
        common.max_cb_level = common.max_cb_level.max(s.cb_threshold);
    }

    if common.streams.is_empty() {
        common.buf_state = None;
        common.min_cb_level = old_min_cb_level;
        if common.direction == Direction::Output && common.state == DeviceState::NormalRun {
            if let Err(e) = no_stream_transition(dev, true) {
                warn!("no-stream transition failed: {e}");
            }
        }
    }
    removed
}

pub fn stream_offset(dev: &dyn Device, stream_id: StreamId) -> u32 {
    dev.common()
        .buf_state
        .as_ref()
        .map(|bs| bs.id_offset(stream_id))
        .unwrap_or(0)
}

pub fn stream_written(dev: &mut dyn Device, stream_id: StreamId, frames: u32) {
    if let Some(bs) = dev.common_mut().buf_state.as_mut() {
        bs.offset_update(stream_id, frames);
    }
}

pub fn max_stream_offset(dev: &dyn Device) -> u32 {
    dev.common()
        .buf_state
        .as_ref()
        .map(|bs| bs.max_offset())
        .unwrap_or(0)
}

/// All streams have mixed what they can; frames every stream covered are
/// ready to commit to the device.
pub fn all_streams_written(dev: &mut dyn Device) -> u32 {
    dev.common_mut()
        .buf_state
        .as_mut()
        .map(|bs| bs.new_write_point())
        .unwrap_or(0)
}

// ---- state machine ----

fn start_dev(dev: &mut dyn Device) -> CoreResult<()> {
    if !is_open(dev) {
        return Err(CoreError::InvalidArgument("start on closed device"));
    }
    dev.start()?;
    dev.common_mut().state = DeviceState::NormalRun;
    Ok(())
}

/// Enter (`enable`) or leave no-stream playback, updating the state.
pub fn no_stream_transition(dev: &mut dyn Device, enable: bool) -> CoreResult<()> {
    let common = dev.common();
    if common.direction != Direction::Output {
        return Err(CoreError::InvalidArgument("no_stream on input device"));
    }
    if common.state != DeviceState::NormalRun && common.state != DeviceState::NoStreamRun {
        return Err(CoreError::InvalidArgument("no_stream outside run states"));
    }
    dev.no_stream(enable)?;
    dev.common_mut().state = if enable {
        DeviceState::NoStreamRun
    } else {
        DeviceState::NormalRun
    };
    Ok(())
}

/// Context the output pipeline needs from system state, captured once per
/// cycle by the audio thread.
#[derive(Debug, Clone, Copy)]
pub struct OutputCtx {
    pub system_muted: bool,
    pub system_volume: u32,
}

fn output_should_mute(dev: &dyn Device, ctx: &OutputCtx) -> bool {
    ctx.system_muted || is_zero_volume(dev, ctx.system_volume)
}

/// Sample-ready event: moves Open or NoStreamRun into NormalRun, ramping
/// the first samples up when the device is audible.
fn output_event_sample_ready(dev: &mut dyn Device, ctx: &OutputCtx) -> CoreResult<()> {
    let state = dev.common().state;
    if state == DeviceState::Open || state == DeviceState::NoStreamRun {
        if dev.common().ramp.is_some() && !output_should_mute(dev, ctx) {
            start_ramp(dev, RampRequest::UpStartPlayback);
        }
    }

    match state {
        DeviceState::Open => {
            // Head-room so the device does not underrun before the first
            // client samples arrive.
            let min_cb_level = dev.common().min_cb_level;
            fill_zeros(dev, min_cb_level as usize, ctx)?;
            start_dev(dev)
        }
        DeviceState::NoStreamRun => no_stream_transition(dev, false),
        _ => {
            error!(
                dev = %dev.common().info.name,
                state = ?state,
                "sample ready in unexpected state"
            );
            Err(CoreError::Fatal("sample ready in unexpected state"))
        }
    }
}

/// Runs output state transitions before samples are written this cycle.
/// `have_frames` reports whether any attached stream has playable data.
pub fn prepare_output_before_write_samples(
    dev: &mut dyn Device,
    have_frames: bool,
    ctx: &OutputCtx,
) -> CoreResult<()> {
    let state = dev.common().state;
    if dev.common().direction != Direction::Output {
        return Err(CoreError::InvalidArgument("prepare_output on input device"));
    }

    let may_enter_normal =
        state == DeviceState::Open || state == DeviceState::NoStreamRun;
    if may_enter_normal && have_frames {
        return output_event_sample_ready(dev, ctx);
    }
    if state == DeviceState::NoStreamRun {
        return dev.no_stream(true);
    }
    Ok(())
}

/// Default no-stream behavior: keep the buffer topped up to twice the
/// minimum callback level with silence so a returning stream starts without
/// an audible gap.
pub fn default_no_stream_playback(dev: &mut dyn Device, enable: bool) -> CoreResult<()> {
    if !enable {
        return Ok(());
    }
    let target = dev.common().min_cb_level as usize * 2;
    let (hw_level, _) = frames_queued(dev)?;
    let avail = buffer_avail(dev, hw_level);
    if hw_level < target {
        let ctx = OutputCtx {
            system_muted: false,
            system_volume: 0,
        };
        // Zeros bypass the mute decision anyway; keep the pipeline order.
        return fill_zeros(dev, (target - hw_level).min(avail), &ctx);
    }
    Ok(())
}

/// Writes `frames` of silence through the normal output pipeline.
pub fn fill_zeros(dev: &mut dyn Device, frames: usize, ctx: &OutputCtx) -> CoreResult<()> {
    let fmt = dev
        .common()
        .format
        .ok_or(CoreError::InvalidArgument("fill zeros on closed device"))?;
    let mut remaining = frames;
    while remaining > 0 {
        let mut scratch = std::mem::take(&mut dev.common_mut().mix_scratch);
        let n = remaining.min(scratch.len() / fmt.frame_bytes());
        if n == 0 {
            dev.common_mut().mix_scratch = scratch;
            break;
        }
        mix::mute_buffer(fmt.sample_format, &mut scratch[..n * fmt.frame_bytes()]);
        let result = put_output_buffer(dev, &mut scratch, n, ctx, None);
        dev.common_mut().mix_scratch = scratch;
        // Silence never completes a mute ramp in a surprising way; drop the
        // completion signal here, the mixing path reports its own.
        result?;
        remaining -= n;
    }
    Ok(())
}

/// The put-output pipeline: loopback taps, ramp/mute/software-volume
/// scaling, DSP, the global remix matrix, then the device commit. `buf`
/// holds the mixed samples.
///
/// Returns the ramp completion action when the ramp finished this cycle.
pub fn put_output_buffer(
    dev: &mut dyn Device,
    buf: &mut [u8],
    frames: usize,
    ctx: &OutputCtx,
    remix: Option<&mut crate::mix::RemixConverter>,
) -> CoreResult<Option<RampCompletion>> {
    let fmt = dev
        .common()
        .format
        .ok_or(CoreError::InvalidArgument("put on closed device"))?;
    let frame_bytes = fmt.frame_bytes();
    let data = &mut buf[..frames * frame_bytes];
    let has_streams = !dev.common().streams.is_empty();

    // Loopback taps only see real stream output, not no-stream silence.
    if has_streams {
        if let Some(tap) = dev.common().pre_dsp_hook.clone() {
            tap.lock().unwrap().feed(data, frames, &fmt);
        }
    }

    let ramp_action = dev
        .common()
        .ramp
        .as_ref()
        .map(|r| r.current_action())
        .unwrap_or(RampAction::None);

    let mut completion = None;
    let should_mute = output_should_mute(dev, ctx);

    if should_mute && !matches!(ramp_action, RampAction::Partial { .. }) {
        mix::mute_buffer(fmt.sample_format, data);
    } else {
        if let Some(dsp) = dev.common_mut().dsp.as_mut() {
            dsp.apply(&fmt, data, frames);
        }
        if has_streams {
            if let Some(tap) = dev.common().post_dsp_hook.clone() {
                tap.lock().unwrap().feed(data, frames, &fmt);
            }
        }

        let softvol_needed = software_volume_needed(dev);
        let softvol_scaler = if softvol_needed {
            software_volume_scaler(dev, ctx.system_volume)
        } else {
            1.0
        };

        match ramp_action {
            RampAction::Partial { scaler, increment } => {
                mix::scale_buffer_increment(
                    fmt.sample_format,
                    data,
                    frames,
                    scaler * softvol_scaler,
                    increment * softvol_scaler,
                    fmt.num_channels as usize,
                );
                if let Some(ramp) = dev.common_mut().ramp.as_mut() {
                    completion = ramp.update_ramped_frames(frames as u64);
                }
            }
            RampAction::None => {
                if softvol_needed {
                    mix::scale_buffer(fmt.sample_format, data, softvol_scaler);
                }
            }
        }
    }

    if let Some(remix) = remix {
        remix.apply(fmt.sample_format, fmt.num_channels as usize, data, frames);
    }

    if let Some(est) = dev.common_mut().rate_est.as_mut() {
        est.add_frames(frames as i64);
    }

    // Copy the processed samples into the device's transfer region.
    let mut written = 0usize;
    while written < frames {
        let want = frames - written;
        let src_start = written * frame_bytes;
        let (dst, got) = dev.get_buffer(want)?;
        if got == 0 {
            break;
        }
        let n = got.min(want);
        dst[..n * frame_bytes].copy_from_slice(&data[src_start..src_start + n * frame_bytes]);
        dev.put_buffer(n)?;
        written += n;
    }

    Ok(completion)
}

/// Context for the input pipeline.
#[derive(Debug, Clone, Copy)]
pub struct InputCtx {
    pub capture_muted: bool,
    pub capture_gain_centi_db: i32,
}

/// The get-input pipeline: pulls up to `max_frames` captured frames into
/// the device scratch, applying capture mute or DSP and software gain.
/// Returns the frame count; samples are in `common.mix_scratch`.
pub fn get_input_buffer(
    dev: &mut dyn Device,
    max_frames: usize,
    ctx: &InputCtx,
) -> CoreResult<usize> {
    let fmt = dev
        .common()
        .format
        .ok_or(CoreError::InvalidArgument("capture on closed device"))?;
    let frame_bytes = fmt.frame_bytes();

    let mut scratch = std::mem::take(&mut dev.common_mut().mix_scratch);
    let cap = scratch.len() / frame_bytes;
    let want = max_frames.min(cap);

    let result = (|| -> CoreResult<usize> {
        let (src, got) = dev.get_buffer(want)?;
        if got > want {
            error!(
                "get_buffer returned more frames than requested: {} > {}",
                got, want
            );
            return Err(CoreError::Fatal("device over-returned capture frames"));
        }
        scratch[..got * frame_bytes].copy_from_slice(&src[..got * frame_bytes]);
        Ok(got)
    })();

    let got = match result {
        Ok(got) => got,
        Err(e) => {
            dev.common_mut().mix_scratch = scratch;
            return Err(e);
        }
    };

    let data = &mut scratch[..got * frame_bytes];
    if ctx.capture_muted {
        mix::mute_buffer(fmt.sample_format, data);
    } else {
        if let Some(dsp) = dev.common_mut().dsp.as_mut() {
            dsp.apply(&fmt, data, got);
        }
        let gain = software_gain_scaler(dev, ctx.capture_gain_centi_db);
        if (gain - 1.0).abs() > 0.0001 {
            mix::scale_buffer(fmt.sample_format, data, gain.min(1.0));
        }
    }

    dev.common_mut().mix_scratch = scratch;
    Ok(got)
}

/// Commits consumed capture frames and feeds the rate estimator.
pub fn put_input_buffer(dev: &mut dyn Device, frames: usize) -> CoreResult<()> {
    if let Some(est) = dev.common_mut().rate_est.as_mut() {
        est.add_frames(-(frames as i64));
    }
    dev.put_buffer(frames)
}

// ---- underrun and reset ----

/// Handles an output underrun: device-specific recovery if the backend has
/// one, otherwise refill with a callback level of silence.
pub fn output_underrun(dev: &mut dyn Device, ctx: &OutputCtx) -> CoreResult<()> {
    dev.common_mut().num_underruns += 1;
    if dev.has_output_underrun_handler() {
        dev.output_underrun()
    } else {
        let level = dev.common().min_cb_level as usize;
        fill_zeros(dev, level, ctx)
    }
}

/// Marks a reset request; returns true when this is a new request that the
/// caller must forward to the main thread. Repeated requests while one is
/// pending collapse into it.
pub fn reset_request(dev: &mut dyn Device) -> bool {
    let common = dev.common_mut();
    if common.reset_request_pending {
        return false;
    }
    common.reset_request_pending = true;
    true
}

// ---- ramps and mute ----

/// Effects the caller must apply after starting a ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampStartEffect {
    None,
    /// Unmute case: the device mute state must be updated immediately so
    /// the ramp is audible from its first near-zero samples.
    SetMuteStateNow,
}

/// Starts a ramp on an open output device.
pub fn start_ramp(dev: &mut dyn Device, request: RampRequest) -> RampStartEffect {
    if !is_open(dev) {
        return RampStartEffect::None;
    }
    let rate = dev.common().frame_rate();
    let Some(ramp) = dev.common_mut().ramp.as_mut() else {
        return RampStartEffect::None;
    };
    ramp.start_for_request(request, rate);
    if request == RampRequest::UpUnmute {
        RampStartEffect::SetMuteStateNow
    } else {
        RampStartEffect::None
    }
}

/// Applies the effective mute state to an open device's hardware.
pub fn apply_mute(dev: &mut dyn Device, muted: bool) {
    if is_open(dev) {
        dev.set_mute(muted);
    }
}

// ---- scheduling ----

/// Whether the audio thread should schedule a wake for this output device.
pub fn odev_should_wake(dev: &dyn Device) -> bool {
    if dev.common().direction != Direction::Output {
        return false;
    }
    if let Some(wake) = dev.output_should_wake() {
        return wake;
    }
    matches!(
        dev.common().state,
        DeviceState::NormalRun | DeviceState::NoStreamRun
    )
}

/// Frames to let play before the next wake for this output device, along
/// with the current hw level.
pub fn frames_to_play_in_sleep(dev: &mut dyn Device) -> (usize, usize, Instant) {
    let (hw_level, ts) = match frames_queued(dev) {
        Ok(v) => v,
        Err(_) => (0, Instant::now()),
    };
    if !dev.common().streams.is_empty() {
        // Streams will wake us with replies; sleep until the buffer would
        // run dry as the backstop.
        return (hw_level, hw_level, ts);
    }
    let min_cb_level = dev.common().min_cb_level as usize;
    (hw_level.saturating_sub(min_cb_level), hw_level, ts)
}

/// Folds a level observation into the rate estimator.
pub fn update_rate(dev: &mut dyn Device, level: usize, now: Instant) {
    if let Some(est) = dev.common_mut().rate_est.as_mut() {
        est.check(level as i64, now);
    }
}

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod tests {
    use super::test_support::FakeDevice;
    use super::*;

    fn ctx() -> OutputCtx {
        OutputCtx {
            system_muted: false,
            system_volume: 100,
        }
    }

    fn open_output() -> FakeDevice {
        let mut dev = FakeDevice::new_output(1);
        set_format(&mut dev, &Format::new(SampleFormat::S16LE, 48000, 2)).unwrap();
        open(&mut dev, 480).unwrap();
        dev
    }

    #[test]
    fn test_open_sets_min_cb_level() {
        let mut dev = FakeDevice::new_output(1);
        set_format(&mut dev, &Format::new(SampleFormat::S16LE, 48000, 2)).unwrap();
        open(&mut dev, 480).unwrap();
        assert_eq!(dev.common().min_cb_level, 480);
        assert_eq!(dev.common().state, DeviceState::Open);
        assert!(!dev.common().reset_request_pending);
    }

    #[test]
    fn test_open_clamps_cb_level_to_half_buffer() {
        let mut dev = FakeDevice::new_output(1);
        set_format(&mut dev, &Format::new(SampleFormat::S16LE, 48000, 2)).unwrap();
        open(&mut dev, 100_000).unwrap();
        assert_eq!(dev.common().min_cb_level, dev.common().buffer_size / 2);
    }

    #[test]
    fn test_no_start_device_opens_into_no_stream_run() {
        let mut dev = FakeDevice::new_output(1);
        dev.no_start = true;
        set_format(&mut dev, &Format::new(SampleFormat::S16LE, 48000, 2)).unwrap();
        open(&mut dev, 480).unwrap();
        assert_eq!(dev.common().state, DeviceState::NoStreamRun);
    }

    #[test]
    fn test_input_opens_into_normal_run() {
        let mut dev = FakeDevice::new_input(2);
        set_format(&mut dev, &Format::new(SampleFormat::S16LE, 48000, 2)).unwrap();
        open(&mut dev, 480).unwrap();
        assert_eq!(dev.common().state, DeviceState::NormalRun);
    }

    #[test]
    fn test_sample_ready_transitions_open_to_normal() {
        let mut dev = open_output();
        prepare_output_before_write_samples(&mut dev, true, &ctx()).unwrap();
        assert_eq!(dev.common().state, DeviceState::NormalRun);
        assert_eq!(dev.start_calls, 1);
        // One min_cb_level of zeros was pre-filled.
        assert_eq!(dev.frames_put, 480);
    }

    #[test]
    fn test_no_frames_keeps_open_state() {
        let mut dev = open_output();
        prepare_output_before_write_samples(&mut dev, false, &ctx()).unwrap();
        assert_eq!(dev.common().state, DeviceState::Open);
        assert_eq!(dev.start_calls, 0);
    }

    #[test]
    fn test_no_stream_run_round_trip() {
        let mut dev = open_output();
        prepare_output_before_write_samples(&mut dev, true, &ctx()).unwrap();
        no_stream_transition(&mut dev, true).unwrap();
        assert_eq!(dev.common().state, DeviceState::NoStreamRun);
        prepare_output_before_write_samples(&mut dev, true, &ctx()).unwrap();
        assert_eq!(dev.common().state, DeviceState::NormalRun);
    }

    #[test]
    fn test_no_stream_fill_targets_twice_min_cb() {
        let mut dev = open_output();
        prepare_output_before_write_samples(&mut dev, true, &ctx()).unwrap();
        // Entering no-stream tops the buffer up from one min_cb_level of
        // pre-fill to twice that.
        let before = dev.frames_put;
        no_stream_transition(&mut dev, true).unwrap();
        assert_eq!(dev.frames_put - before, 480, "topped up to 960 total");

        // A steady no-stream cycle with a full buffer adds nothing; the
        // fake device never drains.
        let before = dev.frames_put;
        prepare_output_before_write_samples(&mut dev, false, &ctx()).unwrap();
        assert_eq!(dev.frames_put, before);
    }

    #[test]
    fn test_close_resets_state_and_format() {
        let mut dev = open_output();
        close(&mut dev).unwrap();
        assert_eq!(dev.common().state, DeviceState::Close);
        assert!(dev.common().format.is_none());
        // Idempotent.
        close(&mut dev).unwrap();
    }

    #[test]
    fn test_frames_queued_subtracts_min_buffer_level() {
        let mut dev = open_output();
        dev.common_mut().min_buffer_level = 100;
        dev.hw_level = 150;
        let (level, _) = frames_queued(&mut dev).unwrap();
        assert_eq!(level, 50);
        dev.hw_level = 80;
        let (level, _) = frames_queued(&mut dev).unwrap();
        assert_eq!(level, 0);
    }

    #[test]
    fn test_buffer_avail_respects_levels() {
        let mut dev = open_output();
        dev.common_mut().min_buffer_level = 100;
        // buffer_size is 4096 in the fake.
        assert_eq!(buffer_avail(&dev, 500), 4096 - 100 - 500);
        assert_eq!(buffer_avail(&dev, 5000), 0);
    }

    #[test]
    fn test_mute_zeroes_buffer() {
        let mut dev = open_output();
        let muted_ctx = OutputCtx {
            system_muted: true,
            system_volume: 100,
        };
        let mut buf = vec![0x11u8; 64];
        put_output_buffer(&mut dev, &mut buf, 16, &muted_ctx, None).unwrap();
        assert!(dev.written.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_zero_node_volume_mutes() {
        let mut dev = open_output();
        dev.common_mut().nodes[0].volume = 0;
        let mut buf = vec![0x11u8; 64];
        put_output_buffer(&mut dev, &mut buf, 16, &ctx(), None).unwrap();
        assert!(dev.written.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_softvol_scales_output() {
        let mut dev = open_output();
        dev.common_mut().software_volume_needed = true;
        let half_ctx = OutputCtx {
            system_muted: false,
            // 12 steps of 0.5 dB is about half amplitude.
            system_volume: 88,
        };
        let mut buf: Vec<u8> = std::iter::repeat(1000i16.to_le_bytes())
            .take(32)
            .flatten()
            .collect();
        put_output_buffer(&mut dev, &mut buf, 16, &half_ctx, None).unwrap();
        let out = i16::from_le_bytes([dev.written[0], dev.written[1]]);
        assert!((out as f32 - 501.0).abs() < 15.0, "got {}", out);
    }

    #[test]
    fn test_ramp_overrides_mute_and_completes() {
        let mut dev = open_output();
        dev.common_mut().ramp = Some(Ramp::new());
        prepare_output_before_write_samples(&mut dev, true, &ctx()).unwrap();
        start_ramp(&mut dev, RampRequest::DownMute);

        let muted_ctx = OutputCtx {
            system_muted: true,
            system_volume: 100,
        };
        // 0.1 s at 48 kHz is 4800 frames; emit them in two halves.
        let mut buf = vec![0x22u8; 2400 * 4];
        let done = put_output_buffer(&mut dev, &mut buf, 2400, &muted_ctx, None).unwrap();
        assert_eq!(done, None);
        // Mid-ramp the output is scaled, not hard-zeroed.
        assert!(dev.written.iter().any(|b| *b != 0));

        let mut buf = vec![0x22u8; 2400 * 4];
        let done = put_output_buffer(&mut dev, &mut buf, 2400, &muted_ctx, None).unwrap();
        assert_eq!(done, Some(RampCompletion::FinalizeMute));
    }

    #[test]
    fn test_unmute_ramp_requests_immediate_mute_state() {
        let mut dev = open_output();
        dev.common_mut().ramp = Some(Ramp::new());
        prepare_output_before_write_samples(&mut dev, true, &ctx()).unwrap();
        assert_eq!(
            start_ramp(&mut dev, RampRequest::UpUnmute),
            RampStartEffect::SetMuteStateNow
        );
        assert_eq!(
            start_ramp(&mut dev, RampRequest::DownMute),
            RampStartEffect::None
        );
    }

    #[test]
    fn test_underrun_fills_min_cb_level() {
        let mut dev = open_output();
        prepare_output_before_write_samples(&mut dev, true, &ctx()).unwrap();
        let before = dev.frames_put;
        output_underrun(&mut dev, &ctx()).unwrap();
        assert_eq!(dev.frames_put - before, 480);
        assert_eq!(dev.get_num_underruns(), 1);
    }

    #[test]
    fn test_reset_request_is_idempotent() {
        let mut dev = open_output();
        assert!(reset_request(&mut dev));
        assert!(!reset_request(&mut dev));
        assert!(!reset_request(&mut dev));
        // Reopening clears the pending flag.
        close(&mut dev).unwrap();
        set_format(&mut dev, &Format::new(SampleFormat::S16LE, 48000, 2)).unwrap();
        open(&mut dev, 480).unwrap();
        assert!(reset_request(&mut dev));
    }

    #[test]
    fn test_add_rm_stream_tracks_cb_levels() {
        use crate::stream::test_support::make_stream;
        use sonara_proto::Direction as D;

        let mut dev = open_output();
        let (s1, c1) = make_stream(D::Output, 1);
        let arc1 = Arc::new(Mutex::new(s1));
        let fmt = dev.common().format.unwrap();
        add_stream(&mut dev, DevStream::new(&arc1, fmt));
        assert_eq!(dev.common().min_cb_level, 480);
        assert_eq!(dev.common().max_cb_level, 480);

        prepare_output_before_write_samples(&mut dev, true, &ctx()).unwrap();
        assert_eq!(dev.common().state, DeviceState::NormalRun);

        let removed = rm_stream(&mut dev, 1).unwrap();
        assert_eq!(removed.stream_id, 1);
        assert_eq!(
            dev.common().state,
            DeviceState::NoStreamRun,
            "last stream removal drops output to no-stream"
        );
        assert!(rm_stream(&mut dev, 1).is_none());
        let _ = nix::unistd::close(c1);
    }

    #[test]
    fn test_should_wake_only_in_run_states() {
        let mut dev = open_output();
        assert!(!odev_should_wake(&dev), "Open state does not wake");
        prepare_output_before_write_samples(&mut dev, true, &ctx()).unwrap();
        assert!(odev_should_wake(&dev));
        no_stream_transition(&mut dev, true).unwrap();
        assert!(odev_should_wake(&dev));
    }

    #[test]
    fn test_format_negotiation_prefers_exact() {
        let mut dev = FakeDevice::new_output(1);
        dev.common_mut().supported_rates = vec![44100, 48000];
        dev.common_mut().supported_channel_counts = vec![2];
        set_format(&mut dev, &Format::new(SampleFormat::S16LE, 48000, 2)).unwrap();
        let fmt = dev.common().format.unwrap();
        assert_eq!(fmt.frame_rate, 48000);
        assert_eq!(fmt.num_channels, 2);
    }

    #[test]
    fn test_format_negotiation_falls_back() {
        let mut dev = FakeDevice::new_output(1);
        dev.common_mut().supported_rates = vec![48000];
        dev.common_mut().supported_channel_counts = vec![2];
        dev.common_mut().supported_formats = vec![SampleFormat::S32LE];
        set_format(&mut dev, &Format::new(SampleFormat::S16LE, 96000, 6)).unwrap();
        let fmt = dev.common().format.unwrap();
        assert_eq!(fmt.frame_rate, 48000, "divisor rate chosen");
        assert_eq!(fmt.num_channels, 2, "stereo fallback");
        assert_eq!(fmt.sample_format, SampleFormat::S32LE);
    }
}
