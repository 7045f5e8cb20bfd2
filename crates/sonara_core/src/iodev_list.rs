//! The authoritative device list and routing policy
//!
//! Owns every device of both directions plus the enabled subset, the
//! always-present fallback devices, the loopback taps, and the stream
//! registry. Main-thread only; every change the audio thread must see goes
//! through its command channel.
//!
//! Routing rules:
//! - The fallback (empty) device of a direction is enabled exactly when no
//!   real device of that direction is.
//! - Enabling a device opens it if any non-pinned stream of its direction
//!   exists and attaches those streams; open failure arms a retry timer and
//!   leaves the fallback in place.
//! - Disabling detaches non-pinned streams through the audio thread and
//!   closes the device unless a pinned stream still needs it. Output
//!   devices left idle by the last stream drain for ten seconds first.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use sonara_proto::{
    node_id, node_id_dev_index, node_id_node_index, Direction, NodeAttr, NodeId, NodeType,
    StreamId, TestDevCommand, TestDevType,
};

use crate::audio_thread::AudioThread;
use crate::device::{
    self, Device, DeviceHandle, EmptyDevice, LoopbackDevice, LoopbackPoint, TestDevice,
};
use crate::error::{CoreError, CoreResult};
use crate::observer::{Observer, ObserverEvent, ObserverRegistry};
use crate::ramp::RampRequest;
use crate::stream::{Stream, StreamConfig};
use crate::stream_list::StreamList;
use crate::system_state::{copy_name, SystemState};
use crate::timers::{TimerId, TimerManager};

/// Indices below this are reserved for built-in devices; dynamically added
/// devices count up from here.
pub const MAX_SPECIAL_DEVICE_IDX: u32 = 16;

/// Delay before retrying a failed device open.
pub const INIT_DEV_DELAY: Duration = Duration::from_millis(1000);

/// How long an idle output device stays open after its last stream leaves.
pub const IDLE_TIMEOUT_INTERVAL: Duration = Duration::from_secs(10);

/// Timer tokens the list arms on the server's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevTimer {
    InitRetry { dev_idx: u32 },
    IdleCheck,
}

struct EnabledDev {
    dev_idx: u32,
    init_timer: Option<TimerId>,
}

pub struct IoDevList {
    devs: [Vec<DeviceHandle>; 2],
    enabled: [Vec<EnabledDev>; 2],
    fallback_idx: [u32; 2],
    loopback_taps: Vec<(u32, LoopbackPoint, Arc<Mutex<crate::device::LoopbackTap>>)>,
    next_dev_idx: u32,

    stream_list: StreamList,
    audio_thread: Rc<AudioThread>,
    system: Rc<RefCell<SystemState>>,
    /// Lock-free view of volume/mute, safe to read while a setter on
    /// `system` is mid-notify.
    system_shared: Arc<crate::system_state::SystemShared>,
    observers: Rc<ObserverRegistry>,
    dsp_config: sonara_dsp::DspConfig,

    timers: TimerManager<DevTimer>,
    idle_timer: Option<TimerId>,
    suspended: bool,
}

impl IoDevList {
    pub fn new(
        audio_thread: Rc<AudioThread>,
        system: Rc<RefCell<SystemState>>,
        observers: Rc<ObserverRegistry>,
        dsp_config: sonara_dsp::DspConfig,
    ) -> CoreResult<Rc<RefCell<Self>>> {
        let out_fallback = EmptyDevice::new(Direction::Output);
        let in_fallback = EmptyDevice::new(Direction::Input);
        let fallback_idx = [
            out_fallback.common().info.idx,
            in_fallback.common().info.idx,
        ];

        let loop_pre = LoopbackDevice::new(LoopbackPoint::PostMixPreDsp);
        let loop_post = LoopbackDevice::new(LoopbackPoint::PostDsp);
        let loopback_taps = vec![
            (
                loop_pre.common().info.idx,
                LoopbackPoint::PostMixPreDsp,
                loop_pre.tap(),
            ),
            (
                loop_post.common().info.idx,
                LoopbackPoint::PostDsp,
                loop_post.tap(),
            ),
        ];

        let system_shared = system.borrow().shared();
        let mut list = Self {
            devs: [Vec::new(), Vec::new()],
            enabled: [Vec::new(), Vec::new()],
            fallback_idx,
            loopback_taps,
            next_dev_idx: MAX_SPECIAL_DEVICE_IDX,
            stream_list: StreamList::new(),
            audio_thread,
            system,
            system_shared,
            observers,
            dsp_config,
            timers: TimerManager::new(),
            idle_timer: None,
            suspended: false,
        };

        list.devs[0].push(wrap(out_fallback));
        list.devs[1].push(wrap(in_fallback));
        list.devs[1].push(wrap(loop_pre));
        list.devs[1].push(wrap(loop_post));

        list.enable_device(fallback_idx[0])?;
        list.enable_device(fallback_idx[1])?;
        list.update_device_list();

        let list = Rc::new(RefCell::new(list));
        let observer = Rc::new(IoDevListObserver {
            list: Rc::downgrade(&list),
        });
        let registry = Rc::clone(&list.borrow().observers);
        registry.add(observer);
        Ok(list)
    }

    // ---- lookup ----

    pub fn find_dev(&self, dev_idx: u32) -> Option<DeviceHandle> {
        for dir in 0..2 {
            for dev in &self.devs[dir] {
                if dev.lock().unwrap().common().info.idx == dev_idx {
                    return Some(Arc::clone(dev));
                }
            }
        }
        None
    }

    fn dev_direction(&self, dev_idx: u32) -> Option<Direction> {
        self.find_dev(dev_idx)
            .map(|d| d.lock().unwrap().common().direction)
    }

    pub fn is_enabled(&self, dev_idx: u32) -> bool {
        self.enabled
            .iter()
            .any(|list| list.iter().any(|e| e.dev_idx == dev_idx))
    }

    fn first_enabled_output(&self) -> Option<DeviceHandle> {
        self.enabled[0]
            .first()
            .and_then(|e| self.find_dev(e.dev_idx))
    }

    pub fn active_node_id(&self, direction: Direction) -> NodeId {
        let dir = direction.hw_index();
        for e in &self.enabled[dir] {
            if let Some(dev) = self.find_dev(e.dev_idx) {
                let guard = dev.lock().unwrap();
                if let Some(node) = guard.common().active_node() {
                    return node_id(e.dev_idx, node.idx);
                }
            }
        }
        0
    }

    pub fn stream_list(&self) -> &StreamList {
        &self.stream_list
    }

    // ---- device registration ----

    pub fn add_device(&mut self, mut dev: Box<dyn Device>) -> CoreResult<u32> {
        let direction = dev.common().direction;
        let dir = direction.hw_index();
        let idx = if dev.common().info.idx >= MAX_SPECIAL_DEVICE_IDX
            || dev.common().info.idx == 0
        {
            let idx = self.next_dev_idx;
            self.next_dev_idx += 1;
            dev.common_mut().info.idx = idx;
            idx
        } else {
            dev.common().info.idx
        };
        if self.find_dev(idx).is_some() {
            return Err(CoreError::DeviceBusy(idx));
        }
        info!(
            idx,
            name = %dev.common().info.name,
            "adding {} device",
            if dir == 0 { "output" } else { "input" }
        );
        self.devs[dir].push(Arc::new(Mutex::new(dev)));
        self.update_device_list();
        self.observers.notify(&ObserverEvent::NodesChanged);
        Ok(idx)
    }

    /// Removes a device; refuses while it is still open.
    pub fn rm_device(&mut self, dev_idx: u32) -> CoreResult<()> {
        self.disable_dev(dev_idx);
        let handle = self
            .find_dev(dev_idx)
            .ok_or(CoreError::NoSuchDevice(dev_idx))?;
        if device::is_open(handle.lock().unwrap().as_ref()) {
            return Err(CoreError::DeviceBusy(dev_idx));
        }
        for dir in 0..2 {
            self.devs[dir]
                .retain(|d| d.lock().unwrap().common().info.idx != dev_idx);
        }
        self.update_device_list();
        self.observers.notify(&ObserverEvent::NodesChanged);
        Ok(())
    }

    // ---- stream entry points ----

    pub fn add_stream(&mut self, config: StreamConfig) -> CoreResult<Arc<Mutex<Stream>>> {
        let direction = config.direction;
        let stream = self.stream_list.add(config)?;
        if let Err(e) = self.stream_added(&stream) {
            let id = stream.lock().unwrap().id;
            let _ = self.stream_list.rm_silent(id);
            return Err(e);
        }
        self.system
            .borrow_mut()
            .stream_added(direction, &self.observers);
        Ok(stream)
    }

    pub fn rm_stream(&mut self, id: StreamId) -> CoreResult<()> {
        let stream = self
            .stream_list
            .get(id)
            .map(Arc::clone)
            .ok_or(CoreError::NoSuchStream(id))?;
        let direction = stream.lock().unwrap().direction;
        self.stream_list.rm_silent(id)?;
        self.stream_removed(&stream);
        self.system
            .borrow_mut()
            .stream_removed(direction, &self.observers);
        Ok(())
    }

    pub fn rm_all_client_streams(&mut self, client_id: u32) {
        let ids: Vec<StreamId> = self
            .stream_list
            .iter()
            .map(|s| s.lock().unwrap().id)
            .filter(|id| sonara_proto::stream_id_client(*id) == client_id)
            .collect();
        for id in ids {
            if let Err(e) = self.rm_stream(id) {
                debug!("client stream teardown: {e}");
            }
        }
    }

    fn stream_added(&mut self, stream: &Arc<Mutex<Stream>>) -> CoreResult<()> {
        if self.suspended {
            return Ok(());
        }
        let (direction, is_pinned, pinned_idx, id) = {
            let s = stream.lock().unwrap();
            (s.direction, s.is_pinned, s.pinned_dev_idx, s.id)
        };

        if is_pinned {
            return self.pinned_stream_added(stream, pinned_idx);
        }

        let dir = direction.hw_index();
        let enabled: Vec<u32> = self.enabled[dir].iter().map(|e| e.dev_idx).collect();
        let mut attached_devs = Vec::new();
        for dev_idx in enabled {
            let Some(handle) = self.find_dev(dev_idx) else {
                continue;
            };
            match self.init_device(&handle, stream) {
                Ok(()) => attached_devs.push(handle),
                Err(e) => {
                    // Keep going; silence beats stopping playback for the
                    // devices that did open.
                    error!(dev_idx, "init device failed: {e}");
                    self.schedule_init_retry(dev_idx);
                }
            }
        }

        if attached_devs.is_empty() {
            debug!(
                stream = format_args!("{id:#x}"),
                "no device opened, falling back to silence"
            );
            // Enabling the fallback attaches every waiting stream of the
            // direction, this one included. Attach directly only if that
            // path did not pick it up (the fallback was already enabled
            // but failed above, which should not happen for empty devices).
            self.possibly_enable_fallback(direction);
            if stream.lock().unwrap().num_attached_devs == 0 {
                let fallback = self
                    .find_dev(self.fallback_idx[dir])
                    .ok_or(CoreError::Fatal("fallback device missing"))?;
                self.init_device(&fallback, stream)?;
                self.audio_thread
                    .add_stream(Arc::clone(stream), vec![fallback])?;
            }
            self.refresh_loopback_hooks();
            return Ok(());
        }

        self.audio_thread
            .add_stream(Arc::clone(stream), attached_devs)?;
        self.refresh_loopback_hooks();
        Ok(())
    }

    fn pinned_stream_added(
        &mut self,
        stream: &Arc<Mutex<Stream>>,
        pinned_idx: u32,
    ) -> CoreResult<()> {
        let handle = self
            .find_dev(pinned_idx)
            .ok_or(CoreError::NoSuchDevice(pinned_idx))?;
        // The active node may have been turned off when the last normal
        // stream left; make sure it is configured.
        self.dev_update_active_node(&handle, None, true);
        self.init_device(&handle, stream)?;
        self.audio_thread
            .add_stream(Arc::clone(stream), vec![handle])?;
        self.refresh_loopback_hooks();
        Ok(())
    }

    fn stream_removed(&mut self, stream: &Arc<Mutex<Stream>>) {
        if let Err(e) = self.audio_thread.disconnect_stream(Arc::clone(stream), None) {
            warn!("disconnect on remove failed: {e}");
        }
        let (direction, is_pinned, pinned_idx) = {
            let s = stream.lock().unwrap();
            (s.direction, s.is_pinned, s.pinned_dev_idx)
        };

        if is_pinned {
            if let Some(handle) = self.find_dev(pinned_idx) {
                if !self.is_enabled(pinned_idx) {
                    self.close_dev(&handle);
                    self.dev_update_active_node(&handle, None, false);
                }
            }
        }

        self.possibly_close_enabled_devs(direction);
        self.refresh_loopback_hooks();
    }

    /// After the last non-pinned stream of a direction leaves: inputs close
    /// now, outputs drain for the idle interval first.
    fn possibly_close_enabled_devs(&mut self, direction: Direction) {
        let dir = direction.hw_index();
        let has_default_streams = self.stream_list.iter().any(|s| {
            let s = s.lock().unwrap();
            s.direction.hw_index() == dir && !s.is_pinned
        });
        if has_default_streams {
            return;
        }

        let enabled: Vec<u32> = self.enabled[dir].iter().map(|e| e.dev_idx).collect();
        for dev_idx in enabled {
            if self.dev_has_pinned_stream(dev_idx) {
                continue;
            }
            let Some(handle) = self.find_dev(dev_idx) else {
                continue;
            };
            if direction == Direction::Input {
                self.close_dev(&handle);
                continue;
            }
            let mut dev = handle.lock().unwrap();
            if device::is_open(dev.as_ref()) {
                dev.common_mut().idle_timeout = Some(Instant::now() + IDLE_TIMEOUT_INTERVAL);
            }
        }
        self.idle_dev_check();
    }

    fn dev_has_pinned_stream(&self, dev_idx: u32) -> bool {
        self.stream_list.iter().any(|s| {
            let s = s.lock().unwrap();
            s.is_pinned && s.pinned_dev_idx == dev_idx
        })
    }

    // ---- open / close ----

    /// Opens the device for a stream's format if not open yet and hands it
    /// to the audio thread.
    fn init_device(
        &mut self,
        handle: &DeviceHandle,
        stream: &Arc<Mutex<Stream>>,
    ) -> CoreResult<()> {
        let (fmt, cb_threshold) = {
            let s = stream.lock().unwrap();
            (s.format, s.cb_threshold)
        };
        let dev_idx;
        {
            let mut dev = handle.lock().unwrap();
            dev_idx = dev.common().info.idx;
            dev.common_mut().idle_timeout = None;
            if device::is_open(dev.as_ref()) {
                return Ok(());
            }
            device::set_format(dev.as_mut(), &fmt)?;
            device::open(dev.as_mut(), cb_threshold).map_err(|e| {
                CoreError::DeviceUnavailable {
                    dev: dev_idx,
                    source: Box::new(e),
                }
            })?;
            device::attach_dsp(dev.as_mut(), &self.dsp_config);
        }
        // Guard released: the audio thread takes its own locks.
        if let Err(e) = self.audio_thread.add_open_dev(Arc::clone(handle)) {
            let mut dev = handle.lock().unwrap();
            let _ = device::close(dev.as_mut());
            return Err(e);
        }
        Ok(())
    }

    fn close_dev(&mut self, handle: &DeviceHandle) {
        let dev_idx = handle.lock().unwrap().common().info.idx;
        if !device::is_open(handle.lock().unwrap().as_ref()) {
            return;
        }
        if self.dev_has_pinned_stream(dev_idx) {
            return;
        }
        if let Err(e) = self.audio_thread.rm_open_dev(dev_idx) {
            debug!(dev_idx, "rm open dev: {e}");
        }
        {
            let mut dev = handle.lock().unwrap();
            dev.common_mut().idle_timeout = None;
            if let Err(e) = device::close(dev.as_mut()) {
                warn!(dev_idx, "close failed: {e}");
            }
        }
        self.idle_dev_check();
    }

    /// Sweeps idle outputs, closing the expired ones and re-arming the
    /// timer for the earliest remaining deadline.
    fn idle_dev_check(&mut self) {
        let now = Instant::now();
        let mut next_deadline: Option<Instant> = None;

        let enabled: Vec<u32> = self.enabled[0].iter().map(|e| e.dev_idx).collect();
        for dev_idx in enabled {
            let Some(handle) = self.find_dev(dev_idx) else {
                continue;
            };
            let deadline = handle.lock().unwrap().common().idle_timeout;
            let Some(deadline) = deadline else { continue };
            if deadline <= now {
                if let Err(e) = self.audio_thread.rm_open_dev(dev_idx) {
                    debug!(dev_idx, "idle close rm: {e}");
                }
                let mut dev = handle.lock().unwrap();
                dev.common_mut().idle_timeout = None;
                let _ = device::close(dev.as_mut());
                debug!(dev_idx, "closed idle output device");
            } else {
                next_deadline =
                    Some(next_deadline.map_or(deadline, |d: Instant| d.min(deadline)));
            }
        }

        if let Some(t) = self.idle_timer.take() {
            self.timers.cancel(t);
        }
        if let Some(deadline) = next_deadline {
            let at = deadline.max(now + Duration::from_millis(10));
            self.idle_timer = Some(self.timers.arm(at, DevTimer::IdleCheck));
        }
    }

    // ---- enable / disable ----

    fn possibly_enable_fallback(&mut self, direction: Direction) {
        let idx = self.fallback_idx[direction.hw_index()];
        if !self.is_enabled(idx) {
            if let Err(e) = self.enable_device(idx) {
                error!("fallback enable failed: {e}");
            }
        }
    }

    fn possibly_disable_fallback(&mut self, direction: Direction) {
        let idx = self.fallback_idx[direction.hw_index()];
        if self.is_enabled(idx) {
            self.disable_device(idx);
        }
    }

    fn enable_device(&mut self, dev_idx: u32) -> CoreResult<()> {
        let handle = self
            .find_dev(dev_idx)
            .ok_or(CoreError::NoSuchDevice(dev_idx))?;
        let direction = handle.lock().unwrap().common().direction;
        let dir = direction.hw_index();
        if self.is_enabled(dev_idx) {
            return Err(CoreError::DeviceBusy(dev_idx));
        }
        self.enabled[dir].push(EnabledDev {
            dev_idx,
            init_timer: None,
        });
        handle.lock().unwrap().common_mut().is_enabled = true;
        debug!(dev_idx, "device enabled");

        let rc = self.init_and_attach_streams(&handle, direction);
        if let Err(e) = rc {
            self.schedule_init_retry(dev_idx);
            return Err(e);
        }
        self.refresh_loopback_hooks();
        Ok(())
    }

    fn init_and_attach_streams(
        &mut self,
        handle: &DeviceHandle,
        direction: Direction,
    ) -> CoreResult<()> {
        if self.suspended {
            return Ok(());
        }
        let streams: Vec<Arc<Mutex<Stream>>> = self
            .stream_list
            .iter()
            .filter(|s| {
                let s = s.lock().unwrap();
                s.direction.hw_index() == direction.hw_index() && !s.is_pinned
            })
            .map(Arc::clone)
            .collect();
        for stream in streams {
            self.init_device(handle, &stream)?;
            self.audio_thread
                .add_stream(stream, vec![Arc::clone(handle)])?;
        }
        Ok(())
    }

    fn disable_device(&mut self, dev_idx: u32) {
        let Some(handle) = self.find_dev(dev_idx) else {
            return;
        };
        let direction = handle.lock().unwrap().common().direction;
        let dir = direction.hw_index();

        let Some(pos) = self.enabled[dir].iter().position(|e| e.dev_idx == dev_idx) else {
            return;
        };
        let entry = self.enabled[dir].remove(pos);
        if let Some(t) = entry.init_timer {
            self.timers.cancel(t);
        }
        handle.lock().unwrap().common_mut().is_enabled = false;
        debug!(dev_idx, "device disabled");

        // Pull all default streams off this device.
        let streams: Vec<Arc<Mutex<Stream>>> = self
            .stream_list
            .iter()
            .filter(|s| {
                let s = s.lock().unwrap();
                s.direction.hw_index() == dir && !s.is_pinned
            })
            .map(Arc::clone)
            .collect();
        for stream in streams {
            if let Err(e) = self
                .audio_thread
                .disconnect_stream(stream, Some(dev_idx))
            {
                debug!("disconnect: {e}");
            }
        }

        self.close_dev(&handle);
        self.dev_update_active_node(&handle, None, false);
        self.refresh_loopback_hooks();
    }

    /// Public disable with the fallback rule: enabling the fallback first
    /// when this is the only enabled device, so there is no silence gap.
    pub fn disable_dev(&mut self, dev_idx: u32) {
        let Some(direction) = self.dev_direction(dev_idx) else {
            return;
        };
        let dir = direction.hw_index();
        if !self.is_enabled(dev_idx) {
            return;
        }
        let is_only_enabled = self.enabled[dir].len() == 1;
        if is_only_enabled {
            self.possibly_enable_fallback(direction);
        }
        self.disable_device(dev_idx);
        self.notify_active_node_changed(direction);
    }

    /// Public enable: a real device replaces the fallback.
    pub fn enable_dev(&mut self, dev_idx: u32) -> CoreResult<()> {
        let direction = self
            .dev_direction(dev_idx)
            .ok_or(CoreError::NoSuchDevice(dev_idx))?;
        self.possibly_disable_fallback(direction);
        let rc = self.enable_device(dev_idx);
        self.notify_active_node_changed(direction);
        rc
    }

    // ---- retry ----

    fn schedule_init_retry(&mut self, dev_idx: u32) {
        let Some(direction) = self.dev_direction(dev_idx) else {
            return;
        };
        let dir = direction.hw_index();
        let Some(entry) = self.enabled[dir].iter_mut().find(|e| e.dev_idx == dev_idx) else {
            return;
        };
        if entry.init_timer.is_none() {
            let deadline = Instant::now() + INIT_DEV_DELAY;
            entry.init_timer = Some(self.timers.arm(deadline, DevTimer::InitRetry { dev_idx }));
            info!(dev_idx, "armed open retry");
        }
    }

    fn init_device_retry(&mut self, dev_idx: u32) {
        let Some(direction) = self.dev_direction(dev_idx) else {
            return;
        };
        let dir = direction.hw_index();
        if let Some(entry) = self.enabled[dir].iter_mut().find(|e| e.dev_idx == dev_idx) {
            entry.init_timer = None;
        } else {
            return; // disabled while the retry was pending
        }
        let Some(handle) = self.find_dev(dev_idx) else {
            return;
        };
        if device::is_open(handle.lock().unwrap().as_ref()) {
            return;
        }
        match self.init_and_attach_streams(&handle, direction) {
            Ok(()) => {
                info!(dev_idx, "device open retry succeeded");
                self.possibly_disable_fallback(direction);
            }
            Err(e) => {
                warn!(dev_idx, "device open retry failed: {e}");
                self.schedule_init_retry(dev_idx);
            }
        }
    }

    // ---- timers surface for the server loop ----

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    #[cfg(test)]
    pub(crate) fn force_idle_check(&mut self) {
        self.idle_dev_check();
    }

    pub fn handle_timers(&mut self, now: Instant) {
        for token in self.timers.pop_expired(now) {
            match token {
                DevTimer::InitRetry { dev_idx } => self.init_device_retry(dev_idx),
                DevTimer::IdleCheck => {
                    self.idle_timer = None;
                    self.idle_dev_check();
                }
            }
        }
    }

    // ---- node selection ----

    pub fn select_node(&mut self, direction: Direction, id: NodeId) {
        let dir = direction.hw_index();
        let new_idx = node_id_dev_index(id);
        let new_node = node_id_node_index(id);
        let new_dev = if id == 0 { None } else { self.find_dev(new_idx) };

        // A mismatched direction or vanished device behaves like "no
        // selection": only the fallback stays up.
        if let Some(dev) = &new_dev {
            if dev.lock().unwrap().common().direction != direction {
                return;
            }
        }

        let already_enabled = new_dev.is_some()
            && self.is_enabled(new_idx)
            && new_dev
                .as_ref()
                .map(|d| d.lock().unwrap().common().active_node == Some(new_node))
                .unwrap_or(false);

        // Fallback bridges the gap while the new device opens; on some
        // hardware that is hundreds of milliseconds.
        if !already_enabled {
            self.possibly_enable_fallback(direction);
        }

        let to_disable: Vec<u32> = self.enabled[dir]
            .iter()
            .map(|e| e.dev_idx)
            .filter(|idx| {
                *idx != self.fallback_idx[dir] && !(already_enabled && *idx == new_idx)
            })
            .collect();
        for idx in to_disable {
            self.disable_device(idx);
        }

        if let Some(dev) = new_dev {
            if !already_enabled {
                self.dev_update_active_node(&dev, Some(new_node), true);
                match self.enable_device(new_idx) {
                    Ok(()) => self.possibly_disable_fallback(direction),
                    Err(e) => warn!(dev = new_idx, "select target failed to open: {e}"),
                }
            }
        }

        self.notify_active_node_changed(direction);
    }

    pub fn add_active_node(&mut self, direction: Direction, id: NodeId) {
        let dev_idx = node_id_dev_index(id);
        let Some(handle) = self.find_dev(dev_idx) else {
            return;
        };
        if handle.lock().unwrap().common().direction != direction {
            return;
        }
        self.dev_update_active_node(&handle, Some(node_id_node_index(id)), true);
        if let Err(e) = self.enable_dev(dev_idx) {
            warn!(dev_idx, "add active node: {e}");
        }
    }

    pub fn rm_active_node(&mut self, _direction: Direction, id: NodeId) {
        let dev_idx = node_id_dev_index(id);
        if self.find_dev(dev_idx).is_none() {
            return;
        }
        self.disable_dev(dev_idx);
    }

    /// Guards duplicate enables so an overlapping select-node and open
    /// retry produce one observable enable edge per node.
    fn dev_update_active_node(
        &self,
        handle: &DeviceHandle,
        node_idx: Option<u32>,
        enabled: bool,
    ) {
        let mut dev = handle.lock().unwrap();
        let target = node_idx.or(dev.common().active_node).unwrap_or(0);
        if enabled
            && dev.common().active_node_enabled
            && dev.common().active_node == Some(target)
        {
            return;
        }
        dev.common_mut().active_node = Some(target);
        dev.update_active_node(target, enabled);
        dev.common_mut().active_node_enabled = enabled;
    }

    fn notify_active_node_changed(&mut self, direction: Direction) {
        let node_id = self.active_node_id(direction);
        self.update_device_list();
        self.observers.notify(&ObserverEvent::ActiveNodeChanged {
            direction,
            node_id,
        });
    }

    // ---- node attributes ----

    pub fn set_node_attr(&mut self, id: NodeId, attr: NodeAttr, value: i32) -> CoreResult<()> {
        let dev_idx = node_id_dev_index(id);
        let node_idx = node_id_node_index(id);
        let handle = self
            .find_dev(dev_idx)
            .ok_or(CoreError::NoSuchDevice(dev_idx))?;

        match attr {
            NodeAttr::Plugged => self.plug_node(&handle, node_idx, value != 0),
            NodeAttr::Volume => self.set_node_volume(&handle, id, node_idx, value),
            NodeAttr::CaptureGain => self.set_node_capture_gain(&handle, id, node_idx, value),
            NodeAttr::SwapLeftRight => {
                self.set_node_left_right_swapped(&handle, id, node_idx, value != 0)
            }
        }
    }

    fn plug_node(&mut self, handle: &DeviceHandle, node_idx: u32, plugged: bool) -> CoreResult<()> {
        let (changed, was_active, dev_idx) = {
            let mut dev = handle.lock().unwrap();
            let dev_idx = dev.common().info.idx;
            let active = dev.common().active_node == Some(node_idx);
            let Some(node) = dev.common_mut().nodes.iter_mut().find(|n| n.idx == node_idx)
            else {
                return Err(CoreError::InvalidArgument("no such node"));
            };
            if node.plugged == plugged {
                (false, active, dev_idx)
            } else {
                node.plugged = plugged;
                node.plugged_time = plugged.then(Instant::now);
                (true, active, dev_idx)
            }
        };
        if changed {
            if !plugged && was_active {
                self.disable_dev(dev_idx);
            }
            self.update_device_list();
            self.observers.notify(&ObserverEvent::NodesChanged);
        }
        Ok(())
    }

    fn set_node_volume(
        &mut self,
        handle: &DeviceHandle,
        id: NodeId,
        node_idx: u32,
        value: i32,
    ) -> CoreResult<()> {
        let volume = value.clamp(0, 100) as u32;
        {
            let mut dev = handle.lock().unwrap();
            if dev.common().direction != Direction::Output {
                return Err(CoreError::InvalidArgument("volume on input node"));
            }
            let system_volume = self.system_shared.volume();
            let Some(node) = dev.common_mut().nodes.iter_mut().find(|n| n.idx == node_idx)
            else {
                return Err(CoreError::InvalidArgument("no such node"));
            };
            node.volume = volume;
            let adjusted = node.adjust_volume(system_volume);
            if dev.has_hw_volume() && device::is_open(dev.as_ref()) {
                dev.set_volume(adjusted);
            }
        }
        self.update_device_list();
        self.observers.notify(&ObserverEvent::OutputNodeVolumeChanged {
            node_id: id,
            volume: volume as i32,
        });
        Ok(())
    }

    fn set_node_capture_gain(
        &mut self,
        handle: &DeviceHandle,
        id: NodeId,
        node_idx: u32,
        value: i32,
    ) -> CoreResult<()> {
        {
            let mut dev = handle.lock().unwrap();
            if dev.common().direction != Direction::Input {
                return Err(CoreError::InvalidArgument("gain on output node"));
            }
            let Some(node) = dev.common_mut().nodes.iter_mut().find(|n| n.idx == node_idx)
            else {
                return Err(CoreError::InvalidArgument("no such node"));
            };
            node.capture_gain = value;
            if device::is_open(dev.as_ref()) {
                dev.set_capture_gain(value);
            }
        }
        self.update_device_list();
        self.observers.notify(&ObserverEvent::InputNodeGainChanged {
            node_id: id,
            gain: value,
        });
        Ok(())
    }

    fn set_node_left_right_swapped(
        &mut self,
        handle: &DeviceHandle,
        id: NodeId,
        node_idx: u32,
        swapped: bool,
    ) -> CoreResult<()> {
        {
            let mut dev = handle.lock().unwrap();
            let Some(node) = dev.common_mut().nodes.iter_mut().find(|n| n.idx == node_idx)
            else {
                return Err(CoreError::InvalidArgument("no such node"));
            };
            if node.left_right_swapped == swapped {
                return Ok(());
            }
            node.left_right_swapped = swapped;
        }
        self.update_device_list();
        self.observers
            .notify(&ObserverEvent::NodeLeftRightSwappedChanged {
                node_id: id,
                swapped,
            });
        Ok(())
    }

    // ---- hotword ----

    pub fn get_hotword_models(&self, id: NodeId) -> Option<String> {
        let handle = self.find_dev(node_id_dev_index(id))?;
        let dev = handle.lock().unwrap();
        let node = dev.common().active_node()?;
        if node.node_type != NodeType::Hotword {
            return None;
        }
        dev.get_hotword_models()
    }

    pub fn set_hotword_model(&mut self, id: NodeId, model: &str) -> CoreResult<()> {
        let handle = self
            .find_dev(node_id_dev_index(id))
            .ok_or(CoreError::NoSuchDevice(node_id_dev_index(id)))?;
        let mut dev = handle.lock().unwrap();
        let is_hotword = dev
            .common()
            .active_node()
            .map(|n| n.node_type == NodeType::Hotword)
            .unwrap_or(false);
        if !is_hotword {
            return Err(CoreError::InvalidArgument("not a hotword node"));
        }
        dev.set_hotword_model(model)
    }

    // ---- test devices ----

    pub fn add_test_dev(&mut self, dev_type: TestDevType) -> CoreResult<u32> {
        match dev_type {
            TestDevType::Hotword => {
                // add_device re-assigns the same index it was named with.
                let dev = TestDevice::new_hotword(self.next_dev_idx);
                self.add_device(Box::new(dev))
            }
        }
    }

    pub fn test_dev_command(
        &mut self,
        dev_idx: u32,
        command: TestDevCommand,
        data: &[u8],
    ) -> CoreResult<()> {
        let handle = self
            .find_dev(dev_idx)
            .ok_or(CoreError::NoSuchDevice(dev_idx))?;
        let mut dev = handle.lock().unwrap();
        dev.test_command(command, data)
    }

    // ---- dsp ----

    pub fn reload_dsp(&mut self, config: sonara_dsp::DspConfig) {
        self.dsp_config = config;
        for dir in 0..2 {
            for handle in &self.devs[dir] {
                let mut dev = handle.lock().unwrap();
                if device::is_open(dev.as_ref()) {
                    device::attach_dsp(dev.as_mut(), &self.dsp_config);
                }
            }
        }
        info!("dsp configuration reloaded");
    }

    pub fn dump_dsp_info(&self) {
        for dir in 0..2 {
            for handle in &self.devs[dir] {
                let dev = handle.lock().unwrap();
                let common = dev.common();
                match &common.dsp {
                    Some(dsp) => info!(
                        dev = %common.info.name,
                        pipeline = ?dsp.describe(),
                        "dsp pipeline"
                    ),
                    None => debug!(dev = %common.info.name, "no dsp pipeline"),
                }
            }
        }
    }

    // ---- observer reactions ----

    fn on_output_volume_changed(&mut self, volume: u32) {
        for handle in &self.devs[0] {
            let mut dev = handle.lock().unwrap();
            if dev.has_hw_volume() && device::is_open(dev.as_ref()) {
                let adjusted = dev
                    .common()
                    .active_node()
                    .map(|n| n.adjust_volume(volume))
                    .unwrap_or(volume);
                dev.set_volume(adjusted);
            }
        }
    }

    fn on_output_mute_changed(&mut self, should_mute: bool) {
        let volume = self.system_shared.volume();
        for handle in &self.devs[0] {
            let (dev_idx, should_ramp) = {
                let dev = handle.lock().unwrap();
                let idx = dev.common().info.idx;
                let ramps = dev.common().is_enabled
                    && dev.common().ramp.is_some()
                    && dev.common().state == device::DeviceState::NormalRun
                    && !device::is_zero_volume(dev.as_ref(), volume);
                (idx, ramps)
            };
            if should_ramp {
                // The ramp runs on the audio thread; hardware mute follows
                // from its completion (or start, for unmute).
                let request = if should_mute {
                    RampRequest::DownMute
                } else {
                    RampRequest::UpUnmute
                };
                if let Err(e) = self.audio_thread.dev_start_ramp(dev_idx, request) {
                    warn!(dev_idx, "start ramp: {e}");
                }
            } else {
                let mut dev = handle.lock().unwrap();
                device::apply_mute(dev.as_mut(), should_mute);
            }
        }
    }

    fn on_capture_gain_changed(&mut self, gain: i32) {
        for handle in &self.devs[1] {
            let mut dev = handle.lock().unwrap();
            if device::is_open(dev.as_ref()) {
                dev.set_capture_gain(gain);
            }
        }
    }

    fn on_capture_mute_changed(&mut self, muted: bool) {
        for handle in &self.devs[1] {
            let mut dev = handle.lock().unwrap();
            if device::is_open(dev.as_ref()) {
                dev.set_capture_mute(muted);
            }
        }
    }

    fn on_suspend_changed(&mut self, suspended: bool) {
        if suspended {
            self.suspend_devs();
        } else {
            self.resume_devs();
        }
    }

    fn suspend_devs(&mut self) {
        info!("suspending audio");
        let streams: Vec<Arc<Mutex<Stream>>> =
            self.stream_list.iter().map(Arc::clone).collect();
        for stream in streams {
            let (is_pinned, pinned_idx) = {
                let s = stream.lock().unwrap();
                (s.is_pinned, s.pinned_dev_idx)
            };
            if is_pinned {
                if let Some(handle) = self.find_dev(pinned_idx) {
                    let _ = self
                        .audio_thread
                        .disconnect_stream(Arc::clone(&stream), Some(pinned_idx));
                    if !self.is_enabled(pinned_idx) {
                        // Pinned streams hold their device open; suspend
                        // overrides that.
                        if let Err(e) = self.audio_thread.rm_open_dev(pinned_idx) {
                            debug!("suspend rm: {e}");
                        }
                        let mut dev = handle.lock().unwrap();
                        let _ = device::close(dev.as_mut());
                    }
                }
            } else {
                let _ = self.audio_thread.disconnect_stream(stream, None);
            }
        }
        self.suspended = true;

        for dir in 0..2 {
            let enabled: Vec<u32> = self.enabled[dir].iter().map(|e| e.dev_idx).collect();
            for dev_idx in enabled {
                if let Some(handle) = self.find_dev(dev_idx) {
                    // Suspend closes everything, pinned streams included.
                    if device::is_open(handle.lock().unwrap().as_ref()) {
                        if let Err(e) = self.audio_thread.rm_open_dev(dev_idx) {
                            debug!("suspend rm: {e}");
                        }
                        let mut dev = handle.lock().unwrap();
                        dev.common_mut().idle_timeout = None;
                        let _ = device::close(dev.as_mut());
                    }
                }
            }
        }
    }

    fn resume_devs(&mut self) {
        info!("resuming audio");
        self.suspended = false;
        let streams: Vec<Arc<Mutex<Stream>>> =
            self.stream_list.iter().map(Arc::clone).collect();
        for stream in streams {
            if let Err(e) = self.stream_added(&stream) {
                warn!("resume reattach failed: {e}");
            }
        }
    }

    // ---- reset / mute finalize (from the audio thread) ----

    /// Disable-then-enable cycle after a severe device failure. The pending
    /// flag on the device collapses duplicate requests.
    pub fn reset_device(&mut self, dev_idx: u32) {
        info!(dev_idx, "resetting device");
        let was_enabled = self.is_enabled(dev_idx);
        self.disable_dev(dev_idx);
        if was_enabled {
            if let Err(e) = self.enable_dev(dev_idx) {
                warn!(dev_idx, "re-enable after reset failed: {e}");
            }
        }
    }

    /// Applies the system mute state to one device's hardware, after its
    /// mute ramp completed (or an unmute ramp started).
    pub fn set_device_mute_state(&mut self, dev_idx: u32) {
        let muted = self.system_shared.muted();
        if let Some(handle) = self.find_dev(dev_idx) {
            let mut dev = handle.lock().unwrap();
            device::apply_mute(dev.as_mut(), muted);
        }
    }

    // ---- loopback hook management ----

    /// Points both loopback taps at the first enabled output device.
    fn refresh_loopback_hooks(&mut self) {
        let first_out = self.first_enabled_output();
        // Clear stale hooks everywhere first.
        for handle in &self.devs[0] {
            let mut dev = handle.lock().unwrap();
            dev.common_mut().pre_dsp_hook = None;
            dev.common_mut().post_dsp_hook = None;
        }
        for (loop_idx, point, tap) in &self.loopback_taps {
            let loop_open = self
                .find_dev(*loop_idx)
                .map(|h| device::is_open(h.lock().unwrap().as_ref()))
                .unwrap_or(false);
            tap.lock().unwrap().hook_attached = false;
            if !loop_open {
                continue;
            }
            if let Some(out) = &first_out {
                let mut dev = out.lock().unwrap();
                match point {
                    LoopbackPoint::PostMixPreDsp => {
                        dev.common_mut().pre_dsp_hook = Some(Arc::clone(tap));
                    }
                    LoopbackPoint::PostDsp => {
                        dev.common_mut().post_dsp_hook = Some(Arc::clone(tap));
                    }
                }
                tap.lock().unwrap().hook_attached = true;
            }
        }
    }

    // ---- exported state mirror ----

    pub fn update_device_list(&mut self) {
        let enabled_idxs: [Vec<u32>; 2] = [
            self.enabled[0].iter().map(|e| e.dev_idx).collect(),
            self.enabled[1].iter().map(|e| e.dev_idx).collect(),
        ];
        let mut system = self.system.borrow_mut();
        let state = system.update_begin();

        for dir in 0..2 {
            let mut dev_count = 0usize;
            let mut node_count = 0usize;
            for handle in &self.devs[dir] {
                let dev = handle.lock().unwrap();
                let common = dev.common();
                if dev_count < crate::system_state::MAX_IODEVS {
                    let row = if dir == 0 {
                        &mut state.output_devs[dev_count]
                    } else {
                        &mut state.input_devs[dev_count]
                    };
                    row.idx = common.info.idx;
                    copy_name(&mut row.name, &common.info.name);
                    dev_count += 1;
                }
                for node in &common.nodes {
                    if node_count >= crate::system_state::MAX_IONODES {
                        break;
                    }
                    let row = if dir == 0 {
                        &mut state.output_nodes[node_count]
                    } else {
                        &mut state.input_nodes[node_count]
                    };
                    row.iodev_idx = common.info.idx;
                    row.ionode_idx = node.idx;
                    row.plugged = node.plugged as u32;
                    row.active = (enabled_idxs[dir].contains(&common.info.idx)
                        && common.active_node == Some(node.idx))
                        as u32;
                    row.volume = node.volume;
                    row.capture_gain = node.capture_gain;
                    row.left_right_swapped = node.left_right_swapped as u32;
                    row.stable_id = node.stable_id;
                    copy_name(&mut row.type_name, node.type_name());
                    copy_name(&mut row.name, &node.name);
                    copy_name(&mut row.active_hotword_model, &node.active_hotword_model);
                    node_count += 1;
                }
            }
            if dir == 0 {
                state.num_output_devs = dev_count as u32;
                state.num_output_nodes = node_count as u32;
            } else {
                state.num_input_devs = dev_count as u32;
                state.num_input_nodes = node_count as u32;
            }
        }
        system.update_complete();
    }
}

fn wrap(dev: impl Device + 'static) -> DeviceHandle {
    Arc::new(Mutex::new(Box::new(dev) as Box<dyn Device>))
}

/// Subscribes the device list to the system-state events it reacts to.
/// Events the list emits itself are ignored here, so dispatch never
/// re-enters a borrowed list.
struct IoDevListObserver {
    list: Weak<RefCell<IoDevList>>,
}

impl Observer for IoDevListObserver {
    fn notify(&self, event: &ObserverEvent) {
        let Some(list) = self.list.upgrade() else {
            return;
        };
        match event {
            ObserverEvent::OutputVolumeChanged { volume } => {
                list.borrow_mut().on_output_volume_changed(*volume as u32);
            }
            ObserverEvent::OutputMuteChanged {
                muted, user_muted, ..
            } => {
                list.borrow_mut()
                    .on_output_mute_changed(*muted || *user_muted);
            }
            ObserverEvent::CaptureGainChanged { gain } => {
                list.borrow_mut().on_capture_gain_changed(*gain);
            }
            ObserverEvent::CaptureMuteChanged { muted, .. } => {
                list.borrow_mut().on_capture_mute_changed(*muted);
            }
            ObserverEvent::SuspendChanged { suspended } => {
                list.borrow_mut().on_suspend_changed(*suspended);
            }
            _ => {}
        }
    }
}


#[cfg(test)]
pub(crate) use tests::test_support;
