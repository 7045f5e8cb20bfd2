//! System-wide audio state
//!
//! Volume, mute and gain state owned by the main thread, mirrored two ways:
//! a lock-free [`SystemShared`] the audio thread samples once per cycle,
//! and a read-only shm snapshot exported to every client at connect. Shm
//! writers bracket updates with an `update_count` parity (odd while a write
//! is in flight); readers retry until they see a stable even count.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use memfd::{FileSeal, MemfdOptions};
use tracing::debug;

use sonara_proto::Direction;

use crate::error::{CoreError, CoreResult};
use crate::observer::{ObserverEvent, ObserverRegistry};

pub const MAX_IODEVS: usize = 20;
pub const MAX_IONODES: usize = 40;
pub const DEBUG_INFO_SIZE: usize = 8192;

const NAME_LEN: usize = 64;
const TYPE_LEN: usize = 32;
const HOTWORD_LEN: usize = 16;

/// State the audio thread reads without locks.
#[derive(Debug)]
pub struct SystemShared {
    volume: AtomicU32,
    muted: AtomicU32,
    user_muted: AtomicU32,
    capture_gain: AtomicI32,
    capture_muted: AtomicU32,
}

impl Default for SystemShared {
    fn default() -> Self {
        Self {
            volume: AtomicU32::new(100),
            muted: AtomicU32::new(0),
            user_muted: AtomicU32::new(0),
            capture_gain: AtomicI32::new(0),
            capture_muted: AtomicU32::new(0),
        }
    }
}

impl SystemShared {
    pub fn volume(&self) -> u32 {
        self.volume.load(Ordering::Relaxed)
    }

    /// Effective output mute: system or user initiated.
    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed) != 0 || self.user_muted.load(Ordering::Relaxed) != 0
    }

    pub fn capture_gain(&self) -> i32 {
        self.capture_gain.load(Ordering::Relaxed)
    }

    pub fn capture_muted(&self) -> bool {
        self.capture_muted.load(Ordering::Relaxed) != 0
    }
}

/// One device row in the exported snapshot.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExportedDevice {
    pub idx: u32,
    pub name: [u8; NAME_LEN],
}

/// One node row in the exported snapshot.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExportedNode {
    pub iodev_idx: u32,
    pub ionode_idx: u32,
    pub plugged: u32,
    pub active: u32,
    pub volume: u32,
    pub capture_gain: i32,
    pub left_right_swapped: u32,
    pub stable_id: u32,
    pub type_name: [u8; TYPE_LEN],
    pub name: [u8; NAME_LEN],
    pub active_hotword_model: [u8; HOTWORD_LEN],
}

/// Layout of the read-only state shm handed to clients.
#[repr(C)]
pub struct ExportedState {
    /// Odd while the server is writing; readers retry on change/odd.
    pub update_count: AtomicU32,
    pub volume: u32,
    pub muted: i32,
    pub user_muted: i32,
    pub mute_locked: i32,
    pub capture_gain: i32,
    pub capture_muted: i32,
    pub capture_mute_locked: i32,
    pub suspended: i32,
    pub num_active_output_streams: u32,
    pub num_active_input_streams: u32,
    pub num_output_devs: u32,
    pub num_input_devs: u32,
    pub num_output_nodes: u32,
    pub num_input_nodes: u32,
    pub output_devs: [ExportedDevice; MAX_IODEVS],
    pub input_devs: [ExportedDevice; MAX_IODEVS],
    pub output_nodes: [ExportedNode; MAX_IONODES],
    pub input_nodes: [ExportedNode; MAX_IONODES],
    pub debug_info_len: u32,
    pub debug_info: [u8; DEBUG_INFO_SIZE],
}

pub fn copy_name<const N: usize>(dst: &mut [u8; N], src: &str) {
    let bytes = src.as_bytes();
    let n = bytes.len().min(N - 1);
    dst[..n].copy_from_slice(&bytes[..n]);
    dst[n..].fill(0);
}

struct StateShm {
    file: std::fs::File,
    map: *mut ExportedState,
    map_len: usize,
}

unsafe impl Send for StateShm {}

impl StateShm {
    fn create() -> CoreResult<Self> {
        let map_len = std::mem::size_of::<ExportedState>();
        let memfd = MemfdOptions::default()
            .allow_sealing(true)
            .create("sonara-state")
            .map_err(|_| CoreError::ResourceExhausted("state memfd"))?;
        memfd
            .as_file()
            .set_len(map_len as u64)
            .map_err(CoreError::Io)?;
        let _ = memfd.add_seals(&[FileSeal::SealShrink, FileSeal::SealGrow]);
        let file = memfd.into_file();

        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(CoreError::ResourceExhausted("state mmap"));
        }
        Ok(Self {
            file,
            map: map as *mut ExportedState,
            map_len,
        })
    }

    fn state(&self) -> &ExportedState {
        unsafe { &*self.map }
    }

    #[allow(clippy::mut_from_ref)]
    fn state_mut(&self) -> &mut ExportedState {
        unsafe { &mut *self.map }
    }
}

impl Drop for StateShm {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map as *mut libc::c_void, self.map_len);
        }
    }
}

/// The authoritative system audio state, owned by the main thread.
pub struct SystemState {
    shared: Arc<SystemShared>,
    shm: StateShm,
    /// Read-only reopen of the state shm, the fd clients receive.
    shm_ro: std::fs::File,

    volume: u32,
    muted: bool,
    user_muted: bool,
    mute_locked: bool,
    capture_gain: i32,
    capture_muted: bool,
    capture_mute_locked: bool,
    suspended: bool,
    num_streams: [u32; 2],
    update_in_flight: bool,
}

impl SystemState {
    pub fn new() -> CoreResult<Self> {
        let shm = StateShm::create()?;
        // Reopening through procfs yields a descriptor without write
        // access; sealing is not an option while our own writable mapping
        // exists.
        let shm_ro = std::fs::OpenOptions::new()
            .read(true)
            .open(format!("/proc/self/fd/{}", shm.file.as_raw_fd()))
            .map_err(CoreError::Io)?;
        let mut state = Self {
            shared: Arc::new(SystemShared::default()),
            shm,
            shm_ro,
            volume: 100,
            muted: false,
            user_muted: false,
            mute_locked: false,
            capture_gain: 0,
            capture_muted: false,
            capture_mute_locked: false,
            suspended: false,
            num_streams: [0; 2],
            update_in_flight: false,
        };
        state.shared.volume.store(100, Ordering::Relaxed);
        let exported = state.update_begin();
        exported.volume = 100;
        state.update_complete();
        Ok(state)
    }

    /// Handle for the audio thread's per-cycle reads.
    pub fn shared(&self) -> Arc<SystemShared> {
        Arc::clone(&self.shared)
    }

    /// The fd passed read-only to clients in CLIENT_CONNECTED.
    pub fn shm_fd(&self) -> RawFd {
        self.shm_ro.as_raw_fd()
    }

    // ---- parity-bracketed shm updates ----

    /// Opens an shm update; the returned state must be completed with
    /// [`update_complete`](Self::update_complete).
    pub fn update_begin(&mut self) -> &mut ExportedState {
        let state = self.shm.state_mut();
        if !self.update_in_flight {
            state
                .update_count
                .fetch_add(1, Ordering::Release); // now odd
            self.update_in_flight = true;
        }
        state
    }

    pub fn update_complete(&mut self) {
        if self.update_in_flight {
            self.shm
                .state_mut()
                .update_count
                .fetch_add(1, Ordering::Release); // even again
            self.update_in_flight = false;
        }
    }

    fn publish_scalars(&mut self) {
        let volume = self.volume;
        let muted = self.muted;
        let user_muted = self.user_muted;
        let mute_locked = self.mute_locked;
        let capture_gain = self.capture_gain;
        let capture_muted = self.capture_muted;
        let capture_mute_locked = self.capture_mute_locked;
        let suspended = self.suspended;
        let num_streams = self.num_streams;

        let state = self.update_begin();
        state.volume = volume;
        state.muted = muted as i32;
        state.user_muted = user_muted as i32;
        state.mute_locked = mute_locked as i32;
        state.capture_gain = capture_gain;
        state.capture_muted = capture_muted as i32;
        state.capture_mute_locked = capture_mute_locked as i32;
        state.suspended = suspended as i32;
        state.num_active_output_streams = num_streams[0];
        state.num_active_input_streams = num_streams[1];
        self.update_complete();
    }

    // ---- setters, each emitting its observer event ----

    pub fn set_volume(&mut self, volume: u32, observers: &ObserverRegistry) {
        self.volume = volume.min(100);
        self.shared.volume.store(self.volume, Ordering::Relaxed);
        self.publish_scalars();
        observers.notify(&ObserverEvent::OutputVolumeChanged {
            volume: self.volume as i32,
        });
    }

    pub fn volume(&self) -> u32 {
        self.volume
    }

    fn notify_mute(&self, observers: &ObserverRegistry) {
        observers.notify(&ObserverEvent::OutputMuteChanged {
            muted: self.muted,
            user_muted: self.user_muted,
            mute_locked: self.mute_locked,
        });
    }

    pub fn set_mute(&mut self, mute: bool, observers: &ObserverRegistry) {
        if self.mute_locked {
            debug!("mute change ignored, mute is locked");
            return;
        }
        self.muted = mute;
        self.shared.muted.store(mute as u32, Ordering::Relaxed);
        self.publish_scalars();
        self.notify_mute(observers);
    }

    pub fn set_user_mute(&mut self, mute: bool, observers: &ObserverRegistry) {
        self.user_muted = mute;
        self.shared.user_muted.store(mute as u32, Ordering::Relaxed);
        self.publish_scalars();
        self.notify_mute(observers);
    }

    pub fn set_mute_locked(&mut self, locked: bool, observers: &ObserverRegistry) {
        self.mute_locked = locked;
        self.publish_scalars();
        self.notify_mute(observers);
    }

    pub fn muted(&self) -> bool {
        self.muted || self.user_muted
    }

    pub fn set_capture_gain(&mut self, gain: i32, observers: &ObserverRegistry) {
        self.capture_gain = gain;
        self.shared.capture_gain.store(gain, Ordering::Relaxed);
        self.publish_scalars();
        observers.notify(&ObserverEvent::CaptureGainChanged { gain });
    }

    pub fn capture_gain(&self) -> i32 {
        self.capture_gain
    }

    pub fn set_capture_mute(&mut self, mute: bool, observers: &ObserverRegistry) {
        if self.capture_mute_locked {
            debug!("capture mute change ignored, mute is locked");
            return;
        }
        self.capture_muted = mute;
        self.shared
            .capture_muted
            .store(mute as u32, Ordering::Relaxed);
        self.publish_scalars();
        observers.notify(&ObserverEvent::CaptureMuteChanged {
            muted: mute,
            mute_locked: self.capture_mute_locked,
        });
    }

    pub fn set_capture_mute_locked(&mut self, locked: bool, observers: &ObserverRegistry) {
        self.capture_mute_locked = locked;
        self.publish_scalars();
        observers.notify(&ObserverEvent::CaptureMuteChanged {
            muted: self.capture_muted,
            mute_locked: locked,
        });
    }

    pub fn capture_muted(&self) -> bool {
        self.capture_muted
    }

    pub fn set_suspended(&mut self, suspended: bool, observers: &ObserverRegistry) {
        if self.suspended == suspended {
            return;
        }
        self.suspended = suspended;
        self.publish_scalars();
        observers.notify(&ObserverEvent::SuspendChanged { suspended });
    }

    pub fn suspended(&self) -> bool {
        self.suspended
    }

    pub fn stream_added(&mut self, direction: Direction, observers: &ObserverRegistry) {
        let idx = direction.hw_index();
        self.num_streams[idx] += 1;
        self.publish_scalars();
        observers.notify(&ObserverEvent::NumActiveStreamsChanged {
            direction: direction.hw_direction(),
            num_active_streams: self.num_streams[idx],
        });
    }

    pub fn stream_removed(&mut self, direction: Direction, observers: &ObserverRegistry) {
        let idx = direction.hw_index();
        self.num_streams[idx] = self.num_streams[idx].saturating_sub(1);
        self.publish_scalars();
        observers.notify(&ObserverEvent::NumActiveStreamsChanged {
            direction: direction.hw_direction(),
            num_active_streams: self.num_streams[idx],
        });
    }

    pub fn num_streams(&self, direction: Direction) -> u32 {
        self.num_streams[direction.hw_index()]
    }

    /// Stores the audio thread's debug dump for clients to read.
    pub fn set_debug_info(&mut self, text: &str) {
        let bytes = text.as_bytes();
        let n = bytes.len().min(DEBUG_INFO_SIZE);
        let state = self.update_begin();
        state.debug_info[..n].copy_from_slice(&bytes[..n]);
        state.debug_info_len = n as u32;
        self.update_complete();
    }

    /// Read-side view, used by tests standing in for a client.
    pub fn snapshot(&self) -> &ExportedState {
        self.shm.state()
    }
}
