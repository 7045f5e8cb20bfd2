//! Per-device linear gain ramps
//!
//! Jumping gain between 0 and 1 at mute/unmute or on the first sample of a
//! new stream produces an audible click. A ramp walks the scaler linearly
//! over a fixed number of frames instead. The audio thread samples the ramp
//! once per cycle, applies the per-frame increment while scaling the output
//! buffer, then reports how many frames it emitted.

use std::time::Duration;

use crate::unix::duration_to_frames;

/// Why a ramp is being started; selects direction and duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampRequest {
    /// Mute -> unmute. The caller flips device unmute state right after the
    /// ramp starts so the first audible samples are near zero.
    UpUnmute,
    /// Unmute -> mute. Hardware mute is applied once the ramp completes.
    DownMute,
    /// First samples of a new stream on a silent device.
    UpStartPlayback,
}

impl RampRequest {
    pub fn duration(self) -> Duration {
        match self {
            RampRequest::UpUnmute => Duration::from_millis(500),
            RampRequest::DownMute => Duration::from_millis(100),
            RampRequest::UpStartPlayback => Duration::from_millis(10),
        }
    }

    pub fn is_up(self) -> bool {
        !matches!(self, RampRequest::DownMute)
    }
}

/// What the engine does once a ramp finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampCompletion {
    /// Ask the main thread to apply the device's hardware mute state.
    FinalizeMute,
}

/// The action the mixer should take this cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RampAction {
    /// No ramp active; apply plain volume handling.
    None,
    /// Scale sample n by `scaler + n * increment`.
    Partial { scaler: f32, increment: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Up,
    Down,
}

/// Linear gain envelope for one output device.
#[derive(Debug)]
pub struct Ramp {
    state: State,
    ramped_frames: u64,
    duration_frames: u64,
    increment: f32,
    start_scaler: f32,
    completion: Option<RampCompletion>,
}

impl Default for Ramp {
    fn default() -> Self {
        Self::new()
    }
}

impl Ramp {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            ramped_frames: 0,
            duration_frames: 0,
            increment: 0.0,
            start_scaler: 1.0,
            completion: None,
        }
    }

    /// Cancels any active ramp.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.ramped_frames = 0;
        self.duration_frames = 0;
        self.increment = 0.0;
        self.start_scaler = 1.0;
        self.completion = None;
    }

    /// Starts ramping toward 1 (up) or 0 (down) over `duration_frames`.
    ///
    /// A ramp interrupting another picks up from the current scaler so the
    /// gain curve stays continuous.
    pub fn start(
        &mut self,
        up: bool,
        duration_frames: u64,
        completion: Option<RampCompletion>,
    ) {
        let duration_frames = duration_frames.max(1);
        let current = self.current_action();

        if up {
            self.start_scaler = match current {
                RampAction::None => 0.0,
                RampAction::Partial { scaler, .. } => scaler,
            };
            self.increment = (1.0 - self.start_scaler) / duration_frames as f32;
            self.state = State::Up;
        } else {
            self.start_scaler = match current {
                RampAction::None => 1.0,
                RampAction::Partial { scaler, .. } => scaler,
            };
            self.increment = -self.start_scaler / duration_frames as f32;
            self.state = State::Down;
        }
        self.ramped_frames = 0;
        self.duration_frames = duration_frames;
        self.completion = completion;
    }

    /// Starts a ramp for `request` at the given device rate.
    pub fn start_for_request(&mut self, request: RampRequest, frame_rate: u32) {
        let frames = duration_to_frames(request.duration(), frame_rate);
        let completion = match request {
            RampRequest::DownMute => Some(RampCompletion::FinalizeMute),
            _ => None,
        };
        self.start(request.is_up(), frames, completion);
    }

    /// The scaling to apply to the next buffer.
    pub fn current_action(&self) -> RampAction {
        match self.state {
            State::Idle => RampAction::None,
            State::Up | State::Down => RampAction::Partial {
                scaler: self.start_scaler + self.ramped_frames as f32 * self.increment,
                increment: self.increment,
            },
        }
    }

    pub fn is_active(&self) -> bool {
        self.state != State::Idle
    }

    /// Advances the ramp by frames just emitted. Returns the completion
    /// action exactly once, when the ramp finishes.
    pub fn update_ramped_frames(&mut self, frames: u64) -> Option<RampCompletion> {
        if self.state == State::Idle {
            return None;
        }
        self.ramped_frames += frames;
        if self.ramped_frames >= self.duration_frames {
            self.state = State::Idle;
            return self.completion.take();
        }
        None
    }
}
