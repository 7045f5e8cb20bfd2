//! Device sample-rate estimation
//!
//! Hardware clocks drift from their nominal rate; scheduling against the
//! nominal value slowly starves or floods the device. The estimator folds
//! (time, frames-consumed) observations from every device callback into a
//! least-squares slope over a sliding window, then smooths consecutive
//! window results with an EMA.

use std::time::{Duration, Instant};

/// Default observation window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(20);

/// Default EMA weight given to the newest window's slope.
pub const DEFAULT_SMOOTH_FACTOR: f64 = 0.9;

#[derive(Debug, Default, Clone, Copy)]
struct LeastSquares {
    num_samples: u32,
    sum_x: f64,
    sum_y: f64,
    sum_xy: f64,
    sum_x2: f64,
}

impl LeastSquares {
    fn add(&mut self, x: f64, y: f64) {
        self.num_samples += 1;
        self.sum_x += x;
        self.sum_y += y;
        self.sum_xy += x * y;
        self.sum_x2 += x * x;
    }

    fn slope(&self) -> Option<f64> {
        let n = self.num_samples as f64;
        let denom = n * self.sum_x2 - self.sum_x * self.sum_x;
        if self.num_samples < 2 || denom.abs() < f64::EPSILON {
            return None;
        }
        Some((n * self.sum_xy - self.sum_x * self.sum_y) / denom)
    }
}

/// Estimates the true frame rate of an open device.
#[derive(Debug)]
pub struct RateEstimator {
    window: Duration,
    smooth_factor: f64,
    estimated_rate: f64,

    lsq: LeastSquares,
    window_start: Option<Instant>,
    /// Net frames moved through the device since the last check; positive
    /// for playback writes, negative for capture reads.
    frames_since_check: i64,
    /// Cumulative frames the hardware consumed within this window.
    consumed: f64,
    last_level: i64,
}

impl RateEstimator {
    pub fn new(nominal_rate: u32, window: Duration, smooth_factor: f64) -> Self {
        Self {
            window,
            smooth_factor,
            estimated_rate: nominal_rate as f64,
            lsq: LeastSquares::default(),
            window_start: None,
            frames_since_check: 0,
            consumed: 0.0,
            last_level: 0,
        }
    }

    pub fn with_defaults(nominal_rate: u32) -> Self {
        Self::new(nominal_rate, DEFAULT_WINDOW, DEFAULT_SMOOTH_FACTOR)
    }

    /// Restarts estimation at a new nominal rate (device reopen).
    pub fn reset_rate(&mut self, nominal_rate: u32) {
        self.estimated_rate = nominal_rate as f64;
        self.lsq = LeastSquares::default();
        self.window_start = None;
        self.frames_since_check = 0;
        self.consumed = 0.0;
        self.last_level = 0;
    }

    /// Records frames moved to (+) or from (-) the device buffer.
    pub fn add_frames(&mut self, frames: i64) {
        self.frames_since_check += frames;
    }

    /// Folds in the current hardware level. Returns true when the window
    /// closed and the estimate was updated.
    pub fn check(&mut self, level: i64, now: Instant) -> bool {
        let start = match self.window_start {
            Some(start) => start,
            None => {
                self.window_start = Some(now);
                self.last_level = level;
                self.frames_since_check = 0;
                return false;
            }
        };

        // Frames the hardware actually consumed since the last check:
        // what we moved, minus what is still sitting in the buffer.
        let consumed_now = self.frames_since_check - (level - self.last_level);
        self.consumed += consumed_now as f64;
        self.frames_since_check = 0;
        self.last_level = level;

        let elapsed = now.duration_since(start);
        self.lsq.add(elapsed.as_secs_f64(), self.consumed);

        if elapsed < self.window {
            return false;
        }

        if let Some(slope) = self.lsq.slope() {
            let observed = slope.abs();
            if observed > 0.0 {
                self.estimated_rate = self.smooth_factor * observed
                    + (1.0 - self.smooth_factor) * self.estimated_rate;
            }
        }
        self.lsq = LeastSquares::default();
        self.window_start = Some(now);
        self.consumed = 0.0;
        true
    }

    pub fn get_rate(&self) -> f64 {
        self.estimated_rate
    }
}
