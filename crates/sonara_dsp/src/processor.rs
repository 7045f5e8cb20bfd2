//! Audio Processor Trait and Pipeline
//!
//! Defines the interface for chainable audio processors and the pipeline
//! container the engine attaches to each open device.

use crate::config::StageConfig;
use crate::eq::Equalizer;
use crate::error::DspError;

/// Context passed to processors containing stream metadata
#[derive(Debug, Clone, Copy)]
pub struct ProcessContext {
    pub sample_rate: f32,
    pub channels: usize,
}

impl ProcessContext {
    pub fn new(sample_rate: f32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

/// Trait for audio processors in the DSP chain
///
/// # Real-time Safety Contract
///
/// Implementors MUST follow these rules in `process()`:
/// - NO heap allocations (no Vec::push, no Box::new, no String)
/// - NO syscalls (no file I/O, no network, no mutex locks)
/// - NO unbounded loops
pub trait AudioProcessor: Send {
    /// Process an interleaved buffer in-place.
    fn process(&mut self, buffer: &mut [f32], context: &ProcessContext);

    /// Reset internal state (delay lines, envelopes, etc.)
    fn reset(&mut self);

    /// Human-readable name for debugging.
    fn name(&self) -> &'static str;

    /// Frames of latency this processor introduces.
    fn delay_frames(&self) -> usize {
        0
    }
}

impl AudioProcessor for Equalizer {
    fn process(&mut self, buffer: &mut [f32], _context: &ProcessContext) {
        self.process_interleaved(buffer);
    }

    fn reset(&mut self) {
        Equalizer::reset(self);
    }

    fn name(&self) -> &'static str {
        "equalizer"
    }
}

/// A chain of processors applied sequentially to one device's buffers.
pub struct Pipeline {
    processors: Vec<Box<dyn AudioProcessor>>,
    context: ProcessContext,
}

impl Pipeline {
    /// Builds the pipeline for one device from a stage config.
    pub fn from_stage(
        stage: &StageConfig,
        sample_rate: f32,
        channels: usize,
    ) -> Result<Self, DspError> {
        let mut processors: Vec<Box<dyn AudioProcessor>> = Vec::new();
        if let Some(eq) = &stage.eq {
            processors.push(Box::new(Equalizer::new(eq, sample_rate, channels)?));
        }
        Ok(Self {
            processors,
            context: ProcessContext::new(sample_rate, channels),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    /// Process buffer through all processors.
    #[inline]
    pub fn process(&mut self, buffer: &mut [f32]) {
        for processor in &mut self.processors {
            processor.process(buffer, &self.context);
        }
    }

    /// Total latency of the chain in frames.
    pub fn delay_frames(&self) -> usize {
        self.processors.iter().map(|p| p.delay_frames()).sum()
    }

    /// Reset all processors.
    pub fn reset(&mut self) {
        for processor in &mut self.processors {
            processor.reset();
        }
    }

    /// Names of the processors in order, for debug dumps.
    pub fn describe(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }
}
