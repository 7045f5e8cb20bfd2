//! DSP Error Types

use thiserror::Error;

/// Errors that can occur while building or reconfiguring a pipeline
#[derive(Error, Debug)]
pub enum DspError {
    #[error("Invalid filter coefficients for frequency {frequency}Hz at sample rate {sample_rate}Hz")]
    InvalidCoefficients { frequency: f32, sample_rate: f32 },

    #[error("Sample rate must be positive, got {0}")]
    InvalidSampleRate(f32),

    #[error("Channel count must be 1..=8, got {0}")]
    InvalidChannelCount(usize),

    #[error("Failed to parse DSP config: {0}")]
    ConfigParse(#[from] serde_json::Error),
}
