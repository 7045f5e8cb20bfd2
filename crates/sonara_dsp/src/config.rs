//! DSP pipeline configuration
//!
//! Loaded from the JSON file named by `--dsp-config`; one stage per
//! direction. A missing stage means no processing for that direction.

use serde::{Deserialize, Serialize};

use crate::eq::BandKind;
use crate::error::DspError;

/// Top-level DSP configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DspConfig {
    #[serde(default)]
    pub playback: Option<StageConfig>,
    #[serde(default)]
    pub capture: Option<StageConfig>,
}

impl DspConfig {
    pub fn from_json(text: &str) -> Result<Self, DspError> {
        Ok(serde_json::from_str(text)?)
    }

    /// The stage for the given purpose, if configured.
    pub fn stage(&self, playback: bool) -> Option<&StageConfig> {
        if playback {
            self.playback.as_ref()
        } else {
            self.capture.as_ref()
        }
    }
}

/// Processors for one direction, applied in field order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default)]
    pub eq: Option<EqSettings>,
}

/// Equalizer settings: an arbitrary list of filter bands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EqSettings {
    pub bands: Vec<BandSetting>,
}

/// One filter band.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BandSetting {
    pub frequency: f32,
    pub gain_db: f32,
    #[serde(default = "default_q")]
    pub q: f32,
    #[serde(default = "default_kind")]
    pub kind: BandKind,
}

fn default_q() -> f32 {
    std::f32::consts::FRAC_1_SQRT_2
}

fn default_kind() -> BandKind {
    BandKind::Peaking
}
