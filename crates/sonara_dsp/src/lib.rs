//! Sonara DSP - processing applied to device buffers
//!
//! The engine treats this crate as a pure in-place transform: a [`Pipeline`]
//! is built per open device from a JSON config and applied to interleaved
//! f32 frames between mixing and the hardware buffer commit. Processors
//! follow a strict no-allocation rule once built.

mod config;
mod eq;
mod error;
mod processor;

pub use config::{BandSetting, DspConfig, EqSettings, StageConfig};
pub use eq::{BandKind, Equalizer};
pub use error::DspError;
pub use processor::{AudioProcessor, Pipeline, ProcessContext};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        let _config = DspConfig::default();
        let _eq = Equalizer::flat(48000.0, 2);
    }
}
