//! Multi-channel parametric equalizer
//!
//! A cascade of BiQuad filters per channel, built from [`EqSettings`].
//! Based on the RBJ (Robert Bristow-Johnson) Audio EQ Cookbook.

use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type};
use serde::{Deserialize, Serialize};

use crate::config::{BandSetting, EqSettings};
use crate::error::DspError;

/// Filter shape of one band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandKind {
    LowShelf,
    Peaking,
    HighShelf,
}

fn db_to_amplitude(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

fn band_coefficients(
    band: &BandSetting,
    sample_rate: f32,
) -> Result<Coefficients<f32>, DspError> {
    let freq = band.frequency.hz();
    let fs = sample_rate.hz();
    let amp = db_to_amplitude(band.gain_db);

    let kind = match band.kind {
        BandKind::LowShelf => Type::LowShelf(amp),
        BandKind::Peaking => Type::PeakingEQ(amp),
        BandKind::HighShelf => Type::HighShelf(amp),
    };

    Coefficients::<f32>::from_params(kind, fs, freq, band.q).map_err(|_| {
        DspError::InvalidCoefficients {
            frequency: band.frequency,
            sample_rate,
        }
    })
}

/// The equalizer processor: one filter cascade per channel, interleaved
/// processing, no allocation after construction.
pub struct Equalizer {
    // filters[channel][band]; DirectForm2Transposed for numerical stability
    filters: Vec<Vec<DirectForm2Transposed<f32>>>,
    sample_rate: f32,
}

impl Equalizer {
    /// Builds an equalizer from settings for `channels` interleaved channels.
    pub fn new(
        settings: &EqSettings,
        sample_rate: f32,
        channels: usize,
    ) -> Result<Self, DspError> {
        if sample_rate <= 0.0 {
            return Err(DspError::InvalidSampleRate(sample_rate));
        }
        if channels == 0 || channels > 8 {
            return Err(DspError::InvalidChannelCount(channels));
        }

        let mut cascade = Vec::with_capacity(settings.bands.len());
        for band in &settings.bands {
            cascade.push(DirectForm2Transposed::<f32>::new(band_coefficients(
                band,
                sample_rate,
            )?));
        }

        let filters = (0..channels).map(|_| cascade.clone()).collect();
        Ok(Self {
            filters,
            sample_rate,
        })
    }

    /// A pass-through equalizer with no bands.
    pub fn flat(sample_rate: f32, channels: usize) -> Self {
        Self {
            filters: (0..channels.max(1)).map(|_| Vec::new()).collect(),
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn num_channels(&self) -> usize {
        self.filters.len()
    }

    /// Process an interleaved buffer in-place. Frames with fewer samples
    /// than the channel count (a trailing partial frame) are left untouched.
    #[inline]
    pub fn process_interleaved(&mut self, buffer: &mut [f32]) {
        let channels = self.filters.len();
        for frame in buffer.chunks_exact_mut(channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                let mut s = *sample;
                for filter in &mut self.filters[ch] {
                    s = filter.run(s);
                }
                *sample = s;
            }
        }
    }

    /// Clear delay lines, e.g. when a device reopens.
    pub fn reset(&mut self) {
        for cascade in &mut self.filters {
            for filter in cascade.iter_mut() {
                filter.reset_state();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BandSetting;

    fn settings(bands: Vec<BandSetting>) -> EqSettings {
        EqSettings { bands }
    }

    fn peaking(frequency: f32, gain_db: f32) -> BandSetting {
        BandSetting {
            frequency,
            gain_db,
            q: std::f32::consts::FRAC_1_SQRT_2,
            kind: BandKind::Peaking,
        }
    }

    #[test]
    fn test_flat_eq_passes_through() {
        let mut eq = Equalizer::flat(48000.0, 2);
        let mut buffer = vec![0.5, -0.5, 0.25, -0.25];
        eq.process_interleaved(&mut buffer);
        assert_eq!(buffer, vec![0.5, -0.5, 0.25, -0.25]);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let s = settings(vec![peaking(1000.0, 0.0)]);
        assert!(matches!(
            Equalizer::new(&s, 0.0, 2),
            Err(DspError::InvalidSampleRate(_))
        ));
        assert!(matches!(
            Equalizer::new(&s, 48000.0, 0),
            Err(DspError::InvalidChannelCount(0))
        ));
        assert!(matches!(
            Equalizer::new(&s, 48000.0, 9),
            Err(DspError::InvalidChannelCount(9))
        ));
    }

    #[test]
    fn test_output_stays_finite() {
        let s = settings(vec![peaking(100.0, 6.0), peaking(1000.0, -6.0)]);
        let mut eq = Equalizer::new(&s, 48000.0, 2).unwrap();
        let mut buffer: Vec<f32> = (0..256)
            .map(|i| ((i as f32) * 0.1).sin() * 0.5)
            .flat_map(|s| [s, -s])
            .collect();
        eq.process_interleaved(&mut buffer);
        assert!(buffer.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_boost_increases_amplitude() {
        let s = settings(vec![peaking(1000.0, 12.0)]);
        let mut eq = Equalizer::new(&s, 48000.0, 1).unwrap();

        let sample_rate = 48000.0;
        let freq = 1000.0;
        let mut max_input = 0.0_f32;
        let mut max_output = 0.0_f32;
        for i in 0..2000 {
            let t = i as f32 / sample_rate;
            let sample = (2.0 * std::f32::consts::PI * freq * t).sin() * 0.25;
            max_input = max_input.max(sample.abs());
            let mut frame = [sample];
            eq.process_interleaved(&mut frame);
            max_output = max_output.max(frame[0].abs());
        }
        assert!(max_output > max_input, "boost should increase amplitude");
    }

    #[test]
    fn test_channels_filtered_independently() {
        let s = settings(vec![peaking(500.0, 6.0)]);
        let mut eq = Equalizer::new(&s, 48000.0, 2).unwrap();

        // Drive only the left channel; right stays silent.
        let mut buffer = Vec::new();
        for i in 0..64 {
            buffer.push(((i as f32) * 0.3).sin());
            buffer.push(0.0);
        }
        eq.process_interleaved(&mut buffer);
        for frame in buffer.chunks_exact(2) {
            assert_eq!(frame[1], 0.0, "silent channel must stay silent");
        }
    }

    #[test]
    fn test_reset_clears_state() {
        let s = settings(vec![peaking(100.0, 12.0)]);
        let mut eq = Equalizer::new(&s, 48000.0, 1).unwrap();

        let mut buffer = vec![1.0; 64];
        eq.process_interleaved(&mut buffer);
        eq.reset();

        // After reset, a zero buffer must come out exactly zero (no ringing).
        let mut silent = vec![0.0f32; 64];
        eq.process_interleaved(&mut silent);
        assert!(silent.iter().all(|s| *s == 0.0));
    }
}
