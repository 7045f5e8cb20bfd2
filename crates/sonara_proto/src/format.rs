//! Audio format description and its packed wire form

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Maximum number of channel positions in a layout.
pub const CH_MAX: usize = 11;

/// Size in bytes of [`PackedFormat`] on the wire.
pub const PACKED_FORMAT_SIZE: usize = 4 + 4 + 4 + CH_MAX;

/// PCM sample encodings the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum SampleFormat {
    U8 = 0,
    S16LE = 1,
    S24LE = 2,
    S24LE3 = 3,
    S32LE = 4,
}

impl SampleFormat {
    pub fn from_u32(v: u32) -> Result<Self, ProtoError> {
        match v {
            0 => Ok(SampleFormat::U8),
            1 => Ok(SampleFormat::S16LE),
            2 => Ok(SampleFormat::S24LE),
            3 => Ok(SampleFormat::S24LE3),
            4 => Ok(SampleFormat::S32LE),
            _ => Err(ProtoError::BadEnumValue {
                what: "SampleFormat",
                value: v,
            }),
        }
    }

    /// Bytes one sample occupies in memory.
    pub fn sample_bytes(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16LE => 2,
            SampleFormat::S24LE3 => 3,
            SampleFormat::S24LE | SampleFormat::S32LE => 4,
        }
    }
}

/// A complete stream or device format: sample encoding, rate, channel count
/// and channel layout.
///
/// `channel_layout[pos]` holds the index of the channel carrying position
/// `pos` (front-left, front-right, ...), or -1 when the position is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    pub sample_format: SampleFormat,
    pub frame_rate: u32,
    pub num_channels: u32,
    pub channel_layout: [i8; CH_MAX],
}

impl Default for Format {
    fn default() -> Self {
        Format::new(SampleFormat::S16LE, 48000, 2)
    }
}

impl Format {
    /// Creates a format with the default layout for `num_channels`: channel
    /// `i` carries position `i`, remaining positions absent.
    pub fn new(sample_format: SampleFormat, frame_rate: u32, num_channels: u32) -> Self {
        let mut channel_layout = [-1i8; CH_MAX];
        for (i, slot) in channel_layout
            .iter_mut()
            .enumerate()
            .take(num_channels as usize)
        {
            *slot = i as i8;
        }
        Self {
            sample_format,
            frame_rate,
            num_channels,
            channel_layout,
        }
    }

    /// Bytes one frame (one sample per channel) occupies.
    pub fn frame_bytes(&self) -> usize {
        self.sample_format.sample_bytes() * self.num_channels as usize
    }

    pub fn pack(&self) -> PackedFormat {
        let mut out = PackedFormat([0u8; PACKED_FORMAT_SIZE]);
        out.0[0..4].copy_from_slice(&(self.sample_format as u32).to_le_bytes());
        out.0[4..8].copy_from_slice(&self.frame_rate.to_le_bytes());
        out.0[8..12].copy_from_slice(&self.num_channels.to_le_bytes());
        for (i, ch) in self.channel_layout.iter().enumerate() {
            out.0[12 + i] = *ch as u8;
        }
        out
    }

    pub fn unpack(packed: &PackedFormat) -> Result<Self, ProtoError> {
        let b = &packed.0;
        let sample_format =
            SampleFormat::from_u32(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))?;
        let frame_rate = u32::from_le_bytes([b[4], b[5], b[6], b[7]]);
        let num_channels = u32::from_le_bytes([b[8], b[9], b[10], b[11]]);
        let mut channel_layout = [-1i8; CH_MAX];
        for (i, slot) in channel_layout.iter_mut().enumerate() {
            *slot = b[12 + i] as i8;
        }
        Ok(Self {
            sample_format,
            frame_rate,
            num_channels,
            channel_layout,
        })
    }
}

/// Fixed-size wire representation of [`Format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedFormat(pub [u8; PACKED_FORMAT_SIZE]);

impl Default for PackedFormat {
    fn default() -> Self {
        Format::default().pack()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes() {
        assert_eq!(Format::new(SampleFormat::S16LE, 48000, 2).frame_bytes(), 4);
        assert_eq!(Format::new(SampleFormat::S32LE, 48000, 2).frame_bytes(), 8);
        assert_eq!(Format::new(SampleFormat::U8, 8000, 1).frame_bytes(), 1);
        assert_eq!(Format::new(SampleFormat::S24LE3, 44100, 6).frame_bytes(), 18);
    }

    #[test]
    fn test_default_layout() {
        let fmt = Format::new(SampleFormat::S16LE, 48000, 2);
        assert_eq!(fmt.channel_layout[0], 0);
        assert_eq!(fmt.channel_layout[1], 1);
        assert_eq!(fmt.channel_layout[2], -1);
    }

    #[test]
    fn test_pack_unpack_preserves_values() {
        let mut fmt = Format::new(SampleFormat::S24LE, 96000, 6);
        fmt.channel_layout[4] = -1;
        fmt.channel_layout[5] = 3;

        let unpacked = Format::unpack(&fmt.pack()).unwrap();
        assert_eq!(unpacked, fmt);
    }

    #[test]
    fn test_unpack_rejects_bad_sample_format() {
        let mut packed = Format::default().pack();
        packed.0[0] = 0xff;
        assert!(Format::unpack(&packed).is_err());
    }
}
