use chorus_timing::{MicroSeconds, USEC_PER_SEC};
use strum::{Display, FromRepr};

use crate::channelmap::CHANNELS_MAX;

pub(crate) const RATE_MAX: u32 = 48_000 * 4;

/// On-the-wire sample format of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display)]
#[repr(u8)]
pub enum SampleFormat {
    U8 = 0,
    Alaw = 1,
    Ulaw = 2,
    S16Le = 3,
    S16Be = 4,
    Float32Le = 5,
    Float32Be = 6,
}

impl SampleFormat {
    /// Size of a single sample in bytes.
    pub fn sample_size(self) -> usize {
        match self {
            Self::U8 | Self::Alaw | Self::Ulaw => 1,
            Self::S16Le | Self::S16Be => 2,
            Self::Float32Le | Self::Float32Be => 4,
        }
    }
}

/// (format, channel count, rate) triple describing raw audio data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpec {
    pub format: SampleFormat,
    pub channels: u8,
    pub rate: u32,
}

impl SampleSpec {
    pub fn is_valid(&self) -> bool {
        self.rate > 0
            && self.rate <= RATE_MAX
            && self.channels > 0
            && usize::from(self.channels) <= CHANNELS_MAX
    }

    /// Bytes per second of audio in this spec.
    pub fn bytes_per_second(&self) -> usize {
        self.frame_size() * self.rate as usize
    }

    /// Bytes per frame (one sample for every channel).
    pub fn frame_size(&self) -> usize {
        self.format.sample_size() * usize::from(self.channels)
    }

    /// Playback time of `length` bytes of audio in this spec.
    pub fn bytes_to_usec(&self, length: u64) -> MicroSeconds {
        MicroSeconds(length * USEC_PER_SEC / self.bytes_per_second() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: SampleSpec = SampleSpec { format: SampleFormat::S16Le, channels: 2, rate: 44_100 };

    #[test]
    fn validity_bounds() {
        assert!(SPEC.is_valid());
        assert!(!SampleSpec { rate: 0, ..SPEC }.is_valid());
        assert!(!SampleSpec { channels: 0, ..SPEC }.is_valid());
        assert!(!SampleSpec { channels: 17, ..SPEC }.is_valid());
        assert!(!SampleSpec { rate: RATE_MAX + 1, ..SPEC }.is_valid());
    }

    #[test]
    fn byte_time_conversion() {
        // One second of CD audio.
        assert_eq!(SPEC.bytes_per_second(), 176_400);
        assert_eq!(SPEC.bytes_to_usec(176_400), MicroSeconds(USEC_PER_SEC));
        assert_eq!(SPEC.bytes_to_usec(88_200), MicroSeconds(USEC_PER_SEC / 2));
    }

    #[test]
    fn format_round_trips_through_repr() {
        for f in [SampleFormat::U8, SampleFormat::S16Le, SampleFormat::Float32Be] {
            assert_eq!(SampleFormat::from_repr(f as u8), Some(f));
        }
        assert_eq!(SampleFormat::from_repr(7), None);
    }
}
