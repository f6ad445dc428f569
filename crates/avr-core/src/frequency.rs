//! Sampling frequency tables
//!
//! The transform engine reports sampling frequencies as table entries rather
//! than raw Hz. Captured audio, on the other hand, arrives with a rate that is
//! measured from timestamps and has to be snapped to the nearest nominal
//! rate before it can be used.

/// Sampling frequencies known to the transform engine, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplingFrequency {
    Fs768k,
    Fs705k6,
    Fs512k,
    Fs384k,
    Fs352k8,
    Fs256k,
    Fs192k,
    Fs176k4,
    Fs128k,
    Fs96k,
    Fs88k2,
    Fs64k,
    Fs48k,
    Fs44k1,
    Fs32k,
    Fs24k,
    Fs22k05,
    Fs16k,
    Fs12k,
    Fs11k025,
    Fs8k,
}

impl SamplingFrequency {
    const TABLE: [SamplingFrequency; 21] = [
        SamplingFrequency::Fs768k,
        SamplingFrequency::Fs705k6,
        SamplingFrequency::Fs512k,
        SamplingFrequency::Fs384k,
        SamplingFrequency::Fs352k8,
        SamplingFrequency::Fs256k,
        SamplingFrequency::Fs192k,
        SamplingFrequency::Fs176k4,
        SamplingFrequency::Fs128k,
        SamplingFrequency::Fs96k,
        SamplingFrequency::Fs88k2,
        SamplingFrequency::Fs64k,
        SamplingFrequency::Fs48k,
        SamplingFrequency::Fs44k1,
        SamplingFrequency::Fs32k,
        SamplingFrequency::Fs24k,
        SamplingFrequency::Fs22k05,
        SamplingFrequency::Fs16k,
        SamplingFrequency::Fs12k,
        SamplingFrequency::Fs11k025,
        SamplingFrequency::Fs8k,
    ];

    /// Frequency in Hz
    pub fn hz(self) -> u32 {
        match self {
            SamplingFrequency::Fs768k => 768_000,
            SamplingFrequency::Fs705k6 => 705_600,
            SamplingFrequency::Fs512k => 512_000,
            SamplingFrequency::Fs384k => 384_000,
            SamplingFrequency::Fs352k8 => 352_800,
            SamplingFrequency::Fs256k => 256_000,
            SamplingFrequency::Fs192k => 192_000,
            SamplingFrequency::Fs176k4 => 176_400,
            SamplingFrequency::Fs128k => 128_000,
            SamplingFrequency::Fs96k => 96_000,
            SamplingFrequency::Fs88k2 => 88_200,
            SamplingFrequency::Fs64k => 64_000,
            SamplingFrequency::Fs48k => 48_000,
            SamplingFrequency::Fs44k1 => 44_100,
            SamplingFrequency::Fs32k => 32_000,
            SamplingFrequency::Fs24k => 24_000,
            SamplingFrequency::Fs22k05 => 22_050,
            SamplingFrequency::Fs16k => 16_000,
            SamplingFrequency::Fs12k => 12_000,
            SamplingFrequency::Fs11k025 => 11_025,
            SamplingFrequency::Fs8k => 8_000,
        }
    }

    /// First table entry not above `hz`, or 8 kHz for anything lower
    pub fn from_hz_floor(hz: u32) -> Self {
        Self::TABLE
            .iter()
            .copied()
            .find(|f| f.hz() <= hz)
            .unwrap_or(SamplingFrequency::Fs8k)
    }

    /// Exact table entry for `hz`
    pub fn from_hz(hz: u32) -> Option<Self> {
        Self::TABLE.iter().copied().find(|f| f.hz() == hz)
    }
}

/// Processing range the engine is configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsRange {
    Fs12k,
    Fs24k,
    Fs48k,
    Fs96k,
    Fs192k,
    Fs384k,
}

impl FsRange {
    pub fn for_hz(hz: u32) -> Self {
        if hz < 64_000 {
            if hz >= 32_000 {
                FsRange::Fs48k
            } else if hz >= 16_000 {
                FsRange::Fs24k
            } else {
                FsRange::Fs12k
            }
        } else if hz < 128_000 {
            FsRange::Fs96k
        } else if hz < 256_000 {
            FsRange::Fs192k
        } else {
            FsRange::Fs384k
        }
    }
}

/// Nominal capture rates, ascending
const NOMINAL_RATES: [u32; 12] = [
    16_000, 22_050, 24_000, 32_000, 44_100, 48_000, 64_000, 88_200, 96_000, 128_000, 176_400,
    192_000,
];

/// Snap a measured rate onto the nearest nominal rate
///
/// Boundaries sit at the midpoints between neighbouring rates; a value on a
/// midpoint snaps down.
pub fn snap_sample_rate(measured: u32) -> u32 {
    NOMINAL_RATES
        .windows(2)
        .find(|pair| measured <= (pair[0] + pair[1]) / 2)
        .map(|pair| pair[0])
        .unwrap_or(NOMINAL_RATES[NOMINAL_RATES.len() - 1])
}

/// Whether the capture path can deliver audio at `rate`
///
/// 64 kHz and 128 kHz snap cleanly but cannot be played.
pub fn is_capture_rate_supported(rate: u32) -> bool {
    NOMINAL_RATES.contains(&rate) && rate != 64_000 && rate != 128_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_lookup() {
        assert_eq!(SamplingFrequency::from_hz_floor(48_000), SamplingFrequency::Fs48k);
        assert_eq!(SamplingFrequency::from_hz_floor(47_999), SamplingFrequency::Fs44k1);
        assert_eq!(SamplingFrequency::from_hz_floor(1_000_000), SamplingFrequency::Fs768k);
        assert_eq!(SamplingFrequency::from_hz_floor(100), SamplingFrequency::Fs8k);
        assert_eq!(SamplingFrequency::from_hz(44_100), Some(SamplingFrequency::Fs44k1));
        assert_eq!(SamplingFrequency::from_hz(44_000), None);
    }

    #[test]
    fn test_ranges() {
        assert_eq!(FsRange::for_hz(8_000), FsRange::Fs12k);
        assert_eq!(FsRange::for_hz(22_050), FsRange::Fs24k);
        assert_eq!(FsRange::for_hz(44_100), FsRange::Fs48k);
        assert_eq!(FsRange::for_hz(88_200), FsRange::Fs96k);
        assert_eq!(FsRange::for_hz(176_400), FsRange::Fs192k);
        assert_eq!(FsRange::for_hz(768_000), FsRange::Fs384k);
    }

    #[test]
    fn test_snap_at_midpoints() {
        assert_eq!(snap_sample_rate(47_950), 48_000);
        assert_eq!(snap_sample_rate(44_300), 44_100);
        // midpoint of 44.1k and 48k is 46050
        assert_eq!(snap_sample_rate(46_050), 44_100);
        assert_eq!(snap_sample_rate(46_051), 48_000);
        assert_eq!(snap_sample_rate(176_000), 176_400);
        assert_eq!(snap_sample_rate(250_000), 192_000);
        assert_eq!(snap_sample_rate(1_000), 16_000);
    }

    #[test]
    fn test_unsupported_capture_rates() {
        assert_eq!(snap_sample_rate(64_100), 64_000);
        assert!(!is_capture_rate_supported(64_000));
        assert_eq!(snap_sample_rate(127_000), 128_000);
        assert!(!is_capture_rate_supported(128_000));
        assert!(is_capture_rate_supported(48_000));
        assert!(!is_capture_rate_supported(47_999));
    }
}
