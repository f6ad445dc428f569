//! Input stream format reporting
//!
//! The S/PDIF front end of the transform engine reports what it is receiving
//! as a [`SpdifStatus`]. This module turns that into the human readable format
//! string shown on the diagnostic surface and decides whether the current
//! firmware can decode it.

use crate::frequency::SamplingFrequency;

/// Payload carried by the digital input (IEC 61937 burst type)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InputEncoding {
    #[default]
    NullDataBurst,
    Ac3,
    PauseBurst,
    Mp1L1,
    Mp1L2L3,
    Mp2Mc,
    Mp2Aac,
    Mp2L1Lsf,
    Mp2L2Lsf,
    Mp2L3Lsf,
    Dts1,
    Dts2,
    Dts3,
    Atrac,
    Atrac2_3,
    Dts4,
    DdPlus,
    TrueHd,
    /// Linear PCM
    Iec60958,
    Iec60958Dts14,
    Iec60958Dts16,
    Iec60958Dts1_14,
    Iec60958Dts1_16,
    Iec60958Dts2_14,
    Iec60958Dts2_16,
    Iec60958Dts3_14,
    Iec60958Dts3_16,
    /// Burst type not understood by the host
    Other(u16),
}

impl InputEncoding {
    pub fn name(self) -> &'static str {
        use InputEncoding::*;
        match self {
            NullDataBurst => "NULL_DATA_BURST",
            Ac3 => "AC3",
            PauseBurst => "PAUSE_BURST",
            Mp1L1 => "MP1L1",
            Mp1L2L3 => "MP1L2L3",
            Mp2Mc => "MP2MC",
            Mp2Aac => "MP2AAC",
            Mp2L1Lsf => "MP2L1LSF",
            Mp2L2Lsf => "MP2L2LSF",
            Mp2L3Lsf => "MP2L3LSF",
            Dts1 => "DTS1",
            Dts2 => "DTS2",
            Dts3 => "DTS3",
            Atrac => "ATRAC",
            Atrac2_3 => "ATRAC2_3",
            Dts4 => "DTS4",
            DdPlus => "DD+",
            TrueHd => "Dolby TrueHD",
            Iec60958 => "PCM",
            Iec60958Dts14 | Iec60958Dts1_14 | Iec60958Dts2_14 | Iec60958Dts3_14 => {
                "IEC60958_DTS14"
            }
            Iec60958Dts16 | Iec60958Dts1_16 | Iec60958Dts2_16 | Iec60958Dts3_16 => {
                "IEC60958_DTS16"
            }
            Other(_) => "UNKNOWN",
        }
    }

    fn is_dts_burst(self) -> bool {
        matches!(
            self,
            InputEncoding::Dts1 | InputEncoding::Dts2 | InputEncoding::Dts3 | InputEncoding::Dts4
        )
    }
}

/// State of the S/PDIF input state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpdifState {
    #[default]
    Reset,
    PcmBypass,
    CompressedBypass,
    Underflow,
    CompressedMute,
    Invalid,
}

impl SpdifState {
    pub fn name(self) -> &'static str {
        match self {
            SpdifState::Reset => "RESET",
            SpdifState::PcmBypass => "PCM_BYPASS",
            SpdifState::CompressedBypass => "COMPRESSED_BYPASS",
            SpdifState::Underflow => "UNDERFLOW",
            SpdifState::CompressedMute => "COMPRESSED_MUTE",
            SpdifState::Invalid => "INVALID",
        }
    }
}

/// What the S/PDIF front end reports about its input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpdifStatus {
    pub state: SpdifState,
    pub encoding: InputEncoding,
    pub silence: bool,
    /// DTS flavour bits: `[1:0]` core/HD type, `[3:2]` ES extension
    pub display: u8,
    pub sampling_frequency: SamplingFrequency,
    pub front: u8,
    pub rear: u8,
    pub lfe: u8,
}

impl Default for SpdifStatus {
    fn default() -> Self {
        Self {
            state: SpdifState::Reset,
            encoding: InputEncoding::NullDataBurst,
            silence: false,
            display: 0,
            sampling_frequency: SamplingFrequency::Fs48k,
            front: 0,
            rear: 0,
            lfe: 0,
        }
    }
}

const DTS_CORE: u8 = 0;
const DTSHD_96K: u8 = 1;
const DTSHD_HR: u8 = 2;

const DTS_61_MATRIX: u8 = 1;
const DTS_61_DISCRETE: u8 = 2;
const DTS_71_DISCRETE: u8 = 3;

/// Format string for the diagnostic surface, e.g. `"DTS1 ES 6.1 Matrix"`
pub fn describe_input_format(status: &SpdifStatus) -> String {
    let mut text = String::from(status.encoding.name());

    if status.encoding.is_dts_burst() {
        match status.display & 0x3 {
            DTS_CORE => {
                // X96 is not always flagged; infer it from the frequency
                if status.sampling_frequency.hz() > 48_000 {
                    log::debug!(
                        "describe_input_format: inferring DTS 96/24 from {} Hz",
                        status.sampling_frequency.hz()
                    );
                    text.push_str(" 96/24");
                } else {
                    match (status.display >> 2) & 0x3 {
                        DTS_61_MATRIX => text.push_str(" ES 6.1 Matrix"),
                        DTS_61_DISCRETE => text.push_str(" ES 6.1 Discrete"),
                        DTS_71_DISCRETE => text.push_str(" ES 8ch Discrete"),
                        _ => {}
                    }
                }
            }
            DTSHD_96K => text.push_str(" 96/24"),
            DTSHD_HR => text.push_str(" HD HR"),
            _ => text.push_str(" HD MA"),
        }
    }

    if status.encoding == InputEncoding::Iec60958 && status.silence {
        text.push_str(" SILENT");
    }

    text
}

/// Decoder families the loaded firmware was built with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderCapability {
    pub version: u32,
    pub dolby_digital: bool,
    pub dts: bool,
    pub mpeg: bool,
}

/// Whether the firmware can decode `encoding` at all
pub fn is_supported(encoding: InputEncoding, caps: &DecoderCapability) -> bool {
    use InputEncoding::*;
    match encoding {
        Ac3 | DdPlus | TrueHd => caps.dolby_digital,
        Dts1 | Dts2 | Dts3 | Dts4 | Iec60958Dts14 | Iec60958Dts16 | Iec60958Dts1_14
        | Iec60958Dts1_16 | Iec60958Dts2_14 | Iec60958Dts2_16 | Iec60958Dts3_14
        | Iec60958Dts3_16 => caps.dts,
        Mp2Aac => caps.mpeg,
        Iec60958 | NullDataBurst | PauseBurst => true,
        Mp1L1 | Mp1L2L3 | Mp2Mc | Mp2L1Lsf | Mp2L2Lsf | Mp2L3Lsf | Atrac | Atrac2_3 | Other(_) => {
            false
        }
    }
}

/// Whether `encoding` can be decoded within the low-latency game mode budget
///
/// `decoder_hz` is the frequency reported by the decoder, not by the S/PDIF
/// front end.
pub fn is_supported_in_game_mode(
    encoding: InputEncoding,
    decoder_hz: u32,
    caps: &DecoderCapability,
) -> bool {
    use InputEncoding::*;
    match encoding {
        TrueHd | Dts3 | Dts4 | Iec60958Dts14 | Iec60958Dts16 | Iec60958Dts3_14
        | Iec60958Dts3_16 => false,
        Ac3 | DdPlus | Dts1 | Dts2 | Mp2Aac | Iec60958Dts1_14 | Iec60958Dts1_16
        | Iec60958Dts2_14 | Iec60958Dts2_16
            if decoder_hz < 44_100 =>
        {
            false
        }
        _ => is_supported(encoding, caps),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dts(display: u8, fs: SamplingFrequency) -> SpdifStatus {
        SpdifStatus {
            encoding: InputEncoding::Dts1,
            display,
            sampling_frequency: fs,
            ..Default::default()
        }
    }

    #[test]
    fn test_encoding_names() {
        assert_eq!(InputEncoding::DdPlus.name(), "DD+");
        assert_eq!(InputEncoding::Iec60958.name(), "PCM");
        assert_eq!(InputEncoding::Iec60958Dts2_16.name(), "IEC60958_DTS16");
        assert_eq!(InputEncoding::Other(99).name(), "UNKNOWN");
        assert_eq!(SpdifState::CompressedMute.name(), "COMPRESSED_MUTE");
    }

    #[test]
    fn test_dts_suffixes() {
        assert_eq!(describe_input_format(&dts(0, SamplingFrequency::Fs48k)), "DTS1");
        assert_eq!(
            describe_input_format(&dts(1 << 2, SamplingFrequency::Fs48k)),
            "DTS1 ES 6.1 Matrix"
        );
        assert_eq!(
            describe_input_format(&dts(3 << 2, SamplingFrequency::Fs44k1)),
            "DTS1 ES 8ch Discrete"
        );
        // core at 96 kHz is reported as 96/24 regardless of ES bits
        assert_eq!(
            describe_input_format(&dts(2 << 2, SamplingFrequency::Fs96k)),
            "DTS1 96/24"
        );
        assert_eq!(describe_input_format(&dts(2, SamplingFrequency::Fs48k)), "DTS1 HD HR");
        assert_eq!(describe_input_format(&dts(3, SamplingFrequency::Fs48k)), "DTS1 HD MA");
    }

    #[test]
    fn test_silent_pcm() {
        let status = SpdifStatus {
            encoding: InputEncoding::Iec60958,
            silence: true,
            ..Default::default()
        };
        assert_eq!(describe_input_format(&status), "PCM SILENT");

        // silence only matters for PCM
        let status = SpdifStatus {
            encoding: InputEncoding::Ac3,
            silence: true,
            ..Default::default()
        };
        assert_eq!(describe_input_format(&status), "AC3");
    }

    #[test]
    fn test_support_follows_capability() {
        let none = DecoderCapability::default();
        let all = DecoderCapability { version: 1, dolby_digital: true, dts: true, mpeg: true };

        assert!(!is_supported(InputEncoding::Ac3, &none));
        assert!(is_supported(InputEncoding::Ac3, &all));
        assert!(is_supported(InputEncoding::Iec60958, &none));
        assert!(is_supported(InputEncoding::PauseBurst, &none));
        assert!(!is_supported(InputEncoding::Atrac, &all));
    }

    #[test]
    fn test_game_mode() {
        let all = DecoderCapability { version: 1, dolby_digital: true, dts: true, mpeg: true };

        assert!(!is_supported_in_game_mode(InputEncoding::TrueHd, 48_000, &all));
        assert!(!is_supported_in_game_mode(InputEncoding::Ac3, 32_000, &all));
        assert!(is_supported_in_game_mode(InputEncoding::Ac3, 48_000, &all));
        assert!(is_supported_in_game_mode(InputEncoding::Iec60958, 32_000, &all));
    }
}
