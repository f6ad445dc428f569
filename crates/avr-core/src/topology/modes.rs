//! Named audio modes and their natural channel assignments
//!
//! The mode table lists, for each mode the transform engine understands, the
//! channel assignment it naturally drives and whether it is suitable for
//! direct output. Modes that are not suitable either cannot have downmix
//! coefficients derived automatically by the firmware, or duplicate a better
//! candidate (the HDMI variants).
//!
//! `assignment_to_mode` only ever considers suitable entries, which is why
//! `mode_to_assignment` followed by `assignment_to_mode` is not the identity
//! for unsuitable modes.

use super::pairs::{ChannelAssignment, ChannelPair};

macro_rules! audio_modes {
    ( $( $variant:ident => $text:literal ),* $(,)? ) => {
        /// Discrete audio topology understood by the transform engine
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum AudioMode {
            $( $variant ),*
        }

        impl AudioMode {
            /// Every mode, in declaration order
            pub const ALL: &'static [AudioMode] = &[ $( AudioMode::$variant ),* ];

            fn text(self) -> &'static str {
                match self {
                    $( AudioMode::$variant => $text ),*
                }
            }
        }
    };
}

audio_modes! {
    Mode10 => "ACC_MODE10",
    Mode20t => "ACC_MODE20t",
    Mode20 => "ACC_MODE20",
    HdmiMode20 => "ACC_HDMI_MODE20",
    Mode20Lfe => "ACC_MODE20_LFE",
    HdmiMode20Lfe => "ACC_HDMI_MODE20_LFE",
    Mode30 => "ACC_MODE30",
    HdmiMode30 => "ACC_HDMI_MODE30",
    Mode30Lfe => "ACC_MODE30_LFE",
    HdmiMode30Lfe => "ACC_HDMI_MODE30_LFE",
    Mode21 => "ACC_MODE21",
    HdmiMode21 => "ACC_HDMI_MODE21",
    Mode21Lfe => "ACC_MODE21_LFE",
    HdmiMode21Lfe => "ACC_HDMI_MODE21_LFE",
    Mode31 => "ACC_MODE31",
    HdmiMode31 => "ACC_HDMI_MODE31",
    Mode31Lfe => "ACC_MODE31_LFE",
    HdmiMode31Lfe => "ACC_HDMI_MODE31_LFE",
    Mode22 => "ACC_MODE22",
    HdmiMode22 => "ACC_HDMI_MODE22",
    Mode22Lfe => "ACC_MODE22_LFE",
    HdmiMode22Lfe => "ACC_HDMI_MODE22_LFE",
    Mode32 => "ACC_MODE32",
    HdmiMode32 => "ACC_HDMI_MODE32",
    Mode32Lfe => "ACC_MODE32_LFE",
    HdmiMode32Lfe => "ACC_HDMI_MODE32_LFE",
    Mode23 => "ACC_MODE23",
    HdmiMode23 => "ACC_HDMI_MODE23",
    Mode23Lfe => "ACC_MODE23_LFE",
    HdmiMode23Lfe => "ACC_HDMI_MODE23_LFE",
    Mode33 => "ACC_MODE33",
    HdmiMode33 => "ACC_HDMI_MODE33",
    Mode33Lfe => "ACC_MODE33_LFE",
    HdmiMode33Lfe => "ACC_HDMI_MODE33_LFE",
    Mode24 => "ACC_MODE24",
    HdmiMode24 => "ACC_HDMI_MODE24",
    Mode24Lfe => "ACC_MODE24_LFE",
    HdmiMode24Lfe => "ACC_HDMI_MODE24_LFE",
    Mode34 => "ACC_MODE34",
    HdmiMode34 => "ACC_HDMI_MODE34",
    Mode34Lfe => "ACC_MODE34_LFE",
    HdmiMode34Lfe => "ACC_HDMI_MODE34_LFE",
    HdmiMode40 => "ACC_HDMI_MODE40",
    HdmiMode40Lfe => "ACC_HDMI_MODE40_LFE",
    HdmiMode50 => "ACC_HDMI_MODE50",
    HdmiMode50Lfe => "ACC_HDMI_MODE50_LFE",
    HdmiMode41 => "ACC_HDMI_MODE41",
    HdmiMode41Lfe => "ACC_HDMI_MODE41_LFE",
    HdmiMode51 => "ACC_HDMI_MODE51",
    HdmiMode51Lfe => "ACC_HDMI_MODE51_LFE",
    Mode42 => "ACC_MODE42",
    HdmiMode42 => "ACC_HDMI_MODE42",
    Mode42Lfe => "ACC_MODE42_LFE",
    HdmiMode42Lfe => "ACC_HDMI_MODE42_LFE",
    Mode52 => "ACC_MODE52",
    HdmiMode52 => "ACC_HDMI_MODE52",
    Mode52Lfe => "ACC_MODE52_LFE",
    HdmiMode52Lfe => "ACC_HDMI_MODE52_LFE",
    HdmiMode32T100 => "ACC_HDMI_MODE32_T100",
    HdmiMode32T100Lfe => "ACC_HDMI_MODE32_T100_LFE",
    HdmiMode32T010 => "ACC_HDMI_MODE32_T010",
    HdmiMode32T010Lfe => "ACC_HDMI_MODE32_T010_LFE",
    HdmiMode22T200 => "ACC_HDMI_MODE22_T200",
    HdmiMode22T200Lfe => "ACC_HDMI_MODE22_T200_LFE",
    HdmiMode42Wide => "ACC_HDMI_MODE42_WIDE",
    HdmiMode42WideLfe => "ACC_HDMI_MODE42_WIDE_LFE",
    HdmiMode33T010 => "ACC_HDMI_MODE33_T010",
    HdmiMode33T010Lfe => "ACC_HDMI_MODE33_T010_LFE",
    HdmiMode33T100 => "ACC_HDMI_MODE33_T100",
    HdmiMode33T100Lfe => "ACC_HDMI_MODE33_T100_LFE",
    HdmiMode32T110 => "ACC_HDMI_MODE32_T110",
    HdmiMode32T110Lfe => "ACC_HDMI_MODE32_T110_LFE",
    HdmiMode32T200 => "ACC_HDMI_MODE32_T200",
    HdmiMode32T200Lfe => "ACC_HDMI_MODE32_T200_LFE",
    HdmiMode52Wide => "ACC_HDMI_MODE52_WIDE",
    HdmiMode52WideLfe => "ACC_HDMI_MODE52_WIDE_LFE",
    Mode30T100 => "ACC_MODE30_T100",
    Mode30T100Lfe => "ACC_MODE30_T100_LFE",
    Mode30T200 => "ACC_MODE30_T200",
    Mode30T200Lfe => "ACC_MODE30_T200_LFE",
    Mode22T010 => "ACC_MODE22_T010",
    Mode22T010Lfe => "ACC_MODE22_T010_LFE",
    Mode32T020 => "ACC_MODE32_T020",
    Mode32T020Lfe => "ACC_MODE32_T020_LFE",
    Mode23T100 => "ACC_MODE23_T100",
    Mode23T100Lfe => "ACC_MODE23_T100_LFE",
    Mode23T010 => "ACC_MODE23_T010",
    Mode23T010Lfe => "ACC_MODE23_T010_LFE",
    Mode1p1 => "ACC_MODE_1p1",
    ModeId => "ACC_MODE_ID",
}

impl AudioMode {
    /// Firmware-style name, or "UNKNOWN" for modes outside the table
    pub fn name(self) -> &'static str {
        if self == AudioMode::ModeId || table_entry(self).is_some() {
            self.text()
        } else {
            "UNKNOWN"
        }
    }

    /// Whether `assignment_to_mode` may ever return this mode
    pub fn is_direct_output(self) -> bool {
        table_entry(self).map(|e| e.direct).unwrap_or(false)
    }
}

impl std::fmt::Display for AudioMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Mode table
// ============================================================================

struct ModeEntry {
    mode: AudioMode,
    assignment: ChannelAssignment,
    direct: bool,
}

const fn direct(
    mode: AudioMode,
    p0: ChannelPair,
    p1: ChannelPair,
    p2: ChannelPair,
    p3: ChannelPair,
) -> ModeEntry {
    ModeEntry { mode, assignment: ChannelAssignment::from_pairs(p0, p1, p2, p3), direct: true }
}

const fn indirect(
    mode: AudioMode,
    p0: ChannelPair,
    p1: ChannelPair,
    p2: ChannelPair,
    p3: ChannelPair,
) -> ModeEntry {
    ModeEntry { mode, assignment: ChannelAssignment::from_pairs(p0, p1, p2, p3), direct: false }
}

use AudioMode as M;
use ChannelPair as P;

const NC: ChannelPair = ChannelPair::NotConnected;
const LR: ChannelPair = ChannelPair::L_R;
const C_LFE: ChannelPair = ChannelPair::CNTR_LFE1;
const SUR: ChannelPair = ChannelPair::LSUR_RSUR;
const SUR_REAR: ChannelPair = ChannelPair::LSURREAR_RSURREAR;

/// Searched first to last; the HDMI duplicates never win a lookup
static MODE_TABLE: &[ModeEntry] = &[
    indirect(M::Mode10, NC, P::Cntr, NC, NC),
    direct(M::Mode20t, P::LtRt, NC, NC, NC),
    direct(M::Mode20, LR, NC, NC, NC),
    indirect(M::HdmiMode20, LR, NC, NC, NC),
    direct(M::Mode20Lfe, LR, P::Lfe1, NC, NC),
    indirect(M::HdmiMode20Lfe, LR, P::Lfe1, NC, NC),
    direct(M::Mode30, LR, P::Cntr, NC, NC),
    indirect(M::HdmiMode30, LR, P::Cntr, NC, NC),
    direct(M::Mode30Lfe, LR, C_LFE, NC, NC),
    indirect(M::HdmiMode30Lfe, LR, C_LFE, NC, NC),
    direct(M::Mode21, LR, NC, P::Csurr, NC),
    indirect(M::HdmiMode21, LR, NC, P::Csurr, NC),
    direct(M::Mode21Lfe, LR, P::Lfe1, P::Csurr, NC),
    indirect(M::HdmiMode21Lfe, LR, P::Lfe1, P::Csurr, NC),
    direct(M::Mode31, LR, P::Cntr, P::Csurr, NC),
    indirect(M::HdmiMode31, LR, P::Cntr, P::Csurr, NC),
    direct(M::Mode31Lfe, LR, C_LFE, P::Csurr, NC),
    indirect(M::HdmiMode31Lfe, LR, C_LFE, P::Csurr, NC),
    direct(M::Mode22, LR, NC, SUR, NC),
    indirect(M::HdmiMode22, LR, NC, SUR, NC),
    direct(M::Mode22Lfe, LR, P::Lfe1, SUR, NC),
    indirect(M::HdmiMode22Lfe, LR, P::Lfe1, SUR, NC),
    direct(M::Mode32, LR, P::Cntr, SUR, NC),
    indirect(M::HdmiMode32, LR, P::Cntr, SUR, NC),
    direct(M::Mode32Lfe, LR, C_LFE, SUR, NC),
    indirect(M::HdmiMode32Lfe, LR, C_LFE, SUR, NC),
    indirect(M::Mode23, LR, NC, SUR, P::Csurr),
    indirect(M::HdmiMode23, LR, NC, SUR, P::Csurr),
    indirect(M::Mode23Lfe, LR, P::Lfe1, SUR, P::Csurr),
    indirect(M::HdmiMode23Lfe, LR, P::Lfe1, SUR, P::Csurr),
    direct(M::Mode33, LR, P::Cntr, SUR, P::Csurr),
    indirect(M::HdmiMode33, LR, P::Cntr, SUR, P::Csurr),
    direct(M::Mode33Lfe, LR, C_LFE, SUR, P::Csurr),
    indirect(M::HdmiMode33Lfe, LR, C_LFE, SUR, P::Csurr),
    indirect(M::Mode24, LR, NC, SUR, SUR_REAR),
    indirect(M::HdmiMode24, LR, NC, SUR, SUR_REAR),
    indirect(M::Mode24Lfe, LR, P::Lfe1, SUR, SUR_REAR),
    indirect(M::HdmiMode24Lfe, LR, P::Lfe1, SUR, SUR_REAR),
    direct(M::Mode34, LR, P::Cntr, SUR, SUR_REAR),
    indirect(M::HdmiMode34, LR, P::Cntr, SUR, SUR_REAR),
    direct(M::Mode34Lfe, LR, C_LFE, SUR, SUR_REAR),
    indirect(M::HdmiMode34Lfe, LR, C_LFE, SUR, SUR_REAR),
    indirect(M::HdmiMode40, LR, NC, NC, P::CntrlCntrr),
    indirect(M::HdmiMode40Lfe, LR, P::Lfe1, NC, P::CntrlCntrr),
    indirect(M::HdmiMode50, LR, P::Cntr, NC, P::CntrlCntrr),
    indirect(M::HdmiMode50Lfe, LR, C_LFE, NC, P::CntrlCntrr),
    indirect(M::HdmiMode41, LR, NC, P::Csurr, P::CntrlCntrr),
    indirect(M::HdmiMode41Lfe, LR, P::Lfe1, P::Csurr, P::CntrlCntrr),
    indirect(M::HdmiMode51, LR, P::Cntr, P::Csurr, P::CntrlCntrr),
    indirect(M::HdmiMode51Lfe, LR, C_LFE, P::Csurr, P::CntrlCntrr),
    indirect(M::Mode42, LR, NC, SUR, P::CntrlCntrr),
    indirect(M::HdmiMode42, LR, NC, SUR, P::CntrlCntrr),
    indirect(M::Mode42Lfe, LR, P::Lfe1, SUR, P::CntrlCntrr),
    indirect(M::HdmiMode42Lfe, LR, P::Lfe1, SUR, P::CntrlCntrr),
    indirect(M::Mode52, LR, P::Cntr, SUR, P::CntrlCntrr),
    indirect(M::HdmiMode52, LR, P::Cntr, SUR, P::CntrlCntrr),
    indirect(M::Mode52Lfe, LR, C_LFE, SUR, P::CntrlCntrr),
    indirect(M::HdmiMode52Lfe, LR, C_LFE, SUR, P::CntrlCntrr),
    // CEA-861-E height and wide topologies
    indirect(M::HdmiMode32T100, LR, P::Cntr, SUR, P::Chigh),
    indirect(M::HdmiMode32T100Lfe, LR, C_LFE, SUR, P::Chigh),
    indirect(M::HdmiMode32T010, LR, P::Cntr, SUR, P::Topsur),
    indirect(M::HdmiMode32T010Lfe, LR, C_LFE, SUR, P::Topsur),
    indirect(M::HdmiMode22T200, LR, NC, SUR, P::LhighRhigh),
    indirect(M::HdmiMode22T200Lfe, LR, P::Lfe1, SUR, P::LhighRhigh),
    indirect(M::HdmiMode42Wide, LR, NC, SUR, P::LwideRwide),
    indirect(M::HdmiMode42WideLfe, LR, P::Lfe1, SUR, P::LwideRwide),
    indirect(M::HdmiMode33T010, LR, P::Cntr, SUR, P::CsurrTopsur),
    indirect(M::HdmiMode33T010Lfe, LR, C_LFE, SUR, P::CsurrTopsur),
    indirect(M::HdmiMode33T100, LR, P::Cntr, SUR, P::CsurrChigh),
    indirect(M::HdmiMode33T100Lfe, LR, C_LFE, SUR, P::CsurrChigh),
    indirect(M::HdmiMode32T110, LR, P::Cntr, SUR, P::ChighTopsur),
    indirect(M::HdmiMode32T110Lfe, LR, C_LFE, SUR, P::ChighTopsur),
    indirect(M::HdmiMode32T200, LR, P::Cntr, SUR, P::LhighRhigh),
    indirect(M::HdmiMode32T200Lfe, LR, C_LFE, SUR, P::LhighRhigh),
    indirect(M::HdmiMode52Wide, LR, P::Cntr, SUR, P::LwideRwide),
    indirect(M::HdmiMode52WideLfe, LR, C_LFE, SUR, P::LwideRwide),
    // speaker topologies outside CEA-861-E
    indirect(M::Mode30T100, LR, P::Cntr, NC, P::Chigh),
    indirect(M::Mode30T100Lfe, LR, C_LFE, NC, P::Chigh),
    indirect(M::Mode30T200, LR, P::Cntr, NC, P::LhighRhigh),
    indirect(M::Mode30T200Lfe, LR, C_LFE, NC, P::LhighRhigh),
    indirect(M::Mode22T010, LR, NC, SUR, P::Topsur),
    indirect(M::Mode22T010Lfe, LR, P::Lfe1, SUR, P::Topsur),
    indirect(M::Mode32T020, LR, P::Cntr, SUR, P::LhighsideRhighside),
    indirect(M::Mode32T020Lfe, LR, C_LFE, SUR, P::LhighsideRhighside),
    indirect(M::Mode23T100, LR, NC, SUR, P::Chigh),
    indirect(M::Mode23T100Lfe, LR, P::Lfe1, SUR, P::Chigh),
    indirect(M::Mode23T010, LR, NC, SUR, P::Topsur),
    indirect(M::Mode23T010Lfe, LR, P::Lfe1, SUR, P::Topsur),
];

fn table_entry(mode: AudioMode) -> Option<&'static ModeEntry> {
    MODE_TABLE.iter().find(|e| e.mode == mode)
}

// ============================================================================
// Translation
// ============================================================================

/// Pick the best directly-outputtable mode for a channel assignment
///
/// Pair 4, the reserved bit and the malleable flag are ignored. If no
/// suitable mode matches, pairs 3, 2 and 1 are disconnected in turn until one
/// does; failing that the Lt/Rt stereo mode is used. An assignment with
/// nothing connected at all maps to `ModeId`.
pub fn assignment_to_mode(assignment: ChannelAssignment) -> AudioMode {
    let mut candidate = assignment;
    candidate.pairs[4] = ChannelPair::NotConnected;
    candidate.malleable = false;

    if candidate.connected_pairs() == 0 {
        return AudioMode::ModeId;
    }

    for pair in (0..=3).rev() {
        if let Some(entry) = MODE_TABLE
            .iter()
            .find(|e| e.direct && e.assignment == candidate)
        {
            return entry.mode;
        }

        if pair != 0 {
            candidate.pairs[pair] = ChannelPair::NotConnected;
            log::trace!("assignment_to_mode: no match, disconnecting pair {}", pair);
        }
    }

    log::debug!("assignment_to_mode: no match, falling back to ACC_MODE20t (Lt/Rt stereo)");
    AudioMode::Mode20t
}

/// Natural channel assignment for a mode
///
/// `ModeId` maps to the malleable surface. Modes outside the table map to an
/// all-zero assignment.
pub fn mode_to_assignment(mode: AudioMode) -> ChannelAssignment {
    if mode == AudioMode::ModeId {
        return ChannelAssignment::MALLEABLE;
    }

    match table_entry(mode) {
        Some(entry) => entry.assignment,
        None => {
            log::error!("mode_to_assignment: no table entry for {:?}", mode);
            ChannelAssignment::ZEROS
        }
    }
}
