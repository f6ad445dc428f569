//! Channel pairs and the five-slot channel assignment
//!
//! A [`ChannelAssignment`] names what is wired to each of the five output
//! pairs of a sink. On the wire it is a packed 32-bit word:
//!
//! ```text
//! bit 31      30        29..24  23..18  17..12  11..6   5..0
//! malleable   reserved  pair4   pair3   pair2   pair1   pair0
//! ```
//!
//! The malleable bit is the most significant so that sorted downmix indexes
//! group all malleable outputs after the fixed ones.

/// What a single output pair carries
///
/// Discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelPair {
    Default = 0,
    LtRt,
    LpliiRplii,
    CntrlCntrr,
    LhighRhigh,
    LwideRwide,
    LrDualMono,
    Cntr,
    Lfe1,
    Lfe2,
    Chigh,
    Clowfront,
    CntrCsurr,
    CntrChigh,
    CntrTopsur,
    CntrChighrear,
    CntrClowfront,
    ChighTopsur,
    ChighChighrear,
    ChighClowfront,
    CntrLfe2,
    ChighLfe1,
    ChighLfe2,
    ClowfrontLfe1,
    ClowfrontLfe2,
    LsidesurrRsidesurr,
    LhighsideRhighside,
    LdirsurRdirsur,
    LhighrearRhighrear,
    Csurr,
    Topsur,
    CsurrTopsur,
    CsurrChigh,
    CsurrChighrear,
    CsurrClowfront,
    CsurrLfe1,
    CsurrLfe2,
    Chighrear,
    DstereoLsRs,
    NotConnected,
}

impl ChannelPair {
    /// Front left/right (shares its wire value with `Default`)
    pub const L_R: ChannelPair = ChannelPair::Default;
    /// Centre + LFE (shares its wire value with `Default`)
    pub const CNTR_LFE1: ChannelPair = ChannelPair::Default;
    /// Surround left/right (shares its wire value with `Default`)
    pub const LSUR_RSUR: ChannelPair = ChannelPair::Default;
    /// Rear surround left/right (shares its wire value with `Default`)
    pub const LSURREAR_RSURREAR: ChannelPair = ChannelPair::Default;

    const ALL: [ChannelPair; 40] = [
        ChannelPair::Default,
        ChannelPair::LtRt,
        ChannelPair::LpliiRplii,
        ChannelPair::CntrlCntrr,
        ChannelPair::LhighRhigh,
        ChannelPair::LwideRwide,
        ChannelPair::LrDualMono,
        ChannelPair::Cntr,
        ChannelPair::Lfe1,
        ChannelPair::Lfe2,
        ChannelPair::Chigh,
        ChannelPair::Clowfront,
        ChannelPair::CntrCsurr,
        ChannelPair::CntrChigh,
        ChannelPair::CntrTopsur,
        ChannelPair::CntrChighrear,
        ChannelPair::CntrClowfront,
        ChannelPair::ChighTopsur,
        ChannelPair::ChighChighrear,
        ChannelPair::ChighClowfront,
        ChannelPair::CntrLfe2,
        ChannelPair::ChighLfe1,
        ChannelPair::ChighLfe2,
        ChannelPair::ClowfrontLfe1,
        ChannelPair::ClowfrontLfe2,
        ChannelPair::LsidesurrRsidesurr,
        ChannelPair::LhighsideRhighside,
        ChannelPair::LdirsurRdirsur,
        ChannelPair::LhighrearRhighrear,
        ChannelPair::Csurr,
        ChannelPair::Topsur,
        ChannelPair::CsurrTopsur,
        ChannelPair::CsurrChigh,
        ChannelPair::CsurrChighrear,
        ChannelPair::CsurrClowfront,
        ChannelPair::CsurrLfe1,
        ChannelPair::CsurrLfe2,
        ChannelPair::Chighrear,
        ChannelPair::DstereoLsRs,
        ChannelPair::NotConnected,
    ];

    /// Decode a wire value
    pub fn from_wire(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Wire value of this pair
    pub fn wire(self) -> u8 {
        self as u8
    }

    /// Speakers fed by this pair as (front, back, lfe, misc)
    ///
    /// `Default` is position dependent and reports nothing here; see
    /// [`ChannelAssignment::count_speakers`].
    fn speakers(self) -> (u32, u32, u32, u32) {
        use ChannelPair::*;
        match self {
            Default | NotConnected => (0, 0, 0, 0),
            LtRt | LpliiRplii | CntrlCntrr | LhighRhigh | LwideRwide | LrDualMono => (2, 0, 0, 0),
            Cntr | Chigh | Clowfront | CntrChigh => (1, 0, 0, 0),
            Lfe1 | Lfe2 => (0, 0, 1, 0),
            CntrCsurr | CntrChighrear | ChighChighrear => (1, 1, 0, 0),
            CntrTopsur | ChighTopsur => (1, 0, 0, 1),
            CntrClowfront | ChighClowfront | DstereoLsRs => (2, 0, 0, 0),
            CntrLfe2 | ChighLfe1 | ChighLfe2 | ClowfrontLfe1 | ClowfrontLfe2 => (1, 0, 1, 0),
            LsidesurrRsidesurr | LhighsideRhighside => (0, 0, 0, 2),
            LdirsurRdirsur | LhighrearRhighrear => (0, 2, 0, 0),
            Csurr | Chighrear => (0, 1, 0, 0),
            Topsur => (0, 0, 0, 1),
            CsurrTopsur => (0, 1, 0, 1),
            CsurrChigh | CsurrChighrear | CsurrClowfront => (1, 0, 1, 0),
            CsurrLfe1 | CsurrLfe2 => (0, 1, 1, 0),
        }
    }
}

/// Speaker totals for a channel assignment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeakerCount {
    pub front: u32,
    pub back: u32,
    pub lfe: u32,
    pub misc: u32,
}

impl SpeakerCount {
    /// Total number of speakers
    pub fn total(&self) -> u32 {
        self.front + self.back + self.lfe + self.misc
    }
}

/// Five ordered channel pairs plus the malleable flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelAssignment {
    pub pairs: [ChannelPair; 5],
    /// Resolve the topology from content rather than from `pairs`
    pub malleable: bool,
}

impl ChannelAssignment {
    /// Number of pair slots
    pub const PAIRS: usize = 5;

    /// The malleable surface: every pair zero, malleable bit set
    pub const MALLEABLE: ChannelAssignment = ChannelAssignment {
        pairs: [ChannelPair::Default; 5],
        malleable: true,
    };

    /// All-zero assignment (every pair `Default`)
    pub const ZEROS: ChannelAssignment = ChannelAssignment {
        pairs: [ChannelPair::Default; 5],
        malleable: false,
    };

    /// Nothing connected anywhere
    pub const DISCONNECTED: ChannelAssignment = ChannelAssignment {
        pairs: [ChannelPair::NotConnected; 5],
        malleable: false,
    };

    /// Build from the first four pairs; pair 4 is left disconnected
    pub const fn from_pairs(
        p0: ChannelPair,
        p1: ChannelPair,
        p2: ChannelPair,
        p3: ChannelPair,
    ) -> Self {
        Self {
            pairs: [p0, p1, p2, p3, ChannelPair::NotConnected],
            malleable: false,
        }
    }

    /// Pack into the 32-bit wire layout
    pub fn encode(&self) -> u32 {
        let mut word = 0u32;
        for (i, pair) in self.pairs.iter().enumerate() {
            word |= (pair.wire() as u32 & 0x3f) << (i * 6);
        }
        if self.malleable {
            word |= 1 << 31;
        }
        word
    }

    /// Unpack from the 32-bit wire layout
    ///
    /// Returns `None` if any pair field holds an unknown value. The reserved
    /// bit is ignored.
    pub fn decode(word: u32) -> Option<Self> {
        let mut pairs = [ChannelPair::NotConnected; 5];
        for (i, pair) in pairs.iter_mut().enumerate() {
            *pair = ChannelPair::from_wire(((word >> (i * 6)) & 0x3f) as u8)?;
        }
        Some(Self {
            pairs,
            malleable: word & (1 << 31) != 0,
        })
    }

    /// Number of pairs that are not `NotConnected`
    pub fn connected_pairs(&self) -> usize {
        self.pairs
            .iter()
            .filter(|p| **p != ChannelPair::NotConnected)
            .count()
    }

    /// Count the speakers this assignment drives
    pub fn count_speakers(&self) -> SpeakerCount {
        let mut count = SpeakerCount::default();
        for (position, pair) in self.pairs.iter().enumerate() {
            if *pair == ChannelPair::Default {
                // interpreted differently based on position
                match position {
                    0 => count.front += 2,
                    1 => {
                        count.front += 1;
                        count.lfe += 1;
                    }
                    2 | 3 => count.back += 2,
                    _ => {}
                }
            } else {
                let (front, back, lfe, misc) = pair.speakers();
                count.front += front;
                count.back += back;
                count.lfe += lfe;
                count.misc += misc;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        assert_eq!(ChannelPair::Default.wire(), 0);
        assert_eq!(ChannelPair::Cntr.wire(), 7);
        assert_eq!(ChannelPair::DstereoLsRs.wire(), 38);
        assert_eq!(ChannelPair::NotConnected.wire(), 39);
        assert_eq!(ChannelPair::from_wire(39), Some(ChannelPair::NotConnected));
        assert_eq!(ChannelPair::from_wire(40), None);
    }

    #[test]
    fn test_encode_layout() {
        assert_eq!(ChannelAssignment::MALLEABLE.encode(), 0x8000_0000);
        assert_eq!(ChannelAssignment::ZEROS.encode(), 0);

        let stereo = ChannelAssignment::from_pairs(
            ChannelPair::L_R,
            ChannelPair::NotConnected,
            ChannelPair::NotConnected,
            ChannelPair::NotConnected,
        );
        let word = stereo.encode();
        assert_eq!(word & 0x3f, 0);
        assert_eq!((word >> 6) & 0x3f, 39);
        assert_eq!((word >> 24) & 0x3f, 39);
        assert_eq!(ChannelAssignment::decode(word), Some(stereo));
    }

    #[test]
    fn test_decode_rejects_unknown_pair() {
        assert!(ChannelAssignment::decode(0x3f).is_none());
    }

    #[test]
    fn test_count_speakers_default_by_position() {
        // 7.1 expressed entirely with Default pairs: L/R, C+LFE, Ls/Rs, Lsr/Rsr
        let mut seven_one = ChannelAssignment::ZEROS;
        seven_one.pairs[4] = ChannelPair::NotConnected;
        let count = seven_one.count_speakers();
        assert_eq!(count, SpeakerCount { front: 3, back: 4, lfe: 1, misc: 0 });
        assert_eq!(count.total(), 8);
    }

    #[test]
    fn test_count_speakers_explicit_pairs() {
        let assignment = ChannelAssignment::from_pairs(
            ChannelPair::LtRt,
            ChannelPair::Cntr,
            ChannelPair::Csurr,
            ChannelPair::CntrTopsur,
        );
        let count = assignment.count_speakers();
        assert_eq!(count, SpeakerCount { front: 4, back: 1, lfe: 0, misc: 1 });
    }
}
