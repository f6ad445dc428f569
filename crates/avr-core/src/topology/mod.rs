//! Channel topology resolution
//!
//! Stateless translation between channel assignments, named audio modes and
//! downmix coefficient tables.

mod downmix;
mod modes;
mod pairs;

pub use downmix::{
    lookup_downmix, CoefficientTable, DownmixIndexEntry, DownmixResolution, DownmixRom,
    DMIX_CHANNELS, Q15_UNITY,
};
pub use modes::{assignment_to_mode, mode_to_assignment, AudioMode};
pub use pairs::{ChannelAssignment, ChannelPair, SpeakerCount};
