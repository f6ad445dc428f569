//! Externally supplied mixer settings
//!
//! The settings are written by one external updater and read by every
//! audio context worker. Updates replace the whole value; readers take an
//! `Arc` snapshot under a short read lock and never see a half-written
//! update.

use std::sync::{Arc, RwLock};

use crate::error::{AvrError, AvrResult};
use crate::topology::ChannelAssignment;

/// Number of physical output chains
pub const MAX_OUTPUT_CHAINS: usize = 4;

/// Dynamic range compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrcSettings {
    pub enabled: bool,
    /// Cut scale factor, 0..=100 %
    pub cut: u8,
    /// Boost scale factor, 0..=100 %
    pub boost: u8,
}

/// One physical output chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputChain {
    pub enabled: bool,
    pub gain_db: i32,
    /// Extra delay for this output on top of the system latency
    pub latency_ms: i32,
    pub topology: ChannelAssignment,
}

impl Default for OutputChain {
    fn default() -> Self {
        Self {
            enabled: true,
            gain_db: 0,
            latency_ms: 0,
            topology: ChannelAssignment::MALLEABLE,
        }
    }
}

/// Mixer configuration as published by the mixer owner
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MixerSettings {
    /// Bumped by the publisher on every update
    pub version: u32,
    /// A/V offset; negative values delay video instead of audio
    pub master_latency_ms: i32,
    pub chains: Vec<OutputChain>,
    pub drc: DrcSettings,
}

impl MixerSettings {
    pub fn validate(&self) -> AvrResult<()> {
        if self.chains.len() > MAX_OUTPUT_CHAINS {
            return Err(AvrError::validation("chains", self.chains.len(), "at most 4 output chains"));
        }
        if self.drc.cut > 100 || self.drc.boost > 100 {
            return Err(AvrError::validation(
                "drc",
                format!("cut {} boost {}", self.drc.cut, self.drc.boost),
                "0..=100",
            ));
        }
        Ok(())
    }

    /// Same settings ignoring the version stamp
    pub fn same_as(&self, other: &MixerSettings) -> bool {
        self.master_latency_ms == other.master_latency_ms
            && self.chains == other.chains
            && self.drc == other.drc
    }

    /// Per-chain latencies, for latency disclosure
    pub fn chain_latencies(&self) -> Vec<i32> {
        self.chains.iter().map(|c| c.latency_ms).collect()
    }
}

/// Mixer settings shared between the updater and the workers
#[derive(Debug, Default)]
pub struct SharedMixer {
    current: RwLock<Arc<MixerSettings>>,
}

impl SharedMixer {
    pub fn new(settings: MixerSettings) -> Self {
        Self { current: RwLock::new(Arc::new(settings)) }
    }

    /// The settings in force right now
    pub fn snapshot(&self) -> Arc<MixerSettings> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Publish new settings
    ///
    /// Returns whether anything other than the version changed. Invalid
    /// settings are rejected and the current ones stay in force.
    pub fn replace(&self, settings: MixerSettings) -> AvrResult<bool> {
        settings.validate()?;
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let changed = !current.same_as(&settings);
        *current = Arc::new(settings);
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_is_wholesale() {
        let mixer = SharedMixer::new(MixerSettings {
            master_latency_ms: 100,
            ..Default::default()
        });
        let before = mixer.snapshot();

        let changed = mixer
            .replace(MixerSettings {
                version: 2,
                master_latency_ms: 60,
                ..Default::default()
            })
            .unwrap();
        assert!(changed);

        // an old snapshot is never touched by an update
        assert_eq!(before.master_latency_ms, 100);
        assert_eq!(mixer.snapshot().master_latency_ms, 60);
    }

    #[test]
    fn test_version_only_update_is_unchanged() {
        let mixer = SharedMixer::new(MixerSettings::default());
        let changed = mixer
            .replace(MixerSettings { version: 7, ..Default::default() })
            .unwrap();
        assert!(!changed);
        assert_eq!(mixer.snapshot().version, 7);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mixer = SharedMixer::new(MixerSettings::default());
        let too_many = MixerSettings {
            master_latency_ms: 5,
            chains: vec![OutputChain::default(); 5],
            ..Default::default()
        };
        assert!(mixer.replace(too_many).is_err());
        assert_eq!(mixer.snapshot().master_latency_ms, 0);

        let bad_drc = MixerSettings {
            drc: DrcSettings { enabled: true, cut: 101, boost: 0 },
            ..Default::default()
        };
        assert!(mixer.replace(bad_drc).is_err());
    }
}
