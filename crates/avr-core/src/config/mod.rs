//! Driver configuration
//!
//! One YAML file holds the audio input options, the latency targets, the
//! driver timing knobs and the log-buffer setup. Every section defaults, so a
//! partial file loads fine. A file whose values fail [`AvrConfig::validate`]
//! is ignored as a whole.
//!
//! ```ignore
//! use avr_core::config::{default_config_path, load_config};
//!
//! let config = load_config(&default_config_path());
//! ```

mod io;

pub use io::{default_config_path, load_config, read_config, save_config};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AvrError, AvrResult};
use crate::latency::{MAX_COMPENSATORY_LATENCY_US, TARGET_LATENCY_RANGE_MS};

/// HDMI input channel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HdmiLayout {
    /// Stereo only
    #[default]
    Layout0,
    /// Up to eight channels of PCM
    Layout1,
    /// High bit-rate compressed audio
    Layout2,
}

/// Which channels of a stereo or dual-mono source are played
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelSelect {
    #[default]
    Stereo,
    MonoLeft,
    MonoRight,
}

/// Audio input options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// De-emphasis on PCM inputs
    pub emphasis: bool,
    pub hdmi_layout: HdmiLayout,
    pub channel_select: ChannelSelect,
    /// Silence detection threshold, -96..=0 dB
    pub silence_threshold_db: i32,
    /// How long the input must stay below the threshold
    pub silence_duration_ms: u32,
    pub aac_decode: bool,
    /// Physical input: 0 is the stereo line input, 1 the 8 channel HDMI input
    pub input: u8,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            emphasis: false,
            hdmi_layout: HdmiLayout::Layout0,
            channel_select: ChannelSelect::Stereo,
            silence_threshold_db: -80,
            silence_duration_ms: 1000,
            aac_decode: false,
            input: 0,
        }
    }
}

/// Latency targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// End-to-end audio latency, 20..=150 ms
    pub target_ms: u32,
    /// Vsync compensation, 0..=100000 us
    pub compensatory_us: i64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self { target_ms: 40, compensatory_us: 0 }
    }
}

/// Worker timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Worker wait before a liveness check
    pub wait_timeout_ms: u64,
    /// How long `stop` waits for the worker to exit
    pub stop_timeout_ms: u64,
    pub terminate_retries: u32,
    /// Wait between terminate attempts
    pub terminate_wait_ms: u64,
    /// Grace period for trapped units during diagnostics
    pub trap_grace_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 5000,
            stop_timeout_ms: 1000,
            terminate_retries: 8,
            terminate_wait_ms: 100,
            trap_grace_ms: 100,
        }
    }
}

impl DriverConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn terminate_wait(&self) -> Duration {
        Duration::from_millis(self.terminate_wait_ms)
    }

    pub fn trap_grace(&self) -> Duration {
        Duration::from_millis(self.trap_grace_ms)
    }
}

/// Coprocessor log taps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub input: bool,
    pub output: bool,
    pub buffers_per_stream: usize,
    pub buffer_size: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            input: false,
            output: false,
            buffers_per_stream: 4,
            buffer_size: 4096,
        }
    }
}

impl LoggingConfig {
    /// Number of enabled log streams
    pub fn streams(&self) -> usize {
        self.input as usize + self.output as usize
    }

    /// Total exchange buffers needed
    pub fn buffer_count(&self) -> usize {
        self.streams() * self.buffers_per_stream
    }
}

/// Complete driver configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvrConfig {
    pub audio: AudioConfig,
    pub latency: LatencyConfig,
    pub driver: DriverConfig,
    pub logging: LoggingConfig,
}

impl AvrConfig {
    /// Check every field against its allowed range
    pub fn validate(&self) -> AvrResult<()> {
        validate_silence_threshold(self.audio.silence_threshold_db)?;
        validate_input(self.audio.input)?;

        if !TARGET_LATENCY_RANGE_MS.contains(&self.latency.target_ms) {
            return Err(AvrError::validation("target_ms", self.latency.target_ms, "20..=150"));
        }
        if !(0..=MAX_COMPENSATORY_LATENCY_US).contains(&self.latency.compensatory_us) {
            return Err(AvrError::validation(
                "compensatory_us",
                self.latency.compensatory_us,
                "0..=100000",
            ));
        }

        if self.driver.terminate_retries == 0 {
            return Err(AvrError::validation("terminate_retries", 0, ">= 1"));
        }
        if self.driver.wait_timeout_ms == 0 {
            return Err(AvrError::validation("wait_timeout_ms", 0, "> 0"));
        }

        if self.logging.streams() > 0 && self.logging.buffers_per_stream == 0 {
            return Err(AvrError::validation("buffers_per_stream", 0, ">= 1"));
        }
        if self.logging.streams() > 0 && self.logging.buffer_size == 0 {
            return Err(AvrError::validation("buffer_size", 0, "> 0"));
        }
        Ok(())
    }
}

pub fn validate_silence_threshold(db: i32) -> AvrResult<()> {
    if !(-96..=0).contains(&db) {
        return Err(AvrError::validation("silence_threshold_db", db, "-96..=0"));
    }
    Ok(())
}

pub fn validate_input(input: u8) -> AvrResult<()> {
    if input > 1 {
        return Err(AvrError::validation("input", input, "0 or 1"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AvrConfig::default();
        config.validate().unwrap();
        assert_eq!(config.driver.wait_timeout(), Duration::from_secs(5));
        assert_eq!(config.driver.terminate_retries, 8);
        assert_eq!(config.logging.buffer_count(), 0);
    }

    #[test]
    fn test_ranges() {
        let mut config = AvrConfig::default();
        config.audio.silence_threshold_db = -97;
        assert!(config.validate().is_err());
        config.audio.silence_threshold_db = 0;
        config.validate().unwrap();

        config.latency.target_ms = 151;
        assert!(config.validate().is_err());
        config.latency.target_ms = 20;
        config.latency.compensatory_us = 100_001;
        assert!(config.validate().is_err());
        config.latency.compensatory_us = 100_000;
        config.validate().unwrap();

        config.audio.input = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_count() {
        let mut logging = LoggingConfig::default();
        logging.input = true;
        logging.output = true;
        assert_eq!(logging.buffer_count(), 8);
    }
}
