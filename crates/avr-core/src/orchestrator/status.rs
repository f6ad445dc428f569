//! Observables published by the worker
//!
//! The worker is the only writer. Diagnostics read from any thread, so the
//! counters are atomics and the decoder snapshot sits behind a short mutex.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::command::{LimiterState, TransformStatus};
use crate::format::{DecoderCapability, SpdifStatus};
use crate::frequency::SamplingFrequency;
use crate::topology::{mode_to_assignment, AudioMode};

/// Lifecycle of the transform orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OrchestratorState {
    Uninitialized = 0,
    Initializing = 1,
    Running = 2,
    Stopping = 3,
    Terminated = 4,
}

impl OrchestratorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => OrchestratorState::Initializing,
            2 => OrchestratorState::Running,
            3 => OrchestratorState::Stopping,
            4 => OrchestratorState::Terminated,
            _ => OrchestratorState::Uninitialized,
        }
    }
}

/// What the decoder last reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderSnapshot {
    pub spdif: SpdifStatus,
    pub sampling_frequency: SamplingFrequency,
    pub audio_mode: AudioMode,
    pub limiter: LimiterState,
}

impl Default for DecoderSnapshot {
    fn default() -> Self {
        let status = TransformStatus::default();
        Self {
            spdif: status.spdif,
            sampling_frequency: status.sampling_frequency,
            audio_mode: status.audio_mode,
            limiter: status.limiter,
        }
    }
}

/// Differences between a Run completion and the stored snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusChange {
    /// Silence, state, encoding or display bits changed
    pub codec: bool,
    /// The limiter left its emergency mute
    pub mute: bool,
    pub frequency: bool,
    pub topology: bool,
}

impl StatusChange {
    pub fn any(&self) -> bool {
        self.codec || self.mute || self.frequency || self.topology
    }
}

#[derive(Debug)]
pub struct StatusBoard {
    state: AtomicU8,
    waiting_for_stop: AtomicBool,
    decoder: Mutex<DecoderSnapshot>,
    capability: Mutex<DecoderCapability>,
    decode_errors: AtomicU64,
    samples_processed: AtomicU64,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(OrchestratorState::Uninitialized as u8),
            waiting_for_stop: AtomicBool::new(false),
            decoder: Mutex::new(DecoderSnapshot::default()),
            capability: Mutex::new(DecoderCapability::default()),
            decode_errors: AtomicU64::new(0),
            samples_processed: AtomicU64::new(0),
        }
    }
}

impl StatusBoard {
    pub fn state(&self) -> OrchestratorState {
        OrchestratorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: OrchestratorState) {
        let previous = self.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            log::info!(
                "orchestrator: {:?} -> {:?}",
                OrchestratorState::from_u8(previous),
                state
            );
        }
    }

    /// The worker has failed and is parked until it is stopped
    pub fn is_waiting_for_stop(&self) -> bool {
        self.waiting_for_stop.load(Ordering::Acquire)
    }

    pub(crate) fn set_waiting_for_stop(&self, waiting: bool) {
        self.waiting_for_stop.store(waiting, Ordering::Release);
    }

    pub fn decoder(&self) -> DecoderSnapshot {
        *self.decoder.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capability(&self) -> DecoderCapability {
        *self.capability.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_capability(&self, capability: DecoderCapability) {
        *self.capability.lock().unwrap_or_else(|e| e.into_inner()) = capability;
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn reset_decode_errors(&self) {
        self.decode_errors.store(0, Ordering::Relaxed);
    }

    pub fn samples_processed(&self) -> u64 {
        self.samples_processed.load(Ordering::Relaxed)
    }

    /// Forget everything the previous session reported
    pub(crate) fn reset(&self) {
        *self.decoder.lock().unwrap_or_else(|e| e.into_inner()) = DecoderSnapshot::default();
        self.decode_errors.store(0, Ordering::Relaxed);
        self.samples_processed.store(0, Ordering::Relaxed);
        self.waiting_for_stop.store(false, Ordering::Release);
    }

    /// Account for a Run completion and store any changed properties
    pub(crate) fn record(&self, status: &TransformStatus) -> StatusChange {
        if status.decode_ok {
            self.samples_processed
                .fetch_add(status.samples as u64, Ordering::Relaxed);
        } else {
            self.decode_errors.fetch_add(1, Ordering::Relaxed);
        }

        let mut current = self.decoder.lock().unwrap_or_else(|e| e.into_inner());
        let old = current.spdif;
        let new = status.spdif;

        let change = StatusChange {
            codec: old.silence != new.silence
                || old.state != new.state
                || old.encoding != new.encoding
                || old.display != new.display,
            mute: current.limiter == LimiterState::EmergencyMuted
                && status.limiter != LimiterState::EmergencyMuted,
            frequency: current.sampling_frequency != status.sampling_frequency,
            topology: current.audio_mode != status.audio_mode,
        };

        current.limiter = status.limiter;
        if change.any() {
            current.spdif = status.spdif;
            current.sampling_frequency = status.sampling_frequency;
            current.audio_mode = status.audio_mode;
        }
        change
    }
}

/// Channel count in "front/back.lfe" form
///
/// Counts reported by the S/PDIF front end are used when they add up to a
/// plausible total; otherwise they are derived from the decoder's mode.
pub fn number_channels(snapshot: &DecoderSnapshot) -> String {
    if snapshot.audio_mode == AudioMode::Mode1p1 {
        return "1+1/0.0".to_string();
    }

    let spdif = &snapshot.spdif;
    let total = spdif.front as u32 + spdif.rear as u32 + spdif.lfe as u32;
    let (front, back, lfe) = if (1..=8).contains(&total) {
        (spdif.front as u32, spdif.rear as u32, spdif.lfe as u32)
    } else {
        let count = mode_to_assignment(snapshot.audio_mode).count_speakers();
        (count.front, count.back + count.misc, count.lfe)
    };
    format!("{}/{}.{}", front, back, lfe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{InputEncoding, SpdifState};

    fn status() -> TransformStatus {
        TransformStatus { samples: 256, ..Default::default() }
    }

    #[test]
    fn test_counters() {
        let board = StatusBoard::default();
        board.record(&status());
        board.record(&TransformStatus { decode_ok: false, ..status() });
        assert_eq!(board.samples_processed(), 256);
        assert_eq!(board.decode_errors(), 1);
        board.reset_decode_errors();
        assert_eq!(board.decode_errors(), 0);
    }

    #[test]
    fn test_change_detection() {
        let board = StatusBoard::default();
        assert!(!board.record(&status()).any());

        let mut next = status();
        next.spdif.encoding = InputEncoding::Ac3;
        next.spdif.state = SpdifState::CompressedBypass;
        let change = board.record(&next);
        assert!(change.codec && !change.frequency && !change.topology);
        assert_eq!(board.decoder().spdif.encoding, InputEncoding::Ac3);

        next.sampling_frequency = SamplingFrequency::Fs44k1;
        next.audio_mode = AudioMode::Mode32Lfe;
        let change = board.record(&next);
        assert!(change.frequency && change.topology && !change.codec);
        assert_eq!(board.decoder().audio_mode, AudioMode::Mode32Lfe);
    }

    #[test]
    fn test_mute_release_is_a_change() {
        let board = StatusBoard::default();
        board.record(&TransformStatus { limiter: LimiterState::EmergencyMuted, ..status() });
        let change = board.record(&status());
        assert!(change.mute);
        assert!(!board.record(&status()).mute);
    }

    #[test]
    fn test_number_channels() {
        let mut snapshot = DecoderSnapshot { audio_mode: AudioMode::Mode1p1, ..Default::default() };
        assert_eq!(number_channels(&snapshot), "1+1/0.0");

        snapshot.audio_mode = AudioMode::Mode32Lfe;
        assert_eq!(number_channels(&snapshot), "3/2.1");

        snapshot.spdif.front = 2;
        snapshot.spdif.rear = 0;
        snapshot.spdif.lfe = 0;
        assert_eq!(number_channels(&snapshot), "2/0.0");

        snapshot.spdif.front = 9;
        assert_eq!(number_channels(&snapshot), "3/2.1");
    }

    #[test]
    fn test_state_round_trip() {
        let board = StatusBoard::default();
        assert_eq!(board.state(), OrchestratorState::Uninitialized);
        board.set_state(OrchestratorState::Running);
        assert_eq!(board.state(), OrchestratorState::Running);
    }
}
