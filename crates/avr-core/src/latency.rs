//! Audio/video latency synchronization
//!
//! Captured audio is timestamped with the local clock. The playback pipeline
//! runs on its own 33-bit, 90 kHz native time base. The synchronizer pins the
//! two together exactly once per input selection:
//!
//! ```text
//! native (90kHz, 33 bit)  <->  system (us) + target latency
//! ```
//!
//! A negative A/V offset (audio trails video) is folded into the native side
//! so the *video* path gets longer; the audio latency never drops below the
//! configured target.

use std::sync::Mutex;

use crate::error::{AvrError, AvrResult};

/// Width mask of the native time base
pub const NATIVE_TIME_MASK: u64 = 0x1_FFFF_FFFF;

/// Native time units per millisecond
pub const PES_UNITS_PER_MS: i64 = 90;

/// Allowed target latency range in milliseconds
pub const TARGET_LATENCY_RANGE_MS: std::ops::RangeInclusive<u32> = 20..=150;

/// Largest accepted compensatory latency in microseconds
pub const MAX_COMPENSATORY_LATENCY_US: i64 = 100_000;

/// An established native <-> system time correspondence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeMapping {
    /// Native stream time (90 kHz, masked to 33 bits)
    pub native: u64,
    /// System presentation time in microseconds, target latency included
    pub system_us: u64,
}

#[derive(Debug)]
struct SyncState {
    pending: bool,
    target_latency_ms: u32,
    av_offset: i64,
    compensatory_ms: u32,
    mapping: Option<TimeMapping>,
}

/// Latency bookkeeping shared between capture, control and the worker
#[derive(Debug)]
pub struct LatencySynchronizer {
    state: Mutex<SyncState>,
}

impl LatencySynchronizer {
    /// Create with the given target latency; no mapping is valid yet
    pub fn new(target_latency_ms: u32) -> Self {
        Self {
            state: Mutex::new(SyncState {
                pending: true,
                target_latency_ms,
                av_offset: 0,
                compensatory_ms: 0,
                mapping: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop the current mapping; the next `set_external_time_mapping` wins
    pub fn invalidate(&self) {
        let mut state = self.lock();
        state.pending = true;
        log::debug!("LatencySynchronizer: time mapping invalidated");
    }

    /// Whether a new mapping will be accepted
    pub fn is_pending(&self) -> bool {
        self.lock().pending
    }

    /// Pin `native_time` to `system_time_us` plus the target latency
    ///
    /// Only the first call after an invalidation has any effect; it returns
    /// the mapping that was established. Later calls return `None`.
    pub fn set_external_time_mapping(
        &self,
        native_time: u64,
        system_time_us: u64,
    ) -> Option<TimeMapping> {
        let mut state = self.lock();
        if !state.pending {
            return None;
        }
        state.pending = false;

        let system_us = system_time_us + state.target_latency_ms as u64 * 1000;

        let mut native = native_time as i64;
        if state.av_offset < 0 {
            log::trace!(
                "set_external_time_mapping: adjusting native time by {}",
                state.av_offset
            );
            native = native.wrapping_add(state.av_offset);
        }

        let mapping = TimeMapping {
            native: native as u64 & NATIVE_TIME_MASK,
            system_us,
        };
        state.mapping = Some(mapping);
        log::info!(
            "set_external_time_mapping: native {} <-> system {}us",
            mapping.native,
            mapping.system_us
        );
        Some(mapping)
    }

    /// The mapping currently in force, if any
    pub fn mapping(&self) -> Option<TimeMapping> {
        self.lock().mapping
    }

    pub fn target_latency_ms(&self) -> u32 {
        self.lock().target_latency_ms
    }

    /// Change the target latency (20..=150 ms)
    ///
    /// Out of range values are rejected and leave the current target in place.
    pub fn set_target_latency_ms(&self, ms: u32) -> AvrResult<()> {
        if !TARGET_LATENCY_RANGE_MS.contains(&ms) {
            return Err(AvrError::validation("target_latency_ms", ms, "20..=150"));
        }
        self.lock().target_latency_ms = ms;
        Ok(())
    }

    /// Current A/V offset in native units
    pub fn av_offset(&self) -> i64 {
        self.lock().av_offset
    }

    /// Record a new master latency
    ///
    /// Returns true if the A/V offset changed, in which case the mapping has
    /// been invalidated.
    pub fn update_master_latency(&self, master_latency_ms: i32) -> bool {
        let mut state = self.lock();
        let offset = master_latency_ms as i64 * PES_UNITS_PER_MS;
        if offset == state.av_offset {
            return false;
        }
        state.av_offset = offset;
        state.pending = true;
        true
    }

    /// Compensatory latency in whole milliseconds
    pub fn compensatory_latency_ms(&self) -> u32 {
        self.lock().compensatory_ms
    }

    /// Set the compensatory latency from a microsecond value
    ///
    /// Valid values (0..=100000 us) are rounded up to the next millisecond.
    /// Anything else resets the compensation to zero. Returns the value now
    /// in force.
    pub fn set_compensatory_latency_us(&self, micros: i64) -> u32 {
        let mut state = self.lock();
        if !(0..=MAX_COMPENSATORY_LATENCY_US).contains(&micros) {
            log::error!(
                "set_compensatory_latency_us: ignoring invalid compensatory latency ({})",
                micros
            );
            state.compensatory_ms = 0;
        } else {
            state.compensatory_ms = ((micros + 999) / 1000) as u32;
        }
        state.compensatory_ms
    }

    /// Log the latency budget currently configured
    pub fn disclose(&self, why: &str, master_latency_ms: i32, chain_latency_ms: &[i32]) {
        let state = self.lock();
        log::info!(
            "[{}] {}ms latency with {}ms Vsync compensation and {:?} extra per output",
            why,
            state.target_latency_ms as i64 + master_latency_ms.max(0) as i64,
            state.compensatory_ms,
            chain_latency_ms
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_mapping_wins() {
        let sync = LatencySynchronizer::new(50);
        let first = sync.set_external_time_mapping(1000, 2_000_000).unwrap();
        assert_eq!(first.system_us, 2_050_000);
        assert_eq!(first.native, 1000);

        assert!(sync.set_external_time_mapping(5000, 9_000_000).is_none());
        assert_eq!(sync.mapping(), Some(first));

        sync.invalidate();
        let second = sync.set_external_time_mapping(5000, 9_000_000).unwrap();
        assert_eq!(second.native, 5000);
    }

    #[test]
    fn test_round_trip_reproduces_system_time() {
        for target in [20, 57, 150] {
            let sync = LatencySynchronizer::new(target);
            let st = 123_456_789u64;
            sync.set_external_time_mapping(42, st).unwrap();
            let mapping = sync.mapping().unwrap();
            let recovered = mapping.system_us - sync.target_latency_ms() as u64 * 1000;
            assert!(recovered.abs_diff(st) <= 1000);
        }
    }

    #[test]
    fn test_negative_offset_moves_native_time() {
        let sync = LatencySynchronizer::new(40);
        assert!(sync.update_master_latency(-10));
        assert_eq!(sync.av_offset(), -900);
        let mapping = sync.set_external_time_mapping(10_000, 0).unwrap();
        assert_eq!(mapping.native, 9_100);
        assert_eq!(mapping.system_us, 40_000);
    }

    #[test]
    fn test_positive_offset_leaves_native_time() {
        let sync = LatencySynchronizer::new(40);
        sync.update_master_latency(10);
        let mapping = sync.set_external_time_mapping(10_000, 0).unwrap();
        assert_eq!(mapping.native, 10_000);
    }

    #[test]
    fn test_native_time_wraps_at_33_bits() {
        let sync = LatencySynchronizer::new(40);
        sync.update_master_latency(-1);
        let mapping = sync.set_external_time_mapping(10, 0).unwrap();
        assert_eq!(mapping.native, (10i64 - 90) as u64 & NATIVE_TIME_MASK);
        assert!(mapping.native <= NATIVE_TIME_MASK);
    }

    #[test]
    fn test_master_latency_invalidates_only_on_change() {
        let sync = LatencySynchronizer::new(40);
        sync.set_external_time_mapping(0, 0);
        assert!(!sync.update_master_latency(0));
        assert!(!sync.is_pending());
        assert!(sync.update_master_latency(100));
        assert!(sync.is_pending());
    }

    #[test]
    fn test_compensatory_latency() {
        let sync = LatencySynchronizer::new(40);
        assert_eq!(sync.set_compensatory_latency_us(1), 1);
        assert_eq!(sync.set_compensatory_latency_us(16_683), 17);
        assert_eq!(sync.set_compensatory_latency_us(100_000), 100);
        assert_eq!(sync.set_compensatory_latency_us(100_001), 0);
        assert_eq!(sync.set_compensatory_latency_us(-5), 0);
        assert_eq!(sync.compensatory_latency_ms(), 0);
    }

    #[test]
    fn test_target_latency_validation() {
        let sync = LatencySynchronizer::new(40);
        assert!(sync.set_target_latency_ms(19).is_err());
        assert!(sync.set_target_latency_ms(151).is_err());
        assert_eq!(sync.target_latency_ms(), 40);
        sync.set_target_latency_ms(150).unwrap();
        assert_eq!(sync.target_latency_ms(), 150);
    }
}
