//! Capture injection
//!
//! Takes blocks of captured PCM with their capture timestamps, works out the
//! real sample rate from consecutive timestamps, stamps each block with a
//! latency-compensated presentation time and hands it to the playback
//! collaborator.
//!
//! ```text
//! capture ──block──▶ CaptureInjector ──Presentation{pts}──▶ PlaybackSink
//!                          │
//!                          └──first mapping──▶ LatencySynchronizer
//! ```
//!
//! A rate can only be measured once two blocks have been seen, so the first
//! block after (re)start is held back and emitted together with the second.

use std::sync::Arc;

use crate::error::AvrResult;
use crate::frequency::{is_capture_rate_supported, snap_sample_rate};
use crate::latency::{LatencySynchronizer, NATIVE_TIME_MASK};
use crate::mute::{EmergencyMute, EmergencyMuteReason};

/// One period of captured audio
#[derive(Debug, Clone)]
pub struct CaptureBlock {
    pub data: Vec<u8>,
    /// Frames in this period
    pub frames: u32,
    /// Local clock when the period was read, in microseconds
    pub timestamp_us: u64,
    /// Frames still queued in the capture device at `timestamp_us`
    pub delay_frames: i64,
}

/// Audio ready for the playback pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presentation {
    /// Presentation time in 90 kHz units, 33 bits
    pub pts: u64,
    pub sample_rate: u32,
    pub data: Vec<u8>,
}

/// Receives stamped audio from the injector
pub trait PlaybackSink: Send {
    fn present(&mut self, presentation: Presentation) -> AvrResult<()>;
}

struct PreviousBlock {
    timestamp_us: u64,
    delay_frames: i64,
    frames: u32,
    /// Still waiting to be emitted
    held: Option<Vec<u8>>,
}

/// Stamps captured blocks and forwards them to a [`PlaybackSink`]
pub struct CaptureInjector<S: PlaybackSink> {
    sync: Arc<LatencySynchronizer>,
    mute: Arc<EmergencyMute>,
    sink: S,
    previous: Option<PreviousBlock>,
    rate: Option<u32>,
    candidate: Option<u32>,
}

impl<S: PlaybackSink> CaptureInjector<S> {
    pub fn new(sync: Arc<LatencySynchronizer>, mute: Arc<EmergencyMute>, sink: S) -> Self {
        Self {
            sync,
            mute,
            sink,
            previous: None,
            rate: None,
            candidate: None,
        }
    }

    /// Committed sample rate, if one has been measured
    pub fn sample_rate(&self) -> Option<u32> {
        self.rate
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Forget timing history, e.g. after a capture overrun
    pub fn reset(&mut self) {
        self.previous = None;
        self.candidate = None;
    }

    /// Process one captured block
    ///
    /// Returns the number of presentations handed to the sink.
    pub fn push(&mut self, block: CaptureBlock) -> AvrResult<usize> {
        let Some(mut previous) = self.previous.take() else {
            self.previous = Some(PreviousBlock {
                timestamp_us: block.timestamp_us,
                delay_frames: block.delay_frames,
                frames: block.frames,
                held: Some(block.data),
            });
            return Ok(0);
        };

        if let Some(measured) = measure_rate(&previous, &block) {
            self.observe_rate(measured);
        } else {
            log::warn!(
                "push: cannot measure rate ({}us -> {}us)",
                previous.timestamp_us,
                block.timestamp_us
            );
        }

        let mut emitted = 0;
        match self.rate {
            Some(rate) if is_capture_rate_supported(rate) => {
                if let Some(data) = previous.held.take() {
                    self.emit(rate, previous.timestamp_us, previous.delay_frames, data)?;
                    emitted += 1;
                }
                self.emit(rate, block.timestamp_us, block.delay_frames, block.data)?;
                emitted += 1;
            }
            Some(rate) => {
                log::trace!("push: dropping block at unsupported rate {}", rate);
            }
            None => {}
        }

        self.previous = Some(PreviousBlock {
            timestamp_us: block.timestamp_us,
            delay_frames: block.delay_frames,
            frames: block.frames,
            held: None,
        });
        Ok(emitted)
    }

    fn observe_rate(&mut self, measured: u32) {
        let snapped = snap_sample_rate(measured);
        match self.rate {
            None => {
                log::info!("observe_rate: sample rate {} (measured {})", snapped, measured);
                self.rate = Some(snapped);
                self.candidate = None;
            }
            Some(current) if current == snapped => {
                self.candidate = None;
            }
            Some(current) => {
                if self.candidate != Some(snapped) {
                    // wait for a second consistent measurement
                    log::debug!("observe_rate: possible change {} -> {}", current, snapped);
                    self.candidate = Some(snapped);
                    return;
                }

                log::info!("observe_rate: new sample rate {} (was {})", snapped, current);
                self.rate = Some(snapped);
                self.candidate = None;

                // rates measured across an overrun are not trustworthy
                if self.mute.reason() != EmergencyMuteReason::Error {
                    self.mute.deploy(EmergencyMuteReason::SampleRateChange);
                }
            }
        }
    }

    fn emit(&mut self, rate: u32, timestamp_us: u64, delay_frames: i64, data: Vec<u8>) -> AvrResult<()> {
        let delay_us = (delay_frames.max(0) as u64 * 1_000_000) / rate as u64;
        let absolute_us = timestamp_us.saturating_sub(delay_us);
        let pts = (absolute_us * 90) / 1000;
        let native = pts & NATIVE_TIME_MASK;

        self.sync.set_external_time_mapping(native, absolute_us);

        self.sink.present(Presentation {
            pts: native,
            sample_rate: rate,
            data,
        })
    }
}

fn measure_rate(previous: &PreviousBlock, block: &CaptureBlock) -> Option<u32> {
    let elapsed_us = block.timestamp_us.checked_sub(previous.timestamp_us)?;
    if elapsed_us == 0 {
        return None;
    }
    let frames = previous.frames as i64 - previous.delay_frames + block.delay_frames;
    if frames <= 0 {
        return None;
    }
    Some(((frames as u64 * 1_000_000) / elapsed_us) as u32)
}
