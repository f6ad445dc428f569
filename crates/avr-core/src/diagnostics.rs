//! Diagnostic attributes of an audio context
//!
//! Text in, text out, in the shape of the driver's sysfs attributes.

use std::sync::Arc;

use crate::context::AudioContext;
use crate::error::{AvrError, AvrResult};
use crate::fault::{Liveness, PostMortemReport};
use crate::format::{describe_input_format, is_supported, is_supported_in_game_mode};
use crate::mute::EmergencyMuteReason;
use crate::orchestrator::{number_channels, OrchestratorState};

/// Shown as the input format while a failed worker waits to be stopped
pub const WAITING_FOR_STOP: &str = "WAITING_FOR_STOP";

pub struct Diagnostics<'a> {
    context: &'a AudioContext,
}

impl<'a> Diagnostics<'a> {
    pub(crate) fn new(context: &'a AudioContext) -> Self {
        Self { context }
    }

    pub fn state(&self) -> OrchestratorState {
        self.context.state().status.state()
    }

    pub fn input_format(&self) -> String {
        let status = &self.context.state().status;
        if status.is_waiting_for_stop() {
            return WAITING_FOR_STOP.to_string();
        }
        describe_input_format(&status.decoder().spdif)
    }

    pub fn supported_input_format(&self) -> bool {
        let status = &self.context.state().status;
        is_supported(status.decoder().spdif.encoding, &status.capability())
    }

    pub fn supported_input_format_in_game_mode(&self) -> bool {
        let status = &self.context.state().status;
        let decoder = status.decoder();
        is_supported_in_game_mode(
            decoder.spdif.encoding,
            decoder.sampling_frequency.hz(),
            &status.capability(),
        )
    }

    pub fn decode_errors(&self) -> u64 {
        self.context.state().status.decode_errors()
    }

    pub fn reset_decode_errors(&self) {
        self.context.state().status.reset_decode_errors();
    }

    pub fn samples_processed(&self) -> u64 {
        self.context.state().status.samples_processed()
    }

    pub fn number_channels(&self) -> String {
        number_channels(&self.context.state().status.decoder())
    }

    /// Decoder sampling frequency in Hz
    pub fn sample_frequency(&self) -> u32 {
        self.context.state().status.decoder().sampling_frequency.hz()
    }

    pub fn emergency_mute(&self) -> &'static str {
        self.context.state().mute.reason().label()
    }

    /// Operator write: set or clear a user mute
    pub fn store_emergency_mute(&self, text: &str) -> AvrResult<()> {
        let reason = EmergencyMuteReason::parse_store(text)?;
        self.context.state().mute.set_reason(reason);
        self.context.instant_apply();
        Ok(())
    }

    /// Whether a post-mortem report has been issued
    ///
    /// A failure visible in the status blocks that the worker has not noticed
    /// yet is reported first.
    pub fn post_mortem(&self) -> bool {
        let state = self.context.state();
        if !state.fault.is_issued() && state.fault.check_liveness() == Liveness::Unresponsive {
            state.fault.force_diagnostics(Some(state.ledger.as_ref()));
        }
        state.fault.is_issued()
    }

    pub fn post_mortem_report(&self) -> Option<Arc<PostMortemReport>> {
        self.context.state().fault.report()
    }

    /// 'c' crashes the firmware, 'i'/'3' and '4' interrupt a CPU
    pub fn store_post_mortem(&self, text: &str) -> AvrResult<()> {
        match text.trim().chars().next() {
            Some('c') => {
                self.context.arm_crash();
                Ok(())
            }
            Some('i' | '3') => self.context.state().fault.raise_interrupt(3),
            Some('4') => self.context.state().fault.raise_interrupt(4),
            _ => Err(AvrError::validation("post_mortem", text.trim(), "c, i, 3 or 4")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandKind, TransformStatus};
    use crate::config::AvrConfig;
    use crate::fault::{ProcessingUnit, UnitStatus};
    use crate::format::{InputEncoding, SpdifStatus};
    use crate::frequency::SamplingFrequency;
    use crate::mixer::SharedMixer;
    use crate::sim::SimulatedCoprocessor;
    use crate::topology::{AudioMode, DownmixRom};
    use crate::command::Coprocessor;
    use std::time::{Duration, Instant};

    fn context(sim: &Arc<SimulatedCoprocessor>) -> AudioContext {
        AudioContext::new(
            1,
            &AvrConfig::default(),
            sim.clone(),
            Arc::new(SharedMixer::default()),
            Arc::new(DownmixRom::default()),
        )
        .unwrap()
    }

    fn wait_for(what: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if what() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_decoder_attributes_follow_run_completions() {
        let sim = Arc::new(SimulatedCoprocessor::new().hold(CommandKind::Run));
        let ctx = context(&sim);
        ctx.start().unwrap();
        assert!(wait_for(|| ctx.diagnostics().state() == OrchestratorState::Running));

        sim.complete_held_run(TransformStatus {
            samples: 512,
            sampling_frequency: SamplingFrequency::Fs48k,
            audio_mode: AudioMode::Mode32Lfe,
            spdif: SpdifStatus { encoding: InputEncoding::Ac3, ..Default::default() },
            ..Default::default()
        });

        let diag = ctx.diagnostics();
        assert!(wait_for(|| diag.samples_processed() == 512));
        assert_eq!(diag.input_format(), "AC3");
        assert!(diag.supported_input_format());
        assert!(diag.supported_input_format_in_game_mode());
        assert_eq!(diag.number_channels(), "3/2.1");
        assert_eq!(diag.sample_frequency(), 48_000);
        ctx.stop().unwrap();
    }

    #[test]
    fn test_failed_worker_reports_waiting_for_stop() {
        let sim = Arc::new(SimulatedCoprocessor::new().fail_init(-5));
        let ctx = context(&sim);
        ctx.start().unwrap();
        let diag = ctx.diagnostics();
        assert!(wait_for(|| diag.input_format() == WAITING_FOR_STOP));
        assert_eq!(diag.emergency_mute(), "Error");

        ctx.stop().unwrap();
        assert_ne!(diag.input_format(), WAITING_FOR_STOP);
    }

    #[test]
    fn test_emergency_mute_store() {
        let sim = Arc::new(SimulatedCoprocessor::new());
        let ctx = context(&sim);
        let diag = ctx.diagnostics();
        diag.store_emergency_mute("y").unwrap();
        assert_eq!(diag.emergency_mute(), "User");
        diag.store_emergency_mute("0").unwrap();
        assert_eq!(diag.emergency_mute(), "None");
        assert!(diag.store_emergency_mute("x").is_err());
        assert_eq!(diag.emergency_mute(), "None");
    }

    #[test]
    fn test_post_mortem_attribute() {
        let sim = Arc::new(SimulatedCoprocessor::new().with_status_blocks());
        let ctx = context(&sim);
        let diag = ctx.diagnostics();
        assert!(!diag.post_mortem());

        diag.store_post_mortem("4").unwrap();
        assert_eq!(sim.interrupts(), vec![4]);
        assert_eq!(
            sim.post_mortem(ProcessingUnit::Audio1).unwrap().status,
            UnitStatus::Trapped
        );
        assert!(diag.store_post_mortem("z").is_err());

        // the trapped unit is picked up on the next read
        assert!(diag.post_mortem());
        assert!(diag.post_mortem_report().is_some());
    }
}
