//! Deterministic in-process transform engine
//!
//! `SimulatedCoprocessor` implements [`Coprocessor`] without hardware. By
//! default it completes Configure and Run commands as soon as they are sent
//! and keeps exchange buffers until told otherwise. Tests can hold any
//! command kind and complete it explicitly, script decoder status, inject
//! send/init failures, refuse termination and expose crashable status
//! blocks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::command::{
    CommandId, CommandKind, CommandPayload, CommandRequest, CompletionEvent, CompletionNotifier,
    CompletionPayload, CompletionResult, Coprocessor, InitParams, SlotId, TransformStatus,
};
use crate::error::{AvrError, AvrResult};
use crate::fault::{PostMortemRecord, ProcessingUnit, UnitStatus};
use crate::format::DecoderCapability;
use crate::orchestrator::GlobalParams;

#[derive(Debug, Clone, Copy)]
struct Held {
    slot: SlotId,
    id: CommandId,
    kind: CommandKind,
}

#[derive(Default)]
struct SimState {
    held_kinds: HashSet<CommandKind>,
    notifier: Option<CompletionNotifier>,
    session_open: bool,
    /// Set by terminate, cleared by init
    terminated: bool,
    held: VecDeque<Held>,
    sent: Vec<CommandKind>,
    pending: HashMap<CommandKind, usize>,
    max_pending: HashMap<CommandKind, usize>,
    last_configure: Option<GlobalParams>,
    run_script: VecDeque<TransformStatus>,
    fail_next_send: Option<i32>,
    fail_init: Option<i32>,
    refuse_terminate: u32,
    terminate_attempts: u32,
    aborted: usize,
    status_blocks: Option<HashMap<ProcessingUnit, PostMortemRecord>>,
    interrupts: Vec<u32>,
    capability: DecoderCapability,
    run_period: Option<Duration>,
    init_params: Option<InitParams>,
}

impl SimState {
    fn finish(&mut self, kind: CommandKind) {
        if let Some(count) = self.pending.get_mut(&kind) {
            *count = count.saturating_sub(1);
        }
    }

    fn take_held(&mut self, kind: CommandKind) -> Option<Held> {
        let pos = self.held.iter().position(|h| h.kind == kind)?;
        let held = self.held.remove(pos)?;
        self.finish(kind);
        Some(held)
    }

    fn default_payload(&mut self, kind: CommandKind) -> CompletionPayload {
        match kind {
            CommandKind::Configure => CompletionPayload::None,
            CommandKind::Run => CompletionPayload::Run(self.run_script.pop_front().unwrap_or_default()),
            CommandKind::ExchangeBuffer => CompletionPayload::ExchangeBuffer { bytes: Vec::new() },
        }
    }
}

/// Software stand-in for the audio transform engine
#[derive(Clone, Default)]
pub struct SimulatedCoprocessor {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedCoprocessor {
    pub fn new() -> Self {
        let sim = Self::default();
        {
            let mut state = sim.lock();
            state.held_kinds.insert(CommandKind::ExchangeBuffer);
            state.capability = DecoderCapability {
                version: 0x0001_0000,
                dolby_digital: true,
                dts: true,
                mpeg: true,
            };
        }
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------------
    // Builders
    // ------------------------------------------------------------------------

    /// Keep commands of `kind` until completed explicitly
    pub fn hold(self, kind: CommandKind) -> Self {
        self.lock().held_kinds.insert(kind);
        self
    }

    pub fn hold_all(self) -> Self {
        self.hold(CommandKind::Configure)
            .hold(CommandKind::Run)
            .hold(CommandKind::ExchangeBuffer)
    }

    /// Complete the outstanding Run every `period` from an engine thread
    pub fn with_run_period(self, period: Duration) -> Self {
        {
            let mut state = self.lock();
            state.held_kinds.insert(CommandKind::Run);
            state.run_period = Some(period);
        }
        self
    }

    pub fn fail_init(self, code: i32) -> Self {
        self.lock().fail_init = Some(code);
        self
    }

    /// Refuse the next `times` terminate calls
    pub fn refuse_terminate(self, times: u32) -> Self {
        self.lock().refuse_terminate = times;
        self
    }

    /// Expose a running status block for every processing unit
    pub fn with_status_blocks(self) -> Self {
        let blocks = ProcessingUnit::ALL
            .iter()
            .map(|&unit| {
                (
                    unit,
                    PostMortemRecord {
                        release: "sim-1.0".to_string(),
                        build: format!("{} simulated build", unit.name()),
                        ..Default::default()
                    },
                )
            })
            .collect();
        self.lock().status_blocks = Some(blocks);
        self
    }

    /// Hide the status block of one unit
    pub fn without_status_block(self, unit: ProcessingUnit) -> Self {
        if let Some(blocks) = self.lock().status_blocks.as_mut() {
            blocks.remove(&unit);
        }
        self
    }

    pub fn with_capability(self, capability: DecoderCapability) -> Self {
        self.lock().capability = capability;
        self
    }

    // ------------------------------------------------------------------------
    // Runtime control
    // ------------------------------------------------------------------------

    /// Decoder status for upcoming Run completions
    pub fn script_run(&self, status: TransformStatus) {
        self.lock().run_script.push_back(status);
    }

    pub fn fail_next_send(&self, code: i32) {
        self.lock().fail_next_send = Some(code);
    }

    /// Put a unit's status block into the crashed state
    pub fn crash(&self, unit: ProcessingUnit, message: &str) {
        let mut state = self.lock();
        if let Some(record) = state.status_blocks.as_mut().and_then(|b| b.get_mut(&unit)) {
            record.status = UnitStatus::Crash;
            record.message = message.to_string();
            record.pc = 0x0804_1a2c;
            record.sp = 0x0ff0_0e40;
            record.link = 0x0804_19f0;
            record.psw = 0x0000_0021;
            record.registers[1] = 0xdead_beef;
            record.backtrace = vec![0x0804_1a2c, 0x0804_19f0, 0x0800_0400];
        }
    }

    pub fn complete_held(&self, kind: CommandKind) -> bool {
        self.complete_with(kind, None)
    }

    pub fn complete_held_run(&self, status: TransformStatus) -> bool {
        self.complete_with(CommandKind::Run, Some(CompletionPayload::Run(status)))
    }

    pub fn complete_held_buffer(&self, bytes: Vec<u8>) -> bool {
        self.complete_with(
            CommandKind::ExchangeBuffer,
            Some(CompletionPayload::ExchangeBuffer { bytes }),
        )
    }

    fn complete_with(&self, kind: CommandKind, payload: Option<CompletionPayload>) -> bool {
        let (notifier, event) = {
            let mut state = self.lock();
            let Some(held) = state.take_held(kind) else {
                return false;
            };
            let payload = payload.unwrap_or_else(|| state.default_payload(kind));
            let event = CompletionEvent {
                slot: held.slot,
                id: held.id,
                kind,
                result: CompletionResult::Success,
                payload,
            };
            (state.notifier.clone(), event)
        };
        if let Some(notifier) = notifier {
            let _ = notifier.complete(event);
        }
        true
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn sent_count(&self, kind: CommandKind) -> usize {
        self.lock().sent.iter().filter(|k| **k == kind).count()
    }

    pub fn sent_kinds(&self) -> Vec<CommandKind> {
        self.lock().sent.clone()
    }

    /// Most commands of `kind` the engine ever held at once
    pub fn max_pending(&self, kind: CommandKind) -> usize {
        self.lock().max_pending.get(&kind).copied().unwrap_or(0)
    }

    pub fn last_configure(&self) -> Option<GlobalParams> {
        self.lock().last_configure.clone()
    }

    pub fn init_params(&self) -> Option<InitParams> {
        self.lock().init_params.clone()
    }

    pub fn aborted_count(&self) -> usize {
        self.lock().aborted
    }

    pub fn terminate_attempts(&self) -> u32 {
        self.lock().terminate_attempts
    }

    pub fn interrupts(&self) -> Vec<u32> {
        self.lock().interrupts.clone()
    }

    pub fn is_session_open(&self) -> bool {
        self.lock().session_open
    }

    fn spawn_engine(&self, period: Duration) -> AvrResult<()> {
        let sim = self.clone();
        thread::Builder::new()
            .name("sim-engine".into())
            .spawn(move || loop {
                thread::sleep(period);
                if !sim.is_session_open() {
                    break;
                }
                sim.complete_held(CommandKind::Run);
            })?;
        Ok(())
    }
}

impl Coprocessor for SimulatedCoprocessor {
    fn capability(&self) -> AvrResult<DecoderCapability> {
        Ok(self.lock().capability)
    }

    fn init(&self, params: &InitParams, notifier: CompletionNotifier) -> AvrResult<()> {
        let period = {
            let mut state = self.lock();
            if let Some(code) = state.fail_init.take() {
                return Err(AvrError::Transport { operation: "init", code });
            }
            state.notifier = Some(notifier);
            state.session_open = true;
            state.terminated = false;
            state.init_params = Some(params.clone());
            state.run_period
        };
        log::debug!("sim: session opened for input {}", params.input_id);

        if let Some(period) = period {
            self.spawn_engine(period)?;
        }
        Ok(())
    }

    fn send(&self, request: &CommandRequest<'_>) -> AvrResult<()> {
        let (notifier, event) = {
            let mut state = self.lock();
            if let Some(code) = state.fail_next_send.take() {
                return Err(AvrError::Transport { operation: "send", code });
            }
            if state.terminated {
                return Err(AvrError::Transport { operation: "send", code: -19 });
            }

            state.sent.push(request.kind);
            let pending = {
                let count = state.pending.entry(request.kind).or_insert(0);
                *count += 1;
                *count
            };
            let max = state.max_pending.entry(request.kind).or_insert(0);
            *max = (*max).max(pending);

            if let CommandPayload::Configure(params) = request.payload {
                state.last_configure = Some((**params).clone());
            }

            if state.held_kinds.contains(&request.kind) {
                state.held.push_back(Held {
                    slot: request.slot,
                    id: request.id,
                    kind: request.kind,
                });
                return Ok(());
            }

            state.finish(request.kind);
            let payload = state.default_payload(request.kind);
            let event = CompletionEvent {
                slot: request.slot,
                id: request.id,
                kind: request.kind,
                result: CompletionResult::Success,
                payload,
            };
            (state.notifier.clone(), event)
        };

        if let Some(notifier) = notifier {
            let _ = notifier.complete(event);
        }
        Ok(())
    }

    fn abort(&self, id: CommandId) -> AvrResult<()> {
        let (notifier, event) = {
            let mut state = self.lock();
            let Some(pos) = state.held.iter().position(|h| h.id == id) else {
                return Ok(());
            };
            let Some(held) = state.held.remove(pos) else {
                return Ok(());
            };
            state.finish(held.kind);
            state.aborted += 1;
            let event = CompletionEvent {
                slot: held.slot,
                id: held.id,
                kind: held.kind,
                result: CompletionResult::Aborted,
                payload: CompletionPayload::None,
            };
            (state.notifier.clone(), event)
        };

        if let Some(notifier) = notifier {
            let _ = notifier.complete(event);
        }
        Ok(())
    }

    fn terminate(&self) -> AvrResult<()> {
        let mut state = self.lock();
        state.terminate_attempts += 1;
        if state.refuse_terminate > 0 {
            state.refuse_terminate -= 1;
            return Err(AvrError::Transport { operation: "terminate", code: -16 });
        }
        if !state.held.is_empty() {
            return Err(AvrError::Transport { operation: "terminate", code: -16 });
        }
        state.session_open = false;
        state.terminated = true;
        state.notifier = None;
        Ok(())
    }

    fn post_mortem(&self, unit: ProcessingUnit) -> Option<PostMortemRecord> {
        self.lock().status_blocks.as_ref()?.get(&unit).cloned()
    }

    fn raise_interrupt(&self, cpu: u32) -> AvrResult<()> {
        let mut state = self.lock();
        state.interrupts.push(cpu);
        if let Some(blocks) = state.status_blocks.as_mut() {
            for (unit, record) in blocks.iter_mut() {
                if unit.interrupt_cpu() == cpu && record.status == UnitStatus::Running {
                    record.status = UnitStatus::Trapped;
                    record.message = "stopped by host interrupt".to_string();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandChannel, CommandLedger, CommandState};
    use crossbeam::channel::unbounded;

    fn open(sim: &Arc<SimulatedCoprocessor>) -> (CommandChannel, crossbeam::channel::Receiver<CompletionEvent>) {
        let ledger = CommandLedger::new(0);
        let (tx, rx) = unbounded();
        let params = InitParams {
            input_id: 0,
            hdmi_layout: Default::default(),
            channel_select: Default::default(),
            silence_threshold_db: -80,
            silence_duration_ms: 1000,
            command_slots: 2,
        };
        sim.init(&params, CompletionNotifier::new(ledger.clone(), tx)).unwrap();
        (CommandChannel::new(ledger, sim.clone()), rx)
    }

    #[test]
    fn test_auto_completion() {
        let sim = Arc::new(SimulatedCoprocessor::new());
        let (mut channel, rx) = open(&sim);
        sim.script_run(TransformStatus { samples: 7, ..Default::default() });
        channel.submit(SlotId::RUN, CommandPayload::Run).unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, CommandKind::Run);
        assert!(matches!(event.payload, CompletionPayload::Run(TransformStatus { samples: 7, .. })));
        assert_eq!(channel.ledger().state(SlotId::RUN), CommandState::Completed);
    }

    #[test]
    fn test_abort_and_terminate() {
        let sim = Arc::new(SimulatedCoprocessor::new().hold_all());
        let (mut channel, rx) = open(&sim);
        channel.submit(SlotId::RUN, CommandPayload::Run).unwrap();
        assert!(sim.terminate().is_err());

        channel.abort_all();
        assert_eq!(rx.try_recv().unwrap().result, CompletionResult::Aborted);
        sim.terminate().unwrap();
        assert!(!sim.is_session_open());
        assert!(channel.submit(SlotId::RUN, CommandPayload::Run).is_err());
    }

    #[test]
    fn test_interrupt_traps_running_unit() {
        let sim = SimulatedCoprocessor::new().with_status_blocks();
        sim.raise_interrupt(3).unwrap();
        assert_eq!(
            sim.post_mortem(ProcessingUnit::Audio0).unwrap().status,
            UnitStatus::Trapped
        );
        assert_eq!(
            sim.post_mortem(ProcessingUnit::Audio1).unwrap().status,
            UnitStatus::Running
        );
    }
}
