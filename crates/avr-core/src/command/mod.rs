//! Asynchronous command slots
//!
//! Every audio context owns a fixed set of command slots, one per class of
//! operation: a Configure slot, a Run slot and one ExchangeBuffer slot per
//! log buffer. A slot holds at most one outstanding command.
//!
//! ## Architecture
//!
//! ```text
//!   worker thread                              transport context
//!  ┌────────────────────┐                    ┌────────────────────┐
//!  │ CommandChannel     │ send(request) ───▶ │ Coprocessor        │
//!  │  payloads[slot]    │                    │                    │
//!  └────────┬───────────┘                    └─────────┬──────────┘
//!           │ claim / revert                           │ complete(event)
//!           ▼                                          ▼
//!  ┌─────────────────────────────────────────────────────────────┐
//!  │ CommandLedger (Arc)  state/id per slot, in-flight counter   │
//!  └─────────────────────────────────────────────────────────────┘
//!                                                      │
//!                         crossbeam channel ◀──────────┘
//!                         (CompletionEvent, drained by the worker)
//! ```
//!
//! The ledger is the only state touched from both sides and is made of
//! atomics. Payloads (including buffer leases) never leave the worker: they
//! sit in `CommandChannel::payloads` until the ledger shows the command has
//! completed, and only then can they be taken back.

mod payload;
mod transport;

pub use payload::{
    CommandPayload, CompletionPayload, LimiterState, LogStream, TransformStatus,
};
pub use transport::{CommandRequest, Coprocessor, InitParams};

use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel::Sender;

use crate::error::{AvrError, AvrResult};

// ============================================================================
// Identifiers
// ============================================================================

/// Class of operation a slot carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Configure,
    Run,
    ExchangeBuffer,
}

impl CommandKind {
    fn index(self) -> usize {
        match self {
            CommandKind::Configure => 0,
            CommandKind::Run => 1,
            CommandKind::ExchangeBuffer => 2,
        }
    }

    /// Firmware command name, for logs and the post-mortem report
    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Configure => "SET_GLOBAL_TRANSFORM_PARAMS",
            CommandKind::Run => "TRANSFORM",
            CommandKind::ExchangeBuffer => "SEND_BUFFERS",
        }
    }
}

/// Lifecycle of the command held by a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandState {
    /// Claimed by a submitter, not yet handed to the transport
    Idle = 0,
    Pending = 1,
    Completed = 2,
    /// Failed, aborted, or never used
    Failed = 3,
}

impl CommandState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CommandState::Idle,
            1 => CommandState::Pending,
            2 => CommandState::Completed,
            _ => CommandState::Failed,
        }
    }

    /// Whether the slot may be submitted again
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandState::Completed | CommandState::Failed)
    }
}

/// Identity of one submitted command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(pub u32);

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Stable index of a command slot within its context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl SlotId {
    pub const CONFIGURE: SlotId = SlotId(0);
    pub const RUN: SlotId = SlotId(1);

    /// Slot of the `n`th exchange buffer
    pub fn buffer(n: usize) -> SlotId {
        SlotId(2 + n)
    }
}

/// How a command finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionResult {
    Success,
    Failed(i32),
    Aborted,
}

/// Delivered to the worker when a command completes
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub slot: SlotId,
    pub id: CommandId,
    pub kind: CommandKind,
    pub result: CompletionResult,
    pub payload: CompletionPayload,
}

/// A command still owned by the transport, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingCommand {
    pub slot: SlotId,
    pub id: CommandId,
    pub kind: CommandKind,
    pub state: CommandState,
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Debug)]
struct Slot {
    kind: CommandKind,
    state: AtomicU8,
    id: AtomicU32,
}

/// Per-slot state shared between the worker and the completion context
#[derive(Debug)]
pub struct CommandLedger {
    slots: Vec<Slot>,
    in_flight: AtomicUsize,
    reuse: [AtomicU32; 3],
    next_id: AtomicU32,
}

impl CommandLedger {
    /// Configure, Run, then `buffer_slots` exchange slots, all unused
    pub fn new(buffer_slots: usize) -> Arc<Self> {
        let kinds = [CommandKind::Configure, CommandKind::Run]
            .into_iter()
            .chain(std::iter::repeat(CommandKind::ExchangeBuffer).take(buffer_slots));

        let slots = kinds
            .map(|kind| Slot {
                kind,
                state: AtomicU8::new(CommandState::Failed as u8),
                id: AtomicU32::new(0),
            })
            .collect();

        Arc::new(Self {
            slots,
            in_flight: AtomicUsize::new(0),
            reuse: Default::default(),
            next_id: AtomicU32::new(1),
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn kind(&self, slot: SlotId) -> Option<CommandKind> {
        self.slots.get(slot.0).map(|s| s.kind)
    }

    pub fn state(&self, slot: SlotId) -> CommandState {
        self.slots
            .get(slot.0)
            .map(|s| CommandState::from_u8(s.state.load(Ordering::Acquire)))
            .unwrap_or(CommandState::Failed)
    }

    pub fn id(&self, slot: SlotId) -> CommandId {
        CommandId(
            self.slots
                .get(slot.0)
                .map(|s| s.id.load(Ordering::Acquire))
                .unwrap_or(0),
        )
    }

    /// Commands submitted and not yet completed
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Refused submissions on a pending slot of this kind
    pub fn reuse_count(&self, kind: CommandKind) -> u32 {
        self.reuse[kind.index()].load(Ordering::Relaxed)
    }

    /// Slots that are claimed or pending
    pub fn outstanding(&self) -> Vec<OutstandingCommand> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let state = CommandState::from_u8(s.state.load(Ordering::Acquire));
                (!state.is_terminal()).then(|| OutstandingCommand {
                    slot: SlotId(i),
                    id: CommandId(s.id.load(Ordering::Acquire)),
                    kind: s.kind,
                    state,
                })
            })
            .collect()
    }

    /// Mark every slot unused and zero the counters
    ///
    /// Only valid while no transport session exists.
    pub fn reset(&self) {
        for slot in &self.slots {
            slot.state.store(CommandState::Failed as u8, Ordering::Release);
            slot.id.store(0, Ordering::Release);
        }
        self.in_flight.store(0, Ordering::Release);
        for counter in &self.reuse {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn slot(&self, slot: SlotId) -> AvrResult<&Slot> {
        self.slots
            .get(slot.0)
            .ok_or_else(|| AvrError::validation("slot", slot.0, "an allocated command slot"))
    }

    /// Claim a terminal slot for a new command and mark it pending
    fn claim(&self, slot: SlotId) -> AvrResult<CommandId> {
        let entry = self.slot(slot)?;

        let current = entry.state.load(Ordering::Acquire);
        if !CommandState::from_u8(current).is_terminal()
            || entry
                .state
                .compare_exchange(
                    current,
                    CommandState::Idle as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
        {
            self.reuse[entry.kind.index()].fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "claim: refusing to reuse {} slot {} (command {:08x} still pending)",
                entry.kind.name(),
                slot.0,
                entry.id.load(Ordering::Acquire)
            );
            return Err(AvrError::SlotBusy { slot: slot.0, kind: entry.kind });
        }

        let id = CommandId(self.next_id.fetch_add(1, Ordering::Relaxed));
        entry.id.store(id.0, Ordering::Release);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        entry.state.store(CommandState::Pending as u8, Ordering::Release);
        Ok(id)
    }

    /// Undo a claim whose submission the transport rejected
    fn revert(&self, slot: SlotId, id: CommandId) {
        if let Ok(entry) = self.slot(slot) {
            if entry.id.load(Ordering::Acquire) == id.0
                && entry
                    .state
                    .compare_exchange(
                        CommandState::Pending as u8,
                        CommandState::Failed as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Record the completion of `id` on `slot`
    fn complete(&self, slot: SlotId, id: CommandId, result: CompletionResult) -> AvrResult<()> {
        let entry = self.slot(slot)?;
        if entry.id.load(Ordering::Acquire) != id.0 {
            return Err(AvrError::StaleCompletion { slot: slot.0, command: id.0 });
        }

        let next = match result {
            CompletionResult::Success => CommandState::Completed,
            CompletionResult::Failed(_) | CompletionResult::Aborted => CommandState::Failed,
        };

        entry
            .state
            .compare_exchange(
                CommandState::Pending as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| AvrError::StaleCompletion { slot: slot.0, command: id.0 })?;

        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Fail every non-terminal slot; returns how many were forced
    ///
    /// Used once the transport session is gone and no further completions
    /// can arrive.
    fn force_fail_all(&self) -> usize {
        let mut forced = 0;
        for entry in &self.slots {
            let previous = entry.state.swap(CommandState::Failed as u8, Ordering::AcqRel);
            if CommandState::from_u8(previous) == CommandState::Pending {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            if !CommandState::from_u8(previous).is_terminal() {
                forced += 1;
            }
        }
        forced
    }
}

// ============================================================================
// Completion side
// ============================================================================

/// Handed to the transport so it can report completions
///
/// `complete` never blocks: it flips the slot state, decrements the
/// in-flight counter and queues the event for the worker.
#[derive(Debug, Clone)]
pub struct CompletionNotifier {
    ledger: Arc<CommandLedger>,
    tx: Sender<CompletionEvent>,
}

impl CompletionNotifier {
    pub fn new(ledger: Arc<CommandLedger>, tx: Sender<CompletionEvent>) -> Self {
        Self { ledger, tx }
    }

    pub fn complete(&self, event: CompletionEvent) -> AvrResult<()> {
        if let Err(err) = self.ledger.complete(event.slot, event.id, event.result) {
            log::warn!(
                "complete: dropping {} completion for {}: {}",
                event.kind.name(),
                event.id,
                err
            );
            return Err(err);
        }

        log::trace!(
            "complete: {} {} ({:?}) - {} in flight",
            event.kind.name(),
            event.id,
            event.result,
            self.ledger.in_flight()
        );

        // the worker may already be gone during teardown
        let _ = self.tx.send(event);
        Ok(())
    }
}

// ============================================================================
// Submission side
// ============================================================================

/// A submission that was not accepted, with its payload handed back
#[derive(Debug)]
pub struct Rejected {
    pub error: AvrError,
    pub payload: CommandPayload,
}

impl From<Rejected> for AvrError {
    fn from(rejected: Rejected) -> Self {
        rejected.error
    }
}

/// Worker-side view of the command slots
pub struct CommandChannel {
    ledger: Arc<CommandLedger>,
    transport: Arc<dyn Coprocessor>,
    payloads: Vec<Option<CommandPayload>>,
}

impl CommandChannel {
    pub fn new(ledger: Arc<CommandLedger>, transport: Arc<dyn Coprocessor>) -> Self {
        let payloads = (0..ledger.slot_count()).map(|_| None).collect();
        Self { ledger, transport, payloads }
    }

    pub fn ledger(&self) -> &Arc<CommandLedger> {
        &self.ledger
    }

    pub fn transport(&self) -> &Arc<dyn Coprocessor> {
        &self.transport
    }

    /// Submit `payload` on `slot`
    ///
    /// A slot whose previous command is still pending is refused with
    /// `SlotBusy`; neither its state nor its stored payload is touched.
    pub fn submit(&mut self, slot: SlotId, payload: CommandPayload) -> Result<CommandId, Rejected> {
        let kind = match self.ledger.kind(slot) {
            Some(kind) if kind == payload.kind() => kind,
            _ => {
                return Err(Rejected {
                    error: AvrError::validation("slot", slot.0, "a slot matching the payload kind"),
                    payload,
                })
            }
        };

        let id = match self.ledger.claim(slot) {
            Ok(id) => id,
            Err(error) => return Err(Rejected { error, payload }),
        };

        let request = CommandRequest { slot, id, kind, payload: &payload };
        if let Err(error) = self.transport.send(&request) {
            self.ledger.revert(slot, id);
            log::error!("submit: {} {} rejected: {}", kind.name(), id, error);
            return Err(Rejected { error, payload });
        }

        log::trace!(
            "submit: issued {} {} - {} in flight",
            kind.name(),
            id,
            self.ledger.in_flight()
        );
        self.payloads[slot.0] = Some(payload);
        Ok(id)
    }

    /// Take back the payload of a completed command
    ///
    /// Returns `None` while the command is still outstanding.
    pub fn take_payload(&mut self, slot: SlotId) -> Option<CommandPayload> {
        if !self.ledger.state(slot).is_terminal() {
            return None;
        }
        self.payloads.get_mut(slot.0).and_then(Option::take)
    }

    /// Ask the transport to abort every outstanding command
    pub fn abort_all(&self) {
        for command in self.ledger.outstanding() {
            log::debug!("abort_all: aborting {} {}", command.kind.name(), command.id);
            if let Err(err) = self.transport.abort(command.id) {
                log::warn!("abort_all: abort of {} failed: {}", command.id, err);
            }
        }
    }

    /// Reclaim every stored payload once no completion can arrive any more
    pub fn reclaim_all(&mut self) -> Vec<CommandPayload> {
        let forced = self.ledger.force_fail_all();
        if forced > 0 {
            log::warn!("reclaim_all: forced {} outstanding commands to Failed", forced);
        }
        self.payloads.iter_mut().filter_map(Option::take).collect()
    }
}
