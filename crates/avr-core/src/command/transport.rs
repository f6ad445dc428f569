//! The coprocessor transport seam

use crate::config::{ChannelSelect, HdmiLayout};
use crate::error::AvrResult;
use crate::fault::{PostMortemRecord, ProcessingUnit};
use crate::format::DecoderCapability;

use super::{CommandId, CommandKind, CommandPayload, CompletionNotifier, SlotId};

/// Init-time parameters of a transform session
///
/// Changing any of these requires the session to be restarted.
#[derive(Debug, Clone, PartialEq)]
pub struct InitParams {
    pub input_id: u8,
    pub hdmi_layout: HdmiLayout,
    pub channel_select: ChannelSelect,
    pub silence_threshold_db: i32,
    pub silence_duration_ms: u32,
    /// Number of command slots the session must be able to hold
    pub command_slots: usize,
}

/// One command handed to the transport
#[derive(Debug)]
pub struct CommandRequest<'a> {
    pub slot: SlotId,
    pub id: CommandId,
    pub kind: CommandKind,
    pub payload: &'a CommandPayload,
}

/// Asynchronous command interface to the transform engine
///
/// `send` only queues: the outcome of every accepted command is reported
/// through the [`CompletionNotifier`] passed to `init`, from any thread and
/// possibly before `send` has returned.
pub trait Coprocessor: Send + Sync {
    /// Decoder families of the loaded firmware
    fn capability(&self) -> AvrResult<DecoderCapability>;

    /// Open a transform session
    fn init(&self, params: &InitParams, notifier: CompletionNotifier) -> AvrResult<()>;

    fn send(&self, request: &CommandRequest<'_>) -> AvrResult<()>;

    /// Best-effort abort; the command still completes (as Aborted)
    fn abort(&self, id: CommandId) -> AvrResult<()>;

    /// Close the session; refused while commands are outstanding
    fn terminate(&self) -> AvrResult<()>;

    /// Status block of a processing unit, `None` if the platform has none
    fn post_mortem(&self, unit: ProcessingUnit) -> Option<PostMortemRecord>;

    /// Raise a diagnostic interrupt on interrupt CPU `cpu`
    fn raise_interrupt(&self, cpu: u32) -> AvrResult<()>;
}
