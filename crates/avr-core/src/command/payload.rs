//! What travels with a command and back with its completion

use crate::format::SpdifStatus;
use crate::frequency::SamplingFrequency;
use crate::orchestrator::GlobalParams;
use crate::pool::BufferLease;
use crate::topology::AudioMode;

use super::CommandKind;

/// Which log tap an exchange buffer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStream {
    Input,
    Output,
}

impl LogStream {
    pub fn name(self) -> &'static str {
        match self {
            LogStream::Input => "input",
            LogStream::Output => "output",
        }
    }
}

/// Host-side payload of a submitted command
///
/// Held by the command channel until the command completes.
#[derive(Debug)]
pub enum CommandPayload {
    Configure(Box<GlobalParams>),
    Run,
    ExchangeBuffer { lease: BufferLease, stream: LogStream },
}

impl CommandPayload {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandPayload::Configure(_) => CommandKind::Configure,
            CommandPayload::Run => CommandKind::Run,
            CommandPayload::ExchangeBuffer { .. } => CommandKind::ExchangeBuffer,
        }
    }
}

/// Limiter mute state reported after a transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimiterState {
    #[default]
    Unmuted,
    Muted,
    EmergencyMuted,
}

/// Decoder status returned by a Run completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformStatus {
    pub decode_ok: bool,
    /// Samples produced by this transform
    pub samples: u32,
    pub sampling_frequency: SamplingFrequency,
    pub audio_mode: AudioMode,
    pub spdif: SpdifStatus,
    pub limiter: LimiterState,
}

impl Default for TransformStatus {
    fn default() -> Self {
        Self {
            decode_ok: true,
            samples: 0,
            sampling_frequency: SamplingFrequency::Fs48k,
            audio_mode: AudioMode::Mode20,
            spdif: SpdifStatus::default(),
            limiter: LimiterState::Unmuted,
        }
    }
}

/// Coprocessor-side result data carried by a completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CompletionPayload {
    #[default]
    None,
    Run(TransformStatus),
    /// Log bytes written by the coprocessor; may be empty
    ExchangeBuffer { bytes: Vec<u8> },
}
