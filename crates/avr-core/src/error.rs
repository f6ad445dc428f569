//! Driver error types
//!
//! Every failure the core can report maps onto one of five classes
//! (see [`ErrorClass`]). Callers that only care about the class, such as the
//! orchestrator deciding whether to deploy an emergency mute, branch on
//! [`AvrError::class`] rather than on individual variants.

use thiserror::Error;

use crate::command::CommandKind;

/// Broad failure classes used to decide how an error is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Pool or command allocation failed while initializing (fatal, no retry)
    ResourceExhaustion,
    /// A slot was reused while pending or a lease was mishandled (refused, counted)
    ProtocolViolation,
    /// The coprocessor rejected a request
    TransportFailure,
    /// The coprocessor stopped responding
    Unresponsiveness,
    /// A configuration value was out of range (state unchanged)
    ValidationFailure,
    /// Start/stop/registry misuse
    Lifecycle,
}

/// Errors that can occur in the driver core
#[derive(Error, Debug)]
pub enum AvrError {
    /// Backing memory or command storage could not be allocated
    #[error("Failed to allocate {what} ({requested} bytes)")]
    ResourceExhausted { what: &'static str, requested: usize },

    /// A command slot was submitted while its previous command is still pending
    #[error("Refusing to reuse {kind:?} slot {slot} (command still pending)")]
    SlotBusy { slot: usize, kind: CommandKind },

    /// A buffer lease was released twice
    #[error("Buffer entry {index} released while already free")]
    DoubleRelease { index: usize },

    /// A buffer lease was handed to a pool that did not issue it
    #[error("Buffer lease belongs to a different pool")]
    ForeignLease,

    /// A completion arrived for a command the slot no longer holds
    #[error("Stale completion for slot {slot} (command {command})")]
    StaleCompletion { slot: usize, command: u32 },

    /// The coprocessor rejected a request
    #[error("Coprocessor {operation} failed (code {code})")]
    Transport { operation: &'static str, code: i32 },

    /// The coprocessor did not respond within the allotted time
    #[error("Coprocessor unresponsive after ~{waited_ms}ms")]
    Unresponsive { waited_ms: u64 },

    /// A configuration value was out of range
    #[error("Invalid {field}: {value} (expected {expected})")]
    Validation {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    /// Operation is not supported on this platform or for this id
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Context cannot be destroyed while its worker is running
    #[error("Audio context still has a running worker")]
    Busy,

    /// No context registered for this stream id
    #[error("Unknown stream id {0}")]
    UnknownStream(u32),

    /// Worker thread could not be spawned
    #[error("Failed to spawn worker thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

impl AvrError {
    /// Shorthand for building a validation error
    pub fn validation(field: &'static str, value: impl ToString, expected: &'static str) -> Self {
        AvrError::Validation {
            field,
            value: value.to_string(),
            expected,
        }
    }

    /// Failure class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            AvrError::ResourceExhausted { .. } => ErrorClass::ResourceExhaustion,
            AvrError::SlotBusy { .. }
            | AvrError::DoubleRelease { .. }
            | AvrError::ForeignLease
            | AvrError::StaleCompletion { .. } => ErrorClass::ProtocolViolation,
            AvrError::Transport { .. } => ErrorClass::TransportFailure,
            AvrError::Unresponsive { .. } => ErrorClass::Unresponsiveness,
            AvrError::Validation { .. } => ErrorClass::ValidationFailure,
            AvrError::Unsupported(_)
            | AvrError::Busy
            | AvrError::UnknownStream(_)
            | AvrError::ThreadSpawn(_) => ErrorClass::Lifecycle,
        }
    }
}

/// Result type for driver operations
pub type AvrResult<T> = Result<T, AvrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let busy = AvrError::SlotBusy { slot: 1, kind: CommandKind::Run };
        assert_eq!(busy.class(), ErrorClass::ProtocolViolation);

        let invalid = AvrError::validation("target_latency_ms", 300, "20..=150");
        assert_eq!(invalid.class(), ErrorClass::ValidationFailure);
        assert_eq!(
            invalid.to_string(),
            "Invalid target_latency_ms: 300 (expected 20..=150)"
        );

        let transport = AvrError::Transport { operation: "send", code: -5 };
        assert_eq!(transport.class(), ErrorClass::TransportFailure);
    }
}
