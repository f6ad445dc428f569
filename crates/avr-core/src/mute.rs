//! Emergency mute
//!
//! A driver-initiated mute with a recorded cause. The reason is latched: the
//! driver only ever raises it, and it is cleared from outside through the
//! diagnostic surface. Deploying a mute asks the worker to re-apply the
//! global parameters so every output chain is soft-muted on the next
//! Configure.

use std::sync::Mutex;

use crossbeam::channel::Sender;

use crate::error::{AvrError, AvrResult};
use crate::orchestrator::ControlMessage;

/// Why the outputs are muted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmergencyMuteReason {
    #[default]
    None,
    User,
    Accelerated,
    SampleRateChange,
    Error,
}

impl EmergencyMuteReason {
    /// Label shown on the diagnostic surface
    pub fn label(self) -> &'static str {
        match self {
            EmergencyMuteReason::None => "None",
            EmergencyMuteReason::User => "User",
            EmergencyMuteReason::Accelerated => "Accelerated",
            EmergencyMuteReason::SampleRateChange => "SampleRate Change",
            EmergencyMuteReason::Error => "Error",
        }
    }

    /// Parse an operator write: '0'/'n'/'N' clears, '1'/'y'/'Y' is a user mute
    pub fn parse_store(text: &str) -> AvrResult<Self> {
        match text.trim().chars().next() {
            Some('0' | 'n' | 'N') => Ok(EmergencyMuteReason::None),
            Some('1' | 'y' | 'Y') => Ok(EmergencyMuteReason::User),
            _ => Err(AvrError::validation("emergency_mute", text.trim(), "0/n/N or 1/y/Y")),
        }
    }
}

/// Latched emergency mute state for one audio context
#[derive(Debug)]
pub struct EmergencyMute {
    reason: Mutex<EmergencyMuteReason>,
    control: Sender<ControlMessage>,
}

impl EmergencyMute {
    pub fn new(control: Sender<ControlMessage>) -> Self {
        Self {
            reason: Mutex::new(EmergencyMuteReason::None),
            control,
        }
    }

    pub fn reason(&self) -> EmergencyMuteReason {
        *self.reason.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_deployed(&self) -> bool {
        self.reason() != EmergencyMuteReason::None
    }

    /// Record a new reason without waking the worker
    ///
    /// Used by the worker itself, which re-applies its parameters directly.
    /// Returns the previous reason.
    pub fn set_reason(&self, reason: EmergencyMuteReason) -> EmergencyMuteReason {
        let mut current = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        let previous = *current;
        *current = reason;
        if previous != reason {
            log::info!(
                "EmergencyMute: {} -> {}",
                previous.label(),
                reason.label()
            );
        }
        previous
    }

    /// Record a new reason and request an instant apply
    pub fn deploy(&self, reason: EmergencyMuteReason) {
        self.set_reason(reason);
        // a closed channel means no worker is running; the reason is applied on start
        let _ = self.control.send(ControlMessage::Reconfigure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    #[test]
    fn test_parse_store() {
        assert_eq!(EmergencyMuteReason::parse_store("0\n").unwrap(), EmergencyMuteReason::None);
        assert_eq!(EmergencyMuteReason::parse_store("N").unwrap(), EmergencyMuteReason::None);
        assert_eq!(EmergencyMuteReason::parse_store("y").unwrap(), EmergencyMuteReason::User);
        assert_eq!(EmergencyMuteReason::parse_store("1").unwrap(), EmergencyMuteReason::User);
        assert!(EmergencyMuteReason::parse_store("maybe").is_err());
        assert!(EmergencyMuteReason::parse_store("").is_err());
    }

    #[test]
    fn test_deploy_requests_reconfigure() {
        let (tx, rx) = unbounded();
        let mute = EmergencyMute::new(tx);
        assert!(!mute.is_deployed());

        mute.deploy(EmergencyMuteReason::SampleRateChange);
        assert_eq!(mute.reason(), EmergencyMuteReason::SampleRateChange);
        assert_eq!(rx.try_recv().unwrap(), ControlMessage::Reconfigure);

        // the worker path does not wake anybody
        mute.set_reason(EmergencyMuteReason::Error);
        assert!(rx.try_recv().is_err());
        assert_eq!(mute.reason().label(), "Error");
    }
}
