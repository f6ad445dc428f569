//! AVR Core - Host-side driver for the audio transform coprocessor

pub mod capture;
pub mod command;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod driver;
pub mod error;
pub mod fault;
pub mod format;
pub mod frequency;
pub mod latency;
pub mod mixer;
pub mod mute;
pub mod orchestrator;
pub mod pool;
pub mod sim;
pub mod topology;

pub use context::{AudioContext, LogSink, StreamId};
pub use driver::{AvrDriver, DriverThread};
pub use error::{AvrError, AvrResult, ErrorClass};
