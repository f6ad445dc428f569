//! Audio contexts
//!
//! One `AudioContext` exists per selected input stream. It owns the state
//! shared between the control surface and its worker thread:
//!
//! ```text
//!  control / diagnostics ──▶ AudioContext ──Arc<ContextState>──▶ worker
//!                                │                                 │
//!                                └──────── ControlMessage ────────▶┘
//! ```
//!
//! Settings are applied in one of two ways. Instant apply queues a
//! `Reconfigure` and the worker re-sends its global parameters. Restart
//! apply stops and starts the worker, for parameters that are fixed when the
//! transform session is opened.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::command::{CommandLedger, Coprocessor, LogStream};
use crate::config::{
    validate_input, validate_silence_threshold, AudioConfig, AvrConfig, ChannelSelect,
    DriverConfig, HdmiLayout, LoggingConfig,
};
use crate::diagnostics::Diagnostics;
use crate::driver::DriverThread;
use crate::error::AvrResult;
use crate::fault::FaultMonitor;
use crate::latency::LatencySynchronizer;
use crate::mixer::SharedMixer;
use crate::mute::EmergencyMute;
use crate::orchestrator::{ControlMessage, StatusBoard};
use crate::topology::DownmixRom;

/// Identifies an input stream
pub type StreamId = u32;

/// Receives firmware log text from the exchange buffers
pub trait LogSink: Send {
    fn relay(&mut self, stream: LogStream, input: u8, bytes: &[u8]);
}

// ============================================================================
// Shared state
// ============================================================================

/// State shared by an audio context and its worker
pub struct ContextState {
    stream: StreamId,
    audio: RwLock<AudioConfig>,
    driver: DriverConfig,
    logging: LoggingConfig,
    pub transport: Arc<dyn Coprocessor>,
    pub ledger: Arc<CommandLedger>,
    pub sync: Arc<LatencySynchronizer>,
    pub mute: Arc<EmergencyMute>,
    pub mixer: Arc<SharedMixer>,
    pub rom: Arc<DownmixRom>,
    pub status: StatusBoard,
    pub fault: FaultMonitor,
    control_tx: Sender<ControlMessage>,
    stop: AtomicBool,
    force_crash: AtomicBool,
    log_sink: Mutex<Option<Box<dyn LogSink>>>,
}

impl ContextState {
    pub(crate) fn new(
        stream: StreamId,
        config: &AvrConfig,
        transport: Arc<dyn Coprocessor>,
        mixer: Arc<SharedMixer>,
        rom: Arc<DownmixRom>,
    ) -> (Arc<Self>, Receiver<ControlMessage>) {
        let (control_tx, control_rx) = unbounded();

        let sync = Arc::new(LatencySynchronizer::new(config.latency.target_ms));
        sync.set_compensatory_latency_us(config.latency.compensatory_us);
        sync.update_master_latency(mixer.snapshot().master_latency_ms);

        let state = Arc::new(Self {
            stream,
            audio: RwLock::new(config.audio.clone()),
            driver: config.driver.clone(),
            logging: config.logging.clone(),
            ledger: CommandLedger::new(config.logging.buffer_count()),
            fault: FaultMonitor::new(transport.clone(), config.driver.trap_grace()),
            transport,
            sync,
            mute: Arc::new(EmergencyMute::new(control_tx.clone())),
            mixer,
            rom,
            status: StatusBoard::default(),
            control_tx,
            stop: AtomicBool::new(false),
            force_crash: AtomicBool::new(false),
            log_sink: Mutex::new(None),
        });
        (state, control_rx)
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Snapshot of the audio options
    pub fn audio(&self) -> AudioConfig {
        self.audio.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Change the audio options, returning whether anything changed
    fn update_audio(&self, update: impl FnOnce(&mut AudioConfig)) -> bool {
        let mut audio = self.audio.write().unwrap_or_else(|e| e.into_inner());
        let before = audio.clone();
        update(&mut audio);
        *audio != before
    }

    pub fn driver_config(&self) -> &DriverConfig {
        &self.driver
    }

    pub fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    /// Consume a pending crash request
    pub fn take_force_crash(&self) -> bool {
        self.force_crash.swap(false, Ordering::AcqRel)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn set_stop(&self, stop: bool) {
        self.stop.store(stop, Ordering::Release);
    }

    pub(crate) fn send_control(&self, message: ControlMessage) {
        // the receiver lives as long as the context
        let _ = self.control_tx.send(message);
    }

    pub fn set_log_sink(&self, sink: Box<dyn LogSink>) {
        *self.log_sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    /// Hand firmware log bytes to the sink, or to the log without one
    pub fn relay_log(&self, stream: LogStream, bytes: &[u8]) {
        let input = self.audio().input;
        let mut sink = self.log_sink.lock().unwrap_or_else(|e| e.into_inner());
        match sink.as_mut() {
            Some(sink) => sink.relay(stream, input, bytes),
            None => log::debug!(
                "[AVR] {}{}: {}",
                stream.name(),
                input,
                String::from_utf8_lossy(bytes).trim_end()
            ),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        sim: Arc<crate::sim::SimulatedCoprocessor>,
        config: AvrConfig,
    ) -> (Arc<Self>, Sender<ControlMessage>, Receiver<ControlMessage>) {
        let (state, control_rx) = Self::new(
            0,
            &config,
            sim,
            Arc::new(SharedMixer::default()),
            Arc::new(DownmixRom::default()),
        );
        let control_tx = state.control_tx.clone();
        (state, control_tx, control_rx)
    }
}

// ============================================================================
// Audio context
// ============================================================================

/// Control surface of one input stream
pub struct AudioContext {
    state: Arc<ContextState>,
    control_rx: Receiver<ControlMessage>,
    thread: Mutex<DriverThread>,
}

impl AudioContext {
    pub fn new(
        stream: StreamId,
        config: &AvrConfig,
        transport: Arc<dyn Coprocessor>,
        mixer: Arc<SharedMixer>,
        rom: Arc<DownmixRom>,
    ) -> AvrResult<Self> {
        config.validate()?;
        let (state, control_rx) = ContextState::new(stream, config, transport, mixer, rom);
        Ok(Self {
            state,
            control_rx,
            thread: Mutex::new(DriverThread::default()),
        })
    }

    pub fn state(&self) -> &Arc<ContextState> {
        &self.state
    }

    pub fn stream(&self) -> StreamId {
        self.state.stream()
    }

    pub fn diagnostics(&self) -> Diagnostics<'_> {
        Diagnostics::new(self)
    }

    fn thread(&self) -> std::sync::MutexGuard<'_, DriverThread> {
        self.thread.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start the worker; does nothing if it is already running
    pub fn start(&self) -> AvrResult<()> {
        self.thread()
            .start(self.state.clone(), self.control_rx.clone())
    }

    /// Stop the worker and wait for it to finish
    pub fn stop(&self) -> AvrResult<()> {
        self.thread().stop(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.thread().is_running()
    }

    /// Restart a running worker so init-time parameters take effect
    pub fn restart(&self) -> AvrResult<()> {
        let mut thread = self.thread();
        if !thread.is_running() {
            return Ok(());
        }
        log::info!("[AVR] restarting worker for stream {}", self.stream());
        thread.stop(&self.state)?;
        thread.start(self.state.clone(), self.control_rx.clone())
    }

    /// Ask the worker to re-send its global parameters
    pub fn instant_apply(&self) {
        if self.is_running() {
            self.state.send_control(ControlMessage::Reconfigure);
        }
    }

    // ------------------------------------------------------------------------
    // Instant apply settings
    // ------------------------------------------------------------------------

    pub fn set_emphasis(&self, emphasis: bool) {
        if self.state.update_audio(|a| a.emphasis = emphasis) {
            self.instant_apply();
        }
    }

    pub fn set_channel_select(&self, select: ChannelSelect) {
        if self.state.update_audio(|a| a.channel_select = select) {
            self.instant_apply();
        }
    }

    pub fn set_aac_decode(&self, enabled: bool) {
        if self.state.update_audio(|a| a.aac_decode = enabled) {
            self.instant_apply();
        }
    }

    /// Set the Vsync compensation; invalid values reset it to zero
    pub fn set_compensatory_latency_us(&self, micros: i64) -> u32 {
        let ms = self.state.sync.set_compensatory_latency_us(micros);
        let mixer = self.state.mixer.snapshot();
        self.state
            .sync
            .disclose("compensatory", mixer.master_latency_ms, &mixer.chain_latencies());
        self.instant_apply();
        ms
    }

    pub fn set_target_latency_ms(&self, ms: u32) -> AvrResult<()> {
        self.state.sync.set_target_latency_ms(ms)?;
        let mixer = self.state.mixer.snapshot();
        self.state
            .sync
            .disclose("target", mixer.master_latency_ms, &mixer.chain_latencies());
        self.instant_apply();
        Ok(())
    }

    /// Follow a new master latency from the mixer settings
    pub fn update_master_latency(&self, master_latency_ms: i32, chain_latency_ms: &[i32]) {
        if self.state.sync.update_master_latency(master_latency_ms) {
            log::info!(
                "[AVR] stream {}: A/V offset now {}",
                self.stream(),
                self.state.sync.av_offset()
            );
        }
        self.state
            .sync
            .disclose("master", master_latency_ms, chain_latency_ms);
    }

    /// Have the firmware crash itself on the next Configure
    pub fn arm_crash(&self) {
        log::warn!("[AVR] stream {}: forced crash armed", self.stream());
        self.state.force_crash.store(true, Ordering::Release);
        self.instant_apply();
    }

    // ------------------------------------------------------------------------
    // Restart apply settings
    // ------------------------------------------------------------------------

    pub fn set_hdmi_layout(&self, layout: HdmiLayout) -> AvrResult<()> {
        if self.state.update_audio(|a| a.hdmi_layout = layout) {
            self.restart()?;
        }
        Ok(())
    }

    /// Select the physical input; the time mapping is re-established
    pub fn set_input(&self, input: u8) -> AvrResult<()> {
        validate_input(input)?;
        if self.state.update_audio(|a| a.input = input) {
            self.state.sync.invalidate();
            self.restart()?;
        }
        Ok(())
    }

    pub fn set_silence_threshold_db(&self, db: i32) -> AvrResult<()> {
        validate_silence_threshold(db)?;
        if self.state.update_audio(|a| a.silence_threshold_db = db) {
            self.restart()?;
        }
        Ok(())
    }

    pub fn set_silence_duration_ms(&self, ms: u32) -> AvrResult<()> {
        if self.state.update_audio(|a| a.silence_duration_ms = ms) {
            self.restart()?;
        }
        Ok(())
    }
}

impl Drop for AudioContext {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(err) = self.stop() {
                log::error!("[AVR] stream {} dropped with a running worker: {}", self.stream(), err);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub type RelayedLogs = Arc<Mutex<Vec<(LogStream, Vec<u8>)>>>;

    /// Keeps every relayed log chunk
    pub struct RecordingSink(pub RelayedLogs);

    impl LogSink for RecordingSink {
        fn relay(&mut self, stream: LogStream, _input: u8, bytes: &[u8]) {
            self.0.lock().unwrap().push((stream, bytes.to_vec()));
        }
    }

    pub fn record_logs(state: &ContextState) -> RelayedLogs {
        let logs = RelayedLogs::default();
        state.set_log_sink(Box::new(RecordingSink(logs.clone())));
        logs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::orchestrator::OrchestratorState;
    use crate::sim::SimulatedCoprocessor;
    use std::time::{Duration, Instant};

    fn context(sim: SimulatedCoprocessor) -> (Arc<SimulatedCoprocessor>, AudioContext) {
        let sim = Arc::new(sim);
        let ctx = AudioContext::new(
            7,
            &AvrConfig::default(),
            sim.clone(),
            Arc::new(SharedMixer::default()),
            Arc::new(DownmixRom::default()),
        )
        .unwrap();
        (sim, ctx)
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
    fn test_invalid_config_is_rejected() {
        let config = AvrConfig {
            audio: AudioConfig { input: 3, ..Default::default() },
            ..Default::default()
        };
        let result = AudioContext::new(
            0,
            &config,
            Arc::new(SimulatedCoprocessor::new()),
            Arc::new(SharedMixer::default()),
            Arc::new(DownmixRom::default()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_setters_validate_at_the_boundary() {
        let (_sim, ctx) = context(SimulatedCoprocessor::new());
        assert!(ctx.set_input(2).is_err());
        assert!(ctx.set_silence_threshold_db(-97).is_err());
        assert!(ctx.set_target_latency_ms(10).is_err());
        assert_eq!(ctx.state().audio(), AudioConfig::default());
        assert_eq!(ctx.state().sync.target_latency_ms(), 40);
    }

    #[test]
    fn test_instant_apply_sends_configure() {
        let (sim, ctx) = context(SimulatedCoprocessor::new().hold(CommandKind::Run));
        ctx.start().unwrap();
        assert!(wait_for(|| ctx.state().status.state() == OrchestratorState::Running));
        assert!(wait_for(|| sim.sent_count(CommandKind::Configure) == 1));

        ctx.set_emphasis(true);
        assert!(wait_for(|| sim.sent_count(CommandKind::Configure) == 2));
        assert!(sim.last_configure().unwrap().input.emphasis);

        // unchanged value, nothing to apply
        ctx.set_emphasis(true);
        ctx.stop().unwrap();
        assert_eq!(sim.sent_count(CommandKind::Configure), 2);
    }

    #[test]
    fn test_restart_apply_reopens_session() {
        let (sim, ctx) = context(SimulatedCoprocessor::new().hold(CommandKind::Run));
        ctx.start().unwrap();
        assert!(wait_for(|| ctx.state().status.state() == OrchestratorState::Running));

        ctx.set_input(1).unwrap();
        assert!(wait_for(|| ctx.state().status.state() == OrchestratorState::Running));
        assert_eq!(sim.init_params().unwrap().input_id, 1);
        assert!(ctx.state().sync.is_pending());
        ctx.stop().unwrap();
        assert_eq!(ctx.state().status.state(), OrchestratorState::Terminated);
    }

    #[test]
    fn test_crash_trigger_is_consumed_once() {
        let (sim, ctx) = context(SimulatedCoprocessor::new().hold(CommandKind::Run));
        ctx.start().unwrap();
        assert!(wait_for(|| sim.sent_count(CommandKind::Configure) == 1));

        ctx.arm_crash();
        assert!(wait_for(|| sim.sent_count(CommandKind::Configure) == 2));
        assert!(sim.last_configure().unwrap().force_crash);

        ctx.set_aac_decode(true);
        assert!(wait_for(|| sim.sent_count(CommandKind::Configure) == 3));
        assert!(!sim.last_configure().unwrap().force_crash);
        ctx.stop().unwrap();
    }

    #[test]
    fn test_stop_right_after_start() {
        let (sim, ctx) = context(SimulatedCoprocessor::new().hold_all().with_status_blocks());
        for _ in 0..5 {
            ctx.start().unwrap();
            ctx.stop().unwrap();
            assert!(!ctx.is_running());
            assert_eq!(ctx.state().status.state(), OrchestratorState::Terminated);
        }
        assert!(!ctx.state().fault.is_issued());
        assert!(!sim.is_session_open());
    }

    #[test]
    fn test_restart_then_stop() {
        let (_sim, ctx) = context(SimulatedCoprocessor::new().hold_all());
        ctx.start().unwrap();
        ctx.set_hdmi_layout(HdmiLayout::Layout2).unwrap();
        ctx.stop().unwrap();
        assert_eq!(ctx.state().status.state(), OrchestratorState::Terminated);
    }

    #[test]
    fn test_log_relay_falls_back_without_sink() {
        let (_sim, ctx) = context(SimulatedCoprocessor::new());
        ctx.state().relay_log(LogStream::Output, b"boot\n");

        let logs = test_support::record_logs(ctx.state());
        ctx.state().relay_log(LogStream::Output, b"boot\n");
        assert_eq!(logs.lock().unwrap().len(), 1);
    }
}
