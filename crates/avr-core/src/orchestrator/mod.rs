//! Transform orchestrator
//!
//! Drives the command protocol of one audio context from its worker thread.
//!
//! ```text
//!  Uninitialized ─▶ Initializing ─▶ Running ─▶ Stopping ─▶ Terminated
//!                        │                                     ▲
//!                        └───────────── failure ───────────────┘
//! ```
//!
//! While running, the worker sleeps on two receivers: control messages
//! (stop, reconfigure) and command completions. Every wake-up drains both,
//! so a burst of events is handled in one pass:
//!
//! 1. control messages set flags; a stop ends the pass
//! 2. completions are handled in arrival order; a Run completion is always
//!    followed by a fresh Run
//! 3. if a Configure is wanted it is issued, unless one is still pending, in
//!    which case a single follow-up is remembered
//!
//! Completion handlers on the transport side never touch this state; they
//! only flip slot atomics and queue events.

mod params;
mod status;

pub use params::{
    build_global_params, input_channels, ChainParams, DrcParams, GlobalParams, InputParams,
    ParamSources,
};
pub use status::{number_channels, DecoderSnapshot, OrchestratorState, StatusBoard, StatusChange};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::command::{
    CommandChannel, CommandKind, CommandPayload, CompletionEvent, CompletionNotifier,
    CompletionPayload, CompletionResult, InitParams, LogStream, SlotId, TransformStatus,
};
use crate::context::ContextState;
use crate::error::{AvrError, AvrResult};
use crate::fault::Liveness;
use crate::mute::EmergencyMuteReason;
use crate::pool::{BufferLease, BufferPool};

/// Requests sent to a worker from other threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Stop,
    /// Re-apply the global parameters
    Reconfigure,
}

/// Outcome of one loop pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Stop,
}

/// Worker-side protocol driver for one audio context
pub struct TransformOrchestrator {
    ctx: Arc<ContextState>,
    control_rx: Receiver<ControlMessage>,
    completion_tx: Sender<CompletionEvent>,
    completion_rx: Receiver<CompletionEvent>,
    channel: CommandChannel,
    pool: Option<BufferPool>,
    /// Log stream of each exchange slot, by buffer number
    buffer_streams: Vec<LogStream>,
    session_open: bool,
    need_configure: bool,
    need_another_configure: bool,
    first_run: bool,
    /// (free, capacity) of the pool when it was released
    pool_balance: Option<(usize, usize)>,
}

impl TransformOrchestrator {
    pub fn new(ctx: Arc<ContextState>, control_rx: Receiver<ControlMessage>) -> Self {
        let (completion_tx, completion_rx) = unbounded();
        let channel = CommandChannel::new(ctx.ledger.clone(), ctx.transport.clone());
        Self {
            ctx,
            control_rx,
            completion_tx,
            completion_rx,
            channel,
            pool: None,
            buffer_streams: Vec::new(),
            session_open: false,
            need_configure: false,
            need_another_configure: false,
            first_run: true,
            pool_balance: None,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.ctx.status.state()
    }

    pub fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    /// Free and total buffer count observed when the pool was released
    pub fn pool_balance(&self) -> Option<(usize, usize)> {
        self.pool_balance
    }

    // ========================================================================
    // Initializing
    // ========================================================================

    /// Bring up the transform session and start the first Configure and Run
    ///
    /// On failure the orchestrator is left in Terminated. A stop requested
    /// before bring-up also ends in Terminated, without opening a session.
    pub fn initialize(&mut self) -> AvrResult<()> {
        if self.ctx.stop_requested() {
            log::info!("initialize: stop requested before bring-up");
            self.ctx.status.set_state(OrchestratorState::Terminated);
            return Ok(());
        }
        self.ctx.status.set_state(OrchestratorState::Initializing);

        match self.bring_up() {
            Ok(()) => {
                self.ctx.status.set_state(OrchestratorState::Running);
                Ok(())
            }
            Err(err) => {
                log::error!("initialize: {}", err);
                if err.class() == crate::error::ErrorClass::TransportFailure {
                    self.ctx.mute.set_reason(EmergencyMuteReason::Error);
                }
                self.teardown();
                Err(err)
            }
        }
    }

    fn bring_up(&mut self) -> AvrResult<()> {
        self.ctx.ledger.reset();
        self.ctx.status.reset();
        self.need_configure = false;
        self.need_another_configure = false;
        self.first_run = true;
        self.pool_balance = None;

        let logging = self.ctx.logging();
        self.buffer_streams = [(logging.input, LogStream::Input), (logging.output, LogStream::Output)]
            .into_iter()
            .filter(|(enabled, _)| *enabled)
            .flat_map(|(_, stream)| std::iter::repeat(stream).take(logging.buffers_per_stream))
            .collect();

        let slots = self.channel.ledger().slot_count();
        if self.buffer_streams.len() + 2 > slots {
            return Err(AvrError::ResourceExhausted {
                what: "exchange buffer command slots",
                requested: self.buffer_streams.len(),
            });
        }

        self.pool = Some(BufferPool::allocate(self.buffer_streams.len(), logging.buffer_size)?);

        let capability = self.ctx.transport.capability()?;
        log::info!(
            "initialize: firmware {:#x} (DD {}, DTS {}, MPEG {})",
            capability.version,
            capability.dolby_digital,
            capability.dts,
            capability.mpeg
        );
        self.ctx.status.set_capability(capability);

        let audio = self.ctx.audio();
        let init = InitParams {
            input_id: audio.input,
            hdmi_layout: audio.hdmi_layout,
            channel_select: audio.channel_select,
            silence_threshold_db: audio.silence_threshold_db,
            silence_duration_ms: audio.silence_duration_ms,
            command_slots: slots,
        };
        let notifier = CompletionNotifier::new(self.ctx.ledger.clone(), self.completion_tx.clone());
        self.ctx.transport.init(&init, notifier)?;
        self.session_open = true;

        for n in 0..self.buffer_streams.len() {
            let lease = self.checkout()?;
            self.submit_buffer(n, lease)?;
        }

        self.launch_configure()?;
        self.launch_run()?;
        log::debug!("initialize: first Run issued");
        Ok(())
    }

    fn checkout(&mut self) -> AvrResult<BufferLease> {
        self.pool
            .as_mut()
            .and_then(BufferPool::checkout)
            .ok_or(AvrError::ResourceExhausted { what: "exchange buffer", requested: 1 })
    }

    // ========================================================================
    // Running
    // ========================================================================

    /// Wait for activity and handle everything that has arrived
    pub fn run_once(&mut self) -> AvrResult<Step> {
        if self.ctx.stop_requested() {
            return Ok(Step::Stop);
        }

        let timeout = self.ctx.driver_config().wait_timeout();
        let mut controls = Vec::new();
        let mut completions = Vec::new();

        let woke = crossbeam::select! {
            recv(self.control_rx) -> msg => {
                // a closed channel means every handle to the context is gone
                controls.push(msg.unwrap_or(ControlMessage::Stop));
                true
            },
            recv(self.completion_rx) -> event => {
                completions.extend(event.ok());
                true
            },
            default(timeout) => false,
        };

        if !woke {
            self.on_idle();
            return Ok(Step::Continue);
        }

        controls.extend(self.control_rx.try_iter());
        completions.extend(self.completion_rx.try_iter());

        for msg in controls {
            match msg {
                ControlMessage::Stop => {
                    log::debug!("run_once: stop requested");
                    return Ok(Step::Stop);
                }
                ControlMessage::Reconfigure => self.need_configure = true,
            }
        }
        if self.ctx.stop_requested() {
            return Ok(Step::Stop);
        }

        let mut configure_launched = false;
        if self.need_configure {
            log::debug!("run_once: update mixer parameters");
            self.launch_configure()?;
            configure_launched = true;
        }

        let mut runs = VecDeque::new();
        for event in completions {
            match event.kind {
                CommandKind::Run => runs.push_back(event),
                CommandKind::ExchangeBuffer => self.on_buffer_completion(event)?,
                CommandKind::Configure => self.on_configure_completion(event),
            }
        }
        for event in runs {
            self.on_run_completion(event, &mut configure_launched)?;
        }

        // follow-ups and worker-raised mutes from this pass
        if self.need_configure {
            self.launch_configure()?;
        }

        Ok(Step::Continue)
    }

    fn on_idle(&mut self) {
        if self.ctx.fault.check_liveness() == Liveness::Unresponsive {
            log::error!("run_once: transform engine does not seem alive any more");
            self.ctx.fault.force_diagnostics(Some(self.ctx.ledger.as_ref()));
        }
    }

    fn launch_configure(&mut self) -> AvrResult<()> {
        self.need_configure = false;

        if !self.channel.ledger().state(SlotId::CONFIGURE).is_terminal() {
            log::debug!("launch_configure: previous Configure still executing");
            self.need_another_configure = true;
            return Ok(());
        }
        // payload of the completed Configure is no longer needed
        let _ = self.channel.take_payload(SlotId::CONFIGURE);

        let audio = self.ctx.audio();
        let mixer = self.ctx.mixer.snapshot();
        let params = build_global_params(&ParamSources {
            audio: &audio,
            mixer: &mixer,
            rom: &self.ctx.rom,
            decoder_mode: self.ctx.status.decoder().audio_mode,
            target_latency_ms: self.ctx.sync.target_latency_ms(),
            compensatory_ms: self.ctx.sync.compensatory_latency_ms(),
            muted: self.ctx.mute.is_deployed(),
            force_crash: self.ctx.take_force_crash(),
        });
        log::debug!("launch_configure: {:?}", params);

        match self
            .channel
            .submit(SlotId::CONFIGURE, CommandPayload::Configure(Box::new(params)))
        {
            Ok(_) => Ok(()),
            Err(rejected) if matches!(rejected.error, AvrError::SlotBusy { .. }) => {
                self.need_another_configure = true;
                Ok(())
            }
            Err(rejected) => {
                self.ctx.mute.set_reason(EmergencyMuteReason::Error);
                Err(rejected.into())
            }
        }
    }

    fn launch_run(&mut self) -> AvrResult<()> {
        let _ = self.channel.take_payload(SlotId::RUN);
        if let Err(rejected) = self.channel.submit(SlotId::RUN, CommandPayload::Run) {
            if rejected.error.class() == crate::error::ErrorClass::TransportFailure {
                self.ctx.mute.set_reason(EmergencyMuteReason::Error);
            }
            return Err(rejected.into());
        }
        Ok(())
    }

    fn submit_buffer(&mut self, n: usize, lease: BufferLease) -> AvrResult<()> {
        let stream = self.buffer_streams[n];
        let payload = CommandPayload::ExchangeBuffer { lease, stream };
        match self.channel.submit(SlotId::buffer(n), payload) {
            Ok(_) => Ok(()),
            Err(rejected) => {
                if let CommandPayload::ExchangeBuffer { lease, .. } = rejected.payload {
                    self.release(lease);
                }
                Err(rejected.error)
            }
        }
    }

    fn release(&mut self, lease: BufferLease) {
        if let Some(pool) = self.pool.as_mut() {
            if let Err(err) = pool.release(lease) {
                log::error!("release: {}", err);
            }
        }
    }

    fn on_configure_completion(&mut self, event: CompletionEvent) {
        if event.result != CompletionResult::Success {
            log::warn!("on_configure_completion: Configure {} {:?}", event.id, event.result);
        }
        if self.need_another_configure {
            self.need_another_configure = false;
            self.need_configure = true;
        }
    }

    fn on_buffer_completion(&mut self, event: CompletionEvent) -> AvrResult<()> {
        let Some(CommandPayload::ExchangeBuffer { lease, stream }) = self.channel.take_payload(event.slot)
        else {
            log::warn!("on_buffer_completion: no buffer held by slot {}", event.slot.0);
            return Ok(());
        };

        let bytes = match (&event.result, event.payload) {
            (CompletionResult::Success, CompletionPayload::ExchangeBuffer { bytes }) => bytes,
            (result, _) => {
                log::warn!("on_buffer_completion: buffer {} returned {:?}", event.id, result);
                self.release(lease);
                return Ok(());
            }
        };

        if bytes.is_empty() {
            log::warn!(
                "on_buffer_completion: strange, {} buffer {} came back empty",
                stream.name(),
                lease.index()
            );
            self.release(lease);
            return Ok(());
        }

        if let Some(pool) = self.pool.as_mut() {
            pool.fill(&lease, &bytes)?;
            self.ctx.relay_log(stream, pool.data(&lease)?);
            pool.clear(&lease)?;
        }

        let n = event.slot.0 - SlotId::buffer(0).0;
        self.submit_buffer(n, lease)
    }

    fn on_run_completion(&mut self, event: CompletionEvent, configure_launched: &mut bool) -> AvrResult<()> {
        match (event.result, event.payload) {
            (CompletionResult::Success, CompletionPayload::Run(status)) => {
                self.on_transform_status(&status, configure_launched)?;
            }
            (CompletionResult::Aborted, _) => {
                log::debug!("on_run_completion: Run {} aborted", event.id);
            }
            (result, _) => {
                log::error!("on_run_completion: Run {} failed: {:?}", event.id, result);
                self.ctx.status.record(&TransformStatus {
                    decode_ok: false,
                    ..self.current_status()
                });
                self.deploy_mute(EmergencyMuteReason::Error);
            }
        }

        // the engine needs a Run outstanding at all times
        self.launch_run()
    }

    fn current_status(&self) -> TransformStatus {
        let snapshot = self.ctx.status.decoder();
        TransformStatus {
            decode_ok: true,
            samples: 0,
            sampling_frequency: snapshot.sampling_frequency,
            audio_mode: snapshot.audio_mode,
            spdif: snapshot.spdif,
            limiter: snapshot.limiter,
        }
    }

    fn on_transform_status(&mut self, status: &TransformStatus, configure_launched: &mut bool) -> AvrResult<()> {
        let previous_frequency = self.ctx.status.decoder().sampling_frequency;
        let change = self.ctx.status.record(status);

        if change.any() {
            log::info!(
                "on_transform_status: firmware {}{}{}{}change: {}{}-{}/{}/{}",
                if change.codec { "codec/" } else { "" },
                if change.mute { "mute/" } else { "" },
                if change.frequency { "frequency/" } else { "" },
                if change.topology { "topology/" } else { "" },
                status.spdif.encoding.name(),
                if status.spdif.silence { " SILENT" } else { "" },
                status.spdif.state.name(),
                status.sampling_frequency.hz(),
                status.audio_mode
            );

            if change.mute {
                self.deploy_mute(if change.frequency {
                    EmergencyMuteReason::SampleRateChange
                } else {
                    EmergencyMuteReason::Error
                });
            }
        }

        if self.first_run {
            self.first_run = false;
        } else if previous_frequency != status.sampling_frequency {
            self.deploy_mute(EmergencyMuteReason::SampleRateChange);
        } else if !status.decode_ok {
            self.deploy_mute(EmergencyMuteReason::Error);
        }

        if (change.any() || self.need_configure) && !*configure_launched {
            self.launch_configure()?;
            *configure_launched = true;
        }
        Ok(())
    }

    /// Raise a mute from the worker; applied by the next Configure
    fn deploy_mute(&mut self, reason: EmergencyMuteReason) {
        if self.ctx.mute.set_reason(reason) != reason {
            self.need_configure = true;
        }
    }

    // ========================================================================
    // Stopping
    // ========================================================================

    /// Abort outstanding work, close the session and return every buffer
    ///
    /// Always ends in Terminated. Fails with `Unresponsive` if the engine
    /// refused to terminate within the retry budget.
    pub fn shutdown(&mut self) -> AvrResult<()> {
        self.ctx.status.set_state(OrchestratorState::Stopping);
        let result = self.stop_session();
        self.teardown();
        result
    }

    fn stop_session(&mut self) -> AvrResult<()> {
        if !self.session_open {
            return Ok(());
        }

        let driver = self.ctx.driver_config().clone();
        for attempt in 1..=driver.terminate_retries {
            self.channel.abort_all();

            match self.ctx.transport.terminate() {
                Ok(()) => {
                    log::info!("stop_session: session terminated (attempt {})", attempt);
                    self.session_open = false;
                    return Ok(());
                }
                Err(err) => {
                    log::warn!(
                        "stop_session: terminate refused ({}), {} in flight, attempt {}/{}",
                        err,
                        self.ctx.ledger.in_flight(),
                        attempt,
                        driver.terminate_retries
                    );
                    self.settle(driver.terminate_wait());
                }
            }
        }

        log::error!("stop_session: failed to terminate the transform session");
        self.ctx.fault.force_diagnostics(Some(self.ctx.ledger.as_ref()));
        self.session_open = false;
        Err(AvrError::Unresponsive {
            waited_ms: driver.terminate_retries as u64 * driver.terminate_wait_ms,
        })
    }

    /// Wait up to `wait` for completions and take their buffers back
    fn settle(&mut self, wait: Duration) {
        if let Ok(event) = self.completion_rx.recv_timeout(wait) {
            self.absorb(event);
        }
        while let Ok(event) = self.completion_rx.try_recv() {
            self.absorb(event);
        }
    }

    fn absorb(&mut self, event: CompletionEvent) {
        if let Some(CommandPayload::ExchangeBuffer { lease, .. }) = self.channel.take_payload(event.slot) {
            self.release(lease);
        }
    }

    fn teardown(&mut self) {
        for payload in self.channel.reclaim_all() {
            if let CommandPayload::ExchangeBuffer { lease, .. } = payload {
                self.release(lease);
            }
        }
        while self.completion_rx.try_recv().is_ok() {}

        if let Some(pool) = self.pool.take() {
            if pool.free_count() != pool.capacity() {
                log::error!(
                    "teardown: {} of {} buffers leaked",
                    pool.leased_count(),
                    pool.capacity()
                );
            }
            self.pool_balance = Some((pool.free_count(), pool.capacity()));
        }

        self.session_open = false;
        self.ctx.status.set_state(OrchestratorState::Terminated);
    }

    // ========================================================================
    // Worker entry point
    // ========================================================================

    /// Worker thread body
    pub fn run(mut self) {
        log::info!("[AVR] worker for stream {} started", self.ctx.stream());

        let failed = match self.initialize() {
            Ok(()) => loop {
                match self.run_once() {
                    Ok(Step::Continue) => {}
                    Ok(Step::Stop) => {
                        if let Err(err) = self.shutdown() {
                            log::error!("[AVR] shutdown: {}", err);
                        }
                        break false;
                    }
                    Err(err) => {
                        log::error!("[AVR] worker failed: {}", err);
                        if let Err(err) = self.shutdown() {
                            log::error!("[AVR] shutdown: {}", err);
                        }
                        break true;
                    }
                }
            },
            Err(_) => true,
        };

        if failed && !self.ctx.stop_requested() {
            self.wait_for_stop();
        }

        log::info!("[AVR] worker for stream {} stopped", self.ctx.stream());
    }

    fn wait_for_stop(&self) {
        self.ctx.status.set_waiting_for_stop(true);
        log::warn!("[AVR] worker parked until stopped");
        loop {
            match self.control_rx.recv() {
                Ok(ControlMessage::Stop) | Err(_) => break,
                Ok(ControlMessage::Reconfigure) => {}
            }
        }
        self.ctx.status.set_waiting_for_stop(false);
    }
}
