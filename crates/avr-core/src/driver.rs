//! Driver entry points
//!
//! `AvrDriver` keeps one [`AudioContext`] per selected stream and the state
//! every context shares: the mixer settings and the downmix ROM.
//! `DriverThread` runs a context's [`TransformOrchestrator`] on a named
//! worker thread.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};

use crate::command::Coprocessor;
use crate::config::AvrConfig;
use crate::context::{AudioContext, ContextState, StreamId};
use crate::error::{AvrError, AvrResult};
use crate::mixer::{MixerSettings, SharedMixer};
use crate::orchestrator::{ControlMessage, TransformOrchestrator};
use crate::topology::DownmixRom;

// ============================================================================
// Worker thread
// ============================================================================

struct Worker {
    handle: JoinHandle<()>,
    /// Disconnects when the worker returns
    done_rx: Receiver<()>,
}

/// Handle to a context's worker thread
#[derive(Default)]
pub struct DriverThread {
    worker: Option<Worker>,
}

impl DriverThread {
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Spawn the worker unless one is already running
    pub fn start(&mut self, ctx: Arc<ContextState>, control_rx: Receiver<ControlMessage>) -> AvrResult<()> {
        if let Some(worker) = &self.worker {
            if !worker.handle.is_finished() {
                return Ok(());
            }
            log::warn!("DriverThread: worker for stream {} exited on its own", ctx.stream());
            if let Some(worker) = self.worker.take() {
                let _ = worker.handle.join();
            }
        }

        // messages left over from the previous session are obsolete
        while control_rx.try_recv().is_ok() {}
        ctx.set_stop(false);
        let (done_tx, done_rx) = bounded::<()>(0);
        let orchestrator = TransformOrchestrator::new(ctx.clone(), control_rx);

        let handle = thread::Builder::new()
            .name(format!("avr-audio-{}", ctx.stream()))
            .spawn(move || {
                let _done = done_tx;
                orchestrator.run();
            })?;

        self.worker = Some(Worker { handle, done_rx });
        Ok(())
    }

    /// Ask the worker to stop and wait up to the configured stop timeout
    ///
    /// On timeout the handle is kept so the stop can be retried.
    pub fn stop(&mut self, ctx: &ContextState) -> AvrResult<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        ctx.set_stop(true);
        ctx.send_control(ControlMessage::Stop);

        let timeout = ctx.driver_config().stop_timeout();
        match worker.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    log::error!("DriverThread: worker for stream {} panicked", ctx.stream());
                }
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                log::error!(
                    "DriverThread: worker for stream {} did not stop within {:?}",
                    ctx.stream(),
                    timeout
                );
                ctx.fault.force_diagnostics(Some(ctx.ledger.as_ref()));
                self.worker = Some(worker);
                Err(AvrError::Unresponsive {
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

pub struct AvrDriver {
    transport: Arc<dyn Coprocessor>,
    mixer: Arc<SharedMixer>,
    rom: Arc<DownmixRom>,
    contexts: RwLock<HashMap<StreamId, Arc<AudioContext>>>,
}

impl AvrDriver {
    pub fn new(transport: Arc<dyn Coprocessor>, rom: DownmixRom) -> Self {
        Self {
            transport,
            mixer: Arc::new(SharedMixer::default()),
            rom: Arc::new(rom),
            contexts: RwLock::new(HashMap::new()),
        }
    }

    pub fn mixer(&self) -> &Arc<SharedMixer> {
        &self.mixer
    }

    /// Create, register and start the context of `stream`
    pub fn select_input(&self, stream: StreamId, config: &AvrConfig) -> AvrResult<Arc<AudioContext>> {
        let mut contexts = self.contexts.write().unwrap_or_else(|e| e.into_inner());
        if contexts.contains_key(&stream) {
            return Err(AvrError::validation("stream", stream, "a stream without a context"));
        }

        let context = Arc::new(AudioContext::new(
            stream,
            config,
            self.transport.clone(),
            self.mixer.clone(),
            self.rom.clone(),
        )?);
        context.state().sync.invalidate();
        context.start()?;

        log::info!("select_input: stream {} selected (input {})", stream, config.audio.input);
        contexts.insert(stream, context.clone());
        Ok(context)
    }

    pub fn context(&self, stream: StreamId) -> AvrResult<Arc<AudioContext>> {
        self.contexts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&stream)
            .cloned()
            .ok_or(AvrError::UnknownStream(stream))
    }

    pub fn streams(&self) -> Vec<StreamId> {
        let mut streams: Vec<StreamId> = self
            .contexts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        streams.sort_unstable();
        streams
    }

    /// Stop the worker of `stream` and forget its context
    ///
    /// A worker that cannot be stopped keeps the context registered.
    pub fn deselect(&self, stream: StreamId) -> AvrResult<()> {
        let context = self.context(stream)?;
        if let Err(err) = context.stop() {
            log::error!("deselect: stream {}: {}", stream, err);
            return Err(AvrError::Busy);
        }
        self.contexts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&stream);
        log::info!("deselect: stream {} released", stream);
        Ok(())
    }

    /// Deselect every stream; the first failure is returned
    pub fn shutdown(&self) -> AvrResult<()> {
        let mut result = Ok(());
        for stream in self.streams() {
            if let Err(err) = self.deselect(stream) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Replace the mixer settings and push them to every context
    ///
    /// Returns whether anything changed. Settings equal to the current ones
    /// apart from the version are accepted without a reconfigure.
    pub fn update_mixer_settings(&self, settings: MixerSettings) -> AvrResult<bool> {
        let master = settings.master_latency_ms;
        let chains = settings.chain_latencies();

        if !self.mixer.replace(settings)? {
            log::debug!("update_mixer_settings: no change");
            return Ok(false);
        }
        log::info!("update_mixer_settings: master latency {}ms", master);

        let contexts: Vec<Arc<AudioContext>> = self
            .contexts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for context in contexts {
            context.update_master_latency(master, &chains);
            context.instant_apply();
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::config::DriverConfig;
    use crate::latency::PES_UNITS_PER_MS;
    use crate::orchestrator::OrchestratorState;
    use crate::sim::SimulatedCoprocessor;
    use std::time::{Duration, Instant};

    fn wait_for(what: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if what() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn driver(sim: SimulatedCoprocessor) -> (Arc<SimulatedCoprocessor>, AvrDriver) {
        let sim = Arc::new(sim);
        (sim.clone(), AvrDriver::new(sim, DownmixRom::default()))
    }

    #[test]
    fn test_select_and_deselect() {
        let (sim, driver) = driver(SimulatedCoprocessor::new().hold(CommandKind::Run));
        let ctx = driver.select_input(3, &AvrConfig::default()).unwrap();
        assert!(ctx.is_running());
        assert!(ctx.state().sync.is_pending());
        assert!(driver.select_input(3, &AvrConfig::default()).is_err());
        assert_eq!(driver.streams(), vec![3]);

        assert!(wait_for(|| ctx.state().status.state() == OrchestratorState::Running));
        driver.deselect(3).unwrap();
        assert_eq!(ctx.state().status.state(), OrchestratorState::Terminated);
        assert!(!sim.is_session_open());
        assert!(matches!(driver.deselect(3), Err(AvrError::UnknownStream(3))));
    }

    #[test]
    fn test_start_is_idempotent() {
        let (sim, driver) = driver(SimulatedCoprocessor::new().hold(CommandKind::Run));
        let ctx = driver.select_input(0, &AvrConfig::default()).unwrap();
        assert!(wait_for(|| sim.sent_count(CommandKind::Run) == 1));
        ctx.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(sim.sent_count(CommandKind::Run), 1);
        driver.shutdown().unwrap();
        assert!(driver.streams().is_empty());
    }

    #[test]
    fn test_mixer_update_reaches_running_contexts() {
        let (sim, driver) = driver(SimulatedCoprocessor::new().hold(CommandKind::Run));
        let ctx = driver.select_input(0, &AvrConfig::default()).unwrap();
        assert!(wait_for(|| sim.sent_count(CommandKind::Configure) == 1));

        let changed = driver
            .update_mixer_settings(MixerSettings { master_latency_ms: 60, ..Default::default() })
            .unwrap();
        assert!(changed);
        assert!(wait_for(|| sim.sent_count(CommandKind::Configure) == 2));
        assert_eq!(sim.last_configure().unwrap().latency_ms, 100);
        assert_eq!(ctx.state().sync.av_offset(), 60 * PES_UNITS_PER_MS);

        // only the version differs
        let changed = driver
            .update_mixer_settings(MixerSettings {
                version: 9,
                master_latency_ms: 60,
                ..Default::default()
            })
            .unwrap();
        assert!(!changed);
        driver.shutdown().unwrap();
        assert_eq!(sim.sent_count(CommandKind::Configure), 2);
    }

    #[test]
    fn test_unresponsive_worker_keeps_context() {
        let config = AvrConfig {
            driver: DriverConfig {
                stop_timeout_ms: 20,
                terminate_wait_ms: 50,
                terminate_retries: 8,
                ..Default::default()
            },
            ..Default::default()
        };
        let (sim, driver) = driver(
            SimulatedCoprocessor::new()
                .hold_all()
                .refuse_terminate(8)
                .with_status_blocks(),
        );
        let ctx = driver.select_input(1, &config).unwrap();
        assert!(wait_for(|| ctx.state().status.state() == OrchestratorState::Running));

        assert!(matches!(driver.deselect(1), Err(AvrError::Busy)));
        assert_eq!(driver.streams(), vec![1]);
        assert!(ctx.state().fault.is_issued());

        // the worker gives up on terminate after its retries and can be reaped
        assert!(wait_for(|| ctx.state().status.state() == OrchestratorState::Terminated));
        driver.deselect(1).unwrap();
        assert!(sim.terminate_attempts() >= 8);
    }
}
