//! AVR simulator - runs the driver against the simulated transform engine
//!
//! Selects one input stream, plays with the mixer and the diagnostic
//! attributes, then shuts everything down.
//!
//! ## Command line
//!
//! - `avr-sim [CONFIG]`: load the YAML config at CONFIG instead of the
//!   default location

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use avr_core::command::{LogStream, TransformStatus};
use avr_core::config::{default_config_path, load_config, AvrConfig};
use avr_core::format::{InputEncoding, SpdifStatus};
use avr_core::mixer::MixerSettings;
use avr_core::sim::SimulatedCoprocessor;
use avr_core::topology::{AudioMode, DownmixRom};
use avr_core::{AvrDriver, LogSink};

/// Prints firmware log text to stdout
struct StdoutSink;

impl LogSink for StdoutSink {
    fn relay(&mut self, stream: LogStream, input: u8, bytes: &[u8]) {
        print!("[{}{}] {}", stream.name(), input, String::from_utf8_lossy(bytes));
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let config: AvrConfig = load_config(&path);
    log::info!("avr-sim starting with {}", path.display());

    let sim = Arc::new(
        SimulatedCoprocessor::new()
            .with_run_period(Duration::from_millis(10))
            .with_status_blocks(),
    );
    for _ in 0..20 {
        sim.script_run(TransformStatus {
            samples: 480,
            audio_mode: AudioMode::Mode32Lfe,
            spdif: SpdifStatus {
                encoding: InputEncoding::Ac3,
                ..Default::default()
            },
            ..Default::default()
        });
    }

    let driver = AvrDriver::new(sim.clone(), DownmixRom::default());
    let context = driver.select_input(0, &config)?;
    context.state().set_log_sink(Box::new(StdoutSink));

    thread::sleep(Duration::from_millis(100));
    driver.update_mixer_settings(MixerSettings {
        version: 1,
        master_latency_ms: 20,
        ..Default::default()
    })?;
    thread::sleep(Duration::from_millis(100));

    let diag = context.diagnostics();
    println!("input_format        {}", diag.input_format());
    println!("supported           {}", diag.supported_input_format());
    println!("game mode           {}", diag.supported_input_format_in_game_mode());
    println!("number_channels     {}", diag.number_channels());
    println!("sample_frequency    {}", diag.sample_frequency());
    println!("samples_processed   {}", diag.samples_processed());
    println!("decode_errors       {}", diag.decode_errors());
    println!("emergency_mute      {}", diag.emergency_mute());

    diag.store_emergency_mute("1")?;
    thread::sleep(Duration::from_millis(50));
    println!("emergency_mute      {}", diag.emergency_mute());
    if let Some(params) = sim.last_configure() {
        println!(
            "outputs muted       {}",
            params.chains.iter().all(|chain| chain.soft_mute)
        );
    }

    driver.shutdown()?;
    log::info!("avr-sim done");
    Ok(())
}
