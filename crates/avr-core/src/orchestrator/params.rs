//! Configure payload
//!
//! `GlobalParams` is the host-side, typed form of the global transform
//! parameters. It is rebuilt from scratch for every Configure from a snapshot
//! of the mixer settings, the audio options and the latency state.

use crate::config::{AudioConfig, ChannelSelect, HdmiLayout};
use crate::mixer::{MixerSettings, MAX_OUTPUT_CHAINS};
use crate::topology::{assignment_to_mode, lookup_downmix, AudioMode, CoefficientTable, DownmixRom};

/// Channels delivered by each physical input
pub fn input_channels(input: u8) -> u32 {
    if input == 1 {
        8
    } else {
        2
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputParams {
    pub input_id: u8,
    pub emphasis: bool,
    pub aac_decode: bool,
    pub hdmi_layout: HdmiLayout,
    pub multichannel: bool,
    pub silence_threshold_db: i32,
    pub silence_duration_ms: u32,
    pub channel_select: ChannelSelect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrcParams {
    /// Use the cut/boost factors below instead of the firmware default
    pub custom: bool,
    pub cut: u8,
    pub boost: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainParams {
    pub enabled: bool,
    pub gain_db: i32,
    pub delay_ms: i32,
    pub soft_mute: bool,
    pub output_mode: AudioMode,
    /// `None` lets the firmware derive its own coefficients
    pub downmix: Option<CoefficientTable>,
    /// `output_mode` was chosen by a malleable downmix entry
    pub resolved_from_malleable: bool,
}

/// Global transform parameters sent with every Configure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalParams {
    pub input: InputParams,
    pub drc: DrcParams,
    /// Total system latency in milliseconds
    pub latency_ms: u32,
    pub chains: Vec<ChainParams>,
    /// Ask the firmware to crash itself (diagnostics)
    pub force_crash: bool,
}

/// Everything a Configure is built from
#[derive(Debug, Clone, Copy)]
pub struct ParamSources<'a> {
    pub audio: &'a AudioConfig,
    pub mixer: &'a MixerSettings,
    pub rom: &'a DownmixRom,
    /// Mode the decoder currently produces; input side of the downmix
    pub decoder_mode: AudioMode,
    pub target_latency_ms: u32,
    pub compensatory_ms: u32,
    pub muted: bool,
    pub force_crash: bool,
}

pub fn build_global_params(src: &ParamSources<'_>) -> GlobalParams {
    let audio = src.audio;

    let input = InputParams {
        input_id: audio.input,
        emphasis: audio.emphasis,
        aac_decode: audio.aac_decode,
        hdmi_layout: audio.hdmi_layout,
        multichannel: audio.hdmi_layout != HdmiLayout::Layout0 && input_channels(audio.input) == 8,
        silence_threshold_db: audio.silence_threshold_db,
        silence_duration_ms: audio.silence_duration_ms,
        channel_select: audio.channel_select,
    };

    let drc = if src.mixer.drc.enabled {
        DrcParams {
            custom: true,
            cut: src.mixer.drc.cut,
            boost: src.mixer.drc.boost,
        }
    } else {
        DrcParams::default()
    };

    let latency_ms = src.target_latency_ms + src.mixer.master_latency_ms.max(0) as u32;

    let chains = src
        .mixer
        .chains
        .iter()
        .take(MAX_OUTPUT_CHAINS)
        .enumerate()
        .map(|(n, chain)| {
            let mut output_mode = if chain.topology.malleable {
                AudioMode::ModeId
            } else {
                assignment_to_mode(chain.topology)
            };

            // a disconnected chain has nothing to resolve; leave it to the firmware
            if !chain.topology.malleable && output_mode == AudioMode::ModeId {
                log::debug!("build_global_params: chain {} is disconnected", n);
                return ChainParams {
                    enabled: chain.enabled,
                    gain_db: chain.gain_db,
                    delay_ms: chain.latency_ms + src.compensatory_ms as i32,
                    soft_mute: !chain.enabled || src.muted,
                    output_mode,
                    downmix: None,
                    resolved_from_malleable: false,
                };
            }

            let mut resolved_from_malleable = false;
            let downmix = lookup_downmix(src.rom, src.decoder_mode, output_mode, audio.channel_select)
                .map(|resolution| {
                    if let Some(resolved) = resolution.resolved_output.filter(|_| chain.topology.malleable) {
                        log::debug!(
                            "build_global_params: chain {} output {} resolved to {}",
                            n,
                            output_mode,
                            resolved
                        );
                        output_mode = resolved;
                        resolved_from_malleable = true;
                    }
                    resolution.table
                });

            ChainParams {
                enabled: chain.enabled,
                gain_db: chain.gain_db,
                delay_ms: chain.latency_ms + src.compensatory_ms as i32,
                soft_mute: !chain.enabled || src.muted,
                output_mode,
                downmix,
                resolved_from_malleable,
            }
        })
        .collect();

    GlobalParams {
        input,
        drc,
        latency_ms,
        chains,
        force_crash: src.force_crash,
    }
}
