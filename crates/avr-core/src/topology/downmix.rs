//! Downmix coefficient lookup
//!
//! A [`DownmixRom`] is an index of (input assignment, output assignment)
//! pairs, each carrying a Q15 coefficient matrix. The index is kept sorted by
//! the 64-bit key `(input_word << 32) + output_word` so lookups are a single
//! lower-bound binary search.
//!
//! The malleable bit is the top bit of the output word. A malleable target
//! therefore sorts before every malleable entry for the same input, and the
//! lower bound lands on the first of them. When both the target and the found
//! entry are malleable the entry is accepted and its concrete output mode is
//! reported back through [`DownmixResolution::resolved_output`]; the caller
//! decides where to store it.

use crate::config::ChannelSelect;
use crate::error::{AvrError, AvrResult};

use super::modes::{assignment_to_mode, mode_to_assignment, AudioMode};
use super::pairs::ChannelAssignment;

/// Channels on each side of the firmware mix matrix
pub const DMIX_CHANNELS: usize = 8;

/// Unity gain in Q15
pub const Q15_UNITY: i16 = 0x7fff;

const MAIN_LEFT: usize = 0;
const MAIN_RIGHT: usize = 1;
const MAIN_CNTR: usize = 3;

/// 8x8 Q15 mix matrix, indexed `[output][input]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoefficientTable {
    rows: [[i16; DMIX_CHANNELS]; DMIX_CHANNELS],
}

impl CoefficientTable {
    /// All-zero matrix
    pub fn zeros() -> Self {
        Self { rows: [[0; DMIX_CHANNELS]; DMIX_CHANNELS] }
    }

    /// Unity on the diagonal
    pub fn identity() -> Self {
        let mut table = Self::zeros();
        for i in 0..DMIX_CHANNELS {
            table.rows[i][i] = Q15_UNITY;
        }
        table
    }

    pub fn get(&self, output: usize, input: usize) -> i16 {
        self.rows[output][input]
    }

    pub fn rows(&self) -> &[[i16; DMIX_CHANNELS]; DMIX_CHANNELS] {
        &self.rows
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }
}

/// One index entry of the downmix ROM
#[derive(Debug, Clone, PartialEq)]
pub struct DownmixIndexEntry {
    pub input: ChannelAssignment,
    pub output: ChannelAssignment,
    pub input_dimension: usize,
    pub output_dimension: usize,
    /// Row-major `output_dimension x input_dimension` coefficients
    pub coefficients: Vec<i16>,
}

impl DownmixIndexEntry {
    fn sort_key(&self) -> u64 {
        sort_key(&self.input, &self.output)
    }
}

fn sort_key(input: &ChannelAssignment, output: &ChannelAssignment) -> u64 {
    ((input.encode() as u64) << 32) + output.encode() as u64
}

/// Sorted downmix coefficient index
#[derive(Debug, Clone, Default)]
pub struct DownmixRom {
    index: Vec<DownmixIndexEntry>,
}

impl DownmixRom {
    /// Validate and sort a set of entries
    pub fn new(mut entries: Vec<DownmixIndexEntry>) -> AvrResult<Self> {
        for entry in &entries {
            if entry.input_dimension > DMIX_CHANNELS {
                return Err(AvrError::validation(
                    "input_dimension",
                    entry.input_dimension,
                    "<= 8",
                ));
            }
            if entry.output_dimension > DMIX_CHANNELS {
                return Err(AvrError::validation(
                    "output_dimension",
                    entry.output_dimension,
                    "<= 8",
                ));
            }
            let expected = entry.input_dimension * entry.output_dimension;
            if entry.coefficients.len() != expected {
                return Err(AvrError::validation(
                    "coefficients",
                    entry.coefficients.len(),
                    "input_dimension * output_dimension values",
                ));
            }
        }
        entries.sort_by_key(|e| e.sort_key());
        Ok(Self { index: entries })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn lower_bound(&self, target: u64) -> Option<&DownmixIndexEntry> {
        let low = self.index.partition_point(|e| e.sort_key() < target);
        self.index.get(low)
    }
}

/// Result of a downmix lookup
#[derive(Debug, Clone, PartialEq)]
pub struct DownmixResolution {
    pub table: CoefficientTable,
    /// Concrete output mode chosen by a malleable entry
    ///
    /// When set, the caller must use this mode for the chain output instead
    /// of the one it asked for.
    pub resolved_output: Option<AudioMode>,
}

/// Find the downmix coefficients for `input` -> `output`
///
/// Identical modes give the identity matrix without consulting the ROM. A
/// dual-mono input is looked up as 2/0 (stereo select) or 1/0 (mono select);
/// with a mono select the centre coefficients are moved onto the selected
/// side. Returns `None` when the ROM has no entry, in which case the firmware
/// derives its own coefficients.
pub fn lookup_downmix(
    rom: &DownmixRom,
    input: AudioMode,
    output: AudioMode,
    select: ChannelSelect,
) -> Option<DownmixResolution> {
    if input == output {
        return Some(DownmixResolution {
            table: CoefficientTable::identity(),
            resolved_output: None,
        });
    }

    let effective_input = match input {
        AudioMode::Mode1p1 if select == ChannelSelect::Stereo => AudioMode::Mode20,
        AudioMode::Mode1p1 => AudioMode::Mode10,
        other => other,
    };

    let target_output = mode_to_assignment(output);
    let target_input = mode_to_assignment(effective_input);
    let target = sort_key(&target_input, &target_output);

    let entry = rom.lower_bound(target)?;

    let mut resolved_output = None;
    let matched = if target_output.malleable && entry.output.malleable {
        // the malleable wildcard only applies within the same input
        if entry.input != target_input {
            false
        } else {
            let mode = assignment_to_mode(entry.output);
            log::debug!(
                "lookup_downmix: malleable output surface resolved to {}",
                mode
            );
            resolved_output = Some(mode);
            true
        }
    } else {
        entry.sort_key() == target
    };

    if !matched {
        log::debug!(
            "lookup_downmix: no entry for {} to {}, using defaults",
            effective_input,
            output
        );
        return None;
    }

    let mut table = CoefficientTable::zeros();
    for x in 0..entry.output_dimension {
        for y in 0..entry.input_dimension {
            table.rows[x][y] = entry.coefficients[x * entry.input_dimension + y];
        }
    }

    if input == AudioMode::Mode1p1 && select != ChannelSelect::Stereo {
        let active = if select == ChannelSelect::MonoLeft {
            MAIN_LEFT
        } else {
            MAIN_RIGHT
        };
        for row in table.rows.iter_mut().take(entry.output_dimension) {
            row[active] = row[MAIN_CNTR];
            row[MAIN_CNTR] = 0;
        }
    }

    log::debug!(
        "lookup_downmix: custom table for {} to {}",
        effective_input,
        resolved_output.unwrap_or(output)
    );

    Some(DownmixResolution { table, resolved_output })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(input: AudioMode, output: ChannelAssignment, fill: i16) -> DownmixIndexEntry {
        DownmixIndexEntry {
            input: mode_to_assignment(input),
            output,
            input_dimension: 8,
            output_dimension: 8,
            coefficients: vec![fill; 64],
        }
    }

    #[test]
    fn test_identity_for_every_mode() {
        let rom = DownmixRom::default();
        for &mode in AudioMode::ALL {
            let res = lookup_downmix(&rom, mode, mode, ChannelSelect::Stereo).unwrap();
            assert!(res.table.is_identity(), "{}", mode);
            assert_eq!(res.resolved_output, None);
        }
    }

    #[test]
    fn test_exact_lookup() {
        let rom = DownmixRom::new(vec![
            entry(AudioMode::Mode32Lfe, mode_to_assignment(AudioMode::Mode20), 0x1000),
            entry(AudioMode::Mode32, mode_to_assignment(AudioMode::Mode20), 0x2000),
        ])
        .unwrap();

        let res = lookup_downmix(&rom, AudioMode::Mode32, AudioMode::Mode20, ChannelSelect::Stereo)
            .unwrap();
        assert_eq!(res.table.get(0, 0), 0x2000);
        assert_eq!(res.resolved_output, None);

        assert!(
            lookup_downmix(&rom, AudioMode::Mode34, AudioMode::Mode20, ChannelSelect::Stereo)
                .is_none()
        );
    }

    #[test]
    fn test_malleable_output_reports_resolved_mode() {
        let mut surface = mode_to_assignment(AudioMode::Mode30Lfe);
        surface.malleable = true;
        let rom = DownmixRom::new(vec![
            entry(AudioMode::Mode32Lfe, mode_to_assignment(AudioMode::Mode20), 0x1000),
            entry(AudioMode::Mode32Lfe, surface, 0x3000),
        ])
        .unwrap();

        let res = lookup_downmix(&rom, AudioMode::Mode32Lfe, AudioMode::ModeId, ChannelSelect::Stereo)
            .unwrap();
        assert_eq!(res.resolved_output, Some(AudioMode::Mode30Lfe));
        assert_eq!(res.table.get(7, 7), 0x3000);
    }

    #[test]
    fn test_malleable_does_not_cross_inputs() {
        let mut surface = mode_to_assignment(AudioMode::Mode20);
        surface.malleable = true;
        // sorts after every Mode34Lfe key, so the lower bound lands here
        let rom = DownmixRom::new(vec![entry(AudioMode::Mode20Lfe, surface, 0x3000)]).unwrap();
        assert!(
            lookup_downmix(&rom, AudioMode::Mode34Lfe, AudioMode::ModeId, ChannelSelect::Stereo)
                .is_none()
        );
    }

    #[test]
    fn test_dual_mono_migrates_centre() {
        // 1/0 carries the mono programme on the centre input (index 3)
        let mut rom_entry = entry(AudioMode::Mode10, mode_to_assignment(AudioMode::Mode20), 0);
        rom_entry.input_dimension = 4;
        rom_entry.output_dimension = 1;
        rom_entry.coefficients = vec![0x0001, 0x0002, 0x0003, 0x4000];
        let rom = DownmixRom::new(vec![rom_entry]).unwrap();

        let res = lookup_downmix(&rom, AudioMode::Mode1p1, AudioMode::Mode20, ChannelSelect::MonoRight)
            .unwrap();
        assert_eq!(res.table.get(0, 1), 0x4000);
        assert_eq!(res.table.get(0, 3), 0);
        assert_eq!(res.table.get(0, 0), 0x0001);

        let res = lookup_downmix(&rom, AudioMode::Mode1p1, AudioMode::Mode20, ChannelSelect::MonoLeft)
            .unwrap();
        assert_eq!(res.table.get(0, 0), 0x4000);
        assert_eq!(res.table.get(0, 3), 0);
    }

    #[test]
    fn test_rom_rejects_bad_dimensions() {
        let mut bad = entry(AudioMode::Mode20, mode_to_assignment(AudioMode::Mode10), 0);
        bad.coefficients.pop();
        assert!(DownmixRom::new(vec![bad]).is_err());
    }
}
