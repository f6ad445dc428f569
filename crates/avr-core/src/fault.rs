//! Coprocessor liveness and post-mortem diagnostics
//!
//! Each processing unit of the transform engine may expose a status block
//! that survives a crash. The monitor reads those blocks to decide whether
//! the engine is still alive and, once it is not, assembles a single
//! post-mortem report.
//!
//! ```text
//!   force_diagnostics
//!        │
//!        ├─ Running units ──raise_interrupt──┐
//!        ├─ Trapped units ───────────────────┤ sleep(grace), re-read
//!        └─ Crash/Livelock/Deadlock ─────────┘
//!                         │
//!                         ▼
//!   report dead and trapped units (or the killed ones) + outstanding commands
//! ```
//!
//! The report is issued at most once per monitor, and only when the primary
//! unit exposes a status block.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::command::{CommandKind, CommandLedger, Coprocessor, OutstandingCommand};
use crate::error::{AvrError, AvrResult};

/// Grace period before trapped or interrupted units are re-read
pub const DEFAULT_TRAP_GRACE: Duration = Duration::from_millis(100);

/// Processing units of the transform engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingUnit {
    Audio0,
    Audio1,
}

impl ProcessingUnit {
    pub const ALL: [ProcessingUnit; 2] = [ProcessingUnit::Audio0, ProcessingUnit::Audio1];

    pub fn name(self) -> &'static str {
        match self {
            ProcessingUnit::Audio0 => "audio0",
            ProcessingUnit::Audio1 => "audio1",
        }
    }

    /// Interrupt CPU the unit is wired to
    pub fn interrupt_cpu(self) -> u32 {
        match self {
            ProcessingUnit::Audio0 => 3,
            ProcessingUnit::Audio1 => 4,
        }
    }
}

/// Run state recorded in a status block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitStatus {
    #[default]
    Running,
    /// Stopped in a trap handler; usually transient
    Trapped,
    Crash,
    Livelock,
    Deadlock,
}

impl UnitStatus {
    pub fn name(self) -> &'static str {
        match self {
            UnitStatus::Running => "RUNNING",
            UnitStatus::Trapped => "TRAPPED",
            UnitStatus::Crash => "CRASH",
            UnitStatus::Livelock => "LIVELOCK",
            UnitStatus::Deadlock => "DEADLOCK",
        }
    }

    /// Crash, livelock or deadlock
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Crash | UnitStatus::Livelock | UnitStatus::Deadlock)
    }
}

/// Contents of one processing unit's status block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostMortemRecord {
    pub status: UnitStatus,
    pub message: String,
    pub release: String,
    /// Build identity (date, host, compiler)
    pub build: String,
    pub pc: u32,
    pub sp: u32,
    pub link: u32,
    pub psw: u32,
    /// General purpose registers; R0 is hard-wired and not reported
    pub registers: [u32; 64],
    pub branch_bits: [u32; 8],
    /// Return addresses, innermost first
    pub backtrace: Vec<u32>,
    /// The status block layout is newer than the host understands
    pub version_skew: bool,
}

impl Default for PostMortemRecord {
    fn default() -> Self {
        Self {
            status: UnitStatus::Running,
            message: String::new(),
            release: String::new(),
            build: String::new(),
            pc: 0,
            sp: 0,
            link: 0,
            psw: 0,
            registers: [0; 64],
            branch_bits: [0; 8],
            backtrace: Vec::new(),
            version_skew: false,
        }
    }
}

/// Result of a liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Unresponsive,
}

/// Structured post-mortem report
#[derive(Debug, Clone)]
pub struct PostMortemReport {
    pub units: Vec<(ProcessingUnit, PostMortemRecord)>,
    pub outstanding: Vec<OutstandingCommand>,
    /// Refused slot reuses per command kind
    pub reuse: Vec<(CommandKind, u32)>,
}

impl fmt::Display for PostMortemReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Audio firmware post-mortem report")?;
        writeln!(f, "=================================")?;

        for (unit, record) in &self.units {
            writeln!(f)?;
            writeln!(
                f,
                "{} (CPU {}): {}",
                unit.name(),
                unit.interrupt_cpu(),
                record.status.name()
            )?;
            if record.version_skew {
                writeln!(f, "WARNING: status block version is newer than this driver")?;
            }
            writeln!(f, "Message: {}", record.message)?;
            writeln!(f, "Release: {}", record.release)?;
            writeln!(f, "Build:   {}", record.build)?;
            writeln!(
                f,
                "PC   0x{:08x}  SP   0x{:08x}  LINK 0x{:08x}  PSW  0x{:08x}",
                record.pc, record.sp, record.link, record.psw
            )?;

            for row in (1..64).collect::<Vec<_>>().chunks(4) {
                let line: Vec<String> = row
                    .iter()
                    .map(|&r| format!("R{:<2} 0x{:08x}", r, record.registers[r]))
                    .collect();
                writeln!(f, "{}", line.join("  "))?;
            }

            let branch: Vec<String> = record
                .branch_bits
                .iter()
                .enumerate()
                .map(|(i, b)| format!("BR{} 0x{:08x}", i, b))
                .collect();
            writeln!(f, "{}", branch.join("  "))?;

            writeln!(f, "Call trace:")?;
            if record.backtrace.is_empty() {
                writeln!(f, "  <none>")?;
            }
            for (depth, addr) in record.backtrace.iter().enumerate() {
                writeln!(f, "  #{:<2} 0x{:08x}", depth, addr)?;
            }
        }

        writeln!(f)?;
        writeln!(f, "Outstanding commands: {}", self.outstanding.len())?;
        for command in &self.outstanding {
            writeln!(
                f,
                "  slot {:<2} {:<28} id {} {:?}",
                command.slot.0,
                command.kind.name(),
                command.id,
                command.state
            )?;
        }

        let reuse: Vec<String> = self
            .reuse
            .iter()
            .map(|(kind, count)| format!("{} {}", kind.name(), count))
            .collect();
        write!(f, "Refused slot reuse: {}", reuse.join(", "))
    }
}

/// Watches the status blocks of the transform engine
pub struct FaultMonitor {
    transport: Arc<dyn Coprocessor>,
    grace: Duration,
    already_issued: AtomicBool,
    report: Mutex<Option<Arc<PostMortemReport>>>,
}

impl FaultMonitor {
    pub fn new(transport: Arc<dyn Coprocessor>, grace: Duration) -> Self {
        Self {
            transport,
            grace,
            already_issued: AtomicBool::new(false),
            report: Mutex::new(None),
        }
    }

    /// Whether a post-mortem report has been issued
    pub fn is_issued(&self) -> bool {
        self.already_issued.load(Ordering::Acquire)
    }

    /// The report issued by `force_diagnostics`, if any
    pub fn report(&self) -> Option<Arc<PostMortemReport>> {
        self.report.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether the engine looks alive
    ///
    /// Without any status block the engine is assumed alive.
    pub fn check_liveness(&self) -> Liveness {
        if self.is_issued() {
            return Liveness::Unresponsive;
        }

        let failed = ProcessingUnit::ALL.iter().find_map(|&unit| {
            self.transport
                .post_mortem(unit)
                .filter(|record| record.status != UnitStatus::Running)
                .map(|record| (unit, record.status))
        });

        match failed {
            Some((unit, status)) => {
                log::warn!("check_liveness: {} reports {}", unit.name(), status.name());
                Liveness::Unresponsive
            }
            None => Liveness::Alive,
        }
    }

    /// Assemble, log and keep the post-mortem report
    ///
    /// Returns `None` if the platform exposes no status block for the primary
    /// unit or a report was already issued. Trapped units count as dead.
    pub fn force_diagnostics(&self, ledger: Option<&CommandLedger>) -> Option<Arc<PostMortemReport>> {
        let initial: Vec<(ProcessingUnit, PostMortemRecord)> = ProcessingUnit::ALL
            .iter()
            .filter_map(|&unit| self.transport.post_mortem(unit).map(|r| (unit, r)))
            .collect();

        if !initial.iter().any(|(unit, _)| *unit == ProcessingUnit::Audio0) {
            log::debug!("force_diagnostics: no primary status block exposed");
            return None;
        }

        if self.already_issued.swap(true, Ordering::AcqRel) {
            return None;
        }

        let mut dead = Vec::new();
        let mut killed = Vec::new();
        let mut need_grace = false;

        for (unit, record) in &initial {
            match record.status {
                UnitStatus::Running => {
                    // stop the sibling so both snapshots are consistent
                    log::info!("force_diagnostics: interrupting {}", unit.name());
                    if let Err(err) = self.transport.raise_interrupt(unit.interrupt_cpu()) {
                        log::warn!("force_diagnostics: cannot interrupt {}: {}", unit.name(), err);
                    }
                    killed.push(*unit);
                    need_grace = true;
                }
                UnitStatus::Trapped => {
                    // a trap may still settle into a crash record
                    dead.push(*unit);
                    need_grace = true;
                }
                _ => dead.push(*unit),
            }
        }

        if need_grace {
            thread::sleep(self.grace);
        }

        let chosen = if dead.is_empty() { killed } else { dead };
        let units = chosen
            .into_iter()
            .map(|unit| {
                let record = self
                    .transport
                    .post_mortem(unit)
                    .or_else(|| {
                        initial
                            .iter()
                            .find(|(u, _)| *u == unit)
                            .map(|(_, r)| r.clone())
                    })
                    .unwrap_or_default();
                (unit, record)
            })
            .collect();

        let (outstanding, reuse) = match ledger {
            Some(ledger) => (
                ledger.outstanding(),
                [CommandKind::Configure, CommandKind::Run, CommandKind::ExchangeBuffer]
                    .into_iter()
                    .map(|kind| (kind, ledger.reuse_count(kind)))
                    .collect(),
            ),
            None => (Vec::new(), Vec::new()),
        };

        let report = Arc::new(PostMortemReport { units, outstanding, reuse });
        log::error!("{}", report);

        *self.report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        Some(report)
    }

    /// Raise a diagnostic interrupt on one of the engine's CPUs
    ///
    /// CPU 0 is the host and cannot be interrupted this way.
    pub fn raise_interrupt(&self, cpu: u32) -> AvrResult<()> {
        if !(1..=4).contains(&cpu) {
            return Err(AvrError::Unsupported(format!("interrupt on CPU {}", cpu)));
        }
        log::info!("raise_interrupt: raising interrupt on CPU {}", cpu);
        self.transport.raise_interrupt(cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedCoprocessor;

    fn monitor(sim: &Arc<SimulatedCoprocessor>) -> FaultMonitor {
        FaultMonitor::new(sim.clone(), Duration::from_millis(1))
    }

    #[test]
    fn test_alive_without_status_blocks() {
        let sim = Arc::new(SimulatedCoprocessor::new());
        let monitor = monitor(&sim);
        assert_eq!(monitor.check_liveness(), Liveness::Alive);
        assert!(monitor.force_diagnostics(None).is_none());
        assert!(!monitor.is_issued());
    }

    #[test]
    fn test_crash_is_reported_once() {
        let sim = Arc::new(SimulatedCoprocessor::new().with_status_blocks());
        let monitor = monitor(&sim);
        assert_eq!(monitor.check_liveness(), Liveness::Alive);

        sim.crash(ProcessingUnit::Audio0, "divide by zero");
        assert_eq!(monitor.check_liveness(), Liveness::Unresponsive);

        let report = monitor.force_diagnostics(None).unwrap();
        assert_eq!(report.units.len(), 1);
        assert_eq!(report.units[0].0, ProcessingUnit::Audio0);
        assert_eq!(report.units[0].1.status, UnitStatus::Crash);
        // the running sibling was interrupted for a joint snapshot
        assert_eq!(sim.interrupts(), vec![4]);

        assert!(monitor.force_diagnostics(None).is_none());
        assert!(monitor.force_diagnostics(None).is_none());
        assert!(monitor.is_issued());
        assert_eq!(monitor.check_liveness(), Liveness::Unresponsive);
        assert!(monitor.report().is_some());
    }

    #[test]
    fn test_killed_units_reported_when_none_dead() {
        let sim = Arc::new(SimulatedCoprocessor::new().with_status_blocks());
        let monitor = monitor(&sim);
        let report = monitor.force_diagnostics(None).unwrap();
        assert_eq!(report.units.len(), 2);
        assert_eq!(sim.interrupts(), vec![3, 4]);
    }

    #[test]
    fn test_report_text() {
        let sim = Arc::new(SimulatedCoprocessor::new().with_status_blocks());
        sim.crash(ProcessingUnit::Audio1, "stack overflow");
        let ledger = CommandLedger::new(1);
        let text = monitor(&sim)
            .force_diagnostics(Some(&ledger))
            .unwrap()
            .to_string();
        assert!(text.starts_with("Audio firmware post-mortem report"));
        assert!(text.contains("audio1 (CPU 4): CRASH"));
        assert!(text.contains("Message: stack overflow"));
        assert!(text.contains("R63"));
        assert!(text.contains("BR7"));
        assert!(text.contains("Outstanding commands: 0"));
        assert!(text.contains("TRANSFORM 0"));
    }

    #[test]
    fn test_trapped_unit_reported_with_crashed_one() {
        let sim = Arc::new(SimulatedCoprocessor::new().with_status_blocks());
        sim.crash(ProcessingUnit::Audio0, "bus error");
        sim.raise_interrupt(ProcessingUnit::Audio1.interrupt_cpu()).unwrap();

        let report = monitor(&sim).force_diagnostics(None).unwrap();
        let units: Vec<_> = report.units.iter().map(|(u, r)| (*u, r.status)).collect();
        assert_eq!(
            units,
            vec![
                (ProcessingUnit::Audio0, UnitStatus::Crash),
                (ProcessingUnit::Audio1, UnitStatus::Trapped),
            ]
        );
        // nothing was left running, so nothing more was interrupted
        assert_eq!(sim.interrupts(), vec![4]);
    }

    #[test]
    fn test_trapped_unit_reported_alone_next_to_running_one() {
        let sim = Arc::new(SimulatedCoprocessor::new().with_status_blocks());
        sim.raise_interrupt(4).unwrap();

        let report = monitor(&sim).force_diagnostics(None).unwrap();
        assert_eq!(report.units.len(), 1);
        assert_eq!(report.units[0].0, ProcessingUnit::Audio1);
        assert_eq!(sim.interrupts(), vec![4, 3]);
    }

    #[test]
    fn test_no_report_without_primary_block() {
        let sim = Arc::new(
            SimulatedCoprocessor::new()
                .with_status_blocks()
                .without_status_block(ProcessingUnit::Audio0),
        );
        sim.crash(ProcessingUnit::Audio1, "stack overflow");
        let monitor = monitor(&sim);
        assert!(monitor.force_diagnostics(None).is_none());
        assert!(!monitor.is_issued());
    }

    #[test]
    fn test_raise_interrupt_range() {
        let sim = Arc::new(SimulatedCoprocessor::new());
        let monitor = monitor(&sim);
        assert!(matches!(monitor.raise_interrupt(0), Err(AvrError::Unsupported(_))));
        assert!(matches!(monitor.raise_interrupt(5), Err(AvrError::Unsupported(_))));
        monitor.raise_interrupt(3).unwrap();
        assert_eq!(sim.interrupts(), vec![3]);
    }
}
