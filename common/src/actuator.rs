//! Keypad driver that reproduces the thermostat's manual entry procedure.
//!
//! Buttons are active-low: a press drives the line low for `press_ms`, then
//! releases it high and waits `settle_ms` before the next press. Every command
//! starts from the zero procedure, so the emitted sequence depends only on the
//! target and never on what was commanded before.

use core::fmt;

use thiserror::Error;

use crate::{config::ActuatorConfig, types::MAX_TEMPERATURE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ButtonLine {
    Set,
    Decrement,
    Increment,
    Shift,
}

impl ButtonLine {
    pub const ALL: [ButtonLine; 4] = [Self::Set, Self::Decrement, Self::Increment, Self::Shift];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Set => "SET",
            Self::Decrement => "DECREMENT",
            Self::Increment => "INCREMENT",
            Self::Shift => "SHIFT",
        }
    }
}

impl fmt::Display for ButtonLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
        }
    }
}

/// The four digital outputs wired across the thermostat's buttons.
pub trait ButtonLines {
    type Error: fmt::Display;

    fn drive(&mut self, line: ButtonLine, level: Level) -> Result<(), Self::Error>;
}

/// Monotonic millisecond clock the pulse timing is measured against.
pub trait Clock {
    fn now_ms(&self) -> u64;
    fn sleep_until(&mut self, deadline_ms: u64);
}

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("target {0} is outside 0..=999")]
    OutOfRange(u16),
    #[error("failed to drive {line} {level}: {message}")]
    Line {
        line: ButtonLine,
        level: &'static str,
        message: String,
    },
    #[error("{command}; releasing the lines afterwards also failed: {release}")]
    Unreleased {
        command: Box<ActuatorError>,
        release: Box<ActuatorError>,
    },
}

/// Presses that drive the display to zero from any prior value.
const ZERO_PROCEDURE: [ButtonLine; 7] = [
    ButtonLine::Set,
    ButtonLine::Shift,
    ButtonLine::Shift,
    ButtonLine::Shift,
    ButtonLine::Decrement,
    ButtonLine::Decrement,
    ButtonLine::Set,
];

/// Full press list for `target`: zero procedure, SET to enter data entry at the
/// units digit, INCREMENTs per digit least significant first with a SHIFT
/// before each higher digit that still has a non-zero digit at or above it,
/// then SET to commit.
pub fn press_sequence(target: u16) -> Result<Vec<ButtonLine>, ActuatorError> {
    if target > MAX_TEMPERATURE {
        return Err(ActuatorError::OutOfRange(target));
    }

    let units = usize::from(target % 10);
    let tens = usize::from((target / 10) % 10);
    let hundreds = usize::from(target / 100);

    let mut presses = Vec::with_capacity(ZERO_PROCEDURE.len() + 3 + units + tens + hundreds);
    presses.extend_from_slice(&ZERO_PROCEDURE);
    presses.push(ButtonLine::Set);

    presses.extend(std::iter::repeat(ButtonLine::Increment).take(units));
    if tens > 0 || hundreds > 0 {
        presses.push(ButtonLine::Shift);
        presses.extend(std::iter::repeat(ButtonLine::Increment).take(tens));
    }
    if hundreds > 0 {
        presses.push(ButtonLine::Shift);
        presses.extend(std::iter::repeat(ButtonLine::Increment).take(hundreds));
    }

    presses.push(ButtonLine::Set);
    Ok(presses)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ready,
    Pressed { line: ButtonLine, until_ms: u64 },
    Settling { until_ms: u64 },
}

/// Non-blocking pulse generator: each `poll` performs whatever transitions
/// are due at `now_ms` and reports whether presses remain.
#[derive(Debug, Clone)]
pub struct PulseSequencer {
    timing: ActuatorConfig,
    presses: Vec<ButtonLine>,
    next: usize,
    phase: Phase,
}

impl PulseSequencer {
    pub fn new(timing: ActuatorConfig) -> Self {
        Self {
            timing,
            presses: Vec::new(),
            next: 0,
            phase: Phase::Ready,
        }
    }

    pub fn load(&mut self, presses: Vec<ButtonLine>) {
        self.presses = presses;
        self.next = 0;
        self.phase = Phase::Ready;
    }

    pub fn is_busy(&self) -> bool {
        self.next < self.presses.len() || self.phase != Phase::Ready
    }

    pub fn next_deadline(&self) -> Option<u64> {
        match self.phase {
            Phase::Ready => None,
            Phase::Pressed { until_ms, .. } | Phase::Settling { until_ms } => Some(until_ms),
        }
    }

    pub fn poll<L: ButtonLines>(
        &mut self,
        now_ms: u64,
        lines: &mut L,
    ) -> Result<bool, ActuatorError> {
        loop {
            match self.phase {
                Phase::Ready => {
                    let Some(&line) = self.presses.get(self.next) else {
                        return Ok(false);
                    };
                    self.drive(lines, line, Level::Low)?;
                    self.phase = Phase::Pressed {
                        line,
                        until_ms: now_ms + self.timing.press_ms,
                    };
                    return Ok(true);
                }
                Phase::Pressed { line, until_ms } => {
                    if now_ms < until_ms {
                        return Ok(true);
                    }
                    self.drive(lines, line, Level::High)?;
                    self.next += 1;
                    self.phase = Phase::Settling {
                        until_ms: now_ms + self.timing.settle_ms,
                    };
                    return Ok(true);
                }
                Phase::Settling { until_ms } => {
                    if now_ms < until_ms {
                        return Ok(true);
                    }
                    self.phase = Phase::Ready;
                }
            }
        }
    }

    fn drive<L: ButtonLines>(
        &mut self,
        lines: &mut L,
        line: ButtonLine,
        level: Level,
    ) -> Result<(), ActuatorError> {
        lines.drive(line, level).map_err(|err| {
            self.presses.clear();
            self.next = 0;
            self.phase = Phase::Ready;
            ActuatorError::Line {
                line,
                level: level.as_str(),
                message: err.to_string(),
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandReport {
    pub target: u16,
    pub presses: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorDiagnostics {
    pub press_ms: u64,
    pub settle_ms: u64,
    pub last_target: Option<u16>,
    pub sent_commands: u64,
    pub failed_commands: u64,
    pub last_error: Option<String>,
}

/// Blocking driver. `command` takes `&mut self`, so two commands can never interleave.
pub struct ActuatorDriver<L, C> {
    lines: L,
    clock: C,
    timing: ActuatorConfig,
    sequencer: PulseSequencer,
    last_target: Option<u16>,
    sent_commands: u64,
    failed_commands: u64,
    last_error: Option<String>,
}

impl<L: ButtonLines, C: Clock> ActuatorDriver<L, C> {
    pub fn new(lines: L, clock: C, timing: ActuatorConfig) -> Self {
        Self {
            lines,
            clock,
            timing,
            sequencer: PulseSequencer::new(timing),
            last_target: None,
            sent_commands: 0,
            failed_commands: 0,
            last_error: None,
        }
    }

    pub fn lines(&self) -> &L {
        &self.lines
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Drives every line to its released (high) level.
    pub fn release_all(&mut self) -> Result<(), ActuatorError> {
        for line in ButtonLine::ALL {
            self.lines
                .drive(line, Level::High)
                .map_err(|err| ActuatorError::Line {
                    line,
                    level: Level::High.as_str(),
                    message: err.to_string(),
                })?;
        }
        Ok(())
    }

    pub fn command(&mut self, target: u16) -> Result<CommandReport, ActuatorError> {
        let result = match self.run_sequence(target) {
            Ok(report) => Ok(report),
            Err(err) => match self.release_all() {
                Ok(()) => Err(err),
                Err(release) => Err(ActuatorError::Unreleased {
                    command: Box::new(err),
                    release: Box::new(release),
                }),
            },
        };

        match &result {
            Ok(_) => {
                self.sent_commands = self.sent_commands.saturating_add(1);
                self.last_target = Some(target);
                self.last_error = None;
            }
            Err(err) => {
                self.failed_commands = self.failed_commands.saturating_add(1);
                self.last_error = Some(err.to_string());
            }
        }

        result
    }

    pub fn diagnostics(&self) -> ActuatorDiagnostics {
        ActuatorDiagnostics {
            press_ms: self.timing.press_ms,
            settle_ms: self.timing.settle_ms,
            last_target: self.last_target,
            sent_commands: self.sent_commands,
            failed_commands: self.failed_commands,
            last_error: self.last_error.clone(),
        }
    }

    fn run_sequence(&mut self, target: u16) -> Result<CommandReport, ActuatorError> {
        let presses = press_sequence(target)?;
        let count = presses.len();
        let started_ms = self.clock.now_ms();

        self.sequencer.load(presses);
        while self.sequencer.poll(self.clock.now_ms(), &mut self.lines)? {
            if let Some(deadline) = self.sequencer.next_deadline() {
                self.clock.sleep_until(deadline);
            }
        }

        Ok(CommandReport {
            target,
            presses: count,
            duration_ms: self.clock.now_ms().saturating_sub(started_ms),
        })
    }
}
