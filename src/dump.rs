//! # Dump Orchestrator
//!
//! Unattended "download everything, then erase" workflow.
//!
//! The workflow is a chain of stages. Each stage has a pure handler that looks
//! at a snapshot of the world ([`DumpInputs`]) and returns the next status plus
//! at most one action for the engine to carry out:
//!
//! ```text
//! 1 AwaitReady              ready            -> RequestCatalog   -> 2
//! 2 AwaitCount              count > 0        -> RaiseSchedRate   -> 3
//!                           count == 0                           -> Idle
//! 3 Reboot                  rate changed     -> Reboot           -> 4
//! 4 AwaitReadyAfterReboot   ready            -> RequestCatalog   -> 5
//! 5 AwaitCountAfterReboot   count > 0        -> DownloadAll      -> 6
//!                           count == 0                           -> Idle
//! 6 AwaitDownloads          queue drained                        -> 7
//! 7 RestoreRate             rate changed     -> RestoreSchedRate -> 8
//! 8 SaveParams                               -> SaveParams       -> 9
//! 9 Erase                                    -> EraseAll         -> Idle
//! ```
//!
//! A stage whose precondition does not hold stays where it is. There is no
//! timeout: a device that never reports readiness stalls the dump until an
//! operator cancels it.

use std::fmt;
use tracing::{debug, info, warn};

/// Stage of a running dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpStage {
    AwaitReady,
    AwaitCount,
    Reboot,
    AwaitReadyAfterReboot,
    AwaitCountAfterReboot,
    AwaitDownloads,
    RestoreRate,
    SaveParams,
    Erase,
}

/// Orchestrator status; `Idle` is both the initial and the terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpStatus {
    #[default]
    Idle,
    Running(DumpStage),
}

impl DumpStatus {
    /// Stage number, 0 when idle
    pub fn number(self) -> u8 {
        match self {
            DumpStatus::Idle => 0,
            DumpStatus::Running(stage) => stage.number(),
        }
    }
}

impl fmt::Display for DumpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DumpStatus::Idle => write!(f, "idle"),
            DumpStatus::Running(stage) => write!(f, "stage {} ({:?})", stage.number(), stage),
        }
    }
}

/// What the engine must do on behalf of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpAction {
    /// Forget the log count and request a catalog listing
    RequestCatalog,
    /// Switch the scheduler to the fast rate, remembering the old one
    RaiseSchedRate,
    /// Reboot the device and wait for it to become ready again
    Reboot,
    /// Queue every catalog entry and start downloading
    DownloadAll,
    /// Put the scheduler rate back
    RestoreSchedRate,
    /// Back up the device parameters
    SaveParams,
    /// Erase all logs on the device
    EraseAll,
}

/// Snapshot of everything a stage handler may look at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DumpInputs {
    pub device_ready: bool,
    pub log_count: Option<u16>,
    pub reboot_required: bool,
    /// No download open and nothing queued
    pub downloads_idle: bool,
}

/// Outcome of one stage evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: DumpStatus,
    pub action: Option<DumpAction>,
}

impl Transition {
    fn stay(stage: DumpStage) -> Self {
        Self { next: DumpStatus::Running(stage), action: None }
    }

    fn to(stage: DumpStage, action: Option<DumpAction>) -> Self {
        Self { next: DumpStatus::Running(stage), action }
    }

    fn finish(action: Option<DumpAction>) -> Self {
        Self { next: DumpStatus::Idle, action }
    }
}

impl DumpStage {
    /// Stage number as operators know it (1-9)
    pub fn number(self) -> u8 {
        match self {
            DumpStage::AwaitReady => 1,
            DumpStage::AwaitCount => 2,
            DumpStage::Reboot => 3,
            DumpStage::AwaitReadyAfterReboot => 4,
            DumpStage::AwaitCountAfterReboot => 5,
            DumpStage::AwaitDownloads => 6,
            DumpStage::RestoreRate => 7,
            DumpStage::SaveParams => 8,
            DumpStage::Erase => 9,
        }
    }

    /// Evaluate this stage against `inputs`
    pub fn step(self, inputs: &DumpInputs) -> Transition {
        match self {
            DumpStage::AwaitReady => await_ready(inputs, self, DumpStage::AwaitCount),
            DumpStage::AwaitCount => await_count(inputs),
            DumpStage::Reboot => reboot(inputs),
            DumpStage::AwaitReadyAfterReboot => {
                await_ready(inputs, self, DumpStage::AwaitCountAfterReboot)
            }
            DumpStage::AwaitCountAfterReboot => await_count_after_reboot(inputs),
            DumpStage::AwaitDownloads => await_downloads(inputs),
            DumpStage::RestoreRate => restore_rate(inputs),
            DumpStage::SaveParams => Transition::to(DumpStage::Erase, Some(DumpAction::SaveParams)),
            DumpStage::Erase => Transition::finish(Some(DumpAction::EraseAll)),
        }
    }
}

fn await_ready(inputs: &DumpInputs, current: DumpStage, next: DumpStage) -> Transition {
    if inputs.device_ready {
        Transition::to(next, Some(DumpAction::RequestCatalog))
    } else {
        Transition::stay(current)
    }
}

fn await_count(inputs: &DumpInputs) -> Transition {
    match inputs.log_count {
        None => Transition::stay(DumpStage::AwaitCount),
        Some(0) => Transition::finish(None),
        Some(_) => Transition::to(DumpStage::Reboot, Some(DumpAction::RaiseSchedRate)),
    }
}

fn reboot(inputs: &DumpInputs) -> Transition {
    let action = inputs.reboot_required.then_some(DumpAction::Reboot);
    Transition::to(DumpStage::AwaitReadyAfterReboot, action)
}

fn await_count_after_reboot(inputs: &DumpInputs) -> Transition {
    match inputs.log_count {
        None => Transition::stay(DumpStage::AwaitCountAfterReboot),
        Some(0) => Transition::finish(None),
        Some(_) => Transition::to(DumpStage::AwaitDownloads, Some(DumpAction::DownloadAll)),
    }
}

fn await_downloads(inputs: &DumpInputs) -> Transition {
    if inputs.downloads_idle {
        Transition::to(DumpStage::RestoreRate, None)
    } else {
        Transition::stay(DumpStage::AwaitDownloads)
    }
}

fn restore_rate(inputs: &DumpInputs) -> Transition {
    let action = inputs.reboot_required.then_some(DumpAction::RestoreSchedRate);
    Transition::to(DumpStage::SaveParams, action)
}

/// State of the one dump run
#[derive(Debug, Clone, Default)]
pub struct DumpOrchestrator {
    status: DumpStatus,
    device_ready: bool,
    reboot_required: bool,
    previous_sched_rate: Option<f32>,
}

impl DumpOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> DumpStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, DumpStatus::Running(_))
    }

    pub fn device_ready(&self) -> bool {
        self.device_ready
    }

    pub fn reboot_required(&self) -> bool {
        self.reboot_required
    }

    /// Scheduler rate in effect before the dump raised it
    pub fn previous_sched_rate(&self) -> Option<f32> {
        self.previous_sched_rate
    }

    /// Begin a dump run
    ///
    /// Returns `false` without touching anything if a run is already active.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            warn!("Log dump already running ({})", self.status);
            return false;
        }
        info!("Log dump started");
        self.status = DumpStatus::Running(DumpStage::AwaitReady);
        self.device_ready = false;
        self.reboot_required = false;
        self.previous_sched_rate = None;
        true
    }

    /// Abandon the run and return to idle
    pub fn cancel(&mut self) {
        if self.is_running() {
            info!("Log dump cancelled at {}", self.status);
        }
        self.status = DumpStatus::Idle;
        self.reboot_required = false;
        self.previous_sched_rate = None;
    }

    /// Readiness signal observed in the device status text
    pub fn mark_device_ready(&mut self) {
        self.device_ready = true;
    }

    /// A reboot was issued; the device is not ready until it says so again
    pub fn mark_rebooting(&mut self) {
        self.device_ready = false;
    }

    /// Record the rate before the dump changed it
    pub fn remember_sched_rate(&mut self, previous: f32, changed: bool) {
        self.previous_sched_rate = Some(previous);
        self.reboot_required = changed;
    }

    /// Snapshot of the orchestrator's own flags plus engine-supplied facts
    pub fn inputs(&self, log_count: Option<u16>, downloads_idle: bool) -> DumpInputs {
        DumpInputs {
            device_ready: self.device_ready,
            log_count,
            reboot_required: self.reboot_required,
            downloads_idle,
        }
    }

    /// Evaluate the current stage once and move to the next status
    ///
    /// Does nothing while idle.
    pub fn advance(&mut self, inputs: &DumpInputs) -> Option<DumpAction> {
        let DumpStatus::Running(stage) = self.status else {
            return None;
        };

        let transition = stage.step(inputs);
        if transition.next != self.status {
            debug!("Log dump {} -> {}", self.status, transition.next);
            match (stage, transition.next) {
                (DumpStage::AwaitCount | DumpStage::AwaitCountAfterReboot, DumpStatus::Idle) => {
                    info!(">No logs available");
                }
                (DumpStage::AwaitDownloads, _) => info!("All logs downloaded successfully"),
                _ => {}
            }
        }
        self.status = transition.next;
        transition.action
    }
}
