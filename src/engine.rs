//! # Log Engine
//!
//! Owns every piece of log-transfer state and exposes the entry points the
//! scheduler drives: inbound device messages, the periodic tick and operator
//! commands.
//!
//! All mutation happens on one logical thread. Nothing here blocks; waiting is
//! expressed as re-checking a condition on the next tick.

use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::catalog::{CatalogUpdate, LogCatalog};
use crate::command::{DownloadTarget, LogCommand};
use crate::config::Config;
use crate::dump::{DumpAction, DumpOrchestrator};
use crate::error::{LogDumpError, Result};
use crate::link::DeviceLink;
use crate::protocol::{
    default_log_filename, Command, DeviceMessage, LogData, LogEntry, LIST_ALL_END, MAX_RANGE_REQUESTS,
    SCHED_LOOP_RATE,
};
use crate::sink::SinkProvider;
use crate::transfer::{DownloadQueue, DownloadSession, DownloadStatus, DownloadSummary};

/// Tunables of the engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Silence after which missing data is re-requested
    pub retry_interval: Duration,
    /// Minimum gap between progress lines
    pub status_interval: Duration,
    /// Re-requests per retry wave
    pub max_rerequests: usize,
    /// Status text substring meaning the device is ready
    pub ready_text: String,
    /// Scheduler rate used while dumping
    pub fast_sched_rate: u16,
    /// Scheduler rate assumed when the device has not reported one
    pub default_sched_rate: u16,
    /// Parameter backup name written during a dump
    pub param_backup: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(700),
            status_interval: Duration::from_millis(500),
            max_rerequests: MAX_RANGE_REQUESTS,
            ready_text: "PreArm: Waiting for RC".to_string(),
            fast_sched_rate: 300,
            default_sched_rate: 50,
            param_backup: "after_flight.param".to_string(),
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            retry_interval: config.download.retry_interval(),
            status_interval: config.download.status_interval(),
            max_rerequests: config.download.max_rerequests,
            ready_text: config.dump.ready_text.clone(),
            fast_sched_rate: config.dump.fast_sched_rate,
            default_sched_rate: config.dump.default_sched_rate,
            param_backup: config.dump.param_backup.clone(),
        }
    }
}

/// Log transfer engine
pub struct LogEngine<L: DeviceLink, P: SinkProvider> {
    link: L,
    sinks: P,
    settings: EngineSettings,
    catalog: LogCatalog,
    session: DownloadSession,
    queue: DownloadQueue,
    dump: DumpOrchestrator,
    last_status: Option<Instant>,
    completed: Vec<DownloadSummary>,
}

impl<L: DeviceLink, P: SinkProvider> LogEngine<L, P> {
    pub fn new(link: L, sinks: P, settings: EngineSettings) -> Self {
        Self {
            link,
            sinks,
            settings,
            catalog: LogCatalog::new(),
            session: DownloadSession::new(),
            queue: DownloadQueue::new(),
            dump: DumpOrchestrator::new(),
            last_status: None,
            completed: Vec::new(),
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn sinks(&self) -> &P {
        &self.sinks
    }

    pub fn catalog(&self) -> &LogCatalog {
        &self.catalog
    }

    pub fn session(&self) -> &DownloadSession {
        &self.session
    }

    pub fn queue(&self) -> &DownloadQueue {
        &self.queue
    }

    pub fn dump(&self) -> &DumpOrchestrator {
        &self.dump
    }

    /// No download open, nothing queued and no dump running
    pub fn is_idle(&self) -> bool {
        !self.session.is_active() && self.queue.is_empty() && !self.dump.is_running()
    }

    /// Summaries of downloads finished since the last call
    pub fn take_completed(&mut self) -> Vec<DownloadSummary> {
        std::mem::take(&mut self.completed)
    }

    /// Drain every message that has arrived on the link
    pub fn pump(&mut self, now: Instant) {
        while let Some(message) = self.link.recv() {
            self.handle_message(message, now);
        }
    }

    /// Dispatch one inbound device message
    pub fn handle_message(&mut self, message: DeviceMessage, now: Instant) {
        match message {
            DeviceMessage::LogEntry(entry) => self.handle_log_entry(&entry),
            DeviceMessage::LogData(unit) => self.handle_log_data(&unit, now),
            DeviceMessage::StatusText(text) => self.handle_status_text(&text),
        }
    }

    fn handle_log_entry(&mut self, entry: &LogEntry) {
        match self.catalog.upsert(entry) {
            CatalogUpdate::NoLogs => info!("No logs"),
            CatalogUpdate::Stored(metadata) => info!("{}", metadata),
        }
    }

    fn handle_log_data(&mut self, unit: &LogData, now: Instant) {
        match self.session.on_data(unit, &mut self.link, now) {
            Ok(Some(summary)) => {
                self.completed.push(summary);
                self.last_status = None;
                if !self.queue.is_empty() {
                    debug!("{} logs left in queue", self.queue.len());
                }
                self.download_next(now);
            }
            Ok(None) => self.report_status(now),
            Err(e) => {
                error!("Download failed: {}", e);
                self.session.cancel();
                self.download_next(now);
            }
        }
    }

    fn handle_status_text(&mut self, text: &str) {
        debug!("Device: {}", text);
        if text.contains(&self.settings.ready_text) {
            if !self.dump.device_ready() {
                info!("Flight controller ready");
            }
            self.dump.mark_device_ready();
        }
    }

    /// Periodic scheduler tick
    ///
    /// Drains the link, re-requests missing data after a stall, prints
    /// throttled progress and advances a running dump by one stage evaluation.
    pub fn tick(&mut self, now: Instant) {
        self.pump(now);

        match self.session.on_idle_tick(
            &mut self.link,
            now,
            self.settings.retry_interval,
            self.settings.max_rerequests,
        ) {
            Ok(0) => {}
            Ok(sent) => debug!("Sent {} re-requests", sent),
            Err(e) => warn!("Failed to re-request missing data: {}", e),
        }

        self.report_status(now);
        self.advance_dump(now);
    }

    fn report_status(&mut self, now: Instant) {
        if !self.session.is_active() {
            return;
        }
        if let Some(last) = self.last_status {
            if now.saturating_duration_since(last) <= self.settings.status_interval {
                return;
            }
        }
        self.last_status = Some(now);
        if let Some(status) = self.status(now) {
            info!("{}", status);
        }
    }

    /// Progress of the active download
    pub fn status(&self, now: Instant) -> Option<DownloadStatus> {
        let expected = self
            .session
            .log_id()
            .and_then(|id| self.catalog.get(id))
            .map(|metadata| metadata.size);
        self.session.status(expected, now)
    }

    /// Print progress of the active download
    pub fn show_status(&self, now: Instant) {
        match self.status(now) {
            Some(status) => info!("{}", status),
            None => info!("No download"),
        }
    }

    /// Ask the device for its catalog
    pub fn list(&mut self) -> Result<()> {
        info!("Requesting log list");
        self.link.send(Command::RequestList {
            start: 0,
            end: LIST_ALL_END,
        })
    }

    /// Erase every log on the device
    pub fn erase(&mut self) -> Result<()> {
        self.link.send(Command::EraseAll)?;
        info!("Log erase initiated. Allow 30s to complete");
        Ok(())
    }

    /// Let the device resume normal logging
    pub fn resume(&mut self) -> Result<()> {
        self.link.send(Command::RequestEnd)
    }

    /// Abort the download, the queue and any running dump
    ///
    /// The catalog is kept.
    pub fn cancel(&mut self) {
        self.session.cancel();
        self.queue.clear();
        self.dump.cancel();
        self.last_status = None;
    }

    /// Begin the unattended dump workflow
    pub fn start_dump(&mut self) {
        if self.dump.start() {
            self.catalog.clear_count();
        }
    }

    fn ensure_no_download(&self) -> Result<()> {
        match self.session.log_id() {
            Some(id) => Err(LogDumpError::AlreadyActive(id)),
            None => Ok(()),
        }
    }

    fn open_session(&mut self, log_id: u16, filename: &str, now: Instant) -> Result<()> {
        self.ensure_no_download()?;
        let sink = self.sinks.create(filename)?;
        self.session.start(log_id, filename, sink, &mut self.link, now)?;
        self.last_status = Some(now);
        Ok(())
    }

    /// Download one log, to `log<id>.bin` unless a file name is given
    pub fn download(&mut self, log_id: u16, filename: Option<&str>, now: Instant) -> Result<()> {
        let filename = filename.map_or_else(|| default_log_filename(log_id), str::to_string);
        self.open_session(log_id, &filename, now)
    }

    /// Download the newest log in the catalog
    pub fn download_latest(&mut self, filename: Option<&str>, now: Instant) -> Result<()> {
        let log_id = self.catalog.latest().ok_or(LogDumpError::EmptyCatalog)?;
        self.download(log_id, filename, now)
    }

    /// Download every catalog entry, newest first
    pub fn download_all(&mut self, now: Instant) -> Result<()> {
        if self.catalog.is_empty() {
            return Err(LogDumpError::EmptyCatalog);
        }
        self.ensure_no_download()?;
        self.queue.enqueue_all(&self.catalog);
        self.download_next(now);
        Ok(())
    }

    /// Download catalog entries except the `skip` oldest
    pub fn download_from(&mut self, skip: usize, now: Instant) -> Result<()> {
        if self.catalog.is_empty() {
            return Err(LogDumpError::EmptyCatalog);
        }
        self.ensure_no_download()?;
        self.queue.enqueue_from(&self.catalog, skip);
        self.download_next(now);
        Ok(())
    }

    /// Download ids `first..=last` in ascending order
    pub fn download_range(&mut self, first: u16, last: u16, now: Instant) -> Result<()> {
        self.ensure_no_download()?;
        self.queue.enqueue_range(first, last);
        info!("Queued logs {:?}", self.queue.pending());
        self.download_next(now);
        Ok(())
    }

    /// Start the next queued log that is not already on disk
    ///
    /// A log is skipped when a file of the same name exists with exactly the
    /// catalog size. A log that fails to start is reported and skipped.
    fn download_next(&mut self, now: Instant) {
        if self.session.is_active() {
            return;
        }

        while let Some(log_id) = self.queue.pop() {
            let filename = default_log_filename(log_id);
            let expected = self.catalog.get(log_id).map(|metadata| u64::from(metadata.size));
            if expected.is_some() && self.sinks.existing_size(&filename) == expected {
                info!("Skipping existing {}", filename);
                continue;
            }

            match self.open_session(log_id, &filename, now) {
                Ok(()) => return,
                Err(e) => error!("Failed to start download of log {}: {}", log_id, e),
            }
        }
    }

    fn advance_dump(&mut self, now: Instant) {
        let downloads_idle = !self.session.is_active() && self.queue.is_empty();
        let inputs = self.dump.inputs(self.catalog.log_count(), downloads_idle);
        let Some(action) = self.dump.advance(&inputs) else {
            return;
        };

        if let Err(e) = self.apply_dump_action(action, now) {
            error!("Log dump step {:?} failed: {}", action, e);
        }
    }

    fn apply_dump_action(&mut self, action: DumpAction, now: Instant) -> Result<()> {
        match action {
            DumpAction::RequestCatalog => {
                info!(">Requesting log number");
                self.catalog.clear_count();
                self.list()
            }
            DumpAction::RaiseSchedRate => self.raise_sched_rate(),
            DumpAction::Reboot => {
                info!("Rebooting to apply scheduler rate");
                self.dump.mark_rebooting();
                self.link.send(Command::Reboot)
            }
            DumpAction::DownloadAll => {
                info!("Downloading the logs");
                self.queue.enqueue_all(&self.catalog);
                self.download_next(now);
                Ok(())
            }
            DumpAction::RestoreSchedRate => self.restore_sched_rate(),
            DumpAction::SaveParams => {
                info!("Saving parameters");
                self.link.send(Command::SaveParams {
                    filename: self.settings.param_backup.clone(),
                })
            }
            DumpAction::EraseAll => self.erase(),
        }
    }

    fn current_sched_rate(&self) -> f32 {
        match self.link.param(SCHED_LOOP_RATE) {
            Some(rate) => rate,
            None => {
                warn!(
                    "{} not reported by device, assuming {}Hz",
                    SCHED_LOOP_RATE, self.settings.default_sched_rate
                );
                f32::from(self.settings.default_sched_rate)
            }
        }
    }

    fn raise_sched_rate(&mut self) -> Result<()> {
        let current = self.current_sched_rate();
        let fast = f32::from(self.settings.fast_sched_rate);
        info!("Scheduler rate {}Hz", current);

        let changed = current != fast;
        if changed {
            self.link.send(Command::ParamSet {
                name: SCHED_LOOP_RATE.to_string(),
                value: fast,
            })?;
            info!("Scheduler rate set to {}Hz (was {}Hz)", fast, current);
        }
        self.dump.remember_sched_rate(current, changed);
        Ok(())
    }

    fn restore_sched_rate(&mut self) -> Result<()> {
        let Some(previous) = self.dump.previous_sched_rate() else {
            return Ok(());
        };
        self.link.send(Command::ParamSet {
            name: SCHED_LOOP_RATE.to_string(),
            value: previous,
        })?;
        info!("Scheduler rate restored to {}Hz", previous);
        Ok(())
    }

    /// Run an operator command
    ///
    /// # Errors
    ///
    /// Returns the reason the command could not be carried out; the engine is
    /// left unchanged in that case.
    pub fn execute(&mut self, command: LogCommand, now: Instant) -> Result<()> {
        match command {
            LogCommand::List => self.list(),
            LogCommand::Status => {
                self.show_status(now);
                Ok(())
            }
            LogCommand::Erase => self.erase(),
            LogCommand::Dump => {
                self.start_dump();
                Ok(())
            }
            LogCommand::Resume => self.resume(),
            LogCommand::Cancel => {
                self.cancel();
                Ok(())
            }
            LogCommand::Download(target) => match target {
                DownloadTarget::All => self.download_all(now),
                DownloadTarget::Latest { filename } => self.download_latest(filename.as_deref(), now),
                DownloadTarget::From(skip) => self.download_from(skip, now),
                DownloadTarget::Range { first, last } => self.download_range(first, last, now),
                DownloadTarget::Single { log_id, filename } => {
                    self.download(log_id, filename.as_deref(), now)
                }
            },
        }
    }
}
