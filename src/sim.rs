//! # Simulated Flight Controller
//!
//! In-memory stand-in for a flight controller that serves logs over a lossy
//! link. Used by the binary when no real transport is plugged in and by tests.
//!
//! Behaviour mirrors an ArduPilot-style device:
//! - list requests are answered with one catalog entry per log, or a single
//!   `num_logs = 0` entry when storage is empty
//! - data requests are answered with 90-byte units; the last unit is short, or
//!   a zero-count unit follows when the range ends on a 90-byte boundary
//! - every `drop_every`-th unit is silently lost
//! - after a reboot the device is silent for `reboot_delay_polls` idle polls,
//!   then announces readiness

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use crate::config::SimulatorConfig;
use crate::error::Result;
use crate::link::DeviceLink;
use crate::protocol::{Command, DeviceMessage, LogData, LogEntry, CHUNK_SIZE, REQUEST_TO_END, SCHED_LOOP_RATE};

/// First timestamp handed out to generated logs
const SIM_EPOCH: u32 = 1_700_000_000;

/// A log stored on the simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedLog {
    pub id: u16,
    pub time_utc: u32,
    pub data: Vec<u8>,
}

/// Deterministic log content for `id`
pub fn pattern(id: u16, size: u32) -> Vec<u8> {
    (0..size)
        .map(|i| ((i as u64 * 31 + u64::from(id) * 17) % 251) as u8)
        .collect()
}

/// Simulated flight controller implementing [`DeviceLink`]
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    logs: Vec<SimulatedLog>,
    params: HashMap<String, f32>,
    outbox: VecDeque<DeviceMessage>,
    ready_text: String,
    drop_every: u32,
    units_sent: u32,
    dropped: u32,
    booted: bool,
    boot_countdown: u32,
    reboot_delay_polls: u32,
    status_every_polls: u32,
    idle_polls: u32,
    just_announced: bool,
    reboots: u32,
    saved_params: Vec<String>,
}

impl SimulatedDevice {
    /// Booted device with no logs and the scheduler at 50Hz
    pub fn new(ready_text: &str) -> Self {
        let mut params = HashMap::new();
        params.insert(SCHED_LOOP_RATE.to_string(), 50.0);
        Self {
            logs: Vec::new(),
            params,
            outbox: VecDeque::new(),
            ready_text: ready_text.to_string(),
            drop_every: 0,
            units_sent: 0,
            dropped: 0,
            booted: true,
            boot_countdown: 0,
            reboot_delay_polls: 20,
            status_every_polls: 10,
            idle_polls: 0,
            just_announced: false,
            reboots: 0,
            saved_params: Vec::new(),
        }
    }

    /// Device populated from the `[simulator]` configuration section
    pub fn from_config(config: &SimulatorConfig, ready_text: &str) -> Self {
        let mut device = Self::new(ready_text)
            .with_sched_rate(config.sched_rate)
            .with_drop_every(config.drop_every)
            .with_reboot_delay(config.reboot_delay_polls)
            .with_status_every(config.status_every_polls);
        for (i, &size) in config.log_sizes.iter().enumerate() {
            let id = i as u16 + 1;
            device = device.with_log(id, SIM_EPOCH + u32::from(id) * 3600, pattern(id, size));
        }
        device
    }

    pub fn with_log(mut self, id: u16, time_utc: u32, data: Vec<u8>) -> Self {
        self.logs.push(SimulatedLog { id, time_utc, data });
        self
    }

    pub fn with_sched_rate(mut self, rate: u16) -> Self {
        self.params.insert(SCHED_LOOP_RATE.to_string(), f32::from(rate));
        self
    }

    /// Lose every `n`-th data unit; 0 disables loss
    pub fn with_drop_every(mut self, n: u32) -> Self {
        self.drop_every = n;
        self
    }

    pub fn with_reboot_delay(mut self, polls: u32) -> Self {
        self.reboot_delay_polls = polls;
        self
    }

    pub fn with_status_every(mut self, polls: u32) -> Self {
        self.status_every_polls = polls.max(1);
        self
    }

    pub fn logs(&self) -> &[SimulatedLog] {
        &self.logs
    }

    pub fn log(&self, id: u16) -> Option<&SimulatedLog> {
        self.logs.iter().find(|log| log.id == id)
    }

    pub fn is_booted(&self) -> bool {
        self.booted
    }

    pub fn reboots(&self) -> u32 {
        self.reboots
    }

    /// Number of data units lost so far
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Backup names passed to parameter saves
    pub fn saved_params(&self) -> &[String] {
        &self.saved_params
    }

    fn list(&mut self, start: u16, end: u16) {
        let last_log_num = self.logs.iter().map(|log| log.id).max().unwrap_or(0);
        let num_logs = self.logs.len() as u16;
        if num_logs == 0 {
            self.outbox.push_back(DeviceMessage::LogEntry(LogEntry {
                id: 0,
                num_logs: 0,
                last_log_num: 0,
                size: 0,
                time_utc: 0,
            }));
            return;
        }

        let entries: Vec<LogEntry> = self
            .logs
            .iter()
            .filter(|log| (start..=end).contains(&log.id))
            .map(|log| LogEntry {
                id: log.id,
                num_logs,
                last_log_num,
                size: log.data.len() as u32,
                time_utc: log.time_utc,
            })
            .collect();
        self.outbox.extend(entries.into_iter().map(DeviceMessage::LogEntry));
    }

    fn units_for(log: &SimulatedLog, offset: u32, length: u32) -> Vec<LogData> {
        let size = log.data.len() as u32;
        let end = if length == REQUEST_TO_END {
            size
        } else {
            offset.saturating_add(length).min(size)
        };

        let mut units = Vec::new();
        let mut ofs = offset;
        while ofs < end {
            let count = (end - ofs).min(CHUNK_SIZE);
            let bytes = &log.data[ofs as usize..(ofs + count) as usize];
            units.push(LogData {
                id: log.id,
                ofs,
                count: count as u8,
                data: Bytes::copy_from_slice(bytes),
            });
            ofs += count;
        }

        // Ranges reaching the end on a chunk boundary are closed by an empty unit
        if ofs >= size && (ofs - offset) % CHUNK_SIZE == 0 {
            units.push(LogData {
                id: log.id,
                ofs,
                count: 0,
                data: Bytes::new(),
            });
        }
        units
    }

    fn deliver(&mut self, unit: LogData) {
        self.units_sent += 1;
        if self.drop_every > 0 && self.units_sent % self.drop_every == 0 {
            self.dropped += 1;
            return;
        }
        self.outbox.push_back(DeviceMessage::LogData(unit));
    }

    fn idle_poll(&mut self) -> Option<DeviceMessage> {
        if self.just_announced {
            self.just_announced = false;
            return None;
        }

        if !self.booted {
            if self.boot_countdown > 0 {
                self.boot_countdown -= 1;
                return None;
            }
            debug!("Simulated device finished booting");
            self.booted = true;
            self.idle_polls = 0;
            return self.announce();
        }

        self.idle_polls += 1;
        if self.idle_polls % self.status_every_polls == 0 {
            return self.announce();
        }
        None
    }

    fn announce(&mut self) -> Option<DeviceMessage> {
        self.just_announced = true;
        Some(DeviceMessage::StatusText(self.ready_text.clone()))
    }
}

impl DeviceLink for SimulatedDevice {
    fn send(&mut self, command: Command) -> Result<()> {
        if !self.booted {
            debug!("Simulated device is rebooting, ignoring {:?}", command);
            return Ok(());
        }

        match command {
            Command::RequestList { start, end } => self.list(start, end),
            Command::RequestData { log_id, offset, length } => {
                let units = match self.log(log_id) {
                    Some(log) => Self::units_for(log, offset, length),
                    None => Vec::new(),
                };
                for unit in units {
                    self.deliver(unit);
                }
            }
            Command::RequestEnd => debug!("Simulated device resumed logging"),
            Command::EraseAll => {
                info!("Simulated device erased {} logs", self.logs.len());
                self.logs.clear();
            }
            Command::Reboot => {
                self.booted = false;
                self.boot_countdown = self.reboot_delay_polls;
                self.outbox.clear();
                self.just_announced = false;
                self.reboots += 1;
            }
            Command::ParamSet { name, value } => {
                self.params.insert(name, value);
            }
            Command::SaveParams { filename } => self.saved_params.push(filename),
        }
        Ok(())
    }

    fn recv(&mut self) -> Option<DeviceMessage> {
        match self.outbox.pop_front() {
            Some(message) => Some(message),
            None => self.idle_poll(),
        }
    }

    fn param(&self, name: &str) -> Option<f32> {
        self.params.get(name).copied()
    }
}
