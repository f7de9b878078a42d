//! # Download Session
//!
//! Reassembles one log from unordered, possibly dropped 90-byte data units.
//!
//! At most one session is open at a time. Units are written at their own byte
//! offset, so reordered and re-requested units land in the right place. An idle
//! tick notices stalls and asks the device again for exactly the missing ranges.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::io::{self, Seek, SeekFrom, Write};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::coverage::CoverageTracker;
use crate::error::{LogDumpError, Result};
use crate::link::DeviceLink;
use crate::protocol::{Command, LogData, CHUNK_SIZE, REQUEST_TO_END};
use crate::sink::ByteSink;

/// Throughput in kbyte/s using the decimal convention (1 kbyte = 1000 bytes)
pub fn throughput_kbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 / (1000.0 * secs)
}

/// Percentage of `expected` bytes received
///
/// An unknown log reports 0%. A catalog size of 0 is the device's way of
/// saying "unknown", and reports 100%.
pub fn percent_complete(received: u64, expected: Option<u32>) -> f64 {
    match expected {
        None => 0.0,
        Some(0) => 100.0,
        Some(size) => 100.0 * received as f64 / f64::from(size),
    }
}

/// Progress snapshot of the active download
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadStatus {
    pub log_id: u16,
    pub filename: String,
    pub bytes_received: u64,
    pub expected_size: u64,
    pub percent: f64,
    pub kbytes_per_sec: f64,
    pub retries: u32,
    pub missing: usize,
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Downloading {} - {}/{} bytes {:.1}% {:.1} kbyte/s ({} retries {} missing)",
            self.filename,
            self.bytes_received,
            self.expected_size,
            self.percent,
            self.kbytes_per_sec,
            self.retries,
            self.missing
        )
    }
}

/// Result of a finished download
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadSummary {
    pub log_id: u16,
    pub filename: String,
    pub size: u64,
    pub elapsed_secs: f64,
    pub kbytes_per_sec: f64,
    pub retries: u32,
    pub finished_at: DateTime<Utc>,
}

impl fmt::Display for DownloadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Finished downloading {} ({} bytes {} seconds, {:.1} kbyte/sec {} retries)",
            self.filename,
            self.size,
            self.elapsed_secs as u64,
            self.kbytes_per_sec,
            self.retries
        )
    }
}

/// State of the one in-flight download
struct ActiveDownload {
    log_id: u16,
    filename: String,
    sink: Box<dyn ByteSink>,
    write_offset: u64,
    extent: u64,
    started: Instant,
    last_data: Instant,
    retries: u32,
    coverage: CoverageTracker,
    /// Offset of the short terminal unit, once seen
    terminal: Option<u32>,
}

impl ActiveDownload {
    fn write(&mut self, unit: &LogData) -> io::Result<()> {
        let offset = u64::from(unit.ofs);
        if offset != self.write_offset {
            self.sink.seek(SeekFrom::Start(offset))?;
            self.write_offset = offset;
        }

        let payload = unit.payload();
        if !payload.is_empty() {
            self.sink.write_all(payload)?;
            self.coverage.mark_received(unit.ofs, payload.len() as u32);
            self.write_offset += payload.len() as u64;
            self.extent = self.extent.max(self.write_offset);
        }
        Ok(())
    }

    /// Data requests for the next retry wave as `(offset, length)` pairs
    fn rerequests(&self, max_requests: usize) -> Vec<(u32, u32)> {
        let Some(highest) = self.coverage.highest() else {
            // Nothing arrived yet, the initial request itself was lost
            return vec![(0, REQUEST_TO_END)];
        };

        let ranges = self.coverage.missing_ranges(max_requests);
        if ranges.is_empty() {
            return vec![((highest + 1) * CHUNK_SIZE, REQUEST_TO_END)];
        }
        ranges
            .iter()
            .map(|range| (range.byte_offset(), range.byte_len()))
            .collect()
    }
}

/// Owner of the single active download
#[derive(Default)]
pub struct DownloadSession {
    active: Option<ActiveDownload>,
}

impl fmt::Debug for DownloadSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadSession")
            .field("log_id", &self.log_id())
            .field("filename", &self.filename())
            .finish_non_exhaustive()
    }
}

impl DownloadSession {
    /// Creates an idle session
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a download is in progress
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Id of the log being downloaded
    pub fn log_id(&self) -> Option<u16> {
        self.active.as_ref().map(|a| a.log_id)
    }

    /// File name of the log being downloaded
    pub fn filename(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.filename.as_str())
    }

    /// Retries issued for the active download
    pub fn retries(&self) -> u32 {
        self.active.as_ref().map_or(0, |a| a.retries)
    }

    /// Open a download of `log_id` into `sink` and request the whole log
    ///
    /// # Errors
    ///
    /// Returns [`LogDumpError::AlreadyActive`] if a download is already open;
    /// the open download is left untouched. Returns the link error if the
    /// request could not be sent, in which case no session is opened.
    pub fn start<L: DeviceLink + ?Sized>(
        &mut self,
        log_id: u16,
        filename: &str,
        sink: Box<dyn ByteSink>,
        link: &mut L,
        now: Instant,
    ) -> Result<()> {
        if let Some(active) = &self.active {
            return Err(LogDumpError::AlreadyActive(active.log_id));
        }

        info!("Downloading log {} as {}", log_id, filename);
        link.send(Command::request_full_log(log_id))?;

        self.active = Some(ActiveDownload {
            log_id,
            filename: filename.to_string(),
            sink,
            write_offset: 0,
            extent: 0,
            started: now,
            last_data: now,
            retries: 0,
            coverage: CoverageTracker::new(),
            terminal: None,
        });
        Ok(())
    }

    /// Consume one data unit
    ///
    /// Returns the summary when this unit completes the log. Units arriving
    /// with no session open, or for another log, are dropped.
    ///
    /// # Errors
    ///
    /// A sink failure closes the session before the error is returned, so the
    /// next attempt starts from a clean slate.
    pub fn on_data<L: DeviceLink + ?Sized>(
        &mut self,
        unit: &LogData,
        link: &mut L,
        now: Instant,
    ) -> Result<Option<DownloadSummary>> {
        let done = {
            let Some(active) = self.active.as_mut() else {
                trace!("Dropping data for log {} at {} with no download open", unit.id, unit.ofs);
                return Ok(None);
            };
            if unit.id != active.log_id {
                debug!("Ignoring data for log {} while downloading log {}", unit.id, active.log_id);
                return Ok(None);
            }

            if let Err(e) = active.write(unit) {
                self.active = None;
                return Err(e.into());
            }
            active.last_data = now;

            if unit.is_terminal() {
                active.terminal = Some(unit.ofs);
            }
            unit.count == 0 || active.terminal.is_some_and(|t| active.coverage.is_complete(t))
        };

        if !done {
            return Ok(None);
        }
        self.finish(link, now).map(Some)
    }

    fn finish<L: DeviceLink + ?Sized>(&mut self, link: &mut L, now: Instant) -> Result<DownloadSummary> {
        let Some(mut active) = self.active.take() else {
            return Err(LogDumpError::Io(io::Error::new(io::ErrorKind::NotConnected, "no download open")));
        };

        let missing = active.coverage.missing_count();
        if missing > 0 {
            warn!("Log {} ended with {} chunks missing", active.log_id, missing);
        }

        active.sink.flush()?;
        let size = active.sink.seek(SeekFrom::End(0))?;
        drop(active.sink);

        let elapsed = now.saturating_duration_since(active.started);
        let summary = DownloadSummary {
            log_id: active.log_id,
            filename: active.filename,
            size,
            elapsed_secs: elapsed.as_secs_f64(),
            kbytes_per_sec: throughput_kbps(size, elapsed),
            retries: active.retries,
            finished_at: Utc::now(),
        };
        info!("{}", summary);

        link.send(Command::RequestEnd)?;
        Ok(summary)
    }

    /// Re-request missing data once `retry_interval` has passed without data
    ///
    /// Sends at most `max_requests` requests, one per coalesced gap, or a single
    /// request for everything past the highest chunk when there are no gaps.
    /// Returns the number of requests sent.
    pub fn on_idle_tick<L: DeviceLink + ?Sized>(
        &mut self,
        link: &mut L,
        now: Instant,
        retry_interval: Duration,
        max_requests: usize,
    ) -> Result<usize> {
        let Some(active) = self.active.as_mut() else {
            return Ok(0);
        };
        if now.saturating_duration_since(active.last_data) <= retry_interval {
            return Ok(0);
        }
        active.last_data = now;

        let requests = active.rerequests(max_requests);
        debug!("Log {}: requesting {} missing ranges", active.log_id, requests.len());
        for &(offset, length) in &requests {
            link.send(Command::RequestData {
                log_id: active.log_id,
                offset,
                length,
            })?;
            active.retries += 1;
        }
        Ok(requests.len())
    }

    /// Progress of the active download
    ///
    /// `expected_size` is the catalog size of the log, if known.
    pub fn status(&self, expected_size: Option<u32>, now: Instant) -> Option<DownloadStatus> {
        let active = self.active.as_ref()?;
        let elapsed = now.saturating_duration_since(active.started);
        Some(DownloadStatus {
            log_id: active.log_id,
            filename: active.filename.clone(),
            bytes_received: active.extent,
            expected_size: u64::from(expected_size.unwrap_or(0)),
            percent: percent_complete(active.extent, expected_size),
            kbytes_per_sec: throughput_kbps(active.extent, elapsed),
            retries: active.retries,
            missing: active.coverage.missing_count(),
        })
    }

    /// Close the sink and forget the download
    ///
    /// Returns whether a download was open.
    pub fn cancel(&mut self) -> bool {
        match self.active.take() {
            Some(mut active) => {
                if let Err(e) = active.sink.flush() {
                    warn!("Failed to flush {}: {}", active.filename, e);
                }
                info!("Cancelled download of {}", active.filename);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mocks::RecordingLink;
    use crate::link::MockDeviceLink;
    use crate::sink::mocks::MemorySinkProvider;
    use crate::sink::SinkProvider;
    use bytes::Bytes;

    fn log_bytes(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn unit(id: u16, data: &[u8], ofs: u32) -> LogData {
        let start = ofs as usize;
        let end = (start + CHUNK_SIZE as usize).min(data.len());
        let slice = if start < data.len() { &data[start..end] } else { &[][..] };
        LogData {
            id,
            ofs,
            count: slice.len() as u8,
            data: Bytes::copy_from_slice(slice),
        }
    }

    fn started(sinks: &mut MemorySinkProvider, link: &mut RecordingLink, now: Instant) -> DownloadSession {
        let mut session = DownloadSession::new();
        let sink = sinks.create("log1.bin").unwrap();
        session.start(1, "log1.bin", sink, link, now).unwrap();
        link.take_sent();
        session
    }

    #[test]
    fn test_start_requests_full_log() {
        let mut sinks = MemorySinkProvider::new();
        let mut link = RecordingLink::new();
        let mut session = DownloadSession::new();

        let sink = sinks.create("log3.bin").unwrap();
        session.start(3, "log3.bin", sink, &mut link, Instant::now()).unwrap();

        assert!(session.is_active());
        assert_eq!(session.log_id(), Some(3));
        assert_eq!(session.filename(), Some("log3.bin"));
        assert_eq!(link.sent, vec![Command::request_full_log(3)]);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut sinks = MemorySinkProvider::new();
        let mut link = RecordingLink::new();
        let now = Instant::now();
        let mut session = started(&mut sinks, &mut link, now);

        let other = sinks.create("log2.bin").unwrap();
        let result = session.start(2, "log2.bin", other, &mut link, now);

        match result {
            Err(LogDumpError::AlreadyActive(id)) => assert_eq!(id, 1),
            other => panic!("Expected AlreadyActive, got: {:?}", other),
        }
        assert_eq!(session.log_id(), Some(1));
        assert_eq!(session.filename(), Some("log1.bin"));
        assert!(link.sent.is_empty());
    }

    #[test]
    fn test_start_send_failure_leaves_session_idle() {
        let mut sinks = MemorySinkProvider::new();
        let mut link = MockDeviceLink::new();
        link.expect_send()
            .times(1)
            .returning(|_| Err(LogDumpError::Link("link down".to_string())));

        let mut session = DownloadSession::new();
        let sink = sinks.create("log1.bin").unwrap();
        let result = session.start(1, "log1.bin", sink, &mut link, Instant::now());

        assert!(matches!(result, Err(LogDumpError::Link(_))));
        assert!(!session.is_active());
    }

    #[test]
    fn test_reverse_order_300_bytes() {
        let data = log_bytes(300);
        let mut sinks = MemorySinkProvider::new();
        let mut link = RecordingLink::new();
        let now = Instant::now();
        let mut session = started(&mut sinks, &mut link, now);

        let mut summaries = Vec::new();
        for ofs in [270, 180, 90, 0] {
            if let Some(summary) = session.on_data(&unit(1, &data, ofs), &mut link, now).unwrap() {
                summaries.push(summary);
            }
        }

        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].size, 300);
        assert!(!session.is_active());
        let ends = link.sent.iter().filter(|c| **c == Command::RequestEnd).count();
        assert_eq!(ends, 1);
        assert_eq!(sinks.contents("log1.bin").unwrap(), data);
    }

    #[test]
    fn test_any_delivery_order_completes_exactly_once() {
        let data = log_bytes(500);
        let offsets: Vec<u32> = (0..6).map(|i| i * CHUNK_SIZE).collect();
        let orders: Vec<Vec<usize>> = vec![
            vec![0, 1, 2, 3, 4, 5],
            vec![5, 4, 3, 2, 1, 0],
            vec![2, 5, 0, 4, 1, 3],
            vec![1, 3, 5, 0, 2, 4],
            vec![5, 0, 1, 2, 3, 4],
        ];

        for order in orders {
            let mut sinks = MemorySinkProvider::new();
            let mut link = RecordingLink::new();
            let now = Instant::now();
            let mut session = started(&mut sinks, &mut link, now);

            let mut completions = 0;
            for &i in &order {
                if session.on_data(&unit(1, &data, offsets[i]), &mut link, now).unwrap().is_some() {
                    completions += 1;
                }
            }
            // Late duplicate after completion is dropped
            assert!(session.on_data(&unit(1, &data, 0), &mut link, now).unwrap().is_none());

            assert_eq!(completions, 1, "order {:?}", order);
            assert_eq!(sinks.contents("log1.bin").unwrap(), data, "order {:?}", order);
        }
    }

    #[test]
    fn test_missing_interior_prevents_completion() {
        let data = log_bytes(300);
        let mut sinks = MemorySinkProvider::new();
        let mut link = RecordingLink::new();
        let now = Instant::now();
        let mut session = started(&mut sinks, &mut link, now);

        for ofs in [0, 180, 270] {
            assert!(session.on_data(&unit(1, &data, ofs), &mut link, now).unwrap().is_none());
        }
        assert!(session.is_active());
        assert!(link.sent.is_empty());
    }

    #[test]
    fn test_zero_count_unit_completes() {
        let data = log_bytes(180);
        let mut sinks = MemorySinkProvider::new();
        let mut link = RecordingLink::new();
        let now = Instant::now();
        let mut session = started(&mut sinks, &mut link, now);

        assert!(session.on_data(&unit(1, &data, 0), &mut link, now).unwrap().is_none());
        assert!(session.on_data(&unit(1, &data, 90), &mut link, now).unwrap().is_none());
        let summary = session.on_data(&unit(1, &data, 180), &mut link, now).unwrap().unwrap();

        assert_eq!(summary.size, 180);
        assert_eq!(link.sent, vec![Command::RequestEnd]);
    }

    #[test]
    fn test_data_without_session_is_dropped() {
        let data = log_bytes(90);
        let mut link = RecordingLink::new();
        let mut session = DownloadSession::new();

        let result = session.on_data(&unit(1, &data, 0), &mut link, Instant::now()).unwrap();
        assert!(result.is_none());
        assert!(link.sent.is_empty());
    }

    #[test]
    fn test_data_for_other_log_is_ignored() {
        let data = log_bytes(50);
        let mut sinks = MemorySinkProvider::new();
        let mut link = RecordingLink::new();
        let now = Instant::now();
        let mut session = started(&mut sinks, &mut link, now);

        let result = session.on_data(&unit(9, &data, 0), &mut link, now).unwrap();
        assert!(result.is_none());
        assert!(session.is_active());
        assert_eq!(sinks.contents("log1.bin").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_write_failure_resets_session() {
        let data = log_bytes(200);
        let mut sinks = MemorySinkProvider::new();
        let mut link = RecordingLink::new();
        let now = Instant::now();
        let mut session = started(&mut sinks, &mut link, now);

        sinks.set_write_error(Some(io::ErrorKind::PermissionDenied));
        let result = session.on_data(&unit(1, &data, 0), &mut link, now);

        assert!(matches!(result, Err(LogDumpError::Io(_))));
        assert!(!session.is_active());
        assert_eq!(session.retries(), 0);
    }

    #[test]
    fn test_idle_tick_waits_for_retry_interval() {
        let data = log_bytes(900);
        let mut sinks = MemorySinkProvider::new();
        let mut link = RecordingLink::new();
        let t0 = Instant::now();
        let mut session = started(&mut sinks, &mut link, t0);
        let interval = Duration::from_millis(700);

        session.on_data(&unit(1, &data, 0), &mut link, t0).unwrap();
        session.on_data(&unit(1, &data, 270), &mut link, t0).unwrap();

        let sent = session.on_idle_tick(&mut link, t0 + Duration::from_millis(500), interval, 20).unwrap();
        assert_eq!(sent, 0);

        let t1 = t0 + Duration::from_millis(800);
        let sent = session.on_idle_tick(&mut link, t1, interval, 20).unwrap();
        assert_eq!(sent, 1);
        assert_eq!(
            link.take_sent(),
            vec![Command::RequestData { log_id: 1, offset: 90, length: 180 }]
        );
        assert_eq!(session.retries(), 1);

        // The wave resets the idle clock
        let sent = session.on_idle_tick(&mut link, t1 + Duration::from_millis(100), interval, 20).unwrap();
        assert_eq!(sent, 0);
    }

    #[test]
    fn test_idle_tick_without_gaps_requests_tail() {
        let data = log_bytes(900);
        let mut sinks = MemorySinkProvider::new();
        let mut link = RecordingLink::new();
        let t0 = Instant::now();
        let mut session = started(&mut sinks, &mut link, t0);

        for ofs in [0, 90, 180] {
            session.on_data(&unit(1, &data, ofs), &mut link, t0).unwrap();
        }

        let sent = session
            .on_idle_tick(&mut link, t0 + Duration::from_secs(1), Duration::from_millis(700), 20)
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(
            link.sent,
            vec![Command::RequestData { log_id: 1, offset: 270, length: REQUEST_TO_END }]
        );
        assert_eq!(session.retries(), 1);
    }

    #[test]
    fn test_idle_tick_with_nothing_received_repeats_request() {
        let mut sinks = MemorySinkProvider::new();
        let mut link = RecordingLink::new();
        let t0 = Instant::now();
        let mut session = started(&mut sinks, &mut link, t0);

        session
            .on_idle_tick(&mut link, t0 + Duration::from_secs(1), Duration::from_millis(700), 20)
            .unwrap();
        assert_eq!(link.sent, vec![Command::request_full_log(1)]);
    }

    #[test]
    fn test_idle_tick_caps_requests() {
        let data = log_bytes(90 * 100);
        let mut sinks = MemorySinkProvider::new();
        let mut link = RecordingLink::new();
        let t0 = Instant::now();
        let mut session = started(&mut sinks, &mut link, t0);

        for i in 0..50u32 {
            session.on_data(&unit(1, &data, (i * 2 + 1) * CHUNK_SIZE), &mut link, t0).unwrap();
        }

        let sent = session
            .on_idle_tick(&mut link, t0 + Duration::from_secs(1), Duration::from_millis(700), 20)
            .unwrap();
        assert_eq!(sent, 20);
        assert_eq!(session.retries(), 20);
        assert_eq!(
            link.sent[0],
            Command::RequestData { log_id: 1, offset: 0, length: 90 }
        );
    }

    #[test]
    fn test_idle_tick_without_session_does_nothing() {
        let mut link = RecordingLink::new();
        let mut session = DownloadSession::new();
        let sent = session
            .on_idle_tick(&mut link, Instant::now(), Duration::from_millis(700), 20)
            .unwrap();
        assert_eq!(sent, 0);
        assert!(link.sent.is_empty());
    }

    #[test]
    fn test_status_reports_progress() {
        let data = log_bytes(300);
        let mut sinks = MemorySinkProvider::new();
        let mut link = RecordingLink::new();
        let t0 = Instant::now();
        let mut session = started(&mut sinks, &mut link, t0);

        session.on_data(&unit(1, &data, 0), &mut link, t0).unwrap();
        session.on_data(&unit(1, &data, 180), &mut link, t0).unwrap();

        let status = session.status(Some(300), t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(status.bytes_received, 270);
        assert_eq!(status.expected_size, 300);
        assert!((status.percent - 90.0).abs() < 1e-9);
        assert!((status.kbytes_per_sec - 0.27).abs() < 1e-9);
        assert_eq!(status.missing, 1);
        assert_eq!(
            status.to_string(),
            "Downloading log1.bin - 270/300 bytes 90.0% 0.3 kbyte/s (0 retries 1 missing)"
        );
    }

    #[test]
    fn test_status_without_session() {
        let session = DownloadSession::new();
        assert!(session.status(Some(10), Instant::now()).is_none());
    }

    #[test]
    fn test_cancel_closes_session() {
        let mut sinks = MemorySinkProvider::new();
        let mut link = RecordingLink::new();
        let mut session = started(&mut sinks, &mut link, Instant::now());

        assert!(session.cancel());
        assert!(!session.is_active());
        assert!(!session.cancel());
    }

    #[test]
    fn test_throughput_decimal_kilobytes() {
        assert!((throughput_kbps(150_000, Duration::from_secs(5)) - 30.0).abs() < 1e-9);
        assert_eq!(throughput_kbps(1000, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_percent_complete() {
        assert_eq!(percent_complete(50, None), 0.0);
        assert_eq!(percent_complete(50, Some(0)), 100.0);
        assert!((percent_complete(50, Some(200)) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_display() {
        let summary = DownloadSummary {
            log_id: 4,
            filename: "log4.bin".to_string(),
            size: 150_000,
            elapsed_secs: 5.0,
            kbytes_per_sec: 30.0,
            retries: 2,
            finished_at: Utc::now(),
        };
        assert_eq!(
            summary.to_string(),
            "Finished downloading log4.bin (150000 bytes 5 seconds, 30.0 kbyte/sec 2 retries)"
        );
    }
}
