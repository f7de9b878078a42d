//! # Scheduler Loop
//!
//! Drives a [`LogEngine`] on tokio: a fixed-rate tick, operator command lines
//! and a shutdown signal, all serviced by one task so the engine is never
//! touched concurrently.

use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::command::LogCommand;
use crate::engine::LogEngine;
use crate::error::Result;
use crate::link::DeviceLink;
use crate::report::DownloadReport;
use crate::sink::SinkProvider;

/// Run the engine until `shutdown` resolves, or until `input` is exhausted and
/// the engine has nothing left to do
///
/// # Arguments
///
/// * `engine` - Engine to drive
/// * `input` - Source of `log ...` command lines
/// * `tick_interval` - Period of the engine tick
/// * `report` - Where finished downloads are recorded, if anywhere
/// * `shutdown` - Resolves when the process should stop
///
/// # Errors
///
/// Returns error if reading command input fails
pub async fn run<L, P, R, F>(
    engine: &mut LogEngine<L, P>,
    input: R,
    tick_interval: Duration,
    mut report: Option<DownloadReport>,
    shutdown: F,
) -> Result<()>
where
    L: DeviceLink,
    P: SinkProvider,
    R: AsyncBufRead + Unpin,
    F: Future<Output = ()>,
{
    let mut lines = input.lines();
    let mut ticker = interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut input_open = true;
    tokio::pin!(shutdown);

    info!("Scheduler running at {}ms per tick", tick_interval.as_millis());

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down");
                if engine.session().is_active() {
                    warn!("Download of {:?} interrupted", engine.session().filename());
                }
                break;
            }

            _ = ticker.tick() => {
                engine.tick(Instant::now().into_std());
                record_completed(engine, report.as_mut());

                if !input_open && engine.is_idle() {
                    info!("Command input closed and nothing left to do");
                    break;
                }
            }

            line = lines.next_line(), if input_open => {
                match line? {
                    Some(line) => execute_line(engine, &line),
                    None => {
                        debug!("End of command input");
                        input_open = false;
                    }
                }
            }
        }
    }

    Ok(())
}

fn execute_line<L: DeviceLink, P: SinkProvider>(engine: &mut LogEngine<L, P>, line: &str) {
    if line.trim().is_empty() {
        return;
    }

    let result = line
        .parse::<LogCommand>()
        .and_then(|command| engine.execute(command, Instant::now().into_std()));
    if let Err(e) = result {
        warn!("{}", e);
    }
}

fn record_completed<L: DeviceLink, P: SinkProvider>(
    engine: &mut LogEngine<L, P>,
    report: Option<&mut DownloadReport>,
) {
    let completed = engine.take_completed();
    let Some(report) = report else {
        return;
    };
    for summary in &completed {
        if let Err(e) = report.append(summary) {
            warn!("Failed to record download of {} in {}: {}", summary.filename, report.path().display(), e);
        }
    }
}
