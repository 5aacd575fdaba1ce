//! # Job Runner
//!
//! Drives one burn job through its phases on the job thread. The runner is
//! the only writer of its job's registry entry and event stream.
//!
//! ## Wire sequence
//!
//! ```text
//! Connect   STATUS ──► ACK v.v.v
//! Upload    FRAMING ──► ACK
//!           JOB_HEADER(w, h, cx, cy, bytes) ──► ACK
//!           LINE 0..n ──► ACK each          (cancel checked before every line)
//! Burning   START_BURN ──► ACK, then FF FF 00 pct ... until 100
//! Wait      STATUS ──► ACK v.v.v
//! Finalize  HOME ──► ACK, settle
//! ```
//!
//! Once the handshake has gone out, a cancellation always ends with HOME
//! (preceded by STOP while burning). If that close-out fails, its error is
//! the job's outcome instead of `Cancelled`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::config::Config;
use crate::device::{ConnectionState, DeviceLease};
use crate::error::JobError;
use crate::events::{EventBus, Phase, ProgressEvent};
use crate::protocol::commands::ControlCommand;
use crate::protocol::frame::StatusScanner;
use crate::raster::RasterJobInput;

use super::link::Link;
use super::{CancelToken, JobFailure, JobId, JobRegistry, JobRequest, RasterSummary};

/// Longest single wait for a burn status frame, so cancellation and the
/// overall deadline are looked at regularly.
const BURN_POLL: Duration = Duration::from_millis(250);

/// Below this, a device that goes quiet is assumed to have stalled.
const BURN_DONE_THRESHOLD: u8 = 50;

/// The job occupying the device, if any, with its cancel token.
pub(crate) type ActiveSlot = Arc<Mutex<Option<(JobId, CancelToken)>>>;

/// Shared state a runner needs besides the device itself.
#[derive(Clone)]
pub(crate) struct JobContext {
    pub config: Arc<Config>,
    pub events: EventBus,
    pub jobs: JobRegistry,
    pub active: ActiveSlot,
}

/// Publishes progress and mirrors it into the registry.
struct Progress<'a> {
    ctx: &'a JobContext,
    id: JobId,
    phase: Phase,
    percent: u8,
}

impl<'a> Progress<'a> {
    fn new(ctx: &'a JobContext, id: JobId) -> Self {
        Self {
            ctx,
            id,
            phase: Phase::Setup,
            percent: 0,
        }
    }

    /// Enter a phase at 0%.
    fn enter(&mut self, phase: Phase, message: impl Into<String>) {
        self.phase = phase;
        self.percent = 0;
        self.publish(message.into());
    }

    /// Report progress within the current phase. Never goes backwards.
    fn update(&mut self, percent: u8, message: impl Into<String>) {
        self.percent = self.percent.max(percent.min(100));
        self.publish(message.into());
    }

    fn publish(&self, message: String) {
        self.ctx.events.publish(
            self.id,
            ProgressEvent::new(self.id, self.phase, self.percent, message),
        );
        let (phase, percent) = (self.phase, self.percent);
        self.edit(|job| {
            job.phase = phase;
            job.percent = percent;
        });
    }

    fn edit(&self, f: impl FnOnce(&mut super::BurnJob)) {
        let mut jobs = self.ctx.jobs.write().unwrap_or_else(|p| p.into_inner());
        if let Some(job) = jobs.get_mut(&self.id) {
            f(job);
        }
    }

    fn record_raster(&self, raster: &RasterJobInput) {
        let summary = RasterSummary::from(raster);
        let placement = raster.placement;
        let (depth, power) = (raster.depth, raster.power);
        self.edit(|job| {
            job.raster = Some(summary);
            job.placement = Some(placement);
            job.depth = depth;
            job.power = power;
        });
    }
}

/// Run a job to its terminal phase. Consumes the lease; the device is free
/// again before the terminal event goes out.
pub(crate) fn run(
    ctx: JobContext,
    lease: DeviceLease,
    request: JobRequest,
    cancel: CancelToken,
) -> Result<super::BurnJob, JobError> {
    let id = request.id;
    let config = Arc::clone(&ctx.config);
    let mut progress = Progress::new(&ctx, id);
    let started = Instant::now();

    let result = {
        let mut conn = lease.connection();
        let result = if config.dry_run {
            let mut link = Link::dry_run(&config);
            execute(&mut link, &lease, &mut progress, &request, &cancel, &config)
        } else {
            let mut link = Link::hardware(&mut conn, &config);
            execute(&mut link, &lease, &mut progress, &request, &cancel, &config)
        };

        if !config.dry_run {
            match &result {
                Err(e) if e.is_link_fault() => {
                    log::error!("[{}] link fault, closing port: {}", id, e);
                    conn.fault();
                }
                _ if conn.is_open() => {
                    conn.set_state(ConnectionState::Connected);
                }
                _ => {}
            }
        }
        lease.sync_status(&conn);
        result
    };

    {
        let mut active = ctx.active.lock().unwrap_or_else(|p| p.into_inner());
        if active.as_ref().is_some_and(|(active_id, _)| *active_id == id) {
            *active = None;
        }
    }
    drop(lease);

    let terminal = match &result {
        Ok(()) => {
            log::info!("[{}] complete in {:.1?}", id, started.elapsed());
            ProgressEvent::new(id, Phase::Complete, 100, "Burn complete")
        }
        Err(JobError::Cancelled) => {
            log::info!("[{}] cancelled", id);
            ProgressEvent::new(id, Phase::Cancelled, 0, "Job cancelled")
                .with_error_kind(JobError::Cancelled.kind())
        }
        Err(e) => {
            log::error!("[{}] failed: {}", id, e);
            ProgressEvent::new(id, Phase::Error, 0, e.to_string()).with_error_kind(e.kind())
        }
    };

    let snapshot = {
        let mut jobs = ctx.jobs.write().unwrap_or_else(|p| p.into_inner());
        jobs.get_mut(&id).map(|job| {
            job.phase = terminal.phase;
            job.percent = terminal.percent;
            job.error = result.as_ref().err().map(JobFailure::from);
            job.finished_at = Some(Utc::now());
            job.clone()
        })
    };
    ctx.events.publish(id, terminal);

    result?;
    snapshot.ok_or_else(|| JobError::Aborted(format!("job {} vanished from the registry", id)))
}

fn execute(
    link: &mut Link<'_>,
    lease: &DeviceLease,
    progress: &mut Progress<'_>,
    request: &JobRequest,
    cancel: &CancelToken,
    config: &Config,
) -> Result<(), JobError> {
    progress.enter(Phase::Prepare, "Preparing image");
    let raster = request.source.prepare(&request.options)?;
    progress.record_raster(&raster);
    progress.update(
        100,
        format!(
            "{}x{} raster, {} lines, {:.1}% burn",
            raster.width,
            raster.height,
            raster.rows.len(),
            raster.stats.burn_percentage
        ),
    );
    if cancel.is_cancelled() {
        return Err(JobError::Cancelled);
    }

    connect(link, lease, progress)?;
    if cancel.is_cancelled() {
        log::info!("Cancel requested after handshake, homing");
        return Err(abandon(link, false));
    }

    upload(link, progress, &raster, cancel)?;
    burn(link, progress, cancel, config)?;

    progress.enter(Phase::Wait, "Waiting for device to go idle");
    link.clear_input()?;
    link.query_status()?;
    progress.update(100, "Device idle");

    progress.enter(Phase::Finalize, "Homing");
    link.command(ControlCommand::Home)?;
    link.wait_settle();
    progress.update(100, "Homed");
    Ok(())
}

/// Close out a cancelled job on the device: stop the burn if one is
/// running, then home. Returns the error the job ends with.
fn abandon(link: &mut Link<'_>, burning: bool) -> JobError {
    let commands: &[ControlCommand] = if burning {
        &[ControlCommand::Stop, ControlCommand::Home]
    } else {
        &[ControlCommand::Home]
    };
    for command in commands {
        let sent = if burning {
            link.command_while_burning(*command)
        } else {
            link.command(*command)
        };
        if let Err(e) = sent {
            log::error!("{} after cancel failed: {}", command.describe(), e);
            return e;
        }
    }
    link.wait_settle();
    JobError::Cancelled
}

fn connect(
    link: &mut Link<'_>,
    lease: &DeviceLease,
    progress: &mut Progress<'_>,
) -> Result<(), JobError> {
    progress.enter(Phase::Connect, "Connecting");
    if let Some(conn) = link.connection() {
        conn.open()?;
        conn.transport().clear_input()?;
    }
    let firmware = link.query_status()?;
    if let Some(conn) = link.connection() {
        conn.mark_verified(firmware.clone());
        lease.sync_status(conn);
    }
    progress.update(100, format!("Connected (firmware {})", firmware));
    Ok(())
}

fn upload(
    link: &mut Link<'_>,
    progress: &mut Progress<'_>,
    raster: &RasterJobInput,
    cancel: &CancelToken,
) -> Result<(), JobError> {
    let total = raster.rows.len();
    progress.enter(Phase::Upload, format!("Uploading {} lines", total));

    link.command(ControlCommand::Framing)?;
    link.command(ControlCommand::JobHeader {
        width: raster.width as u16,
        height: raster.height as u16,
        center_x: raster.placement.center_x as u16,
        center_y: raster.placement.center_y as u16,
        total_bytes: raster.total_bytes() as u32,
    })?;

    for (i, row) in raster.rows.iter().enumerate() {
        if cancel.is_cancelled() {
            log::info!("Cancel requested after {}/{} lines, homing", i, total);
            return Err(abandon(link, false));
        }
        link.line(raster.depth, raster.power, i as u16, row)?;
        let done = i + 1;
        progress.update((done * 100 / total) as u8, format!("Line {}/{}", done, total));
    }
    Ok(())
}

fn burn(
    link: &mut Link<'_>,
    progress: &mut Progress<'_>,
    cancel: &CancelToken,
    config: &Config,
) -> Result<(), JobError> {
    progress.enter(Phase::Burning, "Burning");
    link.command(ControlCommand::StartBurn)?;

    let timing = config.timing;
    let started = Instant::now();
    let mut last_report = Instant::now();
    let mut last_percent = 0u8;
    let mut scanner = StatusScanner::new();

    loop {
        if cancel.is_cancelled() {
            log::info!("Cancel requested at {}% burned, stopping", last_percent);
            return Err(abandon(link, true));
        }

        if started.elapsed() >= timing.max_burn_duration {
            log::warn!(
                "Burn exceeded {:?} at {}%",
                timing.max_burn_duration,
                last_percent
            );
            return settle_silence(last_percent);
        }
        if last_report.elapsed() >= timing.burn_idle_timeout {
            log::warn!(
                "Device silent for {:?} at {}%",
                timing.burn_idle_timeout,
                last_percent
            );
            return settle_silence(last_percent);
        }

        let wait = BURN_POLL
            .min(timing.burn_idle_timeout.saturating_sub(last_report.elapsed()))
            .min(timing.max_burn_duration.saturating_sub(started.elapsed()));
        let Some(percent) = link.next_burn_status(&mut scanner, wait)? else {
            continue;
        };

        last_report = Instant::now();
        if percent > last_percent || percent == 100 {
            last_percent = percent;
            progress.update(percent, format!("Burning {}%", percent));
        }
        if percent >= 100 {
            return Ok(());
        }
    }
}

/// Outcome of a burn the device stopped reporting on.
fn settle_silence(last_percent: u8) -> Result<(), JobError> {
    if last_percent >= BURN_DONE_THRESHOLD {
        log::info!("Treating burn as finished at {}%", last_percent);
        Ok(())
    } else {
        Err(JobError::BurnIncomplete { last_percent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_threshold() {
        assert!(settle_silence(50).is_ok());
        assert!(settle_silence(99).is_ok());
        assert!(matches!(
            settle_silence(49),
            Err(JobError::BurnIncomplete { last_percent: 49 })
        ));
    }

    #[test]
    fn test_progress_never_goes_backwards() {
        let ctx = JobContext {
            config: Arc::new(Config::default()),
            events: EventBus::new(),
            jobs: JobRegistry::default(),
            active: ActiveSlot::default(),
        };
        let id = JobId::new_v4();
        let mut progress = Progress::new(&ctx, id);
        progress.enter(Phase::Upload, "start");
        progress.update(40, "a");
        progress.update(20, "b");
        assert_eq!(ctx.events.latest(id).unwrap().percent, 40);
        progress.enter(Phase::Burning, "burn");
        assert_eq!(ctx.events.latest(id).unwrap().percent, 0);
    }
}
