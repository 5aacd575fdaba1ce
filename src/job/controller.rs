//! # Job Controller
//!
//! Owns the device and everything that happens to it: burn jobs, control
//! operations and the status snapshot.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use image::{DynamicImage, GrayImage};
//! use wainlux::config::Config;
//! use wainlux::events::{EventBus, Phase};
//! use wainlux::job::{JobController, JobRequest};
//!
//! let config = Arc::new(Config { dry_run: true, ..Config::default() });
//! let controller = JobController::from_config(config, EventBus::new());
//!
//! let request = JobRequest::from_image(DynamicImage::ImageLuma8(GrayImage::new(8, 4)));
//! let job = controller.run(request).unwrap();
//! assert_eq!(job.phase, Phase::Complete);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crate::config::Config;
use crate::device::{Device, DeviceConnection, DeviceLease, OperationMode, StatusSnapshot};
use crate::error::JobError;
use crate::events::{EventBus, Phase, ProgressEvent, Subscription};
use crate::protocol::commands::ControlCommand;
use crate::transport::{self, Transport};

use super::link::Link;
use super::runner::{self, ActiveSlot, JobContext};
use super::{BurnJob, CancelToken, JobId, JobRegistry, JobRequest};

/// What [`JobController::stop`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A running job was asked to cancel
    CancelledJob(JobId),
    /// No job was running; the device was sent Stop + Connect
    Reset,
}

/// Handle to a submitted job.
pub struct JobHandle {
    id: JobId,
    cancel: CancelToken,
    thread: JoinHandle<Result<BurnJob, JobError>>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the job reaches a terminal phase.
    pub fn wait(self) -> Result<BurnJob, JobError> {
        self.thread
            .join()
            .unwrap_or_else(|_| Err(JobError::Aborted("job thread panicked".to_string())))
    }
}

/// Cloneable front door to one engraver.
#[derive(Clone)]
pub struct JobController {
    config: Arc<Config>,
    device: Arc<Device>,
    events: EventBus,
    jobs: JobRegistry,
    active: ActiveSlot,
}

impl JobController {
    pub fn new(config: Arc<Config>, transport: Box<dyn Transport>, events: EventBus) -> Self {
        let connection = DeviceConnection::new(config.port.clone(), config.baud, transport);
        let device = Arc::new(Device::new(connection, &config));
        log::debug!(
            "Job controller on {} ({} mode)",
            config.port,
            config.operation_mode()
        );
        Self {
            config,
            device,
            events,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Controller with the transport the configuration selects.
    pub fn from_config(config: Arc<Config>, events: EventBus) -> Self {
        let transport = transport::for_config(&config);
        Self::new(config, transport, events)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Status snapshot. Never waits for a running job and changes nothing.
    pub fn status(&self) -> StatusSnapshot {
        self.device.status()
    }

    pub fn is_busy(&self) -> bool {
        self.device.is_busy()
    }

    pub fn subscribe(&self, id: JobId) -> Subscription {
        self.events.subscribe(id)
    }

    pub fn job(&self, id: JobId) -> Option<BurnJob> {
        self.read_jobs().get(&id).cloned()
    }

    /// All known jobs, oldest first.
    pub fn jobs(&self) -> Vec<BurnJob> {
        let mut jobs: Vec<BurnJob> = self.read_jobs().values().cloned().collect();
        jobs.sort_by_key(|j| j.submitted_at);
        jobs
    }

    fn read_jobs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<JobId, BurnJob>> {
        self.jobs.read().unwrap_or_else(|p| p.into_inner())
    }

    /// # Submit a Burn Job
    ///
    /// Takes the device and starts the job on its own thread. Fails with
    /// [`JobError::Busy`] without touching the running job if the device
    /// is already taken.
    pub fn submit(&self, request: JobRequest) -> Result<JobHandle, JobError> {
        let id = request.id;
        let lease = self.device.try_lease(OperationMode::Burning, Some(id))?;

        let cancel = CancelToken::new();
        {
            let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
            *active = Some((id, cancel.clone()));
        }
        self.prune_history();
        {
            let mut jobs = self.jobs.write().unwrap_or_else(|p| p.into_inner());
            jobs.insert(id, BurnJob::new(&request, &self.config.spec));
        }
        self.events.emit(id, Phase::Setup, 0, "Job queued");
        log::info!("[{}] submitted ({} mode)", id, self.config.operation_mode());

        let ctx = JobContext {
            config: Arc::clone(&self.config),
            events: self.events.clone(),
            jobs: Arc::clone(&self.jobs),
            active: Arc::clone(&self.active),
        };
        let token = cancel.clone();
        let spawned = thread::Builder::new()
            .name(format!("burn-{}", id.simple()))
            .spawn(move || runner::run(ctx, lease, request, token));

        match spawned {
            Ok(thread) => Ok(JobHandle { id, cancel, thread }),
            Err(e) => {
                // The closure (and the lease in it) is gone; undo the bookkeeping.
                self.clear_active(id);
                let err = JobError::Aborted(format!("could not start job thread: {}", e));
                self.jobs
                    .write()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&id);
                let event = ProgressEvent::new(id, Phase::Error, 0, err.to_string())
                    .with_error_kind(err.kind());
                self.events.publish(id, event);
                Err(err)
            }
        }
    }

    /// Submit and wait for the outcome.
    pub fn run(&self, request: JobRequest) -> Result<BurnJob, JobError> {
        self.submit(request)?.wait()
    }

    /// Ask job `id` to cancel. False if it is not the running job.
    pub fn cancel(&self, id: JobId) -> bool {
        let active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        match active.as_ref() {
            Some((active_id, token)) if *active_id == id => {
                log::info!("[{}] cancel requested", id);
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Forget the oldest finished jobs beyond the configured history, along
    /// with their event state.
    fn prune_history(&self) {
        let forgotten: Vec<JobId> = {
            let mut jobs = self.jobs.write().unwrap_or_else(|p| p.into_inner());
            let mut finished: Vec<(JobId, _)> = jobs
                .values()
                .filter(|j| j.is_finished())
                .map(|j| (j.id, j.finished_at))
                .collect();
            if finished.len() <= self.config.job_history {
                return;
            }
            finished.sort_by_key(|(_, at)| *at);
            finished.truncate(finished.len() - self.config.job_history);
            for (id, _) in &finished {
                jobs.remove(id);
            }
            finished.into_iter().map(|(id, _)| id).collect()
        };
        for id in &forgotten {
            self.events.forget(*id);
        }
        log::debug!("Forgot {} finished job(s)", forgotten.len());
    }

    fn clear_active(&self, id: JobId) {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if active.as_ref().is_some_and(|(active_id, _)| *active_id == id) {
            *active = None;
        }
    }

    // ========================================================================
    // Control operations
    // ========================================================================

    /// Open the port and verify the device. Returns the firmware version.
    pub fn connect(&self) -> Result<String, JobError> {
        let lease = self.device.try_lease(OperationMode::Control, None)?;
        if self.config.dry_run {
            return Link::dry_run(&self.config).query_status();
        }
        let mut conn = lease.connection();
        let result = conn.open().map_err(JobError::from).and_then(|()| {
            conn.transport().clear_input()?;
            Link::hardware(&mut conn, &self.config).query_status()
        });
        match &result {
            Ok(firmware) => {
                log::info!("Connected to {} (firmware {})", conn.port(), firmware);
                conn.mark_verified(firmware.clone());
            }
            Err(e) => {
                log::error!("Connect to {} failed: {}", conn.port(), e);
                conn.fault();
            }
        }
        lease.sync_status(&conn);
        result
    }

    pub fn disconnect(&self) -> Result<(), JobError> {
        let lease = self.device.try_lease(OperationMode::Control, None)?;
        let mut conn = lease.connection();
        conn.close();
        lease.sync_status(&conn);
        log::info!("Disconnected from {}", conn.port());
        Ok(())
    }

    pub fn home(&self) -> Result<(), JobError> {
        self.control(|link| link.command(ControlCommand::Home))
    }

    /// Move the head to (x, y) in device units.
    pub fn jog(&self, x: u32, y: u32) -> Result<(), JobError> {
        let spec = &self.config.spec;
        if x >= spec.max_width || y >= spec.max_height {
            return Err(JobError::OutOfBounds { x, y });
        }
        self.control(|link| {
            link.command(ControlCommand::Jog {
                x: x as u16,
                y: y as u16,
            })
        })
    }

    /// Trace the outline a `width`×`height` burn would occupy.
    pub fn frame(&self, width: u32, height: u32) -> Result<(), JobError> {
        let spec = &self.config.spec;
        if width == 0 || height == 0 || width > spec.max_width || height > spec.max_height {
            return Err(JobError::OutOfBounds {
                x: width,
                y: height,
            });
        }
        let command = ControlCommand::Bounds {
            width: width as u16,
            height: height as u16,
            center_x: spec.center_x(width) as u16,
            center_y: spec.center_y(spec.max_height) as u16,
        };
        self.control(|link| link.command(command))
    }

    pub fn crosshair(&self, on: bool) -> Result<(), JobError> {
        self.control(|link| link.command(ControlCommand::Crosshair(on)))
    }

    /// Cancel the running job, or reset an idle device.
    pub fn stop(&self) -> Result<StopOutcome, JobError> {
        let running = self
            .active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|(id, _)| *id);
        if let Some(id) = running {
            if self.cancel(id) {
                return Ok(StopOutcome::CancelledJob(id));
            }
        }
        self.control(|link| {
            link.command(ControlCommand::Stop)?;
            link.command(ControlCommand::Connect)
        })?;
        Ok(StopOutcome::Reset)
    }

    /// Run `op` with exclusive use of an open connection.
    fn control<T, F>(&self, op: F) -> Result<T, JobError>
    where
        F: FnOnce(&mut Link<'_>) -> Result<T, JobError>,
    {
        let lease: DeviceLease = self.device.try_lease(OperationMode::Control, None)?;
        if self.config.dry_run {
            return op(&mut Link::dry_run(&self.config));
        }
        let mut conn = lease.connection();
        if !conn.is_open() {
            return Err(JobError::NotConnected);
        }
        let result = op(&mut Link::hardware(&mut conn, &self.config));
        if let Err(e) = &result {
            if e.is_link_fault() {
                log::error!("Link fault during control operation: {}", e);
                conn.fault();
            }
        }
        lease.sync_status(&conn);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::commands::Opcode;
    use crate::transport::MockTransport;

    fn controller(mock: MockTransport) -> JobController {
        let mut config = Config {
            mock: true,
            ..Config::default()
        };
        config.timing.ack_timeout = std::time::Duration::from_millis(50);
        JobController::new(Arc::new(config), Box::new(mock), EventBus::new())
    }

    #[test]
    fn test_control_requires_connection() {
        let controller = controller(MockTransport::new());
        assert!(matches!(controller.home(), Err(JobError::NotConnected)));
    }

    #[test]
    fn test_connect_then_home() {
        let mock = MockTransport::new().with_firmware(2, 1, 0);
        let probe = mock.probe();
        let controller = controller(mock);
        assert_eq!(controller.connect().unwrap(), "v2.1.0");
        let status = controller.status();
        assert!(status.connected);
        assert_eq!(status.firmware.as_deref(), Some("v2.1.0"));

        controller.home().unwrap();
        controller.crosshair(true).unwrap();
        assert_eq!(
            probe.opcodes(),
            vec![Opcode::Status, Opcode::Home, Opcode::CrosshairOn]
        );
        assert_eq!(probe.settle_violations(), 0);
    }

    #[test]
    fn test_jog_bounds() {
        let controller = controller(MockTransport::new());
        assert!(matches!(
            controller.jog(1600, 10),
            Err(JobError::OutOfBounds { x: 1600, y: 10 })
        ));
        assert!(matches!(
            controller.frame(0, 10),
            Err(JobError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_frame_is_centred() {
        let mock = MockTransport::new();
        let probe = mock.probe();
        let controller = controller(mock);
        controller.connect().unwrap();
        controller.frame(400, 200).unwrap();
        let frames = probe.frames();
        let bounds = frames.last().unwrap();
        // payload: w, h, cx, cy
        assert_eq!(&bounds[9..], &[0x01, 0x90, 0x00, 0xC8, 0x01, 0x0B, 0x02, 0xF8]);
    }

    #[test]
    fn test_stop_when_idle_resets() {
        let mock = MockTransport::new();
        let probe = mock.probe();
        let controller = controller(mock);
        controller.connect().unwrap();
        assert_eq!(controller.stop().unwrap(), StopOutcome::Reset);
        assert_eq!(probe.count(Opcode::Stop), 1);
        assert_eq!(probe.count(Opcode::Connect), 1);
    }

    #[test]
    fn test_failed_connect_sets_error_state() {
        let controller = controller(MockTransport::new().failing_open());
        assert!(matches!(controller.connect(), Err(JobError::Transport(_))));
        let status = controller.status();
        assert!(!status.connected);
        assert_eq!(status.state, crate::device::ConnectionState::Error);
    }

    #[test]
    fn test_finished_jobs_are_pruned() {
        let config = Config {
            dry_run: true,
            job_history: 2,
            ..Config::default()
        };
        let controller =
            JobController::new(Arc::new(config), Box::new(MockTransport::new()), EventBus::new());
        let image = || image::DynamicImage::ImageLuma8(image::GrayImage::new(8, 2));

        let ids: Vec<JobId> = (0..4)
            .map(|_| controller.run(JobRequest::from_image(image())).unwrap().id)
            .collect();

        // the fourth submission kept two finished jobs, then finished itself
        let kept: Vec<JobId> = controller.jobs().iter().map(|j| j.id).collect();
        assert_eq!(kept, ids[1..].to_vec());
        assert!(controller.job(ids[0]).is_none());
        assert!(controller.events().latest(ids[0]).is_none());
        assert_eq!(
            controller.events().latest(ids[3]).unwrap().phase,
            Phase::Complete
        );
    }

    #[test]
    fn test_disconnect() {
        let controller = controller(MockTransport::new());
        controller.connect().unwrap();
        controller.disconnect().unwrap();
        assert!(!controller.status().connected);
        assert!(matches!(controller.home(), Err(JobError::NotConnected)));
    }
}
