//! # Burn Jobs
//!
//! A burn job takes one image from submission to a terminal phase:
//!
//! ```text
//! Setup ─► Prepare ─► Connect ─► Upload ─► Burning ─► Wait ─► Finalize ─► Complete
//!             │          │          │  │       │
//!             └──────────┴──────────┴──┼───────┴──────────────────────► Error
//!                                      └─(cancel at a line boundary)─► Cancelled
//! ```
//!
//! ## Modules
//!
//! - [`controller`]: the public entry point; owns the device and the jobs
//! - [`runner`]: the per-job state machine (runs on its own thread)
//! - [`link`]: frame exchange with ACK, retry and the settle delay
//! - [`cancel`]: cooperative cancellation token
//!
//! ## Guarantees
//!
//! - at most one job (or control operation) holds the device; a second
//!   caller gets [`JobError::Busy`] immediately
//! - each job ends with exactly one terminal progress event, published
//!   after the device has been released
//! - no resume: a failed job is resubmitted from the first line

pub mod cancel;
pub mod controller;
pub(crate) mod link;
pub(crate) mod runner;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::Serialize;
use uuid::Uuid;

use crate::device::DeviceSpec;
use crate::error::{BoundsError, JobError};
use crate::events::Phase;
use crate::raster::{self, LaserColor, Placement, PrepareOptions, RasterJobInput, RasterStats};

pub use cancel::CancelToken;
pub use controller::{JobController, JobHandle, StopOutcome};

pub type JobId = Uuid;

pub(crate) type JobRegistry = Arc<RwLock<HashMap<JobId, BurnJob>>>;

/// Image to burn.
#[derive(Debug, Clone)]
pub enum JobSource {
    /// Encoded image file (PNG, JPEG, ...)
    Bytes(Vec<u8>),
    Image(DynamicImage),
}

impl JobSource {
    pub(crate) fn prepare(&self, options: &PrepareOptions) -> Result<RasterJobInput, BoundsError> {
        match self {
            JobSource::Bytes(bytes) => raster::prepare_bytes(bytes, options),
            JobSource::Image(img) => raster::prepare(img, options),
        }
    }
}

/// # Job Request
///
/// The id exists before submission, so a caller can subscribe to the
/// event stream first and miss nothing.
///
/// ```
/// use image::{DynamicImage, GrayImage};
/// use wainlux::job::JobRequest;
///
/// let request = JobRequest::from_image(DynamicImage::ImageLuma8(GrayImage::new(10, 10)))
///     .depth(80)
///     .canvas(800, 800);
/// assert_eq!(request.options.depth, Some(80));
/// ```
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub id: JobId,
    pub source: JobSource,
    pub options: PrepareOptions,
}

impl JobRequest {
    pub fn new(source: JobSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            options: PrepareOptions::default(),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::new(JobSource::Bytes(bytes))
    }

    pub fn from_image(img: DynamicImage) -> Self {
        Self::new(JobSource::Image(img))
    }

    pub fn depth(mut self, depth: u8) -> Self {
        self.options.depth = Some(depth);
        self
    }

    pub fn power(mut self, power: u16) -> Self {
        self.options.power = Some(power);
        self
    }

    /// Override the canvas bounds (clamped to the device limits).
    pub fn canvas(mut self, max_width: u32, max_height: u32) -> Self {
        self.options.max_width = max_width;
        self.options.max_height = max_height;
        self
    }

    pub fn threshold(mut self, threshold: u8) -> Self {
        self.options.threshold = threshold;
        self
    }

    pub fn invert(mut self, invert: bool) -> Self {
        self.options.invert = invert;
        self
    }

    pub fn laser_color(mut self, color: LaserColor) -> Self {
        self.options.laser_color = color;
        self
    }
}

/// Error detail kept on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub kind: String,
    pub message: String,
}

impl From<&JobError> for JobFailure {
    fn from(err: &JobError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// What the image pipeline produced for a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RasterSummary {
    pub source_width: u32,
    pub source_height: u32,
    pub width: u32,
    pub height: u32,
    pub resized: bool,
    pub lines: u32,
    pub total_bytes: usize,
    pub stats: RasterStats,
}

impl From<&RasterJobInput> for RasterSummary {
    fn from(raster: &RasterJobInput) -> Self {
        Self {
            source_width: raster.source_width,
            source_height: raster.source_height,
            width: raster.width,
            height: raster.height,
            resized: raster.resized,
            lines: raster.rows.len() as u32,
            total_bytes: raster.total_bytes(),
            stats: raster.stats,
        }
    }
}

/// Snapshot of one job. Only the job's runner mutates the stored copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BurnJob {
    pub id: JobId,
    pub phase: Phase,
    pub percent: u8,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub raster: Option<RasterSummary>,
    pub placement: Option<Placement>,
    pub depth: u8,
    pub power: u16,
    pub error: Option<JobFailure>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BurnJob {
    pub(crate) fn new(request: &JobRequest, spec: &DeviceSpec) -> Self {
        Self {
            id: request.id,
            phase: Phase::Setup,
            percent: 0,
            canvas_width: request.options.max_width.min(spec.max_width),
            canvas_height: request.options.max_height.min(spec.max_height),
            raster: None,
            placement: None,
            depth: spec.clamp_depth(request.options.depth),
            power: spec.clamp_power(request.options.power),
            error: None,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Phases during which the job holds the device physically busy.
    pub fn is_active(&self) -> bool {
        !self.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    #[test]
    fn test_request_ids_are_unique() {
        let img = DynamicImage::ImageLuma8(GrayImage::new(1, 1));
        let a = JobRequest::from_image(img.clone());
        let b = JobRequest::from_image(img);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_new_job_uses_device_defaults() {
        let request = JobRequest::from_bytes(Vec::new()).canvas(5000, 400);
        let job = BurnJob::new(&request, &DeviceSpec::K6);
        assert_eq!(job.phase, Phase::Setup);
        assert_eq!((job.canvas_width, job.canvas_height), (1600, 400));
        assert_eq!(job.depth, 100);
        assert_eq!(job.power, 1000);
        assert!(job.is_active());
    }

    #[test]
    fn test_failure_from_error() {
        let failure = JobFailure::from(&JobError::Busy);
        assert_eq!(failure.kind, "busy");
    }
}
