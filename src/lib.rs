//! # Wainlux - K6 Laser Engraver Library
//!
//! Wainlux drives the Wainlux K6 desktop laser engraver over its USB serial
//! link. It provides:
//!
//! - **Protocol implementation**: K6 frame codec and control commands
//! - **Image pipeline**: bounded, centred 1-bit rasters from any image
//! - **Job controller**: exclusive device access, handshake, line upload
//!   with ACK/retry, cancellation and dry-run
//! - **Progress events**: per-subscriber streams with replay of the latest state
//! - **Transport**: raw serial TTY, plus a simulated K6 for tests
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use wainlux::{Config, EventBus, JobController, JobRequest};
//!
//! // Resolve mode flags once
//! let config = Arc::new(Config::from_env());
//! let controller = JobController::from_config(config, EventBus::new());
//!
//! // Burn a PNG at depth 80
//! let bytes = std::fs::read("logo.png")?;
//! let request = JobRequest::from_bytes(bytes).depth(80);
//!
//! let mut events = controller.subscribe(request.id);
//! let handle = controller.submit(request)?;
//! while let Some(event) = events.blocking_recv() {
//!     println!("{} {}% {}", event.phase, event.percent, event.message);
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! handle.wait()?;
//!
//! # Ok::<(), wainlux::WainluxError>(())
//! ```
//!
//! ## Module Overview
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`protocol`] | K6 frame codec, opcodes, command plans |
//! | [`raster`] | Image pipeline (resize, threshold, pack) |
//! | [`job`] | Burn jobs and device control operations |
//! | [`events`] | Progress event bus |
//! | [`transport`] | Serial and simulated transports |
//! | [`device`] | Connection state and hardware geometry |
//! | [`render`] | Calibration patterns and Wi-Fi QR cards |
//! | [`config`] | Immutable runtime configuration |
//! | [`error`] | Error types |
//!
//! ## Supported Engravers
//!
//! Currently tested with:
//! - Wainlux K6 (80 × 76 mm, 0.05 mm/px, CH340 USB serial)

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod job;
pub mod protocol;
pub mod raster;
pub mod render;
pub mod transport;

// Re-exports for convenience
pub use config::Config;
pub use device::DeviceSpec;
pub use error::WainluxError;
pub use events::{EventBus, Phase, ProgressEvent};
pub use job::{JobController, JobRequest};
pub use transport::MockTransport;
