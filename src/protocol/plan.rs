//! # Command Plan
//!
//! A dry listing of every frame a burn would put on the wire, with totals
//! and a bounds check. Nothing here talks to a device.
//!
//! ```
//! use image::{DynamicImage, GrayImage};
//! use wainlux::protocol::plan::CommandPlan;
//! use wainlux::raster::{prepare, PrepareOptions};
//!
//! let img = DynamicImage::ImageLuma8(GrayImage::new(16, 4));
//! let raster = prepare(&img, &PrepareOptions::default()).unwrap();
//! let plan = CommandPlan::for_job(&raster).unwrap();
//! assert_eq!(plan.line_frames, 4);
//! assert!(plan.warnings.is_empty());
//! ```

use serde::Serialize;

use crate::device::DeviceSpec;
use crate::error::CodecError;
use crate::events::Phase;
use crate::protocol::commands::{ControlCommand, Opcode};
use crate::protocol::frame::{self, HEADER_LEN};
use crate::raster::RasterJobInput;

/// Observed time per acknowledged raster line, in seconds
const LINE_SECONDS: f64 = 0.1;

/// Observed round trip for a control frame, in seconds
const CONTROL_SECONDS: f64 = 0.05;

/// One planned frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedCommand {
    pub opcode: &'static str,
    pub code: u8,
    pub description: String,
    pub bytes: usize,
    pub phase: Phase,
}

/// Area the head will cover, in device units. Signed, so a raster pushed
/// past the left edge shows up as negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanBounds {
    pub width: u32,
    pub height: u32,
    pub center_x: u32,
    pub center_y: u32,
    pub min_x: i64,
    pub max_x: i64,
    pub min_y: i64,
    pub max_y: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandPlan {
    pub commands: Vec<PlannedCommand>,
    pub total_commands: usize,
    pub total_bytes: usize,
    pub line_frames: usize,
    pub estimated_seconds: f64,
    pub bounds: PlanBounds,
    pub warnings: Vec<String>,
}

impl CommandPlan {
    /// Plan the burn of a prepared raster, frame for frame as the job
    /// controller sends it.
    pub fn for_job(raster: &RasterJobInput) -> Result<Self, CodecError> {
        let placement = raster.placement;
        let header = ControlCommand::JobHeader {
            width: raster.width as u16,
            height: raster.height as u16,
            center_x: placement.center_x as u16,
            center_y: placement.center_y as u16,
            total_bytes: raster.total_bytes() as u32,
        };

        let mut commands = Vec::with_capacity(raster.rows.len() + 6);
        commands.push(planned(ControlCommand::Status, Phase::Connect)?);
        commands.push(planned(ControlCommand::Framing, Phase::Upload)?);
        commands.push(planned(header, Phase::Upload)?);

        for (i, row) in raster.rows.iter().enumerate() {
            frame::encode_line(raster.depth, raster.power, i as u16, row)?;
            commands.push(PlannedCommand {
                opcode: Opcode::Line.name(),
                code: Opcode::Line.as_u8(),
                description: format!("Line {} ({} bytes)", i, row.len()),
                bytes: HEADER_LEN + row.len(),
                phase: Phase::Upload,
            });
        }

        commands.push(planned(ControlCommand::StartBurn, Phase::Burning)?);
        commands.push(planned(ControlCommand::Status, Phase::Wait)?);
        commands.push(planned(ControlCommand::Home, Phase::Finalize)?);

        let spec = DeviceSpec::K6;
        let line_frames = raster.rows.len();
        let control_frames = commands.len() - line_frames;
        let motion_frames = commands
            .iter()
            .filter(|c| Opcode::try_from(c.code).is_ok_and(Opcode::is_motion))
            .count();
        let estimated_seconds = line_frames as f64 * LINE_SECONDS
            + control_frames as f64 * CONTROL_SECONDS
            + motion_frames as f64 * spec.settle.as_secs_f64();

        let bounds = plan_bounds(raster);
        let warnings = check_bounds(&bounds, &spec);
        for warning in &warnings {
            log::warn!("{}", warning);
        }

        Ok(Self {
            total_commands: commands.len(),
            total_bytes: commands.iter().map(|c| c.bytes).sum(),
            line_frames,
            estimated_seconds,
            bounds,
            warnings,
            commands,
        })
    }

    /// Short human-readable report.
    pub fn summary(&self) -> String {
        let b = &self.bounds;
        let mut lines = vec![
            format!(
                "Commands: {} ({} line frames)",
                self.total_commands, self.line_frames
            ),
            format!("Size: {} bytes", self.total_bytes),
            format!("Est. time: {:.1}s", self.estimated_seconds),
            format!(
                "Bounds: {}x{} @ ({}, {})",
                b.width, b.height, b.center_x, b.center_y
            ),
            format!("  X: {} -> {}", b.min_x, b.max_x),
            format!("  Y: {} -> {}", b.min_y, b.max_y),
        ];
        lines.extend(self.warnings.iter().map(|w| format!("Warning: {}", w)));
        lines.join("\n")
    }
}

fn planned(command: ControlCommand, phase: Phase) -> Result<PlannedCommand, CodecError> {
    Ok(PlannedCommand {
        opcode: command.opcode().name(),
        code: command.opcode().as_u8(),
        description: command.describe(),
        bytes: command.encode()?.len(),
        phase,
    })
}

fn plan_bounds(raster: &RasterJobInput) -> PlanBounds {
    let (cx, cy) = (raster.placement.center_x as i64, raster.placement.center_y as i64);
    let (half_w, half_h) = (raster.width as i64 / 2, raster.height as i64 / 2);
    PlanBounds {
        width: raster.width,
        height: raster.height,
        center_x: raster.placement.center_x,
        center_y: raster.placement.center_y,
        min_x: cx - half_w,
        max_x: cx + half_w,
        min_y: cy - half_h,
        max_y: cy + half_h,
    }
}

fn check_bounds(bounds: &PlanBounds, spec: &DeviceSpec) -> Vec<String> {
    let mut warnings = Vec::new();
    if bounds.min_x < 0 {
        warnings.push(format!("Left edge at x={} is off the work area", bounds.min_x));
    }
    if bounds.max_x > spec.max_width as i64 {
        warnings.push(format!(
            "Right edge at x={} exceeds width {}",
            bounds.max_x, spec.max_width
        ));
    }
    if bounds.min_y < 0 {
        warnings.push(format!("Top edge at y={} is off the work area", bounds.min_y));
    }
    if bounds.max_y > spec.max_height as i64 {
        warnings.push(format!(
            "Bottom edge at y={} exceeds height {}",
            bounds.max_y, spec.max_height
        ));
    }
    warnings
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{prepare, PrepareOptions};
    use image::{DynamicImage, GrayImage};
    use pretty_assertions::assert_eq;

    fn raster(width: u32, height: u32) -> RasterJobInput {
        let img = DynamicImage::ImageLuma8(GrayImage::new(width, height));
        prepare(&img, &PrepareOptions::default()).unwrap()
    }

    #[test]
    fn test_sequence_matches_burn() {
        let plan = CommandPlan::for_job(&raster(10, 3)).unwrap();
        let opcodes: Vec<&str> = plan.commands.iter().map(|c| c.opcode).collect();
        assert_eq!(
            opcodes,
            vec![
                Opcode::Status.name(),
                Opcode::Framing.name(),
                Opcode::JobHeader.name(),
                Opcode::Line.name(),
                Opcode::Line.name(),
                Opcode::Line.name(),
                Opcode::StartBurn.name(),
                Opcode::Status.name(),
                Opcode::Home.name(),
            ]
        );
        assert_eq!(plan.total_commands, 9);
        assert_eq!(plan.line_frames, 3);
    }

    #[test]
    fn test_totals() {
        let plan = CommandPlan::for_job(&raster(10, 3)).unwrap();
        // 10 px -> 2 bytes per row
        let lines = 3 * (HEADER_LEN + 2);
        let header = HEADER_LEN + 12;
        let controls = 5 * HEADER_LEN;
        assert_eq!(plan.total_bytes, lines + header + controls);
        assert!(plan.estimated_seconds > 0.3);
    }

    #[test]
    fn test_full_width_warns_right_edge() {
        let plan = CommandPlan::for_job(&raster(1600, 10)).unwrap();
        assert_eq!(plan.bounds.max_x, 867 + 800);
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.summary().contains("Warning: Right edge"));
    }

    #[test]
    fn test_serializes() {
        let plan = CommandPlan::for_job(&raster(8, 1)).unwrap();
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["line_frames"], 1);
        assert_eq!(json["commands"][3]["phase"], "upload");
    }
}
