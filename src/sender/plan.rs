use std::time::Duration;
use thiserror::Error;

use crate::protocol::Resolution;

/// Default sweep: 20 to 90 in steps of 5
pub const DEFAULT_QUALITIES: [u8; 15] = [20, 25, 30, 35, 40, 45, 50, 55, 60, 65, 70, 75, 80, 85, 90];
pub const DEFAULT_SECONDS_PER_QUALITY: f64 = 5.0;
pub const DEFAULT_FPS: u32 = 30;

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("quality sweep is empty")]
    Empty,
    #[error("quality {0} is outside 1..=100")]
    Quality(u8),
    #[error("frame rate must be positive")]
    ZeroFps,
    #[error("frame rate {0} is too high to pace")]
    FrameRate(u32),
    #[error("duration must be positive and finite")]
    Duration,
    #[error("quality {quality} would send no frames ({seconds}s at {fps} fps)")]
    ZeroFrames { quality: u8, seconds: f64, fps: u32 },
}

/// One dwell of the sweep: hold `quality` for `duration` at `fps`
#[derive(Debug, Clone, PartialEq)]
pub struct SweepStep {
    pub quality: u8,
    pub duration: Duration,
    pub fps: u32,
}

impl SweepStep {
    pub fn frame_count(&self) -> u64 {
        (self.duration.as_secs_f64() * self.fps as f64).round() as u64
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps as f64)
    }
}

/// Ordered sweep schedule, consumed top to bottom for every source image
#[derive(Debug, Clone, PartialEq)]
pub struct QualitySweepPlan {
    steps: Vec<SweepStep>,
    resolutions: Vec<Resolution>,
}

impl QualitySweepPlan {
    pub fn new(steps: Vec<SweepStep>) -> Result<Self, PlanError> {
        if steps.is_empty() {
            return Err(PlanError::Empty);
        }
        for step in &steps {
            if !(1..=100).contains(&step.quality) {
                return Err(PlanError::Quality(step.quality));
            }
            if step.fps == 0 {
                return Err(PlanError::ZeroFps);
            }
            if step.frame_interval().is_zero() {
                return Err(PlanError::FrameRate(step.fps));
            }
            if step.duration.is_zero() {
                return Err(PlanError::Duration);
            }
            if step.frame_count() == 0 {
                return Err(PlanError::ZeroFrames {
                    quality: step.quality,
                    seconds: step.duration.as_secs_f64(),
                    fps: step.fps,
                });
            }
        }
        Ok(Self {
            steps,
            resolutions: Vec::new(),
        })
    }

    /// Same duration and frame rate for every quality
    pub fn uniform(qualities: &[u8], seconds: f64, fps: u32) -> Result<Self, PlanError> {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(PlanError::Duration);
        }
        let duration = Duration::from_secs_f64(seconds);
        let steps = qualities
            .iter()
            .map(|&quality| SweepStep { quality, duration, fps })
            .collect();
        Self::new(steps)
    }

    /// Resize every image to each of these before sweeping. Empty keeps the native size.
    pub fn with_resolutions(mut self, resolutions: Vec<Resolution>) -> Self {
        self.resolutions = resolutions;
        self
    }

    pub fn steps(&self) -> &[SweepStep] {
        &self.steps
    }

    pub fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    /// Frames sent per source image
    pub fn frames_per_image(&self) -> u64 {
        let per_pass: u64 = self.steps.iter().map(SweepStep::frame_count).sum();
        per_pass * self.resolutions.len().max(1) as u64
    }
}

impl Default for QualitySweepPlan {
    fn default() -> Self {
        let duration = Duration::from_secs_f64(DEFAULT_SECONDS_PER_QUALITY);
        Self {
            steps: DEFAULT_QUALITIES
                .iter()
                .map(|&quality| SweepStep { quality, duration, fps: DEFAULT_FPS })
                .collect(),
            resolutions: Vec::new(),
        }
    }
}
