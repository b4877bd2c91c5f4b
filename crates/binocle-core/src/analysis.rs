//! Analysis boundary.
//!
//! The pairing consumer hands every frame pair to an [`Analyzer`]. What the
//! analyzer detects is opaque here; [`FrameStatsAnalyzer`] is the built-in
//! one, reporting exposure statistics per frame.

use binocle_hw::Frame;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("analysis failed: {0}")]
    Failed(String),
    #[error("frame unusable: {0}")]
    InvalidFrame(String),
}

/// Synchronous analysis of one primary frame and, in dual-sensor mode, its
/// secondary partner.
pub trait Analyzer: Send + 'static {
    type Output: Send + 'static;

    fn analyze(
        &mut self,
        primary: &Frame,
        secondary: Option<&Frame>,
    ) -> Result<Vec<Self::Output>, AnalysisError>;
}

/// Which sensor a frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorRole {
    Primary,
    Secondary,
}

/// Exposure statistics for one frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameStats {
    pub role: SensorRole,
    pub sequence: u64,
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
    pub brightness: f32,
    pub dark: bool,
}

/// Reports brightness and a dark-frame flag for each frame of a pair.
#[derive(Debug, Clone)]
pub struct FrameStatsAnalyzer {
    /// Fraction of near-black pixels above which a frame counts as dark.
    pub dark_fraction: f32,
}

impl Default for FrameStatsAnalyzer {
    fn default() -> Self {
        Self {
            dark_fraction: 0.95,
        }
    }
}

impl FrameStatsAnalyzer {
    fn stats(&self, role: SensorRole, frame: &Frame) -> Result<FrameStats, AnalysisError> {
        if frame.luma_row(0).is_none() {
            return Err(AnalysisError::InvalidFrame(format!(
                "frame {} has no luma plane",
                frame.sequence()
            )));
        }
        Ok(FrameStats {
            role,
            sequence: frame.sequence(),
            timestamp_ns: frame.timestamp_ns(),
            width: frame.width(),
            height: frame.height(),
            brightness: frame.avg_brightness(),
            dark: frame.is_dark(self.dark_fraction),
        })
    }
}

impl Analyzer for FrameStatsAnalyzer {
    type Output = FrameStats;

    fn analyze(
        &mut self,
        primary: &Frame,
        secondary: Option<&Frame>,
    ) -> Result<Vec<FrameStats>, AnalysisError> {
        let mut out = vec![self.stats(SensorRole::Primary, primary)?];
        if let Some(frame) = secondary {
            out.push(self.stats(SensorRole::Secondary, frame)?);
        }
        Ok(out)
    }
}
