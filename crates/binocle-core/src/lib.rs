//! binocle-core: pairing and still-capture coordination for two sensors.
//!
//! A primary (visible) sensor and an optional secondary (IR) sensor
//! stream continuously into conflated mailboxes that are paired and
//! analyzed; on demand a single still frame is captured from each and
//! bound to the primary's capture metadata.

pub mod analysis;
pub mod coordinator;
pub mod mailbox;
pub mod pairing;
pub mod snapshot;
pub mod still;

pub use analysis::{AnalysisError, Analyzer, FrameStats, FrameStatsAnalyzer, SensorRole};
pub use coordinator::{CoordinatorConfig, CoordinatorError, CoordinatorStatus, DualSensorCoordinator};
pub use pairing::{AnalysisOutcome, FramePair};
pub use snapshot::save_corrected_luma;
pub use still::{CaptureError, CombinedCaptureResult, StillCaptureCoordinator};
