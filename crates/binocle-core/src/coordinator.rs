//! Dual-sensor lifecycle: open, pair, capture, close.

use crate::analysis::Analyzer;
use crate::pairing::{attach_mailbox, run_pairing, spawn_analysis_thread, AnalysisOutcome};
use crate::still::{
    CaptureError, CombinedCaptureResult, StillCaptureCoordinator, CAPTURE_TIMEOUT,
    IMAGE_BUFFER_SIZE,
};
use binocle_hw::{
    CameraBackend, DeviceOpenError, FrameSink, Illuminator, SensorConfig, SensorSession,
    SessionConfigError,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Output size requested from the secondary (IR) sensor.
pub const SECONDARY_SIZE: (u32, u32) = (480, 640);

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Device(#[from] DeviceOpenError),
    #[error(transparent)]
    SessionConfig(#[from] SessionConfigError),
    #[error("analysis is already running")]
    AnalysisRunning,
    #[error("failed to spawn analysis thread: {0}")]
    Spawn(std::io::Error),
    #[error("coordinator is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub primary_id: String,
    /// `None` runs single-sensor.
    pub secondary_id: Option<String>,
    pub primary_size: Option<(u32, u32)>,
    pub secondary_size: Option<(u32, u32)>,
    pub buffer_count: usize,
    pub capture_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            primary_id: "/dev/video0".into(),
            secondary_id: Some("/dev/video2".into()),
            primary_size: None,
            secondary_size: Some(SECONDARY_SIZE),
            buffer_count: IMAGE_BUFFER_SIZE,
            capture_timeout: CAPTURE_TIMEOUT,
        }
    }
}

/// Snapshot of one sensor for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SensorStatus {
    pub sensor_id: String,
    pub width: u32,
    pub height: u32,
    pub analysis_frames: u64,
    pub analysis_dropped: u64,
    pub still_frames: u64,
    pub outstanding: usize,
}

impl SensorStatus {
    fn of(session: &SensorSession) -> Self {
        let (width, height) = session.output_size();
        let analysis = session.analysis_sink().pool();
        let still = session.still_sink().pool();
        Self {
            sensor_id: session.sensor_id().to_string(),
            width,
            height,
            analysis_frames: analysis.acquired(),
            analysis_dropped: analysis.exhausted(),
            still_frames: still.acquired(),
            outstanding: analysis.outstanding() + still.outstanding(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub primary: SensorStatus,
    pub secondary: Option<SensorStatus>,
    pub analysis_running: bool,
    pub closed: bool,
}

/// Owns the primary and optional secondary sensor, the pairing pipeline,
/// and the still-capture state machine.
pub struct DualSensorCoordinator {
    primary: Arc<SensorSession>,
    secondary: Option<Arc<SensorSession>>,
    illuminator: Option<Illuminator>,
    still: StillCaptureCoordinator,
    pairing: Option<JoinHandle<()>>,
    analysis: Option<std::thread::JoinHandle<()>>,
    closed: bool,
}

impl DualSensorCoordinator {
    /// Open both sensors, configure their sessions, and start the
    /// repeating preview on each.
    ///
    /// The secondary sensor is opened first and illumination switched on
    /// with it. Any failure closes whatever was already opened.
    pub async fn open(
        backend: Arc<dyn CameraBackend>,
        config: &CoordinatorConfig,
        illuminator: Option<Illuminator>,
        preview: Option<Arc<FrameSink>>,
    ) -> Result<Self, CoordinatorError> {
        let buffer_count = config.buffer_count.max(1);

        let secondary = match &config.secondary_id {
            Some(id) => {
                let session = SensorSession::open(
                    Arc::clone(&backend),
                    id,
                    SensorConfig {
                        target_size: config.secondary_size,
                        buffer_count,
                    },
                )
                .await?;
                if let Some(ir) = &illuminator {
                    illuminate(ir, true);
                }
                Some(Arc::new(session))
            }
            None => None,
        };

        let mut coordinator = match SensorSession::open(
            backend,
            &config.primary_id,
            SensorConfig {
                target_size: config.primary_size,
                buffer_count,
            },
        )
        .await
        {
            Ok(primary) => {
                let primary = Arc::new(primary);
                let still = StillCaptureCoordinator::new(Arc::clone(&primary), secondary.clone())
                    .with_timeout(config.capture_timeout)
                    .with_queue_capacity(buffer_count);
                Self {
                    primary,
                    secondary,
                    illuminator,
                    still,
                    pairing: None,
                    analysis: None,
                    closed: false,
                }
            }
            Err(e) => {
                if let Some(session) = secondary {
                    session.close();
                    if let Some(ir) = &illuminator {
                        illuminate(ir, false);
                    }
                }
                return Err(e.into());
            }
        };

        if let Err(e) = coordinator.start(preview).await {
            coordinator.teardown();
            return Err(e.into());
        }

        tracing::info!(
            primary = %coordinator.primary.sensor_id(),
            secondary = ?coordinator.secondary.as_ref().map(|s| s.sensor_id().to_string()),
            "sensors ready"
        );
        Ok(coordinator)
    }

    async fn start(&mut self, preview: Option<Arc<FrameSink>>) -> Result<(), SessionConfigError> {
        self.primary.start_session(preview).await?;
        if let Some(secondary) = &self.secondary {
            secondary.start_session(None).await?;
        }
        self.primary.start_repeating_preview()?;
        if let Some(secondary) = &self.secondary {
            secondary.start_repeating_preview()?;
        }
        Ok(())
    }

    /// Start pairing the analysis streams and feeding `analyzer`.
    ///
    /// Must be called from within a Tokio runtime. `on_outcome` runs on the
    /// analysis thread once per analyzed pair.
    pub fn start_analysis<A, F>(&mut self, analyzer: A, on_outcome: F) -> Result<(), CoordinatorError>
    where
        A: Analyzer,
        F: FnMut(AnalysisOutcome<A::Output>) + Send + 'static,
    {
        if self.closed {
            return Err(CoordinatorError::Closed);
        }
        if self.pairing.is_some() {
            return Err(CoordinatorError::AnalysisRunning);
        }

        let (pairs_tx, pairs_rx) = mpsc::channel(1);
        let analysis = spawn_analysis_thread(analyzer, pairs_rx, on_outcome)
            .map_err(CoordinatorError::Spawn)?;

        let primary = attach_mailbox(self.primary.analysis_sink());
        let secondary = self
            .secondary
            .as_ref()
            .map(|s| attach_mailbox(s.analysis_sink()));
        self.pairing = Some(tokio::spawn(run_pairing(primary, secondary, pairs_tx)));
        self.analysis = Some(analysis);
        tracing::info!(dual = self.secondary.is_some(), "analysis started");
        Ok(())
    }

    /// Run one still capture. Captures are serialized by `&mut self`.
    pub async fn take_photo(&mut self) -> Result<CombinedCaptureResult, CaptureError> {
        if self.closed {
            return Err(CaptureError::SessionClosed);
        }
        self.still.take_photo().await
    }

    pub fn primary(&self) -> &Arc<SensorSession> {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&Arc<SensorSession>> {
        self.secondary.as_ref()
    }

    pub fn is_dual(&self) -> bool {
        self.secondary.is_some()
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            primary: SensorStatus::of(&self.primary),
            secondary: self.secondary.as_deref().map(SensorStatus::of),
            analysis_running: self.pairing.as_ref().is_some_and(|t| !t.is_finished()),
            closed: self.closed,
        }
    }

    /// Close both sensors and wait for the pairing task and analysis
    /// thread to finish. Idempotent.
    pub async fn close(&mut self) {
        self.teardown();
        if let Some(pairing) = self.pairing.take() {
            if let Err(e) = pairing.await {
                tracing::error!(error = %e, "pairing task failed");
            }
        }
        if let Some(analysis) = self.analysis.take() {
            match tokio::task::spawn_blocking(move || analysis.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => tracing::error!("analysis thread panicked"),
                Err(e) => tracing::error!(error = %e, "analysis join failed"),
            }
        }
    }

    /// Close sessions (which closes their sinks and so the pairing
    /// mailboxes) and switch illumination off.
    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.primary.close();
        if let Some(secondary) = &self.secondary {
            secondary.close();
            if let Some(ir) = &self.illuminator {
                illuminate(ir, false);
            }
        }
        tracing::info!("sensors closed");
    }
}

impl Drop for DualSensorCoordinator {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Best effort: illumination failures are logged, never returned.
fn illuminate(ir: &Illuminator, on: bool) {
    let result = if on { ir.switch_on() } else { ir.switch_off() };
    if let Err(e) = result {
        tracing::warn!(profile = %ir.name(), on, error = %e, "illumination control failed");
    }
}
