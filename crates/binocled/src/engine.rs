use binocle_core::snapshot::SnapshotError;
use binocle_core::{
    save_corrected_luma, AnalysisOutcome, CaptureError, CoordinatorError, CoordinatorStatus,
    DualSensorCoordinator, FrameStats, FrameStatsAnalyzer,
};
use binocle_hw::{CameraBackend, CaptureMetadata, Illuminator};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("snapshot task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("engine task exited")]
    ChannelClosed,
}

/// Files written for one still capture.
#[derive(Debug, Serialize)]
pub struct PhotoReport {
    pub primary_path: PathBuf,
    pub secondary_path: Option<PathBuf>,
    pub metadata: CaptureMetadata,
}

/// Running tally of the continuous analysis stream.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AnalysisSummary {
    pub pairs: u64,
    pub failures: u64,
    pub latest: Vec<FrameStats>,
}

#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub sensors: CoordinatorStatus,
    pub analysis: AnalysisSummary,
}

/// Messages sent from D-Bus handlers to the engine task.
enum EngineRequest {
    TakePhoto {
        reply: oneshot::Sender<Result<PhotoReport, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Capture one still from each sensor and save both in display orientation.
    pub async fn take_photo(&self) -> Result<PhotoReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::TakePhoto { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Close the sensors and wait for the engine task to finish.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Shutdown { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Open the sensors, start continuous analysis, and spawn the engine task.
///
/// Fails fast if either sensor cannot be opened or configured. Requests
/// are handled one at a time, which keeps still captures exclusive.
pub async fn spawn_engine(
    backend: Arc<dyn CameraBackend>,
    config: &Config,
    illuminator: Option<Illuminator>,
) -> Result<EngineHandle, EngineError> {
    let mut coordinator =
        DualSensorCoordinator::open(backend, &config.coordinator_config(), illuminator, None).await?;

    let summary = Arc::new(Mutex::new(AnalysisSummary::default()));
    let tally = Arc::clone(&summary);
    coordinator.start_analysis(FrameStatsAnalyzer::default(), move |outcome| {
        record_outcome(&tally, outcome);
    })?;

    let output_dir = config.output_dir.clone();
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    tokio::spawn(async move {
        tracing::info!("engine task started");
        while let Some(req) = rx.recv().await {
            match req {
                EngineRequest::TakePhoto { reply } => {
                    let result = run_take_photo(&mut coordinator, output_dir.clone()).await;
                    if let Err(e) = &result {
                        tracing::warn!(error = %e, "take photo failed");
                    }
                    let _ = reply.send(result);
                }
                EngineRequest::Status { reply } => {
                    let analysis = summary
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    let _ = reply.send(EngineStatus {
                        sensors: coordinator.status(),
                        analysis,
                    });
                }
                EngineRequest::Shutdown { reply } => {
                    coordinator.close().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
        coordinator.close().await;
        tracing::info!("engine task exiting");
    });

    Ok(EngineHandle { tx })
}

fn record_outcome(summary: &Mutex<AnalysisSummary>, outcome: AnalysisOutcome<FrameStats>) {
    let mut summary = summary.lock().unwrap_or_else(PoisonError::into_inner);
    summary.pairs += 1;
    match outcome.result {
        Ok(stats) => summary.latest = stats,
        Err(_) => summary.failures += 1,
    }
}

/// Take one still and write both frames as PNG.
async fn run_take_photo(
    coordinator: &mut DualSensorCoordinator,
    output_dir: PathBuf,
) -> Result<PhotoReport, EngineError> {
    let result = coordinator.take_photo().await?;
    let (primary, secondary, metadata) = result.into_frames();

    tokio::task::spawn_blocking(move || {
        let primary_path = save_corrected_luma(&primary, &output_dir, "primary")?;
        drop(primary);
        let secondary_path = secondary
            .map(|frame| save_corrected_luma(&frame, &output_dir, "secondary"))
            .transpose()?;
        Ok::<_, EngineError>(PhotoReport {
            primary_path,
            secondary_path,
            metadata,
        })
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use binocle_hw::{SimBackend, SimSensorSpec};

    fn sim_config(dir: PathBuf) -> Config {
        Config {
            primary_device: "rgb".into(),
            secondary_device: Some("ir".into()),
            primary_size: None,
            secondary_size: None,
            buffer_count: 3,
            capture_timeout_ms: 2000,
            illumination_profile: "proc-led-light".into(),
            illumination_enabled: false,
            output_dir: dir,
            simulate: true,
            session_bus: true,
        }
    }

    #[tokio::test]
    async fn test_engine_take_photo_and_status() {
        let dir = std::env::temp_dir().join(format!("binocled-engine-{}", std::process::id()));
        let backend: Arc<dyn CameraBackend> = Arc::new(
            SimBackend::new()
                .with_sensor(SimSensorSpec::new("rgb", 8, 4).auto_fps(100))
                .with_sensor(SimSensorSpec::new("ir", 4, 8).auto_fps(100)),
        );
        let engine = spawn_engine(backend, &sim_config(dir.clone()), None)
            .await
            .unwrap();

        let report = engine.take_photo().await.unwrap();
        assert!(report.primary_path.exists());
        assert!(report.secondary_path.as_ref().is_some_and(|p| p.exists()));
        assert_eq!(report.metadata.sensor_id, "rgb");

        let status = engine.status().await.unwrap();
        assert_eq!(status.sensors.primary.sensor_id, "rgb");
        assert!(!status.sensors.closed);

        engine.shutdown().await.unwrap();
        assert!(matches!(engine.status().await, Err(EngineError::ChannelClosed)));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_record_outcome_counts_failures() {
        let summary = Mutex::new(AnalysisSummary::default());
        record_outcome(
            &summary,
            AnalysisOutcome {
                primary_sequence: 1,
                secondary_sequence: None,
                result: Err(binocle_core::AnalysisError::Failed("boom".into())),
            },
        );
        let summary = summary.into_inner().unwrap();
        assert_eq!(summary.pairs, 1);
        assert_eq!(summary.failures, 1);
        assert!(summary.latest.is_empty());
    }
}
