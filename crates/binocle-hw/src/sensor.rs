//! Hardware boundary and per-sensor session lifecycle.
//!
//! A [`CameraBackend`] opens [`CameraDevice`]s; a device configures one
//! [`CaptureSession`] against a set of output sinks. [`SensorSession`] owns
//! one device, its session, and the analysis and still-capture sinks.

use crate::sink::FrameSink;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Fallback output size when a sensor does not report any.
pub const DEFAULT_OUTPUT_SIZE: (u32, u32) = (640, 480);

/// Why a sensor could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorReason {
    FatalDevice,
    DisabledByPolicy,
    InUse,
    FatalService,
    MaxCamerasInUse,
    Unknown,
}

impl DeviceErrorReason {
    /// Classify an OS error code from the camera subsystem.
    pub fn from_os_error(code: i32) -> Self {
        match code {
            libc::EBUSY => Self::InUse,
            libc::EACCES | libc::EPERM => Self::DisabledByPolicy,
            libc::ENOENT | libc::ENODEV | libc::ENXIO => Self::FatalDevice,
            libc::EMFILE | libc::ENFILE => Self::MaxCamerasInUse,
            libc::EIO => Self::FatalService,
            _ => Self::Unknown,
        }
    }

    pub fn from_io(err: &std::io::Error) -> Self {
        err.raw_os_error()
            .map(Self::from_os_error)
            .unwrap_or(Self::Unknown)
    }
}

impl std::fmt::Display for DeviceErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::FatalDevice => "fatal (device)",
            Self::DisabledByPolicy => "device policy",
            Self::InUse => "camera in use",
            Self::FatalService => "fatal (service)",
            Self::MaxCamerasInUse => "maximum cameras in use",
            Self::Unknown => "unknown",
        };
        f.write_str(msg)
    }
}

#[derive(Error, Debug)]
#[error("camera {sensor} error: {reason}")]
pub struct DeviceOpenError {
    pub sensor: String,
    pub reason: DeviceErrorReason,
}

impl DeviceOpenError {
    pub fn new(sensor: impl Into<String>, reason: DeviceErrorReason) -> Self {
        Self {
            sensor: sensor.into(),
            reason,
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionConfigError {
    #[error("camera {sensor} session configuration failed: {detail}")]
    Rejected { sensor: String, detail: String },
    #[error("camera {0} has no configured session")]
    NoSession(String),
    #[error("camera {0} is closed")]
    Closed(String),
}

/// Role of an output destination within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Analysis,
    Still,
    Preview,
}

#[derive(Debug, Clone)]
pub struct OutputTarget {
    pub kind: TargetKind,
    pub sink: Arc<FrameSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTemplate {
    Preview,
    StillCapture,
}

/// A repeating or one-shot capture request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub template: RequestTemplate,
    pub targets: Vec<TargetKind>,
    pub auto_focus: bool,
}

impl CaptureRequest {
    pub fn preview(targets: Vec<TargetKind>) -> Self {
        Self {
            template: RequestTemplate::Preview,
            targets,
            auto_focus: true,
        }
    }

    pub fn still() -> Self {
        Self {
            template: RequestTemplate::StillCapture,
            targets: vec![TargetKind::Still],
            auto_focus: false,
        }
    }

    pub fn targets(&self, kind: TargetKind) -> bool {
        self.targets.contains(&kind)
    }
}

/// Hardware-reported result of one triggered capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureMetadata {
    pub sensor_id: String,
    pub sensor_timestamp_ns: u64,
    pub sequence: u64,
}

/// Invoked exactly once when a triggered capture completes. Dropped
/// uncalled if the session is torn down first.
pub type CaptureCallback = Box<dyn FnOnce(CaptureMetadata) + Send>;

/// Camera subsystem: enumerates and opens sensors.
pub trait CameraBackend: Send + Sync {
    fn sensor_ids(&self) -> Vec<String>;

    /// Output sizes the sensor can deliver in planar 4:2:0.
    fn output_sizes(&self, sensor_id: &str) -> Vec<(u32, u32)>;

    fn open(&self, sensor_id: &str) -> Result<Box<dyn CameraDevice>, DeviceOpenError>;
}

/// An opened sensor.
pub trait CameraDevice: Send {
    fn id(&self) -> &str;

    /// Configure a capture session delivering into `targets`.
    fn create_session(
        &mut self,
        targets: Vec<OutputTarget>,
    ) -> Result<Box<dyn CaptureSession>, SessionConfigError>;

    fn close(&mut self);
}

/// A configured capture session. Frames arrive on the backend's own thread.
pub trait CaptureSession: Send {
    /// Deliver frames continuously until stopped or closed.
    fn set_repeating_request(&mut self, request: CaptureRequest) -> Result<(), SessionConfigError>;

    fn stop_repeating(&mut self);

    /// Submit one capture. `on_completed` receives its metadata; each
    /// targeted sink receives exactly one frame, in no particular order
    /// relative to the metadata.
    fn capture(
        &mut self,
        request: CaptureRequest,
        on_completed: CaptureCallback,
    ) -> Result<(), SessionConfigError>;

    fn close(&mut self);
}

/// Largest size whose area does not exceed `target`'s, or the largest overall.
pub fn select_output_size(sizes: &[(u32, u32)], target: Option<(u32, u32)>) -> Option<(u32, u32)> {
    sizes
        .iter()
        .copied()
        .filter(|&(w, h)| match target {
            Some((tw, th)) => (w as u64 * h as u64) <= (tw as u64 * th as u64),
            None => true,
        })
        .max_by_key(|&(w, h)| w as u64 * h as u64)
}

/// Sink sizing for one sensor.
#[derive(Debug, Clone, Copy)]
pub struct SensorConfig {
    /// Upper bound on the output size; `None` picks the largest available.
    pub target_size: Option<(u32, u32)>,
    /// Frames each sink may hold at once.
    pub buffer_count: usize,
}

/// One physical camera with its capture session and output sinks.
pub struct SensorSession {
    sensor_id: String,
    analysis: Arc<FrameSink>,
    still: Arc<FrameSink>,
    inner: Mutex<SessionInner>,
}

#[derive(Default)]
struct SessionInner {
    device: Option<Box<dyn CameraDevice>>,
    session: Option<Box<dyn CaptureSession>>,
    preview: Option<Arc<FrameSink>>,
    closed: bool,
}

impl SensorSession {
    /// Open a sensor and allocate its sinks. Not retried on failure.
    pub async fn open(
        backend: Arc<dyn CameraBackend>,
        sensor_id: &str,
        config: SensorConfig,
    ) -> Result<Self, DeviceOpenError> {
        let id = sensor_id.to_string();
        let (device, sizes) = tokio::task::spawn_blocking(move || {
            let sizes = backend.output_sizes(&id);
            backend.open(&id).map(|device| (device, sizes))
        })
        .await
        .map_err(|e| {
            tracing::error!(sensor = sensor_id, error = %e, "open task failed");
            DeviceOpenError::new(sensor_id, DeviceErrorReason::FatalService)
        })??;

        let (width, height) = select_output_size(&sizes, config.target_size)
            .or(config.target_size)
            .unwrap_or(DEFAULT_OUTPUT_SIZE);

        tracing::info!(sensor = sensor_id, width, height, "camera opened");

        Ok(Self {
            sensor_id: sensor_id.to_string(),
            analysis: Arc::new(FrameSink::new(
                format!("{sensor_id}/analysis"),
                width,
                height,
                config.buffer_count,
            )),
            still: Arc::new(FrameSink::new(
                format!("{sensor_id}/still"),
                width,
                height,
                config.buffer_count,
            )),
            inner: Mutex::new(SessionInner {
                device: Some(device),
                ..SessionInner::default()
            }),
        })
    }

    /// Configure the capture session over the analysis and still sinks,
    /// plus an optional live-preview sink.
    pub async fn start_session(&self, preview: Option<Arc<FrameSink>>) -> Result<(), SessionConfigError> {
        let mut device = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(SessionConfigError::Closed(self.sensor_id.clone()));
            }
            inner
                .device
                .take()
                .ok_or_else(|| SessionConfigError::NoSession(self.sensor_id.clone()))?
        };

        let mut targets = vec![
            OutputTarget {
                kind: TargetKind::Analysis,
                sink: Arc::clone(&self.analysis),
            },
            OutputTarget {
                kind: TargetKind::Still,
                sink: Arc::clone(&self.still),
            },
        ];
        if let Some(sink) = &preview {
            targets.push(OutputTarget {
                kind: TargetKind::Preview,
                sink: Arc::clone(sink),
            });
        }

        let sensor = self.sensor_id.clone();
        let (mut device, result) = tokio::task::spawn_blocking(move || {
            let result = device.create_session(targets);
            (device, result)
        })
        .await
        .map_err(|e| SessionConfigError::Rejected {
            sensor: sensor.clone(),
            detail: e.to_string(),
        })?;

        let mut inner = self.lock();
        if inner.closed {
            drop(inner);
            if let Ok(mut session) = result {
                session.close();
            }
            device.close();
            return Err(SessionConfigError::Closed(self.sensor_id.clone()));
        }
        inner.device = Some(device);
        let session = result?;
        if let Some(mut old) = inner.session.replace(session) {
            old.close();
        }
        inner.preview = preview;
        tracing::info!(sensor = %self.sensor_id, "capture session configured");
        Ok(())
    }

    /// Start continuous delivery to the analysis sink (and preview, if configured).
    pub fn start_repeating_preview(&self) -> Result<(), SessionConfigError> {
        let mut inner = self.lock();
        let mut targets = vec![TargetKind::Analysis];
        if inner.preview.is_some() {
            targets.push(TargetKind::Preview);
        }
        let session = self.session_mut(&mut inner)?;
        session.set_repeating_request(CaptureRequest::preview(targets))?;
        tracing::debug!(sensor = %self.sensor_id, "repeating preview started");
        Ok(())
    }

    pub fn stop_repeating_preview(&self) -> Result<(), SessionConfigError> {
        let mut inner = self.lock();
        self.session_mut(&mut inner)?.stop_repeating();
        Ok(())
    }

    /// Issue exactly one still capture into the still sink.
    pub fn trigger_still_capture(&self, on_completed: CaptureCallback) -> Result<(), SessionConfigError> {
        let mut inner = self.lock();
        let session = self.session_mut(&mut inner)?;
        session.capture(CaptureRequest::still(), on_completed)?;
        tracing::debug!(sensor = %self.sensor_id, "still capture triggered");
        Ok(())
    }

    /// Tear down the session and release the device. Idempotent.
    ///
    /// Closing the sinks detaches their listeners and releases queued
    /// frames, which wakes anything waiting on this sensor's data.
    pub fn close(&self) {
        let (session, device, preview) = {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            (inner.session.take(), inner.device.take(), inner.preview.take())
        };
        if let Some(mut session) = session {
            session.stop_repeating();
            session.close();
        }
        if let Some(mut device) = device {
            device.close();
        }
        self.analysis.close();
        self.still.close();
        if let Some(sink) = preview {
            sink.close();
        }
        tracing::info!(sensor = %self.sensor_id, "camera closed");
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn analysis_sink(&self) -> &Arc<FrameSink> {
        &self.analysis
    }

    pub fn still_sink(&self) -> &Arc<FrameSink> {
        &self.still
    }

    pub fn output_size(&self) -> (u32, u32) {
        self.analysis.size()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn session_mut<'a>(
        &self,
        inner: &'a mut SessionInner,
    ) -> Result<&'a mut Box<dyn CaptureSession>, SessionConfigError> {
        if inner.closed {
            return Err(SessionConfigError::Closed(self.sensor_id.clone()));
        }
        inner
            .session
            .as_mut()
            .ok_or_else(|| SessionConfigError::NoSession(self.sensor_id.clone()))
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SensorSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_output_size_with_target() {
        let sizes = [(1920, 1080), (1280, 720), (640, 480), (320, 240)];
        assert_eq!(select_output_size(&sizes, Some((1280, 720))), Some((1280, 720)));
        assert_eq!(select_output_size(&sizes, Some((1000, 1000))), Some((1280, 720)));
        assert_eq!(select_output_size(&sizes, Some((100, 100))), None);
    }

    #[test]
    fn test_select_output_size_without_target() {
        let sizes = [(640, 480), (1920, 1080), (1280, 720)];
        assert_eq!(select_output_size(&sizes, None), Some((1920, 1080)));
        assert_eq!(select_output_size(&[], None), None);
    }

    #[test]
    fn test_error_reason_mapping() {
        assert_eq!(DeviceErrorReason::from_os_error(libc::EBUSY), DeviceErrorReason::InUse);
        assert_eq!(
            DeviceErrorReason::from_os_error(libc::EACCES),
            DeviceErrorReason::DisabledByPolicy
        );
        assert_eq!(
            DeviceErrorReason::from_os_error(libc::ENODEV),
            DeviceErrorReason::FatalDevice
        );
        assert_eq!(
            DeviceErrorReason::from_os_error(libc::EMFILE),
            DeviceErrorReason::MaxCamerasInUse
        );
        assert_eq!(DeviceErrorReason::from_os_error(libc::EIO), DeviceErrorReason::FatalService);
        assert_eq!(DeviceErrorReason::from_os_error(9999), DeviceErrorReason::Unknown);
    }

    #[test]
    fn test_device_open_error_message() {
        let err = DeviceOpenError::new("/dev/video0", DeviceErrorReason::InUse);
        assert_eq!(err.to_string(), "camera /dev/video0 error: camera in use");
    }
}
