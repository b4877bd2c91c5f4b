//! Simulated camera backend.
//!
//! Stands in for real hardware in tests and in `BINOCLE_SIMULATE` runs.
//! Frames are synthetic gradients laid out the way a chosen driver would
//! (NV21, I420, or NV12). Delivery is either driven by hand through a
//! [`SimControl`] or clocked by a per-session thread.

use crate::frame::{i420_layout, layout_extent, nv12_layout, nv21_layout, Plane};
use crate::sensor::{
    CameraBackend, CameraDevice, CaptureCallback, CaptureMetadata, CaptureRequest, CaptureSession,
    DeviceErrorReason, DeviceOpenError, OutputTarget, SessionConfigError, TargetKind,
};
use crate::sink::FrameSink;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How the simulated driver lays out its planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimLayout {
    Nv21,
    I420,
    Nv12,
}

/// Description of one simulated sensor.
#[derive(Debug, Clone)]
pub struct SimSensorSpec {
    pub id: String,
    pub sizes: Vec<(u32, u32)>,
    pub layout: SimLayout,
    /// Fail `open` with this reason.
    pub open_error: Option<DeviceErrorReason>,
    /// Fail session configuration.
    pub reject_session: bool,
    /// Deliver frames from a clock thread at this rate instead of by hand.
    pub auto_fps: Option<u32>,
}

impl SimSensorSpec {
    pub fn new(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            sizes: vec![(width, height)],
            layout: SimLayout::Nv21,
            open_error: None,
            reject_session: false,
            auto_fps: None,
        }
    }

    pub fn layout(mut self, layout: SimLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn open_error(mut self, reason: DeviceErrorReason) -> Self {
        self.open_error = Some(reason);
        self
    }

    pub fn reject_session(mut self) -> Self {
        self.reject_session = true;
        self
    }

    pub fn auto_fps(mut self, fps: u32) -> Self {
        self.auto_fps = Some(fps);
        self
    }
}

/// Backend holding a fixed set of simulated sensors.
#[derive(Default)]
pub struct SimBackend {
    sensors: Mutex<HashMap<String, Arc<SimSensor>>>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sensor(self, spec: SimSensorSpec) -> Self {
        let sensor = Arc::new(SimSensor {
            spec: spec.clone(),
            state: Mutex::new(SimState::default()),
        });
        self.lock().insert(spec.id, sensor);
        self
    }

    /// Hand-driven control for a sensor.
    pub fn control(&self, sensor_id: &str) -> Option<SimControl> {
        self.lock().get(sensor_id).cloned().map(|sensor| SimControl { sensor })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<SimSensor>>> {
        self.sensors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CameraBackend for SimBackend {
    fn sensor_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn output_sizes(&self, sensor_id: &str) -> Vec<(u32, u32)> {
        self.lock()
            .get(sensor_id)
            .map(|s| s.spec.sizes.clone())
            .unwrap_or_default()
    }

    fn open(&self, sensor_id: &str) -> Result<Box<dyn CameraDevice>, DeviceOpenError> {
        let sensor = self
            .lock()
            .get(sensor_id)
            .cloned()
            .ok_or_else(|| DeviceOpenError::new(sensor_id, DeviceErrorReason::FatalDevice))?;
        if let Some(reason) = sensor.spec.open_error {
            return Err(DeviceOpenError::new(sensor_id, reason));
        }
        {
            let mut state = sensor.lock();
            if state.opened {
                return Err(DeviceOpenError::new(sensor_id, DeviceErrorReason::InUse));
            }
            state.opened = true;
        }
        tracing::debug!(sensor = sensor_id, "simulated camera opened");
        Ok(Box::new(SimDevice { sensor }))
    }
}

struct SimSensor {
    spec: SimSensorSpec,
    state: Mutex<SimState>,
}

#[derive(Default)]
struct SimState {
    opened: bool,
    targets: Vec<OutputTarget>,
    repeating: Option<CaptureRequest>,
    pending: VecDeque<CaptureCallback>,
    sequence: u64,
    clock_ns: u64,
    last_still: Option<(u64, u64)>,
}

/// Nominal frame interval of the simulated sensor clock.
const FRAME_INTERVAL_NS: u64 = 33_333_333;

impl SimSensor {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver one synthetic frame to every sink of `kind` selected by `select`.
    fn emit(&self, select: impl Fn(&SimState, TargetKind) -> bool) -> Vec<(TargetKind, u64, bool)> {
        let (sinks, sequence, timestamp_ns) = {
            let mut state = self.lock();
            let sinks: Vec<(TargetKind, Arc<FrameSink>)> = state
                .targets
                .iter()
                .filter(|t| select(&*state, t.kind))
                .map(|t| (t.kind, Arc::clone(&t.sink)))
                .collect();
            if sinks.is_empty() {
                return Vec::new();
            }
            state.sequence += 1;
            state.clock_ns += FRAME_INTERVAL_NS;
            let stamp = (state.sequence, state.clock_ns);
            if sinks.iter().any(|(kind, _)| *kind == TargetKind::Still) {
                state.last_still = Some(stamp);
            }
            (sinks, stamp.0, stamp.1)
        };

        // Published outside the lock: listeners run on this thread.
        sinks
            .into_iter()
            .map(|(kind, sink)| {
                let (w, h) = sink.size();
                let (bytes, planes) = synth_frame(self.spec.layout, w, h, sequence);
                let delivered = sink.publish(&bytes, &planes, timestamp_ns, sequence);
                (kind, sequence, delivered)
            })
            .collect()
    }
}

/// Hand-driven hardware events for one simulated sensor.
#[derive(Clone)]
pub struct SimControl {
    sensor: Arc<SimSensor>,
}

impl SimControl {
    /// One tick of the repeating request. Returns how many sinks got a frame.
    pub fn emit_preview(&self) -> usize {
        self.sensor
            .emit(|state, kind| {
                state
                    .repeating
                    .as_ref()
                    .is_some_and(|request| request.targets(kind))
            })
            .into_iter()
            .filter(|&(_, _, delivered)| delivered)
            .count()
    }

    /// Deliver one frame into the still-capture sink. Returns its sequence
    /// number if the sink accepted it.
    pub fn emit_still_frame(&self) -> Option<u64> {
        let emitted = self.sensor.emit(|_, kind| kind == TargetKind::Still);
        let (_, sequence, delivered) = emitted.into_iter().next()?;
        delivered.then_some(sequence)
    }

    /// Complete the oldest outstanding capture request with metadata for
    /// the most recent still frame. Returns false if none was outstanding.
    pub fn complete_capture(&self) -> bool {
        let (callback, metadata) = {
            let mut state = self.sensor.lock();
            let Some(callback) = state.pending.pop_front() else {
                return false;
            };
            let (sequence, timestamp_ns) = state
                .last_still
                .unwrap_or((state.sequence, state.clock_ns));
            (
                callback,
                CaptureMetadata {
                    sensor_id: self.sensor.spec.id.clone(),
                    sensor_timestamp_ns: timestamp_ns,
                    sequence,
                },
            )
        };
        callback(metadata);
        true
    }

    /// Capture requests submitted but not yet completed.
    pub fn pending_captures(&self) -> usize {
        self.sensor.lock().pending.len()
    }

    pub fn is_repeating(&self) -> bool {
        self.sensor.lock().repeating.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.sensor.lock().opened
    }
}

struct SimDevice {
    sensor: Arc<SimSensor>,
}

impl CameraDevice for SimDevice {
    fn id(&self) -> &str {
        &self.sensor.spec.id
    }

    fn create_session(
        &mut self,
        targets: Vec<OutputTarget>,
    ) -> Result<Box<dyn CaptureSession>, SessionConfigError> {
        if self.sensor.spec.reject_session {
            return Err(SessionConfigError::Rejected {
                sensor: self.sensor.spec.id.clone(),
                detail: "simulated configuration failure".into(),
            });
        }
        self.sensor.lock().targets = targets;

        let stop = Arc::new(AtomicBool::new(false));
        let clock = match self.sensor.spec.auto_fps {
            Some(fps) => {
                let control = SimControl {
                    sensor: Arc::clone(&self.sensor),
                };
                let stop = Arc::clone(&stop);
                let interval = Duration::from_secs(1) / fps.max(1);
                let handle = std::thread::Builder::new()
                    .name(format!("binocle-sim-{}", self.sensor.spec.id))
                    .spawn(move || {
                        while !stop.load(Ordering::Acquire) {
                            control.emit_preview();
                            if control.pending_captures() > 0 {
                                control.emit_still_frame();
                                control.complete_capture();
                            }
                            std::thread::sleep(interval);
                        }
                    })
                    .map_err(|e| SessionConfigError::Rejected {
                        sensor: self.sensor.spec.id.clone(),
                        detail: format!("failed to spawn clock thread: {e}"),
                    })?;
                Some(handle)
            }
            None => None,
        };

        Ok(Box::new(SimSession {
            sensor: Arc::clone(&self.sensor),
            stop,
            clock,
        }))
    }

    fn close(&mut self) {
        self.sensor.lock().opened = false;
    }
}

struct SimSession {
    sensor: Arc<SimSensor>,
    stop: Arc<AtomicBool>,
    clock: Option<std::thread::JoinHandle<()>>,
}

impl CaptureSession for SimSession {
    fn set_repeating_request(&mut self, request: CaptureRequest) -> Result<(), SessionConfigError> {
        self.sensor.lock().repeating = Some(request);
        Ok(())
    }

    fn stop_repeating(&mut self) {
        self.sensor.lock().repeating = None;
    }

    fn capture(
        &mut self,
        _request: CaptureRequest,
        on_completed: CaptureCallback,
    ) -> Result<(), SessionConfigError> {
        self.sensor.lock().pending.push_back(on_completed);
        Ok(())
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(clock) = self.clock.take() {
            if clock.join().is_err() {
                tracing::error!(sensor = %self.sensor.spec.id, "clock thread panicked");
            }
        }
        let (targets, pending) = {
            let mut state = self.sensor.lock();
            state.repeating = None;
            (
                std::mem::take(&mut state.targets),
                std::mem::take(&mut state.pending),
            )
        };
        drop(targets);
        drop(pending);
    }
}

impl Drop for SimSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Synthetic frame: diagonal luma gradient shifted by `sequence`, flat chroma.
fn synth_frame(layout: SimLayout, width: u32, height: u32, sequence: u64) -> (Vec<u8>, Vec<Plane>) {
    let stride = width as usize;
    let planes = match layout {
        SimLayout::Nv21 => nv21_layout(width, height, stride),
        SimLayout::I420 => i420_layout(width, height, stride),
        SimLayout::Nv12 => nv12_layout(width, height, stride),
    };
    let mut bytes = vec![128u8; layout_extent(&planes)];
    let shift = (sequence % 256) as usize;
    for row in 0..height as usize {
        for col in 0..width as usize {
            bytes[row * stride + col] = ((row + col + shift) % 256) as u8;
        }
    }
    (bytes, planes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{SensorConfig, SensorSession};

    fn config() -> SensorConfig {
        SensorConfig {
            target_size: None,
            buffer_count: 3,
        }
    }

    #[tokio::test]
    async fn test_open_reports_configured_error() {
        let backend: Arc<dyn CameraBackend> = Arc::new(
            SimBackend::new()
                .with_sensor(SimSensorSpec::new("cam0", 8, 8).open_error(DeviceErrorReason::DisabledByPolicy)),
        );
        let err = SensorSession::open(backend, "cam0", config()).await.err().unwrap();
        assert_eq!(err.reason, DeviceErrorReason::DisabledByPolicy);
    }

    #[tokio::test]
    async fn test_open_unknown_and_busy_sensor() {
        let sim = Arc::new(SimBackend::new().with_sensor(SimSensorSpec::new("cam0", 8, 8)));
        let backend: Arc<dyn CameraBackend> = sim.clone();

        let err = SensorSession::open(backend.clone(), "nope", config()).await.err().unwrap();
        assert_eq!(err.reason, DeviceErrorReason::FatalDevice);

        let first = SensorSession::open(backend.clone(), "cam0", config()).await.unwrap();
        let err = SensorSession::open(backend.clone(), "cam0", config()).await.err().unwrap();
        assert_eq!(err.reason, DeviceErrorReason::InUse);

        first.close();
        assert!(!sim.control("cam0").unwrap().is_open());
        assert!(SensorSession::open(backend, "cam0", config()).await.is_ok());
    }

    #[tokio::test]
    async fn test_session_rejected() {
        let backend: Arc<dyn CameraBackend> =
            Arc::new(SimBackend::new().with_sensor(SimSensorSpec::new("cam0", 8, 8).reject_session()));
        let session = SensorSession::open(backend, "cam0", config()).await.unwrap();
        let err = session.start_session(None).await.unwrap_err();
        assert!(matches!(err, SessionConfigError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_repeating_preview_feeds_analysis_sink() {
        let sim = Arc::new(SimBackend::new().with_sensor(SimSensorSpec::new("cam0", 8, 4)));
        let control = sim.control("cam0").unwrap();
        let session = SensorSession::open(sim.clone(), "cam0", config()).await.unwrap();

        assert!(session.start_repeating_preview().is_err());
        session.start_session(None).await.unwrap();
        assert_eq!(control.emit_preview(), 0);

        session.start_repeating_preview().unwrap();
        assert_eq!(control.emit_preview(), 1);
        assert_eq!(session.analysis_sink().queued(), 1);
        assert_eq!(session.still_sink().queued(), 0);
        assert_eq!(session.output_size(), (8, 4));
    }

    #[tokio::test]
    async fn test_still_capture_delivers_frame_and_metadata() {
        let sim = Arc::new(SimBackend::new().with_sensor(SimSensorSpec::new("cam0", 8, 4)));
        let control = sim.control("cam0").unwrap();
        let session = SensorSession::open(sim.clone(), "cam0", config()).await.unwrap();
        session.start_session(None).await.unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        session
            .trigger_still_capture(Box::new(move |meta: CaptureMetadata| {
                let _ = tx.send(meta);
            }))
            .unwrap();
        assert_eq!(control.pending_captures(), 1);

        let sequence = control.emit_still_frame().unwrap();
        assert!(control.complete_capture());
        let meta = rx.recv().unwrap();
        assert_eq!(meta.sequence, sequence);
        assert_eq!(meta.sensor_id, "cam0");

        let frame = session.still_sink().acquire_next().unwrap();
        assert_eq!(frame.timestamp_ns(), meta.sensor_timestamp_ns);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_frames() {
        let sim = Arc::new(SimBackend::new().with_sensor(SimSensorSpec::new("cam0", 8, 4)));
        let control = sim.control("cam0").unwrap();
        let session = SensorSession::open(sim.clone(), "cam0", config()).await.unwrap();
        session.start_session(None).await.unwrap();
        session.start_repeating_preview().unwrap();
        control.emit_preview();
        session.trigger_still_capture(Box::new(|_: CaptureMetadata| {})).unwrap();

        session.close();
        session.close();
        assert!(session.is_closed());
        assert_eq!(session.analysis_sink().pool().outstanding(), 0);
        assert_eq!(control.pending_captures(), 0);
        assert!(!control.is_repeating());
        assert!(session.trigger_still_capture(Box::new(|_: CaptureMetadata| {})).is_err());
    }

    #[tokio::test]
    async fn test_still_metadata_matches_frame_under_concurrent_preview() {
        let sim = Arc::new(SimBackend::new().with_sensor(SimSensorSpec::new("cam0", 8, 4).auto_fps(500)));
        let control = sim.control("cam0").unwrap();
        let session = SensorSession::open(sim.clone(), "cam0", config()).await.unwrap();
        session.start_session(None).await.unwrap();
        session.start_repeating_preview().unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let preview = {
            let stop = Arc::clone(&stop);
            let control = control.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    control.emit_preview();
                }
            })
        };

        for _ in 0..20 {
            let (tx, rx) = std::sync::mpsc::channel();
            session
                .trigger_still_capture(Box::new(move |meta: CaptureMetadata| {
                    let _ = tx.send(meta);
                }))
                .unwrap();
            let meta = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)).unwrap())
                .await
                .unwrap();
            let frame = session.still_sink().acquire_next().unwrap();
            assert_eq!(frame.sequence(), meta.sequence);
            assert_eq!(frame.timestamp_ns(), meta.sensor_timestamp_ns);
        }

        stop.store(true, Ordering::Release);
        preview.join().unwrap();
        session.close();
    }

    #[tokio::test]
    async fn test_auto_clock_streams_frames() {
        let sim = Arc::new(SimBackend::new().with_sensor(SimSensorSpec::new("cam0", 8, 4).auto_fps(200)));
        let session = SensorSession::open(sim.clone(), "cam0", config()).await.unwrap();
        session.start_session(None).await.unwrap();
        session.start_repeating_preview().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(session.analysis_sink().pool().acquired() > 0);
        session.close();
    }
}
