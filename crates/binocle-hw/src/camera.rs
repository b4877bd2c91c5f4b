//! V4L2 camera backend via the `v4l` crate.
//!
//! Each configured session streams on its own thread. The repeating request
//! feeds the analysis (and preview) sinks; a triggered still capture takes
//! the next streamed buffer into the still sink and completes with that
//! buffer's driver timestamp.

use crate::frame::{i420_layout, nv12_layout, nv21_layout, Plane};
use crate::sensor::{
    CameraBackend, CameraDevice, CaptureCallback, CaptureMetadata, CaptureRequest, CaptureSession,
    DeviceErrorReason, DeviceOpenError, OutputTarget, SessionConfigError, TargetKind,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use v4l::buffer::Type as BufType;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Planar 4:2:0 fourccs we can describe, in order of preference.
const PLANAR_420: [&[u8; 4]; 3] = [b"NV21", b"YU12", b"NV12"];

/// Driver buffers in the mmap ring.
const STREAM_BUFFERS: u32 = 4;

/// Poll timeout so the stream thread notices shutdown.
const STREAM_POLL: Duration = Duration::from_millis(50);

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Camera subsystem backed by `/dev/videoN` nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4lBackend;

impl V4lBackend {
    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl CameraBackend for V4lBackend {
    fn sensor_ids(&self) -> Vec<String> {
        Self::list_devices().into_iter().map(|d| d.path).collect()
    }

    fn output_sizes(&self, sensor_id: &str) -> Vec<(u32, u32)> {
        let Ok(dev) = Device::with_path(sensor_id) else {
            return Vec::new();
        };
        let mut sizes = Vec::new();
        for code in PLANAR_420 {
            let Ok(framesizes) = dev.enum_framesizes(FourCC::new(code)) else {
                continue;
            };
            for size in framesizes {
                if let FrameSizeEnum::Discrete(fs) = size.size {
                    if !sizes.contains(&(fs.width, fs.height)) {
                        sizes.push((fs.width, fs.height));
                    }
                }
            }
        }
        sizes
    }

    fn open(&self, sensor_id: &str) -> Result<Box<dyn CameraDevice>, DeviceOpenError> {
        if !Path::new(sensor_id).exists() {
            return Err(DeviceOpenError::new(sensor_id, DeviceErrorReason::FatalDevice));
        }

        let device = Device::with_path(sensor_id).map_err(|e| {
            tracing::warn!(device = sensor_id, error = %e, "failed to open device");
            DeviceOpenError::new(sensor_id, DeviceErrorReason::from_io(&e))
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| DeviceOpenError::new(sensor_id, DeviceErrorReason::from_io(&e)))?;

        tracing::info!(
            device = sensor_id,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(DeviceOpenError::new(sensor_id, DeviceErrorReason::FatalDevice));
        }

        Ok(Box::new(V4lDevice {
            path: sensor_id.to_string(),
            device: Some(device),
        }))
    }
}

struct V4lDevice {
    path: String,
    device: Option<Device>,
}

impl V4lDevice {
    fn rejected(&self, detail: impl Into<String>) -> SessionConfigError {
        SessionConfigError::Rejected {
            sensor: self.path.clone(),
            detail: detail.into(),
        }
    }
}

impl CameraDevice for V4lDevice {
    fn id(&self) -> &str {
        &self.path
    }

    fn create_session(
        &mut self,
        targets: Vec<OutputTarget>,
    ) -> Result<Box<dyn CaptureSession>, SessionConfigError> {
        let (width, height) = targets
            .first()
            .map(|t| t.sink.size())
            .ok_or_else(|| self.rejected("no output targets"))?;
        if targets.iter().any(|t| t.sink.size() != (width, height)) {
            return Err(self.rejected("outputs must share one size"));
        }

        let device = self
            .device
            .take()
            .ok_or_else(|| self.rejected("device already streaming"))?;

        let mut fmt = match device.format() {
            Ok(fmt) => fmt,
            Err(e) => {
                self.device = Some(device);
                return Err(self.rejected(format!("failed to get format: {e}")));
            }
        };

        // Try each planar fourcc until the driver keeps one we can describe.
        let mut negotiated = None;
        for code in PLANAR_420 {
            fmt.fourcc = FourCC::new(code);
            fmt.width = width;
            fmt.height = height;
            match device.set_format(&fmt) {
                Ok(got) if got.fourcc == fmt.fourcc && got.width == width && got.height == height => {
                    negotiated = Some(got);
                    break;
                }
                Ok(got) => {
                    tracing::debug!(fourcc = ?got.fourcc, width = got.width, height = got.height, "driver substituted format");
                }
                Err(e) => {
                    tracing::debug!(fourcc = ?fmt.fourcc, error = %e, "set_format failed");
                }
            }
        }
        let Some(negotiated) = negotiated else {
            self.device = Some(device);
            return Err(self.rejected(format!(
                "no planar 4:2:0 format at {width}x{height} (need NV21, YU12, or NV12)"
            )));
        };

        let stride = if negotiated.stride > 0 {
            negotiated.stride as usize
        } else {
            width as usize
        };
        let planes = match &negotiated.fourcc.repr {
            b"NV21" => nv21_layout(width, height, stride),
            b"NV12" => nv12_layout(width, height, stride),
            _ => i420_layout(width, height, stride),
        };

        tracing::info!(
            device = %self.path,
            width,
            height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        let mut stream = match MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS) {
            Ok(stream) => stream,
            Err(e) => {
                self.device = Some(device);
                return Err(self.rejected(format!("failed to create mmap stream: {e}")));
            }
        };
        stream.set_timeout(STREAM_POLL);

        let shared = Arc::new(StreamShared::default());
        let worker_shared = Arc::clone(&shared);
        let sensor = self.path.clone();
        let worker = std::thread::Builder::new()
            .name(format!("binocle-v4l-{}", sensor.trim_start_matches("/dev/")))
            .spawn(move || {
                let _device = device;
                stream_loop(&sensor, &mut stream, &targets, &planes, &worker_shared);
            })
            .map_err(|e| self.rejected(format!("failed to spawn stream thread: {e}")))?;

        Ok(Box::new(V4lSession {
            shared,
            worker: Some(worker),
        }))
    }

    fn close(&mut self) {
        self.device = None;
    }
}

/// State shared between a session handle and its stream thread.
#[derive(Default)]
struct StreamShared {
    stop: AtomicBool,
    repeating: Mutex<Option<CaptureRequest>>,
    pending: Mutex<VecDeque<CaptureCallback>>,
}

fn stream_loop(
    sensor: &str,
    stream: &mut MmapStream,
    targets: &[OutputTarget],
    planes: &[Plane],
    shared: &StreamShared,
) {
    tracing::debug!(device = sensor, "stream thread started");
    while !shared.stop.load(Ordering::Acquire) {
        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                tracing::warn!(device = sensor, error = %e, "failed to dequeue buffer");
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
        };
        let used = (meta.bytesused as usize).min(buf.len());
        let bytes = &buf[..used];
        let timestamp_ns = Duration::from(meta.timestamp).as_nanos() as u64;
        let sequence = meta.sequence as u64;

        let repeating = shared
            .repeating
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(request) = repeating {
            for target in targets.iter().filter(|t| request.targets(t.kind)) {
                target.sink.publish(bytes, planes, timestamp_ns, sequence);
            }
        }

        let pending = shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(on_completed) = pending {
            for target in targets.iter().filter(|t| t.kind == TargetKind::Still) {
                target.sink.publish(bytes, planes, timestamp_ns, sequence);
            }
            on_completed(CaptureMetadata {
                sensor_id: sensor.to_string(),
                sensor_timestamp_ns: timestamp_ns,
                sequence,
            });
        }
    }
    tracing::debug!(device = sensor, "stream thread exiting");
}

struct V4lSession {
    shared: Arc<StreamShared>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureSession for V4lSession {
    fn set_repeating_request(&mut self, request: CaptureRequest) -> Result<(), SessionConfigError> {
        *self
            .shared
            .repeating
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(request);
        Ok(())
    }

    fn stop_repeating(&mut self) {
        self.shared
            .repeating
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn capture(
        &mut self,
        _request: CaptureRequest,
        on_completed: CaptureCallback,
    ) -> Result<(), SessionConfigError> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(on_completed);
        Ok(())
    }

    fn close(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("stream thread panicked");
            }
        }
        // Captures that never completed are dropped, which their waiters observe.
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for V4lSession {
    fn drop(&mut self) {
        self.close();
    }
}
