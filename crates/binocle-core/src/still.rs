//! One-shot still capture across both sensors.
//!
//! Per call: flush the still sinks, arm listeners feeding one bounded
//! matching queue, trigger the captures, wait for the primary's capture
//! metadata, then wait (bounded) for the frames. Listeners are detached on
//! every exit path and late frames are released on arrival.

use binocle_hw::{
    CaptureMetadata, DeviceOpenError, Frame, FrameSink, PixelFormat, SensorSession,
    SessionConfigError,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Hardware buffers per still sink, and the matching queue's capacity.
pub const IMAGE_BUFFER_SIZE: usize = 3;

/// How long a still capture may take, for the metadata and again for the frames.
pub const CAPTURE_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error(transparent)]
    Device(#[from] DeviceOpenError),
    #[error(transparent)]
    SessionConfig(#[from] SessionConfigError),
    #[error("still capture timed out after {0:?}")]
    Timeout(Duration),
    #[error("camera session closed during still capture")]
    SessionClosed,
}

impl CaptureError {
    /// Whether the same request may simply be retried. Anything else calls
    /// for re-initializing the sensors.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Frames from one still capture plus the primary's capture metadata.
///
/// Dropping the result releases both frames. [`close`](Self::close)
/// releases only the primary and hands the secondary back to the caller.
#[derive(Debug)]
pub struct CombinedCaptureResult {
    primary: Frame,
    secondary: Option<Frame>,
    metadata: CaptureMetadata,
    format: PixelFormat,
}

impl CombinedCaptureResult {
    pub fn primary(&self) -> &Frame {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&Frame> {
        self.secondary.as_ref()
    }

    pub fn metadata(&self) -> &CaptureMetadata {
        &self.metadata
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Release the primary frame. The secondary frame, if any, stays alive
    /// and is returned for the caller to release.
    pub fn close(self) -> Option<Frame> {
        let Self {
            primary, secondary, ..
        } = self;
        primary.release();
        secondary
    }

    pub fn into_frames(self) -> (Frame, Option<Frame>, CaptureMetadata) {
        (self.primary, self.secondary, self.metadata)
    }
}

enum StillArrival {
    Primary(Frame),
    Secondary(Frame),
}

/// Still-capture listeners armed on a set of sinks.
///
/// Dropping the guard replaces them with listeners that release every
/// frame on arrival.
struct ArmedListeners {
    sinks: Vec<Arc<FrameSink>>,
}

impl ArmedListeners {
    fn arm(
        primary: &Arc<FrameSink>,
        secondary: Option<&Arc<FrameSink>>,
        queue: mpsc::Sender<StillArrival>,
    ) -> Self {
        let mut sinks = vec![Arc::clone(primary)];
        let tx = queue.clone();
        primary.set_listener(Arc::new(move |frame: Frame| {
            enqueue(&tx, StillArrival::Primary(frame));
        }));
        if let Some(sink) = secondary {
            sink.set_listener(Arc::new(move |frame: Frame| {
                enqueue(&queue, StillArrival::Secondary(frame));
            }));
            sinks.push(Arc::clone(sink));
        }
        Self { sinks }
    }
}

impl Drop for ArmedListeners {
    fn drop(&mut self) {
        for sink in &self.sinks {
            sink.discard_incoming();
        }
    }
}

fn enqueue(queue: &mpsc::Sender<StillArrival>, arrival: StillArrival) {
    if let Err(e) = queue.try_send(arrival) {
        let frame = match e.into_inner() {
            StillArrival::Primary(frame) | StillArrival::Secondary(frame) => frame,
        };
        tracing::debug!(sequence = frame.sequence(), "matching queue unavailable; still frame released");
    }
}

/// Runs the still-capture protocol against one primary and an optional
/// secondary sensor.
///
/// `take_photo` borrows the coordinator mutably, so one capture is armed
/// at a time.
pub struct StillCaptureCoordinator {
    primary: Arc<SensorSession>,
    secondary: Option<Arc<SensorSession>>,
    timeout: Duration,
    queue_capacity: usize,
}

impl StillCaptureCoordinator {
    pub fn new(primary: Arc<SensorSession>, secondary: Option<Arc<SensorSession>>) -> Self {
        Self {
            primary,
            secondary,
            timeout: CAPTURE_TIMEOUT,
            queue_capacity: IMAGE_BUFFER_SIZE,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_dual(&self) -> bool {
        self.secondary.is_some()
    }

    pub async fn take_photo(&mut self) -> Result<CombinedCaptureResult, CaptureError> {
        let primary_sink = self.primary.still_sink();
        let secondary_sink = self.secondary.as_ref().map(|s| s.still_sink());

        let flushed =
            primary_sink.flush() + secondary_sink.map(|sink| sink.flush()).unwrap_or_default();
        if flushed > 0 {
            tracing::debug!(count = flushed, "stale still frames flushed");
        }

        let (queue_tx, mut queue_rx) = mpsc::channel(self.queue_capacity);
        let _armed = ArmedListeners::arm(primary_sink, secondary_sink, queue_tx);

        let (meta_tx, meta_rx) = oneshot::channel();
        self.primary
            .trigger_still_capture(Box::new(move |metadata: CaptureMetadata| {
                let _ = meta_tx.send(metadata);
            }))?;
        // The secondary's metadata is not needed, but its frame is: a sensor
        // that cannot take the request is a configuration failure, not a timeout.
        if let Some(secondary) = &self.secondary {
            if let Err(e) = secondary.trigger_still_capture(Box::new(|_: CaptureMetadata| {})) {
                tracing::warn!(sensor = %secondary.sensor_id(), error = %e, "secondary still capture not triggered");
                return Err(e.into());
            }
        }

        let metadata = match tokio::time::timeout(self.timeout, meta_rx).await {
            Ok(Ok(metadata)) => metadata,
            Ok(Err(_)) => return Err(CaptureError::SessionClosed),
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "no capture metadata");
                return Err(CaptureError::Timeout(self.timeout));
            }
        };
        tracing::debug!(
            sequence = metadata.sequence,
            timestamp_ns = metadata.sensor_timestamp_ns,
            "capture metadata received"
        );

        let deadline = Instant::now() + self.timeout;
        let (primary, secondary) =
            match tokio::time::timeout_at(deadline, await_match(&mut queue_rx, self.is_dual())).await {
                Ok(matched) => matched?,
                Err(_) => {
                    tracing::warn!(timeout = ?self.timeout, "no still frame matched capture metadata");
                    return Err(CaptureError::Timeout(self.timeout));
                }
            };

        if primary.timestamp_ns() != metadata.sensor_timestamp_ns {
            tracing::debug!(
                frame_ns = primary.timestamp_ns(),
                metadata_ns = metadata.sensor_timestamp_ns,
                "matched still frame timestamp differs from capture metadata"
            );
        }
        tracing::info!(
            sequence = primary.sequence(),
            dual = secondary.is_some(),
            "still capture complete"
        );

        Ok(CombinedCaptureResult {
            format: primary.format(),
            primary,
            secondary,
            metadata,
        })
    }
}

/// Wait until the queue holds a primary frame (and a secondary frame in
/// dual mode). Whenever several frames of one sensor are queued, the
/// newest is kept and older ones are released.
async fn await_match(
    queue: &mut mpsc::Receiver<StillArrival>,
    dual: bool,
) -> Result<(Frame, Option<Frame>), CaptureError> {
    let mut primary: Option<Frame> = None;
    let mut secondary: Option<Frame> = None;
    loop {
        let Some(arrival) = queue.recv().await else {
            return Err(CaptureError::SessionClosed);
        };
        absorb(arrival, &mut primary, &mut secondary);
        while let Ok(arrival) = queue.try_recv() {
            absorb(arrival, &mut primary, &mut secondary);
        }
        if let Some(frame) = primary.take() {
            if !dual || secondary.is_some() {
                return Ok((frame, secondary));
            }
            primary = Some(frame);
        }
    }
}

fn absorb(arrival: StillArrival, primary: &mut Option<Frame>, secondary: &mut Option<Frame>) {
    let (slot, frame) = match arrival {
        StillArrival::Primary(frame) => (primary, frame),
        StillArrival::Secondary(frame) => (secondary, frame),
    };
    if let Some(stale) = slot.replace(frame) {
        tracing::debug!(sequence = stale.sequence(), "older still frame drained");
    }
}
