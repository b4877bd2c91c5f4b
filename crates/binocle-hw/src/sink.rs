//! Frame sinks: per-output-destination readers fed by the hardware.

use crate::frame::{BufferPool, Frame, Plane};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Callback run on the delivering hardware thread for every new frame.
pub type FrameListener = Arc<dyn Fn(Frame) + Send + Sync>;

/// Receives frames for one output destination of a capture session.
///
/// Frames go to the attached listener if there is one, otherwise they
/// queue in the sink until acquired or flushed. The sink's [`BufferPool`]
/// bounds how many of its frames can be alive at once.
pub struct FrameSink {
    name: String,
    width: u32,
    height: u32,
    pool: BufferPool,
    state: Mutex<SinkState>,
}

#[derive(Default)]
struct SinkState {
    queued: VecDeque<Frame>,
    listener: Option<FrameListener>,
    closed: bool,
}

impl FrameSink {
    pub fn new(name: impl Into<String>, width: u32, height: u32, max_frames: usize) -> Self {
        let name = name.into();
        Self {
            pool: BufferPool::new(name.clone(), max_frames),
            name,
            width,
            height,
            state: Mutex::new(SinkState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Copy captured bytes into a new frame and deliver it.
    ///
    /// Returns false if the frame was dropped (sink closed, pool exhausted,
    /// or a layout that does not fit `bytes`).
    pub fn publish(&self, bytes: &[u8], planes: &[Plane], timestamp_ns: u64, sequence: u64) -> bool {
        if self.is_closed() {
            return false;
        }
        let Some(lease) = self.pool.try_acquire() else {
            tracing::debug!(sink = %self.name, sequence, "no free buffer; frame dropped");
            return false;
        };
        match Frame::new(
            lease,
            self.width,
            self.height,
            timestamp_ns,
            sequence,
            bytes.to_vec(),
            planes.to_vec(),
        ) {
            Ok(frame) => {
                self.deliver(frame);
                true
            }
            Err(e) => {
                tracing::warn!(sink = %self.name, sequence, error = %e, "malformed frame dropped");
                false
            }
        }
    }

    /// Hand a frame to the listener, or queue it if none is attached.
    pub fn deliver(&self, frame: Frame) {
        let listener = {
            let mut state = self.lock();
            if state.closed {
                drop(state);
                tracing::trace!(sink = %self.name, "frame delivered to closed sink");
                return;
            }
            match state.listener.clone() {
                Some(listener) => listener,
                None => {
                    state.queued.push_back(frame);
                    return;
                }
            }
        };
        listener(frame);
    }

    /// Take the oldest queued frame.
    pub fn acquire_next(&self) -> Option<Frame> {
        self.lock().queued.pop_front()
    }

    /// Number of frames waiting in the sink.
    pub fn queued(&self) -> usize {
        self.lock().queued.len()
    }

    /// Release every queued frame. Returns how many were released.
    pub fn flush(&self) -> usize {
        let drained: Vec<Frame> = self.lock().queued.drain(..).collect();
        let count = drained.len();
        drop(drained);
        count
    }

    pub fn set_listener(&self, listener: FrameListener) {
        let previous = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.listener.replace(listener)
        };
        drop(previous);
        tracing::debug!(sink = %self.name, "listener attached");
    }

    /// Detach the listener; later frames queue again. Returns whether one was attached.
    pub fn clear_listener(&self) -> bool {
        let previous = self.lock().listener.take();
        let attached = previous.is_some();
        drop(previous);
        if attached {
            tracing::debug!(sink = %self.name, "listener detached");
        }
        attached
    }

    /// Release every later frame on arrival instead of queueing it.
    pub fn discard_incoming(&self) {
        let name = self.name.clone();
        self.set_listener(Arc::new(move |frame: Frame| {
            tracing::debug!(sink = %name, sequence = frame.sequence(), "unclaimed frame released");
        }));
    }

    /// Close the sink: detach the listener and release queued frames.
    /// Frames delivered afterwards are released immediately.
    pub fn close(&self) {
        let (listener, queued) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (state.listener.take(), std::mem::take(&mut state.queued))
        };
        drop(listener);
        drop(queued);
        tracing::debug!(sink = %self.name, "sink closed");
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSink")
            .field("name", &self.name)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{i420_layout, layout_extent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn publish(sink: &FrameSink, sequence: u64) -> bool {
        let planes = i420_layout(4, 4, 4);
        let bytes = vec![sequence as u8; layout_extent(&planes)];
        sink.publish(&bytes, &planes, sequence * 1000, sequence)
    }

    #[test]
    fn test_queues_without_listener() {
        let sink = FrameSink::new("s", 4, 4, 3);
        assert!(publish(&sink, 1));
        assert!(publish(&sink, 2));
        assert_eq!(sink.queued(), 2);
        assert_eq!(sink.acquire_next().unwrap().sequence(), 1);
        assert_eq!(sink.flush(), 1);
        assert_eq!(sink.pool().outstanding(), 0);
    }

    #[test]
    fn test_pool_bounds_queue() {
        let sink = FrameSink::new("s", 4, 4, 2);
        assert!(publish(&sink, 1));
        assert!(publish(&sink, 2));
        assert!(!publish(&sink, 3));
        assert_eq!(sink.queued(), 2);
        assert_eq!(sink.pool().exhausted(), 1);
    }

    #[test]
    fn test_listener_receives_frames() {
        let sink = FrameSink::new("s", 4, 4, 3);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        sink.set_listener(Arc::new(move |frame: Frame| {
            counter.fetch_add(frame.sequence() as usize, Ordering::SeqCst);
        }));
        publish(&sink, 3);
        publish(&sink, 4);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert_eq!(sink.queued(), 0);
        assert_eq!(sink.pool().outstanding(), 0);

        assert!(sink.clear_listener());
        publish(&sink, 5);
        assert_eq!(sink.queued(), 1);
    }

    #[test]
    fn test_discard_incoming_releases() {
        let sink = FrameSink::new("s", 4, 4, 1);
        sink.discard_incoming();
        for seq in 0..5 {
            assert!(publish(&sink, seq));
        }
        assert_eq!(sink.pool().released(), 5);
        assert_eq!(sink.pool().outstanding(), 0);
    }

    #[test]
    fn test_close_releases_and_drops_listener() {
        let sink = FrameSink::new("s", 4, 4, 3);
        publish(&sink, 1);
        let marker = Arc::new(());
        let held = Arc::clone(&marker);
        sink.set_listener(Arc::new(move |_frame: Frame| {
            let _ = &held;
        }));
        assert_eq!(Arc::strong_count(&marker), 2);

        sink.close();
        assert_eq!(Arc::strong_count(&marker), 1);
        assert_eq!(sink.pool().outstanding(), 0);
        assert!(!publish(&sink, 2));
        assert!(sink.is_closed());
    }
}
