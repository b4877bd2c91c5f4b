//! Frame type, hardware buffer pool, and luma statistics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Pixel layout of an image handled by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Planar 4:2:0, three components (Y, Cb, Cr). Chroma planes may be
    /// strided views into one interleaved region.
    Yuv420,
    /// Packed 4:2:0: full luma plane followed by interleaved Cr/Cb pairs.
    Nv21,
}

/// Location of one image component inside a frame's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    pub offset: usize,
    pub len: usize,
    pub row_stride: usize,
    pub pixel_stride: usize,
}

impl Plane {
    /// Describe a plane of `rows` x `cols` samples starting at `offset`.
    pub fn new(offset: usize, rows: usize, cols: usize, row_stride: usize, pixel_stride: usize) -> Self {
        let len = if rows == 0 || cols == 0 {
            0
        } else {
            (rows - 1) * row_stride + (cols - 1) * pixel_stride + 1
        };
        Self {
            offset,
            len,
            row_stride,
            pixel_stride,
        }
    }
}

/// Fully planar layout (I420): Y, then Cb, then Cr, each tightly packed.
pub fn i420_layout(width: u32, height: u32, row_stride: usize) -> Vec<Plane> {
    let (w, h) = (width as usize, height as usize);
    let chroma_stride = row_stride / 2;
    let y_size = row_stride * h;
    let c_size = chroma_stride * (h / 2);
    vec![
        Plane::new(0, h, w, row_stride, 1),
        Plane::new(y_size, h / 2, w / 2, chroma_stride, 1),
        Plane::new(y_size + c_size, h / 2, w / 2, chroma_stride, 1),
    ]
}

/// Semi-planar layout with Cr first (NV21): chroma planes alias one VU region.
pub fn nv21_layout(width: u32, height: u32, row_stride: usize) -> Vec<Plane> {
    let (w, h) = (width as usize, height as usize);
    let y_size = row_stride * h;
    vec![
        Plane::new(0, h, w, row_stride, 1),
        Plane::new(y_size + 1, h / 2, w / 2, row_stride, 2),
        Plane::new(y_size, h / 2, w / 2, row_stride, 2),
    ]
}

/// Semi-planar layout with Cb first (NV12): chroma planes alias one UV region.
pub fn nv12_layout(width: u32, height: u32, row_stride: usize) -> Vec<Plane> {
    let (w, h) = (width as usize, height as usize);
    let y_size = row_stride * h;
    vec![
        Plane::new(0, h, w, row_stride, 1),
        Plane::new(y_size, h / 2, w / 2, row_stride, 2),
        Plane::new(y_size + 1, h / 2, w / 2, row_stride, 2),
    ]
}

/// Bytes of storage a layout needs.
pub fn layout_extent(planes: &[Plane]) -> usize {
    planes.iter().map(|p| p.offset + p.len).max().unwrap_or(0)
}

/// A captured planar frame.
///
/// Holds a lease on one slot of the producing sink's [`BufferPool`]; the
/// slot returns to the pool when the frame is dropped, so each frame is
/// released exactly once whichever path consumes it.
pub struct Frame {
    width: u32,
    height: u32,
    timestamp_ns: u64,
    sequence: u64,
    storage: Vec<u8>,
    planes: Vec<Plane>,
    _lease: BufferLease,
}

impl Frame {
    /// Wrap captured bytes. Fails if any plane reaches past `storage`.
    pub fn new(
        lease: BufferLease,
        width: u32,
        height: u32,
        timestamp_ns: u64,
        sequence: u64,
        storage: Vec<u8>,
        planes: Vec<Plane>,
    ) -> Result<Self, FrameError> {
        for (index, plane) in planes.iter().enumerate() {
            if plane.offset + plane.len > storage.len() {
                return Err(FrameError::PlaneOutOfBounds {
                    index,
                    end: plane.offset + plane.len,
                    storage: storage.len(),
                });
            }
        }
        Ok(Self {
            width,
            height,
            timestamp_ns,
            sequence,
            storage,
            planes,
            _lease: lease,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Sensor timestamp of the exposure, in nanoseconds.
    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn format(&self) -> PixelFormat {
        PixelFormat::Yuv420
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn plane(&self, index: usize) -> Option<&Plane> {
        self.planes.get(index)
    }

    /// Bytes of one plane, from its first sample to its last.
    pub fn plane_data(&self, index: usize) -> Option<&[u8]> {
        let plane = self.planes.get(index)?;
        self.storage.get(plane.offset..plane.offset + plane.len)
    }

    /// The whole backing buffer the planes point into.
    pub fn storage(&self) -> &[u8] {
        &self.storage
    }

    /// Release the frame back to its pool.
    pub fn release(self) {
        tracing::trace!(sequence = self.sequence, "frame released");
    }

    /// One row of luma samples, or `None` past the last row.
    pub fn luma_row(&self, row: usize) -> Option<&[u8]> {
        let plane = self.planes.first()?;
        if plane.pixel_stride != 1 || row >= self.height as usize {
            return None;
        }
        let start = plane.offset + row * plane.row_stride;
        self.storage.get(start..start + self.width as usize)
    }

    /// Average luma brightness (0.0 to 255.0).
    pub fn avg_brightness(&self) -> f32 {
        let mut sum = 0u64;
        let mut count = 0u64;
        for row in 0..self.height as usize {
            let Some(line) = self.luma_row(row) else {
                break;
            };
            sum += line.iter().map(|&b| b as u64).sum::<u64>();
            count += line.len() as u64;
        }
        if count == 0 {
            return 0.0;
        }
        sum as f32 / count as f32
    }

    /// Dark-frame check over the luma plane, see [`is_dark_frame`].
    pub fn is_dark(&self, threshold_pct: f32) -> bool {
        let mut dark = 0usize;
        let mut total = 0usize;
        for row in 0..self.height as usize {
            let Some(line) = self.luma_row(row) else {
                break;
            };
            dark += line.iter().filter(|&&p| p < 32).count();
            total += line.len();
        }
        if total == 0 {
            return true;
        }
        (dark as f32 / total as f32) > threshold_pct
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_ns", &self.timestamp_ns)
            .field("sequence", &self.sequence)
            .field("planes", &self.planes.len())
            .finish()
    }
}

/// Check if a grayscale buffer is dark.
///
/// Returns true if more than `threshold_pct` of pixels fall in the darkest bucket (0 to 31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("plane {index} ends at byte {end}, storage holds {storage}")]
    PlaneOutOfBounds {
        index: usize,
        end: usize,
        storage: usize,
    },
}

/// Fixed-capacity pool of hardware frame slots.
///
/// Mirrors a hardware image reader's max-images limit: at most `capacity`
/// frames from one output may be alive at once. Producers that find the
/// pool exhausted drop the new frame.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    capacity: usize,
    outstanding: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
    exhausted: AtomicU64,
}

impl BufferPool {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                capacity,
                outstanding: AtomicUsize::new(0),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
                exhausted: AtomicU64::new(0),
            }),
        }
    }

    /// Take a slot, or `None` if all slots are held.
    pub fn try_acquire(&self) -> Option<BufferLease> {
        let taken = self
            .inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.inner.capacity).then_some(n + 1)
            });
        match taken {
            Ok(_) => {
                self.inner.acquired.fetch_add(1, Ordering::Relaxed);
                Some(BufferLease {
                    pool: Arc::clone(&self.inner),
                })
            }
            Err(_) => {
                self.inner.exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(pool = %self.inner.name, "buffer pool exhausted");
                None
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Slots currently held by live frames.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn acquired(&self) -> u64 {
        self.inner.acquired.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.inner.released.load(Ordering::Relaxed)
    }

    /// Acquire attempts refused because the pool was full.
    pub fn exhausted(&self) -> u64 {
        self.inner.exhausted.load(Ordering::Relaxed)
    }
}

/// One held pool slot. Returned on drop.
pub struct BufferLease {
    pool: Arc<PoolInner>,
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.pool.released.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(pool: &BufferPool, width: u32, height: u32, luma: u8) -> Frame {
        let planes = i420_layout(width, height, width as usize);
        let mut storage = vec![128u8; layout_extent(&planes)];
        storage[..(width * height) as usize].fill(luma);
        Frame::new(pool.try_acquire().unwrap(), width, height, 0, 0, storage, planes).unwrap()
    }

    #[test]
    fn test_pool_capacity_and_release() {
        let pool = BufferPool::new("test", 2);
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.outstanding(), 2);
        assert_eq!(pool.exhausted(), 1);

        drop(a);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.released(), 1);
        assert!(pool.try_acquire().is_some());

        drop(b);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.acquired(), 3);
    }

    #[test]
    fn test_frame_drop_releases_slot() {
        let pool = BufferPool::new("test", 1);
        let frame = frame_with(&pool, 4, 4, 10);
        assert_eq!(pool.outstanding(), 1);
        frame.release();
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.released(), 1);
    }

    #[test]
    fn test_frame_rejects_short_storage() {
        let pool = BufferPool::new("test", 1);
        let planes = i420_layout(4, 4, 4);
        let result = Frame::new(pool.try_acquire().unwrap(), 4, 4, 0, 0, vec![0; 10], planes);
        assert!(matches!(
            result,
            Err(FrameError::PlaneOutOfBounds { index: 0, .. })
        ));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_nv21_layout_aliases_chroma() {
        let planes = nv21_layout(4, 4, 4);
        assert_eq!(planes[2].offset, 16);
        assert_eq!(planes[1].offset, 17);
        // (2 rows - 1) * 4 + (2 cols - 1) * 2 + 1
        assert_eq!(planes[1].len, 7);
        assert_eq!(layout_extent(&planes), 24);
    }

    #[test]
    fn test_i420_layout_extent() {
        let planes = i420_layout(640, 480, 640);
        assert_eq!(layout_extent(&planes), 640 * 480 * 3 / 2);
    }

    #[test]
    fn test_luma_row_respects_stride() {
        let pool = BufferPool::new("test", 1);
        let planes = i420_layout(2, 2, 4);
        let storage = vec![1, 2, 99, 99, 3, 4, 99, 99, 128, 128, 128, 128];
        let frame = Frame::new(pool.try_acquire().unwrap(), 2, 2, 0, 0, storage, planes).unwrap();
        assert_eq!(frame.luma_row(0), Some(&[1u8, 2][..]));
        assert_eq!(frame.luma_row(1), Some(&[3u8, 4][..]));
        assert_eq!(frame.luma_row(2), None);
        assert!((frame.avg_brightness() - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_dark_frame_all_black() {
        let gray = vec![0u8; 1000];
        assert!(is_dark_frame(&gray, 0.95));
    }

    #[test]
    fn test_dark_frame_normal() {
        let gray = vec![128u8; 1000];
        assert!(!is_dark_frame(&gray, 0.95));
    }

    #[test]
    fn test_dark_frame_empty() {
        assert!(is_dark_frame(&[], 0.95));
    }

    #[test]
    fn test_dark_frame_borderline_bright() {
        // 94% dark, 6% bright → should NOT be dark
        let mut gray = vec![10u8; 940];
        gray.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&gray, 0.95));
    }

    #[test]
    fn test_frame_is_dark_uses_luma_only() {
        let pool = BufferPool::new("test", 2);
        assert!(frame_with(&pool, 4, 4, 0).is_dark(0.95));
        assert!(!frame_with(&pool, 4, 4, 200).is_dark(0.95));
    }
}
