//! Pixel transforms: planar 4:2:0 to packed NV21, 90° rotation, horizontal mirror.
//!
//! All functions are pure and allocate exactly one output buffer.

use crate::frame::{Frame, PixelFormat};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("planar 4:2:0 needs 3 planes, frame has {0}")]
    MissingPlanes(usize),
    #[error("odd dimensions {width}x{height} cannot be 4:2:0 subsampled")]
    OddDimensions { width: u32, height: u32 },
    #[error("luma plane has pixel stride {0}, expected 1")]
    UnsupportedLumaStride(usize),
    #[error("plane {0} is shorter than its strides describe")]
    TruncatedPlane(usize),
    #[error("packed buffer holds {actual} bytes, {expected} expected")]
    InvalidLength { expected: usize, actual: usize },
}

/// Byte size of a packed 4:2:0 image.
pub fn packed_len(width: u32, height: u32) -> usize {
    let luma = width as usize * height as usize;
    luma + luma / 2
}

/// A packed NV21 image: `width * height` luma bytes followed by
/// `width * height / 2` bytes of interleaved Cr/Cb pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nv21Image {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Nv21Image {
    /// Wrap an existing NV21 buffer, checking its size.
    pub fn from_packed(width: u32, height: u32, data: Vec<u8>) -> Result<Self, TransformError> {
        if width % 2 != 0 || height % 2 != 0 {
            return Err(TransformError::OddDimensions { width, height });
        }
        let expected = packed_len(width, height);
        if data.len() != expected {
            return Err(TransformError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        PixelFormat::Nv21
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn luma(&self) -> &[u8] {
        &self.data[..self.luma_len()]
    }

    pub fn chroma(&self) -> &[u8] {
        &self.data[self.luma_len()..]
    }

    fn luma_len(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Convert a planar 4:2:0 frame to packed NV21.
///
/// Luma is copied in one block when rows are unpadded, otherwise row by row.
/// When the hardware already laid chroma out as one VU-interleaved region
/// (Cb plane starting one byte after the Cr plane, both with pixel stride 2
/// and no row padding), that region is copied in one block. Every other
/// layout goes through the strided per-sample interleave, which is the
/// reference path.
pub fn to_packed_chroma(frame: &Frame) -> Result<Nv21Image, TransformError> {
    if frame.planes().len() < 3 {
        return Err(TransformError::MissingPlanes(frame.planes().len()));
    }
    let (width, height) = (frame.width(), frame.height());
    if width % 2 != 0 || height % 2 != 0 {
        return Err(TransformError::OddDimensions { width, height });
    }
    let w = width as usize;
    let h = height as usize;
    let y_size = w * h;
    let mut out = vec![0u8; packed_len(width, height)];

    let y_plane = frame.planes()[0];
    if y_plane.pixel_stride != 1 {
        return Err(TransformError::UnsupportedLumaStride(y_plane.pixel_stride));
    }
    let y_data = frame.plane_data(0).ok_or(TransformError::TruncatedPlane(0))?;
    if y_plane.row_stride == w {
        let src = y_data.get(..y_size).ok_or(TransformError::TruncatedPlane(0))?;
        out[..y_size].copy_from_slice(src);
    } else {
        for row in 0..h {
            let start = row * y_plane.row_stride;
            let src = y_data
                .get(start..start + w)
                .ok_or(TransformError::TruncatedPlane(0))?;
            out[row * w..(row + 1) * w].copy_from_slice(src);
        }
    }

    if let Some(vu) = interleaved_vu_region(frame) {
        tracing::trace!(sequence = frame.sequence(), "chroma already VU-interleaved");
        out[y_size..].copy_from_slice(vu);
        return Ok(Nv21Image {
            width,
            height,
            data: out,
        });
    }

    let u_plane = frame.planes()[1];
    let v_plane = frame.planes()[2];
    let u_data = frame.plane_data(1).ok_or(TransformError::TruncatedPlane(1))?;
    let v_data = frame.plane_data(2).ok_or(TransformError::TruncatedPlane(2))?;
    let mut pos = y_size;
    for row in 0..h / 2 {
        for col in 0..w / 2 {
            let v_pos = row * v_plane.row_stride + col * v_plane.pixel_stride;
            let u_pos = row * u_plane.row_stride + col * u_plane.pixel_stride;
            out[pos] = *v_data.get(v_pos).ok_or(TransformError::TruncatedPlane(2))?;
            out[pos + 1] = *u_data.get(u_pos).ok_or(TransformError::TruncatedPlane(1))?;
            pos += 2;
        }
    }

    Ok(Nv21Image {
        width,
        height,
        data: out,
    })
}

/// The frame's chroma as one contiguous NV21 region, if the layout allows it.
fn interleaved_vu_region(frame: &Frame) -> Option<&[u8]> {
    let w = frame.width() as usize;
    let u = frame.plane(1)?;
    let v = frame.plane(2)?;
    let aliased = u.pixel_stride == 2
        && v.pixel_stride == 2
        && u.row_stride == w
        && v.row_stride == w
        && u.offset == v.offset + 1;
    if !aliased {
        return None;
    }
    let len = w * frame.height() as usize / 2;
    frame.storage().get(v.offset..v.offset + len)
}

/// Rotate a packed image a quarter turn: the output's rows are the input's
/// columns read top to bottom. Combine with [`mirror_horizontal`] for a
/// clockwise rotation.
pub fn rotate90(image: &Nv21Image) -> Nv21Image {
    let w = image.width as usize;
    let h = image.height as usize;
    let wh = w * h;
    let src = &image.data;
    let mut out = vec![0u8; src.len()];

    let mut k = 0;
    for col in 0..w {
        for row in 0..h {
            out[k] = src[row * w + col];
            k += 1;
        }
    }

    // Chroma rows hold w/2 VU pairs; only h/2 rows exist.
    for col in (0..w).step_by(2) {
        for row in 0..h / 2 {
            let pos = wh + row * w + col;
            out[k] = src[pos];
            out[k + 1] = src[pos + 1];
            k += 2;
        }
    }

    Nv21Image {
        width: image.height,
        height: image.width,
        data: out,
    }
}

/// Mirror a packed image left-to-right. Chroma is reversed by whole VU pairs.
pub fn mirror_horizontal(image: &Nv21Image) -> Nv21Image {
    let w = image.width as usize;
    let h = image.height as usize;
    let wh = w * h;
    let src = &image.data;
    let mut out = vec![0u8; src.len()];

    for row in 0..h {
        let line = &src[row * w..(row + 1) * w];
        for (dst, &px) in out[row * w..(row + 1) * w].iter_mut().zip(line.iter().rev()) {
            *dst = px;
        }
    }

    for row in 0..h / 2 {
        let start = wh + row * w;
        let line = &src[start..start + w];
        for (dst, pair) in out[start..start + w]
            .chunks_exact_mut(2)
            .zip(line.chunks_exact(2).rev())
        {
            dst.copy_from_slice(pair);
        }
    }

    Nv21Image {
        width: image.width,
        height: image.height,
        data: out,
    }
}

/// Preview orientation fix: [`rotate90`] followed by [`mirror_horizontal`].
pub fn rotate_and_mirror(image: &Nv21Image) -> Nv21Image {
    mirror_horizontal(&rotate90(image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{i420_layout, layout_extent, nv12_layout, nv21_layout, BufferPool, Plane};

    fn frame(pool: &BufferPool, w: u32, h: u32, storage: Vec<u8>, planes: Vec<Plane>) -> Frame {
        Frame::new(pool.try_acquire().unwrap(), w, h, 0, 0, storage, planes).unwrap()
    }

    /// 4x4 luma 0..15, Cb = 200.., Cr = 100..
    fn planar_4x4() -> (Vec<u8>, [u8; 4], [u8; 4]) {
        let luma: Vec<u8> = (0..16).collect();
        (luma, [200, 201, 202, 203], [100, 101, 102, 103])
    }

    const EXPECTED_4X4: [u8; 24] = [
        0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, //
        100, 200, 101, 201, 102, 202, 103, 203,
    ];

    #[test]
    fn test_packed_from_i420() {
        let pool = BufferPool::new("t", 1);
        let (luma, cb, cr) = planar_4x4();
        let planes = i420_layout(4, 4, 4);
        let mut storage = luma.clone();
        storage.extend_from_slice(&cb);
        storage.extend_from_slice(&cr);
        let packed = to_packed_chroma(&frame(&pool, 4, 4, storage, planes)).unwrap();
        assert_eq!(packed.data(), &EXPECTED_4X4);
        assert_eq!(packed.data().len(), packed_len(4, 4));
    }

    #[test]
    fn test_packed_from_nv21_block_copy() {
        let pool = BufferPool::new("t", 1);
        let (luma, cb, cr) = planar_4x4();
        let mut storage = luma;
        for i in 0..4 {
            storage.push(cr[i]);
            storage.push(cb[i]);
        }
        let packed = to_packed_chroma(&frame(&pool, 4, 4, storage, nv21_layout(4, 4, 4))).unwrap();
        assert_eq!(packed.data(), &EXPECTED_4X4);
    }

    #[test]
    fn test_packed_from_nv12_swaps_chroma() {
        let pool = BufferPool::new("t", 1);
        let (luma, cb, cr) = planar_4x4();
        let mut storage = luma;
        for i in 0..4 {
            storage.push(cb[i]);
            storage.push(cr[i]);
        }
        let packed = to_packed_chroma(&frame(&pool, 4, 4, storage, nv12_layout(4, 4, 4))).unwrap();
        assert_eq!(packed.data(), &EXPECTED_4X4);
    }

    #[test]
    fn test_packed_handles_padded_rows() {
        let pool = BufferPool::new("t", 1);
        let (luma, _, _) = planar_4x4();
        // Row stride 6: two bytes of padding per luma row, chroma stride 3.
        let planes = i420_layout(4, 4, 6);
        let mut storage = vec![0xEE; layout_extent(&planes)];
        for row in 0..4 {
            storage[row * 6..row * 6 + 4].copy_from_slice(&luma[row * 4..row * 4 + 4]);
        }
        let (u, v) = (planes[1], planes[2]);
        for row in 0..2 {
            for col in 0..2 {
                storage[u.offset + row * 3 + col] = 200 + (row * 2 + col) as u8;
                storage[v.offset + row * 3 + col] = 100 + (row * 2 + col) as u8;
            }
        }
        let packed = to_packed_chroma(&frame(&pool, 4, 4, storage, planes)).unwrap();
        assert_eq!(packed.data(), &EXPECTED_4X4);
    }

    #[test]
    fn test_packed_requires_three_planes() {
        let pool = BufferPool::new("t", 1);
        let planes = i420_layout(4, 4, 4)[..2].to_vec();
        let result = to_packed_chroma(&frame(&pool, 4, 4, vec![0; 24], planes));
        assert_eq!(result, Err(TransformError::MissingPlanes(2)));
    }

    #[test]
    fn test_packed_rejects_wide_luma_stride() {
        let pool = BufferPool::new("t", 1);
        let mut planes = i420_layout(4, 4, 4);
        planes[0] = Plane::new(0, 4, 4, 8, 2);
        let result = to_packed_chroma(&frame(&pool, 4, 4, vec![0; 32], planes));
        assert_eq!(result, Err(TransformError::UnsupportedLumaStride(2)));
    }

    #[test]
    fn test_rotate90_4x4() {
        let mut data: Vec<u8> = (0..16).collect();
        data.extend_from_slice(&[100, 101, 102, 103, 104, 105, 106, 107]);
        let image = Nv21Image::from_packed(4, 4, data).unwrap();

        let rotated = rotate90(&image);
        assert_eq!((rotated.width(), rotated.height()), (4, 4));
        assert_eq!(
            rotated.data(),
            &[
                0, 4, 8, 12, 1, 5, 9, 13, 2, 6, 10, 14, 3, 7, 11, 15, //
                100, 101, 104, 105, 102, 103, 106, 107,
            ]
        );
    }

    #[test]
    fn test_rotate90_swaps_dimensions() {
        let image = Nv21Image::from_packed(6, 4, vec![0; packed_len(6, 4)]).unwrap();
        let rotated = rotate90(&image);
        assert_eq!((rotated.width(), rotated.height()), (4, 6));
    }

    #[test]
    fn test_mirror_reverses_rows_and_chroma_pairs() {
        let mut data: Vec<u8> = (0..8).collect(); // 4x2 luma
        data.extend_from_slice(&[10, 11, 20, 21]); // one chroma row, two pairs
        let image = Nv21Image::from_packed(4, 2, data).unwrap();

        let mirrored = mirror_horizontal(&image);
        assert_eq!(mirrored.luma(), &[3, 2, 1, 0, 7, 6, 5, 4]);
        assert_eq!(mirrored.chroma(), &[20, 21, 10, 11]);
    }

    #[test]
    fn test_rotate_and_mirror_round_trip() {
        for (w, h) in [(4u32, 4u32), (6, 4), (2, 8), (10, 6)] {
            let data: Vec<u8> = (0..packed_len(w, h)).map(|i| (i * 7 % 251) as u8).collect();
            let image = Nv21Image::from_packed(w, h, data).unwrap();

            let fixed = rotate_and_mirror(&image);
            assert_eq!((fixed.width(), fixed.height()), (h, w));

            // Mirror then rotate undoes rotate then mirror.
            let restored = rotate90(&mirror_horizontal(&fixed));
            assert_eq!((restored.width(), restored.height()), (w, h));
            assert_eq!(restored.luma(), image.luma(), "luma mismatch for {w}x{h}");
            assert_eq!(restored.chroma(), image.chroma(), "chroma mismatch for {w}x{h}");
        }
    }

    #[test]
    fn test_from_packed_validates() {
        assert!(matches!(
            Nv21Image::from_packed(3, 4, vec![0; 18]),
            Err(TransformError::OddDimensions { .. })
        ));
        assert!(matches!(
            Nv21Image::from_packed(4, 4, vec![0; 23]),
            Err(TransformError::InvalidLength { expected: 24, actual: 23 })
        ));
    }
}
