//! Planar frame type moved between pipeline stages.
//!
//! A `Frame` owns its pixel planes outright; it travels through the pipeline
//! by value and is dropped exactly once, either by the encode stage after a
//! successful write or wherever the drop policy discards it.

use thiserror::Error;

/// Raw YUV420 frame with a presentation timestamp.
pub struct Frame {
    /// Luma plane, `width * height` bytes, tightly packed.
    pub y: Vec<u8>,
    /// Chroma U plane, `(width / 2) * (height / 2)` bytes.
    pub u: Vec<u8>,
    /// Chroma V plane, `(width / 2) * (height / 2)` bytes.
    pub v: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in nanoseconds, monotonic per stream.
    pub pts: i64,
    /// Nanoseconds since the previously ingested frame; 0 for the first
    /// frame after a reset. Assigned by the detection window at submission.
    pub delta: i64,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("plane size mismatch: expected {expected} bytes for {plane}, got {actual}")]
    PlaneSize {
        plane: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("frame dimensions {width}x{height} must be even and non-zero")]
    BadDimensions { width: u32, height: u32 },
}

impl Frame {
    /// Build a frame from tightly packed planes.
    pub fn new(y: Vec<u8>, u: Vec<u8>, v: Vec<u8>, width: u32, height: u32, pts: i64) -> Result<Self, FrameError> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(FrameError::BadDimensions { width, height });
        }
        let luma = (width as usize) * (height as usize);
        let chroma = luma / 4;
        check_plane("y", luma, y.len())?;
        check_plane("u", chroma, u.len())?;
        check_plane("v", chroma, v.len())?;
        Ok(Self { y, u, v, width, height, pts, delta: 0 })
    }

    /// Assemble a frame from camera-native planes with arbitrary row strides,
    /// copying row by row into tightly packed storage.
    pub fn from_planes(
        data_y: &[u8],
        data_u: &[u8],
        data_v: &[u8],
        stride_y: usize,
        stride_u: usize,
        stride_v: usize,
        width: u32,
        height: u32,
        pts: i64,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(FrameError::BadDimensions { width, height });
        }
        let y = pack_plane("y", data_y, stride_y, width as usize, height as usize)?;
        let u = pack_plane("u", data_u, stride_u, width as usize / 2, height as usize / 2)?;
        let v = pack_plane("v", data_v, stride_v, width as usize / 2, height as usize / 2)?;
        Ok(Self { y, u, v, width, height, pts, delta: 0 })
    }

    /// Cheap grayscale representation used for classification: the luma plane
    /// with `crop_top` rows removed, box-downscaled by 2 in both dimensions.
    pub fn gray_view(&self, crop_top: u32) -> GrayImage {
        let crop = crop_top.min(self.height.saturating_sub(2)) as usize;
        let src_w = self.width as usize;
        let src_h = self.height as usize - crop;
        let out_w = src_w / 2;
        let out_h = src_h / 2;
        let mut data = Vec::with_capacity(out_w * out_h);
        let luma = &self.y[crop * src_w..];
        for row in 0..out_h {
            let top = &luma[row * 2 * src_w..];
            let bottom = &luma[(row * 2 + 1) * src_w..];
            for col in 0..out_w {
                let sum = top[col * 2] as u16
                    + top[col * 2 + 1] as u16
                    + bottom[col * 2] as u16
                    + bottom[col * 2 + 1] as u16;
                data.push((sum / 4) as u8);
            }
        }
        GrayImage { data, width: out_w as u32, height: out_h as u32 }
    }
}

fn check_plane(plane: &'static str, expected: usize, actual: usize) -> Result<(), FrameError> {
    if expected != actual {
        return Err(FrameError::PlaneSize { plane, expected, actual });
    }
    Ok(())
}

fn pack_plane(
    plane: &'static str,
    data: &[u8],
    stride: usize,
    width: usize,
    height: usize,
) -> Result<Vec<u8>, FrameError> {
    let needed = if height == 0 { 0 } else { stride * (height - 1) + width };
    if stride < width || data.len() < needed {
        return Err(FrameError::PlaneSize { plane, expected: needed, actual: data.len() });
    }
    let mut packed = Vec::with_capacity(width * height);
    for row in 0..height {
        packed.extend_from_slice(&data[row * stride..row * stride + width]);
    }
    Ok(packed)
}

/// Downsampled single-channel image handed to the motion classifier.
pub struct GrayImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl GrayImage {
    /// Mean luminance over the whole image, used by classifiers to gate out
    /// frames too dark to carry a usable flow signal.
    pub fn mean_luminance(&self) -> u8 {
        if self.data.is_empty() {
            return 0;
        }
        let sum: u64 = self.data.iter().map(|&p| p as u64).sum();
        (sum / self.data.len() as u64) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(width: u32, height: u32, pts: i64) -> Frame {
        let luma: Vec<u8> = (0..width * height).map(|i| (i % 251) as u8).collect();
        let chroma = vec![128u8; (width as usize / 2) * (height as usize / 2)];
        Frame::new(luma, chroma.clone(), chroma, width, height, pts).unwrap()
    }

    #[test]
    fn rejects_mismatched_planes() {
        let err = Frame::new(vec![0; 10], vec![0; 4], vec![0; 4], 4, 4, 0);
        assert!(matches!(err, Err(FrameError::PlaneSize { plane: "y", .. })));
    }

    #[test]
    fn rejects_odd_dimensions() {
        let err = Frame::new(vec![0; 15], vec![0; 4], vec![0; 4], 5, 3, 0);
        assert!(matches!(err, Err(FrameError::BadDimensions { .. })));
    }

    #[test]
    fn packs_strided_planes() {
        // 4x2 luma with stride 6: two padding bytes per row must not survive.
        let data_y = [1, 2, 3, 4, 0, 0, 5, 6, 7, 8, 0, 0];
        let data_c = [9, 10, 0, 0];
        let frame = Frame::from_planes(&data_y, &data_c, &data_c, 6, 4, 4, 4, 2, 42).unwrap();
        assert_eq!(frame.y, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(frame.u, vec![9, 10]);
        assert_eq!(frame.pts, 42);
    }

    #[test]
    fn gray_view_halves_dimensions() {
        let frame = gradient_frame(8, 6, 0);
        let gray = frame.gray_view(0);
        assert_eq!((gray.width, gray.height), (4, 3));
        assert_eq!(gray.data.len(), 12);
    }

    #[test]
    fn gray_view_crops_top_rows() {
        let frame = gradient_frame(8, 8, 0);
        let gray = frame.gray_view(4);
        assert_eq!((gray.width, gray.height), (4, 2));
    }

    #[test]
    fn mean_luminance_of_flat_image() {
        let gray = GrayImage { data: vec![100; 16], width: 4, height: 4 };
        assert_eq!(gray.mean_luminance(), 100);
    }
}
