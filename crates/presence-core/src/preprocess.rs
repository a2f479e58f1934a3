//! Frame-to-tensor preprocessing — crop expansion, rotation correction,
//! bilinear resampling, YUV→RGB conversion, and [-1, 1] normalization.
//!
//! Runs on every analyzed frame: one output tensor per call, no intermediate
//! images.

use crate::types::FaceRect;
use ndarray::Array3;
use thiserror::Error;

/// Spatial size of the model input (S×S×3).
pub const FACE_INPUT_SIZE: usize = 112;

const NORM_MEAN: f32 = 127.5;
const NORM_SCALE: f32 = 128.0;

/// Interleaved S×S×3 float tensor, channel values in roughly [-1, 1].
pub type FaceTensor = Array3<f32>;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("degenerate face crop after clamping: {width}x{height}")]
    DegenerateCrop { width: i32, height: i32 },
    #[error("unsupported sensor rotation {0} — expected 0, 90, 180 or 270")]
    UnsupportedRotation(i32),
    #[error("frame dimensions must be even and non-zero, got {width}x{height}")]
    BadDimensions { width: u32, height: u32 },
    #[error("{plane} plane too small: expected at least {expected} bytes, got {actual}")]
    PlaneTooSmall {
        plane: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// A planar YUV 4:2:0 frame with explicit strides.
///
/// `uv_pixel_stride` is 1 for fully planar layouts (I420) and 2 for
/// semi-planar layouts where chroma samples interleave (NV12/NV21 views).
#[derive(Debug, Clone)]
pub struct YuvFrame {
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
    width: u32,
    height: u32,
    y_row_stride: usize,
    uv_row_stride: usize,
    uv_pixel_stride: usize,
}

impl YuvFrame {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        y: Vec<u8>,
        u: Vec<u8>,
        v: Vec<u8>,
        width: u32,
        height: u32,
        y_row_stride: usize,
        uv_row_stride: usize,
        uv_pixel_stride: usize,
    ) -> Result<Self, PreprocessError> {
        if width < 2 || height < 2 || width % 2 != 0 || height % 2 != 0 {
            return Err(PreprocessError::BadDimensions { width, height });
        }

        let y_needed = (height as usize - 1) * y_row_stride + width as usize;
        if y.len() < y_needed {
            return Err(PreprocessError::PlaneTooSmall {
                plane: "Y",
                expected: y_needed,
                actual: y.len(),
            });
        }

        let uv_needed =
            (height as usize / 2 - 1) * uv_row_stride + (width as usize / 2 - 1) * uv_pixel_stride + 1;
        for (plane, data) in [("U", &u), ("V", &v)] {
            if data.len() < uv_needed {
                return Err(PreprocessError::PlaneTooSmall {
                    plane,
                    expected: uv_needed,
                    actual: data.len(),
                });
            }
        }

        Ok(Self {
            y,
            u,
            v,
            width,
            height,
            y_row_stride,
            uv_row_stride,
            uv_pixel_stride,
        })
    }

    /// Tightly-packed I420 convenience constructor.
    pub fn i420(
        y: Vec<u8>,
        u: Vec<u8>,
        v: Vec<u8>,
        width: u32,
        height: u32,
    ) -> Result<Self, PreprocessError> {
        let w = width as usize;
        Self::new(y, u, v, width, height, w, w / 2, 1)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PreprocessConfig {
    /// Extra margin added around the detected face, as a fraction of the
    /// larger rectangle side (0.25 = 25%).
    pub padding: f32,
    pub output_size: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            padding: 0.25,
            output_size: FACE_INPUT_SIZE,
        }
    }
}

/// Converts a raw frame plus a detected face rectangle into a model-ready
/// tensor.
#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Crop, rotate, resample, and normalize a detected face.
    ///
    /// `rect` is in upright (rotation-corrected) pixel coordinates, as
    /// delivered by the detector. `rotation` is the clockwise rotation the
    /// sensor applied; the sampling loop inverts it. `mirrored` un-flips
    /// front-camera x coordinates before the rotation mapping.
    pub fn run(
        &self,
        frame: &YuvFrame,
        rect: FaceRect,
        rotation: i32,
        mirrored: bool,
    ) -> Result<FaceTensor, PreprocessError> {
        if !matches!(rotation, 0 | 90 | 180 | 270) {
            return Err(PreprocessError::UnsupportedRotation(rotation));
        }

        let (raw_w, raw_h) = (frame.width as i32, frame.height as i32);
        let (upright_w, upright_h) = if rotation % 180 == 0 {
            (raw_w, raw_h)
        } else {
            (raw_h, raw_w)
        };

        // Square expansion about the rect center, then clamp to bounds.
        let cx = rect.x + rect.width / 2;
        let cy = rect.y + rect.height / 2;
        let side = (rect.width.max(rect.height) as f32 * (1.0 + self.config.padding)) as i32;
        let half = side / 2;

        let left = (cx - half).clamp(0, upright_w);
        let top = (cy - half).clamp(0, upright_h);
        let right = (cx + half).clamp(0, upright_w);
        let bottom = (cy + half).clamp(0, upright_h);

        let crop_w = right - left;
        let crop_h = bottom - top;
        if crop_w < 2 || crop_h < 2 {
            return Err(PreprocessError::DegenerateCrop {
                width: crop_w,
                height: crop_h,
            });
        }

        let size = self.config.output_size;
        let mut tensor = Array3::<f32>::zeros((size, size, 3));

        for oy in 0..size {
            for ox in 0..size {
                // Center-sampled position inside the crop, in upright space.
                let fx = (ox as f32 + 0.5) / size as f32;
                let fy = (oy as f32 + 0.5) / size as f32;
                let mut sx = left as f32 + fx * crop_w as f32;
                let sy = top as f32 + fy * crop_h as f32;

                if mirrored {
                    sx = upright_w as f32 - sx;
                }

                // Invert the clockwise sensor rotation: upright → raw.
                let (rx, ry) = match rotation {
                    90 => (sy, raw_h as f32 - 1.0 - sx),
                    180 => (raw_w as f32 - 1.0 - sx, raw_h as f32 - 1.0 - sy),
                    270 => (raw_w as f32 - 1.0 - sy, sx),
                    _ => (sx, sy),
                };

                let luma = sample_bilinear_y(frame, rx, ry);
                let (u_val, v_val) = sample_chroma(frame, rx, ry);

                // BT.601 YUV → RGB.
                let r = luma + 1.402 * v_val;
                let g = luma - 0.344_136 * u_val - 0.714_136 * v_val;
                let b = luma + 1.772 * u_val;

                tensor[[oy, ox, 0]] = (r.clamp(0.0, 255.0) - NORM_MEAN) / NORM_SCALE;
                tensor[[oy, ox, 1]] = (g.clamp(0.0, 255.0) - NORM_MEAN) / NORM_SCALE;
                tensor[[oy, ox, 2]] = (b.clamp(0.0, 255.0) - NORM_MEAN) / NORM_SCALE;
            }
        }

        Ok(tensor)
    }
}

/// Bilinear luma sample at raw-sensor coordinates.
fn sample_bilinear_y(frame: &YuvFrame, rx: f32, ry: f32) -> f32 {
    let w = frame.width as i32;
    let h = frame.height as i32;

    let x0 = (rx.floor() as i32).clamp(0, w - 2);
    let y0 = (ry.floor() as i32).clamp(0, h - 2);
    let dx = (rx - x0 as f32).clamp(0.0, 1.0);
    let dy = (ry - y0 as f32).clamp(0.0, 1.0);

    let row1 = y0 as usize * frame.y_row_stride;
    let row2 = (y0 + 1) as usize * frame.y_row_stride;
    let x0u = x0 as usize;

    let v00 = frame.y[row1 + x0u] as f32;
    let v10 = frame.y[row1 + x0u + 1] as f32;
    let v01 = frame.y[row2 + x0u] as f32;
    let v11 = frame.y[row2 + x0u + 1] as f32;

    v00 * (1.0 - dx) * (1.0 - dy) + v10 * dx * (1.0 - dy) + v01 * (1.0 - dx) * dy + v11 * dx * dy
}

/// Nearest-neighbor chroma sample, centered at 128.
fn sample_chroma(frame: &YuvFrame, rx: f32, ry: f32) -> (f32, f32) {
    let cw = frame.width as i32 / 2;
    let ch = frame.height as i32 / 2;

    let cx = ((rx as i32) >> 1).clamp(0, cw - 1) as usize;
    let cy = ((ry as i32) >> 1).clamp(0, ch - 1) as usize;

    let offset = cy * frame.uv_row_stride + cx * frame.uv_pixel_stride;
    let u = frame.u[offset] as f32 - 128.0;
    let v = frame.v[offset] as f32 - 128.0;
    (u, v)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Uniform I420 frame: constant luma, neutral chroma.
    fn flat_frame(width: u32, height: u32, luma: u8) -> YuvFrame {
        let y = vec![luma; (width * height) as usize];
        let uv = vec![128u8; (width * height / 4) as usize];
        YuvFrame::i420(y, uv.clone(), uv, width, height).unwrap()
    }

    fn full_rect(w: i32, h: i32) -> FaceRect {
        FaceRect {
            x: 0,
            y: 0,
            width: w,
            height: h,
        }
    }

    #[test]
    fn test_output_shape() {
        let frame = flat_frame(64, 48, 128);
        let tensor = Preprocessor::default()
            .run(&frame, full_rect(64, 48), 0, false)
            .unwrap();
        assert_eq!(tensor.shape(), &[FACE_INPUT_SIZE, FACE_INPUT_SIZE, 3]);
    }

    #[test]
    fn test_normalization_neutral_gray() {
        // Luma 128, neutral chroma → every channel ≈ (128 − 127.5) / 128.
        let frame = flat_frame(32, 32, 128);
        let tensor = Preprocessor::default()
            .run(&frame, full_rect(32, 32), 0, false)
            .unwrap();
        let expected = (128.0 - NORM_MEAN) / NORM_SCALE;
        for &v in tensor.iter() {
            assert!((v - expected).abs() < 1e-4, "got {v}, expected {expected}");
        }
    }

    #[test]
    fn test_values_within_unit_range() {
        let frame = flat_frame(32, 32, 255);
        let tensor = Preprocessor::default()
            .run(&frame, full_rect(32, 32), 0, false)
            .unwrap();
        for &v in tensor.iter() {
            assert!((-1.0..=1.0).contains(&v), "out of range: {v}");
        }
    }

    #[test]
    fn test_degenerate_crop_fails_fast() {
        let frame = flat_frame(32, 32, 128);
        // Rectangle entirely outside the image clamps to zero area.
        let rect = FaceRect {
            x: 500,
            y: 500,
            width: 10,
            height: 10,
        };
        let err = Preprocessor::default().run(&frame, rect, 0, false).unwrap_err();
        assert!(matches!(err, PreprocessError::DegenerateCrop { .. }));
    }

    #[test]
    fn test_unsupported_rotation() {
        let frame = flat_frame(32, 32, 128);
        let err = Preprocessor::default()
            .run(&frame, full_rect(32, 32), 45, false)
            .unwrap_err();
        assert!(matches!(err, PreprocessError::UnsupportedRotation(45)));
    }

    #[test]
    fn test_plane_validation() {
        let err = YuvFrame::i420(vec![0u8; 10], vec![0u8; 256], vec![0u8; 256], 32, 32).unwrap_err();
        assert!(matches!(err, PreprocessError::PlaneTooSmall { plane: "Y", .. }));
    }

    #[test]
    fn test_odd_dimensions_rejected() {
        let err = YuvFrame::i420(vec![0u8; 31 * 32], vec![0u8; 256], vec![0u8; 256], 31, 32)
            .unwrap_err();
        assert!(matches!(err, PreprocessError::BadDimensions { .. }));
    }

    /// Paint a bright patch in the raw frame, rotate the request, and verify
    /// the patch lands where the upright rect says it should.
    #[test]
    fn test_rotation_90_roundtrip() {
        let (w, h) = (64u32, 48u32);
        let mut y = vec![0u8; (w * h) as usize];
        // Bright 8x8 patch at raw (8..16, 40..48) — near the bottom-left.
        for py in 40..48usize {
            for px in 8..16usize {
                y[py * w as usize + px] = 255;
            }
        }
        let uv = vec![128u8; (w * h / 4) as usize];
        let frame = YuvFrame::i420(y, uv.clone(), uv, w, h).unwrap();

        // Upright space for rotation 90 is 48 wide × 64 tall. A raw pixel
        // (x, y) appears upright at (raw_h − 1 − y, x): the patch maps to
        // upright x ∈ (0..8), y ∈ (8..16).
        let rect = FaceRect {
            x: 0,
            y: 8,
            width: 8,
            height: 8,
        };
        let pre = Preprocessor::new(PreprocessConfig {
            padding: 0.0,
            output_size: 8,
        });
        let tensor = pre.run(&frame, rect, 90, false).unwrap();

        // The crop covers exactly the patch, so the tensor should be bright.
        let center = tensor[[4, 4, 0]];
        assert!(center > 0.9, "expected bright center, got {center}");
    }

    #[test]
    fn test_mirroring_flips_horizontally() {
        let (w, h) = (64u32, 32u32);
        let mut y = vec![0u8; (w * h) as usize];
        // Bright left half.
        for py in 0..h as usize {
            for px in 0..32usize {
                y[py * w as usize + px] = 255;
            }
        }
        let uv = vec![128u8; (w * h / 4) as usize];
        let frame = YuvFrame::i420(y, uv.clone(), uv, w, h).unwrap();

        let pre = Preprocessor::new(PreprocessConfig {
            padding: 0.0,
            output_size: 8,
        });
        let plain = pre.run(&frame, full_rect(w as i32, h as i32), 0, false).unwrap();
        let flipped = pre.run(&frame, full_rect(w as i32, h as i32), 0, true).unwrap();

        // Un-mirrored: left columns bright. Mirrored: right columns bright.
        assert!(plain[[4, 1, 0]] > 0.9);
        assert!(plain[[4, 6, 0]] < -0.9);
        assert!(flipped[[4, 1, 0]] < -0.9);
        assert!(flipped[[4, 6, 0]] > 0.9);
    }
}
