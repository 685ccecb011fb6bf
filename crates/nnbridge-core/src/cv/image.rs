//! Image preprocessing: sample a pixel buffer through a matrix into a tensor,
//! converting colour format and normalising on the way.

use crate::error::{Result, RuntimeError};
use crate::tensor::Tensor;
use crate::types::{DimensionType, TypeTag};

use super::matrix::Matrix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filter {
    #[default]
    Nearest,
    Bilinear,
    Bicubic,
}

impl Filter {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Filter::Nearest),
            1 => Some(Filter::Bilinear),
            2 => Some(Filter::Bicubic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    #[default]
    Rgba,
    Rgb,
    Bgr,
    Gray,
    Bgra,
    YCrCb,
    Yuv,
    Hsv,
    Xyz,
    Bgr555,
    Bgr565,
    YuvNv21,
    YuvNv12,
    YuvI420,
    HsvFull,
}

impl ImageFormat {
    pub fn from_i32(value: i32) -> Option<Self> {
        use ImageFormat::*;
        Some(match value {
            0 => Rgba,
            1 => Rgb,
            2 => Bgr,
            3 => Gray,
            4 => Bgra,
            5 => YCrCb,
            6 => Yuv,
            7 => Hsv,
            8 => Xyz,
            9 => Bgr555,
            10 => Bgr565,
            11 => YuvNv21,
            12 => YuvNv12,
            13 => YuvI420,
            14 => HsvFull,
            _ => return None,
        })
    }

    /// Channels per pixel for the packed 8-bit formats this pipeline handles.
    pub fn channels(&self) -> Option<usize> {
        match self {
            ImageFormat::Rgba | ImageFormat::Bgra => Some(4),
            ImageFormat::Rgb | ImageFormat::Bgr => Some(3),
            ImageFormat::Gray => Some(1),
            _ => None,
        }
    }

    fn to_rgba(self, px: &[f32]) -> [f32; 4] {
        match self {
            ImageFormat::Rgba => [px[0], px[1], px[2], px[3]],
            ImageFormat::Bgra => [px[2], px[1], px[0], px[3]],
            ImageFormat::Rgb => [px[0], px[1], px[2], 255.0],
            ImageFormat::Bgr => [px[2], px[1], px[0], 255.0],
            _ => [px[0], px[0], px[0], 255.0],
        }
    }

    fn pack_rgba(self, rgba: [f32; 4], out: &mut [f32]) {
        let [r, g, b, a] = rgba;
        match self {
            ImageFormat::Rgba => out.copy_from_slice(&[r, g, b, a]),
            ImageFormat::Bgra => out.copy_from_slice(&[b, g, r, a]),
            ImageFormat::Rgb => out.copy_from_slice(&[r, g, b]),
            ImageFormat::Bgr => out.copy_from_slice(&[b, g, r]),
            _ => out[0] = 0.299 * r + 0.587 * g + 0.114 * b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wrap {
    #[default]
    ClampToEdge,
    Zero,
    Repeat,
}

impl Wrap {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Wrap::ClampToEdge),
            1 => Some(Wrap::Zero),
            2 => Some(Wrap::Repeat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageProcessConfig {
    pub filter: Filter,
    pub source_format: ImageFormat,
    pub dest_format: ImageFormat,
    pub mean: [f32; 4],
    pub normal: [f32; 4],
    pub wrap: Wrap,
}

impl Default for ImageProcessConfig {
    fn default() -> Self {
        Self {
            filter: Filter::Nearest,
            source_format: ImageFormat::Rgba,
            dest_format: ImageFormat::Rgba,
            mean: [0.0; 4],
            normal: [1.0; 4],
            wrap: Wrap::ClampToEdge,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageProcess {
    config: ImageProcessConfig,
    matrix: Matrix,
    padding: u8,
}

impl ImageProcess {
    pub fn new(config: ImageProcessConfig) -> Result<Self> {
        for format in [config.source_format, config.dest_format] {
            if format.channels().is_none() {
                return Err(RuntimeError::not_supported(format!("image format {:?}", format)));
            }
        }
        if config.filter == Filter::Bicubic {
            return Err(RuntimeError::not_supported("bicubic filter"));
        }
        Ok(Self {
            config,
            matrix: Matrix::identity(),
            padding: 0,
        })
    }

    pub fn config(&self) -> &ImageProcessConfig {
        &self.config
    }

    /// Matrix mapping destination coordinates to source coordinates.
    pub fn set_matrix(&mut self, matrix: Matrix) {
        self.matrix = matrix;
    }

    pub fn matrix(&self) -> &Matrix {
        &self.matrix
    }

    /// Value used for out-of-range samples with [`Wrap::Zero`].
    pub fn set_padding(&mut self, value: u8) {
        self.padding = value;
    }

    /// Convert `source` (`iw` x `ih` pixels, `stride` bytes per row, zero
    /// meaning tightly packed) into batch 0 of `dest`.
    pub fn convert(&self, source: &[u8], iw: usize, ih: usize, stride: usize, dest: &mut Tensor) -> Result<()> {
        let src_channels = self.config.source_format.channels().unwrap_or(1);
        let dst_channels = self.config.dest_format.channels().unwrap_or(1);
        let stride = if stride == 0 { iw * src_channels } else { stride };
        if iw == 0 || ih == 0 {
            return Err(RuntimeError::invalid("empty source image"));
        }
        let needed = stride * (ih - 1) + iw * src_channels;
        if source.len() < needed {
            return Err(RuntimeError::InputData {
                expected: needed,
                actual: source.len(),
            });
        }
        if dest.channel() as usize != dst_channels {
            return Err(RuntimeError::invalid(format!(
                "destination has {} channels, format {:?} needs {}",
                dest.channel(),
                self.config.dest_format,
                dst_channels
            )));
        }

        let (ow, oh) = (dest.width().max(0) as usize, dest.height().max(0) as usize);
        let nhwc = dest.dim_type() == DimensionType::Tensorflow;
        let dtype = dest.dtype();
        let mut pixels = vec![0.0f32; ow * oh * dst_channels];
        let mut sample = vec![0.0f32; src_channels];
        let mut converted = vec![0.0f32; dst_channels];

        for y in 0..oh {
            for x in 0..ow {
                let (sx, sy) = self.matrix.map_point(x as f32, y as f32);
                self.sample(source, iw, ih, stride, src_channels, sx, sy, &mut sample);
                if self.config.source_format == self.config.dest_format {
                    converted.copy_from_slice(&sample);
                } else {
                    let rgba = self.config.source_format.to_rgba(&sample);
                    self.config.dest_format.pack_rgba(rgba, &mut converted);
                }
                for c in 0..dst_channels {
                    let v = (converted[c] - self.config.mean[c]) * self.config.normal[c];
                    let index = if nhwc {
                        (y * ow + x) * dst_channels + c
                    } else {
                        (c * oh + y) * ow + x
                    };
                    pixels[index] = v;
                }
            }
        }

        if dtype.is_f32() {
            dest.as_f32_mut()?[..pixels.len()].copy_from_slice(&pixels);
        } else if dtype == TypeTag::U8 {
            for (out, v) in dest.bytes_mut().iter_mut().zip(&pixels) {
                *out = v.round().clamp(0.0, 255.0) as u8;
            }
        } else {
            return Err(RuntimeError::TensorNotSupport(format!("{:?} image destination", dtype)));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn texel(&self, source: &[u8], iw: usize, ih: usize, stride: usize, channels: usize, x: i64, y: i64, c: usize) -> f32 {
        let resolve = |v: i64, extent: usize| -> Option<usize> {
            let extent = extent as i64;
            match self.config.wrap {
                Wrap::ClampToEdge => Some(v.clamp(0, extent - 1) as usize),
                Wrap::Repeat => Some(v.rem_euclid(extent) as usize),
                Wrap::Zero => (0..extent).contains(&v).then_some(v as usize),
            }
        };
        match (resolve(x, iw), resolve(y, ih)) {
            (Some(x), Some(y)) => source[y * stride + x * channels + c] as f32,
            _ => self.padding as f32,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn sample(&self, source: &[u8], iw: usize, ih: usize, stride: usize, channels: usize, sx: f32, sy: f32, out: &mut [f32]) {
        match self.config.filter {
            Filter::Nearest | Filter::Bicubic => {
                let (x, y) = ((sx + 0.5).floor() as i64, (sy + 0.5).floor() as i64);
                for (c, o) in out.iter_mut().enumerate() {
                    *o = self.texel(source, iw, ih, stride, channels, x, y, c);
                }
            }
            Filter::Bilinear => {
                let (x0, y0) = (sx.floor(), sy.floor());
                let (fx, fy) = (sx - x0, sy - y0);
                let (x0, y0) = (x0 as i64, y0 as i64);
                for (c, o) in out.iter_mut().enumerate() {
                    let t = |dx: i64, dy: i64| self.texel(source, iw, ih, stride, channels, x0 + dx, y0 + dy, c);
                    let top = t(0, 0) * (1.0 - fx) + t(1, 0) * fx;
                    let bottom = t(0, 1) * (1.0 - fx) + t(1, 1) * fx;
                    *o = top * (1.0 - fy) + bottom * fy;
                }
            }
        }
    }
}

/// Tensor for holding an 8-bit image: `[1, h, w, bpp]`, NHWC.
pub fn create_image_tensor(dtype: TypeTag, width: i32, height: i32, bpp: i32, data: Option<&[u8]>) -> Result<Tensor> {
    if width <= 0 || height <= 0 || bpp <= 0 {
        return Err(RuntimeError::invalid(format!("image {}x{}x{}", width, height, bpp)));
    }
    let shape = vec![1, height, width, bpp];
    match data {
        Some(bytes) => Tensor::from_host_bytes(shape, dtype, bytes, DimensionType::Tensorflow),
        None => Tensor::new(shape, dtype, DimensionType::Tensorflow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rgb_2x2() -> Vec<u8> {
        vec![
            10, 20, 30, 40, 50, 60, //
            70, 80, 90, 100, 110, 120,
        ]
    }

    #[test]
    fn test_unsupported_format() {
        let config = ImageProcessConfig {
            source_format: ImageFormat::YuvNv21,
            ..Default::default()
        };
        assert!(matches!(ImageProcess::new(config), Err(RuntimeError::NotSupport(_))));
    }

    #[test]
    fn test_rgb_to_bgr_nchw_normalised() {
        let process = ImageProcess::new(ImageProcessConfig {
            source_format: ImageFormat::Rgb,
            dest_format: ImageFormat::Bgr,
            mean: [10.0, 0.0, 0.0, 0.0],
            normal: [0.5, 1.0, 1.0, 1.0],
            ..Default::default()
        })
        .unwrap();
        let mut dest = Tensor::new(vec![1, 3, 2, 2], TypeTag::F32, DimensionType::Caffe).unwrap();
        process.convert(&rgb_2x2(), 2, 2, 0, &mut dest).unwrap();
        let out = dest.as_f32().unwrap();
        // channel 0 is blue: (b - 10) * 0.5
        assert_eq!(&out[0..4], &[10.0, 25.0, 40.0, 55.0]);
        // channel 2 is red, untouched
        assert_eq!(&out[8..12], &[10.0, 40.0, 70.0, 100.0]);
    }

    #[test]
    fn test_gray_u8_output() {
        let process = ImageProcess::new(ImageProcessConfig {
            source_format: ImageFormat::Rgb,
            dest_format: ImageFormat::Gray,
            ..Default::default()
        })
        .unwrap();
        let mut dest = create_image_tensor(TypeTag::U8, 2, 2, 1, None).unwrap();
        process.convert(&[100; 12], 2, 2, 0, &mut dest).unwrap();
        assert_eq!(dest.bytes(), &[100, 100, 100, 100]);
    }

    #[test]
    fn test_zero_wrap_uses_padding() {
        let mut process = ImageProcess::new(ImageProcessConfig {
            source_format: ImageFormat::Gray,
            dest_format: ImageFormat::Gray,
            wrap: Wrap::Zero,
            ..Default::default()
        })
        .unwrap();
        process.set_padding(7);
        process.set_matrix(Matrix::make_translate(1.0, 0.0));
        let mut dest = create_image_tensor(TypeTag::F32, 2, 1, 1, None).unwrap();
        process.convert(&[1, 2], 2, 1, 0, &mut dest).unwrap();
        assert_eq!(dest.as_f32().unwrap(), &[2.0, 7.0]);
    }

    #[test]
    fn test_bilinear_midpoint() {
        let mut process = ImageProcess::new(ImageProcessConfig {
            filter: Filter::Bilinear,
            source_format: ImageFormat::Gray,
            dest_format: ImageFormat::Gray,
            ..Default::default()
        })
        .unwrap();
        process.set_matrix(Matrix::make_translate(0.5, 0.0));
        let mut dest = create_image_tensor(TypeTag::F32, 1, 1, 1, None).unwrap();
        process.convert(&[0, 100], 2, 1, 0, &mut dest).unwrap();
        assert_eq!(dest.as_f32().unwrap(), &[50.0]);
    }

    #[test]
    fn test_short_source_rejected() {
        let process = ImageProcess::new(ImageProcessConfig::default()).unwrap();
        let mut dest = create_image_tensor(TypeTag::F32, 2, 2, 4, None).unwrap();
        assert!(matches!(
            process.convert(&[0; 8], 2, 2, 0, &mut dest),
            Err(RuntimeError::InputData { expected: 16, actual: 8 })
        ));
    }
}
