use crate::ConvertError;
use gadgetcam_core::prelude::Rotation;
use rayon::prelude::*;
use yuvutils_rs::{BufferStoreMut, YuvPlanarImageMut, YuvRange, YuvStandardMatrix};

/// Borrowed planes of a CPU-locked planar YUV 4:2:0 camera buffer.
///
/// Semi-planar layouts are expressed through `uv_pixel_stride`: for NV12
/// style chroma the `u` and `v` slices overlap, offset by one byte, with a
/// pixel stride of 2.
#[derive(Debug, Clone, Copy)]
pub struct PlanarYuvFrame<'a> {
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub y_stride: usize,
    pub u_stride: usize,
    pub v_stride: usize,
    pub uv_pixel_stride: usize,
}

/// Borrowed pixels of a CPU-locked RGBA8888 camera buffer.
#[derive(Debug, Clone, Copy)]
pub struct RgbaFrame<'a> {
    pub data: &'a [u8],
    pub stride: usize,
}

/// The plane layout of a locked camera buffer.
#[derive(Debug, Clone, Copy)]
pub enum SourcePlanes<'a> {
    Yuv(PlanarYuvFrame<'a>),
    Rgba(RgbaFrame<'a>),
}

/// A camera buffer locked for CPU read.
///
/// Implementations keep the underlying hardware lock alive for as long as
/// the value exists; dropping the last reference releases it.
pub trait LockedFrame: Send + Sync {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn planes(&self) -> SourcePlanes<'_>;
}

/// Intermediate fully-planar I420 image owned by the encoder.
///
/// Backed by one contiguous allocation (Y, then U, then V) so it can be
/// handed to the JPEG compressor without copying.
pub struct I420Planes {
    data: Vec<u8>,
    width: usize,
    height: usize,
}

impl I420Planes {
    pub fn new(width: u32, height: u32) -> Result<Self, ConvertError> {
        if width == 0 || height == 0 {
            return Err(ConvertError::InvalidGeometry { width, height });
        }
        let (w, h) = (width as usize, height as usize);
        let chroma = chroma_dims(w, h);
        let len = w * h + 2 * chroma.0 * chroma.1;
        Ok(Self {
            data: vec![0; len],
            width: w,
            height: h,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn y_stride(&self) -> usize {
        self.width
    }

    pub fn chroma_stride(&self) -> usize {
        self.width.div_ceil(2)
    }

    /// Contiguous Y+U+V bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn planes(&self) -> (&[u8], &[u8], &[u8]) {
        let (cw, ch) = chroma_dims(self.width, self.height);
        let (y, uv) = self.data.split_at(self.width * self.height);
        let (u, v) = uv.split_at(cw * ch);
        (y, u, v)
    }

    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        let (cw, ch) = chroma_dims(self.width, self.height);
        let (y, uv) = self.data.split_at_mut(self.width * self.height);
        let (u, v) = uv.split_at_mut(cw * ch);
        (y, u, v)
    }
}

fn chroma_dims(width: usize, height: usize) -> (usize, usize) {
    (width.div_ceil(2), height.div_ceil(2))
}

/// Copy a planar (or semi-planar) YUV 4:2:0 source into the I420 scratch,
/// optionally rotating by 180 degrees.
///
/// The source geometry must match the scratch geometry; plane lengths are
/// validated against strides before any row is touched.
pub fn android420_to_i420(
    src: &PlanarYuvFrame<'_>,
    dst: &mut I420Planes,
    rotation: Rotation,
) -> Result<(), ConvertError> {
    let w = dst.width();
    let h = dst.height();
    let (cw, ch) = chroma_dims(w, h);
    let ps = src.uv_pixel_stride;
    if ps == 0 {
        return Err(ConvertError::InvalidPixelStride(ps));
    }
    if src.y.len() < (h - 1) * src.y_stride + w {
        return Err(ConvertError::PlaneTooShort { plane: "y" });
    }
    let chroma_needed = |stride: usize| (ch - 1) * stride + (cw - 1) * ps + 1;
    if src.u.len() < chroma_needed(src.u_stride) {
        return Err(ConvertError::PlaneTooShort { plane: "u" });
    }
    if src.v.len() < chroma_needed(src.v_stride) {
        return Err(ConvertError::PlaneTooShort { plane: "v" });
    }

    let (y_dst, u_dst, v_dst) = dst.planes_mut();
    y_dst.par_chunks_mut(w).enumerate().for_each(|(row, out)| {
        match rotation {
            Rotation::Deg0 => {
                out.copy_from_slice(&src.y[row * src.y_stride..][..w]);
            }
            Rotation::Deg180 => {
                let line = &src.y[(h - 1 - row) * src.y_stride..][..w];
                for (x, value) in out.iter_mut().enumerate() {
                    *value = line[w - 1 - x];
                }
            }
        }
    });

    u_dst
        .par_chunks_mut(cw)
        .zip(v_dst.par_chunks_mut(cw))
        .enumerate()
        .for_each(|(row, (u_out, v_out))| {
            let src_row = match rotation {
                Rotation::Deg0 => row,
                Rotation::Deg180 => ch - 1 - row,
            };
            let u_line = &src.u[src_row * src.u_stride..];
            let v_line = &src.v[src_row * src.v_stride..];
            for x in 0..cw {
                let src_x = match rotation {
                    Rotation::Deg0 => x,
                    Rotation::Deg180 => cw - 1 - x,
                };
                u_out[x] = u_line[src_x * ps];
                v_out[x] = v_line[src_x * ps];
            }
        });

    Ok(())
}

/// Convert an RGBA8888 source into the I420 scratch.
///
/// Rotation is not applied on this path; RGBA sources are never rotated
/// upstream.
pub fn rgba_to_i420(src: &RgbaFrame<'_>, dst: &mut I420Planes) -> Result<(), ConvertError> {
    let w = dst.width();
    let h = dst.height();
    let (cw, _) = chroma_dims(w, h);
    if src.stride < w * 4 {
        return Err(ConvertError::PlaneTooShort { plane: "rgba" });
    }
    let required = (h - 1) * src.stride + w * 4;
    if src.data.len() < required {
        return Err(ConvertError::PlaneTooShort { plane: "rgba" });
    }
    let pixels = &src.data[..required];

    {
        let (y_dst, u_dst, v_dst) = dst.planes_mut();
        let mut planar = YuvPlanarImageMut {
            y_plane: BufferStoreMut::Borrowed(y_dst),
            y_stride: w as u32,
            u_plane: BufferStoreMut::Borrowed(u_dst),
            u_stride: cw as u32,
            v_plane: BufferStoreMut::Borrowed(v_dst),
            v_stride: cw as u32,
            width: w as u32,
            height: h as u32,
        };
        if yuvutils_rs::rgba_to_yuv420(
            &mut planar,
            pixels,
            src.stride as u32,
            YuvRange::Full,
            YuvStandardMatrix::Bt601,
            yuvutils_rs::YuvConversionMode::Balanced,
        )
        .is_ok()
        {
            return Ok(());
        }
    }

    let stride = src.stride;
    let (y_dst, u_dst, v_dst) = dst.planes_mut();
    y_dst.par_chunks_mut(w).enumerate().for_each(|(row, out)| {
        let line = &pixels[row * stride..][..w * 4];
        for (x, value) in out.iter_mut().enumerate() {
            let px = &line[x * 4..][..3];
            *value = luma(px[0] as i32, px[1] as i32, px[2] as i32);
        }
    });
    u_dst
        .par_chunks_mut(cw)
        .zip(v_dst.par_chunks_mut(cw))
        .enumerate()
        .for_each(|(row, (u_out, v_out))| {
            for x in 0..cw {
                // Average the 2x2 block, clamping at the right/bottom edge.
                let (mut r, mut g, mut b) = (0i32, 0i32, 0i32);
                for dy in 0..2 {
                    for dx in 0..2 {
                        let sy = (row * 2 + dy).min(h - 1);
                        let sx = (x * 2 + dx).min(w - 1);
                        let px = &pixels[sy * stride + sx * 4..][..3];
                        r += px[0] as i32;
                        g += px[1] as i32;
                        b += px[2] as i32;
                    }
                }
                let (r, g, b) = (r / 4, g / 4, b / 4);
                u_out[x] = clamp_u8(((-43 * r - 85 * g + 128 * b) >> 8) + 128);
                v_out[x] = clamp_u8(((128 * r - 107 * g - 21 * b) >> 8) + 128);
            }
        });

    Ok(())
}

#[inline]
fn luma(r: i32, g: i32, b: i32) -> u8 {
    clamp_u8((77 * r + 150 * g + 29 * b) >> 8)
}

#[inline]
fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Pack the I420 scratch into YUY2 (Y0 U Y1 V), returning the number of
/// bytes written (`width * height * 2`).
pub fn i420_to_yuyv(src: &I420Planes, dst: &mut [u8]) -> Result<usize, ConvertError> {
    let w = src.width();
    let h = src.height();
    if w % 2 != 0 {
        return Err(ConvertError::InvalidGeometry {
            width: w as u32,
            height: h as u32,
        });
    }
    let need = w * h * 2;
    if dst.len() < need {
        return Err(ConvertError::DestinationTooShort {
            need,
            have: dst.len(),
        });
    }
    let (y, u, v) = src.planes();
    let cw = src.chroma_stride();
    dst[..need]
        .par_chunks_mut(w * 2)
        .enumerate()
        .for_each(|(row, out)| {
            let y_line = &y[row * w..][..w];
            let u_line = &u[(row / 2) * cw..][..cw];
            let v_line = &v[(row / 2) * cw..][..cw];
            for pair in 0..w / 2 {
                let o = pair * 4;
                out[o] = y_line[pair * 2];
                out[o + 1] = u_line[pair];
                out[o + 2] = y_line[pair * 2 + 1];
                out[o + 3] = v_line[pair];
            }
        });
    Ok(need)
}
