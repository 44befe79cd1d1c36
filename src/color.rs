use crate::{
    core::{CHANNELS, PixelBuffer},
    error::{StickerError, StickerResult},
};

/// One image plane as handed out by a decoder.
///
/// Semi-planar layouts (NV12/NV21) are expressed as two chroma planes with
/// `pixel_stride == 2` that point into the same interleaved bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plane {
    pub data: Vec<u8>,
    pub row_stride: usize,
    pub pixel_stride: usize,
}

impl Plane {
    pub fn tight(data: Vec<u8>, width: usize) -> Self {
        Self {
            data,
            row_stride: width,
            pixel_stride: 1,
        }
    }

    fn check(&self, name: &str, cols: usize, rows: usize) -> StickerResult<()> {
        if self.pixel_stride == 0 {
            return Err(StickerError::validation(format!(
                "{name} plane has zero pixel stride"
            )));
        }
        if cols == 0 || rows == 0 {
            return Ok(());
        }
        let last = (rows - 1) * self.row_stride + (cols - 1) * self.pixel_stride;
        if last >= self.data.len() {
            return Err(StickerError::validation(format!(
                "{name} plane holds {} bytes, needs at least {}",
                self.data.len(),
                last + 1
            )));
        }
        Ok(())
    }

    #[inline]
    fn at(&self, col: usize, row: usize) -> u8 {
        self.data[row * self.row_stride + col * self.pixel_stride]
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorRange {
    /// Studio swing, luma in 16..=235.
    #[default]
    Limited,
    Full,
}

/// 4:2:0 image: full resolution luma, chroma subsampled by two on both axes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Yuv420Image {
    pub width: u32,
    pub height: u32,
    pub y: Plane,
    pub u: Plane,
    pub v: Plane,
    pub range: ColorRange,
}

impl Yuv420Image {
    /// Split a tightly packed I420 frame (`Y`, then `U`, then `V`).
    pub fn from_i420(width: u32, height: u32, data: &[u8]) -> StickerResult<Self> {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let luma = w * h;
        let chroma = cw * ch;
        if data.len() < luma + 2 * chroma {
            return Err(StickerError::validation(format!(
                "i420 frame has {} bytes, expected {}",
                data.len(),
                luma + 2 * chroma
            )));
        }
        Ok(Self {
            width,
            height,
            y: Plane::tight(data[..luma].to_vec(), w),
            u: Plane::tight(data[luma..luma + chroma].to_vec(), cw),
            v: Plane::tight(data[luma + chroma..luma + 2 * chroma].to_vec(), cw),
            range: ColorRange::Limited,
        })
    }

    /// Expected byte length of a tight I420 frame.
    pub fn i420_len(width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        w * h + 2 * (w.div_ceil(2) * h.div_ceil(2))
    }
}

/// Convert a 4:2:0 image into opaque packed RGBA8 using BT.601 coefficients.
pub fn yuv420_to_rgba(img: &Yuv420Image) -> StickerResult<PixelBuffer> {
    let (w, h) = (img.width as usize, img.height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    img.y.check("luma", w, h)?;
    img.u.check("u", cw, ch)?;
    img.v.check("v", cw, ch)?;

    let mut out = vec![0u8; w * h * CHANNELS];
    for row in 0..h {
        for col in 0..w {
            let y = i32::from(img.y.at(col, row));
            let u = i32::from(img.u.at(col / 2, row / 2));
            let v = i32::from(img.v.at(col / 2, row / 2));
            let [r, g, b] = match img.range {
                ColorRange::Limited => bt601_limited(y, u, v),
                ColorRange::Full => bt601_full(y, u, v),
            };
            let i = (row * w + col) * CHANNELS;
            out[i] = r;
            out[i + 1] = g;
            out[i + 2] = b;
            out[i + 3] = 255;
        }
    }
    PixelBuffer::from_rgba(img.width, img.height, out)
}

fn bt601_limited(y: i32, u: i32, v: i32) -> [u8; 3] {
    let c = (y - 16).max(0) * 298;
    let d = u - 128;
    let e = v - 128;
    [
        clamp_u8((c + 409 * e + 128) >> 8),
        clamp_u8((c - 100 * d - 208 * e + 128) >> 8),
        clamp_u8((c + 516 * d + 128) >> 8),
    ]
}

fn bt601_full(y: i32, u: i32, v: i32) -> [u8; 3] {
    let c = y << 8;
    let d = u - 128;
    let e = v - 128;
    [
        clamp_u8((c + 359 * e + 128) >> 8),
        clamp_u8((c - 88 * d - 183 * e + 128) >> 8),
        clamp_u8((c + 454 * d + 128) >> 8),
    ]
}

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_i420(w: u32, h: u32, y: u8, u: u8, v: u8) -> Yuv420Image {
        let (cw, ch) = ((w as usize).div_ceil(2), (h as usize).div_ceil(2));
        let mut data = vec![y; (w * h) as usize];
        data.extend(std::iter::repeat_n(u, cw * ch));
        data.extend(std::iter::repeat_n(v, cw * ch));
        Yuv420Image::from_i420(w, h, &data).unwrap()
    }

    #[test]
    fn limited_range_black_and_white() {
        let black = yuv420_to_rgba(&solid_i420(4, 4, 16, 128, 128)).unwrap();
        assert_eq!(black.pixel(0, 0), [0, 0, 0, 255]);
        let white = yuv420_to_rgba(&solid_i420(4, 4, 235, 128, 128)).unwrap();
        assert_eq!(white.pixel(3, 3), [255, 255, 255, 255]);
    }

    #[test]
    fn limited_range_red_is_red() {
        // BT.601 studio-swing red.
        let red = yuv420_to_rgba(&solid_i420(2, 2, 81, 90, 240)).unwrap();
        let [r, g, b, a] = red.pixel(1, 1);
        assert!(r >= 250, "r={r}");
        assert!(g <= 5, "g={g}");
        assert!(b <= 5, "b={b}");
        assert_eq!(a, 255);
    }

    #[test]
    fn odd_dimensions_round_chroma_up() {
        assert_eq!(Yuv420Image::i420_len(3, 3), 9 + 2 * 4);
        let img = solid_i420(3, 3, 16, 128, 128);
        let rgba = yuv420_to_rgba(&img).unwrap();
        assert_eq!(rgba.width(), 3);
        assert_eq!(rgba.pixel(2, 2), [0, 0, 0, 255]);
    }

    #[test]
    fn semi_planar_chroma_is_sampled_with_pixel_stride() {
        // NV12: interleaved UV, two chroma samples per row.
        let y = Plane::tight(vec![235; 16], 4);
        let uv = vec![128u8; 8];
        let img = Yuv420Image {
            width: 4,
            height: 4,
            y,
            u: Plane {
                data: uv.clone(),
                row_stride: 4,
                pixel_stride: 2,
            },
            v: Plane {
                data: uv[1..].to_vec(),
                row_stride: 4,
                pixel_stride: 2,
            },
            range: ColorRange::Limited,
        };
        let rgba = yuv420_to_rgba(&img).unwrap();
        assert_eq!(rgba.pixel(3, 3), [255, 255, 255, 255]);
    }

    #[test]
    fn short_plane_is_rejected() {
        let img = Yuv420Image {
            width: 4,
            height: 4,
            y: Plane::tight(vec![0; 15], 4),
            u: Plane::tight(vec![128; 4], 2),
            v: Plane::tight(vec![128; 4], 2),
            range: ColorRange::Full,
        };
        assert!(yuv420_to_rgba(&img).is_err());
    }
}
