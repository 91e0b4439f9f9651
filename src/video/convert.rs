//! Pixel layout conversion between decoded I420 and the transform's BGR24
//!
//! Integer BT.601 limited-range coefficients, the same ones the browser's
//! encoder assumes for untagged video. Chroma is subsampled 2x2; odd
//! dimensions round the chroma planes up.

use super::frame::{Frame, PixelLayout};

/// Plane sizes of an I420 buffer: (luma, chroma width, chroma height)
fn i420_geometry(width: usize, height: usize) -> (usize, usize, usize) {
    (width * height, width.div_ceil(2), height.div_ceil(2))
}

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Convert a tightly packed I420 buffer to interleaved BGR24
pub fn i420_to_bgr24(yuv: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (y_size, cw, ch) = i420_geometry(w, h);
    let (y_plane, chroma) = yuv.split_at(y_size);
    let (u_plane, v_plane) = chroma.split_at(cw * ch);

    let mut bgr = vec![0u8; w * h * 3];
    for row in 0..h {
        for col in 0..w {
            let c = (row / 2) * cw + col / 2;
            let y = y_plane[row * w + col] as i32 - 16;
            let u = u_plane[c] as i32 - 128;
            let v = v_plane[c] as i32 - 128;

            let y = 298 * y;
            let r = (y + 409 * v + 128) >> 8;
            let g = (y - 100 * u - 208 * v + 128) >> 8;
            let b = (y + 516 * u + 128) >> 8;

            let idx = (row * w + col) * 3;
            bgr[idx] = clamp_u8(b);
            bgr[idx + 1] = clamp_u8(g);
            bgr[idx + 2] = clamp_u8(r);
        }
    }
    bgr
}

/// Convert interleaved BGR24 to a tightly packed I420 buffer
///
/// Chroma is the average of each 2x2 block (edge blocks average what exists).
pub fn bgr24_to_i420(bgr: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (y_size, cw, ch) = i420_geometry(w, h);
    let mut yuv = vec![0u8; y_size + 2 * cw * ch];
    let (y_plane, chroma) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);

    for row in 0..h {
        for col in 0..w {
            let idx = (row * w + col) * 3;
            let (b, g, r) = (bgr[idx] as i32, bgr[idx + 1] as i32, bgr[idx + 2] as i32);
            y_plane[row * w + col] = clamp_u8(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16);
        }
    }

    for crow in 0..ch {
        for ccol in 0..cw {
            let (mut sr, mut sg, mut sb, mut n) = (0i32, 0i32, 0i32, 0i32);
            for row in (crow * 2)..((crow * 2 + 2).min(h)) {
                for col in (ccol * 2)..((ccol * 2 + 2).min(w)) {
                    let idx = (row * w + col) * 3;
                    sb += bgr[idx] as i32;
                    sg += bgr[idx + 1] as i32;
                    sr += bgr[idx + 2] as i32;
                    n += 1;
                }
            }
            let (r, g, b) = (sr / n, sg / n, sb / n);
            let c = crow * cw + ccol;
            u_plane[c] = clamp_u8(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128);
            v_plane[c] = clamp_u8(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128);
        }
    }
    yuv
}

/// Bring a frame into the transform's BGR24 layout, keeping its timestamp
pub fn to_bgr24(frame: Frame) -> Frame {
    match frame.layout() {
        PixelLayout::Bgr24 => frame,
        PixelLayout::I420 => {
            let (w, h, pts, tb) = (frame.width(), frame.height(), frame.pts(), frame.time_base());
            let bgr = i420_to_bgr24(frame.data(), w, h);
            Frame::from_parts(bgr, w, h, PixelLayout::Bgr24, pts, tb)
        }
    }
}

/// Bring a frame into I420 for the encoder, keeping its timestamp
pub fn to_i420(frame: Frame) -> Frame {
    match frame.layout() {
        PixelLayout::I420 => frame,
        PixelLayout::Bgr24 => {
            let (w, h, pts, tb) = (frame.width(), frame.height(), frame.pts(), frame.time_base());
            let yuv = bgr24_to_i420(frame.data(), w, h);
            Frame::from_parts(yuv, w, h, PixelLayout::I420, pts, tb)
        }
    }
}
