//! Border-connected black background removal.
//!
//! Only black pixels that can be reached from the image edge through other black
//! pixels are keyed out. Dark artwork enclosed by non-black pixels stays opaque.

use std::collections::VecDeque;

use crate::core::{CHANNELS, PixelBuffer};

/// Lenient blackness threshold. Video stickers are keyed with [`STRICT_BLACK_THRESHOLD`].
pub const DEFAULT_BLACK_THRESHOLD: u8 = 10;

/// Pure black only.
pub const STRICT_BLACK_THRESHOLD: u8 = 0;

const TRANSPARENT: [u8; 4] = [0, 0, 0, 0];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlphaKeyer {
    pub threshold: u8,
}

impl Default for AlphaKeyer {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_BLACK_THRESHOLD,
        }
    }
}

impl AlphaKeyer {
    pub fn new(threshold: u8) -> Self {
        Self { threshold }
    }

    pub fn apply(&self, src: &PixelBuffer) -> PixelBuffer {
        flood_fill_edge_black(src, self.threshold)
    }
}

/// Every RGB channel at or below `threshold`; alpha is ignored.
#[inline]
pub fn is_black(px: [u8; 4], threshold: u8) -> bool {
    px[0] <= threshold && px[1] <= threshold && px[2] <= threshold
}

/// Clear the black region connected to the border of `src` to fully transparent.
///
/// Breadth-first over 4-connected neighbours, seeded from every black border pixel.
/// Each pixel enters the queue at most once. The result is tightly packed.
pub fn flood_fill_edge_black(src: &PixelBuffer, threshold: u8) -> PixelBuffer {
    let mut out = src.clone().into_tight();
    let (w, h) = (out.width() as usize, out.height() as usize);
    if w == 0 || h == 0 {
        return out;
    }

    let black = |i: usize| -> bool {
        let x = (i % w) as u32;
        let y = (i / w) as u32;
        is_black(out.pixel(x, y), threshold)
    };

    let mut visited = vec![false; w * h];
    let mut queue = VecDeque::new();
    let seed = |i: usize, visited: &mut Vec<bool>, queue: &mut VecDeque<usize>| {
        if !visited[i] && black(i) {
            visited[i] = true;
            queue.push_back(i);
        }
    };

    for x in 0..w {
        seed(x, &mut visited, &mut queue);
        seed((h - 1) * w + x, &mut visited, &mut queue);
    }
    for y in 0..h {
        seed(y * w, &mut visited, &mut queue);
        seed(y * w + (w - 1), &mut visited, &mut queue);
    }

    let mut keyed = Vec::new();
    while let Some(i) = queue.pop_front() {
        keyed.push(i);
        let (x, y) = (i % w, i / w);
        if x > 0 {
            seed(i - 1, &mut visited, &mut queue);
        }
        if x + 1 < w {
            seed(i + 1, &mut visited, &mut queue);
        }
        if y > 0 {
            seed(i - w, &mut visited, &mut queue);
        }
        if y + 1 < h {
            seed(i + w, &mut visited, &mut queue);
        }
    }

    tracing::trace!(keyed = keyed.len(), total = w * h, "flood fill keyed pixels");
    for i in keyed {
        out.set_pixel((i % w) as u32, (i / w) as u32, TRANSPARENT);
    }
    debug_assert_eq!(out.as_bytes().len(), w * h * CHANNELS);
    out
}
