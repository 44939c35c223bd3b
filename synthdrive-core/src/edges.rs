//! Canny edge extraction for the geometry-locking control image.
//!
//! The detector runs directly on the RGB input: gradients are computed per
//! channel with a 3×3 Sobel kernel and the channel with the strongest L1
//! magnitude wins, followed by non-maximum suppression and hysteresis. There
//! is no pre-blur. The single-channel mask is replicated into three identical
//! channels so the diffusion adapter can consume it as an RGB image.

use std::path::Path;

use image::{DynamicImage, Rgb, RgbImage};

use crate::error::Result;

pub const DEFAULT_LOW_THRESHOLD: f32 = 100.0;
pub const DEFAULT_HIGH_THRESHOLD: f32 = 200.0;

const EDGE: u8 = 255;

// tan(22.5°) and tan(67.5°)
const TAN_22_5: f32 = 0.414_213_57;
const TAN_67_5: f32 = 2.414_213_6;

/// Binary edge mask stored as a three-channel raster.
///
/// Always has the same dimensions as the image it was extracted from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeMap(RgbImage);

impl EdgeMap {
    pub fn image(&self) -> &RgbImage {
        &self.0
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }

    /// Number of pixels marked as edges.
    pub fn edge_count(&self) -> usize {
        self.0.pixels().filter(|p| p.0[0] == EDGE).count()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.0.save(path)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EdgeExtractor {
    low: f32,
    high: f32,
}

impl Default for EdgeExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_LOW_THRESHOLD, DEFAULT_HIGH_THRESHOLD)
    }
}

impl EdgeExtractor {
    /// Thresholds are on the L1 gradient magnitude of 8-bit intensities.
    pub fn new(low: f32, high: f32) -> Self {
        let (low, high) = if low > high { (high, low) } else { (low, high) };
        Self { low, high }
    }

    /// Returns the RGB original alongside its edge map.
    pub fn extract(&self, image: &DynamicImage) -> (RgbImage, EdgeMap) {
        let original = image.to_rgb8();
        let edges = self.edges(&original);
        (original, edges)
    }

    /// Decodes an image file and extracts its edges.
    pub fn extract_path(&self, path: impl AsRef<Path>) -> Result<(RgbImage, EdgeMap)> {
        let image = image::open(path)?;
        Ok(self.extract(&image))
    }

    pub fn edges(&self, rgb: &RgbImage) -> EdgeMap {
        let (width, height) = rgb.dimensions();
        let (w, h) = (width as usize, height as usize);
        let gradients = Gradients::compute(rgb);
        let candidates = self.suppress(&gradients, w, h);
        let mask = hysteresis(candidates, w, h);

        let mut out = RgbImage::new(width, height);
        for (idx, &on) in mask.iter().enumerate() {
            if on {
                out.put_pixel((idx % w) as u32, (idx / w) as u32, Rgb([EDGE; 3]));
            }
        }
        EdgeMap(out)
    }

    /// Non-maximum suppression with the double threshold folded in.
    fn suppress(&self, g: &Gradients, w: usize, h: usize) -> Vec<Candidate> {
        let mut out = vec![Candidate::None; w * h];
        for y in 0..h {
            for x in 0..w {
                let idx = y * w + x;
                let m = g.mag[idx];
                if m <= self.low {
                    continue;
                }
                let (dx, dy) = (g.dx[idx], g.dy[idx]);
                let (ax, ay) = (dx.abs(), dy.abs());
                let is_max = if ay < ax * TAN_22_5 {
                    m > g.at(x as isize - 1, y as isize) && m >= g.at(x as isize + 1, y as isize)
                } else if ay > ax * TAN_67_5 {
                    m > g.at(x as isize, y as isize - 1) && m >= g.at(x as isize, y as isize + 1)
                } else {
                    let s: isize = if (dx < 0.) != (dy < 0.) { -1 } else { 1 };
                    m > g.at(x as isize - s, y as isize - 1)
                        && m > g.at(x as isize + s, y as isize + 1)
                };
                if is_max {
                    out[idx] = if m > self.high {
                        Candidate::Strong
                    } else {
                        Candidate::Weak
                    };
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    None,
    Weak,
    Strong,
}

struct Gradients {
    dx: Vec<f32>,
    dy: Vec<f32>,
    mag: Vec<f32>,
    width: usize,
    height: usize,
}

impl Gradients {
    fn compute(rgb: &RgbImage) -> Self {
        let (width, height) = (rgb.width() as usize, rgb.height() as usize);
        let mut dx = vec![0f32; width * height];
        let mut dy = vec![0f32; width * height];
        let mut mag = vec![0f32; width * height];

        let px = |x: isize, y: isize, c: usize| -> f32 {
            let x = x.clamp(0, width as isize - 1) as u32;
            let y = y.clamp(0, height as isize - 1) as u32;
            rgb.get_pixel(x, y).0[c] as f32
        };

        for y in 0..height as isize {
            for x in 0..width as isize {
                let idx = y as usize * width + x as usize;
                for c in 0..3 {
                    let gx = (px(x + 1, y - 1, c) + 2. * px(x + 1, y, c) + px(x + 1, y + 1, c))
                        - (px(x - 1, y - 1, c) + 2. * px(x - 1, y, c) + px(x - 1, y + 1, c));
                    let gy = (px(x - 1, y + 1, c) + 2. * px(x, y + 1, c) + px(x + 1, y + 1, c))
                        - (px(x - 1, y - 1, c) + 2. * px(x, y - 1, c) + px(x + 1, y - 1, c));
                    let m = gx.abs() + gy.abs();
                    if c == 0 || m > mag[idx] {
                        mag[idx] = m;
                        dx[idx] = gx;
                        dy[idx] = gy;
                    }
                }
            }
        }

        Self {
            dx,
            dy,
            mag,
            width,
            height,
        }
    }

    /// Magnitude with a zero frame around the image.
    fn at(&self, x: isize, y: isize) -> f32 {
        if x < 0 || y < 0 || x >= self.width as isize || y >= self.height as isize {
            0.
        } else {
            self.mag[y as usize * self.width + x as usize]
        }
    }
}

/// Keeps weak candidates that are 8-connected to a strong one.
fn hysteresis(candidates: Vec<Candidate>, w: usize, h: usize) -> Vec<bool> {
    let mut mask = vec![false; w * h];
    let mut stack: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| **c == Candidate::Strong)
        .map(|(idx, _)| idx)
        .collect();
    for &idx in &stack {
        mask[idx] = true;
    }

    while let Some(idx) = stack.pop() {
        let (x, y) = ((idx % w) as isize, (idx / w) as isize);
        for ny in y - 1..=y + 1 {
            for nx in x - 1..=x + 1 {
                if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                    continue;
                }
                let n = ny as usize * w + nx as usize;
                if !mask[n] && candidates[n] == Candidate::Weak {
                    mask[n] = true;
                    stack.push(n);
                }
            }
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn square(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let inside = x >= width / 4
                && x < 3 * width / 4
                && y >= height / 4
                && y < 3 * height / 4;
            if inside {
                Rgb([240, 240, 240])
            } else {
                Rgb([10, 10, 10])
            }
        })
    }

    #[rstest]
    #[case(3, 3)]
    #[case(64, 48)]
    #[case(257, 131)]
    fn edge_map_keeps_dimensions(#[case] width: u32, #[case] height: u32) {
        let img = DynamicImage::ImageRgb8(square(width, height));
        let (original, edges) = EdgeExtractor::default().extract(&img);
        assert_eq!(original.dimensions(), (width, height));
        assert_eq!(edges.dimensions(), (width, height));
    }

    #[test]
    fn extraction_is_deterministic() {
        let img = DynamicImage::ImageRgb8(square(96, 64));
        let extractor = EdgeExtractor::default();
        let (_, a) = extractor.extract(&img);
        let (_, b) = extractor.extract(&img);
        assert_eq!(a.image().as_raw(), b.image().as_raw());
    }

    #[test]
    fn solid_image_has_no_edges() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([90, 20, 200])));
        let (_, edges) = EdgeExtractor::default().extract(&img);
        assert_eq!(edges.edge_count(), 0);
    }

    #[test]
    fn square_outline_is_detected_with_identical_channels() {
        let img = DynamicImage::ImageRgb8(square(64, 64));
        let (_, edges) = EdgeExtractor::default().extract(&img);
        assert!(edges.edge_count() > 0);
        // far from the square boundary nothing fires
        assert_eq!(edges.image().get_pixel(2, 2).0, [0, 0, 0]);
        assert_eq!(edges.image().get_pixel(32, 32).0, [0, 0, 0]);
        for p in edges.image().pixels() {
            assert!(p.0 == [0, 0, 0] || p.0 == [255, 255, 255]);
        }
        // the left boundary column sits at x = 15/16
        let left = (0..64).filter(|&y| {
            let a = edges.image().get_pixel(15, y).0[0];
            let b = edges.image().get_pixel(16, y).0[0];
            a == EDGE || b == EDGE
        });
        assert!(left.count() >= 24);
    }

    #[test]
    fn strongest_channel_drives_detection() {
        // only the blue channel changes across the boundary
        let img = RgbImage::from_fn(32, 32, |x, _| {
            if x < 16 {
                Rgb([50, 50, 0])
            } else {
                Rgb([50, 50, 255])
            }
        });
        let edges = EdgeExtractor::default().edges(&img);
        assert!(edges.edge_count() >= 32);
    }

    #[test]
    fn swapped_thresholds_are_normalised() {
        let a = EdgeExtractor::new(200.0, 100.0);
        let img = square(40, 40);
        assert_eq!(a.edges(&img), EdgeExtractor::default().edges(&img));
    }

    #[test]
    fn unreadable_path_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let bogus = tmp.path().join("not-an-image.png");
        std::fs::write(&bogus, b"definitely not png").unwrap();
        assert!(EdgeExtractor::default().extract_path(&bogus).is_err());
    }
}
