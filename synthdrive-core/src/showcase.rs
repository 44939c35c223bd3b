//! Side-by-side triptych of input, edge lock and synthetic output.

use std::path::Path;

use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use tracing::{info, warn};

use crate::error::Result;

pub const PANEL_SIZE: u32 = 512;
pub const BAR_WIDTH: u32 = 20;
pub const SHOWCASE_WIDTH: u32 = PANEL_SIZE * 3 + BAR_WIDTH * 2;

const LABEL_X: u32 = 20;
const LABEL_BASELINE: u32 = 480;
const GLYPH_SCALE: u32 = 3;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const LABELS: [(&str, Rgb<u8>); 3] = [
    ("Input Data", Rgb([0, 255, 0])),
    ("ControlNet Lock", WHITE),
    ("Synthetic Output", Rgb([255, 255, 0])),
];

/// Loads the three images, composes them and writes the showcase to
/// `output`, overwriting it. Returns `false` on any read or write failure.
pub fn assemble(
    original: impl AsRef<Path>,
    edges: impl AsRef<Path>,
    result: impl AsRef<Path>,
    output: impl AsRef<Path>,
) -> bool {
    let output = output.as_ref();
    match try_assemble(original.as_ref(), edges.as_ref(), result.as_ref(), output) {
        Ok(()) => {
            info!(path = %output.display(), "showcase saved");
            true
        }
        Err(err) => {
            warn!("could not assemble showcase: {err}");
            false
        }
    }
}

fn try_assemble(original: &Path, edges: &Path, result: &Path, output: &Path) -> Result<()> {
    let original = image::open(original)?.to_rgb8();
    let edges = image::open(edges)?.to_rgb8();
    let result = image::open(result)?.to_rgb8();
    compose(&original, &edges, &result).save(output)?;
    Ok(())
}

/// Resizes each image to a square panel, labels it, and joins the panels
/// with white bars.
pub fn compose(original: &RgbImage, edges: &RgbImage, result: &RgbImage) -> RgbImage {
    let mut canvas = RgbImage::from_pixel(SHOWCASE_WIDTH, PANEL_SIZE, WHITE);
    for (index, (image, (label, color))) in [original, edges, result]
        .into_iter()
        .zip(LABELS)
        .enumerate()
    {
        let mut panel = imageops::resize(image, PANEL_SIZE, PANEL_SIZE, FilterType::Triangle);
        draw_label(&mut panel, label, color);
        let x = index as u32 * (PANEL_SIZE + BAR_WIDTH);
        imageops::replace(&mut canvas, &panel, x as i64, 0);
    }
    canvas
}

fn draw_label(panel: &mut RgbImage, text: &str, color: Rgb<u8>) {
    let top = LABEL_BASELINE.saturating_sub(GLYPH_ROWS as u32 * GLYPH_SCALE);
    let advance = (GLYPH_COLS + 1) * GLYPH_SCALE;
    for (i, ch) in text.chars().enumerate() {
        let Some(rows) = glyph(ch) else { continue };
        let left = LABEL_X + i as u32 * advance;
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_COLS {
                if bits & (1 << (GLYPH_COLS - 1 - col)) == 0 {
                    continue;
                }
                let x0 = left + col * GLYPH_SCALE;
                let y0 = top + row as u32 * GLYPH_SCALE;
                for y in y0..y0 + GLYPH_SCALE {
                    for x in x0..x0 + GLYPH_SCALE {
                        if x < panel.width() && y < panel.height() {
                            panel.put_pixel(x, y, color);
                        }
                    }
                }
            }
        }
    }
}

const GLYPH_COLS: u32 = 5;
const GLYPH_ROWS: usize = 7;

/// 5x7 capitals; lowercase is drawn as uppercase, anything else as a gap.
fn glyph(ch: char) -> Option<&'static [u8; GLYPH_ROWS]> {
    let ch = ch.to_ascii_uppercase();
    ch.is_ascii_uppercase()
        .then(|| &FONT[(ch as u8 - b'A') as usize])
}

#[rustfmt::skip]
static FONT: [[u8; GLYPH_ROWS]; 26] = [
    [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11], // A
    [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E], // B
    [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E], // C
    [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E], // D
    [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F], // E
    [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10], // F
    [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F], // G
    [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11], // H
    [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E], // I
    [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C], // J
    [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11], // K
    [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F], // L
    [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11], // M
    [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11], // N
    [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E], // O
    [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10], // P
    [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D], // Q
    [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11], // R
    [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E], // S
    [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04], // T
    [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E], // U
    [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04], // V
    [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A], // W
    [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11], // X
    [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04], // Y
    [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F], // Z
];

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn solid(w: u32, h: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([value, value, value]))
    }

    fn count(
        img: &RgbImage,
        x: std::ops::Range<u32>,
        y: std::ops::Range<u32>,
        color: Rgb<u8>,
    ) -> usize {
        y.flat_map(|y| x.clone().map(move |x| (x, y)))
            .filter(|&(x, y)| *img.get_pixel(x, y) == color)
            .count()
    }

    #[test]
    fn composes_fixed_size_from_mixed_inputs() {
        let out = compose(&solid(640, 480, 0), &solid(100, 100, 0), &solid(512, 768, 0));
        assert_eq!(out.dimensions(), (1576, 512));
        assert_eq!(SHOWCASE_WIDTH, 1576);
    }

    #[test]
    fn bars_are_white() {
        let out = compose(&solid(64, 64, 0), &solid(64, 64, 0), &solid(64, 64, 0));
        for x in [512, 531, 1044, 1063] {
            assert_eq!(*out.get_pixel(x, 10), WHITE);
        }
        assert_eq!(*out.get_pixel(511, 10), Rgb([0, 0, 0]));
        assert_eq!(*out.get_pixel(532, 10), Rgb([0, 0, 0]));
    }

    #[test]
    fn labels_sit_bottom_left_in_their_colors() {
        let out = compose(&solid(64, 64, 0), &solid(64, 64, 0), &solid(64, 64, 0));
        let band = 450..LABEL_BASELINE;
        assert!(count(&out, 20..400, band.clone(), Rgb([0, 255, 0])) > 0);
        assert!(count(&out, 552..900, band.clone(), WHITE) > 0);
        assert!(count(&out, 1084..1500, band, Rgb([255, 255, 0])) > 0);
        // nothing above the label band
        assert_eq!(count(&out, 0..512, 0..400, Rgb([0, 255, 0])), 0);
    }

    #[rstest]
    #[case::original(0)]
    #[case::edges(1)]
    #[case::result(2)]
    fn unreadable_input_returns_false(#[case] broken: usize) {
        let tmp = tempfile::tempdir().unwrap();
        let good = tmp.path().join("good.png");
        solid(32, 32, 128).save(&good).unwrap();
        let missing = tmp.path().join("missing.png");
        let mut paths = [&good, &good, &good];
        paths[broken] = &missing;
        let target = tmp.path().join("showcase.png");
        assert!(!assemble(paths[0], paths[1], paths[2], &target));
        assert!(!target.exists());
    }

    #[test]
    fn writes_and_overwrites_output() {
        let tmp = tempfile::tempdir().unwrap();
        let good = tmp.path().join("good.png");
        solid(300, 200, 90).save(&good).unwrap();
        let target = tmp.path().join("showcase.png");
        solid(8, 8, 0).save(&target).unwrap();
        assert!(assemble(&good, &good, &good, &target));
        let written = image::open(&target).unwrap();
        assert_eq!((written.width(), written.height()), (1576, 512));
    }
}
