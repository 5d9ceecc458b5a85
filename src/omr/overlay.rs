use std::path::Path;

use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::draw_filled_circle_mut;

use super::{DetectionError, MarkPoint};

const MARKER_RADIUS: i32 = 25;
const MARKER_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Copy of `source` with a filled disc drawn over every detected centroid.
pub fn annotate_marks(source: &DynamicImage, marks: &[MarkPoint]) -> RgbImage {
    let mut canvas = source.to_rgb8();
    for mark in marks {
        draw_filled_circle_mut(&mut canvas, (mark.x, mark.y), MARKER_RADIUS, MARKER_COLOR);
    }
    canvas
}

/// Writes the annotated copy to `path`; the format follows the file extension.
pub fn write_overlay(
    path: &Path,
    source: &DynamicImage,
    marks: &[MarkPoint],
) -> Result<(), DetectionError> {
    annotate_marks(source, marks)
        .save(path)
        .map_err(|source| DetectionError::Overlay {
            path: path.to_path_buf(),
            source,
        })
}
