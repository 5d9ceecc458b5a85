//! Detects coloured marker fills on a scanned sheet and reduces each one to an
//! integer centroid.
//!
//! Pipeline: RGB -> HSV threshold -> erosion -> morphological open -> close ->
//! external contours -> polygon moments.

use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage, Luma, RgbImage};
use imageproc::contours::{BorderType, find_contours};
use imageproc::distance_transform::Norm;
use imageproc::morphology;
use imageproc::point::Point;
use palette::{Hsv, IntoColor, Srgb};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::MarkPoint;

// 5x5 square erosion, 25x25 elliptical open, 7x7 elliptical close at ~700 DPI.
const ERODE_RADIUS: u8 = 2;
const OPEN_RADIUS: u8 = 12;
const CLOSE_RADIUS: u8 = 3;

/// Axis-aligned box in HSV space. Hue is in degrees; a range with
/// `hue_min > hue_max` wraps through 0°. Saturation and value are in `0..=1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HsvRange {
    pub hue_min: f32,
    pub hue_max: f32,
    pub saturation_min: f32,
    pub saturation_max: f32,
    pub value_min: f32,
    pub value_max: f32,
}

impl HsvRange {
    pub fn contains(&self, hsv: &Hsv) -> bool {
        let hue = hsv.hue.into_positive_degrees();
        let hue_ok = if self.hue_min <= self.hue_max {
            (self.hue_min..=self.hue_max).contains(&hue)
        } else {
            hue >= self.hue_min || hue <= self.hue_max
        };
        hue_ok
            && (self.saturation_min..=self.saturation_max).contains(&hsv.saturation)
            && (self.value_min..=self.value_max).contains(&hsv.value)
    }

    pub fn contains_rgb(&self, rgb: [u8; 3]) -> bool {
        let hsv: Hsv = Srgb::new(rgb[0], rgb[1], rgb[2])
            .into_format::<f32>()
            .into_color();
        self.contains(&hsv)
    }
}

/// Marker colours with a calibrated threshold box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MarkColor {
    #[default]
    Blue,
    Green,
    Red,
    Yellow,
}

impl MarkColor {
    pub fn hsv_range(self) -> HsvRange {
        match self {
            MarkColor::Blue => HsvRange {
                hue_min: 220.0,
                hue_max: 260.0,
                saturation_min: 50.0 / 255.0,
                saturation_max: 1.0,
                value_min: 50.0 / 255.0,
                value_max: 1.0,
            },
            MarkColor::Green => HsvRange {
                hue_min: 72.0,
                hue_max: 140.0,
                saturation_min: 25.0 / 255.0,
                saturation_max: 1.0,
                value_min: 25.0 / 255.0,
                value_max: 1.0,
            },
            MarkColor::Red => HsvRange {
                hue_min: 310.0,
                hue_max: 358.0,
                saturation_min: 25.0 / 255.0,
                saturation_max: 1.0,
                value_min: 0.0,
                value_max: 1.0,
            },
            MarkColor::Yellow => HsvRange {
                hue_min: 40.0,
                hue_max: 60.0,
                saturation_min: 100.0 / 255.0,
                saturation_max: 1.0,
                value_min: 100.0 / 255.0,
                value_max: 1.0,
            },
        }
    }
}

/// Structuring-element radii for mask cleanup. A radius of 0 skips the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Morphology {
    pub erode_radius: u8,
    pub open_radius: u8,
    pub close_radius: u8,
}

impl Default for Morphology {
    fn default() -> Self {
        Self {
            erode_radius: ERODE_RADIUS,
            open_radius: OPEN_RADIUS,
            close_radius: CLOSE_RADIUS,
        }
    }
}

impl Morphology {
    pub const NONE: Morphology = Morphology {
        erode_radius: 0,
        open_radius: 0,
        close_radius: 0,
    };

    /// Erode once, open to drop speckle, then close so each bubble fill is one blob.
    pub fn apply(&self, mask: GrayImage) -> GrayImage {
        let mut mask = mask;
        if self.erode_radius > 0 {
            mask = morphology::erode(&mask, Norm::LInf, self.erode_radius);
        }
        if self.open_radius > 0 {
            mask = morphology::open(&mask, Norm::L2, self.open_radius);
        }
        if self.close_radius > 0 {
            mask = morphology::close(&mask, Norm::L2, self.close_radius);
        }
        mask
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    pub color: HsvRange,
    pub morphology: Morphology,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            color: MarkColor::default().hsv_range(),
            morphology: Morphology::default(),
        }
    }
}

/// Errors that can occur while reading a sheet or writing its overlay.
#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error("failed to open image {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to write overlay {path}: {source}")]
    Overlay {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

pub fn open_sheet(path: &Path) -> Result<DynamicImage, DetectionError> {
    image::open(path).map_err(|source| DetectionError::Open {
        path: path.to_path_buf(),
        source,
    })
}

/// Binary mask with 255 wherever the pixel falls inside `range`.
pub fn marker_mask(rgb: &RgbImage, range: &HsvRange) -> GrayImage {
    let (width, height) = rgb.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        if range.contains_rgb(rgb.get_pixel(x, y).0) {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    })
}

/// Centroid of a closed contour from its polygon moments.
///
/// Computed in exact integer arithmetic and truncated toward zero. Returns
/// `None` for a contour that encloses no area.
pub fn contour_centroid(points: &[Point<i32>]) -> Option<MarkPoint> {
    let n = points.len();
    let mut area2 = 0i64;
    let mut sum_x = 0i64;
    let mut sum_y = 0i64;
    for (i, p) in points.iter().enumerate() {
        let q = points[(i + 1) % n];
        let cross = p.x as i64 * q.y as i64 - q.x as i64 * p.y as i64;
        area2 += cross;
        sum_x += (p.x as i64 + q.x as i64) * cross;
        sum_y += (p.y as i64 + q.y as i64) * cross;
    }
    if area2 == 0 {
        return None;
    }
    // m10 / m00 = (sum_x / 6) / (area2 / 2)
    Some(MarkPoint::new(
        (sum_x / (3 * area2)) as i32,
        (sum_y / (3 * area2)) as i32,
    ))
}

/// Centroids of every external blob in a cleaned mask, unsorted.
pub fn mask_centroids(mask: &GrayImage) -> Vec<MarkPoint> {
    let mut degenerate = 0usize;
    let mut out = Vec::new();
    for contour in find_contours::<i32>(mask) {
        if contour.border_type != BorderType::Outer || contour.parent.is_some() {
            continue;
        }
        match contour_centroid(&contour.points) {
            Some(center) => out.push(center),
            None => degenerate += 1,
        }
    }
    if degenerate > 0 {
        debug!(degenerate, "skipped zero-area contours");
    }
    out
}

/// Finds every mark of the configured colour and returns the centroids sorted
/// by `(x, y)`.
pub fn detect_marks(source: &DynamicImage, config: &DetectorConfig) -> Vec<MarkPoint> {
    let rgb = source.to_rgb8();
    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let mask = config.morphology.apply(marker_mask(&rgb, &config.color));
    let mut marks = mask_centroids(&mask);
    marks.sort_unstable();
    marks
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use imageproc::drawing::draw_filled_circle_mut;

    const BLUE: Rgb<u8> = Rgb([20, 40, 230]);

    fn square(x0: i32, y0: i32, side: i32) -> Vec<Point<i32>> {
        vec![
            Point::new(x0, y0),
            Point::new(x0 + side, y0),
            Point::new(x0 + side, y0 + side),
            Point::new(x0, y0 + side),
        ]
    }

    #[test]
    fn centroid_of_square_contour() {
        assert_eq!(contour_centroid(&square(10, 20, 8)), Some(MarkPoint::new(14, 24)));
        let mut reversed = square(10, 20, 8);
        reversed.reverse();
        assert_eq!(contour_centroid(&reversed), Some(MarkPoint::new(14, 24)));
    }

    #[test]
    fn centroid_truncates_toward_zero() {
        // Center at (12.5, 12.5).
        assert_eq!(contour_centroid(&square(10, 10, 5)), Some(MarkPoint::new(12, 12)));
    }

    #[test]
    fn zero_area_contours_have_no_centroid() {
        assert_eq!(contour_centroid(&[]), None);
        assert_eq!(contour_centroid(&[Point::new(3, 3)]), None);
        let line = [Point::new(0, 0), Point::new(5, 0), Point::new(9, 0), Point::new(5, 0)];
        assert_eq!(contour_centroid(&line), None);
    }

    #[test]
    fn hsv_range_matches_marker_blue_only() {
        let blue = MarkColor::Blue.hsv_range();
        assert!(blue.contains_rgb([0, 0, 255]));
        assert!(blue.contains_rgb(BLUE.0));
        assert!(!blue.contains_rgb([255, 255, 255]));
        assert!(!blue.contains_rgb([0, 0, 0]));
        assert!(!blue.contains_rgb([230, 30, 30]));
        assert!(!blue.contains_rgb([30, 200, 30]));
    }

    #[test]
    fn hue_range_wraps_through_zero() {
        let range = HsvRange {
            hue_min: 340.0,
            hue_max: 20.0,
            saturation_min: 0.3,
            saturation_max: 1.0,
            value_min: 0.3,
            value_max: 1.0,
        };
        assert!(range.contains_rgb([255, 0, 0]));
        assert!(range.contains_rgb([255, 0, 40]));
        assert!(range.contains_rgb([255, 40, 0]));
        assert!(!range.contains_rgb([0, 255, 0]));
    }

    #[test]
    fn morphology_none_is_identity() {
        let mut mask = GrayImage::new(16, 16);
        mask.put_pixel(3, 3, Luma([255]));
        mask.put_pixel(10, 12, Luma([255]));
        assert_eq!(Morphology::NONE.apply(mask.clone()), mask);
    }

    #[test]
    fn opening_removes_speckle_but_keeps_bubbles() {
        let mut img = RgbImage::from_pixel(200, 120, Rgb([255, 255, 255]));
        draw_filled_circle_mut(&mut img, (50, 60), 20, BLUE);
        draw_filled_circle_mut(&mut img, (140, 60), 20, BLUE);
        img.put_pixel(100, 10, BLUE);
        img.put_pixel(101, 10, BLUE);

        let config = DetectorConfig {
            color: MarkColor::Blue.hsv_range(),
            morphology: Morphology {
                erode_radius: 1,
                open_radius: 4,
                close_radius: 2,
            },
        };
        let marks = detect_marks(&DynamicImage::ImageRgb8(img), &config);
        assert_eq!(marks.len(), 2, "marks: {marks:?}");
        assert!(marks[0].within_window(MarkPoint::new(50, 60), 1));
        assert!(marks[1].within_window(MarkPoint::new(140, 60), 1));
    }

    #[test]
    fn empty_image_has_no_marks() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(detect_marks(&img, &DetectorConfig::default()).is_empty());
    }
}
