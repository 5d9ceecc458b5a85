pub mod detect;
pub use detect::{DetectionError, DetectorConfig, HsvRange, MarkColor, Morphology, detect_marks};
pub mod overlay;
pub use overlay::{annotate_marks, write_overlay};

use serde::{Deserialize, Serialize};

/// Integer pixel centroid of one detected mark.
///
/// Ordering is lexicographic by `(x, y)`, which is the order the detector
/// returns marks in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarkPoint {
    pub x: i32,
    pub y: i32,
}

impl MarkPoint {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// True when `other` lies inside the square window of half-width `d`
    /// centred on `self` (bounds inclusive on both axes).
    pub fn within_window(&self, other: MarkPoint, d: i32) -> bool {
        (self.x - other.x).abs() <= d && (self.y - other.y).abs() <= d
    }

    pub fn distance_squared(&self, other: MarkPoint) -> i64 {
        let dx = (self.x - other.x) as i64;
        let dy = (self.y - other.y) as i64;
        dx * dx + dy * dy
    }
}

impl From<(i32, i32)> for MarkPoint {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}
