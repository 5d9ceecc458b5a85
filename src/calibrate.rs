//! Builds the calibrated template from one or more filled-in key sheets.
//!
//! Each usable key yields exactly one mark per slot. Detector output is in
//! `(x, y)` order, so the i-th boundary range of that list is the i-th printed
//! column; sorting each column by `y` turns the list into slot-ordinal order.
//! Positions are then averaged per ordinal across all usable keys.

use serde::Serialize;
use tracing::{info, warn};

use crate::layout::{BubbleSlot, ColumnPartition, FieldDecl, SheetLayout};
use crate::omr::MarkPoint;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalibrationError {
    #[error("no usable keys: {found} key scan(s), none with exactly {expected} marks")]
    NoUsableKeys { found: usize, expected: usize },

    #[error("averaged key positions do not line up with the {expected} layout slots")]
    PositionCount { expected: usize },
}

/// A key dropped before averaging because its mark count was wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyRejection {
    /// Position of the key in the input list.
    pub key: usize,
    pub marks: usize,
}

/// Layout whose slot positions are the key averages. Shared read-only by
/// every resolver call of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibratedTemplate {
    layout: SheetLayout,
    keys_used: usize,
}

impl CalibratedTemplate {
    /// Template that trusts the printed positions as-is.
    pub fn from_nominal(layout: &SheetLayout) -> Self {
        Self {
            layout: layout.clone(),
            keys_used: 0,
        }
    }

    pub fn layout(&self) -> &SheetLayout {
        &self.layout
    }

    pub fn slots(&self) -> &[BubbleSlot] {
        self.layout.slots()
    }

    pub fn fields(&self) -> &[FieldDecl] {
        self.layout.fields()
    }

    pub fn keys_used(&self) -> usize {
        self.keys_used
    }
}

#[derive(Debug, Clone)]
pub struct Calibration {
    pub template: CalibratedTemplate,
    pub keys_found: usize,
    pub rejected: Vec<KeyRejection>,
}

impl Calibration {
    pub fn keys_used(&self) -> usize {
        self.template.keys_used
    }
}

/// Reorders one key's marks into slot-ordinal order: `(x, y)` sort, split at
/// the column boundaries, then each column sorted top to bottom.
///
/// Applying it to its own output returns the same sequence.
pub fn order_key_marks(marks: &[MarkPoint], partition: &ColumnPartition) -> Vec<MarkPoint> {
    let mut by_x = marks.to_vec();
    by_x.sort_unstable();

    let mut ordered = Vec::with_capacity(by_x.len());
    for range in partition.ranges() {
        let start = range.start.min(by_x.len());
        let end = range.end.min(by_x.len());
        let mut column = by_x[start..end].to_vec();
        column.sort_unstable_by_key(|p| (p.y, p.x));
        ordered.extend(column);
    }
    ordered
}

/// Per-ordinal mean of equally long key sequences, truncated toward zero.
///
/// Returns `None` when `keys` is empty or the sequences differ in length.
pub fn average_positions(keys: &[Vec<MarkPoint>]) -> Option<Vec<MarkPoint>> {
    let first = keys.first()?;
    if keys.iter().any(|key| key.len() != first.len()) {
        return None;
    }
    let count = keys.len() as i64;
    let averaged = (0..first.len())
        .map(|i| {
            let (sum_x, sum_y) = keys.iter().fold((0i64, 0i64), |(sx, sy), key| {
                (sx + key[i].x as i64, sy + key[i].y as i64)
            });
            MarkPoint::new((sum_x / count) as i32, (sum_y / count) as i32)
        })
        .collect();
    Some(averaged)
}

/// Layout carrying the per-ordinal average of already ordered keys.
fn averaged_layout(
    ordered_keys: &[Vec<MarkPoint>],
    layout: &SheetLayout,
) -> Result<SheetLayout, CalibrationError> {
    average_positions(ordered_keys)
        .and_then(|averaged| layout.with_positions(&averaged))
        .ok_or(CalibrationError::PositionCount {
            expected: layout.expected_total(),
        })
}

/// Calibrates `layout` against the detected marks of every key scan.
///
/// Keys whose mark count differs from the layout's slot count are reported in
/// [`Calibration::rejected`] and ignored. Fails when no key is usable.
pub fn calibrate(
    key_mark_sets: &[Vec<MarkPoint>],
    layout: &SheetLayout,
) -> Result<Calibration, CalibrationError> {
    let expected = layout.expected_total();
    let mut rejected = Vec::new();
    let mut ordered_keys = Vec::with_capacity(key_mark_sets.len());

    for (key, marks) in key_mark_sets.iter().enumerate() {
        if marks.len() != expected {
            warn!(key, marks = marks.len(), expected, "key rejected: wrong mark count");
            rejected.push(KeyRejection {
                key,
                marks: marks.len(),
            });
            continue;
        }
        ordered_keys.push(order_key_marks(marks, layout.partition()));
    }

    if ordered_keys.is_empty() {
        return Err(CalibrationError::NoUsableKeys {
            found: key_mark_sets.len(),
            expected,
        });
    }

    let calibrated = averaged_layout(&ordered_keys, layout)?;

    info!(
        used = ordered_keys.len(),
        found = key_mark_sets.len(),
        layout = layout.name(),
        "calibrated template from keys"
    );

    Ok(Calibration {
        template: CalibratedTemplate {
            layout: calibrated,
            keys_used: ordered_keys.len(),
        },
        keys_found: key_mark_sets.len(),
        rejected,
    })
}
