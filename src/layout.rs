//! Bubble-sheet layout: the fixed set of printable bubble slots, the column
//! partition used to reorder key detections, and the declared output fields.
//!
//! A layout is plain data loaded from JSON so that a different sheet can be
//! substituted without touching the decoding code. The 2023 scouting sheet is
//! compiled in and returned by [`SheetLayout::builtin`].

use std::collections::HashMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::omr::MarkPoint;

/// JSON source of the built-in 155-slot layout.
pub const BUILTIN_LAYOUT_JSON: &str = include_str!("../assets/layouts/frc_2023_charged_up.json");

/// How a declared output field is assembled from slot hits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    /// Fixed-width decimal string, one mutually exclusive slot group per digit.
    Digits { width: usize },
    /// Exactly one of several named values; the first hit wins.
    Choice,
    /// Independent flag; every hit overwrites the value.
    Flag,
    /// Small enumerated state addressed by several slots; every hit overwrites.
    State,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
}

/// What a hit on a slot writes into its field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlotRole {
    Digit { field: String, position: usize, value: u8 },
    Choice { field: String, value: String },
    Flag { field: String, value: u8 },
    State { field: String, code: u8 },
}

impl SlotRole {
    pub fn field(&self) -> &str {
        match self {
            SlotRole::Digit { field, .. }
            | SlotRole::Choice { field, .. }
            | SlotRole::Flag { field, .. }
            | SlotRole::State { field, .. } => field,
        }
    }

    fn matches_kind(&self, kind: &FieldKind) -> bool {
        matches!(
            (self, kind),
            (SlotRole::Digit { .. }, FieldKind::Digits { .. })
                | (SlotRole::Choice { .. }, FieldKind::Choice)
                | (SlotRole::Flag { .. }, FieldKind::Flag)
                | (SlotRole::State { .. }, FieldKind::State)
        )
    }
}

/// One printed bubble. `position` starts as the nominal printed coordinate and
/// is replaced by the key average once the sheet has been calibrated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BubbleSlot {
    pub index: usize,
    #[serde(flatten)]
    pub position: MarkPoint,
    pub label: String,
    pub role: SlotRole,
}

/// Ordinal boundaries splitting `0..total` into the physical columns of the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPartition {
    boundaries: Vec<usize>,
    total: usize,
}

impl ColumnPartition {
    pub fn new(boundaries: Vec<usize>, total: usize) -> Result<Self, LayoutError> {
        let starts_at_zero = boundaries.first() == Some(&0);
        let ascending = boundaries.windows(2).all(|w| w[0] < w[1]);
        let in_range = boundaries.iter().all(|&b| b < total);
        if !starts_at_zero || !ascending || !in_range {
            return Err(LayoutError::Columns { total });
        }
        Ok(Self { boundaries, total })
    }

    pub fn boundaries(&self) -> &[usize] {
        &self.boundaries
    }

    pub fn column_count(&self) -> usize {
        self.boundaries.len()
    }

    /// Ordinal range of each column, in boundary order.
    pub fn ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.boundaries.iter().enumerate().map(|(i, &start)| {
            let end = self.boundaries.get(i + 1).copied().unwrap_or(self.total);
            start..end
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("failed to read layout {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid layout json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("layout has no slots")]
    Empty,

    #[error("slot #{position} has index {index}; indices must run 0..{total} in order")]
    SlotIndex {
        position: usize,
        index: usize,
        total: usize,
    },

    #[error("column boundaries must start at 0, ascend strictly and stay below {total}")]
    Columns { total: usize },

    #[error("field `{0}` is declared twice")]
    DuplicateField(String),

    #[error("slot {index} references undeclared field `{field}`")]
    UnknownField { index: usize, field: String },

    #[error("slot {index} role does not match the declared kind of field `{field}`")]
    KindMismatch { index: usize, field: String },

    #[error("slot {index} digit (position {position}, value {value}) does not fit field `{field}`")]
    DigitOutOfRange {
        index: usize,
        field: String,
        position: usize,
        value: u8,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct LayoutFile {
    name: String,
    columns: Vec<usize>,
    fields: Vec<FieldDecl>,
    slots: Vec<BubbleSlot>,
}

/// A validated sheet layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetLayout {
    name: String,
    partition: ColumnPartition,
    fields: Vec<FieldDecl>,
    slots: Vec<BubbleSlot>,
    slot_fields: Vec<usize>,
}

impl SheetLayout {
    pub fn builtin() -> Result<Self, LayoutError> {
        Self::from_json_str(BUILTIN_LAYOUT_JSON)
    }

    pub fn load(path: &Path) -> Result<Self, LayoutError> {
        let text = fs::read_to_string(path).map_err(|source| LayoutError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, LayoutError> {
        let file: LayoutFile = serde_json::from_str(text)?;
        Self::from_parts(file.name, file.columns, file.fields, file.slots)
    }

    pub fn from_parts(
        name: String,
        columns: Vec<usize>,
        fields: Vec<FieldDecl>,
        slots: Vec<BubbleSlot>,
    ) -> Result<Self, LayoutError> {
        if slots.is_empty() {
            return Err(LayoutError::Empty);
        }
        let total = slots.len();
        for (position, slot) in slots.iter().enumerate() {
            if slot.index != position {
                return Err(LayoutError::SlotIndex {
                    position,
                    index: slot.index,
                    total,
                });
            }
        }
        let partition = ColumnPartition::new(columns, total)?;

        let mut by_name: HashMap<&str, usize> = HashMap::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            if by_name.insert(field.name.as_str(), i).is_some() {
                return Err(LayoutError::DuplicateField(field.name.clone()));
            }
        }

        let mut slot_fields = Vec::with_capacity(total);
        for slot in &slots {
            let name = slot.role.field();
            let Some(&field_idx) = by_name.get(name) else {
                return Err(LayoutError::UnknownField {
                    index: slot.index,
                    field: name.to_string(),
                });
            };
            let kind = &fields[field_idx].kind;
            if !slot.role.matches_kind(kind) {
                return Err(LayoutError::KindMismatch {
                    index: slot.index,
                    field: name.to_string(),
                });
            }
            if let (SlotRole::Digit { position, value, .. }, FieldKind::Digits { width }) =
                (&slot.role, kind)
                && (*position >= *width || *value > 9)
            {
                return Err(LayoutError::DigitOutOfRange {
                    index: slot.index,
                    field: name.to_string(),
                    position: *position,
                    value: *value,
                });
            }
            slot_fields.push(field_idx);
        }

        Ok(Self {
            name,
            partition,
            fields,
            slots,
            slot_fields,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition(&self) -> &ColumnPartition {
        &self.partition
    }

    /// Number of marks a completely filled key must yield.
    pub fn expected_total(&self) -> usize {
        self.slots.len()
    }

    pub fn fields(&self) -> &[FieldDecl] {
        &self.fields
    }

    pub fn slots(&self) -> &[BubbleSlot] {
        &self.slots
    }

    /// Index into [`Self::fields`] of the field written by slot `index`.
    pub fn field_of_slot(&self, index: usize) -> Option<usize> {
        self.slot_fields.get(index).copied()
    }

    pub fn slot_by_label(&self, label: &str) -> Option<&BubbleSlot> {
        self.slots.iter().find(|s| s.label == label)
    }

    pub fn positions(&self) -> Vec<MarkPoint> {
        self.slots.iter().map(|s| s.position).collect()
    }

    /// Same layout with every slot moved to `positions[slot.index]`.
    ///
    /// Returns `None` when the position count does not match the slot count.
    pub fn with_positions(&self, positions: &[MarkPoint]) -> Option<Self> {
        if positions.len() != self.slots.len() {
            return None;
        }
        let mut moved = self.clone();
        for (slot, &position) in moved.slots.iter_mut().zip(positions) {
            slot.position = position;
        }
        Some(moved)
    }

    /// Serializes back into the JSON layout format accepted by [`Self::from_json_str`].
    pub fn to_json_string(&self) -> Result<String, LayoutError> {
        let file = LayoutFile {
            name: self.name.clone(),
            columns: self.partition.boundaries.clone(),
            fields: self.fields.clone(),
            slots: self.slots.clone(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }
}
