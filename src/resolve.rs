//! Maps the marks found on one game sheet onto the template's declared fields.
//!
//! A mark hits a slot when the slot lies inside the square window of
//! half-width `pixel_differential` around the mark. Hits are applied in
//! ascending slot ordinal order:
//!
//! * digit slots fill their position once (first hit wins, unfilled -> `0`),
//! * choice slots set the field once (first hit wins),
//! * flag and state slots overwrite (last hit wins).

use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::calibrate::CalibratedTemplate;
use crate::layout::{FieldKind, SlotRole};
use crate::omr::MarkPoint;

pub const DEFAULT_PIXEL_DIFFERENTIAL: i32 = 30;

/// Which slots a single mark is allowed to hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum HitPolicy {
    /// Only the closest slot inside the window (ties go to the lower ordinal).
    #[default]
    Nearest,
    /// Every slot inside the window.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub pixel_differential: i32,
    pub hit_policy: HitPolicy,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            pixel_differential: DEFAULT_PIXEL_DIFFERENTIAL,
            hit_policy: HitPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Digits(String),
    Text(String),
    Code(u8),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Digits(s) | FieldValue::Text(s) => f.write_str(s),
            FieldValue::Code(c) => write!(f, "{c}"),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Digits(s) | FieldValue::Text(s) => serializer.serialize_str(s),
            FieldValue::Code(c) => serializer.serialize_u8(*c),
        }
    }
}

/// Decoded sheet: every declared field, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldRecord {
    entries: Vec<(String, FieldValue)>,
}

impl FieldRecord {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for FieldRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Record plus the diagnostics gathered while building it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub record: FieldRecord,
    /// Slot ordinals hit by at least one mark, ascending.
    pub hits: Vec<usize>,
    /// Marks that fell inside no slot's window.
    pub unmatched: Vec<MarkPoint>,
}

enum FieldState {
    Digits(Vec<Option<u8>>),
    Choice(Option<String>),
    Code(u8),
}

impl FieldState {
    fn new(kind: &FieldKind) -> Self {
        match kind {
            FieldKind::Digits { width } => FieldState::Digits(vec![None; *width]),
            FieldKind::Choice => FieldState::Choice(None),
            FieldKind::Flag | FieldKind::State => FieldState::Code(0),
        }
    }

    fn apply(&mut self, role: &SlotRole) {
        match (self, role) {
            (FieldState::Digits(digits), SlotRole::Digit { position, value, .. }) => {
                if let Some(digit) = digits.get_mut(*position)
                    && digit.is_none()
                {
                    *digit = Some(*value);
                }
            }
            (FieldState::Choice(chosen), SlotRole::Choice { value, .. }) => {
                if chosen.is_none() {
                    *chosen = Some(value.clone());
                }
            }
            (FieldState::Code(current), SlotRole::Flag { value, .. })
            | (FieldState::Code(current), SlotRole::State { code: value, .. }) => {
                *current = *value;
            }
            // Layout validation rules out mismatched pairs.
            _ => {}
        }
    }

    fn finish(self) -> FieldValue {
        match self {
            FieldState::Digits(digits) => FieldValue::Digits(
                digits
                    .into_iter()
                    .map(|d| char::from(b'0' + d.unwrap_or(0)))
                    .collect(),
            ),
            FieldState::Choice(chosen) => FieldValue::Text(chosen.unwrap_or_default()),
            FieldState::Code(code) => FieldValue::Code(code),
        }
    }
}

/// Slot ordinals hit by `marks` (sorted, deduplicated) and the marks that hit nothing.
pub fn slot_hits(
    template: &CalibratedTemplate,
    marks: &[MarkPoint],
    config: &ResolverConfig,
) -> (Vec<usize>, Vec<MarkPoint>) {
    let d = config.pixel_differential;
    let mut hits = Vec::new();
    let mut unmatched = Vec::new();

    for &mark in marks {
        let mut inside = template
            .slots()
            .iter()
            .filter(|slot| mark.within_window(slot.position, d))
            .peekable();
        if inside.peek().is_none() {
            unmatched.push(mark);
            continue;
        }
        match config.hit_policy {
            HitPolicy::All => hits.extend(inside.map(|slot| slot.index)),
            HitPolicy::Nearest => {
                if let Some(slot) =
                    inside.min_by_key(|slot| (mark.distance_squared(slot.position), slot.index))
                {
                    hits.push(slot.index);
                }
            }
        }
    }

    hits.sort_unstable();
    hits.dedup();
    (hits, unmatched)
}

pub fn resolve_detailed(
    template: &CalibratedTemplate,
    marks: &[MarkPoint],
    config: &ResolverConfig,
) -> Resolution {
    let layout = template.layout();
    let mut states: Vec<FieldState> = layout
        .fields()
        .iter()
        .map(|f| FieldState::new(&f.kind))
        .collect();

    let (hits, unmatched) = slot_hits(template, marks, config);
    for &index in &hits {
        let Some(field) = layout.field_of_slot(index) else {
            continue;
        };
        states[field].apply(&layout.slots()[index].role);
    }

    let entries = layout
        .fields()
        .iter()
        .zip(states)
        .map(|(decl, state)| (decl.name.clone(), state.finish()))
        .collect();

    Resolution {
        record: FieldRecord { entries },
        hits,
        unmatched,
    }
}

/// Decodes one sheet's marks into a record covering every declared field.
pub fn resolve(
    template: &CalibratedTemplate,
    marks: &[MarkPoint],
    config: &ResolverConfig,
) -> FieldRecord {
    resolve_detailed(template, marks, config).record
}
