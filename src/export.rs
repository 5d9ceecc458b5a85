//! Tabular sink for decoded sheets: one row per sheet, one column per field.
//!
//! Rows are written to `scantron_results_<YYYY-mm-dd_HH-MM-SS>.<ext>` inside the
//! results directory, either as CSV or as JSON lines.

use std::borrow::Cow;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use csv::WriterBuilder;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::layout::FieldDecl;
use crate::resolve::FieldRecord;

const SHEET_COLUMN: &str = "Sheet";
const FILE_STEM: &str = "scantron_results";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Csv,
    JsonLines,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::JsonLines => "jsonl",
        }
    }
}

/// Decoded record of one game sheet together with the image it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRecord {
    pub source: PathBuf,
    pub record: FieldRecord,
}

impl SheetRecord {
    /// File name of the source image, used as the row label.
    pub fn sheet_name(&self) -> Cow<'_, str> {
        match self.source.file_name() {
            Some(name) => name.to_string_lossy(),
            None => self.source.to_string_lossy(),
        }
    }
}

impl Serialize for SheetRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.record.len() + 1))?;
        map.serialize_entry(SHEET_COLUMN, &self.sheet_name())?;
        for (name, value) in self.record.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("failed to write results {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Header `Sheet` followed by every declared field, then one row per sheet.
pub fn write_csv<W: Write>(
    writer: &mut W,
    fields: &[FieldDecl],
    sheets: &[SheetRecord],
) -> io::Result<()> {
    let mut csv = WriterBuilder::new().from_writer(writer);
    let header = std::iter::once(SHEET_COLUMN).chain(fields.iter().map(|f| f.name.as_str()));
    csv.write_record(header)?;
    for sheet in sheets {
        let cells = std::iter::once(sheet.sheet_name().into_owned())
            .chain(sheet.record.iter().map(|(_, value)| value.to_string()));
        csv.write_record(cells)?;
    }
    csv.flush()
}

pub fn write_json_lines<W: Write>(writer: &mut W, sheets: &[SheetRecord]) -> io::Result<()> {
    for sheet in sheets {
        serde_json::to_writer(&mut *writer, sheet)?;
        writeln!(writer)?;
    }
    Ok(())
}

pub fn timestamped_path(dir: &Path, format: OutputFormat, now: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "{FILE_STEM}_{}.{}",
        now.format(TIMESTAMP_FORMAT),
        format.extension()
    ))
}

/// Writes every sheet to a new timestamped file in `dir` and returns its path.
pub fn export_records(
    dir: &Path,
    format: OutputFormat,
    fields: &[FieldDecl],
    sheets: &[SheetRecord],
) -> Result<PathBuf, ExportError> {
    let path = timestamped_path(dir, format, Local::now());
    let io_err = |source| ExportError::Io {
        path: path.clone(),
        source,
    };

    let file = File::create(&path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    match format {
        OutputFormat::Csv => write_csv(&mut writer, fields, sheets),
        OutputFormat::JsonLines => write_json_lines(&mut writer, sheets),
    }
    .and_then(|()| writer.flush())
    .map_err(io_err)?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::CalibratedTemplate;
    use crate::layout::{BubbleSlot, FieldKind, SheetLayout, SlotRole};
    use crate::omr::MarkPoint;
    use crate::resolve::{ResolverConfig, resolve};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn template() -> CalibratedTemplate {
        let layout = SheetLayout::from_parts(
            "tiny".into(),
            vec![0],
            vec![
                FieldDecl {
                    name: "Team".into(),
                    kind: FieldKind::Digits { width: 2 },
                },
                FieldDecl {
                    name: "Alliance".into(),
                    kind: FieldKind::Choice,
                },
            ],
            vec![
                BubbleSlot {
                    index: 0,
                    position: MarkPoint::new(10, 10),
                    label: "Team Deca Four".into(),
                    role: SlotRole::Digit {
                        field: "Team".into(),
                        position: 0,
                        value: 4,
                    },
                },
                BubbleSlot {
                    index: 1,
                    position: MarkPoint::new(10, 100),
                    label: "Red".into(),
                    role: SlotRole::Choice {
                        field: "Alliance".into(),
                        value: "red".into(),
                    },
                },
            ],
        )
        .unwrap();
        CalibratedTemplate::from_nominal(&layout)
    }

    fn sheets() -> Vec<SheetRecord> {
        let t = template();
        let cfg = ResolverConfig::default();
        vec![
            SheetRecord {
                source: PathBuf::from("scans/sheet_01.png"),
                record: resolve(&t, &[MarkPoint::new(12, 9), MarkPoint::new(10, 100)], &cfg),
            },
            SheetRecord {
                source: PathBuf::from("scans/odd, name.png"),
                record: resolve(&t, &[], &cfg),
            },
        ]
    }

    #[test]
    fn csv_has_sheet_column_then_declared_fields() {
        let t = template();
        let mut out = Vec::new();
        write_csv(&mut out, t.fields(), &sheets()).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "Sheet,Team,Alliance\nsheet_01.png,40,red\n\"odd, name.png\",00,\n"
        );
    }

    #[test]
    fn csv_quotes_cells_with_separators_and_quotes() {
        let t = template();
        let sheets = vec![SheetRecord {
            source: PathBuf::from("scans/say \"hi\".png"),
            record: resolve(&t, &[], &ResolverConfig::default()),
        }];
        let mut out = Vec::new();
        write_csv(&mut out, t.fields(), &sheets).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "Sheet,Team,Alliance\n\"say \"\"hi\"\".png\",00,\n");
    }

    #[test]
    fn json_lines_keep_field_order_and_types() {
        let mut out = Vec::new();
        write_json_lines(&mut out, &sheets()).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"Sheet":"sheet_01.png","Team":"40","Alliance":"red"}"#);
    }

    #[test]
    fn file_name_carries_timestamp_and_extension() {
        let now = Local.with_ymd_and_hms(2023, 3, 18, 14, 5, 9).unwrap();
        let path = timestamped_path(Path::new("results"), OutputFormat::Csv, now);
        assert_eq!(
            path,
            Path::new("results").join("scantron_results_2023-03-18_14-05-09.csv")
        );
        let path = timestamped_path(Path::new("results"), OutputFormat::JsonLines, now);
        assert!(path.to_string_lossy().ends_with(".jsonl"));
    }

    #[test]
    fn export_writes_into_directory() {
        let dir = tempdir().unwrap();
        let t = template();
        let path = export_records(dir.path(), OutputFormat::Csv, t.fields(), &sheets()).unwrap();
        assert_eq!(path.parent(), Some(dir.path()));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("Sheet,Team,Alliance\n"));
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn export_into_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = export_records(&missing, OutputFormat::Csv, &[], &[]).unwrap_err();
        assert!(matches!(err, ExportError::Io { .. }));
    }
}
