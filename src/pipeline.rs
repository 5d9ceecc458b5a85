//! One complete run: detect keys, calibrate, detect and decode game sheets,
//! then write the results table and the QA artifacts.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::batch::{
    BatchError, ImageOutcome, OverlayTarget, build_pool, detect_batch, ensure_directories,
    list_images,
};
use crate::calibrate::{CalibratedTemplate, Calibration, CalibrationError, calibrate};
use crate::config::{ConfigError, RunConfig};
use crate::export::{ExportError, SheetRecord, export_records};
use crate::layout::{LayoutError, SheetLayout};
use crate::omr::MarkPoint;
use crate::plot::write_calibration_plot;
use crate::resolve::{ResolverConfig, resolve_detailed};

pub const TEMPLATE_FILE: &str = "calibrated_template.json";
pub const PLOT_FILE: &str = "calibration_plot.png";
const KEY_OVERLAY_PREFIX: &str = "key_overlay";
const SHEET_OVERLAY_PREFIX: &str = "scantron_overlay";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(
        "no usable keys: {found} key image(s), {} unreadable, {} without exactly {expected} marks",
        .unreadable.len(),
        .rejected.len()
    )]
    NoUsableKeys {
        found: usize,
        expected: usize,
        unreadable: Vec<SkippedImage>,
        rejected: Vec<RejectedKey>,
    },

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("calibration plot: {0}")]
    Plot(String),
}

/// An input image that produced no usable result, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedImage {
    pub path: PathBuf,
    pub reason: String,
}

/// A key that was read but not averaged because its mark count was wrong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedKey {
    pub path: PathBuf,
    pub marks: usize,
    pub expected: usize,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub layout: String,
    pub keys_found: usize,
    pub keys_used: usize,
    pub rejected_keys: Vec<RejectedKey>,
    pub skipped: Vec<SkippedImage>,
    pub sheets: Vec<SheetRecord>,
    pub template: CalibratedTemplate,
    pub output: PathBuf,
    pub template_path: PathBuf,
    pub plot: Option<PathBuf>,
}

type ReadImages = Vec<(PathBuf, Vec<MarkPoint>)>;

fn split_outcomes(outcomes: Vec<ImageOutcome>) -> (ReadImages, Vec<SkippedImage>) {
    let mut read = Vec::with_capacity(outcomes.len());
    let mut skipped = Vec::new();
    for outcome in outcomes {
        match outcome.marks {
            Ok(marks) => read.push((outcome.path, marks)),
            Err(e) => skipped.push(SkippedImage {
                path: outcome.path,
                reason: e.to_string(),
            }),
        }
    }
    (read, skipped)
}

/// Calibrates from detected keys. Skipped key images are returned alongside
/// the calibration so they can be reported.
///
/// Without a usable key the error still carries every unreadable and
/// rejected key image, and `found` counts all of them.
pub fn calibrate_keys(
    outcomes: Vec<ImageOutcome>,
    layout: &SheetLayout,
) -> Result<(Calibration, Vec<RejectedKey>, Vec<SkippedImage>), PipelineError> {
    let found = outcomes.len();
    let (read, skipped) = split_outcomes(outcomes);
    let mark_sets: Vec<Vec<MarkPoint>> = read.iter().map(|(_, marks)| marks.clone()).collect();
    let result = calibrate(&mark_sets, layout);

    let expected = layout.expected_total();
    let rejected: Vec<RejectedKey> = read
        .iter()
        .filter(|(_, marks)| marks.len() != expected)
        .map(|(path, marks)| RejectedKey {
            path: path.clone(),
            marks: marks.len(),
            expected,
        })
        .collect();

    match result {
        Ok(calibration) => Ok((calibration, rejected, skipped)),
        Err(CalibrationError::NoUsableKeys { .. }) => Err(PipelineError::NoUsableKeys {
            found,
            expected,
            unreadable: skipped,
            rejected,
        }),
        Err(e) => Err(e.into()),
    }
}

/// Decodes every successfully detected sheet, preserving input order.
pub fn decode_sheets(
    template: &CalibratedTemplate,
    outcomes: Vec<ImageOutcome>,
    config: &ResolverConfig,
) -> (Vec<SheetRecord>, Vec<SkippedImage>) {
    let (read, skipped) = split_outcomes(outcomes);
    let sheets = read
        .into_iter()
        .map(|(source, marks)| {
            let resolution = resolve_detailed(template, &marks, config);
            if !resolution.unmatched.is_empty() {
                warn!(
                    path = %source.display(),
                    unmatched = resolution.unmatched.len(),
                    "marks outside every slot window"
                );
            }
            SheetRecord {
                source,
                record: resolution.record,
            }
        })
        .collect();
    (sheets, skipped)
}

fn write_template(dir: &Path, template: &CalibratedTemplate) -> Result<PathBuf, PipelineError> {
    let path = dir.join(TEMPLATE_FILE);
    let json = template.layout().to_json_string()?;
    fs::write(&path, json).map_err(|source| PipelineError::Write {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

pub fn run(config: &RunConfig) -> Result<RunReport, PipelineError> {
    config.validate()?;
    let layout = config.load_layout()?;
    ensure_directories(&[
        config.key_dir.as_path(),
        config.sheet_dir.as_path(),
        config.results_dir.as_path(),
    ])?;

    let threads = config.worker_threads();
    let pool = build_pool(threads)?;
    let detector = config.detector_config();
    let overlay = |prefix: &'static str| {
        config.overlays.then_some(OverlayTarget {
            dir: config.results_dir.as_path(),
            prefix,
        })
    };

    let key_paths = list_images(&config.key_dir)?;
    info!(keys = key_paths.len(), threads, dir = %config.key_dir.display(), "detecting keys");
    let key_outcomes = detect_batch(&pool, &key_paths, &detector, overlay(KEY_OVERLAY_PREFIX));
    let (calibration, rejected_keys, mut skipped) = calibrate_keys(key_outcomes, &layout)?;
    let template = calibration.template;

    let sheet_paths = list_images(&config.sheet_dir)?;
    info!(sheets = sheet_paths.len(), dir = %config.sheet_dir.display(), "detecting sheets");
    let sheet_outcomes = detect_batch(
        &pool,
        &sheet_paths,
        &detector,
        overlay(SHEET_OVERLAY_PREFIX),
    );
    let (sheets, sheet_skipped) =
        decode_sheets(&template, sheet_outcomes, &config.resolver_config());
    skipped.extend(sheet_skipped);

    let output = export_records(
        &config.results_dir,
        config.output_format,
        template.fields(),
        &sheets,
    )?;
    info!(sheets = sheets.len(), path = %output.display(), "wrote results");

    let template_path = write_template(&config.results_dir, &template)?;
    let plot = if config.plot {
        let path = config.results_dir.join(PLOT_FILE);
        write_calibration_plot(&path, &layout, &template).map_err(PipelineError::Plot)?;
        Some(path)
    } else {
        None
    };

    Ok(RunReport {
        layout: layout.name().to_string(),
        keys_found: key_paths.len(),
        keys_used: template.keys_used(),
        rejected_keys,
        skipped,
        sheets,
        template,
        output,
        template_path,
        plot,
    })
}
