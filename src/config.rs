use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::thread;

use serde::{Deserialize, Serialize};

use crate::export::OutputFormat;
use crate::layout::{LayoutError, SheetLayout};
use crate::omr::{DetectorConfig, HsvRange, MarkColor, Morphology};
use crate::resolve::{DEFAULT_PIXEL_DIFFERENTIAL, HitPolicy, ResolverConfig};

const KEY_DIR: &str = "key_images";
const SHEET_DIR: &str = "scantron_images";
const RESULTS_DIR: &str = "results";

/// Everything one batch run needs. Missing JSON keys fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub key_dir: PathBuf,
    pub sheet_dir: PathBuf,
    pub results_dir: PathBuf,
    /// Layout JSON; the built-in sheet when unset.
    pub layout: Option<PathBuf>,
    pub pixel_differential: i32,
    pub mark_color: MarkColor,
    /// Explicit threshold box, overrides `mark_color`.
    pub hsv_range: Option<HsvRange>,
    pub morphology: Morphology,
    pub overlays: bool,
    pub plot: bool,
    /// Worker count; host parallelism when unset or zero.
    pub threads: Option<usize>,
    pub hit_policy: HitPolicy,
    pub output_format: OutputFormat,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            key_dir: PathBuf::from(KEY_DIR),
            sheet_dir: PathBuf::from(SHEET_DIR),
            results_dir: PathBuf::from(RESULTS_DIR),
            layout: None,
            pixel_differential: DEFAULT_PIXEL_DIFFERENTIAL,
            mark_color: MarkColor::default(),
            hsv_range: None,
            morphology: Morphology::default(),
            overlays: false,
            plot: false,
            threads: None,
            hit_policy: HitPolicy::default(),
            output_format: OutputFormat::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("pixel_differential must be non-negative, got {0}")]
    Tolerance(i32),

    #[error("hsv_range bounds are inverted or outside 0..=1 / 0..=360")]
    HsvRange,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: RunConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pixel_differential < 0 {
            return Err(ConfigError::Tolerance(self.pixel_differential));
        }
        if let Some(r) = &self.hsv_range {
            let unit = |lo: f32, hi: f32| {
                (0.0..=1.0).contains(&lo) && (0.0..=1.0).contains(&hi) && lo <= hi
            };
            let hue = (0.0..=360.0).contains(&r.hue_min) && (0.0..=360.0).contains(&r.hue_max);
            if !hue
                || !unit(r.saturation_min, r.saturation_max)
                || !unit(r.value_min, r.value_max)
            {
                return Err(ConfigError::HsvRange);
            }
        }
        Ok(())
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            color: self.hsv_range.unwrap_or_else(|| self.mark_color.hsv_range()),
            morphology: self.morphology,
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            pixel_differential: self.pixel_differential,
            hit_policy: self.hit_policy,
        }
    }

    pub fn worker_threads(&self) -> usize {
        match self.threads {
            Some(n) if n > 0 => n,
            _ => thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        }
    }

    pub fn load_layout(&self) -> Result<SheetLayout, LayoutError> {
        match &self.layout {
            Some(path) => SheetLayout::load(path),
            None => SheetLayout::builtin(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_the_scanning_station_setup() {
        let config = RunConfig::default();
        assert_eq!(config.key_dir, PathBuf::from("key_images"));
        assert_eq!(config.sheet_dir, PathBuf::from("scantron_images"));
        assert_eq!(config.results_dir, PathBuf::from("results"));
        assert_eq!(config.pixel_differential, 30);
        assert_eq!(config.hit_policy, HitPolicy::Nearest);
        assert_eq!(config.detector_config(), DetectorConfig::default());
        assert!(config.worker_threads() >= 1);
    }

    #[test]
    fn partial_json_keeps_defaults_for_missing_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.json");
        fs::write(
            &path,
            r#"{ "pixel_differential": 45, "mark_color": "green", "threads": 3,
                 "morphology": { "open_radius": 6 }, "output_format": "json_lines" }"#,
        )
        .unwrap();

        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.pixel_differential, 45);
        assert_eq!(config.worker_threads(), 3);
        assert_eq!(config.output_format, OutputFormat::JsonLines);
        assert_eq!(config.morphology.open_radius, 6);
        assert_eq!(config.morphology.erode_radius, 2);
        assert_eq!(config.detector_config().color, MarkColor::Green.hsv_range());
        assert_eq!(config.key_dir, PathBuf::from("key_images"));
    }

    #[test]
    fn explicit_hsv_range_overrides_preset() {
        let range = HsvRange {
            hue_min: 350.0,
            hue_max: 10.0,
            saturation_min: 0.2,
            saturation_max: 1.0,
            value_min: 0.2,
            value_max: 1.0,
        };
        let config = RunConfig {
            hsv_range: Some(range),
            ..RunConfig::default()
        };
        config.validate().unwrap();
        assert_eq!(config.detector_config().color, range);
    }

    #[test]
    fn rejects_negative_tolerance_and_bad_ranges() {
        let config = RunConfig {
            pixel_differential: -1,
            ..RunConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Tolerance(-1))));

        let config = RunConfig {
            hsv_range: Some(HsvRange {
                hue_min: 0.0,
                hue_max: 30.0,
                saturation_min: 0.8,
                saturation_max: 0.2,
                value_min: 0.0,
                value_max: 1.0,
            }),
            ..RunConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::HsvRange)));
    }

    #[test]
    fn malformed_json_reports_the_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ pixel_differential: }").unwrap();
        match RunConfig::load(&path) {
            Err(ConfigError::Json { path: p, .. }) => assert_eq!(p, path),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_layout_file_is_a_layout_error() {
        let config = RunConfig {
            layout: Some(PathBuf::from("/definitely/not/here.json")),
            ..RunConfig::default()
        };
        assert!(matches!(config.load_layout(), Err(LayoutError::Io { .. })));
        assert_eq!(
            RunConfig::default().load_layout().unwrap().expected_total(),
            155
        );
    }
}
