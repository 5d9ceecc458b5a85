//! Runs the mark detector over a directory of scans on a bounded worker pool.
//!
//! Results come back in input order regardless of which worker finishes
//! first, and a failed image never aborts its siblings.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, warn};

use crate::omr::detect::open_sheet;
use crate::omr::{DetectionError, DetectorConfig, MarkPoint, detect_marks, write_overlay};

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff", "webp"];

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("failed to list {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Detection result for one image, at the same position as its input path.
#[derive(Debug)]
pub struct ImageOutcome {
    pub path: PathBuf,
    pub marks: Result<Vec<MarkPoint>, DetectionError>,
}

/// Where annotated copies go: `<dir>/<prefix>_<i>.png`, `i` being the input position.
#[derive(Debug, Clone, Copy)]
pub struct OverlayTarget<'a> {
    pub dir: &'a Path,
    pub prefix: &'a str,
}

impl OverlayTarget<'_> {
    pub fn path_for(&self, position: usize) -> PathBuf {
        self.dir.join(format!("{}_{position}.png", self.prefix))
    }
}

pub fn is_image_file(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(OsStr::to_str) else {
        return false;
    };
    let ext = ext.to_ascii_lowercase();
    IMAGE_EXTENSIONS.contains(&ext.as_str())
}

/// Image files directly inside `dir`, sorted by file name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, BatchError> {
    let entries = fs::read_dir(dir).map_err(|source| BatchError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut images: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_image_file(p))
        .collect();
    images.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(images)
}

pub fn ensure_directories(dirs: &[&Path]) -> Result<(), BatchError> {
    for dir in dirs {
        if !dir.is_dir() {
            debug!(path = %dir.display(), "creating directory");
            fs::create_dir_all(dir).map_err(|source| BatchError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }
    }
    Ok(())
}

pub fn build_pool(threads: usize) -> Result<ThreadPool, BatchError> {
    Ok(ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(|i| format!("omr-worker-{i}"))
        .build()?)
}

fn detect_one(
    position: usize,
    path: &Path,
    config: &DetectorConfig,
    overlay: Option<OverlayTarget<'_>>,
) -> Result<Vec<MarkPoint>, DetectionError> {
    let image = open_sheet(path)?;
    let marks = detect_marks(&image, config);
    debug!(path = %path.display(), marks = marks.len(), "detected marks");

    if let Some(target) = overlay {
        let out = target.path_for(position);
        if let Err(e) = write_overlay(&out, &image, &marks) {
            warn!(path = %path.display(), error = %e, "overlay not written");
        }
    }
    Ok(marks)
}

/// Detects marks in every path on `pool`; the output is index-aligned with `paths`.
pub fn detect_batch(
    pool: &ThreadPool,
    paths: &[PathBuf],
    config: &DetectorConfig,
    overlay: Option<OverlayTarget<'_>>,
) -> Vec<ImageOutcome> {
    pool.install(|| {
        paths
            .par_iter()
            .enumerate()
            .map(|(position, path)| {
                let marks = detect_one(position, path, config, overlay);
                if let Err(e) = &marks {
                    warn!(path = %path.display(), error = %e, "skipping image");
                }
                ImageOutcome {
                    path: path.clone(),
                    marks,
                }
            })
            .collect()
    })
}
