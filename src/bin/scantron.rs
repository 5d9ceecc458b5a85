use clap::Parser;
use std::error::Error;
use std::path::PathBuf;

use scantron_reader::config::RunConfig;
use scantron_reader::export::OutputFormat;
use scantron_reader::omr::MarkColor;
use scantron_reader::pipeline::{self, PipelineError, RejectedKey, SkippedImage};
use scantron_reader::resolve::HitPolicy;

#[derive(Parser, Debug)]
#[command(
    name = "scantron",
    about = "Calibrate against key scans and decode scouting scantrons into a results table",
    version
)]
struct Cli {
    /// JSON run configuration; flags below override it
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Directory of filled-in key scans
    #[arg(short = 'k', long = "keys")]
    keys: Option<PathBuf>,

    /// Directory of game-sheet scans
    #[arg(short = 's', long = "sheets")]
    sheets: Option<PathBuf>,

    /// Output directory for results, overlays and plots
    #[arg(short = 'r', long = "results")]
    results: Option<PathBuf>,

    /// Sheet layout JSON (defaults to the built-in 2023 sheet)
    #[arg(short = 'l', long = "layout")]
    layout: Option<PathBuf>,

    /// Half-width in pixels of the square window a mark must fall in
    #[arg(short = 't', long = "tolerance")]
    tolerance: Option<i32>,

    /// Marker colour
    #[arg(long = "color", value_enum)]
    color: Option<MarkColor>,

    /// Whether a mark may hit only its nearest slot or every slot in its window
    #[arg(long = "hit-policy", value_enum)]
    hit_policy: Option<HitPolicy>,

    /// Worker threads (default: all cores)
    #[arg(short = 'j', long = "threads")]
    threads: Option<usize>,

    /// Write annotated copies of every scan
    #[arg(long = "overlay", short = 'o')]
    overlay: bool,

    /// Write a nominal vs calibrated position plot
    #[arg(long = "plot", short = 'p')]
    plot: bool,

    /// Results file format
    #[arg(short = 'f', long = "format", value_enum)]
    format: Option<OutputFormat>,

    /// Print the layout JSON (built-in or --layout) and exit
    #[arg(long = "dump-layout")]
    dump_layout: bool,
}

impl Cli {
    fn into_config(self) -> Result<RunConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };
        if let Some(v) = self.keys {
            config.key_dir = v;
        }
        if let Some(v) = self.sheets {
            config.sheet_dir = v;
        }
        if let Some(v) = self.results {
            config.results_dir = v;
        }
        if let Some(v) = self.layout {
            config.layout = Some(v);
        }
        if let Some(v) = self.tolerance {
            config.pixel_differential = v;
        }
        if let Some(v) = self.color {
            config.mark_color = v;
            config.hsv_range = None;
        }
        if let Some(v) = self.hit_policy {
            config.hit_policy = v;
        }
        if let Some(v) = self.threads {
            config.threads = Some(v);
        }
        if let Some(v) = self.format {
            config.output_format = v;
        }
        config.overlays |= self.overlay;
        config.plot |= self.plot;
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let dump_layout = cli.dump_layout;
    let config = cli.into_config()?;

    if dump_layout {
        println!("{}", config.load_layout()?.to_json_string()?);
        return Ok(());
    }

    let report = match pipeline::run(&config) {
        Ok(report) => report,
        Err(err) => {
            if let PipelineError::NoUsableKeys {
                unreadable,
                rejected,
                ..
            } = &err
            {
                print_problems(rejected, unreadable);
            }
            return Err(err.into());
        }
    };

    println!(
        "{}: {} of {} key(s) used, {} sheet(s) decoded",
        report.layout,
        report.keys_used,
        report.keys_found,
        report.sheets.len()
    );
    print_problems(&report.rejected_keys, &report.skipped);
    println!("Results: {}", report.output.display());
    println!("Template: {}", report.template_path.display());
    if let Some(plot) = &report.plot {
        println!("Plot: {}", plot.display());
    }
    Ok(())
}

fn print_problems(rejected: &[RejectedKey], skipped: &[SkippedImage]) {
    for key in rejected {
        println!(
            "  rejected key {}: {} marks (expected {})",
            key.path.display(),
            key.marks,
            key.expected
        );
    }
    for image in skipped {
        println!("  skipped {}: {}", image.path.display(), image.reason);
    }
}
