mod ingest;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trendline::{
    Bucketing, DerivedBundle, SampleSequence, SlotId, Smoothing, ToleranceMode, TrendConfig,
    TrendKind, TrendPipeline, WindowKind,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Trend segmentation for GPX tracks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split tracks into rising/flat/falling segments and bucketed trend boundaries
    Analyze(AnalyzeArgs),
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    /// GPX files to ingest
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Measure to segment on
    #[arg(long, default_value = "elevation")]
    measure: String,

    /// Number of value buckets across the observed range
    #[arg(long)]
    buckets: Option<u32>,

    /// Fixed bucket width in the measure's unit
    #[arg(long, conflicts_with = "buckets")]
    bucket_step: Option<f64>,

    /// Decimal digits of precision for flat detection
    #[arg(long)]
    tolerance_digits: Option<u32>,

    /// Scale the flat tolerance by the observed value span
    #[arg(long, action = ArgAction::SetTrue)]
    relative_tolerance: bool,

    /// Reclassify rising/falling segments smaller than this as flat
    #[arg(long)]
    min_amplitude: Option<f64>,

    /// Ignore readings whose accuracy (DOP) is worse than this
    #[arg(long)]
    max_accuracy: Option<f64>,

    /// Smooth the measure with a moving window of this many samples (odd, >= 3)
    #[arg(long)]
    smooth_window: Option<usize>,

    /// Window shape for --smooth-window: triangular, hanning or gaussian
    #[arg(long, default_value = "triangular", requires = "smooth_window")]
    window: WindowKind,

    /// JSON file with a trend configuration; flags override its fields
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = FormatOpt::Csv)]
    format: FormatOpt,

    /// Output path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FormatOpt {
    Csv,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match &cli.command {
        Command::Analyze(args) => {
            if args.verbose {
                "debug"
            } else {
                "info"
            }
        }
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Analyze(args) => handle_analyze(args),
    }
}

fn load_config(args: &AnalyzeArgs) -> Result<TrendConfig> {
    let mut config = match args.config.as_ref() {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => TrendConfig::default(),
    };
    if let Some(count) = args.buckets {
        config.buckets = Bucketing::Count(count);
    }
    if let Some(step) = args.bucket_step {
        config.buckets = Bucketing::Step(step);
    }
    if let Some(digits) = args.tolerance_digits {
        config.tolerance.digits = digits;
    }
    if args.relative_tolerance {
        config.tolerance.mode = ToleranceMode::Relative;
    }
    if args.min_amplitude.is_some() {
        config.min_amplitude = args.min_amplitude;
    }
    if args.max_accuracy.is_some() {
        config.max_accuracy = args.max_accuracy;
    }
    if let Some(size) = args.smooth_window {
        config.smoothing = Some(Smoothing::new(args.window, size));
    }
    config.validate().context("invalid trend configuration")?;
    Ok(config)
}

#[derive(Serialize)]
struct FileReport {
    file: String,
    samples: usize,
    measure: String,
    bundle: Arc<DerivedBundle>,
}

fn handle_analyze(args: AnalyzeArgs) -> Result<()> {
    let config = load_config(&args)?;
    let measure = ingest::measure_index(&args.measure).ok_or_else(|| {
        anyhow!(
            "unknown measure {:?} (expected one of {})",
            args.measure,
            ingest::MEASURE_NAMES.join(", ")
        )
    })?;

    if let Some(smoothing) = &config.smoothing {
        info!(
            "Smoothing {} with a {}-sample {} window",
            args.measure,
            smoothing.size,
            smoothing.window.as_str()
        );
    }

    let t_parse = Instant::now();
    let sequences: Vec<(PathBuf, Arc<SampleSequence>)> = args
        .inputs
        .par_iter()
        .map(|path| -> Result<(PathBuf, Arc<SampleSequence>)> {
            let sequence = ingest::read_gpx(path)?;
            Ok((path.clone(), Arc::new(sequence)))
        })
        .collect::<Result<Vec<_>>>()?;
    if args.verbose {
        info!(
            "Parse stage: {:.1} ms ({} files)",
            t_parse.elapsed().as_secs_f64() * 1000.0,
            sequences.len()
        );
    }

    let t_compute = Instant::now();
    let pipeline = TrendPipeline::new();
    let reports: Vec<FileReport> = sequences
        .par_iter()
        .map(|(path, sequence)| -> Result<FileReport> {
            let slot = SlotId::for_measure(path.display().to_string(), measure);
            let bundle = pipeline
                .provide(&slot, Some(Arc::clone(sequence)), &config)
                .with_context(|| format!("failed to analyze {}", path.display()))?;
            Ok(FileReport {
                file: path.display().to_string(),
                samples: sequence.count(),
                measure: ingest::MEASURE_NAMES[measure].to_string(),
                bundle,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    if args.verbose {
        info!(
            "Compute stage: {:.1} ms",
            t_compute.elapsed().as_secs_f64() * 1000.0
        );
    }

    for report in &reports {
        log_trend_summary(report);
    }

    let to_stdout = args.output.as_os_str() == "-";
    match (args.format, to_stdout) {
        (FormatOpt::Csv, true) => {
            let stdout = io::stdout();
            write_rows(&reports, &mut csv::Writer::from_writer(stdout.lock()))?;
        }
        (FormatOpt::Csv, false) => {
            let file = create(&args.output)?;
            write_rows(&reports, &mut csv::Writer::from_writer(file))?;
        }
        (FormatOpt::Json, true) => {
            let stdout = io::stdout();
            write_json(&reports, stdout.lock())?;
        }
        (FormatOpt::Json, false) => {
            write_json(&reports, create(&args.output)?)?;
        }
    }
    if !to_stdout {
        info!("Wrote {}", args.output.display());
    }
    Ok(())
}

fn create(path: &Path) -> Result<File> {
    File::create(path).with_context(|| format!("failed to create {}", path.display()))
}

fn log_trend_summary(report: &FileReport) {
    let bundle = &report.bundle;
    if bundle.is_empty() {
        warn!("{}: no segments", report.file);
        return;
    }
    let mut per_trend: BTreeMap<TrendKind, (usize, f64)> = BTreeMap::new();
    for segment in &bundle.segments {
        let entry = per_trend.entry(segment.trend).or_insert((0, 0.0));
        entry.0 += 1;
        let delta = segment.delta();
        if delta.is_finite() {
            entry.1 += delta.abs();
        }
    }
    info!(
        "{}: {} samples, {} segments, {} boundaries on {}",
        report.file,
        report.samples,
        bundle.segments.len(),
        bundle.boundaries.len(),
        report.measure
    );
    for (trend, (count, total)) in per_trend {
        info!("  {:<8} {:>4} segments, {:.1} total change", trend.as_str(), count, total);
    }
}

fn fmt_value(value: f64) -> String {
    if value.is_finite() {
        format!("{value:.3}")
    } else {
        String::new()
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(fmt_value).unwrap_or_default()
}

fn write_rows<W: Write>(reports: &[FileReport], writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record([
        "file",
        "record",
        "id",
        "trend",
        "start_ms",
        "end_ms",
        "from",
        "to",
        "min",
        "max",
        "mean",
        "samples",
        "abs_delta",
        "cumulative_abs_delta",
    ])?;

    for report in reports {
        let bundle = &report.bundle;
        for (i, (segment, summary)) in bundle.segments.iter().zip(&bundle.summaries).enumerate() {
            writer.write_record([
                report.file.clone(),
                "segment".into(),
                i.to_string(),
                segment.trend.to_string(),
                segment.start_time.to_string(),
                segment.end_time.to_string(),
                fmt_value(segment.start_value),
                fmt_value(segment.end_value),
                fmt_opt(summary.min),
                fmt_opt(summary.max),
                fmt_opt(summary.mean),
                summary.sample_count.to_string(),
                fmt_value(segment.delta().abs()),
                String::new(),
            ])?;
        }
        for boundary in &bundle.boundaries {
            let stats = &boundary.statistics;
            writer.write_record([
                report.file.clone(),
                "boundary".into(),
                boundary.label.clone(),
                boundary.trend.to_string(),
                boundary.start_time.to_string(),
                boundary.end_time.to_string(),
                fmt_value(boundary.value_range.lower),
                fmt_value(boundary.value_range.upper),
                fmt_value(stats.min),
                fmt_value(stats.max),
                fmt_value(stats.mean),
                stats.sample_count.to_string(),
                fmt_value(stats.abs_delta),
                fmt_value(stats.cumulative_abs_delta),
            ])?;
        }
    }

    writer.flush()?;
    Ok(())
}

fn write_json<W: Write>(reports: &[FileReport], mut out: W) -> Result<()> {
    serde_json::to_writer_pretty(&mut out, reports)?;
    writeln!(out)?;
    Ok(())
}
