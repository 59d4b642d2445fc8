use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use cullscan::config::{Config, KeepPolicy, Reducer, SignalThreshold, ThresholdPolicy};
use cullscan::core::scanner::{ScanPhase, ScanProgress};
use cullscan::database::{CACHE_FILE_NAME, FingerprintStore, SqliteStore};
use cullscan::{TriageOutcome, TriagePipeline, TriageReport};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(
    name = "cullscan",
    version,
    about = "Find blurry photos and near-duplicates"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify blur and find near-duplicate groups
    Scan {
        /// Directory to scan
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,

        #[command(flatten)]
        options: TriageArgs,
    },

    /// Inspect or reset the fingerprint cache of a folder
    Cache {
        #[command(subcommand)]
        command: CacheCmd,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCmd {
    /// Show how many fingerprints are cached
    Stats {
        /// Directory containing the photos
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },

    /// Drop every cached fingerprint
    Clear {
        /// Directory containing the photos
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ThresholdMode {
    Fixed,
    Percentile,
    Zscore,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ReducerArg {
    Median,
    Mean,
    Max,
    Min,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum KeepArg {
    Sharpest,
    HighestResolution,
    FirstPath,
}

#[derive(Args, Debug, Default)]
struct TriageArgs {
    /// JSON config file; flags below override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// How the Laplacian blur threshold is derived
    #[arg(long, value_enum)]
    blur_mode: Option<ThresholdMode>,
    /// Threshold value, percentile (0-100) or z-score k
    #[arg(long, allow_negative_numbers = true)]
    blur_param: Option<f64>,

    /// Judge blur on the Laplacian score alone
    #[arg(long, conflicts_with_all = ["ten_mode", "ten_param"])]
    no_tenengrad: bool,
    #[arg(long, value_enum)]
    ten_mode: Option<ThresholdMode>,
    #[arg(long, allow_negative_numbers = true)]
    ten_param: Option<f64>,

    /// How per-scale Laplacian variances are combined
    #[arg(long, value_enum)]
    reducer: Option<ReducerArg>,
    /// Gaussian pre-blur kernel size
    #[arg(long)]
    kernel: Option<u32>,
    /// Laplacian aperture: 1 (4-neighbour) or 3
    #[arg(long)]
    lap_ksize: Option<u32>,

    #[arg(long)]
    phash_radius: Option<u32>,
    #[arg(long)]
    dhash_radius: Option<u32>,
    /// Neighbours each image keeps in the mutual nearest-neighbour step
    #[arg(long)]
    mnn_k: Option<usize>,
    #[arg(long)]
    ssim_threshold: Option<f64>,
    /// Only the best N pairs are checked with SSIM
    #[arg(long)]
    ssim_top_n: Option<usize>,
    /// Minimum HSV histogram correlation
    #[arg(long)]
    hsv_min: Option<f64>,
    /// Leave blurry images out of duplicate search
    #[arg(long)]
    exclude_blurry: bool,
    /// Which image of a group to keep
    #[arg(long, value_enum)]
    keep: Option<KeepArg>,

    /// Extraction threads (default: all CPUs)
    #[arg(long)]
    workers: Option<usize>,
    /// Glob pattern of paths to skip (repeatable)
    #[arg(long = "exclude", value_name = "GLOB")]
    exclude: Vec<String>,
    /// Hash file contents instead of trusting size and mtime
    #[arg(long)]
    content_signature: bool,

    /// Log the stage-count summary
    #[arg(long)]
    debug: bool,
    /// Write per-stage pair records to a CSV file
    #[arg(long, value_name = "FILE")]
    debug_csv: Option<PathBuf>,
    /// Print the full report as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan { path, options } => {
            let config = build_config(&options)?;
            println!("▶ Triage of: {}", path.display());

            let outcome = benchmark("triage", || run_with_progress(config, &path))?;
            match outcome {
                TriageOutcome::Completed(report) => {
                    if options.json {
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    } else {
                        print_report(&report);
                    }
                }
                TriageOutcome::Cancelled(stats) => {
                    println!(
                        "⚠️  Cancelled after {} extractions; cached results are kept.",
                        stats.extracted
                    );
                }
            }
        }

        Commands::Cache { command } => match command {
            CacheCmd::Stats { path } => {
                let store = SqliteStore::open_at(&path).with_context(|| {
                    format!("Could not open cache in {}", path.display())
                })?;
                println!("🗂️  Cache: {}", path.join(CACHE_FILE_NAME).display());
                println!("   {} fingerprint(s)", store.len()?);
            }

            CacheCmd::Clear { path } => {
                let mut store = SqliteStore::open_or_reset(&path).with_context(|| {
                    format!("Could not open cache in {}", path.display())
                })?;
                let removed = store.clear()?;
                println!("🧹 Removed {} cached fingerprint(s)", removed);
            }
        },
    }

    Ok(())
}

fn build_config(args: &TriageArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(file) => Config::from_file(file)
            .with_context(|| format!("Failed to load config {}", file.display()))?,
        None => Config::default(),
    };

    let blur = &mut config.blur;
    blur.threshold = override_threshold(blur.threshold, args.blur_mode, args.blur_param);
    if args.no_tenengrad {
        blur.tenengrad = None;
    } else if args.ten_mode.is_some() || args.ten_param.is_some() {
        let current = blur.tenengrad.unwrap_or(SignalThreshold::fixed(800.0));
        blur.tenengrad = Some(override_threshold(current, args.ten_mode, args.ten_param));
    }
    if let Some(reducer) = args.reducer {
        blur.reducer = match reducer {
            ReducerArg::Median => Reducer::Median,
            ReducerArg::Mean => Reducer::Mean,
            ReducerArg::Max => Reducer::Max,
            ReducerArg::Min => Reducer::Min,
        };
    }
    if let Some(kernel) = args.kernel {
        blur.gaussian_kernel = kernel;
    }
    if let Some(ksize) = args.lap_ksize {
        blur.laplacian_ksize = ksize;
    }

    let sim = &mut config.similarity;
    if let Some(radius) = args.phash_radius {
        sim.phash_radius = radius;
    }
    if let Some(radius) = args.dhash_radius {
        sim.dhash_radius = radius;
    }
    if let Some(k) = args.mnn_k {
        sim.mnn_k = k;
    }
    if let Some(threshold) = args.ssim_threshold {
        sim.ssim_threshold = threshold;
    }
    if let Some(top_n) = args.ssim_top_n {
        sim.ssim_top_n = top_n;
    }
    if let Some(min) = args.hsv_min {
        sim.hsv_min_correlation = min;
    }
    if args.exclude_blurry {
        sim.exclude_blurry = true;
    }
    if let Some(keep) = args.keep {
        sim.keep_policy = match keep {
            KeepArg::Sharpest => KeepPolicy::Sharpest,
            KeepArg::HighestResolution => KeepPolicy::HighestResolution,
            KeepArg::FirstPath => KeepPolicy::FirstPath,
        };
    }

    let scan = &mut config.scan;
    if args.workers.is_some() {
        scan.workers = args.workers;
    }
    scan.exclude_patterns.extend(args.exclude.iter().cloned());
    if args.content_signature {
        scan.signature = cullscan::database::SignatureMode::Content;
    }

    if args.debug {
        config.debug.stage_counts = true;
    }
    if args.debug_csv.is_some() {
        config.debug.pairs_csv = args.debug_csv.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// A mode without a parameter takes that mode's usual default; a
/// parameter without a mode keeps the current mode.
fn override_threshold(
    current: SignalThreshold,
    mode: Option<ThresholdMode>,
    param: Option<f64>,
) -> SignalThreshold {
    let policy = match (mode, current.policy) {
        (Some(ThresholdMode::Fixed), _) => ThresholdPolicy::Fixed(param.unwrap_or(current.fallback)),
        (Some(ThresholdMode::Percentile), _) => ThresholdPolicy::Percentile(param.unwrap_or(10.0)),
        (Some(ThresholdMode::Zscore), _) => ThresholdPolicy::ZScore(param.unwrap_or(-1.0)),
        (None, ThresholdPolicy::Fixed(v)) => ThresholdPolicy::Fixed(param.unwrap_or(v)),
        (None, ThresholdPolicy::Percentile(p)) => ThresholdPolicy::Percentile(param.unwrap_or(p)),
        (None, ThresholdPolicy::ZScore(k)) => ThresholdPolicy::ZScore(param.unwrap_or(k)),
    };
    SignalThreshold {
        policy,
        fallback: current.fallback,
    }
}

/// Runs the pipeline while a background thread renders its progress.
fn run_with_progress(config: Config, path: &Path) -> Result<TriageOutcome> {
    let (tx, rx) = crossbeam_channel::unbounded::<ScanProgress>();

    let bar = ProgressBar::new(0);
    bar.set_style(ProgressStyle::with_template(
        "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    )?);
    bar.enable_steady_tick(Duration::from_millis(100));

    let renderer = {
        let bar = bar.clone();
        thread::spawn(move || {
            let mut phase = None;
            for progress in rx.iter() {
                if phase != Some(progress.phase) {
                    phase = Some(progress.phase);
                    bar.set_message(phase_label(progress.phase));
                }
                bar.set_length(progress.total_files as u64);
                bar.set_position(progress.files_processed as u64);
            }
        })
    };

    let outcome = {
        let pipeline = TriagePipeline::new(config)?.with_progress_sender(tx);
        pipeline
            .run(path)
            .with_context(|| format!("Triage of {} failed", path.display()))
    };

    // The pipeline and its sender are gone, so the renderer drains and exits.
    let _ = renderer.join();
    bar.finish_and_clear();
    outcome
}

fn phase_label(phase: ScanPhase) -> &'static str {
    match phase {
        ScanPhase::Discovery => "Discovering images…",
        ScanPhase::Fingerprinting => "Fingerprinting…",
        ScanPhase::Classification => "Classifying blur…",
        ScanPhase::Candidates => "Searching for near-duplicates…",
        ScanPhase::Refinement => "Refining pairs…",
        ScanPhase::Complete => "Done",
    }
}

fn print_report(report: &TriageReport) {
    let stats = &report.scan;
    println!(
        "📊 {} image(s): {} cached, {} extracted, {} unreadable",
        stats.discovered, stats.cached, stats.extracted, stats.failed
    );
    for failed in &report.failed {
        eprintln!("⚠️  Could not read {}", failed.display());
    }

    let blurry: Vec<_> = report.blur.blurry().collect();
    if blurry.is_empty() {
        println!("\nNo blurry images found.");
    } else {
        println!(
            "\n🌫️  {} blurry image(s) (threshold {:.2}):",
            blurry.len(),
            report.blur.threshold.value
        );
        for verdict in blurry {
            match verdict.tenengrad {
                Some(tenengrad) => println!(
                    "   ▶ {} (score {:.2}, tenengrad {:.2})",
                    verdict.path.display(),
                    verdict.score,
                    tenengrad
                ),
                None => println!("   ▶ {} (score {:.2})", verdict.path.display(), verdict.score),
            }
        }
    }

    let groups = &report.similarity.groups;
    if groups.is_empty() {
        println!("\nNo duplicates found.");
    } else {
        println!("\nFound {} duplicate group(s):", groups.len());
        for group in groups {
            println!("\n✨ Group {}:", group.id);
            println!("   🏆 Keeping → {}", group.keep.display());
            for candidate in &group.candidates {
                println!("   📦 Candidate → {}", candidate.display());
            }
        }
    }

    println!("\n{}", report.similarity.counts);
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
