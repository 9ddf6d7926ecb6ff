use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use sccore::detect::{DetectionParams, Detector};
use sccore::extract::{extract, output_path};
use sccore::protocol::Registry;

const AUTO: &str = "auto";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Extract cell barcode and UMI from R1 and add them to the read names of R2"
)]
struct Args {
    /// Protocol registry (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Comma-separated R1 files (barcode + UMI), one per lane
    #[arg(long, value_delimiter = ',', required = true)]
    fq1: Vec<PathBuf>,

    /// Comma-separated R2 files, in the same lane order as --fq1
    #[arg(long, value_delimiter = ',', required = true)]
    fq2: Vec<PathBuf>,

    /// Sample name; output is <outdir>/<sample>_R2.fq.gz
    #[arg(short, long)]
    sample: String,

    /// Output directory
    #[arg(short, long, default_value = ".")]
    outdir: PathBuf,

    /// Protocol name from the registry, or 'auto' to detect it from R1
    #[arg(short, long, default_value = AUTO)]
    protocol: String,

    /// Reads sampled from each R1 file for protocol detection
    #[arg(long, default_value_t = 10_000)]
    max_reads: usize,

    /// Optional FASTQ for the R1 records of dropped pairs
    #[arg(long)]
    invalid_out: Option<PathBuf>,

    /// Number of threads for whitelist indexing
    #[arg(short, long, default_value_t = 4)]
    threads: usize,
}

fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .try_init();
}

/// CLI entry point: load the registry, pick the protocol, extract, and print
/// a tab-separated summary: sample, protocol, raw, valid, percent_valid,
/// corrected, percent_corrected.
fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads)
        .build_global()?;

    let registry = Registry::from_path(&args.config)?;

    let protocol = if args.protocol == AUTO {
        let params = DetectionParams {
            max_reads: args.max_reads,
            ..Default::default()
        };
        Detector::new(&registry, params).detect_paths(&args.fq1)?.protocol
    } else {
        registry.get(&args.protocol)?
    };

    let out = output_path(&args.outdir, &args.sample);
    let stats = extract(&args.fq1, &args.fq2, protocol, &out, args.invalid_out.as_deref())?;

    println!(
        "{}\t{}\t{}\t{}\t{:.2}\t{}\t{:.2}",
        args.sample,
        protocol.name(),
        stats.raw_reads,
        stats.valid_reads,
        stats.valid_fraction() * 100.0,
        stats.corrected_reads,
        stats.corrected_fraction() * 100.0
    );

    Ok(())
}
