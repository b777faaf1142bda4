// Passive HTTP application fingerprinting and outbound traffic anomaly
// detection.
//
// Three mutually exclusive modes:
//   csv      — offline detection over a directory of CSV fingerprint dumps
//   log      — train on one log, test against another (optionally dumping
//              fingerprints to CSV instead of live detection)
//   evaluate — like `log`, but prints a detection-performance report
//              against the `is_malicious` ground truth carried by the
//              testing log

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use driftglass::aggregator::Aggregator;
use driftglass::config::Config;
use driftglass::detector;
use driftglass::eval;
use driftglass::fingerprint::{self, FingerprintStore};
use driftglass::loader;
use driftglass::mode::Mode;

#[derive(Parser)]
#[command(
    name = "driftglass",
    about = "Passive HTTP application fingerprinting and outbound traffic anomaly detection",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    tunables: Tunables,
}

#[derive(Subcommand)]
enum Command {
    /// Offline detection over a directory of training/testing CSV fingerprint dumps.
    Csv {
        /// Directory containing `*training*.csv` and `*testing*.csv` files,
        /// processed in lexicographic order.
        dir: PathBuf,
    },
    /// Train on one log, then run the testing log either against the
    /// trained store (online) or dump its fingerprints to CSV (offline).
    Log {
        #[arg(long)]
        training: PathBuf,
        #[arg(long)]
        testing: PathBuf,
        /// Dump fingerprints to CSV instead of comparing them live.
        #[arg(long)]
        offline: bool,
        /// Required when `--offline` is set.
        #[arg(long)]
        training_csv_out: Option<PathBuf>,
        /// Required when `--offline` is set.
        #[arg(long)]
        testing_csv_out: Option<PathBuf>,
    },
    /// Train + test, then print a detection-performance report against
    /// the `is_malicious` ground truth carried by the testing log.
    Evaluate {
        #[arg(long)]
        training: PathBuf,
        #[arg(long)]
        testing: PathBuf,
    },
}

#[derive(Args, Clone)]
struct Tunables {
    #[arg(long, default_value_t = 10)]
    window_minutes: i64,
    #[arg(long, default_value_t = 2.5)]
    background_threshold: f32,
    #[arg(long, default_value_t = 2.0)]
    browser_threshold: f32,
    #[arg(long, default_value_t = 1000)]
    outgoing_threshold: u64,
    #[arg(long, default_value_t = 0.10)]
    update_threshold: f64,
    #[arg(long, default_value_t = 0.30)]
    avg_size_margin: f64,
    #[arg(long, default_value_t = 2)]
    subdomains: usize,
    #[arg(long, default_value_t = 600)]
    graph_time_threshold: i64,
    #[arg(long, default_value_t = 0.10)]
    similarity_edit_threshold: f64,
    #[arg(long, default_value_t = 500)]
    exfiltration_outgoing_threshold: u64,
    #[arg(long, default_value_t = 0.5)]
    connectedness_ratio: f64,
}

impl From<Tunables> for Config {
    fn from(t: Tunables) -> Self {
        Config {
            window: chrono::Duration::minutes(t.window_minutes),
            background_threshold: t.background_threshold,
            browser_threshold: t.browser_threshold,
            outgoing_threshold: t.outgoing_threshold,
            update_threshold: t.update_threshold,
            avg_size_margin: t.avg_size_margin,
            subdomains: t.subdomains,
            graph_time_threshold: t.graph_time_threshold,
            similarity_edit_threshold: t.similarity_edit_threshold,
            exfiltration_outgoing_threshold: t.exfiltration_outgoing_threshold,
            connectedness_ratio: t.connectedness_ratio,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .compact()
        .init();

    let cli = Cli::parse();
    let config: Config = cli.tunables.into();

    match cli.command {
        Command::Csv { dir } => run_csv_mode(&dir, &config),
        Command::Log {
            training,
            testing,
            offline,
            training_csv_out,
            testing_csv_out,
        } => {
            run_log_mode(&training, &testing, offline, training_csv_out, testing_csv_out, &config).await
        }
        Command::Evaluate { training, testing } => run_evaluate_mode(&training, &testing, &config).await,
    }
}

/// Files whose name contains `training` feed the trained store; files
/// containing `testing` feed the testing path. Files are processed in
/// lexicographic order (§6).
fn run_csv_mode(dir: &std::path::Path, config: &Config) -> Result<()> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading directory {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    let mut store = FingerprintStore::new();
    let mut testing_store = FingerprintStore::new();

    for path in &entries {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if name.contains("training") {
            info!(file = %path.display(), "loading training fingerprints");
            fingerprint::load_fingerprints(path, &mut store)?;
        } else if name.contains("testing") {
            info!(file = %path.display(), "loading testing fingerprints");
            fingerprint::load_fingerprints(path, &mut testing_store)?;
        }
    }

    // The reference offline detector pools every host's training
    // fingerprints into one flat list before comparing, rather than scoping
    // the comparison to the testing fingerprint's own host — preserved here
    // rather than narrowed to a per-host lookup.
    let mut pooled: Vec<_> = store.iter().map(|(_, fp)| fp.clone()).collect();

    let mut alerts = 0usize;
    let mut total = 0usize;
    for (host, fp) in testing_store.iter() {
        total += 1;
        let fp = fp.clone();
        if detector::detect(&mut pooled, &fp, config) {
            alerts += 1;
            info!(host = %host, user_agent = %fp.user_agent, "alert");
        }
    }

    println!("Fingerprints tested: {total}");
    println!("Alerts raised:       {alerts}");
    Ok(())
}

async fn run_log_mode(
    training: &std::path::Path,
    testing: &std::path::Path,
    offline: bool,
    training_csv_out: Option<PathBuf>,
    testing_csv_out: Option<PathBuf>,
    config: &Config,
) -> Result<()> {
    let training_records = loader::load_requests(training).await?;
    info!(count = training_records.len(), "loaded training records");

    let mut aggregator = Aggregator::new(*config);
    aggregator.analyse(training_records, Mode::Training)?;
    info!(fingerprints = aggregator.store().len(), "training complete");

    if offline {
        let out = training_csv_out.context("--training-csv-out is required with --offline")?;
        fingerprint::dump_fingerprints(&out, aggregator.store())?;
        aggregator.set_offline_sink(testing_csv_out.context("--testing-csv-out is required with --offline")?);
    }

    let testing_records = loader::load_requests(testing).await?;
    info!(count = testing_records.len(), "loaded testing records");
    aggregator.analyse(testing_records, Mode::Testing)?;

    if !offline {
        println!("Alerts raised: {}", aggregator.alerts().len());
        for alert in aggregator.alerts() {
            println!(
                "  host={} method={} label={} user_agent={:?}",
                alert.host, alert.fingerprint.method, alert.fingerprint.label, alert.fingerprint.user_agent
            );
        }
    }

    Ok(())
}

async fn run_evaluate_mode(training: &std::path::Path, testing: &std::path::Path, config: &Config) -> Result<()> {
    let training_records = loader::load_requests(training).await?;
    let testing_records = loader::load_requests(testing).await?;

    let mut aggregator = Aggregator::new(*config);
    aggregator.enable_eval_tracking();
    aggregator.analyse(training_records, Mode::Training)?;
    aggregator.analyse(testing_records, Mode::Testing)?;

    let report = eval::build_report(aggregator.eval_records());
    eval::report::print_report(&report);
    Ok(())
}
