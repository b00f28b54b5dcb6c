//! # Fanout CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Deliver a JSON Lines file to an HTTP endpoint, 50 concurrent, 500/min
//! fanout run --input records.jsonl --endpoint http://127.0.0.1:9000/ingest \
//!   --concurrency 50 --bucket-capacity 1000 --refill-tokens 500 --refill-interval-ms 60000
//!
//! # Try settings against a simulated endpoint
//! fanout run --synthetic 10000 --simulate --throttle-pct 10 --latency-ms 50
//!
//! # Ordered, batched delivery with per-record outcomes written out
//! fanout run --input records.jsonl --endpoint http://127.0.0.1:9000/ingest \
//!   --ordered --batch-size 25 --records-out outcomes.jsonl
//!
//! # Validate settings and scan an input file
//! fanout check --input records.jsonl --concurrency 50
//! ```
//!
//! The summary is printed as JSON on stdout; logs go to stderr.

use anyhow::Result;
use argh::FromArgs;
use fanout_cli::{SimulatedTransport, SimulationProfile};
use fanout_common::{
    AdmissionConfig, BatchConfig, DispatchConfig, HttpTransport, JsonLinesSource, RecordSource,
    RetryConfig, SourceError, Transport, VecSource,
};
use fanout_engine::{CancellationToken, Engine};
use fanout_metrics::OutcomeSummary;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable consulted when `--endpoint` is not given
const ENDPOINT_ENV: &str = "FANOUT_ENDPOINT";

#[derive(FromArgs)]
/// Fanout - rate-limited record dispatch
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Run(RunArgs),
    Check(CheckArgs),
}

/// Arguments for a dispatch run.
#[derive(FromArgs)]
#[argh(subcommand, name = "run")]
/// dispatch records to an endpoint
struct RunArgs {
    /// JSON Lines file with one `{"id"?, "payload"}` object per line
    #[argh(option, short = 'i')]
    input: Option<PathBuf>,

    /// generate this many synthetic records instead of reading a file
    #[argh(option)]
    synthetic: Option<u64>,

    /// endpoint URL to POST records to (falls back to FANOUT_ENDPOINT)
    ///
    /// Must include the http:// prefix.
    #[argh(option, short = 'e')]
    endpoint: Option<String>,

    /// deliver to an in-process simulated endpoint
    #[argh(switch)]
    simulate: bool,

    /// maximum concurrent invocations
    #[argh(option, short = 'c', default = "10")]
    concurrency: usize,

    /// burst size of the rate bucket
    #[argh(option, default = "100")]
    bucket_capacity: u32,

    /// tokens added to the bucket every refill interval
    #[argh(option, default = "50")]
    refill_tokens: u32,

    /// refill interval in milliseconds
    #[argh(option, default = "1000")]
    refill_interval_ms: u64,

    /// maximum attempts per record, including the first
    #[argh(option, default = "3")]
    max_retries: u32,

    /// base retry delay in milliseconds
    #[argh(option, default = "100")]
    base_delay_ms: u64,

    /// upper bound on a single retry delay in milliseconds
    #[argh(option, default = "30000")]
    max_delay_ms: u64,

    /// disable retry jitter
    #[argh(switch)]
    no_jitter: bool,

    /// records allowed in flight at once (defaults to 4x concurrency)
    #[argh(option)]
    in_flight_ceiling: Option<usize>,

    /// deliver records in source order (implies batching)
    #[argh(switch)]
    ordered: bool,

    /// deliver through a buffer in batches of this size
    #[argh(option)]
    batch_size: Option<usize>,

    /// how long a consumer waits to fill a batch, in milliseconds
    #[argh(option, default = "100")]
    poll_interval_ms: u64,

    /// capacity of the batching buffer
    #[argh(option, default = "100")]
    buffer_capacity: usize,

    /// number of buffer partitions for unordered batching
    #[argh(option, default = "1")]
    partitions: usize,

    /// cancel the run after this many seconds
    #[argh(option)]
    deadline_secs: Option<u64>,

    /// log progress every this many seconds
    #[argh(option)]
    progress_secs: Option<u64>,

    /// per-request timeout for the HTTP endpoint in milliseconds
    #[argh(option, default = "30000")]
    request_timeout_ms: u64,

    /// simulated endpoint: percentage of throttled calls
    #[argh(option, default = "5")]
    throttle_pct: u8,

    /// simulated endpoint: percentage of transient failures
    #[argh(option, default = "5")]
    transient_pct: u8,

    /// simulated endpoint: percentage of fatal failures
    #[argh(option, default = "1")]
    fatal_pct: u8,

    /// simulated endpoint: latency of each call in milliseconds
    #[argh(option, default = "20")]
    latency_ms: u64,

    /// simulated endpoint: random seed
    #[argh(option, default = "0")]
    seed: u64,

    /// write every record's outcome to this file as JSON Lines
    #[argh(option)]
    records_out: Option<PathBuf>,

    /// exit with an error if any record failed
    #[argh(switch)]
    fail_on_error: bool,
}

/// Arguments for validating settings without dispatching.
#[derive(FromArgs)]
#[argh(subcommand, name = "check")]
/// validate settings and scan an input file
struct CheckArgs {
    /// JSON Lines file to scan
    #[argh(option, short = 'i')]
    input: Option<PathBuf>,

    /// maximum concurrent invocations
    #[argh(option, short = 'c', default = "10")]
    concurrency: usize,

    /// burst size of the rate bucket
    #[argh(option, default = "100")]
    bucket_capacity: u32,

    /// tokens added to the bucket every refill interval
    #[argh(option, default = "50")]
    refill_tokens: u32,

    /// refill interval in milliseconds
    #[argh(option, default = "1000")]
    refill_interval_ms: u64,

    /// maximum attempts per record, including the first
    #[argh(option, default = "3")]
    max_retries: u32,

    /// base retry delay in milliseconds
    #[argh(option, default = "100")]
    base_delay_ms: u64,

    /// upper bound on a single retry delay in milliseconds
    #[argh(option, default = "30000")]
    max_delay_ms: u64,

    /// records allowed in flight at once (defaults to 4x concurrency)
    #[argh(option)]
    in_flight_ceiling: Option<usize>,

    /// deliver through a buffer in batches of this size
    #[argh(option)]
    batch_size: Option<usize>,

    /// capacity of the batching buffer
    #[argh(option, default = "100")]
    buffer_capacity: usize,

    /// number of buffer partitions for unordered batching
    #[argh(option, default = "1")]
    partitions: usize,
}

/// Settings shared by `run` and `check`.
struct Settings {
    concurrency: usize,
    bucket_capacity: u32,
    refill_tokens: u32,
    refill_interval: Duration,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    in_flight_ceiling: Option<usize>,
    ordered: bool,
    batch_size: Option<usize>,
    poll_interval: Duration,
    buffer_capacity: usize,
    partitions: usize,
    deadline: Option<Duration>,
}

impl Settings {
    fn dispatch_config(&self) -> DispatchConfig {
        let admission = AdmissionConfig::new(
            self.concurrency,
            self.bucket_capacity,
            self.refill_tokens,
            self.refill_interval,
        );
        let retry = RetryConfig::new(self.max_retries)
            .with_base_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_jitter(self.jitter);

        let mut config = DispatchConfig::new(admission)
            .with_retry(retry)
            .with_ordering_required(self.ordered);
        if let Some(ceiling) = self.in_flight_ceiling {
            config = config.with_in_flight_ceiling(ceiling);
        }
        if self.ordered || self.batch_size.is_some() {
            let batch_size = self.batch_size.unwrap_or(BatchConfig::default().batch_size);
            config = config.with_batching(
                BatchConfig::new(batch_size, self.poll_interval)
                    .with_buffer_capacity(self.buffer_capacity)
                    .with_partitions(self.partitions),
            );
        }
        if let Some(deadline) = self.deadline {
            config = config.with_deadline(deadline);
        }
        config
    }
}

impl From<&RunArgs> for Settings {
    fn from(args: &RunArgs) -> Self {
        Self {
            concurrency: args.concurrency,
            bucket_capacity: args.bucket_capacity,
            refill_tokens: args.refill_tokens,
            refill_interval: Duration::from_millis(args.refill_interval_ms),
            max_retries: args.max_retries,
            base_delay: Duration::from_millis(args.base_delay_ms),
            max_delay: Duration::from_millis(args.max_delay_ms),
            jitter: !args.no_jitter,
            in_flight_ceiling: args.in_flight_ceiling,
            ordered: args.ordered,
            batch_size: args.batch_size,
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            buffer_capacity: args.buffer_capacity,
            partitions: args.partitions,
            deadline: args.deadline_secs.map(Duration::from_secs),
        }
    }
}

impl From<&CheckArgs> for Settings {
    fn from(args: &CheckArgs) -> Self {
        let batch = BatchConfig::default();
        Self {
            concurrency: args.concurrency,
            bucket_capacity: args.bucket_capacity,
            refill_tokens: args.refill_tokens,
            refill_interval: Duration::from_millis(args.refill_interval_ms),
            max_retries: args.max_retries,
            base_delay: Duration::from_millis(args.base_delay_ms),
            max_delay: Duration::from_millis(args.max_delay_ms),
            jitter: true,
            in_flight_ceiling: args.in_flight_ceiling,
            ordered: false,
            batch_size: args.batch_size,
            poll_interval: batch.poll_interval,
            buffer_capacity: args.buffer_capacity,
            partitions: args.partitions,
            deadline: None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Logs go to stderr so stdout carries only the summary
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Check(args) => check(args).await,
    }
}

/// Validates that a URL string starts with http://
fn validate_http_url(url: &str, description: &str) -> Result<()> {
    if url.starts_with("http://") {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Invalid {}: '{}' must start with http://",
            description,
            url
        ))
    }
}

fn build_transport(args: &RunArgs) -> Result<Arc<dyn Transport>> {
    if args.simulate && args.endpoint.is_some() {
        anyhow::bail!("--simulate and --endpoint are mutually exclusive");
    }
    // Flag wins over the environment
    let endpoint = args
        .endpoint
        .clone()
        .or_else(|| std::env::var(ENDPOINT_ENV).ok());

    match (args.simulate, endpoint) {
        (true, _) => {
            let profile = SimulationProfile {
                throttle_pct: args.throttle_pct,
                transient_pct: args.transient_pct,
                fatal_pct: args.fatal_pct,
                latency: Duration::from_millis(args.latency_ms),
                seed: args.seed,
            };
            tracing::info!(
                "Using simulated endpoint: {}% throttled, {}% transient, {}% fatal, {}ms latency",
                profile.throttle_pct,
                profile.transient_pct,
                profile.fatal_pct,
                args.latency_ms
            );
            Ok(Arc::new(SimulatedTransport::new(profile)?))
        }
        (false, Some(endpoint)) => {
            validate_http_url(&endpoint, "endpoint")?;
            tracing::info!("Delivering to {}", endpoint);
            let transport = HttpTransport::new(&endpoint)?
                .with_timeout(Duration::from_millis(args.request_timeout_ms));
            Ok(Arc::new(transport))
        }
        (false, None) => Err(anyhow::anyhow!(
            "No endpoint given: use --endpoint, {} or --simulate",
            ENDPOINT_ENV
        )),
    }
}

fn synthetic_source(count: u64) -> VecSource {
    VecSource::from_payloads(
        (0..count).map(|n| serde_json::json!({ "n": n, "synthetic": true }).to_string()),
    )
}

async fn run(args: RunArgs) -> Result<()> {
    let config = Settings::from(&args).dispatch_config();
    let transport = build_transport(&args)?;

    let cancel = CancellationToken::new();
    let mut engine = Engine::new(config, transport)?
        .with_cancellation(cancel.clone())
        .with_record_retention(args.records_out.is_some());
    if let Some(secs) = args.progress_secs {
        engine = engine.with_progress_interval(Duration::from_secs(secs.max(1)));
    }

    // Ctrl-C aborts the run; records in flight end as cancelled
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let summary = match (&args.input, args.synthetic) {
        (Some(_), Some(_)) => {
            ctrl_c.abort();
            anyhow::bail!("--input and --synthetic are mutually exclusive");
        }
        (Some(path), None) => {
            tracing::info!("Reading records from {}", path.display());
            let source = JsonLinesSource::open(path).await?;
            engine.run(source).await
        }
        (None, Some(count)) => {
            tracing::info!("Generating {} synthetic records", count);
            engine.run(synthetic_source(count)).await
        }
        (None, None) => {
            ctrl_c.abort();
            anyhow::bail!("No input given: use --input or --synthetic");
        }
    };
    ctrl_c.abort();

    report(summary, args.records_out.as_deref(), args.fail_on_error).await
}

async fn report(
    mut summary: OutcomeSummary,
    records_out: Option<&std::path::Path>,
    fail_on_error: bool,
) -> Result<()> {
    if let Some(path) = records_out {
        let mut lines = String::new();
        for record in std::mem::take(&mut summary.records) {
            lines.push_str(&serde_json::to_string(&record)?);
            lines.push('\n');
        }
        tokio::fs::write(path, lines).await?;
        tracing::info!("Wrote per-record outcomes to {}", path.display());
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Some(error) = &summary.source_error {
        anyhow::bail!("Source failed after {} records: {}", summary.total, error);
    }
    if fail_on_error && summary.failed > 0 {
        anyhow::bail!("{} of {} records failed", summary.failed, summary.total);
    }
    Ok(())
}

async fn check(args: CheckArgs) -> Result<()> {
    let config = Settings::from(&args).dispatch_config();
    config.validate()?;
    tracing::info!(
        "Configuration valid: concurrency cap {}, {:.2} tokens/s, in-flight ceiling {}",
        config.admission.concurrency_cap,
        config.admission.refill_per_second(),
        config.in_flight_ceiling
    );

    let mut scan = serde_json::json!({ "config": "valid" });
    if let Some(path) = &args.input {
        let mut source = JsonLinesSource::open(path).await?;
        let (mut records, mut malformed) = (0u64, 0u64);

        while let Some(item) = source.next().await {
            match item {
                Ok(_) => records += 1,
                Err(SourceError::Malformed {
                    sequence, reason, ..
                }) => {
                    malformed += 1;
                    tracing::warn!("Line for record {} is malformed: {}", sequence, reason);
                }
                Err(SourceError::Io(e)) => {
                    anyhow::bail!("Failed reading {}: {}", path.display(), e);
                }
            }
        }

        scan["records"] = records.into();
        scan["malformed"] = malformed.into();
    }

    println!("{}", serde_json::to_string_pretty(&scan)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Cli {
        Cli::from_args(&["fanout"], args).unwrap()
    }

    #[test]
    fn test_cli_parse_run_defaults() {
        let cli = parse(&["run", "--synthetic", "100", "--simulate"]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.synthetic, Some(100));
                assert!(args.simulate);
                assert!(args.input.is_none());

                let config = Settings::from(&args).dispatch_config();
                assert_eq!(config.admission.concurrency_cap, 10);
                assert_eq!(config.admission.bucket_capacity, 100);
                assert_eq!(config.retry.max_retries, 3);
                assert!(config.retry.jitter);
                assert_eq!(config.in_flight_ceiling, 40);
                assert!(config.batching().is_none());
                assert!(config.validate().is_ok());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_parse_run_admission_flags() {
        let cli = parse(&[
            "run",
            "--input", "records.jsonl",
            "--endpoint", "http://127.0.0.1:9000/ingest",
            "-c", "50",
            "--bucket-capacity", "1000",
            "--refill-tokens", "500",
            "--refill-interval-ms", "60000",
            "--max-retries", "5",
            "--no-jitter",
            "--deadline-secs", "600",
        ]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.input, Some(PathBuf::from("records.jsonl")));
                assert_eq!(args.endpoint.as_deref(), Some("http://127.0.0.1:9000/ingest"));

                let config = Settings::from(&args).dispatch_config();
                assert_eq!(config.admission.concurrency_cap, 50);
                assert_eq!(config.admission.refill_tokens, 500);
                assert_eq!(config.admission.refill_interval, Duration::from_secs(60));
                assert_eq!(config.retry.max_retries, 5);
                assert!(!config.retry.jitter);
                assert_eq!(config.deadline, Some(Duration::from_secs(600)));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_ordered_implies_batching() {
        let cli = parse(&["run", "--synthetic", "5", "--simulate", "--ordered"]);
        match cli.command {
            Commands::Run(args) => {
                let config = Settings::from(&args).dispatch_config();
                assert!(config.ordering_required);
                let batch = config.batching().unwrap();
                assert_eq!(batch.batch_size, 10);
                assert_eq!(batch.buffer_capacity, 100);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_batch_flags() {
        let cli = parse(&[
            "run",
            "--synthetic", "5",
            "--simulate",
            "--batch-size", "25",
            "--poll-interval-ms", "50",
            "--buffer-capacity", "200",
            "--partitions", "4",
        ]);
        match cli.command {
            Commands::Run(args) => {
                let batch = Settings::from(&args).dispatch_config().batching().unwrap();
                assert_eq!(batch.batch_size, 25);
                assert_eq!(batch.poll_interval, Duration::from_millis(50));
                assert_eq!(batch.buffer_capacity, 200);
                assert_eq!(batch.partitions, 4);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_parse_check() {
        let cli = parse(&["check", "--input", "in.jsonl", "--refill-tokens", "0"]);
        match cli.command {
            Commands::Check(args) => {
                assert_eq!(args.input, Some(PathBuf::from("in.jsonl")));
                let config = Settings::from(&args).dispatch_config();
                assert!(config.validate().unwrap_err().is_configuration());
            }
            _ => panic!("Expected Check command"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_subcommand() {
        assert!(Cli::from_args(&["fanout"], &["serve"]).is_err());
    }

    #[test]
    fn test_validate_http_url() {
        assert!(validate_http_url("http://127.0.0.1:9000", "endpoint").is_ok());
        assert!(validate_http_url("127.0.0.1:9000", "endpoint").is_err());
    }

    #[test]
    fn test_simulate_and_endpoint_conflict() {
        let cli = parse(&[
            "run",
            "--synthetic", "1",
            "--simulate",
            "--endpoint", "http://127.0.0.1:9000",
        ]);
        match cli.command {
            Commands::Run(args) => assert!(build_transport(&args).is_err()),
            _ => panic!("Expected Run command"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_run_writes_records_out() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("outcomes.jsonl");

        let cli = parse(&[
            "run",
            "--synthetic", "20",
            "--simulate",
            "--throttle-pct", "0",
            "--transient-pct", "0",
            "--fatal-pct", "0",
            "--latency-ms", "5",
            "--records-out", out.to_str().unwrap(),
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("Expected Run command");
        };
        run(args).await.unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<serde_json::Value> = written
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 20);
        assert_eq!(lines[0]["id"], "record-0");
        assert_eq!(lines[19]["status"], "succeeded");
    }

    #[tokio::test]
    async fn test_check_scans_input() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"id": "a", "payload": {{"x": 1}}}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file, r#"{{"payload": 2}}"#).unwrap();

        let cli = parse(&["check", "--input", file.path().to_str().unwrap()]);
        let Commands::Check(args) = cli.command else {
            panic!("Expected Check command");
        };
        check(args).await.unwrap();
    }
}
