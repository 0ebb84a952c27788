//! Quill Job Simulator
//!
//! Drive one AI job through the registry against a scripted generator that
//! fails a configurable number of times, printing every status update.
//!
//! Usage:
//!   cargo run --bin quill-jobsim -- --failures 2 --error network --fast
//!   cargo run --bin quill-jobsim -- --kind tags --error validation
//!   LOG_FORMAT=json cargo run --bin quill-jobsim -- --failures 1 --error quota

use std::env;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quill_jobs::{
    Failure, Generator, JobId, JobKind, JobRegistry, JobSpec, RegistryConfig, RetryOutcome,
    ScriptedGenerator,
};

const SAMPLE_NOTE: &str = "Ownership in Rust ties every value to a single owner. \
Borrowing lets code read or mutate a value without taking ownership, and the \
borrow checker enforces that references never outlive their data.";

#[derive(Parser)]
#[command(name = "quill-jobsim")]
#[command(author, version, about = "Drive one AI job through the Quill job registry")]
#[command(after_help = "Environment:
  QUILL_MAX_CONCURRENT_JOBS, QUILL_JOB_TIMEOUT_MS, QUILL_MAX_RETRIES,
  QUILL_RETRY_BASE_DELAY_MS, QUILL_RETRY_MAX_DELAY_MS, QUILL_RETRY_JITTER
  LOG_FORMAT (json|text), RUST_LOG")]
struct Cli {
    /// Job kind
    #[arg(short, long, value_enum, default_value_t = KindArg::Summary)]
    kind: KindArg,

    /// Scripted failures before success
    #[arg(short = 'n', long, default_value_t = 1)]
    failures: usize,

    /// Failure to inject
    #[arg(short, long, value_enum, default_value_t = ErrorArg::Network)]
    error: ErrorArg,

    /// Shrink backoff delays for a quick demo
    #[arg(short, long)]
    fast: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Summary,
    Tags,
}

impl From<KindArg> for JobKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Summary => JobKind::Summary,
            KindArg::Tags => JobKind::Tags,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ErrorArg {
    Network,
    Timeout,
    Quota,
    Validation,
    Upstream,
}

fn prompt_for(kind: JobKind, content: &str) -> String {
    match kind {
        JobKind::Summary => format!(
            "Summarize the following note in two or three sentences.\n\n{content}"
        ),
        JobKind::Tags => format!(
            "Suggest up to five short topic tags for the following note, comma separated.\n\n{content}"
        ),
    }
}

fn injected_failure(error: ErrorArg) -> Failure {
    match error {
        ErrorArg::Timeout => Failure::http(504, "Gateway Timeout"),
        ErrorArg::Quota => Failure::http(429, "Rate limit exceeded for api_key=sk-demo-0000000000"),
        ErrorArg::Validation => Failure::validation("prompt must not be empty"),
        ErrorArg::Upstream => Failure::http(500, "Internal Server Error"),
        ErrorArg::Network => Failure::opaque("ECONNRESET: connection reset by peer"),
    }
}

fn init_tracing() {
    let log_format = env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "quill_jobs=debug".into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let kind = JobKind::from(cli.kind);

    let mut config = RegistryConfig::from_env();
    if cli.fast {
        config.retry_policy = config
            .retry_policy
            .with_base_delay_ms(50)
            .with_max_delay_ms(400)
            .with_quota_floor_ms(200);
    }
    let registry = JobRegistry::new(config);

    let generator = ScriptedGenerator::new()
        .failing_times(cli.failures, injected_failure(cli.error))
        .with_default_response(match kind {
            JobKind::Summary => "Rust values have one owner; borrows are checked references.",
            JobKind::Tags => "rust, ownership, borrowing",
        });

    let id = JobId::generate();
    let mut updates = registry.subscribe(id.clone()).await;
    let printer = tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            match serde_json::to_string(&update) {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("Failed to encode update: {}", e),
            }
            if update.is_final() {
                break;
            }
        }
    });

    let prompt = prompt_for(kind, SAMPLE_NOTE);
    let spec = JobSpec::new(id.clone(), kind, "note-demo");
    let result = registry
        .run_tracked(spec, || {
            let generator = generator.clone();
            let prompt = prompt.clone();
            async move { generator.generate(&prompt).await }
        })
        .await
        .context("Failed to start job")?;

    let job = registry.get_job(id.as_str()).await;
    // `failed` is never a final status, so bound the wait for the printer.
    let _ = tokio::time::timeout(Duration::from_millis(200), printer).await;
    registry.shutdown().await;

    println!();
    match result.outcome {
        RetryOutcome::Succeeded(text) => println!("Result: {}", text),
        RetryOutcome::Failed(error) => println!(
            "Failed ({}, severity {:?}): {}",
            error.kind, error.severity, error.message
        ),
        RetryOutcome::Cancelled => println!("Cancelled"),
    }
    println!(
        "Attempts: {}  Backoff: {}ms  Generator calls: {}",
        result.attempts,
        result.total_delay_ms,
        generator.call_count()
    );
    if let Some(job) = job {
        println!("{}", serde_json::to_string_pretty(&job)?);
    }

    Ok(())
}
