use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::PipelineError;
use crate::publisher::{DEFAULT_HIGH_WATER_MARK, PublisherConfig};
use crate::queue::DEFAULT_CAPACITY;
use crate::sink::{DEFAULT_BASE_URL, SinkConfig};
use crate::tail::{CommandTail, DEFAULT_COMMAND, FileTail, Source};

/// Immutable configuration used by the application runtime
#[derive(Debug, Clone)]
pub struct Config {
    pub source: Source,
    pub sink: SinkConfig,
    pub publisher: PublisherConfig,
    pub queue_capacity: usize,
    pub origin: String,
    pub unit: String,
    pub log_level: String,
}

/// User-facing CLI arguments (kept private to the CLI layer)
#[derive(Parser, Debug)]
#[command(
    name = "ltpub",
    version,
    about = "Tail a live line stream and publish it in batches to a remote log"
)]
struct Args {
    /// Bearer token for the log service
    #[arg(long, env = "KLEV_TOKEN", hide_env_values = true)]
    token: String,

    /// Base URL of the log service
    #[arg(long, env = "KLEV_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Slots in the queue between the tailer and the publisher
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    queue_capacity: usize,

    /// Pending records above which a full batch is published immediately
    #[arg(long, default_value_t = DEFAULT_HIGH_WATER_MARK)]
    high_water_mark: usize,

    /// Origin tag written into the log metadata
    #[arg(long, default_value = "journal")]
    origin: String,

    /// Unit name written into the log metadata
    #[arg(long, default_value = "system")]
    unit: String,

    /// Attribution key stamped on every record
    #[arg(long)]
    key: Option<String>,

    /// Follow this file (like tail -f) instead of running a command
    #[arg(long, value_name = "PATH", conflicts_with = "command")]
    file: Option<PathBuf>,

    /// With --file, publish the existing content before following
    #[arg(long, requires = "file")]
    from_start: bool,

    /// Retries for a failed publish before giving up (0 = fail immediately)
    #[arg(long, default_value_t = 0)]
    max_retries: u32,

    /// Backoff before the first retry, doubled on each further retry
    #[arg(long, default_value_t = 200)]
    retry_backoff_ms: u64,

    /// Time allowed for in-flight and final publishes after shutdown starts
    #[arg(long, default_value_t = 5000)]
    shutdown_grace_ms: u64,

    /// HTTP request timeout for the log service
    #[arg(long, default_value_t = 10_000)]
    request_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Command whose standard output is tailed
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// Parse CLI options into an application Config
pub fn parse() -> Result<Config, PipelineError> {
    from_args(Args::parse())
}

fn from_args(args: Args) -> Result<Config, PipelineError> {
    if args.queue_capacity == 0 {
        return Err(PipelineError::Config(
            "--queue-capacity must be at least 1".into(),
        ));
    }
    if args.high_water_mark == 0 {
        return Err(PipelineError::Config(
            "--high-water-mark must be at least 1".into(),
        ));
    }

    let key = args.key.map(String::into_bytes);
    let source = match args.file {
        Some(path) => Source::File(FileTail {
            path,
            from_start: args.from_start,
            key,
        }),
        None if args.command.is_empty() => {
            let command: Vec<String> = DEFAULT_COMMAND.iter().map(|s| s.to_string()).collect();
            Source::Command(CommandTail::new(&command, key)?)
        }
        None => Source::Command(CommandTail::new(&args.command, key)?),
    };

    Ok(Config {
        source,
        sink: SinkConfig {
            base_url: args.base_url,
            token: args.token,
            request_timeout: Duration::from_millis(args.request_timeout_ms),
        },
        publisher: PublisherConfig {
            high_water_mark: args.high_water_mark,
            max_retries: args.max_retries,
            retry_backoff: Duration::from_millis(args.retry_backoff_ms),
            shutdown_grace: Duration::from_millis(args.shutdown_grace_ms),
        },
        queue_capacity: args.queue_capacity,
        origin: args.origin,
        unit: args.unit,
        log_level: args.log_level,
    })
}
