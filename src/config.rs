use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::models::source::FeedSource;
use crate::pipeline::PipelineConfig;
use crate::queue::{RetryPolicy, WorkerConfig};
use crate::scheduler::targets::{self, ImportTarget};

#[derive(Parser, Debug, Clone)]
#[command(name = "jobimporter", about = "Scheduled job-feed importer")]
pub struct Config {
    /// Database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Run database migrations on startup
    #[arg(long, env = "RUN_MIGRATIONS", default_value = "true")]
    pub run_migrations: bool,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    #[command(flatten)]
    pub pipeline: PipelineArgs,

    #[command(flatten)]
    pub schedule: ScheduleArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(clap::Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Record tasks processed at once
    #[arg(long, env = "MAX_CONCURRENCY", default_value = "5")]
    pub max_concurrency: usize,

    /// Feeds fetched at once. Each fetch task makes one request; across
    /// targets the real throttle is INTER_TARGET_DELAY_SECS, so this only
    /// caps bursts from manual or overlapping runs.
    #[arg(long, env = "FETCH_CONCURRENCY", default_value = "4")]
    pub fetch_concurrency: usize,

    /// Records per fan-out batch
    #[arg(long, env = "BATCH_SIZE", default_value = "100")]
    pub batch_size: usize,

    /// Delay added per fan-out batch, in milliseconds
    #[arg(long, env = "BATCH_STAGGER_MS", default_value = "10000")]
    pub batch_stagger_ms: u64,

    /// Delay before a new run's fetch becomes due, in milliseconds
    #[arg(long, env = "FETCH_DELAY_MS", default_value = "1000")]
    pub fetch_delay_ms: u64,

    /// HTTP timeout for feed requests, in seconds
    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value = "30")]
    pub fetch_timeout_secs: u64,

    #[arg(long, env = "FETCH_ATTEMPTS", default_value = "3")]
    pub fetch_attempts: i32,

    #[arg(long, env = "RECORD_ATTEMPTS", default_value = "3")]
    pub record_attempts: i32,

    /// Base retry backoff for fetch tasks, in milliseconds
    #[arg(long, env = "FETCH_BACKOFF_MS", default_value = "2000")]
    pub fetch_backoff_ms: u64,

    /// Base retry backoff for record tasks, in milliseconds
    #[arg(long, env = "RECORD_BACKOFF_MS", default_value = "1000")]
    pub record_backoff_ms: u64,

    /// Queue poll interval when idle, in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "1000")]
    pub poll_interval_ms: u64,
}

impl PipelineArgs {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            batch_size: self.batch_size.max(1),
            batch_stagger: Duration::from_millis(self.batch_stagger_ms),
            fetch_delay: Duration::from_millis(self.fetch_delay_ms),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn fetch_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.fetch_attempts,
            Duration::from_millis(self.fetch_backoff_ms),
        )
    }

    pub fn record_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.record_attempts,
            Duration::from_millis(self.record_backoff_ms),
        )
    }

    pub fn fetch_worker(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.fetch_concurrency.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..WorkerConfig::default()
        }
    }

    pub fn record_worker(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.max_concurrency.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..WorkerConfig::default()
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct ScheduleArgs {
    /// Cron expression for importing every target
    #[arg(long, env = "IMPORT_CRON", default_value = "0 * * * *")]
    pub import_cron: String,

    /// Cron expression for the retention sweep
    #[arg(long, env = "CLEANUP_CRON", default_value = "0 2 * * *")]
    pub cleanup_cron: String,

    /// Runs older than this many days are deleted
    #[arg(long, env = "RETENTION_DAYS", default_value = "30")]
    pub retention_days: u32,

    /// Pause between targets during a full import, in seconds
    #[arg(long, env = "INTER_TARGET_DELAY_SECS", default_value = "5")]
    pub inter_target_delay_secs: u64,

    /// JSON file listing import targets; the built-in list is used when unset
    #[arg(long, env = "TARGETS_FILE")]
    pub targets_file: Option<PathBuf>,
}

impl ScheduleArgs {
    pub fn inter_target_delay(&self) -> Duration {
        Duration::from_secs(self.inter_target_delay_secs)
    }

    pub fn targets(&self) -> anyhow::Result<Vec<ImportTarget>> {
        match &self.targets_file {
            Some(path) => targets::load_targets(path),
            None => Ok(targets::default_targets()),
        }
    }
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP API, queue workers and scheduler (default when no subcommand given)
    Serve {
        /// Listen address
        #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
        listen_addr: String,
    },
    /// Run the fetch and record queue workers only
    Worker,
    /// Start runs for one feed, or for every configured target, and exit
    Import {
        /// Feed source (jobicy or higheredjobs)
        #[arg(long, requires = "feed_url")]
        source: Option<FeedSource>,

        /// Feed URL to import
        #[arg(long, requires = "source")]
        feed_url: Option<String>,
    },
}

impl Config {
    /// Resolve the command, defaulting to Serve if none specified.
    pub fn resolved_command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve {
            listen_addr: std::env::var("LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["jobimporter", "--database-url", "postgres://localhost/test"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = parse(&[]);
        let pipeline = config.pipeline.pipeline_config();
        assert_eq!(pipeline.batch_size, 100);
        assert_eq!(pipeline.batch_stagger, Duration::from_secs(10));
        assert_eq!(pipeline.fetch_delay, Duration::from_secs(1));
        assert_eq!(config.pipeline.record_worker().concurrency, 5);
        assert_eq!(config.pipeline.fetch_policy().max_attempts, 3);
        assert_eq!(
            config.pipeline.fetch_policy().base_delay,
            Duration::from_secs(2)
        );
        assert_eq!(config.schedule.import_cron, "0 * * * *");
        assert_eq!(config.schedule.retention_days, 30);
        assert_eq!(config.schedule.targets().unwrap().len(), 9);
        assert!(matches!(config.resolved_command(), Command::Serve { .. }));
    }

    #[test]
    fn import_subcommand_takes_source_and_url_together() {
        let config = parse(&[
            "import",
            "--source",
            "higheredjobs",
            "--feed-url",
            "https://www.higheredjobs.com/rss/articleFeed.cfm",
        ]);
        match config.resolved_command() {
            Command::Import { source, feed_url } => {
                assert_eq!(source, Some(FeedSource::HigherEdJobs));
                assert!(feed_url.is_some());
            }
            other => panic!("unexpected command {other:?}"),
        }

        let argv = [
            "jobimporter",
            "--database-url",
            "postgres://localhost/test",
            "import",
            "--source",
            "jobicy",
        ];
        assert!(Config::try_parse_from(argv).is_err());
    }

    #[test]
    fn json_log_format() {
        let config = parse(&["--log-format", "json", "worker"]);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(matches!(config.resolved_command(), Command::Worker));
    }
}
