use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use jobmill_core::clock::parse_timezone;
use jobmill_engine::{BuiltinRegistry, EngineConfig, LaneSpec, RetryPolicy};

fn parse_secs(input: &str) -> Result<Duration, String> {
    let secs: f64 = input
        .trim()
        .parse()
        .map_err(|_| format!("invalid seconds value: {input:?}"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("seconds must be non-negative: {input:?}"));
    }
    Ok(Duration::from_secs_f64(secs))
}

#[derive(Debug, Clone, Parser)]
#[command(name = "jobmill", version, about = "jobmill background job engine")]
pub struct Cli {
    /// Directory holding per-job journals, shelves, and locks.
    #[arg(long, env = "JOBMILL_STORE_DIR", default_value = "jobmill-store")]
    pub store_dir: PathBuf,

    /// Workers per lane, unless overridden per lane below.
    #[arg(
        long,
        env = "JOBMILL_LANE_WORKERS",
        default_value_t = EngineConfig::DEFAULT_LANE_WORKERS
    )]
    pub lane_workers: usize,

    /// Workers for the slow lane.
    #[arg(long, env = "JOBMILL_SLOW_WORKERS")]
    pub slow_workers: Option<usize>,

    /// Workers for the fast lane.
    #[arg(long, env = "JOBMILL_FAST_WORKERS")]
    pub fast_workers: Option<usize>,

    /// Days after completion before a job is archived at startup.
    #[arg(
        long,
        env = "JOBMILL_ARCHIVE_DAYS",
        default_value_t = EngineConfig::DEFAULT_ARCHIVE_DAYS
    )]
    pub archive_days: u32,

    /// Replays of an interrupted job before it is suppressed.
    #[arg(
        long,
        env = "JOBMILL_MAX_ATTEMPTS",
        default_value_t = EngineConfig::DEFAULT_MAX_ATTEMPTS
    )]
    pub max_attempts: u32,

    /// Action invocations per job before it ends in exception.
    #[arg(long, env = "JOBMILL_RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,

    /// Minimum backoff between action retries, in seconds.
    #[arg(long, env = "JOBMILL_RETRY_DELAY_MIN", default_value = "1", value_parser = parse_secs)]
    pub retry_delay_min: Duration,

    /// Maximum backoff between action retries, in seconds.
    #[arg(long, env = "JOBMILL_RETRY_DELAY_MAX", default_value = "60", value_parser = parse_secs)]
    pub retry_delay_max: Duration,

    /// How long store operations wait on a held lock, in seconds.
    #[arg(long, env = "JOBMILL_LOCK_DEADLINE", default_value = "600", value_parser = parse_secs)]
    pub lock_deadline: Duration,

    /// Zone timestamps are rendered in (tz database name).
    #[arg(long, env = "JOBMILL_TIMEZONE", default_value = "US/Pacific")]
    pub timezone: String,

    /// Submit a helloworld smoke job and wait for its result after startup.
    #[arg(long)]
    pub smoke: bool,
}

impl Cli {
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let timezone = parse_timezone(&self.timezone)?;
        let mut config = EngineConfig::new(&self.store_dir, Arc::new(BuiltinRegistry));
        config.lanes = vec![
            LaneSpec::new(
                EngineConfig::FALLBACK_LANE,
                self.slow_workers.unwrap_or(self.lane_workers),
            ),
            LaneSpec::new("fast", self.fast_workers.unwrap_or(self.lane_workers)),
        ];
        config.archive_days = self.archive_days;
        config.max_attempts = self.max_attempts;
        config.retry = RetryPolicy {
            attempts: self.retry_attempts,
            delay_min: self.retry_delay_min,
            delay_max: self.retry_delay_max,
        };
        config.lock_deadline = self.lock_deadline;
        config.timezone = timezone;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_engine() {
        let cli = Cli::parse_from(["jobmill"]);
        assert_eq!(cli.lane_workers, EngineConfig::DEFAULT_LANE_WORKERS);
        assert_eq!(cli.archive_days, EngineConfig::DEFAULT_ARCHIVE_DAYS);
        assert_eq!(cli.max_attempts, EngineConfig::DEFAULT_MAX_ATTEMPTS);
        let config = cli.engine_config().unwrap();
        assert_eq!(config.lanes.len(), 2);
    }

    #[test]
    fn seconds_parse_fractional() {
        assert_eq!(parse_secs("0.5").unwrap(), Duration::from_millis(500));
        assert!(parse_secs("-1").is_err());
        assert!(parse_secs("lots").is_err());
    }

    #[test]
    fn bad_timezone_is_rejected() {
        let cli = Cli::parse_from(["jobmill", "--timezone", "Nowhere/Null"]);
        assert!(cli.engine_config().is_err());
    }
}
