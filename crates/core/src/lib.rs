pub mod desk;
pub mod domain;
pub mod metrics;
pub mod optimize;
pub mod solver;
pub mod store;

pub mod config {
    use anyhow::Context;
    use std::path::PathBuf;
    use std::time::Duration;

    const DEFAULT_READ_RETRIES: u32 = 2;
    const DEFAULT_CACHE_TTL_SECS: u64 = 300;
    const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
    const DEFAULT_MAX_POLL_FAILURES: u32 = 5;

    #[derive(Debug, Clone, Default)]
    pub struct Settings {
        pub solver_base_url: Option<String>,
        pub solver_api_key: Option<String>,
        pub solver_timeout_secs: Option<u64>,
        pub solver_read_retries: Option<u32>,
        pub scenario_cache_ttl_secs: Option<u64>,
        pub poll_interval_ms: Option<u64>,
        pub max_poll_failures: Option<u32>,
        pub selection_state_path: Option<PathBuf>,
        pub sentry_dsn: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                solver_base_url: std::env::var("SOLVER_BASE_URL").ok(),
                solver_api_key: std::env::var("SOLVER_API_KEY")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
                solver_timeout_secs: parse_env("SOLVER_TIMEOUT_SECS")?,
                solver_read_retries: parse_env("SOLVER_READ_RETRIES")?,
                scenario_cache_ttl_secs: parse_env("SCENARIO_CACHE_TTL_SECS")?,
                poll_interval_ms: parse_env("OPTIMIZER_POLL_INTERVAL_MS")?,
                max_poll_failures: parse_env("OPTIMIZER_MAX_POLL_FAILURES")?,
                selection_state_path: std::env::var("SELECTION_STATE_PATH")
                    .ok()
                    .filter(|s| !s.trim().is_empty())
                    .map(PathBuf::from),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
            })
        }

        pub fn require_solver_base_url(&self) -> anyhow::Result<&str> {
            self.solver_base_url
                .as_deref()
                .context("SOLVER_BASE_URL is required")
        }

        /// Extra attempts for scenario reads after a network failure.
        pub fn read_retries(&self) -> u32 {
            self.solver_read_retries.unwrap_or(DEFAULT_READ_RETRIES)
        }

        pub fn scenario_cache_ttl(&self) -> Duration {
            Duration::from_secs(self.scenario_cache_ttl_secs.unwrap_or(DEFAULT_CACHE_TTL_SECS))
        }

        pub fn poll_interval(&self) -> Duration {
            Duration::from_millis(self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS).max(1))
        }

        pub fn max_poll_failures(&self) -> u32 {
            self.max_poll_failures.unwrap_or(DEFAULT_MAX_POLL_FAILURES).max(1)
        }
    }

    fn parse_env<T>(key: &str) -> anyhow::Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match std::env::var(key) {
            Ok(s) if s.trim().is_empty() => Ok(None),
            Ok(s) => s
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("{key} is invalid ({e}): {s}")),
            Err(_) => Ok(None),
        }
    }

}
