//! Rebuild configuration

use crate::error::{RebuildError, Result};
use crate::governor::ThreadBudget;
use std::time::Duration;
use tern_db_binary_index::DEFAULT_BLOCK_ROWS;

/// Environment variable for [`RebuildConfig::concurrency_ceiling`].
pub const ENV_CONCURRENCY: &str = "TERN_REBUILD_CONCURRENCY";
/// Environment variable for [`RebuildConfig::watchdog`], in seconds.
pub const ENV_WATCHDOG_SECS: &str = "TERN_REBUILD_WATCHDOG_SECS";
/// Environment variable for [`RebuildConfig::stall_timeout`], in seconds.
pub const ENV_STALL_SECS: &str = "TERN_REBUILD_STALL_SECS";
/// Environment variable for [`RebuildConfig::zstd_level`].
pub const ENV_ZSTD_LEVEL: &str = "TERN_REBUILD_ZSTD_LEVEL";

/// Default watchdog interval: 10 minutes.
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(600);
/// Default bound on any single blocking wait inside the pipeline: 2 minutes.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration for a rebuild
#[derive(Debug, Clone)]
pub struct RebuildConfig {
    /// Upper bound on the product of all nested pool sizes.
    ///
    /// This is the single operator-facing concurrency knob. Every pool size
    /// is derived from it by [`compute_budget`](crate::compute_budget).
    /// Default: available parallelism.
    pub concurrency_ceiling: usize,

    /// Fail the rebuild if no task reports progress or completion for this long.
    ///
    /// Default: 10 minutes
    pub watchdog: Duration,

    /// Bound on every blocking wait: queue push, queue drain, scanner reorder wait.
    ///
    /// Default: 2 minutes
    pub stall_timeout: Duration,

    /// Rows per output block when the source block table records no target size.
    pub fallback_block_rows: usize,

    /// zstd level for re-encoded blocks. Default: 1
    pub zstd_level: i32,

    /// Maximum number of pipeline threads allowed to run at once.
    ///
    /// Threads beyond the limit park until a slot frees up, in spawn order.
    /// Models an OS that can only schedule so many threads; `None` in production.
    pub thread_slot_limit: Option<usize>,

    /// Use this budget instead of asking the governor.
    ///
    /// Only for stress harnesses that need to reproduce unbudgeted pool sizing.
    pub budget_override: Option<ThreadBudget>,

    /// Silence diagnostics emitted while statistics are collected.
    pub quiet_statistics: bool,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            concurrency_ceiling: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            watchdog: DEFAULT_WATCHDOG,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            fallback_block_rows: DEFAULT_BLOCK_ROWS,
            zstd_level: 1,
            thread_slot_limit: None,
            budget_override: None,
            quiet_statistics: false,
        }
    }
}

impl RebuildConfig {
    /// Defaults overridden by any `TERN_REBUILD_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| RebuildError::InvalidConfig(format!("{}={:?} is not valid", key, raw)))
        }

        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_CONCURRENCY) {
            config.concurrency_ceiling = parse(ENV_CONCURRENCY, &raw)?;
        }
        if let Some(raw) = lookup(ENV_WATCHDOG_SECS) {
            config.watchdog = Duration::from_secs(parse(ENV_WATCHDOG_SECS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_STALL_SECS) {
            config.stall_timeout = Duration::from_secs(parse(ENV_STALL_SECS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_ZSTD_LEVEL) {
            config.zstd_level = parse(ENV_ZSTD_LEVEL, &raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.watchdog.is_zero() {
            return Err(RebuildError::InvalidConfig("watchdog must be > 0".into()));
        }
        if self.stall_timeout.is_zero() {
            return Err(RebuildError::InvalidConfig("stall_timeout must be > 0".into()));
        }
        if self.fallback_block_rows == 0 {
            return Err(RebuildError::InvalidConfig(
                "fallback_block_rows must be > 0".into(),
            ));
        }
        if !(1..=22).contains(&self.zstd_level) {
            return Err(RebuildError::InvalidConfig(format!(
                "zstd_level {} outside 1..=22",
                self.zstd_level
            )));
        }
        if self.thread_slot_limit == Some(0) {
            return Err(RebuildError::InvalidConfig(
                "thread_slot_limit must be > 0".into(),
            ));
        }
        if let Some(budget) = &self.budget_override {
            budget.validate()?;
        }
        Ok(())
    }

    /// Builder method to set the concurrency ceiling
    pub fn with_concurrency_ceiling(mut self, ceiling: usize) -> Self {
        self.concurrency_ceiling = ceiling;
        self
    }

    /// Builder method to set the watchdog interval
    pub fn with_watchdog(mut self, watchdog: Duration) -> Self {
        self.watchdog = watchdog;
        self
    }

    /// Builder method to set the bounded-wait timeout
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_fallback_block_rows(mut self, rows: usize) -> Self {
        self.fallback_block_rows = rows;
        self
    }

    pub fn with_zstd_level(mut self, level: i32) -> Self {
        self.zstd_level = level;
        self
    }

    pub fn with_thread_slot_limit(mut self, limit: usize) -> Self {
        self.thread_slot_limit = Some(limit);
        self
    }

    pub fn with_budget_override(mut self, budget: ThreadBudget) -> Self {
        self.budget_override = Some(budget);
        self
    }

    pub fn with_quiet_statistics(mut self, quiet: bool) -> Self {
        self.quiet_statistics = quiet;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = RebuildConfig::default();
        config.validate().unwrap();
        assert!(config.concurrency_ceiling >= 1);
        assert_eq!(config.thread_slot_limit, None);
    }

    #[test]
    fn test_env_overrides() {
        let config = RebuildConfig::from_lookup(lookup(&[
            (ENV_CONCURRENCY, "6"),
            (ENV_WATCHDOG_SECS, "30"),
            (ENV_STALL_SECS, " 5 "),
            (ENV_ZSTD_LEVEL, "3"),
        ]))
        .unwrap();
        assert_eq!(config.concurrency_ceiling, 6);
        assert_eq!(config.watchdog, Duration::from_secs(30));
        assert_eq!(config.stall_timeout, Duration::from_secs(5));
        assert_eq!(config.zstd_level, 3);
    }

    #[test]
    fn test_env_invalid_values() {
        let err = RebuildConfig::from_lookup(lookup(&[(ENV_CONCURRENCY, "many")])).unwrap_err();
        assert!(matches!(err, RebuildError::InvalidConfig(_)));
        let err = RebuildConfig::from_lookup(lookup(&[(ENV_STALL_SECS, "0")])).unwrap_err();
        assert!(matches!(err, RebuildError::InvalidConfig(_)));
    }

    #[test]
    fn test_builders() {
        let config = RebuildConfig::default()
            .with_concurrency_ceiling(2)
            .with_thread_slot_limit(12)
            .with_quiet_statistics(true);
        assert_eq!(config.concurrency_ceiling, 2);
        assert_eq!(config.thread_slot_limit, Some(12));
        assert!(config.quiet_statistics);
    }
}
