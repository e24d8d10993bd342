//! Centralized configuration for the garbage collector and its cleaner thread.
//!
//! - GcConfig::from_env() reads P1_GC_* variables (1|true|yes|on for flags).
//! - Default gives the production defaults below.
//! - Fluent with_* setters override single fields; build() closes the chain.
//!
//! Throttling knobs:
//! - start_in_ms — no background pass earlier than this after GC start.
//! - file_min_age — a file younger than this many newest files is never cleaned,
//!   and no pass runs until at least this many files were appended since start.
//! - run_period_ms — minimal distance between two background passes.
//! - transaction_timeout_ms — time budget of one pass (checked between files).

use std::fmt;

use crate::util::{env_flag, env_string, env_u64};

#[derive(Clone, Debug)]
pub struct GcConfig {
    /// Env: P1_GC_ENABLED (default true)
    pub enabled: bool,

    /// Read-only environment: nothing is ever cleaned.
    /// Env: P1_GC_READ_ONLY (default false)
    pub read_only: bool,

    /// Target minimal utilization, percent. Files are cleaned while the log holds
    /// more than (100 - min_utilization)% free space.
    /// Env: P1_GC_MIN_UTILIZATION (default 50)
    pub min_utilization: u64,

    /// Env: P1_GC_START_IN_MS (default 10000)
    pub start_in_ms: u64,

    /// Env: P1_GC_FILE_MIN_AGE (default 2)
    pub file_min_age: u64,

    /// New files appended between two wake-ups of the cleaner.
    /// Env: P1_GC_FILES_INTERVAL (default 3)
    pub files_interval: u64,

    /// Env: P1_GC_RUN_PERIOD_MS (default 30000)
    pub run_period_ms: u64,

    /// How long a pass waits for its GC transaction.
    /// Env: P1_GC_TXN_ACQUIRE_TIMEOUT_MS (default 1000)
    pub transaction_acquire_timeout_ms: u64,

    /// Time budget of one cleaning pass.
    /// Env: P1_GC_TXN_TIMEOUT_MS (default 1000)
    pub transaction_timeout_ms: u64,

    /// Delay between a successful pass and physical deletion of its files (0 = at once).
    /// Env: P1_GC_FILES_DELETION_DELAY_MS (default 5000)
    pub files_deletion_delay_ms: u64,

    /// Rename cleaned files instead of deleting them.
    /// Env: P1_GC_RENAME_FILES (default false)
    pub rename_files: bool,

    /// Env: P1_GC_USE_EXCLUSIVE_TXN (default true)
    pub use_exclusive_transaction: bool,

    /// Ignore persisted data and rescan the whole log on load.
    /// Env: P1_GC_UTILIZATION_FROM_SCRATCH (default false)
    pub utilization_from_scratch: bool,

    /// JSON dump to seed the utilization profile from.
    /// Env: P1_GC_UTILIZATION_FROM_FILE (default None)
    pub utilization_from_file: Option<String>,

    /// Bound for the best-effort deletion pass on cleaner finish.
    /// Env: P1_GC_FINISH_TIMEOUT_MS (default 5000)
    pub finish_timeout_ms: u64,

    /// RSS limit for the OOM guard (None disables it).
    /// Env: P1_GC_SOFT_MEMORY_LIMIT (default None)
    pub soft_memory_limit_bytes: Option<u64>,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_only: false,
            min_utilization: 50,
            start_in_ms: 10_000,
            file_min_age: 2,
            files_interval: 3,
            run_period_ms: 30_000,
            transaction_acquire_timeout_ms: 1_000,
            transaction_timeout_ms: 1_000,
            files_deletion_delay_ms: 5_000,
            rename_files: false,
            use_exclusive_transaction: true,
            utilization_from_scratch: false,
            utilization_from_file: None,
            finish_timeout_ms: 5_000,
            soft_memory_limit_bytes: None,
        }
    }
}

impl GcConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(on) = env_flag("P1_GC_ENABLED") {
            cfg.enabled = on;
        }
        if let Some(on) = env_flag("P1_GC_READ_ONLY") {
            cfg.read_only = on;
        }
        if let Some(n) = env_u64("P1_GC_MIN_UTILIZATION") {
            cfg.min_utilization = n.min(100);
        }
        if let Some(n) = env_u64("P1_GC_START_IN_MS") {
            cfg.start_in_ms = n;
        }
        if let Some(n) = env_u64("P1_GC_FILE_MIN_AGE") {
            cfg.file_min_age = n;
        }
        if let Some(n) = env_u64("P1_GC_FILES_INTERVAL") {
            cfg.files_interval = n.max(1);
        }
        if let Some(n) = env_u64("P1_GC_RUN_PERIOD_MS") {
            cfg.run_period_ms = n;
        }
        if let Some(n) = env_u64("P1_GC_TXN_ACQUIRE_TIMEOUT_MS") {
            cfg.transaction_acquire_timeout_ms = n;
        }
        if let Some(n) = env_u64("P1_GC_TXN_TIMEOUT_MS") {
            cfg.transaction_timeout_ms = n;
        }
        if let Some(n) = env_u64("P1_GC_FILES_DELETION_DELAY_MS") {
            cfg.files_deletion_delay_ms = n;
        }
        if let Some(on) = env_flag("P1_GC_RENAME_FILES") {
            cfg.rename_files = on;
        }
        if let Some(on) = env_flag("P1_GC_USE_EXCLUSIVE_TXN") {
            cfg.use_exclusive_transaction = on;
        }
        if let Some(on) = env_flag("P1_GC_UTILIZATION_FROM_SCRATCH") {
            cfg.utilization_from_scratch = on;
        }
        if let Some(s) = env_string("P1_GC_UTILIZATION_FROM_FILE") {
            cfg.utilization_from_file = Some(s);
        }
        if let Some(n) = env_u64("P1_GC_FINISH_TIMEOUT_MS") {
            cfg.finish_timeout_ms = n;
        }
        if let Some(n) = env_u64("P1_GC_SOFT_MEMORY_LIMIT") {
            cfg.soft_memory_limit_bytes = if n == 0 { None } else { Some(n) };
        }

        cfg
    }

    /// Upper bound of acceptable free space, percent of total bytes.
    #[inline]
    pub fn max_free_space_percent(&self) -> u64 {
        100 - self.min_utilization.min(100)
    }

    pub fn with_enabled(mut self, on: bool) -> Self {
        self.enabled = on;
        self
    }

    pub fn with_read_only(mut self, on: bool) -> Self {
        self.read_only = on;
        self
    }

    pub fn with_min_utilization(mut self, percent: u64) -> Self {
        self.min_utilization = percent.min(100);
        self
    }

    pub fn with_start_in_ms(mut self, ms: u64) -> Self {
        self.start_in_ms = ms;
        self
    }

    pub fn with_file_min_age(mut self, files: u64) -> Self {
        self.file_min_age = files;
        self
    }

    pub fn with_files_interval(mut self, files: u64) -> Self {
        self.files_interval = files.max(1);
        self
    }

    pub fn with_run_period_ms(mut self, ms: u64) -> Self {
        self.run_period_ms = ms;
        self
    }

    pub fn with_transaction_acquire_timeout_ms(mut self, ms: u64) -> Self {
        self.transaction_acquire_timeout_ms = ms;
        self
    }

    pub fn with_transaction_timeout_ms(mut self, ms: u64) -> Self {
        self.transaction_timeout_ms = ms;
        self
    }

    pub fn with_files_deletion_delay_ms(mut self, ms: u64) -> Self {
        self.files_deletion_delay_ms = ms;
        self
    }

    pub fn with_rename_files(mut self, on: bool) -> Self {
        self.rename_files = on;
        self
    }

    pub fn with_use_exclusive_transaction(mut self, on: bool) -> Self {
        self.use_exclusive_transaction = on;
        self
    }

    pub fn with_utilization_from_scratch(mut self, on: bool) -> Self {
        self.utilization_from_scratch = on;
        self
    }

    pub fn with_utilization_from_file<S: Into<String>>(mut self, path: Option<S>) -> Self {
        self.utilization_from_file = path.map(Into::into);
        self
    }

    pub fn with_finish_timeout_ms(mut self, ms: u64) -> Self {
        self.finish_timeout_ms = ms;
        self
    }

    pub fn with_soft_memory_limit_bytes(mut self, limit: Option<u64>) -> Self {
        self.soft_memory_limit_bytes = limit;
        self
    }

    /// Finish the builder and obtain the configuration.
    pub fn build(self) -> Self {
        self
    }
}

impl fmt::Display for GcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GcConfig {{ \
             enabled: {}, \
             read_only: {}, \
             min_utilization: {}%, \
             start_in_ms: {}, \
             file_min_age: {}, \
             files_interval: {}, \
             run_period_ms: {}, \
             txn_acquire_timeout_ms: {}, \
             txn_timeout_ms: {}, \
             files_deletion_delay_ms: {}, \
             rename_files: {}, \
             exclusive_txn: {}, \
             utilization_from_scratch: {}, \
             utilization_from_file: {}, \
             finish_timeout_ms: {}, \
             soft_memory_limit: {} \
             }}",
            self.enabled,
            self.read_only,
            self.min_utilization,
            self.start_in_ms,
            self.file_min_age,
            self.files_interval,
            self.run_period_ms,
            self.transaction_acquire_timeout_ms,
            self.transaction_timeout_ms,
            self.files_deletion_delay_ms,
            self.rename_files,
            self.use_exclusive_transaction,
            self.utilization_from_scratch,
            self.utilization_from_file.as_deref().unwrap_or("none"),
            self.finish_timeout_ms,
            self.soft_memory_limit_bytes
                .map(|v| v.to_string())
                .unwrap_or_else(|| "off".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_free_space_threshold() {
        let c = GcConfig::default();
        assert!(c.enabled);
        assert_eq!(c.min_utilization, 50);
        assert_eq!(c.max_free_space_percent(), 50);

        let c = c.with_min_utilization(80).build();
        assert_eq!(c.max_free_space_percent(), 20);

        let c = c.with_min_utilization(250);
        assert_eq!(c.min_utilization, 100);
        assert_eq!(c.max_free_space_percent(), 0);
    }

    #[test]
    fn display_mentions_key_fields() {
        let s = GcConfig::default()
            .with_utilization_from_file(Some("/tmp/u.json"))
            .to_string();
        assert!(s.contains("min_utilization: 50%"));
        assert!(s.contains("/tmp/u.json"));
        assert!(s.contains("soft_memory_limit: off"));
    }
}
