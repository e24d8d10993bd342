//! env/oom — защита от нехватки памяти во время прохода GC.
//!
//! Проход проверяет guard между файлами: если процесс близок к пределу,
//! проход заканчивается досрочно (уже перенесённое будет зафиксировано).

use std::sync::Arc;

use crate::config::GcConfig;

pub trait OomGuard: Send + Sync {
    fn is_near_oom(&self) -> bool;
}

/// Never reports memory pressure.
pub struct NoOomGuard;

impl OomGuard for NoOomGuard {
    fn is_near_oom(&self) -> bool {
        false
    }
}

/// Compares the resident set size of the process with a soft limit.
pub struct RssOomGuard {
    limit_bytes: u64,
}

impl RssOomGuard {
    pub fn new(limit_bytes: u64) -> Self {
        Self { limit_bytes }
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    /// RSS from /proc/self/statm (second field, in pages). None off Linux.
    #[cfg(target_os = "linux")]
    pub fn rss_bytes() -> Option<u64> {
        let content = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages = content.split_whitespace().nth(1)?.parse::<u64>().ok()?;
        // 4 KiB страницы — без libc точнее не узнать
        Some(pages.saturating_mul(4096))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn rss_bytes() -> Option<u64> {
        None
    }
}

impl OomGuard for RssOomGuard {
    fn is_near_oom(&self) -> bool {
        match Self::rss_bytes() {
            Some(rss) => rss >= self.limit_bytes,
            None => false,
        }
    }
}

/// Guard for the configured soft memory limit.
pub fn guard_for(cfg: &GcConfig) -> Arc<dyn OomGuard> {
    match cfg.soft_memory_limit_bytes {
        Some(limit) => Arc::new(RssOomGuard::new(limit)),
        None => Arc::new(NoOomGuard),
    }
}
