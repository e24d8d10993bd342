//! Lightweight global metrics for QuiverGC.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - Jobs (выполнено / упало / отменено / миграции watchdog)
//! - GC passes (запуски, успехи, неудачи, таймауты транзакций)
//! - Files (очищено / удалено, перенесённые loggable'ы и байты)
//! - Utilization (пересчёты с нуля)

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Jobs -----
static JOBS_EXECUTED: AtomicU64 = AtomicU64::new(0);
static JOBS_FAILED: AtomicU64 = AtomicU64::new(0);
static JOBS_CANCELLED: AtomicU64 = AtomicU64::new(0);
static PROCESSOR_MIGRATIONS: AtomicU64 = AtomicU64::new(0);

// ----- GC passes -----
static GC_PASSES_STARTED: AtomicU64 = AtomicU64::new(0);
static GC_PASSES_SUCCEEDED: AtomicU64 = AtomicU64::new(0);
static GC_PASSES_FAILED: AtomicU64 = AtomicU64::new(0);
static GC_TXN_ACQUIRE_TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static GC_TXN_READ_ONLY: AtomicU64 = AtomicU64::new(0);

// ----- Files -----
static GC_FILES_CLEANED: AtomicU64 = AtomicU64::new(0);
static GC_FILES_DELETED: AtomicU64 = AtomicU64::new(0);
static GC_LOGGABLES_RECLAIMED: AtomicU64 = AtomicU64::new(0);
static GC_BYTES_RECLAIMED: AtomicU64 = AtomicU64::new(0);

// ----- Utilization -----
static UTILIZATION_RECOMPUTATIONS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    // Jobs
    pub jobs_executed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub processor_migrations: u64,

    // GC passes
    pub gc_passes_started: u64,
    pub gc_passes_succeeded: u64,
    pub gc_passes_failed: u64,
    pub gc_txn_acquire_timeouts: u64,
    pub gc_txn_read_only: u64,

    // Files
    pub gc_files_cleaned: u64,
    pub gc_files_deleted: u64,
    pub gc_loggables_reclaimed: u64,
    pub gc_bytes_reclaimed: u64,

    // Utilization
    pub utilization_recomputations: u64,
}

impl MetricsSnapshot {
    pub fn pass_success_ratio(&self) -> f64 {
        if self.gc_passes_started == 0 {
            0.0
        } else {
            self.gc_passes_succeeded as f64 / self.gc_passes_started as f64
        }
    }
}

// ----- Recorders (Jobs) -----
pub fn record_job_executed() {
    JOBS_EXECUTED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_job_failed() {
    JOBS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_jobs_cancelled(n: usize) {
    JOBS_CANCELLED.fetch_add(n as u64, Ordering::Relaxed);
}
pub fn record_processor_migration() {
    PROCESSOR_MIGRATIONS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (GC passes) -----
pub fn record_gc_pass_started() {
    GC_PASSES_STARTED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_gc_pass_finished(success: bool) {
    if success {
        GC_PASSES_SUCCEEDED.fetch_add(1, Ordering::Relaxed);
    } else {
        GC_PASSES_FAILED.fetch_add(1, Ordering::Relaxed);
    }
}
pub fn record_gc_txn_acquire_timeout() {
    GC_TXN_ACQUIRE_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_gc_txn_read_only() {
    GC_TXN_READ_ONLY.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Files) -----
pub fn record_gc_file_cleaned() {
    GC_FILES_CLEANED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_gc_file_deleted() {
    GC_FILES_DELETED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_gc_loggable_reclaimed(bytes: u64) {
    GC_LOGGABLES_RECLAIMED.fetch_add(1, Ordering::Relaxed);
    GC_BYTES_RECLAIMED.fetch_add(bytes, Ordering::Relaxed);
}

// ----- Recorders (Utilization) -----
pub fn record_utilization_recomputation() {
    UTILIZATION_RECOMPUTATIONS.fetch_add(1, Ordering::Relaxed);
}

// ----- Snapshot / Reset -----
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        jobs_executed: JOBS_EXECUTED.load(Ordering::Relaxed),
        jobs_failed: JOBS_FAILED.load(Ordering::Relaxed),
        jobs_cancelled: JOBS_CANCELLED.load(Ordering::Relaxed),
        processor_migrations: PROCESSOR_MIGRATIONS.load(Ordering::Relaxed),

        gc_passes_started: GC_PASSES_STARTED.load(Ordering::Relaxed),
        gc_passes_succeeded: GC_PASSES_SUCCEEDED.load(Ordering::Relaxed),
        gc_passes_failed: GC_PASSES_FAILED.load(Ordering::Relaxed),
        gc_txn_acquire_timeouts: GC_TXN_ACQUIRE_TIMEOUTS.load(Ordering::Relaxed),
        gc_txn_read_only: GC_TXN_READ_ONLY.load(Ordering::Relaxed),

        gc_files_cleaned: GC_FILES_CLEANED.load(Ordering::Relaxed),
        gc_files_deleted: GC_FILES_DELETED.load(Ordering::Relaxed),
        gc_loggables_reclaimed: GC_LOGGABLES_RECLAIMED.load(Ordering::Relaxed),
        gc_bytes_reclaimed: GC_BYTES_RECLAIMED.load(Ordering::Relaxed),

        utilization_recomputations: UTILIZATION_RECOMPUTATIONS.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    JOBS_EXECUTED.store(0, Ordering::Relaxed);
    JOBS_FAILED.store(0, Ordering::Relaxed);
    JOBS_CANCELLED.store(0, Ordering::Relaxed);
    PROCESSOR_MIGRATIONS.store(0, Ordering::Relaxed);

    GC_PASSES_STARTED.store(0, Ordering::Relaxed);
    GC_PASSES_SUCCEEDED.store(0, Ordering::Relaxed);
    GC_PASSES_FAILED.store(0, Ordering::Relaxed);
    GC_TXN_ACQUIRE_TIMEOUTS.store(0, Ordering::Relaxed);
    GC_TXN_READ_ONLY.store(0, Ordering::Relaxed);

    GC_FILES_CLEANED.store(0, Ordering::Relaxed);
    GC_FILES_DELETED.store(0, Ordering::Relaxed);
    GC_LOGGABLES_RECLAIMED.store(0, Ordering::Relaxed);
    GC_BYTES_RECLAIMED.store(0, Ordering::Relaxed);

    UTILIZATION_RECOMPUTATIONS.store(0, Ordering::Relaxed);
}
