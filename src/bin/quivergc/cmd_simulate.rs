use anyhow::{anyhow, Result};
use serde::Serialize;
use std::hash::Hasher;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use twox_hash::XxHash64;

use QuiverGC::env::mem::{kv_record_len, MemEnvironment};
use QuiverGC::env::Store;
use QuiverGC::gc::{FileProfileStore, GarbageCollector, GcStats};
use QuiverGC::metrics;
use QuiverGC::GcConfig;

const KEY_LEN: usize = 8;

pub struct SimulateArgs {
    pub files: u64,
    pub file_length: u64,
    pub record_size: u64,
    pub delete_percent: u64,
    pub min_utilization: u64,
    pub exclusive: bool,
    pub full: bool,
    pub seed: u64,
    pub save_profile: Option<PathBuf>,
    pub timeout_ms: u64,
    pub json: bool,
}

#[derive(Serialize)]
struct Report {
    records_written: u64,
    records_deleted: u64,
    live_bytes: u64,
    before: GcStats,
    after: GcStats,
    converged: bool,
    elapsed_ms: u128,
    passes_started: u64,
    passes_succeeded: u64,
    files_cleaned: u64,
    files_deleted: u64,
    loggables_reclaimed: u64,
    bytes_reclaimed: u64,
}

fn is_deleted(i: u64, seed: u64, percent: u64) -> bool {
    let mut h = XxHash64::with_seed(seed);
    h.write_u64(i);
    h.finish() % 100 < percent
}

pub fn exec(a: SimulateArgs) -> Result<()> {
    let min_len = kv_record_len(KEY_LEN, 0);
    if a.record_size < min_len || a.record_size > a.file_length {
        return Err(anyhow!(
            "record size must be within [{}, {}], got {}",
            min_len,
            a.file_length,
            a.record_size
        ));
    }
    let value_len = (a.record_size - min_len) as usize;

    let cfg = GcConfig::from_env()
        .with_min_utilization(a.min_utilization)
        .with_start_in_ms(0)
        .with_run_period_ms(0)
        .with_file_min_age(1)
        .with_files_deletion_delay_ms(0)
        .with_use_exclusive_transaction(a.exclusive)
        .with_transaction_timeout_ms(a.timeout_ms)
        .build();
    let env = MemEnvironment::new(cfg, a.file_length);
    if let Some(p) = a.save_profile.as_ref() {
        env.set_profile_store(Some(Arc::new(FileProfileStore::new(p.clone()))));
    }
    let store = env.create_store("simulate");
    let sid = store.structure_id();

    metrics::reset();
    let gc = GarbageCollector::new(env.clone());
    gc.start()?;
    // пересчёт профиля с нуля должен закончиться до первой записи
    if let Some(p) = gc.cleaner().processor() {
        p.wait_for_jobs(Duration::from_millis(a.timeout_ms));
    }

    let per_file = a.file_length / a.record_size;
    let total = per_file * a.files;
    let value = vec![0xABu8; value_len];
    for i in 0..total {
        env.put(sid, format!("r{:07}", i).as_bytes(), &value)?;
    }
    let mut deleted = 0u64;
    for i in 0..total {
        if is_deleted(i, a.seed, a.delete_percent) {
            env.delete(sid, format!("r{:07}", i).as_bytes())?;
            deleted += 1;
        }
    }
    let before = gc.stats();

    let started = Instant::now();
    let timeout = Duration::from_millis(a.timeout_ms);
    let converged = if a.full {
        gc.clean_entire_log(timeout)?
    } else {
        gc.wake();
        loop {
            let s = gc.stats();
            let profile = gc.utilization_profile();
            if !profile.is_too_much_free_space() && s.pending_files == 0 {
                break true;
            }
            if started.elapsed() >= timeout {
                break false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    };
    let elapsed_ms = started.elapsed().as_millis();
    gc.finish();
    let after = gc.stats();
    let m = metrics::snapshot();

    let report = Report {
        records_written: total,
        records_deleted: deleted,
        live_bytes: env.live_bytes(),
        before,
        after,
        converged,
        elapsed_ms,
        passes_started: m.gc_passes_started,
        passes_succeeded: m.gc_passes_succeeded,
        files_cleaned: m.gc_files_cleaned,
        files_deleted: m.gc_files_deleted,
        loggables_reclaimed: m.gc_loggables_reclaimed,
        bytes_reclaimed: m.gc_bytes_reclaimed,
    };

    if a.json {
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }

    println!("records:   {} written, {} deleted", report.records_written, report.records_deleted);
    println!(
        "before:    {} files, free {}% ({} of {} bytes)",
        report.before.files, report.before.free_percent, report.before.free_bytes, report.before.total_bytes
    );
    println!(
        "after:     {} files, free {}% ({} of {} bytes), pending {}",
        report.after.files,
        report.after.free_percent,
        report.after.free_bytes,
        report.after.total_bytes,
        report.after.pending_files
    );
    println!("converged: {} in {} ms", report.converged, report.elapsed_ms);
    println!(
        "passes:    {} started, {} succeeded; files cleaned {}, deleted {}",
        report.passes_started, report.passes_succeeded, report.files_cleaned, report.files_deleted
    );
    println!(
        "reclaim:   {} loggables, {} bytes; live {} bytes",
        report.loggables_reclaimed, report.bytes_reclaimed, report.live_bytes
    );
    Ok(())
}
