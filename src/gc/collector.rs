//! gc/collector — GarbageCollector: выбор файлов, перенос живых записей, удаление.
//!
//! Проход очистки (только на потоке очистителя):
//!  1. выход, если GC выключен / read-only / приостановлен / окружение закрыто;
//!  2. выход, если свободного места не больше допустимого;
//!  3. троттлинг: start_in_ms после старта, file_min_age файлов, run_period_ms между проходами;
//!  4. кандидаты из профиля ниже high file (и ниже самых молодых file_min_age файлов);
//!  5. GC-транзакция: по файлу — все записи по порядку адресов, reclaim через хранилище
//!     (кэш по structure_id); non-exclusive — один файл на транзакцию;
//!     бюджет времени и OOM guard проверяются между файлами;
//!  6. flush; очищенные файлы → pending, их утилизация обнуляется, оценка пересчитывается;
//!  7. удаление — отложенной задачей того же процессора (сразу или через delay).
//!
//! Неудача захвата транзакции, read-only транзакция, неудачный flush non-exclusive
//! транзакции — не ошибки: проход "неуспешен", повтор позже. Неудачный flush
//! exclusive транзакции и повторная чистка pending-файла — ошибки инварианта.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use super::cleaner::BackgroundCleaner;
use super::jobs::{CleanEntireLogJob, ComputeUtilizationFromScratchJob, DeletePendingFilesJob};
use super::utilization::{ProfileSource, UtilizationProfile};
use crate::config::GcConfig;
use crate::env::oom::{guard_for, OomGuard};
use crate::env::{Environment, ExpiredLoggable, Log, RemoveMode, Store, Transaction};
use crate::jobs::{JobProcessor, Priority, ThreadJobProcessor};
use crate::metrics;
use crate::util::{now_millis, percent_of};

/// Attempts of the optimistic from-scratch scan before giving up.
const FROM_SCRATCH_ATTEMPTS: usize = 16;

/// Point-in-time view of the collector.
#[derive(Debug, Clone, Serialize)]
pub struct GcStats {
    pub files: usize,
    pub pending_files: usize,
    pub high_address: u64,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub free_percent: u64,
    pub suspended: bool,
}

pub struct GarbageCollector {
    me: Weak<GarbageCollector>,
    env: Arc<dyn Environment>,
    log: Arc<dyn Log>,
    cfg: GcConfig,
    profile: UtilizationProfile,
    cleaner: BackgroundCleaner,
    oom: Mutex<Arc<dyn OomGuard>>,
    default_processor: Mutex<Option<Arc<dyn JobProcessor>>>,
    pending: Mutex<BTreeSet<u64>>,
    deletion_queue: Mutex<VecDeque<u64>>,
    new_files: AtomicU64,
    stores: Mutex<HashMap<u64, Arc<dyn Store>>>,
    start_time: AtomicU64,
    last_pass_at: AtomicU64,
    hooked: AtomicBool,
}

impl GarbageCollector {
    /// Collector with its own dedicated cleaner thread.
    pub fn new(env: Arc<dyn Environment>) -> Arc<Self> {
        let p: Arc<dyn JobProcessor> = ThreadJobProcessor::new("quivergc-cleaner");
        Self::with_processor(env, p)
    }

    /// Collector running on `processor` (e.g. a delegating processor over a shared thread).
    pub fn with_processor(env: Arc<dyn Environment>, processor: Arc<dyn JobProcessor>) -> Arc<Self> {
        let cfg = env.config().clone();
        let log = env.log();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            profile: UtilizationProfile::new(env.clone()),
            cleaner: BackgroundCleaner::new(me.clone(), &cfg),
            oom: Mutex::new(guard_for(&cfg)),
            default_processor: Mutex::new(Some(processor)),
            env,
            log,
            cfg,
            pending: Mutex::new(BTreeSet::new()),
            deletion_queue: Mutex::new(VecDeque::new()),
            new_files: AtomicU64::new(0),
            stores: Mutex::new(HashMap::new()),
            start_time: AtomicU64::new(0),
            last_pass_at: AtomicU64::new(0),
            hooked: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &GcConfig {
        &self.cfg
    }

    pub fn cleaner(&self) -> &BackgroundCleaner {
        &self.cleaner
    }

    pub fn utilization_profile(&self) -> &UtilizationProfile {
        &self.profile
    }

    /// Replaces the OOM guard (the configured one is used by default).
    pub fn set_oom_guard(&self, guard: Arc<dyn OomGuard>) {
        *self.oom.lock().unwrap() = guard;
    }

    fn is_near_oom(&self) -> bool {
        let guard = self.oom.lock().unwrap().clone();
        guard.is_near_oom()
    }

    /// Binds the cleaner, hooks into log events, loads the utilization profile
    /// and schedules the first pass.
    pub fn start(&self) -> Result<()> {
        let p = self
            .default_processor
            .lock()
            .unwrap()
            .take()
            .or_else(|| self.cleaner.processor())
            .ok_or_else(|| anyhow!("no processor for the cleaner"))?;
        self.cleaner.set_job_processor(p)?;

        if !self.hooked.swap(true, Ordering::AcqRel) {
            let me = self.me.clone();
            self.log.add_new_file_listener(Arc::new(move |file| {
                if let Some(gc) = me.upgrade() {
                    gc.on_new_file(file);
                }
            }));
        }
        let me = self.me.clone();
        self.env
            .set_expired_loggables_listener(Some(Arc::new(move |expired: &[ExpiredLoggable]| {
                if let Some(gc) = me.upgrade() {
                    gc.fetch_expired_loggables(expired);
                }
            })));

        let now = now_millis();
        self.start_time.store(now, Ordering::Release);
        match self.profile.load()? {
            ProfileSource::Scratch => {
                self.compute_utilization_from_scratch(None);
            }
            src => debug!("utilization profile loaded from {:?}", src),
        }
        self.estimate();
        self.wake_at(now.saturating_add(self.cfg.start_in_ms));
        info!("gc started: {}", self.cfg);
        Ok(())
    }

    /// Stops the cleaner (with a best-effort deletion pass) and saves the profile.
    pub fn finish(&self) {
        self.cleaner.finish();
        self.env.set_expired_loggables_listener(None);
        if let Err(e) = self.profile.save() {
            warn!("gc: cannot save utilization profile: {:#}", e);
        }
        info!("gc finished");
    }

    pub fn wake(&self) -> bool {
        if !self.cfg.enabled || self.cfg.read_only {
            return false;
        }
        self.cleaner.queue_cleaning_job()
    }

    pub fn wake_at(&self, millis: u64) -> bool {
        if !self.cfg.enabled || self.cfg.read_only {
            return false;
        }
        self.cleaner.queue_cleaning_job_at(millis)
    }

    pub fn suspend(&self) {
        self.cleaner.suspend();
    }

    pub fn resume(&self) {
        self.cleaner.resume();
    }

    pub fn fetch_expired_loggables(&self, expired: &[ExpiredLoggable]) {
        self.profile.fetch_expired_loggables(expired);
    }

    fn on_new_file(&self, file: u64) {
        self.profile.add_file(file);
        let n = self.new_files.fetch_add(1, Ordering::AcqRel) + 1;
        if n >= self.cfg.files_interval {
            self.new_files.store(0, Ordering::Release);
            self.wake();
        }
    }

    pub fn is_file_cleaned(&self, file: u64) -> bool {
        self.pending.lock().unwrap().contains(&file)
    }

    pub fn pending_files(&self) -> Vec<u64> {
        self.pending.lock().unwrap().iter().copied().collect()
    }

    fn pending_snapshot(&self) -> BTreeSet<u64> {
        self.pending.lock().unwrap().clone()
    }

    fn estimate(&self) {
        self.profile.estimate_total_bytes(&self.pending_snapshot());
    }

    pub fn stats(&self) -> GcStats {
        let total = self.profile.total_bytes();
        let free = self.profile.total_free_bytes();
        GcStats {
            files: self.log.number_of_files(),
            pending_files: self.pending.lock().unwrap().len(),
            high_address: self.log.high_address(),
            total_bytes: total,
            free_bytes: free,
            free_percent: percent_of(free, total),
            suspended: self.cleaner.is_suspended(),
        }
    }

    /// Files never cleaned: below the high file and older than the newest
    /// `file_min_age` files.
    fn cleaning_bound(&self) -> u64 {
        let high_file = self.log.high_file_address();
        let age = self.cfg.file_min_age as usize;
        if age == 0 {
            return high_file;
        }
        let files = self.log.all_file_addresses();
        if files.len() < age {
            return 0;
        }
        high_file.min(files[files.len() - age])
    }

    // ------------------------------------------------------------------
    // background pass
    // ------------------------------------------------------------------

    /// One background cleaning pass. Ok(false) means "unsuccessful, try later".
    pub fn clean_fragmented_files(&self) -> Result<bool> {
        self.cleaner.check_thread()?;
        if !self.cfg.enabled || self.cfg.read_only || self.cleaner.is_suspended() || !self.env.is_open()
        {
            return Ok(false);
        }

        self.estimate();
        if !self.profile.is_too_much_free_space() {
            debug!(
                "gc: free space {}% within {}%, nothing to do",
                self.profile.total_free_space_percent(),
                self.cfg.max_free_space_percent()
            );
            return Ok(true);
        }

        let now = now_millis();
        let earliest = self
            .start_time
            .load(Ordering::Acquire)
            .saturating_add(self.cfg.start_in_ms);
        if now < earliest {
            self.wake_at(earliest);
            return Ok(false);
        }
        if (self.log.number_of_files() as u64) <= self.cfg.file_min_age {
            return Ok(false);
        }
        let last = self.last_pass_at.load(Ordering::Acquire);
        if last != 0 && now < last.saturating_add(self.cfg.run_period_ms) {
            self.wake_at(last.saturating_add(self.cfg.run_period_ms));
            return Ok(false);
        }
        self.last_pass_at.store(now, Ordering::Release);

        let pending = self.pending_snapshot();
        let candidates: Vec<u64> = self
            .profile
            .files_sorted_by_utilization(self.cleaning_bound(), &pending)
            .map(|(f, _)| f)
            .collect();

        metrics::record_gc_pass_started();
        info!(
            "gc pass: {} candidate(s), free {}%",
            candidates.len(),
            self.profile.total_free_space_percent()
        );
        let (ok, cleaned) = self.clean_files(candidates)?;
        metrics::record_gc_pass_finished(ok);

        if let Err(e) = self.profile.save() {
            warn!("gc: cannot save utilization profile: {:#}", e);
        }

        if !ok {
            if !self.cleaner.is_suspended() {
                let retry = self.cfg.run_period_ms.max(self.cfg.transaction_acquire_timeout_ms);
                self.wake_at(now_millis().saturating_add(retry));
            }
        } else if cleaned > 0 && self.profile.is_too_much_free_space() {
            self.wake();
        }
        info!(
            "gc pass done: success={}, cleaned {} file(s), free {}%",
            ok,
            cleaned,
            self.profile.total_free_space_percent()
        );
        Ok(ok)
    }

    /// Cleans `files` in order. Ok(false) on contention, read-only fallback,
    /// non-exclusive flush failure or suspension.
    pub fn do_clean_files<I: IntoIterator<Item = u64>>(&self, files: I) -> Result<bool> {
        self.clean_files(files.into_iter().collect()).map(|(ok, _)| ok)
    }

    fn clean_files(&self, files: Vec<u64>) -> Result<(bool, usize)> {
        self.cleaner.check_thread()?;
        if files.is_empty() {
            return Ok((true, 0));
        }
        let started = Instant::now();
        let budget = Duration::from_millis(self.cfg.transaction_timeout_ms);
        let acquire_timeout = Duration::from_millis(self.cfg.transaction_acquire_timeout_ms);
        let mut remaining = files.into_iter().peekable();
        let mut cleaned_total = 0usize;

        while remaining.peek().is_some() {
            let mut txn = match self.env.begin_gc_transaction(acquire_timeout)? {
                Some(t) => t,
                None => {
                    metrics::record_gc_txn_acquire_timeout();
                    debug!("gc: transaction not acquired within {:?}", acquire_timeout);
                    return Ok((false, cleaned_total));
                }
            };
            if txn.is_read_only() {
                txn.abort();
                metrics::record_gc_txn_read_only();
                debug!("gc: got a read-only transaction, retry later");
                return Ok((false, cleaned_total));
            }
            let exclusive = txn.is_exclusive();

            let mut cleaned: Vec<u64> = Vec::new();
            let mut out_of_budget = false;
            while let Some(&file) = remaining.peek() {
                if self.cleaner.is_suspended() {
                    break;
                }
                if cleaned_total + cleaned.len() > 0
                    && (started.elapsed() >= budget || self.is_near_oom())
                {
                    out_of_budget = true;
                    break;
                }
                if self.is_file_cleaned(file) {
                    txn.abort();
                    return Err(anyhow!("file {} is already cleaned and pending deletion", file));
                }
                if let Err(e) = self.clean_single_file(txn.as_mut(), file) {
                    txn.abort();
                    return Err(e);
                }
                remaining.next();
                cleaned.push(file);
                if !exclusive {
                    break;
                }
            }

            if self.cleaner.is_suspended() {
                txn.abort();
                info!("gc: suspended, pass aborted");
                return Ok((false, cleaned_total));
            }
            if cleaned.is_empty() {
                txn.abort();
                break;
            }

            let flushed = match txn.force_flush() {
                Ok(f) => f,
                Err(e) => {
                    warn!("gc: flush failed: {:#}", e);
                    false
                }
            };
            if !flushed {
                txn.abort();
                if exclusive {
                    return Err(anyhow!(
                        "exclusive GC transaction failed to flush ({} file(s))",
                        cleaned.len()
                    ));
                }
                return Ok((false, cleaned_total));
            }
            drop(txn);

            {
                let mut pending = self.pending.lock().unwrap();
                pending.extend(cleaned.iter().copied());
            }
            for f in &cleaned {
                self.profile.reset_file(*f);
                metrics::record_gc_file_cleaned();
            }
            self.estimate();
            cleaned_total += cleaned.len();
            self.schedule_deletion(cleaned);

            if out_of_budget {
                break;
            }
        }
        Ok((true, cleaned_total))
    }

    fn clean_single_file(&self, txn: &mut dyn Transaction, file: u64) -> Result<()> {
        let end = file + self.log.file_length();
        let mut relocated = 0u64;
        for item in self.log.loggables_from(file) {
            let l = item?;
            if l.address >= end {
                break;
            }
            if !l.is_relocatable() {
                continue;
            }
            let store = match self.store_for(txn, l.structure_id)? {
                Some(s) => s,
                None => continue,
            };
            store.reclaim(txn, &l)?;
            metrics::record_gc_loggable_reclaimed(l.length);
            relocated += 1;
        }
        debug!("gc: file {} scanned, {} record(s) offered for reclaim", file, relocated);
        Ok(())
    }

    fn store_for(&self, txn: &mut dyn Transaction, structure_id: u64) -> Result<Option<Arc<dyn Store>>> {
        if let Some(s) = self.stores.lock().unwrap().get(&structure_id) {
            return Ok(Some(s.clone()));
        }
        let s = txn.open_store(structure_id)?;
        if let Some(s) = s.as_ref() {
            self.stores.lock().unwrap().insert(structure_id, s.clone());
        }
        Ok(s)
    }

    /// Deletion runs once no reader can see the cleaned files, on the cleaner's
    /// processor, immediately or after `files_deletion_delay_ms`.
    fn schedule_deletion(&self, files: Vec<u64>) {
        let me = self.me.clone();
        self.env.execute_transaction_safe_task(Box::new(move || {
            let gc = match me.upgrade() {
                Some(gc) => gc,
                None => return,
            };
            gc.deletion_queue.lock().unwrap().extend(files);
            gc.queue_deletion_job();
        }));
    }

    /// Queues DeletePendingFilesJob on the cleaner's processor if the deletion
    /// queue is not empty (after `files_deletion_delay_ms`, if set).
    pub(crate) fn queue_deletion_job(&self) -> bool {
        if self.deletion_queue.lock().unwrap().is_empty() {
            return false;
        }
        let p = match self.cleaner.processor() {
            Some(p) => p,
            None => return false,
        };
        let job = DeletePendingFilesJob::new(self.me.clone()).as_job();
        let delay = self.cfg.files_deletion_delay_ms;
        if delay == 0 {
            p.queue(job, Priority::Highest)
        } else {
            p.queue_at_priority(job, now_millis().saturating_add(delay), Priority::Highest)
        }
    }

    /// Removes every file in the deletion queue. Each of them must be pending.
    pub fn delete_pending_files(&self) -> Result<()> {
        self.cleaner.check_thread()?;
        let files: Vec<u64> = self.deletion_queue.lock().unwrap().drain(..).collect();
        if files.is_empty() {
            return Ok(());
        }
        {
            let pending = self.pending.lock().unwrap();
            if let Some(f) = files.iter().find(|f| !pending.contains(f)) {
                return Err(anyhow!("file {} queued for deletion but not pending", f));
            }
        }
        // перенесённые данные должны быть на диске раньше, чем исчезнут исходные файлы
        self.env.flush_and_sync()?;
        self.env
            .remove_files(&files, RemoveMode::from_config(&self.cfg))?;
        {
            let mut pending = self.pending.lock().unwrap();
            for f in &files {
                pending.remove(f);
            }
        }
        for f in &files {
            self.profile.remove_file(*f);
            metrics::record_gc_file_deleted();
        }
        self.estimate();
        info!("gc: deleted {} file(s)", files.len());
        Ok(())
    }

    // ------------------------------------------------------------------
    // full compaction
    // ------------------------------------------------------------------

    /// Queues a full compaction and waits for it (runs inline on the cleaner thread).
    pub fn clean_entire_log(&self, timeout: Duration) -> Result<bool> {
        if self.cleaner.is_cleaner_thread() {
            self.clean_entire_log_now()?;
            return Ok(true);
        }
        let p = self
            .cleaner
            .processor()
            .ok_or_else(|| anyhow!("gc is not started"))?;
        p.queue(CleanEntireLogJob::new(self.me.clone()).as_job(), Priority::Normal);
        Ok(p.wait_for_jobs(timeout))
    }

    pub(crate) fn clean_entire_log_now(&self) -> Result<()> {
        self.cleaner.check_thread()?;
        info!("gc: cleaning entire log ({} files)", self.log.number_of_files());
        loop {
            let before = self.log.number_of_files();
            let high_file = self.log.high_file_address();
            let pending = self.pending_snapshot();
            let candidates: Vec<u64> = self
                .log
                .all_file_addresses()
                .into_iter()
                .filter(|f| *f < high_file && !pending.contains(f))
                .filter(|f| self.profile.free_bytes(*f) != Some(0))
                .collect();
            let (ok, cleaned) = self.clean_files(candidates)?;
            self.delete_pending_files()?;
            let after = self.log.number_of_files();
            debug!(
                "gc: entire-log round: success={}, cleaned {}, files {} -> {}",
                ok, cleaned, before, after
            );
            if !ok || after >= before {
                break;
            }
        }
        if let Err(e) = self.profile.save() {
            warn!("gc: cannot save utilization profile: {:#}", e);
        }
        info!("gc: entire log cleaned, {} files left", self.log.number_of_files());
        Ok(())
    }

    // ------------------------------------------------------------------
    // utilization from scratch
    // ------------------------------------------------------------------

    /// Queues a from-scratch recomputation; with `wait` blocks up to that long.
    pub fn compute_utilization_from_scratch(&self, wait: Option<Duration>) -> bool {
        let p = match self.cleaner.processor() {
            Some(p) => p,
            None => return false,
        };
        let job = ComputeUtilizationFromScratchJob::new(self.me.clone()).as_job();
        p.queue(job, Priority::AboveNormal);
        match wait {
            Some(t) => p.wait_for_jobs(t),
            None => true,
        }
    }

    pub(crate) fn compute_utilization_from_scratch_now(&self) -> Result<()> {
        for attempt in 1..=FROM_SCRATCH_ATTEMPTS {
            let txn = self.env.begin_read_only_transaction()?;
            let high_before = self.log.high_address();
            let mut used: BTreeMap<u64, u64> = BTreeMap::new();
            for store in txn.all_stores() {
                store.for_each_live(txn.as_ref(), &mut |addr, len| {
                    *used.entry(self.log.file_address(addr)).or_insert(0) += len;
                })?;
            }
            let high_after = self.log.high_address();
            drop(txn);
            if high_before != high_after {
                debug!("gc: log advanced during utilization scan (attempt {}), retry", attempt);
                continue;
            }

            let fl = self.log.file_length();
            let files: BTreeMap<u64, u64> = self
                .log
                .all_file_addresses()
                .into_iter()
                .map(|f| {
                    let written = self.log.file_written_size(f).min(fl);
                    let live = used.get(&f).copied().unwrap_or(0);
                    (f, written.saturating_sub(live))
                })
                .collect();
            let n = self.profile.install(files);
            // истечения между сканом и install() затёрты — пересчитываем
            if self.log.high_address() != high_after && attempt < FROM_SCRATCH_ATTEMPTS {
                debug!(
                    "gc: log advanced while installing utilization (attempt {}), retry",
                    attempt
                );
                continue;
            }
            self.estimate();
            metrics::record_utilization_recomputation();
            info!(
                "gc: utilization recomputed for {} file(s), free {}%",
                n,
                self.profile.total_free_space_percent()
            );
            return Ok(());
        }
        warn!(
            "gc: log kept advancing, utilization not recomputed after {} attempts",
            FROM_SCRATCH_ATTEMPTS
        );
        Ok(())
    }
}
