//! gc/cleaner — BackgroundCleaner: привязка GC к одному потоку.
//!
//! Владеет ссылкой на процессор (можно заменить на лету), запоминает его поток
//! для check_thread() и держит единственный экземпляр BackgroundCleaningJob.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use super::collector::GarbageCollector;
use super::jobs::{cancel_if_gc_job, BackgroundCleaningJob, DeletePendingFilesJob};
use crate::config::GcConfig;
use crate::jobs::processor::{log_exception_handler, same_processor};
use crate::jobs::{JobProcessor, Priority};

pub struct BackgroundCleaner {
    gc: Weak<GarbageCollector>,
    enabled: bool,
    read_only: bool,
    finish_timeout: Duration,
    processor: RwLock<Option<Arc<dyn JobProcessor>>>,
    thread_id: Mutex<Option<ThreadId>>,
    suspended: AtomicBool,
    cleaning: AtomicBool,
    cleaning_job: Arc<BackgroundCleaningJob>,
}

impl BackgroundCleaner {
    pub(crate) fn new(gc: Weak<GarbageCollector>, cfg: &GcConfig) -> Self {
        Self {
            cleaning_job: BackgroundCleaningJob::new(gc.clone()),
            gc,
            enabled: cfg.enabled,
            read_only: cfg.read_only,
            finish_timeout: Duration::from_millis(cfg.finish_timeout_ms),
            processor: RwLock::new(None),
            thread_id: Mutex::new(None),
            suspended: AtomicBool::new(false),
            cleaning: AtomicBool::new(false),
        }
    }

    pub fn processor(&self) -> Option<Arc<dyn JobProcessor>> {
        self.processor.read().unwrap().clone()
    }

    /// Binds the cleaner to `p`. `p` must run every job on one thread (a delegating
    /// processor qualifies through its delegate). Installs the logging exception
    /// handler if `p` has none and starts it.
    pub fn set_job_processor(&self, p: Arc<dyn JobProcessor>) -> Result<()> {
        if !p.is_thread_affine() {
            return Err(anyhow!(
                "cleaner processor {} is not thread-affine",
                p.name()
            ));
        }
        if p.exception_handler().is_none() {
            p.set_exception_handler(Some(log_exception_handler()));
        }
        p.start()?;
        let tid = p
            .thread_id()
            .ok_or_else(|| anyhow!("cleaner processor {} has no thread after start", p.name()))?;

        let old = self.processor.write().unwrap().replace(p.clone());
        *self.thread_id.lock().unwrap() = Some(tid);
        info!("cleaner bound to {} (thread {:?})", p.name(), tid);

        if let Some(old) = old {
            if !same_processor(&old, &p) {
                // готовые GC-задачи старого процессора переставят себя сами,
                // отложенные finish() отбросит — их ставим заново
                old.finish();
                self.requeue_after_swap();
            }
        }
        Ok(())
    }

    fn requeue_after_swap(&self) {
        let gc = match self.gc.upgrade() {
            Some(gc) => gc,
            None => return,
        };
        if !self.cleaning_job.link().is_cancelled() {
            self.queue_cleaning_job();
        }
        if gc.queue_deletion_job() {
            debug!("cleaner: pending deletion moved to the new processor");
        }
    }

    /// Expected cleaner thread: the live thread of the processor, else the recorded one.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.processor()
            .and_then(|p| p.thread_id())
            .or(*self.thread_id.lock().unwrap())
    }

    /// Fails unless called on the cleaner thread.
    pub fn check_thread(&self) -> Result<()> {
        let current = std::thread::current().id();
        match self.thread_id() {
            Some(t) if t == current => Ok(()),
            expected => Err(anyhow!(
                "GC operation on thread {:?}, expected cleaner thread {:?}",
                current,
                expected
            )),
        }
    }

    pub fn is_cleaner_thread(&self) -> bool {
        self.check_thread().is_ok()
    }

    pub fn cleaning_job(&self) -> &Arc<BackgroundCleaningJob> {
        &self.cleaning_job
    }

    fn can_clean(&self) -> bool {
        self.enabled && !self.read_only
    }

    pub fn queue_cleaning_job(&self) -> bool {
        if !self.can_clean() {
            return false;
        }
        let p = match self.processor() {
            Some(p) => p,
            None => return false,
        };
        self.cleaning_job.renew(self.gc.clone());
        p.queue(self.cleaning_job.as_job(), Priority::Normal)
    }

    pub fn queue_cleaning_job_at(&self, millis: u64) -> bool {
        if !self.can_clean() {
            return false;
        }
        let p = match self.processor() {
            Some(p) => p,
            None => return false,
        };
        self.cleaning_job.renew(self.gc.clone());
        p.queue_at(self.cleaning_job.as_job(), millis)
    }

    /// Pauses cleaning. A running pass notices the flag between files and before
    /// its flush and aborts; the call returns once the processor is parked.
    pub fn suspend(&self) {
        if self.suspended.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("cleaner: suspend");
        if let Some(p) = self.processor() {
            p.suspend();
        }
    }

    pub fn resume(&self) {
        if !self.suspended.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("cleaner: resume");
        if let Some(p) = self.processor() {
            p.resume();
        }
        self.queue_cleaning_job();
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn is_cleaning(&self) -> bool {
        self.cleaning.load(Ordering::Acquire)
    }

    pub(crate) fn set_cleaning(&self, on: bool) {
        self.cleaning.store(on, Ordering::Release);
    }

    /// Cancels GC jobs, makes a bounded best-effort deletion pass and stops the processor.
    pub fn finish(&self) {
        let p = match self.processor() {
            Some(p) => p,
            None => return,
        };
        if let Some(current) = p.current_job() {
            cancel_if_gc_job(&current);
        }
        self.cleaning_job.link().cancel();

        if self.suspended.swap(false, Ordering::AcqRel) {
            p.resume();
        }
        if !p.is_processor_thread() && p.is_started() {
            let job = DeletePendingFilesJob::new(self.gc.clone());
            if p.queue(job.as_job(), Priority::Highest) && !p.wait_for_jobs(self.finish_timeout) {
                warn!(
                    "cleaner: pending files not deleted within {:?}",
                    self.finish_timeout
                );
            }
        }
        p.finish();
        info!("cleaner: finished ({})", p.name());
    }
}
