//! jobs/multi — MultiThreadDelegatingJobProcessor: пул из N ThreadJobProcessor.
//!
//! Маршрутизация: shard = xxhash64(job.key()) % N. Равные (по ключу) задачи всегда
//! попадают в один и тот же воркер, так что дедупликация очереди сохраняется.
//!
//! Watchdog: отдельный поток раз в check_interval смотрит на текущие задачи воркеров.
//! Если задача висит дольше job_timeout, воркер заменяется свежим, вся ещё не начатая
//! работа (готовая и timed) переносится в замену, а зависший поток бросается —
//! он завершится сам, если задача когда-нибудь вернётся.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use super::latch::LatchJob;
use super::processor::{JobExceptionHandler, JobProcessor, Schedule};
use super::thread::ThreadJobProcessor;
use super::{JobRef, Priority};
use crate::hash::shard_of;
use crate::metrics;
use crate::util::now_millis;

pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub struct MultiThreadDelegatingJobProcessor {
    name: String,
    me: Weak<MultiThreadDelegatingJobProcessor>,
    workers: RwLock<Vec<Arc<ThreadJobProcessor>>>,
    spawned: AtomicUsize,
    job_timeout: Duration,
    check_interval: Duration,
    started: AtomicBool,
    finishing: AtomicBool,
    finished: AtomicBool,
    handler: Mutex<Option<JobExceptionHandler>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<(Mutex<bool>, Condvar)>,
}

impl MultiThreadDelegatingJobProcessor {
    pub fn new(name: &str, threads: usize) -> Arc<Self> {
        Self::with_watchdog(name, threads, DEFAULT_JOB_TIMEOUT, DEFAULT_CHECK_INTERVAL)
    }

    pub fn with_watchdog(
        name: &str,
        threads: usize,
        job_timeout: Duration,
        check_interval: Duration,
    ) -> Arc<Self> {
        let threads = threads.max(1);
        let workers = (0..threads)
            .map(|i| ThreadJobProcessor::new(&format!("{}-{}", name, i)))
            .collect::<Vec<_>>();
        Arc::new_cyclic(|me| Self {
            name: name.to_string(),
            me: me.clone(),
            workers: RwLock::new(workers),
            spawned: AtomicUsize::new(threads),
            job_timeout,
            check_interval: check_interval.max(Duration::from_millis(1)),
            started: AtomicBool::new(false),
            finishing: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            handler: Mutex::new(None),
            watchdog: Mutex::new(None),
            stop: Arc::new((Mutex::new(false), Condvar::new())),
        })
    }

    pub fn thread_count(&self) -> usize {
        self.workers.read().unwrap().len()
    }

    /// Snapshot of the current workers (replacements included).
    pub fn workers(&self) -> Vec<Arc<ThreadJobProcessor>> {
        self.workers.read().unwrap().clone()
    }

    fn owner(&self) -> Weak<dyn JobProcessor> {
        let w: Weak<dyn JobProcessor> = self.me.clone();
        w
    }

    fn worker_for(&self, job: &JobRef) -> Arc<ThreadJobProcessor> {
        let ws = self.workers.read().unwrap();
        ws[shard_of(&job.key(), ws.len())].clone()
    }

    /// One watchdog round: replace every worker whose current job overran the timeout.
    /// Returns the number of replaced workers.
    pub fn check_stuck_workers(&self) -> usize {
        let now = now_millis();
        let limit = self.job_timeout.as_millis() as u64;
        let stuck: Vec<usize> = {
            let ws = self.workers.read().unwrap();
            ws.iter()
                .enumerate()
                .filter(|(_, w)| !w.is_suspended())
                .filter_map(|(i, w)| {
                    w.current_job_started_at()
                        .filter(|since| now.saturating_sub(*since) > limit)
                        .map(|_| i)
                })
                .collect()
        };
        let mut replaced = 0;
        for idx in stuck {
            match self.replace_worker(idx) {
                Ok(()) => replaced += 1,
                Err(e) => warn!("{}: watchdog failed to replace worker {}: {:#}", self.name, idx, e),
            }
        }
        replaced
    }

    fn replace_worker(&self, idx: usize) -> Result<()> {
        let n = self.spawned.fetch_add(1, Ordering::AcqRel);
        let fresh = ThreadJobProcessor::new(&format!("{}-{}", self.name, n));
        if self.started.load(Ordering::Acquire) {
            fresh.start()?;
        }
        let old = {
            let mut ws = self.workers.write().unwrap();
            let slot = ws
                .get_mut(idx)
                .ok_or_else(|| anyhow!("no worker at index {}", idx))?;
            std::mem::replace(slot, fresh.clone())
        };
        let stuck_job = old.current_job().map(|j| j.name()).unwrap_or_default();
        let (ready, timed) = old.abandon();
        let moved = ready.len() + timed.len();

        for (job, prio) in ready {
            let owner = job.state().processor_weak().unwrap_or_else(|| self.owner());
            fresh.enqueue(job, Schedule::Now(prio), Some(owner));
        }
        for (job, at, prio) in timed {
            let owner = job.state().processor_weak().unwrap_or_else(|| self.owner());
            fresh.enqueue(job, Schedule::At(at, prio), Some(owner));
        }

        metrics::record_processor_migration();
        warn!(
            "{}: job {} stuck longer than {:?}; migrated {} queued job(s) to {}",
            self.name,
            stuck_job,
            self.job_timeout,
            moved,
            fresh.name()
        );
        Ok(())
    }

    fn spawn_watchdog(&self) -> Result<()> {
        let mut wd = self.watchdog.lock().unwrap();
        if wd.is_some() {
            return Ok(());
        }
        *self.stop.0.lock().unwrap() = false;
        let me = self.me.clone();
        let stop = self.stop.clone();
        let interval = self.check_interval;
        let handle = std::thread::Builder::new()
            .name(format!("{}-watchdog", self.name))
            .spawn(move || watchdog_loop(me, stop, interval))
            .with_context(|| format!("spawn watchdog for {}", self.name))?;
        *wd = Some(handle);
        Ok(())
    }

    fn stop_watchdog(&self) {
        {
            let (lock, cv) = &*self.stop;
            *lock.lock().unwrap() = true;
            cv.notify_all();
        }
        let handle = self.watchdog.lock().unwrap().take();
        if let Some(h) = handle {
            if h.thread().id() != std::thread::current().id() && h.join().is_err() {
                warn!("{}: watchdog thread panicked", self.name);
            }
        }
    }

    /// Pushes `job` to `worker`. If the watchdog replaced that worker after it was
    /// picked, the job goes to the replacement instead.
    fn enqueue_on(
        &self,
        worker: Arc<ThreadJobProcessor>,
        job: JobRef,
        when: Schedule,
        owner: Weak<dyn JobProcessor>,
    ) -> bool {
        if worker.enqueue(job.clone(), when, Some(owner.clone())) {
            return true;
        }
        if !worker.is_finished() {
            // слита с равной задачей
            return false;
        }
        let current = self.worker_for(&job);
        if Arc::ptr_eq(&current, &worker) {
            return false;
        }
        debug!("{}: worker {} replaced, rerouting {}", self.name, worker.name(), job.name());
        current.enqueue(job, when, Some(owner))
    }

    fn barrier_all(&self, when: Schedule, timeout: Duration) -> bool {
        if self.is_processor_thread() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        let mut barriers = Vec::new();
        for w in self.workers() {
            let b = LatchJob::new();
            if !w.enqueue(b.clone(), when, Some(self.owner())) {
                return false;
            }
            barriers.push(b);
        }
        barriers.iter().all(|b| {
            let left = deadline.saturating_duration_since(Instant::now());
            b.latch().wait_timeout(left)
        })
    }
}

fn watchdog_loop(
    me: Weak<MultiThreadDelegatingJobProcessor>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    interval: Duration,
) {
    let (lock, cv) = &*stop;
    loop {
        {
            let g = lock.lock().unwrap();
            let (g, _) = cv.wait_timeout_while(g, interval, |s| !*s).unwrap();
            if *g {
                break;
            }
        }
        let Some(p) = me.upgrade() else { break };
        if p.is_started() {
            p.check_stuck_workers();
        }
    }
    debug!("watchdog stopped");
}

impl JobProcessor for MultiThreadDelegatingJobProcessor {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.finishing.store(false, Ordering::Release);
        self.finished.store(false, Ordering::Release);
        for w in self.workers() {
            w.start()?;
        }
        self.spawn_watchdog()?;
        info!(
            "{}: started {} worker(s), job timeout {:?}",
            self.name,
            self.thread_count(),
            self.job_timeout
        );
        Ok(())
    }

    fn finish(&self) {
        if !self.started.load(Ordering::Acquire) || self.finishing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_watchdog();
        for w in self.workers() {
            w.finish();
        }
        self.finished.store(true, Ordering::Release);
        self.started.store(false, Ordering::Release);
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.finishing.load(Ordering::Acquire)
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn enqueue(&self, job: JobRef, when: Schedule, owner: Option<Weak<dyn JobProcessor>>) -> bool {
        if self.finishing.load(Ordering::Acquire) || self.finished.load(Ordering::Acquire) {
            return false;
        }
        let worker = self.worker_for(&job);
        self.enqueue_on(worker, job, when, owner.unwrap_or_else(|| self.owner()))
    }

    fn wait_for_jobs(&self, timeout: Duration) -> bool {
        self.barrier_all(Schedule::Now(Priority::Lowest), timeout)
    }

    fn wait_for_timed_jobs(&self, timeout: Duration) -> bool {
        self.barrier_all(Schedule::LowestTimed, timeout)
    }

    fn suspend(&self) {
        for w in self.workers() {
            w.suspend();
        }
    }

    fn resume(&self) {
        for w in self.workers() {
            w.resume();
        }
    }

    fn is_suspended(&self) -> bool {
        self.workers().iter().all(|w| w.is_suspended())
    }

    fn pending_jobs(&self) -> usize {
        self.workers().iter().map(|w| w.pending_jobs()).sum()
    }

    fn pending_timed_jobs(&self) -> usize {
        self.workers().iter().map(|w| w.pending_timed_jobs()).sum()
    }

    /// Current job of the calling worker thread, otherwise of the first busy worker.
    fn current_job(&self) -> Option<JobRef> {
        let ws = self.workers();
        ws.iter()
            .find(|w| w.is_processor_thread())
            .and_then(|w| w.current_job())
            .or_else(|| ws.iter().find_map(|w| w.current_job()))
    }

    fn set_exception_handler(&self, handler: Option<JobExceptionHandler>) {
        *self.handler.lock().unwrap() = handler;
    }

    fn exception_handler(&self) -> Option<JobExceptionHandler> {
        self.handler.lock().unwrap().clone()
    }

    fn is_thread_affine(&self) -> bool {
        false
    }

    fn thread_id(&self) -> Option<ThreadId> {
        None
    }

    fn is_processor_thread(&self) -> bool {
        self.workers().iter().any(|w| w.is_processor_thread())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::FnJob;

    #[test]
    fn job_routed_to_replaced_worker_reaches_its_successor() -> Result<()> {
        let p = MultiThreadDelegatingJobProcessor::new("reroute", 1);
        p.start()?;
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let job: JobRef = FnJob::new("late", move || {
            r.fetch_add(1, Ordering::AcqRel);
            Ok(())
        });

        // воркер выбран до того, как watchdog его заменил
        let stale = p.worker_for(&job);
        p.replace_worker(0)?;
        assert!(stale.is_finished());
        assert!(!Arc::ptr_eq(&stale, &p.worker_for(&job)));

        assert!(p.enqueue_on(stale, job, Schedule::Now(Priority::Normal), p.owner()));
        assert!(p.wait_for_jobs(Duration::from_secs(10)));
        assert_eq!(ran.load(Ordering::Acquire), 1);

        p.finish();
        Ok(())
    }
}
