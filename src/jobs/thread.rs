//! jobs/thread — ThreadJobProcessor: процессор на одном выделенном потоке ОС.
//!
//! Все execute() выполняются на одном потоке (thread affinity) — GC на этом строит
//! сериализацию структурных изменений файлов лога.
//!
//! Поток:
//! - ждёт, пока появится готовая задача или наступит дедлайн timed-задачи;
//! - созревшие timed-задачи переносит в приоритетную очередь (со своим приоритетом);
//! - берёт (priority, FIFO)-первую, выполняет под catch_unwind, ошибку отдаёт handler'у;
//! - после finish() дочищает готовые задачи, отбрасывает несозревшие timed и выходит.

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use super::latch::SuspendJob;
use super::processor::{log_exception_handler, JobExceptionHandler, JobProcessor, Schedule};
use super::queue::{PriorityJobQueue, TimedJobQueue};
use super::{run_job, JobRef, Priority};
use crate::metrics;
use crate::util::now_millis;

struct Inner {
    ready: PriorityJobQueue,
    timed: TimedJobQueue,
    current: Option<JobRef>,
    current_since: u64,
    started: bool,
    finished: bool,
    generation: u64,
}

pub struct ThreadJobProcessor {
    name: String,
    me: Weak<ThreadJobProcessor>,
    inner: Mutex<Inner>,
    cv: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
    suspend_job: Mutex<Option<Arc<SuspendJob>>>,
    handler: Mutex<Option<JobExceptionHandler>>,
    abandoned: AtomicBool,
}

impl ThreadJobProcessor {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name: name.to_string(),
            me: me.clone(),
            inner: Mutex::new(Inner {
                ready: PriorityJobQueue::new(),
                timed: TimedJobQueue::new(),
                current: None,
                current_since: 0,
                started: false,
                finished: false,
                generation: 0,
            }),
            cv: Condvar::new(),
            handle: Mutex::new(None),
            thread_id: Mutex::new(None),
            suspend_job: Mutex::new(None),
            handler: Mutex::new(None),
            abandoned: AtomicBool::new(false),
        })
    }

    /// Start time (Unix millis) of the job currently executing, if any.
    pub fn current_job_started_at(&self) -> Option<u64> {
        let g = self.inner.lock().unwrap();
        g.current.as_ref().map(|_| g.current_since)
    }

    /// Detach from the executing thread: reject new work and hand back everything
    /// still queued. The thread exits once its in-flight job returns; nobody joins it.
    pub(crate) fn abandon(&self) -> (Vec<(JobRef, Priority)>, Vec<(JobRef, u64, Priority)>) {
        self.abandoned.store(true, Ordering::Release);
        let drained = {
            let mut g = self.inner.lock().unwrap();
            g.finished = true;
            (g.ready.drain(), g.timed.drain())
        };
        self.cv.notify_all();
        self.release_suspend();
        // поток не джойним: он может висеть в задаче бесконечно
        drop(self.handle.lock().unwrap().take());
        drained
    }

    fn release_suspend(&self) {
        if let Some(job) = self.suspend_job.lock().unwrap().take() {
            job.resume.release();
        }
    }

    fn next_job(&self, generation: u64) -> Option<JobRef> {
        let mut g = self.inner.lock().unwrap();
        loop {
            if self.abandoned.load(Ordering::Acquire) || g.generation != generation {
                return None;
            }
            let now = now_millis();
            while let Some((job, prio)) = g.timed.pop_due(now) {
                g.ready.push(job, prio);
            }
            if let Some((job, _)) = g.ready.pop() {
                g.current = Some(job.clone());
                g.current_since = now;
                return Some(job);
            }
            if g.finished {
                let dropped = g.timed.drain();
                if !dropped.is_empty() {
                    debug!("{}: dropping {} timed job(s) on finish", self.name, dropped.len());
                    metrics::record_jobs_cancelled(dropped.len());
                }
                return None;
            }
            g = match g.timed.next_deadline() {
                Some(d) => {
                    let wait = Duration::from_millis(d.saturating_sub(now).max(1));
                    self.cv.wait_timeout(g, wait).unwrap().0
                }
                None => self.cv.wait(g).unwrap(),
            };
        }
    }

    fn execute(&self, job: &JobRef) {
        let owner = job.state().processor();
        // Задача чужого (делегирующего) владельца, который уже finished, — инертна.
        if let Some(o) = owner.as_ref() {
            let foreign = Arc::as_ptr(o) as *const u8 != self as *const Self as *const u8;
            if foreign && o.is_finished() {
                metrics::record_jobs_cancelled(1);
                return;
            }
        }

        let res = match catch_unwind(AssertUnwindSafe(|| run_job(job))) {
            Ok(r) => r,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic>".to_string());
                Err(anyhow!("job {} panicked: {}", job.name(), msg))
            }
        };

        match res {
            Ok(()) => metrics::record_job_executed(),
            Err(e) => {
                metrics::record_job_failed();
                let handler = owner
                    .as_ref()
                    .and_then(|o| o.exception_handler())
                    .or_else(|| self.exception_handler())
                    .unwrap_or_else(log_exception_handler);
                match owner.as_ref() {
                    Some(o) => handler(o.as_ref(), job.as_ref(), &e),
                    None => handler(self, job.as_ref(), &e),
                }
            }
        }
    }

    fn run(self: Arc<Self>, generation: u64) {
        debug!("{}: thread started", self.name);
        while let Some(job) = self.next_job(generation) {
            self.execute(&job);
            {
                let mut g = self.inner.lock().unwrap();
                g.current = None;
            }
            self.cv.notify_all();
        }
        debug!("{}: thread stopped", self.name);
    }
}

impl JobProcessor for ThreadJobProcessor {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn start(&self) -> Result<()> {
        let mut h = self.handle.lock().unwrap();
        let generation = {
            let mut g = self.inner.lock().unwrap();
            if g.started && !g.finished {
                return Ok(());
            }
            g.started = true;
            g.finished = false;
            g.generation = g.generation.wrapping_add(1);
            g.generation
        };
        self.cv.notify_all();
        // Поток от предыдущего finish(), вызванного изнутри, мог ещё не выйти.
        if let Some(old) = h.take() {
            if old.thread().id() != std::thread::current().id() {
                let _ = old.join();
            }
        }
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return Err(anyhow!("{}: processor is being dropped", self.name)),
        };
        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || me.run(generation))
            .with_context(|| format!("spawn processor thread {}", self.name))?;
        *self.thread_id.lock().unwrap() = Some(handle.thread().id());
        *h = Some(handle);
        Ok(())
    }

    fn finish(&self) {
        {
            let mut g = self.inner.lock().unwrap();
            if g.finished {
                return;
            }
            g.finished = true;
        }
        self.cv.notify_all();
        self.release_suspend();

        if self.is_processor_thread() {
            // поток выйдет сам после текущей задачи
            return;
        }
        let handle = self.handle.lock().unwrap().take();
        if let Some(h) = handle {
            if h.join().is_err() {
                warn!("{}: processor thread panicked", self.name);
            }
        }
        let mut g = self.inner.lock().unwrap();
        g.started = false;
        drop(g);
        *self.thread_id.lock().unwrap() = None;
    }

    fn is_started(&self) -> bool {
        let g = self.inner.lock().unwrap();
        g.started && !g.finished
    }

    fn is_finished(&self) -> bool {
        self.inner.lock().unwrap().finished
    }

    fn enqueue(&self, job: JobRef, when: Schedule, owner: Option<Weak<dyn JobProcessor>>) -> bool {
        let mut g = self.inner.lock().unwrap();
        if g.finished {
            return false;
        }
        let pushed = match when {
            Schedule::Now(p) => g.ready.push(job.clone(), p),
            Schedule::At(at, p) => g.timed.push(job.clone(), at, p),
            Schedule::LowestTimed => g.timed.push_lowest(job.clone(), now_millis()),
        };
        if !pushed.is_new() {
            return false;
        }
        let owner = owner.unwrap_or_else(|| {
            let w: Weak<dyn JobProcessor> = self.me.clone();
            w
        });
        job.state().set_processor(Some(owner));
        drop(g);
        self.cv.notify_all();
        true
    }

    fn suspend(&self) {
        let job = {
            let mut s = self.suspend_job.lock().unwrap();
            if s.is_some() {
                return;
            }
            let job = SuspendJob::new();
            *s = Some(job.clone());
            job
        };
        if !self.queue(job.clone(), Priority::Highest) {
            self.suspend_job.lock().unwrap().take();
            return;
        }
        if self.is_processor_thread() || !self.is_started() {
            return;
        }
        // Ждём, пока поток дойдёт до SuspendJob (текущая задача не прерывается).
        while !job.entered.wait_timeout(Duration::from_millis(50)) {
            if self.is_finished() || job.resume.is_released() {
                break;
            }
        }
    }

    fn resume(&self) {
        let job = self.suspend_job.lock().unwrap().take();
        if let Some(job) = job {
            job.resume.release();
            let j: JobRef = job;
            self.inner.lock().unwrap().ready.remove(&j);
        }
    }

    fn is_suspended(&self) -> bool {
        self.suspend_job.lock().unwrap().is_some()
    }

    fn pending_jobs(&self) -> usize {
        self.inner.lock().unwrap().ready.len()
    }

    fn pending_timed_jobs(&self) -> usize {
        self.inner.lock().unwrap().timed.len()
    }

    fn current_job(&self) -> Option<JobRef> {
        self.inner.lock().unwrap().current.clone()
    }

    fn set_exception_handler(&self, handler: Option<JobExceptionHandler>) {
        *self.handler.lock().unwrap() = handler;
    }

    fn exception_handler(&self) -> Option<JobExceptionHandler> {
        self.handler.lock().unwrap().clone()
    }

    fn is_thread_affine(&self) -> bool {
        true
    }

    fn thread_id(&self) -> Option<ThreadId> {
        *self.thread_id.lock().unwrap()
    }
}
