//! jobs/delegating — логический процессор поверх чужого (общего) процессора.
//!
//! Все операции пробрасываются в delegate, но задачи ставятся с owner = этот процессор,
//! поэтому job.processor() указывает на обёртку, а не на общий поток. Жизненный цикл
//! собственный: finish() ставит в delegate барьерную LatchJob, ждёт её и только потом
//! помечает обёртку finished — оставшиеся (timed) задачи этой обёртки становятся инертными,
//! а delegate продолжает обслуживать остальных владельцев.

use anyhow::Result;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use super::latch::LatchJob;
use super::processor::{JobExceptionHandler, JobProcessor, Schedule};
use super::{FnJob, JobRef, Priority};

/// Upper bound for the finish barrier; a wedged delegate must not hang shutdown forever.
const FINISH_BARRIER_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DelegatingJobProcessor {
    name: String,
    me: Weak<DelegatingJobProcessor>,
    delegate: Arc<dyn JobProcessor>,
    started: AtomicBool,
    finishing: AtomicBool,
    finished: AtomicBool,
    handler: Mutex<Option<JobExceptionHandler>>,
}

impl DelegatingJobProcessor {
    pub fn new(name: &str, delegate: Arc<dyn JobProcessor>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name: name.to_string(),
            me: me.clone(),
            delegate,
            started: AtomicBool::new(false),
            finishing: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            handler: Mutex::new(None),
        })
    }

    pub fn delegate(&self) -> &Arc<dyn JobProcessor> {
        &self.delegate
    }

    fn owner(&self) -> Weak<dyn JobProcessor> {
        let w: Weak<dyn JobProcessor> = self.me.clone();
        w
    }
}

impl JobProcessor for DelegatingJobProcessor {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.finishing.store(false, Ordering::Release);
        self.finished.store(false, Ordering::Release);
        self.delegate.start()?;

        let name = self.name.clone();
        let marker = FnJob::new("delegate-start", move || {
            debug!("{}: attached to delegate thread {:?}", name, std::thread::current().id());
            Ok(())
        });
        self.delegate
            .enqueue(marker, Schedule::Now(Priority::Highest), Some(self.owner()));
        Ok(())
    }

    fn finish(&self) {
        if !self.started.load(Ordering::Acquire) || self.finishing.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.delegate.is_processor_thread() {
            let barrier = LatchJob::new();
            let queued = self.delegate.enqueue(
                barrier.clone(),
                Schedule::Now(Priority::Lowest),
                Some(self.owner()),
            );
            if queued && !barrier.latch().wait_timeout(FINISH_BARRIER_TIMEOUT) {
                warn!("{}: finish barrier timed out, remaining jobs become inert", self.name);
            }
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
        self.delegate
            .enqueue(job, when, Some(owner.unwrap_or_else(|| self.owner())))
    }

    fn suspend(&self) {
        self.delegate.suspend();
    }

    fn resume(&self) {
        self.delegate.resume();
    }

    fn is_suspended(&self) -> bool {
        self.delegate.is_suspended()
    }

    fn pending_jobs(&self) -> usize {
        self.delegate.pending_jobs()
    }

    fn pending_timed_jobs(&self) -> usize {
        self.delegate.pending_timed_jobs()
    }

    fn current_job(&self) -> Option<JobRef> {
        self.delegate.current_job()
    }

    fn set_exception_handler(&self, handler: Option<JobExceptionHandler>) {
        *self.handler.lock().unwrap() = handler;
    }

    fn exception_handler(&self) -> Option<JobExceptionHandler> {
        self.handler.lock().unwrap().clone()
    }

    fn is_thread_affine(&self) -> bool {
        self.delegate.is_thread_affine()
    }

    fn thread_id(&self) -> Option<ThreadId> {
        self.delegate.thread_id()
    }

    fn is_processor_thread(&self) -> bool {
        self.delegate.is_processor_thread()
    }
}
