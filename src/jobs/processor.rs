//! jobs/processor — контракт процессора задач.
//!
//! Машина состояний: stopped → started → (running ⇄ suspended) → finishing → stopped (reusable).
//!
//! Единственный обязательный метод постановки — `enqueue(job, Schedule, owner)`;
//! queue/queue_at/queue_in/... — тонкие обёртки. `owner` позволяет делегирующим
//! процессорам ставить задачи в чужой поток, оставаясь их "владельцем" (job.processor()).

use anyhow::Result;
use log::error;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use super::latch::LatchJob;
use super::{Job, JobRef, Priority};
use crate::util::now_millis;

/// When a job becomes ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Ready immediately, ordered by priority then FIFO.
    Now(Priority),
    /// Ready at the given Unix millis; then dispatched with the given priority.
    At(u64, Priority),
    /// After every currently pending timed job (drain barrier).
    LowestTimed,
}

/// Receives failures of executed jobs (errors and caught panics).
pub type JobExceptionHandler =
    Arc<dyn Fn(&dyn JobProcessor, &dyn Job, &anyhow::Error) + Send + Sync + 'static>;

/// Default handler: log and continue.
pub fn log_exception_handler() -> JobExceptionHandler {
    Arc::new(|p: &dyn JobProcessor, job: &dyn Job, e: &anyhow::Error| {
        error!("{}: job {} failed: {:#}", p.name(), job.name(), e);
    })
}

pub trait JobProcessor: Send + Sync + 'static {
    fn name(&self) -> String;

    /// Idempotent. Spawns (or reuses) the executing thread(s).
    fn start(&self) -> Result<()>;

    /// Idempotent. Drains ready work, drops timed work that is not due, waits for the
    /// in-flight job and stops the thread(s). The processor can be started again.
    fn finish(&self);

    fn is_started(&self) -> bool;

    fn is_finished(&self) -> bool;

    /// Queue `job`. Returns true iff a new queue entry was created (false if the job
    /// merged with an equal pending job or the processor is finished).
    fn enqueue(&self, job: JobRef, when: Schedule, owner: Option<Weak<dyn JobProcessor>>) -> bool;

    fn queue(&self, job: JobRef, priority: Priority) -> bool {
        self.enqueue(job, Schedule::Now(priority), None)
    }

    fn queue_at(&self, job: JobRef, millis: u64) -> bool {
        self.enqueue(job, Schedule::At(millis, Priority::Normal), None)
    }

    fn queue_at_priority(&self, job: JobRef, millis: u64, priority: Priority) -> bool {
        self.enqueue(job, Schedule::At(millis, priority), None)
    }

    fn queue_in(&self, job: JobRef, delay_millis: u64) -> bool {
        self.queue_at(job, now_millis().saturating_add(delay_millis))
    }

    fn queue_lowest(&self, job: JobRef) -> bool {
        self.queue(job, Priority::Lowest)
    }

    /// Blocks until everything queued for immediate execution so far has run.
    /// Returns false on timeout, on a finished processor or when called from the
    /// processor's own thread (that would deadlock).
    fn wait_for_jobs(&self, timeout: Duration) -> bool {
        if self.is_processor_thread() {
            return false;
        }
        let barrier = LatchJob::new();
        if !self.queue(barrier.clone(), Priority::Lowest) {
            return false;
        }
        barrier.latch().wait_timeout(timeout)
    }

    /// Same barrier for the timed queue: waits until every currently pending timed
    /// job has fired.
    fn wait_for_timed_jobs(&self, timeout: Duration) -> bool {
        if self.is_processor_thread() {
            return false;
        }
        let barrier = LatchJob::new();
        if !self.enqueue(barrier.clone(), Schedule::LowestTimed, None) {
            return false;
        }
        barrier.latch().wait_timeout(timeout)
    }

    /// Queue `job` at `priority` and wait for it to run.
    fn wait_for_latch_job(&self, job: Arc<LatchJob>, priority: Priority, timeout: Duration) -> bool {
        if self.is_processor_thread() {
            return false;
        }
        if !self.queue(job.clone(), priority) {
            return false;
        }
        job.latch().wait_timeout(timeout)
    }

    /// Parks the processor between jobs; never interrupts a running job.
    fn suspend(&self);

    fn resume(&self);

    fn is_suspended(&self) -> bool;

    fn pending_jobs(&self) -> usize;

    fn pending_timed_jobs(&self) -> usize;

    fn current_job(&self) -> Option<JobRef>;

    fn set_exception_handler(&self, handler: Option<JobExceptionHandler>);

    fn exception_handler(&self) -> Option<JobExceptionHandler>;

    /// True if every job of this processor runs on one and the same thread.
    fn is_thread_affine(&self) -> bool;

    /// The executing thread of a thread-affine processor (None until started).
    fn thread_id(&self) -> Option<ThreadId>;

    fn is_processor_thread(&self) -> bool {
        self.thread_id() == Some(std::thread::current().id())
    }
}

/// Same object? (Compares data addresses, ignores vtables.)
#[inline]
pub fn same_processor(a: &Arc<dyn JobProcessor>, b: &Arc<dyn JobProcessor>) -> bool {
    Arc::as_ptr(a) as *const u8 == Arc::as_ptr(b) as *const u8
}
